//! Tool-call validation
//!
//! Tool calls arrive inside `tool_approval_request` envelopes. Arguments are
//! checked against a per-tool schema at the boundary; anything that does not
//! validate is rejected instead of being parsed best-effort.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::RiskLevel;

/// A validated tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// A tool invocation exactly as the backend sent it
#[derive(Debug, Clone, Deserialize)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl ArgKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Number => value.is_number(),
            ArgKind::Bool => value.is_boolean(),
            ArgKind::Object => value.is_object(),
            ArgKind::Array => value.is_array(),
        }
    }
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgKind::String => "string",
            ArgKind::Number => "number",
            ArgKind::Bool => "bool",
            ArgKind::Object => "object",
            ArgKind::Array => "array",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ToolCallError {
    #[error("tool call `{id}` has an empty name")]
    EmptyName { id: String },

    #[error("arguments for `{tool}` are not valid JSON")]
    ArgumentsNotJson { tool: String },

    #[error("arguments for `{tool}` must be a JSON object")]
    ArgumentsNotObject { tool: String },

    #[error("`{tool}` is missing required argument `{field}`")]
    MissingField { tool: String, field: String },

    #[error("`{tool}` argument `{field}` must be a {expected}")]
    WrongType {
        tool: String,
        field: String,
        expected: ArgKind,
    },

    #[error("`{tool}` does not accept argument `{field}`")]
    UnexpectedField { tool: String, field: String },
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    kind: ArgKind,
    required: bool,
}

/// Argument schema for one tool name
#[derive(Debug, Clone)]
pub struct ToolSchema {
    name: String,
    risk: RiskLevel,
    fields: Vec<FieldSpec>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            name: name.into(),
            risk,
            fields: Vec::new(),
        }
    }

    pub fn required(mut self, field: impl Into<String>, kind: ArgKind) -> Self {
        self.fields.push(FieldSpec {
            name: field.into(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, field: impl Into<String>, kind: ArgKind) -> Self {
        self.fields.push(FieldSpec {
            name: field.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn risk(&self) -> RiskLevel {
        self.risk
    }

    fn check(&self, arguments: &Map<String, Value>) -> Result<(), ToolCallError> {
        for spec in &self.fields {
            match arguments.get(&spec.name) {
                None if spec.required => {
                    return Err(ToolCallError::MissingField {
                        tool: self.name.clone(),
                        field: spec.name.clone(),
                    })
                }
                None => {}
                Some(value) if !spec.kind.matches(value) => {
                    return Err(ToolCallError::WrongType {
                        tool: self.name.clone(),
                        field: spec.name.clone(),
                        expected: spec.kind,
                    })
                }
                Some(_) => {}
            }
        }

        if let Some(extra) = arguments
            .keys()
            .find(|key| !self.fields.iter().any(|spec| &spec.name == *key))
        {
            return Err(ToolCallError::UnexpectedField {
                tool: self.name.clone(),
                field: extra.clone(),
            });
        }

        Ok(())
    }
}

/// Known tool schemas, keyed by tool name
#[derive(Debug, Clone)]
pub struct ToolSchemaRegistry {
    schemas: HashMap<String, ToolSchema>,
}

impl Default for ToolSchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ToolSchemaRegistry {
    pub fn empty() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            ToolSchema::new("generate_image", RiskLevel::Low)
                .required("prompt", ArgKind::String)
                .optional("size", ArgKind::String)
                .optional("count", ArgKind::Number),
        );
        registry.register(
            ToolSchema::new("web_search", RiskLevel::Low)
                .required("query", ArgKind::String)
                .optional("max_results", ArgKind::Number),
        );
        registry.register(
            ToolSchema::new("read_file", RiskLevel::Low).required("path", ArgKind::String),
        );
        registry.register(
            ToolSchema::new("write_file", RiskLevel::High)
                .required("path", ArgKind::String)
                .required("content", ArgKind::String),
        );
        registry.register(
            ToolSchema::new("run_command", RiskLevel::High)
                .required("command", ArgKind::String)
                .optional("cwd", ArgKind::String)
                .optional("args", ArgKind::Array),
        );
        registry
    }

    pub fn register(&mut self, schema: ToolSchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.schemas.get(name)
    }

    /// Validate a raw call. Arguments given as a JSON-encoded string are decoded
    /// once; the result must be an object. Unknown tools only need object
    /// arguments, known tools must match their schema exactly.
    pub fn validate(&self, raw: RawToolCall) -> Result<ToolCall, ToolCallError> {
        if raw.name.trim().is_empty() {
            return Err(ToolCallError::EmptyName { id: raw.id });
        }

        let arguments = match raw.arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            Value::String(encoded) => match serde_json::from_str::<Value>(&encoded) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(ToolCallError::ArgumentsNotObject { tool: raw.name }),
                Err(_) => return Err(ToolCallError::ArgumentsNotJson { tool: raw.name }),
            },
            _ => return Err(ToolCallError::ArgumentsNotObject { tool: raw.name }),
        };

        if let Some(schema) = self.schemas.get(&raw.name) {
            schema.check(&arguments)?;
        }

        Ok(ToolCall {
            id: raw.id,
            name: raw.name,
            arguments,
        })
    }

    /// Highest risk across a batch of calls. Unknown tools count as medium.
    pub fn risk_for(&self, calls: &[ToolCall]) -> RiskLevel {
        calls
            .iter()
            .map(|call| {
                self.schemas
                    .get(&call.name)
                    .map(ToolSchema::risk)
                    .unwrap_or(RiskLevel::Medium)
            })
            .max()
            .unwrap_or(RiskLevel::Low)
    }
}
