//! Backend event envelopes
//!
//! Every event on the backend stream is a flat JSON object tagged with
//! `kind` and scoped by `conversationId`:
//!
//! ```json
//! { "conversationId": "c1", "kind": "token", "chunk": "Hel" }
//! ```
//!
//! Parsing validates the whole envelope up front; a payload that does not
//! match its kind is an [`EnvelopeError`] and never reaches a session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::{RawToolCall, ToolCall, ToolCallError, ToolSchemaRegistry};
use crate::types::{GeneratedImage, ImageProgressStatus, ReferencedDocument, RiskLevel};

const KINDS: [&str; 7] = [
    "token",
    "node",
    "tool_approval_request",
    "tool_approval_result",
    "image_progress",
    "error",
    "done",
];

#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("envelope is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("envelope has no conversationId")]
    MissingConversationId,

    #[error("envelope has no kind")]
    MissingKind,

    #[error("unknown envelope kind `{0}`")]
    UnknownKind(String),

    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("invalid tool call: {0}")]
    InvalidToolCall(#[from] ToolCallError),
}

/// Discriminant of an envelope, for logging and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Token,
    Node,
    ToolApprovalRequest,
    ToolApprovalResult,
    ImageProgress,
    Error,
    Done,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Token => "token",
            EventKind::Node => "node",
            EventKind::ToolApprovalRequest => "tool_approval_request",
            EventKind::ToolApprovalResult => "tool_approval_result",
            EventKind::ImageProgress => "image_progress",
            EventKind::Error => "error",
            EventKind::Done => "done",
        }
    }
}

/// Execution-graph progress reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProgress {
    pub node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_documents: Vec<ReferencedDocument>,
}

/// Typed envelope payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EnvelopeEvent {
    Token {
        chunk: String,
    },
    Node(NodeProgress),
    ToolApprovalRequest {
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        tool_calls: Vec<ToolCall>,
        #[serde(skip_serializing_if = "Option::is_none")]
        risk_level: Option<RiskLevel>,
    },
    ToolApprovalResult {
        approved: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ImageProgress {
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        status: ImageProgressStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Done,
}

impl EnvelopeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EnvelopeEvent::Token { .. } => EventKind::Token,
            EnvelopeEvent::Node(_) => EventKind::Node,
            EnvelopeEvent::ToolApprovalRequest { .. } => EventKind::ToolApprovalRequest,
            EnvelopeEvent::ToolApprovalResult { .. } => EventKind::ToolApprovalResult,
            EnvelopeEvent::ImageProgress { .. } => EventKind::ImageProgress,
            EnvelopeEvent::Error { .. } => EventKind::Error,
            EnvelopeEvent::Done => EventKind::Done,
        }
    }
}

/// Wire shape of the payload before tool-call validation
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum WireEvent {
    Token {
        chunk: String,
    },
    Node(NodeProgress),
    ToolApprovalRequest {
        #[serde(default)]
        message_id: Option<String>,
        tool_calls: Vec<RawToolCall>,
        #[serde(default)]
        risk_level: Option<RiskLevel>,
    },
    ToolApprovalResult {
        approved: bool,
        #[serde(default)]
        message: Option<String>,
    },
    ImageProgress {
        #[serde(default)]
        message_id: Option<String>,
        status: ImageProgressStatus,
        #[serde(default)]
        progress: Option<f32>,
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
    Done,
}

/// One unit of the backend event stream
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub conversation_id: String,
    pub event: EnvelopeEvent,
}

#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "conversationId")]
    conversation_id: &'a str,
    #[serde(flatten)]
    event: &'a EnvelopeEvent,
}

impl EventEnvelope {
    pub fn new(conversation_id: impl Into<String>, event: EnvelopeEvent) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Parse one NDJSON line.
    pub fn parse_str(line: &str, tools: &ToolSchemaRegistry) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        Self::parse(value, tools)
    }

    /// Validate a decoded JSON value into a typed envelope.
    pub fn parse(value: Value, tools: &ToolSchemaRegistry) -> Result<Self, EnvelopeError> {
        let object = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let conversation_id = object
            .get("conversationId")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or(EnvelopeError::MissingConversationId)?
            .to_string();

        let kind = object
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingKind)?
            .to_string();
        if !KINDS.contains(&kind.as_str()) {
            return Err(EnvelopeError::UnknownKind(kind));
        }

        let wire: WireEvent =
            serde_json::from_value(value).map_err(|e| EnvelopeError::InvalidPayload {
                kind: kind.clone(),
                reason: e.to_string(),
            })?;

        let invalid = |reason: &str| EnvelopeError::InvalidPayload {
            kind: kind.clone(),
            reason: reason.to_string(),
        };

        let event = match wire {
            WireEvent::Token { chunk } => EnvelopeEvent::Token { chunk },
            WireEvent::Node(node) => {
                if node.node.trim().is_empty() {
                    return Err(invalid("node name is empty"));
                }
                EnvelopeEvent::Node(node)
            }
            WireEvent::ToolApprovalRequest {
                message_id,
                tool_calls,
                risk_level,
            } => {
                if tool_calls.is_empty() {
                    return Err(invalid("toolCalls is empty"));
                }
                let tool_calls = tool_calls
                    .into_iter()
                    .map(|raw| tools.validate(raw))
                    .collect::<Result<Vec<_>, _>>()?;
                EnvelopeEvent::ToolApprovalRequest {
                    message_id: message_id.filter(|id| !id.trim().is_empty()),
                    tool_calls,
                    risk_level,
                }
            }
            WireEvent::ToolApprovalResult { approved, message } => {
                EnvelopeEvent::ToolApprovalResult { approved, message }
            }
            WireEvent::ImageProgress {
                message_id,
                status,
                progress,
                message,
            } => {
                if progress.is_some_and(|p| !(0.0..=1.0).contains(&p)) {
                    return Err(invalid("progress must be between 0 and 1"));
                }
                EnvelopeEvent::ImageProgress {
                    message_id,
                    status,
                    progress,
                    message,
                }
            }
            WireEvent::Error { message, code } => EnvelopeEvent::Error { message, code },
            WireEvent::Done => EnvelopeEvent::Done,
        };

        Ok(Self {
            conversation_id,
            event,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(WireOut {
            conversation_id: &self.conversation_id,
            event: &self.event,
        })
        .unwrap_or(Value::Null)
    }

    // -- Constructors used by connectors and tests --

    pub fn token(conversation_id: impl Into<String>, chunk: impl Into<String>) -> Self {
        Self::new(
            conversation_id,
            EnvelopeEvent::Token {
                chunk: chunk.into(),
            },
        )
    }

    pub fn node(conversation_id: impl Into<String>, node: impl Into<String>) -> Self {
        Self::new(
            conversation_id,
            EnvelopeEvent::Node(NodeProgress {
                node: node.into(),
                detail: None,
                images: Vec::new(),
                referenced_documents: Vec::new(),
            }),
        )
    }

    pub fn approval_request(
        conversation_id: impl Into<String>,
        message_id: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self::new(
            conversation_id,
            EnvelopeEvent::ToolApprovalRequest {
                message_id,
                tool_calls,
                risk_level: None,
            },
        )
    }

    pub fn approval_result(conversation_id: impl Into<String>, approved: bool) -> Self {
        Self::new(
            conversation_id,
            EnvelopeEvent::ToolApprovalResult {
                approved,
                message: None,
            },
        )
    }

    pub fn error(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            conversation_id,
            EnvelopeEvent::Error {
                message: message.into(),
                code: None,
            },
        )
    }

    pub fn done(conversation_id: impl Into<String>) -> Self {
        Self::new(conversation_id, EnvelopeEvent::Done)
    }
}
