//! Parley Protocol
//!
//! Shared types for the streaming core: backend event envelopes, tool-call
//! schemas, message records, and the messages exchanged with the UI.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod envelope;
pub mod server;
pub mod tools;
pub mod types;

pub use client::ClientMessage;
pub use envelope::{EnvelopeError, EnvelopeEvent, EventEnvelope, EventKind, NodeProgress};
pub use server::ServerMessage;
pub use tools::{ArgKind, RawToolCall, ToolCall, ToolCallError, ToolSchema, ToolSchemaRegistry};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
