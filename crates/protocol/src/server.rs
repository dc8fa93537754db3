//! Core → UI messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from the streaming core to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Rendering
    /// One coalesced update for the assistant message being streamed
    Flush {
        conversation_id: String,
        message_id: String,
        patch: MessagePatch,
    },

    // Approvals
    ApprovalSurfaced {
        approval: PendingApproval,
    },
    ApprovalCleared {
        conversation_id: String,
        request_key: String,
    },

    // Side channels
    ImageProgress {
        progress: ImageProgress,
    },
    /// Transient, non-fatal notice (e.g. a stale approval click)
    Notice {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        message: String,
    },

    // Lifecycle
    SessionFinished {
        conversation_id: String,
        message_id: String,
        status: SessionStatus,
    },
}

impl ServerMessage {
    /// Conversation this message belongs to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Flush {
                conversation_id, ..
            }
            | ServerMessage::ApprovalCleared {
                conversation_id, ..
            }
            | ServerMessage::SessionFinished {
                conversation_id, ..
            } => Some(conversation_id),
            ServerMessage::ApprovalSurfaced { approval } => Some(&approval.conversation_id),
            ServerMessage::ImageProgress { progress } => Some(&progress.conversation_id),
            ServerMessage::Notice {
                conversation_id, ..
            } => conversation_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ServerMessage;
    use crate::types::*;

    #[test]
    fn roundtrip_flush() {
        let msg = ServerMessage::Flush {
            conversation_id: "c1".to_string(),
            message_id: "m1".to_string(),
            patch: MessagePatch::append("Hello").with_status(SessionStatus::Streaming),
        };

        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"type\":\"flush\""));
        let reparsed: ServerMessage = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(reparsed, msg);
    }

    #[test]
    fn conversation_id_is_exposed_for_routing() {
        let msg = ServerMessage::Notice {
            conversation_id: None,
            message: "approval already handled".to_string(),
        };
        assert_eq!(msg.conversation_id(), None);

        let msg = ServerMessage::SessionFinished {
            conversation_id: "c2".to_string(),
            message_id: "m2".to_string(),
            status: SessionStatus::Aborted,
        };
        assert_eq!(msg.conversation_id(), Some("c2"));
    }
}
