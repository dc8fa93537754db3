//! UI → Core messages

use serde::{Deserialize, Serialize};

use crate::types::Attachment;

/// Commands sent from the UI to the streaming core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartTurn {
        conversation_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_override: Option<String>,
    },
    Abort {
        conversation_id: String,
    },
    ResolveApproval {
        request_key: String,
        approved: bool,
        #[serde(default)]
        always_approve: bool,
    },
    SetAlwaysApprove {
        enabled: bool,
    },
}
