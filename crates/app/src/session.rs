//! Per-turn session data

use chrono::{DateTime, Utc};
use parley_protocol::{MessageRecord, PartialMessage, Role, SessionStatus};

/// Everything one assistant turn accumulates. Owned by its actor; only
/// `transition` mutates it.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub conversation_id: String,
    pub assistant_message_id: String,
    pub status: SessionStatus,
    pub content: String,
    pub partial: PartialMessage,
    /// Approval requests seen this turn, used to key requests without a message id
    pub approval_seq: u64,
    pub finalized: bool,
    pub created_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        conversation_id: impl Into<String>,
        assistant_message_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: conversation_id.into(),
            assistant_message_id: assistant_message_id.into(),
            status: SessionStatus::Streaming,
            content: String::new(),
            partial: PartialMessage::default(),
            approval_seq: 0,
            finalized: false,
            created_at: Utc::now(),
        }
    }

    /// The record written when the turn finalizes.
    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            id: self.assistant_message_id.clone(),
            conversation_id: self.conversation_id.clone(),
            role: Role::Assistant,
            content: self.content.clone(),
            created_at: self.created_at,
            images: self.partial.images.clone(),
            referenced_documents: self.partial.referenced_documents.clone(),
            status: Some(self.status),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            assistant_message_id: self.assistant_message_id.clone(),
            status: self.status,
            content: self.content.clone(),
            image_count: self.partial.images.len(),
            document_count: self.partial.referenced_documents.len(),
            updated_at: Utc::now(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(String::new(), String::new(), String::new())
    }
}

/// Read-only view published after every flush
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub conversation_id: String,
    pub assistant_message_id: String,
    pub status: SessionStatus,
    pub content: String,
    pub image_count: usize,
    pub document_count: usize,
    pub updated_at: DateTime<Utc>,
}
