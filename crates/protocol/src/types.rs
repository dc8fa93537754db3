//! Core types shared across the protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::ToolCall;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Lifecycle of one assistant turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Streaming,
    AwaitingApproval,
    Finalizing,
    Done,
    Aborted,
    Errored,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Done | SessionStatus::Aborted | SessionStatus::Errored
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Streaming => "streaming",
            SessionStatus::AwaitingApproval => "awaiting_approval",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Done => "done",
            SessionStatus::Aborted => "aborted",
            SessionStatus::Errored => "errored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "streaming" => Some(SessionStatus::Streaming),
            "awaiting_approval" => Some(SessionStatus::AwaitingApproval),
            "finalizing" => Some(SessionStatus::Finalizing),
            "done" => Some(SessionStatus::Done),
            "aborted" => Some(SessionStatus::Aborted),
            "errored" => Some(SessionStatus::Errored),
            _ => None,
        }
    }
}

/// An image produced by a tool call (e.g. image generation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// A document the assistant cited while answering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferencedDocument {
    pub title: String,
    pub source: String,
}

/// A file attached to a user turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A history entry handed to the backend when a turn starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// The record written once per finalized message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_documents: Vec<ReferencedDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
}

impl MessageRecord {
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Tool results materialized during a turn, merged in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialMessage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_documents: Vec<ReferencedDocument>,
}

impl PartialMessage {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.referenced_documents.is_empty()
    }

    pub fn extend(&mut self, images: &[GeneratedImage], documents: &[ReferencedDocument]) {
        self.images.extend_from_slice(images);
        self.referenced_documents.extend_from_slice(documents);
    }
}

/// How a patch changes the visible content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "text", rename_all = "snake_case")]
pub enum ContentPatch {
    Append(String),
    Replace(String),
}

impl ContentPatch {
    /// Fold a later content change into this one.
    pub fn merge(self, later: ContentPatch) -> ContentPatch {
        match (self, later) {
            (_, ContentPatch::Replace(text)) => ContentPatch::Replace(text),
            (ContentPatch::Append(mut head), ContentPatch::Append(tail)) => {
                head.push_str(&tail);
                ContentPatch::Append(head)
            }
            (ContentPatch::Replace(mut head), ContentPatch::Append(tail)) => {
                head.push_str(&tail);
                ContentPatch::Replace(head)
            }
        }
    }
}

/// Delta applied to the rendered assistant message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentPatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<GeneratedImage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referenced_documents: Vec<ReferencedDocument>,
}

impl MessagePatch {
    pub fn append(text: impl Into<String>) -> Self {
        Self {
            content: Some(ContentPatch::Append(text.into())),
            ..Default::default()
        }
    }

    pub fn replace(text: impl Into<String>) -> Self {
        Self {
            content: Some(ContentPatch::Replace(text.into())),
            ..Default::default()
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.status.is_none()
            && self.images.is_empty()
            && self.referenced_documents.is_empty()
    }

    /// Union with a later patch: content concatenates (or a later replace wins),
    /// scalar fields are last-value-wins, list fields append.
    pub fn merge(&mut self, later: MessagePatch) {
        self.content = match (self.content.take(), later.content) {
            (None, next) => next,
            (current, None) => current,
            (Some(current), Some(next)) => Some(current.merge(next)),
        };
        if later.status.is_some() {
            self.status = later.status;
        }
        self.images.extend(later.images);
        self.referenced_documents.extend(later.referenced_documents);
    }
}

/// Severity assigned to an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One outstanding tool-approval request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub request_key: String,
    pub conversation_id: String,
    pub message_id: String,
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
    pub risk_level: RiskLevel,
}

impl PendingApproval {
    pub fn new(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        tool_calls: Vec<ToolCall>,
        risk_level: RiskLevel,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let message_id = message_id.into();
        Self {
            request_key: request_key(&conversation_id, &message_id),
            conversation_id,
            message_id,
            tool_calls,
            timestamp: Utc::now(),
            risk_level,
        }
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tool_calls.iter().map(|call| call.name.as_str()).collect()
    }
}

/// Key that identifies an approval request across submit/resolve.
pub fn request_key(conversation_id: &str, message_id: &str) -> String {
    format!("{conversation_id}:{message_id}")
}

/// Sub-status of an image generation in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageProgressStatus {
    Started,
    Generating,
    Completed,
    Error,
}

impl ImageProgressStatus {
    pub fn is_final(self) -> bool {
        matches!(self, ImageProgressStatus::Completed | ImageProgressStatus::Error)
    }
}

/// Side-channel progress record for an image generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProgress {
    pub conversation_id: String,
    pub message_id: String,
    pub status: ImageProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_merge_concatenates_content_and_keeps_last_status() {
        let mut patch = MessagePatch::append("Hel");
        patch.merge(MessagePatch::append("lo ").with_status(SessionStatus::Streaming));
        patch.merge(MessagePatch::append("world"));
        patch.merge(MessagePatch::status(SessionStatus::AwaitingApproval));

        assert_eq!(
            patch.content,
            Some(ContentPatch::Append("Hello world".to_string()))
        );
        assert_eq!(patch.status, Some(SessionStatus::AwaitingApproval));
    }

    #[test]
    fn replace_discards_earlier_appends_but_keeps_later_ones() {
        let mut patch = MessagePatch::append("partial");
        patch.merge(MessagePatch::replace("**Error:** boom"));
        patch.merge(MessagePatch::append("\n"));

        assert_eq!(
            patch.content,
            Some(ContentPatch::Replace("**Error:** boom\n".to_string()))
        );
    }

    #[test]
    fn patch_merge_appends_images_in_arrival_order() {
        let image = |url: &str| GeneratedImage {
            url: url.to_string(),
            mime_type: None,
            tool_call_id: None,
        };
        let mut patch = MessagePatch {
            images: vec![image("a.png")],
            ..Default::default()
        };
        patch.merge(MessagePatch {
            images: vec![image("b.png"), image("c.png")],
            ..Default::default()
        });

        let urls: Vec<&str> = patch.images.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["a.png", "b.png", "c.png"]);
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Done.is_terminal());
        assert!(SessionStatus::Aborted.is_terminal());
        assert!(SessionStatus::Errored.is_terminal());
        assert!(!SessionStatus::Finalizing.is_terminal());
        assert!(!SessionStatus::AwaitingApproval.is_terminal());
    }

    #[test]
    fn request_key_combines_conversation_and_message() {
        let approval = PendingApproval::new("c1", "m1", Vec::new(), RiskLevel::Low);
        assert_eq!(approval.request_key, "c1:m1");
    }
}
