//! In-memory conversation transcripts used to build each turn's request.

use dashmap::DashMap;
use parley_protocol::ChatMessage;

#[derive(Debug, Default)]
pub struct Transcripts {
    conversations: DashMap<String, Vec<ChatMessage>>,
}

impl Transcripts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a conversation's transcript, e.g. with history loaded from disk.
    pub fn seed(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        self.conversations
            .insert(conversation_id.to_string(), messages);
    }

    pub fn push(&self, conversation_id: &str, message: ChatMessage) {
        self.conversations
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.conversations
            .get(conversation_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}
