//! Side-channel image generation progress, keyed by (conversation, message).

use dashmap::DashMap;
use parley_protocol::ImageProgress;

#[derive(Debug, Default)]
pub struct ProgressBoard {
    records: DashMap<(String, String), ImageProgress>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an update. A final status (completed/error) clears the record.
    /// Returns whether a record is still held afterwards.
    pub fn update(&self, record: ImageProgress) -> bool {
        let key = (record.conversation_id.clone(), record.message_id.clone());
        if record.status.is_final() {
            self.records.remove(&key);
            false
        } else {
            self.records.insert(key, record);
            true
        }
    }

    pub fn get(&self, conversation_id: &str, message_id: &str) -> Option<ImageProgress> {
        self.records
            .get(&(conversation_id.to_string(), message_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn clear(&self, conversation_id: &str, message_id: &str) {
        self.records
            .remove(&(conversation_id.to_string(), message_id.to_string()));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
