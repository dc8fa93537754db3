//! Conversation id → active session.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::CoreError;
use crate::session_actor::SessionActorHandle;

/// At most one active session per conversation. Insert-if-absent and
/// compare-and-remove are atomic per key.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionActorHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, failing if the conversation already has one.
    pub fn reserve(&self, handle: SessionActorHandle) -> Result<(), CoreError> {
        match self.sessions.entry(handle.conversation_id.clone()) {
            Entry::Occupied(existing) => Err(CoreError::SessionBusy {
                conversation_id: existing.key().clone(),
            }),
            Entry::Vacant(slot) => {
                debug!(
                    component = "registry",
                    event = "registry.registered",
                    conversation_id = %handle.conversation_id,
                    session_id = %handle.id,
                    "Session registered"
                );
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, conversation_id: &str) -> Option<SessionActorHandle> {
        self.sessions
            .get(conversation_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.sessions.contains_key(conversation_id)
    }

    /// Remove the entry only if it still belongs to `session_id`.
    pub fn remove_if(&self, conversation_id: &str, session_id: &str) -> bool {
        let removed = self
            .sessions
            .remove_if(conversation_id, |_, handle| handle.id == session_id)
            .is_some();
        if removed {
            debug!(
                component = "registry",
                event = "registry.deregistered",
                conversation_id = %conversation_id,
                session_id = %session_id,
                "Session deregistered"
            );
        }
        removed
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
