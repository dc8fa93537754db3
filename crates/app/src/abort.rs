//! Cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parley_connector_core::Backend;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::session_command::SessionCommand;

/// Per-session cancellation flag. Terminal once set.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    aborted: Arc<AtomicBool>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` only for the call that set it.
    pub fn abort(&self) -> bool {
        !self.aborted.swap(true, Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Fans an abort out to the active session's token, the backend and the
/// session actor. Tokens live on the registered handles, so nothing here
/// outlives a turn.
pub struct AbortCoordinator {
    registry: Arc<SessionRegistry>,
    backend: Arc<dyn Backend>,
}

impl AbortCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, backend: Arc<dyn Backend>) -> Self {
        Self {
            registry,
            backend,
        }
    }

    /// Abort the active turn of a conversation. Returns `false` when there is
    /// nothing running.
    pub async fn abort(&self, conversation_id: &str) -> bool {
        let Some(handle) = self.registry.get(conversation_id) else {
            debug!(
                component = "abort",
                event = "abort.no_session",
                conversation_id = %conversation_id,
                "Abort requested with no active session"
            );
            return false;
        };

        if !handle.token().abort() {
            debug!(
                component = "abort",
                event = "abort.repeat",
                conversation_id = %conversation_id,
                "Session already aborted"
            );
            return true;
        }

        info!(
            component = "abort",
            event = "abort.requested",
            conversation_id = %conversation_id,
            session_id = %handle.id,
            "Aborting session"
        );

        if let Err(e) = self.backend.abort(conversation_id).await {
            warn!(
                component = "abort",
                event = "abort.backend_failed",
                conversation_id = %conversation_id,
                error = %e,
                "Backend stop signal failed"
            );
        }

        handle.send(SessionCommand::Abort).await;
        true
    }

    /// Whether the active turn of a conversation has been aborted. A
    /// finalized turn is no longer active.
    pub fn is_aborted(&self, conversation_id: &str) -> bool {
        self.registry
            .get(conversation_id)
            .is_some_and(|handle| handle.token().is_aborted())
    }
}
