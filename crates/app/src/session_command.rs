//! Commands sent to a session actor from the coordinator and abort path.

use tokio::sync::oneshot;

use crate::session::SessionState;

pub enum SessionCommand {
    /// Stop the turn and finalize it as aborted
    Abort,

    /// Copy of the full accumulated state
    GetState {
        reply: oneshot::Sender<SessionState>,
    },
}
