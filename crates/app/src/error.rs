use thiserror::Error;

/// Errors returned by the coordinator to callers starting or steering turns
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("conversation {conversation_id} already has an active session")]
    SessionBusy { conversation_id: String },

    #[error("persistence channel closed")]
    PersistenceClosed,
}
