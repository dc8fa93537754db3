//! Parley
//!
//! Response streaming and tool approval for AI assistant conversations:
//! one actor per assistant turn, render-tick coalescing, a per-conversation
//! approval queue with a process-wide auto-approve policy, and cooperative
//! cancellation.

pub mod abort;
pub mod approval;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod logging;
pub mod migration_runner;
pub mod paths;
pub mod persistence;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod session_actor;
pub mod session_command;
pub mod transition;

#[cfg(test)]
mod test_support;

pub use abort::{AbortCoordinator, AbortToken};
pub use approval::{ApprovalError, ApprovalGate, Decision, Resolution};
pub use config::CoreConfig;
pub use coordinator::{Coordinator, TurnInput};
pub use error::CoreError;
pub use scheduler::UpdateScheduler;
pub use session::{SessionSnapshot, SessionState};
pub use session_actor::SessionActorHandle;
