//! Parley Connectors
//!
//! Backends that speak the envelope protocol. The process connector drives
//! an agent runtime as a subprocess over NDJSON on stdin/stdout.

pub mod process;

pub use parley_connector_core::{
    Backend, BackendSignal, ConnectorError, DetachHandle, ModelConfig, Subscription, TurnRequest,
};
pub use process::{ProcessConfig, ProcessConnector};
