//! Parley connector core
//!
//! The contract between the streaming core and an agent-execution backend.
//! A backend opens one [`Subscription`] per turn, delivers raw envelopes plus
//! done/error signals over it, and accepts abort and approval responses.

use std::fmt;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parley_protocol::{Attachment, ChatMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn backend: {0}")]
    Spawn(String),

    #[error("Backend communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("No pending approval for conversation {0}")]
    NoPendingApproval(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

/// Model settings for one turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Everything a backend needs to run one assistant turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub conversation_id: String,
    pub assistant_message_id: String,
    pub config: ModelConfig,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// One item delivered over a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum BackendSignal {
    /// A raw envelope, validated by the core before use
    Event(Value),
    /// The backend finished the turn for this conversation
    Done { conversation_id: String },
    /// The backend failed the turn for this conversation
    Error {
        conversation_id: String,
        message: String,
    },
}

/// Cleanup returned by one registration point (event, done or error).
/// Consumed on invocation, so it can only ever run once.
pub struct DetachHandle {
    label: &'static str,
    run: Box<dyn FnOnce() + Send>,
}

impl DetachHandle {
    pub fn new(label: &'static str, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label,
            run: Box::new(run),
        }
    }

    pub fn noop(label: &'static str) -> Self {
        Self::new(label, || {})
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn invoke(self) {
        debug!(
            component = "connector",
            event = "subscription.detach",
            handle = self.label,
            "Detaching subscription handle"
        );
        (self.run)();
    }
}

impl fmt::Debug for DetachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachHandle")
            .field("label", &self.label)
            .finish()
    }
}

/// A live backend event stream and its three detach handles
pub struct Subscription {
    signals: BoxStream<'static, BackendSignal>,
    on_event: DetachHandle,
    on_done: DetachHandle,
    on_error: DetachHandle,
}

impl Subscription {
    pub fn new(
        signals: BoxStream<'static, BackendSignal>,
        on_event: DetachHandle,
        on_done: DetachHandle,
        on_error: DetachHandle,
    ) -> Self {
        Self {
            signals,
            on_event,
            on_done,
            on_error,
        }
    }

    /// Wrap an mpsc receiver. The handles are no-ops unless replaced.
    pub fn from_receiver(rx: mpsc::Receiver<BackendSignal>) -> Self {
        let signals = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|signal| (signal, rx))
        })
        .boxed();
        Self::new(
            signals,
            DetachHandle::noop("on_event"),
            DetachHandle::noop("on_done"),
            DetachHandle::noop("on_error"),
        )
    }

    pub fn with_handles(
        mut self,
        on_event: DetachHandle,
        on_done: DetachHandle,
        on_error: DetachHandle,
    ) -> Self {
        self.on_event = on_event;
        self.on_done = on_done;
        self.on_error = on_error;
        self
    }

    /// Next signal, or `None` once the backend closed the stream.
    pub async fn next(&mut self) -> Option<BackendSignal> {
        self.signals.next().await
    }

    /// Tear down the subscription, invoking each handle exactly once.
    pub fn detach(self) {
        let Subscription {
            signals,
            on_event,
            on_done,
            on_error,
        } = self;
        drop(signals);
        on_event.invoke();
        on_done.invoke();
        on_error.invoke();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// An agent-execution backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start a turn and return its event subscription.
    async fn stream(&self, request: TurnRequest) -> Result<Subscription, ConnectorError>;

    /// Ask the backend to stop work for a conversation.
    async fn abort(&self, conversation_id: &str) -> Result<(), ConnectorError>;

    /// Answer the outstanding approval request of a conversation.
    /// Fails with [`ConnectorError::NoPendingApproval`] when nothing is waiting.
    async fn respond_tool_approval(
        &self,
        conversation_id: &str,
        approved: bool,
    ) -> Result<(), ConnectorError>;
}
