//! Scripted backend and helpers shared by the crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use parley_connector_core::{
    Backend, BackendSignal, ConnectorError, DetachHandle, Subscription, TurnRequest,
};
use parley_protocol::EventEnvelope;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

#[derive(Default)]
struct MockState {
    streams: HashMap<String, mpsc::Sender<BackendSignal>>,
    requests: Vec<TurnRequest>,
    aborts: Vec<String>,
    approvals: Vec<(String, bool)>,
    reject_approvals: bool,
    fail_approvals: bool,
    fail_streams: bool,
    approval_attempts: usize,
    approval_hold: Option<Arc<Notify>>,
}

/// Backend whose streams are fed by the test. Every subscription carries
/// counting detach handles.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    detaches: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Answer approval responses with `NoPendingApproval`.
    pub fn reject_approvals(&self, reject: bool) {
        self.state().reject_approvals = reject;
    }

    /// Answer approval responses with a provider error.
    pub fn fail_approvals(&self, fail: bool) {
        self.state().fail_approvals = fail;
    }

    /// Refuse to open new streams.
    pub fn fail_streams(&self, fail: bool) {
        self.state().fail_streams = fail;
    }

    /// Park every approval response until the returned `Notify` is signalled
    /// once for it.
    pub fn hold_approvals(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.state().approval_hold = Some(notify.clone());
        notify
    }

    /// Approval responses received, including held and failed ones.
    pub fn approval_attempts(&self) -> usize {
        self.state().approval_attempts
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.state().requests.clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.state().aborts.clone()
    }

    /// Accepted approval responses, in order.
    pub fn approval_responses(&self) -> Vec<(String, bool)> {
        self.state().approvals.clone()
    }

    /// Total detach handle invocations across all subscriptions.
    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    pub fn has_stream(&self, conversation_id: &str) -> bool {
        self.state().streams.contains_key(conversation_id)
    }

    fn sender(&self, conversation_id: &str) -> mpsc::Sender<BackendSignal> {
        self.state()
            .streams
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| panic!("no stream open for {conversation_id}"))
    }

    /// Push a raw signal onto the stream opened for `conversation_id`.
    pub async fn signal(&self, conversation_id: &str, signal: BackendSignal) {
        let _ = self.sender(conversation_id).send(signal).await;
    }

    /// Push an envelope onto its own conversation's stream.
    pub async fn emit(&self, envelope: EventEnvelope) {
        let target = envelope.conversation_id.clone();
        self.emit_to(&target, envelope).await;
    }

    /// Push an envelope onto another conversation's stream.
    pub async fn emit_to(&self, stream: &str, envelope: EventEnvelope) {
        self.signal(stream, BackendSignal::Event(envelope.to_value()))
            .await;
    }

    pub async fn emit_raw(&self, stream: &str, value: Value) {
        self.signal(stream, BackendSignal::Event(value)).await;
    }

    pub async fn finish(&self, conversation_id: &str) {
        self.signal(
            conversation_id,
            BackendSignal::Done {
                conversation_id: conversation_id.to_string(),
            },
        )
        .await;
    }

    pub async fn fail(&self, conversation_id: &str, message: &str) {
        self.signal(
            conversation_id,
            BackendSignal::Error {
                conversation_id: conversation_id.to_string(),
                message: message.to_string(),
            },
        )
        .await;
    }

    /// Drop the stream's sender so the subscription ends.
    pub fn close(&self, conversation_id: &str) {
        self.state().streams.remove(conversation_id);
    }

    fn counting_handle(&self, label: &'static str) -> DetachHandle {
        let detaches = self.detaches.clone();
        DetachHandle::new(label, move || {
            detaches.fetch_add(1, Ordering::SeqCst);
        })
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn stream(&self, request: TurnRequest) -> Result<Subscription, ConnectorError> {
        let (tx, rx) = mpsc::channel(64);
        {
            let mut state = self.state();
            if state.fail_streams {
                return Err(ConnectorError::Provider("stream refused".to_string()));
            }
            state.streams.insert(request.conversation_id.clone(), tx);
            state.requests.push(request);
        }
        Ok(Subscription::from_receiver(rx).with_handles(
            self.counting_handle("on_event"),
            self.counting_handle("on_done"),
            self.counting_handle("on_error"),
        ))
    }

    async fn abort(&self, conversation_id: &str) -> Result<(), ConnectorError> {
        self.state().aborts.push(conversation_id.to_string());
        Ok(())
    }

    async fn respond_tool_approval(
        &self,
        conversation_id: &str,
        approved: bool,
    ) -> Result<(), ConnectorError> {
        let hold = {
            let mut state = self.state();
            state.approval_attempts += 1;
            state.approval_hold.clone()
        };
        if let Some(hold) = hold {
            hold.notified().await;
        }

        let mut state = self.state();
        if state.reject_approvals {
            return Err(ConnectorError::NoPendingApproval(
                conversation_id.to_string(),
            ));
        }
        if state.fail_approvals {
            return Err(ConnectorError::Provider("approval channel down".to_string()));
        }
        state
            .approvals
            .push((conversation_id.to_string(), approved));
        Ok(())
    }
}

/// Poll `condition` until it holds, yielding to other tasks between checks.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
