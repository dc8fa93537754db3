//! Tool approval gate
//!
//! One FIFO queue per conversation; the front entry is the one surfaced to
//! the user. Queues of different conversations never wait on each other.
//! The session-wide auto-approve policy is read before anything is queued.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use parley_connector_core::{Backend, ConnectorError};
use parley_protocol::{PendingApproval, ServerMessage};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of submitting an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AutoApproved,
    Queued,
    /// The same request is already queued; nothing changed
    Duplicate,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval {request_key} is no longer pending")]
    Stale { request_key: String },

    #[error("backend rejected approval response: {0}")]
    Upstream(#[source] ConnectorError),
}

/// What a successful resolve changed
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub conversation_id: String,
    pub approved: bool,
    /// Entry that became active for the same conversation, if any
    pub promoted: Option<PendingApproval>,
}

#[derive(Debug, Clone)]
struct QueuedApproval {
    approval: PendingApproval,
    /// An answer is on its way to the backend
    resolving: bool,
}

type Queues = HashMap<String, VecDeque<QueuedApproval>>;

pub struct ApprovalGate {
    queues: Mutex<Queues>,
    always_approve: AtomicBool,
    backend: Arc<dyn Backend>,
    ui_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ApprovalGate {
    pub fn new(
        backend: Arc<dyn Backend>,
        ui_tx: mpsc::UnboundedSender<ServerMessage>,
        always_approve: bool,
    ) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            always_approve: AtomicBool::new(always_approve),
            backend,
            ui_tx,
        }
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn always_approve(&self) -> bool {
        self.always_approve.load(Ordering::SeqCst)
    }

    pub fn set_always_approve(&self, enabled: bool) {
        let previous = self.always_approve.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(
                component = "approval",
                event = "approval.policy_changed",
                always_approve = enabled,
                "Auto-approve policy changed"
            );
        }
    }

    /// Auto-approve or enqueue a request.
    pub async fn submit(&self, approval: PendingApproval) -> Decision {
        if self.always_approve() {
            info!(
                component = "approval",
                event = "approval.auto_approved",
                conversation_id = %approval.conversation_id,
                request_key = %approval.request_key,
                tools = ?approval.tool_names(),
                "Auto-approving tool calls"
            );
            if let Err(e) = self
                .backend
                .respond_tool_approval(&approval.conversation_id, true)
                .await
            {
                warn!(
                    component = "approval",
                    event = "approval.auto_approve_failed",
                    conversation_id = %approval.conversation_id,
                    request_key = %approval.request_key,
                    error = %e,
                    "Backend rejected auto-approval"
                );
            }
            return Decision::AutoApproved;
        }

        let surfaced = {
            let mut queues = self.queues();
            let queue = queues.entry(approval.conversation_id.clone()).or_default();
            if queue
                .iter()
                .any(|queued| queued.approval.request_key == approval.request_key)
            {
                debug!(
                    component = "approval",
                    event = "approval.duplicate",
                    request_key = %approval.request_key,
                    "Ignoring duplicate approval request"
                );
                return Decision::Duplicate;
            }
            queue.push_back(QueuedApproval {
                approval: approval.clone(),
                resolving: false,
            });
            (queue.len() == 1).then_some(approval.clone())
        };

        info!(
            component = "approval",
            event = "approval.queued",
            conversation_id = %approval.conversation_id,
            request_key = %approval.request_key,
            risk_level = ?approval.risk_level,
            active = surfaced.is_some(),
            "Approval request queued"
        );

        if let Some(active) = surfaced {
            let _ = self
                .ui_tx
                .send(ServerMessage::ApprovalSurfaced { approval: active });
        }
        Decision::Queued
    }

    /// Answer a request and promote the next one of its conversation. The
    /// entry keeps its place while the answer is in flight.
    pub async fn resolve(
        &self,
        request_key: &str,
        approved: bool,
        always_approve: bool,
    ) -> Result<Resolution, ApprovalError> {
        let entry = {
            let mut queues = self.queues();
            let found = queues
                .values_mut()
                .flat_map(|queue| queue.iter_mut())
                .find(|queued| queued.approval.request_key == request_key && !queued.resolving);
            let Some(queued) = found else {
                warn!(
                    component = "approval",
                    event = "approval.stale",
                    request_key = %request_key,
                    "Resolve for unknown or already handled approval"
                );
                return Err(ApprovalError::Stale {
                    request_key: request_key.to_string(),
                });
            };
            queued.resolving = true;
            queued.approval.clone()
        };

        if let Err(e) = self
            .backend
            .respond_tool_approval(&entry.conversation_id, approved)
            .await
        {
            return Err(self.settle_failure(entry, e));
        }

        if always_approve {
            self.set_always_approve(true);
        }

        let (removed, promoted) = self.remove_answered(&entry);

        info!(
            component = "approval",
            event = "approval.resolved",
            conversation_id = %entry.conversation_id,
            request_key = %entry.request_key,
            approved = approved,
            always_approve = always_approve,
            promoted = promoted.as_ref().map(|p| p.request_key.as_str()),
            "Approval resolved"
        );

        if removed {
            self.announce_removal(&entry, promoted.clone());
        }

        Ok(Resolution {
            conversation_id: entry.conversation_id,
            approved,
            promoted,
        })
    }

    /// Drop an answered entry, unless the conversation was cleared in the
    /// meantime. Also returns the next active entry when the answered one
    /// was at the front.
    fn remove_answered(&self, entry: &PendingApproval) -> (bool, Option<PendingApproval>) {
        let mut queues = self.queues();
        let Some(queue) = queues.get_mut(&entry.conversation_id) else {
            return (false, None);
        };
        let Some(index) = queue
            .iter()
            .position(|queued| queued.approval.request_key == entry.request_key)
        else {
            return (false, None);
        };
        queue.remove(index);

        let promoted = match index {
            0 => queue.front().map(|queued| queued.approval.clone()),
            _ => None,
        };
        if queue.is_empty() {
            queues.remove(&entry.conversation_id);
        }
        (true, promoted)
    }

    fn announce_removal(&self, entry: &PendingApproval, promoted: Option<PendingApproval>) {
        let _ = self.ui_tx.send(ServerMessage::ApprovalCleared {
            conversation_id: entry.conversation_id.clone(),
            request_key: entry.request_key.clone(),
        });
        if let Some(next) = promoted {
            let _ = self
                .ui_tx
                .send(ServerMessage::ApprovalSurfaced { approval: next });
        }
    }

    fn settle_failure(&self, entry: PendingApproval, error: ConnectorError) -> ApprovalError {
        if matches!(error, ConnectorError::NoPendingApproval(_)) {
            warn!(
                component = "approval",
                event = "approval.upstream_stale",
                conversation_id = %entry.conversation_id,
                request_key = %entry.request_key,
                "Backend had no pending approval; dropping entry"
            );
            if let (true, promoted) = self.remove_answered(&entry) {
                self.announce_removal(&entry, promoted);
            }
            return ApprovalError::Stale {
                request_key: entry.request_key,
            };
        }

        warn!(
            component = "approval",
            event = "approval.upstream_failed",
            conversation_id = %entry.conversation_id,
            request_key = %entry.request_key,
            error = %error,
            "Backend rejected approval response; keeping entry for retry"
        );
        let mut queues = self.queues();
        if let Some(queued) = queues
            .get_mut(&entry.conversation_id)
            .and_then(|queue| {
                queue
                    .iter_mut()
                    .find(|queued| queued.approval.request_key == entry.request_key)
            })
        {
            queued.resolving = false;
        }
        ApprovalError::Upstream(error)
    }

    /// The entry currently surfaced for a conversation.
    pub fn active(&self, conversation_id: &str) -> Option<PendingApproval> {
        self.queues()
            .get(conversation_id)
            .and_then(|queue| queue.front().map(|queued| queued.approval.clone()))
    }

    /// Every entry queued for a conversation, active first.
    pub fn pending(&self, conversation_id: &str) -> Vec<PendingApproval> {
        self.queues()
            .get(conversation_id)
            .map(|queue| queue.iter().map(|queued| queued.approval.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_pending(&self, conversation_id: &str) -> bool {
        self.queues()
            .get(conversation_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    /// Drop everything queued for a conversation (turn finished or aborted).
    pub fn clear_conversation(&self, conversation_id: &str) -> Vec<PendingApproval> {
        let dropped: Vec<PendingApproval> = self
            .queues()
            .remove(conversation_id)
            .map(|queue| queue.into_iter().map(|queued| queued.approval).collect())
            .unwrap_or_default();

        if !dropped.is_empty() {
            debug!(
                component = "approval",
                event = "approval.cleared",
                conversation_id = %conversation_id,
                count = dropped.len(),
                "Dropped approvals for finished turn"
            );
            if let Some(active) = dropped.first() {
                let _ = self.ui_tx.send(ServerMessage::ApprovalCleared {
                    conversation_id: conversation_id.to_string(),
                    request_key: active.request_key.clone(),
                });
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_until, MockBackend};
    use parley_protocol::{RiskLevel, ToolCall};

    fn approval(conversation_id: &str, message_id: &str) -> PendingApproval {
        PendingApproval::new(
            conversation_id,
            message_id,
            vec![ToolCall {
                id: format!("{message_id}-call"),
                name: "web_search".to_string(),
                arguments: serde_json::Map::new(),
            }],
            RiskLevel::Low,
        )
    }

    fn gate(
        backend: &Arc<MockBackend>,
    ) -> (ApprovalGate, mpsc::UnboundedReceiver<ServerMessage>) {
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        (ApprovalGate::new(backend.clone(), ui_tx, false), ui_rx)
    }

    #[tokio::test]
    async fn first_request_becomes_active_and_is_surfaced() {
        let backend = Arc::new(MockBackend::new());
        let (gate, mut ui_rx) = gate(&backend);

        assert_eq!(gate.submit(approval("c1", "m1")).await, Decision::Queued);
        assert_eq!(gate.active("c1").unwrap().request_key, "c1:m1");
        assert!(matches!(
            ui_rx.try_recv(),
            Ok(ServerMessage::ApprovalSurfaced { .. })
        ));
        assert!(backend.approval_responses().is_empty());
    }

    #[tokio::test]
    async fn resolving_active_promotes_next_in_fifo_order() {
        let backend = Arc::new(MockBackend::new());
        let (gate, _ui_rx) = gate(&backend);

        gate.submit(approval("c1", "a")).await;
        gate.submit(approval("c1", "b")).await;
        gate.submit(approval("c1", "c")).await;
        assert_eq!(gate.active("c1").unwrap().request_key, "c1:a");

        let resolution = gate.resolve("c1:a", true, false).await.unwrap();
        assert_eq!(resolution.promoted.unwrap().request_key, "c1:b");
        assert_eq!(gate.active("c1").unwrap().request_key, "c1:b");

        gate.resolve("c1:b", false, false).await.unwrap();
        assert_eq!(gate.active("c1").unwrap().request_key, "c1:c");
        assert_eq!(
            backend.approval_responses(),
            vec![("c1".to_string(), true), ("c1".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let backend = Arc::new(MockBackend::new());
        let (gate, _ui_rx) = gate(&backend);

        gate.submit(approval("c1", "m1")).await;
        gate.submit(approval("c2", "m2")).await;
        assert_eq!(gate.active("c1").unwrap().conversation_id, "c1");
        assert_eq!(gate.active("c2").unwrap().conversation_id, "c2");

        gate.resolve("c1:m1", true, false).await.unwrap();
        assert!(gate.active("c1").is_none());
        assert_eq!(gate.pending("c2").len(), 1);
        assert_eq!(gate.active("c2").unwrap().request_key, "c2:m2");
    }

    #[tokio::test]
    async fn resolving_twice_is_stale_and_changes_nothing() {
        let backend = Arc::new(MockBackend::new());
        let (gate, _ui_rx) = gate(&backend);

        gate.submit(approval("c1", "m1")).await;
        gate.submit(approval("c1", "m2")).await;
        gate.resolve("c1:m1", true, false).await.unwrap();

        let before = gate.pending("c1");
        let err = gate.resolve("c1:m1", true, false).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Stale { .. }));
        assert_eq!(gate.pending("c1"), before);
        assert_eq!(backend.approval_responses().len(), 1);
    }

    #[tokio::test]
    async fn always_approve_suppresses_later_requests() {
        let backend = Arc::new(MockBackend::new());
        let (gate, _ui_rx) = gate(&backend);

        gate.submit(approval("c1", "m1")).await;
        gate.resolve("c1:m1", true, true).await.unwrap();
        assert!(gate.always_approve());

        assert_eq!(
            gate.submit(approval("c1", "m2")).await,
            Decision::AutoApproved
        );
        assert!(gate.pending("c1").is_empty());
        assert_eq!(
            backend.approval_responses(),
            vec![("c1".to_string(), true), ("c1".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn duplicate_submit_is_a_no_op() {
        let backend = Arc::new(MockBackend::new());
        let (gate, _ui_rx) = gate(&backend);

        gate.submit(approval("c1", "m1")).await;
        assert_eq!(gate.submit(approval("c1", "m1")).await, Decision::Duplicate);
        assert_eq!(gate.pending("c1").len(), 1);
    }

    #[tokio::test]
    async fn backend_without_pending_request_reports_stale() {
        let backend = Arc::new(MockBackend::new());
        backend.reject_approvals(true);
        let (gate, _ui_rx) = gate(&backend);

        gate.submit(approval("c1", "m1")).await;
        let err = gate.resolve("c1:m1", true, true).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Stale { .. }));
        assert!(gate.pending("c1").is_empty());
        assert!(!gate.always_approve());
    }

    #[tokio::test]
    async fn clear_conversation_drops_queue() {
        let backend = Arc::new(MockBackend::new());
        let (gate, mut ui_rx) = gate(&backend);

        gate.submit(approval("c1", "m1")).await;
        gate.submit(approval("c1", "m2")).await;
        let _ = ui_rx.try_recv();

        assert_eq!(gate.clear_conversation("c1").len(), 2);
        assert!(!gate.has_pending("c1"));
        assert!(matches!(
            ui_rx.try_recv(),
            Ok(ServerMessage::ApprovalCleared { .. })
        ));
    }

    #[tokio::test]
    async fn request_arriving_mid_resolve_waits_behind_the_answered_one() {
        let backend = Arc::new(MockBackend::new());
        let (gate, mut ui_rx) = gate(&backend);
        let gate = Arc::new(gate);
        let release = backend.hold_approvals();

        gate.submit(approval("c1", "m1")).await;
        let _ = ui_rx.try_recv();

        let answering = tokio::spawn({
            let gate = gate.clone();
            async move { gate.resolve("c1:m1", true, false).await }
        });
        wait_until(|| backend.approval_attempts() == 1).await;

        assert_eq!(gate.submit(approval("c1", "m2")).await, Decision::Queued);
        assert!(ui_rx.try_recv().is_err());
        let repeat = gate.resolve("c1:m1", true, false).await.unwrap_err();
        assert!(matches!(repeat, ApprovalError::Stale { .. }));

        backend.fail_approvals(true);
        release.notify_one();
        let err = answering.await.unwrap().unwrap_err();
        assert!(matches!(err, ApprovalError::Upstream(_)));
        let keys: Vec<String> = gate
            .pending("c1")
            .into_iter()
            .map(|p| p.request_key)
            .collect();
        assert_eq!(keys, vec!["c1:m1".to_string(), "c1:m2".to_string()]);
        assert!(ui_rx.try_recv().is_err());

        backend.fail_approvals(false);
        release.notify_one();
        let resolution = gate.resolve("c1:m1", true, false).await.unwrap();
        assert_eq!(resolution.promoted.unwrap().request_key, "c1:m2");

        let surfaced: Vec<String> = std::iter::from_fn(|| ui_rx.try_recv().ok())
            .filter_map(|msg| match msg {
                ServerMessage::ApprovalSurfaced { approval } => Some(approval.request_key),
                _ => None,
            })
            .collect();
        assert_eq!(surfaced, vec!["c1:m2".to_string()]);
    }

    #[tokio::test]
    async fn clearing_mid_resolve_does_not_announce_twice() {
        let backend = Arc::new(MockBackend::new());
        let (gate, mut ui_rx) = gate(&backend);
        let gate = Arc::new(gate);
        let release = backend.hold_approvals();

        gate.submit(approval("c1", "m1")).await;
        let answering = tokio::spawn({
            let gate = gate.clone();
            async move { gate.resolve("c1:m1", true, false).await }
        });
        wait_until(|| backend.approval_attempts() == 1).await;

        gate.clear_conversation("c1");
        release.notify_one();
        let resolution = answering.await.unwrap().unwrap();
        assert!(resolution.promoted.is_none());

        let cleared = std::iter::from_fn(|| ui_rx.try_recv().ok())
            .filter(|msg| matches!(msg, ServerMessage::ApprovalCleared { .. }))
            .count();
        assert_eq!(cleared, 1);
    }
}
