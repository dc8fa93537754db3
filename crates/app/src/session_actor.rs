//! Session actor: owns one assistant turn and processes its inputs sequentially.
//!
//! Each turn runs as an independent tokio task. External callers talk to it
//! through a `SessionActorHandle` which sends `SessionCommand`s over an mpsc
//! channel. Lock-free reads go through `ArcSwap`; completion is observable
//! through a `watch` channel carrying the session status.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parley_connector_core::{Backend, BackendSignal, Subscription, TurnRequest};
use parley_protocol::{
    ChatMessage, EventEnvelope, MessagePatch, Role, ServerMessage, SessionStatus,
    ToolSchemaRegistry,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::abort::AbortToken;
use crate::approval::{ApprovalGate, Decision};
use crate::history::Transcripts;
use crate::persistence::PersistCommand;
use crate::progress::ProgressBoard;
use crate::registry::SessionRegistry;
use crate::scheduler::UpdateScheduler;
use crate::session::{SessionSnapshot, SessionState};
use crate::session_command::SessionCommand;
use crate::transition::{transition, Effect, Input};

/// Shared collaborators every session actor needs
#[derive(Clone)]
pub struct SessionContext {
    pub backend: Arc<dyn Backend>,
    pub gate: Arc<ApprovalGate>,
    pub registry: Arc<SessionRegistry>,
    pub progress: Arc<ProgressBoard>,
    pub history: Arc<Transcripts>,
    pub tools: Arc<ToolSchemaRegistry>,
    pub persist_tx: mpsc::Sender<PersistCommand>,
    pub ui_tx: mpsc::UnboundedSender<ServerMessage>,
    pub render_tick: Duration,
}

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone, Debug)]
pub struct SessionActorHandle {
    pub id: String,
    pub conversation_id: String,
    pub assistant_message_id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    status_rx: watch::Receiver<SessionStatus>,
    token: AbortToken,
}

impl SessionActorHandle {
    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: SessionCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel closed, command dropped"
            );
        }
    }

    /// Try to send a command without awaiting (for non-async contexts).
    pub fn try_send(&self, cmd: SessionCommand) {
        if self.command_tx.try_send(cmd).is_err() {
            warn!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel full or closed"
            );
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    pub fn token(&self) -> &AbortToken {
        &self.token
    }

    /// Resolve once the turn has finalized, with its terminal status.
    pub async fn wait(&self) -> SessionStatus {
        let mut rx = self.status_rx.clone();
        let result = rx.wait_for(|status| status.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| *rx.borrow())
    }

    /// Full accumulated state, or `None` once the actor has exited.
    pub async fn get_state(&self) -> Option<SessionState> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::GetState { reply }).await;
        rx.await.ok()
    }

    /// A handle with no actor behind it; the caller owns the command receiver.
    #[cfg(test)]
    pub fn detached(id: &str, conversation_id: &str) -> (Self, mpsc::Receiver<SessionCommand>) {
        let state = SessionState::new(id, conversation_id, format!("{id}-reply"));
        let (command_tx, command_rx) = mpsc::channel(8);
        let (_status_tx, status_rx) = watch::channel(state.status);
        let handle = Self {
            id: state.session_id.clone(),
            conversation_id: state.conversation_id.clone(),
            assistant_message_id: state.assistant_message_id.clone(),
            command_tx,
            snapshot: Arc::new(ArcSwap::from_pointee(state.snapshot())),
            status_rx,
            token: AbortToken::new(),
        };
        (handle, command_rx)
    }
}

pub struct SessionActor {
    ctx: SessionContext,
    state: SessionState,
    token: AbortToken,
    scheduler: UpdateScheduler,
    request: Option<TurnRequest>,
    subscription: Option<Subscription>,
    command_rx: mpsc::Receiver<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    status_tx: watch::Sender<SessionStatus>,
}

impl SessionActor {
    /// Build an actor and its handle. Nothing runs until [`SessionActor::spawn`].
    pub fn new(
        ctx: SessionContext,
        state: SessionState,
        token: AbortToken,
        request: TurnRequest,
        capacity: usize,
    ) -> (SessionActorHandle, SessionActor) {
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = watch::channel(state.status);
        let snapshot = Arc::new(ArcSwap::from_pointee(state.snapshot()));

        let handle = SessionActorHandle {
            id: state.session_id.clone(),
            conversation_id: state.conversation_id.clone(),
            assistant_message_id: state.assistant_message_id.clone(),
            command_tx,
            snapshot: snapshot.clone(),
            status_rx,
            token: token.clone(),
        };

        let actor = SessionActor {
            scheduler: UpdateScheduler::new(ctx.render_tick),
            ctx,
            state,
            token,
            request: Some(request),
            subscription: None,
            command_rx,
            snapshot,
            status_tx,
        };

        (handle, actor)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            component = "session_actor",
            event = "session.started",
            conversation_id = %self.state.conversation_id,
            session_id = %self.state.session_id,
            message_id = %self.state.assistant_message_id,
            "Session started"
        );

        if let Some(request) = self.request.take() {
            match self.ctx.backend.stream(request).await {
                Ok(subscription) => self.subscription = Some(subscription),
                Err(e) => {
                    warn!(
                        component = "session_actor",
                        event = "session.stream_failed",
                        conversation_id = %self.state.conversation_id,
                        error = %e,
                        "Backend stream could not be opened"
                    );
                    self.apply(Input::BackendError(e.to_string())).await;
                }
            }
        }

        while !self.state.finalized {
            let deadline = self.scheduler.deadline();

            tokio::select! {
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!(
                            component = "session_actor",
                            event = "session.orphaned",
                            conversation_id = %self.state.conversation_id,
                            "All handles dropped; aborting turn"
                        );
                        self.apply(Input::Aborted).await;
                    }
                },

                signal = next_signal(self.subscription.as_mut()) => {
                    self.handle_signal(signal).await;
                }

                _ = sleep_until(deadline) => {
                    if let Some(patch) = self.scheduler.poll_due(Instant::now()) {
                        self.flush(patch);
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Abort => self.apply(Input::Aborted).await,
            SessionCommand::GetState { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    async fn handle_signal(&mut self, signal: Option<BackendSignal>) {
        let conversation_id = self.state.conversation_id.as_str();

        let input = match signal {
            None => Input::StreamClosed,

            Some(BackendSignal::Event(value)) => {
                let envelope = match EventEnvelope::parse(value, &self.ctx.tools) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(
                            component = "session_actor",
                            event = "session.envelope_malformed",
                            conversation_id = %conversation_id,
                            error = %e,
                            "Dropping malformed envelope"
                        );
                        return;
                    }
                };
                if envelope.conversation_id != conversation_id {
                    debug!(
                        component = "session_actor",
                        event = "session.envelope_foreign",
                        conversation_id = %conversation_id,
                        envelope_conversation_id = %envelope.conversation_id,
                        kind = envelope.kind().as_str(),
                        "Ignoring envelope for another conversation"
                    );
                    return;
                }
                let tools = &self.ctx.tools;
                let gate = &self.ctx.gate;
                Input::from_event(
                    envelope.event,
                    |calls| tools.risk_for(calls),
                    || gate.has_pending(conversation_id),
                )
            }

            Some(BackendSignal::Done {
                conversation_id: target,
            }) => {
                if target != conversation_id {
                    return;
                }
                Input::Done
            }

            Some(BackendSignal::Error {
                conversation_id: target,
                message,
            }) => {
                if target != conversation_id {
                    return;
                }
                Input::BackendError(message)
            }
        };

        self.apply(input).await;
    }

    /// Run `transition` and perform its effects. Gate decisions feed back as
    /// further inputs, handled in order before returning.
    async fn apply(&mut self, input: Input) {
        let mut inputs = VecDeque::from([input]);

        while let Some(input) = inputs.pop_front() {
            let state = std::mem::take(&mut self.state);
            let (state, effects) = transition(state, input, &self.token);
            self.state = state;
            self.scheduler.set_held(
                self.state.status == SessionStatus::AwaitingApproval,
                Instant::now(),
            );

            for effect in effects {
                match effect {
                    Effect::Schedule { patch, force } => {
                        if let Some(patch) = self.scheduler.schedule(patch, force, Instant::now()) {
                            self.flush(patch);
                        }
                    }

                    Effect::SubmitApproval(approval) => {
                        let request_key = approval.request_key.clone();
                        let tool_names = approval
                            .tool_names()
                            .into_iter()
                            .map(str::to_string)
                            .collect();
                        match self.ctx.gate.submit(approval).await {
                            Decision::AutoApproved => {
                                inputs.push_back(Input::AutoApproved { request_key })
                            }
                            Decision::Queued => inputs.push_back(Input::ApprovalQueued {
                                request_key,
                                tool_names,
                            }),
                            Decision::Duplicate => {}
                        }
                    }

                    Effect::ImageProgress(record) => {
                        self.ctx.progress.update(record.clone());
                        let _ = self
                            .ctx
                            .ui_tx
                            .send(ServerMessage::ImageProgress { progress: record });
                    }

                    Effect::Finalize(status) => self.finalize(status).await,
                }
            }
        }
    }

    fn flush(&self, patch: MessagePatch) {
        self.snapshot.store(Arc::new(self.state.snapshot()));
        if !self.state.status.is_terminal() {
            self.status_tx.send_replace(self.state.status);
        }
        let _ = self.ctx.ui_tx.send(ServerMessage::Flush {
            conversation_id: self.state.conversation_id.clone(),
            message_id: self.state.assistant_message_id.clone(),
            patch,
        });
    }

    /// Runs once per turn: `transition` only emits `Finalize` for a state
    /// that was not finalized yet.
    async fn finalize(&mut self, status: SessionStatus) {
        let conversation_id = self.state.conversation_id.clone();

        let mut patch = self.scheduler.take().unwrap_or_default();
        patch.merge(MessagePatch::status(status));
        self.flush(patch);

        let record = self.state.to_record();
        if self
            .ctx
            .persist_tx
            .send(PersistCommand::SaveMessage(record))
            .await
            .is_err()
        {
            warn!(
                component = "session_actor",
                event = "session.persist_dropped",
                conversation_id = %conversation_id,
                message_id = %self.state.assistant_message_id,
                "Persistence channel closed; final message not saved"
            );
        }

        if !self.state.content.is_empty() {
            self.ctx.history.push(
                &conversation_id,
                ChatMessage {
                    role: Role::Assistant,
                    content: self.state.content.clone(),
                },
            );
        }

        if let Some(subscription) = self.subscription.take() {
            subscription.detach();
        }
        self.ctx.gate.clear_conversation(&conversation_id);
        self.ctx
            .progress
            .clear(&conversation_id, &self.state.assistant_message_id);
        self.ctx
            .registry
            .remove_if(&conversation_id, &self.state.session_id);

        self.snapshot.store(Arc::new(self.state.snapshot()));
        self.status_tx.send_replace(status);
        let _ = self.ctx.ui_tx.send(ServerMessage::SessionFinished {
            conversation_id: conversation_id.clone(),
            message_id: self.state.assistant_message_id.clone(),
            status,
        });

        info!(
            component = "session_actor",
            event = "session.finalized",
            conversation_id = %conversation_id,
            session_id = %self.state.session_id,
            status = status.as_str(),
            content_len = self.state.content.len(),
            images = self.state.partial.images.len(),
            "Session finalized"
        );
    }
}

async fn next_signal(subscription: Option<&mut Subscription>) -> Option<BackendSignal> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_until, MockBackend};
    use parley_connector_core::ModelConfig;
    use parley_protocol::{ContentPatch, ImageProgressStatus, ToolCall};
    use serde_json::json;

    struct Fixture {
        backend: Arc<MockBackend>,
        ctx: SessionContext,
        ui_rx: mpsc::UnboundedReceiver<ServerMessage>,
        persist_rx: mpsc::Receiver<PersistCommand>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MockBackend::new());
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::channel(16);
        let ctx = SessionContext {
            backend: backend.clone(),
            gate: Arc::new(ApprovalGate::new(backend.clone(), ui_tx.clone(), false)),
            registry: Arc::new(SessionRegistry::new()),
            progress: Arc::new(ProgressBoard::new()),
            history: Arc::new(Transcripts::new()),
            tools: Arc::new(ToolSchemaRegistry::builtin()),
            persist_tx,
            ui_tx,
            render_tick: Duration::from_millis(16),
        };
        Fixture {
            backend,
            ctx,
            ui_rx,
            persist_rx,
        }
    }

    async fn start(fx: &Fixture, conversation_id: &str) -> SessionActorHandle {
        let state = SessionState::new(
            format!("s-{conversation_id}"),
            conversation_id,
            format!("a-{conversation_id}"),
        );
        let request = TurnRequest {
            conversation_id: conversation_id.to_string(),
            assistant_message_id: state.assistant_message_id.clone(),
            config: ModelConfig::default(),
            messages: Vec::new(),
            attachments: Vec::new(),
        };
        let opened = fx.backend.requests().len();
        let (handle, actor) = SessionActor::new(fx.ctx.clone(), state, AbortToken::new(), request, 16);
        fx.ctx.registry.reserve(handle.clone()).unwrap();
        actor.spawn();
        wait_until(|| fx.backend.requests().len() > opened).await;
        handle
    }

    fn flushes(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<MessagePatch> {
        let mut patches = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ServerMessage::Flush { patch, .. } = msg {
                patches.push(patch);
            }
        }
        patches
    }

    fn saved(rx: &mut mpsc::Receiver<PersistCommand>) -> Vec<parley_protocol::MessageRecord> {
        let mut records = Vec::new();
        while let Ok(PersistCommand::SaveMessage(record)) = rx.try_recv() {
            records.push(record);
        }
        records
    }

    fn search_call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "web_search".to_string(),
            arguments: json!({"query": "rust"}).as_object().cloned().unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_within_one_tick_coalesce_into_one_flush() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        for chunk in ["Hel", "lo ", "world"] {
            fx.backend.emit(EventEnvelope::token("c1", chunk)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let patches = flushes(&mut fx.ui_rx);
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].content,
            Some(ContentPatch::Append("Hello world".to_string()))
        );
        assert_eq!(handle.snapshot().content, "Hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn done_flushes_persists_once_and_deregisters() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        fx.backend.emit(EventEnvelope::token("c1", "Hi")).await;
        fx.backend.finish("c1").await;
        assert_eq!(handle.wait().await, SessionStatus::Done);

        let records = saved(&mut fx.persist_rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, "Hi");
        assert_eq!(records[0].status, Some(SessionStatus::Done));
        assert_eq!(records[0].role, Role::Assistant);

        let patches = flushes(&mut fx.ui_rx);
        let last = patches.last().unwrap();
        assert_eq!(last.status, Some(SessionStatus::Done));
        assert_eq!(last.content, Some(ContentPatch::Append("Hi".to_string())));

        assert_eq!(fx.backend.detach_count(), 3);
        assert!(fx.ctx.registry.is_empty());
        assert_eq!(fx.ctx.history.messages("c1").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn done_racing_abort_finalizes_once() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        fx.backend.emit(EventEnvelope::token("c1", "partial")).await;
        fx.backend.finish("c1").await;
        handle.token().abort();
        handle.send(SessionCommand::Abort).await;

        let status = handle.wait().await;
        assert!(status == SessionStatus::Done || status == SessionStatus::Aborted);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(saved(&mut fx.persist_rx).len(), 1);
        assert_eq!(fx.backend.detach_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_and_foreign_envelopes_are_dropped() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        fx.backend.emit(EventEnvelope::token("c1", "ok")).await;
        fx.backend
            .emit_raw("c1", json!({"conversationId": "c1", "kind": "token", "chunk": 7}))
            .await;
        fx.backend
            .emit_raw("c1", json!({"conversationId": "c1", "kind": "teleport"}))
            .await;
        fx.backend
            .emit_to("c1", EventEnvelope::token("c2", "intruder"))
            .await;
        fx.backend.emit_to("c1", EventEnvelope::done("c2")).await;
        fx.backend.emit(EventEnvelope::token("c1", "!")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(handle.status(), SessionStatus::Streaming);
        assert_eq!(handle.snapshot().content, "ok!");

        fx.backend.finish("c1").await;
        handle.wait().await;
        assert_eq!(saved(&mut fx.persist_rx)[0].content, "ok!");
        let _ = flushes(&mut fx.ui_rx);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_approval_forces_flush_and_waits() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        fx.backend.emit(EventEnvelope::token("c1", "Looking")).await;
        fx.backend
            .emit(EventEnvelope::approval_request(
                "c1",
                Some("m1".to_string()),
                vec![search_call("t1"), search_call("t2")],
            ))
            .await;
        wait_until(|| fx.ctx.gate.has_pending("c1")).await;
        tokio::task::yield_now().await;

        let patches = flushes(&mut fx.ui_rx);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].status, Some(SessionStatus::AwaitingApproval));
        assert_eq!(
            patches[0].content,
            Some(ContentPatch::Append(
                "Looking\n_Waiting for approval: web_search, web_search_\n".to_string()
            ))
        );
        assert_eq!(handle.status(), SessionStatus::AwaitingApproval);

        fx.ctx.gate.resolve("c1:m1", true, false).await.unwrap();
        fx.backend
            .emit(EventEnvelope::approval_result("c1", true))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.status(), SessionStatus::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn image_progress_is_tracked_until_completed() {
        let mut fx = fixture();
        let _handle = start(&fx, "c1").await;

        fx.backend
            .emit_raw(
                "c1",
                json!({"conversationId": "c1", "kind": "image_progress", "status": "generating", "progress": 0.5}),
            )
            .await;
        wait_until(|| fx.ctx.progress.get("c1", "a-c1").is_some()).await;

        fx.backend
            .emit_raw(
                "c1",
                json!({"conversationId": "c1", "kind": "image_progress", "status": "completed"}),
            )
            .await;
        wait_until(|| fx.ctx.progress.is_empty()).await;

        let updates: Vec<ImageProgressStatus> = std::iter::from_fn(|| fx.ui_rx.try_recv().ok())
            .filter_map(|msg| match msg {
                ServerMessage::ImageProgress { progress } => Some(progress.status),
                _ => None,
            })
            .collect();
        assert_eq!(
            updates,
            vec![ImageProgressStatus::Generating, ImageProgressStatus::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backend_error_replaces_empty_content() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        fx.backend.fail("c1", "rate limited").await;
        assert_eq!(handle.wait().await, SessionStatus::Errored);

        let records = saved(&mut fx.persist_rx);
        assert_eq!(records[0].content, "**Error:** rate limited");
        assert_eq!(records[0].status, Some(SessionStatus::Errored));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_closing_early_is_an_error() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        fx.backend.emit(EventEnvelope::token("c1", "half")).await;
        fx.backend.close("c1");
        assert_eq!(handle.wait().await, SessionStatus::Errored);

        let content = &saved(&mut fx.persist_rx)[0].content;
        assert!(content.starts_with("half\n\n**Error:**"));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_stream_errors_without_subscription() {
        let mut fx = fixture();
        fx.backend.fail_streams(true);

        let state = SessionState::new("s1", "c1", "a1");
        let request = TurnRequest {
            conversation_id: "c1".to_string(),
            assistant_message_id: "a1".to_string(),
            config: ModelConfig::default(),
            messages: Vec::new(),
            attachments: Vec::new(),
        };
        let (handle, actor) = SessionActor::new(fx.ctx.clone(), state, AbortToken::new(), request, 4);
        fx.ctx.registry.reserve(handle.clone()).unwrap();
        actor.spawn();

        assert_eq!(handle.wait().await, SessionStatus::Errored);
        assert_eq!(saved(&mut fx.persist_rx).len(), 1);
        assert_eq!(fx.backend.detach_count(), 0);
        assert!(fx.ctx.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn get_state_returns_accumulated_partial_results() {
        let fx = fixture();
        let handle = start(&fx, "c1").await;

        fx.backend
            .emit_raw(
                "c1",
                json!({
                    "conversationId": "c1",
                    "kind": "node",
                    "node": "tool_running",
                    "images": [{"url": "a.png"}, {"url": "b.png"}]
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.content, "_Running tools…_\n");
        let urls: Vec<&str> = state.partial.images.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["a.png", "b.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_held_while_awaiting_approval() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        fx.backend
            .emit(EventEnvelope::approval_request(
                "c1",
                Some("m1".to_string()),
                vec![search_call("t1")],
            ))
            .await;
        wait_until(|| fx.ctx.gate.has_pending("c1")).await;
        tokio::task::yield_now().await;
        let _ = flushes(&mut fx.ui_rx);

        fx.backend.emit(EventEnvelope::token("c1", "meanwhile")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(flushes(&mut fx.ui_rx).is_empty());
        assert_eq!(handle.status(), SessionStatus::AwaitingApproval);
        assert!(!handle.snapshot().content.contains("meanwhile"));
        let state = handle.get_state().await.unwrap();
        assert!(state.content.ends_with("meanwhile"));

        fx.ctx.gate.resolve("c1:m1", true, false).await.unwrap();
        fx.backend
            .emit(EventEnvelope::approval_result("c1", true))
            .await;
        wait_until(|| handle.status() == SessionStatus::Streaming).await;

        let patches = flushes(&mut fx.ui_rx);
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0].content,
            Some(ContentPatch::Append("meanwhile".to_string()))
        );
        assert_eq!(patches[0].status, Some(SessionStatus::Streaming));
        assert!(handle.snapshot().content.ends_with("meanwhile"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_approval_request_adds_one_waiting_line() {
        let mut fx = fixture();
        let handle = start(&fx, "c1").await;

        let request = || {
            EventEnvelope::approval_request("c1", Some("m1".to_string()), vec![search_call("t1")])
        };
        fx.backend.emit(request()).await;
        fx.backend.emit(request()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fx.ctx.gate.pending("c1").len(), 1);
        let state = handle.get_state().await.unwrap();
        assert_eq!(state.content, "_Waiting for approval: web_search_\n");

        let surfaced = std::iter::from_fn(|| fx.ui_rx.try_recv().ok())
            .filter(|msg| matches!(msg, ServerMessage::ApprovalSurfaced { .. }))
            .count();
        assert_eq!(surfaced, 1);
    }

    #[test]
    fn handle_debug_names_the_conversation() {
        let (handle, _rx) = SessionActorHandle::detached("s1", "c1");
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("SessionActorHandle"));
        assert!(rendered.contains("c1"));
    }
}
