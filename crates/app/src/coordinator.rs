//! The object callers hold: starts turns, steers them, and owns every piece
//! of shared state (registry, approval gate, progress board, transcripts).

use std::sync::Arc;

use chrono::Utc;
use parley_connector_core::{Backend, TurnRequest};
use parley_protocol::{
    new_id, Attachment, ClientMessage, MessagePatch, MessageRecord, Role, ServerMessage,
    SessionStatus, ToolSchemaRegistry,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::abort::{AbortCoordinator, AbortToken};
use crate::approval::{ApprovalError, ApprovalGate, Resolution};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::history::Transcripts;
use crate::persistence::PersistCommand;
use crate::progress::ProgressBoard;
use crate::registry::SessionRegistry;
use crate::session::SessionState;
use crate::session_actor::{SessionActor, SessionActorHandle, SessionContext};

/// A user turn to start
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub conversation_id: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub system_override: Option<String>,
}

impl TurnInput {
    pub fn new(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }
}

pub struct Coordinator {
    config: CoreConfig,
    ctx: SessionContext,
    aborts: AbortCoordinator,
}

impl Coordinator {
    /// Build a coordinator and the receiver for everything it emits to the UI.
    pub fn new(
        config: CoreConfig,
        backend: Arc<dyn Backend>,
        persist_tx: mpsc::Sender<PersistCommand>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        Self::with_tools(config, backend, persist_tx, ToolSchemaRegistry::builtin())
    }

    pub fn with_tools(
        config: CoreConfig,
        backend: Arc<dyn Backend>,
        persist_tx: mpsc::Sender<PersistCommand>,
        tools: ToolSchemaRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SessionRegistry::new());
        let gate = Arc::new(ApprovalGate::new(
            backend.clone(),
            ui_tx.clone(),
            config.always_approve,
        ));

        let ctx = SessionContext {
            backend: backend.clone(),
            gate,
            registry: registry.clone(),
            progress: Arc::new(ProgressBoard::new()),
            history: Arc::new(Transcripts::new()),
            tools: Arc::new(tools),
            persist_tx,
            ui_tx,
            render_tick: config.render_tick,
        };

        let coordinator = Self {
            aborts: AbortCoordinator::new(registry, backend),
            config,
            ctx,
        };
        (coordinator, ui_rx)
    }

    /// Start an assistant turn. Fails with `SessionBusy` before doing any
    /// work if the conversation already has an active session.
    pub async fn start_turn(&self, input: TurnInput) -> Result<SessionActorHandle, CoreError> {
        let TurnInput {
            conversation_id,
            content,
            attachments,
            system_override,
        } = input;

        let user_message = MessageRecord {
            id: new_id(),
            conversation_id: conversation_id.clone(),
            role: Role::User,
            content,
            created_at: Utc::now(),
            images: Vec::new(),
            referenced_documents: Vec::new(),
            status: None,
        };

        let state = SessionState::new(new_id(), conversation_id.clone(), new_id());
        let mut messages = self.ctx.history.messages(&conversation_id);
        messages.push(user_message.to_chat_message());
        let request = TurnRequest {
            conversation_id: conversation_id.clone(),
            assistant_message_id: state.assistant_message_id.clone(),
            config: self.config.model_config(system_override),
            messages,
            attachments,
        };

        let token = AbortToken::new();
        let (handle, actor) = SessionActor::new(
            self.ctx.clone(),
            state,
            token,
            request,
            self.config.command_capacity,
        );

        if let Err(e) = self.ctx.registry.reserve(handle.clone()) {
            warn!(
                component = "coordinator",
                event = "turn.busy",
                conversation_id = %conversation_id,
                "Turn rejected; conversation already streaming"
            );
            return Err(e);
        }

        let chat_message = user_message.to_chat_message();
        if self
            .ctx
            .persist_tx
            .send(PersistCommand::SaveMessage(user_message))
            .await
            .is_err()
        {
            self.ctx.registry.remove_if(&conversation_id, &handle.id);
            return Err(CoreError::PersistenceClosed);
        }
        self.ctx.history.push(&conversation_id, chat_message);

        let _ = self.ctx.ui_tx.send(ServerMessage::Flush {
            conversation_id: conversation_id.clone(),
            message_id: handle.assistant_message_id.clone(),
            patch: MessagePatch::replace("").with_status(SessionStatus::Streaming),
        });

        actor.spawn();

        info!(
            component = "coordinator",
            event = "turn.started",
            conversation_id = %conversation_id,
            session_id = %handle.id,
            message_id = %handle.assistant_message_id,
            "Turn started"
        );

        Ok(handle)
    }

    /// Abort the active turn of a conversation. `false` when nothing is running.
    pub async fn abort(&self, conversation_id: &str) -> bool {
        self.aborts.abort(conversation_id).await
    }

    pub fn is_aborted(&self, conversation_id: &str) -> bool {
        self.aborts.is_aborted(conversation_id)
    }

    /// Answer an approval. Failures are reported to the UI as a notice and
    /// returned; they never affect the session.
    pub async fn resolve_approval(
        &self,
        request_key: &str,
        approved: bool,
        always_approve: bool,
    ) -> Result<Resolution, ApprovalError> {
        let result = self
            .ctx
            .gate
            .resolve(request_key, approved, always_approve)
            .await;

        if let Err(e) = &result {
            let message = match e {
                ApprovalError::Stale { .. } => "This approval was already handled".to_string(),
                ApprovalError::Upstream(_) => {
                    "Could not deliver the approval, please try again".to_string()
                }
            };
            let _ = self.ctx.ui_tx.send(ServerMessage::Notice {
                conversation_id: None,
                message,
            });
        }

        result
    }

    pub fn set_always_approve(&self, enabled: bool) {
        self.ctx.gate.set_always_approve(enabled);
    }

    pub fn always_approve(&self) -> bool {
        self.ctx.gate.always_approve()
    }

    /// Dispatch a command from the UI.
    pub async fn handle_client_message(&self, message: ClientMessage) {
        match message {
            ClientMessage::StartTurn {
                conversation_id,
                content,
                attachments,
                system_override,
            } => {
                let input = TurnInput {
                    conversation_id: conversation_id.clone(),
                    content,
                    attachments,
                    system_override,
                };
                if let Err(e) = self.start_turn(input).await {
                    let _ = self.ctx.ui_tx.send(ServerMessage::Notice {
                        conversation_id: Some(conversation_id),
                        message: e.to_string(),
                    });
                }
            }

            ClientMessage::Abort { conversation_id } => {
                self.abort(&conversation_id).await;
            }

            ClientMessage::ResolveApproval {
                request_key,
                approved,
                always_approve,
            } => {
                let _ = self
                    .resolve_approval(&request_key, approved, always_approve)
                    .await;
            }

            ClientMessage::SetAlwaysApprove { enabled } => self.set_always_approve(enabled),
        }
    }

    /// Replace a conversation's transcript with stored history.
    pub fn seed_history(&self, conversation_id: &str, records: &[MessageRecord]) {
        self.ctx.history.seed(
            conversation_id,
            records.iter().map(MessageRecord::to_chat_message).collect(),
        );
    }

    pub fn session(&self, conversation_id: &str) -> Option<SessionActorHandle> {
        self.ctx.registry.get(conversation_id)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.ctx.gate
    }

    pub fn progress(&self) -> &ProgressBoard {
        &self.ctx.progress
    }

    pub fn history(&self) -> &Transcripts {
        &self.ctx.history
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}
