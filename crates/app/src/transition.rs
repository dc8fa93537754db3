//! Pure state transition function
//!
//! All interpretation of backend events lives here as a pure, synchronous
//! function: `transition(state, input, token) -> (state, effects)`.
//! No IO, no async, no locking. The session actor performs the effects.

use parley_protocol::{
    EnvelopeEvent, ImageProgress, ImageProgressStatus, MessagePatch, NodeProgress,
    PendingApproval, RiskLevel, SessionStatus, ToolCall,
};
use tracing::debug;

use crate::abort::AbortToken;
use crate::session::SessionState;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    Token(String),
    Node(NodeProgress),
    ApprovalRequested {
        message_id: Option<String>,
        tool_calls: Vec<ToolCall>,
        risk_level: RiskLevel,
    },
    /// The gate queued the request: the turn waits on the user
    ApprovalQueued {
        request_key: String,
        tool_names: Vec<String>,
    },
    /// The gate answered the request itself
    AutoApproved {
        request_key: String,
    },
    ApprovalResult {
        approved: bool,
        message: Option<String>,
        /// Whether the gate still holds requests for this conversation
        still_pending: bool,
    },
    ImageProgress {
        status: ImageProgressStatus,
        progress: Option<f32>,
        message: Option<String>,
    },
    BackendError(String),
    Done,
    /// The subscription ended without a terminal event
    StreamClosed,
    Aborted,
}

impl Input {
    /// Map a validated envelope payload. Approval requests need a resolved
    /// risk level and results need the gate's view, so the caller supplies both.
    pub fn from_event(
        event: EnvelopeEvent,
        default_risk: impl FnOnce(&[ToolCall]) -> RiskLevel,
        still_pending: impl FnOnce() -> bool,
    ) -> Self {
        match event {
            EnvelopeEvent::Token { chunk } => Input::Token(chunk),
            EnvelopeEvent::Node(progress) => Input::Node(progress),
            EnvelopeEvent::ToolApprovalRequest {
                message_id,
                tool_calls,
                risk_level,
            } => {
                let risk_level = risk_level.unwrap_or_else(|| default_risk(&tool_calls));
                Input::ApprovalRequested {
                    message_id,
                    tool_calls,
                    risk_level,
                }
            }
            EnvelopeEvent::ToolApprovalResult { approved, message } => Input::ApprovalResult {
                approved,
                message,
                still_pending: still_pending(),
            },
            EnvelopeEvent::ImageProgress {
                status,
                progress,
                message,
                ..
            } => Input::ImageProgress {
                status,
                progress,
                message,
            },
            EnvelopeEvent::Error { message, code } => Input::BackendError(match code {
                Some(code) => format!("{message} ({code})"),
                None => message,
            }),
            EnvelopeEvent::Done => Input::Done,
        }
    }

    /// Inputs that only carry stream content; ignored once aborted.
    fn is_content(&self) -> bool {
        !matches!(
            self,
            Input::BackendError(_) | Input::Done | Input::StreamClosed | Input::Aborted
        )
    }
}

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Hand a patch to the update scheduler
    Schedule { patch: MessagePatch, force: bool },
    /// Pass a request to the approval gate; the decision comes back as an input
    SubmitApproval(PendingApproval),
    /// Update the side-channel progress record
    ImageProgress(ImageProgress),
    /// Flush, persist, detach and deregister with this terminal status
    Finalize(SessionStatus),
}

// ---------------------------------------------------------------------------
// Content helpers
// ---------------------------------------------------------------------------

/// Human-readable label for an execution-graph node.
pub fn node_label(node: &str) -> String {
    match node.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "planning" | "plan" | "planner" => "Planning…".to_string(),
        "tools" | "tool_running" | "running_tools" | "tool_call" => "Running tools…".to_string(),
        "summarizing" | "summarize" | "summary" => "Summarizing…".to_string(),
        _ => format!("Step: {}", node.trim()),
    }
}

/// A line of status text, starting on its own line.
fn status_line(content: &str, text: &str) -> String {
    let lead = if content.is_empty() || content.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    format!("{lead}_{text}_\n")
}

fn append(state: &mut SessionState, text: String) -> MessagePatch {
    state.content.push_str(&text);
    MessagePatch::append(text)
}

fn finalize(mut state: SessionState, status: SessionStatus) -> (SessionState, Vec<Effect>) {
    state.status = status;
    state.finalized = true;
    (state, vec![Effect::Finalize(status)])
}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

pub fn transition(
    mut state: SessionState,
    input: Input,
    token: &AbortToken,
) -> (SessionState, Vec<Effect>) {
    if state.finalized {
        return (state, vec![]);
    }

    if token.is_aborted() {
        if input.is_content() {
            debug!(
                component = "transition",
                event = "transition.ignored_after_abort",
                conversation_id = %state.conversation_id,
                "Ignoring input for aborted session"
            );
            return (state, vec![]);
        }
        return finalize(state, SessionStatus::Aborted);
    }

    match input {
        Input::Token(chunk) => {
            if chunk.is_empty() {
                return (state, vec![]);
            }
            let patch = append(&mut state, chunk);
            (state, vec![Effect::Schedule { patch, force: false }])
        }

        Input::Node(progress) => {
            let mut label = node_label(&progress.node);
            if let Some(detail) = progress.detail.as_deref().filter(|d| !d.trim().is_empty()) {
                label = format!("{label} ({})", detail.trim());
            }
            let line = status_line(&state.content, &label);
            let mut patch = append(&mut state, line);

            state
                .partial
                .extend(&progress.images, &progress.referenced_documents);
            patch.images = progress.images;
            patch.referenced_documents = progress.referenced_documents;

            (state, vec![Effect::Schedule { patch, force: false }])
        }

        Input::ApprovalRequested {
            message_id,
            tool_calls,
            risk_level,
        } => {
            state.approval_seq += 1;
            let message_id = message_id.unwrap_or_else(|| {
                format!("{}#{}", state.assistant_message_id, state.approval_seq)
            });
            let approval = PendingApproval::new(
                state.conversation_id.clone(),
                message_id,
                tool_calls,
                risk_level,
            );
            (state, vec![Effect::SubmitApproval(approval)])
        }

        Input::ApprovalQueued {
            request_key,
            tool_names,
        } => {
            debug!(
                component = "transition",
                event = "transition.awaiting_approval",
                conversation_id = %state.conversation_id,
                request_key = %request_key,
                "Waiting for approval"
            );
            state.status = SessionStatus::AwaitingApproval;
            let line = status_line(
                &state.content,
                &format!("Waiting for approval: {}", tool_names.join(", ")),
            );
            let patch = append(&mut state, line).with_status(SessionStatus::AwaitingApproval);
            (state, vec![Effect::Schedule { patch, force: true }])
        }

        Input::AutoApproved { request_key } => {
            debug!(
                component = "transition",
                event = "transition.auto_approved",
                conversation_id = %state.conversation_id,
                request_key = %request_key,
                "Tool calls auto-approved"
            );
            (state, vec![])
        }

        Input::ApprovalResult {
            approved,
            message,
            still_pending,
        } => {
            state.status = if still_pending {
                SessionStatus::AwaitingApproval
            } else {
                SessionStatus::Streaming
            };
            let mut patch = if approved {
                MessagePatch::default()
            } else {
                let text = match message.as_deref().filter(|m| !m.trim().is_empty()) {
                    Some(reason) => format!("Tool call rejected: {}", reason.trim()),
                    None => "Tool call rejected".to_string(),
                };
                let line = status_line(&state.content, &text);
                append(&mut state, line)
            };
            patch.status = Some(state.status);
            // resuming releases everything held while waiting
            let force = !still_pending;
            (state, vec![Effect::Schedule { patch, force }])
        }

        Input::ImageProgress {
            status,
            progress,
            message,
        } => {
            let record = ImageProgress {
                conversation_id: state.conversation_id.clone(),
                message_id: state.assistant_message_id.clone(),
                status,
                progress,
                message,
            };
            (state, vec![Effect::ImageProgress(record)])
        }

        Input::BackendError(message) => {
            let summary = format!("**Error:** {message}");
            let patch = if state.content.is_empty() {
                state.content = summary.clone();
                MessagePatch::replace(summary)
            } else {
                let text = format!("\n\n{summary}");
                append(&mut state, text)
            };
            let (state, mut effects) = finalize(state, SessionStatus::Errored);
            effects.insert(0, Effect::Schedule { patch, force: false });
            (state, effects)
        }

        Input::StreamClosed => transition(
            state,
            Input::BackendError("backend stream closed before the turn completed".to_string()),
            token,
        ),

        Input::Done => finalize(state, SessionStatus::Done),

        Input::Aborted => finalize(state, SessionStatus::Aborted),
    }
}
