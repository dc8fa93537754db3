//! Subprocess connector
//!
//! Spawns an agent runtime and talks NDJSON over stdin/stdout.
//!
//! Stdin (core → runtime), one JSON object per line:
//!   {"type":"turn","request":{...TurnRequest}}
//!   {"type":"abort","conversationId":"..."}
//!   {"type":"tool_approval_response","conversationId":"...","approved":true}
//!
//! Stdout (runtime → core):
//!   {"type":"event","envelope":{...}}
//!   {"type":"done","conversationId":"..."}
//!   {"type":"error","conversationId":"...","message":"..."}
//!
//! Every open subscription receives every envelope; sessions drop the ones
//! that belong to other conversations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use parley_connector_core::{
    Backend, BackendSignal, ConnectorError, DetachHandle, Subscription, TurnRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const SIGNAL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage<'a> {
    Turn {
        request: &'a TurnRequest,
    },
    Abort {
        #[serde(rename = "conversationId")]
        conversation_id: &'a str,
    },
    ToolApprovalResponse {
        #[serde(rename = "conversationId")]
        conversation_id: &'a str,
        approved: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdoutMessage {
    Event {
        envelope: Value,
    },
    Done {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Error {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Event,
    Done,
    Error,
}

struct Listener {
    conversation_id: String,
    tx: mpsc::Sender<BackendSignal>,
    events: bool,
    done: bool,
    error: bool,
}

impl Listener {
    fn detached(&self) -> bool {
        !self.events && !self.done && !self.error
    }
}

/// Fan-out of stdout signals to open subscriptions, plus the count of
/// approval requests each conversation is still waiting on.
#[derive(Default)]
struct Router {
    next_id: u64,
    listeners: HashMap<u64, Listener>,
    outstanding: HashMap<String, usize>,
    closed: bool,
}

type Deliveries = Vec<(mpsc::Sender<BackendSignal>, BackendSignal)>;

impl Router {
    fn register(&mut self, conversation_id: &str) -> (u64, mpsc::Receiver<BackendSignal>) {
        let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
        self.next_id += 1;
        let id = self.next_id;
        self.listeners.insert(
            id,
            Listener {
                conversation_id: conversation_id.to_string(),
                tx,
                events: true,
                done: true,
                error: true,
            },
        );
        (id, rx)
    }

    fn detach(&mut self, id: u64, channel: Channel) {
        let Some(listener) = self.listeners.get_mut(&id) else {
            return;
        };
        match channel {
            Channel::Event => listener.events = false,
            Channel::Done => listener.done = false,
            Channel::Error => listener.error = false,
        }
        if listener.detached() {
            self.listeners.remove(&id);
        }
    }

    fn route(&mut self, message: StdoutMessage) -> Deliveries {
        match message {
            StdoutMessage::Event { envelope } => {
                if envelope.get("kind").and_then(Value::as_str) == Some("tool_approval_request") {
                    if let Some(conversation_id) =
                        envelope.get("conversationId").and_then(Value::as_str)
                    {
                        *self
                            .outstanding
                            .entry(conversation_id.to_string())
                            .or_default() += 1;
                    }
                }
                self.listeners
                    .values()
                    .filter(|l| l.events)
                    .map(|l| (l.tx.clone(), BackendSignal::Event(envelope.clone())))
                    .collect()
            }
            StdoutMessage::Done { conversation_id } => {
                self.outstanding.remove(&conversation_id);
                self.listeners
                    .values()
                    .filter(|l| l.done && l.conversation_id == conversation_id)
                    .map(|l| {
                        (
                            l.tx.clone(),
                            BackendSignal::Done {
                                conversation_id: conversation_id.clone(),
                            },
                        )
                    })
                    .collect()
            }
            StdoutMessage::Error {
                conversation_id,
                message,
            } => {
                self.outstanding.remove(&conversation_id);
                self.listeners
                    .values()
                    .filter(|l| l.error && l.conversation_id == conversation_id)
                    .map(|l| {
                        (
                            l.tx.clone(),
                            BackendSignal::Error {
                                conversation_id: conversation_id.clone(),
                                message: message.clone(),
                            },
                        )
                    })
                    .collect()
            }
        }
    }

    /// The runtime went away: fail every subscription still listening for errors.
    fn close(&mut self, reason: &str) -> Deliveries {
        self.closed = true;
        self.outstanding.clear();
        self.listeners
            .values()
            .filter(|l| l.error)
            .map(|l| {
                (
                    l.tx.clone(),
                    BackendSignal::Error {
                        conversation_id: l.conversation_id.clone(),
                        message: reason.to_string(),
                    },
                )
            })
            .collect()
    }

    fn take_outstanding(&mut self, conversation_id: &str) -> bool {
        match self.outstanding.get_mut(conversation_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.outstanding.remove(conversation_id);
                }
                true
            }
            _ => false,
        }
    }

    fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

async fn deliver(deliveries: Deliveries) {
    for (tx, signal) in deliveries {
        if tx.send(signal).await.is_err() {
            debug!(
                component = "process_connector",
                event = "process.subscriber_gone",
                "Subscriber dropped before delivery"
            );
        }
    }
}

fn lock(router: &Mutex<Router>) -> std::sync::MutexGuard<'_, Router> {
    router.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// ProcessConnector
// ---------------------------------------------------------------------------

/// How to launch the agent runtime
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

pub struct ProcessConnector {
    stdin_tx: mpsc::Sender<String>,
    child: tokio::sync::Mutex<Child>,
    router: Arc<Mutex<Router>>,
}

impl ProcessConnector {
    /// Spawn the runtime and start the reader/writer tasks.
    pub fn spawn(config: ProcessConfig) -> Result<Self, ConnectorError> {
        info!(
            component = "process_connector",
            event = "process.spawn",
            program = %config.program,
            args = ?config.args,
            "Spawning agent runtime"
        );

        let mut command = tokio::process::Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            ConnectorError::Spawn(format!("Failed to spawn {}: {}", config.program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::Spawn("No stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::Spawn("No stdout on child".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "process_connector",
                        event = "process.stderr",
                        line = %line,
                        "Runtime stderr"
                    );
                }
            });
        }

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(SIGNAL_CAPACITY);
        tokio::spawn(Self::stdin_writer(stdin, stdin_rx));

        let router = Arc::new(Mutex::new(Router::default()));
        tokio::spawn(Self::event_loop(stdout, router.clone()));

        Ok(Self {
            stdin_tx,
            child: tokio::sync::Mutex::new(child),
            router,
        })
    }

    /// Kill the runtime.
    pub async fn shutdown(&self) -> Result<(), ConnectorError> {
        let mut child = self.child.lock().await;
        child.kill().await?;
        Ok(())
    }

    async fn write_stdin_message(&self, msg: &StdinMessage<'_>) -> Result<(), ConnectorError> {
        let json = serde_json::to_string(msg)?;

        debug!(
            component = "process_connector",
            event = "process.stdin.write",
            payload_len = json.len(),
            "Writing to runtime stdin"
        );

        self.stdin_tx
            .send(json)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }

    async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!(
                    component = "process_connector",
                    event = "process.stdin.write_error",
                    error = %e,
                    "Failed to write to runtime stdin"
                );
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!(
                    component = "process_connector",
                    event = "process.stdin.flush_error",
                    error = %e,
                    "Failed to flush runtime stdin"
                );
                break;
            }
        }
        debug!(
            component = "process_connector",
            event = "process.stdin.closed",
            "Stdin writer task ended"
        );
    }

    async fn event_loop(stdout: tokio::process::ChildStdout, router: Arc<Mutex<Router>>) {
        let mut lines = BufReader::new(stdout).lines();

        let reason = loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let message: StdoutMessage = match serde_json::from_str(line) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(
                                component = "process_connector",
                                event = "process.stdout.parse_error",
                                error = %e,
                                line_preview = %line.chars().take(200).collect::<String>(),
                                "Failed to parse runtime stdout line"
                            );
                            continue;
                        }
                    };
                    let deliveries = lock(&router).route(message);
                    deliver(deliveries).await;
                }
                Ok(None) => {
                    info!(
                        component = "process_connector",
                        event = "process.stdout.eof",
                        "Runtime stdout EOF"
                    );
                    break "agent runtime exited".to_string();
                }
                Err(e) => {
                    error!(
                        component = "process_connector",
                        event = "process.stdout.read_error",
                        error = %e,
                        "Error reading runtime stdout"
                    );
                    break format!("read error: {e}");
                }
            }
        };

        let deliveries = lock(&router).close(&reason);
        deliver(deliveries).await;
    }

    fn detach_handle(&self, label: &'static str, id: u64, channel: Channel) -> DetachHandle {
        let router = self.router.clone();
        DetachHandle::new(label, move || lock(&router).detach(id, channel))
    }
}

#[async_trait]
impl Backend for ProcessConnector {
    async fn stream(&self, request: TurnRequest) -> Result<Subscription, ConnectorError> {
        let (id, rx) = {
            let mut router = lock(&self.router);
            if router.closed {
                return Err(ConnectorError::ChannelClosed);
            }
            router.register(&request.conversation_id)
        };

        let subscription = Subscription::from_receiver(rx).with_handles(
            self.detach_handle("on_event", id, Channel::Event),
            self.detach_handle("on_done", id, Channel::Done),
            self.detach_handle("on_error", id, Channel::Error),
        );

        if let Err(e) = self
            .write_stdin_message(&StdinMessage::Turn { request: &request })
            .await
        {
            subscription.detach();
            return Err(e);
        }

        debug!(
            component = "process_connector",
            event = "process.turn.started",
            conversation_id = %request.conversation_id,
            subscribers = lock(&self.router).listener_count(),
            "Turn request sent"
        );

        Ok(subscription)
    }

    async fn abort(&self, conversation_id: &str) -> Result<(), ConnectorError> {
        self.write_stdin_message(&StdinMessage::Abort { conversation_id })
            .await
    }

    async fn respond_tool_approval(
        &self,
        conversation_id: &str,
        approved: bool,
    ) -> Result<(), ConnectorError> {
        if !lock(&self.router).take_outstanding(conversation_id) {
            return Err(ConnectorError::NoPendingApproval(
                conversation_id.to_string(),
            ));
        }
        self.write_stdin_message(&StdinMessage::ToolApprovalResponse {
            conversation_id,
            approved,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> StdoutMessage {
        StdoutMessage::Event { envelope: value }
    }

    #[tokio::test]
    async fn events_fan_out_to_every_listener() {
        let mut router = Router::default();
        let (_a, mut rx_a) = router.register("c1");
        let (_b, mut rx_b) = router.register("c2");

        let deliveries = router.route(event(json!({
            "conversationId": "c1", "kind": "token", "chunk": "hi"
        })));
        assert_eq!(deliveries.len(), 2);
        deliver(deliveries).await;

        assert!(matches!(rx_a.recv().await, Some(BackendSignal::Event(_))));
        assert!(matches!(rx_b.recv().await, Some(BackendSignal::Event(_))));
    }

    #[test]
    fn done_only_reaches_its_conversation() {
        let mut router = Router::default();
        router.register("c1");
        router.register("c2");

        let deliveries = router.route(StdoutMessage::Done {
            conversation_id: "c2".to_string(),
        });
        assert_eq!(deliveries.len(), 1);
        assert_eq!(
            deliveries[0].1,
            BackendSignal::Done {
                conversation_id: "c2".to_string()
            }
        );
    }

    #[test]
    fn listener_is_removed_once_every_handle_detached() {
        let mut router = Router::default();
        let (id, _rx) = router.register("c1");

        router.detach(id, Channel::Event);
        assert!(router
            .route(event(json!({"conversationId": "c1", "kind": "done"})))
            .is_empty());
        assert_eq!(router.listener_count(), 1);

        router.detach(id, Channel::Done);
        router.detach(id, Channel::Error);
        assert_eq!(router.listener_count(), 0);
    }

    #[test]
    fn approval_responses_require_an_outstanding_request() {
        let mut router = Router::default();
        assert!(!router.take_outstanding("c1"));

        router.route(event(json!({
            "conversationId": "c1",
            "kind": "tool_approval_request",
            "toolCalls": [{"id": "t1", "name": "web_search", "arguments": {"query": "x"}}]
        })));
        assert!(router.take_outstanding("c1"));
        assert!(!router.take_outstanding("c1"));
    }

    #[test]
    fn close_fails_listeners_still_waiting_for_errors() {
        let mut router = Router::default();
        let (id, _rx) = router.register("c1");
        router.register("c2");
        router.detach(id, Channel::Error);

        let deliveries = router.close("agent runtime exited");
        assert_eq!(deliveries.len(), 1);
        assert!(router.closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_round_trip_over_stdio() {
        let script = r#"read line; printf '%s\n' '{"type":"event","envelope":{"conversationId":"c1","kind":"token","chunk":"hi"}}' '{"type":"done","conversationId":"c1"}'; sleep 1"#;
        let connector = ProcessConnector::spawn(ProcessConfig::new("sh").arg("-c").arg(script))
            .expect("spawn sh");

        let mut subscription = connector
            .stream(TurnRequest {
                conversation_id: "c1".to_string(),
                assistant_message_id: "m1".to_string(),
                config: Default::default(),
                messages: Vec::new(),
                attachments: Vec::new(),
            })
            .await
            .expect("stream");

        assert_eq!(
            subscription.next().await,
            Some(BackendSignal::Event(json!({
                "conversationId": "c1", "kind": "token", "chunk": "hi"
            })))
        );
        assert_eq!(
            subscription.next().await,
            Some(BackendSignal::Done {
                conversation_id: "c1".to_string()
            })
        );

        subscription.detach();
        assert_eq!(lock(&connector.router).listener_count(), 0);
        connector.shutdown().await.expect("shutdown");
    }
}
