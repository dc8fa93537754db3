//! Parley CLI
//!
//! Runs one assistant turn against a backend process, renders the streamed
//! reply, and asks on stdin whenever the backend wants to run tools.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use parley::coordinator::{Coordinator, TurnInput};
use parley::persistence::{create_persistence_channel, load_conversation, PersistenceWriter};
use parley::{logging, migration_runner, paths, CoreConfig};
use parley_connectors::{ProcessConfig, ProcessConnector};
use parley_protocol::{
    new_id, Attachment, ContentPatch, PendingApproval, ServerMessage, SessionStatus,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Stream an assistant turn with tool approval")]
struct Cli {
    /// Data directory (database and logs)
    #[arg(long, global = true, env = "PARLEY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    log: logging::LogOptions,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message and stream the reply
    Run {
        /// Message to send
        message: String,

        /// Conversation to continue (a new one is created when omitted)
        #[arg(long, short)]
        conversation: Option<String>,

        /// Backend program speaking NDJSON envelopes on stdio
        #[arg(long, env = "PARLEY_BACKEND")]
        backend: String,

        /// Extra argument for the backend program (repeatable)
        #[arg(long = "backend-arg", allow_hyphen_values = true)]
        backend_args: Vec<String>,

        #[arg(long, env = "PARLEY_MODEL")]
        model: Option<String>,

        /// System prompt for this turn
        #[arg(long, env = "PARLEY_SYSTEM_PROMPT")]
        system: Option<String>,

        /// File to attach (repeatable)
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,

        #[arg(long, env = "PARLEY_RENDER_TICK_MS", default_value_t = 16)]
        render_tick_ms: u64,

        /// Approve every tool call without asking
        #[arg(long)]
        always_approve: bool,
    },

    /// Print a stored conversation
    History { conversation: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = paths::init_data_dir(cli.data_dir.as_deref())?;
    paths::ensure_dirs()?;
    let logging = logging::init_logging(&paths::log_dir(), &cli.log)?;

    info!(
        component = "cli",
        event = "cli.started",
        run_id = %logging.run_id,
        data_dir = %data_dir.display(),
        "Parley starting"
    );

    let db_path = paths::db_path();
    migration_runner::open_database(&db_path)?;

    match cli.command {
        Command::History { conversation } => print_history(&db_path, &conversation).await,
        Command::Run {
            message,
            conversation,
            backend,
            backend_args,
            model,
            system,
            attachments,
            render_tick_ms,
            always_approve,
        } => {
            let mut process = ProcessConfig::new(backend);
            for arg in backend_args {
                process = process.arg(arg);
            }
            let config = CoreConfig {
                render_tick: Duration::from_millis(render_tick_ms),
                model,
                system_prompt: system,
                always_approve,
                ..Default::default()
            };
            let input = TurnInput {
                conversation_id: conversation.unwrap_or_else(new_id),
                content: message,
                attachments: attachments.iter().map(|path| attachment(path)).collect(),
                system_override: None,
            };
            run_turn(db_path, process, config, input).await
        }
    }
}

fn attachment(path: &Path) -> Attachment {
    Attachment {
        name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
        path: path.display().to_string(),
        mime_type: None,
    }
}

async fn print_history(db_path: &Path, conversation_id: &str) -> anyhow::Result<()> {
    let records = load_conversation(db_path, conversation_id).await?;
    if records.is_empty() {
        eprintln!("No messages for conversation {conversation_id}");
        return Ok(());
    }
    for record in records {
        let status = record
            .status
            .map(|s| format!(" ({})", s.as_str()))
            .unwrap_or_default();
        println!("[{}{}]\n{}\n", record.role.as_str(), status, record.content);
    }
    Ok(())
}

async fn run_turn(
    db_path: PathBuf,
    process: ProcessConfig,
    config: CoreConfig,
    input: TurnInput,
) -> anyhow::Result<()> {
    let (persist_tx, persist_rx) = create_persistence_channel(config.persist_capacity);
    let writer = tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

    let connector = Arc::new(ProcessConnector::spawn(process)?);
    let (coordinator, mut ui_rx) = Coordinator::new(config, connector.clone(), persist_tx);

    let conversation_id = input.conversation_id.clone();
    let stored = load_conversation(&db_path, &conversation_id).await?;
    coordinator.seed_history(&conversation_id, &stored);

    let handle = coordinator.start_turn(input).await?;
    eprintln!("conversation {conversation_id}");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut asking: Option<PendingApproval> = None;
    let mut aborting = false;

    loop {
        tokio::select! {
            msg = ui_rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    ServerMessage::Flush { patch, .. } => render(patch.content),
                    ServerMessage::ApprovalSurfaced { approval } => {
                        prompt(&approval);
                        asking = Some(approval);
                    }
                    ServerMessage::ApprovalCleared { request_key, .. } => {
                        if asking.as_ref().is_some_and(|a| a.request_key == request_key) {
                            asking = None;
                        }
                    }
                    ServerMessage::ImageProgress { progress } => {
                        eprintln!("[image {:?}]", progress.status);
                    }
                    ServerMessage::Notice { message, .. } => eprintln!("! {message}"),
                    ServerMessage::SessionFinished { conversation_id: finished, status, .. } => {
                        if finished == conversation_id {
                            println!();
                            if status != SessionStatus::Done {
                                eprintln!("turn {}", status.as_str());
                            }
                            break;
                        }
                    }
                }
            }

            line = stdin.next_line(), if asking.is_some() => {
                let Some(approval) = asking.take() else { continue };
                let answer = line.ok().flatten().unwrap_or_default();
                let (approved, always) = parse_answer(&answer);
                if let Err(e) = coordinator
                    .resolve_approval(&approval.request_key, approved, always)
                    .await
                {
                    warn!(
                        component = "cli",
                        event = "cli.approval_failed",
                        request_key = %approval.request_key,
                        error = %e,
                        "Approval not delivered"
                    );
                }
            }

            _ = tokio::signal::ctrl_c(), if !aborting => {
                aborting = true;
                eprintln!("\naborting…");
                coordinator.abort(&conversation_id).await;
            }
        }
    }

    let status = handle.wait().await;
    drop(coordinator);
    drop(handle);
    if let Err(e) = writer.await {
        warn!(
            component = "cli",
            event = "cli.writer_join_failed",
            error = %e,
            "Persistence writer did not shut down cleanly"
        );
    }
    connector.shutdown().await?;

    info!(
        component = "cli",
        event = "cli.finished",
        conversation_id = %conversation_id,
        status = status.as_str(),
        "Turn finished"
    );

    if status == SessionStatus::Errored {
        anyhow::bail!("turn failed");
    }
    Ok(())
}

fn render(content: Option<ContentPatch>) {
    let text = match content {
        Some(ContentPatch::Append(text)) => text,
        Some(ContentPatch::Replace(text)) if !text.is_empty() => format!("\n{text}"),
        _ => return,
    };
    print!("{text}");
    let _ = std::io::stdout().flush();
}

fn prompt(approval: &PendingApproval) {
    eprintln!();
    for call in &approval.tool_calls {
        let arguments = serde_json::to_string(&call.arguments).unwrap_or_default();
        eprintln!("  {} {}", call.name, arguments);
    }
    eprint!(
        "Run {} ({:?} risk)? [y]es / [n]o / [a]lways: ",
        approval.tool_names().join(", "),
        approval.risk_level
    );
    let _ = std::io::stderr().flush();
}

fn parse_answer(answer: &str) -> (bool, bool) {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => (true, false),
        "a" | "always" => (true, true),
        _ => (false, false),
    }
}
