//! Persistence layer - batched SQLite writes
//!
//! Uses `spawn_blocking` for async-safe SQLite access.
//! Batches writes so a burst of finalizing sessions costs one transaction.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_protocol::{GeneratedImage, MessageRecord, ReferencedDocument, Role, SessionStatus};
use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Commands that can be persisted
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Write one finished message (user turn or finalized assistant turn)
    SaveMessage(MessageRecord),
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run until every sender is gone, then flush what is left.
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.started",
            db_path = %self.db_path.display(),
            "Persistence writer started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        self.batch.push(cmd);
                        if self.batch.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        info!(
            component = "persistence",
            event = "persistence.stopped",
            "Persistence writer stopped"
        );
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    count = count,
                    "Persisted commands"
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.join_failed",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

/// Flush a batch of commands to SQLite (runs in blocking thread)
fn flush_batch(db_path: &Path, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    let count = batch.len();
    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
                "Failed to execute command"
            );
        }
    }

    tx.commit()?;
    Ok(count)
}

fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::SaveMessage(record) => {
            let images = encode_list(&record.images);
            let documents = encode_list(&record.referenced_documents);

            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), -1) + 1 FROM messages WHERE conversation_id = ?",
                params![record.conversation_id],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO messages (id, conversation_id, role, content, created_at, status, images, referenced_documents, sequence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                   content = ?4,
                   status = ?6,
                   images = ?7,
                   referenced_documents = ?8",
                params![
                    record.id,
                    record.conversation_id,
                    record.role.as_str(),
                    record.content,
                    record.created_at.to_rfc3339(),
                    record.status.map(|s| s.as_str()),
                    images,
                    documents,
                    seq,
                ],
            )?;
        }
    }

    Ok(())
}

fn encode_list<T: serde::Serialize>(items: &[T]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    serde_json::to_string(items).ok()
}

fn decode_list<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Vec<T> {
    raw.and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default()
}

/// Load a conversation's messages in the order they were written.
pub async fn load_conversation(
    db_path: &Path,
    conversation_id: &str,
) -> anyhow::Result<Vec<MessageRecord>> {
    let db_path = db_path.to_path_buf();
    let conversation_id = conversation_id.to_string();

    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<MessageRecord>> {
        if !db_path.exists() {
            return Ok(Vec::new());
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at, status, images, referenced_documents
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence",
        )?;

        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, conversation_id, role, content, created_at, status, images, documents) =
                row?;
            let Some(role) = Role::parse(&role) else {
                warn!(
                    component = "persistence",
                    event = "persistence.unknown_role",
                    message_id = %id,
                    role = %role,
                    "Skipping message with unknown role"
                );
                continue;
            };
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());

            records.push(MessageRecord {
                id,
                conversation_id,
                role,
                content,
                created_at,
                images: decode_list::<GeneratedImage>(images),
                referenced_documents: decode_list::<ReferencedDocument>(documents),
                status: status.as_deref().and_then(SessionStatus::parse),
            });
        }

        Ok(records)
    })
    .await?
}

/// Create a sender for the persistence writer
pub fn create_persistence_channel(
    capacity: usize,
) -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>) {
    mpsc::channel(capacity)
}
