use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use concierge_config::OverflowPolicy;
use concierge_contracts::ConversationRecord;
use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::LogError;

/// Durable destination of conversation records.
#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn log_conversation(&self, record: &ConversationRecord) -> Result<(), LogError>;
}

/// Append-only JSON lines, optionally mirrored into a SQLite `conversations` table.
pub struct JsonlConversationSink {
    file: Mutex<tokio::fs::File>,
    sqlite: Option<Mutex<Connection>>,
}

#[derive(Serialize)]
struct LoggedConversation<'a> {
    record_id: String,
    #[serde(flatten)]
    record: &'a ConversationRecord,
}

impl JsonlConversationSink {
    pub async fn open(path: &str, sqlite_path: Option<&str>) -> Result<Self, LogError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let sqlite = match sqlite_path {
            Some(path) if !path.is_empty() => {
                let conn = Connection::open(path)?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS conversations (
                        record_id TEXT PRIMARY KEY,
                        tenant_id TEXT NOT NULL,
                        sender_id TEXT NOT NULL,
                        request_text TEXT NOT NULL,
                        response_text TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS conversations_tenant
                        ON conversations(tenant_id, created_at);
                    ",
                )?;
                Some(Mutex::new(conn))
            }
            _ => None,
        };

        Ok(Self {
            file: Mutex::new(file),
            sqlite,
        })
    }
}

#[async_trait]
impl ConversationSink for JsonlConversationSink {
    async fn log_conversation(&self, record: &ConversationRecord) -> Result<(), LogError> {
        let logged = LoggedConversation {
            record_id: format!("conv_{}", uuid::Uuid::new_v4().as_simple()),
            record,
        };
        let mut line = serde_json::to_string(&logged)?;
        line.push('\n');
        {
            let mut file = self.file.lock().await;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }

        if let Some(sqlite) = &self.sqlite {
            let conn = sqlite.lock().await;
            conn.execute(
                "
                INSERT OR REPLACE INTO conversations
                (record_id, tenant_id, sender_id, request_text, response_text, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    logged.record_id,
                    record.tenant_id,
                    record.sender_id,
                    record.request_text,
                    record.response_text,
                    record.created_at.to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoggerStats {
    pub submitted: u64,
    pub rejected: u64,
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
}

/// Bounded queue drained by a fixed pool of workers. Submitting never performs the
/// write itself, and a write failure never reaches the submitter.
pub struct ConversationLogger {
    tx: mpsc::Sender<ConversationRecord>,
    overflow: OverflowPolicy,
    counters: Arc<Counters>,
}

impl ConversationLogger {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(
        sink: Arc<dyn ConversationSink>,
        capacity: usize,
        workers: usize,
        overflow: OverflowPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let sink = sink.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(record) = next else {
                        break;
                    };
                    match sink.log_conversation(&record).await {
                        Ok(()) => {
                            counters.written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                worker,
                                tenant_id = %record.tenant_id,
                                sender_id = %record.sender_id,
                                error = %err,
                                "conversation log write failed"
                            );
                        }
                    }
                }
                debug!(worker, "conversation log worker stopped");
            });
        }

        Self {
            tx,
            overflow,
            counters,
        }
    }

    /// Queue a record for writing without waiting. Returns false when the record was
    /// dropped. Under `Block` a full queue hands the record to a detached task that
    /// waits for capacity, so the caller still returns immediately.
    pub fn submit(&self, record: ConversationRecord) -> bool {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let record = match self.tx.try_send(record) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => {
                warn!("conversation log workers gone, record dropped");
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            Err(TrySendError::Full(record)) => record,
        };
        match self.overflow {
            OverflowPolicy::Reject => {
                warn!(
                    tenant_id = %record.tenant_id,
                    sender_id = %record.sender_id,
                    "conversation log queue full, record dropped"
                );
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            OverflowPolicy::Block => {
                let tx = self.tx.clone();
                let counters = self.counters.clone();
                tokio::spawn(async move {
                    if tx.send(record).await.is_err() {
                        warn!("conversation log workers gone, record dropped");
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                    }
                });
                true
            }
        }
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}
