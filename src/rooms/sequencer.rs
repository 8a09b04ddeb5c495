use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::SequencerConfig,
    db::{self, ContentType},
};

/// A message that has not been given its place in the room yet.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub id: String,
    pub room_id: String,
    pub sender_id: Option<String>,
    pub content_type: ContentType,
    pub content_text: Option<String>,
    pub attachment_id: Option<String>,
    pub payload_json: Option<String>,
    pub created_at: i64,
}

impl MessageDraft {
    pub fn text(room_id: &str, sender_id: &str, content: &str) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            room_id: room_id.to_owned(),
            sender_id: Some(sender_id.to_owned()),
            content_type: ContentType::Text,
            content_text: Some(content.to_owned()),
            attachment_id: None,
            payload_json: None,
            created_at: db::now_ms(),
        }
    }

    pub fn attachment(
        room_id: &str,
        sender_id: &str,
        content_type: ContentType,
        attachment_id: &str,
        payload_json: String,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            room_id: room_id.to_owned(),
            sender_id: Some(sender_id.to_owned()),
            content_type,
            content_text: None,
            attachment_id: Some(attachment_id.to_owned()),
            payload_json: Some(payload_json),
            created_at: db::now_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub room_id: String,
    pub sequence_id: i64,
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum AppendError {
    /// Another writer got to the room first; the attempt can be repeated.
    #[error("sequence conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Storage(sqlx::Error),
}

impl From<sqlx::Error> for AppendError {
    fn from(err: sqlx::Error) -> Self {
        if is_conflict(&err) {
            AppendError::Conflict(err.to_string())
        } else {
            AppendError::Storage(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("message not saved after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },
    #[error("message not saved")]
    Storage(#[source] sqlx::Error),
}

/// Unique violations, plus SQLite's busy/locked results, mean the attempt lost a race.
pub fn is_conflict(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        return false;
    };
    if db_err.is_unique_violation() {
        return true;
    }

    const SQLITE_BUSY: i32 = 5;
    const SQLITE_LOCKED: i32 = 6;
    db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}

/// One attempt at appending a message to its room's log.
#[async_trait]
pub trait MessageLog: Send + Sync {
    async fn append(&self, draft: &MessageDraft) -> Result<StoredMessage, AppendError>;
}

#[derive(Debug, Clone)]
pub struct SqliteMessageLog {
    db_pool: SqlitePool,
}

impl SqliteMessageLog {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl MessageLog for SqliteMessageLog {
    async fn append(&self, draft: &MessageDraft) -> Result<StoredMessage, AppendError> {
        let mut tx = self.db_pool.begin().await?;

        // Writing to the room row first takes the write lock before the tail is read, which
        // is what SELECT ... FOR UPDATE on the newest message would give us elsewhere.
        sqlx::query("UPDATE rooms SET updated_at=? WHERE id=?")
            .bind(draft.created_at)
            .bind(&draft.room_id)
            .execute(&mut *tx)
            .await?;

        let last: Option<(i64,)> =
            sqlx::query_as("SELECT sequence_id FROM messages WHERE room_id=? ORDER BY sequence_id DESC LIMIT 1")
                .bind(&draft.room_id)
                .fetch_optional(&mut *tx)
                .await?;
        let sequence_id = last.map_or(1, |(seq,)| seq + 1);

        sqlx::query(
            "INSERT INTO messages (id,room_id,sender_id,content_type,content_text,attachment_id,payload_json,sequence_id,created_at) \
             VALUES (?,?,?,?,?,?,?,?,?)",
        )
        .bind(&draft.id)
        .bind(&draft.room_id)
        .bind(&draft.sender_id)
        .bind(draft.content_type.as_str())
        .bind(&draft.content_text)
        .bind(&draft.attachment_id)
        .bind(&draft.payload_json)
        .bind(sequence_id)
        .bind(draft.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(StoredMessage {
            id: draft.id.clone(),
            room_id: draft.room_id.clone(),
            sequence_id,
            created_at: draft.created_at,
        })
    }
}

/// Gives each new message the next sequence number in its room, retrying lost races a
/// bounded number of times.
#[derive(Clone)]
pub struct Sequencer {
    log: Arc<dyn MessageLog>,
    cfg: SequencerConfig,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer").field("cfg", &self.cfg).finish_non_exhaustive()
    }
}

impl Sequencer {
    pub fn new(log: Arc<dyn MessageLog>, cfg: SequencerConfig) -> Self {
        Self { log, cfg }
    }

    pub fn sqlite(db_pool: SqlitePool, cfg: SequencerConfig) -> Self {
        Self::new(Arc::new(SqliteMessageLog::new(db_pool)), cfg)
    }

    pub async fn persist(&self, draft: &MessageDraft) -> Result<StoredMessage, SequenceError> {
        let max_attempts = self.cfg.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.log.append(draft).await {
                Ok(stored) => return Ok(stored),
                Err(AppendError::Conflict(reason)) => {
                    debug!(room_id = %draft.room_id, attempt, %reason, "sequence conflict");
                    if attempt < max_attempts {
                        tokio::time::sleep(backoff(self.cfg.backoff_step, attempt)).await;
                    }
                }
                Err(AppendError::Storage(err)) => return Err(SequenceError::Storage(err)),
            }
        }

        warn!(room_id = %draft.room_id, attempts = max_attempts, "giving up on message");
        Err(SequenceError::ExhaustedRetries { attempts: max_attempts })
    }
}

fn backoff(step: Duration, attempt: u32) -> Duration {
    step.saturating_mul(attempt)
}
