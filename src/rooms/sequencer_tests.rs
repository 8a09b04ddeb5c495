use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::{
    config::SequencerConfig,
    rooms::sequencer::{
        is_conflict, AppendError, MessageDraft, MessageLog, SequenceError, Sequencer, SqliteMessageLog,
        StoredMessage,
    },
    test_support,
};

const SENDERS: usize = 16;

fn fast_retries() -> SequencerConfig {
    SequencerConfig {
        max_attempts: 3,
        backoff_step: Duration::from_millis(1),
    }
}

/// Loses the race on the first attempt of every draft, then behaves.
struct FlakyLog {
    inner: SqliteMessageLog,
    seen: Mutex<HashSet<String>>,
    attempts: AtomicU32,
}

#[async_trait]
impl MessageLog for FlakyLog {
    async fn append(&self, draft: &MessageDraft) -> Result<StoredMessage, AppendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let first_try = self.seen.lock().expect("lock").insert(draft.id.clone());
        if first_try {
            return Err(AppendError::Conflict("injected".to_owned()));
        }
        self.inner.append(draft).await
    }
}

/// Fails every attempt the same way.
struct BrokenLog {
    conflict: bool,
    attempts: AtomicU32,
}

#[async_trait]
impl MessageLog for BrokenLog {
    async fn append(&self, _draft: &MessageDraft) -> Result<StoredMessage, AppendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.conflict {
            Err(AppendError::Conflict("always".to_owned()))
        } else {
            Err(AppendError::Storage(sqlx::Error::PoolClosed))
        }
    }
}

async fn stored_sequences(db_pool: &SqlitePool, room_id: &str) -> Vec<i64> {
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT sequence_id FROM messages WHERE room_id=? ORDER BY created_at, sequence_id")
        .bind(room_id)
        .fetch_all(db_pool)
        .await
        .expect("read sequences");
    rows.into_iter().map(|(seq,)| seq).collect()
}

async fn send_concurrently(sequencer: &Sequencer, room_id: &str, senders: usize) -> Vec<i64> {
    let mut tasks = Vec::with_capacity(senders);
    for n in 0..senders {
        let sequencer = sequencer.clone();
        let draft = MessageDraft::text(room_id, &format!("sender-{n}"), &format!("message {n}"));
        tasks.push(tokio::spawn(async move { sequencer.persist(&draft).await }));
    }

    let mut sequences = Vec::with_capacity(senders);
    for task in tasks {
        let stored = task.await.expect("task").expect("persisted");
        sequences.push(stored.sequence_id);
    }
    sequences.sort_unstable();
    sequences
}

#[tokio::test]
async fn first_message_in_a_room_gets_one() {
    let db_pool = test_support::pool().await;
    let room_a = test_support::group(&db_pool, "owner", &["owner"]).await;
    let room_b = test_support::group(&db_pool, "owner", &["owner"]).await;
    let sequencer = Sequencer::sqlite(db_pool.clone(), fast_retries());

    for expected in 1..=3 {
        let stored = sequencer
            .persist(&MessageDraft::text(&room_a, "owner", "hi"))
            .await
            .expect("persisted");
        assert_eq!(stored.sequence_id, expected);
    }

    // sequences are per room
    let stored = sequencer
        .persist(&MessageDraft::text(&room_b, "owner", "hi"))
        .await
        .expect("persisted");
    assert_eq!(stored.sequence_id, 1);
}

#[tokio::test]
async fn concurrent_senders_get_distinct_sequences() {
    let db_pool = test_support::pool().await;
    let room_id = test_support::group(&db_pool, "owner", &["owner"]).await;
    let sequencer = Sequencer::sqlite(db_pool.clone(), fast_retries());

    let sequences = send_concurrently(&sequencer, &room_id, SENDERS).await;

    let expected: Vec<i64> = (1..=SENDERS as i64).collect();
    assert_eq!(sequences, expected);

    let mut stored = stored_sequences(&db_pool, &room_id).await;
    stored.sort_unstable();
    assert_eq!(stored, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writers_on_separate_connections_never_share_a_sequence() {
    const WRITERS: usize = 64;
    let dir = tempfile::tempdir().expect("create temp dir");
    let db_pool = test_support::file_pool(&dir.path().join("chat.db"), 16).await;
    let room_id = test_support::group(&db_pool, "owner", &["owner"]).await;
    let sequencer = Sequencer::sqlite(
        db_pool.clone(),
        SequencerConfig {
            max_attempts: 5,
            backoff_step: Duration::from_millis(2),
        },
    );

    let sequences = send_concurrently(&sequencer, &room_id, WRITERS).await;

    let expected: Vec<i64> = (1..=WRITERS as i64).collect();
    assert_eq!(sequences, expected);

    let mut stored = stored_sequences(&db_pool, &room_id).await;
    stored.sort_unstable();
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn injected_conflicts_are_retried_without_collisions() {
    let db_pool = test_support::pool().await;
    let room_id = test_support::group(&db_pool, "owner", &["owner"]).await;
    let log = Arc::new(FlakyLog {
        inner: SqliteMessageLog::new(db_pool.clone()),
        seen: Mutex::new(HashSet::new()),
        attempts: AtomicU32::new(0),
    });
    let sequencer = Sequencer::new(log.clone(), fast_retries());

    let sequences = send_concurrently(&sequencer, &room_id, SENDERS).await;

    let expected: Vec<i64> = (1..=SENDERS as i64).collect();
    assert_eq!(sequences, expected);
    assert_eq!(log.attempts.load(Ordering::SeqCst), 2 * SENDERS as u32);
}

#[tokio::test]
async fn retries_are_bounded() {
    let log = Arc::new(BrokenLog {
        conflict: true,
        attempts: AtomicU32::new(0),
    });
    let sequencer = Sequencer::new(log.clone(), fast_retries());

    let err = sequencer
        .persist(&MessageDraft::text("room", "alice", "hi"))
        .await
        .expect_err("never persisted");

    assert!(matches!(err, SequenceError::ExhaustedRetries { attempts: 3 }), "got {err:?}");
    assert_eq!(log.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn storage_failures_are_not_retried() {
    let log = Arc::new(BrokenLog {
        conflict: false,
        attempts: AtomicU32::new(0),
    });
    let sequencer = Sequencer::new(log.clone(), fast_retries());

    let err = sequencer
        .persist(&MessageDraft::text("room", "alice", "hi"))
        .await
        .expect_err("never persisted");

    assert!(matches!(err, SequenceError::Storage(_)), "got {err:?}");
    assert_eq!(log.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_sequence_is_classified_as_a_conflict() {
    let db_pool = test_support::pool().await;
    let room_id = test_support::group(&db_pool, "owner", &["owner"]).await;
    test_support::message_at(&db_pool, &room_id, "owner", 1, 1_000).await;

    let err = sqlx::query(
        "INSERT INTO messages (id,room_id,sender_id,content_type,content_text,sequence_id,created_at) \
         VALUES ('dup',?,'owner','text','again',1,2000)",
    )
    .bind(&room_id)
    .execute(&db_pool)
    .await
    .expect_err("unique index rejects the duplicate");

    assert!(is_conflict(&err));
    assert!(!is_conflict(&sqlx::Error::RowNotFound));
    assert!(matches!(AppendError::from(err), AppendError::Conflict(_)));
}
