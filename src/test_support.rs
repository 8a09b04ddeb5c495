//! Fixtures for tests that need a database: an in-memory SQLite pool with the schema applied,
//! plus seeders for the rows other services would normally own.

use std::{path::Path, time::Duration};

use axum::extract::ws::Utf8Bytes;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    config::Config,
    db,
    rooms::hub::{ConnId, ConnectionHandle, Hub},
    AppState,
};

pub async fn pool() -> SqlitePool {
    // one connection, kept forever: each in-memory connection is its own database
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    db::migrate(&db_pool).await.expect("apply migrations");
    db_pool
}

/// A database file shared by up to `max_connections` connections, for tests where writers must
/// actually contend for the lock.
pub async fn file_pool(path: &Path, max_connections: u32) -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .expect("open sqlite file");
    db::migrate(&db_pool).await.expect("apply migrations");
    db_pool
}

/// Application state over a fresh database with a running hub and default limits.
pub async fn state() -> AppState {
    let config = Config::from_lookup(|_| None).expect("default config");
    AppState::new(pool().await, config)
}

/// Registers a stand-in connection for `user_id` and hands back the receiving end of its queue.
pub async fn connect(hub: &Hub, user_id: &str, capacity: usize) -> (ConnId, mpsc::Receiver<Utf8Bytes>) {
    let (queue, rx) = mpsc::channel(capacity);
    let id = ConnId::new();
    hub.register(ConnectionHandle {
        id,
        user_id: user_id.to_owned(),
        queue,
    })
    .await;
    (id, rx)
}

pub async fn befriend(db_pool: &SqlitePool, a: &str, b: &str) {
    let (x, y) = db::canonical_pair(a, b);
    sqlx::query("INSERT INTO friendships (id,user_id_a,user_id_b,created_at) VALUES (?,?,?,?)")
        .bind(Uuid::now_v7().to_string())
        .bind(x)
        .bind(y)
        .bind(db::now_ms())
        .execute(db_pool)
        .await
        .expect("insert friendship");
}

/// Creates a group owned by `owner` with every listed user as an active member.
pub async fn group(db_pool: &SqlitePool, owner: &str, members: &[&str]) -> String {
    let room_id = Uuid::now_v7().to_string();
    let now = db::now_ms();
    sqlx::query("INSERT INTO rooms (id,room_type,name,owner_user_id,created_at,updated_at) VALUES (?,'group',?,?,?,?)")
        .bind(&room_id)
        .bind(format!("{owner}'s group"))
        .bind(owner)
        .bind(now)
        .bind(now)
        .execute(db_pool)
        .await
        .expect("insert group");

    for member in members {
        add_member(db_pool, &room_id, member, None, None).await;
    }
    room_id
}

pub async fn add_member(db_pool: &SqlitePool, room_id: &str, user_id: &str, left_at: Option<i64>, mute_until: Option<i64>) {
    sqlx::query("INSERT INTO room_members (room_id,user_id,role,joined_at,left_at,mute_until) VALUES (?,?,'member',?,?,?)")
        .bind(room_id)
        .bind(user_id)
        .bind(db::now_ms())
        .bind(left_at)
        .bind(mute_until)
        .execute(db_pool)
        .await
        .expect("insert member");
}

pub async fn leave(db_pool: &SqlitePool, room_id: &str, user_id: &str, left_at: i64) {
    sqlx::query("UPDATE room_members SET left_at=? WHERE room_id=? AND user_id=?")
        .bind(left_at)
        .bind(room_id)
        .bind(user_id)
        .execute(db_pool)
        .await
        .expect("mark member as left");
}

/// Inserts a text message with an explicit sequence number and creation time.
pub async fn message_at(db_pool: &SqlitePool, room_id: &str, sender: &str, sequence_id: i64, created_at: i64) -> String {
    let id = Uuid::now_v7().to_string();
    sqlx::query(
        "INSERT INTO messages (id,room_id,sender_id,content_type,content_text,sequence_id,created_at) \
         VALUES (?,?,?,'text',?,?,?)",
    )
    .bind(&id)
    .bind(room_id)
    .bind(sender)
    .bind(format!("message {sequence_id}"))
    .bind(sequence_id)
    .bind(created_at)
    .execute(db_pool)
    .await
    .expect("insert message");
    id
}

pub async fn attachment(db_pool: &SqlitePool, uploader: &str, mime_type: &str) -> String {
    let id = Uuid::now_v7().to_string();
    sqlx::query(
        "INSERT INTO attachments (id,uploader_user_id,file_name,mime_type,size_bytes,created_at) VALUES (?,?,?,?,?,?)",
    )
    .bind(&id)
    .bind(uploader)
    .bind("upload.bin")
    .bind(mime_type)
    .bind(1024_i64)
    .bind(db::now_ms())
    .execute(db_pool)
    .await
    .expect("insert attachment");
    id
}
