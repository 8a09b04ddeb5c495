use std::{fmt, str::FromStr};

use anyhow::anyhow;
use sqlx::SqlitePool;
use time::OffsetDateTime;

/// Separator between the two participants in a direct room's name.
pub const DIRECT_ROOM_DELIMITER: char = ':';

pub async fn migrate(db_pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(db_pool).await?;
    Ok(())
}

/// Current unix time in milliseconds; every stored timestamp uses this unit.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn ms_to_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

/// Orders an unordered pair so the smaller identifier comes first.
pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

pub fn direct_room_name(a: &str, b: &str) -> String {
    let (x, y) = canonical_pair(a, b);
    format!("{x}{DIRECT_ROOM_DELIMITER}{y}")
}

/// Splits a direct room's name back into its two participants.
pub fn direct_room_participants(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.split(DIRECT_ROOM_DELIMITER);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => Some((a, b)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomType {
    Direct,
    Group,
}

impl RoomType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomType::Direct => "direct",
            RoomType::Group => "group",
        }
    }
}

impl FromStr for RoomType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(RoomType::Direct),
            "group" => Ok(RoomType::Group),
            other => Err(anyhow!("unknown room type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Image,
    File,
    System,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::File => "file",
            ContentType::System => "system",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Room {
    pub id: String,
    pub room_type: String,
    pub name: String,
    pub owner_user_id: String,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Room {
    pub fn kind(&self) -> anyhow::Result<RoomType> {
        self.room_type.parse()
    }
}

pub async fn find_room(db_pool: &SqlitePool, room_id: &str) -> sqlx::Result<Option<Room>> {
    // soft-deleted rooms stay readable so their history remains attributable
    sqlx::query_as("SELECT id,room_type,name,owner_user_id,deleted_at,created_at,updated_at FROM rooms WHERE id=?")
        .bind(room_id)
        .fetch_optional(db_pool)
        .await
}

pub async fn find_direct_room(db_pool: &SqlitePool, a: &str, b: &str) -> sqlx::Result<Option<Room>> {
    sqlx::query_as("SELECT id,room_type,name,owner_user_id,deleted_at,created_at,updated_at FROM rooms WHERE room_type='direct' AND name=?")
        .bind(direct_room_name(a, b))
        .fetch_optional(db_pool)
        .await
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sequence_id: i64,
    pub sender_id: Option<String>,
    pub content_type: String,
    pub content_text: Option<String>,
    pub attachment_id: Option<String>,
    pub payload_json: Option<String>,
    pub created_at: i64,
}

pub async fn find_message(db_pool: &SqlitePool, message_id: &str) -> sqlx::Result<Option<MessageRow>> {
    sqlx::query_as(
        "SELECT id,room_id,sequence_id,sender_id,content_type,content_text,attachment_id,payload_json,created_at \
         FROM messages WHERE id=? AND deleted_at IS NULL",
    )
    .bind(message_id)
    .fetch_optional(db_pool)
    .await
}
