use std::sync::Arc;

use axum::{debug_handler, extract::{Query, State}, Json};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_sessions::Session;

use crate::{
    appresult::AppError,
    config::Config,
    db::{self, MessageRow, RoomType},
    session::current_user,
    AppResult,
};

use super::{gate, visibility::{self, Window}};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDto {
    pub id: String,
    pub room_id: String,
    pub sequence_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_json: Option<serde_json::Value>,
    /// Unix seconds.
    pub created_at: i64,
}

impl From<MessageRow> for MessageDto {
    fn from(row: MessageRow) -> Self {
        let payload_json = row
            .payload_json
            .filter(|raw| !raw.is_empty())
            .and_then(|raw| serde_json::from_str(&raw).ok());

        Self {
            id: row.id,
            room_id: row.room_id,
            sequence_id: row.sequence_id,
            sender_id: row.sender_id,
            content_type: row.content_type,
            content_text: row.content_text,
            attachment_id: row.attachment_id,
            payload_json,
            created_at: db::ms_to_secs(row.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryPage {
    pub messages: Vec<MessageDto>,
}

/// Which side of a cursor to read.
#[derive(Debug, Clone, Copy)]
enum Slice {
    /// Newest `limit` messages below the cursor.
    Before(i64),
    /// Oldest `limit` messages above the cursor.
    After(i64),
}

const MESSAGE_COLUMNS: &str = "id,room_id,sequence_id,sender_id,content_type,content_text,attachment_id,payload_json,created_at";

/// Reads one page in ascending sequence order. Soft-deleted messages and anything outside
/// `window` are skipped.
async fn page(db_pool: &SqlitePool, room_id: &str, window: Window, slice: Slice, limit: i64) -> sqlx::Result<Vec<MessageDto>> {
    let cutoff = window.created_before.unwrap_or(i64::MAX);

    let rows: Vec<MessageRow> = match slice {
        Slice::Before(cursor) => {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE room_id=? AND deleted_at IS NULL AND sequence_id<? AND created_at<? \
                 ORDER BY sequence_id DESC LIMIT ?"
            );
            let mut rows: Vec<MessageRow> = sqlx::query_as(&sql)
                .bind(room_id)
                .bind(cursor)
                .bind(cutoff)
                .bind(limit)
                .fetch_all(db_pool)
                .await?;
            rows.reverse();
            rows
        }
        Slice::After(cursor) => {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE room_id=? AND deleted_at IS NULL AND sequence_id>? AND created_at<? \
                 ORDER BY sequence_id ASC LIMIT ?"
            );
            sqlx::query_as(&sql)
                .bind(room_id)
                .bind(cursor)
                .bind(cutoff)
                .bind(limit)
                .fetch_all(db_pool)
                .await?
        }
    };

    Ok(rows.into_iter().map(MessageDto::from).collect())
}

/// Requested page size, capped at the configured maximum. Missing or non-positive means the maximum.
fn clamp_limit(requested: Option<i64>, max: i64) -> i64 {
    requested.filter(|n| *n > 0).map_or(max, |n| n.min(max))
}

fn required<'a>(value: &'a str, name: &str) -> AppResult<&'a str> {
    if value.is_empty() {
        return Err(AppError::bad_request(format!("missing {name}")));
    }
    Ok(value)
}

async fn load_room(db_pool: &SqlitePool, room_id: &str) -> AppResult<db::Room> {
    db::find_room(db_pool, room_id)
        .await?
        .ok_or_else(|| AppError::not_found("room not found"))
}

/// Messages strictly before `message_id` in `room_id`.
pub async fn before(db_pool: &SqlitePool, user_id: &str, room_id: &str, message_id: &str, limit: i64) -> AppResult<Vec<MessageDto>> {
    let room = load_room(db_pool, room_id).await?;
    let window = visibility::history_window(db_pool, &room, user_id).await?;

    let Some(reference) = db::find_message(db_pool, message_id).await? else {
        return Err(AppError::not_found("message not found"));
    };
    if reference.room_id != room.id {
        return Err(AppError::bad_request("message does not belong to this room"));
    }

    Ok(page(db_pool, &room.id, window, Slice::Before(reference.sequence_id), limit).await?)
}

/// Messages strictly after sequence number `after_sequence_id`.
pub async fn after(db_pool: &SqlitePool, user_id: &str, room_id: &str, after_sequence_id: i64, limit: i64) -> AppResult<Vec<MessageDto>> {
    let room = load_room(db_pool, room_id).await?;
    let window = visibility::history_window(db_pool, &room, user_id).await?;

    Ok(page(db_pool, &room.id, window, Slice::After(after_sequence_id), limit).await?)
}

pub async fn latest_by_group(db_pool: &SqlitePool, user_id: &str, group_id: &str, limit: i64) -> AppResult<Vec<MessageDto>> {
    let room = load_room(db_pool, group_id).await?;
    if room.kind()? != RoomType::Group {
        return Err(AppError::not_found("group not found"));
    }
    let window = visibility::history_window(db_pool, &room, user_id).await?;

    Ok(page(db_pool, &room.id, window, Slice::Before(i64::MAX), limit).await?)
}

/// The newest messages exchanged with a friend. No conversation yet is an empty page.
pub async fn latest_by_friend(db_pool: &SqlitePool, user_id: &str, friend_id: &str, limit: i64) -> AppResult<Vec<MessageDto>> {
    if friend_id == user_id {
        return Err(AppError::bad_request("invalid friend_id"));
    }
    if !gate::are_friends(db_pool, user_id, friend_id).await? {
        return Err(AppError::forbidden("not friends"));
    }
    let Some(room) = db::find_direct_room(db_pool, user_id, friend_id).await? else {
        return Ok(Vec::new());
    };

    Ok(page(db_pool, &room.id, Window::UNBOUNDED, Slice::Before(i64::MAX), limit).await?)
}

#[derive(Deserialize)]
pub(crate) struct BeforeQuery {
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    message_id: String,
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct AfterQuery {
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    after_sequence_id: i64,
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct GroupQuery {
    #[serde(default)]
    group_id: String,
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct FriendQuery {
    #[serde(default)]
    friend_id: String,
    limit: Option<i64>,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history_before(
    State(db_pool): State<SqlitePool>,
    State(config): State<Arc<Config>>,
    session: Session,
    Query(query): Query<BeforeQuery>,
) -> AppResult<Json<HistoryPage>> {
    let user_id = current_user(&session).await?;
    let room_id = required(&query.room_id, "room_id")?;
    let message_id = required(&query.message_id, "message_id")?;
    let limit = clamp_limit(query.limit, config.history_limit);

    let messages = before(&db_pool, &user_id, room_id, message_id, limit).await?;
    Ok(Json(HistoryPage { messages }))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history_after(
    State(db_pool): State<SqlitePool>,
    State(config): State<Arc<Config>>,
    session: Session,
    Query(query): Query<AfterQuery>,
) -> AppResult<Json<HistoryPage>> {
    let user_id = current_user(&session).await?;
    let room_id = required(&query.room_id, "room_id")?;
    let limit = clamp_limit(query.limit, config.history_limit);

    let messages = after(&db_pool, &user_id, room_id, query.after_sequence_id.max(0), limit).await?;
    Ok(Json(HistoryPage { messages }))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history_group(
    State(db_pool): State<SqlitePool>,
    State(config): State<Arc<Config>>,
    session: Session,
    Query(query): Query<GroupQuery>,
) -> AppResult<Json<HistoryPage>> {
    let user_id = current_user(&session).await?;
    let group_id = required(&query.group_id, "group_id")?;
    let limit = clamp_limit(query.limit, config.history_limit);

    let messages = latest_by_group(&db_pool, &user_id, group_id, limit).await?;
    Ok(Json(HistoryPage { messages }))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history_latest(
    State(db_pool): State<SqlitePool>,
    State(config): State<Arc<Config>>,
    session: Session,
    Query(query): Query<FriendQuery>,
) -> AppResult<Json<HistoryPage>> {
    let user_id = current_user(&session).await?;
    let friend_id = required(&query.friend_id, "friend_id")?;
    let limit = clamp_limit(query.limit, config.history_limit);

    let messages = latest_by_friend(&db_pool, &user_id, friend_id, limit).await?;
    Ok(Json(HistoryPage { messages }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_capped_and_defaulted() {
        assert_eq!(clamp_limit(None, 50), 50);
        assert_eq!(clamp_limit(Some(0), 50), 50);
        assert_eq!(clamp_limit(Some(-3), 50), 50);
        assert_eq!(clamp_limit(Some(10), 50), 10);
        assert_eq!(clamp_limit(Some(500), 50), 50);
    }

    #[test]
    fn dto_uses_seconds_and_inlines_the_payload() {
        let dto = MessageDto::from(MessageRow {
            id: "m1".to_owned(),
            room_id: "r1".to_owned(),
            sequence_id: 7,
            sender_id: None,
            content_type: "file".to_owned(),
            content_text: None,
            attachment_id: Some("a1".to_owned()),
            payload_json: Some(r#"{"attachment_id":"a1","created_at":1}"#.to_owned()),
            created_at: 1_700_000_000_999,
        });

        assert_eq!(dto.created_at, 1_700_000_000);
        let value = serde_json::to_value(&dto).expect("serializes");
        assert_eq!(value["payload_json"]["attachment_id"], "a1");
        assert!(value.get("sender_id").is_none());
        assert!(value.get("content_text").is_none());
    }
}
