use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{self, MemberRole, RoomType};

/// Returns the id of the direct room for `a` and `b`, creating it and both membership rows
/// on first contact. Safe to race: losers of the insert pick up the winner's row.
pub(crate) async fn ensure_direct_room(db_pool: &SqlitePool, a: &str, b: &str) -> anyhow::Result<String> {
    if let Some(room) = db::find_direct_room(db_pool, a, b).await? {
        ensure_members(db_pool, &room.id, &[a, b]).await?;
        return Ok(room.id);
    }

    let (owner, _) = db::canonical_pair(a, b);
    let now = db::now_ms();
    sqlx::query(
        "INSERT INTO rooms (id,room_type,name,owner_user_id,created_at,updated_at) VALUES (?,?,?,?,?,?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(Uuid::now_v7().to_string())
    .bind(RoomType::Direct.as_str())
    .bind(db::direct_room_name(a, b))
    .bind(owner)
    .bind(now)
    .bind(now)
    .execute(db_pool)
    .await?;

    let Some(room) = db::find_direct_room(db_pool, a, b).await? else {
        anyhow::bail!("direct room for {a} and {b} vanished after insert");
    };
    tracing::debug!(room_id = %room.id, name = %room.name, "created direct room");

    ensure_members(db_pool, &room.id, &[a, b]).await?;
    Ok(room.id)
}

async fn ensure_members(db_pool: &SqlitePool, room_id: &str, user_ids: &[&str]) -> anyhow::Result<()> {
    let now = db::now_ms();
    for user_id in user_ids.iter().filter(|id| !id.is_empty()) {
        sqlx::query(
            "INSERT INTO room_members (room_id,user_id,role,joined_at) VALUES (?,?,?,?) \
             ON CONFLICT(room_id,user_id) DO NOTHING",
        )
        .bind(room_id)
        .bind(*user_id)
        .bind(MemberRole::Member.as_str())
        .bind(now)
        .execute(db_pool)
        .await?;
    }
    Ok(())
}

/// Everyone who should receive a group broadcast right now.
pub(crate) async fn active_member_ids(db_pool: &SqlitePool, room_id: &str) -> anyhow::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT user_id FROM room_members WHERE room_id=? AND left_at IS NULL")
        .bind(room_id)
        .fetch_all(db_pool)
        .await?;
    Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
}
