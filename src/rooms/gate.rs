use sqlx::SqlitePool;
use thiserror::Error;

use crate::db;

use super::visibility;

/// Why a live message was refused. Never sent to the client, only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Denied {
    #[error("cannot message yourself")]
    SelfMessage,
    #[error("not friends")]
    NotFriends,
    #[error("not a member of the room")]
    NotMember,
    #[error("left the room")]
    LeftRoom,
    #[error("muted")]
    Muted,
}

pub async fn are_friends(db_pool: &SqlitePool, a: &str, b: &str) -> anyhow::Result<bool> {
    if a.is_empty() || b.is_empty() || a == b {
        return Ok(false);
    }

    let (x, y) = db::canonical_pair(a, b);
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM friendships WHERE user_id_a=? AND user_id_b=?")
        .bind(x)
        .bind(y)
        .fetch_optional(db_pool)
        .await?;
    Ok(row.is_some())
}

pub async fn check_direct(db_pool: &SqlitePool, from_user: &str, to_user: &str) -> anyhow::Result<Result<(), Denied>> {
    if from_user == to_user {
        return Ok(Err(Denied::SelfMessage));
    }
    if !are_friends(db_pool, from_user, to_user).await? {
        return Ok(Err(Denied::NotFriends));
    }
    Ok(Ok(()))
}

/// The sender must be an active, unmuted member at `now`.
pub async fn check_group(db_pool: &SqlitePool, room_id: &str, user_id: &str, now: i64) -> anyhow::Result<Result<(), Denied>> {
    let Some(membership) = visibility::load_membership(db_pool, room_id, user_id).await? else {
        return Ok(Err(Denied::NotMember));
    };
    Ok(membership.can_post(now))
}
