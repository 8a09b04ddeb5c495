//! Membership and leave-time rules shared by the live path and history reads.

use sqlx::SqlitePool;

use crate::{
    appresult::AppError,
    db::{self, Room, RoomType},
    AppResult,
};

use super::gate::Denied;

#[derive(Debug, Clone)]
pub struct Membership {
    pub left_at: Option<i64>,
    pub mute_until: Option<i64>,
}

impl Membership {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }

    pub fn is_muted(&self, now: i64) -> bool {
        self.mute_until.is_some_and(|until| until > now)
    }

    pub fn can_post(&self, now: i64) -> Result<(), Denied> {
        if !self.is_active() {
            return Err(Denied::LeftRoom);
        }
        if self.is_muted(now) {
            return Err(Denied::Muted);
        }
        Ok(())
    }

    /// A departed member keeps access to what was said before they left, nothing after.
    pub fn window(&self) -> Window {
        Window {
            created_before: self.left_at,
        }
    }
}

pub async fn load_membership(db_pool: &SqlitePool, room_id: &str, user_id: &str) -> anyhow::Result<Option<Membership>> {
    let row: Option<(Option<i64>, Option<i64>)> =
        sqlx::query_as("SELECT left_at,mute_until FROM room_members WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user_id)
            .fetch_optional(db_pool)
            .await?;

    Ok(row.map(|(left_at, mute_until)| Membership { left_at, mute_until }))
}

/// How much of a room's history a requester may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Messages created at or after this instant are hidden.
    pub created_before: Option<i64>,
}

impl Window {
    pub const UNBOUNDED: Window = Window { created_before: None };

    pub fn admits(&self, created_at: i64) -> bool {
        self.created_before.is_none_or(|cutoff| created_at < cutoff)
    }
}

/// Decides whether `user_id` may read `room`'s history and up to when.
///
/// Direct rooms are checked against the participants encoded in the room name; group rooms
/// need a membership row, current or former.
pub async fn history_window(db_pool: &SqlitePool, room: &Room, user_id: &str) -> AppResult<Window> {
    match room.kind()? {
        RoomType::Direct => {
            let Some((a, b)) = db::direct_room_participants(&room.name) else {
                return Err(AppError::forbidden("invalid direct room"));
            };
            if user_id != a && user_id != b {
                return Err(AppError::forbidden("not a participant of this conversation"));
            }
            Ok(Window::UNBOUNDED)
        }
        RoomType::Group => {
            let Some(membership) = load_membership(db_pool, &room.id, user_id).await? else {
                return Err(AppError::forbidden("not a member of this group"));
            };
            Ok(membership.window())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn member(left_at: Option<i64>, mute_until: Option<i64>) -> Membership {
        Membership { left_at, mute_until }
    }

    #[test]
    fn mute_in_the_future_blocks_posting() {
        assert_eq!(member(None, Some(2_000)).can_post(1_000), Err(Denied::Muted));
    }

    #[test]
    fn expired_mute_is_ignored() {
        assert_eq!(member(None, Some(500)).can_post(1_000), Ok(()));
    }

    #[test]
    fn departed_member_cannot_post() {
        assert_eq!(member(Some(10), None).can_post(1_000), Err(Denied::LeftRoom));
    }

    #[test]
    fn departed_member_sees_only_earlier_messages() {
        let window = member(Some(100), None).window();
        assert!(window.admits(99));
        assert!(!window.admits(100));
        assert!(!window.admits(101));
        assert!(member(None, None).window().admits(i64::MAX));
    }

    #[tokio::test]
    async fn membership_row_carries_leave_and_mute_times() {
        let db_pool = test_support::pool().await;
        let room_id = test_support::group(&db_pool, "owner", &["owner"]).await;
        test_support::add_member(&db_pool, &room_id, "muted", None, Some(5_000)).await;
        test_support::add_member(&db_pool, &room_id, "gone", Some(300), None).await;

        let muted = load_membership(&db_pool, &room_id, "muted").await.unwrap().expect("row");
        assert_eq!(muted.can_post(4_999), Err(Denied::Muted));
        assert!(muted.window().admits(i64::MAX));

        let gone = load_membership(&db_pool, &room_id, "gone").await.unwrap().expect("row");
        assert_eq!(gone.window().created_before, Some(300));

        assert!(load_membership(&db_pool, &room_id, "stranger").await.unwrap().is_none());
    }
}
