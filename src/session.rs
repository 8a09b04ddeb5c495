use tower_sessions::Session;

use crate::{appresult::AppError, AppResult};

/// Session key holding the authenticated user's identifier. Written by the login flow.
pub const USER_ID: &str = "user_id";

pub async fn current_user(session: &Session) -> AppResult<String> {
    match session.get::<String>(USER_ID).await? {
        Some(user_id) if !user_id.is_empty() => Ok(user_id),
        _ => Err(AppError::unauthorized("not logged in")),
    }
}
