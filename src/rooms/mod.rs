mod attachment;
pub mod frame;
pub mod gate;
pub mod history;
pub mod hub;
mod msg;
mod new;
pub mod sequencer;
pub mod visibility;
mod ws;

#[cfg(test)]
mod sequencer_tests;

use axum::{routing::get, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::connect))
        .route("/api/messages/history/before", get(history::history_before))
        .route("/api/messages/history/after", get(history::history_after))
        .route("/api/messages/history/group", get(history::history_group))
        .route("/api/messages/history/latest", get(history::history_latest))
}
