pub mod appresult;
pub mod config;
pub mod db;
pub mod rooms;
pub mod session;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};

pub use appresult::{AppError, AppResult};
use config::Config;
use rooms::{hub::Hub, sequencer::Sequencer};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub hub: Hub,
    pub sequencer: Sequencer,
    pub config: Arc<Config>,
}

impl AppState {
    /// Starts the hub and wires the sequencer to `db_pool`.
    pub fn new(db_pool: SqlitePool, config: Config) -> Self {
        Self {
            hub: Hub::spawn(),
            sequencer: Sequencer::sqlite(db_pool.clone(), config.sequencer.clone()),
            config: Arc::new(config),
            db_pool,
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            app_state.config.session_inactivity_minutes,
        )));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(rooms::router())
        .with_state(app_state)
        .layer(session_layer)
        .layer(CorsLayer::very_permissive())
}
