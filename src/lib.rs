pub mod access;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod registry;
pub mod service;
pub mod storage;
pub mod users;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

pub use error::{AppError, Result};
pub use service::{AppState, ShareVault};

pub fn app(state: AppState) -> Router {
    let body_limit = usize::try_from(state.max_upload_bytes()).unwrap_or(usize::MAX);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/auth/register", post(handlers::register_user))
        .route("/api/auth/login", post(handlers::login_user))
        .route("/api/account", delete(handlers::delete_account))
        .route("/api/upload", post(handlers::upload_file))
        .route("/api/files", get(handlers::get_user_files))
        .route(
            "/api/files/:file_id",
            get(handlers::get_file_metadata).delete(handlers::delete_file),
        )
        .route(
            "/api/files/:file_id/permission",
            put(handlers::set_file_permission),
        )
        .route(
            "/api/download/:link_id",
            get(handlers::download_shared_file),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
