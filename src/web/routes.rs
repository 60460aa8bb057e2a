use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::static_files::static_handler;
use super::state::AppState;

/// Database uploads can be sizable; multipart bodies are capped here
/// rather than at axum's 2 MB default.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

// UI Routes - web interface
pub fn ui_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(handlers::ui::index_handler))
        .route("/static/{*path}", get(static_handler))
}

// API Routes - REST API the chat page talks to
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Conversation
            .route("/ask", post(handlers::api::ask))
            .route("/questions", get(handlers::api::suggested_questions))
            .route("/reset", post(handlers::api::reset_conversation))

            // Database binding
            .route("/upload", post(handlers::api::upload_database))

            // Voice input
            .route("/voice", post(handlers::api::transcribe_voice))

            // Result export
            .route("/export/{format}", get(handlers::api::export_results))

            // Display preferences
            .route(
                "/prefs",
                get(handlers::api::get_prefs).put(handlers::api::update_prefs),
            )

            // System status
            .route("/status", get(handlers::api::system_status))
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
    )
}
