use super::conversation;
use super::handlers;
use super::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Base64 utterances run larger than axum's 2 MB default
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Single-shot operations
        .route("/v1/transcribe", post(handlers::transcribe))
        .route("/v1/chat", post(handlers::chat))
        .route("/v1/speech", post(handlers::speech))
        // Streaming conversation
        .route("/v1/conversation", get(conversation::conversation_socket))
        .layer(
            ServiceBuilder::new()
                // Add tracing middleware for request logging
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}
