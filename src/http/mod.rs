//! HTTP API server for the streaming bridge
//!
//! - POST /v1/transcribe - Single-shot transcription
//! - POST /v1/chat - Single-shot chat completion
//! - POST /v1/speech - Single-shot speech synthesis
//! - GET /v1/conversation - Streaming conversation (WebSocket)
//! - GET /health - Health check

mod conversation;
mod handlers;
mod routes;
mod state;

pub use handlers::{ErrorResponse, HealthResponse, SpeechResponse};
pub use routes::create_router;
pub use state::AppState;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

/// Serve the bridge API on `listener` until the process ends
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Bridge listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .await
        .context("HTTP server failed")
}
