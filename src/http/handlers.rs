use super::state::AppState;
use crate::audio::codec;
use crate::bridge::{ChatCompletion, ChatRequest, SpeechRequest, TranscribeRequest, Transcription};
use crate::error::VoiceError;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TranscribeBody {
    /// Base64 PCM16LE, the complete utterance
    pub audio: String,

    pub sample_rate: Option<u32>,

    pub channels: Option<u16>,

    pub language: Option<String>,

    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpeechResponse {
    /// Base64 PCM16LE
    pub audio: String,
    pub format: String,
    pub sample_rate: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub provider: String,
    pub active_conversations: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(err: VoiceError) -> Response {
    let status = match err {
        VoiceError::Decode(_) => StatusCode::BAD_REQUEST,
        VoiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("Request failed ({}): {}", status, err);

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            provider: state.bridge.provider_name().to_string(),
            active_conversations: state.conversations(),
            uptime_secs: state.started_at.elapsed().as_secs(),
        }),
    )
}

/// POST /v1/transcribe
pub async fn transcribe(
    State(state): State<AppState>,
    Json(body): Json<TranscribeBody>,
) -> Result<Json<Transcription>, Response> {
    let audio = codec::decode(&body.audio).map_err(error_response)?;
    let options = state.bridge.options();

    info!("Transcribe request ({} samples)", audio.len());
    let request = TranscribeRequest {
        audio,
        sample_rate: body.sample_rate.unwrap_or(options.sample_rate),
        channels: body.channels.unwrap_or(options.channels),
        language: body.language,
        model: body.model,
    };

    state
        .bridge
        .transcribe(request)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /v1/chat
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatCompletion>, Response> {
    if request.messages.is_empty() {
        return Err(error_response(VoiceError::Decode(
            "messages must not be empty".to_string(),
        )));
    }

    info!("Chat request ({} messages)", request.messages.len());
    state
        .bridge
        .chat_completion(request)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /v1/speech
pub async fn speech(
    State(state): State<AppState>,
    Json(request): Json<SpeechRequest>,
) -> Result<Json<SpeechResponse>, Response> {
    if request.text.trim().is_empty() {
        return Err(error_response(VoiceError::Decode("text must not be empty".to_string())));
    }

    info!("Speech request ({} chars)", request.text.len());
    let audio = state
        .bridge
        .text_to_speech(request)
        .await
        .map_err(error_response)?;

    Ok(Json(SpeechResponse {
        audio: codec::encode_bytes(&audio.audio_bytes),
        format: audio.format,
        sample_rate: state.bridge.options().sample_rate,
    }))
}
