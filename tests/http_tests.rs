// Integration tests for the bridge HTTP API
//
// Single-shot endpoints are driven through the router directly; the
// conversation endpoint is exercised end to end with a real socket and a
// voice session on the client side.

mod common;

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{wait_for, RecordingSink};
use loqa_voice::audio::{codec, AudioFrame, ChannelBackend};
use loqa_voice::bridge::{BridgeOptions, BridgeService, ChatCompletion, SimulatedProvider, Transcription};
use loqa_voice::http::{self, AppState, ErrorResponse, HealthResponse, SpeechResponse};
use loqa_voice::protocol::Role;
use loqa_voice::session::{SessionNotice, SessionOptions, VoiceSession};
use loqa_voice::create_router;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

fn state() -> AppState {
    let provider = Arc::new(SimulatedProvider::new(24000));
    AppState::new(BridgeService::new(provider, BridgeOptions::default()))
}

async fn call<T: DeserializeOwned>(
    state: AppState,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Result<(StatusCode, T)> {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => request
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))?,
        None => request.body(Body::empty())?,
    };

    let response = create_router(state).oneshot(request).await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&bytes)?))
}

#[tokio::test]
async fn test_health_reports_provider() -> Result<()> {
    let (status, health): (_, HealthResponse) = call(state(), "GET", "/health", None).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health.status, "ok");
    assert_eq!(health.provider, "simulated");
    assert_eq!(health.active_conversations, 0);
    Ok(())
}

#[tokio::test]
async fn test_chat_completion() -> Result<()> {
    let body = serde_json::json!({
        "messages": [{"role": "user", "content": "hello bridge"}]
    });
    let (status, reply): (_, ChatCompletion) = call(state(), "POST", "/v1/chat", Some(body)).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply.text, "You said: hello bridge");
    Ok(())
}

#[tokio::test]
async fn test_chat_rejects_empty_messages() -> Result<()> {
    let body = serde_json::json!({ "messages": [] });
    let (status, error): (_, ErrorResponse) = call(state(), "POST", "/v1/chat", Some(body)).await?;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error.error.contains("messages"));
    Ok(())
}

#[tokio::test]
async fn test_transcribe_decodes_base64_audio() -> Result<()> {
    let body = serde_json::json!({ "audio": codec::encode(&[0i16; 4800]) });
    let (status, transcription): (_, Transcription) =
        call(state(), "POST", "/v1/transcribe", Some(body)).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(transcription.text, "200 milliseconds of audio");
    Ok(())
}

#[tokio::test]
async fn test_transcribe_rejects_malformed_audio() -> Result<()> {
    let body = serde_json::json!({ "audio": "not base64!" });
    let (status, _): (_, ErrorResponse) = call(state(), "POST", "/v1/transcribe", Some(body)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Valid base64, odd byte count
    let body = serde_json::json!({ "audio": codec::encode_bytes(&[1, 2, 3]) });
    let (status, _): (_, ErrorResponse) = call(state(), "POST", "/v1/transcribe", Some(body)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_speech_returns_pcm() -> Result<()> {
    let body = serde_json::json!({ "text": "two words" });
    let (status, speech): (_, SpeechResponse) = call(state(), "POST", "/v1/speech", Some(body)).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(speech.format, "pcm16");
    assert_eq!(speech.sample_rate, 24000);
    // 120ms per word at 24kHz
    assert_eq!(codec::decode(&speech.audio)?.len(), 2 * 2880);

    let body = serde_json::json!({ "text": "   " });
    let (status, _): (_, ErrorResponse) = call(state(), "POST", "/v1/speech", Some(body)).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_conversation_round_trip_over_websocket() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = state();
    let server = tokio::spawn(http::serve(listener, app.clone()));

    let mut options = SessionOptions::default();
    options.connection.url = format!("ws://{}/v1/conversation", addr);
    let (backend, mic) = ChannelBackend::new(16);
    let sink = RecordingSink::new(Duration::ZERO);
    let session = VoiceSession::websocket(options, Box::new(backend), Box::new(sink.clone()));
    let mut notices = session.take_notices().expect("notices");

    session.start().await?;
    assert!(wait_for(Duration::from_secs(2), || app.conversations() == 1).await);

    mic.send(AudioFrame::new(vec![0; 2400], 24000, 1)).await?;
    let mut last = AudioFrame::new(vec![0; 2400], 24000, 1);
    last.is_final = true;
    mic.send(last).await?;

    let mut turns = Vec::new();
    while turns.len() < 2 {
        match tokio::time::timeout(Duration::from_secs(5), notices.recv()).await? {
            Some(SessionNotice::TurnFinalized(turn)) => turns.push(turn),
            other => panic!("unexpected notice: {:?}", other),
        }
    }
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].content, "200 milliseconds of audio");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].content, "You said: 200 milliseconds of audio");

    // Six words of tone
    let expected = 6 * 2880;
    assert!(
        wait_for(Duration::from_secs(2), || {
            sink.played().iter().map(Vec::len).sum::<usize>() == expected
        })
        .await
    );

    let snapshot = session.stop().await;
    assert_eq!(snapshot.recorder.frames_sent, 2);
    assert!(wait_for(Duration::from_secs(2), || app.conversations() == 0).await);

    server.abort();
    Ok(())
}
