// GET /v1/conversation
//
// One WebSocket per conversation. The socket reader turns client messages
// into inbound frames for the bridge; the writer forwards conversation
// events and control replies (pong, parse errors) in order.

use super::state::AppState;
use crate::audio::codec;
use crate::bridge::InboundFrame;
use crate::protocol::{ClientEvent, ServerEvent, NORMAL_CLOSURE};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Inbound frames queued behind a turn in progress (~100s at 100ms frames)
const INBOUND_FRAMES: usize = 1024;

pub async fn conversation_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!("Failed to serialize {}: {}", event.kind(), e);
            true
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = format!("conv-{}", uuid::Uuid::new_v4());
    state.active_conversations.fetch_add(1, Ordering::SeqCst);
    info!("Conversation {} opened", session_id);

    let (mut sink, stream) = socket.split();

    let connected = ServerEvent::SessionConnected {
        session_id: Some(session_id.clone()),
    };
    if send_event(&mut sink, &connected).await {
        run_conversation(&mut sink, stream, &state).await;

        let close = CloseFrame {
            code: NORMAL_CLOSURE,
            reason: "conversation ended".into(),
        };
        let _ = sink.send(Message::Close(Some(close))).await;
    }

    state.active_conversations.fetch_sub(1, Ordering::SeqCst);
    info!("Conversation {} closed", session_id);
}

async fn run_conversation(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: SplitStream<WebSocket>,
    state: &AppState,
) {
    let (frame_tx, frame_rx) = mpsc::channel::<InboundFrame>(INBOUND_FRAMES);
    let (control_tx, mut control_rx) = mpsc::channel::<ServerEvent>(16);

    let inbound =
        futures::stream::unfold(frame_rx, |mut rx| async move { rx.recv().await.map(|f| (f, rx)) })
            .boxed();
    let mut events = state.bridge.streaming_conversation(inbound);
    let reader = tokio::spawn(read_client(stream, frame_tx, control_tx));

    let mut control_open = true;
    loop {
        let outgoing = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event.into_server_events(),
                None => break,
            },
            control = control_rx.recv(), if control_open => match control {
                Some(event) => vec![event],
                None => {
                    control_open = false;
                    continue;
                }
            },
        };

        for event in &outgoing {
            if !send_event(sink, event).await {
                debug!("Client went away mid-response");
                reader.abort();
                return;
            }
        }
    }

    reader.abort();
}

async fn read_client(
    mut stream: SplitStream<WebSocket>,
    frames: mpsc::Sender<InboundFrame>,
    control: mpsc::Sender<ServerEvent>,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Conversation socket error: {}", e);
                break;
            }
        };

        let event: ClientEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Unreadable client message: {}", e);
                let reply = ServerEvent::Error {
                    message: format!("unreadable message: {}", e),
                };
                let _ = control.send(reply).await;
                continue;
            }
        };

        let frame = match event {
            ClientEvent::AudioAppend { audio, is_final } => match codec::decode_bytes(&audio) {
                Ok(audio_data) => InboundFrame { audio_data, is_final },
                Err(e) => {
                    warn!("Skipping malformed audio frame: {}", e);
                    if !is_final {
                        continue;
                    }
                    InboundFrame {
                        audio_data: Vec::new(),
                        is_final,
                    }
                }
            },
            ClientEvent::AudioCommit => InboundFrame {
                audio_data: Vec::new(),
                is_final: true,
            },
            ClientEvent::Ping => {
                let _ = control.send(ServerEvent::Pong).await;
                continue;
            }
            ClientEvent::SessionUpdate { session } => {
                debug!(
                    "Session update: {:?} at {} Hz",
                    session.modalities, session.sample_rate
                );
                continue;
            }
        };

        if frames.send(frame).await.is_err() {
            break;
        }
    }
}
