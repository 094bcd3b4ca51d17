use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::SessionOptions;
use super::handler::{ProtocolHandler, SessionNotice};
use super::recorder::RecorderManager;
use super::stats::SessionSnapshot;
use crate::audio::{AudioBackend, AudioSink, PlaybackQueue};
use crate::connection::{ConnectionManager, TransportFactory, WebSocketTransportFactory};
use crate::error::VoiceError;
use crate::protocol::ClientEvent;

/// A full-duplex voice conversation with the bridge.
///
/// Captured audio goes out through the recorder, remote audio comes back
/// through the protocol handler into the playback queue.
pub struct VoiceSession {
    options: SessionOptions,

    started_at: DateTime<Utc>,

    connection: ConnectionManager,

    recorder: tokio::sync::Mutex<RecorderManager>,

    playback: Arc<PlaybackQueue>,

    handler: Arc<ProtocolHandler>,

    /// Mirrors the playback speaking flag into the protocol state
    speaking_task: JoinHandle<()>,

    notices: Mutex<Option<mpsc::UnboundedReceiver<SessionNotice>>>,
}

impl VoiceSession {
    /// Must be called inside a tokio runtime
    pub fn new(
        options: SessionOptions,
        factory: Arc<dyn TransportFactory>,
        backend: Box<dyn AudioBackend>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        info!("Creating voice session: {}", options.session_id);

        let connection = ConnectionManager::new(options.connection.clone(), factory);
        let playback = Arc::new(PlaybackQueue::new(sink));
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let handler = Arc::new(ProtocolHandler::new(
            options.session.clone(),
            Arc::clone(&playback),
            connection.downgrade(),
            notice_tx,
        ));
        connection.add_observer(handler.clone());

        let mut speaking = playback.subscribe_speaking();
        let speaking_handler = Arc::clone(&handler);
        let speaking_task = tokio::spawn(async move {
            while speaking.changed().await.is_ok() {
                let value = *speaking.borrow_and_update();
                speaking_handler.set_speaking(value);
            }
        });

        let recorder = RecorderManager::new(backend, connection.clone(), options.audio.clone());

        Self {
            options,
            started_at: Utc::now(),
            connection,
            recorder: tokio::sync::Mutex::new(recorder),
            playback,
            handler,
            speaking_task,
            notices: Mutex::new(Some(notice_rx)),
        }
    }

    /// Session talking to `options.connection.url` over WebSocket
    pub fn websocket(
        options: SessionOptions,
        backend: Box<dyn AudioBackend>,
        sink: Box<dyn AudioSink>,
    ) -> Self {
        let factory = WebSocketTransportFactory::new(
            options.connection.url.clone(),
            options.connection.send_queue,
        );
        Self::new(options, Arc::new(factory), backend, sink)
    }

    /// Notices for the application; can be taken once
    pub fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<SessionNotice>> {
        self.notices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Connect and start capturing.
    ///
    /// A recoverable connect failure is logged and left to the reconnect
    /// schedule; capture starts regardless. Calling this again after a
    /// `Terminal` notice reconnects and keeps the running capture.
    pub async fn start(&self) -> Result<(), VoiceError> {
        info!("Starting voice session: {}", self.options.session_id);

        if let Err(e) = self.connection.connect().await {
            if !e.is_recoverable() {
                return Err(e);
            }
            warn!("Initial connect failed, retrying in background: {}", e);
        }

        let mut recorder = self.recorder.lock().await;
        if recorder.is_recording() {
            debug!("Capture already running, reusing it");
        } else {
            recorder.start().await?;
        }
        info!("Voice session started");
        Ok(())
    }

    /// Signal the end of the current user turn without more audio
    pub fn commit_turn(&self) -> Result<(), VoiceError> {
        self.connection.send(&ClientEvent::AudioCommit)
    }

    /// Stop capture, close the connection and silence playback
    pub async fn stop(&self) -> SessionSnapshot {
        info!("Stopping voice session: {}", self.options.session_id);

        if let Err(e) = self.recorder.lock().await.stop().await {
            warn!("Failed to release capture device: {}", e);
        }
        self.connection.close().await;
        self.playback.flush();

        self.snapshot().await
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let recorder = self.recorder.lock().await.stats();
        let (phase, turns, partial_transcript, is_speaking, last_error) =
            self.handler.with_protocol(|p| {
                (
                    p.phase().clone(),
                    p.turns().to_vec(),
                    p.partial_transcript().to_string(),
                    p.is_speaking(),
                    p.last_error().map(str::to_string),
                )
            });

        SessionSnapshot {
            session_id: self.options.session_id.clone(),
            started_at: self.started_at,
            phase,
            connection: self.connection.stats(),
            turns,
            partial_transcript,
            is_speaking,
            last_error,
            recorder,
            frames_played: self.playback.played_count(),
            frames_discarded: self.playback.discarded_count(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.speaking_task.abort();
    }
}
