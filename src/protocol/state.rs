// Session protocol state machine
//
// `ProtocolState::apply` consumes one inbound message and returns the single
// side effect the caller has to perform. It never touches the transport or
// the playback queue itself, so replaying a message log gives the same turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::messages::{ServerEvent, SessionConfig};
use crate::audio::codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One role-tagged unit of conversation content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Finalized turns never change again
    pub finalized: bool,
    /// Finalized because the connection dropped mid-turn
    #[serde(default)]
    pub interrupted: bool,
}

impl Turn {
    fn open(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            finalized: false,
            interrupted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    /// Transport not open, or open but no `session.connected` yet
    AwaitingHandshake,
    /// Handshake received; deltas are applied
    Active,
    /// Bridge announced the end of the session
    Disconnected { code: u16, reason: String },
}

/// The one outbound side effect of applying a message
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    /// Send the session configuration (reply to the handshake)
    SendSessionUpdate(SessionConfig),
    /// Hand decoded samples to the playback queue
    PlayAudio(Vec<i16>),
    /// Discard queued playback
    FlushPlayback,
    /// Report a bridge-side error to the caller
    SurfaceError(String),
}

#[derive(Debug, Clone)]
pub struct ProtocolState {
    session: SessionConfig,
    phase: SessionPhase,
    turns: Vec<Turn>,
    /// User speech transcript still being recognised
    partial_transcript: String,
    is_speaking: bool,
    last_error: Option<String>,
    decode_failures: u64,
}

impl ProtocolState {
    pub fn new(session: SessionConfig) -> Self {
        Self {
            session,
            phase: SessionPhase::AwaitingHandshake,
            turns: Vec::new(),
            partial_transcript: String::new(),
            is_speaking: false,
            last_error: None,
            decode_failures: 0,
        }
    }

    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn partial_transcript(&self) -> &str {
        &self.partial_transcript
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    /// Apply one inbound message
    pub fn apply(&mut self, event: ServerEvent) -> Effect {
        if self.phase != SessionPhase::Active {
            return match event {
                ServerEvent::SessionConnected { session_id } => {
                    debug!("Session handshake received ({:?})", session_id);
                    self.phase = SessionPhase::Active;
                    self.last_error = None;
                    Effect::SendSessionUpdate(self.session.clone())
                }
                other => {
                    debug!("Ignoring {} before session handshake", other.kind());
                    Effect::None
                }
            };
        }

        match event {
            ServerEvent::SessionConnected { .. } => {
                debug!("Duplicate session.connected ignored");
                Effect::None
            }
            ServerEvent::SessionDisconnected { code, reason } => {
                self.interrupt_partial_turns();
                self.phase = SessionPhase::Disconnected { code, reason };
                Effect::FlushPlayback
            }
            ServerEvent::AudioDelta { delta } => match codec::decode(&delta) {
                Ok(samples) => Effect::PlayAudio(samples),
                Err(e) => {
                    self.decode_failures += 1;
                    warn!("Skipping undecodable audio delta: {}", e);
                    Effect::None
                }
            },
            ServerEvent::AudioDone => Effect::None,
            ServerEvent::AudioTranscriptDelta { delta } | ServerEvent::TextDelta { delta } => {
                self.append_delta(Role::Assistant, &delta);
                Effect::None
            }
            ServerEvent::AudioTranscriptDone => {
                self.finalize_last(Role::Assistant, None);
                Effect::None
            }
            ServerEvent::TextDone { text } => {
                self.finalize_last(Role::Assistant, text);
                Effect::None
            }
            ServerEvent::InputTranscriptDelta { delta } => {
                self.partial_transcript.push_str(&delta);
                Effect::None
            }
            ServerEvent::InputTranscriptCompleted { transcript } => {
                let content = if transcript.is_empty() {
                    std::mem::take(&mut self.partial_transcript)
                } else {
                    self.partial_transcript.clear();
                    transcript
                };
                let mut turn = Turn::open(Role::User, &content);
                turn.finalized = true;
                self.turns.push(turn);
                Effect::None
            }
            ServerEvent::Error { message } => {
                warn!("Bridge reported error: {}", message);
                self.last_error = Some(message.clone());
                Effect::SurfaceError(message)
            }
            ServerEvent::Pong => Effect::None,
            ServerEvent::Unknown => {
                debug!("Ignoring unknown message kind");
                Effect::None
            }
        }
    }

    /// The connection left `open`: close out in-flight content and require
    /// a fresh handshake before anything from the next epoch is applied.
    pub fn connection_lost(&mut self) -> Effect {
        self.interrupt_partial_turns();
        if self.phase == SessionPhase::Active {
            self.phase = SessionPhase::AwaitingHandshake;
        }
        Effect::FlushPlayback
    }

    /// Playback queue reported a speaking/idle boundary
    pub fn set_speaking(&mut self, speaking: bool) {
        self.is_speaking = speaking;
    }

    /// Append to the last turn if it has `role` and is still open,
    /// otherwise start a new turn.
    fn append_delta(&mut self, role: Role, delta: &str) {
        match self.turns.last_mut() {
            Some(last) if last.role == role && !last.finalized => last.content.push_str(delta),
            _ => self.turns.push(Turn::open(role, delta)),
        }
    }

    fn finalize_last(&mut self, role: Role, full_text: Option<String>) {
        match self.turns.last_mut() {
            Some(last) if last.role == role && !last.finalized => {
                if let Some(text) = full_text {
                    if !text.is_empty() {
                        last.content = text;
                    }
                }
                last.finalized = true;
            }
            _ => {
                // A done without deltas still carries the full response
                if let Some(text) = full_text.filter(|t| !t.is_empty()) {
                    let mut turn = Turn::open(role, &text);
                    turn.finalized = true;
                    self.turns.push(turn);
                }
            }
        }
    }

    fn interrupt_partial_turns(&mut self) {
        if let Some(last) = self.turns.last_mut() {
            if !last.finalized {
                last.finalized = true;
                last.interrupted = true;
            }
        }
        if !self.partial_transcript.is_empty() {
            let content = std::mem::take(&mut self.partial_transcript);
            let mut turn = Turn::open(Role::User, &content);
            turn.finalized = true;
            turn.interrupted = true;
            self.turns.push(turn);
        }
        self.is_speaking = false;
    }
}
