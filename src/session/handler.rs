use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::audio::{AudioFrame, PlaybackQueue};
use crate::connection::{ConnectionState, SessionObserver, WeakConnection};
use crate::error::VoiceError;
use crate::protocol::{ClientEvent, Effect, ProtocolState, ServerEvent, SessionConfig, Turn};

/// Things the embedding application should hear about
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// A turn reached its final content
    TurnFinalized(Turn),
    /// The bridge reported an error for the current turn
    BridgeError(String),
    /// The connection manager gave up; call `start` again to retry
    Terminal(VoiceError),
}

struct HandlerState {
    protocol: ProtocolState,
    /// Turns before this index have been reported as finalized
    reported: usize,
}

/// Drives `ProtocolState` from connection callbacks and carries out its effects
pub struct ProtocolHandler {
    state: Mutex<HandlerState>,
    playback: Arc<PlaybackQueue>,
    connection: WeakConnection,
    notices: mpsc::UnboundedSender<SessionNotice>,
    output_rate: u32,
}

impl ProtocolHandler {
    pub fn new(
        session: SessionConfig,
        playback: Arc<PlaybackQueue>,
        connection: WeakConnection,
        notices: mpsc::UnboundedSender<SessionNotice>,
    ) -> Self {
        let output_rate = session.sample_rate;
        Self {
            state: Mutex::new(HandlerState {
                protocol: ProtocolState::new(session),
                reported: 0,
            }),
            playback,
            connection,
            notices,
            output_rate,
        }
    }

    fn state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the protocol state under the lock
    pub fn with_protocol<T>(&self, f: impl FnOnce(&ProtocolState) -> T) -> T {
        f(&self.state().protocol)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.state().protocol.set_speaking(speaking);
    }

    fn report_finalized(&self, state: &mut HandlerState) {
        let turns = state.protocol.turns();
        while state.reported < turns.len() && turns[state.reported].finalized {
            let _ = self
                .notices
                .send(SessionNotice::TurnFinalized(turns[state.reported].clone()));
            state.reported += 1;
        }
    }

    fn perform(&self, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::SendSessionUpdate(session) => {
                if let Err(e) = self.connection.send(&ClientEvent::SessionUpdate { session }) {
                    warn!("Failed to send session.update: {}", e);
                }
            }
            Effect::PlayAudio(samples) => {
                self.playback.enqueue(AudioFrame::new(samples, self.output_rate, 1));
            }
            Effect::FlushPlayback => self.playback.flush(),
            Effect::SurfaceError(message) => {
                let _ = self.notices.send(SessionNotice::BridgeError(message));
            }
        }
    }
}

impl SessionObserver for ProtocolHandler {
    fn on_message(&self, event: &ServerEvent) {
        let effect = {
            let mut state = self.state();
            let effect = state.protocol.apply(event.clone());
            self.report_finalized(&mut state);
            effect
        };
        self.perform(effect);
    }

    fn on_state_change(&self, connection: ConnectionState) {
        match connection {
            ConnectionState::Faulted | ConnectionState::Closing | ConnectionState::Idle => {
                debug!("Connection left open state ({:?})", connection);
                let effect = {
                    let mut state = self.state();
                    let effect = state.protocol.connection_lost();
                    self.report_finalized(&mut state);
                    effect
                };
                self.perform(effect);
            }
            _ => {}
        }
    }

    fn on_terminal_error(&self, error: &VoiceError) {
        let _ = self.notices.send(SessionNotice::Terminal(error.clone()));
    }
}
