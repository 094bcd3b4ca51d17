use crate::audio::AudioBackendConfig;
use crate::connection::ConnectionConfig;
use crate::protocol::SessionConfig;

/// Everything a voice session needs besides its audio devices
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Local identifier used in logs (e.g., "voice-3f2a...")
    pub session_id: String,

    /// Connection manager settings
    pub connection: ConnectionConfig,

    /// Sent to the bridge in `session.update` after the handshake
    pub session: SessionConfig,

    /// Wire format of captured frames
    pub audio: AudioBackendConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_id: format!("voice-{}", uuid::Uuid::new_v4()),
            connection: ConnectionConfig::default(),
            session: SessionConfig::default(),
            audio: AudioBackendConfig::default(),
        }
    }
}

impl SessionOptions {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            connection: ConnectionConfig::from(&cfg.client),
            session: SessionConfig::from_config(cfg),
            audio: AudioBackendConfig::from(&cfg.audio),
            ..Self::default()
        }
    }
}
