use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the voice session and bridge components
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoiceError {
    /// Transport-level failure (socket error, abnormal close). Recoverable.
    #[error("transport error: {0}")]
    Transport(String),

    /// `connect()` called while a connection attempt is already in flight
    #[error("connection attempt already in progress")]
    AlreadyConnecting,

    /// `send()` called while the transport is not open
    #[error("transport is not open")]
    NotConnected,

    /// Transport did not become ready within the connect timeout
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Capture device busy or denied
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Malformed audio or wire payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Upstream provider failure on the bridge side
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Retry budget spent; the caller has to reconnect manually
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    /// Session was closed by the caller
    #[error("session closed")]
    Closed,
}

impl VoiceError {
    /// Whether the connection manager retries this error on its own
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VoiceError::Transport(_) | VoiceError::ConnectTimeout(_) | VoiceError::NotConnected
        )
    }

    /// Whether this error ends the session until the caller re-initiates it
    pub fn is_terminal(&self) -> bool {
        matches!(self, VoiceError::ReconnectExhausted { .. } | VoiceError::Closed)
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(VoiceError::Transport("reset".into()).is_recoverable());
        assert!(VoiceError::ConnectTimeout(Duration::from_secs(20)).is_recoverable());
        assert!(!VoiceError::DeviceUnavailable("busy".into()).is_recoverable());

        assert!(VoiceError::ReconnectExhausted { attempts: 5 }.is_terminal());
        assert!(VoiceError::Closed.is_terminal());
        assert!(!VoiceError::Upstream("500".into()).is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = VoiceError::ReconnectExhausted { attempts: 5 };
        assert_eq!(err.to_string(), "reconnect attempts exhausted after 5 tries");
    }
}
