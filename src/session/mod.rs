//! Voice session management
//!
//! This module provides the `VoiceSession` abstraction that manages:
//! - Audio capture and forwarding (`RecorderManager`)
//! - Protocol handling and playback of remote speech (`ProtocolHandler`)
//! - The bridge connection and its reconnect policy
//! - Session snapshots for the embedding application

mod config;
mod handler;
mod recorder;
mod session;
mod stats;

pub use config::SessionOptions;
pub use handler::{ProtocolHandler, SessionNotice};
pub use recorder::RecorderManager;
pub use session::VoiceSession;
pub use stats::{RecorderStats, SessionSnapshot};
