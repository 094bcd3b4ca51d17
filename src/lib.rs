pub mod audio;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod protocol;
pub mod session;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFile, AudioFrame, AudioSink,
    AudioSource, ChannelBackend, FileBackend, PacedSink, PlaybackQueue, WavFileSink,
};
pub use bridge::{
    BridgeOptions, BridgeService, ConversationEvent, InboundFrame, ProviderKind, SimulatedProvider,
    VoiceProvider,
};
pub use config::Config;
pub use connection::{
    ConnectionConfig, ConnectionManager, ConnectionState, SessionObserver, Transport,
    TransportEvent, TransportFactory,
};
pub use error::VoiceError;
pub use http::{create_router, AppState};
pub use protocol::{ClientEvent, ProtocolState, ServerEvent, SessionConfig, Turn};
pub use session::{RecorderManager, SessionNotice, SessionOptions, SessionSnapshot, VoiceSession};
