pub mod backend;
pub mod codec;
pub mod file;
pub mod playback;
pub mod sink;

pub use backend::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource, ChannelBackend,
    FileBackend,
};
pub use file::{wav_bytes, AudioFile};
pub use playback::PlaybackQueue;
pub use sink::{AudioSink, PacedSink, WavFileSink};
