use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::file::AudioFile;
use crate::error::VoiceError;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
    /// Last frame of a turn (false = more audio follows)
    pub is_final: bool,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            timestamp_ms: 0,
            is_final: false,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        super::codec::duration_ms(self.samples.len(), self.sample_rate, self.channels)
    }
}

/// Configuration for audio backend
#[derive(Debug, Clone)]
pub struct AudioBackendConfig {
    /// Target sample rate
    pub target_sample_rate: u32,
    /// Target channel count (1 = mono, 2 = stereo)
    pub target_channels: u16,
    /// Buffer size in milliseconds (affects latency)
    pub buffer_duration_ms: u64,
}

impl Default for AudioBackendConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 24000, // 24kHz PCM16 is the realtime wire format
            target_channels: 1,        // Mono
            buffer_duration_ms: 100,   // 100ms buffers
        }
    }
}

impl From<&crate::config::AudioConfig> for AudioBackendConfig {
    fn from(cfg: &crate::config::AudioConfig) -> Self {
        Self {
            target_sample_rate: cfg.sample_rate,
            target_channels: cfg.channels,
            buffer_duration_ms: cfg.frame_ms,
        }
    }
}

/// Audio capture backend trait
///
/// Implementations:
/// - File: replay a WAV file in real time (CLI and batch use)
/// - Channel: frames pushed by an embedding host
#[async_trait::async_trait]
pub trait AudioBackend: Send + Sync {
    /// Start capturing audio
    ///
    /// Returns a channel receiver that will receive audio frames.
    /// Fails with `DeviceUnavailable` if the device is already held.
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, VoiceError>;

    /// Stop capturing audio. Safe to call when not capturing.
    async fn stop(&mut self) -> Result<(), VoiceError>;

    /// Check if backend is currently capturing
    fn is_capturing(&self) -> bool;

    /// Get backend name for logging
    fn name(&self) -> &str;
}

/// Audio source type
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// WAV file replayed as if it were a live device
    File(PathBuf),
    /// Frames pushed through a channel by the host application
    Channel,
}

/// Audio backend factory
pub struct AudioBackendFactory;

impl AudioBackendFactory {
    /// Create an audio backend for `source`
    ///
    /// For `AudioSource::Channel` the returned sender feeds the backend.
    pub fn create(
        source: AudioSource,
        config: AudioBackendConfig,
    ) -> Result<(Box<dyn AudioBackend>, Option<mpsc::Sender<AudioFrame>>)> {
        match source {
            AudioSource::File(path) => Ok((Box::new(FileBackend::new(path, config)), None)),
            AudioSource::Channel => {
                let (backend, tx) = ChannelBackend::new(64);
                Ok((Box::new(backend), Some(tx)))
            }
        }
    }
}

/// Replays a WAV file in `buffer_duration_ms` frames, paced at real time.
/// The last frame is flagged final so the bridge processes the turn.
pub struct FileBackend {
    path: PathBuf,
    config: AudioBackendConfig,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>, config: AudioBackendConfig) -> Self {
        Self {
            path: path.into(),
            config,
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for FileBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, VoiceError> {
        if self.is_capturing() {
            return Err(VoiceError::DeviceUnavailable(format!(
                "{} is already capturing",
                self.path.display()
            )));
        }

        let audio = AudioFile::open(&self.path)
            .map_err(|e| VoiceError::DeviceUnavailable(format!("{:#}", e)))?;

        if audio.sample_rate != self.config.target_sample_rate
            || audio.channels != self.config.target_channels
        {
            warn!(
                "{} is {}Hz/{}ch, session expects {}Hz/{}ch; recorder will convert",
                self.path.display(),
                audio.sample_rate,
                audio.channels,
                self.config.target_sample_rate,
                self.config.target_channels
            );
        }

        let frames = audio.frames(self.config.buffer_duration_ms);
        let pace = Duration::from_millis(self.config.buffer_duration_ms);
        let (tx, rx) = mpsc::channel(32);

        info!(
            "Replaying {} as capture device ({} frames)",
            self.path.display(),
            frames.len()
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pace);
            for frame in frames {
                ticker.tick().await;
                if tx.send(frame).await.is_err() {
                    debug!("Frame receiver dropped, ending file replay");
                    break;
                }
            }
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), VoiceError> {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("File capture stopped: {}", self.path.display());
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    fn name(&self) -> &str {
        "wav-file"
    }
}

/// Backend fed by an external producer through an mpsc sender.
///
/// The producer's receiver stays with the backend, so capture can be
/// stopped and started again on the same sender.
pub struct ChannelBackend {
    source: Arc<tokio::sync::Mutex<mpsc::Receiver<AudioFrame>>>,
    capacity: usize,
    relay: Option<JoinHandle<()>>,
}

impl ChannelBackend {
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<AudioFrame>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                source: Arc::new(tokio::sync::Mutex::new(rx)),
                capacity,
                relay: None,
            },
            tx,
        )
    }
}

#[async_trait::async_trait]
impl AudioBackend for ChannelBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>, VoiceError> {
        if self.is_capturing() {
            return Err(VoiceError::DeviceUnavailable(
                "channel backend is already capturing".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let source = Arc::clone(&self.source);
        self.relay = Some(tokio::spawn(async move {
            let mut source = source.lock().await;
            loop {
                // Reserve first so a frame is never taken and then lost
                let Ok(permit) = tx.reserve().await else {
                    break;
                };
                match source.recv().await {
                    Some(frame) => permit.send(frame),
                    None => break,
                }
            }
        }));

        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), VoiceError> {
        if let Some(relay) = self.relay.take() {
            relay.abort();
            // Wait for the abort so the source lock is free for the next start
            let _ = relay.await;
        }
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.relay.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    fn name(&self) -> &str {
        "channel"
    }
}
