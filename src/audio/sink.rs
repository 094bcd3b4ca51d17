use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::backend::AudioFrame;

/// Output device consumed by the playback queue
///
/// `play` returns once the frame has been rendered; the queue relies on
/// that to order frames and to know when speech has ended.
#[async_trait::async_trait]
pub trait AudioSink: Send {
    async fn play(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Called when the queue is flushed mid-frame
    fn interrupt(&mut self) {}

    fn name(&self) -> &str;
}

/// Sink that renders nothing but takes as long as real playback would
pub struct PacedSink;

#[async_trait::async_trait]
impl AudioSink for PacedSink {
    async fn play(&mut self, frame: &AudioFrame) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(frame.duration_ms())).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "paced"
    }
}

/// Sink that records everything played into a WAV file
///
/// The WAV format is fixed by the first frame; later frames with a
/// different format are skipped with a warning.
pub struct WavFileSink {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    sample_rate: u32,
    channels: u16,
    sample_count: usize,
}

impl WavFileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            sample_rate: 0,
            channels: 0,
            sample_count: 0,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn open(&mut self, frame: &AudioFrame) -> Result<()> {
        let spec = hound::WavSpec {
            channels: frame.channels,
            sample_rate: frame.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let writer = hound::WavWriter::create(&self.path, spec)
            .with_context(|| format!("Failed to create WAV file: {:?}", self.path))?;

        info!(
            "Recording playback to {} ({}Hz, {}ch)",
            self.path.display(),
            frame.sample_rate,
            frame.channels
        );

        self.writer = Some(writer);
        self.sample_rate = frame.sample_rate;
        self.channels = frame.channels;
        Ok(())
    }

    /// Flush the WAV header and close the file
    pub fn finish(mut self) -> Result<usize> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().context("Failed to finalize WAV file")?;
        }
        Ok(self.sample_count)
    }
}

#[async_trait::async_trait]
impl AudioSink for WavFileSink {
    async fn play(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.writer.is_none() {
            self.open(frame)?;
        }

        if frame.sample_rate != self.sample_rate || frame.channels != self.channels {
            warn!(
                "Skipping {}Hz/{}ch frame in {}Hz/{}ch recording",
                frame.sample_rate, frame.channels, self.sample_rate, self.channels
            );
            return Ok(());
        }

        if let Some(writer) = &mut self.writer {
            for &sample in &frame.samples {
                writer
                    .write_sample(sample)
                    .context("Failed to write sample to WAV")?;
            }
            self.sample_count += frame.samples.len();
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "wav-file"
    }
}

impl Drop for WavFileSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!("Failed to finalize WAV writer on drop: {}", e);
            }
        }
    }
}
