use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::stats::{RecorderCounters, RecorderStats};
use crate::audio::{codec, AudioBackend, AudioBackendConfig, AudioFrame};
use crate::connection::ConnectionManager;
use crate::error::VoiceError;
use crate::protocol::ClientEvent;

const STOP_GRACE: Duration = Duration::from_secs(1);

/// Owns the capture device and forwards its frames to the connection.
///
/// Frames captured while the transport is not open are dropped and counted;
/// capture itself keeps running through reconnects.
pub struct RecorderManager {
    backend: Box<dyn AudioBackend>,
    connection: ConnectionManager,
    target: AudioBackendConfig,
    counters: Arc<RecorderCounters>,
    task: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl RecorderManager {
    pub fn new(
        backend: Box<dyn AudioBackend>,
        connection: ConnectionManager,
        target: AudioBackendConfig,
    ) -> Self {
        Self {
            backend,
            connection,
            target,
            counters: Arc::default(),
            task: None,
        }
    }

    /// Acquire the device and start forwarding.
    ///
    /// Fails with `DeviceUnavailable` if capture is already running. A
    /// forwarder whose source ran dry is released first.
    pub async fn start(&mut self) -> Result<(), VoiceError> {
        if self.task.as_ref().is_some_and(|(_, task)| task.is_finished()) {
            debug!("Previous capture ended on its own, releasing device");
            self.stop().await?;
        }

        if self.task.is_some() || self.backend.is_capturing() {
            return Err(VoiceError::DeviceUnavailable(format!(
                "{} is already capturing",
                self.backend.name()
            )));
        }

        info!("Starting capture from {}", self.backend.name());
        let frames = self.backend.start().await?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(forward_frames(
            frames,
            stop_rx,
            self.connection.clone(),
            self.target.clone(),
            Arc::clone(&self.counters),
        ));
        self.task = Some((stop_tx, task));

        Ok(())
    }

    /// Stop forwarding and release the device. Safe to call repeatedly.
    pub async fn stop(&mut self) -> Result<(), VoiceError> {
        let Some((stop_tx, mut task)) = self.task.take() else {
            return Ok(());
        };

        let _ = stop_tx.send(());
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!("Capture forwarder did not stop in time, aborting");
            task.abort();
        }

        let result = self.backend.stop().await;
        let stats = self.stats();
        info!(
            "Capture stopped ({} captured, {} sent, {} dropped)",
            stats.frames_captured, stats.frames_sent, stats.frames_dropped
        );
        result
    }

    pub fn is_recording(&self) -> bool {
        self.task.as_ref().is_some_and(|(_, task)| !task.is_finished())
    }

    pub fn stats(&self) -> RecorderStats {
        self.counters.snapshot()
    }

    /// Bring a captured frame to the wire format (mono, target rate)
    pub fn process_frame(frame: AudioFrame, target: &AudioBackendConfig) -> AudioFrame {
        let mut processed = frame;

        if processed.channels == 2 && target.target_channels == 1 {
            processed = Self::stereo_to_mono(processed);
        }

        if processed.sample_rate != target.target_sample_rate {
            processed = Self::downsample(processed, target.target_sample_rate);
        }

        processed
    }

    /// Decimate by an integer ratio; other ratios pass through unchanged
    fn downsample(frame: AudioFrame, target_rate: u32) -> AudioFrame {
        if target_rate == 0 || frame.sample_rate <= target_rate || frame.sample_rate % target_rate != 0 {
            return frame;
        }

        let ratio = (frame.sample_rate / target_rate) as usize;
        let channels = frame.channels.max(1) as usize;
        let samples = frame
            .samples
            .chunks_exact(channels)
            .step_by(ratio)
            .flatten()
            .copied()
            .collect();

        AudioFrame {
            samples,
            sample_rate: target_rate,
            ..frame
        }
    }

    /// Average left and right
    fn stereo_to_mono(frame: AudioFrame) -> AudioFrame {
        let samples = frame
            .samples
            .chunks_exact(2)
            .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
            .collect();

        AudioFrame {
            samples,
            channels: 1,
            ..frame
        }
    }
}

impl Drop for RecorderManager {
    fn drop(&mut self) {
        if let Some((_, task)) = self.task.take() {
            task.abort();
        }
    }
}

async fn forward_frames(
    mut frames: mpsc::Receiver<AudioFrame>,
    mut stop: oneshot::Receiver<()>,
    connection: ConnectionManager,
    target: AudioBackendConfig,
    counters: Arc<RecorderCounters>,
) {
    debug!("Capture forwarder started");

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut stop => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        counters.captured.fetch_add(1, Ordering::SeqCst);
        let frame = RecorderManager::process_frame(frame, &target);
        let event = ClientEvent::AudioAppend {
            audio: codec::encode(&frame.samples),
            is_final: frame.is_final,
        };

        match connection.send(&event) {
            Ok(()) => {
                counters.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                let dropped = counters.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                if dropped == 1 || dropped % 50 == 0 {
                    warn!("Dropping captured audio ({} frames so far): {}", dropped, e);
                }
            }
        }
    }

    debug!("Capture forwarder stopped");
}
