// Session-scoped playback queue
//
// Remote audio is decoded by the protocol handler and appended here. A single
// worker task drains the FIFO into the sink, one frame at a time, and
// publishes speaking/idle transitions through a watch channel. `flush`
// discards everything pending and interrupts the frame being played.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::AudioFrame;
use super::sink::AudioSink;

struct Shared {
    queue: Mutex<VecDeque<AudioFrame>>,
    wake: Notify,
    /// Flush generation; bumped under the queue lock
    epoch: watch::Sender<u64>,
    speaking: watch::Sender<bool>,
    played: AtomicU64,
    discarded: AtomicU64,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<AudioFrame>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_speaking(&self, speaking: bool) {
        self.speaking.send_if_modified(|current| {
            if *current == speaking {
                false
            } else {
                *current = speaking;
                true
            }
        });
    }
}

pub struct PlaybackQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackQueue {
    /// Create a queue draining into `sink`. Must be called inside a tokio runtime.
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        let (epoch, _) = watch::channel(0u64);
        let (speaking, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            epoch,
            speaking,
            played: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        });

        info!("Playback queue started (sink: {})", sink.name());
        let worker = tokio::spawn(run_worker(Arc::clone(&shared), sink));

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Append a frame; playback starts if the queue was idle
    pub fn enqueue(&self, frame: AudioFrame) {
        self.shared.queue().push_back(frame);
        self.shared.wake.notify_one();
    }

    /// Drop every pending frame, interrupt the current one and go idle
    pub fn flush(&self) {
        let dropped = {
            let mut queue = self.shared.queue();
            let dropped = queue.len();
            queue.clear();
            self.shared.epoch.send_modify(|epoch| *epoch += 1);
            dropped
        };

        self.shared
            .discarded
            .fetch_add(dropped as u64, Ordering::SeqCst);
        self.shared.set_speaking(false);

        if dropped > 0 {
            info!("Playback flushed ({} pending frames discarded)", dropped);
        }
    }

    pub fn is_speaking(&self) -> bool {
        *self.shared.speaking.borrow()
    }

    /// Watch speaking/idle transitions
    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.shared.speaking.subscribe()
    }

    /// Frames waiting to be played (excluding the one in the sink)
    pub fn len(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn played_count(&self) -> u64 {
        self.shared.played.load(Ordering::SeqCst)
    }

    pub fn discarded_count(&self) -> u64 {
        self.shared.discarded.load(Ordering::SeqCst)
    }

    /// Tear down the worker; pending frames are discarded
    pub fn close(&self) {
        self.flush();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            worker.abort();
            debug!("Playback worker stopped");
        }
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_worker(shared: Arc<Shared>, mut sink: Box<dyn AudioSink>) {
    let mut epoch_rx = shared.epoch.subscribe();

    loop {
        // Pop and observe the flush generation atomically with respect to flush()
        let next = {
            let mut queue = shared.queue();
            let frame = queue.pop_front();
            epoch_rx.borrow_and_update();
            frame
        };

        let frame = match next {
            Some(frame) => frame,
            None => {
                shared.set_speaking(false);
                shared.wake.notified().await;
                continue;
            }
        };

        shared.set_speaking(true);

        tokio::select! {
            biased;
            _ = epoch_rx.changed() => {
                sink.interrupt();
                debug!("Playback interrupted by flush");
            }
            result = sink.play(&frame) => {
                match result {
                    Ok(()) => {
                        shared.played.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => warn!("Sink {} failed to play frame: {:#}", sink.name(), e),
                }
            }
        }
    }
}
