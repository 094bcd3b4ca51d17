// Shared fixtures for integration tests: an in-memory transport, a
// recording audio sink and a polling helper.

#![allow(dead_code)]

use anyhow::{bail, Result};
use loqa_voice::audio::{AudioFrame, AudioSink};
use loqa_voice::connection::{Backoff, ConnectionConfig, Transport, TransportEvent, TransportFactory};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const PONG: &str = r#"{"type":"pong"}"#;
pub const HANDSHAKE: &str = r#"{"type":"session.connected","session_id":"test"}"#;

/// Connection settings with millisecond backoff so reconnect tests run fast
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        url: "mock://bridge".to_string(),
        connect_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(10),
        stale_after: Duration::from_secs(20),
        backoff: Backoff {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            jitter: 0.0,
        },
        max_reconnect_attempts: 5,
        send_queue: 16,
    }
}

/// Poll `check` until it holds or `limit` passes
pub async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[derive(Default)]
struct MockState {
    connects: AtomicUsize,
    /// Upcoming connects to refuse
    fail_next: AtomicUsize,
    connect_delay_ms: AtomicUsize,
    silent: AtomicBool,
    no_handshake: AtomicBool,
    sent: Mutex<Vec<String>>,
    close_codes: Mutex<Vec<u16>>,
    current: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

/// Transport factory standing in for the bridge
#[derive(Clone, Default)]
pub struct MockFactory {
    state: Arc<MockState>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Stop answering pings
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn skip_handshake(&self) {
        self.state.no_handshake.store(true, Ordering::SeqCst);
    }

    /// Everything the client sent, across connections
    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn sent_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .filter_map(|s| serde_json::from_str::<serde_json::Value>(s).ok())
            .filter(|v| v["type"] == kind)
            .collect()
    }

    pub fn close_codes(&self) -> Vec<u16> {
        self.state.close_codes.lock().unwrap().clone()
    }

    /// Deliver a server message on the live connection
    pub async fn push(&self, json: &str) {
        let tx = self.state.current.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Message(json.to_string())).await;
        }
    }

    /// Simulate the server closing the live connection
    pub async fn drop_connection(&self, code: u16) {
        let tx = self.state.current.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx
                .send(TransportEvent::Closed {
                    code,
                    reason: "test".to_string(),
                })
                .await;
        }
    }
}

struct MockTransport {
    state: Arc<MockState>,
    events: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn send_text(&self, text: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("socket is closed");
        }
        let is_ping = text.contains(r#""type":"ping""#);
        self.state.sent.lock().unwrap().push(text);

        if is_ping && !self.state.silent.load(Ordering::SeqCst) {
            let _ = self.events.try_send(TransportEvent::Message(PONG.to_string()));
        }
        Ok(())
    }

    async fn close(&self, code: u16, _reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.close_codes.lock().unwrap().push(code);
        }
    }
}

#[async_trait::async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let refuse = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            bail!("connection refused");
        }

        let (tx, rx) = mpsc::channel(64);
        if !self.state.no_handshake.load(Ordering::SeqCst) {
            tx.try_send(TransportEvent::Message(HANDSHAKE.to_string()))?;
        }
        *self.state.current.lock().unwrap() = Some(tx.clone());

        let transport = MockTransport {
            state: Arc::clone(&self.state),
            events: tx,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(transport), rx))
    }
}

/// Sink that keeps every frame it was asked to play
#[derive(Clone)]
pub struct RecordingSink {
    pub played: Arc<Mutex<Vec<Vec<i16>>>>,
    pub interrupts: Arc<AtomicUsize>,
    delay: Duration,
}

impl RecordingSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            played: Arc::default(),
            interrupts: Arc::default(),
            delay,
        }
    }

    pub fn played(&self) -> Vec<Vec<i16>> {
        self.played.lock().unwrap().clone()
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AudioSink for RecordingSink {
    async fn play(&mut self, frame: &AudioFrame) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.played.lock().unwrap().push(frame.samples.clone());
        Ok(())
    }

    fn interrupt(&mut self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "recording"
    }
}
