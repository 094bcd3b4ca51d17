use crate::bridge::BridgeService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<BridgeService>,

    /// Open conversation sockets
    pub active_conversations: Arc<AtomicUsize>,

    pub started_at: Instant,
}

impl AppState {
    pub fn new(bridge: BridgeService) -> Self {
        Self {
            bridge: Arc::new(bridge),
            active_conversations: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn conversations(&self) -> usize {
        self.active_conversations.load(Ordering::SeqCst)
    }
}
