use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::ConnectionStats;
use crate::protocol::{SessionPhase, Turn};

/// Capture counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub frames_captured: u64,
    pub frames_sent: u64,
    /// Frames captured while the transport was not open
    pub frames_dropped: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RecorderCounters {
    pub captured: AtomicU64,
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
}

impl RecorderCounters {
    pub fn snapshot(&self) -> RecorderStats {
        RecorderStats {
            frames_captured: self.captured.load(Ordering::SeqCst),
            frames_sent: self.sent.load(Ordering::SeqCst),
            frames_dropped: self.dropped.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time view of a voice session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,

    pub started_at: DateTime<Utc>,

    pub phase: SessionPhase,

    pub connection: ConnectionStats,

    /// Conversation so far, oldest first
    pub turns: Vec<Turn>,

    /// User speech not yet finalized
    pub partial_transcript: String,

    pub is_speaking: bool,

    pub last_error: Option<String>,

    pub recorder: RecorderStats,

    pub frames_played: u64,
    pub frames_discarded: u64,
}
