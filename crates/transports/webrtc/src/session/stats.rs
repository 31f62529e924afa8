//! Per-session streaming counters
//!
//! Updated from the session task and the frame sink, read from any thread
//! without going through the session.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Streaming statistics collector
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Video frames accepted by the encoder
    video_frames_encoded: AtomicU64,

    /// Video packets sent
    video_packets_sent: AtomicU64,

    /// Video payload bytes sent, headers included
    video_bytes_sent: AtomicU64,

    /// Keyframes sent
    keyframes_sent: AtomicU64,

    /// Audio chunks sent
    audio_chunks_sent: AtomicU64,

    /// Audio bytes sent, headers included
    audio_bytes_sent: AtomicU64,

    /// Frames dropped before reaching the wire
    frames_dropped: AtomicU64,

    /// Audio chunks dropped before reaching the wire
    audio_chunks_dropped: AtomicU64,

    /// Frames that failed to decode or encode
    encode_failures: AtomicU64,

    /// Current encode width
    encode_width: AtomicU32,

    /// Current encode height
    encode_height: AtomicU32,

    /// Last transport connection state
    last_connection_state: RwLock<String>,
}

impl SessionStats {
    /// Create a collector for the given encode size
    pub fn new(width: u32, height: u32) -> Self {
        let stats = Self::default();
        stats.set_encode_size(width, height);
        stats
    }

    /// Record a frame accepted by the encoder
    pub fn record_frame_encoded(&self) {
        self.video_frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a video packet on the wire
    pub fn record_video_sent(&self, bytes: usize, keyframe: bool) {
        self.video_packets_sent.fetch_add(1, Ordering::Relaxed);
        self.video_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
        if keyframe {
            self.keyframes_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an audio packet on the wire
    pub fn record_audio_sent(&self, bytes: usize) {
        self.audio_chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.audio_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a dropped video frame
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped audio chunk
    pub fn record_audio_dropped(&self) {
        self.audio_chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame that failed to decode or encode
    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the committed encode size
    pub fn set_encode_size(&self, width: u32, height: u32) {
        self.encode_width.store(width, Ordering::Relaxed);
        self.encode_height.store(height, Ordering::Relaxed);
    }

    /// Record the latest connection state
    pub fn set_connection_state(&self, state: &str) {
        let mut last = self.last_connection_state.write();
        if *last != state {
            *last = state.to_string();
        }
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            video_frames_encoded: self.video_frames_encoded.load(Ordering::Relaxed),
            video_packets_sent: self.video_packets_sent.load(Ordering::Relaxed),
            video_bytes_sent: self.video_bytes_sent.load(Ordering::Relaxed),
            keyframes_sent: self.keyframes_sent.load(Ordering::Relaxed),
            audio_chunks_sent: self.audio_chunks_sent.load(Ordering::Relaxed),
            audio_bytes_sent: self.audio_bytes_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            audio_chunks_dropped: self.audio_chunks_dropped.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            encode_width: self.encode_width.load(Ordering::Relaxed),
            encode_height: self.encode_height.load(Ordering::Relaxed),
            last_connection_state: self.last_connection_state.read().clone(),
        }
    }
}

/// Snapshot of session statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Video frames accepted by the encoder
    pub video_frames_encoded: u64,

    /// Video packets sent
    pub video_packets_sent: u64,

    /// Video bytes sent
    pub video_bytes_sent: u64,

    /// Keyframes sent
    pub keyframes_sent: u64,

    /// Audio chunks sent
    pub audio_chunks_sent: u64,

    /// Audio bytes sent
    pub audio_bytes_sent: u64,

    /// Frames dropped
    pub frames_dropped: u64,

    /// Audio chunks dropped
    pub audio_chunks_dropped: u64,

    /// Frames that failed to decode or encode
    pub encode_failures: u64,

    /// Current encode width
    pub encode_width: u32,

    /// Current encode height
    pub encode_height: u32,

    /// Last reported connection state (empty until the first report)
    pub last_connection_state: String,
}
