//! Frame source contract
//!
//! The automation layer that drives the remote browser is an external
//! collaborator. It plugs in through [`SurfaceAdapter`] and pushes captured
//! stills, audio chunks and page signals into the session through a
//! [`FrameSink`].
//!
//! Flow control is owned by the source: it waits for
//! [`SurfaceAdapter::ack_frame`] before producing the next still. Every
//! delivered frame is acknowledged, including frames the session drops.

mod input;
mod test_pattern;

pub use input::{InputEvent, Modifiers, MouseButton};
pub use test_pattern::TestPatternSurface;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::Viewport;
use crate::session::SessionStats;
use crate::Result;

/// Compressed still formats a source may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StillFormat {
    Jpeg,
    Png,
}

/// A captured still frame
#[derive(Debug, Clone)]
pub struct SourceFrame {
    /// Compressed image bytes
    pub data: Bytes,
    /// Image format of `data`
    pub format: StillFormat,
    /// Source-assigned sequence number, echoed back in the acknowledgement
    pub sequence: u64,
}

/// A pre-encoded audio chunk from the audio capture collaborator
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
    /// Encoded audio payload
    pub payload: Bytes,
}

/// Capture parameters requested from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSize {
    /// Maximum capture width in device pixels
    pub width: u32,
    /// Maximum capture height in device pixels
    pub height: u32,
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Capture every Nth rendered frame (1 = every frame)
    pub every_nth_frame: u32,
}

impl CaptureSize {
    /// Capture at `width`x`height` with the given still quality
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width,
            height,
            quality,
            every_nth_frame: 1,
        }
    }
}

/// Media events queued from the source to the session
#[derive(Debug)]
pub(crate) enum SourceEvent {
    Frame(SourceFrame),
    Audio(AudioChunk),
}

/// Page-level signals from the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SurfaceSignal {
    CursorStyle(String),
    Navigated,
}

/// Adapter over the automation layer that renders the remote surface
#[async_trait]
pub trait SurfaceAdapter: Send + Sync {
    /// Install the in-page capture bindings, routing their output to `sink`
    ///
    /// Called at start and again after every document change, since the
    /// bindings do not survive a reload.
    async fn install_bindings(&self, sink: FrameSink) -> Result<()>;

    /// Wait until the page is ready for capture
    ///
    /// The session bounds this wait and proceeds on timeout.
    async fn wait_until_ready(&self) -> Result<()>;

    /// Begin pushing frames at the given size
    async fn start_frames(&self, size: CaptureSize) -> Result<()>;

    /// Stop pushing frames
    async fn stop_frames(&self) -> Result<()>;

    /// Flow-control acknowledgement for a delivered frame
    async fn ack_frame(&self, sequence: u64) -> Result<()>;

    /// Resize the browser viewport
    async fn set_viewport(&self, viewport: Viewport) -> Result<()>;

    /// Forward a viewer input event, already in CSS pixels
    async fn dispatch_input(&self, event: InputEvent) -> Result<()>;

    /// Whether this surface pushes audio chunks
    fn has_audio(&self) -> bool {
        false
    }
}

/// Bounded push handle given to a surface
///
/// Media pushes never block: when the session queue is full the event is
/// dropped, and a dropped frame is still acknowledged to the source.
#[derive(Clone)]
pub struct FrameSink {
    session_id: Arc<str>,
    media: mpsc::Sender<SourceEvent>,
    signals: mpsc::UnboundedSender<SurfaceSignal>,
    surface: Weak<dyn SurfaceAdapter>,
    stats: Arc<SessionStats>,
}

impl FrameSink {
    pub(crate) fn new(
        session_id: &str,
        media: mpsc::Sender<SourceEvent>,
        signals: mpsc::UnboundedSender<SurfaceSignal>,
        surface: Weak<dyn SurfaceAdapter>,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            session_id: Arc::from(session_id),
            media,
            signals,
            surface,
            stats,
        }
    }

    /// Session this sink feeds
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Push a captured frame; returns `false` if it was dropped
    pub fn push_frame(&self, frame: SourceFrame) -> bool {
        match self.media.try_send(SourceEvent::Frame(frame)) {
            Ok(()) => true,
            Err(err) => {
                if let SourceEvent::Frame(frame) = err.into_inner() {
                    self.stats.record_frame_dropped();
                    trace!(
                        session_id = %self.session_id,
                        sequence = frame.sequence,
                        "source queue full, dropping frame"
                    );
                    self.ack_dropped(frame.sequence);
                }
                false
            }
        }
    }

    /// Push an encoded audio chunk; returns `false` if it was dropped
    pub fn push_audio(&self, chunk: AudioChunk) -> bool {
        match self.media.try_send(SourceEvent::Audio(chunk)) {
            Ok(()) => true,
            Err(_) => {
                self.stats.record_audio_dropped();
                false
            }
        }
    }

    /// Report a cursor style change (CSS cursor keyword)
    pub fn cursor_style_changed(&self, style: impl Into<String>) {
        let _ = self.signals.send(SurfaceSignal::CursorStyle(style.into()));
    }

    /// Report that the document was replaced
    pub fn navigated(&self) {
        let _ = self.signals.send(SurfaceSignal::Navigated);
    }

    /// Whether the session has gone away
    pub fn is_closed(&self) -> bool {
        self.media.is_closed()
    }

    fn ack_dropped(&self, sequence: u64) {
        let Some(surface) = self.surface.upgrade() else {
            return;
        };
        let session_id = Arc::clone(&self.session_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = surface.ack_frame(sequence).await {
                        debug!(session_id = %session_id, sequence, "ack of dropped frame failed: {}", e);
                    }
                });
            }
            Err(_) => {
                debug!(session_id = %session_id, sequence, "no runtime to acknowledge dropped frame");
            }
        }
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
