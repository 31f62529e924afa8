//! Remote browser surface streaming over WebRTC
//!
//! Captured stills from a remote browser surface are decoded, re-encoded,
//! wrapped in the `surfacecast-wire` packet format and pushed to a viewer
//! over one unordered, unreliable data channel. Resolution changes and
//! page navigations are handled on the live connection, without a new
//! signaling round trip.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  StreamController (registry, one slot per session id)    │
//! │  └─ session task (one per session)                       │
//! │     ├─ SurfaceAdapter ── FrameSink ──┐  stills, audio,   │
//! │     │   (browser automation)         │  cursor, navigate │
//! │     ├─ EncodePipeline  <─────────────┘                   │
//! │     │   └─ VideoEncoderBackend (spawn_blocking)          │
//! │     ├─ ConnectionManager (offer/answer, ICE queue)       │
//! │     │   └─ PeerBackend (webrtc-rs)                       │
//! │     └─ PacketTransport (media data channel)              │
//! │        ↓ surfacecast-wire packets                        │
//! │  Viewer                                                  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use surfacecast_webrtc::{StreamConfig, VideoCodec};
//!
//! let config = StreamConfig::default()
//!     .with_codec_fallbacks(vec![VideoCodec::Mjpeg]);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.initial_encode_config().width, 640);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use surfacecast_webrtc::{
//!     BuiltinEncoders, RtcPeerFactory, StreamConfig, StreamController, TestPatternSurface,
//! };
//!
//! # async fn example() -> surfacecast_webrtc::Result<()> {
//! let (controller, mut events) =
//!     StreamController::new(Arc::new(RtcPeerFactory), Arc::new(BuiltinEncoders));
//!
//! controller
//!     .start("tab-1", StreamConfig::default(), Arc::new(TestPatternSurface::new(30)))
//!     .await?;
//! let offer = controller.create_offer("tab-1").await?;
//! // relay `offer` and every event from `events` to the viewer
//! # let _ = (offer, events.recv().await);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod surface;

pub use channels::{MediaChannel, PacketTransport};
pub use config::{EncodeConfig, StreamConfig, TurnServerConfig, VideoCodec, Viewport};
pub use error::{Error, Result};
pub use media::{
    BuiltinEncoders, CodecSupport, EncodePipeline, EncodedChunk, EncoderFactory, RawPicture,
    VideoEncoderBackend,
};
pub use peer::{ConnectionEvent, PeerBackend, PeerFactory, PeerParts, RtcPeerFactory};
pub use session::{ActivePhase, LifecycleState, SessionStats, StatsSnapshot, StreamController};
pub use signaling::{IceCandidate, SdpKind, SessionDescription, SessionEvent, SessionNotification};
pub use surface::{
    AudioChunk, CaptureSize, FrameSink, InputEvent, SourceFrame, StillFormat, SurfaceAdapter,
    TestPatternSurface,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
