//! Configuration types for streaming sessions

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Hard upper bound on offer creation attempts
pub const MAX_OFFER_ATTEMPTS: u32 = 5;

/// Main configuration for a streaming session
///
/// Every field has a default, so a config file only needs the values it
/// changes:
///
/// ```
/// use surfacecast_webrtc::config::{StreamConfig, VideoCodec};
///
/// let config = StreamConfig::from_toml_str(r#"
///     scale = 0.5
///
///     [encode]
///     width = 1280
///     height = 720
///     codec = "h264"
/// "#).unwrap();
/// assert_eq!(config.encode.codec, VideoCodec::H264);
/// assert_eq!(config.offer_retry_attempts, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// STUN server URLs (may be empty for host-only candidates)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Label of the media data channel (default: "media")
    pub data_channel_label: String,

    /// Offer creation attempts while the peer is not ready (default: 5, max: 5)
    pub offer_retry_attempts: u32,

    /// Fixed backoff between offer attempts in milliseconds (default: 200)
    pub offer_retry_backoff_ms: u64,

    /// Bounded wait for page readiness before capture starts (default: 30000)
    pub page_ready_timeout_ms: u64,

    /// Capacity of the per-session source event queue (default: 8)
    pub source_queue_capacity: usize,

    /// Buffered data channel bytes above which frames are skipped (default: 1 MiB)
    pub high_water_mark_bytes: usize,

    /// Consecutive encode failures before the session is stopped (default: 30)
    pub max_consecutive_encode_failures: u32,

    /// Time allowed for a session to drain on stop in milliseconds (default: 5000)
    pub stop_timeout_ms: u64,

    /// Codecs tried in order when the requested one is unsupported
    pub codec_fallbacks: Vec<VideoCodec>,

    /// Multiplex audio when the surface provides it (default: true)
    pub enable_audio: bool,

    /// Still quality requested from the frame source, 1-100 (default: 80)
    pub capture_quality: u8,

    /// Device scale applied to the viewport to get encode dimensions (default: 1.0)
    pub scale: f64,

    /// Initial encoder settings; `width`/`height` are the initial viewport
    pub encode: EncodeConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Supported video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// VP8 (WebRTC standard, wide compatibility)
    Vp8,
    /// VP9 (better compression, modern browsers)
    Vp9,
    /// H.264 (universal hardware decode)
    H264,
    /// AV1
    Av1,
    /// Intra-only JPEG; every chunk is a keyframe
    Mjpeg,
}

impl VideoCodec {
    /// All known codecs
    pub const ALL: [VideoCodec; 5] = [
        VideoCodec::Vp8,
        VideoCodec::Vp9,
        VideoCodec::H264,
        VideoCodec::Av1,
        VideoCodec::Mjpeg,
    ];

    /// Lowercase codec name
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "vp8",
            VideoCodec::Vp9 => "vp9",
            VideoCodec::H264 => "h264",
            VideoCodec::Av1 => "av1",
            VideoCodec::Mjpeg => "mjpeg",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VideoCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        VideoCodec::ALL
            .into_iter()
            .find(|codec| codec.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidConfig(format!("unknown video codec '{}'", s)))
    }
}

/// Encoder settings for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    /// Encoded frame width in pixels (even)
    pub width: u32,

    /// Encoded frame height in pixels (even)
    pub height: u32,

    /// Target bitrate in bits per second (default: 2 Mbps)
    pub target_bitrate: u32,

    /// Frames per second (default: 30, range: 1-120)
    pub framerate: u32,

    /// Maximum time between keyframes in seconds (default: 2.0)
    pub keyframe_interval_seconds: f64,

    /// Requested codec (default: VP8)
    pub codec: VideoCodec,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            target_bitrate: 2_000_000,
            framerate: 30,
            keyframe_interval_seconds: 2.0,
            codec: VideoCodec::Vp8,
        }
    }
}

impl EncodeConfig {
    /// Largest encode width or height
    pub const MAX_DIMENSION: u32 = 4096;

    /// Validate encoder parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `width` or `height` is zero, odd or above [`MAX_DIMENSION`](Self::MAX_DIMENSION)
    /// - `target_bitrate` is zero
    /// - `framerate` is not in range 1-120
    /// - `keyframe_interval_seconds` is not a positive finite number
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "encode dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }

        if self.width > Self::MAX_DIMENSION || self.height > Self::MAX_DIMENSION {
            return Err(Error::InvalidConfig(format!(
                "encode dimensions must be at most {} per side, got {}x{}",
                Self::MAX_DIMENSION,
                self.width,
                self.height
            )));
        }

        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "encode dimensions must be even, got {}x{}",
                self.width, self.height
            )));
        }

        if self.target_bitrate == 0 {
            return Err(Error::InvalidConfig(
                "target_bitrate must be greater than zero".to_string(),
            ));
        }

        if self.framerate == 0 || self.framerate > 120 {
            return Err(Error::InvalidConfig(format!(
                "framerate must be in range 1-120, got {}",
                self.framerate
            )));
        }

        if !self.keyframe_interval_seconds.is_finite() || self.keyframe_interval_seconds <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "keyframe_interval_seconds must be positive, got {}",
                self.keyframe_interval_seconds
            )));
        }

        Ok(())
    }

    /// Copy of this config with new dimensions
    pub fn with_dimensions(&self, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..self.clone()
        }
    }

    /// Copy of this config with another codec
    pub fn with_codec(&self, codec: VideoCodec) -> Self {
        Self {
            codec,
            ..self.clone()
        }
    }

    /// Keyframe pacing interval
    pub fn keyframe_interval(&self) -> Duration {
        Duration::from_secs_f64(self.keyframe_interval_seconds)
    }

    /// Nominal time between frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.framerate.max(1)
    }
}

/// Browser viewport in CSS pixels plus the device scale used for capture
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    /// Viewport width in CSS pixels
    pub width: u32,
    /// Viewport height in CSS pixels
    pub height: u32,
    /// Device scale factor applied when capturing
    pub scale: f64,
}

impl Viewport {
    /// Smallest encodable dimension
    pub const MIN_DIMENSION: u32 = 2;

    /// Largest accepted scale factor
    pub const MAX_SCALE: f64 = 4.0;

    /// Create a viewport
    pub fn new(width: u32, height: u32, scale: f64) -> Self {
        Self {
            width,
            height,
            scale,
        }
    }

    /// Validate viewport parameters, including the resulting encode size
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "viewport must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        validate_scale(self.scale)?;

        let (width, height) = self.encode_size();
        if width > EncodeConfig::MAX_DIMENSION || height > EncodeConfig::MAX_DIMENSION {
            return Err(Error::InvalidConfig(format!(
                "viewport {}x{} at scale {} encodes to {}x{}, above the {} limit",
                self.width,
                self.height,
                self.scale,
                width,
                height,
                EncodeConfig::MAX_DIMENSION
            )));
        }
        Ok(())
    }

    /// Encode dimensions: viewport times scale, rounded down to even values
    pub fn encode_size(&self) -> (u32, u32) {
        (
            scaled_even(self.width, self.scale),
            scaled_even(self.height, self.scale),
        )
    }

    /// Same viewport at another scale
    pub fn with_scale(&self, scale: f64) -> Self {
        Self { scale, ..*self }
    }
}

pub(crate) fn validate_scale(scale: f64) -> Result<()> {
    if !scale.is_finite() || scale <= 0.0 || scale > Viewport::MAX_SCALE {
        return Err(Error::InvalidConfig(format!(
            "scale must be in range (0, {}], got {}",
            Viewport::MAX_SCALE,
            scale
        )));
    }
    Ok(())
}

fn scaled_even(value: u32, scale: f64) -> u32 {
    let scaled = (f64::from(value) * scale).floor();
    let scaled = if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        scaled as u32
    };
    (scaled & !1).max(Viewport::MIN_DIMENSION)
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            data_channel_label: "media".to_string(),
            offer_retry_attempts: MAX_OFFER_ATTEMPTS,
            offer_retry_backoff_ms: 200,
            page_ready_timeout_ms: 30_000,
            source_queue_capacity: 8,
            high_water_mark_bytes: 1024 * 1024,
            max_consecutive_encode_failures: 30,
            stop_timeout_ms: 5_000,
            codec_fallbacks: vec![VideoCodec::H264, VideoCodec::Mjpeg],
            enable_audio: true,
            capture_quality: 80,
            scale: 1.0,
            encode: EncodeConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `offer_retry_attempts` is not in range 1-5
    /// - `source_queue_capacity` or `high_water_mark_bytes` is zero
    /// - `max_consecutive_encode_failures` is zero
    /// - `capture_quality` is not in range 1-100
    /// - `scale` is not in range (0, 4]
    /// - a TURN URL does not start with `turn:` or `turns:`
    /// - `data_channel_label` is empty
    /// - `encode` is invalid
    pub fn validate(&self) -> Result<()> {
        if self.offer_retry_attempts == 0 || self.offer_retry_attempts > MAX_OFFER_ATTEMPTS {
            return Err(Error::InvalidConfig(format!(
                "offer_retry_attempts must be in range 1-{}, got {}",
                MAX_OFFER_ATTEMPTS, self.offer_retry_attempts
            )));
        }

        if self.source_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "source_queue_capacity must be greater than zero".to_string(),
            ));
        }

        if self.high_water_mark_bytes == 0 {
            return Err(Error::InvalidConfig(
                "high_water_mark_bytes must be greater than zero".to_string(),
            ));
        }

        if self.max_consecutive_encode_failures == 0 {
            return Err(Error::InvalidConfig(
                "max_consecutive_encode_failures must be greater than zero".to_string(),
            ));
        }

        if self.capture_quality == 0 || self.capture_quality > 100 {
            return Err(Error::InvalidConfig(format!(
                "capture_quality must be in range 1-100, got {}",
                self.capture_quality
            )));
        }

        if self.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "data_channel_label must not be empty".to_string(),
            ));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        validate_scale(self.scale)?;
        self.encode.validate()?;
        self.initial_encode_config().validate()
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::InvalidConfig(format!("invalid TOML: {}", e)))
    }

    /// Load a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Viewport the session starts with
    pub fn initial_viewport(&self) -> Viewport {
        Viewport::new(self.encode.width, self.encode.height, self.scale)
    }

    /// Encoder settings at the initial viewport and scale
    pub fn initial_encode_config(&self) -> EncodeConfig {
        let (width, height) = self.initial_viewport().encode_size();
        self.encode.with_dimensions(width, height)
    }

    /// Codecs to try, requested first, without duplicates
    pub fn codec_preference(&self) -> Vec<VideoCodec> {
        let mut codecs = vec![self.encode.codec];
        for codec in &self.codec_fallbacks {
            if !codecs.contains(codec) {
                codecs.push(*codec);
            }
        }
        codecs
    }

    /// Backoff between offer attempts
    pub fn offer_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.offer_retry_backoff_ms)
    }

    /// Bounded page readiness wait
    pub fn page_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.page_ready_timeout_ms)
    }

    /// Drain timeout on stop
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Set the initial encoder settings
    pub fn with_encode(mut self, encode: EncodeConfig) -> Self {
        self.encode = encode;
        self
    }

    /// Set the initial scale
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Set the STUN servers
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the codec fallback order
    pub fn with_codec_fallbacks(mut self, codec_fallbacks: Vec<VideoCodec>) -> Self {
        self.codec_fallbacks = codec_fallbacks;
        self
    }
}
