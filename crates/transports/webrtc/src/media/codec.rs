//! Video encoder backends and capability negotiation
//!
//! Backends are synchronous and run on the blocking pool. Whether a
//! configuration can be encoded is reported as a [`CodecSupport`] value
//! carrying a reason, so callers can pick a fallback codec knowing why the
//! first choice failed.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use tracing::{debug, info};

use super::mjpeg::MjpegEncoder;
use super::picture::RawPicture;
use crate::config::{EncodeConfig, VideoCodec};
use crate::{Error, Result};

/// One unit of encoder output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
    /// Whether a decoder can start from this chunk
    pub is_keyframe: bool,
    /// Encoded bitstream
    pub payload: Bytes,
}

/// Video encoder backend
///
/// Implementations must leave their previous configuration in effect when
/// `reconfigure` fails.
pub trait VideoEncoderBackend: Send {
    /// Encode one picture, returning any chunks the encoder emits
    fn encode(
        &mut self,
        picture: &RawPicture,
        timestamp_us: u64,
        force_keyframe: bool,
    ) -> Result<Vec<EncodedChunk>>;

    /// Drain frames still held inside the encoder
    fn flush(&mut self) -> Result<Vec<EncodedChunk>>;

    /// Apply new settings (dimensions, bitrate, framerate)
    fn reconfigure(&mut self, config: &EncodeConfig) -> Result<()>;

    /// Codec this backend produces
    fn codec(&self) -> VideoCodec;
}

/// Result of probing an encoder configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecSupport {
    Supported,
    Unsupported { reason: String },
}

impl CodecSupport {
    /// Unsupported with a reason
    pub fn unsupported(reason: impl Into<String>) -> Self {
        CodecSupport::Unsupported {
            reason: reason.into(),
        }
    }

    /// Check if the configuration can be encoded
    pub fn is_supported(&self) -> bool {
        matches!(self, CodecSupport::Supported)
    }

    /// Why the configuration cannot be encoded
    pub fn reason(&self) -> Option<&str> {
        match self {
            CodecSupport::Supported => None,
            CodecSupport::Unsupported { reason } => Some(reason),
        }
    }
}

/// Creates encoder backends for sessions
pub trait EncoderFactory: Send + Sync {
    /// Check whether `config` can be encoded, without creating an encoder
    fn support(&self, config: &EncodeConfig) -> CodecSupport;

    /// Create an encoder for `config`
    fn create(&self, config: &EncodeConfig) -> Result<Box<dyn VideoEncoderBackend>>;
}

/// Pick the first codec in `preference` the factory supports
///
/// Fails with [`Error::CodecUnsupported`] listing every rejection reason.
pub fn negotiate_codec(
    factory: &dyn EncoderFactory,
    base: &EncodeConfig,
    preference: &[VideoCodec],
) -> Result<EncodeConfig> {
    let mut rejections = Vec::with_capacity(preference.len());

    for codec in preference {
        let candidate = base.with_codec(*codec);
        match factory.support(&candidate) {
            CodecSupport::Supported => {
                if *codec != base.codec {
                    info!(
                        requested = %base.codec,
                        selected = %codec,
                        "requested codec unsupported, using fallback"
                    );
                }
                return Ok(candidate);
            }
            CodecSupport::Unsupported { reason } => {
                debug!(codec = %codec, "codec rejected: {}", reason);
                rejections.push(format!("{}: {}", codec, reason));
            }
        }
    }

    Err(Error::CodecUnsupported(if rejections.is_empty() {
        "no codecs to try".to_string()
    } else {
        rejections.join("; ")
    }))
}

/// Encoders compiled into this crate
///
/// Backend availability is checked once per process; the result is the only
/// state shared between sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEncoders;

static BACKEND_SUPPORT: OnceLock<HashMap<VideoCodec, CodecSupport>> = OnceLock::new();

impl BuiltinEncoders {
    /// Availability of each codec's backend in this build
    pub fn backend_support() -> &'static HashMap<VideoCodec, CodecSupport> {
        BACKEND_SUPPORT.get_or_init(|| {
            let support: HashMap<_, _> = VideoCodec::ALL
                .into_iter()
                .map(|codec| (codec, check_backend(codec)))
                .collect();
            debug!(?support, "checked built-in encoder backends");
            support
        })
    }
}

fn check_backend(codec: VideoCodec) -> CodecSupport {
    match codec {
        VideoCodec::Mjpeg => CodecSupport::Supported,
        #[cfg(feature = "h264")]
        VideoCodec::H264 => super::h264::support(),
        #[cfg(not(feature = "h264"))]
        VideoCodec::H264 => CodecSupport::unsupported("built without the `h264` feature"),
        VideoCodec::Vp8 | VideoCodec::Vp9 | VideoCodec::Av1 => CodecSupport::unsupported(format!(
            "no built-in {} encoder; supply an EncoderFactory",
            codec
        )),
    }
}

impl EncoderFactory for BuiltinEncoders {
    fn support(&self, config: &EncodeConfig) -> CodecSupport {
        if let Err(e) = config.validate() {
            return CodecSupport::unsupported(e.to_string());
        }

        let backend = Self::backend_support()
            .get(&config.codec)
            .cloned()
            .unwrap_or_else(|| CodecSupport::unsupported("unknown codec"));
        if !backend.is_supported() {
            return backend;
        }

        match config.codec {
            VideoCodec::Mjpeg => MjpegEncoder::check(config),
            #[cfg(feature = "h264")]
            VideoCodec::H264 => super::h264::OpenH264Encoder::check(config),
            _ => CodecSupport::Supported,
        }
    }

    fn create(&self, config: &EncodeConfig) -> Result<Box<dyn VideoEncoderBackend>> {
        if let CodecSupport::Unsupported { reason } = self.support(config) {
            return Err(Error::CodecUnsupported(format!("{}: {}", config.codec, reason)));
        }

        match config.codec {
            VideoCodec::Mjpeg => Ok(Box::new(MjpegEncoder::new(config))),
            #[cfg(feature = "h264")]
            VideoCodec::H264 => Ok(Box::new(super::h264::OpenH264Encoder::new(config)?)),
            other => Err(Error::CodecUnsupported(format!(
                "{}: no built-in encoder",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_mjpeg_supported() {
        let config = EncodeConfig::default().with_codec(VideoCodec::Mjpeg);
        assert!(BuiltinEncoders.support(&config).is_supported());
        let encoder = BuiltinEncoders.create(&config).unwrap();
        assert_eq!(encoder.codec(), VideoCodec::Mjpeg);
    }

    #[test]
    fn test_builtin_vp8_reports_reason() {
        let support = BuiltinEncoders.support(&EncodeConfig::default());
        assert!(!support.is_supported());
        assert!(support.reason().unwrap().contains("vp8"));
    }

    #[test]
    fn test_invalid_config_unsupported() {
        let config = EncodeConfig::default()
            .with_codec(VideoCodec::Mjpeg)
            .with_dimensions(641, 480);
        assert!(!BuiltinEncoders.support(&config).is_supported());
        assert!(BuiltinEncoders.create(&config).is_err());
    }

    #[test]
    fn test_backend_support_cached() {
        let first = BuiltinEncoders::backend_support() as *const _;
        let second = BuiltinEncoders::backend_support() as *const _;
        assert_eq!(first, second);
    }

    #[test]
    fn test_negotiate_falls_back_in_order() {
        let base = EncodeConfig::default();
        let config = negotiate_codec(
            &BuiltinEncoders,
            &base,
            &[VideoCodec::Vp8, VideoCodec::Vp9, VideoCodec::Mjpeg],
        )
        .unwrap();
        assert_eq!(config.codec, VideoCodec::Mjpeg);
        assert_eq!(config.width, base.width);
    }

    #[test]
    fn test_negotiate_collects_all_reasons() {
        let err = negotiate_codec(
            &BuiltinEncoders,
            &EncodeConfig::default(),
            &[VideoCodec::Vp8, VideoCodec::Av1],
        )
        .unwrap_err();

        match err {
            Error::CodecUnsupported(reason) => {
                assert!(reason.contains("vp8:"));
                assert!(reason.contains("av1:"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
