//! OpenH264 software encoder backend (`h264` feature)

use bytes::Bytes;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate, FrameType};
use openh264::formats::{RgbSliceU8, YUVBuffer};
use openh264::OpenH264API;
use tracing::debug;

use super::codec::{CodecSupport, EncodedChunk, VideoEncoderBackend};
use super::picture::RawPicture;
use crate::config::{EncodeConfig, VideoCodec};
use crate::{Error, Result};

/// Largest frame the baseline profile levels we target can carry
const MAX_H264_DIMENSION: u32 = 4096;

/// Whether the bundled OpenH264 library initialises
pub(super) fn support() -> CodecSupport {
    match build_encoder(&EncodeConfig::default().with_codec(VideoCodec::H264)) {
        Ok(_) => CodecSupport::Supported,
        Err(e) => CodecSupport::unsupported(format!("OpenH264 unavailable: {}", e)),
    }
}

fn build_encoder(config: &EncodeConfig) -> Result<Encoder> {
    let encoder_config = EncoderConfig::new()
        .bitrate(BitRate::from_bps(config.target_bitrate))
        .max_frame_rate(FrameRate::from_hz(config.framerate as f32));

    Encoder::with_api_config(OpenH264API::from_source(), encoder_config)
        .map_err(|e| Error::EncodingError(format!("failed to create H.264 encoder: {}", e)))
}

pub struct OpenH264Encoder {
    encoder: Encoder,
    config: EncodeConfig,
}

impl OpenH264Encoder {
    pub fn new(config: &EncodeConfig) -> Result<Self> {
        Ok(Self {
            encoder: build_encoder(config)?,
            config: config.clone(),
        })
    }

    pub fn check(config: &EncodeConfig) -> CodecSupport {
        if config.width > MAX_H264_DIMENSION || config.height > MAX_H264_DIMENSION {
            return CodecSupport::unsupported(format!(
                "H.264 encode limited to {0}x{0}, got {1}x{2}",
                MAX_H264_DIMENSION, config.width, config.height
            ));
        }
        CodecSupport::Supported
    }
}

impl VideoEncoderBackend for OpenH264Encoder {
    fn encode(
        &mut self,
        picture: &RawPicture,
        timestamp_us: u64,
        force_keyframe: bool,
    ) -> Result<Vec<EncodedChunk>> {
        if picture.width() != self.config.width || picture.height() != self.config.height {
            return Err(Error::EncodingError(format!(
                "picture is {}x{}, encoder configured for {}x{}",
                picture.width(),
                picture.height(),
                self.config.width,
                self.config.height
            )));
        }

        let rgb = RgbSliceU8::new(
            picture.rgb(),
            (picture.width() as usize, picture.height() as usize),
        );
        let yuv = YUVBuffer::from_rgb_source(rgb);

        if force_keyframe {
            self.encoder.force_intra_frame();
        }

        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| Error::EncodingError(format!("H.264 encode failed: {}", e)))?;

        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip) {
            return Ok(Vec::new());
        }

        Ok(vec![EncodedChunk {
            timestamp_us,
            is_keyframe: matches!(frame_type, FrameType::IDR | FrameType::I),
            payload: Bytes::from(bitstream.to_vec()),
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>> {
        // OpenH264 emits synchronously; nothing is held back
        Ok(Vec::new())
    }

    fn reconfigure(&mut self, config: &EncodeConfig) -> Result<()> {
        if let CodecSupport::Unsupported { reason } = Self::check(config) {
            return Err(Error::ReconfigurationRejected(reason));
        }
        let encoder = build_encoder(config)
            .map_err(|e| Error::ReconfigurationRejected(e.to_string()))?;
        debug!(
            width = config.width,
            height = config.height,
            "rebuilt H.264 encoder"
        );
        self.encoder = encoder;
        self.config = config.clone();
        Ok(())
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::H264
    }
}
