//! Intra-only JPEG backend
//!
//! Every chunk is a standalone JPEG, so every chunk is a keyframe. Viewers
//! that cannot use a WebCodecs decoder can still draw these directly.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;

use super::codec::{CodecSupport, EncodedChunk, VideoEncoderBackend};
use super::picture::RawPicture;
use crate::config::{EncodeConfig, VideoCodec};
use crate::{Error, Result};

const MAX_JPEG_DIMENSION: u32 = u16::MAX as u32;

pub struct MjpegEncoder {
    width: u32,
    height: u32,
    quality: u8,
}

impl MjpegEncoder {
    pub fn new(config: &EncodeConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            quality: quality_for(config),
        }
    }

    pub fn check(config: &EncodeConfig) -> CodecSupport {
        if config.width > MAX_JPEG_DIMENSION || config.height > MAX_JPEG_DIMENSION {
            return CodecSupport::unsupported(format!(
                "JPEG is limited to {0}x{0}, got {1}x{2}",
                MAX_JPEG_DIMENSION, config.width, config.height
            ));
        }
        CodecSupport::Supported
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

/// Map the bit budget per pixel onto a JPEG quality
fn quality_for(config: &EncodeConfig) -> u8 {
    let pixels_per_second =
        f64::from(config.width) * f64::from(config.height) * f64::from(config.framerate.max(1));
    let bits_per_pixel = f64::from(config.target_bitrate) / pixels_per_second.max(1.0);
    (40.0 + bits_per_pixel * 100.0).clamp(40.0, 90.0) as u8
}

impl VideoEncoderBackend for MjpegEncoder {
    fn encode(
        &mut self,
        picture: &RawPicture,
        timestamp_us: u64,
        _force_keyframe: bool,
    ) -> Result<Vec<EncodedChunk>> {
        if picture.width() != self.width || picture.height() != self.height {
            return Err(Error::EncodingError(format!(
                "picture is {}x{}, encoder configured for {}x{}",
                picture.width(),
                picture.height(),
                self.width,
                self.height
            )));
        }

        let image = picture
            .to_image()
            .ok_or_else(|| Error::EncodingError("picture buffer size mismatch".to_string()))?;

        let mut jpeg = Vec::with_capacity(picture.rgb().len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality)
            .encode_image(&image)
            .map_err(|e| Error::EncodingError(format!("JPEG encode failed: {}", e)))?;

        Ok(vec![EncodedChunk {
            timestamp_us,
            is_keyframe: true,
            payload: Bytes::from(jpeg),
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>> {
        Ok(Vec::new())
    }

    fn reconfigure(&mut self, config: &EncodeConfig) -> Result<()> {
        if let CodecSupport::Unsupported { reason } = Self::check(config) {
            return Err(Error::ReconfigurationRejected(reason));
        }
        self.width = config.width;
        self.height = config.height;
        self.quality = quality_for(config);
        Ok(())
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::Mjpeg
    }
}
