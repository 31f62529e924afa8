//! Video encode path
//!
//! - [`picture`] - still decoding and scaling
//! - [`codec`] - encoder backend traits and codec negotiation
//! - [`pipeline`] - the per-session encode pipeline

pub mod codec;
#[cfg(feature = "h264")]
mod h264;
mod mjpeg;
pub mod picture;
pub mod pipeline;

pub use codec::{
    negotiate_codec, BuiltinEncoders, CodecSupport, EncodedChunk, EncoderFactory,
    VideoEncoderBackend,
};
pub use mjpeg::MjpegEncoder;
pub use picture::RawPicture;
pub use pipeline::{DropReason, EncodePipeline, FrameOutcome, PipelineLimits};
