//! Binary wire format for SurfaceCast media streams
//!
//! Every message on the media data channel is exactly one packet:
//!
//! ```text
//! ┌──────────┬──────────────────────┬───────────────┬──────────────────┬──────────┐
//! │ kind: u8 │ timestamp_us: u64 LE │ keyframe: u8  │ payload_len: u32 │ payload  │
//! │          │                      │ (video only)  │ LE               │          │
//! └──────────┴──────────────────────┴───────────────┴──────────────────┴──────────┘
//! ```
//!
//! The header is type-discriminated: video packets carry the keyframe flag,
//! audio packets do not, so a viewer can decode without any shared schema.
//! The high bit of the kind byte is reserved for future extensions and is
//! rejected by this version of the decoder.
//!
//! # Example
//!
//! ```
//! use surfacecast_wire::{decode, encode, WirePacket};
//!
//! let packet = WirePacket::video(33_000, true, vec![0x9d, 0x01, 0x2a]);
//! let bytes = encode(&packet).unwrap();
//! assert_eq!(decode(&bytes).unwrap(), packet);
//! ```

#![warn(clippy::all)]

pub mod codec;
pub mod packet;

pub use codec::{decode, decode_from, encode, WireError};
pub use packet::{PacketKind, WirePacket};

/// Result type alias for wire operations
pub type Result<T> = std::result::Result<T, WireError>;
