//! Encoding and decoding of [`WirePacket`]s.
//!
//! All integers are little-endian. Decoding never reads past the input and
//! never panics: any short or inconsistent buffer yields
//! [`WireError::MalformedPacket`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::packet::{PacketKind, WirePacket};
use crate::Result;

/// Errors from the wire codec
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input does not describe a valid packet
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Payload cannot be described by the 32-bit length field
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Encode a packet into a freshly allocated buffer
pub fn encode(packet: &WirePacket) -> Result<Bytes> {
    if packet.payload.len() > WirePacket::MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(packet.payload.len()));
    }

    let mut buf = BytesMut::with_capacity(packet.encoded_len());
    buf.put_u8(packet.kind.as_u8());
    buf.put_u64_le(packet.timestamp_us);
    if packet.kind == PacketKind::Video {
        buf.put_u8(u8::from(packet.is_keyframe));
    }
    buf.put_u32_le(packet.payload.len() as u32);
    buf.put_slice(&packet.payload);

    Ok(buf.freeze())
}

/// Decode exactly one packet from `data`
///
/// Trailing bytes after the declared payload are rejected: every data
/// channel message carries a single packet.
pub fn decode(data: &[u8]) -> Result<WirePacket> {
    let mut buf = data;
    let packet = decode_from(&mut buf)?;
    if buf.has_remaining() {
        return Err(WireError::MalformedPacket(format!(
            "{} trailing bytes after payload",
            buf.remaining()
        )));
    }
    Ok(packet)
}

/// Decode one packet from the front of `buf`, advancing past it
///
/// On error the buffer position is unspecified.
pub fn decode_from<B: Buf>(buf: &mut B) -> Result<WirePacket> {
    if buf.remaining() < WirePacket::MIN_HEADER_SIZE {
        return Err(WireError::MalformedPacket(format!(
            "need at least {} header bytes, got {}",
            WirePacket::MIN_HEADER_SIZE,
            buf.remaining()
        )));
    }

    let kind_byte = buf.get_u8();
    if kind_byte & PacketKind::EXTENSION_BIT != 0 {
        return Err(WireError::MalformedPacket(format!(
            "reserved extension bit set in kind 0x{kind_byte:02x}"
        )));
    }
    let kind = PacketKind::from_u8(kind_byte)
        .ok_or_else(|| WireError::MalformedPacket(format!("unknown kind 0x{kind_byte:02x}")))?;

    // Kind byte already consumed
    let rest_of_header = kind.header_size() - 1;
    if buf.remaining() < rest_of_header {
        return Err(WireError::MalformedPacket(format!(
            "{:?} header needs {} bytes, got {}",
            kind,
            kind.header_size(),
            buf.remaining() + 1
        )));
    }

    let timestamp_us = buf.get_u64_le();
    let is_keyframe = match kind {
        PacketKind::Video => match buf.get_u8() {
            0 => false,
            1 => true,
            other => {
                return Err(WireError::MalformedPacket(format!(
                    "invalid keyframe flag {other}"
                )))
            }
        },
        PacketKind::Audio => false,
    };

    let payload_len = buf.get_u32_le() as usize;
    if buf.remaining() < payload_len {
        return Err(WireError::MalformedPacket(format!(
            "declared payload of {} bytes exceeds remaining {}",
            payload_len,
            buf.remaining()
        )));
    }
    let payload = buf.copy_to_bytes(payload_len);

    Ok(WirePacket {
        kind,
        timestamp_us,
        is_keyframe,
        payload,
    })
}
