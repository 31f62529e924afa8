//! Packet types carried on the media data channel.

use bytes::Bytes;

/// Kind of media carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Encoded video chunk
    Video = 0x01,
    /// Encoded audio chunk
    Audio = 0x02,
}

impl PacketKind {
    /// Bit reserved in the kind byte for future extensions
    pub const EXTENSION_BIT: u8 = 0x80;

    /// Parse a kind byte
    ///
    /// Returns `None` for unknown kinds, including any byte with the
    /// extension bit set.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Video),
            0x02 => Some(Self::Audio),
            _ => None,
        }
    }

    /// Wire representation of this kind
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Header size for packets of this kind
    pub const fn header_size(self) -> usize {
        match self {
            Self::Video => WirePacket::VIDEO_HEADER_SIZE,
            Self::Audio => WirePacket::AUDIO_HEADER_SIZE,
        }
    }
}

/// A single multiplexed media packet
///
/// `is_keyframe` is only meaningful for video; audio packets always
/// carry `false` and the flag is not written to the wire for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    /// Media kind
    pub kind: PacketKind,
    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,
    /// Whether this video chunk is independently decodable
    pub is_keyframe: bool,
    /// Encoded media payload
    pub payload: Bytes,
}

impl WirePacket {
    /// Header size of a video packet (kind + timestamp + keyframe + length)
    pub const VIDEO_HEADER_SIZE: usize = 1 + 8 + 1 + 4;

    /// Header size of an audio packet (kind + timestamp + length)
    pub const AUDIO_HEADER_SIZE: usize = 1 + 8 + 4;

    /// Smallest header of any packet kind
    pub const MIN_HEADER_SIZE: usize = Self::AUDIO_HEADER_SIZE;

    /// Largest payload the length field can describe
    pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

    /// Create a video packet
    pub fn video(timestamp_us: u64, is_keyframe: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::Video,
            timestamp_us,
            is_keyframe,
            payload: payload.into(),
        }
    }

    /// Create an audio packet
    pub fn audio(timestamp_us: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: PacketKind::Audio,
            timestamp_us,
            is_keyframe: false,
            payload: payload.into(),
        }
    }

    /// Check if this is a video packet
    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }

    /// Check if this is an audio packet
    pub fn is_audio(&self) -> bool {
        self.kind == PacketKind::Audio
    }

    /// Size of this packet once encoded
    pub fn encoded_len(&self) -> usize {
        self.kind.header_size() + self.payload.len()
    }
}
