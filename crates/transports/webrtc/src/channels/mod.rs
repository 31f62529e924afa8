//! Media data channel
//!
//! Encoded packets travel over a single unordered data channel with zero
//! retransmissions: a late video chunk is worth less than a dropped one.
//!
//! - [`PacketTransport`] - what the encode pipeline needs from a channel
//! - [`MediaChannel`] - webrtc-rs implementation

mod data_channel;

pub use data_channel::{DataChannelState, MediaChannel};

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Outbound packet transport used by the encode pipeline
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Whether the channel reports open
    fn is_open(&self) -> bool;

    /// Bytes queued in the channel but not yet on the network
    async fn buffered_amount(&self) -> usize;

    /// Send one packet as one message
    async fn send(&self, packet: Bytes) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}
