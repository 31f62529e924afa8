//! Peer connection seam
//!
//! The session never talks to webrtc-rs directly. A [`PeerFactory`] builds
//! the peer connection and its media channel, and everything the peer
//! reports asynchronously arrives as a [`ConnectionEvent`].

mod connection;

pub use connection::{RtcPeer, RtcPeerFactory};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channels::PacketTransport;
use crate::config::StreamConfig;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;

/// Asynchronous notifications raised by a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Local ICE candidate gathered
    LocalCandidate(IceCandidate),
    /// Peer connection state changed (`"connected"`, `"failed"`, ...)
    StateChanged(String),
    /// Media channel opened
    ChannelOpen,
    /// Media channel closed
    ChannelClosed,
}

/// Offer/answer and ICE operations on one peer connection
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Install the remote answer
    async fn apply_answer(&self, answer: SessionDescription) -> Result<()>;

    /// Add a remote ICE candidate; only valid after the answer is applied
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A freshly built peer and its media channel
pub struct PeerParts {
    pub backend: Arc<dyn PeerBackend>,
    pub transport: Arc<dyn PacketTransport>,
}

/// Builds one peer connection per session
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &str,
        config: &StreamConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<PeerParts>;
}
