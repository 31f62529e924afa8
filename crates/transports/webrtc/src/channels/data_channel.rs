//! WebRTC data channel carrying wire packets

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use super::PacketTransport;
use crate::peer::ConnectionEvent;
use crate::{Error, Result};

/// Media channel readiness as last reported by webrtc-rs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    /// Negotiated but SCTP not yet up
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Unordered, unreliable data channel for media packets
pub struct MediaChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
    state: Arc<RwLock<DataChannelState>>,
}

impl MediaChannel {
    /// Delivery settings: unordered, no retransmissions
    pub fn init() -> RTCDataChannelInit {
        RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        }
    }

    /// Create the media channel on a peer connection
    ///
    /// Open and close transitions are reported on `events`.
    pub async fn create(
        peer_connection: &RTCPeerConnection,
        label: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        let rtc_channel = peer_connection
            .create_data_channel(label, Some(Self::init()))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("cannot create media channel: {}", e))
            })?;

        let channel = Self {
            label: label.to_string(),
            rtc_channel,
            state: Arc::new(RwLock::new(DataChannelState::Connecting)),
        };
        channel.setup_state_handler(events);

        Ok(channel)
    }

    fn setup_state_handler(&self, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let state = Arc::clone(&self.state);
        let label = self.label.clone();
        let open_events = events.clone();

        self.rtc_channel.on_open(Box::new(move || {
            Box::pin(async move {
                debug!(label = %label, "media channel open");
                *state.write() = DataChannelState::Open;
                let _ = open_events.send(ConnectionEvent::ChannelOpen);
            })
        }));

        let state = Arc::clone(&self.state);
        let label = self.label.clone();

        self.rtc_channel.on_close(Box::new(move || {
            let state = Arc::clone(&state);
            let label = label.clone();
            let events = events.clone();
            Box::pin(async move {
                debug!(label = %label, "media channel closed by remote");
                *state.write() = DataChannelState::Closed;
                let _ = events.send(ConnectionEvent::ChannelClosed);
            })
        }));

        let label = self.label.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!(label = %label, "media channel error: {}", err);
            })
        }));
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> DataChannelState {
        *self.state.read()
    }
}

#[async_trait]
impl PacketTransport for MediaChannel {
    fn is_open(&self) -> bool {
        self.state() == DataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.rtc_channel.buffered_amount().await
    }

    async fn send(&self, packet: Bytes) -> Result<()> {
        let state = self.state();
        if state != DataChannelState::Open {
            return Err(Error::DataChannelError(format!(
                "media channel is {:?}",
                state
            )));
        }

        self.rtc_channel
            .send(&packet)
            .await
            .map_err(|e| Error::DataChannelError(format!("media channel send: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.state.write() = DataChannelState::Closing;

        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("media channel close: {}", e)))?;

        *self.state.write() = DataChannelState::Closed;

        debug!(label = %self.label, "media channel closed");
        Ok(())
    }
}
