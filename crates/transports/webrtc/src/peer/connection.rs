//! webrtc-rs peer connection

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{ConnectionEvent, PeerBackend, PeerFactory, PeerParts};
use crate::channels::MediaChannel;
use crate::config::StreamConfig;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn ice_servers(config: &StreamConfig) -> Vec<RTCIceServer> {
    config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }))
        .collect()
}

/// Server-side peer connection offering one media data channel
pub struct RtcPeer {
    session_id: String,
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    /// Build the peer connection and wire its callbacks into `events`
    #[instrument(skip(config, events))]
    pub async fn connect(
        session_id: &str,
        config: &StreamConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<(Self, MediaChannel)> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        let state_events = events.clone();
        let sid = session_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                let sid = sid.clone();
                Box::pin(async move {
                    info!(session_id = %sid, %state, "peer connection state changed");
                    let _ = events.send(ConnectionEvent::StateChanged(state.to_string()));
                })
            },
        ));

        let candidate_events = events.clone();
        let sid = session_id.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let sid = sid.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(ConnectionEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => warn!(session_id = %sid, "failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let channel =
            MediaChannel::create(&peer_connection, &config.data_channel_label, events).await?;

        Ok((
            Self {
                session_id: session_id.to_string(),
                peer_connection,
            },
            channel,
        ))
    }
}

#[async_trait]
impl PeerBackend for RtcPeer {
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.peer_connection.connection_state() == RTCPeerConnectionState::Closed {
            return Err(Error::PeerConnectionError(
                "peer connection is closed".to_string(),
            ));
        }

        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::PeerNotReady(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting offer".to_string()))?;

        debug!("created SDP offer");
        Ok(SessionDescription::offer(local.sdp))
    }

    #[instrument(skip(self, answer), fields(session_id = %self.session_id))]
    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        if answer.kind != SdpKind::Answer {
            return Err(Error::SdpError(format!(
                "expected an answer, got {:?}",
                answer.kind
            )));
        }

        let description = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| Error::SdpError(format!("Invalid SDP answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        debug!("applied SDP answer");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close peer: {}", e)))
    }
}

/// Builds [`RtcPeer`]s from the stream config's ICE servers
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        session_id: &str,
        config: &StreamConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<PeerParts> {
        let (peer, channel) = RtcPeer::connect(session_id, config, events).await?;
        Ok(PeerParts {
            backend: Arc::new(peer),
            transport: Arc::new(channel),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServerConfig;

    #[test]
    fn test_ice_servers_include_turn_credentials() {
        let config = StreamConfig::default()
            .with_stun_servers(vec!["stun:stun.example.org:3478".to_string()])
            .with_turn_servers(vec![TurnServerConfig {
                url: "turn:turn.example.org:3478".to_string(),
                username: "user".to_string(),
                credential: "secret".to_string(),
            }]);

        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_candidate_conversion() {
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host").with_mid("0", 0);
        let init: RTCIceCandidateInit = candidate.clone().into();
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(IceCandidate::from(init), candidate);
    }

    #[tokio::test]
    async fn test_offer_contains_data_channel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = StreamConfig::default().with_stun_servers(Vec::new());
        let (peer, _channel) = RtcPeer::connect("offer-test", &config, tx).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));

        peer.close().await.unwrap();
        assert!(peer.create_offer().await.is_err());
    }
}
