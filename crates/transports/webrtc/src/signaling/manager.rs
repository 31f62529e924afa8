//! Offer/answer handshake and remote candidate queueing for one peer

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{IceCandidate, SessionDescription};
use crate::config::{StreamConfig, MAX_OFFER_ATTEMPTS};
use crate::peer::PeerBackend;
use crate::{Error, Result};

/// Signaling state of one session's peer connection
///
/// Remote candidates that arrive before the answer are held in FIFO order
/// and applied exactly once, right after the answer is installed.
pub struct ConnectionManager {
    session_id: String,
    peer: Arc<dyn PeerBackend>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_applied: bool,
    offer_attempts: u32,
    offer_backoff: Duration,
    connection_state: String,
}

impl ConnectionManager {
    pub fn new(session_id: impl Into<String>, peer: Arc<dyn PeerBackend>, config: &StreamConfig) -> Self {
        Self {
            session_id: session_id.into(),
            peer,
            pending_candidates: VecDeque::new(),
            remote_applied: false,
            offer_attempts: config.offer_retry_attempts.clamp(1, MAX_OFFER_ATTEMPTS),
            offer_backoff: config.offer_retry_backoff(),
            connection_state: "new".to_string(),
        }
    }

    /// Create the local offer
    ///
    /// Retries transient failures with a fixed backoff. Returns `Ok(None)`
    /// when every attempt failed; the caller treats that as fatal.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn create_offer(&mut self) -> Result<Option<SessionDescription>> {
        for attempt in 1..=self.offer_attempts {
            match self.peer.create_offer().await {
                Ok(offer) => {
                    debug!(attempt, "offer created");
                    return Ok(Some(offer));
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, max = self.offer_attempts, "offer not ready: {}", e);
                    if attempt < self.offer_attempts {
                        tokio::time::sleep(self.offer_backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        warn!(attempts = self.offer_attempts, "giving up on offer");
        Ok(None)
    }

    /// Install the remote answer and drain queued candidates in arrival order
    #[instrument(skip(self, answer), fields(session_id = %self.session_id))]
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.remote_applied {
            return Err(Error::SignalingError(
                "remote description already applied".to_string(),
            ));
        }

        self.peer.apply_answer(answer).await?;
        self.remote_applied = true;

        let queued = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!("queued ICE candidate rejected: {}", e);
            }
        }

        info!(drained = queued, "remote answer applied");
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the answer is in
    pub async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_applied {
            debug!(
                session_id = %self.session_id,
                queued = self.pending_candidates.len() + 1,
                "queueing ICE candidate until answer"
            );
            self.pending_candidates.push_back(candidate);
            return Ok(());
        }

        self.peer.add_ice_candidate(candidate).await
    }

    /// Whether the remote answer has been applied
    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }

    /// Candidates waiting for the answer
    pub fn pending_len(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn connection_state(&self) -> &str {
        &self.connection_state
    }

    pub fn set_connection_state(&mut self, state: impl Into<String>) {
        self.connection_state = state.into();
    }

    /// Close the peer connection; queued candidates are discarded
    pub async fn close(&mut self) -> Result<()> {
        self.pending_candidates.clear();
        self.peer.close().await
    }
}
