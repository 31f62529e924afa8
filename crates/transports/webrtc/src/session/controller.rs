//! Session registry and public control surface

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};

use super::actor::{launch, SessionHandle, SessionSpec};
use super::command::{Reply, SessionCommand};
use super::state::LifecycleState;
use super::stats::StatsSnapshot;
use crate::config::StreamConfig;
use crate::media::EncoderFactory;
use crate::peer::PeerFactory;
use crate::signaling::{IceCandidate, SessionDescription, SessionEvent};
use crate::surface::{InputEvent, SurfaceAdapter};
use crate::{Error, Result};

type Slot = Arc<Mutex<Option<SessionHandle>>>;

/// Owns every streaming session, keyed by session id
///
/// Each id maps to a slot guarded by an async mutex. `start` and `stop` hold
/// the slot for their whole duration, so a replacement session only begins
/// once its predecessor has fully stopped, and two sessions with the same
/// id are never live at once.
///
/// A session that stops by itself (lost connection, fatal encoder or
/// navigation failure) is unregistered as soon as it reaches `Stopped`.
///
/// Notifications from all sessions arrive on the receiver returned by
/// [`StreamController::new`].
pub struct StreamController {
    sessions: Arc<DashMap<String, Slot>>,
    next_generation: AtomicU64,
    peer_factory: Arc<dyn PeerFactory>,
    encoder_factory: Arc<dyn EncoderFactory>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl StreamController {
    pub fn new(
        peer_factory: Arc<dyn PeerFactory>,
        encoder_factory: Arc<dyn EncoderFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                sessions: Arc::new(DashMap::new()),
                next_generation: AtomicU64::new(1),
                peer_factory,
                encoder_factory,
                events,
            },
            events_rx,
        )
    }

    /// Lock the slot for `session_id`, creating it if needed
    async fn lock_slot(&self, session_id: &str) -> (Slot, OwnedMutexGuard<Option<SessionHandle>>) {
        loop {
            let slot = Arc::clone(self.sessions.entry(session_id.to_string()).or_default().value());
            let guard = Arc::clone(&slot).lock_owned().await;

            // The slot may have been removed while we waited for it
            let current = self
                .sessions
                .get(session_id)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &slot));
            if current {
                return (slot, guard);
            }
        }
    }

    fn release_slot(&self, session_id: &str, slot: &Slot) {
        self.sessions
            .remove_if(session_id, |_, existing| Arc::ptr_eq(existing, slot));
    }

    /// Remove the registration once this session instance reaches `Stopped`
    ///
    /// Does nothing if the slot has meanwhile been emptied by `stop` or
    /// taken over by a newer instance.
    fn unregister_on_exit(&self, session_id: &str, slot: &Slot, handle: &SessionHandle) {
        let sessions = Arc::clone(&self.sessions);
        let slot = Arc::clone(slot);
        let session_id = session_id.to_string();
        let generation = handle.generation;
        let mut state = handle.state.clone();

        tokio::spawn(async move {
            // An error means the task is gone, which ends the session too
            let _ = state.wait_for(LifecycleState::is_terminal).await;

            let mut guard = slot.lock().await;
            if !guard
                .as_ref()
                .is_some_and(|handle| handle.generation == generation)
            {
                return;
            }
            let Some(handle) = guard.take() else {
                return;
            };
            sessions.remove_if(&session_id, |_, existing| Arc::ptr_eq(existing, &slot));
            drop(guard);

            debug!(session_id = %session_id, "unregistering session that stopped itself");
            handle.stop().await;
        });
    }

    /// Start a session, stopping any live session with the same id first
    #[instrument(skip(self, config, surface))]
    pub async fn start(
        &self,
        session_id: &str,
        config: StreamConfig,
        surface: Arc<dyn SurfaceAdapter>,
    ) -> Result<()> {
        let (slot, mut guard) = self.lock_slot(session_id).await;

        if let Some(previous) = guard.take() {
            info!("replacing existing session");
            previous.stop().await;
        }

        let spec = SessionSpec {
            session_id: session_id.to_string(),
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            config,
            surface,
            peer_factory: Arc::clone(&self.peer_factory),
            encoder_factory: Arc::clone(&self.encoder_factory),
            events: self.events.clone(),
        };

        match launch(spec).await {
            Ok(handle) => {
                self.unregister_on_exit(session_id, &slot, &handle);
                *guard = Some(handle);
                Ok(())
            }
            Err(e) => {
                drop(guard);
                self.release_slot(session_id, &slot);
                Err(e)
            }
        }
    }

    /// Stop a session; succeeds whether or not it exists
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use surfacecast_webrtc::{BuiltinEncoders, RtcPeerFactory, StreamController};
    /// # tokio_test::block_on(async {
    /// let (controller, _events) =
    ///     StreamController::new(Arc::new(RtcPeerFactory), Arc::new(BuiltinEncoders));
    ///
    /// assert!(controller.stop("never-started").await.is_ok());
    /// assert!(controller.session_ids().is_empty());
    /// # });
    /// ```
    #[instrument(skip(self))]
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        if !self.sessions.contains_key(session_id) {
            debug!("stop for unknown session");
            return Ok(());
        }

        let (slot, mut guard) = self.lock_slot(session_id).await;
        if let Some(handle) = guard.take() {
            handle.stop().await;
        }
        drop(guard);
        self.release_slot(session_id, &slot);
        Ok(())
    }

    /// Stop every session
    pub async fn stop_all(&self) {
        let ids = self.session_ids();
        futures::future::join_all(ids.iter().map(|session_id| self.stop(session_id))).await;
    }

    /// Create the local offer; `None` means the peer never became ready
    /// and the session has been stopped
    pub async fn create_offer(&self, session_id: &str) -> Result<Option<SessionDescription>> {
        self.request(session_id, SessionCommand::CreateOffer).await
    }

    pub async fn apply_answer(&self, session_id: &str, answer: SessionDescription) -> Result<()> {
        self.request(session_id, |reply| SessionCommand::ApplyAnswer(answer, reply))
            .await
    }

    pub async fn add_ice_candidate(&self, session_id: &str, candidate: IceCandidate) -> Result<()> {
        self.request(session_id, |reply| {
            SessionCommand::AddIceCandidate(candidate, reply)
        })
        .await
    }

    /// Resize the surface to `width`x`height` CSS pixels at `scale`
    pub async fn reconfigure_viewport(
        &self,
        session_id: &str,
        width: u32,
        height: u32,
        scale: f64,
    ) -> Result<()> {
        self.request(session_id, |reply| SessionCommand::ReconfigureViewport {
            width,
            height,
            scale,
            reply,
        })
        .await
    }

    /// Change the encode scale, keeping the viewport size
    pub async fn reconfigure_scale(&self, session_id: &str, scale: f64) -> Result<()> {
        self.request(session_id, |reply| SessionCommand::ReconfigureScale { scale, reply })
            .await
    }

    /// Recover capture after the surface replaced its document
    pub async fn handle_navigation(&self, session_id: &str) -> Result<()> {
        self.request(session_id, SessionCommand::HandleNavigation).await
    }

    /// Forward a viewer input event to the surface
    pub async fn dispatch_input(&self, session_id: &str, event: InputEvent) -> Result<()> {
        self.request(session_id, |reply| SessionCommand::DispatchInput(event, reply))
            .await
    }

    /// Streaming counters, or `None` for an unknown session
    pub async fn get_stats(&self, session_id: &str) -> Option<StatsSnapshot> {
        let slot = self.existing_slot(session_id)?;
        let guard = slot.lock().await;
        guard.as_ref().map(|handle| handle.stats.snapshot())
    }

    /// Lifecycle state, or `None` for an unknown session
    pub async fn lifecycle_state(&self, session_id: &str) -> Option<LifecycleState> {
        let slot = self.existing_slot(session_id)?;
        let guard = slot.lock().await;
        guard.as_ref().map(SessionHandle::lifecycle_state)
    }

    /// Ids of registered sessions, sorted
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn existing_slot(&self, session_id: &str) -> Option<Slot> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Send a command to the session task and wait for its reply
    ///
    /// The slot is only held while cloning the command sender, so a slow
    /// operation never blocks `stop` from queueing behind it.
    async fn request<T, F>(&self, session_id: &str, make: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> SessionCommand,
    {
        let not_found = || Error::SessionNotFound(session_id.to_string());

        let slot = self.existing_slot(session_id).ok_or_else(not_found)?;
        let commands = {
            let guard = slot.lock().await;
            guard
                .as_ref()
                .map(|handle| handle.commands.clone())
                .ok_or_else(not_found)?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::SessionError(format!("session {} has stopped", session_id)))?;

        reply_rx.await.map_err(|_| {
            Error::SessionError(format!("session {} stopped before replying", session_id))
        })?
    }
}
