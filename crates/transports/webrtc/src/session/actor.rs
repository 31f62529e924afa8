//! Per-session task
//!
//! Everything that touches a session's encoder, peer connection or surface
//! runs inside one task, so control operations, source frames, signaling
//! callbacks and page signals are serialized without shared locks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use super::command::SessionCommand;
use super::state::{ActivePhase, LifecycleState};
use super::stats::SessionStats;
use crate::channels::PacketTransport;
use crate::config::{StreamConfig, Viewport};
use crate::media::{negotiate_codec, EncodePipeline, EncoderFactory, FrameOutcome, PipelineLimits};
use crate::peer::{ConnectionEvent, PeerBackend, PeerFactory};
use crate::signaling::{ConnectionManager, SessionEvent, SessionNotification};
use crate::surface::{CaptureSize, FrameSink, SourceEvent, SurfaceAdapter, SurfaceSignal};
use crate::{Error, Result};

const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Everything needed to bring a session up
pub(crate) struct SessionSpec {
    pub session_id: String,
    pub generation: u64,
    pub config: StreamConfig,
    pub surface: Arc<dyn SurfaceAdapter>,
    pub peer_factory: Arc<dyn PeerFactory>,
    pub encoder_factory: Arc<dyn EncoderFactory>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Controller-side handle to a running session task
///
/// Holds its own references to the media channel and peer so they can be
/// closed even if the task has to be aborted.
pub(crate) struct SessionHandle {
    pub commands: mpsc::Sender<SessionCommand>,
    pub state: watch::Receiver<LifecycleState>,
    pub stats: Arc<SessionStats>,
    /// Distinguishes successive sessions registered under one id
    pub generation: u64,
    stop_timeout: Duration,
    stop_requested: watch::Sender<bool>,
    lifecycle: Arc<Lifecycle>,
    transport: Arc<dyn PacketTransport>,
    peer: Arc<dyn PeerBackend>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Stop the task and wait for it
    ///
    /// Whatever the task is waiting on is interrupted first. A task that
    /// still overruns the stop timeout is aborted, and its channel and peer
    /// are closed from here.
    pub async fn stop(self) {
        let SessionHandle {
            commands,
            stop_timeout,
            stop_requested,
            lifecycle,
            transport,
            peer,
            task,
            ..
        } = self;

        stop_requested.send_replace(true);

        let (reply_tx, reply_rx) = oneshot::channel();
        let acknowledged = tokio::time::timeout(stop_timeout, async {
            if commands.send(SessionCommand::Stop(reply_tx)).await.is_ok() {
                let _ = reply_rx.await;
            }
        })
        .await;
        if acknowledged.is_err() {
            warn!(timeout = ?stop_timeout, "session did not stop in time, aborting task");
            task.abort();
        }

        let Err(e) = task.await else {
            return;
        };
        if e.is_panic() {
            error!("session task panicked: {}", e);
        }

        // The task never finished its own shutdown
        if let Err(e) = transport.close().await {
            debug!(session_id = %lifecycle.session_id, "channel close failed: {}", e);
        }
        if let Err(e) = peer.close().await {
            debug!(session_id = %lifecycle.session_id, "peer close failed: {}", e);
        }
        lifecycle.abandon();
        info!(session_id = %lifecycle.session_id, "aborted session released");
    }
}

/// Lifecycle publisher shared by bootstrap and the running task
struct Lifecycle {
    session_id: String,
    state: watch::Sender<LifecycleState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Lifecycle {
    fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn transition(&self, next: LifecycleState) {
        let current = self.current();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                session_id = %self.session_id,
                from = %current,
                to = %next,
                "ignoring illegal lifecycle transition"
            );
            return;
        }

        self.state.send_replace(next);
        info!(session_id = %self.session_id, from = %current, to = %next, "lifecycle transition");
        self.notify(SessionNotification::lifecycle(next));
    }

    /// Walk a failed start down to `Stopped`
    fn abandon(&self) {
        self.transition(LifecycleState::Stopping);
        self.transition(LifecycleState::Stopped);
    }

    fn notify(&self, notification: SessionNotification) {
        let _ = self
            .events
            .send(SessionEvent::new(self.session_id.clone(), notification));
    }
}

/// Receivers drained by the session loop
struct Inbox {
    commands: mpsc::Receiver<SessionCommand>,
    media: mpsc::Receiver<SourceEvent>,
    signals: mpsc::UnboundedReceiver<SurfaceSignal>,
    connection: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// One unit of work for the session loop
enum Input {
    Command(SessionCommand),
    Connection(ConnectionEvent),
    Surface(SurfaceSignal),
    Source(SourceEvent),
}

impl Input {
    fn name(&self) -> &'static str {
        match self {
            Input::Command(command) => command.name(),
            Input::Connection(_) => "connection_event",
            Input::Surface(_) => "surface_signal",
            Input::Source(_) => "source_event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Resolves once a stop has been requested
async fn stop_signalled(stop_requested: &mut watch::Receiver<bool>) {
    if stop_requested.wait_for(|requested| *requested).await.is_err() {
        // Handle dropped; the closed command queue ends the loop instead
        std::future::pending::<()>().await;
    }
}

/// Bring a session up and spawn its task
///
/// Fails without leaving anything running: every resource acquired before
/// the failure is released before this returns.
pub(crate) async fn launch(spec: SessionSpec) -> Result<SessionHandle> {
    spec.config.validate()?;

    let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
    let lifecycle = Arc::new(Lifecycle {
        session_id: spec.session_id.clone(),
        state: state_tx,
        events: spec.events.clone(),
    });
    lifecycle.transition(LifecycleState::Starting);

    let encode = match negotiate_codec(
        spec.encoder_factory.as_ref(),
        &spec.config.initial_encode_config(),
        &spec.config.codec_preference(),
    ) {
        Ok(encode) => encode,
        Err(e) => {
            warn!(session_id = %spec.session_id, "no usable encoder: {}", e);
            lifecycle.abandon();
            return Err(e);
        }
    };

    let (connection_tx, connection_rx) = mpsc::unbounded_channel();
    let parts = match spec
        .peer_factory
        .create(&spec.session_id, &spec.config, connection_tx)
        .await
    {
        Ok(parts) => parts,
        Err(e) => {
            warn!(session_id = %spec.session_id, "failed to create peer connection: {}", e);
            lifecycle.abandon();
            return Err(e);
        }
    };

    let stats = Arc::new(SessionStats::new(encode.width, encode.height));
    let (media_tx, media_rx) = mpsc::channel(spec.config.source_queue_capacity);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

    let sink = FrameSink::new(
        &spec.session_id,
        media_tx,
        signal_tx,
        Arc::downgrade(&spec.surface),
        Arc::clone(&stats),
    );
    let pipeline = EncodePipeline::new(
        spec.session_id.clone(),
        encode,
        spec.encoder_factory,
        Arc::clone(&parts.transport),
        Arc::clone(&stats),
        PipelineLimits {
            high_water_mark_bytes: spec.config.high_water_mark_bytes,
            max_consecutive_failures: spec.config.max_consecutive_encode_failures,
        },
    );
    let peer = Arc::clone(&parts.backend);
    let connection = ConnectionManager::new(spec.session_id.clone(), parts.backend, &spec.config);
    let stop_timeout = spec.config.stop_timeout();
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut actor = SessionActor {
        session_id: spec.session_id,
        viewport: spec.config.initial_viewport(),
        config: spec.config,
        surface: spec.surface,
        sink,
        connection,
        transport: Arc::clone(&parts.transport),
        pipeline,
        stats: Arc::clone(&stats),
        lifecycle: Arc::clone(&lifecycle),
    };

    if let Err(e) = actor.bring_up().await {
        warn!(session_id = %actor.session_id, "session start failed: {}", e);
        actor.shutdown().await;
        return Err(e);
    }
    actor
        .lifecycle
        .transition(LifecycleState::Active(ActivePhase::HeadlessReady));

    let inbox = Inbox {
        commands: command_rx,
        media: media_rx,
        signals: signal_rx,
        connection: connection_rx,
    };
    let span = tracing::info_span!("session", session_id = %actor.session_id);
    let task = tokio::spawn(actor.run(inbox, stop_rx).instrument(span));

    Ok(SessionHandle {
        commands: command_tx,
        state: state_rx,
        stats,
        generation: spec.generation,
        stop_timeout,
        stop_requested: stop_tx,
        lifecycle,
        transport: parts.transport,
        peer,
        task,
    })
}

struct SessionActor {
    session_id: String,
    config: StreamConfig,
    viewport: Viewport,
    surface: Arc<dyn SurfaceAdapter>,
    sink: FrameSink,
    connection: ConnectionManager,
    transport: Arc<dyn PacketTransport>,
    pipeline: EncodePipeline,
    stats: Arc<SessionStats>,
    lifecycle: Arc<Lifecycle>,
}

impl SessionActor {
    /// Install bindings, start the encoder and the frame feed
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    async fn bring_up(&mut self) -> Result<()> {
        self.surface
            .install_bindings(self.sink.clone())
            .await
            .map_err(|e| Error::SurfaceError(format!("failed to install capture bindings: {}", e)))?;

        self.wait_for_page().await;
        self.pipeline.start()?;

        if self.surface.has_audio() && !self.config.enable_audio {
            info!("surface provides audio but audio is disabled");
        }

        self.surface.set_viewport(self.viewport).await?;
        self.surface.start_frames(self.capture_size(self.viewport)).await?;

        info!(
            codec = %self.pipeline.codec(),
            width = self.pipeline.config().width,
            height = self.pipeline.config().height,
            "session ready"
        );
        Ok(())
    }

    async fn run(mut self, mut inbox: Inbox, mut stop_requested: watch::Receiver<bool>) {
        debug!("session loop started");

        let stop_reply = loop {
            let input = tokio::select! {
                biased;

                command = inbox.commands.recv() => match command {
                    Some(SessionCommand::Stop(reply)) => break Some(reply),
                    Some(command) => Input::Command(command),
                    // Controller dropped the handle
                    None => break None,
                },

                Some(event) = inbox.connection.recv() => Input::Connection(event),

                Some(signal) = inbox.signals.recv() => Input::Surface(signal),

                Some(event) = inbox.media.recv() => Input::Source(event),
            };

            // A pending stop cancels in-flight work; the queued Stop is
            // picked up on the next iteration
            let name = input.name();
            let flow = tokio::select! {
                biased;

                () = stop_signalled(&mut stop_requested) => {
                    debug!(input = name, "stop requested, abandoning in-flight work");
                    Flow::Continue
                }

                flow = self.on_input(input) => flow,
            };

            if flow == Flow::Stop {
                break None;
            }
        };

        self.shutdown().await;
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
        debug!("session loop finished");
    }

    async fn on_input(&mut self, input: Input) -> Flow {
        match input {
            Input::Command(command) => self.on_command(command).await,
            Input::Connection(event) => self.on_connection_event(event).await,
            Input::Surface(signal) => self.on_surface_signal(signal).await,
            Input::Source(event) => self.on_source_event(event).await,
        }
    }

    async fn on_command(&mut self, command: SessionCommand) -> Flow {
        debug!(command = command.name(), "handling command");

        match command {
            SessionCommand::CreateOffer(reply) => {
                let result = self.connection.create_offer().await;
                let flow = match &result {
                    Ok(Some(_)) => Flow::Continue,
                    Ok(None) => self.on_error(&Error::PeerNotReady(
                        "peer connection never became ready for an offer".to_string(),
                    )),
                    Err(e) => self.on_error(e),
                };
                let _ = reply.send(result);
                flow
            }

            SessionCommand::ApplyAnswer(answer, reply) => {
                let result = self.connection.apply_answer(answer).await;
                if result.is_ok() {
                    self.lifecycle
                        .transition(LifecycleState::Active(ActivePhase::ClientConnected));
                }
                let _ = reply.send(result);
                Flow::Continue
            }

            SessionCommand::AddIceCandidate(candidate, reply) => {
                let _ = reply.send(self.connection.add_ice_candidate(candidate).await);
                Flow::Continue
            }

            SessionCommand::ReconfigureViewport {
                width,
                height,
                scale,
                reply,
            } => {
                let next = Viewport::new(width, height, scale);
                self.on_reconfigure(next, reply).await
            }

            SessionCommand::ReconfigureScale { scale, reply } => {
                let next = self.viewport.with_scale(scale);
                self.on_reconfigure(next, reply).await
            }

            SessionCommand::HandleNavigation(reply) => {
                let result = self.recover_navigation().await;
                let flow = match &result {
                    Ok(()) => Flow::Continue,
                    Err(e) => self.on_error(e),
                };
                let _ = reply.send(result);
                flow
            }

            SessionCommand::DispatchInput(event, reply) => {
                let event = event.to_viewport_space(self.viewport.scale);
                let _ = reply.send(self.surface.dispatch_input(event).await);
                Flow::Continue
            }

            SessionCommand::Stop(reply) => {
                let _ = reply.send(());
                Flow::Stop
            }
        }
    }

    async fn on_reconfigure(&mut self, next: Viewport, reply: super::command::Reply<()>) -> Flow {
        let result = self.reconfigure(next).await;
        let flow = match &result {
            Ok(()) => Flow::Continue,
            Err(e) => self.on_error(e),
        };
        let _ = reply.send(result);
        flow
    }

    async fn on_connection_event(&mut self, event: ConnectionEvent) -> Flow {
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                self.lifecycle
                    .notify(SessionNotification::ice_candidate(candidate));
            }
            ConnectionEvent::StateChanged(state) => {
                self.connection.set_connection_state(state.clone());
                self.stats.set_connection_state(&state);
                self.lifecycle
                    .notify(SessionNotification::connection_state(state.clone()));

                if state == "failed" || state == "closed" {
                    warn!(state = %state, "peer connection lost");
                    return Flow::Stop;
                }
            }
            ConnectionEvent::ChannelOpen => {
                info!("media channel open");
                self.pipeline.request_keyframe();
            }
            ConnectionEvent::ChannelClosed => {
                info!("media channel closed");
            }
        }
        Flow::Continue
    }

    async fn on_surface_signal(&mut self, signal: SurfaceSignal) -> Flow {
        match signal {
            SurfaceSignal::CursorStyle(style) => {
                self.lifecycle.notify(SessionNotification::cursor_style(style));
                Flow::Continue
            }
            SurfaceSignal::Navigated => match self.recover_navigation().await {
                Ok(()) => Flow::Continue,
                Err(e) => self.on_error(&e),
            },
        }
    }

    async fn on_source_event(&mut self, event: SourceEvent) -> Flow {
        match event {
            SourceEvent::Frame(frame) => {
                let outcome = self.pipeline.on_source_frame(&frame).await;

                // Acknowledge every delivered frame, encoded or not
                if let Err(e) = self.surface.ack_frame(frame.sequence).await {
                    debug!(sequence = frame.sequence, "frame ack failed: {}", e);
                }

                match outcome {
                    Ok(FrameOutcome::Encoded { .. }) => {
                        if self.lifecycle.current()
                            == LifecycleState::Active(ActivePhase::ClientConnected)
                        {
                            self.lifecycle
                                .transition(LifecycleState::Active(ActivePhase::Streaming));
                        }
                        Flow::Continue
                    }
                    Ok(FrameOutcome::Dropped(_)) => Flow::Continue,
                    Err(e) => self.on_error(&e),
                }
            }
            SourceEvent::Audio(chunk) => {
                if self.config.enable_audio {
                    self.pipeline.on_audio_chunk(chunk).await;
                } else {
                    self.stats.record_audio_dropped();
                }
                Flow::Continue
            }
        }
    }

    /// Change the surface size on the live connection
    ///
    /// Tries an in-place encoder reconfiguration first. If that or the
    /// surface resize fails, restarts the encode pipeline (never the
    /// handshake). If the restart fails too, the previous size is restored
    /// and the call is rejected.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    async fn reconfigure(&mut self, next: Viewport) -> Result<()> {
        next.validate()?;
        let previous = self.viewport;
        let (width, height) = next.encode_size();

        // Set once the surface may no longer match `previous`
        let mut surface_changed = false;
        let cause = match self.pipeline.reconfigure(width, height).await {
            Ok(()) => match self.resize_surface(next).await {
                Ok(()) => {
                    self.viewport = next;
                    info!(width = next.width, height = next.height, scale = next.scale, "reconfigured in place");
                    return Ok(());
                }
                Err(e) => {
                    surface_changed = true;
                    e
                }
            },
            Err(e) => e,
        };

        warn!("in-place reconfiguration failed, restarting pipeline: {}", cause);
        let rejected = match self.pipeline.restart(width, height).await {
            Ok(()) => match self.resize_surface(next).await {
                Ok(()) => {
                    self.viewport = next;
                    info!(width = next.width, height = next.height, "reconfigured by pipeline restart");
                    return Ok(());
                }
                Err(e) => {
                    surface_changed = true;
                    e
                }
            },
            Err(e @ Error::EncodingError(_)) => return Err(e),
            // The pipeline rebuilt the encoder it had before the restart
            Err(e) => e,
        };

        let (width, height) = previous.encode_size();
        let encoder = self.pipeline.config();
        if (encoder.width, encoder.height) != (width, height) {
            self.pipeline.restart(width, height).await.map_err(|restore| {
                Error::EncodingError(format!("could not restore previous encoder: {}", restore))
            })?;
        }
        if surface_changed {
            self.resize_surface(previous).await.map_err(|restore| {
                Error::SessionError(format!("could not restore previous surface size: {}", restore))
            })?;
        }
        Err(Error::ReconfigurationRejected(format!(
            "{}; restart also failed: {}",
            cause, rejected
        )))
    }

    async fn resize_surface(&mut self, viewport: Viewport) -> Result<()> {
        self.surface.stop_frames().await?;
        self.surface.set_viewport(viewport).await?;
        self.surface.start_frames(self.capture_size(viewport)).await
    }

    /// Reinstall capture bindings after a document change
    ///
    /// The connection and encoder are untouched; the feed restarts at the
    /// current size and the next frame is a keyframe.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    async fn recover_navigation(&mut self) -> Result<()> {
        info!("document changed, reinstalling capture bindings");

        if let Err(e) = self.surface.stop_frames().await {
            debug!("stop_frames before rebinding failed: {}", e);
        }

        self.surface
            .install_bindings(self.sink.clone())
            .await
            .map_err(|e| Error::NavigationRecoveryFailed(format!("bindings: {}", e)))?;

        self.wait_for_page().await;

        self.surface
            .start_frames(self.capture_size(self.viewport))
            .await
            .map_err(|e| Error::NavigationRecoveryFailed(format!("frame feed: {}", e)))?;

        self.pipeline.request_keyframe();
        Ok(())
    }

    /// Bounded wait for page readiness; never fails
    async fn wait_for_page(&self) {
        let timeout = self.config.page_ready_timeout();
        match tokio::time::timeout(timeout, self.surface.wait_until_ready()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %self.session_id, "page readiness check failed, continuing: {}", e),
            Err(_) => warn!(session_id = %self.session_id, ?timeout, "page not ready in time, continuing"),
        }
    }

    fn capture_size(&self, viewport: Viewport) -> CaptureSize {
        let (width, height) = viewport.encode_size();
        CaptureSize::new(width, height, self.config.capture_quality)
    }

    /// Stop on errors that leave the session unusable; others were
    /// already reported to the caller
    fn on_error(&self, error: &Error) -> Flow {
        if !error.is_fatal_to_session() {
            debug!("request failed, session continues: {}", error);
            return Flow::Continue;
        }

        error!("session failed: {}", error);
        self.lifecycle.notify(SessionNotification::error(error));
        Flow::Stop
    }

    /// Release the feed, encoder, channel and peer. Safe in any state.
    async fn shutdown(&mut self) {
        self.lifecycle.transition(LifecycleState::Stopping);

        if let Err(e) = self.surface.stop_frames().await {
            debug!(session_id = %self.session_id, "stop_frames failed: {}", e);
        }
        self.pipeline.stop();
        if let Err(e) = self.transport.close().await {
            debug!(session_id = %self.session_id, "channel close failed: {}", e);
        }
        if let Err(e) = self.connection.close().await {
            debug!(session_id = %self.session_id, "peer close failed: {}", e);
        }
        self.stats.set_connection_state("closed");

        self.lifecycle.transition(LifecycleState::Stopped);
        info!(session_id = %self.session_id, "session stopped");
    }
}
