//! In-process doubles for driving sessions end to end
//!
//! Sessions run against the real controller, actor and encode pipeline.
//! Only the collaborators at the edges are replaced:
//!
//! - [`MockSurface`] stands in for the browser automation layer
//! - [`ScriptedEncoders`] produces tiny deterministic "bitstreams"
//! - [`MockPeers`] replaces webrtc-rs and records signaling traffic
//! - [`RecordingTransport`] captures every packet put on the media channel

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use surfacecast_webrtc::{
    AudioChunk, CaptureSize, CodecSupport, ConnectionEvent, EncodeConfig, EncodedChunk,
    EncoderFactory, Error, FrameSink, IceCandidate, InputEvent, PacketTransport, PeerBackend,
    PeerFactory, PeerParts, RawPicture, Result, SessionDescription, SessionEvent,
    SessionNotification, SourceFrame, StillFormat, StreamConfig, StreamController, SurfaceAdapter,
    VideoCodec, VideoEncoderBackend, Viewport,
};
use surfacecast_wire::WirePacket;
use tokio::sync::mpsc;

pub const SESSION: &str = "s1";

/// Config used by most tests: 640x480 VP8, fast retries, short page wait
pub fn config() -> StreamConfig {
    StreamConfig {
        offer_retry_backoff_ms: 1,
        page_ready_timeout_ms: 100,
        codec_fallbacks: Vec::new(),
        ..Default::default()
    }
}

/// Initialize tracing for tests
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,webrtc=warn")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn still_jpeg() -> Bytes {
    static JPEG: OnceLock<Bytes> = OnceLock::new();
    JPEG.get_or_init(|| {
        let image = RgbImage::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 128]));
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 80)
            .encode_image(&image)
            .expect("encode test still");
        Bytes::from(jpeg)
    })
    .clone()
}

// =============================================================================
// Surface
// =============================================================================

/// Scriptable surface that records everything the session asks of it
#[derive(Default)]
pub struct MockSurface {
    sink: Mutex<Option<FrameSink>>,
    next_sequence: AtomicU64,
    pub installs: AtomicUsize,
    pub starts: Mutex<Vec<CaptureSize>>,
    pub stops: AtomicUsize,
    pub viewports: Mutex<Vec<Viewport>>,
    pub inputs: Mutex<Vec<InputEvent>>,
    pub acks: Mutex<Vec<u64>>,
    /// Fail `install_bindings` from the given install count onwards
    pub fail_install_from: Mutex<Option<usize>>,
    /// `wait_until_ready` never resolves
    pub never_ready: AtomicBool,
}

impl MockSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A surface whose bindings fail to install
    pub fn failing_install() -> Arc<Self> {
        let surface = Self::default();
        *surface.fail_install_from.lock() = Some(0);
        Arc::new(surface)
    }

    /// A surface whose page never reports ready
    pub fn never_ready() -> Arc<Self> {
        let surface = Self::default();
        surface.never_ready.store(true, Ordering::SeqCst);
        Arc::new(surface)
    }

    /// Fail every later `install_bindings`
    pub fn fail_next_installs(&self) {
        *self.fail_install_from.lock() = Some(self.installs.load(Ordering::SeqCst));
    }

    fn sink(&self) -> FrameSink {
        self.sink.lock().clone().expect("bindings installed")
    }

    /// Push one captured still; returns its sequence number
    pub fn push_frame(&self) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.sink().push_frame(SourceFrame {
            data: still_jpeg(),
            format: StillFormat::Jpeg,
            sequence,
        });
        sequence
    }

    /// Push a frame and wait until the session acknowledges it
    pub async fn push_frame_acked(&self) -> u64 {
        let sequence = self.push_frame();
        eventually("frame ack", || self.acks.lock().contains(&sequence)).await;
        sequence
    }

    pub fn push_audio(&self, timestamp_us: u64) -> bool {
        self.sink().push_audio(AudioChunk {
            timestamp_us,
            payload: Bytes::from_static(b"opus-frame"),
        })
    }

    /// Report a document change, as the page would after a reload
    pub fn navigate(&self) {
        self.sink().navigated();
    }

    pub fn cursor(&self, style: &str) {
        self.sink().cursor_style_changed(style);
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn ack_count(&self) -> usize {
        self.acks.lock().len()
    }

    pub fn last_capture(&self) -> Option<CaptureSize> {
        self.starts.lock().last().copied()
    }
}

#[async_trait]
impl SurfaceAdapter for MockSurface {
    async fn install_bindings(&self, sink: FrameSink) -> Result<()> {
        let attempt = self.installs.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_install_from
            .lock()
            .is_some_and(|from| attempt >= from)
        {
            return Err(Error::SurfaceError("page closed".to_string()));
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<()> {
        if self.never_ready.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn start_frames(&self, size: CaptureSize) -> Result<()> {
        self.starts.lock().push(size);
        Ok(())
    }

    async fn stop_frames(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ack_frame(&self, sequence: u64) -> Result<()> {
        self.acks.lock().push(sequence);
        Ok(())
    }

    async fn set_viewport(&self, viewport: Viewport) -> Result<()> {
        self.viewports.lock().push(viewport);
        Ok(())
    }

    async fn dispatch_input(&self, event: InputEvent) -> Result<()> {
        self.inputs.lock().push(event);
        Ok(())
    }
}

// =============================================================================
// Encoders
// =============================================================================

/// Encoder factory with scripted capabilities
///
/// Each emitted chunk's payload is the encoder's width and height as two
/// little-endian `u32`s, so tests can read the encode size off the wire.
pub struct ScriptedEncoders {
    pub codecs: Vec<VideoCodec>,
    pub max_width: u32,
    /// Make every in-place `reconfigure` fail
    pub reject_in_place: Arc<AtomicBool>,
    pub created: AtomicUsize,
    pub live: Arc<AtomicUsize>,
}

impl Default for ScriptedEncoders {
    fn default() -> Self {
        Self::supporting(&[VideoCodec::Vp8])
    }
}

impl ScriptedEncoders {
    pub fn supporting(codecs: &[VideoCodec]) -> Self {
        Self {
            codecs: codecs.to_vec(),
            max_width: 1920,
            reject_in_place: Arc::new(AtomicBool::new(false)),
            created: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for ScriptedEncoders {
    fn support(&self, config: &EncodeConfig) -> CodecSupport {
        if !self.codecs.contains(&config.codec) {
            return CodecSupport::unsupported(format!("{} not available", config.codec));
        }
        if config.width > self.max_width {
            return CodecSupport::unsupported(format!("width {} too large", config.width));
        }
        CodecSupport::Supported
    }

    fn create(&self, config: &EncodeConfig) -> Result<Box<dyn VideoEncoderBackend>> {
        if let CodecSupport::Unsupported { reason } = self.support(config) {
            return Err(Error::CodecUnsupported(reason));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEncoder {
            config: config.clone(),
            reject_in_place: Arc::clone(&self.reject_in_place),
            live: Arc::clone(&self.live),
        }))
    }
}

struct ScriptedEncoder {
    config: EncodeConfig,
    reject_in_place: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
}

impl VideoEncoderBackend for ScriptedEncoder {
    fn encode(
        &mut self,
        picture: &RawPicture,
        timestamp_us: u64,
        force_keyframe: bool,
    ) -> Result<Vec<EncodedChunk>> {
        assert_eq!(
            (picture.width(), picture.height()),
            (self.config.width, self.config.height)
        );
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&self.config.width.to_le_bytes());
        payload.extend_from_slice(&self.config.height.to_le_bytes());
        Ok(vec![EncodedChunk {
            timestamp_us,
            is_keyframe: force_keyframe,
            payload: Bytes::from(payload),
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>> {
        Ok(Vec::new())
    }

    fn reconfigure(&mut self, config: &EncodeConfig) -> Result<()> {
        if self.reject_in_place.load(Ordering::SeqCst) {
            return Err(Error::EncodingError("in-place resize unsupported".to_string()));
        }
        self.config = config.clone();
        Ok(())
    }

    fn codec(&self) -> VideoCodec {
        self.config.codec
    }
}

impl Drop for ScriptedEncoder {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Encode size carried in a scripted encoder payload
pub fn payload_size(packet: &WirePacket) -> (u32, u32) {
    let width = u32::from_le_bytes(packet.payload[0..4].try_into().expect("width"));
    let height = u32::from_le_bytes(packet.payload[4..8].try_into().expect("height"));
    (width, height)
}

// =============================================================================
// Transport
// =============================================================================

/// Media channel double that keeps every packet sent on it
#[derive(Default)]
pub struct RecordingTransport {
    pub open: AtomicBool,
    pub closed: AtomicBool,
    pub packets: Mutex<Vec<Bytes>>,
}

impl RecordingTransport {
    pub fn packet_count(&self) -> usize {
        self.packets.lock().len()
    }

    /// Decode every packet sent so far
    pub fn decoded(&self) -> Vec<WirePacket> {
        self.packets
            .lock()
            .iter()
            .map(|bytes| surfacecast_wire::decode(bytes).expect("valid wire packet"))
            .collect()
    }

    pub fn video(&self) -> Vec<WirePacket> {
        self.decoded().into_iter().filter(WirePacket::is_video).collect()
    }
}

#[async_trait]
impl PacketTransport for RecordingTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn send(&self, packet: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError("channel not open".to_string()));
        }
        self.packets.lock().push(packet);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Peers
// =============================================================================

/// Test-side view of one peer the factory built
pub struct PeerRecord {
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub transport: Arc<RecordingTransport>,
    pub closed: Arc<AtomicBool>,
}

impl PeerRecord {
    /// Open the media channel as webrtc-rs would
    pub fn open_channel(&self) {
        self.transport.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::ChannelOpen);
    }

    pub fn report_state(&self, state: &str) {
        let _ = self.events.send(ConnectionEvent::StateChanged(state.to_string()));
    }

    pub fn gather_candidate(&self, candidate: &str) {
        let _ = self
            .events
            .send(ConnectionEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Peer factory recording offers, answers and candidates in call order
#[derive(Default)]
pub struct MockPeers {
    pub log: Arc<Mutex<Vec<String>>>,
    /// Offer attempts that fail with a retryable error before one succeeds
    pub offer_failures: Arc<AtomicU32>,
    pub created: AtomicUsize,
    pub live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
    pub peers: Mutex<Vec<PeerRecord>>,
}

impl MockPeers {
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn fail_offers(&self, attempts: u32) {
        self.offer_failures.store(attempts, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerFactory for MockPeers {
    async fn create(
        &self,
        _session_id: &str,
        _config: &StreamConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<PeerParts> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        // Let other tasks run while the peer is half built
        tokio::task::yield_now().await;

        let transport = Arc::new(RecordingTransport::default());
        let closed = Arc::new(AtomicBool::new(false));
        self.peers.lock().push(PeerRecord {
            events,
            transport: Arc::clone(&transport),
            closed: Arc::clone(&closed),
        });

        Ok(PeerParts {
            backend: Arc::new(MockPeer {
                log: Arc::clone(&self.log),
                offer_failures: Arc::clone(&self.offer_failures),
                live: Arc::clone(&self.live),
                closed,
            }),
            transport,
        })
    }
}

struct MockPeer {
    log: Arc<Mutex<Vec<String>>>,
    offer_failures: Arc<AtomicU32>,
    live: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl PeerBackend for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let remaining = self.offer_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.offer_failures.store(remaining - 1, Ordering::SeqCst);
            self.log.lock().push("offer-failed".to_string());
            return Err(Error::PeerNotReady("gathering".to_string()));
        }
        self.log.lock().push("offer".to_string());
        Ok(SessionDescription::offer("v=0 mock offer"))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        self.log.lock().push(format!("answer:{}", answer.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.log.lock().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Controller wired to mock peers and scripted encoders
pub struct Harness {
    pub controller: Arc<StreamController>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub peers: Arc<MockPeers>,
    pub encoders: Arc<ScriptedEncoders>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_encoders(ScriptedEncoders::default())
    }

    pub fn with_encoders(encoders: ScriptedEncoders) -> Self {
        init_test_tracing();
        let peers = Arc::new(MockPeers::default());
        let encoders = Arc::new(encoders);
        let (controller, events) = StreamController::new(peers.clone(), encoders.clone());
        Self {
            controller: Arc::new(controller),
            events,
            peers,
            encoders,
        }
    }

    /// Start `s1` on a fresh mock surface
    pub async fn start(&self) -> Arc<MockSurface> {
        self.start_with(config()).await
    }

    pub async fn start_with(&self, config: StreamConfig) -> Arc<MockSurface> {
        let surface = MockSurface::new();
        self.controller
            .start(SESSION, config, surface.clone())
            .await
            .expect("session starts");
        surface
    }

    /// Start `s1`, negotiate and open the media channel
    pub async fn start_streaming(&self) -> Arc<MockSurface> {
        self.start_streaming_with(config()).await
    }

    pub async fn start_streaming_with(&self, config: StreamConfig) -> Arc<MockSurface> {
        let surface = self.start_with(config).await;
        self.controller
            .create_offer(SESSION)
            .await
            .expect("offer")
            .expect("peer ready");
        self.controller
            .apply_answer(SESSION, SessionDescription::answer("v=0 mock answer"))
            .await
            .expect("answer applied");
        self.last_peer(|peer| peer.open_channel());
        surface
    }

    /// Run `f` against the most recently built peer
    pub fn last_peer<T>(&self, f: impl FnOnce(&PeerRecord) -> T) -> T {
        let peers = self.peers.peers.lock();
        f(peers.last().expect("a peer was created"))
    }

    pub fn last_transport(&self) -> Arc<RecordingTransport> {
        self.last_peer(|peer| Arc::clone(&peer.transport))
    }

    /// Everything emitted so far
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for a notification matching `predicate`
    pub async fn wait_for_event<F>(&mut self, mut predicate: F) -> SessionNotification
    where
        F: FnMut(&SessionNotification) -> bool,
    {
        let wait = async {
            while let Some(event) = self.events.recv().await {
                if predicate(&event.notification) {
                    return event.notification;
                }
            }
            panic!("event stream closed");
        };
        with_timeout(wait).await
    }
}

/// Fail the test if `future` takes longer than two seconds
pub async fn with_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation timed out")
}
