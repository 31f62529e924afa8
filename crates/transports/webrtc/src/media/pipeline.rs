//! In-context encode pipeline
//!
//! Turns captured stills and pre-encoded audio into wire packets on the
//! media channel. Owned by exactly one session task, so every operation
//! here is serialized with reconfiguration.
//!
//! Nothing is buffered: frames arriving while the channel is closed, while
//! the channel is backed up, or before the encoder exists are dropped and
//! only counted.

use std::sync::Arc;

use parking_lot::Mutex;
use surfacecast_wire::{encode as encode_packet, WirePacket};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::codec::{CodecSupport, EncodedChunk, EncoderFactory, VideoEncoderBackend};
use super::picture::RawPicture;
use crate::channels::PacketTransport;
use crate::config::{EncodeConfig, VideoCodec};
use crate::session::SessionStats;
use crate::surface::{AudioChunk, SourceFrame};
use crate::{Error, Result};

type SharedEncoder = Arc<Mutex<Box<dyn VideoEncoderBackend>>>;

/// Why a frame did not reach the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Encoder not started
    NotStarted,
    /// Data channel not open
    ChannelNotOpen,
    /// Data channel above its high-water mark
    Backpressure,
    /// Still could not be decoded or encoded
    EncodeFailed,
}

/// Result of offering one source frame to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Encoder accepted the frame
    Encoded {
        keyframe_requested: bool,
        packets_sent: usize,
    },
    /// Frame was dropped
    Dropped(DropReason),
}

impl FrameOutcome {
    pub fn is_encoded(&self) -> bool {
        matches!(self, FrameOutcome::Encoded { .. })
    }
}

/// Tuning knobs taken from the stream config
#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    /// Skip frames while the channel buffers more than this many bytes
    pub high_water_mark_bytes: usize,
    /// Consecutive failures tolerated before encoding is declared broken
    pub max_consecutive_failures: u32,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            high_water_mark_bytes: 1024 * 1024,
            max_consecutive_failures: 30,
        }
    }
}

/// Strictly increasing microsecond timestamps from a monotonic clock
#[derive(Debug)]
struct MediaClock {
    origin: Instant,
    last_us: Option<u64>,
}

impl MediaClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_us: None,
        }
    }

    fn timestamp_at(&mut self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_micros();
        let elapsed = u64::try_from(elapsed).unwrap_or(u64::MAX);
        let ts = match self.last_us {
            Some(last) if elapsed <= last => last.saturating_add(1),
            _ => elapsed,
        };
        self.last_us = Some(ts);
        ts
    }
}

/// Encode pipeline for one session
pub struct EncodePipeline {
    session_id: String,
    config: EncodeConfig,
    factory: Arc<dyn EncoderFactory>,
    encoder: Option<SharedEncoder>,
    transport: Arc<dyn PacketTransport>,
    stats: Arc<SessionStats>,
    limits: PipelineLimits,
    clock: MediaClock,
    last_keyframe_at: Option<Instant>,
    force_keyframe: bool,
    consecutive_failures: u32,
}

impl EncodePipeline {
    /// Create a stopped pipeline; call [`start`](Self::start) to create the encoder
    pub fn new(
        session_id: impl Into<String>,
        config: EncodeConfig,
        factory: Arc<dyn EncoderFactory>,
        transport: Arc<dyn PacketTransport>,
        stats: Arc<SessionStats>,
        limits: PipelineLimits,
    ) -> Self {
        stats.set_encode_size(config.width, config.height);
        Self {
            session_id: session_id.into(),
            config,
            factory,
            encoder: None,
            transport,
            stats,
            limits,
            clock: MediaClock::new(),
            last_keyframe_at: None,
            force_keyframe: true,
            consecutive_failures: 0,
        }
    }

    /// Current encoder settings
    pub fn config(&self) -> &EncodeConfig {
        &self.config
    }

    /// Codec in use
    pub fn codec(&self) -> VideoCodec {
        self.config.codec
    }

    /// Whether an encoder is running
    pub fn is_started(&self) -> bool {
        self.encoder.is_some()
    }

    /// Make the next encoded frame a keyframe
    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    /// Create the encoder. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.encoder.is_some() {
            return Ok(());
        }

        let encoder = self.factory.create(&self.config)?;
        info!(
            session_id = %self.session_id,
            codec = %self.config.codec,
            width = self.config.width,
            height = self.config.height,
            "encoder started"
        );
        self.encoder = Some(Arc::new(Mutex::new(encoder)));
        self.force_keyframe = true;
        self.consecutive_failures = 0;
        Ok(())
    }

    /// Release the encoder. Idempotent; the channel is not touched.
    pub fn stop(&mut self) {
        if self.encoder.take().is_some() {
            info!(session_id = %self.session_id, "encoder released");
        }
    }

    /// Offer one captured still
    ///
    /// Only returns an error once `max_consecutive_failures` frames in a
    /// row have failed; single failures are dropped and counted.
    pub async fn on_source_frame(&mut self, frame: &SourceFrame) -> Result<FrameOutcome> {
        let Some(encoder) = self.encoder.clone() else {
            return Ok(self.drop_frame(DropReason::NotStarted));
        };

        if !self.transport.is_open() {
            return Ok(self.drop_frame(DropReason::ChannelNotOpen));
        }

        let buffered = self.transport.buffered_amount().await;
        if buffered > self.limits.high_water_mark_bytes {
            trace!(
                session_id = %self.session_id,
                buffered,
                "channel above high-water mark, skipping frame"
            );
            return Ok(self.drop_frame(DropReason::Backpressure));
        }

        let now = Instant::now();
        let keyframe = self.keyframe_due(now);
        let timestamp_us = self.clock.timestamp_at(now);
        let (width, height) = (self.config.width, self.config.height);
        let data = frame.data.clone();
        let format = frame.format;

        let result = tokio::task::spawn_blocking(move || -> Result<Vec<EncodedChunk>> {
            let picture = RawPicture::decode_still(&data, format)?.fit_to(width, height);
            encoder.lock().encode(&picture, timestamp_us, keyframe)
        })
        .await
        .unwrap_or_else(|e| Err(Error::EncodingError(format!("encode task failed: {}", e))));

        let chunks = match result {
            Ok(chunks) => chunks,
            Err(e) => return self.record_failure(frame.sequence, e),
        };

        self.consecutive_failures = 0;
        self.stats.record_frame_encoded();
        if keyframe {
            self.last_keyframe_at = Some(now);
            self.force_keyframe = false;
        }

        let mut packets_sent = 0;
        for chunk in chunks {
            if self.on_encoded_video_chunk(chunk).await {
                packets_sent += 1;
            }
        }

        Ok(FrameOutcome::Encoded {
            keyframe_requested: keyframe,
            packets_sent,
        })
    }

    /// Wrap an encoded chunk and send it; returns whether it was sent
    ///
    /// A chunk that cannot be sent is dropped, and the next frame is forced
    /// to a keyframe so the viewer's decoder can recover.
    pub async fn on_encoded_video_chunk(&mut self, chunk: EncodedChunk) -> bool {
        if !self.transport.is_open() {
            self.stats.record_frame_dropped();
            self.force_keyframe = true;
            return false;
        }

        let is_keyframe = chunk.is_keyframe;
        let packet = WirePacket::video(chunk.timestamp_us, is_keyframe, chunk.payload);
        let bytes = match encode_packet(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session_id = %self.session_id, "dropping video chunk: {}", e);
                self.stats.record_frame_dropped();
                self.force_keyframe = true;
                return false;
            }
        };

        let len = bytes.len();
        match self.transport.send(bytes).await {
            Ok(()) => {
                self.stats.record_video_sent(len, is_keyframe);
                true
            }
            Err(e) => {
                trace!(session_id = %self.session_id, "video send failed: {}", e);
                self.stats.record_frame_dropped();
                self.force_keyframe = true;
                false
            }
        }
    }

    /// Multiplex a pre-encoded audio chunk; returns whether it was sent
    pub async fn on_audio_chunk(&mut self, chunk: AudioChunk) -> bool {
        if !self.transport.is_open() {
            self.stats.record_audio_dropped();
            return false;
        }

        let packet = WirePacket::audio(chunk.timestamp_us, chunk.payload);
        let bytes = match encode_packet(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session_id = %self.session_id, "dropping audio chunk: {}", e);
                self.stats.record_audio_dropped();
                return false;
            }
        };

        let len = bytes.len();
        match self.transport.send(bytes).await {
            Ok(()) => {
                self.stats.record_audio_sent(len);
                true
            }
            Err(e) => {
                trace!(session_id = %self.session_id, "audio send failed: {}", e);
                self.stats.record_audio_dropped();
                false
            }
        }
    }

    /// Drain frames held inside the encoder onto the channel
    pub async fn flush(&mut self) {
        let Some(encoder) = self.encoder.clone() else {
            return;
        };

        let result = tokio::task::spawn_blocking(move || encoder.lock().flush())
            .await
            .unwrap_or_else(|e| Err(Error::EncodingError(format!("flush task failed: {}", e))));

        match result {
            Ok(chunks) => {
                for chunk in chunks {
                    self.on_encoded_video_chunk(chunk).await;
                }
            }
            Err(e) => warn!(session_id = %self.session_id, "encoder flush failed: {}", e),
        }
    }

    /// Change encode dimensions in place
    ///
    /// Flushes, checks codec support for the new configuration, applies it to the running
    /// encoder and only then commits it. On rejection the previous
    /// configuration stays in effect.
    pub async fn reconfigure(&mut self, width: u32, height: u32) -> Result<()> {
        let next = self.config.with_dimensions(width, height);
        next.validate()
            .map_err(|e| Error::ReconfigurationRejected(e.to_string()))?;

        if let CodecSupport::Unsupported { reason } = self.factory.support(&next) {
            return Err(Error::ReconfigurationRejected(reason));
        }

        if let Some(encoder) = self.encoder.clone() {
            self.flush().await;

            let candidate = next.clone();
            tokio::task::spawn_blocking(move || encoder.lock().reconfigure(&candidate))
                .await
                .unwrap_or_else(|e| Err(Error::EncodingError(format!("reconfigure task failed: {}", e))))
                .map_err(|e| match e {
                    Error::ReconfigurationRejected(_) => e,
                    other => Error::ReconfigurationRejected(other.to_string()),
                })?;
        }

        self.commit(next);
        Ok(())
    }

    /// Replace the encoder with a fresh one at new dimensions
    ///
    /// Fallback when in-place reconfiguration fails. If the new encoder
    /// cannot be created the previous one is recreated and the call fails
    /// with [`Error::ReconfigurationRejected`]; if even that fails the
    /// pipeline is left stopped and [`Error::EncodingError`] is returned.
    pub async fn restart(&mut self, width: u32, height: u32) -> Result<()> {
        let next = self.config.with_dimensions(width, height);
        next.validate()
            .map_err(|e| Error::ReconfigurationRejected(e.to_string()))?;

        let was_started = self.is_started();
        self.flush().await;
        self.stop();

        match self.factory.create(&next) {
            Ok(encoder) => {
                self.encoder = Some(Arc::new(Mutex::new(encoder)));
                self.commit(next);
                Ok(())
            }
            Err(e) => {
                if was_started {
                    let previous = self.factory.create(&self.config).map_err(|restore| {
                        Error::EncodingError(format!(
                            "restart failed ({}) and previous encoder could not be restored: {}",
                            e, restore
                        ))
                    })?;
                    self.encoder = Some(Arc::new(Mutex::new(previous)));
                    self.force_keyframe = true;
                }
                Err(Error::ReconfigurationRejected(e.to_string()))
            }
        }
    }

    fn commit(&mut self, next: EncodeConfig) {
        info!(
            session_id = %self.session_id,
            from = format_args!("{}x{}", self.config.width, self.config.height),
            to = format_args!("{}x{}", next.width, next.height),
            "encode dimensions committed"
        );
        self.stats.set_encode_size(next.width, next.height);
        self.config = next;
        self.force_keyframe = true;
    }

    fn keyframe_due(&self, now: Instant) -> bool {
        self.force_keyframe
            || self
                .last_keyframe_at
                .map_or(true, |at| now.saturating_duration_since(at) >= self.config.keyframe_interval())
    }

    fn drop_frame(&self, reason: DropReason) -> FrameOutcome {
        self.stats.record_frame_dropped();
        FrameOutcome::Dropped(reason)
    }

    fn record_failure(&mut self, sequence: u64, error: Error) -> Result<FrameOutcome> {
        self.stats.record_encode_failure();
        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.limits.max_consecutive_failures {
            warn!(
                session_id = %self.session_id,
                failures = self.consecutive_failures,
                "encoder failure limit reached: {}",
                error
            );
            self.stats.record_frame_dropped();
            return Err(Error::EncodingError(format!(
                "{} consecutive frames failed, last: {}",
                self.consecutive_failures, error
            )));
        }

        debug!(session_id = %self.session_id, sequence, "dropping frame: {}", error);
        Ok(self.drop_frame(DropReason::EncodeFailed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use image::codecs::jpeg::JpegEncoder;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use surfacecast_wire::decode;

    use crate::surface::StillFormat;

    #[derive(Default)]
    struct TestTransport {
        open: AtomicBool,
        fail_sends: AtomicBool,
        buffered: AtomicUsize,
        sent: Mutex<Vec<Bytes>>,
    }

    impl TestTransport {
        fn open() -> Arc<Self> {
            let transport = Self::default();
            transport.open.store(true, Ordering::SeqCst);
            Arc::new(transport)
        }

        fn packets(&self) -> Vec<WirePacket> {
            self.sent.lock().iter().map(|b| decode(b).unwrap()).collect()
        }
    }

    #[async_trait]
    impl PacketTransport for TestTransport {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }
        async fn send(&self, packet: Bytes) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(Error::DataChannelError("send failed".to_string()));
            }
            self.sent.lock().push(packet);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Encoder whose keyframes follow the request flag
    struct FlagEncoder {
        width: u32,
        height: u32,
        fail: Arc<AtomicBool>,
    }

    impl VideoEncoderBackend for FlagEncoder {
        fn encode(
            &mut self,
            picture: &RawPicture,
            timestamp_us: u64,
            force_keyframe: bool,
        ) -> Result<Vec<EncodedChunk>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::EncodingError("scripted failure".to_string()));
            }
            assert_eq!((picture.width(), picture.height()), (self.width, self.height));
            Ok(vec![EncodedChunk {
                timestamp_us,
                is_keyframe: force_keyframe,
                payload: Bytes::from(vec![u8::from(force_keyframe); 4]),
            }])
        }
        fn flush(&mut self) -> Result<Vec<EncodedChunk>> {
            Ok(Vec::new())
        }
        fn reconfigure(&mut self, config: &EncodeConfig) -> Result<()> {
            if config.width > 1920 {
                return Err(Error::ReconfigurationRejected("too wide".to_string()));
            }
            self.width = config.width;
            self.height = config.height;
            Ok(())
        }
        fn codec(&self) -> VideoCodec {
            VideoCodec::Vp8
        }
    }

    #[derive(Default)]
    struct FlagFactory {
        fail: Arc<AtomicBool>,
    }

    impl EncoderFactory for FlagFactory {
        fn support(&self, config: &EncodeConfig) -> CodecSupport {
            if config.width > 3840 {
                return CodecSupport::unsupported("exceeds level limit");
            }
            CodecSupport::Supported
        }
        fn create(&self, config: &EncodeConfig) -> Result<Box<dyn VideoEncoderBackend>> {
            Ok(Box::new(FlagEncoder {
                width: config.width,
                height: config.height,
                fail: Arc::clone(&self.fail),
            }))
        }
    }

    fn jpeg_frame(sequence: u64) -> SourceFrame {
        let image = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        let mut data = Vec::new();
        JpegEncoder::new_with_quality(&mut data, 80)
            .encode_image(&image)
            .unwrap();
        SourceFrame {
            data: Bytes::from(data),
            format: StillFormat::Jpeg,
            sequence,
        }
    }

    fn pipeline(
        transport: Arc<TestTransport>,
        factory: Arc<FlagFactory>,
    ) -> (EncodePipeline, Arc<SessionStats>) {
        let stats = Arc::new(SessionStats::default());
        let config = EncodeConfig::default().with_dimensions(16, 16);
        let mut pipeline = EncodePipeline::new(
            "test",
            config,
            factory,
            transport,
            stats.clone(),
            PipelineLimits {
                high_water_mark_bytes: 1000,
                max_consecutive_failures: 3,
            },
        );
        pipeline.start().unwrap();
        (pipeline, stats)
    }

    #[tokio::test]
    async fn test_closed_channel_drops_without_encoding() {
        let transport = Arc::new(TestTransport::default());
        let (mut pipeline, stats) = pipeline(transport.clone(), Arc::default());

        for seq in 0..100 {
            let outcome = pipeline.on_source_frame(&jpeg_frame(seq)).await.unwrap();
            assert_eq!(outcome, FrameOutcome::Dropped(DropReason::ChannelNotOpen));
        }
        assert!(!pipeline.on_audio_chunk(AudioChunk {
            timestamp_us: 1,
            payload: Bytes::from_static(b"opus"),
        })
        .await);

        assert!(transport.sent.lock().is_empty());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_dropped, 100);
        assert_eq!(snapshot.audio_chunks_dropped, 1);
        assert_eq!(snapshot.video_frames_encoded, 0);
    }

    #[tokio::test]
    async fn test_not_started_drops() {
        let transport = TestTransport::open();
        let (mut pipeline, _stats) = pipeline(transport.clone(), Arc::default());
        pipeline.stop();
        pipeline.stop();

        let outcome = pipeline.on_source_frame(&jpeg_frame(0)).await.unwrap();
        assert_eq!(outcome, FrameOutcome::Dropped(DropReason::NotStarted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyframe_pacing() {
        let transport = TestTransport::open();
        let (mut pipeline, _stats) = pipeline(transport.clone(), Arc::default());

        for seq in 0..5 {
            pipeline.on_source_frame(&jpeg_frame(seq)).await.unwrap();
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        // 2s interval elapses
        tokio::time::advance(Duration::from_secs(2)).await;
        pipeline.on_source_frame(&jpeg_frame(5)).await.unwrap();
        pipeline.on_source_frame(&jpeg_frame(6)).await.unwrap();

        let keyframes: Vec<bool> = transport.packets().iter().map(|p| p.is_keyframe).collect();
        assert_eq!(
            keyframes,
            vec![true, false, false, false, false, true, false]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps_strictly_increase() {
        let transport = TestTransport::open();
        let (mut pipeline, _stats) = pipeline(transport.clone(), Arc::default());

        // Paused clock: every frame observes the same instant
        for seq in 0..4 {
            pipeline.on_source_frame(&jpeg_frame(seq)).await.unwrap();
        }

        let timestamps: Vec<u64> = transport.packets().iter().map(|p| p.timestamp_us).collect();
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]), "{timestamps:?}");
    }

    #[tokio::test]
    async fn test_reconfigure_forces_keyframe() {
        let transport = TestTransport::open();
        let (mut pipeline, stats) = pipeline(transport.clone(), Arc::default());

        pipeline.on_source_frame(&jpeg_frame(0)).await.unwrap();
        pipeline.on_source_frame(&jpeg_frame(1)).await.unwrap();
        pipeline.reconfigure(32, 18).await.unwrap();
        pipeline.on_source_frame(&jpeg_frame(2)).await.unwrap();

        let packets = transport.packets();
        assert!(!packets[1].is_keyframe);
        assert!(packets[2].is_keyframe);
        assert_eq!((pipeline.config().width, pipeline.config().height), (32, 18));
        assert_eq!(stats.snapshot().encode_width, 32);
    }

    #[tokio::test]
    async fn test_rejected_reconfigure_keeps_previous_config() {
        let transport = TestTransport::open();
        let (mut pipeline, _stats) = pipeline(transport.clone(), Arc::default());

        // Backend rejects
        let err = pipeline.reconfigure(2560, 1440).await.unwrap_err();
        assert!(matches!(err, Error::ReconfigurationRejected(_)));
        assert_eq!(pipeline.config().width, 16);

        // Factory rejects
        let err = pipeline.reconfigure(4096, 2160).await.unwrap_err();
        assert!(matches!(err, Error::ReconfigurationRejected(_)));

        // Odd dimensions rejected before touching the encoder
        assert!(pipeline.reconfigure(33, 18).await.is_err());
        assert_eq!(pipeline.config().height, 16);

        // Encoder still works at the old size
        assert!(pipeline.on_source_frame(&jpeg_frame(0)).await.unwrap().is_encoded());
    }

    #[tokio::test]
    async fn test_restart_builds_new_encoder() {
        let transport = TestTransport::open();
        let (mut pipeline, _stats) = pipeline(transport.clone(), Arc::default());

        pipeline.on_source_frame(&jpeg_frame(0)).await.unwrap();
        pipeline.on_source_frame(&jpeg_frame(1)).await.unwrap();
        pipeline.restart(2560, 1440).await.unwrap();
        pipeline.on_source_frame(&jpeg_frame(2)).await.unwrap();

        assert_eq!(pipeline.config().width, 2560);
        assert!(transport.packets().last().unwrap().is_keyframe);
    }

    #[tokio::test]
    async fn test_backpressure_skips_before_encoding() {
        let transport = TestTransport::open();
        let (mut pipeline, stats) = pipeline(transport.clone(), Arc::default());

        pipeline.on_source_frame(&jpeg_frame(0)).await.unwrap();
        transport.buffered.store(5000, Ordering::SeqCst);
        let outcome = pipeline.on_source_frame(&jpeg_frame(1)).await.unwrap();
        assert_eq!(outcome, FrameOutcome::Dropped(DropReason::Backpressure));

        transport.buffered.store(0, Ordering::SeqCst);
        pipeline.on_source_frame(&jpeg_frame(2)).await.unwrap();

        assert_eq!(stats.snapshot().video_frames_encoded, 2);
        // Skipped frame never reached the encoder, so no keyframe is needed
        assert!(!transport.packets()[1].is_keyframe);
    }

    #[tokio::test]
    async fn test_send_failure_forces_keyframe() {
        let transport = TestTransport::open();
        let (mut pipeline, stats) = pipeline(transport.clone(), Arc::default());

        pipeline.on_source_frame(&jpeg_frame(0)).await.unwrap();
        transport.fail_sends.store(true, Ordering::SeqCst);
        pipeline.on_source_frame(&jpeg_frame(1)).await.unwrap();
        transport.fail_sends.store(false, Ordering::SeqCst);
        pipeline.on_source_frame(&jpeg_frame(2)).await.unwrap();

        let packets = transport.packets();
        assert_eq!(packets.len(), 2);
        assert!(packets[1].is_keyframe);
        assert_eq!(stats.snapshot().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_failure_limit() {
        let transport = TestTransport::open();
        let factory = Arc::new(FlagFactory::default());
        let (mut pipeline, stats) = pipeline(transport.clone(), factory.clone());

        factory.fail.store(true, Ordering::SeqCst);
        assert_eq!(
            pipeline.on_source_frame(&jpeg_frame(0)).await.unwrap(),
            FrameOutcome::Dropped(DropReason::EncodeFailed)
        );
        assert!(pipeline.on_source_frame(&jpeg_frame(1)).await.is_ok());
        assert!(matches!(
            pipeline.on_source_frame(&jpeg_frame(2)).await,
            Err(Error::EncodingError(_))
        ));
        assert_eq!(stats.snapshot().encode_failures, 3);
    }

    #[tokio::test]
    async fn test_undecodable_still_is_dropped() {
        let transport = TestTransport::open();
        let (mut pipeline, _stats) = pipeline(transport.clone(), Arc::default());

        let frame = SourceFrame {
            data: Bytes::from_static(b"garbage"),
            format: StillFormat::Png,
            sequence: 9,
        };
        assert_eq!(
            pipeline.on_source_frame(&frame).await.unwrap(),
            FrameOutcome::Dropped(DropReason::EncodeFailed)
        );
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_audio_multiplexed() {
        let transport = TestTransport::open();
        let (mut pipeline, stats) = pipeline(transport.clone(), Arc::default());

        assert!(pipeline
            .on_audio_chunk(AudioChunk {
                timestamp_us: 20_000,
                payload: Bytes::from_static(b"opus"),
            })
            .await);

        let packets = transport.packets();
        assert!(packets[0].is_audio());
        assert_eq!(packets[0].timestamp_us, 20_000);
        assert_eq!(stats.snapshot().audio_chunks_sent, 1);
    }
}
