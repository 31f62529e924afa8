//! Synthetic surface rendering a moving test pattern
//!
//! Stands in for the browser automation layer in the demo server and in
//! tests. It honours the same contract a real surface must: bindings are
//! lost on navigation, and the next frame is only produced once the
//! previous one is acknowledged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{CaptureSize, FrameSink, InputEvent, SourceFrame, StillFormat, SurfaceAdapter};
use crate::config::Viewport;
use crate::{Error, Result};

const MARKER_SIZE: u32 = 6;

#[derive(Debug, Default)]
struct PageState {
    sink: Option<FrameSink>,
    viewport: Option<Viewport>,
    pointer: (f64, f64),
    cursor: String,
    url: String,
    in_flight: Option<u64>,
}

struct Inner {
    framerate: u32,
    ready_delay: Duration,
    page: Mutex<PageState>,
    next_sequence: AtomicU64,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

/// Surface producing JPEG stills of scrolling colour bars
pub struct TestPatternSurface {
    inner: Arc<Inner>,
}

impl TestPatternSurface {
    pub fn new(framerate: u32) -> Self {
        Self::build(framerate, Duration::ZERO)
    }

    /// Delay reported by `wait_until_ready`
    pub fn with_ready_delay(self, delay: Duration) -> Self {
        Self::build(self.inner.framerate, delay)
    }

    fn build(framerate: u32, ready_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                framerate: framerate.max(1),
                ready_delay,
                page: Mutex::new(PageState {
                    cursor: "default".to_string(),
                    url: "about:blank".to_string(),
                    ..Default::default()
                }),
                next_sequence: AtomicU64::new(0),
                feeder: Mutex::new(None),
            }),
        }
    }

    /// URL of the current document
    pub fn url(&self) -> String {
        self.inner.page.lock().url.clone()
    }

    /// Whether frames are currently being produced
    pub fn is_feeding(&self) -> bool {
        self.inner
            .feeder
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Replace the document, dropping the capture bindings
    pub fn simulate_navigation(&self, url: impl Into<String>) {
        self.inner.abort_feeder();
        let sink = {
            let mut page = self.inner.page.lock();
            page.url = url.into();
            page.in_flight = None;
            page.sink.take()
        };
        info!(url = %self.url(), "test pattern navigated");
        if let Some(sink) = sink {
            sink.navigated();
        }
    }
}

impl Drop for TestPatternSurface {
    fn drop(&mut self) {
        self.inner.abort_feeder();
    }
}

impl Inner {
    fn abort_feeder(&self) {
        if let Some(handle) = self.feeder.lock().take() {
            handle.abort();
        }
    }

    async fn feed(self: Arc<Self>, sink: FrameSink, size: CaptureSize) {
        let period = Duration::from_secs_f64(f64::from(size.every_nth_frame.max(1)) / f64::from(self.framerate));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick: u64 = 0;

        loop {
            ticker.tick().await;
            if sink.is_closed() {
                debug!(session_id = sink.session_id(), "sink closed, stopping feeder");
                return;
            }

            let (marker, sequence) = {
                let mut page = self.page.lock();
                if page.in_flight.is_some() {
                    continue;
                }
                let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
                page.in_flight = Some(sequence);
                (marker_position(&page, size), sequence)
            };

            let rendered = tokio::task::spawn_blocking(move || render(size, tick, marker)).await;
            tick = tick.wrapping_add(1);

            match rendered {
                Ok(Ok(data)) => {
                    sink.push_frame(SourceFrame {
                        data,
                        format: StillFormat::Jpeg,
                        sequence,
                    });
                }
                Ok(Err(e)) => {
                    warn!("test pattern render failed: {}", e);
                    self.page.lock().in_flight = None;
                }
                Err(e) => {
                    warn!("test pattern render task failed: {}", e);
                    self.page.lock().in_flight = None;
                }
            }
        }
    }
}

fn marker_position(page: &PageState, size: CaptureSize) -> (u32, u32) {
    let ratio = page
        .viewport
        .map(|v| f64::from(size.width) / f64::from(v.width.max(1)))
        .unwrap_or(1.0);
    let x = (page.pointer.0 * ratio).max(0.0) as u32;
    let y = (page.pointer.1 * ratio).max(0.0) as u32;
    (x.min(size.width.saturating_sub(1)), y.min(size.height.saturating_sub(1)))
}

fn render(size: CaptureSize, tick: u64, marker: (u32, u32)) -> Result<Bytes> {
    const BARS: [[u8; 3]; 7] = [
        [192, 192, 192],
        [192, 192, 0],
        [0, 192, 192],
        [0, 192, 0],
        [192, 0, 192],
        [192, 0, 0],
        [0, 0, 192],
    ];

    let (width, height) = (size.width.max(1), size.height.max(1));
    let bar_width = (width / BARS.len() as u32).max(1);
    let shift = (tick % u64::from(width)) as u32;

    let image = RgbImage::from_fn(width, height, |x, y| {
        let in_marker = x >= marker.0
            && x < marker.0 + MARKER_SIZE
            && y >= marker.1
            && y < marker.1 + MARKER_SIZE;
        if in_marker {
            return Rgb([255, 255, 255]);
        }
        let bar = ((x + shift) % width) / bar_width;
        Rgb(BARS[bar as usize % BARS.len()])
    });

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, size.quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|e| Error::SurfaceError(format!("failed to encode test pattern: {}", e)))?;
    Ok(Bytes::from(jpeg))
}

#[async_trait]
impl SurfaceAdapter for TestPatternSurface {
    async fn install_bindings(&self, sink: FrameSink) -> Result<()> {
        debug!(session_id = sink.session_id(), "test pattern bindings installed");
        let mut page = self.inner.page.lock();
        page.sink = Some(sink);
        page.in_flight = None;
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<()> {
        if self.inner.page.lock().sink.is_none() {
            return Err(Error::SurfaceError("capture bindings not installed".to_string()));
        }
        tokio::time::sleep(self.inner.ready_delay).await;
        Ok(())
    }

    async fn start_frames(&self, size: CaptureSize) -> Result<()> {
        let sink = {
            let mut page = self.inner.page.lock();
            page.in_flight = None;
            page.sink
                .clone()
                .ok_or_else(|| Error::SurfaceError("capture bindings not installed".to_string()))?
        };

        self.inner.abort_feeder();
        let handle = tokio::spawn(Arc::clone(&self.inner).feed(sink, size));
        *self.inner.feeder.lock() = Some(handle);
        info!(width = size.width, height = size.height, "test pattern feeding");
        Ok(())
    }

    async fn stop_frames(&self) -> Result<()> {
        self.inner.abort_feeder();
        Ok(())
    }

    async fn ack_frame(&self, sequence: u64) -> Result<()> {
        let mut page = self.inner.page.lock();
        if page.in_flight == Some(sequence) {
            page.in_flight = None;
        }
        Ok(())
    }

    async fn set_viewport(&self, viewport: Viewport) -> Result<()> {
        viewport.validate()?;
        self.inner.page.lock().viewport = Some(viewport);
        Ok(())
    }

    async fn dispatch_input(&self, event: InputEvent) -> Result<()> {
        match event {
            InputEvent::Navigate { url } => self.simulate_navigation(url),
            InputEvent::Reload | InputEvent::GoBack | InputEvent::GoForward => {
                let url = self.url();
                self.simulate_navigation(url);
            }
            other => {
                let Some((x, y)) = other.position() else {
                    return Ok(());
                };
                let changed = {
                    let mut page = self.inner.page.lock();
                    page.pointer = (x, y);
                    let half = page.viewport.map_or(f64::MAX, |v| f64::from(v.width) / 2.0);
                    let cursor = if x >= half { "pointer" } else { "default" };
                    if page.cursor != cursor {
                        page.cursor = cursor.to_string();
                        page.sink.clone().map(|sink| (sink, cursor))
                    } else {
                        None
                    }
                };
                if let Some((sink, cursor)) = changed {
                    sink.cursor_style_changed(cursor);
                }
            }
        }
        Ok(())
    }
}
