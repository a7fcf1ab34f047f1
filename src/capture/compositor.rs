//! Frame compositor
//!
//! Repaints a fixed-size output surface from the live display stream at a
//! fixed frame rate, cropping to wherever the tracked region currently is.
//! The painted surface is exposed as a [`VideoTrack`] for the encoder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::geometry::GeometryTracker;
use super::traits::{DisplayStream, PixelRect, PixelSize, Size, VideoFrame, VideoTrack};

/// Size of the output surface for a region of `region` page pixels.
///
/// The surface keeps the region's raw-pixel size but is capped at
/// `max_width`, scaling the height by the same factor.
pub fn render_size(region: Size, base_scale: f64, max_width: u32) -> PixelSize {
    let mut width = (region.width * base_scale).round().max(1.0);
    let mut height = (region.height * base_scale).round().max(1.0);

    if width > f64::from(max_width) {
        let internal_scale = f64::from(max_width) / width;
        width = f64::from(max_width);
        height = (height * internal_scale).round().max(1.0);
    }

    PixelSize::new(width as u32, height as u32)
}

/// Throttles a faster paint callback down to the target frame rate.
///
/// The remainder of each interval is carried over so frame times do not
/// drift when callbacks arrive unevenly.
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval_ms: f64,
    last_draw_ms: f64,
}

impl FramePacer {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            interval_ms: 1000.0 / f64::from(frame_rate.max(1)),
            last_draw_ms: 0.0,
        }
    }

    /// Whether a callback at `now_ms` should paint
    pub fn accept(&mut self, now_ms: f64) -> bool {
        let elapsed = now_ms - self.last_draw_ms;
        if elapsed > self.interval_ms {
            self.last_draw_ms = now_ms - (elapsed % self.interval_ms);
            true
        } else {
            false
        }
    }
}

/// RGBA drawing surface
#[derive(Debug, Clone)]
pub struct Surface {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Surface {
    /// Create an opaque black surface
    pub fn new(size: PixelSize) -> Self {
        let mut data = vec![0u8; size.width as usize * size.height as usize * 4];
        for px in data.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Self {
            width: size.width,
            height: size.height,
            data,
        }
    }

    pub fn size(&self) -> PixelSize {
        PixelSize::new(self.width, self.height)
    }

    /// Draw `src_rect` of `frame` stretched over the whole surface with
    /// bilinear filtering.
    pub fn draw_image(&mut self, frame: &VideoFrame, src_rect: PixelRect) {
        if frame.width == 0
            || frame.height == 0
            || frame.data.len() < frame.width as usize * frame.height as usize * 4
        {
            return;
        }

        // The frame may be smaller than the size the rect was computed for
        // if the stream resized between measurement and draw.
        let sx0 = src_rect.x.min(frame.width - 1);
        let sy0 = src_rect.y.min(frame.height - 1);
        let sw = src_rect.width.min(frame.width - sx0).max(1);
        let sh = src_rect.height.min(frame.height - sy0).max(1);

        let x_taps = bilinear_taps(self.width, sx0, sw);
        let y_taps = bilinear_taps(self.height, sy0, sh);
        let stride = frame.width as usize * 4;

        for (dy, &(y0, y1, fy)) in y_taps.iter().enumerate() {
            let row0 = y0 as usize * stride;
            let row1 = y1 as usize * stride;
            let out_row = dy * self.width as usize * 4;

            for (dx, &(x0, x1, fx)) in x_taps.iter().enumerate() {
                let c00 = row0 + x0 as usize * 4;
                let c10 = row0 + x1 as usize * 4;
                let c01 = row1 + x0 as usize * 4;
                let c11 = row1 + x1 as usize * 4;
                let out = out_row + dx * 4;

                for c in 0..4 {
                    let top = lerp(frame.data[c00 + c], frame.data[c10 + c], fx);
                    let bottom = lerp(frame.data[c01 + c], frame.data[c11 + c], fx);
                    self.data[out + c] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    /// Copy of the surface as a frame
    pub fn snapshot(&self, timestamp_ms: f64) -> VideoFrame {
        VideoFrame {
            width: self.width,
            height: self.height,
            data: self.data.clone(),
            timestamp_ms,
        }
    }
}

fn lerp(a: u8, b: u8, t: f32) -> f32 {
    f32::from(a) + (f32::from(b) - f32::from(a)) * t
}

/// Source sample positions for each destination pixel along one axis
fn bilinear_taps(dst_len: u32, src_start: u32, src_len: u32) -> Vec<(u32, u32, f32)> {
    let ratio = src_len as f32 / dst_len.max(1) as f32;
    let last = src_start + src_len - 1;

    (0..dst_len)
        .map(|d| {
            let pos = (src_start as f32 + (d as f32 + 0.5) * ratio - 0.5)
                .clamp(src_start as f32, last as f32);
            let p0 = pos.floor() as u32;
            let p1 = (p0 + 1).min(last);
            (p0, p1, pos - p0 as f32)
        })
        .collect()
}

/// What happened on one paint callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintOutcome {
    /// Too soon after the previous frame
    Throttled,
    /// The display stream has no frame buffered yet
    NotReady,
    /// The tracked region is unmounted or off-stream
    NoRegion,
    Painted,
}

/// Paints the tracked region of the display stream onto the output surface
pub struct FrameCompositor {
    display: Arc<dyn DisplayStream>,
    tracker: GeometryTracker,
    surface: Surface,
    pacer: FramePacer,
    output: mpsc::Sender<VideoFrame>,
    origin: Instant,
    frames_painted: u64,
}

impl FrameCompositor {
    /// Create a compositor and the video track it feeds
    pub fn new(
        display: Arc<dyn DisplayStream>,
        tracker: GeometryTracker,
        size: PixelSize,
        frame_rate: u32,
    ) -> (Self, VideoTrack) {
        // About one second of frames; beyond that frames are dropped
        let (tx, rx) = mpsc::channel(frame_rate.max(1) as usize);

        let compositor = Self {
            display,
            tracker,
            surface: Surface::new(size),
            pacer: FramePacer::new(frame_rate),
            output: tx,
            origin: Instant::now(),
            frames_painted: 0,
        };
        let track = VideoTrack {
            size,
            frame_rate,
            frames: rx,
        };
        (compositor, track)
    }

    /// Handle one paint callback
    pub fn paint(&mut self, now: Instant) -> PaintOutcome {
        let now_ms = now.duration_since(self.origin).as_secs_f64() * 1000.0;
        if !self.pacer.accept(now_ms) {
            return PaintOutcome::Throttled;
        }

        let Some(frame) = self.display.current_frame() else {
            return PaintOutcome::NotReady;
        };
        let raw = PixelSize::new(frame.width, frame.height);
        let Some(src_rect) = self.tracker.track(raw) else {
            return PaintOutcome::NoRegion;
        };

        self.surface.draw_image(&frame, src_rect);
        self.frames_painted += 1;

        match self.output.try_send(self.surface.snapshot(now_ms)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!("Encoder behind, dropping composited frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }

        PaintOutcome::Painted
    }

    pub fn frames_painted(&self) -> u64 {
        self.frames_painted
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }
}

/// Handle to a running paint loop
pub struct FrameLoop {
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<u64>>,
}

impl FrameLoop {
    /// Drive `compositor` from a paint callback firing every `refresh`.
    pub fn spawn(mut compositor: FrameCompositor, refresh: Duration) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                compositor.paint(Instant::now());
            }

            tracing::debug!("Frame loop stopped after {} frames", compositor.frames_painted());
            compositor.frames_painted()
        });

        Self {
            cancelled,
            task: Some(task),
        }
    }

    /// Stop painting; no frame is produced after this returns
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}
