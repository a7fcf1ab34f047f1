//! Synthetic capture backend
//!
//! An in-memory implementation of the capture seams. The display produces a
//! gradient test pattern, audio sources produce sine tones, and every
//! permission outcome can be scripted. Used by the demo binary and tests.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::traits::{
    AudioBuffer, AudioFormat, AudioSourceKind, AudioTrack, CameraConstraints, DisplayRequest,
    DisplayStream, MediaDevices, MediaStreamHandle, MicrophoneStream, PixelSize, Rect,
    RegionSource, Size, VideoFrame,
};
use crate::recorder::error::{RecordingError, RecordingResult};

const TONE_BLOCK: Duration = Duration::from_millis(10);

/// Scripted answer to a permission prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Grant,
    Deny,
}

/// Scripted behaviour of [`SyntheticDevices`]
#[derive(Debug, Clone)]
pub struct SyntheticBehavior {
    pub display_capture_supported: bool,
    pub display: PermissionOutcome,
    pub microphone: PermissionOutcome,
    pub camera: PermissionOutcome,
    /// Raw size of the shared display
    pub raw_size: PixelSize,
    /// Whether tab audio is shared when requested
    pub system_audio_available: bool,
    /// How long each permission prompt stays open
    pub prompt_delay: Duration,
    /// Whether the display reports metadata at all
    pub metadata_ready: bool,
    pub audio_format: AudioFormat,
}

impl Default for SyntheticBehavior {
    fn default() -> Self {
        Self {
            display_capture_supported: true,
            display: PermissionOutcome::Grant,
            microphone: PermissionOutcome::Grant,
            camera: PermissionOutcome::Grant,
            raw_size: PixelSize::new(2880, 1800),
            system_audio_available: true,
            prompt_delay: Duration::from_millis(0),
            metadata_ready: true,
            audio_format: AudioFormat {
                sample_rate: 48_000,
                channels: 2,
            },
        }
    }
}

/// A stream handle that only tracks whether it was released
pub struct SyntheticHandle {
    label: String,
    active: AtomicBool,
    stop_calls: AtomicUsize,
    stopped: watch::Sender<bool>,
}

impl SyntheticHandle {
    pub fn new(label: impl Into<String>) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            label: label.into(),
            active: AtomicBool::new(true),
            stop_calls: AtomicUsize::new(0),
            stopped,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    fn stopped_signal(&self) -> watch::Receiver<bool> {
        self.stopped.subscribe()
    }
}

impl MediaStreamHandle for SyntheticHandle {
    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.active.swap(false, Ordering::SeqCst) {
            self.stopped.send_replace(true);
            tracing::debug!("Released synthetic stream '{}'", self.label);
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Spawn a sine tone that runs until `stop` flips
fn spawn_tone(
    kind: AudioSourceKind,
    format: AudioFormat,
    frequency: f32,
    mut stop: watch::Receiver<bool>,
) -> AudioTrack {
    let (tx, rx) = mpsc::channel(64);
    let frames_per_block = (format.sample_rate as usize * TONE_BLOCK.as_millis() as usize) / 1000;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TONE_BLOCK);
        let mut phase = 0.0f32;
        let step = TAU * frequency / format.sample_rate as f32;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *stop.borrow() {
                break;
            }

            let mut samples = Vec::with_capacity(frames_per_block * usize::from(format.channels));
            for _ in 0..frames_per_block {
                let value = phase.sin() * 0.25;
                phase = (phase + step) % TAU;
                samples.extend(std::iter::repeat(value).take(usize::from(format.channels)));
            }

            if tx.send(AudioBuffer { format, samples }).await.is_err() {
                break;
            }
        }
    });

    AudioTrack {
        kind,
        label: format!("synthetic {} tone", kind),
        format,
        buffers: rx,
    }
}

/// A shared display producing a gradient test pattern
pub struct SyntheticDisplay {
    handle: SyntheticHandle,
    size: RwLock<PixelSize>,
    ready: AtomicBool,
    has_audio: AtomicBool,
    audio_format: AudioFormat,
    ended: watch::Sender<bool>,
    cached_frame: Mutex<Option<Arc<VideoFrame>>>,
}

impl SyntheticDisplay {
    pub fn new(size: PixelSize, with_audio: bool) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            handle: SyntheticHandle::new("display"),
            size: RwLock::new(size),
            ready: AtomicBool::new(true),
            has_audio: AtomicBool::new(with_audio),
            audio_format: AudioFormat {
                sample_rate: 48_000,
                channels: 2,
            },
            ended,
            cached_frame: Mutex::new(None),
        }
    }

    /// Whether frames are buffered
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Simulate the stream changing size, e.g. a browser window resize
    pub fn resize(&self, size: PixelSize) {
        *self.size.write() = size;
        self.cached_frame.lock().take();
    }

    /// Simulate the user pressing the browser's "stop sharing" button
    pub fn end_externally(&self) {
        tracing::debug!("Synthetic display ended externally");
        self.handle.stop();
        self.ended.send_replace(true);
    }

    pub fn stop_calls(&self) -> usize {
        self.handle.stop_calls()
    }

    fn pattern(size: PixelSize) -> VideoFrame {
        let (w, h) = (size.width.max(1), size.height.max(1));
        let mut data = Vec::with_capacity(w as usize * h as usize * 4);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[
                    (x * 255 / w) as u8,
                    (y * 255 / h) as u8,
                    128,
                    255,
                ]);
            }
        }
        VideoFrame {
            width: w,
            height: h,
            data,
            timestamp_ms: 0.0,
        }
    }
}

impl MediaStreamHandle for SyntheticDisplay {
    fn stop(&self) {
        self.handle.stop();
        self.ended.send_replace(true);
    }

    fn is_active(&self) -> bool {
        self.handle.is_active()
    }
}

#[async_trait]
impl DisplayStream for SyntheticDisplay {
    async fn wait_for_metadata(&self) -> RecordingResult<PixelSize> {
        loop {
            if !self.is_active() {
                return Err(RecordingError::CaptureError(
                    "display stream ended before metadata loaded".to_string(),
                ));
            }
            if self.ready.load(Ordering::SeqCst) {
                return Ok(*self.size.read());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn current_frame(&self) -> Option<Arc<VideoFrame>> {
        if !self.is_active() || !self.ready.load(Ordering::SeqCst) {
            return None;
        }
        let size = *self.size.read();
        let mut cached = self.cached_frame.lock();
        let frame = cached.get_or_insert_with(|| Arc::new(Self::pattern(size)));
        Some(frame.clone())
    }

    async fn grab_frame(&self) -> RecordingResult<Arc<VideoFrame>> {
        self.wait_for_metadata().await?;
        self.current_frame()
            .ok_or_else(|| RecordingError::CaptureError("no frame available".to_string()))
    }

    fn take_audio_tracks(&self) -> Vec<AudioTrack> {
        if !self.has_audio.swap(false, Ordering::SeqCst) {
            return Vec::new();
        }
        vec![spawn_tone(
            AudioSourceKind::System,
            self.audio_format,
            440.0,
            self.handle.stopped_signal(),
        )]
    }

    fn ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }
}

/// UI region with settable geometry
pub struct SyntheticRegion {
    region: RwLock<Option<Rect>>,
    viewport: RwLock<Size>,
}

impl SyntheticRegion {
    pub fn new(region: Option<Rect>, viewport: Size) -> Self {
        Self {
            region: RwLock::new(region),
            viewport: RwLock::new(viewport),
        }
    }

    pub fn set_region(&self, region: Option<Rect>) {
        *self.region.write() = region;
    }

    pub fn set_viewport(&self, viewport: Size) {
        *self.viewport.write() = viewport;
    }
}

impl RegionSource for SyntheticRegion {
    fn tracked_region(&self) -> Option<Rect> {
        *self.region.read()
    }

    fn viewport(&self) -> Size {
        *self.viewport.read()
    }
}

/// In-memory capture devices with scripted permission prompts
pub struct SyntheticDevices {
    behavior: RwLock<SyntheticBehavior>,
    displays: Mutex<Vec<Arc<SyntheticDisplay>>>,
    microphones: Mutex<Vec<Arc<SyntheticHandle>>>,
    cameras: Mutex<Vec<Arc<SyntheticHandle>>>,
    display_requests: AtomicUsize,
}

impl SyntheticDevices {
    pub fn new(behavior: SyntheticBehavior) -> Self {
        Self {
            behavior: RwLock::new(behavior),
            displays: Mutex::new(Vec::new()),
            microphones: Mutex::new(Vec::new()),
            cameras: Mutex::new(Vec::new()),
            display_requests: AtomicUsize::new(0),
        }
    }

    /// Change the scripted behaviour for later prompts
    pub fn update(&self, f: impl FnOnce(&mut SyntheticBehavior)) {
        f(&mut self.behavior.write());
    }

    /// The most recently granted display
    pub fn last_display(&self) -> Option<Arc<SyntheticDisplay>> {
        self.displays.lock().last().cloned()
    }

    pub fn microphones(&self) -> Vec<Arc<SyntheticHandle>> {
        self.microphones.lock().clone()
    }

    pub fn cameras(&self) -> Vec<Arc<SyntheticHandle>> {
        self.cameras.lock().clone()
    }

    /// How many times the display picker was shown
    pub fn display_requests(&self) -> usize {
        self.display_requests.load(Ordering::SeqCst)
    }

    /// Streams granted and not yet released
    pub fn open_streams(&self) -> usize {
        let displays = self.displays.lock().iter().filter(|d| d.is_active()).count();
        let mics = self.microphones.lock().iter().filter(|m| m.is_active()).count();
        let cams = self.cameras.lock().iter().filter(|c| c.is_active()).count();
        displays + mics + cams
    }

    async fn prompt(&self) {
        let delay = self.behavior.read().prompt_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new(SyntheticBehavior::default())
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    fn supports_display_capture(&self) -> bool {
        self.behavior.read().display_capture_supported
    }

    async fn get_display_media(&self, request: DisplayRequest) -> RecordingResult<Arc<dyn DisplayStream>> {
        self.display_requests.fetch_add(1, Ordering::SeqCst);
        self.prompt().await;

        let behavior = self.behavior.read().clone();
        if behavior.display == PermissionOutcome::Deny {
            return Err(RecordingError::PermissionDenied(
                "display share dialog dismissed".to_string(),
            ));
        }

        let display = Arc::new(SyntheticDisplay::new(
            behavior.raw_size,
            request.audio && behavior.system_audio_available,
        ));
        display.set_ready(behavior.metadata_ready);
        self.displays.lock().push(display.clone());

        tracing::debug!(
            "Granted synthetic display {}x{} (audio: {})",
            behavior.raw_size.width,
            behavior.raw_size.height,
            request.audio
        );
        Ok(display)
    }

    async fn get_microphone(&self) -> RecordingResult<MicrophoneStream> {
        self.prompt().await;

        let behavior = self.behavior.read().clone();
        if behavior.microphone == PermissionOutcome::Deny {
            return Err(RecordingError::PermissionDenied(
                "microphone access denied".to_string(),
            ));
        }

        let handle = Arc::new(SyntheticHandle::new("microphone"));
        self.microphones.lock().push(handle.clone());
        let track = spawn_tone(
            AudioSourceKind::Microphone,
            behavior.audio_format,
            220.0,
            handle.stopped_signal(),
        );

        Ok(MicrophoneStream {
            track,
            handle: Box::new(handle),
        })
    }

    async fn get_camera(&self, constraints: CameraConstraints) -> RecordingResult<Box<dyn MediaStreamHandle>> {
        self.prompt().await;

        if self.behavior.read().camera == PermissionOutcome::Deny {
            return Err(RecordingError::PermissionDenied(
                "camera access denied".to_string(),
            ));
        }

        let handle = Arc::new(SyntheticHandle::new(format!(
            "camera {}x{}",
            constraints.ideal_width, constraints.ideal_height
        )));
        self.cameras.lock().push(handle.clone());
        Ok(Box::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_denied_display_is_permission_error() {
        let devices = SyntheticDevices::new(SyntheticBehavior {
            display: PermissionOutcome::Deny,
            ..Default::default()
        });
        let result = devices.get_display_media(DisplayRequest::current_tab(false)).await;
        assert!(matches!(result, Err(RecordingError::PermissionDenied(_))));
        assert_eq!(devices.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_display_pattern_and_stop() {
        let devices = SyntheticDevices::new(SyntheticBehavior {
            raw_size: PixelSize::new(64, 32),
            ..Default::default()
        });
        let display = devices
            .get_display_media(DisplayRequest::current_tab(false))
            .await
            .unwrap();

        assert_eq!(display.wait_for_metadata().await.unwrap(), PixelSize::new(64, 32));
        let frame = display.grab_frame().await.unwrap();
        assert_eq!(frame.data.len(), 64 * 32 * 4);
        assert!(display.take_audio_tracks().is_empty());

        let ended = display.ended();
        display.stop();
        display.stop();
        assert!(*ended.borrow());
        assert!(display.current_frame().is_none());
        assert_eq!(devices.last_display().unwrap().stop_calls(), 2);
        assert_eq!(devices.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_tone_stops_with_handle() {
        let devices = SyntheticDevices::default();
        let mut mic = devices.get_microphone().await.unwrap();

        let buffer = mic.track.buffers.recv().await.unwrap();
        assert_eq!(buffer.frames(), 480);
        assert_eq!(devices.open_streams(), 1);

        mic.handle.stop();
        // Drain whatever was queued; the generator then closes the track
        while mic.track.buffers.recv().await.is_some() {}
        assert_eq!(devices.open_streams(), 0);
    }
}
