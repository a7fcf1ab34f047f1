//! Capture trait definitions
//!
//! Platform-agnostic seams for display capture, microphone and camera
//! access, and the UI region being recorded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::recorder::error::RecordingResult;

/// Size in page (CSS) pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Rectangle in page (CSS) pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Size in raw device pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Rectangle in raw device pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A decoded video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA pixels
    pub data: Vec<u8>,
    /// Milliseconds since the stream started
    pub timestamp_ms: f64,
}

impl VideoFrame {
    /// Create a frame filled with a single color
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self {
            width,
            height,
            data,
            timestamp_ms: 0.0,
        }
    }

    /// RGBA value at a pixel
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }
}

/// Format of interleaved f32 audio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A block of interleaved f32 samples
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub format: AudioFormat,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.format.channels.max(1))
    }
}

/// Which input an audio track came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSourceKind {
    /// Tab/system audio shared along with the display
    System,
    /// Microphone
    Microphone,
    /// Output of the mixing destination
    Mixed,
}

impl std::fmt::Display for AudioSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioSourceKind::System => write!(f, "system"),
            AudioSourceKind::Microphone => write!(f, "microphone"),
            AudioSourceKind::Mixed => write!(f, "mixed"),
        }
    }
}

/// A live audio track; buffers arrive until the source ends
#[derive(Debug)]
pub struct AudioTrack {
    pub kind: AudioSourceKind,
    pub label: String,
    pub format: AudioFormat,
    pub buffers: mpsc::Receiver<AudioBuffer>,
}

/// A live video track at a fixed size and rate
#[derive(Debug)]
pub struct VideoTrack {
    pub size: PixelSize,
    pub frame_rate: u32,
    pub frames: mpsc::Receiver<VideoFrame>,
}

/// Which kind of surface the display picker should offer first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplaySurface {
    Browser,
    Window,
    Monitor,
}

/// Request passed to the display picker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayRequest {
    pub surface: DisplaySurface,
    /// Share tab/system audio along with the video
    pub audio: bool,
    pub prefer_current_tab: bool,
}

impl DisplayRequest {
    /// Current tab, with or without its audio
    pub fn current_tab(audio: bool) -> Self {
        Self {
            surface: DisplaySurface::Browser,
            audio,
            prefer_current_tab: true,
        }
    }
}

/// Constraints for the webcam overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub user_facing: bool,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 640,
            ideal_height: 480,
            user_facing: true,
        }
    }
}

/// Something holding an OS capture resource
pub trait MediaStreamHandle: Send + Sync {
    /// Release the underlying resource. Must be idempotent.
    fn stop(&self);

    fn is_active(&self) -> bool;
}

impl<T: MediaStreamHandle + ?Sized> MediaStreamHandle for Arc<T> {
    fn stop(&self) {
        (**self).stop()
    }

    fn is_active(&self) -> bool {
        (**self).is_active()
    }
}

/// A granted display capture
#[async_trait]
pub trait DisplayStream: MediaStreamHandle {
    /// Resolves once the stream knows its pixel dimensions
    async fn wait_for_metadata(&self) -> RecordingResult<PixelSize>;

    /// Most recent frame; `None` while not enough data is buffered
    fn current_frame(&self) -> Option<Arc<VideoFrame>>;

    /// Wait for and return the next available frame
    async fn grab_frame(&self) -> RecordingResult<Arc<VideoFrame>>;

    /// Hand over the shared audio tracks (empty when none were shared)
    fn take_audio_tracks(&self) -> Vec<AudioTrack>;

    /// Flips to `true` when the stream ends, including from outside the app
    fn ended(&self) -> watch::Receiver<bool>;
}

/// A granted microphone
pub struct MicrophoneStream {
    pub track: AudioTrack,
    pub handle: Box<dyn MediaStreamHandle>,
}

/// Access to capture devices, each gated by a user permission
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Whether display capture is available at all
    fn supports_display_capture(&self) -> bool;

    /// Show the display picker. `PermissionDenied` means it was dismissed.
    async fn get_display_media(&self, request: DisplayRequest) -> RecordingResult<Arc<dyn DisplayStream>>;

    async fn get_microphone(&self) -> RecordingResult<MicrophoneStream>;

    async fn get_camera(&self, constraints: CameraConstraints) -> RecordingResult<Box<dyn MediaStreamHandle>>;
}

/// The UI region being recorded
///
/// Both values are read fresh on every frame.
pub trait RegionSource: Send + Sync {
    /// Live bounding box of the mockup in page coordinates; `None` when the
    /// element is not mounted
    fn tracked_region(&self) -> Option<Rect>;

    /// Current viewport size in page coordinates
    fn viewport(&self) -> Size;
}
