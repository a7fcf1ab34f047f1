//! Capture pipeline
//!
//! Platform seams, per-frame geometry, the compositor loop, the audio graph
//! and the one-shot screenshot path.

pub mod audio;
pub mod compositor;
pub mod geometry;
pub mod screenshot;
pub mod synthetic;
pub mod traits;

#[cfg(feature = "native-mic")]
pub mod native_mic;

pub use audio::{AudioGraph, AudioRoute, AudioSelection};
pub use compositor::{FrameCompositor, FrameLoop};
pub use geometry::{calibrate, source_rect, Calibration, GeometryTracker, SurfaceAdvisory};
pub use screenshot::take_screenshot;
pub use traits::{
    CameraConstraints, DisplayRequest, DisplayStream, MediaDevices, MediaStreamHandle, PixelRect, PixelSize, Rect,
    RegionSource, Size,
};
