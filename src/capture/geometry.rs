//! Geometry tracking
//!
//! Maps the tracked region from page coordinates into the raw captured
//! stream. Calibration is recomputed from live measurements on every call:
//! window resizes, zoom changes and info bars appearing mid-session all move
//! the mapping.

use std::sync::Arc;

use super::traits::{PixelRect, PixelSize, Rect, RegionSource, Size};
use crate::config::PipelineConfig;

/// Page-to-stream mapping for a single frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Raw pixels per page pixel, taken from widths only
    pub scale: f64,
    /// Raw pixels of browser chrome above the page content
    pub vertical_offset: f64,
}

/// Compute the calibration between the viewport and the raw stream.
///
/// Height is not used for the scale because browser UI makes it unstable.
/// Any surplus raw height beyond `viewport.height * scale` is treated as a
/// chrome offset, but only once it exceeds `threshold_px`.
pub fn calibrate(viewport: Size, raw: PixelSize, threshold_px: f64) -> Option<Calibration> {
    if viewport.width <= 0.0 || raw.width == 0 {
        return None;
    }

    let scale = f64::from(raw.width) / viewport.width;
    let expected_height = viewport.height * scale;
    let diff = f64::from(raw.height) - expected_height;
    let vertical_offset = if diff > threshold_px { diff } else { 0.0 };

    Some(Calibration {
        scale,
        vertical_offset,
    })
}

/// Map a page-coordinate region into raw-stream pixels.
///
/// The result is rounded to whole pixels and clamped so it never extends
/// past the raw stream. Returns `None` when nothing of the region is visible.
pub fn source_rect(
    region: Rect,
    viewport: Size,
    raw: PixelSize,
    threshold_px: f64,
) -> Option<PixelRect> {
    let calibration = calibrate(viewport, raw, threshold_px)?;
    crop_rect(region, raw, calibration)
}

/// Apply a calibration to a region
pub fn crop_rect(region: Rect, raw: PixelSize, calibration: Calibration) -> Option<PixelRect> {
    let s = calibration.scale;
    let raw_w = i64::from(raw.width);
    let raw_h = i64::from(raw.height);

    let sx = ((region.x * s).round() as i64).max(0);
    let sy = ((region.y * s).round() as i64 + calibration.vertical_offset.round() as i64).max(0);
    let sw = (raw_w - sx).min((region.width * s).round() as i64);
    let sh = (raw_h - sy).min((region.height * s).round() as i64);

    if sw <= 0 || sh <= 0 {
        return None;
    }

    Some(PixelRect {
        x: sx as u32,
        y: sy as u32,
        width: sw as u32,
        height: sh as u32,
    })
}

/// Non-fatal hint about the shared surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SurfaceAdvisory {
    /// The capture looks like a whole monitor rather than this tab
    EntireScreenSuspected {
        viewport_ratio: f64,
        capture_ratio: f64,
    },
}

impl SurfaceAdvisory {
    pub fn message(&self) -> String {
        match self {
            SurfaceAdvisory::EntireScreenSuspected { .. } => {
                "Capture dimensions suggest the entire screen was shared; select the browser tab for best results"
                    .to_string()
            }
        }
    }
}

/// Detect a display share that is probably not the current tab
pub fn detect_surface(viewport: Size, raw: PixelSize, config: &PipelineConfig) -> Option<SurfaceAdvisory> {
    if viewport.width <= 0.0 || viewport.height <= 0.0 || raw.height == 0 {
        return None;
    }

    let viewport_ratio = viewport.width / viewport.height;
    let capture_ratio = f64::from(raw.width) / f64::from(raw.height);
    let ratio_diff = (viewport_ratio - capture_ratio).abs();
    let oversized = f64::from(raw.width) > viewport.width * config.oversize_advisory_factor;

    if ratio_diff > config.aspect_ratio_advisory_threshold || oversized {
        Some(SurfaceAdvisory::EntireScreenSuspected {
            viewport_ratio,
            capture_ratio,
        })
    } else {
        None
    }
}

/// Per-frame source rectangle for the live region
pub struct GeometryTracker {
    region: Arc<dyn RegionSource>,
    threshold_px: f64,
}

impl GeometryTracker {
    pub fn new(region: Arc<dyn RegionSource>, threshold_px: f64) -> Self {
        Self {
            region,
            threshold_px,
        }
    }

    /// Re-measure the region and viewport and map them onto `raw`.
    ///
    /// `None` when the region is unmounted or entirely off-stream.
    pub fn track(&self, raw: PixelSize) -> Option<PixelRect> {
        let region = self.region.tracked_region()?;
        source_rect(region, self.region.viewport(), raw, self.threshold_px)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    struct MovableRegion {
        rect: RwLock<Option<Rect>>,
        viewport: RwLock<Size>,
    }

    impl RegionSource for MovableRegion {
        fn tracked_region(&self) -> Option<Rect> {
            *self.rect.read()
        }

        fn viewport(&self) -> Size {
            *self.viewport.read()
        }
    }

    #[test]
    fn test_reference_scenario() {
        let rect = source_rect(
            Rect::new(120.0, 80.0, 960.0, 600.0),
            Size::new(1440.0, 900.0),
            PixelSize::new(2880, 1800),
            5.0,
        )
        .unwrap();

        assert_eq!(
            rect,
            PixelRect {
                x: 240,
                y: 160,
                width: 1920,
                height: 1200
            }
        );
    }

    #[test]
    fn test_scale_is_width_ratio() {
        for viewport_w in [320.0, 800.0, 1280.0, 1440.0, 1920.0, 2560.0] {
            for raw_w in [640u32, 1366, 1920, 2880, 3840] {
                let cal = calibrate(
                    Size::new(viewport_w, 900.0),
                    PixelSize::new(raw_w, 1800),
                    5.0,
                )
                .unwrap();
                assert_eq!(cal.scale, f64::from(raw_w) / viewport_w);
            }
        }
    }

    #[test]
    fn test_rect_never_exceeds_stream() {
        let raw = PixelSize::new(1920, 1080);
        let viewport = Size::new(1280.0, 700.0);
        for x in [0.0, 100.0, 900.0, 1270.0] {
            for y in [0.0, 50.0, 650.0] {
                for (w, h) in [(100.0, 100.0), (1280.0, 700.0), (2000.0, 1500.0)] {
                    if let Some(r) = source_rect(Rect::new(x, y, w, h), viewport, raw, 5.0) {
                        assert!(r.x + r.width <= raw.width, "{:?}", r);
                        assert!(r.y + r.height <= raw.height, "{:?}", r);
                    }
                }
            }
        }
    }

    #[test]
    fn test_small_height_mismatch_is_ignored() {
        // 1440x900 at 2x expects 1800 raw rows; 1804 is rounding noise
        let cal = calibrate(Size::new(1440.0, 900.0), PixelSize::new(2880, 1804), 5.0).unwrap();
        assert_eq!(cal.vertical_offset, 0.0);
    }

    #[test]
    fn test_info_bar_offset_is_applied() {
        let cal = calibrate(Size::new(1440.0, 900.0), PixelSize::new(2880, 1880), 5.0).unwrap();
        assert_eq!(cal.vertical_offset, 80.0);

        let rect = source_rect(
            Rect::new(120.0, 80.0, 960.0, 600.0),
            Size::new(1440.0, 900.0),
            PixelSize::new(2880, 1880),
            5.0,
        )
        .unwrap();
        assert_eq!(rect.y, 240);
        assert_eq!(rect.height, 1200);
    }

    #[test]
    fn test_threshold_is_tunable() {
        let raw = PixelSize::new(2880, 1804);
        let viewport = Size::new(1440.0, 900.0);
        assert_eq!(calibrate(viewport, raw, 2.0).unwrap().vertical_offset, 4.0);
        assert_eq!(calibrate(viewport, raw, 5.0).unwrap().vertical_offset, 0.0);
    }

    #[test]
    fn test_region_off_stream_yields_none() {
        let rect = source_rect(
            Rect::new(2000.0, 0.0, 100.0, 100.0),
            Size::new(1440.0, 900.0),
            PixelSize::new(1440, 900),
            5.0,
        );
        assert!(rect.is_none());
        assert!(calibrate(Size::new(0.0, 900.0), PixelSize::new(1440, 900), 5.0).is_none());
    }

    #[test]
    fn test_entire_screen_advisory() {
        let config = PipelineConfig::default();
        let viewport = Size::new(1440.0, 760.0);

        // Tab share matches the viewport ratio
        assert!(detect_surface(viewport, PixelSize::new(2880, 1520), &config).is_none());

        // A 16:10 monitor against a short viewport
        assert!(detect_surface(viewport, PixelSize::new(2880, 1800), &config).is_some());

        // Same ratio, but far wider than the viewport
        assert!(detect_surface(viewport, PixelSize::new(4320, 2280), &config).is_some());
    }

    #[test]
    fn test_tracker_follows_live_region() {
        let region = Arc::new(MovableRegion {
            rect: RwLock::new(Some(Rect::new(0.0, 0.0, 100.0, 100.0))),
            viewport: RwLock::new(Size::new(1000.0, 500.0)),
        });
        let tracker = GeometryTracker::new(region.clone(), 5.0);
        let raw = PixelSize::new(2000, 1000);

        assert_eq!(tracker.track(raw).unwrap().width, 200);

        // Window resized mid-session: scale changes with it
        *region.viewport.write() = Size::new(500.0, 250.0);
        *region.rect.write() = Some(Rect::new(10.0, 10.0, 100.0, 50.0));
        let rect = tracker.track(raw).unwrap();
        assert_eq!(rect, PixelRect { x: 40, y: 40, width: 400, height: 200 });

        *region.rect.write() = None;
        assert!(tracker.track(raw).is_none());
    }
}
