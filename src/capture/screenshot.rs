//! One-shot screenshot
//!
//! Grabs a single frame from a fresh display share, releases the share right
//! away and crops the tracked region out of the frame using the same
//! calibration the compositor applies per frame.

use super::geometry::source_rect;
use super::traits::{DisplayRequest, MediaDevices, PixelRect, PixelSize, RegionSource, VideoFrame};
use crate::config::PipelineConfig;
use crate::recorder::artifact::RecordingArtifact;
use crate::recorder::error::{RecordingError, RecordingResult};

/// Capture the tracked region as a PNG artifact
pub async fn take_screenshot(
    devices: &dyn MediaDevices,
    region: &dyn RegionSource,
    config: &PipelineConfig,
) -> RecordingResult<RecordingArtifact> {
    if region.tracked_region().is_none() {
        return Err(RecordingError::Unready("Desktop element not found".to_string()));
    }
    if !devices.supports_display_capture() {
        return Err(RecordingError::Unsupported(
            "Display capture is not supported here".to_string(),
        ));
    }

    let display = devices
        .get_display_media(DisplayRequest::current_tab(false))
        .await
        .map_err(|e| match e {
            RecordingError::PermissionDenied(reason) => RecordingError::UserCancelled(reason),
            other => other,
        })?;

    let grabbed = tokio::time::timeout(config.metadata_timeout(), display.grab_frame()).await;
    // Never keep the share open past the grab
    display.stop();

    let frame = match grabbed {
        Ok(frame) => frame?,
        Err(_) => {
            return Err(RecordingError::Unready(
                "display stream produced no frame in time".to_string(),
            ))
        }
    };

    // Measured after the grab so the crop matches that instant
    let rect = region
        .tracked_region()
        .ok_or_else(|| RecordingError::Unready("Desktop element not found".to_string()))?;
    let raw = PixelSize::new(frame.width, frame.height);
    let crop = source_rect(rect, region.viewport(), raw, config.vertical_offset_threshold_px)
        .ok_or_else(|| RecordingError::CaptureError("region is outside the captured display".to_string()))?;

    tracing::debug!(
        "Screenshot crop ({}, {}) {}x{} from {}x{}",
        crop.x,
        crop.y,
        crop.width,
        crop.height,
        raw.width,
        raw.height
    );

    let png = encode_png(&frame, crop)?;
    Ok(RecordingArtifact::screenshot(png, &config.file_prefix))
}

/// Encode `crop` of `frame` as an 8-bit RGBA PNG
pub fn encode_png(frame: &VideoFrame, crop: PixelRect) -> RecordingResult<Vec<u8>> {
    let stride = frame.width as usize * 4;
    let mut pixels = Vec::with_capacity(crop.width as usize * crop.height as usize * 4);
    for y in crop.y..crop.y + crop.height {
        let start = y as usize * stride + crop.x as usize * 4;
        let end = start + crop.width as usize * 4;
        let row = frame
            .data
            .get(start..end)
            .ok_or_else(|| RecordingError::CaptureError("crop exceeds frame data".to_string()))?;
        pixels.extend_from_slice(row);
    }

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, crop.width, crop.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| RecordingError::CaptureError(format!("PNG header error: {}", e)))?;
        writer
            .write_image_data(&pixels)
            .map_err(|e| RecordingError::CaptureError(format!("PNG encode error: {}", e)))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{PermissionOutcome, SyntheticBehavior, SyntheticDevices, SyntheticRegion};
    use crate::capture::traits::{Rect, Size};
    use crate::recorder::artifact::ArtifactKind;

    fn decode(data: &[u8]) -> (u32, u32, Vec<u8>) {
        let decoder = png::Decoder::new(data);
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        buf.truncate(info.buffer_size());
        (info.width, info.height, buf)
    }

    #[tokio::test]
    async fn test_screenshot_crops_region_and_releases_stream() {
        let devices = SyntheticDevices::new(SyntheticBehavior {
            raw_size: PixelSize::new(288, 180),
            ..Default::default()
        });
        let region = SyntheticRegion::new(Some(Rect::new(12.0, 8.0, 96.0, 60.0)), Size::new(144.0, 90.0));

        let artifact = take_screenshot(&devices, &region, &PipelineConfig::default())
            .await
            .unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Screenshot);
        assert_eq!(artifact.mime_type, "image/png");
        assert!(artifact.file_name.starts_with("macos-screenshot-"));
        assert_eq!(devices.open_streams(), 0);

        let (width, height, pixels) = decode(&artifact.data);
        assert_eq!((width, height), (192, 120));
        // Top-left of the crop is raw pixel (24, 16) of the gradient
        assert_eq!(&pixels[..4], &[(24 * 255 / 288) as u8, (16 * 255 / 180) as u8, 128, 255]);
    }

    #[tokio::test]
    async fn test_denied_share_is_user_cancellation() {
        let devices = SyntheticDevices::new(SyntheticBehavior {
            display: PermissionOutcome::Deny,
            ..Default::default()
        });
        let region = SyntheticRegion::new(Some(Rect::new(0.0, 0.0, 10.0, 10.0)), Size::new(100.0, 100.0));
        let err = take_screenshot(&devices, &region, &PipelineConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_user_cancellation());
    }

    #[tokio::test]
    async fn test_missing_region_skips_picker() {
        let devices = SyntheticDevices::default();
        let region = SyntheticRegion::new(None, Size::new(100.0, 100.0));
        assert!(matches!(
            take_screenshot(&devices, &region, &PipelineConfig::default()).await,
            Err(RecordingError::Unready(_))
        ));
        assert_eq!(devices.display_requests(), 0);
    }

    #[test]
    fn test_encode_rejects_crop_past_frame() {
        let frame = VideoFrame::solid(4, 4, [1, 2, 3, 4]);
        let crop = PixelRect {
            x: 2,
            y: 2,
            width: 4,
            height: 4,
        };
        assert!(encode_png(&frame, crop).is_err());
    }
}
