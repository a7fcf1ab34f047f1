//! Pipeline configuration
//!
//! Tunables for the recording pipeline plus the mockup model catalogue.
//! Stored as camelCase JSON; a missing file means defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::recorder::error::{RecordingError, RecordingResult};

/// Encoding candidates, most efficient first
pub const DEFAULT_MIME_CANDIDATES: [&str; 4] = [
    "video/webm;codecs=vp9",
    "video/webm;codecs=vp8",
    "video/webm",
    "video/mp4",
];

/// Recording pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Widest output surface; larger regions are downscaled proportionally
    pub max_render_width: u32,

    /// Output frame rate of the compositor and encoder
    pub frame_rate: u32,

    /// Rate of the paint callback driving the compositor
    pub refresh_rate_hz: u32,

    /// Height mismatch (raw pixels) below which no chrome offset is applied.
    ///
    /// The browser-chrome offset is a heuristic; raise this if recordings
    /// jitter vertically, lower it if a thin info bar is not compensated.
    pub vertical_offset_threshold_px: f64,

    /// Aspect ratio difference above which an entire-screen share is suspected
    pub aspect_ratio_advisory_threshold: f64,

    /// Raw width beyond this multiple of the viewport also suggests a full screen
    pub oversize_advisory_factor: f64,

    /// Target video bitrate handed to the encoder
    pub video_bits_per_second: u64,

    /// How often the encoder delivers a chunk
    pub timeslice_ms: u64,

    /// Encoding candidates in priority order
    pub mime_candidates: Vec<String>,

    /// How long to wait for the display stream to report its dimensions
    pub metadata_timeout_ms: u64,

    /// How long to wait for the encoder to flush after stop
    pub finalize_timeout_ms: u64,

    /// Sample rate of the audio mixing context
    pub audio_sample_rate: u32,

    /// Channel count of the audio mixing context
    pub audio_channels: u16,

    /// Where artifacts are downloaded to
    pub output_dir: PathBuf,

    /// Prefix for artifact file names
    pub file_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_render_width: 3840,
            frame_rate: 30,
            refresh_rate_hz: 60,
            vertical_offset_threshold_px: 5.0,
            aspect_ratio_advisory_threshold: 0.1,
            oversize_advisory_factor: 2.0,
            video_bits_per_second: 50_000_000,
            timeslice_ms: 1000,
            mime_candidates: DEFAULT_MIME_CANDIDATES.iter().map(|s| s.to_string()).collect(),
            metadata_timeout_ms: 10_000,
            finalize_timeout_ms: 10_000,
            audio_sample_rate: 48_000,
            audio_channels: 2,
            output_dir: PathBuf::from("."),
            file_prefix: "macos".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load a config file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> RecordingResult<Self> {
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|e| RecordingError::ConfigurationError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        tracing::debug!("Loaded pipeline config from {:?}", path);
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> RecordingResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RecordingError::ConfigurationError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> RecordingResult<()> {
        if self.frame_rate == 0 {
            return Err(RecordingError::ConfigurationError(
                "frameRate must be positive".to_string(),
            ));
        }
        if self.refresh_rate_hz == 0 {
            return Err(RecordingError::ConfigurationError(
                "refreshRateHz must be positive".to_string(),
            ));
        }
        if self.max_render_width == 0 {
            return Err(RecordingError::ConfigurationError(
                "maxRenderWidth must be positive".to_string(),
            ));
        }
        if self.audio_channels == 0 || self.audio_sample_rate == 0 {
            return Err(RecordingError::ConfigurationError(
                "audio format must be non-empty".to_string(),
            ));
        }
        if self.vertical_offset_threshold_px < 0.0 {
            return Err(RecordingError::ConfigurationError(
                "verticalOffsetThresholdPx cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.refresh_rate_hz.max(1)))
    }

    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}

/// A mockup device model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub id: String,
    pub label: String,
    /// Logical width in page pixels
    pub width: u32,
    /// Logical height in page pixels
    pub height: u32,
    /// Text/UI scaling (1 = default)
    pub scale: f64,
    /// Pixel size for dock icons
    pub dock_item_size: u32,
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self {
            id: "macbook-air-13".to_string(),
            label: "MacBook Air 13\"".to_string(),
            width: 1200,
            height: 720,
            scale: 1.0,
            dock_item_size: 48,
        }
    }
}

/// Models offered by the mockup
pub fn device_models() -> Vec<DeviceModel> {
    vec![DeviceModel::default()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.max_render_width, 3840);
        assert_eq!(config.mime_candidates[0], "video/webm;codecs=vp9");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");

        let config = PipelineConfig {
            vertical_offset_threshold_px: 8.0,
            file_prefix: "mockup".to_string(),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.vertical_offset_threshold_px, 8.0);
        assert_eq!(loaded.file_prefix, "mockup");
        assert_eq!(loaded.timeslice_ms, 1000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"frameRate": 60}"#).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.frame_rate, 60);
        assert_eq!(loaded.refresh_rate_hz, 60);
    }

    #[test]
    fn test_rejects_zero_frame_rate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(&path, r#"{"frameRate": 0}"#).unwrap();

        assert!(matches!(
            PipelineConfig::load(&path),
            Err(RecordingError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_zero_refresh_rate_rejected() {
        let config = PipelineConfig {
            refresh_rate_hz: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(RecordingError::ConfigurationError(_))));
        // Still usable without panicking if built past validation
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_model_catalogue() {
        let models = device_models();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].dock_item_size, 48);
    }
}
