//! Recording commands
//!
//! [`CaptureOrchestrator`] bundles the recording controller with the
//! screenshot path and the webcam overlay.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::capture::screenshot;
use crate::capture::traits::{CameraConstraints, MediaDevices, MediaStreamHandle, RegionSource};
use crate::config::PipelineConfig;
use crate::recorder::artifact::{ArtifactInfo, ArtifactSink};
use crate::recorder::controller::{RecordingController, RecordingEvent};
use crate::recorder::encoder::EncoderBackend;
use crate::recorder::error::RecordingError;
use crate::recorder::state::{RecordingOptions, RecordingState};
use crate::utils::error::{AppError, AppResult, UiNotice};

/// Top-level entry point for the UI layer
pub struct CaptureOrchestrator {
    controller: RecordingController,
    devices: Arc<dyn MediaDevices>,
    region: Arc<dyn RegionSource>,
    sink: Arc<dyn ArtifactSink>,
    config: PipelineConfig,
    webcam: Mutex<Option<Box<dyn MediaStreamHandle>>>,
}

impl CaptureOrchestrator {
    /// Fails when `config` does not validate
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        region: Arc<dyn RegionSource>,
        encoders: Arc<dyn EncoderBackend>,
        sink: Arc<dyn ArtifactSink>,
        config: PipelineConfig,
    ) -> AppResult<Self> {
        let controller = RecordingController::spawn(
            devices.clone(),
            region.clone(),
            encoders,
            sink.clone(),
            config.clone(),
        )?;
        Ok(Self {
            controller,
            devices,
            region,
            sink,
            config,
            webcam: Mutex::new(None),
        })
    }

    pub fn controller(&self) -> &RecordingController {
        &self.controller
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.controller.subscribe()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.controller.state()
    }

    pub fn recording_duration(&self) -> u64 {
        self.controller.elapsed_secs()
    }

    /// Start recording the tracked region
    pub async fn start_recording(&self, options: RecordingOptions) -> Result<(), UiNotice> {
        tracing::info!(
            "Start recording requested (system audio: {}, microphone: {})",
            options.include_system_audio,
            options.include_microphone
        );
        self.controller.start(options).await.map_err(UiNotice::from)
    }

    /// Stop recording and download the artifact
    pub async fn stop_recording(&self) -> Result<Option<ArtifactInfo>, UiNotice> {
        self.controller.stop().await.map_err(UiNotice::from)
    }

    /// Pause when recording, resume when paused
    pub async fn toggle_pause(&self) -> Result<RecordingState, UiNotice> {
        let result = match self.controller.state() {
            RecordingState::Recording => self.controller.pause().await,
            RecordingState::Paused => self.controller.resume().await,
            _ => Err(RecordingError::NotRecording),
        };
        result.map_err(UiNotice::from)?;
        Ok(self.controller.state())
    }

    /// Discard the current recording
    pub async fn cancel_recording(&self) -> Result<(), UiNotice> {
        self.controller.cancel().await.map_err(UiNotice::from)
    }

    /// Turn the webcam overlay on or off, returning whether it is now on
    pub async fn toggle_webcam(&self) -> Result<bool, UiNotice> {
        let mut webcam = self.webcam.lock().await;
        if let Some(handle) = webcam.take() {
            handle.stop();
            tracing::info!("Webcam overlay hidden");
            return Ok(false);
        }

        match self.devices.get_camera(CameraConstraints::default()).await {
            Ok(handle) => {
                *webcam = Some(handle);
                tracing::info!("Webcam overlay shown");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("Webcam unavailable: {}", e);
                Err(AppError::Webcam("could not access webcam".to_string()).into())
            }
        }
    }

    pub async fn webcam_active(&self) -> bool {
        self.webcam.lock().await.as_ref().is_some_and(|h| h.is_active())
    }

    /// Capture a still of the tracked region and download it
    pub async fn take_screenshot(&self) -> Result<ArtifactInfo, UiNotice> {
        let artifact = screenshot::take_screenshot(self.devices.as_ref(), self.region.as_ref(), &self.config)
            .await
            .map_err(UiNotice::from)?;
        let sink = self.sink.clone();
        let info = tokio::task::spawn_blocking(move || {
            sink.deliver(&artifact)
                .map(|location| artifact.info(location))
        })
        .await
        .map_err(|e| RecordingError::CaptureError(format!("screenshot delivery failed: {}", e)))?
        .map_err(UiNotice::from)?;
        tracing::info!("Screenshot {} delivered", info.file_name);
        Ok(info)
    }

    /// Cancel any session, release the webcam and stop the controller
    pub async fn shutdown(&self) {
        self.controller.shutdown().await;
        if let Some(handle) = self.webcam.lock().await.take() {
            handle.stop();
        }
        tracing::info!("Capture orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{PermissionOutcome, SyntheticBehavior, SyntheticDevices, SyntheticRegion};
    use crate::capture::traits::{PixelSize, Rect, Size};
    use crate::recorder::artifact::MemorySink;
    use crate::recorder::memory_encoder::MemoryEncoderBackend;

    fn orchestrator(behavior: SyntheticBehavior) -> (CaptureOrchestrator, Arc<SyntheticDevices>, Arc<MemorySink>) {
        let devices = Arc::new(SyntheticDevices::new(SyntheticBehavior {
            raw_size: PixelSize::new(288, 180),
            ..behavior
        }));
        let region = Arc::new(SyntheticRegion::new(
            Some(Rect::new(12.0, 8.0, 96.0, 60.0)),
            Size::new(144.0, 90.0),
        ));
        let sink = Arc::new(MemorySink::new());
        let orchestrator = CaptureOrchestrator::new(
            devices.clone(),
            region,
            Arc::new(MemoryEncoderBackend::webm()),
            sink.clone(),
            PipelineConfig::default(),
        )
        .unwrap();
        (orchestrator, devices, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_pause_alternates() {
        let (orchestrator, _devices, _sink) = orchestrator(SyntheticBehavior::default());
        assert!(matches!(
            orchestrator.toggle_pause().await,
            Err(UiNotice::Surfaced { .. })
        ));

        orchestrator.start_recording(RecordingOptions::default()).await.unwrap();
        assert_eq!(orchestrator.toggle_pause().await.unwrap(), RecordingState::Paused);
        assert_eq!(orchestrator.toggle_pause().await.unwrap(), RecordingState::Recording);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_webcam_toggle_acquires_and_releases() {
        let (orchestrator, devices, _sink) = orchestrator(SyntheticBehavior::default());
        assert!(orchestrator.toggle_webcam().await.unwrap());
        assert!(orchestrator.webcam_active().await);
        assert_eq!(devices.cameras().len(), 1);
        assert_eq!(devices.cameras()[0].label(), "camera 640x480");

        assert!(!orchestrator.toggle_webcam().await.unwrap());
        assert!(!devices.cameras()[0].is_active());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_webcam_denied_is_surfaced() {
        let (orchestrator, _devices, _sink) = orchestrator(SyntheticBehavior {
            camera: PermissionOutcome::Deny,
            ..Default::default()
        });
        match orchestrator.toggle_webcam().await {
            Err(UiNotice::Surfaced { code, message }) => {
                assert_eq!(code, "WEBCAM_ERROR");
                assert!(message.contains("could not access webcam"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!orchestrator.webcam_active().await);
    }

    #[tokio::test]
    async fn test_shutdown_releases_webcam() {
        let (orchestrator, devices, _sink) = orchestrator(SyntheticBehavior::default());
        orchestrator.toggle_webcam().await.unwrap();
        orchestrator.shutdown().await;
        assert_eq!(devices.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_screenshot_is_delivered_to_sink() {
        let (orchestrator, devices, sink) = orchestrator(SyntheticBehavior::default());
        let info = orchestrator.take_screenshot().await.unwrap();
        assert_eq!(info.mime_type, "image/png");
        assert_eq!(sink.len(), 1);
        assert_eq!(devices.open_streams(), 0);
        assert_eq!(orchestrator.recording_state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_denied_screenshot_is_silent() {
        let (orchestrator, _devices, sink) = orchestrator(SyntheticBehavior {
            display: PermissionOutcome::Deny,
            ..Default::default()
        });
        assert!(matches!(
            orchestrator.take_screenshot().await,
            Err(UiNotice::Silent { .. })
        ));
        assert!(sink.is_empty());
    }
}
