use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mockup_capture_lib::capture::synthetic::{SyntheticDevices, SyntheticRegion};
use mockup_capture_lib::capture::traits::{MediaDevices, Rect, Size};
use mockup_capture_lib::commands::CaptureOrchestrator;
use mockup_capture_lib::config::PipelineConfig;
use mockup_capture_lib::recorder::{
    DownloadDir, EncoderBackend, FfmpegEncoderBackend, MemoryEncoderBackend, RecordingEvent, RecordingOptions,
};
use mockup_capture_lib::utils::error::UiNotice;

fn notice(n: UiNotice) -> anyhow::Error {
    anyhow::anyhow!("{:?}", n)
}

#[cfg(feature = "native-mic")]
fn devices() -> Arc<dyn MediaDevices> {
    use mockup_capture_lib::capture::native_mic::WithNativeMicrophone;
    Arc::new(WithNativeMicrophone::new(SyntheticDevices::default()))
}

#[cfg(not(feature = "native-mic"))]
fn devices() -> Arc<dyn MediaDevices> {
    Arc::new(SyntheticDevices::default())
}

fn encoders() -> Arc<dyn EncoderBackend> {
    match FfmpegEncoderBackend::detect() {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::warn!("ffmpeg unavailable ({}), using the in-memory encoder", e);
            Arc::new(MemoryEncoderBackend::webm())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mockup_capture_lib::init_logging();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mockup-capture.json"));
    let config = PipelineConfig::load(&config_path).context("loading pipeline config")?;
    let seconds: u64 = std::env::var("MOCKUP_CAPTURE_SECONDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);

    let region = Arc::new(SyntheticRegion::new(
        Some(Rect::new(120.0, 80.0, 960.0, 600.0)),
        Size::new(1440.0, 900.0),
    ));
    let sink = Arc::new(DownloadDir::new(config.output_dir.clone()));
    let orchestrator = CaptureOrchestrator::new(devices(), region, encoders(), sink, config)
        .context("starting capture orchestrator")?;

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let RecordingEvent::Tick { elapsed_secs } = &event {
                tracing::info!("Recording: {}s", elapsed_secs);
            } else if let Ok(json) = serde_json::to_string(&event) {
                tracing::debug!("Event: {}", json);
            }
        }
    });

    orchestrator
        .start_recording(RecordingOptions {
            include_system_audio: true,
            include_microphone: true,
            ..Default::default()
        })
        .await
        .map_err(notice)?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    match orchestrator.stop_recording().await.map_err(notice)? {
        Some(info) => tracing::info!("Recording saved: {} ({} bytes)", info.file_name, info.size_bytes),
        None => tracing::warn!("Recording produced no output"),
    }

    let shot = orchestrator.take_screenshot().await.map_err(notice)?;
    tracing::info!("Screenshot saved: {} ({} bytes)", shot.file_name, shot.size_bytes);

    orchestrator.shutdown().await;
    printer.abort();
    Ok(())
}
