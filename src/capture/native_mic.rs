//! Native microphone capture via cpal
//!
//! cpal streams are not `Send`, so each microphone lives on its own thread
//! that builds the input stream, forwards samples into an [`AudioTrack`] and
//! exits when the handle is stopped.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::traits::{
    AudioBuffer, AudioFormat, AudioSourceKind, AudioTrack, CameraConstraints, DisplayRequest, DisplayStream,
    MediaDevices, MediaStreamHandle, MicrophoneStream,
};
use crate::recorder::error::{RecordingError, RecordingResult};

/// Stops the capture thread when released
pub struct NativeMicHandle {
    running: Arc<AtomicBool>,
}

impl MediaStreamHandle for NativeMicHandle {
    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::debug!("Stopping native microphone");
        }
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Open the default input device
pub async fn open_default_microphone() -> RecordingResult<MicrophoneStream> {
    let running = Arc::new(AtomicBool::new(true));
    let (ready_tx, ready_rx) = oneshot::channel::<RecordingResult<(String, AudioFormat)>>();
    let (tx, rx) = mpsc::channel(64);

    let flag = running.clone();
    std::thread::spawn(move || {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            let _ = ready_tx.send(Err(RecordingError::PermissionDenied(
                "no microphone available".to_string(),
            )));
            return;
        };
        let name = device.name().unwrap_or_else(|_| "microphone".to_string());

        let config = match device.default_input_config() {
            Ok(c) => c,
            Err(e) => {
                let _ = ready_tx.send(Err(RecordingError::PermissionDenied(e.to_string())));
                return;
            }
        };
        if config.sample_format() != SampleFormat::F32 {
            let _ = ready_tx.send(Err(RecordingError::Unsupported(format!(
                "microphone sample format {:?}",
                config.sample_format()
            ))));
            return;
        }

        let format = AudioFormat {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        };
        let stream_flag = flag.clone();
        let stream = device.build_input_stream(
            &config.config(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if stream_flag.load(Ordering::Relaxed) {
                    let _ = tx.try_send(AudioBuffer {
                        format,
                        samples: data.to_vec(),
                    });
                }
            },
            |err| tracing::error!("Microphone stream error: {}", err),
            None,
        );

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(RecordingError::PermissionDenied(e.to_string())));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(RecordingError::CaptureError(e.to_string())));
            return;
        }

        tracing::info!("Microphone '{}' started at {} Hz", name, format.sample_rate);
        let _ = ready_tx.send(Ok((name, format)));

        while flag.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        drop(stream);
        tracing::info!("Microphone stream stopped");
    });

    let (label, format) = ready_rx
        .await
        .map_err(|_| RecordingError::CaptureError("microphone thread exited".to_string()))??;

    Ok(MicrophoneStream {
        track: AudioTrack {
            kind: AudioSourceKind::Microphone,
            label,
            format,
            buffers: rx,
        },
        handle: Box::new(NativeMicHandle { running }),
    })
}

/// Wraps another device set, taking the microphone from the host instead
pub struct WithNativeMicrophone<D> {
    inner: D,
}

impl<D: MediaDevices> WithNativeMicrophone<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<D: MediaDevices> MediaDevices for WithNativeMicrophone<D> {
    fn supports_display_capture(&self) -> bool {
        self.inner.supports_display_capture()
    }

    async fn get_display_media(&self, request: DisplayRequest) -> RecordingResult<Arc<dyn DisplayStream>> {
        self.inner.get_display_media(request).await
    }

    async fn get_microphone(&self) -> RecordingResult<MicrophoneStream> {
        open_default_microphone().await
    }

    async fn get_camera(&self, constraints: CameraConstraints) -> RecordingResult<Box<dyn MediaStreamHandle>> {
        self.inner.get_camera(constraints).await
    }
}
