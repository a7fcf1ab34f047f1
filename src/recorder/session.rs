//! Capture session
//!
//! Everything one recording owns: the display stream, the paint loop, the
//! audio graph, the encoder and its chunks, and the timers feeding the
//! controller. Teardown releases all of it and is safe to call repeatedly.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::artifact::ArtifactInfo;
use super::assembler::EncodingChoice;
use super::encoder::{EncoderEvent, MediaEncoder};
use super::error::{RecordingError, RecordingResult};
use super::state::ElapsedClock;
use crate::capture::audio::{AudioGraph, AudioRoute, AudioSelection};
use crate::capture::compositor::FrameLoop;
use crate::capture::geometry::{detect_surface, SurfaceAdvisory};
use crate::capture::traits::{AudioFormat, DisplayRequest, DisplayStream, MediaDevices, PixelSize, RegionSource};
use crate::config::PipelineConfig;

/// Something that happened to a session, posted to the controller
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Acquired(Box<Acquisition>),
    AcquireFailed(RecordingError),
    Encoder(EncoderEvent),
    Tick,
    DisplayEnded,
    FinalizeTimeout,
    /// Result of handing the artifact to the sink
    Delivered(RecordingResult<Option<ArtifactInfo>>),
}

/// Sender tagging every event with the session generation it belongs to
#[derive(Clone)]
pub(crate) struct SessionEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
}

impl SessionEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, SessionEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Post an event; gives it back if the controller is gone
    pub fn send(&self, event: SessionEvent) -> Result<(), SessionEvent> {
        self.tx
            .send((self.generation, event))
            .map_err(|mpsc::error::SendError((_, event))| event)
    }
}

/// Streams granted during start, not yet owned by a session
pub(crate) struct Acquisition {
    pub display: Arc<dyn DisplayStream>,
    pub raw_size: PixelSize,
    pub advisory: Option<SurfaceAdvisory>,
    pub audio: Option<AudioGraph>,
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("raw_size", &self.raw_size)
            .field("advisory", &self.advisory)
            .field("audio", &self.audio.as_ref().map(|a| a.routes().to_vec()))
            .finish()
    }
}

impl Acquisition {
    /// Give everything back
    pub fn release(mut self) {
        if let Some(mut audio) = self.audio.take() {
            audio.close();
        }
        self.display.stop();
        tracing::debug!("Released acquisition that no session claimed");
    }
}

/// Request the display, wait for it to be usable and build the audio graph.
///
/// A dismissed picker comes back as `UserCancelled`. Anything granted before
/// a failure is released before returning.
pub(crate) async fn acquire(
    devices: Arc<dyn MediaDevices>,
    region: Arc<dyn RegionSource>,
    selection: AudioSelection,
    config: PipelineConfig,
) -> RecordingResult<Acquisition> {
    let display = devices
        .get_display_media(DisplayRequest::current_tab(selection.system))
        .await
        .map_err(|e| match e {
            RecordingError::PermissionDenied(reason) => RecordingError::UserCancelled(reason),
            other => other,
        })?;

    let raw_size = match tokio::time::timeout(config.metadata_timeout(), display.wait_for_metadata()).await {
        Ok(Ok(size)) => size,
        Ok(Err(e)) => {
            display.stop();
            return Err(e);
        }
        Err(_) => {
            display.stop();
            return Err(RecordingError::Unready(
                "video metadata did not load in time".to_string(),
            ));
        }
    };
    tracing::debug!("Display stream ready at {}x{}", raw_size.width, raw_size.height);

    let advisory = detect_surface(region.viewport(), raw_size, &config);
    let format = AudioFormat {
        sample_rate: config.audio_sample_rate,
        channels: config.audio_channels,
    };
    let audio = AudioGraph::build(devices.as_ref(), selection, display.take_audio_tracks(), format).await;

    Ok(Acquisition {
        display,
        raw_size,
        advisory,
        audio,
    })
}

/// The active recording
pub struct CaptureSession {
    id: Uuid,
    choice: EncodingChoice,
    render_size: PixelSize,
    display: Arc<dyn DisplayStream>,
    frame_loop: Option<FrameLoop>,
    audio: Option<AudioGraph>,
    encoder: Option<Box<dyn MediaEncoder>>,
    chunks: Vec<Vec<u8>>,
    clock: ElapsedClock,
    last_tick: u64,
    events: SessionEvents,
    ticker: Option<JoinHandle<()>>,
    finalize_timer: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    torn_down: bool,
}

impl CaptureSession {
    pub(crate) fn new(
        choice: EncodingChoice,
        render_size: PixelSize,
        display: Arc<dyn DisplayStream>,
        frame_loop: FrameLoop,
        audio: Option<AudioGraph>,
        events: SessionEvents,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            choice,
            render_size,
            display,
            frame_loop: Some(frame_loop),
            audio,
            encoder: None,
            chunks: Vec::new(),
            clock: ElapsedClock::new(),
            last_tick: 0,
            events,
            ticker: None,
            finalize_timer: None,
            background: Vec::new(),
            torn_down: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn choice(&self) -> &EncodingChoice {
        &self.choice
    }

    pub fn render_size(&self) -> PixelSize {
        self.render_size
    }

    pub fn audio_routes(&self) -> Vec<AudioRoute> {
        self.audio.as_ref().map(|a| a.routes().to_vec()).unwrap_or_default()
    }

    /// Start encoding, the elapsed clock and the external-end watcher
    pub(crate) fn start(&mut self, mut encoder: Box<dyn MediaEncoder>, timeslice: Duration) -> RecordingResult<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        encoder.start(timeslice, tx)?;
        self.encoder = Some(encoder);

        let events = self.events.clone();
        self.background.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if events.send(SessionEvent::Encoder(event)).is_err() {
                    break;
                }
            }
        }));

        let mut ended = self.display.ended();
        let events = self.events.clone();
        self.background.push(tokio::spawn(async move {
            loop {
                if *ended.borrow_and_update() {
                    let _ = events.send(SessionEvent::DisplayEnded);
                    break;
                }
                if ended.changed().await.is_err() {
                    break;
                }
            }
        }));

        self.clock.start();
        self.schedule_tick();
        tracing::info!(
            "Session {} recording at {}x{} as {}",
            self.id,
            self.render_size.width,
            self.render_size.height,
            self.choice.mime_type
        );
        Ok(())
    }

    pub(crate) fn pause(&mut self) -> RecordingResult<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.pause()?;
        }
        self.clock.pause();
        self.cancel_tick();
        Ok(())
    }

    pub(crate) fn resume(&mut self) -> RecordingResult<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.resume()?;
        }
        self.clock.start();
        self.schedule_tick();
        Ok(())
    }

    /// Handle a timer firing; returns a newly reached whole second
    pub(crate) fn on_tick(&mut self) -> Option<u64> {
        if !self.clock.is_running() {
            return None;
        }
        self.schedule_tick();
        let secs = self.clock.elapsed_secs();
        if secs > self.last_tick {
            self.last_tick = secs;
            Some(secs)
        } else {
            None
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.clock.elapsed_secs()
    }

    pub(crate) fn push_chunk(&mut self, chunk: Vec<u8>) {
        if !chunk.is_empty() {
            self.chunks.push(chunk);
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn take_chunks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.chunks)
    }

    /// Halt painting and the clock and ask the encoder to finalize.
    ///
    /// The encoder answers with its last chunk and `Stopped`; if it does not
    /// within `finalize_timeout`, a `FinalizeTimeout` event is posted.
    pub(crate) fn begin_stop(&mut self, finalize_timeout: Duration) -> RecordingResult<()> {
        if let Some(frame_loop) = self.frame_loop.as_mut() {
            frame_loop.cancel();
        }
        self.clock.pause();
        self.cancel_tick();

        let events = self.events.clone();
        self.finalize_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(finalize_timeout).await;
            let _ = events.send(SessionEvent::FinalizeTimeout);
        }));

        match self.encoder.as_mut() {
            Some(encoder) => encoder.stop(),
            None => Ok(()),
        }
    }

    /// Release every resource. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(mut frame_loop) = self.frame_loop.take() {
            frame_loop.cancel();
        }
        self.cancel_tick();
        if let Some(timer) = self.finalize_timer.take() {
            timer.abort();
        }
        for task in self.background.drain(..) {
            task.abort();
        }
        self.encoder = None;
        if let Some(mut audio) = self.audio.take() {
            audio.close();
        }
        self.display.stop();
        tracing::debug!("Session {} torn down", self.id);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    fn schedule_tick(&mut self) {
        self.cancel_tick();
        let delay = self.clock.until_next_second();
        let events = self.events.clone();
        self.ticker = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::Tick);
        }));
    }

    fn cancel_tick(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::compositor::FrameCompositor;
    use crate::capture::geometry::GeometryTracker;
    use crate::capture::synthetic::{
        PermissionOutcome, SyntheticBehavior, SyntheticDevices, SyntheticDisplay, SyntheticRegion,
    };
    use crate::capture::traits::{MediaStreamHandle, Rect, Size};
    use crate::recorder::assembler::AssembledStream;
    use crate::recorder::encoder::EncoderBackend;
    use crate::recorder::memory_encoder::MemoryEncoderBackend;

    fn region() -> Arc<SyntheticRegion> {
        Arc::new(SyntheticRegion::new(
            Some(Rect::new(12.0, 8.0, 96.0, 60.0)),
            Size::new(144.0, 90.0),
        ))
    }

    fn small_devices() -> SyntheticDevices {
        SyntheticDevices::new(SyntheticBehavior {
            raw_size: PixelSize::new(288, 180),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_acquire_maps_denial_to_cancellation() {
        let devices = Arc::new(SyntheticDevices::new(SyntheticBehavior {
            display: PermissionOutcome::Deny,
            ..Default::default()
        }));
        let result = acquire(devices.clone(), region(), AudioSelection::default(), PipelineConfig::default()).await;
        assert!(matches!(result, Err(RecordingError::UserCancelled(_))));
        assert_eq!(devices.open_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_waiting_for_metadata() {
        let devices = Arc::new(SyntheticDevices::new(SyntheticBehavior {
            metadata_ready: false,
            ..Default::default()
        }));
        let result = acquire(devices.clone(), region(), AudioSelection::default(), PipelineConfig::default()).await;
        assert!(matches!(result, Err(RecordingError::Unready(_))));
        assert_eq!(devices.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_release_stops_everything() {
        let devices = Arc::new(small_devices());
        let selection = AudioSelection {
            system: true,
            microphone: true,
        };
        let acquisition = acquire(devices.clone(), region(), selection, PipelineConfig::default())
            .await
            .unwrap();
        assert_eq!(acquisition.raw_size, PixelSize::new(288, 180));
        assert!(acquisition.advisory.is_none());
        assert_eq!(devices.open_streams(), 2);

        acquisition.release();
        assert_eq!(devices.open_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_idempotent() {
        let display = Arc::new(SyntheticDisplay::new(PixelSize::new(288, 180), false));
        let (compositor, video) = FrameCompositor::new(
            display.clone(),
            GeometryTracker::new(region(), 5.0),
            PixelSize::new(192, 120),
            30,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let choice = EncodingChoice::new("video/webm", 1);
        let mut session = CaptureSession::new(
            choice.clone(),
            PixelSize::new(192, 120),
            display.clone(),
            FrameLoop::spawn(compositor, Duration::from_millis(16)),
            None,
            SessionEvents::new(1, tx),
        );
        let encoder = MemoryEncoderBackend::webm()
            .create(AssembledStream::new(video, None), &choice)
            .unwrap();
        session.start(encoder, Duration::from_secs(1)).unwrap();

        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 1);
        assert!(matches!(event, SessionEvent::Tick | SessionEvent::Encoder(_)));

        session.teardown();
        session.teardown();
        assert!(session.is_torn_down());
        assert!(!display.is_active());
        assert_eq!(display.stop_calls(), 1);
    }
}
