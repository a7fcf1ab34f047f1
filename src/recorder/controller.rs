//! Recording controller
//!
//! A single task owns the session and the state machine. Callers talk to it
//! through [`RecordingController`]; everything asynchronous that belongs to a
//! session (permission prompts, encoder output, timers, the display ending)
//! comes back to the same task as a session event tagged with the session
//! generation, so late results from an abandoned session are recognised and
//! released instead of being applied.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::artifact::{ArtifactInfo, ArtifactSink, RecordingArtifact};
use super::assembler::{select_encoding, AssembledStream, EncodingChoice};
use super::encoder::{EncoderBackend, EncoderEvent};
use super::error::{RecordingError, RecordingResult};
use super::session::{acquire, Acquisition, CaptureSession, SessionEvent, SessionEvents};
use super::state::{RecordingOptions, RecordingState, Transition};
use crate::capture::audio::AudioSelection;
use crate::capture::compositor::{render_size, FrameCompositor, FrameLoop};
use crate::capture::geometry::{calibrate, GeometryTracker};
use crate::capture::traits::{MediaDevices, RegionSource, Size};
use crate::config::PipelineConfig;

/// Events emitted to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecordingEvent {
    /// The lifecycle state changed
    StateChanged { state: RecordingState },
    /// Another whole second of active recording
    Tick { elapsed_secs: u64 },
    /// Non-fatal hint, e.g. the entire screen was shared
    Advisory { message: String },
    /// A start or session failed
    Error { message: String, user_cancelled: bool },
    /// The artifact was delivered
    Finished { artifact: ArtifactInfo },
}

type Reply<T> = oneshot::Sender<RecordingResult<T>>;

enum Command {
    Start { options: RecordingOptions, reply: Reply<()> },
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    Stop { reply: Reply<Option<ArtifactInfo>> },
    Cancel { reply: Reply<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle to the controller task
#[derive(Clone)]
pub struct RecordingController {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<RecordingState>,
    elapsed: watch::Receiver<u64>,
    events: broadcast::Sender<RecordingEvent>,
}

impl RecordingController {
    /// Spawn the controller task.
    ///
    /// Fails with `ConfigurationError` when `config` does not validate.
    pub fn spawn(
        devices: Arc<dyn MediaDevices>,
        region: Arc<dyn RegionSource>,
        encoders: Arc<dyn EncoderBackend>,
        sink: Arc<dyn ArtifactSink>,
        config: PipelineConfig,
    ) -> RecordingResult<Self> {
        config.validate()?;

        let (commands, command_rx) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(RecordingState::Idle);
        let (elapsed_tx, elapsed) = watch::channel(0);
        let (events, _) = broadcast::channel(100);
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let actor = Controller {
            devices,
            region,
            encoders,
            sink,
            config,
            state: RecordingState::Idle,
            state_tx,
            elapsed_tx,
            events: events.clone(),
            session_tx,
            generation: 0,
            starting: None,
            session: None,
            stop_waiter: None,
        };
        tokio::spawn(actor.run(command_rx, session_rx));

        Ok(Self {
            commands,
            state,
            elapsed,
            events,
        })
    }

    /// Acquire streams and begin recording.
    ///
    /// Resolves once recording is running or the start failed. A dismissed
    /// display picker yields `UserCancelled` with the controller back in
    /// `Idle`.
    pub async fn start(&self, options: RecordingOptions) -> RecordingResult<()> {
        self.request(|reply| Command::Start { options, reply }).await
    }

    pub async fn pause(&self) -> RecordingResult<()> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> RecordingResult<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Finalize the recording and deliver the artifact.
    ///
    /// Only the call that initiates finalization receives the artifact; a
    /// stop with no active encoder (or one already finalizing) is a no-op.
    pub async fn stop(&self) -> RecordingResult<Option<ArtifactInfo>> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Abandon the current start or recording without producing an artifact
    pub async fn cancel(&self) -> RecordingResult<()> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Release everything and stop the controller task
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> RecordingState {
        *self.state.borrow()
    }

    /// Whole seconds of active recording in the current session
    pub fn elapsed_secs(&self) -> u64 {
        *self.elapsed.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RecordingState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> RecordingResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| controller_gone())?;
        rx.await.map_err(|_| controller_gone())?
    }
}

fn controller_gone() -> RecordingError {
    RecordingError::CaptureError("recording controller has shut down".to_string())
}

struct PendingStart {
    options: RecordingOptions,
    choice: EncodingChoice,
    reply: Option<Reply<()>>,
}

struct Controller {
    devices: Arc<dyn MediaDevices>,
    region: Arc<dyn RegionSource>,
    encoders: Arc<dyn EncoderBackend>,
    sink: Arc<dyn ArtifactSink>,
    config: PipelineConfig,
    state: RecordingState,
    state_tx: watch::Sender<RecordingState>,
    elapsed_tx: watch::Sender<u64>,
    events: broadcast::Sender<RecordingEvent>,
    session_tx: mpsc::UnboundedSender<(u64, SessionEvent)>,
    /// Bumped whenever a session begins or ends
    generation: u64,
    starting: Option<PendingStart>,
    session: Option<CaptureSession>,
    stop_waiter: Option<Reply<Option<ArtifactInfo>>>,
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut session_events: mpsc::UnboundedReceiver<(u64, SessionEvent)>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.abandon("controller dropped");
                        break;
                    }
                },
                Some((generation, event)) = session_events.recv() => {
                    self.handle_session_event(generation, event);
                }
            }
        }
        tracing::debug!("Recording controller stopped");
    }

    /// Returns false once the controller should exit
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { options, reply } => self.start(options, reply),
            Command::Pause { reply } => {
                let _ = reply.send(self.pause());
            }
            Command::Resume { reply } => {
                let _ = reply.send(self.resume());
            }
            Command::Stop { reply } => self.stop(reply),
            Command::Cancel { reply } => {
                let _ = reply.send(self.cancel());
            }
            Command::Shutdown { reply } => {
                self.abandon("controller shutting down");
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn start(&mut self, options: RecordingOptions, reply: Reply<()>) {
        if let Err(e) = self.state.apply(Transition::Start) {
            let _ = reply.send(Err(e));
            return;
        }

        self.set_state(Transition::Start);

        // Checked before anything is acquired so a refusal leaves nothing open
        let choice = match self.precheck() {
            Ok(choice) => choice,
            Err(e) => {
                self.report_failure(&e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        self.generation += 1;

        let selection = AudioSelection {
            system: options.include_system_audio,
            microphone: options.include_microphone,
        };
        let events = SessionEvents::new(self.generation, self.session_tx.clone());
        let devices = self.devices.clone();
        let region = self.region.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let event = match acquire(devices, region, selection, config).await {
                Ok(acquisition) => SessionEvent::Acquired(Box::new(acquisition)),
                Err(e) => SessionEvent::AcquireFailed(e),
            };
            if let Err(SessionEvent::Acquired(acquisition)) = events.send(event) {
                acquisition.release();
            }
        });

        self.starting = Some(PendingStart {
            options,
            choice,
            reply: Some(reply),
        });
    }

    fn precheck(&self) -> RecordingResult<EncodingChoice> {
        if self.region.tracked_region().is_none() {
            return Err(RecordingError::Unready("Desktop element not found".to_string()));
        }
        if !self.devices.supports_display_capture() {
            return Err(RecordingError::Unsupported(
                "Display capture is not supported here".to_string(),
            ));
        }
        select_encoding(
            &self.config.mime_candidates,
            self.encoders.as_ref(),
            self.config.video_bits_per_second,
        )
    }

    fn pause(&mut self) -> RecordingResult<()> {
        self.state.apply(Transition::Pause)?;
        if let Some(session) = self.session.as_mut() {
            session.pause()?;
        }
        self.set_state(Transition::Pause);
        Ok(())
    }

    fn resume(&mut self) -> RecordingResult<()> {
        self.state.apply(Transition::Resume)?;
        if let Some(session) = self.session.as_mut() {
            session.resume()?;
        }
        self.set_state(Transition::Resume);
        Ok(())
    }

    fn stop(&mut self, reply: Reply<Option<ArtifactInfo>>) {
        match self.state {
            RecordingState::Recording | RecordingState::Paused => {
                self.stop_waiter = Some(reply);
                self.begin_stop();
            }
            other => {
                tracing::debug!("Stop while {} is a no-op", other);
                let _ = reply.send(Ok(None));
            }
        }
    }

    fn cancel(&mut self) -> RecordingResult<()> {
        self.state.apply(Transition::Cancel)?;
        tracing::info!("Cancelling recording while {}", self.state);

        self.generation += 1;
        if let Some(mut pending) = self.starting.take() {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(RecordingError::Cancelled));
            }
        }
        if let Some(mut session) = self.session.take() {
            session.teardown();
        }
        self.elapsed_tx.send_replace(0);
        self.set_state(Transition::Cancel);
        Ok(())
    }

    /// Drop whatever is in flight without producing an artifact
    fn abandon(&mut self, reason: &str) {
        self.generation += 1;
        if let Some(mut pending) = self.starting.take() {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Err(RecordingError::Cancelled));
            }
        }
        if let Some(mut session) = self.session.take() {
            tracing::info!("Discarding session {}: {}", session.id(), reason);
            session.teardown();
        }
        if let Some(waiter) = self.stop_waiter.take() {
            let _ = waiter.send(Err(RecordingError::Cancelled));
        }
        if self.state != RecordingState::Idle {
            self.force_state(RecordingState::Idle);
        }
    }

    fn handle_session_event(&mut self, generation: u64, event: SessionEvent) {
        if generation != self.generation {
            tracing::debug!("Discarding event from stale session {}", generation);
            if let SessionEvent::Acquired(acquisition) = event {
                acquisition.release();
            }
            return;
        }

        match event {
            SessionEvent::Acquired(acquisition) => self.on_acquired(*acquisition),
            SessionEvent::AcquireFailed(e) => self.on_start_failed(e),
            SessionEvent::Encoder(EncoderEvent::DataAvailable(chunk)) => {
                if let Some(session) = self.session.as_mut() {
                    session.push_chunk(chunk);
                }
            }
            SessionEvent::Encoder(EncoderEvent::Stopped) => self.finalize(),
            SessionEvent::Delivered(delivered) => self.finish_delivery(delivered),
            SessionEvent::Encoder(EncoderEvent::Error(message)) => {
                self.fail(RecordingError::EncodingError(message));
            }
            SessionEvent::Tick => {
                if let Some(secs) = self.session.as_mut().and_then(|s| s.on_tick()) {
                    self.elapsed_tx.send_replace(secs);
                    self.emit(RecordingEvent::Tick { elapsed_secs: secs });
                }
            }
            SessionEvent::DisplayEnded => {
                if matches!(self.state, RecordingState::Recording | RecordingState::Paused) {
                    tracing::info!("Display stream ended outside the app, finalizing");
                    self.begin_stop();
                }
            }
            SessionEvent::FinalizeTimeout => {
                if self.state == RecordingState::Stopping && self.session.is_some() {
                    self.fail(RecordingError::EncodingError(format!(
                        "encoder did not finalize within {:?}",
                        self.config.finalize_timeout()
                    )));
                }
            }
        }
    }

    fn on_acquired(&mut self, mut acquisition: Acquisition) {
        let Some(mut pending) = self.starting.take() else {
            acquisition.release();
            return;
        };

        if let Some(advisory) = acquisition.advisory {
            let message = advisory.message();
            tracing::warn!("{}", message);
            self.emit(RecordingEvent::Advisory { message });
        }

        let viewport = self.region.viewport();
        let base_scale = calibrate(viewport, acquisition.raw_size, self.config.vertical_offset_threshold_px)
            .map_or(1.0, |c| c.scale);
        let region_size = match self.region.tracked_region() {
            Some(rect) if !rect.is_empty() => rect.size(),
            _ => {
                let model = &pending.options.model;
                tracing::debug!("Region degenerate, sizing surface from model {}", model.id);
                Size::new(f64::from(model.width), f64::from(model.height))
            }
        };
        let size = render_size(region_size, base_scale, self.config.max_render_width);
        tracing::debug!(
            "Render surface {}x{} (base scale {:.3})",
            size.width,
            size.height,
            base_scale
        );

        let tracker = GeometryTracker::new(self.region.clone(), self.config.vertical_offset_threshold_px);
        let (compositor, video) =
            FrameCompositor::new(acquisition.display.clone(), tracker, size, self.config.frame_rate);
        let frame_loop = FrameLoop::spawn(compositor, self.config.refresh_interval());

        let audio_track = acquisition.audio.as_mut().and_then(|graph| graph.take_output());
        let stream = AssembledStream::new(video, audio_track);

        // Owned by the session from here on, so every failure path releases it
        let mut session = CaptureSession::new(
            pending.choice.clone(),
            size,
            acquisition.display,
            frame_loop,
            acquisition.audio,
            SessionEvents::new(self.generation, self.session_tx.clone()),
        );

        let started = self
            .encoders
            .create(stream, &pending.choice)
            .and_then(|encoder| session.start(encoder, self.config.timeslice()));

        let reply = pending.reply.take();
        match started {
            Ok(()) => {
                tracing::info!(
                    "Recording session {} started with audio routes {:?}",
                    session.id(),
                    session.audio_routes().iter().map(|r| r.kind).collect::<Vec<_>>()
                );
                self.session = Some(session);
                self.elapsed_tx.send_replace(0);
                self.set_state(Transition::Started);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                session.teardown();
                self.report_failure(&e);
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    fn on_start_failed(&mut self, error: RecordingError) {
        let reply = self.starting.take().and_then(|mut p| p.reply.take());
        self.generation += 1;

        if error.is_user_cancellation() {
            tracing::info!("User cancelled screen capture");
            self.set_state(Transition::Cancel);
            self.emit(RecordingEvent::Error {
                message: error.to_string(),
                user_cancelled: true,
            });
        } else {
            self.report_failure(&error);
        }

        if let Some(reply) = reply {
            let _ = reply.send(Err(error));
        }
    }

    fn begin_stop(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.set_state(Transition::Stop);

        let timeout = self.config.finalize_timeout();
        let result = match self.session.as_mut() {
            Some(session) => {
                tracing::info!(
                    "Stopping session {} after {:.1}s",
                    session.id(),
                    session.elapsed().as_secs_f64()
                );
                session.begin_stop(timeout)
            }
            None => Ok(()),
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// The encoder delivered its last chunk
    fn finalize(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if self.state != RecordingState::Stopping {
            // Encoder finished on its own
            self.set_state(Transition::Stop);
        }

        let duration = session.elapsed();
        let chunks = session.take_chunks();
        let choice = session.choice().clone();
        session.teardown();

        if chunks.is_empty() {
            tracing::warn!("Session {} produced no data; nothing to save", session.id());
            self.finish_delivery(Ok(None));
            return;
        }

        let artifact = RecordingArtifact::from_chunks(chunks, &choice, &self.config.file_prefix, duration);
        let sink = self.sink.clone();
        let events = SessionEvents::new(self.generation, self.session_tx.clone());
        // Sinks may write files; keep that off the controller task
        tokio::spawn(async move {
            let delivered = tokio::task::spawn_blocking(move || {
                sink.deliver(&artifact)
                    .map(|location| Some(artifact.info(location)))
            })
            .await
            .unwrap_or_else(|e| Err(RecordingError::CaptureError(format!("artifact delivery failed: {}", e))));
            let _ = events.send(SessionEvent::Delivered(delivered));
        });
    }

    /// The sink finished with the artifact, or there was nothing to deliver
    fn finish_delivery(&mut self, delivered: RecordingResult<Option<ArtifactInfo>>) {
        if self.state != RecordingState::Stopping {
            return;
        }
        self.generation += 1;

        match delivered {
            Ok(info) => {
                self.elapsed_tx.send_replace(0);
                self.set_state(Transition::Finalized);
                if let Some(info) = &info {
                    tracing::info!("Recording saved as {} ({} bytes)", info.file_name, info.size_bytes);
                    self.emit(RecordingEvent::Finished { artifact: info.clone() });
                }
                if let Some(waiter) = self.stop_waiter.take() {
                    let _ = waiter.send(Ok(info));
                }
            }
            Err(e) => {
                self.report_failure(&e);
                if let Some(waiter) = self.stop_waiter.take() {
                    let _ = waiter.send(Err(e));
                }
            }
        }
    }

    /// Abort the active session
    fn fail(&mut self, error: RecordingError) {
        if let Some(mut session) = self.session.take() {
            session.teardown();
        }
        self.generation += 1;
        self.report_failure(&error);
        if let Some(waiter) = self.stop_waiter.take() {
            let _ = waiter.send(Err(error));
        }
    }

    /// Move through `Error` back to `Idle` and tell the UI
    fn report_failure(&mut self, error: &RecordingError) {
        tracing::error!("Recording failed: {}", error);
        self.elapsed_tx.send_replace(0);
        if self.state.apply(Transition::Fail).is_ok() {
            self.set_state(Transition::Fail);
        }
        if self.state == RecordingState::Error {
            self.set_state(Transition::Reset);
        }
        self.emit(RecordingEvent::Error {
            message: error.to_string(),
            user_cancelled: error.is_user_cancellation(),
        });
    }

    /// Apply a transition already known to be valid
    fn set_state(&mut self, transition: Transition) {
        match self.state.apply(transition) {
            Ok(next) => self.force_state(next),
            Err(e) => tracing::error!("Ignoring invalid transition: {}", e),
        }
    }

    fn force_state(&mut self, next: RecordingState) {
        tracing::info!("Recording state {} -> {}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(RecordingEvent::StateChanged { state: next });
    }

    fn emit(&self, event: RecordingEvent) {
        let _ = self.events.send(event);
    }
}
