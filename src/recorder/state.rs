//! Recording state management
//!
//! Defines the recording state machine, the options a session is started
//! with, and the elapsed-time bookkeeping that survives pause/resume.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::error::{RecordingError, RecordingResult};
use crate::config::DeviceModel;

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    #[default]
    Idle,
    /// Waiting on permissions and stream acquisition
    Starting,
    /// Currently recording
    Recording,
    /// Recording is paused
    Paused,
    /// Encoder is flushing its last chunks
    Stopping,
    /// Unrecoverable failure; cleanup runs before returning to idle
    Error,
}

impl RecordingState {
    /// Whether a capture session exists in this state
    pub fn is_active(&self) -> bool {
        !matches!(self, RecordingState::Idle | RecordingState::Error)
    }

    /// Apply a transition, rejecting the ones the state machine forbids.
    pub fn apply(self, transition: Transition) -> RecordingResult<RecordingState> {
        use RecordingState::*;
        use Transition as T;

        let next = match (self, transition) {
            (Idle, T::Start) => Starting,
            (Starting, T::Started) => Recording,
            (Recording, T::Pause) => Paused,
            (Paused, T::Resume) => Recording,
            (Recording | Paused, T::Stop) => Stopping,
            (Stopping, T::Finalized) => Idle,
            (Starting | Recording | Paused | Stopping, T::Fail) => Error,
            (Error, T::Reset) => Idle,
            (Starting | Recording | Paused, T::Cancel) => Idle,
            (from, transition) => {
                return Err(match (from, transition) {
                    (Starting | Recording | Paused | Stopping, T::Start) => {
                        RecordingError::AlreadyRecording
                    }
                    (Idle, T::Pause | T::Resume | T::Stop) => RecordingError::NotRecording,
                    _ => RecordingError::InvalidTransition {
                        from,
                        action: transition.action(),
                    },
                })
            }
        };

        Ok(next)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::Idle => "idle",
            RecordingState::Starting => "starting",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Stopping => "stopping",
            RecordingState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Edges of the recording state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Started,
    Pause,
    Resume,
    Stop,
    Finalized,
    Fail,
    Reset,
    Cancel,
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Started => "finish starting",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Stop => "stop",
            Transition::Finalized => "finalize",
            Transition::Fail => "fail",
            Transition::Reset => "reset",
            Transition::Cancel => "cancel",
        }
    }
}

/// Options the UI passes when starting a recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOptions {
    /// Whether to mix in the tab/system audio shared with the display
    #[serde(default)]
    pub include_system_audio: bool,

    /// Whether to request and mix in the microphone
    #[serde(default)]
    pub include_microphone: bool,

    /// Mockup model whose logical size backs up the initial render surface
    #[serde(default)]
    pub model: DeviceModel,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            include_system_audio: false,
            include_microphone: false,
            model: DeviceModel::default(),
        }
    }
}

/// One uninterrupted stretch of recording
///
/// A new span is opened each time recording is resumed after a pause.
#[derive(Debug, Clone)]
pub struct RecordingSpan {
    /// Span index (0, 1, 2, ...)
    pub index: usize,

    /// When the span started
    pub started_at: Instant,

    /// Length of the span, set once it is closed
    pub duration: Option<Duration>,
}

/// Active-time clock for a session
///
/// Only running spans count, so pausing neither loses nor double counts the
/// partial second that was in progress.
#[derive(Debug, Clone, Default)]
pub struct ElapsedClock {
    spans: Vec<RecordingSpan>,
}

impl ElapsedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new span; no-op if one is already running
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let index = self.spans.len();
        self.spans.push(RecordingSpan {
            index,
            started_at: Instant::now(),
            duration: None,
        });
    }

    /// Close the running span; no-op if none is running
    pub fn pause(&mut self) {
        if let Some(span) = self.spans.last_mut() {
            if span.duration.is_none() {
                span.duration = Some(span.started_at.elapsed());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.spans.last().map_or(false, |s| s.duration.is_none())
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// Total active time across all spans
    pub fn elapsed(&self) -> Duration {
        self.spans
            .iter()
            .map(|s| s.duration.unwrap_or_else(|| s.started_at.elapsed()))
            .sum()
    }

    /// Whole seconds of active recording
    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed().as_secs()
    }

    /// Time until the next whole second of active recording
    pub fn until_next_second(&self) -> Duration {
        let nanos = self.elapsed().subsec_nanos();
        Duration::from_secs(1) - Duration::from_nanos(u64::from(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let s = RecordingState::Idle;
        let s = s.apply(Transition::Start).unwrap();
        assert_eq!(s, RecordingState::Starting);
        let s = s.apply(Transition::Started).unwrap();
        let s = s.apply(Transition::Pause).unwrap();
        assert_eq!(s, RecordingState::Paused);
        let s = s.apply(Transition::Resume).unwrap();
        let s = s.apply(Transition::Stop).unwrap();
        assert_eq!(s, RecordingState::Stopping);
        assert_eq!(s.apply(Transition::Finalized).unwrap(), RecordingState::Idle);
    }

    #[test]
    fn test_start_rejected_while_active() {
        for state in [
            RecordingState::Starting,
            RecordingState::Recording,
            RecordingState::Paused,
            RecordingState::Stopping,
        ] {
            assert!(matches!(
                state.apply(Transition::Start),
                Err(RecordingError::AlreadyRecording)
            ));
        }
    }

    #[test]
    fn test_pause_and_resume_guards() {
        assert!(matches!(
            RecordingState::Idle.apply(Transition::Pause),
            Err(RecordingError::NotRecording)
        ));
        assert!(RecordingState::Recording.apply(Transition::Resume).is_err());
        assert!(RecordingState::Paused.apply(Transition::Pause).is_err());
        assert!(RecordingState::Starting.apply(Transition::Stop).is_err());
    }

    #[test]
    fn test_error_feeds_back_to_idle() {
        let s = RecordingState::Starting.apply(Transition::Fail).unwrap();
        assert_eq!(s, RecordingState::Error);
        assert!(!s.is_active());
        assert_eq!(s.apply(Transition::Reset).unwrap(), RecordingState::Idle);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: RecordingOptions =
            serde_json::from_str(r#"{"includeMicrophone": true}"#).unwrap();
        assert!(options.include_microphone);
        assert!(!options.include_system_audio);
        assert_eq!(options.model.width, 1200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_carries_partial_second_across_pause() {
        let mut clock = ElapsedClock::new();
        clock.start();
        tokio::time::advance(Duration::from_millis(1600)).await;
        clock.pause();
        assert_eq!(clock.elapsed_secs(), 1);

        // Paused time is not counted
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.elapsed_secs(), 1);
        assert_eq!(clock.until_next_second(), Duration::from_millis(400));

        clock.start();
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(clock.elapsed_secs(), 2);
        assert_eq!(clock.span_count(), 2);
    }
}
