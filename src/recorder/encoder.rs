//! Encoder interface
//!
//! Mirrors a media recorder: started with a timeslice, it delivers encoded
//! chunks in order and reports completion only after the last chunk.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use super::assembler::{AssembledStream, EncodingChoice};
use super::error::RecordingResult;

/// Events an encoder emits, in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    /// A chunk of encoded output
    DataAvailable(Vec<u8>),
    /// Finalized; no further events follow
    Stopped,
    /// Unrecoverable failure
    Error(String),
}

/// Encoder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    Inactive,
    Recording,
    Paused,
}

/// Creates encoders and answers codec support queries
pub trait EncoderBackend: Send + Sync {
    fn name(&self) -> &str;

    fn is_type_supported(&self, mime_type: &str) -> bool;

    fn create(&self, stream: AssembledStream, choice: &EncodingChoice) -> RecordingResult<Box<dyn MediaEncoder>>;
}

/// A single encoding run
pub trait MediaEncoder: Send {
    /// Begin encoding, delivering a chunk every `timeslice`
    fn start(&mut self, timeslice: Duration, events: mpsc::UnboundedSender<EncoderEvent>) -> RecordingResult<()>;

    /// Stop consuming input without releasing anything
    fn pause(&mut self) -> RecordingResult<()>;

    fn resume(&mut self) -> RecordingResult<()>;

    /// Finalize. Remaining output arrives as one last `DataAvailable`
    /// followed by `Stopped`. A no-op when already inactive.
    fn stop(&mut self) -> RecordingResult<()>;

    fn state(&self) -> EncoderState;
}

/// Shared pause/resume/stop bookkeeping for encoder implementations.
///
/// The encoding task watches the receiver side and drops input while paused.
#[derive(Debug)]
pub struct StateControl {
    state: tokio::sync::watch::Sender<EncoderState>,
}

impl StateControl {
    pub fn new() -> Self {
        let (state, _) = tokio::sync::watch::channel(EncoderState::Inactive);
        Self { state }
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<EncoderState> {
        self.state.subscribe()
    }

    pub fn get(&self) -> EncoderState {
        *self.state.borrow()
    }

    pub fn begin(&self) -> RecordingResult<()> {
        self.transition(EncoderState::Inactive, EncoderState::Recording, "start")
    }

    pub fn pause(&self) -> RecordingResult<()> {
        self.transition(EncoderState::Recording, EncoderState::Paused, "pause")
    }

    pub fn resume(&self) -> RecordingResult<()> {
        self.transition(EncoderState::Paused, EncoderState::Recording, "resume")
    }

    /// Returns whether the encoder was running
    pub fn finish(&self) -> bool {
        self.state.send_replace(EncoderState::Inactive) != EncoderState::Inactive
    }

    fn transition(&self, from: EncoderState, to: EncoderState, action: &str) -> RecordingResult<()> {
        let current = self.get();
        if current != from {
            return Err(super::error::RecordingError::EncodingError(format!(
                "cannot {} encoder in state {:?}",
                action, current
            )));
        }
        self.state.send_replace(to);
        Ok(())
    }
}

impl Default for StateControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_control_transitions() {
        let control = StateControl::new();
        assert!(control.pause().is_err());
        control.begin().unwrap();
        control.pause().unwrap();
        assert_eq!(control.get(), EncoderState::Paused);
        assert!(control.pause().is_err());
        control.resume().unwrap();
        assert!(control.finish());
        assert!(!control.finish());
        assert_eq!(control.get(), EncoderState::Inactive);
    }
}
