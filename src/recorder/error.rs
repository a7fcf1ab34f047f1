//! Recording error types
//!
//! A single error type shared by the capture seams, the encoders and the
//! session controller.

use thiserror::Error;

use super::state::RecordingState;

/// Errors that can occur during capture or recording
#[derive(Error, Debug)]
pub enum RecordingError {
    /// A permission dialog was dismissed or the grant was refused.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The user backed out of the display picker.
    #[error("User cancelled: {0}")]
    UserCancelled(String),

    /// The environment lacks a capability the operation needs.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A required resource (target element, video metadata) is not ready.
    #[error("Not ready: {0}")]
    Unready(String),

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Cannot {action} while {from}")]
    InvalidTransition {
        from: RecordingState,
        action: &'static str,
    },

    #[error("Capture error: {0}")]
    CaptureError(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The operation was superseded by a cancel or stop request.
    #[error("Cancelled")]
    Cancelled,
}

impl RecordingError {
    /// Whether this error is the user backing out rather than a fault.
    ///
    /// The UI treats these silently: no alert, just a return to idle.
    pub fn is_user_cancellation(&self) -> bool {
        matches!(
            self,
            RecordingError::UserCancelled(_) | RecordingError::Cancelled
        )
    }
}

/// Result type for recording operations
pub type RecordingResult<T> = Result<T, RecordingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_cancellation_classification() {
        assert!(RecordingError::UserCancelled("picker closed".into()).is_user_cancellation());
        assert!(RecordingError::Cancelled.is_user_cancellation());
        assert!(!RecordingError::PermissionDenied("mic".into()).is_user_cancellation());
        assert!(!RecordingError::Unsupported("codec".into()).is_user_cancellation());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = RecordingError::InvalidTransition {
            from: RecordingState::Idle,
            action: "pause",
        };
        assert_eq!(err.to_string(), "Cannot pause while idle");
    }
}
