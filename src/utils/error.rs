//! Error types and handling
//!
//! What the UI layer sees when an operation fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recorder::error::RecordingError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Webcam error: {0}")]
    Webcam(String),
}

impl AppError {
    /// The user dismissed a permission dialog
    pub fn is_user_cancellation(&self) -> bool {
        matches!(self, AppError::Recording(e) if e.is_user_cancellation())
    }
}

/// Error response for frontend
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Recording(e) => recording_code(e),
            AppError::Webcam(_) => "WEBCAM_ERROR",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

fn recording_code(error: &RecordingError) -> &'static str {
    match error {
        RecordingError::PermissionDenied(_) => "PERMISSION_DENIED",
        RecordingError::UserCancelled(_) | RecordingError::Cancelled => "USER_CANCELLED",
        RecordingError::Unsupported(_) => "UNSUPPORTED",
        RecordingError::Unready(_) => "UNREADY",
        RecordingError::AlreadyRecording => "ALREADY_RECORDING",
        RecordingError::NotRecording => "NOT_RECORDING",
        RecordingError::InvalidTransition { .. } => "INVALID_TRANSITION",
        RecordingError::CaptureError(_) => "CAPTURE_ERROR",
        RecordingError::EncodingError(_) => "ENCODING_ERROR",
        RecordingError::Io(_) => "IO_ERROR",
        RecordingError::ConfigurationError(_) => "CONFIGURATION_ERROR",
    }
}

/// How a failed operation should be shown
///
/// Dismissing a permission dialog is not an error from the user's point of
/// view, so it is reported without an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UiNotice {
    Silent { reason: String },
    Surfaced { code: String, message: String },
}

impl From<AppError> for UiNotice {
    fn from(error: AppError) -> Self {
        if error.is_user_cancellation() {
            tracing::info!("Operation cancelled by the user: {}", error);
            return UiNotice::Silent {
                reason: error.to_string(),
            };
        }
        tracing::error!("Operation failed: {}", error);
        let response = ErrorResponse::from(error);
        UiNotice::Surfaced {
            code: response.code,
            message: response.message,
        }
    }
}

impl From<RecordingError> for UiNotice {
    fn from(error: RecordingError) -> Self {
        AppError::from(error).into()
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_cancellation_is_silent() {
        let notice = UiNotice::from(RecordingError::UserCancelled("dismissed".to_string()));
        assert!(matches!(notice, UiNotice::Silent { .. }));
    }

    #[test]
    fn test_unsupported_is_surfaced_with_code() {
        let notice = UiNotice::from(RecordingError::Unsupported("no codec".to_string()));
        match notice {
            UiNotice::Surfaced { code, message } => {
                assert_eq!(code, "UNSUPPORTED");
                assert!(message.contains("no codec"));
            }
            other => panic!("expected surfaced notice, got {:?}", other),
        }
    }

    #[test]
    fn test_recording_io_error_code() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let response = ErrorResponse::from(AppError::from(RecordingError::from(io)));
        assert_eq!(response.code, "IO_ERROR");
    }

    #[test]
    fn test_webcam_error_response() {
        let response = ErrorResponse::from(AppError::Webcam("could not access webcam".to_string()));
        assert_eq!(response.code, "WEBCAM_ERROR");
        assert_eq!(response.message, "Webcam error: could not access webcam");
    }
}
