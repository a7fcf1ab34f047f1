//! Shared helpers for the UI boundary

pub mod error;

pub use error::{AppError, AppResult, ErrorResponse, UiNotice};
