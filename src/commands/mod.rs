//! UI-facing command handlers
//!
//! The entry points a frontend calls. Failures come back as [`UiNotice`]s so
//! a dismissed permission dialog never shows up as an alert.
//!
//! [`UiNotice`]: crate::utils::error::UiNotice

pub mod recording;

pub use recording::CaptureOrchestrator;
