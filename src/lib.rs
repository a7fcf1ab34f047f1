//! Mockup Capture - record and screenshot a live region of a desktop mockup.
//!
//! The library provides the capture pipeline (geometry calibration, frame
//! compositor, audio mixing), the recording controller and the command layer
//! a frontend calls into.

pub mod capture;
pub mod commands;
pub mod config;
pub mod recorder;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber
///
/// Honors `RUST_LOG`; defaults to debug output for this crate. Calling it
/// again is harmless.
pub fn init_logging() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mockup_capture=debug,mockup_capture_lib=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Starting Mockup Capture v{}", env!("CARGO_PKG_VERSION"));
    }
}
