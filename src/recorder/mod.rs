//! Recording system module
//!
//! - `RecordingController`: the actor owning the session state machine
//! - `CaptureSession`: resources held by one recording
//! - encoder backends (in-memory and ffmpeg) and artifact sinks

pub mod artifact;
pub mod assembler;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod memory_encoder;
pub mod session;
pub mod state;

pub use artifact::{ArtifactInfo, ArtifactKind, ArtifactSink, DownloadDir, MemorySink, RecordingArtifact};
pub use controller::{RecordingController, RecordingEvent};
pub use encoder::{EncoderBackend, EncoderEvent, MediaEncoder};
pub use error::{RecordingError, RecordingResult};
pub use ffmpeg::FfmpegEncoderBackend;
pub use memory_encoder::MemoryEncoderBackend;
pub use session::CaptureSession;
pub use state::{RecordingOptions, RecordingState};
