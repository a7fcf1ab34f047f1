//! Produced artifacts
//!
//! A finished recording or screenshot, and the sinks that "download" it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::assembler::EncodingChoice;
use super::error::RecordingResult;

/// What an artifact contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Recording,
    Screenshot,
}

impl ArtifactKind {
    fn label(&self) -> &'static str {
        match self {
            ArtifactKind::Recording => "recording",
            ArtifactKind::Screenshot => "screenshot",
        }
    }
}

/// A complete, downloadable file
#[derive(Debug, Clone)]
pub struct RecordingArtifact {
    pub kind: ArtifactKind,
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    /// Active recording time, for recordings
    pub duration: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl RecordingArtifact {
    /// Join encoded chunks, in arrival order, into one recording file
    pub fn from_chunks(
        chunks: Vec<Vec<u8>>,
        choice: &EncodingChoice,
        prefix: &str,
        duration: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let total: usize = chunks.iter().map(Vec::len).sum();
        let mut data = Vec::with_capacity(total);
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }

        Self {
            kind: ArtifactKind::Recording,
            file_name: artifact_file_name(prefix, ArtifactKind::Recording, choice.extension(), created_at),
            mime_type: choice.container().to_string(),
            data,
            duration: Some(duration),
            created_at,
        }
    }

    /// A PNG still image
    pub fn screenshot(png: Vec<u8>, prefix: &str) -> Self {
        let created_at = Utc::now();
        Self {
            kind: ArtifactKind::Screenshot,
            file_name: artifact_file_name(prefix, ArtifactKind::Screenshot, "png", created_at),
            mime_type: "image/png".to_string(),
            data: png,
            duration: None,
            created_at,
        }
    }

    pub fn info(&self, location: Option<PathBuf>) -> ArtifactInfo {
        ArtifactInfo {
            kind: self.kind,
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            size_bytes: self.data.len() as u64,
            duration_ms: self.duration.map(|d| d.as_millis() as u64),
            location,
        }
    }
}

/// `{prefix}-{kind}-{unix millis}.{ext}`
pub fn artifact_file_name(prefix: &str, kind: ArtifactKind, extension: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}-{}.{}", prefix, kind.label(), at.timestamp_millis(), extension)
}

/// Summary of a delivered artifact for the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactInfo {
    pub kind: ArtifactKind,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub duration_ms: Option<u64>,
    /// Where the sink put it, if it wrote a file
    pub location: Option<PathBuf>,
}

/// Receives each finished artifact exactly once
pub trait ArtifactSink: Send + Sync {
    fn deliver(&self, artifact: &RecordingArtifact) -> RecordingResult<Option<PathBuf>>;
}

/// Writes artifacts into a directory
pub struct DownloadDir {
    dir: PathBuf,
}

impl DownloadDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactSink for DownloadDir {
    fn deliver(&self, artifact: &RecordingArtifact) -> RecordingResult<Option<PathBuf>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(&artifact.file_name);
        fs::write(&path, &artifact.data)?;
        tracing::info!(
            "Saved {} ({} bytes) to {:?}",
            artifact.file_name,
            artifact.data.len(),
            path
        );
        Ok(Some(path))
    }
}

/// Keeps artifacts in memory
#[derive(Default)]
pub struct MemorySink {
    artifacts: Mutex<Vec<RecordingArtifact>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<RecordingArtifact> {
        self.artifacts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.artifacts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactSink for MemorySink {
    fn deliver(&self, artifact: &RecordingArtifact) -> RecordingResult<Option<PathBuf>> {
        self.artifacts.lock().push(artifact.clone());
        Ok(None)
    }
}
