//! Stream assembly
//!
//! Joins the composited video track with the mixed audio track and picks the
//! encoding format the session will use.

use serde::{Deserialize, Serialize};

use super::encoder::EncoderBackend;
use super::error::{RecordingError, RecordingResult};
use crate::capture::traits::{AudioTrack, VideoTrack};

/// Container/codec and bitrate for a session; fixed once chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingChoice {
    pub mime_type: String,
    pub video_bits_per_second: u64,
}

impl EncodingChoice {
    pub fn new(mime_type: impl Into<String>, video_bits_per_second: u64) -> Self {
        Self {
            mime_type: mime_type.into(),
            video_bits_per_second,
        }
    }

    /// The container part, e.g. `video/webm` for `video/webm;codecs=vp9`
    pub fn container(&self) -> &str {
        self.mime_type.split(';').next().unwrap_or_default().trim()
    }

    /// Codec list from the `codecs=` parameter, if any
    pub fn codecs(&self) -> Option<&str> {
        self.mime_type
            .split(';')
            .skip(1)
            .map(str::trim)
            .find_map(|p| p.strip_prefix("codecs="))
            .map(|c| c.trim_matches('"'))
    }

    /// File extension for the container
    pub fn extension(&self) -> &str {
        match self.container() {
            "video/webm" => "webm",
            "video/mp4" => "mp4",
            "video/x-matroska" => "mkv",
            other => other.rsplit('/').next().unwrap_or("bin"),
        }
    }
}

/// Pick the first candidate the encoder backend supports.
///
/// Candidates are in priority order, most efficient codec first.
pub fn select_encoding(
    candidates: &[String],
    backend: &dyn EncoderBackend,
    video_bits_per_second: u64,
) -> RecordingResult<EncodingChoice> {
    let mime_type = candidates
        .iter()
        .find(|mime| backend.is_type_supported(mime))
        .ok_or_else(|| {
            RecordingError::Unsupported(format!(
                "No supported video format found (tried {})",
                candidates.join(", ")
            ))
        })?;

    tracing::debug!("Selected encoding {} via {}", mime_type, backend.name());
    Ok(EncodingChoice::new(mime_type.clone(), video_bits_per_second))
}

/// The one stream handed to the encoder
#[derive(Debug)]
pub struct AssembledStream {
    pub video: VideoTrack,
    pub audio: Option<AudioTrack>,
}

impl AssembledStream {
    pub fn new(video: VideoTrack, audio: Option<AudioTrack>) -> Self {
        Self { video, audio }
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MIME_CANDIDATES;
    use crate::recorder::memory_encoder::MemoryEncoderBackend;

    fn candidates() -> Vec<String> {
        DEFAULT_MIME_CANDIDATES.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_choice_parts() {
        let choice = EncodingChoice::new("video/webm;codecs=vp9", 50_000_000);
        assert_eq!(choice.container(), "video/webm");
        assert_eq!(choice.codecs(), Some("vp9"));
        assert_eq!(choice.extension(), "webm");

        let mp4 = EncodingChoice::new("video/mp4", 1);
        assert_eq!(mp4.codecs(), None);
        assert_eq!(mp4.extension(), "mp4");
    }

    #[test]
    fn test_prefers_first_supported() {
        let backend = MemoryEncoderBackend::new(["video/webm;codecs=vp8", "video/mp4"]);
        let choice = select_encoding(&candidates(), &backend, 50_000_000).unwrap();
        assert_eq!(choice.mime_type, "video/webm;codecs=vp8");
        assert_eq!(choice.video_bits_per_second, 50_000_000);
    }

    #[test]
    fn test_falls_back_to_mp4() {
        let backend = MemoryEncoderBackend::new(["video/mp4"]);
        let choice = select_encoding(&candidates(), &backend, 1).unwrap();
        assert_eq!(choice.extension(), "mp4");
    }

    #[test]
    fn test_none_supported_is_unsupported() {
        let backend = MemoryEncoderBackend::new(Vec::<String>::new());
        assert!(matches!(
            select_encoding(&candidates(), &backend, 1),
            Err(RecordingError::Unsupported(_))
        ));
    }
}
