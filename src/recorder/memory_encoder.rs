//! In-process encoder
//!
//! Serializes frame and audio summaries into a simple record stream. It
//! needs no external tools, which makes it the fallback for hosts without
//! FFmpeg and the encoder the test suite runs against.
//!
//! Layout: `MOCK`, a u16 mime length and the mime bytes, then records.
//! A video record is `V` + timestamp (f64) + width + height + checksum (u32).
//! An audio record is `A` + frame count (u32) + channels (u16) + peak (f32).
//! All integers are little endian.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::assembler::{AssembledStream, EncodingChoice};
use super::encoder::{EncoderBackend, EncoderEvent, EncoderState, MediaEncoder, StateControl};
use super::error::{RecordingError, RecordingResult};
use crate::capture::traits::{AudioBuffer, AudioTrack, VideoFrame};

const MAGIC: &[u8; 4] = b"MOCK";

/// Backend producing [`MemoryEncoder`]s for a fixed set of mime types
pub struct MemoryEncoderBackend {
    supported: Vec<String>,
    fail_after_chunks: Option<usize>,
    created: Arc<AtomicUsize>,
}

impl MemoryEncoderBackend {
    pub fn new(supported: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            supported: supported.into_iter().map(Into::into).collect(),
            fail_after_chunks: None,
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Supports every webm candidate but not mp4
    pub fn webm() -> Self {
        Self::new(["video/webm;codecs=vp9", "video/webm;codecs=vp8", "video/webm"])
    }

    /// Report an encoder error after emitting `chunks` chunks
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    /// How many encoders this backend has created
    pub fn encoders_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EncoderBackend for MemoryEncoderBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.iter().any(|s| s.eq_ignore_ascii_case(mime_type.trim()))
    }

    fn create(&self, stream: AssembledStream, choice: &EncodingChoice) -> RecordingResult<Box<dyn MediaEncoder>> {
        if !self.is_type_supported(&choice.mime_type) {
            return Err(RecordingError::Unsupported(format!(
                "{} cannot encode {}",
                self.name(),
                choice.mime_type
            )));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryEncoder {
            stream: Some(stream),
            choice: choice.clone(),
            control: StateControl::new(),
            fail_after_chunks: self.fail_after_chunks,
            task: None,
        }))
    }
}

/// One encoding run of the in-process encoder
pub struct MemoryEncoder {
    stream: Option<AssembledStream>,
    choice: EncodingChoice,
    control: StateControl,
    fail_after_chunks: Option<usize>,
    task: Option<JoinHandle<()>>,
}

impl MediaEncoder for MemoryEncoder {
    fn start(&mut self, timeslice: Duration, events: mpsc::UnboundedSender<EncoderEvent>) -> RecordingResult<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| RecordingError::EncodingError("encoder already started".to_string()))?;
        self.control.begin()?;

        let header = header(&self.choice.mime_type);
        let state = self.control.subscribe();
        let fail_after = self.fail_after_chunks;
        tracing::debug!(
            "Memory encoder started ({}, audio: {})",
            self.choice.mime_type,
            stream.has_audio()
        );
        self.task = Some(tokio::spawn(run(stream, state, timeslice, events, header, fail_after)));
        Ok(())
    }

    fn pause(&mut self) -> RecordingResult<()> {
        self.control.pause()
    }

    fn resume(&mut self) -> RecordingResult<()> {
        self.control.resume()
    }

    fn stop(&mut self) -> RecordingResult<()> {
        if self.control.finish() {
            tracing::debug!("Memory encoder stopping");
        }
        Ok(())
    }

    fn state(&self) -> EncoderState {
        self.control.get()
    }
}

impl Drop for MemoryEncoder {
    fn drop(&mut self) {
        // Dropped without stop(): abandon the output
        if self.control.finish() {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }
}

async fn run(
    stream: AssembledStream,
    mut state: watch::Receiver<EncoderState>,
    timeslice: Duration,
    events: mpsc::UnboundedSender<EncoderEvent>,
    header: Vec<u8>,
    fail_after: Option<usize>,
) {
    let AssembledStream { mut video, mut audio } = stream;
    let mut pending = header;
    let mut emitted = 0usize;
    let mut video_open = true;
    let mut audio_open = audio.is_some();

    let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == EncoderState::Inactive {
                    break;
                }
            }
            frame = video.frames.recv(), if video_open => match frame {
                Some(frame) if is_recording(&state) => write_video(&mut pending, &frame),
                Some(_) => {}
                None => video_open = false,
            },
            buffer = next_audio(&mut audio), if audio_open => match buffer {
                Some(buffer) if is_recording(&state) => write_audio(&mut pending, &buffer),
                Some(_) => {}
                None => audio_open = false,
            },
            _ = ticker.tick() => {
                if is_recording(&state) && !pending.is_empty() {
                    let chunk = std::mem::take(&mut pending);
                    if events.send(EncoderEvent::DataAvailable(chunk)).is_err() {
                        return;
                    }
                    emitted += 1;
                    if fail_after.is_some_and(|n| emitted >= n) {
                        let _ = events.send(EncoderEvent::Error("encoder failure".to_string()));
                        return;
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = events.send(EncoderEvent::DataAvailable(pending));
    }
    let _ = events.send(EncoderEvent::Stopped);
}

fn is_recording(state: &watch::Receiver<EncoderState>) -> bool {
    *state.borrow() == EncoderState::Recording
}

async fn next_audio(track: &mut Option<AudioTrack>) -> Option<AudioBuffer> {
    match track {
        Some(track) => track.buffers.recv().await,
        None => std::future::pending().await,
    }
}

fn header(mime_type: &str) -> Vec<u8> {
    let mime = mime_type.as_bytes();
    let mut out = Vec::with_capacity(6 + mime.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(mime.len() as u16).to_le_bytes());
    out.extend_from_slice(mime);
    out
}

fn write_video(out: &mut Vec<u8>, frame: &VideoFrame) {
    let checksum = frame
        .data
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(*b)));
    out.push(b'V');
    out.extend_from_slice(&frame.timestamp_ms.to_le_bytes());
    out.extend_from_slice(&frame.width.to_le_bytes());
    out.extend_from_slice(&frame.height.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
}

fn write_audio(out: &mut Vec<u8>, buffer: &AudioBuffer) {
    let peak = buffer.samples.iter().fold(0f32, |acc, s| acc.max(s.abs()));
    out.push(b'A');
    out.extend_from_slice(&(buffer.frames() as u32).to_le_bytes());
    out.extend_from_slice(&buffer.format.channels.to_le_bytes());
    out.extend_from_slice(&peak.to_le_bytes());
}

/// A decoded record from a memory encoder recording
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Video {
        timestamp_ms: f64,
        width: u32,
        height: u32,
        checksum: u32,
    },
    Audio {
        frames: u32,
        channels: u16,
        peak: f32,
    },
}

/// Decode a complete memory encoder recording into its mime type and records
pub fn parse_records(data: &[u8]) -> RecordingResult<(String, Vec<Record>)> {
    let mut reader = Reader { data, pos: 0 };
    if reader.take(4)? != MAGIC {
        return Err(RecordingError::EncodingError("not a memory recording".to_string()));
    }
    let mime_len = u16::from_le_bytes(reader.array()?) as usize;
    let mime = String::from_utf8_lossy(reader.take(mime_len)?).into_owned();

    let mut records = Vec::new();
    while reader.pos < data.len() {
        let tag = reader.take(1)?[0];
        let record = match tag {
            b'V' => Record::Video {
                timestamp_ms: f64::from_le_bytes(reader.array()?),
                width: u32::from_le_bytes(reader.array()?),
                height: u32::from_le_bytes(reader.array()?),
                checksum: u32::from_le_bytes(reader.array()?),
            },
            b'A' => Record::Audio {
                frames: u32::from_le_bytes(reader.array()?),
                channels: u16::from_le_bytes(reader.array()?),
                peak: f32::from_le_bytes(reader.array()?),
            },
            other => {
                return Err(RecordingError::EncodingError(format!(
                    "unknown record tag {:#x} at {}",
                    other,
                    reader.pos - 1
                )))
            }
        };
        records.push(record);
    }
    Ok((mime, records))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> RecordingResult<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| RecordingError::EncodingError("truncated memory recording".to_string()))?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> RecordingResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::{AudioFormat, AudioSourceKind, PixelSize, VideoTrack};

    struct Inputs {
        frames: mpsc::Sender<VideoFrame>,
        audio: mpsc::Sender<AudioBuffer>,
    }

    fn stream() -> (AssembledStream, Inputs) {
        let (frames_tx, frames) = mpsc::channel(64);
        let (audio_tx, buffers) = mpsc::channel(64);
        let format = AudioFormat {
            sample_rate: 48_000,
            channels: 2,
        };
        let video = VideoTrack {
            size: PixelSize::new(4, 4),
            frame_rate: 30,
            frames,
        };
        let audio = AudioTrack {
            kind: AudioSourceKind::Mixed,
            label: "mixed".to_string(),
            format,
            buffers,
        };
        (
            AssembledStream::new(video, Some(audio)),
            Inputs {
                frames: frames_tx,
                audio: audio_tx,
            },
        )
    }

    fn frame(ts: f64) -> VideoFrame {
        let mut frame = VideoFrame::solid(4, 4, [10, 20, 30, 255]);
        frame.timestamp_ms = ts;
        frame
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<EncoderEvent>) -> (Vec<u8>, usize) {
        let mut data = Vec::new();
        let mut chunks = 0;
        while let Some(event) = rx.recv().await {
            match event {
                EncoderEvent::DataAvailable(chunk) => {
                    chunks += 1;
                    data.extend(chunk);
                }
                EncoderEvent::Stopped => return (data, chunks),
                EncoderEvent::Error(e) => panic!("unexpected error {e}"),
            }
        }
        panic!("encoder closed without Stopped");
    }

    #[test]
    fn test_support_is_exact_and_case_insensitive() {
        let backend = MemoryEncoderBackend::webm();
        assert!(backend.is_type_supported("video/webm;codecs=vp9"));
        assert!(backend.is_type_supported("VIDEO/WEBM"));
        assert!(!backend.is_type_supported("video/mp4"));
        assert!(!backend.is_type_supported("video/webm;codecs=av1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_video_and_audio_then_stops() {
        let backend = MemoryEncoderBackend::webm();
        let choice = EncodingChoice::new("video/webm;codecs=vp9", 1);
        let (stream, inputs) = stream();
        let mut encoder = backend.create(stream, &choice).unwrap();
        assert_eq!(backend.encoders_created(), 1);

        let (tx, rx) = mpsc::unbounded_channel();
        encoder.start(Duration::from_secs(1), tx).unwrap();
        assert_eq!(encoder.state(), EncoderState::Recording);

        inputs.frames.send(frame(0.0)).await.unwrap();
        inputs
            .audio
            .send(AudioBuffer {
                format: AudioFormat {
                    sample_rate: 48_000,
                    channels: 2,
                },
                samples: vec![0.5, -0.75, 0.25, 0.0],
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        inputs.frames.send(frame(1500.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        encoder.stop().unwrap();
        assert_eq!(encoder.state(), EncoderState::Inactive);
        let (data, chunks) = collect(rx).await;
        assert_eq!(chunks, 2);

        let (mime, records) = parse_records(&data).unwrap();
        assert_eq!(mime, "video/webm;codecs=vp9");
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], Record::Video { width: 4, height: 4, .. }));
        assert_eq!(
            records[1],
            Record::Audio {
                frames: 2,
                channels: 2,
                peak: 0.75
            }
        );
        assert!(matches!(records[2], Record::Video { timestamp_ms, .. } if timestamp_ms == 1500.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_input_is_dropped() {
        let backend = MemoryEncoderBackend::webm();
        let choice = EncodingChoice::new("video/webm", 1);
        let (stream, inputs) = stream();
        let mut encoder = backend.create(stream, &choice).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        encoder.start(Duration::from_secs(1), tx).unwrap();

        inputs.frames.send(frame(1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        encoder.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        inputs.frames.send(frame(2.0)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        encoder.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        inputs.frames.send(frame(3.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        encoder.stop().unwrap();

        let (data, _) = collect(rx).await;
        let (_, records) = parse_records(&data).unwrap();
        let stamps: Vec<f64> = records
            .iter()
            .filter_map(|r| match r {
                Record::Video { timestamp_ms, .. } => Some(*timestamp_ms),
                _ => None,
            })
            .collect();
        assert_eq!(stamps, vec![1.0, 3.0]);
    }

    #[tokio::test]
    async fn test_stop_when_inactive_is_noop() {
        let backend = MemoryEncoderBackend::webm();
        let (stream, _inputs) = stream();
        let mut encoder = backend.create(stream, &EncodingChoice::new("video/webm", 1)).unwrap();
        encoder.stop().unwrap();
        assert!(encoder.pause().is_err());
        assert_eq!(encoder.state(), EncoderState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reports_error() {
        let backend = MemoryEncoderBackend::webm().failing_after(1);
        let (stream, _inputs) = stream();
        let mut encoder = backend.create(stream, &EncodingChoice::new("video/webm", 1)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        encoder.start(Duration::from_millis(100), tx).unwrap();

        assert!(matches!(rx.recv().await, Some(EncoderEvent::DataAvailable(_))));
        assert!(matches!(rx.recv().await, Some(EncoderEvent::Error(_))));
    }

    #[test]
    fn test_rejects_truncated_data() {
        let mut data = header("video/webm");
        data.push(b'V');
        data.extend_from_slice(&[0, 1, 2]);
        assert!(parse_records(&data).is_err());
        assert!(parse_records(b"nope").is_err());
    }

    #[test]
    fn test_create_rejects_unsupported_choice() {
        let backend = MemoryEncoderBackend::new(["video/mp4"]);
        let (stream, _inputs) = stream();
        assert!(backend
            .create(stream, &EncodingChoice::new("video/webm", 1))
            .is_err());
        assert_eq!(backend.encoders_created(), 0);
    }
}
