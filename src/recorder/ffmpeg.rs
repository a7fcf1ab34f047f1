//! FFmpeg encoder
//!
//! Pipes composited RGBA frames into an `ffmpeg` child process over stdin and
//! streams the mixed audio to it over a loopback TCP connection. The muxed
//! container is read back from stdout and delivered in timeslice chunks.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::assembler::{AssembledStream, EncodingChoice};
use super::encoder::{EncoderBackend, EncoderEvent, EncoderState, MediaEncoder, StateControl};
use super::error::{RecordingError, RecordingResult};
use crate::capture::traits::{AudioTrack, VideoTrack};

/// How long ffmpeg gets to connect to the audio socket
const AUDIO_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Container and encoder names for one mime type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FfmpegTarget {
    pub format: &'static str,
    pub video_encoder: &'static str,
    pub audio_encoder: &'static str,
}

impl FfmpegTarget {
    /// Map a mime type onto ffmpeg muxer/encoder names
    pub fn for_mime(mime_type: &str) -> Option<Self> {
        let normalized = mime_type.to_ascii_lowercase().replace(' ', "");
        let (video_encoder, format, audio_encoder) = match normalized.as_str() {
            "video/webm;codecs=vp9" => ("libvpx-vp9", "webm", "libopus"),
            "video/webm;codecs=vp8" | "video/webm" => ("libvpx", "webm", "libopus"),
            "video/mp4" => ("libx264", "mp4", "aac"),
            _ => return None,
        };
        Some(Self {
            format,
            video_encoder,
            audio_encoder,
        })
    }
}

/// Parse the encoder names out of `ffmpeg -encoders` output
pub fn parse_encoder_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("------"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            (flags.len() == 6).then(|| name.to_string())
        })
        .collect()
}

/// Encoder backend driving the system `ffmpeg`
pub struct FfmpegEncoderBackend {
    binary: PathBuf,
    encoders: HashSet<String>,
}

impl FfmpegEncoderBackend {
    /// Locate `ffmpeg` on the PATH and read which encoders it was built with
    pub fn detect() -> RecordingResult<Self> {
        Self::with_binary("ffmpeg")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> RecordingResult<Self> {
        let binary = binary.into();
        let output = std::process::Command::new(&binary)
            .args(["-hide_banner", "-encoders"])
            .output()
            .map_err(|e| RecordingError::Unsupported(format!("FFmpeg not available: {}", e)))?;

        if !output.status.success() {
            return Err(RecordingError::Unsupported(format!(
                "ffmpeg -encoders failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let encoders = parse_encoder_list(&String::from_utf8_lossy(&output.stdout));
        tracing::info!("FFmpeg at {:?} reports {} encoders", binary, encoders.len());
        Ok(Self { binary, encoders })
    }

    /// Build a backend from an already known encoder list
    pub fn from_encoders(binary: impl Into<PathBuf>, encoders: HashSet<String>) -> Self {
        Self {
            binary: binary.into(),
            encoders,
        }
    }
}

impl EncoderBackend for FfmpegEncoderBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    /// Video support only; the audio encoder is checked once a stream
    /// actually carries audio
    fn is_type_supported(&self, mime_type: &str) -> bool {
        FfmpegTarget::for_mime(mime_type).is_some_and(|t| self.encoders.contains(t.video_encoder))
    }

    fn create(&self, stream: AssembledStream, choice: &EncodingChoice) -> RecordingResult<Box<dyn MediaEncoder>> {
        let target = FfmpegTarget::for_mime(&choice.mime_type)
            .filter(|_| self.is_type_supported(&choice.mime_type))
            .ok_or_else(|| {
                RecordingError::Unsupported(format!("ffmpeg cannot encode {}", choice.mime_type))
            })?;
        if stream.has_audio() && !self.encoders.contains(target.audio_encoder) {
            return Err(RecordingError::Unsupported(format!(
                "ffmpeg lacks the {} audio encoder for {}",
                target.audio_encoder, choice.mime_type
            )));
        }

        Ok(Box::new(FfmpegEncoder {
            binary: self.binary.clone(),
            target,
            bits_per_second: choice.video_bits_per_second,
            stream: Some(stream),
            control: StateControl::new(),
            task: None,
        }))
    }
}

/// One ffmpeg encoding run
pub struct FfmpegEncoder {
    binary: PathBuf,
    target: FfmpegTarget,
    bits_per_second: u64,
    stream: Option<AssembledStream>,
    control: StateControl,
    task: Option<JoinHandle<()>>,
}

impl FfmpegEncoder {
    fn args(&self, video: &VideoTrack, audio: Option<(&AudioTrack, u16)>) -> Vec<String> {
        let mut args = strings(&["-hide_banner", "-loglevel", "warning", "-f", "rawvideo", "-pixel_format", "rgba"]);
        args.push("-video_size".into());
        args.push(format!("{}x{}", video.size.width, video.size.height));
        args.push("-framerate".into());
        args.push(video.frame_rate.to_string());
        args.extend(strings(&["-i", "-"]));

        if let Some((track, port)) = audio {
            args.extend(strings(&["-f", "f32le", "-ar"]));
            args.push(track.format.sample_rate.to_string());
            args.push("-ac".into());
            args.push(track.format.channels.to_string());
            args.push("-i".into());
            args.push(format!("tcp://127.0.0.1:{}", port));
        }

        // yuv420p needs even dimensions
        args.extend(strings(&["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2", "-pix_fmt", "yuv420p", "-c:v"]));
        args.push(self.target.video_encoder.into());
        args.push("-b:v".into());
        args.push(self.bits_per_second.to_string());

        match self.target.video_encoder {
            "libvpx-vp9" | "libvpx" => args.extend(strings(&["-deadline", "realtime", "-cpu-used", "8"])),
            "libx264" => args.extend(strings(&["-preset", "veryfast"])),
            _ => {}
        }

        if audio.is_some() {
            args.push("-c:a".into());
            args.push(self.target.audio_encoder.into());
        }

        args.push("-f".into());
        args.push(self.target.format.into());
        if self.target.format == "mp4" {
            // Non-seekable output
            args.extend(strings(&["-movflags", "frag_keyframe+empty_moov"]));
        }
        args.push("pipe:1".into());
        args
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl MediaEncoder for FfmpegEncoder {
    fn start(&mut self, timeslice: Duration, events: mpsc::UnboundedSender<EncoderEvent>) -> RecordingResult<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| RecordingError::EncodingError("encoder already started".to_string()))?;

        // Bind before spawning so ffmpeg has somewhere to connect
        let listener = match &stream.audio {
            Some(_) => {
                let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
                std_listener.set_nonblocking(true)?;
                Some(TcpListener::from_std(std_listener)?)
            }
            None => None,
        };
        let port = match &listener {
            Some(l) => Some(l.local_addr()?.port()),
            None => None,
        };

        let args = self.args(&stream.video, stream.audio.as_ref().zip(port));
        tracing::info!("Starting ffmpeg: {:?} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecordingError::EncodingError(format!("Failed to start FFmpeg: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecordingError::EncodingError("Failed to open FFmpeg stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RecordingError::EncodingError("Failed to capture FFmpeg stdout".to_string()))?;
        let stderr = child.stderr.take();

        self.control.begin()?;

        let last_log = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = stderr {
            let last_log = last_log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("ffmpeg: {}", line);
                    *last_log.lock() = line;
                }
            });
        }

        let AssembledStream { video, audio } = stream;
        let video_writer = tokio::spawn(write_video(video, stdin, self.control.subscribe()));
        let audio_writer = match (audio, listener) {
            (Some(track), Some(listener)) => Some(tokio::spawn(write_audio(track, listener, self.control.subscribe()))),
            _ => None,
        };

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let state = self.control.subscribe();
        self.task = Some(tokio::spawn(async move {
            let outcome = collect_output(out_rx, state, timeslice, &events).await;
            let _ = video_writer.await;
            if let Some(writer) = audio_writer {
                let _ = writer.await;
            }

            let status = child.wait().await;
            let event = match (outcome, status) {
                (Output::Finished, Ok(status)) if status.success() => EncoderEvent::Stopped,
                (_, Ok(status)) => EncoderEvent::Error(format!(
                    "FFmpeg exited with {}: {}",
                    status,
                    last_log.lock().clone()
                )),
                (_, Err(e)) => EncoderEvent::Error(format!("FFmpeg wait failed: {}", e)),
            };
            let _ = events.send(event);
        }));

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
            tracing::debug!("Closing ffmpeg input");
        }
        Ok(())
    }

    fn state(&self) -> EncoderState {
        self.control.get()
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        // Dropped without stop(): abandon the output
        if self.control.finish() {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Output {
    /// stdout closed after we stopped feeding input
    Finished,
    /// stdout closed while still recording
    Died,
}

async fn collect_output(
    mut output: mpsc::Receiver<Vec<u8>>,
    mut state: watch::Receiver<EncoderState>,
    timeslice: Duration,
    events: &mpsc::UnboundedSender<EncoderEvent>,
) -> Output {
    let mut pending = Vec::new();
    let mut stopping = false;
    let mut ticker = interval_at(Instant::now() + timeslice, timeslice);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            changed = state.changed(), if !stopping => {
                if changed.is_err() || *state.borrow() == EncoderState::Inactive {
                    stopping = true;
                }
            }
            bytes = output.recv() => match bytes {
                Some(bytes) => pending.extend_from_slice(&bytes),
                None if stopping => break Output::Finished,
                None => break Output::Died,
            },
            _ = ticker.tick(), if !stopping => {
                // Held while paused, like the input
                if *state.borrow() == EncoderState::Recording && !pending.is_empty() {
                    let _ = events.send(EncoderEvent::DataAvailable(std::mem::take(&mut pending)));
                }
            }
        }
    };

    if !pending.is_empty() {
        let _ = events.send(EncoderEvent::DataAvailable(pending));
    }
    outcome
}

/// Feed frames to stdin until the encoder stops; dropping stdin ends the input
async fn write_video(mut video: VideoTrack, mut stdin: ChildStdin, mut state: watch::Receiver<EncoderState>) {
    let expected = video.size.width as usize * video.size.height as usize * 4;
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == EncoderState::Inactive {
                    break;
                }
            }
            frame = video.frames.recv() => {
                let Some(frame) = frame else { break };
                if *state.borrow() != EncoderState::Recording {
                    continue;
                }
                if frame.data.len() != expected {
                    tracing::warn!("Skipping {}x{} frame for {}x{} encoder",
                        frame.width, frame.height, video.size.width, video.size.height);
                    continue;
                }
                if let Err(e) = stdin.write_all(&frame.data).await {
                    tracing::warn!("FFmpeg stdin closed: {}", e);
                    break;
                }
            }
        }
    }
    let _ = stdin.shutdown().await;
}

async fn write_audio(mut track: AudioTrack, listener: TcpListener, mut state: watch::Receiver<EncoderState>) {
    let mut socket = match tokio::time::timeout(AUDIO_CONNECT_TIMEOUT, listener.accept()).await {
        Ok(Ok((socket, _))) => socket,
        Ok(Err(e)) => {
            tracing::warn!("FFmpeg audio connection failed: {}", e);
            return;
        }
        Err(_) => {
            tracing::warn!("FFmpeg never connected for audio");
            return;
        }
    };

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == EncoderState::Inactive {
                    break;
                }
            }
            buffer = track.buffers.recv() => {
                let Some(buffer) = buffer else { break };
                if *state.borrow() != EncoderState::Recording {
                    continue;
                }
                let bytes: Vec<u8> = buffer.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
                if let Err(e) = socket.write_all(&bytes).await {
                    tracing::warn!("FFmpeg audio socket closed: {}", e);
                    break;
                }
            }
        }
    }
    let _ = socket.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::traits::{AudioFormat, AudioSourceKind, PixelSize};

    const ENCODERS: &str = "\
Encoders:
 V..... = Video
 A..... = Audio
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D libvpx               libvpx VP8 (codec vp8)
 V....D libvpx-vp9           libvpx VP9 (codec vp9)
 A....D aac                  AAC (Advanced Audio Coding)
 A....D libopus              libopus Opus (codec opus)
";

    #[test]
    fn test_parse_encoder_list() {
        let encoders = parse_encoder_list(ENCODERS);
        assert_eq!(encoders.len(), 5);
        assert!(encoders.contains("libvpx-vp9"));
        assert!(encoders.contains("aac"));
        assert!(!encoders.contains("="));
    }

    #[test]
    fn test_mime_mapping() {
        let vp9 = FfmpegTarget::for_mime("video/webm; codecs=vp9").unwrap();
        assert_eq!(vp9.video_encoder, "libvpx-vp9");
        assert_eq!(vp9.format, "webm");
        assert_eq!(FfmpegTarget::for_mime("video/webm").unwrap().video_encoder, "libvpx");
        assert_eq!(FfmpegTarget::for_mime("video/mp4").unwrap().audio_encoder, "aac");
        assert!(FfmpegTarget::for_mime("video/ogg").is_none());
    }

    fn tracks(with_audio: bool) -> AssembledStream {
        let (_tx, frames) = mpsc::channel(1);
        let video = VideoTrack {
            size: PixelSize::new(64, 32),
            frame_rate: 30,
            frames,
        };
        let audio = with_audio.then(|| {
            let (_atx, buffers) = mpsc::channel(1);
            AudioTrack {
                kind: AudioSourceKind::Mixed,
                label: "mixed".into(),
                format: AudioFormat {
                    sample_rate: 48_000,
                    channels: 2,
                },
                buffers,
            }
        });
        AssembledStream::new(video, audio)
    }

    #[test]
    fn test_audio_encoder_only_needed_with_audio() {
        let no_opus: HashSet<String> = ["libx264", "aac", "libvpx-vp9"].iter().map(|s| s.to_string()).collect();
        let backend = FfmpegEncoderBackend::from_encoders("ffmpeg", no_opus);
        assert!(backend.is_type_supported("video/mp4"));
        assert!(backend.is_type_supported("video/webm;codecs=vp9"));
        assert!(!backend.is_type_supported("video/webm;codecs=vp8"));

        let vp9 = EncodingChoice::new("video/webm;codecs=vp9", 1_000_000);
        assert!(backend.create(tracks(false), &vp9).is_ok());
        assert!(matches!(
            backend.create(tracks(true), &vp9),
            Err(RecordingError::Unsupported(_))
        ));

        let mp4 = EncodingChoice::new("video/mp4", 1_000_000);
        assert!(backend.create(tracks(true), &mp4).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_held_while_paused() {
        let control = StateControl::new();
        control.begin().unwrap();
        let (out_tx, out_rx) = mpsc::channel(8);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let state = control.subscribe();
        let collector = tokio::spawn(async move {
            collect_output(out_rx, state, Duration::from_secs(1), &events_tx).await
        });

        out_tx.send(vec![1, 2]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(events.try_recv().unwrap(), EncoderEvent::DataAvailable(vec![1, 2]));

        control.pause().unwrap();
        out_tx.send(vec![3]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(events.try_recv().is_err());

        control.resume().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(events.try_recv().unwrap(), EncoderEvent::DataAvailable(vec![3]));

        control.finish();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(out_tx);
        assert_eq!(collector.await.unwrap(), Output::Finished);
    }

    #[test]
    fn test_args_for_mp4_with_audio() {
        let (_tx, frames) = mpsc::channel(1);
        let (_atx, buffers) = mpsc::channel(1);
        let video = VideoTrack {
            size: PixelSize::new(1920, 1200),
            frame_rate: 30,
            frames,
        };
        let audio = AudioTrack {
            kind: AudioSourceKind::Mixed,
            label: "mixed".into(),
            format: AudioFormat {
                sample_rate: 48_000,
                channels: 2,
            },
            buffers,
        };
        let encoder = FfmpegEncoder {
            binary: "ffmpeg".into(),
            target: FfmpegTarget::for_mime("video/mp4").unwrap(),
            bits_per_second: 50_000_000,
            stream: None,
            control: StateControl::new(),
            task: None,
        };

        let args = encoder.args(&video, Some((&audio, 4000))).join(" ");
        assert!(args.contains("-video_size 1920x1200 -framerate 30 -i -"));
        assert!(args.contains("-f f32le -ar 48000 -ac 2 -i tcp://127.0.0.1:4000"));
        assert!(args.contains("-c:v libx264 -b:v 50000000"));
        assert!(args.contains("-c:a aac"));
        assert!(args.contains("-movflags frag_keyframe+empty_moov"));
        assert!(args.ends_with("pipe:1"));

        let silent = encoder.args(&video, None).join(" ");
        assert!(!silent.contains("tcp://"));
        assert!(!silent.contains("-c:a"));
    }
}
