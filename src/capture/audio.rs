//! Audio graph
//!
//! Routes zero, one or two audio sources (shared tab/system audio and the
//! microphone) into a single mixing destination whose output is one track.

use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::traits::{AudioBuffer, AudioFormat, AudioSourceKind, AudioTrack, MediaDevices, MediaStreamHandle};

/// Mixer output block size in milliseconds
const BLOCK_MS: u32 = 10;

/// Longest a source may lag before it is treated as silent, in milliseconds
const MAX_LAG_MS: u32 = 200;

/// Which sources the session wants mixed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioSelection {
    pub system: bool,
    pub microphone: bool,
}

impl AudioSelection {
    pub fn any(&self) -> bool {
        self.system || self.microphone
    }
}

/// A source connected into the mixing destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRoute {
    pub kind: AudioSourceKind,
    pub label: String,
}

/// A live mixing graph and the resources it owns
pub struct AudioGraph {
    routes: Vec<AudioRoute>,
    output: Option<AudioTrack>,
    tasks: Vec<JoinHandle<()>>,
    microphone: Option<Box<dyn MediaStreamHandle>>,
    closed: bool,
}

impl AudioGraph {
    /// Build the graph for `selection`.
    ///
    /// System audio is connected when requested and actually shared. The
    /// microphone is requested separately; a refusal is logged and the graph
    /// continues without it. Returns `None` when no source ends up connected.
    pub async fn build(
        devices: &dyn MediaDevices,
        selection: AudioSelection,
        system_tracks: Vec<AudioTrack>,
        format: AudioFormat,
    ) -> Option<AudioGraph> {
        if !selection.any() {
            return None;
        }

        let mut inputs = Vec::new();
        let mut routes = Vec::new();
        let mut microphone = None;

        if selection.system {
            match system_tracks.into_iter().next() {
                Some(track) => {
                    routes.push(AudioRoute {
                        kind: AudioSourceKind::System,
                        label: track.label.clone(),
                    });
                    inputs.push(track);
                }
                None => tracing::warn!("System audio requested but the share carried no audio track"),
            }
        }

        if selection.microphone {
            match devices.get_microphone().await {
                Ok(mic) => {
                    routes.push(AudioRoute {
                        kind: AudioSourceKind::Microphone,
                        label: mic.track.label.clone(),
                    });
                    inputs.push(mic.track);
                    microphone = Some(mic.handle);
                }
                Err(e) => {
                    tracing::warn!("Microphone access denied, continuing without mic: {}", e);
                }
            }
        }

        if inputs.is_empty() {
            tracing::info!("No audio sources connected; recording video only");
            return None;
        }

        let (output, tasks) = spawn_mixer(inputs, format);
        tracing::info!(
            "Audio graph built with {} source(s): {:?}",
            routes.len(),
            routes.iter().map(|r| r.kind).collect::<Vec<_>>()
        );

        Some(AudioGraph {
            routes,
            output: Some(output),
            tasks,
            microphone,
            closed: false,
        })
    }

    pub fn routes(&self) -> &[AudioRoute] {
        &self.routes
    }

    pub fn has_route(&self, kind: AudioSourceKind) -> bool {
        self.routes.iter().any(|r| r.kind == kind)
    }

    /// Hand the mixed track to the stream assembler
    pub fn take_output(&mut self) -> Option<AudioTrack> {
        self.output.take()
    }

    /// Tear down the mixer and release the microphone. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(mic) = self.microphone.take() {
            mic.stop();
        }
        self.output = None;
        tracing::debug!("Audio graph closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.close();
    }
}

/// Spawn forwarders for every input plus the mixing task
fn spawn_mixer(inputs: Vec<AudioTrack>, format: AudioFormat) -> (AudioTrack, Vec<JoinHandle<()>>) {
    let (merged_tx, mut merged_rx) = mpsc::channel::<(usize, Option<AudioBuffer>)>(64);
    let (out_tx, out_rx) = mpsc::channel::<AudioBuffer>(64);
    let mut tasks = Vec::with_capacity(inputs.len() + 1);
    let input_count = inputs.len();

    for (index, mut track) in inputs.into_iter().enumerate() {
        let tx = merged_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(buffer) = track.buffers.recv().await {
                if tx.send((index, Some(buffer))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send((index, None)).await;
        }));
    }
    drop(merged_tx);

    tasks.push(tokio::spawn(async move {
        let mut mixer = Mixer::new(input_count, format);
        while let Some((index, buffer)) = merged_rx.recv().await {
            match buffer {
                Some(buffer) => mixer.push(index, &buffer),
                None => mixer.close_input(index),
            }

            while let Some(block) = mixer.pull() {
                if out_tx.send(block).await.is_err() {
                    return;
                }
            }

            if mixer.all_closed() {
                if let Some(tail) = mixer.drain() {
                    let _ = out_tx.send(tail).await;
                }
                return;
            }
        }
    }));

    let track = AudioTrack {
        kind: AudioSourceKind::Mixed,
        label: "mixing destination".to_string(),
        format,
        buffers: out_rx,
    };
    (track, tasks)
}

/// Sums queued input samples into output blocks
struct Mixer {
    format: AudioFormat,
    queues: Vec<VecDeque<f32>>,
    open: Vec<bool>,
    block_frames: usize,
    max_lag_frames: usize,
}

impl Mixer {
    fn new(inputs: usize, format: AudioFormat) -> Self {
        Self {
            format,
            queues: vec![VecDeque::new(); inputs],
            open: vec![true; inputs],
            block_frames: (format.sample_rate * BLOCK_MS / 1000) as usize,
            max_lag_frames: (format.sample_rate * MAX_LAG_MS / 1000) as usize,
        }
    }

    fn channels(&self) -> usize {
        usize::from(self.format.channels)
    }

    fn push(&mut self, index: usize, buffer: &AudioBuffer) {
        let converted = convert(buffer, self.format);
        self.queues[index].extend(converted);
    }

    fn close_input(&mut self, index: usize) {
        self.open[index] = false;
    }

    fn all_closed(&self) -> bool {
        self.open.iter().all(|open| !open)
    }

    fn queued_frames(&self, index: usize) -> usize {
        self.queues[index].len() / self.channels()
    }

    /// Next full block, once every open input has one queued or one input
    /// has run so far ahead that lagging inputs are treated as silent.
    fn pull(&mut self) -> Option<AudioBuffer> {
        let ready = (0..self.queues.len())
            .filter(|&i| self.open[i])
            .map(|i| self.queued_frames(i))
            .min()
            .unwrap_or(0);
        let ahead = (0..self.queues.len()).map(|i| self.queued_frames(i)).max().unwrap_or(0);

        if ready >= self.block_frames || ahead >= self.max_lag_frames.max(self.block_frames) {
            Some(self.mix(self.block_frames))
        } else {
            None
        }
    }

    /// Whatever is left once all inputs have ended
    fn drain(&mut self) -> Option<AudioBuffer> {
        let frames = (0..self.queues.len()).map(|i| self.queued_frames(i)).max().unwrap_or(0);
        (frames > 0).then(|| self.mix(frames))
    }

    fn mix(&mut self, frames: usize) -> AudioBuffer {
        let len = frames * self.channels();
        let mut samples = vec![0.0f32; len];
        for queue in &mut self.queues {
            let take = len.min(queue.len());
            for (out, sample) in samples.iter_mut().zip(queue.drain(..take)) {
                *out += sample;
            }
        }
        for s in &mut samples {
            *s = s.clamp(-1.0, 1.0);
        }
        AudioBuffer {
            format: self.format,
            samples,
        }
    }
}

/// Convert a buffer to the mixer's channel layout and sample rate
fn convert(buffer: &AudioBuffer, target: AudioFormat) -> Vec<f32> {
    let in_ch = usize::from(buffer.format.channels.max(1));
    let out_ch = usize::from(target.channels.max(1));
    let frames = buffer.samples.len() / in_ch;

    // Channel layout first
    let mut remapped = Vec::with_capacity(frames * out_ch);
    for frame in buffer.samples.chunks_exact(in_ch) {
        if out_ch == 1 && in_ch > 1 {
            remapped.push(frame.iter().sum::<f32>() / in_ch as f32);
        } else {
            for c in 0..out_ch {
                remapped.push(frame[c % in_ch]);
            }
        }
    }

    if buffer.format.sample_rate == target.sample_rate || frames == 0 {
        return remapped;
    }

    // Linear resampling per buffer
    let ratio = f64::from(buffer.format.sample_rate) / f64::from(target.sample_rate);
    let out_frames = ((frames as f64) / ratio).round() as usize;
    let mut resampled = Vec::with_capacity(out_frames * out_ch);
    for i in 0..out_frames {
        let pos = i as f64 * ratio;
        let i0 = (pos.floor() as usize).min(frames - 1);
        let i1 = (i0 + 1).min(frames - 1);
        let t = (pos - i0 as f64) as f32;
        for c in 0..out_ch {
            let a = remapped[i0 * out_ch + c];
            let b = remapped[i1 * out_ch + c];
            resampled.push(a + (b - a) * t);
        }
    }
    resampled
}
