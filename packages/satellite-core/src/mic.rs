//! Mic pipeline (C3, §4.3): pulls chunks from the mic peer, runs them
//! through the transform stages, and broadcasts the result.
//!
//! The broadcast-with-ring-buffer-prefill technique here is the same one
//! `stream::manager::StreamState` uses for Sonos playback fan-out: hold the
//! buffer lock while subscribing so a new subscriber's prefill and its first
//! live frame never overlap or gap, and let `broadcast::Sender::send` drop
//! silently for lagging receivers rather than ever blocking the producer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::audio::AudioChunk;

/// `0..31`, mapped externally to a dBFS target by whatever DSP backend is
/// wired in; this crate only carries the level through the pipeline.
pub type AutoGainLevel = u8;
/// `0..4`.
pub type NoiseSuppressionLevel = u8;

#[derive(Debug, Clone)]
pub struct MicPipelineConfig {
    pub channel_index: Option<usize>,
    pub volume_multiplier: f32,
    pub auto_gain: Option<AutoGainLevel>,
    pub noise_suppression: Option<NoiseSuppressionLevel>,
    pub vad_buffer_seconds: f32,
    pub vad_threshold: f32,
    pub vad_trigger_level: u32,
}

impl Default for MicPipelineConfig {
    fn default() -> Self {
        Self {
            channel_index: None,
            volume_multiplier: 1.0,
            auto_gain: None,
            noise_suppression: None,
            vad_buffer_seconds: 2.0,
            vad_threshold: 0.5,
            vad_trigger_level: 1,
        }
    }
}

/// An externally-provided DSP stage. Auto-gain and noise suppression are
/// non-goals of this crate (§1); callers that want them wire in an
/// implementation, and a stage that errors is skipped for that chunk only
/// (`ErrDsp`, §7) rather than tearing down the pipeline.
pub trait DspStage: Send + Sync {
    fn process(&self, chunk: &mut AudioChunk) -> Result<(), crate::error::SatelliteError>;
}

/// Applies the channel-selector, volume-multiplier and mute-gate stages
/// in-process (§4.3 steps 1, 2, 5); auto-gain/noise-suppression (steps 3-4)
/// are delegated to injected [`DspStage`]s since their implementations are
/// out of scope.
pub struct MicPipeline {
    config: MicPipelineConfig,
    auto_gain: Option<Arc<dyn DspStage>>,
    noise_suppression: Option<Arc<dyn DspStage>>,
    muted: Arc<AtomicBool>,
    preroll: Arc<Mutex<VecDeque<Arc<AudioChunk>>>>,
    preroll_capacity_chunks: usize,
    tx: broadcast::Sender<Arc<AudioChunk>>,
}

impl MicPipeline {
    pub fn new(
        config: MicPipelineConfig,
        auto_gain: Option<Arc<dyn DspStage>>,
        noise_suppression: Option<Arc<dyn DspStage>>,
        chunk_duration_ms: u32,
    ) -> Self {
        let chunks_per_second = if chunk_duration_ms == 0 {
            1
        } else {
            (1000 / chunk_duration_ms).max(1) as usize
        };
        let preroll_capacity_chunks =
            (config.vad_buffer_seconds.max(0.0) as usize).max(1) * chunks_per_second;
        let (tx, _rx) = broadcast::channel(256);
        Self {
            config,
            auto_gain,
            noise_suppression,
            muted: Arc::new(AtomicBool::new(false)),
            preroll: Arc::new(Mutex::new(VecDeque::with_capacity(preroll_capacity_chunks))),
            preroll_capacity_chunks,
            tx,
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Subscribes to the broadcast, atomically returning the current
    /// pre-roll snapshot alongside the live receiver so no frame is missed
    /// or duplicated across the handoff (same technique as
    /// `StreamState::subscribe`).
    pub fn subscribe(&self) -> (Vec<Arc<AudioChunk>>, broadcast::Receiver<Arc<AudioChunk>>) {
        let preroll = self.preroll.lock();
        let snapshot: Vec<_> = preroll.iter().cloned().collect();
        let rx = self.tx.subscribe();
        (snapshot, rx)
    }

    /// Runs one raw chunk through the pipeline and broadcasts the result.
    /// Returns `true` if the VAD scorer judged this chunk as speech
    /// (only meaningful in VAD-gated mode; step 6 of §4.3).
    pub fn process_and_broadcast(&self, mut chunk: AudioChunk, vad_state: &mut VadState) -> bool {
        if let Some(idx) = self.config.channel_index {
            chunk = select_channel(chunk, idx);
        }
        apply_volume(&mut chunk, self.config.volume_multiplier);

        if let Some(stage) = &self.auto_gain {
            if let Err(e) = stage.process(&mut chunk) {
                tracing::debug!(error = %e, "auto-gain stage failed, skipping for this chunk");
            }
        }
        if let Some(stage) = &self.noise_suppression {
            if let Err(e) = stage.process(&mut chunk) {
                tracing::debug!(error = %e, "noise-suppression stage failed, skipping for this chunk");
            }
        }

        if self.is_muted() {
            chunk = chunk.silence_like();
        }

        let speech_detected = vad_state.score(&chunk, self.config.vad_threshold, self.config.vad_trigger_level);

        let shared = chunk.shared();
        {
            let mut preroll = self.preroll.lock();
            if preroll.len() >= self.preroll_capacity_chunks {
                preroll.pop_front();
            }
            preroll.push_back(shared.clone());
        }
        // A broadcast send failing (no receivers, or a lagging receiver
        // dropped) never blocks or errors the producer; it's the
        // broadcaster's problem, not ours (§4.3, §5).
        let _ = self.tx.send(shared);
        speech_detected
    }
}

fn select_channel(chunk: AudioChunk, index: usize) -> AudioChunk {
    let channels = chunk.format.channels as usize;
    let width = chunk.format.width as usize;
    if channels <= 1 || index >= channels {
        return chunk;
    }
    let frame_stride = channels * width;
    let mut out = Vec::with_capacity(chunk.samples.len() / channels);
    for frame in chunk.samples.chunks(frame_stride) {
        let start = index * width;
        if let Some(sample) = frame.get(start..start + width) {
            out.extend_from_slice(sample);
        }
    }
    let mut format = chunk.format;
    format.channels = 1;
    AudioChunk::new(format, bytes::Bytes::from(out), chunk.timestamp_ms)
}

fn apply_volume(chunk: &mut AudioChunk, multiplier: f32) {
    if (multiplier - 1.0).abs() < f32::EPSILON {
        return;
    }
    if chunk.format.width != 2 {
        // Only 16-bit PCM gain is implemented; other widths pass through
        // unchanged rather than risk misinterpreting sample layout.
        return;
    }
    let mut out = Vec::with_capacity(chunk.samples.len());
    for pair in chunk.samples.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (sample as f32 * multiplier).clamp(i16::MIN as f32, i16::MAX as f32);
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    chunk.samples = bytes::Bytes::from(out);
}

/// Rolling VAD trigger-count scorer (§4.3 step 6, §8 boundary behavior:
/// `vad_trigger_level = 1` fires on the first positive frame).
pub struct VadState {
    trigger_count: u32,
}

impl VadState {
    pub fn new() -> Self {
        Self { trigger_count: 0 }
    }

    /// Very small energy heuristic standing in for the external VAD model:
    /// counts a chunk as "positive" when its mean absolute 16-bit sample
    /// exceeds `threshold * i16::MAX`. Real deployments wire in an actual
    /// VAD scorer upstream of this pipeline; this keeps the trigger-count
    /// bookkeeping testable without one.
    pub fn score(&mut self, chunk: &AudioChunk, threshold: f32, trigger_level: u32) -> bool {
        let positive = mean_abs_amplitude(chunk) > threshold;
        if positive {
            self.trigger_count += 1;
        } else {
            self.trigger_count = 0;
        }
        self.trigger_count >= trigger_level.max(1)
    }

    pub fn reset(&mut self) {
        self.trigger_count = 0;
    }
}

impl Default for VadState {
    fn default() -> Self {
        Self::new()
    }
}

fn mean_abs_amplitude(chunk: &AudioChunk) -> f32 {
    if chunk.format.width != 2 || chunk.samples.is_empty() {
        return 0.0;
    }
    let mut sum: i64 = 0;
    let mut count: i64 = 0;
    for pair in chunk.samples.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as i64;
        sum += sample.abs();
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        (sum as f32 / count as f32) / i16::MAX as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn fmt() -> crate::audio::AudioFormat {
        crate::audio::AudioFormat {
            rate: 16000,
            width: 2,
            channels: 1,
        }
    }

    #[test]
    fn vad_trigger_level_one_fires_on_first_positive_frame() {
        let mut vad = VadState::new();
        let loud = AudioChunk::new(fmt(), Bytes::from(vec![0xff, 0x7f, 0xff, 0x7f]), 0);
        assert!(vad.score(&loud, 0.1, 1));
    }

    #[test]
    fn vad_trigger_level_k_requires_k_consecutive_frames() {
        let mut vad = VadState::new();
        let loud = AudioChunk::new(fmt(), Bytes::from(vec![0xff, 0x7f, 0xff, 0x7f]), 0);
        assert!(!vad.score(&loud, 0.1, 3));
        assert!(!vad.score(&loud, 0.1, 3));
        assert!(vad.score(&loud, 0.1, 3));
    }

    #[test]
    fn silence_resets_trigger_count() {
        let mut vad = VadState::new();
        let loud = AudioChunk::new(fmt(), Bytes::from(vec![0xff, 0x7f]), 0);
        let quiet = AudioChunk::new(fmt(), Bytes::from(vec![0x00, 0x00]), 0);
        vad.score(&loud, 0.1, 3);
        vad.score(&quiet, 0.1, 3);
        assert!(!vad.score(&loud, 0.1, 3));
    }

    #[tokio::test]
    async fn subscriber_sees_preroll_then_live_chunks_in_order() {
        let pipeline = MicPipeline::new(MicPipelineConfig::default(), None, None, 20);
        let mut vad = VadState::new();
        for i in 0..3 {
            pipeline.process_and_broadcast(
                AudioChunk::new(fmt(), Bytes::from(vec![0, 0]), i),
                &mut vad,
            );
        }
        let (preroll, mut rx) = pipeline.subscribe();
        assert!(!preroll.is_empty());
        pipeline.process_and_broadcast(AudioChunk::new(fmt(), Bytes::from(vec![0, 0]), 99), &mut vad);
        let live = rx.recv().await.unwrap();
        assert_eq!(live.timestamp_ms, 99);
    }

    #[test]
    fn mute_gate_replaces_samples_with_silence() {
        let pipeline = MicPipeline::new(MicPipelineConfig::default(), None, None, 20);
        pipeline.set_muted(true);
        let mut vad = VadState::new();
        let (_preroll, mut rx) = pipeline.subscribe();
        pipeline.process_and_broadcast(
            AudioChunk::new(fmt(), Bytes::from(vec![0xff, 0x7f]), 0),
            &mut vad,
        );
        let out = rx.try_recv().unwrap();
        assert!(out.samples.iter().all(|&b| b == 0));
    }
}
