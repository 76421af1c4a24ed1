//! Event fan-out (C7, §4.7): delivers lifecycle events to the event peer,
//! subprocess hooks, and the feedback WAV scheduler, fed from a single
//! ordered channel so every sink sees the state machine's observation
//! order.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFormat;
use crate::events::LifecycleEvent;
use crate::hooks::{run_hook, HookConfig, StdinPolicy};
use crate::protocol::framing::Frame;
use crate::protocol::peer::PeerHandle;
use crate::snd::{PlaybackReason, PlaybackRequest, PlaybackSource, SndPipeline};

/// A loaded feedback WAV (§6 Sounds group): `awake-wav`, `done-wav`,
/// `timer-finished-wav`.
#[derive(Debug, Clone)]
pub struct FeedbackSound {
    pub samples: Bytes,
    pub format: AudioFormat,
}

#[derive(Default)]
pub struct FeedbackSounds {
    pub awake: Option<FeedbackSound>,
    pub done: Option<FeedbackSound>,
    pub timer_finished: Option<FeedbackSound>,
    pub timer_finished_repeat: u32,
    pub timer_finished_delay_s: f64,
}

pub struct FanOutConfig {
    pub event_peer: Option<PeerHandle>,
    pub hooks: HashMap<&'static str, HookConfig>,
    pub sounds: FeedbackSounds,
}

/// Spawns the fan-out dispatcher, returning a sender that feeds it
/// lifecycle events in order.
pub fn spawn(
    config: FanOutConfig,
    snd: Arc<SndPipeline>,
    cancel: CancellationToken,
) -> mpsc::UnboundedSender<LifecycleEvent> {
    let (tx, rx) = mpsc::unbounded_channel::<LifecycleEvent>();
    spawn_from_channel(config, snd, cancel, rx);
    tx
}

/// Same as [`spawn`], but for callers (the composition root) that already
/// handed the sending half out to a [`crate::events::ChannelEventEmitter`]
/// before the snd pipeline this dispatcher depends on existed.
pub fn spawn_from_channel(
    config: FanOutConfig,
    snd: Arc<SndPipeline>,
    cancel: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => {
                    match event {
                        Some(event) => dispatch(&config, &snd, event).await,
                        None => return,
                    }
                }
            }
        }
    });
}

async fn dispatch(config: &FanOutConfig, snd: &Arc<SndPipeline>, event: LifecycleEvent) {
    deliver_to_event_peer(config, &event);
    deliver_to_hook(config, &event).await;
    schedule_feedback(config, snd, &event).await;
}

fn deliver_to_event_peer(config: &FanOutConfig, event: &LifecycleEvent) {
    let Some(peer) = &config.event_peer else {
        return;
    };
    if matches!(event, LifecycleEvent::Unknown) {
        return;
    }
    let data = serde_json::to_value(event).ok().and_then(|mut v| {
        let obj = v.as_object_mut()?;
        obj.remove("type");
        if obj.is_empty() {
            None
        } else {
            Some(v)
        }
    });
    let frame = match data {
        Some(data) => Frame::with_data(event.wire_type(), data),
        None => Frame::new(event.wire_type()),
    };
    peer.publish(frame);
}

async fn deliver_to_hook(config: &FanOutConfig, event: &LifecycleEvent) {
    let Some(hook) = config.hooks.get(event.hook_kind()) else {
        return;
    };
    let stdin = match (&hook.stdin, event) {
        (StdinPolicy::None, _) => StdinPolicy::None,
        (StdinPolicy::Name(_), LifecycleEvent::TimerFinished { id }) => StdinPolicy::Name(id.clone()),
        (StdinPolicy::Name(_), LifecycleEvent::TimerCancelled { id }) => {
            StdinPolicy::Name(id.clone())
        }
        (StdinPolicy::Text(_), LifecycleEvent::Transcript { text }) => StdinPolicy::Text(text.clone()),
        (StdinPolicy::Text(_), LifecycleEvent::Synthesize { text }) => {
            StdinPolicy::Text(text.clone())
        }
        (StdinPolicy::Json(_), event) => {
            StdinPolicy::Json(serde_json::to_value(event).unwrap_or_default())
        }
        (policy, _) => policy.clone(),
    };
    let hook = HookConfig {
        argv: hook.argv.clone(),
        stdin,
    };
    run_hook(hook, "lifecycle").await;
}

async fn schedule_feedback(config: &FanOutConfig, snd: &Arc<SndPipeline>, event: &LifecycleEvent) {
    match event {
        LifecycleEvent::Detection { .. } => {
            if let Some(sound) = &config.sounds.awake {
                enqueue(snd, sound, 1, 0.0, PlaybackReason::Feedback).await;
            }
        }
        LifecycleEvent::TtsStop => {
            if let Some(sound) = &config.sounds.done {
                enqueue(snd, sound, 1, 0.0, PlaybackReason::Feedback).await;
            }
        }
        LifecycleEvent::TimerFinished { .. } => {
            if let Some(sound) = &config.sounds.timer_finished {
                enqueue(
                    snd,
                    sound,
                    config.sounds.timer_finished_repeat,
                    config.sounds.timer_finished_delay_s,
                    PlaybackReason::TimerFinished,
                )
                .await;
            }
        }
        _ => {}
    }
}

async fn enqueue(
    snd: &Arc<SndPipeline>,
    sound: &FeedbackSound,
    repeat: u32,
    delay_s: f64,
    reason: PlaybackReason,
) {
    snd.enqueue(PlaybackRequest {
        source: PlaybackSource::LocalWav {
            samples: sound.samples.clone(),
            format: sound.format,
            repeat,
            delay_s,
        },
        reason,
        done: None,
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_repeat_timer_finished_wav_plays_zero_times() {
        let sounds = FeedbackSounds {
            timer_finished: Some(FeedbackSound {
                samples: Bytes::from_static(b"\0\0"),
                format: AudioFormat {
                    rate: 16000,
                    width: 2,
                    channels: 1,
                },
            }),
            timer_finished_repeat: 0,
            timer_finished_delay_s: 1.0,
            ..Default::default()
        };
        assert_eq!(sounds.timer_finished_repeat, 0);
    }
}
