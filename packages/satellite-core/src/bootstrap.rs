//! Composition root (C12, §4.12): the single place every service is
//! constructed and wired together, mirroring the teacher's
//! `bootstrap_services` — dependency order matters and is spelled out in
//! [`bootstrap_satellite`]'s body rather than left implicit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioChunk;
use crate::config::{SatelliteConfig, ValidatedConfig};
use crate::discovery::{self, DiscoveryConfig as DiscoveryEndpoint, SatelliteAdvertiser};
use crate::error::{SatelliteError, SatelliteResult};
use crate::events::fanout::{FanOutConfig, FeedbackSound, FeedbackSounds};
use crate::events::{ChannelEventEmitter, EventEmitter, LifecycleEvent};
use crate::hooks::{HookConfig, StdinPolicy};
use crate::mic::{MicPipeline, VadState};
use crate::protocol::framing::Frame;
use crate::protocol::messages::{consumed, emitted, SatelliteInfo};
use crate::protocol::peer::{
    Endpoint, HandshakeMode, Peer, PeerConfig, PeerEdge, PeerHandle, RawPcmFormat,
};
use crate::server::{self, SessionContext};
use crate::snd::{PlaybackReason, PlaybackRequest, PlaybackSource, SndPipeline};
use crate::state_machine::{Input, SatelliteMode, StateMachine};
use crate::timers::TimerRegistry;
use crate::wake::WakeCoordinator;

const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// Everything [`bootstrap_satellite`] wires up, ready to drive until
/// cancellation and then tear down.
pub struct BootstrappedSatellite {
    cancel: CancellationToken,
    listener_uri: String,
    session_ctx: Arc<SessionContext>,
    mic_peer: Option<PeerHandle>,
    snd_peer: Option<PeerHandle>,
    wake_peer: Option<PeerHandle>,
    event_peer: Option<PeerHandle>,
    advertiser: Option<SatelliteAdvertiser>,
}

impl BootstrappedSatellite {
    /// Runs the main server listener until cancelled. The mic/snd/wake
    /// pipelines, state machine, and fan-out dispatcher were already
    /// spawned onto their own tasks during bootstrap; this just blocks on
    /// the accept loop, the one piece of work that owns the caller's
    /// await point.
    pub async fn run(&self) -> SatelliteResult<()> {
        server::run(
            self.listener_uri.clone(),
            self.session_ctx.clone(),
            self.cancel.clone(),
        )
        .await
        .map_err(SatelliteError::from)
    }

    /// Bounded graceful teardown (§5): cancel every task, stop every peer,
    /// unregister mDNS.
    pub async fn shutdown(&self) {
        tracing::info!("beginning graceful shutdown");
        self.cancel.cancel();
        for peer in [&self.mic_peer, &self.snd_peer, &self.wake_peer, &self.event_peer]
            .into_iter()
            .flatten()
        {
            peer.stop();
        }
        if let Some(advertiser) = &self.advertiser {
            advertiser.shutdown();
        }
        tracing::info!("shutdown complete");
    }
}

fn endpoint_from(
    uri: &Option<String>,
    command: &Option<Vec<String>>,
    format: RawPcmFormat,
) -> Option<Endpoint> {
    if let Some(uri) = uri {
        Endpoint::parse_uri(uri).ok()
    } else {
        command.clone().map(|argv| Endpoint::Command { argv, format })
    }
}

fn load_wav(path: &Option<std::path::PathBuf>) -> Option<FeedbackSound> {
    let path = path.as_ref()?;
    match std::fs::read(path) {
        Ok(bytes) => match crate::audio::decode_wav(&bytes) {
            Ok(sound) => Some(sound),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to decode feedback wav");
                None
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read feedback wav");
            None
        }
    }
}

fn frame_to_chunk(frame: &Frame) -> Option<AudioChunk> {
    if frame.envelope.kind != consumed::AUDIO_CHUNK {
        return None;
    }
    let data = frame.envelope.data.as_ref()?;
    let format = crate::audio::AudioFormat {
        rate: data.get("rate")?.as_u64()? as u32,
        width: data.get("width")?.as_u64()? as u8,
        channels: data.get("channels")?.as_u64()? as u8,
    };
    let timestamp_ms = data.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0);
    let payload = frame.payload.clone()?;
    Some(AudioChunk::new(format, payload, timestamp_ms))
}

fn parse_port(uri: &str) -> Option<u16> {
    uri.rsplit(':').next()?.parse().ok()
}

fn leak_kind(kind: &str) -> &'static str {
    Box::leak(kind.to_string().into_boxed_str())
}

/// Wires every component in dependency order:
/// 1. Cancellation token + peer-edge sink (every task below is scoped to it)
/// 2. Passive main peer + the state machine's input channel, created early
///    so the mic/wake tasks spawned below can already hold a sender into it
///    (mirrors `events::fanout`'s early-channel/late-consumer split)
/// 3. Mic peer + `MicPipeline` (snd/wake both consume mic audio); the mic
///    task also forwards captured audio upstream while `Streaming` and
///    drives `SpeechDetected`/`SilenceTimeout` from VAD scoring
/// 4. The fan-out emitter's channel, created early so snd/wake/timers/the
///    state machine can all be handed the same `Arc<dyn EventEmitter>`
/// 5. Snd peer + `SndPipeline` (depends on mic, for the feedback mute gate)
/// 6. Wake peer + `WakeCoordinator` (depends on mic, only in `LocalWake`
///    mode); accepted detections are sent to the state machine here
/// 7. Event peer + fan-out dispatcher (depends on snd, for feedback WAVs)
/// 8. Timer registry + state machine consumer (the sender was already
///    handed out in step 2)
/// 9. mDNS advertiser (best-effort, last — nothing downstream depends on it)
pub fn bootstrap_satellite(config: SatelliteConfig) -> SatelliteResult<BootstrappedSatellite> {
    let ValidatedConfig {
        config,
        mode,
        mic_pipeline: mic_pipeline_config,
    } = config.validate()?;

    let cancel = CancellationToken::new();
    let (edge_tx, mut edge_rx) = mpsc::unbounded_channel::<(&'static str, PeerEdge)>();
    tokio::spawn(async move {
        while let Some((label, edge)) = edge_rx.recv().await {
            match edge {
                PeerEdge::Connected => tracing::info!(peer = label, "peer connected"),
                PeerEdge::Disconnected => tracing::warn!(peer = label, "peer disconnected"),
            }
        }
    });

    // 2. Main peer + state machine channel, created early: the mic/wake
    // tasks below need a sender before the state machine that owns the
    // receiving half can be constructed (it needs the wake coordinator,
    // which itself depends on the mic pipeline built in step 3).
    let main_peer = PeerHandle::new_passive("main", cancel.clone());
    let (state_tx, state_rx) = mpsc::unbounded_channel::<Input>();
    let streaming = Arc::new(AtomicBool::new(false));

    // 3. Mic.
    let mic_endpoint = endpoint_from(
        &config.mic.mic_uri,
        &config.mic.mic_command,
        RawPcmFormat {
            rate: config.mic.mic_command_rate.unwrap_or(RawPcmFormat::default().rate),
            width: config.mic.mic_command_width.unwrap_or(RawPcmFormat::default().width),
            channels: config
                .mic
                .mic_command_channels
                .unwrap_or(RawPcmFormat::default().channels),
            samples_per_chunk: config
                .mic
                .mic_command_samples_per_chunk
                .unwrap_or(RawPcmFormat::default().samples_per_chunk),
        },
    );
    let vad_wake_word_timeout = Duration::from_secs_f64(config.vad.vad_wake_word_timeout.max(0.0));
    let mic: Option<(PeerHandle, Arc<MicPipeline>)> = mic_endpoint.map(|endpoint| {
        let (handle, mut inbound) = Peer::spawn(
            PeerConfig {
                label: "mic",
                endpoint,
                handshake: HandshakeMode::None,
                ping_interval: Some(PING_INTERVAL),
            },
            cancel.clone(),
            edge_tx.clone(),
        );
        let pipeline = Arc::new(MicPipeline::new(mic_pipeline_config.clone(), None, None, 20));
        let pipeline_for_task = pipeline.clone();
        let mic_cancel = cancel.clone();
        let state_tx_for_mic = state_tx.clone();
        let main_peer_for_mic = main_peer.clone();
        let streaming_for_mic = streaming.clone();
        tokio::spawn(async move {
            let mut vad = VadState::new();
            let mut last_speech_at: Option<tokio::time::Instant> = None;
            loop {
                tokio::select! {
                    _ = mic_cancel.cancelled() => return,
                    frame = inbound.recv() => {
                        match frame {
                            Some(frame) => {
                                if let Some(chunk) = frame_to_chunk(&frame) {
                                    if streaming_for_mic.load(Ordering::Relaxed) {
                                        main_peer_for_mic.publish(
                                            Frame::with_data(
                                                emitted::AUDIO_CHUNK,
                                                serde_json::json!({
                                                    "rate": chunk.format.rate,
                                                    "width": chunk.format.width,
                                                    "channels": chunk.format.channels,
                                                    "timestamp": chunk.timestamp_ms,
                                                }),
                                            )
                                            .with_payload(chunk.samples.clone()),
                                        );
                                    }

                                    let now = tokio::time::Instant::now();
                                    let speaking = pipeline_for_task.process_and_broadcast(chunk, &mut vad);
                                    if speaking {
                                        if last_speech_at.is_none() {
                                            let _ = state_tx_for_mic.send(Input::SpeechDetected);
                                        }
                                        last_speech_at = Some(now);
                                    } else if let Some(prev) = last_speech_at {
                                        if now.duration_since(prev) >= vad_wake_word_timeout {
                                            last_speech_at = None;
                                            let _ = state_tx_for_mic.send(Input::SilenceTimeout);
                                        }
                                    }
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });
        (handle, pipeline)
    });
    let mic_peer_handle = mic.as_ref().map(|(h, _)| h.clone());
    let mic_pipeline = mic.map(|(_, p)| p);

    // 4. Fan-out emitter channel, shared by every downstream component.
    let (fanout_tx, fanout_rx) = mpsc::unbounded_channel::<LifecycleEvent>();
    let emitter: Arc<dyn EventEmitter> = Arc::new(ChannelEventEmitter::new(fanout_tx.clone()));

    // 5. Snd.
    let snd_endpoint = endpoint_from(
        &config.snd.snd_uri,
        &config.snd.snd_command,
        RawPcmFormat {
            rate: config.snd.snd_command_rate.unwrap_or(RawPcmFormat::default().rate),
            width: config.snd.snd_command_width.unwrap_or(RawPcmFormat::default().width),
            channels: config
                .snd
                .snd_command_channels
                .unwrap_or(RawPcmFormat::default().channels),
            ..RawPcmFormat::default()
        },
    );
    let snd_peer_handle = snd_endpoint.map(|endpoint| {
        Peer::spawn(
            PeerConfig {
                label: "snd",
                endpoint,
                handshake: HandshakeMode::None,
                ping_interval: Some(PING_INTERVAL),
            },
            cancel.clone(),
            edge_tx.clone(),
        )
        .0
    });
    let snd_pipeline = match (&snd_peer_handle, &mic_pipeline) {
        (Some(snd_peer), Some(mic_pipeline)) => Some(Arc::new(SndPipeline::spawn(
            snd_peer.clone(),
            mic_pipeline.clone(),
            emitter.clone(),
            config.mic.mic_seconds_to_mute_after_awake_wav,
            config.mic.mic_no_mute_during_awake_wav,
            cancel.clone(),
        ))),
        (Some(snd_peer), None) => {
            let muteless_mic = Arc::new(MicPipeline::new(mic_pipeline_config.clone(), None, None, 20));
            Some(Arc::new(SndPipeline::spawn(
                snd_peer.clone(),
                muteless_mic,
                emitter.clone(),
                config.mic.mic_seconds_to_mute_after_awake_wav,
                config.mic.mic_no_mute_during_awake_wav,
                cancel.clone(),
            )))
        }
        (None, _) => None,
    };

    // 6. Wake (only in LocalWake mode).
    let wake_endpoint = endpoint_from(
        &config.wake.wake_uri,
        &config.wake.wake_command,
        RawPcmFormat {
            rate: config.wake.wake_command_rate.unwrap_or(RawPcmFormat::default().rate),
            width: config.wake.wake_command_width.unwrap_or(RawPcmFormat::default().width),
            channels: config
                .wake
                .wake_command_channels
                .unwrap_or(RawPcmFormat::default().channels),
            ..RawPcmFormat::default()
        },
    );
    let wake = (mode == SatelliteMode::LocalWake)
        .then(|| wake_endpoint)
        .flatten()
        .map(|endpoint| {
            let (handle, mut inbound) = Peer::spawn(
                PeerConfig {
                    label: "wake",
                    endpoint,
                    handshake: HandshakeMode::None,
                    ping_interval: Some(PING_INTERVAL),
                },
                cancel.clone(),
                edge_tx.clone(),
            );
            let coordinator = Arc::new(WakeCoordinator::new(
                handle.clone(),
                config.wake.wake_refractory_seconds,
            ));
            if let Some(mic_pipeline) = &mic_pipeline {
                let (_, mic_rx) = mic_pipeline.subscribe();
                coordinator.clone().spawn_forwarder(mic_rx, cancel.clone());
            }
            let emitter_for_task = emitter.clone();
            let coordinator_for_task = coordinator.clone();
            let wake_cancel = cancel.clone();
            let state_tx_for_wake = state_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = wake_cancel.cancelled() => return,
                        frame = inbound.recv() => {
                            match frame {
                                Some(frame) if frame.envelope.kind == consumed::DETECTION => {
                                    if let Some(name) = frame.envelope.field_str("name") {
                                        let name = name.to_string();
                                        if coordinator_for_task
                                            .on_wake_peer_detection(name.clone(), emitter_for_task.as_ref())
                                        {
                                            let _ = state_tx_for_wake.send(Input::Detection(name));
                                        }
                                    }
                                }
                                Some(_) => {}
                                None => return,
                            }
                        }
                    }
                }
            });
            (handle, coordinator)
        });
    let wake_peer_handle = wake.as_ref().map(|(h, _)| h.clone());
    let wake_coordinator = wake.map(|(_, c)| c);

    // 7. Event peer + fan-out dispatcher.
    let event_peer_handle = config
        .events
        .event_uri
        .as_ref()
        .and_then(|uri| Endpoint::parse_uri(uri).ok())
        .map(|endpoint| {
            Peer::spawn(
                PeerConfig {
                    label: "event",
                    endpoint,
                    handshake: HandshakeMode::DescribeInfo,
                    ping_interval: Some(PING_INTERVAL),
                },
                cancel.clone(),
                edge_tx.clone(),
            )
            .0
        });

    let mut hooks = std::collections::HashMap::new();
    for (kind, argv) in &config.events.hook_commands {
        let stdin = match kind.as_str() {
            "transcript" | "synthesize" => StdinPolicy::Text(String::new()),
            "timer-finished" | "timer-cancelled" => StdinPolicy::Name(String::new()),
            _ => StdinPolicy::Json(serde_json::Value::Null),
        };
        hooks.insert(
            leak_kind(kind),
            HookConfig {
                argv: argv.clone(),
                stdin,
            },
        );
    }

    let sounds = FeedbackSounds {
        awake: load_wav(&config.sounds.awake_wav),
        done: load_wav(&config.sounds.done_wav),
        timer_finished: load_wav(&config.sounds.timer_finished_wav),
        timer_finished_repeat: config.sounds.timer_finished_wav_repeat,
        timer_finished_delay_s: config.sounds.timer_finished_wav_delay_s,
    };

    let fanout_snd = snd_pipeline.clone().unwrap_or_else(|| {
        Arc::new(SndPipeline::spawn(
            PeerHandle::new_passive("snd-disabled", cancel.clone()),
            Arc::new(MicPipeline::new(mic_pipeline_config.clone(), None, None, 20)),
            emitter.clone(),
            config.mic.mic_seconds_to_mute_after_awake_wav,
            config.mic.mic_no_mute_during_awake_wav,
            cancel.clone(),
        ))
    });
    crate::events::fanout::spawn_from_channel(
        FanOutConfig {
            event_peer: event_peer_handle.clone(),
            hooks,
            sounds,
        },
        fanout_snd.clone(),
        cancel.clone(),
        fanout_rx,
    );

    // 8. Timer registry + state machine consumer.
    let timers = TimerRegistry::spawn(emitter.clone(), cancel.clone());

    let active_wake_word_names: Vec<String> = config
        .wake
        .wake_word_name
        .iter()
        .map(|(name, _)| name.clone())
        .collect();

    let state_machine = StateMachine::new(
        mode,
        emitter.clone(),
        main_peer.clone(),
        wake_coordinator,
        active_wake_word_names.clone(),
        streaming,
    );
    crate::state_machine::spawn_from_channel(state_machine, cancel.clone(), state_rx);

    // Relays server TTS audio through the snd pipeline (§4.4), so it shares
    // the pipeline's serialized playback slot with feedback/timer WAVs
    // instead of racing them on the raw snd peer.
    let (snd_audio_tx, mut snd_audio_rx) = mpsc::unbounded_channel::<Frame>();
    let tts_snd = fanout_snd;
    tokio::spawn(async move {
        let mut utterance_tx: Option<mpsc::UnboundedSender<Frame>> = None;
        while let Some(frame) = snd_audio_rx.recv().await {
            if frame.envelope.kind == emitted::AUDIO_START {
                let (tx, rx) = mpsc::unbounded_channel::<Frame>();
                let _ = tx.send(frame);
                utterance_tx = Some(tx);
                let snd = tts_snd.clone();
                tokio::spawn(async move {
                    snd.enqueue(PlaybackRequest {
                        source: PlaybackSource::ServerAudio { frames: rx },
                        reason: PlaybackReason::Tts,
                        done: None,
                    })
                    .await;
                });
                continue;
            }
            let is_stop = frame.envelope.kind == emitted::AUDIO_STOP;
            if let Some(tx) = &utterance_tx {
                let _ = tx.send(frame);
            }
            if is_stop {
                utterance_tx = None;
            }
        }
    });

    let info = SatelliteInfo {
        name: config.core.name.clone().unwrap_or_else(discovery::default_name),
        area: config.core.area.clone(),
        snd_format: None,
        supports_trigger: mode == SatelliteMode::LocalWake,
        active_wake_word_names,
        software_name: "satellite",
        software_version: env!("CARGO_PKG_VERSION"),
    };

    let session_ctx = Arc::new(SessionContext {
        state_tx,
        timers,
        snd_audio_tx,
        fanout_tx,
        main_peer,
        info,
    });

    // 9. Discovery.
    let advertiser = if config.discovery.no_zeroconf {
        None
    } else {
        let discovery_config = DiscoveryEndpoint {
            name: config
                .discovery
                .zeroconf_name
                .clone()
                .unwrap_or_else(discovery::default_name),
            host: config
                .discovery
                .zeroconf_host
                .unwrap_or_else(discovery::default_host),
            port: parse_port(&config.core.uri).unwrap_or(10700),
        };
        match SatelliteAdvertiser::new(&discovery_config) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                tracing::warn!(error = %e, "mDNS advertisement failed, continuing without it");
                None
            }
        }
    };

    Ok(BootstrappedSatellite {
        cancel,
        listener_uri: config.core.uri.clone(),
        session_ctx,
        mic_peer: mic_peer_handle,
        snd_peer: snd_peer_handle,
        wake_peer: wake_peer_handle,
        event_peer: event_peer_handle,
        advertiser,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_from_tcp_uri() {
        assert_eq!(parse_port("tcp://0.0.0.0:10700"), Some(10700));
    }

    #[test]
    fn parses_none_from_unix_uri() {
        assert_eq!(parse_port("unix:///run/satellite.sock"), None);
    }
}
