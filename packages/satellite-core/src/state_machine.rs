//! Satellite state machine (C6, §4.6): the single linearizing actor that
//! decides mode-dependent transitions and the lifecycle events/outbound
//! frames each one implies.
//!
//! Kept as one actor (rather than split across tasks) for the same reason
//! the desktop app's GENA event processing is serialized through one
//! manager: transitions must be observed in a single total order so
//! fan-out (C7) sees the state machine's own observation order (§4.6
//! "Ordering guarantee").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, LifecycleEvent};
use crate::protocol::framing::Frame;
use crate::protocol::messages::emitted;
use crate::protocol::peer::PeerHandle;
use crate::wake::WakeCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatelliteMode {
    Always,
    VadGated,
    LocalWake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitingForSpeech,
    WaitingForWake,
    Streaming,
    AwaitingTts,
    Paused,
}

impl SatelliteMode {
    fn initial_state(self) -> SessionState {
        match self {
            SatelliteMode::Always => SessionState::Streaming,
            SatelliteMode::VadGated => SessionState::WaitingForSpeech,
            SatelliteMode::LocalWake => SessionState::WaitingForWake,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Transcript(String),
    Synthesize(String),
    TtsAudioStart,
    TtsAudioStop,
    VoiceStarted,
    VoiceStopped,
    RunEnd,
    Error(String),
}

#[derive(Debug, Clone)]
pub enum Input {
    ServerConnected,
    ServerDisconnected,
    Pause,
    Resume,
    SpeechDetected,
    SilenceTimeout,
    Detection(String),
    ServerEvent(ServerEvent),
}

/// The actor's persistent fields.
pub struct StateMachine {
    mode: SatelliteMode,
    state: SessionState,
    emitter: Arc<dyn EventEmitter>,
    main_peer: PeerHandle,
    wake: Option<Arc<WakeCoordinator>>,
    active_wake_word_names: Vec<String>,
    /// Shared with the mic-to-main-peer audio forwarder (bootstrap wiring):
    /// `true` exactly while `state == Streaming`, so that task knows when to
    /// publish captured chunks upstream without itself tracking transitions.
    streaming: Arc<AtomicBool>,
}

impl StateMachine {
    pub fn new(
        mode: SatelliteMode,
        emitter: Arc<dyn EventEmitter>,
        main_peer: PeerHandle,
        wake: Option<Arc<WakeCoordinator>>,
        active_wake_word_names: Vec<String>,
        streaming: Arc<AtomicBool>,
    ) -> Self {
        Self {
            mode,
            state: SessionState::Idle,
            emitter,
            main_peer,
            wake,
            active_wake_word_names,
            streaming,
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, state: SessionState) {
        self.state = state;
        if let Some(wake) = &self.wake {
            wake.set_forwarding(state == SessionState::WaitingForWake);
        }
        match state {
            SessionState::Streaming => self.on_enter_streaming(),
            SessionState::WaitingForWake => {
                if let Some(wake) = &self.wake {
                    wake.send_detect(&self.active_wake_word_names);
                }
            }
            _ => {}
        }
    }

    fn on_enter_streaming(&mut self) {
        match self.mode {
            SatelliteMode::Always => {
                self.main_peer.publish(Frame::with_data(
                    emitted::RUN_PIPELINE,
                    serde_json::json!({"start_stage": "asr", "end_stage": "tts"}),
                ));
            }
            SatelliteMode::VadGated => {
                self.main_peer.publish(Frame::with_data(
                    emitted::RUN_PIPELINE,
                    serde_json::json!({"start_stage": "asr"}),
                ));
            }
            SatelliteMode::LocalWake => {
                // run-pipeline for LocalWake is sent from
                // handle_local_wake_detection directly, since it needs the
                // detected wake-word name.
            }
        }
        self.main_peer.publish(Frame::new(emitted::AUDIO_START));
        self.emitter.emit(LifecycleEvent::StreamingStart);
    }

    fn stop_streaming(&mut self) {
        self.main_peer.publish(Frame::new(emitted::AUDIO_STOP));
        self.emitter.emit(LifecycleEvent::StreamingStop);
    }

    /// Processes one input, applying §4.6's transition table, then
    /// republishes the mic-forwarding gate from the resulting state — audio
    /// only ever flows upstream while `state == Streaming` (§4.3, §8
    /// Scenario 1), regardless of which arm below changed it.
    pub fn handle(&mut self, input: Input) {
        match input {
            Input::ServerConnected => {
                self.emitter.emit(LifecycleEvent::Connected);
                let target = self.mode.initial_state();
                self.enter(target);
            }
            Input::ServerDisconnected => {
                self.emitter.emit(LifecycleEvent::Disconnected);
                self.state = SessionState::Idle;
            }
            Input::Pause => {
                if self.state == SessionState::Streaming || self.state == SessionState::AwaitingTts
                {
                    self.emitter.emit(LifecycleEvent::StreamingStop);
                }
                self.state = SessionState::Paused;
            }
            Input::Resume => {
                let target = self.mode.initial_state();
                self.enter(target);
            }
            Input::SpeechDetected => {
                if self.mode == SatelliteMode::VadGated
                    && self.state == SessionState::WaitingForSpeech
                {
                    self.emitter.emit(LifecycleEvent::VoiceStarted);
                    self.enter(SessionState::Streaming);
                }
            }
            Input::SilenceTimeout => {
                if self.mode == SatelliteMode::VadGated && self.state == SessionState::Streaming {
                    self.emitter.emit(LifecycleEvent::VoiceStopped);
                    self.stop_streaming();
                    self.state = SessionState::WaitingForSpeech;
                }
            }
            Input::Detection(name) => {
                if self.mode == SatelliteMode::LocalWake
                    && self.state == SessionState::WaitingForWake
                {
                    self.handle_local_wake_detection(name);
                }
            }
            Input::ServerEvent(ev) => self.handle_server_event(ev),
        }
        self.streaming
            .store(self.state == SessionState::Streaming, Ordering::Relaxed);
    }

    fn handle_local_wake_detection(&mut self, name: String) {
        self.main_peer.publish(Frame::with_data(
            emitted::RUN_PIPELINE,
            serde_json::json!({"start_stage": "asr", "wake_word_name": name}),
        ));
        self.main_peer.publish(Frame::with_data(
            emitted::DETECTION,
            serde_json::json!({"name": name}),
        ));
        self.emitter.emit(LifecycleEvent::Detection { name });
        self.enter(SessionState::Streaming);
    }

    fn handle_server_event(&mut self, ev: ServerEvent) {
        match ev {
            ServerEvent::Transcript(text) => self.emitter.emit(LifecycleEvent::Transcript { text }),
            ServerEvent::Synthesize(text) => self.emitter.emit(LifecycleEvent::Synthesize { text }),
            ServerEvent::TtsAudioStart => {
                self.state = SessionState::AwaitingTts;
                self.emitter.emit(LifecycleEvent::TtsStart);
            }
            ServerEvent::TtsAudioStop => {
                self.emitter.emit(LifecycleEvent::TtsStop);
                match self.mode {
                    SatelliteMode::Always => self.enter(SessionState::Streaming),
                    SatelliteMode::VadGated => self.state = SessionState::WaitingForSpeech,
                    SatelliteMode::LocalWake => self.enter(SessionState::WaitingForWake),
                }
            }
            ServerEvent::VoiceStarted => self.emitter.emit(LifecycleEvent::VoiceStarted),
            ServerEvent::VoiceStopped => self.emitter.emit(LifecycleEvent::VoiceStopped),
            ServerEvent::RunEnd => {
                if self.mode == SatelliteMode::LocalWake && self.state != SessionState::AwaitingTts
                {
                    self.enter(SessionState::WaitingForWake);
                }
            }
            ServerEvent::Error(text) => {
                self.emitter.emit(LifecycleEvent::Error { text, code: None });
            }
        }
    }
}

/// Spawns the state machine as its own actor task, returning a sender for
/// [`Input`]s. This is the concurrency seam: every input is linearized
/// through this one inbox.
pub fn spawn(sm: StateMachine, cancel: CancellationToken) -> mpsc::UnboundedSender<Input> {
    let (tx, rx) = mpsc::unbounded_channel::<Input>();
    spawn_from_channel(sm, cancel, rx);
    tx
}

/// Same as [`spawn`], but for callers (the composition root) that already
/// handed the sending half out to tasks spawned before the state machine
/// itself could be constructed — mirrors
/// [`crate::events::fanout::spawn_from_channel`]'s same early-sender,
/// late-consumer split.
pub fn spawn_from_channel(
    mut sm: StateMachine,
    cancel: CancellationToken,
    mut rx: mpsc::UnboundedReceiver<Input>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                input = rx.recv() => {
                    match input {
                        Some(input) => sm.handle(input),
                        None => return,
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LoggingEventEmitter;
    use crate::protocol::peer::{Endpoint, HandshakeMode, Peer, PeerConfig};
    use tokio::sync::mpsc as tmpsc;

    fn peer() -> PeerHandle {
        let cancel = CancellationToken::new();
        let (edge_tx, _rx) = tmpsc::unbounded_channel();
        let (handle, _rx2) = Peer::spawn(
            PeerConfig {
                label: "main",
                endpoint: Endpoint::Uri("tcp://127.0.0.1:1".into()),
                handshake: HandshakeMode::None,
                ping_interval: None,
            },
            cancel,
            edge_tx,
        );
        handle
    }

    #[test]
    fn always_mode_starts_streaming_on_connect() {
        let mut sm = StateMachine::new(
            SatelliteMode::Always,
            Arc::new(LoggingEventEmitter),
            peer(),
            None,
            vec![],
            Arc::new(AtomicBool::new(false)),
        );
        sm.handle(Input::ServerConnected);
        assert_eq!(sm.current_state(), SessionState::Streaming);
    }

    #[test]
    fn vad_gated_mode_starts_waiting_for_speech() {
        let mut sm = StateMachine::new(
            SatelliteMode::VadGated,
            Arc::new(LoggingEventEmitter),
            peer(),
            None,
            vec![],
            Arc::new(AtomicBool::new(false)),
        );
        sm.handle(Input::ServerConnected);
        assert_eq!(sm.current_state(), SessionState::WaitingForSpeech);
        sm.handle(Input::SpeechDetected);
        assert_eq!(sm.current_state(), SessionState::Streaming);
    }

    #[test]
    fn local_wake_mode_detection_enters_streaming() {
        let mut sm = StateMachine::new(
            SatelliteMode::LocalWake,
            Arc::new(LoggingEventEmitter),
            peer(),
            None,
            vec!["ok_nabu".into()],
            Arc::new(AtomicBool::new(false)),
        );
        sm.handle(Input::ServerConnected);
        assert_eq!(sm.current_state(), SessionState::WaitingForWake);
        sm.handle(Input::Detection("ok_nabu".into()));
        assert_eq!(sm.current_state(), SessionState::Streaming);
    }

    #[test]
    fn pause_then_resume_returns_to_mode_initial() {
        let mut sm = StateMachine::new(
            SatelliteMode::Always,
            Arc::new(LoggingEventEmitter),
            peer(),
            None,
            vec![],
            Arc::new(AtomicBool::new(false)),
        );
        sm.handle(Input::ServerConnected);
        sm.handle(Input::Pause);
        assert_eq!(sm.current_state(), SessionState::Paused);
        sm.handle(Input::Resume);
        assert_eq!(sm.current_state(), SessionState::Streaming);
    }

    #[test]
    fn server_disconnect_resets_to_idle_from_any_state() {
        let mut sm = StateMachine::new(
            SatelliteMode::Always,
            Arc::new(LoggingEventEmitter),
            peer(),
            None,
            vec![],
            Arc::new(AtomicBool::new(false)),
        );
        sm.handle(Input::ServerConnected);
        sm.handle(Input::ServerDisconnected);
        assert_eq!(sm.current_state(), SessionState::Idle);
    }

    #[test]
    fn tts_bracket_returns_to_streaming_in_always_mode() {
        let mut sm = StateMachine::new(
            SatelliteMode::Always,
            Arc::new(LoggingEventEmitter),
            peer(),
            None,
            vec![],
            Arc::new(AtomicBool::new(false)),
        );
        sm.handle(Input::ServerConnected);
        sm.handle(Input::ServerEvent(ServerEvent::TtsAudioStart));
        assert_eq!(sm.current_state(), SessionState::AwaitingTts);
        sm.handle(Input::ServerEvent(ServerEvent::TtsAudioStop));
        assert_eq!(sm.current_state(), SessionState::Streaming);
    }
}
