//! Wake coordinator (C5, §4.5): drives the wake peer with a named model
//! set, applies the refractory window, and emits `Detection` events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioChunk;
use crate::events::{EventEmitter, LifecycleEvent};
use crate::protocol::framing::Frame;
use crate::protocol::messages::emitted;
use crate::protocol::peer::PeerHandle;

pub struct WakeCoordinator {
    forwarding: Arc<AtomicBool>,
    last_detection: Arc<Mutex<Option<Instant>>>,
    refractory: Duration,
    wake_peer: PeerHandle,
}

impl WakeCoordinator {
    pub fn new(wake_peer: PeerHandle, refractory_seconds: f64) -> Self {
        Self {
            forwarding: Arc::new(AtomicBool::new(false)),
            last_detection: Arc::new(Mutex::new(None)),
            refractory: Duration::from_secs_f64(refractory_seconds.max(0.0)),
            wake_peer,
        }
    }

    /// Sends `detect{names}` — called at startup, whenever the configured
    /// name set changes, and again on every wake-peer reconnect (§9 open
    /// question, resolved: re-send on reconnect).
    pub fn send_detect(&self, names: &[String]) {
        self.wake_peer.publish(Frame::with_data(
            emitted::DETECT,
            serde_json::json!({ "names": names }),
        ));
    }

    /// The coordinator only forwards mic audio to the wake peer while the
    /// satellite is in `WaitingForWake` (§4.5); outside that window the
    /// peer connection itself is retained, just not fed.
    pub fn set_forwarding(&self, forwarding: bool) {
        self.forwarding.store(forwarding, Ordering::Relaxed);
    }

    pub fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Relaxed)
    }

    pub fn forward_chunk(&self, chunk: &AudioChunk) {
        if !self.is_forwarding() {
            return;
        }
        self.wake_peer.publish(
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

    /// Applies the refractory window to an incoming `detection{name}` from
    /// the wake peer, emitting `Detection` and notifying `on_detected` when
    /// accepted. Returns `true` if the detection was accepted (not dropped
    /// by the refractory window).
    pub fn on_wake_peer_detection(&self, name: String, emitter: &dyn EventEmitter) -> bool {
        let now = Instant::now();
        let mut last = self.last_detection.lock();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.refractory {
                tracing::debug!(name, "detection within refractory window, dropping");
                return false;
            }
        }
        *last = Some(now);
        emitter.emit(LifecycleEvent::Detection { name });
        true
    }

    /// Spawns a task relaying every mic-pipeline broadcast chunk to
    /// `forward_chunk` while this coordinator is alive; terminates on
    /// cancellation.
    pub fn spawn_forwarder(
        self: Arc<Self>,
        mut mic_rx: broadcast::Receiver<Arc<AudioChunk>>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = mic_rx.recv() => {
                        match chunk {
                            Ok(chunk) => self.forward_chunk(&chunk),
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::protocol::peer::{Endpoint, HandshakeMode, Peer, PeerConfig};
    use tokio::sync::mpsc;

    fn handle() -> PeerHandle {
        let cancel = CancellationToken::new();
        let (edge_tx, _edge_rx) = mpsc::unbounded_channel();
        let (handle, _rx) = Peer::spawn(
            PeerConfig {
                label: "wake",
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
    fn first_detection_is_always_accepted() {
        let wake = WakeCoordinator::new(handle(), 5.0);
        let emitter = NoopEventEmitter;
        assert!(wake.on_wake_peer_detection("ok_nabu".into(), &emitter));
    }

    #[test]
    fn second_detection_within_refractory_window_is_dropped() {
        let wake = WakeCoordinator::new(handle(), 5.0);
        let emitter = NoopEventEmitter;
        assert!(wake.on_wake_peer_detection("ok_nabu".into(), &emitter));
        assert!(!wake.on_wake_peer_detection("ok_nabu".into(), &emitter));
    }

    #[test]
    fn forwarding_defaults_to_off() {
        let wake = WakeCoordinator::new(handle(), 5.0);
        assert!(!wake.is_forwarding());
        wake.set_forwarding(true);
        assert!(wake.is_forwarding());
    }
}
