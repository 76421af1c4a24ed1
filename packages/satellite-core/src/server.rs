//! Main server listener (C9, §4.9): accepts inbound connections from
//! upstream voice-assistant servers and pins exactly one active session.

use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::events::LifecycleEvent;
use crate::protocol::framing::{self, Frame};
use crate::protocol::messages::{consumed, emitted, SatelliteInfo};
use crate::protocol::peer::PeerHandle;
use crate::state_machine::{Input, ServerEvent};
use crate::timers::{Timer, TimerRegistryHandle};

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

async fn bind(uri: &str) -> Result<Listener, TransportError> {
    if let Some(addr) = uri.strip_prefix("tcp://") {
        // One retry after a short pause to ride out the common
        // container-restart race where the previous listener hasn't
        // released the port yet (§6 exit-code note).
        match TcpListener::bind(addr).await {
            Ok(l) => Ok(Listener::Tcp(l)),
            Err(_) => {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                Ok(Listener::Tcp(TcpListener::bind(addr).await?))
            }
        }
    } else if let Some(path) = uri.strip_prefix("unix://") {
        let _ = std::fs::remove_file(path);
        Ok(Listener::Unix(UnixListener::bind(path)?))
    } else {
        Err(TransportError::UnsupportedUri(uri.to_string()))
    }
}

/// Per-session collaborators the accept loop wires into every connection.
#[derive(Clone)]
pub struct SessionContext {
    pub state_tx: mpsc::UnboundedSender<Input>,
    pub timers: TimerRegistryHandle,
    pub snd_audio_tx: mpsc::UnboundedSender<Frame>,
    pub fanout_tx: mpsc::UnboundedSender<LifecycleEvent>,
    /// Passive outbound queue the state machine publishes `run-pipeline`,
    /// `audio-start`/`audio-stop`, `detection`, and timer frames onto; the
    /// currently active session drains it (§4.9).
    pub main_peer: PeerHandle,
    pub info: SatelliteInfo,
}

/// Runs the accept loop until cancelled. Each newly accepted connection
/// becomes the active session; the previous one (if any) is dropped,
/// which closes its socket and triggers `ServerDisconnected` via its own
/// reader loop observing EOF.
pub async fn run(
    uri: String,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let listener = bind(&uri).await?;
    tracing::info!(uri, "main server listener bound");

    let mut active_session: Option<CancellationToken> = None;

    loop {
        let accepted = match &listener {
            Listener::Tcp(l) => tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = l.accept() => res.map(|(s, _)| -> Box<dyn TcpOrUnix> { Box::new(s) }),
            },
            Listener::Unix(l) => tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = l.accept() => res.map(|(s, _)| -> Box<dyn TcpOrUnix> { Box::new(s) }),
            },
        };

        let stream = match accepted {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed, continuing");
                continue;
            }
        };

        // A new connection becomes the active session; the previous one
        // (if any) is cancelled, closing its socket (§4.9).
        if let Some(prev) = active_session.take() {
            prev.cancel();
        }
        let session_cancel = cancel.child_token();
        active_session = Some(session_cancel.clone());

        tokio::spawn(run_session(stream, ctx.clone(), session_cancel));
    }
}

/// Marker trait so the accept loop can hold either transport behind one
/// `Box<dyn _>` without duplicating the session-handling code.
trait TcpOrUnix: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl TcpOrUnix for tokio::net::TcpStream {}
impl TcpOrUnix for tokio::net::UnixStream {}

async fn run_session(
    stream: Box<dyn TcpOrUnix>,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    ctx.main_peer.set_connected(true);
    let _ = ctx.state_tx.send(Input::ServerConnected);
    let _ = framing::write_frame(&mut writer, &Frame::with_data(emitted::INFO, ctx.info.to_json())).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framing::read_frame(&mut reader) => {
                match frame {
                    Ok(Some(frame)) => handle_incoming(&frame, &ctx),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "framing error on active session");
                        break;
                    }
                }
            }
            _ = ctx.main_peer.wait_for_outbound() => {
                while let Some(frame) = ctx.main_peer.pop_outbound() {
                    if framing::write_frame(&mut writer, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    ctx.main_peer.set_connected(false);
    let _ = ctx.state_tx.send(Input::ServerDisconnected);
}

/// Translates one consumed Wyoming message (§6) into a state-machine
/// input, a timer-registry call, or an audio-relay forward to the snd
/// pipeline. `pause-satellite`/`resume-satellite` are passthrough-only
/// (§4.9).
fn handle_incoming(frame: &Frame, ctx: &SessionContext) {
    let kind = frame.envelope.kind.as_str();
    match kind {
        consumed::PAUSE_SATELLITE => {
            let _ = ctx.state_tx.send(Input::Pause);
        }
        consumed::RESUME_SATELLITE => {
            let _ = ctx.state_tx.send(Input::Resume);
        }
        consumed::TRANSCRIPT => {
            let text = frame.envelope.field_str("text").unwrap_or_default().to_string();
            let _ = ctx
                .state_tx
                .send(Input::ServerEvent(ServerEvent::Transcript(text)));
        }
        consumed::SYNTHESIZE => {
            let text = frame.envelope.field_str("text").unwrap_or_default().to_string();
            let _ = ctx
                .state_tx
                .send(Input::ServerEvent(ServerEvent::Synthesize(text)));
        }
        consumed::AUDIO_START => {
            let _ = ctx
                .state_tx
                .send(Input::ServerEvent(ServerEvent::TtsAudioStart));
            let _ = ctx.snd_audio_tx.send(Frame::with_data(
                emitted::AUDIO_START,
                frame.envelope.data.clone().unwrap_or_default(),
            ));
        }
        consumed::AUDIO_CHUNK => {
            let mut relay = Frame::with_data(
                emitted::AUDIO_CHUNK,
                frame.envelope.data.clone().unwrap_or_default(),
            );
            relay.payload = frame.payload.clone();
            let _ = ctx.snd_audio_tx.send(relay);
        }
        consumed::AUDIO_STOP => {
            let _ = ctx
                .state_tx
                .send(Input::ServerEvent(ServerEvent::TtsAudioStop));
            let _ = ctx.snd_audio_tx.send(Frame::new(emitted::AUDIO_STOP));
        }
        consumed::VOICE_STARTED => {
            let _ = ctx
                .state_tx
                .send(Input::ServerEvent(ServerEvent::VoiceStarted));
        }
        consumed::VOICE_STOPPED => {
            let _ = ctx
                .state_tx
                .send(Input::ServerEvent(ServerEvent::VoiceStopped));
        }
        consumed::ERROR => {
            let text = frame.envelope.field_str("text").unwrap_or_default().to_string();
            let _ = ctx
                .state_tx
                .send(Input::ServerEvent(ServerEvent::Error(text)));
        }
        consumed::RUN_SATELLITE => {
            // Entry point for a fresh pipeline run; the state machine is
            // already in its mode-initial state on `ServerConnected`, so
            // no additional transition is required here.
        }
        consumed::TIMER_STARTED => {
            if let Some(timer) = parse_timer(frame) {
                ctx.timers.on_started(timer);
            }
        }
        consumed::TIMER_UPDATED => {
            if let Some(timer) = parse_timer(frame) {
                ctx.timers.on_updated(timer);
            }
        }
        consumed::TIMER_CANCELLED => {
            if let Some(id) = frame.envelope.field_str("id") {
                ctx.timers.on_cancelled(id.to_string());
            }
        }
        consumed::TIMER_FINISHED | consumed::INFO | consumed::PING | consumed::PONG
        | consumed::DETECT | consumed::DETECTION => {
            // `timer-finished` from the server is advisory only; our own
            // countdown is authoritative (§4.8). `detect`/`detection` on
            // this peer are handled by the wake coordinator, not here.
        }
        _ => {
            tracing::debug!(kind, "unrecognized message on main server session, ignoring");
        }
    }
}

fn parse_timer(frame: &Frame) -> Option<Timer> {
    let data = frame.envelope.data.as_ref()?;
    serde_json::from_value(data.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rejects_unsupported_scheme() {
        let err = bind("http://127.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedUri(_)));
    }

    #[tokio::test]
    async fn bind_tcp_on_ephemeral_port_succeeds() {
        let listener = bind("tcp://127.0.0.1:0").await.unwrap();
        assert!(matches!(listener, Listener::Tcp(_)));
    }
}
