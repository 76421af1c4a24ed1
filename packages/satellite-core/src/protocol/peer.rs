//! Protocol peer (C2, §4.2): a durable, reconnecting Wyoming client.
//!
//! Grounded on the supervised-reconnect-loop idiom used for topology
//! monitoring in the desktop app (`tokio::select!` over a cancellation
//! token, a periodic action, and a manual-refresh `Notify`) and on the
//! `with_retry` exponential-backoff helper from the Sonos client — here
//! generalized into backoff-forever-until-cancelled rather than
//! bounded-attempt retry, since a peer never gives up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command as ProcCommand};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::TransportError;
use crate::protocol::framing::{self, Frame};
use crate::protocol::messages::emitted;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.2;
const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;

/// Where a peer's bytes come from: a remote Wyoming endpoint, or a local
/// subprocess (mic/snd/wake local capture and playback commands from the
/// CLI surface, §6). A subprocess speaks raw PCM on stdin/stdout, not
/// Wyoming framing, so it carries the format needed to chunk that stream.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Uri(String),
    Command { argv: Vec<String>, format: RawPcmFormat },
}

/// Raw PCM shape for a `mic-command`/`snd-command`/`wake-command`
/// subprocess peer: no Wyoming header accompanies its bytes, so the peer
/// has to already know how to slice the stream into chunks (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPcmFormat {
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
    pub samples_per_chunk: u32,
}

impl Default for RawPcmFormat {
    fn default() -> Self {
        Self {
            rate: 16000,
            width: 2,
            channels: 1,
            samples_per_chunk: 1024,
        }
    }
}

impl RawPcmFormat {
    fn chunk_bytes(&self) -> usize {
        self.samples_per_chunk as usize * self.width as usize * self.channels as usize
    }
}

impl Endpoint {
    pub fn parse_uri(uri: &str) -> Result<Self, TransportError> {
        if uri.starts_with("tcp://") || uri.starts_with("unix://") {
            Ok(Endpoint::Uri(uri.to_string()))
        } else {
            Err(TransportError::UnsupportedUri(uri.to_string()))
        }
    }
}

/// Whether this peer initiates the `describe`/`info` handshake (acting as a
/// Wyoming client against a server-like endpoint) or just streams frames
/// (local capture/playback subprocess peers skip the handshake).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMode {
    DescribeInfo,
    None,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub label: &'static str,
    pub endpoint: Endpoint,
    pub handshake: HandshakeMode,
    pub ping_interval: Option<Duration>,
}

/// Lifecycle edge published by the peer to whoever owns its handle; the
/// satellite state machine subscribes to these to know when to run
/// `Connected`/`Disconnected` side effects (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEdge {
    Connected,
    Disconnected,
}

fn is_lifecycle_frame(frame: &Frame) -> bool {
    frame.envelope.kind != emitted::AUDIO_CHUNK
}

struct OutboundQueue {
    frames: Mutex<VecDeque<Frame>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl OutboundQueue {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues `frame`, applying the backpressure drop policy from §4.2:
    /// lifecycle events are never dropped; when the queue is full, the
    /// oldest non-lifecycle (audio) frame is evicted to make room; if the
    /// queue holds nothing but lifecycle events, the incoming audio frame
    /// itself is dropped instead.
    fn push(&self, frame: Frame) {
        let mut frames = self.frames.lock();
        if frames.len() < OUTBOUND_CAPACITY {
            frames.push_back(frame);
            drop(frames);
            self.notify.notify_one();
            return;
        }

        if is_lifecycle_frame(&frame) {
            if let Some(pos) = frames.iter().position(|f| !is_lifecycle_frame(f)) {
                frames.remove(pos);
            } else {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        } else if let Some(pos) = frames.iter().position(|f| !is_lifecycle_frame(f)) {
            frames.remove(pos);
            frames.push_back(frame);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    async fn wait_for_work(&self) {
        if self.frames.lock().is_empty() {
            self.notify.notified().await;
        }
    }

    fn drain(&self) {
        self.frames.lock().clear();
    }
}

/// A cloneable reference to a running peer actor.
#[derive(Clone)]
pub struct PeerHandle {
    label: &'static str,
    outbound: Arc<OutboundQueue>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PeerHandle {
    /// Builds a handle with no dialing loop behind it: the main server
    /// listener (§4.9 C9) is the passive side of its connection (inbound
    /// peers connect to *it*), so there's no `dial`/backoff to supervise —
    /// just the same outbound queue and drop policy every other peer uses,
    /// drained by whichever accepted session is currently active.
    pub fn new_passive(label: &'static str, cancel: CancellationToken) -> Self {
        Self {
            label,
            outbound: Arc::new(OutboundQueue::new()),
            connected: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    /// Non-blocking enqueue; see [`OutboundQueue::push`] for the drop
    /// policy applied when the queue is saturated.
    pub fn publish(&self, frame: Frame) {
        self.outbound.push(frame);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Marks connectedness for a passive handle; the accept loop calls this
    /// around each session's lifetime (§4.9).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Blocks until the outbound queue has work, for a passive handle's
    /// session-writer loop.
    pub async fn wait_for_outbound(&self) {
        self.outbound.wait_for_work().await;
    }

    /// Pops one queued frame, for a passive handle's session-writer loop.
    pub fn pop_outbound(&self) -> Option<Frame> {
        self.outbound.pop()
    }

    pub fn dropped_count(&self) -> u64 {
        self.outbound.dropped.load(Ordering::Relaxed)
    }

    /// Cancels the peer's supervised loop. The caller retains the
    /// `inbound_rx` it received from [`Peer::spawn`]; it simply stops
    /// yielding new frames once the loop observes cancellation.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.outbound.drain();
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// A boxed duplex byte stream, used so TCP, Unix-socket, and subprocess
/// transports can share one reader/writer implementation.
pub type DuplexIo = tokio::io::Join<Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>>;

async fn dial(endpoint: &Endpoint) -> Result<(DuplexIo, Option<Child>), TransportError> {
    match endpoint {
        Endpoint::Uri(uri) => {
            if let Some(addr) = uri.strip_prefix("tcp://") {
                let stream = TcpStream::connect(addr).await?;
                let (r, w) = stream.into_split();
                let r: Box<dyn AsyncRead + Send + Unpin> = Box::new(r);
                let w: Box<dyn AsyncWrite + Send + Unpin> = Box::new(w);
                Ok((tokio::io::join(r, w), None))
            } else if let Some(path) = uri.strip_prefix("unix://") {
                let stream = UnixStream::connect(path).await?;
                let (r, w) = stream.into_split();
                let r: Box<dyn AsyncRead + Send + Unpin> = Box::new(r);
                let w: Box<dyn AsyncWrite + Send + Unpin> = Box::new(w);
                Ok((tokio::io::join(r, w), None))
            } else {
                Err(TransportError::UnsupportedUri(uri.clone()))
            }
        }
        Endpoint::Command { argv, .. } => {
            let (program, args) = argv
                .split_first()
                .ok_or_else(|| TransportError::UnsupportedUri("empty command".into()))?;
            let mut child = ProcCommand::new(program)
                .args(args)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .spawn()?;
            let stdout = child.stdout.take().expect("stdout piped");
            let stdin = child.stdin.take().expect("stdin piped");
            let r: Box<dyn AsyncRead + Send + Unpin> = Box::new(stdout);
            let w: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stdin);
            Ok((tokio::io::join(r, w), Some(child)))
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = INITIAL_BACKOFF.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = base.min(MAX_BACKOFF.as_secs_f64());
    let jitter = capped * JITTER_FRACTION;
    let delta = rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((capped + delta).max(0.05))
}

pub struct Peer;

impl Peer {
    /// Spawns the supervised connect/handshake/steady-state/backoff loop
    /// and returns a handle plus the inbound frame stream.
    pub fn spawn(
        config: PeerConfig,
        cancel: CancellationToken,
        edge_tx: mpsc::UnboundedSender<(&'static str, PeerEdge)>,
    ) -> (PeerHandle, mpsc::Receiver<Frame>) {
        let outbound = Arc::new(OutboundQueue::new());
        let connected = Arc::new(AtomicBool::new(false));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let handle = PeerHandle {
            label: config.label,
            outbound: outbound.clone(),
            connected: connected.clone(),
            cancel: cancel.clone(),
        };

        let span = tracing::info_span!("peer", kind = config.label, endpoint = ?config.endpoint);
        tokio::spawn(
            run_supervised(config, cancel, outbound, connected, inbound_tx, edge_tx)
                .instrument(span),
        );

        (handle, inbound_rx)
    }
}

async fn run_supervised(
    config: PeerConfig,
    cancel: CancellationToken,
    outbound: Arc<OutboundQueue>,
    connected: Arc<AtomicBool>,
    inbound_tx: mpsc::Sender<Frame>,
    edge_tx: mpsc::UnboundedSender<(&'static str, PeerEdge)>,
) {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let result = match &config.endpoint {
            Endpoint::Command { format, .. } => {
                run_one_raw_connection(&config, &cancel, &outbound, &inbound_tx, &connected, &edge_tx, *format)
                    .await
            }
            Endpoint::Uri(_) => {
                run_one_connection(&config, &cancel, &outbound, &inbound_tx, &connected, &edge_tx).await
            }
        };
        match result {
            Ok(()) => {
                attempt = 0;
            }
            Err(e) => {
                tracing::warn!(peer = config.label, error = %e, "peer connection failed, retrying");
            }
        }

        if connected.swap(false, Ordering::Relaxed) {
            let _ = edge_tx.send((config.label, PeerEdge::Disconnected));
        }

        if cancel.is_cancelled() {
            return;
        }

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_one_connection(
    config: &PeerConfig,
    cancel: &CancellationToken,
    outbound: &Arc<OutboundQueue>,
    inbound_tx: &mpsc::Sender<Frame>,
    connected: &Arc<AtomicBool>,
    edge_tx: &mpsc::UnboundedSender<(&'static str, PeerEdge)>,
) -> Result<(), TransportError> {
    let (io, _child) = dial(&config.endpoint).await?;
    let (mut reader, mut writer) = tokio::io::split(io);

    if !connected.swap(true, Ordering::Relaxed) {
        let _ = edge_tx.send((config.label, PeerEdge::Connected));
    }

    if config.handshake == HandshakeMode::DescribeInfo {
        framing::write_frame(&mut writer, &Frame::new(emitted::DESCRIBE))
            .await
            .map_err(|_| TransportError::Io(std::io::Error::other("handshake write failed")))?;
    }

    let mut last_traffic = tokio::time::Instant::now();
    let ping_timeout = config.ping_interval.map(|i| i * 2);

    loop {
        let read_fut = framing::read_frame(&mut reader);
        let ping_deadline = match (config.ping_interval, ping_timeout) {
            (Some(interval), Some(_)) => tokio::time::sleep_until(last_traffic + interval),
            _ => tokio::time::sleep(Duration::from_secs(3600)),
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            frame_result = read_fut => {
                let frame = frame_result.map_err(|_| TransportError::Io(std::io::Error::other("framing error")))?;
                match frame {
                    None => return Ok(()),
                    Some(frame) => {
                        last_traffic = tokio::time::Instant::now();
                        if frame.envelope.kind == crate::protocol::messages::consumed::PING {
                            let _ = framing::write_frame(&mut writer, &Frame::new(emitted::PONG)).await;
                            continue;
                        }
                        if inbound_tx.send(frame).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            _ = ping_deadline => {
                if let Some(timeout) = ping_timeout {
                    if last_traffic.elapsed() >= timeout {
                        return Err(TransportError::PingTimeout(timeout));
                    }
                }
                let _ = framing::write_frame(&mut writer, &Frame::new(emitted::PING)).await;
            }
            _ = outbound.wait_for_work() => {
                while let Some(frame) = outbound.pop() {
                    if framing::write_frame(&mut writer, &frame).await.is_err() {
                        return Err(TransportError::Io(std::io::Error::other("write failed")));
                    }
                }
            }
        }
    }
}

/// Steady-state loop for a `mic-command`/`snd-command`/`wake-command`
/// subprocess peer (§6): no Wyoming header wraps its bytes, so inbound
/// bytes are read in fixed `samples_per_chunk`-sized slices and synthesized
/// into `audio-chunk` frames, and outbound frames are written as bare
/// payload bytes (the header/data a frame might carry is dropped — a raw
/// subprocess has no use for it).
///
/// A `wake-command` subprocess's stdout, if it produces any, is
/// interpreted the same generic way: raw audio chunks, not structured
/// detections. There's no wire format here for a subprocess to report a
/// detection directly; an engine that needs to do that should speak
/// Wyoming over `wake-uri` instead.
async fn run_one_raw_connection(
    config: &PeerConfig,
    cancel: &CancellationToken,
    outbound: &Arc<OutboundQueue>,
    inbound_tx: &mpsc::Sender<Frame>,
    connected: &Arc<AtomicBool>,
    edge_tx: &mpsc::UnboundedSender<(&'static str, PeerEdge)>,
    format: RawPcmFormat,
) -> Result<(), TransportError> {
    let (io, _child) = dial(&config.endpoint).await?;
    let (mut reader, mut writer) = tokio::io::split(io);

    if !connected.swap(true, Ordering::Relaxed) {
        let _ = edge_tx.send((config.label, PeerEdge::Connected));
    }

    let mut buf = vec![0u8; format.chunk_bytes().max(1)];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = reader.read_exact(&mut buf) => {
                match result {
                    Ok(_) => {
                        let frame = Frame::with_data(
                            emitted::AUDIO_CHUNK,
                            serde_json::json!({
                                "rate": format.rate,
                                "width": format.width,
                                "channels": format.channels,
                            }),
                        )
                        .with_payload(Bytes::copy_from_slice(&buf));
                        if inbound_tx.send(frame).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(TransportError::Io(e)),
                }
            }
            _ = outbound.wait_for_work() => {
                while let Some(frame) = outbound.pop() {
                    if let Some(payload) = &frame.payload {
                        if writer.write_all(payload).await.is_err() {
                            return Err(TransportError::Io(std::io::Error::other("raw write failed")));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_frame() -> Frame {
        Frame::new(emitted::AUDIO_CHUNK)
    }

    fn lifecycle_frame() -> Frame {
        Frame::new(emitted::TIMER_STARTED)
    }

    #[test]
    fn lifecycle_frames_are_never_dropped_to_make_room() {
        let q = OutboundQueue::new();
        for _ in 0..OUTBOUND_CAPACITY {
            q.push(lifecycle_frame());
        }
        q.push(lifecycle_frame());
        // all-lifecycle overflow falls back to dropping the oldest lifecycle
        // frame, but never silently loses the push itself.
        assert_eq!(q.frames.lock().len(), OUTBOUND_CAPACITY);
    }

    #[test]
    fn audio_is_evicted_before_lifecycle_when_queue_is_full() {
        let q = OutboundQueue::new();
        for _ in 0..OUTBOUND_CAPACITY - 1 {
            q.push(lifecycle_frame());
        }
        q.push(audio_frame());
        q.push(lifecycle_frame());
        let frames = q.frames.lock();
        assert!(frames.iter().all(is_lifecycle_frame));
    }

    #[test]
    fn uri_parsing_rejects_unknown_scheme() {
        assert!(Endpoint::parse_uri("http://x").is_err());
        assert!(Endpoint::parse_uri("tcp://127.0.0.1:1234").is_ok());
        assert!(Endpoint::parse_uri("unix:///tmp/x.sock").is_ok());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(0);
        let d5 = backoff_delay(5);
        assert!(d0.as_secs_f64() <= INITIAL_BACKOFF.as_secs_f64() * 1.3);
        assert!(d5.as_secs_f64() <= MAX_BACKOFF.as_secs_f64() * 1.3);
    }
}
