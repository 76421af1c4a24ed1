//! In-process loopback integration tests driving the main server listener
//! (C9) the way a real upstream voice-assistant server would: connect over
//! TCP, read `info`, push consumed messages, observe the translated
//! `state_machine::Input`s and the passive session pinning behavior.

use std::sync::Arc;

use satellite_core::audio::AudioFormat;
use satellite_core::protocol::framing::{read_frame, write_frame, Frame};
use satellite_core::protocol::messages::{consumed, emitted, SatelliteInfo};
use satellite_core::protocol::peer::PeerHandle;
use satellite_core::server::{self, SessionContext};
use satellite_core::state_machine::{Input, ServerEvent};
use satellite_core::{EventEmitter, NoopEventEmitter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn info() -> SatelliteInfo {
    SatelliteInfo {
        name: "test-satellite".into(),
        area: Some("office".into()),
        snd_format: Some(AudioFormat {
            rate: 16000,
            width: 2,
            channels: 1,
        }),
        supports_trigger: true,
        active_wake_word_names: vec![],
        software_name: "satellite-server",
        software_version: "0.1.0",
    }
}

async fn spawn_server() -> (
    String,
    mpsc::UnboundedReceiver<Input>,
    CancellationToken,
) {
    let cancel = CancellationToken::new();
    let (state_tx, state_rx) = mpsc::unbounded_channel::<Input>();
    let (snd_audio_tx, _snd_audio_rx) = mpsc::unbounded_channel::<Frame>();
    let (fanout_tx, _fanout_rx) = mpsc::unbounded_channel();
    let emitter: Arc<dyn EventEmitter> = Arc::new(NoopEventEmitter);
    let timers = satellite_core::timers::TimerRegistry::spawn(emitter, cancel.clone());
    let main_peer = PeerHandle::new_passive("main", cancel.clone());

    let ctx = Arc::new(SessionContext {
        state_tx,
        timers,
        snd_audio_tx,
        fanout_tx,
        main_peer,
        info: info(),
    });

    // Bind on an ephemeral port so tests never collide.
    let uri = "tcp://127.0.0.1:0".to_string();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let uri = uri.replace(":0", &format!(":{port}"));

    let run_cancel = cancel.clone();
    let run_ctx = ctx.clone();
    let run_uri = uri.clone();
    tokio::spawn(async move {
        let _ = server::run(run_uri, run_ctx, run_cancel).await;
    });
    // Give the accept loop a moment to bind before the test connects.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    (uri, state_rx, cancel)
}

#[tokio::test]
async fn connect_sends_info_and_server_connected() {
    let (uri, mut state_rx, cancel) = spawn_server().await;
    let addr = uri.strip_prefix("tcp://").unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let frame = read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(frame.envelope.kind, emitted::INFO);

    let input = state_rx.recv().await.unwrap();
    assert!(matches!(input, Input::ServerConnected));

    cancel.cancel();
}

#[tokio::test]
async fn pause_and_resume_translate_to_state_machine_inputs() {
    let (uri, mut state_rx, cancel) = spawn_server().await;
    let addr = uri.strip_prefix("tcp://").unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let _info = read_frame(&mut stream).await.unwrap().unwrap();
    assert!(matches!(
        state_rx.recv().await.unwrap(),
        Input::ServerConnected
    ));

    write_frame(&mut stream, &Frame::new(consumed::PAUSE_SATELLITE))
        .await
        .unwrap();
    assert!(matches!(state_rx.recv().await.unwrap(), Input::Pause));

    write_frame(&mut stream, &Frame::new(consumed::RESUME_SATELLITE))
        .await
        .unwrap();
    assert!(matches!(state_rx.recv().await.unwrap(), Input::Resume));

    cancel.cancel();
}

#[tokio::test]
async fn transcript_message_carries_its_text_into_the_state_machine() {
    let (uri, mut state_rx, cancel) = spawn_server().await;
    let addr = uri.strip_prefix("tcp://").unwrap();
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let _info = read_frame(&mut stream).await.unwrap().unwrap();
    assert!(matches!(
        state_rx.recv().await.unwrap(),
        Input::ServerConnected
    ));

    write_frame(
        &mut stream,
        &Frame::with_data(consumed::TRANSCRIPT, serde_json::json!({"text": "turn on the lights"})),
    )
    .await
    .unwrap();

    match state_rx.recv().await.unwrap() {
        Input::ServerEvent(ServerEvent::Transcript(text)) => {
            assert_eq!(text, "turn on the lights");
        }
        other => panic!("expected a Transcript server event, got {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn new_connection_displaces_the_previous_session() {
    let (uri, mut state_rx, cancel) = spawn_server().await;
    let addr = uri.strip_prefix("tcp://").unwrap();

    let mut first = TcpStream::connect(addr).await.unwrap();
    let _ = read_frame(&mut first).await.unwrap().unwrap();
    assert!(matches!(
        state_rx.recv().await.unwrap(),
        Input::ServerConnected
    ));

    // A second connection takes over as the active session; the first
    // socket is dropped server-side and observes EOF. The old session's
    // own disconnect notification and the new session's connect
    // notification race each other, so accept either interleaving.
    let mut second = TcpStream::connect(addr).await.unwrap();
    let _ = read_frame(&mut second).await.unwrap().unwrap();
    let first_input = state_rx.recv().await.unwrap();
    let second_input = state_rx.recv().await.unwrap();
    assert!(matches!(first_input, Input::ServerDisconnected | Input::ServerConnected));
    assert!(matches!(second_input, Input::ServerDisconnected | Input::ServerConnected));
    assert_ne!(
        std::mem::discriminant(&first_input),
        std::mem::discriminant(&second_input)
    );

    let eof = read_frame(&mut first).await.unwrap();
    assert!(eof.is_none());

    cancel.cancel();
}
