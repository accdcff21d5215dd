//! End-to-end bridge tests against a mock upstream dialog service.
//!
//! The mock speaks the real binary protocol through the crate's own
//! codec: it answers the opening handshake, records every client frame
//! for assertions, and plays a scripted list of server frames once the
//! greeting arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use voice_bridge::audio::InputEncoding;
use voice_bridge::bridge::{build_router, AppState};
use voice_bridge::config::Config;
use voice_bridge::protocol::*;
use voice_bridge::session::Session;

const WAIT: Duration = Duration::from_secs(5);

type BrowserWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ═══════════════════════════════════════════════════════════════════════
//  Mock upstream
// ═══════════════════════════════════════════════════════════════════════

struct MockUpstream {
    addr: SocketAddr,
    /// Every frame the bridge sent us, in arrival order.
    seen: mpsc::UnboundedReceiver<Frame>,
}

/// Placeholder session id in scripted frames, replaced by the id the
/// bridge actually generated.
const SESSION_PLACEHOLDER: &str = "$SESSION";

/// Accept one connection, run the handshake, then send `script` after
/// the greeting arrives. FinishConnection is always acknowledged.
async fn spawn_mock_upstream(script: Vec<Frame>) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let mut ws = accept_async(stream).await.unwrap();
        let codec = FrameCodec::json();
        let raw = FrameCodec::raw();
        let mut session_id = String::new();

        loop {
            let msg = match ws.next().await {
                Some(Ok(msg)) => msg,
                _ => break,
            };
            let data = match msg {
                Message::Binary(data) => data,
                Message::Close(_) => break,
                _ => continue,
            };
            let (frame, _) = codec.decode(&data).unwrap();
            if let Some(sid) = &frame.session_id {
                if !sid.is_empty() {
                    session_id = sid.clone();
                }
            }
            let event = frame.event;
            let _ = seen_tx.send(frame);

            match event {
                Some(EVENT_START_CONNECTION) => {
                    let mut reply = Frame::control(
                        MessageKind::FullServer,
                        EVENT_CONNECTION_STARTED,
                        None,
                        b"{}".to_vec(),
                    );
                    reply.connect_id = Some("mock-connect".to_owned());
                    ws.send(Message::Binary(codec.encode(&reply).unwrap()))
                        .await
                        .unwrap();
                }
                Some(EVENT_START_SESSION) => {
                    let reply = Frame::control(
                        MessageKind::FullServer,
                        EVENT_SESSION_STARTED,
                        Some(&session_id),
                        br#"{"dialog_id":"d1"}"#.to_vec(),
                    );
                    ws.send(Message::Binary(codec.encode(&reply).unwrap()))
                        .await
                        .unwrap();
                }
                Some(EVENT_SAY_HELLO) => {
                    for scripted in &script {
                        let mut frame = scripted.clone();
                        if frame.session_id.as_deref() == Some(SESSION_PLACEHOLDER) {
                            frame.session_id = Some(session_id.clone());
                        }
                        let encoder = if frame.serialization == Serialization::Raw {
                            &raw
                        } else {
                            &codec
                        };
                        ws.send(Message::Binary(encoder.encode(&frame).unwrap()))
                            .await
                            .unwrap();
                    }
                }
                Some(EVENT_FINISH_CONNECTION) => {
                    let mut reply = Frame::control(
                        MessageKind::FullServer,
                        EVENT_CONNECTION_FINISHED,
                        None,
                        b"{}".to_vec(),
                    );
                    reply.connect_id = Some("mock-connect".to_owned());
                    let _ = ws.send(Message::Binary(codec.encode(&reply).unwrap())).await;
                }
                _ => {}
            }
        }
    });

    MockUpstream { addr, seen: seen_rx }
}

/// A service that refuses the very first handshake phase.
async fn spawn_rejecting_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };
        let mut ws = accept_async(stream).await.unwrap();
        let codec = FrameCodec::json();

        if let Some(Ok(Message::Binary(_))) = ws.next().await {
            let mut reply = Frame::control(
                MessageKind::FullServer,
                EVENT_CONNECTION_FAILED,
                None,
                br#"{"error":"bad credentials"}"#.to_vec(),
            );
            reply.connect_id = Some("mock-connect".to_owned());
            let _ = ws.send(Message::Binary(codec.encode(&reply).unwrap())).await;
        }
    });

    addr
}

// ═══════════════════════════════════════════════════════════════════════
//  Harness helpers
// ═══════════════════════════════════════════════════════════════════════

fn test_config(upstream: SocketAddr) -> Config {
    use clap::Parser;
    let mut config = Config::parse_from([
        "voice-bridge",
        "--app-id",
        "test-app",
        "--app-key",
        "test-key",
        "--access-key",
        "test-secret",
    ]);
    config.upstream_url = format!("ws://{upstream}");
    config
}

async fn spawn_app(upstream: SocketAddr) -> SocketAddr {
    let state = AppState {
        config: Arc::new(test_config(upstream)),
        shutdown: CancellationToken::new(),
    };
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect_browser(app: SocketAddr) -> BrowserWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{app}/ws/realtime"))
        .await
        .expect("browser failed to connect");
    ws
}

async fn recv_browser(ws: &mut BrowserWs) -> Option<Message> {
    match timeout(WAIT, ws.next()).await.expect("timed out reading from the bridge") {
        Some(result) => Some(result.expect("browser read failed")),
        None => None,
    }
}

async fn start_and_expect_ready(ws: &mut BrowserWs, start: &str) {
    ws.send(Message::Text(start.to_owned())).await.unwrap();
    match recv_browser(ws).await {
        Some(Message::Text(text)) => {
            let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(msg["type"], "ready", "first frame must be ready, got {text}");
        }
        other => panic!("expected ready frame, got {other:?}"),
    }
}

async fn expect_closed(ws: &mut BrowserWs) {
    loop {
        match recv_browser(ws).await {
            Some(Message::Close(_)) | None => return,
            Some(Message::Ping(_)) | Some(Message::Pong(_)) => continue,
            Some(other) => panic!("expected close, got {other:?}"),
        }
    }
}

async fn next_seen(mock: &mut MockUpstream) -> Frame {
    timeout(WAIT, mock.seen.recv())
        .await
        .expect("timed out waiting for an upstream frame")
        .expect("mock upstream gone")
}

fn scripted_event(event_id: i32, payload: &[u8]) -> Frame {
    Frame::control(
        MessageKind::FullServer,
        event_id,
        Some(SESSION_PLACEHOLDER),
        payload.to_vec(),
    )
}

fn scripted_audio(payload: Vec<u8>) -> Frame {
    let mut frame = Frame::control(MessageKind::AudioOnlyServer, 352, Some(SESSION_PLACEHOLDER), payload);
    frame.serialization = Serialization::Raw;
    frame
}

fn scripted_error(code: u32, payload: &[u8]) -> Frame {
    Frame {
        kind: MessageKind::Error,
        flags: 0,
        serialization: Serialization::Json,
        compression: Compression::None,
        event: None,
        session_id: None,
        connect_id: None,
        sequence: Some(0),
        error_code: Some(code),
        payload: payload.to_vec(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn browser_audio_reaches_upstream_resampled() {
    let mut mock = spawn_mock_upstream(Vec::new()).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    start_and_expect_ready(&mut ws, r#"{"type":"start","sampleRate":48000,"encoding":"f32le"}"#).await;

    // 240 samples of float32 silence at 48 kHz.
    ws.send(Message::Binary(vec![0u8; 960])).await.unwrap();

    let start_connection = next_seen(&mut mock).await;
    assert_eq!(start_connection.event, Some(EVENT_START_CONNECTION));

    let start_session = next_seen(&mut mock).await;
    assert_eq!(start_session.event, Some(EVENT_START_SESSION));
    let session_id = start_session.session_id.clone().unwrap();
    assert!(!session_id.is_empty());
    let payload: serde_json::Value = serde_json::from_slice(&start_session.payload).unwrap();
    assert_eq!(payload["tts"]["audio_config"]["format"], "pcm");

    let hello = next_seen(&mut mock).await;
    assert_eq!(hello.event, Some(EVENT_SAY_HELLO));
    let greeting: serde_json::Value = serde_json::from_slice(&hello.payload).unwrap();
    assert_eq!(greeting["content"], "你好，我是小智，有什么可以帮你的吗？");

    let audio = next_seen(&mut mock).await;
    assert_eq!(audio.kind, MessageKind::AudioOnlyClient);
    assert_eq!(audio.event, Some(EVENT_USER_QUERY));
    assert_eq!(audio.session_id.as_deref(), Some(session_id.as_str()));
    // 240 samples at 48 kHz become 80 samples of s16 at 16 kHz.
    assert_eq!(audio.payload.len(), 160);
    assert!(audio.payload.iter().all(|&b| b == 0));
}

#[tokio::test]
async fn synthesized_audio_is_forwarded_bit_identical() {
    let pcm: Vec<u8> = (0..4800u32).map(|i| (i % 251) as u8).collect();
    let mock = spawn_mock_upstream(vec![scripted_audio(pcm.clone())]).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    start_and_expect_ready(&mut ws, r#"{"type":"start"}"#).await;

    match recv_browser(&mut ws).await {
        Some(Message::Binary(forwarded)) => assert_eq!(forwarded, pcm),
        other => panic!("expected one binary audio frame, got {other:?}"),
    }
}

#[tokio::test]
async fn dialog_events_are_forwarded_verbatim() {
    let script = vec![scripted_event(550, "{\"content\":\"你好\"}".as_bytes())];
    let mock = spawn_mock_upstream(script).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    // The SessionStarted (150) handshake reply must not leak to the
    // browser: the first frame is ready, the second is event 550.
    start_and_expect_ready(&mut ws, r#"{"type":"start"}"#).await;

    match recv_browser(&mut ws).await {
        Some(Message::Text(text)) => {
            let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(msg["type"], "event");
            assert_eq!(msg["event_id"], 550);
            assert_eq!(msg["payload"]["content"], "你好");
        }
        other => panic!("expected an event frame, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_finishes_session_then_connection() {
    let mut mock = spawn_mock_upstream(Vec::new()).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    start_and_expect_ready(&mut ws, r#"{"type":"start"}"#).await;
    ws.send(Message::Text(r#"{"type":"stop"}"#.to_owned())).await.unwrap();

    expect_closed(&mut ws).await;

    let mut events = Vec::new();
    for _ in 0..5 {
        events.push(next_seen(&mut mock).await.event);
    }
    assert_eq!(
        events,
        vec![
            Some(EVENT_START_CONNECTION),
            Some(EVENT_START_SESSION),
            Some(EVENT_SAY_HELLO),
            Some(EVENT_FINISH_SESSION),
            Some(EVENT_FINISH_CONNECTION),
        ]
    );
}

#[tokio::test]
async fn abrupt_browser_close_still_finishes_upstream() {
    let mut mock = spawn_mock_upstream(Vec::new()).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    start_and_expect_ready(&mut ws, r#"{"type":"start"}"#).await;
    drop(ws);

    let mut events = Vec::new();
    for _ in 0..5 {
        events.push(next_seen(&mut mock).await.event);
    }
    assert_eq!(events[3], Some(EVENT_FINISH_SESSION));
    assert_eq!(events[4], Some(EVENT_FINISH_CONNECTION));
}

#[tokio::test]
async fn upstream_error_closes_the_browser_socket() {
    let script = vec![scripted_error(45_000_001, br#"{"error":"quota exceeded"}"#)];
    let mock = spawn_mock_upstream(script).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    start_and_expect_ready(&mut ws, r#"{"type":"start"}"#).await;
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn close_sentinel_ends_the_session_cleanly() {
    let script = vec![scripted_event(EVENT_SESSION_FINISHED, b"{}")];
    let mock = spawn_mock_upstream(script).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    start_and_expect_ready(&mut ws, r#"{"type":"start"}"#).await;
    // No error frame: the next thing the browser sees is the close.
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn unsupported_encoding_is_rejected_without_dialing_upstream() {
    let mut mock = spawn_mock_upstream(Vec::new()).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    ws.send(Message::Text(
        r#"{"type":"start","sampleRate":48000,"encoding":"opus"}"#.to_owned(),
    ))
    .await
    .unwrap();

    match recv_browser(&mut ws).await {
        Some(Message::Text(text)) => {
            let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(msg["type"], "error");
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
    expect_closed(&mut ws).await;

    assert!(
        mock.seen.try_recv().is_err(),
        "upstream must not be contacted for a rejected start frame"
    );
}

#[tokio::test]
async fn binary_first_frame_is_a_protocol_violation() {
    let mock = spawn_mock_upstream(Vec::new()).await;
    let app = spawn_app(mock.addr).await;
    let mut ws = connect_browser(app).await;

    ws.send(Message::Binary(vec![0u8; 32])).await.unwrap();

    match recv_browser(&mut ws).await {
        Some(Message::Text(text)) => {
            let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(msg["type"], "error");
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn rejected_handshake_surfaces_as_error_before_ready() {
    let upstream = spawn_rejecting_upstream().await;
    let app = spawn_app(upstream).await;
    let mut ws = connect_browser(app).await;

    ws.send(Message::Text(r#"{"type":"start"}"#.to_owned())).await.unwrap();

    match recv_browser(&mut ws).await {
        Some(Message::Text(text)) => {
            let msg: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(msg["type"], "error", "no ready may be sent, got {text}");
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn event_channel_overflow_drops_beyond_capacity_in_order() {
    // 100 rapid events with nobody draining the event channel, then the
    // close sentinel. Exactly the first 64 must survive, in order.
    let mut script: Vec<Frame> = (0..100)
        .map(|i| scripted_event(550, format!("{{\"i\":{i}}}").as_bytes()))
        .collect();
    script.push(scripted_event(EVENT_SESSION_FINISHED, b"{}"));

    let mock = spawn_mock_upstream(script).await;
    let config = test_config(mock.addr);
    let parent = CancellationToken::new();

    let (session, mut audio_rx, mut event_rx) =
        Session::open(&config, &parent, 48_000, InputEncoding::F32le)
            .await
            .expect("session open failed");

    // The reader has exited once the audio channel closes; only then is
    // the event channel's content final.
    let closed = timeout(WAIT, audio_rx.recv()).await.expect("reader did not exit");
    assert!(closed.is_none());

    let mut received = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        received.push(event);
    }
    assert_eq!(received.len(), 64, "exactly the channel capacity is retained");
    for (i, event) in received.iter().enumerate() {
        let payload: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(payload["i"], i as u64, "events must stay in arrival order");
    }

    assert!(session.err().is_none());
    session.close().await;
}

#[tokio::test]
async fn upstream_error_is_recorded_as_the_sticky_error() {
    let script = vec![scripted_error(45_000_001, br#"{"error":"quota"}"#)];
    let mock = spawn_mock_upstream(script).await;
    let config = test_config(mock.addr);
    let parent = CancellationToken::new();

    let (session, mut audio_rx, _event_rx) =
        Session::open(&config, &parent, 16_000, InputEncoding::S16le)
            .await
            .expect("session open failed");

    let closed = timeout(WAIT, audio_rx.recv()).await.expect("reader did not exit");
    assert!(closed.is_none());

    let err = session.err().expect("sticky error must be set");
    assert!(err.to_string().contains("45000001"), "{err}");

    // Audio pushed after the failure reports the same first error.
    let err = session.push_audio(&[0u8; 320]).await.unwrap_err();
    assert!(err.to_string().contains("45000001"), "{err}");

    session.close().await;
}

#[tokio::test]
async fn healthz_responds_ok() {
    let mock = spawn_mock_upstream(Vec::new()).await;
    let app = spawn_app(mock.addr).await;

    let mut stream = TcpStream::connect(app).await.unwrap();
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        format!("GET /healthz HTTP/1.1\r\nHost: {app}\r\nConnection: close\r\n\r\n").as_bytes(),
    )
    .await
    .unwrap();

    let mut response = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("ok"), "{response}");
}
