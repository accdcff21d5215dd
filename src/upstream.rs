/// Upstream dialog-service client.
///
/// Owns exactly one WebSocket to the realtime dialog endpoint and
/// sequences its lifecycle:
///
/// ```text
///   StartConnection(1) ──▶      ◀── ConnectionStarted(50)
///   StartSession(100)  ──▶      ◀── SessionStarted(150)
///   SayHello(300)      ──▶
///   UserQuery(200) audio ─▶     ◀── server frames (audio / events)
///   FinishSession(102) ──▶
///   FinishConnection(2) ─▶      ◀── ConnectionFinished(52)
/// ```
///
/// A client is never reopened; every user session constructs a fresh
/// one. Any transport or decode failure is terminal.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::*;

/// Budget for dial plus both handshake phases.
const OPEN_TIMEOUT: Duration = Duration::from_secs(15);
/// Per-frame write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget for the FinishSession / FinishConnection farewell.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to reach dialog service: {0}")]
    Dial(String),
    #[error("dialog service rejected the handshake: expected event {expected}, got {got}")]
    HandshakeRejected { expected: i32, got: String },
    #[error("upstream transport failed: {0}")]
    Transport(String),
    #[error("malformed upstream frame: {0}")]
    Decode(#[from] ProtocolError),
    #[error("unsupported websocket frame from upstream")]
    UnsupportedTransportFrame,
    #[error("dialog service error {code}: {detail}")]
    Service { code: u32, detail: String },
}

// ═══════════════════════════════════════════════════════════════════════
//  Client
// ═══════════════════════════════════════════════════════════════════════

pub struct UpstreamClient {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    json: FrameCodec,
    raw: FrameCodec,
    session_id: String,
    connect_id: String,
    closed: AtomicBool,
}

impl UpstreamClient {
    /// Dial the configured endpoint and drive the two-phase opening
    /// handshake, all within one 15-second budget.
    pub async fn connect(cfg: &Config) -> Result<Self, UpstreamError> {
        match timeout(OPEN_TIMEOUT, Self::open(cfg)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Dial(
                "timed out opening the upstream connection".to_owned(),
            )),
        }
    }

    async fn open(cfg: &Config) -> Result<Self, UpstreamError> {
        let connect_id = Uuid::new_v4().to_string();
        let url = Url::parse(&cfg.upstream_url)
            .map_err(|e| UpstreamError::Dial(format!("invalid upstream url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| UpstreamError::Dial("upstream url has no host".to_owned()))?;
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        let request = Request::builder()
            .uri(&cfg.upstream_url)
            .header("Host", host_header)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .header("X-Api-App-ID", &cfg.app_id)
            .header("X-Api-App-Key", &cfg.app_key)
            .header("X-Api-Access-Key", &cfg.access_key)
            .header("X-Api-Resource-Id", &cfg.resource_id)
            .header("X-Api-Connect-Id", &connect_id)
            .body(())
            .map_err(|e| UpstreamError::Dial(format!("failed to build request: {e}")))?;

        let (mut ws, response) = connect_async(request)
            .await
            .map_err(|e| UpstreamError::Dial(e.to_string()))?;

        let logid = response
            .headers()
            .get("X-Tt-Logid")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info!(connect_id = %connect_id, logid = logid, "upstream websocket connected");

        let json = FrameCodec::json();
        match Self::handshake(&mut ws, cfg, &json).await {
            Ok(session_id) => {
                let (sink, stream) = ws.split();
                Ok(UpstreamClient {
                    sink: Mutex::new(sink),
                    stream: Mutex::new(stream),
                    json,
                    raw: FrameCodec::raw(),
                    session_id,
                    connect_id,
                    closed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                let _ = ws.close(None).await;
                Err(e)
            }
        }
    }

    /// Phase 1: StartConnection → ConnectionStarted.
    /// Phase 2: StartSession → SessionStarted. Anything else, including
    /// the session-closed sentinels, rejects the handshake.
    async fn handshake(
        ws: &mut WsStream,
        cfg: &Config,
        json: &FrameCodec,
    ) -> Result<String, UpstreamError> {
        let start = Frame::control(
            MessageKind::FullClient,
            EVENT_START_CONNECTION,
            None,
            b"{}".to_vec(),
        );
        ws.send(Message::Binary(json.encode(&start)?))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let started = expect_server_event(ws, json, EVENT_CONNECTION_STARTED).await?;
        debug!(connect_id = ?started.connect_id, "upstream connection started");

        let session_id = Uuid::new_v4().to_string();
        let payload = cfg.session_payload().to_string().into_bytes();
        let start_session = Frame::control(
            MessageKind::FullClient,
            EVENT_START_SESSION,
            Some(&session_id),
            payload,
        );
        ws.send(Message::Binary(json.encode(&start_session)?))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        expect_server_event(ws, json, EVENT_SESSION_STARTED).await?;
        info!(session_id = %session_id, "upstream dialog session started");

        Ok(session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connect_id(&self) -> &str {
        &self.connect_id
    }

    /// Deliver the greeting. Used exactly once, right after connect.
    pub async fn say_hello(&self, text: &str) -> Result<(), UpstreamError> {
        let payload = json!({ "content": text }).to_string().into_bytes();
        self.send_json_event(EVENT_SAY_HELLO, true, payload).await
    }

    /// Ship one already-converted 16 kHz mono s16le chunk upstream.
    pub async fn send_audio(&self, pcm: &[u8]) -> Result<(), UpstreamError> {
        let frame = Frame::user_audio(&self.session_id, pcm.to_vec());
        let bytes = self.raw.encode(&frame)?;
        self.send(bytes).await
    }

    /// Read the next frame, verbatim. Event ids are not interpreted
    /// here; the session reader dispatches on them.
    pub async fn read(&self) -> Result<Frame, UpstreamError> {
        let mut stream = self.stream.lock().await;
        next_frame(&mut *stream, &self.json).await
    }

    /// Idempotent farewell: FinishSession, FinishConnection, then wait
    /// briefly for ConnectionFinished. Failures are logged and the
    /// socket is closed regardless.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self
            .send_json_event(EVENT_FINISH_SESSION, true, b"{}".to_vec())
            .await
        {
            warn!(error = %e, "failed to send FinishSession");
        }
        if let Err(e) = self
            .send_json_event(EVENT_FINISH_CONNECTION, false, b"{}".to_vec())
            .await
        {
            warn!(error = %e, "failed to send FinishConnection");
        }

        let finished = async {
            loop {
                let frame = self.read().await?;
                if frame.kind == MessageKind::FullServer
                    && frame.event == Some(EVENT_CONNECTION_FINISHED)
                {
                    return Ok::<_, UpstreamError>(());
                }
                debug!(kind = %frame.kind, event = ?frame.event, "draining frame during close");
            }
        };
        match timeout(CLOSE_TIMEOUT, finished).await {
            Ok(Ok(())) => debug!(session_id = %self.session_id, "upstream connection finished"),
            Ok(Err(e)) => warn!(error = %e, "upstream close handshake failed, continuing"),
            Err(_) => warn!("upstream close handshake timed out, continuing"),
        }

        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }

    async fn send_json_event(
        &self,
        event: i32,
        with_session: bool,
        payload: Vec<u8>,
    ) -> Result<(), UpstreamError> {
        let session_id = with_session.then_some(self.session_id.as_str());
        let frame = Frame::control(MessageKind::FullClient, event, session_id, payload);
        let bytes = self.json.encode(&frame)?;
        self.send(bytes).await
    }

    /// All writes funnel through here: one mutex, one deadline.
    async fn send(&self, bytes: Vec<u8>) -> Result<(), UpstreamError> {
        let mut sink = self.sink.lock().await;
        match timeout(WRITE_TIMEOUT, sink.send(Message::Binary(bytes))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(UpstreamError::Transport(e.to_string())),
            Err(_) => Err(UpstreamError::Transport("upstream write timed out".to_owned())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transport helpers
// ═══════════════════════════════════════════════════════════════════════

/// Pull the next protocol frame off a websocket stream. Ping/Pong are
/// transport noise and skipped; a close frame ends the session.
async fn next_frame<S>(stream: &mut S, codec: &FrameCodec) -> Result<Frame, UpstreamError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = stream
            .next()
            .await
            .ok_or_else(|| UpstreamError::Transport("upstream connection closed".to_owned()))?
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        match msg {
            Message::Binary(data) => return Ok(codec.decode(&data)?.0),
            Message::Text(text) => return Ok(codec.decode(text.as_bytes())?.0),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                return Err(UpstreamError::Transport(format!(
                    "upstream sent close frame: {frame:?}"
                )))
            }
            Message::Frame(_) => return Err(UpstreamError::UnsupportedTransportFrame),
        }
    }
}

/// The handshake is strict: the very next frame must be the expected
/// FullServer event.
async fn expect_server_event(
    ws: &mut WsStream,
    codec: &FrameCodec,
    expected: i32,
) -> Result<Frame, UpstreamError> {
    let frame = next_frame(ws, codec).await?;
    if frame.kind != MessageKind::FullServer || frame.event != Some(expected) {
        return Err(UpstreamError::HandshakeRejected {
            expected,
            got: format!("{} event {:?}", frame.kind, frame.event),
        });
    }
    Ok(frame)
}
