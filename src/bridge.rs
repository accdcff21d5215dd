/// Browser-facing WebSocket bridge.
///
/// ```text
///  browser ──text {"type":"start",...}──▶ handshake ─▶ Session::open
///          ◀─────text {"type":"ready"}──┘
///  browser ──binary PCM──▶ frontend pump ─▶ session.push_audio
///          ◀─binary TTS──┐
///          ◀─text events─┴─ backend pump ◀─ session channels
/// ```
///
/// Two pumps run per connection; the first to finish tears the session
/// down. Every write to the browser goes through one mutex-guarded
/// writer with a per-frame deadline.
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::InputEncoding;
use crate::config::Config;
use crate::session::{Session, SessionEvent};

/// Deadline for the browser's opening `start` frame.
const START_TIMEOUT: Duration = Duration::from_secs(15);
/// Per-message read deadline while streaming.
const BROWSER_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-frame write deadline toward the browser.
const BROWSER_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

// ═══════════════════════════════════════════════════════════════════════
//  Router
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/realtime", get(ws_realtime))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_realtime(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        match handle_realtime(socket, state).await {
            Ok(()) => debug!("realtime session finished"),
            Err(e) => warn!(error = %e, "realtime session ended with error"),
        }
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Wire messages
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Start(StartParams),
    Stop,
}

#[derive(Debug, Deserialize)]
struct StartParams {
    #[serde(rename = "sampleRate", default = "default_sample_rate")]
    sample_rate: u32,
    #[serde(default = "default_encoding")]
    encoding: String,
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_encoding() -> String {
    "f32le".to_owned()
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerMessage<'a> {
    Ready,
    Error { message: &'a str },
}

/// Envelope for a forwarded dialog event. The payload is embedded as a
/// JSON subdocument, never re-encoded; non-JSON payloads degrade to a
/// string so malformed upstream data cannot corrupt the envelope.
fn render_event(event: &SessionEvent) -> String {
    #[derive(Serialize)]
    struct Envelope<'a> {
        r#type: &'static str,
        event_id: i32,
        payload: &'a RawValue,
    }

    let text = if event.payload.is_empty() {
        "null".into()
    } else {
        String::from_utf8_lossy(&event.payload)
    };

    match serde_json::from_str::<&RawValue>(&text) {
        Ok(payload) => serde_json::to_string(&Envelope {
            r#type: "event",
            event_id: event.event_id,
            payload,
        })
        .unwrap_or_default(),
        Err(_) => {
            debug!(event_id = event.event_id, "event payload is not JSON, wrapping as string");
            serde_json::json!({
                "type": "event",
                "event_id": event.event_id,
                "payload": text,
            })
            .to_string()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Browser writer
// ═══════════════════════════════════════════════════════════════════════

/// The single funnel for writes to the browser socket.
struct BrowserWriter {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl BrowserWriter {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        BrowserWriter { sink: Mutex::new(sink) }
    }

    async fn send(&self, msg: Message) -> anyhow::Result<()> {
        let mut sink = self.sink.lock().await;
        timeout(BROWSER_WRITE_TIMEOUT, sink.send(msg))
            .await
            .context("browser write timed out")?
            .context("browser write failed")
    }

    async fn send_json(&self, msg: &ServerMessage<'_>) -> anyhow::Result<()> {
        let text = serde_json::to_string(msg).context("serializing server message")?;
        self.send(Message::Text(text)).await
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Connection lifecycle
// ═══════════════════════════════════════════════════════════════════════

async fn handle_realtime(socket: WebSocket, state: AppState) -> anyhow::Result<()> {
    let (sink, mut receiver) = socket.split();
    let writer = Arc::new(BrowserWriter::new(sink));

    // Opening handshake: exactly one text `start` frame. Nothing is
    // dialed upstream until it parses.
    let (sample_rate, encoding) = match read_start(&mut receiver).await {
        Ok(params) => params,
        Err(e) => {
            let _ = writer
                .send_json(&ServerMessage::Error { message: &e.to_string() })
                .await;
            writer.close().await;
            return Err(e.context("browser protocol violation"));
        }
    };

    let opened = Session::open(&state.config, &state.shutdown, sample_rate, encoding).await;
    let (session, audio_rx, event_rx) = match opened {
        Ok(parts) => parts,
        Err(e) => {
            let _ = writer
                .send_json(&ServerMessage::Error { message: &e.to_string() })
                .await;
            writer.close().await;
            return Err(anyhow::Error::new(e).context("failed to open upstream session"));
        }
    };
    let session = Arc::new(session);

    if let Err(e) = writer.send_json(&ServerMessage::Ready).await {
        session.close().await;
        writer.close().await;
        return Err(e);
    }
    info!(sample_rate, encoding = %encoding, "browser session ready");

    let mut frontend = tokio::spawn(frontend_pump(receiver, session.clone()));
    let mut backend = tokio::spawn(backend_pump(
        audio_rx,
        event_rx,
        writer.clone(),
        session.clone(),
    ));

    // First pump to return wins; the other is torn down with the
    // session.
    let outcome = tokio::select! {
        result = &mut frontend => {
            backend.abort();
            result
        }
        result = &mut backend => {
            frontend.abort();
            result
        }
    };

    session.close().await;
    writer.close().await;
    match outcome {
        Ok(result) => result,
        Err(join_error) => Err(anyhow::Error::new(join_error).context("pump task failed")),
    }
}

/// Read and validate the opening `start` frame.
async fn read_start(
    receiver: &mut SplitStream<WebSocket>,
) -> anyhow::Result<(u32, InputEncoding)> {
    let msg = timeout(START_TIMEOUT, receiver.next())
        .await
        .context("timed out waiting for the start frame")?
        .context("browser closed before sending a start frame")?
        .context("browser transport failed before start")?;

    let text = match msg {
        Message::Text(text) => text,
        other => anyhow::bail!("first frame must be a text start frame, got {other:?}"),
    };

    let params = match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::Start(params)) => params,
        Ok(other) => anyhow::bail!("first frame must be start, got {other:?}"),
        Err(e) => anyhow::bail!("malformed start frame: {e}"),
    };

    let encoding = InputEncoding::from_str(&params.encoding)?;
    Ok((params.sample_rate, encoding))
}

// ═══════════════════════════════════════════════════════════════════════
//  Pumps
// ═══════════════════════════════════════════════════════════════════════

/// Browser → session. Binary frames are microphone audio; text frames
/// are control. Exits on `stop`, socket close, read error, or deadline.
async fn frontend_pump(
    mut receiver: SplitStream<WebSocket>,
    session: Arc<Session>,
) -> anyhow::Result<()> {
    let mut chunks: u64 = 0;

    loop {
        let msg = match timeout(BROWSER_READ_TIMEOUT, receiver.next()).await {
            Err(_) => anyhow::bail!("browser went silent past the read deadline"),
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(chunks, "frontend pump: browser read failed");
                return Err(anyhow::Error::new(e).context("browser read failed"));
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Binary(pcm) => {
                session.push_audio(&pcm).await?;
                chunks += 1;
            }
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Stop) => {
                    info!(chunks, "browser requested stop");
                    break;
                }
                _ => debug!(frame = %text, "ignoring unknown text frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    debug!(chunks, "frontend pump exiting");
    Ok(())
}

/// Session → browser. Races the audio and event channels; per-channel
/// ordering is preserved, cross-channel ordering is not promised.
async fn backend_pump(
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    mut event_rx: mpsc::Receiver<SessionEvent>,
    writer: Arc<BrowserWriter>,
    session: Arc<Session>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            chunk = audio_rx.recv() => match chunk {
                Some(pcm) => writer.send(Message::Binary(pcm)).await?,
                None => break,
            },
            event = event_rx.recv() => match event {
                Some(event) => writer.send(Message::Text(render_event(&event))).await?,
                None => break,
            },
        }
    }

    debug!("backend pump exiting");
    match session.err() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
