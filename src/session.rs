/// Per-user session: one upstream client, one PCM pipeline, one reader
/// task, and the two bounded outbound channels the browser handler
/// consumes.
///
/// ```text
///                 ┌───────────────────────────────┐
///  push_audio ──▶ │ pipeline ─▶ client.send_audio │──▶ upstream
///                 │                               │
///  audio() ◀──────│◀─ reader ◀─── client.read ────│◀── upstream
///  events() ◀─────│◀─┘  (dispatch by frame kind)  │
///                 └───────────────────────────────┘
/// ```
///
/// The reader owns both channel senders and drops them on exit, so the
/// handler observes end-of-stream on both. The first terminal failure
/// is parked in a write-once slot; later failures are observed and
/// discarded.
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::{AudioError, InputEncoding, PcmPipeline};
use crate::config::Config;
use crate::protocol::{MessageKind, EVENT_SESSION_FAILED, EVENT_SESSION_FINISHED};
use crate::upstream::{UpstreamClient, UpstreamError};

/// Synthesized-audio chunks buffered toward the browser. A full channel
/// blocks the reader; the service paces audio, so that is safe.
pub const AUDIO_CHANNEL_CAPACITY: usize = 64;
/// Dialog events buffered toward the browser. Advisory, dropped when
/// full rather than ever stalling audio.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("session closed")]
    Closed,
}

/// Write-once slot for the first terminal failure of a session.
#[derive(Clone, Default)]
struct StickyError(Arc<std::sync::Mutex<Option<SessionError>>>);

impl StickyError {
    fn set(&self, err: SessionError) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        } else {
            debug!(error = %err, "suppressing follow-up session error");
        }
    }

    fn get(&self) -> Option<SessionError> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

/// A dialog event forwarded verbatim to the browser.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub event_id: i32,
    pub payload: Vec<u8>,
}

pub struct Session {
    client: Arc<UpstreamClient>,
    pipeline: Mutex<PcmPipeline>,
    cancel: CancellationToken,
    error: StickyError,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect upstream, greet, and launch the reader. Returns the
    /// session together with the receive ends of its audio and event
    /// channels. Failures release whatever was built so far.
    pub async fn open(
        cfg: &Config,
        parent: &CancellationToken,
        sample_rate: u32,
        encoding: InputEncoding,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<SessionEvent>), SessionError> {
        let pipeline = PcmPipeline::new(sample_rate, encoding)?;
        let client = Arc::new(UpstreamClient::connect(cfg).await?);

        if let Err(e) = client.say_hello(&cfg.greeting()).await {
            client.close().await;
            return Err(e.into());
        }

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = parent.child_token();
        let error = StickyError::default();

        let reader = tokio::spawn(reader_loop(
            client.clone(),
            cancel.clone(),
            error.clone(),
            audio_tx,
            event_tx,
        ));

        Ok((
            Session {
                client,
                pipeline: Mutex::new(pipeline),
                cancel,
                error,
                reader: Mutex::new(Some(reader)),
            },
            audio_rx,
            event_rx,
        ))
    }

    /// Convert one browser chunk and ship it upstream. Backpressure to
    /// the browser is simply this call not returning: there is no queue
    /// between the pipeline and the socket.
    pub async fn push_audio(&self, input: &[u8]) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(self.error.get().unwrap_or(SessionError::Closed));
        }

        let pcm = match self.pipeline.lock().await.process(input) {
            Ok(pcm) => pcm,
            Err(e) => return Err(self.fail(e.into())),
        };
        if pcm.is_empty() {
            return Ok(());
        }

        match self.client.send_audio(&pcm).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Record a terminal failure and trip the cancellation signal.
    fn fail(&self, err: SessionError) -> SessionError {
        self.error.set(err.clone());
        self.cancel.cancel();
        err
    }

    /// First terminal failure, if any.
    pub fn err(&self) -> Option<SessionError> {
        self.error.get()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel, join the reader, release the upstream socket.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.reader.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "session reader panicked");
            }
        }
        self.client.close().await;
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Reader task
// ═══════════════════════════════════════════════════════════════════════

async fn reader_loop(
    client: Arc<UpstreamClient>,
    cancel: CancellationToken,
    error: StickyError,
    audio_tx: mpsc::Sender<Vec<u8>>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    let mut audio_chunks: u64 = 0;
    let mut events_forwarded: u64 = 0;
    let mut events_dropped: u64 = 0;

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.read() => match result {
                Ok(frame) => frame,
                Err(e) => {
                    if !cancel.is_cancelled() {
                        error.set(e.into());
                    }
                    cancel.cancel();
                    break;
                }
            },
        };

        match frame.kind {
            // Synthesized speech: hand the owned payload over, blocking
            // if the browser is slow (the service paces audio anyway).
            MessageKind::AudioOnlyServer => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = audio_tx.send(frame.payload) => {
                        if sent.is_err() {
                            break;
                        }
                        audio_chunks += 1;
                    }
                }
            }

            MessageKind::FullServer => match frame.event {
                Some(EVENT_SESSION_FINISHED) | Some(EVENT_SESSION_FAILED) => {
                    info!(event = ?frame.event, "dialog session closed by the service");
                    break;
                }
                Some(event_id) => {
                    let event = SessionEvent {
                        event_id,
                        payload: frame.payload,
                    };
                    match event_tx.try_send(event) {
                        Ok(()) => events_forwarded += 1,
                        Err(TrySendError::Full(_)) => {
                            events_dropped += 1;
                            warn!(event_id, "event channel full, dropping dialog event");
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
                None => debug!("server frame without event id, ignoring"),
            },

            MessageKind::Error => {
                let code = frame.error_code.unwrap_or(0);
                let detail = String::from_utf8_lossy(&frame.payload).into_owned();
                error.set(UpstreamError::Service { code, detail }.into());
                cancel.cancel();
                break;
            }

            other => info!(kind = %other, "unexpected frame kind from upstream, ignoring"),
        }
    }

    info!(
        audio_chunks,
        events_forwarded, events_dropped, "upstream reader exiting"
    );
    // audio_tx and event_tx drop here: both channels close together
    // from the consumer's point of view.
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
