/// Upstream dialog-service binary protocol.
///
/// Frame layout (all multi-byte integers big-endian):
/// ```text
/// ┌─────────────┬─────────────┬──────────────┬───────────────────┐
/// │ Byte 0      │ Byte 1      │ Byte 2       │ Byte 3..hdr*4     │
/// │ ver │ hdr   │ kind │ flags│ serial │ comp│ padding           │
/// │ (4b) │ (4b) │ (4b) │ (4b) │ (4b)  │ (4b) │                   │
/// └─────────────┴─────────────┴──────────────┴───────────────────┘
/// ```
/// followed by optional body sections in a fixed order, each present
/// only when the header says so:
///
///   event id (i32)            — flags carry WITH_EVENT
///   connect id (u32 len + str)— event is 50 / 51 / 52
///   session id (u32 len + str)— event-bearing, not 1 / 2 / 50 / 51 / 52
///   sequence (i32)            — codec built with contains_sequence
///   error code (u32)          — Error frames
///   payload (u32 len + bytes) — always
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Only protocol version currently on the wire.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size in 32-bit words. 1 word = the 4-byte fixed header.
pub const DEFAULT_HEADER_SIZE: u8 = 0b0001;

// ── Flags (low nibble of byte 1) ───────────────────────────────────────

/// Frame carries a positive sequence number.
pub const FLAG_POSITIVE_SEQUENCE: u8 = 0b0001;
/// Last frame of a stream.
pub const FLAG_LAST_PACKET: u8 = 0b0010;
/// Frame carries an event id (and session/connect id where applicable).
pub const FLAG_WITH_EVENT: u8 = 0b0100;

// ── Event ids ──────────────────────────────────────────────────────────

pub const EVENT_START_CONNECTION: i32 = 1;
pub const EVENT_FINISH_CONNECTION: i32 = 2;
pub const EVENT_CONNECTION_STARTED: i32 = 50;
pub const EVENT_CONNECTION_FAILED: i32 = 51;
pub const EVENT_CONNECTION_FINISHED: i32 = 52;
pub const EVENT_START_SESSION: i32 = 100;
pub const EVENT_FINISH_SESSION: i32 = 102;
pub const EVENT_SESSION_STARTED: i32 = 150;
pub const EVENT_SESSION_FINISHED: i32 = 152;
pub const EVENT_SESSION_FAILED: i32 = 153;
pub const EVENT_USER_QUERY: i32 = 200;
pub const EVENT_SAY_HELLO: i32 = 300;

/// Connection-scoped server events carry a connect id instead of a
/// session id.
fn event_has_connect_id(event: i32) -> bool {
    matches!(
        event,
        EVENT_CONNECTION_STARTED | EVENT_CONNECTION_FAILED | EVENT_CONNECTION_FINISHED
    )
}

/// Client connection-lifecycle events carry neither id.
fn event_has_session_id(event: i32) -> bool {
    !matches!(event, EVENT_START_CONNECTION | EVENT_FINISH_CONNECTION)
        && !event_has_connect_id(event)
}

// ═══════════════════════════════════════════════════════════════════════
//  Enums
// ═══════════════════════════════════════════════════════════════════════

/// Message kind, high nibble of byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    FullClient,
    AudioOnlyClient,
    FullServer,
    AudioOnlyServer,
    Error,
}

impl MessageKind {
    pub fn nibble(self) -> u8 {
        match self {
            MessageKind::FullClient => 0b0001,
            MessageKind::AudioOnlyClient => 0b0010,
            MessageKind::FullServer => 0b1001,
            MessageKind::AudioOnlyServer => 0b1011,
            MessageKind::Error => 0b1111,
        }
    }

    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0b0001 => Some(MessageKind::FullClient),
            0b0010 => Some(MessageKind::AudioOnlyClient),
            0b1001 => Some(MessageKind::FullServer),
            0b1011 => Some(MessageKind::AudioOnlyServer),
            0b1111 => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// Payload serialization, high nibble of byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    Raw,
    Json,
    /// Reserved by the service; never emitted by this bridge.
    Thrift,
}

impl Serialization {
    pub fn nibble(self) -> u8 {
        match self {
            Serialization::Raw => 0b0000,
            Serialization::Json => 0b0001,
            Serialization::Thrift => 0b0011,
        }
    }

    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0b0000 => Some(Serialization::Raw),
            0b0001 => Some(Serialization::Json),
            0b0011 => Some(Serialization::Thrift),
            _ => None,
        }
    }
}

/// Payload compression, low nibble of byte 2. Only `None` is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
}

impl Compression {
    pub fn nibble(self) -> u8 {
        0b0000
    }

    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0b0000 => Some(Compression::None),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::FullClient => write!(f, "full_client"),
            MessageKind::AudioOnlyClient => write!(f, "audio_only_client"),
            MessageKind::FullServer => write!(f, "full_server"),
            MessageKind::AudioOnlyServer => write!(f, "audio_only_server"),
            MessageKind::Error => write!(f, "error"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unrecognized message kind nibble {0:#06b}")]
    MalformedKind(u8),
    #[error("unsupported serialization nibble {0:#06b}")]
    UnsupportedSerialization(u8),
    #[error("unsupported compression nibble {0:#06b}")]
    UnsupportedCompression(u8),
    #[error("payload of {0} bytes exceeds the 32-bit length prefix")]
    PayloadTooLarge(usize),
    #[error("frame truncated: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("unknown protocol version {0}")]
    UnknownVersion(u8),
    #[error("reserved header size {0}")]
    UnknownHeaderSize(u8),
}

// ═══════════════════════════════════════════════════════════════════════
//  Frame
// ═══════════════════════════════════════════════════════════════════════

/// One decoded (or to-be-encoded) protocol frame.
///
/// Presence of every optional field on the wire is derived from the
/// header: `event`, `session_id` and `connect_id` exist only on
/// event-bearing frames, `error_code` only on [`MessageKind::Error`]
/// frames, `sequence` only when the codec carries sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub flags: u8,
    pub serialization: Serialization,
    pub compression: Compression,
    pub event: Option<i32>,
    pub session_id: Option<String>,
    pub connect_id: Option<String>,
    pub sequence: Option<i32>,
    pub error_code: Option<u32>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Event-bearing control frame with a JSON payload.
    pub fn control(kind: MessageKind, event: i32, session_id: Option<&str>, payload: Vec<u8>) -> Self {
        Frame {
            kind,
            flags: FLAG_WITH_EVENT,
            serialization: Serialization::Json,
            compression: Compression::None,
            event: Some(event),
            session_id: session_id.map(str::to_owned),
            connect_id: None,
            sequence: Some(0),
            error_code: None,
            payload,
        }
    }

    /// Client audio frame: raw PCM payload tagged `UserQuery`.
    pub fn user_audio(session_id: &str, pcm: Vec<u8>) -> Self {
        Frame {
            kind: MessageKind::AudioOnlyClient,
            flags: FLAG_WITH_EVENT,
            serialization: Serialization::Raw,
            compression: Compression::None,
            event: Some(EVENT_USER_QUERY),
            session_id: Some(session_id.to_owned()),
            connect_id: None,
            sequence: Some(0),
            error_code: None,
            payload: pcm,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Codec
// ═══════════════════════════════════════════════════════════════════════

/// Stateless frame codec.
///
/// Two long-lived instances are kept per upstream connection, one
/// stamping JSON serialization for control frames and one stamping Raw
/// for audio, both with sequence support enabled. The sequence number
/// is written and parsed but never interpreted.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    version: u8,
    header_size: u8,
    serialization: Serialization,
    compression: Compression,
    contains_sequence: bool,
}

impl FrameCodec {
    pub fn new(serialization: Serialization, contains_sequence: bool) -> Self {
        FrameCodec {
            version: PROTOCOL_VERSION,
            header_size: DEFAULT_HEADER_SIZE,
            serialization,
            compression: Compression::None,
            contains_sequence,
        }
    }

    /// Control-frame codec (JSON payloads).
    pub fn json() -> Self {
        FrameCodec::new(Serialization::Json, true)
    }

    /// Audio-frame codec (raw payloads).
    pub fn raw() -> Self {
        FrameCodec::new(Serialization::Raw, true)
    }

    /// Serialize a frame. The serialization and compression nibbles come
    /// from the codec, everything else from the frame.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        if frame.payload.len() > i32::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge(frame.payload.len()));
        }

        let mut buf = Vec::with_capacity(self.header_size as usize * 4 + 24 + frame.payload.len());
        buf.push(self.version << 4 | self.header_size);
        buf.push(frame.kind.nibble() << 4 | frame.flags);
        buf.push(self.serialization.nibble() << 4 | self.compression.nibble());
        buf.resize(self.header_size as usize * 4, 0);

        if frame.flags & FLAG_WITH_EVENT != 0 {
            let event = frame.event.unwrap_or(0);
            buf.extend_from_slice(&event.to_be_bytes());
            if event_has_connect_id(event) {
                write_string(&mut buf, frame.connect_id.as_deref().unwrap_or(""));
            } else if event_has_session_id(event) {
                write_string(&mut buf, frame.session_id.as_deref().unwrap_or(""));
            }
        }

        if self.contains_sequence {
            buf.extend_from_slice(&frame.sequence.unwrap_or(0).to_be_bytes());
        }

        if frame.kind == MessageKind::Error {
            buf.extend_from_slice(&frame.error_code.unwrap_or(0).to_be_bytes());
        }

        buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&frame.payload);
        Ok(buf)
    }

    /// Parse one frame from the front of `data`. Returns the frame and
    /// the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize), ProtocolError> {
        let mut r = Reader::new(data);

        let b0 = r.u8()?;
        let version = b0 >> 4;
        if version != self.version {
            return Err(ProtocolError::UnknownVersion(version));
        }
        let header_size = b0 & 0x0f;
        if header_size == 0 {
            return Err(ProtocolError::UnknownHeaderSize(header_size));
        }

        let b1 = r.u8()?;
        let kind =
            MessageKind::from_nibble(b1 >> 4).ok_or(ProtocolError::MalformedKind(b1 >> 4))?;
        let flags = b1 & 0x0f;

        let b2 = r.u8()?;
        let serialization = Serialization::from_nibble(b2 >> 4)
            .ok_or(ProtocolError::UnsupportedSerialization(b2 >> 4))?;
        let compression = Compression::from_nibble(b2 & 0x0f)
            .ok_or(ProtocolError::UnsupportedCompression(b2 & 0x0f))?;

        // Remaining header bytes are padding.
        r.skip(header_size as usize * 4 - 3)?;

        let mut frame = Frame {
            kind,
            flags,
            serialization,
            compression,
            event: None,
            session_id: None,
            connect_id: None,
            sequence: None,
            error_code: None,
            payload: Vec::new(),
        };

        if flags & FLAG_WITH_EVENT != 0 {
            let event = r.i32()?;
            frame.event = Some(event);
            if event_has_connect_id(event) {
                frame.connect_id = Some(r.string()?);
            } else if event_has_session_id(event) {
                frame.session_id = Some(r.string()?);
            }
        }

        if self.contains_sequence {
            frame.sequence = Some(r.i32()?);
        }

        if kind == MessageKind::Error {
            frame.error_code = Some(r.u32()?);
        }

        let payload_len = r.u32()? as usize;
        frame.payload = r.take(payload_len)?.to_vec();

        Ok((frame, r.consumed()))
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

// ═══════════════════════════════════════════════════════════════════════
//  Cursor
// ═══════════════════════════════════════════════════════════════════════

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn consumed(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.data.len() - self.pos;
        if remaining < n {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                needed: n - remaining,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let b = self.take(len)?;
        Ok(String::from_utf8_lossy(b).into_owned())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
