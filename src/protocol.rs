//! Wire Protocol Module
//!
//! This module defines the binary frame format and control message set shared
//! by the registry and storage peers. Every connection carries a sequence of
//! frames: a fixed header (magic, kind, payload length, offset) followed by
//! the payload. Control frames carry JSON-encoded [`Message`] values; data
//! frames carry raw chunk bytes at an explicit offset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"PVLT";

/// Serialized size of a frame header.
pub const FRAME_HEADER_SIZE: usize = 20;

/// Maximum payload of a data frame. Chunk transfers stream in frames of at
/// most this size.
pub const DATA_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 64 * 1024;

/// Errors that can occur while reading or writing frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid frame magic: {found:02x?}")]
    InvalidMagic { found: [u8; 4] },

    #[error("unknown frame kind: {kind}")]
    UnknownFrameKind { kind: u8 },

    #[error("frame payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("invalid chunk name: {name}")]
    InvalidChunkName { name: String },

    #[error("expected a control frame, received a data frame")]
    UnexpectedDataFrame,

    #[error("control payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque peer identity issued by the registry at first contact.
///
/// Rendered and persisted as the simple (unhyphenated) hex form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct PeerId(Uuid);

impl PeerId {
    /// Issue a fresh identity.
    pub fn generate() -> Self {
        PeerId(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId(Uuid::parse_str(s)?))
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for PeerId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Name of one erasure fragment: `<maskedName>.<index>`.
///
/// The string form is used on the wire, in persisted mapping tables, and as
/// the storage filename on peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChunkName {
    masked_name: String,
    index: u32,
}

impl ChunkName {
    pub fn new(masked_name: impl Into<String>, index: u32) -> Self {
        ChunkName {
            masked_name: masked_name.into(),
            index,
        }
    }

    /// Masked file name this fragment belongs to.
    pub fn masked_name(&self) -> &str {
        &self.masked_name
    }

    /// Fragment index within `[0, m)`.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.masked_name, self.index)
    }
}

impl FromStr for ChunkName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidChunkName {
            name: s.to_string(),
        };
        let (masked, index) = s.rsplit_once('.').ok_or_else(invalid)?;
        if masked.is_empty() {
            return Err(invalid());
        }
        let index = index.parse::<u32>().map_err(|_| invalid())?;
        Ok(ChunkName::new(masked, index))
    }
}

impl From<ChunkName> for String {
    fn from(name: ChunkName) -> String {
        name.to_string()
    }
}

impl TryFrom<String> for ChunkName {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Machine-readable failure codes carried in [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    CapacityExceeded,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NotFound => write!(f, "not found"),
            ErrorCode::CapacityExceeded => write!(f, "capacity exceeded"),
            ErrorCode::Internal => write!(f, "internal error"),
        }
    }
}

/// Control messages exchanged between registry and peers.
///
/// Identity and heartbeat messages flow on a peer's long-lived control
/// connection to the registry; chunk messages flow on short-lived
/// connections to a peer's transfer port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// First contact from a peer with no prior identity.
    RequestIdentity { capacity_mb: u64, hostname: String },
    /// Registry response carrying the newly issued identity.
    IdentityIssued { id: PeerId },
    /// Reconnection with a previously issued identity.
    ValidateIdentity {
        id: PeerId,
        capacity_mb: u64,
        hostname: String,
    },
    /// Registry response: whether the identity is in the approved set.
    ValidationResult { approved: bool },
    /// Periodic liveness report, also republishing capacity and port.
    Heartbeat {
        id: PeerId,
        timestamp_ms: u64,
        transfer_port: u16,
        capacity_mb: u64,
        hostname: String,
    },
    /// Registry response to a heartbeat. `ok: false` precedes session close.
    HeartbeatAck { ok: bool, message: String },
    /// Opens a chunk upload; data frames with the chunk bytes follow.
    UploadChunk {
        chunk: ChunkName,
        total_size: u64,
        checksum: u32,
    },
    /// Receiver verdict after the declared bytes arrived (or failed to).
    UploadResult {
        success: bool,
        message: String,
        size: u64,
    },
    /// Requests a stored chunk.
    DownloadChunk { chunk: ChunkName },
    /// Opens the response stream for a download; data frames follow.
    DownloadStart {
        chunk: ChunkName,
        total_size: u64,
        checksum: u32,
    },
    /// Requests deletion of a stored chunk.
    DeleteChunk { chunk: ChunkName },
    DeleteResult { success: bool, message: String },
    /// Generic failure response.
    Error { code: ErrorCode, message: String },
}

/// One wire frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Control(Message),
    Data { offset: u64, bytes: Vec<u8> },
}

const KIND_CONTROL: u8 = 0;
const KIND_DATA: u8 = 1;

async fn write_header_and_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: u8,
    offset: u64,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[0..4].copy_from_slice(&FRAME_MAGIC);
    header[4] = kind;
    // Bytes 5..8 are reserved.
    header[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    header[12..20].copy_from_slice(&offset.to_le_bytes());

    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a single frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    match frame {
        Frame::Control(message) => write_message(writer, message).await,
        Frame::Data { offset, bytes } => write_data(writer, *offset, bytes).await,
    }
}

/// Write a control message as a single frame.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProtocolError> {
    let encoded = serde_json::to_vec(message)?;
    if encoded.len() > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            size: encoded.len(),
            limit: MAX_CONTROL_PAYLOAD,
        });
    }
    write_header_and_payload(writer, KIND_CONTROL, 0, &encoded).await
}

/// Write one data frame carrying `bytes` at the given absolute offset.
pub async fn write_data<W: AsyncWrite + Unpin>(
    writer: &mut W,
    offset: u64,
    bytes: &[u8],
) -> Result<(), ProtocolError> {
    if bytes.len() > DATA_FRAME_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: bytes.len(),
            limit: DATA_FRAME_SIZE,
        });
    }
    write_header_and_payload(writer, KIND_DATA, offset, bytes).await
}

/// Read the next frame. Returns `None` when the connection closed at a frame
/// boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, ProtocolError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[0..4]);
    if magic != FRAME_MAGIC {
        return Err(ProtocolError::InvalidMagic { found: magic });
    }

    let kind = header[4];
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&header[8..12]);
    let payload_len = u32::from_le_bytes(len_buf) as usize;
    let mut offset_buf = [0u8; 8];
    offset_buf.copy_from_slice(&header[12..20]);
    let offset = u64::from_le_bytes(offset_buf);

    let limit = match kind {
        KIND_CONTROL => MAX_CONTROL_PAYLOAD,
        KIND_DATA => DATA_FRAME_SIZE,
        _ => return Err(ProtocolError::UnknownFrameKind { kind }),
    };
    if payload_len > limit {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload_len,
            limit,
        });
    }

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    match kind {
        KIND_CONTROL => Ok(Some(Frame::Control(serde_json::from_slice(&payload)?))),
        _ => Ok(Some(Frame::Data {
            offset,
            bytes: payload,
        })),
    }
}

/// Read the next frame and require it to be a control message.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, ProtocolError> {
    match read_frame(reader).await? {
        Some(Frame::Control(message)) => Ok(Some(message)),
        Some(Frame::Data { .. }) => Err(ProtocolError::UnexpectedDataFrame),
        None => Ok(None),
    }
}
