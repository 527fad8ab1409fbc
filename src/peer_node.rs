//! Storage Peer Module
//!
//! The daemon run on every storage node: serves chunk uploads, downloads,
//! and deletes against a per-instance storage directory, and keeps a control
//! session to the registry alive with identity validation and periodic
//! heartbeats. A peer that has not been approved yet simply retries until an
//! administrator approves its id.

use crate::config::PeerNodeConfig;
use crate::discovery::{DiscoveryError, RegistryLocator, StaticLocator};
use crate::protocol::{
    self, ChunkName, ErrorCode, Frame, Message, PeerId, ProtocolError, DATA_FRAME_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Errors that can occur in the storage peer daemon
#[derive(Error, Debug)]
pub enum PeerNodeError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected message from registry: {context}")]
    UnexpectedMessage { context: String },

    #[error("registry closed the connection")]
    RegistryClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Saved identity file format
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFileFormat {
    version: String,
    id: PeerId,
}

fn load_identity(path: &PathBuf) -> Option<PeerId> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<IdentityFileFormat>(&content) {
        Ok(file_format) => Some(file_format.id),
        Err(e) => {
            warn!("Corrupt identity file {:?}: {}, requesting a new id", path, e);
            None
        }
    }
}

fn save_identity(path: &PathBuf, id: PeerId) -> Result<(), PeerNodeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&IdentityFileFormat {
        version: "1.0".to_string(),
        id,
    })?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, json)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Chunk files on local disk, bounded by the advertised capacity.
pub struct ChunkStore {
    dir: PathBuf,
    capacity_bytes: u64,
}

impl ChunkStore {
    pub fn new(dir: PathBuf, capacity_bytes: u64) -> Self {
        ChunkStore { dir, capacity_bytes }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    fn chunk_path(&self, chunk: &ChunkName) -> PathBuf {
        self.dir.join(chunk.to_string())
    }

    /// Bytes currently stored, summed over the chunk files.
    pub async fn used_bytes(&self) -> std::io::Result<u64> {
        let mut total = 0u64;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            total += entry.metadata().await?.len();
        }
        Ok(total)
    }

    /// Write a chunk atomically: temp file, then rename.
    pub async fn store(&self, chunk: &ChunkName, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.chunk_path(chunk);
        let temp_path = path.with_extension("part");
        tokio::fs::write(&temp_path, bytes).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    pub async fn load(&self, chunk: &ChunkName) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.chunk_path(chunk)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns whether the chunk existed.
    pub async fn remove(&self, chunk: &ChunkName) -> std::io::Result<bool> {
        match tokio::fs::remove_file(self.chunk_path(chunk)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Run the peer daemon with the configured static registry address.
pub async fn run(config: PeerNodeConfig) -> Result<(), PeerNodeError> {
    let locator = StaticLocator::from_address(&config.registry_address)?;
    run_with_locator(config, Arc::new(locator)).await
}

/// Run the peer daemon against a custom registry locator.
pub async fn run_with_locator(
    config: PeerNodeConfig,
    locator: Arc<dyn RegistryLocator>,
) -> Result<(), PeerNodeError> {
    config.validate()?;
    tokio::fs::create_dir_all(config.instance_dir()).await?;

    let listener = TcpListener::bind(&config.transfer_listen_address).await?;
    let transfer_port = listener.local_addr()?.port();
    let store = Arc::new(ChunkStore::new(config.storage_dir(), config.capacity_bytes()));
    info!(
        "Peer instance {} serving chunks on port {} ({} MB capacity)",
        config.instance, transfer_port, config.capacity_mb
    );

    tokio::select! {
        result = serve_transfers(listener, store) => result,
        result = control_loop(&config, locator.as_ref(), transfer_port) => result,
    }
}

/// Accept chunk transfer connections, one request per connection.
pub async fn serve_transfers(
    listener: TcpListener,
    store: Arc<ChunkStore>,
) -> Result<(), PeerNodeError> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_transfer(stream, store).await {
                debug!("Transfer session from {} ended with error: {}", remote, e);
            }
        });
    }
}

async fn handle_transfer(
    mut stream: TcpStream,
    store: Arc<ChunkStore>,
) -> Result<(), PeerNodeError> {
    let Some(message) = protocol::read_message(&mut stream).await? else {
        return Ok(());
    };
    match message {
        Message::UploadChunk {
            chunk,
            total_size,
            checksum,
        } => receive_chunk(&mut stream, &store, chunk, total_size, checksum).await,
        Message::DownloadChunk { chunk } => send_chunk(&mut stream, &store, chunk).await,
        Message::DeleteChunk { chunk } => {
            if store.remove(&chunk).await? {
                debug!("Deleted chunk {}", chunk);
                protocol::write_message(
                    &mut stream,
                    &Message::DeleteResult {
                        success: true,
                        message: "deleted".to_string(),
                    },
                )
                .await?;
            } else {
                protocol::write_message(
                    &mut stream,
                    &Message::Error {
                        code: ErrorCode::NotFound,
                        message: format!("chunk {} not stored here", chunk),
                    },
                )
                .await?;
            }
            Ok(())
        }
        other => {
            protocol::write_message(
                &mut stream,
                &Message::Error {
                    code: ErrorCode::Internal,
                    message: "unsupported request".to_string(),
                },
            )
            .await?;
            Err(PeerNodeError::UnexpectedMessage {
                context: format!("transfer request: {:?}", other),
            })
        }
    }
}

async fn receive_chunk(
    stream: &mut TcpStream,
    store: &ChunkStore,
    chunk: ChunkName,
    total_size: u64,
    checksum: u32,
) -> Result<(), PeerNodeError> {
    let used = store.used_bytes().await?;
    if used + total_size > store.capacity_bytes() {
        protocol::write_message(
            stream,
            &Message::Error {
                code: ErrorCode::CapacityExceeded,
                message: format!(
                    "{} bytes used of {}, cannot accept {} more",
                    used,
                    store.capacity_bytes(),
                    total_size
                ),
            },
        )
        .await?;
        return Ok(());
    }

    let mut bytes = Vec::with_capacity(total_size as usize);
    while (bytes.len() as u64) < total_size {
        match protocol::read_frame(stream).await? {
            Some(Frame::Data {
                offset,
                bytes: piece,
            }) => {
                if offset != bytes.len() as u64 {
                    protocol::write_message(
                        stream,
                        &Message::UploadResult {
                            success: false,
                            message: format!(
                                "data frame at offset {}, expected {}",
                                offset,
                                bytes.len()
                            ),
                            size: bytes.len() as u64,
                        },
                    )
                    .await?;
                    return Ok(());
                }
                bytes.extend_from_slice(&piece);
            }
            Some(Frame::Control(message)) => {
                return Err(PeerNodeError::UnexpectedMessage {
                    context: format!("mid-upload control message: {:?}", message),
                })
            }
            // Connection dropped mid-upload; nothing was written to disk.
            None => return Err(PeerNodeError::RegistryClosed),
        }
    }

    let calculated = crc32fast::hash(&bytes);
    if calculated != checksum {
        protocol::write_message(
            stream,
            &Message::UploadResult {
                success: false,
                message: format!(
                    "checksum mismatch: declared {:08x}, calculated {:08x}",
                    checksum, calculated
                ),
                size: bytes.len() as u64,
            },
        )
        .await?;
        return Ok(());
    }

    store.store(&chunk, &bytes).await?;
    debug!("Stored chunk {} ({} bytes)", chunk, bytes.len());
    protocol::write_message(
        stream,
        &Message::UploadResult {
            success: true,
            message: "stored".to_string(),
            size: bytes.len() as u64,
        },
    )
    .await?;
    Ok(())
}

async fn send_chunk(
    stream: &mut TcpStream,
    store: &ChunkStore,
    chunk: ChunkName,
) -> Result<(), PeerNodeError> {
    let Some(bytes) = store.load(&chunk).await? else {
        protocol::write_message(
            stream,
            &Message::Error {
                code: ErrorCode::NotFound,
                message: format!("chunk {} not stored here", chunk),
            },
        )
        .await?;
        return Ok(());
    };

    protocol::write_message(
        stream,
        &Message::DownloadStart {
            chunk: chunk.clone(),
            total_size: bytes.len() as u64,
            checksum: crc32fast::hash(&bytes),
        },
    )
    .await?;
    let mut offset = 0u64;
    for piece in bytes.chunks(DATA_FRAME_SIZE) {
        protocol::write_data(stream, offset, piece).await?;
        offset += piece.len() as u64;
    }
    debug!("Served chunk {} ({} bytes)", chunk, bytes.len());
    Ok(())
}

enum SessionEnd {
    /// The id is not in the approved set yet; retry after a delay.
    AwaitingApproval,
    /// The registry refused a heartbeat and is closing the session.
    Rejected(String),
    /// The registry closed the connection.
    Closed,
}

/// Keep a registry session alive forever, reconnecting on every failure.
async fn control_loop(
    config: &PeerNodeConfig,
    locator: &dyn RegistryLocator,
    transfer_port: u16,
) -> Result<(), PeerNodeError> {
    let hostname = config.effective_hostname();
    loop {
        match connect_registry(locator).await {
            Ok(mut stream) => {
                match run_session(config, &mut stream, transfer_port, &hostname).await {
                    Ok(SessionEnd::AwaitingApproval) => {
                        debug!("Identity not approved yet, retrying");
                    }
                    Ok(SessionEnd::Rejected(message)) => {
                        warn!("Registry rejected heartbeat: {}", message);
                    }
                    Ok(SessionEnd::Closed) => {
                        warn!("Registry closed the control session");
                    }
                    Err(e) => {
                        warn!("Registry session failed: {}", e);
                    }
                }
            }
            Err(e) => {
                debug!("Cannot reach a registry: {}", e);
            }
        }
        tokio::time::sleep(config.reconnect_interval).await;
    }
}

async fn connect_registry(locator: &dyn RegistryLocator) -> Result<TcpStream, PeerNodeError> {
    let addrs = locator.locate().await?;
    for addr in &addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => debug!("Registry {} unreachable: {}", addr, e),
        }
    }
    Err(PeerNodeError::Discovery(DiscoveryError::NoRegistryFound))
}

async fn run_session(
    config: &PeerNodeConfig,
    stream: &mut TcpStream,
    transfer_port: u16,
    hostname: &str,
) -> Result<SessionEnd, PeerNodeError> {
    let id = ensure_identity(config, stream, hostname).await?;

    protocol::write_message(
        stream,
        &Message::ValidateIdentity {
            id,
            capacity_mb: config.capacity_mb,
            hostname: hostname.to_string(),
        },
    )
    .await?;
    match protocol::read_message(stream).await? {
        Some(Message::ValidationResult { approved: true }) => {}
        Some(Message::ValidationResult { approved: false }) => {
            return Ok(SessionEnd::AwaitingApproval)
        }
        Some(other) => {
            return Err(PeerNodeError::UnexpectedMessage {
                context: format!("validation response: {:?}", other),
            })
        }
        None => return Ok(SessionEnd::Closed),
    }
    info!("Validated with registry as {}", id);

    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    loop {
        ticker.tick().await;
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        protocol::write_message(
            stream,
            &Message::Heartbeat {
                id,
                timestamp_ms,
                transfer_port,
                capacity_mb: config.capacity_mb,
                hostname: hostname.to_string(),
            },
        )
        .await?;
        match protocol::read_message(stream).await? {
            Some(Message::HeartbeatAck { ok: true, .. }) => {}
            Some(Message::HeartbeatAck { ok: false, message }) => {
                return Ok(SessionEnd::Rejected(message))
            }
            Some(other) => {
                return Err(PeerNodeError::UnexpectedMessage {
                    context: format!("heartbeat response: {:?}", other),
                })
            }
            None => return Ok(SessionEnd::Closed),
        }
    }
}

/// Use the saved identity, or request a fresh one and persist it.
async fn ensure_identity(
    config: &PeerNodeConfig,
    stream: &mut TcpStream,
    hostname: &str,
) -> Result<PeerId, PeerNodeError> {
    let identity_path = config.identity_path();
    if let Some(id) = load_identity(&identity_path) {
        return Ok(id);
    }

    protocol::write_message(
        stream,
        &Message::RequestIdentity {
            capacity_mb: config.capacity_mb,
            hostname: hostname.to_string(),
        },
    )
    .await?;
    match protocol::read_message(stream).await? {
        Some(Message::IdentityIssued { id }) => {
            save_identity(&identity_path, id)?;
            info!("Registry issued identity {}", id);
            Ok(id)
        }
        Some(other) => Err(PeerNodeError::UnexpectedMessage {
            context: format!("identity response: {:?}", other),
        }),
        None => Err(PeerNodeError::RegistryClosed),
    }
}
