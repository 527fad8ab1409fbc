//! Storage Target Module
//!
//! Placement, recovery, and retrieval operate on a storage-target capability
//! instead of concrete peer records: a LAN peer reached over the transfer
//! protocol and a cloud bucket behind an object-store seam both expose
//! upload, download, delete, and available capacity.

use crate::protocol::{ChunkName, PeerId};
use crate::transfer::{self, TransferError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Cloud providers usable as storage targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Google,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Google => write!(f, "google"),
        }
    }
}

#[derive(Error, Debug)]
#[error("invalid storage target id: {0}")]
pub struct ParseTargetIdError(String);

impl FromStr for CloudProvider {
    type Err = ParseTargetIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(CloudProvider::Aws),
            "google" => Ok(CloudProvider::Google),
            other => Err(ParseTargetIdError(other.to_string())),
        }
    }
}

/// Identity of a storage target as recorded in mapping tables: either a LAN
/// peer id or a cloud provider name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TargetId {
    Peer(PeerId),
    Cloud(CloudProvider),
}

impl TargetId {
    pub fn as_peer(&self) -> Option<PeerId> {
        match self {
            TargetId::Peer(id) => Some(*id),
            TargetId::Cloud(_) => None,
        }
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Peer(id) => write!(f, "peer:{}", id),
            TargetId::Cloud(provider) => write!(f, "{}", provider),
        }
    }
}

impl FromStr for TargetId {
    type Err = ParseTargetIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("peer:") {
            return rest
                .parse::<PeerId>()
                .map(TargetId::Peer)
                .map_err(|_| ParseTargetIdError(s.to_string()));
        }
        s.parse::<CloudProvider>()
            .map(TargetId::Cloud)
            .map_err(|_| ParseTargetIdError(s.to_string()))
    }
}

impl From<TargetId> for String {
    fn from(id: TargetId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for TargetId {
    type Error = ParseTargetIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The capability every placement, recovery, and retrieval operation works
/// against.
#[async_trait]
pub trait StorageTarget: Send + Sync {
    /// Identity recorded in mapping tables.
    fn id(&self) -> TargetId;

    /// Bytes this target can still accept; `None` means effectively
    /// unbounded (cloud buckets).
    fn available_capacity(&self) -> Option<u64>;

    async fn upload(&self, chunk: &ChunkName, bytes: &[u8]) -> Result<(), TransferError>;

    async fn download(&self, chunk: &ChunkName) -> Result<Vec<u8>, TransferError>;

    async fn delete(&self, chunk: &ChunkName) -> Result<(), TransferError>;
}

/// A connected storage peer, addressed through its advertised transfer
/// endpoint. Carries a snapshot of its available capacity taken when the
/// target was constructed.
pub struct LanPeerTarget {
    peer_id: PeerId,
    addr: SocketAddr,
    available: u64,
    op_timeout: Duration,
}

impl LanPeerTarget {
    pub fn new(peer_id: PeerId, addr: SocketAddr, available: u64, op_timeout: Duration) -> Self {
        LanPeerTarget {
            peer_id,
            addr,
            available,
            op_timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl StorageTarget for LanPeerTarget {
    fn id(&self) -> TargetId {
        TargetId::Peer(self.peer_id)
    }

    fn available_capacity(&self) -> Option<u64> {
        Some(self.available)
    }

    async fn upload(&self, chunk: &ChunkName, bytes: &[u8]) -> Result<(), TransferError> {
        transfer::upload_chunk(self.addr, chunk, bytes, self.op_timeout).await
    }

    async fn download(&self, chunk: &ChunkName) -> Result<Vec<u8>, TransferError> {
        transfer::download_chunk(self.addr, chunk, self.op_timeout).await
    }

    async fn delete(&self, chunk: &ChunkName) -> Result<(), TransferError> {
        transfer::delete_chunk(self.addr, chunk, self.op_timeout).await
    }
}

/// Named-blob store seam standing in for a provider SDK client.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, name: &ChunkName, bytes: &[u8]) -> Result<(), TransferError>;
    async fn get(&self, name: &ChunkName) -> Result<Vec<u8>, TransferError>;
    async fn remove(&self, name: &ChunkName) -> Result<(), TransferError>;
    async fn list(&self) -> Result<Vec<String>, TransferError>;
}

/// Object store backed by a local directory (a mounted bucket in practice).
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirObjectStore { root: root.into() }
    }

    fn blob_path(&self, name: &ChunkName) -> PathBuf {
        self.root.join(name.to_string())
    }
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn put(&self, name: &ChunkName, bytes: &[u8]) -> Result<(), TransferError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.blob_path(name), bytes).await?;
        Ok(())
    }

    async fn get(&self, name: &ChunkName) -> Result<Vec<u8>, TransferError> {
        match tokio::fs::read(self.blob_path(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransferError::NotFound {
                chunk: name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, name: &ChunkName) -> Result<(), TransferError> {
        match tokio::fs::remove_file(self.blob_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransferError::NotFound {
                chunk: name.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, TransferError> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

/// A cloud bucket target; always considered to have space.
pub struct CloudBucketTarget {
    provider: CloudProvider,
    store: Arc<dyn ObjectStore>,
}

impl CloudBucketTarget {
    pub fn new(provider: CloudProvider, store: Arc<dyn ObjectStore>) -> Self {
        CloudBucketTarget { provider, store }
    }

    pub fn provider(&self) -> CloudProvider {
        self.provider
    }
}

#[async_trait]
impl StorageTarget for CloudBucketTarget {
    fn id(&self) -> TargetId {
        TargetId::Cloud(self.provider)
    }

    fn available_capacity(&self) -> Option<u64> {
        None
    }

    async fn upload(&self, chunk: &ChunkName, bytes: &[u8]) -> Result<(), TransferError> {
        self.store.put(chunk, bytes).await
    }

    async fn download(&self, chunk: &ChunkName) -> Result<Vec<u8>, TransferError> {
        self.store.get(chunk).await
    }

    async fn delete(&self, chunk: &ChunkName) -> Result<(), TransferError> {
        self.store.remove(chunk).await
    }
}

/// The registry's enabled cloud targets, togglable at runtime from the
/// console. Shared between placement, recovery, and retrieval.
#[derive(Clone, Default)]
pub struct CloudTargetSet {
    inner: Arc<tokio::sync::RwLock<HashMap<CloudProvider, Arc<CloudBucketTarget>>>>,
}

impl CloudTargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enable(&self, provider: CloudProvider, store: Arc<dyn ObjectStore>) {
        let mut targets = self.inner.write().await;
        targets.insert(provider, Arc::new(CloudBucketTarget::new(provider, store)));
    }

    /// Returns whether the provider was enabled.
    pub async fn disable(&self, provider: CloudProvider) -> bool {
        self.inner.write().await.remove(&provider).is_some()
    }

    pub async fn is_enabled(&self, provider: CloudProvider) -> bool {
        self.inner.read().await.contains_key(&provider)
    }

    pub async fn get(&self, provider: CloudProvider) -> Option<Arc<CloudBucketTarget>> {
        self.inner.read().await.get(&provider).cloned()
    }

    /// Enabled targets in a stable provider order.
    pub async fn enabled(&self) -> Vec<Arc<CloudBucketTarget>> {
        let targets = self.inner.read().await;
        let mut enabled: Vec<Arc<CloudBucketTarget>> = targets.values().cloned().collect();
        enabled.sort_by_key(|t| t.provider().to_string());
        enabled
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}
