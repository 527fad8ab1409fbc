//! Registry Module
//!
//! Wires the coordination engine together and runs the peer-facing control
//! listener: identity issue/validate and the heartbeat stream arrive here and
//! are routed to the membership actor, while placement, retrieval, recovery,
//! and the mapping state hang off the cloneable [`RegistryHandle`] the
//! administrative console drives.

use crate::cipher::{FileCipher, PassthroughCipher};
use crate::config::RegistryConfig;
use crate::mapping_store::{FragmentSource, MappingError, MappingHandle};
use crate::membership::{
    MembershipConfig, MembershipError, MembershipHandle, MembershipService, PeerRecord,
};
use crate::placement::{PlacementError, PlacementPlanner};
use crate::protocol::{self, ChunkName, Message, PeerId};
use crate::recovery::{RecoveryConfig, RecoveryService};
use crate::retrieval::{FileAvailability, RetrievalEngine, RetrievalError};
use crate::storage_target::{CloudProvider, CloudTargetSet, DirObjectStore, StorageTarget, TargetId};
use crate::transfer::{self, TransferError};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors surfaced by registry-level operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("file not found: {file}")]
    FileNotFound { file: String },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("placement failed: {0}")]
    Placement(#[from] PlacementError),

    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One peer's line in the storage report.
#[derive(Debug, Clone)]
pub struct PeerUsage {
    pub id: PeerId,
    pub hostname: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Capacity and usage across the connected pool.
#[derive(Debug, Clone, Default)]
pub struct StorageReport {
    pub peers: Vec<PeerUsage>,
    pub total_capacity_bytes: u64,
    pub total_used_bytes: u64,
    /// Bytes parked in the registry's local fallback store
    pub fallback_bytes: u64,
}

/// The running registry: background services plus the control listener.
pub struct RegistryNode {
    handle: RegistryHandle,
    local_addr: SocketAddr,
}

impl RegistryNode {
    /// Start every registry service and bind the control listener.
    pub async fn start(config: RegistryConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (mut membership_service, membership) = MembershipService::new(
            MembershipConfig {
                monitor_period: config.monitor_period,
                staleness_threshold: config.staleness_threshold,
            },
            config.approved_peers_path(),
            event_tx,
        );
        tokio::spawn(async move { membership_service.run().await });

        let mapping = MappingHandle::load(config.mapping_path());
        let clouds = CloudTargetSet::new();
        for provider in &config.cloud.enabled {
            clouds
                .enable(
                    *provider,
                    Arc::new(DirObjectStore::new(config.cloud_dir(*provider))),
                )
                .await;
            info!("Cloud target {} enabled at startup", provider);
        }

        let cipher: Arc<dyn FileCipher> = Arc::new(PassthroughCipher);
        let planner = PlacementPlanner::new(
            membership.clone(),
            mapping.clone(),
            clouds.clone(),
            cipher.clone(),
            config.transfer_timeout,
        );
        let retrieval = RetrievalEngine::new(
            membership.clone(),
            mapping.clone(),
            clouds.clone(),
            cipher,
            config.fallback_dir(),
            config.transfer_timeout,
        );

        let mut recovery = RecoveryService::new(
            RecoveryConfig {
                sweep_interval: config.zombie_sweep_interval,
                transfer_timeout: config.transfer_timeout,
            },
            membership.clone(),
            mapping.clone(),
            clouds.clone(),
            config.fallback_dir(),
            event_rx,
        );
        tokio::spawn(async move { recovery.run().await });

        let listener = TcpListener::bind(&config.listen_address).await?;
        let local_addr = listener.local_addr()?;
        info!("Registry listening on {}", local_addr);
        let session_membership = membership.clone();
        tokio::spawn(async move { accept_sessions(listener, session_membership).await });

        let handle = RegistryHandle {
            membership,
            mapping,
            clouds,
            planner,
            retrieval,
            config: Arc::new(config),
        };
        Ok(RegistryNode { handle, local_addr })
    }

    pub fn handle(&self) -> RegistryHandle {
        self.handle.clone()
    }

    /// Bound address of the peer control listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_sessions(listener: TcpListener, membership: MembershipHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let membership = membership.clone();
                tokio::spawn(async move {
                    handle_session(stream, remote, membership).await;
                });
            }
            Err(e) => {
                warn!("Control listener accept failed: {}", e);
            }
        }
    }
}

/// One peer control session: identity requests, validation, and the
/// heartbeat stream. A rejected heartbeat or a read error closes the session
/// and, if the peer was connected, routes it to the eviction path.
async fn handle_session(mut stream: TcpStream, remote: SocketAddr, membership: MembershipHandle) {
    debug!("Control session opened from {}", remote);
    let mut session_id: Option<PeerId> = None;

    loop {
        let message = match protocol::read_message(&mut stream).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!("Control session from {} failed: {}", remote, e);
                break;
            }
        };

        let reply = match message {
            Message::RequestIdentity {
                capacity_mb,
                hostname,
            } => match membership
                .request_identity(hostname, capacity_mb, remote.ip())
                .await
            {
                Ok(id) => Message::IdentityIssued { id },
                Err(e) => {
                    warn!("Identity request from {} failed: {}", remote, e);
                    break;
                }
            },
            Message::ValidateIdentity {
                id,
                capacity_mb,
                hostname,
            } => match membership
                .validate_identity(id, hostname, capacity_mb, remote.ip())
                .await
            {
                Ok(approved) => Message::ValidationResult { approved },
                Err(e) => {
                    warn!("Validation of {} from {} failed: {}", id, remote, e);
                    break;
                }
            },
            Message::Heartbeat {
                id,
                transfer_port,
                capacity_mb,
                hostname,
                ..
            } => match membership
                .heartbeat(id, transfer_port, capacity_mb, hostname)
                .await
            {
                Ok(()) => {
                    session_id = Some(id);
                    Message::HeartbeatAck {
                        ok: true,
                        message: "ok".to_string(),
                    }
                }
                Err(e) => {
                    let _ = protocol::write_message(
                        &mut stream,
                        &Message::HeartbeatAck {
                            ok: false,
                            message: e.to_string(),
                        },
                    )
                    .await;
                    break;
                }
            },
            other => {
                warn!("Unexpected control message from {}: {:?}", remote, other);
                break;
            }
        };

        if let Err(e) = protocol::write_message(&mut stream, &reply).await {
            warn!("Control reply to {} failed: {}", remote, e);
            break;
        }
    }

    if let Some(id) = session_id {
        membership.session_closed(id);
    }
    debug!("Control session from {} closed", remote);
}

/// Administrative surface over the running registry.
#[derive(Clone)]
pub struct RegistryHandle {
    membership: MembershipHandle,
    mapping: MappingHandle,
    clouds: CloudTargetSet,
    planner: PlacementPlanner,
    retrieval: RetrievalEngine,
    config: Arc<RegistryConfig>,
}

impl RegistryHandle {
    pub async fn list_connected(&self) -> Result<Vec<PeerRecord>, RegistryError> {
        Ok(self.membership.list_connected().await?)
    }

    pub async fn list_pending(&self) -> Result<Vec<PeerRecord>, RegistryError> {
        Ok(self.membership.list_pending().await?)
    }

    pub async fn approve(&self, id: PeerId) -> Result<(), RegistryError> {
        Ok(self.membership.approve(id).await?)
    }

    pub async fn reject(&self, id: PeerId) -> Result<(), RegistryError> {
        Ok(self.membership.reject(id).await?)
    }

    pub async fn disconnect(&self, id: PeerId) -> Result<(), RegistryError> {
        Ok(self.membership.disconnect(id).await?)
    }

    /// Distribute one local file across the eligible targets.
    pub async fn distribute(&self, path: &Path) -> Result<String, RegistryError> {
        Ok(self.planner.distribute(path).await?)
    }

    /// Reconstruct a stored file into the given directory (or the configured
    /// downloads directory) and return the written path.
    pub async fn retrieve_to(
        &self,
        file_name: &str,
        out_dir: Option<&Path>,
    ) -> Result<PathBuf, RegistryError> {
        let bytes = self.retrieval.retrieve(file_name).await?;
        let dir = out_dir.unwrap_or(&self.config.downloads_dir);
        tokio::fs::create_dir_all(dir).await?;
        let out_path = dir.join(file_name);
        tokio::fs::write(&out_path, &bytes).await?;
        info!("Wrote retrieved file to {:?}", out_path);
        Ok(out_path)
    }

    /// Delete a stored file everywhere: remote chunks where the owner is
    /// reachable, zombie queue entries where it is not, fallback copies, and
    /// every mapping table entry in one transaction.
    pub async fn delete(&self, file_name: &str) -> Result<(), RegistryError> {
        let sources = self
            .mapping
            .read(|s| s.fragment_sources(file_name))
            .await
            .ok_or_else(|| RegistryError::FileNotFound {
                file: file_name.to_string(),
            })?;

        let connected: HashMap<PeerId, SocketAddr> = self
            .membership
            .list_connected()
            .await?
            .into_iter()
            .filter_map(|r| r.transfer_addr().map(|addr| (r.id, addr)))
            .collect();

        let mut zombies: Vec<(TargetId, ChunkName)> = Vec::new();
        for fragment in sources {
            match fragment.source {
                FragmentSource::Target(TargetId::Peer(id)) => match connected.get(&id) {
                    Some(addr) => {
                        match transfer::delete_chunk(*addr, &fragment.chunk, self.config.transfer_timeout)
                            .await
                        {
                            Ok(()) | Err(TransferError::NotFound { .. }) => {}
                            Err(e) => {
                                warn!(
                                    "Delete of {} on peer {} failed: {}, queuing zombie",
                                    fragment.chunk, id, e
                                );
                                zombies.push((TargetId::Peer(id), fragment.chunk.clone()));
                            }
                        }
                    }
                    None => {
                        zombies.push((TargetId::Peer(id), fragment.chunk.clone()));
                    }
                },
                FragmentSource::Target(TargetId::Cloud(provider)) => {
                    match self.clouds.get(provider).await {
                        Some(target) => match target.delete(&fragment.chunk).await {
                            Ok(()) | Err(TransferError::NotFound { .. }) => {}
                            Err(e) => {
                                warn!(
                                    "Delete of {} on {} failed: {}, queuing zombie",
                                    fragment.chunk, provider, e
                                );
                                zombies
                                    .push((TargetId::Cloud(provider), fragment.chunk.clone()));
                            }
                        },
                        None => {
                            zombies.push((TargetId::Cloud(provider), fragment.chunk.clone()));
                        }
                    }
                }
                FragmentSource::Fallback => {
                    let path = self.config.fallback_dir().join(fragment.chunk.to_string());
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("Fallback file {:?} could not be removed: {}", path, e);
                        }
                    }
                }
                FragmentSource::Missing => {}
            }
        }

        let file = file_name.to_string();
        self.mapping
            .transaction(move |s| s.remove_file(&file, &zombies).map(|_| ()))
            .await?;
        info!("Deleted '{}'", file_name);
        Ok(())
    }

    /// Names of every stored file.
    pub async fn stored_files(&self) -> Vec<String> {
        self.mapping.read(|s| s.file_names()).await
    }

    pub async fn availability(&self, file_name: &str) -> Result<FileAvailability, RegistryError> {
        Ok(self.retrieval.availability(file_name).await?)
    }

    pub async fn availability_report(&self) -> Result<Vec<FileAvailability>, RegistryError> {
        Ok(self.retrieval.availability_report().await?)
    }

    /// Capacity and usage per connected peer plus pool totals.
    pub async fn storage_report(&self) -> Result<StorageReport, RegistryError> {
        let records = self.membership.list_connected().await?;
        let (used, fallback_bytes) = self
            .mapping
            .read(|store| {
                let used: Vec<u64> = records
                    .iter()
                    .map(|r| store.used(&TargetId::Peer(r.id)))
                    .collect();
                (used, store.fallback_bytes())
            })
            .await;

        let mut report = StorageReport {
            fallback_bytes,
            ..Default::default()
        };
        for (record, used_bytes) in records.into_iter().zip(used) {
            report.total_capacity_bytes += record.capacity_bytes;
            report.total_used_bytes += used_bytes;
            report.peers.push(PeerUsage {
                id: record.id,
                hostname: record.hostname,
                capacity_bytes: record.capacity_bytes,
                used_bytes,
            });
        }
        Ok(report)
    }

    /// Enable a cloud bucket target backed by its configured directory.
    pub async fn cloud_enable(&self, provider: CloudProvider) {
        self.clouds
            .enable(
                provider,
                Arc::new(DirObjectStore::new(self.config.cloud_dir(provider))),
            )
            .await;
        info!("Cloud target {} enabled", provider);
    }

    /// Returns whether the provider had been enabled.
    pub async fn cloud_disable(&self, provider: CloudProvider) -> bool {
        let was_enabled = self.clouds.disable(provider).await;
        if was_enabled {
            info!("Cloud target {} disabled", provider);
        }
        was_enabled
    }

    pub async fn cloud_enabled(&self, provider: CloudProvider) -> bool {
        self.clouds.is_enabled(provider).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::ErasureMeta;
    use crate::mapping_store::PlacementCommit;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn start_node(temp_dir: &TempDir) -> RegistryNode {
        let mut config = RegistryConfig::default();
        config.listen_address = "127.0.0.1:0".to_string();
        config.data_dir = temp_dir.path().join("registry");
        config.downloads_dir = temp_dir.path().join("downloads");
        config.monitor_period = Duration::from_millis(100);
        config.staleness_threshold = Duration::from_millis(400);
        config.zombie_sweep_interval = Duration::from_millis(100);
        RegistryNode::start(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_identity_validate_approve_heartbeat_flow() {
        let temp_dir = TempDir::new().unwrap();
        let node = start_node(&temp_dir).await;
        let handle = node.handle();
        let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();

        protocol::write_message(
            &mut stream,
            &Message::RequestIdentity {
                capacity_mb: 100,
                hostname: "peer-1".to_string(),
            },
        )
        .await
        .unwrap();
        let id = match protocol::read_message(&mut stream).await.unwrap().unwrap() {
            Message::IdentityIssued { id } => id,
            other => panic!("unexpected reply: {:?}", other),
        };
        assert_eq!(handle.list_pending().await.unwrap().len(), 1);

        protocol::write_message(
            &mut stream,
            &Message::ValidateIdentity {
                id,
                capacity_mb: 100,
                hostname: "peer-1".to_string(),
            },
        )
        .await
        .unwrap();
        match protocol::read_message(&mut stream).await.unwrap().unwrap() {
            Message::ValidationResult { approved } => assert!(!approved),
            other => panic!("unexpected reply: {:?}", other),
        }

        handle.approve(id).await.unwrap();
        protocol::write_message(
            &mut stream,
            &Message::ValidateIdentity {
                id,
                capacity_mb: 100,
                hostname: "peer-1".to_string(),
            },
        )
        .await
        .unwrap();
        match protocol::read_message(&mut stream).await.unwrap().unwrap() {
            Message::ValidationResult { approved } => assert!(approved),
            other => panic!("unexpected reply: {:?}", other),
        }

        protocol::write_message(
            &mut stream,
            &Message::Heartbeat {
                id,
                timestamp_ms: 1,
                transfer_port: 9100,
                capacity_mb: 100,
                hostname: "peer-1".to_string(),
            },
        )
        .await
        .unwrap();
        match protocol::read_message(&mut stream).await.unwrap().unwrap() {
            Message::HeartbeatAck { ok, .. } => assert!(ok),
            other => panic!("unexpected reply: {:?}", other),
        }

        let connected = handle.list_connected().await.unwrap();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].transfer_port, Some(9100));
    }

    #[tokio::test]
    async fn test_unknown_heartbeat_rejected_and_session_closed() {
        let temp_dir = TempDir::new().unwrap();
        let node = start_node(&temp_dir).await;
        let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();

        protocol::write_message(
            &mut stream,
            &Message::Heartbeat {
                id: PeerId::generate(),
                timestamp_ms: 1,
                transfer_port: 9100,
                capacity_mb: 100,
                hostname: "stranger".to_string(),
            },
        )
        .await
        .unwrap();
        match protocol::read_message(&mut stream).await.unwrap().unwrap() {
            Message::HeartbeatAck { ok, .. } => assert!(!ok),
            other => panic!("unexpected reply: {:?}", other),
        }
        // The registry closes the session after a rejected heartbeat.
        assert!(protocol::read_message(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_delete_cycle_through_cloud() {
        let temp_dir = TempDir::new().unwrap();
        let node = start_node(&temp_dir).await;
        let handle = node.handle();
        handle.cloud_enable(CloudProvider::Aws).await;

        let path = temp_dir.path().join("cycle.txt");
        std::fs::write(&path, b"store me, delete me").unwrap();
        handle.distribute(&path).await.unwrap();
        assert_eq!(handle.stored_files().await, vec!["cycle.txt".to_string()]);

        let out = handle.retrieve_to("cycle.txt", None).await.unwrap();
        assert_eq!(std::fs::read(out).unwrap(), b"store me, delete me");

        handle.delete("cycle.txt").await.unwrap();
        assert!(handle.stored_files().await.is_empty());
        let bucket = handle.config.cloud_dir(CloudProvider::Aws);
        assert_eq!(std::fs::read_dir(bucket).unwrap().count(), 0);

        let result = handle.delete("cycle.txt").await;
        assert!(matches!(result, Err(RegistryError::FileNotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_with_unreachable_owner_queues_zombie() {
        let temp_dir = TempDir::new().unwrap();
        let node = start_node(&temp_dir).await;
        let handle = node.handle();

        let peer = TargetId::Peer(PeerId::generate());
        handle
            .mapping
            .transaction(|s| {
                s.commit_placement(PlacementCommit {
                    file_name: "stranded.txt".to_string(),
                    masked_name: "mm".to_string(),
                    key: "key".to_string(),
                    size: 64,
                    meta: ErasureMeta {
                        original_size: 64,
                        padding_size: 0,
                        k: 1,
                        m: 1,
                    },
                    owners: vec![peer],
                    fragment_size: 64,
                })
            })
            .await
            .unwrap();

        handle.delete("stranded.txt").await.unwrap();
        assert!(handle.stored_files().await.is_empty());
        assert_eq!(
            handle.mapping.read(|s| s.zombies_for(&peer)).await,
            vec![ChunkName::new("mm", 0)]
        );
    }

    #[tokio::test]
    async fn test_storage_report_empty_pool() {
        let temp_dir = TempDir::new().unwrap();
        let node = start_node(&temp_dir).await;

        let report = node.handle().storage_report().await.unwrap();
        assert!(report.peers.is_empty());
        assert_eq!(report.total_capacity_bytes, 0);
        assert_eq!(report.fallback_bytes, 0);
    }
}
