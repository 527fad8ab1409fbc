//! Failure Recovery Module
//!
//! Reacts to peer loss: fragments owned by a departed peer are pulled back
//! (best effort), re-placed on a replacement target, or retained in the
//! registry's local fallback store when no target has room. Deletes aimed at
//! unreachable peers queue up as zombies. A periodic sweep retries zombies
//! against peers that have reconnected and drains fallback chunks back out to
//! the pool. Per-fragment failures are logged and never abort the rest.

use crate::mapping_store::{MappingError, MappingHandle};
use crate::membership::{MembershipError, MembershipEvent, MembershipHandle};
use crate::protocol::{ChunkName, PeerId};
use crate::storage_target::{CloudTargetSet, LanPeerTarget, StorageTarget, TargetId};
use crate::transfer::{self, TransferError};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors that can occur during recovery operations
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("chunk {chunk} does not map to any stored file")]
    OrphanChunk { chunk: ChunkName },

    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Timing knobs for the recovery service.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    /// How often the sweep retries zombies and drains fallback chunks
    pub sweep_interval: Duration,
    /// Upper bound on a single chunk transfer
    pub transfer_timeout: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns the zombie and fallback work. Driven by membership events and a
/// sweep tick; both run in [`RecoveryService::run`].
pub struct RecoveryService {
    config: RecoveryConfig,
    membership: MembershipHandle,
    mapping: MappingHandle,
    clouds: CloudTargetSet,
    fallback_dir: PathBuf,
    event_rx: mpsc::UnboundedReceiver<MembershipEvent>,
}

impl RecoveryService {
    pub fn new(
        config: RecoveryConfig,
        membership: MembershipHandle,
        mapping: MappingHandle,
        clouds: CloudTargetSet,
        fallback_dir: PathBuf,
        event_rx: mpsc::UnboundedReceiver<MembershipEvent>,
    ) -> Self {
        Self {
            config,
            membership,
            mapping,
            clouds,
            fallback_dir,
            event_rx,
        }
    }

    /// Run the recovery loop until the event channel closes.
    pub async fn run(&mut self) {
        info!("Recovery service started");
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        // The first tick fires immediately; skip it so startup does not race
        // the listener coming up.
        sweep.tick().await;

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(MembershipEvent::PeerLost { id, transfer_addr }) => {
                            self.handle_peer_lost(id, transfer_addr).await;
                        }
                        Some(MembershipEvent::PeerConnected { id }) => {
                            debug!("Peer {} connected, zombies retried on next sweep", id);
                        }
                        None => {
                            info!("Membership event channel closed, recovery service stopping");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    /// Redistribute every fragment a departed peer owned.
    pub async fn handle_peer_lost(&self, id: PeerId, transfer_addr: Option<SocketAddr>) {
        let owner = TargetId::Peer(id);
        let chunks = self.mapping.read(|s| s.chunks_of(&owner)).await;
        if chunks.is_empty() {
            debug!("Departed peer {} owned no chunks", id);
            return;
        }
        info!(
            "Peer {} lost with {} chunks, starting redistribution",
            id,
            chunks.len()
        );

        for chunk in chunks {
            if let Err(e) = self.recover_chunk(id, transfer_addr, &chunk).await {
                warn!("Recovery of {} from departed peer {} failed: {}", chunk, id, e);
            }
        }
    }

    /// Move one fragment off a departed peer. Unreachable fragments are
    /// abandoned in the mapping and queued as zombies for remote cleanup.
    async fn recover_chunk(
        &self,
        departed: PeerId,
        transfer_addr: Option<SocketAddr>,
        chunk: &ChunkName,
    ) -> Result<(), RecoveryError> {
        let located = self.mapping.read(|s| s.locate_chunk(chunk)).await;
        let (file_name, index) = located.ok_or_else(|| RecoveryError::OrphanChunk {
            chunk: chunk.clone(),
        })?;
        let owner = TargetId::Peer(departed);

        let bytes = match transfer_addr {
            Some(addr) => {
                match transfer::download_chunk(addr, chunk, self.config.transfer_timeout).await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        debug!("Cannot pull {} back from departed peer {}: {}", chunk, departed, e);
                        None
                    }
                }
            }
            None => None,
        };

        let Some(bytes) = bytes else {
            // The peer is already unreachable; drop the fragment from the
            // mapping and queue the remote file for deletion on reconnect.
            let queued = chunk.clone();
            let file = file_name.clone();
            self.mapping
                .transaction(move |s| {
                    s.abandon_fragment(&file, index)?;
                    s.enqueue_zombie(owner, queued);
                    Ok(())
                })
                .await?;
            warn!(
                "Fragment {} of '{}' unreachable on departed peer {}, abandoned",
                index, file_name, departed
            );
            return Ok(());
        };

        match self.choose_replacement(Some(departed), bytes.len() as u64).await {
            Some(replacement) => {
                replacement.upload(chunk, &bytes).await?;
                let new_owner = replacement.id();
                {
                    let file_name = file_name.clone();
                    self.mapping
                        .transaction(move |s| s.reassign_fragment(&file_name, index, new_owner))
                        .await?;
                }
                info!(
                    "Moved fragment {} of '{}' from departed peer {} to {}",
                    index, file_name, departed, new_owner
                );
            }
            None => {
                // No target has room; keep the bytes on the registry itself.
                tokio::fs::create_dir_all(&self.fallback_dir).await?;
                tokio::fs::write(self.fallback_dir.join(chunk.to_string()), &bytes).await?;
                {
                    let file_name = file_name.clone();
                    self.mapping
                        .transaction(move |s| s.move_fragment_to_fallback(&file_name, index))
                        .await?;
                }
                info!(
                    "No replacement target for fragment {} of '{}', retained in fallback store",
                    index, file_name
                );
            }
        }

        // The departed peer still holds its copy; delete it now if the peer
        // is somehow still reachable, otherwise leave it for the sweep.
        let cleaned = match transfer_addr {
            Some(addr) => {
                matches!(
                    transfer::delete_chunk(addr, chunk, self.config.transfer_timeout).await,
                    Ok(()) | Err(TransferError::NotFound { .. })
                )
            }
            None => false,
        };
        if !cleaned {
            let chunk = chunk.clone();
            self.mapping
                .transaction(move |s| {
                    s.enqueue_zombie(owner, chunk);
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// One sweep iteration: retry queued zombies whose target is reachable
    /// again, then drain fallback chunks to targets with room. Failures are
    /// logged and retried on the next tick.
    pub async fn sweep(&self) {
        self.retry_zombies().await;
        self.drain_fallback().await;
    }

    async fn retry_zombies(&self) {
        let zombies = self.mapping.read(|s| s.zombies()).await;
        for (target_id, chunk) in zombies {
            let Some(target) = self.reachable_target(target_id).await else {
                continue;
            };
            match target.delete(&chunk).await {
                Ok(()) | Err(TransferError::NotFound { .. }) => {
                    let result = self
                        .mapping
                        .transaction({
                            let chunk = chunk.clone();
                            move |s| {
                                s.clear_zombie(&target_id, &chunk);
                                Ok(())
                            }
                        })
                        .await;
                    match result {
                        Ok(()) => info!("Cleared zombie {} on {}", chunk, target_id),
                        Err(e) => warn!("Failed to clear zombie {} on {}: {}", chunk, target_id, e),
                    }
                }
                Err(e) => {
                    debug!("Zombie delete of {} on {} still failing: {}", chunk, target_id, e);
                }
            }
        }
    }

    async fn drain_fallback(&self) {
        let chunks = self.mapping.read(|s| s.fallback_chunks()).await;
        for chunk in chunks {
            if let Err(e) = self.drain_one(&chunk).await {
                debug!("Fallback chunk {} not drained: {}", chunk, e);
            }
        }
    }

    async fn drain_one(&self, chunk: &ChunkName) -> Result<(), RecoveryError> {
        let located = self.mapping.read(|s| s.locate_chunk(chunk)).await;
        let (file_name, index) = located.ok_or_else(|| RecoveryError::OrphanChunk {
            chunk: chunk.clone(),
        })?;
        let size = self
            .mapping
            .read(|s| s.chunk_size(chunk))
            .await
            .unwrap_or(0);

        let Some(target) = self.choose_replacement(None, size).await else {
            return Ok(());
        };

        let path = self.fallback_dir.join(chunk.to_string());
        let bytes = tokio::fs::read(&path).await?;
        target.upload(chunk, &bytes).await?;
        let new_owner = target.id();
        self.mapping
            .transaction({
                let file_name = file_name.clone();
                move |s| s.reassign_fragment(&file_name, index, new_owner)
            })
            .await?;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Drained fallback file {:?} could not be removed: {}", path, e);
        }
        info!(
            "Drained fragment {} of '{}' from fallback store to {}",
            index, file_name, new_owner
        );
        Ok(())
    }

    /// Pick a random target with room for the fragment: connected peers
    /// (excluding the departed one) plus enabled cloud targets.
    async fn choose_replacement(
        &self,
        exclude: Option<PeerId>,
        required_bytes: u64,
    ) -> Option<Arc<dyn StorageTarget>> {
        let records = self.membership.list_connected().await.unwrap_or_default();
        let used: Vec<u64> = self
            .mapping
            .read(|store| {
                records
                    .iter()
                    .map(|r| store.used(&TargetId::Peer(r.id)))
                    .collect()
            })
            .await;

        let mut candidates: Vec<Arc<dyn StorageTarget>> = Vec::new();
        for (record, used) in records.iter().zip(used) {
            if exclude == Some(record.id) {
                continue;
            }
            let Some(addr) = record.transfer_addr() else {
                continue;
            };
            let available = record.capacity_bytes.saturating_sub(used);
            if available < required_bytes {
                continue;
            }
            candidates.push(Arc::new(LanPeerTarget::new(
                record.id,
                addr,
                available,
                self.config.transfer_timeout,
            )));
        }
        for cloud in self.clouds.enabled().await {
            candidates.push(cloud as Arc<dyn StorageTarget>);
        }

        let mut rng = rand::thread_rng();
        candidates.choose(&mut rng).cloned()
    }

    /// Resolve a target id to something deletes can be issued against.
    async fn reachable_target(&self, id: TargetId) -> Option<Arc<dyn StorageTarget>> {
        match id {
            TargetId::Peer(peer_id) => {
                let record = self.membership.get_connected(peer_id).await.ok()??;
                let addr = record.transfer_addr()?;
                Some(Arc::new(LanPeerTarget::new(
                    peer_id,
                    addr,
                    0,
                    self.config.transfer_timeout,
                )))
            }
            TargetId::Cloud(provider) => self
                .clouds
                .get(provider)
                .await
                .map(|t| t as Arc<dyn StorageTarget>),
        }
    }
}
