//! Placement Module
//!
//! Turns a local file into erasure fragments spread one-per-target across
//! the eligible pool. The operation is all-or-nothing: any fragment failure
//! rolls back the fragments already uploaded with best-effort deletes, and
//! the mapping is committed in a single transaction only after every upload
//! succeeded.

use crate::cipher::{masked_name, FileCipher};
use crate::erasure::{self, ErasureError};
use crate::mapping_store::{MappingError, MappingHandle, PlacementCommit};
use crate::membership::{MembershipError, MembershipHandle};
use crate::protocol::ChunkName;
use crate::storage_target::{CloudTargetSet, LanPeerTarget, StorageTarget, TargetId};
use crate::transfer::TransferError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while distributing a file
#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("file '{file}' is already stored; delete it first")]
    DuplicateFile { file: String },

    #[error("insufficient capacity: {eligible} eligible targets, need {needed}")]
    InsufficientCapacity { eligible: usize, needed: usize },

    #[error("invalid file path: {path}")]
    InvalidPath { path: String },

    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("erasure coding error: {0}")]
    Erasure(#[from] ErasureError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Plans and executes file distribution.
#[derive(Clone)]
pub struct PlacementPlanner {
    membership: MembershipHandle,
    mapping: MappingHandle,
    clouds: CloudTargetSet,
    cipher: Arc<dyn FileCipher>,
    transfer_timeout: Duration,
}

impl PlacementPlanner {
    pub fn new(
        membership: MembershipHandle,
        mapping: MappingHandle,
        clouds: CloudTargetSet,
        cipher: Arc<dyn FileCipher>,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            mapping,
            clouds,
            cipher,
            transfer_timeout,
        }
    }

    /// Store one local file across the eligible targets. Returns the name
    /// the file is stored under (its original file name).
    pub async fn distribute(&self, path: &Path) -> Result<String, PlacementError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PlacementError::InvalidPath {
                path: path.display().to_string(),
            })?;

        if self.mapping.read(|s| s.contains_file(&file_name)).await {
            return Err(PlacementError::DuplicateFile { file: file_name });
        }

        let plaintext = tokio::fs::read(path).await?;
        let (blob, key) = self.cipher.encrypt(&plaintext);
        let masked = masked_name();

        let (targets, lan_count, cloud_count) = self.eligible_targets(blob.len() as u64).await?;
        if targets.is_empty() {
            return Err(PlacementError::InsufficientCapacity {
                eligible: 0,
                needed: 1,
            });
        }

        let params = erasure::choose_parameters(lan_count, cloud_count)?;
        if targets.len() < params.m {
            return Err(PlacementError::InsufficientCapacity {
                eligible: targets.len(),
                needed: params.m,
            });
        }

        let (fragments, meta) = erasure::encode(&blob, params)?;
        let fragment_size = fragments.first().map(|f| f.len() as u64).unwrap_or(0);

        let mut placed: Vec<(usize, ChunkName)> = Vec::with_capacity(fragments.len());
        for (index, fragment) in fragments.iter().enumerate() {
            let chunk = ChunkName::new(masked.clone(), index as u32);
            let target = &targets[index];
            match target.upload(&chunk, fragment).await {
                Ok(()) => {
                    debug!(
                        "Uploaded fragment {} of '{}' ({} bytes) to {}",
                        index,
                        file_name,
                        fragment.len(),
                        target.id()
                    );
                    placed.push((index, chunk));
                }
                Err(e) => {
                    warn!(
                        "Upload of fragment {} of '{}' to {} failed: {}",
                        index,
                        file_name,
                        target.id(),
                        e
                    );
                    self.rollback(&targets, &placed).await;
                    return Err(e.into());
                }
            }
        }

        let owners: Vec<TargetId> = targets[..params.m].iter().map(|t| t.id()).collect();
        let commit = PlacementCommit {
            file_name: file_name.clone(),
            masked_name: masked,
            key,
            size: blob.len() as u64,
            meta,
            owners,
            fragment_size,
        };
        if let Err(e) = self
            .mapping
            .transaction(|store| store.commit_placement(commit))
            .await
        {
            warn!("Mapping commit for '{}' failed: {}", file_name, e);
            self.rollback(&targets, &placed).await;
            return Err(e.into());
        }

        info!(
            "Stored '{}' as {} fragments (k={}) across {} targets",
            file_name, params.m, params.k, params.m
        );
        Ok(file_name)
    }

    /// Connected peers with room for the blob, then the enabled clouds.
    /// Returns the targets plus the LAN and cloud counts the parameter
    /// policy needs.
    async fn eligible_targets(
        &self,
        required_bytes: u64,
    ) -> Result<(Vec<Arc<dyn StorageTarget>>, usize, usize), PlacementError> {
        let records = self.membership.list_connected().await?;
        let used: Vec<u64> = self
            .mapping
            .read(|store| {
                records
                    .iter()
                    .map(|r| store.used(&TargetId::Peer(r.id)))
                    .collect()
            })
            .await;

        let mut targets: Vec<Arc<dyn StorageTarget>> = Vec::new();
        for (record, used) in records.iter().zip(used) {
            let Some(addr) = record.transfer_addr() else {
                debug!("Peer {} has not advertised a transfer port yet", record.id);
                continue;
            };
            let available = record.capacity_bytes.saturating_sub(used);
            if available < required_bytes {
                debug!(
                    "Peer {} has {} bytes available, needs {}",
                    record.id, available, required_bytes
                );
                continue;
            }
            targets.push(Arc::new(LanPeerTarget::new(
                record.id,
                addr,
                available,
                self.transfer_timeout,
            )));
        }
        let lan_count = targets.len();

        let clouds = self.clouds.enabled().await;
        let cloud_count = clouds.len();
        for cloud in clouds {
            targets.push(cloud as Arc<dyn StorageTarget>);
        }

        Ok((targets, lan_count, cloud_count))
    }

    /// Best-effort compensating deletes after a failed placement.
    async fn rollback(&self, targets: &[Arc<dyn StorageTarget>], placed: &[(usize, ChunkName)]) {
        for (index, chunk) in placed {
            let target = &targets[*index];
            if let Err(e) = target.delete(chunk).await {
                warn!(
                    "Rollback delete of {} on {} failed: {}",
                    chunk,
                    target.id(),
                    e
                );
            }
        }
    }
}
