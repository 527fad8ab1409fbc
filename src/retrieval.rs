//! Retrieval Module
//!
//! Rebuilds a stored file from any `k` of its fragments. Fragments are
//! fetched from whichever sources are currently reachable: connected peers,
//! enabled cloud targets, or the registry's local fallback store. The `k`
//! indices to fetch are sampled at random so repeated retrievals spread load
//! across the owners.

use crate::cipher::{CipherError, FileCipher};
use crate::erasure::{self, ErasureError};
use crate::mapping_store::{FileRecord, FragmentSource, MappingError, MappingHandle};
use crate::membership::{MembershipError, MembershipHandle};
use crate::protocol::{ChunkName, PeerId};
use crate::storage_target::{CloudBucketTarget, CloudTargetSet, StorageTarget, TargetId};
use crate::transfer::{self, TransferError};
use futures::future::try_join_all;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while retrieving a file
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("file not found: {file}")]
    NotFound { file: String },

    #[error("insufficient fragments: {available} available, need {needed}")]
    InsufficientFragments { available: usize, needed: usize },

    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("erasure coding error: {0}")]
    Erasure(#[from] ErasureError),

    #[error("decryption failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-file availability summary for reporting.
#[derive(Debug, Clone)]
pub struct FileAvailability {
    pub file_name: String,
    pub size: u64,
    pub k: usize,
    pub m: usize,
    /// Distinct fragment indices held by currently reachable sources
    pub available: usize,
    pub retrievable: bool,
}

/// Where one fragment will be fetched from.
#[derive(Clone)]
enum FetchSource {
    Peer(SocketAddr),
    Cloud(Arc<CloudBucketTarget>),
    Fallback(PathBuf),
}

#[derive(Clone)]
struct FragmentFetch {
    index: u32,
    chunk: ChunkName,
    source: FetchSource,
}

/// Reconstructs stored files from their fragments.
#[derive(Clone)]
pub struct RetrievalEngine {
    membership: MembershipHandle,
    mapping: MappingHandle,
    clouds: CloudTargetSet,
    cipher: Arc<dyn FileCipher>,
    fallback_dir: PathBuf,
    transfer_timeout: Duration,
}

impl RetrievalEngine {
    pub fn new(
        membership: MembershipHandle,
        mapping: MappingHandle,
        clouds: CloudTargetSet,
        cipher: Arc<dyn FileCipher>,
        fallback_dir: PathBuf,
        transfer_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            mapping,
            clouds,
            cipher,
            fallback_dir,
            transfer_timeout,
        }
    }

    /// Reconstruct and decrypt a stored file.
    pub async fn retrieve(&self, file_name: &str) -> Result<Vec<u8>, RetrievalError> {
        let (record, available) = self.available_fragments(file_name).await?;
        let needed = record.erasure.k;
        if available.len() < needed {
            return Err(RetrievalError::InsufficientFragments {
                available: available.len(),
                needed,
            });
        }

        let chosen: Vec<FragmentFetch> = {
            let mut rng = rand::thread_rng();
            available
                .choose_multiple(&mut rng, needed)
                .cloned()
                .collect()
        };
        debug!(
            "Retrieving '{}' from fragment indices {:?}",
            file_name,
            chosen.iter().map(|f| f.index).collect::<Vec<_>>()
        );

        let downloads = chosen.into_iter().map(|fetch| self.fetch_fragment(fetch));
        let fragments: Vec<(usize, Vec<u8>)> = try_join_all(downloads).await?;

        let blob = erasure::decode(fragments, &record.erasure)?;
        let plaintext = self.cipher.decrypt(&blob, &record.key)?;
        info!(
            "Retrieved '{}' ({} bytes) from {} fragments",
            file_name,
            plaintext.len(),
            needed
        );
        Ok(plaintext)
    }

    /// Availability summary for one file.
    pub async fn availability(&self, file_name: &str) -> Result<FileAvailability, RetrievalError> {
        let (record, available) = self.available_fragments(file_name).await?;
        Ok(FileAvailability {
            file_name: file_name.to_string(),
            size: record.size,
            k: record.erasure.k,
            m: record.erasure.m,
            available: available.len(),
            retrievable: available.len() >= record.erasure.k,
        })
    }

    /// Availability summaries for every stored file.
    pub async fn availability_report(&self) -> Result<Vec<FileAvailability>, RetrievalError> {
        let names = self.mapping.read(|store| store.file_names()).await;
        let mut report = Vec::with_capacity(names.len());
        for name in names {
            report.push(self.availability(&name).await?);
        }
        Ok(report)
    }

    /// The fragments of a file that are fetchable right now, one entry per
    /// distinct index.
    async fn available_fragments(
        &self,
        file_name: &str,
    ) -> Result<(FileRecord, Vec<FragmentFetch>), RetrievalError> {
        let (record, sources) = self
            .mapping
            .read(|store| {
                (
                    store.file(file_name).cloned(),
                    store.fragment_sources(file_name),
                )
            })
            .await;
        let record = record.ok_or_else(|| RetrievalError::NotFound {
            file: file_name.to_string(),
        })?;
        let sources = sources.unwrap_or_default();

        let connected: HashMap<PeerId, SocketAddr> = self
            .membership
            .list_connected()
            .await?
            .into_iter()
            .filter_map(|r| r.transfer_addr().map(|addr| (r.id, addr)))
            .collect();

        let mut available = Vec::new();
        for fragment in sources {
            let source = match fragment.source {
                FragmentSource::Target(TargetId::Peer(id)) => {
                    connected.get(&id).map(|addr| FetchSource::Peer(*addr))
                }
                FragmentSource::Target(TargetId::Cloud(provider)) => self
                    .clouds
                    .get(provider)
                    .await
                    .map(FetchSource::Cloud),
                FragmentSource::Fallback => Some(FetchSource::Fallback(
                    self.fallback_dir.join(fragment.chunk.to_string()),
                )),
                FragmentSource::Missing => None,
            };
            if let Some(source) = source {
                available.push(FragmentFetch {
                    index: fragment.index,
                    chunk: fragment.chunk,
                    source,
                });
            }
        }
        Ok((record, available))
    }

    async fn fetch_fragment(
        &self,
        fetch: FragmentFetch,
    ) -> Result<(usize, Vec<u8>), RetrievalError> {
        let bytes = match fetch.source {
            FetchSource::Peer(addr) => {
                transfer::download_chunk(addr, &fetch.chunk, self.transfer_timeout).await?
            }
            FetchSource::Cloud(target) => target.download(&fetch.chunk).await?,
            FetchSource::Fallback(path) => tokio::fs::read(path).await?,
        };
        Ok((fetch.index as usize, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::PassthroughCipher;
    use crate::erasure::ErasureMeta;
    use crate::mapping_store::PlacementCommit;
    use crate::membership::{MembershipConfig, MembershipService};
    use crate::placement::PlacementPlanner;
    use crate::storage_target::{CloudProvider, DirObjectStore};
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct TestRetrieval {
        engine: RetrievalEngine,
        planner: PlacementPlanner,
        mapping: MappingHandle,
        clouds: CloudTargetSet,
        temp_dir: TempDir,
    }

    async fn setup() -> TestRetrieval {
        let temp_dir = TempDir::new().unwrap();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (mut service, membership) = MembershipService::new(
            MembershipConfig::default(),
            temp_dir.path().join("approved_peers.json"),
            event_tx,
        );
        tokio::spawn(async move { service.run().await });

        let mapping = MappingHandle::load(temp_dir.path().join("mapping.json"));
        let clouds = CloudTargetSet::new();
        let cipher: Arc<dyn FileCipher> = Arc::new(PassthroughCipher);
        let fallback_dir = temp_dir.path().join("fallback");
        fs::create_dir_all(&fallback_dir).unwrap();

        let planner = PlacementPlanner::new(
            membership.clone(),
            mapping.clone(),
            clouds.clone(),
            cipher.clone(),
            Duration::from_secs(5),
        );
        let engine = RetrievalEngine::new(
            membership,
            mapping.clone(),
            clouds.clone(),
            cipher,
            fallback_dir,
            Duration::from_secs(5),
        );
        TestRetrieval {
            engine,
            planner,
            mapping,
            clouds,
            temp_dir,
        }
    }

    #[tokio::test]
    async fn test_unknown_file_not_found() {
        let setup = setup().await;
        let result = setup.engine.retrieve("nothing.txt").await;
        assert!(matches!(result, Err(RetrievalError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_store_then_retrieve_roundtrip() {
        let setup = setup().await;
        setup
            .clouds
            .enable(
                CloudProvider::Aws,
                Arc::new(DirObjectStore::new(setup.temp_dir.path().join("aws"))),
            )
            .await;
        let contents = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let path = setup.temp_dir.path().join("fox.txt");
        fs::write(&path, &contents).unwrap();

        setup.planner.distribute(&path).await.unwrap();
        let restored = setup.engine.retrieve("fox.txt").await.unwrap();
        assert_eq!(restored, contents);

        let availability = setup.engine.availability("fox.txt").await.unwrap();
        assert_eq!(availability.available, 1);
        assert!(availability.retrievable);
    }

    #[tokio::test]
    async fn test_unreachable_owner_means_insufficient_fragments() {
        let setup = setup().await;
        setup
            .clouds
            .enable(
                CloudProvider::Aws,
                Arc::new(DirObjectStore::new(setup.temp_dir.path().join("aws"))),
            )
            .await;
        let path = setup.temp_dir.path().join("gone.txt");
        fs::write(&path, b"soon unreachable").unwrap();
        setup.planner.distribute(&path).await.unwrap();

        setup.clouds.disable(CloudProvider::Aws).await;
        let result = setup.engine.retrieve("gone.txt").await;
        assert!(matches!(
            result,
            Err(RetrievalError::InsufficientFragments {
                available: 0,
                needed: 1
            })
        ));

        let availability = setup.engine.availability("gone.txt").await.unwrap();
        assert!(!availability.retrievable);
    }

    #[tokio::test]
    async fn test_retrieve_from_fallback_store() {
        let setup = setup().await;
        let peer = TargetId::Peer(PeerId::generate());
        let blob = b"rescued from the fallback store".to_vec();
        let masked = "deadbeef".to_string();

        let commit = PlacementCommit {
            file_name: "saved.txt".to_string(),
            masked_name: masked.clone(),
            key: String::new(),
            size: blob.len() as u64,
            meta: ErasureMeta {
                original_size: blob.len() as u64,
                padding_size: 0,
                k: 1,
                m: 1,
            },
            owners: vec![peer],
            fragment_size: blob.len() as u64,
        };
        setup
            .mapping
            .transaction(|store| store.commit_placement(commit))
            .await
            .unwrap();
        setup
            .mapping
            .transaction(|store| store.move_fragment_to_fallback("saved.txt", 0))
            .await
            .unwrap();
        fs::write(
            setup.temp_dir.path().join("fallback").join(format!("{}.0", masked)),
            &blob,
        )
        .unwrap();

        let restored = setup.engine.retrieve("saved.txt").await.unwrap();
        assert_eq!(restored, blob);
    }

    #[tokio::test]
    async fn test_retrieval_samples_among_available() {
        let setup = setup().await;
        setup
            .clouds
            .enable(
                CloudProvider::Aws,
                Arc::new(DirObjectStore::new(setup.temp_dir.path().join("aws"))),
            )
            .await;
        setup
            .clouds
            .enable(
                CloudProvider::Google,
                Arc::new(DirObjectStore::new(setup.temp_dir.path().join("google"))),
            )
            .await;
        let contents = vec![42u8; 4096];
        let path = setup.temp_dir.path().join("pick.bin");
        fs::write(&path, &contents).unwrap();
        setup.planner.distribute(&path).await.unwrap();

        // k = 1 of m = 2: every retrieval picks one of the two copies.
        for _ in 0..5 {
            assert_eq!(setup.engine.retrieve("pick.bin").await.unwrap(), contents);
        }

        let availability = setup.engine.availability("pick.bin").await.unwrap();
        assert_eq!(availability.m, 2);
        assert_eq!(availability.available, 2);
    }
}
