//! Mapping Store Module
//!
//! All registry bookkeeping lives in one persisted structure: file records,
//! per-target chunk ownership, chunk sizes, used bytes, zombie deletion
//! queues, and the fallback chunk set. Mutations go through
//! `MappingHandle::transaction`, which holds the global lock across the
//! read-modify-write and the snapshot write, so the on-disk state is always
//! a complete transaction boundary.

use crate::cipher::CipherKey;
use crate::erasure::ErasureMeta;
use crate::protocol::ChunkName;
use crate::storage_target::TargetId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Errors that can occur in mapping store operations
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal mapping error: {reason}")]
    Internal { reason: String },
}

impl MappingError {
    fn internal(reason: impl Into<String>) -> Self {
        MappingError::Internal {
            reason: reason.into(),
        }
    }
}

/// Everything known about one stored file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Obscured name the fragments are stored under
    pub masked_name: String,
    /// Cipher key needed to restore the plaintext
    pub key: CipherKey,
    /// Encrypted blob size in bytes
    pub size: u64,
    /// Reconstruction metadata; losing this loses the file
    pub erasure: ErasureMeta,
    /// Fragment index -> current owner. `None` means the fragment is either
    /// in the registry fallback store or lost; the fallback set decides which.
    pub owners: Vec<Option<TargetId>>,
}

/// Where a fragment can currently be fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentSource {
    Target(TargetId),
    Fallback,
    Missing,
}

/// One fragment's location, derived from the mapping tables.
#[derive(Debug, Clone)]
pub struct FragmentRef {
    pub index: u32,
    pub chunk: ChunkName,
    pub source: FragmentSource,
}

/// Inputs committed in one transaction once every fragment upload succeeded.
#[derive(Debug, Clone)]
pub struct PlacementCommit {
    pub file_name: String,
    pub masked_name: String,
    pub key: CipherKey,
    pub size: u64,
    pub meta: ErasureMeta,
    pub owners: Vec<TargetId>,
    pub fragment_size: u64,
}

/// The complete persisted mapping state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingStore {
    /// Original file name -> record
    #[serde(default)]
    files: HashMap<String, FileRecord>,
    /// Masked name -> original file name
    #[serde(default)]
    masked_names: HashMap<String, String>,
    /// Target -> chunks it currently holds
    #[serde(default)]
    target_chunks: HashMap<TargetId, Vec<ChunkName>>,
    /// Chunk -> size in bytes
    #[serde(default)]
    chunk_sizes: HashMap<ChunkName, u64>,
    /// Target -> bytes attributed to it
    #[serde(default)]
    used_bytes: HashMap<TargetId, u64>,
    /// Target -> chunks awaiting remote deletion
    #[serde(default)]
    zombies: HashMap<TargetId, Vec<ChunkName>>,
    /// Chunks currently held in the registry fallback store
    #[serde(default)]
    fallback: HashSet<ChunkName>,
}

impl MappingStore {
    pub fn contains_file(&self, file_name: &str) -> bool {
        self.files.contains_key(file_name)
    }

    pub fn file(&self, file_name: &str) -> Option<&FileRecord> {
        self.files.get(file_name)
    }

    /// Stored file names, sorted for stable listings.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a chunk back to its file name and fragment index.
    pub fn locate_chunk(&self, chunk: &ChunkName) -> Option<(String, u32)> {
        self.masked_names
            .get(chunk.masked_name())
            .map(|file_name| (file_name.clone(), chunk.index()))
    }

    pub fn chunks_of(&self, target: &TargetId) -> Vec<ChunkName> {
        self.target_chunks.get(target).cloned().unwrap_or_default()
    }

    pub fn chunk_size(&self, chunk: &ChunkName) -> Option<u64> {
        self.chunk_sizes.get(chunk).copied()
    }

    pub fn used(&self, target: &TargetId) -> u64 {
        self.used_bytes.get(target).copied().unwrap_or(0)
    }

    pub fn is_fallback(&self, chunk: &ChunkName) -> bool {
        self.fallback.contains(chunk)
    }

    pub fn fallback_chunks(&self) -> Vec<ChunkName> {
        self.fallback.iter().cloned().collect()
    }

    pub fn fallback_bytes(&self) -> u64 {
        self.fallback
            .iter()
            .filter_map(|chunk| self.chunk_sizes.get(chunk))
            .sum()
    }

    /// All queued zombie deletions, flattened.
    pub fn zombies(&self) -> Vec<(TargetId, ChunkName)> {
        self.zombies
            .iter()
            .flat_map(|(target, chunks)| chunks.iter().map(|c| (*target, c.clone())))
            .collect()
    }

    pub fn zombies_for(&self, target: &TargetId) -> Vec<ChunkName> {
        self.zombies.get(target).cloned().unwrap_or_default()
    }

    /// Fragment locations for a file, one entry per index.
    pub fn fragment_sources(&self, file_name: &str) -> Option<Vec<FragmentRef>> {
        let record = self.files.get(file_name)?;
        let refs = record
            .owners
            .iter()
            .enumerate()
            .map(|(index, owner)| {
                let index = index as u32;
                let chunk = ChunkName::new(record.masked_name.clone(), index);
                let source = match owner {
                    Some(target) => FragmentSource::Target(*target),
                    None if self.fallback.contains(&chunk) => FragmentSource::Fallback,
                    None => FragmentSource::Missing,
                };
                FragmentRef {
                    index,
                    chunk,
                    source,
                }
            })
            .collect();
        Some(refs)
    }

    /// Record a completed placement: file record plus every chunk table.
    pub fn commit_placement(&mut self, commit: PlacementCommit) -> Result<(), MappingError> {
        if self.files.contains_key(&commit.file_name) {
            return Err(MappingError::internal(format!(
                "file '{}' is already mapped",
                commit.file_name
            )));
        }
        if commit.owners.len() != commit.meta.m {
            return Err(MappingError::internal(format!(
                "placement for '{}' has {} owners for m={}",
                commit.file_name,
                commit.owners.len(),
                commit.meta.m
            )));
        }

        for (index, target) in commit.owners.iter().enumerate() {
            let chunk = ChunkName::new(commit.masked_name.clone(), index as u32);
            self.attach(*target, chunk, commit.fragment_size);
        }

        self.masked_names
            .insert(commit.masked_name.clone(), commit.file_name.clone());
        self.files.insert(
            commit.file_name,
            FileRecord {
                masked_name: commit.masked_name,
                key: commit.key,
                size: commit.size,
                erasure: commit.meta,
                owners: commit.owners.into_iter().map(Some).collect(),
            },
        );
        Ok(())
    }

    /// Drop every table entry for a file. Chunks whose owners could not be
    /// reached are queued as zombies in the same transaction.
    pub fn remove_file(
        &mut self,
        file_name: &str,
        zombie_chunks: &[(TargetId, ChunkName)],
    ) -> Result<FileRecord, MappingError> {
        let record = self
            .files
            .remove(file_name)
            .ok_or_else(|| MappingError::internal(format!("file '{}' is not mapped", file_name)))?;

        for (index, owner) in record.owners.iter().enumerate() {
            let chunk = ChunkName::new(record.masked_name.clone(), index as u32);
            if let Some(target) = owner {
                self.detach(target, &chunk)?;
            }
            self.fallback.remove(&chunk);
            self.chunk_sizes.remove(&chunk);
        }
        self.masked_names.remove(&record.masked_name);

        for (target, chunk) in zombie_chunks {
            self.enqueue_zombie(*target, chunk.clone());
        }
        Ok(record)
    }

    fn fragment_slot(
        &self,
        file_name: &str,
        index: u32,
    ) -> Result<(ChunkName, Option<TargetId>), MappingError> {
        let record = self
            .files
            .get(file_name)
            .ok_or_else(|| MappingError::internal(format!("file '{}' is not mapped", file_name)))?;
        let owner = record.owners.get(index as usize).ok_or_else(|| {
            MappingError::internal(format!(
                "fragment {} out of range for '{}'",
                index, file_name
            ))
        })?;
        Ok((ChunkName::new(record.masked_name.clone(), index), *owner))
    }

    fn set_fragment_owner(&mut self, file_name: &str, index: u32, owner: Option<TargetId>) {
        if let Some(record) = self.files.get_mut(file_name) {
            if let Some(slot) = record.owners.get_mut(index as usize) {
                *slot = owner;
            }
        }
    }

    /// Move a fragment to a new owner, from either a previous owner or the
    /// fallback store.
    pub fn reassign_fragment(
        &mut self,
        file_name: &str,
        index: u32,
        new_owner: TargetId,
    ) -> Result<(), MappingError> {
        let (chunk, previous) = self.fragment_slot(file_name, index)?;
        let size = self
            .chunk_sizes
            .get(&chunk)
            .copied()
            .ok_or_else(|| MappingError::internal(format!("no size recorded for {}", chunk)))?;

        match previous {
            Some(old) => self.detach(&old, &chunk)?,
            None => {
                if !self.fallback.remove(&chunk) {
                    return Err(MappingError::internal(format!(
                        "fragment {} of '{}' has no current source",
                        index, file_name
                    )));
                }
            }
        }
        self.attach(new_owner, chunk, size);
        self.set_fragment_owner(file_name, index, Some(new_owner));
        Ok(())
    }

    /// Detach a fragment from its owner and mark it as held in the registry
    /// fallback store.
    pub fn move_fragment_to_fallback(
        &mut self,
        file_name: &str,
        index: u32,
    ) -> Result<(), MappingError> {
        let (chunk, previous) = self.fragment_slot(file_name, index)?;
        let previous = previous.ok_or_else(|| {
            MappingError::internal(format!(
                "fragment {} of '{}' has no owner to detach",
                index, file_name
            ))
        })?;
        self.detach(&previous, &chunk)?;
        self.fallback.insert(chunk);
        self.set_fragment_owner(file_name, index, None);
        Ok(())
    }

    /// Drop a fragment that could not be saved. The file may still be
    /// retrievable from the remaining fragments.
    pub fn abandon_fragment(&mut self, file_name: &str, index: u32) -> Result<(), MappingError> {
        let (chunk, previous) = self.fragment_slot(file_name, index)?;
        if let Some(previous) = previous {
            self.detach(&previous, &chunk)?;
        }
        self.fallback.remove(&chunk);
        self.chunk_sizes.remove(&chunk);
        self.set_fragment_owner(file_name, index, None);
        Ok(())
    }

    pub fn enqueue_zombie(&mut self, target: TargetId, chunk: ChunkName) {
        let queue = self.zombies.entry(target).or_default();
        if !queue.contains(&chunk) {
            queue.push(chunk);
        }
    }

    pub fn clear_zombie(&mut self, target: &TargetId, chunk: &ChunkName) {
        if let Some(queue) = self.zombies.get_mut(target) {
            queue.retain(|c| c != chunk);
            if queue.is_empty() {
                self.zombies.remove(target);
            }
        }
    }

    fn attach(&mut self, target: TargetId, chunk: ChunkName, size: u64) {
        let chunks = self.target_chunks.entry(target).or_default();
        if !chunks.contains(&chunk) {
            chunks.push(chunk.clone());
        }
        self.chunk_sizes.insert(chunk, size);
        *self.used_bytes.entry(target).or_insert(0) += size;
    }

    fn detach(&mut self, target: &TargetId, chunk: &ChunkName) -> Result<(), MappingError> {
        let chunks = self.target_chunks.get_mut(target).ok_or_else(|| {
            MappingError::internal(format!("target {} owns no chunks, expected {}", target, chunk))
        })?;
        let before = chunks.len();
        chunks.retain(|c| c != chunk);
        if chunks.len() == before {
            return Err(MappingError::internal(format!(
                "chunk {} not in the chunk list of {}",
                chunk, target
            )));
        }
        if chunks.is_empty() {
            self.target_chunks.remove(target);
        }

        let size = self
            .chunk_sizes
            .get(chunk)
            .copied()
            .ok_or_else(|| MappingError::internal(format!("no size recorded for {}", chunk)))?;
        let used = self.used_bytes.entry(*target).or_insert(0);
        *used = used.saturating_sub(size);
        if *used == 0 {
            self.used_bytes.remove(target);
        }
        Ok(())
    }
}

/// Shared, persistent access to the mapping state.
#[derive(Clone)]
pub struct MappingHandle {
    inner: Arc<Mutex<MappingStore>>,
    path: PathBuf,
}

impl MappingHandle {
    /// Load the mapping state from disk. A missing file starts empty; a
    /// corrupt file starts empty with a loud error, the damaged file is left
    /// in place until the next snapshot overwrites it.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let store = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<MappingStore>(&content) {
                Ok(store) => {
                    info!("Loaded mapping state from {:?}", path);
                    store
                }
                Err(e) => {
                    error!(
                        "Corrupt mapping state in {:?}: {}, starting with empty mapping",
                        path, e
                    );
                    MappingStore::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No mapping state at {:?}, starting with empty mapping", path);
                MappingStore::default()
            }
            Err(e) => {
                error!(
                    "Failed to read mapping state {:?}: {}, starting with empty mapping",
                    path, e
                );
                MappingStore::default()
            }
        };
        MappingHandle {
            inner: Arc::new(Mutex::new(store)),
            path,
        }
    }

    /// Run a read-only closure under the lock.
    pub async fn read<R>(&self, f: impl FnOnce(&MappingStore) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Run a mutating closure and snapshot the result atomically. If the
    /// closure or the snapshot fails, the in-memory state is untouched.
    pub async fn transaction<R>(
        &self,
        f: impl FnOnce(&mut MappingStore) -> Result<R, MappingError>,
    ) -> Result<R, MappingError> {
        let mut guard = self.inner.lock().await;
        let mut draft = guard.clone();
        let result = f(&mut draft)?;
        save_snapshot(&self.path, &draft)?;
        *guard = draft;
        Ok(result)
    }
}

/// Atomic snapshot: write to a temp file, then rename over the target.
fn save_snapshot(path: &Path, store: &MappingStore) -> Result<(), MappingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(store)?;
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    debug!(
        "Saved mapping snapshot to {:?} ({} files)",
        path,
        store.files.len()
    );
    Ok(())
}
