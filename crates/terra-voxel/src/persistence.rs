//! The key→blob persistence contract and its two bundled backends.
//!
//! Keys are [`block_key_encode`](crate::block_key_encode) values; blobs are
//! opaque to the gateway. [`MemoryGateway`] keeps everything in a shared map
//! and is mostly used by tests and tools. [`DirectoryGateway`] stores one file
//! per block under `<world>/blocks/` next to a `world.ron` metadata file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::WorldError;

/// Errors reported by a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An I/O operation failed.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// `end_batch` was called without a matching `begin_batch`.
    #[error("no batch is open")]
    NoBatchOpen,
    /// Some writes of a batch could not be committed.
    #[error("{failed} writes of the batch failed")]
    BatchIncomplete { failed: usize },
    /// Backend-specific failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Key→blob storage used by the world store.
///
/// Writes may be grouped between [`begin_batch`](Self::begin_batch) and
/// [`end_batch`](Self::end_batch); a backend may defer them until the batch
/// ends but must serve its own pending writes from [`load`](Self::load).
pub trait PersistenceGateway: Send {
    fn begin_batch(&mut self) -> Result<(), StorageError>;
    fn end_batch(&mut self) -> Result<(), StorageError>;
    fn save(&mut self, key: i64, blob: &[u8]) -> Result<(), StorageError>;
    /// Returns `None` when nothing is stored under `key`.
    fn load(&self, key: i64) -> Result<Option<Vec<u8>>, StorageError>;
    fn list_all_keys(&self) -> Result<Vec<i64>, StorageError>;
}

// ---------------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    blobs: FxHashMap<i64, Vec<u8>>,
    rejected: FxHashSet<i64>,
    batch_depth: u32,
}

/// In-memory backend. Clones share the same storage, so a "reopened" store can
/// be pointed at the same data.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every later `save` of `key` fail, to exercise partial-failure paths.
    pub fn reject_key(&self, key: i64) {
        self.state().rejected.insert(key);
    }

    /// Stores a raw blob directly, bypassing the store.
    pub fn insert_raw(&self, key: i64, blob: Vec<u8>) {
        self.state().blobs.insert(key, blob);
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.state().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceGateway for MemoryGateway {
    fn begin_batch(&mut self) -> Result<(), StorageError> {
        self.state().batch_depth += 1;
        Ok(())
    }

    fn end_batch(&mut self) -> Result<(), StorageError> {
        let mut state = self.state();
        if state.batch_depth == 0 {
            return Err(StorageError::NoBatchOpen);
        }
        state.batch_depth -= 1;
        Ok(())
    }

    fn save(&mut self, key: i64, blob: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state();
        if state.rejected.contains(&key) {
            return Err(StorageError::Backend(format!("key {key} rejected")));
        }
        state.blobs.insert(key, blob.to_vec());
        Ok(())
    }

    fn load(&self, key: i64) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.state().blobs.get(&key).cloned())
    }

    fn list_all_keys(&self) -> Result<Vec<i64>, StorageError> {
        Ok(self.state().blobs.keys().copied().collect())
    }
}

// ---------------------------------------------------------------------------
// Directory backend
// ---------------------------------------------------------------------------

/// Name of the world metadata file inside a world directory.
pub const WORLD_META_FILE: &str = "world.ron";

const BLOCKS_DIR: &str = "blocks";
const BLOCK_EXT: &str = "blk";

/// Current world directory layout version.
pub const WORLD_FORMAT_VERSION: u32 = 1;

/// Persistent per-world settings written to `world.ron`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldMeta {
    pub format_version: u32,
    /// Seed handed to the map generator.
    pub seed: u64,
    /// Width of a generation chunk in blocks.
    pub chunk_size: i16,
}

impl Default for WorldMeta {
    fn default() -> Self {
        Self {
            format_version: WORLD_FORMAT_VERSION,
            seed: 0,
            chunk_size: 5,
        }
    }
}

/// One file per block under `<root>/blocks/`.
pub struct DirectoryGateway {
    root: PathBuf,
    /// Writes deferred by an open batch.
    pending: Option<FxHashMap<i64, Vec<u8>>>,
}

impl DirectoryGateway {
    /// Opens (or initialises) a world directory.
    ///
    /// A missing or empty directory becomes a fresh world described by
    /// `fresh_meta`. An existing world's metadata is read back. A directory
    /// with contents but unreadable or missing metadata refuses to open.
    pub fn open(root: &Path, fresh_meta: &WorldMeta) -> Result<(Self, WorldMeta), WorldError> {
        let meta_path = root.join(WORLD_META_FILE);

        let meta = if meta_path.exists() {
            read_world_meta(&meta_path)?
        } else if dir_has_entries(root) {
            return Err(WorldError::MissingMetadata(root.to_path_buf()));
        } else {
            std::fs::create_dir_all(root).map_err(WorldError::MetadataWrite)?;
            write_world_meta(&meta_path, fresh_meta)?;
            tracing::info!("Created new world at {}", root.display());
            fresh_meta.clone()
        };

        std::fs::create_dir_all(root.join(BLOCKS_DIR)).map_err(WorldError::MetadataWrite)?;
        let gateway = Self {
            root: root.to_path_buf(),
            pending: None,
        };
        Ok((gateway, meta))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, key: i64) -> PathBuf {
        self.root
            .join(BLOCKS_DIR)
            .join(format!("{:016x}.{BLOCK_EXT}", key as u64))
    }

    fn write_blob(&self, key: i64, blob: &[u8]) -> Result<(), StorageError> {
        let path = self.block_path(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, blob)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl PersistenceGateway for DirectoryGateway {
    fn begin_batch(&mut self) -> Result<(), StorageError> {
        if self.pending.is_none() {
            self.pending = Some(FxHashMap::default());
        }
        Ok(())
    }

    fn end_batch(&mut self) -> Result<(), StorageError> {
        let pending = self.pending.take().ok_or(StorageError::NoBatchOpen)?;
        let mut failed = 0;
        for (key, blob) in pending {
            if let Err(e) = self.write_blob(key, &blob) {
                tracing::warn!("Failed to write block key {key}: {e}");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(StorageError::BatchIncomplete { failed });
        }
        Ok(())
    }

    fn save(&mut self, key: i64, blob: &[u8]) -> Result<(), StorageError> {
        match self.pending.as_mut() {
            Some(pending) => {
                pending.insert(key, blob.to_vec());
                Ok(())
            }
            None => self.write_blob(key, blob),
        }
    }

    fn load(&self, key: i64) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(blob) = self.pending.as_ref().and_then(|p| p.get(&key)) {
            return Ok(Some(blob.clone()));
        }
        match std::fs::read(self.block_path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_all_keys(&self) -> Result<Vec<i64>, StorageError> {
        let mut keys = FxHashSet::default();
        for entry in std::fs::read_dir(self.root.join(BLOCKS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOCK_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(raw) = u64::from_str_radix(stem, 16) {
                keys.insert(raw as i64);
            }
        }
        if let Some(pending) = &self.pending {
            keys.extend(pending.keys().copied());
        }
        Ok(keys.into_iter().collect())
    }
}

fn dir_has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn read_world_meta(path: &Path) -> Result<WorldMeta, WorldError> {
    let corrupt = |reason: String| WorldError::CorruptMetadata {
        path: path.to_path_buf(),
        reason,
    };
    let contents = std::fs::read_to_string(path).map_err(|e| corrupt(e.to_string()))?;
    let meta: WorldMeta = ron::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
    if meta.format_version != WORLD_FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format version {}",
            meta.format_version
        )));
    }
    Ok(meta)
}

fn write_world_meta(path: &Path, meta: &WorldMeta) -> Result<(), WorldError> {
    let text = ron::ser::to_string_pretty(meta, ron::ser::PrettyConfig::new())
        .map_err(|e| WorldError::MetadataWrite(std::io::Error::other(e)))?;
    std::fs::write(path, text).map_err(WorldError::MetadataWrite)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
