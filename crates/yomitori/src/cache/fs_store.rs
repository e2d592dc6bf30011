//! File-backed [`PersistentStore`] implementation.
//!
//! One MessagePack file per (document, page), written via temp file +
//! atomic rename so concurrent readers never observe a partial entry, plus
//! a JSON sidecar index mapping display names to document ids for alias
//! probing. Corrupted entries are treated as absent and cleaned up
//! best-effort.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::{CacheEntry, CacheKey, PersistentStore};
use crate::error::{Result, YomitoriError};

const INDEX_FILE: &str = "documents.json";

pub struct FsStore {
    root: PathBuf,
    index: Mutex<BTreeMap<String, BTreeSet<i64>>>,
}

impl FsStore {
    /// Open (or create) a store rooted at `root`; defaults to
    /// `.yomitori/pages` under the current directory.
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        let root = root.unwrap_or_else(|| {
            let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            path.push(".yomitori");
            path.push("pages");
            path
        });

        fs::create_dir_all(&root)
            .map_err(|e| YomitoriError::cache(format!("Failed to create store directory: {}", e)))?;

        let index = Self::load_index(&root)?;
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    fn load_index(root: &Path) -> Result<BTreeMap<String, BTreeSet<i64>>> {
        let path = root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(index) => Ok(index),
                Err(err) => {
                    tracing::debug!(error = %err, "display-name index corrupted, starting empty");
                    Ok(BTreeMap::new())
                }
            },
            Err(err) => Err(YomitoriError::cache(format!(
                "Failed to read display-name index: {}",
                err
            ))),
        }
    }

    /// Record that `document_id` is registered under `display_name`. The
    /// identity-resolution layer may register the same underlying file
    /// under several ids; this index is what alias probing consults.
    pub fn register_document(&self, document_id: i64, display_name: &str) -> Result<()> {
        // Held across the write so concurrent registrations cannot clobber
        // each other's index entries.
        let mut index = self.index.lock();
        index
            .entry(display_name.to_string())
            .or_default()
            .insert(document_id);
        let serialized = serde_json::to_vec_pretty(&*index)?;
        self.write_atomic(&self.root.join(INDEX_FILE), &serialized)
    }

    fn document_dir(&self, document_id: i64) -> PathBuf {
        self.root.join(document_id.to_string())
    }

    fn entry_path(&self, key: CacheKey) -> PathBuf {
        self.document_dir(key.document_id)
            .join(format!("{}.msgpack", key.page_number))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| YomitoriError::cache("store path has no parent directory"))?;

        let pid = std::process::id();
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("entry");
        let temp_path = parent.join(format!("{}.tmp.{}.{}", file_name, pid, timestamp));

        fs::write(&temp_path, bytes)
            .map_err(|e| YomitoriError::cache(format!("Failed to write temp store file: {}", e)))?;

        fs::rename(&temp_path, path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            YomitoriError::cache(format!("Failed to rename store file: {}", e))
        })?;

        Ok(())
    }
}

impl PersistentStore for FsStore {
    fn get(&self, key: CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "unreadable store entry, treating as absent");
                return Ok(None);
            }
        };

        match rmp_serde::from_slice(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                // Best-effort cleanup of corrupted entries.
                tracing::debug!(path = %path.display(), error = %err, "corrupted store entry, removing");
                let _ = fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    fn put(&self, key: CacheKey, entry: &CacheEntry) -> Result<()> {
        let dir = self.document_dir(key.document_id);
        fs::create_dir_all(&dir)
            .map_err(|e| YomitoriError::cache(format!("Failed to create document directory: {}", e)))?;

        let serialized = rmp_serde::to_vec(entry)?;
        self.write_atomic(&self.entry_path(key), &serialized)
    }

    fn documents_with_display_name(&self, display_name: &str) -> Result<Vec<i64>> {
        Ok(self
            .index
            .lock()
            .get(display_name)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    fn has_cached_pages(&self, document_id: i64) -> Result<bool> {
        let dir = self.document_dir(document_id);
        if !dir.exists() {
            return Ok(false);
        }
        let entries = fs::read_dir(&dir)
            .map_err(|e| YomitoriError::cache(format!("Failed to read document directory: {}", e)))?;
        for entry in entries.flatten() {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("msgpack") {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
