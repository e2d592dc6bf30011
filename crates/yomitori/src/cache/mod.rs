//! Two-tier result cache with fingerprint compatibility and alias probing.
//!
//! Lookup order: the in-memory tier (scoped to the currently active
//! document), then the persistent tier under the current alias binding,
//! then alias probing — other document ids known to share the active
//! document's display name. A display-compatible hit that is not
//! exact-compatible comes back flagged stale so callers can show it while a
//! recompute is pending.
//!
//! Persistent writes never block the interactive path: every stored result
//! is queued for the self-healing background flush, and a failed immediate
//! write simply leaves the entry queued. Flush attempts are stamped with a
//! lightweight content fingerprint so an already-confirmed entry is not
//! rewritten.

pub mod flush;
pub mod fs_store;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::types::{Fingerprint, PageOcrResult};

pub use flush::CacheFlusher;
pub use fs_store::FsStore;

/// Key for one page of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub document_id: i64,
    pub page_number: u32,
}

impl CacheKey {
    pub fn new(document_id: i64, page_number: u32) -> Self {
        Self {
            document_id,
            page_number,
        }
    }
}

/// A cached result plus its last-updated timestamp (epoch seconds).
/// Concurrent writers resolve last-write-wins on the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: PageOcrResult,
    pub updated_at: u64,
}

impl CacheEntry {
    pub fn new(result: PageOcrResult) -> Self {
        Self {
            result,
            updated_at: now_secs(),
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The external persistent key-value store, consumed at its interface
/// boundary. Survives process restarts; also answers which documents share
/// a display name, which drives alias probing.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: CacheKey) -> Result<Option<CacheEntry>>;
    fn put(&self, key: CacheKey, entry: &CacheEntry) -> Result<()>;
    fn documents_with_display_name(&self, display_name: &str) -> Result<Vec<i64>>;
    fn has_cached_pages(&self, document_id: i64) -> Result<bool>;
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit { result: PageOcrResult, stale: bool },
    Miss,
}

#[derive(Debug, Clone)]
struct ActiveDocument {
    id: i64,
    display_name: String,
}

#[derive(Debug, Clone)]
struct PendingFlush {
    entry: CacheEntry,
    stamp: u64,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheManagerStats {
    pub memory_entries: usize,
    pub pending_flushes: usize,
    pub confirmed_flushes: usize,
}

/// Lightweight content fingerprint used to skip redundant flush writes.
fn flush_stamp(result: &PageOcrResult) -> u64 {
    let mut hasher = ahash::AHasher::default();
    result.algorithm_version.hash(&mut hasher);
    result.dpi.hash(&mut hasher);
    result.language.hash(&mut hasher);
    result.words.len().hash(&mut hasher);
    result.text.len().hash(&mut hasher);
    hasher.finish()
}

pub struct CacheManager {
    store: Arc<dyn PersistentStore>,
    memory: DashMap<CacheKey, CacheEntry>,
    active: RwLock<Option<ActiveDocument>>,
    alias_bindings: RwLock<HashMap<i64, i64>>,
    pending: Mutex<HashMap<CacheKey, PendingFlush>>,
    confirmed: Mutex<HashMap<CacheKey, u64>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            store,
            memory: DashMap::new(),
            active: RwLock::new(None),
            alias_bindings: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            confirmed: Mutex::new(HashMap::new()),
        }
    }

    /// Switch the active document. The memory tier only ever holds pages of
    /// the active document; entries of other documents are evicted here.
    pub fn set_active_document(&self, document_id: i64, display_name: &str) {
        *self.active.write() = Some(ActiveDocument {
            id: document_id,
            display_name: display_name.to_string(),
        });
        self.memory.retain(|key, _| key.document_id == document_id);
    }

    /// The document id lookups for `document_id` actually consult, after
    /// any alias rebinding.
    pub fn resolve_binding(&self, document_id: i64) -> i64 {
        self.alias_bindings
            .read()
            .get(&document_id)
            .copied()
            .unwrap_or(document_id)
    }

    fn rebind(&self, document_id: i64, alias: i64) {
        tracing::debug!(document_id, alias, "rebinding document to cached alias");
        self.alias_bindings.write().insert(document_id, alias);
    }

    fn classify(entry: &CacheEntry, desired: &Fingerprint) -> Option<Lookup> {
        let fp = entry.result.fingerprint();
        if desired.display_compatible(&fp) {
            Some(Lookup::Hit {
                stale: !desired.exact_compatible(&fp),
                result: entry.result.clone(),
            })
        } else {
            None
        }
    }

    /// Find a usable cached result for (document, page) under the desired
    /// fingerprint.
    pub fn lookup(&self, document_id: i64, page_number: u32, desired: &Fingerprint) -> Lookup {
        let key = CacheKey::new(document_id, page_number);
        let active = self.active.read().clone();
        let is_active_doc = active.as_ref().is_some_and(|a| a.id == document_id);

        // (a) memory tier, active document only.
        if is_active_doc
            && let Some(entry) = self.memory.get(&key)
            && let Some(hit) = Self::classify(&entry, desired)
        {
            return hit;
        }

        // (b) persistent tier under the current binding.
        let bound = self.resolve_binding(document_id);
        match self.store.get(CacheKey::new(bound, page_number)) {
            Ok(Some(entry)) => {
                if let Some(hit) = Self::classify(&entry, desired) {
                    if is_active_doc {
                        self.memory.insert(key, entry);
                    }
                    return hit;
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(document_id = bound, page_number, error = %err, "persistent lookup failed");
            }
        }

        // (c) alias probing: other ids sharing the display name that have
        // cached pages. Identity-resolution layers can register the same
        // file under two ids; following the alias avoids a duplicate OCR
        // run. Resolution failure degrades to no alias.
        if let Some(active) = active.filter(|a| a.id == document_id) {
            match self.alias_candidates(&active, bound) {
                Ok(candidates) => {
                    for &candidate in &candidates {
                        match self.store.get(CacheKey::new(candidate, page_number)) {
                            Ok(Some(entry)) => {
                                if let Some(hit) = Self::classify(&entry, desired) {
                                    self.rebind(document_id, candidate);
                                    self.memory.insert(key, entry);
                                    return hit;
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                tracing::debug!(candidate, page_number, error = %err, "alias probe failed");
                            }
                        }
                    }
                    // This page missed, but with a single OCR-bearing alias
                    // the binding is still worth taking so later pages go
                    // straight to it.
                    if let [only] = candidates.as_slice() {
                        self.rebind(document_id, *only);
                    }
                }
                Err(err) => {
                    tracing::debug!(document_id, error = %err, "alias resolution failed, treating as no alias");
                }
            }
        }

        Lookup::Miss
    }

    fn alias_candidates(&self, active: &ActiveDocument, bound: i64) -> Result<Vec<i64>> {
        let mut candidates = Vec::new();
        for id in self.store.documents_with_display_name(&active.display_name)? {
            if id == active.id || id == bound {
                continue;
            }
            if self.store.has_cached_pages(id).unwrap_or(false) {
                candidates.push(id);
            }
        }
        Ok(candidates)
    }

    /// Store a freshly computed result. The memory tier and the flush queue
    /// are updated first; a failed persistent write is reported but the
    /// entry stays queued for the self-healing flush.
    pub fn store(&self, document_id: i64, page_number: u32, result: PageOcrResult) -> Result<()> {
        let key = CacheKey::new(document_id, page_number);
        let entry = CacheEntry::new(result);
        let stamp = flush_stamp(&entry.result);

        let is_active_doc = self
            .active
            .read()
            .as_ref()
            .is_some_and(|a| a.id == document_id);
        if is_active_doc {
            self.memory.insert(key, entry.clone());
        }

        self.pending.lock().insert(
            key,
            PendingFlush {
                entry: entry.clone(),
                stamp,
            },
        );

        match self.store.put(key, &entry) {
            Ok(()) => {
                self.confirm(key, stamp);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(document_id, page_number, error = %err, "persistent cache write failed, queued for flush");
                Err(err)
            }
        }
    }

    fn confirm(&self, key: CacheKey, stamp: u64) {
        self.confirmed.lock().insert(key, stamp);
        let mut pending = self.pending.lock();
        if pending.get(&key).is_some_and(|p| p.stamp == stamp) {
            pending.remove(&key);
        }
    }

    /// One pass of the self-healing flush: write every queued entry whose
    /// stamp has not been confirmed yet. Returns how many were written. No
    /// lock is held across store I/O.
    pub fn flush_pending(&self) -> usize {
        let snapshot: Vec<(CacheKey, PendingFlush)> = self
            .pending
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();

        let mut flushed = 0;
        for (key, pf) in snapshot {
            if self.confirmed.lock().get(&key) == Some(&pf.stamp) {
                let mut pending = self.pending.lock();
                if pending.get(&key).is_some_and(|p| p.stamp == pf.stamp) {
                    pending.remove(&key);
                }
                continue;
            }
            match self.store.put(key, &pf.entry) {
                Ok(()) => {
                    self.confirm(key, pf.stamp);
                    flushed += 1;
                }
                Err(err) => {
                    tracing::debug!(
                        document_id = key.document_id,
                        page_number = key.page_number,
                        error = %err,
                        "cache flush failed, will retry on next tick"
                    );
                }
            }
        }
        flushed
    }

    pub fn stats(&self) -> CacheManagerStats {
        CacheManagerStats {
            memory_entries: self.memory.len(),
            pending_flushes: self.pending.lock().len(),
            confirmed_flushes: self.confirmed.lock().len(),
        }
    }
}
