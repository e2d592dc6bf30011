//! Self-healing background flush for the persistent cache tier.
//!
//! Runs on its own thread, independent of any page job, and retries
//! unflushed entries on a fixed tick. Safe to run concurrently with
//! lookups and stores for the same key: writes resolve last-write-wins on
//! the entry timestamp, and no lock is held across store I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use super::CacheManager;

/// Sleep granularity for shutdown responsiveness.
const SLEEP_GRANULARITY: Duration = Duration::from_millis(50);

/// Handle for the background flush thread.
///
/// Supports graceful shutdown via [`CacheFlusher::shutdown`] or automatic
/// cleanup on `Drop`.
pub struct CacheFlusher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CacheFlusher {
    /// Start flushing `manager`'s pending entries every `interval`.
    pub fn start(manager: Arc<CacheManager>, interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();

        let handle = std::thread::spawn(move || {
            tracing::info!(interval_ms = interval.as_millis() as u64, "cache flush task started");
            flush_loop(&manager, interval, &flag);
            tracing::info!("cache flush task shutting down");
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Request graceful shutdown. An in-progress flush pass completes, but
    /// no new pass starts.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for CacheFlusher {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn flush_loop(manager: &CacheManager, interval: Duration, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        // Sleep in small increments for responsive shutdown.
        let mut slept = Duration::ZERO;
        while slept < interval {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let step = SLEEP_GRANULARITY.min(interval - slept);
            std::thread::sleep(step);
            slept += step;
        }

        let flushed = manager.flush_pending();
        if flushed > 0 {
            tracing::debug!(flushed, "cache flush pass wrote entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, PersistentStore};
    use crate::error::{Result, YomitoriError};
    use crate::types::{OcrDebugInfo, PageOcrResult};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FlakyStore {
        entries: Mutex<HashMap<CacheKey, super::super::CacheEntry>>,
        fail_puts: AtomicBool,
    }

    impl FlakyStore {
        fn new(failing: bool) -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
                fail_puts: AtomicBool::new(failing),
            }
        }
    }

    impl PersistentStore for FlakyStore {
        fn get(&self, key: CacheKey) -> Result<Option<super::super::CacheEntry>> {
            Ok(self.entries.lock().get(&key).cloned())
        }

        fn put(&self, key: CacheKey, entry: &super::super::CacheEntry) -> Result<()> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(YomitoriError::cache("simulated write failure"));
            }
            self.entries.lock().insert(key, entry.clone());
            Ok(())
        }

        fn documents_with_display_name(&self, _display_name: &str) -> Result<Vec<i64>> {
            Ok(vec![])
        }

        fn has_cached_pages(&self, document_id: i64) -> Result<bool> {
            Ok(self
                .entries
                .lock()
                .keys()
                .any(|k| k.document_id == document_id))
        }
    }

    fn sample_result() -> PageOcrResult {
        PageOcrResult::assemble(
            1,
            "kor".to_string(),
            300,
            None,
            vec![],
            100,
            100,
            OcrDebugInfo::default(),
        )
    }

    #[test]
    fn test_flusher_heals_failed_write() {
        let store = Arc::new(FlakyStore::new(true));
        let cache = Arc::new(CacheManager::new(store.clone()));
        cache.set_active_document(1, "a.zip");
        let _ = cache.store(1, 1, sample_result());
        assert_eq!(cache.stats().pending_flushes, 1);

        store.fail_puts.store(false, Ordering::SeqCst);
        let flusher = CacheFlusher::start(cache.clone(), Duration::from_millis(10));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while cache.stats().pending_flushes > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(flusher);

        assert_eq!(cache.stats().pending_flushes, 0);
        assert!(store.entries.lock().contains_key(&CacheKey::new(1, 1)));
    }

    #[test]
    fn test_flusher_shutdown_is_prompt() {
        let store = Arc::new(FlakyStore::new(false));
        let cache = Arc::new(CacheManager::new(store));
        let flusher = CacheFlusher::start(cache, Duration::from_secs(3600));
        let started = std::time::Instant::now();
        drop(flusher);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
