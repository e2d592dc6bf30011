//! Per-page job registry and dispatcher.
//!
//! Enforces at most one active job per (document, page): starting a new
//! request cancels any in-flight job for that exact page first. Every job
//! carries a generation number; completions whose generation is no longer
//! current are discarded without side effects, so results delivered to the
//! consumer always correspond to the most recently requested job for a
//! page.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::{CancelToken, JobObserver, ResultConsumer};
use crate::pipeline::{OcrOrchestrator, PageRequest};
use crate::types::PageOcrResult;

struct ActiveJob {
    generation: u64,
    cancel: CancelToken,
}

/// Tracks the single active job per (document, page).
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<(i64, u32), ActiveJob>>,
    next_generation: AtomicU64,
}

/// Handle for one admitted job.
pub struct JobTicket {
    pub generation: u64,
    pub cancel: CancelToken,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new job for the page, canceling any prior in-flight job for
    /// the same key.
    pub fn begin(&self, document_id: i64, page_number: u32) -> JobTicket {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancelToken::new();

        let mut jobs = self.jobs.lock();
        if let Some(previous) = jobs.insert(
            (document_id, page_number),
            ActiveJob {
                generation,
                cancel: cancel.clone(),
            },
        ) {
            tracing::debug!(
                document_id,
                page_number,
                superseded = previous.generation,
                "canceling superseded page job"
            );
            previous.cancel.cancel();
        }

        JobTicket { generation, cancel }
    }

    /// Whether `generation` is still the current job for the page.
    pub fn is_current(&self, document_id: i64, page_number: u32, generation: u64) -> bool {
        self.jobs
            .lock()
            .get(&(document_id, page_number))
            .is_some_and(|job| job.generation == generation)
    }

    /// Drop the registration if `generation` is still current.
    pub fn finish(&self, document_id: i64, page_number: u32, generation: u64) {
        let mut jobs = self.jobs.lock();
        if jobs
            .get(&(document_id, page_number))
            .is_some_and(|job| job.generation == generation)
        {
            jobs.remove(&(document_id, page_number));
        }
    }

    /// Cancel the active job for a page, if any.
    pub fn cancel(&self, document_id: i64, page_number: u32) -> bool {
        let jobs = self.jobs.lock();
        match jobs.get(&(document_id, page_number)) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active job for one document. Used when the active
    /// document changes: in-flight jobs for the old document must be
    /// discarded, not delivered.
    pub fn cancel_document(&self, document_id: i64) {
        for ((doc, _), job) in self.jobs.lock().iter() {
            if *doc == document_id {
                job.cancel.cancel();
            }
        }
    }

    /// Cancel every active job.
    pub fn cancel_all(&self) {
        for job in self.jobs.lock().values() {
            job.cancel.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().len()
    }
}

/// Forwards consumer callbacks only while the job is still current, so a
/// superseded job cannot deliver results after its replacement started.
struct GatedConsumer {
    inner: Arc<dyn ResultConsumer>,
    registry: Arc<JobRegistry>,
    document_id: i64,
    page_number: u32,
    generation: u64,
}

impl GatedConsumer {
    fn current(&self) -> bool {
        self.registry
            .is_current(self.document_id, self.page_number, self.generation)
    }
}

impl ResultConsumer for GatedConsumer {
    fn on_page_completed(&self, page_number: u32, result: &PageOcrResult) {
        if self.current() {
            self.inner.on_page_completed(page_number, result);
        } else {
            tracing::debug!(page_number, "discarding result of superseded job");
        }
    }

    fn on_cache_hit(&self, page_number: u32, result: &PageOcrResult, stale: bool) {
        if self.current() {
            self.inner.on_cache_hit(page_number, result, stale);
        }
    }
}

/// Spawns one worker thread per page job and wires re-entrancy through the
/// registry.
pub struct JobDispatcher {
    orchestrator: Arc<OcrOrchestrator>,
    registry: Arc<JobRegistry>,
}

impl JobDispatcher {
    pub fn new(orchestrator: Arc<OcrOrchestrator>) -> Self {
        Self {
            orchestrator,
            registry: Arc::new(JobRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Start (or restart) OCR for a page. Returns the job's cancel token;
    /// the result arrives through `consumer`.
    pub fn dispatch(
        &self,
        request: PageRequest,
        observer: Arc<dyn JobObserver>,
        consumer: Arc<dyn ResultConsumer>,
    ) -> CancelToken {
        let ticket = self
            .registry
            .begin(request.document_id, request.page_number);
        let cancel = ticket.cancel.clone();

        let orchestrator = self.orchestrator.clone();
        let registry = self.registry.clone();
        std::thread::spawn(move || {
            let document_id = request.document_id;
            let page_number = request.page_number;
            let gated = GatedConsumer {
                inner: consumer,
                registry: registry.clone(),
                document_id,
                page_number,
                generation: ticket.generation,
            };

            if let Err(err) =
                orchestrator.process_page(&request, &ticket.cancel, observer.as_ref(), &gated)
            {
                tracing::warn!(page_number, error = %err, "dispatched page job failed");
            }
            registry.finish(document_id, page_number, ticket.generation);
        });

        cancel
    }

    /// Cancel everything in flight (for shutdown).
    pub fn shutdown(&self) {
        self.registry.cancel_all();
    }
}
