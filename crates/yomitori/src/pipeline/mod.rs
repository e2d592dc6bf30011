//! Page OCR orchestrator.
//!
//! Sequences rasterization → OCR → filtering → recovery (chunking the image
//! first when it exceeds the engine's practical height) into one
//! [`PageOcrResult`], then hands the result to the cache manager.
//!
//! State machine: `init → rendering → ocr → recovering → complete |
//! canceled | failed`. Cancellation is checked at every state boundary and
//! around every engine invocation; a canceled job discards partial results
//! and never writes to the cache. Render and primary-OCR failures abort the
//! job; recovery and chunk sub-call failures degrade gracefully and are
//! only logged.

pub mod jobs;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheManager, Lookup};
use crate::chunking::{self, BandOutput, ChunkingConfig};
use crate::engine::{
    CancelToken, JobObserver, JobStage, OcrEngine, PageImage, Rasterizer, ResultConsumer,
};
use crate::error::{Result, YomitoriError};
use crate::filter::{FilterConfig, apply_filters};
use crate::recovery::{RecoveryConfig, run_recovery};
use crate::types::{
    ALGORITHM_VERSION, Fingerprint, PageOcrResult, PageSegMode, canonical_language_set,
};

pub use jobs::{JobDispatcher, JobRegistry, JobTicket};

/// Bounded retry for the rasterizer, which may time out transiently.
#[derive(Debug, Clone)]
pub struct RenderRetryConfig {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RenderRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// All stage tunables in one place.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub filter: FilterConfig,
    pub recovery: RecoveryConfig,
    pub chunking: ChunkingConfig,
    pub render_retry: RenderRetryConfig,
}

/// One page OCR request. Language is canonicalized on construction so every
/// downstream fingerprint agrees on the set.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub document_id: i64,
    pub page_number: u32,
    pub language: String,
    pub dpi: u32,
    pub psm: Option<PageSegMode>,
}

impl PageRequest {
    pub fn new(document_id: i64, page_number: u32, language: &str, dpi: u32) -> Result<Self> {
        let language = canonical_language_set(language);
        if language.is_empty() {
            return Err(YomitoriError::validation("language set must not be empty"));
        }
        if page_number == 0 {
            return Err(YomitoriError::validation("page numbers are 1-based"));
        }
        if dpi == 0 {
            return Err(YomitoriError::validation("dpi must be positive"));
        }
        Ok(Self {
            document_id,
            page_number,
            language,
            dpi,
            psm: None,
        })
    }

    pub fn with_psm(mut self, psm: PageSegMode) -> Self {
        self.psm = Some(psm);
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            language: self.language.clone(),
            dpi: self.dpi,
            psm: self.psm,
            algorithm_version: ALGORITHM_VERSION,
        }
    }
}

/// How a page job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Fresh result computed and delivered.
    Completed(PageOcrResult),
    /// Exact-compatible cached result served without recomputation.
    CachedExact(PageOcrResult),
    /// Job observed cancellation; nothing was delivered or written.
    Canceled,
}

pub struct OcrOrchestrator {
    rasterizer: Arc<dyn Rasterizer>,
    engine: Arc<dyn OcrEngine>,
    cache: Arc<CacheManager>,
    config: PipelineConfig,
}

impl OcrOrchestrator {
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        engine: Arc<dyn OcrEngine>,
        cache: Arc<CacheManager>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            rasterizer,
            engine,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Run one page job to completion on the calling thread.
    ///
    /// An exact-compatible cache hit is delivered through
    /// [`ResultConsumer::on_cache_hit`] and short-circuits the pipeline. A
    /// stale (display-compatible) hit is delivered the same way so the
    /// caller has something to show, and recomputation continues.
    pub fn process_page(
        &self,
        request: &PageRequest,
        cancel: &CancelToken,
        observer: &dyn JobObserver,
        consumer: &dyn ResultConsumer,
    ) -> Result<JobOutcome> {
        let page = request.page_number;
        observer.on_stage(page, JobStage::Init);

        match self
            .cache
            .lookup(request.document_id, page, &request.fingerprint())
        {
            Lookup::Hit { result, stale: false } => {
                consumer.on_cache_hit(page, &result, false);
                observer.on_stage(page, JobStage::Complete);
                return Ok(JobOutcome::CachedExact(result));
            }
            Lookup::Hit { result, stale: true } => {
                tracing::debug!(page, "serving stale cached result while recomputing");
                consumer.on_cache_hit(page, &result, true);
            }
            Lookup::Miss => {}
        }

        match self.run_fresh(request, cancel, observer) {
            Ok(result) => {
                if let Err(err) = self
                    .cache
                    .store(request.document_id, page, result.clone())
                {
                    tracing::warn!(page, error = %err, "cache write failed, flush task will retry");
                }
                consumer.on_page_completed(page, &result);
                observer.on_stage(page, JobStage::Complete);
                Ok(JobOutcome::Completed(result))
            }
            Err(err) if err.is_canceled() => {
                observer.on_stage(page, JobStage::Canceled);
                Ok(JobOutcome::Canceled)
            }
            Err(err) => {
                tracing::warn!(page, error = %err, "page OCR job failed");
                observer.on_stage(page, JobStage::Failed);
                Err(err)
            }
        }
    }

    fn run_fresh(
        &self,
        request: &PageRequest,
        cancel: &CancelToken,
        observer: &dyn JobObserver,
    ) -> Result<PageOcrResult> {
        let page = request.page_number;

        cancel.checkpoint()?;
        observer.on_stage(page, JobStage::Rendering);
        let image = self.render_with_retry(request, cancel)?;

        cancel.checkpoint()?;
        observer.on_stage(page, JobStage::Ocr);
        let progress = |percent: u8| observer.on_progress(page, percent);

        let (words, debug) = if chunking::needs_chunking(&image, &self.config.chunking) {
            let outcome = chunking::run_chunked(&image, &self.config.chunking, cancel, |band, idx| {
                self.process_band(band, idx, request, cancel, &progress)
            })?;
            let mut debug = outcome.debug;
            debug.recovered_words = outcome.recovered;
            (outcome.words, debug)
        } else {
            let raw = self.engine.recognize(
                &image,
                &request.language,
                request.psm,
                cancel,
                &progress,
            )?;
            cancel.checkpoint()?;

            let filtered = apply_filters(raw.words, &image, &request.language, &self.config.filter);
            let mut debug = filtered.debug;

            observer.on_stage(page, JobStage::Recovering);
            let recovered = run_recovery(
                filtered.survivors,
                &image,
                &request.language,
                self.engine.as_ref(),
                cancel,
                &progress,
                &self.config.recovery,
            )?;
            debug.recovered_words = recovered.recovered;
            (recovered.words, debug)
        };

        cancel.checkpoint()?;
        Ok(PageOcrResult::assemble(
            page,
            request.language.clone(),
            request.dpi,
            request.psm,
            words,
            image.width(),
            image.height(),
            debug,
        ))
    }

    /// Engine + filter + recovery for one chunk band. A band engine failure
    /// is an optional-stage failure: log it and contribute an empty band
    /// rather than failing the page.
    fn process_band(
        &self,
        band: &PageImage,
        band_index: usize,
        request: &PageRequest,
        cancel: &CancelToken,
        progress: &(dyn Fn(u8) + Sync),
    ) -> Result<BandOutput> {
        cancel.checkpoint()?;

        let raw = match self.engine.recognize(
            band,
            &request.language,
            request.psm,
            cancel,
            progress,
        ) {
            Ok(raw) => raw,
            Err(err) if err.is_canceled() => return Err(err),
            Err(err) => {
                tracing::warn!(band_index, error = %err, "chunk sub-call failed, contributing empty band");
                return Ok(BandOutput::default());
            }
        };

        let filtered = apply_filters(raw.words, band, &request.language, &self.config.filter);
        let recovered = run_recovery(
            filtered.survivors,
            band,
            &request.language,
            self.engine.as_ref(),
            cancel,
            progress,
            &self.config.recovery,
        )?;

        Ok(BandOutput {
            words: recovered.words,
            debug: filtered.debug,
            recovered: recovered.recovered,
        })
    }

    fn render_with_retry(&self, request: &PageRequest, cancel: &CancelToken) -> Result<PageImage> {
        let retry = &self.config.render_retry;
        let mut attempt = 0u32;
        loop {
            cancel.checkpoint()?;
            match self.rasterizer.render(request.page_number, request.dpi) {
                Ok(image) => return Ok(image),
                Err(err) if err.is_canceled() => return Err(err),
                Err(err) => {
                    attempt += 1;
                    if attempt >= retry.max_attempts.max(1) {
                        return Err(err);
                    }
                    let delay = retry.backoff * attempt;
                    tracing::debug!(
                        page = request.page_number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "render failed, retrying with backoff"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
