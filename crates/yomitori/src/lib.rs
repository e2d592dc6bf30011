//! Yomitori - OCR quality-and-cache pipeline for scanned pages and manga.
//!
//! Yomitori takes the raw output of an OCR engine over raster page images
//! and turns it into a reusable text layer: it filters noisy tokens,
//! recovers text the engine missed, chunks oversized pages, caches results
//! under a settings fingerprint, and scores quality drift between pipeline
//! versions.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use yomitori::{
//!     CacheManager, CancelToken, FsStore, NoopConsumer, NoopObserver,
//!     OcrOrchestrator, PageRequest, PipelineConfig,
//! };
//!
//! # fn example(
//! #     rasterizer: Arc<dyn yomitori::Rasterizer>,
//! #     engine: Arc<dyn yomitori::OcrEngine>,
//! # ) -> yomitori::Result<()> {
//! let store = Arc::new(FsStore::new(None)?);
//! let cache = Arc::new(CacheManager::new(store));
//! cache.set_active_document(7, "vol1.zip");
//!
//! let orchestrator = OcrOrchestrator::new(rasterizer, engine, cache, PipelineConfig::default());
//! let request = PageRequest::new(7, 1, "kor", 300)?;
//! orchestrator.process_page(&request, &CancelToken::new(), &NoopObserver, &NoopConsumer)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Token model** (`types`): words, lines, page results, fingerprints
//! - **Quality filter** (`filter`): fixed-order noise pruning with drop
//!   diagnostics
//! - **Fallback recovery** (`recovery`): narrow re-OCR of empty lines and
//!   anomalous gaps
//! - **Chunking** (`chunking`): overlapping vertical bands for oversized
//!   pages
//! - **Orchestrator** (`pipeline`): the per-page state machine, with
//!   cancellation and one-active-job-per-page re-entrancy
//! - **Cache** (`cache`): memory + persistent tiers, alias probing,
//!   self-healing background flush
//! - **Regression scoring** (`regression`): offline quality gate between
//!   pipeline versions

#![deny(unsafe_code)]

pub mod cache;
pub mod chunking;
pub mod engine;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod recovery;
pub mod regression;
pub mod types;

pub use error::{Result, YomitoriError};
pub use types::{
    ALGORITHM_VERSION, BoundingBox, DropReason, DroppedWord, Fingerprint, Line, OcrDebugInfo,
    PageOcrResult, PageSegMode, Word, canonical_language_set, dedupe_words, group_into_lines,
};

pub use engine::{
    CancelToken, EngineOutput, JobObserver, JobStage, NoopConsumer, NoopObserver, OcrEngine,
    PageImage, Rasterizer, ResultConsumer,
};

pub use cache::{
    CacheEntry, CacheFlusher, CacheKey, CacheManager, CacheManagerStats, FsStore, Lookup,
    PersistentStore,
};

pub use chunking::ChunkingConfig;
pub use filter::{FilterConfig, FilterOutcome, apply_filters};
pub use recovery::{RecoveryConfig, RecoveryOutcome, run_recovery};

pub use pipeline::{
    JobDispatcher, JobOutcome, JobRegistry, OcrOrchestrator, PageRequest, PipelineConfig,
    RenderRetryConfig,
};

pub use regression::{
    PageRisk, PageStats, RegressionReport, RiskReason, compare_result_sets, is_suspicious_token,
    page_stats, parse_result_set,
};
