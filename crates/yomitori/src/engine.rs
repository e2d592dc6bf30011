//! Boundary types for the external rasterizer and OCR engine.
//!
//! The pipeline never owns an engine implementation: it is handed an
//! explicitly constructed [`OcrEngine`] and [`Rasterizer`] (no ambient
//! singletons), threads a cooperative [`CancelToken`] through every
//! suspension point, and reports stage/percentage events to a per-job
//! [`JobObserver`].

use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, YomitoriError};
use crate::types::{BoundingBox, Line, PageOcrResult, PageSegMode, Word};

/// Grayscale page bitmap produced by the rasterizer.
#[derive(Debug, Clone)]
pub struct PageImage {
    gray: GrayImage,
}

impl PageImage {
    pub fn new(gray: GrayImage) -> Self {
        Self { gray }
    }

    /// Build from raw luma bytes. Fails if the buffer does not match the
    /// declared dimensions.
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        GrayImage::from_raw(width, height, pixels)
            .map(|gray| Self { gray })
            .ok_or_else(|| {
                YomitoriError::validation(format!(
                    "pixel buffer does not match dimensions {}x{}",
                    width, height
                ))
            })
    }

    /// Uniform image of the given dimensions. Test and placeholder helper.
    pub fn blank(width: u32, height: u32, luma: u8) -> Self {
        Self {
            gray: GrayImage::from_pixel(width, height, image::Luma([luma])),
        }
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.gray.get_pixel(x, y).0[0]
    }

    /// Copy out a sub-region, clamped to the image bounds. Recovery and
    /// chunk crops are taken from the already-rendered page bitmap rather
    /// than re-rendering.
    pub fn crop(&self, region: BoundingBox) -> PageImage {
        let x0 = region.x0.min(self.width());
        let y0 = region.y0.min(self.height());
        let x1 = region.x1.min(self.width()).max(x0);
        let y1 = region.y1.min(self.height()).max(y0);
        let cropped =
            image::imageops::crop_imm(&self.gray, x0, y0, x1 - x0, y1 - y0).to_image();
        PageImage { gray: cropped }
    }
}

/// Cooperative cancellation token shared between a job and its requester.
///
/// Cancellation is observed at state boundaries and around engine calls; a
/// canceled job discards partial results and never writes to the cache.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Return `Err(Canceled)` if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_canceled() {
            Err(YomitoriError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// Raw output of one engine invocation, before any quality filtering.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub words: Vec<Word>,
    pub lines: Vec<Line>,
    pub text: String,
    pub confidence: f64,
}

/// Progress callback threaded into engine invocations. Receives 0–100.
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Sync);

/// The raw OCR engine, consumed at its interface boundary only.
///
/// Implementations may run their own worker pools internally; the pipeline
/// treats one `recognize` call as a single blocking-until-complete unit.
pub trait OcrEngine: Send + Sync {
    fn recognize(
        &self,
        image: &PageImage,
        language: &str,
        psm: Option<PageSegMode>,
        cancel: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> Result<EngineOutput>;
}

/// The page rasterizer, consumed at its interface boundary only.
pub trait Rasterizer: Send + Sync {
    /// Render one page (1-based) at the target resolution.
    fn render(&self, page_number: u32, target_dpi: u32) -> Result<PageImage>;
}

/// Lifecycle states of a page OCR job, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Init,
    Rendering,
    Ocr,
    Recovering,
    Complete,
    Canceled,
    Failed,
}

/// Per-job progress observer. One instance per job: concurrent jobs never
/// share a callback slot.
pub trait JobObserver: Send + Sync {
    fn on_stage(&self, _page_number: u32, _stage: JobStage) {}
    fn on_progress(&self, _page_number: u32, _percent: u8) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl JobObserver for NoopObserver {}

/// Receives completed page results. `on_cache_hit` fires for results served
/// without recomputation so callers can distinguish fresh from cached.
pub trait ResultConsumer: Send + Sync {
    fn on_page_completed(&self, page_number: u32, result: &PageOcrResult);
    fn on_cache_hit(&self, page_number: u32, result: &PageOcrResult, stale: bool);
}

/// Consumer that drops all results.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConsumer;

impl ResultConsumer for NoopConsumer {
    fn on_page_completed(&self, _page_number: u32, _result: &PageOcrResult) {}
    fn on_cache_hit(&self, _page_number: u32, _result: &PageOcrResult, _stale: bool) {}
}
