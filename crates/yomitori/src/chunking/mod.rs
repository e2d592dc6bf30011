//! Chunking controller for oversized page images.
//!
//! Pages taller than the engine's practical limit are split into vertical
//! bands of fixed height with a fixed pixel overlap between consecutive
//! bands. Each band runs the full engine + filter + recovery pipeline
//! independently (bands in parallel via rayon); band-local coordinates are
//! offset by the band's vertical start and duplicates created inside the
//! overlap region are dropped, preferring the higher-confidence copy. The
//! merged output is indistinguishable in shape from a non-chunked result.

use rayon::prelude::*;

use crate::engine::{CancelToken, PageImage};
use crate::error::Result;
use crate::types::{BoundingBox, DroppedWord, OcrDebugInfo, Word, dedupe_words};

/// Tunable thresholds for the chunking controller.
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Images taller than this are chunked.
    pub max_page_height: u32,
    /// Height of each band.
    pub band_height: u32,
    /// Overlap between consecutive bands.
    pub band_overlap: u32,
    /// Words overlapping across bands at or above this IoU are duplicates.
    pub iou_dedupe_threshold: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_page_height: 4096,
            band_height: 2048,
            band_overlap: 128,
            iou_dedupe_threshold: 0.4,
        }
    }
}

/// Band-local pipeline output, before coordinate translation.
#[derive(Debug, Clone, Default)]
pub struct BandOutput {
    pub words: Vec<Word>,
    pub debug: OcrDebugInfo,
    pub recovered: usize,
}

/// Merged page-coordinate output of a chunked run.
#[derive(Debug, Clone, Default)]
pub struct ChunkOutcome {
    pub words: Vec<Word>,
    pub debug: OcrDebugInfo,
    pub recovered: usize,
}

pub fn needs_chunking(image: &PageImage, config: &ChunkingConfig) -> bool {
    image.height() > config.max_page_height
}

/// Vertical band ranges `[y0, y1)` covering the full height, consecutive
/// bands sharing `band_overlap` rows.
pub fn split_bands(height: u32, config: &ChunkingConfig) -> Vec<(u32, u32)> {
    if height == 0 {
        return Vec::new();
    }
    let band_height = config.band_height.max(1);
    let step = band_height.saturating_sub(config.band_overlap).max(1);

    let mut bands = Vec::new();
    let mut y0 = 0u32;
    loop {
        let y1 = (y0 + band_height).min(height);
        bands.push((y0, y1));
        if y1 == height {
            break;
        }
        y0 += step;
    }
    bands
}

/// Run `band_fn` over every band in parallel and merge the results.
///
/// `band_fn` receives the cropped band image and the band index, and runs
/// engine + filter + recovery on it. Cancellation is observed per band;
/// the first error in band order wins, with cancellation taking priority.
pub fn run_chunked<F>(
    image: &PageImage,
    config: &ChunkingConfig,
    cancel: &CancelToken,
    band_fn: F,
) -> Result<ChunkOutcome>
where
    F: Fn(&PageImage, usize) -> Result<BandOutput> + Sync,
{
    let bands = split_bands(image.height(), config);
    tracing::debug!(
        bands = bands.len(),
        height = image.height(),
        "running chunked OCR"
    );

    let band_results: Vec<Result<BandOutput>> = bands
        .par_iter()
        .enumerate()
        .map(|(idx, &(y0, y1))| {
            cancel.checkpoint()?;
            let crop = image.crop(BoundingBox::new(0, y0, image.width(), y1));
            let mut output = band_fn(&crop, idx)?;
            for word in &mut output.words {
                word.bbox = word.bbox.translate(0, y0);
            }
            for DroppedWord { word, .. } in &mut output.debug.dropped {
                word.bbox = word.bbox.translate(0, y0);
            }
            Ok(output)
        })
        .collect();

    let mut outputs = Vec::with_capacity(band_results.len());
    let mut first_error = None;
    for result in band_results {
        match result {
            Ok(output) => outputs.push(output),
            Err(err) if err.is_canceled() => return Err(err),
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }

    let mut outcome = ChunkOutcome::default();
    let mut all_words = Vec::new();
    for output in outputs {
        all_words.extend(output.words);
        outcome.debug.merge(output.debug);
        outcome.recovered += output.recovered;
    }
    outcome.words = dedupe_words(all_words, config.iou_dedupe_threshold);
    Ok(outcome)
}
