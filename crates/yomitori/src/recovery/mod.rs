//! Fallback recovery stage: narrow re-OCR passes over regions the engine
//! likely missed.
//!
//! Two passes run against the original grayscale image:
//!
//! - empty-line recovery: horizontal ink projection finds text rows; rows
//!   with zero surviving words are cropped and re-OCRed with a single-line
//!   segmentation mode.
//! - gap recovery: anomalously wide horizontal gaps between consecutive
//!   words in a line are cropped and re-OCRed with a single-word mode to
//!   pick up short missed tokens (particles, short CJK tokens).
//!
//! Recovered tokens are translated back to page coordinates and merged only
//! when they do not overlap an existing survivor above the IoU threshold,
//! which also makes the stage idempotent: re-running it on its own output
//! cannot grow the result.
//!
//! The whole stage is skipped on very sparse pages — below the survivor
//! minimum, narrow re-OCR passes cost more latency than the marginal recall
//! they add. Engine failures inside this stage are logged and swallowed;
//! only cancellation propagates.

use crate::engine::{CancelToken, OcrEngine, PageImage, ProgressFn};
use crate::error::Result;
use crate::types::{BoundingBox, PageSegMode, Word, group_into_lines};

/// Tunable thresholds for the recovery stage.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Skip the whole stage when fewer survivors than this remain.
    pub min_words_for_recovery: usize,
    /// A gap wider than this multiple of the line height is anomalous.
    pub gap_height_ratio: f64,
    /// Recovered tokens overlapping an existing word at or above this IoU
    /// are duplicates and discarded.
    pub iou_dedupe_threshold: f64,
    /// Recovered tokens below this confidence are discarded.
    pub min_recovered_confidence: f64,
    /// Luma below this counts as ink for the row projection.
    pub ink_luma_threshold: u8,
    /// Fraction of a row's width that must be ink for the row to count.
    pub min_ink_row_ratio: f64,
    /// Projection bands shorter than this are ignored.
    pub min_row_height: u32,
    /// Non-ink gaps up to this height stay inside one band.
    pub row_merge_slack: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            min_words_for_recovery: 4,
            gap_height_ratio: 2.0,
            iou_dedupe_threshold: 0.5,
            min_recovered_confidence: 55.0,
            ink_luma_threshold: 128,
            min_ink_row_ratio: 0.01,
            min_row_height: 8,
            row_merge_slack: 2,
        }
    }
}

/// Result of the recovery stage.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    pub words: Vec<Word>,
    pub recovered: usize,
}

/// Horizontal ink projection: maximal runs of inky rows, tolerating small
/// slack gaps, at least `min_row_height` tall.
fn projection_bands(image: &PageImage, config: &RecoveryConfig) -> Vec<(u32, u32)> {
    let width = image.width();
    let height = image.height();
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let min_ink = ((width as f64 * config.min_ink_row_ratio).ceil() as u32).max(1);

    let mut bands: Vec<(u32, u32)> = Vec::new();
    let mut current: Option<(u32, u32)> = None;
    let mut slack = 0u32;

    for y in 0..height {
        let mut ink = 0u32;
        for x in 0..width {
            if image.pixel(x, y) < config.ink_luma_threshold {
                ink += 1;
                if ink >= min_ink {
                    break;
                }
            }
        }
        let inky = ink >= min_ink;

        if inky {
            match current {
                None => current = Some((y, y + 1)),
                Some((_, ref mut end)) => *end = y + 1,
            }
            slack = 0;
        } else if let Some(band) = current {
            slack += 1;
            if slack > config.row_merge_slack {
                bands.push(band);
                current = None;
            }
        }
    }
    if let Some(band) = current {
        bands.push(band);
    }

    bands
        .into_iter()
        .filter(|(start, end)| end - start >= config.min_row_height)
        .collect()
}

fn overlaps_band(word: &Word, band: (u32, u32)) -> bool {
    word.bbox.y0 < band.1 && word.bbox.y1 > band.0
}

/// Add `candidate` unless an existing word already covers it.
fn absorb(words: &mut Vec<Word>, candidate: Word, iou_threshold: f64) -> bool {
    if words
        .iter()
        .all(|w| w.bbox.iou(&candidate.bbox) < iou_threshold)
    {
        words.push(candidate);
        true
    } else {
        false
    }
}

/// Re-OCR one cropped region and absorb acceptable tokens, translated back
/// to page coordinates. Engine failures are logged and swallowed.
#[allow(clippy::too_many_arguments)]
fn recover_region(
    words: &mut Vec<Word>,
    image: &PageImage,
    region: BoundingBox,
    psm: PageSegMode,
    language: &str,
    engine: &dyn OcrEngine,
    cancel: &CancelToken,
    progress: ProgressFn<'_>,
    config: &RecoveryConfig,
) -> Result<usize> {
    cancel.checkpoint()?;

    let crop = image.crop(region);
    if crop.width() == 0 || crop.height() == 0 {
        return Ok(0);
    }

    let output = match engine.recognize(&crop, language, Some(psm), cancel, progress) {
        Ok(output) => output,
        Err(err) if err.is_canceled() => return Err(err),
        Err(err) => {
            tracing::warn!(
                region = ?region,
                psm = psm.as_u8(),
                error = %err,
                "recovery sub-call failed, keeping pre-recovery result"
            );
            return Ok(0);
        }
    };

    let mut added = 0;
    for word in output.words {
        if word.confidence < config.min_recovered_confidence || word.text.trim().is_empty() {
            continue;
        }
        let translated = Word::new(
            word.text,
            word.bbox.translate(region.x0, region.y0),
            word.confidence,
        );
        if absorb(words, translated, config.iou_dedupe_threshold) {
            added += 1;
        }
    }
    Ok(added)
}

/// Run both recovery passes over the filtered survivors.
pub fn run_recovery(
    survivors: Vec<Word>,
    image: &PageImage,
    language: &str,
    engine: &dyn OcrEngine,
    cancel: &CancelToken,
    progress: ProgressFn<'_>,
    config: &RecoveryConfig,
) -> Result<RecoveryOutcome> {
    if survivors.len() < config.min_words_for_recovery {
        tracing::debug!(
            survivors = survivors.len(),
            minimum = config.min_words_for_recovery,
            "sparse page, skipping fallback recovery"
        );
        return Ok(RecoveryOutcome {
            words: survivors,
            recovered: 0,
        });
    }

    let mut words = survivors;
    let mut recovered = 0;

    // Empty-line pass.
    for band in projection_bands(image, config) {
        if words.iter().any(|w| overlaps_band(w, band)) {
            continue;
        }
        recovered += recover_region(
            &mut words,
            image,
            BoundingBox::new(0, band.0, image.width(), band.1),
            PageSegMode::SingleLine,
            language,
            engine,
            cancel,
            progress,
            config,
        )?;
    }

    // Gap pass over the merged word set.
    let lines = group_into_lines(&words);
    let mut gap_regions: Vec<BoundingBox> = Vec::new();
    for line in &lines {
        let line_height = line.bbox.height().max(1);
        for pair in line.words.windows(2) {
            let gap = pair[1].bbox.x0.saturating_sub(pair[0].bbox.x1);
            if gap as f64 > config.gap_height_ratio * line_height as f64 {
                gap_regions.push(BoundingBox::new(
                    pair[0].bbox.x1,
                    line.bbox.y0,
                    pair[1].bbox.x0,
                    line.bbox.y1,
                ));
            }
        }
    }
    for region in gap_regions {
        recovered += recover_region(
            &mut words,
            image,
            region,
            PageSegMode::SingleWord,
            language,
            engine,
            cancel,
            progress,
            config,
        )?;
    }

    Ok(RecoveryOutcome { words, recovered })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOutput;
    use crate::error::YomitoriError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn word(text: &str, x0: u32, y0: u32, x1: u32, y1: u32, conf: f64) -> Word {
        Word::new(text, BoundingBox::new(x0, y0, x1, y1), conf)
    }

    /// Engine mock that returns one fixed-confidence token covering most of
    /// whatever crop it is given, and counts invocations.
    struct CroppingEngine {
        calls: AtomicUsize,
        confidence: f64,
        fail: bool,
    }

    impl CroppingEngine {
        fn new(confidence: f64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                confidence,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                confidence: 0.0,
                fail: true,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl OcrEngine for CroppingEngine {
        fn recognize(
            &self,
            image: &PageImage,
            _language: &str,
            _psm: Option<PageSegMode>,
            cancel: &CancelToken,
            _progress: ProgressFn<'_>,
        ) -> Result<EngineOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            cancel.checkpoint()?;
            if self.fail {
                return Err(YomitoriError::engine("mock backend failure"));
            }
            let w = image.width();
            let h = image.height();
            if w < 4 || h < 4 {
                return Ok(EngineOutput::default());
            }
            let token = word("회복", 1, 1, w - 1, h - 1, self.confidence);
            Ok(EngineOutput {
                text: token.text.clone(),
                confidence: token.confidence,
                words: vec![token],
                lines: vec![],
            })
        }
    }

    /// White page with a solid ink band drawn across the given rows.
    fn page_with_ink_band(width: u32, height: u32, band: Option<(u32, u32)>) -> PageImage {
        let mut pixels = vec![255u8; (width * height) as usize];
        if let Some((y0, y1)) = band {
            for y in y0..y1.min(height) {
                for x in 0..width {
                    pixels[(y * width + x) as usize] = 0;
                }
            }
        }
        PageImage::from_raw(width, height, pixels).unwrap()
    }

    fn dense_survivors() -> Vec<Word> {
        vec![
            word("첫", 10, 10, 40, 30, 90.0),
            word("번째", 50, 10, 100, 30, 88.0),
            word("줄의", 110, 10, 160, 30, 85.0),
            word("단어", 170, 10, 220, 30, 91.0),
        ]
    }

    #[test]
    fn test_projection_bands_finds_ink_rows() {
        let img = page_with_ink_band(200, 200, Some((100, 120)));
        let bands = projection_bands(&img, &RecoveryConfig::default());
        assert_eq!(bands, vec![(100, 120)]);
    }

    #[test]
    fn test_projection_bands_blank_page() {
        let img = page_with_ink_band(200, 200, None);
        assert!(projection_bands(&img, &RecoveryConfig::default()).is_empty());
    }

    #[test]
    fn test_skips_entirely_below_minimum_word_count() {
        let img = page_with_ink_band(200, 200, Some((100, 120)));
        let engine = CroppingEngine::new(80.0);
        let survivors = vec![word("혼자", 10, 10, 60, 30, 40.0)];
        let outcome = run_recovery(
            survivors.clone(),
            &img,
            "kor",
            &engine,
            &CancelToken::new(),
            &|_| {},
            &RecoveryConfig::default(),
        )
        .unwrap();
        assert_eq!(outcome.recovered, 0);
        assert_eq!(outcome.words, survivors);
        assert_eq!(engine.call_count(), 0);
    }

    #[test]
    fn test_empty_line_recovery_adds_translated_word() {
        let img = page_with_ink_band(200, 200, Some((100, 120)));
        let engine = CroppingEngine::new(80.0);
        let outcome = run_recovery(
            dense_survivors(),
            &img,
            "kor",
            &engine,
            &CancelToken::new(),
            &|_| {},
            &RecoveryConfig::default(),
        )
        .unwrap();
        assert_eq!(outcome.recovered, 1);
        assert_eq!(engine.call_count(), 1);
        let added = outcome
            .words
            .iter()
            .find(|w| w.text == "회복")
            .expect("recovered word present");
        // Crop started at page row 100, so the token is translated back.
        assert_eq!(added.bbox.y0, 101);
        assert_eq!(added.bbox.y1, 119);
    }

    #[test]
    fn test_low_confidence_recovered_tokens_are_discarded() {
        let img = page_with_ink_band(200, 200, Some((100, 120)));
        let engine = CroppingEngine::new(30.0);
        let outcome = run_recovery(
            dense_survivors(),
            &img,
            "kor",
            &engine,
            &CancelToken::new(),
            &|_| {},
            &RecoveryConfig::default(),
        )
        .unwrap();
        assert_eq!(outcome.recovered, 0);
        assert_eq!(engine.call_count(), 1);
    }

    #[test]
    fn test_gap_recovery_fills_wide_gap() {
        let img = page_with_ink_band(400, 60, None);
        let engine = CroppingEngine::new(80.0);
        let survivors = vec![
            word("멀리", 0, 10, 40, 30, 90.0),
            word("떨어진", 200, 10, 260, 30, 88.0),
            word("두", 270, 10, 290, 30, 85.0),
            word("번째", 300, 10, 350, 30, 86.0),
        ];
        let outcome = run_recovery(
            survivors,
            &img,
            "kor",
            &engine,
            &CancelToken::new(),
            &|_| {},
            &RecoveryConfig::default(),
        )
        .unwrap();
        // The 160px gap against a 20px line height triggers one SingleWord
        // pass; the other gaps stay under the ratio.
        assert_eq!(engine.call_count(), 1);
        assert_eq!(outcome.recovered, 1);
        let added = outcome.words.iter().find(|w| w.text == "회복").unwrap();
        assert!(added.bbox.x0 >= 40 && added.bbox.x1 <= 200);
    }

    #[test]
    fn test_recovery_idempotent() {
        let img = page_with_ink_band(200, 200, Some((100, 120)));
        let engine = CroppingEngine::new(80.0);
        let config = RecoveryConfig::default();
        let first = run_recovery(
            dense_survivors(),
            &img,
            "kor",
            &engine,
            &CancelToken::new(),
            &|_| {},
            &config,
        )
        .unwrap();
        assert_eq!(first.recovered, 1);

        let second = run_recovery(
            first.words.clone(),
            &img,
            "kor",
            &engine,
            &CancelToken::new(),
            &|_| {},
            &config,
        )
        .unwrap();
        assert_eq!(second.recovered, 0);
        assert_eq!(second.words, first.words);
    }

    #[test]
    fn test_engine_failure_is_swallowed() {
        let img = page_with_ink_band(200, 200, Some((100, 120)));
        let engine = CroppingEngine::failing();
        let survivors = dense_survivors();
        let outcome = run_recovery(
            survivors.clone(),
            &img,
            "kor",
            &engine,
            &CancelToken::new(),
            &|_| {},
            &RecoveryConfig::default(),
        )
        .unwrap();
        assert_eq!(outcome.words, survivors);
        assert_eq!(outcome.recovered, 0);
        assert_eq!(engine.call_count(), 1);
    }

    #[test]
    fn test_cancellation_propagates() {
        let img = page_with_ink_band(200, 200, Some((100, 120)));
        let engine = CroppingEngine::new(80.0);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = run_recovery(
            dense_survivors(),
            &img,
            "kor",
            &engine,
            &cancel,
            &|_| {},
            &RecoveryConfig::default(),
        );
        assert!(matches!(result, Err(YomitoriError::Canceled)));
        assert_eq!(engine.call_count(), 0);
    }
}
