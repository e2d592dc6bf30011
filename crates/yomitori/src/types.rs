//! Shared data structures for words, lines, and page results.
//!
//! `PageOcrResult::words` is the source of truth: `lines`, `text`, and
//! `avg_confidence` are derived from it and rebuilt through
//! [`PageOcrResult::assemble`]. Filter and recovery stages drop or add whole
//! words; they never mutate a word in place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version counter for the filter/recovery logic itself. Bumped whenever
/// their behavior changes semantics, so cached results built under older
/// logic stop being exact-compatible.
pub const ALGORITHM_VERSION: u32 = 7;

/// Axis-aligned box in image pixel space. `x1`/`y1` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl BoundingBox {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let w = self.x1.min(other.x1).saturating_sub(self.x0.max(other.x0));
        let h = self.y1.min(other.y1).saturating_sub(self.y0.max(other.y0));
        w as u64 * h as u64
    }

    /// Intersection over union, in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let inter = self.intersection_area(other);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union == 0 {
            return 0.0;
        }
        inter as f64 / union as f64
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn translate(&self, dx: u32, dy: u32) -> BoundingBox {
        BoundingBox {
            x0: self.x0 + dx,
            y0: self.y0 + dy,
            x1: self.x1 + dx,
            y1: self.y1 + dy,
        }
    }

    pub fn vertical_overlap(&self, other: &BoundingBox) -> u32 {
        self.y1.min(other.y1).saturating_sub(self.y0.max(other.y0))
    }
}

/// A recognized token with its location and engine confidence (0–100).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub bbox: BoundingBox,
    pub confidence: f64,
}

impl Word {
    pub fn new<S: Into<String>>(text: S, bbox: BoundingBox, confidence: f64) -> Self {
        Self {
            text: text.into(),
            bbox,
            confidence,
        }
    }
}

/// An ordered run of words sharing a text line. Derived, never authored:
/// construct through [`Line::from_words`] or [`group_into_lines`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub words: Vec<Word>,
    pub bbox: BoundingBox,
    pub text: String,
}

impl Line {
    /// Build a line from words already known to share a row. Words are
    /// ordered left to right; the line box is the union of word boxes.
    pub fn from_words(mut words: Vec<Word>) -> Option<Line> {
        if words.is_empty() {
            return None;
        }
        words.sort_by(|a, b| (a.bbox.x0, a.bbox.y0).cmp(&(b.bbox.x0, b.bbox.y0)));
        let bbox = words
            .iter()
            .skip(1)
            .fold(words[0].bbox, |acc, w| acc.union(&w.bbox));
        let text = words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Some(Line { words, bbox, text })
    }
}

/// Cluster word indices into rows by vertical overlap.
///
/// A word joins an existing row when its box overlaps the row's running box
/// by at least half the smaller of the two heights. Deterministic for a
/// given input: words are visited in (y0, x0) order. Rows come back sorted
/// top to bottom.
pub(crate) fn group_word_rows(words: &[Word]) -> Vec<(BoundingBox, Vec<usize>)> {
    if words.is_empty() {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..words.len()).collect();
    order.sort_by_key(|&i| (words[i].bbox.y0, words[i].bbox.x0));

    let mut rows: Vec<(BoundingBox, Vec<usize>)> = Vec::new();
    for &i in &order {
        let b = words[i].bbox;
        let mut joined = false;
        for (row_box, members) in rows.iter_mut() {
            let overlap = b.vertical_overlap(row_box);
            let min_h = b.height().min(row_box.height()).max(1);
            if overlap * 2 >= min_h {
                *row_box = row_box.union(&b);
                members.push(i);
                joined = true;
                break;
            }
        }
        if !joined {
            rows.push((b, vec![i]));
        }
    }

    rows.sort_by_key(|(row_box, _)| (row_box.y0, row_box.x0));
    rows
}

/// Cluster words into text lines by vertical overlap.
pub fn group_into_lines(words: &[Word]) -> Vec<Line> {
    group_word_rows(words)
        .into_iter()
        .filter_map(|(_, members)| {
            Line::from_words(members.into_iter().map(|i| words[i].clone()).collect())
        })
        .collect()
}

/// Drop duplicated words whose boxes overlap above `iou_threshold`, keeping
/// the copy with higher confidence. Survivor order is by position.
pub fn dedupe_words(words: Vec<Word>, iou_threshold: f64) -> Vec<Word> {
    let mut candidates = words;
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (a.bbox.y0, a.bbox.x0, a.text.as_str()).cmp(&(b.bbox.y0, b.bbox.x0, b.text.as_str())))
    });

    let mut kept: Vec<Word> = Vec::with_capacity(candidates.len());
    for word in candidates {
        if kept.iter().all(|k| k.bbox.iou(&word.bbox) < iou_threshold) {
            kept.push(word);
        }
    }
    kept.sort_by_key(|w| (w.bbox.y0, w.bbox.x0));
    kept
}

/// Page segmentation mode passed to the OCR engine. The narrow modes are
/// used by the recovery stage to constrain re-OCR of cropped regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSegMode {
    Auto = 3,
    SingleBlock = 6,
    SingleLine = 7,
    SingleWord = 8,
}

impl PageSegMode {
    pub fn from_u8(value: u8) -> Result<Self, String> {
        match value {
            3 => Ok(PageSegMode::Auto),
            6 => Ok(PageSegMode::SingleBlock),
            7 => Ok(PageSegMode::SingleLine),
            8 => Ok(PageSegMode::SingleWord),
            _ => Err(format!("Invalid page segmentation mode value: {}", value)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Why the quality filter stage dropped a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    LineNoise,
    ImageTile,
    BackgroundVariance,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::LineNoise => "line_noise",
            DropReason::ImageTile => "image_tile",
            DropReason::BackgroundVariance => "background_variance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedWord {
    pub word: Word,
    pub reason: DropReason,
}

/// Diagnostics block carried on every page result: which tokens were
/// dropped, tagged by reason, plus per-reason counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrDebugInfo {
    pub dropped: Vec<DroppedWord>,
    pub drop_counts: BTreeMap<String, usize>,
    pub recovered_words: usize,
}

impl OcrDebugInfo {
    pub fn record_drop(&mut self, word: Word, reason: DropReason) {
        *self.drop_counts.entry(reason.as_str().to_string()).or_insert(0) += 1;
        self.dropped.push(DroppedWord { word, reason });
    }

    pub fn merge(&mut self, other: OcrDebugInfo) {
        for (reason, count) in other.drop_counts {
            *self.drop_counts.entry(reason).or_insert(0) += count;
        }
        self.dropped.extend(other.dropped);
        self.recovered_words += other.recovered_words;
    }

    pub fn total_dropped(&self) -> usize {
        self.dropped.len()
    }
}

/// The settings tuple that decides whether a cached result is reusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub language: String,
    pub dpi: u32,
    pub psm: Option<PageSegMode>,
    pub algorithm_version: u32,
}

impl Fingerprint {
    /// All four components match: the cached result is current.
    pub fn exact_compatible(&self, other: &Fingerprint) -> bool {
        self == other
    }

    /// Only the language set matches: usable for display while a recompute
    /// is pending, but marked stale.
    pub fn display_compatible(&self, other: &Fingerprint) -> bool {
        self.language == other.language
    }
}

/// Completed OCR output for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageOcrResult {
    /// 1-based page number.
    pub page_number: u32,
    /// Canonical sorted '+'-joined language identifiers.
    pub language: String,
    pub dpi: u32,
    pub psm: Option<PageSegMode>,
    pub algorithm_version: u32,
    pub words: Vec<Word>,
    pub lines: Vec<Line>,
    pub text: String,
    pub avg_confidence: f64,
    pub image_width: u32,
    pub image_height: u32,
    #[serde(default)]
    pub debug: OcrDebugInfo,
}

impl PageOcrResult {
    /// Build a result from its source-of-truth word list, deriving lines,
    /// text, and average confidence.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        page_number: u32,
        language: String,
        dpi: u32,
        psm: Option<PageSegMode>,
        words: Vec<Word>,
        image_width: u32,
        image_height: u32,
        debug: OcrDebugInfo,
    ) -> Self {
        let lines = group_into_lines(&words);
        let text = lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let avg_confidence = if words.is_empty() {
            0.0
        } else {
            words.iter().map(|w| w.confidence).sum::<f64>() / words.len() as f64
        };

        Self {
            page_number,
            language,
            dpi,
            psm,
            algorithm_version: ALGORITHM_VERSION,
            words,
            lines,
            text,
            avg_confidence,
            image_width,
            image_height,
            debug,
        }
    }

    /// Recompute `lines`, `text`, and `avg_confidence` from `words`.
    pub fn rebuild_derived(&mut self) {
        self.lines = group_into_lines(&self.words);
        self.text = self
            .lines
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.avg_confidence = if self.words.is_empty() {
            0.0
        } else {
            self.words.iter().map(|w| w.confidence).sum::<f64>() / self.words.len() as f64
        };
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            language: self.language.clone(),
            dpi: self.dpi,
            psm: self.psm,
            algorithm_version: self.algorithm_version,
        }
    }
}

/// Canonicalize a language-set string: split on '+', trim, drop empties,
/// sort, dedup, re-join with '+'. `"jpn+eng"` and `"eng+jpn"` both map to
/// `"eng+jpn"`.
pub fn canonical_language_set(raw: &str) -> String {
    let mut parts: Vec<&str> = raw
        .split('+')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    parts.sort_unstable();
    parts.dedup();
    parts.join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, x0: u32, y0: u32, x1: u32, y1: u32, conf: f64) -> Word {
        Word::new(text, BoundingBox::new(x0, y0, x1, y1), conf)
    }

    #[test]
    fn test_bbox_dimensions() {
        let b = BoundingBox::new(10, 20, 30, 50);
        assert_eq!(b.width(), 20);
        assert_eq!(b.height(), 30);
        assert_eq!(b.area(), 600);
    }

    #[test]
    fn test_bbox_iou_identical() {
        let b = BoundingBox::new(0, 0, 10, 10);
        assert!((b.iou(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_bbox_iou_disjoint() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(20, 20, 30, 30);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_bbox_iou_partial() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 0, 15, 10);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_bbox_translate() {
        let b = BoundingBox::new(1, 2, 3, 4).translate(10, 20);
        assert_eq!(b, BoundingBox::new(11, 22, 13, 24));
    }

    #[test]
    fn test_line_from_words_orders_by_x() {
        let line = Line::from_words(vec![
            word("world", 60, 0, 110, 20, 90.0),
            word("hello", 0, 0, 50, 20, 95.0),
        ])
        .unwrap();
        assert_eq!(line.text, "hello world");
        assert_eq!(line.bbox, BoundingBox::new(0, 0, 110, 20));
    }

    #[test]
    fn test_line_from_words_empty() {
        assert!(Line::from_words(vec![]).is_none());
    }

    #[test]
    fn test_group_into_lines_two_rows() {
        let words = vec![
            word("a", 0, 0, 20, 20, 90.0),
            word("b", 30, 2, 50, 22, 90.0),
            word("c", 0, 100, 20, 120, 90.0),
        ];
        let lines = group_into_lines(&words);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "a b");
        assert_eq!(lines[1].text, "c");
    }

    #[test]
    fn test_group_into_lines_deterministic() {
        let words = vec![
            word("b", 30, 2, 50, 22, 90.0),
            word("a", 0, 0, 20, 20, 90.0),
        ];
        let first = group_into_lines(&words);
        let second = group_into_lines(&words);
        assert_eq!(first, second);
        assert_eq!(first[0].text, "a b");
    }

    #[test]
    fn test_dedupe_words_prefers_higher_confidence() {
        let words = vec![
            word("low", 0, 0, 50, 20, 60.0),
            word("high", 1, 1, 51, 21, 90.0),
        ];
        let kept = dedupe_words(words, 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].text, "high");
    }

    #[test]
    fn test_dedupe_words_keeps_disjoint() {
        let words = vec![
            word("a", 0, 0, 50, 20, 60.0),
            word("b", 100, 0, 150, 20, 90.0),
        ];
        let kept = dedupe_words(words, 0.5);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_dedupe_words_no_surviving_overlap() {
        let words = vec![
            word("a", 0, 0, 50, 20, 60.0),
            word("b", 2, 0, 52, 20, 70.0),
            word("c", 4, 0, 54, 20, 80.0),
        ];
        let kept = dedupe_words(words, 0.5);
        for (i, a) in kept.iter().enumerate() {
            for b in kept.iter().skip(i + 1) {
                assert!(a.bbox.iou(&b.bbox) < 0.5);
            }
        }
    }

    #[test]
    fn test_page_seg_mode_round_trip() {
        for mode in [
            PageSegMode::Auto,
            PageSegMode::SingleBlock,
            PageSegMode::SingleLine,
            PageSegMode::SingleWord,
        ] {
            assert_eq!(PageSegMode::from_u8(mode.as_u8()).unwrap(), mode);
        }
    }

    #[test]
    fn test_page_seg_mode_invalid() {
        assert!(PageSegMode::from_u8(99).is_err());
    }

    #[test]
    fn test_debug_info_records_counts() {
        let mut debug = OcrDebugInfo::default();
        debug.record_drop(word("x", 0, 0, 5, 5, 10.0), DropReason::LineNoise);
        debug.record_drop(word("y", 0, 0, 5, 5, 10.0), DropReason::LineNoise);
        debug.record_drop(word("z", 0, 0, 5, 5, 10.0), DropReason::ImageTile);
        assert_eq!(debug.drop_counts.get("line_noise"), Some(&2));
        assert_eq!(debug.drop_counts.get("image_tile"), Some(&1));
        assert_eq!(debug.total_dropped(), 3);
    }

    #[test]
    fn test_debug_info_merge() {
        let mut a = OcrDebugInfo::default();
        a.record_drop(word("x", 0, 0, 5, 5, 10.0), DropReason::LineNoise);
        let mut b = OcrDebugInfo::default();
        b.record_drop(word("y", 0, 0, 5, 5, 10.0), DropReason::LineNoise);
        b.recovered_words = 2;
        a.merge(b);
        assert_eq!(a.drop_counts.get("line_noise"), Some(&2));
        assert_eq!(a.recovered_words, 2);
    }

    #[test]
    fn test_fingerprint_exact_compatible_ignores_words() {
        let a = PageOcrResult::assemble(
            1,
            "eng+jpn".to_string(),
            300,
            Some(PageSegMode::Auto),
            vec![word("hello", 0, 0, 50, 20, 95.0)],
            1000,
            1500,
            OcrDebugInfo::default(),
        );
        let b = PageOcrResult::assemble(
            1,
            "eng+jpn".to_string(),
            300,
            Some(PageSegMode::Auto),
            vec![],
            800,
            900,
            OcrDebugInfo::default(),
        );
        assert!(a.fingerprint().exact_compatible(&b.fingerprint()));
    }

    #[test]
    fn test_fingerprint_display_compatible_but_stale() {
        let base = Fingerprint {
            language: "kor".to_string(),
            dpi: 300,
            psm: None,
            algorithm_version: ALGORITHM_VERSION,
        };
        let other_dpi = Fingerprint {
            dpi: 150,
            ..base.clone()
        };
        assert!(base.display_compatible(&other_dpi));
        assert!(!base.exact_compatible(&other_dpi));

        let other_lang = Fingerprint {
            language: "jpn".to_string(),
            ..base.clone()
        };
        assert!(!base.display_compatible(&other_lang));
    }

    #[test]
    fn test_assemble_derives_text_and_confidence() {
        let result = PageOcrResult::assemble(
            2,
            "kor".to_string(),
            300,
            None,
            vec![
                word("첫", 0, 0, 30, 30, 80.0),
                word("줄", 40, 0, 70, 30, 90.0),
                word("둘째", 0, 100, 60, 130, 70.0),
            ],
            500,
            700,
            OcrDebugInfo::default(),
        );
        assert_eq!(result.text, "첫 줄\n둘째");
        assert_eq!(result.lines.len(), 2);
        assert!((result.avg_confidence - 80.0).abs() < 1e-9);
        assert_eq!(result.algorithm_version, ALGORITHM_VERSION);
    }

    #[test]
    fn test_assemble_empty_words() {
        let result = PageOcrResult::assemble(
            1,
            "kor".to_string(),
            300,
            None,
            vec![],
            500,
            700,
            OcrDebugInfo::default(),
        );
        assert_eq!(result.text, "");
        assert_eq!(result.avg_confidence, 0.0);
        assert!(result.lines.is_empty());
    }

    #[test]
    fn test_rebuild_derived_tracks_words() {
        let mut result = PageOcrResult::assemble(
            1,
            "kor".to_string(),
            300,
            None,
            vec![word("a", 0, 0, 20, 20, 50.0)],
            500,
            700,
            OcrDebugInfo::default(),
        );
        result.words.push(word("b", 30, 0, 50, 20, 100.0));
        result.rebuild_derived();
        assert_eq!(result.text, "a b");
        assert!((result.avg_confidence - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_canonical_language_set() {
        assert_eq!(canonical_language_set("jpn+eng"), "eng+jpn");
        assert_eq!(canonical_language_set("eng+jpn"), "eng+jpn");
        assert_eq!(canonical_language_set(" kor "), "kor");
        assert_eq!(canonical_language_set("kor+kor"), "kor");
        assert_eq!(canonical_language_set("kor++eng"), "eng+kor");
        assert_eq!(canonical_language_set(""), "");
    }

    #[test]
    fn test_result_serde_round_trip() {
        let result = PageOcrResult::assemble(
            3,
            "eng+kor".to_string(),
            300,
            Some(PageSegMode::SingleBlock),
            vec![word("hello", 0, 0, 50, 20, 95.0)],
            1000,
            1400,
            OcrDebugInfo::default(),
        );
        let json = serde_json::to_string(&result).unwrap();
        let back: PageOcrResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);

        let packed = rmp_serde::to_vec(&result).unwrap();
        let back: PageOcrResult = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(back, result);
    }
}
