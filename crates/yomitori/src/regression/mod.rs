//! Offline regression scoring between two OCR result sets.
//!
//! Compares a baseline and a candidate run page by page, computing per-set
//! shape statistics and a suspicious-token ratio, then applies additive
//! risk rules. Pages scoring at or above the risk threshold are "risky" and
//! carry a capped sample of the normalized-vocabulary set difference in
//! both directions to aid manual triage. Used as an automated quality gate
//! between pipeline versions.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, YomitoriError};
use crate::types::PageOcrResult;

static NON_ALNUM_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^\p{L}\p{N}]+").expect("Token normalization regex pattern is valid and should compile")
});

/// Cap on vocabulary-difference samples carried per risky page.
pub const VOCAB_SAMPLE_CAP: usize = 8;

/// Shape statistics for one page of one result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageStats {
    pub word_count: usize,
    pub line_count: usize,
    pub avg_words_per_line: f64,
    pub mean_confidence: f64,
    pub suspicious_ratio: f64,
    pub dropped_tokens: usize,
}

/// Why a page was scored risky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    CoverageDrop,
    LineFragmentation,
    GhostSpike,
    FilterOverDrop,
    MissingPage,
}

impl RiskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskReason::CoverageDrop => "coverage_drop",
            RiskReason::LineFragmentation => "line_fragmentation",
            RiskReason::GhostSpike => "ghost_spike",
            RiskReason::FilterOverDrop => "filter_over_drop",
            RiskReason::MissingPage => "missing_page",
        }
    }
}

/// One risky page with its triage detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRisk {
    pub page_number: u32,
    pub score: u32,
    pub reasons: Vec<RiskReason>,
    pub baseline: Option<PageStats>,
    pub candidate: Option<PageStats>,
    /// Normalized tokens present in baseline but not candidate (sample).
    pub lost_tokens: Vec<String>,
    /// Normalized tokens present in candidate but not baseline (sample).
    pub gained_tokens: Vec<String>,
}

/// Full comparison report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub risk_threshold: u32,
    pub baseline_pages: usize,
    pub candidate_pages: usize,
    pub pages_compared: usize,
    pub risky_pages: Vec<PageRisk>,
}

impl RegressionReport {
    pub fn has_risky_pages(&self) -> bool {
        !self.risky_pages.is_empty()
    }
}

fn is_hangul_syllable(c: char) -> bool {
    ('\u{AC00}'..='\u{D7A3}').contains(&c)
}

fn is_hangul_jamo(c: char) -> bool {
    matches!(
        c,
        '\u{1100}'..='\u{11FF}'
            | '\u{3130}'..='\u{318F}'
            | '\u{A960}'..='\u{A97F}'
            | '\u{D7B0}'..='\u{D7FF}'
    )
}

fn language_set_has_latin(language: &str) -> bool {
    language
        .split('+')
        .any(|l| matches!(l, "eng" | "fra" | "deu" | "spa" | "ita" | "por" | "nld" | "lat"))
}

/// Heuristic noise detection for recognized tokens.
///
/// Matches the patterns OCR noise takes in this corpus: sub-character jamo
/// fragments without a composed syllable block, tiny purely numeric tokens,
/// stray 1–2 letter Latin tokens on pages whose declared language is not
/// Latin-script, and short syllable tokens with jamo marks only at their
/// edges.
pub fn is_suspicious_token(token: &str, language: &str) -> bool {
    let chars: Vec<char> = token.chars().collect();
    if chars.is_empty() {
        return false;
    }
    let len = chars.len();

    let has_syllable = chars.iter().any(|&c| is_hangul_syllable(c));
    let jamo_positions: Vec<usize> = chars
        .iter()
        .enumerate()
        .filter(|(_, c)| is_hangul_jamo(**c))
        .map(|(i, _)| i)
        .collect();

    // Sub-character marks without a real syllable block.
    if !jamo_positions.is_empty() && !has_syllable {
        return true;
    }

    // Tiny purely numeric tokens.
    if len <= 3 && chars.iter().all(|c| c.is_ascii_digit()) {
        return true;
    }

    // Stray short Latin tokens on non-Latin pages.
    if len <= 2
        && chars.iter().all(|c| c.is_ascii_alphabetic())
        && !language_set_has_latin(language)
    {
        return true;
    }

    // Short syllable tokens with marks only at the edges.
    if len <= 4
        && has_syllable
        && !jamo_positions.is_empty()
        && jamo_positions.iter().all(|&i| i == 0 || i == len - 1)
    {
        return true;
    }

    false
}

/// Lower-case and strip non-letter/non-digit characters for vocabulary
/// comparison.
pub fn normalize_token(token: &str) -> String {
    NON_ALNUM_PATTERN
        .replace_all(&token.to_lowercase(), "")
        .into_owned()
}

/// Compute shape statistics for one page result.
pub fn page_stats(result: &PageOcrResult) -> PageStats {
    let word_count = result.words.len();
    let line_count = result.lines.len();
    let suspicious = result
        .words
        .iter()
        .filter(|w| is_suspicious_token(&w.text, &result.language))
        .count();

    PageStats {
        word_count,
        line_count,
        avg_words_per_line: if line_count == 0 {
            0.0
        } else {
            word_count as f64 / line_count as f64
        },
        mean_confidence: result.avg_confidence,
        suspicious_ratio: if word_count == 0 {
            0.0
        } else {
            suspicious as f64 / word_count as f64
        },
        dropped_tokens: result.debug.total_dropped(),
    }
}

fn coverage_drop_fires(baseline_words: usize, candidate_words: usize) -> bool {
    baseline_words >= 6 && (candidate_words as f64) < 0.9 * baseline_words as f64
}

fn score_pair(baseline: &PageStats, candidate: &PageStats) -> (u32, Vec<RiskReason>) {
    let mut score = 0;
    let mut reasons = Vec::new();

    if coverage_drop_fires(baseline.word_count, candidate.word_count) {
        score += 2;
        reasons.push(RiskReason::CoverageDrop);
    }

    if candidate.line_count > baseline.line_count
        && candidate.avg_words_per_line < 0.7 * baseline.avg_words_per_line
    {
        score += 2;
        reasons.push(RiskReason::LineFragmentation);
    }

    if candidate.suspicious_ratio > f64::max(0.15, baseline.suspicious_ratio + 0.08) {
        score += 2;
        reasons.push(RiskReason::GhostSpike);
    }

    if candidate.dropped_tokens > 0 && candidate.word_count < baseline.word_count {
        score += 1;
        reasons.push(RiskReason::FilterOverDrop);
    }

    (score, reasons)
}

fn vocabulary(result: &PageOcrResult) -> BTreeSet<String> {
    result
        .words
        .iter()
        .map(|w| normalize_token(&w.text))
        .filter(|t| !t.is_empty())
        .collect()
}

fn sampled_difference(from: &BTreeSet<String>, subtract: &BTreeSet<String>) -> Vec<String> {
    from.difference(subtract)
        .take(VOCAB_SAMPLE_CAP)
        .cloned()
        .collect()
}

/// Compare two result sets keyed by page number.
pub fn compare_result_sets(
    baseline: &BTreeMap<u32, PageOcrResult>,
    candidate: &BTreeMap<u32, PageOcrResult>,
    risk_threshold: u32,
) -> RegressionReport {
    let all_pages: BTreeSet<u32> = baseline.keys().chain(candidate.keys()).copied().collect();

    let mut risky_pages = Vec::new();
    for &page in &all_pages {
        let base = baseline.get(&page);
        let cand = candidate.get(&page);

        let (score, reasons, base_stats, cand_stats) = match (base, cand) {
            (Some(b), Some(c)) => {
                let bs = page_stats(b);
                let cs = page_stats(c);
                let (score, reasons) = score_pair(&bs, &cs);
                (score, reasons, Some(bs), Some(cs))
            }
            (Some(b), None) => (3, vec![RiskReason::MissingPage], Some(page_stats(b)), None),
            (None, Some(c)) => (3, vec![RiskReason::MissingPage], None, Some(page_stats(c))),
            (None, None) => continue,
        };

        if score >= risk_threshold {
            let base_vocab = base.map(vocabulary).unwrap_or_default();
            let cand_vocab = cand.map(vocabulary).unwrap_or_default();
            risky_pages.push(PageRisk {
                page_number: page,
                score,
                reasons,
                baseline: base_stats,
                candidate: cand_stats,
                lost_tokens: sampled_difference(&base_vocab, &cand_vocab),
                gained_tokens: sampled_difference(&cand_vocab, &base_vocab),
            });
        }
    }

    risky_pages.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.page_number.cmp(&b.page_number))
    });

    RegressionReport {
        risk_threshold,
        baseline_pages: baseline.len(),
        candidate_pages: candidate.len(),
        pages_compared: all_pages.len(),
        risky_pages,
    }
}

/// Parse a serialized page result collection. Tolerates both a keyed
/// `{"3": {...}}` mapping and a plain array of results.
pub fn parse_result_set(raw: &str) -> Result<BTreeMap<u32, PageOcrResult>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let mut pages = BTreeMap::new();

    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                let result: PageOcrResult = serde_json::from_value(item)?;
                pages.insert(result.page_number, result);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                let result: PageOcrResult = serde_json::from_value(item)?;
                let page = key.parse::<u32>().unwrap_or(result.page_number);
                pages.insert(page, result);
            }
        }
        _ => {
            return Err(YomitoriError::validation(
                "expected a page mapping or an array of page results",
            ));
        }
    }
    Ok(pages)
}
