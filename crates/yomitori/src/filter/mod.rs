//! Quality filter stage: prunes noisy tokens from raw engine output.
//!
//! Filters run in a fixed pipeline order, each consuming the previous
//! stage's survivors:
//!
//! 1. line-noise — isolated short low-confidence tokens are artifacts;
//!    short tokens embedded in a real sentence are protected.
//! 2. image-tile — a coarse binary mask marks tiles whose local variance
//!    resembles a photograph; tokens mostly inside photo tiles are dropped
//!    unless large and high-confidence (titles survive photo backgrounds).
//! 3. background-variance — pixel variance directly under the token box;
//!    photo-like backgrounds drop the token unless it clears the protection
//!    thresholds.
//!
//! For identical image, token list, and thresholds the output is identical.
//! Applying the stage to its own survivor list drops nothing further: the
//! line-noise membership test only counts line-mates that themselves pass
//! the per-word image filters, so a protected token cannot be orphaned by a
//! later stage.

use crate::engine::PageImage;
use crate::types::{DropReason, OcrDebugInfo, Word, group_word_rows};

/// Tunable thresholds for the filter stage.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Tokens with at most this many characters count as "very short"
    /// (CJK language sets use 1 regardless).
    pub short_token_chars: usize,
    /// Confidence below this marks a token as low-confidence.
    pub noise_confidence_floor: f64,
    /// Edge length of the coarse sampling grid tiles, in pixels.
    pub tile_size: u32,
    /// Sampling stride inside a tile.
    pub tile_sample_step: u32,
    /// Tile luma variance at or above this marks the tile as photo-like.
    pub tile_variance_threshold: f64,
    /// Fraction of a token box covered by photo tiles that triggers a drop.
    pub photo_coverage_ratio: f64,
    /// Title protection: minimum box height for photo-background survival.
    pub protect_min_height: u32,
    /// Title protection: minimum confidence for photo-background survival.
    pub protect_confidence: f64,
    /// Sampling stride under a token box for the background filter.
    pub bg_sample_step: u32,
    /// Background luma variance at or above this triggers a drop.
    pub bg_variance_threshold: f64,
    /// Protection thresholds for the background filter.
    pub bg_protect_min_height: u32,
    pub bg_protect_confidence: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            short_token_chars: 2,
            noise_confidence_floor: 60.0,
            tile_size: 16,
            tile_sample_step: 4,
            tile_variance_threshold: 1300.0,
            photo_coverage_ratio: 0.6,
            protect_min_height: 28,
            protect_confidence: 85.0,
            bg_sample_step: 2,
            bg_variance_threshold: 1600.0,
            bg_protect_min_height: 24,
            bg_protect_confidence: 80.0,
        }
    }
}

/// Survivors plus the dropped-token diagnostics block.
#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub survivors: Vec<Word>,
    pub debug: OcrDebugInfo,
}

fn is_cjk_language(language: &str) -> bool {
    language
        .split('+')
        .any(|l| matches!(l, "kor" | "jpn" | "chi_sim" | "chi_tra"))
}

/// Luma variance of the region, sampled on a fixed stride. Empty regions
/// report zero.
fn region_variance(image: &PageImage, x0: u32, y0: u32, x1: u32, y1: u32, step: u32) -> f64 {
    let x1 = x1.min(image.width());
    let y1 = y1.min(image.height());
    if x0 >= x1 || y0 >= y1 {
        return 0.0;
    }
    let step = step.max(1);

    let mut count = 0u64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut y = y0;
    while y < y1 {
        let mut x = x0;
        while x < x1 {
            let v = image.pixel(x, y) as f64;
            sum += v;
            sum_sq += v * v;
            count += 1;
            x += step;
        }
        y += step;
    }
    if count == 0 {
        return 0.0;
    }
    let mean = sum / count as f64;
    (sum_sq / count as f64 - mean * mean).max(0.0)
}

/// Coarse binary mask over the page: one flag per tile, true when the
/// tile's sampled variance resembles a photograph rather than text
/// background.
struct PhotoMask {
    tiles_x: u32,
    tile_size: u32,
    photo: Vec<bool>,
}

impl PhotoMask {
    fn build(image: &PageImage, config: &FilterConfig) -> Self {
        let tile_size = config.tile_size.max(1);
        let tiles_x = image.width().div_ceil(tile_size).max(1);
        let tiles_y = image.height().div_ceil(tile_size).max(1);

        let mut photo = Vec::with_capacity((tiles_x * tiles_y) as usize);
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let x0 = tx * tile_size;
                let y0 = ty * tile_size;
                let variance = region_variance(
                    image,
                    x0,
                    y0,
                    x0 + tile_size,
                    y0 + tile_size,
                    config.tile_sample_step,
                );
                photo.push(variance >= config.tile_variance_threshold);
            }
        }

        Self {
            tiles_x,
            tile_size,
            photo,
        }
    }

    /// Fraction of the box area covered by photo tiles.
    fn photo_coverage(&self, word: &Word) -> f64 {
        let bbox = word.bbox;
        if bbox.area() == 0 {
            return 0.0;
        }
        let t = self.tile_size;
        let tx0 = bbox.x0 / t;
        let ty0 = bbox.y0 / t;
        let tx1 = (bbox.x1.saturating_sub(1)) / t;
        let ty1 = (bbox.y1.saturating_sub(1)) / t;

        let mut covered = 0u64;
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                let idx = (ty * self.tiles_x + tx) as usize;
                if idx >= self.photo.len() || !self.photo[idx] {
                    continue;
                }
                let tile_x0 = tx * t;
                let tile_y0 = ty * t;
                let w = bbox.x1.min(tile_x0 + t).saturating_sub(bbox.x0.max(tile_x0));
                let h = bbox.y1.min(tile_y0 + t).saturating_sub(bbox.y0.max(tile_y0));
                covered += w as u64 * h as u64;
            }
        }
        covered as f64 / bbox.area() as f64
    }
}

fn passes_image_tile(word: &Word, mask: &PhotoMask, config: &FilterConfig) -> bool {
    if mask.photo_coverage(word) < config.photo_coverage_ratio {
        return true;
    }
    word.bbox.height() >= config.protect_min_height && word.confidence >= config.protect_confidence
}

fn passes_background_variance(word: &Word, image: &PageImage, config: &FilterConfig) -> bool {
    let variance = region_variance(
        image,
        word.bbox.x0,
        word.bbox.y0,
        word.bbox.x1,
        word.bbox.y1,
        config.bg_sample_step,
    );
    if variance < config.bg_variance_threshold {
        return true;
    }
    word.bbox.height() >= config.bg_protect_min_height
        && word.confidence >= config.bg_protect_confidence
}

/// Run the full filter pipeline over raw engine words.
pub fn apply_filters(
    words: Vec<Word>,
    image: &PageImage,
    language: &str,
    config: &FilterConfig,
) -> FilterOutcome {
    let mut debug = OcrDebugInfo::default();
    if words.is_empty() {
        return FilterOutcome {
            survivors: words,
            debug,
        };
    }

    let mask = PhotoMask::build(image, config);
    let image_pass: Vec<bool> = words
        .iter()
        .map(|w| passes_image_tile(w, &mask, config) && passes_background_variance(w, image, config))
        .collect();

    let short_limit = if is_cjk_language(language) {
        1
    } else {
        config.short_token_chars
    };

    // Line membership counts only mates that pass the per-word image
    // filters, so re-applying the stage cannot orphan a protected token.
    let mut solid_mates = vec![0usize; words.len()];
    for (_, members) in group_word_rows(&words) {
        let solid = members.iter().filter(|&&i| image_pass[i]).count();
        for &i in &members {
            solid_mates[i] = solid;
        }
    }

    // Stage 1: line noise.
    let mut survivors: Vec<(usize, Word)> = Vec::with_capacity(words.len());
    for (i, word) in words.into_iter().enumerate() {
        let short = word.text.chars().count() <= short_limit;
        let low_conf = word.confidence < config.noise_confidence_floor;
        if short && low_conf && solid_mates[i] < 2 {
            debug.record_drop(word, DropReason::LineNoise);
        } else {
            survivors.push((i, word));
        }
    }

    // Stage 2: image tiles.
    let mut after_tiles: Vec<(usize, Word)> = Vec::with_capacity(survivors.len());
    for (i, word) in survivors {
        if passes_image_tile(&word, &mask, config) {
            after_tiles.push((i, word));
        } else {
            debug.record_drop(word, DropReason::ImageTile);
        }
    }

    // Stage 3: background variance.
    let mut final_survivors: Vec<Word> = Vec::with_capacity(after_tiles.len());
    for (_, word) in after_tiles {
        if passes_background_variance(&word, image, config) {
            final_survivors.push(word);
        } else {
            debug.record_drop(word, DropReason::BackgroundVariance);
        }
    }

    FilterOutcome {
        survivors: final_survivors,
        debug,
    }
}
