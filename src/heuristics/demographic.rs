use anyhow::{anyhow, Result};

use crate::imaging::{intensity_stats, sobel_texture};
use crate::profile::Category;
use crate::regions::RegionName;

use super::{AttributeGuess, Evidence, Finding, Heuristic, HeuristicInput, NoEvidenceReason};

const CATEGORIES: &[Category] = &[Category::AgeRange, Category::Emotion];

/// Age brackets in ascending order.
pub const AGE_BRACKETS: [&str; 4] = ["18-25", "26-35", "36-50", "51+"];

/// Confidence reported by `LowConfidenceEstimator` for every guess.
pub const LOW_CONFIDENCE: f32 = 0.30;

fn head_missing() -> Vec<Finding> {
    CATEGORIES
        .iter()
        .map(|c| Finding::no_evidence(*c, NoEvidenceReason::MissingRegion(RegionName::Head)))
        .collect()
}

/// Coarse age bracket from head texture and emotion from mouth-band contrast.
///
/// Confidence never leaves `[confidence_floor, confidence_ceiling]`: these
/// proportions cannot support a sharper claim.
#[derive(Default)]
pub struct TextureDemographicEstimator;

impl TextureDemographicEstimator {
    pub fn new() -> Self {
        Self
    }
}

impl Heuristic for TextureDemographicEstimator {
    fn name(&self) -> &'static str {
        "demographic_texture"
    }

    fn categories(&self) -> &'static [Category] {
        CATEGORIES
    }

    fn evaluate(&self, input: &HeuristicInput<'_>) -> Result<Vec<Finding>> {
        let Some(head) = input.region(RegionName::Head) else {
            return Ok(head_missing());
        };
        let cfg = &input.config.demographics;
        if head.pixels.area() < cfg.min_head_px {
            return Err(anyhow!(
                "head region has {} px, texture estimate needs {}",
                head.pixels.area(),
                cfg.min_head_px
            ));
        }
        let bounded = |closeness: f32| {
            let span = cfg.confidence_ceiling - cfg.confidence_floor;
            (cfg.confidence_floor + span * closeness.clamp(0.0, 1.0))
                .clamp(cfg.confidence_floor, cfg.confidence_ceiling)
        };

        let texture = sobel_texture(input.frame, &head.pixels.core(0.15));
        let bounds = &cfg.age_texture_bounds;
        let bracket = bounds.iter().take_while(|b| texture >= **b).count();
        let nearest_bound = bounds
            .iter()
            .map(|b| (texture - b).abs())
            .fold(f32::INFINITY, f32::min);
        let scale = bounds.first().copied().unwrap_or(1.0).max(f32::EPSILON);
        let age = AttributeGuess::new(
            Category::AgeRange,
            AGE_BRACKETS[bracket.min(AGE_BRACKETS.len() - 1)],
            bounded(nearest_bound / scale),
        )
        .with_evidence(vec![Evidence::measured("head_texture", texture)])
        .with_extent(head.bounds);

        let mouth = head.pixels.sub(0.25, 0.75, 0.70, 0.90);
        let contrast = intensity_stats(input.frame, &mouth).std_dev;
        let smile = Evidence::at_least("mouth_contrast", contrast, cfg.happy_min_mouth_contrast);
        let label = if smile.passed { "happy" } else { "neutral" };
        let closeness = (contrast - smile.threshold).abs() / smile.threshold;
        let emotion = AttributeGuess::new(Category::Emotion, label, bounded(closeness))
            .with_evidence(vec![smile])
            .with_extent(head.bounds);

        Ok(vec![Finding::Guess(age), Finding::Guess(emotion)])
    }
}

/// Deterministic stand-in used when no finer estimate is possible.
///
/// Always answers `26-35` / `neutral` at `LOW_CONFIDENCE`, so consumers can
/// see the guess is non-authoritative.
#[derive(Default)]
pub struct LowConfidenceEstimator;

impl LowConfidenceEstimator {
    pub fn new() -> Self {
        Self
    }
}

impl Heuristic for LowConfidenceEstimator {
    fn name(&self) -> &'static str {
        "demographic_low_confidence"
    }

    fn categories(&self) -> &'static [Category] {
        CATEGORIES
    }

    fn evaluate(&self, input: &HeuristicInput<'_>) -> Result<Vec<Finding>> {
        if input.region(RegionName::Head).is_none() {
            return Ok(head_missing());
        }
        Ok(vec![
            Finding::Guess(AttributeGuess::new(Category::AgeRange, "26-35", LOW_CONFIDENCE)),
            Finding::Guess(AttributeGuess::new(Category::Emotion, "neutral", LOW_CONFIDENCE)),
        ])
    }
}
