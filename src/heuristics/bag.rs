use anyhow::Result;

use crate::config::{BagConfig, RegionConfig};
use crate::imaging::{intensity_stats, largest_dark_component};
use crate::profile::Category;
use crate::regions::RegionName;

use super::{
    margin_confidence, no_evidence_for, AttributeGuess, Evidence, Finding, Heuristic,
    HeuristicInput, NoEvidenceReason,
};

const CATEGORIES: &[Category] = &[Category::BagAccessory];

/// Measurements of the largest dark blob in a bag zone.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlobEvidence {
    /// Component area in pixels.
    pub area: u64,
    /// Luma std-dev over the padded bounding box.
    pub contrast_std: f32,
    /// Mean luma over the padded bounding box.
    pub mean_brightness: f32,
    /// Vertical centre as a fraction of frame height.
    pub center_y: f32,
}

/// Evidence for one blob. Every entry must pass, plus the per-label area floor.
fn blob_evidence(blob: &BlobEvidence, cfg: &BagConfig, band: (f32, f32)) -> Vec<Evidence> {
    vec![
        Evidence::above("contrast_std", blob.contrast_std, cfg.min_contrast_std),
        Evidence::below("mean_brightness", blob.mean_brightness, cfg.max_mean_brightness),
        Evidence::at_least("center_below_band_top", blob.center_y, band.0),
        Evidence::at_most("center_above_band_bottom", blob.center_y, band.1),
        Evidence::at_least("area", blob.area as f32, cfg.backpack_min_area as f32),
    ]
}

/// Conservative bag decision: `None` unless every limit holds at once.
/// Returns the label and its confidence.
pub fn classify_bag(
    blob: &BlobEvidence,
    cfg: &BagConfig,
    regions: &RegionConfig,
) -> Option<(&'static str, f32)> {
    let band = (regions.bag_band_top, regions.bag_band_bottom);
    let common = blob_evidence(blob, cfg, band);
    if !common[..4].iter().all(|e| e.passed) {
        return None;
    }
    let area = blob.area;
    let label = if area >= cfg.purse_min_area && blob.center_y >= cfg.purse_min_center_y {
        ("purse", cfg.purse_min_area)
    } else if area >= cfg.backpack_min_area {
        ("backpack", cfg.backpack_min_area)
    } else {
        return None;
    };

    let margins = [
        area as f32 / label.1 as f32 - 1.0,
        (blob.contrast_std - cfg.min_contrast_std) / cfg.min_contrast_std,
        (cfg.max_mean_brightness - blob.mean_brightness) / cfg.max_mean_brightness,
    ];
    Some((label.0, margin_confidence(0.55, 0.4, &margins)))
}

/// Dark-blob bag detector over the zones beside the body.
#[derive(Default)]
pub struct BagDetector;

impl BagDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Heuristic for BagDetector {
    fn name(&self) -> &'static str {
        "bag_dark_blob"
    }

    fn categories(&self) -> &'static [Category] {
        CATEGORIES
    }

    fn evaluate(&self, input: &HeuristicInput<'_>) -> Result<Vec<Finding>> {
        if !input.context.pose_detected {
            return Ok(no_evidence_for(CATEGORIES, NoEvidenceReason::PoseNotDetected));
        }
        let zones: Vec<_> = [RegionName::BagLeft, RegionName::BagRight]
            .into_iter()
            .filter_map(|name| input.region(name))
            .collect();
        if zones.is_empty() {
            return Ok(no_evidence_for(
                CATEGORIES,
                NoEvidenceReason::MissingRegion(RegionName::BagLeft),
            ));
        }

        let cfg = &input.config.bag;
        let band = (input.config.regions.bag_band_top, input.config.regions.bag_band_bottom);
        let frame = input.frame;
        let mut best: Option<AttributeGuess> = None;
        let mut rejected = Vec::new();
        for zone in zones {
            let Some(component) = largest_dark_component(frame, &zone.pixels, cfg.mask_cutoff)
            else {
                continue;
            };
            let padded = component.bounds.padded(cfg.bbox_padding, &zone.pixels);
            let stats = intensity_stats(frame, &padded);
            let blob = BlobEvidence {
                area: component.area,
                contrast_std: stats.std_dev,
                mean_brightness: stats.mean,
                center_y: component.center_y() / frame.height() as f32,
            };
            let evidence = blob_evidence(&blob, cfg, band);
            match classify_bag(&blob, cfg, &input.config.regions) {
                Some((label, confidence)) => {
                    log::debug!(
                        "bag candidate {} in {:?} (area={} std={:.1} mean={:.1})",
                        label,
                        zone.name,
                        blob.area,
                        blob.contrast_std,
                        blob.mean_brightness
                    );
                    let extent = component.bounds.to_norm(frame.width(), frame.height());
                    let guess = AttributeGuess::new(Category::BagAccessory, label, confidence)
                        .with_evidence(evidence)
                        .with_extent(extent);
                    // Zones are visited left to right; the first keeps ties.
                    if best.as_ref().map_or(true, |g| guess.confidence > g.confidence) {
                        best = Some(guess);
                    }
                }
                None => rejected.extend(evidence),
            }
        }

        Ok(vec![match best {
            Some(guess) => Finding::Guess(guess),
            None => Finding::absent(Category::BagAccessory, rejected),
        }])
    }
}
