use anyhow::Result;

use crate::config::HeadAccessoryConfig;
use crate::frame::{Frame, NormRect};
use crate::imaging::{intensity_stats_where, label_mask, saturation, PixelRect};
use crate::profile::Category;
use crate::regions::{Region, RegionName};

use super::{
    all_passed, margin_confidence, no_evidence_for, AttributeGuess, Evidence, Finding, Heuristic,
    HeuristicInput, NoEvidenceReason,
};

const CATEGORIES: &[Category] = &[Category::HeadAccessory];

fn headroom(e: &Evidence) -> f32 {
    let room = 1.0 - e.threshold;
    if room <= 0.0 {
        1.0
    } else {
        (e.value - e.threshold) / room
    }
}

/// Hat and glasses detector. Runs only when a face was detected.
#[derive(Default)]
pub struct HeadAccessoryDetector;

impl HeadAccessoryDetector {
    pub fn new() -> Self {
        Self
    }

    /// Ellipse-shaped dark or saturated mass inside the crown.
    fn hat(
        &self,
        frame: &Frame,
        crown: &Region,
        cfg: &HeadAccessoryConfig,
    ) -> (Vec<Evidence>, f32) {
        let masked = hat_mask(frame, cfg);
        let (mut inside, mut inside_hits, mut outside, mut outside_hits) = (0u64, 0u64, 0u64, 0u64);
        for (x, y) in crown.pixels.pixels() {
            let hit = masked(x, y);
            if crown.contains(x, y) {
                inside += 1;
                inside_hits += hit as u64;
            } else {
                outside += 1;
                outside_hits += hit as u64;
            }
        }
        let fill = ratio(inside_hits, inside);
        let corner_fill = ratio(outside_hits, outside);
        let spread = intensity_stats_where(frame, &crown.pixels, |x, y| {
            crown.contains(x, y) && masked(x, y)
        })
        .std_dev;

        let evidence = vec![
            Evidence::at_least("hat_fill", fill, cfg.hat_min_fill),
            Evidence::at_least(
                "hat_shape_contrast",
                fill - corner_fill,
                cfg.hat_min_shape_contrast,
            ),
            Evidence::at_most("hat_intensity_std", spread, cfg.hat_max_std),
        ];
        let confidence = margin_confidence(
            0.55,
            0.4,
            &[headroom(&evidence[0]), headroom(&evidence[1])],
        );
        (evidence, confidence)
    }

    /// Two dark lenses flanking the eye line joined by a bridge.
    fn glasses(
        &self,
        frame: &Frame,
        eyes: &Region,
        cfg: &HeadAccessoryConfig,
    ) -> (Vec<Evidence>, f32) {
        let dark = lens_mask(frame, cfg);
        let lens_fill = |third: PixelRect| {
            let hits = third.pixels().filter(|&(x, y)| dark(x, y)).count() as u64;
            ratio(hits, third.area())
        };
        let left = eyes.pixels.sub(0.0, 1.0 / 3.0, 0.0, 1.0);
        let bridge = eyes.pixels.sub(1.0 / 3.0, 2.0 / 3.0, 0.0, 1.0);
        let right = eyes.pixels.sub(2.0 / 3.0, 1.0, 0.0, 1.0);
        let bridged_columns = (bridge.x0..bridge.x1)
            .filter(|&x| (bridge.y0..bridge.y1).any(|y| dark(x, y)))
            .count() as u64;

        let evidence = vec![
            Evidence::at_least("left_lens_fill", lens_fill(left), cfg.glasses_min_lens_fill),
            Evidence::at_least("right_lens_fill", lens_fill(right), cfg.glasses_min_lens_fill),
            Evidence::at_least(
                "bridge_coverage",
                ratio(bridged_columns, bridge.width() as u64),
                cfg.glasses_min_bridge,
            ),
        ];
        let margins: Vec<f32> = evidence.iter().map(headroom).collect();
        (evidence, margin_confidence(0.55, 0.4, &margins))
    }
}

fn hat_mask<'a>(
    frame: &'a Frame,
    cfg: &'a HeadAccessoryConfig,
) -> impl Fn(u32, u32) -> bool + 'a {
    move |x, y| {
        frame.luma_at(x, y) < cfg.hat_dark_max
            || saturation(frame.pixel(x, y)) >= cfg.hat_min_saturation
    }
}

fn lens_mask<'a>(
    frame: &'a Frame,
    cfg: &'a HeadAccessoryConfig,
) -> impl Fn(u32, u32) -> bool + 'a {
    move |x, y| frame.luma_at(x, y) < cfg.glasses_dark_max
}

/// Where the hat actually is: the masked component holding most of the crown
/// ellipse. The search reaches down through the eye band so a low brim is
/// part of the extent.
fn hat_extent(
    frame: &Frame,
    crown: &Region,
    eyes: Option<&Region>,
    cfg: &HeadAccessoryConfig,
) -> NormRect {
    let search = eyes.map_or(crown.pixels, |e| crown.pixels.union(&e.pixels));
    let mask = label_mask(&search, hat_mask(frame, cfg));
    let max_label = mask.components.iter().map(|c| c.label).max().unwrap_or(0);
    let mut inside = vec![0u64; max_label as usize + 1];
    for (x, y) in crown.pixels.pixels() {
        if crown.contains(x, y) {
            let label = mask.label_at(x, y) as usize;
            if label > 0 && label < inside.len() {
                inside[label] += 1;
            }
        }
    }
    let best = mask
        .components
        .iter()
        .filter(|c| inside[c.label as usize] > 0)
        .reduce(|best, c| {
            if inside[c.label as usize] > inside[best.label as usize] {
                c
            } else {
                best
            }
        });
    match best {
        Some(c) => c.bounds.to_norm(frame.width(), frame.height()),
        None => crown.bounds,
    }
}

/// Bounding box of the dark lens and bridge pixels in the eye band.
fn glasses_extent(frame: &Frame, eyes: &Region, cfg: &HeadAccessoryConfig) -> NormRect {
    let mask = label_mask(&eyes.pixels, lens_mask(frame, cfg));
    let bounds = mask
        .components
        .iter()
        .fold(PixelRect::new(0, 0, 0, 0), |acc, c| acc.union(&c.bounds));
    if bounds.is_empty() {
        eyes.bounds
    } else {
        bounds.to_norm(frame.width(), frame.height())
    }
}

fn ratio(hits: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        hits as f32 / total as f32
    }
}

impl Heuristic for HeadAccessoryDetector {
    fn name(&self) -> &'static str {
        "head_accessory_shape"
    }

    fn categories(&self) -> &'static [Category] {
        CATEGORIES
    }

    fn evaluate(&self, input: &HeuristicInput<'_>) -> Result<Vec<Finding>> {
        if !input.context.face_detected {
            return Ok(no_evidence_for(CATEGORIES, NoEvidenceReason::FaceNotDetected));
        }
        let crown = input.region(RegionName::Crown);
        let eyes = input.region(RegionName::EyeBand);
        if crown.is_none() && eyes.is_none() {
            return Ok(no_evidence_for(
                CATEGORIES,
                NoEvidenceReason::MissingRegion(RegionName::Crown),
            ));
        }

        let cfg = &input.config.head_accessory;
        let mut findings = Vec::new();
        let mut rejected = Vec::new();
        if let Some(crown) = crown {
            let (evidence, confidence) = self.hat(input.frame, crown, cfg);
            if all_passed(&evidence) {
                let extent = hat_extent(input.frame, crown, eyes, cfg);
                findings.push(Finding::Guess(
                    AttributeGuess::new(Category::HeadAccessory, "hat", confidence)
                        .with_evidence(evidence)
                        .with_extent(extent),
                ));
            } else {
                rejected.extend(evidence);
            }
        }
        if let Some(eyes) = eyes {
            let (evidence, confidence) = self.glasses(input.frame, eyes, cfg);
            if all_passed(&evidence) {
                findings.push(Finding::Guess(
                    AttributeGuess::new(Category::HeadAccessory, "glasses", confidence)
                        .with_evidence(evidence)
                        .with_extent(glasses_extent(input.frame, eyes, cfg)),
                ));
            } else {
                rejected.extend(evidence);
            }
        }

        if findings.is_empty() {
            findings.push(Finding::absent(Category::HeadAccessory, rejected));
        }
        Ok(findings)
    }
}
