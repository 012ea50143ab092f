use anyhow::Result;

use crate::config::{ClothingConfig, ClothingRule};
use crate::imaging::{color_distance, intensity_stats, mean_color, to_f32, PixelRect};
use crate::profile::Category;
use crate::regions::RegionName;

use super::{
    margin_confidence, no_evidence_for, AttributeGuess, Evidence, Finding, Heuristic,
    HeuristicInput, NoEvidenceReason,
};

const CATEGORIES: &[Category] = &[Category::ClothingItem, Category::ClothingStyle];

/// Coverage ratios measured on the garment mask.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClothingEvidence {
    /// Garment-covered columns across the shoulder band / frame width.
    pub shoulder_ratio: f32,
    /// Garment-covered rows from the torso top down / frame height.
    pub torso_height_ratio: f32,
    /// Garment fraction over the arm regions.
    pub arm_coverage: f32,
}

/// First rule, in order, whose every threshold is strictly exceeded.
pub fn classify_clothing<'r>(
    evidence: &ClothingEvidence,
    rules: &'r [ClothingRule],
) -> Option<&'r ClothingRule> {
    rules
        .iter()
        .find(|rule| rule_evidence(evidence, rule).iter().all(|e| e.passed))
}

fn rule_evidence(evidence: &ClothingEvidence, rule: &ClothingRule) -> Vec<Evidence> {
    let mut out = vec![
        Evidence::above("shoulder_ratio", evidence.shoulder_ratio, rule.min_shoulder_ratio),
        Evidence::above(
            "torso_height_ratio",
            evidence.torso_height_ratio,
            rule.min_torso_height_ratio,
        ),
    ];
    if let Some(min_arm) = rule.min_arm_coverage {
        out.push(Evidence::above("arm_coverage", evidence.arm_coverage, min_arm));
    }
    out
}

fn normalized_margin(e: &Evidence) -> f32 {
    let room = 1.0 - e.threshold;
    if room <= 0.0 {
        return 1.0;
    }
    (e.value - e.threshold) / room
}

/// Garment-coverage classifier over the torso and arm regions.
///
/// Also derives `clothing_style` from the item it settles on and the torso
/// texture, since both come from the same garment mask.
#[derive(Default)]
pub struct ClothingClassifier;

impl ClothingClassifier {
    pub fn new() -> Self {
        Self
    }

    fn measure(
        &self,
        input: &HeuristicInput<'_>,
        torso: &PixelRect,
    ) -> Option<(ClothingEvidence, f32)> {
        let cfg = &input.config.clothing;
        let frame = input.frame;
        let core = torso.core(0.25);
        if core.area() < cfg.min_reference_px as u64 {
            return None;
        }
        let reference = mean_color(frame, &core)?;
        let is_garment = |x: u32, y: u32| {
            color_distance(to_f32(frame.pixel(x, y)), reference) <= cfg.garment_color_tolerance
        };

        let band_rows = ((torso.height() as f32 * cfg.shoulder_band).round() as u32).max(1);
        let band = PixelRect::new(0, torso.y0, frame.width(), (torso.y0 + band_rows).min(torso.y1));
        let covered_columns = (band.x0..band.x1)
            .filter(|&x| {
                let hits = (band.y0..band.y1).filter(|&y| is_garment(x, y)).count();
                hits as f32 >= cfg.coverage_fill * band.height() as f32
            })
            .count();

        let covered_rows = (torso.y0..frame.height())
            .filter(|&y| {
                let hits = (torso.x0..torso.x1).filter(|&x| is_garment(x, y)).count();
                hits as f32 >= cfg.coverage_fill * torso.width() as f32
            })
            .count();

        let (mut arm_hits, mut arm_total) = (0u64, 0u64);
        for name in [RegionName::LeftArm, RegionName::RightArm] {
            if let Some(arm) = input.region(name) {
                arm_total += arm.pixels.area();
                arm_hits += arm.pixels.pixels().filter(|&(x, y)| is_garment(x, y)).count() as u64;
            }
        }

        let evidence = ClothingEvidence {
            shoulder_ratio: covered_columns as f32 / frame.width() as f32,
            torso_height_ratio: covered_rows as f32 / frame.height() as f32,
            arm_coverage: if arm_total == 0 {
                0.0
            } else {
                arm_hits as f32 / arm_total as f32
            },
        };
        let texture = intensity_stats(frame, &core).std_dev;
        Some((evidence, texture))
    }

    fn style(&self, item: &str, texture: f32, cfg: &ClothingConfig) -> Finding {
        let texture_ev =
            Evidence::at_most("torso_texture_std", texture, cfg.formal_max_texture_std);
        let (label, confidence) = match item {
            "jacket" if texture_ev.passed => (
                "formal",
                margin_confidence(0.45, 0.4, &[1.0 - texture / cfg.formal_max_texture_std]),
            ),
            "jacket" | "long_sleeve" => ("smart_casual", 0.45),
            _ => ("casual", 0.45),
        };
        Finding::Guess(
            AttributeGuess::new(Category::ClothingStyle, label, confidence)
                .with_evidence(vec![texture_ev]),
        )
    }
}

impl Heuristic for ClothingClassifier {
    fn name(&self) -> &'static str {
        "clothing_coverage"
    }

    fn categories(&self) -> &'static [Category] {
        CATEGORIES
    }

    fn evaluate(&self, input: &HeuristicInput<'_>) -> Result<Vec<Finding>> {
        if !input.context.pose_detected {
            return Ok(no_evidence_for(CATEGORIES, NoEvidenceReason::PoseNotDetected));
        }
        let missing = NoEvidenceReason::MissingRegion(RegionName::Torso);
        let Some(torso) = input.region(RegionName::Torso) else {
            return Ok(no_evidence_for(CATEGORIES, missing));
        };
        let Some((measured, texture)) = self.measure(input, &torso.pixels) else {
            return Ok(no_evidence_for(CATEGORIES, missing));
        };

        let cfg = &input.config.clothing;
        let Some(rule) = classify_clothing(&measured, &cfg.rules) else {
            // "unknown": no rule satisfied, reported as an honest absence.
            let evidence = cfg
                .rules
                .last()
                .map(|r| rule_evidence(&measured, r))
                .unwrap_or_default();
            return Ok(vec![
                Finding::absent(Category::ClothingItem, evidence),
                Finding::absent(Category::ClothingStyle, Vec::new()),
            ]);
        };

        let evidence = rule_evidence(&measured, rule);
        let margins: Vec<f32> = evidence.iter().map(normalized_margin).collect();
        let confidence = margin_confidence(cfg.base_confidence, 0.4, &margins);
        log::debug!(
            "clothing {} (shoulder={:.2} torso={:.2} arm={:.2})",
            rule.label,
            measured.shoulder_ratio,
            measured.torso_height_ratio,
            measured.arm_coverage
        );
        Ok(vec![
            Finding::Guess(
                AttributeGuess::new(Category::ClothingItem, rule.label.clone(), confidence)
                    .with_evidence(evidence)
                    .with_extent(torso.bounds),
            ),
            self.style(&rule.label, texture, cfg),
        ])
    }
}
