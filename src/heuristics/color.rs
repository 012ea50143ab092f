use anyhow::{anyhow, Result};

use crate::imaging::{color_distance, mean_color, quantized_histogram, to_f32};
use crate::profile::Category;
use crate::regions::{Region, RegionName};

use super::{
    no_evidence_for, AttributeGuess, Evidence, Finding, Heuristic, HeuristicInput,
    NoEvidenceReason,
};

const CATEGORIES: &[Category] = &[Category::PrimaryColor, Category::SecondaryColor];

/// Named colours in tie-break order.
pub const PALETTE: [(&str, [u8; 3]); 13] = [
    ("black", [20, 20, 20]),
    ("white", [240, 240, 240]),
    ("gray", [128, 128, 128]),
    ("red", [200, 30, 40]),
    ("orange", [235, 130, 30]),
    ("yellow", [235, 215, 50]),
    ("green", [40, 140, 60]),
    ("blue", [40, 90, 200]),
    ("navy", [25, 35, 90]),
    ("brown", [115, 75, 40]),
    ("beige", [215, 195, 160]),
    ("pink", [235, 150, 180]),
    ("purple", [120, 50, 150]),
];

fn nearest_index(rgb: [f32; 3]) -> usize {
    let mut best = (0usize, f32::INFINITY);
    for (idx, (_, reference)) in PALETTE.iter().enumerate() {
        let d = color_distance(rgb, to_f32(*reference));
        // Strict `<` keeps the earlier palette entry on ties.
        if d < best.1 {
            best = (idx, d);
        }
    }
    best.0
}

/// Palette name nearest to an RGB colour.
pub fn nearest_palette_color(rgb: [f32; 3]) -> &'static str {
    PALETTE[nearest_index(rgb)].0
}

fn torso<'a>(input: &HeuristicInput<'a>) -> std::result::Result<&'a Region, Vec<Finding>> {
    if !input.context.pose_detected {
        return Err(no_evidence_for(CATEGORIES, NoEvidenceReason::PoseNotDetected));
    }
    input.region(RegionName::Torso).ok_or_else(|| {
        no_evidence_for(
            CATEGORIES,
            NoEvidenceReason::MissingRegion(RegionName::Torso),
        )
    })
}

/// Quantized histogram over the torso, peaks mapped onto `PALETTE`.
#[derive(Default)]
pub struct HistogramColorExtractor;

impl HistogramColorExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Heuristic for HistogramColorExtractor {
    fn name(&self) -> &'static str {
        "color_histogram"
    }

    fn categories(&self) -> &'static [Category] {
        CATEGORIES
    }

    fn evaluate(&self, input: &HeuristicInput<'_>) -> Result<Vec<Finding>> {
        let region = match torso(input) {
            Ok(region) => region,
            Err(findings) => return Ok(findings),
        };
        let cfg = &input.config.color;
        let rect = region.pixels;
        if rect.area() < cfg.min_pixels as u64 {
            return Err(anyhow!(
                "torso has {} px, histogram needs {}",
                rect.area(),
                cfg.min_pixels
            ));
        }

        let hist = quantized_histogram(input.frame, &rect, cfg.quantization_levels);
        let mut counts = [0u64; PALETTE.len()];
        for bin in hist.bins.iter().filter(|b| b.count > 0) {
            counts[nearest_index(bin.mean())] += bin.count;
        }
        let mut ranked: Vec<usize> = (0..PALETTE.len()).filter(|i| counts[*i] > 0).collect();
        ranked.sort_by(|a, b| counts[*b].cmp(&counts[*a]).then(a.cmp(b)));

        let share = |idx: usize| counts[idx] as f32 / hist.total.max(1) as f32;
        let Some(&first) = ranked.first() else {
            return Err(anyhow!("empty colour histogram"));
        };
        let primary_share = share(first);
        let mut findings = vec![Finding::Guess(
            AttributeGuess::new(Category::PrimaryColor, PALETTE[first].0, primary_share)
                .with_evidence(vec![Evidence::measured("peak_share", primary_share)])
                .with_extent(region.bounds),
        )];

        let secondary = ranked.get(1).map(|&idx| {
            let ev = Evidence::at_least("secondary_share", share(idx), cfg.secondary_min_share);
            (idx, ev)
        });
        findings.push(match secondary {
            Some((idx, ev)) if ev.passed => Finding::Guess(
                AttributeGuess::new(Category::SecondaryColor, PALETTE[idx].0, ev.value)
                    .with_evidence(vec![ev])
                    .with_extent(region.bounds),
            ),
            Some((_, ev)) => Finding::absent(Category::SecondaryColor, vec![ev]),
            None => Finding::absent(Category::SecondaryColor, Vec::new()),
        });
        Ok(findings)
    }
}

/// Fallback: nearest palette colour to the torso mean, confidence capped.
#[derive(Default)]
pub struct MeanColorExtractor;

impl MeanColorExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Heuristic for MeanColorExtractor {
    fn name(&self) -> &'static str {
        "color_mean"
    }

    fn categories(&self) -> &'static [Category] {
        CATEGORIES
    }

    fn evaluate(&self, input: &HeuristicInput<'_>) -> Result<Vec<Finding>> {
        let region = match torso(input) {
            Ok(region) => region,
            Err(findings) => return Ok(findings),
        };
        let rect = region.pixels;
        let Some(mean) = mean_color(input.frame, &rect) else {
            return Ok(no_evidence_for(
                CATEGORIES,
                NoEvidenceReason::MissingRegion(RegionName::Torso),
            ));
        };
        let idx = nearest_index(mean);
        let agreeing = rect
            .pixels()
            .filter(|&(x, y)| nearest_index(to_f32(input.frame.pixel(x, y))) == idx)
            .count();
        let agreement = agreeing as f32 / rect.area() as f32;
        let ceiling = input.config.color.mean_fallback_ceiling;
        Ok(vec![
            Finding::Guess(
                AttributeGuess::new(Category::PrimaryColor, PALETTE[idx].0, ceiling * agreement)
                    .with_evidence(vec![Evidence::measured("mean_agreement", agreement)])
                    .with_extent(region.bounds),
            ),
            Finding::absent(Category::SecondaryColor, Vec::new()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;
    use crate::frame::{DetectionContext, Frame};
    use crate::heuristics::test_support::painted;
    use crate::regions::RegionExtractor;

    fn run(h: &dyn Heuristic, frame: &Frame) -> Result<Vec<Finding>> {
        let config = AnalyzerConfig::default();
        let ctx = DetectionContext::none().with_pose(None);
        let regions = RegionExtractor::new(&config.regions).extract(frame, &ctx);
        let input = HeuristicInput {
            frame,
            regions: &regions,
            context: &ctx,
            config: &config,
        };
        h.evaluate(&input)
    }

    fn guess(findings: &[Finding], category: Category) -> Option<(&str, f32)> {
        findings.iter().find_map(|f| match f {
            Finding::Guess(g) if g.category == category => Some((g.label.as_str(), g.confidence)),
            _ => None,
        })
    }

    #[test]
    fn palette_lookup_prefers_nearest() {
        assert_eq!(nearest_palette_color([30.0, 45.0, 100.0]), "navy");
        assert_eq!(nearest_palette_color([250.0, 250.0, 250.0]), "white");
        assert_eq!(nearest_palette_color([190.0, 40.0, 40.0]), "red");
    }

    #[test]
    fn two_tone_torso_gives_primary_and_secondary() {
        // Torso spans x 25..75, y 25..60 on a 100x100 frame.
        let frame = painted(100, 100, |x, _| if x < 60 { [200, 30, 40] } else { [240, 240, 240] });
        let findings = run(&HistogramColorExtractor::new(), &frame).unwrap();
        let (primary, p) = guess(&findings, Category::PrimaryColor).unwrap();
        let (secondary, s) = guess(&findings, Category::SecondaryColor).unwrap();
        assert_eq!((primary, secondary), ("red", "white"));
        assert!((p - 0.7).abs() < 1e-6);
        assert!((s - 0.3).abs() < 1e-6);
    }

    #[test]
    fn minor_second_color_is_absent() {
        let frame = painted(100, 100, |x, _| if x < 72 { [200, 30, 40] } else { [240, 240, 240] });
        let findings = run(&HistogramColorExtractor::new(), &frame).unwrap();
        assert!(guess(&findings, Category::SecondaryColor).is_none());
        assert!(findings
            .iter()
            .any(|f| matches!(f, Finding::Absent { category: Category::SecondaryColor, .. })));
    }

    #[test]
    fn histogram_refuses_tiny_torso_but_mean_fallback_answers() {
        let frame = painted(16, 16, |_, _| [25, 35, 90]);
        assert!(run(&HistogramColorExtractor::new(), &frame).is_err());
        let findings = run(&MeanColorExtractor::new(), &frame).unwrap();
        let (label, confidence) = guess(&findings, Category::PrimaryColor).unwrap();
        assert_eq!(label, "navy");
        assert!(confidence <= AnalyzerConfig::default().color.mean_fallback_ceiling);
    }
}
