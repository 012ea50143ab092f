//! Fusion & policy engine.
//!
//! Combines the reports of every heuristic chain into one `CustomerProfile`:
//! per-category floors, the hat-over-glasses exclusion, a fixed label
//! priority for ties, and the weighted overall confidence. Pure and
//! infallible over already-collected findings.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::analyzer::HeuristicReport;
use crate::config::FusionConfig;
use crate::heuristics::{AttributeGuess, Finding, AGE_BRACKETS, PALETTE};
use crate::profile::{Category, CustomerProfile, EvidenceState, FieldStatus, ProfileField};

const HEAD_PRIORITY: &[&str] = &["hat", "glasses"];
const BAG_PRIORITY: &[&str] = &["backpack", "purse"];
const CLOTHING_PRIORITY: &[&str] = &["jacket", "hoodie", "long_sleeve", "t_shirt"];
const STYLE_PRIORITY: &[&str] = &["formal", "smart_casual", "casual"];
const EMOTION_PRIORITY: &[&str] = &["happy", "neutral"];

/// Position of `label` in its category's priority order; unknown labels sort
/// after every known one.
pub fn label_rank(category: Category, label: &str) -> usize {
    let position = match category {
        Category::PrimaryColor | Category::SecondaryColor => {
            PALETTE.iter().position(|(name, _)| *name == label)
        }
        Category::HeadAccessory => HEAD_PRIORITY.iter().position(|l| *l == label),
        Category::BagAccessory => BAG_PRIORITY.iter().position(|l| *l == label),
        Category::ClothingItem => CLOTHING_PRIORITY.iter().position(|l| *l == label),
        Category::ClothingStyle => STYLE_PRIORITY.iter().position(|l| *l == label),
        Category::AgeRange => AGE_BRACKETS.iter().position(|l| *l == label),
        Category::Emotion => EMOTION_PRIORITY.iter().position(|l| *l == label),
    };
    position.unwrap_or(usize::MAX)
}

fn by_rank(category: Category, a: &AttributeGuess, b: &AttributeGuess) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| label_rank(category, &a.label).cmp(&label_rank(category, &b.label)))
        .then_with(|| a.label.cmp(&b.label))
}

pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Terminal profile for frames without a detected person.
    pub fn no_person(&self) -> CustomerProfile {
        let fields = Category::ALL
            .into_iter()
            .map(|c| (c, ProfileField::no_evidence()))
            .collect();
        CustomerProfile::new(fields, 0.0, true, EvidenceState::NoPerson)
    }

    /// Fuse chain reports, in chain order, into a profile.
    pub fn fuse(&self, reports: &[HeuristicReport]) -> CustomerProfile {
        let mut by_category: BTreeMap<Category, Vec<&Finding>> = BTreeMap::new();
        for finding in reports.iter().flat_map(|r| r.findings.iter()) {
            by_category.entry(finding.category()).or_default().push(finding);
        }

        let mut fields = BTreeMap::new();
        for category in Category::ALL {
            let findings = by_category.get(&category).map(Vec::as_slice).unwrap_or(&[]);
            fields.insert(category, self.resolve(category, findings));
        }

        let state = if fields.values().any(|f| f.status == FieldStatus::NoEvidence) {
            EvidenceState::PartialEvidence
        } else {
            EvidenceState::FullEvidence
        };
        let overall = self.overall(&fields);
        let fallback_used = reports.iter().any(|r| r.fallback_used);
        CustomerProfile::new(fields, overall, fallback_used, state)
    }

    fn resolve(&self, category: Category, findings: &[&Finding]) -> ProfileField {
        let guesses: Vec<&AttributeGuess> = findings
            .iter()
            .filter_map(|f| match f {
                Finding::Guess(g) => Some(g),
                _ => None,
            })
            .collect();
        if guesses.is_empty() {
            let evaluated = findings.iter().any(|f| matches!(f, Finding::Absent { .. }));
            return if evaluated {
                ProfileField::none_found(self.config.absent_confidence)
            } else {
                ProfileField::no_evidence()
            };
        }

        let floor = self.config.floors.get(category);
        let mut survivors: Vec<&AttributeGuess> = guesses
            .into_iter()
            .filter(|g| {
                let keep = g.confidence.is_finite() && g.confidence >= floor;
                if !keep {
                    log::debug!(
                        "{} '{}' gated ({:.2} < floor {:.2})",
                        category,
                        g.label,
                        g.confidence,
                        floor
                    );
                }
                keep
            })
            .collect();
        if category == Category::HeadAccessory {
            self.suppress_glasses_under_hat(&mut survivors);
        }
        survivors.sort_by(|a, b| by_rank(category, a, b));

        match survivors.split_first() {
            Some((winner, rest)) => ProfileField::detected(
                winner.label.clone(),
                winner.confidence,
                rest.iter().map(|g| g.label.clone()).collect(),
            ),
            None => ProfileField::none_found(self.config.absent_confidence),
        }
    }

    fn suppress_glasses_under_hat(&self, survivors: &mut Vec<&AttributeGuess>) {
        let Some(hat) = survivors
            .iter()
            .find(|g| g.label == "hat")
            .and_then(|g| g.extent)
        else {
            return;
        };
        let limit = self.config.hat_glasses_overlap;
        survivors.retain(|g| {
            if g.label != "glasses" {
                return true;
            }
            let overlap = g.extent.map_or(0.0, |e| hat.overlap_fraction(&e));
            if overlap > limit {
                log::debug!("glasses suppressed by hat (overlap {:.2})", overlap);
                return false;
            }
            true
        });
    }

    fn overall(&self, fields: &BTreeMap<Category, ProfileField>) -> f32 {
        let (mut weighted, mut total) = (0f32, 0f32);
        for (category, field) in fields {
            let weight = match field.status {
                FieldStatus::NoEvidence => continue,
                FieldStatus::Detected => self.config.weights.get(*category),
                FieldStatus::NoneFound => self.config.none_weight,
            };
            weighted += weight * field.confidence;
            total += weight;
        }
        if total <= 0.0 {
            0.0
        } else {
            weighted / total
        }
    }
}
