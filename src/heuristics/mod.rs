//! Attribute heuristics.
//!
//! Each heuristic reads the shared frame through the region map and reports
//! one `Finding` per category it owns. Heuristics never look at one another's
//! output; cross-category rules live in fusion.

mod bag;
mod clothing;
mod color;
mod demographic;
mod head_accessory;

pub use bag::{classify_bag, BagDetector, BlobEvidence};
pub use clothing::{classify_clothing, ClothingClassifier, ClothingEvidence};
pub use color::{nearest_palette_color, HistogramColorExtractor, MeanColorExtractor, PALETTE};
pub use demographic::{
    LowConfidenceEstimator, TextureDemographicEstimator, AGE_BRACKETS, LOW_CONFIDENCE,
};
pub use head_accessory::HeadAccessoryDetector;

use anyhow::Result;
use serde::Serialize;
use std::fmt;

use crate::config::AnalyzerConfig;
use crate::frame::{DetectionContext, Frame, NormRect};
use crate::profile::Category;
use crate::regions::{Region, RegionMap, RegionName};

/// One raw measurement and the threshold it was compared against.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Evidence {
    pub metric: &'static str,
    pub value: f32,
    pub threshold: f32,
    pub passed: bool,
}

impl Evidence {
    /// `value > threshold`.
    pub fn above(metric: &'static str, value: f32, threshold: f32) -> Self {
        Self {
            metric,
            value,
            threshold,
            passed: value > threshold,
        }
    }

    /// `value >= threshold`.
    pub fn at_least(metric: &'static str, value: f32, threshold: f32) -> Self {
        Self {
            metric,
            value,
            threshold,
            passed: value >= threshold,
        }
    }

    /// `value < threshold`.
    pub fn below(metric: &'static str, value: f32, threshold: f32) -> Self {
        Self {
            metric,
            value,
            threshold,
            passed: value < threshold,
        }
    }

    /// `value <= threshold`.
    pub fn at_most(metric: &'static str, value: f32, threshold: f32) -> Self {
        Self {
            metric,
            value,
            threshold,
            passed: value <= threshold,
        }
    }

    /// Measurement kept for explainability only.
    pub fn measured(metric: &'static str, value: f32) -> Self {
        Self {
            metric,
            value,
            threshold: f32::NAN,
            passed: true,
        }
    }
}

pub(crate) fn all_passed(evidence: &[Evidence]) -> bool {
    evidence.iter().all(|e| e.passed)
}

/// A labelled guess produced by exactly one heuristic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AttributeGuess {
    pub category: Category,
    pub label: String,
    pub confidence: f32,
    pub evidence: Vec<Evidence>,
    /// Frame area the guess refers to, when it is localised.
    pub extent: Option<NormRect>,
}

impl AttributeGuess {
    pub fn new(category: Category, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            category,
            label: label.into(),
            confidence,
            evidence: Vec::new(),
            extent: None,
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<Evidence>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_extent(mut self, extent: NormRect) -> Self {
        self.extent = Some(extent);
        self
    }
}

/// Why a category could not be evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "region")]
pub enum NoEvidenceReason {
    MissingRegion(RegionName),
    FaceNotDetected,
    PoseNotDetected,
    Timeout,
    Failed,
}

impl fmt::Display for NoEvidenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoEvidenceReason::MissingRegion(name) => write!(f, "missing region {:?}", name),
            NoEvidenceReason::FaceNotDetected => f.write_str("face not detected"),
            NoEvidenceReason::PoseNotDetected => f.write_str("pose not detected"),
            NoEvidenceReason::Timeout => f.write_str("timed out"),
            NoEvidenceReason::Failed => f.write_str("every tier failed"),
        }
    }
}

/// Outcome of one heuristic for one category.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Finding {
    Guess(AttributeGuess),
    /// Evaluated, nothing cleared the thresholds.
    Absent {
        category: Category,
        evidence: Vec<Evidence>,
    },
    /// Precondition unmet; not evaluated.
    NoEvidence {
        category: Category,
        reason: NoEvidenceReason,
    },
}

impl Finding {
    pub fn category(&self) -> Category {
        match self {
            Finding::Guess(g) => g.category,
            Finding::Absent { category, .. } | Finding::NoEvidence { category, .. } => *category,
        }
    }

    pub fn absent(category: Category, evidence: Vec<Evidence>) -> Self {
        Finding::Absent { category, evidence }
    }

    pub fn no_evidence(category: Category, reason: NoEvidenceReason) -> Self {
        Finding::NoEvidence { category, reason }
    }

    pub fn is_no_evidence(&self) -> bool {
        matches!(self, Finding::NoEvidence { .. })
    }
}

/// Everything a heuristic may read during one analysis call.
pub struct HeuristicInput<'a> {
    pub frame: &'a Frame,
    pub regions: &'a RegionMap,
    pub context: &'a DetectionContext,
    pub config: &'a AnalyzerConfig,
}

impl<'a> HeuristicInput<'a> {
    pub fn region(&self, name: RegionName) -> Option<&'a Region> {
        self.regions.get(&name)
    }
}

/// A deterministic, bounded attribute heuristic.
///
/// Implementations read pixels only through `HeuristicInput` and must not keep
/// any state between calls. Returning `Err` (or panicking) hands the call to
/// the next tier of the chain.
pub trait Heuristic: Send + Sync {
    /// Identifier used in logs and reports.
    fn name(&self) -> &'static str;

    /// Categories this heuristic reports on, one finding each.
    fn categories(&self) -> &'static [Category];

    fn evaluate(&self, input: &HeuristicInput<'_>) -> Result<Vec<Finding>>;
}

/// Same `NoEvidence` reason for every category of a heuristic.
pub(crate) fn no_evidence_for(categories: &[Category], reason: NoEvidenceReason) -> Vec<Finding> {
    categories
        .iter()
        .map(|c| Finding::no_evidence(*c, reason))
        .collect()
}

/// Confidence from the weakest normalized margin: `base` when a threshold is
/// barely cleared, approaching `base + span` as every margin saturates.
pub(crate) fn margin_confidence(base: f32, span: f32, margins: &[f32]) -> f32 {
    let weakest = margins
        .iter()
        .copied()
        .fold(1.0f32, |acc, m| acc.min(m.clamp(0.0, 1.0)));
    (base + span * weakest).clamp(0.0, 0.95)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::frame::Frame;

    pub fn painted(width: u32, height: u32, paint: impl Fn(u32, u32) -> [u8; 3]) -> Frame {
        Frame::from_fn(width, height, paint)
    }
}
