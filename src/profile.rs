//! Customer profile data model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label used for every category that has nothing to report.
pub const NONE_LABEL: &str = "none";

/// Attribute categories, in profile order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ClothingItem,
    ClothingStyle,
    PrimaryColor,
    SecondaryColor,
    HeadAccessory,
    BagAccessory,
    AgeRange,
    Emotion,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::ClothingItem,
        Category::ClothingStyle,
        Category::PrimaryColor,
        Category::SecondaryColor,
        Category::HeadAccessory,
        Category::BagAccessory,
        Category::AgeRange,
        Category::Emotion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ClothingItem => "clothing_item",
            Category::ClothingStyle => "clothing_style",
            Category::PrimaryColor => "primary_color",
            Category::SecondaryColor => "secondary_color",
            Category::HeadAccessory => "head_accessory",
            Category::BagAccessory => "bag_accessory",
            Category::AgeRange => "age_range",
            Category::Emotion => "emotion",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a profile field came to hold its label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    /// A guess cleared its category floor.
    Detected,
    /// The heuristic ran and found nothing, or its guess was gated/suppressed.
    NoneFound,
    /// The heuristic's precondition was unmet, it timed out, or it failed.
    NoEvidence,
}

/// Which branch of the fusion state machine produced the profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceState {
    NoPerson,
    PartialEvidence,
    FullEvidence,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileField {
    pub label: String,
    pub confidence: f32,
    pub status: FieldStatus,
    /// Other labels that cleared every rule but lost the tie-break.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also: Vec<String>,
}

impl ProfileField {
    pub fn detected(label: impl Into<String>, confidence: f32, also: Vec<String>) -> Self {
        Self {
            label: label.into(),
            confidence,
            status: FieldStatus::Detected,
            also,
        }
    }

    pub fn none_found(confidence: f32) -> Self {
        Self {
            label: NONE_LABEL.to_string(),
            confidence,
            status: FieldStatus::NoneFound,
            also: Vec::new(),
        }
    }

    pub fn no_evidence() -> Self {
        Self {
            label: NONE_LABEL.to_string(),
            confidence: 0.0,
            status: FieldStatus::NoEvidence,
            also: Vec::new(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.status != FieldStatus::Detected
    }
}

/// Fused result of one analysis call. Built once, never updated in place.
///
/// Serializes as a flat mapping `category -> {label, confidence, ...}` next to
/// `overall_confidence`, `fallback_used` and `state`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    #[serde(flatten)]
    fields: BTreeMap<Category, ProfileField>,
    pub overall_confidence: f32,
    pub fallback_used: bool,
    pub state: EvidenceState,
}

impl CustomerProfile {
    pub(crate) fn new(
        fields: BTreeMap<Category, ProfileField>,
        overall_confidence: f32,
        fallback_used: bool,
        state: EvidenceState,
    ) -> Self {
        Self {
            fields,
            overall_confidence,
            fallback_used,
            state,
        }
    }

    /// Field for a category. Every category is always populated.
    pub fn field(&self, category: Category) -> &ProfileField {
        &self.fields[&category]
    }

    pub fn label(&self, category: Category) -> &str {
        &self.field(category).label
    }

    pub fn confidence(&self, category: Category) -> f32 {
        self.field(category).confidence
    }

    pub fn fields(&self) -> impl Iterator<Item = (Category, &ProfileField)> {
        self.fields.iter().map(|(c, f)| (*c, f))
    }

    /// Same profile with every confidence passed through `f`. Labels untouched.
    pub(crate) fn map_confidences(mut self, f: impl Fn(f32) -> f32) -> Self {
        for field in self.fields.values_mut() {
            field.confidence = f(field.confidence);
        }
        self.overall_confidence = f(self.overall_confidence);
        self
    }
}
