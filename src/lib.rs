//! Kiosk Vision
//!
//! Heuristic customer-attribute analysis for retail kiosks. One still frame
//! plus the upstream face/pose detector output goes in; one fused
//! `CustomerProfile` comes out.
//!
//! # Pipeline
//!
//! 1. **Region extraction** (`regions`): head, crown, eye band, torso, arms,
//!    lower body and bag zones, in normalized frame coordinates.
//! 2. **Attribute heuristics** (`heuristics`): independent judges, each a
//!    labelled guess with a confidence and the evidence behind it.
//! 3. **Supervision** (`analyzer`): heuristic chains run concurrently under
//!    one call budget; failures fall back to the next tier, timeouts become
//!    `no_evidence`.
//! 4. **Fusion** (`fusion`): per-category floors, the hat-over-glasses
//!    exclusion, deterministic tie-breaking and an overall confidence.
//! 5. **Reporting** (`report`): presentation rounding for consumers.
//!
//! Raw pixels never leave the `Frame` type; stored profiles carry only labels
//! and confidences.

pub mod analyzer;
pub mod api;
pub mod config;
pub mod error;
pub mod frame;
pub mod fusion;
pub mod heuristics;
pub mod imaging;
pub mod profile;
pub mod regions;
pub mod report;
pub mod storage;
pub mod synthetic;

pub use analyzer::{Analysis, Analyzer, HeuristicChain, HeuristicReport};
pub use config::{AnalyzerConfig, ExecutionMode, KioskConfig};
pub use error::AnalysisError;
pub use frame::{DetectionContext, Frame, NormPoint, NormRect, PoseKeypoints};
pub use fusion::FusionEngine;
pub use heuristics::{
    AttributeGuess, Evidence, Finding, Heuristic, HeuristicInput, NoEvidenceReason,
};
pub use profile::{Category, CustomerProfile, EvidenceState, FieldStatus, ProfileField};
pub use regions::{Region, RegionExtractor, RegionMap, RegionName};
pub use report::present;
pub use storage::{
    shared_memory_uri, InMemoryProfileStore, ProfileStore, SqliteProfileStore, StoredProfile,
};
