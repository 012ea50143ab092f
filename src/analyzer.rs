//! Analysis supervisor.
//!
//! - `HeuristicChain`: heuristic implementations ranked by preference. The
//!   first tier that completes wins; an error or a panic moves on to the next
//!   tier and is recorded as a fallback.
//! - `Analyzer`: validates the input, extracts regions, fans the chains out
//!   (one thread each, or inline), joins them against one call deadline and
//!   hands the reports to fusion in chain order.

use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::config::{AnalyzerConfig, ExecutionMode};
use crate::error::AnalysisError;
use crate::frame::{DetectionContext, Frame};
use crate::fusion::FusionEngine;
use crate::heuristics::{
    no_evidence_for, BagDetector, ClothingClassifier, Finding, HeadAccessoryDetector, Heuristic,
    HeuristicInput, HistogramColorExtractor, LowConfidenceEstimator, MeanColorExtractor,
    NoEvidenceReason, TextureDemographicEstimator,
};
use crate::profile::{Category, CustomerProfile};
use crate::regions::{RegionExtractor, RegionMap};

/// What one chain contributed to an analysis call.
#[derive(Clone, Debug, Serialize)]
pub struct HeuristicReport {
    pub chain: &'static str,
    /// Tier that produced the findings; `None` when no tier completed.
    pub tier: Option<&'static str>,
    pub fallback_used: bool,
    pub findings: Vec<Finding>,
}

impl HeuristicReport {
    fn unavailable(chain: &HeuristicChain, reason: NoEvidenceReason) -> Self {
        Self {
            chain: chain.name,
            tier: None,
            fallback_used: false,
            findings: no_evidence_for(chain.categories, reason),
        }
    }
}

pub struct HeuristicChain {
    name: &'static str,
    categories: &'static [Category],
    tiers: Vec<Box<dyn Heuristic>>,
}

impl HeuristicChain {
    /// Chain owning the categories of its preferred implementation.
    pub fn new(name: &'static str, preferred: impl Heuristic + 'static) -> Self {
        Self {
            name,
            categories: preferred.categories(),
            tiers: vec![Box::new(preferred)],
        }
    }

    /// Append a lower-ranked implementation.
    pub fn with_fallback(mut self, fallback: impl Heuristic + 'static) -> Self {
        if fallback.categories() != self.categories {
            log::warn!(
                "chain {}: fallback {} reports {:?}, chain owns {:?}",
                self.name,
                fallback.name(),
                fallback.categories(),
                self.categories
            );
        }
        self.tiers.push(Box::new(fallback));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn categories(&self) -> &'static [Category] {
        self.categories
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Run tiers in order until one completes.
    pub fn run(&self, input: &HeuristicInput<'_>) -> HeuristicReport {
        for (rank, tier) in self.tiers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| tier.evaluate(input))) {
                Ok(Ok(findings)) => {
                    if rank > 0 {
                        log::warn!("chain {}: fell back to {}", self.name, tier.name());
                    }
                    return HeuristicReport {
                        chain: self.name,
                        tier: Some(tier.name()),
                        fallback_used: rank > 0,
                        findings: self.complete(tier.name(), findings),
                    };
                }
                Ok(Err(err)) => {
                    log::warn!("chain {}: {} failed: {:#}", self.name, tier.name(), err);
                }
                Err(payload) => {
                    log::warn!(
                        "chain {}: {} panicked: {}",
                        self.name,
                        tier.name(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        log::warn!("chain {}: every tier failed", self.name);
        HeuristicReport {
            chain: self.name,
            tier: None,
            fallback_used: true,
            findings: no_evidence_for(self.categories, NoEvidenceReason::Failed),
        }
    }

    /// Drop findings outside the chain's categories and fill any gap.
    fn complete(&self, tier: &str, mut findings: Vec<Finding>) -> Vec<Finding> {
        findings.retain(|f| {
            let owned = self.categories.contains(&f.category());
            if !owned {
                log::warn!("chain {}: {} reported foreign {}", self.name, tier, f.category());
            }
            owned
        });
        for category in self.categories {
            if !findings.iter().any(|f| f.category() == *category) {
                log::warn!("chain {}: {} omitted {}", self.name, tier, category);
                findings.push(Finding::no_evidence(*category, NoEvidenceReason::Failed));
            }
        }
        findings
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Profile plus the per-chain reports that produced it.
#[derive(Clone, Debug, Serialize)]
pub struct Analysis {
    pub profile: CustomerProfile,
    pub reports: Vec<HeuristicReport>,
}

/// Stateless analysis entry point. Safe to share across threads; calls do
/// not interact.
pub struct Analyzer {
    config: Arc<AnalyzerConfig>,
    extractor: RegionExtractor,
    fusion: FusionEngine,
    chains: Vec<Arc<HeuristicChain>>,
}

impl Analyzer {
    /// Analyzer with the built-in heuristic chains.
    pub fn new(config: AnalyzerConfig) -> Result<Self, AnalysisError> {
        Self::with_chains(config, Self::default_chains())
    }

    pub fn with_chains(
        config: AnalyzerConfig,
        chains: Vec<HeuristicChain>,
    ) -> Result<Self, AnalysisError> {
        config.validate()?;
        let extractor = RegionExtractor::new(&config.regions);
        let fusion = FusionEngine::new(&config.fusion);
        Ok(Self {
            config: Arc::new(config),
            extractor,
            fusion,
            chains: chains.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn default_chains() -> Vec<HeuristicChain> {
        vec![
            HeuristicChain::new("clothing", ClothingClassifier::new()),
            HeuristicChain::new("color", HistogramColorExtractor::new())
                .with_fallback(MeanColorExtractor::new()),
            HeuristicChain::new("head_accessory", HeadAccessoryDetector::new()),
            HeuristicChain::new("bag", BagDetector::new()),
            HeuristicChain::new("demographics", TextureDemographicEstimator::new())
                .with_fallback(LowConfidenceEstimator::new()),
        ]
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn chains(&self) -> impl Iterator<Item = &HeuristicChain> {
        self.chains.iter().map(|c| c.as_ref())
    }

    /// `analyze(frame, detection_context) -> CustomerProfile`.
    pub fn analyze(
        &self,
        frame: &Frame,
        ctx: &DetectionContext,
    ) -> Result<CustomerProfile, AnalysisError> {
        Ok(self.analyze_detailed(frame, ctx)?.profile)
    }

    /// Like `analyze`, keeping the per-chain reports for explainability.
    pub fn analyze_detailed(
        &self,
        frame: &Frame,
        ctx: &DetectionContext,
    ) -> Result<Analysis, AnalysisError> {
        if frame.is_empty() {
            return Err(AnalysisError::input(format!(
                "frame has zero dimensions ({}x{})",
                frame.width(),
                frame.height()
            )));
        }
        ctx.validate()?;
        let tag = hex::encode(&frame.digest()[..6]);

        if !ctx.person_detected() {
            log::debug!("frame {}: no person detected", tag);
            return Ok(Analysis {
                profile: self.fusion.no_person(),
                reports: Vec::new(),
            });
        }

        let regions = Arc::new(self.extractor.extract(frame, ctx));
        let reports = match self.config.runtime.mode {
            ExecutionMode::Threaded => self.run_threaded(frame, &regions, ctx),
            ExecutionMode::Inline => self.run_inline(frame, &regions, ctx),
        };
        let profile = self.fusion.fuse(&reports);
        log::debug!(
            "frame {}: {:?} overall={:.2} fallback={}",
            tag,
            profile.state,
            profile.overall_confidence,
            profile.fallback_used
        );
        Ok(Analysis { profile, reports })
    }

    fn run_threaded(
        &self,
        frame: &Frame,
        regions: &Arc<RegionMap>,
        ctx: &DetectionContext,
    ) -> Vec<HeuristicReport> {
        let deadline = Instant::now() + self.config.runtime.budget();
        let (tx, rx) = mpsc::channel();
        let mut slots: Vec<Option<HeuristicReport>> = self.chains.iter().map(|_| None).collect();

        for (idx, chain) in self.chains.iter().enumerate() {
            let tx = tx.clone();
            let worker_chain = Arc::clone(chain);
            let frame = frame.clone();
            let regions = Arc::clone(regions);
            let ctx = ctx.clone();
            let config = Arc::clone(&self.config);
            let spawned = thread::Builder::new()
                .name(format!("heuristic-{}", chain.name()))
                .spawn(move || {
                    let input = HeuristicInput {
                        frame: &frame,
                        regions: &regions,
                        context: &ctx,
                        config: &config,
                    };
                    let report = worker_chain.run(&input);
                    // The receiver is gone once the deadline has passed.
                    let _ = tx.send((idx, report));
                });
            if let Err(err) = spawned {
                log::warn!("chain {}: failed to spawn worker: {}", chain.name(), err);
                slots[idx] = Some(HeuristicReport::unavailable(chain, NoEvidenceReason::Failed));
            }
        }
        drop(tx);

        let mut pending = slots.iter().filter(|s| s.is_none()).count();
        let mut disconnected = false;
        while pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok((idx, report)) => {
                    if slots[idx].is_none() {
                        slots[idx] = Some(report);
                        pending -= 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        slots
            .into_iter()
            .zip(self.chains.iter())
            .map(|(slot, chain)| {
                slot.unwrap_or_else(|| {
                    if disconnected {
                        log::warn!("chain {}: worker exited without a report", chain.name());
                        HeuristicReport::unavailable(chain, NoEvidenceReason::Failed)
                    } else {
                        log::warn!(
                            "chain {}: exceeded the {} ms budget",
                            chain.name(),
                            self.config.runtime.heuristic_budget_ms
                        );
                        HeuristicReport::unavailable(chain, NoEvidenceReason::Timeout)
                    }
                })
            })
            .collect()
    }

    fn run_inline(
        &self,
        frame: &Frame,
        regions: &RegionMap,
        ctx: &DetectionContext,
    ) -> Vec<HeuristicReport> {
        let budget = self.config.runtime.budget();
        let started = Instant::now();
        let input = HeuristicInput {
            frame,
            regions,
            context: ctx,
            config: &self.config,
        };
        self.chains
            .iter()
            .map(|chain| {
                if started.elapsed() >= budget {
                    log::warn!("chain {}: budget exhausted before start", chain.name());
                    return HeuristicReport::unavailable(chain, NoEvidenceReason::Timeout);
                }
                let report = chain.run(&input);
                if started.elapsed() > budget {
                    log::warn!(
                        "chain {}: exceeded the {} ms budget",
                        chain.name(),
                        self.config.runtime.heuristic_budget_ms
                    );
                    return HeuristicReport::unavailable(chain, NoEvidenceReason::Timeout);
                }
                report
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heuristics::AttributeGuess;
    use anyhow::anyhow;

    const HEAD: &[Category] = &[Category::HeadAccessory];

    struct Failing;
    impl Heuristic for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn categories(&self) -> &'static [Category] {
            HEAD
        }
        fn evaluate(&self, _: &HeuristicInput<'_>) -> anyhow::Result<Vec<Finding>> {
            Err(anyhow!("boom"))
        }
    }

    struct Panicking;
    impl Heuristic for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn categories(&self) -> &'static [Category] {
            HEAD
        }
        fn evaluate(&self, _: &HeuristicInput<'_>) -> anyhow::Result<Vec<Finding>> {
            panic!("heuristic bug")
        }
    }

    struct Fixed(&'static str);
    impl Heuristic for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn categories(&self) -> &'static [Category] {
            HEAD
        }
        fn evaluate(&self, _: &HeuristicInput<'_>) -> anyhow::Result<Vec<Finding>> {
            Ok(vec![Finding::Guess(AttributeGuess::new(
                Category::HeadAccessory,
                self.0,
                0.9,
            ))])
        }
    }

    struct Silent;
    impl Heuristic for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }
        fn categories(&self) -> &'static [Category] {
            HEAD
        }
        fn evaluate(&self, _: &HeuristicInput<'_>) -> anyhow::Result<Vec<Finding>> {
            Ok(vec![Finding::absent(Category::Emotion, Vec::new())])
        }
    }

    fn run_chain(chain: &HeuristicChain) -> HeuristicReport {
        let frame = Frame::from_rgb(4, 4, vec![0u8; 48]).unwrap();
        let regions = RegionMap::new();
        let ctx = DetectionContext::none().with_face(None);
        let config = AnalyzerConfig::default();
        let input = HeuristicInput {
            frame: &frame,
            regions: &regions,
            context: &ctx,
            config: &config,
        };
        chain.run(&input)
    }

    #[test]
    fn first_completing_tier_wins_without_fallback() {
        let chain = HeuristicChain::new("head", Fixed("hat")).with_fallback(Fixed("glasses"));
        let report = run_chain(&chain);
        assert_eq!(report.tier, Some("fixed"));
        assert!(!report.fallback_used);
    }

    #[test]
    fn error_and_panic_fall_through_to_next_tier() {
        let chain = HeuristicChain::new("head", Failing)
            .with_fallback(Panicking)
            .with_fallback(Fixed("hat"));
        let report = run_chain(&chain);
        assert!(report.fallback_used);
        assert_eq!(report.tier, Some("fixed"));
        assert_eq!(chain.tier_names(), vec!["failing", "panicking", "fixed"]);
    }

    #[test]
    fn all_tiers_failing_is_no_evidence() {
        let chain = HeuristicChain::new("head", Failing).with_fallback(Panicking);
        let report = run_chain(&chain);
        assert!(report.fallback_used);
        assert_eq!(report.tier, None);
        assert_eq!(
            report.findings,
            vec![Finding::no_evidence(Category::HeadAccessory, NoEvidenceReason::Failed)]
        );
    }

    #[test]
    fn foreign_and_missing_categories_are_normalized() {
        let report = run_chain(&HeuristicChain::new("head", Silent));
        assert_eq!(
            report.findings,
            vec![Finding::no_evidence(Category::HeadAccessory, NoEvidenceReason::Failed)]
        );
    }

    #[test]
    fn empty_frame_is_invalid_input() {
        let analyzer = Analyzer::new(AnalyzerConfig::default()).unwrap();
        let frame = Frame::from_rgb(0, 10, Vec::new()).unwrap();
        let err = analyzer
            .analyze(&frame, &DetectionContext::none().with_pose(None))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidInput(_)));
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = AnalyzerConfig::default();
        config.runtime.heuristic_budget_ms = 0;
        assert!(matches!(
            Analyzer::new(config),
            Err(AnalysisError::Config(_))
        ));
    }

    #[test]
    fn default_chains_cover_every_category_once() {
        let chains = Analyzer::default_chains();
        let mut owned: Vec<Category> = chains
            .iter()
            .flat_map(|c| c.categories().iter().copied())
            .collect();
        owned.sort();
        assert_eq!(owned, Category::ALL.to_vec());
    }
}
