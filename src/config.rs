use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::AnalysisError;
use crate::profile::Category;

const DEFAULT_DB_PATH: &str = "kiosk.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8791";
const DEFAULT_HEURISTIC_BUDGET_MS: u64 = 500;

// ----------------------------------------------------------------------------
// Threshold configuration (immutable for the process lifetime)
// ----------------------------------------------------------------------------

/// How heuristic chains are scheduled within one analysis call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One thread per chain, joined against the call deadline.
    #[default]
    Threaded,
    /// Chains run in order on the caller's thread.
    Inline,
}

impl FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threaded" => Ok(Self::Threaded),
            "inline" => Ok(Self::Inline),
            other => Err(anyhow!("unknown analysis mode '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub mode: ExecutionMode,
    /// Per-call budget shared by every heuristic chain.
    pub heuristic_budget_ms: u64,
}

impl RuntimeConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.heuristic_budget_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Threaded,
            heuristic_budget_ms: DEFAULT_HEURISTIC_BUDGET_MS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegionConfig {
    /// Vertical gap (fraction of frame height) kept between head, torso and
    /// lower-body regions.
    pub separation_margin: f32,
    /// Regions smaller than this many pixels are dropped.
    pub min_region_px: u32,
    /// Bag zones are restricted to this band of frame height.
    pub bag_band_top: f32,
    pub bag_band_bottom: f32,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            separation_margin: 0.02,
            min_region_px: 16,
            bag_band_top: 0.30,
            bag_band_bottom: 0.70,
        }
    }
}

/// One clothing category; every required ratio must be strictly exceeded.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClothingRule {
    pub label: String,
    pub min_shoulder_ratio: f32,
    pub min_torso_height_ratio: f32,
    /// `None` when the category does not constrain sleeves.
    #[serde(default)]
    pub min_arm_coverage: Option<f32>,
}

impl ClothingRule {
    pub fn new(label: &str, shoulder: f32, torso_height: f32, arm: Option<f32>) -> Self {
        Self {
            label: label.to_string(),
            min_shoulder_ratio: shoulder,
            min_torso_height_ratio: torso_height,
            min_arm_coverage: arm,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClothingConfig {
    /// Ordered most to least restrictive; the first satisfied rule wins.
    pub rules: Vec<ClothingRule>,
    /// RGB distance from the torso reference colour that still counts as garment.
    pub garment_color_tolerance: f32,
    /// Fraction of a row/column that must be garment for it to count as covered.
    pub coverage_fill: f32,
    /// Height of the shoulder band as a fraction of the torso region.
    pub shoulder_band: f32,
    pub formal_max_texture_std: f32,
    pub base_confidence: f32,
    pub min_reference_px: u32,
}

impl Default for ClothingConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                ClothingRule::new("jacket", 0.35, 0.50, Some(0.30)),
                ClothingRule::new("hoodie", 0.30, 0.40, Some(0.25)),
                ClothingRule::new("long_sleeve", 0.25, 0.30, Some(0.20)),
                ClothingRule::new("t_shirt", 0.20, 0.25, None),
            ],
            garment_color_tolerance: 60.0,
            coverage_fill: 0.5,
            shoulder_band: 0.15,
            formal_max_texture_std: 18.0,
            base_confidence: 0.55,
            min_reference_px: 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColorConfig {
    pub quantization_levels: u8,
    pub min_pixels: u32,
    pub secondary_min_share: f32,
    pub mean_fallback_ceiling: f32,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            quantization_levels: 4,
            min_pixels: 64,
            secondary_min_share: 0.10,
            mean_fallback_ceiling: 0.40,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeadAccessoryConfig {
    pub hat_dark_max: f32,
    pub hat_min_saturation: f32,
    pub hat_min_fill: f32,
    pub hat_min_shape_contrast: f32,
    pub hat_max_std: f32,
    pub glasses_dark_max: f32,
    pub glasses_min_lens_fill: f32,
    pub glasses_min_bridge: f32,
}

impl Default for HeadAccessoryConfig {
    fn default() -> Self {
        Self {
            hat_dark_max: 90.0,
            hat_min_saturation: 0.45,
            hat_min_fill: 0.55,
            hat_min_shape_contrast: 0.25,
            hat_max_std: 40.0,
            glasses_dark_max: 70.0,
            glasses_min_lens_fill: 0.30,
            glasses_min_bridge: 0.60,
        }
    }
}

/// Conservative bag calibration. Every limit must hold at once.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BagConfig {
    pub mask_cutoff: f32,
    pub backpack_min_area: u64,
    pub purse_min_area: u64,
    pub min_contrast_std: f32,
    pub max_mean_brightness: f32,
    pub purse_min_center_y: f32,
    pub bbox_padding: f32,
}

impl Default for BagConfig {
    fn default() -> Self {
        Self {
            mask_cutoff: 100.0,
            backpack_min_area: 10_000,
            purse_min_area: 15_000,
            min_contrast_std: 30.0,
            max_mean_brightness: 100.0,
            purse_min_center_y: 0.55,
            bbox_padding: 0.10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DemographicConfig {
    pub min_head_px: u64,
    /// Ascending texture boundaries between the four age brackets.
    pub age_texture_bounds: Vec<f32>,
    pub happy_min_mouth_contrast: f32,
    pub confidence_floor: f32,
    pub confidence_ceiling: f32,
}

impl Default for DemographicConfig {
    fn default() -> Self {
        Self {
            min_head_px: 400,
            age_texture_bounds: vec![8.0, 16.0, 26.0],
            happy_min_mouth_contrast: 22.0,
            confidence_floor: 0.30,
            confidence_ceiling: 0.60,
        }
    }
}

/// One value per category.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryTable {
    pub clothing_item: f32,
    pub clothing_style: f32,
    pub primary_color: f32,
    pub secondary_color: f32,
    pub head_accessory: f32,
    pub bag_accessory: f32,
    pub age_range: f32,
    pub emotion: f32,
}

impl CategoryTable {
    pub fn get(&self, category: Category) -> f32 {
        match category {
            Category::ClothingItem => self.clothing_item,
            Category::ClothingStyle => self.clothing_style,
            Category::PrimaryColor => self.primary_color,
            Category::SecondaryColor => self.secondary_color,
            Category::HeadAccessory => self.head_accessory,
            Category::BagAccessory => self.bag_accessory,
            Category::AgeRange => self.age_range,
            Category::Emotion => self.emotion,
        }
    }

    fn values(&self) -> impl Iterator<Item = (Category, f32)> + '_ {
        Category::ALL.into_iter().map(move |c| (c, self.get(c)))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FusionConfig {
    /// Minimum confidence for a guess to be reported.
    pub floors: CategoryTable,
    /// Weight of a detected field in the overall confidence.
    pub weights: CategoryTable,
    /// Weight of a "none" field in the overall confidence.
    pub none_weight: f32,
    /// Confidence reported for an evaluated category that found nothing.
    pub absent_confidence: f32,
    /// Hat suppresses glasses when their extents overlap beyond this fraction.
    pub hat_glasses_overlap: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            floors: CategoryTable {
                clothing_item: 0.40,
                clothing_style: 0.35,
                primary_color: 0.25,
                secondary_color: 0.10,
                head_accessory: 0.50,
                bag_accessory: 0.50,
                age_range: 0.25,
                emotion: 0.25,
            },
            weights: CategoryTable {
                clothing_item: 1.0,
                clothing_style: 0.6,
                primary_color: 0.8,
                secondary_color: 0.4,
                head_accessory: 0.8,
                bag_accessory: 0.8,
                age_range: 0.5,
                emotion: 0.4,
            },
            none_weight: 0.1,
            absent_confidence: 0.35,
            hat_glasses_overlap: 0.25,
        }
    }
}

/// The single threshold object handed to every heuristic call.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    pub runtime: RuntimeConfig,
    pub regions: RegionConfig,
    pub clothing: ClothingConfig,
    pub color: ColorConfig,
    pub head_accessory: HeadAccessoryConfig,
    pub bag: BagConfig,
    pub demographics: DemographicConfig,
    pub fusion: FusionConfig,
}

impl AnalyzerConfig {
    /// Reject configurations that would make analysis meaningless.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.runtime.heuristic_budget_ms == 0 {
            return Err(AnalysisError::config("runtime.heuristic_budget_ms must be > 0"));
        }

        let r = &self.regions;
        fraction("regions.separation_margin", r.separation_margin)?;
        fraction("regions.bag_band_top", r.bag_band_top)?;
        fraction("regions.bag_band_bottom", r.bag_band_bottom)?;
        if r.bag_band_top >= r.bag_band_bottom {
            return Err(AnalysisError::config(
                "regions.bag_band_top must be above regions.bag_band_bottom",
            ));
        }

        let c = &self.clothing;
        if c.rules.is_empty() {
            return Err(AnalysisError::config("clothing.rules must not be empty"));
        }
        for rule in &c.rules {
            if rule.label.trim().is_empty() {
                return Err(AnalysisError::config("clothing rule label must not be empty"));
            }
            fraction("clothing.rules.min_shoulder_ratio", rule.min_shoulder_ratio)?;
            fraction(
                "clothing.rules.min_torso_height_ratio",
                rule.min_torso_height_ratio,
            )?;
            if let Some(arm) = rule.min_arm_coverage {
                fraction("clothing.rules.min_arm_coverage", arm)?;
            }
        }
        positive("clothing.garment_color_tolerance", c.garment_color_tolerance)?;
        fraction("clothing.coverage_fill", c.coverage_fill)?;
        fraction("clothing.shoulder_band", c.shoulder_band)?;
        positive("clothing.formal_max_texture_std", c.formal_max_texture_std)?;
        fraction("clothing.base_confidence", c.base_confidence)?;

        let col = &self.color;
        if !(2..=16).contains(&col.quantization_levels) {
            return Err(AnalysisError::config(
                "color.quantization_levels must be within 2..=16",
            ));
        }
        fraction("color.secondary_min_share", col.secondary_min_share)?;
        fraction("color.mean_fallback_ceiling", col.mean_fallback_ceiling)?;

        let h = &self.head_accessory;
        positive("head_accessory.hat_dark_max", h.hat_dark_max)?;
        fraction("head_accessory.hat_min_saturation", h.hat_min_saturation)?;
        fraction("head_accessory.hat_min_fill", h.hat_min_fill)?;
        fraction("head_accessory.hat_min_shape_contrast", h.hat_min_shape_contrast)?;
        positive("head_accessory.hat_max_std", h.hat_max_std)?;
        positive("head_accessory.glasses_dark_max", h.glasses_dark_max)?;
        fraction("head_accessory.glasses_min_lens_fill", h.glasses_min_lens_fill)?;
        fraction("head_accessory.glasses_min_bridge", h.glasses_min_bridge)?;

        let b = &self.bag;
        positive("bag.mask_cutoff", b.mask_cutoff)?;
        if b.backpack_min_area == 0 || b.purse_min_area == 0 {
            return Err(AnalysisError::config("bag minimum areas must be > 0"));
        }
        positive("bag.min_contrast_std", b.min_contrast_std)?;
        positive("bag.max_mean_brightness", b.max_mean_brightness)?;
        fraction("bag.purse_min_center_y", b.purse_min_center_y)?;
        fraction("bag.bbox_padding", b.bbox_padding)?;

        let d = &self.demographics;
        if d.age_texture_bounds.len() != 3 {
            return Err(AnalysisError::config(
                "demographics.age_texture_bounds must hold exactly 3 values",
            ));
        }
        if d.age_texture_bounds.windows(2).any(|w| !(w[0] < w[1])) {
            return Err(AnalysisError::config(
                "demographics.age_texture_bounds must be strictly ascending",
            ));
        }
        positive("demographics.happy_min_mouth_contrast", d.happy_min_mouth_contrast)?;
        fraction("demographics.confidence_floor", d.confidence_floor)?;
        fraction("demographics.confidence_ceiling", d.confidence_ceiling)?;
        if d.confidence_floor >= d.confidence_ceiling {
            return Err(AnalysisError::config(
                "demographics.confidence_floor must be below confidence_ceiling",
            ));
        }

        let f = &self.fusion;
        for (category, floor) in f.floors.values() {
            fraction(&format!("fusion.floors.{}", category), floor)?;
        }
        for (category, weight) in f.weights.values() {
            non_negative(&format!("fusion.weights.{}", category), weight)?;
        }
        if f.weights.values().all(|(_, w)| w == 0.0) {
            return Err(AnalysisError::config("fusion.weights must not all be zero"));
        }
        non_negative("fusion.none_weight", f.none_weight)?;
        fraction("fusion.absent_confidence", f.absent_confidence)?;
        fraction("fusion.hat_glasses_overlap", f.hat_glasses_overlap)?;
        Ok(())
    }
}

fn fraction(name: &str, value: f32) -> Result<(), AnalysisError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(AnalysisError::config(format!(
            "{} must be within 0..=1 (got {})",
            name, value
        )));
    }
    Ok(())
}

fn positive(name: &str, value: f32) -> Result<(), AnalysisError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AnalysisError::config(format!(
            "{} must be > 0 (got {})",
            name, value
        )));
    }
    Ok(())
}

fn non_negative(name: &str, value: f32) -> Result<(), AnalysisError> {
    if !value.is_finite() || value < 0.0 {
        return Err(AnalysisError::config(format!(
            "{} must be >= 0 (got {})",
            name, value
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Process configuration (file + environment)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct KioskConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    runtime: Option<RuntimeConfig>,
    regions: Option<RegionConfig>,
    clothing: Option<ClothingConfig>,
    color: Option<ColorConfig>,
    head_accessory: Option<HeadAccessoryConfig>,
    bag: Option<BagConfig>,
    demographics: Option<DemographicConfig>,
    fusion: Option<FusionConfig>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct KioskConfig {
    pub db_path: String,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub analyzer: AnalyzerConfig,
}

impl Default for KioskConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            api_addr: DEFAULT_API_ADDR.to_string(),
            api_token_path: None,
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl KioskConfig {
    /// Load from `KIOSK_CONFIG` (TOML) when set, apply environment overrides,
    /// and validate. Any problem is fatal: the service must not start on a
    /// half-valid threshold set.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("KIOSK_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: KioskConfigFile =
            toml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: KioskConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let api_addr = file
            .api
            .as_ref()
            .and_then(|api| api.addr.clone())
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let api_token_path = file.api.and_then(|api| api.token_path);
        let analyzer = AnalyzerConfig {
            runtime: file.runtime.unwrap_or_default(),
            regions: file.regions.unwrap_or_default(),
            clothing: file.clothing.unwrap_or_default(),
            color: file.color.unwrap_or_default(),
            head_accessory: file.head_accessory.unwrap_or_default(),
            bag: file.bag.unwrap_or_default(),
            demographics: file.demographics.unwrap_or_default(),
            fusion: file.fusion.unwrap_or_default(),
        };
        Self {
            db_path,
            api_addr,
            api_token_path,
            analyzer,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("KIOSK_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(addr) = std::env::var("KIOSK_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(path) = std::env::var("KIOSK_API_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.api_token_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(budget) = std::env::var("KIOSK_HEURISTIC_BUDGET_MS") {
            self.analyzer.runtime.heuristic_budget_ms = budget.trim().parse().map_err(|_| {
                anyhow!("KIOSK_HEURISTIC_BUDGET_MS must be an integer number of milliseconds")
            })?;
        }
        if let Ok(mode) = std::env::var("KIOSK_ANALYSIS_MODE") {
            if !mode.trim().is_empty() {
                self.analyzer.runtime.mode = mode.parse()?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("api addr '{}' is not a socket address: {}", self.api_addr, e))?;
        self.analyzer.validate()?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<KioskConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
