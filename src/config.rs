//! Tunable constants for alignment, parsing and the enhanced OCR pass.
//!
//! Defaults reproduce the calibrated values for the INE template. Any subset
//! can be overridden from a JSON file.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::IdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Primary,
    Secondary,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StrategyKind::Primary => f.write_str("primary"),
            StrategyKind::Secondary => f.write_str("secondary"),
        }
    }
}

/// Keypoint detector and descriptor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// FAST-9 corners with steered binary BRIEF descriptors (Hamming).
    OrientedBrief,
    /// Shi-Tomasi corners with gradient-histogram descriptors (L2).
    GradientPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    /// Max reprojection error, in pixels, for a correspondence to count as inlier.
    pub reprojection_threshold: f64,
    pub max_iterations: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        RansacConfig {
            reprojection_threshold: 3.0,
            max_iterations: 5000,
            confidence: 0.995,
            seed: 0x1E5C,
        }
    }
}

/// Plausibility bounds for a fitted homography.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryLimits {
    pub max_scale: f64,
    pub max_shear: f64,
    /// Projected source corners may overshoot the destination by this
    /// fraction of its larger dimension.
    pub corner_margin_ratio: f64,
}

impl Default for GeometryLimits {
    fn default() -> Self {
        GeometryLimits {
            max_scale: 3.0,
            max_shear: 0.5,
            corner_margin_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentStrategy {
    pub kind: StrategyKind,
    pub detector: DetectorKind,
    pub max_keypoints: usize,
    /// FAST intensity threshold (binary family) or minimum-eigenvalue
    /// fraction of the strongest response (gradient family), scaled by 1000.
    pub detector_threshold: u32,
    pub pyramid_levels: u8,
    pub scale_factor: f32,
    pub ratio_threshold: f32,
    pub min_matches: usize,
    /// Either image yielding fewer keypoints than this fails the attempt.
    pub min_keypoints: usize,
    pub ransac: RansacConfig,
    pub limits: GeometryLimits,
}

impl AlignmentStrategy {
    pub fn primary() -> Self {
        AlignmentStrategy {
            kind: StrategyKind::Primary,
            detector: DetectorKind::OrientedBrief,
            max_keypoints: 30000,
            detector_threshold: 20,
            pyramid_levels: 8,
            scale_factor: 1.2,
            ratio_threshold: 0.75,
            min_matches: 30,
            min_keypoints: 10,
            ransac: RansacConfig::default(),
            limits: GeometryLimits::default(),
        }
    }

    pub fn secondary() -> Self {
        AlignmentStrategy {
            kind: StrategyKind::Secondary,
            detector: DetectorKind::GradientPatch,
            max_keypoints: 5000,
            detector_threshold: 10,
            pyramid_levels: 4,
            scale_factor: 1.4,
            ratio_threshold: 0.80,
            min_matches: 20,
            min_keypoints: 10,
            ransac: RansacConfig {
                reprojection_threshold: 5.0,
                max_iterations: 2000,
                ..RansacConfig::default()
            },
            limits: GeometryLimits {
                max_scale: 2.5,
                ..GeometryLimits::default()
            },
        }
    }
}

impl Default for AlignmentStrategy {
    fn default() -> Self {
        Self::primary()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Label tokens that disqualify a line from being a name.
    pub exclusion_words: Vec<String>,
    /// Lines inspected after a NOMBRE label.
    pub name_window: usize,
    pub max_name_words: usize,
    pub min_name_chars: usize,
    pub label_similarity: f64,
    pub curp_similarity: f64,
    pub voter_key_len: usize,
    pub voter_key_min_len: usize,
    pub voter_key_max_len: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        let exclusion_words = [
            "SEX", "SEXO", "SEXQ", "MUESTRA", "NOMBRE", "FECHA", "CLAVE", "CURP",
            "DOMICILIO", "REGISTRO", "AÑO", "LOCALIDAD", "ESTADO", "VIGENCIA", "EMISIÓN",
        ];
        ParserConfig {
            exclusion_words: exclusion_words.iter().map(|w| w.to_string()).collect(),
            name_window: 7,
            max_name_words: 5,
            min_name_chars: 2,
            label_similarity: 0.6,
            curp_similarity: 0.75,
            voter_key_len: 18,
            voter_key_min_len: 16,
            voter_key_max_len: 20,
        }
    }
}

/// Variant of the page fed to the second OCR pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhanceConfig {
    /// Narrower pages are upscaled to this width first.
    pub min_width: u32,
    pub equalize: bool,
    pub denoise_radius: u32,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        EnhanceConfig {
            min_width: 1500,
            equalize: true,
            denoise_radius: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub primary: AlignmentStrategy,
    pub secondary: AlignmentStrategy,
    pub parser: ParserConfig,
    pub enhance: EnhanceConfig,
    /// Recognised lines at or below this confidence are discarded.
    pub min_ocr_confidence: f32,
    /// Run the enhanced pass even when the plain pass filled every field.
    pub force_enhanced: bool,
    /// Recognise each region crop separately and report its text.
    pub recognize_regions: bool,
    pub time_budget_secs: Option<u64>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig {
            primary: AlignmentStrategy::primary(),
            secondary: AlignmentStrategy::secondary(),
            parser: ParserConfig::default(),
            enhance: EnhanceConfig::default(),
            min_ocr_confidence: 0.3,
            force_enhanced: false,
            recognize_regions: true,
            time_budget_secs: None,
        }
    }
}

impl ExtractorConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, IdError> {
        let raw = std::fs::read_to_string(path)?;
        let overrides: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| IdError::Config(format!("Failed to parse {:?}: {}", path, e)))?;

        // Overlay onto the serialised defaults so a partial `secondary`
        // block keeps the secondary preset rather than the primary one.
        let mut merged = serde_json::to_value(ExtractorConfig::default())
            .map_err(|e| IdError::Config(e.to_string()))?;
        overlay(&mut merged, overrides);

        let mut config: ExtractorConfig = serde_json::from_value(merged)
            .map_err(|e| IdError::Config(format!("Invalid configuration in {:?}: {}", path, e)))?;
        config.check()?;
        // Lines are upper-cased before the vocabulary check.
        for word in config.parser.exclusion_words.iter_mut() {
            *word = word.to_uppercase();
        }
        Ok(config)
    }

    fn check(&self) -> Result<(), IdError> {
        for strategy in [&self.primary, &self.secondary] {
            if !(0.0..=1.0).contains(&strategy.ratio_threshold) {
                return Err(IdError::Config(format!(
                    "{} ratio threshold {} outside [0, 1]",
                    strategy.kind, strategy.ratio_threshold
                )));
            }
            if !strategy.scale_factor.is_finite() || strategy.scale_factor <= 1.0 {
                return Err(IdError::Config(format!(
                    "{} pyramid scale_factor {} must exceed 1.0",
                    strategy.kind, strategy.scale_factor
                )));
            }
            if strategy.pyramid_levels == 0 {
                return Err(IdError::Config(format!(
                    "{} needs at least one pyramid level",
                    strategy.kind
                )));
            }
            if strategy.limits.max_scale <= 1.0 {
                return Err(IdError::Config(format!(
                    "{} max_scale must exceed 1.0",
                    strategy.kind
                )));
            }
            if !(0.0..1.0).contains(&strategy.ransac.confidence) {
                return Err(IdError::Config(format!(
                    "{} RANSAC confidence must lie in [0, 1)",
                    strategy.kind
                )));
            }
        }
        if self.parser.voter_key_min_len > self.parser.voter_key_max_len {
            return Err(IdError::Config(
                "voter key length range is inverted".to_string(),
            ));
        }
        Ok(())
    }
}

fn overlay(base: &mut serde_json::Value, overrides: serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
