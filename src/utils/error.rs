use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::StrategyKind;
use crate::models::Field;
use crate::validation::GeometryViolation;

/// Crate-wide error type. Field parsing never produces one of these: an
/// unrecognised line only leaves a field empty.
#[derive(Debug, Error)]
pub enum IdError {
    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("OCR error: {0}")]
    Ocr(String),

    #[error("Region {field} ({x1}..{x2}, {y1}..{y2}) lies outside a {width}x{height} image")]
    RegionOutOfBounds {
        field: Field,
        y1: u32,
        y2: u32,
        x1: u32,
        x2: u32,
        width: u32,
        height: u32,
    },

    #[error("Alignment exhausted: {primary}; {secondary}")]
    AlignmentExhausted {
        primary: AttemptFailure,
        secondary: AttemptFailure,
    },

    #[error("Processing cancelled before {0}")]
    Cancelled(&'static str),

    #[error("Time budget of {budget:?} exceeded before {stage}")]
    DeadlineExceeded {
        stage: &'static str,
        budget: Duration,
    },
}

/// Why a single alignment attempt gave up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignmentFailure {
    #[error("insufficient features (scan: {scan} keypoints, template: {template} keypoints)")]
    InsufficientFeatures { scan: usize, template: usize },

    #[error("insufficient matches: {found} survived the ratio test, {required} required")]
    InsufficientMatches { found: usize, required: usize },

    #[error("degenerate transform: {0}")]
    DegenerateTransform(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(#[from] GeometryViolation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub strategy: StrategyKind,
    pub cause: AlignmentFailure,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} strategy failed with {}", self.strategy, self.cause)
    }
}
