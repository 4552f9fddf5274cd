use image::{DynamicImage, GenericImageView, GrayImage, RgbImage};
use log::{info, warn};
use nalgebra::Matrix3;

use crate::config::{AlignmentStrategy, ExtractorConfig, StrategyKind};
use crate::processing::features::extract_correspondences;
use crate::processing::homography::fit_ransac;
use crate::processing::image::ImageProcessor;
use crate::utils::{AlignmentFailure, AttemptFailure, Budget, IdError};
use crate::validation::{GeometryReport, HomographyValidator};

/// Below this the fit is kept but reported as suspect.
const LOW_INLIER_RATIO: f64 = 0.3;

/// A scan resampled into the template frame by a validated homography.
#[derive(Debug, Clone)]
pub struct Registration {
    pub image: RgbImage,
    /// Scan pixels → template pixels.
    pub homography: Matrix3<f64>,
    pub inlier_ratio: f64,
    pub strategy: StrategyKind,
    pub geometry: GeometryReport,
}

#[derive(Debug, Clone)]
pub enum AlignmentOutcome {
    Aligned(Registration),
    /// Both strategies failed, in the order they were tried.
    Failed {
        primary: AttemptFailure,
        secondary: AttemptFailure,
    },
}

impl AlignmentOutcome {
    pub fn is_aligned(&self) -> bool {
        matches!(self, AlignmentOutcome::Aligned(_))
    }

    pub fn reasons(&self) -> Vec<&AttemptFailure> {
        match self {
            AlignmentOutcome::Aligned(_) => Vec::new(),
            AlignmentOutcome::Failed { primary, secondary } => vec![primary, secondary],
        }
    }

    pub fn into_result(self) -> Result<Registration, IdError> {
        match self {
            AlignmentOutcome::Aligned(registration) => Ok(registration),
            AlignmentOutcome::Failed { primary, secondary } => {
                Err(IdError::AlignmentExhausted { primary, secondary })
            }
        }
    }
}

/// Grayscale inputs shared by both attempts.
struct AlignmentInputs<'a> {
    scan: &'a DynamicImage,
    scan_gray: GrayImage,
    template_gray: GrayImage,
}

impl<'a> AlignmentInputs<'a> {
    fn new(scan: &'a DynamicImage, template: &DynamicImage) -> Self {
        AlignmentInputs {
            scan,
            scan_gray: ImageProcessor::normalized_gray(scan),
            template_gray: ImageProcessor::normalized_gray(template),
        }
    }
}

/// Registers scans against the template: primary strategy first, the more
/// permissive secondary one only if the primary fails.
#[derive(Debug, Clone)]
pub struct Aligner {
    primary: AlignmentStrategy,
    secondary: AlignmentStrategy,
}

impl Default for Aligner {
    fn default() -> Self {
        Aligner::new(AlignmentStrategy::primary(), AlignmentStrategy::secondary())
    }
}

impl Aligner {
    pub fn new(primary: AlignmentStrategy, secondary: AlignmentStrategy) -> Self {
        Aligner { primary, secondary }
    }

    pub fn from_config(config: &ExtractorConfig) -> Self {
        Aligner::new(config.primary.clone(), config.secondary.clone())
    }

    pub fn align(&self, scan: &DynamicImage, template: &DynamicImage) -> AlignmentOutcome {
        let inputs = AlignmentInputs::new(scan, template);
        match self.attempt(&self.primary, &inputs) {
            Ok(registration) => AlignmentOutcome::Aligned(registration),
            Err(primary) => self.fall_back(primary, &inputs),
        }
    }

    /// Like [`Aligner::align`], but checks `budget` before starting the
    /// secondary attempt.
    pub fn align_within(
        &self,
        scan: &DynamicImage,
        template: &DynamicImage,
        budget: &Budget,
    ) -> Result<AlignmentOutcome, IdError> {
        let inputs = AlignmentInputs::new(scan, template);
        match self.attempt(&self.primary, &inputs) {
            Ok(registration) => Ok(AlignmentOutcome::Aligned(registration)),
            Err(primary) => {
                budget.checkpoint("secondary alignment")?;
                Ok(self.fall_back(primary, &inputs))
            }
        }
    }

    fn fall_back(&self, primary: AttemptFailure, inputs: &AlignmentInputs) -> AlignmentOutcome {
        warn!("{}; retrying with the secondary strategy", primary);
        match self.attempt(&self.secondary, inputs) {
            Ok(registration) => AlignmentOutcome::Aligned(registration),
            Err(secondary) => {
                warn!("{}", secondary);
                AlignmentOutcome::Failed { primary, secondary }
            }
        }
    }

    fn attempt(
        &self,
        strategy: &AlignmentStrategy,
        inputs: &AlignmentInputs,
    ) -> Result<Registration, AttemptFailure> {
        Self::run_strategy(strategy, inputs).map_err(|cause| AttemptFailure {
            strategy: strategy.kind,
            cause,
        })
    }

    fn run_strategy(
        strategy: &AlignmentStrategy,
        inputs: &AlignmentInputs,
    ) -> Result<Registration, AlignmentFailure> {
        let correspondences =
            extract_correspondences(&inputs.scan_gray, &inputs.template_gray, strategy)?;
        let fit = fit_ransac(&correspondences, &strategy.ransac)?;

        let scan_dims = inputs.scan.dimensions();
        let template_dims = inputs.template_gray.dimensions();
        let geometry =
            HomographyValidator::validate(&fit.matrix, scan_dims, template_dims, &strategy.limits)?;

        let inlier_ratio = fit.inlier_ratio();
        if inlier_ratio < LOW_INLIER_RATIO {
            warn!(
                "{} strategy: low inlier ratio {:.2} ({} of {})",
                strategy.kind,
                inlier_ratio,
                fit.inlier_count(),
                fit.inliers.len()
            );
        }

        let image = ImageProcessor::warp_to_frame(
            &inputs.scan.to_rgb8(),
            &fit.matrix,
            template_dims.0,
            template_dims.1,
        )
        .map_err(|e| AlignmentFailure::DegenerateTransform(e.to_string()))?;

        info!(
            "{} strategy aligned the scan with inlier ratio {:.2}",
            strategy.kind, inlier_ratio
        );
        Ok(Registration {
            image,
            homography: fit.matrix,
            inlier_ratio,
            strategy: strategy.kind,
            geometry,
        })
    }
}
