use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use image::{imageops, DynamicImage, GrayImage};
use log::{debug, info};
use serde::Serialize;

use crate::config::{ExtractorConfig, StrategyKind};
use crate::models::{CanonicalTemplate, Field, FieldRecord};
use crate::processing::alignment::{Aligner, Registration};
use crate::processing::field_parser::FieldParser;
use crate::processing::image::ImageProcessor;
use crate::processing::ocr::{filter_confident, line_texts, TextRecognizer};
use crate::processing::reconcile::DualPassReconciler;
use crate::processing::segmentation::segment;
use crate::utils::{Budget, IdError};
use crate::validation::GeometryReport;

/// Regions printed over the purple guilloche.
const PRINTED_BACKGROUND: [Field; 2] = [Field::FechaNacimiento, Field::Sexo];

#[derive(Debug, Clone, Serialize)]
pub struct AlignmentSummary {
    pub strategy: StrategyKind,
    pub inlier_ratio: f64,
    /// Row-major, scan pixels → template pixels.
    pub homography: [[f64; 3]; 3],
    pub geometry: GeometryReport,
}

impl AlignmentSummary {
    fn from_registration(registration: &Registration) -> Self {
        let h = &registration.homography;
        let mut homography = [[0.0; 3]; 3];
        for (row, values) in homography.iter_mut().enumerate() {
            for (col, value) in values.iter_mut().enumerate() {
                *value = h[(row, col)];
            }
        }
        AlignmentSummary {
            strategy: registration.strategy,
            inlier_ratio: registration.inlier_ratio,
            homography,
            geometry: registration.geometry,
        }
    }
}

/// Everything one card produced: how it was aligned, the per-region text and
/// the plain, enhanced and merged records.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub alignment: AlignmentSummary,
    pub region_texts: BTreeMap<Field, String>,
    pub plain: FieldRecord,
    pub enhanced: Option<FieldRecord>,
    pub merged: FieldRecord,
    pub elapsed_ms: u128,
}

/// Reads one INE card end to end: register against the template, recognise
/// text, parse, and reconcile the plain and enhanced passes.
pub struct IneExtractor<R> {
    recognizer: R,
    config: ExtractorConfig,
    aligner: Aligner,
    reconciler: DualPassReconciler,
}

impl<R: TextRecognizer> IneExtractor<R> {
    pub fn new(recognizer: R, config: ExtractorConfig) -> Self {
        let aligner = Aligner::from_config(&config);
        let reconciler = DualPassReconciler::new(FieldParser::new(config.parser.clone()));
        IneExtractor {
            recognizer,
            config,
            aligner,
            reconciler,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Fresh budget for one document, per `time_budget_secs`.
    pub fn budget(&self) -> Budget {
        match self.config.time_budget_secs {
            Some(secs) => Budget::with_limit(Duration::from_secs(secs)),
            None => Budget::unbounded(),
        }
    }

    pub fn extract_path(
        &self,
        scan: &Path,
        template: &CanonicalTemplate,
    ) -> Result<ExtractionReport, IdError> {
        let scan = ImageProcessor::load(scan)?;
        self.extract(&scan, template)
    }

    pub fn extract(
        &self,
        scan: &DynamicImage,
        template: &CanonicalTemplate,
    ) -> Result<ExtractionReport, IdError> {
        self.extract_within(scan, template, &self.budget())
    }

    pub fn extract_within(
        &self,
        scan: &DynamicImage,
        template: &CanonicalTemplate,
        budget: &Budget,
    ) -> Result<ExtractionReport, IdError> {
        let registration = self
            .aligner
            .align_within(scan, template.image(), budget)?
            .into_result()?;

        let region_texts = if self.config.recognize_regions {
            self.recognize_regions(&registration, template)?
        } else {
            BTreeMap::new()
        };

        let page = imageops::grayscale(&registration.image);
        let plain_lines = self.recognize_lines(&page)?;
        debug!("plain pass: {} confident lines", plain_lines.len());

        let force = self.config.force_enhanced;
        let reconciliation = self.reconciler.reconcile_with(&plain_lines, force, || {
            budget.checkpoint("enhanced OCR pass")?;
            let enhanced = ImageProcessor::enhance_for_ocr(&page, &self.config.enhance);
            let lines = self.recognize_lines(&enhanced)?;
            debug!("enhanced pass: {} confident lines", lines.len());
            Ok(lines)
        })?;

        info!(
            "card read in {:?}: {} of {} fields filled",
            budget.elapsed(),
            Field::ALL.len() - reconciliation.merged.empty_fields().len(),
            Field::ALL.len()
        );
        Ok(ExtractionReport {
            alignment: AlignmentSummary::from_registration(&registration),
            region_texts,
            plain: reconciliation.plain,
            enhanced: reconciliation.enhanced,
            merged: reconciliation.merged,
            elapsed_ms: budget.elapsed().as_millis(),
        })
    }

    fn recognize_lines(&self, image: &GrayImage) -> Result<Vec<String>, IdError> {
        let lines = self.recognizer.recognize(image)?;
        Ok(line_texts(&filter_confident(lines, self.config.min_ocr_confidence)))
    }

    fn recognize_regions(
        &self,
        registration: &Registration,
        template: &CanonicalTemplate,
    ) -> Result<BTreeMap<Field, String>, IdError> {
        let mut texts = BTreeMap::new();
        for (field, mut crop) in segment(&registration.image, template.regions())? {
            if PRINTED_BACKGROUND.contains(&field) {
                crop = ImageProcessor::clear_background_print(&crop);
            }
            let prepared = ImageProcessor::prepare_region(&imageops::grayscale(&crop));
            let text = self.recognize_lines(&prepared)?.join(" ");
            debug!("region {}: {:?}", field, text);
            texts.insert(field, text);
        }
        Ok(texts)
    }
}
