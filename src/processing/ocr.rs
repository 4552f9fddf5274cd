use std::collections::BTreeMap;

use image::GrayImage;

use crate::models::DetectedTextLine;
use crate::utils::IdError;

/// Text recognition backend. Lines come back in reading order.
pub trait TextRecognizer {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<DetectedTextLine>, IdError>;
}

impl<T: TextRecognizer + ?Sized> TextRecognizer for &T {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<DetectedTextLine>, IdError> {
        (**self).recognize(image)
    }
}

/// Keep only lines whose confidence is strictly above `cutoff`.
pub fn filter_confident(lines: Vec<DetectedTextLine>, cutoff: f32) -> Vec<DetectedTextLine> {
    lines.into_iter().filter(|l| l.confidence > cutoff).collect()
}

pub fn line_texts(lines: &[DetectedTextLine]) -> Vec<String> {
    lines.iter().map(|l| l.text.clone()).collect()
}

/// Group Tesseract TSV word rows into lines. Confidence is the mean word
/// confidence scaled to [0, 1]; the polygon is the union of word boxes.
pub fn lines_from_tsv(tsv: &str) -> Vec<DetectedTextLine> {
    struct Accum {
        words: Vec<String>,
        confidence: f32,
        left: f32,
        top: f32,
        right: f32,
        bottom: f32,
    }

    let mut lines: BTreeMap<(u32, u32, u32, u32), Accum> = BTreeMap::new();
    for row in tsv.lines() {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let nums: Option<Vec<f32>> = cols[1..11].iter().map(|c| c.trim().parse().ok()).collect();
        let Some(nums) = nums else { continue };
        let text = cols[11].trim();
        if text.is_empty() || nums[9] < 0.0 {
            continue;
        }

        let key = (nums[0] as u32, nums[1] as u32, nums[2] as u32, nums[3] as u32);
        let (left, top, width, height) = (nums[5], nums[6], nums[7], nums[8]);
        let entry = lines.entry(key).or_insert(Accum {
            words: Vec::new(),
            confidence: 0.0,
            left,
            top,
            right: left + width,
            bottom: top + height,
        });
        entry.words.push(text.to_string());
        entry.confidence += nums[9];
        entry.left = entry.left.min(left);
        entry.top = entry.top.min(top);
        entry.right = entry.right.max(left + width);
        entry.bottom = entry.bottom.max(top + height);
    }

    lines
        .into_values()
        .map(|a| {
            let confidence = (a.confidence / a.words.len() as f32 / 100.0).clamp(0.0, 1.0);
            DetectedTextLine::new(
                a.words.join(" "),
                confidence,
                vec![[a.left, a.top], [a.right, a.top], [a.right, a.bottom], [a.left, a.bottom]],
            )
        })
        .collect()
}

#[cfg(feature = "tesseract")]
pub use self::engine::TesseractRecognizer;

#[cfg(feature = "tesseract")]
mod engine {
    use image::GrayImage;
    use log::debug;
    use tesseract::Tesseract;

    use super::{lines_from_tsv, TextRecognizer};
    use crate::models::DetectedTextLine;
    use crate::utils::IdError;

    /// Tesseract through a temporary PNG hand-off.
    pub struct TesseractRecognizer {
        language: String,
        datapath: Option<String>,
    }

    impl TesseractRecognizer {
        pub fn new(language: &str) -> Self {
            TesseractRecognizer {
                language: language.to_string(),
                datapath: None,
            }
        }

        pub fn with_datapath(mut self, datapath: &str) -> Self {
            self.datapath = Some(datapath.to_string());
            self
        }
    }

    impl Default for TesseractRecognizer {
        fn default() -> Self {
            TesseractRecognizer::new("spa")
        }
    }

    impl TextRecognizer for TesseractRecognizer {
        fn recognize(&self, image: &GrayImage) -> Result<Vec<DetectedTextLine>, IdError> {
            let temp_file = tempfile::Builder::new()
                .suffix(".png")
                .tempfile()
                .map_err(|e| IdError::Ocr(format!("Failed to create temp file: {}", e)))?;
            image
                .save(temp_file.path())
                .map_err(|e| IdError::Ocr(format!("Failed to write temp image: {}", e)))?;
            let image_path = temp_file
                .path()
                .to_str()
                .ok_or_else(|| IdError::Ocr("Failed to convert path to string".to_string()))?;

            let tsv = Tesseract::new(self.datapath.as_deref(), Some(self.language.as_str()))
                .map_err(|e| IdError::Ocr(format!("Tesseract init error: {}", e)))?
                .set_image(image_path)
                .map_err(|e| IdError::Ocr(format!("Tesseract set image error: {}", e)))?
                .get_tsv_text(0)
                .map_err(|e| IdError::Ocr(format!("Tesseract error: {}", e)))?;

            let lines = lines_from_tsv(&tsv);
            debug!("Tesseract returned {} lines", lines.len());
            Ok(lines)
        }
    }
}
