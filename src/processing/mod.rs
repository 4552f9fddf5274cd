pub mod alignment;
pub mod features;
pub mod field_parser;
pub mod homography;
pub mod image;
pub mod ocr;
pub mod reconcile;
pub mod segmentation;

pub use alignment::{Aligner, AlignmentOutcome, Registration};
pub use field_parser::{is_valid_name_line, parse_fields, similarity, FieldParser};
pub use self::image::ImageProcessor;
pub use ocr::{filter_confident, line_texts, TextRecognizer};
pub use reconcile::{merge_records, DualPassReconciler, Reconciliation};
pub use segmentation::segment;
