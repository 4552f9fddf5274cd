pub mod config;
pub mod id_extractor;
pub mod models;
pub mod processing;
pub mod utils;
pub mod validation;

pub use config::ExtractorConfig;
pub use id_extractor::{ExtractionReport, IneExtractor};
pub use models::{CanonicalTemplate, Field, FieldRecord};
pub use utils::{Budget, IdError};
