pub mod data;
pub mod template;

pub use data::{DetectedTextLine, Field, FieldRecord};
pub use template::{CanonicalTemplate, RegionBox, RegionTable};
