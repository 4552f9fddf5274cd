pub mod homography;

pub use homography::{Axis, GeometryReport, GeometryViolation, HomographyValidator};
