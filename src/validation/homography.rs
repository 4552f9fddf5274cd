use log::debug;
use nalgebra::{Matrix3, Vector3};
use serde::Serialize;
use thiserror::Error;

use crate::config::GeometryLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Axis {
    X,
    Y,
}

/// Why a fitted homography was judged physically implausible.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryViolation {
    #[error("homography has non-finite entries")]
    NonFinite,

    #[error("homography is degenerate: {0}")]
    Degenerate(String),

    #[error("scale along {axis:?} is {value:.3}, outside [{min:.3}, {max:.3}]")]
    ScaleOutOfRange {
        axis: Axis,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("shear {shear:.3} exceeds {max:.3}")]
    ExcessiveShear { shear: f64, max: f64 },

    #[error("source corner {corner} projects to ({x:.1}, {y:.1}), outside the destination")]
    CornerOutOfBounds { corner: usize, x: f64, y: f64 },
}

/// Linear-part decomposition of an accepted homography.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeometryReport {
    pub scale_x: f64,
    pub scale_y: f64,
    pub shear: f64,
}

pub struct HomographyValidator;

impl HomographyValidator {
    /// Check `h` (source → destination) against `limits`. `src` and `dst`
    /// are `(width, height)` of the two images.
    pub fn validate(
        h: &Matrix3<f64>,
        src: (u32, u32),
        dst: (u32, u32),
        limits: &GeometryLimits,
    ) -> Result<GeometryReport, GeometryViolation> {
        if h.iter().any(|v| !v.is_finite()) {
            return Err(GeometryViolation::NonFinite);
        }
        let h22 = h[(2, 2)];
        if h22.abs() < 1e-12 {
            return Err(GeometryViolation::Degenerate("h22 is zero".to_string()));
        }
        let h = h / h22;

        let (a, b) = (h[(0, 0)], h[(0, 1)]);
        let (c, d) = (h[(1, 0)], h[(1, 1)]);
        let scale_x = (a * a + c * c).sqrt();
        let scale_y = (b * b + d * d).sqrt();
        if scale_x < 1e-12 || scale_y < 1e-12 {
            return Err(GeometryViolation::Degenerate(
                "linear part collapses an axis".to_string(),
            ));
        }

        let min_scale = 1.0 / limits.max_scale;
        for (axis, value) in [(Axis::X, scale_x), (Axis::Y, scale_y)] {
            if value < min_scale || value > limits.max_scale {
                return Err(GeometryViolation::ScaleOutOfRange {
                    axis,
                    value,
                    min: min_scale,
                    max: limits.max_scale,
                });
            }
        }

        let shear = (a * b + c * d).abs() / (scale_x * scale_y);
        if shear > limits.max_shear {
            return Err(GeometryViolation::ExcessiveShear {
                shear,
                max: limits.max_shear,
            });
        }

        Self::check_corners(&h, src, dst, limits.corner_margin_ratio)?;

        debug!(
            "homography accepted: scale ({:.3}, {:.3}), shear {:.3}",
            scale_x, scale_y, shear
        );
        Ok(GeometryReport {
            scale_x,
            scale_y,
            shear,
        })
    }

    fn check_corners(
        h: &Matrix3<f64>,
        src: (u32, u32),
        dst: (u32, u32),
        margin_ratio: f64,
    ) -> Result<(), GeometryViolation> {
        let (sw, sh) = (src.0 as f64, src.1 as f64);
        let (dw, dh) = (dst.0 as f64, dst.1 as f64);
        let margin = margin_ratio * dw.max(dh);

        let corners = [(0.0, 0.0), (sw, 0.0), (sw, sh), (0.0, sh)];
        for (index, (x, y)) in corners.iter().enumerate() {
            let p = h * Vector3::new(*x, *y, 1.0);
            // A corner mapped through the line at infinity lands nowhere sensible.
            if p.z <= 1e-12 {
                return Err(GeometryViolation::CornerOutOfBounds {
                    corner: index,
                    x: f64::INFINITY,
                    y: f64::INFINITY,
                });
            }
            let (px, py) = (p.x / p.z, p.y / p.z);
            if px < -margin || px > dw + margin || py < -margin || py > dh + margin {
                return Err(GeometryViolation::CornerOutOfBounds {
                    corner: index,
                    x: px,
                    y: py,
                });
            }
        }
        Ok(())
    }
}
