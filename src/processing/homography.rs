//! Scan → template homography estimation.
//!
//! Normalised DLT for the model, seeded 4-point RANSAC around it with an
//! adaptive iteration count, then a least-squares refit on the inliers.

use log::debug;
use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;

use crate::config::RansacConfig;
use crate::processing::features::Correspondence;
use crate::utils::AlignmentFailure;

/// Twice the triangle area under which three sample points count as collinear.
const COLLINEAR_EPS: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct HomographyFit {
    /// Maps scan pixels to template pixels, with `matrix[(2, 2)] == 1`.
    pub matrix: Matrix3<f64>,
    /// Index-aligned with the correspondences handed to the estimator.
    pub inliers: Vec<bool>,
}

impl HomographyFit {
    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|i| **i).count()
    }

    pub fn inlier_ratio(&self) -> f64 {
        if self.inliers.is_empty() {
            0.0
        } else {
            self.inlier_count() as f64 / self.inliers.len() as f64
        }
    }
}

pub fn project(h: &Matrix3<f64>, p: [f64; 2]) -> [f64; 2] {
    let q = h * Vector3::new(p[0], p[1], 1.0);
    if q.z.abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [q.x / q.z, q.y / q.z]
}

pub fn reprojection_error(h: &Matrix3<f64>, src: [f64; 2], dst: [f64; 2]) -> f64 {
    let p = project(h, src);
    ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt()
}

/// Translate the centroid to the origin and scale to mean distance sqrt(2).
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts.iter().map(|p| [s * (p[0] - cx), s * (p[1] - cy)]).collect();
    (t, normalized)
}

/// Direct linear transform from at least four correspondences.
pub fn estimate_dlt(src: &[[f64; 2]], dst: &[[f64; 2]]) -> Result<Matrix3<f64>, AlignmentFailure> {
    let n = src.len();
    if n < 4 || n != dst.len() {
        return Err(AlignmentFailure::DegenerateTransform(format!(
            "DLT needs at least 4 paired points, got {} and {}",
            n,
            dst.len()
        )));
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of AᵀA with the smallest eigenvalue.
    let eig = SymmetricEigen::new(a.transpose() * &a);
    let min_idx = eig
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, v)| {
            if v.abs() < best.1 {
                (i, v.abs())
            } else {
                best
            }
        })
        .0;
    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let t_dst_inv = t_dst.try_inverse().ok_or_else(|| {
        AlignmentFailure::DegenerateTransform("normalising transform is singular".to_string())
    })?;
    let h = t_dst_inv * h_norm * t_src;

    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 || h.iter().any(|x| !x.is_finite()) {
        return Err(AlignmentFailure::DegenerateTransform(
            "DLT solution maps points to infinity".to_string(),
        ));
    }
    Ok(h / scale)
}

fn has_collinear_triple(pts: &[[f64; 2]; 4]) -> bool {
    const TRIPLES: [(usize, usize, usize); 4] = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
    TRIPLES.iter().any(|&(i, j, k)| {
        let (a, b, c) = (pts[i], pts[j], pts[k]);
        let cross = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
        cross.abs() < COLLINEAR_EPS
    })
}

/// Iterations needed to draw one all-inlier sample with `confidence`, given
/// the current inlier fraction.
fn adaptive_iterations(inlier_ratio: f64, confidence: f64, cap: usize) -> usize {
    let w4 = inlier_ratio.powi(4);
    if w4 >= 1.0 - f64::EPSILON {
        return 1;
    }
    if w4 <= f64::EPSILON {
        return cap;
    }
    let n = (1.0 - confidence).ln() / (1.0 - w4).ln();
    if n.is_finite() {
        (n.ceil() as usize).clamp(1, cap)
    } else {
        cap
    }
}

/// Robustly fit the homography taking each `scan` point onto its `template`
/// point.
pub fn fit_ransac(
    matches: &[Correspondence],
    config: &RansacConfig,
) -> Result<HomographyFit, AlignmentFailure> {
    let n = matches.len();
    if n < 4 {
        return Err(AlignmentFailure::DegenerateTransform(format!(
            "RANSAC needs at least 4 correspondences, got {}",
            n
        )));
    }
    let src: Vec<[f64; 2]> = matches.iter().map(|m| m.scan).collect();
    let dst: Vec<[f64; 2]> = matches.iter().map(|m| m.template).collect();

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;
    let mut needed = config.max_iterations;
    let mut iteration = 0;

    while iteration < needed {
        iteration += 1;
        let sample = index::sample(&mut rng, n, 4);
        let pick = |i: usize| sample.index(i);
        let s4 = [src[pick(0)], src[pick(1)], src[pick(2)], src[pick(3)]];
        let d4 = [dst[pick(0)], dst[pick(1)], dst[pick(2)], dst[pick(3)]];
        if has_collinear_triple(&s4) || has_collinear_triple(&d4) {
            continue;
        }

        let h = match estimate_dlt(&s4, &d4) {
            Ok(h) => h,
            Err(_) => continue,
        };

        let mask: Vec<bool> = src
            .iter()
            .zip(&dst)
            .map(|(s, d)| reprojection_error(&h, *s, *d) < config.reprojection_threshold)
            .collect();
        let count = mask.iter().filter(|m| **m).count();

        if best.as_ref().map_or(true, |b| count > b.2) {
            let ratio = count as f64 / n as f64;
            needed = adaptive_iterations(ratio, config.confidence, config.max_iterations);
            best = Some((h, mask, count));
        }
    }

    let (best_h, best_mask, best_count) = best.ok_or_else(|| {
        AlignmentFailure::DegenerateTransform("every RANSAC sample was degenerate".to_string())
    })?;
    if best_count < 4 {
        return Err(AlignmentFailure::DegenerateTransform(format!(
            "best model supports only {} correspondences",
            best_count
        )));
    }
    debug!(
        "RANSAC: {} of {} inliers after {} iterations",
        best_count, n, iteration
    );

    let inlier_src: Vec<[f64; 2]> = (0..n).filter(|&i| best_mask[i]).map(|i| src[i]).collect();
    let inlier_dst: Vec<[f64; 2]> = (0..n).filter(|&i| best_mask[i]).map(|i| dst[i]).collect();
    let refit = estimate_dlt(&inlier_src, &inlier_dst).unwrap_or(best_h);

    let refit_mask: Vec<bool> = src
        .iter()
        .zip(&dst)
        .map(|(s, d)| reprojection_error(&refit, *s, *d) < config.reprojection_threshold)
        .collect();

    // Keep the refit only if it does not lose support.
    let (matrix, inliers) = if refit_mask.iter().filter(|m| **m).count() >= best_count {
        (refit, refit_mask)
    } else {
        (best_h, best_mask)
    };
    Ok(HomographyFit { matrix, inliers })
}
