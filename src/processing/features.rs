//! Keypoint detection, description and ratio-test matching.
//!
//! Two descriptor families are available. `OrientedBrief` (FAST-9 corners,
//! steered 256-bit BRIEF, Hamming distance) is fast and dense;
//! `GradientPatch` (Shi-Tomasi corners, 4x4x8 gradient histograms, L2
//! distance) survives blur and uneven lighting better and backs up the first
//! one on degraded scans.

use std::cmp::Ordering;
use std::collections::HashSet;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::corners::corners_fast9;
use imageproc::filter::gaussian_blur_f32;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use lazy_static::lazy_static;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{AlignmentStrategy, DetectorKind};
use crate::utils::AlignmentFailure;

const BRIEF_RADIUS: f32 = 12.0;
const CENTROID_RADIUS: i32 = 15;
const BRIEF_BORDER: u32 = 16;
const PATCH_HALF: i32 = 8;
const PATCH_BORDER: u32 = 13;
const TENSOR_HALF: i32 = 2;
const NMS_CELL: f32 = 4.0;
const MIN_LEVEL_SIDE: u32 = 48;

type GradientImage = ImageBuffer<Luma<i16>, Vec<i16>>;

lazy_static! {
    // Fixed sampling pairs so descriptors are comparable across runs.
    static ref BRIEF_PATTERN: Vec<([f32; 2], [f32; 2])> = {
        let mut rng = StdRng::seed_from_u64(0xB41E_F256);
        let mut point = || loop {
            let x: f32 = rng.gen_range(-BRIEF_RADIUS..BRIEF_RADIUS);
            let y: f32 = rng.gen_range(-BRIEF_RADIUS..BRIEF_RADIUS);
            if x * x + y * y <= BRIEF_RADIUS * BRIEF_RADIUS {
                return [x, y];
            }
        };
        (0..256).map(|_| (point(), point())).collect()
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    /// Position in full-resolution pixels.
    pub x: f32,
    pub y: f32,
    pub response: f32,
    /// Radians.
    pub angle: f32,
    pub level: u8,
}

#[derive(Debug, Clone)]
pub enum Descriptors {
    Binary(Vec<[u64; 4]>),
    Float(Vec<[f32; 128]>),
}

impl Descriptors {
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Binary(d) => d.len(),
            Descriptors::Float(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keypoints and their descriptors, index-aligned.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Descriptors,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// A scan point paired with the template point it was matched to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub scan: [f64; 2],
    pub template: [f64; 2],
    /// Descriptor distance of the best match; lower ranks first.
    pub distance: f32,
}

/// Detect, describe and match keypoints between a scan and the template.
/// Both images are expected to be equalised grayscale.
pub fn extract_correspondences(
    scan: &GrayImage,
    template: &GrayImage,
    strategy: &AlignmentStrategy,
) -> Result<Vec<Correspondence>, AlignmentFailure> {
    let scan_features = detect_and_describe(scan, strategy);
    let template_features = detect_and_describe(template, strategy);
    debug!(
        "{} strategy: {} scan keypoints, {} template keypoints",
        strategy.kind,
        scan_features.len(),
        template_features.len()
    );

    if scan_features.len() < strategy.min_keypoints
        || template_features.len() < strategy.min_keypoints
        || scan_features.descriptors.is_empty()
        || template_features.descriptors.is_empty()
    {
        return Err(AlignmentFailure::InsufficientFeatures {
            scan: scan_features.len(),
            template: template_features.len(),
        });
    }

    let matches = match_features(&scan_features, &template_features, strategy.ratio_threshold);
    debug!(
        "{} strategy: {} matches survived ratio {}",
        strategy.kind,
        matches.len(),
        strategy.ratio_threshold
    );

    if matches.len() < strategy.min_matches {
        return Err(AlignmentFailure::InsufficientMatches {
            found: matches.len(),
            required: strategy.min_matches,
        });
    }
    Ok(matches)
}

pub fn detect_and_describe(image: &GrayImage, strategy: &AlignmentStrategy) -> FeatureSet {
    let pyramid = build_pyramid(image, strategy.pyramid_levels, strategy.scale_factor);
    let budgets = level_budgets(strategy.max_keypoints, pyramid.len(), strategy.scale_factor);

    match strategy.detector {
        DetectorKind::OrientedBrief => {
            let mut keypoints = Vec::new();
            let mut descriptors = Vec::new();
            for (level, ((level_image, scale), budget)) in pyramid.iter().zip(budgets).enumerate() {
                let smoothed = gaussian_blur_f32(level_image, 2.0);
                for kp in fast_keypoints(level_image, strategy.detector_threshold, budget) {
                    let angle = intensity_centroid_angle(level_image, kp.0, kp.1);
                    descriptors.push(brief_descriptor(&smoothed, kp.0, kp.1, angle));
                    keypoints.push(Keypoint {
                        x: kp.0 as f32 * scale,
                        y: kp.1 as f32 * scale,
                        response: kp.2,
                        angle,
                        level: level as u8,
                    });
                }
            }
            FeatureSet {
                keypoints,
                descriptors: Descriptors::Binary(descriptors),
            }
        }
        DetectorKind::GradientPatch => {
            let mut keypoints = Vec::new();
            let mut descriptors = Vec::new();
            for (level, ((level_image, scale), budget)) in pyramid.iter().zip(budgets).enumerate() {
                let gx = horizontal_sobel(level_image);
                let gy = vertical_sobel(level_image);
                for kp in shi_tomasi_keypoints(&gx, &gy, strategy.detector_threshold, budget) {
                    let angle = dominant_gradient_angle(&gx, &gy, kp.0, kp.1);
                    descriptors.push(gradient_descriptor(&gx, &gy, kp.0, kp.1, angle));
                    keypoints.push(Keypoint {
                        x: kp.0 as f32 * scale,
                        y: kp.1 as f32 * scale,
                        response: kp.2,
                        angle,
                        level: level as u8,
                    });
                }
            }
            FeatureSet {
                keypoints,
                descriptors: Descriptors::Float(descriptors),
            }
        }
    }
}

/// Two-nearest-neighbour brute-force matching with Lowe's ratio test.
/// Mixed descriptor families never match.
pub fn match_features(scan: &FeatureSet, template: &FeatureSet, ratio: f32) -> Vec<Correspondence> {
    let pairs: Vec<(usize, usize, f32)> = match (&scan.descriptors, &template.descriptors) {
        (Descriptors::Binary(query), Descriptors::Binary(train)) => {
            ratio_matches(query, train, ratio, |a, b| hamming(a, b) as f32)
        }
        (Descriptors::Float(query), Descriptors::Float(train)) => {
            ratio_matches(query, train, ratio, |a, b| squared_l2(a, b).sqrt())
        }
        _ => Vec::new(),
    };

    let mut matches: Vec<Correspondence> = pairs
        .into_iter()
        .map(|(qi, ti, distance)| {
            let s = scan.keypoints[qi];
            let t = template.keypoints[ti];
            Correspondence {
                scan: [s.x as f64, s.y as f64],
                template: [t.x as f64, t.y as f64],
                distance,
            }
        })
        .collect();
    matches.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
    matches
}

fn ratio_matches<D, F>(
    query: &[D],
    train: &[D],
    ratio: f32,
    distance: F,
) -> Vec<(usize, usize, f32)>
where
    F: Fn(&D, &D) -> f32,
{
    if train.len() < 2 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (qi, q) in query.iter().enumerate() {
        let mut best = (usize::MAX, f32::INFINITY);
        let mut second = f32::INFINITY;
        for (ti, t) in train.iter().enumerate() {
            let d = distance(q, t);
            if d < best.1 {
                second = best.1;
                best = (ti, d);
            } else if d < second {
                second = d;
            }
        }
        if best.1 < ratio * second {
            out.push((qi, best.0, best.1));
        }
    }
    out
}

fn hamming(a: &[u64; 4], b: &[u64; 4]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

fn squared_l2(a: &[f32; 128], b: &[f32; 128]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn build_pyramid(image: &GrayImage, levels: u8, scale_factor: f32) -> Vec<(GrayImage, f32)> {
    let mut pyramid = vec![(image.clone(), 1.0f32)];
    // A factor that does not shrink the image leaves only the base level.
    if !scale_factor.is_finite() || scale_factor <= 1.0 {
        return pyramid;
    }
    let mut scale = 1.0f32;
    for _ in 1..levels.max(1) {
        scale *= scale_factor;
        let width = (image.width() as f32 / scale) as u32;
        let height = (image.height() as f32 / scale) as u32;
        if width < MIN_LEVEL_SIDE || height < MIN_LEVEL_SIDE {
            break;
        }
        let level = imageops::resize(image, width, height, FilterType::Triangle);
        // Rescale factor measured on the actual integer size.
        let actual = image.width() as f32 / width as f32;
        pyramid.push((level, actual));
    }
    pyramid
}

/// Split the keypoint budget over pyramid levels in proportion to their area.
fn level_budgets(total: usize, levels: usize, scale_factor: f32) -> Vec<usize> {
    let inv_area = 1.0 / (scale_factor * scale_factor);
    let weights: Vec<f32> = (0..levels).map(|l| inv_area.powi(l as i32)).collect();
    let sum: f32 = weights.iter().sum();
    weights
        .iter()
        .map(|w| ((total as f32) * w / sum).ceil() as usize)
        .collect()
}

/// Greedy grid suppression: strongest candidates first, at most one per
/// neighbourhood of cells.
fn suppress(mut candidates: Vec<(u32, u32, f32)>, budget: usize) -> Vec<(u32, u32, f32)> {
    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));
    let mut occupied = HashSet::new();
    let mut kept = Vec::new();
    for c in candidates {
        if kept.len() >= budget {
            break;
        }
        let cx = (c.0 as f32 / NMS_CELL) as i32;
        let cy = (c.1 as f32 / NMS_CELL) as i32;
        let taken = (-1..=1).any(|dy| (-1..=1).any(|dx| occupied.contains(&(cx + dx, cy + dy))));
        if !taken {
            occupied.insert((cx, cy));
            kept.push(c);
        }
    }
    kept
}

fn fast_keypoints(image: &GrayImage, threshold: u32, budget: usize) -> Vec<(u32, u32, f32)> {
    let (width, height) = image.dimensions();
    if width <= 2 * BRIEF_BORDER || height <= 2 * BRIEF_BORDER {
        return Vec::new();
    }
    let candidates = corners_fast9(image, threshold.min(255) as u8)
        .into_iter()
        .filter(|c| {
            c.x >= BRIEF_BORDER
                && c.y >= BRIEF_BORDER
                && c.x < width - BRIEF_BORDER
                && c.y < height - BRIEF_BORDER
        })
        .map(|c| (c.x, c.y, c.score))
        .collect();
    suppress(candidates, budget)
}

fn intensity_centroid_angle(image: &GrayImage, x: u32, y: u32) -> f32 {
    let (mut m10, mut m01) = (0f32, 0f32);
    let r2 = CENTROID_RADIUS * CENTROID_RADIUS;
    for dy in -CENTROID_RADIUS..=CENTROID_RADIUS {
        for dx in -CENTROID_RADIUS..=CENTROID_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let value = image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32)[0] as f32;
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10)
}

fn brief_descriptor(smoothed: &GrayImage, x: u32, y: u32, angle: f32) -> [u64; 4] {
    let (sin, cos) = angle.sin_cos();
    let sample = |p: &[f32; 2]| {
        let rx = (p[0] * cos - p[1] * sin).round() as i32;
        let ry = (p[0] * sin + p[1] * cos).round() as i32;
        smoothed.get_pixel((x as i32 + rx) as u32, (y as i32 + ry) as u32)[0]
    };

    let mut descriptor = [0u64; 4];
    for (bit, (p, q)) in BRIEF_PATTERN.iter().enumerate() {
        if sample(p) < sample(q) {
            descriptor[bit / 64] |= 1u64 << (bit % 64);
        }
    }
    descriptor
}

fn shi_tomasi_keypoints(
    gx: &GradientImage,
    gy: &GradientImage,
    threshold_permille: u32,
    budget: usize,
) -> Vec<(u32, u32, f32)> {
    let (width, height) = gx.dimensions();
    if width <= 2 * PATCH_BORDER || height <= 2 * PATCH_BORDER {
        return Vec::new();
    }
    let (w, h) = (width as usize, height as usize);

    // Integral images of the structure tensor entries.
    let stride = w + 1;
    let mut ixx = vec![0f64; stride * (h + 1)];
    let mut iyy = vec![0f64; stride * (h + 1)];
    let mut ixy = vec![0f64; stride * (h + 1)];
    for y in 0..h {
        let (mut rxx, mut ryy, mut rxy) = (0f64, 0f64, 0f64);
        for x in 0..w {
            let dx = gx.get_pixel(x as u32, y as u32)[0] as f64;
            let dy = gy.get_pixel(x as u32, y as u32)[0] as f64;
            rxx += dx * dx;
            ryy += dy * dy;
            rxy += dx * dy;
            let i = (y + 1) * stride + x + 1;
            ixx[i] = ixx[i - stride] + rxx;
            iyy[i] = iyy[i - stride] + ryy;
            ixy[i] = ixy[i - stride] + rxy;
        }
    }
    let window_sum = |table: &[f64], x: usize, y: usize| {
        let (x0, y0) = (x - TENSOR_HALF as usize, y - TENSOR_HALF as usize);
        let (x1, y1) = (x + TENSOR_HALF as usize + 1, y + TENSOR_HALF as usize + 1);
        table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
            + table[y0 * stride + x0]
    };

    let border = PATCH_BORDER as usize;
    let mut response = vec![0f32; w * h];
    let mut strongest = 0f32;
    for y in border..h - border {
        for x in border..w - border {
            let a = window_sum(&ixx, x, y);
            let c = window_sum(&iyy, x, y);
            let b = window_sum(&ixy, x, y);
            let half_trace = (a + c) / 2.0;
            let lambda_min = half_trace - (((a - c) / 2.0).powi(2) + b * b).sqrt();
            let r = lambda_min.max(0.0) as f32;
            response[y * w + x] = r;
            strongest = strongest.max(r);
        }
    }
    if strongest <= 0.0 {
        return Vec::new();
    }

    let floor = strongest * threshold_permille as f32 / 1000.0;
    let mut candidates = Vec::new();
    for y in border..h - border {
        for x in border..w - border {
            let r = response[y * w + x];
            if r <= floor {
                continue;
            }
            let is_peak = (-1i32..=1).all(|dy| {
                (-1i32..=1).all(|dx| {
                    (dx == 0 && dy == 0)
                        || response[(y as i32 + dy) as usize * w + (x as i32 + dx) as usize] < r
                })
            });
            if is_peak {
                candidates.push((x as u32, y as u32, r));
            }
        }
    }
    suppress(candidates, budget)
}

fn dominant_gradient_angle(gx: &GradientImage, gy: &GradientImage, x: u32, y: u32) -> f32 {
    const BINS: usize = 36;
    let mut histogram = [0f32; BINS];
    for dy in -PATCH_HALF..=PATCH_HALF {
        for dx in -PATCH_HALF..=PATCH_HALF {
            if dx * dx + dy * dy > PATCH_HALF * PATCH_HALF {
                continue;
            }
            let px = (x as i32 + dx) as u32;
            let py = (y as i32 + dy) as u32;
            let gxv = gx.get_pixel(px, py)[0] as f32;
            let gyv = gy.get_pixel(px, py)[0] as f32;
            let magnitude = (gxv * gxv + gyv * gyv).sqrt();
            let theta = gyv.atan2(gxv).rem_euclid(std::f32::consts::TAU);
            let bin = ((theta / std::f32::consts::TAU) * BINS as f32) as usize % BINS;
            histogram[bin] += magnitude;
        }
    }
    let (peak, _) = histogram
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, v)| if *v > best.1 { (i, *v) } else { best });
    (peak as f32 + 0.5) / BINS as f32 * std::f32::consts::TAU
}

fn gradient_descriptor(
    gx: &GradientImage,
    gy: &GradientImage,
    x: u32,
    y: u32,
    angle: f32,
) -> [f32; 128] {
    let (sin, cos) = angle.sin_cos();
    let mut descriptor = [0f32; 128];
    for v in -PATCH_HALF..PATCH_HALF {
        for u in -PATCH_HALF..PATCH_HALF {
            // Patch coordinates rotated into the image.
            let (fu, fv) = (u as f32 + 0.5, v as f32 + 0.5);
            let px = (x as f32 + fu * cos - fv * sin).round() as u32;
            let py = (y as f32 + fu * sin + fv * cos).round() as u32;
            let gxv = gx.get_pixel(px, py)[0] as f32;
            let gyv = gy.get_pixel(px, py)[0] as f32;

            let magnitude = (gxv * gxv + gyv * gyv).sqrt();
            if magnitude == 0.0 {
                continue;
            }
            let theta = (gyv.atan2(gxv) - angle).rem_euclid(std::f32::consts::TAU);
            let bin = ((theta / std::f32::consts::TAU) * 8.0) as usize % 8;
            let cell = ((v + PATCH_HALF) / 4 * 4 + (u + PATCH_HALF) / 4) as usize;
            let weight = (-(fu * fu + fv * fv) / (2.0 * 8.0 * 8.0)).exp();
            descriptor[cell * 8 + bin] += magnitude * weight;
        }
    }

    normalize(&mut descriptor);
    for value in descriptor.iter_mut() {
        *value = value.min(0.2);
    }
    normalize(&mut descriptor);
    descriptor
}

fn normalize(values: &mut [f32; 128]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    /// Blocky pseudo-random texture with plenty of corners.
    pub(crate) fn textured(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut image = GrayImage::from_pixel(width, height, Luma([128]));
        for _ in 0..(width * height / 400) {
            let x = rng.gen_range(0..width as i32);
            let y = rng.gen_range(0..height as i32);
            let w = rng.gen_range(4..24);
            let h = rng.gen_range(4..24);
            let shade = rng.gen_range(0..=255u8);
            draw_filled_rect_mut(&mut image, Rect::at(x, y).of_size(w, h), Luma([shade]));
        }
        image
    }

    #[test]
    fn flat_image_has_no_features() {
        let flat = GrayImage::from_pixel(200, 150, Luma([90]));
        for strategy in [AlignmentStrategy::primary(), AlignmentStrategy::secondary()] {
            let features = detect_and_describe(&flat, &strategy);
            assert!(features.is_empty());
            assert!(matches!(
                extract_correspondences(&flat, &flat, &strategy),
                Err(AlignmentFailure::InsufficientFeatures { .. })
            ));
        }
    }

    #[test]
    fn descriptors_stay_aligned_with_keypoints() {
        let image = textured(320, 240, 7);
        for strategy in [AlignmentStrategy::primary(), AlignmentStrategy::secondary()] {
            let features = detect_and_describe(&image, &strategy);
            assert!(features.len() >= 10, "{:?} found {}", strategy.detector, features.len());
            assert_eq!(features.len(), features.descriptors.len());
        }
    }

    #[test]
    fn keypoint_budget_is_respected() {
        let image = textured(320, 240, 11);
        let mut strategy = AlignmentStrategy::primary();
        strategy.max_keypoints = 40;
        strategy.pyramid_levels = 1;
        assert!(detect_and_describe(&image, &strategy).len() <= 40);
    }

    #[test]
    fn non_shrinking_scale_factor_keeps_only_the_base_level() {
        let image = textured(200, 150, 11);
        for factor in [0.0, 0.8, 1.0, f32::NAN] {
            let pyramid = build_pyramid(&image, 6, factor);
            assert_eq!(pyramid.len(), 1);
            assert_eq!(pyramid[0].0.dimensions(), (200, 150));
        }
        assert!(build_pyramid(&image, 6, 1.2).len() > 1);
    }

    #[test]
    fn identical_images_match_onto_themselves() {
        let image = textured(320, 240, 3);
        for strategy in [AlignmentStrategy::primary(), AlignmentStrategy::secondary()] {
            let features = detect_and_describe(&image, &strategy);
            let matches = match_features(&features, &features, strategy.ratio_threshold);
            assert!(!matches.is_empty());
            let exact = matches
                .iter()
                .filter(|m| {
                    (m.scan[0] - m.template[0]).abs() < 1e-6
                        && (m.scan[1] - m.template[1]).abs() < 1e-6
                })
                .count();
            assert!(exact * 10 >= matches.len() * 9, "{} of {} exact", exact, matches.len());
            assert!(matches.windows(2).all(|w| w[0].distance <= w[1].distance));
        }
    }

    #[test]
    fn ratio_test_drops_ambiguous_neighbours() {
        let train = vec![[0u64; 4], [1u64, 0, 0, 0], [u64::MAX; 4]];
        // Distances 1 and 0 to the first two: unambiguous.
        let query = vec![[1u64, 0, 0, 0]];
        let kept = ratio_matches(&query, &train, 0.75, |a, b| hamming(a, b) as f32);
        assert_eq!(kept, vec![(0, 1, 0.0)]);

        // Equidistant (1 and 1) from two train descriptors: rejected.
        let query = vec![[0b10u64, 0, 0, 0]];
        let train = vec![[0u64; 4], [0b11u64, 0, 0, 0]];
        assert!(ratio_matches(&query, &train, 0.75, |a, b| hamming(a, b) as f32).is_empty());
    }

    #[test]
    fn single_train_descriptor_never_matches() {
        let kept = ratio_matches(&[[0u64; 4]], &[[0u64; 4]], 0.8, |a, b| hamming(a, b) as f32);
        assert!(kept.is_empty());
    }
}
