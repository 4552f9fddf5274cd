use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::{equalize_histogram, otsu_level, threshold};
use imageproc::distance_transform::Norm;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::morphology::dilate;
use nalgebra::Matrix3;

use crate::config::EnhanceConfig;
use crate::utils::IdError;

/// Purple guilloche printed behind the birth date and sex code.
const BACKGROUND_PRINT: [u8; 3] = [128, 85, 113];
const BACKGROUND_TOLERANCE: u8 = 35;
const CLEARED: Rgb<u8> = Rgb([240, 240, 240]);

/// Stateless pixel transforms used around the alignment and OCR stages.
pub struct ImageProcessor;

impl ImageProcessor {
    pub fn load(path: &Path) -> Result<DynamicImage, IdError> {
        image::open(path).map_err(|e| {
            IdError::ImageProcessing(format!("Failed to open image {:?}: {}", path, e))
        })
    }

    /// Grayscale plus histogram equalisation, the input to keypoint detection.
    pub fn normalized_gray(image: &DynamicImage) -> GrayImage {
        equalize_histogram(&image.to_luma8())
    }

    /// Equalise, lightly blur, then Otsu-binarise a single field crop.
    pub fn prepare_region(crop: &GrayImage) -> GrayImage {
        let blurred = gaussian_blur_f32(&equalize_histogram(crop), 0.8);
        let level = otsu_level(&blurred);
        threshold(&blurred, level)
    }

    /// Paint the background print light grey, except where dark text lies on
    /// top of it. Text is whatever falls at or below the Otsu level, clamped
    /// to the range printed text plausibly occupies.
    pub fn clear_background_print(crop: &RgbImage) -> RgbImage {
        let (width, height) = crop.dimensions();
        let print = GrayImage::from_fn(width, height, |x, y| {
            let near = crop
                .get_pixel(x, y)
                .0
                .iter()
                .zip(BACKGROUND_PRINT.iter())
                .all(|(c, t)| c.abs_diff(*t) <= BACKGROUND_TOLERANCE);
            Luma([if near { 255 } else { 0 }])
        });
        let print = dilate(&print, Norm::LInf, 1);

        let gray = imageops::grayscale(crop);
        let level = match otsu_level(&gray) {
            l if l < 50 => 50,
            l if l > 160 => 200,
            l => l,
        };
        let text = GrayImage::from_fn(width, height, |x, y| {
            Luma([if gray.get_pixel(x, y)[0] <= level { 255 } else { 0 }])
        });
        let text = dilate(&text, Norm::LInf, 1);

        let mut cleared = crop.clone();
        for (x, y, pixel) in cleared.enumerate_pixels_mut() {
            if print.get_pixel(x, y)[0] > 0 && text.get_pixel(x, y)[0] == 0 {
                *pixel = CLEARED;
            }
        }
        cleared
    }

    /// Page variant for the second OCR pass: upscaled, contrast-stretched and
    /// denoised.
    pub fn enhance_for_ocr(page: &GrayImage, config: &EnhanceConfig) -> GrayImage {
        let (width, height) = page.dimensions();
        let mut enhanced = if width > 0 && width < config.min_width {
            let scale = config.min_width as f32 / width as f32;
            let new_height = ((height as f32) * scale).round().max(1.0) as u32;
            imageops::resize(page, config.min_width, new_height, FilterType::CatmullRom)
        } else {
            page.clone()
        };

        if config.equalize {
            enhanced = equalize_histogram(&enhanced);
        }
        if config.denoise_radius > 0 {
            enhanced = median_filter(&enhanced, config.denoise_radius, config.denoise_radius);
        }
        enhanced
    }

    /// Resample `scan` into a `width`×`height` frame through `homography`
    /// (scan coordinates → frame coordinates). Uncovered pixels are white.
    pub fn warp_to_frame(
        scan: &RgbImage,
        homography: &Matrix3<f64>,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, IdError> {
        let mut coefficients = [0f32; 9];
        for row in 0..3 {
            for col in 0..3 {
                coefficients[row * 3 + col] = homography[(row, col)] as f32;
            }
        }
        let projection = Projection::from_matrix(coefficients).ok_or_else(|| {
            IdError::ImageProcessing("homography is not invertible".to_string())
        })?;

        let mut out = RgbImage::new(width, height);
        warp_into(
            scan,
            &projection,
            Interpolation::Bilinear,
            Rgb([255, 255, 255]),
            &mut out,
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepared_region_is_binary() {
        let crop = GrayImage::from_fn(40, 20, |x, _| if x < 20 { Luma([40]) } else { Luma([200]) });
        let prepared = ImageProcessor::prepare_region(&crop);
        assert_eq!(prepared.dimensions(), (40, 20));
        assert!(prepared.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn background_print_is_cleared_around_dark_text() {
        let mut crop = RgbImage::from_pixel(60, 30, Rgb(BACKGROUND_PRINT));
        for y in 10..20 {
            for x in 20..40 {
                crop.put_pixel(x, y, Rgb([10, 10, 10]));
            }
        }

        let cleared = ImageProcessor::clear_background_print(&crop);
        assert_eq!(*cleared.get_pixel(2, 2), CLEARED);
        assert_eq!(*cleared.get_pixel(55, 25), CLEARED);
        assert_eq!(*cleared.get_pixel(30, 15), Rgb([10, 10, 10]));
        // The text halo keeps the print touching the glyph edges.
        assert_eq!(*cleared.get_pixel(19, 15), Rgb(BACKGROUND_PRINT));
    }

    #[test]
    fn crops_without_background_print_are_untouched() {
        let crop = RgbImage::from_fn(40, 20, |x, _| {
            if x < 20 {
                Rgb([20, 20, 20])
            } else {
                Rgb([235, 235, 235])
            }
        });
        assert_eq!(ImageProcessor::clear_background_print(&crop), crop);
    }

    #[test]
    fn enhancement_upscales_narrow_pages() {
        let page = GrayImage::from_pixel(750, 400, Luma([128]));
        let enhanced = ImageProcessor::enhance_for_ocr(&page, &EnhanceConfig::default());
        assert_eq!(enhanced.dimensions(), (1500, 800));
    }

    #[test]
    fn identity_warp_preserves_pixels() {
        let scan = RgbImage::from_fn(30, 20, |x, _| {
            if x < 15 {
                Rgb([200, 0, 0])
            } else {
                Rgb([0, 0, 200])
            }
        });
        let warped =
            ImageProcessor::warp_to_frame(&scan, &Matrix3::identity(), 30, 20).unwrap();
        assert_eq!(*warped.get_pixel(5, 10), Rgb([200, 0, 0]));
        assert_eq!(*warped.get_pixel(24, 10), Rgb([0, 0, 200]));
    }

    #[test]
    fn translated_warp_fills_border_with_white() {
        let scan = RgbImage::from_pixel(30, 20, Rgb([0, 0, 0]));
        let shift = Matrix3::new(1.0, 0.0, 10.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let warped = ImageProcessor::warp_to_frame(&scan, &shift, 30, 20).unwrap();
        assert_eq!(*warped.get_pixel(2, 10), Rgb([255, 255, 255]));
        assert_eq!(*warped.get_pixel(20, 10), Rgb([0, 0, 0]));
    }
}
