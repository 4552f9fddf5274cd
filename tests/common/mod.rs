#![allow(dead_code)]

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;
use nalgebra::Matrix3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ine_reader::models::{Field, RegionBox, RegionTable};
use ine_reader::processing::ImageProcessor;

pub const CARD_WIDTH: u32 = 640;
pub const CARD_HEIGHT: u32 = 400;

/// Synthetic card: random rectangles and discs, rich in corners.
pub fn textured_card(seed: u64) -> DynamicImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut card = GrayImage::from_pixel(CARD_WIDTH, CARD_HEIGHT, Luma([200]));
    for _ in 0..700 {
        let x = rng.gen_range(0..CARD_WIDTH as i32);
        let y = rng.gen_range(0..CARD_HEIGHT as i32);
        let shade = Luma([rng.gen_range(0..=255u8)]);
        if rng.gen_bool(0.8) {
            let w = rng.gen_range(5..30);
            let h = rng.gen_range(5..30);
            draw_filled_rect_mut(&mut card, Rect::at(x, y).of_size(w, h), shade);
        } else {
            draw_filled_circle_mut(&mut card, (x, y), rng.gen_range(3..12), shade);
        }
    }
    DynamicImage::ImageLuma8(card)
}

/// Rotation by `degrees`, uniform `scale`, then a shift.
pub fn similarity_transform(degrees: f64, scale: f64, tx: f64, ty: f64) -> Matrix3<f64> {
    let (s, c) = degrees.to_radians().sin_cos();
    Matrix3::new(scale * c, -scale * s, tx, scale * s, scale * c, ty, 0.0, 0.0, 1.0)
}

/// Photograph `card` through `h` (card pixels → scan pixels).
pub fn photograph(card: &DynamicImage, h: &Matrix3<f64>) -> DynamicImage {
    let rgb: RgbImage = card.to_rgb8();
    let scan = ImageProcessor::warp_to_frame(&rgb, h, CARD_WIDTH, CARD_HEIGHT).unwrap();
    DynamicImage::ImageRgb8(scan)
}

/// Eight non-overlapping strips fitting the synthetic card.
pub fn card_regions() -> RegionTable {
    RegionTable::from_entries(Field::ALL.iter().enumerate().map(|(i, field)| {
        let y1 = 20 + i as u32 * 45;
        (*field, RegionBox::new(y1, y1 + 35, 100, 500))
    }))
    .unwrap()
}
