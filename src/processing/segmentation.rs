use std::collections::BTreeMap;

use image::{imageops, RgbImage};

use crate::models::{Field, RegionTable};
use crate::utils::IdError;

/// Slice one crop per field out of a registered image. Crops are copied
/// pixel for pixel; nothing is resampled.
pub fn segment(
    aligned: &RgbImage,
    regions: &RegionTable,
) -> Result<BTreeMap<Field, RgbImage>, IdError> {
    let (width, height) = aligned.dimensions();
    regions.check_bounds(width, height)?;

    Ok(regions
        .iter()
        .map(|(field, region)| {
            let (x, y, w, h) = (region.x1, region.y1, region.width(), region.height());
            (field, imageops::crop_imm(aligned, x, y, w, h).to_image())
        })
        .collect())
}
