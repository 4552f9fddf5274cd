use std::collections::BTreeMap;
use std::path::Path;

use image::{DynamicImage, GenericImageView};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::models::Field;
use crate::utils::IdError;

/// Pixel rectangle on the canonical card, half-open: rows `y1..y2`,
/// columns `x1..x2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBox {
    pub y1: u32,
    pub y2: u32,
    pub x1: u32,
    pub x2: u32,
}

impl RegionBox {
    pub const fn new(y1: u32, y2: u32, x1: u32, x2: u32) -> Self {
        RegionBox { y1, y2, x1, x2 }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2 && self.x2 <= width && self.y2 <= height
    }
}

// Coordinates are tuned together with the validator's geometry limits;
// moving one without the other shifts every crop.
const INE_REGIONS: [(Field, RegionBox); 8] = [
    (Field::ApellidoPaterno, RegionBox::new(337, 397, 594, 1410)),
    (Field::ApellidoMaterno, RegionBox::new(397, 457, 594, 1410)),
    (Field::Nombre, RegionBox::new(457, 517, 594, 1410)),
    (Field::Domicilio, RegionBox::new(576, 755, 591, 1620)),
    (Field::ClaveElector, RegionBox::new(765, 834, 945, 1564)),
    (Field::Curp, RegionBox::new(838, 901, 707, 1303)),
    (Field::FechaNacimiento, RegionBox::new(330, 400, 1490, 1893)),
    (Field::Sexo, RegionBox::new(394, 462, 1775, 1870)),
];

lazy_static! {
    static ref INE_TABLE: RegionTable = RegionTable {
        regions: INE_REGIONS.iter().copied().collect(),
    };
}

/// Field → rectangle mapping. Always holds exactly the eight fields and has
/// no mutators once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RegionTable {
    regions: BTreeMap<Field, RegionBox>,
}

impl RegionTable {
    /// Layout of the current INE card at reference resolution.
    pub fn ine() -> &'static RegionTable {
        &INE_TABLE
    }

    pub fn from_entries<I>(entries: I) -> Result<Self, IdError>
    where
        I: IntoIterator<Item = (Field, RegionBox)>,
    {
        let regions: BTreeMap<Field, RegionBox> = entries.into_iter().collect();
        if let Some(missing) = Field::ALL.iter().find(|f| !regions.contains_key(f)) {
            return Err(IdError::Config(format!(
                "region table is missing field {}",
                missing
            )));
        }
        Ok(RegionTable { regions })
    }

    pub fn get(&self, field: Field) -> RegionBox {
        // Construction guarantees every field is present.
        self.regions[&field]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Field, RegionBox)> + '_ {
        self.regions.iter().map(|(f, b)| (*f, *b))
    }

    pub fn check_bounds(&self, width: u32, height: u32) -> Result<(), IdError> {
        for (field, region) in self.iter() {
            if !region.fits_within(width, height) {
                return Err(IdError::RegionOutOfBounds {
                    field,
                    y1: region.y1,
                    y2: region.y2,
                    x1: region.x1,
                    x2: region.x2,
                    width,
                    height,
                });
            }
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for RegionTable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let regions = BTreeMap::<Field, RegionBox>::deserialize(deserializer)?;
        RegionTable::from_entries(regions).map_err(serde::de::Error::custom)
    }
}

/// Reference card image plus its region table.
#[derive(Debug, Clone)]
pub struct CanonicalTemplate {
    image: DynamicImage,
    regions: RegionTable,
}

impl CanonicalTemplate {
    pub fn new(image: DynamicImage, regions: RegionTable) -> Result<Self, IdError> {
        let (width, height) = image.dimensions();
        regions.check_bounds(width, height)?;
        Ok(CanonicalTemplate { image, regions })
    }

    /// Load the reference image and pair it with the default INE layout.
    pub fn load(path: &Path) -> Result<Self, IdError> {
        let image = image::open(path).map_err(|e| {
            IdError::ImageProcessing(format!("Failed to open template {:?}: {}", path, e))
        })?;
        Self::new(image, RegionTable::ine().clone())
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ine_table_covers_every_field() {
        let table = RegionTable::ine();
        assert_eq!(table.iter().count(), 8);
        assert_eq!(table.get(Field::Sexo), RegionBox::new(394, 462, 1775, 1870));
    }

    #[test]
    fn incomplete_table_is_rejected() {
        let entries = INE_REGIONS.iter().copied().skip(1);
        assert!(matches!(
            RegionTable::from_entries(entries),
            Err(IdError::Config(_))
        ));
    }

    #[test]
    fn template_must_contain_all_regions() {
        let small = DynamicImage::new_luma8(1000, 600);
        let err = CanonicalTemplate::new(small, RegionTable::ine().clone()).unwrap_err();
        assert!(matches!(err, IdError::RegionOutOfBounds { .. }));

        let full = DynamicImage::new_luma8(1900, 910);
        assert!(CanonicalTemplate::new(full, RegionTable::ine().clone()).is_ok());
    }

    #[test]
    fn table_deserialises_and_validates() {
        let json = serde_json::to_string(RegionTable::ine()).unwrap();
        let back: RegionTable = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, RegionTable::ine());

        let partial = r#"{"sexo": {"y1": 0, "y2": 1, "x1": 0, "x2": 1}}"#;
        assert!(serde_json::from_str::<RegionTable>(partial).is_err());
    }
}
