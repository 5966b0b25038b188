//! Bad pixel map for detector defect bookkeeping.
//!
//! Each pixel carries one flag byte describing why it was excluded from
//! signal analysis, or `Good` when it was not. Automatic classification
//! assigns the noise/empty/cold/saturated/channel flags from calibration
//! statistics; `User` flags are set by an operator and are sticky: no
//! automatic pass ever overwrites or clears them.

use crate::geometry::FrameShape;
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

/// Classification of a single pixel.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BadPixelFlag {
    /// Usable pixel
    Good = 0,
    /// Noise sigma above the allowed maximum
    Noise = 1,
    /// Too few accepted values across the calibration frame set
    Empty = 2,
    /// Whole readout channel rejected
    Chan = 3,
    /// Noise sigma below the allowed minimum (dead/cold)
    Cold = 4,
    /// Mean value above the saturation cut
    Satur = 5,
    /// Flagged by the operator; survives recalibration
    User = 6,
}

impl BadPixelFlag {
    /// Parse a flag from its stored byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Good),
            1 => Some(Self::Noise),
            2 => Some(Self::Empty),
            3 => Some(Self::Chan),
            4 => Some(Self::Cold),
            5 => Some(Self::Satur),
            6 => Some(Self::User),
            _ => None,
        }
    }

    /// True for any flag other than `Good`.
    pub fn is_bad(&self) -> bool {
        !matches!(self, Self::Good)
    }
}

/// Per-pixel flag map for one detector geometry.
#[derive(Debug, Clone, Default)]
pub struct BadPixelMap {
    shape: FrameShape,
    flags: Vec<BadPixelFlag>,
}

impl BadPixelMap {
    /// Create an all-good map for the given geometry.
    pub fn new(shape: FrameShape) -> Self {
        Self {
            shape,
            flags: vec![BadPixelFlag::Good; shape.pixel_count()],
        }
    }

    /// Create a map from existing flags; the flag count must match the
    /// geometry.
    pub fn from_flags(shape: FrameShape, flags: Vec<BadPixelFlag>) -> Option<Self> {
        if flags.len() != shape.pixel_count() {
            return None;
        }
        Some(Self { shape, flags })
    }

    /// Resize for a new geometry. A changed geometry discards everything; an
    /// unchanged one clears all flags except the sticky `User` entries.
    pub fn reset(&mut self, shape: FrameShape) {
        if shape.pixel_count() != self.flags.len() {
            self.flags = vec![BadPixelFlag::Good; shape.pixel_count()];
            self.shape = shape;
        } else {
            self.shape = shape;
            for flag in &mut self.flags {
                if *flag != BadPixelFlag::User {
                    *flag = BadPixelFlag::Good;
                }
            }
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn flags(&self) -> &[BadPixelFlag] {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut [BadPixelFlag] {
        &mut self.flags
    }

    /// Flag of the pixel at (x, y).
    pub fn flag_at(&self, x: usize, y: usize) -> BadPixelFlag {
        self.flags[y * self.shape.width + x]
    }

    /// Mark a pixel with an operator flag. User flags survive recalibration
    /// until [`clear_user_flags`](Self::clear_user_flags) is called.
    pub fn set_user_flag(&mut self, x: usize, y: usize) {
        self.flags[y * self.shape.width + x] = BadPixelFlag::User;
    }

    /// Explicitly clear all operator flags.
    pub fn clear_user_flags(&mut self) {
        for flag in &mut self.flags {
            if *flag == BadPixelFlag::User {
                *flag = BadPixelFlag::Good;
            }
        }
    }

    /// Total number of flagged pixels.
    pub fn num_bad_pixels(&self) -> usize {
        self.flags.iter().filter(|f| f.is_bad()).count()
    }

    /// Number of pixels carrying the given flag.
    pub fn count_of(&self, flag: BadPixelFlag) -> usize {
        self.flags.iter().filter(|&&f| f == flag).count()
    }

    /// Raw byte representation of the flag map, as stored on disk.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.flags.iter().map(|&f| f as u8).collect()
    }

    /// Rebuild a map from stored bytes; fails on an unknown flag value or a
    /// size mismatch.
    pub fn from_bytes(shape: FrameShape, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != shape.pixel_count() {
            return None;
        }
        let flags = bytes
            .iter()
            .map(|&b| BadPixelFlag::from_byte(b))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { shape, flags })
    }

    /// Render the map as an RGB image with one color per defect class.
    ///
    /// Good pixels are black; the defect classes get distinct colors so a
    /// quick look at the image shows where and why a sensor region died.
    pub fn to_image(&self) -> RgbImage {
        let mut img = RgbImage::new(self.shape.width as u32, self.shape.height as u32);
        for y in 0..self.shape.height {
            for x in 0..self.shape.width {
                let color = match self.flag_at(x, y) {
                    BadPixelFlag::Good => Rgb([0, 0, 0]),
                    BadPixelFlag::Noise => Rgb([255, 0, 0]),
                    BadPixelFlag::Empty => Rgb([0, 0, 255]),
                    BadPixelFlag::Chan => Rgb([255, 255, 0]),
                    BadPixelFlag::Cold => Rgb([0, 255, 255]),
                    BadPixelFlag::Satur => Rgb([255, 128, 0]),
                    BadPixelFlag::User => Rgb([255, 0, 255]),
                };
                img.put_pixel(x as u32, y as u32, color);
            }
        }
        img
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_byte_roundtrip() {
        for byte in 0u8..=6 {
            let flag = BadPixelFlag::from_byte(byte).unwrap();
            assert_eq!(flag as u8, byte);
        }
        assert!(BadPixelFlag::from_byte(7).is_none());
    }

    #[test]
    fn test_new_map_is_all_good() {
        let map = BadPixelMap::new(FrameShape::new(8, 4));
        assert_eq!(map.num_bad_pixels(), 0);
        assert_eq!(map.flags().len(), 32);
    }

    #[test]
    fn test_reset_preserves_user_flags() {
        let shape = FrameShape::new(4, 4);
        let mut map = BadPixelMap::new(shape);
        map.set_user_flag(1, 1);
        map.flags_mut()[0] = BadPixelFlag::Noise;

        map.reset(shape);
        assert_eq!(map.flag_at(0, 0), BadPixelFlag::Good);
        assert_eq!(map.flag_at(1, 1), BadPixelFlag::User);
    }

    #[test]
    fn test_reset_with_new_geometry_discards_user_flags() {
        let mut map = BadPixelMap::new(FrameShape::new(4, 4));
        map.set_user_flag(1, 1);

        map.reset(FrameShape::new(8, 8));
        assert_eq!(map.num_bad_pixels(), 0);
        assert_eq!(map.shape(), FrameShape::new(8, 8));
    }

    #[test]
    fn test_clear_user_flags() {
        let mut map = BadPixelMap::new(FrameShape::new(4, 4));
        map.set_user_flag(2, 3);
        assert_eq!(map.num_bad_pixels(), 1);
        map.clear_user_flags();
        assert_eq!(map.num_bad_pixels(), 0);
    }

    #[test]
    fn test_byte_roundtrip() {
        let shape = FrameShape::new(4, 2);
        let mut map = BadPixelMap::new(shape);
        map.flags_mut()[3] = BadPixelFlag::Satur;
        map.set_user_flag(0, 1);

        let bytes = map.to_bytes();
        let recovered = BadPixelMap::from_bytes(shape, &bytes).unwrap();
        assert_eq!(recovered.flags(), map.flags());
    }

    #[test]
    fn test_from_bytes_rejects_unknown_flag() {
        let shape = FrameShape::new(2, 1);
        assert!(BadPixelMap::from_bytes(shape, &[0, 200]).is_none());
    }

    #[test]
    fn test_count_of() {
        let mut map = BadPixelMap::new(FrameShape::new(4, 1));
        map.flags_mut()[0] = BadPixelFlag::Cold;
        map.flags_mut()[1] = BadPixelFlag::Cold;
        map.flags_mut()[2] = BadPixelFlag::Noise;
        assert_eq!(map.count_of(BadPixelFlag::Cold), 2);
        assert_eq!(map.count_of(BadPixelFlag::Noise), 1);
        assert_eq!(map.count_of(BadPixelFlag::Satur), 0);
    }

    #[test]
    fn test_to_image_marks_defects() {
        let mut map = BadPixelMap::new(FrameShape::new(3, 3));
        map.flags_mut()[4] = BadPixelFlag::Noise;
        let img = map.to_image();
        assert_eq!(img.dimensions(), (3, 3));
        assert_eq!(*img.get_pixel(1, 1), Rgb([255, 0, 0]));
        assert_eq!(*img.get_pixel(0, 0), Rgb([0, 0, 0]));
    }
}
