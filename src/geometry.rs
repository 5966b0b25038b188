//! Frame dimensions and geometry utilities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Detector frame dimensions.
///
/// Represents the width and height of a detector frame or calibration map.
/// Uses usize for direct compatibility with ndarray indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    /// Frame width in pixels (readout channels)
    pub width: usize,
    /// Frame height in pixels (readout lines)
    pub height: usize,
}

impl FrameShape {
    /// Create a new FrameShape
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Get total number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Convert to tuple (width, height)
    pub fn to_tuple(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// ndarray dimension tuple (rows, cols)
    pub fn to_dim(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Check if a pixel coordinate is within bounds
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height
    }

    /// Width of one ADC readout segment when the frame is read out through
    /// `number_of_adcs` converters.
    pub fn adc_channels(&self, number_of_adcs: usize) -> usize {
        self.width / number_of_adcs
    }
}

impl From<(usize, usize)> for FrameShape {
    fn from(dimensions: (usize, usize)) -> Self {
        Self::new(dimensions.0, dimensions.1)
    }
}

impl From<FrameShape> for (usize, usize) {
    fn from(shape: FrameShape) -> Self {
        shape.to_tuple()
    }
}

impl Default for FrameShape {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
