//! Detector image geometry.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Width and height of a detector image in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageExtent {
    /// Number of columns.
    pub width_px: usize,
    /// Number of rows.
    pub height_px: usize,
}

impl ImageExtent {
    /// Creates a new extent.
    #[must_use]
    pub fn new(width_px: usize, height_px: usize) -> Self {
        Self {
            width_px,
            height_px,
        }
    }

    /// Array shape in row-major order, `(height, width)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.height_px, self.width_px)
    }

    /// Builds an extent from a row-major `(height, width)` shape.
    #[must_use]
    pub fn from_shape((height_px, width_px): (usize, usize)) -> Self {
        Self {
            width_px,
            height_px,
        }
    }

    /// Number of pixels in the image.
    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.width_px * self.height_px
    }

    /// Returns true when either dimension is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_pixels() == 0
    }
}

impl fmt::Display for ImageExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}W x {}H", self.width_px, self.height_px)
    }
}

/// Crop window center in detector pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CropCenter {
    /// Column of the window center.
    pub position_x_px: usize,
    /// Row of the window center.
    pub position_y_px: usize,
}

impl CropCenter {
    /// Creates a new crop center.
    #[must_use]
    pub fn new(position_x_px: usize, position_y_px: usize) -> Self {
        Self {
            position_x_px,
            position_y_px,
        }
    }
}
