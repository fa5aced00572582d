//! Error types for diffpix-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::geometry::ImageExtent;

/// Result type alias for diffpix operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for diffpix operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Pattern batch rank is neither 2 nor 3.
    #[error("invalid diffraction pattern dimensions: shape={shape:?}")]
    InvalidShape { shape: Vec<usize> },

    /// Image extent is not divisible by the bin factors.
    #[error("invalid binning: {width}W x {height}H is not divisible by {bin_x}x{bin_y}")]
    InvalidBinning {
        width: usize,
        height: usize,
        bin_x: usize,
        bin_y: usize,
    },

    /// The file backing a raw array is missing.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A load was attempted before any bad pixel map was available.
    #[error("no bad pixel map available")]
    MissingBadPixelMap,

    /// Two extents that must agree do not.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        expected: ImageExtent,
        actual: ImageExtent,
    },

    /// A raw array could not be read.
    #[error("read error: {0}")]
    ReadError(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
