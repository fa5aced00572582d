//! diffpix-core: Core types and traits for diffraction pattern assembly.
//!
//! This crate provides the value types shared by the workspace, the
//! collaborator traits through which raw arrays and bad pixel maps are
//! consumed, and the stateless pattern processor.
//!

pub mod array;
pub mod bad_pixels;
pub mod error;
pub mod geometry;
pub mod metadata;
pub mod pixel;
pub mod processor;

pub use array::{
    DiffractionArray, DiffractionDataset, DiffractionFileReader, SharedArray,
    SimpleDiffractionArray, SimpleDiffractionDataset,
};
pub use bad_pixels::{count_bad_pixels, BadPixelProvider, BadPixelStore};
pub use error::{Error, Result};
pub use geometry::{CropCenter, ImageExtent};
pub use metadata::DiffractionMetadata;
pub use pixel::{PatternDtype, PixelValue};
pub use processor::{Binning, CropWindow, FilterBounds, Padding, PatternProcessor, ProcessorConfig};
