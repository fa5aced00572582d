//! Input collaborator traits: raw arrays, datasets and file readers.

use std::path::Path;
use std::sync::Arc;

use ndarray::{Array2, ArrayD};

use crate::error::Result;
use crate::metadata::DiffractionMetadata;
use crate::pixel::PixelValue;

/// One acquisition chunk of raw detector frames.
///
/// Implementations may defer I/O until [`DiffractionArray::patterns`] is
/// called; a missing backing file is reported as
/// [`Error::FileNotFound`](crate::Error::FileNotFound) at that point.
pub trait DiffractionArray<T: PixelValue>: Send + Sync {
    /// Human-readable label of the array.
    fn label(&self) -> &str;

    /// Pattern indexes, one per frame.
    fn indexes(&self) -> Result<Vec<i64>>;

    /// Raw frames with shape `(n, H, W)`, or `(H, W)` for a single frame.
    fn patterns(&self) -> Result<ArrayD<T>>;
}

/// Shared handle to a raw array.
pub type SharedArray<T> = Arc<dyn DiffractionArray<T>>;

/// In-memory raw array.
#[derive(Debug, Clone)]
pub struct SimpleDiffractionArray<T> {
    label: String,
    indexes: Vec<i64>,
    patterns: ArrayD<T>,
}

impl<T: PixelValue> SimpleDiffractionArray<T> {
    /// Creates an array from its label, indexes and frames.
    #[must_use]
    pub fn new(label: impl Into<String>, indexes: Vec<i64>, patterns: ArrayD<T>) -> Self {
        Self {
            label: label.into(),
            indexes,
            patterns,
        }
    }
}

impl<T: PixelValue> DiffractionArray<T> for SimpleDiffractionArray<T> {
    fn label(&self) -> &str {
        &self.label
    }

    fn indexes(&self) -> Result<Vec<i64>> {
        Ok(self.indexes.clone())
    }

    fn patterns(&self) -> Result<ArrayD<T>> {
        Ok(self.patterns.clone())
    }
}

/// A dataset as produced by a file reader: metadata plus raw arrays.
pub trait DiffractionDataset<T: PixelValue> {
    /// Dataset metadata.
    fn metadata(&self) -> &DiffractionMetadata;

    /// Raw arrays in submission order.
    fn arrays(&self) -> &[SharedArray<T>];

    /// Bad pixel map shipped with the dataset, if any.
    fn bad_pixels(&self) -> Option<&Array2<bool>>;
}

/// Dataset backed by a list of shared arrays.
pub struct SimpleDiffractionDataset<T: PixelValue> {
    metadata: DiffractionMetadata,
    arrays: Vec<SharedArray<T>>,
    bad_pixels: Option<Array2<bool>>,
}

impl<T: PixelValue> SimpleDiffractionDataset<T> {
    /// Creates a dataset from metadata and arrays.
    #[must_use]
    pub fn new(metadata: DiffractionMetadata, arrays: Vec<SharedArray<T>>) -> Self {
        Self {
            metadata,
            arrays,
            bad_pixels: None,
        }
    }

    /// Empty dataset.
    #[must_use]
    pub fn create_null() -> Self {
        Self::new(DiffractionMetadata::create_null(), Vec::new())
    }

    /// Attach a bad pixel map.
    #[must_use]
    pub fn with_bad_pixels(mut self, bad_pixels: Array2<bool>) -> Self {
        self.bad_pixels = Some(bad_pixels);
        self
    }
}

impl<T: PixelValue> DiffractionDataset<T> for SimpleDiffractionDataset<T> {
    fn metadata(&self) -> &DiffractionMetadata {
        &self.metadata
    }

    fn arrays(&self) -> &[SharedArray<T>] {
        &self.arrays
    }

    fn bad_pixels(&self) -> Option<&Array2<bool>> {
        self.bad_pixels.as_ref()
    }
}

/// Format plugin that reads a dataset from a file.
pub trait DiffractionFileReader<T: PixelValue> {
    /// Reader-specific error.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reads metadata and the raw array list of `file_path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or is malformed.
    fn read(
        &self,
        file_path: &Path,
    ) -> std::result::Result<SimpleDiffractionDataset<T>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_simple_array_returns_its_contents() {
        let patterns = Array3::<u16>::from_elem((2, 3, 4), 7).into_dyn();
        let array = SimpleDiffractionArray::new("scan", vec![10, 11], patterns);

        assert_eq!(array.label(), "scan");
        assert_eq!(array.indexes().unwrap(), vec![10, 11]);
        assert_eq!(array.patterns().unwrap().shape(), &[2, 3, 4]);
    }
}
