//! HDF5 diffraction file reader.
//!
//! Each file contributes one raw array: the pattern stack at a configurable
//! dataset path. Only shapes and indexes are read up front; patterns are read
//! when the array is loaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use diffpix_core::{
    DiffractionArray, DiffractionFileReader, DiffractionMetadata, ImageExtent, PixelValue,
    SharedArray, SimpleDiffractionDataset,
};
use hdf5::types::H5Type;
use hdf5::{Dataset, File};
use log::debug;
use ndarray::{ArrayD, IxDyn};

use crate::snapshot::{dataset_dtype, open_existing, read_all};
use crate::{Error, Result};

/// Pattern dataset path used by most beamline files.
pub const DEFAULT_DATA_PATH: &str = "/entry/data/data";

/// Raw array backed by one dataset in an HDF5 file.
#[derive(Debug, Clone)]
pub struct Hdf5DiffractionArray {
    label: String,
    indexes: Vec<i64>,
    file_path: PathBuf,
    data_path: String,
}

impl Hdf5DiffractionArray {
    /// File holding the patterns.
    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn read_patterns<T: PixelValue + H5Type>(&self) -> Result<ArrayD<T>> {
        let file = open_existing(&self.file_path)?;
        let dataset = file.dataset(&self.data_path)?;
        let shape = dataset.shape();
        debug!(
            "Reading \"{}\" {shape:?} from {}",
            self.data_path,
            self.file_path.display()
        );
        let data = read_all::<T>(&dataset)?;
        ArrayD::from_shape_vec(IxDyn(&shape), data)
            .map_err(|e| Error::InvalidFormat(format!("pattern shape mismatch: {e}")))
    }
}

impl<T: PixelValue + H5Type> DiffractionArray<T> for Hdf5DiffractionArray {
    fn label(&self) -> &str {
        &self.label
    }

    fn indexes(&self) -> diffpix_core::Result<Vec<i64>> {
        Ok(self.indexes.clone())
    }

    fn patterns(&self) -> diffpix_core::Result<ArrayD<T>> {
        self.read_patterns().map_err(|e| match e {
            Error::CoreError(core) => core,
            other => diffpix_core::Error::ReadError(other.to_string()),
        })
    }
}

/// Reads diffraction arrays from HDF5 files.
#[derive(Debug, Clone)]
pub struct Hdf5DiffractionReader {
    data_path: String,
    indexes_path: Option<String>,
}

impl Default for Hdf5DiffractionReader {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_PATH)
    }
}

impl Hdf5DiffractionReader {
    /// Reader for patterns stored at `data_path`.
    #[must_use]
    pub fn new(data_path: impl Into<String>) -> Self {
        Self {
            data_path: data_path.into(),
            indexes_path: None,
        }
    }

    /// Read pattern indexes from `indexes_path` instead of numbering them.
    #[must_use]
    pub fn with_indexes_path(mut self, indexes_path: impl Into<String>) -> Self {
        self.indexes_path = Some(indexes_path.into());
        self
    }

    /// Build one dataset from several files, one array per file.
    ///
    /// Without an indexes dataset, patterns are numbered consecutively across
    /// files in the given order.
    ///
    /// # Errors
    /// Returns an error if a file is missing, a pattern dataset is not 2-D or
    /// 3-D, or the files disagree on detector extent.
    pub fn read_files<T, P>(&self, paths: &[P]) -> Result<SimpleDiffractionDataset<T>>
    where
        T: PixelValue + H5Type,
        P: AsRef<Path>,
    {
        let mut arrays: Vec<SharedArray<T>> = Vec::with_capacity(paths.len());
        let mut num_patterns_per_array = Vec::with_capacity(paths.len());
        let mut detector_extent: Option<ImageExtent> = None;
        let mut next_index = 0i64;

        for path in paths {
            let path = path.as_ref();
            let file = open_existing(path)?;
            let dataset = file.dataset(&self.data_path)?;
            let (count, extent) = stack_shape(&dataset)?;
            debug!(
                "{}: {count} x {extent} {}",
                path.display(),
                dataset_dtype(&dataset)?
            );

            match detector_extent {
                Some(expected) if expected != extent => {
                    return Err(diffpix_core::Error::ShapeMismatch {
                        expected,
                        actual: extent,
                    }
                    .into());
                }
                _ => detector_extent = Some(extent),
            }

            let indexes = self.read_indexes(&file, count, next_index)?;
            next_index = indexes.iter().max().map_or(next_index, |&max| max + 1);

            let label = path
                .file_stem()
                .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned());

            arrays.push(Arc::new(Hdf5DiffractionArray {
                label,
                indexes,
                file_path: path.to_path_buf(),
                data_path: self.data_path.clone(),
            }));
            num_patterns_per_array.push(count);
        }

        let mut metadata = DiffractionMetadata::new(num_patterns_per_array, T::DTYPE);
        if let Some(extent) = detector_extent {
            metadata = metadata.with_detector_extent(extent);
        }
        if let Some(first) = paths.first() {
            metadata = metadata.with_file_path(first.as_ref());
        }

        Ok(SimpleDiffractionDataset::new(metadata, arrays))
    }

    fn read_indexes(&self, file: &File, count: usize, first_index: i64) -> Result<Vec<i64>> {
        let Some(indexes_path) = &self.indexes_path else {
            return Ok((first_index..).take(count).collect());
        };
        let indexes = read_all::<i64>(&file.dataset(indexes_path)?)?;
        if indexes.len() != count {
            return Err(Error::InvalidFormat(format!(
                "{} indexes for {count} patterns",
                indexes.len()
            )));
        }
        Ok(indexes)
    }
}

impl<T: PixelValue + H5Type> DiffractionFileReader<T> for Hdf5DiffractionReader {
    type Error = Error;

    fn read(&self, file_path: &Path) -> Result<SimpleDiffractionDataset<T>> {
        self.read_files(&[file_path])
    }
}

fn stack_shape(dataset: &Dataset) -> Result<(usize, ImageExtent)> {
    match dataset.shape().as_slice() {
        &[height, width] => Ok((1, ImageExtent::new(width, height))),
        &[count, height, width] => Ok((count, ImageExtent::new(width, height))),
        other => Err(diffpix_core::Error::InvalidShape {
            shape: other.to_vec(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffpix_core::DiffractionDataset;
    use ndarray::Array3;
    use tempfile::TempDir;

    fn write_stack(dir: &Path, name: &str, patterns: &Array3<u16>) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let group = file.create_group("entry").unwrap();
        let data = group.create_group("data").unwrap();
        data.new_dataset_builder()
            .with_data(patterns)
            .create("data")
            .unwrap();
        path
    }

    #[test]
    fn test_read_files_builds_metadata() {
        let dir = TempDir::new().unwrap();
        let a = write_stack(dir.path(), "scan_a.h5", &Array3::from_elem((3, 4, 5), 1));
        let b = write_stack(dir.path(), "scan_b.h5", &Array3::from_elem((2, 4, 5), 2));

        let dataset = Hdf5DiffractionReader::default()
            .read_files::<u16, _>(&[a, b])
            .unwrap();
        let metadata = dataset.metadata();
        assert_eq!(metadata.num_patterns_per_array, vec![3, 2]);
        assert_eq!(metadata.detector_extent, Some(ImageExtent::new(5, 4)));
        assert_eq!(metadata.label(), "scan_a");

        let arrays = dataset.arrays();
        assert_eq!(arrays[0].label(), "scan_a");
        assert_eq!(arrays[1].indexes().unwrap(), vec![3, 4]);
        let patterns = arrays[1].patterns().unwrap();
        assert_eq!(patterns.shape(), &[2, 4, 5]);
        assert!(patterns.iter().all(|&v| v == 2));
    }

    #[test]
    fn test_missing_file_surfaces_at_load() {
        let dir = TempDir::new().unwrap();
        let path = write_stack(dir.path(), "gone.h5", &Array3::zeros((1, 2, 2)));
        let dataset = Hdf5DiffractionReader::default()
            .read_files::<u16, _>(&[&path])
            .unwrap();

        std::fs::remove_file(&path).unwrap();
        let err = dataset.arrays()[0].patterns().unwrap_err();
        assert!(matches!(err, diffpix_core::Error::FileNotFound(_)));
    }

    #[test]
    fn test_mismatched_extents_are_rejected() {
        let dir = TempDir::new().unwrap();
        let a = write_stack(dir.path(), "a.h5", &Array3::zeros((1, 2, 2)));
        let b = write_stack(dir.path(), "b.h5", &Array3::zeros((1, 3, 2)));
        let err = Hdf5DiffractionReader::default()
            .read_files::<u16, _>(&[a, b])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CoreError(diffpix_core::Error::ShapeMismatch { .. })
        ));
    }
}
