//! HDF5 snapshot of an assembled dataset.
//!
//! A snapshot holds three datasets at the file root:
//! `patterns` (n, H, W), `indexes` (n, int64) and `bad_pixels` (H, W, bool).

use std::path::Path;

use diffpix_core::{ImageExtent, PatternDtype};
use hdf5::types::{FloatSize, H5Type, IntSize, TypeDescriptor};
use hdf5::{Dataset, File, Group};
use log::info;
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3};

use crate::compression::Compression;
use crate::{Error, Result};

pub const PATTERNS_KEY: &str = "patterns";
pub const INDEXES_KEY: &str = "indexes";
pub const BAD_PIXELS_KEY: &str = "bad_pixels";

/// Contents of a snapshot file.
#[derive(Debug, Clone)]
pub struct PatternSnapshot<T> {
    pub indexes: Vec<i64>,
    pub patterns: Array3<T>,
    pub bad_pixels: Array2<bool>,
}

/// Shape and type of a snapshot, read without loading the patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub num_patterns: usize,
    pub extent: ImageExtent,
    pub pattern_dtype: PatternDtype,
    pub num_bad_pixels: usize,
}

/// Write a snapshot to `path`, replacing any existing file.
///
/// # Errors
/// Returns an error if the shapes disagree or HDF5 I/O fails.
pub fn write_snapshot<T: H5Type, P: AsRef<Path>>(
    path: P,
    indexes: &[i64],
    patterns: ArrayView3<'_, T>,
    bad_pixels: ArrayView2<'_, bool>,
    compression: Compression,
) -> Result<()> {
    let path = path.as_ref();
    let (count, height, width) = patterns.dim();
    if indexes.len() != count {
        return Err(Error::InvalidFormat(format!(
            "{} indexes for {count} patterns",
            indexes.len()
        )));
    }
    if bad_pixels.dim() != (height, width) {
        return Err(Error::InvalidFormat(format!(
            "bad pixel map {:?} does not match pattern extent ({height}, {width})",
            bad_pixels.dim()
        )));
    }

    info!("Writing snapshot to {} ({compression})", path.display());
    let file = File::create(path)?;

    let patterns_ds = create_dataset::<T>(
        &file,
        PATTERNS_KEY,
        &[count, height, width],
        &[1, height, width],
        compression,
    )?;
    if !patterns.is_empty() {
        patterns_ds.write(patterns)?;
    }

    let indexes_ds = create_dataset::<i64>(&file, INDEXES_KEY, &[count], &[count], compression)?;
    if !indexes.is_empty() {
        indexes_ds.write(ArrayView1::from(indexes))?;
    }

    let bad_pixels_ds = create_dataset::<bool>(
        &file,
        BAD_PIXELS_KEY,
        &[height, width],
        &[height, width],
        compression,
    )?;
    if !bad_pixels.is_empty() {
        bad_pixels_ds.write(bad_pixels)?;
    }

    Ok(())
}

/// Read a snapshot from `path`.
///
/// # Errors
/// Returns an error if the file is missing, a dataset is absent or the
/// shapes disagree.
pub fn read_snapshot<T: H5Type, P: AsRef<Path>>(path: P) -> Result<PatternSnapshot<T>> {
    let path = path.as_ref();
    let file = open_existing(path)?;
    info!("Reading snapshot from {}", path.display());

    let patterns_ds = file.dataset(PATTERNS_KEY)?;
    let (count, height, width) = pattern_shape(&patterns_ds)?;
    let patterns = Array3::from_shape_vec((count, height, width), read_all::<T>(&patterns_ds)?)
        .map_err(|e| Error::InvalidFormat(format!("patterns shape mismatch: {e}")))?;

    let indexes = read_all::<i64>(&file.dataset(INDEXES_KEY)?)?;
    if indexes.len() != count {
        return Err(Error::InvalidFormat(format!(
            "{} indexes for {count} patterns",
            indexes.len()
        )));
    }

    let bad_pixels_ds = file.dataset(BAD_PIXELS_KEY)?;
    if bad_pixels_ds.shape() != [height, width] {
        return Err(Error::InvalidFormat(format!(
            "bad pixel map {:?} does not match pattern extent ({height}, {width})",
            bad_pixels_ds.shape()
        )));
    }
    let bad_pixels = Array2::from_shape_vec((height, width), read_all::<bool>(&bad_pixels_ds)?)
        .map_err(|e| Error::InvalidFormat(format!("bad pixel shape mismatch: {e}")))?;

    Ok(PatternSnapshot {
        indexes,
        patterns,
        bad_pixels,
    })
}

/// Summarise a snapshot without reading its patterns.
///
/// # Errors
/// Returns an error if the file is missing or malformed.
pub fn read_snapshot_info<P: AsRef<Path>>(path: P) -> Result<SnapshotInfo> {
    let file = open_existing(path.as_ref())?;
    let patterns_ds = file.dataset(PATTERNS_KEY)?;
    let (num_patterns, height, width) = pattern_shape(&patterns_ds)?;
    let pattern_dtype = dataset_dtype(&patterns_ds)?;
    let num_bad_pixels = read_all::<bool>(&file.dataset(BAD_PIXELS_KEY)?)?
        .into_iter()
        .filter(|&bad| bad)
        .count();

    Ok(SnapshotInfo {
        num_patterns,
        extent: ImageExtent::new(width, height),
        pattern_dtype,
        num_bad_pixels,
    })
}

/// Native element type of an HDF5 dataset.
///
/// # Errors
/// Returns an error for non-numeric element types.
pub fn dataset_dtype(dataset: &Dataset) -> Result<PatternDtype> {
    let dtype = match dataset.dtype()?.to_descriptor()? {
        TypeDescriptor::Unsigned(IntSize::U1) => PatternDtype::U8,
        TypeDescriptor::Unsigned(IntSize::U2) => PatternDtype::U16,
        TypeDescriptor::Unsigned(IntSize::U4) => PatternDtype::U32,
        TypeDescriptor::Unsigned(IntSize::U8) => PatternDtype::U64,
        TypeDescriptor::Integer(IntSize::U1) => PatternDtype::I8,
        TypeDescriptor::Integer(IntSize::U2) => PatternDtype::I16,
        TypeDescriptor::Integer(IntSize::U4) => PatternDtype::I32,
        TypeDescriptor::Integer(IntSize::U8) => PatternDtype::I64,
        TypeDescriptor::Float(FloatSize::U4) => PatternDtype::F32,
        TypeDescriptor::Float(FloatSize::U8) => PatternDtype::F64,
        other => {
            return Err(Error::InvalidFormat(format!(
                "unsupported pattern element type {other:?}"
            )))
        }
    };
    Ok(dtype)
}

pub(crate) fn open_existing(path: &Path) -> Result<File> {
    if !path.exists() {
        return Err(diffpix_core::Error::FileNotFound(path.to_path_buf()).into());
    }
    Ok(File::open(path)?)
}

pub(crate) fn read_all<T: H5Type>(dataset: &Dataset) -> Result<Vec<T>> {
    if dataset.size() == 0 {
        return Ok(Vec::new());
    }
    Ok(dataset.read_raw::<T>()?)
}

fn pattern_shape(dataset: &Dataset) -> Result<(usize, usize, usize)> {
    match dataset.shape().as_slice() {
        &[count, height, width] => Ok((count, height, width)),
        other => Err(Error::InvalidFormat(format!(
            "patterns dataset must be 3-D, got {other:?}"
        ))),
    }
}

fn create_dataset<T: H5Type>(
    group: &Group,
    name: &str,
    shape: &[usize],
    chunk: &[usize],
    compression: Compression,
) -> Result<Dataset> {
    let mut builder = group.new_dataset::<T>().shape(shape.to_vec());

    // Filters need a chunked layout, which HDF5 rejects for empty extents.
    if compression != Compression::None && shape.iter().all(|&dim| dim > 0) {
        builder = builder.chunk(chunk.to_vec());
        builder = match compression {
            Compression::Gzip(level) => builder.deflate(level),
            Compression::Lzf => builder.lzf(),
            Compression::None => builder,
        };
    }

    Ok(builder.create(name)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::NamedTempFile;

    fn sample() -> (Vec<i64>, Array3<u16>, Array2<bool>) {
        let patterns =
            Array3::from_shape_vec((3, 2, 2), (0u16..12).collect()).unwrap();
        let mut bad_pixels = Array2::from_elem((2, 2), false);
        bad_pixels[[1, 0]] = true;
        (vec![0, -1, 7], patterns, bad_pixels)
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let (indexes, patterns, bad_pixels) = sample();
        for compression in [Compression::None, Compression::Gzip(4), Compression::Lzf] {
            let file = NamedTempFile::new().unwrap();
            write_snapshot(
                file.path(),
                &indexes,
                patterns.view(),
                bad_pixels.view(),
                compression,
            )
            .unwrap();

            let snapshot = read_snapshot::<u16, _>(file.path()).unwrap();
            assert_eq!(snapshot.indexes, indexes);
            assert_eq!(snapshot.patterns, patterns);
            assert_eq!(snapshot.bad_pixels, bad_pixels);
        }
    }

    #[test]
    fn test_snapshot_info() {
        let (indexes, patterns, bad_pixels) = sample();
        let file = NamedTempFile::new().unwrap();
        write_snapshot(
            file.path(),
            &indexes,
            patterns.view(),
            bad_pixels.view(),
            Compression::None,
        )
        .unwrap();

        let info = read_snapshot_info(file.path()).unwrap();
        assert_eq!(info.num_patterns, 3);
        assert_eq!(info.extent, ImageExtent::new(2, 2));
        assert_eq!(info.pattern_dtype, PatternDtype::U16);
        assert_eq!(info.num_bad_pixels, 1);
    }

    #[test]
    fn test_empty_snapshot_with_compression() {
        let file = NamedTempFile::new().unwrap();
        let patterns = Array3::<u16>::zeros((0, 0, 0));
        let bad_pixels = Array2::from_elem((0, 0), false);
        write_snapshot(
            file.path(),
            &[],
            patterns.view(),
            bad_pixels.view(),
            Compression::Lzf,
        )
        .unwrap();
        let snapshot = read_snapshot::<u16, _>(file.path()).unwrap();
        assert!(snapshot.indexes.is_empty());
        assert_eq!(snapshot.patterns.dim(), (0, 0, 0));
    }

    #[test]
    fn test_mismatched_shapes_are_rejected() {
        let (_, patterns, bad_pixels) = sample();
        let file = NamedTempFile::new().unwrap();
        let err = write_snapshot(
            file.path(),
            &[0, 1],
            patterns.view(),
            bad_pixels.view(),
            Compression::None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_snapshot::<u16, _>(dir.path().join("absent.h5")).unwrap_err();
        assert!(matches!(
            err,
            Error::CoreError(diffpix_core::Error::FileNotFound(_))
        ));
    }
}
