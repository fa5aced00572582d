//! Dataset-level metadata.

use std::ops::Range;
use std::path::PathBuf;

use crate::geometry::ImageExtent;
use crate::pixel::PatternDtype;

/// Immutable description of a diffraction dataset, created once per reload.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffractionMetadata {
    /// Number of patterns in each input array, in submission order.
    pub num_patterns_per_array: Vec<usize>,
    /// Native element type of the raw patterns.
    pub pattern_dtype: PatternDtype,
    /// Raw detector extent, when the reader knows it.
    pub detector_extent: Option<ImageExtent>,
    /// File the dataset was read from.
    pub file_path: Option<PathBuf>,
}

impl DiffractionMetadata {
    /// Creates metadata for the given per-array pattern counts.
    #[must_use]
    pub fn new(num_patterns_per_array: Vec<usize>, pattern_dtype: PatternDtype) -> Self {
        Self {
            num_patterns_per_array,
            pattern_dtype,
            detector_extent: None,
            file_path: None,
        }
    }

    /// Metadata of the empty dataset.
    #[must_use]
    pub fn create_null() -> Self {
        Self::new(Vec::new(), PatternDtype::U8)
    }

    /// Set the raw detector extent.
    #[must_use]
    pub fn with_detector_extent(mut self, extent: ImageExtent) -> Self {
        self.detector_extent = Some(extent);
        self
    }

    /// Set the source file path.
    #[must_use]
    pub fn with_file_path(mut self, file_path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    /// Number of input arrays.
    #[must_use]
    pub fn num_arrays(&self) -> usize {
        self.num_patterns_per_array.len()
    }

    /// Total number of patterns across all arrays.
    #[must_use]
    pub fn total_patterns(&self) -> usize {
        self.num_patterns_per_array.iter().sum()
    }

    /// Exclusive pattern range of every array within the assembled buffer.
    ///
    /// Ranges are cumulative over `num_patterns_per_array`, so they are
    /// disjoint and cover `0..total_patterns()` in submission order.
    /// Zero-length arrays get an empty range.
    #[must_use]
    pub fn array_ranges(&self) -> Vec<Range<usize>> {
        let mut offset = 0usize;
        self.num_patterns_per_array
            .iter()
            .map(|&count| {
                let range = offset..offset + count;
                offset += count;
                range
            })
            .collect()
    }

    /// Label derived from the source file stem.
    #[must_use]
    pub fn label(&self) -> String {
        self.file_path
            .as_ref()
            .and_then(|path| path.file_stem())
            .map_or_else(|| "None".to_string(), |stem| stem.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
        a.start < b.end && b.start < a.end
    }

    #[test]
    fn test_array_ranges_are_disjoint() {
        let distributions: [&[usize]; 5] = [
            &[3, 2],
            &[0, 0, 0],
            &[5, 0, 1, 0, 7],
            &[1],
            &[],
        ];

        for counts in distributions {
            let metadata = DiffractionMetadata::new(counts.to_vec(), PatternDtype::U16);
            let ranges = metadata.array_ranges();
            assert_eq!(ranges.len(), counts.len());

            for (i, a) in ranges.iter().enumerate() {
                assert_eq!(a.len(), counts[i]);
                for b in ranges.iter().skip(i + 1) {
                    assert!(!overlaps(a, b), "{a:?} overlaps {b:?}");
                }
            }

            let end = ranges.last().map_or(0, |r| r.end);
            assert_eq!(end, metadata.total_patterns());
        }
    }

    #[test]
    fn test_array_ranges_are_cumulative() {
        let metadata = DiffractionMetadata::new(vec![3, 2], PatternDtype::U8);
        assert_eq!(metadata.array_ranges(), vec![0..3, 3..5]);
    }

    #[test]
    fn test_label_from_file_stem() {
        let metadata = DiffractionMetadata::create_null();
        assert_eq!(metadata.label(), "None");
        let metadata = metadata.with_file_path("/data/scan_0042.h5");
        assert_eq!(metadata.label(), "scan_0042");
    }
}
