//! Per-pattern processing pipeline.
//!
//! Steps run in a fixed order, each only when configured:
//! 1. intensity filter (patterns only)
//! 2. crop
//! 3. binning (sum for patterns, logical AND for the bad pixel mask)
//! 4. padding
//! 5. horizontal flip
//! 6. vertical flip
//! 7. transpose
//!
//! The processor is a pure value: it holds no shared state and may be used
//! from any number of threads at once.

use std::ops::Range;

use ndarray::{s, Array2, Array3, ArrayD, ArrayView2, Axis, Ix3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::{CropCenter, ImageExtent};
use crate::pixel::PixelValue;

/// Crop window: `extent` pixels centred on `center`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CropWindow {
    pub center: CropCenter,
    pub extent: ImageExtent,
}

/// Intensity bounds; values `< lower` or `>= upper` are zeroed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilterBounds {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl FilterBounds {
    #[inline]
    fn rejects(&self, value: f64) -> bool {
        self.lower.is_some_and(|lower| value < lower)
            || self.upper.is_some_and(|upper| value >= upper)
    }
}

/// Non-overlapping `bin_x` x `bin_y` block reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Binning {
    pub bin_x: usize,
    pub bin_y: usize,
}

/// Zero border of `pad_x` columns and `pad_y` rows on each side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Padding {
    pub pad_x: usize,
    pub pad_y: usize,
}

/// Processing configuration applied identically to every array of a dataset.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[allow(clippy::struct_excessive_bools)]
pub struct ProcessorConfig {
    pub crop: Option<CropWindow>,
    pub filter: Option<FilterBounds>,
    pub binning: Option<Binning>,
    pub padding: Option<Padding>,
    pub hflip: bool,
    pub vflip: bool,
    pub transpose: bool,
}

impl ProcessorConfig {
    /// Crop to `extent` pixels around `center`.
    #[must_use]
    pub fn with_crop(mut self, center: CropCenter, extent: ImageExtent) -> Self {
        self.crop = Some(CropWindow { center, extent });
        self
    }

    /// Zero values outside `[lower, upper)`.
    #[must_use]
    pub fn with_filter(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.filter = Some(FilterBounds { lower, upper });
        self
    }

    /// Sum `bin_x` x `bin_y` blocks.
    ///
    /// Values less than 1 are clamped to 1. Use [`Self::try_with_binning`]
    /// to surface invalid values as an error instead.
    #[must_use]
    pub fn with_binning(mut self, bin_x: usize, bin_y: usize) -> Self {
        self.binning = Some(Binning {
            bin_x: bin_x.max(1),
            bin_y: bin_y.max(1),
        });
        self
    }

    /// Fallible variant of [`Self::with_binning`].
    ///
    /// # Errors
    /// Returns an error if either bin factor is 0.
    pub fn try_with_binning(mut self, bin_x: usize, bin_y: usize) -> Result<Self> {
        if bin_x == 0 || bin_y == 0 {
            return Err(Error::InvalidConfig(
                "bin factors must be at least 1".to_string(),
            ));
        }
        self.binning = Some(Binning { bin_x, bin_y });
        Ok(self)
    }

    /// Pad with a zero border.
    #[must_use]
    pub fn with_padding(mut self, pad_x: usize, pad_y: usize) -> Self {
        self.padding = Some(Padding { pad_x, pad_y });
        self
    }

    /// Mirror left-right.
    #[must_use]
    pub fn with_hflip(mut self, enabled: bool) -> Self {
        self.hflip = enabled;
        self
    }

    /// Mirror top-bottom.
    #[must_use]
    pub fn with_vflip(mut self, enabled: bool) -> Self {
        self.vflip = enabled;
        self
    }

    /// Swap rows and columns.
    #[must_use]
    pub fn with_transpose(mut self, enabled: bool) -> Self {
        self.transpose = enabled;
        self
    }
}

/// Stateless transform from raw pattern batches to processed batches.
#[derive(Clone, Debug, Default)]
pub struct PatternProcessor {
    config: ProcessorConfig,
}

impl PatternProcessor {
    /// Creates a processor for `config`.
    #[must_use]
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    /// Processor that leaves patterns untouched.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process a raw pattern batch and its bad pixel mask together.
    ///
    /// # Errors
    /// Returns [`Error::InvalidShape`] for inputs of rank other than 2 or 3,
    /// [`Error::ShapeMismatch`] if the mask does not match the frame extent and
    /// [`Error::InvalidBinning`] if the cropped extent is not divisible by the
    /// bin factors.
    pub fn process<T: PixelValue>(
        &self,
        raw_patterns: ArrayD<T>,
        raw_bad_pixels: ArrayView2<'_, bool>,
    ) -> Result<(Array3<T>, Array2<bool>)> {
        let patterns = promote_to_batch(raw_patterns)?;
        let (_, height, width) = patterns.dim();
        let expected = ImageExtent::new(width, height);
        let actual = ImageExtent::from_shape(raw_bad_pixels.dim());
        if expected != actual {
            return Err(Error::ShapeMismatch { expected, actual });
        }

        let bad_pixels = self.process_bad_pixels(raw_bad_pixels)?;
        let patterns = self.process_batch(patterns)?;
        Ok((patterns, bad_pixels))
    }

    /// Process a raw pattern batch.
    ///
    /// # Errors
    /// See [`Self::process`].
    pub fn process_patterns<T: PixelValue>(&self, raw_patterns: ArrayD<T>) -> Result<Array3<T>> {
        self.process_batch(promote_to_batch(raw_patterns)?)
    }

    /// Apply the geometric steps to a bad pixel mask.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] if the cropped extent is not divisible
    /// by the bin factors.
    pub fn process_bad_pixels(&self, bad_pixels: ArrayView2<'_, bool>) -> Result<Array2<bool>> {
        let mut data = bad_pixels.to_owned();

        if let Some(crop) = self.config.crop {
            let (rows, cols) = crop_ranges(&crop, ImageExtent::from_shape(data.dim()));
            data = data.slice(s![rows, cols]).to_owned();
        }

        if let Some(binning) = self.config.binning {
            data = bin_mask(&data, binning)?;
        }

        if let Some(padding) = self.config.padding {
            let (height, width) = data.dim();
            let mut padded =
                Array2::from_elem((height + 2 * padding.pad_y, width + 2 * padding.pad_x), false);
            padded
                .slice_mut(s![
                    padding.pad_y..padding.pad_y + height,
                    padding.pad_x..padding.pad_x + width
                ])
                .assign(&data);
            data = padded;
        }

        if self.config.hflip {
            data.invert_axis(Axis(1));
        }

        if self.config.vflip {
            data.invert_axis(Axis(0));
        }

        if self.config.transpose {
            data.swap_axes(0, 1);
        }

        Ok(data.as_standard_layout().into_owned())
    }

    /// Extent of processed patterns for a raw `detector_extent`.
    ///
    /// Simulates the geometric steps on an all-good mask.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] if the configuration cannot be applied.
    pub fn processed_extent(&self, detector_extent: ImageExtent) -> Result<ImageExtent> {
        let mask = Array2::from_elem(detector_extent.shape(), false);
        let processed = self.process_bad_pixels(mask.view())?;
        Ok(ImageExtent::from_shape(processed.dim()))
    }

    fn process_batch<T: PixelValue>(&self, mut data: Array3<T>) -> Result<Array3<T>> {
        if let Some(filter) = self.config.filter {
            data.mapv_inplace(|value| {
                if filter.rejects(value.to_f64()) {
                    T::default()
                } else {
                    value
                }
            });
        }

        if let Some(crop) = self.config.crop {
            let (_, height, width) = data.dim();
            let (rows, cols) = crop_ranges(&crop, ImageExtent::new(width, height));
            data = data.slice(s![.., rows, cols]).to_owned();
        }

        if let Some(binning) = self.config.binning {
            data = bin_patterns(&data, binning)?;
        }

        if let Some(padding) = self.config.padding {
            let (count, height, width) = data.dim();
            let mut padded = Array3::<T>::default((
                count,
                height + 2 * padding.pad_y,
                width + 2 * padding.pad_x,
            ));
            padded
                .slice_mut(s![
                    ..,
                    padding.pad_y..padding.pad_y + height,
                    padding.pad_x..padding.pad_x + width
                ])
                .assign(&data);
            data = padded;
        }

        if self.config.hflip {
            data.invert_axis(Axis(2));
        }

        if self.config.vflip {
            data.invert_axis(Axis(1));
        }

        if self.config.transpose {
            data.swap_axes(1, 2);
        }

        Ok(data.as_standard_layout().into_owned())
    }
}

/// Promote a single `(H, W)` frame to `(1, H, W)`; reject other ranks.
fn promote_to_batch<T: PixelValue>(patterns: ArrayD<T>) -> Result<Array3<T>> {
    let shape = patterns.shape().to_vec();
    let patterns = match patterns.ndim() {
        2 => patterns.insert_axis(Axis(0)),
        3 => patterns,
        _ => return Err(Error::InvalidShape { shape }),
    };
    patterns
        .into_dimensionality::<Ix3>()
        .map_err(|_| Error::InvalidShape { shape })
}

/// Row and column ranges of a crop window, kept inside the image.
fn crop_ranges(crop: &CropWindow, image: ImageExtent) -> (Range<usize>, Range<usize>) {
    let rows = axis_window(image.height_px, crop.center.position_y_px, crop.extent.height_px);
    let cols = axis_window(image.width_px, crop.center.position_x_px, crop.extent.width_px);
    (rows, cols)
}

fn axis_window(size: usize, center: usize, extent: usize) -> Range<usize> {
    let extent = extent.max(1).min(size);
    let start = center.saturating_sub(extent / 2).min(size - extent);
    start..start + extent
}

fn check_binning(extent: ImageExtent, binning: Binning) -> Result<()> {
    if binning.bin_x == 0
        || binning.bin_y == 0
        || extent.width_px % binning.bin_x != 0
        || extent.height_px % binning.bin_y != 0
    {
        return Err(Error::InvalidBinning {
            width: extent.width_px,
            height: extent.height_px,
            bin_x: binning.bin_x,
            bin_y: binning.bin_y,
        });
    }
    Ok(())
}

fn bin_patterns<T: PixelValue>(data: &Array3<T>, binning: Binning) -> Result<Array3<T>> {
    let (count, height, width) = data.dim();
    check_binning(ImageExtent::new(width, height), binning)?;

    let mut binned =
        Array3::<T>::default((count, height / binning.bin_y, width / binning.bin_x));
    for ((k, i, j), &value) in data.indexed_iter() {
        let cell = &mut binned[[k, i / binning.bin_y, j / binning.bin_x]];
        *cell = cell.accumulate(value);
    }
    Ok(binned)
}

fn bin_mask(data: &Array2<bool>, binning: Binning) -> Result<Array2<bool>> {
    let (height, width) = data.dim();
    check_binning(ImageExtent::new(width, height), binning)?;

    let mut binned = Array2::from_elem((height / binning.bin_y, width / binning.bin_x), true);
    for ((i, j), &bad) in data.indexed_iter() {
        binned[[i / binning.bin_y, j / binning.bin_x]] &= bad;
    }
    Ok(binned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, arr3, Array1};

    fn ramp(count: usize, height: usize, width: usize) -> Array3<u32> {
        let len = count * height * width;
        let values: Array1<u32> = (0..u32::try_from(len).unwrap()).collect();
        values.into_shape_with_order((count, height, width)).unwrap()
    }

    #[test]
    fn test_identity_keeps_patterns() {
        let raw = ramp(2, 3, 4);
        let processed = PatternProcessor::identity()
            .process_patterns(raw.clone().into_dyn())
            .unwrap();
        assert_eq!(processed, raw);
    }

    #[test]
    fn test_single_frame_is_promoted() {
        let frame = arr2(&[[1u16, 2], [3, 4]]).into_dyn();
        let processed = PatternProcessor::identity().process_patterns(frame).unwrap();
        assert_eq!(processed.dim(), (1, 2, 2));
    }

    #[test]
    fn test_invalid_rank_is_rejected() {
        let flat = ndarray::Array1::<u16>::zeros(4).into_dyn();
        let err = PatternProcessor::identity().process_patterns(flat).unwrap_err();
        assert!(matches!(err, Error::InvalidShape { ref shape } if shape == &vec![4]));

        let deep = ndarray::Array4::<u16>::zeros((1, 1, 2, 2)).into_dyn();
        let err = PatternProcessor::identity().process_patterns(deep).unwrap_err();
        assert!(matches!(err, Error::InvalidShape { .. }));
    }

    #[test]
    fn test_filter_zeroes_out_of_bounds() {
        let raw = arr3(&[[[1u16, 5, 10], [20, 3, 7]]]).into_dyn();
        let processor =
            PatternProcessor::new(ProcessorConfig::default().with_filter(Some(3.0), Some(10.0)));
        let processed = processor.process_patterns(raw).unwrap();
        assert_eq!(processed, arr3(&[[[0u16, 5, 0], [0, 3, 7]]]));
    }

    #[test]
    fn test_filter_never_touches_mask() {
        let raw = arr3(&[[[100u16, 1], [1, 1]]]).into_dyn();
        let mask = arr2(&[[true, false], [false, false]]);
        let processor =
            PatternProcessor::new(ProcessorConfig::default().with_filter(None, Some(50.0)));
        let (patterns, bad) = processor.process(raw, mask.view()).unwrap();
        assert_eq!(patterns[[0, 0, 0]], 0);
        assert_eq!(bad, mask);
    }

    #[test]
    fn test_crop_is_centered() {
        let raw = ramp(1, 6, 6);
        let processor = PatternProcessor::new(
            ProcessorConfig::default().with_crop(CropCenter::new(3, 2), ImageExtent::new(2, 4)),
        );
        let processed = processor.process_patterns(raw.clone().into_dyn()).unwrap();
        assert_eq!(processed.dim(), (1, 4, 2));
        assert_eq!(processed, raw.slice(s![.., 0..4, 2..4]));
    }

    #[test]
    fn test_crop_window_stays_inside_image() {
        assert_eq!(axis_window(8, 0, 4), 0..4);
        assert_eq!(axis_window(8, 7, 4), 4..8);
        assert_eq!(axis_window(8, 4, 20), 0..8);
        assert_eq!(axis_window(8, 4, 0), 4..5);
    }

    #[test]
    fn test_binning_conserves_sum() {
        let raw = ramp(3, 4, 6);
        let processor = PatternProcessor::new(ProcessorConfig::default().with_binning(3, 2));
        let processed = processor.process_patterns(raw.clone().into_dyn()).unwrap();

        assert_eq!(processed.dim(), (3, 2, 2));
        assert_eq!(processed.sum(), raw.sum());
        assert_eq!(processed[[0, 0, 0]], 0 + 1 + 2 + 6 + 7 + 8);
    }

    #[test]
    fn test_binning_requires_divisible_extent() {
        let raw = ramp(1, 4, 5);
        let processor = PatternProcessor::new(ProcessorConfig::default().with_binning(2, 2));
        let err = processor.process_patterns(raw.into_dyn()).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidBinning {
                width: 5,
                height: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_zero_bin_factor_is_rejected() {
        let err = ProcessorConfig::default().try_with_binning(0, 2).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_mask_binning_is_logical_and() {
        let mask = arr2(&[
            [true, true, true, false],
            [true, true, false, false],
        ]);
        let processor = PatternProcessor::new(ProcessorConfig::default().with_binning(2, 2));
        let binned = processor.process_bad_pixels(mask.view()).unwrap();
        assert_eq!(binned, arr2(&[[true, false]]));
    }

    #[test]
    fn test_padding_adds_zero_border() {
        let raw = arr3(&[[[5u8]]]).into_dyn();
        let mask = arr2(&[[true]]);
        let processor = PatternProcessor::new(ProcessorConfig::default().with_padding(1, 2));
        let (patterns, bad) = processor.process(raw, mask.view()).unwrap();

        assert_eq!(patterns.dim(), (1, 5, 3));
        assert_eq!(patterns.sum(), 5);
        assert_eq!(patterns[[0, 2, 1]], 5);
        assert_eq!(bad.dim(), (5, 3));
        assert!(bad[[2, 1]]);
        assert_eq!(bad.iter().filter(|&&b| b).count(), 1);
    }

    #[test]
    fn test_flips_and_transpose() {
        let raw = arr3(&[[[1u16, 2, 3], [4, 5, 6]]]);

        let hflip = PatternProcessor::new(ProcessorConfig::default().with_hflip(true));
        assert_eq!(
            hflip.process_patterns(raw.clone().into_dyn()).unwrap(),
            arr3(&[[[3u16, 2, 1], [6, 5, 4]]])
        );

        let vflip = PatternProcessor::new(ProcessorConfig::default().with_vflip(true));
        assert_eq!(
            vflip.process_patterns(raw.clone().into_dyn()).unwrap(),
            arr3(&[[[4u16, 5, 6], [1, 2, 3]]])
        );

        let transpose = PatternProcessor::new(ProcessorConfig::default().with_transpose(true));
        let transposed = transpose.process_patterns(raw.into_dyn()).unwrap();
        assert_eq!(transposed, arr3(&[[[1u16, 4], [2, 5], [3, 6]]]));
        assert!(transposed.is_standard_layout());
    }

    #[test]
    fn test_mask_follows_geometry() {
        let mut mask = Array2::from_elem((2, 3), false);
        mask[[0, 0]] = true;
        let processor = PatternProcessor::new(
            ProcessorConfig::default()
                .with_hflip(true)
                .with_vflip(true)
                .with_transpose(true),
        );
        let processed = processor.process_bad_pixels(mask.view()).unwrap();
        assert_eq!(processed.dim(), (3, 2));
        assert!(processed[[2, 1]]);
    }

    #[test]
    fn test_processed_extent_matches_pipeline() {
        let config = ProcessorConfig::default()
            .with_crop(CropCenter::new(32, 32), ImageExtent::new(64, 32))
            .with_binning(4, 2)
            .with_padding(3, 1)
            .with_transpose(true);
        let processor = PatternProcessor::new(config);
        let extent = processor
            .processed_extent(ImageExtent::new(128, 128))
            .unwrap();

        // crop 64x32 -> bin 16x16 -> pad 22x18 -> transpose 18x22
        assert_eq!(extent, ImageExtent::new(18, 22));

        let raw = Array3::<u16>::zeros((2, 128, 128)).into_dyn();
        let processed = processor.process_patterns(raw).unwrap();
        assert_eq!(ImageExtent::from_shape((processed.dim().1, processed.dim().2)), extent);
    }

    #[test]
    fn test_mask_extent_must_match_frames() {
        let raw = Array3::<u16>::zeros((1, 2, 2)).into_dyn();
        let mask = Array2::from_elem((3, 2), false);
        let err = PatternProcessor::identity()
            .process(raw, mask.view())
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
