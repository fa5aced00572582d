//! The assembled diffraction dataset.
//!
//! [`AssembledDataset`] owns one large buffer of processed patterns. Every
//! input array writes an exclusive, precomputed range of it, so loads never
//! need to coordinate. All writes and observer notifications happen through
//! `&mut self` on the thread that drains the foreground queue, and views
//! borrow the dataset, so no view can outlive a reload.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use diffpix_core::{
    count_bad_pixels, BadPixelProvider, DiffractionDataset, DiffractionMetadata, ImageExtent,
    PatternProcessor, PixelValue, SharedArray, SimpleDiffractionDataset,
};
use diffpix_io::PatternBuffer;
use log::{debug, info};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};

use crate::error::{Error, Result};
use crate::loader::{
    count_good_pixels, ArrayLoadTask, AssembledDiffractionData, LoadAllArrays, LoadStatus,
};
use crate::observer::DatasetObserver;
use crate::settings::DatasetSettings;
use crate::task::TaskManager;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// The three co-indexed arrays every load writes into.
struct SharedBuffer<T: PixelValue> {
    indexes: Vec<i64>,
    patterns: Box<dyn PatternBuffer<T>>,
    pattern_counts: Vec<T>,
    extent: ImageExtent,
}

impl<T: PixelValue> SharedBuffer<T> {
    fn empty() -> Self {
        Self {
            indexes: Vec::new(),
            patterns: Box::new(diffpix_io::HeapBuffer::<T>::zeroed(0)),
            pattern_counts: Vec::new(),
            extent: ImageExtent::default(),
        }
    }

    fn num_patterns(&self) -> usize {
        self.indexes.len()
    }

    fn frame_len(&self) -> usize {
        self.extent.num_pixels()
    }

    fn frames(&self, range: Range<usize>) -> Result<ArrayView3<'_, T>> {
        let frame_len = self.frame_len();
        let (height, width) = self.extent.shape();
        let data = &self.patterns.as_slice()[range.start * frame_len..range.end * frame_len];
        ArrayView3::from_shape((range.len(), height, width), data).map_err(|e| {
            Error::Io(diffpix_io::Error::InvalidFormat(format!(
                "pattern buffer shape: {e}"
            )))
        })
    }
}

/// Bookkeeping for one assembled array.
#[derive(Debug, Clone)]
struct AssembledArray {
    array_index: usize,
    label: String,
    range: Range<usize>,
}

/// Read-only view of one assembled array.
///
/// Borrows the dataset, so it cannot be held across a reload.
#[derive(Clone)]
pub struct AssembledArrayView<'a, T> {
    array_index: usize,
    label: &'a str,
    indexes: &'a [i64],
    patterns: ArrayView3<'a, T>,
    pattern_counts: &'a [T],
}

impl<'a, T: PixelValue> AssembledArrayView<'a, T> {
    /// Submission index of the array.
    #[must_use]
    pub fn array_index(&self) -> usize {
        self.array_index
    }

    /// Label of the source array.
    #[must_use]
    pub fn label(&self) -> &'a str {
        self.label
    }

    /// Number of patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Returns true if the array holds no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Pattern indexes, in the order the patterns are stored.
    #[must_use]
    pub fn indexes(&self) -> &'a [i64] {
        self.indexes
    }

    /// Processed patterns, `(n, H, W)`.
    #[must_use]
    pub fn patterns(&self) -> ArrayView3<'a, T> {
        self.patterns.clone()
    }

    /// A single processed pattern.
    #[must_use]
    pub fn pattern(&self, index: usize) -> Option<ArrayView2<'a, T>> {
        (index < self.len()).then(|| self.patterns.clone().index_axis_move(Axis(0), index))
    }

    /// Good-pixel sums, one per pattern.
    #[must_use]
    pub fn pattern_counts(&self) -> &'a [T] {
        self.pattern_counts
    }

    /// Pixel-wise mean over the array's patterns.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_pattern(&self) -> Array2<f64> {
        let (count, height, width) = self.patterns.dim();
        let mut average = Array2::<f64>::zeros((height, width));
        if count == 0 {
            return average;
        }
        for frame in self.patterns.outer_iter() {
            Zip::from(&mut average)
                .and(&frame)
                .for_each(|sum, &value| *sum += value.to_f64());
        }
        average /= count as f64;
        average
    }

    /// Mean pattern counts over loaded patterns (index >= 0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_pattern_counts(&self) -> f64 {
        let (sum, count) = self
            .loaded_pattern_counts()
            .fold((0.0, 0usize), |(sum, count), value| (sum + value.to_f64(), count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Largest pattern counts over loaded patterns, zero when there are none.
    #[must_use]
    pub fn max_pattern_counts(&self) -> T {
        self.loaded_pattern_counts()
            .fold(T::default(), |max, value| if value > max { value } else { max })
    }

    fn loaded_pattern_counts(&self) -> impl Iterator<Item = T> + '_ {
        self.indexes
            .iter()
            .zip(self.pattern_counts)
            .filter(|(&index, _)| index >= 0)
            .map(|(_, &counts)| counts)
    }
}

impl<T> fmt::Debug for AssembledArrayView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssembledArrayView")
            .field("array_index", &self.array_index)
            .field("label", &self.label)
            .field("len", &self.indexes.len())
            .finish_non_exhaustive()
    }
}

/// Index-ordered dataset assembled from concurrently loaded arrays.
pub struct AssembledDataset<T: PixelValue> {
    task_manager: Arc<TaskManager<Self>>,
    settings: DatasetSettings,
    bad_pixel_provider: Arc<dyn BadPixelProvider>,
    observers: Vec<Arc<dyn DatasetObserver>>,

    generation: u64,
    metadata: DiffractionMetadata,
    source_arrays: Vec<SharedArray<T>>,
    array_ranges: Vec<Range<usize>>,
    assembled: Vec<bool>,
    submitted: Vec<bool>,
    array_counter: usize,
    process_patterns: bool,
    processor: Arc<PatternProcessor>,
    raw_bad_pixels: Array2<bool>,
    processed_bad_pixels: Arc<Array2<bool>>,

    buffer: SharedBuffer<T>,
    arrays: Vec<AssembledArray>,
}

impl<T: PixelValue> AssembledDataset<T> {
    /// Creates an empty dataset.
    #[must_use]
    pub fn new(
        task_manager: Arc<TaskManager<Self>>,
        settings: DatasetSettings,
        bad_pixel_provider: Arc<dyn BadPixelProvider>,
    ) -> Self {
        Self {
            task_manager,
            settings,
            bad_pixel_provider,
            observers: Vec::new(),
            generation: 0,
            metadata: DiffractionMetadata::create_null(),
            source_arrays: Vec::new(),
            array_ranges: Vec::new(),
            assembled: Vec::new(),
            submitted: Vec::new(),
            array_counter: 0,
            process_patterns: false,
            processor: Arc::new(PatternProcessor::identity()),
            raw_bad_pixels: Array2::from_elem((0, 0), false),
            processed_bad_pixels: Arc::new(Array2::from_elem((0, 0), false)),
            buffer: SharedBuffer::empty(),
            arrays: Vec::new(),
        }
    }

    /// Task manager the dataset schedules loads on.
    #[must_use]
    pub fn task_manager(&self) -> &Arc<TaskManager<Self>> {
        &self.task_manager
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> &DatasetSettings {
        &self.settings
    }

    /// Replace the settings; takes effect at the next reload.
    pub fn set_settings(&mut self, settings: DatasetSettings) {
        self.settings = settings;
    }

    /// Register an observer. Adding the same observer twice has no effect.
    pub fn add_observer(&mut self, observer: Arc<dyn DatasetObserver>) {
        if !self.observers.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            self.observers.push(observer);
        }
    }

    /// Unregister an observer.
    pub fn remove_observer(&mut self, observer: &Arc<dyn DatasetObserver>) {
        self.observers.retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Current reload epoch.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Metadata of the dataset last reloaded.
    #[must_use]
    pub fn metadata(&self) -> &DiffractionMetadata {
        &self.metadata
    }

    /// Extent of the assembled patterns.
    #[must_use]
    pub fn pattern_extent(&self) -> ImageExtent {
        self.buffer.extent
    }

    /// Whether the current patterns went through the processor.
    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.process_patterns
    }

    /// Reset to the empty dataset and notify observers.
    pub fn clear(&mut self) {
        self.reset();
        self.notify(|o| o.on_dataset_reloaded());
    }

    /// Prepare to assemble `dataset`.
    ///
    /// Allocates the pattern buffer for the full metadata and computes every
    /// array's range, but loads nothing; call [`Self::load_all_arrays`] to
    /// start. Any load still in flight from before is discarded when it
    /// arrives.
    ///
    /// # Errors
    /// Returns [`Error::ArrayOutOfRange`] if the dataset holds more arrays
    /// than its metadata describes. Also returns an error if no bad pixel
    /// map can be resolved, if the processing configuration does not fit
    /// the detector, or if the buffer cannot be allocated. The dataset is
    /// left empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn reload(
        &mut self,
        dataset: &dyn DiffractionDataset<T>,
        process_patterns: bool,
    ) -> Result<()> {
        self.reset();

        let metadata = dataset.metadata().clone();
        let num_arrays = metadata.num_arrays();
        if dataset.arrays().len() > num_arrays {
            return Err(Error::ArrayOutOfRange {
                array_index: num_arrays,
                num_arrays,
            });
        }
        let raw_bad_pixels = self.resolve_bad_pixels(dataset, &metadata)?;
        let processor = if process_patterns {
            PatternProcessor::new(self.settings.processor.clone())
        } else {
            PatternProcessor::identity()
        };
        let processed_bad_pixels = processor.process_bad_pixels(raw_bad_pixels.view())?;
        let extent = ImageExtent::from_shape(processed_bad_pixels.dim());

        let num_patterns = metadata.total_patterns();
        let patterns = self
            .settings
            .allocation_policy()
            .allocate::<T>(num_patterns * extent.num_pixels())?;
        info!(
            "Assembling {num_patterns} x {extent} {} patterns [{:.2}MB]",
            T::DTYPE,
            patterns.size_bytes() as f64 / BYTES_PER_MB
        );

        self.buffer = SharedBuffer {
            indexes: vec![-1; num_patterns],
            patterns,
            pattern_counts: vec![T::default(); num_patterns],
            extent,
        };
        self.array_ranges = metadata.array_ranges();
        self.assembled = vec![false; self.array_ranges.len()];
        self.submitted = vec![false; self.array_ranges.len()];
        self.source_arrays = dataset.arrays().to_vec();
        self.metadata = metadata;
        self.process_patterns = process_patterns;
        self.processor = Arc::new(processor);
        self.raw_bad_pixels = raw_bad_pixels;
        self.processed_bad_pixels = Arc::new(processed_bad_pixels);

        self.notify(|o| o.on_dataset_reloaded());
        Ok(())
    }

    /// Reload for arrays that will arrive one at a time via
    /// [`Self::append_array`].
    ///
    /// # Errors
    /// See [`Self::reload`].
    pub fn begin_streaming(&mut self, metadata: DiffractionMetadata) -> Result<()> {
        self.reload(&SimpleDiffractionDataset::<T>::new(metadata, Vec::new()), true)
    }

    /// Schedule loads of every source array that is neither assembled nor
    /// already waiting on a load.
    ///
    /// Loads run on a pool of `num_data_threads` workers inside one
    /// background task; results become visible as the foreground queue is
    /// drained. Arrays whose load was skipped or failed are scheduled again
    /// by the next call once that outcome has been drained.
    pub fn load_all_arrays(&mut self) -> Arc<LoadStatus> {
        let mut tasks = Vec::new();
        for (array_index, array) in self.source_arrays.iter().enumerate() {
            if self.is_pending(array_index) {
                tasks.push(self.loader_for(array_index, Arc::clone(array)));
            }
        }
        for task in &tasks {
            self.submitted[task.array_index()] = true;
        }
        self.array_counter = self.array_counter.max(self.source_arrays.len());

        let job = LoadAllArrays::new(
            tasks,
            self.settings.effective_num_data_threads(),
            self.task_manager.foreground_sender(),
        );
        let status = job.status();
        self.task_manager.put_background_task(job.into_background_task());
        status
    }

    /// Create a load task for the next array in submission order.
    ///
    /// # Errors
    /// Returns [`Error::ArrayOutOfRange`] if the metadata has no range left.
    pub fn create_array_loader(&mut self, array: SharedArray<T>) -> Result<ArrayLoadTask<T>> {
        let array_index = self.array_counter;
        if array_index >= self.array_ranges.len() {
            return Err(Error::ArrayOutOfRange {
                array_index,
                num_arrays: self.array_ranges.len(),
            });
        }
        self.array_counter += 1;
        self.submitted[array_index] = true;
        Ok(self.loader_for(array_index, array))
    }

    /// Allow `array_index` to be scheduled again after its load was skipped
    /// or failed. Ignored for arrays of an earlier generation.
    pub(crate) fn release_array(&mut self, generation: u64, array_index: usize) {
        if generation != self.generation {
            return;
        }
        if let Some(submitted) = self.submitted.get_mut(array_index) {
            *submitted = false;
        }
    }

    /// Load one more array in the background. Arrays are assumed to arrive
    /// in submission order.
    ///
    /// # Errors
    /// See [`Self::create_array_loader`].
    pub fn append_array(&mut self, array: SharedArray<T>) -> Result<()> {
        let task = self.create_array_loader(array)?;
        self.task_manager.put_background_task(task.into_background_task());
        Ok(())
    }

    /// Drain the foreground queue into this dataset; returns the number of
    /// tasks run.
    pub fn process_foreground_tasks(&mut self) -> usize {
        let task_manager = Arc::clone(&self.task_manager);
        task_manager.run_foreground_tasks(self)
    }

    /// Write a loaded array into its range and insert it in `array_index`
    /// order. Returns the insertion position.
    ///
    /// # Errors
    /// Returns [`Error::StaleGeneration`] for results from before the last
    /// reload, [`Error::AlreadyAssembled`] if the range was already written,
    /// and a size or shape error if the data does not fit its range.
    pub fn assemble_array(&mut self, data: AssembledDiffractionData<T>) -> Result<usize> {
        if data.generation != self.generation {
            return Err(Error::StaleGeneration {
                task_generation: data.generation,
                current_generation: self.generation,
            });
        }

        let array_index = data.array_index;
        let range = self
            .array_ranges
            .get(array_index)
            .cloned()
            .ok_or(Error::ArrayOutOfRange {
                array_index,
                num_arrays: self.array_ranges.len(),
            })?;
        if self.assembled[array_index] {
            return Err(Error::AlreadyAssembled { array_index });
        }

        let (count, height, width) = data.patterns.dim();
        for actual in [data.indexes.len(), count] {
            if actual != range.len() {
                return Err(Error::SizeMismatch {
                    array_index,
                    expected: range.len(),
                    actual,
                });
            }
        }
        let actual = ImageExtent::new(width, height);
        if actual != self.buffer.extent {
            return Err(diffpix_core::Error::ShapeMismatch {
                expected: self.buffer.extent,
                actual,
            }
            .into());
        }

        let frame_len = self.buffer.frame_len();
        let (start, end) = (range.start * frame_len, range.end * frame_len);
        let target = &mut self.buffer.patterns.as_mut_slice()[start..end];
        match data.patterns.as_slice() {
            Some(source) => target.copy_from_slice(source),
            None => target
                .iter_mut()
                .zip(data.patterns.iter())
                .for_each(|(dst, &src)| *dst = src),
        }
        self.buffer.indexes[range.clone()].copy_from_slice(&data.indexes);

        let pattern_counts = if Arc::ptr_eq(&data.bad_pixels, &self.processed_bad_pixels) {
            data.pattern_counts
        } else {
            debug!("Recounting array {array_index} with the current bad pixel map");
            count_good_pixels(data.patterns.view(), self.processed_bad_pixels.view())
        };
        self.buffer.pattern_counts[range.clone()].copy_from_slice(&pattern_counts);
        self.assembled[array_index] = true;

        let position = self
            .arrays
            .partition_point(|array| array.array_index <= array_index);
        self.arrays.insert(
            position,
            AssembledArray {
                array_index,
                label: data.label,
                range,
            },
        );
        debug!("Assembled array {array_index} at position {position}");

        self.notify(|o| o.on_array_inserted(position));
        Ok(position)
    }

    /// Number of assembled arrays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    /// Returns true if no array has been assembled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// View of the assembled array at `position` in `array_index` order.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<AssembledArrayView<'_, T>> {
        let array = self.arrays.get(position)?;
        let range = array.range.clone();
        Some(AssembledArrayView {
            array_index: array.array_index,
            label: &array.label,
            indexes: &self.buffer.indexes[range.clone()],
            patterns: self.buffer.frames(range.clone()).ok()?,
            pattern_counts: &self.buffer.pattern_counts[range],
        })
    }

    /// Assembled arrays in `array_index` order.
    pub fn iter(&self) -> impl Iterator<Item = AssembledArrayView<'_, T>> + '_ {
        (0..self.arrays.len()).filter_map(move |position| self.get(position))
    }

    /// Indexes of every written slot, in buffer order.
    #[must_use]
    pub fn assembled_indexes(&self) -> Vec<i64> {
        self.buffer
            .indexes
            .iter()
            .copied()
            .filter(|&index| index >= 0)
            .collect()
    }

    /// Patterns of every written slot, in buffer order.
    ///
    /// # Errors
    /// Returns an error if the buffer shape is inconsistent.
    pub fn assembled_patterns(&self) -> Result<Array3<T>> {
        let slots = self.written_slots();
        Ok(self.patterns()?.select(Axis(0), &slots))
    }

    /// Pattern counts of every written slot, in buffer order.
    #[must_use]
    pub fn assembled_pattern_counts(&self) -> Vec<T> {
        self.written_slots()
            .into_iter()
            .map(|slot| self.buffer.pattern_counts[slot])
            .collect()
    }

    /// Pattern index to pattern counts, over written slots.
    #[must_use]
    pub fn pattern_counts_lut(&self) -> BTreeMap<i64, T> {
        self.buffer
            .indexes
            .iter()
            .zip(&self.buffer.pattern_counts)
            .filter(|(&index, _)| index >= 0)
            .map(|(&index, &counts)| (index, counts))
            .collect()
    }

    /// Largest per-array maximum pattern counts, zero when nothing is loaded.
    #[must_use]
    pub fn maximum_pattern_counts(&self) -> T {
        self.iter()
            .map(|view| view.max_pattern_counts())
            .fold(T::default(), |max, value| if value > max { value } else { max })
    }

    /// The whole pattern buffer, including unwritten slots.
    ///
    /// # Errors
    /// Returns an error if the buffer shape is inconsistent.
    pub fn patterns(&self) -> Result<ArrayView3<'_, T>> {
        self.buffer.frames(0..self.buffer.num_patterns())
    }

    /// The whole index buffer; unwritten slots hold -1.
    #[must_use]
    pub fn indexes(&self) -> &[i64] {
        &self.buffer.indexes
    }

    /// Storage backend of the pattern buffer.
    #[must_use]
    pub fn buffer_backend(&self) -> diffpix_io::BufferBackend {
        self.buffer.patterns.backend()
    }

    /// Bad pixel map at the assembled extent.
    #[must_use]
    pub fn processed_bad_pixels(&self) -> &Array2<bool> {
        &self.processed_bad_pixels
    }

    /// Bad pixel map held by the provider.
    #[must_use]
    pub fn bad_pixels(&self) -> Option<Array2<bool>> {
        self.bad_pixel_provider.bad_pixels()
    }

    /// Replace the detector bad pixel map.
    ///
    /// Pattern counts of already assembled arrays are recomputed and
    /// observers are told about each changed array.
    ///
    /// # Errors
    /// Returns [`diffpix_core::Error::ShapeMismatch`] if the map does not
    /// match the detector extent.
    pub fn set_bad_pixels(&mut self, bad_pixels: Option<Array2<bool>>) -> Result<()> {
        if let (Some(map), Some(expected)) = (&bad_pixels, self.detector_extent()) {
            let actual = ImageExtent::from_shape(map.dim());
            if actual != expected {
                return Err(diffpix_core::Error::ShapeMismatch { expected, actual }.into());
            }
        }

        self.bad_pixel_provider.set_bad_pixels(bad_pixels.clone())?;
        let num_bad_pixels = bad_pixels.as_ref().map_or(0, count_bad_pixels);
        self.notify(|o| o.on_bad_pixels_changed(num_bad_pixels));

        let raw_bad_pixels = match bad_pixels {
            Some(map) => map,
            None => Array2::from_elem(self.raw_bad_pixels.dim(), false),
        };
        if raw_bad_pixels.dim() != self.raw_bad_pixels.dim() {
            return Ok(());
        }
        let processed = self.processor.process_bad_pixels(raw_bad_pixels.view())?;
        self.raw_bad_pixels = raw_bad_pixels;
        self.processed_bad_pixels = Arc::new(processed);
        self.recount_arrays()
    }

    /// One-line summary: label, shape, dtype and buffer size.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn info_text(&self) -> String {
        let (height, width) = self.buffer.extent.shape();
        format!(
            "{}: {} x {width}W x {height}H {} [{:.2}MB]",
            self.metadata.label(),
            self.buffer.num_patterns(),
            T::DTYPE,
            self.buffer.patterns.size_bytes() as f64 / BYTES_PER_MB
        )
    }

    fn detector_extent(&self) -> Option<ImageExtent> {
        self.metadata.detector_extent.or_else(|| {
            let extent = ImageExtent::from_shape(self.raw_bad_pixels.dim());
            (!extent.is_empty()).then_some(extent)
        })
    }

    fn recount_arrays(&mut self) -> Result<()> {
        let mut changed = Vec::with_capacity(self.arrays.len());
        for (position, array) in self.arrays.iter().enumerate() {
            let counts = count_good_pixels(
                self.buffer.frames(array.range.clone())?,
                self.processed_bad_pixels.view(),
            );
            changed.push((position, array.range.clone(), counts));
        }
        for (position, range, counts) in changed {
            self.buffer.pattern_counts[range].copy_from_slice(&counts);
            self.notify(|o| o.on_array_changed(position));
        }
        Ok(())
    }

    fn is_pending(&self, array_index: usize) -> bool {
        let assembled = self.assembled.get(array_index).copied().unwrap_or(true);
        let submitted = self.submitted.get(array_index).copied().unwrap_or(true);
        !assembled && !submitted
    }

    fn loader_for(&self, array_index: usize, array: SharedArray<T>) -> ArrayLoadTask<T> {
        ArrayLoadTask::new(
            self.generation,
            array_index,
            array,
            Arc::clone(&self.processor),
            Arc::clone(&self.processed_bad_pixels),
        )
    }

    fn written_slots(&self) -> Vec<usize> {
        self.buffer
            .indexes
            .iter()
            .enumerate()
            .filter(|(_, &index)| index >= 0)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Provider map, else the dataset's own map, else all good pixels at the
    /// detector extent.
    fn resolve_bad_pixels(
        &self,
        dataset: &dyn DiffractionDataset<T>,
        metadata: &DiffractionMetadata,
    ) -> Result<Array2<bool>> {
        let bad_pixels = self
            .bad_pixel_provider
            .bad_pixels()
            .or_else(|| dataset.bad_pixels().cloned());

        match (bad_pixels, metadata.detector_extent) {
            (Some(map), Some(expected)) => {
                let actual = ImageExtent::from_shape(map.dim());
                if actual == expected {
                    Ok(map)
                } else {
                    Err(diffpix_core::Error::ShapeMismatch { expected, actual }.into())
                }
            }
            (Some(map), None) => Ok(map),
            (None, Some(extent)) => Ok(Array2::from_elem(extent.shape(), false)),
            (None, None) if metadata.total_patterns() == 0 => {
                Ok(Array2::from_elem((0, 0), false))
            }
            (None, None) => Err(diffpix_core::Error::MissingBadPixelMap.into()),
        }
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.metadata = DiffractionMetadata::create_null();
        self.source_arrays.clear();
        self.array_ranges.clear();
        self.assembled.clear();
        self.submitted.clear();
        self.array_counter = 0;
        self.process_patterns = false;
        self.processor = Arc::new(PatternProcessor::identity());
        self.raw_bad_pixels = Array2::from_elem((0, 0), false);
        self.processed_bad_pixels = Arc::new(Array2::from_elem((0, 0), false));
        self.buffer = SharedBuffer::empty();
        self.arrays.clear();
    }

    fn notify(&self, f: impl Fn(&dyn DatasetObserver)) {
        for observer in &self.observers {
            f(observer.as_ref());
        }
    }
}

#[cfg(feature = "hdf5")]
impl<T: PixelValue + hdf5::types::H5Type> AssembledDataset<T> {
    /// Write the whole buffer and the processed bad pixel map to `path`.
    ///
    /// # Errors
    /// Returns an error if the compression setting is invalid or HDF5 I/O
    /// fails.
    pub fn export_assembled_patterns<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("Exporting assembled dataset to \"{}\"", path.display());
        diffpix_io::write_snapshot(
            path,
            &self.buffer.indexes,
            self.patterns()?,
            self.processed_bad_pixels.view(),
            self.settings.compression()?,
        )?;
        Ok(())
    }

    /// Replace the dataset with a snapshot written by
    /// [`Self::export_assembled_patterns`].
    ///
    /// The snapshot becomes a single assembled array and its pattern counts
    /// are recomputed. On error the dataset is unchanged.
    ///
    /// # Errors
    /// Returns an error if the file is missing or malformed, or the buffer
    /// cannot be allocated.
    pub fn import_assembled_patterns<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!("Importing assembled dataset from \"{}\"", path.display());
        let snapshot = diffpix_io::read_snapshot::<T, _>(path)?;
        let (num_patterns, height, width) = snapshot.patterns.dim();
        let extent = ImageExtent::new(width, height);

        let mut patterns = self
            .settings
            .allocation_policy()
            .allocate::<T>(snapshot.patterns.len())?;
        match snapshot.patterns.as_slice() {
            Some(source) => patterns.as_mut_slice().copy_from_slice(source),
            None => patterns
                .as_mut_slice()
                .iter_mut()
                .zip(snapshot.patterns.iter())
                .for_each(|(dst, &src)| *dst = src),
        }
        let pattern_counts =
            count_good_pixels(snapshot.patterns.view(), snapshot.bad_pixels.view());

        self.reset();
        self.metadata = DiffractionMetadata::new(vec![num_patterns], T::DTYPE)
            .with_detector_extent(extent)
            .with_file_path(path);
        self.array_ranges = self.metadata.array_ranges();
        self.assembled = vec![true];
        self.submitted = vec![false];
        self.array_counter = 1;
        self.raw_bad_pixels = snapshot.bad_pixels.clone();
        self.processed_bad_pixels = Arc::new(snapshot.bad_pixels);
        self.buffer = SharedBuffer {
            indexes: snapshot.indexes,
            patterns,
            pattern_counts,
            extent,
        };
        self.arrays.push(AssembledArray {
            array_index: 0,
            label: self.metadata.label(),
            range: 0..num_patterns,
        });

        self.notify(|o| o.on_dataset_reloaded());
        Ok(())
    }
}
