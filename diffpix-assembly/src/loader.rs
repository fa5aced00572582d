//! Array load tasks.
//!
//! An [`ArrayLoadTask`] captures everything it needs by value when it is
//! created: the dataset generation, the array's submission index, the
//! processor and the processed bad pixel mask. Loading runs off the
//! foreground thread and produces a foreground task that writes the result
//! into the dataset.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use diffpix_core::{ImageExtent, PatternProcessor, PixelValue, SharedArray};
use log::{debug, error, info, warn};
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Zip};
use rayon::ThreadPoolBuilder;

use crate::dataset::AssembledDataset;
use crate::error::{Error, Result};
use crate::task::{panic_message, BackgroundTask, ForegroundSender, ForegroundTask};

/// Per-pattern photon counts: the sum over good pixels of each frame.
///
/// Accumulates in the pattern's own type.
#[must_use]
pub fn count_good_pixels<T: PixelValue>(
    patterns: ArrayView3<'_, T>,
    bad_pixels: ArrayView2<'_, bool>,
) -> Vec<T> {
    patterns
        .outer_iter()
        .map(|frame| {
            Zip::from(&frame)
                .and(&bad_pixels)
                .fold(T::default(), |acc, &value, &bad| {
                    if bad {
                        acc
                    } else {
                        acc.accumulate(value)
                    }
                })
        })
        .collect()
}

/// One array's processed result, ready to be written into the dataset.
#[derive(Debug, Clone)]
pub struct AssembledDiffractionData<T> {
    /// Dataset generation the load was created in.
    pub generation: u64,
    /// Submission index of the array.
    pub array_index: usize,
    pub label: String,
    pub indexes: Vec<i64>,
    /// Processed patterns, `(n, H, W)`.
    pub patterns: Array3<T>,
    /// Good-pixel sums of each pattern.
    pub pattern_counts: Vec<T>,
    /// Mask the counts were computed with.
    pub bad_pixels: Arc<Array2<bool>>,
}

/// Background unit of work that loads and processes one raw array.
pub struct ArrayLoadTask<T: PixelValue> {
    generation: u64,
    array_index: usize,
    array: SharedArray<T>,
    processor: Arc<PatternProcessor>,
    bad_pixels: Arc<Array2<bool>>,
}

impl<T: PixelValue> fmt::Debug for ArrayLoadTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayLoadTask")
            .field("generation", &self.generation)
            .field("array_index", &self.array_index)
            .field("label", &self.array.label())
            .finish_non_exhaustive()
    }
}

impl<T: PixelValue> ArrayLoadTask<T> {
    pub(crate) fn new(
        generation: u64,
        array_index: usize,
        array: SharedArray<T>,
        processor: Arc<PatternProcessor>,
        bad_pixels: Arc<Array2<bool>>,
    ) -> Self {
        Self {
            generation,
            array_index,
            array,
            processor,
            bad_pixels,
        }
    }

    /// Submission index of the array.
    #[must_use]
    pub fn array_index(&self) -> usize {
        self.array_index
    }

    /// Generation the task belongs to.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Label of the raw array.
    #[must_use]
    pub fn label(&self) -> &str {
        self.array.label()
    }

    /// Read, process and count the array.
    ///
    /// # Errors
    /// Returns [`diffpix_core::Error::FileNotFound`] when the backing file is
    /// gone, or any read or processing error.
    pub fn load(self) -> diffpix_core::Result<AssembledDiffractionData<T>> {
        let indexes = self.array.indexes()?;
        let patterns = self.processor.process_patterns(self.array.patterns()?)?;

        let (_, height, width) = patterns.dim();
        let actual = ImageExtent::new(width, height);
        let expected = ImageExtent::from_shape(self.bad_pixels.dim());
        if actual != expected {
            return Err(diffpix_core::Error::ShapeMismatch { expected, actual });
        }

        let pattern_counts = count_good_pixels(patterns.view(), self.bad_pixels.view());
        Ok(AssembledDiffractionData {
            generation: self.generation,
            array_index: self.array_index,
            label: self.array.label().to_string(),
            indexes,
            patterns,
            pattern_counts,
            bad_pixels: self.bad_pixels,
        })
    }

    /// Wrap as a background task for the task manager.
    ///
    /// A missing backing file is logged and the array is skipped. Skipped
    /// and failed arrays are released so a later load can retry them.
    #[must_use]
    pub fn into_background_task(self) -> BackgroundTask<AssembledDataset<T>> {
        Box::new(move || {
            let label = self.label().to_string();
            let (generation, array_index) = (self.generation, self.array_index);
            match self.load() {
                Ok(data) => Ok(Some(insert_array(data))),
                Err(diffpix_core::Error::FileNotFound(path)) => {
                    warn!("File not found for \"{label}\": {}", path.display());
                    Ok(Some(release_array(generation, array_index)))
                }
                Err(e) => {
                    error!("Failed to load array {array_index} \"{label}\": {e}");
                    Ok(Some(release_array(generation, array_index)))
                }
            }
        })
    }
}

/// Foreground task that writes a loaded array into the dataset.
///
/// Results from an earlier generation are dropped. An array that does not
/// fit its range is released so a later load can retry it.
#[must_use]
pub fn insert_array<T: PixelValue>(
    data: AssembledDiffractionData<T>,
) -> ForegroundTask<AssembledDataset<T>> {
    Box::new(move |dataset: &mut AssembledDataset<T>| {
        let (generation, array_index) = (data.generation, data.array_index);
        match dataset.assemble_array(data) {
            Ok(_) => Ok(()),
            Err(Error::StaleGeneration {
                task_generation,
                current_generation,
            }) => {
                debug!(
                    "Discarding load from generation {task_generation} \
                     (current {current_generation})"
                );
                Ok(())
            }
            Err(e @ Error::AlreadyAssembled { .. }) => Err(e),
            Err(e) => {
                dataset.release_array(generation, array_index);
                Err(e)
            }
        }
    })
}

/// Foreground task that marks an array as no longer loading.
fn release_array<T: PixelValue>(
    generation: u64,
    array_index: usize,
) -> ForegroundTask<AssembledDataset<T>> {
    Box::new(move |dataset: &mut AssembledDataset<T>| {
        dataset.release_array(generation, array_index);
        Ok(())
    })
}

/// Progress counters of one [`LoadAllArrays`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    /// Arrays whose results were queued for the foreground.
    pub loaded: usize,
    /// Arrays skipped because their file was missing.
    pub skipped: usize,
    /// Arrays that failed to load or process.
    pub failed: usize,
    /// All arrays have been attempted.
    pub finished: bool,
}

/// Shared progress of a [`LoadAllArrays`] run.
#[derive(Debug)]
pub struct LoadStatus {
    submitted: usize,
    counts: Mutex<LoadCounts>,
    finished: Condvar,
}

impl LoadStatus {
    pub(crate) fn new(submitted: usize) -> Self {
        Self {
            submitted,
            counts: Mutex::new(LoadCounts::default()),
            finished: Condvar::new(),
        }
    }

    /// Number of arrays in the run.
    #[must_use]
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Snapshot of the counters.
    pub fn counts(&self) -> LoadCounts {
        *self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true once every array has been attempted.
    pub fn is_finished(&self) -> bool {
        self.counts().finished
    }

    /// Block until the run finishes or `timeout` elapses; returns whether it
    /// finished.
    pub fn wait(&self, timeout: Duration) -> bool {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let (counts, _) = self
            .finished
            .wait_timeout_while(counts, timeout, |counts| !counts.finished)
            .unwrap_or_else(PoisonError::into_inner);
        counts.finished
    }

    fn update(&self, f: impl FnOnce(&mut LoadCounts)) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut counts);
        if counts.finished {
            self.finished.notify_all();
        }
    }
}

/// Fan-out of array loads across a bounded thread pool.
///
/// Each result is handed to the foreground queue as soon as it completes.
pub struct LoadAllArrays<T: PixelValue> {
    tasks: Vec<ArrayLoadTask<T>>,
    num_threads: usize,
    foreground: ForegroundSender<AssembledDataset<T>>,
    status: Arc<LoadStatus>,
}

impl<T: PixelValue> LoadAllArrays<T> {
    /// Creates a run over `tasks`.
    #[must_use]
    pub fn new(
        tasks: Vec<ArrayLoadTask<T>>,
        num_threads: usize,
        foreground: ForegroundSender<AssembledDataset<T>>,
    ) -> Self {
        let status = Arc::new(LoadStatus::new(tasks.len()));
        Self {
            tasks,
            num_threads: num_threads.max(1),
            foreground,
            status,
        }
    }

    /// Progress handle.
    #[must_use]
    pub fn status(&self) -> Arc<LoadStatus> {
        Arc::clone(&self.status)
    }

    /// Load every array, blocking until all have been attempted.
    ///
    /// # Errors
    /// Returns an error only if the thread pool cannot be built; individual
    /// array failures are logged and counted.
    pub fn run(self) -> Result<()> {
        let Self {
            tasks,
            num_threads,
            foreground,
            status,
        } = self;

        let pool = match ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|index| format!("diffpix-load-{index}"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                let failed = tasks.len();
                for task in &tasks {
                    foreground.put(release_array(task.generation(), task.array_index()));
                }
                status.update(|counts| {
                    counts.failed += failed;
                    counts.finished = true;
                });
                return Err(e.into());
            }
        };

        info!(
            "Loading {} arrays on {num_threads} threads",
            status.submitted()
        );

        pool.scope(|scope| {
            for task in tasks {
                let foreground = foreground.clone();
                let status = Arc::clone(&status);
                scope.spawn(move |_| {
                    let label = task.label().to_string();
                    let (generation, array_index) = (task.generation(), task.array_index());
                    match catch_unwind(AssertUnwindSafe(|| task.load())) {
                        Ok(Ok(data)) => {
                            foreground.put(insert_array(data));
                            status.update(|counts| counts.loaded += 1);
                        }
                        Ok(Err(diffpix_core::Error::FileNotFound(path))) => {
                            warn!("File not found for \"{label}\": {}", path.display());
                            foreground.put(release_array(generation, array_index));
                            status.update(|counts| counts.skipped += 1);
                        }
                        Ok(Err(e)) => {
                            error!("Failed to load array {array_index} \"{label}\": {e}");
                            foreground.put(release_array(generation, array_index));
                            status.update(|counts| counts.failed += 1);
                        }
                        Err(payload) => {
                            error!(
                                "Loading array {array_index} \"{label}\" panicked: {}",
                                panic_message(payload.as_ref())
                            );
                            foreground.put(release_array(generation, array_index));
                            status.update(|counts| counts.failed += 1);
                        }
                    }
                });
            }
        });

        status.update(|counts| counts.finished = true);
        let counts = status.counts();
        info!(
            "Loaded {} arrays ({} skipped, {} failed)",
            counts.loaded, counts.skipped, counts.failed
        );
        Ok(())
    }

    /// Wrap as a background task for the task manager.
    #[must_use]
    pub fn into_background_task(self) -> BackgroundTask<AssembledDataset<T>> {
        Box::new(move || {
            self.run()?;
            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskManager;
    use diffpix_core::{DiffractionArray, ProcessorConfig, SimpleDiffractionArray};
    use ndarray::{arr2, arr3};
    use std::path::PathBuf;

    struct MissingArray;

    impl DiffractionArray<u16> for MissingArray {
        fn label(&self) -> &str {
            "missing"
        }

        fn indexes(&self) -> diffpix_core::Result<Vec<i64>> {
            Ok(vec![0])
        }

        fn patterns(&self) -> diffpix_core::Result<ndarray::ArrayD<u16>> {
            Err(diffpix_core::Error::FileNotFound(PathBuf::from(
                "/nonexistent/scan.h5",
            )))
        }
    }

    fn task(array_index: usize, array: SharedArray<u16>) -> ArrayLoadTask<u16> {
        ArrayLoadTask::new(
            0,
            array_index,
            array,
            Arc::new(PatternProcessor::identity()),
            Arc::new(Array2::from_elem((2, 2), false)),
        )
    }

    #[test]
    fn test_counts_skip_bad_pixels() {
        let patterns = arr3(&[[[1u16, 2], [3, 4]], [[10, 20], [30, 40]]]);
        let bad = arr2(&[[false, true], [false, false]]);
        assert_eq!(count_good_pixels(patterns.view(), bad.view()), vec![8, 80]);
    }

    #[test]
    fn test_load_processes_and_counts() {
        let raw = arr3(&[[[1u16, 1, 2, 2], [1, 1, 2, 2]]]).into_dyn();
        let array: SharedArray<u16> = Arc::new(SimpleDiffractionArray::new("a", vec![4], raw));
        let processor = PatternProcessor::new(ProcessorConfig::default().with_binning(2, 2));
        let mask = Arc::new(Array2::from_elem((1, 2), false));

        let data = ArrayLoadTask::new(3, 1, array, Arc::new(processor), Arc::clone(&mask))
            .load()
            .unwrap();
        assert_eq!(data.generation, 3);
        assert_eq!(data.array_index, 1);
        assert_eq!(data.patterns, arr3(&[[[4u16, 8]]]));
        assert_eq!(data.pattern_counts, vec![12]);
        assert!(Arc::ptr_eq(&data.bad_pixels, &mask));
    }

    #[test]
    fn test_load_rejects_mask_mismatch() {
        let raw = Array3::<u16>::zeros((1, 3, 3)).into_dyn();
        let array: SharedArray<u16> = Arc::new(SimpleDiffractionArray::new("a", vec![0], raw));
        let err = task(0, array).load().unwrap_err();
        assert!(matches!(err, diffpix_core::Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let background = task(0, Arc::new(MissingArray)).into_background_task();
        assert!(background().unwrap().is_some());
    }

    #[test]
    fn test_load_all_arrays_counts_outcomes() {
        let manager = TaskManager::<AssembledDataset<u16>>::new();
        let good: SharedArray<u16> = Arc::new(SimpleDiffractionArray::new(
            "good",
            vec![0],
            Array3::<u16>::ones((1, 2, 2)).into_dyn(),
        ));
        let bad_shape: SharedArray<u16> = Arc::new(SimpleDiffractionArray::new(
            "bad",
            vec![1],
            ndarray::Array1::<u16>::ones(4).into_dyn(),
        ));
        let tasks = vec![
            task(0, good),
            task(1, Arc::new(MissingArray)),
            task(2, bad_shape),
        ];

        let job = LoadAllArrays::new(tasks, 2, manager.foreground_sender());
        let status = job.status();
        job.run().unwrap();

        assert!(status.wait(Duration::from_secs(1)));
        assert_eq!(
            status.counts(),
            LoadCounts {
                loaded: 1,
                skipped: 1,
                failed: 1,
                finished: true,
            }
        );
        // One insert plus a release for each array that did not load.
        assert_eq!(manager.foreground_queue_size(), 3);
    }
}
