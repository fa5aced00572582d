#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
use std::sync::{Arc, Mutex};
use std::time::Duration;

use diffpix_assembly::{
    AssembledDataset, DatasetObserver, DatasetSettings, LoadCounts, TaskManager,
};
use diffpix_core::{
    BadPixelStore, DiffractionDataset, DiffractionMetadata, ImageExtent, PatternDtype,
    ProcessorConfig, SharedArray, SimpleDiffractionArray, SimpleDiffractionDataset,
};
use diffpix_io::BufferBackend;
use ndarray::Array3;
use tempfile::TempDir;

#[derive(Default)]
struct InsertRecorder {
    positions: Mutex<Vec<usize>>,
    reloads: Mutex<usize>,
}

impl DatasetObserver for InsertRecorder {
    fn on_array_inserted(&self, position: usize) {
        self.positions.lock().unwrap().push(position);
    }

    fn on_dataset_reloaded(&self) {
        *self.reloads.lock().unwrap() += 1;
    }
}

// Arrays of `counts[i]` patterns of 2x2 pixels, every pixel holding the
// pattern index.
fn make_arrays(counts: &[usize]) -> Vec<SharedArray<u32>> {
    let mut next = 0i64;
    counts
        .iter()
        .enumerate()
        .map(|(i, &count)| {
            let indexes: Vec<i64> = (next..next + count as i64).collect();
            let patterns =
                Array3::from_shape_fn((count, 2, 2), |(n, _, _)| (next as u32) + n as u32);
            next += count as i64;
            Arc::new(SimpleDiffractionArray::new(
                format!("scan_{i}"),
                indexes,
                patterns.into_dyn(),
            )) as SharedArray<u32>
        })
        .collect()
}

fn make_source(counts: &[usize]) -> SimpleDiffractionDataset<u32> {
    let metadata = DiffractionMetadata::new(counts.to_vec(), PatternDtype::U32)
        .with_detector_extent(ImageExtent::new(2, 2));
    SimpleDiffractionDataset::new(metadata, make_arrays(counts))
}

fn new_dataset(
    settings: DatasetSettings,
) -> (Arc<TaskManager<AssembledDataset<u32>>>, AssembledDataset<u32>) {
    let manager = Arc::new(TaskManager::new());
    let dataset = AssembledDataset::new(
        Arc::clone(&manager),
        settings,
        Arc::new(BadPixelStore::new()),
    );
    (manager, dataset)
}

#[test]
fn test_load_all_arrays_end_to_end() {
    let (manager, mut dataset) = new_dataset(DatasetSettings::default().with_num_data_threads(4));
    let recorder = Arc::new(InsertRecorder::default());
    dataset.add_observer(recorder.clone());

    dataset.reload(&make_source(&[3, 1, 4, 1, 5]), true).unwrap();
    manager.start().unwrap();
    let status = dataset.load_all_arrays();
    assert!(status.wait(Duration::from_secs(10)));
    manager.stop(true);

    assert_eq!(
        status.counts(),
        LoadCounts {
            loaded: 5,
            skipped: 0,
            failed: 0,
            finished: true,
        }
    );
    assert!(dataset.is_empty());
    assert_eq!(dataset.process_foreground_tasks(), 5);

    let order: Vec<usize> = dataset.iter().map(|view| view.array_index()).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
    assert_eq!(dataset.assembled_indexes(), (0..14).collect::<Vec<i64>>());
    assert_eq!(*recorder.reloads.lock().unwrap(), 1);
    assert_eq!(recorder.positions.lock().unwrap().len(), 5);

    // Pattern counts are four times the index with no bad pixels.
    let lut = dataset.pattern_counts_lut();
    assert!(lut.iter().all(|(&index, &counts)| counts == 4 * index as u32));
    assert_eq!(dataset.maximum_pattern_counts(), 52);
}

#[test]
fn test_drain_is_idempotent() {
    let (manager, mut dataset) = new_dataset(DatasetSettings::default().with_num_data_threads(2));
    dataset.reload(&make_source(&[2, 2]), true).unwrap();
    manager.start().unwrap();
    dataset.load_all_arrays();
    manager.stop(true);

    assert_eq!(dataset.process_foreground_tasks(), 2);
    let indexes = dataset.assembled_indexes();
    let patterns = dataset.assembled_patterns().unwrap();

    assert_eq!(dataset.process_foreground_tasks(), 0);
    assert_eq!(dataset.assembled_indexes(), indexes);
    assert_eq!(dataset.assembled_patterns().unwrap(), patterns);
}

#[test]
fn test_reload_discards_loads_in_flight() {
    let (manager, mut dataset) = new_dataset(DatasetSettings::default().with_num_data_threads(2));
    dataset.reload(&make_source(&[2, 2]), true).unwrap();
    manager.start().unwrap();
    dataset.load_all_arrays();
    manager.stop(true);

    dataset.reload(&make_source(&[1]), true).unwrap();
    assert_eq!(dataset.process_foreground_tasks(), 2);
    assert!(dataset.is_empty());
    assert_eq!(dataset.indexes(), &[-1]);
}

#[test]
fn test_load_all_arrays_skips_assembled() {
    let (manager, mut dataset) = new_dataset(DatasetSettings::default().with_num_data_threads(1));
    let source = make_source(&[1, 2]);
    dataset.reload(&source, true).unwrap();

    let first = dataset
        .create_array_loader(Arc::clone(&source.arrays()[0]))
        .unwrap()
        .load()
        .unwrap();
    dataset.assemble_array(first).unwrap();

    manager.start().unwrap();
    let status = dataset.load_all_arrays();
    manager.stop(true);

    assert_eq!(status.submitted(), 1);
    assert_eq!(dataset.process_foreground_tasks(), 1);
    assert_eq!(dataset.assembled_indexes(), vec![0, 1, 2]);
}

#[test]
fn test_streaming_append() {
    let (manager, mut dataset) = new_dataset(DatasetSettings::default());
    let metadata = DiffractionMetadata::new(vec![2, 3], PatternDtype::U32)
        .with_detector_extent(ImageExtent::new(2, 2));
    dataset.begin_streaming(metadata).unwrap();

    manager.start().unwrap();
    for array in make_arrays(&[2, 3]) {
        dataset.append_array(array).unwrap();
    }
    manager.stop(true);

    assert!(dataset.append_array(make_arrays(&[1]).remove(0)).is_err());
    assert_eq!(dataset.process_foreground_tasks(), 2);
    assert_eq!(dataset.assembled_indexes(), vec![0, 1, 2, 3, 4]);
    assert_eq!(dataset.get(1).unwrap().label(), "scan_1");
}

#[test]
fn test_processing_applies_to_assembled_patterns() {
    let settings = DatasetSettings::default()
        .with_processor(ProcessorConfig::default().with_binning(2, 2).with_padding(1, 0));
    let (_manager, mut dataset) = new_dataset(settings);
    let source = make_source(&[2]);
    dataset.reload(&source, true).unwrap();
    assert_eq!(dataset.pattern_extent(), ImageExtent::new(3, 1));
    assert_eq!(dataset.processed_bad_pixels().dim(), (1, 3));

    let data = dataset
        .create_array_loader(Arc::clone(&source.arrays()[0]))
        .unwrap()
        .load()
        .unwrap();
    dataset.assemble_array(data).unwrap();

    let patterns = dataset.assembled_patterns().unwrap();
    assert_eq!(patterns.dim(), (2, 1, 3));
    assert_eq!(patterns[[1, 0, 1]], 4);
    assert_eq!(dataset.assembled_pattern_counts(), vec![0, 4]);
}

#[test]
fn test_raw_reload_ignores_processor() {
    let settings = DatasetSettings::default()
        .with_processor(ProcessorConfig::default().with_binning(2, 2));
    let (_manager, mut dataset) = new_dataset(settings);
    dataset.reload(&make_source(&[1]), false).unwrap();
    assert!(!dataset.is_processed());
    assert_eq!(dataset.pattern_extent(), ImageExtent::new(2, 2));
}

#[test]
fn test_memmap_backend() {
    let scratch = TempDir::new().unwrap();
    let settings = DatasetSettings::default()
        .with_memmap(true)
        .with_scratch_directory(scratch.path())
        .with_num_data_threads(2);
    let (manager, mut dataset) = new_dataset(settings);

    dataset.reload(&make_source(&[2, 3]), true).unwrap();
    assert_eq!(dataset.buffer_backend(), BufferBackend::Mapped);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 1);

    manager.start().unwrap();
    dataset.load_all_arrays();
    manager.stop(true);
    dataset.process_foreground_tasks();

    assert_eq!(dataset.assembled_indexes(), vec![0, 1, 2, 3, 4]);
    assert_eq!(dataset.get(1).unwrap().patterns()[[2, 1, 1]], 4);

    dataset.clear();
    assert_eq!(dataset.buffer_backend(), BufferBackend::Heap);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn test_bad_pixels_from_source_dataset() {
    let (_manager, mut dataset) = new_dataset(DatasetSettings::default());
    let mut bad = ndarray::Array2::from_elem((2, 2), false);
    bad[[1, 1]] = true;
    let source = make_source(&[1, 1]).with_bad_pixels(bad.clone());

    dataset.reload(&source, true).unwrap();
    assert_eq!(dataset.processed_bad_pixels(), &bad);

    let data = dataset
        .create_array_loader(Arc::clone(&source.arrays()[1]))
        .unwrap()
        .load()
        .unwrap();
    dataset.assemble_array(data).unwrap();
    assert_eq!(dataset.assembled_pattern_counts(), vec![3]);
}
