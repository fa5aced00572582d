//! diffpix command-line interface.
//!
//! Assembles HDF5 diffraction files into one processed snapshot.
#![allow(clippy::uninlined_format_args, clippy::cast_precision_loss)]

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use diffpix_assembly::{AssembledDataset, DatasetObserver, DatasetSettings, TaskManager};
use diffpix_core::{BadPixelStore, CropCenter, DiffractionDataset, ImageExtent, PixelValue};
use diffpix_io::{read_snapshot_info, Compression, Hdf5DiffractionReader};
use hdf5::types::H5Type;
use log::{debug, info, warn};
use thiserror::Error;

/// How often progress is reported while arrays load.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    DiffpixIo(#[from] diffpix_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] diffpix_core::Error),

    #[error("Assembly error: {0}")]
    Assembly(#[from] diffpix_assembly::Error),

    #[error("Invalid settings file: {0}")]
    Settings(#[from] serde_json::Error),
}

/// Element type the patterns are assembled in.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Dtype {
    U8,
    U16,
    U32,
    I32,
    F32,
    F64,
}

/// Concurrent diffraction dataset assembly.
#[derive(Parser)]
#[command(name = "diffpix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, process and assemble HDF5 diffraction files into a snapshot
    Assemble(AssembleArgs),

    /// Show information about an assembled snapshot
    Info {
        /// Snapshot file
        input: PathBuf,
    },
}

#[derive(Args)]
struct AssembleArgs {
    /// Input HDF5 file(s), one array per file
    #[arg(required = true)]
    input: Vec<PathBuf>,

    /// Output snapshot path
    #[arg(short, long)]
    output: PathBuf,

    /// JSON settings file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dataset path of the pattern stack
    #[arg(long, default_value = diffpix_io::h5_reader::DEFAULT_DATA_PATH)]
    data_path: String,

    /// Dataset path of the pattern indexes (consecutive numbering if absent)
    #[arg(long)]
    indexes_path: Option<String>,

    /// Pattern element type
    #[arg(long, value_enum, default_value = "u16")]
    dtype: Dtype,

    /// Assemble raw patterns, skipping all processing
    #[arg(long)]
    raw: bool,

    /// Crop window centre
    #[arg(long, num_args = 2, value_names = ["X", "Y"], requires = "crop_size")]
    crop_center: Option<Vec<usize>>,

    /// Crop window size
    #[arg(long, num_args = 2, value_names = ["W", "H"], requires = "crop_center")]
    crop_size: Option<Vec<usize>>,

    /// Zero pixels below this value
    #[arg(long)]
    lower: Option<f64>,

    /// Zero pixels at or above this value
    #[arg(long)]
    upper: Option<f64>,

    /// Bin factors
    #[arg(long, num_args = 2, value_names = ["BX", "BY"])]
    bin: Option<Vec<usize>>,

    /// Zero padding on each side
    #[arg(long, num_args = 2, value_names = ["PX", "PY"])]
    pad: Option<Vec<usize>>,

    /// Flip patterns horizontally
    #[arg(long)]
    hflip: bool,

    /// Flip patterns vertically
    #[arg(long)]
    vflip: bool,

    /// Transpose patterns
    #[arg(long)]
    transpose: bool,

    /// Back the assembled buffer with a scratch file
    #[arg(long)]
    memmap: bool,

    /// Directory for scratch files
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Spill to a scratch file above this fraction of available memory
    #[arg(long)]
    memory_fraction: Option<f64>,

    /// Number of load threads
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Snapshot compression: none, gzip, gzip=N or lzf
    #[arg(long)]
    compression: Option<String>,
}

impl AssembleArgs {
    fn settings(&self) -> Result<DatasetSettings> {
        let mut settings = match &self.config {
            Some(path) => {
                info!("Loading settings from {}", path.display());
                serde_json::from_reader(BufReader::new(File::open(path)?))?
            }
            None => DatasetSettings::default(),
        };

        let mut processor = settings.processor.clone();
        if let (Some(center), Some(size)) = (&self.crop_center, &self.crop_size) {
            processor = processor.with_crop(
                CropCenter::new(center[0], center[1]),
                ImageExtent::new(size[0], size[1]),
            );
        }
        if self.lower.is_some() || self.upper.is_some() {
            processor = processor.with_filter(self.lower, self.upper);
        }
        if let Some(bin) = &self.bin {
            processor = processor.try_with_binning(bin[0], bin[1])?;
        }
        if let Some(pad) = &self.pad {
            processor = processor.with_padding(pad[0], pad[1]);
        }
        processor = processor
            .with_hflip(processor.hflip || self.hflip)
            .with_vflip(processor.vflip || self.vflip)
            .with_transpose(processor.transpose || self.transpose);
        settings = settings.with_processor(processor);

        if self.memmap {
            settings = settings.with_memmap(true);
        }
        if let Some(dir) = &self.scratch_dir {
            settings = settings.with_scratch_directory(dir);
        }
        if let Some(fraction) = self.memory_fraction {
            settings = settings.with_memory_fraction(fraction);
        }
        if let Some(threads) = self.threads {
            settings = settings.try_with_num_data_threads(threads)?;
        }
        if let Some(compression) = &self.compression {
            settings = settings.with_compression(compression.parse::<Compression>()?);
        }
        Ok(settings)
    }

    fn reader(&self) -> Hdf5DiffractionReader {
        let reader = Hdf5DiffractionReader::new(&self.data_path);
        match &self.indexes_path {
            Some(path) => reader.with_indexes_path(path),
            None => reader,
        }
    }
}

/// Logs dataset changes at debug level.
struct LogObserver;

impl DatasetObserver for LogObserver {
    fn on_array_inserted(&self, position: usize) {
        debug!("Array inserted at position {position}");
    }

    fn on_dataset_reloaded(&self) {
        debug!("Dataset reloaded");
    }
}

fn assemble<T: PixelValue + H5Type>(args: &AssembleArgs) -> Result<()> {
    let settings = args.settings()?;
    let source = args.reader().read_files::<T, _>(args.input.as_slice())?;

    let manager = Arc::new(TaskManager::new());
    let mut dataset = AssembledDataset::<T>::new(
        Arc::clone(&manager),
        settings,
        Arc::new(BadPixelStore::new()),
    );
    dataset.add_observer(Arc::new(LogObserver));

    let start = Instant::now();
    dataset.reload(&source, !args.raw)?;
    println!("{}", dataset.info_text());

    manager.start()?;
    let status = dataset.load_all_arrays();
    while !status.wait(PROGRESS_INTERVAL) {
        dataset.process_foreground_tasks();
        info!(
            "Assembled {}/{} arrays",
            dataset.len(),
            source.arrays().len()
        );
    }
    manager.stop(true);
    dataset.process_foreground_tasks();

    let counts = status.counts();
    if counts.skipped + counts.failed > 0 {
        warn!(
            "{} arrays skipped, {} failed; their slots are left empty",
            counts.skipped, counts.failed
        );
    }

    dataset.export_assembled_patterns(&args.output)?;
    println!(
        "Assembled {} of {} arrays ({} patterns) in {:.2}s",
        dataset.len(),
        source.arrays().len(),
        dataset.assembled_indexes().len(),
        start.elapsed().as_secs_f64()
    );
    println!("Wrote {}", args.output.display());
    Ok(())
}

fn info(input: &Path) -> Result<()> {
    let info = read_snapshot_info(input)?;
    let size_bytes = std::fs::metadata(input)?.len();

    println!("File: {}", input.display());
    println!(
        "Size: {} bytes ({:.2} MB)",
        size_bytes,
        size_bytes as f64 / 1_000_000.0
    );
    println!("Patterns: {}", info.num_patterns);
    println!("Extent: {}", info.extent);
    println!("Dtype: {}", info.pattern_dtype);
    println!("Bad pixels: {}", info.num_bad_pixels);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Assemble(args) => match args.dtype {
            Dtype::U8 => assemble::<u8>(&args),
            Dtype::U16 => assemble::<u16>(&args),
            Dtype::U32 => assemble::<u32>(&args),
            Dtype::I32 => assemble::<i32>(&args),
            Dtype::F32 => assemble::<f32>(&args),
            Dtype::F64 => assemble::<f64>(&args),
        },
        Commands::Info { input } => info(&input),
    }
}
