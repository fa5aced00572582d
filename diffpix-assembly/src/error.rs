//! Error types for diffpix-assembly.

use thiserror::Error;

/// Result type alias for assembly operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Assembly error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] diffpix_core::Error),

    /// Buffer or file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] diffpix_io::Error),

    /// A load result arrived for a dataset generation that no longer exists.
    #[error("stale load result from generation {task_generation} (current {current_generation})")]
    StaleGeneration {
        task_generation: u64,
        current_generation: u64,
    },

    /// An array's range was already written.
    #[error("array {array_index} is already assembled")]
    AlreadyAssembled { array_index: usize },

    /// The array index has no range in the current metadata.
    #[error("array index {array_index} out of range ({num_arrays} arrays)")]
    ArrayOutOfRange {
        array_index: usize,
        num_arrays: usize,
    },

    /// A loaded array does not fill its precomputed range.
    #[error("array {array_index} has {actual} patterns, expected {expected}")]
    SizeMismatch {
        array_index: usize,
        expected: usize,
        actual: usize,
    },

    /// A task panicked.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// The load thread pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Core(diffpix_core::Error::Io(err))
    }
}
