//! Dataset assembly settings.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::thread;

use diffpix_core::ProcessorConfig;
use diffpix_io::{AllocationPolicy, Compression};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn default_num_data_threads() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Settings consumed by [`AssembledDataset`](crate::AssembledDataset).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DatasetSettings {
    /// Always back the pattern buffer with a scratch file.
    pub memmap_enabled: bool,
    /// Directory for scratch files; the system temporary directory when `None`.
    pub scratch_directory: Option<PathBuf>,
    /// Spill to a scratch file when the buffer exceeds this fraction of
    /// available memory.
    pub memory_fraction: Option<f64>,
    /// Worker threads used while loading arrays.
    pub num_data_threads: usize,
    /// Processing applied when patterns are processed.
    pub processor: ProcessorConfig,
    /// Snapshot compression: `none`, `gzip`, `gzip=N` or `lzf`.
    pub compression: String,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            memmap_enabled: false,
            scratch_directory: None,
            memory_fraction: None,
            num_data_threads: default_num_data_threads(),
            processor: ProcessorConfig::default(),
            compression: "lzf".to_string(),
        }
    }
}

impl DatasetSettings {
    /// Enable or disable scratch-file backing.
    #[must_use]
    pub fn with_memmap(mut self, enabled: bool) -> Self {
        self.memmap_enabled = enabled;
        self
    }

    /// Set the scratch directory.
    #[must_use]
    pub fn with_scratch_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_directory = Some(dir.into());
        self
    }

    /// Spill buffers larger than `fraction` of available memory.
    #[must_use]
    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = Some(fraction);
        self
    }

    /// Set the number of load threads.
    ///
    /// Values less than 1 are clamped to 1. Use
    /// [`Self::try_with_num_data_threads`] to surface invalid values as an
    /// error instead.
    #[must_use]
    pub fn with_num_data_threads(mut self, threads: usize) -> Self {
        self.num_data_threads = threads.max(1);
        self
    }

    /// Fallible variant of [`Self::with_num_data_threads`].
    ///
    /// # Errors
    /// Returns an error if `threads` is 0.
    pub fn try_with_num_data_threads(mut self, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::Core(diffpix_core::Error::InvalidConfig(
                "num_data_threads must be at least 1".to_string(),
            )));
        }
        self.num_data_threads = threads;
        Ok(self)
    }

    /// Set the processing configuration.
    #[must_use]
    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }

    /// Set the snapshot compression.
    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression.to_string();
        self
    }

    /// Load thread count, clamped to at least 1.
    #[must_use]
    pub fn effective_num_data_threads(&self) -> usize {
        self.num_data_threads.max(1)
    }

    /// Parsed snapshot compression.
    ///
    /// # Errors
    /// Returns an error if the compression string is not recognised.
    pub fn compression(&self) -> Result<Compression> {
        Ok(self.compression.parse()?)
    }

    /// Buffer allocation policy derived from these settings.
    #[must_use]
    pub fn allocation_policy(&self) -> AllocationPolicy {
        AllocationPolicy {
            memmap_enabled: self.memmap_enabled,
            scratch_directory: self.scratch_directory.clone(),
            memory_fraction: self.memory_fraction,
        }
    }
}
