//! diffpix-assembly: Concurrent assembly of diffraction arrays.
//!
//! This crate provides the two-queue [`TaskManager`], the load tasks that
//! read and process raw arrays on a bounded thread pool, and the
//! [`AssembledDataset`] that collects their results into one index-ordered
//! pattern buffer.
//!

pub mod dataset;
mod error;
pub mod loader;
pub mod observer;
pub mod settings;
pub mod task;

pub use dataset::{AssembledArrayView, AssembledDataset};
pub use error::{Error, Result};
pub use loader::{
    count_good_pixels, insert_array, ArrayLoadTask, AssembledDiffractionData, LoadAllArrays,
    LoadCounts, LoadStatus,
};
pub use observer::DatasetObserver;
pub use settings::DatasetSettings;
pub use task::{BackgroundTask, ForegroundSender, ForegroundTask, TaskManager};
