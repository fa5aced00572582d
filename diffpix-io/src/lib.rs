//! diffpix-io: Pattern storage and file I/O for diffpix.
//!
//! This crate provides the assembled pattern buffer with heap and
//! memory-mapped scratch-file backends (via memmap2), and HDF5 snapshot and
//! diffraction file I/O behind the `hdf5` feature.
//!

pub mod buffer;
pub mod compression;
mod error;
#[cfg(feature = "hdf5")]
pub mod h5_reader;
#[cfg(feature = "hdf5")]
pub mod snapshot;

pub use buffer::{AllocationPolicy, BufferBackend, HeapBuffer, MappedBuffer, PatternBuffer};
pub use compression::Compression;
pub use error::{Error, Result};
#[cfg(feature = "hdf5")]
pub use h5_reader::{Hdf5DiffractionArray, Hdf5DiffractionReader};
#[cfg(feature = "hdf5")]
pub use snapshot::{
    read_snapshot, read_snapshot_info, write_snapshot, PatternSnapshot, SnapshotInfo,
};
