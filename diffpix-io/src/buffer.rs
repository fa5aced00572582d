//! Pattern storage with heap and scratch-file backends.
//!
//! The assembled pattern buffer may be gigabytes. It is allocated once per
//! dataset reload either on the heap or in a memory-mapped temporary file;
//! callers only see the [`PatternBuffer`] trait.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::{Path, PathBuf};

use diffpix_core::PixelValue;
use log::info;
use memmap2::MmapMut;
use sysinfo::System;
use tempfile::NamedTempFile;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Which storage backs a pattern buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BufferBackend {
    /// Ordinary process memory.
    Heap,
    /// Memory-mapped scratch file.
    Mapped,
}

impl fmt::Display for BufferBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap => f.write_str("heap"),
            Self::Mapped => f.write_str("scratch file"),
        }
    }
}

/// Contiguous, zero-initialised storage for pattern elements.
pub trait PatternBuffer<T: PixelValue>: Send + Sync {
    /// Read access to every element.
    fn as_slice(&self) -> &[T];

    /// Write access to every element.
    fn as_mut_slice(&mut self) -> &mut [T];

    /// Storage behind this buffer.
    fn backend(&self) -> BufferBackend;

    /// Number of elements.
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns true when the buffer holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes.
    fn size_bytes(&self) -> usize {
        self.len() * size_of::<T>()
    }
}

/// Heap-allocated pattern buffer.
#[derive(Debug, Clone, Default)]
pub struct HeapBuffer<T> {
    data: Vec<T>,
}

impl<T: PixelValue> HeapBuffer<T> {
    /// Allocate `len` zeroed elements.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![T::default(); len],
        }
    }

    /// Wrap existing data.
    #[must_use]
    pub fn from_vec(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T: PixelValue> PatternBuffer<T> for HeapBuffer<T> {
    fn as_slice(&self) -> &[T] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    fn backend(&self) -> BufferBackend {
        BufferBackend::Heap
    }
}

/// Pattern buffer backed by a memory-mapped temporary file.
///
/// The scratch file is deleted when the buffer is dropped.
pub struct MappedBuffer<T> {
    mmap: MmapMut,
    file: NamedTempFile,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: PixelValue> MappedBuffer<T> {
    /// Create a zero-filled scratch file of `len` elements in `scratch_dir`
    /// (the system temporary directory when `None`) and map it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created, sized or mapped, or if
    /// `len` is 0.
    pub fn create(len: usize, scratch_dir: Option<&Path>) -> Result<Self> {
        if len == 0 {
            return Err(Error::MmapError(
                "cannot map a zero-length buffer".to_string(),
            ));
        }
        let size_bytes = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| Error::MmapError(format!("buffer of {len} elements is too large")))?;

        let file = match scratch_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        file.as_file().set_len(size_bytes as u64)?;

        // SAFETY: The scratch file is private to this buffer, lives as long as the
        // mapping and is never resized or written through another handle.
        #[allow(unsafe_code)]
        let mut mmap = unsafe { MmapMut::map_mut(file.as_file())? };

        bytemuck::try_cast_slice_mut::<u8, T>(&mut mmap[..size_bytes])
            .map_err(|e| Error::MmapError(format!("unaligned mapping: {e:?}")))?;

        Ok(Self {
            mmap,
            file,
            len,
            _marker: PhantomData,
        })
    }

    /// Path of the backing scratch file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Flush outstanding writes to the scratch file.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

impl<T: PixelValue> PatternBuffer<T> for MappedBuffer<T> {
    fn as_slice(&self) -> &[T] {
        bytemuck::cast_slice(&self.mmap[..self.len * size_of::<T>()])
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        let size_bytes = self.len * size_of::<T>();
        bytemuck::cast_slice_mut(&mut self.mmap[..size_bytes])
    }

    fn backend(&self) -> BufferBackend {
        BufferBackend::Mapped
    }
}

impl<T> fmt::Debug for MappedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("path", &self.file.path())
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Decides where a pattern buffer is allocated.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AllocationPolicy {
    /// Always back the buffer with a scratch file.
    pub memmap_enabled: bool,
    /// Directory for scratch files; the system temporary directory when `None`.
    pub scratch_directory: Option<PathBuf>,
    /// Spill to a scratch file when the buffer exceeds this fraction of
    /// available system memory. Disabled when `None`.
    pub memory_fraction: Option<f64>,
}

impl AllocationPolicy {
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

    /// Resolve the heap budget in bytes, `None` when spilling is disabled.
    ///
    /// # Errors
    /// Returns an error if the memory fraction is invalid or system memory cannot be queried.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn resolve_budget_bytes(&self) -> Result<Option<usize>> {
        let Some(fraction) = self.memory_fraction else {
            return Ok(None);
        };
        if !(0.0 < fraction && fraction <= 1.0) {
            return Err(Error::InvalidFormat(
                "memory_fraction must be in (0.0, 1.0]".to_string(),
            ));
        }
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        if available == 0 {
            return Err(Error::InvalidFormat(
                "available system memory reported as 0".to_string(),
            ));
        }
        let budget = (available as f64 * fraction).floor() as u64;
        Ok(Some(usize::try_from(budget).unwrap_or(usize::MAX)))
    }

    /// Backend a buffer of `size_bytes` would be allocated in.
    ///
    /// # Errors
    /// See [`Self::resolve_budget_bytes`].
    pub fn select_backend(&self, size_bytes: usize) -> Result<BufferBackend> {
        if size_bytes == 0 {
            return Ok(BufferBackend::Heap);
        }
        if self.memmap_enabled {
            return Ok(BufferBackend::Mapped);
        }
        match self.resolve_budget_bytes()? {
            Some(budget) if size_bytes > budget => Ok(BufferBackend::Mapped),
            _ => Ok(BufferBackend::Heap),
        }
    }

    /// Allocate a zeroed buffer of `len` elements.
    ///
    /// # Errors
    /// Returns an error if the scratch file cannot be created or mapped, or
    /// if the memory budget cannot be resolved.
    #[allow(clippy::cast_precision_loss)]
    pub fn allocate<T: PixelValue>(&self, len: usize) -> Result<Box<dyn PatternBuffer<T>>> {
        let size_bytes = len.saturating_mul(size_of::<T>());
        let size_mb = size_bytes as f64 / BYTES_PER_MB;

        match self.select_backend(size_bytes)? {
            BufferBackend::Heap => {
                info!("Allocating {size_mb:.2}MB pattern buffer on the heap");
                Ok(Box::new(HeapBuffer::<T>::zeroed(len)))
            }
            BufferBackend::Mapped => {
                let buffer = MappedBuffer::<T>::create(len, self.scratch_directory.as_deref())?;
                info!(
                    "Allocating {size_mb:.2}MB pattern buffer in scratch file {}",
                    buffer.path().display()
                );
                Ok(Box::new(buffer))
            }
        }
    }
}
