//! Pixel element types for diffraction patterns.
//!
//! Patterns keep the native detector dtype end to end. Accumulation
//! (binning, photon counts) happens in that dtype with wrapping integer
//! addition, so an overflowing sum wraps instead of being promoted.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type tag of a pattern buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PatternDtype {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl PatternDtype {
    /// Size of one element in bytes.
    #[must_use]
    pub fn size_bytes(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

impl fmt::Display for PatternDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F32 => "float32",
            Self::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Numeric element of a diffraction pattern.
///
/// Implementors are plain numeric primitives (`bytemuck::Pod`), so a
/// zero-filled scratch file is a valid buffer of zeros and byte slices can be
/// reinterpreted without copying.
pub trait PixelValue:
    bytemuck::Pod + Default + PartialOrd + Send + Sync + fmt::Debug + 'static
{
    /// Dtype tag for this element type.
    const DTYPE: PatternDtype;

    /// Addition in the native type; integers wrap on overflow.
    #[must_use]
    fn accumulate(self, other: Self) -> Self;

    /// Widening conversion used for filtering and averaging.
    fn to_f64(self) -> f64;
}

macro_rules! impl_pixel_int {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl PixelValue for $ty {
                const DTYPE: PatternDtype = PatternDtype::$dtype;

                #[inline]
                fn accumulate(self, other: Self) -> Self {
                    self.wrapping_add(other)
                }

                #[inline]
                #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

macro_rules! impl_pixel_float {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl PixelValue for $ty {
                const DTYPE: PatternDtype = PatternDtype::$dtype;

                #[inline]
                fn accumulate(self, other: Self) -> Self {
                    self + other
                }

                #[inline]
                #[allow(clippy::cast_lossless)]
                fn to_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_pixel_int!(
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
);

impl_pixel_float!(f32 => F32, f64 => F64);
