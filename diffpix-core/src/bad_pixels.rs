//! Bad pixel map provider.

use std::sync::{PoisonError, RwLock};

use ndarray::Array2;

use crate::error::{Error, Result};
use crate::geometry::ImageExtent;

/// Source of the detector bad pixel map (`true` marks a bad pixel).
///
/// The map is read once per dataset reload, never mid-load.
pub trait BadPixelProvider: Send + Sync {
    /// Current bad pixel map, if one has been set.
    fn bad_pixels(&self) -> Option<Array2<bool>>;

    /// Replace the bad pixel map.
    ///
    /// # Errors
    /// Returns an error if the map does not fit the detector.
    fn set_bad_pixels(&self, bad_pixels: Option<Array2<bool>>) -> Result<()>;
}

/// Number of bad pixels in a map.
#[must_use]
pub fn count_bad_pixels(bad_pixels: &Array2<bool>) -> usize {
    bad_pixels.iter().filter(|&&bad| bad).count()
}

/// In-memory bad pixel map, optionally validated against a detector extent.
#[derive(Debug, Default)]
pub struct BadPixelStore {
    detector_extent: Option<ImageExtent>,
    bad_pixels: RwLock<Option<Array2<bool>>>,
}

impl BadPixelStore {
    /// Creates an empty store that accepts maps of any extent.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that only accepts maps of `extent`.
    #[must_use]
    pub fn for_detector(extent: ImageExtent) -> Self {
        Self {
            detector_extent: Some(extent),
            bad_pixels: RwLock::new(None),
        }
    }
}

impl BadPixelProvider for BadPixelStore {
    fn bad_pixels(&self) -> Option<Array2<bool>> {
        self.bad_pixels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_bad_pixels(&self, bad_pixels: Option<Array2<bool>>) -> Result<()> {
        if let (Some(map), Some(expected)) = (bad_pixels.as_ref(), self.detector_extent) {
            let actual = ImageExtent::from_shape(map.dim());
            if actual != expected {
                return Err(Error::ShapeMismatch { expected, actual });
            }
        }

        *self
            .bad_pixels
            .write()
            .unwrap_or_else(PoisonError::into_inner) = bad_pixels;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_rejects_wrong_extent() {
        let store = BadPixelStore::for_detector(ImageExtent::new(4, 2));
        let err = store
            .set_bad_pixels(Some(Array2::from_elem((4, 2), false)))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert!(store.bad_pixels().is_none());
    }

    #[test]
    fn test_store_round_trips_map() {
        let store = BadPixelStore::for_detector(ImageExtent::new(4, 2));
        let mut map = Array2::from_elem((2, 4), false);
        map[[1, 3]] = true;
        store.set_bad_pixels(Some(map.clone())).unwrap();

        let stored = store.bad_pixels().unwrap();
        assert_eq!(stored, map);
        assert_eq!(count_bad_pixels(&stored), 1);

        store.set_bad_pixels(None).unwrap();
        assert!(store.bad_pixels().is_none());
    }
}
