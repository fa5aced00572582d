//! Dataset change notifications.

/// Receives dataset changes. Called only from the thread that drains the
/// foreground queue.
pub trait DatasetObserver: Send + Sync {
    /// The bad pixel map was replaced.
    fn on_bad_pixels_changed(&self, _num_bad_pixels: usize) {}

    /// An assembled array was inserted at `position` in the ordered list.
    fn on_array_inserted(&self, _position: usize) {}

    /// The assembled array at `position` was updated in place.
    fn on_array_changed(&self, _position: usize) {}

    /// The dataset was cleared or reloaded; previously obtained views are gone.
    fn on_dataset_reloaded(&self) {}
}
