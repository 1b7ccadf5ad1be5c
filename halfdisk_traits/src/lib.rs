use std::io::Result;
use std::path::Path;

/// Data location meaning "no data stored for this key". Chunk storage is
/// zero-filled, so a never-written index slot reads back as this value.
pub const NON_EXISTENT_DATA_LOCATION: i64 = 0;

/// A growable long-indexed array with compare-and-swap semantics.
///
/// Implemented by the long index family in `halfdisk_core`. The map holds
/// its bucket location index behind this trait so the backing storage
/// (off-heap memory or a temp file) can be picked at runtime.
pub trait CasLongIndex: Send + Sync {
    /// Reads the value at `index`, or [`NON_EXISTENT_DATA_LOCATION`] if the
    /// slot was never written or its chunk has been released.
    ///
    /// Panics if `index` is outside `[0, capacity)`.
    fn get(&self, index: u64) -> Result<i64>;

    /// Writes `value` at `index`, allocating backing chunks as needed.
    ///
    /// Panics if `index` is outside `[0, capacity)`.
    fn put(&self, index: u64, value: i64) -> Result<()>;

    /// Atomically replaces the value at `index` with `new_value` if the
    /// current value equals `old_value`. Returns true if the swap happened.
    fn put_if_equal(&self, index: u64, old_value: i64, new_value: i64) -> Result<bool>;

    /// Clears the slot back to [`NON_EXISTENT_DATA_LOCATION`].
    fn remove(&self, index: u64) -> Result<()>;

    /// Current high-water mark: largest written index + 1.
    fn size(&self) -> u64;

    /// Maximum number of entries this index can ever hold.
    fn capacity(&self) -> u64;

    /// Moves the valid index window. Chunks fully outside the window are
    /// released, boundary chunks are zeroed in the excluded sub-range.
    fn update_valid_range(&self, min_valid_index: u64, max_valid_index: u64) -> Result<()>;

    /// Visits every index in the valid window whose chunk exists. The
    /// action returns false to stop early. Safe to call concurrently with
    /// writers; values may be stale.
    fn for_each(&self, action: &mut dyn FnMut(u64, i64) -> bool) -> Result<()>;

    /// Writes a snapshot of this index to `path`.
    fn write_to_file(&self, path: &Path) -> Result<()>;

    /// Bytes of memory held outside the normal allocator, or 0.
    fn off_heap_consumption(&self) -> u64 {
        0
    }
}

/// An append-only, randomly readable blob store keyed by opaque long
/// locations. One write session may be open at a time; data stored during a
/// session becomes readable once the location is handed out.
pub trait DataFileCollection: Send + Sync {
    /// Opens a new data file for writing. Fails if a session is already open.
    fn start_writing(&self) -> Result<()>;

    /// Appends one data item to the current write session and returns its
    /// location. The location is never [`NON_EXISTENT_DATA_LOCATION`].
    fn store_data_item(&self, data: &[u8]) -> Result<i64>;

    /// Seals the current data file and makes it readable. Returns the index
    /// of the file that was written.
    fn end_writing(&self) -> Result<u32>;

    /// Reads the data item at `location`, or None if the location does not
    /// resolve to a stored item.
    fn read_data_item(&self, location: i64) -> Result<Option<Vec<u8>>>;

    /// Looks up `key` in the given index and reads the item it points to.
    fn read_data_item_using_index(
        &self,
        index: &dyn CasLongIndex,
        key: u64,
    ) -> Result<Option<Vec<u8>>> {
        let location = index.get(key)?;
        if location == NON_EXISTENT_DATA_LOCATION {
            return Ok(None);
        }
        self.read_data_item(location)
    }

    /// Tells the collection which key range is currently live. Used by file
    /// maintenance to drop out-of-range items.
    fn update_valid_key_range(&self, min_valid_key: u64, max_valid_key: u64);

    /// Copies all sealed data files into `dir`.
    fn snapshot(&self, dir: &Path) -> Result<()>;

    /// Scans every stored item across all sealed files in file order,
    /// invoking the action with the item's location and payload.
    fn for_each_data_item(&self, action: &mut dyn FnMut(i64, &[u8]) -> Result<()>) -> Result<()>;

    /// Closes all files. Fails if a write session is still open.
    fn close(&self) -> Result<()>;
}

/// An authoritative key source consulted by the map repair pass: given a
/// value previously stored in the map (a path into some record store),
/// returns the key bytes of the record living at that path.
pub trait RecordSource {
    fn key_at(&self, path: i64) -> Result<Option<Vec<u8>>>;
}

pub trait IoContext<T> {
    fn context(self, msg: &str) -> Result<T>;
}

impl<T> IoContext<T> for Result<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| std::io::Error::new(e.kind(), format!("{msg}: {e}")))
    }
}
