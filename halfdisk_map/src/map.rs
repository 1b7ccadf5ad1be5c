//! A hash map with the bucket index in RAM and the buckets on disk.
//!
//! Maps opaque byte-string keys to long values. Keeping only the bucket
//! location index in memory makes very large maps possible with a small RAM
//! footprint, and the append-only bucket files avoid random disk writes.
//!
//! A single thread may write at a time, bracketed by [`start_writing`] and
//! [`end_writing`]; any number of threads may read concurrently, including
//! while a flush is running.
//!
//! [`start_writing`]: HalfDiskHashMap::start_writing
//! [`end_writing`]: HalfDiskHashMap::end_writing

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::bounded;
use halfdisk_core::{
    Bucket, BucketMutation, LongIndexDisk, LongIndexOffHeap, ReusableBucketPool, INVALID_VALUE,
};
use halfdisk_store::FileCollection;
use halfdisk_traits::{
    CasLongIndex, DataFileCollection, IoContext, RecordSource, NON_EXISTENT_DATA_LOCATION,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{error, info, warn};

use crate::config::MapConfig;

const METADATA_FILE_FORMAT_VERSION: u32 = 1;
const METADATA_FILENAME_SUFFIX: &str = "_metadata.hdhm";
const BUCKET_INDEX_FILENAME_SUFFIX: &str = "_bucket_index.ll";

pub struct HalfDiskHashMap {
    config: MapConfig,
    store_name: String,
    /// Bucket index -> data file location of the latest copy of the bucket.
    bucket_index_to_bucket_location: Arc<dyn CasLongIndex>,
    file_collection: Arc<dyn DataFileCollection>,
    /// Always a power of two, so the bucket for a hash is `hash & (n - 1)`.
    num_of_buckets: AtomicU32,
    bucket_mask_bits: AtomicU32,
    bucket_pool: ReusableBucketPool,
    /// Thread that called `start_writing`. All writes in the session must
    /// come from it.
    writing_thread: Mutex<Option<ThreadId>>,
    /// Buffered mutations of the current writing session, by bucket index.
    transaction_data: Mutex<Option<HashMap<u32, BucketMutation>>>,
}

impl std::fmt::Debug for HalfDiskHashMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HalfDiskHashMap")
            .field("store_name", &self.store_name)
            .field("num_of_buckets", &self.num_of_buckets)
            .field("bucket_mask_bits", &self.bucket_mask_bits)
            .finish_non_exhaustive()
    }
}

impl HalfDiskHashMap {
    /// Creates a map in `store_dir`, or loads the one already there.
    ///
    /// A fresh map chooses its initial bucket count from `initial_capacity`
    /// divided by the target entries-per-bucket, rounded up to a power of
    /// two (at least 2). An existing store directory must contain a metadata
    /// file; the bucket index is loaded from its snapshot file, or rebuilt
    /// by scanning the data files if the snapshot is missing.
    pub fn new(
        config: MapConfig,
        initial_capacity: u64,
        store_dir: &Path,
        store_name: &str,
    ) -> io::Result<Self> {
        let index_capacity =
            config.max_keys * 2 / config.good_average_bucket_entry_count as u64;
        let metadata_file = store_dir.join(format!("{store_name}{METADATA_FILENAME_SUFFIX}"));
        let index_file = store_dir.join(format!("{store_name}{BUCKET_INDEX_FILENAME_SUFFIX}"));

        let loaded = store_dir.exists();
        let num_of_buckets;
        let bucket_index: Arc<dyn CasLongIndex>;
        let mut rebuild_index = false;
        if loaded {
            if !metadata_file.exists() {
                error!(
                    dir = %store_dir.display(),
                    "Loading existing set of data files but no metadata file was found"
                );
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "can not load an existing map from [{}] because the metadata file is missing",
                        store_dir.display()
                    ),
                ));
            }
            num_of_buckets = read_metadata(&metadata_file)?;
            if index_file.exists() {
                bucket_index = if config.prefer_disk_based_index {
                    Arc::new(LongIndexDisk::disk_from_file(
                        &index_file,
                        index_capacity,
                        &config.index_config,
                    )?)
                } else {
                    Arc::new(LongIndexOffHeap::off_heap_from_file(
                        &index_file,
                        index_capacity,
                        &config.index_config,
                    )?)
                };
            } else {
                warn!(
                    store = store_name,
                    "Bucket index snapshot is missing, rebuilding the index from data files"
                );
                bucket_index = new_bucket_index(&config, index_capacity)?;
                rebuild_index = true;
            }
        } else {
            std::fs::create_dir_all(store_dir)?;
            let minimum_buckets = initial_capacity / config.good_average_bucket_entry_count as u64;
            // Nearest power of two at or above minimum_buckets, at least 2.
            num_of_buckets = (minimum_buckets.max(1) as u32).next_power_of_two().max(2);
            bucket_index = new_bucket_index(&config, index_capacity)?;
            write_metadata(&metadata_file, num_of_buckets)?;
            info!(
                store = store_name,
                minimum_buckets, num_of_buckets, "Created new half-disk hash map"
            );
        }
        bucket_index.update_valid_range(0, num_of_buckets as u64 - 1)?;

        let file_collection = Arc::new(FileCollection::open(store_dir, store_name)?);
        if rebuild_index {
            let mut bucket = Bucket::new();
            file_collection.for_each_data_item(&mut |location, data| {
                bucket.read_from(data)?;
                bucket_index.put(bucket.bucket_index() as u64, location)
            })?;
        }
        file_collection.update_valid_key_range(0, num_of_buckets as u64 - 1);

        let map = Self {
            config,
            store_name: store_name.to_string(),
            bucket_index_to_bucket_location: bucket_index,
            file_collection,
            num_of_buckets: AtomicU32::new(0),
            bucket_mask_bits: AtomicU32::new(0),
            bucket_pool: ReusableBucketPool::new(),
            writing_thread: Mutex::new(None),
            transaction_data: Mutex::new(None),
        };
        map.set_num_of_buckets(num_of_buckets);
        Ok(map)
    }

    /// Closes the map. Data files are closed first, then the index is
    /// dropped, so no file operation can still be running against a closed
    /// index.
    pub fn close(self) -> io::Result<()> {
        self.file_collection.close()
    }

    pub fn num_of_buckets(&self) -> u32 {
        self.num_of_buckets.load(Ordering::Acquire)
    }

    /// Updates the number of buckets and the mask bits. The new value must
    /// be a power of two.
    fn set_num_of_buckets(&self, new_value: u32) {
        debug_assert!(new_value.is_power_of_two());
        self.num_of_buckets.store(new_value, Ordering::Release);
        self.bucket_mask_bits
            .store(new_value.trailing_zeros(), Ordering::Release);
    }

    /// Which bucket a key with the given hash falls into. Relies on the
    /// bucket count being a power of two.
    fn compute_bucket_index(&self, key_hash: u32) -> u32 {
        (self.num_of_buckets() - 1) & key_hash
    }

    pub fn off_heap_consumption(&self) -> u64 {
        self.bucket_index_to_bucket_location.off_heap_consumption()
    }

    pub fn bucket_index_to_bucket_location(&self) -> &dyn CasLongIndex {
        self.bucket_index_to_bucket_location.as_ref()
    }

    pub fn file_collection(&self) -> &dyn DataFileCollection {
        self.file_collection.as_ref()
    }

    /// Logs bucket table stats.
    pub fn print_stats(&self) {
        info!(
            store = %self.store_name,
            num_of_buckets = self.num_of_buckets(),
            good_average_bucket_entry_count = self.config.good_average_bucket_entry_count,
            "HalfDiskHashMap stats"
        );
    }

    /// Writes a consistent snapshot of this map into `snapshot_directory`:
    /// the bucket index, the sealed data files and the metadata.
    pub fn snapshot(&self, snapshot_directory: &Path) -> io::Result<()> {
        std::fs::create_dir_all(snapshot_directory)?;
        self.bucket_index_to_bucket_location.write_to_file(
            &snapshot_directory.join(format!("{}{BUCKET_INDEX_FILENAME_SUFFIX}", self.store_name)),
        )?;
        self.file_collection.snapshot(snapshot_directory)?;
        write_metadata(
            &snapshot_directory.join(format!("{}{METADATA_FILENAME_SUFFIX}", self.store_name)),
            self.num_of_buckets(),
        )
    }

    // --- Writing API, single thread ---

    /// Starts a writing session, pinned to the calling thread. Every
    /// session that buffers at least one mutation produces one new data
    /// file on disk, so writes should be batched.
    pub fn start_writing(&self) {
        *self.transaction_data.lock() = Some(HashMap::new());
        *self.writing_thread.lock() = Some(std::thread::current().id());
    }

    fn check_writing_thread(&self) {
        match *self.writing_thread.lock() {
            Some(id) if id == std::thread::current().id() => {}
            Some(_) => panic!("tried to write with a different thread than start_writing()"),
            None => panic!("tried to write to a HalfDiskHashMap without calling start_writing()"),
        }
    }

    fn with_bucket_mutation(&self, key: &[u8], key_hash: u32, f: impl FnOnce(&mut BucketMutation)) {
        assert!(!key.is_empty(), "can not write an empty key");
        self.check_writing_thread();
        let bucket_index = self.compute_bucket_index(key_hash);
        let mut guard = self.transaction_data.lock();
        let data = guard.as_mut().expect("writing session state is missing");
        f(data.entry(bucket_index).or_default());
    }

    /// Buffers an unconditional put. The value is not readable until
    /// [`Self::end_writing`] commits the session. Putting the same key again
    /// in one session keeps only the last value.
    pub fn put(&self, key: &[u8], key_hash: u32, value: i64) {
        self.with_bucket_mutation(key, key_hash, |m| m.put(key, key_hash, value));
    }

    /// Buffers a conditional put: at flush time the new value is applied
    /// only if the bucket then holds `old_value` for the key. An
    /// `old_value` of [`INVALID_VALUE`] makes this an unconditional put.
    pub fn put_if_equal(&self, key: &[u8], key_hash: u32, old_value: i64, value: i64) {
        if old_value == INVALID_VALUE {
            self.put(key, key_hash, value);
        } else {
            self.with_bucket_mutation(key, key_hash, |m| {
                m.put_if_equal(key, key_hash, old_value, value)
            });
        }
    }

    /// Buffers a delete for the key.
    pub fn delete(&self, key: &[u8], key_hash: u32) {
        self.put(key, key_hash, INVALID_VALUE);
    }

    /// Buffers a conditional delete, applied only if the current value
    /// equals `old_value` at flush time.
    pub fn delete_if_equal(&self, key: &[u8], key_hash: u32, old_value: i64) {
        self.put_if_equal(key, key_hash, old_value, INVALID_VALUE);
    }

    /// Ends the writing session, committing all buffered mutations.
    ///
    /// Returns the index of the data file written, or `None` when the
    /// session had nothing to commit. Any task failure aborts the whole
    /// flush with that error; bucket writes already committed are not
    /// rolled back, and the location index reflects exactly the buckets
    /// stored before the failure.
    pub fn end_writing(&self) -> io::Result<Option<u32>> {
        {
            let mut thread = self.writing_thread.lock();
            match *thread {
                Some(id) if id == std::thread::current().id() => {}
                Some(_) => {
                    panic!("tried calling end_writing with a different thread than start_writing()")
                }
                None => panic!("tried calling end_writing without calling start_writing()"),
            }
            *thread = None;
        }
        let data = self
            .transaction_data
            .lock()
            .take()
            .expect("writing session state is missing");
        if data.is_empty() {
            return Ok(None);
        }
        let changed_keys: usize = data.values().map(BucketMutation::size).sum();
        info!(
            store = %self.store_name,
            changed_buckets = data.len(),
            changed_keys,
            "Finishing write session"
        );
        self.file_collection.start_writing()?;
        self.flush(data)?;
        let file_index = self.file_collection.end_writing()?;
        info!(
            store = %self.store_name,
            new_file = file_index,
            max_valid_bucket = self.num_of_buckets() - 1,
            "Finished write session"
        );
        Ok(Some(file_index))
    }

    /// The flush pipeline. Read-update workers load and mutate buckets in
    /// parallel, bounded by `max_in_flight_buckets`; the calling thread is
    /// the single store stage, persisting buckets strictly one at a time in
    /// the order they become ready, as the append-only file demands.
    fn flush(&self, data: HashMap<u32, BucketMutation>) -> io::Result<()> {
        let total = data.len();
        let worker_count = self.config.flush_threads.clamp(1, total);
        let (work_tx, work_rx) = bounded::<(u32, BucketMutation)>(self.config.max_in_flight_buckets);
        let (ready_tx, ready_rx) = bounded::<io::Result<Bucket>>(self.config.max_in_flight_buckets);

        let mut first_error: Option<io::Error> = None;
        std::thread::scope(|s| {
            for _ in 0..worker_count {
                let work_rx = work_rx.clone();
                let ready_tx = ready_tx.clone();
                s.spawn(move || {
                    for (bucket_index, mutation) in work_rx.iter() {
                        let result = self.read_and_update_bucket(bucket_index, &mutation);
                        let failed = result.is_err();
                        if ready_tx.send(result).is_err() || failed {
                            break;
                        }
                    }
                });
            }
            drop(work_rx);
            drop(ready_tx);
            // The feeder blocks once max_in_flight_buckets mutations are
            // queued, and unblocks as the store stage drains buckets.
            s.spawn(move || {
                for item in data {
                    if work_tx.send(item).is_err() {
                        break;
                    }
                }
            });
            for _ in 0..total {
                match ready_rx.recv() {
                    Ok(Ok(bucket)) => {
                        if let Err(e) = self.store_bucket(&bucket) {
                            first_error = Some(e);
                            break;
                        }
                        self.bucket_pool.release_bucket(bucket);
                    }
                    Ok(Err(e)) => {
                        first_error = Some(e);
                        break;
                    }
                    Err(_) => {
                        first_error = Some(io::Error::other("flush workers exited unexpectedly"));
                        break;
                    }
                }
            }
            // Dropping the receiver fails all pending sends, so workers and
            // the feeder wind down instead of blocking on full channels.
            drop(ready_rx);
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reads the current copy of a bucket (or starts an empty one) and
    /// replays the buffered mutations onto it.
    fn read_and_update_bucket(
        &self,
        bucket_index: u32,
        mutation: &BucketMutation,
    ) -> io::Result<Bucket> {
        let bucket_data = self
            .file_collection
            .read_data_item_using_index(
                self.bucket_index_to_bucket_location.as_ref(),
                bucket_index as u64,
            )
            .context("failed to read bucket")?;
        let mut bucket = self.bucket_pool.get_bucket();
        match bucket_data {
            None => bucket.set_bucket_index(bucket_index),
            Some(data) => {
                bucket.read_from(&data)?;
                if bucket.bucket_index() & bucket_index != bucket.bucket_index() {
                    // A corrupted snapshot can leave a bucket stored under
                    // the wrong slot. The contents are garbage for this
                    // slot, so reuse the bucket empty instead of failing
                    // the whole flush.
                    error!(
                        store = %self.store_name,
                        expected = bucket_index,
                        loaded = bucket.bucket_index(),
                        "Bucket index integrity check failed, clearing bucket"
                    );
                    bucket.clear();
                    bucket.set_bucket_index(bucket_index);
                }
                // Drop entries stranded here by a resize.
                bucket.sanitize(bucket_index, self.bucket_mask_bits.load(Ordering::Acquire));
            }
        }
        mutation.apply_to(&mut bucket);
        Ok(bucket)
    }

    /// Persists one updated bucket. A bucket that ended up empty loses its
    /// index entry instead of being written out. The index is updated only
    /// after the bucket bytes are stored, so readers never chase a location
    /// into an unfinished write.
    fn store_bucket(&self, bucket: &Bucket) -> io::Result<()> {
        let bucket_index = bucket.bucket_index() as u64;
        if bucket.is_empty() {
            self.bucket_index_to_bucket_location.remove(bucket_index)
        } else {
            let bytes = bucket.to_bytes()?;
            let location = self.file_collection.store_data_item(&bytes)?;
            self.bucket_index_to_bucket_location.put(bucket_index, location)
        }
    }

    // --- Reading API, any thread ---

    /// Gets the value for a key, or `not_found_value` if the map holds no
    /// entry for it. Safe to call concurrently with a running flush.
    pub fn get(&self, key: &[u8], key_hash: u32, not_found_value: i64) -> io::Result<i64> {
        assert!(!key.is_empty(), "can not get an empty key");
        let bucket_index = self.compute_bucket_index(key_hash);
        let bucket_data = self.file_collection.read_data_item_using_index(
            self.bucket_index_to_bucket_location.as_ref(),
            bucket_index as u64,
        )?;
        match bucket_data {
            None => Ok(not_found_value),
            Some(data) => {
                let mut bucket = self.bucket_pool.get_bucket();
                bucket.read_from(&data)?;
                let value = bucket.find_value(key_hash, key, not_found_value);
                self.bucket_pool.release_bucket(bucket);
                Ok(value)
            }
        }
    }

    // --- Resize ---

    /// Doubles the bucket table if the projected entry count exceeds 70% of
    /// the target average per bucket.
    ///
    /// Each old bucket's location is copied to its new sibling slot; the
    /// actual entry migration happens lazily, the next time either bucket
    /// is flushed and sanitized under the wider mask.
    pub fn resize_if_needed(&self, first_path: i64, last_path: i64) -> io::Result<()> {
        let current_size = (last_path - first_path + 1) as u64;
        let num_of_buckets = self.num_of_buckets();
        if current_size / num_of_buckets as u64 * 100
            <= self.config.good_average_bucket_entry_count as u64 * 70
        {
            return Ok(());
        }

        let old_size = num_of_buckets;
        let new_size = old_size * 2;
        info!(store = %self.store_name, new_size, "Resizing bucket table");

        let index = self.bucket_index_to_bucket_location.as_ref();
        index.update_valid_range(0, new_size as u64 - 1)?;
        for i in 0..old_size as u64 {
            let value = index.get(i)?;
            if value != NON_EXISTENT_DATA_LOCATION {
                index.put(i + old_size as u64, value)?;
            }
        }
        self.file_collection
            .update_valid_key_range(0, new_size as u64 - 1);

        self.set_num_of_buckets(new_size);
        info!(store = %self.store_name, new_size, "Resizing bucket table done");
        Ok(())
    }

    // --- Repair ---

    /// Removes stale and unknown keys using the given record source as the
    /// authority. Every entry's value must be a path in
    /// `[first_path, last_path]` and the record at that path must still
    /// carry the same key; violations are deleted through a normal write
    /// session. Fails if the surviving entry count does not match the
    /// expected path range.
    pub fn repair(
        &self,
        first_path: i64,
        last_path: i64,
        source: &dyn RecordSource,
    ) -> io::Result<()> {
        info!(
            store = %self.store_name,
            first_path, last_path, "Repairing map, checking all bucket entries"
        );
        let bucket_count = self.num_of_buckets();
        let bucket_mask = bucket_count - 1;
        let index = self.bucket_index_to_bucket_location.as_ref();
        let mut started_writing = false;
        let mut live_entries = 0u64;
        for bucket_id in 0..bucket_count {
            let location = index.get(bucket_id as u64)?;
            if location == NON_EXISTENT_DATA_LOCATION {
                continue;
            }
            let bucket_data = match self.file_collection.read_data_item(location)? {
                Some(data) => data,
                None => {
                    warn!(bucket_id, location, "Deleting bucket (data not found)");
                    index.remove(bucket_id as u64)?;
                    continue;
                }
            };
            let mut bucket = self.bucket_pool.get_bucket();
            bucket.read_from(&bucket_data)?;
            let loaded_bucket_id = bucket.bucket_index();
            // An old bucket written before a resize is fine; anything else
            // under this slot is stale garbage.
            if loaded_bucket_id & bucket_id != loaded_bucket_id {
                warn!(bucket_id, loaded_bucket_id, "Deleting bucket (stale)");
                index.remove(bucket_id as u64)?;
                self.bucket_pool.release_bucket(bucket);
                continue;
            }
            let mut to_delete: Vec<(Vec<u8>, u32)> = Vec::new();
            bucket.for_each_entry(|entry| {
                let path = entry.value;
                let remove_key = if path < first_path || path > last_path {
                    warn!(path, "Deleting key (path out of range)");
                    true
                } else if entry.key_hash & loaded_bucket_id != loaded_bucket_id {
                    warn!(path, "Deleting key (hash code mismatch)");
                    true
                } else {
                    match source.key_at(path) {
                        Ok(Some(record_key)) => {
                            if record_key != entry.key {
                                warn!(path, "Deleting key (stale)");
                                true
                            } else {
                                false
                            }
                        }
                        Ok(None) => {
                            error!(path, "Record not found in the record source");
                            return;
                        }
                        Err(e) => {
                            error!(bucket_id, path, "Failed to check bucket entry: {e}");
                            return;
                        }
                    }
                };
                if remove_key {
                    to_delete.push((entry.key.clone(), entry.key_hash));
                } else if entry.key_hash & bucket_mask == bucket_id {
                    live_entries += 1;
                }
            });
            self.bucket_pool.release_bucket(bucket);
            for (key, key_hash) in to_delete {
                if !started_writing {
                    self.start_writing();
                    started_writing = true;
                }
                self.delete(&key, key_hash);
            }
        }
        if started_writing {
            self.end_writing()?;
        }
        let expected_entries = (last_path - first_path + 1) as u64;
        if live_entries != expected_entries {
            return Err(io::Error::other(format!(
                "map repair failed, expected keys = {expected_entries}, actual = {live_entries}"
            )));
        }
        Ok(())
    }
}

fn new_bucket_index(config: &MapConfig, capacity: u64) -> io::Result<Arc<dyn CasLongIndex>> {
    let index: Arc<dyn CasLongIndex> = if config.prefer_disk_based_index {
        Arc::new(LongIndexDisk::disk(capacity, &config.index_config)?)
    } else {
        Arc::new(LongIndexOffHeap::off_heap(capacity, &config.index_config))
    };
    Ok(index)
}

fn write_metadata(path: &PathBuf, num_of_buckets: u32) -> io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    let mut buf = Vec::with_capacity(12);
    buf.write_u32::<LittleEndian>(METADATA_FILE_FORMAT_VERSION)?;
    buf.write_u32::<LittleEndian>(0)?; // reserved
    buf.write_u32::<LittleEndian>(num_of_buckets)?;
    file.write_all(&buf)?;
    file.sync_all()
}

fn read_metadata(path: &PathBuf) -> io::Result<u32> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = [0u8; 12];
    file.read_exact(&mut buf)?;
    let mut cursor = &buf[..];
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != METADATA_FILE_FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "tried to read a metadata file with incompatible format version [{version}], expected [{METADATA_FILE_FORMAT_VERSION}]"
            ),
        ));
    }
    cursor.read_u32::<LittleEndian>()?; // reserved
    cursor.read_u32::<LittleEndian>()
}
