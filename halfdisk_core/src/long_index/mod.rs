//! Growable long-indexed arrays that allocate fixed-size chunks on demand.
//!
//! One generic skeleton ([`LongIndex`]) owns chunk bookkeeping, the valid
//! index window and file (de)serialization; the storage backends only know
//! how to represent a chunk and how to read, write and CAS a single slot.

mod disk;
mod heap;
mod off_heap;

pub use disk::DiskChunks;
pub use heap::HeapChunks;
pub use off_heap::OffHeapChunks;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use halfdisk_traits::CasLongIndex;
use parking_lot::RwLock;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Value a slot reads back as when it was never written, or after its chunk
/// was released. Chunk storage is zero-filled, so this must stay 0.
pub const IMPERMISSIBLE_VALUE: i64 = 0;

pub const FILE_FORMAT_VERSION_V1: u32 = 1;
pub const FILE_FORMAT_VERSION_V2: u32 = 2;

#[derive(Debug, Clone)]
pub struct LongIndexConfig {
    /// Slots per chunk. One chunk is the allocation granularity.
    pub longs_per_chunk: usize,
    /// Number of slots below the minimum valid index whose chunks are kept
    /// alive, so a window that slides back a little does not thrash.
    pub reserved_buffer_length: u64,
}

impl Default for LongIndexConfig {
    fn default() -> Self {
        Self {
            // 1 MiB chunks
            longs_per_chunk: (1 << 20) / 8,
            reserved_buffer_length: 256 * 1024,
        }
    }
}

/// Storage backend for [`LongIndex`] chunks.
///
/// `read`/`write`/`compare_and_swap` must be atomic with respect to each
/// other for the same slot. Bulk variants are only used by serialization,
/// which runs without concurrent writers.
pub trait ChunkStorage: Send + Sync {
    type Chunk: Send + Sync;

    fn create_chunk(&self) -> io::Result<Self::Chunk>;

    /// Reclaims storage-level resources for a chunk that left the valid
    /// window. The chunk value itself is dropped by the caller.
    fn release_chunk(&self, _chunk: &Self::Chunk) -> io::Result<()> {
        Ok(())
    }

    fn read(&self, chunk: &Self::Chunk, sub_index: usize) -> io::Result<i64>;

    fn write(&self, chunk: &Self::Chunk, sub_index: usize, value: i64) -> io::Result<()>;

    fn compare_and_swap(
        &self,
        chunk: &Self::Chunk,
        sub_index: usize,
        old_value: i64,
        new_value: i64,
    ) -> io::Result<bool>;

    fn write_bulk(&self, chunk: &Self::Chunk, start: usize, values: &[i64]) -> io::Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.write(chunk, start + i, *value)?;
        }
        Ok(())
    }

    fn read_bulk(&self, chunk: &Self::Chunk, start: usize, out: &mut [i64]) -> io::Result<()> {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read(chunk, start + i)?;
        }
        Ok(())
    }

    /// Zeroes `count` slots at the left or right edge of the chunk.
    fn partial_cleanup(&self, chunk: &Self::Chunk, left_side: bool, count: usize)
        -> io::Result<()>;

    fn off_heap_consumption(&self) -> u64 {
        0
    }
}

/// A long-indexed array that grows by fixed-size chunks.
///
/// Reads and writes are safe from any number of threads. Chunk allocation is
/// double-checked under a growth lock; the read path only takes the chunk
/// list read lock.
pub struct LongIndex<S: ChunkStorage> {
    storage: S,
    longs_per_chunk: usize,
    reserved_buffer_length: u64,
    capacity: u64,
    size: AtomicU64,
    min_valid_index: AtomicU64,
    max_valid_index: AtomicU64,
    chunks: RwLock<Vec<Option<Arc<S::Chunk>>>>,
}

impl<S: ChunkStorage> std::fmt::Debug for LongIndex<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongIndex")
            .field("longs_per_chunk", &self.longs_per_chunk)
            .field("reserved_buffer_length", &self.reserved_buffer_length)
            .field("capacity", &self.capacity)
            .field("size", &self.size)
            .field("min_valid_index", &self.min_valid_index)
            .field("max_valid_index", &self.max_valid_index)
            .finish_non_exhaustive()
    }
}

pub type LongIndexHeap = LongIndex<HeapChunks>;
pub type LongIndexOffHeap = LongIndex<OffHeapChunks>;
pub type LongIndexDisk = LongIndex<DiskChunks>;

impl LongIndex<HeapChunks> {
    pub fn heap(capacity: u64, config: &LongIndexConfig) -> Self {
        Self::with_storage(capacity, config, HeapChunks::new(config.longs_per_chunk))
    }

    pub fn heap_from_file(path: &Path, capacity: u64, config: &LongIndexConfig) -> io::Result<Self> {
        Self::from_file(path, capacity, config, HeapChunks::new(config.longs_per_chunk))
    }
}

impl LongIndex<OffHeapChunks> {
    pub fn off_heap(capacity: u64, config: &LongIndexConfig) -> Self {
        Self::with_storage(capacity, config, OffHeapChunks::new(config.longs_per_chunk))
    }

    pub fn off_heap_from_file(
        path: &Path,
        capacity: u64,
        config: &LongIndexConfig,
    ) -> io::Result<Self> {
        Self::from_file(path, capacity, config, OffHeapChunks::new(config.longs_per_chunk))
    }
}

impl LongIndex<DiskChunks> {
    pub fn disk(capacity: u64, config: &LongIndexConfig) -> io::Result<Self> {
        Ok(Self::with_storage(
            capacity,
            config,
            DiskChunks::new(config.longs_per_chunk)?,
        ))
    }

    pub fn disk_from_file(path: &Path, capacity: u64, config: &LongIndexConfig) -> io::Result<Self> {
        Self::from_file(path, capacity, config, DiskChunks::new(config.longs_per_chunk)?)
    }
}

impl<S: ChunkStorage> LongIndex<S> {
    fn with_storage(capacity: u64, config: &LongIndexConfig, storage: S) -> Self {
        let num_chunks = Self::chunk_count(capacity, config.longs_per_chunk);
        Self {
            storage,
            longs_per_chunk: config.longs_per_chunk,
            reserved_buffer_length: config.reserved_buffer_length,
            capacity,
            size: AtomicU64::new(0),
            min_valid_index: AtomicU64::new(0),
            max_valid_index: AtomicU64::new(capacity.saturating_sub(1)),
            chunks: RwLock::new(vec![None; num_chunks]),
        }
    }

    /// Loads a snapshot previously produced by [`Self::write_to_file`].
    ///
    /// The current (V2) header declares the stored size and capacity; the
    /// capacity must match exactly. The legacy V1 header also carries chunk
    /// geometry and on/off-heap flags, which are ignored in favor of the
    /// live configuration.
    pub fn from_file(
        path: &Path,
        capacity: u64,
        config: &LongIndexConfig,
        storage: S,
    ) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(file);

        let version = reader.read_u32::<LittleEndian>()?;
        let size = match version {
            FILE_FORMAT_VERSION_V2 => {
                let size = reader.read_u64::<LittleEndian>()?;
                let stored_capacity = reader.read_u64::<LittleEndian>()?;
                if stored_capacity != capacity {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "long index capacity mismatch, expected={capacity}, loaded={stored_capacity}"
                        ),
                    ));
                }
                size
            }
            FILE_FORMAT_VERSION_V1 => {
                reader.read_u32::<LittleEndian>()?; // longs per chunk, superseded by config
                reader.read_u64::<LittleEndian>()?; // max count
                reader.read_u8()?; // on/off-heap flag
                reader.read_u64::<LittleEndian>()?; // max index
                let size = reader.read_u64::<LittleEndian>()?;
                reader.read_u32::<LittleEndian>()?; // num buffers
                if size > capacity {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("long index in file is too large, size={size}, capacity={capacity}"),
                    ));
                }
                size
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("long index file version {other} is not supported"),
                ));
            }
        };

        let index = Self::with_storage(capacity, config, storage);
        index.read_packed_values(&mut reader, size)?;
        index.size.store(size, Ordering::Release);
        Ok(index)
    }

    fn read_packed_values(&self, reader: &mut impl Read, size: u64) -> io::Result<()> {
        let mut chunks = self.chunks.write();
        let mut remaining = size;
        let mut chunk_index = 0usize;
        let mut buf = vec![0i64; self.longs_per_chunk];
        while remaining > 0 {
            let in_chunk = remaining.min(self.longs_per_chunk as u64) as usize;
            for slot in buf[..in_chunk].iter_mut() {
                *slot = reader.read_i64::<LittleEndian>()?;
            }
            let chunk = self.storage.create_chunk()?;
            self.storage.write_bulk(&chunk, 0, &buf[..in_chunk])?;
            chunks[chunk_index] = Some(Arc::new(chunk));
            chunk_index += 1;
            remaining -= in_chunk as u64;
        }
        Ok(())
    }

    fn chunk_count(entries: u64, longs_per_chunk: usize) -> usize {
        (entries.div_ceil(longs_per_chunk as u64)) as usize
    }

    fn check_index(&self, index: u64) {
        assert!(
            index < self.capacity,
            "index {index} is out of range [0, {})",
            self.capacity
        );
    }

    fn chunk_for(&self, chunk_index: usize) -> Option<Arc<S::Chunk>> {
        self.chunks.read().get(chunk_index).and_then(Clone::clone)
    }

    /// Returns the chunk covering `chunk_index`, allocating it if needed.
    /// Allocation is double-checked so racing writers create it only once.
    fn ensure_chunk(&self, chunk_index: usize) -> io::Result<Arc<S::Chunk>> {
        if let Some(chunk) = self.chunk_for(chunk_index) {
            return Ok(chunk);
        }
        let mut chunks = self.chunks.write();
        if let Some(chunk) = &chunks[chunk_index] {
            return Ok(chunk.clone());
        }
        let chunk = Arc::new(self.storage.create_chunk()?);
        chunks[chunk_index] = Some(chunk.clone());
        Ok(chunk)
    }

    pub fn get(&self, index: u64) -> io::Result<i64> {
        self.check_index(index);
        let chunk_index = (index / self.longs_per_chunk as u64) as usize;
        match self.chunk_for(chunk_index) {
            Some(chunk) => self
                .storage
                .read(&chunk, (index % self.longs_per_chunk as u64) as usize),
            None => Ok(IMPERMISSIBLE_VALUE),
        }
    }

    pub fn put(&self, index: u64, value: i64) -> io::Result<()> {
        self.check_index(index);
        let chunk = self.ensure_chunk((index / self.longs_per_chunk as u64) as usize)?;
        self.storage
            .write(&chunk, (index % self.longs_per_chunk as u64) as usize, value)?;
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        Ok(())
    }

    pub fn put_if_equal(&self, index: u64, old_value: i64, new_value: i64) -> io::Result<bool> {
        self.check_index(index);
        let chunk_index = (index / self.longs_per_chunk as u64) as usize;
        let chunk = match self.chunk_for(chunk_index) {
            Some(chunk) => chunk,
            // An absent chunk reads as the impermissible value, so the swap
            // can only succeed when that is the expected old value.
            None if old_value != IMPERMISSIBLE_VALUE => return Ok(false),
            None => self.ensure_chunk(chunk_index)?,
        };
        let swapped = self.storage.compare_and_swap(
            &chunk,
            (index % self.longs_per_chunk as u64) as usize,
            old_value,
            new_value,
        )?;
        if swapped {
            self.size.fetch_max(index + 1, Ordering::AcqRel);
        }
        Ok(swapped)
    }

    pub fn remove(&self, index: u64) -> io::Result<()> {
        self.check_index(index);
        let chunk_index = (index / self.longs_per_chunk as u64) as usize;
        // Nothing to clear if the chunk was never allocated.
        if let Some(chunk) = self.chunk_for(chunk_index) {
            self.storage.write(
                &chunk,
                (index % self.longs_per_chunk as u64) as usize,
                IMPERMISSIBLE_VALUE,
            )?;
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn min_valid_index(&self) -> u64 {
        self.min_valid_index.load(Ordering::Acquire)
    }

    pub fn max_valid_index(&self) -> u64 {
        self.max_valid_index.load(Ordering::Acquire)
    }

    /// Moves the valid index window to `[min_valid_index, max_valid_index]`.
    ///
    /// Chunks that fall entirely outside the window (keeping
    /// `reserved_buffer_length` slots of slack below the minimum) are
    /// released; boundary chunks are zeroed in the excluded sub-range only.
    pub fn update_valid_range(&self, min_valid_index: u64, max_valid_index: u64) -> io::Result<()> {
        assert!(
            min_valid_index <= max_valid_index,
            "invalid range [{min_valid_index}, {max_valid_index}]"
        );
        assert!(
            max_valid_index < self.capacity,
            "max valid index {max_valid_index} is out of range [0, {})",
            self.capacity
        );
        self.min_valid_index.store(min_valid_index, Ordering::Release);
        self.max_valid_index.store(max_valid_index, Ordering::Release);

        let lpc = self.longs_per_chunk as u64;
        let keep_from = min_valid_index.saturating_sub(self.reserved_buffer_length);
        let first_needed_chunk = (keep_from / lpc) as usize;
        let last_needed_chunk = (max_valid_index / lpc) as usize;

        let mut released = Vec::new();
        {
            let mut chunks = self.chunks.write();
            for (i, slot) in chunks.iter_mut().enumerate() {
                if (i < first_needed_chunk || i > last_needed_chunk) && slot.is_some() {
                    released.push(slot.take().unwrap());
                }
            }
        }
        for chunk in &released {
            self.storage.release_chunk(chunk)?;
        }
        drop(released);

        // Zero the excluded sub-ranges of the two boundary chunks.
        let left_excluded = keep_from % lpc;
        if left_excluded > 0 {
            if let Some(chunk) = self.chunk_for(first_needed_chunk) {
                self.storage
                    .partial_cleanup(&chunk, true, left_excluded as usize)?;
            }
        }
        let right_excluded = lpc - 1 - (max_valid_index % lpc);
        if right_excluded > 0 {
            if let Some(chunk) = self.chunk_for(last_needed_chunk) {
                self.storage
                    .partial_cleanup(&chunk, false, right_excluded as usize)?;
            }
        }

        self.size.fetch_min(max_valid_index + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Visits every index in the valid window whose chunk exists. Stops when
    /// the action returns false. Concurrent writers are tolerated; observed
    /// values may be stale.
    pub fn for_each(&self, action: &mut dyn FnMut(u64, i64) -> bool) -> io::Result<()> {
        let min = self.min_valid_index();
        let max = self.max_valid_index().min(self.size().saturating_sub(1));
        if self.size() == 0 || min > max {
            return Ok(());
        }
        let lpc = self.longs_per_chunk as u64;
        let mut index = min;
        while index <= max {
            let chunk_index = (index / lpc) as usize;
            let chunk_end = ((chunk_index as u64 + 1) * lpc - 1).min(max);
            match self.chunk_for(chunk_index) {
                Some(chunk) => {
                    while index <= chunk_end {
                        let value = self.storage.read(&chunk, (index % lpc) as usize)?;
                        if !action(index, value) {
                            return Ok(());
                        }
                        index += 1;
                    }
                }
                None => index = chunk_end + 1,
            }
        }
        Ok(())
    }

    /// Writes a V2 snapshot: `[version][size][capacity]` then `size` packed
    /// values, absent slots written as the impermissible value.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        let size = self.size();
        writer.write_u32::<LittleEndian>(FILE_FORMAT_VERSION_V2)?;
        writer.write_u64::<LittleEndian>(size)?;
        writer.write_u64::<LittleEndian>(self.capacity)?;

        let mut buf = vec![0i64; self.longs_per_chunk];
        let mut remaining = size;
        let mut chunk_index = 0usize;
        while remaining > 0 {
            let in_chunk = remaining.min(self.longs_per_chunk as u64) as usize;
            match self.chunk_for(chunk_index) {
                Some(chunk) => self.storage.read_bulk(&chunk, 0, &mut buf[..in_chunk])?,
                None => buf[..in_chunk].fill(IMPERMISSIBLE_VALUE),
            }
            for value in &buf[..in_chunk] {
                writer.write_i64::<LittleEndian>(*value)?;
            }
            chunk_index += 1;
            remaining -= in_chunk as u64;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    pub fn off_heap_consumption(&self) -> u64 {
        self.storage.off_heap_consumption()
    }
}

impl<S: ChunkStorage> CasLongIndex for LongIndex<S> {
    fn get(&self, index: u64) -> io::Result<i64> {
        LongIndex::get(self, index)
    }

    fn put(&self, index: u64, value: i64) -> io::Result<()> {
        LongIndex::put(self, index, value)
    }

    fn put_if_equal(&self, index: u64, old_value: i64, new_value: i64) -> io::Result<bool> {
        LongIndex::put_if_equal(self, index, old_value, new_value)
    }

    fn remove(&self, index: u64) -> io::Result<()> {
        LongIndex::remove(self, index)
    }

    fn size(&self) -> u64 {
        LongIndex::size(self)
    }

    fn capacity(&self) -> u64 {
        LongIndex::capacity(self)
    }

    fn update_valid_range(&self, min_valid_index: u64, max_valid_index: u64) -> io::Result<()> {
        LongIndex::update_valid_range(self, min_valid_index, max_valid_index)
    }

    fn for_each(&self, action: &mut dyn FnMut(u64, i64) -> bool) -> io::Result<()> {
        LongIndex::for_each(self, action)
    }

    fn write_to_file(&self, path: &Path) -> io::Result<()> {
        LongIndex::write_to_file(self, path)
    }

    fn off_heap_consumption(&self) -> u64 {
        LongIndex::off_heap_consumption(self)
    }
}
