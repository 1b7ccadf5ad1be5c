use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use super::{ChunkStorage, IMPERMISSIBLE_VALUE};

/// Chunk storage over manually allocated memory, freed explicitly when a
/// chunk is dropped rather than tracked by any collector. Atomic access goes
/// through [`AtomicI64`] views of the raw allocation; all unsafety is
/// confined to this module.
pub struct OffHeapChunks {
    longs_per_chunk: usize,
    allocated_chunks: Arc<AtomicU64>,
}

impl OffHeapChunks {
    pub fn new(longs_per_chunk: usize) -> Self {
        Self {
            longs_per_chunk,
            allocated_chunks: Arc::new(AtomicU64::new(0)),
        }
    }

    fn layout(&self) -> Layout {
        Layout::array::<i64>(self.longs_per_chunk).expect("chunk layout overflow")
    }
}

pub struct OffHeapChunk {
    ptr: NonNull<AtomicI64>,
    longs: usize,
    allocated_chunks: Arc<AtomicU64>,
}

// The allocation is plain memory accessed through atomics only.
unsafe impl Send for OffHeapChunk {}
unsafe impl Sync for OffHeapChunk {}

impl OffHeapChunk {
    /// Atomic view of one slot. `sub_index` must be within the chunk, which
    /// every caller in the skeleton guarantees via the capacity check.
    fn cell(&self, sub_index: usize) -> &AtomicI64 {
        assert!(sub_index < self.longs);
        // Alignment and initialization are guaranteed by the zeroed
        // i64-array allocation this chunk was created from.
        unsafe { &*self.ptr.as_ptr().add(sub_index) }
    }
}

impl Drop for OffHeapChunk {
    fn drop(&mut self) {
        let layout = Layout::array::<i64>(self.longs).expect("chunk layout overflow");
        unsafe { dealloc(self.ptr.as_ptr().cast(), layout) };
        self.allocated_chunks.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ChunkStorage for OffHeapChunks {
    type Chunk = OffHeapChunk;

    fn create_chunk(&self) -> io::Result<Self::Chunk> {
        let layout = self.layout();
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<AtomicI64>()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("failed to allocate a {} byte chunk", layout.size()),
            )
        })?;
        self.allocated_chunks.fetch_add(1, Ordering::Relaxed);
        Ok(OffHeapChunk {
            ptr,
            longs: self.longs_per_chunk,
            allocated_chunks: self.allocated_chunks.clone(),
        })
    }

    fn read(&self, chunk: &Self::Chunk, sub_index: usize) -> io::Result<i64> {
        Ok(chunk.cell(sub_index).load(Ordering::Acquire))
    }

    fn write(&self, chunk: &Self::Chunk, sub_index: usize, value: i64) -> io::Result<()> {
        chunk.cell(sub_index).store(value, Ordering::Release);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        chunk: &Self::Chunk,
        sub_index: usize,
        old_value: i64,
        new_value: i64,
    ) -> io::Result<bool> {
        Ok(chunk
            .cell(sub_index)
            .compare_exchange(old_value, new_value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    fn partial_cleanup(
        &self,
        chunk: &Self::Chunk,
        left_side: bool,
        count: usize,
    ) -> io::Result<()> {
        let range = if left_side {
            0..count
        } else {
            chunk.longs - count..chunk.longs
        };
        for sub_index in range {
            chunk
                .cell(sub_index)
                .store(IMPERMISSIBLE_VALUE, Ordering::Release);
        }
        Ok(())
    }

    fn off_heap_consumption(&self) -> u64 {
        self.allocated_chunks.load(Ordering::Relaxed) * (self.longs_per_chunk as u64) * 8
    }
}
