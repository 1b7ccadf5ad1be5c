use std::io;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{ChunkStorage, IMPERMISSIBLE_VALUE};

/// Chunk storage backed by boxed slices of atomic longs on the normal heap.
pub struct HeapChunks {
    longs_per_chunk: usize,
}

impl HeapChunks {
    pub fn new(longs_per_chunk: usize) -> Self {
        Self { longs_per_chunk }
    }
}

impl ChunkStorage for HeapChunks {
    type Chunk = Box<[AtomicI64]>;

    fn create_chunk(&self) -> io::Result<Self::Chunk> {
        Ok((0..self.longs_per_chunk)
            .map(|_| AtomicI64::new(IMPERMISSIBLE_VALUE))
            .collect())
    }

    fn read(&self, chunk: &Self::Chunk, sub_index: usize) -> io::Result<i64> {
        Ok(chunk[sub_index].load(Ordering::Acquire))
    }

    fn write(&self, chunk: &Self::Chunk, sub_index: usize, value: i64) -> io::Result<()> {
        chunk[sub_index].store(value, Ordering::Release);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        chunk: &Self::Chunk,
        sub_index: usize,
        old_value: i64,
        new_value: i64,
    ) -> io::Result<bool> {
        Ok(chunk[sub_index]
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
            chunk.len() - count..chunk.len()
        };
        for cell in &chunk[range] {
            cell.store(IMPERMISSIBLE_VALUE, Ordering::Release);
        }
        Ok(())
    }
}
