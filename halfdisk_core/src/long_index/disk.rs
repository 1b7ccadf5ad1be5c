use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use tempfile::TempDir;

use super::{ChunkStorage, IMPERMISSIBLE_VALUE};

/// Chunk storage backed by a private temporary file. A chunk is a byte
/// offset into that file. Offsets of released chunks go to a free list and
/// are reused before the file is extended; newly appended regions are
/// zero-filled so absent slots read back as the impermissible value.
///
/// The temp file and its directory are removed when this storage is dropped.
pub struct DiskChunks {
    longs_per_chunk: usize,
    chunk_size_bytes: usize,
    file: File,
    _temp_dir: TempDir,
    next_chunk_offset: Mutex<u64>,
    free_chunks: Mutex<Vec<u64>>,
    // Guards the read-compare-write sequence in compare_and_swap. There is
    // no atomicity across processes, only between threads of this one.
    cas_lock: Mutex<()>,
}

impl DiskChunks {
    pub fn new(longs_per_chunk: usize) -> io::Result<Self> {
        let temp_dir = tempfile::Builder::new().prefix("long_index_disk").tempdir()?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(temp_dir.path().join("chunks.ll"))?;
        Ok(Self {
            longs_per_chunk,
            chunk_size_bytes: longs_per_chunk * 8,
            file,
            _temp_dir: temp_dir,
            next_chunk_offset: Mutex::new(0),
            free_chunks: Mutex::new(Vec::new()),
            cas_lock: Mutex::new(()),
        })
    }

    fn zero_region(&self, offset: u64, len: usize) -> io::Result<()> {
        let zeroes = vec![0u8; len];
        self.file.write_all_at(&zeroes, offset)
    }
}

impl ChunkStorage for DiskChunks {
    type Chunk = u64;

    fn create_chunk(&self) -> io::Result<Self::Chunk> {
        if let Some(offset) = self.free_chunks.lock().pop() {
            return Ok(offset);
        }
        let offset = {
            let mut next = self.next_chunk_offset.lock();
            let offset = *next;
            *next += self.chunk_size_bytes as u64;
            offset
        };
        self.zero_region(offset, self.chunk_size_bytes)?;
        Ok(offset)
    }

    fn release_chunk(&self, chunk: &Self::Chunk) -> io::Result<()> {
        self.zero_region(*chunk, self.chunk_size_bytes)?;
        self.free_chunks.lock().push(*chunk);
        Ok(())
    }

    fn read(&self, chunk: &Self::Chunk, sub_index: usize) -> io::Result<i64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, chunk + sub_index as u64 * 8)?;
        Ok(i64::from_le_bytes(buf))
    }

    fn write(&self, chunk: &Self::Chunk, sub_index: usize, value: i64) -> io::Result<()> {
        self.file
            .write_all_at(&value.to_le_bytes(), chunk + sub_index as u64 * 8)
    }

    fn compare_and_swap(
        &self,
        chunk: &Self::Chunk,
        sub_index: usize,
        old_value: i64,
        new_value: i64,
    ) -> io::Result<bool> {
        let _guard = self.cas_lock.lock();
        if self.read(chunk, sub_index)? != old_value {
            return Ok(false);
        }
        self.write(chunk, sub_index, new_value)?;
        Ok(true)
    }

    fn write_bulk(&self, chunk: &Self::Chunk, start: usize, values: &[i64]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(values.len() * 8);
        for value in values {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        self.file.write_all_at(&buf, chunk + start as u64 * 8)
    }

    fn read_bulk(&self, chunk: &Self::Chunk, start: usize, out: &mut [i64]) -> io::Result<()> {
        let mut buf = vec![0u8; out.len() * 8];
        self.file.read_exact_at(&mut buf, chunk + start as u64 * 8)?;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = i64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        }
        Ok(())
    }

    fn partial_cleanup(
        &self,
        chunk: &Self::Chunk,
        left_side: bool,
        count: usize,
    ) -> io::Result<()> {
        debug_assert_eq!(IMPERMISSIBLE_VALUE, 0);
        if left_side {
            self.zero_region(*chunk, count * 8)
        } else {
            let offset = chunk + (self.longs_per_chunk - count) as u64 * 8;
            self.zero_region(offset, count * 8)
        }
    }
}
