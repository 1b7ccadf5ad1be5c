//! A growable list of fixed-size (48 byte) hash records.
//!
//! Structurally a simplified sibling of the long index: the same expanding
//! chunked-buffer layout and the same snapshot header shapes, but records
//! are raw hash bytes and an unwritten slot reads as `None` rather than a
//! sentinel value.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::long_index::{FILE_FORMAT_VERSION_V1, FILE_FORMAT_VERSION_V2};

/// Size of one stored hash (SHA-384).
pub const HASH_SIZE_BYTES: usize = 48;

#[derive(Debug, Clone)]
pub struct HashListConfig {
    /// Hashes per allocated buffer.
    pub hashes_per_buffer: usize,
}

impl Default for HashListConfig {
    fn default() -> Self {
        Self {
            hashes_per_buffer: 1_000_000,
        }
    }
}

type Buffer = Arc<RwLock<Box<[u8]>>>;

#[derive(Debug)]
pub struct HashList {
    capacity: u64,
    size: AtomicU64,
    hashes_per_buffer: usize,
    buffer_size_bytes: usize,
    buffers: RwLock<Vec<Buffer>>,
}

impl HashList {
    pub fn new(capacity: u64, config: &HashListConfig) -> Self {
        Self {
            capacity,
            size: AtomicU64::new(0),
            hashes_per_buffer: config.hashes_per_buffer,
            buffer_size_bytes: config.hashes_per_buffer * HASH_SIZE_BYTES,
            buffers: RwLock::new(Vec::new()),
        }
    }

    /// Loads a hash list snapshot. V2 headers must declare exactly the
    /// requested capacity; legacy V1 headers carry buffer geometry that is
    /// ignored in favor of the provided configuration.
    pub fn from_file(path: &Path, capacity: u64, config: &HashListConfig) -> io::Result<Self> {
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
                            "hash list capacity mismatch, expected={capacity}, loaded={stored_capacity}"
                        ),
                    ));
                }
                size
            }
            FILE_FORMAT_VERSION_V1 => {
                reader.read_u32::<LittleEndian>()?; // hashes per buffer
                reader.read_u64::<LittleEndian>()?; // max hashes
                reader.read_u8()?; // on/off-heap flag
                reader.read_u64::<LittleEndian>()?; // max index
                let size = reader.read_u64::<LittleEndian>()?;
                reader.read_u32::<LittleEndian>()?; // num buffers
                if size > capacity {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("hash list in file is too large, size={size}, capacity={capacity}"),
                    ));
                }
                size
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("hash list file version {other} is not supported"),
                ));
            }
        };

        let list = Self::new(capacity, config);
        list.read_packed_hashes(&mut reader, size)?;
        list.size.store(size, Ordering::Release);
        Ok(list)
    }

    fn read_packed_hashes(&self, reader: &mut impl Read, size: u64) -> io::Result<()> {
        let mut buffers = self.buffers.write();
        let mut remaining = size;
        while remaining > 0 {
            let in_buffer = remaining.min(self.hashes_per_buffer as u64) as usize;
            let mut data = vec![0u8; self.buffer_size_bytes].into_boxed_slice();
            reader.read_exact(&mut data[..in_buffer * HASH_SIZE_BYTES])?;
            buffers.push(Arc::new(RwLock::new(data)));
            remaining -= in_buffer as u64;
        }
        Ok(())
    }

    fn check_index(&self, index: u64) {
        assert!(
            index < self.capacity,
            "index {index} is out of range [0, {})",
            self.capacity
        );
    }

    /// Reads the hash at `index`, or `None` if nothing was stored that high.
    pub fn get(&self, index: u64) -> Option<[u8; HASH_SIZE_BYTES]> {
        self.check_index(index);
        // A racing writer may have bumped size before finishing its copy;
        // reading a half-written slot is acceptable for this structure.
        if index >= self.size() {
            return None;
        }
        let buffer = self.buffers.read()[(index / self.hashes_per_buffer as u64) as usize].clone();
        let offset = (index % self.hashes_per_buffer as u64) as usize * HASH_SIZE_BYTES;
        let data = buffer.read();
        let mut hash = [0u8; HASH_SIZE_BYTES];
        hash.copy_from_slice(&data[offset..offset + HASH_SIZE_BYTES]);
        Some(hash)
    }

    pub fn put(&self, index: u64, hash: &[u8; HASH_SIZE_BYTES]) {
        self.check_index(index);
        let buffer_index = (index / self.hashes_per_buffer as u64) as usize;
        let buffer = {
            let buffers = self.buffers.read();
            buffers.get(buffer_index).cloned()
        };
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                // Append buffers under the growth lock, double-checked.
                let mut buffers = self.buffers.write();
                while buffers.len() <= buffer_index {
                    buffers.push(Arc::new(RwLock::new(
                        vec![0u8; self.buffer_size_bytes].into_boxed_slice(),
                    )));
                }
                buffers[buffer_index].clone()
            }
        };
        self.size.fetch_max(index + 1, Ordering::AcqRel);
        let offset = (index % self.hashes_per_buffer as u64) as usize * HASH_SIZE_BYTES;
        buffer.write()[offset..offset + HASH_SIZE_BYTES].copy_from_slice(hash);
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Writes a V2 snapshot: `[version][size][capacity]` then densely packed
    /// hash bytes.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        let size = self.size();
        writer.write_u32::<LittleEndian>(FILE_FORMAT_VERSION_V2)?;
        writer.write_u64::<LittleEndian>(size)?;
        writer.write_u64::<LittleEndian>(self.capacity)?;

        let buffers = self.buffers.read().clone();
        let mut remaining = size;
        for buffer in buffers {
            if remaining == 0 {
                break;
            }
            let in_buffer = remaining.min(self.hashes_per_buffer as u64) as usize;
            let data = buffer.read();
            writer.write_all(&data[..in_buffer * HASH_SIZE_BYTES])?;
            remaining -= in_buffer as u64;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}
