//! Bucket records for the half-disk hash map.
//!
//! A bucket holds every key/value entry whose masked hash maps to its index.
//! Buckets are mutable, poolable and serialize to a compact binary layout:
//! `[bucket_index:u32][entry_count:u32]` then per entry
//! `[key_hash:u32][key_len:u32][key bytes][value:i64]`, little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::io::{self, Cursor, Read, Write};

/// Marks an entry for removal, and doubles as "no old value to compare
/// against" in conditional mutations. Never a legal stored value.
pub const INVALID_VALUE: i64 = i64::MIN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub key_hash: u32,
    pub key: Vec<u8>,
    pub value: i64,
}

#[derive(Debug, Default)]
pub struct Bucket {
    bucket_index: u32,
    entries: Vec<BucketEntry>,
}

impl Bucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket_index(&self) -> u32 {
        self.bucket_index
    }

    pub fn set_bucket_index(&mut self, bucket_index: u32) {
        self.bucket_index = bucket_index;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.bucket_index = 0;
        self.entries.clear();
    }

    /// Finds the value for a key, comparing the hash first so most misses
    /// are a cheap integer compare.
    pub fn find_value(&self, key_hash: u32, key: &[u8], not_found_value: i64) -> i64 {
        self.entries
            .iter()
            .find(|e| e.key_hash == key_hash && e.key == key)
            .map(|e| e.value)
            .unwrap_or(not_found_value)
    }

    /// Applies one mutation to this bucket.
    ///
    /// With `old_value` other than [`INVALID_VALUE`] the mutation is
    /// conditional: it only applies if the entry exists and currently holds
    /// `old_value` (a missing entry fails the condition). A `value` of
    /// [`INVALID_VALUE`] removes the entry.
    pub fn put_value(&mut self, key: &[u8], key_hash: u32, old_value: i64, value: i64) {
        let position = self
            .entries
            .iter()
            .position(|e| e.key_hash == key_hash && e.key == key);
        if old_value != INVALID_VALUE {
            match position {
                Some(i) if self.entries[i].value == old_value => {}
                _ => return,
            }
        }
        match position {
            Some(i) => {
                if value == INVALID_VALUE {
                    self.entries.remove(i);
                } else {
                    self.entries[i].value = value;
                }
            }
            None => {
                if value != INVALID_VALUE {
                    self.entries.push(BucketEntry {
                        key_hash,
                        key: key.to_vec(),
                        value,
                    });
                }
            }
        }
    }

    /// Drops entries whose masked hash no longer maps to `bucket_index`.
    /// Called when a bucket written before a resize is read back under a
    /// wider mask.
    pub fn sanitize(&mut self, bucket_index: u32, mask_bits: u32) {
        let mask = (1u32 << mask_bits) - 1;
        self.entries.retain(|e| e.key_hash & mask == bucket_index);
    }

    pub fn for_each_entry(&self, mut action: impl FnMut(&BucketEntry)) {
        for entry in &self.entries {
            action(entry);
        }
    }

    /// Serialized size, used to plan the data file write.
    pub fn size_in_bytes(&self) -> usize {
        8 + self
            .entries
            .iter()
            .map(|e| 4 + 4 + e.key.len() + 8)
            .sum::<usize>()
    }

    pub fn write_to(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.bucket_index)?;
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            writer.write_u32::<LittleEndian>(entry.key_hash)?;
            writer.write_u32::<LittleEndian>(entry.key.len() as u32)?;
            writer.write_all(&entry.key)?;
            writer.write_i64::<LittleEndian>(entry.value)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.size_in_bytes());
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Replaces this bucket's contents with the serialized form in `data`.
    pub fn read_from(&mut self, data: &[u8]) -> io::Result<()> {
        let mut cursor = Cursor::new(data);
        self.bucket_index = cursor.read_u32::<LittleEndian>()?;
        let entry_count = cursor.read_u32::<LittleEndian>()? as usize;
        self.entries.clear();
        self.entries.reserve(entry_count);
        for _ in 0..entry_count {
            let key_hash = cursor.read_u32::<LittleEndian>()?;
            let key_len = cursor.read_u32::<LittleEndian>()? as usize;
            if key_len > data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bucket entry key length {key_len} exceeds record size"),
                ));
            }
            let mut key = vec![0u8; key_len];
            cursor.read_exact(&mut key)?;
            let value = cursor.read_i64::<LittleEndian>()?;
            self.entries.push(BucketEntry {
                key_hash,
                key,
                value,
            });
        }
        Ok(())
    }
}

// --- Mutation log ---

#[derive(Debug)]
struct Mutation {
    key: Vec<u8>,
    key_hash: u32,
    old_value: i64,
    value: i64,
}

/// Buffered mutations for one bucket within a writing session, replayed in
/// call order onto the loaded bucket at flush time. Conditional mutations
/// are therefore checked against the bucket state as of their turn in the
/// replay, not against the session buffer.
#[derive(Debug, Default)]
pub struct BucketMutation {
    mutations: Vec<Mutation>,
}

impl BucketMutation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers an unconditional set. Earlier mutations for the same key are
    /// superseded and dropped.
    pub fn put(&mut self, key: &[u8], key_hash: u32, value: i64) {
        self.mutations.retain(|m| m.key != key);
        self.mutations.push(Mutation {
            key: key.to_vec(),
            key_hash,
            old_value: INVALID_VALUE,
            value,
        });
    }

    /// Buffers a conditional set, applied at flush time only if the bucket
    /// then holds `old_value` for the key.
    pub fn put_if_equal(&mut self, key: &[u8], key_hash: u32, old_value: i64, value: i64) {
        self.mutations.push(Mutation {
            key: key.to_vec(),
            key_hash,
            old_value,
            value,
        });
    }

    /// Number of buffered mutations.
    pub fn size(&self) -> usize {
        self.mutations.len()
    }

    pub fn apply_to(&self, bucket: &mut Bucket) {
        for m in &self.mutations {
            bucket.put_value(&m.key, m.key_hash, m.old_value, m.value);
        }
    }
}

// --- Bucket pool ---

/// A pool of reusable buckets. A bucket is checked out, filled or mutated by
/// exactly one owner, then released back; ownership moves explicitly at each
/// pipeline step, never shared between concurrent tasks.
#[derive(Debug, Default)]
pub struct ReusableBucketPool {
    pool: Mutex<Vec<Bucket>>,
}

impl ReusableBucketPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_bucket(&self) -> Bucket {
        self.pool.lock().pop().unwrap_or_default()
    }

    pub fn release_bucket(&self, mut bucket: Bucket) {
        bucket.clear();
        self.pool.lock().push(bucket);
    }
}
