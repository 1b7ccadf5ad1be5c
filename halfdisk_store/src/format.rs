// halfdisk_store/src/format.rs

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// --- CONSTANTS ---
pub const DATA_FILE_MAGIC: u64 = u64::from_le_bytes(*b"HALFDISK");
pub const DATA_FILE_VERSION: u16 = 1;
pub const DATA_FILE_HEADER_SIZE: usize = 64;

/// Per-record frame: `[len:u32][crc32:u32]` then the payload.
pub const RECORD_FRAME_SIZE: usize = 8;

/// Data file header (fixed 64 bytes), zero-copy compatible.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DataFileHeader {
    pub magic: u64,        // 0..8
    pub version: u16,      // 8..10
    pub flags: u16,        // 10..12
    pub file_index: u32,   // 12..16
    pub created_at: u64,   // 16..24
    pub padding: [u8; 40], // 24..64
}

impl DataFileHeader {
    pub fn new(file_index: u32) -> Self {
        Self {
            magic: DATA_FILE_MAGIC,
            version: DATA_FILE_VERSION,
            flags: 0,
            file_index,
            created_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            padding: [0u8; 40],
        }
    }

    pub fn validate(&self) -> bool {
        self.magic == DATA_FILE_MAGIC && self.version == DATA_FILE_VERSION
    }
}

// --- DATA LOCATIONS ---
// A location packs the file index into the upper 24 bits and the byte offset
// of the record frame into the lower 40 bits. Offsets always point past the
// file header, so a real location is never 0.

const OFFSET_BITS: u32 = 40;
const OFFSET_MASK: i64 = (1 << OFFSET_BITS) - 1;

pub fn data_location(file_index: u32, byte_offset: u64) -> i64 {
    debug_assert!(byte_offset <= OFFSET_MASK as u64);
    ((file_index as i64) << OFFSET_BITS) | byte_offset as i64
}

pub fn file_index_from_location(location: i64) -> u32 {
    (location >> OFFSET_BITS) as u32
}

pub fn byte_offset_from_location(location: i64) -> u64 {
    (location & OFFSET_MASK) as u64
}

/// Human-readable form for log messages.
pub fn data_location_to_string(location: i64) -> String {
    format!(
        "{}@{}",
        file_index_from_location(location),
        byte_offset_from_location(location)
    )
}
