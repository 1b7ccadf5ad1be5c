//! An append-only collection of data files.
//!
//! Each write session produces one new file: a fixed header followed by
//! CRC-framed records. Sealed files are immutable and randomly readable;
//! records are addressed by packed (file index, byte offset) locations.

use byteorder::{LittleEndian, WriteBytesExt};
use halfdisk_traits::{DataFileCollection, IoContext};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use zerocopy::{FromBytes, IntoBytes};

use crate::format::{
    byte_offset_from_location, data_location, file_index_from_location, DataFileHeader,
    DATA_FILE_HEADER_SIZE, RECORD_FRAME_SIZE,
};

const DATA_FILE_EXTENSION: &str = "hdd";

/// Largest record frame this store will read back. Anything bigger is
/// treated as a corrupt length field rather than an allocation request.
const MAX_RECORD_SIZE: u32 = 256 * 1024 * 1024;

struct DataFile {
    index: u32,
    path: PathBuf,
    file: File,
}

impl DataFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = File::open(&path)?;
        let mut header_bytes = [0u8; DATA_FILE_HEADER_SIZE];
        file.read_exact_at(&mut header_bytes, 0)
            .context("failed to read data file header")?;
        let header = DataFileHeader::read_from_bytes(&header_bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short data file header"))?;
        if !header.validate() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid data file header in {}", path.display()),
            ));
        }
        Ok(Self {
            index: header.file_index,
            path,
            file,
        })
    }

    fn read_record(&self, byte_offset: u64) -> io::Result<Vec<u8>> {
        let mut frame = [0u8; RECORD_FRAME_SIZE];
        self.file
            .read_exact_at(&mut frame, byte_offset)
            .context("failed to read record frame")?;
        let len = u32::from_le_bytes(frame[0..4].try_into().unwrap());
        let expected_crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        if len > MAX_RECORD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record at {}@{byte_offset} has corrupt length {len}", self.index),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        self.file
            .read_exact_at(&mut payload, byte_offset + RECORD_FRAME_SIZE as u64)
            .context("failed to read record payload")?;
        if crc32fast::hash(&payload) != expected_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record checksum mismatch at {}@{byte_offset}", self.index),
            ));
        }
        Ok(payload)
    }
}

struct SessionWriter {
    file_index: u32,
    file: File,
    offset: u64,
}

/// A file-backed [`DataFileCollection`].
pub struct FileCollection {
    dir: PathBuf,
    store_name: String,
    files: RwLock<BTreeMap<u32, Arc<DataFile>>>,
    writer: Mutex<Option<SessionWriter>>,
    next_file_index: AtomicU32,
    valid_key_range: Mutex<(u64, u64)>,
}

impl FileCollection {
    /// Opens the collection in `dir`, picking up any sealed data files a
    /// previous instance left behind.
    pub fn open(dir: &Path, store_name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut files = BTreeMap::new();
        let prefix = format!("{store_name}_");
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.starts_with(&prefix) || !name.ends_with(&format!(".{DATA_FILE_EXTENSION}")) {
                continue;
            }
            let data_file = DataFile::open(path)?;
            files.insert(data_file.index, Arc::new(data_file));
        }
        let next_file_index = files.keys().next_back().map(|i| i + 1).unwrap_or(0);
        if !files.is_empty() {
            info!(
                store = store_name,
                num_files = files.len(),
                "Loaded existing data file collection"
            );
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            store_name: store_name.to_string(),
            files: RwLock::new(files),
            writer: Mutex::new(None),
            next_file_index: AtomicU32::new(next_file_index),
            valid_key_range: Mutex::new((0, 0)),
        })
    }

    fn file_path(&self, file_index: u32) -> PathBuf {
        self.dir
            .join(format!("{}_{file_index}.{DATA_FILE_EXTENSION}", self.store_name))
    }

    fn file_for(&self, file_index: u32) -> io::Result<Arc<DataFile>> {
        self.files.read().get(&file_index).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("data file {file_index} is not part of this collection"),
            )
        })
    }

    pub fn num_of_files(&self) -> usize {
        self.files.read().len()
    }

    pub fn valid_key_range(&self) -> (u64, u64) {
        *self.valid_key_range.lock()
    }
}

impl DataFileCollection for FileCollection {
    fn start_writing(&self) -> io::Result<()> {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return Err(io::Error::other(
                "a write session is already open on this file collection",
            ));
        }
        let file_index = self.next_file_index.fetch_add(1, Ordering::AcqRel);
        let path = self.file_path(file_index);
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        file.write_all(DataFileHeader::new(file_index).as_bytes())?;
        // Register a read handle right away. Items stored during the session
        // become readable as soon as their location is handed out, which the
        // map relies on to serve gets concurrently with a flush.
        let data_file = DataFile::open(path)?;
        self.files.write().insert(file_index, Arc::new(data_file));
        *writer = Some(SessionWriter {
            file_index,
            file,
            offset: DATA_FILE_HEADER_SIZE as u64,
        });
        Ok(())
    }

    fn store_data_item(&self, data: &[u8]) -> io::Result<i64> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::other("no open write session on this file collection"))?;
        let location = data_location(writer.file_index, writer.offset);
        // One frame, one write: a record is fully visible to readers by the
        // time its location exists anywhere.
        let mut frame = Vec::with_capacity(RECORD_FRAME_SIZE + data.len());
        frame.write_u32::<LittleEndian>(data.len() as u32)?;
        frame.write_u32::<LittleEndian>(crc32fast::hash(data))?;
        frame.extend_from_slice(data);
        writer.file.write_all(&frame)?;
        writer.offset += frame.len() as u64;
        Ok(location)
    }

    fn end_writing(&self) -> io::Result<u32> {
        let session = self
            .writer
            .lock()
            .take()
            .ok_or_else(|| io::Error::other("no open write session on this file collection"))?;
        session.file.sync_all()?;
        debug!(
            store = %self.store_name,
            file_index = session.file_index,
            bytes = session.offset,
            "Sealed data file"
        );
        Ok(session.file_index)
    }

    fn read_data_item(&self, location: i64) -> io::Result<Option<Vec<u8>>> {
        let file = self.file_for(file_index_from_location(location))?;
        file.read_record(byte_offset_from_location(location)).map(Some)
    }

    fn update_valid_key_range(&self, min_valid_key: u64, max_valid_key: u64) {
        *self.valid_key_range.lock() = (min_valid_key, max_valid_key);
    }

    fn snapshot(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let files: Vec<Arc<DataFile>> = self.files.read().values().cloned().collect();
        for data_file in files {
            let file_name = data_file
                .path
                .file_name()
                .ok_or_else(|| io::Error::other("data file path has no file name"))?;
            std::fs::copy(&data_file.path, dir.join(file_name))?;
        }
        Ok(())
    }

    fn for_each_data_item(
        &self,
        action: &mut dyn FnMut(i64, &[u8]) -> io::Result<()>,
    ) -> io::Result<()> {
        let files: Vec<Arc<DataFile>> = self.files.read().values().cloned().collect();
        for data_file in files {
            let file_len = data_file.file.metadata()?.len();
            let mut offset = DATA_FILE_HEADER_SIZE as u64;
            while offset + RECORD_FRAME_SIZE as u64 <= file_len {
                let payload = data_file.read_record(offset)?;
                action(data_location(data_file.index, offset), &payload)?;
                offset += (RECORD_FRAME_SIZE + payload.len()) as u64;
            }
        }
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if self.writer.lock().is_some() {
            return Err(io::Error::other(
                "cannot close the file collection while a write session is open",
            ));
        }
        self.files.write().clear();
        Ok(())
    }
}
