// Blocks and message queues that do not fit in core are spilled through an
// `ExternalStorage`. The engine calls `get` or `discard` at most once per
// handle: a handle names one spilled object, and the object is gone from
// storage once it has been read back or discarded. Storage failures are
// handed to the caller as they are, nothing here retries.

use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, trace, warn};

use crate::{error::StorageError, serialization::MemoryBuffer};

/// Opaque, process-local name of a spilled object.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Handle(pub u64);

pub trait ExternalStorage: Send + Sync {
    /// Writes the whole content of `bb` (ignoring its read cursor) and returns
    /// a handle to read it back with.
    fn put(&self, bb: &MemoryBuffer) -> Result<Handle, StorageError>;

    /// Replaces the content of `bb` with the object behind `handle` and
    /// rewinds its cursor. The object is dropped from storage.
    fn get(&self, handle: Handle, bb: &mut MemoryBuffer) -> Result<(), StorageError>;

    /// Drops the object behind `handle` without reading it.
    fn discard(&self, handle: Handle) -> Result<(), StorageError> {
        self.get(handle, &mut MemoryBuffer::new())
    }
}

/// Keeps spilled objects in a map. Useful when blocks are spilled to trade
/// their in-object representation for a compact serialized one, and in tests.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<Handle, Vec<u8>>>,
    next: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently held.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl ExternalStorage for MemoryStorage {
    fn put(&self, bb: &MemoryBuffer) -> Result<Handle, StorageError> {
        let handle = Handle(self.next.fetch_add(1, Ordering::Relaxed));
        self.objects.lock().insert(handle, bb.as_slice().to_vec());
        Ok(handle)
    }

    fn get(&self, handle: Handle, bb: &mut MemoryBuffer) -> Result<(), StorageError> {
        let bytes = self
            .objects
            .lock()
            .remove(&handle)
            .ok_or(StorageError::UnknownHandle(handle))?;
        *bb = MemoryBuffer::from_vec(bytes);
        Ok(())
    }

    fn discard(&self, handle: Handle) -> Result<(), StorageError> {
        self.objects
            .lock()
            .remove(&handle)
            .map(drop)
            .ok_or(StorageError::UnknownHandle(handle))
    }
}

const FLAG_ZSTD: u8 = 0b0000_0001;
/// flags | blake3(payload) | payload length
const HEADER_LEN: usize = 1 + 32 + 8;

/// Spills every object into its own file under a directory. Each file starts
/// with a header carrying a blake3 digest of the payload, which is checked when
/// the object is read back.
pub struct FileStorage {
    dir: PathBuf,
    prefix: String,
    compression_level: Option<i32>,
    files: Mutex<HashMap<Handle, (PathBuf, usize)>>,
    next: AtomicU64,
    sizes: Mutex<Sizes>,
}

#[derive(Default, Clone, Copy, Debug)]
struct Sizes {
    current: usize,
    max: usize,
}

impl FileStorage {
    /// Creates the storage directory if needed. File names get a random
    /// suffix so several engines can share one directory.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_prefix(dir, "strata")
    }

    pub fn with_prefix(dir: impl AsRef<Path>, prefix: &str) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        Ok(Self {
            dir,
            prefix: format!("{}.{}", prefix, suffix),
            compression_level: None,
            files: Mutex::new(HashMap::new()),
            next: AtomicU64::new(0),
            sizes: Mutex::new(Sizes::default()),
        })
    }

    /// Compresses spilled objects with zstd at the given level.
    pub fn compressed(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    /// Bytes currently spilled, as written to disk.
    pub fn current_size(&self) -> usize {
        self.sizes.lock().current
    }

    /// Largest value `current_size` has reached.
    pub fn max_size(&self) -> usize {
        self.sizes.lock().max
    }

    fn path_for(&self, handle: Handle) -> PathBuf {
        self.dir.join(format!("{}.{}", self.prefix, handle.0))
    }
}

impl ExternalStorage for FileStorage {
    fn put(&self, bb: &MemoryBuffer) -> Result<Handle, StorageError> {
        let handle = Handle(self.next.fetch_add(1, Ordering::Relaxed));
        let path = self.path_for(handle);

        let payload = bb.as_slice();
        let digest = blake3::hash(payload);
        let (flags, body) = match self.compression_level {
            Some(level) => (FLAG_ZSTD, zstd::stream::encode_all(payload, level)?),
            None => (0, payload.to_vec()),
        };

        let mut header = [0u8; HEADER_LEN];
        header[0] = flags;
        header[1..33].copy_from_slice(digest.as_bytes());
        LittleEndian::write_u64(&mut header[33..], payload.len() as u64);

        let mut file = fs::File::create(&path)?;
        file.write_all(&header)?;
        file.write_all(&body)?;

        let written = HEADER_LEN + body.len();
        self.files.lock().insert(handle, (path, written));
        let mut sizes = self.sizes.lock();
        sizes.current += written;
        sizes.max = sizes.max.max(sizes.current);
        trace!(?handle, bytes = written, "spilled object to file");
        Ok(handle)
    }

    fn get(&self, handle: Handle, bb: &mut MemoryBuffer) -> Result<(), StorageError> {
        let (path, written) = self
            .files
            .lock()
            .remove(&handle)
            .ok_or(StorageError::UnknownHandle(handle))?;

        let mut raw = Vec::with_capacity(written);
        fs::File::open(&path)?.read_to_end(&mut raw)?;
        fs::remove_file(&path)?;
        self.sizes.lock().current -= written;

        if raw.len() < HEADER_LEN {
            Err(StorageError::Truncated(handle))?
        }
        let (header, body) = raw.split_at(HEADER_LEN);
        let len = LittleEndian::read_u64(&header[33..]) as usize;
        let payload = if header[0] & FLAG_ZSTD != 0 {
            zstd::stream::decode_all(body)?
        } else {
            body.to_vec()
        };
        if payload.len() != len {
            Err(StorageError::Truncated(handle))?
        }
        if blake3::hash(&payload).as_bytes() != &header[1..33] {
            Err(StorageError::ChecksumMismatch(handle))?
        }

        trace!(?handle, bytes = len, "read object back from file");
        *bb = MemoryBuffer::from_vec(payload);
        Ok(())
    }

    fn discard(&self, handle: Handle) -> Result<(), StorageError> {
        let (path, written) = self
            .files
            .lock()
            .remove(&handle)
            .ok_or(StorageError::UnknownHandle(handle))?;
        fs::remove_file(&path)?;
        self.sizes.lock().current -= written;
        trace!(?handle, "discarded spilled file");
        Ok(())
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        let files = self.files.get_mut();
        if !files.is_empty() {
            debug!("removing {} spilled objects left in storage", files.len());
        }
        for (_, (path, _)) in files.drain() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("could not remove spilled file {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryBuffer {
        let mut bb = MemoryBuffer::new();
        bb.save(&(0..512u32).collect::<Vec<_>>());
        bb
    }

    #[test]
    fn memory_storage_hands_objects_back_once() {
        let storage = MemoryStorage::new();
        let handle = storage.put(&sample()).unwrap();
        assert_eq!(storage.len(), 1);

        let mut bb = MemoryBuffer::new();
        storage.get(handle, &mut bb).unwrap();
        assert_eq!(bb, sample());
        assert!(storage.is_empty());
        assert!(matches!(
            storage.get(handle, &mut bb),
            Err(StorageError::UnknownHandle(_))
        ));
    }

    #[test]
    fn file_storage_round_trips_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap().compressed(3);
        let handle = storage.put(&sample()).unwrap();
        assert!(storage.current_size() > 0);

        let mut bb = MemoryBuffer::new();
        storage.get(handle, &mut bb).unwrap();
        assert_eq!(bb, sample());
        assert_eq!(storage.current_size(), 0);
        assert!(storage.max_size() > 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn file_storage_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let handle = storage.put(&sample()).unwrap();

        let path = storage.path_for(handle);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        let mut bb = MemoryBuffer::new();
        assert!(matches!(
            storage.get(handle, &mut bb),
            Err(StorageError::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn discarded_objects_are_gone() {
        let memory = MemoryStorage::new();
        let handle = memory.put(&sample()).unwrap();
        memory.discard(handle).unwrap();
        assert!(memory.is_empty());
        assert!(memory.discard(handle).is_err());

        let dir = tempfile::tempdir().unwrap();
        let files = FileStorage::new(dir.path()).unwrap();
        let handle = files.put(&sample()).unwrap();
        files.discard(handle).unwrap();
        assert_eq!(files.current_size(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn dropping_file_storage_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            storage.put(&sample()).unwrap();
            storage.put(&sample()).unwrap();
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
