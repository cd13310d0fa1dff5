//! Local chunk storage.
//!
//! Each chunk is one file under a two-hex-digit shard directory, written
//! through a temporary file and renamed into place. A JSON sidecar keeps the
//! chunk's CRC32 so reads and scrubs can detect corruption. Recently used
//! chunks are kept in a byte-bounded LRU cache.

use crate::error::{FlexError, Result};
use crate::types::{ChunkId, CHUNK_SIZE};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

const CACHE_ENTRIES: usize = 4096;

/// Metadata kept next to every chunk file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: ChunkId,
    /// Bytes present in the file.
    pub size: u64,
    pub checksum: u32,
    /// Incremented on every write.
    pub version: u64,
}

impl StoredChunk {
    fn new(id: ChunkId, data: &[u8], version: u64) -> Self {
        Self {
            id,
            size: data.len() as u64,
            checksum: crc32fast::hash(data),
            version,
        }
    }

    /// Verify data against the stored checksum.
    pub fn verify(&self, data: &[u8]) -> bool {
        crc32fast::hash(data) == self.checksum
    }
}

/// Chunk files on local disk with a read cache.
pub struct ChunkStore {
    data_dir: PathBuf,
    cache: Mutex<LruCache<ChunkId, Arc<Vec<u8>>>>,
    cache_size: usize,
    cache_bytes_used: Mutex<usize>,
    /// Serializes read-modify-write of chunk files.
    write_lock: Mutex<()>,
}

impl ChunkStore {
    /// Open (or create) a store rooted at `data_dir`.
    pub fn new<P: AsRef<Path>>(data_dir: P, cache_size: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;
        for i in 0..256 {
            fs::create_dir_all(data_dir.join(format!("{:02x}", i)))?;
        }

        let entries = NonZeroUsize::new(CACHE_ENTRIES)
            .ok_or_else(|| FlexError::Internal("cache entry limit is zero".into()))?;

        Ok(Self {
            data_dir,
            cache: Mutex::new(LruCache::new(entries)),
            cache_size,
            cache_bytes_used: Mutex::new(0),
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Write `data` at `offset` within a chunk, extending the file as needed.
    pub fn write_range(&self, chunk_id: ChunkId, offset: u64, data: &[u8]) -> Result<StoredChunk> {
        check_range(chunk_id, offset, data.len() as u64)?;

        let _guard = self.write_lock.lock();
        let previous = self.meta(chunk_id)?;
        let mut contents = self.load(chunk_id)?.unwrap_or_default();

        let start = offset as usize;
        let end = start + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);

        let version = previous.map(|m| m.version + 1).unwrap_or(1);
        let meta = self.persist(chunk_id, &contents, version)?;
        self.cache_put(chunk_id, contents);

        debug!(chunk_id, offset, size = data.len(), version, "Wrote chunk range");
        Ok(meta)
    }

    /// Read a range of a chunk. Bytes never written read as zeros.
    pub fn read_range(&self, chunk_id: ChunkId, offset: u64, length: u64) -> Result<Vec<u8>> {
        check_range(chunk_id, offset, length)?;

        let mut out = vec![0u8; length as usize];
        if let Some(contents) = self.cached_or_load(chunk_id)? {
            let start = (offset as usize).min(contents.len());
            let end = ((offset + length) as usize).min(contents.len());
            out[..end - start].copy_from_slice(&contents[start..end]);
        }
        Ok(out)
    }

    pub fn exists(&self, chunk_id: ChunkId) -> bool {
        self.chunk_path(chunk_id).exists()
    }

    /// Delete a chunk. Returns false if it was not stored.
    pub fn delete(&self, chunk_id: ChunkId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        self.cache_remove(chunk_id);

        let path = self.chunk_path(chunk_id);
        let existed = path.exists();
        if existed {
            fs::remove_file(&path)?;
        }
        let meta_path = self.meta_path(chunk_id);
        if meta_path.exists() {
            fs::remove_file(&meta_path)?;
        }

        debug!(chunk_id, existed, "Deleted chunk");
        Ok(existed)
    }

    pub fn meta(&self, chunk_id: ChunkId) -> Result<Option<StoredChunk>> {
        let meta_path = self.meta_path(chunk_id);
        if !meta_path.exists() {
            return Ok(None);
        }
        let meta_json = fs::read(&meta_path)?;
        Ok(Some(serde_json::from_slice(&meta_json)?))
    }

    /// All chunk ids stored locally, ascending.
    pub fn list_chunks(&self) -> Result<Vec<ChunkId>> {
        let mut chunks = Vec::new();
        for i in 0..256 {
            let dir = self.data_dir.join(format!("{:02x}", i));
            if !dir.exists() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(id) = name.strip_suffix(".dat").and_then(|s| s.parse().ok()) {
                    chunks.push(id);
                }
            }
        }
        chunks.sort_unstable();
        Ok(chunks)
    }

    /// Verify a chunk against its checksum, bypassing the cache.
    pub fn scrub(&self, chunk_id: ChunkId) -> Result<bool> {
        let Some(meta) = self.meta(chunk_id)? else {
            return Ok(true);
        };
        let data = match self.read_file(chunk_id)? {
            Some(data) => data,
            None => return Ok(false),
        };
        if !meta.verify(&data) {
            warn!(chunk_id, "Scrub found corruption");
            self.cache_remove(chunk_id);
            return Ok(false);
        }
        Ok(true)
    }

    /// Bytes used by chunk files and sidecars.
    pub fn usage(&self) -> Result<u64> {
        let mut total = 0u64;
        for i in 0..256 {
            let dir = self.data_dir.join(format!("{:02x}", i));
            if dir.exists() {
                for entry in fs::read_dir(&dir)? {
                    if let Ok(meta) = entry?.metadata() {
                        total += meta.len();
                    }
                }
            }
        }
        Ok(total)
    }

    fn cached_or_load(&self, chunk_id: ChunkId) -> Result<Option<Arc<Vec<u8>>>> {
        if let Some(data) = self.cache_get(chunk_id) {
            return Ok(Some(data));
        }
        match self.load(chunk_id)? {
            Some(data) => {
                let data = Arc::new(data);
                self.cache_insert(chunk_id, Arc::clone(&data));
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Load a chunk from disk and verify it.
    fn load(&self, chunk_id: ChunkId) -> Result<Option<Vec<u8>>> {
        if let Some(data) = self.cache_get(chunk_id) {
            return Ok(Some(Arc::try_unwrap(data).unwrap_or_else(|arc| (*arc).clone())));
        }
        let Some(data) = self.read_file(chunk_id)? else {
            return Ok(None);
        };
        if let Some(meta) = self.meta(chunk_id)? {
            if !meta.verify(&data) {
                error!(chunk_id, "Checksum mismatch");
                return Err(FlexError::ChecksumMismatch {
                    expected: meta.checksum,
                    actual: crc32fast::hash(&data),
                });
            }
        }
        Ok(Some(data))
    }

    fn read_file(&self, chunk_id: ChunkId) -> Result<Option<Vec<u8>>> {
        let mut file = match File::open(self.chunk_path(chunk_id)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    fn persist(&self, chunk_id: ChunkId, contents: &[u8], version: u64) -> Result<StoredChunk> {
        let path = self.chunk_path(chunk_id);
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        let meta = StoredChunk::new(chunk_id, contents, version);
        fs::write(self.meta_path(chunk_id), serde_json::to_vec(&meta)?)?;
        Ok(meta)
    }

    fn chunk_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.data_dir
            .join(format!("{:02x}", chunk_id % 256))
            .join(format!("{}.dat", chunk_id))
    }

    fn meta_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.data_dir
            .join(format!("{:02x}", chunk_id % 256))
            .join(format!("{}.meta", chunk_id))
    }

    fn cache_get(&self, chunk_id: ChunkId) -> Option<Arc<Vec<u8>>> {
        self.cache.lock().get(&chunk_id).map(Arc::clone)
    }

    fn cache_put(&self, chunk_id: ChunkId, data: Vec<u8>) {
        self.cache_insert(chunk_id, Arc::new(data));
    }

    fn cache_insert(&self, chunk_id: ChunkId, data: Arc<Vec<u8>>) {
        let data_len = data.len();
        if data_len > self.cache_size {
            self.cache_remove(chunk_id);
            return;
        }

        let mut cache = self.cache.lock();
        let mut bytes_used = self.cache_bytes_used.lock();
        if let Some(old) = cache.pop(&chunk_id) {
            *bytes_used = bytes_used.saturating_sub(old.len());
        }
        while *bytes_used + data_len > self.cache_size {
            match cache.pop_lru() {
                Some((_, evicted)) => *bytes_used = bytes_used.saturating_sub(evicted.len()),
                None => break,
            }
        }
        if let Some((_, evicted)) = cache.push(chunk_id, data) {
            *bytes_used = bytes_used.saturating_sub(evicted.len());
        }
        *bytes_used += data_len;
    }

    fn cache_remove(&self, chunk_id: ChunkId) {
        if let Some(data) = self.cache.lock().pop(&chunk_id) {
            let mut bytes_used = self.cache_bytes_used.lock();
            *bytes_used = bytes_used.saturating_sub(data.len());
        }
    }
}

fn check_range(chunk_id: ChunkId, offset: u64, length: u64) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= CHUNK_SIZE => Ok(()),
        _ => Err(FlexError::InvalidArgument(format!(
            "range {}+{} outside chunk {}",
            offset, length, chunk_id
        ))),
    }
}
