//! Append-only disk cache for fetched byte ranges.
//!
//! Each resource gets its own directory, named by the SHA-256 of its id:
//!
//! ```text
//! <cache_dir>/<sha256(resource)>/
//!     resource.json   original resource id
//!     chunks.bin      append-only arena of cached bytes
//!     index.jsonl     one {"start","end","offset"} line per entry
//! ```
//!
//! Bytes are appended to the arena and flushed before their index line is
//! written, so an index entry never refers to bytes that are not on disk.
//! Entries are never invalidated or evicted. Each append takes its offset
//! from the arena's length on disk, so caches opened separately on the same
//! directory within one process never point at each other's bytes.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use super::ByteRange;
use crate::util::{Error, Result};

const RESOURCE_FILE: &str = "resource.json";
const ARENA_FILE: &str = "chunks.bin";
const INDEX_FILE: &str = "index.jsonl";

/// Key for cache entries.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct CacheKey {
    /// Resource identity (normalized URL).
    pub resource: String,
    /// Cached byte range within the resource.
    pub range: ByteRange,
}

impl CacheKey {
    /// Create a new cache key.
    pub fn new(resource: impl Into<String>, range: ByteRange) -> Self {
        Self {
            resource: resource.into(),
            range,
        }
    }
}

/// One line of `index.jsonl`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct IndexLine {
    start: u64,
    end: u64,
    offset: u64,
}

/// Summary of the loaded portion of the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Resources whose index has been loaded.
    pub resources: usize,
    /// Cached ranges across loaded resources.
    pub entries: usize,
    /// Cached bytes across loaded resources.
    pub bytes: u64,
}

/// Index and arena handle for one resource.
struct ResourceStore {
    dir: PathBuf,
    /// range -> offset in the arena
    index: HashMap<ByteRange, u64>,
    bytes: u64,
}

impl ResourceStore {
    fn load(dir: PathBuf, resource: &str) -> Result<Self> {
        fs::create_dir_all(&dir)?;

        let marker = dir.join(RESOURCE_FILE);
        if !marker.exists() {
            fs::write(&marker, serde_json::to_vec(&serde_json::json!({ "id": resource }))?)?;
        }

        let arena_len = match fs::metadata(dir.join(ARENA_FILE)) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let mut index = HashMap::new();
        let mut bytes = 0;
        let index_path = dir.join(INDEX_FILE);
        if index_path.exists() {
            let reader = BufReader::new(File::open(&index_path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: IndexLine = match serde_json::from_str(&line) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("ignoring unreadable cache index line in {}: {e}", dir.display());
                        continue;
                    }
                };
                let range = ByteRange::new(entry.start, entry.end);
                if range.is_empty() || entry.offset + range.len() > arena_len {
                    warn!(
                        "ignoring torn cache entry {}..{} in {}",
                        entry.start,
                        entry.end,
                        dir.display()
                    );
                    continue;
                }
                if index.insert(range, entry.offset).is_none() {
                    bytes += range.len();
                }
            }
        }

        Ok(Self {
            dir,
            index,
            bytes,
        })
    }

    fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = File::open(self.dir.join(ARENA_FILE))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, range: ByteRange, data: &[u8]) -> Result<()> {
        let mut arena = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(ARENA_FILE))?;
        // Another handle on this directory may have appended since load.
        let offset = arena.seek(SeekFrom::End(0))?;
        arena.write_all(data)?;
        arena.flush()?;
        arena.sync_data()?;

        let line = serde_json::to_string(&IndexLine {
            start: range.start,
            end: range.end,
            offset,
        })?;
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(INDEX_FILE))?;
        writeln!(index, "{line}")?;
        index.flush()?;

        self.index.insert(range, offset);
        self.bytes += range.len();
        Ok(())
    }
}

/// Persistent store of `(resource, range) -> bytes` entries.
///
/// The in-memory index of each resource is loaded on first access.
pub struct DiskCache {
    root: PathBuf,
    resources: RwLock<HashMap<String, Arc<Mutex<ResourceStore>>>>,
}

impl DiskCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            Error::Cache(format!("cannot create cache directory {}: {e}", root.display()))
        })?;
        Ok(Self {
            root,
            resources: RwLock::new(HashMap::new()),
        })
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the entries of `resource`.
    pub fn resource_dir(&self, resource: &str) -> PathBuf {
        self.root.join(hex::encode(Sha256::digest(resource.as_bytes())))
    }

    fn store(&self, resource: &str) -> Result<Arc<Mutex<ResourceStore>>> {
        if let Some(store) = self.resources.read().get(resource) {
            return Ok(Arc::clone(store));
        }
        let mut resources = self.resources.write();
        if let Some(store) = resources.get(resource) {
            return Ok(Arc::clone(store));
        }
        let store = ResourceStore::load(self.resource_dir(resource), resource)
            .map_err(|e| Error::Cache(format!("cannot load cache for {resource}: {e}")))?;
        let store = Arc::new(Mutex::new(store));
        resources.insert(resource.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Look up cached bytes for an exact range.
    pub fn get(&self, resource: &str, range: ByteRange) -> Result<Option<Vec<u8>>> {
        let store = self.store(resource)?;
        let store = store.lock();
        match store.index.get(&range) {
            Some(&offset) => {
                trace!("cache hit {resource} [{}..{})", range.start, range.end);
                let data = store
                    .read(offset, range.len())
                    .map_err(|e| Error::Cache(format!("cannot read cached bytes: {e}")))?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Persist bytes for a range. Existing entries are left untouched.
    pub fn put(&self, resource: &str, range: ByteRange, data: &[u8]) -> Result<()> {
        if data.len() as u64 != range.len() {
            return Err(Error::Cache(format!(
                "refusing to cache {} bytes for a range of {}",
                data.len(),
                range.len()
            )));
        }
        let store = self.store(resource)?;
        let mut store = store.lock();
        if store.index.contains_key(&range) || range.is_empty() {
            return Ok(());
        }
        store
            .append(range, data)
            .map_err(|e| Error::Cache(format!("cannot write cache entry: {e}")))
    }

    /// Check whether an exact range is cached.
    pub fn contains(&self, key: &CacheKey) -> Result<bool> {
        let store = self.store(&key.resource)?;
        let contains = store.lock().index.contains_key(&key.range);
        Ok(contains)
    }

    /// Number of cached ranges for a resource.
    pub fn entry_count(&self, resource: &str) -> Result<usize> {
        let store = self.store(resource)?;
        let count = store.lock().index.len();
        Ok(count)
    }

    /// Totals over resources loaded so far.
    pub fn stats(&self) -> CacheStats {
        let resources = self.resources.read();
        let mut stats = CacheStats {
            resources: resources.len(),
            ..Default::default()
        };
        for store in resources.values() {
            let store = store.lock();
            stats.entries += store.index.len();
            stats.bytes += store.bytes;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: &str = "https://example.org/sub-01.nwb";

    #[test]
    fn test_cache_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        let range = ByteRange::new(100, 105);

        cache.put(RES, range, &[1, 2, 3, 4, 5]).unwrap();

        assert_eq!(cache.get(RES, range).unwrap(), Some(vec![1, 2, 3, 4, 5]));
        assert!(cache.contains(&CacheKey::new(RES, range)).unwrap());
    }

    #[test]
    fn test_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();

        assert!(cache.get(RES, ByteRange::new(0, 4)).unwrap().is_none());
        // Ranges are exact keys, not containment
        cache.put(RES, ByteRange::new(0, 8), &[0; 8]).unwrap();
        assert!(cache.get(RES, ByteRange::new(0, 4)).unwrap().is_none());
    }

    #[test]
    fn test_cache_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskCache::open(dir.path()).unwrap();
            cache.put(RES, ByteRange::new(0, 3), b"abc").unwrap();
            cache.put(RES, ByteRange::new(10, 12), b"xy").unwrap();
        }

        let cache = DiskCache::open(dir.path()).unwrap();
        assert_eq!(cache.get(RES, ByteRange::new(10, 12)).unwrap().unwrap(), b"xy");
        assert_eq!(cache.get(RES, ByteRange::new(0, 3)).unwrap().unwrap(), b"abc");
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 5);
    }

    #[test]
    fn test_cache_ignores_torn_entry() {
        let dir = tempfile::tempdir().unwrap();
        let res_dir = {
            let cache = DiskCache::open(dir.path()).unwrap();
            cache.put(RES, ByteRange::new(0, 2), b"ok").unwrap();
            cache.resource_dir(RES)
        };
        // Index line pointing past the end of the arena
        let mut index = OpenOptions::new()
            .append(true)
            .open(res_dir.join(INDEX_FILE))
            .unwrap();
        writeln!(index, r#"{{"start":50,"end":60,"offset":2}}"#).unwrap();

        let cache = DiskCache::open(dir.path()).unwrap();
        assert_eq!(cache.entry_count(RES).unwrap(), 1);
        assert!(cache.get(RES, ByteRange::new(50, 60)).unwrap().is_none());
    }

    #[test]
    fn test_cache_shared_directory_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let a = DiskCache::open(dir.path()).unwrap();
        let b = DiskCache::open(dir.path()).unwrap();
        // Both load the (empty) index before either writes
        assert_eq!(a.entry_count(RES).unwrap(), 0);
        assert_eq!(b.entry_count(RES).unwrap(), 0);

        b.put(RES, ByteRange::new(0, 4), b"BBBB").unwrap();
        a.put(RES, ByteRange::new(100, 104), b"AAAA").unwrap();

        assert_eq!(a.get(RES, ByteRange::new(100, 104)).unwrap().unwrap(), b"AAAA");
        assert_eq!(b.get(RES, ByteRange::new(0, 4)).unwrap().unwrap(), b"BBBB");

        let fresh = DiskCache::open(dir.path()).unwrap();
        assert_eq!(fresh.get(RES, ByteRange::new(100, 104)).unwrap().unwrap(), b"AAAA");
        assert_eq!(fresh.get(RES, ByteRange::new(0, 4)).unwrap().unwrap(), b"BBBB");
        assert_eq!(fresh.entry_count(RES).unwrap(), 2);
    }

    #[test]
    fn test_cache_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        let err = cache.put(RES, ByteRange::new(0, 4), b"ab").unwrap_err();
        assert!(matches!(err, Error::Cache(_)));
        assert_eq!(cache.entry_count(RES).unwrap(), 0);
    }

    #[test]
    fn test_resources_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path()).unwrap();
        let range = ByteRange::new(0, 1);
        cache.put("a", range, b"A").unwrap();
        cache.put("b", range, b"B").unwrap();
        assert_eq!(cache.get("a", range).unwrap().unwrap(), b"A");
        assert_eq!(cache.get("b", range).unwrap().unwrap(), b"B");
        assert_ne!(cache.resource_dir("a"), cache.resource_dir("b"));
    }
}
