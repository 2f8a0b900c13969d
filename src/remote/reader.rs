//! Cached remote reader: byte-range reads served from the disk cache when
//! possible, fetched from the source otherwise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::{ByteRange, ByteSource, DiskCache};
use crate::util::{Error, Result};

/// Reads byte ranges of one resource through an optional disk cache.
///
/// With a non-zero `block_size`, reads are widened to aligned blocks and each
/// block is cached separately, so neighbouring small reads share a fetch.
/// With `block_size == 0`, each requested range is its own cache entry.
pub struct CachedReader {
    source: Box<dyn ByteSource>,
    cache: Option<Arc<DiskCache>>,
    block_size: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedReader {
    /// Create a reader over `source`.
    pub fn new(source: Box<dyn ByteSource>, cache: Option<Arc<DiskCache>>, block_size: u64) -> Self {
        Self {
            source,
            cache,
            block_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Identity of the underlying resource.
    #[inline]
    pub fn resource(&self) -> &str {
        self.source.id()
    }

    /// Total size of the resource.
    pub fn len(&self) -> Result<u64> {
        self.source.len()
    }

    /// Check if the resource is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Block alignment in bytes (0 = exact ranges).
    #[inline]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Reads served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Reads that went to the source.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Read exactly the bytes of `range`.
    pub fn read(&self, range: ByteRange) -> Result<Vec<u8>> {
        let size = self.len()?;
        if range.start > range.end || range.end > size {
            return Err(Error::fetch(
                self.resource(),
                format!("range {}..{} out of bounds (size {})", range.start, range.end, size),
            ));
        }
        if range.is_empty() {
            return Ok(Vec::new());
        }
        if self.block_size == 0 {
            return self.read_entry(range);
        }

        let first = range.start / self.block_size;
        let last = (range.end - 1) / self.block_size;
        let mut out = Vec::with_capacity(range.len() as usize);
        for block in first..=last {
            let block_range = ByteRange::new(
                block * self.block_size,
                ((block + 1) * self.block_size).min(size),
            );
            let data = self.read_entry(block_range)?;
            let from = range.start.max(block_range.start) - block_range.start;
            let to = range.end.min(block_range.end) - block_range.start;
            out.extend_from_slice(&data[from as usize..to as usize]);
        }
        Ok(out)
    }

    /// Read `len` bytes at `pos`.
    pub fn read_at(&self, pos: u64, len: u64) -> Result<Vec<u8>> {
        self.read(ByteRange::at(pos, len))
    }

    /// Read the whole resource.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        self.read(ByteRange::new(0, self.len()?))
    }

    /// Read a little-endian u64 at `pos`.
    pub fn read_u64(&self, pos: u64) -> Result<u64> {
        let bytes = self.read_at(pos, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(buf))
    }

    /// One cache entry: hit, or fetch then store. The store happens only
    /// after a successful fetch.
    fn read_entry(&self, range: ByteRange) -> Result<Vec<u8>> {
        let resource = self.source.id();
        if let Some(cache) = &self.cache {
            if let Some(data) = cache.get(resource, range)? {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(data);
            }
        }

        trace!("cache miss {resource} [{}..{})", range.start, range.end);
        self.misses.fetch_add(1, Ordering::Relaxed);
        let data = self.source.read_range(range)?;
        if data.len() as u64 != range.len() {
            return Err(Error::fetch(
                resource,
                format!("source returned {} bytes for a range of {}", data.len(), range.len()),
            ));
        }
        if let Some(cache) = &self.cache {
            cache.put(resource, range, &data)?;
        }
        Ok(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::remote::CacheKey;
    use parking_lot::Mutex;

    /// In-memory source that counts fetches and can be switched offline.
    pub(crate) struct MemorySource {
        id: String,
        data: Vec<u8>,
        pub(crate) fetches: Mutex<Vec<ByteRange>>,
        pub(crate) offline: Mutex<bool>,
    }

    impl MemorySource {
        pub(crate) fn new(id: &str, data: Vec<u8>) -> Self {
            Self {
                id: id.to_string(),
                data,
                fetches: Mutex::new(Vec::new()),
                offline: Mutex::new(false),
            }
        }
    }

    impl ByteSource for MemorySource {
        fn id(&self) -> &str {
            &self.id
        }

        fn len(&self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn read_range(&self, range: ByteRange) -> Result<Vec<u8>> {
            if *self.offline.lock() {
                return Err(Error::fetch(&self.id, "connection refused"));
            }
            self.fetches.lock().push(range);
            Ok(self.data[range.start as usize..range.end as usize].to_vec())
        }
    }

    fn data() -> Vec<u8> {
        (0..=255u8).cycle().take(1000).collect()
    }

    #[test]
    fn test_repeat_read_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path()).unwrap());
        let src = Arc::new(MemorySource::new("mem://a", data()));
        let reader = CachedReader::new(Box::new(Arc::clone(&src)), Some(cache), 0);

        let range = ByteRange::new(10, 50);
        let first = reader.read(range).unwrap();
        let second = reader.read(range).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, data()[10..50].to_vec());
        assert_eq!(src.fetches.lock().len(), 1);
        assert_eq!(reader.hits(), 1);
        assert_eq!(reader.misses(), 1);
    }

    #[test]
    fn test_block_aligned_reads() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path()).unwrap());
        let src = Arc::new(MemorySource::new("mem://b", data()));
        let reader = CachedReader::new(Box::new(Arc::clone(&src)), Some(Arc::clone(&cache)), 128);

        // Spans blocks 0 and 1
        assert_eq!(reader.read(ByteRange::new(100, 200)).unwrap(), data()[100..200].to_vec());
        // Inside block 1, already cached
        assert_eq!(reader.read(ByteRange::new(130, 140)).unwrap(), data()[130..140].to_vec());
        // Last block is clipped to the resource length
        assert_eq!(reader.read(ByteRange::new(990, 1000)).unwrap(), data()[990..1000].to_vec());

        let fetches = src.fetches.lock().clone();
        assert_eq!(
            fetches,
            vec![ByteRange::new(0, 128), ByteRange::new(128, 256), ByteRange::new(896, 1000)]
        );
        assert!(cache.contains(&CacheKey::new("mem://b", ByteRange::new(896, 1000))).unwrap());
    }

    #[test]
    fn test_out_of_bounds() {
        let src = MemorySource::new("mem://c", vec![0; 16]);
        let reader = CachedReader::new(Box::new(src), None, 0);
        let err = reader.read(ByteRange::new(8, 32)).unwrap_err();
        assert!(matches!(err, Error::RemoteFetch { .. }));
    }

    #[test]
    fn test_failed_fetch_leaves_no_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path()).unwrap());
        let src = Arc::new(MemorySource::new("mem://d", data()));
        *src.offline.lock() = true;
        let reader = CachedReader::new(Box::new(Arc::clone(&src)), Some(Arc::clone(&cache)), 0);

        let range = ByteRange::new(0, 10);
        let err = reader.read(range).unwrap_err();
        assert!(matches!(err, Error::RemoteFetch { .. }));
        assert!(!cache.contains(&CacheKey::new("mem://d", range)).unwrap());
        assert_eq!(cache.entry_count("mem://d").unwrap(), 0);
    }

    #[test]
    fn test_cached_bytes_survive_source_outage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path()).unwrap());
        let src = Arc::new(MemorySource::new("mem://e", data()));
        let reader = CachedReader::new(Box::new(Arc::clone(&src)), Some(cache), 0);

        let range = ByteRange::new(5, 9);
        let online = reader.read(range).unwrap();
        *src.offline.lock() = true;
        assert_eq!(reader.read(range).unwrap(), online);
        assert!(reader.read(ByteRange::new(9, 12)).is_err());
    }

    #[test]
    fn test_read_u64() {
        let mut bytes = vec![0u8; 4];
        bytes.extend_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
        let reader = CachedReader::new(Box::new(MemorySource::new("mem://f", bytes)), None, 4);
        assert_eq!(reader.read_u64(4).unwrap(), 0xDEAD_BEEF);
    }
}
