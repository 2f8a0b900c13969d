//! Per-URL cached readers sharing one disk cache and HTTP client.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::blocking::Client;
use url::Url;

use super::{ByteSource, CachedReader, DiskCache, FileSource, HttpSource};
use crate::util::{Error, Result};

/// Opens and memoizes a [`CachedReader`] per object URL.
pub struct RemoteStore {
    client: Client,
    cache: Option<Arc<DiskCache>>,
    block_size: u64,
    readers: RwLock<HashMap<String, Arc<CachedReader>>>,
}

impl RemoteStore {
    /// Create a store. `cache = None` sends every read to the source.
    pub fn new(client: Client, cache: Option<Arc<DiskCache>>, block_size: u64) -> Self {
        Self {
            client,
            cache,
            block_size,
            readers: RwLock::new(HashMap::new()),
        }
    }

    /// The shared disk cache, if enabled.
    pub fn cache(&self) -> Option<&Arc<DiskCache>> {
        self.cache.as_ref()
    }

    /// Reader for `url` (`http`, `https` or `file`).
    pub fn reader(&self, url: &str) -> Result<Arc<CachedReader>> {
        if let Some(reader) = self.readers.read().get(url) {
            return Ok(Arc::clone(reader));
        }

        let source = self.open_source(url)?;
        let reader = Arc::new(CachedReader::new(source, self.cache.clone(), self.block_size));
        self.readers
            .write()
            .entry(url.to_string())
            .or_insert_with(|| Arc::clone(&reader));
        Ok(reader)
    }

    /// Register a reader over an arbitrary source under its id.
    pub fn insert_source(&self, source: Box<dyn ByteSource>) -> Arc<CachedReader> {
        let id = source.id().to_string();
        let reader = Arc::new(CachedReader::new(source, self.cache.clone(), self.block_size));
        self.readers.write().insert(id, Arc::clone(&reader));
        reader
    }

    fn open_source(&self, url: &str) -> Result<Box<dyn ByteSource>> {
        let parsed = Url::parse(url).map_err(|e| Error::fetch(url, format!("invalid URL: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(Box::new(HttpSource::with_client(url, self.client.clone()))),
            "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| Error::fetch(url, "not a local file path"))?;
                Ok(Box::new(FileSource::open_with_id(path, url)?))
            }
            other => Err(Error::fetch(url, format!("unsupported scheme {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{build_client, ByteRange};
    use std::time::Duration;

    #[test]
    fn test_readers_are_memoized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let url = Url::from_file_path(&path).unwrap().to_string();

        let client = build_client(Duration::from_secs(5), "test").unwrap();
        let store = RemoteStore::new(client, None, 0);
        let a = store.reader(&url).unwrap();
        let b = store.reader(&url).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.read(ByteRange::new(2, 5)).unwrap(), b"234");
        assert_eq!(a.resource(), url);
    }

    #[test]
    fn test_unsupported_scheme() {
        let client = build_client(Duration::from_secs(5), "test").unwrap();
        let store = RemoteStore::new(client, None, 0);
        let err = store.reader("ftp://example.org/x").err().unwrap();
        assert!(err.is_remote());
    }
}
