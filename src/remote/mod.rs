//! Remote byte access with a persistent local cache.
//!
//! ```text
//! CachedReader ──hit──> DiskCache (per-resource arena on disk)
//!      │
//!      └─miss─> ByteSource (HttpSource | FileSource) ──> DiskCache::put
//! ```
//!
//! Reads block until their bytes are available. Nothing here retries: a
//! failed fetch is returned to the caller as [`Error::RemoteFetch`] and leaves
//! the cache unchanged.
//!
//! [`Error::RemoteFetch`]: crate::Error::RemoteFetch

mod cache;
mod reader;
mod source;
mod store;

pub use cache::*;
pub use reader::*;
pub use source::*;
pub use store::*;

#[cfg(test)]
pub(crate) use reader::tests::MemorySource;
