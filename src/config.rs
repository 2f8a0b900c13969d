//! Session configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::remote::{build_client, DiskCache, RemoteStore};
use crate::util::{Error, Result};

/// Default read alignment of the cached reader.
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

/// Settings shared by every session opened with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Disk cache directory; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    /// Cached reads are widened to blocks of this size; `0` caches exact ranges.
    pub block_size: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
    pub dandi_api_url: String,
    pub lindi_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: Self::default_cache_dir(),
            block_size: DEFAULT_BLOCK_SIZE,
            timeout_secs: 60,
            user_agent: concat!("nwb-stream/", env!("CARGO_PKG_VERSION")).to_string(),
            dandi_api_url: "https://api.dandiarchive.org/api".to_string(),
            lindi_base_url: "https://lindi.neurosift.org".to_string(),
        }
    }
}

impl Config {
    /// Platform cache directory, e.g. `~/.cache/nwb-stream`.
    pub fn default_cache_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|p| p.join("nwb-stream"))
    }

    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Same settings with caching disabled.
    pub fn without_cache(mut self) -> Self {
        self.cache_dir = None;
        self
    }

    /// Same settings with another cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Reject settings no session can run with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be positive".into()));
        }
        for (name, url) in [
            ("dandi_api_url", &self.dandi_api_url),
            ("lindi_base_url", &self.lindi_base_url),
        ] {
            url::Url::parse(url).map_err(|e| Error::Config(format!("{name}: {e}")))?;
        }
        Ok(())
    }

    /// HTTP timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Open the disk cache, if enabled.
    pub fn open_cache(&self) -> Result<Option<Arc<DiskCache>>> {
        match &self.cache_dir {
            Some(dir) => Ok(Some(Arc::new(DiskCache::open(dir)?))),
            None => Ok(None),
        }
    }

    /// Build the per-URL reader store for a session.
    pub fn remote_store(&self) -> Result<Arc<RemoteStore>> {
        self.validate()?;
        let client = build_client(self.timeout(), &self.user_agent)?;
        Ok(Arc::new(RemoteStore::new(
            client,
            self.open_cache()?,
            self.block_size,
        )))
    }
}
