//! Sessions: one opened dataset, from locator to navigable NWB view.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::container::hdf5::Hdf5Backend;
use crate::container::refs::{ReferenceManifest, RefsBackend};
use crate::container::{ContainerBackend, HierarchicalFile};
use crate::locator::{Locator, Strategy};
use crate::nwb::NwbFile;
use crate::remote::{CachedReader, RemoteStore};
use crate::util::Result;

/// A read-only handle on one dataset file.
///
/// Owns its hierarchical view and the per-URL readers it uses. Dropping the
/// session releases both; cached bytes stay on disk.
pub struct Session {
    locator: Locator,
    store: Arc<RemoteStore>,
    file: HierarchicalFile,
}

impl Session {
    /// Resolve `locator` and open the file it names.
    pub fn open(locator: &str, config: &Config) -> Result<Self> {
        let locator = Locator::resolve(locator)?;
        Self::open_locator(locator, config)
    }

    /// Open an already-resolved locator.
    pub fn open_locator(locator: Locator, config: &Config) -> Result<Self> {
        let store = config.remote_store()?;
        Self::open_with_store(locator, store)
    }

    /// Open using an existing reader store (and its cache).
    pub fn open_with_store(locator: Locator, store: Arc<RemoteStore>) -> Result<Self> {
        let url = locator.resource_id();
        let reader = store.reader(&url)?;
        let backend: Box<dyn ContainerBackend> = match locator.strategy() {
            Strategy::Reference => {
                let manifest = ReferenceManifest::parse(&reader.read_all()?)?;
                Box::new(RefsBackend::new(manifest, Arc::clone(&store))?)
            }
            Strategy::Direct => Box::new(Hdf5Backend::open(reader)?),
        };
        let file = HierarchicalFile::new(backend)?;
        debug!("opened session {locator} as {} container", file.format_name());

        Ok(Self {
            locator,
            store,
            file,
        })
    }

    /// The resolved locator.
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Loading strategy used.
    pub fn strategy(&self) -> Strategy {
        self.locator.strategy()
    }

    /// Hierarchical view of the file.
    pub fn file(&self) -> &HierarchicalFile {
        &self.file
    }

    /// NWB view of the file.
    pub fn nwb(&self) -> NwbFile<'_> {
        NwbFile::new(&self.file)
    }

    /// Reader store backing this session.
    pub fn store(&self) -> &Arc<RemoteStore> {
        &self.store
    }

    /// Reader of the locator's own object.
    pub fn reader(&self) -> Result<Arc<CachedReader>> {
        self.store.reader(&self.locator.resource_id())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("locator", &self.locator.raw())
            .field("strategy", &self.locator.strategy())
            .field("format", &self.file.format_name())
            .finish()
    }
}
