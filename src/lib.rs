//! # nwb-stream
//!
//! Cached remote session loader for NWB datasets hosted on the DANDI Archive.
//!
//! A dataset locator is resolved to a loading strategy, its bytes are read
//! through a persistent range cache, and the file is exposed as a lazily
//! navigated hierarchy. Well-known NWB parts (units, interval tables,
//! behavioral time series) map to typed analysis objects.
//!
//! ```text
//! Locator ──> RemoteStore/CachedReader ──> HierarchicalFile ──> NwbFile
//!               │                            (hdf5 | refs)
//!               └── DiskCache (resource, range) -> bytes
//! ```
//!
//! ## Modules
//!
//! - [`util`] - Errors and element data types
//! - [`locator`] - Locator classification
//! - [`remote`] - Byte sources, disk cache, cached reader
//! - [`container`] - Hierarchical view, HDF5 and reference layouts
//! - [`nwb`] - Units, interval tables, time series, metadata
//! - [`session`] - One opened dataset
//! - [`catalog`] - DANDI asset listing
//! - [`config`] - Settings
//!
//! ## Example
//!
//! ```ignore
//! use nwb_stream::prelude::*;
//!
//! let config = Config::default();
//! let session = Session::open(
//!     "https://lindi.neurosift.org/dandi/dandisets/000409/assets/.../nwb.lindi.json",
//!     &config,
//! )?;
//! let nwb = session.nwb();
//! if nwb.has(&Substructure::Units)? {
//!     for (id, spikes) in nwb.units()?.iter() {
//!         println!("unit {id}: {} spikes", spikes.len());
//!     }
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod container;
pub mod locator;
pub mod nwb;
pub mod remote;
pub mod session;
pub mod util;

// Re-export commonly used types
pub use config::Config;
pub use session::Session;
pub use util::{DataType, Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::catalog::{Asset, Catalog, DandiCatalog};
    pub use crate::config::Config;
    pub use crate::container::{ArrayData, ArrayValues, Attributes, HierarchicalFile, NodeKind};
    pub use crate::locator::{Locator, Strategy};
    pub use crate::nwb::{EventTable, IntervalTable, NwbFile, Substructure, TimeSeries, Timing};
    pub use crate::session::Session;
    pub use crate::util::{DataType, Error, Result};
}
