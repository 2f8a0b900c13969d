//! NWB domain adapter: well-known substructures mapped to analysis objects.
//!
//! ```text
//! /units                       -> EventTable   (unit id -> spike times)
//! /intervals/{trials,epochs}   -> IntervalTable
//! /processing/behavior/**      -> TimeSeries
//! /acquisition/**              -> TimeSeries
//! ```

mod intervals;
mod table;
mod timeseries;
mod units;

use std::fmt;

pub use intervals::IntervalTable;
pub use table::{Column, INDEX_SUFFIX};
pub use timeseries::{TimeSeries, Timing};
pub use units::EventTable;

use crate::container::{HierarchicalFile, NodeKind};
use crate::util::{Error, Result};

/// A well-known part of an NWB file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Substructure {
    Units,
    Trials,
    Epochs,
    InvalidTimes,
    /// Any TimeIntervals table under `intervals/`.
    Intervals(String),
    Behavior,
    Acquisition,
}

impl Substructure {
    /// The fixed substructures checked by `info`-style summaries.
    pub const WELL_KNOWN: &'static [Substructure] = &[
        Substructure::Units,
        Substructure::Trials,
        Substructure::Epochs,
        Substructure::InvalidTimes,
        Substructure::Behavior,
        Substructure::Acquisition,
    ];

    /// Conventional path inside the file.
    pub fn path(&self) -> String {
        match self {
            Self::Units => "units".to_string(),
            Self::Trials => "intervals/trials".to_string(),
            Self::Epochs => "intervals/epochs".to_string(),
            Self::InvalidTimes => "intervals/invalid_times".to_string(),
            Self::Intervals(name) => format!("intervals/{name}"),
            Self::Behavior => "processing/behavior".to_string(),
            Self::Acquisition => "acquisition".to_string(),
        }
    }

    /// Parse a short name; unknown names are taken as interval tables.
    ///
    /// Any string is accepted here. Names that can't be a single table name
    /// (empty, containing `/`, or `.`/`..`) never resolve: see
    /// [`Substructure::is_valid`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "units" => Self::Units,
            "trials" => Self::Trials,
            "epochs" => Self::Epochs,
            "invalid_times" => Self::InvalidTimes,
            "behavior" => Self::Behavior,
            "acquisition" => Self::Acquisition,
            other => Self::Intervals(other.to_string()),
        }
    }

    /// False for an interval table name that is not a single path segment.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Intervals(name) => {
                !name.is_empty() && !name.contains('/') && name != "." && name != ".."
            }
            _ => true,
        }
    }

    /// Check if this names an interval table.
    pub fn is_interval_table(&self) -> bool {
        matches!(
            self,
            Self::Trials | Self::Epochs | Self::InvalidTimes | Self::Intervals(_)
        )
    }
}

impl fmt::Display for Substructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Units => write!(f, "units"),
            Self::Trials => write!(f, "trials"),
            Self::Epochs => write!(f, "epochs"),
            Self::InvalidTimes => write!(f, "invalid_times"),
            Self::Intervals(name) => write!(f, "{name}"),
            Self::Behavior => write!(f, "behavior"),
            Self::Acquisition => write!(f, "acquisition"),
        }
    }
}

/// Top-level descriptive fields. Each is optional.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileMetadata {
    pub nwb_version: Option<String>,
    pub identifier: Option<String>,
    pub session_description: Option<String>,
    pub session_start_time: Option<String>,
}

/// NWB view over a hierarchical file.
#[derive(Clone, Copy)]
pub struct NwbFile<'a> {
    file: &'a HierarchicalFile,
}

impl<'a> NwbFile<'a> {
    /// Wrap a hierarchical file.
    pub fn new(file: &'a HierarchicalFile) -> Self {
        Self { file }
    }

    /// The underlying hierarchical view.
    pub fn file(&self) -> &'a HierarchicalFile {
        self.file
    }

    /// Check for a substructure. Absence is `Ok(false)`.
    ///
    /// Every substructure is a group; an array at the same path, or a name
    /// that isn't a single segment, does not count.
    pub fn has(&self, what: &Substructure) -> Result<bool> {
        if !what.is_valid() {
            return Ok(false);
        }
        let path = what.path();
        Ok(self.file.exists(&path)? && self.file.kind(&path)? == NodeKind::Group)
    }

    fn require(&self, what: &Substructure) -> Result<String> {
        if self.has(what)? {
            Ok(what.path())
        } else {
            Err(Error::missing(what.path()))
        }
    }

    /// Spike times per unit.
    pub fn units(&self) -> Result<EventTable> {
        let path = self.require(&Substructure::Units)?;
        units::read_units(self.file, &path)
    }

    /// An interval table.
    pub fn intervals(&self, what: &Substructure) -> Result<IntervalTable> {
        if !what.is_interval_table() {
            return Err(Error::mismatch("interval table", what.to_string()));
        }
        let path = self.require(what)?;
        intervals::read_intervals(self.file, &path)
    }

    /// The trials table.
    pub fn trials(&self) -> Result<IntervalTable> {
        self.intervals(&Substructure::Trials)
    }

    /// The epochs table.
    pub fn epochs(&self) -> Result<IntervalTable> {
        self.intervals(&Substructure::Epochs)
    }

    /// Names of every table under `intervals/`.
    pub fn interval_names(&self) -> Result<Vec<String>> {
        if !self.file.exists("intervals")? {
            return Ok(Vec::new());
        }
        Ok(self
            .file
            .list_children("intervals")?
            .into_iter()
            .filter(|c| c.kind == NodeKind::Group)
            .map(|c| c.name)
            .collect())
    }

    /// Paths of TimeSeries-shaped groups below a substructure.
    pub fn time_series_paths(&self, under: &Substructure) -> Result<Vec<String>> {
        let root = self.require(under)?;
        timeseries::find_time_series(self.file, &root)
    }

    /// Read one time series by path.
    pub fn time_series(&self, path: &str) -> Result<TimeSeries> {
        timeseries::read_time_series(self.file, path)
    }

    /// Descriptive top-level fields.
    pub fn metadata(&self) -> Result<FileMetadata> {
        let root = self.file.attributes("")?;
        Ok(FileMetadata {
            nwb_version: root.get_str("nwb_version").map(str::to_string),
            identifier: self.scalar_text("identifier")?,
            session_description: self.scalar_text("session_description")?,
            session_start_time: self.scalar_text("session_start_time")?,
        })
    }

    fn scalar_text(&self, path: &str) -> Result<Option<String>> {
        if !self.file.exists(path)? {
            return Ok(None);
        }
        Ok(self.file.array(path)?.scalar_text().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        assert_eq!(Substructure::Trials.path(), "intervals/trials");
        assert_eq!(Substructure::Intervals("sleep".into()).path(), "intervals/sleep");
        assert_eq!(Substructure::from_name("units"), Substructure::Units);
        assert_eq!(
            Substructure::from_name("sleep"),
            Substructure::Intervals("sleep".into())
        );
        assert!(!Substructure::Behavior.is_interval_table());
        assert_eq!(Substructure::WELL_KNOWN.len(), 6);
    }

    fn sample_file() -> HierarchicalFile {
        use crate::container::refs::{ReferenceManifest, RefsBackend};
        use crate::remote::{build_client, RemoteStore};
        use serde_json::json;
        use std::sync::Arc;
        use std::time::Duration;

        let doc = json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "intervals/.zgroup": {"zarr_format": 2},
            "intervals/trials/.zgroup": {"zarr_format": 2},
            "intervals/trials/start_time/.zarray": {"shape": [0], "chunks": [1], "dtype": "<f8"},
            "intervals/trials/stop_time/.zarray": {"shape": [0], "chunks": [1], "dtype": "<f8"},
            "intervals/flat/.zarray": {"shape": [0], "chunks": [1], "dtype": "<f8"}
        }});
        let manifest = ReferenceManifest::parse(&serde_json::to_vec(&doc).unwrap()).unwrap();
        let client = build_client(Duration::from_secs(5), "test").unwrap();
        let store = Arc::new(RemoteStore::new(client, None, 0));
        HierarchicalFile::new(Box::new(RefsBackend::new(manifest, store).unwrap())).unwrap()
    }

    #[test]
    fn test_table_names_must_be_single_segments() {
        for name in ["", "trials/start_time", ".", "..", "/trials"] {
            assert!(!Substructure::from_name(name).is_valid(), "{name:?}");
        }
        assert!(Substructure::from_name("sleep").is_valid());

        let file = sample_file();
        let nwb = NwbFile::new(&file);
        assert!(nwb.has(&Substructure::Trials).unwrap());
        for name in ["", "trials/start_time", "flat"] {
            let what = Substructure::from_name(name);
            assert!(!nwb.has(&what).unwrap(), "{name:?}");
            assert!(
                matches!(nwb.intervals(&what), Err(Error::MissingSubstructure(_))),
                "{name:?}"
            );
        }
    }
}
