//! Unit spike trains as an event table.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::table::{Column, DynamicTable};
use crate::container::HierarchicalFile;
use crate::util::Result;

const SPIKE_TIMES: &str = "spike_times";

/// Read-only mapping from unit id to its ascending event times.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventTable {
    events: BTreeMap<i64, Arc<[f64]>>,
    columns: Vec<Column>,
    skipped: Vec<String>,
}

impl EventTable {
    /// Build from `(id, times)` rows. Rows sharing an id are merged and every
    /// sequence is sorted ascending.
    pub fn from_rows(rows: impl IntoIterator<Item = (i64, Vec<f64>)>) -> Self {
        let mut merged: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for (id, times) in rows {
            merged.entry(id).or_default().extend(times);
        }
        let events = merged
            .into_iter()
            .map(|(id, mut times)| {
                times.sort_by(f64::total_cmp);
                (id, Arc::from(times))
            })
            .collect();
        Self {
            events,
            columns: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Event times of one unit.
    pub fn get(&self, id: i64) -> Option<&[f64]> {
        self.events.get(&id).map(|t| &t[..])
    }

    /// Unit ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.events.keys().copied()
    }

    /// `(id, times)` pairs in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &[f64])> {
        self.events.iter().map(|(&id, t)| (id, &t[..]))
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the table has no units.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total number of events across units.
    pub fn total_events(&self) -> usize {
        self.events.values().map(|t| t.len()).sum()
    }

    /// The underlying map.
    pub fn as_map(&self) -> &BTreeMap<i64, Arc<[f64]>> {
        &self.events
    }

    /// Other per-unit columns, in table row order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    /// Columns that could not be decoded.
    pub fn skipped_columns(&self) -> &[String] {
        &self.skipped
    }
}

/// Read the units table at `path`.
pub(crate) fn read_units(file: &HierarchicalFile, path: &str) -> Result<EventTable> {
    let table = DynamicTable::open(file, path)?;

    let rows: Vec<Vec<f64>> = if table.has_array(SPIKE_TIMES) {
        let spikes = table.array(SPIKE_TIMES)?;
        let flat = spikes.to_f64()?;
        match table.index_for(SPIKE_TIMES, flat.len())? {
            Some(ends) => {
                let mut start = 0;
                ends.iter()
                    .map(|&end| {
                        let row = flat[start..end].to_vec();
                        start = end;
                        row
                    })
                    .collect()
            }
            // Without an index every spike belongs to a single unit
            None => vec![flat],
        }
    } else {
        let n = if table.has_array("id") { table.array("id")?.len() } else { 0 };
        vec![Vec::new(); n]
    };

    let ids = table.ids(rows.len())?;
    let (columns, skipped) = table.columns(rows.len(), &[SPIKE_TIMES])?;

    let mut events = EventTable::from_rows(ids.into_iter().zip(rows));
    events.columns = columns;
    events.skipped = skipped;
    debug!(
        "{}: {} units, {} spikes",
        table.path(),
        events.len(),
        events.total_events()
    );
    Ok(events)
}
