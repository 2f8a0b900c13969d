//! Interval tables (trials, epochs, invalid times, custom TimeIntervals).

use tracing::debug;

use super::table::{Column, DynamicTable};
use crate::container::HierarchicalFile;
use crate::util::{Error, Result};

const START: &str = "start_time";
const STOP: &str = "stop_time";

/// Rows of `(start, stop)` times with row-aligned auxiliary columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntervalTable {
    name: String,
    description: Option<String>,
    ids: Vec<i64>,
    intervals: Vec<(f64, f64)>,
    columns: Vec<Column>,
    skipped: Vec<String>,
}

impl IntervalTable {
    /// Table name (`trials`, `epochs`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The table's `description` attribute.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Check if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Row ids.
    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    /// `(start, stop)` per row.
    pub fn intervals(&self) -> &[(f64, f64)] {
        &self.intervals
    }

    /// Start times per row.
    pub fn starts(&self) -> impl Iterator<Item = f64> + '_ {
        self.intervals.iter().map(|&(s, _)| s)
    }

    /// Stop times per row.
    pub fn stops(&self) -> impl Iterator<Item = f64> + '_ {
        self.intervals.iter().map(|&(_, s)| s)
    }

    /// Auxiliary columns in declared order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    /// Names of auxiliary columns.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(Column::name)
    }

    /// Columns that could not be decoded.
    pub fn skipped_columns(&self) -> &[String] {
        &self.skipped
    }
}

/// Read the interval table at `path`.
pub(crate) fn read_intervals(file: &HierarchicalFile, path: &str) -> Result<IntervalTable> {
    let table = DynamicTable::open(file, path)?;
    for required in [START, STOP] {
        if !table.has_array(required) {
            return Err(Error::malformed(format!("{path}: interval table has no {required}")));
        }
    }

    let starts = table.array(START)?.to_f64()?;
    let stops = table.array(STOP)?.to_f64()?;
    if starts.len() != stops.len() {
        return Err(Error::malformed(format!(
            "{path}: {} start times but {} stop times",
            starts.len(),
            stops.len()
        )));
    }
    let rows = starts.len();

    let ids = table.ids(rows)?;
    let (columns, skipped) = table.columns(rows, &[START, STOP])?;
    debug!("{path}: {rows} intervals, {} columns", columns.len());

    Ok(IntervalTable {
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        description: table.attributes().get_str("description").map(str::to_string),
        ids,
        intervals: starts.into_iter().zip(stops).collect(),
        columns,
        skipped,
    })
}
