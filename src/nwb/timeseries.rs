//! Continuous streams: TimeSeries-shaped groups under behavior/acquisition.

use std::sync::Arc;

use crate::container::{join_path, ArrayData, HierarchicalFile, NodeKind};
use crate::util::{Error, Result};

const DATA: &str = "data";
const TIMESTAMPS: &str = "timestamps";
const STARTING_TIME: &str = "starting_time";

/// Sample timing of a series.
#[derive(Clone, Debug, PartialEq)]
pub enum Timing {
    /// One timestamp per sample.
    Explicit(Vec<f64>),
    /// Uniform sampling from `start` at `rate` Hz.
    Regular { start: f64, rate: f64 },
}

/// A materialized continuous stream.
#[derive(Clone, Debug)]
pub struct TimeSeries {
    pub name: String,
    pub path: String,
    pub data: Arc<ArrayData>,
    pub timing: Timing,
    /// The `unit` attribute of `data`.
    pub unit: Option<String>,
}

impl TimeSeries {
    /// Number of samples (first axis of `data`).
    pub fn len(&self) -> usize {
        if self.data.ndim() == 0 {
            1
        } else {
            self.data.rows()
        }
    }

    /// Check if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time of every sample.
    pub fn timestamps(&self) -> Vec<f64> {
        match &self.timing {
            Timing::Explicit(t) => t.clone(),
            Timing::Regular { start, rate } => {
                (0..self.len()).map(|i| start + i as f64 / rate).collect()
            }
        }
    }
}

/// Check whether a group looks like a TimeSeries.
pub(crate) fn is_time_series(file: &HierarchicalFile, path: &str) -> Result<bool> {
    let mut has_data = false;
    let mut has_timing = false;
    for child in file.list_children(path)? {
        if child.kind != NodeKind::Array {
            continue;
        }
        match child.name.as_str() {
            DATA => has_data = true,
            TIMESTAMPS | STARTING_TIME => has_timing = true,
            _ => {}
        }
    }
    Ok(has_data && has_timing)
}

/// TimeSeries-shaped groups at any depth below `root`, in traversal order.
pub(crate) fn find_time_series(file: &HierarchicalFile, root: &str) -> Result<Vec<String>> {
    let mut found = Vec::new();
    file.walk(root, None, |node, _| {
        if node.kind() == NodeKind::Group {
            let path = node.path();
            if is_time_series(file, &path)? {
                found.push(path);
            }
        }
        Ok(())
    })?;
    Ok(found)
}

/// Read the series at `path`.
pub(crate) fn read_time_series(file: &HierarchicalFile, path: &str) -> Result<TimeSeries> {
    if !is_time_series(file, path)? {
        return Err(Error::mismatch("TimeSeries group", path));
    }
    let data_path = join_path(path, DATA);
    let data = file.array(&data_path)?;
    let unit = file
        .attributes(&data_path)?
        .get_str("unit")
        .map(str::to_string);
    let samples = if data.ndim() == 0 { 1 } else { data.rows() };

    let ts_path = join_path(path, TIMESTAMPS);
    let timing = if file.exists(&ts_path)? {
        let t = file.array(&ts_path)?.to_f64()?;
        if t.len() != samples {
            return Err(Error::malformed(format!(
                "{path}: {} timestamps for {samples} samples",
                t.len()
            )));
        }
        Timing::Explicit(t)
    } else {
        let st_path = join_path(path, STARTING_TIME);
        let start = file
            .array(&st_path)?
            .scalar_f64()
            .ok_or_else(|| Error::malformed(format!("{st_path} is empty")))?;
        let rate = file
            .attributes(&st_path)?
            .get_f64("rate")
            .filter(|r| *r > 0.0)
            .ok_or_else(|| Error::malformed(format!("{st_path} has no positive rate")))?;
        Timing::Regular { start, rate }
    };

    Ok(TimeSeries {
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        path: path.to_string(),
        data,
        timing,
        unit,
    })
}
