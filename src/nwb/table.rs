//! DynamicTable columns and VectorIndex resolution.
//!
//! An NWB table is a group of equal-length column datasets plus an `id`
//! dataset. A ragged column `x` is stored flat, with `x_index` holding the
//! cumulative end offset of each row.

use std::sync::Arc;

use tracing::warn;

use crate::container::{join_path, ArrayData, ArrayValues, Attributes, HierarchicalFile, NodeKind};
use crate::util::{Error, Result};

/// Suffix of VectorIndex datasets.
pub const INDEX_SUFFIX: &str = "_index";

/// One table column, dense or ragged.
#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    name: String,
    description: Option<String>,
    data: Arc<ArrayData>,
    /// Cumulative row ends for ragged columns.
    ends: Option<Vec<usize>>,
}

impl Column {
    /// A dense column: row `i` is the `i`-th slice along the first axis.
    pub fn dense(name: impl Into<String>, data: Arc<ArrayData>) -> Self {
        Self {
            name: name.into(),
            description: None,
            data,
            ends: None,
        }
    }

    /// A ragged column split by cumulative row ends.
    pub fn ragged(name: impl Into<String>, data: Arc<ArrayData>, ends: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            description: None,
            data,
            ends: Some(ends),
        }
    }

    fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `description` attribute, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Check if rows have varying lengths.
    pub fn is_ragged(&self) -> bool {
        self.ends.is_some()
    }

    /// Underlying flat data.
    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match &self.ends {
            Some(ends) => ends.len(),
            None if self.data.ndim() == 0 => 1,
            None => self.data.rows(),
        }
    }

    /// Check if the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of row `i`.
    pub fn row(&self, i: usize) -> Option<ArrayValues> {
        if i >= self.len() {
            return None;
        }
        let flat_rows = if self.data.ndim() == 0 { 1 } else { self.data.rows() };
        let width = self.data.len() / flat_rows.max(1);
        let (start, end) = match &self.ends {
            Some(ends) => (if i == 0 { 0 } else { ends[i - 1] }, ends[i]),
            None => (i, i + 1),
        };
        Some(self.data.values.slice(start * width, end * width))
    }

    /// Row-ordered strings of a dense text column.
    pub fn as_text(&self) -> Option<&[String]> {
        if self.is_ragged() {
            return None;
        }
        self.data.as_text()
    }

    /// Row-ordered values of a dense one-dimensional numeric column.
    pub fn to_f64(&self) -> Result<Vec<f64>> {
        if self.is_ragged() || self.data.ndim() > 1 {
            return Err(Error::mismatch("one value per row", format!("column {}", self.name)));
        }
        self.data.to_f64()
    }
}

/// Read access to a DynamicTable-shaped group.
pub(crate) struct DynamicTable<'a> {
    file: &'a HierarchicalFile,
    path: String,
    attributes: Arc<Attributes>,
    names: Vec<(String, NodeKind)>,
}

impl<'a> DynamicTable<'a> {
    pub(crate) fn open(file: &'a HierarchicalFile, path: &str) -> Result<Self> {
        let attributes = file.attributes(path)?;
        let names = file
            .list_children(path)?
            .into_iter()
            .map(|c| (c.name, c.kind))
            .collect();
        Ok(Self {
            file,
            path: path.to_string(),
            attributes,
            names,
        })
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Check for an array child.
    pub(crate) fn has_array(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|(n, k)| n == name && *k == NodeKind::Array)
    }

    fn child(&self, name: &str) -> String {
        join_path(&self.path, name)
    }

    /// Materialize a child array.
    pub(crate) fn array(&self, name: &str) -> Result<Arc<ArrayData>> {
        self.file.array(&self.child(name))
    }

    /// Column names in `colnames` order, or child order without `colnames`.
    /// `id`, VectorIndex datasets and `exclude` are left out.
    pub(crate) fn column_names(&self, exclude: &[&str]) -> Vec<String> {
        let keep = |n: &str| n != "id" && !n.ends_with(INDEX_SUFFIX) && !exclude.contains(&n);
        match self.attributes.get_strings("colnames") {
            Some(colnames) => colnames.into_iter().filter(|n| keep(n.as_str())).collect(),
            None => self
                .names
                .iter()
                .filter(|(n, k)| *k == NodeKind::Array && keep(n.as_str()))
                .map(|(n, _)| n.clone())
                .collect(),
        }
    }

    /// Row ids from `id`, or `0..rows` when the table has none.
    pub(crate) fn ids(&self, rows: usize) -> Result<Vec<i64>> {
        if !self.has_array("id") {
            return Ok((0..rows as i64).collect());
        }
        let ids = self.array("id")?.to_i64()?;
        if ids.len() != rows {
            return Err(Error::malformed(format!(
                "{}: {} ids for {} rows",
                self.path,
                ids.len(),
                rows
            )));
        }
        Ok(ids)
    }

    /// Row ends from `<name>_index`, checked against the flat data length.
    pub(crate) fn index_for(&self, name: &str, flat_rows: usize) -> Result<Option<Vec<usize>>> {
        let index_name = format!("{name}{INDEX_SUFFIX}");
        if !self.has_array(&index_name) {
            return Ok(None);
        }
        let raw = self.array(&index_name)?.to_i64()?;
        let mut ends = Vec::with_capacity(raw.len());
        let mut prev = 0usize;
        for (i, &end) in raw.iter().enumerate() {
            let end = usize::try_from(end).map_err(|_| {
                Error::malformed(format!("{}/{index_name}[{i}] is negative", self.path))
            })?;
            if end < prev || end > flat_rows {
                return Err(Error::malformed(format!(
                    "{}/{index_name}[{i}] = {end} is not a valid row end (previous {prev}, data {flat_rows})",
                    self.path
                )));
            }
            ends.push(end);
            prev = end;
        }
        if prev != flat_rows {
            return Err(Error::malformed(format!(
                "{}/{index_name} ends at {prev} but {name} has {flat_rows} rows",
                self.path
            )));
        }
        Ok(Some(ends))
    }

    /// Read every auxiliary column.
    ///
    /// Columns whose payload can't be decoded are returned by name in the
    /// second list, with a warning. Row-count mismatches and transport
    /// failures are errors.
    pub(crate) fn columns(&self, rows: usize, exclude: &[&str]) -> Result<(Vec<Column>, Vec<String>)> {
        let mut columns = Vec::new();
        let mut skipped = Vec::new();

        for name in self.column_names(exclude) {
            if !self.has_array(&name) {
                warn!("{}: column {name:?} listed in colnames is absent", self.path);
                skipped.push(name);
                continue;
            }
            let data = match self.array(&name) {
                Ok(data) => data,
                Err(Error::MalformedContainer(reason)) => {
                    warn!("{}: skipping column {name:?}: {reason}", self.path);
                    skipped.push(name);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let flat_rows = if data.ndim() == 0 { 1 } else { data.rows() };
            let description = self
                .file
                .attributes(&self.child(&name))?
                .get_str("description")
                .map(str::to_string);
            let column = match self.index_for(&name, flat_rows)? {
                Some(ends) => Column::ragged(name, data, ends),
                None => Column::dense(name, data),
            }
            .with_description(description);

            if column.len() != rows {
                return Err(Error::malformed(format!(
                    "{}: column {:?} has {} rows, table has {}",
                    self.path,
                    column.name(),
                    column.len(),
                    rows
                )));
            }
            columns.push(column);
        }
        Ok((columns, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::DataType;
    use smallvec::smallvec;

    fn floats(v: &[f64]) -> Arc<ArrayData> {
        Arc::new(
            ArrayData::new(
                DataType::FLOAT64,
                smallvec![v.len() as u64],
                ArrayValues::Float(v.to_vec()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_dense_rows() {
        let col = Column::dense("x", floats(&[1.0, 2.0, 3.0]));
        assert_eq!(col.len(), 3);
        assert_eq!(col.row(1), Some(ArrayValues::Float(vec![2.0])));
        assert_eq!(col.row(3), None);
        assert_eq!(col.to_f64().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_two_dimensional_rows() {
        let data = Arc::new(
            ArrayData::new(
                DataType::FLOAT64,
                smallvec![2, 2],
                ArrayValues::Float(vec![0.0, 1.0, 2.0, 3.0]),
            )
            .unwrap(),
        );
        let col = Column::dense("obs", data);
        assert_eq!(col.len(), 2);
        assert_eq!(col.row(1), Some(ArrayValues::Float(vec![2.0, 3.0])));
        assert!(col.to_f64().is_err());
    }

    #[test]
    fn test_ragged_rows() {
        let col = Column::ragged("x", floats(&[1.0, 2.0, 3.0]), vec![2, 2, 3]);
        assert!(col.is_ragged());
        assert_eq!(col.len(), 3);
        assert_eq!(col.row(0), Some(ArrayValues::Float(vec![1.0, 2.0])));
        assert_eq!(col.row(1), Some(ArrayValues::Float(vec![])));
        assert_eq!(col.row(2), Some(ArrayValues::Float(vec![3.0])));
        assert!(col.as_text().is_none());
    }
}
