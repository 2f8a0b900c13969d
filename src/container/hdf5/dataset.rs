//! Dataset metadata and the chunk lists of each chunk index type.

use super::btree::{chunks_v1, BTreeV2, ChunkRecord};
use super::format::{verify_checksum, FileIo};
use super::messages::{
    parse_fill_value, ChunkIndex, Dataspace, Datatype, FilterPipeline, Layout,
};
use super::object_header::{
    ObjectHeader, MSG_DATASPACE, MSG_DATATYPE, MSG_FILL_VALUE, MSG_FILL_VALUE_OLD,
    MSG_FILTER_PIPELINE, MSG_LAYOUT,
};
use crate::container::{chunk_grid, grid_positions, shape_len, ArrayInfo, Shape};
use crate::util::{Error, Result};

/// B-tree v2 record types of chunk indexes.
const RECORD_CHUNK: u8 = 10;
const RECORD_FILTERED_CHUNK: u8 = 11;

/// Everything needed to read one dataset.
#[derive(Clone, Debug)]
pub struct Dataset {
    pub space: Dataspace,
    pub datatype: Datatype,
    pub layout: Layout,
    pub filters: FilterPipeline,
    /// One element of fill value, if the file defines one.
    pub fill: Option<Vec<u8>>,
}

impl Dataset {
    /// Collect the dataset messages of `header`.
    pub fn from_header(io: &FileIo, header: &ObjectHeader) -> Result<Self> {
        let sizes = io.sizes();
        let required = |kind: u16, what: &str| {
            header
                .find(kind)
                .ok_or_else(|| Error::malformed(format!("dataset has no {what} message")))
        };
        let space = Dataspace::parse(&header.resolve(io, required(MSG_DATASPACE, "dataspace")?)?, sizes)?;
        let datatype = Datatype::parse(&header.resolve(io, required(MSG_DATATYPE, "datatype")?)?, sizes)?;
        let layout = Layout::parse(&required(MSG_LAYOUT, "layout")?.data, sizes, space.shape.len())?;
        let filters = match header.find(MSG_FILTER_PIPELINE) {
            Some(m) => FilterPipeline::parse(&header.resolve(io, m)?, sizes)?,
            None => FilterPipeline::default(),
        };
        let fill = match header
            .find(MSG_FILL_VALUE)
            .or_else(|| header.find(MSG_FILL_VALUE_OLD))
        {
            Some(m) => parse_fill_value(m.kind, &header.resolve(io, m)?, sizes)?,
            None => None,
        }
        .filter(|bytes| bytes.len() == datatype.size);
        Ok(Self {
            space,
            datatype,
            layout,
            filters,
            fill,
        })
    }

    /// Metadata reported for the array node.
    pub fn info(&self) -> Result<ArrayInfo> {
        Ok(ArrayInfo {
            dtype: self.datatype.dtype()?,
            shape: self.space.shape.clone(),
            codec: self.filters.describe(),
        })
    }

    /// Bytes of one full chunk after filters are undone.
    pub fn chunk_bytes(&self, chunk: &[u64]) -> Result<u64> {
        shape_len(chunk)?
            .checked_mul(self.datatype.size as u64)
            .ok_or_else(|| Error::malformed("chunk size overflows"))
    }

    /// Stored chunks of a chunked dataset. Unallocated chunks are omitted.
    pub fn chunks(&self, io: &FileIo) -> Result<Vec<ChunkRecord>> {
        let Layout::Chunked { chunk, index } = &self.layout else {
            return Ok(Vec::new());
        };
        let grid = chunk_grid(&self.space.shape, chunk);
        let chunk_bytes = self.chunk_bytes(chunk)?;
        match index {
            ChunkIndex::BTreeV1(None)
            | ChunkIndex::Single { address: None, .. }
            | ChunkIndex::Implicit(None)
            | ChunkIndex::FixedArray(None)
            | ChunkIndex::BTreeV2(None) => Ok(Vec::new()),
            ChunkIndex::BTreeV1(Some(root)) => chunks_v1(io, *root, chunk),
            ChunkIndex::Single {
                address: Some(address),
                filtered,
            } => {
                let (size, filter_mask) = filtered.unwrap_or((chunk_bytes, 0));
                Ok(vec![ChunkRecord {
                    index: Shape::from_elem(0, chunk.len()),
                    address: *address,
                    size,
                    filter_mask,
                }])
            }
            ChunkIndex::Implicit(Some(base)) => grid_positions(&grid)
                .enumerate()
                .map(|(i, index)| {
                    let address = (i as u64)
                        .checked_mul(chunk_bytes)
                        .and_then(|off| off.checked_add(*base))
                        .ok_or_else(|| Error::malformed("implicit chunk address overflows"))?;
                    Ok(ChunkRecord {
                        index,
                        address,
                        size: chunk_bytes,
                        filter_mask: 0,
                    })
                })
                .collect(),
            ChunkIndex::FixedArray(Some(header)) => {
                fixed_array_chunks(io, *header, &grid, chunk_bytes)
            }
            ChunkIndex::BTreeV2(Some(header)) => btree_v2_chunks(io, *header, chunk.len(), chunk_bytes),
            ChunkIndex::ExtensibleArray => Err(Error::malformed(
                "extensible array chunk indexes are not supported",
            )),
        }
    }
}

/// Chunks listed by a fixed array index, in grid order.
fn fixed_array_chunks(
    io: &FileIo,
    header_addr: u64,
    grid: &[u64],
    chunk_bytes: u64,
) -> Result<Vec<ChunkRecord>> {
    let sizes = io.sizes();
    let o = sizes.offset as u64;
    let header_len = 4 + 1 + 1 + 1 + 1 + sizes.length as u64 + o + 4;
    let header = io.read(header_addr, header_len, "fixed array header")?;
    verify_checksum(&header, "fixed array header")?;
    let mut f = io.fields(&header, "fixed array header");
    f.signature(b"FAHD")?;
    f.skip(1)?;
    let client = f.u8()?;
    let entry_size = f.u8()? as u64;
    let page_bits = f.u8()?;
    let max_entries = f.length()?;
    let Some(data_block) = f.address()? else {
        return Ok(Vec::new());
    };
    let min_entry = if client == 1 { o + 4 } else { o };
    if page_bits >= 32 || entry_size < min_entry {
        return Err(Error::malformed("fixed array with an invalid layout"));
    }

    // Runs of stored entries: (address, entry count, linear index of the first)
    let page_len = 1u64 << page_bits;
    let prefix = 4 + 1 + 1 + o;
    let mut runs = Vec::new();
    if max_entries <= page_len {
        runs.push((data_block + prefix, max_entries, 0));
    } else {
        let pages = max_entries.div_ceil(page_len);
        let bitmap_len = pages.div_ceil(8);
        let bitmap = io.read(data_block + prefix, bitmap_len, "fixed array page bitmap")?;
        let mut page_addr = data_block + prefix + bitmap_len + 4;
        for page in 0..pages {
            let entries = page_len.min(max_entries - page * page_len);
            let present = bitmap[(page / 8) as usize] & (0x80 >> (page % 8)) != 0;
            if present {
                runs.push((page_addr, entries, page * page_len));
            }
            page_addr += entries * entry_size + 4;
        }
    }

    let total = shape_len(grid)?;
    let mut out = Vec::new();
    for (addr, entries, mut linear) in runs {
        let bytes = io.read(addr, entries * entry_size, "fixed array entries")?;
        let mut f = io.fields(&bytes, "fixed array entry");
        for _ in 0..entries {
            let address = f.address()?;
            let (size, filter_mask) = if client == 1 {
                let width = (entry_size - o - 4) as usize;
                (f.uint(width)?, f.u32()?)
            } else {
                f.skip((entry_size - o) as usize)?;
                (chunk_bytes, 0)
            };
            if let Some(address) = address.filter(|_| linear < total) {
                out.push(ChunkRecord {
                    index: unravel(linear, grid),
                    address,
                    size,
                    filter_mask,
                });
            }
            linear += 1;
        }
    }
    Ok(out)
}

/// Grid position of the `linear`-th chunk in C order.
fn unravel(mut linear: u64, grid: &[u64]) -> Shape {
    let mut index = Shape::from_elem(0, grid.len());
    for d in (0..grid.len()).rev() {
        index[d] = linear % grid[d];
        linear /= grid[d];
    }
    index
}

/// Chunks listed by a version 2 B-tree index.
fn btree_v2_chunks(
    io: &FileIo,
    header: u64,
    rank: usize,
    chunk_bytes: u64,
) -> Result<Vec<ChunkRecord>> {
    let tree = BTreeV2::open(io, header)?;
    let o = io.sizes().offset as usize;
    let filtered = match tree.kind() {
        RECORD_CHUNK => false,
        RECORD_FILTERED_CHUNK => true,
        other => {
            return Err(Error::malformed(format!(
                "B-tree v2 record type {other} is not a chunk index"
            )));
        }
    };
    let size_width = tree
        .record_size()
        .checked_sub(o + 8 * rank + if filtered { 4 } else { 0 })
        .ok_or_else(|| Error::malformed("chunk records too small for their rank"))?;

    tree.records(io)?
        .iter()
        .map(|record| {
            let mut f = io.fields(record, "chunk record");
            let address = f
                .address()?
                .ok_or_else(|| Error::malformed("chunk record with an undefined address"))?;
            let (size, filter_mask) = if filtered {
                (f.uint(size_width)?, f.u32()?)
            } else {
                (chunk_bytes, 0)
            };
            let mut index = Shape::with_capacity(rank);
            for _ in 0..rank {
                index.push(f.u64()?);
            }
            Ok(ChunkRecord {
                index,
                address,
                size,
                filter_mask,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unravel_matches_grid_order() {
        let grid = [2, 3, 2];
        for (i, position) in grid_positions(&grid).enumerate() {
            assert_eq!(unravel(i as u64, &grid), position);
        }
    }
}
