//! B-tree walkers: version 1 trees of group entries and chunks, and version 2
//! trees whose raw records are handed back to the caller.

use std::collections::HashSet;

use super::format::{encoded_size, verify_checksum, FileIo};
use crate::container::Shape;
use crate::util::{Error, Result};

/// Deepest tree accepted before a file is treated as corrupt.
const MAX_DEPTH: usize = 32;

/// A symbol table entry: link name offset and object header address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolEntry {
    pub name_offset: u64,
    pub header: u64,
}

/// One stored chunk of a dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Grid position (element offset divided by chunk extent).
    pub index: Shape,
    pub address: u64,
    /// Stored size in bytes, after filters.
    pub size: u64,
    /// Filters skipped for this chunk.
    pub filter_mask: u32,
}

struct NodeV1 {
    level: u8,
    keys: Vec<Vec<u8>>,
    children: Vec<u64>,
}

fn read_node_v1(io: &FileIo, addr: u64, node_type: u8, key_len: usize) -> Result<NodeV1> {
    let o = io.sizes().offset as usize;
    let head_len = 8 + 2 * o;
    let head = io.read(addr, head_len as u64, "B-tree node")?;
    let mut f = io.fields(&head, "B-tree node");
    f.signature(b"TREE")?;
    let kind = f.u8()?;
    if kind != node_type {
        return Err(Error::malformed(format!(
            "B-tree node at {addr:#x} has type {kind}, expected {node_type}"
        )));
    }
    let level = f.u8()?;
    let entries = f.u16()? as usize;

    let body_len = entries * (key_len + o) + key_len;
    let body = io.read(addr + head_len as u64, body_len as u64, "B-tree node")?;
    let mut f = io.fields(&body, "B-tree node");
    let mut keys = Vec::with_capacity(entries + 1);
    let mut children = Vec::with_capacity(entries);
    for _ in 0..entries {
        keys.push(f.take(key_len)?.to_vec());
        children.push(
            f.address()?
                .ok_or_else(|| Error::malformed("B-tree child with an undefined address"))?,
        );
    }
    keys.push(f.take(key_len)?.to_vec());
    Ok(NodeV1 {
        level,
        keys,
        children,
    })
}

/// Depth-first walk of a version 1 tree, calling `leaf` with each leaf
/// child and the key to its left.
fn walk_v1(
    io: &FileIo,
    root: u64,
    node_type: u8,
    key_len: usize,
    mut leaf: impl FnMut(&[u8], u64) -> Result<()>,
) -> Result<()> {
    let mut stack = vec![(root, 0usize)];
    let mut seen = HashSet::new();
    while let Some((addr, depth)) = stack.pop() {
        if depth > MAX_DEPTH || !seen.insert(addr) {
            return Err(Error::malformed(format!("B-tree at {root:#x} has a cycle")));
        }
        let node = read_node_v1(io, addr, node_type, key_len)?;
        if node.level == 0 {
            for (key, &child) in node.keys.iter().zip(&node.children) {
                leaf(key, child)?;
            }
        } else {
            // Reversed so the stack pops children left to right
            for &child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
    }
    Ok(())
}

/// Every entry of an old-style group's symbol table B-tree.
pub fn group_entries(io: &FileIo, root: u64) -> Result<Vec<SymbolEntry>> {
    let sizes = io.sizes();
    let mut entries = Vec::new();
    walk_v1(io, root, 0, sizes.length as usize, |_, snod| {
        entries.extend(read_symbol_node(io, snod)?);
        Ok(())
    })?;
    Ok(entries)
}

fn read_symbol_node(io: &FileIo, addr: u64) -> Result<Vec<SymbolEntry>> {
    let o = io.sizes().offset as usize;
    let head = io.read(addr, 8, "symbol table node")?;
    let mut f = io.fields(&head, "symbol table node");
    f.signature(b"SNOD")?;
    f.skip(2)?; // version, reserved
    let count = f.u16()? as usize;

    let entry_len = 2 * o + 24;
    let body = io.read(addr + 8, (count * entry_len) as u64, "symbol table node")?;
    let mut f = io.fields(&body, "symbol table entry");
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let name_offset = f.address()?.unwrap_or(0);
        let header = f
            .address()?
            .ok_or_else(|| Error::malformed("symbol table entry without an object header"))?;
        f.skip(24)?; // cache type, reserved, scratch pad
        out.push(SymbolEntry {
            name_offset,
            header,
        });
    }
    Ok(out)
}

/// Every chunk of a dataset indexed by a version 1 B-tree.
pub fn chunks_v1(io: &FileIo, root: u64, chunk: &[u64]) -> Result<Vec<ChunkRecord>> {
    // Keys hold one offset per dimension plus the element-size dimension
    let rank = chunk.len();
    let key_len = 8 + 8 * (rank + 1);
    let mut out = Vec::new();
    walk_v1(io, root, 1, key_len, |key, address| {
        let mut f = io.fields(key, "chunk key");
        let size = f.u32()? as u64;
        let filter_mask = f.u32()?;
        let mut index = Shape::with_capacity(rank);
        for &c in chunk {
            index.push(f.u64()? / c);
        }
        out.push(ChunkRecord {
            index,
            address,
            size,
            filter_mask,
        });
        Ok(())
    })?;
    Ok(out)
}

/// Header of a version 2 B-tree plus the per-depth node geometry.
pub struct BTreeV2 {
    kind: u8,
    node_size: u64,
    record_size: usize,
    depth: u16,
    root: Option<u64>,
    root_records: u16,
    /// Most records per node at each depth.
    max_records: Vec<u64>,
    /// Width of the per-child total record count at each depth.
    total_width: Vec<usize>,
    record_count_width: usize,
}

impl BTreeV2 {
    pub fn open(io: &FileIo, addr: u64) -> Result<Self> {
        let sizes = io.sizes();
        let len = 4 + 1 + 1 + 4 + 2 + 2 + 1 + 1 + sizes.offset as u64 + 2 + sizes.length as u64 + 4;
        let header = io.read(addr, len, "B-tree v2 header")?;
        verify_checksum(&header, "B-tree v2 header")?;
        let mut f = io.fields(&header, "B-tree v2 header");
        f.signature(b"BTHD")?;
        f.skip(1)?;
        let kind = f.u8()?;
        let node_size = f.u32()? as u64;
        let record_size = f.u16()? as usize;
        let depth = f.u16()?;
        f.skip(2)?; // split and merge percent
        let root = f.address()?;
        let root_records = f.u16()?;

        if record_size == 0 || node_size <= 10 || depth as usize > MAX_DEPTH {
            return Err(Error::malformed("B-tree v2 with an invalid node layout"));
        }
        let prefix = 10u64;
        let leaf_max = (node_size - prefix) / record_size as u64;
        let record_count_width = encoded_size(leaf_max);
        let mut max_records = vec![leaf_max];
        let mut cumulative = vec![leaf_max];
        let mut total_width = vec![0usize];
        for d in 1..=depth as usize {
            let pointer = sizes.offset as u64
                + record_count_width as u64
                + if d > 1 { total_width[d - 1] as u64 } else { 0 };
            let max = (node_size - prefix).saturating_sub(pointer) / (record_size as u64 + pointer);
            let cum = (max + 1)
                .saturating_mul(cumulative[d - 1])
                .saturating_add(max);
            max_records.push(max);
            cumulative.push(cum);
            total_width.push(encoded_size(cum));
        }
        Ok(Self {
            kind,
            node_size,
            record_size,
            depth,
            root,
            root_records,
            max_records,
            total_width,
            record_count_width,
        })
    }

    /// Record type stored in this tree.
    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Raw records of every node, left to right.
    pub fn records(&self, io: &FileIo) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.visit(io, root, self.root_records as u64, self.depth as usize, &mut out)?;
        }
        Ok(out)
    }

    fn visit(
        &self,
        io: &FileIo,
        addr: u64,
        records: u64,
        depth: usize,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        if records > self.max_records[depth] {
            return Err(Error::malformed(format!(
                "B-tree v2 node at {addr:#x} claims {records} records"
            )));
        }
        let block = io.read(addr, self.node_size, "B-tree v2 node")?;
        let mut f = io.fields(&block, "B-tree v2 node");
        f.signature(if depth == 0 { b"BTLF" } else { b"BTIN" })?;
        f.skip(2)?; // version, type

        let mut own = Vec::with_capacity(records as usize);
        for _ in 0..records {
            own.push(f.take(self.record_size)?.to_vec());
        }
        if depth == 0 {
            let end = f.pos();
            verify_checksum(&block[..end + 4], "B-tree v2 leaf")?;
            out.extend(own);
            return Ok(());
        }

        let mut children = Vec::with_capacity(records as usize + 1);
        for _ in 0..=records {
            let child = f
                .address()?
                .ok_or_else(|| Error::malformed("B-tree v2 child with an undefined address"))?;
            let count = f.uint(self.record_count_width)?;
            if depth > 1 {
                f.uint(self.total_width[depth - 1])?;
            }
            children.push((child, count));
        }
        let end = f.pos();
        verify_checksum(&block[..end + 4], "B-tree v2 internal node")?;

        // Records sit between their neighbouring subtrees
        let mut own = own.into_iter();
        for (i, (child, count)) in children.into_iter().enumerate() {
            if i > 0 {
                out.extend(own.next());
            }
            self.visit(io, child, count, depth - 1, out)?;
        }
        Ok(())
    }
}
