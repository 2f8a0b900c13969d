//! Heaps: link names of old-style groups, variable-length string data, and
//! the fractal heaps behind dense link and attribute storage.

use std::collections::HashMap;

use super::format::{encoded_size, verify_checksum, FileIo};
use crate::util::{Error, Result};

/// Local heap holding the link names of a symbol-table group.
pub struct LocalHeap {
    data: Vec<u8>,
}

impl LocalHeap {
    pub fn read(io: &FileIo, addr: u64) -> Result<Self> {
        let sizes = io.sizes();
        let header_len = 8 + 2 * sizes.length as u64 + sizes.offset as u64;
        let header = io.read(addr, header_len, "local heap")?;
        let mut f = io.fields(&header, "local heap");
        f.signature(b"HEAP")?;
        f.skip(4)?; // version, reserved
        let size = f.length()?;
        f.length()?; // free list head
        let data_addr = f
            .address()?
            .ok_or_else(|| Error::malformed("local heap without a data segment"))?;
        Ok(Self {
            data: io.read(data_addr, size, "local heap data")?,
        })
    }

    /// NUL-terminated string at `offset`.
    pub fn name_at(&self, offset: u64) -> Result<String> {
        let tail = usize::try_from(offset)
            .ok()
            .and_then(|o| self.data.get(o..))
            .ok_or_else(|| Error::malformed(format!("local heap offset {offset} out of range")))?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
    }
}

/// One global heap collection, holding variable-length element data.
pub struct GlobalHeap {
    objects: HashMap<u32, Vec<u8>>,
}

impl GlobalHeap {
    pub fn read(io: &FileIo, addr: u64) -> Result<Self> {
        let sizes = io.sizes();
        let prefix_len = 8 + sizes.length as u64;
        let prefix = io.read(addr, prefix_len, "global heap")?;
        let mut f = io.fields(&prefix, "global heap");
        f.signature(b"GCOL")?;
        f.skip(4)?;
        let size = f.length()?;
        if size < prefix_len {
            return Err(Error::malformed(format!("global heap at {addr:#x} has size {size}")));
        }

        let block = io.read(addr, size, "global heap")?;
        let mut f = io.fields(&block, "global heap object");
        f.skip(prefix_len as usize)?;
        let mut objects = HashMap::new();
        // Object 0 is free space and ends the list
        while f.remaining() >= 8 + sizes.length as usize {
            let index = f.u16()?;
            if index == 0 {
                break;
            }
            f.skip(6)?; // reference count, reserved
            let len = f.length()? as usize;
            let data = f.take(len)?;
            objects.insert(index as u32, data.to_vec());
            let pad = len.div_ceil(8) * 8 - len;
            f.skip(pad.min(f.remaining()))?;
        }
        Ok(Self { objects })
    }

    pub fn object(&self, index: u32) -> Result<&[u8]> {
        self.objects
            .get(&index)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::malformed(format!("global heap object {index} not found")))
    }
}

/// Fractal heap header and the geometry of its doubling table.
pub struct FractalHeap {
    addr: u64,
    id_len: usize,
    width: u64,
    start_block: u64,
    max_direct: u64,
    root: Option<u64>,
    root_rows: u64,
    offset_size: usize,
    length_size: usize,
}

impl FractalHeap {
    pub fn open(io: &FileIo, addr: u64) -> Result<Self> {
        let sizes = io.sizes();
        let (o, l) = (sizes.offset as u64, sizes.length as u64);
        let header_len = 4 + 1 + 2 + 2 + 1 + 4 + 12 * l + 3 * o + 2 + 2 + 2 + 2 + 4;
        let header = io.read(addr, header_len, "fractal heap header")?;
        let mut f = io.fields(&header, "fractal heap header");
        f.signature(b"FRHP")?;
        f.skip(1)?;
        let id_len = f.u16()? as usize;
        let filter_len = f.u16()?;
        f.skip(1)?; // flags
        let max_managed = f.u32()? as u64;
        f.length()?; // next huge id
        f.address()?; // huge object index
        f.length()?; // free space
        f.address()?; // free space manager
        for _ in 0..8 {
            f.length()?; // managed, huge and tiny object bookkeeping
        }
        let width = f.u16()? as u64;
        let start_block = f.length()?;
        let max_direct = f.length()?;
        let max_heap_bits = f.u16()? as usize;
        f.u16()?; // starting rows
        let root = f.address()?;
        let root_rows = f.u16()? as u64;
        if filter_len > 0 {
            return Err(Error::malformed("filtered fractal heaps are not supported"));
        }
        verify_checksum(&header[..f.pos() + 4], "fractal heap header")?;

        if width == 0 || !start_block.is_power_of_two() || !max_direct.is_power_of_two() {
            return Err(Error::malformed("fractal heap with an invalid doubling table"));
        }
        let offset_size = max_heap_bits.div_ceil(8);
        let length_size = (log2(max_direct) as usize)
            .div_ceil(8)
            .min(encoded_size(max_managed));
        Ok(Self {
            addr,
            id_len,
            width,
            start_block,
            max_direct,
            root,
            root_rows,
            offset_size,
            length_size,
        })
    }

    /// Length of heap IDs in records that point into this heap.
    pub fn id_len(&self) -> usize {
        self.id_len
    }

    /// Bytes of the object named by heap ID `id`.
    pub fn object(&self, io: &FileIo, id: &[u8]) -> Result<Vec<u8>> {
        let first = *id.first().ok_or_else(|| Error::malformed("empty heap ID"))?;
        match (first >> 4) & 0x03 {
            0 => {
                let mut f = io.fields(&id[1..], "heap ID");
                let offset = f.uint(self.offset_size)?;
                let len = f.uint(self.length_size)?;
                self.managed(io, offset, len)
            }
            2 => {
                let len = (first & 0x0F) as usize + 1;
                id.get(1..1 + len)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| Error::malformed("tiny heap object overruns its ID"))
            }
            1 => Err(Error::malformed("huge fractal heap objects are not supported")),
            t => Err(Error::malformed(format!("unknown heap ID type {t}"))),
        }
    }

    fn row_size(&self, row: u64) -> u64 {
        if row == 0 {
            self.start_block
        } else {
            self.start_block << (row - 1)
        }
    }

    fn max_direct_rows(&self) -> u64 {
        log2(self.max_direct) - log2(self.start_block) + 2
    }

    fn managed(&self, io: &FileIo, offset: u64, len: u64) -> Result<Vec<u8>> {
        let root = self
            .root
            .ok_or_else(|| Error::malformed("fractal heap has no root block"))?;
        let (mut block, mut block_offset, mut rows) = (root, 0u64, self.root_rows);
        let mut size = self.start_block;

        // Descend indirect blocks until the direct block holding `offset`
        for _ in 0..64 {
            if rows == 0 {
                return self.read_direct(io, block, block_offset, size, offset, len);
            }
            let (child, child_offset, child_size, direct) =
                self.locate(io, block, block_offset, rows, offset)?;
            block = child;
            block_offset = child_offset;
            size = child_size;
            rows = if direct {
                0
            } else {
                log2(child_size) - log2(self.start_block * self.width) + 1
            };
        }
        Err(Error::malformed("fractal heap nesting too deep"))
    }

    /// Find the child of an indirect block covering `offset`. Returns its
    /// address, heap offset, size and whether it is a direct block.
    fn locate(
        &self,
        io: &FileIo,
        block: u64,
        block_offset: u64,
        rows: u64,
        offset: u64,
    ) -> Result<(u64, u64, u64, bool)> {
        let o = io.sizes().offset as u64;
        let entries = rows * self.width;
        let prefix = 4 + 1 + o + self.offset_size as u64;
        let body = io.read(block, prefix + entries * o, "fractal heap indirect block")?;
        let mut f = io.fields(&body, "fractal heap indirect block");
        f.signature(b"FHIB")?;
        f.skip(1 + o as usize + self.offset_size)?;

        let direct_rows = self.max_direct_rows();
        let mut start = block_offset;
        for row in 0..rows {
            let size = self.row_size(row);
            for _ in 0..self.width {
                let child = f.address()?;
                if (start..start + size).contains(&offset) {
                    let child = child.ok_or_else(|| {
                        Error::malformed(format!("fractal heap offset {offset} is unallocated"))
                    })?;
                    return Ok((child, start, size, row < direct_rows));
                }
                start += size;
            }
        }
        Err(Error::malformed(format!("fractal heap offset {offset} out of range")))
    }

    fn read_direct(
        &self,
        io: &FileIo,
        block: u64,
        block_offset: u64,
        size: u64,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        let o = io.sizes().offset as u64;
        let header_len = 4 + 1 + o + self.offset_size as u64;
        let head = io.read(block, header_len, "fractal heap direct block")?;
        let mut f = io.fields(&head, "fractal heap direct block");
        f.signature(b"FHDB")?;
        f.skip(1)?;
        if f.address()? != Some(self.addr) {
            return Err(Error::malformed("direct block belongs to another heap"));
        }
        // Block checksums (flag 0x02) cover the block with the field zeroed; not verified
        let within = offset - block_offset;
        if within < header_len || within.checked_add(len).map_or(true, |end| end > size) {
            return Err(Error::malformed(format!(
                "heap object at {offset} (+{len}) leaves its block"
            )));
        }
        io.read(block + within, len, "fractal heap object")
    }
}

#[inline]
fn log2(n: u64) -> u64 {
    63 - n.max(1).leading_zeros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log2() {
        assert_eq!(log2(1), 0);
        assert_eq!(log2(512), 9);
        assert_eq!(log2(65536), 16);
    }
}
