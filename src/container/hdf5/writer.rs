//! HDF5 writer for small files of groups, datasets, and attributes.
//!
//! Children are written before their parents, so every address refers to
//! bytes already in the stream; the superblock is patched in last.
//! [`Format::Earliest`] produces the symbol-table layout of old files and
//! [`Format::Latest`] the link-message layout with checksummed metadata.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::Path;

use serde_json::{Map, Number, Value};
use smallvec::smallvec;

use super::format::{checksum, HDF5_MAGIC};
use super::messages::{pad8, FILTER_DEFLATE, FILTER_SHUFFLE};
use super::object_header::{
    MSG_ATTRIBUTE, MSG_DATASPACE, MSG_DATATYPE, MSG_FILL_VALUE, MSG_FILTER_PIPELINE,
    MSG_GROUP_INFO, MSG_LAYOUT, MSG_LINK, MSG_LINK_INFO, MSG_SYMBOL_TABLE,
};
use crate::container::{
    chunk_grid, element_count, grid_positions, shape_len, shuffle, Codec, Shape,
};
use crate::util::{DataType, Endianness, Error, Result, ScalarKind};

const UNDEFINED: u64 = u64::MAX;

/// Symbol table node capacity: twice the group leaf K.
const GROUP_LEAF_K: u16 = 4;
const GROUP_INTERNAL_K: u16 = 16;
/// Chunk B-tree nodes hold up to twice this many chunks.
const CHUNK_K: usize = 32;

/// Groups with more links than this use dense storage.
pub const MAX_COMPACT_LINKS: usize = 8;

const GLOBAL_HEAP_MIN_SIZE: usize = 4096;
const VLEN_ELEMENT_SIZE: u32 = 16;
const FIXED_ARRAY_PAGE_BITS: u8 = 10;
const DEFLATE_LEVEL: u32 = 6;

/// Which generation of the file layout to write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// Superblock v0, version 1 object headers, symbol-table groups.
    Earliest,
    /// Superblock v2, version 2 object headers, link messages.
    #[default]
    Latest,
}

/// Output stream tracking the current write position.
pub struct OStream<W: Write + Seek> {
    writer: W,
    pos: u64,
}

impl<W: Write + Seek> OStream<W> {
    /// Wrap a writer positioned at the start of the file.
    pub fn new(writer: W) -> Self {
        Self { writer, pos: 0 }
    }

    /// Current write position.
    #[inline]
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Write bytes and advance.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }

    /// Write bytes, returning the address they start at.
    pub fn append(&mut self, data: &[u8]) -> Result<u64> {
        let addr = self.pos;
        self.write_bytes(data)?;
        Ok(addr)
    }

    /// Seek to an absolute position.
    pub fn seek(&mut self, pos: u64) -> Result<u64> {
        self.pos = self.writer.seek(SeekFrom::Start(pos))?;
        Ok(self.pos)
    }

    /// Flush and hand back the writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

enum Payload {
    Raw(Vec<u8>),
    Strings(Vec<String>),
}

/// A dataset to be written.
pub struct ArrayBuilder {
    dtype: DataType,
    shape: Shape,
    payload: Payload,
    attributes: Map<String, Value>,
    chunks: Option<Shape>,
    deflate: bool,
    shuffle: bool,
}

impl ArrayBuilder {
    /// Raw element bytes in the dtype's byte order.
    pub fn raw(dtype: DataType, shape: &[u64], bytes: Vec<u8>) -> Self {
        Self {
            dtype,
            shape: Shape::from_slice(shape),
            payload: Payload::Raw(bytes),
            attributes: Map::new(),
            chunks: None,
            deflate: false,
            shuffle: false,
        }
    }

    /// One-dimensional f64 array.
    pub fn f64s(values: &[f64]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::raw(DataType::FLOAT64, &[values.len() as u64], bytes)
    }

    /// One-dimensional i64 array.
    pub fn i64s(values: &[i64]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::raw(DataType::INT64, &[values.len() as u64], bytes)
    }

    /// One-dimensional variable-length string array.
    pub fn strings<S: AsRef<str>>(values: &[S]) -> Self {
        Self {
            dtype: DataType::OBJECT,
            shape: smallvec![values.len() as u64],
            payload: Payload::Strings(values.iter().map(|s| s.as_ref().to_string()).collect()),
            attributes: Map::new(),
            chunks: None,
            deflate: false,
            shuffle: false,
        }
    }

    /// Scalar string dataset.
    pub fn scalar_str(value: &str) -> Self {
        Self::strings(&[value]).with_shape(&[])
    }

    /// Scalar f64 dataset.
    pub fn scalar_f64(value: f64) -> Self {
        Self::f64s(&[value]).with_shape(&[])
    }

    /// Reinterpret the payload with another shape of the same size.
    pub fn with_shape(mut self, shape: &[u64]) -> Self {
        self.shape = Shape::from_slice(shape);
        self
    }

    /// Attach an attribute.
    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Store in chunks of the given extents.
    pub fn chunked(mut self, chunks: &[u64]) -> Self {
        self.chunks = Some(Shape::from_slice(chunks));
        self
    }

    /// Deflate each chunk (one chunk for the whole array unless chunked).
    pub fn compressed(mut self) -> Self {
        self.deflate = true;
        self
    }

    /// Byte-shuffle each chunk before any compression.
    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    fn is_chunked(&self) -> bool {
        !self.shape.is_empty() && (self.chunks.is_some() || self.deflate || self.shuffle)
    }

    fn chunk_shape(&self) -> Result<Shape> {
        let chunks = self.chunks.as_ref().unwrap_or(&self.shape);
        if chunks.len() != self.shape.len() {
            return Err(Error::malformed(format!(
                "chunks {:?} don't match shape {:?}",
                chunks.as_slice(),
                self.shape.as_slice()
            )));
        }
        Ok(chunks.iter().map(|&c| c.max(1)).collect())
    }
}

enum Child {
    Group(GroupBuilder),
    Array(ArrayBuilder),
}

/// A group to be written, with its children in insertion order.
#[derive(Default)]
pub struct GroupBuilder {
    attributes: Map<String, Value>,
    children: Vec<(String, Child)>,
}

impl GroupBuilder {
    /// Empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an attribute.
    pub fn attr(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Add a subgroup.
    pub fn group(&mut self, name: &str, group: GroupBuilder) -> &mut Self {
        self.children.push((name.to_string(), Child::Group(group)));
        self
    }

    /// Add a dataset.
    pub fn array(&mut self, name: &str, array: ArrayBuilder) -> &mut Self {
        self.children.push((name.to_string(), Child::Array(array)));
        self
    }
}

// ============================================================================
// Encoders
// ============================================================================

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn pad_to(out: &mut Vec<u8>, len: usize) {
    if out.len() < len {
        out.resize(len, 0);
    }
}

fn seal(mut block: Vec<u8>) -> Vec<u8> {
    let sum = checksum(&block);
    put_u32(&mut block, sum);
    block
}

fn fixed_point(size: u32, signed: bool, big: bool) -> Vec<u8> {
    let mut out = vec![0x10, u8::from(big) | if signed { 0x08 } else { 0 }, 0, 0];
    put_u32(&mut out, size);
    put_u16(&mut out, 0);
    put_u16(&mut out, (size * 8) as u16);
    out
}

fn floating(size: u32, big: bool) -> Vec<u8> {
    let (sign, exp_loc, exp_size, mantissa, bias) = match size {
        2 => (15, 10, 5, 10, 15),
        4 => (31, 23, 8, 23, 127),
        _ => (63, 52, 11, 52, 1023),
    };
    let mut out = vec![0x11, 0x20 | u8::from(big), sign, 0];
    put_u32(&mut out, size);
    put_u16(&mut out, 0);
    put_u16(&mut out, (size * 8) as u16);
    out.extend_from_slice(&[exp_loc, exp_size, 0, mantissa]);
    put_u32(&mut out, bias);
    out
}

/// NUL-padded UTF-8 string of `size` bytes.
fn fixed_string(size: u32) -> Vec<u8> {
    let mut out = vec![0x13, 0x10, 0, 0];
    put_u32(&mut out, size);
    out
}

fn vlen_string() -> Vec<u8> {
    let mut out = vec![0x19, 0x01, 0x01, 0];
    put_u32(&mut out, VLEN_ELEMENT_SIZE);
    out.extend(fixed_point(1, false, false));
    out
}

/// One-byte enum of FALSE and TRUE, as h5py stores booleans.
fn bool_enum() -> Vec<u8> {
    let mut out = vec![0x18, 2, 0, 0];
    put_u32(&mut out, 1);
    out.extend(fixed_point(1, true, false));
    for name in [&b"FALSE"[..], b"TRUE"] {
        let start = out.len();
        out.extend_from_slice(name);
        out.push(0);
        pad_to(&mut out, start + pad8(name.len() + 1));
    }
    out.extend_from_slice(&[0, 1]);
    out
}

fn datatype_for(dtype: &DataType) -> Result<Vec<u8>> {
    let big = dtype.order == Endianness::Big;
    let size = dtype.item_size().unwrap_or(0) as u32;
    Ok(match dtype.kind {
        ScalarKind::Bool => bool_enum(),
        k if k.is_signed() || k.is_unsigned() => fixed_point(size, k.is_signed(), big),
        k if k.is_float() => floating(size, big),
        ScalarKind::FixedBytes(n) if n > 0 => fixed_string(n as u32),
        _ => {
            return Err(Error::mismatch("numeric or fixed-width bytes", dtype.typestr()));
        }
    })
}

/// Dataspace message; an empty `dims` is a scalar.
fn dataspace(dims: &[u64], format: Format) -> Vec<u8> {
    let rank = dims.len() as u8;
    let mut out = match format {
        Format::Earliest => vec![1, rank, 0, 0, 0, 0, 0, 0],
        Format::Latest => vec![2, rank, 0, u8::from(!dims.is_empty())],
    };
    for &d in dims {
        put_u64(&mut out, d);
    }
    out
}

/// Datatype, dims and element bytes of an attribute value.
type AttributePayload = (Vec<u8>, Shape, Vec<u8>);

fn number_payload(numbers: &[&Number], dims: Shape) -> AttributePayload {
    let ints: Option<Vec<i64>> = numbers.iter().map(|n| n.as_i64()).collect();
    match ints {
        Some(ints) => (
            fixed_point(8, true, false),
            dims,
            ints.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ),
        None => (
            floating(8, false),
            dims,
            numbers
                .iter()
                .flat_map(|n| n.as_f64().unwrap_or(f64::NAN).to_le_bytes())
                .collect(),
        ),
    }
}

fn string_payload(strings: &[&str], dims: Shape) -> AttributePayload {
    let size = strings.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
    let mut data = Vec::with_capacity(size * strings.len());
    for s in strings {
        let start = data.len();
        data.extend_from_slice(s.as_bytes());
        pad_to(&mut data, start + size);
    }
    (fixed_string(size as u32), dims, data)
}

fn attribute_payload(value: &Value) -> Option<AttributePayload> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some((bool_enum(), Shape::new(), vec![u8::from(*b)])),
        Value::Number(n) => Some(number_payload(&[n], Shape::new())),
        Value::String(s) => Some(string_payload(&[s.as_str()], Shape::new())),
        Value::Array(items) if items.is_empty() => {
            Some((floating(8, false), smallvec![0], Vec::new()))
        }
        Value::Array(items) => {
            let dims: Shape = smallvec![items.len() as u64];
            if let Some(bools) = items.iter().map(Value::as_bool).collect::<Option<Vec<_>>>() {
                let data = bools.into_iter().map(u8::from).collect();
                Some((bool_enum(), dims, data))
            } else if let Some(numbers) = items
                .iter()
                .map(|v| match v {
                    Value::Number(n) => Some(n),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
            {
                Some(number_payload(&numbers, dims))
            } else if let Some(strings) = items.iter().map(Value::as_str).collect::<Option<Vec<_>>>() {
                Some(string_payload(&strings, dims))
            } else {
                Some(string_payload(&[value.to_string().as_str()], Shape::new()))
            }
        }
        Value::Object(_) => Some(string_payload(&[value.to_string().as_str()], Shape::new())),
    }
}

fn attribute_message(name: &str, value: &Value, format: Format) -> Result<Option<Vec<u8>>> {
    let Some((datatype, dims, data)) = attribute_payload(value) else {
        return Ok(None);
    };
    let space = dataspace(&dims, format);
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.push(0);
    let too_long = |n: usize| {
        u16::try_from(n).map_err(|_| Error::malformed(format!("attribute {name:?} is too large")))
    };

    let mut out = match format {
        Format::Earliest => vec![1, 0],
        Format::Latest => vec![3, 0],
    };
    put_u16(&mut out, too_long(name_bytes.len())?);
    put_u16(&mut out, too_long(datatype.len())?);
    put_u16(&mut out, too_long(space.len())?);
    match format {
        Format::Earliest => {
            for field in [&name_bytes, &datatype, &space] {
                let start = out.len();
                out.extend_from_slice(field);
                pad_to(&mut out, start + pad8(field.len()));
            }
        }
        Format::Latest => {
            out.push(1); // UTF-8 name
            out.extend_from_slice(&name_bytes);
            out.extend_from_slice(&datatype);
            out.extend_from_slice(&space);
        }
    }
    out.extend_from_slice(&data);
    Ok(Some(out))
}

fn link_message(name: &str, addr: u64) -> Vec<u8> {
    let bytes = name.as_bytes();
    let wide = bytes.len() > u8::MAX as usize;
    let mut out = vec![1, 0x10 | u8::from(wide), 1];
    if wide {
        put_u16(&mut out, bytes.len() as u16);
    } else {
        out.push(bytes.len() as u8);
    }
    out.extend_from_slice(bytes);
    put_u64(&mut out, addr);
    out
}

fn filter_pipeline(filters: &[(u16, u32)], format: Format) -> Vec<u8> {
    let mut out = match format {
        Format::Earliest => vec![1, filters.len() as u8, 0, 0, 0, 0, 0, 0],
        Format::Latest => vec![2, filters.len() as u8],
    };
    for &(id, value) in filters {
        put_u16(&mut out, id);
        if format == Format::Earliest {
            put_u16(&mut out, 0); // no name
        }
        put_u16(&mut out, 0);
        put_u16(&mut out, 1);
        put_u32(&mut out, value);
        if format == Format::Earliest {
            put_u32(&mut out, 0); // odd value count padding
        }
    }
    out
}

/// Bytes of chunk `index`, zero-padded where it runs past the array.
fn gather_chunk(shape: &[u64], chunks: &[u64], index: &[u64], elements: &[u8], size: usize) -> Vec<u8> {
    let ndim = shape.len();
    let chunk_len = chunks.iter().product::<u64>() as usize;
    let mut out = vec![0u8; chunk_len * size];
    for (src_pos, local) in grid_positions(chunks).enumerate() {
        let mut dst = 0u64;
        let mut inside = true;
        for d in 0..ndim {
            let at = index[d] * chunks[d] + local[d];
            inside &= at < shape[d];
            dst = dst * shape[d] + at;
        }
        if inside {
            let from = dst as usize * size;
            out[src_pos * size..(src_pos + 1) * size].copy_from_slice(&elements[from..from + size]);
        }
    }
    out
}

/// One written chunk: grid position, address, stored size.
struct WrittenChunk {
    index: Shape,
    address: u64,
    size: u64,
}

// ============================================================================
// Writer
// ============================================================================

/// Serializes a [`GroupBuilder`] tree into an HDF5 file.
pub struct Hdf5Writer<W: Write + Seek> {
    stream: OStream<W>,
    format: Format,
}

impl<W: Write + Seek> Hdf5Writer<W> {
    /// Start a file: reserves room for the superblock.
    pub fn new(writer: W, format: Format) -> Result<Self> {
        let mut stream = OStream::new(writer);
        let reserved = match format {
            Format::Earliest => 96,
            Format::Latest => 48,
        };
        stream.write_bytes(&vec![0u8; reserved])?;
        Ok(Self { stream, format })
    }

    /// Write the tree, patch the superblock and return the writer.
    pub fn finish(mut self, root: &GroupBuilder) -> Result<W> {
        let root_addr = self.write_group(root)?;
        let eof = self.stream.pos();
        let superblock = self.superblock(root_addr, eof);
        self.stream.seek(0)?;
        self.stream.write_bytes(&superblock)?;
        self.stream.into_inner()
    }

    fn superblock(&self, root: u64, eof: u64) -> Vec<u8> {
        let mut out = HDF5_MAGIC.to_vec();
        match self.format {
            Format::Earliest => {
                out.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]);
                put_u16(&mut out, GROUP_LEAF_K);
                put_u16(&mut out, GROUP_INTERNAL_K);
                put_u32(&mut out, 0);
                put_u64(&mut out, 0);
                put_u64(&mut out, UNDEFINED);
                put_u64(&mut out, eof);
                put_u64(&mut out, UNDEFINED);
                // Root symbol table entry, no cached scratch data
                put_u64(&mut out, 0);
                put_u64(&mut out, root);
                pad_to(&mut out, 96);
                out
            }
            Format::Latest => {
                out.extend_from_slice(&[2, 8, 8, 0]);
                put_u64(&mut out, 0);
                put_u64(&mut out, UNDEFINED);
                put_u64(&mut out, eof);
                put_u64(&mut out, root);
                seal(out)
            }
        }
    }

    fn write_object_header(&mut self, messages: &[(u16, Vec<u8>)]) -> Result<u64> {
        for (kind, body) in messages {
            if body.len() > u16::MAX as usize - 8 {
                return Err(Error::malformed(format!(
                    "message {kind:#x} of {} bytes doesn't fit an object header",
                    body.len()
                )));
            }
        }
        let block = match self.format {
            Format::Earliest => {
                let size: usize = messages.iter().map(|(_, b)| 8 + pad8(b.len())).sum();
                let mut out = vec![1, 0];
                put_u16(&mut out, messages.len() as u16);
                put_u32(&mut out, 1);
                put_u32(&mut out, size as u32);
                put_u32(&mut out, 0);
                for (kind, body) in messages {
                    put_u16(&mut out, *kind);
                    put_u16(&mut out, pad8(body.len()) as u16);
                    out.extend_from_slice(&[0, 0, 0, 0]);
                    let start = out.len();
                    out.extend_from_slice(body);
                    pad_to(&mut out, start + pad8(body.len()));
                }
                out
            }
            Format::Latest => {
                let mut body = Vec::new();
                for (kind, data) in messages {
                    body.push(*kind as u8);
                    put_u16(&mut body, data.len() as u16);
                    body.push(0);
                    body.extend_from_slice(data);
                }
                let mut out = b"OHDR".to_vec();
                out.extend_from_slice(&[2, 0x02]);
                put_u32(&mut out, body.len() as u32);
                out.extend(body);
                seal(out)
            }
        };
        self.stream.append(&block)
    }

    fn attribute_messages(&self, attributes: &Map<String, Value>) -> Result<Vec<(u16, Vec<u8>)>> {
        let mut out = Vec::new();
        for (name, value) in attributes {
            if let Some(body) = attribute_message(name, value, self.format)? {
                out.push((MSG_ATTRIBUTE, body));
            }
        }
        Ok(out)
    }

    fn write_group(&mut self, group: &GroupBuilder) -> Result<u64> {
        let mut seen = HashSet::new();
        let mut links = Vec::with_capacity(group.children.len());
        for (name, child) in &group.children {
            if name.is_empty() || name.contains('/') || !seen.insert(name.as_str()) {
                return Err(Error::malformed(format!("invalid or repeated link name {name:?}")));
            }
            let addr = match child {
                Child::Group(g) => self.write_group(g)?,
                Child::Array(a) => self.write_array(a)?,
            };
            links.push((name.as_str(), addr));
        }

        let mut messages = match self.format {
            Format::Earliest => vec![(MSG_SYMBOL_TABLE, self.write_symbol_table(&mut links)?)],
            Format::Latest if links.len() > MAX_COMPACT_LINKS => vec![
                (MSG_LINK_INFO, self.write_dense_links(&links)?),
                (MSG_GROUP_INFO, vec![0, 0]),
            ],
            Format::Latest => {
                let mut info = vec![0, 0];
                put_u64(&mut info, UNDEFINED);
                put_u64(&mut info, UNDEFINED);
                let mut messages = vec![(MSG_LINK_INFO, info), (MSG_GROUP_INFO, vec![0, 0])];
                for (name, addr) in &links {
                    messages.push((MSG_LINK, link_message(name, *addr)));
                }
                messages
            }
        };
        messages.extend(self.attribute_messages(&group.attributes)?);
        self.write_object_header(&messages)
    }

    /// Local heap, symbol table nodes and their B-tree; returns the symbol
    /// table message body.
    fn write_symbol_table(&mut self, links: &mut [(&str, u64)]) -> Result<Vec<u8>> {
        links.sort_by(|a, b| a.0.cmp(b.0));

        // Heap offset 0 is the empty string
        let mut data = vec![0u8; 8];
        let mut offsets = Vec::with_capacity(links.len());
        for (name, _) in links.iter() {
            offsets.push(data.len() as u64);
            let start = data.len();
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            pad_to(&mut data, start + pad8(name.len() + 1));
        }
        let data_addr = self.stream.append(&data)?;
        let mut heap = b"HEAP".to_vec();
        heap.extend_from_slice(&[0, 0, 0, 0]);
        put_u64(&mut heap, data.len() as u64);
        put_u64(&mut heap, UNDEFINED);
        put_u64(&mut heap, data_addr);
        let heap_addr = self.stream.append(&heap)?;

        let capacity = 2 * GROUP_LEAF_K as usize;
        let mut nodes = Vec::new();
        for (entries, names) in links.chunks(capacity).zip(offsets.chunks(capacity)) {
            let mut node = b"SNOD".to_vec();
            node.extend_from_slice(&[1, 0]);
            put_u16(&mut node, entries.len() as u16);
            for ((_, addr), offset) in entries.iter().zip(names) {
                put_u64(&mut node, *offset);
                put_u64(&mut node, *addr);
                node.extend_from_slice(&[0u8; 24]);
            }
            pad_to(&mut node, 8 + capacity * 40);
            let last = names.last().copied().unwrap_or(0);
            nodes.push((self.stream.append(&node)?, last));
        }

        let max_children = 2 * GROUP_INTERNAL_K as usize;
        if nodes.len() > max_children {
            return Err(Error::malformed(format!(
                "group of {} links needs more than one B-tree node",
                links.len()
            )));
        }
        let mut tree = b"TREE".to_vec();
        tree.extend_from_slice(&[0, 0]);
        put_u16(&mut tree, nodes.len() as u16);
        put_u64(&mut tree, UNDEFINED);
        put_u64(&mut tree, UNDEFINED);
        put_u64(&mut tree, 0);
        for (addr, last) in &nodes {
            put_u64(&mut tree, *addr);
            put_u64(&mut tree, *last);
        }
        pad_to(&mut tree, 24 + max_children * 8 + (max_children + 1) * 8);
        let tree_addr = self.stream.append(&tree)?;

        let mut body = Vec::new();
        put_u64(&mut body, tree_addr);
        put_u64(&mut body, heap_addr);
        Ok(body)
    }

    /// Link messages in a fractal heap indexed by name hash; returns the
    /// link info message body.
    fn write_dense_links(&mut self, links: &[(&str, u64)]) -> Result<Vec<u8>> {
        const OFFSET_SIZE: usize = 4;
        const LENGTH_SIZE: usize = 2;
        const ID_LEN: usize = 1 + OFFSET_SIZE + LENGTH_SIZE;
        let header_len = 4 + 1 + 8 + OFFSET_SIZE;

        let bodies: Vec<Vec<u8>> = links.iter().map(|(n, a)| link_message(n, *a)).collect();
        let used = header_len + bodies.iter().map(Vec::len).sum::<usize>();
        let block_size = used.next_power_of_two().max(512) as u64;
        let max_direct = block_size.max(1 << 16);

        // Direct block, then the heap header right behind it
        let block_addr = self.stream.pos();
        let heap_addr = block_addr + block_size;
        let mut block = b"FHDB".to_vec();
        block.push(0);
        put_u64(&mut block, heap_addr);
        block.extend_from_slice(&[0u8; OFFSET_SIZE]);
        let mut records = Vec::with_capacity(links.len());
        for ((name, _), body) in links.iter().zip(&bodies) {
            let mut record = Vec::with_capacity(4 + ID_LEN);
            put_u32(&mut record, checksum(name.as_bytes()));
            record.push(0);
            record.extend_from_slice(&(block.len() as u32).to_le_bytes());
            put_u16(&mut record, body.len() as u16);
            records.push(record);
            block.extend_from_slice(body);
        }
        pad_to(&mut block, block_size as usize);
        self.stream.append(&block)?;

        let mut heap = b"FRHP".to_vec();
        heap.push(0);
        put_u16(&mut heap, ID_LEN as u16);
        put_u16(&mut heap, 0);
        heap.push(0);
        put_u32(&mut heap, u16::MAX as u32); // keeps heap ID lengths at two bytes
        put_u64(&mut heap, 0);
        put_u64(&mut heap, UNDEFINED);
        put_u64(&mut heap, block_size - used as u64);
        put_u64(&mut heap, UNDEFINED);
        for v in [block_size, block_size, used as u64, links.len() as u64, 0, 0, 0, 0] {
            put_u64(&mut heap, v);
        }
        put_u16(&mut heap, 4);
        put_u64(&mut heap, block_size);
        put_u64(&mut heap, max_direct);
        put_u16(&mut heap, (OFFSET_SIZE * 8) as u16);
        put_u16(&mut heap, 1);
        put_u64(&mut heap, block_addr);
        put_u16(&mut heap, 0);
        let written = self.stream.append(&seal(heap))?;
        debug_assert_eq!(written, heap_addr);

        // One B-tree leaf of (hash, heap ID) records in hash order
        records.sort_by_key(|r| u32::from_le_bytes([r[0], r[1], r[2], r[3]]));
        let record_size = 4 + ID_LEN;
        let node_size = (10 + records.len() * record_size).next_power_of_two().max(512);
        let mut leaf = b"BTLF".to_vec();
        leaf.extend_from_slice(&[0, 5]);
        for r in &records {
            leaf.extend_from_slice(r);
        }
        let mut leaf = seal(leaf);
        pad_to(&mut leaf, node_size);
        let leaf_addr = self.stream.append(&leaf)?;

        let mut tree = b"BTHD".to_vec();
        tree.extend_from_slice(&[0, 5]);
        put_u32(&mut tree, node_size as u32);
        put_u16(&mut tree, record_size as u16);
        put_u16(&mut tree, 0);
        tree.extend_from_slice(&[100, 40]);
        put_u64(&mut tree, leaf_addr);
        put_u16(&mut tree, records.len() as u16);
        put_u64(&mut tree, records.len() as u64);
        let tree_addr = self.stream.append(&seal(tree))?;

        let mut info = vec![0, 0];
        put_u64(&mut info, heap_addr);
        put_u64(&mut info, tree_addr);
        Ok(info)
    }

    /// Global heap collection holding `items`; returns its address.
    fn write_global_heap(&mut self, items: &[String]) -> Result<u64> {
        if items.len() >= u16::MAX as usize {
            return Err(Error::malformed("too many strings for one heap collection"));
        }
        let mut objects = Vec::new();
        for (i, s) in items.iter().enumerate() {
            put_u16(&mut objects, (i + 1) as u16);
            put_u16(&mut objects, 1);
            put_u32(&mut objects, 0);
            put_u64(&mut objects, s.len() as u64);
            let start = objects.len();
            objects.extend_from_slice(s.as_bytes());
            pad_to(&mut objects, start + pad8(s.len()));
        }
        let used = 16 + objects.len();
        let size = (used + 16).max(GLOBAL_HEAP_MIN_SIZE);

        let mut out = b"GCOL".to_vec();
        out.extend_from_slice(&[1, 0, 0, 0]);
        put_u64(&mut out, size as u64);
        out.extend(objects);
        // Free space object
        put_u16(&mut out, 0);
        put_u16(&mut out, 0);
        put_u32(&mut out, 0);
        put_u64(&mut out, (size - used) as u64);
        pad_to(&mut out, size);
        self.stream.append(&out)
    }

    /// Datatype message and element bytes of an array.
    fn elements(&mut self, array: &ArrayBuilder, count: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        match &array.payload {
            Payload::Raw(bytes) => {
                let expected = array.dtype.item_size().and_then(|n| n.checked_mul(count));
                if expected != Some(bytes.len()) {
                    return Err(Error::malformed(format!(
                        "{} bytes don't fill shape {:?} of {}",
                        bytes.len(),
                        array.shape.as_slice(),
                        array.dtype
                    )));
                }
                Ok((datatype_for(&array.dtype)?, bytes.clone()))
            }
            Payload::Strings(items) => {
                if items.len() != count {
                    return Err(Error::malformed(format!(
                        "{} strings don't fill shape {:?}",
                        items.len(),
                        array.shape.as_slice()
                    )));
                }
                let heap = if items.is_empty() { UNDEFINED } else { self.write_global_heap(items)? };
                let mut elements = Vec::with_capacity(items.len() * VLEN_ELEMENT_SIZE as usize);
                for (i, s) in items.iter().enumerate() {
                    put_u32(&mut elements, s.len() as u32);
                    put_u64(&mut elements, heap);
                    put_u32(&mut elements, (i + 1) as u32);
                }
                Ok((vlen_string(), elements))
            }
        }
    }

    fn write_array(&mut self, array: &ArrayBuilder) -> Result<u64> {
        let count = element_count(&array.shape)?;
        let (datatype, elements) = self.elements(array, count)?;
        let size = match array.payload {
            Payload::Raw(_) => array.dtype.item_size().unwrap_or(1),
            Payload::Strings(_) => VLEN_ELEMENT_SIZE as usize,
        };

        let mut messages = vec![
            (MSG_DATASPACE, dataspace(&array.shape, self.format)),
            (MSG_DATATYPE, datatype),
            (
                MSG_FILL_VALUE,
                match self.format {
                    Format::Earliest => vec![2, 2, 2, 0],
                    Format::Latest => vec![3, 0x0A],
                },
            ),
        ];

        if array.is_chunked() {
            let chunks = array.chunk_shape()?;
            let mut filters = Vec::new();
            if array.shuffle {
                filters.push((FILTER_SHUFFLE, size as u32));
            }
            if array.deflate {
                filters.push((FILTER_DEFLATE, DEFLATE_LEVEL));
            }

            let grid = chunk_grid(&array.shape, &chunks);
            let mut written = Vec::new();
            for index in grid_positions(&grid) {
                let mut bytes = gather_chunk(&array.shape, &chunks, &index, &elements, size);
                if array.shuffle {
                    bytes = shuffle(&bytes, size);
                }
                if array.deflate {
                    bytes = Codec::Zlib.encode(&bytes)?;
                }
                let address = self.stream.append(&bytes)?;
                written.push(WrittenChunk {
                    index,
                    address,
                    size: bytes.len() as u64,
                });
            }
            let filtered = !filters.is_empty();
            let layout = self.write_chunk_index(&chunks, size, &grid, &written, filtered)?;
            messages.push((MSG_LAYOUT, layout));
            if filtered {
                messages.push((MSG_FILTER_PIPELINE, filter_pipeline(&filters, self.format)));
            }
        } else {
            let address = if elements.is_empty() {
                UNDEFINED
            } else {
                self.stream.append(&elements)?
            };
            let mut layout = vec![3, 1];
            put_u64(&mut layout, address);
            put_u64(&mut layout, elements.len() as u64);
            messages.push((MSG_LAYOUT, layout));
        }

        messages.extend(self.attribute_messages(&array.attributes)?);
        self.write_object_header(&messages)
    }

    /// Index over written chunks; returns the layout message body.
    fn write_chunk_index(
        &mut self,
        chunks: &[u64],
        size: usize,
        grid: &[u64],
        written: &[WrittenChunk],
        filtered: bool,
    ) -> Result<Vec<u8>> {
        let rank = chunks.len();
        match self.format {
            Format::Earliest => {
                let max_entries = 2 * CHUNK_K;
                if written.len() > max_entries {
                    return Err(Error::malformed(format!(
                        "{} chunks need more than one B-tree node",
                        written.len()
                    )));
                }
                let key_len = 8 + 8 * (rank + 1);
                let key = |out: &mut Vec<u8>, size: u64, index: &[u64]| {
                    put_u32(out, size as u32);
                    put_u32(out, 0);
                    for (i, c) in index.iter().zip(chunks) {
                        put_u64(out, i * c);
                    }
                    put_u64(out, 0);
                };
                let mut tree = b"TREE".to_vec();
                tree.extend_from_slice(&[1, 0]);
                put_u16(&mut tree, written.len() as u16);
                put_u64(&mut tree, UNDEFINED);
                put_u64(&mut tree, UNDEFINED);
                for chunk in written {
                    key(&mut tree, chunk.size, &chunk.index);
                    put_u64(&mut tree, chunk.address);
                }
                key(&mut tree, 0, grid);
                pad_to(&mut tree, 24 + max_entries * 8 + (max_entries + 1) * key_len);
                let root = if written.is_empty() { UNDEFINED } else { self.stream.append(&tree)? };

                let mut layout = vec![3, 2, (rank + 1) as u8];
                put_u64(&mut layout, root);
                for &c in chunks {
                    put_u32(&mut layout, c as u32);
                }
                put_u32(&mut layout, size as u32);
                Ok(layout)
            }
            Format::Latest => {
                let single = shape_len(grid)? == 1;
                let flags = if single && filtered { 0x02 } else { 0 };
                let mut layout = vec![4, 2, flags, (rank + 1) as u8, 8];
                for &c in chunks {
                    put_u64(&mut layout, c);
                }
                put_u64(&mut layout, size as u64);
                match written {
                    [only] if single => {
                        layout.push(1);
                        if filtered {
                            put_u64(&mut layout, only.size);
                            put_u32(&mut layout, 0);
                        }
                        put_u64(&mut layout, only.address);
                    }
                    _ => {
                        let chunk_bytes = shape_len(chunks)? * size as u64;
                        let addr = self.write_fixed_array(written, filtered, chunk_bytes)?;
                        layout.push(3);
                        layout.push(FIXED_ARRAY_PAGE_BITS);
                        put_u64(&mut layout, addr);
                    }
                }
                Ok(layout)
            }
        }
    }

    /// Fixed array of chunk entries in grid order; returns the header address.
    fn write_fixed_array(&mut self, written: &[WrittenChunk], filtered: bool, chunk_bytes: u64) -> Result<u64> {
        if written.len() > 1 << FIXED_ARRAY_PAGE_BITS {
            return Err(Error::malformed(format!(
                "{} chunks need a paged chunk index",
                written.len()
            )));
        }
        // Width of the stored chunk size, as the HDF5 library sizes it
        let size_width = (1 + (63 - chunk_bytes.max(1).leading_zeros() as usize + 8) / 8).min(8);
        let (client, entry_size) = if filtered { (1u8, 8 + size_width + 4) } else { (0u8, 8) };

        let block_addr = self.stream.pos();
        let mut block = b"FADB".to_vec();
        block.extend_from_slice(&[0, client]);
        let block_len = block.len() + 8 + written.len() * entry_size + 4;
        put_u64(&mut block, block_addr + block_len as u64);
        for chunk in written {
            put_u64(&mut block, chunk.address);
            if filtered {
                block.extend_from_slice(&chunk.size.to_le_bytes()[..size_width]);
                put_u32(&mut block, 0);
            }
        }
        self.stream.append(&seal(block))?;

        let mut header = b"FAHD".to_vec();
        header.extend_from_slice(&[0, client, entry_size as u8, FIXED_ARRAY_PAGE_BITS]);
        put_u64(&mut header, written.len() as u64);
        put_u64(&mut header, block_addr);
        self.stream.append(&seal(header))
    }
}

impl Hdf5Writer<Cursor<Vec<u8>>> {
    /// Serialize a tree into memory in the latest layout.
    pub fn write_to_vec(root: &GroupBuilder) -> Result<Vec<u8>> {
        Self::write_to_vec_as(root, Format::Latest)
    }

    /// Serialize a tree into memory.
    pub fn write_to_vec_as(root: &GroupBuilder, format: Format) -> Result<Vec<u8>> {
        let writer = Self::new(Cursor::new(Vec::new()), format)?;
        Ok(writer.finish(root)?.into_inner())
    }
}

impl Hdf5Writer<BufWriter<File>> {
    /// Serialize a tree to a file in the latest layout.
    pub fn write_to_path(root: &GroupBuilder, path: impl AsRef<Path>) -> Result<()> {
        Self::write_to_path_as(root, path, Format::Latest)
    }

    /// Serialize a tree to a file.
    pub fn write_to_path_as(root: &GroupBuilder, path: impl AsRef<Path>, format: Format) -> Result<()> {
        let file = File::create(path)?;
        let writer = Self::new(BufWriter::new(file), format)?;
        writer.finish(root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::container::hdf5::Hdf5Backend;
    use crate::container::{ArrayValues, HierarchicalFile, NodeKind};
    use crate::remote::{CachedReader, FileSource};

    fn open(bytes: &[u8]) -> (tempfile::TempDir, HierarchicalFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.h5");
        std::fs::write(&path, bytes).unwrap();
        let source = FileSource::open(&path).unwrap();
        let reader = Arc::new(CachedReader::new(Box::new(source), None, 64));
        let backend = Hdf5Backend::open(reader).unwrap();
        (dir, HierarchicalFile::new(Box::new(backend)).unwrap())
    }

    fn grid_i32(rows: i32, cols: i32) -> ArrayBuilder {
        let bytes = (0..rows * cols).flat_map(|v| v.to_le_bytes()).collect();
        ArrayBuilder::raw(DataType::INT32, &[rows as u64, cols as u64], bytes)
    }

    fn sample() -> GroupBuilder {
        let mut inner = GroupBuilder::new();
        inner
            .attr("neurodata_type", "TimeSeries")
            .array("data", ArrayBuilder::f64s(&[0.5, 1.5]).attr("unit", "s"));
        let mut root = GroupBuilder::new();
        root.attr("nwb_version", "2.7.0")
            .attr("count", 3)
            .attr("weights", json!([0.25, 1.0]))
            .attr("enabled", true)
            .attr("colnames", json!(["a", "bc"]))
            .attr("extra", json!({"k": 1}))
            .attr("nothing", Value::Null)
            .array("label", ArrayBuilder::scalar_str("session-1"))
            .array("names", ArrayBuilder::strings(&["x", "", "yz"]))
            .array("grid", grid_i32(3, 5).chunked(&[2, 2]).shuffled().compressed())
            .group("inner", inner);
        root
    }

    #[test]
    fn test_round_trip_both_formats() {
        for format in [Format::Earliest, Format::Latest] {
            let bytes = Hdf5Writer::write_to_vec_as(&sample(), format).unwrap();
            let (_dir, file) = open(&bytes);
            assert_eq!(file.format_name(), "hdf5");

            let names: Vec<_> = file.list_children("").unwrap().into_iter().map(|c| c.name).collect();
            assert_eq!(names, ["grid", "inner", "label", "names"], "{format:?}");
            assert_eq!(file.kind("inner").unwrap(), NodeKind::Group);

            let attrs = file.attributes("").unwrap();
            assert_eq!(attrs.get_str("nwb_version"), Some("2.7.0"));
            assert_eq!(attrs.get("count"), Some(&json!(3)));
            assert_eq!(attrs.get("weights"), Some(&json!([0.25, 1.0])));
            assert_eq!(attrs.get("enabled"), Some(&json!(true)));
            assert_eq!(attrs.get_strings("colnames").unwrap(), ["a", "bc"]);
            assert_eq!(attrs.get_str("extra"), Some(r#"{"k":1}"#));
            assert_eq!(attrs.get("nothing"), None);

            let label = file.array("label").unwrap();
            assert!(label.shape.is_empty());
            assert_eq!(label.scalar_text(), Some("session-1"));
            let names = file.array("names").unwrap();
            assert_eq!(names.as_text().unwrap(), ["x", "", "yz"]);

            let info = file.array_info("grid").unwrap();
            assert_eq!(info.dtype, DataType::INT32);
            assert_eq!(info.shape.as_slice(), &[3, 5]);
            assert_eq!(info.codec.as_deref(), Some("shuffle+deflate"));
            let grid = file.array("grid").unwrap();
            assert_eq!(grid.values, ArrayValues::Int((0..15).collect()));

            let data = file.array("inner/data").unwrap();
            assert_eq!(data.as_f64_slice(), Some(&[0.5, 1.5][..]));
            assert_eq!(file.attributes("inner/data").unwrap().get_str("unit"), Some("s"));
        }
    }

    #[test]
    fn test_large_groups() {
        let mut root = GroupBuilder::new();
        for i in 0..40 {
            root.array(&format!("column_{i:02}"), ArrayBuilder::i64s(&[i]));
        }
        for format in [Format::Earliest, Format::Latest] {
            let bytes = Hdf5Writer::write_to_vec_as(&root, format).unwrap();
            let (_dir, file) = open(&bytes);
            let children = file.list_children("").unwrap();
            assert_eq!(children.len(), 40, "{format:?}");
            assert_eq!(children[7].name, "column_07");
            let last = file.array("column_39").unwrap();
            assert_eq!(last.values, ArrayValues::Int(vec![39]));
        }
    }

    #[test]
    fn test_single_compressed_chunk() {
        let values: Vec<f64> = (0..64).map(|i| (i % 4) as f64).collect();
        let mut root = GroupBuilder::new();
        root.array("flat", ArrayBuilder::f64s(&values).compressed())
            .array("plain", ArrayBuilder::f64s(&values).chunked(&[64]))
            .array("empty", ArrayBuilder::f64s(&[]));
        for format in [Format::Earliest, Format::Latest] {
            let bytes = Hdf5Writer::write_to_vec_as(&root, format).unwrap();
            let (_dir, file) = open(&bytes);
            assert_eq!(file.array_info("flat").unwrap().codec.as_deref(), Some("deflate"));
            assert_eq!(file.array("flat").unwrap().as_f64_slice(), Some(&values[..]));
            assert_eq!(file.array_info("plain").unwrap().codec, None);
            assert_eq!(file.array("plain").unwrap().as_f64_slice(), Some(&values[..]));
            assert!(file.array("empty").unwrap().is_empty());
        }
    }

    #[test]
    fn test_write_rejects_bad_trees() {
        let mut dup = GroupBuilder::new();
        dup.array("x", ArrayBuilder::f64s(&[1.0]))
            .array("x", ArrayBuilder::f64s(&[2.0]));
        assert!(Hdf5Writer::write_to_vec(&dup).is_err());

        let mut short = GroupBuilder::new();
        short.array("x", ArrayBuilder::f64s(&[1.0, 2.0]).with_shape(&[3]));
        assert!(matches!(
            Hdf5Writer::write_to_vec(&short),
            Err(Error::MalformedContainer(_))
        ));

        let mut nested = GroupBuilder::new();
        nested.array("a/b", ArrayBuilder::f64s(&[1.0]));
        assert!(Hdf5Writer::write_to_vec(&nested).is_err());
    }
}
