//! Decoders for the header messages a reader needs: dataspace, datatype,
//! layout, filters, fill value, links, and attributes.

use super::format::{Fields, Sizes};
use crate::container::{unshuffle, Codec, Shape};
use crate::util::{DataType, Endianness, Error, Result, ScalarKind};

// ============================================================================
// Dataspace
// ============================================================================

/// Extents of a dataset or attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataspace {
    pub shape: Shape,
    /// A null dataspace holds no elements; its shape reads as `[0]`.
    pub null: bool,
}

impl Dataspace {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Self> {
        let mut f = Fields::new(data, sizes, "dataspace");
        let version = f.u8()?;
        let rank = f.u8()? as usize;
        let _flags = f.u8()?;
        let null = match version {
            1 => {
                f.skip(5)?;
                false
            }
            2 => f.u8()? == 2,
            v => return Err(Error::malformed(format!("unsupported dataspace version {v}"))),
        };
        let mut shape = Shape::with_capacity(rank);
        for _ in 0..rank {
            shape.push(f.length()?);
        }
        if null {
            shape = Shape::from_slice(&[0]);
        }
        Ok(Self { shape, null })
    }

    /// Element count; a null dataspace has none.
    pub fn element_count(&self) -> Result<u64> {
        crate::container::shape_len(&self.shape)
    }
}

// ============================================================================
// Datatype
// ============================================================================

/// How elements of a datatype are decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeClass {
    /// Integers, floats, bitfields and boolean enums.
    Numeric(DataType),
    /// Fixed-length string; space padding is trimmed on decode.
    FixedString { space_padded: bool },
    /// Variable-length string stored in the global heap.
    VlenString,
    /// A class this reader cannot decode.
    Unsupported(&'static str),
}

/// A datatype message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datatype {
    pub class: TypeClass,
    /// Stored size of one element in bytes.
    pub size: usize,
}

impl Datatype {
    /// Parse a standalone datatype message.
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Self> {
        Self::read(&mut Fields::new(data, sizes, "datatype"))
    }

    /// Parse a datatype, consuming it from `f`.
    pub fn read(f: &mut Fields<'_>) -> Result<Self> {
        let class_version = f.u8()?;
        let class = class_version & 0x0F;
        let version = class_version >> 4;
        let bits = [f.u8()?, f.u8()?, f.u8()?];
        let size = f.u32()? as usize;
        let order = if bits[0] & 0x01 != 0 {
            Endianness::Big
        } else {
            Endianness::Little
        };

        let class = match class {
            0 | 4 => {
                f.skip(4)?; // bit offset, precision
                let signed = class == 0 && bits[0] & 0x08 != 0;
                integer_kind(size, signed)
                    .map(|k| TypeClass::Numeric(numeric(k, order)))
                    .unwrap_or(TypeClass::Unsupported("integer width"))
            }
            1 => {
                f.skip(12)?;
                let kind = match size {
                    2 => Some(ScalarKind::Float16),
                    4 => Some(ScalarKind::Float32),
                    8 => Some(ScalarKind::Float64),
                    _ => None,
                };
                match kind {
                    Some(k) if bits[0] & 0x40 == 0 => TypeClass::Numeric(numeric(k, order)),
                    _ => TypeClass::Unsupported("float layout"),
                }
            }
            3 => TypeClass::FixedString {
                space_padded: bits[0] & 0x0F == 2,
            },
            8 => {
                let members = u16::from_le_bytes([bits[0], bits[1]]) as usize;
                let base = Self::read(f)?;
                let mut names = Vec::with_capacity(members);
                for _ in 0..members {
                    names.push(read_name(f, version < 3)?);
                }
                let mut values = Vec::with_capacity(members);
                for _ in 0..members {
                    values.push(f.uint(base.size.min(8))?);
                }
                match base.class {
                    TypeClass::Numeric(_) if is_bool_enum(&names, &values, base.size) => {
                        TypeClass::Numeric(DataType::BOOL)
                    }
                    TypeClass::Numeric(dt) => TypeClass::Numeric(dt),
                    _ => TypeClass::Unsupported("enumeration"),
                }
            }
            9 => {
                Self::read(f)?; // base type
                if bits[0] & 0x0F == 1 {
                    TypeClass::VlenString
                } else {
                    TypeClass::Unsupported("variable-length sequence")
                }
            }
            2 => TypeClass::Unsupported("time"),
            5 => TypeClass::Unsupported("opaque"),
            6 => TypeClass::Unsupported("compound"),
            7 => TypeClass::Unsupported("reference"),
            10 => TypeClass::Unsupported("array"),
            other => {
                return Err(Error::malformed(format!("unknown datatype class {other}")));
            }
        };
        Ok(Self { class, size })
    }

    /// The element type reported for arrays of this datatype.
    pub fn dtype(&self) -> Result<DataType> {
        match &self.class {
            TypeClass::Numeric(dt) => Ok(*dt),
            TypeClass::FixedString { .. } if self.size > 0 => {
                Ok(DataType::new(ScalarKind::FixedBytes(self.size), Endianness::NotApplicable))
            }
            TypeClass::FixedString { .. } => Err(Error::malformed("zero-length string type")),
            TypeClass::VlenString => Ok(DataType::OBJECT),
            TypeClass::Unsupported(class) => {
                Err(Error::malformed(format!("unsupported HDF5 datatype class: {class}")))
            }
        }
    }
}

fn integer_kind(size: usize, signed: bool) -> Option<ScalarKind> {
    Some(match (size, signed) {
        (1, true) => ScalarKind::Int8,
        (2, true) => ScalarKind::Int16,
        (4, true) => ScalarKind::Int32,
        (8, true) => ScalarKind::Int64,
        (1, false) => ScalarKind::UInt8,
        (2, false) => ScalarKind::UInt16,
        (4, false) => ScalarKind::UInt32,
        (8, false) => ScalarKind::UInt64,
        _ => return None,
    })
}

fn numeric(kind: ScalarKind, order: Endianness) -> DataType {
    match kind.item_size() {
        Some(1) => DataType::new(kind, Endianness::NotApplicable),
        _ => DataType::new(kind, order),
    }
}

/// The boolean enum h5py writes: one byte, FALSE = 0, TRUE = 1.
fn is_bool_enum(names: &[String], values: &[u64], size: usize) -> bool {
    size == 1
        && names.len() == 2
        && names
            .iter()
            .zip(values)
            .all(|(n, &v)| (n == "FALSE" && v == 0) || (n == "TRUE" && v == 1))
}

/// NUL-terminated name, optionally padded to a multiple of 8 bytes.
fn read_name(f: &mut Fields<'_>, padded: bool) -> Result<String> {
    let start = f.pos();
    let mut bytes = Vec::new();
    loop {
        let b = f.u8()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    if padded {
        let used = f.pos() - start;
        f.skip(pad8(used) - used)?;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Round up to a multiple of 8.
#[inline]
pub fn pad8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

// ============================================================================
// Fill value
// ============================================================================

/// Stored fill value bytes, if the message defines one.
pub fn parse_fill_value(kind: u16, data: &[u8], sizes: Sizes) -> Result<Option<Vec<u8>>> {
    let mut f = Fields::new(data, sizes, "fill value");
    let bytes = if kind == super::object_header::MSG_FILL_VALUE_OLD {
        let size = f.u32()? as usize;
        f.take(size)?
    } else {
        match f.u8()? {
            1 => {
                f.skip(2)?;
                let _defined = f.u8()?;
                let size = f.u32()? as usize;
                f.take(size)?
            }
            2 => {
                f.skip(2)?;
                if f.u8()? == 0 {
                    return Ok(None);
                }
                let size = f.u32()? as usize;
                f.take(size)?
            }
            3 => {
                let flags = f.u8()?;
                if flags & 0x20 == 0 {
                    return Ok(None);
                }
                let size = f.u32()? as usize;
                f.take(size)?
            }
            v => return Err(Error::malformed(format!("unsupported fill value version {v}"))),
        }
    };
    Ok((!bytes.is_empty()).then(|| bytes.to_vec()))
}

// ============================================================================
// Layout
// ============================================================================

/// How a chunked dataset finds its chunks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkIndex {
    /// Version 1 B-tree keyed by chunk offsets.
    BTreeV1(Option<u64>),
    /// The whole dataset is one chunk; `filtered` carries its stored size and mask.
    Single {
        address: Option<u64>,
        filtered: Option<(u64, u32)>,
    },
    /// Unfiltered chunks stored back to back in C order.
    Implicit(Option<u64>),
    /// Fixed array of chunk addresses.
    FixedArray(Option<u64>),
    /// Extensible array (not readable here).
    ExtensibleArray,
    /// Version 2 B-tree of chunk records.
    BTreeV2(Option<u64>),
}

/// Where the raw data of a dataset lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    Compact(Vec<u8>),
    Contiguous { address: Option<u64>, size: u64 },
    Chunked {
        /// Chunk extents, one per dataset dimension.
        chunk: Shape,
        index: ChunkIndex,
    },
}

impl Layout {
    /// Parse a layout message for a dataset of rank `rank`.
    pub fn parse(data: &[u8], sizes: Sizes, rank: usize) -> Result<Self> {
        let mut f = Fields::new(data, sizes, "data layout");
        let version = f.u8()?;
        if !matches!(version, 3 | 4) {
            return Err(Error::malformed(format!("unsupported data layout version {version}")));
        }
        match f.u8()? {
            0 => {
                let size = f.u16()? as usize;
                Ok(Self::Compact(f.take(size)?.to_vec()))
            }
            1 => {
                let address = f.address()?;
                let size = f.length()?;
                Ok(Self::Contiguous { address, size })
            }
            2 if version == 3 => {
                let ndims = f.u8()? as usize;
                let address = f.address()?;
                let mut dims = Shape::with_capacity(ndims);
                for _ in 0..ndims {
                    dims.push(f.u32()? as u64);
                }
                Ok(Self::Chunked {
                    chunk: chunk_dims(dims, rank)?,
                    index: ChunkIndex::BTreeV1(address),
                })
            }
            2 => {
                let flags = f.u8()?;
                let ndims = f.u8()? as usize;
                let width = f.u8()? as usize;
                let mut dims = Shape::with_capacity(ndims);
                for _ in 0..ndims {
                    dims.push(f.uint(width)?);
                }
                let index = match f.u8()? {
                    1 => {
                        let filtered = if flags & 0x02 != 0 {
                            Some((f.length()?, f.u32()?))
                        } else {
                            None
                        };
                        ChunkIndex::Single {
                            address: f.address()?,
                            filtered,
                        }
                    }
                    2 => ChunkIndex::Implicit(f.address()?),
                    3 => {
                        f.skip(1)?; // page bits
                        ChunkIndex::FixedArray(f.address()?)
                    }
                    4 => ChunkIndex::ExtensibleArray,
                    5 => {
                        f.skip(6)?; // node size, split and merge percent
                        ChunkIndex::BTreeV2(f.address()?)
                    }
                    other => {
                        return Err(Error::malformed(format!("unknown chunk index type {other}")));
                    }
                };
                Ok(Self::Chunked {
                    chunk: chunk_dims(dims, rank)?,
                    index,
                })
            }
            3 => Err(Error::malformed("virtual datasets are not supported")),
            other => Err(Error::malformed(format!("unknown layout class {other}"))),
        }
    }
}

/// Chunk dims as stored carry a trailing element-size dimension.
fn chunk_dims(mut dims: Shape, rank: usize) -> Result<Shape> {
    if dims.len() == rank + 1 {
        dims.pop();
    }
    if dims.len() != rank || dims.contains(&0) {
        return Err(Error::malformed(format!(
            "chunk dims {:?} don't fit a rank-{rank} dataset",
            dims.as_slice()
        )));
    }
    Ok(dims)
}

// ============================================================================
// Filter pipeline
// ============================================================================

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;

/// One filter of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    pub id: u16,
    pub optional: bool,
    pub values: Vec<u32>,
}

/// Filters applied to each chunk, in write order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterPipeline {
    pub filters: Vec<Filter>,
}

impl FilterPipeline {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Self> {
        let mut f = Fields::new(data, sizes, "filter pipeline");
        let version = f.u8()?;
        let count = f.u8()? as usize;
        if version == 1 {
            f.skip(6)?;
        } else if version != 2 {
            return Err(Error::malformed(format!("unsupported filter pipeline version {version}")));
        }

        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            let id = f.u16()?;
            let name_len = if version == 1 || id >= 256 { f.u16()? as usize } else { 0 };
            let flags = f.u16()?;
            let nvalues = f.u16()? as usize;
            if name_len > 0 {
                f.skip(if version == 1 { pad8(name_len) } else { name_len })?;
            }
            let mut values = Vec::with_capacity(nvalues);
            for _ in 0..nvalues {
                values.push(f.u32()?);
            }
            if version == 1 && nvalues % 2 == 1 {
                f.skip(4)?;
            }
            filters.push(Filter {
                id,
                optional: flags & 0x01 != 0,
                values,
            });
        }
        Ok(Self { filters })
    }

    /// Short description, e.g. `shuffle+deflate`.
    pub fn describe(&self) -> Option<String> {
        if self.filters.is_empty() {
            return None;
        }
        let names: Vec<String> = self
            .filters
            .iter()
            .map(|f| match f.id {
                FILTER_DEFLATE => "deflate".to_string(),
                FILTER_SHUFFLE => "shuffle".to_string(),
                FILTER_FLETCHER32 => "fletcher32".to_string(),
                other => format!("filter{other}"),
            })
            .collect();
        Some(names.join("+"))
    }

    /// Undo the pipeline on one stored chunk. Bit `i` of `mask` marks filter
    /// `i` as skipped for this chunk.
    pub fn decode(&self, mut data: Vec<u8>, mask: u32) -> Result<Vec<u8>> {
        for (i, filter) in self.filters.iter().enumerate().rev() {
            if i < 32 && mask & (1 << i) != 0 {
                continue;
            }
            data = match filter.id {
                FILTER_DEFLATE => Codec::Zlib.decode(&data)?,
                FILTER_SHUFFLE => {
                    let size = filter.values.first().copied().unwrap_or(1) as usize;
                    unshuffle(&data, size)
                }
                FILTER_FLETCHER32 => {
                    if data.len() < 4 {
                        return Err(Error::malformed("fletcher32 chunk shorter than its checksum"));
                    }
                    data.truncate(data.len() - 4);
                    data
                }
                other => {
                    return Err(Error::malformed(format!("unsupported HDF5 filter {other}")));
                }
            };
        }
        Ok(data)
    }
}

// ============================================================================
// Links and group storage
// ============================================================================

/// Where a link points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkTarget {
    Hard(u64),
    Soft(String),
    External,
}

/// A link message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub target: LinkTarget,
}

impl Link {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Self> {
        let mut f = Fields::new(data, sizes, "link");
        let version = f.u8()?;
        if version != 1 {
            return Err(Error::malformed(format!("unsupported link version {version}")));
        }
        let flags = f.u8()?;
        let link_type = if flags & 0x08 != 0 { f.u8()? } else { 0 };
        if flags & 0x04 != 0 {
            f.skip(8)?; // creation order
        }
        if flags & 0x10 != 0 {
            f.skip(1)?; // name charset
        }
        let name_len = f.uint(1 << (flags & 0x03))? as usize;
        let name = String::from_utf8_lossy(f.take(name_len)?).into_owned();
        let target = match link_type {
            0 => LinkTarget::Hard(
                f.address()?
                    .ok_or_else(|| Error::malformed(format!("link {name:?} has no target")))?,
            ),
            1 => {
                let len = f.u16()? as usize;
                LinkTarget::Soft(String::from_utf8_lossy(f.take(len)?).into_owned())
            }
            _ => LinkTarget::External,
        };
        Ok(Self { name, target })
    }
}

/// Dense storage pointers shared by the link info and attribute info messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DenseStorage {
    pub heap: Option<u64>,
    pub name_index: Option<u64>,
}

impl DenseStorage {
    /// Parse a link info (`counter_width = 8`) or attribute info
    /// (`counter_width = 2`) message.
    pub fn parse(data: &[u8], sizes: Sizes, counter_width: usize) -> Result<Self> {
        let mut f = Fields::new(data, sizes, "dense storage info");
        let version = f.u8()?;
        if version != 0 {
            return Err(Error::malformed(format!("unsupported storage info version {version}")));
        }
        let flags = f.u8()?;
        if flags & 0x01 != 0 {
            f.skip(counter_width)?;
        }
        Ok(Self {
            heap: f.address()?,
            name_index: f.address()?,
        })
    }
}

/// Symbol table message: B-tree and local heap of an old-style group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SymbolTable {
    pub btree: u64,
    pub heap: u64,
}

impl SymbolTable {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Self> {
        let mut f = Fields::new(data, sizes, "symbol table");
        let btree = f.address()?;
        let heap = f.address()?;
        match (btree, heap) {
            (Some(btree), Some(heap)) => Ok(Self { btree, heap }),
            _ => Err(Error::malformed("symbol table with undefined addresses")),
        }
    }
}

/// Target of a shared message stored in another object header.
pub fn parse_shared(data: &[u8], sizes: Sizes) -> Result<u64> {
    let mut f = Fields::new(data, sizes, "shared message");
    let version = f.u8()?;
    let kind = f.u8()?;
    match version {
        1 => f.skip(6)?,
        2 | 3 => {
            // Type 1 lives in the shared message heap
            if version == 3 && kind == 1 {
                return Err(Error::malformed("messages in the shared heap are not supported"));
            }
        }
        v => return Err(Error::malformed(format!("unsupported shared message version {v}"))),
    }
    f.address()?
        .ok_or_else(|| Error::malformed("shared message with undefined address"))
}

// ============================================================================
// Attributes
// ============================================================================

/// An attribute message, with its type left undecoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeMessage {
    pub name: String,
    pub datatype: Vec<u8>,
    pub datatype_shared: bool,
    pub dataspace: Option<Dataspace>,
    pub data: Vec<u8>,
}

impl AttributeMessage {
    pub fn parse(data: &[u8], sizes: Sizes) -> Result<Self> {
        let mut f = Fields::new(data, sizes, "attribute");
        let version = f.u8()?;
        let flags = f.u8()?;
        let name_len = f.u16()? as usize;
        let type_len = f.u16()? as usize;
        let space_len = f.u16()? as usize;
        let padded = match version {
            1 => true,
            2 => false,
            3 => {
                f.skip(1)?; // name charset
                false
            }
            v => return Err(Error::malformed(format!("unsupported attribute version {v}"))),
        };
        let field = |n: usize| if padded { pad8(n) } else { n };

        let raw_name = f.take(field(name_len))?;
        let name_end = raw_name[..name_len.min(raw_name.len())]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_len.min(raw_name.len()));
        let name = String::from_utf8_lossy(&raw_name[..name_end]).into_owned();
        let datatype = f.take(field(type_len))?[..type_len].to_vec();
        let space = f.take(field(space_len))?;
        // Shared dataspaces are rare enough to read as unknown
        let dataspace = if version > 1 && flags & 0x02 != 0 {
            None
        } else {
            Some(Dataspace::parse(&space[..space_len], sizes)?)
        };
        Ok(Self {
            name,
            datatype,
            datatype_shared: version > 1 && flags & 0x01 != 0,
            dataspace,
            data: f.rest().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: Sizes = Sizes::DEFAULT;

    #[test]
    fn test_dataspace_versions() {
        let mut v1 = vec![1, 2, 0, 0, 0, 0, 0, 0];
        v1.extend_from_slice(&3u64.to_le_bytes());
        v1.extend_from_slice(&4u64.to_le_bytes());
        let ds = Dataspace::parse(&v1, S).unwrap();
        assert_eq!(ds.shape.as_slice(), &[3, 4]);
        assert_eq!(ds.element_count().unwrap(), 12);

        let scalar = Dataspace::parse(&[2, 0, 0, 0], S).unwrap();
        assert!(scalar.shape.is_empty());
        assert_eq!(scalar.element_count().unwrap(), 1);

        let null = Dataspace::parse(&[2, 0, 0, 2], S).unwrap();
        assert_eq!(null.element_count().unwrap(), 0);
    }

    fn type_header(class: u8, version: u8, bits: [u8; 3], size: u32) -> Vec<u8> {
        let mut out = vec![(version << 4) | class];
        out.extend_from_slice(&bits);
        out.extend_from_slice(&size.to_le_bytes());
        out
    }

    #[test]
    fn test_numeric_datatypes() {
        let mut i32_be = type_header(0, 1, [0x09, 0, 0], 4);
        i32_be.extend_from_slice(&[0, 0, 32, 0]);
        let dt = Datatype::parse(&i32_be, S).unwrap();
        assert_eq!(dt.dtype().unwrap(), DataType::parse(">i4").unwrap());

        let mut f64_le = type_header(1, 1, [0x20, 0x3F, 0], 8);
        f64_le.extend_from_slice(&[0u8; 12]);
        assert_eq!(Datatype::parse(&f64_le, S).unwrap().dtype().unwrap(), DataType::FLOAT64);
    }

    #[test]
    fn test_bool_enum_and_strings() {
        let mut e = type_header(8, 3, [2, 0, 0], 1);
        e.extend(type_header(0, 1, [0x08, 0, 0], 1));
        e.extend_from_slice(&[0, 8, 0, 0]);
        e.extend_from_slice(b"FALSE\0TRUE\0");
        e.extend_from_slice(&[0, 1]);
        assert_eq!(Datatype::parse(&e, S).unwrap().dtype().unwrap(), DataType::BOOL);

        let mut vlen = type_header(9, 1, [0x01, 0x01, 0], 16);
        vlen.extend(type_header(0, 1, [0, 0, 0], 1));
        vlen.extend_from_slice(&[0, 8, 0, 0]);
        let dt = Datatype::parse(&vlen, S).unwrap();
        assert_eq!(dt.class, TypeClass::VlenString);
        assert_eq!(dt.size, 16);

        let fixed = Datatype::parse(&type_header(3, 1, [0x02, 0, 0], 6), S).unwrap();
        assert_eq!(fixed.class, TypeClass::FixedString { space_padded: true });
        assert_eq!(fixed.dtype().unwrap().typestr(), "|S6");

        let reference = Datatype::parse(&type_header(7, 1, [0, 0, 0], 8), S).unwrap();
        assert!(matches!(reference.dtype(), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn test_filter_pipeline_decode() {
        let mut msg = vec![2, 2];
        // shuffle, element size 4
        msg.extend_from_slice(&2u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&1u16.to_le_bytes());
        msg.extend_from_slice(&4u32.to_le_bytes());
        // deflate, level 6
        msg.extend_from_slice(&1u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&1u16.to_le_bytes());
        msg.extend_from_slice(&6u32.to_le_bytes());
        let pipeline = FilterPipeline::parse(&msg, S).unwrap();
        assert_eq!(pipeline.describe().as_deref(), Some("shuffle+deflate"));

        let raw: Vec<u8> = [1.5f32, -2.0, 7.25].iter().flat_map(|v| v.to_le_bytes()).collect();
        let stored = Codec::Zlib.encode(&crate::container::shuffle(&raw, 4)).unwrap();
        assert_eq!(pipeline.decode(stored, 0).unwrap(), raw);

        // Mask bit 1 skips deflate for this chunk
        let stored = crate::container::shuffle(&raw, 4);
        assert_eq!(pipeline.decode(stored, 0b10).unwrap(), raw);
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let pipeline = FilterPipeline {
            filters: vec![Filter {
                id: 32001,
                optional: false,
                values: Vec::new(),
            }],
        };
        assert!(matches!(pipeline.decode(vec![1, 2], 0), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn test_layout_chunk_dims() {
        let mut msg = vec![3, 2, 2];
        msg.extend_from_slice(&0x400u64.to_le_bytes());
        msg.extend_from_slice(&16u32.to_le_bytes());
        msg.extend_from_slice(&8u32.to_le_bytes());
        let layout = Layout::parse(&msg, S, 1).unwrap();
        assert_eq!(
            layout,
            Layout::Chunked {
                chunk: Shape::from_slice(&[16]),
                index: ChunkIndex::BTreeV1(Some(0x400)),
            }
        );
        assert!(Layout::parse(&msg, S, 3).is_err());
    }

    #[test]
    fn test_link_message() {
        let mut msg = vec![1, 0x08, 1, 4];
        msg.extend_from_slice(b"data");
        msg.extend_from_slice(&5u16.to_le_bytes());
        msg.extend_from_slice(b"/x/yz");
        let link = Link::parse(&msg, S).unwrap();
        assert_eq!(link.name, "data");
        assert_eq!(link.target, LinkTarget::Soft("/x/yz".into()));
    }
}
