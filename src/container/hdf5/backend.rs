//! Container backend over an HDF5 file read with byte-range requests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Number, Value};
use tracing::{debug, trace};

use super::btree::{group_entries, BTreeV2};
use super::dataset::Dataset;
use super::format::FileIo;
use super::heap::{FractalHeap, GlobalHeap, LocalHeap};
use super::messages::{
    parse_shared, AttributeMessage, Datatype, DenseStorage, Layout, Link, LinkTarget, SymbolTable,
    TypeClass,
};
use super::object_header::{
    ObjectHeader, MSG_ATTRIBUTE, MSG_ATTRIBUTE_INFO, MSG_DATATYPE, MSG_LINK, MSG_LINK_INFO,
    MSG_SYMBOL_TABLE,
};
use crate::container::{
    element_count, scatter_chunk, ArrayData, ArrayInfo, ArrayValues, Attributes, ChildEntry,
    ContainerBackend, NodeHandle, NodeKind,
};
use crate::remote::CachedReader;
use crate::util::{DataType, Endianness, Error, Result, ScalarKind};

/// B-tree v2 record types of dense group and attribute storage.
const RECORD_LINK_NAME: u8 = 5;
const RECORD_ATTRIBUTE_NAME: u8 = 8;

/// Heap IDs in attribute name records are always 8 bytes.
const ATTRIBUTE_HEAP_ID_LEN: usize = 8;

/// Reads groups, datasets, and attributes of an HDF5 file.
///
/// Node tokens are object header addresses. Headers are parsed once and
/// cached; dataset payloads are fetched only when an array is materialized.
pub struct Hdf5Backend {
    io: FileIo,
    root: u64,
    headers: Mutex<HashMap<u64, Arc<ObjectHeader>>>,
    global_heaps: Mutex<HashMap<u64, Arc<GlobalHeap>>>,
}

impl Hdf5Backend {
    /// Locate the superblock of the file behind `reader`.
    pub fn open(reader: Arc<CachedReader>) -> Result<Self> {
        let (io, superblock) = FileIo::open(reader)?;
        debug!(
            "hdf5 file {} (superblock v{}, root at {:#x})",
            io.resource(),
            superblock.version,
            superblock.root
        );
        Ok(Self {
            io,
            root: superblock.root,
            headers: Mutex::new(HashMap::new()),
            global_heaps: Mutex::new(HashMap::new()),
        })
    }

    fn header(&self, addr: u64) -> Result<Arc<ObjectHeader>> {
        if let Some(h) = self.headers.lock().get(&addr) {
            return Ok(Arc::clone(h));
        }
        let header = Arc::new(ObjectHeader::read(&self.io, addr)?);
        self.headers.lock().insert(addr, Arc::clone(&header));
        Ok(header)
    }

    fn global_heap(&self, addr: u64) -> Result<Arc<GlobalHeap>> {
        if let Some(h) = self.global_heaps.lock().get(&addr) {
            return Ok(Arc::clone(h));
        }
        let heap = Arc::new(GlobalHeap::read(&self.io, addr)?);
        self.global_heaps.lock().insert(addr, Arc::clone(&heap));
        Ok(heap)
    }

    /// Hard links of a group as (name, object header address), sorted by name.
    fn links(&self, header: &ObjectHeader) -> Result<Vec<(String, u64)>> {
        let sizes = self.io.sizes();
        let mut links = Vec::new();

        if let Some(msg) = header.find(MSG_SYMBOL_TABLE) {
            let table = SymbolTable::parse(&msg.data, sizes)?;
            let heap = LocalHeap::read(&self.io, table.heap)?;
            for entry in group_entries(&self.io, table.btree)? {
                links.push((heap.name_at(entry.name_offset)?, entry.header));
            }
        } else {
            let mut parsed = Vec::new();
            for msg in header.all(MSG_LINK) {
                parsed.push(Link::parse(&msg.data, sizes)?);
            }
            if let Some(msg) = header.find(MSG_LINK_INFO) {
                let dense = DenseStorage::parse(&msg.data, sizes, 8)?;
                if let (Some(heap), Some(index)) = (dense.heap, dense.name_index) {
                    for body in self.dense_records(heap, index, RECORD_LINK_NAME)? {
                        parsed.push(Link::parse(&body, sizes)?);
                    }
                }
            }
            for link in parsed {
                match link.target {
                    LinkTarget::Hard(addr) => links.push((link.name, addr)),
                    other => trace!("skipping link {:?} -> {other:?}", link.name),
                }
            }
        }

        links.sort_by(|a, b| a.0.cmp(&b.0));
        links.dedup_by(|a, b| a.0 == b.0);
        Ok(links)
    }

    /// Heap objects named by the records of a dense storage name index.
    fn dense_records(&self, heap: u64, index: u64, record_type: u8) -> Result<Vec<Vec<u8>>> {
        let heap = FractalHeap::open(&self.io, heap)?;
        let tree = BTreeV2::open(&self.io, index)?;
        if tree.kind() != record_type {
            return Err(Error::malformed(format!(
                "name index has record type {}, expected {record_type}",
                tree.kind()
            )));
        }
        // Link records lead with the name hash; attribute records with the ID
        let (id_start, id_len) = match record_type {
            RECORD_LINK_NAME => (4, heap.id_len()),
            _ => (0, ATTRIBUTE_HEAP_ID_LEN),
        };
        tree.records(&self.io)?
            .iter()
            .map(|record| {
                let id = record
                    .get(id_start..id_start + id_len)
                    .ok_or_else(|| Error::malformed("name index record shorter than its heap ID"))?;
                heap.object(&self.io, id)
            })
            .collect()
    }

    fn attribute_messages(&self, header: &ObjectHeader) -> Result<Vec<AttributeMessage>> {
        let sizes = self.io.sizes();
        let mut out = Vec::new();
        for msg in header.all(MSG_ATTRIBUTE) {
            out.push(AttributeMessage::parse(&header.resolve(&self.io, msg)?, sizes)?);
        }
        if let Some(msg) = header.find(MSG_ATTRIBUTE_INFO) {
            let dense = DenseStorage::parse(&msg.data, sizes, 2)?;
            if let (Some(heap), Some(index)) = (dense.heap, dense.name_index) {
                for body in self.dense_records(heap, index, RECORD_ATTRIBUTE_NAME)? {
                    out.push(AttributeMessage::parse(&body, sizes)?);
                }
            }
        }
        Ok(out)
    }

    fn attribute_datatype(&self, attr: &AttributeMessage) -> Result<Datatype> {
        if !attr.datatype_shared {
            return Datatype::parse(&attr.datatype, self.io.sizes());
        }
        let addr = parse_shared(&attr.datatype, self.io.sizes())?;
        let committed = self.header(addr)?;
        let msg = committed
            .find(MSG_DATATYPE)
            .ok_or_else(|| Error::malformed(format!("no committed datatype at {addr:#x}")))?;
        Datatype::parse(&msg.data, self.io.sizes())
    }

    /// JSON value of one attribute; `null` for types that have no JSON form.
    fn attribute_value(&self, attr: &AttributeMessage) -> Result<Value> {
        let Some(space) = attr.dataspace.as_ref().filter(|s| !s.null) else {
            return Ok(Value::Null);
        };
        let datatype = self.attribute_datatype(attr)?;
        if let TypeClass::Unsupported(class) = datatype.class {
            trace!("attribute {:?}: {class} values read as null", attr.name);
            return Ok(Value::Null);
        }
        let count = element_count(&space.shape)?;
        let need = count
            .checked_mul(datatype.size)
            .ok_or_else(|| Error::malformed("attribute size overflows"))?;
        let bytes = attr.data.get(..need).ok_or_else(|| {
            Error::malformed(format!(
                "attribute {:?} holds {} bytes, expected {need}",
                attr.name,
                attr.data.len()
            ))
        })?;
        let values = self.decode_elements(&datatype, bytes, count)?;
        Ok(values_to_json(values, space.shape.is_empty()))
    }

    /// Decode `count` stored elements of `datatype`.
    fn decode_elements(&self, datatype: &Datatype, bytes: &[u8], count: usize) -> Result<ArrayValues> {
        match &datatype.class {
            TypeClass::Numeric(dtype) => ArrayValues::decode(dtype, bytes, count),
            TypeClass::FixedString { space_padded } => {
                let dtype = DataType::new(ScalarKind::FixedBytes(datatype.size), Endianness::NotApplicable);
                let mut values = ArrayValues::decode(&dtype, bytes, count)?;
                if let (true, ArrayValues::Text(items)) = (*space_padded, &mut values) {
                    for s in items.iter_mut() {
                        s.truncate(s.trim_end_matches(' ').len());
                    }
                }
                Ok(values)
            }
            TypeClass::VlenString => self.decode_vlen_strings(datatype.size, bytes, count),
            TypeClass::Unsupported(class) => {
                Err(Error::malformed(format!("unsupported HDF5 datatype class: {class}")))
            }
        }
    }

    /// Variable-length strings: length, global heap collection, object index.
    fn decode_vlen_strings(&self, size: usize, bytes: &[u8], count: usize) -> Result<ArrayValues> {
        if size.checked_mul(count) != Some(bytes.len()) {
            return Err(Error::malformed(format!(
                "{} bytes don't hold {count} variable-length strings",
                bytes.len()
            )));
        }
        let mut out = Vec::with_capacity(count);
        for element in bytes.chunks_exact(size.max(1)) {
            let mut f = self.io.fields(element, "variable-length string");
            let len = f.u32()? as usize;
            let collection = f.address()?;
            let index = f.u32()?;
            let text = match collection {
                Some(addr) if len > 0 => {
                    let heap = self.global_heap(addr)?;
                    let data = heap.object(index)?;
                    String::from_utf8_lossy(&data[..len.min(data.len())]).into_owned()
                }
                _ => String::new(),
            };
            out.push(text);
        }
        Ok(ArrayValues::Text(out))
    }

    /// `n` copies of the dataset's fill value, or of zero when none is set.
    fn fill(&self, dataset: &Dataset, dtype: &DataType, n: usize) -> Result<ArrayValues> {
        match (&dataset.fill, &dataset.datatype.class) {
            (Some(one), TypeClass::Numeric(_) | TypeClass::FixedString { .. }) => {
                self.decode_elements(&dataset.datatype, &one.repeat(n), n)
            }
            _ => Ok(ArrayValues::filled(dtype, &Value::Null, n)),
        }
    }

    fn read_dataset(&self, dataset: &Dataset) -> Result<ArrayData> {
        let dtype = dataset.datatype.dtype()?;
        let shape = dataset.space.shape.clone();
        let total = element_count(&shape)?;
        let size = dataset.datatype.size;
        let total_bytes = total
            .checked_mul(size)
            .ok_or_else(|| Error::malformed("dataset size overflows"))?;

        let values = match &dataset.layout {
            Layout::Compact(bytes) => {
                let bytes = bytes
                    .get(..total_bytes)
                    .ok_or_else(|| Error::malformed("compact dataset shorter than its shape"))?;
                self.decode_elements(&dataset.datatype, bytes, total)?
            }
            Layout::Contiguous { address: None, .. } => self.fill(dataset, &dtype, total)?,
            Layout::Contiguous {
                address: Some(addr),
                size: stored,
            } => {
                if (total_bytes as u64) > *stored {
                    return Err(Error::malformed(format!(
                        "contiguous storage of {stored} bytes can't hold {total} elements"
                    )));
                }
                let bytes = self.io.read(*addr, total_bytes as u64, "dataset")?;
                self.decode_elements(&dataset.datatype, &bytes, total)?
            }
            Layout::Chunked { chunk, .. } => {
                let mut out = self.fill(dataset, &dtype, total)?;
                let chunk_len = element_count(chunk)?;
                let chunk_bytes = dataset.chunk_bytes(chunk)? as usize;
                let records = dataset.chunks(&self.io)?;
                for record in &records {
                    let stored = self.io.read(record.address, record.size, "chunk")?;
                    let mut raw = dataset.filters.decode(stored, record.filter_mask)?;
                    if raw.len() < chunk_bytes {
                        return Err(Error::malformed(format!(
                            "chunk at {:#x} decodes to {} bytes, expected {chunk_bytes}",
                            record.address,
                            raw.len()
                        )));
                    }
                    raw.truncate(chunk_bytes);
                    let values = self.decode_elements(&dataset.datatype, &raw, chunk_len)?;
                    scatter_chunk(&shape, chunk, &record.index, &values, &mut out)?;
                }
                trace!("assembled {total} values from {} chunks", records.len());
                out
            }
        };
        ArrayData::new(dtype, shape, values)
    }
}

fn number(x: f64) -> Value {
    Number::from_f64(x).map_or(Value::Null, Value::Number)
}

fn values_to_json(values: ArrayValues, scalar: bool) -> Value {
    let mut items: Vec<Value> = match values {
        ArrayValues::Bool(v) => v.into_iter().map(Value::Bool).collect(),
        ArrayValues::Int(v) => v.into_iter().map(Value::from).collect(),
        ArrayValues::UInt(v) => v.into_iter().map(Value::from).collect(),
        ArrayValues::Float(v) => v.into_iter().map(number).collect(),
        ArrayValues::Text(v) => v.into_iter().map(Value::String).collect(),
    };
    if scalar && items.len() == 1 {
        items.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(items)
    }
}

impl ContainerBackend for Hdf5Backend {
    fn format_name(&self) -> &'static str {
        "hdf5"
    }

    fn root(&self) -> Result<NodeHandle> {
        Ok(NodeHandle::group(self.root))
    }

    fn children(&self, group: &NodeHandle) -> Result<Vec<ChildEntry>> {
        let header = self.header(group.token)?;
        let mut out = Vec::new();
        for (name, addr) in self.links(&header)? {
            let child = self.header(addr)?;
            if child.is_dataset() {
                // Unreadable types surface when the array is opened, not here
                let info = Dataset::from_header(&self.io, &child).and_then(|d| d.info());
                if let Err(e) = &info {
                    debug!("{name}: {e}");
                }
                out.push(ChildEntry {
                    name,
                    handle: NodeHandle::array(addr),
                    info: info.ok(),
                    attributes: None,
                });
            } else {
                out.push(ChildEntry {
                    name,
                    handle: NodeHandle::group(addr),
                    info: None,
                    attributes: None,
                });
            }
        }
        Ok(out)
    }

    fn attributes(&self, node: &NodeHandle) -> Result<Attributes> {
        let header = self.header(node.token)?;
        let mut map = Map::new();
        for attr in self.attribute_messages(&header)? {
            let value = self.attribute_value(&attr)?;
            map.insert(attr.name, value);
        }
        Ok(Attributes::from_map(map))
    }

    fn array_info(&self, node: &NodeHandle) -> Result<ArrayInfo> {
        Dataset::from_header(&self.io, &*self.header(node.token)?)?.info()
    }

    fn read_array(&self, node: &NodeHandle, _info: &ArrayInfo) -> Result<ArrayData> {
        let header = self.header(node.token)?;
        let dataset = Dataset::from_header(&self.io, &header)?;
        self.read_dataset(&dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::hdf5::{ArrayBuilder, Format, GroupBuilder, Hdf5Writer};
    use crate::remote::FileSource;

    fn backend(bytes: &[u8]) -> (tempfile::TempDir, Result<Hdf5Backend>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.h5");
        std::fs::write(&path, bytes).unwrap();
        let reader = CachedReader::new(Box::new(FileSource::open(&path).unwrap()), None, 4096);
        (dir, Hdf5Backend::open(Arc::new(reader)))
    }

    fn tree() -> GroupBuilder {
        let mut root = GroupBuilder::new();
        root.attr("nwb_version", "2.7.0")
            .array("data", ArrayBuilder::f64s(&[1.0, 2.0]));
        root
    }

    #[test]
    fn test_user_block_is_skipped() {
        let mut bytes = vec![0u8; 512];
        bytes.extend(Hdf5Writer::write_to_vec(&tree()).unwrap());
        let (_dir, backend) = backend(&bytes);
        let backend = backend.unwrap();
        let root = backend.root().unwrap();
        let children = backend.children(&root).unwrap();
        assert_eq!(children.len(), 1);
        let info = children[0].info.clone().unwrap();
        let data = backend.read_array(&children[0].handle, &info).unwrap();
        assert_eq!(data.as_f64_slice(), Some(&[1.0, 2.0][..]));
    }

    #[test]
    fn test_corrupt_metadata_rejected() {
        let bytes = Hdf5Writer::write_to_vec(&tree()).unwrap();

        // Superblock checksum
        let mut bad = bytes.clone();
        bad[20] ^= 0xFF;
        let (_dir, result) = backend(&bad);
        assert!(matches!(result, Err(Error::MalformedContainer(_))));

        // Root object header, written last
        let mut bad = bytes.clone();
        let at = bad.len() - 6;
        bad[at] ^= 0xFF;
        let (_dir, result) = backend(&bad);
        let backend = result.unwrap();
        let root = backend.root().unwrap();
        assert!(matches!(backend.children(&root), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn test_old_layout_attributes() {
        let bytes = Hdf5Writer::write_to_vec_as(&tree(), Format::Earliest).unwrap();
        let (_dir, backend) = backend(&bytes);
        let backend = backend.unwrap();
        let root = backend.root().unwrap();
        let attrs = backend.attributes(&root).unwrap();
        assert_eq!(attrs.get_str("nwb_version"), Some("2.7.0"));
    }
}
