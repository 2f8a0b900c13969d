//! Container backend over a reference manifest.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use super::manifest::{RefValue, ReferenceManifest};
use super::zarray::ZArray;
use crate::container::{
    element_count, grid_positions, scatter_chunk, ArrayData, ArrayInfo, ArrayValues, Attributes,
    ChildEntry, ContainerBackend, NodeHandle, NodeKind,
};
use crate::remote::RemoteStore;
use crate::util::{Error, Result};

const ZGROUP: &str = ".zgroup";
const ZARRAY: &str = ".zarray";
const ZATTRS: &str = ".zattrs";

struct IndexedNode {
    path: String,
    name: String,
    kind: NodeKind,
    children: Vec<usize>,
}

/// Reads groups and arrays described by a reference manifest.
///
/// Metadata comes from the manifest itself; chunk bytes are fetched through
/// the shared [`RemoteStore`] only when an array is materialized.
pub struct RefsBackend {
    manifest: ReferenceManifest,
    store: Arc<RemoteStore>,
    nodes: Vec<IndexedNode>,
    arrays: Mutex<HashMap<u64, Arc<ZArray>>>,
}

fn meta_key(path: &str, leaf: &str) -> String {
    if path.is_empty() {
        leaf.to_string()
    } else {
        format!("{path}/{leaf}")
    }
}

fn parent_of(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

impl RefsBackend {
    /// Index the node tree from the manifest keys.
    pub fn new(manifest: ReferenceManifest, store: Arc<RemoteStore>) -> Result<Self> {
        let mut kinds: BTreeMap<String, NodeKind> = BTreeMap::new();
        kinds.insert(String::new(), NodeKind::Group);

        for key in manifest.keys() {
            let (path, leaf) = parent_of(key);
            let kind = match leaf {
                ZGROUP => NodeKind::Group,
                ZARRAY => NodeKind::Array,
                _ => continue,
            };
            if let Some(prev) = kinds.insert(path.to_string(), kind) {
                if prev != kind && !path.is_empty() {
                    return Err(Error::malformed(format!("{path:?} is both a group and an array")));
                }
            }
            if path.is_empty() && kind == NodeKind::Array {
                return Err(Error::malformed("root of a reference manifest must be a group"));
            }

            // Intermediate groups may be implied by deeper keys
            let mut ancestor = parent_of(path).0;
            while !ancestor.is_empty() {
                match kinds.get(ancestor) {
                    Some(NodeKind::Array) => {
                        return Err(Error::malformed(format!("array {ancestor:?} has children")));
                    }
                    Some(NodeKind::Group) => {}
                    None => {
                        kinds.insert(ancestor.to_string(), NodeKind::Group);
                    }
                }
                ancestor = parent_of(ancestor).0;
            }
        }
        if !manifest.contains(ZGROUP) && kinds.len() == 1 {
            return Err(Error::malformed("reference manifest holds no group or array metadata"));
        }

        // BTreeMap order puts every parent before its children
        let mut nodes: Vec<IndexedNode> = Vec::with_capacity(kinds.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(kinds.len());
        for (path, kind) in kinds {
            let id = nodes.len();
            if !path.is_empty() {
                let (parent, _) = parent_of(&path);
                let parent_id = *index
                    .get(parent)
                    .ok_or_else(|| Error::malformed(format!("no parent group for {path:?}")))?;
                nodes[parent_id].children.push(id);
            }
            let name = parent_of(&path).1.to_string();
            index.insert(path.clone(), id);
            nodes.push(IndexedNode {
                path,
                name,
                kind,
                children: Vec::new(),
            });
        }
        debug!("indexed {} nodes from {} references", nodes.len(), manifest.len());

        Ok(Self {
            manifest,
            store,
            nodes,
            arrays: Mutex::new(HashMap::new()),
        })
    }

    /// The parsed manifest.
    pub fn manifest(&self) -> &ReferenceManifest {
        &self.manifest
    }

    fn node(&self, handle: &NodeHandle) -> Result<&IndexedNode> {
        self.nodes
            .get(handle.token as usize)
            .ok_or_else(|| Error::malformed(format!("unknown node token {}", handle.token)))
    }

    /// Bytes behind one reference.
    fn fetch(&self, key: &str, value: &RefValue) -> Result<Vec<u8>> {
        match value {
            RefValue::Inline(bytes) => Ok(bytes.clone()),
            RefValue::Json(v) => Ok(serde_json::to_vec(v)?),
            RefValue::Whole { url } => self.store.reader(url)?.read_all(),
            RefValue::Range { url, offset, size } => {
                trace!("chunk {key} -> {url} [{offset}+{size}]");
                self.store.reader(url)?.read_at(*offset, *size)
            }
        }
    }

    /// JSON document stored under a metadata key.
    fn json(&self, key: &str) -> Result<Option<Value>> {
        match self.manifest.get(key) {
            None => Ok(None),
            Some(RefValue::Json(v)) => Ok(Some(v.clone())),
            Some(other) => {
                let bytes = self.fetch(key, other)?;
                let v = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::malformed(format!("{key}: not JSON: {e}")))?;
                Ok(Some(v))
            }
        }
    }

    fn zarray(&self, handle: &NodeHandle) -> Result<Arc<ZArray>> {
        if let Some(z) = self.arrays.lock().get(&handle.token) {
            return Ok(Arc::clone(z));
        }
        let node = self.node(handle)?;
        let key = meta_key(&node.path, ZARRAY);
        let value = self
            .json(&key)?
            .ok_or_else(|| Error::malformed(format!("missing {key}")))?;
        let z = Arc::new(ZArray::from_value(&value).map_err(|e| match e {
            Error::MalformedContainer(msg) => Error::malformed(format!("{}: {msg}", node.path)),
            other => other,
        })?);
        self.arrays.lock().insert(handle.token, Arc::clone(&z));
        Ok(z)
    }
}

impl ContainerBackend for RefsBackend {
    fn format_name(&self) -> &'static str {
        "reference"
    }

    fn root(&self) -> Result<NodeHandle> {
        Ok(NodeHandle::group(0))
    }

    fn children(&self, group: &NodeHandle) -> Result<Vec<ChildEntry>> {
        let node = self.node(group)?;
        Ok(node
            .children
            .iter()
            .map(|&id| {
                let child = &self.nodes[id];
                ChildEntry {
                    name: child.name.clone(),
                    handle: NodeHandle {
                        kind: child.kind,
                        token: id as u64,
                    },
                    // Array metadata is parsed on demand so one unsupported
                    // array doesn't make its siblings unreachable
                    info: None,
                    attributes: None,
                }
            })
            .collect())
    }

    fn attributes(&self, node: &NodeHandle) -> Result<Attributes> {
        let path = &self.node(node)?.path;
        match self.json(&meta_key(path, ZATTRS))? {
            Some(v) => Attributes::from_value(v),
            None => Ok(Attributes::new()),
        }
    }

    fn array_info(&self, node: &NodeHandle) -> Result<ArrayInfo> {
        Ok(self.zarray(node)?.info())
    }

    fn read_array(&self, node: &NodeHandle, _info: &ArrayInfo) -> Result<ArrayData> {
        let z = self.zarray(node)?;
        let path = &self.node(node)?.path;
        let total = element_count(&z.shape)?;
        let mut out = ArrayValues::filled(&z.dtype, &z.fill_value, total);

        let mut fetched = 0usize;
        for index in grid_positions(&z.grid()) {
            let key = format!("{path}/{}", z.chunk_key(&index));
            // Absent chunks keep the fill value
            let Some(value) = self.manifest.get(&key) else {
                continue;
            };
            let raw = self.fetch(&key, value)?;
            let chunk = z.decode_chunk(raw)?;
            scatter_chunk(&z.shape, &z.chunks, &index, &chunk, &mut out)?;
            fetched += 1;
        }
        trace!("{path}: assembled {total} values from {fetched} chunks");

        ArrayData::new(z.dtype, z.shape.clone(), out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Codec, HierarchicalFile};
    use crate::remote::build_client;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::json;
    use std::time::Duration;

    fn store() -> Arc<RemoteStore> {
        let client = build_client(Duration::from_secs(5), "test").unwrap();
        Arc::new(RemoteStore::new(client, None, 0))
    }

    fn b64(bytes: &[u8]) -> String {
        format!("base64:{}", STANDARD.encode(bytes))
    }

    fn f64_bytes(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn open(doc: Value) -> HierarchicalFile {
        let manifest = ReferenceManifest::parse(&serde_json::to_vec(&doc).unwrap()).unwrap();
        let backend = RefsBackend::new(manifest, store()).unwrap();
        HierarchicalFile::new(Box::new(backend)).unwrap()
    }

    #[test]
    fn test_tree_and_attributes() {
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            ".zattrs": {"nwb_version": "2.7.0"},
            "units/.zgroup": {"zarr_format": 2},
            "units/.zattrs": {"neurodata_type": "Units"},
            "units/id/.zarray": {"shape": [2], "chunks": [2], "dtype": "<i8"},
            "units/id/0": b64(&[0u8, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]),
            "processing/behavior/.zgroup": {"zarr_format": 2}
        }}));

        let names: Vec<_> = file.list_children("").unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["processing", "units"]);
        assert!(file.exists("processing/behavior").unwrap());
        assert_eq!(file.attributes("").unwrap().get_str("nwb_version"), Some("2.7.0"));
        assert_eq!(file.attributes("units").unwrap().get_str("neurodata_type"), Some("Units"));
        assert!(file.attributes("processing").unwrap().is_empty());
        assert_eq!(file.array("units/id").unwrap().to_i64().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_chunks_fill_and_compression() {
        let chunk0 = Codec::Zlib.encode(&f64_bytes(&[1.0, 2.0])).unwrap();
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "x/.zarray": {
                "shape": [5], "chunks": [2], "dtype": "<f8", "fill_value": -1.0,
                "compressor": {"id": "zlib", "level": 1}
            },
            "x/0": b64(&chunk0),
            // chunk 1 missing -> fill value
            "x/2": b64(&Codec::Zlib.encode(&f64_bytes(&[5.0, 99.0])).unwrap())
        }}));
        let x = file.array("x").unwrap();
        assert_eq!(x.as_f64_slice().unwrap(), &[1.0, 2.0, -1.0, -1.0, 5.0]);
    }

    #[test]
    fn test_object_strings() {
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "s/.zarray": {"shape": [2], "chunks": [2], "dtype": "|O", "filters": [{"id": "json2"}]},
            "s/0": "[\"left\",\"right\",\"|O\",[2]]"
        }}));
        assert_eq!(file.array("s").unwrap().as_text().unwrap(), &["left", "right"]);
    }

    #[test]
    fn test_two_dimensional_assembly() {
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "m/.zarray": {"shape": [3, 2], "chunks": [2, 2], "dtype": "<f8", "dimension_separator": "/"},
            "m/0/0": b64(&f64_bytes(&[1.0, 2.0, 3.0, 4.0])),
            "m/1/0": b64(&f64_bytes(&[5.0, 6.0, 0.0, 0.0]))
        }}));
        let m = file.array("m").unwrap();
        assert_eq!(m.shape.as_slice(), &[3, 2]);
        assert_eq!(m.as_f64_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_unsupported_array_fails_alone() {
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "good/.zarray": {"shape": [1], "chunks": [1], "dtype": "<f8"},
            "good/0": b64(&f64_bytes(&[3.5])),
            "bad/.zarray": {"shape": [1], "chunks": [1], "dtype": "<f8", "compressor": {"id": "blosc"}}
        }}));
        assert_eq!(file.list_children("").unwrap().len(), 2);
        assert!(matches!(file.array("bad"), Err(Error::MalformedContainer(_))));
        assert_eq!(file.array("good").unwrap().scalar_f64(), Some(3.5));
    }

    #[test]
    fn test_wrong_chunk_size() {
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "x/.zarray": {"shape": [2], "chunks": [2], "dtype": "<f8"},
            "x/0": b64(&f64_bytes(&[1.0]))
        }}));
        assert!(matches!(file.array("x"), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn test_oversized_shape_rejected() {
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "big/.zarray": {"shape": [4294967296u64, 4294967296u64], "chunks": [1, 1], "dtype": "<f8"},
            "wide/.zarray": {"shape": [1, 1], "chunks": [4294967296u64, 4294967296u64], "dtype": "<f8"},
            "wide/0.0": b64(&f64_bytes(&[1.0]))
        }}));
        // Metadata stays readable; only materializing is refused
        assert_eq!(file.array_info("big").unwrap().shape.as_slice(), &[1 << 32, 1 << 32]);
        assert!(matches!(file.array("big"), Err(Error::MalformedContainer(_))));
        assert!(matches!(file.array("wide"), Err(Error::MalformedContainer(_))));
    }

    #[test]
    fn test_shuffled_chunks() {
        let stored = Codec::Zlib
            .encode(&crate::container::shuffle(&f64_bytes(&[1.5, -2.0, 3.25]), 8))
            .unwrap();
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "x/.zarray": {
                "shape": [3], "chunks": [3], "dtype": "<f8",
                "compressor": {"id": "zlib", "level": 1},
                "filters": [{"id": "shuffle", "elementsize": 8}]
            },
            "x/0": b64(&stored)
        }}));
        assert_eq!(file.array("x").unwrap().as_f64_slice().unwrap(), &[1.5, -2.0, 3.25]);
    }

    #[test]
    fn test_empty_manifest_is_malformed() {
        let manifest = ReferenceManifest::parse(br#"{"refs": {"a/0": "x"}}"#).unwrap();
        assert!(matches!(
            RefsBackend::new(manifest, store()),
            Err(Error::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_unreachable_chunk_url() {
        let file = open(json!({"refs": {
            ".zgroup": {"zarr_format": 2},
            "x/.zarray": {"shape": [1], "chunks": [1], "dtype": "<f8"},
            "x/0": ["http://127.0.0.1:1/blob.nwb", 0, 8]
        }}));
        assert!(file.array("x").unwrap_err().is_remote());
    }
}
