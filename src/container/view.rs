//! Hierarchical file view over a container backend.
//!
//! Nodes live in an index-based arena. Each record keeps just enough to
//! resolve its children, attributes or payload on demand; parents are
//! referenced by index, never owned. Nothing is read from the backend until a
//! caller navigates to it, and every payload is fetched at most once.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{ArrayData, Attributes, Shape};
use crate::util::{DataType, Error, Result};

/// Kind of a node in the hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Group,
    Array,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group => write!(f, "group"),
            Self::Array => write!(f, "array"),
        }
    }
}

/// Backend-specific address of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub kind: NodeKind,
    /// Opaque to the view: a file position, a table index, ...
    pub token: u64,
}

impl NodeHandle {
    /// Handle of a group node.
    pub const fn group(token: u64) -> Self {
        Self { kind: NodeKind::Group, token }
    }

    /// Handle of an array node.
    pub const fn array(token: u64) -> Self {
        Self { kind: NodeKind::Array, token }
    }
}

/// Element type and shape of an array node, plus an optional payload codec.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayInfo {
    pub dtype: DataType,
    pub shape: Shape,
    pub codec: Option<String>,
}

/// A child as reported by a backend.
#[derive(Clone, Debug)]
pub struct ChildEntry {
    pub name: String,
    pub handle: NodeHandle,
    /// Array metadata when the backend learns it while listing.
    pub info: Option<ArrayInfo>,
    /// Attributes when the backend learns them while listing.
    pub attributes: Option<Attributes>,
}

/// A byte layout that can be navigated as groups and arrays.
pub trait ContainerBackend {
    /// Short name of the layout, for display.
    fn format_name(&self) -> &'static str;

    /// Handle of the root group.
    fn root(&self) -> Result<NodeHandle>;

    /// Children of a group, in storage order.
    fn children(&self, group: &NodeHandle) -> Result<Vec<ChildEntry>>;

    /// Attributes of a node not already supplied by [`ChildEntry`].
    fn attributes(&self, node: &NodeHandle) -> Result<Attributes>;

    /// Array metadata not already supplied by [`ChildEntry`].
    fn array_info(&self, node: &NodeHandle) -> Result<ArrayInfo>;

    /// Fetch and decode an array payload.
    fn read_array(&self, node: &NodeHandle, info: &ArrayInfo) -> Result<ArrayData>;
}

/// Index of a node in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The root node.
    pub const ROOT: NodeId = NodeId(0);
}

struct NodeRecord {
    name: String,
    parent: Option<NodeId>,
    handle: NodeHandle,
    info: Option<ArrayInfo>,
    children: Option<Vec<NodeId>>,
    attributes: Option<Arc<Attributes>>,
    payload: Option<Arc<ArrayData>>,
}

impl NodeRecord {
    fn new(name: String, parent: Option<NodeId>, handle: NodeHandle) -> Self {
        Self {
            name,
            parent,
            handle,
            info: None,
            children: None,
            attributes: None,
            payload: None,
        }
    }
}

/// Child summary returned by [`HierarchicalFile::list_children`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildInfo {
    pub name: String,
    pub path: String,
    pub kind: NodeKind,
}

/// Read-only, lazily resolved view of a hierarchical container.
pub struct HierarchicalFile {
    backend: Box<dyn ContainerBackend>,
    nodes: RwLock<Vec<NodeRecord>>,
}

/// Split a path into its non-empty segments. `""` and `"/"` are the root.
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Join a parent path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

impl HierarchicalFile {
    /// Create a view over a backend. Only the root handle is resolved.
    pub fn new(backend: Box<dyn ContainerBackend>) -> Result<Self> {
        let root = backend.root()?;
        if root.kind != NodeKind::Group {
            return Err(Error::malformed("root node is not a group"));
        }
        debug!("opened {} container", backend.format_name());
        Ok(Self {
            backend,
            nodes: RwLock::new(vec![NodeRecord::new(String::new(), None, root)]),
        })
    }

    /// Name of the underlying layout.
    pub fn format_name(&self) -> &'static str {
        self.backend.format_name()
    }

    /// Number of nodes resolved so far.
    pub fn loaded_nodes(&self) -> usize {
        self.nodes.read().len()
    }

    /// The root node.
    pub fn root(&self) -> NodeRef<'_> {
        NodeRef {
            file: self,
            id: NodeId::ROOT,
        }
    }

    /// Node at `path`; fails with `NodeNotFound` if it doesn't exist.
    pub fn node(&self, path: &str) -> Result<NodeRef<'_>> {
        let id = self.resolve(path)?;
        Ok(NodeRef { file: self, id })
    }

    /// Check whether a path names a node.
    ///
    /// A missing name is `Ok(false)`; fetch and parse failures still surface.
    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.lookup(path)?.is_some())
    }

    /// Kind of the node at `path`.
    pub fn kind(&self, path: &str) -> Result<NodeKind> {
        let id = self.resolve(path)?;
        Ok(self.nodes.read()[id.0].handle.kind)
    }

    /// Children of the node at `path`. Arrays have none.
    pub fn list_children(&self, path: &str) -> Result<Vec<ChildInfo>> {
        let id = self.resolve(path)?;
        let children = self.expand(id)?;
        let nodes = self.nodes.read();
        Ok(children
            .into_iter()
            .map(|c| {
                let rec = &nodes[c.0];
                ChildInfo {
                    name: rec.name.clone(),
                    path: join_path(path.trim_start_matches('/'), &rec.name),
                    kind: rec.handle.kind,
                }
            })
            .collect())
    }

    /// Attributes of the node at `path`.
    pub fn attributes(&self, path: &str) -> Result<Arc<Attributes>> {
        let id = self.resolve(path)?;
        self.attributes_of(id)
    }

    /// Dtype and shape of the array at `path`.
    pub fn array_info(&self, path: &str) -> Result<ArrayInfo> {
        let id = self.resolve(path)?;
        self.info_of(id)
    }

    /// Payload of the array at `path`, fetched on first request.
    pub fn array(&self, path: &str) -> Result<Arc<ArrayData>> {
        let id = self.resolve(path)?;
        self.payload_of(id)
    }

    /// Check whether the payload at `path` has been materialized.
    pub fn is_materialized(&self, path: &str) -> Result<bool> {
        let id = self.resolve(path)?;
        Ok(self.nodes.read()[id.0].payload.is_some())
    }

    /// Depth-first traversal below `path`, calling `f(node, depth)` for each
    /// descendant. `max_depth = None` walks the whole subtree.
    pub fn walk<F>(&self, path: &str, max_depth: Option<usize>, mut f: F) -> Result<()>
    where
        F: FnMut(&NodeRef<'_>, usize) -> Result<()>,
    {
        let start = self.resolve(path)?;
        let mut stack: Vec<(NodeId, usize)> = self
            .expand(start)?
            .into_iter()
            .rev()
            .map(|c| (c, 1))
            .collect();

        while let Some((id, depth)) = stack.pop() {
            let node = NodeRef { file: self, id };
            f(&node, depth)?;
            if max_depth.is_some_and(|m| depth >= m) {
                continue;
            }
            if node.kind() == NodeKind::Group {
                for child in self.expand(id)?.into_iter().rev() {
                    stack.push((child, depth + 1));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arena internals
    // ------------------------------------------------------------------

    fn lookup(&self, path: &str) -> Result<Option<NodeId>> {
        let mut current = NodeId::ROOT;
        for segment in path_segments(path) {
            if self.nodes.read()[current.0].handle.kind != NodeKind::Group {
                return Ok(None);
            }
            let children = self.expand(current)?;
            let nodes = self.nodes.read();
            match children.into_iter().find(|c| nodes[c.0].name == segment) {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn resolve(&self, path: &str) -> Result<NodeId> {
        self.lookup(path)?
            .ok_or_else(|| Error::NodeNotFound(path.to_string()))
    }

    fn expand(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let handle = {
            let nodes = self.nodes.read();
            let rec = &nodes[id.0];
            if let Some(children) = &rec.children {
                return Ok(children.clone());
            }
            if rec.handle.kind == NodeKind::Array {
                return Ok(Vec::new());
            }
            rec.handle
        };

        let entries = self.backend.children(&handle)?;

        let mut nodes = self.nodes.write();
        if let Some(children) = &nodes[id.0].children {
            return Ok(children.clone());
        }
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            let child = NodeId(nodes.len());
            let mut rec = NodeRecord::new(entry.name, Some(id), entry.handle);
            rec.info = entry.info;
            rec.attributes = entry.attributes.map(Arc::new);
            nodes.push(rec);
            ids.push(child);
        }
        nodes[id.0].children = Some(ids.clone());
        Ok(ids)
    }

    fn attributes_of(&self, id: NodeId) -> Result<Arc<Attributes>> {
        let handle = {
            let nodes = self.nodes.read();
            if let Some(attrs) = &nodes[id.0].attributes {
                return Ok(Arc::clone(attrs));
            }
            nodes[id.0].handle
        };
        let attrs = Arc::new(self.backend.attributes(&handle)?);
        self.nodes.write()[id.0].attributes = Some(Arc::clone(&attrs));
        Ok(attrs)
    }

    fn info_of(&self, id: NodeId) -> Result<ArrayInfo> {
        let handle = {
            let nodes = self.nodes.read();
            let rec = &nodes[id.0];
            if rec.handle.kind != NodeKind::Array {
                return Err(Error::mismatch("array", rec.handle.kind.to_string()));
            }
            if let Some(info) = &rec.info {
                return Ok(info.clone());
            }
            rec.handle
        };
        let info = self.backend.array_info(&handle)?;
        self.nodes.write()[id.0].info = Some(info.clone());
        Ok(info)
    }

    fn payload_of(&self, id: NodeId) -> Result<Arc<ArrayData>> {
        if let Some(payload) = &self.nodes.read()[id.0].payload {
            return Ok(Arc::clone(payload));
        }
        let info = self.info_of(id)?;
        let handle = self.nodes.read()[id.0].handle;
        let data = Arc::new(self.backend.read_array(&handle, &info)?);
        self.nodes.write()[id.0].payload = Some(Arc::clone(&data));
        Ok(data)
    }

    fn path_of(&self, id: NodeId) -> String {
        let nodes = self.nodes.read();
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let rec = &nodes[c.0];
            if rec.parent.is_some() {
                parts.push(rec.name.clone());
            }
            current = rec.parent;
        }
        parts.reverse();
        parts.join("/")
    }
}

/// Borrowed handle to one node of a [`HierarchicalFile`].
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    file: &'a HierarchicalFile,
    id: NodeId,
}

impl<'a> NodeRef<'a> {
    /// Arena index of this node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Node name (empty for the root).
    pub fn name(&self) -> String {
        self.file.nodes.read()[self.id.0].name.clone()
    }

    /// Full path from the root.
    pub fn path(&self) -> String {
        self.file.path_of(self.id)
    }

    /// Group or array.
    pub fn kind(&self) -> NodeKind {
        self.file.nodes.read()[self.id.0].handle.kind
    }

    /// Parent node, `None` for the root.
    pub fn parent(&self) -> Option<NodeRef<'a>> {
        let parent = self.file.nodes.read()[self.id.0].parent?;
        Some(NodeRef {
            file: self.file,
            id: parent,
        })
    }

    /// Child nodes, resolved on first call.
    pub fn children(&self) -> Result<Vec<NodeRef<'a>>> {
        Ok(self
            .file
            .expand(self.id)?
            .into_iter()
            .map(|id| NodeRef { file: self.file, id })
            .collect())
    }

    /// Child by name.
    pub fn child(&self, name: &str) -> Result<Option<NodeRef<'a>>> {
        for child in self.children()? {
            if child.name() == name {
                return Ok(Some(child));
            }
        }
        Ok(None)
    }

    /// Node attributes.
    pub fn attributes(&self) -> Result<Arc<Attributes>> {
        self.file.attributes_of(self.id)
    }

    /// Array dtype and shape.
    pub fn array_info(&self) -> Result<ArrayInfo> {
        self.file.info_of(self.id)
    }

    /// Array payload.
    pub fn array(&self) -> Result<Arc<ArrayData>> {
        self.file.payload_of(self.id)
    }
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("path", &self.path())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ArrayValues;
    use parking_lot::Mutex;
    use smallvec::smallvec;

    /// Tiny fixed tree: / -> {a: group -> {x: array}, y: array}
    struct FakeBackend {
        reads: Arc<Mutex<u32>>,
        listings: Arc<Mutex<u32>>,
    }

    impl ContainerBackend for FakeBackend {
        fn format_name(&self) -> &'static str {
            "fake"
        }

        fn root(&self) -> Result<NodeHandle> {
            Ok(NodeHandle::group(0))
        }

        fn children(&self, group: &NodeHandle) -> Result<Vec<ChildEntry>> {
            *self.listings.lock() += 1;
            let entry = |name: &str, handle| ChildEntry {
                name: name.to_string(),
                handle,
                info: None,
                attributes: None,
            };
            Ok(match group.token {
                0 => vec![entry("a", NodeHandle::group(1)), entry("y", NodeHandle::array(3))],
                1 => vec![entry("x", NodeHandle::array(2))],
                _ => return Err(Error::malformed("no such group")),
            })
        }

        fn attributes(&self, node: &NodeHandle) -> Result<Attributes> {
            Attributes::from_value(serde_json::json!({ "token": node.token }))
        }

        fn array_info(&self, _node: &NodeHandle) -> Result<ArrayInfo> {
            Ok(ArrayInfo {
                dtype: DataType::FLOAT64,
                shape: smallvec![2],
                codec: None,
            })
        }

        fn read_array(&self, node: &NodeHandle, info: &ArrayInfo) -> Result<ArrayData> {
            *self.reads.lock() += 1;
            let v = node.token as f64;
            ArrayData::new(info.dtype, info.shape.clone(), ArrayValues::Float(vec![v, v]))
        }
    }

    fn file() -> (HierarchicalFile, Arc<Mutex<u32>>, Arc<Mutex<u32>>) {
        let reads = Arc::new(Mutex::new(0));
        let listings = Arc::new(Mutex::new(0));
        let backend = FakeBackend {
            reads: Arc::clone(&reads),
            listings: Arc::clone(&listings),
        };
        (HierarchicalFile::new(Box::new(backend)).unwrap(), reads, listings)
    }

    #[test]
    fn test_lazy_navigation() {
        let (file, _, listings) = file();
        assert_eq!(file.loaded_nodes(), 1);
        assert_eq!(*listings.lock(), 0);

        let children = file.list_children("/").unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].path, "a");
        assert_eq!(children[1].kind, NodeKind::Array);
        assert_eq!(file.loaded_nodes(), 3);

        assert_eq!(file.list_children("a").unwrap()[0].path, "a/x");
        // Already expanded groups are not listed again
        file.list_children("a").unwrap();
        assert_eq!(*listings.lock(), 2);
    }

    #[test]
    fn test_payload_materialized_once() {
        let (file, reads, _) = file();
        assert!(!file.is_materialized("a/x").unwrap());
        let first = file.array("a/x").unwrap();
        let second = file.array("/a/x/").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_f64_slice().unwrap(), &[2.0, 2.0]);
        assert_eq!(*reads.lock(), 1);
        assert!(file.is_materialized("a/x").unwrap());
    }

    #[test]
    fn test_missing_paths() {
        let (file, _, _) = file();
        assert!(file.exists("a/x").unwrap());
        assert!(!file.exists("a/zzz").unwrap());
        assert!(!file.exists("y/below-an-array").unwrap());
        assert!(matches!(file.node("nope"), Err(Error::NodeNotFound(_))));
    }

    #[test]
    fn test_group_payload_is_type_mismatch() {
        let (file, _, _) = file();
        assert!(matches!(file.array("a"), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_node_ref_navigation() {
        let (file, _, _) = file();
        let x = file.node("a/x").unwrap();
        assert_eq!(x.name(), "x");
        assert_eq!(x.path(), "a/x");
        let parent = x.parent().unwrap();
        assert_eq!(parent.path(), "a");
        assert_eq!(parent.parent().unwrap().path(), "");
        assert!(file.root().parent().is_none());
        assert_eq!(x.attributes().unwrap().get_f64("token"), Some(2.0));
        assert!(file.root().child("y").unwrap().is_some());
    }

    #[test]
    fn test_walk() {
        let (file, _, _) = file();
        let mut seen = Vec::new();
        file.walk("", None, |node, depth| {
            seen.push((node.path(), depth));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![("a".to_string(), 1), ("a/x".to_string(), 2), ("y".to_string(), 1)]
        );

        let mut shallow = 0;
        file.walk("", Some(1), |_, _| {
            shallow += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(shallow, 2);
    }
}
