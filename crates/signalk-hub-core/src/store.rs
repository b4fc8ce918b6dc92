//! The canonical Signal K model.
//!
//! [`SignalKModel`] holds the full tree of every vessel the hub knows about.
//! Nodes live in an arena and refer to each other by [`NodeId`]; a node id
//! carries a generation so ids of deleted nodes stop resolving once their slot
//! is recycled.
//!
//! The model itself is not synchronised. The server wraps the single instance
//! in one lock and performs each mutating operation under it.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::warn;

use crate::model::{Leaf, VALUE, VESSELS};
use crate::path::{ends_with_segments, is_private_segment, Path, PathResolver};

/// Stable handle to a node in a [`SignalKModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// What a node holds.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Named children, iterated in insertion order.
    Object(IndexMap<String, NodeId>),
    /// Positional children.
    Array(Vec<NodeId>),
    /// A value with provenance.
    Leaf(Leaf),
}

#[derive(Debug, Clone)]
struct Entry {
    parent: Option<NodeId>,
    kind: NodeKind,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// How an incoming JSON value is merged.
enum Incoming<'a> {
    Leaf(Leaf),
    Branch(&'a Map<String, Value>),
    Array(&'a [Value]),
}

/// The canonical, path-addressed model.
#[derive(Debug, Clone)]
pub struct SignalKModel {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
    resolver: PathResolver,
}

impl SignalKModel {
    /// Create a model for the given local vessel.
    ///
    /// The id may be given bare ("urn:mrn:signalk:uuid:...") or as a full
    /// context ("vessels.urn:..."). The self vessel branch is created empty.
    pub fn new(self_id: &str) -> Self {
        let mut model = Self::empty(PathResolver::new(self_id));
        let context = model.resolver.self_context();
        model.add_path(&context);
        model
    }

    fn empty(resolver: PathResolver) -> Self {
        let mut model = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
            resolver,
        };
        model.root = model.alloc(None, NodeKind::Object(IndexMap::new()));
        model
    }

    // ========================================================================
    // Arena plumbing
    // ========================================================================

    fn alloc(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let entry = Some(Entry { parent, kind });
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = entry;
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    entry,
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn entry(&self, id: NodeId) -> Option<&Entry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, id: NodeId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// Release a node and all of its descendants.
    fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(slot) = self.slots.get_mut(id.index as usize) else {
                continue;
            };
            if slot.generation != id.generation {
                continue;
            }
            if let Some(entry) = slot.entry.take() {
                match entry.kind {
                    NodeKind::Object(children) => stack.extend(children.into_values()),
                    NodeKind::Array(children) => stack.extend(children),
                    NodeKind::Leaf(_) => {}
                }
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
    }

    /// Turn `id` into an object node, discarding whatever it held if it was
    /// a leaf or an array.
    fn make_object(&mut self, id: NodeId) {
        let previous = match self.entry_mut(id) {
            Some(entry) if matches!(entry.kind, NodeKind::Object(_)) => return,
            Some(entry) => std::mem::replace(&mut entry.kind, NodeKind::Object(IndexMap::new())),
            None => return,
        };
        if let NodeKind::Array(children) = previous {
            for child in children {
                self.free_subtree(child);
            }
        }
    }

    /// Put `node` under `parent` at `key`, releasing any node it replaces.
    /// The key keeps its position among its siblings.
    fn attach(&mut self, parent: NodeId, key: &str, node: NodeId) {
        let replaced = match self.entry_mut(parent) {
            Some(Entry {
                kind: NodeKind::Object(children),
                ..
            }) => children.insert(key.to_string(), node),
            _ => None,
        };
        if let Some(old) = replaced.filter(|old| *old != node) {
            self.free_subtree(old);
        }
        if let Some(entry) = self.entry_mut(node) {
            entry.parent = Some(parent);
        }
    }

    /// Child `key` of `parent` as an object, created or converted as needed.
    fn ensure_object_child(&mut self, parent: NodeId, key: &str) -> NodeId {
        self.make_object(parent);
        if let Some(child) = self.child(parent, key) {
            self.make_object(child);
            return child;
        }
        let child = self.alloc(Some(parent), NodeKind::Object(IndexMap::new()));
        self.attach(parent, key, child);
        child
    }

    /// Write a leaf as child `key` of `parent`. An existing leaf is
    /// overwritten in place, any other node is replaced.
    fn set_leaf(&mut self, parent: NodeId, key: &str, leaf: Leaf) -> NodeId {
        self.make_object(parent);
        if let Some(child) = self.child(parent, key) {
            if let Some(Entry {
                kind: NodeKind::Leaf(existing),
                ..
            }) = self.entry_mut(child)
            {
                *existing = leaf;
                return child;
            }
        }
        let child = self.alloc(Some(parent), NodeKind::Leaf(leaf));
        self.attach(parent, key, child);
        child
    }

    // ========================================================================
    // Navigation
    // ========================================================================

    /// The root object node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The resolver holding this model's `self` alias.
    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// The local vessel id.
    pub fn self_id(&self) -> &str {
        self.resolver.self_id()
    }

    /// The local vessel branch, if present.
    pub fn self_node(&self) -> Option<NodeId> {
        self.node_at(&self.resolver.self_context())
    }

    /// Whether `id` still refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.entry(id).is_some()
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.entry(id).map(|e| &e.kind)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.entry(id).and_then(|e| e.parent)
    }

    /// The leaf stored at `id`, if it is a leaf.
    pub fn leaf(&self, id: NodeId) -> Option<&Leaf> {
        match self.kind(id)? {
            NodeKind::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Direct child of `id`. Array children are addressed by index.
    pub fn child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match self.kind(id)? {
            NodeKind::Object(children) => children.get(key).copied(),
            NodeKind::Array(children) => key.parse::<usize>().ok().and_then(|i| children.get(i).copied()),
            NodeKind::Leaf(_) => None,
        }
    }

    /// Walk relative segments from `from` without resolving aliases.
    fn walk<S: AsRef<str>>(&self, from: NodeId, segments: &[S]) -> Option<NodeId> {
        let mut current = from;
        if !self.contains(current) {
            return None;
        }
        for segment in segments {
            current = self.child(current, segment.as_ref())?;
        }
        Some(current)
    }

    /// Look up a node by absolute path given as segments, each of which may
    /// itself be dotted: `at_path(&["vessels", "self", "environment.wind"])`.
    pub fn at_path(&self, segments: &[&str]) -> Option<NodeId> {
        let path = self.resolver.resolve_segments(segments);
        self.walk(self.root, path.segments())
    }

    /// Look up a node by absolute dotted path.
    pub fn node_at(&self, path: &str) -> Option<NodeId> {
        let path = self.resolver.resolve(path);
        self.walk(self.root, path.segments())
    }

    /// Look up a node by path relative to `under`. The `self` alias is only
    /// applied when `under` is the root.
    pub fn find_node(&self, under: NodeId, path: &str) -> Option<NodeId> {
        let path = if under == self.root {
            self.resolver.resolve(path)
        } else {
            Path::new(path)
        };
        self.walk(under, path.segments())
    }

    /// Absolute segments of `id`, root excluded.
    pub fn path_of(&self, id: NodeId) -> Option<Vec<String>> {
        let mut segments = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            let key = match self.kind(parent)? {
                NodeKind::Object(children) => children
                    .iter()
                    .find(|(_, child)| **child == current)
                    .map(|(k, _)| k.clone())?,
                NodeKind::Array(children) => children.iter().position(|c| *c == current)?.to_string(),
                NodeKind::Leaf(_) => return None,
            };
            segments.push(key);
            current = parent;
        }
        if current != self.root {
            return None;
        }
        segments.reverse();
        Some(segments)
    }

    /// Depth-first search under `under` for the first leaf whose trailing
    /// segments equal `key` ("directionTrue" or "wind.directionTrue").
    ///
    /// Children are visited in insertion order, so the result is
    /// deterministic when several leaves share the key.
    pub fn find_leaf(&self, under: NodeId, key: &str) -> Option<&Leaf> {
        let wanted = Path::new(key);
        if wanted.is_empty() {
            return None;
        }
        let mut trail = self.path_of(under)?;
        self.find_leaf_from(under, wanted.segments(), &mut trail)
    }

    /// The value of [`find_leaf`](Self::find_leaf).
    pub fn find_value(&self, under: NodeId, key: &str) -> Option<&Value> {
        self.find_leaf(under, key).map(|leaf| &leaf.value)
    }

    fn find_leaf_from(&self, id: NodeId, wanted: &[String], trail: &mut Vec<String>) -> Option<&Leaf> {
        match self.kind(id)? {
            NodeKind::Leaf(leaf) => ends_with_segments(trail.as_slice(), wanted).then_some(leaf),
            NodeKind::Object(children) => {
                for (key, child) in children {
                    trail.push(key.clone());
                    let found = self.find_leaf_from(*child, wanted, trail);
                    trail.pop();
                    if found.is_some() {
                        return found;
                    }
                }
                None
            }
            NodeKind::Array(children) => {
                for (i, child) in children.iter().enumerate() {
                    trail.push(i.to_string());
                    let found = self.find_leaf_from(*child, wanted, trail);
                    trail.pop();
                    if found.is_some() {
                        return found;
                    }
                }
                None
            }
        }
    }

    /// All leaves under `under`, with dotted paths relative to it, in
    /// depth-first insertion order.
    pub fn leaves(&self, under: NodeId) -> Vec<(String, &Leaf)> {
        let mut out = Vec::new();
        let mut trail = Vec::new();
        self.collect_leaves(under, &mut trail, &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, id: NodeId, trail: &mut Vec<String>, out: &mut Vec<(String, &'a Leaf)>) {
        match self.kind(id) {
            Some(NodeKind::Leaf(leaf)) => out.push((trail.join("."), leaf)),
            Some(NodeKind::Object(children)) => {
                for (key, child) in children {
                    trail.push(key.clone());
                    self.collect_leaves(*child, trail, out);
                    trail.pop();
                }
            }
            Some(NodeKind::Array(children)) => {
                for (i, child) in children.iter().enumerate() {
                    trail.push(i.to_string());
                    self.collect_leaves(*child, trail, out);
                    trail.pop();
                }
            }
            None => {}
        }
    }

    /// Number of leaves in the whole model.
    pub fn leaf_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.entry, Some(Entry { kind: NodeKind::Leaf(_), .. })))
            .count()
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Descend from `from` along `path`, creating missing object nodes, and
    /// return the node at the end. Idempotent. Returns `None` only when
    /// `from` is not a live node.
    ///
    /// Any leaf met on the way is replaced by an object (last writer wins).
    pub fn add_node(&mut self, from: NodeId, path: &str) -> Option<NodeId> {
        if !self.contains(from) {
            return None;
        }
        let path = if from == self.root {
            self.resolver.resolve(path)
        } else {
            Path::new(path)
        };
        let mut current = from;
        if !path.is_empty() {
            self.make_object(current);
        }
        for segment in path.segments() {
            current = self.ensure_object_child(current, segment);
        }
        Some(current)
    }

    /// [`add_node`](Self::add_node) from the root.
    pub fn add_path(&mut self, path: &str) -> NodeId {
        let root = self.root;
        self.add_node(root, path).unwrap_or(root)
    }

    /// Write (or overwrite) leaf child `key` of `node` with value and
    /// provenance. Returns the leaf's id, or `None` when `node` is not live.
    pub fn put_with(
        &mut self,
        node: NodeId,
        key: &str,
        value: Value,
        source: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<NodeId> {
        if !self.contains(node) {
            return None;
        }
        Some(self.set_leaf(node, key, Leaf::new(value, source, timestamp)))
    }

    /// Merge a whole document (one that already starts at `vessels`, or any
    /// other top-level key) into the model.
    ///
    /// Vessel keys equal to `self` are aliased to the local vessel id.
    pub fn merge(&mut self, document: &Value) {
        let Value::Object(top) = document else {
            warn!("Ignoring non-object document");
            return;
        };
        let root = self.root;
        for (key, incoming) in top {
            match (key.as_str(), incoming) {
                (VESSELS, Value::Object(vessels)) => {
                    let vessels_node = self.ensure_object_child(root, VESSELS);
                    for (id, branch) in vessels {
                        let id = self.resolver.resolve_context_id(id).to_string();
                        self.merge_child(vessels_node, &id, branch);
                    }
                }
                _ => self.merge_child(root, key, incoming),
            }
        }
    }

    /// Merge `incoming` into child `key` of the node at `path`, creating the
    /// parent chain when missing.
    pub fn merge_at_path(&mut self, path: &str, key: &str, incoming: &Value) {
        let parent = self.add_path(path);
        self.merge_child(parent, key, incoming);
    }

    /// Merge `incoming` at `path`; the last segment is the key.
    pub fn merge_at_full_path(&mut self, path: &str, incoming: &Value) {
        let resolved = self.resolver.resolve(path);
        match resolved.last() {
            Some(key) => {
                let key = key.to_string();
                let parent = self.add_path(resolved.parent().as_str());
                self.merge_child(parent, &key, incoming);
            }
            None => self.merge(incoming),
        }
    }

    /// The merge algorithm, applied to child `key` of object `parent`.
    ///
    /// - object onto object: recurse
    /// - leaf onto leaf: value, timestamp and source overwritten
    /// - shapes differ: the incoming side replaces the existing node
    /// - arrays: replaced wholesale
    fn merge_child(&mut self, parent: NodeId, key: &str, incoming: &Value) {
        match classify(incoming) {
            Ok(Incoming::Leaf(leaf)) => {
                self.set_leaf(parent, key, leaf);
            }
            Ok(Incoming::Branch(map)) => {
                let child = self.ensure_object_child(parent, key);
                for (k, v) in map {
                    self.merge_child(child, k, v);
                }
            }
            Ok(Incoming::Array(items)) => {
                self.make_object(parent);
                let array = self.build_array(parent, items);
                self.attach(parent, key, array);
            }
            Err(e) => warn!("Skipping {}: {}", key, e),
        }
    }

    /// Build a detached array node (parent pointer set to `parent`).
    fn build_array(&mut self, parent: NodeId, items: &[Value]) -> NodeId {
        let array = self.alloc(Some(parent), NodeKind::Array(Vec::new()));
        let mut children = Vec::with_capacity(items.len());
        for item in items {
            let child = match classify(item) {
                Ok(Incoming::Leaf(leaf)) => self.alloc(Some(array), NodeKind::Leaf(leaf)),
                Ok(Incoming::Array(inner)) => self.build_array(array, inner),
                Ok(Incoming::Branch(map)) => {
                    let object = self.alloc(Some(array), NodeKind::Object(IndexMap::new()));
                    for (k, v) in map {
                        self.merge_child(object, k, v);
                    }
                    object
                }
                Err(e) => {
                    warn!("Skipping array element: {}", e);
                    continue;
                }
            };
            children.push(child);
        }
        if let Some(entry) = self.entry_mut(array) {
            entry.kind = NodeKind::Array(children);
        }
        array
    }

    /// Remove child `key` of `node` and all its descendants. Returns whether
    /// anything was removed; a missing key is not an error.
    pub fn delete(&mut self, node: NodeId, key: &str) -> bool {
        let removed = match self.entry_mut(node) {
            Some(Entry {
                kind: NodeKind::Object(children),
                ..
            }) => children.shift_remove(key),
            _ => None,
        };
        match removed {
            Some(child) => {
                self.free_subtree(child);
                true
            }
            None => false,
        }
    }

    /// [`delete`](Self::delete) addressed by the parent's absolute path.
    pub fn delete_at_path(&mut self, path: &str, key: &str) -> bool {
        match self.node_at(path) {
            Some(node) => self.delete(node, key),
            None => false,
        }
    }

    // ========================================================================
    // Copies and rendering
    // ========================================================================

    /// Full deep copy, compacted into a fresh arena.
    pub fn duplicate(&self) -> SignalKModel {
        self.project(self.root, false)
    }

    /// Deep copy with every private (`_` prefixed) segment removed,
    /// recursively.
    pub fn safe(&self) -> SignalKModel {
        self.project(self.root, true)
    }

    /// Safe copy of the subtree at `node`, which becomes the copy's root.
    pub fn safe_subtree(&self, node: NodeId) -> SignalKModel {
        self.project(node, true)
    }

    fn project(&self, from: NodeId, skip_private: bool) -> SignalKModel {
        let mut copy = SignalKModel {
            slots: Vec::with_capacity(self.node_count()),
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
            resolver: self.resolver.clone(),
        };
        copy.root = match self.kind(from) {
            Some(_) => self.copy_node(from, &mut copy, None, skip_private),
            None => copy.alloc(None, NodeKind::Object(IndexMap::new())),
        };
        copy
    }

    fn copy_node(&self, id: NodeId, dst: &mut SignalKModel, parent: Option<NodeId>, skip_private: bool) -> NodeId {
        match self.kind(id) {
            Some(NodeKind::Leaf(leaf)) => dst.alloc(parent, NodeKind::Leaf(leaf.clone())),
            Some(NodeKind::Object(children)) => {
                let node = dst.alloc(parent, NodeKind::Object(IndexMap::new()));
                let mut copied = IndexMap::with_capacity(children.len());
                for (key, child) in children {
                    if skip_private && is_private_segment(key) {
                        continue;
                    }
                    copied.insert(key.clone(), self.copy_node(*child, dst, Some(node), skip_private));
                }
                if let Some(entry) = dst.entry_mut(node) {
                    entry.kind = NodeKind::Object(copied);
                }
                node
            }
            Some(NodeKind::Array(children)) => {
                let node = dst.alloc(parent, NodeKind::Array(Vec::new()));
                let copied: Vec<NodeId> = children
                    .iter()
                    .map(|child| self.copy_node(*child, dst, Some(node), skip_private))
                    .collect();
                if let Some(entry) = dst.entry_mut(node) {
                    entry.kind = NodeKind::Array(copied);
                }
                node
            }
            None => dst.alloc(parent, NodeKind::Object(IndexMap::new())),
        }
    }

    /// Render the subtree at `id` as JSON. Leaves use the outbound leaf shape.
    pub fn to_json(&self, id: NodeId) -> Value {
        match self.kind(id) {
            Some(NodeKind::Leaf(leaf)) => leaf.to_json(),
            Some(NodeKind::Object(children)) => Value::Object(
                children
                    .iter()
                    .map(|(k, child)| (k.clone(), self.to_json(*child)))
                    .collect(),
            ),
            Some(NodeKind::Array(children)) => {
                Value::Array(children.iter().map(|child| self.to_json(*child)).collect())
            }
            None => Value::Null,
        }
    }

    /// The whole model as a JSON document.
    pub fn document(&self) -> Value {
        self.to_json(self.root)
    }
}

/// Decide how a JSON value enters the model: objects carrying `value` are
/// leaves, other objects are branches, bare scalars are provenance-free
/// leaves.
fn classify(incoming: &Value) -> Result<Incoming<'_>, crate::model::LeafError> {
    match incoming {
        Value::Object(map) if map.contains_key(VALUE) => Leaf::from_json(map).map(Incoming::Leaf),
        Value::Object(map) => Ok(Incoming::Branch(map)),
        Value::Array(items) => Ok(Incoming::Array(items)),
        scalar => Ok(Incoming::Leaf(Leaf::bare(scalar.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{format_timestamp, parse_timestamp};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SELF_URN: &str = "urn:mrn:signalk:uuid:test-vessel";

    fn sample_document() -> Value {
        json!({
            "vessels": {
                "self": {
                    "navigation": {
                        "courseOverGroundTrue": {"value": 11.96},
                        "courseOverGroundMagnetic": {"value": 93.0},
                        "headingMagnetic": {"value": 0.0},
                        "position": {
                            "latitude": {"value": -41.29},
                            "longitude": {"value": 173.24}
                        }
                    },
                    "environment": {
                        "wind": {
                            "speedTrue": {"value": 7.68},
                            "directionTrue": {"value": 256.3}
                        }
                    }
                }
            }
        })
    }

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_timestamp(raw).unwrap()
    }

    #[test]
    fn test_new_model() {
        let model = SignalKModel::new(&format!("vessels.{SELF_URN}"));
        assert_eq!(model.self_id(), SELF_URN);
        assert!(model.self_node().is_some());
        assert_eq!(model.document(), json!({"vessels": {SELF_URN: {}}}));
    }

    #[test]
    fn test_merge_and_find_values() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());

        let self_node = model.self_node().unwrap();
        assert_eq!(
            model.find_value(self_node, "navigation.courseOverGroundMagnetic"),
            Some(&json!(93.0))
        );
        assert_eq!(model.find_value(self_node, "position.latitude"), Some(&json!(-41.29)));
        assert_eq!(model.find_value(self_node, "speedTrue"), Some(&json!(7.68)));
        assert_eq!(model.find_value(self_node, "nothingHere"), None);
    }

    #[test]
    fn test_at_path_returns_branch() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());

        let wind = model.at_path(&["vessels", "self", "environment.wind"]).unwrap();
        assert_eq!(
            model.to_json(wind),
            json!({"speedTrue": {"value": 7.68}, "directionTrue": {"value": 256.3}})
        );
        assert_eq!(model.at_path(&["vessels", "self", "environment.current"]), None);
    }

    #[test]
    fn test_self_is_never_stored_literally() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());

        let vessels = model.node_at("vessels").unwrap();
        assert_eq!(model.child(vessels, "self"), None);
        assert!(model.child(vessels, SELF_URN).is_some());
        assert_eq!(
            model.node_at("vessels.self.navigation"),
            model.node_at(&format!("vessels.{SELF_URN}.navigation"))
        );
    }

    #[test]
    fn test_find_value_first_match_in_insertion_order() {
        let mut model = SignalKModel::new(SELF_URN);
        let root = model.root();
        let t = ts("2024-01-17T10:00:00Z");
        let zebra = model.add_path("vessels.self.zebra");
        let alpha = model.add_path("vessels.self.alpha");
        model.put_with(zebra, "depth", json!(1), "a", t).unwrap();
        model.put_with(alpha, "depth", json!(2), "b", t).unwrap();

        // zebra was inserted first, so it wins despite sorting after alpha
        assert_eq!(model.find_value(root, "depth"), Some(&json!(1)));
        assert_eq!(model.find_value(root, "alpha.depth"), Some(&json!(2)));
        for _ in 0..10 {
            assert_eq!(model.find_value(root, "depth"), Some(&json!(1)));
        }
    }

    #[test]
    fn test_document_merge_keeps_document_order() {
        let mut model = SignalKModel::new(SELF_URN);
        let root = model.root();
        model.merge(&json!({"vessels": {"self": {
            "zeta": {"depth": {"value": 1}},
            "alpha": {"depth": {"value": 2}}
        }}}));

        assert_eq!(model.find_value(root, "depth"), Some(&json!(1)));
        let vessel = model.self_node().unwrap();
        let keys: Vec<String> = model.leaves(vessel).into_iter().map(|(path, _)| path).collect();
        assert_eq!(keys, vec!["zeta.depth", "alpha.depth"]);

        let doc = model.document();
        let order: Vec<&String> = doc["vessels"][SELF_URN].as_object().unwrap().keys().collect();
        assert_eq!(order, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut model = SignalKModel::new(SELF_URN);
        let a = model.add_path("vessels.self.propulsion.mainEngine");
        let count = model.node_count();
        let b = model.add_path("vessels.self.propulsion.mainEngine");
        assert_eq!(a, b);
        assert_eq!(model.node_count(), count);
    }

    #[test]
    fn test_add_node_relative() {
        let mut model = SignalKModel::new(SELF_URN);
        let nav = model.add_path("vessels.self.navigation");
        let pos = model.add_node(nav, "position").unwrap();
        assert_eq!(model.node_at("vessels.self.navigation.position"), Some(pos));
        assert_eq!(model.parent(pos), Some(nav));
    }

    #[test]
    fn test_put_with_sets_value_and_provenance() {
        let mut model = SignalKModel::new(SELF_URN);
        let nav = model.add_path("vessels.self.navigation");
        let t = ts("2014-08-15T16:00:00.081+00:00");
        let leaf_id = model.put_with(nav, "speedOverGround", json!(3.85), "gps", t).unwrap();

        let leaf = model.leaf(leaf_id).unwrap();
        assert_eq!(leaf.value, json!(3.85));
        assert_eq!(leaf.source.as_deref(), Some("gps"));
        assert_eq!(format_timestamp(leaf.timestamp.as_ref().unwrap()), "2014-08-15T16:00:00.081Z");

        // overwrite keeps the same node
        let t2 = ts("2014-08-15T16:00:01.000+00:00");
        let again = model.put_with(nav, "speedOverGround", json!(4.0), "log", t2).unwrap();
        assert_eq!(again, leaf_id);
        assert_eq!(model.leaf(again).unwrap().source.as_deref(), Some("log"));
    }

    #[test]
    fn test_merge_at_path_with_key() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&json!({"vessels": {"self": {"navigation": {"headingTrue": {"value": 1.0}}}}}));
        assert_eq!(model.at_path(&["vessels", "self", "environment.wind"]), None);

        let wind = json!({"speedAlarm": {"value": 0.0}, "directionTrue": {"value": 256.3}});
        model.merge_at_path("vessels.self.environment", "wind", &wind);

        assert!(model.at_path(&["vessels", "self", "environment.wind"]).is_some());
        let self_node = model.self_node().unwrap();
        assert_eq!(model.find_value(self_node, "wind.directionTrue"), Some(&json!(256.3)));
    }

    #[test]
    fn test_merge_at_full_path_creates_chain() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge_at_full_path(
            "vessels.self.propulsion.mainEngine.oilTemperature",
            &json!({"value": 85.5}),
        );

        for path in [
            "vessels.self.propulsion",
            "vessels.self.propulsion.mainEngine",
            "vessels.self.propulsion.mainEngine.oilTemperature",
        ] {
            assert!(model.node_at(path).is_some(), "missing {path}");
        }
        let leaf = model.node_at("vessels.self.propulsion.mainEngine.oilTemperature").unwrap();
        assert_eq!(model.leaf(leaf).unwrap().value, json!(85.5));
    }

    #[test]
    fn test_merge_is_additive() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());
        model.merge(&json!({"vessels": {"self": {"navigation": {"speedOverGround": {"value": 3.1}}}}}));

        let self_node = model.self_node().unwrap();
        assert_eq!(model.find_value(self_node, "courseOverGroundTrue"), Some(&json!(11.96)));
        assert_eq!(model.find_value(self_node, "speedOverGround"), Some(&json!(3.1)));
        assert_eq!(model.find_value(self_node, "wind.speedTrue"), Some(&json!(7.68)));
    }

    #[test]
    fn test_merge_idempotent() {
        let mut model = SignalKModel::new(SELF_URN);
        let doc = json!({"vessels": {"self": {"navigation": {
            "speedOverGround": {"value": 3.85, "timestamp": "2024-01-17T10:00:00.000Z", "source": "gps"}
        }}}});
        model.merge(&doc);
        let once = model.document();
        let nodes = model.node_count();

        model.merge(&doc);
        assert_eq!(model.document(), once);
        assert_eq!(model.node_count(), nodes);
    }

    #[test]
    fn test_merge_shape_mismatch_last_writer_wins() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&json!({"vessels": {"self": {"design": {"value": 12}}}}));
        model.merge(&json!({"vessels": {"self": {"design": {"length": {"value": 12.2}}}}}));

        let design = model.node_at("vessels.self.design").unwrap();
        assert!(matches!(model.kind(design), Some(NodeKind::Object(_))));
        assert_eq!(model.to_json(design), json!({"length": {"value": 12.2}}));

        model.merge(&json!({"vessels": {"self": {"design": {"value": "sloop"}}}}));
        let design = model.node_at("vessels.self.design").unwrap();
        assert_eq!(model.leaf(design).unwrap().value, json!("sloop"));
        assert_eq!(model.node_at("vessels.self.design.length"), None);
    }

    #[test]
    fn test_merge_skips_leaf_with_bad_timestamp() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&json!({"vessels": {"self": {"navigation": {
            "speedOverGround": {"value": 3.85, "timestamp": "not a time"},
            "headingTrue": {"value": 1.2, "timestamp": "2024-01-17T10:00:00Z"}
        }}}}));

        assert_eq!(model.node_at("vessels.self.navigation.speedOverGround"), None);
        assert!(model.node_at("vessels.self.navigation.headingTrue").is_some());
    }

    #[test]
    fn test_merge_arrays_replace_wholesale() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&json!({"vessels": {"self": {"crew": ["a", "b", "c"]}}}));
        model.merge(&json!({"vessels": {"self": {"crew": ["d"]}}}));

        let crew = model.node_at("vessels.self.crew").unwrap();
        assert_eq!(model.to_json(crew), json!([{"value": "d"}]));
        assert_eq!(model.leaf(model.child(crew, "0").unwrap()).unwrap().value, json!("d"));
        assert_eq!(model.child(crew, "1"), None);
    }

    #[test]
    fn test_delete_branch() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());
        let wind = model.at_path(&["vessels", "self", "environment.wind"]).unwrap();
        let speed = model.child(wind, "speedTrue").unwrap();

        let environment = model.at_path(&["vessels", "self", "environment"]).unwrap();
        assert!(model.delete(environment, "wind"));

        assert_eq!(model.at_path(&["vessels", "self", "environment.wind"]), None);
        assert!(!model.contains(wind));
        assert!(!model.contains(speed));
        // siblings untouched
        assert!(model.node_at("vessels.self.navigation.position.latitude").is_some());
    }

    #[test]
    fn test_delete_from_path_and_missing_key() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());

        assert!(model.delete_at_path("vessels.self.environment", "wind"));
        assert_eq!(model.node_at("vessels.self.environment.wind"), None);

        assert!(!model.delete_at_path("vessels.self.environment", "wind"));
        assert!(!model.delete_at_path("vessels.self.nowhere", "wind"));
    }

    #[test]
    fn test_deleted_ids_stay_dead_after_slot_reuse() {
        let mut model = SignalKModel::new(SELF_URN);
        let nav = model.add_path("vessels.self.navigation");
        let t = ts("2024-01-17T10:00:00Z");
        let old = model.put_with(nav, "speedOverGround", json!(1), "a", t).unwrap();
        model.delete(nav, "speedOverGround");

        let fresh = model.put_with(nav, "headingTrue", json!(2), "a", t).unwrap();
        assert_eq!(fresh.index, old.index);
        assert!(!model.contains(old));
        assert_eq!(model.leaf(old), None);
        assert_eq!(model.leaf(fresh).unwrap().value, json!(2));
    }

    #[test]
    fn test_safe_removes_private_segments() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());
        let wind = json!({"directionTrue": {"value": 256.3}});
        model.merge_at_path("vessels.self.navigation", "_arduino", &wind);
        model.merge(&json!({"_config": {"secret": "x"}}));

        assert!(model.at_path(&["vessels", "self", "navigation._arduino"]).is_some());

        let safe = model.duplicate().safe();
        let safe_root = safe.root();
        assert_eq!(safe.find_node(safe_root, "vessels.self.navigation._arduino"), None);
        assert_eq!(safe.find_node(safe_root, "_config"), None);
        assert!(safe.find_node(safe_root, "vessels.self.navigation.courseOverGroundTrue").is_some());

        // the live model still exposes them
        assert!(model.at_path(&["vessels", "self", "navigation._arduino"]).is_some());
        assert!(model.node_at("_config.secret").is_some());
    }

    #[test]
    fn test_duplicate_is_independent() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());
        let copy = model.duplicate();

        model.delete_at_path("vessels.self", "environment");
        assert_eq!(model.node_at("vessels.self.environment"), None);
        assert!(copy.node_at("vessels.self.environment.wind.speedTrue").is_some());
        assert_eq!(copy.leaf_count(), 7);
    }

    #[test]
    fn test_safe_subtree() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());
        model.merge_at_path("vessels.self.navigation", "_raw", &json!({"value": 1}));

        let nav = model.node_at("vessels.self.navigation").unwrap();
        let copy = model.safe_subtree(nav);
        let doc = copy.document();
        assert!(doc.get("_raw").is_none());
        assert_eq!(doc["courseOverGroundTrue"]["value"], json!(11.96));
    }

    #[test]
    fn test_leaves_relative_paths() {
        let mut model = SignalKModel::new(SELF_URN);
        model.merge(&sample_document());
        let self_node = model.self_node().unwrap();

        let paths: Vec<String> = model.leaves(self_node).into_iter().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec![
                "navigation.courseOverGroundTrue",
                "navigation.courseOverGroundMagnetic",
                "navigation.headingMagnetic",
                "navigation.position.latitude",
                "navigation.position.longitude",
                "environment.wind.speedTrue",
                "environment.wind.directionTrue",
            ]
        );
    }

    #[test]
    fn test_path_of() {
        let mut model = SignalKModel::new("motu");
        let id = model.add_path("vessels.self.navigation.position");
        assert_eq!(
            model.path_of(id).unwrap(),
            vec!["vessels", "motu", "navigation", "position"]
        );
        assert_eq!(model.path_of(model.root()).unwrap(), Vec::<String>::new());
    }
}
