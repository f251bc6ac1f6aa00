//! Index Tree
//!
//! An arena-allocated B+-tree ordered by `(segment, key)`.
//!
//! Nodes are addressed by [`NodeId`]; parents hold child ids and there are no
//! back-pointers. Operations that need the ancestors of a leaf record them on
//! a path stack while descending.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::storage::Location;

/// Index of a node inside the tree's arena
pub type NodeId = u32;

/// Composite index key: cache segment first, then key bytes
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexKey {
    pub segment: u32,
    pub key: Bytes,
}

impl IndexKey {
    pub fn new(segment: u32, key: Bytes) -> Self {
        Self { segment, key }
    }

    /// Smallest key of a segment
    pub fn segment_start(segment: u32) -> Self {
        Self {
            segment,
            key: Bytes::new(),
        }
    }
}

/// Where the newest record of a key lives, plus what the index needs to
/// answer without touching the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub location: Location,
    pub seq_id: u64,
    pub expiration: i64,
    pub tombstone: bool,
    /// Number of on-disk records of this key still present in the store
    pub records: u32,
}

impl IndexEntry {
    pub fn new(location: Location, seq_id: u64, expiration: i64, tombstone: bool) -> Self {
        Self {
            location,
            seq_id,
            expiration,
            tombstone,
            records: 1,
        }
    }
}

/// Outcome of inspecting the entry for a key in [`Tree::apply`]
#[derive(Debug)]
pub enum Change {
    Keep,
    Set(IndexEntry),
    Remove,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf {
        entries: Vec<(IndexKey, IndexEntry)>,
    },
    /// `children.len() == keys.len() + 1`; child `i` holds keys in
    /// `[keys[i - 1], keys[i])`
    Inner {
        keys: Vec<IndexKey>,
        children: Vec<NodeId>,
    },
    Free,
}

/// A single index tree
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: NodeId,
    /// Max entries (leaf) or keys (inner) before a node splits
    capacity: usize,
    len: usize,
    height: usize,
}

type Path = Vec<(NodeId, usize)>;

impl Tree {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![Node::Leaf {
                entries: Vec::new(),
            }],
            free: Vec::new(),
            root: 0,
            capacity,
            len: 0,
            height: 1,
        }
    }

    /// Rebuild a tree from nodes read back from disk
    pub(crate) fn from_parts(nodes: Vec<Node>, root: NodeId, capacity: usize) -> Self {
        let mut tree = Self {
            nodes,
            free: Vec::new(),
            root,
            capacity,
            len: 0,
            height: 1,
        };
        let mut id = root;
        let mut height = 1;
        while let Node::Inner { children, .. } = tree.node(id) {
            id = children[0];
            height += 1;
        }
        tree.height = height;
        tree.len = tree
            .nodes
            .iter()
            .map(|n| match n {
                Node::Leaf { entries } => entries.len(),
                _ => 0,
            })
            .sum();
        tree
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 1 for a lone leaf, +1 for every root split
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of allocated nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get(&self, key: &IndexKey) -> Option<&IndexEntry> {
        let (_, leaf) = self.find_leaf(key);
        let entries = self.leaf_entries(leaf);
        entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|pos| &entries[pos].1)
    }

    /// Entries of the first leaf that has anything at or after `bound`
    ///
    /// Returns the tail of that leaf starting at the first matching key.
    /// When the leaf the descent lands on has nothing left for `bound`, the
    /// search moves on to the following leaves instead of giving up, since
    /// the entries of a segment may continue in a structurally distant leaf.
    pub fn batch_from(&self, bound: &IndexKey, inclusive: bool) -> Vec<(IndexKey, IndexEntry)> {
        let (mut path, mut leaf) = self.find_leaf(bound);
        loop {
            let entries = self.leaf_entries(leaf);
            let start = if inclusive {
                entries.partition_point(|(k, _)| k < bound)
            } else {
                entries.partition_point(|(k, _)| k <= bound)
            };
            if start < entries.len() {
                return entries[start..].to_vec();
            }
            match self.next_leaf(&mut path) {
                Some(next) => leaf = next,
                None => return Vec::new(),
            }
        }
    }

    /// Visit every entry in key order
    pub fn for_each(&self, mut f: impl FnMut(&IndexKey, &IndexEntry)) {
        let mut path = Path::new();
        let mut leaf = self.leftmost_leaf(self.root, &mut path);
        loop {
            for (k, e) in self.leaf_entries(leaf) {
                f(k, e);
            }
            match self.next_leaf(&mut path) {
                Some(next) => leaf = next,
                None => return,
            }
        }
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Inspect the entry for `key` and apply the returned [`Change`]
    ///
    /// Returns the entry that was present before, and whether the tree was
    /// modified.
    pub fn apply(
        &mut self,
        key: IndexKey,
        decide: impl FnOnce(Option<&IndexEntry>) -> Change,
    ) -> (Option<IndexEntry>, bool) {
        let (path, leaf) = self.find_leaf(&key);
        let capacity = self.capacity;
        let Node::Leaf { entries } = &mut self.nodes[leaf as usize] else {
            unreachable!("descent ended on a non-leaf node");
        };

        match entries.binary_search_by(|(k, _)| k.cmp(&key)) {
            Ok(pos) => {
                let previous = entries[pos].1;
                match decide(Some(&previous)) {
                    Change::Keep => (Some(previous), false),
                    Change::Set(entry) => {
                        entries[pos].1 = entry;
                        (Some(previous), true)
                    }
                    Change::Remove => {
                        entries.remove(pos);
                        let now_empty = entries.is_empty();
                        self.len -= 1;
                        if now_empty {
                            self.unlink_empty(path, leaf);
                        }
                        (Some(previous), true)
                    }
                }
            }
            Err(pos) => match decide(None) {
                Change::Keep | Change::Remove => (None, false),
                Change::Set(entry) => {
                    entries.insert(pos, (key, entry));
                    let overflow = entries.len() > capacity;
                    self.len += 1;
                    if overflow {
                        self.split_leaf(path, leaf);
                    }
                    (None, true)
                }
            },
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn leaf_entries(&self, id: NodeId) -> &[(IndexKey, IndexEntry)] {
        match self.node(id) {
            Node::Leaf { entries } => entries,
            _ => &[],
        }
    }

    fn find_leaf(&self, key: &IndexKey) -> (Path, NodeId) {
        let mut path = Path::new();
        let mut id = self.root;
        while let Node::Inner { keys, children } = self.node(id) {
            let idx = keys.partition_point(|k| k <= key);
            path.push((id, idx));
            id = children[idx];
        }
        (path, id)
    }

    fn leftmost_leaf(&self, mut id: NodeId, path: &mut Path) -> NodeId {
        while let Node::Inner { children, .. } = self.node(id) {
            path.push((id, 0));
            id = children[0];
        }
        id
    }

    /// Advance `path` to the leaf following the one it currently ends at
    fn next_leaf(&self, path: &mut Path) -> Option<NodeId> {
        while let Some((parent, idx)) = path.pop() {
            if let Node::Inner { children, .. } = self.node(parent) {
                if idx + 1 < children.len() {
                    path.push((parent, idx + 1));
                    let child = children[idx + 1];
                    return Some(self.leftmost_leaf(child, path));
                }
            }
        }
        None
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id as usize] = Node::Free;
        self.free.push(id);
    }

    /// Split an overfull leaf at its median
    fn split_leaf(&mut self, path: Path, leaf: NodeId) {
        let right_entries = match &mut self.nodes[leaf as usize] {
            Node::Leaf { entries } => {
                let mid = entries.len() / 2;
                entries.split_off(mid)
            }
            _ => return,
        };
        let separator = right_entries[0].0.clone();
        let right = self.alloc(Node::Leaf {
            entries: right_entries,
        });
        self.insert_into_parent(path, leaf, separator, right);
    }

    /// Split an overfull inner node; the median key moves up
    fn split_inner(&mut self, path: Path, node: NodeId) {
        let (separator, right_node) = match &mut self.nodes[node as usize] {
            Node::Inner { keys, children } => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let separator = keys.remove(mid);
                let right_children = children.split_off(mid + 1);
                (
                    separator,
                    Node::Inner {
                        keys: right_keys,
                        children: right_children,
                    },
                )
            }
            _ => return,
        };
        let right = self.alloc(right_node);
        self.insert_into_parent(path, node, separator, right);
    }

    fn insert_into_parent(
        &mut self,
        mut path: Path,
        left: NodeId,
        separator: IndexKey,
        right: NodeId,
    ) {
        let Some((parent, idx)) = path.pop() else {
            // Root split: the tree grows by one level
            self.root = self.alloc(Node::Inner {
                keys: vec![separator],
                children: vec![left, right],
            });
            self.height += 1;
            return;
        };

        let overflow = match &mut self.nodes[parent as usize] {
            Node::Inner { keys, children } => {
                keys.insert(idx, separator);
                children.insert(idx + 1, right);
                keys.len() > self.capacity
            }
            _ => false,
        };
        if overflow {
            self.split_inner(path, parent);
        }
    }

    /// Drop an empty node from its parent, cascading upwards
    fn unlink_empty(&mut self, mut path: Path, node: NodeId) {
        let Some((parent, idx)) = path.pop() else {
            if node != self.root || matches!(self.node(node), Node::Leaf { .. }) {
                return;
            }
            // Root inner node lost its last child
            self.release(node);
            self.root = self.alloc(Node::Leaf {
                entries: Vec::new(),
            });
            self.height = 1;
            return;
        };

        self.release(node);
        let parent_empty = match &mut self.nodes[parent as usize] {
            Node::Inner { keys, children } => {
                children.remove(idx);
                if !keys.is_empty() {
                    keys.remove(idx.saturating_sub(1));
                }
                children.is_empty()
            }
            _ => false,
        };

        if parent_empty {
            self.unlink_empty(path, parent);
        } else {
            self.collapse_root();
        }
    }

    /// Replace a root with a single child by that child
    fn collapse_root(&mut self) {
        while let Node::Inner { children, .. } = self.node(self.root) {
            if children.len() != 1 {
                return;
            }
            let child = children[0];
            let old = self.root;
            self.root = child;
            self.release(old);
            self.height -= 1;
        }
    }
}
