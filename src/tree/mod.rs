//! LayoutTree - pane arrangement within one window
//!
//! A tree of Branch and Leaf nodes. A Branch splits space among two or more
//! children along one axis with proportional sizes; a Leaf owns one
//! TabManager. Nodes live in a flat arena keyed by generated ids, parent and
//! child links are ids, so there are no ownership cycles.
//!
//! Structural invariants, maintained by every mutation:
//! - a Branch always has at least two children;
//! - a Branch with one remaining child collapses, the child taking its
//!   place in the grandparent;
//! - sizes are parallel to children and sum to 1.0.

pub mod tabs;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::error::{Error, Result};
pub use tabs::{OpenOutcome, TabManager};

/// Identifier of a node within one tree.
pub type NodeId = u64;

/// Split axis of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Horizontal,
    Vertical,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Horizontal => "horizontal",
            Direction::Vertical => "vertical",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "horizontal" => Some(Direction::Horizontal),
            "vertical" => Some(Direction::Vertical),
            _ => None,
        }
    }
}

/// Where a split inserts the new leaf relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    Before,
    After,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Branch {
        direction: Direction,
        children: Vec<NodeId>,
        sizes: Vec<f64>,
    },
    Leaf {
        tabs: TabManager,
    },
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    kind: NodeKind,
}

/// The layout tree of a single window.
#[derive(Debug, Clone)]
pub struct LayoutTree {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_id: NodeId,
    history_limit: usize,
}

impl LayoutTree {
    /// A tree consisting of a single empty leaf.
    pub fn new(history_limit: usize) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            1,
            Node {
                parent: None,
                kind: NodeKind::Leaf {
                    tabs: TabManager::new(history_limit),
                },
            },
        );
        Self {
            nodes,
            root: 1,
            next_id: 2,
            history_limit,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    /// The TabManager of a leaf, or None when the id is unknown or a branch.
    pub fn tabs(&self, leaf: NodeId) -> Option<&TabManager> {
        match &self.nodes.get(&leaf)?.kind {
            NodeKind::Leaf { tabs } => Some(tabs),
            NodeKind::Branch { .. } => None,
        }
    }

    pub fn tabs_mut(&mut self, leaf: NodeId) -> Option<&mut TabManager> {
        match &mut self.nodes.get_mut(&leaf)?.kind {
            NodeKind::Leaf { tabs } => Some(tabs),
            NodeKind::Branch { .. } => None,
        }
    }

    /// True when the id names a branch node.
    pub fn is_branch(&self, id: NodeId) -> bool {
        matches!(
            self.nodes.get(&id),
            Some(Node {
                kind: NodeKind::Branch { .. },
                ..
            })
        )
    }

    /// Lazy left-to-right traversal over all leaves. Restartable: each call
    /// returns a fresh iterator.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            tree: self,
            stack: vec![self.root],
        }
    }

    /// All leaf ids, left to right.
    pub fn leaf_ids(&self) -> Vec<NodeId> {
        self.leaves().map(|(id, _)| id).collect()
    }

    /// First leaf in traversal order. Every valid tree has one.
    pub fn first_leaf(&self) -> NodeId {
        self.leaves().next().map(|(id, _)| id).unwrap_or(self.root)
    }

    /// Leaves that have `path` open.
    pub fn leaves_with(&self, path: &Path) -> Vec<NodeId> {
        self.leaves()
            .filter(|(_, tabs)| tabs.contains(path))
            .map(|(id, _)| id)
            .collect()
    }

    /// Distinct open paths across all leaves, in traversal order.
    pub fn open_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for (_, tabs) in self.leaves() {
            for file in tabs.files() {
                if !paths.contains(file) {
                    paths.push(file.clone());
                }
            }
        }
        paths
    }

    /// Split a leaf: create a sibling leaf before/after the target inside a
    /// branch of the given direction, reusing the parent branch when its
    /// direction matches. Returns the new leaf id.
    pub fn split(
        &mut self,
        target: NodeId,
        direction: Direction,
        insertion: Insertion,
    ) -> Result<NodeId> {
        if self.tabs(target).is_none() {
            return Err(Error::NodeNotFound(target));
        }
        let parent = self.nodes[&target].parent;

        // Same-direction parent: insert as an additional child, splitting
        // the target's share between target and newcomer.
        if let Some(parent_id) = parent {
            if let NodeKind::Branch {
                direction: parent_dir,
                ..
            } = &self.nodes[&parent_id].kind
            {
                if *parent_dir == direction {
                    let new_leaf = self.alloc(Node {
                        parent: Some(parent_id),
                        kind: NodeKind::Leaf {
                            tabs: TabManager::new(self.history_limit),
                        },
                    });
                    if let NodeKind::Branch {
                        children, sizes, ..
                    } = &mut self.nodes.get_mut(&parent_id).unwrap().kind
                    {
                        let index = children.iter().position(|&c| c == target).unwrap();
                        let slot = match insertion {
                            Insertion::Before => index,
                            Insertion::After => index + 1,
                        };
                        let half = sizes[index] / 2.0;
                        sizes[index] = half;
                        children.insert(slot, new_leaf);
                        sizes.insert(slot, half);
                    }
                    return Ok(new_leaf);
                }
            }
        }

        // Otherwise wrap the target in a fresh branch of the requested
        // direction and hang the new leaf next to it.
        let branch = self.alloc(Node {
            parent,
            kind: NodeKind::Branch {
                direction,
                children: Vec::new(),
                sizes: Vec::new(),
            },
        });
        let new_leaf = self.alloc(Node {
            parent: Some(branch),
            kind: NodeKind::Leaf {
                tabs: TabManager::new(self.history_limit),
            },
        });
        let ordered = match insertion {
            Insertion::Before => vec![new_leaf, target],
            Insertion::After => vec![target, new_leaf],
        };
        if let NodeKind::Branch {
            children, sizes, ..
        } = &mut self.nodes.get_mut(&branch).unwrap().kind
        {
            *children = ordered;
            *sizes = vec![0.5, 0.5];
        }
        self.nodes.get_mut(&target).unwrap().parent = Some(branch);

        match parent {
            Some(parent_id) => {
                if let NodeKind::Branch { children, .. } =
                    &mut self.nodes.get_mut(&parent_id).unwrap().kind
                {
                    let slot = children.iter().position(|&c| c == target).unwrap();
                    children[slot] = branch;
                }
            }
            None => self.root = branch,
        }
        Ok(new_leaf)
    }

    /// Detach a node (and its subtree) and apply the collapse invariant
    /// upward. The root cannot be removed; callers drop the whole tree
    /// instead.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&id) {
            return Err(Error::NodeNotFound(id));
        }
        let Some(parent_id) = self.nodes[&id].parent else {
            return Err(Error::NodeNotFound(id));
        };

        self.drop_subtree(id);
        let remaining = match &mut self.nodes.get_mut(&parent_id).unwrap().kind {
            NodeKind::Branch {
                children, sizes, ..
            } => {
                let index = children.iter().position(|&c| c == id).unwrap();
                children.remove(index);
                sizes.remove(index);
                normalize(sizes);
                children.len()
            }
            NodeKind::Leaf { .. } => unreachable!("parent link always points at a branch"),
        };

        // One child left: the survivor replaces the branch in its parent.
        if remaining == 1 {
            self.collapse(parent_id);
        }
        Ok(())
    }

    fn collapse(&mut self, branch_id: NodeId) {
        let survivor = match &self.nodes[&branch_id].kind {
            NodeKind::Branch { children, .. } => children[0],
            NodeKind::Leaf { .. } => return,
        };
        let grandparent = self.nodes[&branch_id].parent;
        self.nodes.get_mut(&survivor).unwrap().parent = grandparent;
        match grandparent {
            Some(gp) => {
                if let NodeKind::Branch { children, .. } = &mut self.nodes.get_mut(&gp).unwrap().kind
                {
                    let slot = children.iter().position(|&c| c == branch_id).unwrap();
                    children[slot] = survivor;
                }
            }
            None => self.root = survivor,
        }
        self.nodes.remove(&branch_id);
    }

    fn drop_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                if let NodeKind::Branch { children, .. } = node.kind {
                    stack.extend(children);
                }
            }
        }
    }

    /// Replace a branch's relative sizes. The list must match the child
    /// count and contain only finite positive values; it is normalized to
    /// sum 1.0.
    pub fn set_branch_sizes(&mut self, id: NodeId, new_sizes: &[f64]) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        match &mut node.kind {
            NodeKind::Branch { sizes, .. } => {
                if new_sizes.len() != sizes.len() {
                    return Err(Error::MalformedTree(format!(
                        "expected {} sizes, got {}",
                        sizes.len(),
                        new_sizes.len()
                    )));
                }
                if new_sizes.iter().any(|s| !s.is_finite() || *s <= 0.0) {
                    return Err(Error::MalformedTree(
                        "branch sizes must be finite and positive".into(),
                    ));
                }
                *sizes = new_sizes.to_vec();
                normalize(sizes);
                Ok(())
            }
            NodeKind::Leaf { .. } => Err(Error::NodeNotFound(id)),
        }
    }

    /// Serialize to a JSON tree with explicit type tags.
    pub fn serialize(&self) -> Value {
        self.serialize_node(self.root)
    }

    fn serialize_node(&self, id: NodeId) -> Value {
        match &self.nodes[&id].kind {
            NodeKind::Branch {
                direction,
                children,
                sizes,
            } => json!({
                "type": "branch",
                "direction": direction.as_str(),
                "sizes": sizes,
                "children": children
                    .iter()
                    .map(|&c| self.serialize_node(c))
                    .collect::<Vec<_>>(),
            }),
            NodeKind::Leaf { tabs } => json!({
                "type": "leaf",
                "files": tabs.files(),
                "active": tabs.active(),
                "pinned": tabs.pinned_paths().collect::<Vec<_>>(),
            }),
        }
    }

    /// Deserialize a JSON tree, rejecting structurally invalid input with
    /// `MalformedTree` instead of constructing a partial tree.
    pub fn deserialize(value: &Value, history_limit: usize) -> Result<Self> {
        let mut tree = Self {
            nodes: HashMap::new(),
            root: 0,
            next_id: 1,
            history_limit,
        };
        tree.root = tree.deserialize_node(value, None)?;
        Ok(tree)
    }

    fn deserialize_node(&mut self, value: &Value, parent: Option<NodeId>) -> Result<NodeId> {
        let malformed = |msg: &str| Error::MalformedTree(msg.to_string());
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("node without type tag"))?;
        match tag {
            "branch" => {
                let direction = value
                    .get("direction")
                    .and_then(Value::as_str)
                    .and_then(Direction::parse)
                    .ok_or_else(|| malformed("branch without valid direction"))?;
                let children_json = value
                    .get("children")
                    .and_then(Value::as_array)
                    .ok_or_else(|| malformed("branch without children array"))?;
                if children_json.len() < 2 {
                    return Err(malformed("branch with fewer than two children"));
                }
                let sizes_json = value
                    .get("sizes")
                    .and_then(Value::as_array)
                    .ok_or_else(|| malformed("branch without sizes array"))?;
                if sizes_json.len() != children_json.len() {
                    return Err(malformed("sizes do not match children"));
                }
                let mut sizes = Vec::with_capacity(sizes_json.len());
                for size in sizes_json {
                    let size = size
                        .as_f64()
                        .filter(|s| s.is_finite() && *s > 0.0)
                        .ok_or_else(|| malformed("branch size must be finite and positive"))?;
                    sizes.push(size);
                }
                normalize(&mut sizes);

                let id = self.alloc(Node {
                    parent,
                    kind: NodeKind::Branch {
                        direction,
                        children: Vec::new(),
                        sizes,
                    },
                });
                let mut children = Vec::with_capacity(children_json.len());
                for child in children_json {
                    children.push(self.deserialize_node(child, Some(id))?);
                }
                if let NodeKind::Branch { children: slot, .. } =
                    &mut self.nodes.get_mut(&id).unwrap().kind
                {
                    *slot = children;
                }
                Ok(id)
            }
            "leaf" => {
                let files_json = value
                    .get("files")
                    .and_then(Value::as_array)
                    .ok_or_else(|| malformed("leaf without files array"))?;
                let mut tabs = TabManager::new(self.history_limit);
                for file in files_json {
                    let file = file
                        .as_str()
                        .ok_or_else(|| malformed("leaf file entry must be a string"))?;
                    if tabs.contains(Path::new(file)) {
                        return Err(malformed("duplicate file within one leaf"));
                    }
                    tabs.open_file(Path::new(file));
                }
                match value.get("active") {
                    None | Some(Value::Null) => {}
                    Some(Value::String(active)) => {
                        if !tabs.activate(Path::new(active)) {
                            return Err(malformed("active path not in open set"));
                        }
                    }
                    Some(_) => return Err(malformed("active must be a string or null")),
                }
                if let Some(pinned) = value.get("pinned").and_then(Value::as_array) {
                    for path in pinned {
                        let path = path
                            .as_str()
                            .ok_or_else(|| malformed("pinned entry must be a string"))?;
                        if !tabs.set_pinned(Path::new(path), true) {
                            return Err(malformed("pinned path not in open set"));
                        }
                    }
                }
                Ok(self.alloc(Node {
                    parent,
                    kind: NodeKind::Leaf { tabs },
                }))
            }
            other => Err(Error::MalformedTree(format!("unknown node type: {other}"))),
        }
    }
}

/// Left-to-right leaf iterator (depth-first, children in order).
pub struct Leaves<'a> {
    tree: &'a LayoutTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = (NodeId, &'a TabManager);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            match &self.tree.nodes.get(&id)?.kind {
                NodeKind::Leaf { tabs } => return Some((id, tabs)),
                NodeKind::Branch { children, .. } => {
                    // Reverse so the leftmost child pops first
                    self.stack.extend(children.iter().rev());
                }
            }
        }
        None
    }
}

fn normalize(sizes: &mut [f64]) {
    let total: f64 = sizes.iter().sum();
    if total > 0.0 {
        for size in sizes.iter_mut() {
            *size /= total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str) -> PathBuf {
        PathBuf::from(format!("/notes/{name}"))
    }

    fn sizes_of(tree: &LayoutTree, id: NodeId) -> Vec<f64> {
        match &tree.nodes[&id].kind {
            NodeKind::Branch { sizes, .. } => sizes.clone(),
            NodeKind::Leaf { .. } => panic!("not a branch"),
        }
    }

    #[test]
    fn test_split_wraps_leaf_in_branch() {
        let mut tree = LayoutTree::new(50);
        let first = tree.first_leaf();
        let second = tree
            .split(first, Direction::Horizontal, Insertion::After)
            .unwrap();
        assert_eq!(tree.leaf_ids(), vec![first, second]);
        assert!(tree.is_branch(tree.root()));
        assert_eq!(sizes_of(&tree, tree.root()), vec![0.5, 0.5]);
    }

    #[test]
    fn test_split_before_places_new_leaf_first() {
        let mut tree = LayoutTree::new(50);
        let first = tree.first_leaf();
        let second = tree
            .split(first, Direction::Vertical, Insertion::Before)
            .unwrap();
        assert_eq!(tree.leaf_ids(), vec![second, first]);
    }

    #[test]
    fn test_same_direction_split_extends_branch() {
        let mut tree = LayoutTree::new(50);
        let a = tree.first_leaf();
        let b = tree.split(a, Direction::Horizontal, Insertion::After).unwrap();
        let root = tree.root();
        let c = tree.split(b, Direction::Horizontal, Insertion::After).unwrap();
        // No new branch created; b's half was split between b and c
        assert_eq!(tree.root(), root);
        assert_eq!(tree.leaf_ids(), vec![a, b, c]);
        assert_eq!(sizes_of(&tree, root), vec![0.5, 0.25, 0.25]);
    }

    #[test]
    fn test_cross_direction_split_nests() {
        let mut tree = LayoutTree::new(50);
        let a = tree.first_leaf();
        let b = tree.split(a, Direction::Horizontal, Insertion::After).unwrap();
        let root = tree.root();
        let c = tree.split(b, Direction::Vertical, Insertion::After).unwrap();
        assert_eq!(tree.root(), root);
        assert_eq!(tree.leaf_ids(), vec![a, b, c]);
        // b now sits inside a nested vertical branch
        let parent_of_b = tree.nodes[&b].parent.unwrap();
        assert_ne!(parent_of_b, root);
        assert!(tree.is_branch(parent_of_b));
    }

    #[test]
    fn test_remove_collapses_branch_into_grandparent() {
        let mut tree = LayoutTree::new(50);
        let a = tree.first_leaf();
        let b = tree.split(a, Direction::Horizontal, Insertion::After).unwrap();
        let c = tree.split(b, Direction::Vertical, Insertion::After).unwrap();
        let root = tree.root();
        let nested = tree.nodes[&b].parent.unwrap();

        // Removing c leaves the nested branch with one child; b must take
        // the branch's slot in the root.
        tree.remove_node(c).unwrap();
        assert!(!tree.nodes.contains_key(&nested));
        assert_eq!(tree.nodes[&b].parent, Some(root));
        assert_eq!(tree.leaf_ids(), vec![a, b]);
    }

    #[test]
    fn test_remove_renormalizes_sizes() {
        let mut tree = LayoutTree::new(50);
        let a = tree.first_leaf();
        let b = tree.split(a, Direction::Horizontal, Insertion::After).unwrap();
        let c = tree.split(b, Direction::Horizontal, Insertion::After).unwrap();
        tree.remove_node(a).unwrap();
        let total: f64 = sizes_of(&tree, tree.root()).iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(tree.leaf_ids(), vec![b, c]);
    }

    #[test]
    fn test_remove_root_is_rejected() {
        let mut tree = LayoutTree::new(50);
        let root = tree.root();
        assert!(tree.remove_node(root).is_err());
    }

    #[test]
    fn test_set_branch_sizes_validates_and_normalizes() {
        let mut tree = LayoutTree::new(50);
        let a = tree.first_leaf();
        tree.split(a, Direction::Horizontal, Insertion::After).unwrap();
        let root = tree.root();

        tree.set_branch_sizes(root, &[3.0, 1.0]).unwrap();
        assert_eq!(sizes_of(&tree, root), vec![0.75, 0.25]);

        assert!(tree.set_branch_sizes(root, &[1.0]).is_err());
        assert!(tree.set_branch_sizes(root, &[f64::NAN, 1.0]).is_err());
        assert!(tree.set_branch_sizes(root, &[-1.0, 2.0]).is_err());
        assert!(tree.set_branch_sizes(a, &[1.0, 1.0]).is_err());
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut tree = LayoutTree::new(50);
        let a = tree.first_leaf();
        let b = tree.split(a, Direction::Horizontal, Insertion::After).unwrap();
        let c = tree.split(b, Direction::Vertical, Insertion::After).unwrap();
        tree.set_branch_sizes(tree.root(), &[0.3, 0.7]).unwrap();

        tree.tabs_mut(a).unwrap().open_file(&p("a.md"));
        tree.tabs_mut(a).unwrap().open_file(&p("shared.md"));
        tree.tabs_mut(a).unwrap().set_pinned(&p("a.md"), true);
        tree.tabs_mut(b).unwrap().open_file(&p("shared.md"));
        tree.tabs_mut(c).unwrap().open_file(&p("c.md"));

        let value = tree.serialize();
        let restored = LayoutTree::deserialize(&value, 50).unwrap();
        assert_eq!(restored.serialize(), value);

        // Tab state survives
        let leaves = restored.leaf_ids();
        assert_eq!(leaves.len(), 3);
        let first = restored.tabs(leaves[0]).unwrap();
        assert_eq!(first.files(), &[p("a.md"), p("shared.md")]);
        assert_eq!(first.active(), Some(p("shared.md").as_path()));
        assert!(first.is_pinned(&p("a.md")));
    }

    #[test]
    fn test_deserialize_rejects_malformed_trees() {
        let cases = [
            // Branch with a single child
            json!({"type": "branch", "direction": "horizontal", "sizes": [1.0],
                   "children": [{"type": "leaf", "files": []}]}),
            // Negative size
            json!({"type": "branch", "direction": "horizontal", "sizes": [-0.5, 1.5],
                   "children": [{"type": "leaf", "files": []}, {"type": "leaf", "files": []}]}),
            // Size/children mismatch
            json!({"type": "branch", "direction": "horizontal", "sizes": [0.5, 0.25, 0.25],
                   "children": [{"type": "leaf", "files": []}, {"type": "leaf", "files": []}]}),
            // Unknown direction
            json!({"type": "branch", "direction": "diagonal", "sizes": [0.5, 0.5],
                   "children": [{"type": "leaf", "files": []}, {"type": "leaf", "files": []}]}),
            // Active path not open
            json!({"type": "leaf", "files": ["/notes/a.md"], "active": "/notes/b.md"}),
            // Duplicate file in one leaf
            json!({"type": "leaf", "files": ["/notes/a.md", "/notes/a.md"]}),
            // Unknown tag
            json!({"type": "grid"}),
        ];
        for case in &cases {
            assert!(
                matches!(
                    LayoutTree::deserialize(case, 50),
                    Err(Error::MalformedTree(_))
                ),
                "accepted malformed tree: {case}"
            );
        }
    }

    #[test]
    fn test_leaves_iterator_is_restartable() {
        let mut tree = LayoutTree::new(50);
        let a = tree.first_leaf();
        tree.split(a, Direction::Horizontal, Insertion::After).unwrap();
        let first_pass: Vec<NodeId> = tree.leaves().map(|(id, _)| id).collect();
        let second_pass: Vec<NodeId> = tree.leaves().map(|(id, _)| id).collect();
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn test_leaves_with_path_across_leaves() {
        let mut tree = LayoutTree::new(50);
        let a = tree.first_leaf();
        let b = tree.split(a, Direction::Horizontal, Insertion::After).unwrap();
        tree.tabs_mut(a).unwrap().open_file(&p("shared.md"));
        tree.tabs_mut(b).unwrap().open_file(&p("shared.md"));
        tree.tabs_mut(b).unwrap().open_file(&p("only.md"));
        assert_eq!(tree.leaves_with(&p("shared.md")), vec![a, b]);
        assert_eq!(tree.leaves_with(&p("only.md")), vec![b]);
        assert_eq!(tree.open_paths(), vec![p("shared.md"), p("only.md")]);
    }
}
