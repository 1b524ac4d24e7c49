//! Backing tree storage for constrained tree models.
//!
//! Uses arena-style storage: parent/child links live in a flat packed edge
//! array and nodes are referenced by `NodeId` (a `usize` index). External
//! (tip) nodes occupy indices `[0, tip_count)` and internal nodes follow, so
//! a fully bifurcating tree always satisfies `node_count == 2 * tip_count - 1`.
//!
//! Structural edits happen inside an explicit transaction bracket
//! ([`BasicTree::begin_edit`] / [`BasicTree::end_edit`]). Changes are recorded
//! as [`TreeChangedEvent`] values on a pending queue that the caller drains
//! when the transaction commits; there is no listener registration.

use std::collections::HashMap;

use crate::error::{CladecastError, Result};

/// Index into a tree's node arena.
pub type NodeId = usize;

/// Sentinel for "no node" in the packed edge array.
const NONE: i32 = -1;

/// A change notification produced by a tree edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeChangedEvent {
    /// The node whose edges or height changed.
    pub node: NodeId,
    /// True if the node's height changed (rather than its edges).
    pub height_changed: bool,
}

/// Read access to a node-index-backed tree.
pub trait Tree {
    fn node_count(&self) -> usize;
    fn external_node_count(&self) -> usize;
    fn internal_node_count(&self) -> usize;
    fn root(&self) -> NodeId;
    fn parent(&self, node: NodeId) -> Option<NodeId>;
    fn child_count(&self, node: NodeId) -> usize;
    fn child(&self, node: NodeId, i: usize) -> NodeId;
    fn node_height(&self, node: NodeId) -> f64;
    fn node_taxon(&self, node: NodeId) -> Option<&str>;

    fn is_external(&self, node: NodeId) -> bool {
        node < self.external_node_count()
    }

    fn is_root(&self, node: NodeId) -> bool {
        node == self.root()
    }

    /// Most recent common ancestor of a set of nodes.
    ///
    /// # Panics
    ///
    /// Panics if `nodes` is empty.
    fn mrca(&self, nodes: &[NodeId]) -> NodeId {
        assert!(!nodes.is_empty(), "mrca of empty node set");
        let mut ancestor = nodes[0];
        for &node in &nodes[1..] {
            // Collect ancestors of the running ancestor, then walk up from
            // `node` until the paths meet.
            let mut path = Vec::new();
            let mut cur = ancestor;
            loop {
                path.push(cur);
                match self.parent(cur) {
                    Some(p) => cur = p,
                    None => break,
                }
            }
            cur = node;
            while !path.contains(&cur) {
                cur = self
                    .parent(cur)
                    .expect("nodes do not share a common ancestor");
            }
            ancestor = cur;
        }
        ancestor
    }
}

/// Mutation access to a node-index-backed tree.
///
/// Structural mutators require an open edit transaction; height mutators come
/// in notifying and quiet variants.
pub trait MutableTree: Tree {
    fn begin_edit(&mut self);
    /// Commit the transaction and drain the pending change events.
    fn end_edit(&mut self) -> Vec<TreeChangedEvent>;
    /// Commit the transaction, discarding pending change events.
    fn end_edit_quietly(&mut self);

    fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()>;
    fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()>;
    fn replace_child(&mut self, parent: NodeId, child: NodeId, new_child: NodeId) -> Result<()>;
    fn set_root(&mut self, node: NodeId) -> Result<()>;

    fn set_node_height(&mut self, node: NodeId, height: f64);
    fn set_node_height_quietly(&mut self, node: NodeId, height: f64);
    fn set_node_rate(&mut self, node: NodeId, rate: f64);
    fn set_node_attribute(&mut self, node: NodeId, name: &str, value: f64);
}

/// A mutable rooted tree stored as flat parallel arrays.
///
/// The packed edge array holds `[parent, child0, child1]` per node; heights,
/// rates, and tip taxa are parallel arrays. Store/restore checkpoints swap
/// whole arrays, so transactional rollback of a failed proposal is O(1)
/// allocation-free.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BasicTree {
    edges: Vec<i32>,
    stored_edges: Vec<i32>,
    heights: Vec<f64>,
    stored_heights: Vec<f64>,
    root: NodeId,
    stored_root: NodeId,
    taxa: Vec<Option<String>>,
    rates: Vec<f64>,
    attributes: HashMap<String, HashMap<NodeId, f64>>,
    external_node_count: usize,
    next_internal: usize,
    in_edit: bool,
    pending: Vec<TreeChangedEvent>,
}

impl BasicTree {
    /// Create a tree with `tips.len()` external nodes at the given heights
    /// and `tips.len() - 1` unlinked internal nodes.
    ///
    /// Internal nodes are linked up with [`BasicTree::join`]; the last join
    /// becomes the root.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two tips are supplied.
    pub fn new(tips: &[(&str, f64)]) -> Result<Self> {
        if tips.len() < 2 {
            return Err(CladecastError::InvalidInput(
                "a tree needs at least two tips".into(),
            ));
        }
        let tip_count = tips.len();
        let node_count = 2 * tip_count - 1;

        let mut taxa = vec![None; node_count];
        let mut heights = vec![0.0; node_count];
        for (i, (name, height)) in tips.iter().enumerate() {
            taxa[i] = Some((*name).to_string());
            heights[i] = *height;
        }

        Ok(Self {
            edges: vec![NONE; node_count * 3],
            stored_edges: vec![NONE; node_count * 3],
            heights,
            stored_heights: vec![0.0; node_count],
            root: node_count - 1,
            stored_root: node_count - 1,
            taxa,
            rates: vec![1.0; node_count],
            attributes: HashMap::new(),
            external_node_count: tip_count,
            next_internal: tip_count,
            in_edit: false,
            pending: Vec::new(),
        })
    }

    /// Link the next free internal node as the parent of `a` and `b` at the
    /// given height, returning the new parent. The last join becomes the root.
    ///
    /// # Errors
    ///
    /// Returns an error if either child already has a parent or all internal
    /// nodes are linked.
    pub fn join(&mut self, a: NodeId, b: NodeId, height: f64) -> Result<NodeId> {
        if self.next_internal >= self.node_count() {
            return Err(CladecastError::InvalidInput(
                "all internal nodes are already linked".into(),
            ));
        }
        for &child in &[a, b] {
            if self.edge(child, 0) != NONE {
                return Err(CladecastError::InvalidInput(format!(
                    "node {} already has a parent",
                    child
                )));
            }
        }
        let parent = self.next_internal;
        self.next_internal += 1;
        self.set_edge(parent, 1, a as i32);
        self.set_edge(parent, 2, b as i32);
        self.set_edge(a, 0, parent as i32);
        self.set_edge(b, 0, parent as i32);
        self.heights[parent] = height;
        self.root = parent;
        Ok(parent)
    }

    fn edge(&self, node: NodeId, slot: usize) -> i32 {
        self.edges[node * 3 + slot]
    }

    fn set_edge(&mut self, node: NodeId, slot: usize, value: i32) {
        self.edges[node * 3 + slot] = value;
    }

    fn push_event(&mut self, node: NodeId, height_changed: bool) {
        self.pending.push(TreeChangedEvent {
            node,
            height_changed,
        });
    }

    fn require_edit(&self) -> Result<()> {
        if !self.in_edit {
            return Err(CladecastError::Unsupported(
                "structural edits require an open edit transaction".into(),
            ));
        }
        Ok(())
    }

    /// True while an edit transaction is open.
    pub fn in_edit(&self) -> bool {
        self.in_edit
    }

    pub fn node_rate(&self, node: NodeId) -> f64 {
        self.rates[node]
    }

    pub fn node_attribute(&self, node: NodeId, name: &str) -> Option<f64> {
        self.attributes.get(name).and_then(|m| m.get(&node)).copied()
    }

    /// Attach `child` under `parent` without recording a change event.
    ///
    /// Used in simulation loops that commit with
    /// [`MutableTree::end_edit_quietly`] and would otherwise pile up events.
    pub fn add_child_quietly(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require_edit()?;
        if self.edge(parent, 1) == NONE {
            self.set_edge(parent, 1, child as i32);
        } else if self.edge(parent, 2) == NONE {
            self.set_edge(parent, 2, child as i32);
        } else {
            return Err(CladecastError::InvalidInput(format!(
                "node {} already has two children",
                parent
            )));
        }
        self.set_edge(child, 0, parent as i32);
        Ok(())
    }

    /// Detach `child` from `parent` without recording a change event.
    pub fn remove_child_quietly(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require_edit()?;
        if self.edge(parent, 1) == child as i32 {
            self.set_edge(parent, 1, self.edge(parent, 2));
            self.set_edge(parent, 2, NONE);
        } else if self.edge(parent, 2) == child as i32 {
            self.set_edge(parent, 2, NONE);
        } else {
            return Err(CladecastError::InvalidInput(format!(
                "node {} is not a child of node {}",
                child, parent
            )));
        }
        self.set_edge(child, 0, NONE);
        Ok(())
    }

    /// Erase every parent/child link, keeping heights and taxa.
    ///
    /// Only meaningful inside an edit transaction; the tree is structurally
    /// invalid until edges are rebuilt.
    pub fn clear_topology(&mut self) -> Result<()> {
        self.require_edit()?;
        for e in self.edges.iter_mut() {
            *e = NONE;
        }
        Ok(())
    }

    /// Checkpoint edges, heights, and root.
    pub fn store_state(&mut self) {
        self.stored_edges.copy_from_slice(&self.edges);
        self.stored_heights.copy_from_slice(&self.heights);
        self.stored_root = self.root;
    }

    /// Swap back to the last checkpoint.
    pub fn restore_state(&mut self) {
        std::mem::swap(&mut self.edges, &mut self.stored_edges);
        std::mem::swap(&mut self.heights, &mut self.stored_heights);
        self.root = self.stored_root;
    }

    /// Copy edges, heights, and root from another tree of identical shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the node counts differ.
    pub fn adopt_structure(&mut self, other: &BasicTree) -> Result<()> {
        if other.node_count() != self.node_count() {
            return Err(CladecastError::InvalidInput(format!(
                "cannot adopt structure of a {}-node tree into a {}-node tree",
                other.node_count(),
                self.node_count()
            )));
        }
        self.edges.copy_from_slice(&other.edges);
        self.heights.copy_from_slice(&other.heights);
        self.root = other.root;
        for node in 0..self.node_count() {
            self.push_event(node, true);
        }
        Ok(())
    }
}

impl Tree for BasicTree {
    fn node_count(&self) -> usize {
        self.heights.len()
    }

    fn external_node_count(&self) -> usize {
        self.external_node_count
    }

    fn internal_node_count(&self) -> usize {
        self.node_count() - self.external_node_count
    }

    fn root(&self) -> NodeId {
        self.root
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        let p = self.edge(node, 0);
        if p == NONE {
            None
        } else {
            Some(p as NodeId)
        }
    }

    fn child_count(&self, node: NodeId) -> usize {
        if self.is_external(node) {
            return 0;
        }
        (1..=2).filter(|&slot| self.edge(node, slot) != NONE).count()
    }

    fn child(&self, node: NodeId, i: usize) -> NodeId {
        debug_assert!(i < 2);
        let c = self.edge(node, i + 1);
        assert!(c != NONE, "node {} has no child {}", node, i);
        c as NodeId
    }

    fn node_height(&self, node: NodeId) -> f64 {
        self.heights[node]
    }

    fn node_taxon(&self, node: NodeId) -> Option<&str> {
        self.taxa[node].as_deref()
    }
}

impl MutableTree for BasicTree {
    fn begin_edit(&mut self) {
        self.in_edit = true;
    }

    fn end_edit(&mut self) -> Vec<TreeChangedEvent> {
        self.in_edit = false;
        std::mem::take(&mut self.pending)
    }

    fn end_edit_quietly(&mut self) {
        self.in_edit = false;
        self.pending.clear();
    }

    fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require_edit()?;
        if self.edge(parent, 1) == NONE {
            self.set_edge(parent, 1, child as i32);
        } else if self.edge(parent, 2) == NONE {
            self.set_edge(parent, 2, child as i32);
        } else {
            return Err(CladecastError::InvalidInput(format!(
                "node {} already has two children",
                parent
            )));
        }
        self.set_edge(child, 0, parent as i32);
        self.push_event(parent, false);
        self.push_event(child, false);
        Ok(())
    }

    fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require_edit()?;
        if self.edge(parent, 1) == child as i32 {
            // Keep child slot 0 filled.
            self.set_edge(parent, 1, self.edge(parent, 2));
            self.set_edge(parent, 2, NONE);
        } else if self.edge(parent, 2) == child as i32 {
            self.set_edge(parent, 2, NONE);
        } else {
            return Err(CladecastError::InvalidInput(format!(
                "node {} is not a child of node {}",
                child, parent
            )));
        }
        self.set_edge(child, 0, NONE);
        self.push_event(parent, false);
        self.push_event(child, false);
        Ok(())
    }

    fn replace_child(&mut self, parent: NodeId, child: NodeId, new_child: NodeId) -> Result<()> {
        self.require_edit()?;
        let slot = if self.edge(parent, 1) == child as i32 {
            1
        } else if self.edge(parent, 2) == child as i32 {
            2
        } else {
            return Err(CladecastError::InvalidInput(format!(
                "node {} is not a child of node {}",
                child, parent
            )));
        };
        self.set_edge(parent, slot, new_child as i32);
        self.set_edge(child, 0, NONE);
        self.set_edge(new_child, 0, parent as i32);
        self.push_event(parent, false);
        self.push_event(child, false);
        self.push_event(new_child, false);
        Ok(())
    }

    fn set_root(&mut self, node: NodeId) -> Result<()> {
        self.require_edit()?;
        self.root = node;
        self.set_edge(node, 0, NONE);
        self.push_event(node, false);
        Ok(())
    }

    fn set_node_height(&mut self, node: NodeId, height: f64) {
        self.heights[node] = height;
        self.push_event(node, true);
    }

    fn set_node_height_quietly(&mut self, node: NodeId, height: f64) {
        self.heights[node] = height;
    }

    fn set_node_rate(&mut self, node: NodeId, rate: f64) {
        self.rates[node] = rate;
    }

    fn set_node_attribute(&mut self, node: NodeId, name: &str, value: f64) {
        self.attributes
            .entry(name.to_string())
            .or_default()
            .insert(node, value);
    }
}
