//! Wrapped trees: addressing a monophyletic subset of a backing tree.
//!
//! A [`WrappedTree`] maps a subset of a backing tree's nodes into a compact
//! local index space so the subset can be read (and, one layer up, edited) as
//! if it were an independent tree. All height/taxon/topology state physically
//! lives in the backing tree; the wrap holds only two index maps kept as
//! mutual inverses:
//!
//! - `node_map[local] -> backing`
//! - `reverse_map[backing] -> Option<local>`
//!
//! Local numbering follows the usual convention: the declared tips occupy
//! `[0, tip_count)`, the wrap's root (the tips' most recent common ancestor
//! in the backing tree) takes index `tip_count`, and the remaining internal
//! nodes follow in preorder.

use crate::error::{CladecastError, Result};
use crate::tree::{BasicTree, MutableTree, NodeId, Tree, TreeChangedEvent};

/// A compact local view over a monophyletic subset of a backing tree.
#[derive(Debug, Clone)]
pub struct WrappedTree {
    node_map: Vec<NodeId>,
    reverse_map: Vec<Option<usize>>,
    stored_node_map: Vec<NodeId>,
    stored_reverse_map: Vec<Option<usize>>,
    external_node_count: usize,
}

impl WrappedTree {
    /// Wrap the subtree spanned by `tips` in `backing`.
    ///
    /// The declared tips may be backing-tree external nodes or internal nodes
    /// (roots of enclosed subtrees); descent stops at them either way.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a backing-tree external node descended from
    /// the tips' common ancestor is missing from `tips` (a non-monophyletic
    /// wrap), or if the spanned region is not fully bifurcating.
    pub fn new(backing: &BasicTree, tips: &[NodeId]) -> Result<Self> {
        if tips.len() < 2 {
            return Err(CladecastError::InvalidInput(
                "a wrapped tree needs at least two tips".into(),
            ));
        }
        let external_node_count = tips.len();
        let node_count = 2 * external_node_count - 1;

        let mut node_map = vec![usize::MAX; node_count];
        let mut reverse_map = vec![None; backing.node_count()];

        for (local, &tip) in tips.iter().enumerate() {
            if reverse_map[tip].is_some() {
                return Err(CladecastError::InvalidInput(format!(
                    "duplicate tip node {}",
                    tip
                )));
            }
            node_map[local] = tip;
            reverse_map[tip] = Some(local);
        }

        let root = backing.mrca(tips);
        if reverse_map[root].is_some() {
            return Err(CladecastError::InvalidInput(
                "common ancestor of the tip set is itself a declared tip".into(),
            ));
        }
        node_map[external_node_count] = root;
        reverse_map[root] = Some(external_node_count);

        let mut next = external_node_count + 1;
        for i in 0..backing.child_count(root) {
            next = Self::visit(
                backing,
                backing.child(root, i),
                tips,
                &mut node_map,
                &mut reverse_map,
                &mut next,
            )?;
        }
        if next != node_count {
            return Err(CladecastError::InvalidInput(format!(
                "wrapped region spans {} nodes, expected {}",
                next, node_count
            )));
        }

        Ok(Self {
            stored_node_map: node_map.clone(),
            stored_reverse_map: reverse_map.clone(),
            node_map,
            reverse_map,
            external_node_count,
        })
    }

    fn visit(
        backing: &BasicTree,
        node: NodeId,
        tips: &[NodeId],
        node_map: &mut [NodeId],
        reverse_map: &mut [Option<usize>],
        next: &mut usize,
    ) -> Result<usize> {
        if tips.contains(&node) {
            return Ok(*next);
        }
        if backing.is_external(node) {
            return Err(CladecastError::InvalidInput(format!(
                "external node {} is descended from the wrap root but not a declared tip",
                node
            )));
        }
        if *next >= node_map.len() {
            return Err(CladecastError::InvalidInput(
                "wrapped region is not fully bifurcating".into(),
            ));
        }
        node_map[*next] = node;
        reverse_map[node] = Some(*next);
        *next += 1;
        for i in 0..backing.child_count(node) {
            Self::visit(backing, backing.child(node, i), tips, node_map, reverse_map, next)?;
        }
        Ok(*next)
    }

    pub fn node_count(&self) -> usize {
        self.node_map.len()
    }

    pub fn external_node_count(&self) -> usize {
        self.external_node_count
    }

    pub fn internal_node_count(&self) -> usize {
        self.node_count() - self.external_node_count
    }

    pub fn is_external(&self, local: usize) -> bool {
        local < self.external_node_count
    }

    /// Backing-tree id of a local node.
    pub fn backing_node(&self, local: usize) -> NodeId {
        self.node_map[local]
    }

    /// Local index of a backing node, if it is in the mapped subset.
    pub fn local_node(&self, backing: NodeId) -> Option<usize> {
        self.reverse_map[backing]
    }

    // Read-through accessors: translate local to backing and forward.

    pub fn node_height(&self, backing: &BasicTree, local: usize) -> f64 {
        backing.node_height(self.backing_node(local))
    }

    pub fn node_taxon<'a>(&self, backing: &'a BasicTree, local: usize) -> Option<&'a str> {
        backing.node_taxon(self.backing_node(local))
    }

    pub fn node_rate(&self, backing: &BasicTree, local: usize) -> f64 {
        backing.node_rate(self.backing_node(local))
    }

    pub fn node_attribute(&self, backing: &BasicTree, local: usize, name: &str) -> Option<f64> {
        backing.node_attribute(self.backing_node(local), name)
    }

    /// Local parent, or `None` when the parent is outside the mapped subset
    /// (the wrap root's backing parent belongs to the enclosing tree).
    pub fn parent(&self, backing: &BasicTree, local: usize) -> Option<usize> {
        backing
            .parent(self.backing_node(local))
            .and_then(|p| self.local_node(p))
    }

    pub fn child_count(&self, backing: &BasicTree, local: usize) -> usize {
        if self.is_external(local) {
            return 0;
        }
        backing.child_count(self.backing_node(local))
    }

    pub fn child(&self, backing: &BasicTree, local: usize, i: usize) -> usize {
        let c = backing.child(self.backing_node(local), i);
        self.local_node(c)
            .expect("child of a mapped internal node must be mapped")
    }

    // Mutation forwarding supported at this layer. Height mutation belongs to
    // the editable subtree layer; branch lengths cannot be set at all.

    pub fn set_node_rate(&self, backing: &mut BasicTree, local: usize, rate: f64) {
        backing.set_node_rate(self.backing_node(local), rate);
    }

    pub fn set_node_attribute(
        &self,
        backing: &mut BasicTree,
        local: usize,
        name: &str,
        value: f64,
    ) {
        backing.set_node_attribute(self.backing_node(local), name, value);
    }

    pub fn set_branch_length(&self, _local: usize, _length: f64) -> Result<()> {
        Err(CladecastError::Unsupported(
            "wrapped trees cannot have branch lengths set".into(),
        ))
    }

    /// Repoint the maps when a mapped backing node changes identity.
    ///
    /// Used when a subtree's root moves: the local index stays, the backing
    /// node behind it changes.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) {
        let local = self.reverse_map[old]
            .take()
            .expect("replace_node: old node is not mapped");
        self.node_map[local] = new;
        self.reverse_map[new] = Some(local);
    }

    /// Remap a backing-tree change event into local space.
    ///
    /// Events for nodes outside the mapped subset are dropped.
    pub fn map_event(&self, event: TreeChangedEvent) -> Option<TreeChangedEvent> {
        self.local_node(event.node).map(|local| TreeChangedEvent {
            node: local,
            height_changed: event.height_changed,
        })
    }

    /// Checkpoint both maps.
    pub fn store_state(&mut self) {
        self.stored_node_map.copy_from_slice(&self.node_map);
        self.stored_reverse_map.copy_from_slice(&self.reverse_map);
    }

    /// Swap back to the last checkpoint (no reallocation).
    pub fn restore_state(&mut self) {
        std::mem::swap(&mut self.node_map, &mut self.stored_node_map);
        std::mem::swap(&mut self.reverse_map, &mut self.stored_reverse_map);
    }
}
