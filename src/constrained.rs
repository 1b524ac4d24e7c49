//! Constrained trees: a backing tree partitioned into a forest of subtrees.
//!
//! A [`ConstrainedTree`] owns a [`BasicTree`] and a set of [`Subtree`] views
//! that partition its nodes, pinned to the clades of a constraints
//! description. Topology may only be rearranged *within* a subtree, so every
//! constrained clade stays monophyletic no matter what an operator does; node
//! heights are unconstrained and forward straight to the backing tree.
//!
//! Each subtree's root doubles as an external node of its enclosing subtree.
//! Two lookup arrays resolve the ambiguity in O(1): `node_to_subtree` answers
//! "which subtree owns this node" (a subtree root belongs to its own
//! subtree), `node_to_tip_subtree` answers "which subtree sees this node as a
//! tip" (a subtree root is a tip of its parent).

use crate::error::{CladecastError, Result};
use crate::subtree::Subtree;
use crate::tree::{BasicTree, MutableTree, NodeId, Tree, TreeChangedEvent};

/// A multifurcating clade description used to build a [`ConstrainedTree`].
///
/// Leaves name taxa of the backing tree; internal nodes declare clades that
/// must exist, monophyletically, in the backing tree.
#[derive(Debug, Clone)]
pub enum Constraint {
    Taxon(String),
    Clade(Vec<Constraint>),
}

impl Constraint {
    pub fn taxon(name: &str) -> Self {
        Constraint::Taxon(name.to_string())
    }

    pub fn clade(children: Vec<Constraint>) -> Self {
        Constraint::Clade(children)
    }
}

/// A backing tree plus the subtree forest that constrains its topology.
#[derive(Debug, Clone)]
pub struct ConstrainedTree {
    backing: BasicTree,
    subtrees: Vec<Subtree>,
    node_to_subtree: Vec<usize>,
    node_to_tip_subtree: Vec<usize>,
    stored_node_to_tip_subtree: Vec<usize>,
}

const UNASSIGNED: usize = usize::MAX;

impl ConstrainedTree {
    /// Partition `backing` according to `constraints`.
    ///
    /// Each internal constraints node becomes one subtree whose tips are the
    /// backing equivalents of that node's children. Clades are matched by
    /// most recent common ancestor; a constraints clade that is not
    /// monophyletic in the backing tree, an unknown taxon, or a constraints
    /// tree that does not cover every backing node is `InvalidInput`.
    pub fn new(backing: BasicTree, constraints: &Constraint) -> Result<Self> {
        let mut subtrees = Vec::new();
        let (_, root_subtree) = Self::build_subtree(&backing, constraints, &mut subtrees)?;
        if root_subtree.is_none() {
            return Err(CladecastError::InvalidInput(
                "constraints must have a clade at the top level".into(),
            ));
        }
        Self::from_parts(backing, subtrees)
    }

    /// Assemble from an already-built subtree forest.
    ///
    /// The forest must cover every backing node exactly once; parent links on
    /// the subtrees are taken as given.
    pub fn from_parts(backing: BasicTree, subtrees: Vec<Subtree>) -> Result<Self> {
        let (node_to_subtree, node_to_tip_subtree) = Self::build_maps(&backing, &subtrees)?;
        Ok(Self {
            backing,
            subtrees,
            stored_node_to_tip_subtree: node_to_tip_subtree.clone(),
            node_to_subtree,
            node_to_tip_subtree,
        })
    }

    /// Recursive descent: children first, so parent links can point at
    /// already-created subtrees. Returns the backing node this constraint
    /// maps to and, for clades, the index of the subtree created for it.
    fn build_subtree(
        backing: &BasicTree,
        constraint: &Constraint,
        subtrees: &mut Vec<Subtree>,
    ) -> Result<(NodeId, Option<usize>)> {
        match constraint {
            Constraint::Taxon(name) => {
                let tip = (0..backing.external_node_count())
                    .find(|&n| backing.node_taxon(n) == Some(name.as_str()))
                    .ok_or_else(|| {
                        CladecastError::InvalidInput(format!(
                            "constraint names unknown taxon {:?}",
                            name
                        ))
                    })?;
                Ok((tip, None))
            }
            Constraint::Clade(children) => {
                if children.len() < 2 {
                    return Err(CladecastError::InvalidInput(
                        "a constrained clade needs at least two children".into(),
                    ));
                }
                let mut tips = Vec::with_capacity(children.len());
                let mut child_subtrees = Vec::new();
                for child in children {
                    let (node, subtree) = Self::build_subtree(backing, child, subtrees)?;
                    tips.push(node);
                    if let Some(s) = subtree {
                        child_subtrees.push(s);
                    }
                }
                let index = subtrees.len();
                // Subtree construction is the monophyly check: it fails if
                // any backing external below the MRCA is not spanned.
                let subtree = Subtree::new(backing, &tips, index)?;
                let root = subtree.backing_root();
                subtrees.push(subtree);
                for s in child_subtrees {
                    subtrees[s].set_parent_tree(index);
                }
                Ok((root, Some(index)))
            }
        }
    }

    fn build_maps(
        backing: &BasicTree,
        subtrees: &[Subtree],
    ) -> Result<(Vec<usize>, Vec<usize>)> {
        let n = backing.node_count();
        let mut node_to_subtree = vec![UNASSIGNED; n];
        let mut node_to_tip_subtree = vec![UNASSIGNED; n];

        for (index, subtree) in subtrees.iter().enumerate() {
            let wrapped = subtree.wrapped();
            for local in 0..wrapped.node_count() {
                let node = wrapped.backing_node(local);
                if wrapped.is_external(local) {
                    if node_to_tip_subtree[node] != UNASSIGNED {
                        return Err(CladecastError::InvalidInput(format!(
                            "node {} is a tip of more than one subtree",
                            node
                        )));
                    }
                    node_to_tip_subtree[node] = index;
                    if backing.is_external(node) {
                        node_to_subtree[node] = index;
                    }
                } else {
                    if node_to_subtree[node] != UNASSIGNED {
                        return Err(CladecastError::InvalidInput(format!(
                            "node {} belongs to more than one subtree",
                            node
                        )));
                    }
                    node_to_subtree[node] = index;
                }
            }
        }

        for node in 0..n {
            if node_to_subtree[node] == UNASSIGNED {
                return Err(CladecastError::InvalidInput(format!(
                    "node {} is not covered by any subtree",
                    node
                )));
            }
            // Regular nodes and the overall root act as tips of their own
            // subtree for lookup purposes.
            if node_to_tip_subtree[node] == UNASSIGNED {
                node_to_tip_subtree[node] = node_to_subtree[node];
            }
        }
        Ok((node_to_subtree, node_to_tip_subtree))
    }

    pub fn backing(&self) -> &BasicTree {
        &self.backing
    }

    pub fn subtree_count(&self) -> usize {
        self.subtrees.len()
    }

    pub fn subtree(&self, index: usize) -> &Subtree {
        &self.subtrees[index]
    }

    /// Subtree owning `node` (a subtree root belongs to its own subtree).
    pub fn subtree_of(&self, node: NodeId) -> usize {
        self.node_to_subtree[node]
    }

    /// Subtree that sees `node` as one of its tips (a subtree root is a tip
    /// of its enclosing subtree; the overall root is its own).
    pub fn tip_subtree_of(&self, node: NodeId) -> usize {
        self.node_to_tip_subtree[node]
    }

    // Structural edits forward through a named subtree; the subtree
    // translates its local indices to backing ids.

    pub fn subtree_add_child(&mut self, index: usize, parent: usize, child: usize) -> Result<()> {
        self.subtrees[index].add_child(&mut self.backing, parent, child)
    }

    pub fn subtree_remove_child(
        &mut self,
        index: usize,
        parent: usize,
        child: usize,
    ) -> Result<()> {
        self.subtrees[index].remove_child(&mut self.backing, parent, child)
    }

    pub fn subtree_replace_child(
        &mut self,
        index: usize,
        parent: usize,
        child: usize,
        new_child: usize,
    ) -> Result<()> {
        self.subtrees[index].replace_child(&mut self.backing, parent, child, new_child)
    }

    pub fn subtree_add_child_quietly(
        &mut self,
        index: usize,
        parent: usize,
        child: usize,
    ) -> Result<()> {
        self.subtrees[index].add_child_quietly(&mut self.backing, parent, child)
    }

    pub fn subtree_remove_child_quietly(
        &mut self,
        index: usize,
        parent: usize,
        child: usize,
    ) -> Result<()> {
        self.subtrees[index].remove_child_quietly(&mut self.backing, parent, child)
    }

    pub fn subtree_set_node_height(&mut self, index: usize, local: usize, height: f64) {
        self.subtrees[index].set_node_height(&mut self.backing, local, height);
    }

    pub fn subtree_set_node_height_quietly(&mut self, index: usize, local: usize, height: f64) {
        self.subtrees[index].set_node_height_quietly(&mut self.backing, local, height);
    }

    /// Move a subtree's root, mediating between it and its enclosing subtree.
    pub fn set_subtree_root(&mut self, index: usize, new_root: usize) -> Result<()> {
        let old_backing = self.subtrees[index].backing_root();
        match self.subtrees[index].parent_tree() {
            Some(parent) => {
                let (subtree, parent_tree) = two_mut(&mut self.subtrees, index, parent);
                subtree.set_root(&mut self.backing, Some(parent_tree), new_root)?;
            }
            None => {
                self.subtrees[index].set_root(&mut self.backing, None, new_root)?;
            }
        }
        // The tip-context of the moved root changes hands.
        let new_backing = self.subtrees[index].backing_root();
        if new_backing != old_backing {
            self.node_to_tip_subtree[new_backing] = self.node_to_tip_subtree[old_backing];
            self.node_to_tip_subtree[old_backing] = index;
        }
        Ok(())
    }

    /// Erase all backing edges so a sampler can rebuild the genealogy.
    ///
    /// Only valid inside an edit transaction; the tree is structurally
    /// invalid until every subtree is relinked.
    pub fn clear_topology(&mut self) -> Result<()> {
        self.backing.clear_topology()
    }

    /// Copy the genealogy of another constrained tree over the same backing
    /// shape, emitting change events for every node.
    pub fn adopt_structure(&mut self, other: &ConstrainedTree) -> Result<()> {
        self.backing.adopt_structure(&other.backing)
    }

    /// Checkpoint the backing tree, every subtree, and the lookup arrays.
    pub fn store_state(&mut self) {
        self.backing.store_state();
        for subtree in &mut self.subtrees {
            subtree.store_state();
        }
        self.stored_node_to_tip_subtree
            .copy_from_slice(&self.node_to_tip_subtree);
    }

    pub fn restore_state(&mut self) {
        self.backing.restore_state();
        for subtree in &mut self.subtrees {
            subtree.restore_state();
        }
        std::mem::swap(
            &mut self.node_to_tip_subtree,
            &mut self.stored_node_to_tip_subtree,
        );
    }
}

/// Distinct mutable borrows of two vector slots.
fn two_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b, "cannot borrow the same subtree twice");
    if a < b {
        let (lo, hi) = items.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = items.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

impl Tree for ConstrainedTree {
    fn node_count(&self) -> usize {
        self.backing.node_count()
    }

    fn external_node_count(&self) -> usize {
        self.backing.external_node_count()
    }

    fn internal_node_count(&self) -> usize {
        self.backing.internal_node_count()
    }

    fn root(&self) -> NodeId {
        self.backing.root()
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.backing.parent(node)
    }

    fn child_count(&self, node: NodeId) -> usize {
        self.backing.child_count(node)
    }

    fn child(&self, node: NodeId, i: usize) -> NodeId {
        self.backing.child(node, i)
    }

    fn node_height(&self, node: NodeId) -> f64 {
        self.backing.node_height(node)
    }

    fn node_taxon(&self, node: NodeId) -> Option<&str> {
        self.backing.node_taxon(node)
    }
}

impl MutableTree for ConstrainedTree {
    fn begin_edit(&mut self) {
        self.backing.begin_edit();
    }

    fn end_edit(&mut self) -> Vec<TreeChangedEvent> {
        self.backing.end_edit()
    }

    fn end_edit_quietly(&mut self) {
        self.backing.end_edit_quietly();
    }

    // Top-level topology edits would bypass the clade constraints; they must
    // go through a subtree.

    fn add_child(&mut self, _parent: NodeId, _child: NodeId) -> Result<()> {
        Err(CladecastError::Unsupported(
            "constrained trees only allow topology edits through a subtree".into(),
        ))
    }

    fn remove_child(&mut self, _parent: NodeId, _child: NodeId) -> Result<()> {
        Err(CladecastError::Unsupported(
            "constrained trees only allow topology edits through a subtree".into(),
        ))
    }

    fn replace_child(&mut self, _parent: NodeId, _child: NodeId, _new: NodeId) -> Result<()> {
        Err(CladecastError::Unsupported(
            "constrained trees only allow topology edits through a subtree".into(),
        ))
    }

    fn set_root(&mut self, _node: NodeId) -> Result<()> {
        Err(CladecastError::Unsupported(
            "constrained trees only allow root moves through a subtree".into(),
        ))
    }

    fn set_node_height(&mut self, node: NodeId, height: f64) {
        self.backing.set_node_height(node, height);
    }

    fn set_node_height_quietly(&mut self, node: NodeId, height: f64) {
        self.backing.set_node_height_quietly(node, height);
    }

    fn set_node_rate(&mut self, node: NodeId, rate: f64) {
        self.backing.set_node_rate(node, rate);
    }

    fn set_node_attribute(&mut self, node: NodeId, name: &str, value: f64) {
        self.backing.set_node_attribute(node, name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// (((A,B),(C,D)),E): internals 5=AB, 6=CD, 7=ABCD, 8=root.
    fn five_tip_tree() -> BasicTree {
        let mut tree = BasicTree::new(&[
            ("A", 0.0),
            ("B", 0.0),
            ("C", 0.0),
            ("D", 0.0),
            ("E", 0.0),
        ])
        .unwrap();
        let ab = tree.join(0, 1, 1.0).unwrap();
        let cd = tree.join(2, 3, 1.2).unwrap();
        let abcd = tree.join(ab, cd, 2.0).unwrap();
        tree.join(abcd, 4, 3.0).unwrap();
        tree
    }

    fn ab_clade() -> Constraint {
        Constraint::clade(vec![Constraint::taxon("A"), Constraint::taxon("B")])
    }

    /// ((A,B),C,D,E): one nested clade, the rest free at the top level.
    fn loose_constraints() -> Constraint {
        Constraint::clade(vec![
            ab_clade(),
            Constraint::taxon("C"),
            Constraint::taxon("D"),
            Constraint::taxon("E"),
        ])
    }

    #[test]
    fn construction_partitions_every_node() {
        let tree = ConstrainedTree::new(five_tip_tree(), &loose_constraints()).unwrap();
        assert_eq!(tree.subtree_count(), 2);
        // Children-first: the AB subtree is index 0, the top-level one is 1.
        assert_eq!(tree.subtree(0).backing_root(), 5);
        assert_eq!(tree.subtree(1).backing_root(), 8);
        assert_eq!(tree.subtree(0).parent_tree(), Some(1));
        assert_eq!(tree.subtree(1).parent_tree(), None);
        // Every backing node resolves to exactly one owning subtree.
        for node in 0..tree.node_count() {
            assert!(tree.subtree_of(node) < tree.subtree_count());
        }
        assert_eq!(tree.subtree_of(0), 0);
        assert_eq!(tree.subtree_of(5), 0);
        assert_eq!(tree.subtree_of(6), 1);
        assert_eq!(tree.subtree_of(8), 1);
    }

    #[test]
    fn tip_context_lookup() {
        let tree = ConstrainedTree::new(five_tip_tree(), &loose_constraints()).unwrap();
        // The AB root is a tip of the enclosing subtree.
        assert_eq!(tree.tip_subtree_of(5), 1);
        // Regular nodes and the overall root resolve to their own subtree.
        assert_eq!(tree.tip_subtree_of(0), 0);
        assert_eq!(tree.tip_subtree_of(6), 1);
        assert_eq!(tree.tip_subtree_of(8), 1);
    }

    #[test]
    fn non_monophyletic_constraint_fails() {
        let constraints = Constraint::clade(vec![
            Constraint::clade(vec![Constraint::taxon("A"), Constraint::taxon("C")]),
            Constraint::taxon("B"),
            Constraint::taxon("D"),
            Constraint::taxon("E"),
        ]);
        let err = ConstrainedTree::new(five_tip_tree(), &constraints).unwrap_err();
        assert!(matches!(err, CladecastError::InvalidInput(_)));
    }

    #[test]
    fn unknown_taxon_fails() {
        let constraints = Constraint::clade(vec![
            Constraint::taxon("A"),
            Constraint::taxon("Z"),
        ]);
        let err = ConstrainedTree::new(five_tip_tree(), &constraints).unwrap_err();
        assert!(matches!(err, CladecastError::InvalidInput(_)));
    }

    #[test]
    fn incomplete_coverage_fails() {
        // Constraints span only {A, B}; the rest of the backing tree is
        // never covered.
        let err = ConstrainedTree::new(five_tip_tree(), &ab_clade()).unwrap_err();
        assert!(matches!(err, CladecastError::InvalidInput(_)));
    }

    #[test]
    fn top_level_topology_edits_unsupported() {
        let mut tree = ConstrainedTree::new(five_tip_tree(), &loose_constraints()).unwrap();
        tree.begin_edit();
        assert!(matches!(
            tree.add_child(8, 0),
            Err(CladecastError::Unsupported(_))
        ));
        assert!(matches!(
            tree.remove_child(8, 7),
            Err(CladecastError::Unsupported(_))
        ));
        assert!(matches!(
            tree.set_root(7),
            Err(CladecastError::Unsupported(_))
        ));
        tree.end_edit_quietly();
    }

    #[test]
    fn heights_forward_to_backing() {
        let mut tree = ConstrainedTree::new(five_tip_tree(), &loose_constraints()).unwrap();
        tree.set_node_height(7, 2.5);
        assert_eq!(tree.node_height(7), 2.5);
        tree.set_node_rate(3, 0.5);
        assert_eq!(tree.backing().node_rate(3), 0.5);
    }

    #[test]
    fn subtree_edits_forward_with_local_indices() {
        let mut tree = ConstrainedTree::new(five_tip_tree(), &loose_constraints()).unwrap();
        // Rearrange inside the top-level subtree: move C from under CD to
        // under ABCD's spare slot after detaching CD's sibling structure.
        let outer = 1;
        let local_cd = tree.subtree(outer).wrapped().local_node(6).unwrap();
        let local_c = tree.subtree(outer).wrapped().local_node(2).unwrap();
        let local_abcd = tree.subtree(outer).wrapped().local_node(7).unwrap();
        tree.begin_edit();
        tree.subtree_remove_child(outer, local_cd, local_c).unwrap();
        tree.subtree_remove_child(outer, local_abcd, local_cd).unwrap();
        tree.subtree_add_child(outer, local_abcd, local_c).unwrap();
        let events = tree.end_edit();
        assert!(!events.is_empty());
        assert_eq!(tree.parent(2), Some(7));
        assert_eq!(tree.parent(6), None);
    }

    #[test]
    fn root_move_updates_tip_context() {
        // Caterpillar (((A,B),C),D) with constraints ((A,B,C),D):
        // inner subtree over {A,B,C} has internals 4 and 5, root 5.
        let mut backing =
            BasicTree::new(&[("A", 0.0), ("B", 0.0), ("C", 0.0), ("D", 0.0)]).unwrap();
        let ab = backing.join(0, 1, 1.0).unwrap();
        let abc = backing.join(ab, 2, 2.0).unwrap();
        backing.join(abc, 3, 3.0).unwrap();
        let constraints = Constraint::clade(vec![
            Constraint::clade(vec![
                Constraint::taxon("A"),
                Constraint::taxon("B"),
                Constraint::taxon("C"),
            ]),
            Constraint::taxon("D"),
        ]);
        let mut tree = ConstrainedTree::new(backing, &constraints).unwrap();
        let inner = 0;
        assert_eq!(tree.subtree(inner).backing_root(), 5);
        assert_eq!(tree.tip_subtree_of(5), 1);
        assert_eq!(tree.tip_subtree_of(4), 0);

        let l4 = tree.subtree(inner).wrapped().local_node(4).unwrap();
        let l5 = tree.subtree(inner).wrapped().local_node(5).unwrap();
        tree.begin_edit();
        // Operator-style rearrangement putting node 4 on top: 4 -> {5, A},
        // 5 -> {B, C}.
        tree.subtree_remove_child(inner, l4, 0).unwrap();
        tree.subtree_remove_child(inner, l5, l4).unwrap();
        tree.subtree_remove_child(inner, l4, 1).unwrap();
        tree.subtree_add_child(inner, l5, 1).unwrap();
        tree.set_subtree_root(inner, l4).unwrap();
        tree.subtree_add_child(inner, l4, l5).unwrap();
        tree.subtree_add_child(inner, l4, 0).unwrap();
        tree.end_edit_quietly();

        assert_eq!(tree.subtree(inner).backing_root(), 4);
        assert_eq!(tree.parent(4), Some(6));
        // Tip context swapped hands between the old and new root.
        assert_eq!(tree.tip_subtree_of(4), 1);
        assert_eq!(tree.tip_subtree_of(5), 0);
        assert_eq!(tree.subtree(1).wrapped().local_node(4), Some(0));
    }

    #[test]
    fn store_restore_covers_all_layers() {
        let mut backing =
            BasicTree::new(&[("A", 0.0), ("B", 0.0), ("C", 0.0), ("D", 0.0)]).unwrap();
        let ab = backing.join(0, 1, 1.0).unwrap();
        let abc = backing.join(ab, 2, 2.0).unwrap();
        backing.join(abc, 3, 3.0).unwrap();
        let constraints = Constraint::clade(vec![
            Constraint::clade(vec![
                Constraint::taxon("A"),
                Constraint::taxon("B"),
                Constraint::taxon("C"),
            ]),
            Constraint::taxon("D"),
        ]);
        let mut tree = ConstrainedTree::new(backing, &constraints).unwrap();
        tree.store_state();

        let inner = 0;
        let l4 = tree.subtree(inner).wrapped().local_node(4).unwrap();
        let l5 = tree.subtree(inner).wrapped().local_node(5).unwrap();
        tree.begin_edit();
        tree.subtree_remove_child(inner, l4, 0).unwrap();
        tree.subtree_remove_child(inner, l5, l4).unwrap();
        tree.subtree_remove_child(inner, l4, 1).unwrap();
        tree.subtree_add_child(inner, l5, 1).unwrap();
        tree.set_subtree_root(inner, l4).unwrap();
        tree.subtree_add_child(inner, l4, l5).unwrap();
        tree.subtree_add_child(inner, l4, 0).unwrap();
        tree.end_edit_quietly();
        tree.set_node_height(4, 2.5);

        tree.restore_state();
        assert_eq!(tree.subtree(inner).backing_root(), 5);
        assert_eq!(tree.parent(5), Some(6));
        assert_eq!(tree.parent(0), Some(4));
        assert_eq!(tree.node_height(4), 1.0);
        assert_eq!(tree.tip_subtree_of(5), 1);
        assert_eq!(tree.tip_subtree_of(4), 0);
        assert_eq!(tree.subtree(1).wrapped().local_node(5), Some(0));
    }
}
