//! Editable wrapped subtrees.
//!
//! A [`Subtree`] is a [`WrappedTree`] plus topology mutation local to the
//! wrapped subset. It tracks its own root, which may or may not coincide with
//! the backing tree's root: when it does not, the subtree hangs below a
//! subtending attachment node owned by the enclosing subtree, and moving the
//! root means detaching and re-attaching the backing subtree while the
//! enclosing subtree repoints its maps.
//!
//! All methods take the backing tree as an explicit argument; a subtree never
//! holds a reference to another tree, only indices.

use crate::error::{CladecastError, Result};
use crate::tree::{BasicTree, MutableTree, NodeId, Tree};
use crate::wrapped::WrappedTree;

/// An editable view over one monophyletic cell of a constrained tree.
#[derive(Debug, Clone)]
pub struct Subtree {
    wrapped: WrappedTree,
    index: usize,
    parent: Option<usize>,
    root: usize,
    stored_root: usize,
    /// Backing attachment point while a root move is in flight; the subtree
    /// is invalid (half-detached) whenever this is set.
    subtending_node: Option<NodeId>,
}

impl Subtree {
    /// Wrap the subtree spanned by `tips` as forest member `index`.
    pub fn new(backing: &BasicTree, tips: &[NodeId], index: usize) -> Result<Self> {
        let wrapped = WrappedTree::new(backing, tips)?;
        let root = wrapped.external_node_count();
        Ok(Self {
            wrapped,
            index,
            parent: None,
            root,
            stored_root: root,
            subtending_node: None,
        })
    }

    /// Index of this subtree within its forest.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Index of the enclosing subtree, if any.
    pub fn parent_tree(&self) -> Option<usize> {
        self.parent
    }

    pub(crate) fn set_parent_tree(&mut self, parent: usize) {
        self.parent = Some(parent);
    }

    /// The wrapped index layer.
    pub fn wrapped(&self) -> &WrappedTree {
        &self.wrapped
    }

    /// Local index currently playing root.
    pub fn root(&self) -> usize {
        self.root
    }

    /// Backing-tree id of the current root.
    pub fn backing_root(&self) -> NodeId {
        self.wrapped.backing_node(self.root)
    }

    pub fn is_root(&self, local: usize) -> bool {
        local == self.root
    }

    /// True iff this subtree's root is also the backing tree's root, so a
    /// root move can be forwarded directly.
    pub fn equivalent_roots(&self, backing: &BasicTree) -> bool {
        self.backing_root() == backing.root()
    }

    /// False while a root move is half-applied (`subtending_node` recorded).
    pub fn is_tree_valid(&self) -> bool {
        self.subtending_node.is_none()
    }

    pub fn node_count(&self) -> usize {
        self.wrapped.node_count()
    }

    pub fn external_node_count(&self) -> usize {
        self.wrapped.external_node_count()
    }

    pub fn internal_node_count(&self) -> usize {
        self.wrapped.internal_node_count()
    }

    pub fn is_external(&self, local: usize) -> bool {
        self.wrapped.is_external(local)
    }

    pub fn node_height(&self, backing: &BasicTree, local: usize) -> f64 {
        self.wrapped.node_height(backing, local)
    }

    /// Local parent of a node; the root has none within this subtree.
    pub fn parent(&self, backing: &BasicTree, local: usize) -> Option<usize> {
        debug_assert!(self.is_tree_valid());
        if self.is_root(local) {
            return None;
        }
        self.wrapped.parent(backing, local)
    }

    pub fn child_count(&self, backing: &BasicTree, local: usize) -> usize {
        debug_assert!(self.is_tree_valid());
        self.wrapped.child_count(backing, local)
    }

    pub fn child(&self, backing: &BasicTree, local: usize, i: usize) -> usize {
        debug_assert!(self.is_tree_valid());
        self.wrapped.child(backing, local, i)
    }

    // Topology mutation: translate both endpoints to backing ids and forward.

    /// Attach `child` under `parent`.
    ///
    /// If `child` is this subtree's root and still attached to a subtending
    /// node in the backing tree, it is detached first.
    pub fn add_child(&self, backing: &mut BasicTree, parent: usize, child: usize) -> Result<()> {
        let backing_parent = self.wrapped.backing_node(parent);
        let backing_child = self.wrapped.backing_node(child);
        if self.is_root(child) {
            if let Some(attachment) = backing.parent(backing_child) {
                backing.remove_child(attachment, backing_child)?;
            }
        }
        backing.add_child(backing_parent, backing_child)
    }

    pub fn remove_child(&self, backing: &mut BasicTree, parent: usize, child: usize) -> Result<()> {
        backing.remove_child(
            self.wrapped.backing_node(parent),
            self.wrapped.backing_node(child),
        )
    }

    pub fn replace_child(
        &self,
        backing: &mut BasicTree,
        parent: usize,
        child: usize,
        new_child: usize,
    ) -> Result<()> {
        backing.replace_child(
            self.wrapped.backing_node(parent),
            self.wrapped.backing_node(child),
            self.wrapped.backing_node(new_child),
        )
    }

    /// Non-notifying attach used inside the sampler's event loop.
    pub fn add_child_quietly(
        &self,
        backing: &mut BasicTree,
        parent: usize,
        child: usize,
    ) -> Result<()> {
        backing.add_child_quietly(
            self.wrapped.backing_node(parent),
            self.wrapped.backing_node(child),
        )
    }

    pub fn remove_child_quietly(
        &self,
        backing: &mut BasicTree,
        parent: usize,
        child: usize,
    ) -> Result<()> {
        backing.remove_child_quietly(
            self.wrapped.backing_node(parent),
            self.wrapped.backing_node(child),
        )
    }

    pub fn set_node_height(&self, backing: &mut BasicTree, local: usize, height: f64) {
        backing.set_node_height(self.wrapped.backing_node(local), height);
    }

    pub fn set_node_height_quietly(&self, backing: &mut BasicTree, local: usize, height: f64) {
        backing.set_node_height_quietly(self.wrapped.backing_node(local), height);
    }

    pub fn set_node_rate(&self, backing: &mut BasicTree, local: usize, rate: f64) {
        self.wrapped.set_node_rate(backing, local, rate);
    }

    pub fn set_node_attribute(
        &self,
        backing: &mut BasicTree,
        local: usize,
        name: &str,
        value: f64,
    ) {
        self.wrapped.set_node_attribute(backing, local, name, value);
    }

    /// Repoint this subtree's maps when a tip node changes identity (the
    /// root of an enclosed subtree moved).
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) {
        self.wrapped.replace_node(old, new);
    }

    /// Make `new_root` this subtree's root.
    ///
    /// When the current root is also the backing root the move forwards
    /// directly. Otherwise the old root's backing subtree is detached from
    /// its attachment point, the enclosing subtree repoints its tip map from
    /// the old to the new backing root, and the new root is re-attached under
    /// the recorded attachment point. The subtree is invalid between detach
    /// and re-attach.
    ///
    /// `parent_tree` must be the enclosing subtree whenever
    /// `equivalent_roots` is false.
    pub fn set_root(
        &mut self,
        backing: &mut BasicTree,
        parent_tree: Option<&mut Subtree>,
        new_root: usize,
    ) -> Result<()> {
        if new_root == self.root {
            return Ok(());
        }
        let old_backing = self.backing_root();
        let new_backing = self.wrapped.backing_node(new_root);

        if self.equivalent_roots(backing) {
            backing.set_root(new_backing)?;
            self.root = new_root;
            return Ok(());
        }

        let parent_tree = parent_tree.ok_or_else(|| {
            CladecastError::InvalidInput(
                "root move below the backing root needs the enclosing subtree".into(),
            )
        })?;
        debug_assert_eq!(Some(parent_tree.index()), self.parent);

        let attachment = backing.parent(old_backing).ok_or_else(|| {
            CladecastError::Internal(format!(
                "subtree {} root {} has no attachment point",
                self.index, old_backing
            ))
        })?;
        backing.remove_child(attachment, old_backing)?;
        self.subtending_node = Some(attachment);

        parent_tree.replace_node(old_backing, new_backing);

        if let Some(p) = backing.parent(new_backing) {
            backing.remove_child(p, new_backing)?;
        }
        backing.add_child(attachment, new_backing)?;
        self.subtending_node = None;
        self.root = new_root;
        Ok(())
    }

    /// Checkpoint the root; the index maps are checkpointed one layer down.
    pub fn store_state(&mut self) {
        self.wrapped.store_state();
        self.stored_root = self.root;
    }

    pub fn restore_state(&mut self) {
        self.wrapped.restore_state();
        self.root = self.stored_root;
    }
}
