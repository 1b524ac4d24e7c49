//! Constrained phylogenetic trees and importance-sampled genealogies.
//!
//! `cladecast` models a rooted time tree whose topology is pinned to a set of
//! clade constraints, and reconstructs genealogies compatible with those
//! constraints by stochastic importance sampling:
//!
//! - **Backing trees** — [`BasicTree`] arena storage with edit transactions and O(1) store/restore
//! - **Wrapped views** — [`WrappedTree`] and [`Subtree`] address a monophyletic node subset as a tree of its own
//! - **Constrained forests** — [`ConstrainedTree`] partitions a backing tree into clade-pinned subtrees
//! - **Operator dispatch** — [`ConstrainedOperatorDispatch`] routes topology proposals to subtrees by their freedom
//! - **Genealogy sampling** — [`ConstrainedImportanceSampler`] and [`propose_genealogy`] rebuild genealogies under a mutation-clock/coalescent process with per-sample importance weights

pub mod constrained;
pub mod dispatch;
pub mod error;
pub mod intervals;
pub mod rng;
pub mod sampler;
pub mod subtree;
pub mod tree;
pub mod wrapped;

pub use constrained::{ConstrainedTree, Constraint};
pub use dispatch::{ConstrainedOperatorDispatch, SubtreeOperator};
pub use error::{CladecastError, Result};
pub use intervals::{IntervalList, PiecewiseConstantPopulation};
pub use rng::Xorshift64;
pub use sampler::{
    propose_genealogy, BranchLengthProvider, ConstantMutations, ConstrainedImportanceSampler,
};
pub use subtree::Subtree;
pub use tree::{BasicTree, MutableTree, NodeId, Tree, TreeChangedEvent};
pub use wrapped::WrappedTree;
