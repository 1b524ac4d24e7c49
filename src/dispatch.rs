//! Weighted dispatch of topology proposals to constrained subtrees.
//!
//! Operators on a [`ConstrainedTree`] cannot touch the whole tree; they act
//! inside one subtree at a time. [`ConstrainedOperatorDispatch`] picks the
//! subtree for each proposal, weighting by how much topological freedom a
//! subtree actually has: a subtree with `n` internal nodes has `n - 1`
//! rearrangeable edges, so fully resolved (cherry) subtrees get weight zero
//! and are never proposed on.

use crate::constrained::ConstrainedTree;
use crate::error::{CladecastError, Result};
use crate::rng::Xorshift64;

/// A topology proposal strategy confined to one subtree.
///
/// Returns the log Hastings ratio of the proposal.
pub trait SubtreeOperator {
    fn operate(
        &mut self,
        tree: &mut ConstrainedTree,
        subtree: usize,
        rng: &mut Xorshift64,
    ) -> Result<f64>;
}

/// Draws a subtree proportionally to its topological freedom and delegates
/// to the wrapped operator.
#[derive(Debug)]
pub struct ConstrainedOperatorDispatch<O> {
    operator: O,
    weights: Vec<f64>,
    total_weight: f64,
}

impl<O: SubtreeOperator> ConstrainedOperatorDispatch<O> {
    /// # Errors
    ///
    /// Returns `InvalidInput` when every subtree is fully resolved (total
    /// weight zero): there is nothing for a topology operator to do.
    pub fn new(tree: &ConstrainedTree, operator: O) -> Result<Self> {
        let weights: Vec<f64> = (0..tree.subtree_count())
            .map(|i| (tree.subtree(i).internal_node_count() - 1) as f64)
            .collect();
        let total_weight: f64 = weights.iter().sum();
        if total_weight <= 0.0 {
            return Err(CladecastError::InvalidInput(
                "every subtree is fully resolved; no topology to propose on".into(),
            ));
        }
        Ok(Self {
            operator,
            weights,
            total_weight,
        })
    }

    /// Weight-proportional subtree draw.
    pub fn choose_subtree(&self, rng: &mut Xorshift64) -> usize {
        let mut target = rng.next_f64() * self.total_weight;
        for (i, &w) in self.weights.iter().enumerate() {
            if target < w {
                return i;
            }
            target -= w;
        }
        // Floating-point accumulation can walk past the last bucket.
        self.weights.len() - 1
    }

    /// Pick a subtree and run one proposal on it, returning the operator's
    /// log Hastings ratio.
    pub fn operate(&mut self, tree: &mut ConstrainedTree, rng: &mut Xorshift64) -> Result<f64> {
        let subtree = self.choose_subtree(rng);
        self.operator.operate(tree, subtree, rng)
    }
}
