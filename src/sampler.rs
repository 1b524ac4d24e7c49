//! Importance sampling of constrained genealogies.
//!
//! Given a [`ConstrainedTree`], a per-branch expected-mutation provider, and
//! a population-size trajectory, the sampler rebuilds the genealogy from
//! scratch with a discrete-event simulation: sweeping a clock forward from
//! height zero, it activates tips as they are reached, lets lineages
//! accumulate the mutation events their data demand, and coalesces
//! mutation-free lineages within each subtree at the coalescent rate. Every
//! stochastic event contributes a log importance weight relating the proposal
//! to a uniform-across-lineages target, so many independent draws can be
//! combined by weighted resampling.
//!
//! One [`ConstrainedImportanceSampler`] is one worker: it owns a private copy
//! of the tree and its own interval bookkeeping, so a batch of workers can
//! run in parallel with no shared mutable state. [`propose_genealogy`] splits
//! a sample budget across workers, joins them, picks one proportionally to
//! its total weight, and installs the winning genealogy into the live tree.

use std::collections::HashMap;

use crate::constrained::ConstrainedTree;
use crate::error::{CladecastError, Result};
use crate::intervals::{IntervalList, PiecewiseConstantPopulation};
use crate::rng::Xorshift64;
use crate::tree::{MutableTree, NodeId, Tree, TreeChangedEvent};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Expected number of mutation events on the branch above a node.
///
/// Values above `0.5` demand that many (rounded) discrete mutation events
/// before the lineage may coalesce; anything else coalesces freely.
pub trait BranchLengthProvider {
    fn expected_mutations(&self, tree: &ConstrainedTree, node: NodeId) -> f64;
}

/// Map-backed provider; nodes without an entry carry zero mutations.
#[derive(Debug, Clone, Default)]
pub struct ConstantMutations {
    counts: HashMap<NodeId, f64>,
}

impl ConstantMutations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, node: NodeId, count: f64) {
        self.counts.insert(node, count);
    }

    pub fn with_count(mut self, node: NodeId, count: f64) -> Self {
        self.set(node, count);
        self
    }
}

impl BranchLengthProvider for ConstantMutations {
    fn expected_mutations(&self, _tree: &ConstrainedTree, node: NodeId) -> f64 {
        self.counts.get(&node).copied().unwrap_or(0.0)
    }
}

/// Numerically stable `ln(exp(a) + exp(b))`.
pub fn log_sum(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

fn choose2(n: f64) -> f64 {
    n * (n - 1.0) / 2.0
}

/// Signed effect of one applied event on the global bookkeeping.
#[derive(Debug, Clone, Copy)]
struct StateChange {
    mut_delta: i64,
    coal_delta: i64,
    log_event_weight: f64,
}

/// Per-subtree state machine tracking which local nodes still owe mutation
/// events, which are free to coalesce, and which internal nodes are still
/// unused. The free-node stack keeps the subtree root at the bottom so the
/// clade's final coalescence lands on it.
#[derive(Debug)]
struct Clade {
    subtree: usize,
    coalescing: Vec<usize>,
    mutating: HashMap<usize, u32>,
    node_stack: Vec<usize>,
    complete: bool,
}

impl Clade {
    fn new(tree: &ConstrainedTree, subtree: usize) -> Self {
        let sub = tree.subtree(subtree);
        let mut node_stack = Vec::with_capacity(sub.internal_node_count());
        node_stack.push(sub.root());
        for local in sub.external_node_count()..sub.node_count() {
            if local != sub.root() {
                node_stack.push(local);
            }
        }
        Self {
            subtree,
            coalescing: Vec::new(),
            mutating: HashMap::new(),
            node_stack,
            complete: false,
        }
    }

    /// Number of coalescences currently possible in this clade: a lone
    /// coalescing node cannot pair off.
    fn pair_stat(&self) -> i64 {
        (self.coalescing.len() as i64 - 1).max(0)
    }
}

fn remove_from(list: &mut Vec<NodeId>, node: NodeId) -> Result<()> {
    match list.iter().position(|&n| n == node) {
        Some(i) => {
            list.swap_remove(i);
            Ok(())
        }
        None => Err(CladecastError::Internal(format!(
            "node {} missing from the available pool",
            node
        ))),
    }
}

/// One sampling worker: a private tree copy, its interval records, and the
/// event-loop state for the genealogy currently being simulated.
pub struct ConstrainedImportanceSampler<'a, B> {
    tree: ConstrainedTree,
    intervals: IntervalList,
    active_intervals: IntervalList,
    provider: &'a B,
    population: &'a PiecewiseConstantPopulation,
    scaled_mutation_rate: f64,
    samples: usize,
    /// External nodes ordered by increasing height.
    sampled_tips: Vec<NodeId>,
    total_coalescent_events: usize,

    clades: Vec<Clade>,
    available_nodes: Vec<NodeId>,
    active_node_count: i64,
    current_tip: usize,
    coalescing_node_stat: i64,
    mutating_node_count: i64,
    simulated_coalescent_events: usize,
    current_grid_point: usize,
    current_log_weight: f64,
    theta: f64,
}

impl<'a, B: BranchLengthProvider> ConstrainedImportanceSampler<'a, B> {
    pub fn new(
        tree: &ConstrainedTree,
        provider: &'a B,
        population: &'a PiecewiseConstantPopulation,
        scaled_mutation_rate: f64,
        samples: usize,
    ) -> Result<Self> {
        if samples == 0 {
            return Err(CladecastError::InvalidInput(
                "sampler needs at least one sample".into(),
            ));
        }
        if !(scaled_mutation_rate >= 0.0) {
            return Err(CladecastError::InvalidInput(
                "scaled mutation rate must be non-negative".into(),
            ));
        }
        let tree = tree.clone();
        let mut sampled_tips: Vec<NodeId> = (0..tree.external_node_count()).collect();
        sampled_tips.sort_by(|&a, &b| tree.node_height(a).total_cmp(&tree.node_height(b)));
        let total_coalescent_events = tree.internal_node_count();
        Ok(Self {
            tree,
            intervals: IntervalList::new(),
            active_intervals: IntervalList::new(),
            provider,
            population,
            scaled_mutation_rate,
            samples,
            sampled_tips,
            total_coalescent_events,
            clades: Vec::new(),
            available_nodes: Vec::new(),
            active_node_count: 0,
            current_tip: 0,
            coalescing_node_stat: 0,
            mutating_node_count: 0,
            simulated_coalescent_events: 0,
            current_grid_point: 0,
            current_log_weight: 0.0,
            theta: 0.0,
        })
    }

    /// The retained genealogy after [`ConstrainedImportanceSampler::sample_tree`].
    pub fn tree(&self) -> &ConstrainedTree {
        &self.tree
    }

    /// Interval records of the retained genealogy.
    pub fn intervals(&self) -> &IntervalList {
        &self.intervals
    }

    fn into_parts(self) -> (ConstrainedTree, IntervalList) {
        (self.tree, self.intervals)
    }

    /// Draw `samples` genealogies, retaining one by streaming weighted
    /// resampling, and return the total log weight of the batch.
    ///
    /// Each new draw replaces the retained one with probability
    /// `exp(w_new - running_log_sum)`; the first draw is always retained, so
    /// the final restore always has a checkpoint to return to.
    pub fn sample_tree(&mut self, rng: &mut Xorshift64) -> Result<f64> {
        let mut total_log_weight = f64::NEG_INFINITY;
        for i in 0..self.samples {
            self.sample_next_tree(rng)?;
            total_log_weight = if i == 0 {
                self.current_log_weight
            } else {
                log_sum(total_log_weight, self.current_log_weight)
            };
            if rng.next_f64().ln() < self.current_log_weight - total_log_weight {
                self.tree.store_state();
                self.intervals.copy_from(&self.active_intervals);
            }
        }
        self.tree.restore_state();
        Ok(total_log_weight)
    }

    /// Simulate one complete genealogy in place.
    fn sample_next_tree(&mut self, rng: &mut Xorshift64) -> Result<()> {
        self.tree.begin_edit();
        self.setup()?;

        let mut current_height = 0.0;
        self.set_current_height(current_height)?;

        // Nothing stochastic can happen until some lineage can act; jump
        // straight to activation heights.
        while self.coalescing_node_stat < 1 && self.mutating_node_count < 1 {
            current_height = self.finite_height(self.minimum_inactive_height())?;
            self.set_current_height(current_height)?;
        }

        while !self.done() {
            let (wait, node) = self.next_event(rng)?;
            if current_height + wait > self.next_fixed_event_height() {
                // The draw crossed a boundary; the boundary wins and the
                // event is discarded, not deferred.
                current_height = self.finite_height(self.next_fixed_event_height())?;
                self.set_current_height(current_height)?;
            } else {
                current_height += wait;
                self.apply_event(node, current_height, rng)?;
            }
            if !self.done() {
                while self.coalescing_node_stat < 1 && self.mutating_node_count < 1 {
                    current_height = self.finite_height(self.next_fixed_event_height())?;
                    self.set_current_height(current_height)?;
                }
            }
        }

        if self.clades.iter().any(|c| !c.complete) {
            return Err(CladecastError::Internal(
                "simulation finished with an incomplete clade".into(),
            ));
        }
        if !self.available_nodes.is_empty()
            || self.active_node_count != 0
            || self.coalescing_node_stat != 0
            || self.mutating_node_count != 0
            || self.current_tip != self.tree.external_node_count()
        {
            return Err(CladecastError::Internal(
                "simulation finished with non-empty transient state".into(),
            ));
        }

        self.tree.end_edit_quietly();
        Ok(())
    }

    fn setup(&mut self) -> Result<()> {
        self.current_log_weight = 0.0;
        self.tree.clear_topology()?;
        self.clades = (0..self.tree.subtree_count())
            .map(|i| Clade::new(&self.tree, i))
            .collect();
        self.available_nodes.clear();
        self.active_node_count = 0;
        self.current_tip = 0;
        self.coalescing_node_stat = 0;
        self.mutating_node_count = 0;
        self.simulated_coalescent_events = 0;
        self.current_grid_point = 0;
        self.active_intervals.reset();
        Ok(())
    }

    fn done(&self) -> bool {
        self.simulated_coalescent_events == self.total_coalescent_events
    }

    fn update_state(&mut self, change: StateChange) {
        self.mutating_node_count += change.mut_delta;
        self.coalescing_node_stat += change.coal_delta;
        self.current_log_weight += change.log_event_weight;
    }

    fn minimum_inactive_height(&self) -> f64 {
        if self.current_tip < self.sampled_tips.len() {
            self.tree.node_height(self.sampled_tips[self.current_tip])
        } else {
            f64::INFINITY
        }
    }

    fn next_grid_point(&self) -> f64 {
        if self.current_grid_point < self.population.grid_point_count() {
            self.population.grid_point(self.current_grid_point)
        } else {
            f64::INFINITY
        }
    }

    fn next_fixed_event_height(&self) -> f64 {
        self.minimum_inactive_height().min(self.next_grid_point())
    }

    fn finite_height(&self, height: f64) -> Result<f64> {
        if height.is_finite() {
            Ok(height)
        } else {
            Err(CladecastError::Internal(
                "no fixed event left while lineages cannot act".into(),
            ))
        }
    }

    /// Advance the sweep: activate every tip at or below `height` and move
    /// the population-grid pointer past crossed boundaries.
    fn set_current_height(&mut self, height: f64) -> Result<()> {
        while self.minimum_inactive_height() <= height {
            let node = self.sampled_tips[self.current_tip];
            self.activate_node(node)?;
            self.active_intervals
                .add_sample_event(self.tree.node_height(node), node);
            self.current_tip += 1;
        }
        while self.next_grid_point() <= height {
            self.current_grid_point += 1;
        }
        Ok(())
    }

    /// Activate a backing node as a tip of the clade that sees it as one.
    fn activate_node(&mut self, node: NodeId) -> Result<()> {
        debug_assert!(!self.tree.is_root(node));
        let clade_index = self.tree.tip_subtree_of(node);
        let local = self
            .tree
            .subtree(clade_index)
            .wrapped()
            .local_node(node)
            .ok_or_else(|| {
                CladecastError::Internal(format!("node {} is not a tip of its clade", node))
            })?;
        self.active_node_count += 1;
        let change = self.activate_clade_node(clade_index, local)?;
        self.update_state(change);
        Ok(())
    }

    /// Enter `local` into its clade as mutating or coalescing.
    ///
    /// A node joining an empty or singleton coalescing set is not (yet)
    /// available for events; when the set reaches two, both members become
    /// available.
    fn activate_clade_node(&mut self, clade_index: usize, local: usize) -> Result<StateChange> {
        let backing = self
            .tree
            .subtree(self.clades[clade_index].subtree)
            .wrapped()
            .backing_node(local);
        let expected = self.provider.expected_mutations(&self.tree, backing);
        let clade = &mut self.clades[clade_index];
        if clade.coalescing.contains(&local) || clade.mutating.contains_key(&local) {
            return Err(CladecastError::Internal(format!(
                "node {} activated twice",
                backing
            )));
        }

        if expected > 0.5 {
            clade.mutating.insert(local, 0);
            self.available_nodes.push(backing);
            return Ok(StateChange {
                mut_delta: 1,
                coal_delta: 0,
                log_event_weight: 0.0,
            });
        }

        let old_pairs = clade.pair_stat();
        if !clade.coalescing.is_empty() {
            self.available_nodes.push(backing);
            if clade.coalescing.len() == 1 {
                let lone = self
                    .tree
                    .subtree(clade.subtree)
                    .wrapped()
                    .backing_node(clade.coalescing[0]);
                self.available_nodes.push(lone);
            }
        }
        clade.coalescing.push(local);
        Ok(StateChange {
            mut_delta: 0,
            coal_delta: clade.pair_stat() - old_pairs,
            log_event_weight: 0.0,
        })
    }

    /// Total event rate and a uniformly drawn actor from the available pool.
    fn next_event(&mut self, rng: &mut Xorshift64) -> Result<(f64, NodeId)> {
        let ne = self.population.size_at(self.current_grid_point);
        let a = self.active_node_count as f64;
        let total_mutation_rate = self.scaled_mutation_rate * a;
        self.theta = ne * self.scaled_mutation_rate;
        let total_coalescent_rate = choose2(a) / ne;
        let total_rate = total_mutation_rate + total_coalescent_rate;

        if !(total_rate > 0.0) || !total_rate.is_finite() {
            return Err(CladecastError::Internal(format!(
                "event rate {} with {} pending lineages",
                total_rate, self.active_node_count
            )));
        }
        if self.available_nodes.is_empty() {
            return Err(CladecastError::Internal(
                "no available node despite pending events".into(),
            ));
        }
        let wait = rng.exponential(total_rate);
        let node = self.available_nodes[rng.index(self.available_nodes.len())];
        Ok((wait, node))
    }

    /// Dispatch an event to the acting node's clade; the node's own state
    /// decides whether it mutates or coalesces.
    fn apply_event(&mut self, node: NodeId, height: f64, rng: &mut Xorshift64) -> Result<()> {
        let clade_index = self.tree.tip_subtree_of(node);
        let local = self
            .tree
            .subtree(clade_index)
            .wrapped()
            .local_node(node)
            .ok_or_else(|| {
                CladecastError::Internal(format!("acting node {} is not in its clade", node))
            })?;
        let (change, completed_root) = if self.clades[clade_index].mutating.contains_key(&local) {
            (self.mutate_node(clade_index, local)?, None)
        } else {
            self.coalesce_nodes(clade_index, local, height, rng)?
        };
        self.update_state(change);
        // A completed clade's root becomes a sampled tip of the enclosing
        // clade; activation goes one level up and no further.
        if let Some(root) = completed_root {
            self.activate_node(root)?;
        }
        Ok(())
    }

    /// Apply one mutation event to a mutating node, moving it to the
    /// coalescing set once its demanded count is met.
    fn mutate_node(&mut self, clade_index: usize, local: usize) -> Result<StateChange> {
        let backing = self
            .tree
            .subtree(self.clades[clade_index].subtree)
            .wrapped()
            .backing_node(local);
        let target = self
            .provider
            .expected_mutations(&self.tree, backing)
            .round() as u32;
        let s = (self.coalescing_node_stat + self.mutating_node_count) as f64;
        let a = self.active_node_count as f64;
        let theta = self.theta;

        let clade = &mut self.clades[clade_index];
        let current = clade
            .mutating
            .get(&local)
            .copied()
            .ok_or_else(|| {
                CladecastError::Internal(format!("node {} is not mutating", backing))
            })?
            + 1;
        if current > target {
            return Err(CladecastError::Internal(format!(
                "node {} mutated past its demanded count",
                backing
            )));
        }

        if current < target {
            clade.mutating.insert(local, current);
            let event_weight = s / a * (theta / (a - 1.0 + theta));
            return Ok(StateChange {
                mut_delta: 0,
                coal_delta: 0,
                log_event_weight: event_weight.ln(),
            });
        }

        // Final demanded mutation: the node joins the coalescing set.
        let c = clade.coalescing.len();
        let event_weight = if c > 0 {
            if c == 1 {
                let lone = self
                    .tree
                    .subtree(clade.subtree)
                    .wrapped()
                    .backing_node(clade.coalescing[0]);
                self.available_nodes.push(lone);
            }
            s / a * ((c as f64 + 1.0) * theta / (a - 1.0 + theta))
        } else {
            // Alone in the coalescing set: no active options left.
            remove_from(&mut self.available_nodes, backing)?;
            s / a * (theta / (a - 1.0 + theta))
        };
        let old_pairs = clade.pair_stat();
        clade.coalescing.push(local);
        clade.mutating.remove(&local);
        Ok(StateChange {
            mut_delta: -1,
            coal_delta: clade.pair_stat() - old_pairs,
            log_event_weight: event_weight.ln(),
        })
    }

    /// Merge `left` with a uniformly drawn partner under a fresh internal
    /// node of the clade.
    ///
    /// Returns the applied state change and, when this coalescence completed
    /// the clade below the global root, the backing root node that must now
    /// be activated in the enclosing clade.
    fn coalesce_nodes(
        &mut self,
        clade_index: usize,
        left: usize,
        height: f64,
        rng: &mut Xorshift64,
    ) -> Result<(StateChange, Option<NodeId>)> {
        let subtree_index = self.clades[clade_index].subtree;
        let c = self.clades[clade_index].coalescing.len();
        if c < 2 {
            return Err(CladecastError::Internal(
                "coalescence drawn with fewer than two eligible lineages".into(),
            ));
        }
        let s = (self.coalescing_node_stat + self.mutating_node_count) as f64;
        let a = self.active_node_count as f64;
        let event_weight = s / c as f64 * (c as f64 - 1.0) / (a - 1.0 + self.theta);
        let old_pairs = self.clades[clade_index].pair_stat();

        let (right, parent) = {
            let clade = &mut self.clades[clade_index];
            let left_pos = clade
                .coalescing
                .iter()
                .position(|&n| n == left)
                .ok_or_else(|| {
                    CladecastError::Internal("acting node is not in the coalescing set".into())
                })?;
            clade.coalescing.swap_remove(left_pos);
            let right = clade.coalescing.swap_remove(rng.index(clade.coalescing.len()));
            let parent = clade.node_stack.pop().ok_or_else(|| {
                CladecastError::Internal("clade ran out of internal nodes".into())
            })?;
            (right, parent)
        };

        self.active_node_count -= 2;
        let left_backing = self.tree.subtree(subtree_index).wrapped().backing_node(left);
        let right_backing = self.tree.subtree(subtree_index).wrapped().backing_node(right);
        remove_from(&mut self.available_nodes, left_backing)?;
        remove_from(&mut self.available_nodes, right_backing)?;

        self.tree.subtree_add_child_quietly(subtree_index, parent, left)?;
        self.tree.subtree_add_child_quietly(subtree_index, parent, right)?;
        self.tree
            .subtree_set_node_height_quietly(subtree_index, parent, height);
        self.simulated_coalescent_events += 1;

        let parent_backing = self
            .tree
            .subtree(subtree_index)
            .wrapped()
            .backing_node(parent);
        self.active_intervals
            .add_coalescent_event(height, parent_backing);

        let mut completed_root = None;
        if parent == self.tree.subtree(subtree_index).root() {
            if !self.clades[clade_index].coalescing.is_empty() {
                return Err(CladecastError::Internal(
                    "clade completed with lineages left over".into(),
                ));
            }
            self.clades[clade_index].complete = true;
            if !self.tree.is_root(parent_backing) {
                completed_root = Some(parent_backing);
            }
        } else {
            if self.clades[clade_index].coalescing.len() == 1 {
                let lone = self
                    .tree
                    .subtree(subtree_index)
                    .wrapped()
                    .backing_node(self.clades[clade_index].coalescing[0]);
                remove_from(&mut self.available_nodes, lone)?;
            }
            let change = self.activate_clade_node(clade_index, parent)?;
            self.active_node_count += 1;
            if change.mut_delta != 0 {
                // Internal branches of a subtree carry no data of their own.
                return Err(CladecastError::Internal(format!(
                    "internal node {} demands mutation events",
                    parent_backing
                )));
            }
        }

        let change = StateChange {
            mut_delta: 0,
            coal_delta: self.clades[clade_index].pair_stat() - old_pairs,
            log_event_weight: event_weight.ln(),
        };
        Ok((change, completed_root))
    }
}

/// Split `samples` across `workers`, run the workers (in parallel when the
/// `parallel` feature is on), pick one result proportionally to its total
/// weight, and install its genealogy and intervals into `tree`.
///
/// Returns the combined log weight of the whole batch and the change events
/// of the installation edit. Worker RNG streams are derived from `rng` with
/// [`Xorshift64::split`], so results are reproducible from the seed
/// regardless of scheduling. Any worker failure fails the whole proposal.
#[allow(clippy::too_many_arguments)]
pub fn propose_genealogy<B: BranchLengthProvider + Sync>(
    tree: &mut ConstrainedTree,
    intervals: &mut IntervalList,
    provider: &B,
    population: &PiecewiseConstantPopulation,
    scaled_mutation_rate: f64,
    samples: usize,
    workers: usize,
    rng: &mut Xorshift64,
) -> Result<(f64, Vec<TreeChangedEvent>)> {
    if samples == 0 || workers == 0 {
        return Err(CladecastError::InvalidInput(
            "sample and worker counts must be positive".into(),
        ));
    }
    let base = samples / workers;
    let remainder = samples % workers;
    let tasks: Vec<(Xorshift64, usize)> = (0..workers)
        .map(|i| (rng.split(i as u64), base + usize::from(i < remainder)))
        .filter(|&(_, n)| n > 0)
        .collect();

    let shared: &ConstrainedTree = tree;
    let run = |(mut worker_rng, n): (Xorshift64, usize)| -> Result<(f64, ConstrainedTree, IntervalList)> {
        let mut sampler =
            ConstrainedImportanceSampler::new(shared, provider, population, scaled_mutation_rate, n)?;
        let weight = sampler.sample_tree(&mut worker_rng)?;
        let (worker_tree, worker_intervals) = sampler.into_parts();
        Ok((weight, worker_tree, worker_intervals))
    };

    #[cfg(feature = "parallel")]
    let results: Vec<(f64, ConstrainedTree, IntervalList)> =
        tasks.into_par_iter().map(run).collect::<Result<_>>()?;
    #[cfg(not(feature = "parallel"))]
    let results: Vec<(f64, ConstrainedTree, IntervalList)> =
        tasks.into_iter().map(run).collect::<Result<_>>()?;

    let total_log_weight = results
        .iter()
        .fold(f64::NEG_INFINITY, |acc, (w, _, _)| log_sum(acc, *w));
    if total_log_weight == f64::NEG_INFINITY || total_log_weight.is_nan() {
        return Err(CladecastError::Internal(
            "no worker produced a usable weight".into(),
        ));
    }

    // Categorical draw over workers, normalized in log domain.
    let mut target = rng.next_f64();
    let mut chosen = results.len() - 1;
    for (i, (w, _, _)) in results.iter().enumerate() {
        let p = (w - total_log_weight).exp();
        if target < p {
            chosen = i;
            break;
        }
        target -= p;
    }
    let (_, winner_tree, winner_intervals) = &results[chosen];

    tree.begin_edit();
    tree.adopt_structure(winner_tree)?;
    let events = tree.end_edit();
    intervals.copy_from(winner_intervals);
    Ok((total_log_weight, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constrained::Constraint;
    use crate::tree::BasicTree;

    fn two_tip_tree() -> ConstrainedTree {
        let mut backing = BasicTree::new(&[("A", 0.0), ("B", 0.0)]).unwrap();
        backing.join(0, 1, 1.0).unwrap();
        let constraints =
            Constraint::clade(vec![Constraint::taxon("A"), Constraint::taxon("B")]);
        ConstrainedTree::new(backing, &constraints).unwrap()
    }

    /// (((A,B),(C,D)),E) constrained as ((A,B),C,D,E).
    fn five_tip_tree() -> ConstrainedTree {
        let mut backing = BasicTree::new(&[
            ("A", 0.0),
            ("B", 0.1),
            ("C", 0.0),
            ("D", 0.3),
            ("E", 0.2),
        ])
        .unwrap();
        let ab = backing.join(0, 1, 1.0).unwrap();
        let cd = backing.join(2, 3, 1.2).unwrap();
        let abcd = backing.join(ab, cd, 2.0).unwrap();
        backing.join(abcd, 4, 3.0).unwrap();
        let constraints = Constraint::clade(vec![
            Constraint::clade(vec![Constraint::taxon("A"), Constraint::taxon("B")]),
            Constraint::taxon("C"),
            Constraint::taxon("D"),
            Constraint::taxon("E"),
        ]);
        ConstrainedTree::new(backing, &constraints).unwrap()
    }

    fn assert_valid_genealogy(tree: &ConstrainedTree) {
        // Every non-root node hangs off a parent and heights never decrease
        // toward the root.
        let root = tree.root();
        for node in 0..tree.node_count() {
            if node == root {
                assert_eq!(tree.parent(node), None);
            } else {
                let parent = tree.parent(node).expect("dangling node");
                assert!(
                    tree.node_height(parent) >= tree.node_height(node),
                    "parent {} below child {}",
                    parent,
                    node
                );
            }
        }
        // All internal nodes are binary.
        for node in tree.external_node_count()..tree.node_count() {
            assert_eq!(tree.child_count(node), 2, "node {} not binary", node);
        }
    }

    #[test]
    fn log_sum_matches_direct_computation() {
        let a: f64 = (0.3f64).ln();
        let b: f64 = (0.2f64).ln();
        assert!((log_sum(a, b) - (0.5f64).ln()).abs() < 1e-12);
        assert_eq!(log_sum(f64::NEG_INFINITY, a), a);
        assert_eq!(log_sum(a, f64::NEG_INFINITY), a);
        // Stable far from overflow range.
        assert!((log_sum(-1000.0, -1000.0) - (-1000.0 + 2f64.ln())).abs() < 1e-12);
    }

    #[test]
    fn log_sum_streaming_is_monotone_and_exact() {
        let weights = [-2.0, -5.0, -1.0, -9.0, -3.0];
        let mut running = f64::NEG_INFINITY;
        for &w in &weights {
            let next = log_sum(running, w);
            assert!(next >= running);
            running = next;
        }
        let direct: f64 = weights.iter().map(|w| w.exp()).sum::<f64>().ln();
        assert!((running - direct).abs() < 1e-12);
    }

    #[test]
    fn termination_leaves_no_transient_state() {
        let tree = five_tip_tree();
        let provider = ConstantMutations::new()
            .with_count(0, 2.0)
            .with_count(2, 1.0);
        let population = PiecewiseConstantPopulation::constant(1.0).unwrap();
        let mut sampler =
            ConstrainedImportanceSampler::new(&tree, &provider, &population, 1.0, 1).unwrap();
        let mut rng = Xorshift64::new(11);
        for _ in 0..50 {
            sampler.sample_next_tree(&mut rng).unwrap();
            assert_eq!(
                sampler.simulated_coalescent_events,
                tree.internal_node_count()
            );
            assert!(sampler.available_nodes.is_empty());
            assert_eq!(sampler.active_node_count, 0);
            assert_eq!(sampler.coalescing_node_stat, 0);
            assert_eq!(sampler.mutating_node_count, 0);
            assert!(sampler.clades.iter().all(|c| c.complete));
            assert_valid_genealogy(&sampler.tree);
        }
    }

    #[test]
    fn grid_boundaries_only_clamp_the_clock() {
        let tree = five_tip_tree();
        let provider = ConstantMutations::new();
        let population =
            PiecewiseConstantPopulation::new(vec![0.5, 1.5], vec![1.0, 3.0, 2.0]).unwrap();
        let mut sampler =
            ConstrainedImportanceSampler::new(&tree, &provider, &population, 0.5, 1).unwrap();
        let mut rng = Xorshift64::new(23);
        for _ in 0..50 {
            sampler.sample_next_tree(&mut rng).unwrap();
            assert_valid_genealogy(&sampler.tree);
            // Interval records: one sample per tip, one coalescence per
            // internal node.
            let coalescences = sampler
                .active_intervals
                .events()
                .iter()
                .filter(|e| e.kind == crate::intervals::IntervalEventKind::Coalescent)
                .count();
            assert_eq!(coalescences, tree.internal_node_count());
            assert_eq!(
                sampler.active_intervals.len(),
                tree.node_count()
            );
        }
    }

    #[test]
    fn zero_rate_two_tips_has_closed_form_weight() {
        // With no mutation demand and rate zero the process is a pure
        // coalescent: the single event's weight is exactly 1/2.
        let tree = two_tip_tree();
        let provider = ConstantMutations::new();
        let ne = 2.0;
        let population = PiecewiseConstantPopulation::constant(ne).unwrap();
        let mut sampler =
            ConstrainedImportanceSampler::new(&tree, &provider, &population, 0.0, 1).unwrap();
        let mut rng = Xorshift64::new(31);

        let runs = 4000;
        let mut height_sum = 0.0;
        for _ in 0..runs {
            let weight = sampler.sample_tree(&mut rng).unwrap();
            assert!((weight - (0.5f64).ln()).abs() < 1e-12);
            height_sum += sampler.tree().node_height(sampler.tree().root());
        }
        // Root height is Exp(1/Ne); its mean is Ne (sd Ne, so the Monte
        // Carlo error of the mean over 4000 runs is about Ne / 63).
        let mean = height_sum / runs as f64;
        assert!(
            (mean - ne).abs() < 0.15,
            "mean root height {} too far from Ne = {}",
            mean,
            ne
        );
    }

    #[test]
    fn batch_weight_is_logsumexp_of_samples() {
        let tree = two_tip_tree();
        let provider = ConstantMutations::new();
        let population = PiecewiseConstantPopulation::constant(2.0).unwrap();
        let samples = 5;
        let mut sampler =
            ConstrainedImportanceSampler::new(&tree, &provider, &population, 0.0, samples)
                .unwrap();
        let mut rng = Xorshift64::new(7);
        let total = sampler.sample_tree(&mut rng).unwrap();
        // Every sample's weight is ln(1/2), so the total is ln(samples / 2).
        let expected = (samples as f64 / 2.0).ln();
        assert!((total - expected).abs() < 1e-12);
    }

    #[test]
    fn mutation_demands_are_honored() {
        // Tip A owes two mutation events before it may coalesce; the
        // simulation must still complete and stay consistent.
        let tree = two_tip_tree();
        let provider = ConstantMutations::new().with_count(0, 2.0);
        let population = PiecewiseConstantPopulation::constant(1.0).unwrap();
        let mut sampler =
            ConstrainedImportanceSampler::new(&tree, &provider, &population, 1.0, 1).unwrap();
        let mut rng = Xorshift64::new(101);
        for _ in 0..100 {
            sampler.sample_next_tree(&mut rng).unwrap();
            assert_valid_genealogy(&sampler.tree);
            let root = sampler.tree.root();
            assert!(sampler.tree.node_height(root) > 0.0);
        }
    }

    #[test]
    fn rejects_zero_samples() {
        let tree = two_tip_tree();
        let provider = ConstantMutations::new();
        let population = PiecewiseConstantPopulation::constant(1.0).unwrap();
        assert!(matches!(
            ConstrainedImportanceSampler::new(&tree, &provider, &population, 0.0, 0),
            Err(CladecastError::InvalidInput(_))
        ));
    }

    #[test]
    fn propose_installs_a_complete_genealogy() {
        let mut tree = five_tip_tree();
        let mut intervals = IntervalList::new();
        let provider = ConstantMutations::new().with_count(0, 1.0);
        let population = PiecewiseConstantPopulation::constant(1.5).unwrap();
        let mut rng = Xorshift64::new(77);
        let (weight, events) = propose_genealogy(
            &mut tree,
            &mut intervals,
            &provider,
            &population,
            0.8,
            7,
            3,
            &mut rng,
        )
        .unwrap();
        assert!(weight.is_finite());
        assert!(!events.is_empty());
        assert_eq!(intervals.len(), tree.node_count());
        assert_valid_genealogy(&tree);
    }

    #[test]
    fn propose_is_deterministic_for_a_seed() {
        let provider = ConstantMutations::new().with_count(0, 1.0);
        let population = PiecewiseConstantPopulation::constant(1.5).unwrap();

        let mut heights = Vec::new();
        for _ in 0..2 {
            let mut tree = five_tip_tree();
            let mut intervals = IntervalList::new();
            let mut rng = Xorshift64::new(4242);
            propose_genealogy(
                &mut tree,
                &mut intervals,
                &provider,
                &population,
                0.8,
                6,
                2,
                &mut rng,
            )
            .unwrap();
            heights.push(
                (0..tree.node_count())
                    .map(|n| tree.node_height(n))
                    .collect::<Vec<f64>>(),
            );
        }
        assert_eq!(heights[0], heights[1]);
    }

    #[test]
    fn rejects_zero_workers() {
        let mut tree = two_tip_tree();
        let mut intervals = IntervalList::new();
        let provider = ConstantMutations::new();
        let population = PiecewiseConstantPopulation::constant(1.0).unwrap();
        let mut rng = Xorshift64::new(1);
        assert!(matches!(
            propose_genealogy(
                &mut tree,
                &mut intervals,
                &provider,
                &population,
                0.0,
                4,
                0,
                &mut rng,
            ),
            Err(CladecastError::InvalidInput(_))
        ));
    }
}
