//! Coalescent interval bookkeeping and population-size trajectories.
//!
//! The sampler records every sampling and coalescent event it simulates into
//! an [`IntervalList`] so a demographic likelihood can be evaluated over the
//! proposed genealogy. Lists are copyable as a unit: workers keep their own
//! and the winning worker's list is installed wholesale.

use crate::error::{CladecastError, Result};
use crate::tree::NodeId;

/// What happened at an interval boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IntervalEventKind {
    /// A lineage entered the process (a tip was sampled).
    Sample,
    /// Two lineages merged.
    Coalescent,
}

/// One recorded event.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntervalEvent {
    pub time: f64,
    pub node: NodeId,
    pub kind: IntervalEventKind,
}

/// Append-only record of the events of one simulated genealogy.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntervalList {
    events: Vec<IntervalEvent>,
}

impl IntervalList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample_event(&mut self, time: f64, node: NodeId) {
        self.events.push(IntervalEvent {
            time,
            node,
            kind: IntervalEventKind::Sample,
        });
    }

    pub fn add_coalescent_event(&mut self, time: f64, node: NodeId) {
        self.events.push(IntervalEvent {
            time,
            node,
            kind: IntervalEventKind::Coalescent,
        });
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }

    /// Replace this list's contents with another's.
    pub fn copy_from(&mut self, other: &IntervalList) {
        self.events.clear();
        self.events.extend_from_slice(&other.events);
    }

    pub fn events(&self) -> &[IntervalEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Effective population size over time as a step function on a height grid.
///
/// `grid` holds the interval boundaries in strictly increasing order; `sizes`
/// holds one size per interval, so `sizes.len() == grid.len() + 1`. Interval
/// `i` spans `[grid[i-1], grid[i])` with the first starting at height zero
/// and the last unbounded.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PiecewiseConstantPopulation {
    grid: Vec<f64>,
    sizes: Vec<f64>,
}

impl PiecewiseConstantPopulation {
    pub fn new(grid: Vec<f64>, sizes: Vec<f64>) -> Result<Self> {
        if sizes.len() != grid.len() + 1 {
            return Err(CladecastError::InvalidInput(format!(
                "{} grid points need {} population sizes, got {}",
                grid.len(),
                grid.len() + 1,
                sizes.len()
            )));
        }
        if !grid.windows(2).all(|w| w[0] < w[1]) {
            return Err(CladecastError::InvalidInput(
                "population grid points must be strictly increasing".into(),
            ));
        }
        if grid.first().is_some_and(|&g| g <= 0.0) {
            return Err(CladecastError::InvalidInput(
                "population grid points must be positive heights".into(),
            ));
        }
        if !sizes.iter().all(|&s| s.is_finite() && s > 0.0) {
            return Err(CladecastError::InvalidInput(
                "population sizes must be positive and finite".into(),
            ));
        }
        Ok(Self { grid, sizes })
    }

    /// A single size for all time (no grid boundaries).
    pub fn constant(size: f64) -> Result<Self> {
        Self::new(Vec::new(), vec![size])
    }

    pub fn grid_point_count(&self) -> usize {
        self.grid.len()
    }

    /// Height of grid boundary `i`.
    pub fn grid_point(&self, i: usize) -> f64 {
        self.grid[i]
    }

    /// Size of interval `i`.
    pub fn size_at(&self, i: usize) -> f64 {
        self.sizes[i]
    }

    /// Interval containing `height`; a height exactly on a boundary belongs
    /// to the interval above it.
    pub fn interval_of(&self, height: f64) -> usize {
        self.grid.partition_point(|&g| g <= height)
    }

    pub fn size_at_height(&self, height: f64) -> f64 {
        self.sizes[self.interval_of(height)]
    }

    /// The first grid boundary strictly above `height`, if any.
    pub fn next_grid_point_above(&self, height: f64) -> Option<f64> {
        let i = self.grid.partition_point(|&g| g <= height);
        self.grid.get(i).copied()
    }
}
