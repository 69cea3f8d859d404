// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Filter-ordering optimizer policies.
//!
//! Each policy consumes the measured statistics after an object completes
//! and answers with a directive: hold the current order, adopt a better
//! one, or ask the executor to *trial* an order it needs samples for.
//! Directives take effect at the next object boundary, never mid-object.

use std::{cmp::Ordering, collections::BinaryHeap};

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::filter::{
    dag::{PartialOrder, Permutation, Relation},
    stats::StatsTable,
};

/// How many objects a policy rests after reaching a local optimum before
/// it restarts with fresh data.
const RESTART_INTERVAL: u32 = 200;

/// Policy selector, chosen at startup from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    HillClimb,
    BestFirst,
    Indep,
    Random,
    Static,
}

/// Directive handed back to the executor.
#[derive(Debug, Clone)]
pub enum OptStep {
    /// Keep the current permutation.
    Hold,
    /// Switch to this permutation as the new steady-state order.
    Adopt(Permutation),
    /// Run this permutation next to collect the samples the policy is
    /// missing.
    Trial(Permutation),
}

#[enum_dispatch]
pub trait OptimizerPolicy {
    /// Called after each object's stats have been folded in.
    fn step(&mut self, stats: &StatsTable) -> OptStep;

    /// The best full permutation the policy currently knows.
    fn result(&self) -> &Permutation;
}

#[enum_dispatch(OptimizerPolicy)]
#[derive(Debug)]
pub enum Policy {
    HillClimb(HillClimbState),
    BestFirst(BestFirstState),
    Random(RandomState),
    Static(StaticState),
}

impl Policy {
    pub fn new(kind: PolicyKind, initial: Permutation, po: PartialOrder) -> Self {
        match kind {
            PolicyKind::HillClimb => Policy::HillClimb(HillClimbState::new(initial, po)),
            PolicyKind::BestFirst => {
                Policy::BestFirst(BestFirstState::new(initial, po, false))
            },
            PolicyKind::Indep => Policy::BestFirst(BestFirstState::new(initial, po, true)),
            PolicyKind::Random => Policy::Random(RandomState::new(initial, po)),
            PolicyKind::Static => Policy::Static(StaticState::new(initial)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hill climbing

/// Local search over valid pairwise swaps: accept any swap that lowers
/// the estimated cost, stop at a local minimum, rest, then restart from a
/// randomized linear extension in case better data has arrived.
#[derive(Debug)]
pub struct HillClimbState {
    po: PartialOrder,
    best: Permutation,
    cooldown: u32,
}

impl HillClimbState {
    pub fn new(initial: Permutation, po: PartialOrder) -> Self {
        Self {
            po,
            best: initial,
            cooldown: 0,
        }
    }
}

impl OptimizerPolicy for HillClimbState {
    fn step(&mut self, stats: &StatsTable) -> OptStep {
        if self.cooldown > 0 {
            self.cooldown -= 1;
            if self.cooldown == 0 {
                self.best.randomize(&self.po, &mut rand::rng());
            }
            return OptStep::Hold;
        }

        let current = stats.estimate_cost(self.best.as_slice(), false);
        if !current.complete {
            return OptStep::Trial(self.best.clone());
        }
        let mut best_cost = current.cost;

        let n = self.best.len();
        let mut improved = true;
        while improved {
            improved = false;
            for i in 0..n {
                for j in (i + 1)..n {
                    if !self.best.valid_swap(&self.po, i, j) {
                        continue;
                    }
                    let mut candidate = self.best.clone();
                    candidate.swap(i, j);
                    let est = stats.estimate_cost(candidate.as_slice(), false);
                    if est.cost >= best_cost {
                        // Even a default-padded estimate is a usable
                        // lower bound for rejection.
                        continue;
                    }
                    if !est.complete {
                        return OptStep::Trial(candidate);
                    }
                    debug!(
                        cost = est.cost,
                        order = ?candidate,
                        "hill climb improved"
                    );
                    best_cost = est.cost;
                    self.best = candidate;
                    improved = true;
                }
            }
        }

        // Local minimum; rest before restarting.
        self.cooldown = RESTART_INTERVAL;
        OptStep::Adopt(self.best.clone())
    }

    fn result(&self) -> &Permutation {
        &self.best
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Best-first (and its context-free `indep` variant)

#[derive(Debug)]
struct Frontier {
    cost: f64,
    prefix: Vec<usize>,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.prefix == other.prefix
    }
}
impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the *cheapest* prefix first.
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.prefix.cmp(&self.prefix))
    }
}
impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Search over prefix-permutations ordered by partial-cost lower bound.
/// A frontier node with missing data surfaces as a trial order so the
/// executor gathers exactly the samples the search is blocked on.
#[derive(Debug)]
pub struct BestFirstState {
    po: PartialOrder,
    indep: bool,
    best: Permutation,
    queue: BinaryHeap<Frontier>,
    seeded: bool,
    cooldown: u32,
}

impl BestFirstState {
    pub fn new(initial: Permutation, po: PartialOrder, indep: bool) -> Self {
        Self {
            po,
            indep,
            best: initial,
            queue: BinaryHeap::new(),
            seeded: false,
            cooldown: 0,
        }
    }

    /// Extend a prefix to a full linear extension (topological fill).
    fn complete_prefix(&self, prefix: &[usize]) -> Permutation {
        let n = self.best.len();
        let mut order: Vec<usize> = prefix.to_vec();
        let mut remaining: Vec<usize> = (0..n).filter(|f| !prefix.contains(f)).collect();

        while !remaining.is_empty() {
            let pos = remaining
                .iter()
                .position(|&u| {
                    remaining
                        .iter()
                        .all(|&v| v == u || self.po.get(u, v) != Relation::After)
                })
                .unwrap_or(0);
            order.push(remaining.remove(pos));
        }
        Permutation::from_vec(order)
    }

    /// Filters that may legally extend `prefix`.
    fn successors(&self, prefix: &[usize]) -> Vec<usize> {
        let n = self.best.len();
        (0..n)
            .filter(|f| !prefix.contains(f))
            .filter(|&u| {
                (0..n)
                    .filter(|v| !prefix.contains(v) && *v != u)
                    .all(|v| self.po.get(u, v) != Relation::After)
            })
            .collect()
    }

    fn seed(&mut self, stats: &StatsTable) -> Option<OptStep> {
        for f in 0..self.best.len() {
            if !self.po.is_minimal(f) {
                continue;
            }
            let est = stats.estimate_cost(&[f], self.indep);
            if !est.complete {
                return Some(OptStep::Trial(self.complete_prefix(&[f])));
            }
            self.queue.push(Frontier {
                cost: est.cost,
                prefix: vec![f],
            });
        }
        self.seeded = true;
        None
    }
}

impl OptimizerPolicy for BestFirstState {
    fn step(&mut self, stats: &StatsTable) -> OptStep {
        if self.cooldown > 0 {
            self.cooldown -= 1;
            if self.cooldown == 0 {
                self.queue.clear();
                self.seeded = false;
            }
            return OptStep::Hold;
        }

        if !self.seeded
            && let Some(need) = self.seed(stats)
        {
            return need;
        }

        while let Some(node) = self.queue.pop() {
            if node.prefix.len() == self.best.len() {
                self.best = Permutation::from_vec(node.prefix);
                self.cooldown = RESTART_INTERVAL;
                return OptStep::Adopt(self.best.clone());
            }
            for next in self.successors(&node.prefix) {
                let mut child = node.prefix.clone();
                child.push(next);
                let est = stats.estimate_cost(&child, self.indep);
                if !est.complete {
                    // Put the parent back so the search resumes here once
                    // the samples arrive.
                    self.queue.push(node);
                    return OptStep::Trial(self.complete_prefix(&child));
                }
                self.queue.push(Frontier {
                    cost: est.cost,
                    prefix: child,
                });
            }
        }

        // Drained without a terminal: empty filter set.
        OptStep::Hold
    }

    fn result(&self) -> &Permutation {
        &self.best
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Random / static

/// Uniformly random linear extension, resampled on a fixed period.
#[derive(Debug)]
pub struct RandomState {
    po: PartialOrder,
    current: Permutation,
    until_resample: u32,
}

impl RandomState {
    pub fn new(initial: Permutation, po: PartialOrder) -> Self {
        Self {
            po,
            current: initial,
            until_resample: 0,
        }
    }
}

impl OptimizerPolicy for RandomState {
    fn step(&mut self, _stats: &StatsTable) -> OptStep {
        if self.until_resample > 0 {
            self.until_resample -= 1;
            return OptStep::Hold;
        }
        self.until_resample = RESTART_INTERVAL;
        self.current.randomize(&self.po, &mut rand::rng());
        OptStep::Adopt(self.current.clone())
    }

    fn result(&self) -> &Permutation {
        &self.current
    }
}

/// Never deviates from the initial topological order.
#[derive(Debug)]
pub struct StaticState {
    initial: Permutation,
}

impl StaticState {
    pub fn new(initial: Permutation) -> Self {
        Self { initial }
    }
}

impl OptimizerPolicy for StaticState {
    fn step(&mut self, _stats: &StatsTable) -> OptStep {
        OptStep::Hold
    }

    fn result(&self) -> &Permutation {
        &self.initial
    }
}
