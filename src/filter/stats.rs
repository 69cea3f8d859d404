// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-filter statistics and the permutation cost model.
//!
//! For each filter we track call/pass/drop counters and cumulative eval
//! time; for each `(filter, prefix-context)` pair we track pass rates,
//! where the context is the *unordered* set of filters that ran before it.
//! Contexts make pass rates honest under reordering: a filter's observed
//! selectivity depends on what already dropped objects ahead of it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Minimum samples before a measurement is trusted.
pub const FSTATS_VALID_NUM: u64 = 5;
/// Cost charged for a filter with no trusted timing, in nanoseconds.
pub const FSTATS_UNKNOWN_COST: f64 = 100_000_000.0;
/// Pass rate assumed for a filter with no trusted samples.
pub const FSTATS_UNKNOWN_PROB: f64 = 1.0;
/// Floor for the cumulative pass product.
const SMALL_FRACTION: f64 = 0.00001;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FilterCounters {
    pub called: u64,
    pub passed: u64,
    pub dropped: u64,
    pub errors: u64,
    pub bypassed: u64,
    pub cache_passed: u64,
    pub cache_dropped: u64,
    pub time_ns: u64,
}

impl FilterCounters {
    pub fn avg_exec_ns(&self) -> u64 {
        if self.called == 0 {
            0
        } else {
            self.time_ns / self.called
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PassStat {
    num_exec: u64,
    num_pass: u64,
}

/// Cost estimate for a (possibly partial) permutation.
#[derive(Debug, Clone, Copy)]
pub struct CostEstimate {
    /// Expected per-object cost in nanoseconds.
    pub cost: f64,
    /// False when any pass rate or timing fell back to a default; the
    /// optimizer treats such estimates as "need samples here".
    pub complete: bool,
}

#[derive(Debug, Default)]
pub struct StatsTable {
    filters: Vec<FilterCounters>,
    /// (filter, sorted prefix context) → pass counts.
    probs: HashMap<(usize, Vec<usize>), PassStat>,
}

impl StatsTable {
    pub fn new(num_filters: usize) -> Self {
        Self {
            filters: vec![FilterCounters::default(); num_filters],
            probs: HashMap::new(),
        }
    }

    pub fn counters(&self, filter: usize) -> &FilterCounters {
        &self.filters[filter]
    }

    pub fn counters_mut(&mut self, filter: usize) -> &mut FilterCounters {
        &mut self.filters[filter]
    }

    pub fn snapshot(&self) -> Vec<FilterCounters> {
        self.filters.clone()
    }

    /// Record one actual execution. `prefix` is the set of filters that
    /// ran before this one on this object, in any order. Each execution
    /// also feeds the context-free entry so the `indep` policy has data.
    pub fn record_exec(
        &mut self,
        filter: usize,
        prefix: &[usize],
        passed: bool,
        elapsed_ns: u64,
    ) {
        let c = &mut self.filters[filter];
        c.called += 1;
        c.time_ns += elapsed_ns;
        if passed {
            c.passed += 1;
        } else {
            c.dropped += 1;
        }

        let mut key: Vec<usize> = prefix.to_vec();
        key.sort_unstable();
        let empty = key.is_empty();
        let stat = self.probs.entry((filter, key)).or_default();
        stat.num_exec += 1;
        if passed {
            stat.num_pass += 1;
        }
        if !empty {
            let stat = self.probs.entry((filter, Vec::new())).or_default();
            stat.num_exec += 1;
            if passed {
                stat.num_pass += 1;
            }
        }
    }

    pub fn record_cache_hit(&mut self, filter: usize, passed: bool) {
        let c = &mut self.filters[filter];
        if passed {
            c.cache_passed += 1;
        } else {
            c.cache_dropped += 1;
        }
    }

    pub fn record_error(&mut self, filter: usize) {
        self.filters[filter].errors += 1;
    }

    pub fn record_bypass(&mut self, filter: usize) {
        self.filters[filter].bypassed += 1;
    }

    /// Measured pass rate for a filter under a context, if trusted.
    pub fn pass_rate(&self, filter: usize, prefix: &[usize]) -> Option<f64> {
        let mut key: Vec<usize> = prefix.to_vec();
        key.sort_unstable();
        let stat = self.probs.get(&(filter, key))?;
        if stat.num_exec < FSTATS_VALID_NUM {
            return None;
        }
        Some(stat.num_pass as f64 / stat.num_exec as f64)
    }

    fn mean_time_ns(&self, filter: usize) -> (f64, bool) {
        let c = &self.filters[filter];
        if c.called < FSTATS_VALID_NUM {
            (FSTATS_UNKNOWN_COST, false)
        } else {
            (c.time_ns as f64 / c.called as f64, true)
        }
    }

    /// Expected per-object cost of running the filters in `order`:
    /// each filter's mean time weighted by the probability every earlier
    /// filter passed. With `indep` the context is ignored.
    ///
    /// Works on permutation prefixes too, which is what best-first
    /// expands.
    pub fn estimate_cost(&self, order: &[usize], indep: bool) -> CostEstimate {
        let mut pass = 1.0f64;
        let mut total = 0.0f64;
        let mut complete = true;

        for (i, &filter) in order.iter().enumerate() {
            let (mean, timed) = self.mean_time_ns(filter);
            complete &= timed;
            total += pass * mean;

            let context: &[usize] = if indep { &[] } else { &order[..i] };
            let p = match self.pass_rate(filter, context) {
                Some(p) => p,
                None => {
                    complete = false;
                    FSTATS_UNKNOWN_PROB
                },
            };
            pass = (pass * p).max(SMALL_FRACTION);
        }

        CostEstimate {
            cost: total,
            complete,
        }
    }
}
