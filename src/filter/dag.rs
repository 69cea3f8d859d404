// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Filter dependency DAG, partial order and permutations.
//!
//! `REQUIRES` edges induce a partial order over the filter set. The
//! executor always runs filters in some *linear extension* of that order
//! (a permutation); the optimizer is free to swap any two filters the
//! order leaves incomparable.

use std::{collections::HashMap, fmt};

use anyhow::{Result, bail, ensure};
use rand::Rng;
use rand::RngExt;

use crate::filter::spec::FilterSpec;

/// Pairwise relation between two filters after transitive closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// u must run before v.
    Before,
    /// u must run after v.
    After,
    Equal,
    Incomparable,
}

/// Dense relation matrix; `dim` is the filter count.
#[derive(Debug, Clone)]
pub struct PartialOrder {
    dim: usize,
    data: Vec<Relation>,
}

impl PartialOrder {
    pub fn new(dim: usize) -> Self {
        let mut data = vec![Relation::Incomparable; dim * dim];
        for i in 0..dim {
            data[i * dim + i] = Relation::Equal;
        }
        Self { dim, data }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, u: usize, v: usize) -> Relation {
        self.data[u * self.dim + v]
    }

    /// Record `u` before `v` (and the mirror relation).
    pub fn set_before(&mut self, u: usize, v: usize) {
        self.data[u * self.dim + v] = Relation::Before;
        self.data[v * self.dim + u] = Relation::After;
    }

    pub fn comparable(&self, u: usize, v: usize) -> bool {
        self.get(u, v) != Relation::Incomparable
    }

    /// No other filter is required to run before `u`.
    pub fn is_minimal(&self, u: usize) -> bool {
        (0..self.dim).all(|v| self.get(u, v) != Relation::After)
    }

    /// Transitive closure of the `Before` relation. Fails on cycles.
    pub fn close(&mut self) -> Result<()> {
        for k in 0..self.dim {
            for i in 0..self.dim {
                if self.get(i, k) != Relation::Before {
                    continue;
                }
                for j in 0..self.dim {
                    if self.get(k, j) == Relation::Before {
                        if i == j {
                            bail!("filter dependency cycle detected");
                        }
                        self.set_before(i, j);
                    }
                }
            }
        }
        Ok(())
    }
}

/// A total order over the filter set, stored as indices into the filter
/// array. Only ever holds linear extensions of the partial order.
#[derive(Clone, PartialEq, Eq)]
pub struct Permutation(Vec<usize>);

impl Permutation {
    pub fn identity(n: usize) -> Self {
        Self((0..n).collect())
    }

    pub fn from_vec(order: Vec<usize>) -> Self {
        Self(order)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn elt(&self, i: usize) -> usize {
        self.0[i]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn swap(&mut self, i: usize, j: usize) {
        self.0.swap(i, j);
    }

    pub fn position_of(&self, filter: usize) -> Option<usize> {
        self.0.iter().position(|&f| f == filter)
    }

    /// Linear-extension check: no element may appear after one it must
    /// precede.
    pub fn respects(&self, po: &PartialOrder) -> bool {
        for (i, &u) in self.0.iter().enumerate() {
            for &v in &self.0[i + 1..] {
                if po.get(u, v) == Relation::After {
                    return false;
                }
            }
        }
        true
    }

    /// Whether swapping positions `i < j` keeps the permutation a linear
    /// extension: the endpoints must be incomparable with each other and
    /// with everything strictly between them.
    pub fn valid_swap(&self, po: &PartialOrder, i: usize, j: usize) -> bool {
        if po.comparable(self.0[i], self.0[j]) {
            return false;
        }
        for k in (i + 1)..j {
            if po.comparable(self.0[i], self.0[k]) || po.comparable(self.0[k], self.0[j]) {
                return false;
            }
        }
        true
    }

    /// Resample a uniformly random linear extension in place: repeatedly
    /// draw among the elements whose predecessors are all placed.
    pub fn randomize<R: Rng + ?Sized>(&mut self, po: &PartialOrder, rng: &mut R) {
        let n = self.0.len();
        let mut remaining: Vec<usize> = self.0.clone();
        let mut out = Vec::with_capacity(n);

        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&u| {
                    remaining
                        .iter()
                        .all(|&v| v == u || po.get(u, v) != Relation::After)
                })
                .collect();
            // A closed, acyclic order always exposes at least one
            // minimal element.
            let pick = ready[rng.random_range(0..ready.len())];
            out.push(pick);
            remaining.retain(|&u| u != pick);
        }
        self.0 = out;
    }
}

impl fmt::Debug for Permutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permutation{:?}", self.0)
    }
}

/// The parsed filter set with its dependency order.
#[derive(Debug, Clone)]
pub struct FilterDag {
    pub filters: Vec<FilterSpec>,
    pub order: PartialOrder,
}

impl FilterDag {
    /// Build nodes and edges from specs, resolve `REQUIRES` names,
    /// compute the closure and reject cycles.
    pub fn build(filters: Vec<FilterSpec>) -> Result<Self> {
        let index: HashMap<&str, usize> = filters
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();
        ensure!(
            index.len() == filters.len(),
            "duplicate filter names in spec"
        );

        let mut order = PartialOrder::new(filters.len());
        for (v, filt) in filters.iter().enumerate() {
            for dep in &filt.requires {
                let Some(&u) = index.get(dep.as_str()) else {
                    bail!("filter {} requires unknown filter {dep}", filt.name);
                };
                ensure!(u != v, "filter {} requires itself", filt.name);
                order.set_before(u, v);
            }
        }
        order.close()?;

        Ok(Self { filters, order })
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.filters.iter().position(|f| f.name == name)
    }

    /// Topological sort for the starting order. Ties break on higher
    /// merit first, then filter name, so the initial order is stable
    /// across runs.
    pub fn initial_permutation(&self) -> Permutation {
        let n = self.filters.len();
        let mut placed = vec![false; n];
        let mut out = Vec::with_capacity(n);

        while out.len() < n {
            let mut ready: Vec<usize> = (0..n)
                .filter(|&u| !placed[u])
                .filter(|&u| {
                    (0..n).all(|v| {
                        placed[v] || v == u || self.order.get(u, v) != Relation::After
                    })
                })
                .collect();
            ready.sort_by(|&a, &b| {
                self.filters[b]
                    .merit
                    .cmp(&self.filters[a].merit)
                    .then_with(|| self.filters[a].name.cmp(&self.filters[b].name))
            });
            let pick = ready[0];
            placed[pick] = true;
            out.push(pick);
        }
        Permutation::from_vec(out)
    }
}
