// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session variables: a per-search floating-point dictionary shared by
//! every filter in the search and exposed over the control channel.
//! Filters use it to accumulate global state across objects, e.g. running
//! statistics for anomaly detection.

use std::collections::HashMap;

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct SessionVars {
    vars: DashMap<String, f64>,
}

impl SessionVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> f64 {
        self.vars.get(name).map(|v| *v).unwrap_or(0.0)
    }

    pub fn set(&self, name: &str, value: f64) {
        self.vars.insert(name.to_string(), value);
    }

    /// Merge a batch of updates, last writer wins per key.
    pub fn merge(&self, updates: impl IntoIterator<Item = (String, f64)>) {
        for (name, value) in updates {
            self.vars.insert(name, value);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.vars
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Replace the whole dictionary, the `session_variables_set` RPC.
    pub fn replace(&self, vars: HashMap<String, f64>) {
        self.vars.clear();
        for (name, value) in vars {
            self.vars.insert(name, value);
        }
    }
}
