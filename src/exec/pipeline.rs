// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The two-stage pipeline executor.
//!
//! Stage 1 walks the current permutation attempting cache-only
//! resolution: verdicts replayed from prior identical executions, no
//! body fetch, no subprocess. A cached drop ends the object immediately.
//! Stage 2 picks up at the first cache miss: fetch the body, run each
//! remaining filter in its subprocess, record timings and attribute
//! sets, insert cache entries, and drop the moment a verdict falls below
//! its threshold.
//!
//! After every object the measured stats feed the ordering policy; an
//! adopted or trialed permutation takes effect at the next object
//! boundary, and is re-verified against the dependency partial order
//! before installation.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
    time::Instant,
};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use rand::RngExt;
use tracing::{debug, info, trace, warn};

use crate::{
    cache::{CacheDb, CacheDirs},
    cfg::config::OptimizerConfig,
    exec::session::SessionVars,
    filter::{
        dag::{FilterDag, Permutation},
        opt::{OptStep, OptimizerPolicy, Policy},
        stats::StatsTable,
    },
    object::{OBJ_ID_ATTR, Object},
    proto::control::SearchStats,
    runner::{FilterProcess, RunnerTable, process::RunnerInitError},
    sig::Signature,
    source::Fetcher,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

/// Where stage 1 left the object.
enum Stage1 {
    /// A cached verdict fell below its threshold.
    Dropped,
    /// Every filter resolved from cache with passing verdicts.
    Resolved,
    /// First cache miss at this permutation position.
    Miss(usize),
}

pub struct Executor {
    dag: FilterDag,
    filter_sigs: Vec<Signature>,
    module_paths: Vec<PathBuf>,
    perm: Permutation,
    policy: Policy,
    pub stats: StatsTable,
    pub search_stats: SearchStats,
    cache: Arc<StdMutex<CacheDb>>,
    runners: RunnerTable,
    session: Arc<SessionVars>,
    fetcher: Arc<Fetcher>,
    query_id: i64,
    bypass_threshold: f64,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dag: FilterDag,
        code_sigs: &[Signature],
        dirs: &CacheDirs,
        cache: Arc<StdMutex<CacheDb>>,
        session: Arc<SessionVars>,
        fetcher: Arc<Fetcher>,
        query_id: i64,
        opt_cfg: &OptimizerConfig,
    ) -> Self {
        let filter_sigs = dag
            .filters
            .iter()
            .map(|f| f.signature(code_sigs))
            .collect();
        let module_paths = code_sigs.iter().map(|s| dirs.binary_path(s)).collect();

        let perm = dag.initial_permutation();
        let policy = Policy::new(opt_cfg.policy, perm.clone(), dag.order.clone());
        let num_filters = dag.len();

        Self {
            dag,
            filter_sigs,
            module_paths,
            perm,
            policy,
            stats: StatsTable::new(num_filters),
            search_stats: SearchStats::default(),
            cache,
            runners: RunnerTable::new(),
            session,
            fetcher,
            query_id,
            bypass_threshold: opt_cfg.bypass_threshold,
        }
    }

    pub fn current_permutation(&self) -> &Permutation {
        &self.perm
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.dag.filters.iter().map(|f| f.name.clone()).collect()
    }

    /// Run one object through the pipeline. With `force_eval` stage 1 is
    /// skipped entirely and every filter runs, the reexecute contract.
    pub async fn process(&mut self, mut obj: Object, force_eval: bool) -> Result<(Verdict, Object)> {
        self.search_stats.objs_total += 1;
        let stack_start = Instant::now();

        // Empty filter chain: everything passes.
        if self.dag.is_empty() {
            self.search_stats.objs_processed += 1;
            self.search_stats.objs_passed += 1;
            return Ok((Verdict::Pass, obj));
        }

        let verdict = if force_eval {
            self.stage2(&mut obj, 0, true).await?
        } else {
            match self.stage1(&mut obj)? {
                Stage1::Dropped => {
                    self.search_stats.objs_cache_dropped += 1;
                    Verdict::Drop
                },
                Stage1::Resolved => {
                    self.search_stats.objs_cache_passed += 1;
                    Verdict::Pass
                },
                Stage1::Miss(position) => self.stage2(&mut obj, position, false).await?,
            }
        };

        obj.stamp_stack_time(stack_start.elapsed());
        self.search_stats.objs_processed += 1;
        match verdict {
            Verdict::Pass => self.search_stats.objs_passed += 1,
            Verdict::Drop => self.search_stats.objs_dropped += 1,
        }

        self.consult_optimizer();
        Ok((verdict, obj))
    }

    /// Cache-only walk in permutation order.
    fn stage1(&mut self, obj: &mut Object) -> Result<Stage1> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("result cache poisoned"))?;

        // Prime current_attrs from the recorded initial set, capturing it
        // first if this object has never been seen.
        let id_sig = obj.id_sig();
        if cache.prime_current_attrs(self.query_id, &id_sig)? == 0 {
            cache.set_init_attrs(&id_sig, &obj.attr_sig_set())?;
            cache.prime_current_attrs(self.query_id, &id_sig)?;
        }

        for idx in 0..self.perm.len() {
            let filter = self.perm.elt(idx);
            let spec = &self.dag.filters[filter];

            let Some(hit) = cache.lookup(&id_sig, &self.filter_sigs[filter], self.query_id)?
            else {
                trace!(object = %id_sig, filter = %spec.name, "stage1 cache miss");
                return Ok(Stage1::Miss(idx));
            };

            let passed = hit.confidence >= spec.threshold;
            trace!(
                object = %id_sig,
                filter = %spec.name,
                confidence = hit.confidence,
                threshold = spec.threshold,
                "stage1 cache hit"
            );
            self.stats.record_cache_hit(filter, passed);

            if !passed {
                // Drop immediately: no body fetch, no runner.
                return Ok(Stage1::Dropped);
            }

            // Accept that the filter "ran": extend current_attrs with its
            // output set and replay captured attribute bytes so later
            // consumers see them.
            cache.combine_attr_set(self.query_id, hit.entry_id)?;
            for attr in cache.output_attrs(hit.entry_id)? {
                if obj.read_attr(&attr.name).is_none()
                    && let Some(value) = attr.value
                {
                    obj.write_attr(&attr.name, Bytes::from(value));
                }
            }
        }

        Ok(Stage1::Resolved)
    }

    /// Actual evaluation from `start` to the end of the permutation.
    async fn stage2(&mut self, obj: &mut Object, start: usize, force_eval: bool) -> Result<Verdict> {
        if !obj.has_body() {
            let uri = obj
                .read_attr(OBJ_ID_ATTR)
                .map(|a| String::from_utf8_lossy(&a.data).to_string())
                .context("object has no source URI")?;
            let body = self.fetcher.fetch_body(&uri).await?;
            obj.set_body(body);
            // The body is part of the object's pre-filter state.
            if let Ok(cache) = self.cache.lock()
                && let Some(attr) = obj.read_attr("")
            {
                cache.add_current_attr(self.query_id, "", &attr.sig)?;
            }
        }

        for idx in start..self.perm.len() {
            let filter = self.perm.elt(idx);
            let spec = &self.dag.filters[filter];

            if self.runners.is_failed(filter) {
                // A crashed filter fails every later object it would have
                // judged, without respawning.
                self.stats.record_error(filter);
                return Ok(Verdict::Drop);
            }

            // Bypass draw: skip the filter and pass the object through
            // this stage, collecting an unbiased selectivity sample.
            if !force_eval && rand::rng().random::<f64>() > self.bypass_threshold {
                self.stats.record_bypass(filter);
                continue;
            }

            let mut proc = match self.runners.take_live(filter) {
                Some(proc) => proc,
                None => match self.spawn_runner(filter).await {
                    Ok(proc) => Box::new(proc),
                    Err(e) => {
                        warn!(filter = %spec.name, "runner init failed: {e:#}");
                        self.runners.mark_failed(filter);
                        self.stats.record_error(filter);
                        return Err(e.context(RunnerInitError(spec.name.clone())));
                    },
                },
            };

            let eval_start = Instant::now();
            let outcome = match proc.evaluate(obj, &self.session).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(filter = %spec.name, "filter failed mid-eval: {e:#}");
                    proc.kill().await;
                    self.runners.mark_failed(filter);
                    self.stats.record_error(filter);
                    return Ok(Verdict::Drop);
                },
            };
            let elapsed = eval_start.elapsed();
            self.runners.put_live(filter, proc);

            let passed = outcome.verdict >= spec.threshold as f64;
            self.stats.record_exec(
                filter,
                &self.perm.as_slice()[..idx],
                passed,
                elapsed.as_nanos() as u64,
            );
            obj.stamp_filter_time(&spec.name, elapsed);

            // Cache the execution; a write failure costs the entry, not
            // the verdict.
            let confidence = outcome.verdict.floor() as i32;
            if let Ok(mut cache) = self.cache.lock() {
                if let Err(e) = cache.insert_entry(
                    &obj.id_sig(),
                    &self.filter_sigs[filter],
                    confidence,
                    self.query_id,
                    &outcome.input,
                    &outcome.output,
                    &outcome.output_values,
                ) {
                    warn!(filter = %spec.name, "cache insert failed: {e:#}");
                }
            }

            debug!(
                object = %obj.id_sig(),
                filter = %spec.name,
                verdict = outcome.verdict,
                elapsed_ns = elapsed.as_nanos() as u64,
                "filter evaluated"
            );

            if !passed {
                return Ok(Verdict::Drop);
            }
        }

        Ok(Verdict::Pass)
    }

    async fn spawn_runner(&self, filter: usize) -> Result<FilterProcess> {
        let spec = &self.dag.filters[filter];
        let mut last_err = None;
        // The search may carry several code modules; the filter's
        // symbols live in one of them.
        for path in &self.module_paths {
            match FilterProcess::spawn(spec, path, &spec.blob).await {
                Ok(proc) => return Ok(proc),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => bail!("no filter code modules installed"),
        }
    }

    /// Feed the policy and install its directive for the next object.
    fn consult_optimizer(&mut self) {
        let step = self.policy.step(&self.stats);
        let proposal = match step {
            OptStep::Hold => return,
            OptStep::Adopt(p) | OptStep::Trial(p) => p,
        };
        // Never adopt an order that violates the dependency DAG, no
        // matter what the policy proposed.
        if !proposal.respects(&self.dag.order) {
            warn!(order = ?proposal, "optimizer proposed an invalid permutation; ignored");
            return;
        }
        if proposal != self.perm {
            info!(order = ?proposal, "installing new filter order");
            self.perm = proposal;
        }
    }

    /// Reexecute contract: run the full chain ignoring stage-1 results
    /// and hand back the derived attributes.
    pub async fn reexecute(&mut self, obj: Object) -> Result<Object> {
        let (_, obj) = self.process(obj, true).await?;
        Ok(obj)
    }

    /// Clean search teardown: fini every live runner and release this
    /// query's scoped cache state.
    pub async fn shutdown(&mut self) {
        self.runners.finish_all().await;
        if let Ok(cache) = self.cache.lock()
            && let Err(e) = cache.drop_query(self.query_id)
        {
            warn!("failed to clear current_attrs: {e:#}");
        }
    }
}
