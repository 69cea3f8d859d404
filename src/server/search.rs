// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-connection search state.
//!
//! A control connection stages search ingredients (spec, scope, blobs,
//! code modules, push-attr set) while stopped; `start` validates the
//! combination, builds the executor and spawns the pump task that pulls
//! objects from the scope and feeds passing ones to the blast queue.
//! `stop` cancels the pump but keeps staged state and warm runners, so a
//! stopped search can start again cheaply; replacing the spec or closing
//! the connection tears the executor down for real.

use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicI64, Ordering},
};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cache::{CacheDb, CacheDirs},
    cfg::config::Config,
    exec::{Executor, SessionVars, Verdict},
    filter::{dag::FilterDag, spec::parse_spec_file},
    object::Object,
    proto::{
        blast::BlastObject,
        control::{FilterStatsEntry, StatsResponse},
    },
    runner::process::RunnerInitError,
    scope::{CookieError, ScopeCookie},
    sig::Signature,
    source::Fetcher,
};

/// Query ids scope `current_attrs` rows; unique per executor lifetime
/// across every search in the process.
static QUERY_COUNTER: AtomicI64 = AtomicI64::new(1);

const BLAST_QUEUE_DEPTH: usize = 16;

/// Pieces the data connection needs once it pairs up by nonce.
pub struct SearchShared {
    pub blast_rx: Mutex<mpsc::Receiver<BlastObject>>,
}

/// Rejections the control dispatcher maps onto wire statuses.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("scope cookie expired")]
    CookieExpired,
    #[error("scope cookie rejected for this server")]
    KeyRejected,
    #[error("content not present in cache")]
    CacheMiss,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct Search {
    cfg: Arc<Config>,
    dirs: CacheDirs,
    cache: Arc<StdMutex<CacheDb>>,
    fetcher: Arc<Fetcher>,
    session: Arc<SessionVars>,

    // Staged ingredients.
    spec_sig: Option<Signature>,
    dag: Option<FilterDag>,
    code_sigs: Vec<Signature>,
    scope: Option<ScopeCookie>,
    push_attrs: Option<Vec<String>>,

    running: bool,
    cancel: CancellationToken,
    executor: Option<Arc<Mutex<Executor>>>,
    blast_tx: mpsc::Sender<BlastObject>,
    shared: Arc<SearchShared>,
}

impl Search {
    pub fn new(cfg: Arc<Config>, dirs: CacheDirs, cache: Arc<StdMutex<CacheDb>>) -> Self {
        let (blast_tx, blast_rx) = mpsc::channel(BLAST_QUEUE_DEPTH);
        let fetcher = Arc::new(Fetcher::new(cfg.fetcher.clone()));
        Self {
            cfg,
            dirs,
            cache,
            fetcher,
            session: Arc::new(SessionVars::new()),
            spec_sig: None,
            dag: None,
            code_sigs: Vec::new(),
            scope: None,
            push_attrs: None,
            running: false,
            cancel: CancellationToken::new(),
            executor: None,
            blast_tx,
            shared: Arc::new(SearchShared {
                blast_rx: Mutex::new(blast_rx),
            }),
        }
    }

    pub fn shared(&self) -> Arc<SearchShared> {
        Arc::clone(&self.shared)
    }

    pub fn session(&self) -> &SessionVars {
        &self.session
    }

    // ── staging ──────────────────────────────────────────────────────────

    /// Install a filter spec. Repeated sends of the same content are
    /// cheap: the file is content-addressed under its signature.
    pub async fn set_spec(&mut self, data: &[u8], claimed_sig: Signature) -> Result<(), SearchError> {
        let sig = Signature::of_bytes(data);
        if sig != claimed_sig {
            return Err(SearchError::Other(anyhow::anyhow!(
                "spec signature mismatch: claimed {claimed_sig}, computed {sig}"
            )));
        }

        if !self.dirs.has_spec(&sig) {
            self.dirs.store_spec(data).map_err(SearchError::Other)?;
        }

        let text = std::str::from_utf8(data)
            .context("filter spec is not UTF-8")
            .map_err(SearchError::Other)?;
        let filters = parse_spec_file(text).map_err(SearchError::Other)?;
        let dag = FilterDag::build(filters).map_err(SearchError::Other)?;

        // A new spec invalidates any executor built from the old one.
        self.teardown_executor().await;
        info!(spec = %sig, filters = dag.len(), "filter spec installed");
        self.spec_sig = Some(sig);
        self.dag = Some(dag);
        Ok(())
    }

    pub fn set_scope(&mut self, cookie_text: &str) -> Result<(), SearchError> {
        let cookie = ScopeCookie::parse(cookie_text).map_err(SearchError::Other)?;
        match cookie.validate_for(&self.cfg.server.server_name, Utc::now()) {
            Ok(()) => {},
            Err(CookieError::Expired(_)) => return Err(SearchError::CookieExpired),
            Err(CookieError::KeyRejected) => return Err(SearchError::KeyRejected),
        }
        info!(
            serial = %cookie.serial,
            urls = cookie.scope_urls.len(),
            "scope installed"
        );
        self.scope = Some(cookie);
        Ok(())
    }

    pub fn set_push_attrs(&mut self, names: Vec<String>) {
        self.push_attrs = if names.is_empty() { None } else { Some(names) };
    }

    pub fn set_blob(&mut self, filter_name: &str, data: &[u8]) -> Result<(), SearchError> {
        self.dirs.store_blob(data).map_err(SearchError::Other)?;
        self.attach_blob(filter_name, Bytes::copy_from_slice(data))
    }

    pub fn set_blob_by_signature(
        &mut self,
        filter_name: &str,
        sig: Signature,
    ) -> Result<(), SearchError> {
        if !self.dirs.has_blob(&sig) {
            return Err(SearchError::CacheMiss);
        }
        let data = self.dirs.read_blob(&sig).map_err(SearchError::Other)?;
        self.attach_blob(filter_name, Bytes::from(data))
    }

    fn attach_blob(&mut self, filter_name: &str, blob: Bytes) -> Result<(), SearchError> {
        let dag = self
            .dag
            .as_mut()
            .context("no filter spec installed")
            .map_err(SearchError::Other)?;
        let idx = dag
            .index_of(filter_name)
            .with_context(|| format!("no filter named {filter_name}"))
            .map_err(SearchError::Other)?;
        dag.filters[idx].blob = blob;
        Ok(())
    }

    pub fn set_obj(&mut self, sig: Signature) -> Result<(), SearchError> {
        if !self.dirs.has_binary(&sig) {
            return Err(SearchError::CacheMiss);
        }
        if !self.code_sigs.contains(&sig) {
            self.code_sigs.push(sig);
        }
        Ok(())
    }

    pub fn send_obj(&mut self, sig: Signature, data: &[u8]) -> Result<(), SearchError> {
        let computed = self.dirs.store_binary(data).map_err(SearchError::Other)?;
        if computed != sig {
            return Err(SearchError::Other(anyhow::anyhow!(
                "module signature mismatch: claimed {sig}, computed {computed}"
            )));
        }
        if !self.code_sigs.contains(&sig) {
            self.code_sigs.push(sig);
        }
        Ok(())
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    /// Transition to RUNNING: build (or reuse) the executor and spawn
    /// the pump.
    pub async fn start(&mut self, search_id: &str) -> Result<(), SearchError> {
        if self.running {
            return Err(SearchError::Other(anyhow::anyhow!(
                "search already running"
            )));
        }
        let scope_urls = {
            let scope = self
                .scope
                .as_ref()
                .context("no valid scope installed")
                .map_err(SearchError::Other)?;
            // The expiry gate holds at start time too, not just at
            // set_scope.
            if scope.expires < Utc::now() {
                return Err(SearchError::CookieExpired);
            }
            scope.scope_urls.clone()
        };
        let dag = self
            .dag
            .clone()
            .context("no filter spec installed")
            .map_err(SearchError::Other)?;

        let executor = match &self.executor {
            Some(exec) => Arc::clone(exec),
            None => {
                let query_id = QUERY_COUNTER.fetch_add(1, Ordering::Relaxed);
                let exec = Executor::new(
                    dag.clone(),
                    &self.code_sigs,
                    &self.dirs,
                    Arc::clone(&self.cache),
                    Arc::clone(&self.session),
                    Arc::clone(&self.fetcher),
                    query_id,
                    &self.cfg.optimizer,
                );
                self.snapshot_filter_configs(&dag);
                let exec = Arc::new(Mutex::new(exec));
                self.executor = Some(Arc::clone(&exec));
                exec
            },
        };

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let stream = self.fetcher.stream_scope(scope_urls, cancel.clone());
        let blast_tx = self.blast_tx.clone();
        let push_attrs = self.push_attrs.clone();
        let search_id = search_id.to_string();

        tokio::spawn(pump(
            search_id, executor, stream, blast_tx, push_attrs, cancel,
        ));
        self.running = true;
        Ok(())
    }

    /// Cancel the pump; staged state and warm runners survive for the
    /// next start.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.running = false;
    }

    async fn teardown_executor(&mut self) {
        self.cancel.cancel();
        self.running = false;
        if let Some(exec) = self.executor.take() {
            exec.lock().await.shutdown().await;
        }
    }

    /// Full teardown on connection close.
    pub async fn close(&mut self) {
        self.teardown_executor().await;
    }

    fn snapshot_filter_configs(&self, dag: &FilterDag) {
        let Some(spec_sig) = self.spec_sig else { return };
        for filt in &dag.filters {
            let fsig = filt.signature(&self.code_sigs);
            if let Err(e) = self
                .dirs
                .write_filter_config(&fsig, filt, &spec_sig, &self.code_sigs)
            {
                warn!(filter = %filt.name, "filter config snapshot failed: {e:#}");
            }
        }
    }

    // ── queries ──────────────────────────────────────────────────────────

    pub async fn stats(&self) -> Result<StatsResponse> {
        let exec = self.executor.as_ref().context("search never started")?;
        let exec = exec.lock().await;
        let dag_names: Vec<String> = exec.filter_names();
        let filters = exec
            .stats
            .snapshot()
            .into_iter()
            .zip(dag_names)
            .map(|(counters, name)| FilterStatsEntry {
                name,
                avg_exec_ns: counters.avg_exec_ns(),
                counters,
            })
            .collect();
        Ok(StatsResponse {
            search: exec.search_stats.clone(),
            filters,
        })
    }

    /// Force a fresh evaluation of one object, ignoring stage-1 hits.
    pub async fn reexecute(
        &self,
        object_uri: &str,
        attr_names: &[String],
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let exec = self.executor.as_ref().context("search never started")?;
        let obj = Object::from_uri(object_uri);
        let obj = exec.lock().await.reexecute(obj).await?;

        let out = obj
            .iter_attrs()
            .filter(|(name, _)| {
                attr_names.is_empty() || attr_names.iter().any(|a| a.as_str() == *name)
            })
            .map(|(name, attr)| (name.to_string(), attr.data.to_vec()))
            .collect();
        Ok(out)
    }
}

/// The pump: pull object references until the scope drains or the search
/// stops, run each through the executor, ship passers to the blast
/// queue. Ends by sending the end-of-search marker.
async fn pump(
    search_id: String,
    executor: Arc<Mutex<Executor>>,
    mut stream: crate::source::ScopeStream,
    blast_tx: mpsc::Sender<BlastObject>,
    push_attrs: Option<Vec<String>>,
    cancel: CancellationToken,
) {
    info!(search = %search_id, "search pump started");
    loop {
        let obj_ref = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(r) => r,
                None => break,
            },
        };

        let obj = Object::from_uri(&obj_ref.uri);
        let result = {
            let mut exec = executor.lock().await;
            // Manifests may still be arriving; refresh the progress
            // estimate alongside the per-object counters.
            exec.search_stats.objs_scope_expected = stream.expected_total();
            exec.process(obj, false).await
        };

        match result {
            Ok((Verdict::Pass, obj)) => {
                let packaged = BlastObject::package(&obj, push_attrs.as_deref());
                if blast_tx.send(packaged).await.is_err() {
                    // Client gone; nothing left to ship.
                    break;
                }
            },
            Ok((Verdict::Drop, _)) => {},
            Err(e) => {
                // A filter that never reached init-success fails the
                // search; any other failure only skips this object.
                if e.downcast_ref::<RunnerInitError>().is_some() {
                    warn!(search = %search_id, "search aborted: {e:#}");
                    break;
                }
                warn!(search = %search_id, uri = %obj_ref.uri, "object failed: {e:#}");
            },
        }
    }

    // The scope has fully drained; record the settled expected count.
    executor.lock().await.search_stats.objs_scope_expected = stream.expected_total();

    // Empty object id marks end-of-search for the blast dispatcher.
    let _ = blast_tx
        .send(BlastObject {
            object_id: String::new(),
            body: None,
            attrs: Vec::new(),
        })
        .await;
    info!(search = %search_id, "search pump finished");
}
