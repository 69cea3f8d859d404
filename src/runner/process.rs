// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Engine-side lifecycle of one filter subprocess.
//!
//! Filters are untrusted third-party code: each runs in its own child
//! process so a crash drops one object, not the server. The child is the
//! generic `diamond-filter-runner` program; the engine hands it the
//! module, entry points, arguments and blob over the handshake, then
//! serves attribute and session-variable callbacks during each eval until
//! the child reports a verdict.

use std::{collections::HashMap, path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;
use tokio::{
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    exec::session::SessionVars,
    filter::spec::FilterSpec,
    object::Object,
    runner::framing::{FrameReader, FrameWriter},
    sig::{AttrSigSet, Signature},
};

/// Environment override for the runner executable; by default a sibling
/// of the server binary named `diamond-filter-runner`.
pub const RUNNER_PATH_ENV: &str = "DIAMOND_FILTER_RUNNER";

/// A child that died before `init-success`. Unlike a mid-eval crash,
/// which only drops the current object, this is fatal to the search.
#[derive(Debug, thiserror::Error)]
#[error("filter {0} failed to initialize")]
pub struct RunnerInitError(pub String);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const FINI_TIMEOUT: Duration = Duration::from_secs(5);

/// What one eval produced, everything stage 2 needs to cache it.
#[derive(Debug)]
pub struct EvalOutcome {
    pub verdict: f64,
    /// Attributes the filter read, with the signatures it saw. A read of
    /// an absent attribute is recorded with the zero signature.
    pub input: AttrSigSet,
    /// Attributes the filter wrote.
    pub output: AttrSigSet,
    /// Bytes of the written attributes, for cache replay.
    pub output_values: Vec<(String, Vec<u8>)>,
}

pub struct FilterProcess {
    filter_name: String,
    child: Child,
    writer: FrameWriter<ChildStdin>,
    reader: FrameReader<ChildStdout>,
}

fn runner_program() -> String {
    std::env::var(RUNNER_PATH_ENV).unwrap_or_else(|_| {
        std::env::current_exe()
            .ok()
            .and_then(|exe| {
                exe.parent()
                    .map(|dir| dir.join("diamond-filter-runner").display().to_string())
            })
            .unwrap_or_else(|| "diamond-filter-runner".to_string())
    })
}

impl FilterProcess {
    /// Spawn a runner and complete the handshake: module reference, the
    /// three entry points, arguments, blob and filter name; the child
    /// answers `functions-resolved` after symbol resolution and
    /// `init-success` once the filter's init returned zero. A child that
    /// dies before `init-success` fails the whole search start.
    pub async fn spawn(filt: &FilterSpec, module_path: &Path, blob: &Bytes) -> Result<Self> {
        let mut child = Command::new(runner_program())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot spawn runner for filter {}", filt.name))?;

        let stdin = child.stdin.take().context("runner child has no stdin")?;
        let stdout = child.stdout.take().context("runner child has no stdout")?;

        let mut proc = Self {
            filter_name: filt.name.clone(),
            child,
            writer: FrameWriter::new(stdin),
            reader: FrameReader::new(stdout),
        };

        proc.writer
            .write_string(&module_path.display().to_string())
            .await?;
        proc.writer.write_string(&filt.init_function).await?;
        proc.writer.write_string(&filt.eval_function).await?;
        proc.writer.write_string(&filt.fini_function).await?;
        proc.writer.write_string_list(&filt.args).await?;
        proc.writer.write_binary(blob).await?;
        proc.writer.write_string(&filt.name).await?;

        proc.expect_tag("functions-resolved").await?;
        proc.expect_tag("init-success").await?;
        info!(filter = %proc.filter_name, "filter runner initialized");
        Ok(proc)
    }

    async fn expect_tag(&mut self, want: &str) -> Result<()> {
        let got = timeout(HANDSHAKE_TIMEOUT, self.reader.read_tag())
            .await
            .with_context(|| {
                format!("filter {} handshake timed out", self.filter_name)
            })??;
        ensure!(
            got == want,
            "filter {} handshake: expected {want}, got {got}",
            self.filter_name
        );
        Ok(())
    }

    /// Run one eval. Serves the child's callbacks until it reports
    /// `result`; any framing error or child death is a filter failure
    /// and the caller tears this runner down.
    pub async fn evaluate(
        &mut self,
        obj: &mut Object,
        session: &SessionVars,
    ) -> Result<EvalOutcome> {
        self.writer.write_tag("eval").await?;

        let mut input = AttrSigSet::new();
        let mut output = AttrSigSet::new();
        let mut output_values: Vec<(String, Vec<u8>)> = Vec::new();

        loop {
            let tag = self.reader.read_tag().await?;
            match tag.as_str() {
                "get-attribute" => {
                    let name = self
                        .reader
                        .read_string()
                        .await?
                        .context("get-attribute without a name")?;
                    match obj.read_attr(&name) {
                        Some(attr) => {
                            input.insert(&name, attr.sig);
                            let data = attr.data.clone();
                            self.writer.write_binary(&data).await?;
                        },
                        None => {
                            input.insert(&name, Signature::default());
                            self.writer.write_none().await?;
                        },
                    }
                },
                "set-attribute" => {
                    let name = self
                        .reader
                        .read_string()
                        .await?
                        .context("set-attribute without a name")?;
                    let data = self
                        .reader
                        .read_binary()
                        .await?
                        .context("set-attribute without a value")?;
                    let sig = obj.write_attr(&name, Bytes::from(data.clone()));
                    output.insert(&name, sig);
                    output_values.retain(|(n, _)| n != &name);
                    output_values.push((name, data));
                },
                "omit-attribute" => {
                    let name = self
                        .reader
                        .read_string()
                        .await?
                        .context("omit-attribute without a name")?;
                    let existed = obj.omit_attr(&name);
                    self.writer.write_bool(existed).await?;
                },
                "log" => {
                    let level = self.reader.read_int().await?;
                    let msg = self
                        .reader
                        .read_string()
                        .await?
                        .unwrap_or_default();
                    self.forward_log(level, &msg);
                },
                "stdout" => {
                    if let Some(raw) = self.reader.read_binary().await? {
                        let text = String::from_utf8_lossy(&raw);
                        info!(filter = %self.filter_name, "{}", text.trim_end());
                    }
                },
                "get-session-variables" => {
                    let names = self.reader.read_string_list().await?;
                    for name in &names {
                        self.writer.write_double(session.get(name)).await?;
                    }
                },
                "update-session-variables" => {
                    let names = self.reader.read_string_list().await?;
                    let mut updates = Vec::with_capacity(names.len());
                    for name in names {
                        let value = self.reader.read_double().await?;
                        updates.push((name, value));
                    }
                    session.merge(updates);
                },
                "result" => {
                    let verdict = self.reader.read_double().await?;
                    return Ok(EvalOutcome {
                        verdict,
                        input,
                        output,
                        output_values,
                    });
                },
                other => {
                    bail!(
                        "filter {} sent unknown tag {other:?}; failing the runner",
                        self.filter_name
                    );
                },
            }
        }
    }

    // Level values follow the filter API: 1 critical, 2 error, 4 info,
    // 8 trace.
    fn forward_log(&self, level: i64, msg: &str) {
        match level {
            0..=2 => error!(filter = %self.filter_name, "{msg}"),
            4 => info!(filter = %self.filter_name, "{msg}"),
            8 => trace!(filter = %self.filter_name, "{msg}"),
            _ => debug!(filter = %self.filter_name, "{msg}"),
        }
    }

    /// Clean shutdown: ask the child to run the filter's fini and exit.
    /// Falls back to kill if the child does not oblige in time.
    pub async fn finish(mut self) -> Result<()> {
        if let Err(e) = self.writer.write_tag("fini").await {
            debug!(filter = %self.filter_name, "fini write failed: {e}");
        }
        match timeout(FINI_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(filter = %self.filter_name, %status, "runner exited");
                Ok(())
            },
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(filter = %self.filter_name, "runner ignored fini, killing");
                self.child.kill().await?;
                Ok(())
            },
        }
    }

    /// Hard teardown after a failure.
    pub async fn kill(mut self) {
        let _ = self.child.kill().await;
    }
}

/// Per-search runner table. A slot stays `Failed` for the remainder of
/// the search once its child crashed; every later evaluation of that
/// filter drops the object without respawning.
#[derive(Default)]
pub struct RunnerTable {
    slots: HashMap<usize, RunnerSlot>,
}

pub enum RunnerSlot {
    Live(Box<FilterProcess>),
    Failed,
}

impl RunnerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_failed(&self, filter: usize) -> bool {
        matches!(self.slots.get(&filter), Some(RunnerSlot::Failed))
    }

    pub fn take_live(&mut self, filter: usize) -> Option<Box<FilterProcess>> {
        match self.slots.remove(&filter) {
            Some(RunnerSlot::Live(proc)) => Some(proc),
            Some(RunnerSlot::Failed) => {
                self.slots.insert(filter, RunnerSlot::Failed);
                None
            },
            None => None,
        }
    }

    pub fn put_live(&mut self, filter: usize, proc: Box<FilterProcess>) {
        self.slots.insert(filter, RunnerSlot::Live(proc));
    }

    pub fn mark_failed(&mut self, filter: usize) {
        self.slots.insert(filter, RunnerSlot::Failed);
    }

    /// Fini every live runner, used on clean search teardown.
    pub async fn finish_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            if let RunnerSlot::Live(proc) = slot
                && let Err(e) = proc.finish().await
            {
                warn!("runner shutdown failed: {e}");
            }
        }
    }
}
