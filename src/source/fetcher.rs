// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTP fetcher for scope manifests and object bodies.
//!
//! A scope URL names a data-retriever endpoint that answers with an
//! XML-ish manifest stream:
//!
//! ```text
//! <objectlist>
//!   <count adjust="1000"/>
//!   <object src="obj/0001" />
//!   <object src="obj/0002" />
//! </objectlist>
//! ```
//!
//! `count adjust` entries only feed the progress estimate. Object `src`
//! values are resolved against the scope URL. The manifest format has
//! exactly these two elements, so a scanning parser is used instead of a
//! full XML stack.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::cfg::config::FetcherConfig;

/// A reference to one candidate object, not yet fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub uri: String,
}

pub struct Fetcher {
    client: reqwest::Client,
    /// Caps concurrent object-body fetches across the search.
    body_permits: Arc<Semaphore>,
    cfg: FetcherConfig,
}

impl Fetcher {
    pub fn new(cfg: FetcherConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            body_permits: Arc::new(Semaphore::new(cfg.max_object_fetches)),
            cfg,
        }
    }

    /// Fetch one object body. Concurrency-bounded; failures are the
    /// caller's cue to skip the object, never to abort the search.
    pub async fn fetch_body(&self, uri: &str) -> Result<Bytes> {
        let _permit = self
            .body_permits
            .clone()
            .acquire_owned()
            .await
            .context("fetcher torn down")?;
        let resp = self
            .client
            .get(uri)
            .send()
            .await
            .with_context(|| format!("object fetch failed for {uri}"))?;
        ensure!(
            resp.status().is_success(),
            "object fetch for {uri} returned {}",
            resp.status()
        );
        Ok(resp.bytes().await?)
    }

    /// Start streaming the scope: a driver task walks the scope URLs
    /// (small bounded number in flight), parses manifests and pushes
    /// object references into a bounded channel. Cancellation aborts
    /// pending fetches; the consumer then drains to end-of-stream.
    pub fn stream_scope(
        &self,
        scope_urls: Vec<String>,
        cancel: CancellationToken,
    ) -> ScopeStream {
        let (tx, rx) = mpsc::channel::<ObjectRef>(self.cfg.queue_depth);
        let expected = Arc::new(AtomicI64::new(0));

        let client = self.client.clone();
        let progress = Arc::clone(&expected);
        let scope_permits = self.cfg.max_scope_fetches;

        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(scope_permits));
            let mut tasks = Vec::new();

            for scope_url in scope_urls {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let client = client.clone();
                let tx = tx.clone();
                let progress = Arc::clone(&progress);
                let cancel = cancel.clone();

                tasks.push(tokio::spawn(async move {
                    let _permit = permit;
                    tokio::select! {
                        _ = cancel.cancelled() => {},
                        res = pump_manifest(&client, &scope_url, &tx, &progress) => {
                            if let Err(e) = res {
                                warn!("scope fetch for {scope_url} failed: {e:#}");
                            }
                        },
                    }
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
            // Dropping the last sender signals end-of-stream to next().
        });

        ScopeStream { rx, expected }
    }
}

/// Consumer half of the scope stream.
pub struct ScopeStream {
    rx: mpsc::Receiver<ObjectRef>,
    expected: Arc<AtomicI64>,
}

impl ScopeStream {
    /// Next object reference, or `None` once the scope is exhausted or
    /// the search stopped.
    pub async fn next(&mut self) -> Option<ObjectRef> {
        self.rx.recv().await
    }

    /// Expected total from `count adjust` entries; progress only.
    pub fn expected_total(&self) -> i64 {
        self.expected.load(Ordering::Relaxed)
    }
}

async fn pump_manifest(
    client: &reqwest::Client,
    scope_url: &str,
    tx: &mpsc::Sender<ObjectRef>,
    progress: &AtomicI64,
) -> Result<()> {
    let resp = client
        .get(scope_url)
        .send()
        .await
        .with_context(|| format!("scope fetch failed for {scope_url}"))?;
    ensure!(
        resp.status().is_success(),
        "scope fetch for {scope_url} returned {}",
        resp.status()
    );
    let text = resp.text().await?;

    let base = Url::parse(scope_url)
        .with_context(|| format!("scope URL {scope_url} is not absolute"))?;

    for entry in parse_manifest(&text) {
        match entry {
            ManifestEntry::Object(src) => {
                let uri = match base.join(&src) {
                    Ok(u) => u.to_string(),
                    Err(e) => {
                        warn!("skipping unparseable object src {src:?}: {e}");
                        continue;
                    },
                };
                if tx.send(ObjectRef { uri }).await.is_err() {
                    // Receiver gone: search stopped.
                    return Ok(());
                }
            },
            ManifestEntry::CountAdjust(n) => {
                progress.fetch_add(n, Ordering::Relaxed);
                debug!("scope {scope_url}: count adjusted by {n}");
            },
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum ManifestEntry {
    Object(String),
    CountAdjust(i64),
}

/// Scan the manifest for `<object src="...">` and `<count adjust="N">`
/// elements. Anything else is ignored.
pub fn parse_manifest(text: &str) -> Vec<ManifestEntry> {
    let mut out = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find('<') {
        rest = &rest[start + 1..];
        let Some(end) = rest.find('>') else { break };
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        if let Some(body) = tag.strip_prefix("object") {
            if let Some(src) = scan_attr(body, "src") {
                out.push(ManifestEntry::Object(src));
            }
        } else if let Some(body) = tag.strip_prefix("count")
            && let Some(adjust) = scan_attr(body, "adjust")
            && let Ok(n) = adjust.parse::<i64>()
        {
            out.push(ManifestEntry::CountAdjust(n));
        }
    }
    out
}

fn scan_attr(tag_body: &str, attr: &str) -> Option<String> {
    let pos = tag_body.find(&format!("{attr}=\""))?;
    let after = &tag_body[pos + attr.len() + 2..];
    let end = after.find('"')?;
    Some(after[..end].to_string())
}
