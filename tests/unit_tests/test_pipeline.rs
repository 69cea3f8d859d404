// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Executor walks that resolve entirely from the result cache: no
//! runner subprocess and no body fetch are involved, which is exactly
//! what stage 1 promises.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use diamondd::{
    cache::{CacheDb, CacheDirs},
    cfg::config::{FetcherConfig, OptimizerConfig},
    exec::{Executor, SessionVars, Verdict},
    filter::dag::FilterDag,
    object::{OBJ_ID_ATTR, Object},
    sig::{AttrSigSet, Signature},
    source::Fetcher,
};

use super::test_dag::filt;

// Port 9 (discard) is reliably closed; the cold-cache test depends on
// the body fetch failing fast.
const URI: &str = "http://127.0.0.1:9/obj/1";

fn build_executor(
    dag: FilterDag,
    cache: Arc<StdMutex<CacheDb>>,
    dirs: &CacheDirs,
) -> Executor {
    Executor::new(
        dag,
        &[Signature::of_bytes(b"module")],
        dirs,
        cache,
        Arc::new(SessionVars::new()),
        Arc::new(Fetcher::new(FetcherConfig::default())),
        1,
        &OptimizerConfig::default(),
    )
}

/// Insert a cache entry matching the initial state of an object made
/// from `URI`, for the filter at `index` in the dag.
fn warm_entry(
    cache: &Arc<StdMutex<CacheDb>>,
    dag: &FilterDag,
    index: usize,
    confidence: i32,
) -> Result<()> {
    let obj_sig = Signature::of_bytes(URI.as_bytes());
    let filter_sig = dag.filters[index].signature(&[Signature::of_bytes(b"module")]);

    let mut input = AttrSigSet::new();
    input.insert(OBJ_ID_ATTR, Signature::of_bytes(URI.as_bytes()));

    let mut cache = cache.lock().expect("cache lock");
    cache.set_init_attrs(&obj_sig, &input)?;
    cache.insert_entry(
        &obj_sig,
        &filter_sig,
        confidence,
        999,
        &input,
        &AttrSigSet::new(),
        &[],
    )?;
    Ok(())
}

#[tokio::test]
async fn test_empty_filter_set_passes_everything() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dirs = CacheDirs::new(tmp.path());
    dirs.ensure()?;
    let cache = Arc::new(StdMutex::new(CacheDb::open_in_memory()?));

    let dag = FilterDag::build(Vec::new())?;
    let mut exec = build_executor(dag, cache, &dirs);

    let (verdict, _) = exec.process(Object::from_uri(URI), false).await?;
    assert_eq!(verdict, Verdict::Pass);
    assert_eq!(exec.search_stats.objs_passed, 1);
    Ok(())
}

#[tokio::test]
async fn test_warm_cache_resolves_object_without_runners() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dirs = CacheDirs::new(tmp.path());
    dirs.ensure()?;
    let cache = Arc::new(StdMutex::new(CacheDb::open_in_memory()?));

    let dag = FilterDag::build(vec![
        filt("f_has_red", &[], 0),
        filt("f_has_circle", &[], 0),
    ])?;
    warm_entry(&cache, &dag, 0, 4)?;
    warm_entry(&cache, &dag, 1, 2)?;

    let mut exec = build_executor(dag, cache, &dirs);
    let (verdict, obj) = exec.process(Object::from_uri(URI), false).await?;

    assert_eq!(verdict, Verdict::Pass);
    assert!(!obj.has_body(), "stage 1 must not fetch the body");
    assert_eq!(exec.search_stats.objs_cache_passed, 1);
    assert_eq!(exec.stats.counters(0).cache_passed, 1);
    assert_eq!(exec.stats.counters(1).cache_passed, 1);
    assert_eq!(exec.stats.counters(0).called, 0, "no actual execution");
    Ok(())
}

#[tokio::test]
async fn test_warm_cache_drop_skips_rest_of_chain() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dirs = CacheDirs::new(tmp.path());
    dirs.ensure()?;
    let cache = Arc::new(StdMutex::new(CacheDb::open_in_memory()?));

    let dag = FilterDag::build(vec![
        filt("f_first", &[], 10),
        filt("f_second", &[], 0),
    ])?;
    // First filter in the initial order dropped this object before.
    warm_entry(&cache, &dag, 0, 0)?;

    let mut exec = build_executor(dag, cache, &dirs);
    let (verdict, obj) = exec.process(Object::from_uri(URI), false).await?;

    assert_eq!(verdict, Verdict::Drop);
    assert!(!obj.has_body(), "a cached drop must not fetch the body");
    assert_eq!(exec.search_stats.objs_cache_dropped, 1);
    assert_eq!(exec.stats.counters(0).cache_dropped, 1);
    // The second filter was never consulted.
    assert_eq!(exec.stats.counters(1).cache_passed, 0);
    assert_eq!(exec.stats.counters(1).cache_dropped, 0);
    Ok(())
}

#[tokio::test]
async fn test_cold_cache_reaches_stage_two() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dirs = CacheDirs::new(tmp.path());
    dirs.ensure()?;
    let cache = Arc::new(StdMutex::new(CacheDb::open_in_memory()?));

    let dag = FilterDag::build(vec![filt("f_cold", &[], 0)])?;
    let mut exec = build_executor(dag, cache, &dirs);

    // No cache entry and no real runner binary: the filter fails to
    // spawn, which by the containment policy drops the object rather
    // than erroring the search. The body fetch also fails here (no
    // retriever is running), which surfaces as an object-level error.
    let result = exec.process(Object::from_uri(URI), false).await;
    assert!(result.is_err() || matches!(result, Ok((Verdict::Drop, _))));
    Ok(())
}
