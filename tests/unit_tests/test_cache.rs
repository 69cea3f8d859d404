// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use diamondd::{
    cache::CacheDb,
    sig::{AttrSigSet, Signature},
};

fn sig(label: &str) -> Signature {
    Signature::of_bytes(label.as_bytes())
}

fn set(pairs: &[(&str, &str)]) -> AttrSigSet {
    let mut out = AttrSigSet::new();
    for (name, value) in pairs {
        out.insert(*name, sig(value));
    }
    out
}

#[test]
fn test_lookup_miss_on_empty_cache() -> Result<()> {
    let cache = CacheDb::open_in_memory()?;
    assert!(cache.lookup(&sig("obj"), &sig("filt"), 1)?.is_none());
    Ok(())
}

#[test]
fn test_insert_then_hit_with_subset_inputs() -> Result<()> {
    let mut cache = CacheDb::open_in_memory()?;
    let (obj, filt) = (sig("obj"), sig("filt"));
    let query = 7;

    // Object arrives with a body attribute; capture and prime.
    let initial = set(&[("", "RED-CIRCLE")]);
    cache.set_init_attrs(&obj, &initial)?;
    assert_eq!(cache.prime_current_attrs(query, &obj)?, 1);

    // The filter read the body and wrote one derived attribute.
    let input = set(&[("", "RED-CIRCLE")]);
    let output = set(&[("red.score", "0.93")]);
    cache.insert_entry(
        &obj,
        &filt,
        4,
        query,
        &input,
        &output,
        &[("red.score".to_string(), b"0.93".to_vec())],
    )?;

    // A fresh query over the same object state hits.
    let query2 = 8;
    assert_eq!(cache.prime_current_attrs(query2, &obj)?, 1);
    let hit = cache
        .lookup(&obj, &filt, query2)?
        .expect("entry should match");
    assert_eq!(hit.confidence, 4);
    assert_eq!(hit.iattr_sig, input.signature());

    // The hit's outputs are replayable.
    let attrs = cache.output_attrs(hit.entry_id)?;
    assert_eq!(attrs.len(), 1);
    assert_eq!(attrs[0].name, "red.score");
    assert_eq!(attrs[0].value.as_deref(), Some(&b"0.93"[..]));
    Ok(())
}

#[test]
fn test_lookup_rejects_entry_with_unseen_input() -> Result<()> {
    let mut cache = CacheDb::open_in_memory()?;
    let (obj, filt) = (sig("obj"), sig("filt"));
    let query = 1;

    cache.set_init_attrs(&obj, &set(&[("", "BODY")]))?;
    cache.prime_current_attrs(query, &obj)?;

    // The cached execution read an attribute this query has not seen.
    let input = set(&[("", "BODY"), ("edge.map", "v1")]);
    cache.insert_entry(&obj, &filt, 2, query, &input, &AttrSigSet::new(), &[])?;

    let query2 = 2;
    cache.prime_current_attrs(query2, &obj)?;
    assert!(
        cache.lookup(&obj, &filt, query2)?.is_none(),
        "entry with unseen input attr must not match"
    );
    Ok(())
}

#[test]
fn test_combine_extends_current_attrs() -> Result<()> {
    let mut cache = CacheDb::open_in_memory()?;
    let (obj, f1, f2) = (sig("obj"), sig("f1"), sig("f2"));
    let query = 3;

    cache.set_init_attrs(&obj, &set(&[("", "BODY")]))?;
    cache.prime_current_attrs(query, &obj)?;

    // f1 derives edge.map from the body.
    let e1 = cache.insert_entry(
        &obj,
        &f1,
        5,
        query,
        &set(&[("", "BODY")]),
        &set(&[("edge.map", "v1")]),
        &[],
    )?;
    // f2 read the derived attribute.
    cache.insert_entry(
        &obj,
        &f2,
        9,
        query,
        &set(&[("edge.map", "v1")]),
        &AttrSigSet::new(),
        &[],
    )?;

    // Fresh query: f2 alone cannot match (edge.map unseen) until f1's
    // hit extends the current set.
    let query2 = 4;
    cache.prime_current_attrs(query2, &obj)?;
    assert!(cache.lookup(&obj, &f2, query2)?.is_none());

    let hit1 = cache.lookup(&obj, &f1, query2)?.expect("f1 hit");
    cache.combine_attr_set(query2, hit1.entry_id)?;

    let hit2 = cache.lookup(&obj, &f2, query2)?.expect("f2 hit after combine");
    assert_eq!(hit2.confidence, 9);
    assert_eq!(e1, hit1.entry_id);
    Ok(())
}

#[test]
fn test_queries_are_isolated() -> Result<()> {
    let mut cache = CacheDb::open_in_memory()?;
    let obj = sig("obj");
    cache.set_init_attrs(&obj, &set(&[("", "BODY")]))?;

    cache.prime_current_attrs(10, &obj)?;
    let filt = sig("f");
    cache.insert_entry(
        &obj,
        &filt,
        1,
        10,
        &set(&[("", "BODY")]),
        &set(&[("derived", "x")]),
        &[],
    )?;

    // Query 11 never primed: nothing current, so nothing matches even
    // though query 10 has the attributes.
    assert!(cache.lookup(&obj, &filt, 11)?.is_none());
    Ok(())
}

#[test]
fn test_unknown_object_prime_reports_empty() -> Result<()> {
    let mut cache = CacheDb::open_in_memory()?;
    assert_eq!(cache.prime_current_attrs(1, &sig("never-seen"))?, 0);
    Ok(())
}
