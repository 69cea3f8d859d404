// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use diamondd::filter::{
    dag::FilterDag,
    opt::{OptStep, OptimizerPolicy, Policy, PolicyKind},
    stats::StatsTable,
};

use super::test_dag::filt;

/// Feed `stats` executions for a two-filter chain with the given pass
/// rates, alternating orders so both contexts accumulate samples.
fn feed_two_filters(stats: &mut StatsTable, rate0: f64, rate1: f64, rounds: u64) {
    for i in 0..rounds {
        let p0 = (i as f64 / rounds as f64) < rate0;
        let p1 = (i as f64 / rounds as f64) < rate1;
        stats.record_exec(0, &[], p0, 1_000);
        stats.record_exec(1, &[0], p1, 1_000);
        stats.record_exec(1, &[], p1, 1_000);
        stats.record_exec(0, &[1], p0, 1_000);
    }
}

#[test]
fn test_hill_climb_adopts_selective_first() -> Result<()> {
    let dag = FilterDag::build(vec![filt("picky", &[], 0), filt("lenient", &[], 0)])?;
    let mut stats = StatsTable::new(2);
    // picky passes 10%, lenient passes 90%, equal cost.
    feed_two_filters(&mut stats, 0.1, 0.9, 100);

    let mut policy = Policy::new(
        PolicyKind::HillClimb,
        dag.initial_permutation(),
        dag.order.clone(),
    );

    let step = policy.step(&stats);
    let adopted = match step {
        OptStep::Adopt(p) => p,
        other => panic!("expected adoption, got {other:?}"),
    };
    assert_eq!(adopted.as_slice(), &[0, 1], "selective filter must go first");

    // No oscillation while resting: the next many steps hold.
    for _ in 0..50 {
        assert!(matches!(policy.step(&stats), OptStep::Hold));
    }
    assert_eq!(policy.result().as_slice(), &[0, 1]);
    Ok(())
}

#[test]
fn test_hill_climb_requests_samples_when_cold() -> Result<()> {
    let dag = FilterDag::build(vec![filt("a", &[], 0), filt("b", &[], 0)])?;
    let stats = StatsTable::new(2);

    let mut policy = Policy::new(
        PolicyKind::HillClimb,
        dag.initial_permutation(),
        dag.order.clone(),
    );
    assert!(matches!(policy.step(&stats), OptStep::Trial(_)));
    Ok(())
}

#[test]
fn test_best_first_adopts_cheapest_order() -> Result<()> {
    let dag = FilterDag::build(vec![filt("picky", &[], 0), filt("lenient", &[], 0)])?;
    let mut stats = StatsTable::new(2);
    feed_two_filters(&mut stats, 0.1, 0.9, 100);

    let mut policy = Policy::new(
        PolicyKind::BestFirst,
        dag.initial_permutation(),
        dag.order.clone(),
    );

    // Drive until adoption; trial requests are allowed along the way.
    for _ in 0..100 {
        match policy.step(&stats) {
            OptStep::Adopt(p) => {
                assert_eq!(p.as_slice(), &[0, 1]);
                return Ok(());
            },
            OptStep::Trial(p) => assert!(p.respects(&dag.order)),
            OptStep::Hold => {},
        }
    }
    panic!("best-first never adopted an order");
}

#[test]
fn test_policies_never_propose_invalid_orders() -> Result<()> {
    let dag = FilterDag::build(vec![
        filt("f_small", &[], 0),
        filt("f_big", &["f_small"], 0),
        filt("x", &[], 0),
    ])?;
    let mut stats = StatsTable::new(3);
    for i in 0..50u64 {
        stats.record_exec(0, &[], i % 2 == 0, 500);
        stats.record_exec(1, &[0], i % 3 == 0, 500);
        stats.record_exec(2, &[0, 1], i % 5 == 0, 500);
        stats.record_exec(0, &[2], i % 2 == 0, 500);
        stats.record_exec(1, &[], i % 3 == 0, 500);
        stats.record_exec(2, &[], i % 5 == 0, 500);
    }

    for kind in [
        PolicyKind::HillClimb,
        PolicyKind::BestFirst,
        PolicyKind::Indep,
        PolicyKind::Random,
        PolicyKind::Static,
    ] {
        let mut policy =
            Policy::new(kind, dag.initial_permutation(), dag.order.clone());
        for _ in 0..300 {
            match policy.step(&stats) {
                OptStep::Adopt(p) | OptStep::Trial(p) => {
                    assert!(p.respects(&dag.order), "{kind:?} proposed {p:?}");
                },
                OptStep::Hold => {},
            }
        }
    }
    Ok(())
}

#[test]
fn test_static_policy_never_moves() -> Result<()> {
    let dag = FilterDag::build(vec![filt("a", &[], 0), filt("b", &[], 0)])?;
    let mut stats = StatsTable::new(2);
    feed_two_filters(&mut stats, 0.5, 0.5, 50);

    let mut policy = Policy::new(
        PolicyKind::Static,
        dag.initial_permutation(),
        dag.order.clone(),
    );
    for _ in 0..100 {
        assert!(matches!(policy.step(&stats), OptStep::Hold));
    }
    Ok(())
}
