// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fixed-point driver scenarios: convergence, oscillation abort, class
//! dispatch, and cleanup interleaving.

#![allow(missing_docs)]

use std::cell::Cell;
use std::rc::Rc;

use reforge_core::algebra::{add_op, const_i64, i64_bytes, mul_op, neg_op, scalar_i64};
use reforge_core::{
    Equilibrium, FnNodeRewrite, Graph, GraphRewrite, MergeRewrite, OnError, Pattern,
    PatternRewrite, Profile, RewriteConfig, RewriteError, TrackTarget, Transform,
};

fn equilibrium_profile(profile: Profile) -> reforge_core::EquilibriumProfile {
    match profile {
        Profile::Equilibrium(p) => p,
        other => panic!("unexpected profile shape: {other}"),
    }
}

fn zero_add_elim() -> PatternRewrite {
    PatternRewrite::new(
        Pattern::app(add_op(), vec![Pattern::var("x"), Pattern::lit_i64(0)]),
        Pattern::var("x"),
    )
    .expect("valid pattern")
}

fn one_mul_elim() -> PatternRewrite {
    PatternRewrite::new(
        Pattern::app(mul_op(), vec![Pattern::var("x"), Pattern::lit_i64(1)]),
        Pattern::var("x"),
    )
    .expect("valid pattern")
}

#[test]
fn algebraic_identities_converge_to_the_bare_input() {
    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let zero = const_i64(&mut g, 0);
    let one = const_i64(&mut g, 1);
    let sum = g.add_node(add_op(), &[a, zero]).expect("add");
    let prod = g.add_node(mul_op(), &[g.out(sum, 0), one]).expect("mul");
    g.set_outputs(&[g.out(prod, 0)]).expect("live");

    let driver = Equilibrium::new("identities", RewriteConfig::default())
        .with_local(Rc::new(zero_add_elim()))
        .with_local(Rc::new(one_mul_elim()));
    let prof = equilibrium_profile(driver.rewrite(&mut g).expect("run"));

    assert_eq!(g.outputs(), &[a]);
    assert!(g.apply_nodes().is_empty());
    assert!(prof.passes.len() <= 3);
    assert!(prof.max_use_hit.is_none());
    for stats in &prof.rewriters {
        assert_eq!(stats.applied, 1, "each rule fires exactly once: {}", stats.name);
    }
}

#[test]
fn oscillating_rewrites_are_stopped_by_the_use_bound() {
    let swap = PatternRewrite::new(
        Pattern::app(add_op(), vec![Pattern::var("x"), Pattern::var("y")]),
        Pattern::app(add_op(), vec![Pattern::var("y"), Pattern::var("x")]),
    )
    .expect("valid pattern");

    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let n = g.add_node(add_op(), &[a, b]).expect("add");
    g.set_outputs(&[g.out(n, 0)]).expect("live");

    let config = RewriteConfig {
        max_use_ratio: 5.0,
        ..RewriteConfig::default()
    };
    let driver = Equilibrium::new("oscillate", config).with_local(Rc::new(swap));
    let prof = equilibrium_profile(driver.rewrite(&mut g).expect("warn policy absorbs"));

    assert!(prof.max_use_hit.is_some());
    let total: u64 = prof.rewriters.iter().map(|s| s.applied).sum();
    // One application over the bound, never more.
    assert!(total <= 6);
    // The graph is still a single well-formed addition.
    let root = g.owner(g.outputs()[0]).expect("computed").0;
    assert_eq!(g.node(root).inputs().len(), 2);
}

#[test]
fn use_bound_abort_raises_under_the_raise_policy() {
    let swap = PatternRewrite::new(
        Pattern::app(add_op(), vec![Pattern::var("x"), Pattern::var("y")]),
        Pattern::app(add_op(), vec![Pattern::var("y"), Pattern::var("x")]),
    )
    .expect("valid pattern");

    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let n = g.add_node(add_op(), &[a, b]).expect("add");
    g.set_outputs(&[g.out(n, 0)]).expect("live");

    let config = RewriteConfig {
        on_error: OnError::Raise,
        max_use_ratio: 3.0,
    };
    let driver = Equilibrium::new("oscillate", config).with_local(Rc::new(swap));
    let err = driver.rewrite(&mut g).expect_err("must abort");
    assert!(matches!(err, RewriteError::MaxUseExceeded { .. }));
}

#[test]
fn class_tracked_locals_fire_for_every_operator_in_the_class() {
    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let sum = g.add_node(add_op(), &[a, b]).expect("add");
    let prod = g.add_node(mul_op(), &[g.out(sum, 0), b]).expect("mul");
    let minus = g.add_node(neg_op(), &[g.out(prod, 0)]).expect("neg");
    g.set_outputs(&[g.out(minus, 0)]).expect("live");

    let binop_visits = Rc::new(Cell::new(0usize));
    let watcher = {
        let visits = binop_visits.clone();
        FnNodeRewrite::new("binop-watcher", move |_g, _node| {
            visits.set(visits.get() + 1);
            Ok(Transform::Unchanged)
        })
        .with_tracks(vec![TrackTarget::Class("binop")])
    };

    let driver =
        Equilibrium::new("classes", RewriteConfig::default()).with_local(Rc::new(watcher));
    driver.rewrite(&mut g).expect("run");

    // add and mul are binops; neg is not.
    assert_eq!(binop_visits.get(), 2);
}

#[test]
fn cleanup_merges_duplicates_created_by_locals() {
    // neg(x) -> mul(x, -1) manufactures a fresh -1 constant per hit; the
    // merge cleanup folds them onto one.
    let expand_neg = PatternRewrite::new(
        Pattern::app(neg_op(), vec![Pattern::var("x")]),
        Pattern::app(
            mul_op(),
            vec![
                Pattern::var("x"),
                Pattern::constant(scalar_i64(), i64_bytes(-1)),
            ],
        ),
    )
    .expect("valid pattern");

    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let na = g.add_node(neg_op(), &[a]).expect("neg");
    let nb = g.add_node(neg_op(), &[b]).expect("neg");
    let sum = g
        .add_node(add_op(), &[g.out(na, 0), g.out(nb, 0)])
        .expect("add");
    g.set_outputs(&[g.out(sum, 0)]).expect("live");

    let driver = Equilibrium::new("expand-neg", RewriteConfig::default())
        .with_local(Rc::new(expand_neg))
        .with_cleanup(Rc::new(MergeRewrite::new()));
    driver.rewrite(&mut g).expect("run");

    // No neg nodes remain, and the two manufactured constants merged.
    let minus_ones: Vec<_> = g
        .variables()
        .iter()
        .copied()
        .filter(|&v| g.constant_data(v).map(|d| &d[..]) == Some(&i64_bytes(-1)[..]))
        .collect();
    assert_eq!(minus_ones.len(), 1);
    assert!(!g.is_resident_node(na));
    assert!(!g.is_resident_node(nb));
}
