// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pattern-rewrite scenarios: unification, literals, constraints, the
//! single-client gate, and retargeting.

#![allow(missing_docs)]

use std::rc::Rc;

use reforge_core::algebra::{add_op, const_i64, f64_bytes, neg_op, scalar_f64, scalar_i64};
use reforge_core::{
    Graph, GraphRewrite, NewTreePolicy, Pattern, PatternRewrite, TopoRewrite, TrackTarget,
};

fn swap_add() -> PatternRewrite {
    PatternRewrite::new(
        Pattern::app(add_op(), vec![Pattern::var("x"), Pattern::var("y")]),
        Pattern::app(add_op(), vec![Pattern::var("y"), Pattern::var("x")]),
    )
    .expect("valid pattern")
}

#[test]
fn commutativity_swap_applies_once_per_pass() {
    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let n = g.add_node(add_op(), &[a, b]).expect("add");
    g.set_outputs(&[g.out(n, 0)]).expect("live");

    let driver = TopoRewrite::new(Rc::new(swap_add())).with_new_trees(NewTreePolicy::Ignore);
    driver.rewrite(&mut g).expect("pass");

    let root = g.owner(g.outputs()[0]).expect("computed").0;
    assert_eq!(g.node(root).inputs(), &[b, a]);
}

#[test]
fn literal_terminal_matches_constant_payloads() {
    // add(x, 0) -> x
    let zero_elim = PatternRewrite::new(
        Pattern::app(add_op(), vec![Pattern::var("x"), Pattern::lit_i64(0)]),
        Pattern::var("x"),
    )
    .expect("valid pattern");

    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let zero = const_i64(&mut g, 0);
    let one = const_i64(&mut g, 1);
    let n0 = g.add_node(add_op(), &[a, zero]).expect("add");
    let n1 = g.add_node(add_op(), &[a, one]).expect("add");
    g.set_outputs(&[g.out(n0, 0), g.out(n1, 0)]).expect("live");

    TopoRewrite::new(Rc::new(zero_elim))
        .rewrite(&mut g)
        .expect("pass");

    assert_eq!(g.outputs()[0], a);
    assert!(g.is_resident_node(n1), "add(a, 1) must not match the zero literal");
}

#[test]
fn constraints_gate_the_match() {
    let never = PatternRewrite::new(
        Pattern::app(
            add_op(),
            vec![
                Pattern::guarded(Pattern::var("x"), |_g, _v| false),
                Pattern::var("y"),
            ],
        ),
        Pattern::var("y"),
    )
    .expect("valid pattern");

    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let n = g.add_node(add_op(), &[a, b]).expect("add");
    g.set_outputs(&[g.out(n, 0)]).expect("live");

    TopoRewrite::new(Rc::new(never))
        .rewrite(&mut g)
        .expect("pass");

    assert!(g.is_resident_node(n));
}

#[test]
fn shared_intermediates_block_the_match_unless_allowed() {
    let fold_neg = |allow: bool| {
        PatternRewrite::new(
            Pattern::app(
                neg_op(),
                vec![Pattern::app(add_op(), vec![Pattern::var("x"), Pattern::var("y")])],
            ),
            Pattern::app(
                add_op(),
                vec![
                    Pattern::app(neg_op(), vec![Pattern::var("x")]),
                    Pattern::app(neg_op(), vec![Pattern::var("y")]),
                ],
            ),
        )
        .expect("valid pattern")
        .allow_multiple_clients(allow)
    };

    let build = || {
        let mut g = Graph::new();
        let a = g.add_input(scalar_i64());
        let b = g.add_input(scalar_i64());
        let sum = g.add_node(add_op(), &[a, b]).expect("add");
        let minus = g.add_node(neg_op(), &[g.out(sum, 0)]).expect("neg");
        // The add output also escapes to the boundary, so it has two
        // clients.
        g.set_outputs(&[g.out(minus, 0), g.out(sum, 0)]).expect("live");
        (g, minus)
    };

    let (mut g, minus) = build();
    TopoRewrite::new(Rc::new(fold_neg(false)))
        .rewrite(&mut g)
        .expect("pass");
    assert!(g.is_resident_node(minus), "shared add must block the rewrite");

    let (mut g, minus) = build();
    TopoRewrite::new(Rc::new(fold_neg(true)))
        .with_new_trees(NewTreePolicy::Ignore)
        .rewrite(&mut g)
        .expect("pass");
    assert!(!g.is_resident_node(minus), "allow_multiple_clients lifts the gate");
}

#[test]
fn type_incompatible_reifications_are_rejected() {
    let to_f64 = PatternRewrite::new(
        Pattern::app(add_op(), vec![Pattern::var("x"), Pattern::var("y")]),
        Pattern::constant(scalar_f64(), f64_bytes(0.0)),
    )
    .expect("valid pattern");

    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let n = g.add_node(add_op(), &[a, b]).expect("add");
    g.set_outputs(&[g.out(n, 0)]).expect("live");

    TopoRewrite::new(Rc::new(to_f64))
        .rewrite(&mut g)
        .expect("pass");

    assert!(g.is_resident_node(n), "an f64 cannot stand in for an i64 sum");
}

#[test]
fn retargeting_rewrites_nodes_reached_from_the_tracked_one() {
    // Track neg, but swap the add feeding it.
    let swap_below_neg = PatternRewrite::new(
        Pattern::app(add_op(), vec![Pattern::var("x"), Pattern::var("y")]),
        Pattern::app(add_op(), vec![Pattern::var("y"), Pattern::var("x")]),
    )
    .expect("valid pattern")
    .with_retarget(vec![TrackTarget::Instance(neg_op())], |g, node| {
        g.node(node)
            .inputs()
            .iter()
            .filter_map(|&v| g.owner(v).map(|(n, _)| n))
            .collect()
    });

    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let sum = g.add_node(add_op(), &[a, b]).expect("add");
    let minus = g.add_node(neg_op(), &[g.out(sum, 0)]).expect("neg");
    // A second, untouched add proves only the reached node is rewritten.
    let other = g.add_node(add_op(), &[b, a]).expect("add");
    g.set_outputs(&[g.out(minus, 0), g.out(other, 0)]).expect("live");

    TopoRewrite::new(Rc::new(swap_below_neg))
        .with_new_trees(NewTreePolicy::Ignore)
        .rewrite(&mut g)
        .expect("pass");

    let rewritten = g
        .owner(g.node(minus).inputs()[0])
        .expect("neg input is computed")
        .0;
    assert_eq!(g.node(rewritten).inputs(), &[b, a]);
    assert!(g.is_resident_node(other));
}
