// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Detached-fragment utilities: eager constant CSE and greedy local
//! rewriting before a fragment joins the graph.

#![allow(missing_docs)]

use std::rc::Rc;

use reforge_core::algebra::{add_op, const_i64, identity_op, scalar_i64};
use reforge_core::{pre_constant_merge, pre_greedy_local_rewrite, Graph, NodeRewrite, OpStrip};

#[test]
fn detached_constants_are_canonicalized_in_place() {
    let mut g = Graph::new();
    let x = g.add_input(scalar_i64());
    let resident = g.add_node(identity_op(), &[x]).expect("identity");
    g.set_outputs(&[g.out(resident, 0)]).expect("live");

    // A detached fragment with two equal constants.
    let c1 = const_i64(&mut g, 5);
    let c2 = const_i64(&mut g, 5);
    let frag = g.add_node(add_op(), &[c1, c2]).expect("add");
    let root = g.out(frag, 0);

    let merged = pre_constant_merge(&mut g, &[root]).expect("detached merge");

    assert_eq!(merged, vec![root]);
    let inputs = g.node(frag).inputs();
    assert_eq!(inputs[0], inputs[1], "both slots share one constant");
    // The resident part of the graph is untouched.
    assert_eq!(g.node(resident).inputs(), &[x]);
}

#[test]
fn resident_nodes_are_skipped_by_the_detached_merge() {
    let mut g = Graph::new();
    let c1 = const_i64(&mut g, 5);
    let c2 = const_i64(&mut g, 5);
    let resident = g.add_node(add_op(), &[c1, c2]).expect("add");
    g.set_outputs(&[g.out(resident, 0)]).expect("live");

    let resident_out = g.out(resident, 0);
    let merged = pre_constant_merge(&mut g, &[resident_out]).expect("noop");

    assert_eq!(merged, vec![g.out(resident, 0)]);
    // Resident wiring is left alone even though the constants are equal.
    let inputs = g.node(resident).inputs();
    assert_ne!(inputs[0], inputs[1]);
}

#[test]
fn greedy_prepass_strips_detached_identity_chains() {
    let mut g = Graph::new();
    let x = g.add_input(scalar_i64());
    let anchor = g.add_node(identity_op(), &[x]).expect("identity");
    g.set_outputs(&[g.out(anchor, 0)]).expect("live");

    let c = const_i64(&mut g, 9);
    let inner = g.add_node(identity_op(), &[c]).expect("identity");
    let outer = g
        .add_node(identity_op(), &[g.out(inner, 0)])
        .expect("identity");

    let rewrites: Vec<Rc<dyn NodeRewrite>> = vec![Rc::new(OpStrip::new(identity_op()))];
    let outer_out = g.out(outer, 0);
    let result = pre_greedy_local_rewrite(&mut g, &rewrites, outer_out).expect("prepass");

    assert_eq!(result, c, "the chain collapses to the constant");
    // The resident identity is not touched: it still wraps the input.
    assert!(g.is_resident_node(anchor));
    assert_eq!(g.node(anchor).inputs(), &[x]);
}
