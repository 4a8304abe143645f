// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Traversal-driver scenarios: identity stripping, visit completeness,
//! operator-keyed worklists.

#![allow(missing_docs)]

use std::cell::Cell;
use std::rc::Rc;

use reforge_core::algebra::{add_op, identity_op, scalar_i64};
use reforge_core::{
    FnNodeRewrite, Graph, GraphRewrite, OpKeyRewrite, OpStrip, Profile, RewriteError, TopoRewrite,
    Transform, WalkOrder,
};

fn walk_profile(profile: Profile) -> reforge_core::WalkProfile {
    match profile {
        Profile::Walk(p) => p,
        other => panic!("unexpected profile shape: {other}"),
    }
}

#[test]
fn identity_applications_are_stripped() {
    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let b = g.add_input(scalar_i64());
    let ia = g.add_node(identity_op(), &[a]).expect("identity");
    let ib = g.add_node(identity_op(), &[b]).expect("identity");
    let f = g
        .add_node(add_op(), &[g.out(ia, 0), g.out(ib, 0)])
        .expect("add");
    g.set_outputs(&[g.out(f, 0)]).expect("live");

    let driver = TopoRewrite::new(Rc::new(OpStrip::new(identity_op())));
    let prof = walk_profile(driver.rewrite(&mut g).expect("pass"));

    assert_eq!(prof.hits, 2);
    assert_eq!(g.node(f).inputs(), &[a, b]);
    assert_eq!(g.apply_nodes().len(), 1);
}

#[test]
fn every_initial_node_is_visited_exactly_once() {
    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let n1 = g.add_node(add_op(), &[a, a]).expect("add");
    let n2 = g.add_node(add_op(), &[g.out(n1, 0), a]).expect("add");
    let n3 = g.add_node(add_op(), &[g.out(n2, 0), g.out(n1, 0)]).expect("add");
    g.set_outputs(&[g.out(n3, 0)]).expect("live");

    let visits = Rc::new(Cell::new(0usize));
    let counter = {
        let visits = visits.clone();
        FnNodeRewrite::new("count", move |_g, _node| {
            visits.set(visits.get() + 1);
            Ok(Transform::Unchanged)
        })
    };

    TopoRewrite::new(Rc::new(counter))
        .rewrite(&mut g)
        .expect("pass");
    assert_eq!(visits.get(), 3);
}

#[test]
fn reverse_order_visits_consumers_first() {
    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let n1 = g.add_node(add_op(), &[a, a]).expect("add");
    let n2 = g.add_node(add_op(), &[g.out(n1, 0), a]).expect("add");
    g.set_outputs(&[g.out(n2, 0)]).expect("live");

    let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
    let recorder = {
        let seen = seen.clone();
        FnNodeRewrite::new("record", move |_g, node| {
            seen.borrow_mut().push(node);
            Ok(Transform::Unchanged)
        })
    };

    TopoRewrite::new(Rc::new(recorder))
        .with_order(WalkOrder::OutToIn)
        .rewrite(&mut g)
        .expect("pass");
    assert_eq!(&*seen.borrow(), &[n2, n1]);
}

#[test]
fn op_keyed_driver_only_visits_matching_nodes() {
    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let id = g.add_node(identity_op(), &[a]).expect("identity");
    let f = g.add_node(add_op(), &[g.out(id, 0), a]).expect("add");
    g.set_outputs(&[g.out(f, 0)]).expect("live");

    let driver = OpKeyRewrite::new(Rc::new(OpStrip::new(identity_op())));
    let prof = match driver.rewrite(&mut g).expect("pass") {
        Profile::Walk(p) => p,
        other => panic!("unexpected profile shape: {other}"),
    };

    assert_eq!(prof.hits, 1);
    assert_eq!(g.node(f).inputs(), &[a, a]);
}

#[test]
fn op_keyed_driver_requires_an_op_key() {
    let mut g = Graph::new();
    let a = g.add_input(scalar_i64());
    let n = g.add_node(add_op(), &[a, a]).expect("add");
    g.set_outputs(&[g.out(n, 0)]).expect("live");

    let keyless = FnNodeRewrite::new("keyless", |_g, _n| Ok(Transform::Unchanged));
    let err = OpKeyRewrite::new(Rc::new(keyless))
        .rewrite(&mut g)
        .expect_err("must refuse");
    assert!(matches!(err, RewriteError::Failed { .. }));
}
