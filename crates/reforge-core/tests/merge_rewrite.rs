// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Merge-rewrite scenarios: constant canonicalization, node CSE,
//! destroy-conflict blacklisting, idempotence.

#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;

use reforge_core::algebra::{add_op, const_i64, dup_op, inplace_inc_op, mul_op, scalar_i64};
use reforge_core::{
    Client, Feature, Graph, GraphRewrite, MergeIndex, MergeRewrite, NodeId, Profile, ValueId,
};

fn merge_profile(graph: &mut Graph) -> reforge_core::MergeProfile {
    let rewrite = MergeRewrite::new();
    match rewrite.rewrite(graph).expect("merge cannot fail") {
        Profile::Merge(p) => p,
        other => panic!("unexpected profile shape: {other}"),
    }
}

#[test]
fn equal_constants_collapse_to_one() {
    let mut g = Graph::new();
    let x = g.add_input(scalar_i64());
    let y = g.add_input(scalar_i64());
    let c1 = const_i64(&mut g, 1);
    let c2 = const_i64(&mut g, 1);
    let n1 = g.add_node(add_op(), &[x, c1]).expect("add");
    let n2 = g.add_node(add_op(), &[y, c2]).expect("add");
    g.set_outputs(&[g.out(n1, 0), g.out(n2, 0)]).expect("live");

    let prof = merge_profile(&mut g);

    assert_eq!(prof.nb_constant, 1);
    assert_eq!(prof.nb_merged, 1);
    assert_eq!(prof.nb_fail, 0);
    // Both nodes now share the surviving constant.
    assert_eq!(g.node(n1).inputs()[1], g.node(n2).inputs()[1]);
    let survivors = [c1, c2]
        .iter()
        .filter(|&&c| g.is_resident_value(c))
        .count();
    assert_eq!(survivors, 1);
}

#[test]
fn identical_applications_merge_and_redirect_clients() {
    let mut g = Graph::new();
    let x = g.add_input(scalar_i64());
    let y = g.add_input(scalar_i64());
    let n1 = g.add_node(add_op(), &[x, y]).expect("add");
    let n2 = g.add_node(add_op(), &[x, y]).expect("add");
    let f = g
        .add_node(mul_op(), &[g.out(n1, 0), g.out(n2, 0)])
        .expect("mul");
    g.set_outputs(&[g.out(f, 0)]).expect("live");

    let prof = merge_profile(&mut g);

    assert_eq!(prof.nb_merged, 1);
    assert_eq!(prof.nb_fail, 0);
    // One add remains and feeds both multiplier slots.
    let adds = [n1, n2].iter().filter(|&&n| g.is_resident_node(n)).count();
    assert_eq!(adds, 1);
    assert_eq!(g.node(f).inputs()[0], g.node(f).inputs()[1]);
}

/// Snapshots the merge blacklist from inside the pass: every rebinding
/// callback that sees a non-empty blacklist records its contents.
struct BlacklistProbe {
    index: Rc<MergeIndex>,
    observed: RefCell<Vec<(NodeId, NodeId)>>,
}

impl Feature for BlacklistProbe {
    fn on_change_input(
        &self,
        _graph: &Graph,
        _client: Client,
        _index: usize,
        _old: ValueId,
        _new: ValueId,
        _reason: &str,
    ) {
        let blacklist = self.index.blacklist();
        if !blacklist.is_empty() {
            *self.observed.borrow_mut() = blacklist;
        }
    }
}

#[test]
fn destroy_conflict_is_rejected_and_blacklisted() {
    let mut g = Graph::new();
    let index = Rc::new(MergeIndex::new());
    g.attach_shared(index.clone());
    let probe = Rc::new(BlacklistProbe {
        index: index.clone(),
        observed: RefCell::new(Vec::new()),
    });
    g.attach_shared(probe.clone());

    let x = g.add_input(scalar_i64());
    let y = g.add_input(scalar_i64());
    // A mergeable pair, scheduled below the conflicting one, whose
    // replacement fires callbacks after the rejection is recorded.
    let a1 = g.add_node(add_op(), &[x, y]).expect("add");
    let a2 = g.add_node(add_op(), &[x, y]).expect("add");
    let m1 = g.add_node(dup_op(), &[x]).expect("dup");
    let m2 = g.add_node(dup_op(), &[x]).expect("dup");
    // Each copy's second output is destroyed by a different consumer, so
    // merging the two copies would give that value two destroyers.
    let d1 = g.add_node(inplace_inc_op(), &[g.out(m1, 1)]).expect("inc");
    let d2 = g.add_node(inplace_inc_op(), &[g.out(m2, 1)]).expect("inc");
    g.set_outputs(&[g.out(a1, 0), g.out(a2, 0), g.out(d1, 0), g.out(d2, 0)])
        .expect("live");

    let prof = merge_profile(&mut g);

    assert_eq!(prof.nb_fail, 1);
    assert_eq!(prof.nb_merged, 1, "only the add pair merges");
    assert!(g.is_resident_node(m1));
    assert!(g.is_resident_node(m2));
    // The rejected pair was present in the blacklist while the pass was
    // still draining...
    assert_eq!(&*probe.observed.borrow(), &[(m2, m1)]);
    // ...and the blacklist only lives for the duration of the pass.
    assert!(index.blacklist().is_empty());
}

#[test]
fn merging_twice_changes_nothing_more() {
    let mut g = Graph::new();
    let x = g.add_input(scalar_i64());
    let y = g.add_input(scalar_i64());
    let c1 = const_i64(&mut g, 7);
    let c2 = const_i64(&mut g, 7);
    let n1 = g.add_node(add_op(), &[x, c1]).expect("add");
    let n2 = g.add_node(add_op(), &[x, c2]).expect("add");
    let n3 = g.add_node(add_op(), &[y, c1]).expect("add");
    let top = g
        .add_node(mul_op(), &[g.out(n1, 0), g.out(n2, 0)])
        .expect("mul");
    g.set_outputs(&[g.out(top, 0), g.out(n3, 0)]).expect("live");

    let first = merge_profile(&mut g);
    assert!(first.nb_merged > 0);
    let nodes_after_first = g.apply_nodes().len();
    let order_after_first = g.toposort();

    let second = merge_profile(&mut g);
    assert_eq!(second.nb_merged, 0);
    assert_eq!(second.nb_fail, 0);
    assert_eq!(g.apply_nodes().len(), nodes_after_first);
    assert_eq!(g.toposort(), order_after_first);
}

#[test]
fn newcomer_name_wins_on_constant_merge() {
    let mut g = Graph::new();
    let x = g.add_input(scalar_i64());
    let c1 = const_i64(&mut g, 3);
    let c2 = const_i64(&mut g, 3);
    g.set_value_name(c2, Some("three".to_owned()));
    let n1 = g.add_node(add_op(), &[x, c1]).expect("add");
    let n2 = g.add_node(add_op(), &[x, c2]).expect("add");
    g.set_outputs(&[g.out(n1, 0), g.out(n2, 0)]).expect("live");

    let _ = merge_profile(&mut g);

    assert_eq!(g.value_name(c1).as_deref(), Some("three"));
}
