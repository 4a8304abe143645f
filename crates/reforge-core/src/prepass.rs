// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Greedy rewriting of detached graph fragments.
//!
//! When a rewrite is about to install a large fresh fragment, running
//! local rewrites over the fragment *before* it joins the graph avoids a
//! burst of feature churn. This walks the producers of a detached value
//! in pre-order, applies a list of node rewrites greedily to each node,
//! and rewires inputs in place. Nodes already resident in the graph are
//! skipped; the caller must guarantee the detached nodes have no other
//! observers.
//!
//! This is not a fixed-point pass: a rewrite that feeds new work to the
//! producers of a node may require calling it again.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::RewriteError;
use crate::graph::Graph;
use crate::ident::ValueId;
use crate::rewrite::{NodeRewrite, Transform};

/// Applies `rewrites` greedily over the detached producers of `out`,
/// in place. Returns the value standing for `out` afterwards.
pub fn pre_greedy_local_rewrite(
    graph: &mut Graph,
    rewrites: &[Rc<dyn NodeRewrite>],
    out: ValueId,
) -> Result<ValueId, RewriteError> {
    let mut memo: FxHashMap<ValueId, ValueId> = FxHashMap::default();
    let results = rewrite_producers(graph, rewrites, out, &mut memo)?;
    let index = graph.owner(out).map_or(0, |(_, i)| i);
    Ok(results.get(index).copied().unwrap_or(out))
}

/// Rewrites the producer of `out` (recursively, inputs first) and
/// returns the replacement values for its outputs.
fn rewrite_producers(
    graph: &mut Graph,
    rewrites: &[Rc<dyn NodeRewrite>],
    out: ValueId,
    memo: &mut FxHashMap<ValueId, ValueId>,
) -> Result<Vec<ValueId>, RewriteError> {
    let Some((node, _)) = graph.owner(out) else {
        return Ok(vec![out]);
    };
    if graph.is_resident_node(node) {
        return Ok(graph.node(node).outputs().to_vec());
    }

    let inputs = graph.node(node).inputs().to_vec();
    for (index, &input) in inputs.iter().enumerate() {
        let new_input = if let Some(&mapped) = memo.get(&input) {
            mapped
        } else if let Some((producer, position)) = graph.owner(input) {
            let outs = rewrite_producers(graph, rewrites, input, memo)?;
            let originals = graph.node(producer).outputs().to_vec();
            for (&k, &v) in originals.iter().zip(&outs) {
                memo.insert(k, v);
            }
            outs.get(position).copied().unwrap_or(input)
        } else {
            memo.insert(input, input);
            input
        };
        if new_input != input {
            graph.rewire_detached_input(node, index, new_input)?;
        }
    }

    let mut current = node;
    let mut results = graph.node(node).outputs().to_vec();
    for rewrite in rewrites {
        match rewrite.transform(graph, current)? {
            Transform::Unchanged => {}
            Transform::Outputs(ret) => {
                let outputs = graph.node(current).outputs().to_vec();
                if ret.len() != outputs.len() {
                    return Err(RewriteError::MalformedTransform {
                        rewriter: rewrite.name().to_owned(),
                        node: current,
                        detail: format!(
                            "expected {} replacement values, got {}",
                            outputs.len(),
                            ret.len()
                        ),
                    });
                }
                for (&k, &v) in outputs.iter().zip(&ret) {
                    memo.insert(k, v);
                }
                results = ret;
                match graph.owner(results[0]) {
                    Some((next, _)) => current = next,
                    // The rewrite bottomed out on a producer-less value.
                    None => break,
                }
            }
            // Mapping-form outcomes target resident values; they have no
            // meaning on a detached fragment.
            Transform::Replace { .. } => {}
        }
    }
    Ok(results)
}
