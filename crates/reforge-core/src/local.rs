// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Simple operator-local rewrites and producer-chain helpers.

use crate::error::RewriteError;
use crate::graph::Graph;
use crate::ident::{NodeId, ValueId};
use crate::op::OpHandle;
use crate::rewrite::{NodeRewrite, TrackTarget, Transform};

/// Replaces applications of one operator with applications of another
/// over the same inputs.
///
/// The two operators must accept the same input sequence and produce the
/// same number of outputs.
pub struct OpSwap {
    op1: OpHandle,
    op2: OpHandle,
    transfer_tags: bool,
    name: String,
}

impl OpSwap {
    /// Creates a swap of `op1` applications for `op2` applications.
    #[must_use]
    pub fn new(op1: OpHandle, op2: OpHandle) -> Self {
        let name = format!("{} -> {}", op1.name(), op2.name());
        Self {
            op1,
            op2,
            transfer_tags: true,
            name,
        }
    }

    /// Whether diagnostic tags are cloned onto the replacement node and
    /// its outputs (on by default).
    #[must_use]
    pub fn with_transfer_tags(mut self, transfer: bool) -> Self {
        self.transfer_tags = transfer;
        self
    }
}

impl NodeRewrite for OpSwap {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracks(&self) -> Option<Vec<TrackTarget>> {
        Some(vec![TrackTarget::Instance(self.op1.clone())])
    }

    fn op_key(&self) -> Vec<OpHandle> {
        vec![self.op1.clone()]
    }

    // The swap does not apply to the nodes it produces.
    fn reentrant(&self) -> bool {
        false
    }

    // All inputs of the original node survive into the replacement.
    fn retains_inputs(&self) -> bool {
        true
    }

    fn transform(&self, graph: &mut Graph, node: NodeId) -> Result<Transform, RewriteError> {
        if !graph.node_op(node).op_eq(&*self.op1) {
            return Ok(Transform::Unchanged);
        }
        let inputs = graph.node(node).inputs().to_vec();
        let repl = graph.add_node(self.op2.clone(), &inputs)?;
        if self.transfer_tags {
            let tag = graph.node(node).tag().map(str::to_owned);
            graph.set_node_tag(repl, tag);
            let old_outs = graph.node(node).outputs().to_vec();
            let new_outs = graph.node(repl).outputs().to_vec();
            for (&old, &new) in old_outs.iter().zip(&new_outs) {
                graph.set_value_name(new, graph.value_name(old));
                graph.set_eq_approx(new, graph.eq_approx(old));
            }
        }
        Ok(Transform::Outputs(graph.node(repl).outputs().to_vec()))
    }
}

impl core::fmt::Debug for OpSwap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpSwap").field("name", &self.name).finish()
    }
}

/// Removes applications of an operator by forwarding each output to the
/// same-positioned input.
///
/// Applicable only when the node has at most as many outputs as inputs
/// and the forwarded positions agree on type.
pub struct OpStrip {
    op: OpHandle,
    name: String,
}

impl OpStrip {
    /// Creates a strip rewrite for `op`.
    #[must_use]
    pub fn new(op: OpHandle) -> Self {
        let name = format!("{}(x) -> x", op.name());
        Self { op, name }
    }
}

impl NodeRewrite for OpStrip {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracks(&self) -> Option<Vec<TrackTarget>> {
        Some(vec![TrackTarget::Instance(self.op.clone())])
    }

    fn op_key(&self) -> Vec<OpHandle> {
        vec![self.op.clone()]
    }

    // No nodes are created at all.
    fn reentrant(&self) -> bool {
        false
    }

    fn transform(&self, graph: &mut Graph, node: NodeId) -> Result<Transform, RewriteError> {
        if !graph.node_op(node).op_eq(&*self.op) {
            return Ok(Transform::Unchanged);
        }
        let record = graph.node(node);
        let outputs = record.outputs();
        let inputs = record.inputs();
        if outputs.len() > inputs.len() {
            return Ok(Transform::Unchanged);
        }
        let forwarded: Vec<ValueId> = inputs[..outputs.len()].to_vec();
        let types_match = outputs
            .iter()
            .zip(&forwarded)
            .all(|(&out, &input)| graph.value_type(out).same_as(&**graph.value_type(input)));
        if !types_match {
            return Ok(Transform::Unchanged);
        }
        Ok(Transform::Outputs(forwarded))
    }
}

impl core::fmt::Debug for OpStrip {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpStrip").field("name", &self.name).finish()
    }
}

/// One step of a producer-chain shape for [`check_chain`].
#[derive(Clone)]
pub enum ChainLink {
    /// The value must have no producing node.
    Terminal,
    /// The producer must match the target (instance or class).
    Producer(TrackTarget),
}

/// Structural test walking a value's producer chain.
///
/// Each link is checked against the current value's producer, then the
/// walk descends into the producer's first input. Rewrite authors use
/// this to probe for shapes like `neg(add(…))` without spelling out the
/// traversal.
#[must_use]
pub fn check_chain(graph: &Graph, v: ValueId, chain: &[ChainLink]) -> bool {
    let mut current = v;
    for (i, link) in chain.iter().enumerate() {
        let owner = graph.owner(current);
        match link {
            ChainLink::Terminal => return owner.is_none() && i + 1 == chain.len(),
            ChainLink::Producer(target) => {
                let Some((node, _)) = owner else {
                    return false;
                };
                if !target.matches(graph.node_op(node)) {
                    return false;
                }
                let inputs = graph.node(node).inputs();
                if i + 1 < chain.len() {
                    let Some(&next) = inputs.first() else {
                        return false;
                    };
                    current = next;
                }
            }
        }
    }
    true
}
