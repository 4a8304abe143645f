// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Single-pass traversal drivers for node rewrites.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use tracing::warn;

use crate::config::OnFailure;
use crate::error::RewriteError;
use crate::feature::{NodeFinder, Updater};
use crate::graph::Graph;
use crate::ident::NodeId;
use crate::profile::{Profile, WalkProfile};
use crate::rewrite::{GraphRewrite, NodeRewrite, Transform};
use crate::tracker::RewriteGroup;

/// Traversal direction for [`TopoRewrite`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum WalkOrder {
    /// Toposort order: producers before consumers.
    #[default]
    InToOut,
    /// Reverse toposort order.
    OutToIn,
}

/// What a driver does with nodes created mid-pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum NewTreePolicy {
    /// Feed new nodes back into the worklist.
    #[default]
    Process,
    /// Never revisit new nodes.
    Ignore,
    /// Decide from the wrapped rewrite's [`NodeRewrite::reentrant`] flag.
    Auto,
}

impl NewTreePolicy {
    fn ignores(self, rewrite: &dyn NodeRewrite) -> bool {
        match self {
            Self::Process => false,
            Self::Ignore => true,
            Self::Auto => !rewrite.reentrant(),
        }
    }
}

/// Routes a recoverable failure through the policy.
///
/// Returns `Ok(false)` when the failure was absorbed. Fatal errors
/// (broken invariants) propagate regardless of policy.
pub(crate) fn absorb_failure(
    error: RewriteError,
    policy: OnFailure,
    rewriter: &str,
    node: NodeId,
) -> Result<bool, RewriteError> {
    if error.is_fatal() {
        return Err(error);
    }
    match policy {
        OnFailure::Raise => Err(error),
        OnFailure::Ignore => Ok(false),
        OnFailure::WarnInconsistency => {
            if !error.is_inconsistency() {
                warn!(rewriter, node = %node, error = %error, "rewrite failed");
            }
            Ok(false)
        }
        OnFailure::Warn => {
            warn!(rewriter, node = %node, error = %error, "rewrite failed");
            Ok(false)
        }
    }
}

/// Applies `rewrite` to `node` and installs the outcome.
///
/// The outcome is normalized into `(old, new)` pairs plus a removal
/// list; identity pairs are filtered, and the replacement goes through
/// [`Graph::replace_all_validate_remove`]. Validation rejections are
/// routed through the failure policy; a malformed outcome (wrong
/// replacement count) always propagates.
///
/// Returns whether the node's outputs were replaced.
pub(crate) fn process_node(
    graph: &mut Graph,
    node: NodeId,
    rewrite: &dyn NodeRewrite,
    policy: OnFailure,
) -> Result<bool, RewriteError> {
    let outcome = match rewrite.transform(graph, node) {
        Ok(outcome) => outcome,
        Err(e) => return absorb_failure(e, policy, rewrite.name(), node),
    };
    let (pairs, remove) = match outcome {
        Transform::Unchanged => return Ok(false),
        Transform::Outputs(new_values) => {
            let old = graph.node(node).outputs().to_vec();
            if new_values.len() != old.len() {
                return Err(RewriteError::MalformedTransform {
                    rewriter: rewrite.name().to_owned(),
                    node,
                    detail: format!(
                        "expected {} replacement values, got {}",
                        old.len(),
                        new_values.len()
                    ),
                });
            }
            (
                old.into_iter().zip(new_values).collect::<Vec<_>>(),
                Vec::new(),
            )
        }
        Transform::Replace { pairs, remove } => (pairs, remove),
    };
    let pairs: Vec<_> = pairs.into_iter().filter(|&(old, new)| old != new).collect();
    if pairs.is_empty() {
        return Ok(false);
    }
    match graph.replace_all_validate_remove(&pairs, &remove, rewrite.name()) {
        Ok(()) => Ok(true),
        Err(e) => absorb_failure(RewriteError::Graph(e), policy, rewrite.name(), node),
    }
}

/// Applies a node rewrite to each node in topological order (or
/// reverse), once, feeding nodes created mid-pass back into the
/// worklist per the new-tree policy.
pub struct TopoRewrite {
    rewrite: Rc<dyn NodeRewrite>,
    order: WalkOrder,
    new_trees: NewTreePolicy,
    policy: OnFailure,
    name: String,
}

impl TopoRewrite {
    /// Creates an in-to-out driver over `rewrite` with the warn policy.
    #[must_use]
    pub fn new(rewrite: Rc<dyn NodeRewrite>) -> Self {
        let name = format!("topo[{}]", rewrite.name());
        Self {
            rewrite,
            order: WalkOrder::InToOut,
            new_trees: NewTreePolicy::Process,
            policy: OnFailure::Warn,
            name,
        }
    }

    /// Sets the traversal direction.
    #[must_use]
    pub fn with_order(mut self, order: WalkOrder) -> Self {
        self.order = order;
        self
    }

    /// Sets the new-tree policy.
    #[must_use]
    pub fn with_new_trees(mut self, policy: NewTreePolicy) -> Self {
        self.new_trees = policy;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: OnFailure) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the derived name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl GraphRewrite for TopoRewrite {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, graph: &mut Graph) {
        self.rewrite.prepare(graph);
    }

    fn apply(&self, graph: &mut Graph) -> Result<Profile, RewriteError> {
        let callback_before = graph.stats().callback_time();
        let nodes_before = graph.apply_nodes().len();
        let t0 = Instant::now();
        let queue: Rc<RefCell<VecDeque<NodeId>>> =
            Rc::new(RefCell::new(graph.toposort().into()));
        let prep_time = t0.elapsed();

        let current = Rc::new(Cell::new(None::<NodeId>));
        let updater = if self.new_trees.ignores(&*self.rewrite) {
            None
        } else {
            let q = queue.clone();
            Some(graph.attach_feature(Updater::new(
                Some(Box::new(move |_g: &Graph, n: NodeId| {
                    q.borrow_mut().push_back(n);
                })),
                None,
                None,
                current.clone(),
            )))
        };

        let mut hits = 0u64;
        let mut fatal = None;
        let t_loop = Instant::now();
        loop {
            let next = {
                let mut q = queue.borrow_mut();
                match self.order {
                    WalkOrder::InToOut => q.pop_front(),
                    WalkOrder::OutToIn => q.pop_back(),
                }
            };
            let Some(node) = next else {
                break;
            };
            if !graph.is_resident_node(node) {
                continue;
            }
            current.set(Some(node));
            match process_node(graph, node, &*self.rewrite, self.policy) {
                Ok(true) => hits += 1,
                Ok(false) => {}
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }
        current.set(None);
        let loop_time = t_loop.elapsed();
        if let Some(id) = updater {
            graph.remove_feature(id);
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        Ok(Profile::Walk(WalkProfile {
            name: self.name.clone(),
            hits,
            nodes_before,
            nodes_after: graph.apply_nodes().len(),
            prep_time,
            loop_time,
            callback_time: graph.stats().callback_time() - callback_before,
        }))
    }
}

impl core::fmt::Debug for TopoRewrite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TopoRewrite")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Applies a node rewrite only to the nodes whose operator matches the
/// rewrite's [`NodeRewrite::op_key`], discovered through the
/// [`NodeFinder`] index rather than a full traversal.
pub struct OpKeyRewrite {
    rewrite: Rc<dyn NodeRewrite>,
    new_trees: NewTreePolicy,
    policy: OnFailure,
    name: String,
}

impl OpKeyRewrite {
    /// Creates a driver over `rewrite`, which must declare an op key.
    #[must_use]
    pub fn new(rewrite: Rc<dyn NodeRewrite>) -> Self {
        let name = format!("opkey[{}]", rewrite.name());
        Self {
            rewrite,
            new_trees: NewTreePolicy::Process,
            policy: OnFailure::Warn,
            name,
        }
    }

    /// Sets the new-tree policy.
    #[must_use]
    pub fn with_new_trees(mut self, policy: NewTreePolicy) -> Self {
        self.new_trees = policy;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: OnFailure) -> Self {
        self.policy = policy;
        self
    }
}

impl GraphRewrite for OpKeyRewrite {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, graph: &mut Graph) {
        if graph.find_feature::<NodeFinder>().is_none() {
            graph.attach_feature(NodeFinder::new());
        }
        self.rewrite.prepare(graph);
    }

    fn apply(&self, graph: &mut Graph) -> Result<Profile, RewriteError> {
        let keys = self.rewrite.op_key();
        if keys.is_empty() {
            return Err(RewriteError::Failed {
                rewriter: self.rewrite.name().to_owned(),
                message: "rewrite declares no op key".to_owned(),
            });
        }
        let callback_before = graph.stats().callback_time();
        let nodes_before = graph.apply_nodes().len();
        let t0 = Instant::now();
        let queue: Rc<RefCell<Vec<NodeId>>> = Rc::new(RefCell::new(
            keys.iter().flat_map(|op| graph.get_nodes(&**op)).collect(),
        ));
        let prep_time = t0.elapsed();

        let current = Rc::new(Cell::new(None::<NodeId>));
        let updater = if self.new_trees.ignores(&*self.rewrite) {
            None
        } else {
            let q = queue.clone();
            let keys = keys.clone();
            Some(graph.attach_feature(Updater::new(
                Some(Box::new(move |g: &Graph, n: NodeId| {
                    if keys.iter().any(|op| g.node_op(n).op_eq(&**op)) {
                        q.borrow_mut().push(n);
                    }
                })),
                None,
                None,
                current.clone(),
            )))
        };

        let mut hits = 0u64;
        let mut fatal = None;
        let t_loop = Instant::now();
        loop {
            let next = queue.borrow_mut().pop();
            let Some(node) = next else {
                break;
            };
            if !graph.is_resident_node(node) {
                continue;
            }
            current.set(Some(node));
            match process_node(graph, node, &*self.rewrite, self.policy) {
                Ok(true) => hits += 1,
                Ok(false) => {}
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }
        current.set(None);
        let loop_time = t_loop.elapsed();
        if let Some(id) = updater {
            graph.remove_feature(id);
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        Ok(Profile::Walk(WalkProfile {
            name: self.name.clone(),
            hits,
            nodes_before,
            nodes_after: graph.apply_nodes().len(),
            prep_time,
            loop_time,
            callback_time: graph.stats().callback_time() - callback_before,
        }))
    }
}

impl core::fmt::Debug for OpKeyRewrite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpKeyRewrite")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn topo_over(name: &str, order: WalkOrder, mut rewrites: Vec<Rc<dyn NodeRewrite>>) -> TopoRewrite {
    // Don't wrap a lone rewrite in a group for nothing.
    let rewrite: Rc<dyn NodeRewrite> = if rewrites.len() == 1 {
        match rewrites.pop() {
            Some(only) => only,
            None => Rc::new(RewriteGroup::new(name.to_owned(), rewrites)),
        }
    } else {
        Rc::new(RewriteGroup::new(name.to_owned(), rewrites))
    };
    TopoRewrite::new(rewrite)
        .with_order(order)
        .with_failure_policy(OnFailure::WarnInconsistency)
        .with_name(name.to_owned())
}

/// Producer-to-consumer single pass over `rewrites`, grouped when more
/// than one is given, with the inconsistency-tolerant failure policy.
#[must_use]
pub fn in2out(name: &str, rewrites: Vec<Rc<dyn NodeRewrite>>) -> TopoRewrite {
    topo_over(name, WalkOrder::InToOut, rewrites)
}

/// Consumer-to-producer single pass over `rewrites`, grouped when more
/// than one is given, with the inconsistency-tolerant failure policy.
#[must_use]
pub fn out2in(name: &str, rewrites: Vec<Rc<dyn NodeRewrite>>) -> TopoRewrite {
    topo_over(name, WalkOrder::OutToIn, rewrites)
}
