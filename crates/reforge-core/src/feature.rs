// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Graph observer features.
//!
//! A feature is attached to a graph and receives a callback for every
//! mutation, synchronously, before the triggering operation returns.
//! Callbacks take `&self`: features keep their state behind interior
//! mutability so the graph can stay shared-borrowed while notifying them.
//! Callbacks must not mutate the graph.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::graph::Graph;
use crate::ident::{Client, NodeId, ValueId};
use crate::op::Op;

/// Observer hooks for graph mutations.
///
/// All hooks default to no-ops so features implement only what they track.
pub trait Feature {
    /// Called once when the feature is attached.
    fn on_attach(&self, graph: &Graph) {
        let _ = graph;
    }

    /// Called once when the feature is detached.
    fn on_detach(&self, graph: &Graph) {
        let _ = graph;
    }

    /// A node became resident (reachable from an output).
    fn on_import(&self, graph: &Graph, node: NodeId, reason: &str) {
        let _ = (graph, node, reason);
    }

    /// A node lost its last client and left the graph.
    fn on_prune(&self, graph: &Graph, node: NodeId, reason: &str) {
        let _ = (graph, node, reason);
    }

    /// A client's input slot was rebound from `old` to `new`.
    fn on_change_input(
        &self,
        graph: &Graph,
        client: Client,
        index: usize,
        old: ValueId,
        new: ValueId,
        reason: &str,
    ) {
        let _ = (graph, client, index, old, new, reason);
    }
}

/// Operator-keyed index of resident nodes, backing
/// [`Graph::get_nodes`].
///
/// Buckets are keyed by operator name and filtered by operator equality on
/// lookup, so same-named operators with different parameters coexist.
#[derive(Default)]
pub struct NodeFinder {
    buckets: RefCell<FxHashMap<String, Vec<NodeId>>>,
}

impl NodeFinder {
    /// Creates an empty index; [`Feature::on_attach`] fills it.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resident nodes whose operator equals `op`, in import order.
    #[must_use]
    pub fn nodes(&self, graph: &Graph, op: &dyn Op) -> Vec<NodeId> {
        self.buckets
            .borrow()
            .get(op.name())
            .map(|bucket| {
                bucket
                    .iter()
                    .copied()
                    .filter(|&n| graph.node_op(n).op_eq(op))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Feature for NodeFinder {
    fn on_attach(&self, graph: &Graph) {
        for node in graph.toposort() {
            self.on_import(graph, node, "on_attach");
        }
    }

    fn on_import(&self, graph: &Graph, node: NodeId, _reason: &str) {
        self.buckets
            .borrow_mut()
            .entry(graph.node_op(node).name().to_owned())
            .or_default()
            .push(node);
    }

    fn on_prune(&self, graph: &Graph, node: NodeId, _reason: &str) {
        let mut buckets = self.buckets.borrow_mut();
        if let Some(bucket) = buckets.get_mut(graph.node_op(node).name()) {
            bucket.retain(|&n| n != node);
        }
    }
}

/// Records whether the graph changed and how many nodes were imported.
///
/// Drivers attach one around a pass, [`ChangeTracker::reset`] between
/// steps, and read the flags afterwards.
#[derive(Default)]
pub struct ChangeTracker {
    changed: Cell<bool>,
    nb_imported: Cell<u64>,
}

impl ChangeTracker {
    /// Creates a tracker with clear flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any import or input change fired since the last reset.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.changed.get()
    }

    /// Cumulative count of imported nodes (not reset by [`Self::reset`]).
    #[must_use]
    pub fn nb_imported(&self) -> u64 {
        self.nb_imported.get()
    }

    /// Clears the changed flag.
    pub fn reset(&self) {
        self.changed.set(false);
    }
}

impl Feature for ChangeTracker {
    fn on_import(&self, _graph: &Graph, _node: NodeId, _reason: &str) {
        self.nb_imported.set(self.nb_imported.get() + 1);
        self.changed.set(true);
    }

    fn on_change_input(
        &self,
        _graph: &Graph,
        _client: Client,
        _index: usize,
        _old: ValueId,
        _new: ValueId,
        _reason: &str,
    ) {
        self.changed.set(true);
    }
}

/// Closure hook fired for each imported or pruned node.
pub type NodeHook = Box<dyn Fn(&Graph, NodeId)>;
/// Closure hook fired for each input rebinding on a node client.
pub type ChangeHook = Box<dyn Fn(&Graph, NodeId, usize, ValueId, ValueId)>;

/// Bridges mutation callbacks into a driver's worklist closures.
///
/// Traversal drivers attach one for the duration of a pass so nodes
/// created (or changed) mid-pass flow back into the worklist. The node a
/// driver is currently processing is excluded via the shared
/// `current` cell.
pub struct Updater {
    importer: Option<NodeHook>,
    pruner: Option<NodeHook>,
    chin: Option<ChangeHook>,
    current: Rc<Cell<Option<NodeId>>>,
}

impl Updater {
    /// Creates an updater over the given hooks. `current` is shared with
    /// the driver, which keeps it pointing at the node in flight.
    #[must_use]
    pub fn new(
        importer: Option<NodeHook>,
        pruner: Option<NodeHook>,
        chin: Option<ChangeHook>,
        current: Rc<Cell<Option<NodeId>>>,
    ) -> Self {
        Self {
            importer,
            pruner,
            chin,
            current,
        }
    }
}

impl Feature for Updater {
    fn on_import(&self, graph: &Graph, node: NodeId, _reason: &str) {
        if self.current.get() == Some(node) {
            return;
        }
        if let Some(importer) = &self.importer {
            importer(graph, node);
        }
    }

    fn on_prune(&self, graph: &Graph, node: NodeId, _reason: &str) {
        if let Some(pruner) = &self.pruner {
            pruner(graph, node);
        }
    }

    fn on_change_input(
        &self,
        graph: &Graph,
        client: Client,
        index: usize,
        old: ValueId,
        new: ValueId,
        _reason: &str,
    ) {
        let Client::Node(node) = client else {
            return;
        };
        if self.current.get() == Some(node) {
            return;
        }
        if let Some(chin) = &self.chin {
            chin(graph, node, index, old, new);
        }
    }
}
