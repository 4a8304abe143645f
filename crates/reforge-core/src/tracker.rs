// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Operator-indexed dispatch of node rewrites.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::RewriteError;
use crate::graph::Graph;
use crate::ident::NodeId;
use crate::op::{Op, OpHandle};
use crate::rewrite::{NodeRewrite, TrackTarget, Transform};

/// Maps operator instances and operator classes to the node rewrites
/// that claim them.
///
/// Rewrites without a `tracks` declaration are *untracked* and apply to
/// every node. [`RewriteTracker::get_trackers`] returns, in order: class
/// matches following the operator's lineage, then instance matches, then
/// untracked rewrites.
#[derive(Default)]
pub struct RewriteTracker {
    rewriters: Vec<Rc<dyn NodeRewrite>>,
    by_class: FxHashMap<&'static str, Vec<usize>>,
    by_instance: Vec<(OpHandle, Vec<usize>)>,
    untracked: Vec<usize>,
}

impl RewriteTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rewrite and returns its slot index, the key drivers
    /// use for per-rewriter accounting.
    pub fn add(&mut self, rewrite: Rc<dyn NodeRewrite>) -> usize {
        let slot = self.rewriters.len();
        match rewrite.tracks() {
            None => self.untracked.push(slot),
            Some(targets) => {
                for target in targets {
                    match target {
                        TrackTarget::Class(class) => {
                            self.by_class.entry(class).or_default().push(slot);
                        }
                        TrackTarget::Instance(op) => {
                            let existing = self
                                .by_instance
                                .iter_mut()
                                .find(|(handle, _)| handle.op_eq(&*op));
                            match existing {
                                Some((_, slots)) => slots.push(slot),
                                None => self.by_instance.push((op, vec![slot])),
                            }
                        }
                    }
                }
            }
        }
        self.rewriters.push(rewrite);
        slot
    }

    /// Number of registered rewrites.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rewriters.len()
    }

    /// Whether no rewrites are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rewriters.is_empty()
    }

    /// The rewrite registered at `slot`.
    #[must_use]
    pub fn get(&self, slot: usize) -> &Rc<dyn NodeRewrite> {
        &self.rewriters[slot]
    }

    /// All registered rewrites, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<dyn NodeRewrite>> {
        self.rewriters.iter()
    }

    /// Slots of the rewrites applicable to `op`, in dispatch order.
    #[must_use]
    pub fn get_trackers(&self, op: &dyn Op) -> Vec<usize> {
        let mut slots = Vec::new();
        for class in op.lineage() {
            if let Some(matches) = self.by_class.get(class) {
                slots.extend_from_slice(matches);
            }
        }
        for (handle, matches) in &self.by_instance {
            if handle.op_eq(op) {
                slots.extend_from_slice(matches);
            }
        }
        slots.extend_from_slice(&self.untracked);
        slots
    }
}

impl core::fmt::Debug for RewriteTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RewriteTracker")
            .field(
                "rewriters",
                &self.rewriters.iter().map(|r| r.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// Bundles several node rewrites behind a single [`NodeRewrite`] face.
///
/// Per node, candidates come from an internal tracker and are tried in
/// registration order. In *first-win* mode (the default) the first
/// success is returned. In *apply-all* mode each success re-resolves the
/// new defining node and retries until no rewrite fires or the chain
/// reaches a value with no producer. Apply-all requires a rewrite set
/// where every success shrinks the expression or changes its operator;
/// members that undo each other will chain forever.
pub struct RewriteGroup {
    name: String,
    tracker: RewriteTracker,
    apply_all: bool,
}

impl RewriteGroup {
    /// Creates a first-win group over `rewrites`.
    #[must_use]
    pub fn new(name: impl Into<String>, rewrites: Vec<Rc<dyn NodeRewrite>>) -> Self {
        let mut tracker = RewriteTracker::new();
        for rewrite in rewrites {
            tracker.add(rewrite);
        }
        Self {
            name: name.into(),
            tracker,
            apply_all: false,
        }
    }

    /// Switches the group to apply-all mode.
    #[must_use]
    pub fn apply_all(mut self, apply_all: bool) -> Self {
        self.apply_all = apply_all;
        self
    }
}

impl NodeRewrite for RewriteGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracks(&self) -> Option<Vec<TrackTarget>> {
        // A single untracked member makes the whole group untracked.
        let mut targets = Vec::new();
        for rewrite in self.tracker.iter() {
            match rewrite.tracks() {
                None => return None,
                Some(ts) => targets.extend(ts),
            }
        }
        Some(targets)
    }

    fn op_key(&self) -> Vec<OpHandle> {
        self.tracker
            .iter()
            .flat_map(|rewrite| rewrite.op_key())
            .collect()
    }

    fn reentrant(&self) -> bool {
        self.tracker.iter().any(|rewrite| rewrite.reentrant())
    }

    fn retains_inputs(&self) -> bool {
        self.tracker.iter().all(|rewrite| rewrite.retains_inputs())
    }

    fn prepare(&self, graph: &mut Graph) {
        for rewrite in self.tracker.iter() {
            rewrite.prepare(graph);
        }
    }

    fn transform(&self, graph: &mut Graph, node: NodeId) -> Result<Transform, RewriteError> {
        if self.tracker.is_empty() {
            return Ok(Transform::Unchanged);
        }
        let mut current = node;
        let mut last_applied = Transform::Unchanged;
        loop {
            let slots = self.tracker.get_trackers(graph.node_op(current));
            let mut round: Option<Transform> = None;
            for slot in slots {
                let outcome = self.tracker.get(slot).transform(graph, current)?;
                if outcome.is_applied() {
                    round = Some(outcome);
                    break;
                }
            }
            let Some(outcome) = round else {
                return Ok(last_applied);
            };
            if !self.apply_all {
                return Ok(outcome);
            }
            let new_values = outcome.new_values();
            last_applied = outcome;
            let Some(&first) = new_values.first() else {
                return Ok(last_applied);
            };
            // The chain ends when a rewrite lands on a producer-less
            // value (a graph input or constant).
            let Some((next, _)) = graph.owner(first) else {
                return Ok(last_applied);
            };
            current = next;
        }
    }
}

impl core::fmt::Debug for RewriteGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RewriteGroup")
            .field("name", &self.name)
            .field("apply_all", &self.apply_all)
            .finish_non_exhaustive()
    }
}
