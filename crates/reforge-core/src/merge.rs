// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Incremental common-subexpression merging.
//!
//! [`MergeIndex`] is a feature that watches the graph and maintains a
//! canonical representative per distinct constant and per distinct node,
//! scheduling candidate replacements as it observes imports and input
//! changes. [`MergeRewrite`] drains that schedule, re-checking each plan
//! against the current graph before applying it.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::error::{InconsistencyError, RewriteError};
use crate::feature::Feature;
use crate::graph::Graph;
use crate::ident::{Client, NodeId, ValueId};
use crate::profile::{MergeProfile, Profile};
use crate::rewrite::GraphRewrite;
use crate::value::Signature;

/// One replacement plan: `(old, new)` pairs covering every output of the
/// node being replaced.
pub type MergePlan = Vec<(ValueId, ValueId)>;

/// All candidate plans for one node; the driver applies the first plan
/// that survives re-validation.
pub type MergeGroup = Vec<MergePlan>;

#[derive(Default)]
struct MergeState {
    /// Constants already canonicalized (by identity).
    seen_constants: FxHashSet<ValueId>,
    /// Constant → signature, for cleanup on prune.
    const_sig: FxHashMap<ValueId, Signature>,
    /// Signature → canonical constant.
    sig_const: FxHashMap<Signature, ValueId>,
    /// Nodes believed mutually non-mergeable.
    nodes_seen: FxHashSet<NodeId>,
    /// Seen nodes without inputs, in id order so candidate enumeration
    /// is deterministic.
    noinput_nodes: BTreeSet<NodeId>,
    /// LIFO of candidate groups.
    scheduled: Vec<MergeGroup>,
    /// `(node, candidate)` pairs whose replacement was rejected; consulted
    /// to avoid retry loops, cleared at the end of each merge pass.
    blacklist: Vec<(NodeId, NodeId)>,
}

/// Feature indexing the graph for [`MergeRewrite`].
///
/// Keeping the index attached across passes makes merging incremental:
/// only nodes that were imported or rewired since the last pass are
/// reconsidered.
#[derive(Default)]
pub struct MergeIndex {
    state: RefCell<MergeState>,
}

impl MergeIndex {
    /// Creates an empty index; attaching it scans the graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops the most recently scheduled candidate group.
    #[must_use]
    pub fn pop_group(&self) -> Option<MergeGroup> {
        self.state.borrow_mut().scheduled.pop()
    }

    /// Number of scheduled candidate groups.
    #[must_use]
    pub fn scheduled_len(&self) -> usize {
        self.state.borrow().scheduled.len()
    }

    /// Current blacklist contents.
    #[must_use]
    pub fn blacklist(&self) -> Vec<(NodeId, NodeId)> {
        self.state.borrow().blacklist.clone()
    }

    /// Whether replacing `pair.0` by `pair.1` was already rejected this
    /// pass.
    #[must_use]
    pub fn is_blacklisted(&self, pair: (NodeId, NodeId)) -> bool {
        self.state.borrow().blacklist.contains(&pair)
    }

    pub(crate) fn blacklist_push(&self, pair: (NodeId, NodeId)) {
        self.state.borrow_mut().blacklist.push(pair);
    }

    pub(crate) fn clear_blacklist(&self) {
        self.state.borrow_mut().blacklist.clear();
    }

    /// Canonicalizes constant `c`: schedules a merge onto the incumbent
    /// with the same signature, or records `c` as the incumbent.
    fn process_constant(&self, graph: &Graph, c: ValueId) {
        let mut state = self.state.borrow_mut();
        if state.seen_constants.contains(&c) {
            return;
        }
        let Some(sig) = graph.constant_signature(c) else {
            return;
        };
        if let Some(&incumbent) = state.sig_const.get(&sig) {
            // Multiple names clobber each other; the newcomer's name wins.
            if let Some(name) = graph.value_name(c) {
                graph.set_value_name(incumbent, Some(name));
            }
            state.scheduled.push(vec![vec![(c, incumbent)]]);
        } else {
            state.const_sig.insert(c, sig);
            state.sig_const.insert(sig, c);
            state.seen_constants.insert(c);
        }
    }

    /// Looks for an already-seen node `node` could merge into and
    /// schedules the per-output replacement plans; otherwise records
    /// `node` as seen.
    fn process_node(&self, graph: &Graph, node: NodeId) {
        {
            let state = self.state.borrow();
            if state.nodes_seen.contains(&node) {
                return;
            }
        }
        let inputs = graph.node(node).inputs().to_vec();

        let candidates: Vec<NodeId> = {
            let state = self.state.borrow();
            if inputs.is_empty() {
                // Input-less applications of equal operators are not
                // necessarily folded; all other input-less seen nodes are
                // candidates.
                state.noinput_nodes.iter().copied().collect()
            } else {
                // Take the smaller clients list of the first vs. last
                // input; constants tend to fan out widely, and scanning
                // the narrow side visits fewer nodes.
                let first = graph.clients(inputs[0]);
                let last = graph.clients(inputs[inputs.len() - 1]);
                let smaller = if first.len() < last.len() { first } else { last };
                smaller
                    .iter()
                    .filter_map(|&(client, _)| match client {
                        Client::Node(n) if state.nodes_seen.contains(&n) => Some(n),
                        _ => None,
                    })
                    .collect()
            }
        };

        let mut plans: MergeGroup = Vec::new();
        {
            let state = self.state.borrow();
            for candidate in candidates {
                if candidate == node {
                    continue;
                }
                let cand_inputs = graph.node(candidate).inputs();
                if cand_inputs.len() != inputs.len() {
                    continue;
                }
                if !inputs.iter().zip(cand_inputs).all(|(a, b)| a == b) {
                    continue;
                }
                if !graph.node_op(node).op_eq(graph.node_op(candidate)) {
                    continue;
                }
                if state.blacklist.contains(&(node, candidate)) {
                    continue;
                }
                let pairs: MergePlan = graph
                    .node(node)
                    .outputs()
                    .iter()
                    .copied()
                    .zip(graph.node(candidate).outputs().iter().copied())
                    .collect();
                for &(old, new) in &pairs {
                    if let Some(name) = graph.value_name(old) {
                        graph.set_value_name(new, Some(name));
                    }
                }
                plans.push(pairs);
            }
        }

        let mut state = self.state.borrow_mut();
        if plans.is_empty() {
            state.nodes_seen.insert(node);
            if inputs.is_empty() {
                state.noinput_nodes.insert(node);
            }
        } else {
            state.scheduled.push(plans);
        }
    }
}

impl Feature for MergeIndex {
    fn on_attach(&self, graph: &Graph) {
        for node in graph.toposort() {
            self.on_import(graph, node, "on_attach");
        }
    }

    fn on_import(&self, graph: &Graph, node: NodeId, _reason: &str) {
        for &c in graph.node(node).inputs() {
            if graph.is_constant(c) {
                self.process_constant(graph, c);
            }
        }
        self.process_node(graph, node);
    }

    fn on_change_input(
        &self,
        graph: &Graph,
        client: Client,
        _index: usize,
        _old: ValueId,
        new: ValueId,
        _reason: &str,
    ) {
        if let Client::Node(node) = client {
            // The node's signature just changed; it may merge with a
            // different partner now.
            let was_seen = self.state.borrow_mut().nodes_seen.remove(&node);
            if was_seen {
                self.process_node(graph, node);
            }
        }
        if graph.is_constant(new) {
            self.process_constant(graph, new);
        }
    }

    fn on_prune(&self, graph: &Graph, node: NodeId, _reason: &str) {
        {
            let mut state = self.state.borrow_mut();
            state.nodes_seen.remove(&node);
            state.noinput_nodes.remove(&node);
        }
        for &c in graph.node(node).inputs() {
            // The pruned node's client entry is still present here, so a
            // single remaining client means this was the last user.
            if graph.is_constant(c) && graph.clients(c).len() <= 1 {
                let mut state = self.state.borrow_mut();
                if let Some(sig) = state.const_sig.remove(&c) {
                    state.sig_const.remove(&sig);
                }
                state.seen_constants.remove(&c);
            }
        }
    }
}

/// Structural CSE driver draining a [`MergeIndex`] schedule.
///
/// Two applications with equal operators and identical inputs do not both
/// need to be computed: the clients of one are transferred to the other
/// and the stranded node is pruned. Constants are canonicalized first by
/// content signature.
#[derive(Debug, Default)]
pub struct MergeRewrite;

impl MergeRewrite {
    /// Creates the driver.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn index_of(graph: &mut Graph) -> Rc<MergeIndex> {
        if let Some(index) = graph.find_feature::<MergeIndex>() {
            return index;
        }
        let index = Rc::new(MergeIndex::new());
        graph.attach_shared(index.clone());
        index
    }

    /// Whether a plan would give some value two destroyers.
    fn destroy_conflict(graph: &Graph, old: ValueId, new: ValueId) -> bool {
        let mut destroyers = 0usize;
        for &(client, index) in graph.clients(old).iter().chain(graph.clients(new)) {
            let Client::Node(c) = client else {
                continue;
            };
            let Some(dm) = graph.node_op(c).destroy_map() else {
                continue;
            };
            if dm.values().any(|inputs| inputs.contains(&index)) {
                destroyers += 1;
                if destroyers > 1 {
                    return true;
                }
            }
        }
        false
    }
}

impl GraphRewrite for MergeRewrite {
    fn name(&self) -> &str {
        "merge"
    }

    fn prepare(&self, graph: &mut Graph) {
        let _ = Self::index_of(graph);
    }

    fn apply(&self, graph: &mut Graph) -> Result<Profile, RewriteError> {
        let index = Self::index_of(graph);
        let t0 = Instant::now();
        let validate_before = graph.stats().validate_time();
        let callback_before = graph.stats().callback_time();
        let mut profile = MergeProfile::default();

        while let Some(group) = index.pop_group() {
            for plan in group {
                let Some(&(old0, new0)) = plan.first() else {
                    continue;
                };
                // The graph may have changed since scheduling; re-check
                // residency and the input equivalence before acting.
                if !graph.is_resident_value(old0) || !graph.is_resident_value(new0) {
                    continue;
                }
                let owners = (graph.owner(old0), graph.owner(new0));
                if let (Some((node, _)), Some((candidate, _))) = owners {
                    // A rejected pair can be re-scheduled by the rollback
                    // callbacks before the failure is recorded; the
                    // blacklist stops the retry here.
                    if index.is_blacklisted((node, candidate)) {
                        continue;
                    }
                    let node_inputs = graph.node(node).inputs();
                    let cand_inputs = graph.node(candidate).inputs();
                    if node_inputs.len() != cand_inputs.len()
                        || !node_inputs.iter().zip(cand_inputs).all(|(a, b)| a == b)
                    {
                        continue;
                    }
                    if graph.has_destroyers() && Self::destroy_conflict(graph, old0, new0) {
                        continue;
                    }
                }

                let mut pairs = plan.clone();
                if pairs.len() == 1 {
                    let (old, new) = pairs[0];
                    let t_old = graph.value_type(old).clone();
                    let t_new = graph.value_type(new);
                    // The replacement machinery only consults the
                    // old-side conversion; when that direction fails,
                    // swap so the reverse direction gets its chance.
                    if !t_old.same_as(&**t_new) && t_old.convert(graph, new).is_none() {
                        pairs = vec![(new, old)];
                    }
                }

                let all_constants = pairs.iter().all(|&(old, _)| graph.is_constant(old));
                let result = if all_constants {
                    // Constant-for-constant swaps cannot invalidate the
                    // graph; skip the validation round-trip.
                    graph.replace_all(&pairs, "merge")
                } else {
                    graph.replace_all_validate(&pairs, "merge")
                };
                match result {
                    Ok(()) => {
                        profile.nb_merged += u64::try_from(pairs.len()).unwrap_or(u64::MAX);
                        if graph.is_constant(pairs[0].0) {
                            profile.nb_constant += 1;
                        }
                        break;
                    }
                    Err(e) => {
                        profile.nb_fail += 1;
                        if let (Some((a, _)), Some((b, _))) =
                            (graph.owner(pairs[0].0), graph.owner(pairs[0].1))
                        {
                            index.blacklist_push((a, b));
                        }
                        debug!(error = %e, "merge plan rejected");
                    }
                }
            }
        }

        index.clear_blacklist();
        profile.replace_time = t0.elapsed();
        profile.validate_time = graph.stats().validate_time() - validate_before;
        profile.callback_time = graph.stats().callback_time() - callback_before;
        Ok(Profile::Merge(profile))
    }
}

/// Eagerly canonicalizes constants across the *detached* fragments
/// hanging off `roots`, rewiring inputs in place.
///
/// Nodes resident in the graph are left untouched so its features stay
/// consistent; the caller must guarantee the detached fragments have no
/// other observers. Returns the roots with constants substituted.
pub fn pre_constant_merge(
    graph: &mut Graph,
    roots: &[ValueId],
) -> Result<Vec<ValueId>, InconsistencyError> {
    let mut seen: FxHashSet<ValueId> = FxHashSet::default();
    let mut sig_const: FxHashMap<Signature, ValueId> = FxHashMap::default();
    let mut out = Vec::with_capacity(roots.len());
    for &root in roots {
        out.push(merge_detached(graph, root, &mut seen, &mut sig_const)?);
    }
    Ok(out)
}

fn merge_detached(
    graph: &mut Graph,
    v: ValueId,
    seen: &mut FxHashSet<ValueId>,
    sig_const: &mut FxHashMap<Signature, ValueId>,
) -> Result<ValueId, InconsistencyError> {
    if seen.contains(&v) {
        return Ok(v);
    }
    if let Some((node, _)) = graph.owner(v) {
        if graph.is_resident_node(node) {
            return Ok(v);
        }
        seen.insert(v);
        let inputs = graph.node(node).inputs().to_vec();
        for (index, input) in inputs.into_iter().enumerate() {
            let merged = merge_detached(graph, input, seen, sig_const)?;
            if merged != input {
                graph.rewire_detached_input(node, index, merged)?;
            }
        }
        return Ok(v);
    }
    seen.insert(v);
    if let Some(sig) = graph.constant_signature(v) {
        if let Some(&canonical) = sig_const.get(&sig) {
            return Ok(canonical);
        }
        sig_const.insert(sig, v);
    }
    Ok(v)
}
