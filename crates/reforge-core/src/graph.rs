// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Arena-backed computation graph with client tracking, observer features,
//! and validated replacement primitives.
//!
//! The graph owns two arenas (values and nodes). Entities are allocated
//! detached; they become *resident* when they are reachable from a graph
//! output, at which point client tracking and feature callbacks apply to
//! them. Rewrites build detached fragments with [`Graph::add_node`] and
//! splice them in through the `replace*` primitives, which import the new
//! subtree, rebind clients, and prune whatever became unreachable.
//!
//! Validated replacement is transactional: the graph records a mutation
//! journal, applies the batch, re-validates (acyclicity, single-destroyer),
//! and rolls the journal back (firing the mirror callbacks) when
//! validation rejects the batch.

use std::any::Any;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{InconsistencyError, OpError};
use crate::feature::{Feature, NodeFinder};
use crate::ident::{Client, FeatureId, NodeId, ValueId};
use crate::op::{Op, OpHandle};
use crate::ty::TypeHandle;
use crate::value::{Signature, ValueKind, ValueRecord};

/// Coarse classification of a value slot, used internally to act on a
/// value without holding a borrow into the arena.
#[derive(Clone, Copy)]
enum ValueClass {
    Owned(NodeId),
    Constant,
    Input,
}

/// One operation application in the arena.
#[derive(Debug)]
pub struct NodeRecord {
    /// The applied operator.
    pub op: OpHandle,
    /// Ordered input values.
    pub(crate) inputs: Vec<ValueId>,
    /// Ordered output values, back-referencing this node.
    pub(crate) outputs: Vec<ValueId>,
    /// Opaque diagnostic tag.
    pub(crate) tag: Option<String>,
}

impl NodeRecord {
    /// Ordered input values.
    #[must_use]
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Ordered output values.
    #[must_use]
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Diagnostic tag, when set.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

/// Cumulative timing sink for profile reports.
///
/// Interior-mutable so shared-borrow paths (feature dispatch) can account
/// their cost.
#[derive(Debug, Default)]
pub struct GraphStats {
    validate_time: Cell<Duration>,
    callback_time: Cell<Duration>,
}

impl GraphStats {
    /// Total wall-clock time spent in [`Graph::validate`].
    #[must_use]
    pub fn validate_time(&self) -> Duration {
        self.validate_time.get()
    }

    /// Total wall-clock time spent in feature callbacks.
    #[must_use]
    pub fn callback_time(&self) -> Duration {
        self.callback_time.get()
    }

    fn add_validate(&self, d: Duration) {
        self.validate_time.set(self.validate_time.get() + d);
    }

    fn add_callback(&self, d: Duration) {
        self.callback_time.set(self.callback_time.get() + d);
    }
}

struct FeatureEntry {
    id: FeatureId,
    feature: Rc<dyn Feature>,
    any: Rc<dyn Any>,
}

/// Journaled low-level mutation, inverted on rollback.
enum JournalOp {
    ChangeInput {
        client: Client,
        index: usize,
        old: ValueId,
    },
    Import(NodeId),
    Prune(NodeId),
    ConstImport(ValueId),
    ConstPrune(ValueId),
}

/// Arena-backed DAG of typed values produced by operator applications.
pub struct Graph {
    values: Vec<ValueRecord>,
    nodes: Vec<NodeRecord>,
    inputs: Vec<ValueId>,
    input_set: FxHashSet<ValueId>,
    outputs: Vec<ValueId>,
    /// Resident nodes, ordered by id for deterministic iteration.
    apply_nodes: BTreeSet<NodeId>,
    /// Resident values, ordered by id for deterministic iteration.
    variables: BTreeSet<ValueId>,
    clients: FxHashMap<ValueId, Vec<(Client, usize)>>,
    features: Vec<FeatureEntry>,
    next_feature: u64,
    journal: Vec<JournalOp>,
    recording: bool,
    live: bool,
    /// Count of resident nodes whose operator declares a destroy map.
    destroyer_nodes: usize,
    stats: GraphStats,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Graph {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Graph")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("apply_nodes", &self.apply_nodes)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

impl Graph {
    /// Creates an empty, not-yet-live graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            input_set: FxHashSet::default(),
            outputs: Vec::new(),
            apply_nodes: BTreeSet::new(),
            variables: BTreeSet::new(),
            clients: FxHashMap::default(),
            features: Vec::new(),
            next_feature: 0,
            journal: Vec::new(),
            recording: false,
            live: false,
            destroyer_nodes: 0,
            stats: GraphStats::default(),
        }
    }

    // ── Construction ────────────────────────────────────────────────

    /// Allocates a free input value of type `ty` and registers it on the
    /// graph boundary.
    pub fn add_input(&mut self, ty: TypeHandle) -> ValueId {
        let v = self.alloc_value(ValueRecord::new(ty, ValueKind::Input));
        self.inputs.push(v);
        self.input_set.insert(v);
        if self.live {
            self.variables.insert(v);
        }
        v
    }

    /// Allocates a constant value. The constant stays detached until some
    /// resident node (or the output boundary) uses it.
    pub fn add_constant(&mut self, ty: TypeHandle, data: impl Into<Bytes>) -> ValueId {
        self.alloc_value(ValueRecord::new(
            ty,
            ValueKind::Constant { data: data.into() },
        ))
    }

    /// Builds a detached application of `op` over `inputs`.
    ///
    /// The operator decides output count and types via
    /// [`crate::Op::output_types`]. The node joins the graph when one of
    /// its outputs becomes reachable from the output boundary.
    pub fn add_node(&mut self, op: OpHandle, inputs: &[ValueId]) -> Result<NodeId, OpError> {
        let out_types = op.output_types(self, inputs)?;
        let node = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        let mut outputs = Vec::with_capacity(out_types.len());
        for (index, ty) in out_types.into_iter().enumerate() {
            outputs.push(self.alloc_value(ValueRecord::new(
                ty,
                ValueKind::Computed { node, index },
            )));
        }
        self.nodes.push(NodeRecord {
            op,
            inputs: inputs.to_vec(),
            outputs,
            tag: None,
        });
        Ok(node)
    }

    /// Declares the graph outputs and imports everything reachable from
    /// them. May be called once.
    pub fn set_outputs(&mut self, outputs: &[ValueId]) -> Result<(), InconsistencyError> {
        if self.live {
            return Err(InconsistencyError::AlreadyLive);
        }
        self.live = true;
        let boundary: Vec<ValueId> = self.inputs.clone();
        self.variables.extend(boundary);
        self.outputs = outputs.to_vec();
        for (index, &v) in outputs.iter().enumerate() {
            self.import_value(v, "init")?;
            self.clients.entry(v).or_default().push((Client::Output, index));
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Ordered boundary inputs.
    #[must_use]
    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    /// Ordered boundary outputs.
    #[must_use]
    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    /// Resident values, in id order.
    #[must_use]
    pub fn variables(&self) -> &BTreeSet<ValueId> {
        &self.variables
    }

    /// Resident nodes, in id order.
    #[must_use]
    pub fn apply_nodes(&self) -> &BTreeSet<NodeId> {
        &self.apply_nodes
    }

    /// Consumers of `v` as `(client, input index)` pairs.
    #[must_use]
    pub fn clients(&self, v: ValueId) -> &[(Client, usize)] {
        self.clients.get(&v).map_or(&[], Vec::as_slice)
    }

    /// The record backing `v`.
    #[must_use]
    pub fn value(&self, v: ValueId) -> &ValueRecord {
        &self.values[v.index()]
    }

    /// The record backing `n`.
    #[must_use]
    pub fn node(&self, n: NodeId) -> &NodeRecord {
        &self.nodes[n.index()]
    }

    /// The operator applied by `n`.
    #[must_use]
    pub fn node_op(&self, n: NodeId) -> &dyn Op {
        &*self.nodes[n.index()].op
    }

    /// Shared handle to the operator applied by `n`.
    #[must_use]
    pub fn node_op_handle(&self, n: NodeId) -> OpHandle {
        self.nodes[n.index()].op.clone()
    }

    /// The type of `v`.
    #[must_use]
    pub fn value_type(&self, v: ValueId) -> &TypeHandle {
        &self.values[v.index()].ty
    }

    /// Output `index` of node `n`.
    #[must_use]
    pub fn out(&self, n: NodeId, index: usize) -> ValueId {
        self.nodes[n.index()].outputs[index]
    }

    /// The producing `(node, output index)` of `v`, when computed.
    #[must_use]
    pub fn owner(&self, v: ValueId) -> Option<(NodeId, usize)> {
        self.values[v.index()].owner()
    }

    /// Whether `n` is resident.
    #[must_use]
    pub fn is_resident_node(&self, n: NodeId) -> bool {
        self.apply_nodes.contains(&n)
    }

    /// Whether `v` is resident.
    #[must_use]
    pub fn is_resident_value(&self, v: ValueId) -> bool {
        self.variables.contains(&v)
    }

    /// Whether `v` is a constant.
    #[must_use]
    pub fn is_constant(&self, v: ValueId) -> bool {
        self.values[v.index()].is_constant()
    }

    /// Constant payload bytes, when `v` is a constant.
    #[must_use]
    pub fn constant_data(&self, v: ValueId) -> Option<&Bytes> {
        match &self.values[v.index()].kind {
            ValueKind::Constant { data } => Some(data),
            _ => None,
        }
    }

    /// Content signature, when `v` is a constant.
    #[must_use]
    pub fn constant_signature(&self, v: ValueId) -> Option<Signature> {
        self.values[v.index()].merge_signature()
    }

    /// Diagnostic name of `v`, when set.
    #[must_use]
    pub fn value_name(&self, v: ValueId) -> Option<String> {
        self.values[v.index()].tags.name.borrow().clone()
    }

    /// Sets the diagnostic name of `v`. Names never affect semantics, so
    /// this is allowed from shared-borrow contexts (feature callbacks).
    pub fn set_value_name(&self, v: ValueId, name: Option<String>) {
        *self.values[v.index()].tags.name.borrow_mut() = name;
    }

    /// Whether `v` carries the approximate-equality tag.
    #[must_use]
    pub fn eq_approx(&self, v: ValueId) -> bool {
        self.values[v.index()].tags.eq_approx.get()
    }

    /// Sets the approximate-equality tag on `v`.
    pub fn set_eq_approx(&self, v: ValueId, approx: bool) {
        self.values[v.index()].tags.eq_approx.set(approx);
    }

    /// Sets the diagnostic tag on node `n`.
    pub fn set_node_tag(&mut self, n: NodeId, tag: Option<String>) {
        self.nodes[n.index()].tag = tag;
    }

    /// Whether any resident operator declares a destroy map.
    #[must_use]
    pub fn has_destroyers(&self) -> bool {
        self.destroyer_nodes > 0
    }

    /// Timing sink for profile reports.
    #[must_use]
    pub fn stats(&self) -> &GraphStats {
        &self.stats
    }

    /// Resident nodes applying `op`, served from an attached
    /// [`NodeFinder`] when present and a linear scan otherwise.
    #[must_use]
    pub fn get_nodes(&self, op: &dyn Op) -> Vec<NodeId> {
        if let Some(finder) = self.find_feature::<NodeFinder>() {
            return finder.nodes(self, op);
        }
        self.apply_nodes
            .iter()
            .copied()
            .filter(|&n| self.node_op(n).op_eq(op))
            .collect()
    }

    /// Deterministic input-to-output ordering of the resident nodes.
    ///
    /// The order follows a post-order DFS from the outputs (in output
    /// order), descending through inputs in input order, so it depends
    /// only on the graph structure.
    #[must_use]
    pub fn toposort(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.apply_nodes.len());
        let mut pushed: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack: Vec<(NodeId, usize)> = Vec::new();
        for &out in &self.outputs {
            let Some((root, _)) = self.owner(out) else {
                continue;
            };
            if !self.apply_nodes.contains(&root) || !pushed.insert(root) {
                continue;
            }
            stack.push((root, 0));
            while let Some(&(node, cursor)) = stack.last() {
                let inputs = &self.nodes[node.index()].inputs;
                if cursor < inputs.len() {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let input = inputs[cursor];
                    if let Some((producer, _)) = self.owner(input) {
                        if self.apply_nodes.contains(&producer) && pushed.insert(producer) {
                            stack.push((producer, 0));
                        }
                    }
                } else {
                    stack.pop();
                    order.push(node);
                }
            }
        }
        order
    }

    // ── Features ────────────────────────────────────────────────────

    /// Attaches a feature, firing its `on_attach` hook.
    pub fn attach_feature<T: Feature + 'static>(&mut self, feature: T) -> FeatureId {
        self.attach_shared(Rc::new(feature))
    }

    /// Attaches a shared feature handle, firing its `on_attach` hook.
    /// Use when the caller wants to keep reading the feature while it is
    /// attached.
    pub fn attach_shared<T: Feature + 'static>(&mut self, feature: Rc<T>) -> FeatureId {
        let id = FeatureId(self.next_feature);
        self.next_feature += 1;
        let erased: Rc<dyn Feature> = feature.clone();
        self.features.push(FeatureEntry {
            id,
            feature: erased.clone(),
            any: feature,
        });
        erased.on_attach(self);
        id
    }

    /// Detaches a feature, firing its `on_detach` hook. Returns whether
    /// the handle was attached.
    pub fn remove_feature(&mut self, id: FeatureId) -> bool {
        let Some(pos) = self.features.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = self.features.remove(pos);
        entry.feature.on_detach(self);
        true
    }

    /// First attached feature of concrete type `T`, when any.
    #[must_use]
    pub fn find_feature<T: Feature + 'static>(&self) -> Option<Rc<T>> {
        self.features
            .iter()
            .find_map(|e| e.any.clone().downcast::<T>().ok())
    }

    fn feature_list(&self) -> Vec<Rc<dyn Feature>> {
        self.features.iter().map(|e| e.feature.clone()).collect()
    }

    fn notify_import(&self, node: NodeId, reason: &str) {
        let t0 = Instant::now();
        for f in self.feature_list() {
            f.on_import(self, node, reason);
        }
        self.stats.add_callback(t0.elapsed());
    }

    fn notify_prune(&self, node: NodeId, reason: &str) {
        let t0 = Instant::now();
        for f in self.feature_list() {
            f.on_prune(self, node, reason);
        }
        self.stats.add_callback(t0.elapsed());
    }

    fn notify_change_input(
        &self,
        client: Client,
        index: usize,
        old: ValueId,
        new: ValueId,
        reason: &str,
    ) {
        let t0 = Instant::now();
        for f in self.feature_list() {
            f.on_change_input(self, client, index, old, new, reason);
        }
        self.stats.add_callback(t0.elapsed());
    }

    // ── Mutation primitives ─────────────────────────────────────────

    /// Rebinds input slot `index` of `client` from its current value to
    /// `new`, importing `new` and pruning whatever the rebinding strands.
    pub fn change_input(
        &mut self,
        client: Client,
        index: usize,
        new: ValueId,
        reason: &str,
    ) -> Result<(), InconsistencyError> {
        if !self.live {
            return Err(InconsistencyError::NotLive);
        }
        let old = self.client_slot(client, index)?;
        if old == new {
            return Ok(());
        }
        self.import_value(new, reason)?;
        self.bind_input(client, index, old, new)?;
        self.journal_push(JournalOp::ChangeInput { client, index, old });
        self.notify_change_input(client, index, old, new, reason);
        self.maybe_prune(old, reason);
        Ok(())
    }

    /// Replaces every use of `old` with `new` (unvalidated).
    ///
    /// The destination type must equal the source type or be reachable
    /// through the source type's coercion query; otherwise the
    /// replacement is rejected before any mutation.
    pub fn replace(
        &mut self,
        old: ValueId,
        new: ValueId,
        reason: &str,
    ) -> Result<(), InconsistencyError> {
        if !self.live {
            return Err(InconsistencyError::NotLive);
        }
        if !self.variables.contains(&old) {
            return Err(InconsistencyError::NotResident(old));
        }
        let new = self.coerce_for(old, new)?;
        if old == new {
            return Ok(());
        }
        let uses: Vec<(Client, usize)> = self.clients(old).to_vec();
        for (client, index) in uses {
            self.change_input(client, index, new, reason)?;
        }
        Ok(())
    }

    /// Applies every `(old, new)` replacement in order, without
    /// re-validating the result.
    pub fn replace_all(
        &mut self,
        pairs: &[(ValueId, ValueId)],
        reason: &str,
    ) -> Result<(), InconsistencyError> {
        for &(old, new) in pairs {
            self.replace(old, new, reason)?;
        }
        Ok(())
    }

    /// Applies every replacement, then re-validates the graph. On
    /// rejection the whole batch is rolled back (firing the mirror
    /// callbacks) and the validation error is returned.
    pub fn replace_all_validate(
        &mut self,
        pairs: &[(ValueId, ValueId)],
        reason: &str,
    ) -> Result<(), InconsistencyError> {
        self.replace_all_validate_remove(pairs, &[], reason)
    }

    /// [`Graph::replace_all_validate`] plus an explicit removal list:
    /// after the batch, every value in `remove` must have left the graph,
    /// otherwise the batch is rolled back.
    pub fn replace_all_validate_remove(
        &mut self,
        pairs: &[(ValueId, ValueId)],
        remove: &[ValueId],
        reason: &str,
    ) -> Result<(), InconsistencyError> {
        let mark = self.checkpoint();
        for &(old, new) in pairs {
            if let Err(e) = self.replace(old, new, reason) {
                self.rollback(mark);
                return Err(e);
            }
        }
        if let Err(e) = self.validate() {
            self.rollback(mark);
            return Err(e);
        }
        for &r in remove {
            if self.variables.contains(&r) {
                self.rollback(mark);
                return Err(InconsistencyError::RemoveInUse(r));
            }
        }
        self.commit();
        Ok(())
    }

    /// Re-checks the graph invariants: acyclicity over the resident
    /// nodes, and at most one destroyer per value when the destroy
    /// capability is present.
    pub fn validate(&mut self) -> Result<(), InconsistencyError> {
        let t0 = Instant::now();
        let result = self.validate_inner();
        self.stats.add_validate(t0.elapsed());
        result
    }

    fn validate_inner(&self) -> Result<(), InconsistencyError> {
        // Kahn count over resident nodes: a shortfall means a cycle.
        let mut indegree: FxHashMap<NodeId, usize> = FxHashMap::default();
        for &n in &self.apply_nodes {
            let producers = self.nodes[n.index()]
                .inputs
                .iter()
                .filter(|&&v| {
                    self.owner(v)
                        .is_some_and(|(p, _)| self.apply_nodes.contains(&p))
                })
                .count();
            indegree.insert(n, producers);
        }
        let mut ready: Vec<NodeId> = indegree
            .iter()
            .filter_map(|(&n, &d)| (d == 0).then_some(n))
            .collect();
        let mut seen = 0usize;
        while let Some(n) = ready.pop() {
            seen += 1;
            for &out in &self.nodes[n.index()].outputs {
                for &(client, _) in self.clients(out) {
                    if let Client::Node(c) = client {
                        if let Some(d) = indegree.get_mut(&c) {
                            *d -= 1;
                            if *d == 0 {
                                ready.push(c);
                            }
                        }
                    }
                }
            }
        }
        if seen != self.apply_nodes.len() {
            return Err(InconsistencyError::Cycle);
        }

        if self.has_destroyers() {
            let mut destroyed: FxHashMap<ValueId, usize> = FxHashMap::default();
            for &n in &self.apply_nodes {
                let record = &self.nodes[n.index()];
                let Some(dm) = record.op.destroy_map() else {
                    continue;
                };
                for input_indices in dm.values() {
                    for &i in input_indices {
                        let Some(&v) = record.inputs.get(i) else {
                            return Err(InconsistencyError::Corrupt(
                                "destroy map references a missing input",
                            ));
                        };
                        let count = destroyed.entry(v).or_insert(0);
                        *count += 1;
                        if *count > 1 {
                            return Err(InconsistencyError::DestroyConflict(v));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Rewires input `index` of a *detached* node in place, without
    /// client bookkeeping or callbacks. The pre-pass utilities use this
    /// on fragments that are not graph-resident; resident nodes are
    /// rejected.
    pub fn rewire_detached_input(
        &mut self,
        node: NodeId,
        index: usize,
        new: ValueId,
    ) -> Result<(), InconsistencyError> {
        if self.apply_nodes.contains(&node) {
            return Err(InconsistencyError::ResidentRewire(node));
        }
        let record = &mut self.nodes[node.index()];
        let Some(slot) = record.inputs.get_mut(index) else {
            return Err(InconsistencyError::BadInputIndex { node, index });
        };
        *slot = new;
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn alloc_value(&mut self, record: ValueRecord) -> ValueId {
        let id = ValueId(u32::try_from(self.values.len()).unwrap_or(u32::MAX));
        self.values.push(record);
        id
    }

    /// Coerces `new` so it can stand in for `old`, per the source type's
    /// conversion query.
    fn coerce_for(&self, old: ValueId, new: ValueId) -> Result<ValueId, InconsistencyError> {
        let t_old = self.value_type(old).clone();
        let t_new = self.value_type(new);
        if t_old.same_as(&**t_new) {
            return Ok(new);
        }
        // The conversion result is trusted: the source type has blessed
        // it as an acceptable stand-in (see `ValueType::convert`).
        match t_old.convert(self, new) {
            Some(coerced) => Ok(coerced),
            None => Err(InconsistencyError::TypeMismatch {
                old,
                new,
                old_type: t_old.signature(),
                new_type: t_new.signature(),
            }),
        }
    }

    fn client_slot(&self, client: Client, index: usize) -> Result<ValueId, InconsistencyError> {
        match client {
            Client::Node(n) => {
                self.nodes[n.index()]
                    .inputs
                    .get(index)
                    .copied()
                    .ok_or(InconsistencyError::BadInputIndex { node: n, index })
            }
            Client::Output => self
                .outputs
                .get(index)
                .copied()
                .ok_or(InconsistencyError::Corrupt("output index out of range")),
        }
    }

    fn bind_input(
        &mut self,
        client: Client,
        index: usize,
        old: ValueId,
        new: ValueId,
    ) -> Result<(), InconsistencyError> {
        match client {
            Client::Node(n) => {
                let record = &mut self.nodes[n.index()];
                let Some(slot) = record.inputs.get_mut(index) else {
                    return Err(InconsistencyError::BadInputIndex { node: n, index });
                };
                *slot = new;
            }
            Client::Output => {
                let Some(slot) = self.outputs.get_mut(index) else {
                    return Err(InconsistencyError::Corrupt("output index out of range"));
                };
                *slot = new;
            }
        }
        self.drop_client(old, client, index);
        self.clients.entry(new).or_default().push((client, index));
        Ok(())
    }

    fn drop_client(&mut self, v: ValueId, client: Client, index: usize) {
        if let Some(list) = self.clients.get_mut(&v) {
            if let Some(pos) = list.iter().position(|&(c, i)| c == client && i == index) {
                list.swap_remove(pos);
            }
        }
    }

    fn value_class(&self, v: ValueId) -> ValueClass {
        match self.values[v.index()].kind {
            ValueKind::Computed { node, .. } => ValueClass::Owned(node),
            ValueKind::Constant { .. } => ValueClass::Constant,
            ValueKind::Input => ValueClass::Input,
        }
    }

    fn import_value(&mut self, v: ValueId, reason: &str) -> Result<(), InconsistencyError> {
        if self.variables.contains(&v) {
            return Ok(());
        }
        match self.value_class(v) {
            ValueClass::Owned(node) => self.import_node(node, reason),
            ValueClass::Constant => {
                self.variables.insert(v);
                self.journal_push(JournalOp::ConstImport(v));
                Ok(())
            }
            ValueClass::Input => Err(InconsistencyError::MissingInput(v)),
        }
    }

    fn import_node(&mut self, node: NodeId, reason: &str) -> Result<(), InconsistencyError> {
        if self.apply_nodes.contains(&node) {
            return Ok(());
        }
        let inputs = self.nodes[node.index()].inputs.clone();
        for &input in &inputs {
            self.import_value(input, reason)?;
        }
        self.apply_nodes.insert(node);
        let outputs = self.nodes[node.index()].outputs.clone();
        for out in outputs {
            self.variables.insert(out);
        }
        for (index, &input) in inputs.iter().enumerate() {
            self.clients
                .entry(input)
                .or_default()
                .push((Client::Node(node), index));
        }
        if self.nodes[node.index()].op.destroy_map().is_some() {
            self.destroyer_nodes += 1;
        }
        self.journal_push(JournalOp::Import(node));
        self.notify_import(node, reason);
        Ok(())
    }

    fn maybe_prune(&mut self, v: ValueId, reason: &str) {
        if self.input_set.contains(&v) {
            return;
        }
        if !self.clients(v).is_empty() {
            return;
        }
        match self.value_class(v) {
            ValueClass::Owned(node) => {
                if self.apply_nodes.contains(&node) && self.node_unused(node) {
                    self.prune_node(node, reason);
                }
            }
            ValueClass::Constant => {
                if self.variables.remove(&v) {
                    self.journal_push(JournalOp::ConstPrune(v));
                }
            }
            ValueClass::Input => {}
        }
    }

    fn node_unused(&self, node: NodeId) -> bool {
        self.nodes[node.index()]
            .outputs
            .iter()
            .all(|&out| self.clients(out).is_empty())
    }

    fn prune_node(&mut self, node: NodeId, reason: &str) {
        debug_assert!(self.node_unused(node), "pruning a node that still has clients");
        self.apply_nodes.remove(&node);
        let outputs = self.nodes[node.index()].outputs.clone();
        for out in outputs {
            self.variables.remove(&out);
        }
        if self.nodes[node.index()].op.destroy_map().is_some() {
            self.destroyer_nodes = self.destroyer_nodes.saturating_sub(1);
        }
        self.journal_push(JournalOp::Prune(node));
        // Clients of this node's inputs still include the node here, so
        // observers can see the full picture before it unwinds.
        self.notify_prune(node, reason);
        let inputs = self.nodes[node.index()].inputs.clone();
        for (index, input) in inputs.into_iter().enumerate() {
            self.drop_client(input, Client::Node(node), index);
            self.maybe_prune(input, reason);
        }
    }

    // ── Journal ─────────────────────────────────────────────────────

    fn journal_push(&mut self, op: JournalOp) {
        if self.recording {
            self.journal.push(op);
        }
    }

    fn checkpoint(&mut self) -> usize {
        debug_assert!(!self.recording, "validated replacements do not nest");
        self.recording = true;
        self.journal.len()
    }

    fn commit(&mut self) {
        self.recording = false;
        self.journal.clear();
    }

    fn rollback(&mut self, mark: usize) {
        self.recording = false;
        while self.journal.len() > mark {
            let Some(op) = self.journal.pop() else {
                break;
            };
            match op {
                JournalOp::ChangeInput { client, index, old } => {
                    let current = match self.client_slot(client, index) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if self.bind_input(client, index, current, old).is_ok() {
                        self.notify_change_input(client, index, current, old, "rollback");
                    }
                }
                JournalOp::Import(node) => {
                    // Mirror of import: detach the node and its client
                    // registrations.
                    self.apply_nodes.remove(&node);
                    let outputs = self.nodes[node.index()].outputs.clone();
                    for out in outputs {
                        self.variables.remove(&out);
                    }
                    if self.nodes[node.index()].op.destroy_map().is_some() {
                        self.destroyer_nodes = self.destroyer_nodes.saturating_sub(1);
                    }
                    self.notify_prune(node, "rollback");
                    let inputs = self.nodes[node.index()].inputs.clone();
                    for (index, input) in inputs.into_iter().enumerate() {
                        self.drop_client(input, Client::Node(node), index);
                    }
                }
                JournalOp::Prune(node) => {
                    // Mirror of prune: restore residency and client
                    // registrations.
                    self.apply_nodes.insert(node);
                    let outputs = self.nodes[node.index()].outputs.clone();
                    for out in outputs {
                        self.variables.insert(out);
                    }
                    if self.nodes[node.index()].op.destroy_map().is_some() {
                        self.destroyer_nodes += 1;
                    }
                    let inputs = self.nodes[node.index()].inputs.clone();
                    for (index, input) in inputs.into_iter().enumerate() {
                        self.clients
                            .entry(input)
                            .or_default()
                            .push((Client::Node(node), index));
                    }
                    self.notify_import(node, "rollback");
                }
                JournalOp::ConstImport(v) => {
                    self.variables.remove(&v);
                }
                JournalOp::ConstPrune(v) => {
                    self.variables.insert(v);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::algebra::{
        add_op, const_i64, identity_op, inplace_inc_op, int_view, scalar_f64, scalar_i64,
    };

    #[test]
    fn clients_are_complete_after_import() {
        let mut g = Graph::new();
        let x = g.add_input(scalar_i64());
        let y = g.add_input(scalar_i64());
        let n = g.add_node(add_op(), &[x, y]).unwrap();
        let out = g.out(n, 0);
        g.set_outputs(&[out]).unwrap();

        assert!(g.clients(x).contains(&(Client::Node(n), 0)));
        assert!(g.clients(y).contains(&(Client::Node(n), 1)));
        assert!(g.clients(out).contains(&(Client::Output, 0)));
        assert_eq!(g.apply_nodes().len(), 1);
        assert!(g.variables().contains(&out));
    }

    #[test]
    fn replace_redirects_clients_and_prunes_the_stranded_node() {
        let mut g = Graph::new();
        let x = g.add_input(scalar_i64());
        let id = g.add_node(identity_op(), &[x]).unwrap();
        let out = g.out(id, 0);
        g.set_outputs(&[out]).unwrap();

        g.replace(out, x, "test").unwrap();
        assert_eq!(g.outputs(), &[x]);
        assert!(g.apply_nodes().is_empty());
        assert!(!g.is_resident_value(out));
    }

    #[test]
    fn replace_rejects_type_mismatch_before_mutating() {
        let mut g = Graph::new();
        let x = g.add_input(scalar_i64());
        let id = g.add_node(identity_op(), &[x]).unwrap();
        let out = g.out(id, 0);
        g.set_outputs(&[out]).unwrap();
        let f = g.add_constant(scalar_f64(), crate::algebra::f64_bytes(1.0));

        let err = g.replace(out, f, "test").unwrap_err();
        assert!(matches!(err, InconsistencyError::TypeMismatch { .. }));
        assert_eq!(g.outputs(), &[out]);
    }

    #[test]
    fn coercion_is_asymmetric_between_view_and_scalar() {
        let mut g = Graph::new();
        let x = g.add_input(scalar_i64());
        let v = g.add_input(int_view());
        let idx = g.add_node(identity_op(), &[x]).unwrap();
        let idv = g.add_node(identity_op(), &[v]).unwrap();
        let out_x = g.out(idx, 0);
        let out_v = g.out(idv, 0);
        g.set_outputs(&[out_x, out_v]).unwrap();

        // A view can observe a scalar, so the view side accepts it.
        g.replace(out_v, out_x, "test").unwrap();
        assert_eq!(g.outputs()[1], out_x);
        // The reverse direction has no coercion and is rejected.
        let err = g.replace(out_x, v, "test").unwrap_err();
        assert!(matches!(err, InconsistencyError::TypeMismatch { .. }));
    }

    #[test]
    fn validated_replacement_rolls_back_on_destroy_conflict() {
        let mut g = Graph::new();
        let x = g.add_input(scalar_i64());
        let y = g.add_input(scalar_i64());
        let d1 = g.add_node(inplace_inc_op(), &[x]).unwrap();
        let d2 = g.add_node(inplace_inc_op(), &[y]).unwrap();
        let o1 = g.out(d1, 0);
        let o2 = g.out(d2, 0);
        g.set_outputs(&[o1, o2]).unwrap();

        let err = g.replace_all_validate(&[(y, x)], "test").unwrap_err();
        assert!(matches!(err, InconsistencyError::DestroyConflict(_)));
        // Rolled back: the second destroyer still reads y.
        assert_eq!(g.node(d2).inputs(), &[y]);
        assert!(g.clients(y).contains(&(Client::Node(d2), 0)));
    }

    #[test]
    fn toposort_is_deterministic_and_covers_every_resident_node() {
        let mut g = Graph::new();
        let x = g.add_input(scalar_i64());
        let c = const_i64(&mut g, 2);
        let a = g.add_node(add_op(), &[x, c]).unwrap();
        let b = g.add_node(add_op(), &[g.out(a, 0), x]).unwrap();
        let d = g.add_node(add_op(), &[g.out(a, 0), g.out(b, 0)]).unwrap();
        g.set_outputs(&[g.out(d, 0)]).unwrap();

        let order = g.toposort();
        assert_eq!(order.len(), g.apply_nodes().len());
        assert_eq!(order, g.toposort());
        let pos = |n: NodeId| order.iter().position(|&m| m == n).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(b) < pos(d));
    }

    #[test]
    fn remove_list_is_enforced() {
        let mut g = Graph::new();
        let x = g.add_input(scalar_i64());
        let id = g.add_node(identity_op(), &[x]).unwrap();
        let keep = g.add_node(identity_op(), &[g.out(id, 0)]).unwrap();
        let out = g.out(keep, 0);
        g.set_outputs(&[out, g.out(id, 0)]).unwrap();

        // Replacing only `keep`'s output leaves `id` alive through the
        // second graph output, so demanding its removal must fail.
        let err = g
            .replace_all_validate_remove(&[(out, x)], &[g.out(id, 0)], "test")
            .unwrap_err();
        assert!(matches!(err, InconsistencyError::RemoveInUse(_)));
        assert_eq!(g.outputs()[0], out);
    }
}
