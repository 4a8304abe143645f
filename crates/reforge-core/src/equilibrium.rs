// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fixed-point rewrite driver.
//!
//! [`Equilibrium`] interleaves four disjoint rewrite lists (*global*,
//! *local* dispatched through a [`RewriteTracker`], *final*, and
//! *cleanup*) and iterates until one complete pass changes nothing.
//! Runaway rewrite interplay (two rewrites inverting each other, for
//! example) is cut off by the use-ratio bound: once any rewriter's
//! cumulative application count exceeds `max_nodes_seen × max_use_ratio`,
//! the loop aborts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use tracing::warn;

use crate::config::{OnError, OnFailure, RewriteConfig};
use crate::error::RewriteError;
use crate::feature::{ChangeHook, ChangeTracker, Updater};
use crate::graph::Graph;
use crate::ident::{NodeId, ValueId};
use crate::profile::{EquilibriumProfile, PassProfile, Profile, RewriterStats};
use crate::rewrite::{GraphRewrite, NodeRewrite};
use crate::tracker::RewriteTracker;
use crate::walk::process_node;

/// Fixed-point driver over global, local, final, and cleanup rewrites.
pub struct Equilibrium {
    name: String,
    config: RewriteConfig,
    globals: Vec<Rc<dyn GraphRewrite>>,
    tracker: RewriteTracker,
    finals: Vec<Rc<dyn GraphRewrite>>,
    cleanups: Vec<Rc<dyn GraphRewrite>>,
    policy: OnFailure,
    tracks_on_change_inputs: bool,
}

/// Bookkeeping shared by the per-list runners inside one apply call.
struct RunState {
    change: Rc<ChangeTracker>,
    stats: Vec<RewriterStats>,
    pass_applied: u64,
    changed: bool,
    aborted: Option<String>,
    max_use: f64,
}

impl RunState {
    fn tally(&mut self, slot: usize, created: u64) {
        self.stats[slot].applied += 1;
        self.stats[slot].node_created += created;
        self.pass_applied += 1;
        self.changed = true;
        #[allow(clippy::cast_precision_loss)]
        if self.aborted.is_none() && self.stats[slot].applied as f64 > self.max_use {
            self.aborted = Some(self.stats[slot].name.clone());
        }
    }
}

impl Equilibrium {
    /// Creates an empty driver named `name` under `config`.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RewriteConfig) -> Self {
        Self {
            name: name.into(),
            config,
            globals: Vec::new(),
            tracker: RewriteTracker::new(),
            finals: Vec::new(),
            cleanups: Vec::new(),
            policy: config.on_error.into(),
            tracks_on_change_inputs: false,
        }
    }

    /// Adds a global rewrite, run at the start of every iteration.
    #[must_use]
    pub fn with_global(mut self, rewrite: Rc<dyn GraphRewrite>) -> Self {
        self.globals.push(rewrite);
        self
    }

    /// Adds a node rewrite, dispatched per node through the tracker.
    #[must_use]
    pub fn with_local(mut self, rewrite: Rc<dyn NodeRewrite>) -> Self {
        self.tracker.add(rewrite);
        self
    }

    /// Adds a final rewrite, run after the node loop of every iteration.
    #[must_use]
    pub fn with_final(mut self, rewrite: Rc<dyn GraphRewrite>) -> Self {
        self.finals.push(rewrite);
        self
    }

    /// Adds a cleanup rewrite. Cleanups must not traverse the graph:
    /// they run after the globals, after every local success, and after
    /// the finals.
    #[must_use]
    pub fn with_cleanup(mut self, rewrite: Rc<dyn GraphRewrite>) -> Self {
        self.cleanups.push(rewrite);
        self
    }

    /// Overrides the failure policy derived from the configuration.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: OnFailure) -> Self {
        self.policy = policy;
        self
    }

    /// Also re-queues nodes whose inputs changed mid-pass.
    #[must_use]
    pub fn with_tracks_on_change_inputs(mut self, track: bool) -> Self {
        self.tracks_on_change_inputs = track;
        self
    }

    /// The node rewrites registered with the internal tracker.
    pub fn local_rewrites(&self) -> impl Iterator<Item = &Rc<dyn NodeRewrite>> {
        self.tracker.iter()
    }

    fn absorb_global(&self, error: RewriteError, name: &str) -> Result<(), RewriteError> {
        if error.is_fatal() {
            return Err(error);
        }
        match self.policy {
            OnFailure::Raise => Err(error),
            OnFailure::Ignore => Ok(()),
            OnFailure::Warn | OnFailure::WarnInconsistency => {
                warn!(rewriter = name, error = %error, "global rewrite failed");
                Ok(())
            }
        }
    }

    /// Runs one list of graph rewrites, tallying changes per slot.
    fn run_list(
        &self,
        graph: &mut Graph,
        list: &[Rc<dyn GraphRewrite>],
        base_slot: usize,
        state: &mut RunState,
    ) -> Result<(), RewriteError> {
        for (i, rewrite) in list.iter().enumerate() {
            if state.aborted.is_some() {
                return Ok(());
            }
            let slot = base_slot + i;
            state.change.reset();
            let imported_before = state.change.nb_imported();
            let t0 = Instant::now();
            let result = rewrite.rewrite(graph);
            state.stats[slot].elapsed += t0.elapsed();
            if let Err(e) = result {
                self.absorb_global(e, rewrite.name())?;
            }
            if state.change.changed() {
                let created = state.change.nb_imported() - imported_before;
                state.tally(slot, created);
            }
        }
        Ok(())
    }

    /// Runs the cleanup list repeatedly until a full sweep changes
    /// nothing.
    fn run_cleanups(
        &self,
        graph: &mut Graph,
        cleanup_base: usize,
        state: &mut RunState,
    ) -> Result<(), RewriteError> {
        loop {
            if state.aborted.is_some() {
                return Ok(());
            }
            let applied_before = state.pass_applied;
            self.run_list(graph, &self.cleanups, cleanup_base, state)?;
            if state.pass_applied == applied_before {
                return Ok(());
            }
        }
    }
}

impl GraphRewrite for Equilibrium {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, graph: &mut Graph) {
        for rewrite in &self.globals {
            rewrite.prepare(graph);
        }
        for rewrite in self.tracker.iter() {
            rewrite.prepare(graph);
        }
        for rewrite in &self.finals {
            rewrite.prepare(graph);
        }
        for rewrite in &self.cleanups {
            rewrite.prepare(graph);
        }
    }

    fn apply(&self, graph: &mut Graph) -> Result<Profile, RewriteError> {
        let n_globals = self.globals.len();
        let n_locals = self.tracker.len();
        let n_finals = self.finals.len();
        let final_base = n_globals + n_locals;
        let cleanup_base = final_base + n_finals;

        let mut names: Vec<String> = Vec::new();
        names.extend(self.globals.iter().map(|r| r.name().to_owned()));
        names.extend(self.tracker.iter().map(|r| r.name().to_owned()));
        names.extend(self.finals.iter().map(|r| r.name().to_owned()));
        names.extend(self.cleanups.iter().map(|r| r.name().to_owned()));

        let change = Rc::new(ChangeTracker::new());
        let change_id = graph.attach_shared(change.clone());

        let nodes_start = graph.apply_nodes().len();
        let mut nodes_max = nodes_start;
        #[allow(clippy::cast_precision_loss)]
        let mut state = RunState {
            change,
            stats: names
                .into_iter()
                .map(|name| RewriterStats {
                    name,
                    applied: 0,
                    node_created: 0,
                    elapsed: std::time::Duration::ZERO,
                })
                .collect(),
            pass_applied: 0,
            changed: true,
            aborted: None,
            max_use: nodes_max as f64 * self.config.max_use_ratio,
        };

        let mut passes: Vec<PassProfile> = Vec::new();
        let mut outcome: Result<(), RewriteError> = Ok(());

        while state.changed && state.aborted.is_none() {
            let t_pass = Instant::now();
            state.changed = false;
            state.pass_applied = 0;

            if let Err(e) = self.run_list(graph, &self.globals, 0, &mut state) {
                outcome = Err(e);
                break;
            }
            if let Err(e) = self.run_cleanups(graph, cleanup_base, &mut state) {
                outcome = Err(e);
                break;
            }

            // Node loop: LIFO worklist seeded from the toposort, fed by
            // an updater with everything imported mid-pass.
            let order = graph.toposort();
            let pass_nodes = order.len();
            nodes_max = nodes_max.max(pass_nodes);
            #[allow(clippy::cast_precision_loss)]
            {
                state.max_use = nodes_max as f64 * self.config.max_use_ratio;
            }

            let queue: Rc<RefCell<Vec<NodeId>>> = Rc::new(RefCell::new(order));
            let current = Rc::new(Cell::new(None::<NodeId>));
            let importer_queue = queue.clone();
            let chin = self.tracks_on_change_inputs.then(|| {
                let q = queue.clone();
                let hook = move |_g: &Graph, node: NodeId, _i: usize, _old: ValueId, _new: ValueId| {
                    q.borrow_mut().push(node);
                };
                Box::new(hook) as ChangeHook
            });
            let updater_id = graph.attach_feature(Updater::new(
                Some(Box::new(move |_g: &Graph, n: NodeId| {
                    importer_queue.borrow_mut().push(n);
                })),
                None,
                chin,
                current.clone(),
            ));

            'nodes: loop {
                let next = queue.borrow_mut().pop();
                let Some(node) = next else {
                    break;
                };
                if !graph.is_resident_node(node) {
                    continue;
                }
                current.set(Some(node));
                let slots = self.tracker.get_trackers(graph.node_op(node));
                for local_slot in slots {
                    let rewrite = self.tracker.get(local_slot).clone();
                    let slot = n_globals + local_slot;
                    let imported_before = state.change.nb_imported();
                    let t0 = Instant::now();
                    let applied = process_node(graph, node, &*rewrite, self.policy);
                    state.stats[slot].elapsed += t0.elapsed();
                    match applied {
                        Ok(false) => {}
                        Ok(true) => {
                            let created = state.change.nb_imported() - imported_before;
                            state.tally(slot, created);
                            if let Err(e) = self.run_cleanups(graph, cleanup_base, &mut state) {
                                outcome = Err(e);
                                break 'nodes;
                            }
                            // The worklist can keep growing under an
                            // oscillating rewrite; the bound is the only
                            // thing that stops this loop then.
                            if state.aborted.is_some() {
                                break 'nodes;
                            }
                            if !graph.is_resident_node(node) {
                                break;
                            }
                        }
                        Err(e) => {
                            outcome = Err(e);
                            break 'nodes;
                        }
                    }
                }
            }
            current.set(None);
            graph.remove_feature(updater_id);
            if outcome.is_err() {
                break;
            }

            if let Err(e) = self.run_list(graph, &self.finals, final_base, &mut state) {
                outcome = Err(e);
                break;
            }
            if let Err(e) = self.run_cleanups(graph, cleanup_base, &mut state) {
                outcome = Err(e);
                break;
            }

            passes.push(PassProfile {
                elapsed: t_pass.elapsed(),
                applied: state.pass_applied,
                nodes: pass_nodes,
            });
        }

        graph.remove_feature(change_id);
        outcome?;

        if let Some(name) = &state.aborted {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let max_use = state.max_use.max(0.0) as u64;
            if self.config.on_error == OnError::Raise {
                return Err(RewriteError::MaxUseExceeded {
                    rewriter: name.clone(),
                    max_use,
                });
            }
            warn!(
                driver = %self.name,
                rewriter = %name,
                max_use,
                "equilibrium aborted by the use bound; raise max_use_ratio if this is expected"
            );
        }

        Ok(Profile::Equilibrium(EquilibriumProfile {
            passes,
            nodes_start,
            nodes_end: graph.apply_nodes().len(),
            nodes_max,
            rewriters: state.stats,
            max_use_hit: state.aborted,
        }))
    }
}

impl core::fmt::Debug for Equilibrium {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Equilibrium")
            .field("name", &self.name)
            .field("globals", &self.globals.len())
            .field("locals", &self.tracker.len())
            .field("finals", &self.finals.len())
            .field("cleanups", &self.cleanups.len())
            .finish_non_exhaustive()
    }
}
