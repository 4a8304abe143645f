// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rewrite abstractions.
//!
//! Two vocabularies compose every rewrite in the crate: a *graph rewrite*
//! transforms the whole graph in one call; a *node rewrite* is indexed by
//! operator and transforms one node at a time under a traversal driver.
//! Rewriter identity is reference identity: drivers key their counters by
//! registration slot, never by structural comparison.

use crate::error::RewriteError;
use crate::graph::Graph;
use crate::ident::{NodeId, ValueId};
use crate::op::{Op, OpHandle};
use crate::profile::Profile;

/// Outcome of a node rewrite.
#[derive(Debug, Clone)]
pub enum Transform {
    /// The rewrite does not apply to this node.
    Unchanged,
    /// Replacement values for the node's outputs, positionally; the
    /// length must equal the node's output count.
    Outputs(Vec<ValueId>),
    /// Explicit replacement mapping plus values that must leave the
    /// graph with it.
    Replace {
        /// `(old, new)` replacement pairs.
        pairs: Vec<(ValueId, ValueId)>,
        /// Values required to be pruned by the replacement.
        remove: Vec<ValueId>,
    },
}

impl Transform {
    /// Whether this outcome changes anything.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    /// The replacement values, in output order, regardless of form.
    #[must_use]
    pub fn new_values(&self) -> Vec<ValueId> {
        match self {
            Self::Unchanged => Vec::new(),
            Self::Outputs(vs) => vs.clone(),
            Self::Replace { pairs, .. } => pairs.iter().map(|&(_, new)| new).collect(),
        }
    }
}

/// What a node rewrite declares interest in.
#[derive(Clone)]
pub enum TrackTarget {
    /// A specific operator instance (matched by operator equality).
    Instance(OpHandle),
    /// An operator class, matched against [`Op::lineage`].
    Class(&'static str),
}

impl TrackTarget {
    /// Whether `op` falls under this target.
    #[must_use]
    pub fn matches(&self, op: &dyn Op) -> bool {
        match self {
            Self::Instance(handle) => handle.op_eq(op),
            Self::Class(class) => op.is_a(class),
        }
    }
}

impl core::fmt::Debug for TrackTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Instance(handle) => write!(f, "Instance({})", handle.name()),
            Self::Class(class) => write!(f, "Class({class})"),
        }
    }
}

/// A rewrite applied to the whole graph in one call.
pub trait GraphRewrite {
    /// Rewriter name for diagnostics and profiles.
    fn name(&self) -> &str;

    /// Attaches whatever features the rewrite needs. Called before
    /// [`GraphRewrite::apply`] by [`GraphRewrite::rewrite`] and by
    /// composite drivers.
    fn prepare(&self, graph: &mut Graph) {
        let _ = graph;
    }

    /// Transforms the graph, returning a profile of what happened.
    fn apply(&self, graph: &mut Graph) -> Result<Profile, RewriteError>;

    /// Convenience: prepare, then apply.
    fn rewrite(&self, graph: &mut Graph) -> Result<Profile, RewriteError> {
        self.prepare(graph);
        self.apply(graph)
    }
}

/// A rewrite applied to one node at a time by a traversal driver.
pub trait NodeRewrite {
    /// Rewriter name for diagnostics and profiles.
    fn name(&self) -> &str;

    /// Operators this rewrite applies to; `None` means every node.
    fn tracks(&self) -> Option<Vec<TrackTarget>> {
        None
    }

    /// Operators to seed an operator-keyed driver from. Empty when the
    /// rewrite cannot be driven that way.
    fn op_key(&self) -> Vec<OpHandle> {
        Vec::new()
    }

    /// Whether the rewrite can apply to nodes it created itself. Drivers
    /// in auto mode skip re-processing new nodes when this is false.
    fn reentrant(&self) -> bool {
        true
    }

    /// Whether the inputs of a transformed node survive into the
    /// replacement outputs.
    fn retains_inputs(&self) -> bool {
        false
    }

    /// Attaches whatever features the rewrite needs.
    fn prepare(&self, graph: &mut Graph) {
        let _ = graph;
    }

    /// Attempts to rewrite `node`.
    fn transform(&self, graph: &mut Graph, node: NodeId) -> Result<Transform, RewriteError>;
}

/// Hook attaching a feature requirement to a function-derived rewrite.
pub type AttachHook = Box<dyn Fn(&mut Graph)>;

/// A [`GraphRewrite`] wrapping a plain function.
pub struct FnGraphRewrite {
    name: String,
    hooks: Vec<AttachHook>,
    #[allow(clippy::type_complexity)]
    f: Box<dyn Fn(&mut Graph) -> Result<Profile, RewriteError>>,
}

impl FnGraphRewrite {
    /// Wraps `f` under `name`.
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&mut Graph) -> Result<Profile, RewriteError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            hooks: Vec::new(),
            f: Box::new(f),
        }
    }

    /// Adds a feature-attach hook run by [`GraphRewrite::prepare`].
    #[must_use]
    pub fn with_hook(mut self, hook: impl Fn(&mut Graph) + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }
}

impl GraphRewrite for FnGraphRewrite {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, graph: &mut Graph) {
        for hook in &self.hooks {
            hook(graph);
        }
    }

    fn apply(&self, graph: &mut Graph) -> Result<Profile, RewriteError> {
        (self.f)(graph)
    }
}

impl core::fmt::Debug for FnGraphRewrite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnGraphRewrite")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A [`NodeRewrite`] wrapping a plain function.
pub struct FnNodeRewrite {
    name: String,
    tracks: Option<Vec<TrackTarget>>,
    hooks: Vec<AttachHook>,
    #[allow(clippy::type_complexity)]
    f: Box<dyn Fn(&mut Graph, NodeId) -> Result<Transform, RewriteError>>,
}

impl FnNodeRewrite {
    /// Wraps `f` under `name`, applying to every node.
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&mut Graph, NodeId) -> Result<Transform, RewriteError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            tracks: None,
            hooks: Vec::new(),
            f: Box::new(f),
        }
    }

    /// Restricts the rewrite to the given targets.
    #[must_use]
    pub fn with_tracks(mut self, tracks: Vec<TrackTarget>) -> Self {
        self.tracks = Some(tracks);
        self
    }

    /// Adds a feature-attach hook run by [`NodeRewrite::prepare`].
    #[must_use]
    pub fn with_hook(mut self, hook: impl Fn(&mut Graph) + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }
}

impl NodeRewrite for FnNodeRewrite {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracks(&self) -> Option<Vec<TrackTarget>> {
        self.tracks.clone()
    }

    fn prepare(&self, graph: &mut Graph) {
        for hook in &self.hooks {
            hook(graph);
        }
    }

    fn transform(&self, graph: &mut Graph, node: NodeId) -> Result<Transform, RewriteError> {
        if let Some(tracks) = &self.tracks {
            let op_matches = tracks.iter().any(|t| t.matches(graph.node_op(node)));
            if !op_matches {
                return Ok(Transform::Unchanged);
            }
        }
        (self.f)(graph, node)
    }
}

impl core::fmt::Debug for FnNodeRewrite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnNodeRewrite")
            .field("name", &self.name)
            .field("tracks", &self.tracks)
            .finish_non_exhaustive()
    }
}
