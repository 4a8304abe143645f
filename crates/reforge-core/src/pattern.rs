// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Syntactic pattern rewriting.
//!
//! A [`PatternRewrite`] replaces occurrences of an input pattern with a
//! reified output pattern. Matching is structural unification against the
//! producer tree of a node's output, with named variables bound at most
//! once per match, literal and typed-constant terminals, and optional
//! per-subpattern constraints.

use std::rc::Rc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::error::RewriteError;
use crate::graph::Graph;
use crate::ident::{NodeId, ValueId};
use crate::op::OpHandle;
use crate::rewrite::{NodeRewrite, TrackTarget, Transform};
use crate::ty::TypeHandle;

/// Literal terminal in an input pattern; matches a constant whose type
/// recognizes the value via [`crate::ValueType::matches_literal`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatternLit {
    /// Integer literal.
    I64(i64),
    /// Float literal.
    F64(f64),
}

/// Constraint predicate attached to a subpattern.
pub type ConstraintFn = dyn Fn(&Graph, ValueId) -> bool;

/// Hook returning the nodes a retargeted pattern should actually try.
pub type GetNodesFn = dyn Fn(&Graph, NodeId) -> Vec<NodeId>;

/// One node of a pattern tree.
#[derive(Clone)]
pub enum Pattern {
    /// An operator application over subpatterns.
    App(OpHandle, Vec<Pattern>),
    /// A named variable, bound at most once per match.
    Var(String),
    /// A literal; input patterns only.
    Lit(PatternLit),
    /// A specific constant: payload equality, plus type equality when a
    /// type is given. Output patterns require the type so the constant
    /// can be materialized.
    Const {
        /// Required type, when type-sensitive.
        ty: Option<TypeHandle>,
        /// Required payload bytes.
        data: Bytes,
    },
    /// A subpattern guarded by a predicate; input patterns only.
    Where {
        /// The guarded subpattern.
        pattern: Box<Pattern>,
        /// Additional matching condition.
        constraint: Rc<ConstraintFn>,
    },
}

impl Pattern {
    /// An application pattern.
    #[must_use]
    pub fn app(op: OpHandle, subs: Vec<Pattern>) -> Self {
        Self::App(op, subs)
    }

    /// A variable pattern.
    #[must_use]
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    /// An integer literal pattern.
    #[must_use]
    pub fn lit_i64(value: i64) -> Self {
        Self::Lit(PatternLit::I64(value))
    }

    /// A float literal pattern.
    #[must_use]
    pub fn lit_f64(value: f64) -> Self {
        Self::Lit(PatternLit::F64(value))
    }

    /// A typed-constant pattern.
    #[must_use]
    pub fn constant(ty: TypeHandle, data: impl Into<Bytes>) -> Self {
        Self::Const {
            ty: Some(ty),
            data: data.into(),
        }
    }

    /// Guards `pattern` with `constraint`.
    #[must_use]
    pub fn guarded(pattern: Self, constraint: impl Fn(&Graph, ValueId) -> bool + 'static) -> Self {
        Self::Where {
            pattern: Box::new(pattern),
            constraint: Rc::new(constraint),
        }
    }

    /// The operator at the root, looking through guards.
    fn root_op(&self) -> Option<&OpHandle> {
        match self {
            Self::App(op, _) => Some(op),
            Self::Where { pattern, .. } => pattern.root_op(),
            _ => None,
        }
    }

    fn collect_vars(&self, vars: &mut Vec<String>) {
        match self {
            Self::Var(name) => {
                if !vars.contains(name) {
                    vars.push(name.clone());
                }
            }
            Self::App(_, subs) => {
                for sub in subs {
                    sub.collect_vars(vars);
                }
            }
            Self::Where { pattern, .. } => pattern.collect_vars(vars),
            Self::Lit(_) | Self::Const { .. } => {}
        }
    }
}

impl core::fmt::Display for Pattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::App(op, subs) => {
                write!(f, "{}(", op.name())?;
                for (i, sub) in subs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{sub}")?;
                }
                f.write_str(")")
            }
            Self::Var(name) => f.write_str(name),
            Self::Lit(PatternLit::I64(v)) => write!(f, "{v}"),
            Self::Lit(PatternLit::F64(v)) => write!(f, "{v}"),
            Self::Const { .. } => f.write_str("const"),
            Self::Where { pattern, .. } => write!(f, "{pattern} subject to <constraint>"),
        }
    }
}

impl core::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self}")
    }
}

/// A malformed pattern pair, reported at construction time.
#[derive(Debug, Error)]
pub enum PatternError {
    /// The input pattern must be an operator application.
    #[error("the input pattern must start with an operator application")]
    RootNotApp,
    /// The output pattern used a variable the input never binds.
    #[error("output pattern variable '{0}' is never bound by the input pattern")]
    UnboundVar(String),
    /// Constraints are meaningless in output patterns.
    #[error("output patterns cannot carry constraints")]
    ConstraintInOutput,
    /// Output literals need a type to be materialized under.
    #[error("output literals must be typed constants")]
    UntypedLiteralInOutput,
}

/// Node rewrite replacing an input pattern with an output pattern.
///
/// Unless [`PatternRewrite::allow_multiple_clients`] is set, the match is
/// rejected when any intermediate value of the matched subgraph feeds
/// anything outside it, since rewriting would duplicate that work.
pub struct PatternRewrite {
    in_pattern: Pattern,
    out_pattern: Pattern,
    root_op: OpHandle,
    allow_multiple_clients: bool,
    eq_approx: bool,
    name: String,
    tracks: Option<Vec<TrackTarget>>,
    get_nodes: Option<Box<GetNodesFn>>,
}

impl PatternRewrite {
    /// Builds a rewrite replacing `in_pattern` with `out_pattern`.
    pub fn new(in_pattern: Pattern, out_pattern: Pattern) -> Result<Self, PatternError> {
        let root_op = in_pattern.root_op().ok_or(PatternError::RootNotApp)?.clone();
        let mut in_vars = Vec::new();
        in_pattern.collect_vars(&mut in_vars);
        Self::check_output(&out_pattern, &in_vars)?;
        let name = format!("{in_pattern} -> {out_pattern}");
        Ok(Self {
            in_pattern,
            out_pattern,
            root_op,
            allow_multiple_clients: false,
            eq_approx: false,
            name,
            tracks: None,
            get_nodes: None,
        })
    }

    fn check_output(pattern: &Pattern, in_vars: &[String]) -> Result<(), PatternError> {
        match pattern {
            Pattern::Var(name) => {
                if in_vars.contains(name) {
                    Ok(())
                } else {
                    Err(PatternError::UnboundVar(name.clone()))
                }
            }
            Pattern::App(_, subs) => {
                for sub in subs {
                    Self::check_output(sub, in_vars)?;
                }
                Ok(())
            }
            Pattern::Where { .. } => Err(PatternError::ConstraintInOutput),
            Pattern::Lit(_) | Pattern::Const { ty: None, .. } => {
                Err(PatternError::UntypedLiteralInOutput)
            }
            Pattern::Const { ty: Some(_), .. } => Ok(()),
        }
    }

    /// Overrides the derived name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Permits matched intermediates to have clients outside the match.
    #[must_use]
    pub fn allow_multiple_clients(mut self, allow: bool) -> Self {
        self.allow_multiple_clients = allow;
        self
    }

    /// Tags reified results as approximately equal to what they replace.
    #[must_use]
    pub fn with_eq_approx(mut self, approx: bool) -> Self {
        self.eq_approx = approx;
        self
    }

    /// Registers interest in `tracks` but rewrites the nodes returned by
    /// `get_nodes` instead, letting a pattern over a frequent operator
    /// ride on a rarer one.
    #[must_use]
    pub fn with_retarget(
        mut self,
        tracks: Vec<TrackTarget>,
        get_nodes: impl Fn(&Graph, NodeId) -> Vec<NodeId> + 'static,
    ) -> Self {
        self.tracks = Some(tracks);
        self.get_nodes = Some(Box::new(get_nodes));
        self
    }

    fn unify(
        &self,
        graph: &Graph,
        pattern: &Pattern,
        v: ValueId,
        depth: usize,
        env: &mut FxHashMap<String, ValueId>,
        inner: &mut Vec<ValueId>,
    ) -> bool {
        match pattern {
            Pattern::Var(name) => {
                if let Some(&bound) = env.get(name) {
                    bound == v
                } else {
                    env.insert(name.clone(), v);
                    true
                }
            }
            Pattern::Lit(lit) => graph
                .constant_data(v)
                .is_some_and(|data| graph.value_type(v).matches_literal(data, lit)),
            Pattern::Const { ty, data } => {
                graph.constant_data(v) == Some(data)
                    && ty
                        .as_ref()
                        .is_none_or(|t| t.same_as(&**graph.value_type(v)))
            }
            Pattern::App(op, subs) => {
                let Some((node, _)) = graph.owner(v) else {
                    return false;
                };
                if !graph.node_op(node).op_eq(&**op) {
                    return false;
                }
                let inputs = graph.node(node).inputs().to_vec();
                if inputs.len() != subs.len() {
                    return false;
                }
                if depth > 0 {
                    inner.push(v);
                }
                subs.iter()
                    .zip(inputs)
                    .all(|(sub, input)| self.unify(graph, sub, input, depth + 1, env, inner))
            }
            Pattern::Where {
                pattern,
                constraint,
            } => constraint(graph, v) && self.unify(graph, pattern, v, depth, env, inner),
        }
    }

    fn reify(
        &self,
        graph: &mut Graph,
        pattern: &Pattern,
        env: &FxHashMap<String, ValueId>,
        matched: NodeId,
    ) -> Result<ValueId, RewriteError> {
        match pattern {
            Pattern::Var(name) => env.get(name).copied().ok_or_else(|| {
                RewriteError::MalformedTransform {
                    rewriter: self.name.clone(),
                    node: matched,
                    detail: format!("output variable '{name}' is unbound"),
                }
            }),
            Pattern::Const { ty: Some(ty), data } => {
                Ok(graph.add_constant(ty.clone(), data.clone()))
            }
            Pattern::App(op, subs) => {
                let mut children = Vec::with_capacity(subs.len());
                for sub in subs {
                    children.push(self.reify(graph, sub, env, matched)?);
                }
                let node = graph.add_node(op.clone(), &children)?;
                if graph.node(node).outputs().len() != 1 {
                    return Err(RewriteError::MalformedTransform {
                        rewriter: self.name.clone(),
                        node: matched,
                        detail: format!(
                            "output operator {} is not single-output",
                            op.name()
                        ),
                    });
                }
                Ok(graph.out(node, 0))
            }
            Pattern::Lit(_) | Pattern::Const { ty: None, .. } | Pattern::Where { .. } => {
                Err(RewriteError::MalformedTransform {
                    rewriter: self.name.clone(),
                    node: matched,
                    detail: "pattern form is not allowed in outputs".to_owned(),
                })
            }
        }
    }

    /// Attempts the match rooted at `node`; returns the replacement value
    /// for its single output on success.
    fn try_match(
        &self,
        graph: &mut Graph,
        node: NodeId,
    ) -> Result<Option<ValueId>, RewriteError> {
        if !graph.node_op(node).op_eq(&*self.root_op) {
            return Ok(None);
        }
        if graph.node(node).outputs().len() != 1 {
            return Ok(None);
        }
        let out = graph.out(node, 0);

        let mut env = FxHashMap::default();
        let mut inner = Vec::new();
        if !self.unify(graph, &self.in_pattern, out, 0, &mut env, &mut inner) {
            return Ok(None);
        }
        if !self.allow_multiple_clients && inner.iter().any(|&v| graph.clients(v).len() > 1) {
            return Ok(None);
        }

        let ret = self.reify(graph, &self.out_pattern, &env, node)?;

        // The reified value must be type-compatible with what it replaces.
        let compatible = match graph.owner(ret) {
            Some((new_node, _)) => {
                let new_outs = graph.node(new_node).outputs();
                let old_outs = graph.node(node).outputs();
                new_outs.len() == old_outs.len()
                    && new_outs.iter().zip(old_outs).all(|(&a, &b)| {
                        graph.value_type(a).same_as(&**graph.value_type(b))
                    })
            }
            None => graph.value_type(ret).same_as(&**graph.value_type(out)),
        };
        if !compatible {
            return Ok(None);
        }

        if self.eq_approx {
            graph.set_eq_approx(ret, true);
        }
        Ok(Some(ret))
    }
}

impl NodeRewrite for PatternRewrite {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracks(&self) -> Option<Vec<TrackTarget>> {
        self.tracks
            .clone()
            .or_else(|| Some(vec![TrackTarget::Instance(self.root_op.clone())]))
    }

    fn op_key(&self) -> Vec<OpHandle> {
        vec![self.root_op.clone()]
    }

    fn transform(&self, graph: &mut Graph, node: NodeId) -> Result<Transform, RewriteError> {
        if let Some(get_nodes) = &self.get_nodes {
            let real_nodes = get_nodes(graph, node);
            for real in real_nodes {
                if !graph.is_resident_node(real) {
                    continue;
                }
                if let Some(ret) = self.try_match(graph, real)? {
                    let out = graph.out(real, 0);
                    return Ok(Transform::Replace {
                        pairs: vec![(out, ret)],
                        remove: Vec::new(),
                    });
                }
            }
            return Ok(Transform::Unchanged);
        }
        match self.try_match(graph, node)? {
            Some(ret) => Ok(Transform::Outputs(vec![ret])),
            None => Ok(Transform::Unchanged),
        }
    }
}

impl core::fmt::Debug for PatternRewrite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PatternRewrite")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
