// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Open-world operators.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::OpError;
use crate::graph::Graph;
use crate::ident::ValueId;
use crate::ty::TypeHandle;

/// Shared handle to an operator.
pub type OpHandle = Arc<dyn Op>;

/// Destructive-write declaration: output index → input indices the
/// operator mutates in place to produce that output.
pub type DestroyMap = BTreeMap<usize, Vec<usize>>;

/// One operator in the open-world operator library.
///
/// Operators are compared by value ([`Op::op_eq`], typically a downcast
/// plus field comparison) so that structurally identical applications can
/// be merged. Class-based rewrite dispatch walks [`Op::lineage`], the
/// operator's registered class chain, most specific first; an operator
/// with an empty lineage can only be tracked by instance.
pub trait Op: core::fmt::Debug + Send + Sync {
    /// Operator name for diagnostics and the node-finder index.
    fn name(&self) -> &str;

    /// `self` as [`Any`], for downcast-based equality.
    fn as_any(&self) -> &dyn Any;

    /// By-value equality with another operator.
    fn op_eq(&self, other: &dyn Op) -> bool;

    /// Registered class chain for class-based rewrite dispatch, most
    /// specific first. Defaults to no classes.
    fn lineage(&self) -> &'static [&'static str] {
        &[]
    }

    /// Inputs this operator destructively mutates, when any.
    fn destroy_map(&self) -> Option<&DestroyMap> {
        None
    }

    /// Computes the output types of an application over `inputs`.
    ///
    /// This is the node-construction seam: [`Graph::add_node`] consults it
    /// to decide how many outputs the application has and what their
    /// types are, and to let the operator reject unusable inputs.
    fn output_types(&self, graph: &Graph, inputs: &[ValueId]) -> Result<Vec<TypeHandle>, OpError>;
}

impl dyn Op + '_ {
    /// Whether this operator's class chain contains `class`.
    #[must_use]
    pub fn is_a(&self, class: &str) -> bool {
        self.lineage().contains(&class)
    }
}
