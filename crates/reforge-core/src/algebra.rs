// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A small scalar-algebra operator library.
//!
//! This is not a real operator library; it exists so the engine has
//! something concrete to rewrite in examples, tests, and benchmarks.
//! It still exercises every seam the engine consumes: typed values,
//! by-value operator equality, lineage-based dispatch, destroy maps,
//! and literal matching.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::OpError;
use crate::graph::Graph;
use crate::ident::ValueId;
use crate::op::{DestroyMap, Op, OpHandle};
use crate::pattern::PatternLit;
use crate::ty::{TypeHandle, ValueType};

/// Scalar type parameterized by a dtype label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarType {
    dtype: &'static str,
}

impl ValueType for ScalarType {
    fn signature(&self) -> String {
        format!("scalar<{}>", self.dtype)
    }

    fn matches_literal(&self, data: &[u8], lit: &PatternLit) -> bool {
        match (self.dtype, lit) {
            ("i64", PatternLit::I64(v)) => data == v.to_le_bytes(),
            ("f64", PatternLit::F64(v)) => data == v.to_le_bytes(),
            _ => false,
        }
    }
}

/// A read-only view type that accepts plain `i64` scalars.
///
/// Exists to exercise the asymmetric coercion path: a view-typed value
/// can stand in for nothing, but an `i64` scalar can stand in for a
/// view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntViewType;

impl ValueType for IntViewType {
    fn signature(&self) -> String {
        "int-view".to_owned()
    }

    fn convert(&self, graph: &Graph, v: ValueId) -> Option<ValueId> {
        let sig = graph.value_type(v).signature();
        (sig == self.signature() || sig == "scalar<i64>").then_some(v)
    }
}

/// The `scalar<i64>` type.
#[must_use]
pub fn scalar_i64() -> TypeHandle {
    Arc::new(ScalarType { dtype: "i64" })
}

/// The `scalar<f64>` type.
#[must_use]
pub fn scalar_f64() -> TypeHandle {
    Arc::new(ScalarType { dtype: "f64" })
}

/// The int-view type.
#[must_use]
pub fn int_view() -> TypeHandle {
    Arc::new(IntViewType)
}

/// Little-endian payload bytes for an `i64` constant.
#[must_use]
pub fn i64_bytes(value: i64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

/// Little-endian payload bytes for an `f64` constant.
#[must_use]
pub fn f64_bytes(value: f64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

/// Adds an `i64` constant to `graph`.
pub fn const_i64(graph: &mut Graph, value: i64) -> ValueId {
    graph.add_constant(scalar_i64(), i64_bytes(value))
}

fn check_arity(op: &str, expected: usize, got: usize) -> Result<(), OpError> {
    if expected == got {
        Ok(())
    } else {
        Err(OpError::BadArity {
            op: op.to_owned(),
            expected,
            got,
        })
    }
}

fn check_same_types(op: &str, graph: &Graph, inputs: &[ValueId]) -> Result<(), OpError> {
    let Some((&first, rest)) = inputs.split_first() else {
        return Ok(());
    };
    let expect = graph.value_type(first).signature();
    for (i, &input) in rest.iter().enumerate() {
        if graph.value_type(input).signature() != expect {
            return Err(OpError::BadInput {
                op: op.to_owned(),
                index: i + 1,
                reason: "input types must agree".to_owned(),
            });
        }
    }
    Ok(())
}

/// Elementwise binary scalar operator (`add`, `mul`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinOp {
    name: &'static str,
}

impl Op for BinOp {
    fn name(&self) -> &str {
        self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| o == self)
    }

    fn lineage(&self) -> &'static [&'static str] {
        &["binop", "scalar-op"]
    }

    fn output_types(&self, graph: &Graph, inputs: &[ValueId]) -> Result<Vec<TypeHandle>, OpError> {
        check_arity(self.name, 2, inputs.len())?;
        check_same_types(self.name, graph, inputs)?;
        Ok(vec![graph.value_type(inputs[0]).clone()])
    }
}

/// Elementwise unary scalar operator (`neg`, `identity`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnOp {
    name: &'static str,
}

impl Op for UnOp {
    fn name(&self) -> &str {
        self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|o| o == self)
    }

    fn lineage(&self) -> &'static [&'static str] {
        &["unop", "scalar-op"]
    }

    fn output_types(&self, graph: &Graph, inputs: &[ValueId]) -> Result<Vec<TypeHandle>, OpError> {
        check_arity(self.name, 1, inputs.len())?;
        Ok(vec![graph.value_type(inputs[0]).clone()])
    }
}

/// Unary operator duplicating its input on two outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DupOp;

impl Op for DupOp {
    fn name(&self) -> &str {
        "dup"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        other.as_any().downcast_ref::<Self>().is_some()
    }

    fn lineage(&self) -> &'static [&'static str] {
        &["fanout-op", "scalar-op"]
    }

    fn output_types(&self, graph: &Graph, inputs: &[ValueId]) -> Result<Vec<TypeHandle>, OpError> {
        check_arity("dup", 1, inputs.len())?;
        let ty = graph.value_type(inputs[0]).clone();
        Ok(vec![ty.clone(), ty])
    }
}

/// Unary operator that increments its input in place (declares a
/// destroy map over input 0).
#[derive(Debug, Clone)]
pub struct InplaceIncOp {
    destroy: DestroyMap,
}

impl Op for InplaceIncOp {
    fn name(&self) -> &str {
        "inplace_inc"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn op_eq(&self, other: &dyn Op) -> bool {
        other.as_any().downcast_ref::<Self>().is_some()
    }

    fn lineage(&self) -> &'static [&'static str] {
        &["inplace-op", "scalar-op"]
    }

    fn destroy_map(&self) -> Option<&DestroyMap> {
        Some(&self.destroy)
    }

    fn output_types(&self, graph: &Graph, inputs: &[ValueId]) -> Result<Vec<TypeHandle>, OpError> {
        check_arity("inplace_inc", 1, inputs.len())?;
        Ok(vec![graph.value_type(inputs[0]).clone()])
    }
}

/// The `add` operator.
#[must_use]
pub fn add_op() -> OpHandle {
    Arc::new(BinOp { name: "add" })
}

/// The `mul` operator.
#[must_use]
pub fn mul_op() -> OpHandle {
    Arc::new(BinOp { name: "mul" })
}

/// The `sub` operator.
#[must_use]
pub fn sub_op() -> OpHandle {
    Arc::new(BinOp { name: "sub" })
}

/// The `neg` operator.
#[must_use]
pub fn neg_op() -> OpHandle {
    Arc::new(UnOp { name: "neg" })
}

/// The `identity` operator.
#[must_use]
pub fn identity_op() -> OpHandle {
    Arc::new(UnOp { name: "identity" })
}

/// The `dup` operator.
#[must_use]
pub fn dup_op() -> OpHandle {
    Arc::new(DupOp)
}

/// The in-place increment operator.
#[must_use]
pub fn inplace_inc_op() -> OpHandle {
    Arc::new(InplaceIncOp {
        destroy: BTreeMap::from([(0, vec![0])]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_equality_is_by_value() {
        assert!(add_op().op_eq(&*add_op()));
        assert!(!add_op().op_eq(&*mul_op()));
        assert!(!add_op().op_eq(&*neg_op()));
    }

    #[test]
    fn lineage_supports_class_membership() {
        assert!(add_op().is_a("binop"));
        assert!(add_op().is_a("scalar-op"));
        assert!(!add_op().is_a("unop"));
    }
}
