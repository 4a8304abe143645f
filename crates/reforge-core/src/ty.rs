// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Open-world value types.

use std::sync::Arc;

use crate::graph::Graph;
use crate::ident::ValueId;
use crate::pattern::PatternLit;

/// Shared handle to a value type.
pub type TypeHandle = Arc<dyn ValueType>;

/// The type attached to every graph value.
///
/// Types are open-world plugins. The engine only needs three things from
/// them: equality, a coercion query used when validating replacements, and
/// (optionally) literal matching for the pattern rewriter.
///
/// Equality is signature-based: two types are the same when their
/// [`ValueType::signature`] strings are equal. Implementations with
/// structural parameters must fold every parameter into the signature.
pub trait ValueType: core::fmt::Debug + Send + Sync {
    /// Stable, human-readable description of this type. Doubles as the
    /// equality key and as the type component of constant signatures.
    fn signature(&self) -> String;

    /// The "convert variable" coercion query.
    ///
    /// Asked when a replacement's destination type differs from the source
    /// type: return a value this type accepts as a stand-in (often `v`
    /// itself), or `None` when no lossless view exists. The result is
    /// trusted by the replacement machinery. The default accepts only
    /// values that already have this type.
    fn convert(&self, graph: &Graph, v: ValueId) -> Option<ValueId> {
        (graph.value_type(v).signature() == self.signature()).then_some(v)
    }

    /// Whether a constant of this type with payload `data` matches the
    /// pattern literal `lit`. Defaults to no match; types that want their
    /// constants addressable from pattern literals override this.
    fn matches_literal(&self, data: &[u8], lit: &PatternLit) -> bool {
        let _ = (data, lit);
        false
    }
}

impl dyn ValueType {
    /// Signature-based type equality.
    #[must_use]
    pub fn same_as(&self, other: &dyn ValueType) -> bool {
        self.signature() == other.signature()
    }
}
