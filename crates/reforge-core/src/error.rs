// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error taxonomies for the graph substrate and the rewrite drivers.

use thiserror::Error;

use crate::ident::{NodeId, ValueId};

/// A replacement or mutation was rejected by graph validation.
///
/// Drivers treat these as recoverable: the offending replacement is rolled
/// back and the driver decides (via its failure policy) whether to log,
/// ignore, or propagate. The exception is [`InconsistencyError::Corrupt`],
/// which signals a broken internal invariant and always propagates.
#[derive(Debug, Error)]
pub enum InconsistencyError {
    /// The mutation would make a value transitively depend on itself.
    #[error("replacement would create a cycle")]
    Cycle,
    /// Destination type neither equals the source type nor coerces to it.
    #[error("type mismatch replacing {old} with {new}: {old_type} vs {new_type}")]
    TypeMismatch {
        /// Value being replaced.
        old: ValueId,
        /// Proposed replacement value.
        new: ValueId,
        /// Type signature of the replaced value.
        old_type: String,
        /// Type signature of the replacement.
        new_type: String,
    },
    /// Two clients would destructively write the same value.
    #[error("value {0} would have more than one destroyer")]
    DestroyConflict(ValueId),
    /// An operation referenced a value that is not resident in the graph.
    #[error("value {0} is not resident in the graph")]
    NotResident(ValueId),
    /// A replacement subtree reaches a free value the graph does not own
    /// as an input.
    #[error("imported subtree reaches unknown input {0}")]
    MissingInput(ValueId),
    /// A value slated for removal still had clients after the replacement.
    #[error("value {0} was marked for removal but is still in use")]
    RemoveInUse(ValueId),
    /// Detached in-place rewiring was attempted on a resident node.
    #[error("node {0} is resident; in-place rewiring is reserved for detached fragments")]
    ResidentRewire(NodeId),
    /// The graph was asked to mutate before its outputs were declared.
    #[error("graph is not live yet (call set_outputs first)")]
    NotLive,
    /// Outputs were declared twice.
    #[error("graph outputs are already set")]
    AlreadyLive,
    /// An input slot index was out of range for the client node.
    #[error("input index {index} out of range for {node}")]
    BadInputIndex {
        /// Client node.
        node: NodeId,
        /// Offending slot index.
        index: usize,
    },
    /// Internal invariant violated; graph state can no longer be trusted.
    #[error("internal invariant violated: {0}")]
    Corrupt(&'static str),
}

/// An operator rejected the inputs offered to it.
#[derive(Debug, Error)]
pub enum OpError {
    /// Wrong number of inputs.
    #[error("operator {op} expects {expected} inputs, got {got}")]
    BadArity {
        /// Operator name.
        op: String,
        /// Declared input count.
        expected: usize,
        /// Offered input count.
        got: usize,
    },
    /// An input had an unusable type.
    #[error("operator {op} rejected input {index}: {reason}")]
    BadInput {
        /// Operator name.
        op: String,
        /// Offending input position.
        index: usize,
        /// Operator-supplied explanation.
        reason: String,
    },
}

/// Failure surfaced by a rewriter or a rewrite driver.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// The graph rejected a replacement proposed by a rewriter.
    #[error("graph rejected replacement: {0}")]
    Graph(#[from] InconsistencyError),
    /// An operator refused to build a replacement node.
    #[error(transparent)]
    Op(#[from] OpError),
    /// A rewriter returned a malformed outcome (wrong replacement count,
    /// unbound pattern variable, and so on). Always propagates.
    #[error("rewriter {rewriter} returned a malformed outcome at {node}: {detail}")]
    MalformedTransform {
        /// Name of the offending rewriter.
        rewriter: String,
        /// The node the rewriter was transforming.
        node: NodeId,
        /// What was wrong with the outcome.
        detail: String,
    },
    /// A rewriter exceeded the equilibrium driver's use-ratio bound.
    #[error("rewriter {rewriter} exceeded the use bound of {max_use} applications")]
    MaxUseExceeded {
        /// Name of the runaway rewriter.
        rewriter: String,
        /// The bound that was exceeded.
        max_use: u64,
    },
    /// A rewriter reported a domain-specific failure.
    #[error("rewriter {rewriter} failed: {message}")]
    Failed {
        /// Name of the failing rewriter.
        rewriter: String,
        /// Rewriter-supplied message.
        message: String,
    },
}

impl RewriteError {
    /// Whether this error must propagate regardless of failure policy.
    ///
    /// Corruption and malformed rewriter outcomes indicate broken
    /// invariants, not recoverable rewrite misses.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Graph(InconsistencyError::Corrupt(_)) | Self::MalformedTransform { .. }
        )
    }

    /// Whether this error is a graph validation rejection.
    #[must_use]
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, Self::Graph(_))
    }
}
