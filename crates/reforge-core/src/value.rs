// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Value records: constants, computed values, and input placeholders.

use std::cell::{Cell, RefCell};

use bytes::Bytes;

use crate::ident::NodeId;
use crate::ty::TypeHandle;

/// Content-based key identifying equivalent constants.
///
/// Two constants share a signature exactly when they have equal payload
/// bytes and equal types, so a signature match is a merge license.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Signature(pub [u8; 32]);

impl core::fmt::Display for Signature {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&hex::encode(&self.0[0..8]))
    }
}

/// What kind of value a slot holds.
#[derive(Clone, Debug)]
pub enum ValueKind {
    /// A literal with an immutable payload.
    Constant {
        /// Canonical payload bytes; the type decides the encoding.
        data: Bytes,
    },
    /// Produced by an operation application.
    Computed {
        /// The producing node.
        node: NodeId,
        /// Output position on that node.
        index: usize,
    },
    /// A free value bound at graph evaluation time.
    Input,
}

/// Diagnostic tags carried by every value.
///
/// Tags are interior-mutable so observers (features) may update them from
/// shared-borrow callbacks; they never affect rewrite semantics.
#[derive(Debug, Default)]
pub struct ValueTags {
    /// Optional human-readable name.
    pub name: RefCell<Option<String>>,
    /// Marks a value whose payload is only approximately equal to the one
    /// it replaced (set by rewrites that trade exactness for shape).
    pub eq_approx: Cell<bool>,
}

/// One value slot in the graph arena.
#[derive(Debug)]
pub struct ValueRecord {
    /// The value's type.
    pub ty: TypeHandle,
    /// Constant / computed / input.
    pub kind: ValueKind,
    /// Diagnostic tags.
    pub tags: ValueTags,
}

impl ValueRecord {
    /// Creates a record with empty tags.
    #[must_use]
    pub fn new(ty: TypeHandle, kind: ValueKind) -> Self {
        Self {
            ty,
            kind,
            tags: ValueTags::default(),
        }
    }

    /// Whether this value is a constant.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ValueKind::Constant { .. })
    }

    /// The producing node and output position, when computed.
    #[must_use]
    pub fn owner(&self) -> Option<(NodeId, usize)> {
        match self.kind {
            ValueKind::Computed { node, index } => Some((node, index)),
            _ => None,
        }
    }

    /// Content signature for constants; `None` otherwise.
    ///
    /// The digest is domain-separated and folds in the type signature, so
    /// equal payloads of different types never collide.
    #[must_use]
    pub fn merge_signature(&self) -> Option<Signature> {
        match &self.kind {
            ValueKind::Constant { data } => {
                let mut hasher = blake3::Hasher::new();
                hasher.update(b"const:");
                let ty_sig = self.ty.signature();
                hasher.update(&(ty_sig.len() as u64).to_le_bytes());
                hasher.update(ty_sig.as_bytes());
                hasher.update(data);
                Some(Signature(hasher.finalize().into()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::scalar_i64;

    #[test]
    fn signatures_separate_types_and_payloads() {
        let a = ValueRecord::new(
            scalar_i64(),
            ValueKind::Constant {
                data: Bytes::copy_from_slice(&1i64.to_le_bytes()),
            },
        );
        let b = ValueRecord::new(
            scalar_i64(),
            ValueKind::Constant {
                data: Bytes::copy_from_slice(&1i64.to_le_bytes()),
            },
        );
        let c = ValueRecord::new(
            scalar_i64(),
            ValueKind::Constant {
                data: Bytes::copy_from_slice(&2i64.to_le_bytes()),
            },
        );
        assert_eq!(a.merge_signature(), b.merge_signature());
        assert_ne!(a.merge_signature(), c.merge_signature());
    }
}
