// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier newtypes for graph arena slots and feature handles.

/// Strongly typed identifier for a value in a [`crate::Graph`] arena.
///
/// `ValueId`s are dense `u32` slot indices. They are allocated sequentially
/// by a single graph and never reused within it; ids from different graphs
/// must not be mixed.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueId(pub u32);

impl ValueId {
    /// Returns the arena slot index for this id.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for ValueId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Strongly typed identifier for an operation application (node).
///
/// Same allocation rules as [`ValueId`]: dense, sequential, per-graph.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

impl NodeId {
    /// Returns the arena slot index for this id.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Handle returned by [`crate::Graph::attach_feature`], used to detach the
/// feature later. Handles are unique for the lifetime of the graph, even
/// across attach/detach cycles.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureId(pub u64);

/// A consumer of a value: either an input slot of a node, or the graph
/// output boundary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Client {
    /// The value feeds input slot `usize` of the paired node (the slot
    /// index is carried alongside in the client list).
    Node(NodeId),
    /// The value is exposed as a graph output.
    Output,
}

impl core::fmt::Display for Client {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Node(n) => write!(f, "{n}"),
            Self::Output => f.write_str("output"),
        }
    }
}
