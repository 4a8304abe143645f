// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! reforge-core: composable rewrite engine for typed computation graphs.
//!
//! A directed acyclic graph of typed values produced by operator
//! applications is transformed by a library of rewrites that preserve
//! observable semantics while canonicalizing and simplifying the graph
//! ahead of code generation. The crate provides the graph substrate
//! (arena storage, client tracking, observer features, validated
//! replacement), the rewrite vocabulary (whole-graph and node-local),
//! and the drivers that compose them: sequential, single-pass traversal,
//! operator-keyed, and fixed-point.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::option_if_let_else,
    clippy::cognitive_complexity,
    clippy::significant_drop_tightening,
    clippy::doc_markdown,
    clippy::too_many_lines,
    clippy::too_long_first_doc_paragraph,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::similar_names,
    clippy::manual_let_else,
    clippy::needless_pass_by_value,
    clippy::multiple_crate_versions
)]

/// Demonstration scalar-algebra operators used by examples and tests.
pub mod algebra;

mod config;
mod equilibrium;
mod error;
mod feature;
mod graph;
mod ident;
mod local;
mod merge;
mod op;
mod pattern;
mod prepass;
mod profile;
mod rewrite;
mod seq;
mod tracker;
mod ty;
mod value;
mod walk;

// Re-exports for the stable public API.
/// Driver configuration knobs and failure policies.
pub use config::{OnError, OnFailure, RewriteConfig};
/// The fixed-point driver.
pub use equilibrium::Equilibrium;
/// Error taxonomies for the graph substrate and the drivers.
pub use error::{InconsistencyError, OpError, RewriteError};
/// Observer features: the trait plus the provided observers.
pub use feature::{ChangeHook, ChangeTracker, Feature, NodeFinder, NodeHook, Updater};
/// The graph substrate.
pub use graph::{Graph, GraphStats, NodeRecord};
/// Identifier newtypes.
pub use ident::{Client, FeatureId, NodeId, ValueId};
/// Simple operator-local rewrites and chain probing.
pub use local::{check_chain, ChainLink, OpStrip, OpSwap};
/// Incremental common-subexpression merging.
pub use merge::{pre_constant_merge, MergeGroup, MergeIndex, MergePlan, MergeRewrite};
/// Open-world operator seam.
pub use op::{DestroyMap, Op, OpHandle};
/// Syntactic pattern rewriting.
pub use pattern::{Pattern, PatternError, PatternLit, PatternRewrite};
/// Greedy rewriting of detached fragments.
pub use prepass::pre_greedy_local_rewrite;
/// Per-driver profiles.
pub use profile::{
    EquilibriumProfile, MergeProfile, PassProfile, Profile, RewriterStats, SeqProfile, SeqStep,
    WalkProfile,
};
/// Rewrite abstractions and function-derived rewriters.
pub use rewrite::{
    AttachHook, FnGraphRewrite, FnNodeRewrite, GraphRewrite, NodeRewrite, TrackTarget, Transform,
};
/// Sequential composition.
pub use seq::SeqRewrite;
/// Operator-indexed dispatch and grouped node rewrites.
pub use tracker::{RewriteGroup, RewriteTracker};
/// Open-world value-type seam.
pub use ty::{TypeHandle, ValueType};
/// Value records and constant signatures.
pub use value::{Signature, ValueKind, ValueRecord, ValueTags};
/// Single-pass traversal drivers.
pub use walk::{in2out, out2in, NewTreePolicy, OpKeyRewrite, TopoRewrite, WalkOrder};
