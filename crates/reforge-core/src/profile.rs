// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rewrite profiles.
//!
//! Every driver returns a profile describing what it did. Profiles are
//! opaque to other drivers (a nested driver's profile is stored as-is in
//! its parent's) and render themselves through `Display`. Same-shaped
//! profiles from runs over different graphs can be aggregated with the
//! `merge` constructors.

use std::time::Duration;

/// Profile emitted by a rewrite application.
#[derive(Debug, Default)]
pub enum Profile {
    /// The rewriter reports nothing.
    #[default]
    None,
    /// Sequential-composition profile.
    Seq(SeqProfile),
    /// Merge-rewrite profile.
    Merge(MergeProfile),
    /// Single-pass traversal profile.
    Walk(WalkProfile),
    /// Fixed-point driver profile.
    Equilibrium(EquilibriumProfile),
}

impl Profile {
    /// Aggregates two profiles of the same shape; mismatched shapes
    /// collapse to [`Profile::None`].
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Seq(a), Self::Seq(b)) => Self::Seq(a.merge(b)),
            (Self::Merge(a), Self::Merge(b)) => Self::Merge(a.merge(b)),
            (Self::None, Self::None) => Self::None,
            _ => Self::None,
        }
    }
}

impl core::fmt::Display for Profile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::None => writeln!(f, "(no profile)"),
            Self::Seq(p) => p.fmt(f),
            Self::Merge(p) => p.fmt(f),
            Self::Walk(p) => p.fmt(f),
            Self::Equilibrium(p) => p.fmt(f),
        }
    }
}

/// One step of a [`SeqProfile`].
#[derive(Debug)]
pub struct SeqStep {
    /// Step rewriter name.
    pub name: String,
    /// Wall-clock time spent in the step.
    pub elapsed: Duration,
    /// Resident node count entering the step.
    pub nodes_before: usize,
    /// Resident node count leaving the step.
    pub nodes_after: usize,
    /// The step's own profile.
    pub sub: Profile,
}

/// Profile of a sequential composition.
#[derive(Debug)]
pub struct SeqProfile {
    /// Composition name.
    pub name: String,
    /// Per-step records, in application order.
    pub steps: Vec<SeqStep>,
    /// Resident node count before the first step.
    pub nodes_before: usize,
    /// Resident node count after the last step.
    pub nodes_after: usize,
    /// Validation time accumulated on the graph during the run.
    pub validate_time: Duration,
    /// Feature-callback time accumulated on the graph during the run.
    pub callback_time: Duration,
}

impl SeqProfile {
    /// Aggregates two runs, matching steps by name and position.
    ///
    /// Steps present in only one run are carried over unchanged.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        for (mine, theirs) in self.steps.iter_mut().zip(other.steps) {
            if mine.name == theirs.name {
                mine.elapsed += theirs.elapsed;
                let sub = core::mem::take(&mut mine.sub);
                mine.sub = sub.merge(theirs.sub);
            }
        }
        self.validate_time += other.validate_time;
        self.callback_time += other.callback_time;
        self
    }
}

impl core::fmt::Display for SeqProfile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let total: Duration = self.steps.iter().map(|s| s.elapsed).sum();
        writeln!(
            f,
            "SeqRewrite {} time {:.3}s for {}/{} nodes before/after",
            self.name,
            total.as_secs_f64(),
            self.nodes_before,
            self.nodes_after
        )?;
        writeln!(f, "  {:.3}s for callbacks", self.callback_time.as_secs_f64())?;
        writeln!(f, "  {:.3}s for validation", self.validate_time.as_secs_f64())?;
        for step in &self.steps {
            writeln!(
                f,
                "  {:.6}s - {} ({} -> {} nodes)",
                step.elapsed.as_secs_f64(),
                step.name,
                step.nodes_before,
                step.nodes_after
            )?;
        }
        Ok(())
    }
}

/// Profile of a merge pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeProfile {
    /// Replacement plans rejected by validation (and blacklisted).
    pub nb_fail: u64,
    /// Replacement pairs applied.
    pub nb_merged: u64,
    /// Constants canonicalized.
    pub nb_constant: u64,
    /// Wall-clock time in the apply loop.
    pub replace_time: Duration,
    /// Validation time accumulated on the graph during the pass.
    pub validate_time: Duration,
    /// Feature-callback time accumulated on the graph during the pass.
    pub callback_time: Duration,
}

impl MergeProfile {
    /// Aggregates two merge passes.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            nb_fail: self.nb_fail + other.nb_fail,
            nb_merged: self.nb_merged + other.nb_merged,
            nb_constant: self.nb_constant + other.nb_constant,
            replace_time: self.replace_time + other.replace_time,
            validate_time: self.validate_time + other.validate_time,
            callback_time: self.callback_time + other.callback_time,
        }
    }
}

impl core::fmt::Display for MergeProfile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "MergeRewrite")?;
        writeln!(
            f,
            "  nb fail={:5} merged={:5} constant={:5}",
            self.nb_fail, self.nb_merged, self.nb_constant
        )?;
        writeln!(
            f,
            "  time replace={:2.2}s validate={:2.2}s callback={:2.2}s",
            self.replace_time.as_secs_f64(),
            self.validate_time.as_secs_f64(),
            self.callback_time.as_secs_f64()
        )
    }
}

/// Profile of a single-pass traversal driver.
#[derive(Debug)]
pub struct WalkProfile {
    /// Driver name.
    pub name: String,
    /// Nodes whose outputs were replaced.
    pub hits: u64,
    /// Resident node count entering the pass.
    pub nodes_before: usize,
    /// Resident node count leaving the pass.
    pub nodes_after: usize,
    /// Time spent building the initial worklist.
    pub prep_time: Duration,
    /// Time spent in the node loop.
    pub loop_time: Duration,
    /// Feature-callback time accumulated during the pass.
    pub callback_time: Duration,
}

impl core::fmt::Display for WalkProfile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(
            f,
            "  nb_node (start, end, changed) ({}, {}, {})",
            self.nodes_before, self.nodes_after, self.hits
        )?;
        writeln!(f, "  init worklist {:.3}s", self.prep_time.as_secs_f64())?;
        writeln!(f, "  loop time {:.3}s", self.loop_time.as_secs_f64())?;
        writeln!(f, "  callback_time {:.3}s", self.callback_time.as_secs_f64())
    }
}

/// One iteration of the equilibrium driver.
#[derive(Debug)]
pub struct PassProfile {
    /// Wall-clock time of the iteration.
    pub elapsed: Duration,
    /// Successful rewriter applications during the iteration.
    pub applied: u64,
    /// Worklist size the iteration started from.
    pub nodes: usize,
}

/// Per-rewriter tallies across a whole equilibrium run.
#[derive(Debug, Clone)]
pub struct RewriterStats {
    /// Rewriter name.
    pub name: String,
    /// Successful applications.
    pub applied: u64,
    /// Nodes imported as a consequence of this rewriter.
    pub node_created: u64,
    /// Wall-clock time inside the rewriter.
    pub elapsed: Duration,
}

/// Profile of an equilibrium run.
#[derive(Debug)]
pub struct EquilibriumProfile {
    /// Per-iteration records.
    pub passes: Vec<PassProfile>,
    /// Resident node count at the start.
    pub nodes_start: usize,
    /// Resident node count at the end.
    pub nodes_end: usize,
    /// Largest worklist seen (the basis of the use bound).
    pub nodes_max: usize,
    /// Per-rewriter tallies, in registration order.
    pub rewriters: Vec<RewriterStats>,
    /// Name of the rewriter that tripped the use bound, when any.
    pub max_use_hit: Option<String>,
}

impl core::fmt::Display for EquilibriumProfile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let total: Duration = self.passes.iter().map(|p| p.elapsed).sum();
        writeln!(
            f,
            "Equilibrium time {:.3}s for {} passes",
            total.as_secs_f64(),
            self.passes.len()
        )?;
        writeln!(
            f,
            "  nb nodes (start, end, max) {} {} {}",
            self.nodes_start, self.nodes_end, self.nodes_max
        )?;
        if let Some(name) = &self.max_use_hit {
            writeln!(f, "  aborted by the use bound in '{name}'")?;
        }
        for (i, pass) in self.passes.iter().enumerate() {
            writeln!(
                f,
                "  {:2} - {:.3}s {} applied - {} nodes",
                i,
                pass.elapsed.as_secs_f64(),
                pass.applied,
                pass.nodes
            )?;
        }
        for stats in &self.rewriters {
            if stats.applied > 0 {
                writeln!(
                    f,
                    "  {:.3}s - {} - {} - {}",
                    stats.elapsed.as_secs_f64(),
                    stats.applied,
                    stats.node_created,
                    stats.name
                )?;
            }
        }
        Ok(())
    }
}
