// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sequential composition of graph rewrites.

use std::time::Instant;

use tracing::warn;

use crate::config::OnFailure;
use crate::error::RewriteError;
use crate::graph::Graph;
use crate::profile::{Profile, SeqProfile, SeqStep};
use crate::rewrite::GraphRewrite;

/// Applies a list of graph rewrites in declared order.
///
/// A step failure is routed through the failure policy when one is
/// configured (log / swallow, then continue with the next step) and
/// propagated otherwise. Failures that indicate broken invariants
/// ([`RewriteError::is_fatal`]) always propagate.
pub struct SeqRewrite {
    name: String,
    steps: Vec<Box<dyn GraphRewrite>>,
    on_step_failure: Option<OnFailure>,
}

impl SeqRewrite {
    /// Creates a composition over `steps`, propagating step failures.
    #[must_use]
    pub fn new(name: impl Into<String>, steps: Vec<Box<dyn GraphRewrite>>) -> Self {
        Self {
            name: name.into(),
            steps,
            on_step_failure: None,
        }
    }

    /// Configures what to do when a step fails instead of propagating.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: OnFailure) -> Self {
        self.on_step_failure = Some(policy);
        self
    }

    /// The composed steps, in application order.
    #[must_use]
    pub fn steps(&self) -> &[Box<dyn GraphRewrite>] {
        &self.steps
    }
}

impl GraphRewrite for SeqRewrite {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, graph: &mut Graph) {
        for step in &self.steps {
            step.prepare(graph);
        }
    }

    fn apply(&self, graph: &mut Graph) -> Result<Profile, RewriteError> {
        let validate_before = graph.stats().validate_time();
        let callback_before = graph.stats().callback_time();
        let nodes_before = graph.apply_nodes().len();
        let mut steps = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let step_nodes_before = graph.apply_nodes().len();
            let t0 = Instant::now();
            let sub = match step.rewrite(graph) {
                Ok(sub) => sub,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => match self.on_step_failure {
                    None | Some(OnFailure::Raise) => return Err(e),
                    Some(OnFailure::Ignore) => Profile::None,
                    Some(OnFailure::Warn | OnFailure::WarnInconsistency) => {
                        warn!(seq = %self.name, step = step.name(), error = %e, "step failed");
                        Profile::None
                    }
                },
            };
            steps.push(SeqStep {
                name: step.name().to_owned(),
                elapsed: t0.elapsed(),
                nodes_before: step_nodes_before,
                nodes_after: graph.apply_nodes().len(),
                sub,
            });
        }

        Ok(Profile::Seq(SeqProfile {
            name: self.name.clone(),
            steps,
            nodes_before,
            nodes_after: graph.apply_nodes().len(),
            validate_time: graph.stats().validate_time() - validate_before,
            callback_time: graph.stats().callback_time() - callback_before,
        }))
    }
}

impl core::fmt::Debug for SeqRewrite {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SeqRewrite")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
