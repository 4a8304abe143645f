// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Driver configuration.

/// What a driver does with a recoverable rewrite failure.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OnError {
    /// Propagate the failure to the caller.
    Raise,
    /// Log the failure and continue with the next candidate.
    #[default]
    Warn,
    /// Continue silently.
    Ignore,
}

/// Per-driver failure policy, resolved from [`OnError`] at construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OnFailure {
    /// Propagate every failure.
    Raise,
    /// Log every failure and continue.
    Warn,
    /// Swallow every failure.
    Ignore,
    /// Swallow graph validation rejections silently; handle everything
    /// else per [`OnFailure::Warn`]. The usual policy for drivers running
    /// destructive (in-place) rewrites, where rejection is expected.
    WarnInconsistency,
}

impl From<OnError> for OnFailure {
    fn from(value: OnError) -> Self {
        match value {
            OnError::Raise => Self::Raise,
            OnError::Warn => Self::Warn,
            OnError::Ignore => Self::Ignore,
        }
    }
}

/// Knobs consulted by the rewrite drivers.
///
/// There is no process-wide configuration: a `RewriteConfig` is handed to
/// each driver at construction time and travels with it.
#[derive(Clone, Copy, Debug)]
pub struct RewriteConfig {
    /// Default failure policy for drivers that were not given an explicit
    /// [`OnFailure`].
    pub on_error: OnError,
    /// Safety bound for the equilibrium driver: each rewriter may be
    /// applied at most `max_nodes_seen × max_use_ratio` times.
    pub max_use_ratio: f64,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            on_error: OnError::Warn,
            max_use_ratio: 8.0,
        }
    }
}
