//! Worker-pool job identity and state.
//!
//! The coordinator talks to any scheduler (local threads or an
//! external batch system) through this one vocabulary, so scheduler
//! quirks never leak into the state machine.

use serde::{Deserialize, Serialize};

/// Opaque job handle returned by a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of one submitted extraction job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum JobState {
    /// Accepted, waiting for a worker slot.
    Pending,
    Running,
    Succeeded,
    /// Failed with a human-readable reason. The pool records whether
    /// the failure looked infrastructural (`transient`); the retry
    /// policy built on top of that is the coordinator's call.
    Failed { reason: String, transient: bool },
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed { .. } | JobState::Cancelled
        )
    }
}
