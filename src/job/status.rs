use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job tracked by the engine.
///
/// Each job flows through: PENDING → RUNNING → COMPLETED | FAILED | CANCELLED.
/// A job may also fail or be cancelled straight out of `Pending` when its
/// workspace cannot be prepared or the engine shuts down before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// - `Pending` may start running, or end as failed/cancelled.
    /// - `Running` may only end.
    /// - Terminal statuses accept nothing.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::Running | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Running => next.is_terminal(),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}
