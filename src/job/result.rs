use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::status::JobStatus;
use super::submission::Job;

/// Exit code recorded when the supervisor had to kill a job on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Why a job ended without completing. Rendered into [`JobResult::error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// The workspace could not be prepared; no process was spawned.
    Preparation(String),
    /// The process could not be launched or supervised.
    Launch(String),
    /// The declared wall-clock limit expired.
    Timeout(Duration),
    /// The process exited with a non-zero code.
    NonZeroExit(i32),
    /// The process was terminated by a signal it did not handle.
    Signalled,
    /// An explicit cancel request (or engine shutdown) stopped the job.
    Cancelled,
    /// Artifacts could not be copied to the declared output location.
    Publish(String),
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::Preparation(msg) => write!(f, "workspace preparation failed: {msg}"),
            ExecutionFailure::Launch(msg) => write!(f, "failed to launch job: {msg}"),
            ExecutionFailure::Timeout(limit) => {
                write!(f, "job timed out after {} seconds", limit.as_secs_f64())
            }
            ExecutionFailure::NonZeroExit(code) => write!(f, "process exited with code {code}"),
            ExecutionFailure::Signalled => write!(f, "process was terminated by a signal"),
            ExecutionFailure::Cancelled => write!(f, "job was cancelled"),
            ExecutionFailure::Publish(msg) => write!(f, "failed to publish artifacts: {msg}"),
        }
    }
}

/// Execution record of a job, owned by the engine registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub name: String,
    pub status: JobStatus,
    pub stdout: String,
    pub stderr: String,
    /// Populated on every failure path.
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Files the job left in its outputs directory, or their published copies
    /// when the submission has an `output_ref`. Without one, cleanup deletes
    /// the workspace after recording, so these paths no longer exist.
    pub artifacts: Vec<PathBuf>,
    pub workspace: PathBuf,
    pub tags: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl JobResult {
    /// Fresh `Pending` record for a job about to be scheduled.
    pub fn pending(job: &Job, workspace: PathBuf) -> Self {
        Self {
            job_id: job.id.clone(),
            name: job.name().to_string(),
            status: JobStatus::Pending,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            exit_code: None,
            start_time: None,
            end_time: None,
            duration_ms: None,
            artifacts: Vec::new(),
            workspace,
            tags: job.submission.tags.clone(),
            metadata: job.submission.metadata.clone(),
        }
    }

    /// Apply a status change if the lifecycle allows it.
    ///
    /// Returns `false` (and leaves the record untouched) for a disallowed move,
    /// which includes any move out of a terminal status.
    pub fn advance(&mut self, next: JobStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next == JobStatus::Running && self.start_time.is_none() {
            self.start_time = Some(at);
        }
        if next.is_terminal() {
            let start = *self.start_time.get_or_insert(at);
            self.end_time = Some(at);
            self.duration_ms = Some((at - start).num_milliseconds());
        }
        true
    }

    /// Mark the job terminal with a failure description.
    pub fn fail(&mut self, status: JobStatus, failure: &ExecutionFailure, at: DateTime<Utc>) -> bool {
        let moved = self.advance(status, at);
        if moved {
            self.error = Some(failure.to_string());
        }
        moved
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::submission::{JobSubmission, Script};

    fn pending() -> JobResult {
        let job = Job::from_submission(
            JobSubmission::new("demo", "./code", Script::Inline("true".into()))
                .with_tag("nightly"),
            Duration::from_secs(5),
        );
        JobResult::pending(&job, PathBuf::from("/tmp/jobs").join(&job.id))
    }

    #[test]
    fn pending_record_copies_submission_fields() {
        let result = pending();
        assert_eq!(result.status, JobStatus::Pending);
        assert_eq!(result.name, "demo");
        assert_eq!(result.tags, vec!["nightly".to_string()]);
        assert!(result.workspace.ends_with(&result.job_id));
        assert!(result.duration().is_none());
    }

    #[test]
    fn terminal_status_sets_end_time_and_duration() {
        let mut result = pending();
        let start = Utc::now();
        assert!(result.advance(JobStatus::Running, start));
        let end = start + TimeDelta::milliseconds(1500);
        assert!(result.advance(JobStatus::Completed, end));

        assert_eq!(result.start_time, Some(start));
        assert_eq!(result.end_time, Some(end));
        assert_eq!(result.duration_ms, Some(1500));
        assert_eq!(result.duration(), Some(TimeDelta::milliseconds(1500)));
    }

    #[test]
    fn terminal_status_is_never_left() {
        let mut result = pending();
        let now = Utc::now();
        result.advance(JobStatus::Running, now);
        assert!(result.fail(JobStatus::Failed, &ExecutionFailure::NonZeroExit(2), now));
        assert!(!result.advance(JobStatus::Cancelled, now));
        assert!(!result.fail(JobStatus::Cancelled, &ExecutionFailure::Cancelled, now));
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("process exited with code 2"));
    }

    #[test]
    fn cancel_while_pending_gets_zero_duration() {
        let mut result = pending();
        let now = Utc::now();
        assert!(result.fail(JobStatus::Cancelled, &ExecutionFailure::Cancelled, now));
        assert_eq!(result.start_time, result.end_time);
        assert_eq!(result.duration_ms, Some(0));
    }

    #[test]
    fn failure_display() {
        assert_eq!(
            ExecutionFailure::Timeout(Duration::from_secs(2)).to_string(),
            "job timed out after 2 seconds"
        );
        assert_eq!(
            ExecutionFailure::Preparation("boom".into()).to_string(),
            "workspace preparation failed: boom"
        );
    }
}
