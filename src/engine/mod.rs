//! Job orchestration: workspace -> supervised process -> artifacts -> cleanup.
//!
//! [`JobEngine`] is an explicit service instance. It owns the job registry,
//! schedules work on a bounded pool of Tokio tasks and is torn down with
//! [`JobEngine::shutdown`], which kills in-flight children and waits for every
//! worker to record its result.

mod registry;

pub use registry::JobRegistry;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::job::{ExecutionFailure, Job, JobResult, JobStatus, JobSubmission, SubmissionError};
use crate::supervisor::{ExecRequest, ProcessSupervisor, Termination};
use crate::workspace::{ReferenceResolver, WorkspaceBuilder, WorkspaceError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job identifier {0} is already in use")]
    WorkspaceConflict(String),

    #[error("variable {0} is reserved and cannot be declared by a job")]
    ReservedVariable(String),

    #[error("invalid submission: {0}")]
    Invalid(SubmissionError),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("queue is full ({0} jobs pending)")]
    QueueFull(usize),

    #[error("worker for job {id} failed: {reason}")]
    Worker { id: String, reason: String },

    #[error("{0} jobs are still in flight")]
    Busy(usize),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<SubmissionError> for EngineError {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::ReservedVariable(name) => EngineError::ReservedVariable(name),
            other => EngineError::Invalid(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parent directory of every job workspace.
    pub job_dir: PathBuf,
    pub max_workers: usize,
    /// Delete each workspace once its result is recorded.
    pub cleanup: bool,
    /// Used when a submission does not declare its own timeout.
    pub default_timeout: Duration,
    pub grace_period: Duration,
    /// Reject submissions while this many jobs are waiting for a worker.
    pub max_pending: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_dir: PathBuf::from("./jobs"),
            max_workers: 4,
            cleanup: true,
            default_timeout: Duration::from_secs(300),
            grace_period: Duration::from_secs(5),
            max_pending: None,
        }
    }
}

/// Handle to a scheduled job.
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    task: JoinHandle<JobResult>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the job to reach a terminal status.
    pub async fn wait(self) -> Result<JobResult, EngineError> {
        let JobHandle { id, task } = self;
        task.await.map_err(|e| EngineError::Worker {
            id,
            reason: e.to_string(),
        })
    }
}

struct Inner<R> {
    config: EngineConfig,
    builder: WorkspaceBuilder<R>,
    supervisor: ProcessSupervisor,
    registry: JobRegistry,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Runs jobs in isolated workspaces on a bounded worker pool.
pub struct JobEngine<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for JobEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ReferenceResolver> JobEngine<R> {
    pub fn new(config: EngineConfig, resolver: R) -> Self {
        let workers = config.max_workers.max(1);
        let inner = Inner {
            builder: WorkspaceBuilder::new(config.job_dir.clone(), Arc::new(resolver)),
            supervisor: ProcessSupervisor::new(config.grace_period),
            registry: JobRegistry::new(),
            permits: Arc::new(Semaphore::new(workers)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a job as `Pending` and schedule it. Returns immediately.
    ///
    /// Configuration-level problems (invalid or reserved variable names,
    /// a duplicate identifier, an existing workspace) are raised here before
    /// any job state is created. Everything that goes wrong later is
    /// recorded on the job's [`JobResult`]. Must be called from within a
    /// Tokio runtime.
    pub fn submit(&self, submission: JobSubmission) -> Result<JobHandle, EngineError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        submission.validate()?;
        let job = Job::from_submission(submission, inner.config.default_timeout);

        if let Some(limit) = inner.config.max_pending {
            if inner.registry.count(JobStatus::Pending) >= limit {
                return Err(EngineError::QueueFull(limit));
            }
        }
        let workspace = inner.builder.workspace_dir(&job.id);
        if workspace.exists() || !inner.registry.register(JobResult::pending(&job, workspace)) {
            return Err(EngineError::WorkspaceConflict(job.id));
        }
        info!(job_id = %job.id, name = %job.name(), timeout = ?job.timeout, "job submitted");

        let id = job.id.clone();
        let task = inner.tracker.spawn(execute(Arc::clone(inner), job));
        Ok(JobHandle { id, task })
    }

    /// Submit and wait for the terminal result.
    pub async fn run(&self, submission: JobSubmission) -> Result<JobResult, EngineError> {
        self.submit(submission)?.wait().await
    }

    /// Submit every job up front, then collect results in input order.
    pub async fn submit_batch(
        &self,
        submissions: Vec<JobSubmission>,
    ) -> Vec<Result<JobResult, EngineError>> {
        let handles: Vec<_> = submissions
            .into_iter()
            .map(|submission| self.submit(submission))
            .collect();
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle {
                Ok(handle) => handle.wait().await,
                Err(err) => Err(err),
            });
        }
        results
    }

    /// Cancel a running job. Returns `false` if no process is running for `id`.
    ///
    /// Once this returns `true` the job is recorded as `Cancelled`, even if
    /// the process happened to exit on its own before the signal reached it.
    pub fn cancel(&self, id: &str) -> bool {
        let signalled = self.inner.registry.cancel(id);
        if signalled {
            info!(job_id = %id, "cancel requested");
        }
        signalled
    }

    pub fn status(&self, id: &str) -> Option<JobResult> {
        self.inner.registry.get(id)
    }

    pub fn jobs(&self) -> Vec<JobResult> {
        self.inner.registry.all()
    }

    /// Remove every workspace under the job directory.
    pub fn purge_workspaces(&self) -> Result<(), EngineError> {
        let busy = self.inner.registry.in_flight();
        if busy > 0 {
            return Err(EngineError::Busy(busy));
        }
        let root = self.inner.builder.root();
        match fs::remove_dir_all(root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(EngineError::Io {
                    path: root.to_path_buf(),
                    source,
                });
            }
        }
        fs::create_dir_all(root).map_err(|source| EngineError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        info!(root = %root.display(), "purged job workspaces");
        Ok(())
    }

    /// Stop accepting jobs, cancel queued and running ones, and wait for
    /// every worker to record its result.
    pub async fn shutdown(&self) {
        info!(in_flight = self.inner.registry.in_flight(), "shutting down job engine");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("job engine stopped");
    }
}

impl<R: ReferenceResolver> Inner<R> {
    /// Apply the final update and return the recorded snapshot.
    fn finish(&self, job: &Job, apply: impl FnOnce(&mut JobResult)) -> JobResult {
        self.registry.update(&job.id, apply);
        self.registry
            .get(&job.id)
            .unwrap_or_else(|| JobResult::pending(job, self.builder.workspace_dir(&job.id)))
    }

    async fn discard(&self, workspace: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(workspace = %workspace.display(), error = %e, "failed to remove workspace");
            }
        }
    }

    /// Copy artifacts into the output location, keeping their relative layout.
    async fn publish(
        &self,
        reference: &str,
        outputs_dir: &Path,
        artifacts: &[PathBuf],
    ) -> Result<Vec<PathBuf>, String> {
        let target = self
            .builder
            .resolver()
            .resolve_output(reference)
            .await
            .map_err(|e| e.to_string())?;

        let mut published = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let relative = artifact
                .strip_prefix(outputs_dir)
                .map_err(|e| format!("{}: {e}", artifact.display()))?;
            let dest = target.join(relative);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("{}: {e}", parent.display()))?;
            }
            tokio::fs::copy(artifact, &dest)
                .await
                .map_err(|e| format!("{}: {e}", dest.display()))?;
            published.push(dest);
        }
        info!(target = %target.display(), count = published.len(), "published artifacts");
        Ok(published)
    }
}

async fn execute<R: ReferenceResolver>(inner: Arc<Inner<R>>, job: Job) -> JobResult {
    let permit = tokio::select! {
        biased;
        _ = inner.shutdown.cancelled() => None,
        permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        info!(job_id = %job.id, "job cancelled before it started");
        return inner.finish(&job, |r| {
            r.fail(JobStatus::Cancelled, &ExecutionFailure::Cancelled, Utc::now());
        });
    };

    let started = Utc::now();
    inner.registry.update(&job.id, |r| r.start_time = Some(started));

    let workspace = match inner.builder.build(&job).await {
        Ok(workspace) => workspace,
        Err(err) => {
            error!(job_id = %job.id, error = %err, "workspace preparation failed");
            if inner.config.cleanup && !matches!(err, WorkspaceError::AlreadyExists(_)) {
                inner.discard(&inner.builder.workspace_dir(&job.id)).await;
            }
            let failure = ExecutionFailure::Preparation(err.to_string());
            return inner.finish(&job, |r| {
                r.fail(JobStatus::Failed, &failure, Utc::now());
            });
        }
    };

    let cancel = inner.shutdown.child_token();
    inner.registry.mark_running(&job.id, cancel.clone());

    let (program, args) = workspace.script.command_line();
    let request = ExecRequest {
        program,
        args,
        working_dir: workspace.root.clone(),
        env: workspace.environment.clone(),
        timeout: job.timeout,
    };
    let outcome = inner
        .supervisor
        .execute(&job.id, &request, cancel.clone())
        .await;
    inner.registry.release(&job.id);
    let cancelled = cancel.is_cancelled();

    let mut artifacts = match collect_artifacts(&workspace.outputs_dir) {
        Ok(found) => found,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "failed to collect artifacts");
            Vec::new()
        }
    };
    let mut publish_failure = None;
    if let Some(reference) = &job.submission.output_ref {
        match inner.publish(reference, &workspace.outputs_dir, &artifacts).await {
            Ok(published) => artifacts = published,
            Err(msg) => {
                warn!(job_id = %job.id, reference = %reference, error = %msg, "failed to publish artifacts");
                publish_failure = Some(msg);
            }
        }
    }

    let result = inner.finish(&job, |r| {
        let now = Utc::now();
        r.artifacts = artifacts;
        let output = match outcome {
            Ok(output) => output,
            Err(err) => {
                r.fail(JobStatus::Failed, &ExecutionFailure::Launch(err.to_string()), now);
                return;
            }
        };
        let (status, failure) = outcome_status(
            output.termination,
            output.exit_code,
            cancelled,
            publish_failure,
            job.timeout,
        );
        r.stdout = output.stdout;
        r.stderr = output.stderr;
        r.exit_code = output.exit_code;
        match failure {
            None => r.advance(status, now),
            Some(failure) => r.fail(status, &failure, now),
        };
    });

    info!(
        job_id = %job.id,
        status = %result.status,
        exit_code = ?result.exit_code,
        duration_ms = ?result.duration_ms,
        artifacts = result.artifacts.len(),
        "job finished"
    );

    // Only after the result is recorded.
    if inner.config.cleanup {
        inner.discard(&workspace.root).await;
        debug!(job_id = %job.id, "workspace removed");
    }
    result
}

/// Map how the process ended onto the recorded status.
///
/// A fired cancel token wins over a normal exit: the caller was already told
/// the job is being cancelled.
fn outcome_status(
    termination: Termination,
    exit_code: Option<i32>,
    cancelled: bool,
    publish_failure: Option<String>,
    timeout: Duration,
) -> (JobStatus, Option<ExecutionFailure>) {
    match (termination, exit_code) {
        (Termination::Exited, _) if cancelled => {
            (JobStatus::Cancelled, Some(ExecutionFailure::Cancelled))
        }
        (Termination::Cancelled, _) => (JobStatus::Cancelled, Some(ExecutionFailure::Cancelled)),
        (Termination::Exited, Some(0)) => match publish_failure {
            None => (JobStatus::Completed, None),
            Some(msg) => (JobStatus::Failed, Some(ExecutionFailure::Publish(msg))),
        },
        (Termination::Exited, Some(code)) => {
            (JobStatus::Failed, Some(ExecutionFailure::NonZeroExit(code)))
        }
        (Termination::Exited, None) => (JobStatus::Failed, Some(ExecutionFailure::Signalled)),
        (Termination::TimedOut, _) => (JobStatus::Failed, Some(ExecutionFailure::Timeout(timeout))),
    }
}

/// Every regular file under `dir`, recursively, in sorted order.
fn collect_artifacts(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Script, TIMEOUT_EXIT_CODE};
    use crate::workspace::{RECORD_FILE, StandardResolver, WorkspaceRecord};
    use std::time::Instant;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        tmp: TempDir,
        code: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempdir().unwrap();
            let code = tmp.path().join("code");
            fs::create_dir_all(&code).unwrap();
            fs::write(code.join("data.txt"), "payload\n").unwrap();
            Self { tmp, code }
        }

        fn config(&self) -> EngineConfig {
            EngineConfig {
                job_dir: self.tmp.path().join("jobs"),
                max_workers: 4,
                cleanup: false,
                default_timeout: Duration::from_secs(30),
                grace_period: Duration::from_millis(500),
                max_pending: None,
            }
        }

        fn engine(&self) -> JobEngine<StandardResolver> {
            self.engine_with(self.config())
        }

        fn engine_with(&self, config: EngineConfig) -> JobEngine<StandardResolver> {
            JobEngine::new(config, StandardResolver::new().unwrap())
        }

        fn job(&self, name: &str, script: &str) -> JobSubmission {
            JobSubmission::new(name, self.code.to_str().unwrap(), Script::Inline(script.into()))
        }
    }

    async fn wait_for_status(engine: &JobEngine<StandardResolver>, id: &str, status: JobStatus) {
        for _ in 0..100 {
            if engine.status(id).map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {id} never reached {status}");
    }

    #[tokio::test]
    async fn successful_job_completes_with_artifacts() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let result = engine
            .run(fx.job("ok", "cp \"$CODE_DIR/data.txt\" \"$OUTPUT_DIR/copy.txt\"\necho done"))
            .await
            .unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.error.is_none());
        assert!(result.stdout.contains("[JOB] Starting job: ok"));
        assert!(result.stdout.ends_with("done\n"));
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(fs::read_to_string(&result.artifacts[0]).unwrap(), "payload\n");
        assert!(result.duration_ms.unwrap() >= 0);
        assert!(result.end_time >= result.start_time);
    }

    #[tokio::test]
    async fn failed_job_keeps_output_and_artifacts() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let script = "mkdir -p \"$OUTPUT_DIR/nested\"\n\
                      echo a > \"$OUTPUT_DIR/a.txt\"\n\
                      echo b > \"$OUTPUT_DIR/b.txt\"\n\
                      echo c > \"$OUTPUT_DIR/nested/c.txt\"\n\
                      echo broken >&2\n\
                      exit 4";
        let result = engine.run(fx.job("fails", script)).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.exit_code, Some(4));
        assert_eq!(result.stderr, "broken\n");
        assert_eq!(result.error.as_deref(), Some("process exited with code 4"));
        assert_eq!(result.artifacts.len(), 3);
        for artifact in &result.artifacts {
            assert!(fs::read_to_string(artifact).is_ok());
        }
    }

    #[tokio::test]
    async fn timeout_marks_failed_with_sentinel() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let begun = Instant::now();
        let result = engine
            .run(fx.job("slow", "echo partial\nsleep 30").with_timeout(Duration::from_secs(2)))
            .await
            .unwrap();
        let elapsed = begun.elapsed();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.exit_code, Some(TIMEOUT_EXIT_CODE));
        assert_eq!(result.error.as_deref(), Some("job timed out after 2 seconds"));
        assert!(result.stdout.contains("partial"));
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(2) + engine.config().grace_period, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn cancel_running_job() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let handle = engine.submit(fx.job("cancel-me", "sleep 30")).unwrap();
        let id = handle.id().to_string();

        wait_for_status(&engine, &id, JobStatus::Running).await;
        assert!(engine.cancel(&id));
        let result = handle.wait().await.unwrap();

        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(result.error.as_deref(), Some("job was cancelled"));
        assert!(!engine.cancel(&id), "terminal job cannot be cancelled");
        assert!(!engine.cancel("unknown"));
    }

    #[tokio::test]
    async fn batch_results_follow_submission_order() {
        let fx = Fixture::new();
        let engine = fx.engine_with(EngineConfig {
            max_workers: 5,
            ..fx.config()
        });
        let submissions = (1..=5)
            .map(|i| {
                let delay = 0.2 * f64::from(5 - i);
                fx.job(&format!("batch-{i}"), &format!("sleep {delay}\necho job-{i}"))
                    .with_id(format!("b{i}"))
            })
            .collect();

        let results = engine.submit_batch(submissions).await;
        assert_eq!(results.len(), 5);
        for (i, result) in results.iter().enumerate() {
            let result = result.as_ref().unwrap();
            assert_eq!(result.job_id, format!("b{}", i + 1));
            assert!(result.stdout.contains(&format!("job-{}", i + 1)));
        }
        let first = results[0].as_ref().unwrap();
        let last = results[4].as_ref().unwrap();
        assert!(last.end_time < first.end_time);
    }

    #[tokio::test]
    async fn duplicate_identifier_is_rejected_synchronously() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let first = engine.submit(fx.job("one", "true").with_id("same")).unwrap();
        let err = engine.submit(fx.job("two", "true").with_id("same")).unwrap_err();
        assert!(matches!(err, EngineError::WorkspaceConflict(ref id) if id == "same"));
        first.wait().await.unwrap();

        // Preserved workspace on disk also blocks reuse.
        let err = engine.submit(fx.job("three", "true").with_id("same")).unwrap_err();
        assert!(matches!(err, EngineError::WorkspaceConflict(_)));
    }

    #[tokio::test]
    async fn reserved_variable_is_rejected_before_any_state() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let submission = fx
            .job("reserved", "true")
            .with_id("r1")
            .with_input("code_dir", "/tmp");
        let err = engine.submit(submission).unwrap_err();

        assert!(matches!(err, EngineError::ReservedVariable(ref v) if v == "CODE_DIR"));
        assert!(engine.status("r1").is_none());
        assert!(!fx.config().job_dir.join("r1").exists());
    }

    #[tokio::test]
    async fn preparation_failure_is_recorded_without_spawning() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let submission = fx
            .job("bad-input", "echo never")
            .with_input("data", fx.tmp.path().join("missing.csv").to_str().unwrap());
        let result = engine.run(submission).await.unwrap();

        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.exit_code, None);
        assert!(result.stdout.is_empty());
        assert!(result.error.unwrap().starts_with("workspace preparation failed"));
        assert!(result.end_time.is_some());
    }

    #[tokio::test]
    async fn cleanup_removes_workspace_after_publishing() {
        let fx = Fixture::new();
        let engine = fx.engine_with(EngineConfig {
            cleanup: true,
            ..fx.config()
        });
        let published = fx.tmp.path().join("published");
        let submission = fx
            .job("publish", "mkdir -p \"$OUTPUT_DIR/deep\"\necho hi > \"$OUTPUT_DIR/deep/hi.txt\"")
            .with_output(published.to_str().unwrap());
        let result = engine.run(submission).await.unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert!(!result.workspace.exists());
        assert_eq!(result.artifacts, vec![published.join("deep/hi.txt")]);
        assert_eq!(fs::read_to_string(&result.artifacts[0]).unwrap(), "hi\n");
    }

    #[tokio::test]
    async fn record_matches_environment_seen_by_script() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let data = fx.code.join("data.txt");
        let submission = fx
            .job("env", "echo \"TRAIN=$TRAIN\"\necho \"SEED=$SEED\"")
            .with_input("train", data.to_str().unwrap())
            .with_env("SEED", "42");
        let result = engine.run(submission).await.unwrap();

        let record = WorkspaceRecord::load(&result.workspace).unwrap();
        assert!(result.workspace.join(RECORD_FILE).is_file());
        assert_eq!(record.job.inputs["TRAIN"], data);
        let train_line = format!("TRAIN={}", record.job.environment["TRAIN"]);
        assert!(result.stdout.contains(&train_line));
        assert!(result.stdout.contains("SEED=42"));
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_and_running_jobs() {
        let fx = Fixture::new();
        let engine = fx.engine_with(EngineConfig {
            max_workers: 1,
            ..fx.config()
        });
        let running = engine.submit(fx.job("running", "sleep 30")).unwrap();
        let queued = engine.submit(fx.job("queued", "echo never")).unwrap();
        wait_for_status(&engine, running.id(), JobStatus::Running).await;

        engine.shutdown().await;
        let running = running.wait().await.unwrap();
        let queued = queued.wait().await.unwrap();

        assert_eq!(running.status, JobStatus::Cancelled);
        assert_eq!(queued.status, JobStatus::Cancelled);
        assert_eq!(queued.duration_ms, Some(0));
        assert!(matches!(
            engine.submit(fx.job("late", "true")),
            Err(EngineError::ShuttingDown)
        ));
    }

    #[test]
    fn fired_cancel_token_outranks_a_normal_exit() {
        let timeout = Duration::from_secs(5);
        assert_eq!(
            outcome_status(Termination::Exited, Some(0), true, None, timeout),
            (JobStatus::Cancelled, Some(ExecutionFailure::Cancelled))
        );
        assert_eq!(
            outcome_status(Termination::Exited, Some(3), true, None, timeout),
            (JobStatus::Cancelled, Some(ExecutionFailure::Cancelled))
        );
        assert_eq!(
            outcome_status(Termination::Exited, Some(0), false, None, timeout),
            (JobStatus::Completed, None)
        );
        assert_eq!(
            outcome_status(Termination::Exited, Some(0), false, Some("disk full".into()), timeout),
            (JobStatus::Failed, Some(ExecutionFailure::Publish("disk full".into())))
        );
        assert_eq!(
            outcome_status(Termination::Exited, None, false, None, timeout),
            (JobStatus::Failed, Some(ExecutionFailure::Signalled))
        );
        // The deadline fired first; a late cancel does not rewrite it.
        assert_eq!(
            outcome_status(Termination::TimedOut, Some(-1), true, None, timeout),
            (JobStatus::Failed, Some(ExecutionFailure::Timeout(timeout)))
        );
    }

    #[tokio::test]
    async fn cleanup_without_output_reference_lists_removed_artifacts() {
        let fx = Fixture::new();
        let engine = fx.engine_with(EngineConfig {
            cleanup: true,
            ..fx.config()
        });
        let result = engine
            .run(fx.job("ephemeral", "echo hi > \"$OUTPUT_DIR/hi.txt\""))
            .await
            .unwrap();

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.artifacts, vec![result.workspace.join("outputs/hi.txt")]);
        assert!(!result.workspace.exists());
        assert!(!result.artifacts[0].exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_submits_with_one_identifier_admit_exactly_one() {
        use std::sync::Barrier;

        let fx = Fixture::new();
        let engine = fx.engine();
        let runtime = tokio::runtime::Handle::current();
        let barrier = Barrier::new(8);
        let outcomes: Vec<Result<JobHandle, EngineError>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let (engine, runtime, barrier) = (&engine, &runtime, &barrier);
                    let submission = fx.job(&format!("racer-{i}"), "true").with_id("contested");
                    scope.spawn(move || {
                        let _guard = runtime.enter();
                        barrier.wait();
                        engine.submit(submission)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let mut admitted = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(handle) => admitted.push(handle),
                Err(err) => assert!(matches!(err, EngineError::WorkspaceConflict(ref id) if id == "contested")),
            }
        }
        assert_eq!(admitted.len(), 1);
        let result = admitted.pop().unwrap().wait().await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(engine.jobs().len(), 1);
    }

    #[tokio::test]
    async fn purge_is_refused_while_jobs_run() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let handle = engine.submit(fx.job("busy", "sleep 30")).unwrap();
        wait_for_status(&engine, handle.id(), JobStatus::Running).await;
        assert!(matches!(engine.purge_workspaces(), Err(EngineError::Busy(1))));

        engine.cancel(handle.id());
        let result = handle.wait().await.unwrap();
        engine.purge_workspaces().unwrap();
        assert!(!result.workspace.exists());
        assert!(fx.config().job_dir.is_dir());
    }

    #[tokio::test]
    async fn queue_limit_rejects_excess_submissions() {
        let fx = Fixture::new();
        let engine = fx.engine_with(EngineConfig {
            max_workers: 1,
            max_pending: Some(1),
            ..fx.config()
        });
        let running = engine.submit(fx.job("a", "sleep 30")).unwrap();
        wait_for_status(&engine, running.id(), JobStatus::Running).await;
        let _queued = engine.submit(fx.job("b", "true")).unwrap();
        assert!(matches!(
            engine.submit(fx.job("c", "true")),
            Err(EngineError::QueueFull(1))
        ));
        engine.shutdown().await;
    }
}
