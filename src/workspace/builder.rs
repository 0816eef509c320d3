use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use super::record::{JobSection, RecordError, WorkspaceRecord};
use super::resolver::{ReferenceResolver, ResolveError};
use super::script::{MaterializedScript, ScriptError, ScriptMaterializer};
use crate::job::{CODE_DIR_VAR, Job, OUTPUT_DIR_VAR, SubmissionError};

pub const INPUTS_DIR: &str = "inputs";
pub const OUTPUTS_DIR: &str = "outputs";
/// Fetched code lands here, away from the record, script and stage directories.
const CODE_FETCH_DIR: &str = "code";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("variable {0} is reserved and cannot be declared by a job")]
    ReservedVariable(String),

    #[error("invalid submission: {0}")]
    Invalid(SubmissionError),

    #[error("failed to resolve code reference {reference:?}: {source}")]
    CodeResolution {
        reference: String,
        #[source]
        source: ResolveError,
    },

    #[error("code directory not found: {0}")]
    CodeNotFound(PathBuf),

    #[error("failed to resolve input {name}: {source}")]
    InputResolution {
        name: String,
        #[source]
        source: ResolveError,
    },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<SubmissionError> for WorkspaceError {
    fn from(err: SubmissionError) -> Self {
        match err {
            SubmissionError::ReservedVariable(name) => WorkspaceError::ReservedVariable(name),
            other => WorkspaceError::Invalid(other),
        }
    }
}

fn io_err(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A prepared job workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub inputs_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub record_path: PathBuf,
    pub code_path: PathBuf,
    /// Uppercased variable name -> resolved path.
    pub inputs: BTreeMap<String, PathBuf>,
    /// Full set of injected variables.
    pub environment: BTreeMap<String, String>,
    pub script: MaterializedScript,
}

/// Creates `{root}/{job id}/` with `inputs/`, `outputs/`, `config.toml` and `run.sh`.
pub struct WorkspaceBuilder<R> {
    root: PathBuf,
    resolver: Arc<R>,
}

impl<R: ReferenceResolver> WorkspaceBuilder<R> {
    pub fn new(root: impl Into<PathBuf>, resolver: Arc<R>) -> Self {
        Self {
            root: root.into(),
            resolver,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Directory a job's workspace lives in. Its name is the job identifier.
    pub fn workspace_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    /// Prepare the workspace for `job`.
    ///
    /// Workspaces are write-once: if the directory already exists this fails
    /// with [`WorkspaceError::AlreadyExists`] without touching it. Variable
    /// validation runs before anything is created on disk. The config record
    /// is written before the script is generated.
    pub async fn build(&self, job: &Job) -> Result<Workspace, WorkspaceError> {
        let submission = &job.submission;
        submission.validate()?;

        fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
        let root = self.workspace_dir(&job.id);
        match fs::create_dir(&root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists(root));
            }
            Err(e) => return Err(io_err(&root, e)),
        }
        info!(job_id = %job.id, workspace = %root.display(), "creating workspace");

        let code_path = self
            .resolver
            .resolve(&submission.code, &root.join(CODE_FETCH_DIR))
            .await
            .map_err(|source| WorkspaceError::CodeResolution {
                reference: submission.code.clone(),
                source,
            })?;
        if !code_path.exists() {
            return Err(WorkspaceError::CodeNotFound(code_path));
        }

        let inputs_dir = root.join(INPUTS_DIR);
        fs::create_dir(&inputs_dir).map_err(|e| io_err(&inputs_dir, e))?;
        let mut inputs = BTreeMap::new();
        for (name, reference) in &submission.inputs {
            debug!(job_id = %job.id, input = %name, reference = %reference, "resolving input");
            // One directory per variable so equal file names never collide.
            let path = self
                .resolver
                .resolve(reference, &inputs_dir.join(name.to_uppercase()))
                .await
                .map_err(|source| WorkspaceError::InputResolution {
                    name: name.clone(),
                    source,
                })?;
            inputs.insert(name.to_uppercase(), path);
        }

        let outputs_dir = root.join(OUTPUTS_DIR);
        fs::create_dir(&outputs_dir).map_err(|e| io_err(&outputs_dir, e))?;

        let mut environment = BTreeMap::new();
        environment.insert(CODE_DIR_VAR.to_string(), code_path.display().to_string());
        environment.insert(OUTPUT_DIR_VAR.to_string(), outputs_dir.display().to_string());
        for (name, path) in &inputs {
            environment.insert(name.clone(), path.display().to_string());
        }
        for (name, value) in &submission.env {
            environment.insert(name.clone(), value.clone());
        }

        let record = WorkspaceRecord {
            job: JobSection {
                id: job.id.clone(),
                name: submission.name.clone(),
                description: submission.description.clone(),
                code: code_path.clone(),
                output_dir: outputs_dir.clone(),
                declared_inputs: submission.inputs.clone(),
                inputs: inputs.clone(),
                environment: environment.clone(),
            },
        };
        let record_path = record.write(&root)?;

        let script = ScriptMaterializer::new(&submission.name, inputs.keys().cloned())
            .materialize(&submission.script, &code_path, &root)?;

        info!(
            job_id = %job.id,
            code = %code_path.display(),
            variables = ?environment.keys().collect::<Vec<_>>(),
            "workspace prepared"
        );

        Ok(Workspace {
            root,
            inputs_dir,
            outputs_dir,
            record_path,
            code_path,
            inputs,
            environment,
            script,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSubmission, Script};
    use crate::workspace::RECORD_FILE;
    use crate::workspace::script::SCRIPT_FILE;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    /// Resolves `mem://.../name` by writing a stub file `name` under the
    /// destination, like a download would. Everything else is local.
    struct FakeResolver;

    impl ReferenceResolver for FakeResolver {
        async fn resolve(&self, reference: &str, destination: &Path) -> Result<PathBuf, ResolveError> {
            if let Some(rest) = reference.strip_prefix("mem://") {
                let name = rest.rsplit('/').next().unwrap_or(rest);
                fs::create_dir_all(destination).unwrap();
                let path = destination.join(name);
                fs::write(&path, format!("stub for {reference}\n")).unwrap();
                return Ok(path);
            }
            if reference.contains("://") {
                return Err(ResolveError::UnsupportedScheme(reference.to_string()));
            }
            Ok(PathBuf::from(reference))
        }
    }

    fn setup() -> (TempDir, PathBuf, WorkspaceBuilder<FakeResolver>) {
        let tmp = tempdir().unwrap();
        let code = tmp.path().join("code");
        fs::create_dir_all(&code).unwrap();
        fs::write(code.join("main.sh"), "echo from code\n").unwrap();
        let builder = WorkspaceBuilder::new(tmp.path().join("jobs"), Arc::new(FakeResolver));
        (tmp, code, builder)
    }

    fn job(code: &Path, id: &str) -> Job {
        Job::from_submission(
            JobSubmission::new("etl", code.to_str().unwrap(), Script::File("main.sh".into()))
                .with_id(id)
                .with_input("train", "mem://train.csv")
                .with_env("SEED", "7"),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn build_creates_layout_and_bindings() {
        let (_tmp, code, builder) = setup();
        let ws = builder.build(&job(&code, "j1")).await.unwrap();

        assert_eq!(ws.root, builder.root().join("j1"));
        assert!(ws.inputs_dir.is_dir());
        assert!(ws.outputs_dir.is_dir());
        assert!(ws.record_path.is_file());
        assert_eq!(ws.script.path, ws.root.join(SCRIPT_FILE));

        let train = &ws.inputs["TRAIN"];
        assert!(train.starts_with(&ws.inputs_dir));
        assert_eq!(ws.environment["TRAIN"], train.display().to_string());
        assert_eq!(ws.environment[CODE_DIR_VAR], code.display().to_string());
        assert_eq!(ws.environment[OUTPUT_DIR_VAR], ws.outputs_dir.display().to_string());
        assert_eq!(ws.environment["SEED"], "7");

        let script = fs::read_to_string(&ws.script.path).unwrap();
        assert!(script.contains("echo from code"));
    }

    #[tokio::test]
    async fn fetched_inputs_with_the_same_file_name_stay_separate() {
        let (_tmp, code, builder) = setup();
        let job = Job::from_submission(
            JobSubmission::new("split", code.to_str().unwrap(), Script::Inline("true".into()))
                .with_id("same-name")
                .with_input("train", "mem://a/data.csv")
                .with_input("test", "mem://b/data.csv"),
            Duration::from_secs(30),
        );
        let ws = builder.build(&job).await.unwrap();

        let train = &ws.inputs["TRAIN"];
        let test = &ws.inputs["TEST"];
        assert_ne!(train, test);
        assert!(train.starts_with(&ws.inputs_dir) && test.starts_with(&ws.inputs_dir));
        assert_eq!(fs::read_to_string(train).unwrap(), "stub for mem://a/data.csv\n");
        assert_eq!(fs::read_to_string(test).unwrap(), "stub for mem://b/data.csv\n");
    }

    #[tokio::test]
    async fn fetched_code_cannot_shadow_workspace_files() {
        let (_tmp, _code, builder) = setup();
        let code_ref = format!("mem://bundle/{RECORD_FILE}");
        let job = Job::from_submission(
            JobSubmission::new("shadow", &code_ref, Script::Inline("echo ok".into()))
                .with_id("shadow")
                .with_input("extra", "mem://x/outputs"),
            Duration::from_secs(30),
        );
        let ws = builder.build(&job).await.unwrap();

        assert_ne!(ws.code_path, ws.record_path);
        assert!(ws.code_path.starts_with(ws.root.join(CODE_FETCH_DIR)));
        assert!(ws.outputs_dir.is_dir());
        assert_eq!(WorkspaceRecord::load(&ws.root).unwrap().job.code, ws.code_path);
        assert!(fs::read_to_string(&ws.script.path).unwrap().contains("echo ok"));
    }

    #[tokio::test]
    async fn record_reload_matches_execution_bindings() {
        let (_tmp, code, builder) = setup();
        let ws = builder.build(&job(&code, "j2")).await.unwrap();

        let record = WorkspaceRecord::load(&ws.root).unwrap();
        assert_eq!(record.job.inputs, ws.inputs);
        assert_eq!(record.job.environment, ws.environment);
        assert_eq!(record.job.declared_inputs["train"], "mem://train.csv");
    }

    #[tokio::test]
    async fn second_build_for_same_id_conflicts() {
        let (_tmp, code, builder) = setup();
        builder.build(&job(&code, "dup")).await.unwrap();
        let err = builder.build(&job(&code, "dup")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn concurrent_builds_for_same_id_succeed_exactly_once() {
        let (_tmp, code, builder) = setup();
        let a = job(&code, "race");
        let b = job(&code, "race");
        let (ra, rb) = tokio::join!(builder.build(&a), builder.build(&b));
        let outcomes = [ra, rb];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(WorkspaceError::AlreadyExists(_)))));
    }

    #[tokio::test]
    async fn reserved_collision_fails_before_touching_disk() {
        let (_tmp, code, builder) = setup();
        let mut job = job(&code, "reserved");
        job.submission.inputs.insert("output_dir".into(), "mem://x".into());

        let err = builder.build(&job).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::ReservedVariable(ref v) if v == OUTPUT_DIR_VAR));
        assert!(!builder.workspace_dir("reserved").exists());
    }

    #[tokio::test]
    async fn missing_code_is_a_code_resolution_error() {
        let (tmp, _code, builder) = setup();
        let missing = tmp.path().join("no-such-code");
        let err = builder.build(&job(&missing, "nocode")).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::CodeNotFound(_)));

        let mut remote = job(&missing, "badscheme");
        remote.submission.code = "ftp://host/code".into();
        let err = builder.build(&remote).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::CodeResolution { .. }));
    }

    #[tokio::test]
    async fn unresolvable_input_names_the_variable() {
        let (_tmp, code, builder) = setup();
        let mut job = job(&code, "badinput");
        job.submission.inputs.insert("test".into(), "ftp://x/test.csv".into());
        let err = builder.build(&job).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::InputResolution { ref name, .. } if name == "test"));
        // The record is never written for a half-prepared workspace.
        assert!(!builder.workspace_dir("badinput").join("config.toml").exists());
    }
}
