use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Binding that always points at the resolved code location.
pub const CODE_DIR_VAR: &str = "CODE_DIR";
/// Binding that always points at the workspace `outputs/` directory.
pub const OUTPUT_DIR_VAR: &str = "OUTPUT_DIR";
/// Names no declared input or extra variable may take.
pub const RESERVED_VARS: [&str; 2] = [CODE_DIR_VAR, OUTPUT_DIR_VAR];

/// Rejections raised while validating a submission, before any job state exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("invalid name {0:?}: must be a non-empty label without path separators")]
    InvalidName(String),

    #[error("invalid variable name {0:?}")]
    InvalidVariable(String),

    #[error("variable {0} is reserved and cannot be declared by a job")]
    ReservedVariable(String),

    #[error("variable {0} is declared more than once")]
    DuplicateVariable(String),
}

/// The script a job runs, tagged by the caller instead of guessed from its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Script {
    /// Literal script content.
    Inline(String),
    /// Path to a script file, relative paths also looked up in the code directory.
    File(PathBuf),
}

/// A caller's description of a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Caller-chosen identifier; one is generated when absent.
    #[serde(default)]
    pub job_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Code reference (local path or URL).
    pub code: String,
    pub script: Script,
    /// Variable name -> data reference. Names are uppercased when exported.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Extra variables exported as-is.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Where artifacts are published after the run.
    #[serde(default)]
    pub output_ref: Option<String>,
    /// Wall-clock limit; the engine default applies when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl JobSubmission {
    pub fn new(name: impl Into<String>, code: impl Into<String>, script: Script) -> Self {
        Self {
            job_id: None,
            name: name.into(),
            description: None,
            code: code.into(),
            script,
            inputs: BTreeMap::new(),
            env: BTreeMap::new(),
            output_ref: None,
            timeout_secs: None,
            tags: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), reference.into());
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_output(mut self, reference: impl Into<String>) -> Self {
        self.output_ref = Some(reference.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        // Round sub-second timeouts up so a limit is never silently dropped.
        self.timeout_secs = Some(timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check names and variable bindings without touching the filesystem.
    pub fn validate(&self) -> Result<(), SubmissionError> {
        check_label(&self.name)?;
        if let Some(id) = &self.job_id {
            check_label(id)?;
        }

        let mut seen = Vec::with_capacity(self.inputs.len() + self.env.len());
        let declared = self
            .inputs
            .keys()
            .map(|k| k.to_uppercase())
            .chain(self.env.keys().cloned());
        for name in declared {
            if !is_env_name(&name) {
                return Err(SubmissionError::InvalidVariable(name));
            }
            if RESERVED_VARS.contains(&name.as_str()) {
                return Err(SubmissionError::ReservedVariable(name));
            }
            if seen.contains(&name) {
                return Err(SubmissionError::DuplicateVariable(name));
            }
            seen.push(name);
        }
        Ok(())
    }
}

/// A submission that has been accepted by the engine and given its identity.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub submission: JobSubmission,
    pub timeout: Duration,
}

impl Job {
    /// Fix the identifier (generating one if absent) and the effective timeout.
    pub fn from_submission(mut submission: JobSubmission, default_timeout: Duration) -> Self {
        let id = submission
            .job_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let timeout = submission
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Self {
            id,
            submission,
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.submission.name
    }
}

/// A label is usable as a single directory name on every platform we run on.
pub fn check_label(label: &str) -> Result<(), SubmissionError> {
    let bad = label.trim().is_empty()
        || label == "."
        || label == ".."
        || label.contains(['/', '\\', '\0']);
    if bad {
        return Err(SubmissionError::InvalidName(label.to_string()));
    }
    Ok(())
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
