use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name of the workspace config record.
pub const RECORD_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to parse record {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Self-describing snapshot of a prepared workspace, written before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub job: JobSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSection {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Resolved code location.
    pub code: PathBuf,
    pub output_dir: PathBuf,
    /// References as the caller declared them.
    #[serde(default)]
    pub declared_inputs: BTreeMap<String, String>,
    /// Uppercased variable name -> resolved local path.
    #[serde(default)]
    pub inputs: BTreeMap<String, PathBuf>,
    /// Every variable injected into the job's environment.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl WorkspaceRecord {
    pub fn write(&self, workspace: &Path) -> Result<PathBuf, RecordError> {
        let path = workspace.join(RECORD_FILE);
        let body = toml::to_string_pretty(self)?;
        fs::write(&path, body).map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn load(workspace: &Path) -> Result<Self, RecordError> {
        let path = workspace.join(RECORD_FILE);
        let raw = fs::read_to_string(&path).map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| RecordError::Parse { path, source })
    }
}
