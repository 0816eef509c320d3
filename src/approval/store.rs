use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::stage::Stage;
use crate::job::check_label;
use crate::workspace::{OUTPUTS_DIR, RECORD_FILE, SCRIPT_FILE};

/// Directory under each participant that holds the stage directories.
pub const JOBS_DIR: &str = "job";
const STAGING_DIR: &str = ".staging";

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("job {name} already exists in {stage} for {participant}")]
    AlreadyExists {
        participant: String,
        name: String,
        stage: Stage,
    },

    #[error("cannot {action} job {name}: it is in {stage}")]
    InvalidState {
        name: String,
        stage: Stage,
        action: &'static str,
    },

    #[error("job {name} not found for {participant}")]
    NotFound { participant: String, name: String },

    #[error("participant directory does not exist: {0}")]
    UnknownParticipant(PathBuf),

    #[error("result file not found: {0}")]
    ResultNotFound(PathBuf),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize job record: {0}")]
    Serialize(#[from] toml::ser::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> ApprovalError {
    ApprovalError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Per-entry record stored next to the script. The stage is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default = "unknown_submitter")]
    pub submitted_by: String,
}

fn unknown_submitter() -> String {
    "unknown".to_string()
}

/// A job directory found in one of a participant's stage directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalEntry {
    pub name: String,
    pub participant: String,
    pub submitted_by: String,
    pub stage: Stage,
    pub location: PathBuf,
}

/// Filesystem-backed approval workflow.
///
/// Layout: `{root}/{participant}/job/{inbox|approved|done}/{name}/`. Every
/// transition is a single `rename` between stage directories of the same
/// participant, so the root must live on one filesystem.
#[derive(Debug, Clone)]
pub struct ApprovalStore {
    root: PathBuf,
    identity: String,
}

impl ApprovalStore {
    /// `identity` is recorded as the submitter of every job this store deposits.
    pub fn new(root: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            identity: identity.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn participant_dir(&self, participant: &str) -> PathBuf {
        self.root.join(participant)
    }

    pub fn stage_dir(&self, participant: &str, stage: Stage) -> PathBuf {
        self.participant_dir(participant)
            .join(JOBS_DIR)
            .join(stage.dir_name())
    }

    /// Create the three stage directories. Idempotent.
    pub fn ensure_stages(&self, participant: &str) -> Result<(), ApprovalError> {
        check_name(participant)?;
        for stage in Stage::ALL {
            let dir = self.stage_dir(participant, stage);
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(())
    }

    /// Register a participant: creates its directory and stage layout.
    pub fn ensure_participant(&self, participant: &str) -> Result<PathBuf, ApprovalError> {
        self.ensure_stages(participant)?;
        Ok(self.participant_dir(participant))
    }

    /// Deposit a new job in `participant`'s inbox.
    ///
    /// The directory is assembled in a staging area and renamed into the
    /// inbox, so readers never observe a job without its script and record.
    pub fn submit(
        &self,
        participant: &str,
        job_name: &str,
        script: &str,
    ) -> Result<PathBuf, ApprovalError> {
        check_name(participant)?;
        check_name(job_name)?;
        let participant_dir = self.participant_dir(participant);
        if !participant_dir.is_dir() {
            return Err(ApprovalError::UnknownParticipant(participant_dir));
        }
        self.ensure_stages(participant)?;

        let exists_in = |stage| ApprovalError::AlreadyExists {
            participant: participant.to_string(),
            name: job_name.to_string(),
            stage,
        };
        // A name lives in at most one stage directory.
        for stage in Stage::ALL {
            if self.stage_dir(participant, stage).join(job_name).exists() {
                return Err(exists_in(stage));
            }
        }
        let dest = self.stage_dir(participant, Stage::Inbox).join(job_name);

        let staging = participant_dir
            .join(JOBS_DIR)
            .join(STAGING_DIR)
            .join(format!("{job_name}-{}", Uuid::new_v4()));
        if let Err(err) = self.stage_entry(&staging, job_name, script) {
            let _ = fs::remove_dir_all(&staging);
            return Err(err);
        }
        if let Err(e) = fs::rename(&staging, &dest) {
            let _ = fs::remove_dir_all(&staging);
            return Err(if is_occupied(&e) {
                exists_in(Stage::Inbox)
            } else {
                io_err(&dest, e)
            });
        }

        info!(participant, job = job_name, submitted_by = %self.identity, "job submitted to inbox");
        Ok(dest)
    }

    fn stage_entry(&self, dir: &Path, job_name: &str, script: &str) -> Result<(), ApprovalError> {
        fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

        let script_path = dir.join(SCRIPT_FILE);
        fs::write(&script_path, script).map_err(|e| io_err(&script_path, e))?;
        make_executable(&script_path)?;

        let record = EntryRecord {
            name: job_name.to_string(),
            submitted_by: self.identity.clone(),
        };
        let record_path = dir.join(RECORD_FILE);
        fs::write(&record_path, toml::to_string(&record)?).map_err(|e| io_err(&record_path, e))?;
        Ok(())
    }

    /// Accept an inbox job by depositing its result: inbox -> done.
    pub fn accept(&self, entry: &mut ApprovalEntry, result_file: &Path) -> Result<PathBuf, ApprovalError> {
        self.advance(entry, Stage::Inbox, Stage::Done, "accept", Some(result_file))
    }

    /// Release an inbox job for execution: inbox -> approved.
    pub fn approve(&self, entry: &mut ApprovalEntry) -> Result<PathBuf, ApprovalError> {
        self.advance(entry, Stage::Inbox, Stage::Approved, "approve", None)
    }

    /// Finish an approved job with its result: approved -> done.
    pub fn complete(
        &self,
        entry: &mut ApprovalEntry,
        result_file: &Path,
    ) -> Result<PathBuf, ApprovalError> {
        self.advance(entry, Stage::Approved, Stage::Done, "complete", Some(result_file))
    }

    /// Move `entry` one step. All checks happen before the rename; the
    /// outputs directory is only populated after it.
    fn advance(
        &self,
        entry: &mut ApprovalEntry,
        from: Stage,
        to: Stage,
        action: &'static str,
        result_file: Option<&Path>,
    ) -> Result<PathBuf, ApprovalError> {
        check_name(&entry.participant)?;
        check_name(&entry.name)?;
        let invalid = || ApprovalError::InvalidState {
            name: entry.name.clone(),
            stage: entry.stage,
            action,
        };
        if entry.stage != from || !from.can_advance_to(to) {
            return Err(invalid());
        }
        let source = self.stage_dir(&entry.participant, from).join(&entry.name);
        if !source.is_dir() {
            // The directory is the source of truth; the entry is stale.
            return Err(invalid());
        }
        if let Some(file) = result_file {
            if !file.is_file() {
                return Err(ApprovalError::ResultNotFound(file.to_path_buf()));
            }
        }

        let dest_parent = self.stage_dir(&entry.participant, to);
        fs::create_dir_all(&dest_parent).map_err(|e| io_err(&dest_parent, e))?;
        let dest = dest_parent.join(&entry.name);
        let occupied = || ApprovalError::AlreadyExists {
            participant: entry.participant.clone(),
            name: entry.name.clone(),
            stage: to,
        };
        if dest.exists() {
            return Err(occupied());
        }
        if let Err(e) = fs::rename(&source, &dest) {
            return Err(if is_occupied(&e) {
                occupied()
            } else {
                io_err(&source, e)
            });
        }
        entry.stage = to;
        entry.location = dest.clone();
        info!(participant = %entry.participant, job = %entry.name, stage = %to, "job moved");

        if let Some(file) = result_file {
            let outputs = dest.join(OUTPUTS_DIR);
            fs::create_dir_all(&outputs).map_err(|e| io_err(&outputs, e))?;
            let file_name = file
                .file_name()
                .ok_or_else(|| ApprovalError::ResultNotFound(file.to_path_buf()))?;
            let target = outputs.join(file_name);
            fs::copy(file, &target).map_err(|e| io_err(&target, e))?;
            debug!(job = %entry.name, result = %target.display(), "result deposited");
        }
        Ok(dest)
    }

    /// Look up a job by name in the participant's stage directories.
    pub fn find(&self, participant: &str, name: &str) -> Result<ApprovalEntry, ApprovalError> {
        check_name(participant)?;
        check_name(name)?;
        for stage in Stage::ALL {
            let dir = self.stage_dir(participant, stage).join(name);
            if dir.is_dir() {
                return Ok(read_entry(participant, stage, &dir));
            }
        }
        Err(ApprovalError::NotFound {
            participant: participant.to_string(),
            name: name.to_string(),
        })
    }

    /// Every entry with a readable record, sorted by stage then name.
    ///
    /// Directories whose record is missing or unreadable are skipped.
    pub fn list(&self, participant: &str) -> Result<Vec<ApprovalEntry>, ApprovalError> {
        self.ensure_stages(participant)?;
        let mut entries = Vec::new();
        for stage in Stage::ALL {
            let stage_dir = self.stage_dir(participant, stage);
            for dir in subdirectories(&stage_dir)? {
                match load_record(&dir) {
                    Some(record) => entries.push(ApprovalEntry {
                        name: file_name(&dir),
                        participant: participant.to_string(),
                        submitted_by: record.submitted_by,
                        stage,
                        location: dir,
                    }),
                    None => debug!(path = %dir.display(), "skipping job without a readable record"),
                }
            }
        }
        entries.sort_by(|a, b| {
            a.stage
                .cmp(&b.stage)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(entries)
    }

    /// Names of the directories currently in the inbox.
    pub fn inbox_names(&self, participant: &str) -> Result<BTreeSet<String>, ApprovalError> {
        let inbox = self.stage_dir(participant, Stage::Inbox);
        Ok(subdirectories(&inbox)?.iter().map(|d| file_name(d)).collect())
    }

    /// Delete every job of `participant` and recreate empty stage directories.
    pub fn reset(&self, participant: &str) -> Result<(), ApprovalError> {
        check_name(participant)?;
        let jobs = self.participant_dir(participant).join(JOBS_DIR);
        match fs::remove_dir_all(&jobs) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&jobs, e)),
        }
        warn!(participant, "approval stages reset");
        self.ensure_stages(participant)
    }
}

fn check_name(name: &str) -> Result<(), ApprovalError> {
    check_label(name).map_err(|_| ApprovalError::InvalidName(name.to_string()))
}

/// `rename` refuses to replace a non-empty directory. Another writer got there first.
fn is_occupied(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, ApprovalError> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir, e)),
    };
    let mut dirs = Vec::new();
    for entry in read {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_record(dir: &Path) -> Option<EntryRecord> {
    let contents = fs::read_to_string(dir.join(RECORD_FILE)).ok()?;
    toml::from_str(&contents).ok()
}

fn read_entry(participant: &str, stage: Stage, dir: &Path) -> ApprovalEntry {
    let submitted_by = load_record(dir)
        .map(|r| r.submitted_by)
        .unwrap_or_else(unknown_submitter);
    ApprovalEntry {
        name: file_name(dir),
        participant: participant.to_string(),
        submitted_by,
        stage,
        location: dir.to_path_buf(),
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ApprovalError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ApprovalError> {
    Ok(())
}
