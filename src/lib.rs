//! Isolated job workspaces, supervised script execution and a
//! directory-based approval inbox.
//!
//! A [`JobSubmission`] goes through [`JobEngine`]: the [`WorkspaceBuilder`]
//! resolves its references and writes `config.toml` + `run.sh`, the
//! [`ProcessSupervisor`] runs the script under a timeout, and the outcome
//! is recorded as a [`JobResult`]. The [`approval`] module is independent
//! and tracks jobs through `inbox -> approved -> done` on disk.

pub mod approval;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod supervisor;
pub mod ui;
pub mod workspace;

pub use approval::{ApprovalEntry, ApprovalError, ApprovalStore, InboxWatcher, Stage};
pub use config::JobsiteConfig;
pub use engine::{EngineConfig, EngineError, JobEngine, JobHandle};
pub use error::ConfigError;
pub use job::{JobResult, JobStatus, JobSubmission, Script};
pub use supervisor::ProcessSupervisor;
pub use workspace::{ReferenceResolver, StandardResolver, WorkspaceBuilder};
