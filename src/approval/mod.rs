//! Directory-based approval workflow.
//!
//! Each participant owns `job/inbox`, `job/approved` and `job/done`. A job's
//! stage is the directory it sits in; moves between stages are single
//! `rename` calls. No state is held in memory.

mod stage;
mod store;
mod watcher;

pub use stage::Stage;
pub use store::{ApprovalEntry, ApprovalError, ApprovalStore, EntryRecord, JOBS_DIR};
pub use watcher::{InboxWatcher, NewJob};
