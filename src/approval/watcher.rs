use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::stage::Stage;
use super::store::{ApprovalError, ApprovalStore};
use crate::workspace::SCRIPT_FILE;

const PREVIEW_LINES: usize = 5;

/// A job that appeared in the inbox since the previous poll.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub location: PathBuf,
    /// First lines of the job's script, if it could be read.
    pub preview: Vec<String>,
    pub truncated: bool,
}

/// Polls one participant's inbox and reports entries not seen before.
pub struct InboxWatcher {
    store: ApprovalStore,
    participant: String,
    known: BTreeSet<String>,
}

impl InboxWatcher {
    pub fn new(store: ApprovalStore, participant: impl Into<String>) -> Self {
        Self {
            store,
            participant: participant.into(),
            known: BTreeSet::new(),
        }
    }

    pub fn known(&self) -> &BTreeSet<String> {
        &self.known
    }

    /// Record what is already in the inbox so it is not reported as new.
    pub fn prime(&mut self) -> Result<usize, ApprovalError> {
        self.store.ensure_stages(&self.participant)?;
        self.known = self.store.inbox_names(&self.participant)?;
        Ok(self.known.len())
    }

    /// Scan the inbox once. Entries that left the inbox are forgotten.
    pub fn poll(&mut self) -> Result<Vec<NewJob>, ApprovalError> {
        let current = self.store.inbox_names(&self.participant)?;
        let inbox = self.store.stage_dir(&self.participant, Stage::Inbox);
        let fresh: Vec<NewJob> = current
            .difference(&self.known)
            .map(|name| {
                let location = inbox.join(name);
                let (preview, truncated) = script_preview(&location);
                NewJob {
                    name: name.clone(),
                    location,
                    preview,
                    truncated,
                }
            })
            .collect();
        self.known = current;
        Ok(fresh)
    }

    /// Poll every `interval` until `cancel` fires, handing each new job to `on_new`.
    pub async fn run(
        &mut self,
        interval: Duration,
        cancel: CancellationToken,
        mut on_new: impl FnMut(&NewJob),
    ) -> Result<(), ApprovalError> {
        let existing = self.prime()?;
        info!(
            participant = %self.participant,
            existing,
            interval = ?interval,
            "watching inbox"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll() {
                Ok(jobs) => {
                    for job in &jobs {
                        info!(participant = %self.participant, job = %job.name, "new job in inbox");
                        on_new(job);
                    }
                }
                Err(err) => warn!(participant = %self.participant, error = %err, "inbox poll failed"),
            }
        }
        info!(participant = %self.participant, "inbox watcher stopped");
        Ok(())
    }
}

fn script_preview(job_dir: &std::path::Path) -> (Vec<String>, bool) {
    let Ok(content) = fs::read_to_string(job_dir.join(SCRIPT_FILE)) else {
        return (Vec::new(), false);
    };
    let mut lines = content.lines();
    let preview: Vec<String> = lines
        .by_ref()
        .take(PREVIEW_LINES)
        .map(|l| l.trim_end().to_string())
        .collect();
    (preview, lines.next().is_some())
}
