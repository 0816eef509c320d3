use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::job::{JobResult, JobStatus};

struct Entry {
    result: JobResult,
    /// Present only while a process is being supervised for the job.
    cancel: Option<CancellationToken>,
}

/// Identifier -> execution state for every job the engine has accepted.
///
/// The map lock is only held to insert or look up an entry; each entry has
/// its own mutex, so completing one job never blocks readers of another.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
}

fn lock(entry: &Mutex<Entry>) -> MutexGuard<'_, Entry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<Entry>>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn entries(&self) -> Vec<Arc<Mutex<Entry>>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Add a new job. Returns `false` if the identifier is already taken.
    pub fn register(&self, result: JobResult) -> bool {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&result.job_id) {
            return false;
        }
        jobs.insert(
            result.job_id.clone(),
            Arc::new(Mutex::new(Entry {
                result,
                cancel: None,
            })),
        );
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entry(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<JobResult> {
        self.entry(id).map(|entry| lock(&entry).result.clone())
    }

    pub fn all(&self) -> Vec<JobResult> {
        self.entries()
            .iter()
            .map(|entry| lock(entry).result.clone())
            .collect()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.entries()
            .iter()
            .filter(|entry| lock(entry).result.status == status)
            .count()
    }

    /// Jobs not yet in a terminal status.
    pub fn in_flight(&self) -> usize {
        self.entries()
            .iter()
            .filter(|entry| !lock(entry).result.status.is_terminal())
            .count()
    }

    /// Mutate one job's record under its own lock.
    pub fn update<T>(&self, id: &str, f: impl FnOnce(&mut JobResult) -> T) -> Option<T> {
        let entry = self.entry(id)?;
        let mut guard = lock(&entry);
        Some(f(&mut guard.result))
    }

    /// Move a pending job to `Running` and attach the token that cancels it.
    pub fn mark_running(&self, id: &str, cancel: CancellationToken) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let mut guard = lock(&entry);
        if !guard.result.advance(JobStatus::Running, Utc::now()) {
            return false;
        }
        guard.cancel = Some(cancel);
        true
    }

    /// Forget the cancel token once the process has been reaped.
    pub fn release(&self, id: &str) {
        if let Some(entry) = self.entry(id) {
            lock(&entry).cancel = None;
        }
    }

    /// Signal the running process of `id`, if there is one.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let guard = lock(&entry);
        match (&guard.cancel, guard.result.status) {
            (Some(token), JobStatus::Running) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}
