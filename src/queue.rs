//! Pending job queue: the set of requested jobs awaiting dispatch, keyed by
//! job key with at most one entry per key.

use std::collections::BTreeMap;

use tracing::debug;

use crate::models::job::{accounts_equal, SyncJob};
use crate::models::AccountHandle;

/// Result of inserting a job into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// An equal-or-later, equal-or-lower-priority entry was replaced.
    Replaced,
    AlreadyInProgress,
}

/// Mapping `key → SyncJob`. Owns its entries; `snapshot` hands out deep
/// copies so callers never iterate live state.
#[derive(Debug, Default)]
pub struct PendingQueue {
    jobs: BTreeMap<String, SyncJob>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `job`, replacing an existing entry only when the newcomer is
    /// not later and not lower-priority than what is already queued.
    pub fn add(&mut self, job: SyncJob) -> AddOutcome {
        match self.jobs.get(&job.key) {
            None => {
                debug!(key = %job.key, "Queued sync job");
                self.jobs.insert(job.key.clone(), job);
                AddOutcome::Inserted
            }
            Some(existing) => {
                let not_later = existing.effective_run_time_ms >= job.effective_run_time_ms;
                let not_higher_priority = !existing.is_expedited || job.is_expedited;
                if not_later && not_higher_priority {
                    debug!(key = %job.key, "Replaced queued sync job");
                    self.jobs.insert(job.key.clone(), job);
                    AddOutcome::Replaced
                } else {
                    AddOutcome::AlreadyInProgress
                }
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<SyncJob> {
        self.jobs.remove(key)
    }

    /// Drop every pending job owned by the given adapter app. Returns the
    /// number removed.
    pub fn remove_by_app(&mut self, app_id: &str) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| job.app_id != app_id);
        before - self.jobs.len()
    }

    /// Propagate a backoff change to every matching pending job.
    pub fn on_backoff_changed(
        &mut self,
        account: Option<&AccountHandle>,
        capability: &str,
        backoff_ms: i64,
    ) {
        for job in self.jobs.values_mut() {
            if accounts_equal(job.account.as_ref(), account) && job.capability == capability {
                job.backoff_ms = backoff_ms;
                job.update_effective_run_time();
            }
        }
    }

    /// Propagate a delay-until change to every matching pending job.
    pub fn on_delay_until_changed(
        &mut self,
        account: Option<&AccountHandle>,
        capability: &str,
        delay_until_ms: i64,
    ) {
        for job in self.jobs.values_mut() {
            if accounts_equal(job.account.as_ref(), account) && job.capability == capability {
                job.delay_until_ms = delay_until_ms;
                job.update_effective_run_time();
            }
        }
    }

    /// Zero every pending job's backoff (network reconnection).
    pub fn clear_all_backoffs(&mut self) {
        for job in self.jobs.values_mut() {
            job.backoff_ms = 0;
            job.update_effective_run_time();
        }
    }

    pub fn get(&self, key: &str) -> Option<&SyncJob> {
        self.jobs.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.jobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Deep copies in dispatch order: expedited first, then ascending window
    /// start.
    pub fn snapshot(&self) -> Vec<SyncJob> {
        let mut jobs: Vec<SyncJob> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.dispatch_cmp(b));
        jobs
    }
}
