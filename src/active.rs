//! Active job set: jobs that have been dispatched to their adapter and not
//! yet completed, each guarded by a watchdog timer.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::clock::TimerHandle;
use crate::dispatcher::Message;
use crate::error::SyncError;
use crate::models::SyncJob;

/// Snapshot view of one dispatched job.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job: SyncJob,
    pub start_time_ms: i64,
}

struct Entry {
    job: SyncJob,
    start_time_ms: i64,
    // Cancelled by drop when the entry is finished or preempted.
    _watchdog: TimerHandle,
}

/// Mapping `key → dispatched job`. Owns the job snapshots taken at
/// promotion time.
pub struct ActiveJobSet {
    entries: BTreeMap<String, Entry>,
    watchdog: Duration,
}

impl ActiveJobSet {
    pub fn new(watchdog: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            watchdog,
        }
    }

    /// Admit a dispatched job and arm its watchdog. Rejects a second job
    /// with the same key.
    pub fn try_start(
        &mut self,
        job: SyncJob,
        start_time_ms: i64,
        tx: UnboundedSender<Message>,
    ) -> Result<(), SyncError> {
        if self.entries.contains_key(&job.key) {
            return Err(SyncError::AlreadyInProgress);
        }
        let watchdog = TimerHandle::post_after(tx, self.watchdog, Message::Watchdog(job.key.clone()));
        debug!(key = %job.key, app_id = %job.app_id, "Job added to active set");
        self.entries.insert(
            job.key.clone(),
            Entry {
                job,
                start_time_ms,
                _watchdog: watchdog,
            },
        );
        Ok(())
    }

    /// Remove the entry and cancel its watchdog, returning the job.
    pub fn finish(&mut self, key: &str) -> Option<SyncJob> {
        self.entries.remove(key).map(|entry| entry.job)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of every active job owned by the given adapter app.
    pub fn keys_for_app(&self, app_id: &str) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.job.app_id == app_id)
            .map(|entry| entry.job.key.clone())
            .collect()
    }

    /// Deep copies of the current entries.
    pub fn snapshot(&self) -> Vec<ActiveJob> {
        self.entries
            .values()
            .map(|entry| ActiveJob {
                job: entry.job.clone(),
                start_time_ms: entry.start_time_ms,
            })
            .collect()
    }
}
