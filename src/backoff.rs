//! # Backoff Engine
//!
//! Per `(account, capability)` exponential backoff: doubled on each
//! failure, cleared on success or network reconnection. State lives in the
//! repository; pending jobs are notified so their effective run times
//! follow.

use metrics::counter;
use tracing::debug;

use crate::models::capability::{Backoff, NOT_IN_BACKOFF};
use crate::models::SyncJob;
use crate::queue::PendingQueue;
use crate::repository::RepositoryEngine;

#[derive(Debug, Clone)]
pub struct BackoffEngine {
    base_delay_ms: i64,
}

impl BackoffEngine {
    pub fn new(base_delay_ms: i64) -> Self {
        Self { base_delay_ms }
    }

    /// Success clears the capability's backoff and zeroes it on matching
    /// pending jobs.
    pub fn on_success(&self, repo: &RepositoryEngine, queue: &mut PendingQueue, job: &SyncJob) {
        debug!(key = %job.key, "Clearing backoff");
        repo.set_backoff(
            &job.app_id,
            job.account.as_ref(),
            &job.capability,
            NOT_IN_BACKOFF,
            NOT_IN_BACKOFF,
        );
        queue.on_backoff_changed(job.account.as_ref(), &job.capability, 0);
    }

    /// Failure doubles the previous delay (base on first failure) and moves
    /// the earliest retry time to `now + delay`. Returns the new pair, or
    /// `None` when an earlier failure already pushed the retry time past
    /// `now`.
    pub fn on_failure(
        &self,
        repo: &RepositoryEngine,
        queue: &mut PendingQueue,
        job: &mut SyncJob,
        now_ms: i64,
    ) -> Option<Backoff> {
        let previous = repo.get_backoff(job.account.as_ref(), &job.capability);
        if let Some(prev) = previous {
            if prev.is_active() && now_ms < prev.time_ms {
                return None;
            }
        }

        let delay_ms = match previous {
            Some(prev) if prev.is_active() && prev.delay_ms > 0 => prev.delay_ms * 2,
            _ => self.base_delay_ms,
        };
        let time_ms = now_ms + delay_ms;
        debug!(key = %job.key, delay_ms, "Increasing backoff");
        counter!("syncd_backoff_increase_total").increment(1);

        repo.set_backoff(
            &job.app_id,
            job.account.as_ref(),
            &job.capability,
            time_ms,
            delay_ms,
        );
        job.backoff_ms = time_ms;
        job.update_effective_run_time();
        queue.on_backoff_changed(job.account.as_ref(), &job.capability, time_ms);

        Some(Backoff { time_ms, delay_ms })
    }
}
