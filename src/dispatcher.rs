//! # Sync Job Dispatcher
//!
//! Single-threaded cooperative event loop that owns every mutable piece of
//! scheduler state. External producers only enqueue typed [`Message`]s;
//! this worker drains them, reconciles constraints, conflicts, concurrency
//! limits and ordering, promotes pending jobs into the active set, and
//! feeds results back into the backoff engine.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::active::{ActiveJob, ActiveJobSet};
use crate::adapters::{AdapterLink, AdapterRegistry};
use crate::aggregator::{EntryKind, JobEntry, JobIdAggregator, SYNC_JOB_LIMIT};
use crate::backoff::BackoffEngine;
use crate::bundle::{keys, Bundle};
use crate::clock::{Clock, TimerHandle};
use crate::config::AppConfig;
use crate::constraints::{ConstraintChange, ConstraintEvent, ConstraintOracle};
use crate::data_change::{capability_uris, DataChangeScheduler};
use crate::error::SyncError;
use crate::facade::{ClientRequest, JobSummary, RequestKind, RequestReply};
use crate::models::account::{AccountHandle, AccountId, AccountSource, NO_ACCOUNT};
use crate::models::capability::PeriodicSync;
use crate::models::job::{sync_option, JobKind, SyncReason, SyncSource};
use crate::models::{SyncJob, SyncStatus};
use crate::queue::{AddOutcome, PendingQueue};
use crate::repository::RepositoryEngine;
use crate::scheduler::PeriodicScheduler;

/// Events consumed by the worker loop, FIFO over one mpsc channel.
#[derive(Debug)]
pub enum Message {
    NewJob(Box<SyncJob>),
    RemoveJob(String),
    Alarm,
    CheckAlarm,
    Cancel(String),
    Finished { key: String, status: SyncStatus },
    Watchdog(String),
    PackageUninstalled(String),
    ConstraintChanged(ConstraintEvent),
    DataChanged(String),
    SetSyncStatus(bool),
    Request(ClientRequest),
    Shutdown,
}

struct TickAlarm {
    due_ms: i64,
    _timer: TimerHandle,
}

/// The dispatcher worker. Owns the pending queue, active set, aggregator,
/// adapter registry, data-change buckets, and constraint state.
pub struct SchedulerWorker {
    config: Arc<AppConfig>,
    clock: Clock,
    repo: Arc<RepositoryEngine>,
    accounts: Arc<dyn AccountSource>,
    link: Arc<dyn AdapterLink>,
    oracle: ConstraintOracle,
    queue: PendingQueue,
    active: ActiveJobSet,
    aggregator: JobIdAggregator,
    adapters: AdapterRegistry,
    data_change: DataChangeScheduler,
    periodic: PeriodicScheduler,
    backoff: BackoffEngine,
    tx: UnboundedSender<Message>,
    tick: Option<TickAlarm>,
}

impl SchedulerWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<AppConfig>,
        clock: Clock,
        repo: Arc<RepositoryEngine>,
        accounts: Arc<dyn AccountSource>,
        link: Arc<dyn AdapterLink>,
        adapters: AdapterRegistry,
        pending: Vec<SyncJob>,
        tx: UnboundedSender<Message>,
    ) -> Self {
        let mut queue = PendingQueue::new();
        for job in pending {
            queue.add(job);
        }
        let watchdog = Duration::from_secs(config.worker.watchdog_secs);
        let periodic = PeriodicScheduler::new(repo.random_offset_sec());
        let backoff = BackoffEngine::new(config.worker.backoff_base_ms);
        Self {
            config,
            clock,
            repo,
            accounts,
            link,
            oracle: ConstraintOracle::new(),
            queue,
            active: ActiveJobSet::new(watchdog),
            aggregator: JobIdAggregator::new(),
            adapters,
            data_change: DataChangeScheduler::new(),
            periodic,
            backoff,
            tx,
            tick: None,
        }
    }

    /// Drain the message channel until shutdown, flushing state on the way
    /// out.
    pub async fn run(mut self, mut rx: UnboundedReceiver<Message>) {
        info!("Sync job dispatcher started");
        while let Some(message) = rx.recv().await {
            if matches!(message, Message::Shutdown) {
                break;
            }
            self.handle_message(message);
            self.dispatch_pass();
        }
        self.repo
            .save_current_state(&self.queue.snapshot(), &self.adapters);
        info!("Sync job dispatcher stopped");
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Request(ClientRequest { kind, reply }) => {
                let result = self.handle_request(kind);
                let _ = reply.send(result);
            }
            Message::NewJob(job) => {
                self.enqueue(*job);
            }
            Message::RemoveJob(key) => {
                self.queue.remove(&key);
            }
            Message::Alarm => {
                self.tick = None;
            }
            Message::CheckAlarm => {}
            Message::Cancel(key) => self.cancel_by_key(&key),
            Message::Finished { key, status } => match self.active.finish(&key) {
                Some(job) => self.handle_result(job, status),
                None => debug!(key, "Result for job that is not active"),
            },
            Message::Watchdog(key) => {
                if let Some(job) = self.active.finish(&key) {
                    warn!(key, app_id = %job.app_id, "Watchdog expired, cancelling sync");
                    counter!("syncd_watchdog_expired_total").increment(1);
                    self.deliver_cancel(&job);
                    self.release_entry(&job);
                }
            }
            Message::PackageUninstalled(package_id) => {
                self.handle_package_uninstalled(&package_id)
            }
            Message::ConstraintChanged(event) => {
                if self.oracle.apply(event) == ConstraintChange::Reconnection {
                    info!("Reconnection detected, clearing all backoffs");
                    self.clear_all_backoffs();
                }
            }
            Message::DataChanged(capability) => self.handle_data_changed(&capability),
            Message::SetSyncStatus(enabled) => self.oracle.set_sync_permitted(enabled),
            Message::Shutdown => {}
        }
    }

    // Request surface -----------------------------------------------------

    fn handle_request(&mut self, kind: RequestKind) -> Result<RequestReply, SyncError> {
        match kind {
            RequestKind::RegisterAdapter {
                package_id,
                service_app_id,
            } => {
                if package_id.is_empty() || service_app_id.is_empty() {
                    return Err(SyncError::InvalidParameter(
                        "package id and service app id are required".into(),
                    ));
                }
                self.adapters.add(&package_id, &service_app_id);
                self.repo.save_adapters(&self.adapters);
                Ok(RequestReply::Done)
            }
            RequestKind::UnregisterAdapter { package_id } => {
                if self.adapters.remove(&package_id).is_none() {
                    return Err(SyncError::InvalidOperation(format!(
                        "no sync adapter registered for {package_id}"
                    )));
                }
                self.repo.save_adapters(&self.adapters);
                Ok(RequestReply::Done)
            }
            RequestKind::AddOnDemand {
                package_id,
                account_id,
                job_name,
                sync_option,
                extras,
            } => self.add_on_demand(package_id, account_id, job_name, sync_option, extras),
            RequestKind::AddPeriodic {
                package_id,
                account_id,
                job_name,
                period_sec,
                sync_option,
                extras,
            } => self.add_periodic(
                package_id,
                account_id,
                job_name,
                period_sec,
                sync_option,
                extras,
            ),
            RequestKind::AddDataChange {
                package_id,
                account_id,
                capability,
                sync_option,
                extras,
            } => self.add_data_change(package_id, account_id, capability, sync_option, extras),
            RequestKind::RemoveJob {
                package_id,
                sync_job_id,
            } => self.remove_job(&package_id, sync_job_id),
            RequestKind::GetAllJobs { package_id } => {
                let jobs = self
                    .aggregator
                    .jobs_for_package(&package_id)
                    .into_iter()
                    .map(|entry| JobSummary {
                        sync_job_id: entry.sync_job_id,
                        account_id: entry.account_id,
                        job_name: entry.job_name.clone(),
                        extras: entry.extras.clone(),
                    })
                    .collect();
                Ok(RequestReply::Jobs(jobs))
            }
            RequestKind::SetSyncEnabled { enabled } => {
                info!(enabled, "Sync status changed");
                self.oracle.set_sync_permitted(enabled);
                Ok(RequestReply::Done)
            }
            RequestKind::SendResult {
                package_id,
                job_name,
                status,
            } => self.send_result(&package_id, &job_name, status),
        }
    }

    fn add_on_demand(
        &mut self,
        package_id: String,
        account_id: AccountId,
        job_name: String,
        option: u32,
        extras: Bundle,
    ) -> Result<RequestReply, SyncError> {
        if job_name.trim().is_empty() {
            return Err(SyncError::InvalidParameter("job name must not be empty".into()));
        }
        let app_id = self.resolve_adapter(&package_id)?;
        let account = self.resolve_account(account_id)?;
        let extras = apply_sync_options(extras, option);

        let sync_job_id = self.existing_or_new_id(&package_id, &job_name)?;
        let mut job = self.build_client_job(
            &app_id,
            &package_id,
            &job_name,
            account,
            "",
            extras.clone(),
            SyncReason::UserInitiated,
            JobKind::OnDemand,
        );
        job.sync_job_id = sync_job_id;

        self.aggregator.remove_by_name(&package_id, &job_name);
        self.aggregator.add(
            &package_id,
            JobEntry {
                sync_job_id,
                job_name,
                account_id,
                extras,
                sync_option: option,
                kind: EntryKind::OnDemand,
                key: job.key.clone(),
            },
        );
        self.enqueue(job);
        Ok(RequestReply::JobId(sync_job_id))
    }

    fn add_periodic(
        &mut self,
        package_id: String,
        account_id: AccountId,
        job_name: String,
        period_sec: i64,
        option: u32,
        extras: Bundle,
    ) -> Result<RequestReply, SyncError> {
        if job_name.trim().is_empty() {
            return Err(SyncError::InvalidParameter("job name must not be empty".into()));
        }
        if period_sec <= 0 {
            return Err(SyncError::InvalidParameter(
                "period must be a positive number of seconds".into(),
            ));
        }
        let app_id = self.resolve_adapter(&package_id)?;
        let account = self.resolve_account(account_id)?;
        let extras = apply_sync_options(extras, option);
        let period_sec = period_sec.max(self.config.worker.min_period_sec);

        let sync_job_id = self.existing_or_new_id(&package_id, &job_name)?;
        let periodic = PeriodicSync::new(job_name.clone(), period_sec, extras.clone());
        let period_sec = periodic.period_sec;
        self.repo
            .add_periodic(&app_id, account.as_ref(), "", periodic);

        let key = SyncJob::make_key(account.as_ref(), &app_id, "");
        self.aggregator.remove_by_name(&package_id, &job_name);
        self.aggregator.add(
            &package_id,
            JobEntry {
                sync_job_id,
                job_name,
                account_id,
                extras,
                sync_option: option,
                kind: EntryKind::Periodic { period_sec },
                key,
            },
        );
        Ok(RequestReply::JobId(sync_job_id))
    }

    fn add_data_change(
        &mut self,
        package_id: String,
        account_id: AccountId,
        capability: String,
        option: u32,
        extras: Bundle,
    ) -> Result<RequestReply, SyncError> {
        if !capability_uris::is_recognized(&capability) {
            return Err(SyncError::InvalidParameter(format!(
                "unrecognized capability {capability}"
            )));
        }
        let app_id = self.resolve_adapter(&package_id)?;
        let account = self.resolve_account(account_id)?;
        let extras = apply_sync_options(extras, option);

        let sync_job_id = self.existing_or_new_id(&package_id, &capability)?;
        let mut template = self.build_client_job(
            &app_id,
            &package_id,
            &capability,
            account,
            &capability,
            extras.clone(),
            SyncReason::DeviceDataChanged,
            JobKind::DataChange {
                capability: capability.clone(),
            },
        );
        template.sync_job_id = sync_job_id;
        let key = template.key.clone();
        self.data_change.register(&capability, template);

        self.aggregator.remove_by_name(&package_id, &capability);
        self.aggregator.add(
            &package_id,
            JobEntry {
                sync_job_id,
                job_name: capability.clone(),
                account_id,
                extras,
                sync_option: option,
                kind: EntryKind::DataChange { capability },
                key,
            },
        );
        Ok(RequestReply::JobId(sync_job_id))
    }

    fn remove_job(
        &mut self,
        package_id: &str,
        sync_job_id: i32,
    ) -> Result<RequestReply, SyncError> {
        if !(1..=SYNC_JOB_LIMIT).contains(&sync_job_id) {
            return Err(SyncError::InvalidParameter(format!(
                "sync job id {sync_job_id} out of range"
            )));
        }
        let Some(entry) = self.aggregator.remove_by_id(package_id, sync_job_id) else {
            debug!(package_id, sync_job_id, "Removal of unknown sync job, ignored");
            return Ok(RequestReply::Done);
        };
        match &entry.kind {
            EntryKind::OnDemand => self.cancel_by_key(&entry.key),
            EntryKind::Periodic { .. } => {
                let account = self.resolve_account(entry.account_id).unwrap_or(None);
                self.repo
                    .remove_periodic(account.as_ref(), "", &entry.job_name);
            }
            EntryKind::DataChange { capability } => {
                self.data_change.deregister(capability, &entry.key);
                self.cancel_by_key(&entry.key);
            }
        }
        Ok(RequestReply::Done)
    }

    fn send_result(
        &mut self,
        package_id: &str,
        job_name: &str,
        status: SyncStatus,
    ) -> Result<RequestReply, SyncError> {
        debug!(package_id, job_name, ?status, "Sync result received");
        let Some(key) = self
            .aggregator
            .get(package_id, job_name)
            .map(|entry| entry.key.clone())
        else {
            warn!(package_id, job_name, "Result for unknown sync job");
            return Ok(RequestReply::Done);
        };
        match self.active.finish(&key) {
            Some(job) => self.handle_result(job, status),
            None => debug!(key, "Result for job that is no longer active"),
        }
        Ok(RequestReply::Done)
    }

    // Result handling and retry -------------------------------------------

    fn handle_result(&mut self, mut job: SyncJob, status: SyncStatus) {
        match status {
            SyncStatus::Success => {
                self.backoff.on_success(&self.repo, &mut self.queue, &job);
                self.release_entry(&job);
            }
            SyncStatus::Failure => {
                let now = self.clock.elapsed_ms();
                self.backoff
                    .on_failure(&self.repo, &mut self.queue, &mut job, now);
                if job.no_retry() {
                    debug!(key = %job.key, "Job failed and opted out of retries");
                    self.release_entry(&job);
                } else {
                    self.try_to_reschedule(&job);
                }
            }
            SyncStatus::AlreadyInProgress => self.try_to_reschedule(&job),
            SyncStatus::Cancelled => {
                self.deliver_cancel(&job);
                self.release_entry(&job);
            }
            SyncStatus::Unknown => warn!(key = %job.key, "Unknown sync result"),
        }
    }

    /// Queue a retry of the job 10 s out, unless its account or capability
    /// no longer supports sync.
    fn try_to_reschedule(&mut self, job: &SyncJob) {
        if let Some(account) = &job.account {
            if !self.accounts.supports_sync(account.id) {
                debug!(key = %job.key, "Account no longer supports sync, dropping retry");
                return;
            }
        }
        if !job.capability.is_empty()
            && self.repo.get_syncable(job.account.as_ref(), &job.capability) == 0
        {
            debug!(key = %job.key, "Capability not syncable, dropping retry");
            return;
        }
        let mut retry = job.clone();
        retry.latest_run_time_ms = self.clock.elapsed_ms() + self.config.worker.retry_delay_ms;
        retry.update_effective_run_time();
        debug!(key = %retry.key, "Rescheduling sync job");
        self.enqueue(retry);
    }

    /// Forget the client-visible registration of a completed one-shot job.
    fn release_entry(&mut self, job: &SyncJob) {
        if matches!(job.kind, JobKind::OnDemand) {
            self.aggregator.remove_by_name(&job.package_id, &job.job_name);
        }
    }

    fn cancel_by_key(&mut self, key: &str) {
        let pending = self.queue.remove(key);
        if let Some(job) = self.active.finish(key) {
            self.deliver_cancel(&job);
            self.release_entry(&job);
        } else if let Some(job) = pending {
            // Best-effort cancel even though nothing was running.
            self.deliver_cancel(&job);
        }
    }

    fn handle_package_uninstalled(&mut self, package_id: &str) {
        info!(package_id, "Package uninstalled, cleaning up");
        let app_id = self.adapters.resolve(package_id).map(str::to_string);
        self.adapters.remove(package_id);
        self.repo.save_adapters(&self.adapters);

        for entry in self.aggregator.remove_package(package_id) {
            self.queue.remove(&entry.key);
            if let EntryKind::DataChange { capability } = &entry.kind {
                self.data_change.deregister(capability, &entry.key);
            }
        }

        if let Some(app_id) = app_id {
            self.repo.cleanup(&app_id);
            self.queue.remove_by_app(&app_id);
            self.data_change.remove_by_app(&app_id);
            for key in self.active.keys_for_app(&app_id) {
                if let Some(job) = self.active.finish(&key) {
                    self.deliver_cancel(&job);
                }
            }
        }
    }

    fn handle_data_changed(&mut self, capability: &str) {
        debug!(capability, "Device data change");
        // A local DB change is fresh evidence the device is in use; give
        // backed-off capabilities another chance right away.
        self.clear_all_backoffs();
        let now = self.clock.elapsed_ms();
        for template in self.data_change.on_data_change(capability) {
            let mut job = template;
            job.latest_run_time_ms = now;
            job.backoff_ms = 0;
            job.delay_until_ms = self
                .repo
                .get_delay_until(job.account.as_ref(), &job.capability);
            job.update_effective_run_time();
            self.enqueue(job);
        }
    }

    fn clear_all_backoffs(&mut self) {
        self.repo.clear_all_backoffs();
        self.queue.clear_all_backoffs();
    }

    fn enqueue(&mut self, job: SyncJob) -> AddOutcome {
        let key = job.key.clone();
        let outcome = self.queue.add(job);
        match outcome {
            AddOutcome::Inserted | AddOutcome::Replaced => {
                counter!("syncd_jobs_enqueued_total").increment(1);
            }
            AddOutcome::AlreadyInProgress => {
                debug!(key = %key, "Duplicate sync job, not queued");
            }
        }
        outcome
    }

    // Dispatch ------------------------------------------------------------

    /// One pass of the dispatcher sequence: periodic scheduling, promotion
    /// of pending jobs, and alarm maintenance. Runs after every message.
    fn dispatch_pass(&mut self) {
        if !self.oracle.sync_permitted {
            if self.tick.take().is_some() {
                debug!("Sync not permitted, cancelling tick alarm");
            }
            return;
        }

        let periodic_delay = self.schedule_periodic_jobs();
        let pending_delay = self.try_start_next();

        gauge!("syncd_pending_jobs").set(self.queue.len() as f64);
        gauge!("syncd_active_jobs").set(self.active.len() as f64);

        let next = match (periodic_delay, pending_delay) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.arm_tick_alarm(next);
    }

    /// Enqueue every ripe periodic sync and report the delay until the
    /// earliest future one.
    fn schedule_periodic_jobs(&mut self) -> Option<i64> {
        let snapshot = self.repo.get_copy_of_all_capabilities_and_status();
        if snapshot.is_empty() {
            return None;
        }
        let now_wall = self.clock.wall_ms();
        let repo = self.repo.clone();
        let accounts = self.accounts.clone();
        let pass = self.periodic.run_pass(&snapshot, now_wall, |cap| {
            if let Some(account) = &cap.account {
                if !accounts.supports_sync(account.id) {
                    return false;
                }
            }
            repo.get_syncable(cap.account.as_ref(), &cap.capability) != 0
        });

        let now = self.clock.elapsed_ms();
        for ripe in pass.ripe {
            let cap = &ripe.capability;
            if !cap.enabled && !ripe.entry.extras.flag(keys::IGNORE_SETTINGS) {
                continue;
            }
            self.repo
                .set_periodic_sync_time(cap.id, ripe.index, now_wall);

            let backoff_ms = self
                .repo
                .get_backoff(cap.account.as_ref(), &cap.capability)
                .filter(|b| b.is_active())
                .map(|b| b.time_ms)
                .unwrap_or(0);
            let delay_until_ms = self
                .repo
                .get_delay_until(cap.account.as_ref(), &cap.capability);
            let package_id = self
                .adapters
                .resolve_package(&cap.app_id)
                .unwrap_or_default()
                .to_string();

            let mut job = SyncJob::new(
                cap.app_id.clone(),
                package_id.clone(),
                ripe.entry.job_name.clone(),
                cap.account.clone(),
                cap.capability.clone(),
                ripe.entry.extras.clone(),
                SyncReason::Periodic,
                SyncSource::Periodic,
                JobKind::Periodic {
                    period_sec: ripe.entry.period_sec,
                    flex_sec: ripe.entry.flex_sec,
                },
                0,
                0,
                backoff_ms,
                delay_until_ms,
                false,
                now,
            );
            job.sync_job_id = self
                .aggregator
                .get(&package_id, &ripe.entry.job_name)
                .map(|entry| entry.sync_job_id)
                .unwrap_or(0);

            info!(
                app_id = %cap.app_id,
                job_name = %ripe.entry.job_name,
                period_sec = ripe.entry.period_sec,
                "Periodic sync job is ripe"
            );
            counter!("syncd_periodic_ripe_total").increment(1);
            self.enqueue(job);
        }
        pass.next_poll_delay_ms
    }

    /// Promote pending jobs into the active set subject to constraints,
    /// conflicts, and capacity. Returns the delay until the earliest
    /// pending job whose window has not opened yet.
    fn try_start_next(&mut self) -> Option<i64> {
        if !self.oracle.may_dispatch() {
            debug!(
                wifi = self.oracle.wifi_connected,
                cellular = self.oracle.cellular_connected,
                storage_low = self.oracle.storage_low,
                ups = self.oracle.ups_enabled,
                "Constraints forbid dispatch"
            );
            return None;
        }

        let now = self.clock.elapsed_ms();
        let max_run_ms = self.config.worker.max_run_ms;
        let mut next_delay: Option<i64> = None;

        for candidate in self.queue.snapshot() {
            let window_opens = candidate.effective_run_time_ms - candidate.flex_ms;
            if window_opens > now {
                let delay = window_opens - now;
                next_delay = Some(next_delay.map_or(delay, |d| d.min(delay)));
                continue;
            }

            let candidate_initialized = candidate.is_initialized();
            let mut n_init = 0usize;
            let mut n_regular = 0usize;
            let mut conflict: Option<ActiveJob> = None;
            let mut long_running: Option<ActiveJob> = None;
            let mut oldest_nonexpedited_regular: Option<ActiveJob> = None;
            let mut already_in_progress = false;

            for active in self.active.snapshot() {
                if active.job.app_id == candidate.app_id {
                    already_in_progress = true;
                    break;
                }
                if active.job.is_initialized() {
                    n_init += 1;
                } else {
                    n_regular += 1;
                    if !active.job.is_expedited {
                        let is_older = oldest_nonexpedited_regular
                            .as_ref()
                            .is_none_or(|current| current.start_time_ms > active.start_time_ms);
                        if is_older {
                            oldest_nonexpedited_regular = Some(active.clone());
                        }
                    }
                }
                if active.job.key == candidate.key && !active.job.parallel_allowed {
                    // Keep counting; the full tallies feed the decision below.
                    conflict = Some(active);
                } else if active.job.is_initialized() == candidate_initialized
                    && active.start_time_ms + max_run_ms < now
                {
                    long_running = Some(active);
                }
            }

            if already_in_progress {
                debug!(key = %candidate.key, "Adapter already handling a sync job");
                continue;
            }

            let room_available = if candidate_initialized {
                n_init < self.config.worker.max_init_syncs
            } else {
                n_regular < self.config.worker.max_regular_syncs
            };

            let to_reschedule: Option<ActiveJob> = if let Some(conflicting) = conflict {
                if candidate_initialized
                    && !conflicting.job.is_initialized()
                    && n_init < self.config.worker.max_init_syncs
                {
                    Some(conflicting)
                } else if candidate.is_expedited
                    && !conflicting.job.is_expedited
                    && candidate_initialized == conflicting.job.is_initialized()
                {
                    Some(conflicting)
                } else {
                    debug!(key = %candidate.key, "Conflicting active job wins, skipping");
                    continue;
                }
            } else if room_available {
                None
            } else if candidate.is_expedited
                && oldest_nonexpedited_regular.is_some()
                && !candidate_initialized
            {
                oldest_nonexpedited_regular
            } else if let Some(lr) = long_running {
                Some(lr)
            } else {
                debug!(key = %candidate.key, "No room for candidate");
                continue;
            };

            if let Some(victim) = to_reschedule {
                info!(victim = %victim.job.key, key = %candidate.key, "Preempting active sync job");
                counter!("syncd_jobs_preempted_total").increment(1);
                if let Some(job) = self.active.finish(&victim.job.key) {
                    self.deliver_cancel(&job);
                }
            }

            if self.active.contains_key(&candidate.key) {
                debug!(key = %candidate.key, "Key already active, skipping");
                continue;
            }
            let Some(job) = self.queue.remove(&candidate.key) else {
                continue;
            };
            self.dispatch(job, now);
        }

        next_delay
    }

    fn dispatch(&mut self, job: SyncJob, now: i64) {
        info!(key = %job.key, app_id = %job.app_id, "Dispatching sync job");
        counter!("syncd_jobs_dispatched_total").increment(1);
        self.deliver_start(&job);
        if let Err(err) = self.active.try_start(job, now, self.tx.clone()) {
            warn!(error = %err, "Dispatched job rejected by active set");
        }
    }

    fn arm_tick_alarm(&mut self, delay_ms: Option<i64>) {
        let Some(delay_ms) = delay_ms else {
            return;
        };
        let delay_ms = delay_ms.max(0);
        let due_ms = self.clock.elapsed_ms() + delay_ms;
        if let Some(tick) = &self.tick {
            if tick.due_ms <= due_ms {
                return;
            }
        }
        debug!(delay_ms, "Scheduling tick alarm");
        self.tick = Some(TickAlarm {
            due_ms,
            _timer: TimerHandle::post_after(
                self.tx.clone(),
                Duration::from_millis(delay_ms as u64),
                Message::Alarm,
            ),
        });
    }

    // Delivery and lookup helpers -----------------------------------------

    fn deliver_start(&self, job: &SyncJob) {
        self.link.start_sync(
            &job.app_id,
            job.account_id(),
            &job.job_name,
            job.kind.is_data_change(),
            &job.extras,
        );
    }

    fn deliver_cancel(&self, job: &SyncJob) {
        self.link.cancel_sync(
            &job.app_id,
            job.account_id(),
            &job.job_name,
            job.kind.is_data_change(),
            &job.extras,
        );
    }

    fn resolve_adapter(&self, package_id: &str) -> Result<String, SyncError> {
        self.adapters
            .resolve(package_id)
            .map(str::to_string)
            .ok_or_else(|| SyncError::SyncAdapterNotFound(package_id.to_string()))
    }

    fn resolve_account(&self, account_id: AccountId) -> Result<Option<AccountHandle>, SyncError> {
        if account_id == NO_ACCOUNT {
            return Ok(None);
        }
        self.accounts
            .resolve(account_id)
            .map(Some)
            .ok_or_else(|| SyncError::InvalidParameter(format!("unknown account {account_id}")))
    }

    /// Re-use the id of an already registered job of the same name
    /// (parameter reset), otherwise allocate a fresh one.
    fn existing_or_new_id(&mut self, package_id: &str, job_name: &str) -> Result<i32, SyncError> {
        if let Some(existing) = self.aggregator.get(package_id, job_name) {
            debug!(package_id, job_name, sync_job_id = existing.sync_job_id, "Resetting existing sync job");
            return Ok(existing.sync_job_id);
        }
        let id = self.aggregator.generate_id(package_id);
        if id > SYNC_JOB_LIMIT {
            counter!("syncd_quota_exceeded_total").increment(1);
            return Err(SyncError::QuotaExceeded);
        }
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_client_job(
        &self,
        app_id: &str,
        package_id: &str,
        job_name: &str,
        account: Option<AccountHandle>,
        capability: &str,
        mut extras: Bundle,
        reason: SyncReason,
        kind: JobKind,
    ) -> SyncJob {
        // Client-requested syncs bypass backoff and per-capability settings.
        extras.set_flag(keys::IGNORE_BACKOFF, true);
        extras.set_flag(keys::IGNORE_SETTINGS, true);

        let source = if extras.flag(keys::UPLOAD) {
            SyncSource::Local
        } else if capability.is_empty() {
            SyncSource::Poll
        } else {
            SyncSource::Server
        };

        self.repo
            .get_or_create_capability(app_id, account.as_ref(), capability);
        let backoff_ms = self
            .repo
            .get_backoff(account.as_ref(), capability)
            .filter(|b| b.is_active())
            .map(|b| b.time_ms)
            .unwrap_or(0);
        let delay_until_ms = self.repo.get_delay_until(account.as_ref(), capability);

        SyncJob::new(
            app_id,
            package_id,
            job_name,
            account,
            capability,
            extras,
            reason,
            source,
            kind,
            0,
            0,
            backoff_ms,
            delay_until_ms,
            false,
            self.clock.elapsed_ms(),
        )
    }
}

fn apply_sync_options(mut extras: Bundle, option: u32) -> Bundle {
    if option & sync_option::EXPEDITED != 0 {
        extras.set_flag(keys::EXPEDITED, true);
    }
    if option & sync_option::NO_RETRY != 0 {
        extras.set_flag(keys::NO_RETRY, true);
    }
    extras
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::account::LocalAccounts;
    use std::sync::Mutex;
    use tokio::sync::{mpsc, oneshot};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Delivery {
        Start(String),
        Cancel(String),
    }

    #[derive(Default)]
    struct RecordingLink {
        deliveries: Mutex<Vec<Delivery>>,
    }

    impl RecordingLink {
        fn deliveries(&self) -> Vec<Delivery> {
            self.deliveries.lock().unwrap().clone()
        }
    }

    impl AdapterLink for RecordingLink {
        fn start_sync(&self, app_id: &str, _: AccountId, _: &str, _: bool, _: &Bundle) {
            self.deliveries
                .lock()
                .unwrap()
                .push(Delivery::Start(app_id.to_string()));
        }

        fn cancel_sync(&self, app_id: &str, _: AccountId, _: &str, _: bool, _: &Bundle) {
            self.deliveries
                .lock()
                .unwrap()
                .push(Delivery::Cancel(app_id.to_string()));
        }
    }

    struct Harness {
        worker: SchedulerWorker,
        link: Arc<RecordingLink>,
        _dir: tempfile::TempDir,
        _rx: mpsc::UnboundedReceiver<Message>,
    }

    fn harness(tune: impl FnOnce(&mut AppConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        tune(&mut config);
        let (repo, pending, adapters) =
            RepositoryEngine::open(config.data_dir.clone()).unwrap();
        let link = Arc::new(RecordingLink::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SchedulerWorker::new(
            Arc::new(config),
            Clock::new(),
            Arc::new(repo),
            Arc::new(LocalAccounts),
            link.clone(),
            adapters,
            pending,
            tx,
        );
        Harness {
            worker,
            link,
            _dir: dir,
            _rx: rx,
        }
    }

    fn request(worker: &mut SchedulerWorker, kind: RequestKind) -> Result<RequestReply, SyncError> {
        let (reply, mut rx) = oneshot::channel();
        worker.handle_message(Message::Request(ClientRequest { kind, reply }));
        worker.dispatch_pass();
        rx.try_recv().expect("reply must be sent synchronously")
    }

    fn register(worker: &mut SchedulerWorker, package: &str, app: &str) {
        request(
            worker,
            RequestKind::RegisterAdapter {
                package_id: package.to_string(),
                service_app_id: app.to_string(),
            },
        )
        .unwrap();
    }

    fn add_on_demand(
        worker: &mut SchedulerWorker,
        package: &str,
        account_id: AccountId,
        name: &str,
        option: u32,
    ) -> Result<RequestReply, SyncError> {
        request(
            worker,
            RequestKind::AddOnDemand {
                package_id: package.to_string(),
                account_id,
                job_name: name.to_string(),
                sync_option: option,
                extras: Bundle::new(),
            },
        )
    }

    fn wifi_up(worker: &mut SchedulerWorker) {
        worker.handle_message(Message::ConstraintChanged(ConstraintEvent::Wifi(true)));
        worker.dispatch_pass();
    }

    #[tokio::test]
    async fn job_is_dispatched_when_constraints_allow() {
        let mut h = harness(|_| {});
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");

        let reply = add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();
        assert!(matches!(reply, RequestReply::JobId(1)));
        assert_eq!(h.link.deliveries(), vec![Delivery::Start("app.a".into())]);
        assert!(h.worker.active.contains_key("id:app.a"));
        assert!(h.worker.queue.is_empty());
    }

    #[tokio::test]
    async fn no_dispatch_without_network() {
        let mut h = harness(|_| {});
        register(&mut h.worker, "pkg.a", "app.a");
        add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();

        assert!(h.link.deliveries().is_empty());
        assert_eq!(h.worker.queue.len(), 1);

        wifi_up(&mut h.worker);
        assert_eq!(h.link.deliveries(), vec![Delivery::Start("app.a".into())]);
    }

    #[tokio::test]
    async fn expedited_preempts_oldest_regular_when_capacity_full() {
        let mut h = harness(|config| config.worker.max_regular_syncs = 1);
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");
        register(&mut h.worker, "pkg.b", "app.b");

        add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "regular", 0).unwrap();
        add_on_demand(
            &mut h.worker,
            "pkg.b",
            NO_ACCOUNT,
            "urgent",
            sync_option::EXPEDITED,
        )
        .unwrap();

        assert_eq!(
            h.link.deliveries(),
            vec![
                Delivery::Start("app.a".into()),
                Delivery::Cancel("app.a".into()),
                Delivery::Start("app.b".into()),
            ]
        );
        assert!(h.worker.active.contains_key("id:app.b"));
        assert!(!h.worker.active.contains_key("id:app.a"));
    }

    #[tokio::test]
    async fn expedited_candidate_steals_conflicting_key() {
        let mut h = harness(|_| {});
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");
        register(&mut h.worker, "pkg.b", "app.b");

        // Both jobs run for account 7 with no capability: identical keys.
        add_on_demand(&mut h.worker, "pkg.a", 7, "n1", 0).unwrap();
        assert_eq!(h.link.deliveries().len(), 1);

        add_on_demand(&mut h.worker, "pkg.b", 7, "n2", sync_option::EXPEDITED).unwrap();
        assert_eq!(
            h.link.deliveries(),
            vec![
                Delivery::Start("app.a".into()),
                Delivery::Cancel("app.a".into()),
                Delivery::Start("app.b".into()),
            ]
        );
    }

    #[tokio::test]
    async fn same_adapter_never_runs_two_jobs_at_once() {
        let mut h = harness(|_| {});
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");

        add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();
        add_on_demand(&mut h.worker, "pkg.a", 5, "n2", 0).unwrap();

        assert_eq!(h.link.deliveries(), vec![Delivery::Start("app.a".into())]);
        assert_eq!(h.worker.queue.len(), 1);
    }

    #[tokio::test]
    async fn pending_and_active_sets_never_share_a_key() {
        let mut h = harness(|_| {});
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");
        register(&mut h.worker, "pkg.b", "app.b");

        add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();
        add_on_demand(&mut h.worker, "pkg.b", NO_ACCOUNT, "n2", 0).unwrap();

        for pending in h.worker.queue.snapshot() {
            assert!(!h.worker.active.contains_key(&pending.key));
        }
    }

    #[tokio::test]
    async fn quota_exceeded_after_one_hundred_jobs() {
        let mut h = harness(|_| {});
        register(&mut h.worker, "pkg.a", "app.a");

        for i in 1..=SYNC_JOB_LIMIT {
            let reply =
                add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, &format!("job-{i}"), 0).unwrap();
            assert!(matches!(reply, RequestReply::JobId(id) if id == i));
        }
        let overflow = add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "one-too-many", 0);
        assert!(matches!(overflow, Err(SyncError::QuotaExceeded)));
    }

    #[tokio::test]
    async fn duplicate_job_name_returns_the_existing_id() {
        let mut h = harness(|_| {});
        register(&mut h.worker, "pkg.a", "app.a");

        let first = add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();
        let second = add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();
        match (first, second) {
            (RequestReply::JobId(a), RequestReply::JobId(b)) => assert_eq!(a, b),
            other => panic!("unexpected replies {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_adapter_is_rejected() {
        let mut h = harness(|_| {});
        let result = add_on_demand(&mut h.worker, "pkg.missing", NO_ACCOUNT, "n1", 0);
        assert!(matches!(result, Err(SyncError::SyncAdapterNotFound(_))));
    }

    #[tokio::test]
    async fn failure_applies_backoff_and_queues_a_retry() {
        let mut h = harness(|_| {});
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");
        add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();

        request(
            &mut h.worker,
            RequestKind::SendResult {
                package_id: "pkg.a".to_string(),
                job_name: "n1".to_string(),
                status: SyncStatus::Failure,
            },
        )
        .unwrap();

        let backoff = h.worker.repo.get_backoff(None, "").unwrap();
        assert_eq!(backoff.delay_ms, h.worker.config.worker.backoff_base_ms);
        // The retry is queued 10 s out; nothing new was dispatched yet.
        assert_eq!(h.worker.queue.len(), 1);
        assert!(h.worker.active.is_empty());
    }

    #[tokio::test]
    async fn no_retry_flag_suppresses_the_retry() {
        let mut h = harness(|_| {});
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");
        add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", sync_option::NO_RETRY).unwrap();

        request(
            &mut h.worker,
            RequestKind::SendResult {
                package_id: "pkg.a".to_string(),
                job_name: "n1".to_string(),
                status: SyncStatus::Failure,
            },
        )
        .unwrap();

        assert!(h.worker.queue.is_empty());
        assert!(h.worker.active.is_empty());
    }

    #[tokio::test]
    async fn success_clears_the_registration_and_backoff() {
        let mut h = harness(|_| {});
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");
        add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();

        request(
            &mut h.worker,
            RequestKind::SendResult {
                package_id: "pkg.a".to_string(),
                job_name: "n1".to_string(),
                status: SyncStatus::Success,
            },
        )
        .unwrap();

        assert!(h.worker.active.is_empty());
        let jobs = match request(
            &mut h.worker,
            RequestKind::GetAllJobs {
                package_id: "pkg.a".to_string(),
            },
        )
        .unwrap()
        {
            RequestReply::Jobs(jobs) => jobs,
            other => panic!("unexpected reply {other:?}"),
        };
        assert!(jobs.is_empty());
        assert!(!h.worker.repo.get_backoff(None, "").unwrap().is_active());
    }

    #[tokio::test]
    async fn sync_status_off_pauses_dispatch() {
        let mut h = harness(|_| {});
        wifi_up(&mut h.worker);
        register(&mut h.worker, "pkg.a", "app.a");

        request(
            &mut h.worker,
            RequestKind::SetSyncEnabled { enabled: false },
        )
        .unwrap();
        add_on_demand(&mut h.worker, "pkg.a", NO_ACCOUNT, "n1", 0).unwrap();
        assert!(h.link.deliveries().is_empty());

        request(&mut h.worker, RequestKind::SetSyncEnabled { enabled: true }).unwrap();
        assert_eq!(h.link.deliveries(), vec![Delivery::Start("app.a".into())]);
    }
}
