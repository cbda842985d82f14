//! The central [`SyncJob`] entity and its scheduling arithmetic.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::bundle::{keys, Bundle};
use crate::models::account::{AccountHandle, AccountId, NO_ACCOUNT};

/// Sync option bitfield accepted on the request surface.
pub mod sync_option {
    pub const NONE: u32 = 0;
    pub const EXPEDITED: u32 = 0x01;
    pub const NO_RETRY: u32 = 0x02;
}

/// Why a sync job was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    UserInitiated,
    DataSettingsChanged,
    Periodic,
    ServiceChanged,
    AccountUpdated,
    AutoSync,
    DeviceDataChanged,
}

/// Who initiated the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    User,
    Server,
    Periodic,
    Poll,
    Local,
}

/// Result reported by an adapter for a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Cancelled,
    AlreadyInProgress,
    Failure,
    Unknown,
}

impl SyncStatus {
    /// Wire codes used by adapters: `0, -1, -2, -3`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => SyncStatus::Success,
            -1 => SyncStatus::Cancelled,
            -2 => SyncStatus::AlreadyInProgress,
            -3 => SyncStatus::Failure,
            _ => SyncStatus::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            SyncStatus::Success => 0,
            SyncStatus::Cancelled => -1,
            SyncStatus::AlreadyInProgress => -2,
            SyncStatus::Failure => -3,
            SyncStatus::Unknown => -4,
        }
    }
}

/// What kind of request produced the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobKind {
    OnDemand,
    Periodic { period_sec: i64, flex_sec: i64 },
    DataChange { capability: String },
}

impl JobKind {
    pub fn is_data_change(&self) -> bool {
        matches!(self, JobKind::DataChange { .. })
    }
}

/// A requested unit of sync work, from submission until dispatch completes.
///
/// All times are absolute monotonic elapsed-milliseconds unless stated
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Service app id of the owning adapter.
    pub app_id: String,
    /// Client package that requested the job.
    pub package_id: String,
    /// Client-chosen job name; for data-change jobs this is the capability URI.
    pub job_name: String,
    /// Per-package job id handed back to the client, `0` if none assigned.
    pub sync_job_id: i32,
    pub account: Option<AccountHandle>,
    /// Data domain, possibly empty for account-less or named jobs.
    pub capability: String,
    pub extras: Bundle,
    pub reason: SyncReason,
    pub source: SyncSource,
    pub kind: JobKind,
    /// If false, two jobs sharing a key conflict.
    pub parallel_allowed: bool,
    pub is_expedited: bool,
    /// Requested earliest run time.
    pub latest_run_time_ms: i64,
    /// Absolute earliest retry time while backed off, `0` otherwise.
    pub backoff_ms: i64,
    /// Absolute minimum run time, `0` if unset.
    pub delay_until_ms: i64,
    /// Allowable pull-forward window.
    pub flex_ms: i64,
    /// Derived run time, see [`SyncJob::update_effective_run_time`].
    pub effective_run_time_ms: i64,
    /// Identity for conflict detection.
    pub key: String,
}

#[allow(clippy::too_many_arguments)]
impl SyncJob {
    /// Build a job scheduled `run_after_ms` from `now_ms`. Expedited jobs
    /// (via extras) run immediately with no flex window.
    pub fn new(
        app_id: impl Into<String>,
        package_id: impl Into<String>,
        job_name: impl Into<String>,
        account: Option<AccountHandle>,
        capability: impl Into<String>,
        extras: Bundle,
        reason: SyncReason,
        source: SyncSource,
        kind: JobKind,
        run_after_ms: i64,
        flex_ms: i64,
        backoff_ms: i64,
        delay_until_ms: i64,
        parallel_allowed: bool,
        now_ms: i64,
    ) -> Self {
        let app_id = app_id.into();
        let capability = capability.into();
        let is_expedited = extras.flag(keys::EXPEDITED) || run_after_ms < 0;
        let (latest_run_time_ms, flex_ms) = if is_expedited {
            (now_ms, 0)
        } else {
            (now_ms + run_after_ms, flex_ms)
        };

        let key = Self::make_key(account.as_ref(), &app_id, &capability);
        let mut job = Self {
            app_id,
            package_id: package_id.into(),
            job_name: job_name.into(),
            sync_job_id: 0,
            account,
            capability,
            extras,
            reason,
            source,
            kind,
            parallel_allowed,
            is_expedited,
            latest_run_time_ms,
            backoff_ms,
            delay_until_ms,
            flex_ms,
            effective_run_time_ms: 0,
            key,
        };
        job.update_effective_run_time();
        job
    }

    /// Canonical conflict-detection key.
    pub fn make_key(account: Option<&AccountHandle>, app_id: &str, capability: &str) -> String {
        match account {
            Some(account) => format!(
                "id:{}name:{}capability:{}",
                account.id, account.user_name, capability
            ),
            None => format!("id:{}", app_id),
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.account.as_ref().map_or(NO_ACCOUNT, |a| a.id)
    }

    pub fn is_initialized(&self) -> bool {
        self.extras.flag(keys::INITIALIZE)
    }

    pub fn ignore_backoff(&self) -> bool {
        self.extras.flag(keys::IGNORE_BACKOFF)
    }

    pub fn ignore_settings(&self) -> bool {
        self.extras.flag(keys::IGNORE_SETTINGS)
    }

    pub fn no_retry(&self) -> bool {
        self.extras.flag(keys::NO_RETRY)
    }

    /// Re-derive `effective_run_time_ms`; call after mutating any of the
    /// inputs.
    pub fn update_effective_run_time(&mut self) {
        self.effective_run_time_ms = if self.ignore_backoff() {
            self.latest_run_time_ms
        } else {
            self.latest_run_time_ms
                .max(self.delay_until_ms)
                .max(self.backoff_ms)
        };
    }

    /// Earliest instant the job's flex window opens.
    pub fn window_start_ms(&self) -> i64 {
        (self.effective_run_time_ms - self.flex_ms).max(0)
    }

    /// Dispatch ordering: expedited strictly first, then ascending window
    /// start.
    pub fn dispatch_cmp(&self, other: &Self) -> Ordering {
        match (self.is_expedited, other.is_expedited) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => self.window_start_ms().cmp(&other.window_start_ms()),
        }
    }
}

/// Account equality used across the scheduler: both absent, or both present
/// with equal `(id, user_name)`.
pub fn accounts_equal(a: Option<&AccountHandle>, b: Option<&AccountHandle>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
