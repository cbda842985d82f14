//! Persistent capability records, their periodic sync entries, and the
//! per-capability status tracked across restarts.

use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::models::account::{AccountHandle, AccountId, NO_ACCOUNT};

/// Sentinel meaning "no backoff applied".
pub const NOT_IN_BACKOFF: i64 = -1;

/// Internal floor for periodic sync intervals, seconds.
pub const MIN_PERIOD_SEC: i64 = 300;

const DEFAULT_PERIOD_SEC: i64 = 24 * 60 * 60;
const DEFAULT_FLEX_PERCENT: f64 = 0.04;
const DEFAULT_MIN_FLEX_ALLOWED_SEC: i64 = 5;

/// Per-capability exponential backoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Absolute elapsed-ms before which no retry runs.
    pub time_ms: i64,
    /// Current delay, doubled on each failure.
    pub delay_ms: i64,
}

impl Backoff {
    pub fn none() -> Self {
        Self {
            time_ms: NOT_IN_BACKOFF,
            delay_ms: NOT_IN_BACKOFF,
        }
    }

    pub fn is_active(&self) -> bool {
        self.time_ms != NOT_IN_BACKOFF
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::none()
    }
}

/// A registered periodic sync schedule, persisted inside its capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicSync {
    pub job_name: String,
    pub period_sec: i64,
    pub flex_sec: i64,
    pub extras: Bundle,
}

impl PeriodicSync {
    /// Clamp the requested period to the internal floor and derive the
    /// default flex window.
    pub fn new(job_name: impl Into<String>, period_sec: i64, extras: Bundle) -> Self {
        let period_sec = clamp_period_sec(period_sec);
        Self {
            job_name: job_name.into(),
            period_sec,
            flex_sec: default_flex_sec(period_sec),
            extras,
        }
    }

    /// Two entries describe the same periodic sync when period and extras
    /// bag match; account and capability are fixed by the owning record.
    pub fn same_schedule(&self, other: &PeriodicSync) -> bool {
        self.period_sec == other.period_sec && self.extras == other.extras
    }
}

pub fn clamp_period_sec(period_sec: i64) -> i64 {
    period_sec.max(MIN_PERIOD_SEC)
}

/// Default flex is 4% of the period, at least zero, and never derived from
/// more than one day.
pub fn default_flex_sec(period_sec: i64) -> i64 {
    if period_sec < DEFAULT_MIN_FLEX_ALLOWED_SEC {
        0
    } else if period_sec < DEFAULT_PERIOD_SEC {
        (period_sec as f64 * DEFAULT_FLEX_PERCENT) as i64
    } else {
        (DEFAULT_PERIOD_SEC as f64 * DEFAULT_FLEX_PERCENT) as i64
    }
}

/// Persistent record for one `(account, capability)` pair, or one app for
/// account-less jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub id: i32,
    pub app_id: String,
    pub account: Option<AccountHandle>,
    pub capability: String,
    /// Automatic sync enabled for this capability.
    pub enabled: bool,
    /// `-1` unknown, `0` not syncable, `1` syncable.
    pub syncable: i32,
    pub backoff: Backoff,
    pub delay_until_ms: i64,
    pub periodic_syncs: Vec<PeriodicSync>,
}

impl CapabilityInfo {
    pub fn new(
        id: i32,
        app_id: impl Into<String>,
        account: Option<AccountHandle>,
        capability: impl Into<String>,
    ) -> Self {
        Self {
            id,
            app_id: app_id.into(),
            account,
            capability: capability.into(),
            enabled: true,
            syncable: -1,
            backoff: Backoff::none(),
            delay_until_ms: 0,
            periodic_syncs: Vec::new(),
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.account.as_ref().map_or(NO_ACCOUNT, |a| a.id)
    }

    /// Identity used for lookup: `(account_id, user_name, capability)` when
    /// an account is present, the app id otherwise.
    pub fn matches(&self, account: Option<&AccountHandle>, capability: &str) -> bool {
        match (&self.account, account) {
            (Some(own), Some(other)) => own == other && self.capability == capability,
            (None, None) => self.capability == capability,
            _ => false,
        }
    }
}

/// Mirror of a capability's periodic last-run times, wall-clock ms. Index
/// `i` matches `periodic_syncs[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusInfo {
    pub capability_id: i32,
    pub periodic_sync_times: Vec<i64>,
}

impl SyncStatusInfo {
    pub fn new(capability_id: i32) -> Self {
        Self {
            capability_id,
            periodic_sync_times: Vec::new(),
        }
    }

    /// Missing entries default to 0 (never run).
    pub fn periodic_sync_time(&self, index: usize) -> i64 {
        self.periodic_sync_times.get(index).copied().unwrap_or(0)
    }

    pub fn set_periodic_sync_time(&mut self, index: usize, wall_ms: i64) {
        if self.periodic_sync_times.len() <= index {
            self.periodic_sync_times.resize(index + 1, 0);
        }
        self.periodic_sync_times[index] = wall_ms;
    }

    pub fn remove_periodic_sync_time(&mut self, index: usize) {
        if index < self.periodic_sync_times.len() {
            self.periodic_sync_times.remove(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_is_clamped_to_the_internal_floor() {
        assert_eq!(clamp_period_sec(100), 300);
        assert_eq!(clamp_period_sec(300), 300);
        assert_eq!(clamp_period_sec(1800), 1800);
    }

    #[test]
    fn default_flex_is_four_percent_capped_at_one_day() {
        assert_eq!(default_flex_sec(600), 24);
        assert_eq!(default_flex_sec(3), 0);
        assert_eq!(default_flex_sec(7 * 24 * 60 * 60), 3456);
    }

    #[test]
    fn periodic_equality_is_period_plus_extras_bag() {
        let mut extras = Bundle::new();
        extras.set("k", "v");
        let a = PeriodicSync::new("n", 600, extras.clone());
        let b = PeriodicSync::new("other-name", 600, extras);
        let c = PeriodicSync::new("n", 900, Bundle::new());
        assert!(a.same_schedule(&b));
        assert!(!a.same_schedule(&c));
    }

    #[test]
    fn status_times_default_to_zero_and_grow_on_demand() {
        let mut status = SyncStatusInfo::new(4);
        assert_eq!(status.periodic_sync_time(2), 0);
        status.set_periodic_sync_time(2, 1234);
        assert_eq!(status.periodic_sync_times.len(), 3);
        assert_eq!(status.periodic_sync_time(2), 1234);
        status.remove_periodic_sync_time(0);
        assert_eq!(status.periodic_sync_time(1), 1234);
    }

    #[test]
    fn capability_lookup_matches_account_and_capability() {
        let account = AccountHandle::new(1, "alice");
        let cap = CapabilityInfo::new(0, "app", Some(account.clone()), "calendar");
        assert!(cap.matches(Some(&account), "calendar"));
        assert!(!cap.matches(Some(&account), "contact"));
        assert!(!cap.matches(None, "calendar"));

        let accountless = CapabilityInfo::new(1, "app", None, "");
        assert!(accountless.matches(None, ""));
    }
}
