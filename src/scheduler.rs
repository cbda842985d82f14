//! # Periodic Scheduler
//!
//! Decides which registered periodic syncs are ripe on each dispatcher
//! tick and computes the polling horizon for the next alarm. The persisted
//! random offset spreads the modulo-period boundaries across installations.

use crate::models::capability::{CapabilityInfo, PeriodicSync, SyncStatusInfo};

/// Inputs of the ripeness decision for one periodic entry, all wall-clock
/// milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct RipenessInputs {
    pub now_wall_ms: i64,
    pub random_offset_ms: i64,
    pub period_ms: i64,
    pub flex_ms: i64,
    pub last_run_ms: i64,
}

/// A periodic sync is ripe when any of these holds: the early-start window
/// is open, the shifted clock sits exactly on a period boundary, the wall
/// clock moved backward past the last run, or a full period has elapsed
/// since the last run.
pub fn is_ripe(inputs: RipenessInputs) -> bool {
    let RipenessInputs {
        now_wall_ms,
        random_offset_ms,
        period_ms,
        flex_ms,
        last_run_ms,
    } = inputs;
    if period_ms <= 0 {
        return false;
    }

    let shifted = (now_wall_ms - random_offset_ms).max(0);
    let remaining = period_ms - (shifted % period_ms);
    let since_last = now_wall_ms - last_run_ms;
    let can_start_early = remaining <= flex_ms && since_last > period_ms - flex_ms;

    can_start_early
        || remaining == period_ms
        || last_run_ms > now_wall_ms
        || since_last >= period_ms
}

/// One periodic entry found ripe during a scheduling pass.
#[derive(Debug, Clone)]
pub struct RipeEntry {
    pub capability: CapabilityInfo,
    pub entry: PeriodicSync,
    pub index: usize,
}

/// Outcome of one scheduling pass over the capability snapshot.
#[derive(Debug)]
pub struct PeriodicPass {
    pub ripe: Vec<RipeEntry>,
    /// Delay until the earliest future periodic run, `None` when nothing is
    /// registered.
    pub next_poll_delay_ms: Option<i64>,
}

/// Periodic-sync alarm bookkeeping.
#[derive(Debug, Clone)]
pub struct PeriodicScheduler {
    random_offset_ms: i64,
}

impl PeriodicScheduler {
    pub fn new(random_offset_sec: i64) -> Self {
        Self {
            random_offset_ms: random_offset_sec * 1000,
        }
    }

    /// Walk the capability snapshot and split it into entries that must be
    /// enqueued now and the horizon for the next alarm. `eligible` filters
    /// capabilities by settings and account state; ineligible capabilities
    /// contribute nothing to the horizon.
    pub fn run_pass(
        &self,
        snapshot: &[(CapabilityInfo, SyncStatusInfo)],
        now_wall_ms: i64,
        mut eligible: impl FnMut(&CapabilityInfo) -> bool,
    ) -> PeriodicPass {
        let mut ripe = Vec::new();
        let mut earliest_next_run: Option<i64> = None;

        for (capability, status) in snapshot {
            if capability.periodic_syncs.is_empty() {
                continue;
            }
            if !eligible(capability) {
                continue;
            }

            for (index, entry) in capability.periodic_syncs.iter().enumerate() {
                let period_ms = entry.period_sec * 1000;
                if period_ms <= 0 {
                    continue;
                }
                let inputs = RipenessInputs {
                    now_wall_ms,
                    random_offset_ms: self.random_offset_ms,
                    period_ms,
                    flex_ms: entry.flex_sec * 1000,
                    last_run_ms: status.periodic_sync_time(index),
                };
                if is_ripe(inputs) {
                    ripe.push(RipeEntry {
                        capability: capability.clone(),
                        entry: entry.clone(),
                        index,
                    });
                }

                let next_run = now_wall_ms + period_ms;
                earliest_next_run = Some(match earliest_next_run {
                    Some(current) => current.min(next_run),
                    None => next_run,
                });
            }
        }

        PeriodicPass {
            ripe,
            next_poll_delay_ms: earliest_next_run.map(|t| (t - now_wall_ms).max(0)),
        }
    }
}
