//! Per-package sync-job bookkeeping: stable 1..=100 job-id allocation and
//! the name/id maps handed back to clients.

use std::collections::BTreeMap;

use tracing::debug;

use crate::bundle::Bundle;
use crate::models::AccountId;

/// Ids above this are never handed out; the allocator returns
/// `SYNC_JOB_LIMIT + 1` as the quota-exceeded sentinel.
pub const SYNC_JOB_LIMIT: i32 = 100;

/// Kind-specific part of a registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    OnDemand,
    Periodic { period_sec: i64 },
    DataChange { capability: String },
}

/// One registered sync job of a package.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub sync_job_id: i32,
    pub job_name: String,
    pub account_id: AccountId,
    pub extras: Bundle,
    pub sync_option: u32,
    pub kind: EntryKind,
    /// Conflict key of the SyncJob this entry materializes as.
    pub key: String,
}

/// Job bookkeeping for one package: name↔id maps plus the id bitmap.
#[derive(Debug)]
pub struct JobsInfo {
    package_id: String,
    by_name: BTreeMap<String, JobEntry>,
    id_to_name: BTreeMap<i32, String>,
    // Index 0 is reserved and never allocated.
    id_used: [bool; (SYNC_JOB_LIMIT + 1) as usize],
}

impl JobsInfo {
    fn new(package_id: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            by_name: BTreeMap::new(),
            id_to_name: BTreeMap::new(),
            id_used: [false; (SYNC_JOB_LIMIT + 1) as usize],
        }
    }

    /// Lowest unset id in 1..=SYNC_JOB_LIMIT, or the quota sentinel.
    fn next_id(&self) -> i32 {
        for id in 1..=SYNC_JOB_LIMIT {
            if !self.id_used[id as usize] {
                return id;
            }
        }
        SYNC_JOB_LIMIT + 1
    }

    fn add(&mut self, entry: JobEntry) {
        debug!(
            package_id = %self.package_id,
            job_name = %entry.job_name,
            sync_job_id = entry.sync_job_id,
            "Registered sync job"
        );
        self.id_used[entry.sync_job_id as usize] = true;
        self.id_to_name
            .insert(entry.sync_job_id, entry.job_name.clone());
        self.by_name.insert(entry.job_name.clone(), entry);
    }

    fn remove_by_name(&mut self, name: &str) -> Option<JobEntry> {
        let entry = self.by_name.remove(name)?;
        self.id_used[entry.sync_job_id as usize] = false;
        self.id_to_name.remove(&entry.sync_job_id);
        Some(entry)
    }

    fn count(&self) -> usize {
        self.by_name.len()
    }
}

/// Aggregates the per-package [`JobsInfo`] handles.
#[derive(Debug, Default)]
pub struct JobIdAggregator {
    packages: BTreeMap<String, JobsInfo>,
}

impl JobIdAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next free id for the package, creating its bookkeeping
    /// on first use. Returns a value above [`SYNC_JOB_LIMIT`] when the pool
    /// is exhausted.
    pub fn generate_id(&mut self, package_id: &str) -> i32 {
        self.packages
            .entry(package_id.to_string())
            .or_insert_with(|| JobsInfo::new(package_id))
            .next_id()
    }

    pub fn add(&mut self, package_id: &str, entry: JobEntry) {
        self.packages
            .entry(package_id.to_string())
            .or_insert_with(|| JobsInfo::new(package_id))
            .add(entry);
    }

    pub fn get(&self, package_id: &str, job_name: &str) -> Option<&JobEntry> {
        self.packages.get(package_id)?.by_name.get(job_name)
    }

    pub fn get_mut(&mut self, package_id: &str, job_name: &str) -> Option<&mut JobEntry> {
        self.packages.get_mut(package_id)?.by_name.get_mut(job_name)
    }

    pub fn get_by_id(&self, package_id: &str, sync_job_id: i32) -> Option<&JobEntry> {
        let info = self.packages.get(package_id)?;
        let name = info.id_to_name.get(&sync_job_id)?;
        info.by_name.get(name)
    }

    /// Remove a job by id, freeing its bit. Empty packages are dropped.
    pub fn remove_by_id(&mut self, package_id: &str, sync_job_id: i32) -> Option<JobEntry> {
        let info = self.packages.get_mut(package_id)?;
        let name = info.id_to_name.get(&sync_job_id)?.clone();
        let entry = info.remove_by_name(&name);
        if info.count() == 0 {
            self.packages.remove(package_id);
        }
        entry
    }

    pub fn remove_by_name(&mut self, package_id: &str, job_name: &str) -> Option<JobEntry> {
        let info = self.packages.get_mut(package_id)?;
        let entry = info.remove_by_name(job_name);
        if info.count() == 0 {
            self.packages.remove(package_id);
        }
        entry
    }

    /// Drop every job of an uninstalled package, returning the removed
    /// entries for queue/repository cleanup.
    pub fn remove_package(&mut self, package_id: &str) -> Vec<JobEntry> {
        self.packages
            .remove(package_id)
            .map(|info| info.by_name.into_values().collect())
            .unwrap_or_default()
    }

    /// All registered jobs of a package, ordered by id.
    pub fn jobs_for_package(&self, package_id: &str) -> Vec<&JobEntry> {
        let Some(info) = self.packages.get(package_id) else {
            return Vec::new();
        };
        info.id_to_name
            .values()
            .filter_map(|name| info.by_name.get(name))
            .collect()
    }
}
