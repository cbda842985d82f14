//! # Repository Engine
//!
//! The sole persistence authority of the scheduler. Owns the capability
//! table, the per-capability periodic status, and flushes the pending-job
//! and adapter tables on explicit save points: load at startup, save after
//! any successful periodic/backoff mutation, save at shutdown.
//!
//! All mutating operations serialize under one internal mutex; reads hand
//! out deep copies so the dispatcher never iterates shared state.

pub mod persist;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::adapters::AdapterRegistry;
use crate::models::account::AccountHandle;
use crate::models::capability::{Backoff, CapabilityInfo, PeriodicSync, SyncStatusInfo};
use crate::models::SyncJob;

const SECONDS_PER_DAY: i64 = 86_400;

struct Inner {
    next_capability_id: i32,
    random_offset_sec: i64,
    capabilities: BTreeMap<i32, CapabilityInfo>,
    status: BTreeMap<i32, SyncStatusInfo>,
}

/// Persistent store for capabilities, status, pending jobs, and the
/// adapter registry.
pub struct RepositoryEngine {
    inner: Mutex<Inner>,
    data_dir: PathBuf,
}

impl RepositoryEngine {
    /// Load persisted state from `data_dir`, creating the directory and
    /// drawing the random alarm offset on first initialization. Returns the
    /// engine plus the reloaded pending jobs and adapter registry.
    pub fn open(data_dir: PathBuf) -> io::Result<(Self, Vec<SyncJob>, AdapterRegistry)> {
        fs::create_dir_all(&data_dir)?;

        let (next_capability_id, mut random_offset_sec, capabilities) =
            match persist::read_accounts(&data_dir) {
                Some(file) => {
                    let capabilities: BTreeMap<i32, CapabilityInfo> = file
                        .capabilities
                        .into_iter()
                        .map(CapabilityInfo::from)
                        .map(|cap| (cap.id, cap))
                        .collect();
                    let max_id = capabilities.keys().max().copied().unwrap_or(-1);
                    (
                        file.next_capability_id.max(max_id + 1),
                        file.random_offset_sec,
                        capabilities,
                    )
                }
                None => (0, 0, BTreeMap::new()),
            };

        if random_offset_sec == 0 {
            random_offset_sec = rand::thread_rng().gen_range(0..SECONDS_PER_DAY);
            debug!(random_offset_sec, "Drew random periodic-sync offset");
        }

        let known_ids: BTreeSet<i32> = capabilities.keys().copied().collect();
        let status = persist::read_status(&data_dir, &known_ids);
        let jobs = persist::read_jobs(&data_dir);
        let adapters = persist::read_adapters(&data_dir);

        info!(
            capabilities = capabilities.len(),
            pending_jobs = jobs.len(),
            adapters = adapters.len(),
            "Repository loaded"
        );

        let engine = Self {
            inner: Mutex::new(Inner {
                next_capability_id,
                random_offset_sec,
                capabilities,
                status,
            }),
            data_dir,
        };
        engine.with_inner(|inner| Self::persist_accounts(&engine.data_dir, inner));

        Ok((engine, jobs, adapters))
    }

    pub fn random_offset_sec(&self) -> i64 {
        self.with_inner(|inner| inner.random_offset_sec)
    }

    /// Find or create the record for `(account, capability)` (or for the
    /// app when account-less), returning its id.
    pub fn get_or_create_capability(
        &self,
        app_id: &str,
        account: Option<&AccountHandle>,
        capability: &str,
    ) -> i32 {
        self.with_inner(|inner| {
            if let Some(cap) = Self::find(inner, account, capability) {
                return cap.id;
            }
            let id = inner.next_capability_id;
            inner.next_capability_id += 1;
            debug!(app_id, capability, id, "Creating capability record");
            inner
                .capabilities
                .insert(id, CapabilityInfo::new(id, app_id, account.cloned(), capability));
            inner.status.insert(id, SyncStatusInfo::new(id));
            Self::persist_accounts(&self.data_dir, inner);
            id
        })
    }

    pub fn get_backoff(&self, account: Option<&AccountHandle>, capability: &str) -> Option<Backoff> {
        self.with_inner(|inner| Self::find(inner, account, capability).map(|cap| cap.backoff))
    }

    pub fn get_delay_until(&self, account: Option<&AccountHandle>, capability: &str) -> i64 {
        self.with_inner(|inner| {
            Self::find(inner, account, capability)
                .map(|cap| cap.delay_until_ms)
                .unwrap_or(0)
        })
    }

    /// Record a new backoff pair for the capability, creating the record if
    /// this is its first mention.
    pub fn set_backoff(
        &self,
        app_id: &str,
        account: Option<&AccountHandle>,
        capability: &str,
        time_ms: i64,
        delay_ms: i64,
    ) {
        self.with_inner(|inner| {
            let id = match Self::find(inner, account, capability) {
                Some(cap) => cap.id,
                None => {
                    let id = inner.next_capability_id;
                    inner.next_capability_id += 1;
                    inner.capabilities.insert(
                        id,
                        CapabilityInfo::new(id, app_id, account.cloned(), capability),
                    );
                    inner.status.insert(id, SyncStatusInfo::new(id));
                    id
                }
            };
            if let Some(cap) = inner.capabilities.get_mut(&id) {
                cap.backoff = Backoff { time_ms, delay_ms };
            }
            Self::persist_accounts(&self.data_dir, inner);
        });
    }

    /// Reset every capability's backoff to the sentinel in one step.
    pub fn clear_all_backoffs(&self) {
        self.with_inner(|inner| {
            for cap in inner.capabilities.values_mut() {
                cap.backoff = Backoff::none();
            }
            Self::persist_accounts(&self.data_dir, inner);
        });
    }

    /// Add a periodic sync under `(account, capability)`. An entry with the
    /// same job name is replaced in place (parameter reset); an entry with
    /// an identical schedule is left alone.
    pub fn add_periodic(
        &self,
        app_id: &str,
        account: Option<&AccountHandle>,
        capability: &str,
        periodic: PeriodicSync,
    ) -> i32 {
        self.with_inner(|inner| {
            let id = match Self::find(inner, account, capability) {
                Some(cap) => cap.id,
                None => {
                    let id = inner.next_capability_id;
                    inner.next_capability_id += 1;
                    inner.capabilities.insert(
                        id,
                        CapabilityInfo::new(id, app_id, account.cloned(), capability),
                    );
                    inner.status.insert(id, SyncStatusInfo::new(id));
                    id
                }
            };
            let Some(cap) = inner.capabilities.get_mut(&id) else {
                return id;
            };
            if let Some(existing) = cap
                .periodic_syncs
                .iter_mut()
                .find(|p| p.job_name == periodic.job_name)
            {
                *existing = periodic;
            } else if !cap.periodic_syncs.iter().any(|p| p.same_schedule(&periodic)) {
                cap.periodic_syncs.push(periodic);
            }
            let len = cap.periodic_syncs.len();
            inner
                .status
                .entry(id)
                .or_insert_with(|| SyncStatusInfo::new(id))
                .periodic_sync_times
                .resize(len, 0);
            Self::persist_accounts(&self.data_dir, inner);
            id
        })
    }

    /// Remove the named periodic sync; drops its last-run slot as well.
    /// Returns false when nothing matched.
    pub fn remove_periodic(
        &self,
        account: Option<&AccountHandle>,
        capability: &str,
        job_name: &str,
    ) -> bool {
        self.with_inner(|inner| {
            let Some(id) = Self::find(inner, account, capability).map(|cap| cap.id) else {
                return false;
            };
            let Some(cap) = inner.capabilities.get_mut(&id) else {
                return false;
            };
            let Some(index) = cap
                .periodic_syncs
                .iter()
                .position(|p| p.job_name == job_name)
            else {
                return false;
            };
            cap.periodic_syncs.remove(index);
            if let Some(status) = inner.status.get_mut(&id) {
                status.remove_periodic_sync_time(index);
            }
            Self::persist_accounts(&self.data_dir, inner);
            true
        })
    }

    pub fn get_periodic_sync_time(&self, capability_id: i32, index: usize) -> i64 {
        self.with_inner(|inner| {
            inner
                .status
                .get(&capability_id)
                .map(|status| status.periodic_sync_time(index))
                .unwrap_or(0)
        })
    }

    pub fn set_periodic_sync_time(&self, capability_id: i32, index: usize, wall_ms: i64) {
        self.with_inner(|inner| {
            inner
                .status
                .entry(capability_id)
                .or_insert_with(|| SyncStatusInfo::new(capability_id))
                .set_periodic_sync_time(index, wall_ms);
            Self::persist_accounts(&self.data_dir, inner);
        });
    }

    /// Deep copies of every capability/status pair, status created on
    /// demand so the vectors always line up.
    pub fn get_copy_of_all_capabilities_and_status(
        &self,
    ) -> Vec<(CapabilityInfo, SyncStatusInfo)> {
        self.with_inner(|inner| {
            let ids: Vec<i32> = inner.capabilities.keys().copied().collect();
            ids.into_iter()
                .map(|id| {
                    let cap = inner.capabilities[&id].clone();
                    let status = inner
                        .status
                        .entry(id)
                        .or_insert_with(|| SyncStatusInfo::new(id))
                        .clone();
                    (cap, status)
                })
                .collect()
        })
    }

    pub fn set_syncable(
        &self,
        app_id: &str,
        account: Option<&AccountHandle>,
        capability: &str,
        syncable: i32,
    ) {
        self.with_inner(|inner| {
            let id = match Self::find(inner, account, capability) {
                Some(cap) => cap.id,
                None => {
                    let id = inner.next_capability_id;
                    inner.next_capability_id += 1;
                    inner.capabilities.insert(
                        id,
                        CapabilityInfo::new(id, app_id, account.cloned(), capability),
                    );
                    inner.status.insert(id, SyncStatusInfo::new(id));
                    id
                }
            };
            if let Some(cap) = inner.capabilities.get_mut(&id) {
                cap.syncable = syncable;
            }
            Self::persist_accounts(&self.data_dir, inner);
        });
    }

    /// `-1` unknown, `0` not syncable, `1` syncable.
    pub fn get_syncable(&self, account: Option<&AccountHandle>, capability: &str) -> i32 {
        self.with_inner(|inner| {
            Self::find(inner, account, capability)
                .map(|cap| cap.syncable)
                .unwrap_or(-1)
        })
    }

    /// Automatic-sync setting for the capability; unknown pairs default to
    /// enabled.
    pub fn get_sync_automatically(
        &self,
        account: Option<&AccountHandle>,
        capability: &str,
    ) -> bool {
        self.with_inner(|inner| {
            Self::find(inner, account, capability)
                .map(|cap| cap.enabled)
                .unwrap_or(true)
        })
    }

    /// Drop every capability and status record owned by the given adapter
    /// app (package uninstall).
    pub fn cleanup(&self, app_id: &str) {
        self.with_inner(|inner| {
            let removed: Vec<i32> = inner
                .capabilities
                .values()
                .filter(|cap| cap.app_id == app_id)
                .map(|cap| cap.id)
                .collect();
            for id in &removed {
                inner.capabilities.remove(id);
                inner.status.remove(id);
            }
            if !removed.is_empty() {
                info!(app_id, count = removed.len(), "Removed capabilities for uninstalled app");
                Self::persist_accounts(&self.data_dir, inner);
            }
        });
    }

    /// Flush adapter registrations (kept current on register/unregister).
    pub fn save_adapters(&self, adapters: &AdapterRegistry) {
        if let Err(err) = persist::write_adapters(&self.data_dir, adapters) {
            warn!(error = %err, "Failed to persist adapter registry");
        }
    }

    /// Full state flush: accounts, status, pending jobs, adapters.
    pub fn save_current_state(&self, pending: &[SyncJob], adapters: &AdapterRegistry) {
        self.with_inner(|inner| Self::persist_accounts(&self.data_dir, inner));
        if let Err(err) = persist::write_jobs(&self.data_dir, pending) {
            warn!(error = %err, "Failed to persist pending jobs");
        }
        self.save_adapters(adapters);
    }

    fn find<'a>(
        inner: &'a Inner,
        account: Option<&AccountHandle>,
        capability: &str,
    ) -> Option<&'a CapabilityInfo> {
        inner
            .capabilities
            .values()
            .find(|cap| cap.matches(account, capability))
    }

    fn persist_accounts(data_dir: &std::path::Path, inner: &mut Inner) {
        if let Err(err) = persist::write_accounts(
            data_dir,
            inner.next_capability_id,
            inner.random_offset_sec,
            &inner.capabilities,
        ) {
            warn!(error = %err, "Failed to persist capability table");
        }
        if let Err(err) = persist::write_status(data_dir, &inner.status) {
            warn!(error = %err, "Failed to persist status log");
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }
}
