//! On-disk layout of the scheduler state: three JSON documents plus the
//! ASCII periodic-status log.
//!
//! `statusinfo.bin` keeps the historical record format
//! `<cap_id> <N> <t0> <t1> … <tN-1>` with records separated by `#`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::AdapterRegistry;
use crate::bundle::Bundle;
use crate::models::account::{AccountHandle, AccountId, NO_ACCOUNT};
use crate::models::capability::{Backoff, CapabilityInfo, PeriodicSync, SyncStatusInfo};
use crate::models::SyncJob;

pub const ACCOUNTS_FILE: &str = "accounts.json";
pub const JOBS_FILE: &str = "syncjobs.json";
pub const ADAPTERS_FILE: &str = "sync-adapters.json";
pub const STATUS_FILE: &str = "statusinfo.bin";

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountsFile {
    pub version: u32,
    pub next_capability_id: i32,
    pub random_offset_sec: i64,
    pub capabilities: Vec<CapabilityRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub id: i32,
    pub app_id: String,
    pub account_id: AccountId,
    #[serde(default)]
    pub user_name: String,
    pub capability: String,
    pub enabled: bool,
    pub syncable: i32,
    pub backoff_time_ms: i64,
    pub backoff_delay_ms: i64,
    pub delay_until_ms: i64,
    #[serde(default)]
    pub periodic_syncs: Vec<PeriodicRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PeriodicRecord {
    pub job_name: String,
    pub period_sec: i64,
    pub flex_sec: i64,
    #[serde(default)]
    pub extras: Bundle,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobsFile {
    pub version: u32,
    pub jobs: Vec<SyncJob>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdaptersFile {
    pub version: u32,
    pub adapters: Vec<AdapterRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdapterRecord {
    pub package_id: String,
    pub service_app_id: String,
}

impl From<&CapabilityInfo> for CapabilityRecord {
    fn from(cap: &CapabilityInfo) -> Self {
        Self {
            id: cap.id,
            app_id: cap.app_id.clone(),
            account_id: cap.account_id(),
            user_name: cap
                .account
                .as_ref()
                .map(|a| a.user_name.clone())
                .unwrap_or_default(),
            capability: cap.capability.clone(),
            enabled: cap.enabled,
            syncable: cap.syncable,
            backoff_time_ms: cap.backoff.time_ms,
            backoff_delay_ms: cap.backoff.delay_ms,
            delay_until_ms: cap.delay_until_ms,
            periodic_syncs: cap
                .periodic_syncs
                .iter()
                .map(|p| PeriodicRecord {
                    job_name: p.job_name.clone(),
                    period_sec: p.period_sec,
                    flex_sec: p.flex_sec,
                    extras: p.extras.clone(),
                })
                .collect(),
        }
    }
}

impl From<CapabilityRecord> for CapabilityInfo {
    fn from(record: CapabilityRecord) -> Self {
        let account = (record.account_id != NO_ACCOUNT)
            .then(|| AccountHandle::new(record.account_id, record.user_name.clone()));
        CapabilityInfo {
            id: record.id,
            app_id: record.app_id,
            account,
            capability: record.capability,
            enabled: record.enabled,
            syncable: record.syncable,
            backoff: Backoff {
                time_ms: record.backoff_time_ms,
                delay_ms: record.backoff_delay_ms,
            },
            delay_until_ms: record.delay_until_ms,
            periodic_syncs: record
                .periodic_syncs
                .into_iter()
                .map(|p| PeriodicSync {
                    job_name: p.job_name,
                    period_sec: p.period_sec,
                    flex_sec: p.flex_sec,
                    extras: p.extras,
                })
                .collect(),
        }
    }
}

pub fn write_accounts(
    dir: &Path,
    next_capability_id: i32,
    random_offset_sec: i64,
    capabilities: &BTreeMap<i32, CapabilityInfo>,
) -> io::Result<()> {
    let file = AccountsFile {
        version: SCHEMA_VERSION,
        next_capability_id,
        random_offset_sec,
        capabilities: capabilities.values().map(CapabilityRecord::from).collect(),
    };
    write_json(&dir.join(ACCOUNTS_FILE), &file)
}

pub fn read_accounts(dir: &Path) -> Option<AccountsFile> {
    read_json(&dir.join(ACCOUNTS_FILE))
}

pub fn write_jobs(dir: &Path, jobs: &[SyncJob]) -> io::Result<()> {
    let file = JobsFile {
        version: SCHEMA_VERSION,
        jobs: jobs.to_vec(),
    };
    write_json(&dir.join(JOBS_FILE), &file)
}

pub fn read_jobs(dir: &Path) -> Vec<SyncJob> {
    read_json::<JobsFile>(&dir.join(JOBS_FILE))
        .map(|file| file.jobs)
        .unwrap_or_default()
}

pub fn write_adapters(dir: &Path, registry: &AdapterRegistry) -> io::Result<()> {
    let file = AdaptersFile {
        version: SCHEMA_VERSION,
        adapters: registry
            .iter()
            .map(|(package_id, service_app_id)| AdapterRecord {
                package_id: package_id.clone(),
                service_app_id: service_app_id.clone(),
            })
            .collect(),
    };
    write_json(&dir.join(ADAPTERS_FILE), &file)
}

pub fn read_adapters(dir: &Path) -> AdapterRegistry {
    read_json::<AdaptersFile>(&dir.join(ADAPTERS_FILE))
        .map(|file| {
            file.adapters
                .into_iter()
                .map(|record| (record.package_id, record.service_app_id))
                .collect()
        })
        .unwrap_or_default()
}

/// Render the status table as `<cap_id> <N> <t0> … <tN-1>` records
/// separated by `#`.
pub fn render_status(status: &BTreeMap<i32, SyncStatusInfo>) -> String {
    let mut out = String::new();
    for info in status.values() {
        out.push_str(&info.capability_id.to_string());
        out.push(' ');
        out.push_str(&info.periodic_sync_times.len().to_string());
        for time in &info.periodic_sync_times {
            out.push(' ');
            out.push_str(&time.to_string());
        }
        out.push('#');
    }
    out
}

/// Parse the status log, dropping records whose capability id is not in
/// `known_ids` and records that fail to parse.
pub fn parse_status(
    data: &str,
    known_ids: &std::collections::BTreeSet<i32>,
) -> BTreeMap<i32, SyncStatusInfo> {
    let mut out = BTreeMap::new();
    for record in data.split('#') {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }
        let mut fields = record.split_ascii_whitespace();
        let Some(Ok(cap_id)) = fields.next().map(str::parse::<i32>) else {
            warn!(record, "Dropping malformed status record");
            continue;
        };
        let Some(Ok(count)) = fields.next().map(str::parse::<usize>) else {
            warn!(record, "Dropping malformed status record");
            continue;
        };
        if !known_ids.contains(&cap_id) {
            warn!(cap_id, "Dropping status record for unknown capability");
            continue;
        }
        let times: Vec<i64> = fields.filter_map(|f| f.parse().ok()).collect();
        if times.len() != count {
            warn!(cap_id, "Dropping status record with inconsistent count");
            continue;
        }
        out.insert(
            cap_id,
            SyncStatusInfo {
                capability_id: cap_id,
                periodic_sync_times: times,
            },
        );
    }
    out
}

pub fn write_status(dir: &Path, status: &BTreeMap<i32, SyncStatusInfo>) -> io::Result<()> {
    fs::write(dir.join(STATUS_FILE), render_status(status))
}

pub fn read_status(
    dir: &Path,
    known_ids: &std::collections::BTreeSet<i32>,
) -> BTreeMap<i32, SyncStatusInfo> {
    match fs::read_to_string(dir.join(STATUS_FILE)) {
        Ok(data) => parse_status(&data, known_ids),
        Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
        Err(err) => {
            warn!(error = %err, "Failed to read status log");
            BTreeMap::new()
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(path, data)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to read state file");
            return None;
        }
    };
    match serde_json::from_slice(&data) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to parse state file");
            None
        }
    }
}
