//! # Data Models
//!
//! Core entities of the scheduler: accounts, sync jobs, capabilities, and
//! their persisted status records.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod account;
pub mod capability;
pub mod job;

pub use account::{AccountHandle, AccountId, AccountSource, LocalAccounts, NO_ACCOUNT};
pub use capability::{Backoff, CapabilityInfo, PeriodicSync, SyncStatusInfo, NOT_IN_BACKOFF};
pub use job::{JobKind, SyncJob, SyncReason, SyncSource, SyncStatus};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "syncd".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
