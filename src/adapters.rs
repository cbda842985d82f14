//! Sync adapter registry and the delivery seam towards adapter processes.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::bundle::Bundle;
use crate::models::AccountId;

/// Maps an installed package to the service app that performs its syncs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterRegistry {
    entries: BTreeMap<String, String>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package's adapter. Re-registering the same pair is a
    /// no-op; a different service app replaces the previous entry.
    pub fn add(&mut self, package_id: &str, service_app_id: &str) {
        let previous = self
            .entries
            .insert(package_id.to_string(), service_app_id.to_string());
        if previous.as_deref() != Some(service_app_id) {
            info!(package_id, service_app_id, "Sync adapter registered");
        } else {
            debug!(package_id, "Sync adapter already registered");
        }
    }

    pub fn remove(&mut self, package_id: &str) -> Option<String> {
        self.entries.remove(package_id)
    }

    pub fn resolve(&self, package_id: &str) -> Option<&str> {
        self.entries.get(package_id).map(String::as_str)
    }

    /// Reverse lookup: the package whose adapter is the given service app.
    pub fn resolve_package(&self, service_app_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, app)| app.as_str() == service_app_id)
            .map(|(package, _)| package.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }
}

impl FromIterator<(String, String)> for AdapterRegistry {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Delivery seam towards adapter processes. The transport carrying these
/// calls is outside the scheduler core.
pub trait AdapterLink: Send + Sync {
    /// Ask the adapter to start the named sync.
    fn start_sync(
        &self,
        app_id: &str,
        account_id: AccountId,
        job_name: &str,
        is_data_change: bool,
        extras: &Bundle,
    );

    /// Ask the adapter to stop the named sync.
    fn cancel_sync(
        &self,
        app_id: &str,
        account_id: AccountId,
        job_name: &str,
        is_data_change: bool,
        extras: &Bundle,
    );
}

/// Link that only records deliveries in the log; used until platform IPC
/// glue is attached.
#[derive(Debug, Default)]
pub struct LoggingAdapterLink;

impl AdapterLink for LoggingAdapterLink {
    fn start_sync(
        &self,
        app_id: &str,
        account_id: AccountId,
        job_name: &str,
        is_data_change: bool,
        _extras: &Bundle,
    ) {
        info!(app_id, account_id, job_name, is_data_change, "start-sync delivered");
    }

    fn cancel_sync(
        &self,
        app_id: &str,
        account_id: AccountId,
        job_name: &str,
        is_data_change: bool,
        _extras: &Bundle,
    ) {
        info!(app_id, account_id, job_name, is_data_change, "cancel-sync delivered");
    }
}
