//! Constraint oracle: tracks device conditions and answers whether sync
//! dispatch is currently permitted.

use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

/// Storage pressure levels reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StorageLevel {
    Normal,
    SoftWarning,
    HardWarning,
}

/// Device condition changes delivered by the signal sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintEvent {
    Wifi(bool),
    Cellular(bool),
    Storage(StorageLevel),
    UpsMode(bool),
}

/// Outcome of applying a constraint event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintChange {
    /// A network flag transitioned not-connected → connected.
    Reconnection,
    Changed,
}

#[derive(Debug, Clone)]
pub struct ConstraintOracle {
    pub wifi_connected: bool,
    pub cellular_connected: bool,
    pub storage_low: bool,
    pub ups_enabled: bool,
    /// Global pause flag toggled through the request surface.
    pub sync_permitted: bool,
}

impl ConstraintOracle {
    pub fn new() -> Self {
        Self {
            wifi_connected: false,
            cellular_connected: false,
            storage_low: false,
            ups_enabled: false,
            sync_permitted: true,
        }
    }

    /// Apply a device event, reporting a reconnection edge when one of the
    /// network flags goes from down to up.
    pub fn apply(&mut self, event: ConstraintEvent) -> ConstraintChange {
        match event {
            ConstraintEvent::Wifi(connected) => {
                let was_connected = self.wifi_connected;
                self.wifi_connected = connected;
                debug!(connected, "Wifi network change detected");
                if connected && !was_connected {
                    return ConstraintChange::Reconnection;
                }
            }
            ConstraintEvent::Cellular(connected) => {
                let was_connected = self.cellular_connected;
                self.cellular_connected = connected;
                debug!(connected, "Data network change detected");
                if connected && !was_connected {
                    return ConstraintChange::Reconnection;
                }
            }
            ConstraintEvent::Storage(level) => {
                self.storage_low = !matches!(level, StorageLevel::Normal);
                debug!(storage_low = self.storage_low, "Storage state change detected");
            }
            ConstraintEvent::UpsMode(enabled) => {
                self.ups_enabled = enabled;
                debug!(enabled, "UPS mode change detected");
            }
        }
        ConstraintChange::Changed
    }

    pub fn set_sync_permitted(&mut self, permitted: bool) {
        self.sync_permitted = permitted;
    }

    /// True iff a job may be dispatched right now.
    pub fn may_dispatch(&self) -> bool {
        (self.wifi_connected || self.cellular_connected)
            && !self.storage_low
            && !self.ups_enabled
            && self.sync_permitted
    }
}

impl Default for ConstraintOracle {
    fn default() -> Self {
        Self::new()
    }
}
