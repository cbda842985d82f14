//! # Data-Change Scheduler
//!
//! Fan-out from device data-source change notifications (calendar DB,
//! contacts DB, media store) to the sync jobs registered against the
//! matching capability bucket.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::models::SyncJob;

/// Capability URIs recognized for data-change sync jobs.
pub mod capability_uris {
    pub const NAMESPACE: &str = "http://tizen.org/sync/capability/";

    pub const CALENDAR: &str = "http://tizen.org/sync/capability/calendar";
    pub const CONTACT: &str = "http://tizen.org/sync/capability/contact";
    pub const IMAGE: &str = "http://tizen.org/sync/capability/image";
    pub const VIDEO: &str = "http://tizen.org/sync/capability/video";
    pub const SOUND: &str = "http://tizen.org/sync/capability/sound";
    pub const MUSIC: &str = "http://tizen.org/sync/capability/music";

    pub const ALL: [&str; 6] = [CALENDAR, CONTACT, IMAGE, VIDEO, SOUND, MUSIC];

    pub fn is_recognized(capability: &str) -> bool {
        ALL.contains(&capability)
    }
}

/// Media types reported by the media-content source; each selects a
/// capability bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Image,
    Video,
    Music,
    Sound,
}

impl MediaType {
    pub fn capability(self) -> &'static str {
        match self {
            MediaType::Image => capability_uris::IMAGE,
            MediaType::Video => capability_uris::VIDEO,
            MediaType::Music => capability_uris::MUSIC,
            MediaType::Sound => capability_uris::SOUND,
        }
    }
}

/// Registered data-change jobs grouped by capability bucket. Each bucket
/// holds job templates; an event clones and enqueues every template in the
/// bucket.
#[derive(Debug, Default)]
pub struct DataChangeScheduler {
    buckets: BTreeMap<String, BTreeMap<String, SyncJob>>,
}

impl DataChangeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data-change job template; re-registering the same key
    /// replaces the template.
    pub fn register(&mut self, capability: &str, job: SyncJob) {
        debug!(capability, key = %job.key, "Registered data-change sync job");
        self.buckets
            .entry(capability.to_string())
            .or_default()
            .insert(job.key.clone(), job);
    }

    pub fn deregister(&mut self, capability: &str, key: &str) -> Option<SyncJob> {
        let bucket = self.buckets.get_mut(capability)?;
        let removed = bucket.remove(key);
        if bucket.is_empty() {
            self.buckets.remove(capability);
        }
        removed
    }

    /// Drop every registration owned by the given adapter app.
    pub fn remove_by_app(&mut self, app_id: &str) {
        for bucket in self.buckets.values_mut() {
            bucket.retain(|_, job| job.app_id != app_id);
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
    }

    /// Jobs to enqueue for a change on the given capability.
    pub fn on_data_change(&self, capability: &str) -> Vec<SyncJob> {
        self.buckets
            .get(capability)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn registered_count(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }
}
