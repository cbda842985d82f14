//! Extras bundle passed opaquely from clients through the scheduler to the
//! adapter. The scheduler itself only interprets the well-known option keys
//! listed in [`keys`]; everything else is carried verbatim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Well-known extras keys the scheduler reads.
pub mod keys {
    /// Do not retry the job after a failure result.
    pub const NO_RETRY: &str = "no_retry";
    /// Schedule the job at the front of the queue.
    pub const EXPEDITED: &str = "sync_expedited";
    /// Ignore any backoff currently applied to the capability.
    pub const IGNORE_BACKOFF: &str = "SYNC_OPTION_IGNORE_BACKOFF";
    /// Ignore the per-capability enabled/automatic-sync settings.
    pub const IGNORE_SETTINGS: &str = "SYNC_OPTION_IGNORE_SETTINGS";
    /// Upload-only sync request.
    pub const UPLOAD: &str = "SYNC_OPTION_UPLOAD";
    /// Initialization sync (first sync of a fresh adapter).
    pub const INITIALIZE: &str = "SYNC_OPTION_INITIALIZE";
}

/// Ordered string-to-string mapping with boolean flag semantics: a flag is
/// set iff the key is present with the literal value `"true"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct Bundle(BTreeMap<String, String>);

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Store a boolean flag as `"true"` / `"false"`.
    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    /// Flag semantics: present with value `"true"` means true; absent or any
    /// other value means false.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.0.get(key).map(String::as_str), Some("true"))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Drop option keys that are present but not `"true"`, so the bundle the
    /// adapter receives carries only meaningful flags.
    pub fn remove_false_flags(&mut self) {
        for key in [
            keys::NO_RETRY,
            keys::EXPEDITED,
            keys::IGNORE_BACKOFF,
            keys::IGNORE_SETTINGS,
            keys::UPLOAD,
            keys::INITIALIZE,
        ] {
            if self.0.get(key).is_some_and(|v| v != "true") {
                self.0.remove(key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for Bundle {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for Bundle {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_requires_literal_true() {
        let mut bundle = Bundle::new();
        assert!(!bundle.flag(keys::EXPEDITED));

        bundle.set(keys::EXPEDITED, "true");
        assert!(bundle.flag(keys::EXPEDITED));

        bundle.set(keys::EXPEDITED, "false");
        assert!(!bundle.flag(keys::EXPEDITED));

        bundle.set(keys::EXPEDITED, "TRUE");
        assert!(!bundle.flag(keys::EXPEDITED));
    }

    #[test]
    fn remove_false_flags_keeps_true_and_unknown_keys() {
        let mut bundle = Bundle::new();
        bundle.set(keys::UPLOAD, "true");
        bundle.set(keys::NO_RETRY, "false");
        bundle.set("custom", "false");

        bundle.remove_false_flags();

        assert_eq!(bundle.get(keys::UPLOAD), Some("true"));
        assert_eq!(bundle.get(keys::NO_RETRY), None);
        assert_eq!(bundle.get("custom"), Some("false"));
    }

    #[test]
    fn bundles_compare_as_bags_of_pairs() {
        let a: Bundle = [("k1".to_string(), "v1".to_string()), ("k2".to_string(), "v2".to_string())]
            .into_iter()
            .collect();
        let b: Bundle = [("k2".to_string(), "v2".to_string()), ("k1".to_string(), "v1".to_string())]
            .into_iter()
            .collect();
        assert_eq!(a, b);
    }
}
