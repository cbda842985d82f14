//! Account handles and the lookup seam towards the accounts subsystem.
//!
//! The scheduler never talks to account storage directly; it resolves an
//! opaque account id through an [`AccountSource`] and caches the resulting
//! handle on the job.

use serde::{Deserialize, Serialize};

pub type AccountId = i32;

/// Sentinel for account-less sync jobs.
pub const NO_ACCOUNT: AccountId = -1;

/// Cached account identity. Two handles are equal iff `(id, user_name)`
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountHandle {
    pub id: AccountId,
    pub user_name: String,
}

impl AccountHandle {
    pub fn new(id: AccountId, user_name: impl Into<String>) -> Self {
        Self {
            id,
            user_name: user_name.into(),
        }
    }
}

/// Lookup seam towards the accounts subsystem.
pub trait AccountSource: Send + Sync {
    /// Resolve an account id to its handle; `None` if the account does not
    /// exist.
    fn resolve(&self, id: AccountId) -> Option<AccountHandle>;

    /// Whether the account opted into synchronization.
    fn supports_sync(&self, id: AccountId) -> bool;
}

/// Permissive source used when no platform account service is wired in:
/// every id resolves and supports sync.
#[derive(Debug, Default)]
pub struct LocalAccounts;

impl AccountSource for LocalAccounts {
    fn resolve(&self, id: AccountId) -> Option<AccountHandle> {
        (id != NO_ACCOUNT).then(|| AccountHandle::new(id, String::new()))
    }

    fn supports_sync(&self, _id: AccountId) -> bool {
        true
    }
}
