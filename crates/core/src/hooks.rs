//! Extension points invoked by the user reconciler.

use crate::errors::StoreError;
use crate::models::{DirectoryRecord, LocalUser};
use crate::store::IdentityStore;

/// Called for every user the reconciler synced, before it is persisted.
///
/// Hooks observe; they do not influence the reconciliation outcome.
pub trait UserHook: Send + Sync {
    fn on_user_synced(&self, user: &LocalUser, record: &DirectoryRecord, created: bool, updated: bool);
}

/// Called when a directory account is disabled but still exists locally.
pub trait RemovedUserHook: Send + Sync {
    /// Short name used in log events.
    fn name(&self) -> &str;

    fn on_user_removed(&self, store: &dyn IdentityStore, user: &LocalUser) -> Result<(), StoreError>;
}

/// Marks the local account inactive.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeactivateUser;

impl RemovedUserHook for DeactivateUser {
    fn name(&self) -> &str {
        "deactivate"
    }

    fn on_user_removed(&self, store: &dyn IdentityStore, user: &LocalUser) -> Result<(), StoreError> {
        store.deactivate_user(user.id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::db::Database;

    #[test]
    fn test_deactivate_user_hook() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let (user, _) = db.get_or_create_user("jdoe", &BTreeMap::new()).unwrap();

        DeactivateUser.on_user_removed(&db, &user).unwrap();
        assert!(!db.find_user("jdoe").unwrap().unwrap().is_active);
    }
}
