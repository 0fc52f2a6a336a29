//! Store interfaces the sync engine writes through.
//!
//! [`crate::db::Database`] implements both traits; tests and embedders can
//! plug in their own.

use std::collections::BTreeMap;

use crate::cursor::SyncCursor;
use crate::errors::StoreError;
use crate::models::{LocalGroup, LocalUser, Profile};

/// The local identity store: users, groups, membership edges and profiles.
///
/// Username and group-name lookups are case-insensitive.
pub trait IdentityStore: Send + Sync {
    /// Whether the store enforces uniqueness on this user field.
    fn is_unique_user_field(&self, field: &str) -> bool;

    /// Whether the store enforces uniqueness on this group field.
    fn is_unique_group_field(&self, field: &str) -> bool;

    fn find_user(&self, username: &str) -> Result<Option<LocalUser>, StoreError>;

    /// Look up a user by username or create it from `defaults`.
    ///
    /// `defaults` carries the mapped fields; its `username` entry, when
    /// present, keeps the directory's casing for a new record. Returns the
    /// user and whether it was created.
    fn get_or_create_user(
        &self,
        username: &str,
        defaults: &BTreeMap<String, String>,
    ) -> Result<(LocalUser, bool), StoreError>;

    fn save_user(&self, user: &LocalUser) -> Result<(), StoreError>;

    fn deactivate_user(&self, user_id: i64) -> Result<(), StoreError>;

    fn find_group(&self, name: &str) -> Result<Option<LocalGroup>, StoreError>;

    fn get_or_create_group(
        &self,
        name: &str,
        defaults: &BTreeMap<String, String>,
    ) -> Result<(LocalGroup, bool), StoreError>;

    /// Add a membership edge; adding an existing edge is a no-op.
    fn add_membership(&self, user_id: i64, group_id: i64) -> Result<(), StoreError>;

    fn remove_membership(&self, user_id: i64, group_id: i64) -> Result<(), StoreError>;

    /// Groups the user currently belongs to.
    fn list_user_groups(&self, user_id: i64) -> Result<Vec<LocalGroup>, StoreError>;

    fn get_or_create_profile(&self, kind: &str, user_id: i64) -> Result<(Profile, bool), StoreError>;

    fn save_profile(&self, profile: &Profile) -> Result<(), StoreError>;
}

/// Persistence of per-endpoint sync cursors.
pub trait CursorStore: Send + Sync {
    /// Get the cursor for `uri`, creating it with initial values if needed.
    fn resolve_cursor(&self, uri: &str) -> Result<SyncCursor, StoreError>;

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<(), StoreError>;

    fn list_cursors(&self) -> Result<Vec<SyncCursor>, StoreError>;
}
