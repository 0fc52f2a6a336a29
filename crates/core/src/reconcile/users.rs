//! User pass: create and update local users from directory records.
//!
//! Membership and profile updates for a synced user are driven by the
//! engine, which owns the directory client; this module covers the parts
//! that only touch the stores.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::profiles::ProfileSync;
use super::{field_texts, required_text};
use crate::blob::BlobStore;
use crate::errors::ConfigError;
use crate::hooks::{RemovedUserHook, UserHook};
use crate::mapper::is_account_disabled;
use crate::models::{DirectoryRecord, EntityStats, LocalUser};
use crate::plan::RunPlan;
use crate::store::IdentityStore;

/// What happened to one user record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOutcome {
    /// Missing username, exempt, or disabled without a local account.
    Skipped,
    /// A store failure, already counted.
    Failed,
    Synced {
        user: LocalUser,
        /// Lowercased directory username.
        username: String,
        created: bool,
        /// Whether any mapped field changed on an existing user.
        updated: bool,
    },
}

pub struct UserReconciler<'a> {
    store: &'a dyn IdentityStore,
    blobs: &'a dyn BlobStore,
    plan: &'a RunPlan,
    user_hooks: &'a [Arc<dyn UserHook>],
    removed_hooks: &'a [Arc<dyn RemovedUserHook>],
}

impl<'a> UserReconciler<'a> {
    pub fn new(
        store: &'a dyn IdentityStore,
        blobs: &'a dyn BlobStore,
        plan: &'a RunPlan,
        user_hooks: &'a [Arc<dyn UserHook>],
        removed_hooks: &'a [Arc<dyn RemovedUserHook>],
    ) -> Self {
        Self {
            store,
            blobs,
            plan,
            user_hooks,
            removed_hooks,
        }
    }

    /// Create or update the local user for `record`.
    ///
    /// Counts `added`, `deleted` and `errors`; `updated` is left to the
    /// caller since profile changes also count towards it.
    pub fn sync_record(
        &self,
        record: &DirectoryRecord,
        stats: &mut EntityStats,
    ) -> Result<UserOutcome, ConfigError> {
        let users = &self.plan.config.users;
        let fields = self.plan.user_mapper.map(record)?;

        let Some(directory_name) = required_text(&fields, &users.username_field) else {
            warn!(dn = %record.dn, field = %users.username_field, "user has no username, skipping");
            return Ok(UserOutcome::Skipped);
        };
        let username = directory_name.to_lowercase();

        if self.plan.exempt.contains(&username) {
            debug!(username = %username, "user is exempt, skipping");
            return Ok(UserOutcome::Skipped);
        }

        if is_account_disabled(record) {
            let existing = match self.store.find_user(&username) {
                Ok(found) => found,
                Err(e) => {
                    error!(username = %username, error = %e, "failed to look up disabled user");
                    stats.errors += 1;
                    return Ok(UserOutcome::Failed);
                }
            };
            let Some(existing) = existing else {
                debug!(username = %username, "disabled account has no local user, skipping");
                return Ok(UserOutcome::Skipped);
            };
            self.run_removed_hooks(&existing, stats);
        }

        let (mut user, created) = match self.store.get_or_create_user(&username, &field_texts(&fields)) {
            Ok(found) => found,
            Err(e) => {
                error!(dn = %record.dn, username = %username, error = %e, "failed to load user");
                stats.errors += 1;
                return Ok(UserOutcome::Failed);
            }
        };

        let mut dirty = false;
        if created {
            if users.set_unusable_password {
                user.password_usable = false;
            }
            stats.added += 1;
            info!(username = %user.username, "created user");
        } else {
            for (name, value) in &fields {
                if user.set_field(name, &value.to_field_text()) {
                    debug!(username = %username, field = %name, "field changed");
                    dirty = true;
                }
            }
        }

        for hook in self.user_hooks {
            hook.on_user_synced(&user, record, created, dirty);
        }

        if created || dirty {
            if let Err(e) = self.store.save_user(&user) {
                error!(username = %username, error = %e, "failed to save user");
                stats.errors += 1;
                return Ok(UserOutcome::Failed);
            }
        }

        Ok(UserOutcome::Synced {
            user,
            username,
            created,
            updated: dirty,
        })
    }

    /// Apply the configured profiles to a synced user.
    pub fn sync_profiles(
        &self,
        user: &LocalUser,
        username: &str,
        record: &DirectoryRecord,
        stats: &mut EntityStats,
    ) -> Result<bool, ConfigError> {
        if self.plan.profiles.is_empty() {
            return Ok(false);
        }
        let users = &self.plan.config.users;
        ProfileSync {
            store: self.store,
            blobs: self.blobs,
            separator: &users.multivalue_separator,
            name_template: &users.photo_name_template,
        }
        .apply(&self.plan.profiles, user, username, record, stats)
    }

    fn run_removed_hooks(&self, user: &LocalUser, stats: &mut EntityStats) {
        if self.removed_hooks.is_empty() {
            return;
        }
        for hook in self.removed_hooks {
            if let Err(e) = hook.on_user_removed(self.store, user) {
                error!(username = %user.username, hook = hook.name(), error = %e, "removed-user hook failed");
                stats.errors += 1;
            }
        }
        stats.deleted += 1;
        info!(username = %user.username, "directory account disabled");
    }
}

/// Logs processed percentage as it advances.
#[derive(Debug)]
pub struct ProgressLog {
    total: usize,
    last_percent: usize,
    enabled: bool,
}

impl ProgressLog {
    pub fn new(total: usize, enabled: bool) -> Self {
        Self {
            total,
            last_percent: 0,
            enabled,
        }
    }

    /// Record `done` processed items; returns the percentage when it moved.
    pub fn advance(&mut self, done: usize) -> Option<usize> {
        if !self.enabled || self.total == 0 {
            return None;
        }
        let percent = done.min(self.total) * 100 / self.total;
        if percent <= self.last_percent {
            return None;
        }
        self.last_percent = percent;
        info!(done, total = self.total, percent, "user sync progress");
        Some(percent)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::blob::FsBlobStore;
    use crate::config::AppConfig;
    use crate::db::Database;
    use crate::hooks::DeactivateUser;

    struct Fixture {
        db: Database,
        blobs: FsBlobStore,
        plan: RunPlan,
        _dir: tempfile::TempDir,
    }

    fn fixture(extra: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let mut config: AppConfig = toml::from_str(&format!(
            r#"
[directory]
uris = "ldap://dc1"
bind_dn = "CN=svc"
search_base = "DC=example,DC=com"
{extra}
"#
        ))
        .unwrap();
        config.directory.bind_password = Some("pw".into());
        let plan = RunPlan::build(config, &db).unwrap();
        Fixture {
            blobs: FsBlobStore::new(dir.path()).unwrap(),
            db,
            plan,
            _dir: dir,
        }
    }

    fn person(name: &str, mail: &str) -> DirectoryRecord {
        DirectoryRecord::new(format!("CN={name},DC=example,DC=com"))
            .with_text("sAMAccountName", &[name])
            .with_text("mail", &[mail])
            .with_text("userAccountControl", &["512"])
    }

    fn deactivate() -> Vec<Arc<dyn RemovedUserHook>> {
        vec![Arc::new(DeactivateUser)]
    }

    #[test]
    fn test_create_then_update() {
        let fx = fixture("");
        let reconciler = UserReconciler::new(&fx.db, &fx.blobs, &fx.plan, &[], &[]);
        let mut stats = EntityStats::default();

        let outcome = reconciler.sync_record(&person("JDoe", "jdoe@example.com"), &mut stats).unwrap();
        let UserOutcome::Synced {
            user,
            username,
            created,
            updated,
        } = outcome
        else {
            panic!("expected synced user");
        };
        assert_eq!(username, "jdoe");
        assert_eq!(user.username, "JDoe");
        assert!(created && !updated);
        assert_eq!(stats.added, 1);
        assert!(!fx.db.find_user("jdoe").unwrap().unwrap().password_usable);

        let outcome = reconciler.sync_record(&person("JDoe", "john@example.com"), &mut stats).unwrap();
        assert!(matches!(outcome, UserOutcome::Synced { updated: true, .. }));
        let stored = fx.db.find_user("jdoe").unwrap().unwrap();
        assert_eq!(stored.fields["email"], "john@example.com");
        assert_eq!(stats.added, 1);
    }

    #[test]
    fn test_missing_username_and_exempt_are_skipped() {
        let fx = fixture("[users]\nexempt = [\"admin\"]\n");
        let reconciler = UserReconciler::new(&fx.db, &fx.blobs, &fx.plan, &[], &[]);
        let mut stats = EntityStats::default();

        let nameless = DirectoryRecord::new("CN=ghost").with_text("mail", &["ghost@example.com"]);
        assert_eq!(reconciler.sync_record(&nameless, &mut stats).unwrap(), UserOutcome::Skipped);
        assert_eq!(
            reconciler.sync_record(&person("Admin", "admin@example.com"), &mut stats).unwrap(),
            UserOutcome::Skipped
        );
        assert_eq!(stats, EntityStats::default());
        assert_eq!(fx.db.count_users().unwrap(), (0, 0));
    }

    #[test]
    fn test_disabled_account_policy() {
        let fx = fixture("");
        let hooks = deactivate();
        let reconciler = UserReconciler::new(&fx.db, &fx.blobs, &fx.plan, &[], &hooks);
        let mut stats = EntityStats::default();

        let disabled = |name: &str| {
            person(name, "x@example.com").with_text("userAccountControl", &["514"])
        };

        assert_eq!(reconciler.sync_record(&disabled("ghost"), &mut stats).unwrap(), UserOutcome::Skipped);
        assert!(fx.db.find_user("ghost").unwrap().is_none());

        fx.db.get_or_create_user("jdoe", &BTreeMap::new()).unwrap();
        let outcome = reconciler.sync_record(&disabled("jdoe"), &mut stats).unwrap();
        let UserOutcome::Synced { user, .. } = outcome else {
            panic!("expected synced user");
        };
        assert!(!user.is_active);
        assert_eq!((stats.added, stats.deleted), (0, 1));
    }

    #[test]
    fn test_disabled_account_without_hooks_is_not_counted() {
        let fx = fixture("[users]\nremoval_action = \"keep\"\n");
        let reconciler = UserReconciler::new(&fx.db, &fx.blobs, &fx.plan, &[], &[]);
        fx.db.get_or_create_user("jdoe", &BTreeMap::new()).unwrap();

        let mut stats = EntityStats::default();
        let record = person("jdoe", "x@example.com").with_text("userAccountControl", &["514"]);
        reconciler.sync_record(&record, &mut stats).unwrap();
        assert_eq!(stats.deleted, 0);
        assert!(fx.db.find_user("jdoe").unwrap().unwrap().is_active);
    }

    #[test]
    fn test_user_hooks_see_created_and_updated() {
        struct Recorder(Mutex<Vec<(String, bool, bool)>>);
        impl UserHook for Recorder {
            fn on_user_synced(&self, user: &LocalUser, _: &DirectoryRecord, created: bool, updated: bool) {
                self.0.lock().unwrap().push((user.username.clone(), created, updated));
            }
        }

        let fx = fixture("");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let hooks: Vec<Arc<dyn UserHook>> = vec![recorder.clone()];
        let reconciler = UserReconciler::new(&fx.db, &fx.blobs, &fx.plan, &hooks, &[]);
        let mut stats = EntityStats::default();
        reconciler.sync_record(&person("jdoe", "a@example.com"), &mut stats).unwrap();
        reconciler.sync_record(&person("jdoe", "a@example.com"), &mut stats).unwrap();
        reconciler.sync_record(&person("jdoe", "b@example.com"), &mut stats).unwrap();

        let calls = recorder.0.lock().unwrap().clone();
        assert_eq!(
            calls,
            [
                ("jdoe".to_string(), true, false),
                ("jdoe".to_string(), false, false),
                ("jdoe".to_string(), false, true),
            ]
        );
    }

    #[test]
    fn test_progress_log_reports_each_new_percent() {
        let mut progress = ProgressLog::new(4, true);
        assert_eq!(progress.advance(1), Some(25));
        assert_eq!(progress.advance(1), None);
        assert_eq!(progress.advance(4), Some(100));
        assert_eq!(ProgressLog::new(4, false).advance(4), None);
    }
}
