//! Membership pass for one user: make the local group set equal to the
//! directory-reported groups plus the configured default groups.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, error, info, warn};

use super::{field_texts, record_or_count, required_text};
use crate::errors::ConfigError;
use crate::models::{DirectoryItem, DirectoryRecord, EntityStats, LocalGroup, LocalUser};
use crate::plan::RunPlan;
use crate::store::IdentityStore;

struct TargetGroup {
    name: String,
    defaults: BTreeMap<String, String>,
}

/// Reconcile `user`'s memberships against `reported`.
///
/// `stats.total` grows by the number of reported items; default groups are
/// not counted there.
pub fn reconcile_memberships(
    store: &dyn IdentityStore,
    plan: &RunPlan,
    user: &LocalUser,
    reported: &[DirectoryItem],
    stats: &mut EntityStats,
) -> Result<(), ConfigError> {
    let mut delta = EntityStats {
        total: reported.len() as u64,
        ..EntityStats::default()
    };

    let mut targets = Vec::new();
    let mut target_names = HashSet::new();
    let records = reported
        .iter()
        .filter_map(|item| record_or_count(item, "membership", &mut delta))
        .collect::<Vec<_>>();
    for record in records.into_iter().chain(plan.default_groups.iter()) {
        let Some(target) = target_group(plan, record, &mut delta)? else {
            continue;
        };
        if target_names.insert(target.name.to_lowercase()) {
            targets.push(target);
        }
    }

    let held = match store.list_user_groups(user.id) {
        Ok(groups) => groups,
        Err(e) => {
            error!(username = %user.username, error = %e, "failed to load current memberships");
            stats.total += delta.total;
            stats.errors += delta.errors + 1;
            return Ok(());
        }
    };
    let held_names: HashSet<String> = held.iter().map(|g| g.name.to_lowercase()).collect();

    for target in targets
        .iter()
        .filter(|t| !held_names.contains(&t.name.to_lowercase()))
    {
        let group = if plan.config.memberships.create_missing_groups {
            store
                .get_or_create_group(&target.name, &target.defaults)
                .map(|(group, created)| {
                    if created {
                        debug!(name = %group.name, "created group for membership");
                    }
                    Some(group)
                })
        } else {
            store.find_group(&target.name)
        };

        match group {
            Ok(Some(group)) => add_edge(store, user, &group, &mut delta),
            Ok(None) => debug!(name = %target.name, "group not present locally, skipping membership"),
            Err(e) => {
                error!(username = %user.username, group = %target.name, error = %e, "failed to resolve group");
                delta.errors += 1;
            }
        }
    }

    for group in held
        .iter()
        .filter(|g| !target_names.contains(&g.name.to_lowercase()))
    {
        match store.remove_membership(user.id, group.id) {
            Ok(()) => delta.deleted += 1,
            Err(e) => {
                error!(username = %user.username, group = %group.name, error = %e, "failed to remove membership");
                delta.errors += 1;
            }
        }
    }

    if delta.has_changes() {
        info!(
            username = %user.username,
            added = delta.added,
            removed = delta.deleted,
            "memberships updated"
        );
    }

    stats.total += delta.total;
    stats.added += delta.added;
    stats.deleted += delta.deleted;
    stats.errors += delta.errors;
    Ok(())
}

fn target_group(
    plan: &RunPlan,
    record: &DirectoryRecord,
    delta: &mut EntityStats,
) -> Result<Option<TargetGroup>, ConfigError> {
    let fields = plan.group_mapper.map(record)?;
    match required_text(&fields, &plan.config.groups.name_field) {
        Some(name) => Ok(Some(TargetGroup {
            name,
            defaults: field_texts(&fields),
        })),
        None => {
            warn!(dn = %record.dn, "membership group has no name, skipping");
            delta.errors += 1;
            Ok(None)
        }
    }
}

fn add_edge(store: &dyn IdentityStore, user: &LocalUser, group: &LocalGroup, delta: &mut EntityStats) {
    match store.add_membership(user.id, group.id) {
        Ok(()) => delta.added += 1,
        Err(e) => {
            error!(username = %user.username, group = %group.name, error = %e, "failed to add membership");
            delta.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::Database;

    fn plan(db: &Database, extra: &str) -> RunPlan {
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
        RunPlan::build(config, db).unwrap()
    }

    fn group(name: &str) -> DirectoryItem {
        DirectoryItem::Record(DirectoryRecord::new(format!("CN={name}")).with_text("cn", &[name]))
    }

    fn names(db: &Database, user: &LocalUser) -> Vec<String> {
        db.list_user_groups(user.id)
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect()
    }

    fn setup(extra: &str) -> (Database, RunPlan, LocalUser) {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let plan = plan(&db, extra);
        let (user, _) = db.get_or_create_user("jdoe", &BTreeMap::new()).unwrap();
        (db, plan, user)
    }

    #[test]
    fn test_local_set_converges_to_directory_set() {
        let (db, plan, user) = setup("");
        for name in ["Old", "Staff"] {
            let (g, _) = db.get_or_create_group(name, &BTreeMap::new()).unwrap();
            db.add_membership(user.id, g.id).unwrap();
        }

        let mut stats = EntityStats::default();
        reconcile_memberships(&db, &plan, &user, &[group("staff"), group("Admins")], &mut stats).unwrap();
        assert_eq!(names(&db, &user), ["Admins", "Staff"]);
        assert_eq!((stats.total, stats.added, stats.deleted, stats.errors), (2, 1, 1, 0));

        let mut again = EntityStats::default();
        reconcile_memberships(&db, &plan, &user, &[group("Staff"), group("Admins")], &mut again).unwrap();
        assert!(!again.has_changes());
    }

    #[test]
    fn test_default_groups_are_targets_but_not_counted_in_total() {
        let (db, plan, user) = setup(
            r#"
[[memberships.default_groups]]
dn = "CN=Everyone"
attributes = { cn = ["Everyone"] }
"#,
        );
        let mut stats = EntityStats::default();
        reconcile_memberships(&db, &plan, &user, &[group("Staff")], &mut stats).unwrap();
        assert_eq!(names(&db, &user), ["Everyone", "Staff"]);
        assert_eq!((stats.total, stats.added), (1, 2));
    }

    #[test]
    fn test_missing_groups_skipped_without_create() {
        let (db, plan, user) = setup("[memberships]\ncreate_missing_groups = false\n");
        db.get_or_create_group("Staff", &BTreeMap::new()).unwrap();

        let mut stats = EntityStats::default();
        reconcile_memberships(&db, &plan, &user, &[group("Staff"), group("Ghost")], &mut stats).unwrap();
        assert_eq!(names(&db, &user), ["Staff"]);
        assert_eq!((stats.added, stats.errors), (1, 0));
        assert!(db.find_group("Ghost").unwrap().is_none());
    }

    #[test]
    fn test_malformed_item_counts_an_error() {
        let (db, plan, user) = setup("");
        let reported = [
            group("Staff"),
            DirectoryItem::Malformed {
                dn: None,
                reason: "reference".into(),
            },
        ];
        let mut stats = EntityStats::default();
        reconcile_memberships(&db, &plan, &user, &reported, &mut stats).unwrap();
        assert_eq!((stats.total, stats.added, stats.errors), (2, 1, 1));
    }
}
