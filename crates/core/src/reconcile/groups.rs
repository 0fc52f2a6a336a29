//! Group pass: create local groups for directory groups.
//!
//! Groups are never deleted here; the only accepted removal action is
//! `keep`.

use tracing::{debug, error, info, warn};

use super::{field_texts, record_or_count, required_text};
use crate::errors::ConfigError;
use crate::models::{DirectoryItem, EntityStats};
use crate::plan::RunPlan;
use crate::store::IdentityStore;

pub fn reconcile_groups(
    store: &dyn IdentityStore,
    plan: &RunPlan,
    items: &[DirectoryItem],
    stats: &mut EntityStats,
) -> Result<(), ConfigError> {
    let name_field = &plan.config.groups.name_field;
    stats.total += items.len() as u64;

    for item in items {
        let Some(record) = record_or_count(item, "group", stats) else {
            continue;
        };
        let fields = plan.group_mapper.map(record)?;
        let Some(name) = required_text(&fields, name_field) else {
            warn!(dn = %record.dn, field = %name_field, "group has no name, skipping");
            stats.errors += 1;
            continue;
        };

        match store.get_or_create_group(&name, &field_texts(&fields)) {
            Ok((group, true)) => {
                debug!(id = group.id, name = %group.name, "created group");
                stats.added += 1;
            }
            Ok((_, false)) => {}
            Err(e) => {
                error!(dn = %record.dn, name = %name, error = %e, "failed to sync group");
                stats.errors += 1;
            }
        }
    }

    if stats.has_changes() || stats.errors > 0 {
        info!(stats = %stats, "groups synced");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::Database;
    use crate::models::DirectoryRecord;

    fn plan(db: &Database) -> RunPlan {
        let mut config: AppConfig = toml::from_str(
            r#"
[directory]
uris = "ldap://dc1"
bind_dn = "CN=svc"
search_base = "DC=example,DC=com"
"#,
        )
        .unwrap();
        config.directory.bind_password = Some("pw".into());
        RunPlan::build(config, db).unwrap()
    }

    #[test]
    fn test_creates_missing_groups_once() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let plan = plan(&db);
        let items = vec![
            DirectoryItem::Record(DirectoryRecord::new("CN=Staff").with_text("cn", &["Staff"])),
            DirectoryItem::Record(DirectoryRecord::new("CN=Admins").with_text("CN", &["Admins"])),
        ];

        let mut stats = EntityStats::default();
        reconcile_groups(&db, &plan, &items, &mut stats).unwrap();
        assert_eq!((stats.total, stats.added, stats.errors), (2, 2, 0));

        let mut again = EntityStats::default();
        reconcile_groups(&db, &plan, &items, &mut again).unwrap();
        assert_eq!((again.total, again.added, again.errors), (2, 0, 0));
        assert!(db.find_group("staff").unwrap().is_some());
    }

    #[test]
    fn test_nameless_and_malformed_groups_count_errors() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let plan = plan(&db);
        let items = vec![
            DirectoryItem::Record(DirectoryRecord::new("CN=NoName")),
            DirectoryItem::Malformed {
                dn: None,
                reason: "search reference".into(),
            },
            DirectoryItem::Record(DirectoryRecord::new("CN=Staff").with_text("cn", &["Staff"])),
        ];

        let mut stats = EntityStats::default();
        reconcile_groups(&db, &plan, &items, &mut stats).unwrap();
        assert_eq!((stats.total, stats.added, stats.errors), (3, 1, 2));
    }
}
