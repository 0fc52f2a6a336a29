//! [`IdentityStore`] implementation over the SQLite tables.

use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{decode_fields, encode_fields, Database};
use crate::errors::StoreError;
use crate::models::{LocalGroup, LocalUser, Profile, GROUP_NAME_FIELD, USERNAME_FIELD};
use crate::store::IdentityStore;

const USER_COLUMNS: &str = "id, username, is_active, password_usable, fields";
const GROUP_COLUMNS: &str = "id, name, fields";

struct RawUser {
    id: i64,
    username: String,
    is_active: bool,
    password_usable: bool,
    fields: String,
}

impl RawUser {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            is_active: row.get(2)?,
            password_usable: row.get(3)?,
            fields: row.get(4)?,
        })
    }

    fn into_user(self) -> Result<LocalUser, StoreError> {
        Ok(LocalUser {
            id: self.id,
            username: self.username,
            is_active: self.is_active,
            password_usable: self.password_usable,
            fields: decode_fields(&self.fields)?,
        })
    }
}

fn group_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn into_group((id, name, fields): (i64, String, String)) -> Result<LocalGroup, StoreError> {
    Ok(LocalGroup {
        id,
        name,
        fields: decode_fields(&fields)?,
    })
}

pub(crate) fn select_user(conn: &Connection, username: &str) -> Result<Option<LocalUser>, StoreError> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM local_users WHERE username = ?1"),
        params![username],
        RawUser::from_row,
    )
    .optional()?
    .map(RawUser::into_user)
    .transpose()
}

fn select_group(conn: &Connection, name: &str) -> Result<Option<LocalGroup>, StoreError> {
    conn.query_row(
        &format!("SELECT {GROUP_COLUMNS} FROM local_groups WHERE name = ?1"),
        params![name],
        group_from_row,
    )
    .optional()?
    .map(into_group)
    .transpose()
}

fn select_profile(conn: &Connection, kind: &str, user_id: i64) -> Result<Option<Profile>, StoreError> {
    conn.query_row(
        "SELECT id, fields FROM profiles WHERE kind = ?1 AND user_id = ?2",
        params![kind, user_id],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
    )
    .optional()?
    .map(|(id, fields)| {
        Ok(Profile {
            id,
            kind: kind.to_string(),
            user_id,
            fields: decode_fields(&fields)?,
        })
    })
    .transpose()
}

impl IdentityStore for Database {
    fn is_unique_user_field(&self, field: &str) -> bool {
        field == USERNAME_FIELD
    }

    fn is_unique_group_field(&self, field: &str) -> bool {
        field == GROUP_NAME_FIELD
    }

    fn find_user(&self, username: &str) -> Result<Option<LocalUser>, StoreError> {
        select_user(&self.conn(), username)
    }

    fn get_or_create_user(
        &self,
        username: &str,
        defaults: &BTreeMap<String, String>,
    ) -> Result<(LocalUser, bool), StoreError> {
        self.transaction(|conn| {
            if let Some(user) = select_user(conn, username)? {
                return Ok((user, false));
            }

            let name = defaults
                .get(USERNAME_FIELD)
                .cloned()
                .unwrap_or_else(|| username.to_string());
            let mut fields = defaults.clone();
            fields.remove(USERNAME_FIELD);
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO local_users (username, is_active, password_usable, fields, created_at, updated_at)
                 VALUES (?1, 1, 1, ?2, ?3, ?3)",
                params![name, encode_fields(&fields)?, now],
            )?;
            let user = LocalUser {
                id: conn.last_insert_rowid(),
                username: name,
                is_active: true,
                password_usable: true,
                fields,
            };
            debug!(id = user.id, username = %user.username, "created local user");
            Ok((user, true))
        })
    }

    fn save_user(&self, user: &LocalUser) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE local_users
             SET username = ?1, is_active = ?2, password_usable = ?3, fields = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                user.username,
                user.is_active,
                user.password_usable,
                encode_fields(&user.fields)?,
                Utc::now().to_rfc3339(),
                user.id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "user".into(),
                id: user.id.to_string(),
            });
        }
        Ok(())
    }

    fn deactivate_user(&self, user_id: i64) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE local_users SET is_active = 0, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), user_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "user".into(),
                id: user_id.to_string(),
            });
        }
        debug!(user_id, "deactivated local user");
        Ok(())
    }

    fn find_group(&self, name: &str) -> Result<Option<LocalGroup>, StoreError> {
        select_group(&self.conn(), name)
    }

    fn get_or_create_group(
        &self,
        name: &str,
        defaults: &BTreeMap<String, String>,
    ) -> Result<(LocalGroup, bool), StoreError> {
        self.transaction(|conn| {
            if let Some(group) = select_group(conn, name)? {
                return Ok((group, false));
            }

            let mut fields = defaults.clone();
            fields.remove(GROUP_NAME_FIELD);
            conn.execute(
                "INSERT INTO local_groups (name, fields, created_at) VALUES (?1, ?2, ?3)",
                params![name, encode_fields(&fields)?, Utc::now().to_rfc3339()],
            )?;
            let group = LocalGroup {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                fields,
            };
            debug!(id = group.id, name = %group.name, "created local group");
            Ok((group, true))
        })
    }

    fn add_membership(&self, user_id: i64, group_id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR IGNORE INTO memberships (user_id, group_id, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, group_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove_membership(&self, user_id: i64, group_id: i64) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM memberships WHERE user_id = ?1 AND group_id = ?2",
            params![user_id, group_id],
        )?;
        Ok(())
    }

    fn list_user_groups(&self, user_id: i64) -> Result<Vec<LocalGroup>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.name, g.fields
             FROM local_groups g JOIN memberships m ON m.group_id = g.id
             WHERE m.user_id = ?1
             ORDER BY g.name",
        )?;
        let rows = stmt
            .query_map(params![user_id], group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_group).collect()
    }

    fn get_or_create_profile(&self, kind: &str, user_id: i64) -> Result<(Profile, bool), StoreError> {
        self.transaction(|conn| {
            if let Some(profile) = select_profile(conn, kind, user_id)? {
                return Ok((profile, false));
            }
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO profiles (kind, user_id, fields, created_at, updated_at)
                 VALUES (?1, ?2, '{}', ?3, ?3)",
                params![kind, user_id, now],
            )?;
            let profile = Profile {
                id: conn.last_insert_rowid(),
                kind: kind.to_string(),
                user_id,
                fields: BTreeMap::new(),
            };
            debug!(kind, user_id, "created profile");
            Ok((profile, true))
        })
    }

    fn save_profile(&self, profile: &Profile) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE profiles SET fields = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                encode_fields(&profile.fields)?,
                Utc::now().to_rfc3339(),
                profile.id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "profile".into(),
                id: profile.id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn defaults(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_get_or_create_user_is_case_insensitive() {
        let db = db();
        let (user, created) = db
            .get_or_create_user(
                "jdoe",
                &defaults(&[("username", "JDoe"), ("email", "jdoe@example.com")]),
            )
            .unwrap();
        assert!(created);
        assert_eq!(user.username, "JDoe");
        assert_eq!(user.fields["email"], "jdoe@example.com");
        assert!(!user.fields.contains_key("username"));

        let (again, created) = db.get_or_create_user("JDOE", &BTreeMap::new()).unwrap();
        assert!(!created);
        assert_eq!(again.id, user.id);
        assert_eq!(db.find_user("jdoe").unwrap().map(|u| u.id), Some(user.id));
    }

    #[test]
    fn test_save_and_deactivate_user() {
        let db = db();
        let (mut user, _) = db.get_or_create_user("jdoe", &BTreeMap::new()).unwrap();
        user.password_usable = false;
        user.set_field("title", "Engineer");
        db.save_user(&user).unwrap();
        db.deactivate_user(user.id).unwrap();

        let stored = db.find_user("jdoe").unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(!stored.password_usable);
        assert_eq!(stored.field("title"), Some("Engineer"));
    }

    #[test]
    fn test_save_user_rename_collision_is_constraint() {
        let db = db();
        db.get_or_create_user("alice", &BTreeMap::new()).unwrap();
        let (mut bob, _) = db.get_or_create_user("bob", &BTreeMap::new()).unwrap();
        bob.username = "ALICE".into();
        let err = db.save_user(&bob).unwrap_err();
        assert!(err.is_record_level());
    }

    #[test]
    fn test_memberships() {
        let db = db();
        let (user, _) = db.get_or_create_user("jdoe", &BTreeMap::new()).unwrap();
        let (staff, created) = db
            .get_or_create_group("Staff", &defaults(&[("name", "Staff"), ("description", "All staff")]))
            .unwrap();
        assert!(created);
        assert_eq!(staff.fields["description"], "All staff");
        let (ops, _) = db.get_or_create_group("Ops", &BTreeMap::new()).unwrap();
        let (same, created) = db.get_or_create_group("staff", &BTreeMap::new()).unwrap();
        assert!(!created);
        assert_eq!(same.id, staff.id);

        db.add_membership(user.id, staff.id).unwrap();
        db.add_membership(user.id, staff.id).unwrap();
        db.add_membership(user.id, ops.id).unwrap();
        let names: Vec<String> = db
            .list_user_groups(user.id)
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["Ops", "Staff"]);

        db.remove_membership(user.id, ops.id).unwrap();
        assert_eq!(db.list_user_groups(user.id).unwrap().len(), 1);
        assert!(db.find_group("OPS").unwrap().is_some());
    }

    #[test]
    fn test_profiles() {
        let db = db();
        let (user, _) = db.get_or_create_user("jdoe", &BTreeMap::new()).unwrap();
        let (mut profile, created) = db.get_or_create_profile("employee", user.id).unwrap();
        assert!(created);
        profile.fields.insert("department".into(), "Sales".into());
        db.save_profile(&profile).unwrap();

        let (stored, created) = db.get_or_create_profile("employee", user.id).unwrap();
        assert!(!created);
        assert_eq!(stored.fields["department"], "Sales");
    }

    #[test]
    fn test_unique_fields() {
        let db = db();
        assert!(db.is_unique_user_field("username"));
        assert!(!db.is_unique_user_field("email"));
        assert!(db.is_unique_group_field("name"));
        assert!(!db.is_unique_group_field("cn"));
    }
}
