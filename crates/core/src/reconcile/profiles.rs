//! Per-user profile records filled from directory attributes.

use std::fmt::Write as _;

use chrono::Local;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::{FieldCase, ProfileConfig};
use crate::errors::ConfigError;
use crate::mapper::{is_photo_attribute, join_text_values};
use crate::models::{DirectoryRecord, EntityStats, LocalUser};
use crate::store::IdentityStore;

/// How a profile field stores its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    /// All values joined with the multi-value separator.
    Text,
    /// First value written to the blob store; the field holds the blob name.
    Blob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSpec {
    attribute: String,
    name: String,
    kind: ProfileField,
}

/// Field layout of one profile kind, resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSchema {
    kind: String,
    fields: Vec<FieldSpec>,
}

impl ProfileSchema {
    /// Resolve a configured profile. Field names get the case policy; photo
    /// attributes become blob fields.
    pub fn from_config(config: &ProfileConfig, case: FieldCase) -> Self {
        Self {
            kind: config.name.clone(),
            fields: config
                .fields
                .iter()
                .map(|attribute| FieldSpec {
                    attribute: attribute.clone(),
                    name: case.apply(attribute),
                    kind: if is_photo_attribute(attribute) {
                        ProfileField::Blob
                    } else {
                        ProfileField::Text
                    },
                })
                .collect(),
        }
    }

}

/// Shared inputs of the profile pass for one run.
pub struct ProfileSync<'a> {
    pub store: &'a dyn IdentityStore,
    pub blobs: &'a dyn BlobStore,
    pub separator: &'a str,
    pub name_template: &'a str,
}

impl ProfileSync<'_> {
    /// Apply every schema to `user`. Returns whether any profile changed.
    ///
    /// Store and blob failures are counted on `stats`; only undecodable
    /// text aborts.
    pub fn apply(
        &self,
        schemas: &[ProfileSchema],
        user: &LocalUser,
        username: &str,
        record: &DirectoryRecord,
        stats: &mut EntityStats,
    ) -> Result<bool, ConfigError> {
        let mut changed = false;
        for schema in schemas {
            changed |= self.apply_one(schema, user, username, record, stats)?;
        }
        Ok(changed)
    }

    fn apply_one(
        &self,
        schema: &ProfileSchema,
        user: &LocalUser,
        username: &str,
        record: &DirectoryRecord,
        stats: &mut EntityStats,
    ) -> Result<bool, ConfigError> {
        let (mut profile, _) = match self.store.get_or_create_profile(&schema.kind, user.id) {
            Ok(found) => found,
            Err(e) => {
                error!(username, kind = %schema.kind, error = %e, "failed to load profile");
                stats.errors += 1;
                return Ok(false);
            }
        };

        let mut dirty = false;
        // (previous blob, new blob) for every photo written this pass.
        let mut replaced: Vec<(Option<String>, String)> = Vec::new();
        for spec in &schema.fields {
            let Some(values) = record.values(&spec.attribute).filter(|v| !v.is_empty()) else {
                continue;
            };
            match spec.kind {
                ProfileField::Text => {
                    let setting = format!("users.profiles.{}.{}", schema.kind, spec.attribute);
                    let value = join_text_values(&setting, values, self.separator)?;
                    if profile.fields.get(&spec.name) != Some(&value) {
                        profile.fields.insert(spec.name.clone(), value);
                        dirty = true;
                    }
                }
                ProfileField::Blob => {
                    let incoming = &values[0];
                    let current = profile.fields.get(&spec.name).cloned();
                    if let Some(name) = &current {
                        match self.blobs.read(name) {
                            Ok(Some(bytes)) if bytes == *incoming => continue,
                            Ok(_) => {}
                            Err(e) => warn!(username, blob = %name, error = %e, "could not read stored photo"),
                        }
                    }

                    let name = render_blob_name(self.name_template, username)?;
                    match self.blobs.save(&name, incoming) {
                        Ok(saved) => {
                            debug!(username, blob = %saved, size = incoming.len(), "stored photo");
                            profile.fields.insert(spec.name.clone(), saved.clone());
                            replaced.push((current, saved));
                            dirty = true;
                        }
                        Err(e) => {
                            error!(username, blob = %name, error = %e, "failed to store photo");
                            stats.errors += 1;
                        }
                    }
                }
            }
        }

        if !dirty {
            return Ok(false);
        }
        if let Err(e) = self.store.save_profile(&profile) {
            error!(username, kind = %schema.kind, error = %e, "failed to save profile");
            stats.errors += 1;
            // The stored profile still references the previous blobs.
            for (old, new) in &replaced {
                if old.as_ref() != Some(new) {
                    self.discard_blob(username, new);
                }
            }
            return Ok(false);
        }
        for (old, new) in replaced {
            if let Some(old) = old.filter(|old| *old != new) {
                self.discard_blob(username, &old);
            }
        }
        Ok(true)
    }

    fn discard_blob(&self, username: &str, name: &str) {
        if let Err(e) = self.blobs.delete(name) {
            warn!(username, blob = %name, error = %e, "could not delete unreferenced photo");
        }
    }
}

/// Blob name for a photo: placeholders first, then strftime on local time.
pub fn render_blob_name(template: &str, username: &str) -> Result<String, ConfigError> {
    let pattern = template
        .replace("{username}", &username.replace('%', "%%"))
        .replace("{uuid4}", &Uuid::new_v4().to_string());
    let mut name = String::new();
    write!(name, "{}", Local::now().format(&pattern)).map_err(|_| {
        ConfigError::invalid(
            "users.photo_name_template",
            format!("'{template}' is not a valid strftime pattern"),
        )
    })?;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::blob::FsBlobStore;
    use crate::db::Database;
    use crate::errors::BlobError;

    fn schema(case: FieldCase) -> ProfileSchema {
        ProfileSchema::from_config(
            &ProfileConfig {
                name: "directory".into(),
                fields: vec!["department".into(), "thumbnailPhoto".into()],
            },
            case,
        )
    }

    /// Blob store whose saves fail while `fail_saves` is set.
    struct FlakyBlobs {
        inner: FsBlobStore,
        fail_saves: AtomicBool,
    }

    impl BlobStore for FlakyBlobs {
        fn read(&self, name: &str) -> Result<Option<Vec<u8>>, BlobError> {
            self.inner.read(name)
        }

        fn save(&self, name: &str, bytes: &[u8]) -> Result<String, BlobError> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(BlobError::Io(std::io::Error::other("disk full")));
            }
            self.inner.save(name, bytes)
        }

        fn delete(&self, name: &str) -> Result<(), BlobError> {
            self.inner.delete(name)
        }
    }

    fn user_in(db: &Database, username: &str) -> LocalUser {
        db.get_or_create_user(username, &Default::default()).unwrap().0
    }

    #[test]
    fn test_schema_from_config() {
        let lower = schema(FieldCase::Lower);
        assert_eq!(lower.kind, "directory");
        let kinds: Vec<_> = lower.fields.iter().map(|f| (f.name.as_str(), f.kind)).collect();
        assert_eq!(
            kinds,
            [("department", ProfileField::Text), ("thumbnailphoto", ProfileField::Blob)]
        );

        let upper = schema(FieldCase::Upper);
        assert_eq!(upper.fields[0].name, "DEPARTMENT");
        assert_eq!(upper.fields[0].attribute, "department");
    }

    #[test]
    fn test_render_blob_name() {
        let name = render_blob_name("{username}_{uuid4}.jpg", "jdoe").unwrap();
        assert!(name.starts_with("jdoe_"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.len(), "jdoe_".len() + 36 + ".jpg".len());

        let name = render_blob_name("%Y/{username}.jpg", "50%off").unwrap();
        assert!(name.ends_with("/50%off.jpg"));
    }

    #[test]
    fn test_apply_text_and_photo_fields() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path()).unwrap();
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let (user, _) = db
            .get_or_create_user("jdoe", &Default::default())
            .unwrap();

        let sync = ProfileSync {
            store: &db,
            blobs: &blobs,
            separator: "|",
            name_template: "{username}_{uuid4}.jpg",
        };
        let schemas = [schema(FieldCase::Lower)];
        let record = DirectoryRecord::new("CN=jdoe")
            .with_text("Department", &["Sales", "EMEA"])
            .with_binary("thumbnailPhoto", vec![1, 2, 3]);
        let mut stats = EntityStats::default();

        assert!(sync.apply(&schemas, &user, "jdoe", &record, &mut stats).unwrap());
        let (profile, created) = db.get_or_create_profile("directory", user.id).unwrap();
        assert!(!created);
        assert_eq!(profile.fields["department"], "Sales|EMEA");
        let first_blob = profile.fields["thumbnailphoto"].clone();
        assert_eq!(blobs.read(&first_blob).unwrap().as_deref(), Some(&[1u8, 2, 3][..]));

        // Unchanged input leaves the profile alone.
        assert!(!sync.apply(&schemas, &user, "jdoe", &record, &mut stats).unwrap());

        // A new photo replaces the old blob once the profile is saved.
        let record = record.with_binary("thumbnailPhoto", vec![9, 9]);
        assert!(sync.apply(&schemas, &user, "jdoe", &record, &mut stats).unwrap());
        let (profile, _) = db.get_or_create_profile("directory", user.id).unwrap();
        assert_ne!(profile.fields["thumbnailphoto"], first_blob);
        assert_eq!(blobs.read(&first_blob).unwrap(), None);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_failed_photo_save_keeps_previous_blob() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FlakyBlobs {
            inner: FsBlobStore::new(dir.path()).unwrap(),
            fail_saves: AtomicBool::new(false),
        };
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let user = user_in(&db, "alice");
        let sync = ProfileSync {
            store: &db,
            blobs: &blobs,
            separator: "|",
            name_template: "{username}.jpg",
        };
        let schemas = [schema(FieldCase::Lower)];
        let mut stats = EntityStats::default();

        let record = DirectoryRecord::new("CN=alice").with_binary("thumbnailPhoto", vec![1, 1]);
        assert!(sync.apply(&schemas, &user, "alice", &record, &mut stats).unwrap());
        assert_eq!(stats.errors, 0);

        blobs.fail_saves.store(true, Ordering::SeqCst);
        let record = record.with_binary("thumbnailPhoto", vec![2, 2]);
        assert!(!sync.apply(&schemas, &user, "alice", &record, &mut stats).unwrap());
        assert_eq!(stats.errors, 1);

        let (profile, _) = db.get_or_create_profile("directory", user.id).unwrap();
        assert_eq!(profile.fields["thumbnailphoto"], "alice.jpg");
        assert_eq!(blobs.read("alice.jpg").unwrap().as_deref(), Some(&[1u8, 1][..]));
    }

    #[test]
    fn test_fixed_photo_name_is_overwritten_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path()).unwrap();
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let user = user_in(&db, "alice");
        let sync = ProfileSync {
            store: &db,
            blobs: &blobs,
            separator: "|",
            name_template: "{username}.jpg",
        };
        let schemas = [schema(FieldCase::Lower)];
        let mut stats = EntityStats::default();

        let record = DirectoryRecord::new("CN=alice").with_binary("thumbnailPhoto", vec![1]);
        sync.apply(&schemas, &user, "alice", &record, &mut stats).unwrap();
        let record = record.with_binary("thumbnailPhoto", vec![2]);
        assert!(sync.apply(&schemas, &user, "alice", &record, &mut stats).unwrap());

        assert_eq!(blobs.read("alice.jpg").unwrap().as_deref(), Some(&[2u8][..]));
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_photo_names_with_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path()).unwrap();
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let user = user_in(&db, "alice");
        let sync = ProfileSync {
            store: &db,
            blobs: &blobs,
            separator: "|",
            name_template: "photos/{username}_{uuid4}.jpg",
        };
        let record = DirectoryRecord::new("CN=alice")
            .with_text("department", &["Sales"])
            .with_binary("thumbnailPhoto", vec![7, 7]);
        let mut stats = EntityStats::default();

        assert!(sync
            .apply(&[schema(FieldCase::Lower)], &user, "alice", &record, &mut stats)
            .unwrap());
        assert_eq!(stats.errors, 0);

        let (profile, _) = db.get_or_create_profile("directory", user.id).unwrap();
        let name = &profile.fields["thumbnailphoto"];
        assert!(name.starts_with("photos/alice_"));
        assert_eq!(profile.fields["department"], "Sales");
        assert_eq!(blobs.read(name).unwrap().as_deref(), Some(&[7u8, 7][..]));
        assert!(dir.path().join("photos").is_dir());
    }

    #[test]
    fn test_apply_rejects_invalid_text() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path()).unwrap();
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let (user, _) = db
            .get_or_create_user("jdoe", &Default::default())
            .unwrap();
        let sync = ProfileSync {
            store: &db,
            blobs: &blobs,
            separator: "|",
            name_template: "{username}.jpg",
        };
        let record = DirectoryRecord::new("CN=jdoe").with_binary("department", vec![0xc3, 0x28]);
        let err = sync
            .apply(&[schema(FieldCase::Lower)], &user, "jdoe", &record, &mut EntityStats::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "users.profiles.directory.department"));
    }
}
