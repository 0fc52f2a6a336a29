//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `user_version`
//! pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::StoreError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "identity tables",
        r#"
        CREATE TABLE IF NOT EXISTS local_users (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            username         TEXT    NOT NULL COLLATE NOCASE UNIQUE,
            is_active        INTEGER NOT NULL DEFAULT 1,
            password_usable  INTEGER NOT NULL DEFAULT 1,
            fields           TEXT    NOT NULL DEFAULT '{}',
            created_at       TEXT    NOT NULL,
            updated_at       TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS local_groups (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT    NOT NULL COLLATE NOCASE UNIQUE,
            fields      TEXT    NOT NULL DEFAULT '{}',
            created_at  TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memberships (
            user_id     INTEGER NOT NULL REFERENCES local_users (id) ON DELETE CASCADE,
            group_id    INTEGER NOT NULL REFERENCES local_groups (id) ON DELETE CASCADE,
            created_at  TEXT    NOT NULL,
            PRIMARY KEY (user_id, group_id)
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_group ON memberships (group_id);

        CREATE TABLE IF NOT EXISTS profiles (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            kind        TEXT    NOT NULL,
            user_id     INTEGER NOT NULL REFERENCES local_users (id) ON DELETE CASCADE,
            fields      TEXT    NOT NULL DEFAULT '{}',
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL,
            UNIQUE (kind, user_id)
        );
        "#,
    ),
    (
        2,
        "sync cursors, audit log and key-value state",
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            uri                         TEXT    PRIMARY KEY,
            last_changed                TEXT    NOT NULL,
            incremental_runs_remaining  INTEGER NOT NULL DEFAULT 0,
            total_runs                  INTEGER NOT NULL DEFAULT 0,
            last_run_kind               TEXT    NOT NULL DEFAULT 'incremental'
                                        CHECK (last_run_kind IN ('full', 'incremental')),
            last_stats                  TEXT    NOT NULL DEFAULT '{}',
            updated_at                  TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT    NOT NULL,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log (created_at);

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
];

/// Apply every migration newer than the database's current version.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, StoreError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), StoreError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
