//! Reporting queries: audit log, key-value state and identity listings.

use chrono::Utc;
use rusqlite::params;
use tracing::debug;

use super::{decode_fields, Database};
use crate::errors::StoreError;
use crate::models::{self, LocalUser};

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

/// A group with its current member count.
#[derive(Debug, Clone)]
pub struct GroupSummary {
    pub id: i64,
    pub name: String,
    pub members: i64,
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- audit_log ----------------------------------------------------------

    /// Insert an audit entry from a model struct.
    pub fn insert_audit_entry(&self, entry: &models::AuditEntry) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, details, success, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.action,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, "inserted audit_log entry");
        Ok(id)
    }

    /// List recent audit-log entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    details: row.get(2)?,
                    success: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count audit entries that record a failed run.
    pub fn count_failed_runs(&self) -> Result<i64, StoreError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE success = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM kv_state WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(Ok(val)) => Ok(Some(val)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }

    // -- identity listings --------------------------------------------------

    /// List local users ordered by username.
    pub fn list_users(&self, limit: u32, include_inactive: bool) -> Result<Vec<LocalUser>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, username, is_active, password_usable, fields
             FROM local_users WHERE is_active = 1 OR ?1
             ORDER BY username LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![include_inactive, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, username, is_active, password_usable, fields)| {
                Ok(LocalUser {
                    id,
                    username,
                    is_active,
                    password_usable,
                    fields: decode_fields(&fields)?,
                })
            })
            .collect()
    }

    /// List local groups with their member counts.
    pub fn list_groups(&self, limit: u32) -> Result<Vec<GroupSummary>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.name, COUNT(m.user_id)
             FROM local_groups g LEFT JOIN memberships m ON m.group_id = g.id
             GROUP BY g.id, g.name
             ORDER BY g.name LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(GroupSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    members: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Active and total user counts.
    pub fn count_users(&self) -> Result<(i64, i64), StoreError> {
        let conn = self.conn();
        let counts = conn.query_row(
            "SELECT COALESCE(SUM(is_active), 0), COUNT(*) FROM local_users",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }
}
