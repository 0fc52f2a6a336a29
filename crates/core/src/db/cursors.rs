//! [`CursorStore`] implementation over the `sync_cursors` table.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::debug;

use super::{parse_timestamp, Database};
use crate::cursor::{initial_watermark, SyncCursor};
use crate::errors::StoreError;
use crate::models::{RunKind, RunStats};
use crate::store::CursorStore;

const CURSOR_COLUMNS: &str = "uri, last_changed, incremental_runs_remaining, total_runs, \
                              last_run_kind, last_stats, updated_at";

struct RawCursor {
    uri: String,
    last_changed: String,
    incremental_runs_remaining: i64,
    total_runs: i64,
    last_run_kind: String,
    last_stats: String,
    updated_at: String,
}

impl RawCursor {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uri: row.get(0)?,
            last_changed: row.get(1)?,
            incremental_runs_remaining: row.get(2)?,
            total_runs: row.get(3)?,
            last_run_kind: row.get(4)?,
            last_stats: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_cursor(self) -> Result<SyncCursor, StoreError> {
        let last_stats: RunStats = if self.last_stats.trim() == "{}" {
            RunStats::default()
        } else {
            serde_json::from_str(&self.last_stats)
                .map_err(|e| StoreError::Data(format!("cursor stats for {}: {e}", self.uri)))?
        };
        Ok(SyncCursor {
            last_changed: parse_timestamp(&self.last_changed)?,
            incremental_runs_remaining: self.incremental_runs_remaining,
            total_runs: self.total_runs,
            last_run_kind: RunKind::from_str_val(&self.last_run_kind),
            last_stats,
            updated_at: parse_timestamp(&self.updated_at)?,
            uri: self.uri,
        })
    }
}

fn select_cursor(conn: &Connection, uri: &str) -> Result<SyncCursor, StoreError> {
    conn.query_row(
        &format!("SELECT {CURSOR_COLUMNS} FROM sync_cursors WHERE uri = ?1"),
        params![uri],
        RawCursor::from_row,
    )?
    .into_cursor()
}

impl CursorStore for Database {
    fn resolve_cursor(&self, uri: &str) -> Result<SyncCursor, StoreError> {
        let conn = self.conn();
        let fresh = SyncCursor::new(uri);
        let inserted = conn.execute(
            "INSERT INTO sync_cursors (uri, last_changed, incremental_runs_remaining, total_runs,
                                       last_run_kind, last_stats, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)
             ON CONFLICT(uri) DO NOTHING",
            params![
                uri,
                initial_watermark().to_rfc3339(),
                fresh.incremental_runs_remaining,
                fresh.last_run_kind.to_string(),
                serde_json::to_string(&fresh.last_stats)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        if inserted > 0 {
            debug!(uri, "created sync cursor");
        }
        select_cursor(&conn, uri)
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<(), StoreError> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE sync_cursors
             SET last_changed = ?1, incremental_runs_remaining = ?2, total_runs = ?3,
                 last_run_kind = ?4, last_stats = ?5, updated_at = ?6
             WHERE uri = ?7",
            params![
                cursor.last_changed.to_rfc3339(),
                cursor.incremental_runs_remaining,
                cursor.total_runs,
                cursor.last_run_kind.to_string(),
                serde_json::to_string(&cursor.last_stats)?,
                cursor.updated_at.to_rfc3339(),
                cursor.uri
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "sync cursor".into(),
                id: cursor.uri.clone(),
            });
        }
        debug!(uri = %cursor.uri, total_runs = cursor.total_runs, "saved sync cursor");
        Ok(())
    }

    fn list_cursors(&self) -> Result<Vec<SyncCursor>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {CURSOR_COLUMNS} FROM sync_cursors ORDER BY uri"))?;
        let rows = stmt
            .query_map([], RawCursor::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawCursor::into_cursor).collect()
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

    #[test]
    fn test_resolve_creates_once() {
        let db = db();
        let first = db.resolve_cursor("ldap://dc1").unwrap();
        assert_eq!(first.incremental_runs_remaining, 0);
        assert_eq!(first.total_runs, 0);
        assert_eq!(first.last_changed, initial_watermark());
        assert_eq!(first.last_run_kind, RunKind::Incremental);

        let second = db.resolve_cursor("ldap://dc1").unwrap();
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(db.list_cursors().unwrap().len(), 1);
    }

    #[test]
    fn test_save_roundtrips_stats() {
        let db = db();
        let mut cursor = db.resolve_cursor("ldap://dc1").unwrap();
        let mut stats = RunStats::default();
        stats.groups.added = 4;
        stats.users.errors = 1;
        let kind = cursor.complete_run(Utc::now(), stats, 5);
        db.save_cursor(&cursor).unwrap();

        let stored = db.resolve_cursor("ldap://dc1").unwrap();
        assert_eq!(kind, RunKind::Full);
        assert_eq!(stored.last_run_kind, RunKind::Full);
        assert_eq!(stored.incremental_runs_remaining, 5);
        assert_eq!(stored.total_runs, 1);
        assert_eq!(stored.last_stats, stats);
    }

    #[test]
    fn test_save_unknown_cursor_fails() {
        let db = db();
        let cursor = SyncCursor::new("ldap://nowhere");
        assert!(matches!(
            db.save_cursor(&cursor),
            Err(StoreError::NotFound { .. })
        ));
    }
}
