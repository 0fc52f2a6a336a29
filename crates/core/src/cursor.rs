//! Per-endpoint sync cursors and the full/incremental cadence.
//!
//! A cursor is keyed by endpoint URI. Its counter decides whether the next
//! run may use incremental filters: only a positive value allows them and
//! counts down, zero forces a full run (after which the counter resets), and
//! a negative value is frozen: it never counts down or resets, so every run
//! queries with the full filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::IncrementalConfig;
use crate::directory::filter::incremental_filter;
use crate::errors::ConfigError;
use crate::models::{RunKind, RunStats};

/// Watermark of a cursor that has never completed a run
/// (1990-01-01T01:01:01Z).
const INITIAL_WATERMARK_SECS: i64 = 631_155_661;

pub fn initial_watermark() -> DateTime<Utc> {
    DateTime::from_timestamp(INITIAL_WATERMARK_SECS, 0).unwrap_or_default()
}

/// Persisted sync state for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub uri: String,
    pub last_changed: DateTime<Utc>,
    pub incremental_runs_remaining: i64,
    pub total_runs: i64,
    pub last_run_kind: RunKind,
    pub last_stats: RunStats,
    pub updated_at: DateTime<Utc>,
}

/// Full and incremental filters of one entity kind.
#[derive(Debug, Clone, Copy)]
pub struct EntityFilters<'a> {
    pub full: &'a str,
    pub incremental: &'a str,
    pub incremental_enabled: bool,
}

impl SyncCursor {
    /// A cursor for a URI seen for the first time; its first run is full.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            last_changed: initial_watermark(),
            incremental_runs_remaining: 0,
            total_runs: 0,
            last_run_kind: RunKind::Incremental,
            last_stats: RunStats::default(),
            updated_at: Utc::now(),
        }
    }

    /// Whether the counter permits an incremental query.
    pub fn allows_incremental(&self) -> bool {
        self.incremental_runs_remaining > 0
    }

    /// Pick the filter for one entity kind against this endpoint.
    pub fn select_filter(
        &self,
        filters: EntityFilters<'_>,
        incremental: &IncrementalConfig,
    ) -> Result<String, ConfigError> {
        if filters.incremental_enabled && self.allows_incremental() {
            incremental_filter(
                filters.incremental,
                self.last_changed,
                incremental.time_offset_mins,
                &incremental.timestamp_format,
            )
        } else {
            Ok(filters.full.to_string())
        }
    }

    /// Record a completed run and advance the cadence.
    ///
    /// `watermark` is the run start time, captured before any directory
    /// query.
    pub fn complete_run(
        &mut self,
        watermark: DateTime<Utc>,
        stats: RunStats,
        runs_between_full: i64,
    ) -> RunKind {
        self.total_runs += 1;
        let kind = if self.incremental_runs_remaining == 0 {
            self.incremental_runs_remaining = runs_between_full;
            RunKind::Full
        } else {
            if self.incremental_runs_remaining > 0 {
                self.incremental_runs_remaining -= 1;
            }
            RunKind::Incremental
        };
        self.last_run_kind = kind;
        self.last_changed = watermark;
        self.last_stats = stats;
        self.updated_at = Utc::now();
        kind
    }

    /// Runs left before a forced full run, or `None` for a frozen counter.
    pub fn next_full_in(&self) -> Option<i64> {
        (self.incremental_runs_remaining >= 0).then_some(self.incremental_runs_remaining)
    }
}
