//! Sync scheduler that runs sync runs on a configurable interval and
//! supports signal-triggered immediate runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tracing::{error, info, warn};

use dirsync_core::db::Database;
use dirsync_core::directory::DirectoryTransport;
use dirsync_core::models::{AuditEntry, RunSummary, SyncMode};
use dirsync_core::sync_engine::SyncEngine;

/// Tracks aggregate statistics across runs.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub total_runs: AtomicU64,
    pub failed_runs: AtomicU64,
    /// Record-level errors summed over successful runs.
    pub record_errors: AtomicU64,
    pub consecutive_failures: AtomicU64,
}

/// The sync scheduler.
///
/// If a run is still in progress when the next one is due, the scheduler
/// skips it rather than queuing up.
pub struct Scheduler<T: DirectoryTransport> {
    engine: Arc<SyncEngine<T>>,
    db: Arc<Database>,
    poll_interval: Duration,
    trigger_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

impl<T: DirectoryTransport> Scheduler<T> {
    pub fn new(
        engine: Arc<SyncEngine<T>>,
        db: Arc<Database>,
        poll_interval: Duration,
        trigger_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            engine,
            db,
            poll_interval,
            trigger_rx,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Main scheduler loop. The first run starts immediately; the loop
    /// ends once `shutdown` is notified.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.maybe_run("scheduled").await;
                }
                Some(()) = self.trigger_rx.recv() => {
                    info!("immediate sync requested");
                    self.maybe_run("signal").await;
                    // Reset the interval so we don't sync again too soon
                    interval.reset();
                }
            }
        }
    }

    /// Attempt one run. Returns `false` if it failed or was skipped.
    pub async fn maybe_run(&self, trigger: &str) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(trigger, "skipping sync run: previous run still in progress");
            return false;
        }

        let run_number = self.stats.total_runs.fetch_add(1, Ordering::SeqCst) + 1;
        info!(run = run_number, trigger, "starting sync run");
        self.set_state("sync_state", "running");

        let ok = match self.engine.run(SyncMode::Default).await {
            Ok(summary) => {
                self.record_success(run_number, &summary);
                true
            }
            Err(e) => {
                let failed = self.stats.failed_runs.fetch_add(1, Ordering::SeqCst) + 1;
                let consecutive = self
                    .stats
                    .consecutive_failures
                    .fetch_add(1, Ordering::SeqCst)
                    + 1;
                error!(
                    run = run_number,
                    error = %e,
                    failed_runs = failed,
                    consecutive_failures = consecutive,
                    "sync run failed"
                );
                self.audit(&AuditEntry::failure("sync_run", &e.to_string()));
                self.set_state("sync_state", "error");
                false
            }
        };

        self.set_state("last_sync_at", &Utc::now().to_rfc3339());
        self.running.store(false, Ordering::SeqCst);
        ok
    }

    fn record_success(&self, run_number: u64, summary: &RunSummary) {
        self.stats.consecutive_failures.store(0, Ordering::SeqCst);
        self.stats
            .record_errors
            .fetch_add(summary.stats.total_errors(), Ordering::SeqCst);

        info!(
            run = run_number,
            cursor_updated = summary.cursor_updated(),
            record_errors = summary.stats.total_errors(),
            duration_secs = summary.duration_secs(),
            "sync run completed successfully"
        );

        self.audit(&AuditEntry::for_run(summary));
        match serde_json::to_string(summary) {
            Ok(json) => self.set_state("last_run_summary", &json),
            Err(e) => warn!(error = %e, "could not serialize run summary"),
        }
        self.set_state("sync_state", "idle");
    }

    fn audit(&self, entry: &AuditEntry) {
        if let Err(e) = self.db.insert_audit_entry(entry) {
            warn!(error = %e, "failed to write audit entry");
        }
    }

    fn set_state(&self, key: &str, value: &str) {
        if let Err(e) = self.db.set_state(key, value) {
            warn!(key, error = %e, "failed to record daemon state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_core::blob::FsBlobStore;
    use dirsync_core::config::AppConfig;
    use dirsync_core::directory::{DirectorySession, SearchPage, SearchQuery};
    use dirsync_core::errors::DirectoryError;

    /// Transport whose endpoints all refuse the bind.
    struct Unreachable;

    struct NoSession;

    impl DirectorySession for NoSession {
        async fn search_page(
            &mut self,
            _query: &SearchQuery,
            _page_size: u32,
            _cookie: &[u8],
        ) -> Result<SearchPage, DirectoryError> {
            Ok(SearchPage::default())
        }

        async fn unbind(self) -> Result<(), DirectoryError> {
            Ok(())
        }
    }

    impl DirectoryTransport for Unreachable {
        type Session = NoSession;

        async fn bind(&self, uri: &str, _: &str, _: &str) -> Result<NoSession, DirectoryError> {
            Err(DirectoryError::BindFailed {
                uri: uri.to_string(),
                detail: "connection refused".into(),
            })
        }
    }

    fn scheduler(tmp: &tempfile::TempDir) -> Scheduler<Unreachable> {
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

        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let blobs = Arc::new(FsBlobStore::new(tmp.path()).unwrap());
        let engine = Arc::new(SyncEngine::new(config, Unreachable, db.clone(), db.clone(), blobs));
        let (_tx, rx) = mpsc::channel(1);
        Scheduler::new(engine, db, Duration::from_secs(60), rx)
    }

    #[tokio::test]
    async fn test_failed_run_is_audited_and_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let sched = scheduler(&tmp);

        assert!(!sched.maybe_run("test").await);
        assert!(!sched.maybe_run("test").await);

        let stats = sched.stats();
        assert_eq!(stats.total_runs.load(Ordering::SeqCst), 2);
        assert_eq!(stats.failed_runs.load(Ordering::SeqCst), 2);
        assert_eq!(stats.consecutive_failures.load(Ordering::SeqCst), 2);
        assert_eq!(stats.record_errors.load(Ordering::SeqCst), 0);
        assert_eq!(sched.db.count_failed_runs().unwrap(), 2);
        assert_eq!(sched.db.get_state("sync_state").unwrap().as_deref(), Some("error"));
        assert!(sched.db.get_state("last_sync_at").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_is_skipped_while_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let sched = scheduler(&tmp);
        sched.running.store(true, Ordering::SeqCst);

        assert!(!sched.maybe_run("test").await);
        assert_eq!(sched.stats().total_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sched = scheduler(&tmp);
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(5), sched.run(shutdown))
            .await
            .unwrap();
    }
}
