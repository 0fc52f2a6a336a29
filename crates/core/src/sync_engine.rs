//! Directory-to-local synchronization engine.
//!
//! The [`SyncEngine`] sequences each run:
//!
//! 1. Resolve the configuration for the requested mode and validate it
//!    against the identity store, before any directory contact.
//! 2. Fetch groups and create the missing ones.
//! 3. Fetch users; for each, sync fields, memberships and profiles.
//! 4. Unbind and remember the failover order for the next run.
//! 5. Advance the cursor of the endpoint, if both fetches used the same one.
//!
//! A lock flag prevents overlapping runs within one process.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::config::{AppConfig, RemovalAction};
use crate::cursor::{EntityFilters, SyncCursor};
use crate::directory::filter::membership_filter;
use crate::directory::{DirectoryClient, DirectoryTransport, SearchOutcome, SearchQuery};
use crate::errors::{StoreError, SyncError};
use crate::hooks::{DeactivateUser, RemovedUserHook, UserHook};
use crate::mapper::first_text;
use crate::models::{
    DirectoryRecord, EntityStats, LocalUser, RunKind, RunStats, RunSummary, SyncMode,
};
use crate::plan::RunPlan;
use crate::reconcile::users::ProgressLog;
use crate::reconcile::{reconcile_groups, reconcile_memberships, UserOutcome, UserReconciler};
use crate::store::{CursorStore, IdentityStore};

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

/// State carried through one run.
#[derive(Debug)]
pub struct RunContext {
    /// Run start; becomes the cursor watermark.
    pub started_at: DateTime<Utc>,
    pub stats: RunStats,
    pub groups_uri: Option<String>,
    pub users_uri: Option<String>,
    cursors: HashMap<String, SyncCursor>,
}

impl RunContext {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            stats: RunStats::default(),
            groups_uri: None,
            users_uri: None,
            cursors: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The directory sync engine.
pub struct SyncEngine<T: DirectoryTransport> {
    config: AppConfig,
    transport: T,
    identity: Arc<dyn IdentityStore>,
    cursors: Arc<dyn CursorStore>,
    blobs: Arc<dyn BlobStore>,
    user_hooks: Vec<Arc<dyn UserHook>>,
    removed_hooks: Vec<Arc<dyn RemovedUserHook>>,
    /// Endpoint order, with the last working URI first.
    failover: Mutex<Vec<String>>,
    /// Atomic flag preventing concurrent runs.
    running: Arc<AtomicBool>,
}

impl<T: DirectoryTransport> SyncEngine<T> {
    /// Create an engine. A deactivating removed-user hook is registered when
    /// `users.removal_action` is `deactivate`.
    pub fn new(
        config: AppConfig,
        transport: T,
        identity: Arc<dyn IdentityStore>,
        cursors: Arc<dyn CursorStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        info!("initializing sync engine");
        let mut removed_hooks: Vec<Arc<dyn RemovedUserHook>> = Vec::new();
        if config.users.removal_action == RemovalAction::Deactivate {
            removed_hooks.push(Arc::new(DeactivateUser));
        }
        Self {
            failover: Mutex::new(config.directory.uris.to_vec()),
            config,
            transport,
            identity,
            cursors,
            blobs,
            user_hooks: Vec::new(),
            removed_hooks,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_user_hook(mut self, hook: Arc<dyn UserHook>) -> Self {
        self.user_hooks.push(hook);
        self
    }

    pub fn with_removed_user_hook(mut self, hook: Arc<dyn RemovedUserHook>) -> Self {
        self.removed_hooks.push(hook);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Check if a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Endpoint order the next run will try.
    pub async fn failover_order(&self) -> Vec<String> {
        self.failover.lock().await.clone()
    }

    pub fn list_cursors(&self) -> Result<Vec<SyncCursor>, StoreError> {
        self.cursors.list_cursors()
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one run.
    ///
    /// Configuration errors surface before any bind. Record-level failures
    /// only move counters; an exhausted failover list fails the run.
    pub async fn run(&self, mode: SyncMode) -> Result<RunSummary, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = RunGuard(self.running.clone());

        let mut ctx = RunContext::new(Utc::now());
        let mut config = self.config.clone();
        config.apply_mode(mode);
        let plan = RunPlan::build(config, self.identity.as_ref())?;
        info!(mode = %mode, "starting sync run");

        let directory = &plan.config.directory;
        let mut client = DirectoryClient::new(
            &self.transport,
            self.failover.lock().await.clone(),
            directory.bind_dn.clone(),
            directory.bind_password.clone().unwrap_or_default(),
            directory.effective_page_size(),
        );

        let result = self.run_passes(&plan, &mut client, &mut ctx).await;
        let order = client.close().await;
        *self.failover.lock().await = order;
        result?;

        let cursor_kind = self.finalize_cursor(&plan, &mut ctx)?;
        let summary = RunSummary {
            mode: mode.to_string(),
            stats: ctx.stats,
            groups_uri: ctx.groups_uri,
            users_uri: ctx.users_uri,
            cursor_kind,
            started_at: ctx.started_at,
            completed_at: Utc::now(),
        };
        info!(
            users = %summary.stats.users,
            groups = %summary.stats.groups,
            memberships = %summary.stats.memberships,
            duration_secs = summary.duration_secs(),
            "sync run completed"
        );
        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    async fn run_passes(
        &self,
        plan: &RunPlan,
        client: &mut DirectoryClient<'_, T>,
        ctx: &mut RunContext,
    ) -> Result<(), SyncError> {
        if plan.config.groups.enabled {
            self.sync_groups(plan, client, ctx).await?;
        } else {
            debug!("group sync disabled");
        }
        if plan.config.users.enabled {
            self.sync_users(plan, client, ctx).await?;
        } else {
            debug!("user sync disabled");
        }
        Ok(())
    }

    async fn sync_groups(
        &self,
        plan: &RunPlan,
        client: &mut DirectoryClient<'_, T>,
        ctx: &mut RunContext,
    ) -> Result<(), SyncError> {
        let groups = &plan.config.groups;
        let filters = EntityFilters {
            full: &groups.filter,
            incremental: &groups.incremental_filter,
            incremental_enabled: groups.incremental,
        };
        let outcome = self
            .fetch(
                plan,
                client,
                ctx,
                plan.config.group_search_base(),
                filters,
                &plan.group_attributes,
            )
            .await?;
        info!(uri = %outcome.uri, count = outcome.items.len(), "fetched groups");
        ctx.groups_uri = Some(outcome.uri);

        reconcile_groups(
            self.identity.as_ref(),
            plan,
            &outcome.items,
            &mut ctx.stats.groups,
        )?;
        Ok(())
    }

    async fn sync_users(
        &self,
        plan: &RunPlan,
        client: &mut DirectoryClient<'_, T>,
        ctx: &mut RunContext,
    ) -> Result<(), SyncError> {
        let users = &plan.config.users;
        let filters = EntityFilters {
            full: &users.filter,
            incremental: &users.incremental_filter,
            incremental_enabled: users.incremental,
        };
        let outcome = self
            .fetch(
                plan,
                client,
                ctx,
                plan.config.user_search_base(),
                filters,
                &plan.user_attributes,
            )
            .await?;
        info!(uri = %outcome.uri, count = outcome.items.len(), "fetched users");
        ctx.users_uri = Some(outcome.uri);

        let reconciler = UserReconciler::new(
            self.identity.as_ref(),
            self.blobs.as_ref(),
            plan,
            &self.user_hooks,
            &self.removed_hooks,
        );
        let stats = &mut ctx.stats;
        stats.users.total += outcome.items.len() as u64;
        let mut progress = ProgressLog::new(outcome.items.len(), users.show_progress);

        for (index, item) in outcome.items.iter().enumerate() {
            progress.advance(index + 1);
            let Some(record) = item.as_record() else {
                warn!(item = ?item, "skipping malformed user entry");
                stats.users.errors += 1;
                continue;
            };

            let UserOutcome::Synced {
                user,
                username,
                created,
                updated,
            } = reconciler.sync_record(record, &mut stats.users)?
            else {
                continue;
            };

            if plan.config.memberships.enabled {
                self.sync_memberships(plan, client, &user, record, &mut stats.memberships)
                    .await?;
            }
            let profiles_changed = reconciler.sync_profiles(&user, &username, record, &mut stats.users)?;
            if !created && (updated || profiles_changed) {
                stats.users.updated += 1;
            }
        }

        if stats.users.has_changes() || stats.users.errors > 0 {
            info!(stats = %stats.users, "users synced");
        }
        Ok(())
    }

    async fn sync_memberships(
        &self,
        plan: &RunPlan,
        client: &mut DirectoryClient<'_, T>,
        user: &LocalUser,
        record: &DirectoryRecord,
        stats: &mut EntityStats,
    ) -> Result<(), SyncError> {
        let memberships = &plan.config.memberships;
        let dn = match first_text(record, &memberships.dn_attribute)? {
            Some(dn) if !dn.trim().is_empty() => dn,
            _ => {
                warn!(
                    username = %user.username,
                    attribute = %memberships.dn_attribute,
                    "user has no DN attribute, skipping memberships"
                );
                stats.errors += 1;
                return Ok(());
            }
        };

        let query = SearchQuery {
            base: plan.config.group_search_base().to_string(),
            filter: membership_filter(&memberships.filter, &dn),
            attributes: plan.group_attributes.clone(),
        };
        match client.search(&query).await {
            Ok(outcome) => {
                reconcile_memberships(self.identity.as_ref(), plan, user, &outcome.items, stats)?
            }
            Err(e) => {
                error!(username = %user.username, error = %e, "membership search failed");
                stats.errors += 1;
            }
        }
        Ok(())
    }

    /// Search with the filter chosen by the cursor of whichever endpoint
    /// serves the request.
    async fn fetch(
        &self,
        plan: &RunPlan,
        client: &mut DirectoryClient<'_, T>,
        ctx: &mut RunContext,
        base: &str,
        filters: EntityFilters<'_>,
        attributes: &[String],
    ) -> Result<SearchOutcome, SyncError> {
        let store = self.cursors.as_ref();
        let incremental = &plan.config.incremental;
        let cache = &mut ctx.cursors;
        client
            .search_with(|uri| {
                let cursor = match cache.entry(uri.to_string()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(store.resolve_cursor(uri)?),
                };
                let filter = cursor.select_filter(filters, incremental)?;
                debug!(uri, filter = %filter, "selected search filter");
                Ok::<_, SyncError>(SearchQuery {
                    base: base.to_string(),
                    filter,
                    attributes: attributes.to_vec(),
                })
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Cursor
    // -----------------------------------------------------------------------

    fn finalize_cursor(
        &self,
        plan: &RunPlan,
        ctx: &mut RunContext,
    ) -> Result<Option<RunKind>, SyncError> {
        match (&ctx.groups_uri, &ctx.users_uri) {
            (Some(groups_uri), Some(users_uri)) if groups_uri == users_uri => {
                let mut cursor = match ctx.cursors.remove(users_uri) {
                    Some(cursor) => cursor,
                    None => self.cursors.resolve_cursor(users_uri)?,
                };
                let kind = cursor.complete_run(
                    ctx.started_at,
                    ctx.stats,
                    plan.config.incremental.runs_between_full,
                );
                self.cursors.save_cursor(&cursor)?;
                info!(
                    uri = %cursor.uri,
                    kind = %kind,
                    total_runs = cursor.total_runs,
                    next_full_in = ?cursor.next_full_in(),
                    "cursor updated"
                );
                Ok(Some(kind))
            }
            (None, None) => {
                debug!("no directory fetch ran, cursor left unchanged");
                Ok(None)
            }
            (groups_uri, users_uri) => {
                error!(
                    groups_uri = ?groups_uri,
                    users_uri = ?users_uri,
                    "groups and users were not fetched from the same endpoint, cursor left unchanged"
                );
                Ok(None)
            }
        }
    }
}

/// Drop guard that resets the `running` flag to `false`.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
