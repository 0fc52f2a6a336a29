//! dirsync command-line management tool.
//!
//! Provides subcommands for running a sync by hand, inspecting cursors and
//! the audit log, listing the local identity store, and generating /
//! validating configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use dirsync_core::blob::FsBlobStore;
use dirsync_core::config::AppConfig;
use dirsync_core::db::Database;
use dirsync_core::directory::LdapTransport;
use dirsync_core::models::{AuditEntry, RunSummary, SyncMode};
use dirsync_core::store::CursorStore;
use dirsync_core::sync_engine::SyncEngine;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// dirsync command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "dirsync",
    version,
    about = "Run and inspect directory to identity store synchronization"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "/etc/dirsync/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./dirsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Run one sync now and print its statistics.
    Sync {
        /// default, full or incremental.
        #[arg(short, long, default_value = "default")]
        mode: SyncMode,
    },

    /// Show sync cursors and the last run.
    Status,

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// List local users.
    Users {
        #[arg(short, long, default_value = "50")]
        limit: u32,

        /// Include deactivated users.
        #[arg(long)]
        all: bool,
    },

    /// List local groups with member counts.
    Groups {
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Commands::Init { output } => return cmd_init(&output),
        Commands::Validate => return cmd_validate(&cli.config),
        other => other,
    };

    let config = load_config(&cli.config)?;
    let db = open_database(&config)?;

    match command {
        Commands::Sync { mode } => cmd_sync(db, &config, mode).await,
        Commands::Status => cmd_status(&db),
        Commands::Audit { limit } => cmd_audit(&db, limit),
        Commands::Users { limit, all } => cmd_users(&db, limit, all),
        Commands::Groups { limit } => cmd_groups(&db, limit),
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    Ok(config)
}

fn open_database(config: &AppConfig) -> Result<Arc<Database>> {
    std::fs::create_dir_all(&config.daemon.data_dir)
        .context("failed to create data directory")?;
    let db_path = config.daemon.data_dir.join("dirsync.db");
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize().context("failed to initialize database")?;
    Ok(Arc::new(db))
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# dirsync configuration

[daemon]
poll_interval_secs = 3600
log_level = "info"
data_dir = "/var/lib/dirsync"
# log_dir = "/var/log/dirsync"

[directory]
uris = ["ldaps://dc1.example.com", "ldaps://dc2.example.com"]
bind_dn = "CN=dirsync,OU=Service Accounts,DC=example,DC=com"
bind_password_env = "DIRSYNC_BIND_PASSWORD"
search_base = "DC=example,DC=com"
page_size = 200
timeout_secs = 10
# ca_cert = "/etc/dirsync/ca.pem"

[users]
enabled = true
incremental = true
username_field = "username"
exempt = ["admin"]
removal_action = "deactivate"
show_progress = false
photo_name_template = "{username}_{uuid4}.jpg"
extra_attributes = ["department", "thumbnailPhoto"]

[users.attributes]
sAMAccountName = "username"
givenName = "first_name"
sn = "last_name"
mail = "email"

[[users.profiles]]
name = "employee"
fields = ["department", "thumbnailPhoto"]

[groups]
enabled = true
incremental = true

[memberships]
enabled = true
create_missing_groups = true

# [[memberships.default_groups]]
# dn = "CN=Staff,OU=Groups,DC=example,DC=com"
# attributes = { cn = ["Staff"] }

[incremental]
runs_between_full = 5
time_offset_mins = 10
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the directory endpoints, bind DN and search base");
    println!("  2. Export the bind password in DIRSYNC_BIND_PASSWORD");
    println!("  3. Validate with: dirsync validate --config {}", output.display());
    println!("  4. Start the daemon: dirsync-daemon --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    println!("  [OK] Environment variable references processed");

    if let Err(e) = config.validate() {
        println!("  [FAIL] Validation error: {}", e);
        anyhow::bail!("configuration validation failed");
    }
    println!("  [OK] All required fields are valid");

    println!();
    println!("Configuration summary:");
    println!("  Endpoints     : {}", config.directory.uris.to_vec().join(", "));
    println!("  Bind DN       : {}", config.directory.bind_dn);
    println!(
        "  Bind password : {}",
        if config.directory.bind_password.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  User base     : {}", config.user_search_base());
    println!("  Group base    : {}", config.group_search_base());
    println!(
        "  Passes        : users={} groups={} memberships={}",
        config.users.enabled, config.groups.enabled, config.memberships.enabled
    );
    println!("  Profiles      : {}", config.users.profiles.len());
    println!("  Poll interval : {}s", config.daemon.poll_interval_secs);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    println!();
    println!("Configuration is valid.");

    Ok(())
}

async fn cmd_sync(db: Arc<Database>, config: &AppConfig, mode: SyncMode) -> Result<()> {
    config
        .validate()
        .context("configuration validation failed")?;

    let blobs = Arc::new(
        FsBlobStore::new(config.daemon.data_dir.join("blobs"))
            .context("failed to open blob store")?,
    );
    let transport =
        LdapTransport::new(&config.directory).context("failed to set up directory transport")?;
    let engine = SyncEngine::new(config.clone(), transport, db.clone(), db.clone(), blobs);

    println!("Running {} sync...", mode);
    debug!(%mode, "starting manual sync");

    let summary = match engine.run(mode).await {
        Ok(summary) => summary,
        Err(e) => {
            audit(&db, &AuditEntry::failure("sync_run", &e.to_string()));
            return Err(anyhow::Error::new(e).context("sync run failed"));
        }
    };
    audit(&db, &AuditEntry::for_run(&summary));
    if let Ok(json) = serde_json::to_string(&summary) {
        if let Err(e) = db.set_state("last_run_summary", &json) {
            debug!(error = %e, "could not record run summary");
        }
    }

    println!();
    print_summary(&summary);
    Ok(())
}

fn audit(db: &Database, entry: &AuditEntry) {
    if let Err(e) = db.insert_audit_entry(entry) {
        eprintln!("warning: failed to write audit entry: {e}");
    }
}

fn print_summary(summary: &RunSummary) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Kind", "Total", "Added", "Updated", "Deleted", "Errors"]);

    for (kind, stats) in [
        ("users", &summary.stats.users),
        ("groups", &summary.stats.groups),
        ("memberships", &summary.stats.memberships),
    ] {
        let errors = if stats.errors > 0 {
            Cell::new(stats.errors).fg(Color::Red)
        } else {
            Cell::new(stats.errors)
        };
        table.add_row(vec![
            Cell::new(kind),
            Cell::new(stats.total),
            Cell::new(stats.added),
            Cell::new(stats.updated),
            Cell::new(stats.deleted),
            errors,
        ]);
    }
    println!("{}", table);

    println!("  Mode        : {}", summary.mode);
    println!(
        "  Groups from : {}",
        summary.groups_uri.as_deref().unwrap_or("-")
    );
    println!(
        "  Users from  : {}",
        summary.users_uri.as_deref().unwrap_or("-")
    );
    println!(
        "  Cursor      : {}",
        summary
            .cursor_kind
            .map(|k| format!("updated ({k})"))
            .unwrap_or_else(|| "not updated".to_string())
    );
    println!("  Duration    : {:.1}s", summary.duration_secs());
}

fn cmd_status(db: &Database) -> Result<()> {
    let state = db
        .get_state("sync_state")
        .context("failed to read sync state")?
        .unwrap_or_else(|| "idle".to_string());
    let last_sync = db
        .get_state("last_sync_at")
        .context("failed to read last sync time")?;
    let (active_users, total_users) = db.count_users().context("failed to count users")?;
    let failed_runs = db
        .count_failed_runs()
        .context("failed to count failed runs")?;

    println!("dirsync Status");
    println!("==============");
    println!();
    println!("  Sync state   : {}", state);
    println!("  Last sync at : {}", last_sync.as_deref().unwrap_or("never"));
    println!("  Local users  : {} active / {} total", active_users, total_users);
    println!("  Failed runs  : {}", failed_runs);
    println!();

    let cursors = db.list_cursors().context("failed to list sync cursors")?;
    if cursors.is_empty() {
        println!("No sync cursors yet.");
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            "Endpoint",
            "Watermark",
            "Runs",
            "Last kind",
            "Next full in",
            "Errors",
            "Updated",
        ]);
        for cursor in &cursors {
            table.add_row(vec![
                Cell::new(&cursor.uri),
                Cell::new(cursor.last_changed.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(cursor.total_runs),
                Cell::new(cursor.last_run_kind),
                Cell::new(
                    cursor
                        .next_full_in()
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "frozen".to_string()),
                ),
                Cell::new(cursor.last_stats.total_errors()),
                Cell::new(cursor.updated_at.format("%Y-%m-%d %H:%M:%S")),
            ]);
        }
        println!("{}", table);
    }

    if let Some(json) = db
        .get_state("last_run_summary")
        .context("failed to read last run summary")?
    {
        match serde_json::from_str::<RunSummary>(&json) {
            Ok(summary) => {
                println!();
                println!("Last run:");
                print_summary(&summary);
            }
            Err(e) => debug!(error = %e, "stored run summary is unreadable"),
        }
    }

    Ok(())
}

fn cmd_audit(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .list_audit_log(limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    println!("{:<22} {:<10} {:<4} DETAILS", "TIMESTAMP", "ACTION", "OK");
    println!("{}", "-".repeat(100));

    for entry in &entries {
        println!(
            "{:<22} {:<10} {:<4} {}",
            short_timestamp(&entry.created_at),
            entry.action,
            if entry.success { "yes" } else { "no" },
            truncate(entry.details.as_deref().unwrap_or(""), 60),
        );
    }

    println!();
    println!("{} entries shown", entries.len());

    Ok(())
}

fn cmd_users(db: &Database, limit: u32, all: bool) -> Result<()> {
    let users = db
        .list_users(limit, all)
        .context("failed to list users")?;

    if users.is_empty() {
        println!("No users found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Username", "Active", "Password", "Fields"]);

    for user in &users {
        let fields = user
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        let active = if user.is_active {
            Cell::new("yes")
        } else {
            Cell::new("no").fg(Color::Yellow)
        };
        table.add_row(vec![
            Cell::new(&user.username),
            active,
            Cell::new(if user.password_usable { "usable" } else { "unusable" }),
            Cell::new(truncate(&fields, 60)),
        ]);
    }

    println!("{}", table);
    println!("{} user(s) shown", users.len());
    Ok(())
}

fn cmd_groups(db: &Database, limit: u32) -> Result<()> {
    let groups = db.list_groups(limit).context("failed to list groups")?;

    if groups.is_empty() {
        println!("No groups found.");
        return Ok(());
    }

    println!("{:<50} MEMBERS", "NAME");
    println!("{}", "-".repeat(60));
    for group in &groups {
        println!("{:<50} {}", truncate(&group.name, 48), group.members);
    }
    println!();
    println!("{} group(s) shown", groups.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

/// RFC 3339 stamps shortened to seconds; anything else is shown as stored.
fn short_timestamp(stamp: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(stamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| stamp.to_string())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
