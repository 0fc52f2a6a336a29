//! Domain model types used throughout dirsync.
//!
//! These types bridge the directory client, the reconcilers, the stores and
//! the binaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Directory side
// ---------------------------------------------------------------------------

/// One entry returned by a directory search.
///
/// Attribute values are raw bytes; whether they are text is decided by the
/// mapper. Attribute names keep whatever case the directory returned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectoryRecord {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<Vec<u8>>>,
}

impl DirectoryRecord {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder helper adding a text attribute with one or more values.
    pub fn with_text(mut self, name: &str, values: &[&str]) -> Self {
        self.attributes.insert(
            name.to_string(),
            values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        );
        self
    }

    /// Builder helper adding a single-valued binary attribute.
    pub fn with_binary(mut self, name: &str, value: Vec<u8>) -> Self {
        self.attributes.insert(name.to_string(), vec![value]);
        self
    }

    /// Look up an attribute by name, ignoring ASCII case.
    pub fn values(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// First value of an attribute, if it has any.
    pub fn first_value(&self, name: &str) -> Option<&[u8]> {
        self.values(name)
            .and_then(|values| values.first())
            .map(Vec::as_slice)
    }
}

/// An item of a search result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryItem {
    Record(DirectoryRecord),
    /// A search continuation reference or an entry without a usable
    /// attribute mapping. Counted as an error by the reconcilers.
    Malformed { dn: Option<String>, reason: String },
}

impl DirectoryItem {
    pub fn as_record(&self) -> Option<&DirectoryRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Malformed { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Local identity store
// ---------------------------------------------------------------------------

/// Name of the store's unique user field.
pub const USERNAME_FIELD: &str = "username";

/// Name of the store's unique group field.
pub const GROUP_NAME_FIELD: &str = "name";

/// A user in the local identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub password_usable: bool,
    pub fields: BTreeMap<String, String>,
}

impl LocalUser {
    /// Current value of a mapped field; `username` reads the key column.
    pub fn field(&self, name: &str) -> Option<&str> {
        if name == USERNAME_FIELD {
            Some(&self.username)
        } else {
            self.fields.get(name).map(String::as_str)
        }
    }

    /// Set a mapped field, returning whether the stored value changed.
    pub fn set_field(&mut self, name: &str, value: &str) -> bool {
        if self.field(name) == Some(value) {
            return false;
        }
        if name == USERNAME_FIELD {
            self.username = value.to_string();
        } else {
            self.fields.insert(name.to_string(), value.to_string());
        }
        true
    }
}

/// A group in the local identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalGroup {
    pub id: i64,
    pub name: String,
    pub fields: BTreeMap<String, String>,
}

/// A per-user profile record of one configured kind.
///
/// Blob fields hold the name of the blob in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub kind: String,
    pub user_id: i64,
    pub fields: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Run statistics
// ---------------------------------------------------------------------------

/// Counters for one entity kind within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    pub total: u64,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub errors: u64,
}

impl EntityStats {
    /// Whether this run changed anything for the entity kind.
    pub fn has_changes(&self) -> bool {
        self.added + self.updated + self.deleted > 0
    }
}

impl std::fmt::Display for EntityStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} added={} updated={} deleted={} errors={}",
            self.total, self.added, self.updated, self.deleted, self.errors
        )
    }
}

/// Statistics of one run, per entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub users: EntityStats,
    pub groups: EntityStats,
    pub memberships: EntityStats,
}

impl RunStats {
    pub fn total_errors(&self) -> u64 {
        self.users.errors + self.groups.errors + self.memberships.errors
    }
}

// ---------------------------------------------------------------------------
// Run kinds and modes
// ---------------------------------------------------------------------------

/// How a completed run is classified on its cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Full,
    Incremental,
}

impl RunKind {
    /// Parse a stored value; anything unknown reads as incremental.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "full" => Self::Full,
            _ => Self::Incremental,
        }
    }
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// Requested mode of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Use the `incremental` flags from the configuration.
    #[default]
    Default,
    /// Force full queries for users and groups.
    Full,
    /// Force incremental queries where the cursor allows it.
    Incremental,
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" | "" => Ok(Self::Default),
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// Outcome of one completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub mode: String,
    pub stats: RunStats,
    pub groups_uri: Option<String>,
    pub users_uri: Option<String>,
    /// Classification recorded on the cursor, when one was updated.
    pub cursor_kind: Option<RunKind>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn cursor_updated(&self) -> bool {
        self.cursor_kind.is_some()
    }

    pub fn duration_secs(&self) -> f64 {
        (self.completed_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }

    /// Audit entry describing a completed run.
    pub fn for_run(summary: &RunSummary) -> Self {
        let kind = summary
            .cursor_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "no cursor update".into());
        let details = format!(
            "mode={} kind={} users[{}] groups[{}] memberships[{}]",
            summary.mode, kind, summary.stats.users, summary.stats.groups, summary.stats.memberships
        );
        Self::success("sync_run", &details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lookup_ignores_case() {
        let record = DirectoryRecord::new("CN=jdoe,DC=example,DC=com")
            .with_text("sAMAccountName", &["jdoe"]);
        assert_eq!(record.first_value("samaccountname"), Some(&b"jdoe"[..]));
        assert!(record.values("mail").is_none());
    }

    #[test]
    fn test_set_field_reports_changes() {
        let mut user = LocalUser {
            id: 1,
            username: "jdoe".into(),
            is_active: true,
            password_usable: false,
            fields: BTreeMap::new(),
        };
        assert!(user.set_field("email", "jdoe@example.com"));
        assert!(!user.set_field("email", "jdoe@example.com"));
        assert!(!user.set_field("username", "jdoe"));
        assert!(user.set_field("username", "JDoe"));
        assert_eq!(user.username, "JDoe");
    }

    #[test]
    fn test_sync_mode_from_str() {
        assert_eq!("full".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert_eq!(
            "Incremental".parse::<SyncMode>().unwrap(),
            SyncMode::Incremental
        );
        assert!("partial".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_run_kind_roundtrip_strings() {
        assert_eq!(RunKind::from_str_val(&RunKind::Full.to_string()), RunKind::Full);
        assert_eq!(RunKind::from_str_val("garbage"), RunKind::Incremental);
    }

    #[test]
    fn test_audit_entry_for_run() {
        let now = Utc::now();
        let summary = RunSummary {
            mode: "default".into(),
            stats: RunStats::default(),
            groups_uri: Some("ldap://dc1".into()),
            users_uri: Some("ldap://dc1".into()),
            cursor_kind: Some(RunKind::Full),
            started_at: now,
            completed_at: now,
        };
        let entry = AuditEntry::for_run(&summary);
        assert!(entry.success);
        assert!(entry.details.contains("kind=full"));
    }
}
