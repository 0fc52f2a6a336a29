//! TOML-based configuration system for dirsync.
//!
//! The directory bind password is stored as an `_env` field that references
//! an environment variable name. The secret is resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::directory::filter::{check_strftime, PHOTO_TEMPLATE_PLACEHOLDERS};
use crate::errors::ConfigError;
use crate::mapper::DISABLED_ATTRIBUTE;
use crate::models::SyncMode;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Directory endpoints and service credentials.
    pub directory: DirectoryConfig,

    /// User synchronization.
    #[serde(default)]
    pub users: UserSyncConfig,

    /// Group synchronization.
    #[serde(default)]
    pub groups: GroupSyncConfig,

    /// Group membership synchronization.
    #[serde(default)]
    pub memberships: MembershipConfig,

    /// Incremental cadence and watermark formatting.
    #[serde(default)]
    pub incremental: IncrementalConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between sync runs (default 3600).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database, blobs).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Write daily-rotated log files here in addition to stdout.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_poll_interval() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/dirsync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            log_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// One URI or an ordered failover list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum UriList {
    One(String),
    Many(Vec<String>),
}

impl UriList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(uri) => vec![uri.clone()],
            Self::Many(uris) => uris.clone(),
        }
    }
}

/// Directory connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Endpoint URIs in failover order (`ldap://` or `ldaps://`).
    pub uris: UriList,

    /// DN used for the simple bind.
    pub bind_dn: String,

    /// Environment variable holding the bind password.
    #[serde(default = "default_bind_password_env")]
    pub bind_password_env: String,

    /// Default search base for users and groups.
    pub search_base: String,

    /// Results requested per page (clamped to at least 10).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Connect and per-operation timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// PEM file with an extra CA certificate trusted for `ldaps://`.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,

    /// Resolved bind password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub bind_password: Option<String>,
}

/// Smallest page size sent to the directory.
pub const MIN_PAGE_SIZE: u32 = 10;

fn default_bind_password_env() -> String {
    "DIRSYNC_BIND_PASSWORD".into()
}
fn default_page_size() -> u32 {
    200
}
fn default_timeout_secs() -> u64 {
    10
}

impl DirectoryConfig {
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.max(MIN_PAGE_SIZE)
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Case applied to dynamically-set profile field names.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldCase {
    None,
    #[default]
    Lower,
    Upper,
}

impl FieldCase {
    pub fn apply(self, name: &str) -> String {
        match self {
            Self::None => name.to_string(),
            Self::Lower => name.to_lowercase(),
            Self::Upper => name.to_uppercase(),
        }
    }
}

/// What happens to a local entity whose directory counterpart is disabled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemovalAction {
    #[default]
    Keep,
    Deactivate,
}

/// One profile kind kept per user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileConfig {
    pub name: String,
    pub fields: Vec<String>,
}

/// User synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub incremental: bool,

    /// Empty means `directory.search_base`.
    #[serde(default)]
    pub search_base: String,

    #[serde(default = "default_user_filter")]
    pub filter: String,

    /// Template with a `?` placeholder for the watermark.
    #[serde(default = "default_user_incremental_filter")]
    pub incremental_filter: String,

    /// Directory attribute name to local field name.
    #[serde(default = "default_user_attributes")]
    pub attributes: BTreeMap<String, String>,

    /// Additional attributes to request (profile sources, for example).
    #[serde(default)]
    pub extra_attributes: Vec<String>,

    #[serde(default = "default_username_field")]
    pub username_field: String,

    /// Lowercased usernames never touched by the sync.
    #[serde(default)]
    pub exempt: Vec<String>,

    #[serde(default = "default_true")]
    pub set_unusable_password: bool,

    #[serde(default = "default_user_removal_action")]
    pub removal_action: RemovalAction,

    #[serde(default)]
    pub show_progress: bool,

    #[serde(default = "default_photo_name_template")]
    pub photo_name_template: String,

    #[serde(default)]
    pub field_case: FieldCase,

    #[serde(default = "default_multivalue_separator")]
    pub multivalue_separator: String,

    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

fn default_true() -> bool {
    true
}
fn default_user_filter() -> String {
    "(&(objectCategory=person)(objectClass=user))".into()
}
fn default_user_incremental_filter() -> String {
    "(&(objectCategory=person)(objectClass=user)(whenChanged>=?))".into()
}
fn default_user_attributes() -> BTreeMap<String, String> {
    [
        ("sAMAccountName", "username"),
        ("givenName", "first_name"),
        ("sn", "last_name"),
        ("mail", "email"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_username_field() -> String {
    "username".into()
}
fn default_user_removal_action() -> RemovalAction {
    RemovalAction::Deactivate
}
fn default_photo_name_template() -> String {
    "{username}_{uuid4}.jpg".into()
}
fn default_multivalue_separator() -> String {
    "|".into()
}

impl Default for UserSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            incremental: true,
            search_base: String::new(),
            filter: default_user_filter(),
            incremental_filter: default_user_incremental_filter(),
            attributes: default_user_attributes(),
            extra_attributes: Vec::new(),
            username_field: default_username_field(),
            exempt: Vec::new(),
            set_unusable_password: true,
            removal_action: default_user_removal_action(),
            show_progress: false,
            photo_name_template: default_photo_name_template(),
            field_case: FieldCase::default(),
            multivalue_separator: default_multivalue_separator(),
            profiles: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// Group synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub incremental: bool,

    #[serde(default)]
    pub search_base: String,

    #[serde(default = "default_group_filter")]
    pub filter: String,

    #[serde(default = "default_group_incremental_filter")]
    pub incremental_filter: String,

    #[serde(default = "default_group_attributes")]
    pub attributes: BTreeMap<String, String>,

    #[serde(default = "default_group_name_field")]
    pub name_field: String,

    #[serde(default)]
    pub removal_action: RemovalAction,
}

fn default_group_filter() -> String {
    "(objectClass=group)".into()
}
fn default_group_incremental_filter() -> String {
    "(&(objectClass=group)(whenChanged>=?))".into()
}
fn default_group_attributes() -> BTreeMap<String, String> {
    BTreeMap::from([("cn".to_string(), "name".to_string())])
}
fn default_group_name_field() -> String {
    "name".into()
}

impl Default for GroupSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            incremental: true,
            search_base: String::new(),
            filter: default_group_filter(),
            incremental_filter: default_group_incremental_filter(),
            attributes: default_group_attributes(),
            name_field: default_group_name_field(),
            removal_action: RemovalAction::Keep,
        }
    }
}

// ---------------------------------------------------------------------------
// Memberships
// ---------------------------------------------------------------------------

/// A group every synced user belongs to, expressed as a directory entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefaultGroup {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// Membership synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// User attribute holding the DN substituted into `filter`.
    #[serde(default = "default_dn_attribute")]
    pub dn_attribute: String,

    /// Group filter template with a `{distinguishedName}` placeholder.
    #[serde(default = "default_membership_filter")]
    pub filter: String,

    #[serde(default = "default_true")]
    pub create_missing_groups: bool,

    #[serde(default)]
    pub default_groups: Vec<DefaultGroup>,
}

/// Placeholder in the membership filter replaced by the escaped user DN.
pub const DN_PLACEHOLDER: &str = "{distinguishedName}";

fn default_dn_attribute() -> String {
    "distinguishedName".into()
}
fn default_membership_filter() -> String {
    "(member:1.2.840.113556.1.4.1941:={distinguishedName})".into()
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dn_attribute: default_dn_attribute(),
            filter: default_membership_filter(),
            create_missing_groups: true,
            default_groups: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Incremental
// ---------------------------------------------------------------------------

/// Incremental cadence and watermark formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    /// Incremental runs between forced full runs. A negative value freezes
    /// the counter at the next full run, so later runs keep the full filters.
    #[serde(default = "default_runs_between_full")]
    pub runs_between_full: i64,

    /// Minutes subtracted from the watermark when building filters.
    #[serde(default = "default_time_offset_mins")]
    pub time_offset_mins: i64,

    /// strftime pattern for the watermark inside filters.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

fn default_runs_between_full() -> i64 {
    5
}
fn default_time_offset_mins() -> i64 {
    10
}
fn default_timestamp_format() -> String {
    "%Y%m%d%H%M%S.0Z".into()
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            runs_between_full: default_runs_between_full(),
            time_offset_mins: default_time_offset_mins(),
            timestamp_format: default_timestamp_format(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `directory.bind_password_env` from the environment.
    ///
    /// A missing variable only logs a warning here; [`validate`](Self::validate)
    /// is what rejects a config without a password.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");
        self.directory.bind_password = resolve_optional_env(
            &self.directory.bind_password_env,
            "directory.bind_password_env",
        );
        Ok(())
    }

    /// Apply a run-mode override to the per-kind `incremental` flags.
    pub fn apply_mode(&mut self, mode: SyncMode) {
        let incremental = match mode {
            SyncMode::Default => return,
            SyncMode::Full => false,
            SyncMode::Incremental => true,
        };
        self.users.incremental = incremental;
        self.groups.incremental = incremental;
    }

    /// Validate every setting the engine relies on.
    ///
    /// Runs before any directory contact; the first offending setting is
    /// named in the returned error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "daemon.poll_interval_secs",
                "poll interval must be > 0",
            ));
        }

        self.validate_directory()?;
        let attr_name = regex_lite::Regex::new(r"^(?:[A-Za-z][A-Za-z0-9-]*|[0-9]+(?:\.[0-9]+)*)$")
            .map_err(|e| ConfigError::invalid("attributes", e.to_string()))?;
        if self.users.enabled {
            self.validate_users(&attr_name)?;
        }
        if self.groups.enabled {
            self.validate_groups(&attr_name)?;
        }
        if self.memberships.enabled {
            self.validate_memberships(&attr_name)?;
        }

        if self.incremental.time_offset_mins < 0 {
            return Err(ConfigError::invalid(
                "incremental.time_offset_mins",
                "offset must be >= 0",
            ));
        }
        check_strftime(&self.incremental.timestamp_format)
            .map_err(|detail| ConfigError::invalid("incremental.timestamp_format", detail))?;

        Ok(())
    }

    fn validate_directory(&self) -> Result<(), ConfigError> {
        let uris = self.directory.uris.to_vec();
        if uris.is_empty() {
            return Err(ConfigError::invalid(
                "directory.uris",
                "at least one URI is required",
            ));
        }
        for uri in &uris {
            let lower = uri.to_ascii_lowercase();
            if !(lower.starts_with("ldap://") || lower.starts_with("ldaps://")) {
                return Err(ConfigError::invalid(
                    "directory.uris",
                    format!("'{uri}' must use the ldap:// or ldaps:// scheme"),
                ));
            }
        }
        if self.directory.bind_dn.trim().is_empty() {
            return Err(ConfigError::invalid("directory.bind_dn", "must not be empty"));
        }
        if self
            .directory
            .bind_password
            .as_deref()
            .map_or(true, str::is_empty)
        {
            return Err(ConfigError::EnvVarMissing {
                var: self.directory.bind_password_env.clone(),
                field: "directory.bind_password_env".into(),
            });
        }
        if self.directory.search_base.trim().is_empty() {
            return Err(ConfigError::invalid(
                "directory.search_base",
                "must not be empty",
            ));
        }
        if self.directory.timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "directory.timeout_secs",
                "timeout must be > 0",
            ));
        }
        Ok(())
    }

    fn validate_users(&self, attr_name: &regex_lite::Regex) -> Result<(), ConfigError> {
        let users = &self.users;
        if users.filter.trim().is_empty() {
            return Err(ConfigError::invalid("users.filter", "must not be empty"));
        }
        if users.incremental && users.incremental_filter.trim().is_empty() {
            return Err(ConfigError::invalid(
                "users.incremental_filter",
                "required while incremental sync is enabled",
            ));
        }
        if users.attributes.is_empty() {
            return Err(ConfigError::invalid("users.attributes", "must not be empty"));
        }
        check_attribute_names(
            "users.attributes",
            users.attributes.keys().chain(&users.extra_attributes),
            attr_name,
        )?;
        if users.username_field.trim().is_empty() {
            return Err(ConfigError::invalid(
                "users.username_field",
                "must not be empty",
            ));
        }
        if !users.attributes.values().any(|f| f == &users.username_field) {
            return Err(ConfigError::invalid(
                "users.attributes",
                format!(
                    "no attribute maps to the username field '{}'",
                    users.username_field
                ),
            ));
        }
        if users.multivalue_separator.is_empty() {
            return Err(ConfigError::invalid(
                "users.multivalue_separator",
                "must not be empty",
            ));
        }
        if users.photo_name_template.trim().is_empty() {
            return Err(ConfigError::invalid(
                "users.photo_name_template",
                "must not be empty",
            ));
        }
        let relative_path = !users.photo_name_template.contains('\\')
            && users
                .photo_name_template
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != "..");
        if !relative_path {
            return Err(ConfigError::invalid(
                "users.photo_name_template",
                "must be a relative path without empty, '.' or '..' components",
            ));
        }
        let mut template = users.photo_name_template.clone();
        for placeholder in PHOTO_TEMPLATE_PLACEHOLDERS {
            template = template.replace(placeholder, "");
        }
        check_strftime(&template)
            .map_err(|detail| ConfigError::invalid("users.photo_name_template", detail))?;

        let mut seen = HashSet::new();
        for profile in &users.profiles {
            if profile.name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "users.profiles.name",
                    "must not be empty",
                ));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::invalid(
                    "users.profiles.name",
                    format!("profile '{}' is declared twice", profile.name),
                ));
            }
            if profile.fields.is_empty() {
                return Err(ConfigError::invalid(
                    format!("users.profiles.{}.fields", profile.name),
                    "must not be empty",
                ));
            }
            check_attribute_names(
                &format!("users.profiles.{}.fields", profile.name),
                profile.fields.iter(),
                attr_name,
            )?;
        }
        Ok(())
    }

    fn validate_groups(&self, attr_name: &regex_lite::Regex) -> Result<(), ConfigError> {
        let groups = &self.groups;
        if groups.filter.trim().is_empty() {
            return Err(ConfigError::invalid("groups.filter", "must not be empty"));
        }
        if groups.incremental && groups.incremental_filter.trim().is_empty() {
            return Err(ConfigError::invalid(
                "groups.incremental_filter",
                "required while incremental sync is enabled",
            ));
        }
        self.validate_group_mapping(attr_name)?;
        if groups.removal_action != RemovalAction::Keep {
            return Err(ConfigError::invalid(
                "groups.removal_action",
                "only 'keep' is supported for groups",
            ));
        }
        Ok(())
    }

    fn validate_group_mapping(&self, attr_name: &regex_lite::Regex) -> Result<(), ConfigError> {
        let groups = &self.groups;
        if groups.name_field.trim().is_empty() {
            return Err(ConfigError::invalid("groups.name_field", "must not be empty"));
        }
        check_attribute_names("groups.attributes", groups.attributes.keys(), attr_name)?;
        if !groups.attributes.values().any(|f| f == &groups.name_field) {
            return Err(ConfigError::invalid(
                "groups.attributes",
                format!(
                    "no attribute maps to the group name field '{}'",
                    groups.name_field
                ),
            ));
        }
        Ok(())
    }

    fn validate_memberships(&self, attr_name: &regex_lite::Regex) -> Result<(), ConfigError> {
        let memberships = &self.memberships;
        if memberships.dn_attribute.trim().is_empty() {
            return Err(ConfigError::invalid(
                "memberships.dn_attribute",
                "must not be empty",
            ));
        }
        if !memberships.filter.contains(DN_PLACEHOLDER) {
            return Err(ConfigError::invalid(
                "memberships.filter",
                format!("template must contain the {DN_PLACEHOLDER} placeholder"),
            ));
        }
        // Memberships map group entries even when the group pass is disabled.
        self.validate_group_mapping(attr_name)?;
        for group in &memberships.default_groups {
            if group.dn.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "memberships.default_groups.dn",
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Base DN for the user search.
    pub fn user_search_base(&self) -> &str {
        non_empty_or(&self.users.search_base, &self.directory.search_base)
    }

    /// Base DN for group and membership searches.
    pub fn group_search_base(&self) -> &str {
        non_empty_or(&self.groups.search_base, &self.directory.search_base)
    }

    /// Attributes requested by the user search.
    ///
    /// Mapped names, extra names and profile fields, plus the account
    /// control attribute and the membership DN attribute.
    pub fn user_search_attributes(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut push = |name: &str| {
            if !names.iter().any(|n: &String| n.eq_ignore_ascii_case(name)) {
                names.push(name.to_string());
            }
        };
        self.users.attributes.keys().for_each(|n| push(n.as_str()));
        self.users
            .extra_attributes
            .iter()
            .for_each(|n| push(n.as_str()));
        self.users
            .profiles
            .iter()
            .flat_map(|p| &p.fields)
            .for_each(|n| push(n.as_str()));
        push(DISABLED_ATTRIBUTE);
        if self.memberships.enabled {
            push(&self.memberships.dn_attribute);
        }
        names
    }

    /// Attributes requested by group and membership searches.
    pub fn group_search_attributes(&self) -> Vec<String> {
        self.groups.attributes.keys().cloned().collect()
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

fn check_attribute_names<'a>(
    field: &str,
    names: impl Iterator<Item = &'a String>,
    pattern: &regex_lite::Regex,
) -> Result<(), ConfigError> {
    for name in names {
        if !pattern.is_match(name) {
            return Err(ConfigError::invalid(
                field,
                format!("'{name}' is not a valid attribute name"),
            ));
        }
    }
    Ok(())
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
poll_interval_secs = 600
log_level = "debug"
data_dir = "/tmp/dirsync"

[directory]
uris = ["ldaps://dc1.example.com:636", "ldap://dc2.example.com:389"]
bind_dn = "CN=svc-sync,OU=Service,DC=example,DC=com"
bind_password_env = "DIRSYNC_TEST_PW"
search_base = "DC=example,DC=com"
page_size = 500

[users]
search_base = "OU=Staff,DC=example,DC=com"
attributes = { sAMAccountName = "username", mail = "email" }
exempt = ["admin"]
show_progress = true
field_case = "upper"

[[users.profiles]]
name = "employee"
fields = ["department", "thumbnailPhoto"]

[groups]
attributes = { cn = "name", description = "description" }

[memberships]
create_missing_groups = false

[[memberships.default_groups]]
dn = "CN=Everyone,DC=example,DC=com"
attributes = { cn = ["Everyone"] }

[incremental]
runs_between_full = -1
time_offset_mins = 30
"#
    }

    fn sample_config() -> AppConfig {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.directory.bind_password = Some("s3cret".into());
        config
    }

    #[test]
    fn test_parse_full_config() {
        let config = sample_config();
        assert_eq!(config.daemon.poll_interval_secs, 600);
        assert_eq!(config.directory.uris.to_vec().len(), 2);
        assert_eq!(config.directory.page_size, 500);
        assert_eq!(config.users.field_case, FieldCase::Upper);
        assert_eq!(config.users.profiles[0].fields[1], "thumbnailPhoto");
        assert!(!config.memberships.create_missing_groups);
        assert_eq!(
            config.memberships.default_groups[0].attributes["cn"],
            vec!["Everyone".to_string()]
        );
        assert_eq!(config.incremental.runs_between_full, -1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_single_uri_string() {
        let toml_str = r#"
[directory]
uris = "ldap://dc1.example.com"
bind_dn = "CN=svc"
search_base = "DC=example,DC=com"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.directory.uris.to_vec(), vec!["ldap://dc1.example.com"]);
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[directory]
uris = ["ldap://dc1"]
bind_dn = "CN=svc"
search_base = "DC=example,DC=com"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.daemon.poll_interval_secs, 3600);
        assert_eq!(config.directory.page_size, 200);
        assert_eq!(config.directory.timeout_secs, 10);
        assert_eq!(config.users.username_field, "username");
        assert_eq!(config.users.field_case, FieldCase::Lower);
        assert_eq!(config.users.removal_action, RemovalAction::Deactivate);
        assert_eq!(config.groups.removal_action, RemovalAction::Keep);
        assert_eq!(config.incremental.runs_between_full, 5);
        assert_eq!(config.incremental.timestamp_format, "%Y%m%d%H%M%S.0Z");
        assert_eq!(config.user_search_base(), "DC=example,DC=com");
    }

    #[test]
    fn test_unknown_field_case_is_a_parse_error() {
        let toml_str = r#"
[directory]
uris = ["ldap://dc1"]
bind_dn = "CN=svc"
search_base = "DC=example,DC=com"
[users]
field_case = "title"
"#;
        assert!(toml::from_str::<AppConfig>(toml_str).is_err());
    }

    #[test]
    fn test_page_size_is_clamped() {
        let mut config = sample_config();
        config.directory.page_size = 3;
        assert_eq!(config.directory.effective_page_size(), MIN_PAGE_SIZE);
    }

    #[test]
    fn test_validate_requires_bind_password() {
        let mut config = sample_config();
        config.directory.bind_password = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EnvVarMissing { ref var, .. }) if var == "DIRSYNC_TEST_PW"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let mut config = sample_config();
        config.directory.uris = UriList::One("http://dc1".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "directory.uris"
        ));
    }

    #[test]
    fn test_validate_requires_username_mapping() {
        let mut config = sample_config();
        config.users.attributes.remove("sAMAccountName");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "users.attributes"
        ));
    }

    #[test]
    fn test_validate_incremental_filter_depends_on_mode() {
        let mut config = sample_config();
        config.users.incremental_filter = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "users.incremental_filter"
        ));

        config.apply_mode(SyncMode::Full);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_group_deactivation() {
        let mut config = sample_config();
        config.groups.removal_action = RemovalAction::Deactivate;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "groups.removal_action"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_timestamp_format() {
        let mut config = sample_config();
        config.incremental.timestamp_format = "%Y%Q".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "incremental.timestamp_format"
        ));
    }

    #[test]
    fn test_validate_photo_name_template_paths() {
        let mut config = sample_config();
        config.users.photo_name_template = "photos/%Y/{username}_{uuid4}.jpg".into();
        assert!(config.validate().is_ok());

        for template in [
            "/var/photos/{username}.jpg",
            "../{username}.jpg",
            "photos//{username}.jpg",
            "photos\\{username}.jpg",
        ] {
            config.users.photo_name_template = template.into();
            assert!(
                matches!(
                    config.validate(),
                    Err(ConfigError::InvalidValue { ref field, .. }) if field == "users.photo_name_template"
                ),
                "{template} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_rejects_bad_attribute_name() {
        let mut config = sample_config();
        config
            .users
            .attributes
            .insert("given name".into(), "first_name".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "users.attributes"
        ));
    }

    #[test]
    fn test_validate_rejects_membership_filter_without_placeholder() {
        let mut config = sample_config();
        config.memberships.filter = "(member=*)".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "memberships.filter"
        ));
    }

    #[test]
    fn test_user_search_attributes() {
        let config = sample_config();
        let attrs = config.user_search_attributes();
        assert!(attrs.contains(&"sAMAccountName".to_string()));
        assert!(attrs.contains(&"thumbnailPhoto".to_string()));
        assert!(attrs.contains(&"userAccountControl".to_string()));
        assert!(attrs.contains(&"distinguishedName".to_string()));
        assert_eq!(config.user_search_base(), "OU=Staff,DC=example,DC=com");
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("DIRSYNC_TEST_RESOLVE_PW", "hunter2");
        let toml_str = r#"
[directory]
uris = ["ldap://dc1"]
bind_dn = "CN=svc"
bind_password_env = "DIRSYNC_TEST_RESOLVE_PW"
search_base = "DC=example,DC=com"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(config.directory.bind_password.as_deref(), Some("hunter2"));

        // Clean up
        std::env::remove_var("DIRSYNC_TEST_RESOLVE_PW");
    }
}
