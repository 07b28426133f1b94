//! TOML-based configuration for l10nflow.
//!
//! Secrets (the webhook URL) are stored as `_env` fields that reference
//! environment variable names. The actual values are resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::models::EnvironmentConfig;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage locations and logging.
    #[serde(default)]
    pub store: StoreConfig,

    /// Version manager settings.
    #[serde(default)]
    pub versioning: VersioningConfig,

    /// Workflow engine settings.
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Sync batch defaults.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Event sink settings.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Deployment environments, registered at startup.
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Where the database, content objects and backups live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for persistent data (database, objects, backups).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Locales root holding `<locale>/<namespace>.json` resource files.
    #[serde(default = "default_locales_dir")]
    pub locales_dir: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".l10nflow")
}
fn default_locales_dir() -> PathBuf {
    PathBuf::from("locales")
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            locales_dir: default_locales_dir(),
            log_level: default_log_level(),
        }
    }
}

impl StoreConfig {
    /// Path of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("l10nflow.db")
    }

    /// Root of the content-addressed object store.
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Root of environment backups.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

// ---------------------------------------------------------------------------
// Versioning
// ---------------------------------------------------------------------------

/// Version manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersioningConfig {
    /// Branch used when a caller does not name one.
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".into()
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Minimum scores the validation step enforces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityThresholds {
    #[serde(default = "default_completeness")]
    pub completeness: f64,
    #[serde(default = "default_consistency")]
    pub consistency: f64,
    #[serde(default = "default_format")]
    pub format: f64,
    /// Longest translation accepted, in characters.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_completeness() -> f64 {
    80.0
}
fn default_consistency() -> f64 {
    85.0
}
fn default_format() -> f64 {
    95.0
}
fn default_max_length() -> usize {
    500
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            completeness: default_completeness(),
            consistency: default_consistency(),
            format: default_format(),
            max_length: default_max_length(),
        }
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Approvals the review step needs (urgent tasks need one).
    #[serde(default = "default_required_reviews")]
    pub required_reviews: u32,

    /// Approvals the approval step needs.
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,

    /// Pick translators automatically for targets without an assignee.
    #[serde(default = "default_true")]
    pub auto_assign: bool,

    /// Environment the deployment step targets. No environment, no deployment step.
    #[serde(default)]
    pub deploy_environment: Option<String>,

    /// Validation thresholds.
    #[serde(default)]
    pub quality: QualityThresholds,
}

fn default_required_reviews() -> u32 {
    2
}
fn default_required_approvals() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            required_reviews: default_required_reviews(),
            required_approvals: default_required_approvals(),
            auto_assign: true,
            deploy_environment: None,
            quality: QualityThresholds::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Defaults for sync batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Languages synced when a request names none (empty = discover on disk).
    #[serde(default)]
    pub default_languages: Vec<String>,

    /// Namespaces synced when a request names none (empty = discover on disk).
    #[serde(default)]
    pub default_namespaces: Vec<String>,

    /// Per-file estimate reported by dry runs.
    #[serde(default = "default_ms_per_file")]
    pub estimated_ms_per_file: u64,
}

fn default_ms_per_file() -> u64 {
    100
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_languages: Vec::new(),
            default_namespaces: Vec::new(),
            estimated_ms_per_file: default_ms_per_file(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Event sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Environment variable holding the webhook URL events are posted to.
    #[serde(default)]
    pub webhook_url_env: Option<String>,

    /// Recipients stamped on every event envelope.
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Channels stamped on every event envelope.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Resolved webhook URL.
    #[serde(skip)]
    pub webhook_url: Option<String>,
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

        debug!(
            environments = config.environments.len(),
            "configuration parsed successfully"
        );
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A missing variable logs a warning but does not fail; the webhook
    /// subscriber is simply not installed.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.notifications.webhook_url_env {
            self.notifications.webhook_url =
                resolve_optional_env(env_name, "notifications.webhook_url_env");
        }
        Ok(())
    }

    /// Validate that all fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.data_dir.as_os_str().is_empty() {
            return Err(invalid("store.data_dir", "data directory must not be empty"));
        }
        if self.versioning.default_branch.trim().is_empty() {
            return Err(invalid(
                "versioning.default_branch",
                "default branch must not be empty",
            ));
        }
        if self.workflow.required_reviews == 0 {
            return Err(invalid("workflow.required_reviews", "must be > 0"));
        }
        if self.workflow.required_approvals == 0 {
            return Err(invalid("workflow.required_approvals", "must be > 0"));
        }

        let q = &self.workflow.quality;
        for (field, value) in [
            ("workflow.quality.completeness", q.completeness),
            ("workflow.quality.consistency", q.consistency),
            ("workflow.quality.format", q.format),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(invalid(field, &format!("{value} is outside 0-100")));
            }
        }
        if q.max_length == 0 {
            return Err(invalid("workflow.quality.max_length", "must be > 0"));
        }

        for locale in &self.sync.default_languages {
            if !is_locale_code(locale) {
                return Err(invalid(
                    "sync.default_languages",
                    &format!("'{locale}' is not a locale code"),
                ));
            }
        }

        let mut seen = HashSet::new();
        for env in &self.environments {
            if env.name.trim().is_empty() {
                return Err(invalid("environments.name", "name must not be empty"));
            }
            if !seen.insert(env.name.as_str()) {
                return Err(invalid(
                    "environments.name",
                    &format!("duplicate environment '{}'", env.name),
                ));
            }
            if env.source_path.as_os_str().is_empty() {
                return Err(invalid(
                    "environments.source_path",
                    &format!("'{}' has an empty source path", env.name),
                ));
            }
            if env.deployment_path.as_os_str().is_empty() {
                return Err(invalid(
                    "environments.deployment_path",
                    &format!("'{}' has an empty deployment path", env.name),
                ));
            }
        }

        if let Some(ref target) = self.workflow.deploy_environment {
            if !self.environments.iter().any(|e| &e.name == target) {
                warn!(
                    environment = %target,
                    "workflow deploy environment is not declared in config; it must be registered at runtime"
                );
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
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// `xx`, `xxx`, `xx-YY` or `xx-Yyyy`.
pub fn is_locale_code(code: &str) -> bool {
    // The pattern is a literal; compilation cannot fail.
    regex_lite::Regex::new(r"^[a-z]{2,3}(-([A-Z]{2}|[A-Z][a-z]{3}))?$")
        .map(|re| re.is_match(code))
        .unwrap_or(false)
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
    use crate::models::EnvironmentType;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[store]
data_dir = "/tmp/l10nflow"
locales_dir = "/srv/app/locales"
log_level = "debug"

[versioning]
default_branch = "trunk"

[workflow]
required_reviews = 3
auto_assign = false
deploy_environment = "production"

[workflow.quality]
completeness = 90.0

[sync]
default_languages = ["en-US", "fr-FR", "zh-Hans"]
default_namespaces = ["common", "auth"]

[notifications]
webhook_url_env = "L10N_WEBHOOK"
recipients = ["i18n-team"]

[[environments]]
name = "staging"
type = "staging"
base_url = "https://staging.example.com"
source_path = "/srv/app/locales"
deployment_path = "/srv/staging/locales"

[environments.features]
rollback_enabled = false

[[environments]]
name = "production"
type = "production"
source_path = "/srv/app/locales"
deployment_path = "/srv/prod/locales"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.store.log_level, "debug");
        assert_eq!(config.versioning.default_branch, "trunk");
        assert_eq!(config.workflow.required_reviews, 3);
        assert_eq!(config.workflow.required_approvals, 1);
        assert!(!config.workflow.auto_assign);
        assert_eq!(config.workflow.quality.completeness, 90.0);
        assert_eq!(config.workflow.quality.consistency, 85.0);
        assert_eq!(config.environments.len(), 2);
        assert_eq!(config.environments[0].env_type, EnvironmentType::Staging);
        assert!(!config.environments[0].features.rollback_enabled);
        assert!(config.environments[1].features.rollback_enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l10nflow.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.store.database_path(), PathBuf::from("/tmp/l10nflow/l10nflow.db"));
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/l10nflow.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_environment() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        let dup = config.environments[0].clone();
        config.environments.push(dup);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "environments.name"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_locale_and_threshold() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.sync.default_languages.push("english".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.default_languages"
        ));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.workflow.quality.format = 120.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "workflow.quality.format"
        ));
    }

    #[test]
    fn test_locale_codes() {
        assert!(is_locale_code("en"));
        assert!(is_locale_code("en-US"));
        assert!(is_locale_code("zh-Hant"));
        assert!(!is_locale_code("EN-us"));
        assert!(!is_locale_code("en_US"));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_L10N_WEBHOOK", "https://hooks.example.com/x");
        let toml_str = r#"
[notifications]
webhook_url_env = "TEST_L10N_WEBHOOK"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();
        assert_eq!(
            config.notifications.webhook_url.as_deref(),
            Some("https://hooks.example.com/x")
        );
        std::env::remove_var("TEST_L10N_WEBHOOK");
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.store.log_level, "info");
        assert_eq!(config.versioning.default_branch, "main");
        assert_eq!(config.workflow.required_reviews, 2);
        assert_eq!(config.workflow.quality.max_length, 500);
        assert_eq!(config.sync.estimated_ms_per_file, 100);
        assert!(config.workflow.auto_assign);
        assert!(config.environments.is_empty());
        config.validate().unwrap();
    }
}
