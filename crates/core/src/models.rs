//! Domain model types shared by the version manager, the deployment manager
//! and the database layer.
//!
//! Workflow task and step types live in [`crate::workflow::state`].

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generate a record id of the form `<prefix>_<32 hex chars>`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Changes
// ---------------------------------------------------------------------------

/// Kind of per-key change between two snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Rename,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
            Self::Rename => write!(f, "rename"),
        }
    }
}

/// How disruptive a change is for consumers of the string table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A single per-key change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    pub severity: Severity,
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// Review state recorded on a version when it is created.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Descriptive metadata stored alongside a version.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionMetadata {
    pub branch: String,
    #[serde(default)]
    pub description: String,
    /// Snapshot size in bytes.
    pub size: u64,
    pub key_count: usize,
    #[serde(default)]
    pub added_keys: Vec<String>,
    #[serde(default)]
    pub modified_keys: Vec<String>,
    #[serde(default)]
    pub deleted_keys: Vec<String>,
    #[serde(default)]
    pub review_status: ReviewStatus,
    /// Set when this version restores an earlier one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_of: Option<String>,
}

/// Immutable, content-hashed snapshot record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Version {
    pub id: String,
    pub file_path: String,
    pub locale: String,
    pub namespace: String,
    /// Three-part counter, e.g. `1.0.7`.
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub changes: Vec<Change>,
    pub hash: String,
    pub parent_hash: Option<String>,
    pub metadata: VersionMetadata,
}

/// A three-part version counter. Only the patch part is ever incremented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionNumber {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl VersionNumber {
    /// Parse `major.minor.patch`. Returns `None` on anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// The same counter with the patch part incremented.
    pub fn next_patch(self) -> Self {
        Self {
            patch: self.patch + 1,
            ..self
        }
    }
}

impl std::fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// Branches & tags
// ---------------------------------------------------------------------------

/// Named pointer to a version history head.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Branch {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Branch this one was forked from.
    pub source: Option<String>,
    /// Most recent version appended to this branch (or inherited at fork).
    pub head: Option<String>,
    /// Last `branch_history` row of the source visible to this branch.
    pub forked_at: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_default: bool,
}

/// One file captured by a tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaggedFile {
    pub locale: String,
    pub namespace: String,
    pub version_id: String,
    pub hash: String,
}

/// Immutable release marker over the heads of a branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    /// Release label chosen by the author.
    pub version: String,
    pub branch: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub files: Vec<TaggedFile>,
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// Deployment tier of an environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    Development,
    Staging,
    Production,
}

impl EnvironmentType {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "development" => Some(Self::Development),
            "staging" => Some(Self::Staging),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

impl std::fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Staging => write!(f, "staging"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Per-environment feature flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentFeatures {
    #[serde(default)]
    pub hot_reload: bool,
    #[serde(default = "default_true")]
    pub auto_backup: bool,
    #[serde(default = "default_true")]
    pub rollback_enabled: bool,
    #[serde(default = "default_true")]
    pub notification_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for EnvironmentFeatures {
    fn default() -> Self {
        Self {
            hot_reload: false,
            auto_backup: true,
            rollback_enabled: true,
            notification_enabled: true,
        }
    }
}

/// A named deployment target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub env_type: EnvironmentType,
    #[serde(default)]
    pub base_url: String,
    /// Locales root the environment is fed from.
    pub source_path: PathBuf,
    /// Locales root the environment serves.
    pub deployment_path: PathBuf,
    #[serde(default)]
    pub features: EnvironmentFeatures,
}

// ---------------------------------------------------------------------------
// Sync operations
// ---------------------------------------------------------------------------

/// Kind of batch operation against an environment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Sync,
    Deploy,
    Rollback,
    Validate,
    Backup,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Deploy => write!(f, "deploy"),
            Self::Rollback => write!(f, "rollback"),
            Self::Validate => write!(f, "validate"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// Lifecycle status of a sync operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Descriptive payload of a sync operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationMetadata {
    /// Relative paths (`<locale>/<namespace>.json`) in the batch.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default)]
    pub files_copied: usize,
    /// Per-file failures, `<path>: <reason>`.
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A batch file-transfer action targeting one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub source: String,
    pub target: String,
    pub status: OperationStatus,
    /// 0 to 100.
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: OperationMetadata,
}

// ---------------------------------------------------------------------------
// Deployment history
// ---------------------------------------------------------------------------

/// One file written by a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployedFile {
    /// `<locale>/<namespace>.json` under the deployment path.
    pub relative_path: String,
    pub sha256: String,
    /// Whether a file already existed at the target (and got a sidecar).
    pub pre_existed: bool,
}

/// Immutable outcome of a deployment attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentResult {
    pub success: bool,
    pub deployment_id: String,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub files_deployed: usize,
    pub files: Vec<DeployedFile>,
    pub backup_id: Option<String>,
    pub rolled_back: bool,
    pub user: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Immutable outcome of a rollback attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackResult {
    pub success: bool,
    pub rollback_id: String,
    pub environment: String,
    pub target_deployment_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub files_restored: usize,
    pub files_removed: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// A snapshot of an environment's deployed files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: String,
    pub environment: String,
    pub created_at: DateTime<Utc>,
    /// Directory holding the copied files and `metadata.json`.
    pub path: PathBuf,
    pub files: Vec<String>,
    pub total_bytes: u64,
    pub description: String,
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub subject: Option<String>,
    pub actor: Option<String>,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            subject: None,
            actor: None,
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            success: false,
            ..Self::success(action, details)
        }
    }

    /// Attach the id of the record the entry is about.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attach the acting user.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}
