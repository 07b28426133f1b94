//! Error types for the l10nflow core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::conflict::ConflictRecord;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

// ---------------------------------------------------------------------------
// Content store / resource file errors
// ---------------------------------------------------------------------------

/// Errors from the content-addressed store and resource file I/O.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No blob is stored under the given digest.
    #[error("content not found for hash {0}")]
    NotFound(String),

    /// A digest string is not 64 lowercase hex characters.
    #[error("malformed content hash '{0}'")]
    MalformedHash(String),

    /// A resource file is not a JSON object of strings / nested objects.
    #[error("invalid resource file '{path}': {detail}")]
    InvalidResource {
        path: String,
        detail: String,
    },

    /// A resource file path does not follow `<locale>/<namespace>.json`.
    #[error("cannot derive locale/namespace from path '{0}'")]
    UnscopedPath(String),

    /// Generic I/O wrapper.
    #[error("store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Version manager errors
// ---------------------------------------------------------------------------

/// Errors from the version manager (versions, branches, tags, conflicts).
#[derive(Debug, Error)]
pub enum VersionError {
    /// The stored hash does not match the live file's recomputed hash.
    #[error("integrity check failed for {version_id}: stored {stored}, live {actual}")]
    Integrity {
        version_id: String,
        stored: String,
        actual: String,
    },

    /// A merge was attempted while conflicts are still pending.
    #[error("{} unresolved conflict(s) block the merge", pending.len())]
    ConflictUnresolved { pending: Vec<ConflictRecord> },

    /// The requested version does not exist.
    #[error("version not found: {0}")]
    VersionNotFound(String),

    /// The requested branch does not exist.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// A branch with this name already exists.
    #[error("branch '{0}' already exists")]
    BranchExists(String),

    /// A tag with this name already exists (tags are immutable).
    #[error("tag '{0}' already exists")]
    TagExists(String),

    /// The file a version points at is gone.
    #[error("source file '{0}' not found")]
    SourceMissing(String),

    /// Underlying content store failure.
    #[error("version store error: {0}")]
    Store(#[from] StoreError),

    /// Conflict bookkeeping failure.
    #[error("version conflict error: {0}")]
    Conflict(#[from] ConflictError),

    /// Database error while persisting version data.
    #[error("version database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Conflict errors
// ---------------------------------------------------------------------------

/// Errors from conflict persistence and resolution.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// The requested conflict ID was not found.
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Attempted to resolve a conflict that is already resolved.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(String),

    /// The provided resolution is invalid.
    #[error("invalid resolution for conflict {id}: {detail}")]
    InvalidResolution {
        id: String,
        detail: String,
    },

    /// Database error when persisting conflict data.
    #[error("conflict database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Workflow errors
// ---------------------------------------------------------------------------

/// Errors from the workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The requested task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The requested step does not exist within the task.
    #[error("step '{step_id}' not found in task {task_id}")]
    StepNotFound {
        task_id: String,
        step_id: String,
    },

    /// A step was started before all its dependencies completed.
    #[error("dependencies not met for step '{step_id}': waiting on {waiting_on:?}")]
    DependencyNotMet {
        step_id: String,
        waiting_on: Vec<String>,
    },

    /// A status change is not in the transition table.
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// The task is not in a state that accepts this operation.
    #[error("task {task_id} is {status}, expected {expected}")]
    TaskState {
        task_id: String,
        status: String,
        expected: String,
    },

    /// Another caller is already driving this task.
    #[error("task {0} is already being advanced")]
    TaskBusy(String),

    /// The validation step scored a metric below its threshold.
    #[error("quality threshold failed for {metric} on '{key}' ({locale}): scored {actual:.1}, limit {threshold:.1}")]
    QualityThreshold {
        key: String,
        locale: String,
        metric: String,
        actual: f64,
        threshold: f64,
    },

    /// No actor could be assigned to a step.
    #[error("no {role} available for step '{step_id}'")]
    NoAssignee {
        step_id: String,
        role: String,
    },

    /// The actor is not allowed to act on this step.
    #[error("actor '{actor}' may not act on step '{step_id}': {detail}")]
    NotPermitted {
        actor: String,
        step_id: String,
        detail: String,
    },

    /// A reviewer rejected the step.
    #[error("step '{step_id}' rejected by {actor}: {reason}")]
    Rejected {
        step_id: String,
        actor: String,
        reason: String,
    },

    /// A translation submission does not match a task target.
    #[error("invalid translation submission for task {task_id}: {detail}")]
    InvalidSubmission {
        task_id: String,
        detail: String,
    },

    /// A custom step graph has duplicate ids, unknown dependencies or a cycle.
    #[error("invalid step graph: {0}")]
    InvalidGraph(String),

    /// The step graph can make no further progress.
    #[error("task {task_id} is stalled: {detail}")]
    Stalled {
        task_id: String,
        detail: String,
    },

    /// The requested actor does not exist.
    #[error("actor not found: {0}")]
    ActorNotFound(String),

    /// Underlying version manager error during a translation step.
    #[error("workflow version error: {0}")]
    Version(#[from] VersionError),

    /// Underlying deployment error during a deployment step.
    #[error("workflow deployment error: {0}")]
    Deploy(#[from] DeployError),

    /// Resource file I/O during a translation step.
    #[error("workflow store error: {0}")]
    Store(#[from] StoreError),

    /// Database error while persisting task data.
    #[error("workflow database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Sync / deployment errors
// ---------------------------------------------------------------------------

/// Errors from the sync / deployment manager.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Wrong environment type, or no registry entry for the name.
    #[error("invalid environment '{name}': {detail}")]
    InvalidEnvironment {
        name: String,
        detail: String,
    },

    /// Post-deploy verification failed.
    #[error("deployment {deployment_id} verification failed (rolled back: {rolled_back}): {}", errors.join("; "))]
    VerificationFailed {
        deployment_id: String,
        rolled_back: bool,
        errors: Vec<String>,
    },

    /// Pre-deploy validation against the expected file set failed.
    #[error("pre-deployment validation failed for '{environment}': {}", errors.join("; "))]
    ValidationFailed {
        environment: String,
        errors: Vec<String>,
    },

    /// Rollback attempted without confirmation or on a disabled environment.
    #[error("rollback refused for '{environment}': {detail}")]
    RollbackPrecondition {
        environment: String,
        detail: String,
    },

    /// The requested deployment is not in the history.
    #[error("deployment {0} not found")]
    DeploymentNotFound(String),

    /// The requested backup does not exist.
    #[error("backup {0} not found")]
    BackupNotFound(String),

    /// The requested sync operation does not exist.
    #[error("sync operation {0} not found")]
    OperationNotFound(String),

    /// Another deployment or rollback holds the environment.
    #[error("environment '{0}' is busy with another deployment")]
    EnvironmentBusy(String),

    /// Generic I/O wrapper.
    #[error("deployment I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Hashing a source or deployed file failed.
    #[error("deployment store error: {0}")]
    Store(#[from] StoreError),

    /// Database error while recording history.
    #[error("deployment database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// A JSON column could not be encoded or decoded.
    #[error("database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from the notification subsystem.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// HTTP error during webhook delivery.
    #[error("notification HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The webhook endpoint answered with a non-success status.
    #[error("webhook rejected event (HTTP {status})")]
    Rejected {
        status: u16,
    },

    /// The background delivery task is gone.
    #[error("notification channel closed")]
    ChannelClosed,
}
