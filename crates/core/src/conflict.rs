//! Key-level conflict detection and resolution bookkeeping.
//!
//! A conflict exists where two snapshots both define a dotted key and the
//! values differ. Detection is pure ([`ConflictDetector`]); persistence and
//! resolution go through [`ConflictResolver`]. Resolving a conflict never
//! rewrites a resource file: callers apply [`ConflictRecord::effective_value`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::db::Database;
use crate::errors::ConflictError;
use crate::models::{new_id, AuditEntry};
use crate::resource::value_text;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle status of a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "resolved" => Self::Resolved,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

/// How a conflict is (to be) resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    UseCurrent,
    UseIncoming,
    Merge,
    Manual,
}

impl Resolution {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "use_current" => Some(Self::UseCurrent),
            "use_incoming" => Some(Self::UseIncoming),
            "merge" => Some(Self::Merge),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    /// Whether this strategy needs an explicit resolved value.
    pub fn needs_value(self) -> bool {
        matches!(self, Self::Merge | Self::Manual)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UseCurrent => write!(f, "use_current"),
            Self::UseIncoming => write!(f, "use_incoming"),
            Self::Merge => write!(f, "merge"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A persisted key conflict between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictRecord {
    pub id: String,
    /// What was being compared, e.g. `merge:feature->main:en-US/common`.
    pub scope: String,
    pub locale: String,
    pub namespace: String,
    pub key: String,
    pub current_value: String,
    pub incoming_value: String,
    pub status: ConflictStatus,
    pub resolution: Resolution,
    pub resolved_value: Option<String>,
    pub resolved_by: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// A new pending record.
    pub fn new(
        scope: &str,
        locale: &str,
        namespace: &str,
        conflict: KeyConflict,
    ) -> Self {
        Self {
            id: new_id("conflict"),
            scope: scope.to_string(),
            locale: locale.to_string(),
            namespace: namespace.to_string(),
            key: conflict.key,
            current_value: conflict.current,
            incoming_value: conflict.incoming,
            status: ConflictStatus::Pending,
            resolution: Resolution::Manual,
            resolved_value: None,
            resolved_by: None,
            timestamp: Utc::now(),
            resolved_at: None,
        }
    }

    /// The value a resolved conflict settles on. `None` while pending.
    pub fn effective_value(&self) -> Option<&str> {
        if self.status != ConflictStatus::Resolved {
            return None;
        }
        match self.resolution {
            Resolution::UseCurrent => Some(&self.current_value),
            Resolution::UseIncoming => Some(&self.incoming_value),
            Resolution::Merge | Resolution::Manual => self.resolved_value.as_deref(),
        }
    }
}

/// A key defined on both sides with different values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConflict {
    pub key: String,
    pub current: String,
    pub incoming: String,
}

/// How a caller wants a conflict resolved.
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub resolution: Resolution,
    pub resolved_value: Option<String>,
    pub resolved_by: String,
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Compares flattened snapshots key by key.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Keys present on both sides whose JSON values differ, in key order.
    ///
    /// Keys present on only one side are not conflicts.
    pub fn detect(
        current: &BTreeMap<String, Value>,
        incoming: &BTreeMap<String, Value>,
    ) -> Vec<KeyConflict> {
        let conflicts: Vec<KeyConflict> = current
            .iter()
            .filter_map(|(key, cur)| {
                let inc = incoming.get(key)?;
                (inc != cur).then(|| KeyConflict {
                    key: key.clone(),
                    current: value_text(cur),
                    incoming: value_text(inc),
                })
            })
            .collect();
        debug!(
            current_keys = current.len(),
            incoming_keys = incoming.len(),
            conflicts = conflicts.len(),
            "compared snapshots"
        );
        conflicts
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Stateless conflict persistence and resolution operations.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Persist freshly detected conflicts.
    pub fn record(
        db: &Database,
        scope: &str,
        locale: &str,
        namespace: &str,
        conflicts: Vec<KeyConflict>,
    ) -> Result<Vec<ConflictRecord>, ConflictError> {
        let mut records = Vec::with_capacity(conflicts.len());
        for conflict in conflicts {
            let record = ConflictRecord::new(scope, locale, namespace, conflict);
            db.insert_conflict(&record)?;
            records.push(record);
        }
        if !records.is_empty() {
            info!(scope, count = records.len(), "recorded conflicts");
        }
        Ok(records)
    }

    /// Resolve a pending conflict and write an audit entry.
    pub fn resolve(
        db: &Database,
        conflict_id: &str,
        request: &ResolutionRequest,
    ) -> Result<ConflictRecord, ConflictError> {
        let mut conflict = db
            .get_conflict(conflict_id)?
            .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()))?;

        if conflict.status == ConflictStatus::Resolved {
            return Err(ConflictError::AlreadyResolved(conflict_id.to_string()));
        }
        if request.resolution.needs_value() && request.resolved_value.is_none() {
            return Err(ConflictError::InvalidResolution {
                id: conflict_id.to_string(),
                detail: format!("'{}' requires a resolved value", request.resolution),
            });
        }
        if request.resolved_by.trim().is_empty() {
            return Err(ConflictError::InvalidResolution {
                id: conflict_id.to_string(),
                detail: "resolved_by must not be empty".into(),
            });
        }

        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = request.resolution;
        conflict.resolved_value = if request.resolution.needs_value() {
            request.resolved_value.clone()
        } else {
            None
        };
        conflict.resolved_by = Some(request.resolved_by.clone());
        conflict.resolved_at = Some(Utc::now());
        db.update_conflict_resolution(&conflict)?;

        let details = format!(
            "Resolved conflict on '{}' ({}/{}) with '{}'",
            conflict.key, conflict.locale, conflict.namespace, conflict.resolution
        );
        let _ = db.insert_audit_entry(
            &AuditEntry::success("conflict_resolved", &details)
                .with_subject(conflict_id)
                .with_actor(&request.resolved_by),
        );

        info!(conflict_id, resolution = %conflict.resolution, "conflict resolved");
        Ok(conflict)
    }
}
