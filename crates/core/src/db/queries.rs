//! Typed query helpers for every table in the l10nflow database.
//!
//! Append-only history tables (`deployments`, `rollbacks`, `backups`,
//! `sync_operations`, `tasks`, `environments`) keep indexed columns for
//! filtering plus a JSON `body` column holding the full record.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::Database;
use crate::conflict::{ConflictRecord, ConflictStatus, Resolution};
use crate::errors::DatabaseError;
use crate::models::{
    AuditEntry, BackupRecord, Branch, DeploymentResult, EnvironmentConfig, RollbackResult,
    SyncOperation, Tag, Version,
};
use crate::workflow::collaborators::{Actor, Role};
use crate::workflow::state::{ReviewComment, Task};

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `branch_history` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub id: i64,
    pub branch: String,
    pub version_id: String,
    pub locale: String,
    pub namespace: String,
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub subject: Option<String>,
    pub actor: Option<String>,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

/// Raw `versions` row; JSON columns are decoded afterwards.
struct VersionRow {
    id: String,
    file_path: String,
    locale: String,
    namespace: String,
    version: String,
    author: String,
    hash: String,
    parent_hash: Option<String>,
    changes: String,
    metadata: String,
    created_at: String,
}

const VERSION_COLUMNS: &str = "id, file_path, locale, namespace, version, author, hash, \
                               parent_hash, changes, metadata, created_at";

fn version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        id: row.get(0)?,
        file_path: row.get(1)?,
        locale: row.get(2)?,
        namespace: row.get(3)?,
        version: row.get(4)?,
        author: row.get(5)?,
        hash: row.get(6)?,
        parent_hash: row.get(7)?,
        changes: row.get(8)?,
        metadata: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl VersionRow {
    fn decode(self) -> Result<Version, DatabaseError> {
        Ok(Version {
            id: self.id,
            file_path: self.file_path,
            locale: self.locale,
            namespace: self.namespace,
            version: self.version,
            timestamp: parse_datetime(&self.created_at),
            author: self.author,
            changes: serde_json::from_str(&self.changes)?,
            hash: self.hash,
            parent_hash: self.parent_hash,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- generic JSON-body helpers -------------------------------------------

    fn query_bodies<T: DeserializeOwned, P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<T>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(bodies.len());
        for body in &bodies {
            out.push(serde_json::from_str(body)?);
        }
        Ok(out)
    }

    fn query_body<T: DeserializeOwned, P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Option<T>, DatabaseError> {
        let body: Option<String> = self
            .conn()
            .query_row(sql, params, |row| row.get(0))
            .optional()?;
        match body {
            Some(b) => Ok(Some(serde_json::from_str(&b)?)),
            None => Ok(None),
        }
    }

    fn encode<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
        Ok(serde_json::to_string(value)?)
    }

    // -- versions & branch history -------------------------------------------

    /// Persist a version, append it to `branch`'s history and move the
    /// branch head, all in one transaction. Returns the history row id.
    pub fn record_version(&self, version: &Version, branch: &str) -> Result<i64, DatabaseError> {
        let changes = Self::encode(&version.changes)?;
        let metadata = Self::encode(&version.metadata)?;
        let created_at = version.timestamp.to_rfc3339();

        let history_id = self.transaction(|conn| {
            conn.execute(
                "INSERT INTO versions (id, file_path, locale, namespace, version, branch, author,
                                       hash, parent_hash, changes, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    version.id,
                    version.file_path,
                    version.locale,
                    version.namespace,
                    version.version,
                    branch,
                    version.author,
                    version.hash,
                    version.parent_hash,
                    changes,
                    metadata,
                    created_at,
                ],
            )?;
            conn.execute(
                "INSERT INTO branch_history (branch, version_id, locale, namespace, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![branch, version.id, version.locale, version.namespace, created_at],
            )?;
            let history_id = conn.last_insert_rowid();
            let updated = conn.execute(
                "UPDATE branches SET head = ?1, updated_at = ?2 WHERE name = ?3",
                params![version.id, created_at, branch],
            )?;
            if updated == 0 {
                return Err(DatabaseError::NotFound {
                    entity: "branch".into(),
                    id: branch.to_string(),
                });
            }
            Ok(history_id)
        })?;

        debug!(version_id = %version.id, branch, history_id, "recorded version");
        Ok(history_id)
    }

    /// Get a version by id.
    pub fn get_version(&self, id: &str) -> Result<Option<Version>, DatabaseError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE id = ?1"),
                params![id],
                version_row,
            )
            .optional()?;
        row.map(VersionRow::decode).transpose()
    }

    /// Every version of a (locale, namespace) across all branches, newest first.
    pub fn list_versions_for_scope(
        &self,
        locale: &str,
        namespace: &str,
    ) -> Result<Vec<Version>, DatabaseError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {VERSION_COLUMNS} FROM versions
                 WHERE locale = ?1 AND namespace = ?2
                 ORDER BY created_at DESC, rowid DESC"
            ))?;
            let rows = stmt
                .query_map(params![locale, namespace], version_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(VersionRow::decode).collect()
    }

    /// History rows of one branch, oldest first, optionally limited to one
    /// scope and to rows with `id <= max_id`.
    pub fn branch_history(
        &self,
        branch: &str,
        scope: Option<(&str, &str)>,
        max_id: Option<i64>,
    ) -> Result<Vec<HistoryRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, branch, version_id, locale, namespace FROM branch_history
             WHERE branch = ?1
               AND (?2 IS NULL OR (locale = ?2 AND namespace = ?3))
               AND (?4 IS NULL OR id <= ?4)
             ORDER BY id ASC",
        )?;
        let (locale, namespace) = match scope {
            Some((l, n)) => (Some(l), Some(n)),
            None => (None, None),
        };
        let rows = stmt
            .query_map(params![branch, locale, namespace, max_id], |row| {
                Ok(HistoryRow {
                    id: row.get(0)?,
                    branch: row.get(1)?,
                    version_id: row.get(2)?,
                    locale: row.get(3)?,
                    namespace: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Highest history row id across all branches.
    pub fn max_history_id(&self) -> Result<Option<i64>, DatabaseError> {
        let id: Option<i64> =
            self.conn()
                .query_row("SELECT MAX(id) FROM branch_history", [], |row| row.get(0))?;
        Ok(id)
    }

    // -- branches -------------------------------------------------------------

    /// Insert a new branch.
    pub fn insert_branch(&self, branch: &Branch) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO branches (id, name, description, source, head, forked_at, is_default,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                branch.id,
                branch.name,
                branch.description,
                branch.source,
                branch.head,
                branch.forked_at,
                branch.is_default,
                branch.created_at.to_rfc3339(),
                branch.updated_at.to_rfc3339(),
            ],
        )?;
        debug!(name = %branch.name, source = ?branch.source, "inserted branch");
        Ok(())
    }

    fn branch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Branch> {
        let created_at: String = row.get(7)?;
        let updated_at: String = row.get(8)?;
        Ok(Branch {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            source: row.get(3)?,
            head: row.get(4)?,
            forked_at: row.get(5)?,
            is_default: row.get(6)?,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        })
    }

    /// Get a branch by name.
    pub fn get_branch(&self, name: &str) -> Result<Option<Branch>, DatabaseError> {
        let branch = self
            .conn()
            .query_row(
                "SELECT id, name, description, source, head, forked_at, is_default,
                        created_at, updated_at
                 FROM branches WHERE name = ?1",
                params![name],
                Self::branch_from_row,
            )
            .optional()?;
        Ok(branch)
    }

    /// All branches, default first, then by creation.
    pub fn list_branches(&self) -> Result<Vec<Branch>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, description, source, head, forked_at, is_default,
                    created_at, updated_at
             FROM branches ORDER BY is_default DESC, created_at ASC, rowid ASC",
        )?;
        let branches = stmt
            .query_map([], Self::branch_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(branches)
    }

    // -- tags -----------------------------------------------------------------

    /// Insert a tag. Fails with a constraint error if the name is taken.
    pub fn insert_tag(&self, tag: &Tag) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO tags (name, version, branch, message, author, files, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tag.name,
                tag.version,
                tag.branch,
                tag.message,
                tag.author,
                Self::encode(&tag.files)?,
                tag.timestamp.to_rfc3339(),
            ],
        )?;
        debug!(name = %tag.name, files = tag.files.len(), "inserted tag");
        Ok(())
    }

    fn tag_rows(&self, sql: &str, name: Option<&str>) -> Result<Vec<Tag>, DatabaseError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(sql)?;
            let map = |row: &rusqlite::Row<'_>| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            };
            let rows = match name {
                Some(n) => stmt.query_map(params![n], map)?.collect::<Result<Vec<_>, _>>()?,
                None => stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?,
            };
            rows
        };
        rows.into_iter()
            .map(|(name, version, branch, message, author, files, created_at)| {
                Ok(Tag {
                    name,
                    version,
                    branch,
                    message,
                    author,
                    files: serde_json::from_str(&files)?,
                    timestamp: parse_datetime(&created_at),
                })
            })
            .collect()
    }

    /// Get a tag by name.
    pub fn get_tag(&self, name: &str) -> Result<Option<Tag>, DatabaseError> {
        let mut tags = self.tag_rows(
            "SELECT name, version, branch, message, author, files, created_at
             FROM tags WHERE name = ?1",
            Some(name),
        )?;
        Ok(tags.pop())
    }

    /// All tags, newest first.
    pub fn list_tags(&self) -> Result<Vec<Tag>, DatabaseError> {
        self.tag_rows(
            "SELECT name, version, branch, message, author, files, created_at
             FROM tags ORDER BY created_at DESC, rowid DESC",
            None,
        )
    }

    // -- conflicts --------------------------------------------------------------

    /// Insert a conflict record.
    pub fn insert_conflict(&self, c: &ConflictRecord) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO conflicts (id, scope, locale, namespace, key, current_value,
                                    incoming_value, status, resolution, resolved_value,
                                    resolved_by, created_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                c.id,
                c.scope,
                c.locale,
                c.namespace,
                c.key,
                c.current_value,
                c.incoming_value,
                c.status.to_string(),
                c.resolution.to_string(),
                c.resolved_value,
                c.resolved_by,
                c.timestamp.to_rfc3339(),
                c.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        debug!(id = %c.id, key = %c.key, "inserted conflict");
        Ok(())
    }

    fn conflict_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictRecord> {
        let status: String = row.get(7)?;
        let resolution: String = row.get(8)?;
        let created_at: String = row.get(11)?;
        let resolved_at: Option<String> = row.get(12)?;
        Ok(ConflictRecord {
            id: row.get(0)?,
            scope: row.get(1)?,
            locale: row.get(2)?,
            namespace: row.get(3)?,
            key: row.get(4)?,
            current_value: row.get(5)?,
            incoming_value: row.get(6)?,
            status: ConflictStatus::from_str_val(&status),
            resolution: Resolution::from_str_val(&resolution).unwrap_or(Resolution::Manual),
            resolved_value: row.get(9)?,
            resolved_by: row.get(10)?,
            timestamp: parse_datetime(&created_at),
            resolved_at: resolved_at.as_deref().map(parse_datetime),
        })
    }

    const CONFLICT_COLUMNS: &'static str = "id, scope, locale, namespace, key, current_value, \
        incoming_value, status, resolution, resolved_value, resolved_by, created_at, resolved_at";

    /// Get a conflict by id.
    pub fn get_conflict(&self, id: &str) -> Result<Option<ConflictRecord>, DatabaseError> {
        let conflict = self
            .conn()
            .query_row(
                &format!("SELECT {} FROM conflicts WHERE id = ?1", Self::CONFLICT_COLUMNS),
                params![id],
                Self::conflict_from_row,
            )
            .optional()?;
        Ok(conflict)
    }

    /// Conflicts, newest first, optionally filtered by status.
    pub fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM conflicts WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, rowid DESC",
            Self::CONFLICT_COLUMNS
        ))?;
        let conflicts = stmt
            .query_map(
                params![status.map(|s| s.to_string())],
                Self::conflict_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    /// A resolved record for the same scope, key and pair of values.
    pub fn find_resolved_conflict(
        &self,
        scope: &str,
        key: &str,
        current_value: &str,
        incoming_value: &str,
    ) -> Result<Option<ConflictRecord>, DatabaseError> {
        let conflict = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM conflicts
                     WHERE scope = ?1 AND key = ?2 AND current_value = ?3
                       AND incoming_value = ?4 AND status = 'resolved'
                     ORDER BY resolved_at DESC LIMIT 1",
                    Self::CONFLICT_COLUMNS
                ),
                params![scope, key, current_value, incoming_value],
                Self::conflict_from_row,
            )
            .optional()?;
        Ok(conflict)
    }

    /// A pending record for the same scope, key and pair of values.
    pub fn find_pending_conflict(
        &self,
        scope: &str,
        key: &str,
        current_value: &str,
        incoming_value: &str,
    ) -> Result<Option<ConflictRecord>, DatabaseError> {
        let conflict = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {} FROM conflicts
                     WHERE scope = ?1 AND key = ?2 AND current_value = ?3
                       AND incoming_value = ?4 AND status = 'pending'
                     LIMIT 1",
                    Self::CONFLICT_COLUMNS
                ),
                params![scope, key, current_value, incoming_value],
                Self::conflict_from_row,
            )
            .optional()?;
        Ok(conflict)
    }

    /// Write the resolution fields of a conflict.
    pub fn update_conflict_resolution(&self, c: &ConflictRecord) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE conflicts SET status = ?1, resolution = ?2, resolved_value = ?3,
                                  resolved_by = ?4, resolved_at = ?5
             WHERE id = ?6",
            params![
                c.status.to_string(),
                c.resolution.to_string(),
                c.resolved_value,
                c.resolved_by,
                c.resolved_at.map(|t| t.to_rfc3339()),
                c.id,
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "conflict".into(),
                id: c.id.clone(),
            });
        }
        debug!(id = %c.id, status = %c.status, "updated conflict");
        Ok(())
    }

    // -- tasks -------------------------------------------------------------------

    /// Insert or replace a task record.
    pub fn upsert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO tasks (id, title, task_type, priority, status, created_by, body,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title, priority = excluded.priority,
                status = excluded.status, body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                task.id,
                task.title,
                task.task_type.to_string(),
                task.priority.to_string(),
                task.status.to_string(),
                task.created_by,
                Self::encode(task)?,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        debug!(task_id = %task.id, status = %task.status, "saved task");
        Ok(())
    }

    /// Get a task by id.
    pub fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        self.query_body("SELECT body FROM tasks WHERE id = ?1", params![id])
    }

    /// All tasks, newest first.
    pub fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        self.query_bodies(
            "SELECT body FROM tasks ORDER BY created_at DESC, rowid DESC",
            [],
        )
    }

    // -- review comments ---------------------------------------------------------

    /// Insert a review comment.
    pub fn insert_review_comment(&self, comment: &ReviewComment) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO review_comments (id, task_id, step_id, author, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                comment.id,
                comment.task_id,
                comment.step_id,
                comment.author,
                comment.body,
                comment.created_at.to_rfc3339(),
            ],
        )?;
        debug!(task_id = %comment.task_id, author = %comment.author, "inserted review comment");
        Ok(())
    }

    /// Comments on a task, oldest first.
    pub fn list_review_comments(&self, task_id: &str) -> Result<Vec<ReviewComment>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, task_id, step_id, author, body, created_at
             FROM review_comments WHERE task_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let comments = stmt
            .query_map(params![task_id], |row| {
                let created_at: String = row.get(5)?;
                Ok(ReviewComment {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    step_id: row.get(2)?,
                    author: row.get(3)?,
                    body: row.get(4)?,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(comments)
    }

    // -- actors --------------------------------------------------------------------

    /// Insert or replace an actor.
    pub fn upsert_actor(&self, actor: &Actor) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO actors (id, name, email, role, languages, available, workload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, email = excluded.email, role = excluded.role,
                languages = excluded.languages, available = excluded.available,
                workload = excluded.workload",
            params![
                actor.id,
                actor.name,
                actor.email,
                actor.role.to_string(),
                Self::encode(&actor.languages)?,
                actor.available,
                actor.workload,
            ],
        )?;
        debug!(actor = %actor.id, role = %actor.role, "saved actor");
        Ok(())
    }

    fn actor_rows(&self, id: Option<&str>) -> Result<Vec<Actor>, DatabaseError> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT id, name, email, role, languages, available, workload
                 FROM actors WHERE (?1 IS NULL OR id = ?1) ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, u32>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter()
            .map(|(id, name, email, role, languages, available, workload)| {
                Ok(Actor {
                    role: Role::from_str_val(&role).unwrap_or(Role::Translator),
                    id,
                    name,
                    email,
                    languages: serde_json::from_str(&languages)?,
                    available,
                    workload,
                })
            })
            .collect()
    }

    /// Get an actor by id.
    pub fn get_actor(&self, id: &str) -> Result<Option<Actor>, DatabaseError> {
        Ok(self.actor_rows(Some(id))?.pop())
    }

    /// All actors, by id.
    pub fn list_actors(&self) -> Result<Vec<Actor>, DatabaseError> {
        self.actor_rows(None)
    }

    /// Add `delta` to an actor's workload, never going below zero.
    pub fn adjust_workload(&self, id: &str, delta: i64) -> Result<(), DatabaseError> {
        let changed = self.conn().execute(
            "UPDATE actors SET workload = MAX(0, workload + ?1) WHERE id = ?2",
            params![delta, id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "actor".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // -- environments ----------------------------------------------------------------

    /// Insert or replace an environment (last write wins).
    pub fn upsert_environment(&self, env: &EnvironmentConfig) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO environments (name, env_type, body, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                env_type = excluded.env_type, body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                env.name,
                env.env_type.to_string(),
                Self::encode(env)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(environment = %env.name, "saved environment");
        Ok(())
    }

    /// Get an environment by name.
    pub fn get_environment(&self, name: &str) -> Result<Option<EnvironmentConfig>, DatabaseError> {
        self.query_body(
            "SELECT body FROM environments WHERE name = ?1",
            params![name],
        )
    }

    /// All environments, by name.
    pub fn list_environments(&self) -> Result<Vec<EnvironmentConfig>, DatabaseError> {
        self.query_bodies("SELECT body FROM environments ORDER BY name ASC", [])
    }

    // -- sync operations ---------------------------------------------------------------

    /// Insert or update a sync operation.
    pub fn upsert_operation(&self, op: &SyncOperation) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO sync_operations (id, op_type, target, status, body, started_at,
                                          completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status, body = excluded.body,
                completed_at = excluded.completed_at",
            params![
                op.id,
                op.op_type.to_string(),
                op.target,
                op.status.to_string(),
                Self::encode(op)?,
                op.started_at.to_rfc3339(),
                op.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        debug!(operation = %op.id, status = %op.status, progress = op.progress, "saved sync operation");
        Ok(())
    }

    /// Get a sync operation by id.
    pub fn get_operation(&self, id: &str) -> Result<Option<SyncOperation>, DatabaseError> {
        self.query_body(
            "SELECT body FROM sync_operations WHERE id = ?1",
            params![id],
        )
    }

    /// Sync operations, newest first.
    pub fn list_operations(&self, limit: u32) -> Result<Vec<SyncOperation>, DatabaseError> {
        self.query_bodies(
            "SELECT body FROM sync_operations ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            params![limit],
        )
    }

    // -- deployment history --------------------------------------------------------------

    /// Append a deployment result.
    pub fn insert_deployment(&self, result: &DeploymentResult) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO deployments (id, environment, success, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                result.deployment_id,
                result.environment,
                result.success,
                Self::encode(result)?,
                result.timestamp.to_rfc3339(),
            ],
        )?;
        debug!(deployment_id = %result.deployment_id, success = result.success, "recorded deployment");
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: &str) -> Result<Option<DeploymentResult>, DatabaseError> {
        self.query_body("SELECT body FROM deployments WHERE id = ?1", params![id])
    }

    /// Deployments, newest first, optionally for one environment.
    pub fn list_deployments(
        &self,
        environment: Option<&str>,
        limit: u32,
    ) -> Result<Vec<DeploymentResult>, DatabaseError> {
        self.query_bodies(
            "SELECT body FROM deployments WHERE (?1 IS NULL OR environment = ?1)
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            params![environment, limit],
        )
    }

    /// Append a rollback result.
    pub fn insert_rollback(&self, result: &RollbackResult) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO rollbacks (id, environment, target_deployment_id, success, body,
                                    created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.rollback_id,
                result.environment,
                result.target_deployment_id,
                result.success,
                Self::encode(result)?,
                result.timestamp.to_rfc3339(),
            ],
        )?;
        debug!(rollback_id = %result.rollback_id, success = result.success, "recorded rollback");
        Ok(())
    }

    /// Rollbacks, newest first, optionally for one environment.
    pub fn list_rollbacks(
        &self,
        environment: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RollbackResult>, DatabaseError> {
        self.query_bodies(
            "SELECT body FROM rollbacks WHERE (?1 IS NULL OR environment = ?1)
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            params![environment, limit],
        )
    }

    // -- backups -----------------------------------------------------------------------------

    /// Record a backup.
    pub fn insert_backup(&self, backup: &BackupRecord) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO backups (id, environment, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                backup.id,
                backup.environment,
                Self::encode(backup)?,
                backup.created_at.to_rfc3339(),
            ],
        )?;
        debug!(backup_id = %backup.id, files = backup.files.len(), "recorded backup");
        Ok(())
    }

    /// Get a backup by id.
    pub fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>, DatabaseError> {
        self.query_body("SELECT body FROM backups WHERE id = ?1", params![id])
    }

    /// Backups, newest first, optionally for one environment.
    pub fn list_backups(&self, environment: Option<&str>) -> Result<Vec<BackupRecord>, DatabaseError> {
        self.query_bodies(
            "SELECT body FROM backups WHERE (?1 IS NULL OR environment = ?1)
             ORDER BY created_at DESC, rowid DESC",
            params![environment],
        )
    }

    /// Forget a backup record.
    pub fn delete_backup(&self, id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM backups WHERE id = ?1", params![id])?;
        debug!(backup_id = id, "deleted backup record");
        Ok(())
    }

    // -- audit_log -----------------------------------------------------------------------------

    /// Insert an audit entry.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, subject, actor, details, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.action,
                entry.subject,
                entry.actor,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, "inserted audit_log entry");
        Ok(id)
    }

    /// List recent audit-log entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, subject, actor, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    subject: row.get(2)?,
                    actor: row.get(3)?,
                    details: row.get(4)?,
                    success: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Count all audit-log entries.
    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Parse an RFC 3339 timestamp, falling back to now for malformed values.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        new_id, Change, ChangeType, DeployedFile, EnvironmentFeatures, EnvironmentType,
        Severity, VersionMetadata,
    };
    use std::path::PathBuf;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn branch(name: &str) -> Branch {
        Branch {
            id: new_id("branch"),
            name: name.into(),
            description: String::new(),
            source: None,
            head: None,
            forked_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_default: name == "main",
        }
    }

    fn version(id: &str) -> Version {
        Version {
            id: id.into(),
            file_path: "/l/en-US/common.json".into(),
            locale: "en-US".into(),
            namespace: "common".into(),
            version: "1.0.0".into(),
            timestamp: Utc::now(),
            author: "alice".into(),
            changes: vec![Change {
                change_type: ChangeType::Add,
                key: "greeting".into(),
                old_value: None,
                new_value: Some("hi".into()),
                severity: Severity::Low,
            }],
            hash: "ab".repeat(32),
            parent_hash: None,
            metadata: VersionMetadata {
                branch: "main".into(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_record_version_moves_head() {
        let db = setup_db();
        db.insert_branch(&branch("main")).unwrap();

        let v = version("version_a");
        let hid = db.record_version(&v, "main").unwrap();
        assert!(hid > 0);
        assert_eq!(db.get_version("version_a").unwrap(), Some(v));
        assert_eq!(
            db.get_branch("main").unwrap().unwrap().head.as_deref(),
            Some("version_a")
        );

        let rows = db.branch_history("main", Some(("en-US", "common")), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version_id, "version_a");
        assert!(db.branch_history("main", Some(("fr-FR", "common")), None).unwrap().is_empty());
        assert!(db.branch_history("main", None, Some(0)).unwrap().is_empty());
    }

    #[test]
    fn test_record_version_unknown_branch_rolls_back() {
        let db = setup_db();
        let result = db.record_version(&version("version_x"), "nope");
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
        assert!(db.get_version("version_x").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let db = setup_db();
        let tag = Tag {
            name: "release-1".into(),
            version: "1.0".into(),
            branch: "main".into(),
            message: String::new(),
            timestamp: Utc::now(),
            author: "alice".into(),
            files: Vec::new(),
        };
        db.insert_tag(&tag).unwrap();
        assert!(db.insert_tag(&tag).is_err());
        assert_eq!(db.list_tags().unwrap().len(), 1);
        assert_eq!(db.get_tag("release-1").unwrap().unwrap().author, "alice");
    }

    #[test]
    fn test_environment_last_write_wins() {
        let db = setup_db();
        let mut env = EnvironmentConfig {
            name: "staging".into(),
            env_type: EnvironmentType::Staging,
            base_url: String::new(),
            source_path: PathBuf::from("/a"),
            deployment_path: PathBuf::from("/b"),
            features: EnvironmentFeatures::default(),
        };
        db.upsert_environment(&env).unwrap();
        env.deployment_path = PathBuf::from("/c");
        db.upsert_environment(&env).unwrap();
        let stored = db.get_environment("staging").unwrap().unwrap();
        assert_eq!(stored.deployment_path, PathBuf::from("/c"));
        assert_eq!(db.list_environments().unwrap().len(), 1);
    }

    #[test]
    fn test_deployment_history_newest_first() {
        let db = setup_db();
        for i in 0..3 {
            db.insert_deployment(&DeploymentResult {
                success: i != 1,
                deployment_id: format!("deploy_{i}"),
                environment: "production".into(),
                timestamp: Utc::now() + chrono::Duration::seconds(i),
                duration_ms: 1,
                files_deployed: 1,
                files: vec![DeployedFile {
                    relative_path: "en-US/common.json".into(),
                    sha256: String::new(),
                    pre_existed: false,
                }],
                backup_id: None,
                rolled_back: false,
                user: "ci".into(),
                errors: Vec::new(),
                warnings: Vec::new(),
            })
            .unwrap();
        }
        let history = db.list_deployments(Some("production"), 10).unwrap();
        let ids: Vec<&str> = history.iter().map(|d| d.deployment_id.as_str()).collect();
        assert_eq!(ids, vec!["deploy_2", "deploy_1", "deploy_0"]);
        assert!(db.list_deployments(Some("staging"), 10).unwrap().is_empty());
        assert!(!db.get_deployment("deploy_1").unwrap().unwrap().success);
    }

    #[test]
    fn test_actor_workload_floor() {
        let db = setup_db();
        db.upsert_actor(&Actor {
            id: "t1".into(),
            name: "T One".into(),
            email: String::new(),
            role: Role::Translator,
            languages: vec!["fr-FR".into()],
            available: true,
            workload: 0,
        })
        .unwrap();
        db.adjust_workload("t1", 2).unwrap();
        db.adjust_workload("t1", -5).unwrap();
        assert_eq!(db.get_actor("t1").unwrap().unwrap().workload, 0);
        assert!(db.adjust_workload("ghost", 1).is_err());
    }

    #[test]
    fn test_audit_log() {
        let db = setup_db();
        db.insert_audit_entry(&AuditEntry::success("deploy", "ok").with_actor("ci"))
            .unwrap();
        let entries = db.list_audit_log(10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor.as_deref(), Some("ci"));
        assert_eq!(db.count_audit_log().unwrap(), 1);
    }
}
