//! Database schema definitions and migration runner.
//!
//! Migrations are plain SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS versions (
            id           TEXT PRIMARY KEY,
            file_path    TEXT NOT NULL,
            locale       TEXT NOT NULL,
            namespace    TEXT NOT NULL,
            version      TEXT NOT NULL,
            branch       TEXT NOT NULL,
            author       TEXT NOT NULL,
            hash         TEXT NOT NULL,
            parent_hash  TEXT,
            changes      TEXT NOT NULL,
            metadata     TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_versions_scope ON versions (locale, namespace);
        CREATE INDEX IF NOT EXISTS idx_versions_hash ON versions (hash);

        CREATE TABLE IF NOT EXISTS branches (
            id           TEXT PRIMARY KEY,
            name         TEXT NOT NULL UNIQUE,
            description  TEXT NOT NULL DEFAULT '',
            source       TEXT,
            head         TEXT,
            forked_at    INTEGER,
            is_default   INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branch_history (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            branch       TEXT NOT NULL,
            version_id   TEXT NOT NULL REFERENCES versions (id),
            locale       TEXT NOT NULL,
            namespace    TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_branch_history_branch ON branch_history (branch, locale, namespace);

        CREATE TABLE IF NOT EXISTS tags (
            name         TEXT PRIMARY KEY,
            version      TEXT NOT NULL,
            branch       TEXT NOT NULL,
            message      TEXT NOT NULL DEFAULT '',
            author       TEXT NOT NULL,
            files        TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conflicts (
            id              TEXT PRIMARY KEY,
            scope           TEXT NOT NULL,
            locale          TEXT NOT NULL,
            namespace       TEXT NOT NULL,
            key             TEXT NOT NULL,
            current_value   TEXT NOT NULL,
            incoming_value  TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            resolution      TEXT NOT NULL DEFAULT 'manual',
            resolved_value  TEXT,
            resolved_by     TEXT,
            created_at      TEXT NOT NULL,
            resolved_at     TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_conflicts_status ON conflicts (status);
        CREATE INDEX IF NOT EXISTS idx_conflicts_scope ON conflicts (scope, key);

        CREATE TABLE IF NOT EXISTS tasks (
            id           TEXT PRIMARY KEY,
            title        TEXT NOT NULL,
            task_type    TEXT NOT NULL,
            priority     TEXT NOT NULL,
            status       TEXT NOT NULL,
            created_by   TEXT NOT NULL,
            body         TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);

        CREATE TABLE IF NOT EXISTS environments (
            name         TEXT PRIMARY KEY,
            env_type     TEXT NOT NULL,
            body         TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_operations (
            id            TEXT PRIMARY KEY,
            op_type       TEXT NOT NULL,
            target        TEXT NOT NULL,
            status        TEXT NOT NULL,
            body          TEXT NOT NULL,
            started_at    TEXT NOT NULL,
            completed_at  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_operations_target ON sync_operations (target);

        CREATE TABLE IF NOT EXISTS deployments (
            id           TEXT PRIMARY KEY,
            environment  TEXT NOT NULL,
            success      INTEGER NOT NULL,
            body         TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_deployments_environment ON deployments (environment);

        CREATE TABLE IF NOT EXISTS rollbacks (
            id                    TEXT PRIMARY KEY,
            environment           TEXT NOT NULL,
            target_deployment_id  TEXT NOT NULL,
            success               INTEGER NOT NULL,
            body                  TEXT NOT NULL,
            created_at            TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS backups (
            id           TEXT PRIMARY KEY,
            environment  TEXT NOT NULL,
            body         TEXT NOT NULL,
            created_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_backups_environment ON backups (environment);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            subject     TEXT,
            actor       TEXT,
            details     TEXT,
            success     INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        "#,
    ),
    (
        2,
        "actor directory and review comments",
        r#"
        CREATE TABLE IF NOT EXISTS actors (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            email       TEXT NOT NULL DEFAULT '',
            role        TEXT NOT NULL,
            languages   TEXT NOT NULL,
            available   INTEGER NOT NULL DEFAULT 1,
            workload    INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS review_comments (
            id          TEXT PRIMARY KEY,
            task_id     TEXT NOT NULL REFERENCES tasks (id),
            step_id     TEXT,
            author      TEXT NOT NULL,
            body        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_review_comments_task ON review_comments (task_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}
