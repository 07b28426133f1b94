//! Sync and deployment manager.
//!
//! The [`SyncManager`] owns the environment registry and moves resource
//! files from an environment's source path to its deployment path. Two
//! policies coexist:
//!
//! 1. **Sync** is partial-success: per-file errors are collected and the
//!    batch carries on.
//! 2. **Deploy** is a guarded sequence: backup, optional validation, copy
//!    (with a `.backup.<deployment_id>` sidecar for every overwritten file),
//!    verification, and rollback on failure when enabled.
//!
//! Every deployment and rollback outcome, failures included, is appended to
//! the history tables. Deployments and rollbacks against one environment
//! are serialized by a named lock.

pub mod backup;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::db::Database;
use crate::errors::DeployError;
use crate::lock::NamedLocks;
use crate::models::{
    new_id, AuditEntry, BackupRecord, DeployedFile, DeploymentResult, EnvironmentConfig,
    EnvironmentType, OperationMetadata, OperationStatus, OperationType, RollbackResult,
    SyncOperation,
};
use crate::notify::{LifecycleEvent, Notifier};
use crate::resource::ResourceTree;
use crate::store::digest_file;
use crate::version::backup_path;

pub use backup::RestoreSummary;

// ---------------------------------------------------------------------------
// Options & reports
// ---------------------------------------------------------------------------

/// Parameters of a sync batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Empty means the configured defaults, else every locale on disk.
    pub languages: Vec<String>,
    /// Empty means the configured defaults, else every namespace on disk.
    pub namespaces: Vec<String>,
    pub dry_run: bool,
    pub user: String,
    pub description: String,
}

/// Parameters of a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployOptions {
    pub environment: String,
    pub languages: Vec<String>,
    pub namespaces: Vec<String>,
    pub user: String,
    /// Take a backup first. `None` follows the environment's `auto_backup`.
    pub backup: Option<bool>,
    /// Check the source files before copying anything.
    pub validate: bool,
    /// Restore on verification failure. `None` follows `rollback_enabled`.
    pub rollback_on_failure: Option<bool>,
}

/// Filter for [`SyncManager::list_operations`].
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub op_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
    pub environment: Option<String>,
    pub limit: usize,
}

/// Outcome of [`SyncManager::validate_environment`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentValidation {
    pub environment: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Source files not present at the deployment path.
    pub missing_files: Vec<String>,
}

/// Extra post-deploy check. Returning `Err` fails verification.
pub trait DeploymentVerifier: Send + Sync {
    fn name(&self) -> &str;
    fn verify(&self, env: &EnvironmentConfig, files: &[DeployedFile]) -> Result<(), String>;
}

/// Every deployed file must parse as a resource table.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParseableVerifier;

impl DeploymentVerifier for ParseableVerifier {
    fn name(&self) -> &str {
        "parseable"
    }

    fn verify(&self, env: &EnvironmentConfig, files: &[DeployedFile]) -> Result<(), String> {
        for file in files {
            let path = env.deployment_path.join(&file.relative_path);
            let bytes = std::fs::read(&path).map_err(|e| format!("{}: {e}", file.relative_path))?;
            ResourceTree::parse(&bytes, &file.relative_path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Environment registry plus sync, deploy, rollback and backup operations.
pub struct SyncManager {
    db: Arc<Database>,
    notifier: Arc<Notifier>,
    config: SyncConfig,
    backups_dir: PathBuf,
    locks: NamedLocks,
    verifiers: RwLock<Vec<Arc<dyn DeploymentVerifier>>>,
}

impl SyncManager {
    pub fn new(
        db: Arc<Database>,
        notifier: Arc<Notifier>,
        config: &SyncConfig,
        backups_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            notifier,
            config: config.clone(),
            backups_dir: backups_dir.into(),
            locks: NamedLocks::new(),
            verifiers: RwLock::new(Vec::new()),
        }
    }

    /// Register an extra post-deploy check.
    pub fn add_verifier(&self, verifier: Arc<dyn DeploymentVerifier>) {
        info!(verifier = verifier.name(), "deployment verifier registered");
        self.verifiers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(verifier);
    }

    fn emit(&self, env: &EnvironmentConfig, event: LifecycleEvent) {
        if env.features.notification_enabled {
            self.notifier.emit(event);
        } else {
            debug!(environment = %env.name, event = event.name(), "notifications disabled");
        }
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.db.insert_audit_entry(&entry) {
            warn!(action = %entry.action, error = %e, "failed to write audit entry");
        }
    }

    // -- environments -------------------------------------------------------

    /// Add or replace an environment. The last registration wins.
    pub fn register_environment(&self, env: &EnvironmentConfig) -> Result<(), DeployError> {
        let invalid = |detail: &str| DeployError::InvalidEnvironment {
            name: env.name.clone(),
            detail: detail.to_string(),
        };
        if env.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if env.source_path.as_os_str().is_empty() {
            return Err(invalid("source_path must not be empty"));
        }
        if env.deployment_path.as_os_str().is_empty() {
            return Err(invalid("deployment_path must not be empty"));
        }
        self.db.upsert_environment(env)?;
        info!(environment = %env.name, env_type = %env.env_type, "registered environment");
        Ok(())
    }

    /// Look up an environment; unknown names are [`DeployError::InvalidEnvironment`].
    pub fn get_environment(&self, name: &str) -> Result<EnvironmentConfig, DeployError> {
        self.db
            .get_environment(name)?
            .ok_or_else(|| DeployError::InvalidEnvironment {
                name: name.to_string(),
                detail: "not registered".into(),
            })
    }

    pub fn list_environments(&self) -> Result<Vec<EnvironmentConfig>, DeployError> {
        Ok(self.db.list_environments()?)
    }

    /// `languages x namespaces` that exist under the source path, as sorted
    /// relative paths.
    fn plan_files(
        &self,
        env: &EnvironmentConfig,
        languages: &[String],
        namespaces: &[String],
    ) -> Result<(Vec<String>, Vec<String>, Vec<String>), DeployError> {
        let on_disk = backup::resource_files(&env.source_path)?;
        let pick = |requested: &[String], defaults: &[String], discovered: Vec<String>| {
            if !requested.is_empty() {
                requested.to_vec()
            } else if !defaults.is_empty() {
                defaults.to_vec()
            } else {
                let mut d = discovered;
                d.sort();
                d.dedup();
                d
            }
        };
        let languages = pick(
            languages,
            &self.config.default_languages,
            on_disk.iter().filter_map(|f| split(f).map(|(l, _)| l.to_string())).collect(),
        );
        let namespaces = pick(
            namespaces,
            &self.config.default_namespaces,
            on_disk.iter().filter_map(|f| split(f).map(|(_, n)| n.to_string())).collect(),
        );

        let mut files = Vec::new();
        for lang in &languages {
            for ns in &namespaces {
                let rel = format!("{lang}/{ns}.json");
                if env.source_path.join(&rel).is_file() {
                    files.push(rel);
                }
            }
        }
        files.sort();
        Ok((files, languages, namespaces))
    }

    // -- sync ---------------------------------------------------------------

    /// Copy the selected files to an environment, collecting per-file errors.
    ///
    /// A dry run only estimates the duration; nothing is copied.
    pub fn sync_to_environment(
        &self,
        name: &str,
        options: &SyncOptions,
    ) -> Result<SyncOperation, DeployError> {
        let env = self.get_environment(name)?;
        let (files, languages, namespaces) =
            self.plan_files(&env, &options.languages, &options.namespaces)?;

        let mut op = SyncOperation {
            id: new_id("sync"),
            op_type: OperationType::Sync,
            source: env.source_path.display().to_string(),
            target: env.name.clone(),
            status: OperationStatus::Pending,
            progress: 0,
            started_at: Utc::now(),
            completed_at: None,
            metadata: OperationMetadata {
                files: files.clone(),
                environments: vec![env.name.clone()],
                languages,
                namespaces,
                user: options.user.clone(),
                description: options.description.clone(),
                dry_run: options.dry_run,
                estimated_duration_ms: Some(files.len() as u64 * self.config.estimated_ms_per_file),
                ..Default::default()
            },
        };
        self.db.upsert_operation(&op)?;
        info!(operation = %op.id, environment = name, files = files.len(), dry_run = options.dry_run, "sync started");

        if options.dry_run {
            op.status = OperationStatus::Completed;
            op.progress = 100;
            op.completed_at = Some(Utc::now());
            self.db.upsert_operation(&op)?;
            return Ok(op);
        }

        op.status = OperationStatus::Running;
        self.db.upsert_operation(&op)?;

        let total = files.len().max(1);
        for (i, rel) in files.iter().enumerate() {
            match backup::copy_relative(&env.source_path, &env.deployment_path, rel) {
                Ok(_) => {
                    op.metadata.files_copied += 1;
                    debug!(operation = %op.id, file = %rel, "synced file");
                }
                Err(e) => {
                    warn!(operation = %op.id, file = %rel, error = %e, "file sync failed");
                    op.metadata.errors.push(format!("{rel}: {e}"));
                }
            }
            op.progress = ((i + 1) * 100 / total) as u8;
        }

        let failed = op.metadata.errors.len();
        op.status = if !files.is_empty() && failed == files.len() {
            OperationStatus::Failed
        } else {
            OperationStatus::Completed
        };
        op.progress = 100;
        op.completed_at = Some(Utc::now());
        self.db.upsert_operation(&op)?;

        info!(
            operation = %op.id,
            environment = name,
            copied = op.metadata.files_copied,
            failed,
            status = %op.status,
            "sync finished"
        );
        self.emit(
            &env,
            LifecycleEvent::SyncCompleted {
                operation_id: op.id.clone(),
                environment: env.name.clone(),
                files: op.metadata.files_copied,
                failed,
                dry_run: false,
            },
        );
        let details = format!("{} copied, {failed} failed", op.metadata.files_copied);
        let entry = if op.status == OperationStatus::Completed {
            AuditEntry::success("sync", &details)
        } else {
            AuditEntry::failure("sync", &details)
        };
        self.audit(entry.with_subject(&op.id).with_actor(&options.user));
        Ok(op)
    }

    /// Sync several environments one after the other.
    pub fn sync_to_multiple_environments(
        &self,
        names: &[String],
        options: &SyncOptions,
    ) -> Vec<(String, Result<SyncOperation, DeployError>)> {
        names
            .iter()
            .map(|name| (name.clone(), self.sync_to_environment(name, options)))
            .collect()
    }

    pub fn get_operation(&self, id: &str) -> Result<SyncOperation, DeployError> {
        self.db
            .get_operation(id)?
            .ok_or_else(|| DeployError::OperationNotFound(id.to_string()))
    }

    /// Operations newest first.
    pub fn list_operations(
        &self,
        filter: &OperationFilter,
    ) -> Result<Vec<SyncOperation>, DeployError> {
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let ops = self
            .db
            .list_operations(u32::MAX)?
            .into_iter()
            .filter(|op| filter.op_type.map_or(true, |t| op.op_type == t))
            .filter(|op| filter.status.map_or(true, |s| op.status == s))
            .filter(|op| {
                filter
                    .environment
                    .as_deref()
                    .map_or(true, |e| op.target == e)
            })
            .take(limit)
            .collect();
        Ok(ops)
    }

    /// Check an environment's paths and source files.
    pub fn validate_environment(&self, name: &str) -> Result<EnvironmentValidation, DeployError> {
        let env = self.get_environment(name)?;
        let mut report = EnvironmentValidation {
            environment: env.name.clone(),
            ..Default::default()
        };
        if !env.source_path.is_dir() {
            report
                .errors
                .push(format!("source path {} does not exist", env.source_path.display()));
        }
        if !env.deployment_path.is_dir() {
            report.warnings.push(format!(
                "deployment path {} does not exist yet",
                env.deployment_path.display()
            ));
        }
        report.errors.extend(source_errors(&env)?);
        for rel in backup::resource_files(&env.source_path)? {
            if !env.deployment_path.join(&rel).is_file() {
                report.missing_files.push(rel);
            }
        }
        if !report.missing_files.is_empty() {
            report.warnings.push(format!(
                "{} file(s) not yet deployed",
                report.missing_files.len()
            ));
        }
        report.valid = report.errors.is_empty();
        Ok(report)
    }

    // -- deployment ---------------------------------------------------------

    /// Deploy to a production-typed environment.
    pub fn deploy_to_production(
        &self,
        options: &DeployOptions,
    ) -> Result<DeploymentResult, DeployError> {
        let env = self
            .get_environment(&options.environment)
            .map_err(|e| self.refuse_deploy(options, e))?;
        if env.env_type != EnvironmentType::Production {
            let err = DeployError::InvalidEnvironment {
                name: env.name,
                detail: format!("expected a production environment, found {}", env.env_type),
            };
            return Err(self.refuse_deploy(options, err));
        }
        self.deploy_to_environment(options)
    }

    /// Backup, validate, copy, verify and (optionally) roll back.
    ///
    /// The returned result is also appended to the deployment history; on
    /// failure the history entry is written before the error is returned.
    pub fn deploy_to_environment(
        &self,
        options: &DeployOptions,
    ) -> Result<DeploymentResult, DeployError> {
        let env = self
            .get_environment(&options.environment)
            .map_err(|e| self.refuse_deploy(options, e))?;
        let Some(_guard) = self.locks.try_acquire(&lock_name(&env.name)) else {
            return Err(self.refuse_deploy(options, DeployError::EnvironmentBusy(env.name.clone())));
        };

        let started = Instant::now();
        let mut result = DeploymentResult {
            success: false,
            deployment_id: new_id("deploy"),
            environment: env.name.clone(),
            timestamp: Utc::now(),
            duration_ms: 0,
            files_deployed: 0,
            files: Vec::new(),
            backup_id: None,
            rolled_back: false,
            user: options.user.clone(),
            errors: Vec::new(),
            warnings: Vec::new(),
        };
        info!(deployment_id = %result.deployment_id, environment = %env.name, "deployment started");
        self.emit(
            &env,
            LifecycleEvent::DeploymentStarted {
                deployment_id: result.deployment_id.clone(),
                environment: env.name.clone(),
            },
        );

        // 1. backup
        if options.backup.unwrap_or(env.features.auto_backup) {
            let description = format!("pre-deploy backup for {}", result.deployment_id);
            match backup::create_backup(&self.backups_dir, &env, &description) {
                Ok(record) => {
                    self.db.insert_backup(&record)?;
                    result.backup_id = Some(record.id);
                }
                Err(e) => {
                    result.errors.push(format!("backup failed: {e}"));
                    return Err(self.finish_failed(&env, result, started, e));
                }
            }
        }

        // 2. validation
        let (files, _, _) = match self.plan_files(&env, &options.languages, &options.namespaces) {
            Ok(planned) => planned,
            Err(e) => {
                result.errors.push(e.to_string());
                return Err(self.finish_failed(&env, result, started, e));
            }
        };
        if files.is_empty() {
            result.warnings.push("no files matched the selection".into());
        }
        if options.validate {
            let mut errors = match source_errors(&env) {
                Ok(errors) => errors,
                Err(e) => vec![e.to_string()],
            };
            if files.is_empty() {
                errors.push("nothing to deploy".into());
            }
            if !errors.is_empty() {
                result.errors.extend(errors.iter().cloned());
                let err = DeployError::ValidationFailed {
                    environment: env.name.clone(),
                    errors,
                };
                return Err(self.finish_failed(&env, result, started, err));
            }
        }

        // 3. copy
        for rel in &files {
            match self.deploy_file(&env, rel, &result.deployment_id) {
                Ok(file) => result.files.push(file),
                Err(e) => {
                    warn!(deployment_id = %result.deployment_id, file = %rel, error = %e, "file deployment failed");
                    result.errors.push(format!("{rel}: {e}"));
                }
            }
        }
        result.files_deployed = result.files.len();

        // 4. verify
        let mut failures = result.errors.clone();
        failures.extend(self.verify(&env, &result.files));
        if failures.is_empty() {
            result.success = true;
            result.duration_ms = started.elapsed().as_millis() as u64;
            self.db.insert_deployment(&result)?;
            if env.features.hot_reload {
                info!(environment = %env.name, base_url = %env.base_url, "hot reload requested");
            }
            info!(
                deployment_id = %result.deployment_id,
                environment = %env.name,
                files = result.files_deployed,
                duration_ms = result.duration_ms,
                "deployment completed"
            );
            self.emit(
                &env,
                LifecycleEvent::DeploymentCompleted {
                    deployment_id: result.deployment_id.clone(),
                    environment: env.name.clone(),
                    files: result.files_deployed,
                },
            );
            self.audit(
                AuditEntry::success("deploy", &format!("{} file(s)", result.files_deployed))
                    .with_subject(&result.deployment_id)
                    .with_actor(&options.user),
            );
            return Ok(result);
        }

        // 5. rollback
        result.errors = failures.clone();
        if options
            .rollback_on_failure
            .unwrap_or(env.features.rollback_enabled)
        {
            let summary = self.undo_deployment(&env, &result);
            result.warnings.extend(summary.errors);
            result.rolled_back = true;
        } else {
            warn!(
                deployment_id = %result.deployment_id,
                environment = %env.name,
                "verification failed and rollback is disabled; leaving files in place"
            );
        }
        let err = DeployError::VerificationFailed {
            deployment_id: result.deployment_id.clone(),
            rolled_back: result.rolled_back,
            errors: failures,
        };
        Err(self.finish_failed(&env, result, started, err))
    }

    /// Copy one file into place, keeping a sidecar of whatever it replaces.
    fn deploy_file(
        &self,
        env: &EnvironmentConfig,
        rel: &str,
        deployment_id: &str,
    ) -> Result<DeployedFile, DeployError> {
        let target = env.deployment_path.join(rel);
        let sidecar = backup_path(&target, deployment_id);
        let pre_existed = target.is_file();
        if pre_existed {
            std::fs::copy(&target, &sidecar)?;
        }
        let sha256 = digest_file(&env.source_path.join(rel))?;
        if let Err(e) = backup::copy_relative(&env.source_path, &env.deployment_path, rel) {
            // The copy may have truncated the target already.
            if let Err(undo) = put_back(&target, &sidecar, pre_existed) {
                error!(file = %rel, error = %undo, "could not undo failed copy");
            }
            return Err(e.into());
        }
        Ok(DeployedFile {
            relative_path: rel.to_string(),
            sha256,
            pre_existed,
        })
    }

    fn verify(&self, env: &EnvironmentConfig, files: &[DeployedFile]) -> Vec<String> {
        let mut errors = Vec::new();
        for file in files {
            match digest_file(&env.deployment_path.join(&file.relative_path)) {
                Ok(actual) if actual == file.sha256 => {}
                Ok(actual) => errors.push(format!(
                    "{}: hash mismatch (expected {}, found {actual})",
                    file.relative_path, file.sha256
                )),
                Err(e) => errors.push(format!("{}: {e}", file.relative_path)),
            }
        }
        let verifiers = self
            .verifiers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for verifier in verifiers {
            if let Err(e) = verifier.verify(env, files) {
                errors.push(format!("{}: {e}", verifier.name()));
            }
        }
        errors
    }

    /// Put the deployment path back the way it was before `result`.
    fn undo_deployment(&self, env: &EnvironmentConfig, result: &DeploymentResult) -> RestoreSummary {
        let backup = match result.backup_id.as_deref().map(|id| self.db.get_backup(id)) {
            Some(Ok(Some(record))) => Some(record),
            Some(Ok(None)) | None => None,
            Some(Err(e)) => {
                warn!(error = %e, "could not load pre-deploy backup, using sidecars");
                None
            }
        };
        let summary = match backup {
            Some(record) => backup::restore_backup(env, &record),
            None => restore_sidecars(env, &result.files, &result.deployment_id),
        };
        info!(
            deployment_id = %result.deployment_id,
            restored = summary.files_restored,
            removed = summary.files_removed,
            "deployment rolled back"
        );
        summary
    }

    /// Record a deployment refused before it started.
    fn refuse_deploy(&self, options: &DeployOptions, err: DeployError) -> DeployError {
        warn!(environment = %options.environment, error = %err, "deployment refused");
        self.audit(
            AuditEntry::failure("deploy", &err.to_string())
                .with_subject(&options.environment)
                .with_actor(&options.user),
        );
        err
    }

    fn finish_failed(
        &self,
        env: &EnvironmentConfig,
        mut result: DeploymentResult,
        started: Instant,
        err: DeployError,
    ) -> DeployError {
        result.success = false;
        result.duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.db.insert_deployment(&result) {
            error!(deployment_id = %result.deployment_id, error = %e, "failed to record deployment");
        }
        error!(deployment_id = %result.deployment_id, environment = %env.name, error = %err, "deployment failed");
        self.emit(
            env,
            LifecycleEvent::DeploymentFailed {
                deployment_id: result.deployment_id.clone(),
                environment: env.name.clone(),
                rolled_back: result.rolled_back,
                errors: result.errors.clone(),
            },
        );
        self.audit(
            AuditEntry::failure("deploy", &err.to_string())
                .with_subject(&result.deployment_id)
                .with_actor(&result.user),
        );
        err
    }

    // -- rollback -----------------------------------------------------------

    /// Undo a recorded deployment from its sidecars.
    ///
    /// Requires `confirm` and the environment's `rollback_enabled` flag.
    /// Files the deployment added are removed; per-file failures are
    /// reported in the result.
    pub fn rollback_to_deployment(
        &self,
        environment: &str,
        deployment_id: &str,
        confirm: bool,
        user: &str,
    ) -> Result<RollbackResult, DeployError> {
        let refused = |err: DeployError| self.refuse_rollback(environment, deployment_id, user, err);
        let env = self.get_environment(environment).map_err(refused)?;
        let precondition = |detail: &str| {
            refused(DeployError::RollbackPrecondition {
                environment: env.name.clone(),
                detail: detail.to_string(),
            })
        };
        if !confirm {
            return Err(precondition("rollback must be confirmed"));
        }
        if !env.features.rollback_enabled {
            return Err(precondition("rollback is disabled for this environment"));
        }
        let deployment = match self.db.get_deployment(deployment_id) {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                return Err(refused(DeployError::DeploymentNotFound(deployment_id.to_string())))
            }
            Err(e) => return Err(refused(e.into())),
        };
        if deployment.environment != env.name {
            return Err(precondition(&format!(
                "deployment {deployment_id} belongs to '{}'",
                deployment.environment
            )));
        }

        let Some(_guard) = self.locks.try_acquire(&lock_name(&env.name)) else {
            return Err(refused(DeployError::EnvironmentBusy(env.name.clone())));
        };

        let started = Instant::now();
        let rollback_id = new_id("rollback");
        info!(rollback_id = %rollback_id, environment, deployment_id, "rollback started");
        self.emit(
            &env,
            LifecycleEvent::RollbackStarted {
                rollback_id: rollback_id.clone(),
                environment: env.name.clone(),
                target: deployment_id.to_string(),
            },
        );

        let summary = restore_sidecars(&env, &deployment.files, deployment_id);
        let result = RollbackResult {
            success: summary.errors.is_empty(),
            rollback_id,
            environment: env.name.clone(),
            target_deployment_id: deployment_id.to_string(),
            timestamp: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            files_restored: summary.files_restored,
            files_removed: summary.files_removed,
            errors: summary.errors,
            warnings: if deployment.success {
                Vec::new()
            } else {
                vec!["target deployment did not succeed".into()]
            },
        };
        self.db.insert_rollback(&result)?;

        info!(
            rollback_id = %result.rollback_id,
            success = result.success,
            restored = result.files_restored,
            removed = result.files_removed,
            "rollback finished"
        );
        self.emit(
            &env,
            LifecycleEvent::RollbackCompleted {
                rollback_id: result.rollback_id.clone(),
                environment: env.name.clone(),
                success: result.success,
                files_restored: result.files_restored,
            },
        );
        let details = format!("rolled back {deployment_id}");
        let entry = if result.success {
            AuditEntry::success("rollback", &details)
        } else {
            AuditEntry::failure("rollback", &details)
        };
        self.audit(entry.with_subject(&result.rollback_id).with_actor(user));
        Ok(result)
    }

    /// Append a failed rollback for a request that never touched a file.
    fn refuse_rollback(
        &self,
        environment: &str,
        deployment_id: &str,
        user: &str,
        err: DeployError,
    ) -> DeployError {
        let result = RollbackResult {
            success: false,
            rollback_id: new_id("rollback"),
            environment: environment.to_string(),
            target_deployment_id: deployment_id.to_string(),
            timestamp: Utc::now(),
            duration_ms: 0,
            files_restored: 0,
            files_removed: 0,
            errors: vec![err.to_string()],
            warnings: Vec::new(),
        };
        if let Err(e) = self.db.insert_rollback(&result) {
            error!(rollback_id = %result.rollback_id, error = %e, "failed to record rollback");
        }
        warn!(environment, deployment_id, error = %err, "rollback refused");
        self.audit(
            AuditEntry::failure("rollback", &err.to_string())
                .with_subject(&result.rollback_id)
                .with_actor(user),
        );
        err
    }

    /// Deployments newest first.
    pub fn deployment_history(
        &self,
        environment: Option<&str>,
        limit: u32,
    ) -> Result<Vec<DeploymentResult>, DeployError> {
        Ok(self.db.list_deployments(environment, limit)?)
    }

    pub fn rollback_history(
        &self,
        environment: Option<&str>,
        limit: u32,
    ) -> Result<Vec<RollbackResult>, DeployError> {
        Ok(self.db.list_rollbacks(environment, limit)?)
    }

    // -- backups ------------------------------------------------------------

    /// Snapshot every file currently deployed to an environment.
    pub fn create_backup(
        &self,
        environment: &str,
        description: &str,
    ) -> Result<BackupRecord, DeployError> {
        let env = self.get_environment(environment)?;
        let record = backup::create_backup(&self.backups_dir, &env, description)?;
        self.db.insert_backup(&record)?;
        self.audit(
            AuditEntry::success("backup", &format!("{} file(s)", record.files.len()))
                .with_subject(&record.id),
        );
        Ok(record)
    }

    /// Make an environment's deployed file set equal a backup.
    pub fn restore_backup(
        &self,
        environment: &str,
        backup_id: &str,
    ) -> Result<RestoreSummary, DeployError> {
        let env = self.get_environment(environment)?;
        let record = self
            .db
            .get_backup(backup_id)?
            .ok_or_else(|| DeployError::BackupNotFound(backup_id.to_string()))?;
        if record.environment != env.name {
            return Err(DeployError::BackupNotFound(backup_id.to_string()));
        }
        let Some(_guard) = self.locks.try_acquire(&lock_name(&env.name)) else {
            let err = DeployError::EnvironmentBusy(env.name.clone());
            self.audit(AuditEntry::failure("restore", &err.to_string()).with_subject(backup_id));
            return Err(err);
        };
        let summary = backup::restore_backup(&env, &record);
        info!(backup_id, environment, restored = summary.files_restored, "backup restored");
        let details = format!(
            "{} restored, {} removed",
            summary.files_restored, summary.files_removed
        );
        let entry = if summary.errors.is_empty() {
            AuditEntry::success("restore", &details)
        } else {
            AuditEntry::failure("restore", &details)
        };
        self.audit(entry.with_subject(backup_id));
        Ok(summary)
    }

    pub fn list_backups(&self, environment: Option<&str>) -> Result<Vec<BackupRecord>, DeployError> {
        Ok(self.db.list_backups(environment)?)
    }

    /// Delete backups older than `older_than_days`. Returns how many went.
    pub fn prune_backups(
        &self,
        environment: Option<&str>,
        older_than_days: i64,
    ) -> Result<usize, DeployError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let mut pruned = 0;
        for record in self.db.list_backups(environment)? {
            if record.created_at >= cutoff {
                continue;
            }
            backup::remove_backup_dir(&record.path)?;
            self.db.delete_backup(&record.id)?;
            debug!(backup_id = %record.id, "pruned backup");
            pruned += 1;
        }
        if pruned > 0 {
            info!(pruned, older_than_days, "pruned backups");
        }
        Ok(pruned)
    }
}

fn lock_name(environment: &str) -> String {
    format!("env:{environment}")
}

fn split(rel: &str) -> Option<(&str, &str)> {
    let (locale, file) = rel.split_once('/')?;
    Some((locale, file.strip_suffix(".json")?))
}

/// Source files that do not parse as resource tables.
fn source_errors(env: &EnvironmentConfig) -> Result<Vec<String>, DeployError> {
    let mut errors = Vec::new();
    for rel in backup::resource_files(&env.source_path)? {
        let path = env.source_path.join(&rel);
        match std::fs::read(&path) {
            Ok(bytes) => {
                if let Err(e) = ResourceTree::parse(&bytes, &rel) {
                    errors.push(e.to_string());
                }
            }
            Err(e) => errors.push(format!("{rel}: {e}")),
        }
    }
    Ok(errors)
}

/// Restore overwritten files from their sidecars and remove added ones.
fn restore_sidecars(
    env: &EnvironmentConfig,
    files: &[DeployedFile],
    deployment_id: &str,
) -> RestoreSummary {
    let mut summary = RestoreSummary::default();
    for file in files {
        let target = env.deployment_path.join(&file.relative_path);
        if file.pre_existed {
            let sidecar = backup_path(&target, deployment_id);
            match std::fs::copy(&sidecar, &target) {
                Ok(_) => summary.files_restored += 1,
                Err(e) => summary
                    .errors
                    .push(format!("{}: sidecar {}: {e}", file.relative_path, sidecar.display())),
            }
        } else {
            match remove_if_present(&target) {
                Ok(()) => summary.files_removed += 1,
                Err(e) => summary.errors.push(format!("{}: {e}", file.relative_path)),
            }
        }
    }
    summary
}

/// Restore `target` from its sidecar, or drop it if it did not exist before.
fn put_back(target: &Path, sidecar: &Path, pre_existed: bool) -> std::io::Result<()> {
    if pre_existed {
        std::fs::copy(sidecar, target).map(|_| ())
    } else {
        remove_if_present(target)
    }
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationConfig;
    use crate::models::EnvironmentFeatures;
    use crate::notify::RecordingSubscriber;
    use std::fs;

    struct Fixture {
        dir: tempfile::TempDir,
        manager: SyncManager,
        events: Arc<RecordingSubscriber>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let notifier = Arc::new(Notifier::new(&NotificationConfig::default()));
        let events = Arc::new(RecordingSubscriber::new());
        notifier.subscribe(events.clone());
        let manager = SyncManager::new(
            db,
            notifier,
            &SyncConfig::default(),
            dir.path().join("backups"),
        );
        Fixture {
            dir,
            manager,
            events,
        }
    }

    fn environment(f: &Fixture, name: &str, env_type: EnvironmentType) -> EnvironmentConfig {
        let env = EnvironmentConfig {
            name: name.into(),
            env_type,
            base_url: String::new(),
            source_path: f.dir.path().join("locales"),
            deployment_path: f.dir.path().join("deploy").join(name),
            features: EnvironmentFeatures::default(),
        };
        f.manager.register_environment(&env).unwrap();
        env
    }

    fn put(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    struct AlwaysFails;

    impl DeploymentVerifier for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }
        fn verify(&self, _: &EnvironmentConfig, _: &[DeployedFile]) -> Result<(), String> {
            Err("forced".into())
        }
    }

    #[test]
    fn test_register_is_last_write_wins() {
        let f = fixture();
        let mut env = environment(&f, "staging", EnvironmentType::Staging);
        env.base_url = "https://staging.example.com".into();
        f.manager.register_environment(&env).unwrap();
        assert_eq!(f.manager.list_environments().unwrap().len(), 1);
        assert_eq!(
            f.manager.get_environment("staging").unwrap().base_url,
            "https://staging.example.com"
        );
        assert!(matches!(
            f.manager.get_environment("nope"),
            Err(DeployError::InvalidEnvironment { .. })
        ));
    }

    #[test]
    fn test_dry_run_copies_nothing() {
        let f = fixture();
        let env = environment(&f, "dev", EnvironmentType::Development);
        put(&env.source_path, "en-US/common.json", "{}");
        put(&env.source_path, "fr-FR/common.json", "{}");

        let op = f
            .manager
            .sync_to_environment(
                "dev",
                &SyncOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(op.metadata.files.len(), 2);
        assert_eq!(op.metadata.estimated_duration_ms, Some(200));
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(!env.deployment_path.exists());
        assert!(f.events.names().is_empty());
    }

    #[test]
    fn test_sync_filters_to_existing_files() {
        let f = fixture();
        let env = environment(&f, "dev", EnvironmentType::Development);
        put(&env.source_path, "en-US/common.json", r#"{"a":"1"}"#);

        let op = f
            .manager
            .sync_to_environment(
                "dev",
                &SyncOptions {
                    languages: vec!["en-US".into(), "de-DE".into()],
                    namespaces: vec!["common".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(op.metadata.files, vec!["en-US/common.json".to_string()]);
        assert_eq!(op.metadata.files_copied, 1);
        assert!(env.deployment_path.join("en-US/common.json").exists());
        assert_eq!(f.manager.get_operation(&op.id).unwrap().status, OperationStatus::Completed);
        assert_eq!(f.events.names(), vec!["sync:completed"]);
    }

    #[test]
    fn test_production_only() {
        let f = fixture();
        environment(&f, "staging", EnvironmentType::Staging);
        let err = f
            .manager
            .deploy_to_production(&DeployOptions {
                environment: "staging".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidEnvironment { .. }));

        let audit = f.manager.db.list_audit_log(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "deploy");
        assert!(!audit[0].success);
        assert_eq!(audit[0].subject.as_deref(), Some("staging"));
    }

    #[test]
    fn test_deploy_then_rollback_restores_bytes() {
        let f = fixture();
        let env = environment(&f, "production", EnvironmentType::Production);
        put(&env.deployment_path, "en-US/common.json", r#"{"a":"old"}"#);
        put(&env.source_path, "en-US/common.json", r#"{"a":"new"}"#);
        put(&env.source_path, "fr-FR/common.json", r#"{"a":"nouveau"}"#);

        let result = f
            .manager
            .deploy_to_production(&DeployOptions {
                environment: "production".into(),
                user: "ops".into(),
                validate: true,
                ..Default::default()
            })
            .unwrap();
        assert!(result.success);
        assert_eq!(result.files_deployed, 2);
        assert!(result.backup_id.is_some());

        let rollback = f
            .manager
            .rollback_to_deployment("production", &result.deployment_id, true, "ops")
            .unwrap();
        assert!(rollback.success);
        assert_eq!(rollback.files_restored, 1);
        assert_eq!(rollback.files_removed, 1);
        assert_eq!(
            fs::read_to_string(env.deployment_path.join("en-US/common.json")).unwrap(),
            r#"{"a":"old"}"#
        );
        assert!(!env.deployment_path.join("fr-FR/common.json").exists());
    }

    #[test]
    fn test_rollback_preconditions() {
        let f = fixture();
        let mut env = environment(&f, "production", EnvironmentType::Production);
        assert!(matches!(
            f.manager.rollback_to_deployment("production", "deploy_x", false, "ops"),
            Err(DeployError::RollbackPrecondition { .. })
        ));
        assert!(matches!(
            f.manager.rollback_to_deployment("production", "deploy_x", true, "ops"),
            Err(DeployError::DeploymentNotFound(_))
        ));
        env.features.rollback_enabled = false;
        f.manager.register_environment(&env).unwrap();
        assert!(matches!(
            f.manager.rollback_to_deployment("production", "deploy_x", true, "ops"),
            Err(DeployError::RollbackPrecondition { .. })
        ));

        // Every refusal is on record.
        let history = f.manager.rollback_history(Some("production"), 10).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|r| !r.success && r.target_deployment_id == "deploy_x"));
        assert!(history.iter().all(|r| r.files_restored == 0 && r.errors.len() == 1));
        let audit = f.manager.db.list_audit_log(10).unwrap();
        assert_eq!(
            audit.iter().filter(|e| e.action == "rollback" && !e.success).count(),
            3
        );
        assert!(audit.iter().all(|e| e.actor.as_deref() == Some("ops")));
    }

    #[test]
    fn test_failed_verification_rolls_back_when_enabled() {
        let f = fixture();
        let env = environment(&f, "production", EnvironmentType::Production);
        put(&env.deployment_path, "en-US/common.json", r#"{"a":"old"}"#);
        put(&env.source_path, "en-US/common.json", r#"{"a":"new"}"#);
        f.manager.add_verifier(Arc::new(AlwaysFails));

        let err = f
            .manager
            .deploy_to_environment(&DeployOptions {
                environment: "production".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, DeployError::VerificationFailed { rolled_back: true, .. }));
        assert_eq!(
            fs::read_to_string(env.deployment_path.join("en-US/common.json")).unwrap(),
            r#"{"a":"old"}"#
        );
        let history = f.manager.deployment_history(Some("production"), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert!(history[0].rolled_back);
        assert!(f.events.names().contains(&"deployment:failed"));
    }

    #[test]
    fn test_validation_failure_blocks_copy() {
        let f = fixture();
        let env = environment(&f, "staging", EnvironmentType::Staging);
        put(&env.source_path, "en-US/common.json", "not json");
        let err = f
            .manager
            .deploy_to_environment(&DeployOptions {
                environment: "staging".into(),
                validate: true,
                backup: Some(false),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, DeployError::ValidationFailed { .. }));
        assert!(!env.deployment_path.join("en-US/common.json").exists());
    }

    #[test]
    fn test_busy_environment() {
        let f = fixture();
        environment(&f, "staging", EnvironmentType::Staging);
        let _held = f.manager.locks.try_acquire(&lock_name("staging")).unwrap();
        assert!(matches!(
            f.manager.deploy_to_environment(&DeployOptions {
                environment: "staging".into(),
                ..Default::default()
            }),
            Err(DeployError::EnvironmentBusy(_))
        ));
        let audit = f.manager.db.list_audit_log(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].details.as_deref().unwrap_or("").contains("busy"));
        assert!(f.manager.deployment_history(Some("staging"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_source_leaves_target_untouched() {
        let f = fixture();
        let env = environment(&f, "staging", EnvironmentType::Staging);
        put(&env.deployment_path, "en-US/common.json", r#"{"a":"old"}"#);
        fs::create_dir_all(env.source_path.join("en-US/common.json")).unwrap();

        let err = f
            .manager
            .deploy_file(&env, "en-US/common.json", "deploy_1")
            .unwrap_err();
        assert!(matches!(err, DeployError::Store(_)));
        assert_eq!(
            fs::read_to_string(env.deployment_path.join("en-US/common.json")).unwrap(),
            r#"{"a":"old"}"#
        );
    }

    #[test]
    fn test_put_back_after_partial_copy() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("common.json");
        let sidecar = backup_path(&target, "deploy_1");
        fs::write(&target, r#"{"a":"old"}"#).unwrap();
        fs::copy(&target, &sidecar).unwrap();
        fs::write(&target, r#"{"a":"#).unwrap();
        put_back(&target, &sidecar, true).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), r#"{"a":"old"}"#);

        let added = dir.path().join("auth.json");
        fs::write(&added, "{").unwrap();
        put_back(&added, &backup_path(&added, "deploy_1"), false).unwrap();
        assert!(!added.exists());
        put_back(&added, &backup_path(&added, "deploy_1"), false).unwrap();
    }

    #[test]
    fn test_validate_environment_reports_missing() {
        let f = fixture();
        let env = environment(&f, "staging", EnvironmentType::Staging);
        put(&env.source_path, "en-US/common.json", "{}");
        let report = f.manager.validate_environment("staging").unwrap();
        assert!(report.valid);
        assert_eq!(report.missing_files, vec!["en-US/common.json".to_string()]);
    }

    #[test]
    fn test_prune_backups() {
        let f = fixture();
        let env = environment(&f, "staging", EnvironmentType::Staging);
        put(&env.deployment_path, "en-US/common.json", "{}");
        let record = f.manager.create_backup("staging", "manual").unwrap();
        assert_eq!(f.manager.prune_backups(None, 1).unwrap(), 0);
        assert_eq!(f.manager.prune_backups(None, -1).unwrap(), 1);
        assert!(!record.path.exists());
        assert!(f.manager.list_backups(None).unwrap().is_empty());
    }
}
