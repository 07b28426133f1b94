//! Workflow engine.
//!
//! A [`Task`] carries a dependency graph of [`WorkflowStep`]s. The engine
//! drives one task at a time per caller:
//!
//! 1. Pick the first pending step whose dependencies are completed or skipped.
//! 2. Start it. Validation and deployment steps finish inline; translation,
//!    review and approval steps stay `running` until an external call
//!    ([`WorkflowEngine::submit_translation`], [`WorkflowEngine::record_review`])
//!    re-enters the task.
//! 3. Repeat until a step suspends or no pending step remains.
//!
//! Any step failure marks the step `failed` and the task `cancelled`; there
//! are no automatic retries. The task record is persisted after every
//! transition so a suspended task survives restarts.

pub mod collaborators;
pub mod state;
pub mod steps;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::WorkflowConfig;
use crate::db::Database;
use crate::deploy::{DeployOptions, SyncManager};
use crate::errors::WorkflowError;
use crate::lock::NamedLocks;
use crate::models::{new_id, AuditEntry, ChangeType, EnvironmentType};
use crate::notify::{LifecycleEvent, Notifier};
use crate::resource::{ResourceFile, ResourceTree};
use crate::store::digest;
use crate::version::{diff, VersionManager};

use collaborators::{Actor, AssignmentPolicy, QualityScorer, Role};
use state::{
    Priority, ReviewComment, ReviewDecision, ReviewRecord, SourceRef, StepStatus, StepType, Task,
    TaskProgress, TaskStatus, TaskTarget, TaskType, WorkflowStep,
};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Everything needed to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Priority,
    pub source: SourceRef,
    #[serde(default)]
    pub targets: Vec<TaskTarget>,
    pub created_by: String,
    /// Designated reviewers for the review step.
    #[serde(default)]
    pub reviewers: Vec<String>,
    /// Replaces the standard graph for the task type.
    #[serde(default)]
    pub steps: Option<Vec<WorkflowStep>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Translated values for one task target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationSubmission {
    pub author: String,
    pub locale: String,
    pub namespace: String,
    /// Dotted key to translated value.
    pub entries: BTreeMap<String, String>,
}

/// Filter for [`WorkflowEngine::list_tasks`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine {
    db: Arc<Database>,
    versions: Arc<VersionManager>,
    deployments: Arc<SyncManager>,
    notifier: Arc<Notifier>,
    scorer: Arc<dyn QualityScorer>,
    assigner: Arc<dyn AssignmentPolicy>,
    config: WorkflowConfig,
    locales_dir: PathBuf,
    locks: NamedLocks,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        versions: Arc<VersionManager>,
        deployments: Arc<SyncManager>,
        notifier: Arc<Notifier>,
        scorer: Arc<dyn QualityScorer>,
        assigner: Arc<dyn AssignmentPolicy>,
        config: &WorkflowConfig,
        locales_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            versions,
            deployments,
            notifier,
            scorer,
            assigner,
            config: config.clone(),
            locales_dir: locales_dir.into(),
            locks: NamedLocks::new(),
        }
    }

    fn load(&self, task_id: &str) -> Result<Task, WorkflowError> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| WorkflowError::TaskNotFound(task_id.to_string()))
    }

    fn save(&self, task: &mut Task) -> Result<(), WorkflowError> {
        task.updated_at = Utc::now();
        self.db.upsert_task(task)?;
        Ok(())
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.db.insert_audit_entry(&entry) {
            warn!(action = %entry.action, error = %e, "failed to write audit entry");
        }
    }

    /// Run `f` while holding the task's worker lock.
    fn with_task<T>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> Result<T, WorkflowError>,
    ) -> Result<T, WorkflowError> {
        let _guard = self
            .locks
            .try_acquire(&format!("task:{task_id}"))
            .ok_or_else(|| WorkflowError::TaskBusy(task_id.to_string()))?;
        let mut task = self.load(task_id)?;
        f(&mut task)
    }

    fn require_status(task: &Task, allowed: &[TaskStatus]) -> Result<(), WorkflowError> {
        if allowed.contains(&task.status) {
            return Ok(());
        }
        Err(WorkflowError::TaskState {
            task_id: task.id.clone(),
            status: task.status.to_string(),
            expected: allowed
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" or "),
        })
    }

    // -- task lifecycle -----------------------------------------------------

    /// Create a task in `draft` with the standard (or supplied) step graph.
    pub fn create_task(&self, request: NewTask) -> Result<Task, WorkflowError> {
        let steps = match request.steps {
            Some(steps) => steps,
            None => steps::build_steps(request.task_type, &self.config, &request.reviewers),
        };
        steps::check_graph(&steps)?;

        let now = Utc::now();
        let mut task = Task {
            id: new_id("task"),
            title: request.title,
            task_type: request.task_type,
            priority: request.priority,
            source: request.source,
            targets: request.targets,
            status: TaskStatus::Draft,
            created_at: now,
            created_by: request.created_by,
            updated_at: now,
            steps,
            metadata: request.metadata,
        };
        self.save(&mut task)?;
        info!(task_id = %task.id, task_type = %task.task_type, steps = task.steps.len(), "created task");
        self.audit(
            AuditEntry::success("task_created", &task.title)
                .with_subject(&task.id)
                .with_actor(&task.created_by),
        );
        Ok(task)
    }

    /// Move a draft task to `active` and run it until it suspends or ends.
    pub fn start_task(&self, task_id: &str) -> Result<Task, WorkflowError> {
        self.with_task(task_id, |task| {
            Self::require_status(task, &[TaskStatus::Draft])?;
            task.transition(TaskStatus::Active)?;
            self.save(task)?;
            info!(task_id = %task.id, "workflow started");
            self.notifier.emit(LifecycleEvent::WorkflowStarted {
                task_id: task.id.clone(),
                title: task.title.clone(),
            });
            self.drive(task)?;
            Ok(task.clone())
        })
    }

    /// Re-enter a task and run whatever is ready.
    pub fn advance_task(&self, task_id: &str) -> Result<Task, WorkflowError> {
        self.with_task(task_id, |task| {
            Self::require_status(task, &[TaskStatus::Active, TaskStatus::InReview])?;
            self.drive(task)?;
            Ok(task.clone())
        })
    }

    /// Start ready steps until one suspends, the graph finishes or a step fails.
    fn drive(&self, task: &mut Task) -> Result<(), WorkflowError> {
        loop {
            if task.status.is_terminal() {
                return Ok(());
            }
            if let Some(step_id) = task.next_ready_step().map(|s| s.id.clone()) {
                if self.start_step(task, &step_id)? {
                    return Ok(());
                }
                continue;
            }
            if let Some(running) = task.running_step() {
                debug!(task_id = %task.id, step_id = %running.id, "task waiting on step");
                return Ok(());
            }
            if let Some(stuck) = task.steps.iter().find(|s| s.status == StepStatus::Pending) {
                let err = WorkflowError::Stalled {
                    task_id: task.id.clone(),
                    detail: format!(
                        "step '{}' waits on {:?}",
                        stuck.id,
                        task.unmet_dependencies(&stuck.id)
                    ),
                };
                return Err(self.cancel(task, None, err));
            }
            return self.finish(task);
        }
    }

    /// Start one step. Returns `true` when the step suspended.
    fn start_step(&self, task: &mut Task, step_id: &str) -> Result<bool, WorkflowError> {
        let waiting_on = task.unmet_dependencies(step_id);
        if !waiting_on.is_empty() {
            return Err(WorkflowError::DependencyNotMet {
                step_id: step_id.to_string(),
                waiting_on,
            });
        }
        let step_type = {
            let step = step_mut(task, step_id)?;
            step.transition(StepStatus::Running)?;
            step.step_type
        };
        if step_type.is_review_gate() && task.status == TaskStatus::Active {
            task.transition(TaskStatus::InReview)?;
        }
        self.save(task)?;
        info!(task_id = %task.id, step_id, step_type = %step_type, "step started");
        self.notifier.emit(LifecycleEvent::StepStarted {
            task_id: task.id.clone(),
            step_id: step_id.to_string(),
            step_type: step_type.to_string(),
        });

        let outcome = match step_type {
            StepType::Validation => self.run_validation(task).map(Some),
            StepType::Translation => self.begin_translation(task, step_id),
            StepType::Review | StepType::Approval => Ok(None),
            StepType::Deployment => self.run_deployment(task, step_id).map(Some),
        };
        match outcome {
            Ok(Some(result)) => {
                self.complete_step(task, step_id, result)?;
                Ok(false)
            }
            Ok(None) => Ok(true),
            Err(e) => Err(self.cancel(task, Some(step_id), e)),
        }
    }

    fn complete_step(
        &self,
        task: &mut Task,
        step_id: &str,
        result: serde_json::Value,
    ) -> Result<(), WorkflowError> {
        let step_type = {
            let step = step_mut(task, step_id)?;
            step.result = Some(result);
            step.transition(StepStatus::Completed)?;
            step.step_type
        };
        if step_type.is_review_gate() && task.status == TaskStatus::InReview {
            task.transition(TaskStatus::Active)?;
        }
        self.save(task)?;
        info!(task_id = %task.id, step_id, "step completed");
        self.notifier.emit(LifecycleEvent::StepCompleted {
            task_id: task.id.clone(),
            step_id: step_id.to_string(),
            step_type: step_type.to_string(),
        });
        Ok(())
    }

    /// Fail `step_id` (if given) and cancel the task. Returns `err` for the caller.
    fn cancel(&self, task: &mut Task, step_id: Option<&str>, err: WorkflowError) -> WorkflowError {
        let message = err.to_string();
        if let Some(step_id) = step_id {
            if let Some(step) = task.step_mut(step_id) {
                step.error = Some(message.clone());
                if let Err(e) = step.transition(StepStatus::Failed) {
                    warn!(task_id = %task.id, step_id, error = %e, "could not mark step failed");
                }
            }
        }
        if let Err(e) = task.transition(TaskStatus::Cancelled) {
            warn!(task_id = %task.id, error = %e, "could not cancel task");
        }
        if let Err(e) = self.save(task) {
            error!(task_id = %task.id, error = %e, "failed to persist cancelled task");
        }

        error!(task_id = %task.id, step_id = ?step_id, error = %message, "workflow failed");
        if let Some(step_id) = step_id {
            let step_type = task
                .step(step_id)
                .map(|s| s.step_type.to_string())
                .unwrap_or_default();
            self.notifier.emit(LifecycleEvent::StepFailed {
                task_id: task.id.clone(),
                step_id: step_id.to_string(),
                step_type,
                error: message.clone(),
            });
        }
        self.notifier.emit(LifecycleEvent::WorkflowFailed {
            task_id: task.id.clone(),
            step_id: step_id.unwrap_or_default().to_string(),
            error: message.clone(),
        });
        self.audit(
            AuditEntry::failure("task_cancelled", &message)
                .with_subject(&task.id)
                .with_actor(&task.created_by),
        );
        err
    }

    fn finish(&self, task: &mut Task) -> Result<(), WorkflowError> {
        let deployed = task
            .steps
            .iter()
            .any(|s| s.step_type == StepType::Deployment && s.status == StepStatus::Completed);
        task.transition(if deployed {
            TaskStatus::Deployed
        } else {
            TaskStatus::Approved
        })?;
        self.save(task)?;
        info!(task_id = %task.id, status = %task.status, "workflow completed");
        self.notifier.emit(LifecycleEvent::WorkflowCompleted {
            task_id: task.id.clone(),
            status: task.status.to_string(),
        });
        self.audit(
            AuditEntry::success("task_completed", &task.status.to_string())
                .with_subject(&task.id)
                .with_actor(&task.created_by),
        );
        Ok(())
    }

    // -- step behaviour -----------------------------------------------------

    /// Keys of the source that changed relative to its latest version.
    fn changed_source_keys(
        &self,
        task: &Task,
    ) -> Result<(BTreeMap<String, String>, Vec<String>), WorkflowError> {
        let source = ResourceFile::from_path(&task.source.file)?;
        if !source.path.exists() {
            return Err(crate::errors::VersionError::SourceMissing(task.source.file.clone()).into());
        }
        let bytes = source.read_bytes()?;
        let tree = ResourceTree::parse(&bytes, &task.source.file)?;
        let current = tree.leaves();

        let head = self
            .versions
            .get_version_history(&task.source.locale, &task.source.namespace, None, 1)?
            .into_iter()
            .next();
        let changes = match head {
            Some(head) if head.hash == digest(&bytes) => head.changes,
            Some(head) => {
                let snapshot = self.versions.snapshot(&head)?;
                let parent = ResourceTree::parse(&snapshot, &head.id)?.leaves();
                diff::compute_changes(Some(&parent), &current)
            }
            None => diff::compute_changes(None, &current),
        };
        let keys = changes
            .into_iter()
            .filter(|c| c.change_type != ChangeType::Delete)
            .map(|c| c.key)
            .collect();
        Ok((tree.flatten(), keys))
    }

    /// Score every changed source key on its own; empty, oversized or
    /// malformed source strings fail the step.
    fn run_validation(&self, task: &Task) -> Result<serde_json::Value, WorkflowError> {
        let (source, keys) = self.changed_source_keys(task)?;
        let mut scores = serde_json::Map::new();
        for key in &keys {
            let Some(text) = source.get(key) else {
                continue;
            };
            let assessment = steps::check_quality(
                self.scorer.as_ref(),
                &self.config.quality,
                key,
                text,
                text,
                &task.source.locale,
                &task.source.locale,
            )?;
            scores.insert(key.clone(), json!(assessment.overall_score));
        }
        debug!(task_id = %task.id, keys = keys.len(), "validation passed");
        Ok(json!({ "checked_keys": keys.len(), "scores": scores }))
    }

    /// Assign translators. Returns a result when the step completes inline.
    fn begin_translation(
        &self,
        task: &mut Task,
        step_id: &str,
    ) -> Result<Option<serde_json::Value>, WorkflowError> {
        if task.targets.is_empty() {
            let version = self.versions.create_version(
                &task.source.file,
                &task.created_by,
                &format!("Translation work for {}", task.title),
                None,
            )?;
            return Ok(Some(json!({ "versions": [version.id] })));
        }

        let auto_assign = task.step(step_id).is_some_and(|s| s.config.auto_assign);
        let actors = self.db.list_actors()?;
        for i in 0..task.targets.len() {
            if task.targets[i].assignee.is_some() {
                continue;
            }
            let locale = task.targets[i].locale.clone();
            let chosen = if auto_assign {
                self.assigner
                    .choose(&actors, Role::Translator, &locale)
                    .map(|a| a.id.clone())
            } else {
                None
            };
            let Some(actor_id) = chosen else {
                return Err(WorkflowError::NoAssignee {
                    step_id: step_id.to_string(),
                    role: format!("{} translator for {locale}", Role::Translator),
                });
            };
            self.db.adjust_workload(&actor_id, 1)?;
            info!(task_id = %task.id, locale = %locale, assignee = %actor_id, "assigned translator");
            task.targets[i].assignee = Some(actor_id);
        }
        let first = task.targets.first().and_then(|t| t.assignee.clone());
        if let Some(step) = task.step_mut(step_id) {
            step.assignee = first;
        }
        self.save(task)?;
        Ok(None)
    }

    fn run_deployment(&self, task: &Task, step_id: &str) -> Result<serde_json::Value, WorkflowError> {
        let environment = task
            .step(step_id)
            .and_then(|s| s.config.environment.clone())
            .ok_or_else(|| WorkflowError::InvalidGraph(format!(
                "deployment step '{step_id}' has no environment"
            )))?;
        let mut languages = vec![task.source.locale.clone()];
        languages.extend(task.targets.iter().map(|t| t.locale.clone()));
        languages.sort();
        languages.dedup();
        let options = DeployOptions {
            environment: environment.clone(),
            languages,
            namespaces: vec![task.source.namespace.clone()],
            user: task.created_by.clone(),
            ..Default::default()
        };
        let env = self.deployments.get_environment(&environment)?;
        let result = if env.env_type == EnvironmentType::Production {
            self.deployments.deploy_to_production(&options)?
        } else {
            self.deployments.deploy_to_environment(&options)?
        };
        Ok(json!({
            "deployment_id": result.deployment_id,
            "environment": result.environment,
            "files": result.files_deployed,
        }))
    }

    // -- external events ----------------------------------------------------

    /// Apply translated values for one target and version the file.
    ///
    /// The translation step completes once every target has a version.
    /// A value below the quality thresholds fails the step.
    pub fn submit_translation(
        &self,
        task_id: &str,
        submission: &TranslationSubmission,
    ) -> Result<Task, WorkflowError> {
        self.with_task(task_id, |task| {
            Self::require_status(task, &[TaskStatus::Active])?;
            let step_id = task
                .steps
                .iter()
                .find(|s| s.step_type == StepType::Translation && s.status == StepStatus::Running)
                .map(|s| s.id.clone())
                .ok_or_else(|| WorkflowError::InvalidSubmission {
                    task_id: task.id.clone(),
                    detail: "no translation step is running".into(),
                })?;

            let invalid = |detail: String| WorkflowError::InvalidSubmission {
                task_id: task_id.to_string(),
                detail,
            };
            let index = task
                .targets
                .iter()
                .position(|t| t.locale == submission.locale && t.namespace == submission.namespace)
                .ok_or_else(|| {
                    invalid(format!(
                        "no target {}/{}",
                        submission.locale, submission.namespace
                    ))
                })?;
            if task.targets[index].version_id.is_some() {
                return Err(invalid(format!(
                    "{}/{} was already submitted",
                    submission.locale, submission.namespace
                )));
            }
            if let Some(assignee) = &task.targets[index].assignee {
                if assignee != &submission.author {
                    return Err(WorkflowError::NotPermitted {
                        actor: submission.author.clone(),
                        step_id,
                        detail: format!("target is assigned to {assignee}"),
                    });
                }
            }
            if submission.entries.is_empty() {
                return Err(invalid("no entries".into()));
            }

            let source = ResourceFile::from_path(&task.source.file)?.read_tree()?.flatten();
            if let Some(key) = submission.entries.keys().find(|k| !source.contains_key(*k)) {
                return Err(invalid(format!("'{key}' is not a source key")));
            }

            match self.apply_submission(task, &source, submission) {
                Ok(version_id) => {
                    task.targets[index].version_id = Some(version_id);
                }
                Err(e) => return Err(self.cancel(task, Some(&step_id), e)),
            }
            if let Err(e) = self.db.adjust_workload(&submission.author, -1) {
                debug!(actor = %submission.author, error = %e, "workload not adjusted");
            }

            if task.targets.iter().all(|t| t.version_id.is_some()) {
                let versions: Vec<&str> = task
                    .targets
                    .iter()
                    .filter_map(|t| t.version_id.as_deref())
                    .collect();
                let result = json!({ "versions": versions });
                self.complete_step(task, &step_id, result)?;
                self.drive(task)?;
            } else {
                self.save(task)?;
            }
            Ok(task.clone())
        })
    }

    fn apply_submission(
        &self,
        task: &Task,
        source: &BTreeMap<String, String>,
        submission: &TranslationSubmission,
    ) -> Result<String, WorkflowError> {
        for (key, value) in &submission.entries {
            let source_text = source.get(key).map(String::as_str).unwrap_or_default();
            steps::check_quality(
                self.scorer.as_ref(),
                &self.config.quality,
                key,
                source_text,
                value,
                &task.source.locale,
                &submission.locale,
            )?;
        }

        let target = ResourceFile::under(&self.locales_dir, &submission.locale, &submission.namespace);
        let mut tree = if target.path.exists() {
            target.read_tree()?
        } else {
            ResourceTree::new()
        };
        for (key, value) in &submission.entries {
            tree.set(key, value.as_str());
        }
        target.write_tree(&tree)?;
        let version = self.versions.create_version(
            &target.path,
            &submission.author,
            &format!("Translation work for {}", task.title),
            None,
        )?;
        Ok(version.id)
    }

    /// Record a reviewer's decision on a running review or approval step.
    ///
    /// Refusals (unknown actor, wrong role, not a designated reviewer) leave
    /// the task untouched. A rejection fails the step and cancels the task.
    pub fn record_review(
        &self,
        task_id: &str,
        step_id: &str,
        actor_id: &str,
        decision: ReviewDecision,
        comment: Option<&str>,
    ) -> Result<Task, WorkflowError> {
        self.with_task(task_id, |task| {
            Self::require_status(task, &[TaskStatus::InReview])?;
            let step = task.step(step_id).ok_or_else(|| WorkflowError::StepNotFound {
                task_id: task_id.to_string(),
                step_id: step_id.to_string(),
            })?;
            if step.status != StepStatus::Running || !step.step_type.is_review_gate() {
                return Err(WorkflowError::NotPermitted {
                    actor: actor_id.to_string(),
                    step_id: step_id.to_string(),
                    detail: format!("{} step is {}", step.step_type, step.status),
                });
            }
            let actor = self
                .db
                .get_actor(actor_id)?
                .ok_or_else(|| WorkflowError::ActorNotFound(actor_id.to_string()))?;
            let allowed = match step.step_type {
                StepType::Approval => actor.role.may_approve(),
                _ => actor.role.may_review(),
            };
            if !allowed {
                return Err(WorkflowError::NotPermitted {
                    actor: actor_id.to_string(),
                    step_id: step_id.to_string(),
                    detail: format!("role {} cannot sign off {}", actor.role, step.step_type),
                });
            }
            if !step.config.reviewers.is_empty() && !step.config.reviewers.contains(&actor.id) {
                return Err(WorkflowError::NotPermitted {
                    actor: actor_id.to_string(),
                    step_id: step_id.to_string(),
                    detail: "not a designated reviewer".into(),
                });
            }
            let required = step.config.required_approvals.max(1) as usize;

            let record = ReviewRecord {
                actor: actor.id.clone(),
                decision,
                comment: comment.map(str::to_string),
                timestamp: Utc::now(),
            };
            let approvals = {
                let step = step_mut(task, step_id)?;
                step.reviews.push(record);
                step.approval_count()
            };
            info!(task_id, step_id, actor = actor_id, decision = %decision, approvals, required, "review recorded");
            self.audit(
                AuditEntry::success("review_recorded", &decision.to_string())
                    .with_subject(task_id)
                    .with_actor(actor_id),
            );

            if decision == ReviewDecision::Reject {
                let err = WorkflowError::Rejected {
                    step_id: step_id.to_string(),
                    actor: actor_id.to_string(),
                    reason: comment.unwrap_or("no reason given").to_string(),
                };
                return Err(self.cancel(task, Some(step_id), err));
            }

            if approvals >= required {
                let approvers: Vec<String> = task
                    .step(step_id)
                    .map(|s| {
                        let mut ids: Vec<String> = s
                            .reviews
                            .iter()
                            .filter(|r| r.decision == ReviewDecision::Approve)
                            .map(|r| r.actor.clone())
                            .collect();
                        ids.sort();
                        ids.dedup();
                        ids
                    })
                    .unwrap_or_default();
                let result = json!({ "approvals": approvers, "required": required });
                self.complete_step(task, step_id, result)?;
                self.drive(task)?;
            } else {
                self.save(task)?;
            }
            Ok(task.clone())
        })
    }

    // -- queries ------------------------------------------------------------

    pub fn get_task(&self, task_id: &str) -> Result<Task, WorkflowError> {
        self.load(task_id)
    }

    /// Tasks matching `filter`, newest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, WorkflowError> {
        Ok(self
            .db
            .list_tasks()?
            .into_iter()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.task_type.map_or(true, |s| t.task_type == s))
            .filter(|t| filter.priority.map_or(true, |p| t.priority == p))
            .filter(|t| {
                filter.assignee.as_deref().map_or(true, |a| {
                    t.steps.iter().any(|s| s.assignee.as_deref() == Some(a))
                        || t.targets.iter().any(|x| x.assignee.as_deref() == Some(a))
                })
            })
            .collect())
    }

    pub fn task_progress(&self, task_id: &str) -> Result<TaskProgress, WorkflowError> {
        let task = self.load(task_id)?;
        let count = |status: StepStatus| task.steps.iter().filter(|s| s.status == status).count();
        let completed = count(StepStatus::Completed);
        let skipped = count(StepStatus::Skipped);
        let total = task.steps.len();
        Ok(TaskProgress {
            task_id: task.id.clone(),
            status: task.status,
            percent: if total == 0 {
                0.0
            } else {
                100.0 * (completed + skipped) as f64 / total as f64
            },
            current_step: task.running_step().map(|s| s.id.clone()),
            completed,
            skipped,
            pending: count(StepStatus::Pending),
            failed: count(StepStatus::Failed),
            total,
        })
    }

    pub fn add_review_comment(
        &self,
        task_id: &str,
        step_id: Option<&str>,
        author: &str,
        body: &str,
    ) -> Result<ReviewComment, WorkflowError> {
        let task = self.load(task_id)?;
        if let Some(step_id) = step_id {
            if task.step(step_id).is_none() {
                return Err(WorkflowError::StepNotFound {
                    task_id: task_id.to_string(),
                    step_id: step_id.to_string(),
                });
            }
        }
        let comment = ReviewComment {
            id: new_id("comment"),
            task_id: task.id,
            step_id: step_id.map(str::to_string),
            author: author.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        self.db.insert_review_comment(&comment)?;
        Ok(comment)
    }

    pub fn list_review_comments(&self, task_id: &str) -> Result<Vec<ReviewComment>, WorkflowError> {
        Ok(self.db.list_review_comments(task_id)?)
    }

    // -- actors -------------------------------------------------------------

    pub fn register_actor(&self, actor: &Actor) -> Result<(), WorkflowError> {
        self.db.upsert_actor(actor)?;
        info!(actor = %actor.id, role = %actor.role, "registered actor");
        Ok(())
    }

    pub fn list_actors(&self) -> Result<Vec<Actor>, WorkflowError> {
        Ok(self.db.list_actors()?)
    }

    pub fn actor_workload(&self, actor_id: &str) -> Result<u32, WorkflowError> {
        self.db
            .get_actor(actor_id)?
            .map(|a| a.workload)
            .ok_or_else(|| WorkflowError::ActorNotFound(actor_id.to_string()))
    }

    /// Locales root translation submissions are written under.
    pub fn locales_dir(&self) -> &Path {
        &self.locales_dir
    }
}

fn step_mut<'a>(task: &'a mut Task, step_id: &str) -> Result<&'a mut WorkflowStep, WorkflowError> {
    let task_id = task.id.clone();
    task.step_mut(step_id)
        .ok_or_else(|| WorkflowError::StepNotFound {
            task_id,
            step_id: step_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotificationConfig, SyncConfig, VersioningConfig};
    use crate::notify::RecordingSubscriber;
    use crate::store::ContentStore;
    use collaborators::{BasicScorer, LeastLoadedPolicy};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        engine: WorkflowEngine,
        events: Arc<RecordingSubscriber>,
    }

    fn fixture(config: WorkflowConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("locales");
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let notifier = Arc::new(Notifier::new(&NotificationConfig::default()));
        let events = Arc::new(RecordingSubscriber::new());
        notifier.subscribe(events.clone());
        let versions = Arc::new(
            VersionManager::new(
                db.clone(),
                ContentStore::open(dir.path().join("objects")).unwrap(),
                notifier.clone(),
                &VersioningConfig::default(),
            )
            .unwrap(),
        );
        let deployments = Arc::new(SyncManager::new(
            db.clone(),
            notifier.clone(),
            &SyncConfig::default(),
            dir.path().join("backups"),
        ));
        let engine = WorkflowEngine::new(
            db,
            versions,
            deployments,
            notifier,
            Arc::new(BasicScorer),
            Arc::new(LeastLoadedPolicy),
            &config,
            &root,
        );
        Fixture {
            _dir: dir,
            root,
            engine,
            events,
        }
    }

    fn actor(id: &str, role: Role, languages: &[&str]) -> Actor {
        Actor {
            id: id.into(),
            name: id.into(),
            email: format!("{id}@example.com"),
            role,
            languages: languages.iter().map(|l| l.to_string()).collect(),
            available: true,
            workload: 0,
        }
    }

    fn source(f: &Fixture, body: &str) -> SourceRef {
        let path = f.root.join("en-US").join("common.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        SourceRef {
            locale: "en-US".into(),
            namespace: "common".into(),
            file: path.display().to_string(),
        }
    }

    fn new_task(task_type: TaskType, source: SourceRef, targets: &[&str]) -> NewTask {
        NewTask {
            title: "Checkout copy".into(),
            task_type,
            priority: Priority::High,
            source,
            targets: targets
                .iter()
                .map(|l| TaskTarget {
                    locale: l.to_string(),
                    namespace: "common".into(),
                    assignee: None,
                    due_date: None,
                    version_id: None,
                })
                .collect(),
            created_by: "pm".into(),
            reviewers: Vec::new(),
            steps: None,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_full_path_to_approved() {
        let f = fixture(WorkflowConfig {
            required_reviews: 2,
            ..Default::default()
        });
        for a in [
            actor("tina", Role::Translator, &["fr"]),
            actor("rob", Role::Reviewer, &[]),
            actor("rae", Role::Reviewer, &[]),
            actor("ann", Role::Approver, &[]),
        ] {
            f.engine.register_actor(&a).unwrap();
        }
        let src = source(&f, r#"{"greeting":"Hello {name}"}"#);
        let task = f.engine.create_task(new_task(TaskType::New, src, &["fr-FR"])).unwrap();
        assert_eq!(task.status, TaskStatus::Draft);

        let task = f.engine.start_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.step("validation").unwrap().status, StepStatus::Completed);
        assert_eq!(task.step("translation").unwrap().status, StepStatus::Running);
        assert_eq!(task.targets[0].assignee.as_deref(), Some("tina"));
        assert_eq!(f.engine.actor_workload("tina").unwrap(), 1);

        let mut entries = BTreeMap::new();
        entries.insert("greeting".to_string(), "Bonjour {name}".to_string());
        let task = f
            .engine
            .submit_translation(
                &task.id,
                &TranslationSubmission {
                    author: "tina".into(),
                    locale: "fr-FR".into(),
                    namespace: "common".into(),
                    entries,
                },
            )
            .unwrap();
        assert_eq!(task.status, TaskStatus::InReview);
        assert!(f.root.join("fr-FR").join("common.json").exists());
        assert_eq!(f.engine.actor_workload("tina").unwrap(), 0);

        // One approval is not enough; a repeat from the same reviewer counts once.
        let task = f
            .engine
            .record_review(&task.id, "review", "rob", ReviewDecision::Approve, None)
            .unwrap();
        let task = f
            .engine
            .record_review(&task.id, "review", "rob", ReviewDecision::Approve, None)
            .unwrap();
        assert_eq!(task.step("review").unwrap().status, StepStatus::Running);

        // A reviewer cannot sign off the approval step.
        let task = f
            .engine
            .record_review(&task.id, "review", "rae", ReviewDecision::Approve, Some("lgtm"))
            .unwrap();
        assert_eq!(task.step("approval").unwrap().status, StepStatus::Running);
        assert!(matches!(
            f.engine.record_review(&task.id, "approval", "rae", ReviewDecision::Approve, None),
            Err(WorkflowError::NotPermitted { .. })
        ));

        let task = f
            .engine
            .record_review(&task.id, "approval", "ann", ReviewDecision::Approve, None)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
        assert_eq!(task.step("deployment").unwrap().status, StepStatus::Skipped);
        assert_eq!(f.engine.task_progress(&task.id).unwrap().percent, 100.0);
        assert_eq!(f.events.names().last(), Some(&"workflow:completed"));
    }

    #[test]
    fn test_validation_failure_cancels_task() {
        let f = fixture(WorkflowConfig::default());
        let src = source(&f, r#"{"greeting":"Hello","empty":""}"#);
        let task = f.engine.create_task(new_task(TaskType::Update, src, &["fr-FR"])).unwrap();

        let err = f.engine.start_task(&task.id).unwrap_err();
        assert!(matches!(err, WorkflowError::QualityThreshold { ref key, .. } if key == "empty"));

        let task = f.engine.get_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.step("validation").unwrap().status, StepStatus::Failed);
        assert!(task.steps[1..4].iter().all(|s| s.status == StepStatus::Pending));
        let names = f.events.names();
        assert!(names.contains(&"step:failed"));
        assert_eq!(names.last(), Some(&"workflow:failed"));

        assert!(matches!(
            f.engine.advance_task(&task.id),
            Err(WorkflowError::TaskState { .. })
        ));
    }

    #[test]
    fn test_no_translator_fails_step() {
        let f = fixture(WorkflowConfig::default());
        let src = source(&f, r#"{"greeting":"Hello"}"#);
        let task = f.engine.create_task(new_task(TaskType::Urgent, src, &["ja-JP"])).unwrap();
        let err = f.engine.start_task(&task.id).unwrap_err();
        assert!(matches!(err, WorkflowError::NoAssignee { .. }));
        assert_eq!(f.engine.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_rejection_cancels_and_refusal_does_not() {
        let f = fixture(WorkflowConfig::default());
        f.engine.register_actor(&actor("rob", Role::Reviewer, &[])).unwrap();
        f.engine.register_actor(&actor("tim", Role::Translator, &[])).unwrap();
        let src = source(&f, r#"{"greeting":"Hello"}"#);
        let mut request = new_task(TaskType::Review, src, &[]);
        request.reviewers = vec!["rob".into()];
        let task = f.engine.create_task(request).unwrap();
        let task = f.engine.start_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::InReview);

        assert!(matches!(
            f.engine.record_review(&task.id, "review", "tim", ReviewDecision::Approve, None),
            Err(WorkflowError::NotPermitted { .. })
        ));
        assert!(matches!(
            f.engine.record_review(&task.id, "review", "nobody", ReviewDecision::Approve, None),
            Err(WorkflowError::ActorNotFound(_))
        ));
        assert_eq!(f.engine.get_task(&task.id).unwrap().status, TaskStatus::InReview);

        let err = f
            .engine
            .record_review(&task.id, "review", "rob", ReviewDecision::Reject, Some("tone"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Rejected { .. }));
        let task = f.engine.get_task(&task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.step("approval").unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn test_list_filters_and_comments() {
        let f = fixture(WorkflowConfig::default());
        let src = source(&f, r#"{"greeting":"Hello"}"#);
        let a = f.engine.create_task(new_task(TaskType::New, src.clone(), &[])).unwrap();
        let mut urgent = new_task(TaskType::Urgent, src, &[]);
        urgent.priority = Priority::Critical;
        f.engine.create_task(urgent).unwrap();

        assert_eq!(f.engine.list_tasks(&TaskFilter::default()).unwrap().len(), 2);
        let filtered = f
            .engine
            .list_tasks(&TaskFilter {
                priority: Some(Priority::Critical),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].task_type, TaskType::Urgent);

        f.engine.add_review_comment(&a.id, Some("review"), "rob", "watch the tone").unwrap();
        assert!(f.engine.add_review_comment(&a.id, Some("nope"), "rob", "x").is_err());
        assert_eq!(f.engine.list_review_comments(&a.id).unwrap().len(), 1);
    }

    #[test]
    fn test_task_without_targets_versions_source() {
        let f = fixture(WorkflowConfig {
            required_reviews: 1,
            ..Default::default()
        });
        f.engine.register_actor(&actor("rob", Role::Reviewer, &[])).unwrap();
        let src = source(&f, r#"{"greeting":"Hello"}"#);
        let task = f.engine.create_task(new_task(TaskType::New, src, &[])).unwrap();
        let task = f.engine.start_task(&task.id).unwrap();
        assert_eq!(task.step("translation").unwrap().status, StepStatus::Completed);
        assert_eq!(task.status, TaskStatus::InReview);
        assert!(f.events.names().contains(&"version:created"));
    }

    #[test]
    fn test_custom_graph_cannot_wait_on_skipped_step() {
        let f = fixture(WorkflowConfig::default());
        let src = source(&f, r#"{"greeting":"Hello"}"#);
        let mut s0 = WorkflowStep::new("s0", "pre-check", StepType::Validation, &[]);
        s0.status = StepStatus::Skipped;
        let s1 = WorkflowStep::new("s1", "check", StepType::Validation, &["s0"]);
        let mut request = new_task(TaskType::New, src, &[]);
        request.steps = Some(vec![s0, s1]);

        let err = f.engine.create_task(request).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidGraph(ref d) if d.contains("s0")));
        assert!(f.engine.list_tasks(&TaskFilter::default()).unwrap().is_empty());
        assert!(!f.events.names().contains(&"step:started"));
    }
}
