//! End-to-end tests for the string-table lifecycle.
//!
//! These tests wire the real services together the way the CLI does:
//! - A real SQLite database (in memory)
//! - A content store and locales tree in a temp directory
//! - A `Notifier` with a recording subscriber
//!
//! No network I/O: environments are plain directories.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;

use l10nflow_core::config::{NotificationConfig, SyncConfig, VersioningConfig, WorkflowConfig};
use l10nflow_core::db::Database;
use l10nflow_core::deploy::{DeployOptions, DeploymentVerifier, SyncManager};
use l10nflow_core::errors::{DeployError, WorkflowError};
use l10nflow_core::models::{
    ChangeType, DeployedFile, EnvironmentConfig, EnvironmentFeatures, EnvironmentType, Severity,
};
use l10nflow_core::notify::{LifecycleEvent, Notifier, RecordingSubscriber};
use l10nflow_core::store::{digest, ContentStore};
use l10nflow_core::version::VersionManager;
use l10nflow_core::workflow::collaborators::{Actor, BasicScorer, LeastLoadedPolicy, Role};
use l10nflow_core::workflow::state::{
    Priority, ReviewDecision, SourceRef, StepStatus, StepType, TaskStatus, TaskTarget, TaskType,
    WorkflowStep,
};
use l10nflow_core::workflow::{NewTask, TranslationSubmission, WorkflowEngine};

// ===========================================================================
// Helpers
// ===========================================================================

struct Harness {
    dir: TempDir,
    versions: Arc<VersionManager>,
    deployments: Arc<SyncManager>,
    engine: WorkflowEngine,
    events: Arc<RecordingSubscriber>,
}

impl Harness {
    fn new(workflow: WorkflowConfig) -> Self {
        let dir = TempDir::new().unwrap();
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
            versions.clone(),
            deployments.clone(),
            notifier,
            Arc::new(BasicScorer),
            Arc::new(LeastLoadedPolicy),
            &workflow,
            dir.path().join("locales"),
        );
        Self {
            dir,
            versions,
            deployments,
            engine,
            events,
        }
    }

    fn locales(&self) -> PathBuf {
        self.dir.path().join("locales")
    }

    fn write(&self, locale: &str, namespace: &str, body: &str) -> PathBuf {
        let path = self.locales().join(locale).join(format!("{namespace}.json"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        path
    }

    fn environment(&self, name: &str, env_type: EnvironmentType, rollback_enabled: bool) -> EnvironmentConfig {
        let env = EnvironmentConfig {
            name: name.into(),
            env_type,
            base_url: format!("https://{name}.example.com"),
            source_path: self.locales(),
            deployment_path: self.dir.path().join("deployed").join(name),
            features: EnvironmentFeatures {
                rollback_enabled,
                ..Default::default()
            },
        };
        self.deployments.register_environment(&env).unwrap();
        env
    }

    fn actor(&self, id: &str, role: Role, languages: &[&str]) {
        self.engine
            .register_actor(&Actor {
                id: id.into(),
                name: id.into(),
                email: format!("{id}@example.com"),
                role,
                languages: languages.iter().map(|l| l.to_string()).collect(),
                available: true,
                workload: 0,
            })
            .unwrap();
    }
}

/// Relative path to file bytes for every file under `root`, sidecars included.
fn file_set(root: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().display().to_string();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(root, root, &mut out);
    out
}

fn resource_set(root: &Path) -> BTreeMap<String, Vec<u8>> {
    file_set(root)
        .into_iter()
        .filter(|(rel, _)| rel.ends_with(".json"))
        .collect()
}

fn target(locale: &str) -> TaskTarget {
    TaskTarget {
        locale: locale.into(),
        namespace: "common".into(),
        assignee: None,
        due_date: None,
        version_id: None,
    }
}

fn task_request(source: &Path, task_type: TaskType, targets: Vec<TaskTarget>) -> NewTask {
    NewTask {
        title: "Release 4.2 strings".into(),
        task_type,
        priority: Priority::Medium,
        source: SourceRef {
            locale: "en-US".into(),
            namespace: "common".into(),
            file: source.display().to_string(),
        },
        targets,
        created_by: "pm".into(),
        reviewers: Vec::new(),
        steps: None,
        metadata: BTreeMap::new(),
    }
}

struct ForcedFailure;

impl DeploymentVerifier for ForcedFailure {
    fn name(&self) -> &str {
        "forced-failure"
    }

    fn verify(&self, _: &EnvironmentConfig, _: &[DeployedFile]) -> Result<(), String> {
        Err("smoke check failed".into())
    }
}

// ===========================================================================
// Versioning
// ===========================================================================

#[test]
fn test_version_diff_and_rollback_scenario() {
    let h = Harness::new(WorkflowConfig::default());
    let path = h.write("en-US", "common", r#"{"greeting":"hi"}"#);
    let v1 = h.versions.create_version(&path, "alice", "initial", None).unwrap();
    let v1_bytes = fs::read(&path).unwrap();
    assert_eq!(v1.hash, digest(&v1_bytes));

    h.write("en-US", "common", r#"{"greeting":"hello","farewell":"bye"}"#);
    let v2 = h.versions.create_version(&path, "alice", "more copy", None).unwrap();
    let changes: Vec<(ChangeType, &str)> = v2
        .changes
        .iter()
        .map(|c| (c.change_type, c.key.as_str()))
        .collect();
    assert_eq!(
        changes,
        vec![(ChangeType::Modify, "greeting"), (ChangeType::Add, "farewell")]
    );
    assert_eq!(v2.parent_hash.as_deref(), Some(v1.hash.as_str()));

    let report = h.versions.diff_report(&v1.id, &v2.id).unwrap();
    assert_eq!(report.added, vec!["farewell".to_string()]);
    assert_eq!(report.modified.len(), 1);
    assert!(report.deleted.is_empty());

    let v3 = h.versions.rollback_to_version(&v1.id, None, "alice").unwrap();
    assert_eq!(fs::read(&path).unwrap(), v1_bytes);
    assert_eq!(v3.changes.len(), 1);
    assert_eq!(v3.changes[0].change_type, ChangeType::Modify);
    assert_eq!(v3.changes[0].key, "greeting");
    assert_eq!(v3.changes[0].severity, Severity::High);
    assert_eq!(v3.metadata.rollback_of.as_deref(), Some(v1.id.as_str()));
    assert_eq!(v3.hash, v1.hash);

    let history = h.versions.get_version_history("en-US", "common", None, 10).unwrap();
    let numbers: Vec<&str> = history.iter().rev().map(|v| v.version.as_str()).collect();
    assert_eq!(numbers, vec![v1.version.as_str(), v2.version.as_str(), v3.version.as_str()]);

    h.versions.validate_version(&v3.id).unwrap();
    h.write("en-US", "common", r#"{"greeting":"edited by hand"}"#);
    assert!(h.versions.validate_version(&v3.id).is_err());
}

// ===========================================================================
// Deployment
// ===========================================================================

#[test]
fn test_production_deploy_then_rollback_is_byte_identical() {
    let h = Harness::new(WorkflowConfig::default());
    let env = h.environment("production", EnvironmentType::Production, true);
    for (rel, body) in [
        ("en-US/common.json", r#"{"greeting":"old"}"#),
        ("en-US/legacy.json", r#"{"x":"y"}"#),
    ] {
        let path = env.deployment_path.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }
    let before = resource_set(&env.deployment_path);

    h.write("en-US", "common", r#"{"greeting":"new"}"#);
    h.write("fr-FR", "common", r#"{"greeting":"nouveau"}"#);

    let result = h
        .deployments
        .deploy_to_production(&DeployOptions {
            environment: "production".into(),
            user: "ops".into(),
            validate: true,
            ..Default::default()
        })
        .unwrap();
    assert!(result.success);
    assert_ne!(resource_set(&env.deployment_path), before);

    let rollback = h
        .deployments
        .rollback_to_deployment("production", &result.deployment_id, true, "ops")
        .unwrap();
    assert!(rollback.success, "{:?}", rollback.errors);
    assert_eq!(resource_set(&env.deployment_path), before);

    let names = h.events.names();
    assert!(names.contains(&"deployment:completed"));
    assert!(names.contains(&"rollback:completed"));
}

#[test]
fn test_staging_verification_failure_without_rollback_leaves_copy() {
    let h = Harness::new(WorkflowConfig::default());
    let env = h.environment("staging", EnvironmentType::Staging, false);
    let deployed = env.deployment_path.join("en-US/common.json");
    fs::create_dir_all(deployed.parent().unwrap()).unwrap();
    fs::write(&deployed, r#"{"greeting":"old"}"#).unwrap();

    h.write("en-US", "common", r#"{"greeting":"new"}"#);
    h.deployments.add_verifier(Arc::new(ForcedFailure));

    let err = h
        .deployments
        .deploy_to_environment(&DeployOptions {
            environment: "staging".into(),
            user: "ops".into(),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, DeployError::VerificationFailed { rolled_back: false, .. }));
    assert_eq!(fs::read_to_string(&deployed).unwrap(), r#"{"greeting":"new"}"#);

    let history = h.deployments.deployment_history(Some("staging"), 5).unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert!(!history[0].rolled_back);
}

// ===========================================================================
// Workflow
// ===========================================================================

#[test]
fn test_workflow_runs_through_deployment() {
    let h = Harness::new(WorkflowConfig {
        required_reviews: 1,
        deploy_environment: Some("production".into()),
        ..Default::default()
    });
    let env = h.environment("production", EnvironmentType::Production, true);
    h.actor("tomas", Role::Translator, &["de"]);
    h.actor("rita", Role::Reviewer, &[]);
    h.actor("max", Role::Approver, &[]);

    let source = h.write("en-US", "common", r#"{"cart":{"empty":"Your cart is empty"}}"#);
    let task = h
        .engine
        .create_task(task_request(&source, TaskType::New, vec![target("de-DE")]))
        .unwrap();
    let task = h.engine.start_task(&task.id).unwrap();
    assert_eq!(task.targets[0].assignee.as_deref(), Some("tomas"));

    let mut entries = BTreeMap::new();
    entries.insert("cart.empty".to_string(), "Ihr Warenkorb ist leer".to_string());
    let task = h
        .engine
        .submit_translation(
            &task.id,
            &TranslationSubmission {
                author: "tomas".into(),
                locale: "de-DE".into(),
                namespace: "common".into(),
                entries,
            },
        )
        .unwrap();
    let task = h
        .engine
        .record_review(&task.id, "review", "rita", ReviewDecision::Approve, None)
        .unwrap();
    let task = h
        .engine
        .record_review(&task.id, "approval", "max", ReviewDecision::Approve, Some("ship it"))
        .unwrap();

    assert_eq!(task.status, TaskStatus::Deployed);
    assert!(task.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(env.deployment_path.join("de-DE/common.json").exists());
    assert!(env.deployment_path.join("en-US/common.json").exists());
    assert_eq!(h.events.names().last(), Some(&"workflow:completed"));
}

#[test]
fn test_failed_step_cancels_and_freezes_downstream() {
    let h = Harness::new(WorkflowConfig::default());
    let source = h.write("en-US", "common", r#"{"greeting":"Hello"}"#);

    // Urgent tasks start at translation; nobody speaks Korean.
    let task = h
        .engine
        .create_task(task_request(&source, TaskType::Urgent, vec![target("ko-KR")]))
        .unwrap();
    let err = h.engine.start_task(&task.id).unwrap_err();
    assert!(matches!(err, WorkflowError::NoAssignee { .. }));

    let task = h.engine.get_task(&task.id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let translation = task.step("translation").unwrap();
    assert_eq!(translation.status, StepStatus::Failed);
    assert!(translation.error.is_some());
    for id in ["review", "approval"] {
        assert_eq!(task.step(id).unwrap().status, StepStatus::Pending);
    }
    assert!(h.engine.advance_task(&task.id).is_err());
    assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
}

#[test]
fn test_low_quality_translation_fails_task() {
    let h = Harness::new(WorkflowConfig::default());
    h.actor("tina", Role::Translator, &["fr-FR"]);
    let source = h.write("en-US", "common", r#"{"welcome":"Welcome, {name}!"}"#);
    let task = h
        .engine
        .create_task(task_request(&source, TaskType::Update, vec![target("fr-FR")]))
        .unwrap();
    h.engine.start_task(&task.id).unwrap();

    let mut entries = BTreeMap::new();
    entries.insert("welcome".to_string(), "Bienvenue !".to_string());
    let err = h
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
        .unwrap_err();
    assert!(matches!(err, WorkflowError::QualityThreshold { ref metric, .. } if metric == "consistency"));
    assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    assert!(!h.locales().join("fr-FR/common.json").exists());
}

// ===========================================================================
// Dependency gating
// ===========================================================================

/// A random DAG: step `i` may depend on any step `j < i`, and may start skipped.
fn dag() -> impl Strategy<Value = Vec<(Vec<usize>, bool)>> {
    (1usize..8).prop_flat_map(|n| {
        (0..n)
            .map(|i| {
                (
                    proptest::collection::vec(any::<bool>(), i),
                    proptest::bool::weighted(0.2),
                )
                    .prop_map(|(mask, skip)| {
                        let deps = mask
                            .iter()
                            .enumerate()
                            .filter(|(_, on)| **on)
                            .map(|(j, _)| j)
                            .collect();
                        (deps, skip)
                    })
            })
            .collect::<Vec<_>>()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_step_never_starts_before_its_dependencies(graph in dag()) {
        let h = Harness::new(WorkflowConfig::default());
        let source = h.write("en-US", "common", r#"{"greeting":"Hello"}"#);

        // Reverse declaration order so the engine cannot rely on it.
        let mut steps: Vec<WorkflowStep> = graph
            .iter()
            .enumerate()
            .map(|(i, (deps, skip))| {
                let ids: Vec<String> = deps.iter().map(|j| format!("s{j}")).collect();
                let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                let mut step = WorkflowStep::new(&format!("s{i}"), "check", StepType::Validation, &refs);
                if *skip {
                    step.status = StepStatus::Skipped;
                }
                step
            })
            .collect();
        steps.reverse();

        let skipped: HashSet<String> = graph
            .iter()
            .enumerate()
            .filter(|(_, (_, skip))| *skip)
            .map(|(i, _)| format!("s{i}"))
            .collect();
        let waits_on_skipped = graph
            .iter()
            .any(|(deps, skip)| !*skip && deps.iter().any(|j| skipped.contains(&format!("s{j}"))));

        let mut request = task_request(&source, TaskType::New, Vec::new());
        request.steps = Some(steps);
        let created = h.engine.create_task(request);
        if waits_on_skipped {
            prop_assert!(matches!(
                created,
                Err(WorkflowError::InvalidGraph(_))
            ));
            return Ok(());
        }
        let task = h.engine.start_task(&created.unwrap().id).unwrap();
        prop_assert_eq!(task.status, TaskStatus::Approved);

        let mut completed: HashSet<String> = HashSet::new();
        for envelope in h.events.snapshot() {
            match envelope.event {
                LifecycleEvent::StepStarted { step_id, .. } => {
                    let i: usize = step_id[1..].parse().unwrap();
                    for j in &graph[i].0 {
                        let dep = format!("s{j}");
                        prop_assert!(
                            completed.contains(&dep),
                            "{} started before {}",
                            step_id,
                            dep
                        );
                    }
                }
                LifecycleEvent::StepCompleted { step_id, .. } => {
                    completed.insert(step_id);
                }
                _ => {}
            }
        }
        prop_assert_eq!(completed.len() + skipped.len(), graph.len());
    }
}
