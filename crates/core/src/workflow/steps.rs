//! Step graph construction and the quality gate shared by validation and
//! translation submissions.

use std::collections::{HashMap, HashSet};

use crate::config::{QualityThresholds, WorkflowConfig};
use crate::errors::WorkflowError;

use super::collaborators::{QualityAssessment, QualityScorer};
use super::state::{StepStatus, StepType, TaskType, WorkflowStep};

pub const VALIDATION: &str = "validation";
pub const TRANSLATION: &str = "translation";
pub const REVIEW: &str = "review";
pub const APPROVAL: &str = "approval";
pub const DEPLOYMENT: &str = "deployment";

fn skipped(mut step: WorkflowStep) -> WorkflowStep {
    step.status = StepStatus::Skipped;
    step
}

/// The standard graph for a task type.
///
/// `new` and `update` run every stage in order. `urgent` skips validation
/// and needs a single review approval. `review` starts at the review step.
/// The deployment step is skipped when no deploy environment is configured.
pub fn build_steps(
    task_type: TaskType,
    config: &WorkflowConfig,
    reviewers: &[String],
) -> Vec<WorkflowStep> {
    let validation = WorkflowStep::new(VALIDATION, "Quality validation", StepType::Validation, &[]);

    let mut translation = match task_type {
        TaskType::Urgent => {
            WorkflowStep::new(TRANSLATION, "Translation", StepType::Translation, &[])
        }
        _ => WorkflowStep::new(
            TRANSLATION,
            "Translation",
            StepType::Translation,
            &[VALIDATION],
        ),
    };
    translation.config.auto_assign = config.auto_assign;

    let mut review = match task_type {
        TaskType::Review => WorkflowStep::new(REVIEW, "Peer review", StepType::Review, &[]),
        _ => WorkflowStep::new(REVIEW, "Peer review", StepType::Review, &[TRANSLATION]),
    };
    review.config.required_approvals = match task_type {
        TaskType::Urgent => 1,
        _ => config.required_reviews,
    };
    review.config.reviewers = reviewers.to_vec();

    let mut approval =
        WorkflowStep::new(APPROVAL, "Final approval", StepType::Approval, &[REVIEW]);
    approval.config.required_approvals = config.required_approvals;

    let mut deployment =
        WorkflowStep::new(DEPLOYMENT, "Deployment", StepType::Deployment, &[APPROVAL]);
    deployment.config.environment = config.deploy_environment.clone();
    let deployment = match config.deploy_environment {
        Some(_) => deployment,
        None => skipped(deployment),
    };

    let (validation, translation) = match task_type {
        TaskType::New | TaskType::Update => (validation, translation),
        TaskType::Urgent => (skipped(validation), translation),
        TaskType::Review => (skipped(validation), skipped(translation)),
    };

    vec![validation, translation, review, approval, deployment]
}

/// Reject graphs with duplicate ids, dangling dependencies, pending steps
/// waiting on skipped ones, or cycles.
pub fn check_graph(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    if steps.is_empty() {
        return Err(WorkflowError::InvalidGraph("a task needs at least one step".into()));
    }
    let mut ids = HashSet::new();
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(WorkflowError::InvalidGraph(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }
    for step in steps {
        if let Some(dep) = step.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(WorkflowError::InvalidGraph(format!(
                "step '{}' depends on unknown step '{dep}'",
                step.id
            )));
        }
        if !matches!(step.status, StepStatus::Pending | StepStatus::Skipped) {
            return Err(WorkflowError::InvalidGraph(format!(
                "step '{}' must start pending or skipped",
                step.id
            )));
        }
    }

    // A skipped step never completes, so a pending step must not wait on one.
    let skipped: HashSet<&str> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Skipped)
        .map(|s| s.id.as_str())
        .collect();
    for step in steps.iter().filter(|s| s.status == StepStatus::Pending) {
        if let Some(dep) = step.dependencies.iter().find(|d| skipped.contains(d.as_str())) {
            return Err(WorkflowError::InvalidGraph(format!(
                "step '{}' depends on skipped step '{dep}'",
                step.id
            )));
        }
    }

    // Kahn's algorithm: anything left over sits on a cycle.
    let mut indegree: HashMap<&str, usize> = steps
        .iter()
        .map(|s| {
            let unique: HashSet<&str> = s.dependencies.iter().map(String::as_str).collect();
            (s.id.as_str(), unique.len())
        })
        .collect();
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut visited = 0;
    while let Some(id) = ready.pop() {
        visited += 1;
        for step in steps.iter().filter(|s| s.dependencies.iter().any(|d| d == id)) {
            if let Some(d) = indegree.get_mut(step.id.as_str()) {
                *d -= 1;
                if *d == 0 {
                    ready.push(step.id.as_str());
                }
            }
        }
    }
    if visited != steps.len() {
        return Err(WorkflowError::InvalidGraph("dependency cycle".into()));
    }
    Ok(())
}

/// Score one value and enforce the configured thresholds.
pub fn check_quality(
    scorer: &dyn QualityScorer,
    thresholds: &QualityThresholds,
    key: &str,
    source_text: &str,
    translated_text: &str,
    source_locale: &str,
    target_locale: &str,
) -> Result<QualityAssessment, WorkflowError> {
    let length = translated_text.chars().count();
    if length > thresholds.max_length {
        return Err(WorkflowError::QualityThreshold {
            key: key.to_string(),
            locale: target_locale.to_string(),
            metric: "max_length".into(),
            actual: length as f64,
            threshold: thresholds.max_length as f64,
        });
    }

    let assessment = scorer.score(source_text, translated_text, source_locale, target_locale);
    let checks = [
        ("completeness", assessment.dimensions.completeness, thresholds.completeness),
        ("consistency", assessment.dimensions.consistency, thresholds.consistency),
        ("format", assessment.dimensions.format, thresholds.format),
    ];
    for (metric, actual, threshold) in checks {
        if actual < threshold {
            return Err(WorkflowError::QualityThreshold {
                key: key.to_string(),
                locale: target_locale.to_string(),
                metric: metric.into(),
                actual,
                threshold,
            });
        }
    }
    Ok(assessment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::collaborators::BasicScorer;

    fn statuses(steps: &[WorkflowStep]) -> Vec<(&str, StepStatus)> {
        steps.iter().map(|s| (s.id.as_str(), s.status)).collect()
    }

    #[test]
    fn test_standard_graph() {
        let steps = build_steps(TaskType::New, &WorkflowConfig::default(), &[]);
        assert_eq!(steps.len(), 5);
        assert!(steps.iter().take(4).all(|s| s.status == StepStatus::Pending));
        assert_eq!(steps[4].status, StepStatus::Skipped);
        assert_eq!(steps[2].config.required_approvals, 2);
        assert_eq!(steps[1].dependencies, vec![VALIDATION.to_string()]);
        check_graph(&steps).unwrap();
    }

    #[test]
    fn test_urgent_and_review_graphs() {
        let config = WorkflowConfig {
            deploy_environment: Some("production".into()),
            ..Default::default()
        };
        let urgent = build_steps(TaskType::Urgent, &config, &[]);
        assert_eq!(urgent[0].status, StepStatus::Skipped);
        assert!(urgent[1].dependencies.is_empty());
        assert_eq!(urgent[2].config.required_approvals, 1);
        assert_eq!(urgent[4].status, StepStatus::Pending);
        assert_eq!(urgent[4].config.environment.as_deref(), Some("production"));

        let review = build_steps(TaskType::Review, &config, &["rita".to_string()]);
        assert_eq!(
            statuses(&review)[..3],
            [
                (VALIDATION, StepStatus::Skipped),
                (TRANSLATION, StepStatus::Skipped),
                (REVIEW, StepStatus::Pending)
            ]
        );
        assert!(review[2].dependencies.is_empty());
        assert_eq!(review[2].config.reviewers, vec!["rita".to_string()]);
    }

    #[test]
    fn test_check_graph_rejects_bad_graphs() {
        let a = WorkflowStep::new("a", "a", StepType::Validation, &["b"]);
        let b = WorkflowStep::new("b", "b", StepType::Validation, &["a"]);
        assert!(matches!(
            check_graph(&[a.clone(), b]),
            Err(WorkflowError::InvalidGraph(d)) if d.contains("cycle")
        ));
        assert!(matches!(
            check_graph(&[a.clone()]),
            Err(WorkflowError::InvalidGraph(d)) if d.contains("unknown")
        ));
        let dup = WorkflowStep::new("a", "again", StepType::Review, &[]);
        assert!(matches!(
            check_graph(&[WorkflowStep::new("a", "a", StepType::Validation, &[]), dup]),
            Err(WorkflowError::InvalidGraph(d)) if d.contains("duplicate")
        ));
        assert!(check_graph(&[]).is_err());
    }

    #[test]
    fn test_check_graph_rejects_dependency_on_skipped_step() {
        let mut s0 = WorkflowStep::new("s0", "s0", StepType::Validation, &[]);
        s0.status = StepStatus::Skipped;
        let s1 = WorkflowStep::new("s1", "s1", StepType::Validation, &["s0"]);
        assert!(matches!(
            check_graph(&[s0.clone(), s1]),
            Err(WorkflowError::InvalidGraph(d)) if d.contains("skipped step 's0'")
        ));

        // A skipped step may itself sit behind pending ones.
        let mut tail = WorkflowStep::new("tail", "tail", StepType::Deployment, &["head"]);
        tail.status = StepStatus::Skipped;
        let head = WorkflowStep::new("head", "head", StepType::Validation, &[]);
        check_graph(&[head, tail]).unwrap();
    }

    #[test]
    fn test_every_standard_graph_passes_check() {
        let deploying = WorkflowConfig {
            deploy_environment: Some("production".into()),
            ..Default::default()
        };
        for config in [WorkflowConfig::default(), deploying] {
            for task_type in [TaskType::New, TaskType::Update, TaskType::Urgent, TaskType::Review] {
                check_graph(&build_steps(task_type, &config, &[])).unwrap();
            }
        }
    }

    #[test]
    fn test_quality_gate() {
        let thresholds = QualityThresholds::default();
        check_quality(&BasicScorer, &thresholds, "k", "Hello {name}", "Bonjour {name}", "en-US", "fr-FR")
            .unwrap();

        let err = check_quality(&BasicScorer, &thresholds, "k", "Hello", "", "en-US", "fr-FR")
            .unwrap_err();
        assert!(matches!(err, WorkflowError::QualityThreshold { ref metric, .. } if metric == "completeness"));

        let err = check_quality(&BasicScorer, &thresholds, "k", "Hi {name}", "Salut", "en-US", "fr-FR")
            .unwrap_err();
        assert!(matches!(err, WorkflowError::QualityThreshold { ref metric, .. } if metric == "consistency"));

        let long = "x".repeat(thresholds.max_length + 1);
        let err = check_quality(&BasicScorer, &thresholds, "k", &long, &long, "en-US", "en-US")
            .unwrap_err();
        assert!(matches!(err, WorkflowError::QualityThreshold { ref metric, .. } if metric == "max_length"));
    }
}
