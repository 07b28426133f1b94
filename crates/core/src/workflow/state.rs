//! Task and step records with their status transition tables.
//!
//! Every status change goes through [`Task::transition`] or
//! [`WorkflowStep::transition`]; anything not listed in the tables below is
//! rejected with [`WorkflowError::InvalidTransition`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::WorkflowError;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// What kind of work a task represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    New,
    Update,
    Review,
    Urgent,
}

impl TaskType {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "update" => Some(Self::Update),
            "review" => Some(Self::Review),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Update => write!(f, "update"),
            Self::Review => write!(f, "review"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Aggregate status of a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Draft,
    Active,
    InReview,
    Approved,
    Deployed,
    Cancelled,
}

impl TaskStatus {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "in_review" => Some(Self::InReview),
            "approved" => Some(Self::Approved),
            "deployed" => Some(Self::Deployed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the task status may move to `to`.
    pub fn can_transition(self, to: Self) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Active, InReview)
                | (InReview, Active)
                | (Active, Approved)
                | (Active, Deployed)
                | (Active, Cancelled)
                | (InReview, Cancelled)
        )
    }

    /// Approved, deployed and cancelled tasks accept no further work.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Deployed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::InReview => write!(f, "in_review"),
            Self::Approved => write!(f, "approved"),
            Self::Deployed => write!(f, "deployed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Validation,
    Translation,
    Review,
    Approval,
    Deployment,
}

impl StepType {
    /// Steps that wait for an external event instead of finishing inline.
    pub fn suspends(self) -> bool {
        matches!(self, Self::Translation | Self::Review | Self::Approval)
    }

    /// Steps gated on reviewer decisions.
    pub fn is_review_gate(self) -> bool {
        matches!(self, Self::Review | Self::Approval)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Translation => write!(f, "translation"),
            Self::Review => write!(f, "review"),
            Self::Approval => write!(f, "approval"),
            Self::Deployment => write!(f, "deployment"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether the step status may move to `to`.
    pub fn can_transition(self, to: Self) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Pending, Skipped) | (Running, Completed) | (Running, Failed)
        )
    }

    /// Only a completed step satisfies a dependency.
    pub fn satisfies_dependency(self) -> bool {
        self == Self::Completed
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The resource file a task starts from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRef {
    pub locale: String,
    pub namespace: String,
    pub file: String,
}

/// One locale the task must produce.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskTarget {
    pub locale: String,
    pub namespace: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    /// Version created from the accepted submission.
    #[serde(default)]
    pub version_id: Option<String>,
}

/// A reviewer decision on a review or approval step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl ReviewDecision {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "approve" | "approved" => Some(Self::Approve),
            "reject" | "rejected" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewRecord {
    pub actor: String,
    pub decision: ReviewDecision,
    pub comment: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-step settings fixed when the graph is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepConfig {
    #[serde(default)]
    pub required_approvals: u32,
    #[serde(default)]
    pub auto_assign: bool,
    /// Designated reviewers; empty means any actor with a suitable role.
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

/// One stage in a task's execution graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub status: StepStatus,
    pub assignee: Option<String>,
    pub dependencies: Vec<String>,
    pub config: StepConfig,
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub reviews: Vec<ReviewRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: &str, name: &str, step_type: StepType, dependencies: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            step_type,
            status: StepStatus::Pending,
            assignee: None,
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            config: StepConfig::default(),
            result: None,
            reviews: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move to `to`, stamping start/finish times.
    pub fn transition(&mut self, to: StepStatus) -> Result<(), WorkflowError> {
        if !self.status.can_transition(to) {
            return Err(WorkflowError::InvalidTransition {
                entity: "step",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        match to {
            StepStatus::Running => self.started_at = Some(Utc::now()),
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                self.completed_at = Some(Utc::now())
            }
            StepStatus::Pending => {}
        }
        self.status = to;
        Ok(())
    }

    /// Distinct actors that approved this step.
    pub fn approval_count(&self) -> usize {
        let mut approvers: Vec<&str> = self
            .reviews
            .iter()
            .filter(|r| r.decision == ReviewDecision::Approve)
            .map(|r| r.actor.as_str())
            .collect();
        approvers.sort_unstable();
        approvers.dedup();
        approvers.len()
    }
}

/// The workflow unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub source: SourceRef,
    pub targets: Vec<TaskTarget>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Task {
    /// Move to `to`.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), WorkflowError> {
        if !self.status.can_transition(to) {
            return Err(WorkflowError::InvalidTransition {
                entity: "task",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Dependencies of `step_id` that are not yet satisfied.
    pub fn unmet_dependencies(&self, step_id: &str) -> Vec<String> {
        let Some(step) = self.step(step_id) else {
            return Vec::new();
        };
        step.dependencies
            .iter()
            .filter(|dep| {
                !self
                    .step(dep)
                    .map(|d| d.status.satisfies_dependency())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// First pending step whose dependencies are all satisfied, in graph order.
    pub fn next_ready_step(&self) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending && self.unmet_dependencies(&s.id).is_empty())
    }

    /// The step currently waiting on an external event, if any.
    pub fn running_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Running)
    }
}

/// Free-form comment left on a task during review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewComment {
    pub id: String,
    pub task_id: String,
    pub step_id: Option<String>,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Progress summary of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub task_id: String,
    pub status: TaskStatus,
    /// Share of steps that are completed or skipped, 0 to 100.
    pub percent: f64,
    pub current_step: Option<String>,
    pub completed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub failed: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_transition_table() {
        use StepStatus::*;
        let all = [Pending, Running, Completed, Failed, Skipped];
        let allowed: Vec<(StepStatus, StepStatus)> = all
            .iter()
            .flat_map(|&a| all.iter().map(move |&b| (a, b)))
            .filter(|&(a, b)| a.can_transition(b))
            .collect();
        assert_eq!(
            allowed,
            vec![
                (Pending, Running),
                (Pending, Skipped),
                (Running, Completed),
                (Running, Failed)
            ]
        );
    }

    #[test]
    fn test_only_completed_satisfies_dependency() {
        use StepStatus::*;
        assert!(Completed.satisfies_dependency());
        for status in [Pending, Running, Failed, Skipped] {
            assert!(!status.satisfies_dependency(), "{status} must not satisfy");
        }
    }

    #[test]
    fn test_task_transition_rejects_reopen() {
        assert!(TaskStatus::Draft.can_transition(TaskStatus::Active));
        assert!(!TaskStatus::Cancelled.can_transition(TaskStatus::Active));
        assert!(!TaskStatus::Approved.can_transition(TaskStatus::Active));
        assert!(!TaskStatus::Draft.can_transition(TaskStatus::Approved));
    }

    #[test]
    fn test_step_transition_errors() {
        let mut step = WorkflowStep::new("review", "Review", StepType::Review, &[]);
        let err = step.transition(StepStatus::Completed).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { entity: "step", .. }));
        step.transition(StepStatus::Running).unwrap();
        assert!(step.started_at.is_some());
        step.transition(StepStatus::Completed).unwrap();
        assert!(step.completed_at.is_some());
    }

    #[test]
    fn test_duplicate_approvals_count_once() {
        let mut step = WorkflowStep::new("review", "Review", StepType::Review, &[]);
        for actor in ["alice", "alice", "bob"] {
            step.reviews.push(ReviewRecord {
                actor: actor.into(),
                decision: ReviewDecision::Approve,
                comment: None,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(step.approval_count(), 2);
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            TaskStatus::Draft,
            TaskStatus::Active,
            TaskStatus::InReview,
            TaskStatus::Approved,
            TaskStatus::Deployed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str_val(&status.to_string()), Some(status));
        }
    }
}
