//! Translation tasks and the actor directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use l10nflow_core::resource::ResourceFile;
use l10nflow_core::workflow::collaborators::{Actor, Role};
use l10nflow_core::workflow::state::{
    Priority, ReviewDecision, SourceRef, Task, TaskStatus, TaskTarget, TaskType,
};
use l10nflow_core::workflow::{NewTask, TaskFilter, TranslationSubmission};

use crate::style;
use crate::Services;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum TaskAction {
    /// Create a draft task for a source resource file.
    Create {
        title: String,
        /// Source file, `<locales>/<locale>/<namespace>.json`.
        #[arg(long)]
        source: PathBuf,
        /// Target locales (repeatable).
        #[arg(short, long = "target")]
        targets: Vec<String>,
        /// new, update, urgent or review.
        #[arg(long = "type", default_value = "new")]
        task_type: String,
        /// low, medium, high or critical.
        #[arg(long, default_value = "medium")]
        priority: String,
        /// Designated reviewers (repeatable).
        #[arg(long = "reviewer")]
        reviewers: Vec<String>,
        #[arg(long, default_value = "cli")]
        created_by: String,
        /// Start the task right away.
        #[arg(long)]
        start: bool,
    },
    /// Start a draft task.
    Start { id: String },
    /// Show a task and its steps.
    Show { id: String },
    /// List tasks, newest first.
    List {
        #[arg(short, long)]
        status: Option<String>,
        #[arg(long = "type")]
        task_type: Option<String>,
        #[arg(short, long)]
        priority: Option<String>,
        #[arg(short, long)]
        assignee: Option<String>,
    },
    /// Submit translations for one target of a task.
    Submit {
        id: String,
        #[arg(long)]
        author: String,
        #[arg(long)]
        locale: String,
        /// Namespace (the source namespace if omitted).
        #[arg(long)]
        namespace: Option<String>,
        /// `key=value` pairs (repeatable).
        #[arg(short, long = "entry", value_parser = parse_entry)]
        entries: Vec<(String, String)>,
        /// JSON resource file whose keys are submitted.
        #[arg(long, conflicts_with = "entries")]
        from_file: Option<PathBuf>,
    },
    /// Approve or reject a review or approval step.
    Review {
        id: String,
        /// Step id, e.g. `review` or `approval`.
        step: String,
        #[arg(long)]
        actor: String,
        /// approve or reject.
        #[arg(long)]
        decision: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Add a review comment to a task.
    Comment {
        id: String,
        #[arg(long)]
        author: String,
        body: String,
        #[arg(long)]
        step: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ActorAction {
    /// Add or update an actor.
    Add {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        email: String,
        /// translator, reviewer, approver, manager or admin.
        #[arg(long)]
        role: String,
        /// Locale codes (repeatable); `fr` covers every `fr-*` locale.
        #[arg(short, long = "language")]
        languages: Vec<String>,
        #[arg(long)]
        unavailable: bool,
    },
    /// List actors with their workload.
    List,
}

fn parse_entry(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

fn parse_or_bail<T>(value: &str, kind: &str, parse: fn(&str) -> Option<T>) -> Result<T> {
    parse(value).ok_or_else(|| anyhow::anyhow!("unknown {kind} '{value}'"))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

pub fn run_task(services: &Services, action: TaskAction) -> Result<()> {
    let engine = &services.workflow;
    match action {
        TaskAction::Create {
            title,
            source,
            targets,
            task_type,
            priority,
            reviewers,
            created_by,
            start,
        } => {
            let resource = ResourceFile::from_path(&source)
                .context("source must live at <locales>/<locale>/<namespace>.json")?;
            let request = NewTask {
                title,
                task_type: parse_or_bail(&task_type, "task type", TaskType::from_str_val)?,
                priority: parse_or_bail(&priority, "priority", Priority::from_str_val)?,
                targets: targets
                    .iter()
                    .map(|locale| TaskTarget {
                        locale: locale.clone(),
                        namespace: resource.namespace.clone(),
                        assignee: None,
                        due_date: None,
                        version_id: None,
                    })
                    .collect(),
                source: SourceRef {
                    locale: resource.locale,
                    namespace: resource.namespace,
                    file: source.display().to_string(),
                },
                created_by,
                reviewers,
                steps: None,
                metadata: BTreeMap::new(),
            };
            let task = engine.create_task(request).context("failed to create task")?;
            println!("{}", style::success(&format!("Created task {}", task.id)));
            if start {
                let task = engine.start_task(&task.id).context("failed to start task")?;
                print_task(&task);
            }
            Ok(())
        }

        TaskAction::Start { id } => {
            let task = engine.start_task(&id).context("task failed")?;
            print_task(&task);
            Ok(())
        }

        TaskAction::Show { id } => {
            let task = engine.get_task(&id).context("failed to load task")?;
            print_task(&task);
            let progress = engine.task_progress(&id).context("failed to compute progress")?;
            println!(
                "{}",
                style::dim(&format!(
                    "{:.0}% done: {} completed, {} skipped, {} pending, {} failed",
                    progress.percent,
                    progress.completed,
                    progress.skipped,
                    progress.pending,
                    progress.failed
                ))
            );
            let comments = engine
                .list_review_comments(&id)
                .context("failed to list comments")?;
            for c in &comments {
                println!(
                    "  [{}] {}{}: {}",
                    c.created_at.format("%Y-%m-%d %H:%M"),
                    c.author,
                    c.step_id
                        .as_deref()
                        .map(|s| format!(" on {s}"))
                        .unwrap_or_default(),
                    c.body
                );
            }
            Ok(())
        }

        TaskAction::List {
            status,
            task_type,
            priority,
            assignee,
        } => {
            let filter = TaskFilter {
                status: status
                    .as_deref()
                    .map(|s| parse_or_bail(s, "status", TaskStatus::from_str_val))
                    .transpose()?,
                task_type: task_type
                    .as_deref()
                    .map(|s| parse_or_bail(s, "task type", TaskType::from_str_val))
                    .transpose()?,
                priority: priority
                    .as_deref()
                    .map(|s| parse_or_bail(s, "priority", Priority::from_str_val))
                    .transpose()?,
                assignee,
            };
            let tasks = engine.list_tasks(&filter).context("failed to list tasks")?;
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            let mut table = style::table(&["ID", "Title", "Type", "Priority", "Status", "Step", "Created"]);
            for t in &tasks {
                table.add_row(vec![
                    t.id.clone(),
                    style::truncate(&t.title, 30),
                    t.task_type.to_string(),
                    t.priority.to_string(),
                    style::status(&t.status.to_string()),
                    t.running_step().map(|s| s.id.clone()).unwrap_or_default(),
                    t.created_at.format("%Y-%m-%d").to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        TaskAction::Submit {
            id,
            author,
            locale,
            namespace,
            entries,
            from_file,
        } => {
            let namespace = match namespace {
                Some(ns) => ns,
                None => engine.get_task(&id).context("failed to load task")?.source.namespace,
            };
            let entries: BTreeMap<String, String> = match from_file {
                Some(path) => ResourceFile {
                    locale: locale.clone(),
                    namespace: namespace.clone(),
                    path,
                }
                .read_tree()
                .context("failed to read submission file")?
                .flatten(),
                None => entries.into_iter().collect(),
            };
            let task = engine
                .submit_translation(
                    &id,
                    &TranslationSubmission {
                        author,
                        locale,
                        namespace,
                        entries,
                    },
                )
                .context("submission failed")?;
            print_task(&task);
            Ok(())
        }

        TaskAction::Review {
            id,
            step,
            actor,
            decision,
            comment,
        } => {
            let decision = parse_or_bail(&decision, "decision", ReviewDecision::from_str_val)?;
            let task = engine
                .record_review(&id, &step, &actor, decision, comment.as_deref())
                .context("review failed")?;
            print_task(&task);
            Ok(())
        }

        TaskAction::Comment {
            id,
            author,
            body,
            step,
        } => {
            let comment = engine
                .add_review_comment(&id, step.as_deref(), &author, &body)
                .context("failed to add comment")?;
            println!("{}", style::success(&format!("Added comment {}", comment.id)));
            Ok(())
        }
    }
}

fn print_task(task: &Task) {
    println!();
    println!(
        "{}",
        style::header(&format!("{}  {}", task.id, task.title))
    );
    println!(
        "  {} / {} / {}",
        task.task_type,
        task.priority,
        style::status(&task.status.to_string())
    );
    println!(
        "  Source: {}/{} ({})",
        task.source.locale, task.source.namespace, task.source.file
    );
    for t in &task.targets {
        println!(
            "  Target: {}/{} assignee={} version={}",
            t.locale,
            t.namespace,
            t.assignee.as_deref().unwrap_or("-"),
            t.version_id.as_deref().unwrap_or("-")
        );
    }
    println!();

    let mut table = style::table(&["Step", "Type", "Status", "Depends on", "Reviews", "Error"]);
    for s in &task.steps {
        table.add_row(vec![
            s.id.clone(),
            s.step_type.to_string(),
            style::status(&s.status.to_string()),
            s.dependencies.join(", "),
            if s.step_type.is_review_gate() {
                format!("{}/{}", s.approval_count(), s.config.required_approvals)
            } else {
                String::new()
            },
            style::truncate(s.error.as_deref().unwrap_or(""), 40),
        ]);
    }
    println!("{table}");
}

// ---------------------------------------------------------------------------
// Actors
// ---------------------------------------------------------------------------

pub fn run_actor(services: &Services, action: ActorAction) -> Result<()> {
    let engine = &services.workflow;
    match action {
        ActorAction::Add {
            id,
            name,
            email,
            role,
            languages,
            unavailable,
        } => {
            let role = parse_or_bail(&role, "role", Role::from_str_val)?;
            let workload = engine.actor_workload(&id).unwrap_or(0);
            engine
                .register_actor(&Actor {
                    id: id.clone(),
                    name,
                    email,
                    role,
                    languages,
                    available: !unavailable,
                    workload,
                })
                .context("failed to register actor")?;
            println!("{}", style::success(&format!("Registered {id} as {role}")));
            Ok(())
        }

        ActorAction::List => {
            let actors = engine.list_actors().context("failed to list actors")?;
            if actors.is_empty() {
                println!("No actors registered.");
                return Ok(());
            }
            let mut table = style::table(&["ID", "Name", "Role", "Languages", "Available", "Workload"]);
            for a in &actors {
                table.add_row(vec![
                    a.id.clone(),
                    a.name.clone(),
                    a.role.to_string(),
                    a.languages.join(", "),
                    if a.available { "yes".into() } else { "no".into() },
                    a.workload.to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry() {
        assert_eq!(
            parse_entry("cart.empty=Panier vide").unwrap(),
            ("cart.empty".to_string(), "Panier vide".to_string())
        );
        assert_eq!(parse_entry("a=b=c").unwrap().1, "b=c");
        assert!(parse_entry("novalue").is_err());
        assert!(parse_entry("=x").is_err());
    }
}
