//! Versions, branches, tags and conflicts.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use l10nflow_core::conflict::{ConflictRecord, ConflictStatus, Resolution, ResolutionRequest};
use l10nflow_core::errors::VersionError;
use l10nflow_core::models::Version;

use crate::style;
use crate::Services;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum VersionAction {
    /// Snapshot a resource file as a new version.
    Create {
        /// Resource file, `<locales>/<locale>/<namespace>.json`.
        file: PathBuf,
        #[arg(short, long, default_value = "cli")]
        author: String,
        #[arg(short, long, default_value = "")]
        message: String,
        /// Branch to append to (default branch if omitted).
        #[arg(short, long)]
        branch: Option<String>,
    },
    /// List versions of a locale/namespace, newest first.
    History {
        locale: String,
        namespace: String,
        #[arg(short, long)]
        branch: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show one version and its changes.
    Show { id: String },
    /// Restore a version's content as a new version.
    Rollback {
        id: String,
        /// Write somewhere other than the version's own file.
        #[arg(long)]
        target: Option<PathBuf>,
        #[arg(short, long, default_value = "cli")]
        author: String,
    },
    /// Check a version's hash against its file.
    Validate { id: String },
    /// Compare two versions.
    Diff {
        from: String,
        to: String,
        /// Print the unified patch too.
        #[arg(long)]
        patch: bool,
    },
    /// Activity summary for a locale/namespace.
    Stats {
        locale: String,
        namespace: String,
        #[arg(short, long)]
        branch: Option<String>,
        #[arg(short, long, default_value = "30")]
        days: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum BranchAction {
    /// Fork a branch.
    Create {
        name: String,
        /// Branch to fork from (default branch if omitted).
        #[arg(long)]
        from: Option<String>,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// List branches.
    List,
    /// Merge one branch's heads into another.
    Merge {
        source: String,
        target: String,
        #[arg(short, long, default_value = "cli")]
        author: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum TagAction {
    /// Tag the current heads of a branch.
    Create {
        name: String,
        /// Release label, e.g. `2024.06`.
        release: String,
        #[arg(short, long)]
        branch: Option<String>,
        #[arg(short, long, default_value = "")]
        message: String,
        #[arg(short, long, default_value = "cli")]
        author: String,
    },
    /// List tags.
    List,
}

#[derive(Subcommand, Debug)]
pub enum ConflictAction {
    /// Record conflicting keys between two resource files.
    Detect { current: PathBuf, incoming: PathBuf },
    /// List conflicts.
    List {
        /// Filter by status: pending or resolved.
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Resolve a conflict.
    Resolve {
        id: String,
        /// use_current, use_incoming, merge or manual.
        #[arg(long)]
        strategy: String,
        /// Value for merge/manual resolutions.
        #[arg(long)]
        value: Option<String>,
        #[arg(short, long, default_value = "cli")]
        author: String,
    },
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

pub fn run_version(services: &Services, action: VersionAction) -> Result<()> {
    let versions = &services.versions;
    match action {
        VersionAction::Create {
            file,
            author,
            message,
            branch,
        } => {
            let version = versions
                .create_version(&file, &author, &message, branch.as_deref())
                .context("failed to create version")?;
            println!(
                "{}",
                style::success(&format!(
                    "Created {} {} ({} change(s))",
                    version.id,
                    version.version,
                    version.changes.len()
                ))
            );
            Ok(())
        }

        VersionAction::History {
            locale,
            namespace,
            branch,
            limit,
        } => {
            let history = versions
                .get_version_history(&locale, &namespace, branch.as_deref(), limit)
                .context("failed to read version history")?;
            if history.is_empty() {
                println!("No versions for {locale}/{namespace}.");
                return Ok(());
            }
            let mut table = style::table(&["ID", "Version", "Author", "Changes", "Review", "Created"]);
            for v in &history {
                table.add_row(vec![
                    v.id.clone(),
                    v.version.clone(),
                    v.author.clone(),
                    v.changes.len().to_string(),
                    v.metadata.review_status.to_string(),
                    v.timestamp.format("%Y-%m-%d %H:%M").to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        VersionAction::Show { id } => {
            let version = versions.get_version(&id).context("failed to load version")?;
            print_version(&version);
            Ok(())
        }

        VersionAction::Rollback { id, target, author } => {
            let version = versions
                .rollback_to_version(&id, target.as_deref(), &author)
                .context("rollback failed")?;
            println!(
                "{}",
                style::success(&format!(
                    "Restored {id} as {} {}",
                    version.id, version.version
                ))
            );
            Ok(())
        }

        VersionAction::Validate { id } => {
            match versions.validate_version(&id) {
                Ok(report) => {
                    println!("{}", style::success(&format!("{} matches {}", id, report.hash)));
                    for w in &report.warnings {
                        println!("{}", style::warn(w));
                    }
                    Ok(())
                }
                Err(e @ VersionError::Integrity { .. }) => {
                    println!("{}", style::error(&e.to_string()));
                    anyhow::bail!("version {id} failed validation");
                }
                Err(e) => Err(e).context("failed to validate version"),
            }
        }

        VersionAction::Diff { from, to, patch } => {
            let report = versions.diff_report(&from, &to).context("failed to diff versions")?;
            println!(
                "{}",
                style::header(&format!("{} -> {}", report.from_version, report.to_version))
            );
            for key in &report.added {
                println!("  + {key}");
            }
            for m in &report.modified {
                println!("  ~ {}: {:?} -> {:?}", m.key, m.old_value, m.new_value);
            }
            for key in &report.deleted {
                println!("  - {key}");
            }
            println!(
                "{}",
                style::dim(&format!(
                    "{} change(s), complexity {}",
                    report.statistics.total_changes, report.statistics.complexity
                ))
            );
            if patch {
                println!();
                print!("{}", report.patch);
            }
            Ok(())
        }

        VersionAction::Stats {
            locale,
            namespace,
            branch,
            days,
        } => {
            let stats = versions
                .version_statistics(&locale, &namespace, branch.as_deref(), days)
                .context("failed to compute statistics")?;
            println!("{}", style::header(&format!("{locale}/{namespace}, last {days} day(s)")));
            println!("  Versions        : {}", stats.total_versions);
            println!("  Avg. changes    : {:.1}", stats.average_changes);
            for (author, count) in &stats.top_authors {
                println!("  Author          : {author} ({count})");
            }
            for (kind, count) in &stats.change_types {
                println!("  {kind:<16}: {count}");
            }
            for (day, count) in &stats.daily_activity {
                println!("  {day}      : {count}");
            }
            Ok(())
        }
    }
}

fn print_version(v: &Version) {
    println!("{}", style::header(&format!("{} ({})", v.id, v.version)));
    println!();
    println!("  File        : {}", v.file_path);
    println!("  Scope       : {}/{}", v.locale, v.namespace);
    println!("  Branch      : {}", v.metadata.branch);
    println!("  Author      : {}", v.author);
    println!("  Created     : {}", v.timestamp);
    println!("  Hash        : {}", v.hash);
    println!("  Parent hash : {}", v.parent_hash.as_deref().unwrap_or("-"));
    println!("  Keys        : {} ({} bytes)", v.metadata.key_count, v.metadata.size);
    if let Some(original) = &v.metadata.rollback_of {
        println!("  Restores    : {original}");
    }
    if !v.metadata.description.is_empty() {
        println!("  Description : {}", v.metadata.description);
    }
    if v.changes.is_empty() {
        return;
    }
    println!();
    let mut table = style::table(&["Type", "Key", "Old", "New", "Severity"]);
    for c in &v.changes {
        table.add_row(vec![
            c.change_type.to_string(),
            c.key.clone(),
            style::truncate(c.old_value.as_deref().unwrap_or(""), 30),
            style::truncate(c.new_value.as_deref().unwrap_or(""), 30),
            c.severity.to_string(),
        ]);
    }
    println!("{table}");
}

// ---------------------------------------------------------------------------
// Branches & tags
// ---------------------------------------------------------------------------

pub fn run_branch(services: &Services, action: BranchAction) -> Result<()> {
    let versions = &services.versions;
    match action {
        BranchAction::Create {
            name,
            from,
            description,
        } => {
            let branch = versions
                .create_branch(&name, from.as_deref(), &description)
                .context("failed to create branch")?;
            println!(
                "{}",
                style::success(&format!(
                    "Created branch {} from {}",
                    branch.name,
                    branch.source.as_deref().unwrap_or("-")
                ))
            );
            Ok(())
        }

        BranchAction::List => {
            let branches = versions.list_branches().context("failed to list branches")?;
            let mut table = style::table(&["Name", "Source", "Head", "Updated", ""]);
            for b in &branches {
                table.add_row(vec![
                    b.name.clone(),
                    b.source.clone().unwrap_or_default(),
                    b.head.clone().unwrap_or_default(),
                    b.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    if b.is_default { "default".into() } else { String::new() },
                ]);
            }
            println!("{table}");
            Ok(())
        }

        BranchAction::Merge {
            source,
            target,
            author,
        } => match versions.merge_branch(&source, &target, &author) {
            Ok(summary) => {
                println!(
                    "{}",
                    style::success(&format!(
                        "Merged {} into {}: {} file(s), {} resolved conflict(s)",
                        summary.source,
                        summary.target,
                        summary.versions.len(),
                        summary.conflicts_resolved
                    ))
                );
                Ok(())
            }
            Err(VersionError::ConflictUnresolved { pending }) => {
                println!("{}", style::warn("Merge blocked by unresolved conflicts:"));
                print_conflicts(&pending);
                println!("Resolve them with `l10nflow conflict resolve` and merge again.");
                anyhow::bail!("{} unresolved conflict(s)", pending.len());
            }
            Err(e) => Err(e).context("merge failed"),
        },
    }
}

pub fn run_tag(services: &Services, action: TagAction) -> Result<()> {
    match action {
        TagAction::Create {
            name,
            release,
            branch,
            message,
            author,
        } => {
            let tag = services
                .versions
                .create_tag(&name, &release, branch.as_deref(), &message, &author)
                .context("failed to create tag")?;
            println!(
                "{}",
                style::success(&format!(
                    "Tagged {} file(s) on {} as {}",
                    tag.files.len(),
                    tag.branch,
                    tag.name
                ))
            );
            Ok(())
        }

        TagAction::List => {
            let tags = services.versions.list_tags().context("failed to list tags")?;
            if tags.is_empty() {
                println!("No tags.");
                return Ok(());
            }
            let mut table = style::table(&["Name", "Release", "Branch", "Files", "Author", "Created"]);
            for t in &tags {
                table.add_row(vec![
                    t.name.clone(),
                    t.version.clone(),
                    t.branch.clone(),
                    t.files.len().to_string(),
                    t.author.clone(),
                    t.timestamp.format("%Y-%m-%d").to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

pub fn run_conflict(services: &Services, action: ConflictAction) -> Result<()> {
    let versions = &services.versions;
    match action {
        ConflictAction::Detect { current, incoming } => {
            let conflicts = versions
                .detect_conflicts(&current, &incoming)
                .context("failed to detect conflicts")?;
            if conflicts.is_empty() {
                println!("{}", style::success("No conflicting keys"));
            } else {
                print_conflicts(&conflicts);
            }
            Ok(())
        }

        ConflictAction::List { status } => {
            let status = status.as_deref().map(ConflictStatus::from_str_val);
            let conflicts = versions
                .list_conflicts(status)
                .context("failed to list conflicts")?;
            if conflicts.is_empty() {
                println!("No conflicts found.");
                return Ok(());
            }
            print_conflicts(&conflicts);
            Ok(())
        }

        ConflictAction::Resolve {
            id,
            strategy,
            value,
            author,
        } => {
            let Some(resolution) = Resolution::from_str_val(&strategy) else {
                anyhow::bail!(
                    "invalid strategy '{strategy}': use use_current, use_incoming, merge or manual"
                );
            };
            let record = versions
                .resolve_conflict(
                    &id,
                    &ResolutionRequest {
                        resolution,
                        resolved_value: value,
                        resolved_by: author,
                    },
                )
                .context("failed to resolve conflict")?;
            println!(
                "{}",
                style::success(&format!(
                    "Conflict {} on '{}' resolved ({}): {:?}",
                    record.id,
                    record.key,
                    record.resolution,
                    record.effective_value().unwrap_or_default()
                ))
            );
            Ok(())
        }
    }
}

fn print_conflicts(conflicts: &[ConflictRecord]) {
    let mut table = style::table(&["ID", "Scope", "Key", "Current", "Incoming", "Status"]);
    for c in conflicts {
        table.add_row(vec![
            c.id.clone(),
            c.scope.clone(),
            c.key.clone(),
            style::truncate(&c.current_value, 30),
            style::truncate(&c.incoming_value, 30),
            style::status(&c.status.to_string()),
        ]);
    }
    println!("{table}");
}
