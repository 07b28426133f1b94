//! Environments, sync, deployment, rollback, backups and history.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};

use l10nflow_core::deploy::{DeployOptions, SyncOptions};
use l10nflow_core::models::{DeploymentResult, SyncOperation};

use crate::style;
use crate::Services;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum EnvAction {
    /// List registered environments.
    List,
    /// Check an environment's paths and source files.
    Validate { name: String },
}

/// Locale and namespace selection shared by `sync` and `deploy`.
#[derive(Args, Debug)]
pub struct Selection {
    /// Locales to include (repeatable); all on disk if omitted.
    #[arg(short, long = "language")]
    languages: Vec<String>,
    /// Namespaces to include (repeatable); all on disk if omitted.
    #[arg(short, long = "namespace")]
    namespaces: Vec<String>,
    #[arg(short, long, default_value = "cli")]
    user: String,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Target environments (repeatable).
    #[arg(short, long = "env", required = true)]
    environments: Vec<String>,
    #[command(flatten)]
    selection: Selection,
    /// Only list the files and estimate the duration.
    #[arg(long)]
    dry_run: bool,
    #[arg(short, long, default_value = "")]
    description: String,
}

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Target environment.
    environment: String,
    #[command(flatten)]
    selection: Selection,
    /// Skip the pre-deploy backup.
    #[arg(long)]
    no_backup: bool,
    /// Skip source validation.
    #[arg(long)]
    no_validate: bool,
    /// Never restore automatically on verification failure.
    #[arg(long)]
    no_rollback: bool,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    environment: String,
    /// Deployment to undo.
    deployment_id: String,
    /// Do not ask for confirmation.
    #[arg(short, long)]
    yes: bool,
    #[arg(short, long, default_value = "cli")]
    user: String,
}

#[derive(Subcommand, Debug)]
pub enum BackupAction {
    /// Back up an environment's deployed files.
    Create {
        environment: String,
        #[arg(short, long, default_value = "manual backup")]
        description: String,
    },
    /// List backups.
    List {
        #[arg(short, long)]
        environment: Option<String>,
    },
    /// Restore an environment from a backup.
    Restore {
        environment: String,
        backup_id: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// Delete backups older than a number of days.
    Prune {
        #[arg(long, default_value = "30")]
        older_than_days: i64,
        #[arg(short, long)]
        environment: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(short, long)]
    environment: Option<String>,
    #[arg(short, long, default_value = "20")]
    limit: u32,
    /// Show rollbacks instead of deployments.
    #[arg(long)]
    rollbacks: bool,
}

fn spinner(msg: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.set_message(msg);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

fn confirm(prompt: String, skip: bool) -> Result<bool> {
    if skip {
        return Ok(true);
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("failed to read confirmation")
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

pub fn run_env(services: &Services, action: EnvAction) -> Result<()> {
    match action {
        EnvAction::List => {
            let envs = services
                .deployments
                .list_environments()
                .context("failed to list environments")?;
            if envs.is_empty() {
                println!("No environments registered.");
                return Ok(());
            }
            let mut table = style::table(&["Name", "Type", "URL", "Deployment path", "Backup", "Rollback"]);
            for e in &envs {
                let flag = |on: bool| if on { "on".to_string() } else { "off".to_string() };
                table.add_row(vec![
                    e.name.clone(),
                    e.env_type.to_string(),
                    e.base_url.clone(),
                    e.deployment_path.display().to_string(),
                    flag(e.features.auto_backup),
                    flag(e.features.rollback_enabled),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        EnvAction::Validate { name } => {
            let report = services
                .deployments
                .validate_environment(&name)
                .context("failed to validate environment")?;
            for e in &report.errors {
                println!("{}", style::error(e));
            }
            for w in &report.warnings {
                println!("{}", style::warn(w));
            }
            if !report.missing_files.is_empty() {
                println!(
                    "{}",
                    style::dim(&format!(
                        "Not yet deployed: {}",
                        report.missing_files.join(", ")
                    ))
                );
            }
            if !report.valid {
                anyhow::bail!("environment '{name}' is not valid");
            }
            println!("{}", style::success(&format!("Environment '{name}' is valid")));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Sync & deploy
// ---------------------------------------------------------------------------

pub fn run_sync(services: &Services, args: SyncArgs) -> Result<()> {
    let options = SyncOptions {
        languages: args.selection.languages,
        namespaces: args.selection.namespaces,
        dry_run: args.dry_run,
        user: args.selection.user,
        description: args.description,
    };
    let spinner = spinner(format!("Syncing {}...", args.environments.join(", ")));
    let results = services
        .deployments
        .sync_to_multiple_environments(&args.environments, &options);
    spinner.finish_and_clear();

    let mut failed = 0;
    for (name, result) in results {
        match result {
            Ok(op) => print_operation(&name, &op),
            Err(e) => {
                failed += 1;
                println!("{}", style::error(&format!("{name}: {e}")));
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} environment(s) failed to sync");
    }
    Ok(())
}

fn print_operation(name: &str, op: &SyncOperation) {
    let meta = &op.metadata;
    if meta.dry_run {
        println!(
            "{}",
            style::header(&format!(
                "{name}: {} file(s) would be copied (~{} ms)",
                meta.files.len(),
                meta.estimated_duration_ms.unwrap_or(0)
            ))
        );
        for f in &meta.files {
            println!("  {f}");
        }
        return;
    }
    let line = format!(
        "{name}: {}/{} file(s) copied ({})",
        meta.files_copied,
        meta.files.len(),
        op.id
    );
    if meta.errors.is_empty() {
        println!("{}", style::success(&line));
    } else {
        println!("{}", style::warn(&line));
        for e in &meta.errors {
            println!("    {}", style::error(e));
        }
    }
}

pub fn run_deploy(services: &Services, args: DeployArgs) -> Result<()> {
    let options = DeployOptions {
        environment: args.environment.clone(),
        languages: args.selection.languages,
        namespaces: args.selection.namespaces,
        user: args.selection.user,
        backup: args.no_backup.then_some(false),
        validate: !args.no_validate,
        rollback_on_failure: args.no_rollback.then_some(false),
    };
    let env = services
        .deployments
        .get_environment(&args.environment)
        .context("unknown environment")?;

    let spinner = spinner(format!("Deploying to {}...", env.name));
    let result = if env.env_type == l10nflow_core::models::EnvironmentType::Production {
        services.deployments.deploy_to_production(&options)
    } else {
        services.deployments.deploy_to_environment(&options)
    };
    spinner.finish_and_clear();

    let result = result.context("deployment failed")?;
    print_deployment(&result);
    Ok(())
}

fn print_deployment(result: &DeploymentResult) {
    println!(
        "{}",
        style::success(&format!(
            "Deployed {} file(s) to {} in {} ms ({})",
            result.files_deployed, result.environment, result.duration_ms, result.deployment_id
        ))
    );
    if let Some(backup) = &result.backup_id {
        println!("  Backup : {backup}");
    }
    for w in &result.warnings {
        println!("{}", style::warn(w));
    }
}

pub fn run_rollback(services: &Services, args: RollbackArgs) -> Result<()> {
    let prompt = format!(
        "Restore '{}' to its state before {}?",
        args.environment, args.deployment_id
    );
    let confirmed = confirm(prompt, args.yes)?;
    if !confirmed {
        println!("Rollback cancelled.");
        return Ok(());
    }

    let result = services
        .deployments
        .rollback_to_deployment(&args.environment, &args.deployment_id, confirmed, &args.user)
        .context("rollback failed")?;
    let line = format!(
        "Rolled back {}: {} restored, {} removed ({})",
        result.environment, result.files_restored, result.files_removed, result.rollback_id
    );
    if result.success {
        println!("{}", style::success(&line));
    } else {
        println!("{}", style::warn(&line));
        for e in &result.errors {
            println!("    {}", style::error(e));
        }
        anyhow::bail!("rollback finished with {} error(s)", result.errors.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Backups & history
// ---------------------------------------------------------------------------

pub fn run_backup(services: &Services, action: BackupAction) -> Result<()> {
    let deployments = &services.deployments;
    match action {
        BackupAction::Create {
            environment,
            description,
        } => {
            let record = deployments
                .create_backup(&environment, &description)
                .context("backup failed")?;
            println!(
                "{}",
                style::success(&format!(
                    "Backed up {} file(s) ({} bytes) as {}",
                    record.files.len(),
                    record.total_bytes,
                    record.id
                ))
            );
            Ok(())
        }

        BackupAction::List { environment } => {
            let backups = deployments
                .list_backups(environment.as_deref())
                .context("failed to list backups")?;
            if backups.is_empty() {
                println!("No backups.");
                return Ok(());
            }
            let mut table = style::table(&["ID", "Environment", "Files", "Bytes", "Created", "Description"]);
            for b in &backups {
                table.add_row(vec![
                    b.id.clone(),
                    b.environment.clone(),
                    b.files.len().to_string(),
                    b.total_bytes.to_string(),
                    b.created_at.format("%Y-%m-%d %H:%M").to_string(),
                    style::truncate(&b.description, 40),
                ]);
            }
            println!("{table}");
            Ok(())
        }

        BackupAction::Restore {
            environment,
            backup_id,
            yes,
        } => {
            if !confirm(format!("Overwrite '{environment}' with backup {backup_id}?"), yes)? {
                println!("Restore cancelled.");
                return Ok(());
            }
            let summary = deployments
                .restore_backup(&environment, &backup_id)
                .context("restore failed")?;
            println!(
                "{}",
                style::success(&format!(
                    "Restored {} file(s), removed {}",
                    summary.files_restored, summary.files_removed
                ))
            );
            for e in &summary.errors {
                println!("    {}", style::error(e));
            }
            Ok(())
        }

        BackupAction::Prune {
            older_than_days,
            environment,
        } => {
            let pruned = deployments
                .prune_backups(environment.as_deref(), older_than_days)
                .context("prune failed")?;
            println!("{}", style::success(&format!("Pruned {pruned} backup(s)")));
            Ok(())
        }
    }
}

pub fn run_history(services: &Services, args: HistoryArgs) -> Result<()> {
    let deployments = &services.deployments;
    if args.rollbacks {
        let rollbacks = deployments
            .rollback_history(args.environment.as_deref(), args.limit)
            .context("failed to read rollback history")?;
        let mut table = style::table(&["ID", "Environment", "Deployment", "Restored", "Removed", "Result", "When"]);
        for r in &rollbacks {
            table.add_row(vec![
                r.rollback_id.clone(),
                r.environment.clone(),
                r.target_deployment_id.clone(),
                r.files_restored.to_string(),
                r.files_removed.to_string(),
                style::status(if r.success { "success" } else { "failed" }),
                r.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            ]);
        }
        println!("{table}");
        return Ok(());
    }

    let history = deployments
        .deployment_history(args.environment.as_deref(), args.limit)
        .context("failed to read deployment history")?;
    if history.is_empty() {
        println!("No deployments.");
        return Ok(());
    }
    let mut table = style::table(&["ID", "Environment", "Files", "Backup", "Result", "User", "When"]);
    for d in &history {
        let outcome = match (d.success, d.rolled_back) {
            (true, _) => style::status("success"),
            (false, true) => style::status("failed") + " (rolled back)",
            (false, false) => style::status("failed"),
        };
        table.add_row(vec![
            d.deployment_id.clone(),
            d.environment.clone(),
            d.files_deployed.to_string(),
            d.backup_id.as_deref().map(style::short_id).unwrap_or("-").to_string(),
            outcome,
            d.user.clone(),
            d.timestamp.format("%Y-%m-%d %H:%M").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
