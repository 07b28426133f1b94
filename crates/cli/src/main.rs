//! l10nflow command-line management tool.
//!
//! Provides subcommands for versioning resource files, managing branches,
//! tags and conflicts, driving translation tasks through review, and
//! syncing, deploying and rolling back environments.

mod commands;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use l10nflow_core::config::AppConfig;
use l10nflow_core::db::Database;
use l10nflow_core::deploy::{ParseableVerifier, SyncManager};
use l10nflow_core::notify::{Notifier, WebhookSubscriber};
use l10nflow_core::store::ContentStore;
use l10nflow_core::version::VersionManager;
use l10nflow_core::workflow::collaborators::{BasicScorer, LeastLoadedPolicy};
use l10nflow_core::workflow::WorkflowEngine;

use commands::{deploy, task, version};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// l10nflow command-line management tool.
#[derive(Parser, Debug)]
#[command(
    name = "l10nflow",
    version,
    about = "Version, review and deploy localized string tables"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./l10nflow.toml")]
    config: PathBuf,

    /// Log filter (overrides `store.log_level`), e.g. `debug` or `l10nflow_core=trace`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./l10nflow.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Create, inspect and restore resource file versions.
    Version {
        #[command(subcommand)]
        action: version::VersionAction,
    },

    /// Manage version branches.
    Branch {
        #[command(subcommand)]
        action: version::BranchAction,
    },

    /// Manage release tags.
    Tag {
        #[command(subcommand)]
        action: version::TagAction,
    },

    /// Detect and resolve key conflicts.
    Conflict {
        #[command(subcommand)]
        action: version::ConflictAction,
    },

    /// Create and drive translation tasks.
    Task {
        #[command(subcommand)]
        action: task::TaskAction,
    },

    /// Manage the actor directory.
    Actor {
        #[command(subcommand)]
        action: task::ActorAction,
    },

    /// Inspect deployment environments.
    Env {
        #[command(subcommand)]
        action: deploy::EnvAction,
    },

    /// Copy resource files to one or more environments.
    Sync(deploy::SyncArgs),

    /// Deploy with backup, verification and optional automatic rollback.
    Deploy(deploy::DeployArgs),

    /// Roll an environment back to the state before a deployment.
    Rollback(deploy::RollbackArgs),

    /// Manage environment backups.
    Backup {
        #[command(subcommand)]
        action: deploy::BackupAction,
    },

    /// Show deployment and rollback history.
    History(deploy::HistoryArgs),

    /// Show recent audit log entries.
    Audit {
        /// Maximum number of entries to show.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

/// `--log-level`, else `store.log_level` from the config file, else `info`.
fn init_logging(cli: &Cli) {
    let level = cli
        .log_level
        .clone()
        .or_else(|| {
            AppConfig::load_from_file(expand_home(&cli.config))
                .ok()
                .map(|c| c.store.log_level)
        })
        .unwrap_or_else(|| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = expand_home(&cli.config);
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&config_path),
        command => {
            // Everything else needs the services.
            let config = load_config(&config_path)?;
            let services = Services::open(config)?;
            let result = dispatch(&services, command);
            services.shutdown().await;
            result
        }
    }
}

fn dispatch(services: &Services, command: Commands) -> Result<()> {
    match command {
        Commands::Version { action } => version::run_version(services, action),
        Commands::Branch { action } => version::run_branch(services, action),
        Commands::Tag { action } => version::run_tag(services, action),
        Commands::Conflict { action } => version::run_conflict(services, action),
        Commands::Task { action } => task::run_task(services, action),
        Commands::Actor { action } => task::run_actor(services, action),
        Commands::Env { action } => deploy::run_env(services, action),
        Commands::Sync(args) => deploy::run_sync(services, args),
        Commands::Deploy(args) => deploy::run_deploy(services, args),
        Commands::Rollback(args) => deploy::run_rollback(services, args),
        Commands::Backup { action } => deploy::run_backup(services, action),
        Commands::History(args) => deploy::run_history(services, args),
        Commands::Audit { limit } => cmd_audit(&services.db, limit),
        Commands::Init { .. } | Commands::Validate => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Every core service, wired from one config.
pub struct Services {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub versions: Arc<VersionManager>,
    pub deployments: Arc<SyncManager>,
    pub workflow: WorkflowEngine,
    webhook: Option<JoinHandle<()>>,
}

impl Services {
    fn open(config: AppConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.store.data_dir).with_context(|| {
            format!(
                "failed to create data directory {}",
                config.store.data_dir.display()
            )
        })?;

        let db_path = config.store.database_path();
        let db = Database::new(&db_path).context("failed to open database")?;
        db.initialize()
            .context("failed to initialize database schema")?;
        let db = Arc::new(db);
        debug!(path = %db_path.display(), "database ready");

        let notifier = Arc::new(Notifier::with_tracing(&config.notifications));
        let webhook = match config.notifications.webhook_url.clone() {
            Some(url) => {
                let (subscriber, handle) = WebhookSubscriber::spawn(url);
                notifier.subscribe(Arc::new(subscriber));
                Some(handle)
            }
            None => None,
        };

        let store = ContentStore::open(config.store.objects_dir())
            .context("failed to open content store")?;
        let versions = Arc::new(
            VersionManager::new(db.clone(), store, notifier.clone(), &config.versioning)
                .context("failed to initialize version manager")?,
        );

        let deployments = Arc::new(SyncManager::new(
            db.clone(),
            notifier.clone(),
            &config.sync,
            config.store.backups_dir(),
        ));
        deployments.add_verifier(Arc::new(ParseableVerifier));
        for env in &config.environments {
            deployments
                .register_environment(env)
                .with_context(|| format!("failed to register environment '{}'", env.name))?;
        }

        let workflow = WorkflowEngine::new(
            db.clone(),
            versions.clone(),
            deployments.clone(),
            notifier,
            Arc::new(BasicScorer),
            Arc::new(LeastLoadedPolicy),
            &config.workflow,
            config.store.locales_dir.clone(),
        );
        info!(environments = config.environments.len(), "services initialized");

        Ok(Self {
            config,
            db,
            versions,
            deployments,
            workflow,
            webhook,
        })
    }

    /// Drop the services and wait for queued webhook deliveries.
    async fn shutdown(mut self) {
        let webhook = self.webhook.take();
        drop(self);
        if let Some(handle) = webhook {
            if let Err(e) = handle.await {
                debug!(error = %e, "webhook task ended abnormally");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path).context("failed to load configuration file")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# l10nflow configuration

[store]
data_dir = ".l10nflow"
locales_dir = "locales"
log_level = "info"

[versioning]
default_branch = "main"

[workflow]
required_reviews = 2
required_approvals = 1
auto_assign = true
# deploy_environment = "production"

[workflow.quality]
completeness = 80.0
consistency = 85.0
format = 95.0
max_length = 500

[sync]
default_languages = []
default_namespaces = []
estimated_ms_per_file = 100

[notifications]
# webhook_url_env = "L10NFLOW_WEBHOOK_URL"
recipients = []
channels = []

[[environments]]
name = "staging"
type = "staging"
base_url = "https://staging.example.com"
source_path = "locales"
deployment_path = "deploy/staging"

[[environments]]
name = "production"
type = "production"
base_url = "https://www.example.com"
source_path = "locales"
deployment_path = "deploy/production"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!(
            "Default configuration written to {}",
            output.display()
        ))
    );
    println!();
    println!("Next steps:");
    println!("  1. Point locales_dir and the environment paths at your resource files");
    println!("  2. Set L10NFLOW_WEBHOOK_URL if you enable webhook notifications");
    println!(
        "  3. Validate with: l10nflow validate --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    // Missing env vars only warn.
    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Data directory : {}", config.store.data_dir.display());
    println!("  Locales        : {}", config.store.locales_dir.display());
    println!("  Default branch : {}", config.versioning.default_branch);
    println!(
        "  Reviews        : {} review(s), {} approval(s)",
        config.workflow.required_reviews, config.workflow.required_approvals
    );
    println!(
        "  Deploy step    : {}",
        config
            .workflow
            .deploy_environment
            .as_deref()
            .unwrap_or("disabled")
    );
    println!(
        "  Webhook        : {}",
        if config.notifications.webhook_url.is_some() {
            "set"
        } else {
            "not set"
        }
    );
    for env in &config.environments {
        println!(
            "  Environment    : {} ({}) -> {}",
            env.name,
            env.env_type,
            env.deployment_path.display()
        );
    }
    println!();
    println!("{}", style::success("Configuration is valid."));

    Ok(())
}

fn cmd_audit(db: &Database, limit: u32) -> Result<()> {
    let entries = db
        .list_audit_log(limit)
        .context("failed to list audit entries")?;

    if entries.is_empty() {
        println!("No audit log entries found.");
        return Ok(());
    }

    let mut table = style::table(&["Timestamp", "Action", "Subject", "Actor", "Details"]);
    for entry in &entries {
        let action = if entry.success {
            entry.action.clone()
        } else {
            style::status("failed") + " " + &entry.action
        };
        table.add_row(vec![
            entry.created_at.clone(),
            action,
            entry.subject.clone().unwrap_or_default(),
            entry.actor.clone().unwrap_or_default(),
            style::truncate(entry.details.as_deref().unwrap_or(""), 50),
        ]);
    }
    println!("{table}");
    println!("{}", style::dim(&format!("{} entries shown", entries.len())));

    Ok(())
}
