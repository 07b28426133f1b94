//! l10nflow core library.
//!
//! This crate provides the components behind the localized string-table
//! lifecycle: content-addressed versioning with branches, tags and merges,
//! a dependency-gated review workflow, and backup-guarded deployment to
//! named environments. Services are constructed explicitly and shared
//! through `Arc` handles.

pub mod config;
pub mod conflict;
pub mod db;
pub mod deploy;
pub mod errors;
pub mod lock;
pub mod models;
pub mod notify;
pub mod resource;
pub mod store;
pub mod version;
pub mod workflow;

// Re-exports for convenience.
pub use config::AppConfig;
pub use db::Database;
pub use deploy::SyncManager;
pub use errors::CoreError;
pub use notify::Notifier;
pub use store::ContentStore;
pub use version::VersionManager;
pub use workflow::WorkflowEngine;
