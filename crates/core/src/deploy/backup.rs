//! Environment backups and the file-level helpers deployments share.
//!
//! A backup is a directory `<backups>/<backup_id>/` holding a copy of every
//! resource file deployed to an environment plus a `metadata.json` record.

use std::fs;
use std::io;
use std::path::Path;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::models::{new_id, BackupRecord, EnvironmentConfig};

/// Name of the metadata file inside a backup directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Resource files under a locales root, as sorted `<locale>/<namespace>.json`
/// relative paths. Sidecars and anything not two levels deep are ignored.
pub fn resource_files(root: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    if !root.is_dir() {
        return Ok(files);
    }
    for locale in fs::read_dir(root)? {
        let locale = locale?;
        if !locale.file_type()?.is_dir() {
            continue;
        }
        let locale_name = locale.file_name().to_string_lossy().into_owned();
        for file in fs::read_dir(locale.path())? {
            let file = file?;
            let path = file.path();
            if file.file_type()?.is_file() && path.extension().is_some_and(|e| e == "json") {
                files.push(format!(
                    "{locale_name}/{}",
                    file.file_name().to_string_lossy()
                ));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Copy `root/rel` to `dest_root/rel`, creating directories. Returns bytes copied.
pub fn copy_relative(root: &Path, dest_root: &Path, rel: &str) -> io::Result<u64> {
    let dest = dest_root.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(root.join(rel), dest)
}

/// Copy every deployed file of `env` into a fresh backup directory.
///
/// A partially written backup directory is removed before the error is
/// returned.
pub fn create_backup(
    backups_dir: &Path,
    env: &EnvironmentConfig,
    description: &str,
) -> Result<BackupRecord, DeployError> {
    let id = new_id("backup");
    let dir = backups_dir.join(&id);
    match write_backup(&dir, &id, env, description) {
        Ok(record) => {
            info!(
                backup_id = %record.id,
                environment = %env.name,
                files = record.files.len(),
                bytes = record.total_bytes,
                "created backup"
            );
            Ok(record)
        }
        Err(e) => {
            if dir.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %cleanup, "failed to clean up partial backup");
                }
            }
            Err(e)
        }
    }
}

fn write_backup(
    dir: &Path,
    id: &str,
    env: &EnvironmentConfig,
    description: &str,
) -> Result<BackupRecord, DeployError> {
    fs::create_dir_all(dir)?;
    let files = resource_files(&env.deployment_path)?;
    let mut total_bytes = 0;
    for rel in &files {
        total_bytes += copy_relative(&env.deployment_path, dir, rel)?;
    }
    let record = BackupRecord {
        id: id.to_string(),
        environment: env.name.clone(),
        created_at: Utc::now(),
        path: dir.to_path_buf(),
        files,
        total_bytes,
        description: description.to_string(),
    };
    let metadata = serde_json::to_vec_pretty(&record)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(dir.join(METADATA_FILE), metadata)?;
    Ok(record)
}

/// Files restored and removed by [`restore_backup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub files_restored: usize,
    pub files_removed: usize,
    pub errors: Vec<String>,
}

/// Make the deployment path's resource file set equal the backup.
///
/// Per-file failures are collected; the rest of the batch still runs.
pub fn restore_backup(env: &EnvironmentConfig, backup: &BackupRecord) -> RestoreSummary {
    let mut summary = RestoreSummary::default();

    match resource_files(&env.deployment_path) {
        Ok(current) => {
            for rel in current.iter().filter(|rel| !backup.files.contains(rel)) {
                match fs::remove_file(env.deployment_path.join(rel)) {
                    Ok(()) => summary.files_removed += 1,
                    Err(e) => summary.errors.push(format!("{rel}: {e}")),
                }
            }
        }
        Err(e) => summary
            .errors
            .push(format!("{}: {e}", env.deployment_path.display())),
    }

    for rel in &backup.files {
        match copy_relative(&backup.path, &env.deployment_path, rel) {
            Ok(_) => summary.files_restored += 1,
            Err(e) => summary.errors.push(format!("{rel}: {e}")),
        }
    }

    debug!(
        backup_id = %backup.id,
        restored = summary.files_restored,
        removed = summary.files_removed,
        errors = summary.errors.len(),
        "restored backup"
    );
    summary
}

/// Delete a backup directory. A directory that is already gone is fine.
pub fn remove_backup_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnvironmentFeatures, EnvironmentType};

    fn env(root: &Path) -> EnvironmentConfig {
        EnvironmentConfig {
            name: "staging".into(),
            env_type: EnvironmentType::Staging,
            base_url: String::new(),
            source_path: root.join("src"),
            deployment_path: root.join("deployed"),
            features: EnvironmentFeatures::default(),
        }
    }

    fn put(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_resource_files_skip_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        put(dir.path(), "en-US/common.json", "{}");
        put(dir.path(), "en-US/common.json.backup.deploy_1", "{}");
        put(dir.path(), "fr-FR/app.json", "{}");
        put(dir.path(), "stray.json", "{}");
        assert_eq!(
            resource_files(dir.path()).unwrap(),
            vec!["en-US/common.json".to_string(), "fr-FR/app.json".to_string()]
        );
        assert!(resource_files(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_backup_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path());
        put(&env.deployment_path, "en-US/common.json", r#"{"a":"1"}"#);

        let backup = create_backup(&dir.path().join("backups"), &env, "pre-deploy").unwrap();
        assert_eq!(backup.files, vec!["en-US/common.json".to_string()]);
        assert!(backup.path.join(METADATA_FILE).exists());

        put(&env.deployment_path, "en-US/common.json", r#"{"a":"2"}"#);
        put(&env.deployment_path, "de-DE/common.json", r#"{"a":"3"}"#);

        let summary = restore_backup(&env, &backup);
        assert_eq!(summary.files_restored, 1);
        assert_eq!(summary.files_removed, 1);
        assert!(summary.errors.is_empty());
        assert_eq!(
            fs::read_to_string(env.deployment_path.join("en-US/common.json")).unwrap(),
            r#"{"a":"1"}"#
        );
        assert!(!env.deployment_path.join("de-DE/common.json").exists());
    }

    #[test]
    fn test_remove_missing_backup_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_backup_dir(&dir.path().join("gone")).unwrap();
    }
}
