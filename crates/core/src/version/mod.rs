//! Version manager: content-addressed versions, branches, tags and conflicts.
//!
//! Every version is an immutable record over a snapshot held in the
//! [`ContentStore`]. Each branch keeps an append-only history log; a branch
//! forked from another sees the source's history up to the fork point plus
//! its own entries (its *lineage*). The parent of a new version is the
//! newest lineage entry for the same (locale, namespace).

pub mod diff;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::VersioningConfig;
use crate::conflict::{
    ConflictDetector, ConflictRecord, ConflictResolver, ConflictStatus, ResolutionRequest,
};
use crate::db::queries::HistoryRow;
use crate::db::Database;
use crate::errors::{ConflictError, StoreError, VersionError};
use crate::models::{
    new_id, AuditEntry, Branch, Change, ChangeType, ReviewStatus, Severity, Tag, TaggedFile,
    Version, VersionMetadata, VersionNumber,
};
use crate::notify::{LifecycleEvent, Notifier};
use crate::resource::{ResourceFile, ResourceTree};
use crate::store::{digest_file, ContentStore};

pub use diff::{DiffReport, DiffStatistics};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Outcome of [`VersionManager::validate_version`] when integrity holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionValidation {
    pub version_id: String,
    pub hash: String,
    pub warnings: Vec<String>,
}

/// Outcome of a successful [`VersionManager::merge_branch`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeSummary {
    pub source: String,
    pub target: String,
    /// Versions appended to the target branch.
    pub versions: Vec<Version>,
    pub conflicts_resolved: usize,
}

/// Activity summary for one (locale, namespace) on a branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionStatistics {
    pub total_versions: usize,
    pub average_changes: f64,
    /// Up to five `(author, versions)` pairs, busiest first.
    pub top_authors: Vec<(String, usize)>,
    pub change_types: BTreeMap<String, usize>,
    /// `YYYY-MM-DD` to versions created that day.
    pub daily_activity: BTreeMap<String, usize>,
}

enum Origin<'a> {
    Edit(&'a str),
    Rollback(&'a Version),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates and queries versions. Construct once and share through an `Arc`.
pub struct VersionManager {
    db: Arc<Database>,
    store: ContentStore,
    notifier: Arc<Notifier>,
    default_branch: String,
}

impl VersionManager {
    /// Create the manager, making sure the default branch exists.
    pub fn new(
        db: Arc<Database>,
        store: ContentStore,
        notifier: Arc<Notifier>,
        config: &VersioningConfig,
    ) -> Result<Self, VersionError> {
        let manager = Self {
            db,
            store,
            notifier,
            default_branch: config.default_branch.clone(),
        };
        if manager.db.get_branch(&manager.default_branch)?.is_none() {
            let now = Utc::now();
            manager.db.insert_branch(&Branch {
                id: new_id("branch"),
                name: manager.default_branch.clone(),
                description: "default branch".into(),
                source: None,
                head: None,
                forked_at: None,
                created_at: now,
                updated_at: now,
                is_default: true,
            })?;
            info!(branch = %manager.default_branch, "created default branch");
        }
        Ok(manager)
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    fn branch(&self, name: &str) -> Result<Branch, VersionError> {
        self.db
            .get_branch(name)?
            .ok_or_else(|| VersionError::BranchNotFound(name.to_string()))
    }

    fn branch_or_default<'a>(&'a self, name: Option<&'a str>) -> &'a str {
        name.unwrap_or(&self.default_branch)
    }

    /// History visible to `branch`, oldest first.
    fn lineage(
        &self,
        branch: &str,
        scope: Option<(&str, &str)>,
        max_id: Option<i64>,
    ) -> Result<Vec<HistoryRow>, VersionError> {
        let info = self.branch(branch)?;
        let mut rows = Vec::new();
        if let (Some(source), Some(forked_at)) = (info.source.as_deref(), info.forked_at) {
            let cap = max_id.map_or(forked_at, |m| m.min(forked_at));
            rows = self.lineage(source, scope, Some(cap))?;
        }
        rows.extend(self.db.branch_history(branch, scope, max_id)?);
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    /// Newest lineage entry per (locale, namespace).
    fn heads(&self, branch: &str) -> Result<BTreeMap<(String, String), HistoryRow>, VersionError> {
        let mut heads = BTreeMap::new();
        for row in self.lineage(branch, None, None)? {
            heads.insert((row.locale.clone(), row.namespace.clone()), row);
        }
        Ok(heads)
    }

    // -- versions -----------------------------------------------------------

    /// Get a version by id.
    pub fn get_version(&self, id: &str) -> Result<Version, VersionError> {
        self.db
            .get_version(id)?
            .ok_or_else(|| VersionError::VersionNotFound(id.to_string()))
    }

    /// Exact snapshot bytes of a version.
    pub fn snapshot(&self, version: &Version) -> Result<Vec<u8>, VersionError> {
        Ok(self.store.get(&version.hash)?)
    }

    fn snapshot_leaves(&self, version: &Version) -> Result<BTreeMap<String, Value>, VersionError> {
        let bytes = self.snapshot(version)?;
        Ok(ResourceTree::parse(&bytes, &version.id)?.leaves())
    }

    /// Version the current content of a resource file.
    pub fn create_version(
        &self,
        file: impl AsRef<Path>,
        author: &str,
        description: &str,
        branch: Option<&str>,
    ) -> Result<Version, VersionError> {
        let resource = ResourceFile::from_path(file.as_ref())?;
        if !resource.path.exists() {
            return Err(VersionError::SourceMissing(resource.path.display().to_string()));
        }
        let bytes = resource.read_bytes()?;
        let tree = ResourceTree::parse(&bytes, &resource.path.display().to_string())?;
        let branch = self.branch_or_default(branch);
        self.append_version(&resource, &bytes, &tree, author, branch, Origin::Edit(description))
    }

    fn append_version(
        &self,
        resource: &ResourceFile,
        bytes: &[u8],
        tree: &ResourceTree,
        author: &str,
        branch: &str,
        origin: Origin<'_>,
    ) -> Result<Version, VersionError> {
        let scope = (resource.locale.as_str(), resource.namespace.as_str());
        let lineage = self.lineage(branch, Some(scope), None)?;
        let parent = match lineage.last() {
            Some(row) => Some(self.get_version(&row.version_id)?),
            None => None,
        };

        let hash = self.store.put(bytes)?;
        let flat = tree.leaves();
        let parent_flat = parent
            .as_ref()
            .map(|p| self.snapshot_leaves(p))
            .transpose()?;
        let diff = diff::compute_changes(parent_flat.as_ref(), &flat);
        let (added_keys, modified_keys, deleted_keys) = diff::keys_by_type(&diff);

        let number = parent
            .as_ref()
            .and_then(|p| VersionNumber::parse(&p.version))
            .unwrap_or_default()
            .next_patch();

        let (changes, description, review_status, rollback_of) = match origin {
            Origin::Edit(description) => {
                (diff, description.to_string(), ReviewStatus::Pending, None)
            }
            Origin::Rollback(original) => {
                let change = match diff.first() {
                    Some(first) => Change {
                        change_type: ChangeType::Modify,
                        key: first.key.clone(),
                        old_value: first.old_value.clone(),
                        new_value: first.new_value.clone(),
                        severity: Severity::High,
                    },
                    None => Change {
                        change_type: ChangeType::Modify,
                        key: String::new(),
                        old_value: None,
                        new_value: None,
                        severity: Severity::High,
                    },
                };
                (
                    vec![change],
                    format!("Rollback to version {} ({})", original.version, original.id),
                    ReviewStatus::Approved,
                    Some(original.id.clone()),
                )
            }
        };

        let version = Version {
            id: new_id("version"),
            file_path: resource.path.display().to_string(),
            locale: resource.locale.clone(),
            namespace: resource.namespace.clone(),
            version: number.to_string(),
            timestamp: Utc::now(),
            author: author.to_string(),
            changes,
            hash,
            parent_hash: parent.as_ref().map(|p| p.hash.clone()),
            metadata: VersionMetadata {
                branch: branch.to_string(),
                description,
                size: bytes.len() as u64,
                key_count: flat.len(),
                added_keys,
                modified_keys,
                deleted_keys,
                review_status,
                rollback_of,
            },
        };

        self.db.record_version(&version, branch)?;
        info!(
            version_id = %version.id,
            locale = %version.locale,
            namespace = %version.namespace,
            version = %version.version,
            branch,
            changes = version.changes.len(),
            "created version"
        );
        self.notifier.emit(LifecycleEvent::VersionCreated {
            version_id: version.id.clone(),
            locale: version.locale.clone(),
            namespace: version.namespace.clone(),
            version: version.version.clone(),
            branch: branch.to_string(),
            changes: version.changes.len(),
        });
        Ok(version)
    }

    /// Versions of a (locale, namespace) visible on a branch, newest first.
    pub fn get_version_history(
        &self,
        locale: &str,
        namespace: &str,
        branch: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Version>, VersionError> {
        let branch = self.branch_or_default(branch);
        let rows = self.lineage(branch, Some((locale, namespace)), None)?;
        rows.iter()
            .rev()
            .take(limit)
            .map(|row| self.get_version(&row.version_id))
            .collect()
    }

    /// Write a version's exact bytes to `path`.
    pub fn checkout_version(&self, version_id: &str, path: &Path) -> Result<(), VersionError> {
        let version = self.get_version(version_id)?;
        let bytes = self.snapshot(&version)?;
        write_file(path, &bytes)?;
        info!(version_id, path = %path.display(), "checked out version");
        Ok(())
    }

    /// Restore a historical version and record the restore as a new version.
    ///
    /// The current file (if any) is first copied to `<path>.backup.<millis>`.
    /// History is never rewritten: the returned version is appended to the
    /// original version's branch with a single high-severity modify change.
    pub fn rollback_to_version(
        &self,
        version_id: &str,
        target_path: Option<&Path>,
        author: &str,
    ) -> Result<Version, VersionError> {
        let original = self.get_version(version_id)?;
        let target = target_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&original.file_path));

        if target.exists() {
            let backup = backup_path(&target, Utc::now().timestamp_millis());
            std::fs::copy(&target, &backup).map_err(StoreError::from)?;
            debug!(backup = %backup.display(), "backed up current file");
        }

        let bytes = self.snapshot(&original)?;
        write_file(&target, &bytes)?;
        let tree = ResourceTree::parse(&bytes, &original.id)?;

        let resource = ResourceFile {
            locale: original.locale.clone(),
            namespace: original.namespace.clone(),
            path: target.clone(),
        };
        let version = self.append_version(
            &resource,
            &bytes,
            &tree,
            author,
            &original.metadata.branch,
            Origin::Rollback(&original),
        )?;

        let _ = self.db.insert_audit_entry(
            &AuditEntry::success(
                "version_rollback",
                &format!("restored {} as {}", original.version, version.version),
            )
            .with_subject(&version.id)
            .with_actor(author),
        );
        info!(version_id, new_version = %version.id, "rolled back to version");
        Ok(version)
    }

    /// Check a version against the live file.
    ///
    /// A hash mismatch is an [`VersionError::Integrity`] error; a version
    /// number that did not increase over its predecessor and an empty change
    /// list are reported as warnings.
    pub fn validate_version(&self, version_id: &str) -> Result<VersionValidation, VersionError> {
        let version = self.get_version(version_id)?;
        let path = Path::new(&version.file_path);
        if !path.exists() {
            return Err(VersionError::SourceMissing(version.file_path.clone()));
        }

        let actual = digest_file(path)?;
        if actual != version.hash {
            warn!(version_id, stored = %version.hash, actual = %actual, "integrity check failed");
            return Err(VersionError::Integrity {
                version_id: version.id.clone(),
                stored: version.hash.clone(),
                actual,
            });
        }

        let mut warnings = Vec::new();
        if !self.store.contains(&version.hash) {
            warnings.push("snapshot is missing from the content store".to_string());
        }
        if version.changes.is_empty() {
            warnings.push("version records no changes".to_string());
        }

        let lineage = self.lineage(
            &version.metadata.branch,
            Some((&version.locale, &version.namespace)),
            None,
        )?;
        if let Some(pos) = lineage.iter().position(|r| r.version_id == version.id) {
            if pos > 0 {
                let prior = self.get_version(&lineage[pos - 1].version_id)?;
                let increased = match (
                    VersionNumber::parse(&prior.version),
                    VersionNumber::parse(&version.version),
                ) {
                    (Some(a), Some(b)) => b > a,
                    _ => false,
                };
                if !increased {
                    warnings.push(format!(
                        "version {} does not increase over prior {}",
                        version.version, prior.version
                    ));
                }
                if version.parent_hash.as_deref() != Some(prior.hash.as_str()) {
                    warnings.push("parent hash does not match the prior version".to_string());
                }
            }
        }

        for w in &warnings {
            warn!(version_id, warning = %w, "version validation warning");
        }
        Ok(VersionValidation {
            version_id: version.id,
            hash: version.hash,
            warnings,
        })
    }

    /// Differences between two versions.
    pub fn diff_report(&self, from_id: &str, to_id: &str) -> Result<DiffReport, VersionError> {
        let from = self.get_version(from_id)?;
        let to = self.get_version(to_id)?;
        let from_bytes = self.snapshot(&from)?;
        let to_bytes = self.snapshot(&to)?;
        let from_flat = ResourceTree::parse(&from_bytes, &from.id)?.leaves();
        let to_flat = ResourceTree::parse(&to_bytes, &to.id)?.leaves();
        Ok(diff::build_report(
            &from.version,
            &to.version,
            &from_bytes,
            &to_bytes,
            &from_flat,
            &to_flat,
        ))
    }

    /// Activity over the last `days` days.
    pub fn version_statistics(
        &self,
        locale: &str,
        namespace: &str,
        branch: Option<&str>,
        days: i64,
    ) -> Result<VersionStatistics, VersionError> {
        let cutoff = Utc::now() - Duration::days(days);
        let versions: Vec<Version> = self
            .get_version_history(locale, namespace, branch, usize::MAX)?
            .into_iter()
            .filter(|v| v.timestamp >= cutoff)
            .collect();

        let mut authors: HashMap<&str, usize> = HashMap::new();
        let mut change_types = BTreeMap::new();
        let mut daily_activity = BTreeMap::new();
        let mut total_changes = 0usize;
        for v in &versions {
            *authors.entry(v.author.as_str()).or_default() += 1;
            *daily_activity
                .entry(v.timestamp.format("%Y-%m-%d").to_string())
                .or_default() += 1;
            for c in &v.changes {
                *change_types.entry(c.change_type.to_string()).or_default() += 1;
            }
            total_changes += v.changes.len();
        }

        let mut top_authors: Vec<(String, usize)> = authors
            .into_iter()
            .map(|(a, n)| (a.to_string(), n))
            .collect();
        top_authors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_authors.truncate(5);

        Ok(VersionStatistics {
            total_versions: versions.len(),
            average_changes: if versions.is_empty() {
                0.0
            } else {
                total_changes as f64 / versions.len() as f64
            },
            top_authors,
            change_types,
            daily_activity,
        })
    }

    // -- conflicts ------------------------------------------------------------

    /// Compare two resource files key by key and record every conflict.
    pub fn detect_conflicts(
        &self,
        current_file: &Path,
        incoming_file: &Path,
    ) -> Result<Vec<ConflictRecord>, VersionError> {
        let current = read_existing(current_file)?;
        let incoming = read_existing(incoming_file)?;
        let conflicts = ConflictDetector::detect(
            &current.read_tree()?.leaves(),
            &incoming.read_tree()?.leaves(),
        );
        let scope = format!(
            "files:{}->{}",
            current_file.display(),
            incoming_file.display()
        );
        Ok(ConflictResolver::record(
            &self.db,
            &scope,
            &current.locale,
            &current.namespace,
            conflicts,
        )?)
    }

    /// Persist a resolution. The resource file is left untouched.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        request: &ResolutionRequest,
    ) -> Result<ConflictRecord, VersionError> {
        Ok(ConflictResolver::resolve(&self.db, conflict_id, request)?)
    }

    pub fn get_conflict(&self, conflict_id: &str) -> Result<ConflictRecord, VersionError> {
        self.db
            .get_conflict(conflict_id)?
            .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()).into())
    }

    pub fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRecord>, VersionError> {
        Ok(self.db.list_conflicts(status)?)
    }

    // -- branches & tags --------------------------------------------------------

    /// Fork a branch from `source` (default branch if `None`). Only the head
    /// pointer is copied; no files are touched.
    pub fn create_branch(
        &self,
        name: &str,
        source: Option<&str>,
        description: &str,
    ) -> Result<Branch, VersionError> {
        if self.db.get_branch(name)?.is_some() {
            return Err(VersionError::BranchExists(name.to_string()));
        }
        let source = self.branch(self.branch_or_default(source))?;
        let now = Utc::now();
        let branch = Branch {
            id: new_id("branch"),
            name: name.to_string(),
            description: description.to_string(),
            source: Some(source.name.clone()),
            head: source.head.clone(),
            forked_at: self.db.max_history_id()?,
            created_at: now,
            updated_at: now,
            is_default: false,
        };
        self.db.insert_branch(&branch)?;
        info!(branch = name, source = %source.name, head = ?branch.head, "created branch");
        Ok(branch)
    }

    pub fn list_branches(&self) -> Result<Vec<Branch>, VersionError> {
        Ok(self.db.list_branches()?)
    }

    /// Merge `source` into `target`.
    ///
    /// For every file whose heads differ, keys defined on both branches with
    /// different values must have a resolved conflict record for this merge
    /// scope. Otherwise the pending records are returned in
    /// [`VersionError::ConflictUnresolved`] and nothing is written.
    pub fn merge_branch(
        &self,
        source: &str,
        target: &str,
        author: &str,
    ) -> Result<MergeSummary, VersionError> {
        self.branch(source)?;
        self.branch(target)?;
        let source_heads = self.heads(source)?;
        let target_heads = self.heads(target)?;

        struct Planned {
            resource: ResourceFile,
            tree: ResourceTree,
        }
        let mut planned = Vec::new();
        let mut pending = Vec::new();
        let mut resolved_count = 0usize;

        for ((locale, namespace), src_row) in &source_heads {
            let src_version = self.get_version(&src_row.version_id)?;
            let tgt_version = match target_heads.get(&(locale.clone(), namespace.clone())) {
                Some(row) => Some(self.get_version(&row.version_id)?),
                None => None,
            };
            if tgt_version.as_ref().map(|t| &t.hash) == Some(&src_version.hash) {
                continue;
            }

            let src_flat = self.snapshot_leaves(&src_version)?;
            let Some(tgt_version) = tgt_version else {
                let bytes = self.snapshot(&src_version)?;
                planned.push(Planned {
                    resource: ResourceFile {
                        locale: locale.clone(),
                        namespace: namespace.clone(),
                        path: PathBuf::from(&src_version.file_path),
                    },
                    tree: ResourceTree::parse(&bytes, &src_version.id)?,
                });
                continue;
            };

            let tgt_bytes = self.snapshot(&tgt_version)?;
            let mut tree = ResourceTree::parse(&tgt_bytes, &tgt_version.id)?;
            let tgt_flat = tree.leaves();
            let scope = format!("merge:{source}->{target}:{locale}/{namespace}");

            for conflict in ConflictDetector::detect(&tgt_flat, &src_flat) {
                match self.db.find_resolved_conflict(
                    &scope,
                    &conflict.key,
                    &conflict.current,
                    &conflict.incoming,
                )? {
                    Some(record) => {
                        if let Some(value) = record.effective_value() {
                            tree.set(&conflict.key, value);
                        }
                        resolved_count += 1;
                    }
                    None => {
                        let record = match self.db.find_pending_conflict(
                            &scope,
                            &conflict.key,
                            &conflict.current,
                            &conflict.incoming,
                        )? {
                            Some(existing) => existing,
                            None => ConflictResolver::record(
                                &self.db,
                                &scope,
                                locale,
                                namespace,
                                vec![conflict],
                            )?
                            .remove(0),
                        };
                        pending.push(record);
                    }
                }
            }

            for (key, value) in &src_flat {
                if !tgt_flat.contains_key(key) {
                    tree.set_value(key, value.clone());
                }
            }
            if tree.leaves() != tgt_flat {
                planned.push(Planned {
                    resource: ResourceFile {
                        locale: locale.clone(),
                        namespace: namespace.clone(),
                        path: PathBuf::from(&tgt_version.file_path),
                    },
                    tree,
                });
            }
        }

        if !pending.is_empty() {
            warn!(source, target, pending = pending.len(), "merge blocked by conflicts");
            return Err(VersionError::ConflictUnresolved { pending });
        }

        let mut versions = Vec::new();
        for plan in planned {
            let bytes = plan.tree.to_pretty_bytes();
            plan.resource.write_bytes(&bytes)?;
            versions.push(self.append_version(
                &plan.resource,
                &bytes,
                &plan.tree,
                author,
                target,
                Origin::Edit(&format!("Merge {source} into {target}")),
            )?);
        }

        let _ = self.db.insert_audit_entry(
            &AuditEntry::success(
                "branch_merged",
                &format!("{source} -> {target}: {} file(s)", versions.len()),
            )
            .with_actor(author),
        );
        info!(source, target, files = versions.len(), "merged branch");
        Ok(MergeSummary {
            source: source.to_string(),
            target: target.to_string(),
            versions,
            conflicts_resolved: resolved_count,
        })
    }

    /// Mark the current heads of `branch` with an immutable tag.
    pub fn create_tag(
        &self,
        name: &str,
        release: &str,
        branch: Option<&str>,
        message: &str,
        author: &str,
    ) -> Result<Tag, VersionError> {
        if self.db.get_tag(name)?.is_some() {
            return Err(VersionError::TagExists(name.to_string()));
        }
        let branch = self.branch_or_default(branch);
        let mut files = Vec::new();
        for row in self.heads(branch)?.into_values() {
            let version = self.get_version(&row.version_id)?;
            files.push(TaggedFile {
                locale: version.locale,
                namespace: version.namespace,
                version_id: version.id,
                hash: version.hash,
            });
        }
        let tag = Tag {
            name: name.to_string(),
            version: release.to_string(),
            branch: branch.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            author: author.to_string(),
            files,
        };
        self.db.insert_tag(&tag)?;
        info!(tag = name, branch, files = tag.files.len(), "created tag");
        Ok(tag)
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>, VersionError> {
        Ok(self.db.list_tags()?)
    }
}

fn read_existing(path: &Path) -> Result<ResourceFile, VersionError> {
    let resource = ResourceFile::from_path(path)?;
    if !resource.path.exists() {
        return Err(VersionError::SourceMissing(path.display().to_string()));
    }
    Ok(resource)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// `<path>.backup.<stamp>`
pub fn backup_path(path: &Path, stamp: impl std::fmt::Display) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".backup.{stamp}"));
    PathBuf::from(name)
}
