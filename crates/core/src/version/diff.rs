//! Per-key diffing of flattened snapshots and human-facing diff reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Change, ChangeType, Severity};
use crate::resource::value_text;

/// Diff `new` against `parent`, both as typed leaves.
///
/// Values are compared as JSON, so a number turning into the same-looking
/// string is a modification. Output order is modifications, then additions,
/// then deletions, each in key order. Without a parent every key is an
/// addition of low severity.
pub fn compute_changes(
    parent: Option<&BTreeMap<String, Value>>,
    new: &BTreeMap<String, Value>,
) -> Vec<Change> {
    let Some(parent) = parent else {
        return new
            .iter()
            .map(|(key, value)| Change {
                change_type: ChangeType::Add,
                key: key.clone(),
                old_value: None,
                new_value: Some(value_text(value)),
                severity: Severity::Low,
            })
            .collect();
    };

    let mut modified = Vec::new();
    let mut added = Vec::new();
    for (key, value) in new {
        match parent.get(key) {
            Some(old) if old != value => modified.push(Change {
                change_type: ChangeType::Modify,
                key: key.clone(),
                old_value: Some(value_text(old)),
                new_value: Some(value_text(value)),
                severity: Severity::Medium,
            }),
            Some(_) => {}
            None => added.push(Change {
                change_type: ChangeType::Add,
                key: key.clone(),
                old_value: None,
                new_value: Some(value_text(value)),
                severity: Severity::Medium,
            }),
        }
    }
    let deleted = parent
        .iter()
        .filter(|(key, _)| !new.contains_key(*key))
        .map(|(key, old)| Change {
            change_type: ChangeType::Delete,
            key: key.clone(),
            old_value: Some(value_text(old)),
            new_value: None,
            severity: Severity::High,
        });

    modified.into_iter().chain(added).chain(deleted).collect()
}

/// Keys of each change type, for version metadata.
pub fn keys_by_type(changes: &[Change]) -> (Vec<String>, Vec<String>, Vec<String>) {
    let pick = |t: ChangeType| {
        changes
            .iter()
            .filter(|c| c.change_type == t)
            .map(|c| c.key.clone())
            .collect::<Vec<_>>()
    };
    (
        pick(ChangeType::Add),
        pick(ChangeType::Modify),
        pick(ChangeType::Delete),
    )
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn for_change_count(total: usize) -> Self {
        match total {
            0..=10 => Self::Low,
            11..=20 => Self::Medium,
            _ => Self::High,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModifiedKey {
    pub key: String,
    pub old_value: String,
    pub new_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffStatistics {
    pub total_changes: usize,
    pub files_affected: usize,
    pub complexity: Complexity,
}

/// Everything that differs between two versions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffReport {
    pub from_version: String,
    pub to_version: String,
    pub added: Vec<String>,
    pub modified: Vec<ModifiedKey>,
    pub deleted: Vec<String>,
    pub statistics: DiffStatistics,
    /// Unified diff of the two snapshots' text.
    pub patch: String,
}

/// Build a report from two snapshots.
pub fn build_report(
    from_version: &str,
    to_version: &str,
    from: &[u8],
    to: &[u8],
    from_flat: &BTreeMap<String, Value>,
    to_flat: &BTreeMap<String, Value>,
) -> DiffReport {
    let changes = compute_changes(Some(from_flat), to_flat);
    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut deleted = Vec::new();
    for change in &changes {
        match change.change_type {
            ChangeType::Add => added.push(change.key.clone()),
            ChangeType::Delete => deleted.push(change.key.clone()),
            ChangeType::Modify | ChangeType::Rename => modified.push(ModifiedKey {
                key: change.key.clone(),
                old_value: change.old_value.clone().unwrap_or_default(),
                new_value: change.new_value.clone().unwrap_or_default(),
            }),
        }
    }

    let from_text = String::from_utf8_lossy(from);
    let to_text = String::from_utf8_lossy(to);
    let patch = diffy::create_patch(&from_text, &to_text).to_string();

    DiffReport {
        from_version: from_version.to_string(),
        to_version: to_version.to_string(),
        statistics: DiffStatistics {
            total_changes: changes.len(),
            files_affected: usize::from(!changes.is_empty()),
            complexity: Complexity::for_change_count(changes.len()),
        },
        added,
        modified,
        deleted,
        patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_first_version_all_adds_low() {
        let changes = compute_changes(None, &map(&[("a", "1"), ("b", "2")]));
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| c.change_type == ChangeType::Add && c.severity == Severity::Low));
    }

    #[test]
    fn test_modify_before_add_before_delete() {
        let parent = map(&[("greeting", "hi"), ("gone", "x"), ("same", "s")]);
        let new = map(&[("greeting", "hello"), ("farewell", "bye"), ("same", "s")]);
        let changes = compute_changes(Some(&parent), &new);
        let summary: Vec<(ChangeType, &str, Severity)> = changes
            .iter()
            .map(|c| (c.change_type, c.key.as_str(), c.severity))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeType::Modify, "greeting", Severity::Medium),
                (ChangeType::Add, "farewell", Severity::Medium),
                (ChangeType::Delete, "gone", Severity::High),
            ]
        );
    }

    #[test]
    fn test_type_change_is_a_modification() {
        let parent: BTreeMap<String, Value> = [
            ("n".to_string(), json!(1)),
            ("flag".to_string(), json!(true)),
            ("empty".to_string(), json!(null)),
            ("same".to_string(), json!(2)),
        ]
        .into();
        let new: BTreeMap<String, Value> = [
            ("n".to_string(), json!("1")),
            ("flag".to_string(), json!("true")),
            ("empty".to_string(), json!("null")),
            ("same".to_string(), json!(2)),
        ]
        .into();
        let changes = compute_changes(Some(&parent), &new);
        let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["empty", "flag", "n"]);
        assert!(changes.iter().all(|c| c.change_type == ChangeType::Modify));
        assert_eq!(changes[2].new_value.as_deref(), Some("1"));
    }

    #[test]
    fn test_report_statistics_and_patch() {
        let from = b"{\n  \"greeting\": \"hi\"\n}\n";
        let to = b"{\n  \"greeting\": \"hello\"\n}\n";
        let report = build_report(
            "v1",
            "v2",
            from,
            to,
            &map(&[("greeting", "hi")]),
            &map(&[("greeting", "hello")]),
        );
        assert_eq!(report.modified.len(), 1);
        assert_eq!(report.statistics.total_changes, 1);
        assert_eq!(report.statistics.complexity, Complexity::Low);
        assert!(report.patch.contains("-  \"greeting\": \"hi\""));
        assert!(report.patch.contains("+  \"greeting\": \"hello\""));
    }

    #[test]
    fn test_complexity_bands() {
        assert_eq!(Complexity::for_change_count(10), Complexity::Low);
        assert_eq!(Complexity::for_change_count(11), Complexity::Medium);
        assert_eq!(Complexity::for_change_count(21), Complexity::High);
    }
}
