//! External collaborators of the workflow engine: the quality scorer, the
//! assignment policy and the actor directory they work over.
//!
//! Both traits are object-safe so the engine can hold them as
//! `Arc<dyn QualityScorer>` / `Arc<dyn AssignmentPolicy>`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Actors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Translator,
    Reviewer,
    Approver,
    Manager,
    Admin,
}

impl Role {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "translator" => Some(Self::Translator),
            "reviewer" => Some(Self::Reviewer),
            "approver" => Some(Self::Approver),
            "manager" => Some(Self::Manager),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Roles allowed to sign off a review step.
    pub fn may_review(self) -> bool {
        matches!(self, Self::Reviewer | Self::Approver | Self::Manager | Self::Admin)
    }

    /// Roles allowed to sign off an approval step.
    pub fn may_approve(self) -> bool {
        matches!(self, Self::Approver | Self::Admin)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Translator => write!(f, "translator"),
            Self::Reviewer => write!(f, "reviewer"),
            Self::Approver => write!(f, "approver"),
            Self::Manager => write!(f, "manager"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// A person who can be assigned workflow steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    /// Locale codes; `fr` covers every `fr-*` locale.
    pub languages: Vec<String>,
    pub available: bool,
    /// Open assignments.
    pub workload: u32,
}

impl Actor {
    /// Whether the actor works in `locale`.
    pub fn speaks(&self, locale: &str) -> bool {
        let base = base_language(locale);
        self.languages
            .iter()
            .any(|l| l == locale || (!l.contains('-') && l == base))
    }
}

fn base_language(locale: &str) -> &str {
    locale.split('-').next().unwrap_or(locale)
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// Chooses who gets a step.
pub trait AssignmentPolicy: Send + Sync {
    fn choose<'a>(&self, candidates: &'a [Actor], role: Role, locale: &str) -> Option<&'a Actor>;
}

/// Picks the available actor with the matching role and language that has
/// the lowest workload. Ties go to the smallest id.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoadedPolicy;

impl AssignmentPolicy for LeastLoadedPolicy {
    fn choose<'a>(&self, candidates: &'a [Actor], role: Role, locale: &str) -> Option<&'a Actor> {
        candidates
            .iter()
            .filter(|a| a.available && a.role == role && a.speaks(locale))
            .min_by(|a, b| a.workload.cmp(&b.workload).then_with(|| a.id.cmp(&b.id)))
    }
}

// ---------------------------------------------------------------------------
// Quality scoring
// ---------------------------------------------------------------------------

/// Per-dimension scores, each 0 to 100.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityDimensions {
    pub completeness: f64,
    pub consistency: f64,
    pub format: f64,
    pub length: f64,
}

/// Scorer output for one key.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityAssessment {
    pub overall_score: f64,
    pub dimensions: QualityDimensions,
    pub issues: Vec<String>,
}

/// Pure, side-effect-free scoring of a translated value against its source.
pub trait QualityScorer: Send + Sync {
    fn score(
        &self,
        source_text: &str,
        translated_text: &str,
        source_locale: &str,
        target_locale: &str,
    ) -> QualityAssessment;
}

/// Heuristic scorer: non-empty translation, placeholder parity, whitespace
/// framing and a plausible length ratio.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicScorer;

impl QualityScorer for BasicScorer {
    fn score(
        &self,
        source_text: &str,
        translated_text: &str,
        source_locale: &str,
        target_locale: &str,
    ) -> QualityAssessment {
        let mut issues = Vec::new();

        let completeness = if translated_text.trim().is_empty() {
            issues.push("translation is empty".to_string());
            0.0
        } else if translated_text == source_text
            && !source_text.trim().is_empty()
            && base_language(source_locale) != base_language(target_locale)
        {
            issues.push("translation is identical to the source".to_string());
            50.0
        } else {
            100.0
        };

        let source_vars = placeholders(source_text);
        let translated_vars = placeholders(translated_text);
        let consistency = if source_vars.is_empty() && translated_vars.is_empty() {
            100.0
        } else {
            let total = source_vars.len().max(translated_vars.len());
            let matched = source_vars
                .iter()
                .filter(|v| translated_vars.contains(v))
                .count();
            if matched < total {
                issues.push(format!(
                    "placeholder mismatch: source {source_vars:?}, translation {translated_vars:?}"
                ));
            }
            100.0 * matched as f64 / total as f64
        };

        let mut format = 100.0;
        let leading = |s: &str| s.starts_with(char::is_whitespace);
        let trailing = |s: &str| s.ends_with(char::is_whitespace);
        if leading(source_text) != leading(translated_text) {
            format -= 50.0;
            issues.push("leading whitespace differs".to_string());
        }
        if trailing(source_text) != trailing(translated_text) {
            format -= 50.0;
            issues.push("trailing whitespace differs".to_string());
        }

        let source_len = source_text.chars().count().max(1) as f64;
        let ratio = translated_text.chars().count() as f64 / source_len;
        let length = if (0.5..=2.0).contains(&ratio) {
            100.0
        } else if ratio < 0.5 {
            (ratio / 0.5 * 100.0).max(0.0)
        } else {
            (2.0 / ratio * 100.0).max(0.0)
        };

        let dimensions = QualityDimensions {
            completeness,
            consistency,
            format,
            length,
        };
        QualityAssessment {
            overall_score: (completeness + consistency + format + length) / 4.0,
            dimensions,
            issues,
        }
    }
}

/// Placeholder names in `{{name}}` or `{name}` form, sorted.
fn placeholders(text: &str) -> Vec<String> {
    let Ok(re) = regex_lite::Regex::new(r"\{\{\s*(\w+)\s*\}\}|\{(\w+)\}") else {
        return Vec::new();
    };
    let mut names: Vec<String> = re
        .captures_iter(text)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)).map(|m| m.as_str().to_string()))
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(id: &str, role: Role, languages: &[&str], workload: u32, available: bool) -> Actor {
        Actor {
            id: id.into(),
            name: id.into(),
            email: format!("{id}@example.com"),
            role,
            languages: languages.iter().map(|l| l.to_string()).collect(),
            available,
            workload,
        }
    }

    #[test]
    fn test_least_loaded_picks_lowest_workload() {
        let actors = vec![
            actor("t1", Role::Translator, &["fr-FR"], 3, true),
            actor("t2", Role::Translator, &["fr"], 1, true),
            actor("t3", Role::Translator, &["fr-FR"], 0, false),
            actor("t4", Role::Translator, &["de-DE"], 0, true),
            actor("r1", Role::Reviewer, &["fr-FR"], 0, true),
        ];
        let chosen = LeastLoadedPolicy.choose(&actors, Role::Translator, "fr-FR");
        assert_eq!(chosen.map(|a| a.id.as_str()), Some("t2"));
        assert!(LeastLoadedPolicy.choose(&actors, Role::Translator, "ja-JP").is_none());
    }

    #[test]
    fn test_role_permissions() {
        assert!(Role::Reviewer.may_review());
        assert!(!Role::Reviewer.may_approve());
        assert!(Role::Admin.may_approve());
        assert!(!Role::Translator.may_review());
    }

    #[test]
    fn test_basic_scorer_good_translation() {
        let a = BasicScorer.score("Hello {{name}}", "Bonjour {{name}}", "en-US", "fr-FR");
        assert_eq!(a.dimensions.completeness, 100.0);
        assert_eq!(a.dimensions.consistency, 100.0);
        assert_eq!(a.dimensions.format, 100.0);
        assert!(a.issues.is_empty());
    }

    #[test]
    fn test_basic_scorer_flags_problems() {
        let empty = BasicScorer.score("Hello", "", "en-US", "fr-FR");
        assert_eq!(empty.dimensions.completeness, 0.0);

        let missing_var = BasicScorer.score("Hi {name}", "Salut", "en-US", "fr-FR");
        assert_eq!(missing_var.dimensions.consistency, 0.0);

        let spaced = BasicScorer.score("Hi", " Salut ", "en-US", "fr-FR");
        assert_eq!(spaced.dimensions.format, 0.0);

        let same = BasicScorer.score("OK", "OK", "en-US", "fr-FR");
        assert_eq!(same.dimensions.completeness, 50.0);
        let same_lang = BasicScorer.score("OK", "OK", "en-US", "en-GB");
        assert_eq!(same_lang.dimensions.completeness, 100.0);
    }
}
