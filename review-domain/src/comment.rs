//! Review comments produced by the AI pipeline or by humans.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Comment severity. Unknown spellings coming back from a model are mapped
/// to [`Severity::Info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Tolerant mapping from free-form model output.
    pub fn from_loose(s: &str) -> Severity {
        match s.trim().to_ascii_lowercase().as_str() {
            "warning" | "warn" => Severity::Warning,
            "error" => Severity::Error,
            "critical" | "blocker" => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

/// Comment category. Unknown spellings map to [`Category::Quality`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Quality,
    Security,
    Performance,
    Style,
    Bug,
    Documentation,
}

impl Category {
    pub fn from_loose(s: &str) -> Category {
        match s.trim().to_ascii_lowercase().as_str() {
            "security" => Category::Security,
            "performance" | "perf" => Category::Performance,
            "style" | "formatting" => Category::Style,
            "bug" | "correctness" => Category::Bug,
            "documentation" | "docs" => Category::Documentation,
            _ => Category::Quality,
        }
    }
}

/// One review comment. Immutable after creation except for deletion by its
/// author or a project admin (a repository concern, not modeled here).
///
/// `line_number`, when present, anchors to a line on the *new* side of the
/// diff for `file_path`; the parser drops anchors that point outside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: i64,
    pub review_id: i64,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub severity: Severity,
    pub category: Category,
    pub content: String,
    pub suggestion: Option<String>,
    pub is_ai_generated: bool,
    pub author_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loose_severity_defaults_to_info() {
        assert_eq!(Severity::from_loose("WARNING"), Severity::Warning);
        assert_eq!(Severity::from_loose("Critical"), Severity::Critical);
        assert_eq!(Severity::from_loose("nitpick"), Severity::Info);
        assert_eq!(Severity::from_loose(""), Severity::Info);
    }

    #[test]
    fn loose_category_defaults_to_quality() {
        assert_eq!(Category::from_loose("perf"), Category::Performance);
        assert_eq!(Category::from_loose("docs"), Category::Documentation);
        assert_eq!(Category::from_loose("vibes"), Category::Quality);
    }
}
