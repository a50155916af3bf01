//! Tolerant parsing of model output into typed results.
//!
//! Three stages: strict JSON, then the largest balanced `{…}`/`[…]`
//! fragment, then one repair round trip through the model. A chunk whose
//! output survives none of them is recorded as parse-failed and the job
//! moves on.
//!
//! Mapping clamps everything the schema constrains: unknown severities and
//! categories fall back to `Info`/`Quality`, risk scores clamp to 0–100,
//! confidences to 0–1, and a line number that does not exist on the new
//! side of the referenced file drops the anchor while keeping the comment.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use review_domain::{
    Category, ImprovementSuggestion, PullRequestSummary, ReviewComment, RiskAssessment, Severity,
};

use crate::prompts::SCHEMA_VERSION;

/// System instruction for the repair round trip.
pub const REPAIR_SYSTEM: &str = "The text you receive was supposed to be a single JSON object but \
     failed to parse. Return the corrected JSON object only, preserving the \
     original content as far as possible. No prose, no markdown fences.";

#[derive(Debug, Error)]
#[error("model output could not be parsed after repair")]
pub struct ParseFailed {
    /// Raw model text, kept for audit.
    pub raw: String,
}

/// A successfully decoded envelope plus its audit trail.
#[derive(Debug)]
pub struct Parsed<T> {
    pub value: T,
    /// Raw model text the value was decoded from.
    pub raw: String,
    /// Whether the repair round trip was needed.
    pub repaired: bool,
}

/// Envelopes carry an optional version marker; a mismatching marker fails
/// the stage rather than silently downgrading.
pub trait VersionTagged {
    fn schema_version(&self) -> Option<&str>;
}

macro_rules! version_tagged {
    ($ty:ty) => {
        impl VersionTagged for $ty {
            fn schema_version(&self) -> Option<&str> {
                self.schema_version.as_deref()
            }
        }
    };
}

/// Decode an envelope, falling back to one `repair` call on failure. The
/// repair closure returns the corrected text, or `None` when repair itself
/// failed.
pub async fn parse_envelope<T, F, Fut>(raw: &str, repair: F) -> Result<Parsed<T>, ParseFailed>
where
    T: DeserializeOwned + VersionTagged,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Option<String>>,
{
    if let Some(value) = decode_stages::<T>(raw) {
        return Ok(Parsed {
            value,
            raw: raw.to_string(),
            repaired: false,
        });
    }

    debug!("strict and fragment parses failed, attempting repair");
    let repaired_text = repair(raw.to_string()).await;
    if let Some(text) = repaired_text {
        if let Some(value) = decode_stages::<T>(&text) {
            return Ok(Parsed {
                value,
                raw: text,
                repaired: true,
            });
        }
    }
    Err(ParseFailed {
        raw: raw.to_string(),
    })
}

fn decode_stages<T: DeserializeOwned + VersionTagged>(raw: &str) -> Option<T> {
    let cleaned = strip_reasoning(raw);
    if let Ok(v) = serde_json::from_str::<T>(&cleaned) {
        if version_ok(&v) {
            return Some(v);
        }
        return None;
    }
    let fragment = extract_json_fragment(&cleaned)?;
    match serde_json::from_str::<T>(fragment) {
        Ok(v) if version_ok(&v) => Some(v),
        _ => None,
    }
}

/// Drop chain-of-thought traces some models wrap around their answer.
fn strip_reasoning(raw: &str) -> String {
    let re = Regex::new(r"(?s)<think>.*?</think>").unwrap();
    re.replace_all(raw, "").trim().to_string()
}

fn version_ok<T: VersionTagged>(v: &T) -> bool {
    match v.schema_version() {
        None => true,
        Some(version) => version == SCHEMA_VERSION,
    }
}

/// Largest balanced `{…}` or `[…]` substring, string-literal aware.
pub fn extract_json_fragment(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' || bytes[i] == b'[' {
            if let Some(end) = balanced_end(bytes, i) {
                if best.is_none_or(|(s, e)| end - i > e - s) {
                    best = Some((i, end));
                }
                // Nothing inside this span can be larger than the span.
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    best.map(|(s, e)| &raw[s..=e])
}

fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// --------------------------- envelopes ------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewEnvelope {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub comments: Vec<CommentItem>,
}
version_tagged!(ReviewEnvelope);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentItem {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub line_number: Option<i64>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskEnvelope {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub overall_risk_score: f64,
    #[serde(default)]
    pub complexity_risk: f64,
    #[serde(default)]
    pub security_risk: f64,
    #[serde(default)]
    pub performance_risk: f64,
    #[serde(default)]
    pub maintainability_risk: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mitigation: String,
    #[serde(default)]
    pub confidence: f64,
}
version_tagged!(RiskEnvelope);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementsEnvelope {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<SuggestionItem>,
}
version_tagged!(ImprovementsEnvelope);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionItem {
    #[serde(default, rename = "type")]
    pub suggestion_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub start_line: Option<i64>,
    #[serde(default)]
    pub end_line: Option<i64>,
    #[serde(default)]
    pub original_code: Option<String>,
    #[serde(default)]
    pub suggested_code: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub expected_benefits: Option<String>,
    #[serde(default)]
    pub implementation_complexity: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEnvelope {
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub business_impact: String,
    #[serde(default)]
    pub technical_impact: String,
    #[serde(default)]
    pub breaking_change_risk: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub detailed_description: String,
    #[serde(default)]
    pub key_changes: Vec<String>,
    #[serde(default)]
    pub impact_analysis: String,
    #[serde(default)]
    pub change_statistics: serde_json::Value,
    #[serde(default)]
    pub backward_compatibility: Option<String>,
    #[serde(default)]
    pub performance_impact: Option<String>,
    #[serde(default)]
    pub security_impact: Option<String>,
    #[serde(default)]
    pub testing_recommendations: Option<String>,
    #[serde(default)]
    pub deployment_considerations: Option<String>,
    #[serde(default)]
    pub documentation_requirements: Option<String>,
    #[serde(default)]
    pub dependency_changes: Option<String>,
}
version_tagged!(SummaryEnvelope);

// --------------------------- mapping --------------------------------------

fn clamp_score(v: f64) -> u8 {
    v.clamp(0.0, 100.0).round() as u8
}

fn clamp_confidence(v: f64) -> f32 {
    v.clamp(0.0, 1.0) as f32
}

/// Valid new-side line numbers per file path, built from the diff.
pub type LineIndex = HashMap<String, HashSet<u32>>;

fn validated_line(
    file_path: &Option<String>,
    line_number: Option<i64>,
    lines: &LineIndex,
) -> Option<u32> {
    let path = file_path.as_deref()?;
    let line = u32::try_from(line_number?).ok()?;
    lines.get(path).filter(|set| set.contains(&line))?;
    Some(line)
}

/// Map a review envelope onto comment rows. Empty-content entries are
/// dropped; out-of-range anchors survive without a line number.
pub fn map_review_comments(
    envelope: ReviewEnvelope,
    review_id: i64,
    lines: &LineIndex,
) -> Vec<ReviewComment> {
    envelope
        .comments
        .into_iter()
        .filter(|c| !c.content.trim().is_empty())
        .map(|c| {
            let line_number = validated_line(&c.file_path, c.line_number, lines);
            ReviewComment {
                id: 0,
                review_id,
                line_number,
                severity: c.severity.as_deref().map(Severity::from_loose).unwrap_or(Severity::Info),
                category: c
                    .category
                    .as_deref()
                    .map(Category::from_loose)
                    .unwrap_or(Category::Quality),
                file_path: c.file_path,
                content: c.content,
                suggestion: c.suggestion,
                is_ai_generated: true,
                author_name: None,
                created_at: Utc::now(),
            }
        })
        .collect()
}

pub fn map_risk(envelope: RiskEnvelope, review_id: i64, model_version: &str) -> RiskAssessment {
    RiskAssessment {
        review_id,
        overall_risk_score: clamp_score(envelope.overall_risk_score),
        complexity_risk: clamp_score(envelope.complexity_risk),
        security_risk: clamp_score(envelope.security_risk),
        performance_risk: clamp_score(envelope.performance_risk),
        maintainability_risk: clamp_score(envelope.maintainability_risk),
        risk_description: envelope.description,
        mitigation_suggestions: envelope.mitigation,
        confidence_score: clamp_confidence(envelope.confidence),
        ai_model_version: model_version.to_string(),
        created_at: Utc::now(),
    }
}

pub fn map_suggestions(
    envelope: ImprovementsEnvelope,
    review_id: i64,
) -> Vec<ImprovementSuggestion> {
    envelope
        .suggestions
        .into_iter()
        .filter(|s| !s.title.trim().is_empty() || !s.description.trim().is_empty())
        .map(|s| ImprovementSuggestion {
            id: 0,
            review_id,
            suggestion_type: s.suggestion_type.unwrap_or_else(|| "general".to_string()),
            priority: s.priority.unwrap_or_else(|| "medium".to_string()),
            title: s.title,
            description: s.description,
            file_path: s.file_path,
            start_line: s.start_line.and_then(|l| u32::try_from(l).ok()),
            end_line: s.end_line.and_then(|l| u32::try_from(l).ok()),
            original_code: s.original_code,
            suggested_code: s.suggested_code,
            reasoning: s.reasoning,
            expected_benefits: s.expected_benefits,
            implementation_complexity: s
                .implementation_complexity
                .map(|c| c.clamp(1.0, 10.0).round() as u8)
                .unwrap_or(5),
            confidence_score: s.confidence.map(clamp_confidence).unwrap_or(0.5),
        })
        .collect()
}

pub fn map_summary(envelope: SummaryEnvelope, review_id: i64) -> PullRequestSummary {
    PullRequestSummary {
        review_id,
        change_type: envelope.change_type,
        business_impact: envelope.business_impact,
        technical_impact: envelope.technical_impact,
        breaking_change_risk: envelope.breaking_change_risk,
        summary: envelope.summary,
        detailed_description: envelope.detailed_description,
        key_changes: envelope.key_changes,
        impact_analysis: envelope.impact_analysis,
        change_statistics: envelope.change_statistics,
        backward_compatibility: envelope.backward_compatibility,
        performance_impact: envelope.performance_impact,
        security_impact: envelope.security_impact,
        testing_recommendations: envelope.testing_recommendations,
        deployment_considerations: envelope.deployment_considerations,
        documentation_requirements: envelope.documentation_requirements,
        dependency_changes: envelope.dependency_changes,
        created_at: Utc::now(),
    }
}

/// Build the line index from a diff.
pub fn line_index(files: &[review_domain::DiffFile]) -> LineIndex {
    files
        .iter()
        .map(|f| (f.path.clone(), f.new_side_lines()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use review_domain::{DiffFile, DiffHunk, DiffLine, FileStatus};

    fn no_repair(_: String) -> std::future::Ready<Option<String>> {
        std::future::ready(None)
    }

    fn index_with(path: &str, lines: &[u32]) -> LineIndex {
        let mut idx = LineIndex::new();
        idx.insert(path.to_string(), lines.iter().copied().collect());
        idx
    }

    #[tokio::test]
    async fn strict_json_parses_losslessly() {
        let raw = r#"{"comments":[{"filePath":"a.go","lineNumber":12,"severity":"Warning","category":"Performance","content":"Avoid allocation in hot loop"}]}"#;
        let parsed: Parsed<ReviewEnvelope> = parse_envelope(raw, no_repair).await.unwrap();
        assert!(!parsed.repaired);

        let comments = map_review_comments(parsed.value, 42, &index_with("a.go", &[10, 11, 12]));
        assert_eq!(comments.len(), 1);
        let c = &comments[0];
        assert_eq!(c.file_path.as_deref(), Some("a.go"));
        assert_eq!(c.line_number, Some(12));
        assert_eq!(c.severity, Severity::Warning);
        assert_eq!(c.category, Category::Performance);
        assert_eq!(c.content, "Avoid allocation in hot loop");
        assert!(c.is_ai_generated);
    }

    #[tokio::test]
    async fn reasoning_traces_are_stripped() {
        let raw = "<think>the loop on line 3 looks hot</think>{\"comments\":[]}";
        let parsed: Parsed<ReviewEnvelope> = parse_envelope(raw, no_repair).await.unwrap();
        assert!(parsed.value.comments.is_empty());
        assert!(!parsed.repaired);
    }

    #[tokio::test]
    async fn prose_wrapped_json_is_recovered() {
        let raw = "Sure! Here is the review:\n```json\n{\"comments\":[{\"filePath\":\"a.rs\",\"content\":\"note\"}]}\n```\nHope this helps.";
        let parsed: Parsed<ReviewEnvelope> = parse_envelope(raw, no_repair).await.unwrap();
        assert_eq!(parsed.value.comments.len(), 1);
    }

    #[tokio::test]
    async fn repair_round_trip_is_used_once() {
        let raw = "completely broken : : output";
        let parsed: Parsed<ReviewEnvelope> = parse_envelope(raw, |_broken| async {
            Some(r#"{"comments":[]}"#.to_string())
        })
        .await
        .unwrap();
        assert!(parsed.repaired);
        assert!(parsed.value.comments.is_empty());
    }

    #[tokio::test]
    async fn unrepairable_output_fails() {
        let raw = "still broken";
        let err = parse_envelope::<ReviewEnvelope, _, _>(raw, |_b| async {
            Some("also broken".to_string())
        })
        .await
        .unwrap_err();
        assert_eq!(err.raw, "still broken");
    }

    #[tokio::test]
    async fn version_mismatch_is_refused() {
        let raw = r#"{"schemaVersion":"999","comments":[]}"#;
        assert!(
            parse_envelope::<ReviewEnvelope, _, _>(raw, no_repair)
                .await
                .is_err()
        );

        let raw_ok = r#"{"schemaVersion":"1","comments":[]}"#;
        assert!(
            parse_envelope::<ReviewEnvelope, _, _>(raw_ok, no_repair)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn out_of_range_line_keeps_the_comment_unanchored() {
        let raw = r#"{"comments":[{"filePath":"a.rs","lineNumber":99999,"severity":"Error","category":"Bug","content":"off the map"}]}"#;
        let parsed: Parsed<ReviewEnvelope> = parse_envelope(raw, no_repair).await.unwrap();
        let comments = map_review_comments(parsed.value, 1, &index_with("a.rs", &[1, 2, 3]));
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].line_number, None);
        assert_eq!(comments[0].content, "off the map");
    }

    #[tokio::test]
    async fn unknown_enums_fall_back_to_defaults() {
        let raw = r#"{"comments":[{"filePath":"a.rs","severity":"catastrophic","category":"vibes","content":"x"}]}"#;
        let parsed: Parsed<ReviewEnvelope> = parse_envelope(raw, no_repair).await.unwrap();
        let comments = map_review_comments(parsed.value, 1, &LineIndex::new());
        assert_eq!(comments[0].severity, Severity::Info);
        assert_eq!(comments[0].category, Category::Quality);
    }

    #[tokio::test]
    async fn risk_scores_clamp_into_range() {
        let raw = r#"{"overallRiskScore":170,"complexityRisk":-5,"securityRisk":42.4,"performanceRisk":10,"maintainabilityRisk":10,"description":"d","mitigation":"m","confidence":3.5}"#;
        let parsed: Parsed<RiskEnvelope> = parse_envelope(raw, no_repair).await.unwrap();
        let risk = map_risk(parsed.value, 9, "gpt-4o-mini");
        assert_eq!(risk.overall_risk_score, 100);
        assert_eq!(risk.complexity_risk, 0);
        assert_eq!(risk.security_risk, 42);
        assert_eq!(risk.confidence_score, 1.0);
        assert_eq!(risk.ai_model_version, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn suggestion_complexity_clamps_to_one_through_ten() {
        let raw = r#"{"suggestions":[{"type":"refactor","priority":"high","title":"t","description":"d","implementationComplexity":25,"confidence":0.9}]}"#;
        let parsed: Parsed<ImprovementsEnvelope> = parse_envelope(raw, no_repair).await.unwrap();
        let suggestions = map_suggestions(parsed.value, 3);
        assert_eq!(suggestions[0].implementation_complexity, 10);
        assert_eq!(suggestions[0].confidence_score, 0.9);
    }

    #[test]
    fn fragment_extraction_ignores_braces_in_strings() {
        let raw = r#"noise {"a":"closing } inside","b":[1,2]} trailing"#;
        let frag = extract_json_fragment(raw).unwrap();
        assert_eq!(frag, r#"{"a":"closing } inside","b":[1,2]}"#);
    }

    #[test]
    fn line_index_covers_new_side_only() {
        let file = DiffFile {
            path: "a.rs".into(),
            status: FileStatus::Modified,
            added_lines: 1,
            deleted_lines: 1,
            is_binary: false,
            hunks: vec![DiffHunk {
                old_start: 4,
                old_count: 2,
                new_start: 4,
                new_count: 2,
                lines: vec![
                    DiffLine::Context {
                        old_line: 4,
                        new_line: 4,
                        content: "ctx".into(),
                    },
                    DiffLine::Removed {
                        old_line: 5,
                        content: "gone".into(),
                    },
                    DiffLine::Added {
                        new_line: 5,
                        content: "fresh".into(),
                    },
                ],
            }],
        };
        let idx = line_index(&[file]);
        let set = idx.get("a.rs").unwrap();
        assert!(set.contains(&4));
        assert!(set.contains(&5));
        assert_eq!(set.len(), 2);
    }
}
