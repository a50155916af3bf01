//! Higher-level AI analyses: risk assessment, improvement suggestions, and
//! the pull-request summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// At most one per review; regenerating replaces the previous row.
///
/// Scores are 0–100, confidence is 0.0–1.0; the parser clamps both before
/// anything reaches persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub review_id: i64,
    pub overall_risk_score: u8,
    pub complexity_risk: u8,
    pub security_risk: u8,
    pub performance_risk: u8,
    pub maintainability_risk: u8,
    pub risk_description: String,
    pub mitigation_suggestions: String,
    pub confidence_score: f32,
    pub ai_model_version: String,
    pub created_at: DateTime<Utc>,
}

/// Many per review; regenerating replaces the whole set.
///
/// `suggestion_type` and `priority` are model vocabulary and deliberately
/// kept free-form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementSuggestion {
    pub id: i64,
    pub review_id: i64,
    pub suggestion_type: String,
    pub priority: String,
    pub title: String,
    pub description: String,
    pub file_path: Option<String>,
    pub start_line: Option<u32>,
    pub end_line: Option<u32>,
    pub original_code: Option<String>,
    pub suggested_code: Option<String>,
    pub reasoning: Option<String>,
    pub expected_benefits: Option<String>,
    /// 1 (trivial) to 10 (major rework); clamped by the parser.
    pub implementation_complexity: u8,
    pub confidence_score: f32,
}

/// At most one per review; regenerating replaces the previous row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestSummary {
    pub review_id: i64,
    pub change_type: String,
    pub business_impact: String,
    pub technical_impact: String,
    pub breaking_change_risk: String,
    pub summary: String,
    pub detailed_description: String,
    pub key_changes: Vec<String>,
    pub impact_analysis: String,
    pub change_statistics: serde_json::Value,
    pub backward_compatibility: Option<String>,
    pub performance_impact: Option<String>,
    pub security_impact: Option<String>,
    pub testing_recommendations: Option<String>,
    pub deployment_considerations: Option<String>,
    pub documentation_requirements: Option<String>,
    pub dependency_changes: Option<String>,
    pub created_at: DateTime<Utc>,
}
