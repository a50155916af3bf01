//! Review request entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of a review request.
///
/// Forward edges only: `Pending → AIReviewing → HumanReview → {Approved,
/// Rejected} → Merged`. The single backward edge is an explicit admin reset
/// back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewState {
    Pending,
    #[serde(rename = "AIReviewing")]
    AiReviewing,
    HumanReview,
    Approved,
    Rejected,
    Merged,
}

impl ReviewState {
    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(self, next: ReviewState) -> bool {
        use ReviewState::*;
        matches!(
            (self, next),
            (Pending, AiReviewing)
                | (AiReviewing, HumanReview)
                | (AiReviewing, AiReviewing)
                | (HumanReview, Approved)
                | (HumanReview, Rejected)
                | (Approved, Merged)
                | (Rejected, Merged)
        )
    }

    /// True for states in which an AI job may still be started.
    pub fn accepts_ai_jobs(self) -> bool {
        matches!(self, ReviewState::Pending | ReviewState::AiReviewing)
    }
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewState::Pending => "Pending",
            ReviewState::AiReviewing => "AIReviewing",
            ReviewState::HumanReview => "HumanReview",
            ReviewState::Approved => "Approved",
            ReviewState::Rejected => "Rejected",
            ReviewState::Merged => "Merged",
        };
        f.write_str(s)
    }
}

/// A registered request to review `target_branch` against `base_branch`,
/// optionally tied to a pull request number.
///
/// Created by the host API; its state is mutated only by the orchestrators
/// and by explicit human actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub target_branch: String,
    pub base_branch: String,
    pub pull_request_number: Option<u64>,
    pub author_id: i64,
    pub state: ReviewState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_edges_are_legal() {
        assert!(ReviewState::Pending.can_transition_to(ReviewState::AiReviewing));
        assert!(ReviewState::AiReviewing.can_transition_to(ReviewState::HumanReview));
        assert!(ReviewState::HumanReview.can_transition_to(ReviewState::Approved));
        assert!(ReviewState::HumanReview.can_transition_to(ReviewState::Rejected));
        assert!(ReviewState::Approved.can_transition_to(ReviewState::Merged));
    }

    #[test]
    fn backward_edges_are_rejected() {
        assert!(!ReviewState::HumanReview.can_transition_to(ReviewState::Pending));
        assert!(!ReviewState::Approved.can_transition_to(ReviewState::AiReviewing));
        assert!(!ReviewState::Merged.can_transition_to(ReviewState::HumanReview));
        assert!(!ReviewState::Pending.can_transition_to(ReviewState::HumanReview));
    }

    #[test]
    fn ai_jobs_only_before_human_review() {
        assert!(ReviewState::Pending.accepts_ai_jobs());
        assert!(ReviewState::AiReviewing.accepts_ai_jobs());
        assert!(!ReviewState::HumanReview.accepts_ai_jobs());
        assert!(!ReviewState::Merged.accepts_ai_jobs());
    }
}
