//! Normalized diff model and the diff-provider contract.
//!
//! The diff is ephemeral input: it is fetched per job, chunked, prompted on,
//! and never persisted by this engine. Line numbers are relative to the new
//! tree; binary and submodule changes arrive with a status but no hunks.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::review::ReviewRequest;

/// File-level change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// One line inside a diff hunk, with its old/new anchors where applicable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiffLine {
    Added {
        new_line: u32,
        content: String,
    },
    Removed {
        old_line: u32,
        content: String,
    },
    Context {
        old_line: u32,
        new_line: u32,
        content: String,
    },
}

impl DiffLine {
    /// New-side line number, if this line exists on the new side.
    pub fn new_line(&self) -> Option<u32> {
        match self {
            DiffLine::Added { new_line, .. } | DiffLine::Context { new_line, .. } => {
                Some(*new_line)
            }
            DiffLine::Removed { .. } => None,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            DiffLine::Added { content, .. }
            | DiffLine::Removed { content, .. }
            | DiffLine::Context { content, .. } => content,
        }
    }
}

/// A continuous block of changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: u32,
    pub old_count: u32,
    pub new_start: u32,
    pub new_count: u32,
    pub lines: Vec<DiffLine>,
}

/// One changed file with its hunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffFile {
    pub path: String,
    pub status: FileStatus,
    pub added_lines: u32,
    pub deleted_lines: u32,
    pub is_binary: bool,
    pub hunks: Vec<DiffHunk>,
}

impl DiffFile {
    /// Collect the set of line numbers that exist on the new side of this
    /// file's hunks. Comments may only anchor to these lines.
    pub fn new_side_lines(&self) -> HashSet<u32> {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter_map(DiffLine::new_line)
            .collect()
    }
}

/// Errors a diff provider may surface.
///
/// `RepoUnavailable` is transient (the queue will redeliver); the other two
/// are fatal for the review and surfaced to the user.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("repository unavailable: {0}")]
    RepoUnavailable(String),

    #[error("branch missing: {0}")]
    BranchMissing(String),

    #[error("authentication required for repository access")]
    AuthRequired,
}

impl DiffError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiffError::RepoUnavailable(_))
    }
}

/// External collaborator contract: fetch the ordered per-file diff for a
/// review. Implemented by the git-host integration; a static in-memory
/// implementation lives in [`crate::memory`] for tests.
#[async_trait]
pub trait DiffProvider: Send + Sync {
    async fn get_diff(&self, review: &ReviewRequest) -> Result<Vec<DiffFile>, DiffError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hunk() -> DiffHunk {
        DiffHunk {
            old_start: 10,
            old_count: 2,
            new_start: 10,
            new_count: 3,
            lines: vec![
                DiffLine::Context {
                    old_line: 10,
                    new_line: 10,
                    content: "fn main() {".into(),
                },
                DiffLine::Removed {
                    old_line: 11,
                    content: "    old();".into(),
                },
                DiffLine::Added {
                    new_line: 11,
                    content: "    new();".into(),
                },
                DiffLine::Added {
                    new_line: 12,
                    content: "    extra();".into(),
                },
            ],
        }
    }

    #[test]
    fn new_side_lines_skip_removals() {
        let file = DiffFile {
            path: "src/main.rs".into(),
            status: FileStatus::Modified,
            added_lines: 2,
            deleted_lines: 1,
            is_binary: false,
            hunks: vec![hunk()],
        };
        let lines = file.new_side_lines();
        assert!(lines.contains(&10));
        assert!(lines.contains(&11));
        assert!(lines.contains(&12));
        assert_eq!(lines.len(), 3);
    }
}
