//! Prompt templates, resolved per project with a global fallback.

use serde::{Deserialize, Serialize};

use crate::job::TaskKind;

/// A versioned prompt template. Immutable per version; `project_id = None`
/// marks the global default for its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: i64,
    pub project_id: Option<i64>,
    pub task: TaskKind,
    pub version: u32,
    pub body: String,
    /// Names the `{{variable}}` placeholders the body expects.
    pub variables: Vec<String>,
}
