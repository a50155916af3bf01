//! Prompt assembly: template resolution, variable fill, system instruction.
//!
//! Templates resolve `(project, task)` → global default → built-in, with a
//! short in-process cache (templates are read-mostly; the host invalidates
//! via the `prompt:invalidate:{projectId}` channel).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use review_domain::{PromptRepo, PromptTemplate, RepoResult, ReviewRequest, TaskKind};

/// Version marker pinned into the system instruction; the parser refuses
/// envelopes that claim a different version.
pub const SCHEMA_VERSION: &str = "1";

/// Cache TTL for resolved templates.
const TEMPLATE_TTL: Duration = Duration::from_secs(60);

/// A rendered prompt pair.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Inputs available to template variables.
pub struct PromptVars<'a> {
    pub review: &'a ReviewRequest,
    pub diff: &'a str,
    pub file_list: &'a [String],
    pub context: &'a str,
}

struct CachedTemplate {
    fetched_at: Instant,
    template: Option<PromptTemplate>,
}

pub struct PromptBuilder {
    repo: Arc<dyn PromptRepo>,
    cache: Mutex<HashMap<(Option<i64>, TaskKind), CachedTemplate>>,
}

impl PromptBuilder {
    pub fn new(repo: Arc<dyn PromptRepo>) -> Self {
        PromptBuilder {
            repo,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build the prompt for one task over one chunk/diff.
    pub async fn build(&self, task: TaskKind, vars: &PromptVars<'_>) -> RepoResult<Prompt> {
        let body = match self
            .resolve_cached(Some(vars.review.project_id), task)
            .await?
        {
            Some(t) => t.body,
            None => builtin_body(task).to_string(),
        };
        Ok(Prompt {
            system: system_instruction(task),
            user: render(&body, vars),
        })
    }

    /// Drop cached templates for a project (and the globals when `None`).
    /// Wired to the invalidation pub/sub channel by the host.
    pub async fn invalidate_project(&self, project_id: Option<i64>) {
        let mut cache = self.cache.lock().await;
        cache.retain(|(pid, _), _| *pid != project_id);
        debug!(?project_id, "prompt template cache invalidated");
    }

    async fn resolve_cached(
        &self,
        project_id: Option<i64>,
        task: TaskKind,
    ) -> RepoResult<Option<PromptTemplate>> {
        let key = (project_id, task);
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < TEMPLATE_TTL {
                    return Ok(entry.template.clone());
                }
            }
        }
        let template = self.repo.resolve(project_id, task).await?;
        self.cache.lock().await.insert(
            key,
            CachedTemplate {
                fetched_at: Instant::now(),
                template: template.clone(),
            },
        );
        Ok(template)
    }
}

fn system_instruction(task: TaskKind) -> String {
    format!(
        "You are an expert code reviewer. Respond with a single JSON object \
         matching the {} response schema, schemaVersion \"{}\". Output JSON \
         only, with no surrounding prose or markdown fences.",
        task.as_str(),
        SCHEMA_VERSION
    )
}

fn render(body: &str, vars: &PromptVars<'_>) -> String {
    let file_list = vars.file_list.join("\n");
    body.replace("{{diff}}", vars.diff)
        .replace("{{fileList}}", &file_list)
        .replace("{{title}}", &vars.review.title)
        .replace("{{targetBranch}}", &vars.review.target_branch)
        .replace("{{baseBranch}}", &vars.review.base_branch)
        .replace("{{context}}", vars.context)
}

fn builtin_body(task: TaskKind) -> &'static str {
    match task {
        TaskKind::Review => BUILTIN_REVIEW,
        TaskKind::RiskAnalysis => BUILTIN_RISK,
        TaskKind::PullRequestSummary => BUILTIN_SUMMARY,
        TaskKind::ImprovementSuggestions => BUILTIN_IMPROVEMENTS,
    }
}

const BUILTIN_REVIEW: &str = r#"Review the following changes from "{{title}}" ({{targetBranch}} into {{baseBranch}}).

Change overview:
{{context}}

Diff:
{{diff}}

Report concrete problems on the changed lines only. For each finding emit an
entry in `comments` with: filePath, lineNumber (new side of the diff),
severity (Info|Warning|Error|Critical), category
(Quality|Security|Performance|Style|Bug|Documentation), content, and an
optional concrete `suggestion`. Return {"comments": []} when the changes are
fine."#;

const BUILTIN_RISK: &str = r#"Assess the risk of merging "{{title}}" ({{targetBranch}} into {{baseBranch}}).

Changed files:
{{fileList}}

Diff:
{{diff}}

Score overallRiskScore, complexityRisk, securityRisk, performanceRisk and
maintainabilityRisk from 0 (none) to 100 (severe), explain the drivers in
`description`, list `mitigation` steps, and give your `confidence` between
0 and 1."#;

const BUILTIN_SUMMARY: &str = r#"Summarize the pull request "{{title}}" ({{targetBranch}} into {{baseBranch}}).

Change overview:
{{context}}

Diff:
{{diff}}

Fill changeType, businessImpact, technicalImpact, breakingChangeRisk, a one
paragraph `summary`, a `detailedDescription`, the `keyChanges` list,
`impactAnalysis`, and `changeStatistics` (files/lines counts). Optional
fields may be omitted."#;

const BUILTIN_IMPROVEMENTS: &str = r#"Suggest improvements for "{{title}}" ({{targetBranch}} into {{baseBranch}}).

Changed files:
{{fileList}}

Diff:
{{diff}}

Emit `suggestions`, each with: type, priority, title, description, optional
filePath/startLine/endLine, optional originalCode/suggestedCode pair,
reasoning, expectedBenefits, implementationComplexity (1-10) and confidence
(0-1). Prefer few high-value suggestions over many trivial ones."#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use review_domain::ReviewState;
    use review_domain::memory::InMemoryPromptRepo;

    fn review() -> ReviewRequest {
        ReviewRequest {
            id: 42,
            project_id: 5,
            title: "Speed up parser".into(),
            target_branch: "feature/x".into(),
            base_branch: "main".into(),
            pull_request_number: None,
            author_id: 1,
            state: ReviewState::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn builtin_template_renders_variables() {
        let builder = PromptBuilder::new(Arc::new(InMemoryPromptRepo::new()));
        let review = review();
        let files = vec!["a.rs".to_string()];
        let prompt = builder
            .build(
                TaskKind::Review,
                &PromptVars {
                    review: &review,
                    diff: "### a.rs\n+let x = 1;\n",
                    file_list: &files,
                    context: "1 files changed",
                },
            )
            .await
            .unwrap();
        assert!(prompt.user.contains("Speed up parser"));
        assert!(prompt.user.contains("feature/x"));
        assert!(prompt.user.contains("+let x = 1;"));
        assert!(prompt.system.contains("schemaVersion \"1\""));
        assert!(prompt.system.contains("Review"));
    }

    #[tokio::test]
    async fn project_template_wins_over_builtin() {
        let repo = Arc::new(InMemoryPromptRepo::new());
        repo.put(PromptTemplate {
            id: 1,
            project_id: Some(5),
            task: TaskKind::Review,
            version: 2,
            body: "custom body over {{fileList}}".into(),
            variables: vec!["fileList".into()],
        });
        let builder = PromptBuilder::new(repo);
        let review = review();
        let files = vec!["a.rs".to_string(), "b.rs".to_string()];
        let prompt = builder
            .build(
                TaskKind::Review,
                &PromptVars {
                    review: &review,
                    diff: "",
                    file_list: &files,
                    context: "",
                },
            )
            .await
            .unwrap();
        assert!(prompt.user.starts_with("custom body over a.rs\nb.rs"));
    }

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        let repo = Arc::new(InMemoryPromptRepo::new());
        let builder = PromptBuilder::new(Arc::clone(&repo) as Arc<dyn PromptRepo>);
        let review = review();
        let files: Vec<String> = Vec::new();

        let first = builder
            .build(
                TaskKind::Review,
                &PromptVars {
                    review: &review,
                    diff: "",
                    file_list: &files,
                    context: "",
                },
            )
            .await
            .unwrap();
        assert!(first.user.contains("Report concrete problems"));

        // New template lands, but the cached miss still serves the builtin.
        repo.put(PromptTemplate {
            id: 9,
            project_id: Some(5),
            task: TaskKind::Review,
            version: 1,
            body: "fresh template {{diff}}".into(),
            variables: vec!["diff".into()],
        });
        let cached = builder
            .build(
                TaskKind::Review,
                &PromptVars {
                    review: &review,
                    diff: "",
                    file_list: &files,
                    context: "",
                },
            )
            .await
            .unwrap();
        assert!(cached.user.contains("Report concrete problems"));

        builder.invalidate_project(Some(5)).await;
        let fresh = builder
            .build(
                TaskKind::Review,
                &PromptVars {
                    review: &review,
                    diff: "",
                    file_list: &files,
                    context: "",
                },
            )
            .await
            .unwrap();
        assert!(fresh.user.starts_with("fresh template"));
    }
}
