//! The AI review job pipeline.
//!
//! One job = one claimed execution over a review:
//!
//! 1. **Prepare** — load the review, fetch the diff (fatal diff errors fail
//!    the job with the review left untouched).
//! 2. **Chunk** — split the diff into prompt-sized units with deterministic
//!    ids.
//! 3. **Dispatch** — bounded fan-out; each chunk goes prompt → LLM → parse
//!    → persist, independently, with results landing as they arrive.
//! 4. **Aggregate / Finalise** — count outcomes, move the review to human
//!    review, settle the claim.
//!
//! The analysis orchestrator runs the risk / improvements / summary tasks
//! the same way (usually one call each), and a composite job sequences all
//! three under nested claims.
//!
//! Progress is reported through the execution handle and mirrored on the
//! `review:{id}` pub/sub channel.

pub mod analysis_job;
pub mod chunker;
pub mod context;
pub mod errors;
pub mod parse;
pub mod prompts;
pub mod review_job;

pub use analysis_job::{AnalysisKind, run_analysis_job, run_comprehensive_job};
pub use chunker::{Chunk, ChunkerConfig, chunk_diff};
pub use context::{LlmTarget, PipelineConfig, PipelineContext};
pub use errors::{JobOutcome, PipelineError};
pub use prompts::{PromptBuilder, SCHEMA_VERSION};
pub use review_job::run_review_job;
