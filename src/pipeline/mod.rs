//! Multi-stage analysis pipeline: FETCH → RULE_FILTER → LLM_ANALYSIS →
//! STORE.

mod fetcher;
mod orchestrator;
mod rules;
mod statistics;

pub use fetcher::ArticleFetcher;
pub use orchestrator::PipelineOrchestrator;
pub use rules::{default_rules, RuleEvaluation, RuleFilterService};
pub use statistics::{OverallStats, RunStats, StatisticsService};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Repository(#[from] crate::repository::RepositoryError),
    #[error("Analysis error: {0}")]
    Analysis(#[from] crate::analysis::AnalysisError),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
