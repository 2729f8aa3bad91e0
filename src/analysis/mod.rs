//! LLM batch analysis: provider contract, coordinator, and the analytical
//! store writer.

pub mod openai_batch;
pub mod prompts;
pub mod schema;
mod service;
mod store;

pub use openai_batch::OpenAiBatchProvider;
pub use service::{AnalysisService, AnalyzeSummary, ResultSink};
pub use store::{AnalyticsStore, StoreError, StoreFailure};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Article;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Batch {batch_id} did not complete within {max_wait_secs}s")]
    Timeout { batch_id: String, max_wait_secs: u64 },
    #[error("Batch {batch_id} ended as {status}")]
    BatchFailed { batch_id: String, status: String },
    #[error("Database error: {0}")]
    Repository(#[from] crate::repository::RepositoryError),
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

/// A single article analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// "article_{article_id}".
    pub custom_id: String,
    pub article: Article,
}

impl AnalysisRequest {
    pub fn for_article(article: Article) -> Self {
        Self {
            custom_id: format!("article_{}", article.id),
            article,
        }
    }
}

/// A single article analysis response.
#[derive(Debug, Clone)]
pub struct AnalysisResponse {
    pub custom_id: String,
    pub success: bool,
    /// Raw JSON string of the analysis when successful.
    pub result_json: Option<String>,
    pub error_message: Option<String>,
}

/// Extract the article id from a custom id like "article_123".
pub fn parse_article_id(custom_id: &str) -> Option<i64> {
    custom_id.strip_prefix("article_")?.parse().ok()
}

/// Provider-side batch lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        }
    }

    /// States from which the batch will never complete.
    pub fn is_terminal_error(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Expired | Self::Cancelling | Self::Cancelled
        )
    }
}

/// Result of a batch status check.
#[derive(Debug, Clone, Copy)]
pub struct BatchStatusResult {
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Capability contract for batch-capable analysis providers. Add new
/// providers by implementing these three operations.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a batch of requests, returning the provider's batch handle.
    async fn submit_batch(&self, requests: &[AnalysisRequest]) -> Result<String>;

    /// Check a batch's progress.
    async fn check_batch_status(&self, batch_id: &str) -> Result<BatchStatusResult>;

    /// Retrieve every per-article result (and error) of a completed batch.
    async fn retrieve_results(&self, batch_id: &str) -> Result<Vec<AnalysisResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_id_round_trip() {
        assert_eq!(parse_article_id("article_42"), Some(42));
        assert_eq!(parse_article_id("article_"), None);
        assert_eq!(parse_article_id("batch_42"), None);
    }

    #[test]
    fn terminal_error_states() {
        assert!(BatchStatus::Expired.is_terminal_error());
        assert!(BatchStatus::Cancelled.is_terminal_error());
        assert!(!BatchStatus::InProgress.is_terminal_error());
        assert!(!BatchStatus::Completed.is_terminal_error());
    }
}
