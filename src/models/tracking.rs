//! Per-article analysis attempt tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one article within one analysis batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Submitted, awaiting batch completion.
    Pending,
    /// Analyzed and stored; `result_json` is cleared.
    Success,
    /// LLM-side failure; needs re-analysis.
    Failed,
    /// Transient store failure; `result_json` retained for a storage-only
    /// retry.
    StoreFailed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::StoreFailed => "store_failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "store_failed" => Some(Self::StoreFailed),
            _ => None,
        }
    }
}

/// One analysis attempt for one article within one batch. The authoritative
/// status per article-per-batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTracking {
    pub id: i64,
    pub article_id: i64,
    pub batch_id: String,
    pub status: AnalysisStatus,
    /// Non-null only while status is `StoreFailed`.
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
