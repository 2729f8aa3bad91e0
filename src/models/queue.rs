//! Pending URL queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A URL waiting to be crawled.
///
/// A given `url_hash` appears in at most one of the queue and the article
/// store. `processed_at` is set exactly when the status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUrl {
    pub id: i64,
    pub url: String,
    pub url_hash: String,
    pub source: String,
    pub status: UrlStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
