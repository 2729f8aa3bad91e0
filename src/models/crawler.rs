//! Crawler configuration and execution status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of crawler: list crawlers discover article URLs, article crawlers
/// fetch and parse them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlerKind {
    List,
    Article,
}

impl CrawlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Article => "article",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "list" => Some(Self::List),
            "article" => Some(Self::Article),
            _ => None,
        }
    }
}

/// Outcome of a crawler's most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlerRunStatus {
    Idle,
    Running,
    Success,
    Failed,
}

impl CrawlerRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A registered crawler, one row per (source, kind).
///
/// Rows are created by registry sync at startup and mutated by the crawl
/// executor; they are never deleted. `interval_minutes`, `is_active` and the
/// statistics fields survive re-syncs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    pub id: i64,
    /// Unique crawler name, doubles as the scheduler job id.
    pub name: String,
    pub display_name: String,
    pub kind: CrawlerKind,
    pub source: String,
    pub is_active: bool,
    pub interval_minutes: i64,
    pub timeout_seconds: i64,
    pub last_run_status: CrawlerRunStatus,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    /// Truncated to 4 KiB on write.
    pub error_log: Option<String>,
    pub last_run_items_count: i64,
    pub total_items_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
