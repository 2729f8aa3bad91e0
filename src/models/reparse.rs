//! Reparse job tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReparseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ReparseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A background job replaying the parser over stored and archived HTML for
/// one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReparseJob {
    /// UUID string identifier.
    pub id: String,
    pub source: String,
    pub status: ReparseStatus,
    pub total_count: i64,
    pub processed_count: i64,
    pub failed_count: i64,
    /// First 100 failure lines, newline-joined.
    pub error_log: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ReparseJob {
    /// Completion percentage over processed + failed items.
    pub fn progress_percent(&self) -> f64 {
        if self.total_count <= 0 {
            return 0.0;
        }
        let done = (self.processed_count + self.failed_count) as f64;
        (done / self.total_count as f64 * 1000.0).round() / 10.0
    }
}
