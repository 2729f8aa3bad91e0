//! Raw HTML archive tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether an article's raw HTML lives in the database or in a batch file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    /// raw_html restored into the database; the batch file copy remains.
    Active,
    /// raw_html lives only in the batch file.
    Archived,
    /// raw_html permanently deleted.
    Deleted,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Pointer from an article to the gzipped batch file holding its raw HTML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub id: i64,
    pub article_id: i64,
    pub source: String,
    pub archive_path: String,
    pub status: ArchiveStatus,
    /// Raw HTML size in bytes before compression.
    pub original_size: i64,
    /// Approximate share of the batch file's compressed size. A size hint,
    /// not a contract.
    pub compressed_size: Option<i64>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
