//! Repository layer for operational-store persistence.

mod archive;
mod article;
mod crawler;
mod pipeline;
mod queue;
mod reparse;
mod tracking;

pub use archive::{ArchiveRepository, NewArchiveRecord};
pub use article::{ArticleRepository, ParsedFields, SourceStats};
pub use crawler::{CrawlerConfigRepository, TickOutcome};
pub use pipeline::{NewAnalysisResult, NewFilterResult, PipelineRepository, RuleStats};
pub use queue::{QueueStats, UrlQueueRepository, DEFAULT_MAX_RETRIES};
pub use reparse::ReparseJobRepository;
pub use tracking::{AnalysisTrackingRepository, TrackingStats};

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

/// Parse a datetime string from the database.
///
/// Accepts RFC 3339 first; naive timestamps are assumed UTC. Defaults to
/// the Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    parse_datetime_opt(Some(s.to_string())).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Parse an optional datetime string from the database.
pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    let s = s?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Convert a rusqlite Result<T> to Result<Option<T>>, treating
/// QueryReturnedNoRows as None.
pub fn to_option<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Create a database connection with optimized settings for concurrency.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL mode persists, so this is effectively a one-time setting per database
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
        PRAGMA cache_size = -64000;
        PRAGMA temp_store = MEMORY;
    "#,
    )?;

    Ok(conn)
}

/// Operational store handle.
///
/// Opens the schema once and hands out lightweight repositories, each of
/// which opens its own connection per call.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
}

impl Store {
    /// Open the store and ensure every table exists.
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        CrawlerConfigRepository::new(db_path)?;
        ArticleRepository::new(db_path)?;
        UrlQueueRepository::new(db_path)?;
        ArchiveRepository::new(db_path)?;
        ReparseJobRepository::new(db_path)?;
        PipelineRepository::new(db_path)?;
        AnalysisTrackingRepository::new(db_path)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn crawlers(&self) -> CrawlerConfigRepository {
        CrawlerConfigRepository::attach(&self.db_path)
    }

    pub fn articles(&self) -> ArticleRepository {
        ArticleRepository::attach(&self.db_path)
    }

    pub fn queue(&self) -> UrlQueueRepository {
        UrlQueueRepository::attach(&self.db_path)
    }

    pub fn archives(&self) -> ArchiveRepository {
        ArchiveRepository::attach(&self.db_path)
    }

    pub fn reparse_jobs(&self) -> ReparseJobRepository {
        ReparseJobRepository::attach(&self.db_path)
    }

    pub fn pipeline(&self) -> PipelineRepository {
        PipelineRepository::attach(&self.db_path)
    }

    pub fn tracking(&self) -> AnalysisTrackingRepository {
        AnalysisTrackingRepository::attach(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_parsing_accepts_naive_as_utc() {
        let rfc = parse_datetime("2025-03-01T12:00:00+08:00");
        assert_eq!(rfc.to_rfc3339(), "2025-03-01T04:00:00+00:00");

        let naive = parse_datetime("2025-03-01 12:00:00");
        assert_eq!(naive.to_rfc3339(), "2025-03-01T12:00:00+00:00");

        assert!(parse_datetime_opt(Some("garbage".to_string())).is_none());
        assert!(parse_datetime_opt(None).is_none());
    }
}
