//! Reparse job repository.

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection};

use super::{parse_datetime, parse_datetime_opt, to_option, Result};
use crate::models::{ReparseJob, ReparseStatus};

/// SQLite-backed repository for reparse jobs.
pub struct ReparseJobRepository {
    db_path: PathBuf,
}

impl ReparseJobRepository {
    pub fn new(db_path: &Path) -> Result<Self> {
        let repo = Self::attach(db_path);
        repo.init_schema()?;
        Ok(repo)
    }

    pub(crate) fn attach(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection> {
        super::connect(&self.db_path)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS reparse_jobs (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                total_count INTEGER NOT NULL DEFAULT 0,
                processed_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                error_log TEXT,
                started_at TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reparse_jobs_source
                ON reparse_jobs(source);
        "#,
        )?;
        Ok(())
    }

    pub fn insert(&self, job: &ReparseJob) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO reparse_jobs (
                id, source, status, total_count, processed_count,
                failed_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                job.id,
                job.source,
                job.status.as_str(),
                job.total_count,
                job.processed_count,
                job.failed_count,
                job.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<ReparseJob>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM reparse_jobs WHERE id = ?")?;
        to_option(stmt.query_row(params![job_id], row_to_job))
    }

    /// Transition a job's status, stamping start/completion times.
    pub fn update_status(
        &self,
        job_id: &str,
        status: ReparseStatus,
        processed: Option<i64>,
        failed: Option<i64>,
        error_log: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            UPDATE reparse_jobs
            SET status = ?1,
                processed_count = COALESCE(?2, processed_count),
                failed_count = COALESCE(?3, failed_count),
                error_log = COALESCE(?4, error_log),
                started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL
                                  THEN ?5 ELSE started_at END,
                completed_at = CASE WHEN ?1 IN ('completed', 'failed', 'cancelled')
                                    THEN ?5 ELSE completed_at END
            WHERE id = ?6
            "#,
            params![status.as_str(), processed, failed, error_log, now, job_id],
        )?;
        Ok(())
    }

    /// Update progress counters without touching status.
    pub fn update_progress(&self, job_id: &str, processed: i64, failed: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE reparse_jobs SET processed_count = ?1, failed_count = ?2 WHERE id = ?3",
            params![processed, failed, job_id],
        )?;
        Ok(())
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<ReparseJob>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM reparse_jobs ORDER BY created_at DESC LIMIT ?")?;
        let rows = stmt.query_map(params![limit as i64], row_to_job)?;
        let jobs = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<ReparseJob> {
    Ok(ReparseJob {
        id: row.get("id")?,
        source: row.get("source")?,
        status: ReparseStatus::from_str(&row.get::<_, String>("status")?)
            .unwrap_or(ReparseStatus::Pending),
        total_count: row.get("total_count")?,
        processed_count: row.get("processed_count")?,
        failed_count: row.get("failed_count")?,
        error_log: row.get("error_log")?,
        started_at: parse_datetime_opt(row.get("started_at")?),
        completed_at: parse_datetime_opt(row.get("completed_at")?),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
    })
}
