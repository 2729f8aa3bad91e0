//! Analysis tracking repository.
//!
//! One row per article per batch is the authoritative analysis status.
//! `result_json` is retained only while a row sits in STORE_FAILED, so a
//! storage-only retry never re-calls the LLM.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{parse_datetime, Result};
use crate::models::{truncate_error, AnalysisStatus, AnalysisTracking, ERROR_LOG_MAX_BYTES};

/// Tracking counts by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackingStats {
    pub pending: i64,
    pub success: i64,
    pub failed: i64,
    pub store_failed: i64,
    pub total: i64,
}

/// SQLite-backed repository for analysis attempt tracking.
pub struct AnalysisTrackingRepository {
    db_path: PathBuf,
}

impl AnalysisTrackingRepository {
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
            CREATE TABLE IF NOT EXISTS article_analysis_tracking (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER NOT NULL,
                batch_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result_json TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_analysis_tracking_article
                ON article_analysis_tracking(article_id, status);
            CREATE INDEX IF NOT EXISTS idx_analysis_tracking_batch
                ON article_analysis_tracking(batch_id);
        "#,
        )?;
        Ok(())
    }

    /// Create PENDING rows for a submitted batch, skipping articles that
    /// already have a row in this batch (resume after crash).
    pub fn create_pending(&self, article_ids: &[i64], batch_id: &str) -> Result<usize> {
        if article_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();

        let mut created = 0usize;
        for article_id in article_ids {
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM article_analysis_tracking
                 WHERE article_id = ?1 AND batch_id = ?2",
                params![article_id, batch_id],
                |row| row.get(0),
            )?;
            if exists > 0 {
                continue;
            }
            tx.execute(
                r#"
                INSERT INTO article_analysis_tracking (
                    article_id, batch_id, status, created_at
                ) VALUES (?1, ?2, 'pending', ?3)
                "#,
                params![article_id, batch_id, now],
            )?;
            created += 1;
        }

        tx.commit()?;
        Ok(created)
    }

    /// Article ids that already have a SUCCESS row (skipped on analyze).
    pub fn success_article_ids(&self) -> Result<HashSet<i64>> {
        self.article_ids_with_status(AnalysisStatus::Success)
    }

    pub fn article_ids_with_status(&self, status: AnalysisStatus) -> Result<HashSet<i64>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT article_id FROM article_analysis_tracking WHERE status = ?",
        )?;
        let rows = stmt.query_map(params![status.as_str()], |row| row.get::<_, i64>(0))?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    pub fn rows_with_status(&self, status: AnalysisStatus) -> Result<Vec<AnalysisTracking>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM article_analysis_tracking WHERE status = ? ORDER BY id",
        )?;
        let rows = stmt.query_map(params![status.as_str()], row_to_tracking)?;
        let tracking = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracking)
    }

    /// Most recent PENDING row for an article in a batch.
    fn update_pending(
        &self,
        article_id: i64,
        batch_id: &str,
        status: AnalysisStatus,
        result_json: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.connect()?;
        let error = error_message.map(|e| truncate_error(e, ERROR_LOG_MAX_BYTES));
        let count = conn.execute(
            r#"
            UPDATE article_analysis_tracking
            SET status = ?1, result_json = ?2, error_message = ?3
            WHERE id = (
                SELECT id FROM article_analysis_tracking
                WHERE article_id = ?4 AND batch_id = ?5 AND status = 'pending'
                ORDER BY created_at DESC, id DESC LIMIT 1
            )
            "#,
            params![status.as_str(), result_json, error, article_id, batch_id],
        )?;
        Ok(count > 0)
    }

    /// Stamp a stored article SUCCESS, clearing any retained result.
    pub fn mark_success(&self, article_id: i64, batch_id: &str) -> Result<bool> {
        self.update_pending(article_id, batch_id, AnalysisStatus::Success, None, None)
    }

    /// Stamp an LLM-side failure; the article needs re-analysis.
    pub fn mark_failed(&self, article_id: i64, batch_id: &str, error: &str) -> Result<bool> {
        self.update_pending(article_id, batch_id, AnalysisStatus::Failed, None, Some(error))
    }

    /// Stamp a transient store failure, retaining the result for a
    /// storage-only retry.
    pub fn mark_store_failed(
        &self,
        article_id: i64,
        batch_id: &str,
        result_json: &str,
        error: &str,
    ) -> Result<bool> {
        self.update_pending(
            article_id,
            batch_id,
            AnalysisStatus::StoreFailed,
            Some(result_json),
            Some(error),
        )
    }

    /// Resolve a STORE_FAILED row after a successful storage retry.
    pub fn resolve_store_failed(&self, row_id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE article_analysis_tracking
             SET status = 'success', result_json = NULL, error_message = NULL
             WHERE id = ?",
            params![row_id],
        )?;
        Ok(())
    }

    /// Re-stamp a STORE_FAILED row after another transient failure, or
    /// demote it to FAILED on a data error (result no longer storable).
    pub fn restamp_store_failed(
        &self,
        row_id: i64,
        still_transient: bool,
        error: &str,
    ) -> Result<()> {
        let conn = self.connect()?;
        if still_transient {
            conn.execute(
                "UPDATE article_analysis_tracking SET error_message = ?1 WHERE id = ?2",
                params![truncate_error(error, ERROR_LOG_MAX_BYTES), row_id],
            )?;
        } else {
            conn.execute(
                "UPDATE article_analysis_tracking
                 SET status = 'failed', result_json = NULL, error_message = ?1
                 WHERE id = ?2",
                params![truncate_error(error, ERROR_LOG_MAX_BYTES), row_id],
            )?;
        }
        Ok(())
    }

    /// Delete rows with the given status. Returns the number removed.
    pub fn delete_with_status(&self, status: AnalysisStatus) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn.execute(
            "DELETE FROM article_analysis_tracking WHERE status = ?",
            params![status.as_str()],
        )?;
        Ok(count)
    }

    pub fn delete_for_article(&self, article_id: i64) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn.execute(
            "DELETE FROM article_analysis_tracking WHERE article_id = ?",
            params![article_id],
        )?;
        Ok(count)
    }

    pub fn delete_for_batch(&self, batch_id: &str) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn.execute(
            "DELETE FROM article_analysis_tracking WHERE batch_id = ?",
            params![batch_id],
        )?;
        Ok(count)
    }

    pub fn delete_all(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn.execute("DELETE FROM article_analysis_tracking", [])?;
        Ok(count)
    }

    pub fn rows_for_batch(&self, batch_id: &str) -> Result<Vec<AnalysisTracking>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM article_analysis_tracking WHERE batch_id = ? ORDER BY id")?;
        let rows = stmt.query_map(params![batch_id], row_to_tracking)?;
        let tracking = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracking)
    }

    pub fn stats(&self) -> Result<TrackingStats> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM article_analysis_tracking GROUP BY status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = TrackingStats::default();
        for row in rows {
            let (status, count) = row?;
            match AnalysisStatus::from_str(&status) {
                Some(AnalysisStatus::Pending) => stats.pending = count,
                Some(AnalysisStatus::Success) => stats.success = count,
                Some(AnalysisStatus::Failed) => stats.failed = count,
                Some(AnalysisStatus::StoreFailed) => stats.store_failed = count,
                None => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }
}

fn row_to_tracking(row: &rusqlite::Row) -> rusqlite::Result<AnalysisTracking> {
    Ok(AnalysisTracking {
        id: row.get("id")?,
        article_id: row.get("article_id")?,
        batch_id: row.get("batch_id")?,
        status: AnalysisStatus::from_str(&row.get::<_, String>("status")?)
            .unwrap_or(AnalysisStatus::Pending),
        result_json: row.get("result_json")?,
        error_message: row.get("error_message")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
    })
}
