//! Archive record repository.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};

use super::article::row_to_article;
use super::{parse_datetime, parse_datetime_opt, to_option, Result};
use crate::models::{ArchiveRecord, ArchiveStatus, Article};

/// A new archive record awaiting insertion as part of a batch commit.
#[derive(Debug, Clone)]
pub struct NewArchiveRecord {
    pub article_id: i64,
    pub source: String,
    pub archive_path: String,
    pub original_size: i64,
    pub compressed_size: Option<i64>,
    pub archived_at: DateTime<Utc>,
}

/// SQLite-backed repository for raw HTML archive records.
pub struct ArchiveRepository {
    db_path: PathBuf,
}

impl ArchiveRepository {
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
            CREATE TABLE IF NOT EXISTS raw_html_archives (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER NOT NULL,
                source TEXT NOT NULL,
                archive_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                original_size INTEGER NOT NULL,
                compressed_size INTEGER,
                archived_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_raw_html_archives_article
                ON raw_html_archives(article_id);
            CREATE INDEX IF NOT EXISTS idx_raw_html_archives_source
                ON raw_html_archives(source, status);
        "#,
        )?;
        Ok(())
    }

    /// Articles eligible for archiving: raw HTML present, matching the date
    /// predicate on crawled_at, and not already archived.
    pub fn articles_for_archive(
        &self,
        source: &str,
        before_date: Option<NaiveDate>,
        target_date: Option<NaiveDate>,
    ) -> Result<Vec<Article>> {
        let conn = self.connect()?;

        let (target_start, target_end) = match target_date {
            Some(d) => {
                let start = d.and_hms_opt(0, 0, 0).unwrap().and_utc().to_rfc3339();
                let end = (d + chrono::Duration::days(1))
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc()
                    .to_rfc3339();
                (Some(start), Some(end))
            }
            None => (None, None),
        };
        let before = before_date
            .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc().to_rfc3339());

        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM news_articles a
            WHERE a.source = ?1
              AND a.raw_html IS NOT NULL AND a.raw_html != ''
              AND (?2 IS NULL OR a.crawled_at >= ?2)
              AND (?3 IS NULL OR a.crawled_at < ?3)
              AND (?4 IS NULL OR a.crawled_at < ?4)
              AND NOT EXISTS (
                  SELECT 1 FROM raw_html_archives r
                  WHERE r.article_id = a.id AND r.status = 'archived'
              )
            ORDER BY a.id
            "#,
        )?;
        let rows = stmt.query_map(
            params![source, target_start, target_end, before],
            row_to_article,
        )?;
        let articles = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(articles)
    }

    /// Commit one archive batch: insert the records and null the articles'
    /// raw HTML, all in one transaction. A failure here leaves previously
    /// finalized batches untouched.
    pub fn commit_batch(&self, records: &[NewArchiveRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();

        for record in records {
            tx.execute(
                r#"
                INSERT INTO raw_html_archives (
                    article_id, source, archive_path, status,
                    original_size, compressed_size, archived_at, created_at
                ) VALUES (?1, ?2, ?3, 'archived', ?4, ?5, ?6, ?7)
                "#,
                params![
                    record.article_id,
                    record.source,
                    record.archive_path,
                    record.original_size,
                    record.compressed_size,
                    record.archived_at.to_rfc3339(),
                    now,
                ],
            )?;
            tx.execute(
                "UPDATE news_articles SET raw_html = NULL WHERE id = ?",
                params![record.article_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Restore raw HTML into articles and flip their records to ACTIVE,
    /// atomically per call.
    pub fn restore_articles(&self, restored: &[(i64, String)]) -> Result<usize> {
        if restored.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut count = 0usize;

        for (article_id, raw_html) in restored {
            let updated = tx.execute(
                "UPDATE news_articles SET raw_html = ?1 WHERE id = ?2",
                params![raw_html, article_id],
            )?;
            if updated == 0 {
                continue;
            }
            tx.execute(
                "UPDATE raw_html_archives SET status = 'active'
                 WHERE article_id = ?1 AND status = 'archived'",
                params![article_id],
            )?;
            count += 1;
        }

        tx.commit()?;
        Ok(count)
    }

    /// The ARCHIVED record for one article, if any.
    pub fn archived_record_for(&self, article_id: i64) -> Result<Option<ArchiveRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM raw_html_archives
             WHERE article_id = ? AND status = 'archived' LIMIT 1",
        )?;
        to_option(stmt.query_row(params![article_id], row_to_record))
    }

    /// ARCHIVED records for a set of articles.
    pub fn archived_records_for(&self, article_ids: &[i64]) -> Result<Vec<ArchiveRecord>> {
        if article_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect()?;
        let mut records = Vec::new();
        for chunk in article_ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT * FROM raw_html_archives
                 WHERE status = 'archived' AND article_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), row_to_record)?;
            for row in rows {
                records.push(row?);
            }
        }
        Ok(records)
    }

    /// All ARCHIVED records for a source, oldest article first.
    pub fn archived_for_source(&self, source: &str) -> Result<Vec<ArchiveRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM raw_html_archives
             WHERE source = ? AND status = 'archived'
             ORDER BY article_id",
        )?;
        let rows = stmt.query_map(params![source], row_to_record)?;
        let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count_archived(&self, source: &str) -> Result<i64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM raw_html_archives WHERE source = ? AND status = 'archived'",
            params![source],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ArchiveRecord> {
    Ok(ArchiveRecord {
        id: row.get("id")?,
        article_id: row.get("article_id")?,
        source: row.get("source")?,
        archive_path: row.get("archive_path")?,
        status: ArchiveStatus::from_str(&row.get::<_, String>("status")?)
            .unwrap_or(ArchiveStatus::Active),
        original_size: row.get("original_size")?,
        compressed_size: row.get("compressed_size")?,
        archived_at: parse_datetime_opt(row.get("archived_at")?),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
    })
}
