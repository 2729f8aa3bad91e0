//! Pending URL queue repository.
//!
//! Maintains the invariant that a given URL hash appears in at most one of
//! the queue and the article store, and that leases (PENDING → PROCESSING)
//! are exclusive.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{parse_datetime, parse_datetime_opt, to_option, Result};
use crate::models::{
    compute_url_hash, truncate_error, PendingUrl, UrlStatus, ERROR_LOG_MAX_BYTES,
};

/// Default number of retries before a URL is parked as FAILED.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Queue counts by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// SQLite-backed repository for the URL work queue.
pub struct UrlQueueRepository {
    db_path: PathBuf,
}

impl UrlQueueRepository {
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
            CREATE TABLE IF NOT EXISTS pending_urls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                url_hash TEXT NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                error_message TEXT,
                discovered_at TEXT NOT NULL,
                processed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pending_urls_hash
                ON pending_urls(url_hash);
            CREATE INDEX IF NOT EXISTS idx_pending_urls_source_status
                ON pending_urls(source, status);
            CREATE INDEX IF NOT EXISTS idx_pending_urls_discovered
                ON pending_urls(discovered_at);
        "#,
        )?;
        Ok(())
    }

    /// Add URLs to the queue after deduplicating against both the queue and
    /// the article store. Returns the number actually inserted.
    ///
    /// Atomic at the commit boundary: either all survivors land or none.
    pub fn add_urls(&self, urls: &[String], source: &str) -> Result<usize> {
        if urls.is_empty() {
            return Ok(0);
        }

        // Hash every candidate, keeping first occurrence per hash
        let mut hash_to_url: Vec<(String, &String)> = Vec::with_capacity(urls.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(urls.len());
        for url in urls {
            let hash = compute_url_hash(url);
            if seen.insert(hash.clone()) {
                hash_to_url.push((hash, url));
            }
        }

        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        // One read pass over both tables to find known hashes
        let mut existing: HashSet<String> = HashSet::new();
        for chunk in hash_to_url.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            for table in ["news_articles", "pending_urls"] {
                let sql =
                    format!("SELECT url_hash FROM {table} WHERE url_hash IN ({placeholders})");
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(chunk.iter().map(|(h, _)| h)),
                    |row| row.get::<_, String>(0),
                )?;
                for row in rows {
                    existing.insert(row?);
                }
            }
        }

        let now = Utc::now().to_rfc3339();
        let mut added = 0usize;
        for (hash, url) in &hash_to_url {
            if existing.contains(hash) {
                continue;
            }
            added += tx.execute(
                r#"
                INSERT OR IGNORE INTO pending_urls (
                    url, url_hash, source, status, retry_count, max_retries,
                    discovered_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5, ?5)
                "#,
                params![url, hash, source, DEFAULT_MAX_RETRIES, now],
            )?;
        }

        tx.commit()?;
        Ok(added)
    }

    /// Lease pending URLs for a source: select the oldest PENDING rows
    /// (FIFO by discovery time) and flip them to PROCESSING in the same
    /// transaction. `limit == 0` means no limit.
    pub fn lease(&self, source: &str, limit: usize) -> Result<Vec<PendingUrl>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let effective_limit = if limit == 0 { -1i64 } else { limit as i64 };
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM pending_urls
                WHERE source = ?1 AND status = 'pending'
                ORDER BY discovered_at ASC, id ASC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![source, effective_limit], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let now = Utc::now().to_rfc3339();
        for id in &ids {
            tx.execute(
                "UPDATE pending_urls SET status = 'processing', updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }

        let mut leased = Vec::with_capacity(ids.len());
        for id in &ids {
            let mut stmt = tx.prepare("SELECT * FROM pending_urls WHERE id = ?")?;
            leased.push(stmt.query_row(params![id], row_to_pending_url)?);
        }

        tx.commit()?;
        Ok(leased)
    }

    /// PROCESSING → COMPLETED, setting the processed timestamp.
    pub fn mark_completed(&self, url_id: i64) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            UPDATE pending_urls
            SET status = 'completed', processed_at = ?1, updated_at = ?1
            WHERE id = ?2
            "#,
            params![now, url_id],
        )?;
        Ok(())
    }

    /// Record a failure. Retries remaining → back to PENDING; exhausted →
    /// FAILED with the processed timestamp set.
    pub fn mark_failed(&self, url_id: i64, error_message: &str) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let row: Option<(i64, i64)> = to_option(tx.query_row(
            "SELECT retry_count, max_retries FROM pending_urls WHERE id = ?",
            params![url_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))?;
        let Some((retry_count, max_retries)) = row else {
            return Ok(());
        };

        let now = Utc::now().to_rfc3339();
        let retries = retry_count + 1;
        let error = truncate_error(error_message, ERROR_LOG_MAX_BYTES);

        if retries >= max_retries {
            tx.execute(
                r#"
                UPDATE pending_urls
                SET status = 'failed', retry_count = ?1, error_message = ?2,
                    processed_at = ?3, updated_at = ?3
                WHERE id = ?4
                "#,
                params![retries, error, now, url_id],
            )?;
        } else {
            tx.execute(
                r#"
                UPDATE pending_urls
                SET status = 'pending', retry_count = ?1, error_message = ?2,
                    updated_at = ?3
                WHERE id = ?4
                "#,
                params![retries, error, now, url_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Reset PROCESSING rows whose last update is older than the threshold.
    /// Handles crawlers that died mid-lease.
    pub fn reset_stale_processing(&self, minutes: i64) -> Result<usize> {
        let conn = self.connect()?;
        let cutoff = (Utc::now() - Duration::minutes(minutes)).to_rfc3339();
        let count = conn.execute(
            r#"
            UPDATE pending_urls
            SET status = 'pending', updated_at = ?1
            WHERE status = 'processing' AND updated_at < ?2
            "#,
            params![Utc::now().to_rfc3339(), cutoff],
        )?;
        Ok(count)
    }

    /// Unconditionally reset PROCESSING → PENDING, optionally per source.
    /// Operator escape hatch; also called once at process start.
    pub fn force_reset_all_processing(&self, source: Option<&str>) -> Result<usize> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let count = conn.execute(
            r#"
            UPDATE pending_urls
            SET status = 'pending', updated_at = ?1
            WHERE status = 'processing' AND (?2 IS NULL OR source = ?2)
            "#,
            params![now, source],
        )?;
        Ok(count)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<PendingUrl>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM pending_urls WHERE id = ?")?;
        to_option(stmt.query_row(params![id], row_to_pending_url))
    }

    /// Queue counts by status, optionally filtered by source.
    pub fn stats(&self, source: Option<&str>) -> Result<QueueStats> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT status, COUNT(*) FROM pending_urls
            WHERE (?1 IS NULL OR source = ?1)
            GROUP BY status
            "#,
        )?;
        let rows = stmt.query_map(params![source], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match UrlStatus::from_str(&status) {
                Some(UrlStatus::Pending) => stats.pending = count,
                Some(UrlStatus::Processing) => stats.processing = count,
                Some(UrlStatus::Completed) => stats.completed = count,
                Some(UrlStatus::Failed) => stats.failed = count,
                None => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// Override the max_retries of a queued URL (operator/testing hook).
    pub fn set_max_retries(&self, url_id: i64, max_retries: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE pending_urls SET max_retries = ?1, updated_at = ?2 WHERE id = ?3",
            params![max_retries, Utc::now().to_rfc3339(), url_id],
        )?;
        Ok(())
    }

    /// Backdate a PROCESSING row's updated_at (testing hook for stale-lease
    /// recovery).
    #[doc(hidden)]
    pub fn backdate_updated_at(&self, url_id: i64, minutes: i64) -> Result<()> {
        let conn = self.connect()?;
        let backdated = (Utc::now() - Duration::minutes(minutes)).to_rfc3339();
        conn.execute(
            "UPDATE pending_urls SET updated_at = ?1 WHERE id = ?2",
            params![backdated, url_id],
        )?;
        Ok(())
    }
}

fn row_to_pending_url(row: &rusqlite::Row) -> rusqlite::Result<PendingUrl> {
    Ok(PendingUrl {
        id: row.get("id")?,
        url: row.get("url")?,
        url_hash: row.get("url_hash")?,
        source: row.get("source")?,
        status: UrlStatus::from_str(&row.get::<_, String>("status")?)
            .unwrap_or(UrlStatus::Pending),
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        error_message: row.get("error_message")?,
        discovered_at: parse_datetime(&row.get::<_, String>("discovered_at")?),
        processed_at: parse_datetime_opt(row.get("processed_at")?),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Article;
    use crate::repository::ArticleRepository;
    use tempfile::TempDir;

    fn setup() -> (TempDir, UrlQueueRepository, ArticleRepository) {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let articles = ArticleRepository::new(&db).unwrap();
        let queue = UrlQueueRepository::new(&db).unwrap();
        (dir, queue, articles)
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("https://example.com/news/{i}"))
            .collect()
    }

    #[test]
    fn add_urls_is_idempotent() {
        let (_dir, queue, _articles) = setup();
        assert_eq!(queue.add_urls(&urls(5), "UDN").unwrap(), 5);
        assert_eq!(queue.add_urls(&urls(5), "UDN").unwrap(), 0);
    }

    #[test]
    fn add_urls_dedupes_against_article_store() {
        let (_dir, queue, articles) = setup();
        let url = "https://example.com/news/0".to_string();
        articles
            .insert(&Article {
                id: 0,
                url: url.clone(),
                url_hash: compute_url_hash(&url),
                title: "t".into(),
                content: "c".into(),
                summary: None,
                author: None,
                source: "UDN".into(),
                crawler_name: "udn_article".into(),
                category: None,
                sub_category: None,
                tags: None,
                published_at: None,
                crawled_at: Utc::now(),
                raw_html: None,
                images: None,
            })
            .unwrap();

        // news/0 is already crawled; only news/1..4 may enter the queue
        assert_eq!(queue.add_urls(&urls(5), "UDN").unwrap(), 4);
    }

    #[test]
    fn lease_is_exclusive_and_fifo() {
        let (_dir, queue, _articles) = setup();
        queue.add_urls(&urls(5), "X").unwrap();

        let first = queue.lease("X", 3).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|u| u.status == UrlStatus::Processing));

        let second = queue.lease("X", 3).unwrap();
        assert_eq!(second.len(), 2);

        let third = queue.lease("X", 3).unwrap();
        assert!(third.is_empty());

        // FIFO: first lease got the oldest discoveries
        let first_ids: Vec<i64> = first.iter().map(|u| u.id).collect();
        let second_ids: Vec<i64> = second.iter().map(|u| u.id).collect();
        assert!(first_ids.iter().max() < second_ids.iter().min());
    }

    #[test]
    fn lease_zero_means_no_limit() {
        let (_dir, queue, _articles) = setup();
        queue.add_urls(&urls(7), "X").unwrap();
        assert_eq!(queue.lease("X", 0).unwrap().len(), 7);
    }

    #[test]
    fn mark_failed_retries_then_parks() {
        let (_dir, queue, _articles) = setup();
        queue.add_urls(&urls(1), "X").unwrap();
        let leased = queue.lease("X", 0).unwrap();
        let id = leased[0].id;

        // Retries 1 and 2 go back to PENDING with no processed_at
        for expected_retry in 1..DEFAULT_MAX_RETRIES {
            queue.mark_failed(id, "connect timeout").unwrap();
            let url = queue.get_by_id(id).unwrap().unwrap();
            assert_eq!(url.status, UrlStatus::Pending);
            assert_eq!(url.retry_count, expected_retry);
            assert!(url.processed_at.is_none());
            queue.lease("X", 0).unwrap();
        }

        // Third failure exhausts retries
        queue.mark_failed(id, "connect timeout").unwrap();
        let url = queue.get_by_id(id).unwrap().unwrap();
        assert_eq!(url.status, UrlStatus::Failed);
        assert!(url.retry_count >= url.max_retries);
        assert!(url.processed_at.is_some());
    }

    #[test]
    fn zero_max_retries_fails_immediately() {
        let (_dir, queue, _articles) = setup();
        queue.add_urls(&urls(1), "X").unwrap();
        let leased = queue.lease("X", 0).unwrap();
        queue.set_max_retries(leased[0].id, 0).unwrap();

        queue.mark_failed(leased[0].id, "boom").unwrap();
        let url = queue.get_by_id(leased[0].id).unwrap().unwrap();
        assert_eq!(url.status, UrlStatus::Failed);
    }

    #[test]
    fn stale_processing_recovery() {
        let (_dir, queue, _articles) = setup();
        queue.add_urls(&urls(1), "X").unwrap();
        let leased = queue.lease("X", 1).unwrap();

        // Fresh lease is not stale
        assert_eq!(queue.reset_stale_processing(10).unwrap(), 0);

        // Simulate a worker that died 11 minutes ago
        queue.backdate_updated_at(leased[0].id, 11).unwrap();
        assert_eq!(queue.reset_stale_processing(10).unwrap(), 1);

        let releasable = queue.lease("X", 1).unwrap();
        assert_eq!(releasable.len(), 1);
        assert_eq!(releasable[0].id, leased[0].id);
    }

    #[test]
    fn force_reset_filters_by_source() {
        let (_dir, queue, _articles) = setup();
        queue.add_urls(&urls(2), "X").unwrap();
        queue
            .add_urls(&["https://other.com/1".to_string()], "Y")
            .unwrap();
        queue.lease("X", 0).unwrap();
        queue.lease("Y", 0).unwrap();

        assert_eq!(queue.force_reset_all_processing(Some("Y")).unwrap(), 1);
        assert_eq!(queue.force_reset_all_processing(None).unwrap(), 2);
        let stats = queue.stats(None).unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 0);
    }

    #[test]
    fn completed_sets_processed_at() {
        let (_dir, queue, _articles) = setup();
        queue.add_urls(&urls(1), "X").unwrap();
        let leased = queue.lease("X", 0).unwrap();
        queue.mark_completed(leased[0].id).unwrap();

        let url = queue.get_by_id(leased[0].id).unwrap().unwrap();
        assert_eq!(url.status, UrlStatus::Completed);
        assert!(url.processed_at.is_some());
    }
}
