//! Article repository.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{parse_datetime, parse_datetime_opt, to_option, Result};
use crate::models::Article;

/// Parsed fields overwritten by a reparse pass. Everything except the raw
/// HTML and crawl provenance.
#[derive(Debug, Clone)]
pub struct ParsedFields {
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub tags: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub images: Option<String>,
}

/// Per-source article statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub total_count: i64,
    pub yesterday_count: i64,
    pub has_raw_html_count: i64,
    pub archived_count: i64,
}

/// SQLite-backed repository for parsed news articles.
pub struct ArticleRepository {
    db_path: PathBuf,
}

impl ArticleRepository {
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
            CREATE TABLE IF NOT EXISTS news_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                url_hash TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                summary TEXT,
                author TEXT,
                source TEXT NOT NULL,
                crawler_name TEXT NOT NULL,
                category TEXT,
                sub_category TEXT,
                tags TEXT,
                published_at TEXT,
                crawled_at TEXT NOT NULL,
                raw_html TEXT,
                images TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_news_articles_url_hash
                ON news_articles(url_hash);
            CREATE INDEX IF NOT EXISTS idx_news_articles_source
                ON news_articles(source);
            CREATE INDEX IF NOT EXISTS idx_news_articles_published
                ON news_articles(published_at);
            CREATE INDEX IF NOT EXISTS idx_news_articles_crawler
                ON news_articles(crawler_name);
        "#,
        )?;
        Ok(())
    }

    /// Insert a new article, returning its row id.
    pub fn insert(&self, article: &Article) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO news_articles (
                url, url_hash, title, content, summary, author, source,
                crawler_name, category, sub_category, tags, published_at,
                crawled_at, raw_html, images
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                article.url,
                article.url_hash,
                article.title,
                article.content,
                article.summary,
                article.author,
                article.source,
                article.crawler_name,
                article.category,
                article.sub_category,
                article.tags,
                article.published_at.map(|dt| dt.to_rfc3339()),
                article.crawled_at.to_rfc3339(),
                article.raw_html,
                article.images,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<Article>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM news_articles WHERE id = ?")?;
        to_option(stmt.query_row(params![id], row_to_article))
    }

    pub fn get_by_url_hash(&self, url_hash: &str) -> Result<Option<Article>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM news_articles WHERE url_hash = ? LIMIT 1")?;
        to_option(stmt.query_row(params![url_hash], row_to_article))
    }

    /// Fetch articles by id, preserving no particular order.
    pub fn get_many(&self, ids: &[i64]) -> Result<Vec<Article>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connect()?;
        let mut articles = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT * FROM news_articles WHERE id IN ({placeholders})");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), row_to_article)?;
            for row in rows {
                articles.push(row?);
            }
        }
        Ok(articles)
    }

    /// Count articles whose published_at falls in the window.
    pub fn count_for_window(
        &self,
        date_from: Option<DateTime<Utc>>,
        date_to: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM news_articles
            WHERE (?1 IS NULL OR published_at >= ?1)
              AND (?2 IS NULL OR published_at <= ?2)
            "#,
            params![
                date_from.map(|dt| dt.to_rfc3339()),
                date_to.map(|dt| dt.to_rfc3339())
            ],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Page through articles in the window, newest first.
    pub fn fetch_for_window(
        &self,
        date_from: Option<DateTime<Utc>>,
        date_to: Option<DateTime<Utc>>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Article>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM news_articles
            WHERE (?1 IS NULL OR published_at >= ?1)
              AND (?2 IS NULL OR published_at <= ?2)
            ORDER BY published_at DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )?;
        let rows = stmt.query_map(
            params![
                date_from.map(|dt| dt.to_rfc3339()),
                date_to.map(|dt| dt.to_rfc3339()),
                limit as i64,
                offset as i64,
            ],
            row_to_article,
        )?;
        let articles = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(articles)
    }

    /// Articles for a source whose raw HTML is still in the database.
    pub fn with_raw_html(&self, source: &str) -> Result<Vec<Article>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM news_articles
            WHERE source = ? AND raw_html IS NOT NULL AND raw_html != ''
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![source], row_to_article)?;
        let articles = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(articles)
    }

    pub fn count_with_raw_html(&self, source: &str) -> Result<i64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM news_articles
             WHERE source = ? AND raw_html IS NOT NULL AND raw_html != ''",
            params![source],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Overwrite parsed fields in place (reparse). Batched in one
    /// transaction so a crash loses at most one flush of work.
    pub fn apply_parsed_batch(&self, updates: &[(i64, ParsedFields)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        for (article_id, fields) in updates {
            tx.execute(
                r#"
                UPDATE news_articles
                SET title = ?1, content = ?2, summary = ?3, author = ?4,
                    category = ?5, sub_category = ?6, tags = ?7,
                    published_at = ?8, images = ?9
                WHERE id = ?10
                "#,
                params![
                    fields.title,
                    fields.content,
                    fields.summary,
                    fields.author,
                    fields.category,
                    fields.sub_category,
                    fields.tags,
                    fields.published_at.map(|dt| dt.to_rfc3339()),
                    fields.images,
                    article_id,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All distinct sources present in the store.
    pub fn sources(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT source FROM news_articles ORDER BY source")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let sources = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    /// Per-source statistics (total, yesterday's crawl, raw HTML counts).
    pub fn source_stats(&self) -> Result<Vec<SourceStats>> {
        let today = Utc::now().date_naive();
        let yesterday_start = (today - chrono::Duration::days(1))
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let yesterday_end = today.and_hms_opt(0, 0, 0).unwrap().and_utc();

        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT
                a.source,
                COUNT(*) AS total_count,
                SUM(CASE WHEN a.crawled_at >= ?1 AND a.crawled_at < ?2 THEN 1 ELSE 0 END)
                    AS yesterday_count,
                SUM(CASE WHEN a.raw_html IS NOT NULL AND a.raw_html != '' THEN 1 ELSE 0 END)
                    AS has_raw_html_count,
                (SELECT COUNT(*) FROM raw_html_archives r
                 WHERE r.source = a.source AND r.status = 'archived') AS archived_count
            FROM news_articles a
            GROUP BY a.source
            ORDER BY a.source
            "#,
        )?;
        let rows = stmt.query_map(
            params![yesterday_start.to_rfc3339(), yesterday_end.to_rfc3339()],
            |row| {
                Ok(SourceStats {
                    source: row.get(0)?,
                    total_count: row.get(1)?,
                    yesterday_count: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    has_raw_html_count: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    archived_count: row.get(4)?,
                })
            },
        )?;
        let stats = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }
}

pub(crate) fn row_to_article(row: &rusqlite::Row) -> rusqlite::Result<Article> {
    Ok(Article {
        id: row.get("id")?,
        url: row.get("url")?,
        url_hash: row.get("url_hash")?,
        title: row.get("title")?,
        content: row.get("content")?,
        summary: row.get("summary")?,
        author: row.get("author")?,
        source: row.get("source")?,
        crawler_name: row.get("crawler_name")?,
        category: row.get("category")?,
        sub_category: row.get("sub_category")?,
        tags: row.get("tags")?,
        published_at: parse_datetime_opt(row.get("published_at")?),
        crawled_at: parse_datetime(&row.get::<_, String>("crawled_at")?),
        raw_html: row.get("raw_html")?,
        images: row.get("images")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::compute_url_hash;
    use tempfile::TempDir;

    fn sample_article(url: &str, source: &str) -> Article {
        Article {
            id: 0,
            url: url.to_string(),
            url_hash: compute_url_hash(url),
            title: "測試標題".to_string(),
            content: "內容".to_string(),
            summary: None,
            author: Some("記者".to_string()),
            source: source.to_string(),
            crawler_name: format!("{}_article", source.to_lowercase()),
            category: Some("政治".to_string()),
            sub_category: None,
            tags: None,
            published_at: Some(Utc::now()),
            crawled_at: Utc::now(),
            raw_html: Some("<html></html>".to_string()),
            images: None,
        }
    }

    #[test]
    fn insert_and_window_queries() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        // Archive table referenced by source_stats
        super::super::ArchiveRepository::new(&db).unwrap();
        let repo = ArticleRepository::new(&db).unwrap();

        let id = repo
            .insert(&sample_article("https://example.com/news/1", "UDN"))
            .unwrap();
        assert!(id > 0);

        let count = repo.count_for_window(None, None).unwrap();
        assert_eq!(count, 1);

        let old_cutoff = Utc::now() + chrono::Duration::days(1);
        assert_eq!(repo.count_for_window(Some(old_cutoff), None).unwrap(), 0);

        let page = repo.fetch_for_window(None, None, 100, 0).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].source, "UDN");
    }

    #[test]
    fn parsed_batch_overwrites_fields() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        super::super::ArchiveRepository::new(&db).unwrap();
        let repo = ArticleRepository::new(&db).unwrap();
        let id = repo
            .insert(&sample_article("https://example.com/news/2", "CNA"))
            .unwrap();

        let fields = ParsedFields {
            title: "新標題".to_string(),
            content: "新內容".to_string(),
            summary: Some("摘要".to_string()),
            author: None,
            category: Some("財經".to_string()),
            sub_category: Some("股市".to_string()),
            tags: Some(r#"["台股","財報"]"#.to_string()),
            published_at: None,
            images: None,
        };
        repo.apply_parsed_batch(&[(id, fields)]).unwrap();

        let article = repo.get_by_id(id).unwrap().unwrap();
        assert_eq!(article.title, "新標題");
        assert_eq!(article.tag_list(), vec!["台股", "財報"]);
        // raw_html untouched by reparse
        assert!(article.raw_html.is_some());
    }
}
