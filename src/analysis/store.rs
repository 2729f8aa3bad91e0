//! Analytical store writer.
//!
//! Persists the entity/event graph produced by the LLM, one article per
//! transaction. Failures are classified two ways: transient (connection
//! class, storage can simply be retried) and data (constraint class, the
//! article must be re-analyzed).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, ErrorCode, Transaction};
use tracing::{debug, info, warn};

use super::schema::NewsAnalysis;
use super::{parse_article_id, AnalysisResponse};
use crate::models::{parse_string_list, Article};

/// Dedup window around published_at when matching external ids.
const DEDUP_WINDOW_DAYS: i64 = 7;

/// A single article storage failure.
#[derive(Debug, Clone)]
pub struct StoreFailure {
    pub article_id: i64,
    pub error_message: String,
    /// True for connection-class errors (retry storage only); false for
    /// data errors (needs re-analysis).
    pub is_transient: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

type Result<T> = std::result::Result<T, StoreError>;

/// Whether a database error is connection-class (retryable without
/// re-calling the LLM).
fn is_transient(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(ffi_error, _) => matches!(
            ffi_error.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
        ),
        _ => false,
    }
}

/// SQLite-backed analytical store.
pub struct AnalyticsStore {
    db_path: PathBuf,
}

impl AnalyticsStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                published_at TEXT NOT NULL,
                external_id TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                source TEXT NOT NULL,
                author TEXT,
                keywords_original TEXT NOT NULL,
                sentiment_polarity INTEGER NOT NULL,
                sentiment_intensity INTEGER NOT NULL,
                sentiment_tone TEXT NOT NULL,
                framing_angle TEXT NOT NULL,
                framing_narrative_type TEXT NOT NULL,
                is_exclusive INTEGER NOT NULL,
                is_opinion INTEGER NOT NULL,
                has_update INTEGER NOT NULL,
                key_claims TEXT NOT NULL,
                virality_score INTEGER NOT NULL,
                category_normalized TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_articles_external
                ON articles(external_id, published_at);

            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name_normalized TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                UNIQUE(name_normalized, entity_type)
            );

            CREATE TABLE IF NOT EXISTS entity_aliases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id INTEGER NOT NULL,
                alias TEXT NOT NULL,
                UNIQUE(entity_id, alias)
            );

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name_normalized TEXT NOT NULL UNIQUE,
                topic_normalized TEXT NOT NULL,
                event_type TEXT NOT NULL,
                tags TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sub_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id INTEGER NOT NULL,
                name_normalized TEXT NOT NULL,
                event_time TEXT,
                UNIQUE(event_id, name_normalized)
            );

            CREATE TABLE IF NOT EXISTS article_entities (
                published_at TEXT NOT NULL,
                article_id INTEGER NOT NULL,
                entity_id INTEGER NOT NULL,
                name_in_article TEXT NOT NULL,
                role TEXT NOT NULL,
                sentiment_toward INTEGER NOT NULL,
                UNIQUE(published_at, article_id, entity_id)
            );

            CREATE TABLE IF NOT EXISTS article_events (
                published_at TEXT NOT NULL,
                article_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                sub_event_id INTEGER,
                is_main INTEGER NOT NULL,
                article_type TEXT NOT NULL,
                event_time TEXT,
                temporal_cues TEXT NOT NULL,
                UNIQUE(published_at, article_id, event_id)
            );

            CREATE TABLE IF NOT EXISTS entity_relations (
                source_id INTEGER NOT NULL,
                target_id INTEGER NOT NULL,
                relation_type TEXT NOT NULL,
                mention_count INTEGER NOT NULL DEFAULT 1,
                UNIQUE(source_id, target_id, relation_type)
            );

            CREATE TABLE IF NOT EXISTS event_relations (
                entity_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                relation_type TEXT NOT NULL,
                mention_count INTEGER NOT NULL DEFAULT 1,
                UNIQUE(entity_id, event_id, relation_type)
            );
        "#,
        )?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Ok(conn)
    }

    /// Store a batch of successful analysis responses. Each article gets
    /// its own transaction; one failure never blocks the rest.
    pub fn store_batch(
        &self,
        articles_map: &HashMap<i64, Article>,
        responses: &[AnalysisResponse],
    ) -> (usize, Vec<StoreFailure>) {
        let mut stored = 0usize;
        let mut failures = Vec::new();

        let mut conn = match self.connect() {
            Ok(conn) => conn,
            Err(StoreError::Database(e)) => {
                // No connection at all: everything is transiently failed
                for resp in responses {
                    if let Some(article_id) = parse_article_id(&resp.custom_id) {
                        failures.push(StoreFailure {
                            article_id,
                            error_message: format!("DB connection error: {e}"),
                            is_transient: true,
                        });
                    }
                }
                return (0, failures);
            }
        };

        for resp in responses {
            let Some(article_id) = parse_article_id(&resp.custom_id) else {
                warn!(custom_id = %resp.custom_id, "Cannot parse article id");
                continue;
            };
            let Some(article) = articles_map.get(&article_id) else {
                failures.push(StoreFailure {
                    article_id,
                    error_message: "article not found in articles map".to_string(),
                    is_transient: false,
                });
                continue;
            };
            let Some(result_json) = resp.result_json.as_deref() else {
                failures.push(StoreFailure {
                    article_id,
                    error_message: "no result_json".to_string(),
                    is_transient: false,
                });
                continue;
            };
            let analysis = match NewsAnalysis::from_json(result_json) {
                Ok(analysis) => analysis,
                Err(e) => {
                    failures.push(StoreFailure {
                        article_id,
                        error_message: format!("JSON parse failed: {e}"),
                        is_transient: false,
                    });
                    continue;
                }
            };

            match store_single_article(&mut conn, article, &analysis) {
                Ok(()) => stored += 1,
                Err(StoreError::Database(e)) => {
                    let transient = is_transient(&e);
                    let error_message = if transient {
                        format!("DB connection error: {e}")
                    } else {
                        format!("DB data error: {e}")
                    };
                    warn!(article_id, transient, error = %e, "Analysis store failed");
                    failures.push(StoreFailure {
                        article_id,
                        error_message,
                        is_transient: transient,
                    });
                }
            }
        }

        info!(stored, failed = failures.len(), "Analytical store pass complete");
        (stored, failures)
    }

    /// Delete articles and their junction rows by external id. Shared
    /// entities, events and relations are kept.
    pub fn delete_by_external_ids(&self, external_ids: &[String]) -> Result<usize> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        let mut article_ids: Vec<i64> = Vec::new();
        for chunk in external_ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!("SELECT id FROM articles WHERE external_id IN ({placeholders})");
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                row.get::<_, i64>(0)
            })?;
            for row in rows {
                article_ids.push(row?);
            }
        }
        if article_ids.is_empty() {
            debug!("No matching articles in analytical store");
            return Ok(0);
        }

        let mut deleted = 0usize;
        for chunk in article_ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            for table in ["article_entities", "article_events"] {
                let sql = format!("DELETE FROM {table} WHERE article_id IN ({placeholders})");
                tx.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
            }
            let sql = format!("DELETE FROM articles WHERE id IN ({placeholders})");
            deleted += tx.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
        }

        tx.commit()?;
        info!(deleted, "Deleted articles and junction rows from analytical store");
        Ok(deleted)
    }

    /// Row count helper used by operators and tests.
    pub fn count(&self, table: &str) -> Result<i64> {
        let conn = self.connect()?;
        let allowed = [
            "articles",
            "entities",
            "entity_aliases",
            "events",
            "sub_events",
            "article_entities",
            "article_events",
            "entity_relations",
            "event_relations",
        ];
        if !allowed.contains(&table) {
            return Ok(0);
        }
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count)
    }
}

/// Insert one article and its full graph in a single transaction.
fn store_single_article(
    conn: &mut Connection,
    article: &Article,
    analysis: &NewsAnalysis,
) -> Result<()> {
    // Operational store timestamps are naive UTC; attach UTC here
    let published_at = article.published_at.unwrap_or(article.crawled_at);

    let tx = conn.transaction()?;

    if article_exists(&tx, &article.url_hash, published_at)? {
        debug!(external_id = %article.url_hash, "Article already stored, skipping");
        tx.commit()?;
        return Ok(());
    }

    let article_row_id = insert_article(&tx, article, analysis, published_at)?;
    let entity_map = upsert_entities(&tx, analysis)?;
    let event_map = upsert_events(&tx, analysis)?;
    let sub_event_map = insert_sub_events(&tx, analysis, &event_map)?;
    insert_article_entities(&tx, article_row_id, published_at, analysis, &entity_map)?;
    insert_article_events(
        &tx,
        article_row_id,
        published_at,
        analysis,
        &event_map,
        &sub_event_map,
    )?;
    upsert_entity_relations(&tx, analysis, &entity_map)?;
    upsert_event_relations(&tx, analysis, &entity_map, &event_map)?;

    tx.commit()?;
    debug!(article_id = article.id, row = article_row_id, "Stored article graph");
    Ok(())
}

/// Scan for the same external id within ±7 days of the published time.
fn article_exists(
    tx: &Transaction,
    external_id: &str,
    published_at: DateTime<Utc>,
) -> Result<bool> {
    let min_ts = (published_at - Duration::days(DEDUP_WINDOW_DAYS)).to_rfc3339();
    let max_ts = (published_at + Duration::days(DEDUP_WINDOW_DAYS)).to_rfc3339();
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM articles
             WHERE external_id = ?1 AND published_at >= ?2 AND published_at <= ?3
             LIMIT 1",
            params![external_id, min_ts, max_ts],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(found.is_some())
}

fn insert_article(
    tx: &Transaction,
    article: &Article,
    analysis: &NewsAnalysis,
    published_at: DateTime<Utc>,
) -> Result<i64> {
    let keywords = article
        .tags
        .as_deref()
        .map(parse_string_list)
        .unwrap_or_default();

    tx.execute(
        r#"
        INSERT INTO articles (
            published_at, external_id, url, title, source, author,
            keywords_original,
            sentiment_polarity, sentiment_intensity, sentiment_tone,
            framing_angle, framing_narrative_type,
            is_exclusive, is_opinion, has_update, key_claims, virality_score,
            category_normalized
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
        "#,
        params![
            published_at.to_rfc3339(),
            article.url_hash,
            article.url,
            article.title,
            article.source,
            article.author,
            serde_json::to_string(&keywords).unwrap_or_else(|_| "[]".to_string()),
            analysis.sentiment.polarity,
            analysis.sentiment.intensity,
            analysis.sentiment.tone.as_str(),
            analysis.framing.angle,
            analysis.framing.narrative_type.as_str(),
            analysis.signals.is_exclusive,
            analysis.signals.is_opinion,
            analysis.signals.has_update,
            serde_json::to_string(&analysis.signals.key_claims)
                .unwrap_or_else(|_| "[]".to_string()),
            analysis.signals.virality_score,
            analysis.category_normalized.as_str(),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Upsert entities by (name_normalized, type), recording the in-article
/// name as an alias when it differs. Returns name_normalized → id.
fn upsert_entities(tx: &Transaction, analysis: &NewsAnalysis) -> Result<HashMap<String, i64>> {
    let mut entity_map = HashMap::new();
    for entity in &analysis.entities {
        tx.execute(
            "INSERT OR IGNORE INTO entities (name_normalized, entity_type) VALUES (?1, ?2)",
            params![entity.name_normalized, entity.entity_type.as_str()],
        )?;
        let entity_id: i64 = tx.query_row(
            "SELECT id FROM entities WHERE name_normalized = ?1 AND entity_type = ?2",
            params![entity.name_normalized, entity.entity_type.as_str()],
            |row| row.get(0),
        )?;
        if entity.name != entity.name_normalized {
            tx.execute(
                "INSERT OR IGNORE INTO entity_aliases (entity_id, alias) VALUES (?1, ?2)",
                params![entity_id, entity.name],
            )?;
        }
        entity_map.insert(entity.name_normalized.clone(), entity_id);
    }
    Ok(entity_map)
}

/// Upsert events by name_normalized, refreshing topic/type/tags. Returns
/// name_normalized → id.
fn upsert_events(tx: &Transaction, analysis: &NewsAnalysis) -> Result<HashMap<String, i64>> {
    let mut event_map = HashMap::new();
    for event in &analysis.events {
        let tags = serde_json::to_string(&event.tags).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            r#"
            INSERT INTO events (name_normalized, topic_normalized, event_type, tags)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name_normalized) DO UPDATE SET
                topic_normalized = excluded.topic_normalized,
                event_type = excluded.event_type,
                tags = excluded.tags
            "#,
            params![
                event.name_normalized,
                event.topic_normalized,
                event.event_type.as_str(),
                tags
            ],
        )?;
        let event_id: i64 = tx.query_row(
            "SELECT id FROM events WHERE name_normalized = ?1",
            params![event.name_normalized],
            |row| row.get(0),
        )?;
        event_map.insert(event.name_normalized.clone(), event_id);
    }
    Ok(event_map)
}

/// Insert sub-events with conflict-update of event_time. Returns
/// (event_name, sub_event_name) → id.
fn insert_sub_events(
    tx: &Transaction,
    analysis: &NewsAnalysis,
    event_map: &HashMap<String, i64>,
) -> Result<HashMap<(String, String), i64>> {
    let mut sub_event_map = HashMap::new();
    for event in &analysis.events {
        let Some(sub_name) = event.sub_event_normalized.as_deref() else {
            continue;
        };
        let Some(&event_id) = event_map.get(&event.name_normalized) else {
            continue;
        };
        let event_time = parse_event_date(event.event_time.as_deref());
        tx.execute(
            r#"
            INSERT INTO sub_events (event_id, name_normalized, event_time)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(event_id, name_normalized) DO UPDATE SET
                event_time = COALESCE(excluded.event_time, sub_events.event_time)
            "#,
            params![event_id, sub_name, event_time.map(|d| d.to_string())],
        )?;
        let sub_event_id: i64 = tx.query_row(
            "SELECT id FROM sub_events WHERE event_id = ?1 AND name_normalized = ?2",
            params![event_id, sub_name],
            |row| row.get(0),
        )?;
        sub_event_map.insert(
            (event.name_normalized.clone(), sub_name.to_string()),
            sub_event_id,
        );
    }
    Ok(sub_event_map)
}

fn insert_article_entities(
    tx: &Transaction,
    article_row_id: i64,
    published_at: DateTime<Utc>,
    analysis: &NewsAnalysis,
    entity_map: &HashMap<String, i64>,
) -> Result<()> {
    for entity in &analysis.entities {
        let Some(&entity_id) = entity_map.get(&entity.name_normalized) else {
            continue;
        };
        tx.execute(
            r#"
            INSERT OR IGNORE INTO article_entities (
                published_at, article_id, entity_id,
                name_in_article, role, sentiment_toward
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                published_at.to_rfc3339(),
                article_row_id,
                entity_id,
                entity.name,
                entity.role.as_str(),
                entity.sentiment_toward,
            ],
        )?;
    }
    Ok(())
}

fn insert_article_events(
    tx: &Transaction,
    article_row_id: i64,
    published_at: DateTime<Utc>,
    analysis: &NewsAnalysis,
    event_map: &HashMap<String, i64>,
    sub_event_map: &HashMap<(String, String), i64>,
) -> Result<()> {
    for event in &analysis.events {
        let Some(&event_id) = event_map.get(&event.name_normalized) else {
            continue;
        };
        let sub_event_id = event.sub_event_normalized.as_deref().and_then(|sub| {
            sub_event_map
                .get(&(event.name_normalized.clone(), sub.to_string()))
                .copied()
        });
        let temporal_cues =
            serde_json::to_string(&event.temporal_cues).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            r#"
            INSERT OR IGNORE INTO article_events (
                published_at, article_id, event_id, sub_event_id,
                is_main, article_type, event_time, temporal_cues
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                published_at.to_rfc3339(),
                article_row_id,
                event_id,
                sub_event_id,
                event.is_main,
                event.article_type.as_str(),
                parse_event_date(event.event_time.as_deref()).map(|d| d.to_string()),
                temporal_cues,
            ],
        )?;
    }
    Ok(())
}

/// Relation edges are upserted with a mention counter. Edges whose
/// endpoints were not produced in this response are silently skipped.
fn upsert_entity_relations(
    tx: &Transaction,
    analysis: &NewsAnalysis,
    entity_map: &HashMap<String, i64>,
) -> Result<()> {
    for relation in &analysis.entity_relations {
        let (Some(&source_id), Some(&target_id)) = (
            entity_map.get(&relation.source),
            entity_map.get(&relation.target),
        ) else {
            debug!(
                source = %relation.source,
                target = %relation.target,
                "Skipping entity relation with missing endpoint"
            );
            continue;
        };
        tx.execute(
            r#"
            INSERT INTO entity_relations (source_id, target_id, relation_type)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(source_id, target_id, relation_type)
                DO UPDATE SET mention_count = mention_count + 1
            "#,
            params![source_id, target_id, relation.relation_type.as_str()],
        )?;
    }
    Ok(())
}

fn upsert_event_relations(
    tx: &Transaction,
    analysis: &NewsAnalysis,
    entity_map: &HashMap<String, i64>,
    event_map: &HashMap<String, i64>,
) -> Result<()> {
    for relation in &analysis.event_relations {
        let (Some(&entity_id), Some(&event_id)) = (
            entity_map.get(&relation.entity),
            event_map.get(&relation.event),
        ) else {
            debug!(
                entity = %relation.entity,
                event = %relation.event,
                "Skipping event relation with missing endpoint"
            );
            continue;
        };
        tx.execute(
            r#"
            INSERT INTO event_relations (entity_id, event_id, relation_type)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity_id, event_id, relation_type)
                DO UPDATE SET mention_count = mention_count + 1
            "#,
            params![entity_id, event_id, relation.relation_type.as_str()],
        )?;
    }
    Ok(())
}

/// Parse "YYYY-MM-DD" into a date, or None.
fn parse_event_date(raw: Option<&str>) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw?, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::schema::sample_analysis_json;
    use crate::models::compute_url_hash;
    use tempfile::TempDir;

    fn article(id: i64, url: &str) -> Article {
        Article {
            id,
            url: url.to_string(),
            url_hash: compute_url_hash(url),
            title: "測試".to_string(),
            content: "內容".to_string(),
            summary: None,
            author: Some("記者".to_string()),
            source: "UDN".to_string(),
            crawler_name: "udn_article".to_string(),
            category: None,
            sub_category: None,
            tags: Some(r#"["京華城","柯文哲"]"#.to_string()),
            published_at: Some(Utc::now()),
            crawled_at: Utc::now(),
            raw_html: None,
            images: None,
        }
    }

    fn response(article_id: i64) -> AnalysisResponse {
        AnalysisResponse {
            custom_id: format!("article_{article_id}"),
            success: true,
            result_json: Some(sample_analysis_json()),
            error_message: None,
        }
    }

    fn setup() -> (TempDir, AnalyticsStore) {
        let dir = TempDir::new().unwrap();
        let store = AnalyticsStore::open(&dir.path().join("analytics.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn stores_full_graph() {
        let (_dir, store) = setup();
        let a = article(1, "https://example.com/news/1");
        let map = HashMap::from([(1, a)]);

        let (stored, failures) = store.store_batch(&map, &[response(1)]);
        assert_eq!(stored, 1);
        assert!(failures.is_empty());

        assert_eq!(store.count("articles").unwrap(), 1);
        assert_eq!(store.count("entities").unwrap(), 2);
        // "柯市長" differs from "柯文哲": one alias row
        assert_eq!(store.count("entity_aliases").unwrap(), 1);
        assert_eq!(store.count("events").unwrap(), 1);
        assert_eq!(store.count("sub_events").unwrap(), 1);
        assert_eq!(store.count("article_entities").unwrap(), 2);
        assert_eq!(store.count("article_events").unwrap(), 1);
        assert_eq!(store.count("entity_relations").unwrap(), 1);
        assert_eq!(store.count("event_relations").unwrap(), 1);
    }

    #[test]
    fn storing_twice_is_idempotent() {
        let (_dir, store) = setup();
        let a = article(1, "https://example.com/news/1");
        let map = HashMap::from([(1, a)]);

        store.store_batch(&map, &[response(1)]);
        let (stored, failures) = store.store_batch(&map, &[response(1)]);

        // Dedup by external id within the ±7 day window
        assert_eq!(stored, 1);
        assert!(failures.is_empty());
        assert_eq!(store.count("articles").unwrap(), 1);
        assert_eq!(store.count("article_entities").unwrap(), 2);
        assert_eq!(store.count("article_events").unwrap(), 1);
    }

    #[test]
    fn shared_entities_are_reused_across_articles() {
        let (_dir, store) = setup();
        let map = HashMap::from([
            (1, article(1, "https://example.com/news/1")),
            (2, article(2, "https://example.com/news/2")),
        ]);

        let (stored, _) = store.store_batch(&map, &[response(1), response(2)]);
        assert_eq!(stored, 2);
        // Same normalized entities/events, two articles
        assert_eq!(store.count("articles").unwrap(), 2);
        assert_eq!(store.count("entities").unwrap(), 2);
        assert_eq!(store.count("events").unwrap(), 1);
        assert_eq!(store.count("article_entities").unwrap(), 4);

        // Relation edge counted twice
        let conn = store.connect().unwrap();
        let mentions: i64 = conn
            .query_row("SELECT mention_count FROM entity_relations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(mentions, 2);
    }

    #[test]
    fn missing_article_and_bad_json_are_data_failures() {
        let (_dir, store) = setup();
        let map = HashMap::from([(1, article(1, "https://example.com/news/1"))]);

        let bad_json = AnalysisResponse {
            custom_id: "article_1".to_string(),
            success: true,
            result_json: Some("{\"broken\": true}".to_string()),
            error_message: None,
        };
        let missing = response(2);

        let (stored, failures) = store.store_batch(&map, &[bad_json, missing]);
        assert_eq!(stored, 0);
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| !f.is_transient));
    }

    #[test]
    fn delete_by_external_ids_keeps_shared_graph() {
        let (_dir, store) = setup();
        let a = article(1, "https://example.com/news/1");
        let external_id = a.url_hash.clone();
        let map = HashMap::from([(1, a)]);
        store.store_batch(&map, &[response(1)]);

        let deleted = store.delete_by_external_ids(&[external_id]).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count("articles").unwrap(), 0);
        assert_eq!(store.count("article_entities").unwrap(), 0);
        assert_eq!(store.count("article_events").unwrap(), 0);
        // Shared graph survives
        assert_eq!(store.count("entities").unwrap(), 2);
        assert_eq!(store.count("events").unwrap(), 1);
        assert_eq!(store.count("entity_relations").unwrap(), 1);

        assert_eq!(store.delete_by_external_ids(&[]).unwrap(), 0);
    }

    #[test]
    fn transient_classification() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(is_transient(&busy));

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!is_transient(&constraint));
    }
}
