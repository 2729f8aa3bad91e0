//! Crawler configuration repository.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{parse_datetime, parse_datetime_opt, to_option, Result};
use crate::models::{
    truncate_error, CrawlerConfig, CrawlerKind, CrawlerRunStatus, ERROR_LOG_MAX_BYTES,
};

/// Result of one crawler tick, applied post-execution.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub status: CrawlerRunStatus,
    pub error: Option<String>,
    pub items_count: i64,
    pub next_run_time: Option<DateTime<Utc>>,
}

/// SQLite-backed repository for crawler configurations.
pub struct CrawlerConfigRepository {
    db_path: PathBuf,
}

impl CrawlerConfigRepository {
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
            CREATE TABLE IF NOT EXISTS crawler_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                interval_minutes INTEGER NOT NULL DEFAULT 60,
                timeout_seconds INTEGER NOT NULL DEFAULT 300,
                last_run_status TEXT NOT NULL DEFAULT 'idle',
                last_run_time TEXT,
                next_run_time TEXT,
                error_log TEXT,
                last_run_items_count INTEGER NOT NULL DEFAULT 0,
                total_items_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (interval_minutes >= 1),
                CHECK (timeout_seconds >= 1)
            );

            CREATE INDEX IF NOT EXISTS idx_crawler_configs_source
                ON crawler_configs(source, kind);
        "#,
        )?;
        Ok(())
    }

    /// Register a discovered crawler.
    ///
    /// Inserts a new row with the crawler's defaults; for existing rows
    /// only `display_name`, `source` and `kind` are refreshed; interval,
    /// active flag and statistics survive re-syncs.
    pub fn sync_crawler(
        &self,
        name: &str,
        display_name: &str,
        source: &str,
        kind: CrawlerKind,
        default_interval_minutes: i64,
        default_timeout_seconds: i64,
    ) -> Result<CrawlerConfig> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();

        let existing: Option<i64> = to_option(conn.query_row(
            "SELECT id FROM crawler_configs WHERE name = ?",
            params![name],
            |row| row.get(0),
        ))?;

        match existing {
            Some(id) => {
                conn.execute(
                    r#"
                    UPDATE crawler_configs
                    SET display_name = ?1, source = ?2, kind = ?3, updated_at = ?4
                    WHERE id = ?5
                    "#,
                    params![display_name, source, kind.as_str(), now, id],
                )?;
            }
            None => {
                conn.execute(
                    r#"
                    INSERT INTO crawler_configs (
                        name, display_name, kind, source, is_active,
                        interval_minutes, timeout_seconds, last_run_status,
                        created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, 'idle', ?7, ?7)
                    "#,
                    params![
                        name,
                        display_name,
                        kind.as_str(),
                        source,
                        default_interval_minutes.max(1),
                        default_timeout_seconds.max(1),
                        now,
                    ],
                )?;
            }
        }

        self.get_by_name(name)?
            .ok_or_else(|| super::RepositoryError::NotFound(format!("crawler {name}")))
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<CrawlerConfig>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM crawler_configs WHERE name = ?")?;
        to_option(stmt.query_row(params![name], row_to_config))
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<CrawlerConfig>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM crawler_configs WHERE id = ?")?;
        to_option(stmt.query_row(params![id], row_to_config))
    }

    /// All configs ordered by source, kind, name.
    pub fn get_all(&self) -> Result<Vec<CrawlerConfig>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM crawler_configs ORDER BY source, kind, name")?;
        let configs = stmt
            .query_map([], row_to_config)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(configs)
    }

    pub fn get_active(&self) -> Result<Vec<CrawlerConfig>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM crawler_configs WHERE is_active = 1 ORDER BY source, kind, name",
        )?;
        let configs = stmt
            .query_map([], row_to_config)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(configs)
    }

    /// Transition a crawler to RUNNING (visible to operators mid-tick).
    pub fn set_running(&self, name: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE crawler_configs SET last_run_status = 'running', updated_at = ?1 WHERE name = ?2",
            params![Utc::now().to_rfc3339(), name],
        )?;
        Ok(())
    }

    /// Apply the post-execution bookkeeping for a tick.
    pub fn finish_run(&self, name: &str, outcome: &TickOutcome) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let error_log = outcome
            .error
            .as_deref()
            .map(|e| truncate_error(e, ERROR_LOG_MAX_BYTES));
        conn.execute(
            r#"
            UPDATE crawler_configs
            SET last_run_status = ?1,
                error_log = ?2,
                last_run_items_count = ?3,
                total_items_count = total_items_count + ?3,
                last_run_time = ?4,
                next_run_time = ?5,
                updated_at = ?4
            WHERE name = ?6
            "#,
            params![
                outcome.status.as_str(),
                error_log,
                outcome.items_count,
                now,
                outcome.next_run_time.map(|dt| dt.to_rfc3339()),
                name,
            ],
        )?;
        Ok(())
    }

    /// Crash recovery: force all RUNNING crawlers back to IDLE.
    pub fn reset_running_to_idle(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count = conn.execute(
            "UPDATE crawler_configs SET last_run_status = 'idle', updated_at = ?1
             WHERE last_run_status = 'running'",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(count)
    }

    /// Flip the active flag; returns the updated config.
    pub fn toggle_active(&self, id: i64) -> Result<Option<CrawlerConfig>> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE crawler_configs SET is_active = 1 - is_active, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        self.get_by_id(id)
    }

    pub fn update_interval(&self, id: i64, interval_minutes: i64) -> Result<Option<CrawlerConfig>> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE crawler_configs SET interval_minutes = ?1, updated_at = ?2 WHERE id = ?3",
            params![interval_minutes.max(1), Utc::now().to_rfc3339(), id],
        )?;
        self.get_by_id(id)
    }

    pub fn update_next_run_time(&self, name: &str, next: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE crawler_configs SET next_run_time = ?1, updated_at = ?2 WHERE name = ?3",
            params![
                next.map(|dt| dt.to_rfc3339()),
                Utc::now().to_rfc3339(),
                name
            ],
        )?;
        Ok(())
    }
}

fn row_to_config(row: &rusqlite::Row) -> rusqlite::Result<CrawlerConfig> {
    Ok(CrawlerConfig {
        id: row.get("id")?,
        name: row.get("name")?,
        display_name: row.get("display_name")?,
        kind: CrawlerKind::from_str(&row.get::<_, String>("kind")?)
            .unwrap_or(CrawlerKind::List),
        source: row.get("source")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        interval_minutes: row.get("interval_minutes")?,
        timeout_seconds: row.get("timeout_seconds")?,
        last_run_status: CrawlerRunStatus::from_str(&row.get::<_, String>("last_run_status")?)
            .unwrap_or(CrawlerRunStatus::Idle),
        last_run_time: parse_datetime_opt(row.get("last_run_time")?),
        next_run_time: parse_datetime_opt(row.get("next_run_time")?),
        error_log: row.get("error_log")?,
        last_run_items_count: row.get("last_run_items_count")?,
        total_items_count: row.get("total_items_count")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}
