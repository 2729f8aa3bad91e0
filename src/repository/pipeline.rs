//! Pipeline run, filter result, filter rule and force-include repository.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use super::{parse_datetime, parse_datetime_opt, to_option, RepositoryError, Result};
use crate::models::{
    truncate_error, AnalysisResult, FilterDecision, FilterResult, FilterRule, ForceInclude,
    PipelineRun, RuleConfig, RunStatus, Stage, ERROR_LOG_MAX_BYTES,
};

/// A filter result awaiting insertion.
#[derive(Debug, Clone)]
pub struct NewFilterResult {
    pub run_id: i64,
    pub article_id: i64,
    pub stage: Stage,
    pub decision: FilterDecision,
    pub confidence: Option<f64>,
    pub rule_name: Option<String>,
    pub reason: Option<String>,
}

/// An analysis result awaiting insertion.
#[derive(Debug, Clone)]
pub struct NewAnalysisResult {
    pub run_id: i64,
    pub article_id: i64,
    pub success: bool,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
}

/// Per-rule filtering statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStats {
    pub rule_name: String,
    pub description: String,
    pub rule_type: String,
    pub is_active: bool,
    pub total_filtered_count: i64,
}

/// SQLite-backed repository for the pipeline tables.
pub struct PipelineRepository {
    db_path: PathBuf,
}

impl PipelineRepository {
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
            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                current_stage TEXT,
                date_from TEXT,
                date_to TEXT,
                total_articles INTEGER NOT NULL DEFAULT 0,
                rule_filtered_count INTEGER NOT NULL DEFAULT 0,
                rule_passed_count INTEGER NOT NULL DEFAULT 0,
                analyzed_count INTEGER NOT NULL DEFAULT 0,
                force_included_count INTEGER NOT NULL DEFAULT 0,
                batch_id TEXT,
                started_at TEXT,
                completed_at TEXT,
                error_log TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS article_filter_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                article_id INTEGER NOT NULL,
                stage TEXT NOT NULL,
                decision TEXT NOT NULL,
                confidence REAL,
                rule_name TEXT,
                reason TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_filter_results_run
                ON article_filter_results(run_id, stage);

            CREATE TABLE IF NOT EXISTS article_analysis_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL,
                article_id INTEGER NOT NULL,
                success INTEGER NOT NULL,
                result_json TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_analysis_results_run
                ON article_analysis_results(run_id);

            CREATE TABLE IF NOT EXISTS filter_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                rule_type TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                config TEXT NOT NULL,
                total_filtered_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS force_include_articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                article_id INTEGER NOT NULL UNIQUE,
                reason TEXT NOT NULL,
                added_by TEXT,
                created_at TEXT NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    // ── Runs ─────────────────────────────────────────────────

    pub fn create_run(
        &self,
        name: &str,
        date_from: Option<DateTime<Utc>>,
        date_to: Option<DateTime<Utc>>,
    ) -> Result<PipelineRun> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO pipeline_runs (name, status, date_from, date_to, created_at)
            VALUES (?1, 'pending', ?2, ?3, ?4)
            "#,
            params![
                name,
                date_from.map(|dt| dt.to_rfc3339()),
                date_to.map(|dt| dt.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_run(id)?
            .ok_or_else(|| RepositoryError::NotFound(format!("pipeline run {id}")))
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<PipelineRun>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM pipeline_runs WHERE id = ?")?;
        to_option(stmt.query_row(params![run_id], row_to_run))
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM pipeline_runs ORDER BY created_at DESC LIMIT ?")?;
        let rows = stmt.query_map(params![limit as i64], row_to_run)?;
        let runs = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Aggregate counters across all runs:
    /// (total, completed, articles, rule_filtered, analyzed).
    pub fn run_totals(&self) -> Result<(i64, i64, i64, i64, i64)> {
        let conn = self.connect()?;
        let totals = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                SUM(total_articles),
                SUM(rule_filtered_count),
                SUM(analyzed_count)
            FROM pipeline_runs
            "#,
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                ))
            },
        )?;
        Ok(totals)
    }

    /// Update status and optionally the stage pointer. Stamps `started_at`
    /// on the first RUNNING transition, `completed_at` on terminal states,
    /// and clears the stage pointer on terminal states.
    pub fn update_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        current_stage: Option<Stage>,
        error_log: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let terminal = matches!(status, RunStatus::Completed | RunStatus::Failed);
        let error = error_log.map(|e| truncate_error(e, ERROR_LOG_MAX_BYTES));

        conn.execute(
            r#"
            UPDATE pipeline_runs
            SET status = ?1,
                current_stage = CASE WHEN ?2 THEN NULL
                                     ELSE COALESCE(?3, current_stage) END,
                error_log = COALESCE(?4, error_log),
                started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL
                                  THEN ?5 ELSE started_at END,
                completed_at = CASE WHEN ?2 THEN ?5 ELSE completed_at END
            WHERE id = ?6
            "#,
            params![
                status.as_str(),
                terminal,
                current_stage.map(|s| s.as_str()),
                error,
                now,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn set_total_articles(&self, run_id: i64, total: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE pipeline_runs SET total_articles = ?1 WHERE id = ?2",
            params![total, run_id],
        )?;
        Ok(())
    }

    /// Persist the provider's batch handle before any tracking rows exist,
    /// so a crashed run can resume polling the same batch.
    pub fn set_batch_id(&self, run_id: i64, batch_id: Option<&str>) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE pipeline_runs SET batch_id = ?1 WHERE id = ?2",
            params![batch_id, run_id],
        )?;
        Ok(())
    }

    /// Recompute run statistics from the authoritative result tables.
    pub fn refresh_run_stats(&self, run_id: i64) -> Result<()> {
        let conn = self.connect()?;

        let (filtered, passed, forced): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT
                SUM(CASE WHEN decision = 'filter' THEN 1 ELSE 0 END),
                SUM(CASE WHEN decision IN ('keep', 'force_include') THEN 1 ELSE 0 END),
                SUM(CASE WHEN decision = 'force_include' THEN 1 ELSE 0 END)
            FROM article_filter_results
            WHERE run_id = ?1 AND stage = 'rule_filter'
            "#,
            params![run_id],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                ))
            },
        )?;

        let analyzed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM article_analysis_results WHERE run_id = ?1 AND success = 1",
            params![run_id],
            |row| row.get(0),
        )?;

        conn.execute(
            r#"
            UPDATE pipeline_runs
            SET rule_filtered_count = ?1, rule_passed_count = ?2,
                force_included_count = ?3, analyzed_count = ?4
            WHERE id = ?5
            "#,
            params![filtered, passed, forced, analyzed, run_id],
        )?;
        Ok(())
    }

    /// Reset a run to re-execute from a stage: deletes stage artifacts,
    /// zeroes the matching counters, drops the batch handle if the analysis
    /// stage is included, and parks the run back at PENDING.
    pub fn reset_run(&self, run_id: i64, from_stage: Stage) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let stages = from_stage.and_later();
        for stage in &stages {
            tx.execute(
                "DELETE FROM article_filter_results WHERE run_id = ?1 AND stage = ?2",
                params![run_id, stage.as_str()],
            )?;
        }

        if stages.contains(&Stage::RuleFilter) {
            tx.execute(
                "UPDATE pipeline_runs SET rule_filtered_count = 0, rule_passed_count = 0,
                 force_included_count = 0 WHERE id = ?1",
                params![run_id],
            )?;
        }
        if stages.contains(&Stage::LlmAnalysis) {
            tx.execute(
                "DELETE FROM article_analysis_results WHERE run_id = ?1",
                params![run_id],
            )?;
            tx.execute(
                "UPDATE pipeline_runs SET analyzed_count = 0, batch_id = NULL WHERE id = ?1",
                params![run_id],
            )?;
        }

        tx.execute(
            r#"
            UPDATE pipeline_runs
            SET status = 'pending', current_stage = NULL,
                completed_at = NULL, error_log = NULL
            WHERE id = ?1
            "#,
            params![run_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    // ── Filter results ───────────────────────────────────────

    pub fn save_filter_results(&self, results: &[NewFilterResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for result in results {
            tx.execute(
                r#"
                INSERT INTO article_filter_results (
                    run_id, article_id, stage, decision, confidence,
                    rule_name, reason, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    result.run_id,
                    result.article_id,
                    result.stage.as_str(),
                    result.decision.as_str(),
                    result.confidence,
                    result.rule_name,
                    result.reason,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn filter_results_for_run(
        &self,
        run_id: i64,
        stage: Option<Stage>,
    ) -> Result<Vec<FilterResult>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM article_filter_results
            WHERE run_id = ?1 AND (?2 IS NULL OR stage = ?2)
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(
            params![run_id, stage.map(|s| s.as_str())],
            row_to_filter_result,
        )?;
        let results = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(results)
    }

    // ── Analysis results ─────────────────────────────────────

    pub fn save_analysis_results(&self, results: &[NewAnalysisResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for result in results {
            tx.execute(
                r#"
                INSERT INTO article_analysis_results (
                    run_id, article_id, success, result_json, error_message, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    result.run_id,
                    result.article_id,
                    result.success,
                    result.result_json,
                    result.error_message,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn analysis_results_for_run(&self, run_id: i64) -> Result<Vec<AnalysisResult>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM article_analysis_results WHERE run_id = ? ORDER BY id")?;
        let rows = stmt.query_map(params![run_id], row_to_analysis_result)?;
        let results = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(results)
    }

    // ── Filter rules ─────────────────────────────────────────

    /// Seed rules that do not exist yet. Existing rules are left untouched
    /// so operator edits survive restarts.
    pub fn ensure_rules(&self, defaults: &[(&str, &str, RuleConfig)]) -> Result<usize> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let mut seeded = 0;
        for (name, description, config) in defaults {
            let config_json = serde_json::to_string(config)?;
            seeded += conn.execute(
                r#"
                INSERT OR IGNORE INTO filter_rules (
                    name, description, rule_type, is_active, config,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)
                "#,
                params![name, description, config.rule_type(), config_json, now],
            )?;
        }
        Ok(seeded)
    }

    /// Active rules in registration (id) order.
    pub fn active_rules(&self) -> Result<Vec<FilterRule>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM filter_rules WHERE is_active = 1 ORDER BY id")?;
        let rows = stmt.query_map([], row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            if let Some(rule) = row? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    pub fn all_rules(&self) -> Result<Vec<FilterRule>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM filter_rules ORDER BY id")?;
        let rows = stmt.query_map([], row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            if let Some(rule) = row? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    pub fn increment_rule_filtered(&self, rule_id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE filter_rules
             SET total_filtered_count = total_filtered_count + 1, updated_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), rule_id],
        )?;
        Ok(())
    }

    pub fn set_rule_active(&self, name: &str, active: bool) -> Result<bool> {
        let conn = self.connect()?;
        let count = conn.execute(
            "UPDATE filter_rules SET is_active = ?1, updated_at = ?2 WHERE name = ?3",
            params![active, Utc::now().to_rfc3339(), name],
        )?;
        Ok(count > 0)
    }

    pub fn rule_stats(&self) -> Result<Vec<RuleStats>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT name, description, rule_type, is_active, total_filtered_count
             FROM filter_rules ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RuleStats {
                rule_name: row.get(0)?,
                description: row.get(1)?,
                rule_type: row.get(2)?,
                is_active: row.get::<_, i64>(3)? != 0,
                total_filtered_count: row.get(4)?,
            })
        })?;
        let stats = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    // ── Force include ────────────────────────────────────────

    pub fn add_force_include(
        &self,
        article_id: i64,
        reason: &str,
        added_by: Option<&str>,
    ) -> Result<ForceInclude> {
        let conn = self.connect()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO force_include_articles (article_id, reason, added_by, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![article_id, reason, added_by, Utc::now().to_rfc3339()],
        )?;
        if inserted == 0 {
            return Err(RepositoryError::NotFound(format!(
                "article {article_id} is already force-included"
            )));
        }
        let mut stmt =
            conn.prepare("SELECT * FROM force_include_articles WHERE article_id = ?")?;
        let entry = stmt.query_row(params![article_id], row_to_force_include)?;
        Ok(entry)
    }

    pub fn remove_force_include(&self, article_id: i64) -> Result<bool> {
        let conn = self.connect()?;
        let count = conn.execute(
            "DELETE FROM force_include_articles WHERE article_id = ?",
            params![article_id],
        )?;
        Ok(count > 0)
    }

    pub fn list_force_includes(&self) -> Result<Vec<ForceInclude>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM force_include_articles ORDER BY id")?;
        let rows = stmt.query_map([], row_to_force_include)?;
        let entries = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn force_include_ids(&self) -> Result<HashSet<i64>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT article_id FROM force_include_articles")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<PipelineRun> {
    Ok(PipelineRun {
        id: row.get("id")?,
        name: row.get("name")?,
        status: RunStatus::from_str(&row.get::<_, String>("status")?)
            .unwrap_or(RunStatus::Pending),
        current_stage: row
            .get::<_, Option<String>>("current_stage")?
            .and_then(|s| Stage::from_str(&s)),
        date_from: parse_datetime_opt(row.get("date_from")?),
        date_to: parse_datetime_opt(row.get("date_to")?),
        total_articles: row.get("total_articles")?,
        rule_filtered_count: row.get("rule_filtered_count")?,
        rule_passed_count: row.get("rule_passed_count")?,
        analyzed_count: row.get("analyzed_count")?,
        force_included_count: row.get("force_included_count")?,
        batch_id: row.get("batch_id")?,
        started_at: parse_datetime_opt(row.get("started_at")?),
        completed_at: parse_datetime_opt(row.get("completed_at")?),
        error_log: row.get("error_log")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
    })
}

fn row_to_filter_result(row: &rusqlite::Row) -> rusqlite::Result<FilterResult> {
    Ok(FilterResult {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        article_id: row.get("article_id")?,
        stage: Stage::from_str(&row.get::<_, String>("stage")?).unwrap_or(Stage::RuleFilter),
        decision: FilterDecision::from_str(&row.get::<_, String>("decision")?)
            .unwrap_or(FilterDecision::Keep),
        confidence: row.get("confidence")?,
        rule_name: row.get("rule_name")?,
        reason: row.get("reason")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
    })
}

fn row_to_analysis_result(row: &rusqlite::Row) -> rusqlite::Result<AnalysisResult> {
    Ok(AnalysisResult {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        article_id: row.get("article_id")?,
        success: row.get::<_, i64>("success")? != 0,
        result_json: row.get("result_json")?,
        error_message: row.get("error_message")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
    })
}

/// Rows with unparseable configs are skipped rather than failing the query.
fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<Option<FilterRule>> {
    let rule_type: String = row.get("rule_type")?;
    let config_json: String = row.get("config")?;
    let Some(config) = RuleConfig::from_parts(&rule_type, &config_json) else {
        return Ok(None);
    };
    Ok(Some(FilterRule {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        config,
        total_filtered_count: row.get("total_filtered_count")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    }))
}

fn row_to_force_include(row: &rusqlite::Row) -> rusqlite::Result<ForceInclude> {
    Ok(ForceInclude {
        id: row.get("id")?,
        article_id: row.get("article_id")?,
        reason: row.get("reason")?,
        added_by: row.get("added_by")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KeywordRuleConfig, MatchField};
    use tempfile::TempDir;

    fn repo() -> (TempDir, PipelineRepository) {
        let dir = TempDir::new().unwrap();
        let repo = PipelineRepository::new(&dir.path().join("test.db")).unwrap();
        (dir, repo)
    }

    #[test]
    fn run_lifecycle_stamps_timestamps() {
        let (_dir, repo) = repo();
        let run = repo.create_run("test run", None, None).unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.current_stage.is_none());

        repo.update_run_status(run.id, RunStatus::Running, Some(Stage::Fetch), None)
            .unwrap();
        let run = repo.get_run(run.id).unwrap().unwrap();
        assert!(run.started_at.is_some());
        assert_eq!(run.current_stage, Some(Stage::Fetch));

        repo.update_run_status(run.id, RunStatus::Completed, None, None)
            .unwrap();
        let run = repo.get_run(run.id).unwrap().unwrap();
        assert!(run.completed_at.is_some());
        // stage pointer cleared on terminal status
        assert!(run.current_stage.is_none());
    }

    #[test]
    fn reset_deletes_artifacts_and_batch_id() {
        let (_dir, repo) = repo();
        let run = repo.create_run("resettable", None, None).unwrap();
        repo.set_batch_id(run.id, Some("batch_abc")).unwrap();
        repo.save_filter_results(&[NewFilterResult {
            run_id: run.id,
            article_id: 1,
            stage: Stage::RuleFilter,
            decision: FilterDecision::Keep,
            confidence: None,
            rule_name: None,
            reason: None,
        }])
        .unwrap();
        repo.save_analysis_results(&[NewAnalysisResult {
            run_id: run.id,
            article_id: 1,
            success: true,
            result_json: None,
            error_message: None,
        }])
        .unwrap();

        repo.reset_run(run.id, Stage::RuleFilter).unwrap();
        let run = repo.get_run(run.id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.batch_id.is_none());
        assert!(repo
            .filter_results_for_run(run.id, None)
            .unwrap()
            .is_empty());
        assert!(repo.analysis_results_for_run(run.id).unwrap().is_empty());
    }

    #[test]
    fn refresh_stats_counts_decisions() {
        let (_dir, repo) = repo();
        let run = repo.create_run("stats", None, None).unwrap();
        let results: Vec<NewFilterResult> = [
            (1, FilterDecision::Keep),
            (2, FilterDecision::Filter),
            (3, FilterDecision::Filter),
            (4, FilterDecision::ForceInclude),
        ]
        .into_iter()
        .map(|(article_id, decision)| NewFilterResult {
            run_id: run.id,
            article_id,
            stage: Stage::RuleFilter,
            decision,
            confidence: None,
            rule_name: None,
            reason: None,
        })
        .collect();
        repo.save_filter_results(&results).unwrap();
        repo.refresh_run_stats(run.id).unwrap();

        let run = repo.get_run(run.id).unwrap().unwrap();
        assert_eq!(run.rule_filtered_count, 2);
        assert_eq!(run.rule_passed_count, 2);
        assert_eq!(run.force_included_count, 1);
    }

    #[test]
    fn rules_seed_once() {
        let (_dir, repo) = repo();
        let defaults = [(
            "ad_filter",
            "過濾廣告",
            RuleConfig::Keyword(KeywordRuleConfig {
                keywords: vec!["廣告".to_string()],
                match_fields: vec![MatchField::Title],
            }),
        )];
        assert_eq!(repo.ensure_rules(&defaults).unwrap(), 1);
        assert_eq!(repo.ensure_rules(&defaults).unwrap(), 0);
        assert_eq!(repo.active_rules().unwrap().len(), 1);
    }

    #[test]
    fn force_include_is_unique() {
        let (_dir, repo) = repo();
        repo.add_force_include(42, "editor pick", Some("ops")).unwrap();
        assert!(repo.add_force_include(42, "again", None).is_err());
        assert!(repo.force_include_ids().unwrap().contains(&42));
        assert!(repo.remove_force_include(42).unwrap());
        assert!(!repo.remove_force_include(42).unwrap());
    }
}
