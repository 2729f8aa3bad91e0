//! Pipeline statistics and reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{FilterDecision, Stage};
use crate::repository::{Result, RuleStats, Store};

/// Detailed statistics for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub run_id: i64,
    pub name: String,
    pub status: String,
    pub total_articles: i64,
    pub rule_filtered_count: i64,
    pub rule_passed_count: i64,
    pub analyzed_count: i64,
    pub force_included_count: i64,
    /// Percentage of the window filtered by rules.
    pub rule_filter_rate: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

/// Aggregate statistics across all runs.
#[derive(Debug, Clone, Serialize)]
pub struct OverallStats {
    pub total_runs: i64,
    pub completed_runs: i64,
    pub total_articles_processed: i64,
    pub total_rule_filtered: i64,
    pub total_analyzed: i64,
    pub avg_rule_filter_rate: f64,
}

/// Read-side statistics over the pipeline tables.
pub struct StatisticsService {
    store: Store,
}

impl StatisticsService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn run_stats(&self, run_id: i64) -> Result<Option<RunStats>> {
        let Some(run) = self.store.pipeline().get_run(run_id)? else {
            return Ok(None);
        };

        let rule_filter_rate = if run.total_articles > 0 {
            (run.rule_filtered_count as f64 / run.total_articles as f64 * 10_000.0).round()
                / 100.0
        } else {
            0.0
        };
        let duration_seconds = match (run.started_at, run.completed_at) {
            (Some(started), Some(completed)) => {
                Some(((completed - started).num_milliseconds() as f64 / 10.0).round() / 100.0)
            }
            _ => None,
        };

        Ok(Some(RunStats {
            run_id: run.id,
            name: run.name,
            status: run.status.as_str().to_string(),
            total_articles: run.total_articles,
            rule_filtered_count: run.rule_filtered_count,
            rule_passed_count: run.rule_passed_count,
            analyzed_count: run.analyzed_count,
            force_included_count: run.force_included_count,
            rule_filter_rate,
            started_at: run.started_at,
            completed_at: run.completed_at,
            duration_seconds,
        }))
    }

    pub fn rule_stats(&self) -> Result<Vec<RuleStats>> {
        self.store.pipeline().rule_stats()
    }

    pub fn overall_stats(&self) -> Result<OverallStats> {
        let (total_runs, completed_runs, total_articles, total_rule_filtered, total_analyzed) =
            self.store.pipeline().run_totals()?;

        let avg_rule_filter_rate = if total_articles > 0 {
            (total_rule_filtered as f64 / total_articles as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        Ok(OverallStats {
            total_runs,
            completed_runs,
            total_articles_processed: total_articles,
            total_rule_filtered,
            total_analyzed,
            avg_rule_filter_rate,
        })
    }

    /// Articles a run filtered out, with the rule that did it.
    pub fn filtered_articles(
        &self,
        run_id: i64,
    ) -> Result<Vec<(i64, Option<String>, Option<String>)>> {
        let results = self
            .store
            .pipeline()
            .filter_results_for_run(run_id, Some(Stage::RuleFilter))?;
        Ok(results
            .into_iter()
            .filter(|r| r.decision == FilterDecision::Filter)
            .map(|r| (r.article_id, r.rule_name, r.reason))
            .collect())
    }

    /// Article ids that passed rule filtering in a run.
    pub fn passed_article_ids(&self, run_id: i64) -> Result<Vec<i64>> {
        let results = self
            .store
            .pipeline()
            .filter_results_for_run(run_id, Some(Stage::RuleFilter))?;
        Ok(results
            .into_iter()
            .filter(|r| r.decision.passes())
            .map(|r| r.article_id)
            .collect())
    }
}
