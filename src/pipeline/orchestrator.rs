//! Pipeline orchestrator: drives a run through its stages.
//!
//! Stages are strict and never interleave. A polling timeout in the
//! analysis stage pauses the run instead of failing it: the batch keeps
//! running server-side and an operator resumes later.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use super::fetcher::ArticleFetcher;
use super::rules::RuleFilterService;
use super::{PipelineError, Result};
use crate::analysis::{AnalysisError, AnalysisService};
use crate::models::{Article, ForceInclude, PipelineRun, RunStatus, Stage};
use crate::repository::Store;

/// Page size for the rule-filter stage.
const FILTER_PAGE_SIZE: usize = 100;

/// Progress callback: (stage name, done, total).
pub type ProgressFn = dyn Fn(&str, usize, usize) + Send + Sync;

/// Orchestrates the FETCH → RULE_FILTER → LLM_ANALYSIS → STORE pipeline.
pub struct PipelineOrchestrator {
    store: Store,
    analysis: Arc<AnalysisService>,
    default_days: i64,
}

impl PipelineOrchestrator {
    pub fn new(store: Store, analysis: Arc<AnalysisService>, default_days: i64) -> Self {
        Self {
            store,
            analysis,
            default_days: default_days.max(1),
        }
    }

    pub fn create_run(
        &self,
        name: &str,
        date_from: Option<chrono::DateTime<Utc>>,
        date_to: Option<chrono::DateTime<Utc>>,
    ) -> Result<PipelineRun> {
        Ok(self.store.pipeline().create_run(name, date_from, date_to)?)
    }

    /// Create a run over the last N days with a generated name.
    pub fn create_quick_run(&self, days: Option<i64>) -> Result<PipelineRun> {
        let days = days.unwrap_or(self.default_days).max(1);
        let date_from = Utc::now() - Duration::days(days);
        let name = format!(
            "Quick run - last {days} day(s) - {}",
            Utc::now().format("%Y-%m-%d %H:%M")
        );
        self.create_run(&name, Some(date_from), None)
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<PipelineRun>> {
        Ok(self.store.pipeline().get_run(run_id)?)
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        Ok(self.store.pipeline().recent_runs(limit)?)
    }

    /// Execute the pipeline for a run.
    ///
    /// `until_stage` stops cleanly at the end of that stage, leaving the
    /// run PAUSED. `limit` caps processed articles; `Some(0)` processes
    /// nothing but completes normally. Unexpected errors mark the run
    /// FAILED with the error text captured.
    pub async fn run_pipeline(
        &self,
        run_id: i64,
        until_stage: Option<Stage>,
        limit: Option<usize>,
        progress: Option<&ProgressFn>,
    ) -> Result<PipelineRun> {
        RuleFilterService::new(self.store.clone()).ensure_default_rules()?;

        match self.execute(run_id, until_stage, limit, progress).await {
            Ok(run) => Ok(run),
            Err(e) => {
                warn!(run_id, error = %e, "Pipeline run failed");
                self.store.pipeline().update_run_status(
                    run_id,
                    RunStatus::Failed,
                    None,
                    Some(&e.to_string()),
                )?;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run_id: i64,
        until_stage: Option<Stage>,
        limit: Option<usize>,
        progress: Option<&ProgressFn>,
    ) -> Result<PipelineRun> {
        let pipeline = self.store.pipeline();
        let run = pipeline
            .get_run(run_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("pipeline run {run_id}")))?;
        let fetcher = ArticleFetcher::new(self.store.clone());

        // ── FETCH ────────────────────────────────────────────
        pipeline.update_run_status(run_id, RunStatus::Running, Some(Stage::Fetch), None)?;
        if let Some(progress) = progress {
            progress("fetch", 0, 0);
        }

        let mut total_articles = fetcher.count_for_run(&run)?;
        if let Some(limit) = limit {
            total_articles = total_articles.min(limit as i64);
        }
        pipeline.set_total_articles(run_id, total_articles)?;
        info!(run_id, total_articles, "Fetch stage complete");

        if until_stage == Some(Stage::Fetch) {
            pipeline.update_run_status(run_id, RunStatus::Paused, None, None)?;
            return self.finish(run_id);
        }

        // ── RULE_FILTER ──────────────────────────────────────
        pipeline.update_run_status(run_id, RunStatus::Running, Some(Stage::RuleFilter), None)?;

        let mut rule_filter = RuleFilterService::new(self.store.clone());
        let mut passed: Vec<Article> = Vec::new();
        let mut processed = 0usize;
        let mut offset = 0usize;
        let mut remaining = limit.map(|l| l as i64).unwrap_or(i64::MAX);

        while remaining > 0 {
            let page_size = FILTER_PAGE_SIZE.min(remaining.min(i64::MAX) as usize);
            let batch = fetcher.page(&run, offset, page_size)?;
            if batch.is_empty() {
                break;
            }

            let (batch_passed, results) = rule_filter.filter_batch(&batch, run_id)?;
            pipeline.save_filter_results(&results)?;
            passed.extend(batch_passed);

            processed += batch.len();
            offset += batch.len();
            remaining -= batch.len() as i64;
            if let Some(progress) = progress {
                progress("rule_filter", processed, total_articles as usize);
            }
        }

        pipeline.refresh_run_stats(run_id)?;
        info!(
            run_id,
            processed,
            passed = passed.len(),
            "Rule filter stage complete"
        );

        if until_stage == Some(Stage::RuleFilter) {
            pipeline.update_run_status(run_id, RunStatus::Paused, None, None)?;
            return self.finish(run_id);
        }

        // ── LLM_ANALYSIS ─────────────────────────────────────
        if !passed.is_empty() {
            pipeline.update_run_status(
                run_id,
                RunStatus::Running,
                Some(Stage::LlmAnalysis),
                None,
            )?;

            match self.analysis.analyze(&passed, run_id, progress).await {
                Ok(summary) => {
                    info!(
                        run_id,
                        success = summary.success,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        "Analysis stage complete"
                    );
                }
                Err(AnalysisError::Timeout { batch_id, .. }) => {
                    warn!(run_id, %batch_id, "Batch polling timed out, pausing run");
                    pipeline.update_run_status(run_id, RunStatus::Paused, None, None)?;
                    return self.finish(run_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if until_stage == Some(Stage::LlmAnalysis) {
            pipeline.update_run_status(run_id, RunStatus::Paused, None, None)?;
            return self.finish(run_id);
        }

        // ── STORE ────────────────────────────────────────────
        pipeline.update_run_status(run_id, RunStatus::Running, Some(Stage::Store), None)?;
        pipeline.refresh_run_stats(run_id)?;
        pipeline.update_run_status(run_id, RunStatus::Completed, None, None)?;
        info!(run_id, "Pipeline run completed");

        self.finish(run_id)
    }

    fn finish(&self, run_id: i64) -> Result<PipelineRun> {
        self.store
            .pipeline()
            .get_run(run_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("pipeline run {run_id}")))
    }

    /// Reset a run to re-execute from a stage: stage artifacts are
    /// deleted, counters zeroed, and the run parked back at PENDING.
    pub fn reset_run(&self, run_id: i64, from_stage: Stage) -> Result<PipelineRun> {
        let pipeline = self.store.pipeline();
        if pipeline.get_run(run_id)?.is_none() {
            return Err(PipelineError::NotFound(format!("pipeline run {run_id}")));
        }
        pipeline.reset_run(run_id, from_stage)?;
        self.finish(run_id)
    }

    // ── Force include ────────────────────────────────────────

    /// Force an article past all rules. Fails when the article does not
    /// exist or is already force-included.
    pub fn add_force_include(
        &self,
        article_id: i64,
        reason: &str,
        added_by: Option<&str>,
    ) -> Result<ForceInclude> {
        if self.store.articles().get_by_id(article_id)?.is_none() {
            return Err(PipelineError::NotFound(format!("article {article_id}")));
        }
        Ok(self
            .store
            .pipeline()
            .add_force_include(article_id, reason, added_by)?)
    }

    pub fn remove_force_include(&self, article_id: i64) -> Result<bool> {
        Ok(self.store.pipeline().remove_force_include(article_id)?)
    }

    /// Force-include entries joined with article info for display.
    pub fn list_force_includes(&self) -> Result<Vec<(ForceInclude, Option<Article>)>> {
        let entries = self.store.pipeline().list_force_includes()?;
        let articles = self.store.articles();
        let mut detailed = Vec::with_capacity(entries.len());
        for entry in entries {
            let article = articles.get_by_id(entry.article_id)?;
            detailed.push((entry, article));
        }
        Ok(detailed)
    }
}
