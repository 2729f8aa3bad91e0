//! LLM batch coordinator.
//!
//! Submits one batch of analysis requests, polls it to completion, and
//! reconciles per-article tracking with the analytical store's two-tier
//! failure classification. The batch handle is persisted on the pipeline
//! run before any tracking rows exist, so a crashed run resumes polling
//! the same batch instead of paying for a new one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::store::{AnalyticsStore, StoreFailure};
use super::{
    parse_article_id, AnalysisError, AnalysisProvider, AnalysisRequest, AnalysisResponse,
    BatchStatus, Result,
};
use crate::models::{AnalysisStatus, Article};
use crate::repository::{NewAnalysisResult, Store};

/// Progress callback: (stage name, done, total).
pub type ProgressFn = dyn Fn(&str, usize, usize) + Send + Sync;

/// Where successful analyses are persisted. Seam over the analytical
/// store so coordination logic is testable without a second database.
pub trait ResultSink: Send + Sync {
    fn store_batch(
        &self,
        articles_map: &HashMap<i64, Article>,
        responses: &[AnalysisResponse],
    ) -> (usize, Vec<StoreFailure>);
}

impl ResultSink for AnalyticsStore {
    fn store_batch(
        &self,
        articles_map: &HashMap<i64, Article>,
        responses: &[AnalysisResponse],
    ) -> (usize, Vec<StoreFailure>) {
        AnalyticsStore::store_batch(self, articles_map, responses)
    }
}

/// Outcome of one analyze pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeSummary {
    pub submitted: usize,
    pub skipped: usize,
    pub success: usize,
    pub failed: usize,
}

/// Coordinates batched LLM analysis and result storage.
pub struct AnalysisService {
    store: Store,
    provider: Arc<dyn AnalysisProvider>,
    sink: Arc<dyn ResultSink>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl AnalysisService {
    pub fn new(
        store: Store,
        provider: Arc<dyn AnalysisProvider>,
        sink: Arc<dyn ResultSink>,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            store,
            provider,
            sink,
            poll_interval,
            max_wait,
        }
    }

    /// Analyze a set of articles for a pipeline run.
    ///
    /// Articles that already have a SUCCESS tracking row are skipped. If
    /// the run carries a batch handle, polling resumes on that batch;
    /// otherwise a new batch is submitted and the handle persisted before
    /// any tracking rows are written.
    pub async fn analyze(
        &self,
        articles: &[Article],
        run_id: i64,
        progress: Option<&ProgressFn>,
    ) -> Result<AnalyzeSummary> {
        let analyzed = self.store.tracking().success_article_ids()?;
        let to_analyze: Vec<&Article> =
            articles.iter().filter(|a| !analyzed.contains(&a.id)).collect();
        let skipped = articles.len() - to_analyze.len();

        if to_analyze.is_empty() {
            info!("All articles already analyzed, skipping");
            return Ok(AnalyzeSummary {
                skipped,
                ..Default::default()
            });
        }
        info!(
            analyzing = to_analyze.len(),
            skipped, "Starting batch analysis"
        );

        let run = self
            .store
            .pipeline()
            .get_run(run_id)?
            .ok_or_else(|| AnalysisError::NotConfigured(format!("pipeline run {run_id}")))?;

        let batch_id = match run.batch_id {
            Some(batch_id) => {
                info!(%batch_id, "Resuming existing batch");
                batch_id
            }
            None => {
                let requests: Vec<AnalysisRequest> = to_analyze
                    .iter()
                    .map(|a| AnalysisRequest::for_article((*a).clone()))
                    .collect();
                let batch_id = self.provider.submit_batch(&requests).await?;
                // Persist the handle first: tracking rows can be rebuilt
                // on resume, a lost batch id cannot.
                self.store.pipeline().set_batch_id(run_id, Some(&batch_id))?;
                batch_id
            }
        };

        let article_ids: Vec<i64> = to_analyze.iter().map(|a| a.id).collect();
        self.store.tracking().create_pending(&article_ids, &batch_id)?;

        let responses = self.poll_batch(&batch_id, progress).await?;

        let articles_map: HashMap<i64, Article> =
            to_analyze.iter().map(|a| (a.id, (*a).clone())).collect();
        let (success, failed) = self.process_responses(
            &batch_id,
            Some(run_id),
            &articles_map,
            responses,
        )?;

        info!(success, failed, "Analysis complete");
        Ok(AnalyzeSummary {
            submitted: article_ids.len(),
            skipped,
            success,
            failed,
        })
    }

    /// Re-submit FAILED articles as a new batch. STORE_FAILED rows are
    /// excluded; they do not need re-analysis. Returns the new batch id
    /// and the article count.
    pub async fn retry_failed(
        &self,
        progress: Option<&ProgressFn>,
    ) -> Result<(String, usize)> {
        let failed_ids: Vec<i64> = self
            .store
            .tracking()
            .article_ids_with_status(AnalysisStatus::Failed)?
            .into_iter()
            .collect();
        if failed_ids.is_empty() {
            info!("No failed articles to retry");
            return Ok((String::new(), 0));
        }

        let articles = self.store.articles().get_many(&failed_ids)?;
        if articles.is_empty() {
            return Ok((String::new(), 0));
        }

        self.store.tracking().delete_with_status(AnalysisStatus::Failed)?;

        let requests: Vec<AnalysisRequest> = articles
            .iter()
            .map(|a| AnalysisRequest::for_article(a.clone()))
            .collect();
        let batch_id = self.provider.submit_batch(&requests).await?;
        let article_ids: Vec<i64> = articles.iter().map(|a| a.id).collect();
        self.store.tracking().create_pending(&article_ids, &batch_id)?;

        let responses = self.poll_batch(&batch_id, progress).await?;
        let articles_map: HashMap<i64, Article> =
            articles.into_iter().map(|a| (a.id, a)).collect();
        self.process_responses(&batch_id, None, &articles_map, responses)?;

        Ok((batch_id, article_ids.len()))
    }

    /// Retry storage for STORE_FAILED rows using their retained results.
    /// No LLM call is made. Returns (resolved, still_failed).
    pub fn retry_store_failed(&self) -> Result<(usize, usize)> {
        let rows = self
            .store
            .tracking()
            .rows_with_status(AnalysisStatus::StoreFailed)?;
        if rows.is_empty() {
            info!("No store-failed articles to retry");
            return Ok((0, 0));
        }

        let article_ids: Vec<i64> = rows.iter().map(|r| r.article_id).collect();
        let articles_map: HashMap<i64, Article> = self
            .store
            .articles()
            .get_many(&article_ids)?
            .into_iter()
            .map(|a| (a.id, a))
            .collect();

        let responses: Vec<AnalysisResponse> = rows
            .iter()
            .filter_map(|row| {
                row.result_json.as_ref().map(|result_json| AnalysisResponse {
                    custom_id: format!("article_{}", row.article_id),
                    success: true,
                    result_json: Some(result_json.clone()),
                    error_message: None,
                })
            })
            .collect();

        let (_, failures) = self.sink.store_batch(&articles_map, &responses);
        let failure_map: HashMap<i64, &StoreFailure> =
            failures.iter().map(|f| (f.article_id, f)).collect();

        let mut resolved = 0usize;
        let mut still_failed = 0usize;
        for row in &rows {
            match failure_map.get(&row.article_id) {
                None => {
                    self.store.tracking().resolve_store_failed(row.id)?;
                    resolved += 1;
                }
                Some(failure) => {
                    self.store.tracking().restamp_store_failed(
                        row.id,
                        failure.is_transient,
                        &failure.error_message,
                    )?;
                    still_failed += 1;
                }
            }
        }

        info!(resolved, still_failed, "Storage retry complete");
        Ok((resolved, still_failed))
    }

    /// Poll a batch until completion, raising Timeout when max_wait is
    /// exceeded. The batch itself is never cancelled remotely.
    async fn poll_batch(
        &self,
        batch_id: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<Vec<AnalysisResponse>> {
        let mut elapsed = Duration::ZERO;
        loop {
            let status = self.provider.check_batch_status(batch_id).await?;
            if let Some(progress) = progress {
                progress(
                    "llm_analysis",
                    status.completed + status.failed,
                    status.total,
                );
            }

            match status.status {
                BatchStatus::Completed => {
                    return self.provider.retrieve_results(batch_id).await;
                }
                s if s.is_terminal_error() => {
                    return Err(AnalysisError::BatchFailed {
                        batch_id: batch_id.to_string(),
                        status: s.as_str().to_string(),
                    });
                }
                _ => {}
            }

            if elapsed >= self.max_wait {
                return Err(AnalysisError::Timeout {
                    batch_id: batch_id.to_string(),
                    max_wait_secs: self.max_wait.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            elapsed += self.poll_interval;
        }
    }

    /// Update tracking (and per-run artifacts) from batch responses,
    /// handing successful analyses to the sink.
    fn process_responses(
        &self,
        batch_id: &str,
        run_id: Option<i64>,
        articles_map: &HashMap<i64, Article>,
        responses: Vec<AnalysisResponse>,
    ) -> Result<(usize, usize)> {
        let tracking = self.store.tracking();
        let mut success = 0usize;
        let mut failed = 0usize;
        let mut run_results: Vec<NewAnalysisResult> = Vec::new();

        // LLM-side errors first
        let mut successes: Vec<AnalysisResponse> = Vec::new();
        for resp in responses {
            let Some(article_id) = parse_article_id(&resp.custom_id) else {
                warn!(custom_id = %resp.custom_id, "Cannot parse article id from response");
                failed += 1;
                continue;
            };
            if resp.success && resp.result_json.is_some() {
                successes.push(resp);
            } else {
                let message = resp
                    .error_message
                    .as_deref()
                    .unwrap_or("analysis failed without message");
                if !tracking.mark_failed(article_id, batch_id, message)? {
                    warn!(article_id, batch_id, "No pending tracking row for failure");
                }
                if let Some(run_id) = run_id {
                    run_results.push(NewAnalysisResult {
                        run_id,
                        article_id,
                        success: false,
                        result_json: None,
                        error_message: Some(message.to_string()),
                    });
                }
                failed += 1;
            }
        }

        // Storage pass with two-tier failure classification
        let (_, store_failures) = self.sink.store_batch(articles_map, &successes);
        let failure_map: HashMap<i64, &StoreFailure> =
            store_failures.iter().map(|f| (f.article_id, f)).collect();

        for resp in &successes {
            let article_id = parse_article_id(&resp.custom_id).unwrap_or_default();
            let result_json = resp.result_json.as_deref().unwrap_or_default();
            match failure_map.get(&article_id) {
                None => {
                    tracking.mark_success(article_id, batch_id)?;
                    if let Some(run_id) = run_id {
                        run_results.push(NewAnalysisResult {
                            run_id,
                            article_id,
                            success: true,
                            result_json: None,
                            error_message: None,
                        });
                    }
                    success += 1;
                }
                Some(failure) if failure.is_transient => {
                    // Storage-only retry later: keep the result
                    tracking.mark_store_failed(
                        article_id,
                        batch_id,
                        result_json,
                        &failure.error_message,
                    )?;
                    failed += 1;
                }
                Some(failure) => {
                    // Data error: the analysis itself must be redone
                    tracking.mark_failed(article_id, batch_id, &failure.error_message)?;
                    if let Some(run_id) = run_id {
                        run_results.push(NewAnalysisResult {
                            run_id,
                            article_id,
                            success: false,
                            result_json: None,
                            error_message: Some(failure.error_message.clone()),
                        });
                    }
                    failed += 1;
                }
            }
        }

        if !run_results.is_empty() {
            self.store.pipeline().save_analysis_results(&run_results)?;
        }
        Ok((success, failed))
    }
}
