//! End-to-end pipeline tests: fetch → rule filter → analysis → store,
//! with a scripted batch provider and a real analytical store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use newsacquire::analysis::{
    parse_article_id, AnalysisProvider, AnalysisRequest, AnalysisResponse, AnalysisService,
    AnalyticsStore, BatchStatus, BatchStatusResult, Result as AnalysisResult,
};
use newsacquire::models::{compute_url_hash, AnalysisStatus, Article, RunStatus, Stage};
use newsacquire::pipeline::PipelineOrchestrator;
use newsacquire::repository::Store;

fn analysis_json() -> String {
    json!({
        "sentiment": { "polarity": 2, "intensity": 5, "tone": "neutral" },
        "framing": { "angle": "政策說明", "narrative_type": "procedural" },
        "entities": [
            {
                "name": "行政院",
                "name_normalized": "行政院",
                "type": "organization",
                "role": "subject",
                "sentiment_toward": 0
            }
        ],
        "events": [
            {
                "topic_normalized": "年度預算",
                "name_normalized": "預算案三讀",
                "sub_event_normalized": null,
                "tags": ["預算"],
                "type": "policy",
                "is_main": true,
                "event_time": null,
                "article_type": "standard",
                "temporal_cues": []
            }
        ],
        "entity_relations": [],
        "event_relations": [
            { "entity": "行政院", "event": "預算案三讀", "type": "involved_in" }
        ],
        "signals": {
            "is_exclusive": false,
            "is_opinion": false,
            "has_update": false,
            "key_claims": [],
            "virality_score": 3
        },
        "category_normalized": "politics"
    })
    .to_string()
}

/// Scripted provider: batches complete instantly unless `stall` is set.
struct ScriptedProvider {
    submit_count: AtomicUsize,
    batches: Mutex<HashMap<String, Vec<i64>>>,
    stall: AtomicBool,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            submit_count: AtomicUsize::new(0),
            batches: Mutex::new(HashMap::new()),
            stall: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AnalysisProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit_batch(&self, requests: &[AnalysisRequest]) -> AnalysisResult<String> {
        let n = self.submit_count.fetch_add(1, Ordering::SeqCst) + 1;
        let batch_id = format!("batch_{n}");
        let ids = requests
            .iter()
            .filter_map(|r| parse_article_id(&r.custom_id))
            .collect();
        self.batches.lock().unwrap().insert(batch_id.clone(), ids);
        Ok(batch_id)
    }

    async fn check_batch_status(&self, batch_id: &str) -> AnalysisResult<BatchStatusResult> {
        let total = self
            .batches
            .lock()
            .unwrap()
            .get(batch_id)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if self.stall.load(Ordering::SeqCst) {
            return Ok(BatchStatusResult {
                status: BatchStatus::InProgress,
                total,
                completed: 0,
                failed: 0,
            });
        }
        Ok(BatchStatusResult {
            status: BatchStatus::Completed,
            total,
            completed: total,
            failed: 0,
        })
    }

    async fn retrieve_results(&self, batch_id: &str) -> AnalysisResult<Vec<AnalysisResponse>> {
        let ids = self
            .batches
            .lock()
            .unwrap()
            .get(batch_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .map(|id| AnalysisResponse {
                custom_id: format!("article_{id}"),
                success: true,
                result_json: Some(analysis_json()),
                error_message: None,
            })
            .collect())
    }
}

struct Harness {
    _dir: TempDir,
    store: Store,
    analytics: Arc<AnalyticsStore>,
    provider: Arc<ScriptedProvider>,
    orchestrator: PipelineOrchestrator,
}

fn harness(max_wait: Duration) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Store::open(&dir.path().join("ops.db")).unwrap();
    let analytics = Arc::new(AnalyticsStore::open(&dir.path().join("analytics.db")).unwrap());
    let provider = Arc::new(ScriptedProvider::new());
    let analysis = Arc::new(AnalysisService::new(
        store.clone(),
        provider.clone(),
        analytics.clone(),
        Duration::from_millis(1),
        max_wait,
    ));
    let orchestrator = PipelineOrchestrator::new(store.clone(), analysis, 1);
    Harness {
        _dir: dir,
        store,
        analytics,
        provider,
        orchestrator,
    }
}

fn insert_article(store: &Store, title: &str) -> i64 {
    let url = format!("https://example.com/{}", compute_url_hash(title));
    store
        .articles()
        .insert(&Article {
            id: 0,
            url_hash: compute_url_hash(&url),
            url,
            title: title.to_string(),
            content: "內文段落。".to_string(),
            summary: None,
            author: None,
            source: "UDN".to_string(),
            crawler_name: "udn_article".to_string(),
            category: None,
            sub_category: None,
            tags: None,
            published_at: Some(Utc::now()),
            crawled_at: Utc::now(),
            raw_html: None,
            images: None,
        })
        .unwrap()
}

#[tokio::test]
async fn full_pipeline_completes_and_stores_graph() {
    let h = harness(Duration::from_secs(5));
    insert_article(&h.store, "立法院三讀通過預算案");
    insert_article(&h.store, "行政院回應預算爭議");
    insert_article(&h.store, "今日運勢 - 獅子座"); // filtered by rules

    let run = h.orchestrator.create_quick_run(Some(1)).unwrap();
    let run = h
        .orchestrator
        .run_pipeline(run.id, None, None, None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.current_stage.is_none());
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());
    assert_eq!(run.total_articles, 3);
    assert_eq!(run.rule_filtered_count, 1);
    assert_eq!(run.rule_passed_count, 2);
    assert_eq!(run.analyzed_count, 2);

    // The graph landed in the analytical store; entities/events are shared
    assert_eq!(h.analytics.count("articles").unwrap(), 2);
    assert_eq!(h.analytics.count("entities").unwrap(), 1);
    assert_eq!(h.analytics.count("events").unwrap(), 1);
    assert_eq!(h.analytics.count("article_events").unwrap(), 2);

    // Tracking: every SUCCESS row has its result cleared
    let stats = h.store.tracking().stats().unwrap();
    assert_eq!(stats.success, 2);
    for row in h.store.tracking().rows_for_batch("batch_1").unwrap() {
        assert_eq!(row.status, AnalysisStatus::Success);
        assert!(row.result_json.is_none());
    }
}

#[tokio::test]
async fn until_stage_pauses_then_resume_completes() {
    let h = harness(Duration::from_secs(5));
    insert_article(&h.store, "內政部公布新制");

    let run = h.orchestrator.create_quick_run(Some(1)).unwrap();
    let run = h
        .orchestrator
        .run_pipeline(run.id, Some(Stage::RuleFilter), None, None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.rule_passed_count, 1);
    assert_eq!(run.analyzed_count, 0);
    // Nothing submitted yet
    assert_eq!(h.provider.submit_count.load(Ordering::SeqCst), 0);

    // Operator resumes: the remaining stages run
    let run = h
        .orchestrator
        .run_pipeline(run.id, None, None, None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.analyzed_count, 1);
}

#[tokio::test]
async fn polling_timeout_pauses_and_resume_reuses_batch() {
    let h = harness(Duration::from_millis(5));
    insert_article(&h.store, "交通部說明新方案");

    h.provider.stall.store(true, Ordering::SeqCst);
    let run = h.orchestrator.create_quick_run(Some(1)).unwrap();
    let run = h
        .orchestrator
        .run_pipeline(run.id, None, None, None)
        .await
        .unwrap();

    // Timeout is PAUSED, not FAILED; the batch handle is persisted
    assert_eq!(run.status, RunStatus::Paused);
    assert_eq!(run.batch_id.as_deref(), Some("batch_1"));
    assert_eq!(h.provider.submit_count.load(Ordering::SeqCst), 1);

    // The batch finishes server-side; resuming polls it without a new
    // submission and the run completes
    h.provider.stall.store(false, Ordering::SeqCst);
    let run = h
        .orchestrator
        .run_pipeline(run.id, None, None, None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.batch_id.as_deref(), Some("batch_1"));
    assert_eq!(h.provider.submit_count.load(Ordering::SeqCst), 1);
    assert_eq!(run.analyzed_count, 1);
}

#[tokio::test]
async fn limit_zero_completes_with_no_work() {
    let h = harness(Duration::from_secs(5));
    insert_article(&h.store, "某則新聞");

    let run = h.orchestrator.create_quick_run(Some(1)).unwrap();
    let run = h
        .orchestrator
        .run_pipeline(run.id, None, Some(0), None)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.total_articles, 0);
    assert_eq!(run.rule_passed_count, 0);
    assert_eq!(h.provider.submit_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reset_clears_artifacts_and_rerun_works() {
    let h = harness(Duration::from_secs(5));
    insert_article(&h.store, "環保署發布空品報告");

    let run = h.orchestrator.create_quick_run(Some(1)).unwrap();
    let run_id = run.id;
    h.orchestrator
        .run_pipeline(run_id, None, None, None)
        .await
        .unwrap();

    let run = h.orchestrator.reset_run(run_id, Stage::RuleFilter).unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.rule_passed_count, 0);
    assert_eq!(run.analyzed_count, 0);
    assert!(run.batch_id.is_none());
    assert!(h
        .store
        .pipeline()
        .filter_results_for_run(run_id, None)
        .unwrap()
        .is_empty());

    // Re-run: a new batch is submitted, but already-analyzed articles are
    // skipped by tracking, and the store dedups by external id
    let run = h
        .orchestrator
        .run_pipeline(run_id, None, None, None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(h.analytics.count("articles").unwrap(), 1);
}

#[tokio::test]
async fn force_include_overrides_rules_in_run() {
    let h = harness(Duration::from_secs(5));
    let horoscope_id = insert_article(&h.store, "今日運勢 - 獅子座");

    h.orchestrator
        .add_force_include(horoscope_id, "tracking astrology coverage", Some("ops"))
        .unwrap();

    let run = h.orchestrator.create_quick_run(Some(1)).unwrap();
    let run = h
        .orchestrator
        .run_pipeline(run.id, Some(Stage::RuleFilter), None, None)
        .await
        .unwrap();

    assert_eq!(run.rule_filtered_count, 0);
    assert_eq!(run.force_included_count, 1);
    let results = h
        .store
        .pipeline()
        .filter_results_for_run(run.id, Some(Stage::RuleFilter))
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rule_name.as_deref(), Some("force_include"));
}
