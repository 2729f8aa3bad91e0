//! CLI command handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::analysis::{AnalysisService, AnalyticsStore, OpenAiBatchProvider};
use crate::archive::{ArchiveScheduler, ArchiveService};
use crate::config::Settings;
use crate::crawlers::{CrawlerDefaults, CrawlerRegistry};
use crate::executor::{schedule_all_active, CrawlExecutor};
use crate::models::{AnalysisStatus, Stage};
use crate::pipeline::{PipelineOrchestrator, RuleFilterService, StatisticsService};
use crate::reparse::ReparseService;
use crate::repository::Store;
use crate::scheduler::Scheduler;

fn open_store(settings: &Settings) -> anyhow::Result<Store> {
    Store::open(&settings.database_path)
        .with_context(|| format!("opening database {}", settings.database_path.display()))
}

fn build_registry(settings: &Settings) -> Arc<CrawlerRegistry> {
    let defaults = CrawlerDefaults {
        interval_minutes: settings.default_crawler_interval_minutes,
        timeout_seconds: settings.default_crawler_timeout_seconds,
    };
    Arc::new(CrawlerRegistry::from_sites(&settings.sources, defaults))
}

fn build_archive_service(settings: &Settings, store: &Store) -> Arc<ArchiveService> {
    Arc::new(ArchiveService::new(
        store.clone(),
        &settings.archive_base_path,
        settings.archive_batch_size,
        settings.archive_compression,
    ))
}

fn build_analysis_service(
    settings: &Settings,
    store: &Store,
) -> anyhow::Result<Arc<AnalysisService>> {
    let api_key = settings
        .openai_api_key
        .clone()
        .context("OPENAI_API_KEY is not configured")?;
    let provider = Arc::new(OpenAiBatchProvider::new(
        &api_key,
        &settings.llm_analysis_model,
    )?);
    let sink = Arc::new(AnalyticsStore::open(&settings.analytics_database_path)?);
    Ok(Arc::new(AnalysisService::new(
        store.clone(),
        provider,
        sink,
        Duration::from_secs(settings.llm_analysis_poll_interval.max(1)),
        Duration::from_secs(settings.llm_analysis_max_wait),
    )))
}

fn build_orchestrator(
    settings: &Settings,
    store: &Store,
) -> anyhow::Result<PipelineOrchestrator> {
    let analysis = build_analysis_service(settings, store)?;
    Ok(PipelineOrchestrator::new(
        store.clone(),
        analysis,
        settings.pipeline_default_days,
    ))
}

fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date {raw:?}, expected YYYY-MM-DD"))
}

fn parse_stage(raw: &str) -> anyhow::Result<Stage> {
    Stage::from_str(raw).with_context(|| {
        format!("invalid stage {raw:?}, expected fetch, rule_filter, llm_analysis or store")
    })
}

// ── Daemon ───────────────────────────────────────────────────

/// Run the crawl daemon until interrupted.
pub async fn daemon(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let registry = build_registry(&settings);
    if registry.is_empty() {
        anyhow::bail!("no crawlers configured; add [[sources]] entries to the config file");
    }
    registry.sync_to_store(&store)?;

    // Crash recovery before anything starts ticking
    let scheduler = Arc::new(Scheduler::new());
    let executor = Arc::new(
        CrawlExecutor::new(store.clone(), registry.clone()).with_scheduler(scheduler.clone()),
    );
    executor.recover_on_startup()?;

    // Default rules are usable from the first pipeline run
    RuleFilterService::new(store.clone()).ensure_default_rules()?;

    scheduler.start();
    let scheduled = schedule_all_active(executor, &scheduler)?;
    info!(scheduled, "Daemon started");

    let archive_service = build_archive_service(&settings, &store);
    let archive_scheduler = ArchiveScheduler::new(
        archive_service,
        settings.auto_archive_enabled,
        settings.auto_archive_hour,
        settings.auto_archive_minute,
        settings.scheduler_offset(),
    );
    archive_scheduler.start();

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    archive_scheduler.shutdown();
    scheduler.shutdown();
    Ok(())
}

// ── Sources & crawlers ───────────────────────────────────────

pub fn sources_list(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let configs = store.crawlers().get_all()?;
    if configs.is_empty() {
        println!("No crawlers registered. Run `newsacq sources sync` first.");
        return Ok(());
    }
    for config in configs {
        println!(
            "{:<24} {:<8} {:<12} active={} interval={}m status={} last_items={} total={}",
            config.name,
            config.kind.as_str(),
            config.source,
            config.is_active,
            config.interval_minutes,
            config.last_run_status.as_str(),
            config.last_run_items_count,
            config.total_items_count,
        );
    }
    Ok(())
}

pub fn sources_stats(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    for stats in store.articles().source_stats()? {
        println!(
            "{:<12} total={:<7} yesterday={:<6} raw_html={:<7} archived={}",
            stats.source,
            stats.total_count,
            stats.yesterday_count,
            stats.has_raw_html_count,
            stats.archived_count,
        );
    }
    Ok(())
}

pub fn sources_sync(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let registry = build_registry(&settings);
    let synced = registry.sync_to_store(&store)?;
    println!("Synced {} crawlers", synced.len());
    Ok(())
}

pub async fn crawl_once(settings: Settings, name: &str) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let registry = build_registry(&settings);
    registry.sync_to_store(&store)?;
    let executor = CrawlExecutor::new(store.clone(), registry);

    executor.execute(name).await;
    let config = store
        .crawlers()
        .get_by_name(name)?
        .context("crawler not found after tick")?;
    println!(
        "{}: {} ({} items)",
        name,
        config.last_run_status.as_str(),
        config.last_run_items_count
    );
    if let Some(error) = config.error_log {
        println!("error: {error}");
    }
    Ok(())
}

pub fn crawler_set_active(settings: Settings, name: &str, active: bool) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let config = store
        .crawlers()
        .get_by_name(name)?
        .with_context(|| format!("crawler {name} not found"))?;
    if config.is_active == active {
        println!("{name} is already {}", if active { "active" } else { "inactive" });
        return Ok(());
    }
    store.crawlers().toggle_active(config.id)?;
    println!("{name} {}", if active { "enabled" } else { "disabled" });
    Ok(())
}

pub fn crawler_set_interval(settings: Settings, name: &str, minutes: i64) -> anyhow::Result<()> {
    if minutes < 1 {
        anyhow::bail!("interval must be at least 1 minute");
    }
    let store = open_store(&settings)?;
    let config = store
        .crawlers()
        .get_by_name(name)?
        .with_context(|| format!("crawler {name} not found"))?;
    store.crawlers().update_interval(config.id, minutes)?;
    println!("{name} interval set to {minutes}m (applies on next daemon start)");
    Ok(())
}

// ── Queue ────────────────────────────────────────────────────

pub fn queue_stats(settings: Settings, source: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let stats = store.queue().stats(source)?;
    println!(
        "pending={} processing={} completed={} failed={} total={}",
        stats.pending, stats.processing, stats.completed, stats.failed, stats.total
    );
    Ok(())
}

pub fn queue_reset(settings: Settings, source: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let reset = store.queue().force_reset_all_processing(source)?;
    println!("Reset {reset} URLs back to pending");
    Ok(())
}

// ── Archive ──────────────────────────────────────────────────

pub fn archive_run(
    settings: Settings,
    source: &str,
    date: Option<&str>,
    before: Option<&str>,
) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let service = build_archive_service(&settings, &store);
    let target = date.map(parse_date).transpose()?;
    let before = before.map(parse_date).transpose()?;

    let outcome = service.archive_source(source, before, target)?;
    println!(
        "Archived {} articles for {} ({:.2} MB freed) into {}",
        outcome.archived_count,
        outcome.source,
        outcome.freed_bytes as f64 / 1024.0 / 1024.0,
        outcome.archive_dir.display()
    );
    Ok(())
}

pub fn archive_all(settings: Settings, before: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let service = build_archive_service(&settings, &store);
    let before = before.map(parse_date).transpose()?;

    for outcome in service.archive_all_sources(before) {
        println!(
            "{}: archived {} articles",
            outcome.source, outcome.archived_count
        );
    }
    Ok(())
}

pub fn archive_info(settings: Settings, source: &str) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let service = build_archive_service(&settings, &store);
    let info = service.archive_info(source)?;
    println!(
        "{}: {} batches across {} months, {} archived articles, {:.2} MB on disk",
        info.source,
        info.total_batches,
        info.months.len(),
        info.total_archived_articles,
        info.total_size_bytes as f64 / 1024.0 / 1024.0,
    );
    for month in info.months {
        println!("  {month}");
    }
    Ok(())
}

pub fn restore(settings: Settings, article_ids: &[i64]) -> anyhow::Result<()> {
    if article_ids.is_empty() {
        anyhow::bail!("no article ids given");
    }
    let store = open_store(&settings)?;
    let service = build_archive_service(&settings, &store);
    let outcome = service.restore(article_ids)?;
    println!(
        "Restored {} articles, {} failed",
        outcome.restored_count, outcome.failed_count
    );
    Ok(())
}

// ── Reparse ──────────────────────────────────────────────────

fn build_reparse(settings: &Settings, store: &Store) -> ReparseService {
    let archive = build_archive_service(settings, store);
    let registry = build_registry(settings);
    ReparseService::new(store.clone(), archive, registry)
}

pub async fn reparse_start(settings: Settings, source: &str) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let service = build_reparse(&settings, &store);

    let preview = service.preview(source)?;
    println!(
        "Reparsing {}: {} in database, {} archived",
        source, preview.in_db_count, preview.archived_count
    );
    let job = service.start(source)?;
    println!("Job {} started", job.id);

    // Stay attached and report progress until the job finishes
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let Some(job) = service.job_status(&job.id)? else {
            break;
        };
        if job.status.is_terminal() {
            println!(
                "Job {} {}: {} processed, {} failed",
                job.id,
                job.status.as_str(),
                job.processed_count,
                job.failed_count
            );
            if let Some(error_log) = job.error_log {
                println!("{error_log}");
            }
            break;
        }
        println!(
            "  {:.1}% ({}/{})",
            job.progress_percent(),
            job.processed_count + job.failed_count,
            job.total_count
        );
    }
    Ok(())
}

pub fn reparse_status(settings: Settings, job_id: &str) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let job = store
        .reparse_jobs()
        .get(job_id)?
        .context("reparse job not found")?;
    println!(
        "{} [{}] {}: {:.1}% ({} processed, {} failed of {})",
        job.id,
        job.source,
        job.status.as_str(),
        job.progress_percent(),
        job.processed_count,
        job.failed_count,
        job.total_count
    );
    Ok(())
}

pub async fn reparse_cancel(settings: Settings, job_id: &str) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let service = build_reparse(&settings, &store);
    if service.cancel(job_id) {
        println!("Cancellation requested for {job_id}");
    } else {
        println!("Job {job_id} is not running in this process");
    }
    Ok(())
}

pub fn reparse_jobs(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    for job in store.reparse_jobs().recent(10)? {
        println!(
            "{} [{}] {} {}/{} failed={}",
            job.id,
            job.source,
            job.status.as_str(),
            job.processed_count,
            job.total_count,
            job.failed_count
        );
    }
    Ok(())
}

// ── Pipeline ─────────────────────────────────────────────────

fn stage_progress_bar() -> (ProgressBar, Arc<dyn Fn(&str, usize, usize) + Send + Sync>) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg:<14} [{bar:40}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let bar_for_updates = bar.clone();
    let callback: Arc<dyn Fn(&str, usize, usize) + Send + Sync> =
        Arc::new(move |stage: &str, done: usize, total: usize| {
            bar_for_updates.set_message(stage.to_string());
            bar_for_updates.set_length(total as u64);
            bar_for_updates.set_position(done as u64);
        });
    (bar, callback)
}

pub async fn pipeline_run(
    settings: Settings,
    days: Option<i64>,
    from: Option<&str>,
    to: Option<&str>,
    until_stage: Option<&str>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let orchestrator = build_orchestrator(&settings, &store)?;
    let until_stage = until_stage.map(parse_stage).transpose()?;

    let run = match (from, to) {
        (None, None) => orchestrator.create_quick_run(days)?,
        _ => {
            let date_from = from
                .map(parse_date)
                .transpose()?
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc());
            let date_to = to
                .map(parse_date)
                .transpose()?
                .map(|d| d.and_hms_opt(23, 59, 59).unwrap().and_utc());
            let name = format!("Run - {}", Utc::now().format("%Y-%m-%d %H:%M"));
            orchestrator.create_run(&name, date_from, date_to)?
        }
    };
    println!("Created run {} ({})", run.id, run.name);

    let (bar, callback) = stage_progress_bar();
    let run = orchestrator
        .run_pipeline(run.id, until_stage, limit, Some(callback.as_ref()))
        .await?;
    bar.finish_and_clear();

    print_run(&run);
    Ok(())
}

pub async fn pipeline_resume(
    settings: Settings,
    run_id: i64,
    until_stage: Option<&str>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let orchestrator = build_orchestrator(&settings, &store)?;
    let until_stage = until_stage.map(parse_stage).transpose()?;

    let (bar, callback) = stage_progress_bar();
    let run = orchestrator
        .run_pipeline(run_id, until_stage, limit, Some(callback.as_ref()))
        .await?;
    bar.finish_and_clear();

    print_run(&run);
    Ok(())
}

pub fn pipeline_reset(settings: Settings, run_id: i64, from_stage: &str) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let stage = parse_stage(from_stage)?;
    store.pipeline().reset_run(run_id, stage)?;
    println!("Run {run_id} reset from {}", stage.as_str());
    Ok(())
}

pub fn pipeline_list(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    for run in store.pipeline().recent_runs(10)? {
        println!(
            "{:<5} {:<10} stage={:<12} total={:<6} filtered={:<6} analyzed={:<6} {}",
            run.id,
            run.status.as_str(),
            run.current_stage.map(|s| s.as_str()).unwrap_or("-"),
            run.total_articles,
            run.rule_filtered_count,
            run.analyzed_count,
            run.name,
        );
    }
    Ok(())
}

pub fn pipeline_stats(settings: Settings, run_id: i64) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let statistics = StatisticsService::new(store);
    let stats = statistics.run_stats(run_id)?.context("run not found")?;
    println!("{:#?}", stats);

    let overall = statistics.overall_stats()?;
    println!(
        "overall: {} runs ({} completed), {} articles, {:.2}% filtered",
        overall.total_runs,
        overall.completed_runs,
        overall.total_articles_processed,
        overall.avg_rule_filter_rate
    );
    Ok(())
}

fn print_run(run: &crate::models::PipelineRun) {
    println!(
        "Run {} is {}: total={} filtered={} passed={} analyzed={} force_included={}",
        run.id,
        run.status.as_str(),
        run.total_articles,
        run.rule_filtered_count,
        run.rule_passed_count,
        run.analyzed_count,
        run.force_included_count,
    );
    if let Some(batch_id) = &run.batch_id {
        println!("batch: {batch_id}");
    }
    if let Some(error_log) = &run.error_log {
        println!("error: {error_log}");
    }
}

// ── Analysis ─────────────────────────────────────────────────

pub async fn analysis_retry_failed(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let service = build_analysis_service(&settings, &store)?;
    let (batch_id, count) = service.retry_failed(None).await?;
    if count == 0 {
        println!("No failed articles to retry");
    } else {
        println!("Resubmitted {count} articles as batch {batch_id}");
    }
    Ok(())
}

pub fn analysis_retry_store_failed(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let service = build_analysis_service(&settings, &store)?;
    let (resolved, still_failed) = service.retry_store_failed()?;
    println!("Storage retry: {resolved} resolved, {still_failed} still failing");
    Ok(())
}

pub fn analysis_stats(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let stats = store.tracking().stats()?;
    println!(
        "pending={} success={} failed={} store_failed={} total={}",
        stats.pending, stats.success, stats.failed, stats.store_failed, stats.total
    );
    Ok(())
}

pub fn analysis_clear(
    settings: Settings,
    all: bool,
    failed: bool,
    article_id: Option<i64>,
    batch_id: Option<&str>,
) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let tracking = store.tracking();
    let cleared = if all {
        tracking.delete_all()?
    } else if failed {
        tracking.delete_with_status(AnalysisStatus::Failed)?
    } else if let Some(article_id) = article_id {
        // Clearing one article also removes its rows from the analytical
        // store so a later re-analysis is not swallowed by dedup
        if let Some(article) = store.articles().get_by_id(article_id)? {
            let analytics = AnalyticsStore::open(&settings.analytics_database_path)?;
            let deleted = analytics.delete_by_external_ids(&[article.url_hash])?;
            if deleted > 0 {
                println!("Deleted {deleted} analytical-store articles");
            }
        }
        tracking.delete_for_article(article_id)?
    } else if let Some(batch_id) = batch_id {
        tracking.delete_for_batch(batch_id)?
    } else {
        anyhow::bail!("pass one of --all, --failed, --article-id or --batch-id");
    };
    println!("Cleared {cleared} tracking rows");
    Ok(())
}

// ── Force include ────────────────────────────────────────────

pub fn force_include_add(
    settings: Settings,
    article_id: i64,
    reason: &str,
    added_by: Option<&str>,
) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    let orchestrator = build_orchestrator(&settings, &store);
    // Force-include management does not need the LLM provider
    let entry = match orchestrator {
        Ok(orchestrator) => orchestrator.add_force_include(article_id, reason, added_by)?,
        Err(_) => {
            if store.articles().get_by_id(article_id)?.is_none() {
                anyhow::bail!("article {article_id} not found");
            }
            store
                .pipeline()
                .add_force_include(article_id, reason, added_by)?
        }
    };
    println!("Force-included article {} ({})", entry.article_id, entry.reason);
    Ok(())
}

pub fn force_include_remove(settings: Settings, article_id: i64) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    if store.pipeline().remove_force_include(article_id)? {
        println!("Removed force-include for article {article_id}");
    } else {
        println!("Article {article_id} was not force-included");
    }
    Ok(())
}

pub fn force_include_list(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings)?;
    for entry in store.pipeline().list_force_includes()? {
        let article = store.articles().get_by_id(entry.article_id)?;
        let title = article.map(|a| a.title).unwrap_or_else(|| "<missing>".to_string());
        println!(
            "{:<7} {} | {} (by {})",
            entry.article_id,
            title,
            entry.reason,
            entry.added_by.as_deref().unwrap_or("unknown"),
        );
    }
    Ok(())
}
