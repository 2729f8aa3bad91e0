//! Reparse engine: replays article parsers over stored and archived HTML.
//!
//! One worker per job, spawned on the blocking pool. Cancellation is
//! cooperative via a per-job flag checked at every iteration; progress is
//! flushed every ten articles, so a crash loses at most one flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::ArchiveService;
use crate::crawlers::{ArticleCrawler, ArticleData, CrawlerRegistry};
use crate::models::{serialize_string_list, ReparseJob, ReparseStatus};
use crate::repository::{ParsedFields, Store};

/// Articles per progress flush.
const FLUSH_EVERY: usize = 10;

/// Failure lines retained in the job's error log.
const ERROR_LOG_LINES: usize = 100;

/// Sizing preview for a reparse job.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReparsePreview {
    pub source: String,
    pub in_db_count: i64,
    pub archived_count: i64,
    pub total_available: i64,
}

/// Service managing background reparse jobs.
pub struct ReparseService {
    store: Store,
    archive: Arc<ArchiveService>,
    registry: Arc<CrawlerRegistry>,
    running: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl ReparseService {
    pub fn new(store: Store, archive: Arc<ArchiveService>, registry: Arc<CrawlerRegistry>) -> Self {
        Self {
            store,
            archive,
            registry,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// How many articles a job for this source would cover.
    pub fn preview(&self, source: &str) -> crate::repository::Result<ReparsePreview> {
        let in_db_count = self.store.articles().count_with_raw_html(source)?;
        let archived_count = self.store.archives().count_archived(source)?;
        Ok(ReparsePreview {
            source: source.to_string(),
            in_db_count,
            archived_count,
            total_available: in_db_count + archived_count,
        })
    }

    /// Start a background reparse job for a source and return its record.
    pub fn start(&self, source: &str) -> crate::repository::Result<ReparseJob> {
        let preview = self.preview(source)?;
        let job = ReparseJob {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            status: ReparseStatus::Pending,
            total_count: preview.total_available,
            processed_count: 0,
            failed_count: 0,
            error_log: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        self.store.reparse_jobs().insert(&job)?;

        let cancel = Arc::new(AtomicBool::new(false));
        self.running
            .lock()
            .unwrap()
            .insert(job.id.clone(), cancel.clone());

        let store = self.store.clone();
        let archive = self.archive.clone();
        let crawler = self.registry.article_crawler_for_source(source);
        let running = self.running.clone();
        let job_id = job.id.clone();
        let source = source.to_string();

        tokio::task::spawn_blocking(move || {
            run_job(&store, &archive, crawler, &job_id, &source, &cancel);
            running.lock().unwrap().remove(&job_id);
        });

        Ok(job)
    }

    /// Current job state, including derived progress.
    pub fn job_status(&self, job_id: &str) -> crate::repository::Result<Option<ReparseJob>> {
        self.store.reparse_jobs().get(job_id)
    }

    /// Request cancellation. The worker honors the flag at its next
    /// iteration boundary.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.running.lock().unwrap().get(job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn recent_jobs(&self, limit: usize) -> crate::repository::Result<Vec<ReparseJob>> {
        self.store.reparse_jobs().recent(limit)
    }
}

/// The worker: parse in-database HTML, then archived HTML, writing parsed
/// fields back in place.
fn run_job(
    store: &Store,
    archive: &ArchiveService,
    crawler: Option<Arc<dyn ArticleCrawler>>,
    job_id: &str,
    source: &str,
    cancel: &AtomicBool,
) {
    let jobs = store.reparse_jobs();

    let Some(crawler) = crawler else {
        let _ = jobs.update_status(
            job_id,
            ReparseStatus::Failed,
            None,
            None,
            Some(&format!("No article crawler found for source: {source}")),
        );
        return;
    };

    if let Err(e) = jobs.update_status(job_id, ReparseStatus::Running, None, None, None) {
        warn!(job = %job_id, error = %e, "Could not mark job running");
        return;
    }

    let mut progress = Progress::default();
    let mut buffer: Vec<(i64, ParsedFields)> = Vec::new();

    // Phase 1: articles whose raw HTML is still in the database
    let articles = match store.articles().with_raw_html(source) {
        Ok(articles) => articles,
        Err(e) => {
            let _ = jobs.update_status(
                job_id,
                ReparseStatus::Failed,
                None,
                None,
                Some(&e.to_string()),
            );
            return;
        }
    };

    for article in articles {
        if cancel.load(Ordering::SeqCst) {
            finish_cancelled(store, job_id, &mut buffer, &progress);
            return;
        }
        let raw_html = article.raw_html.clone().unwrap_or_default();
        match crawler.parse_html(&raw_html, &article.url) {
            Ok(parsed) => {
                buffer.push((article.id, parsed_to_fields(parsed)));
                progress.processed += 1;
            }
            Err(e) => progress.record_failure(article.id, &e.to_string()),
        }
        maybe_flush(store, job_id, &mut buffer, &progress);
    }
    flush(store, job_id, &mut buffer, &progress);

    // Phase 2: archived articles, read back without restoring
    let records = match store.archives().archived_for_source(source) {
        Ok(records) => records,
        Err(e) => {
            let _ = jobs.update_status(
                job_id,
                ReparseStatus::Failed,
                Some(progress.processed as i64),
                Some(progress.failed as i64),
                Some(&e.to_string()),
            );
            return;
        }
    };

    for record in records {
        if cancel.load(Ordering::SeqCst) {
            finish_cancelled(store, job_id, &mut buffer, &progress);
            return;
        }

        let raw_html = match archive.raw_html_from_archive(record.article_id) {
            Ok(Some(html)) => html,
            Ok(None) => {
                progress.record_failure(record.article_id, "Could not retrieve from archive");
                continue;
            }
            Err(e) => {
                progress.record_failure(record.article_id, &e.to_string());
                continue;
            }
        };
        let article = match store.articles().get_by_id(record.article_id) {
            Ok(Some(article)) => article,
            Ok(None) => {
                progress.record_failure(record.article_id, "Article not found in database");
                continue;
            }
            Err(e) => {
                progress.record_failure(record.article_id, &e.to_string());
                continue;
            }
        };

        match crawler.parse_html(&raw_html, &article.url) {
            Ok(parsed) => {
                buffer.push((article.id, parsed_to_fields(parsed)));
                progress.processed += 1;
            }
            Err(e) => progress.record_failure(article.id, &e.to_string()),
        }
        maybe_flush(store, job_id, &mut buffer, &progress);
    }
    flush(store, job_id, &mut buffer, &progress);

    let error_log = progress.error_log();
    let _ = store.reparse_jobs().update_status(
        job_id,
        ReparseStatus::Completed,
        Some(progress.processed as i64),
        Some(progress.failed as i64),
        error_log.as_deref(),
    );
    info!(
        job = %job_id,
        processed = progress.processed,
        failed = progress.failed,
        "Reparse job completed"
    );
}

#[derive(Default)]
struct Progress {
    processed: usize,
    failed: usize,
    errors: Vec<String>,
}

impl Progress {
    fn record_failure(&mut self, article_id: i64, error: &str) {
        self.failed += 1;
        if self.errors.len() < ERROR_LOG_LINES {
            self.errors.push(format!("Article {article_id}: {error}"));
        }
    }

    fn error_log(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("\n"))
        }
    }
}

fn parsed_to_fields(parsed: ArticleData) -> ParsedFields {
    ParsedFields {
        title: parsed.title,
        content: parsed.content,
        summary: parsed.summary,
        author: parsed.author,
        category: parsed.category,
        sub_category: parsed.sub_category,
        tags: parsed.tags.as_deref().map(serialize_string_list),
        published_at: parsed.published_at,
        images: parsed.images.as_deref().map(serialize_string_list),
    }
}

fn maybe_flush(
    store: &Store,
    job_id: &str,
    buffer: &mut Vec<(i64, ParsedFields)>,
    progress: &Progress,
) {
    if buffer.len() >= FLUSH_EVERY {
        flush(store, job_id, buffer, progress);
    }
}

fn flush(store: &Store, job_id: &str, buffer: &mut Vec<(i64, ParsedFields)>, progress: &Progress) {
    if !buffer.is_empty() {
        if let Err(e) = store.articles().apply_parsed_batch(buffer) {
            warn!(job = %job_id, error = %e, "Failed to write parsed batch");
        }
        buffer.clear();
    }
    let _ = store
        .reparse_jobs()
        .update_progress(job_id, progress.processed as i64, progress.failed as i64);
}

fn finish_cancelled(
    store: &Store,
    job_id: &str,
    buffer: &mut Vec<(i64, ParsedFields)>,
    progress: &Progress,
) {
    flush(store, job_id, buffer, progress);
    let _ = store.reparse_jobs().update_status(
        job_id,
        ReparseStatus::Cancelled,
        Some(progress.processed as i64),
        Some(progress.failed as i64),
        None,
    );
    info!(job = %job_id, "Reparse job cancelled");
}
