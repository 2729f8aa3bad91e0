//! Crawl executor: runs one crawler tick against the queue and the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::crawlers::{ArticleData, CrawlerRegistry};
use crate::models::{compute_url_hash, serialize_string_list, Article, CrawlerKind, CrawlerRunStatus};
use crate::repository::{Store, TickOutcome};
use crate::scheduler::{JobFn, Scheduler};

/// Minutes after which a PROCESSING lease is considered stale.
pub const STALE_PROCESSING_MINUTES: i64 = 10;

/// Executes crawler ticks: reconciles queue state, invokes the crawler,
/// and commits its effect (URL enqueue or article insert + queue
/// transitions).
pub struct CrawlExecutor {
    store: Store,
    registry: Arc<CrawlerRegistry>,
    scheduler: Option<Arc<Scheduler>>,
}

impl CrawlExecutor {
    pub fn new(store: Store, registry: Arc<CrawlerRegistry>) -> Self {
        Self {
            store,
            registry,
            scheduler: None,
        }
    }

    /// Attach the scheduler so ticks can record their next run time.
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Crash recovery at process start: force RUNNING crawlers back to
    /// IDLE and PROCESSING URLs back to PENDING. Returns (crawlers reset,
    /// urls reset).
    pub fn recover_on_startup(&self) -> crate::repository::Result<(usize, usize)> {
        let crawlers = self.store.crawlers().reset_running_to_idle()?;
        let urls = self.store.queue().force_reset_all_processing(None)?;
        if crawlers > 0 || urls > 0 {
            info!(crawlers, urls, "Recovered interrupted work from previous run");
        }
        Ok((crawlers, urls))
    }

    /// Execute one tick for a crawler by name. Failures are captured into
    /// the crawler's config row; this function never panics the scheduler.
    pub async fn execute(&self, crawler_name: &str) {
        if let Err(e) = self.execute_inner(crawler_name).await {
            error!(crawler = %crawler_name, error = %e, "Crawler tick failed outside run bookkeeping");
        }
    }

    async fn execute_inner(&self, crawler_name: &str) -> anyhow::Result<()> {
        let crawlers = self.store.crawlers();
        let Some(config) = crawlers.get_by_name(crawler_name)? else {
            warn!(crawler = %crawler_name, "Crawler config not found");
            return Ok(());
        };
        let Some(kind) = self.registry.kind_of(crawler_name) else {
            warn!(crawler = %crawler_name, "Crawler not registered");
            return Ok(());
        };

        crawlers.set_running(crawler_name)?;

        let timeout = Duration::from_secs(config.timeout_seconds.max(1) as u64);
        let result = match kind {
            CrawlerKind::List => self.run_list_tick(crawler_name, &config.source, timeout).await,
            CrawlerKind::Article => {
                self.run_article_tick(crawler_name, &config.source, timeout)
                    .await
            }
        };

        let next_run_time = self
            .scheduler
            .as_ref()
            .and_then(|s| s.next_run_time(crawler_name));

        let outcome = match result {
            Ok(items_count) => {
                info!(crawler = %crawler_name, items = items_count, "Tick succeeded");
                TickOutcome {
                    status: CrawlerRunStatus::Success,
                    error: None,
                    items_count,
                    next_run_time,
                }
            }
            Err(TickError::Timeout) => {
                let message = format!("Execution timeout after {}s", config.timeout_seconds);
                warn!(crawler = %crawler_name, "{message}");
                TickOutcome {
                    status: CrawlerRunStatus::Failed,
                    error: Some(message),
                    items_count: 0,
                    next_run_time,
                }
            }
            Err(TickError::Crawl(message)) => {
                warn!(crawler = %crawler_name, error = %message, "Tick failed");
                TickOutcome {
                    status: CrawlerRunStatus::Failed,
                    error: Some(message),
                    items_count: 0,
                    next_run_time,
                }
            }
        };

        crawlers.finish_run(crawler_name, &outcome)?;
        Ok(())
    }

    /// List tick: discover URLs, deduplicate, enqueue.
    async fn run_list_tick(
        &self,
        crawler_name: &str,
        source: &str,
        timeout: Duration,
    ) -> Result<i64, TickError> {
        let crawler = self
            .registry
            .list_crawler(crawler_name)
            .ok_or_else(|| TickError::Crawl(format!("list crawler {crawler_name} not found")))?;

        let urls = tokio::time::timeout(timeout, crawler.discover())
            .await
            .map_err(|_| TickError::Timeout)?
            .map_err(|e| TickError::Crawl(e.to_string()))?;

        if urls.is_empty() {
            return Ok(0);
        }

        let added = self
            .store
            .queue()
            .add_urls(&urls, source)
            .map_err(|e| TickError::Crawl(e.to_string()))?;
        info!(
            crawler = %crawler_name,
            discovered = urls.len(),
            new = added,
            "URLs enqueued"
        );
        Ok(added as i64)
    }

    /// Article tick: reclaim stale leases, lease a batch, crawl, commit
    /// per-article results.
    async fn run_article_tick(
        &self,
        crawler_name: &str,
        source: &str,
        timeout: Duration,
    ) -> Result<i64, TickError> {
        let crawler = self
            .registry
            .article_crawler(crawler_name)
            .ok_or_else(|| TickError::Crawl(format!("article crawler {crawler_name} not found")))?;
        let queue = self.store.queue();

        let reclaimed = queue
            .reset_stale_processing(STALE_PROCESSING_MINUTES)
            .map_err(|e| TickError::Crawl(e.to_string()))?;
        if reclaimed > 0 {
            info!(crawler = %crawler_name, reclaimed, "Reset stale PROCESSING URLs");
        }

        let leased = queue
            .lease(source, crawler.batch_size())
            .map_err(|e| TickError::Crawl(e.to_string()))?;
        if leased.is_empty() {
            return Ok(0);
        }

        let url_to_lease: HashMap<String, i64> =
            leased.iter().map(|u| (u.url.clone(), u.id)).collect();
        let urls: Vec<String> = leased.iter().map(|u| u.url.clone()).collect();

        let outcome = match tokio::time::timeout(timeout, crawler.crawl(&urls)).await {
            Err(_) => return Err(TickError::Timeout),
            Ok(Err(e)) => {
                // Catastrophic crawl failure: every lease is failed
                let message = e.to_string();
                for lease_id in url_to_lease.values() {
                    let _ = queue.mark_failed(*lease_id, &message);
                }
                return Err(TickError::Crawl(message));
            }
            Ok(Ok(outcome)) => outcome,
        };

        let articles_repo = self.store.articles();
        let mut inserted = 0i64;
        for data in outcome.articles {
            let lease_id = url_to_lease.get(&data.url).copied();
            let article = article_from_data(data, source, crawler_name);
            match articles_repo.insert(&article) {
                Ok(_) => {
                    inserted += 1;
                    if let Some(lease_id) = lease_id {
                        queue
                            .mark_completed(lease_id)
                            .map_err(|e| TickError::Crawl(e.to_string()))?;
                    }
                }
                Err(e) => {
                    warn!(url = %article.url, error = %e, "Article insert failed");
                    if let Some(lease_id) = lease_id {
                        let _ = queue.mark_failed(lease_id, &e.to_string());
                    }
                }
            }
        }

        for (url, error) in &outcome.failed_urls {
            if let Some(lease_id) = url_to_lease.get(url) {
                queue
                    .mark_failed(*lease_id, error)
                    .map_err(|e| TickError::Crawl(e.to_string()))?;
            }
        }

        info!(
            crawler = %crawler_name,
            fetched = inserted,
            failed = outcome.failed_urls.len(),
            "Article tick committed"
        );
        Ok(inserted)
    }
}

enum TickError {
    Timeout,
    Crawl(String),
}

/// Convert crawler output into a storable article row.
fn article_from_data(data: ArticleData, source: &str, crawler_name: &str) -> Article {
    Article {
        id: 0,
        url_hash: compute_url_hash(&data.url),
        url: data.url,
        title: data.title,
        content: data.content,
        summary: data.summary,
        author: data.author,
        source: source.to_string(),
        crawler_name: crawler_name.to_string(),
        category: data.category,
        sub_category: data.sub_category,
        tags: data.tags.as_deref().map(serialize_string_list),
        published_at: data.published_at,
        crawled_at: Utc::now(),
        raw_html: data.raw_html,
        images: data.images.as_deref().map(serialize_string_list),
    }
}

/// Register every active crawler with the scheduler and record its next
/// run time. Called once at daemon startup.
pub fn schedule_all_active(
    executor: Arc<CrawlExecutor>,
    scheduler: &Scheduler,
) -> crate::repository::Result<usize> {
    let configs = executor.store.crawlers().get_active()?;
    let mut scheduled = 0usize;
    for config in configs {
        if executor.registry.kind_of(&config.name).is_none() {
            warn!(crawler = %config.name, "Active config has no registered crawler, skipping");
            continue;
        }
        scheduler.add_job(&config.name, config.interval_minutes, tick_job(&executor, &config.name));
        executor
            .store
            .crawlers()
            .update_next_run_time(&config.name, scheduler.next_run_time(&config.name))?;
        scheduled += 1;
    }
    info!(scheduled, "Active crawlers scheduled");
    Ok(scheduled)
}

/// Build the scheduler job closure for one crawler.
pub fn tick_job(executor: &Arc<CrawlExecutor>, crawler_name: &str) -> JobFn {
    let executor = executor.clone();
    let name = crawler_name.to_string();
    Arc::new(move || {
        let executor = executor.clone();
        let name = name.clone();
        Box::pin(async move {
            executor.execute(&name).await;
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawlers::{
        ArticleCrawler, CrawlError, CrawlOutcome, ListCrawler,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct StubListCrawler {
        name: String,
        source: String,
        urls: Vec<String>,
        delay: Option<Duration>,
        timeout_secs: i64,
    }

    impl StubListCrawler {
        fn quick(name: &str, source: &str, urls: Vec<String>) -> Self {
            Self {
                name: name.into(),
                source: source.into(),
                urls,
                delay: None,
                timeout_secs: 300,
            }
        }
    }

    #[async_trait]
    impl ListCrawler for StubListCrawler {
        fn name(&self) -> &str {
            &self.name
        }
        fn display_name(&self) -> &str {
            "Stub - List"
        }
        fn source(&self) -> &str {
            &self.source
        }
        fn default_timeout_seconds(&self) -> i64 {
            self.timeout_secs
        }
        async fn discover(&self) -> Result<Vec<String>, CrawlError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.urls.clone())
        }
    }

    struct StubArticleCrawler {
        name: String,
        source: String,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl ArticleCrawler for StubArticleCrawler {
        fn name(&self) -> &str {
            &self.name
        }
        fn display_name(&self) -> &str {
            "Stub - Article"
        }
        fn source(&self) -> &str {
            &self.source
        }
        async fn crawl(&self, urls: &[String]) -> Result<CrawlOutcome, CrawlError> {
            let mut outcome = CrawlOutcome::default();
            for url in urls {
                if self.failing.contains(url) {
                    outcome
                        .failed_urls
                        .push((url.clone(), "404 not found".to_string()));
                } else {
                    outcome.articles.push(ArticleData {
                        url: url.clone(),
                        title: format!("title for {url}"),
                        content: "body".to_string(),
                        summary: None,
                        author: None,
                        category: None,
                        sub_category: None,
                        tags: Some(vec!["測試".to_string()]),
                        published_at: Some(Utc::now()),
                        raw_html: Some("<html></html>".to_string()),
                        images: None,
                    });
                }
            }
            Ok(outcome)
        }
        fn parse_html(&self, _raw_html: &str, url: &str) -> Result<ArticleData, CrawlError> {
            Err(CrawlError::Parse(format!("not implemented for {url}")))
        }
    }

    fn setup(registry: CrawlerRegistry) -> (TempDir, Arc<CrawlExecutor>, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let registry = Arc::new(registry);
        registry.sync_to_store(&store).unwrap();
        let executor = Arc::new(CrawlExecutor::new(store.clone(), registry));
        (dir, executor, store)
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("https://example.com/news/{i}"))
            .collect()
    }

    #[tokio::test]
    async fn list_tick_enqueues_and_dedupes() {
        let mut registry = CrawlerRegistry::new();
        registry.register_list(Arc::new(StubListCrawler::quick("stub_list", "Stub", urls(5))));
        let (_dir, executor, store) = setup(registry);

        executor.execute("stub_list").await;
        let config = store.crawlers().get_by_name("stub_list").unwrap().unwrap();
        assert_eq!(config.last_run_status, CrawlerRunStatus::Success);
        assert_eq!(config.last_run_items_count, 5);
        assert_eq!(store.queue().stats(None).unwrap().pending, 5);

        // Second tick discovers the same URLs: nothing new
        executor.execute("stub_list").await;
        let config = store.crawlers().get_by_name("stub_list").unwrap().unwrap();
        assert_eq!(config.last_run_items_count, 0);
        assert_eq!(config.total_items_count, 5);
    }

    #[tokio::test]
    async fn article_tick_commits_mixed_results() {
        let mut registry = CrawlerRegistry::new();
        registry.register_list(Arc::new(StubListCrawler::quick("stub_list", "Stub", urls(3))));
        registry.register_article(Arc::new(StubArticleCrawler {
            name: "stub_article".into(),
            source: "Stub".into(),
            failing: HashSet::from(["https://example.com/news/1".to_string()]),
        }));
        let (_dir, executor, store) = setup(registry);

        executor.execute("stub_list").await;
        executor.execute("stub_article").await;

        let config = store
            .crawlers()
            .get_by_name("stub_article")
            .unwrap()
            .unwrap();
        // Per-article failures do not fail the tick
        assert_eq!(config.last_run_status, CrawlerRunStatus::Success);
        assert_eq!(config.last_run_items_count, 2);

        let stats = store.queue().stats(None).unwrap();
        assert_eq!(stats.completed, 2);
        // Failed URL went back to pending with a retry left
        assert_eq!(stats.pending, 1);

        let articles = store.articles().fetch_for_window(None, None, 10, 0).unwrap();
        assert_eq!(articles.len(), 2);
        assert!(articles.iter().all(|a| a.source == "Stub"));
        assert!(articles.iter().all(|a| a.raw_html.is_some()));
    }

    #[tokio::test]
    async fn article_tick_with_empty_queue_is_successful_noop() {
        let mut registry = CrawlerRegistry::new();
        registry.register_article(Arc::new(StubArticleCrawler {
            name: "stub_article".into(),
            source: "Stub".into(),
            failing: HashSet::new(),
        }));
        let (_dir, executor, store) = setup(registry);

        executor.execute("stub_article").await;
        let config = store
            .crawlers()
            .get_by_name("stub_article")
            .unwrap()
            .unwrap();
        assert_eq!(config.last_run_status, CrawlerRunStatus::Success);
        assert_eq!(config.last_run_items_count, 0);
    }

    #[tokio::test]
    async fn timeout_marks_tick_failed() {
        let mut registry = CrawlerRegistry::new();
        registry.register_list(Arc::new(StubListCrawler {
            name: "slow_list".into(),
            source: "Slow".into(),
            urls: urls(1),
            delay: Some(Duration::from_secs(5)),
            timeout_secs: 1,
        }));
        let (_dir, executor, store) = setup(registry);

        executor.execute("slow_list").await;
        let config = store.crawlers().get_by_name("slow_list").unwrap().unwrap();
        assert_eq!(config.last_run_status, CrawlerRunStatus::Failed);
        assert!(config
            .error_log
            .unwrap()
            .contains("Execution timeout after"));
    }

    #[tokio::test]
    async fn startup_recovery_resets_state() {
        let mut registry = CrawlerRegistry::new();
        registry.register_list(Arc::new(StubListCrawler::quick("stub_list", "Stub", urls(2))));
        let (_dir, executor, store) = setup(registry);

        executor.execute("stub_list").await;
        store.crawlers().set_running("stub_list").unwrap();
        store.queue().lease("Stub", 0).unwrap();

        let (crawlers, urls_reset) = executor.recover_on_startup().unwrap();
        assert_eq!(crawlers, 1);
        assert_eq!(urls_reset, 2);
        assert_eq!(store.queue().stats(None).unwrap().pending, 2);
    }
}
