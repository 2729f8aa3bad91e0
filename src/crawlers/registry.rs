//! Crawler registry: instantiation, lookup, and database sync.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use super::site_config::{CrawlerDefaults, SiteConfig};
use super::sites::{SelectorArticleCrawler, SelectorListCrawler};
use super::{ArticleCrawler, ListCrawler};
use crate::models::{CrawlerConfig, CrawlerKind};
use crate::repository::Store;

/// Static description of a crawler, used for registry sync.
#[derive(Debug, Clone)]
pub struct CrawlerDescriptor {
    pub name: String,
    pub display_name: String,
    pub source: String,
    pub kind: CrawlerKind,
    pub default_interval_minutes: i64,
    pub default_timeout_seconds: i64,
}

/// Registry of instantiated crawlers, keyed by name and by (source, kind).
///
/// Instantiation failures are logged loudly but never abort startup.
#[derive(Default)]
pub struct CrawlerRegistry {
    list: HashMap<String, Arc<dyn ListCrawler>>,
    article: HashMap<String, Arc<dyn ArticleCrawler>>,
}

impl CrawlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate a list/article crawler pair per configured site.
    pub fn from_sites(sites: &[SiteConfig], defaults: CrawlerDefaults) -> Self {
        let mut registry = Self::new();
        for site in sites {
            match SelectorListCrawler::from_config(site, defaults) {
                Ok(crawler) => registry.register_list(Arc::new(crawler)),
                Err(e) => error!(source = %site.source, error = %e, "Failed to instantiate list crawler"),
            }
            match SelectorArticleCrawler::from_config(site, defaults) {
                Ok(crawler) => registry.register_article(Arc::new(crawler)),
                Err(e) => error!(source = %site.source, error = %e, "Failed to instantiate article crawler"),
            }
        }
        registry
    }

    pub fn register_list(&mut self, crawler: Arc<dyn ListCrawler>) {
        info!(crawler = crawler.name(), "Registered list crawler");
        self.list.insert(crawler.name().to_string(), crawler);
    }

    pub fn register_article(&mut self, crawler: Arc<dyn ArticleCrawler>) {
        info!(crawler = crawler.name(), "Registered article crawler");
        self.article.insert(crawler.name().to_string(), crawler);
    }

    pub fn list_crawler(&self, name: &str) -> Option<Arc<dyn ListCrawler>> {
        self.list.get(name).cloned()
    }

    pub fn article_crawler(&self, name: &str) -> Option<Arc<dyn ArticleCrawler>> {
        self.article.get(name).cloned()
    }

    /// Kind of a registered crawler, if any.
    pub fn kind_of(&self, name: &str) -> Option<CrawlerKind> {
        if self.list.contains_key(name) {
            Some(CrawlerKind::List)
        } else if self.article.contains_key(name) {
            Some(CrawlerKind::Article)
        } else {
            None
        }
    }

    pub fn article_crawler_for_source(&self, source: &str) -> Option<Arc<dyn ArticleCrawler>> {
        self.article
            .values()
            .find(|c| c.source() == source)
            .cloned()
    }

    pub fn list_crawler_for_source(&self, source: &str) -> Option<Arc<dyn ListCrawler>> {
        self.list.values().find(|c| c.source() == source).cloned()
    }

    /// Stable descriptors for every registered crawler.
    pub fn descriptors(&self) -> Vec<CrawlerDescriptor> {
        let mut descriptors: Vec<CrawlerDescriptor> = self
            .list
            .values()
            .map(|c| CrawlerDescriptor {
                name: c.name().to_string(),
                display_name: c.display_name().to_string(),
                source: c.source().to_string(),
                kind: CrawlerKind::List,
                default_interval_minutes: c.default_interval_minutes(),
                default_timeout_seconds: c.default_timeout_seconds(),
            })
            .chain(self.article.values().map(|c| CrawlerDescriptor {
                name: c.name().to_string(),
                display_name: c.display_name().to_string(),
                source: c.source().to_string(),
                kind: CrawlerKind::Article,
                default_interval_minutes: c.default_interval_minutes(),
                default_timeout_seconds: c.default_timeout_seconds(),
            }))
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Synchronize the crawler_configs table with the registry: new
    /// crawlers are inserted, existing rows only get display/source/kind
    /// refreshed.
    pub fn sync_to_store(&self, store: &Store) -> crate::repository::Result<Vec<CrawlerConfig>> {
        let repo = store.crawlers();
        let mut synced = Vec::new();
        for descriptor in self.descriptors() {
            let config = repo.sync_crawler(
                &descriptor.name,
                &descriptor.display_name,
                &descriptor.source,
                descriptor.kind,
                descriptor.default_interval_minutes,
                descriptor.default_timeout_seconds,
            )?;
            synced.push(config);
        }
        info!(count = synced.len(), "Crawler registry synced to database");
        Ok(synced)
    }

    pub fn len(&self) -> usize {
        self.list.len() + self.article.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty() && self.article.is_empty()
    }
}
