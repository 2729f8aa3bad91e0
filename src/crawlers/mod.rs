//! Crawler implementations for news sources.

pub mod http;
mod registry;
mod site_config;
mod sites;
mod user_agent;

pub use http::HttpClient;
pub use registry::{CrawlerDescriptor, CrawlerRegistry};
pub use site_config::{ArticleSelectors, CrawlerDefaults, SiteConfig};
pub use sites::{SelectorArticleCrawler, SelectorListCrawler};
pub use user_agent::{resolve_user_agent, IMPERSONATE_USER_AGENTS, USER_AGENT};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid crawler configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CrawlError>;

/// A parsed article before it is saved to the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleData {
    pub url: String,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Normalized to UTC.
    pub published_at: Option<DateTime<Utc>>,
    pub raw_html: Option<String>,
    pub images: Option<Vec<String>>,
}

/// Result of one article-crawl invocation. Per-URL failures are reported
/// here instead of propagating; only catastrophic failures raise.
#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub articles: Vec<ArticleData>,
    /// (url, error text) pairs for URLs that could not be fetched or parsed.
    pub failed_urls: Vec<(String, String)>,
}

/// Discovers article URLs on a source's front or index pages.
#[async_trait]
pub trait ListCrawler: Send + Sync {
    /// Unique identifier, doubles as the scheduler job id.
    fn name(&self) -> &str;
    fn display_name(&self) -> &str;
    fn source(&self) -> &str;

    /// List crawlers typically run less frequently than article crawlers.
    fn default_interval_minutes(&self) -> i64 {
        30
    }

    fn default_timeout_seconds(&self) -> i64 {
        300
    }

    /// Return the absolute article URLs currently visible on the source.
    async fn discover(&self) -> Result<Vec<String>>;
}

/// Fetches and parses individual articles for a source.
#[async_trait]
pub trait ArticleCrawler: Send + Sync {
    fn name(&self) -> &str;
    fn display_name(&self) -> &str;
    fn source(&self) -> &str;

    fn default_interval_minutes(&self) -> i64 {
        5
    }

    fn default_timeout_seconds(&self) -> i64 {
        300
    }

    /// URLs processed per tick. 0 means no limit.
    fn batch_size(&self) -> usize {
        0
    }

    /// Fetch and parse the given URLs. Per-URL failures land in
    /// `failed_urls`; only invalid input raises.
    async fn crawl(&self, urls: &[String]) -> Result<CrawlOutcome>;

    /// Parse article data from raw HTML without network access. Used by
    /// the reparse engine to replay parsers over archived HTML.
    fn parse_html(&self, raw_html: &str, url: &str) -> Result<ArticleData>;
}
