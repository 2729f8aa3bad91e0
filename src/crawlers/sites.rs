//! Selector-driven list and article crawlers.
//!
//! Both crawlers are instantiated from a [`SiteConfig`] entry. Parsing is
//! kept in synchronous helpers so the parsed DOM never crosses an await
//! point.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::http::HttpClient;
use super::site_config::{ArticleSelectors, CrawlerDefaults, SiteConfig};
use super::{ArticleCrawler, ArticleData, CrawlError, CrawlOutcome, ListCrawler, Result};

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| CrawlError::Config(format!("bad selector {selector:?}: {e}")))
}

fn compile_opt(selector: &Option<String>) -> Result<Option<Selector>> {
    selector.as_deref().map(compile).transpose()
}

/// Extract the value of a selector match: `content` attribute for meta
/// elements, joined text otherwise. Multiple matches join with newlines.
fn select_value(doc: &Html, selector: &Selector) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for element in doc.select(selector) {
        let value = if element.value().name().eq_ignore_ascii_case("meta") {
            element.value().attr("content").unwrap_or_default().to_string()
        } else {
            element.text().collect::<Vec<_>>().join("")
        };
        let value = value.trim();
        if !value.is_empty() {
            parts.push(value.to_string());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Parse a published timestamp in the formats sites commonly emit,
/// normalizing to UTC. Naive timestamps are assumed UTC.
pub(crate) fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Extract article links from an index page: select anchors, resolve
/// against the base URL, keep matches of the URL pattern.
pub(crate) fn extract_links(
    html: &str,
    link_selector: &Selector,
    base: &Url,
    pattern: Option<&Regex>,
) -> BTreeSet<String> {
    let doc = Html::parse_document(html);
    let mut urls = BTreeSet::new();
    for element in doc.select(link_selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(absolute) = base.join(href.trim()) else {
            continue;
        };
        let absolute = absolute.to_string();
        if pattern.map(|p| p.is_match(&absolute)).unwrap_or(true) {
            urls.insert(absolute);
        }
    }
    urls
}

/// List crawler scanning a site's index pages for article URLs.
pub struct SelectorListCrawler {
    name: String,
    display_name: String,
    source: String,
    list_pages: Vec<String>,
    link_selector: Selector,
    url_pattern: Option<Regex>,
    base: Url,
    interval_minutes: i64,
    timeout_seconds: i64,
    client: HttpClient,
}

impl SelectorListCrawler {
    pub fn from_config(config: &SiteConfig, defaults: CrawlerDefaults) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| CrawlError::Config(format!("bad base_url {}: {e}", config.base_url)))?;
        let url_pattern = config
            .url_pattern
            .as_deref()
            .map(|p| Regex::new(p).map_err(|e| CrawlError::Config(format!("bad url_pattern: {e}"))))
            .transpose()?;
        let timeout_seconds = config
            .timeout_seconds
            .unwrap_or(defaults.timeout_seconds)
            .max(1);
        let client = HttpClient::new(
            Duration::from_secs(timeout_seconds as u64),
            Duration::from_millis(config.request_delay_ms),
            config.user_agent.as_deref(),
            config.referer.as_deref(),
        )?;

        Ok(Self {
            name: config.list_crawler_name(),
            display_name: format!("{} - List", config.display_name_or_source()),
            source: config.source.clone(),
            list_pages: config.list_pages.clone(),
            link_selector: compile(&config.link_selector)?,
            url_pattern,
            base,
            interval_minutes: config
                .list_interval_minutes
                .unwrap_or(defaults.interval_minutes)
                .max(1),
            timeout_seconds,
            client,
        })
    }
}

#[async_trait]
impl ListCrawler for SelectorListCrawler {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn default_interval_minutes(&self) -> i64 {
        self.interval_minutes
    }

    fn default_timeout_seconds(&self) -> i64 {
        self.timeout_seconds
    }

    async fn discover(&self) -> Result<Vec<String>> {
        let mut urls = BTreeSet::new();
        for page in &self.list_pages {
            let html = self.client.get_text(page).await?;
            let found = extract_links(
                &html,
                &self.link_selector,
                &self.base,
                self.url_pattern.as_ref(),
            );
            debug!(page = %page, found = found.len(), "Scanned index page");
            urls.extend(found);
        }
        Ok(urls.into_iter().collect())
    }
}

struct CompiledSelectors {
    title: Selector,
    content: Selector,
    summary: Option<Selector>,
    author: Option<Selector>,
    category: Option<Selector>,
    sub_category: Option<Selector>,
    tags: Option<Selector>,
    published_at: Option<Selector>,
    images: Option<Selector>,
}

impl CompiledSelectors {
    fn from_config(selectors: &ArticleSelectors) -> Result<Self> {
        Ok(Self {
            title: compile(&selectors.title)?,
            content: compile(&selectors.content)?,
            summary: compile_opt(&selectors.summary)?,
            author: compile_opt(&selectors.author)?,
            category: compile_opt(&selectors.category)?,
            sub_category: compile_opt(&selectors.sub_category)?,
            tags: compile_opt(&selectors.tags)?,
            published_at: compile_opt(&selectors.published_at)?,
            images: compile_opt(&selectors.images)?,
        })
    }
}

/// Article crawler fetching and parsing individual article pages.
pub struct SelectorArticleCrawler {
    name: String,
    display_name: String,
    source: String,
    selectors: CompiledSelectors,
    interval_minutes: i64,
    timeout_seconds: i64,
    batch_size: usize,
    client: HttpClient,
}

impl SelectorArticleCrawler {
    pub fn from_config(config: &SiteConfig, defaults: CrawlerDefaults) -> Result<Self> {
        let timeout_seconds = config
            .timeout_seconds
            .unwrap_or(defaults.timeout_seconds)
            .max(1);
        let client = HttpClient::new(
            Duration::from_secs(timeout_seconds as u64),
            Duration::from_millis(config.request_delay_ms),
            config.user_agent.as_deref(),
            config.referer.as_deref(),
        )?;

        Ok(Self {
            name: config.article_crawler_name(),
            display_name: format!("{} - Article", config.display_name_or_source()),
            source: config.source.clone(),
            selectors: CompiledSelectors::from_config(&config.selectors)?,
            interval_minutes: config
                .article_interval_minutes
                .unwrap_or(defaults.interval_minutes)
                .max(1),
            timeout_seconds,
            batch_size: config.article_batch_size,
            client,
        })
    }

    fn parse_document(&self, raw_html: &str, url: &str) -> Result<ArticleData> {
        let doc = Html::parse_document(raw_html);

        let title = select_value(&doc, &self.selectors.title)
            .ok_or_else(|| CrawlError::Parse(format!("no title matched for {url}")))?;
        let content = select_value(&doc, &self.selectors.content)
            .ok_or_else(|| CrawlError::Parse(format!("no content matched for {url}")))?;

        let tags = self
            .selectors
            .tags
            .as_ref()
            .and_then(|s| select_value(&doc, s))
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|tags| !tags.is_empty());

        let images = self.selectors.images.as_ref().map(|selector| {
            let page_url = Url::parse(url).ok();
            doc.select(selector)
                .filter_map(|el| el.value().attr("src"))
                .filter_map(|src| match &page_url {
                    Some(base) => base.join(src).ok().map(|u| u.to_string()),
                    None => Some(src.to_string()),
                })
                .collect::<Vec<_>>()
        });
        let images = images.filter(|list| !list.is_empty());

        let published_at = self
            .selectors
            .published_at
            .as_ref()
            .and_then(|s| select_value(&doc, s))
            .and_then(|raw| parse_published_at(&raw));

        Ok(ArticleData {
            url: url.to_string(),
            title,
            content,
            summary: self
                .selectors
                .summary
                .as_ref()
                .and_then(|s| select_value(&doc, s)),
            author: self
                .selectors
                .author
                .as_ref()
                .and_then(|s| select_value(&doc, s)),
            category: self
                .selectors
                .category
                .as_ref()
                .and_then(|s| select_value(&doc, s)),
            sub_category: self
                .selectors
                .sub_category
                .as_ref()
                .and_then(|s| select_value(&doc, s)),
            tags,
            published_at,
            raw_html: None,
            images,
        })
    }
}

#[async_trait]
impl ArticleCrawler for SelectorArticleCrawler {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn default_interval_minutes(&self) -> i64 {
        self.interval_minutes
    }

    fn default_timeout_seconds(&self) -> i64 {
        self.timeout_seconds
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn crawl(&self, urls: &[String]) -> Result<CrawlOutcome> {
        let mut outcome = CrawlOutcome::default();
        for url in urls {
            let html = match self.client.get_text(url).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(crawler = %self.name, %url, error = %e, "Fetch failed");
                    outcome.failed_urls.push((url.clone(), e.to_string()));
                    continue;
                }
            };
            match self.parse_document(&html, url) {
                Ok(mut article) => {
                    article.raw_html = Some(html);
                    outcome.articles.push(article);
                }
                Err(e) => {
                    warn!(crawler = %self.name, %url, error = %e, "Parse failed");
                    outcome.failed_urls.push((url.clone(), e.to_string()));
                }
            }
        }
        Ok(outcome)
    }

    fn parse_html(&self, raw_html: &str, url: &str) -> Result<ArticleData> {
        self.parse_document(raw_html, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SiteConfig {
        toml::from_str(
            r#"
            source = "TestWire"
            base_url = "https://news.example.com"
            list_pages = ["https://news.example.com/latest"]
            url_pattern = 'https://news\.example\.com/news/\d+'

            [selectors]
            title = "h1.headline"
            content = "div.article-body p"
            summary = "meta[name=description]"
            author = "span.byline"
            category = "meta[property='article:section']"
            tags = "meta[name=news_keywords]"
            published_at = "meta[property='article:published_time']"
            images = "div.article-body img"
        "#,
        )
        .unwrap()
    }

    const ARTICLE_HTML: &str = r#"
        <html><head>
            <meta name="description" content="短摘要">
            <meta property="article:section" content="政治">
            <meta name="news_keywords" content="選舉, 立法院">
            <meta property="article:published_time" content="2025-06-01T08:30:00+08:00">
        </head><body>
            <h1 class="headline">測試新聞標題</h1>
            <span class="byline">記者王小明</span>
            <div class="article-body">
                <p>第一段內容。</p>
                <p>第二段內容。</p>
                <img src="/images/a.jpg">
            </div>
        </body></html>
    "#;

    #[test]
    fn parse_html_extracts_all_fields() {
        let crawler = SelectorArticleCrawler::from_config(&test_config(), CrawlerDefaults::default()).unwrap();
        let article = crawler
            .parse_html(ARTICLE_HTML, "https://news.example.com/news/123")
            .unwrap();

        assert_eq!(article.title, "測試新聞標題");
        assert_eq!(article.content, "第一段內容。\n第二段內容。");
        assert_eq!(article.summary.as_deref(), Some("短摘要"));
        assert_eq!(article.author.as_deref(), Some("記者王小明"));
        assert_eq!(article.category.as_deref(), Some("政治"));
        assert_eq!(
            article.tags,
            Some(vec!["選舉".to_string(), "立法院".to_string()])
        );
        // +08:00 normalized to UTC
        assert_eq!(
            article.published_at.unwrap().to_rfc3339(),
            "2025-06-01T00:30:00+00:00"
        );
        assert_eq!(
            article.images,
            Some(vec!["https://news.example.com/images/a.jpg".to_string()])
        );
    }

    #[test]
    fn parse_html_is_pure_and_repeatable() {
        let crawler = SelectorArticleCrawler::from_config(&test_config(), CrawlerDefaults::default()).unwrap();
        let url = "https://news.example.com/news/123";
        let first = crawler.parse_html(ARTICLE_HTML, url).unwrap();
        let second = crawler.parse_html(ARTICLE_HTML, url).unwrap();
        assert_eq!(first.title, second.title);
        assert_eq!(first.content, second.content);
        assert_eq!(first.published_at, second.published_at);
    }

    #[test]
    fn parse_html_fails_without_title() {
        let crawler = SelectorArticleCrawler::from_config(&test_config(), CrawlerDefaults::default()).unwrap();
        let err = crawler
            .parse_html("<html><body><p>x</p></body></html>", "https://n/1")
            .unwrap_err();
        assert!(matches!(err, CrawlError::Parse(_)));
    }

    #[test]
    fn link_extraction_resolves_and_filters() {
        let html = r#"
            <a href="/news/100">relative</a>
            <a href="https://news.example.com/news/200">absolute</a>
            <a href="https://news.example.com/about">not an article</a>
            <a href="https://other.example.com/news/300">other host</a>
        "#;
        let selector = Selector::parse("a[href]").unwrap();
        let base = Url::parse("https://news.example.com").unwrap();
        let pattern = Regex::new(r"https://news\.example\.com/news/\d+").unwrap();

        let urls = extract_links(html, &selector, &base, Some(&pattern));
        assert_eq!(
            urls.into_iter().collect::<Vec<_>>(),
            vec![
                "https://news.example.com/news/100".to_string(),
                "https://news.example.com/news/200".to_string(),
            ]
        );
    }

    #[test]
    fn published_at_formats() {
        assert!(parse_published_at("2025-06-01T08:30:00+08:00").is_some());
        assert!(parse_published_at("2025/06/01 08:30").is_some());
        assert!(parse_published_at("2025-06-01 08:30:00").is_some());
        assert!(parse_published_at("yesterday").is_none());
    }
}
