//! Site definitions for the selector-driven crawlers.
//!
//! Each site entry in the configuration file instantiates one list crawler
//! and one article crawler, so new sources can be added without writing
//! custom code.

use serde::{Deserialize, Serialize};

/// Global fallbacks for sites that do not set their own cadence.
#[derive(Debug, Clone, Copy)]
pub struct CrawlerDefaults {
    pub interval_minutes: i64,
    pub timeout_seconds: i64,
}

impl Default for CrawlerDefaults {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            timeout_seconds: 300,
        }
    }
}

/// CSS selectors extracting article fields from a page.
///
/// Selectors matching `<meta>` elements read the `content` attribute;
/// everything else reads the joined element text. `content` may match
/// multiple elements, which are joined with newlines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleSelectors {
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_category: Option<String>,
    /// Comma-separated keywords source (e.g. `meta[name=news_keywords]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    /// Image elements; the `src` attribute is collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<String>,
}

/// One news site, driving a list/article crawler pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Source name (e.g. "ETtoday", "UDN").
    pub source: String,
    /// Human-readable name; defaults to the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Base URL used to resolve relative links.
    pub base_url: String,
    /// Index pages scanned by the list crawler.
    pub list_pages: Vec<String>,
    /// Anchor selector on index pages (default: every link).
    #[serde(default = "default_link_selector")]
    pub link_selector: String,
    /// Regex an absolute URL must match to count as an article.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    /// Field selectors for article pages.
    pub selectors: ArticleSelectors,
    /// User agent configuration ("impersonate", custom string, or absent
    /// for the default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Referer sent with every request, per the site's conventions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    /// Delay between requests in milliseconds.
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    /// Absent values fall back to the global crawler defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_interval_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_interval_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    /// URLs leased per article tick. 0 means no limit.
    #[serde(default)]
    pub article_batch_size: usize,
}

impl SiteConfig {
    /// Name of the list crawler for this site.
    pub fn list_crawler_name(&self) -> String {
        format!("{}_list", normalize_name(&self.source))
    }

    /// Name of the article crawler for this site.
    pub fn article_crawler_name(&self) -> String {
        format!("{}_article", normalize_name(&self.source))
    }

    pub fn display_name_or_source(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.source)
    }
}

fn normalize_name(source: &str) -> String {
    source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

fn default_request_delay_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_config_parses_from_toml() {
        let raw = r#"
            source = "ETtoday"
            base_url = "https://www.ettoday.net"
            list_pages = ["https://www.ettoday.net/news/news-list.htm"]
            url_pattern = 'https://www\.ettoday\.net/news/\d{8}/\d+\.htm'
            user_agent = "impersonate"
            list_interval_minutes = 15

            [selectors]
            title = "h1.title"
            content = "div.story p"
            published_at = "meta[property='article:published_time']"
        "#;
        let config: SiteConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.list_crawler_name(), "ettoday_list");
        assert_eq!(config.article_crawler_name(), "ettoday_article");
        assert_eq!(config.link_selector, "a[href]");
        assert_eq!(config.list_interval_minutes, Some(15));
        // Unset values fall back to the global defaults at instantiation
        assert_eq!(config.article_interval_minutes, None);
        assert_eq!(config.timeout_seconds, None);
    }
}
