//! Parsed news article records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Compute the URL hash used for fast dedup lookups: the first 16 bytes of
/// SHA-256, hex-encoded (32 characters).
pub fn compute_url_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Serialize a list of strings to a JSON array string for storage.
///
/// Writers always normalize to JSON; readers accept both JSON arrays and
/// legacy comma-separated values (see [`parse_string_list`]).
pub fn serialize_string_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

/// Parse a stored tags/images value into a list of strings.
///
/// Tries a JSON array first; falls back to comma-splitting for values
/// written by older reparse passes.
pub fn parse_string_list(raw: &str) -> Vec<String> {
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(raw) {
        return items
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                other => Some(other.to_string()),
            })
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A parsed news article.
///
/// `raw_html` is empty exactly when an ARCHIVED archive record exists for
/// the article, or when the crawler produced none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub url: String,
    /// 16-byte digest of `url`, indexed for dedup.
    pub url_hash: String,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub source: String,
    pub crawler_name: String,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    /// JSON array string (readers also accept comma-separated).
    pub tags: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub crawled_at: DateTime<Utc>,
    pub raw_html: Option<String>,
    /// JSON array string of image URLs.
    pub images: Option<String>,
}

impl Article {
    /// Parsed tag list, tolerant of both storage formats.
    pub fn tag_list(&self) -> Vec<String> {
        self.tags.as_deref().map(parse_string_list).unwrap_or_default()
    }

    /// Parsed image URL list.
    pub fn image_list(&self) -> Vec<String> {
        self.images
            .as_deref()
            .map(parse_string_list)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_hash_is_32_hex_chars() {
        let hash = compute_url_hash("https://example.com/news/1");
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // deterministic
        assert_eq!(hash, compute_url_hash("https://example.com/news/1"));
        assert_ne!(hash, compute_url_hash("https://example.com/news/2"));
    }

    #[test]
    fn string_list_round_trip() {
        let tags = vec!["政治".to_string(), "選舉".to_string()];
        let raw = serialize_string_list(&tags);
        assert_eq!(parse_string_list(&raw), tags);
    }

    #[test]
    fn string_list_accepts_comma_separated() {
        assert_eq!(
            parse_string_list("一鍵看世界, 美國 ,白宮"),
            vec!["一鍵看世界", "美國", "白宮"]
        );
    }

    #[test]
    fn string_list_ignores_empty_segments() {
        assert_eq!(parse_string_list("a,,b,"), vec!["a", "b"]);
        assert!(parse_string_list("[]").is_empty());
    }
}
