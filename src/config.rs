//! Application configuration.
//!
//! Settings are loaded from an optional TOML file, with environment
//! variables taking precedence for secrets (API keys, database paths).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::crawlers::SiteConfig;

/// Default archive batch size (articles per batch file).
pub const DEFAULT_ARCHIVE_BATCH_SIZE: usize = 500;

/// Compression codec for archive batch files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveCompression {
    Gzip,
    None,
}

impl Default for ArchiveCompression {
    fn default() -> Self {
        Self::Gzip
    }
}

/// Application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the operational SQLite database.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Path to the analytical SQLite database (entity/event graph).
    #[serde(default = "default_analytics_database_path")]
    pub analytics_database_path: PathBuf,

    /// Scheduler timezone as a fixed UTC offset ("UTC" or "+08:00").
    #[serde(default = "default_timezone")]
    pub scheduler_timezone: String,

    /// Default scheduling interval for crawlers without one.
    #[serde(default = "default_interval_minutes")]
    pub default_crawler_interval_minutes: i64,

    /// Default execution timeout for crawlers without one.
    #[serde(default = "default_timeout_seconds")]
    pub default_crawler_timeout_seconds: i64,

    /// Base directory for raw HTML archives.
    #[serde(default = "default_archive_base_path")]
    pub archive_base_path: PathBuf,

    /// Articles per archive batch file.
    #[serde(default = "default_archive_batch_size")]
    pub archive_batch_size: usize,

    /// Archive compression codec.
    #[serde(default)]
    pub archive_compression: ArchiveCompression,

    /// Whether the daily auto-archive job is enabled.
    #[serde(default = "default_true")]
    pub auto_archive_enabled: bool,

    /// Hour (24h, scheduler timezone) at which the daily archive runs.
    #[serde(default = "default_archive_hour")]
    pub auto_archive_hour: u32,

    /// Minute at which the daily archive runs.
    #[serde(default)]
    pub auto_archive_minute: u32,

    /// OpenAI API key. Overridden by OPENAI_API_KEY.
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Model used for batched structured analysis.
    #[serde(default = "default_analysis_model")]
    pub llm_analysis_model: String,

    /// Seconds between batch status polls.
    #[serde(default = "default_poll_interval")]
    pub llm_analysis_poll_interval: u64,

    /// Maximum seconds to wait for a batch before pausing the run.
    #[serde(default = "default_max_wait")]
    pub llm_analysis_max_wait: u64,

    /// Default lookback window in days for quick pipeline runs.
    #[serde(default = "default_pipeline_days")]
    pub pipeline_default_days: i64,

    /// Site definitions driving the selector-based crawlers.
    #[serde(default)]
    pub sources: Vec<SiteConfig>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./newsacquire.db")
}

fn default_analytics_database_path() -> PathBuf {
    PathBuf::from("./newsacquire-analytics.db")
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_interval_minutes() -> i64 {
    60
}

fn default_timeout_seconds() -> i64 {
    300
}

fn default_archive_base_path() -> PathBuf {
    PathBuf::from("./data/archives")
}

fn default_archive_batch_size() -> usize {
    DEFAULT_ARCHIVE_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

fn default_archive_hour() -> u32 {
    1
}

fn default_analysis_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_wait() -> u64 {
    3600
}

fn default_pipeline_days() -> i64 {
    1
}

impl Default for Settings {
    fn default() -> Self {
        // serde defaults double as the programmatic defaults
        toml::from_str("").expect("empty settings must deserialize")
    }
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults when the
    /// file is absent. Environment variables override secrets afterwards.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings: Settings = match path {
            Some(p) if p.exists() => {
                let raw = fs::read_to_string(p)?;
                toml::from_str(&raw)?
            }
            Some(p) => {
                anyhow::bail!("config file not found: {}", p.display());
            }
            None => {
                let default_path = Path::new("./newsacquire.toml");
                if default_path.exists() {
                    let raw = fs::read_to_string(default_path)?;
                    toml::from_str(&raw)?
                } else {
                    Settings::default()
                }
            }
        };

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                settings.openai_api_key = Some(key);
            }
        }
        if let Ok(db) = std::env::var("NEWSACQUIRE_DB") {
            if !db.is_empty() {
                settings.database_path = PathBuf::from(db);
            }
        }
        if let Ok(db) = std::env::var("NEWSACQUIRE_ANALYTICS_DB") {
            if !db.is_empty() {
                settings.analytics_database_path = PathBuf::from(db);
            }
        }

        Ok(settings)
    }

    /// Parse the scheduler timezone into a fixed offset. "UTC" and empty
    /// strings map to +00:00.
    pub fn scheduler_offset(&self) -> FixedOffset {
        parse_utc_offset(&self.scheduler_timezone)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
    }
}

/// Parse "+08:00" / "-05:30" / "UTC" into a fixed offset.
fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1i32, &raw[1..]),
        b'-' => (-1i32, &raw[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.archive_batch_size, 500);
        assert_eq!(settings.archive_compression, ArchiveCompression::Gzip);
        assert_eq!(settings.default_crawler_interval_minutes, 60);
        assert_eq!(settings.default_crawler_timeout_seconds, 300);
        assert_eq!(settings.auto_archive_hour, 1);
        assert_eq!(settings.pipeline_default_days, 1);
    }

    #[test]
    fn offset_parsing() {
        assert_eq!(parse_utc_offset("+08:00"), FixedOffset::east_opt(8 * 3600));
        assert_eq!(parse_utc_offset("UTC"), FixedOffset::east_opt(0));
        assert_eq!(
            parse_utc_offset("-05:30"),
            FixedOffset::east_opt(-(5 * 3600 + 30 * 60))
        );
        assert!(parse_utc_offset("Asia/Taipei").is_none());
    }
}
