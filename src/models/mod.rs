//! Data models for NewsAcquire.

mod archive;
mod article;
mod crawler;
mod pipeline;
mod queue;
mod reparse;
mod tracking;

pub use archive::{ArchiveRecord, ArchiveStatus};
pub use article::{compute_url_hash, parse_string_list, serialize_string_list, Article};
pub use crawler::{CrawlerConfig, CrawlerKind, CrawlerRunStatus};
pub use pipeline::{
    AnalysisResult, CategoryRuleConfig, FilterDecision, FilterResult, FilterRule, ForceInclude,
    KeywordRuleConfig, MatchField, PatternRuleConfig, PipelineRun, RuleConfig, RunStatus, Stage,
};
pub use queue::{PendingUrl, UrlStatus};
pub use reparse::{ReparseJob, ReparseStatus};
pub use tracking::{AnalysisStatus, AnalysisTracking};

/// Maximum stored length for error logs, in bytes.
pub const ERROR_LOG_MAX_BYTES: usize = 4096;

/// Truncate a string to at most `max` bytes on a char boundary.
pub fn truncate_error(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut end = max;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "錯誤".repeat(3000);
        let truncated = truncate_error(&s, ERROR_LOG_MAX_BYTES);
        assert!(truncated.len() <= ERROR_LOG_MAX_BYTES);
        assert!(truncated.chars().all(|c| c == '錯' || c == '誤'));
    }

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate_error("ok", 4096), "ok");
    }
}
