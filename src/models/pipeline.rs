//! Pipeline run, filter rule and filter result models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    RuleFilter,
    LlmAnalysis,
    Store,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::RuleFilter => "rule_filter",
            Self::LlmAnalysis => "llm_analysis",
            Self::Store => "store",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(Self::Fetch),
            "rule_filter" => Some(Self::RuleFilter),
            "llm_analysis" => Some(Self::LlmAnalysis),
            "store" => Some(Self::Store),
            _ => None,
        }
    }

    /// Stages from `self` (inclusive) to the end of the pipeline.
    pub fn and_later(&self) -> Vec<Stage> {
        [Self::Fetch, Self::RuleFilter, Self::LlmAnalysis, Self::Store]
            .into_iter()
            .filter(|s| s >= self)
            .collect()
    }
}

/// One end-to-end pipeline invocation over an article window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: i64,
    pub name: String,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub total_articles: i64,
    pub rule_filtered_count: i64,
    pub rule_passed_count: i64,
    pub analyzed_count: i64,
    pub force_included_count: i64,
    /// Opaque handle from the batch provider, persisted at submit time so a
    /// crashed or paused run can resume polling the same batch.
    pub batch_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_log: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-article filter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDecision {
    Keep,
    Filter,
    ForceInclude,
}

impl FilterDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Filter => "filter",
            Self::ForceInclude => "force_include",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "keep" => Some(Self::Keep),
            "filter" => Some(Self::Filter),
            "force_include" => Some(Self::ForceInclude),
            _ => None,
        }
    }

    /// Whether an article with this decision continues to the next stage.
    pub fn passes(&self) -> bool {
        matches!(self, Self::Keep | Self::ForceInclude)
    }
}

/// Per-article per-stage decision row. Append-only; deleted only by an
/// explicit reset of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub id: i64,
    pub run_id: i64,
    pub article_id: i64,
    pub stage: Stage,
    pub decision: FilterDecision,
    pub confidence: Option<f64>,
    pub rule_name: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Article fields a rule may match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Title,
    Tags,
    Category,
    SubCategory,
    Summary,
    Content,
}

/// Payload for keyword rules: substring match over the selected fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRuleConfig {
    pub keywords: Vec<String>,
    pub match_fields: Vec<MatchField>,
}

/// Payload for pattern rules: case-insensitive regex search, with
/// exclude-keywords evaluated first to protect newsworthy matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRuleConfig {
    pub patterns: Vec<String>,
    pub match_fields: Vec<MatchField>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
}

/// Payload for category rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRuleConfig {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub sub_categories: Vec<String>,
}

/// Typed rule configuration, stored as JSON alongside a `rule_type` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleConfig {
    Keyword(KeywordRuleConfig),
    Pattern(PatternRuleConfig),
    Category(CategoryRuleConfig),
}

impl RuleConfig {
    pub fn rule_type(&self) -> &'static str {
        match self {
            Self::Keyword(_) => "keyword",
            Self::Pattern(_) => "pattern",
            Self::Category(_) => "category",
        }
    }

    /// Deserialize a config payload according to its stored rule type.
    pub fn from_parts(rule_type: &str, config_json: &str) -> Option<Self> {
        match rule_type {
            "keyword" => serde_json::from_str(config_json).ok().map(Self::Keyword),
            "pattern" => serde_json::from_str(config_json).ok().map(Self::Pattern),
            "category" => serde_json::from_str(config_json).ok().map(Self::Category),
            _ => None,
        }
    }
}

/// A configurable filter predicate, seeded at startup and hand-editable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub is_active: bool,
    pub config: RuleConfig,
    pub total_filtered_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-run per-article analysis artifact, written after the LLM stage.
/// Deleted only by an explicit reset of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: i64,
    pub run_id: i64,
    pub article_id: i64,
    pub success: bool,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Operator override forcing an article past all rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceInclude {
    pub id: i64,
    pub article_id: i64,
    pub reason: String,
    pub added_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ordering_and_tail() {
        assert!(Stage::Fetch < Stage::RuleFilter);
        assert_eq!(
            Stage::LlmAnalysis.and_later(),
            vec![Stage::LlmAnalysis, Stage::Store]
        );
        assert_eq!(Stage::Fetch.and_later().len(), 4);
    }

    #[test]
    fn rule_config_round_trips_by_type() {
        let config = RuleConfig::Pattern(PatternRuleConfig {
            patterns: vec!["天氣預報".to_string()],
            match_fields: vec![MatchField::Title],
            exclude_keywords: vec!["颱風".to_string()],
        });
        let json = serde_json::to_string(&config).unwrap();
        let parsed = RuleConfig::from_parts("pattern", &json).unwrap();
        match parsed {
            RuleConfig::Pattern(p) => assert_eq!(p.exclude_keywords, vec!["颱風"]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn keyword_config_missing_excludes_is_fine() {
        let json = r#"{"keywords":["廣告"],"match_fields":["title","tags"]}"#;
        assert!(RuleConfig::from_parts("keyword", json).is_some());
        assert!(RuleConfig::from_parts("nonsense", json).is_none());
    }
}
