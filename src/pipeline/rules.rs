//! Rule-based article filtering.
//!
//! Rules are evaluated in registration order; the first match decides
//! FILTER. Force-included articles short-circuit before any rule runs.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::warn;

use super::Result;
use crate::models::{
    Article, CategoryRuleConfig, FilterDecision, FilterRule, KeywordRuleConfig, MatchField,
    PatternRuleConfig, RuleConfig, Stage,
};
use crate::repository::{NewFilterResult, Store};

/// Outcome of evaluating one article.
#[derive(Debug, Clone)]
pub struct RuleEvaluation {
    pub decision: FilterDecision,
    pub rule_name: Option<String>,
    pub reason: Option<String>,
}

/// Default rule set seeded at startup if absent.
pub fn default_rules() -> Vec<(&'static str, &'static str, RuleConfig)> {
    vec![
        (
            "horoscope_filter",
            "過濾星座運勢、塔羅牌、占卜相關內容",
            RuleConfig::Keyword(KeywordRuleConfig {
                keywords: [
                    "星座運勢", "每日星座", "星座運程", "本週星座",
                    "塔羅", "占卜", "運勢分析", "星座解析",
                    "牡羊座", "金牛座", "雙子座", "巨蟹座",
                    "獅子座", "處女座", "天秤座", "天蠍座",
                    "射手座", "摩羯座", "水瓶座", "雙魚座",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                match_fields: vec![MatchField::Title, MatchField::Tags],
            }),
        ),
        (
            "lottery_filter",
            "過濾彩券開獎、樂透號碼相關內容",
            RuleConfig::Pattern(PatternRuleConfig {
                patterns: [
                    r"威力彩.*開獎",
                    r"大樂透.*開獎",
                    r"今彩539.*開獎",
                    r"雙贏彩.*開獎",
                    r"開獎號碼",
                    r"中獎號碼",
                    r"頭獎.*億",
                    r"\d+期.*開獎",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                match_fields: vec![MatchField::Title],
                exclude_keywords: Vec::new(),
            }),
        ),
        (
            "ad_filter",
            "過濾廣告、業配相關內容",
            RuleConfig::Keyword(KeywordRuleConfig {
                keywords: [
                    "[廣告]", "【廣告】", "廣編特輯", "業配文",
                    "贊助內容", "贊助文章", "合作專案",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                match_fields: vec![MatchField::Title],
            }),
        ),
        (
            "weather_routine_filter",
            "過濾例行天氣預報（保留極端天氣）",
            RuleConfig::Pattern(PatternRuleConfig {
                patterns: [r"(明日|今日|週末)天氣", r"一週天氣", r"天氣預報"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                match_fields: vec![MatchField::Title],
                exclude_keywords: [
                    "颱風", "暴雨", "豪雨", "水災", "地震",
                    "極端", "警報", "停班停課", "災情",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            }),
        ),
    ]
}

/// Evaluates active filter rules against articles for one run.
///
/// The force-include id set is cached per instance; the cache lives for
/// one pipeline run or one filter operation.
pub struct RuleFilterService {
    store: Store,
    force_include_ids: Option<HashSet<i64>>,
    compiled_patterns: HashMap<i64, Vec<Regex>>,
}

impl RuleFilterService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            force_include_ids: None,
            compiled_patterns: HashMap::new(),
        }
    }

    /// Seed the default rules if absent.
    pub fn ensure_default_rules(&self) -> crate::repository::Result<usize> {
        self.store.pipeline().ensure_rules(&default_rules())
    }

    fn force_include_ids(&mut self) -> crate::repository::Result<&HashSet<i64>> {
        if self.force_include_ids.is_none() {
            self.force_include_ids = Some(self.store.pipeline().force_include_ids()?);
        }
        Ok(self.force_include_ids.as_ref().unwrap())
    }

    /// Apply force-include and every active rule to one article.
    pub fn filter_article(&mut self, article: &Article) -> Result<RuleEvaluation> {
        if self.force_include_ids()?.contains(&article.id) {
            return Ok(RuleEvaluation {
                decision: FilterDecision::ForceInclude,
                rule_name: Some("force_include".to_string()),
                reason: Some("文章已被標記為強制納入".to_string()),
            });
        }

        let rules = self.store.pipeline().active_rules()?;
        for rule in &rules {
            if self.rule_matches(rule, article)? {
                self.store.pipeline().increment_rule_filtered(rule.id)?;
                return Ok(RuleEvaluation {
                    decision: FilterDecision::Filter,
                    rule_name: Some(rule.name.clone()),
                    reason: Some(rule.description.clone()),
                });
            }
        }

        Ok(RuleEvaluation {
            decision: FilterDecision::Keep,
            rule_name: None,
            reason: Some("通過所有規則檢查".to_string()),
        })
    }

    /// Filter a batch, producing passed articles and one result row each.
    pub fn filter_batch(
        &mut self,
        articles: &[Article],
        run_id: i64,
    ) -> Result<(Vec<Article>, Vec<NewFilterResult>)> {
        let mut passed = Vec::new();
        let mut results = Vec::new();

        for article in articles {
            let evaluation = self.filter_article(article)?;
            results.push(NewFilterResult {
                run_id,
                article_id: article.id,
                stage: Stage::RuleFilter,
                decision: evaluation.decision,
                confidence: None,
                rule_name: evaluation.rule_name,
                reason: evaluation.reason,
            });
            if evaluation.decision.passes() {
                passed.push(article.clone());
            }
        }

        Ok((passed, results))
    }

    fn rule_matches(&mut self, rule: &FilterRule, article: &Article) -> Result<bool> {
        match &rule.config {
            RuleConfig::Keyword(config) => Ok(keyword_matches(config, article)),
            RuleConfig::Pattern(config) => {
                let patterns = self.compiled(rule, config)?;
                Ok(pattern_matches(config, &patterns, article))
            }
            RuleConfig::Category(config) => Ok(category_matches(config, article)),
        }
    }

    /// Case-insensitive regexes, compiled once per rule per instance.
    fn compiled(&mut self, rule: &FilterRule, config: &PatternRuleConfig) -> Result<Vec<Regex>> {
        if let Some(compiled) = self.compiled_patterns.get(&rule.id) {
            return Ok(compiled.clone());
        }
        let mut compiled = Vec::with_capacity(config.patterns.len());
        for pattern in &config.patterns {
            match Regex::new(&format!("(?i){pattern}")) {
                Ok(regex) => compiled.push(regex),
                Err(e) => {
                    warn!(rule = %rule.name, pattern = %pattern, error = %e, "Skipping bad pattern");
                }
            }
        }
        self.compiled_patterns.insert(rule.id, compiled.clone());
        Ok(compiled)
    }
}

/// String form of an article field for matching.
fn field_value(article: &Article, field: MatchField) -> String {
    match field {
        MatchField::Title => article.title.clone(),
        MatchField::Tags => article.tag_list().join(" "),
        MatchField::Category => article.category.clone().unwrap_or_default(),
        MatchField::SubCategory => article.sub_category.clone().unwrap_or_default(),
        MatchField::Summary => article.summary.clone().unwrap_or_default(),
        MatchField::Content => article.content.clone(),
    }
}

fn keyword_matches(config: &KeywordRuleConfig, article: &Article) -> bool {
    for field in &config.match_fields {
        let value = field_value(article, *field);
        if config.keywords.iter().any(|k| value.contains(k.as_str())) {
            return true;
        }
    }
    false
}

/// Exclude keywords are evaluated first: any hit vetoes the rule so the
/// newsworthy variant of a routine topic survives.
fn pattern_matches(config: &PatternRuleConfig, patterns: &[Regex], article: &Article) -> bool {
    for field in &config.match_fields {
        let value = field_value(article, *field);
        if config
            .exclude_keywords
            .iter()
            .any(|k| value.contains(k.as_str()))
        {
            return false;
        }
    }
    for field in &config.match_fields {
        let value = field_value(article, *field);
        if patterns.iter().any(|p| p.is_match(&value)) {
            return true;
        }
    }
    false
}

fn category_matches(config: &CategoryRuleConfig, article: &Article) -> bool {
    if let Some(category) = &article.category {
        if config.categories.contains(category) {
            return true;
        }
    }
    if let Some(sub_category) = &article.sub_category {
        if config.sub_categories.contains(sub_category) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::compute_url_hash;
    use chrono::Utc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Store, RuleFilterService) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let service = RuleFilterService::new(store.clone());
        service.ensure_default_rules().unwrap();
        (dir, store, service)
    }

    fn article_titled(store: &Store, title: &str) -> Article {
        let url = format!("https://example.com/{}", compute_url_hash(title));
        let mut article = Article {
            id: 0,
            url_hash: compute_url_hash(&url),
            url,
            title: title.to_string(),
            content: "內文".to_string(),
            summary: None,
            author: None,
            source: "UDN".to_string(),
            crawler_name: "udn_article".to_string(),
            category: None,
            sub_category: None,
            tags: None,
            published_at: Some(Utc::now()),
            crawled_at: Utc::now(),
            raw_html: None,
            images: None,
        };
        article.id = store.articles().insert(&article).unwrap();
        article
    }

    #[test]
    fn horoscope_is_filtered_unless_force_included() {
        let (_dir, store, mut service) = setup();
        let article = article_titled(&store, "今日運勢 - 獅子座");

        let evaluation = service.filter_article(&article).unwrap();
        assert_eq!(evaluation.decision, FilterDecision::Filter);
        assert_eq!(evaluation.rule_name.as_deref(), Some("horoscope_filter"));

        // Matching rule counted
        let stats = store.pipeline().rule_stats().unwrap();
        let horoscope = stats
            .iter()
            .find(|s| s.rule_name == "horoscope_filter")
            .unwrap();
        assert_eq!(horoscope.total_filtered_count, 1);

        // Force include overrides every rule; fresh instance (the id cache
        // is per instance)
        store
            .pipeline()
            .add_force_include(article.id, "editor pick", None)
            .unwrap();
        let mut service = RuleFilterService::new(store.clone());
        let evaluation = service.filter_article(&article).unwrap();
        assert_eq!(evaluation.decision, FilterDecision::ForceInclude);
        assert_eq!(evaluation.rule_name.as_deref(), Some("force_include"));
    }

    #[test]
    fn exclude_keywords_protect_newsworthy_weather() {
        let (_dir, store, mut service) = setup();

        let routine = article_titled(&store, "明日天氣預報：各地多雲");
        let evaluation = service.filter_article(&routine).unwrap();
        assert_eq!(evaluation.decision, FilterDecision::Filter);
        assert_eq!(
            evaluation.rule_name.as_deref(),
            Some("weather_routine_filter")
        );

        // Typhoon coverage matches the pattern but the exclude keyword
        // always wins: decision is KEEP
        let typhoon = article_titled(&store, "颱風來襲 明日天氣預報曝光");
        let evaluation = service.filter_article(&typhoon).unwrap();
        assert_eq!(evaluation.decision, FilterDecision::Keep);
    }

    #[test]
    fn lottery_pattern_matches() {
        let (_dir, store, mut service) = setup();
        let lottery = article_titled(&store, "大樂透第114000045期開獎");
        let evaluation = service.filter_article(&lottery).unwrap();
        assert_eq!(evaluation.decision, FilterDecision::Filter);
        assert_eq!(evaluation.rule_name.as_deref(), Some("lottery_filter"));
    }

    #[test]
    fn keyword_rule_reads_tags() {
        let (_dir, store, mut service) = setup();
        let mut article = article_titled(&store, "藝人分享生活");
        article.tags = Some(r#"["星座運勢","娛樂"]"#.to_string());

        let evaluation = service.filter_article(&article).unwrap();
        assert_eq!(evaluation.decision, FilterDecision::Filter);
        assert_eq!(evaluation.rule_name.as_deref(), Some("horoscope_filter"));
    }

    #[test]
    fn category_rule() {
        let (_dir, store, mut service) = setup();
        store
            .pipeline()
            .ensure_rules(&[(
                "sports_filter",
                "過濾體育新聞",
                RuleConfig::Category(CategoryRuleConfig {
                    categories: vec!["體育".to_string()],
                    sub_categories: vec!["棒球".to_string()],
                }),
            )])
            .unwrap();

        let mut article = article_titled(&store, "比賽結果");
        article.category = Some("體育".to_string());
        let evaluation = service.filter_article(&article).unwrap();
        assert_eq!(evaluation.decision, FilterDecision::Filter);

        let mut article = article_titled(&store, "另一場比賽");
        article.category = Some("生活".to_string());
        article.sub_category = Some("棒球".to_string());
        let evaluation = service.filter_article(&article).unwrap();
        assert_eq!(evaluation.decision, FilterDecision::Filter);
    }

    #[test]
    fn batch_splits_passed_and_results() {
        let (_dir, store, mut service) = setup();
        let keep = article_titled(&store, "立法院三讀通過預算案");
        let filter = article_titled(&store, "【廣告】最新優惠");

        let (passed, results) = service
            .filter_batch(&[keep.clone(), filter], 1)
            .unwrap();
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].id, keep.id);
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r.stage, Stage::RuleFilter)));
    }

    #[test]
    fn default_rules_seed_once() {
        let (_dir, store, service) = setup();
        assert_eq!(service.ensure_default_rules().unwrap(), 0);
        assert_eq!(store.pipeline().all_rules().unwrap().len(), 4);
    }
}
