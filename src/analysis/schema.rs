//! Structured output contract for news analysis.
//!
//! The types mirror what the LLM must return; the JSON schema sent with
//! each batch request is derived from the same shape and post-processed to
//! satisfy strict mode (all objects closed, all properties required,
//! validation-only keywords stripped).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Neutral,
    Supportive,
    Critical,
    Sensational,
    Analytical,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Supportive => "supportive",
            Self::Critical => "critical",
            Self::Sensational => "sensational",
            Self::Analytical => "analytical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeType {
    Conflict,
    HumanInterest,
    Economic,
    Moral,
    Attribution,
    Procedural,
}

impl NarrativeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::HumanInterest => "human_interest",
            Self::Economic => "economic",
            Self::Moral => "moral",
            Self::Attribution => "attribution",
            Self::Procedural => "procedural",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Product,
    Concept,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Organization => "organization",
            Self::Location => "location",
            Self::Product => "product",
            Self::Concept => "concept",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRole {
    Subject,
    Object,
    Source,
    Mentioned,
}

impl EntityRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::Object => "object",
            Self::Source => "source",
            Self::Mentioned => "mentioned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Policy,
    Scandal,
    Legal,
    Election,
    Disaster,
    Protest,
    Business,
    International,
    Society,
    Entertainment,
    Sports,
    Technology,
    Health,
    Environment,
    Crime,
    Other,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Scandal => "scandal",
            Self::Legal => "legal",
            Self::Election => "election",
            Self::Disaster => "disaster",
            Self::Protest => "protest",
            Self::Business => "business",
            Self::International => "international",
            Self::Society => "society",
            Self::Entertainment => "entertainment",
            Self::Sports => "sports",
            Self::Technology => "technology",
            Self::Health => "health",
            Self::Environment => "environment",
            Self::Crime => "crime",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleType {
    Breaking,
    FirstReport,
    FollowUp,
    Retrospective,
    Analysis,
    Standard,
}

impl ArticleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Breaking => "breaking",
            Self::FirstReport => "first_report",
            Self::FollowUp => "follow_up",
            Self::Retrospective => "retrospective",
            Self::Analysis => "analysis",
            Self::Standard => "standard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRelationType {
    Supports,
    Opposes,
    MemberOf,
    Leads,
    AlliedWith,
    ConflictsWith,
    RelatedTo,
}

impl EntityRelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supports => "supports",
            Self::Opposes => "opposes",
            Self::MemberOf => "member_of",
            Self::Leads => "leads",
            Self::AlliedWith => "allied_with",
            Self::ConflictsWith => "conflicts_with",
            Self::RelatedTo => "related_to",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRelationType {
    AccusedIn,
    VictimIn,
    Investigates,
    CommentsOn,
    Causes,
    RespondsTo,
    InvolvedIn,
}

impl EventRelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccusedIn => "accused_in",
            Self::VictimIn => "victim_in",
            Self::Investigates => "investigates",
            Self::CommentsOn => "comments_on",
            Self::Causes => "causes",
            Self::RespondsTo => "responds_to",
            Self::InvolvedIn => "involved_in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Politics,
    Business,
    Technology,
    Entertainment,
    Sports,
    Society,
    International,
    Local,
    Opinion,
    Lifestyle,
    Health,
    Education,
    Environment,
    Crime,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Politics => "politics",
            Self::Business => "business",
            Self::Technology => "technology",
            Self::Entertainment => "entertainment",
            Self::Sports => "sports",
            Self::Society => "society",
            Self::International => "international",
            Self::Local => "local",
            Self::Opinion => "opinion",
            Self::Lifestyle => "lifestyle",
            Self::Health => "health",
            Self::Education => "education",
            Self::Environment => "environment",
            Self::Crime => "crime",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentiment {
    /// -10 (extremely negative) to +10 (extremely positive).
    pub polarity: i32,
    /// 1 (flat) to 10 (intense).
    pub intensity: i32,
    pub tone: Tone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Framing {
    pub angle: String,
    pub narrative_type: NarrativeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMention {
    pub name: String,
    pub name_normalized: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub role: EntityRole,
    /// The article's attitude toward this entity, -10 to +10.
    pub sentiment_toward: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMention {
    pub topic_normalized: String,
    pub name_normalized: String,
    #[serde(default)]
    pub sub_event_normalized: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub is_main: bool,
    /// YYYY-MM-DD, if the article pins the event in time.
    #[serde(default)]
    pub event_time: Option<String>,
    pub article_type: ArticleType,
    #[serde(default)]
    pub temporal_cues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelation {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: EntityRelationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRelation {
    pub entity: String,
    pub event: String,
    #[serde(rename = "type")]
    pub relation_type: EventRelationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signals {
    #[serde(default)]
    pub is_exclusive: bool,
    #[serde(default)]
    pub is_opinion: bool,
    #[serde(default)]
    pub has_update: bool,
    /// At most three key claims.
    #[serde(default)]
    pub key_claims: Vec<String>,
    /// 1 to 10.
    pub virality_score: i32,
}

/// Complete structured analysis of one article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsAnalysis {
    pub sentiment: Sentiment,
    pub framing: Framing,
    #[serde(default)]
    pub entities: Vec<EntityMention>,
    #[serde(default)]
    pub events: Vec<EventMention>,
    #[serde(default)]
    pub entity_relations: Vec<EntityRelation>,
    #[serde(default)]
    pub event_relations: Vec<EventRelation>,
    pub signals: Signals,
    pub category_normalized: Category,
}

impl NewsAnalysis {
    /// Parse and validate a raw LLM output string.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

// ── JSON schema ───────────────────────────────────────────────

/// Validation keywords strict mode does not support.
const UNSUPPORTED_KEYWORDS: &[&str] = &[
    "minLength",
    "maxLength",
    "pattern",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minItems",
    "maxItems",
    "uniqueItems",
    "format",
    "multipleOf",
    "default",
    "title",
];

/// The full analysis schema, with validation keywords the provider cannot
/// enforce still present. [`make_strict`] strips them before submission.
fn raw_schema() -> Value {
    let string_enum = |values: &[&str]| json!({ "type": "string", "enum": values });

    json!({
        "type": "object",
        "properties": {
            "sentiment": {
                "type": "object",
                "properties": {
                    "polarity": { "type": "integer", "minimum": -10, "maximum": 10 },
                    "intensity": { "type": "integer", "minimum": 1, "maximum": 10 },
                    "tone": string_enum(&["neutral", "supportive", "critical", "sensational", "analytical"]),
                }
            },
            "framing": {
                "type": "object",
                "properties": {
                    "angle": { "type": "string", "minLength": 2, "maxLength": 10 },
                    "narrative_type": string_enum(&["conflict", "human_interest", "economic", "moral", "attribution", "procedural"]),
                }
            },
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "name_normalized": { "type": "string" },
                        "type": string_enum(&["person", "organization", "location", "product", "concept"]),
                        "role": string_enum(&["subject", "object", "source", "mentioned"]),
                        "sentiment_toward": { "type": "integer", "minimum": -10, "maximum": 10 },
                    }
                }
            },
            "events": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "topic_normalized": { "type": "string", "minLength": 2, "maxLength": 12 },
                        "name_normalized": { "type": "string", "minLength": 3, "maxLength": 16 },
                        "sub_event_normalized": { "type": ["string", "null"] },
                        "tags": { "type": "array", "items": { "type": "string" } },
                        "type": string_enum(&[
                            "policy", "scandal", "legal", "election", "disaster", "protest",
                            "business", "international", "society", "entertainment", "sports",
                            "technology", "health", "environment", "crime", "other",
                        ]),
                        "is_main": { "type": "boolean" },
                        "event_time": { "type": ["string", "null"], "pattern": r"^\d{4}-\d{2}-\d{2}$" },
                        "article_type": string_enum(&[
                            "breaking", "first_report", "follow_up", "retrospective",
                            "analysis", "standard",
                        ]),
                        "temporal_cues": { "type": "array", "items": { "type": "string" } },
                    }
                }
            },
            "entity_relations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source": { "type": "string" },
                        "target": { "type": "string" },
                        "type": string_enum(&[
                            "supports", "opposes", "member_of", "leads", "allied_with",
                            "conflicts_with", "related_to",
                        ]),
                    }
                }
            },
            "event_relations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "entity": { "type": "string" },
                        "event": { "type": "string" },
                        "type": string_enum(&[
                            "accused_in", "victim_in", "investigates", "comments_on",
                            "causes", "responds_to", "involved_in",
                        ]),
                    }
                }
            },
            "signals": {
                "type": "object",
                "properties": {
                    "is_exclusive": { "type": "boolean" },
                    "is_opinion": { "type": "boolean" },
                    "has_update": { "type": "boolean" },
                    "key_claims": { "type": "array", "items": { "type": "string" }, "maxItems": 3 },
                    "virality_score": { "type": "integer", "minimum": 1, "maximum": 10 },
                }
            },
            "category_normalized": string_enum(&[
                "politics", "business", "technology", "entertainment", "sports",
                "society", "international", "local", "opinion", "lifestyle",
                "health", "education", "environment", "crime", "other",
            ]),
        }
    })
}

/// Recursively post-process a schema node for strict mode: strip
/// unsupported keywords, close every object, require every property.
pub fn make_strict(node: Value) -> Value {
    let Value::Object(map) = node else {
        return node;
    };

    let mut out = Map::new();
    for (key, value) in map {
        if UNSUPPORTED_KEYWORDS.contains(&key.as_str()) {
            continue;
        }
        out.insert(key, value);
    }

    if out.get("type").and_then(Value::as_str) == Some("object") {
        if let Some(Value::Object(properties)) = out.remove("properties") {
            let required: Vec<Value> = properties
                .keys()
                .map(|k| Value::String(k.clone()))
                .collect();
            let strict_props: Map<String, Value> = properties
                .into_iter()
                .map(|(k, v)| (k, make_strict(v)))
                .collect();
            out.insert("properties".to_string(), Value::Object(strict_props));
            out.insert("required".to_string(), Value::Array(required));
            out.insert("additionalProperties".to_string(), Value::Bool(false));
        }
    }

    if let Some(items) = out.remove("items") {
        out.insert("items".to_string(), make_strict(items));
    }
    if let Some(Value::Array(options)) = out.remove("anyOf") {
        out.insert(
            "anyOf".to_string(),
            Value::Array(options.into_iter().map(make_strict).collect()),
        );
    }
    if let Some(Value::Object(defs)) = out.remove("$defs") {
        out.insert(
            "$defs".to_string(),
            Value::Object(defs.into_iter().map(|(k, v)| (k, make_strict(v))).collect()),
        );
    }

    Value::Object(out)
}

/// The `response_format` object sent with every batch request.
pub fn response_format() -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "news_analysis",
            "strict": true,
            "schema": make_strict(raw_schema()),
        }
    })
}

#[cfg(test)]
pub(crate) fn sample_analysis_json() -> String {
    json!({
        "sentiment": { "polarity": -4, "intensity": 7, "tone": "critical" },
        "framing": { "angle": "司法爭議", "narrative_type": "conflict" },
        "entities": [
            {
                "name": "柯市長",
                "name_normalized": "柯文哲",
                "type": "person",
                "role": "subject",
                "sentiment_toward": -5
            },
            {
                "name": "民眾黨",
                "name_normalized": "台灣民眾黨",
                "type": "organization",
                "role": "mentioned",
                "sentiment_toward": -2
            }
        ],
        "events": [
            {
                "topic_normalized": "柯文哲司法案件",
                "name_normalized": "京華城案",
                "sub_event_normalized": "羈押庭",
                "tags": ["京華城", "羈押"],
                "type": "legal",
                "is_main": true,
                "event_time": "2025-06-01",
                "article_type": "follow_up",
                "temporal_cues": ["今日"]
            }
        ],
        "entity_relations": [
            { "source": "柯文哲", "target": "台灣民眾黨", "type": "leads" }
        ],
        "event_relations": [
            { "entity": "柯文哲", "event": "京華城案", "type": "accused_in" }
        ],
        "signals": {
            "is_exclusive": false,
            "is_opinion": false,
            "has_update": true,
            "key_claims": ["羈押庭今日開庭"],
            "virality_score": 8
        },
        "category_normalized": "politics"
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_output_parses() {
        let analysis = NewsAnalysis::from_json(&sample_analysis_json()).unwrap();
        assert_eq!(analysis.sentiment.tone, Tone::Critical);
        assert_eq!(analysis.entities.len(), 2);
        assert_eq!(analysis.entities[0].entity_type, EntityType::Person);
        assert_eq!(analysis.events[0].event_type, EventType::Legal);
        assert_eq!(analysis.category_normalized, Category::Politics);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        assert!(NewsAnalysis::from_json(r#"{"sentiment": {}}"#).is_err());
    }

    fn assert_strict(node: &Value) {
        if let Value::Object(map) = node {
            for keyword in UNSUPPORTED_KEYWORDS {
                assert!(!map.contains_key(*keyword), "found {keyword}");
            }
            if map.get("type").and_then(Value::as_str) == Some("object") {
                assert_eq!(map.get("additionalProperties"), Some(&Value::Bool(false)));
                let properties = map["properties"].as_object().unwrap();
                let required: Vec<&str> = map["required"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|v| v.as_str().unwrap())
                    .collect();
                for key in properties.keys() {
                    assert!(required.contains(&key.as_str()), "{key} not required");
                }
            }
            for value in map.values() {
                assert_strict(value);
            }
        } else if let Value::Array(items) = node {
            for item in items {
                assert_strict(item);
            }
        }
    }

    #[test]
    fn schema_satisfies_strict_mode() {
        let format = response_format();
        assert_eq!(format["json_schema"]["strict"], Value::Bool(true));
        assert_strict(&format["json_schema"]["schema"]);
    }

    #[test]
    fn strict_keeps_enums() {
        let schema = make_strict(raw_schema());
        let tones = &schema["properties"]["sentiment"]["properties"]["tone"]["enum"];
        assert_eq!(tones.as_array().unwrap().len(), 5);
    }
}
