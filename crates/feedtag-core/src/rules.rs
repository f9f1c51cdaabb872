//! Keyword rule matching for tags.
//!
//! A tag's rule set is a JSON array of groups:
//! `[{"keywords": ["rust", "tokio"], "operator": "AND", "exclude": ["job"]}]`.
//! Groups are OR'd together. Matching is case-insensitive substring containment over the
//! entry title and summary. Parsing never fails outward: anything unreadable is "no rules".

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Entry, Tag, TagId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleOperator {
    And,
    #[default]
    Or,
}

impl RuleOperator {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AND" => Some(RuleOperator::And),
            "OR" => Some(RuleOperator::Or),
            _ => None,
        }
    }
}

/// One validated keyword test. `keywords` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub keywords: Vec<String>,
    pub operator: RuleOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRuleGroup {
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    exclude: Option<Vec<String>>,
}

fn normalize_keywords(words: Vec<String>) -> Vec<String> {
    words
        .into_iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

impl RuleGroup {
    fn from_raw(raw: RawRuleGroup) -> Option<Self> {
        let operator = match raw.operator.as_deref() {
            None => RuleOperator::default(),
            Some(op) => RuleOperator::parse(op)?,
        };
        let keywords = normalize_keywords(raw.keywords);
        if keywords.is_empty() {
            return None;
        }
        Some(Self {
            keywords,
            operator,
            exclude: normalize_keywords(raw.exclude.unwrap_or_default()),
        })
    }

    /// `lowered` must already be lowercased.
    fn matches_lowered(&self, lowered: &str) -> bool {
        if self.exclude.iter().any(|x| lowered.contains(x.as_str())) {
            return false;
        }
        match self.operator {
            RuleOperator::And => self.keywords.iter().all(|k| lowered.contains(k.as_str())),
            RuleOperator::Or => self.keywords.iter().any(|k| lowered.contains(k.as_str())),
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matches_lowered(&text.to_lowercase())
    }
}

/// Parse stored rule groups. Non-array input, bad JSON and invalid groups all drop out.
pub fn parse_rules(raw: Option<&str>) -> Vec<RuleGroup> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Vec::new();
    };
    let Ok(JsonValue::Array(items)) = serde_json::from_str::<JsonValue>(raw) else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawRuleGroup>(item).ok())
        .filter_map(RuleGroup::from_raw)
        .collect()
}

/// Title and summary joined by a single space. Body content is left to the AI path.
pub fn searchable_text(title: &str, summary: Option<&str>) -> String {
    match summary {
        Some(summary) => format!("{title} {summary}"),
        None => title.to_string(),
    }
}

/// True when any group matches. Blank text never matches.
pub fn matches_rules(text: &str, groups: &[RuleGroup]) -> bool {
    if text.trim().is_empty() || groups.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    groups.iter().any(|g| g.matches_lowered(&lowered))
}

pub fn matches(text: &str, tag: &Tag) -> bool {
    matches_rules(text, &parse_rules(tag.match_rules.as_deref()))
}

/// Tag ids of every rule-enabled tag whose rules match the entry, in input order.
pub fn run_rule_matching_for_entry(entry: &Entry, tags: &[Tag]) -> Vec<TagId> {
    let text = searchable_text(&entry.title, entry.summary.as_deref());
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    for tag in tags.iter().filter(|t| t.rule_enabled) {
        if matches(&text, tag) && !out.contains(&tag.id) {
            out.push(tag.id);
        }
    }
    out
}
