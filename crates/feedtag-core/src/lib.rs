//! Core domain model for the feedtag classification pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod rules;

pub use rules::{
    matches, matches_rules, parse_rules, run_rule_matching_for_entry, searchable_text, RuleGroup,
    RuleOperator,
};

pub const CRATE_NAME: &str = "feedtag-core";

pub type FeedId = i64;
pub type EntryId = i64;
pub type TagId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: FeedId,
    pub title: String,
    pub url: String,
    pub ai_tagging_enabled: bool,
}

/// Feed item handed from ingestion to storage before it has an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub guid: String,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub readability_content: Option<String>,
}

/// Persisted feed item, the unit of classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub feed_id: FeedId,
    pub guid: String,
    pub title: String,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub readability_content: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

impl Entry {
    /// Body text for AI matching. Readability output wins over the raw feed content.
    pub fn body(&self) -> Option<&str> {
        [self.readability_content.as_deref(), self.content.as_deref()]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
    }

    pub fn summary_or_empty(&self) -> &str {
        self.summary.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub description: Option<String>,
    /// Serialized rule groups, parsed defensively by [`rules::parse_rules`].
    pub match_rules: Option<String>,
    pub rule_enabled: bool,
    pub ai_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TagDraft {
    pub name: String,
    pub description: Option<String>,
    pub match_rules: Option<String>,
    pub rule_enabled: bool,
    pub ai_enabled: bool,
}

/// Provenance of an entry/tag association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSource {
    Manual,
    Auto,
}

impl TagSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagSource::Manual => "manual",
            TagSource::Auto => "auto",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(TagSource::Manual),
            "auto" => Some(TagSource::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryTag {
    pub entry_id: EntryId,
    pub tag_id: TagId,
    pub source: TagSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisState {
    #[default]
    Pending,
    Analyzed,
}

impl AnalysisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisState::Pending => "pending",
            AnalysisState::Analyzed => "analyzed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(AnalysisState::Pending),
            "analyzed" => Some(AnalysisState::Analyzed),
            _ => None,
        }
    }
}

/// Per-entry analysis record. A missing record reads as [`AnalysisStatus::pending`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStatus {
    pub entry_id: EntryId,
    pub status: AnalysisState,
    pub tags_version: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AnalysisStatus {
    pub fn pending(entry_id: EntryId) -> Self {
        Self {
            entry_id,
            status: AnalysisState::Pending,
            tags_version: None,
            updated_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == AnalysisState::Pending
    }
}

/// Endpoint and credentials for the AI classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClassifierSettings {
    pub api_base: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl ClassifierSettings {
    pub fn is_configured(&self) -> bool {
        [&self.api_base, &self.api_key, &self.model]
            .iter()
            .all(|v| v.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }
}

/// Auto-tagging settings handed to the batch runner and scheduler at construction.
///
/// The `auto_tagging_start_at` cutoff is not part of this value: it is written once by the
/// runner and therefore lives behind the settings repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTaggingConfig {
    pub enabled: bool,
    pub classifier: ClassifierSettings,
    pub tags_version: i64,
}

impl Default for AutoTaggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            classifier: ClassifierSettings::default(),
            tags_version: 1,
        }
    }
}

impl AutoTaggingConfig {
    /// True when the AI path can actually run.
    pub fn is_active(&self) -> bool {
        self.enabled && self.classifier.is_configured()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchCounters {
    pub processed: usize,
    pub tagged: usize,
    pub untagged: usize,
    pub failed: usize,
}

impl BatchCounters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
