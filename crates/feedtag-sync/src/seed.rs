//! YAML tag seed file.
//!
//! ```yaml
//! version: 1
//! tags:
//!   - name: rust
//!     description: The Rust programming language
//!     rules:
//!       - keywords: [rust, cargo]
//!         operator: OR
//!         exclude: [game]
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use feedtag_core::{parse_rules, Tag, TagDraft};
use feedtag_storage::TagRepository;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct TagSeedFile {
    pub version: u32,
    #[serde(default)]
    pub tags: Vec<TagSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagSeed {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub ai_enabled: bool,
    /// Defaults to true whenever `rules` is non-empty.
    #[serde(default)]
    pub rule_enabled: Option<bool>,
    #[serde(default)]
    pub rules: Vec<JsonValue>,
}

fn default_true() -> bool {
    true
}

impl TagSeed {
    pub fn to_draft(&self) -> Result<TagDraft> {
        let match_rules = if self.rules.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&self.rules)
                    .with_context(|| format!("serializing rules of tag {}", self.name))?,
            )
        };
        Ok(TagDraft {
            name: self.name.trim().to_string(),
            description: self.description.clone(),
            rule_enabled: self.rule_enabled.unwrap_or(!self.rules.is_empty()),
            ai_enabled: self.ai_enabled,
            match_rules,
        })
    }
}

pub fn load_tag_seed_file(path: impl AsRef<Path>) -> Result<TagSeedFile> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Upsert every seeded tag by name. Tags whose rule groups are all invalid are still stored,
/// with a warning, since they will simply never match.
pub async fn seed_tags<S>(store: &S, file: &TagSeedFile) -> Result<Vec<Tag>>
where
    S: TagRepository + ?Sized,
{
    let mut out = Vec::with_capacity(file.tags.len());
    for seed in &file.tags {
        let draft = seed.to_draft()?;
        if !seed.rules.is_empty() && parse_rules(draft.match_rules.as_deref()).is_empty() {
            warn!(tag = %draft.name, "tag has rules but none are valid");
        }
        out.push(store.upsert_tag(&draft).await?);
    }
    info!(tags = out.len(), "seeded tags");
    Ok(out)
}
