//! Directory-backed ingestion of feed bundles.
//!
//! Each `*.json` file in the directory holds one feed and its items:
//! `{"feed": {"url": "...", "title": "...", "ai_tagging_enabled": true}, "items": [...]}`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use feedtag_core::EntryDraft;
use feedtag_storage::EntryRepository;
use serde::Deserialize;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{IngestError, IngestReport, Ingestor};

#[derive(Debug, Clone, Deserialize)]
pub struct FeedBundle {
    pub feed: BundleFeed,
    #[serde(default)]
    pub items: Vec<BundleItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleFeed {
    pub url: String,
    pub title: String,
    #[serde(default = "default_true")]
    pub ai_tagging_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundleItem {
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
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

fn default_true() -> bool {
    true
}

impl BundleItem {
    /// Items without a guid get a stable one derived from feed URL, link and title.
    pub fn guid_for(&self, feed_url: &str) -> String {
        if let Some(guid) = self.guid.as_deref().filter(|g| !g.trim().is_empty()) {
            return guid.to_string();
        }
        let source = format!(
            "{}:{}:{}",
            feed_url,
            self.url.as_deref().unwrap_or_default(),
            self.title
        );
        Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes()).to_string()
    }

    fn to_draft(&self, feed_url: &str) -> EntryDraft {
        EntryDraft {
            guid: self.guid_for(feed_url),
            title: self.title.trim().to_string(),
            url: self.url.clone(),
            summary: self.summary.clone(),
            content: self.content.clone(),
            readability_content: self.readability_content.clone(),
        }
    }
}

pub async fn load_feed_bundle(path: impl AsRef<Path>) -> Result<FeedBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub struct FixtureIngestor {
    dir: PathBuf,
    store: Arc<dyn EntryRepository>,
}

impl FixtureIngestor {
    pub fn new(dir: impl Into<PathBuf>, store: Arc<dyn EntryRepository>) -> Self {
        Self {
            dir: dir.into(),
            store,
        }
    }

    async fn bundle_paths(&self) -> Result<Vec<PathBuf>> {
        let mut read_dir = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn ingest_bundle(&self, path: &Path) -> Result<Vec<feedtag_core::Entry>> {
        let bundle = load_feed_bundle(path).await?;
        let feed = self
            .store
            .upsert_feed(
                &bundle.feed.url,
                &bundle.feed.title,
                bundle.feed.ai_tagging_enabled,
            )
            .await?;
        let drafts = bundle
            .items
            .iter()
            .map(|item| item.to_draft(&feed.url))
            .collect::<Vec<_>>();
        self.store.insert_entries(feed.id, &drafts).await
    }
}

#[async_trait]
impl Ingestor for FixtureIngestor {
    async fn ingest(&self) -> Result<IngestReport, IngestError> {
        let paths = self.bundle_paths().await?;
        let mut report = IngestReport {
            feeds_seen: paths.len(),
            ..Default::default()
        };

        for path in &paths {
            match self.ingest_bundle(path).await {
                Ok(inserted) => {
                    info!(bundle = %path.display(), inserted = inserted.len(), "ingested feed bundle");
                    report.inserted.extend(inserted);
                }
                Err(err) => {
                    let err = IngestError::Feed {
                        feed: path.display().to_string(),
                        message: format!("{err:#}"),
                    };
                    warn!(error = %format!("{err:#}"), "feed bundle ingestion failed");
                    report.feed_errors.push(err.to_string());
                }
            }
        }

        Ok(report)
    }
}
