//! Collaborator contracts for the pipeline: ingestion and AI classification.

use async_trait::async_trait;
use feedtag_core::{Entry, Tag, TagId};
use feedtag_storage::FetchError;
use serde::Serialize;
use thiserror::Error;

pub mod classifier;
pub mod fixtures;
pub mod text;

pub use classifier::{parse_tag_ids, OpenAiClassifier};
pub use fixtures::{load_feed_bundle, FeedBundle, FixtureIngestor};
pub use text::{html_to_text, truncate_chars};

pub const CRATE_NAME: &str = "feedtag-adapters";

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier is not configured")]
    NotConfigured,
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("malformed classifier response: {0}")]
    MalformedResponse(String),
}

/// Text handed to the classifier for one entry.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub title: &'a str,
    pub summary: &'a str,
    pub content: &'a str,
}

impl<'a> ClassifyInput<'a> {
    pub fn from_entry(entry: &'a Entry) -> Self {
        Self {
            title: &entry.title,
            summary: entry.summary_or_empty(),
            content: entry.body().unwrap_or_default(),
        }
    }
}

/// AI classifier. Timeouts, rate limits and unreadable output all surface as errors.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        input: ClassifyInput<'_>,
        tags: &[Tag],
    ) -> Result<Vec<TagId>, ClassifyError>;
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("feed {feed}: {message}")]
    Feed { feed: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub feeds_seen: usize,
    pub inserted: Vec<Entry>,
    /// Per-feed failures that did not stop the other feeds.
    pub feed_errors: Vec<String>,
}

/// Source of new entries. Implementations own their store handle.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest(&self) -> Result<IngestReport, IngestError>;
}

/// Ingestor that never produces anything.
#[derive(Debug, Default)]
pub struct NoopIngestor;

#[async_trait]
impl Ingestor for NoopIngestor {
    async fn ingest(&self) -> Result<IngestReport, IngestError> {
        Ok(IngestReport::default())
    }
}
