//! Repository contracts, store implementations and HTTP utilities for feedtag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedtag_core::{
    AnalysisStatus, Entry, EntryDraft, EntryId, EntryTag, Feed, FeedId, Tag, TagDraft, TagId,
    TagSource,
};

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RateLimit, RetryDisposition,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "feedtag-storage";

#[async_trait]
pub trait EntryRepository: Send + Sync {
    /// Insert or update a feed keyed by URL.
    async fn upsert_feed(&self, url: &str, title: &str, ai_tagging_enabled: bool)
        -> anyhow::Result<Feed>;

    async fn list_feeds(&self) -> anyhow::Result<Vec<Feed>>;

    /// Insert drafts whose guid is new for the feed. Returns only the rows actually inserted.
    async fn insert_entries(&self, feed_id: FeedId, drafts: &[EntryDraft])
        -> anyhow::Result<Vec<Entry>>;

    async fn get_entry(&self, entry_id: EntryId) -> anyhow::Result<Option<Entry>>;

    /// Entries whose feed has AI tagging on, inserted at or after `since`, still pending.
    /// Newest first (`inserted_at DESC, id DESC`), at most `limit` rows.
    async fn select_candidates(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Entry>>;
}

#[async_trait]
pub trait TagRepository: Send + Sync {
    /// Insert or update a tag keyed by name.
    async fn upsert_tag(&self, draft: &TagDraft) -> anyhow::Result<Tag>;

    async fn list_tags(&self) -> anyhow::Result<Vec<Tag>>;

    async fn list_ai_tags(&self) -> anyhow::Result<Vec<Tag>> {
        Ok(self
            .list_tags()
            .await?
            .into_iter()
            .filter(|t| t.ai_enabled)
            .collect())
    }

    async fn list_rule_tags(&self) -> anyhow::Result<Vec<Tag>> {
        Ok(self
            .list_tags()
            .await?
            .into_iter()
            .filter(|t| t.rule_enabled)
            .collect())
    }
}

#[async_trait]
pub trait EntryTagRepository: Send + Sync {
    /// Add associations. A pair that already exists keeps its original provenance, so automatic
    /// tagging never overwrites a manual tag. Returns the number of new pairs.
    async fn add_tags(
        &self,
        entry_id: EntryId,
        tag_ids: &[TagId],
        source: TagSource,
    ) -> anyhow::Result<usize>;

    /// Remove automatic associations only. Returns the number removed.
    async fn clear_auto_tags(&self, entry_id: EntryId) -> anyhow::Result<usize>;

    async fn tags_for_entry(&self, entry_id: EntryId) -> anyhow::Result<Vec<EntryTag>>;
}

#[async_trait]
pub trait AnalysisStatusRepository: Send + Sync {
    /// Absent records read as pending.
    async fn get_status(&self, entry_id: EntryId) -> anyhow::Result<AnalysisStatus>;

    /// Move to pending, leaving any previous version stamp untouched.
    async fn mark_pending(&self, entry_id: EntryId) -> anyhow::Result<()>;

    async fn mark_analyzed(&self, entry_id: EntryId, tags_version: i64) -> anyhow::Result<()>;

    /// Return analyzed entries stamped with a version older than `tags_version` to pending.
    async fn invalidate_older_than(&self, tags_version: i64) -> anyhow::Result<usize>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn auto_tagging_start_at(&self) -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Write the cutoff if unset. Returns the stored value, which is the earlier write when
    /// two callers race.
    async fn init_auto_tagging_start_at(&self, at: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>>;
}

/// Everything the classification pipeline reads and writes.
pub trait ClassificationStore:
    EntryRepository + TagRepository + EntryTagRepository + AnalysisStatusRepository + SettingsRepository
{
}

impl<T> ClassificationStore for T where
    T: EntryRepository
        + TagRepository
        + EntryTagRepository
        + AnalysisStatusRepository
        + SettingsRepository
{
}
