//! In-process store used by tests and by the CLI when no database is configured.

use std::collections::BTreeMap;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedtag_core::{
    AnalysisState, AnalysisStatus, Entry, EntryDraft, EntryId, EntryTag, Feed, FeedId, Tag,
    TagDraft, TagId, TagSource,
};
use tokio::sync::Mutex;

use crate::{
    AnalysisStatusRepository, EntryRepository, EntryTagRepository, SettingsRepository,
    TagRepository,
};

#[derive(Debug, Default)]
struct MemoryState {
    next_feed_id: FeedId,
    next_entry_id: EntryId,
    next_tag_id: TagId,
    feeds: BTreeMap<FeedId, Feed>,
    entries: BTreeMap<EntryId, Entry>,
    tags: BTreeMap<TagId, Tag>,
    entry_tags: BTreeMap<(EntryId, TagId), TagSource>,
    statuses: BTreeMap<EntryId, AnalysisStatus>,
    auto_tagging_start_at: Option<DateTime<Utc>>,
}

impl MemoryState {
    fn insert_entry(
        &mut self,
        feed_id: FeedId,
        draft: &EntryDraft,
        inserted_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<Entry>> {
        if !self.feeds.contains_key(&feed_id) {
            bail!("unknown feed {feed_id}");
        }
        let duplicate = self
            .entries
            .values()
            .any(|e| e.feed_id == feed_id && e.guid == draft.guid);
        if duplicate {
            return Ok(None);
        }
        self.next_entry_id += 1;
        let entry = Entry {
            id: self.next_entry_id,
            feed_id,
            guid: draft.guid.clone(),
            title: draft.title.clone(),
            url: draft.url.clone(),
            summary: draft.summary.clone(),
            content: draft.content.clone(),
            readability_content: draft.readability_content.clone(),
            inserted_at,
        };
        self.entries.insert(entry.id, entry.clone());
        Ok(Some(entry))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one entry with an explicit insertion time, for backfills and tests.
    pub async fn insert_entry_at(
        &self,
        feed_id: FeedId,
        draft: &EntryDraft,
        inserted_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<Entry>> {
        self.state.lock().await.insert_entry(feed_id, draft, inserted_at)
    }

    pub async fn set_feed_ai_tagging(&self, feed_id: FeedId, enabled: bool) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some(feed) = state.feeds.get_mut(&feed_id) else {
            bail!("unknown feed {feed_id}");
        };
        feed.ai_tagging_enabled = enabled;
        Ok(())
    }

    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }
}

#[async_trait]
impl EntryRepository for MemoryStore {
    async fn upsert_feed(
        &self,
        url: &str,
        title: &str,
        ai_tagging_enabled: bool,
    ) -> anyhow::Result<Feed> {
        let mut state = self.state.lock().await;
        if let Some(feed) = state.feeds.values_mut().find(|f| f.url == url) {
            feed.title = title.to_string();
            feed.ai_tagging_enabled = ai_tagging_enabled;
            return Ok(feed.clone());
        }
        state.next_feed_id += 1;
        let feed = Feed {
            id: state.next_feed_id,
            title: title.to_string(),
            url: url.to_string(),
            ai_tagging_enabled,
        };
        state.feeds.insert(feed.id, feed.clone());
        Ok(feed)
    }

    async fn list_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        Ok(self.state.lock().await.feeds.values().cloned().collect())
    }

    async fn insert_entries(
        &self,
        feed_id: FeedId,
        drafts: &[EntryDraft],
    ) -> anyhow::Result<Vec<Entry>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut inserted = Vec::new();
        for draft in drafts {
            if let Some(entry) = state.insert_entry(feed_id, draft, now)? {
                inserted.push(entry);
            }
        }
        Ok(inserted)
    }

    async fn get_entry(&self, entry_id: EntryId) -> anyhow::Result<Option<Entry>> {
        Ok(self.state.lock().await.entries.get(&entry_id).cloned())
    }

    async fn select_candidates(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Entry>> {
        let state = self.state.lock().await;
        let mut out = state
            .entries
            .values()
            .filter(|e| {
                state
                    .feeds
                    .get(&e.feed_id)
                    .is_some_and(|f| f.ai_tagging_enabled)
            })
            .filter(|e| e.inserted_at >= since)
            .filter(|e| {
                state
                    .statuses
                    .get(&e.id)
                    .map_or(true, AnalysisStatus::is_pending)
            })
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.inserted_at.cmp(&a.inserted_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }
}

#[async_trait]
impl TagRepository for MemoryStore {
    async fn upsert_tag(&self, draft: &TagDraft) -> anyhow::Result<Tag> {
        let mut state = self.state.lock().await;
        if let Some(tag) = state.tags.values_mut().find(|t| t.name == draft.name) {
            tag.description = draft.description.clone();
            tag.match_rules = draft.match_rules.clone();
            tag.rule_enabled = draft.rule_enabled;
            tag.ai_enabled = draft.ai_enabled;
            return Ok(tag.clone());
        }
        state.next_tag_id += 1;
        let tag = Tag {
            id: state.next_tag_id,
            name: draft.name.clone(),
            description: draft.description.clone(),
            match_rules: draft.match_rules.clone(),
            rule_enabled: draft.rule_enabled,
            ai_enabled: draft.ai_enabled,
        };
        state.tags.insert(tag.id, tag.clone());
        Ok(tag)
    }

    async fn list_tags(&self) -> anyhow::Result<Vec<Tag>> {
        Ok(self.state.lock().await.tags.values().cloned().collect())
    }
}

#[async_trait]
impl EntryTagRepository for MemoryStore {
    async fn add_tags(
        &self,
        entry_id: EntryId,
        tag_ids: &[TagId],
        source: TagSource,
    ) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for tag_id in tag_ids {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                state.entry_tags.entry((entry_id, *tag_id))
            {
                slot.insert(source);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn clear_auto_tags(&self, entry_id: EntryId) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.entry_tags.len();
        state
            .entry_tags
            .retain(|(e, _), source| *e != entry_id || *source != TagSource::Auto);
        Ok(before - state.entry_tags.len())
    }

    async fn tags_for_entry(&self, entry_id: EntryId) -> anyhow::Result<Vec<EntryTag>> {
        let state = self.state.lock().await;
        Ok(state
            .entry_tags
            .range((entry_id, TagId::MIN)..=(entry_id, TagId::MAX))
            .map(|((entry_id, tag_id), source)| EntryTag {
                entry_id: *entry_id,
                tag_id: *tag_id,
                source: *source,
            })
            .collect())
    }
}

#[async_trait]
impl AnalysisStatusRepository for MemoryStore {
    async fn get_status(&self, entry_id: EntryId) -> anyhow::Result<AnalysisStatus> {
        let state = self.state.lock().await;
        Ok(state
            .statuses
            .get(&entry_id)
            .cloned()
            .unwrap_or_else(|| AnalysisStatus::pending(entry_id)))
    }

    async fn mark_pending(&self, entry_id: EntryId) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let status = state
            .statuses
            .entry(entry_id)
            .or_insert_with(|| AnalysisStatus::pending(entry_id));
        status.status = AnalysisState::Pending;
        status.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_analyzed(&self, entry_id: EntryId, tags_version: i64) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.statuses.insert(
            entry_id,
            AnalysisStatus {
                entry_id,
                status: AnalysisState::Analyzed,
                tags_version: Some(tags_version),
                updated_at: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn invalidate_older_than(&self, tags_version: i64) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut changed = 0;
        for status in state.statuses.values_mut() {
            let stale = status.tags_version.map_or(true, |v| v < tags_version);
            if status.status == AnalysisState::Analyzed && stale {
                status.status = AnalysisState::Pending;
                status.updated_at = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl SettingsRepository for MemoryStore {
    async fn auto_tagging_start_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.auto_tagging_start_at)
    }

    async fn init_auto_tagging_start_at(
        &self,
        at: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        let mut state = self.state.lock().await;
        Ok(*state.auto_tagging_start_at.get_or_insert(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft(guid: &str) -> EntryDraft {
        EntryDraft {
            guid: guid.to_string(),
            title: format!("title {guid}"),
            url: None,
            summary: None,
            content: None,
            readability_content: None,
        }
    }

    #[tokio::test]
    async fn duplicate_guids_are_not_reinserted() {
        let store = MemoryStore::new();
        let feed = store
            .upsert_feed("https://example.com/feed.xml", "Example", true)
            .await
            .unwrap();
        let first = store
            .insert_entries(feed.id, &[draft("a"), draft("b")])
            .await
            .unwrap();
        let second = store
            .insert_entries(feed.id, &[draft("b"), draft("c")])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].guid, "c");
        assert_eq!(store.entry_count().await, 3);
    }

    #[tokio::test]
    async fn auto_tags_never_replace_manual_tags() {
        let store = MemoryStore::new();
        store.add_tags(1, &[10], TagSource::Manual).await.unwrap();
        let added = store.add_tags(1, &[10, 11], TagSource::Auto).await.unwrap();
        assert_eq!(added, 1);

        let removed = store.clear_auto_tags(1).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = store.tags_for_entry(1).await.unwrap();
        assert_eq!(
            remaining,
            vec![EntryTag {
                entry_id: 1,
                tag_id: 10,
                source: TagSource::Manual
            }]
        );
    }

    #[tokio::test]
    async fn candidates_follow_feed_flag_cutoff_and_status() {
        let store = MemoryStore::new();
        let on = store.upsert_feed("https://a/feed", "A", true).await.unwrap();
        let off = store.upsert_feed("https://b/feed", "B", false).await.unwrap();
        let cutoff = Utc::now();

        let old = store
            .insert_entry_at(on.id, &draft("old"), cutoff - Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        let at_cutoff = store
            .insert_entry_at(on.id, &draft("edge"), cutoff)
            .await
            .unwrap()
            .unwrap();
        let done = store
            .insert_entry_at(on.id, &draft("done"), cutoff + Duration::seconds(1))
            .await
            .unwrap()
            .unwrap();
        let fresh = store
            .insert_entry_at(on.id, &draft("fresh"), cutoff + Duration::seconds(2))
            .await
            .unwrap()
            .unwrap();
        store
            .insert_entry_at(off.id, &draft("muted"), cutoff + Duration::seconds(3))
            .await
            .unwrap();
        store.mark_analyzed(done.id, 1).await.unwrap();

        let ids = store
            .select_candidates(cutoff, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![fresh.id, at_cutoff.id]);
        assert!(!ids.contains(&old.id));
    }

    #[tokio::test]
    async fn pending_keeps_previous_version_and_invalidation_is_explicit() {
        let store = MemoryStore::new();
        store.mark_analyzed(1, 2).await.unwrap();
        store.mark_analyzed(2, 3).await.unwrap();
        store.mark_analyzed(3, 1).await.unwrap();
        store.mark_pending(3).await.unwrap();

        let status = store.get_status(3).await.unwrap();
        assert!(status.is_pending());
        assert_eq!(status.tags_version, Some(1));
        assert!(store.get_status(99).await.unwrap().is_pending());

        assert_eq!(store.invalidate_older_than(3).await.unwrap(), 1);
        assert!(store.get_status(1).await.unwrap().is_pending());
        assert!(!store.get_status(2).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn cutoff_is_written_once() {
        let store = MemoryStore::new();
        assert_eq!(store.auto_tagging_start_at().await.unwrap(), None);
        let first = Utc::now();
        let stored = store.init_auto_tagging_start_at(first).await.unwrap();
        let again = store
            .init_auto_tagging_start_at(first + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stored, first);
        assert_eq!(again, first);
    }
}
