//! Auto-tagging batch runner and the rule-only tagging pass.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use feedtag_adapters::{ClassifyInput, Classifier};
use feedtag_core::{
    run_rule_matching_for_entry, AutoTaggingConfig, BatchCounters, Entry, EntryId, Tag, TagId,
    TagSource,
};
use feedtag_storage::ClassificationStore;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutoffState {
    /// The cutoff was unset and has just been written.
    JustInitialized(DateTime<Utc>),
    Existing(DateTime<Utc>),
}

impl CutoffState {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            CutoffState::JustInitialized(at) | CutoffState::Existing(at) => *at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RulePassReport {
    pub entries_seen: usize,
    pub entries_matched: usize,
    pub associations_added: usize,
    pub marked_analyzed: usize,
    /// Entries whose storage writes failed. Their tags may be partial.
    pub failed_entries: Vec<EntryId>,
}

pub struct BatchRunner {
    store: Arc<dyn ClassificationStore>,
    classifier: Arc<dyn Classifier>,
    config: AutoTaggingConfig,
}

impl BatchRunner {
    pub fn new(
        store: Arc<dyn ClassificationStore>,
        classifier: Arc<dyn Classifier>,
        config: AutoTaggingConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            config,
        }
    }

    pub fn config(&self) -> &AutoTaggingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ClassificationStore> {
        &self.store
    }

    /// Read the cutoff, writing "now" when it has never been set.
    pub async fn ensure_cutoff(&self) -> Result<CutoffState> {
        if let Some(at) = self.store.auto_tagging_start_at().await? {
            return Ok(CutoffState::Existing(at));
        }
        let now = Utc::now();
        let stored = self.store.init_auto_tagging_start_at(now).await?;
        if stored == now {
            Ok(CutoffState::JustInitialized(stored))
        } else {
            Ok(CutoffState::Existing(stored))
        }
    }

    pub async fn select_candidates(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Entry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.select_candidates(cutoff, limit).await
    }

    /// Classify up to `limit` pending entries, newest first, one at a time.
    pub async fn run_batch(&self, limit: usize) -> Result<BatchCounters> {
        let mut counters = BatchCounters::default();
        if !self.config.is_active() {
            debug!("auto tagging inactive; skipping batch");
            return Ok(counters);
        }

        let cutoff = match self.ensure_cutoff().await? {
            CutoffState::JustInitialized(at) => {
                info!(cutoff = %at, "auto tagging cutoff initialized; existing entries are excluded");
                return Ok(counters);
            }
            CutoffState::Existing(at) => at,
        };

        let ai_tags = self.store.list_ai_tags().await?;
        if ai_tags.is_empty() {
            debug!("no AI-enabled tags; skipping batch");
            return Ok(counters);
        }
        let rule_tags = self.store.list_rule_tags().await?;

        let candidates = self.select_candidates(cutoff, limit).await?;
        debug!(candidates = candidates.len(), %cutoff, "selected auto tagging candidates");

        for entry in &candidates {
            let span = info_span!("auto_tag_entry", entry_id = entry.id);
            match self
                .classify_entry(entry, &ai_tags, &rule_tags)
                .instrument(span)
                .await
            {
                Ok(ai_ids) => {
                    counters.processed += 1;
                    if ai_ids.is_empty() {
                        counters.untagged += 1;
                    } else {
                        counters.tagged += 1;
                    }
                }
                Err(err) => {
                    counters.failed += 1;
                    warn!(entry_id = entry.id, error = %format!("{err:#}"), "auto tagging failed; entry stays pending");
                    if let Err(err) = self.store.mark_pending(entry.id).await {
                        warn!(entry_id = entry.id, error = %format!("{err:#}"), "could not mark entry pending");
                    }
                }
            }
        }

        info!(
            processed = counters.processed,
            tagged = counters.tagged,
            untagged = counters.untagged,
            failed = counters.failed,
            "auto tagging batch finished"
        );
        Ok(counters)
    }

    /// Returns the classifier's tag ids. Applied associations also include rule matches.
    async fn classify_entry(
        &self,
        entry: &Entry,
        ai_tags: &[Tag],
        rule_tags: &[Tag],
    ) -> Result<Vec<TagId>> {
        let ai_ids = self
            .classifier
            .classify(ClassifyInput::from_entry(entry), ai_tags)
            .await?;

        let mut tag_ids = run_rule_matching_for_entry(entry, rule_tags);
        for id in &ai_ids {
            if !tag_ids.contains(id) {
                tag_ids.push(*id);
            }
        }

        self.store.clear_auto_tags(entry.id).await?;
        if !tag_ids.is_empty() {
            self.store
                .add_tags(entry.id, &tag_ids, TagSource::Auto)
                .await?;
        }
        self.store
            .mark_analyzed(entry.id, self.config.tags_version)
            .await?;
        Ok(ai_ids)
    }

    /// Apply rule-enabled tags to freshly ingested entries.
    ///
    /// When the AI path is inactive this pass is the entry's classification and it is marked
    /// analyzed. Otherwise the entry stays pending for the next batch. A failed entry does not
    /// stop the pass; it is listed in `failed_entries`.
    pub async fn run_rule_pass(&self, entries: &[Entry]) -> Result<RulePassReport> {
        let mut report = RulePassReport {
            entries_seen: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let rule_tags = self.store.list_rule_tags().await?;
        let finalize = !self.config.is_active();

        for entry in entries {
            let tag_ids = run_rule_matching_for_entry(entry, &rule_tags);
            match self.apply_rule_tags(entry.id, &tag_ids, finalize).await {
                Ok(added) => {
                    if !tag_ids.is_empty() {
                        report.entries_matched += 1;
                        report.associations_added += added;
                    }
                    if finalize {
                        report.marked_analyzed += 1;
                    }
                }
                Err(err) => {
                    warn!(entry_id = entry.id, error = %format!("{err:#}"), "rule tagging failed");
                    report.failed_entries.push(entry.id);
                }
            }
        }

        debug!(
            seen = report.entries_seen,
            matched = report.entries_matched,
            added = report.associations_added,
            failed = report.failed_entries.len(),
            "rule pass finished"
        );
        Ok(report)
    }

    async fn apply_rule_tags(
        &self,
        entry_id: EntryId,
        tag_ids: &[TagId],
        finalize: bool,
    ) -> Result<usize> {
        let added = if tag_ids.is_empty() {
            0
        } else {
            self.store.add_tags(entry_id, tag_ids, TagSource::Auto).await?
        };
        if finalize {
            self.store
                .mark_analyzed(entry_id, self.config.tags_version)
                .await?;
        }
        Ok(added)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use feedtag_adapters::ClassifyError;
    use feedtag_core::{
        AnalysisState, AnalysisStatus, ClassifierSettings, EntryDraft, EntryTag, Feed, FeedId,
        TagDraft,
    };
    use feedtag_storage::{
        AnalysisStatusRepository, EntryRepository, EntryTagRepository, MemoryStore,
        SettingsRepository, TagRepository,
    };
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Returns tags whose name appears in the title. Titles containing "boom" fail.
    #[derive(Default)]
    pub(crate) struct ScriptedClassifier {
        pub calls: Mutex<Vec<String>>,
        pub fail_titles: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(
            &self,
            input: ClassifyInput<'_>,
            tags: &[Tag],
        ) -> Result<Vec<TagId>, ClassifyError> {
            self.calls.lock().unwrap().push(input.title.to_string());
            if input.title.contains("boom") || self.fail_titles.lock().unwrap().contains(input.title)
            {
                return Err(ClassifyError::MalformedResponse("scripted failure".into()));
            }
            let title = input.title.to_lowercase();
            Ok(tags
                .iter()
                .filter(|t| title.contains(&t.name.to_lowercase()))
                .map(|t| t.id)
                .collect())
        }
    }

    pub(crate) fn active_config() -> AutoTaggingConfig {
        AutoTaggingConfig {
            enabled: true,
            classifier: ClassifierSettings {
                api_base: Some("https://llm.example.com/v1".into()),
                api_key: Some("sk-test".into()),
                model: Some("test-model".into()),
            },
            tags_version: 4,
        }
    }

    pub(crate) fn draft(guid: &str, title: &str) -> EntryDraft {
        EntryDraft {
            guid: guid.into(),
            title: title.into(),
            url: None,
            summary: None,
            content: Some("<p>body</p>".into()),
            readability_content: None,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        classifier: Arc<ScriptedClassifier>,
        runner: BatchRunner,
        feed_id: i64,
    }

    async fn fixture(config: AutoTaggingConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let classifier = Arc::new(ScriptedClassifier::default());
        let feed = store
            .upsert_feed("https://news.example.com/rss", "News", true)
            .await
            .unwrap();
        for name in ["rust", "postgres"] {
            store
                .upsert_tag(&TagDraft {
                    name: name.into(),
                    ai_enabled: true,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let runner = BatchRunner::new(store.clone(), classifier.clone(), config);
        Fixture {
            store,
            classifier,
            runner,
            feed_id: feed.id,
        }
    }

    impl Fixture {
        /// Run the first batch to establish the cutoff, then return it.
        async fn establish_cutoff(&self) -> DateTime<Utc> {
            let counters = self.runner.run_batch(10).await.unwrap();
            assert!(counters.is_empty());
            self.store.auto_tagging_start_at().await.unwrap().unwrap()
        }

        async fn add(&self, guid: &str, title: &str, at: DateTime<Utc>) -> Entry {
            self.store
                .insert_entry_at(self.feed_id, &draft(guid, title), at)
                .await
                .unwrap()
                .unwrap()
        }

        async fn tag_set(&self, entry_id: i64) -> Vec<EntryTag> {
            self.store.tags_for_entry(entry_id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn inactive_config_does_nothing() {
        let mut config = active_config();
        config.classifier.api_key = None;
        let fx = fixture(config).await;
        let counters = fx.runner.run_batch(10).await.unwrap();
        assert!(counters.is_empty());
        assert_eq!(fx.store.auto_tagging_start_at().await.unwrap(), None);
        assert!(fx.classifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_batch_sets_cutoff_and_never_touches_backlog() {
        let fx = fixture(active_config()).await;
        let history = fx.add("old", "rust history", Utc::now() - Duration::days(3)).await;

        let cutoff = fx.establish_cutoff().await;
        assert!(matches!(
            fx.runner.ensure_cutoff().await.unwrap(),
            CutoffState::Existing(at) if at == cutoff
        ));

        let fresh = fx.add("new", "rust news", cutoff + Duration::seconds(1)).await;
        let counters = fx.runner.run_batch(10).await.unwrap();
        assert_eq!(
            counters,
            BatchCounters {
                processed: 1,
                tagged: 1,
                untagged: 0,
                failed: 0
            }
        );
        assert!(fx.store.get_status(history.id).await.unwrap().is_pending());
        assert!(fx.tag_set(history.id).await.is_empty());
        let status = fx.store.get_status(fresh.id).await.unwrap();
        assert_eq!(status.status, AnalysisState::Analyzed);
        assert_eq!(status.tags_version, Some(4));
    }

    #[tokio::test]
    async fn rerun_is_idempotent_and_keeps_manual_tags() {
        let fx = fixture(active_config()).await;
        let cutoff = fx.establish_cutoff().await;
        let entry = fx
            .add("e1", "rust meets postgres", cutoff + Duration::seconds(1))
            .await;
        fx.store
            .add_tags(entry.id, &[1], TagSource::Manual)
            .await
            .unwrap();

        fx.runner.run_batch(10).await.unwrap();
        let after_first = fx.tag_set(entry.id).await;

        fx.store.mark_pending(entry.id).await.unwrap();
        let counters = fx.runner.run_batch(10).await.unwrap();
        assert_eq!(counters.processed, 1);
        let after_second = fx.tag_set(entry.id).await;

        assert_eq!(after_first, after_second);
        assert_eq!(
            after_second,
            vec![
                EntryTag {
                    entry_id: entry.id,
                    tag_id: 1,
                    source: TagSource::Manual
                },
                EntryTag {
                    entry_id: entry.id,
                    tag_id: 2,
                    source: TagSource::Auto
                },
            ]
        );
        assert!(!fx.store.get_status(entry.id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn failures_are_isolated_and_retried_next_batch() {
        let fx = fixture(active_config()).await;
        let cutoff = fx.establish_cutoff().await;
        let ok = fx.add("a", "rust ok", cutoff + Duration::seconds(1)).await;
        let bad = fx.add("b", "boom rust", cutoff + Duration::seconds(2)).await;
        let none = fx.add("c", "gardening", cutoff + Duration::seconds(3)).await;

        let counters = fx.runner.run_batch(10).await.unwrap();
        assert_eq!(
            counters,
            BatchCounters {
                processed: 2,
                tagged: 1,
                untagged: 1,
                failed: 1
            }
        );
        assert!(fx.store.get_status(bad.id).await.unwrap().is_pending());
        assert!(!fx.store.get_status(ok.id).await.unwrap().is_pending());
        assert!(!fx.store.get_status(none.id).await.unwrap().is_pending());
        assert!(fx.tag_set(none.id).await.is_empty());

        let retry = fx.runner.select_candidates(cutoff, 10).await.unwrap();
        assert_eq!(retry.iter().map(|e| e.id).collect::<Vec<_>>(), vec![bad.id]);
        let counters = fx.runner.run_batch(10).await.unwrap();
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.processed, 0);
    }

    #[tokio::test]
    async fn limit_takes_most_recent_candidates() {
        let fx = fixture(active_config()).await;
        let cutoff = fx.establish_cutoff().await;
        let mut ids = Vec::new();
        for i in 0..50 {
            let e = fx
                .add(&format!("g{i}"), &format!("item {i}"), cutoff + Duration::seconds(i + 1))
                .await;
            ids.push(e.id);
        }

        let counters = fx.runner.run_batch(20).await.unwrap();
        assert_eq!(counters.processed, 20);
        let calls = fx.classifier.calls.lock().unwrap().clone();
        let expected = (30..50).rev().map(|i| format!("item {i}")).collect::<Vec<_>>();
        assert_eq!(calls, expected);
        for id in &ids[..30] {
            assert!(fx.store.get_status(*id).await.unwrap().is_pending());
        }
    }

    #[tokio::test]
    async fn no_ai_tags_means_no_work() {
        let store = Arc::new(MemoryStore::new());
        let classifier = Arc::new(ScriptedClassifier::default());
        let runner = BatchRunner::new(store.clone(), classifier.clone(), active_config());
        store
            .init_auto_tagging_start_at(Utc::now() - Duration::days(1))
            .await
            .unwrap();
        let feed = store.upsert_feed("https://x/rss", "X", true).await.unwrap();
        store
            .insert_entries(feed.id, &[draft("a", "rust")])
            .await
            .unwrap();

        assert!(runner.run_batch(5).await.unwrap().is_empty());
        assert!(classifier.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rule_matches_survive_ai_classification() {
        let fx = fixture(active_config()).await;
        let rule_tag = fx
            .store
            .upsert_tag(&TagDraft {
                name: "weekly".into(),
                match_rules: Some(r#"[{"keywords":["this week"],"operator":"OR"}]"#.into()),
                rule_enabled: true,
                ai_enabled: false,
                ..Default::default()
            })
            .await
            .unwrap();
        let cutoff = fx.establish_cutoff().await;
        let entry = fx
            .add("w", "This week in Rust", cutoff + Duration::seconds(1))
            .await;

        let pass = fx.runner.run_rule_pass(&[entry.clone()]).await.unwrap();
        assert_eq!(pass.entries_matched, 1);
        assert_eq!(pass.marked_analyzed, 0);
        assert!(fx.store.get_status(entry.id).await.unwrap().is_pending());

        fx.runner.run_batch(10).await.unwrap();
        let tag_ids = fx
            .tag_set(entry.id)
            .await
            .into_iter()
            .map(|t| t.tag_id)
            .collect::<Vec<_>>();
        assert_eq!(tag_ids, vec![1, rule_tag.id]);
    }

    #[tokio::test]
    async fn rule_only_pass_finalizes_when_ai_is_off() {
        let fx = fixture(AutoTaggingConfig::default()).await;
        fx.store
            .upsert_tag(&TagDraft {
                name: "db".into(),
                match_rules: Some(r#"[{"keywords":["postgres","index"],"operator":"AND"}]"#.into()),
                rule_enabled: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let a = fx.add("a", "Postgres index internals", Utc::now()).await;
        let b = fx.add("b", "Postgres vacuum", Utc::now()).await;

        let report = fx.runner.run_rule_pass(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(report.entries_matched, 1);
        assert_eq!(report.associations_added, 1);
        assert_eq!(report.marked_analyzed, 2);
        assert_eq!(fx.tag_set(a.id).await.len(), 1);
        assert!(fx.tag_set(b.id).await.is_empty());
        assert_eq!(
            fx.store.get_status(b.id).await.unwrap().tags_version,
            Some(AutoTaggingConfig::default().tags_version)
        );
    }

    /// Memory store whose tag and status writes fail for chosen entries.
    #[derive(Default)]
    pub(crate) struct FailingWrites {
        pub inner: MemoryStore,
        pub fail_for: Mutex<HashSet<EntryId>>,
    }

    impl FailingWrites {
        fn check(&self, entry_id: EntryId) -> Result<()> {
            if self.fail_for.lock().unwrap().contains(&entry_id) {
                anyhow::bail!("write rejected for entry {entry_id}");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EntryRepository for FailingWrites {
        async fn upsert_feed(&self, url: &str, title: &str, ai: bool) -> Result<Feed> {
            self.inner.upsert_feed(url, title, ai).await
        }
        async fn list_feeds(&self) -> Result<Vec<Feed>> {
            self.inner.list_feeds().await
        }
        async fn insert_entries(&self, feed_id: FeedId, drafts: &[EntryDraft]) -> Result<Vec<Entry>> {
            self.inner.insert_entries(feed_id, drafts).await
        }
        async fn get_entry(&self, entry_id: EntryId) -> Result<Option<Entry>> {
            self.inner.get_entry(entry_id).await
        }
        async fn select_candidates(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Entry>> {
            self.inner.select_candidates(since, limit).await
        }
    }

    #[async_trait]
    impl TagRepository for FailingWrites {
        async fn upsert_tag(&self, draft: &TagDraft) -> Result<Tag> {
            self.inner.upsert_tag(draft).await
        }
        async fn list_tags(&self) -> Result<Vec<Tag>> {
            self.inner.list_tags().await
        }
    }

    #[async_trait]
    impl EntryTagRepository for FailingWrites {
        async fn add_tags(&self, entry_id: EntryId, tag_ids: &[TagId], source: TagSource) -> Result<usize> {
            self.check(entry_id)?;
            self.inner.add_tags(entry_id, tag_ids, source).await
        }
        async fn clear_auto_tags(&self, entry_id: EntryId) -> Result<usize> {
            self.inner.clear_auto_tags(entry_id).await
        }
        async fn tags_for_entry(&self, entry_id: EntryId) -> Result<Vec<EntryTag>> {
            self.inner.tags_for_entry(entry_id).await
        }
    }

    #[async_trait]
    impl AnalysisStatusRepository for FailingWrites {
        async fn get_status(&self, entry_id: EntryId) -> Result<AnalysisStatus> {
            self.inner.get_status(entry_id).await
        }
        async fn mark_pending(&self, entry_id: EntryId) -> Result<()> {
            self.inner.mark_pending(entry_id).await
        }
        async fn mark_analyzed(&self, entry_id: EntryId, tags_version: i64) -> Result<()> {
            self.check(entry_id)?;
            self.inner.mark_analyzed(entry_id, tags_version).await
        }
        async fn invalidate_older_than(&self, tags_version: i64) -> Result<usize> {
            self.inner.invalidate_older_than(tags_version).await
        }
    }

    #[async_trait]
    impl SettingsRepository for FailingWrites {
        async fn auto_tagging_start_at(&self) -> Result<Option<DateTime<Utc>>> {
            self.inner.auto_tagging_start_at().await
        }
        async fn init_auto_tagging_start_at(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
            self.inner.init_auto_tagging_start_at(at).await
        }
    }

    pub(crate) async fn seed_rule_tag(store: &dyn TagRepository) -> Tag {
        store
            .upsert_tag(&TagDraft {
                name: "rust".into(),
                match_rules: Some(r#"[{"keywords":["rust"]}]"#.into()),
                rule_enabled: true,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rule_pass_continues_past_a_failing_entry() {
        let store = Arc::new(FailingWrites::default());
        let tag = seed_rule_tag(store.as_ref()).await;
        let feed = store.upsert_feed("https://x/rss", "X", true).await.unwrap();
        let entries = store
            .insert_entries(
                feed.id,
                &[draft("1", "rust one"), draft("2", "rust two"), draft("3", "gardening")],
            )
            .await
            .unwrap();
        store.fail_for.lock().unwrap().insert(entries[0].id);

        let runner = BatchRunner::new(
            store.clone(),
            Arc::new(ScriptedClassifier::default()),
            AutoTaggingConfig::default(),
        );
        let report = runner.run_rule_pass(&entries).await.unwrap();

        assert_eq!(report.failed_entries, vec![entries[0].id]);
        assert_eq!(report.entries_matched, 1);
        assert_eq!(report.marked_analyzed, 2);
        assert!(store.get_status(entries[0].id).await.unwrap().is_pending());
        for entry in &entries[1..] {
            assert!(!store.get_status(entry.id).await.unwrap().is_pending());
        }
        let second = store.tags_for_entry(entries[1].id).await.unwrap();
        assert_eq!(second.iter().map(|t| t.tag_id).collect::<Vec<_>>(), vec![tag.id]);
    }
}
