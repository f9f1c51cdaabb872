//! PostgreSQL-backed store.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedtag_core::{
    AnalysisState, AnalysisStatus, Entry, EntryDraft, EntryId, EntryTag, Feed, FeedId, Tag,
    TagDraft, TagId, TagSource,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use crate::{
    AnalysisStatusRepository, EntryRepository, EntryTagRepository, SettingsRepository,
    TagRepository,
};

const CUTOFF_KEY: &str = "auto_tagging_start_at";

const ENTRY_COLUMNS: &str =
    "e.id, e.feed_id, e.guid, e.title, e.url, e.summary, e.content, e.readability_content, e.inserted_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

fn feed_from_row(row: &PgRow) -> anyhow::Result<Feed> {
    Ok(Feed {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        ai_tagging_enabled: row.try_get("ai_tagging_enabled")?,
    })
}

fn entry_from_row(row: &PgRow) -> anyhow::Result<Entry> {
    Ok(Entry {
        id: row.try_get("id")?,
        feed_id: row.try_get("feed_id")?,
        guid: row.try_get("guid")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        summary: row.try_get("summary")?,
        content: row.try_get("content")?,
        readability_content: row.try_get("readability_content")?,
        inserted_at: row.try_get("inserted_at")?,
    })
}

fn tag_from_row(row: &PgRow) -> anyhow::Result<Tag> {
    Ok(Tag {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        match_rules: row.try_get("match_rules")?,
        rule_enabled: row.try_get("rule_enabled")?,
        ai_enabled: row.try_get("ai_enabled")?,
    })
}

#[async_trait]
impl EntryRepository for PgStore {
    async fn upsert_feed(
        &self,
        url: &str,
        title: &str,
        ai_tagging_enabled: bool,
    ) -> anyhow::Result<Feed> {
        let row = sqlx::query(
            r#"
            INSERT INTO feeds (url, title, ai_tagging_enabled)
            VALUES ($1, $2, $3)
            ON CONFLICT (url) DO UPDATE
               SET title = EXCLUDED.title,
                   ai_tagging_enabled = EXCLUDED.ai_tagging_enabled
            RETURNING id, url, title, ai_tagging_enabled
            "#,
        )
        .bind(url)
        .bind(title)
        .bind(ai_tagging_enabled)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting feed {url}"))?;
        feed_from_row(&row)
    }

    async fn list_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        let rows = sqlx::query("SELECT id, url, title, ai_tagging_enabled FROM feeds ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("listing feeds")?;
        rows.iter().map(feed_from_row).collect()
    }

    async fn insert_entries(
        &self,
        feed_id: FeedId,
        drafts: &[EntryDraft],
    ) -> anyhow::Result<Vec<Entry>> {
        let mut inserted = Vec::new();
        for draft in drafts {
            let row = sqlx::query(
                r#"
                INSERT INTO entries AS e
                       (feed_id, guid, title, url, summary, content, readability_content)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (feed_id, guid) DO NOTHING
                RETURNING e.id, e.feed_id, e.guid, e.title, e.url, e.summary, e.content,
                          e.readability_content, e.inserted_at
                "#,
            )
            .bind(feed_id)
            .bind(&draft.guid)
            .bind(&draft.title)
            .bind(&draft.url)
            .bind(&draft.summary)
            .bind(&draft.content)
            .bind(&draft.readability_content)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("inserting entry {} for feed {feed_id}", draft.guid))?;
            if let Some(row) = row {
                inserted.push(entry_from_row(&row)?);
            }
        }
        Ok(inserted)
    }

    async fn get_entry(&self, entry_id: EntryId) -> anyhow::Result<Option<Entry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.id = $1");
        let row = sqlx::query(&sql)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading entry {entry_id}"))?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn select_candidates(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<Entry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
              FROM entries e
              JOIN feeds f ON f.id = e.feed_id
              LEFT JOIN entry_analysis_status s ON s.entry_id = e.id
             WHERE f.ai_tagging_enabled
               AND e.inserted_at >= $1
               AND (s.status IS NULL OR s.status = 'pending')
             ORDER BY e.inserted_at DESC, e.id DESC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .context("selecting classification candidates")?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl TagRepository for PgStore {
    async fn upsert_tag(&self, draft: &TagDraft) -> anyhow::Result<Tag> {
        let row = sqlx::query(
            r#"
            INSERT INTO tags (name, description, match_rules, rule_enabled, ai_enabled)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name) DO UPDATE
               SET description = EXCLUDED.description,
                   match_rules = EXCLUDED.match_rules,
                   rule_enabled = EXCLUDED.rule_enabled,
                   ai_enabled = EXCLUDED.ai_enabled
            RETURNING id, name, description, match_rules, rule_enabled, ai_enabled
            "#,
        )
        .bind(&draft.name)
        .bind(&draft.description)
        .bind(&draft.match_rules)
        .bind(draft.rule_enabled)
        .bind(draft.ai_enabled)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting tag {}", draft.name))?;
        tag_from_row(&row)
    }

    async fn list_tags(&self) -> anyhow::Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT id, name, description, match_rules, rule_enabled, ai_enabled FROM tags ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing tags")?;
        rows.iter().map(tag_from_row).collect()
    }
}

#[async_trait]
impl EntryTagRepository for PgStore {
    async fn add_tags(
        &self,
        entry_id: EntryId,
        tag_ids: &[TagId],
        source: TagSource,
    ) -> anyhow::Result<usize> {
        if tag_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO entry_tags (entry_id, tag_id, source)
            SELECT $1, t, $3 FROM UNNEST($2::BIGINT[]) AS t
            ON CONFLICT (entry_id, tag_id) DO NOTHING
            "#,
        )
        .bind(entry_id)
        .bind(tag_ids)
        .bind(source.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("adding tags to entry {entry_id}"))?;
        Ok(result.rows_affected() as usize)
    }

    async fn clear_auto_tags(&self, entry_id: EntryId) -> anyhow::Result<usize> {
        let result = sqlx::query("DELETE FROM entry_tags WHERE entry_id = $1 AND source = 'auto'")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("clearing automatic tags of entry {entry_id}"))?;
        Ok(result.rows_affected() as usize)
    }

    async fn tags_for_entry(&self, entry_id: EntryId) -> anyhow::Result<Vec<EntryTag>> {
        let rows = sqlx::query(
            "SELECT entry_id, tag_id, source FROM entry_tags WHERE entry_id = $1 ORDER BY tag_id",
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading tags of entry {entry_id}"))?;
        rows.iter()
            .map(|row| {
                let source: String = row.try_get("source")?;
                Ok(EntryTag {
                    entry_id: row.try_get("entry_id")?,
                    tag_id: row.try_get("tag_id")?,
                    source: TagSource::parse(&source)
                        .ok_or_else(|| anyhow!("unknown tag source {source:?}"))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AnalysisStatusRepository for PgStore {
    async fn get_status(&self, entry_id: EntryId) -> anyhow::Result<AnalysisStatus> {
        let row = sqlx::query(
            "SELECT status, tags_version, updated_at FROM entry_analysis_status WHERE entry_id = $1",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading analysis status of entry {entry_id}"))?;
        let Some(row) = row else {
            return Ok(AnalysisStatus::pending(entry_id));
        };
        let status: String = row.try_get("status")?;
        Ok(AnalysisStatus {
            entry_id,
            status: AnalysisState::parse(&status)
                .ok_or_else(|| anyhow!("unknown analysis status {status:?}"))?,
            tags_version: row.try_get("tags_version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn mark_pending(&self, entry_id: EntryId) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entry_analysis_status (entry_id, status)
            VALUES ($1, 'pending')
            ON CONFLICT (entry_id) DO UPDATE
               SET status = 'pending', updated_at = now()
            "#,
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking entry {entry_id} pending"))?;
        Ok(())
    }

    async fn mark_analyzed(&self, entry_id: EntryId, tags_version: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entry_analysis_status (entry_id, status, tags_version)
            VALUES ($1, 'analyzed', $2)
            ON CONFLICT (entry_id) DO UPDATE
               SET status = 'analyzed', tags_version = EXCLUDED.tags_version, updated_at = now()
            "#,
        )
        .bind(entry_id)
        .bind(tags_version)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking entry {entry_id} analyzed"))?;
        Ok(())
    }

    async fn invalidate_older_than(&self, tags_version: i64) -> anyhow::Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE entry_analysis_status
               SET status = 'pending', updated_at = now()
             WHERE status = 'analyzed'
               AND (tags_version IS NULL OR tags_version < $1)
            "#,
        )
        .bind(tags_version)
        .execute(&self.pool)
        .await
        .context("invalidating stale analysis status")?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl SettingsRepository for PgStore {
    async fn auto_tagging_start_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = $1")
            .bind(CUTOFF_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("loading auto tagging cutoff")?;
        value
            .map(|v| {
                DateTime::parse_from_rfc3339(&v)
                    .map(|ts| ts.with_timezone(&Utc))
                    .with_context(|| format!("parsing stored cutoff {v:?}"))
            })
            .transpose()
    }

    async fn init_auto_tagging_start_at(
        &self,
        at: DateTime<Utc>,
    ) -> anyhow::Result<DateTime<Utc>> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
        )
        .bind(CUTOFF_KEY)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("initializing auto tagging cutoff")?;
        self.auto_tagging_start_at()
            .await?
            .ok_or_else(|| anyhow!("auto tagging cutoff missing after initialization"))
    }
}
