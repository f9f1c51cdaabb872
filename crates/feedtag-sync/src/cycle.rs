//! One ingestion + classification pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use feedtag_adapters::Ingestor;
use feedtag_core::{BatchCounters, Entry, EntryId};
use feedtag_storage::EntryRepository;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::batch::{BatchRunner, RulePassReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Timer,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub trigger: CycleTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingested: usize,
    pub ingest_errors: Vec<String>,
    pub rule_pass: Option<RulePassReport>,
    pub batch: Option<BatchCounters>,
    pub errors: Vec<String>,
}

impl CycleReport {
    /// Short description of everything that went wrong, if anything did.
    pub fn error_summary(&self) -> Option<String> {
        let all = self
            .ingest_errors
            .iter()
            .chain(self.errors.iter())
            .cloned()
            .collect::<Vec<_>>();
        (!all.is_empty()).then(|| all.join("; "))
    }
}

pub struct CyclePipeline {
    ingestor: Arc<dyn Ingestor>,
    runner: Arc<BatchRunner>,
    batch_limit: usize,
    /// Entries the last rule pass could not write, retried by the next cycle.
    rule_retry: Mutex<Vec<EntryId>>,
}

impl CyclePipeline {
    pub fn new(ingestor: Arc<dyn Ingestor>, runner: Arc<BatchRunner>, batch_limit: usize) -> Self {
        Self {
            ingestor,
            runner,
            batch_limit,
            rule_retry: Mutex::new(Vec::new()),
        }
    }

    pub fn runner(&self) -> &Arc<BatchRunner> {
        &self.runner
    }

    /// Ingest, tag new entries by rule, then run one auto-tagging batch.
    ///
    /// Never fails: ingestion problems are recorded and classification still runs over whatever
    /// is stored.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> CycleReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id, ?trigger);
        self.run_cycle_inner(run_id, trigger).instrument(span).await
    }

    async fn run_cycle_inner(&self, run_id: Uuid, trigger: CycleTrigger) -> CycleReport {
        let started_at = Utc::now();
        let mut report = CycleReport {
            run_id,
            trigger,
            started_at,
            finished_at: started_at,
            ingested: 0,
            ingest_errors: Vec::new(),
            rule_pass: None,
            batch: None,
            errors: Vec::new(),
        };

        let mut new_entries = match self.ingestor.ingest().await {
            Ok(ingest) => {
                report.ingest_errors = ingest.feed_errors;
                ingest.inserted
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "ingestion failed; continuing with classification");
                report.ingest_errors.push(err.to_string());
                Vec::new()
            }
        };
        report.ingested = new_entries.len();
        let mut retry = self.take_rule_retries(&mut new_entries).await;

        match self.runner.run_rule_pass(&new_entries).await {
            Ok(pass) => {
                retry.extend(pass.failed_entries.iter().copied());
                report.rule_pass = Some(pass);
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "rule pass failed");
                report.errors.push(format!("rule pass: {err:#}"));
                retry.extend(new_entries.iter().map(|e| e.id));
            }
        }
        *self.rule_retry.lock().await = retry;

        match self.runner.run_batch(self.batch_limit).await {
            Ok(counters) => report.batch = Some(counters),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "auto tagging batch failed");
                report.errors.push(format!("auto tagging: {err:#}"));
            }
        }

        report.finished_at = Utc::now();
        info!(
            ingested = report.ingested,
            ingest_errors = report.ingest_errors.len(),
            errors = report.errors.len(),
            "cycle finished"
        );
        report
    }

    /// Append entries left over from the previous rule pass. Returns the ids that could not be
    /// reloaded, which stay queued.
    async fn take_rule_retries(&self, entries: &mut Vec<Entry>) -> Vec<EntryId> {
        let queued = std::mem::take(&mut *self.rule_retry.lock().await);
        let mut still_queued = Vec::new();
        for id in queued {
            if entries.iter().any(|e| e.id == id) {
                continue;
            }
            match self.runner.store().get_entry(id).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => debug!(entry_id = id, "queued entry no longer exists"),
                Err(err) => {
                    warn!(entry_id = id, error = %format!("{err:#}"), "could not reload queued entry");
                    still_queued.push(id);
                }
            }
        }
        still_queued
    }
}
