//! Periodic cycle scheduler with start/stop/trigger controls.
//!
//! Timer ticks and manual triggers share one guard, so at most one cycle runs at a time. A tick
//! that arrives while a cycle is in flight is dropped. Cycles run on their own task, so a caller
//! that gives up waiting does not cut one short. `stop` only prevents future ticks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::cycle::{CyclePipeline, CycleReport, CycleTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    Completed(Box<CycleReport>),
    AlreadyRunning,
    /// The cycle task panicked. The guard is released and the next cycle may start.
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub interval_secs: u64,
    pub in_flight: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
}

#[derive(Debug, Default)]
struct History {
    in_flight: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_report: Option<CycleReport>,
    cycles_completed: u64,
    cycles_skipped: u64,
}

struct Inner {
    pipeline: Arc<CyclePipeline>,
    interval: Duration,
    cycle_guard: Arc<Mutex<()>>,
    jobs: Mutex<Option<JobScheduler>>,
    history: Mutex<History>,
}

impl Inner {
    /// Runs the cycle on its own task so it completes even if the caller stops waiting.
    async fn run_guarded(self: Arc<Self>, trigger: CycleTrigger) -> TriggerOutcome {
        let Ok(guard) = self.cycle_guard.clone().try_lock_owned() else {
            debug!(?trigger, "cycle already in flight; not starting another");
            self.history.lock().await.cycles_skipped += 1;
            return TriggerOutcome::AlreadyRunning;
        };

        let inner = self.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            {
                let mut history = inner.history.lock().await;
                history.in_flight = true;
                history.last_run_at = Some(Utc::now());
            }
            let report = inner.pipeline.run_cycle(trigger).await;

            let mut history = inner.history.lock().await;
            history.in_flight = false;
            history.cycles_completed += 1;
            history.last_report = Some(report.clone());
            report
        });

        match task.await {
            Ok(report) => TriggerOutcome::Completed(Box::new(report)),
            Err(err) => {
                warn!(?trigger, error = %format!("{err:#}"), "cycle task did not finish");
                self.history.lock().await.in_flight = false;
                TriggerOutcome::Failed(err.to_string())
            }
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<CyclePipeline>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline,
                interval,
                cycle_guard: Arc::new(Mutex::new(())),
                jobs: Mutex::new(None),
                history: Mutex::new(History::default()),
            }),
        }
    }

    /// Begin periodic cycles. No-op when already running.
    pub async fn start(&self) -> Result<SchedulerState> {
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.is_some() {
            return Ok(SchedulerState::Running);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let job = Job::new_repeated_async(self.inner.interval, move |_uuid, _lock| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.run_guarded(CycleTrigger::Timer).await;
                }
            })
        })
        .context("creating repeated cycle job")?;
        sched.add(job).await.context("adding cycle job")?;
        sched.start().await.context("starting scheduler")?;

        info!(interval_secs = self.inner.interval.as_secs(), "scheduler started");
        *jobs = Some(sched);
        Ok(SchedulerState::Running)
    }

    /// Cancel future ticks. An in-flight cycle runs to completion. No-op when stopped.
    pub async fn stop(&self) -> Result<SchedulerState> {
        let mut jobs = self.inner.jobs.lock().await;
        if let Some(mut sched) = jobs.take() {
            sched.shutdown().await.context("shutting down scheduler")?;
            info!("scheduler stopped");
        }
        Ok(SchedulerState::Stopped)
    }

    /// Run one cycle now unless one is already in flight. Does not change Running/Stopped.
    pub async fn trigger_refresh(&self) -> TriggerOutcome {
        self.inner.clone().run_guarded(CycleTrigger::Manual).await
    }

    pub async fn state(&self) -> SchedulerState {
        if self.inner.jobs.lock().await.is_some() {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    pub async fn get_status(&self) -> SchedulerStatus {
        let state = self.state().await;
        let history = self.inner.history.lock().await;
        SchedulerStatus {
            state,
            interval_secs: self.inner.interval.as_secs(),
            in_flight: history.in_flight,
            last_run_at: history.last_run_at,
            last_finished_at: history.last_report.as_ref().map(|r| r.finished_at),
            last_error: history
                .last_report
                .as_ref()
                .and_then(CycleReport::error_summary),
            last_report: history.last_report.clone(),
            cycles_completed: history.cycles_completed,
            cycles_skipped: history.cycles_skipped,
        }
    }
}
