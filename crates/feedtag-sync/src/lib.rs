//! Classification pipeline: batch runner, ingestion cycle and scheduler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use feedtag_core::{AutoTaggingConfig, ClassifierSettings};
use feedtag_storage::{HttpClientConfig, RateLimit};

pub mod batch;
pub mod cycle;
pub mod scheduler;
pub mod seed;

pub use batch::{BatchRunner, CutoffState, RulePassReport};
pub use cycle::{CyclePipeline, CycleReport, CycleTrigger};
pub use scheduler::{Scheduler, SchedulerState, SchedulerStatus, TriggerOutcome};
pub use seed::{load_tag_seed_file, seed_tags, TagSeed, TagSeedFile};

pub const CRATE_NAME: &str = "feedtag-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub interval: Duration,
    pub batch_limit: usize,
    pub fixtures_dir: PathBuf,
    pub tags_file: PathBuf,
    pub bind_addr: SocketAddr,
    pub http_timeout_secs: u64,
    /// Classifier requests per minute. Zero means unlimited.
    pub ai_requests_per_minute: u32,
    pub auto_tagging: AutoTaggingConfig,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl PipelineConfig {
    /// Read configuration from the environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | unset (in-memory store) |
    /// | `FEEDTAG_SCHEDULER_ENABLED` | `false` |
    /// | `FEEDTAG_INTERVAL_SECS` | `900` |
    /// | `FEEDTAG_BATCH_LIMIT` | `20` |
    /// | `FEEDTAG_FIXTURES_DIR` | `./fixtures` |
    /// | `FEEDTAG_TAGS_FILE` | `./tags.yaml` |
    /// | `FEEDTAG_BIND` | `127.0.0.1:8787` |
    /// | `FEEDTAG_HTTP_TIMEOUT_SECS` | `30` |
    /// | `FEEDTAG_AI_REQUESTS_PER_MIN` | `0` (unlimited) |
    /// | `AI_TAGGING_ENABLED` | `false` |
    /// | `AI_API_BASE`, `AI_API_KEY`, `AI_MODEL` | unset |
    /// | `FEEDTAG_TAGS_VERSION` | `1` |
    pub fn from_env() -> Self {
        Self {
            database_url: env_opt("DATABASE_URL"),
            scheduler_enabled: env_flag("FEEDTAG_SCHEDULER_ENABLED", false),
            interval: Duration::from_secs(env_parse("FEEDTAG_INTERVAL_SECS").unwrap_or(900).max(1)),
            batch_limit: env_parse("FEEDTAG_BATCH_LIMIT").unwrap_or(20),
            fixtures_dir: env_opt("FEEDTAG_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures")),
            tags_file: env_opt("FEEDTAG_TAGS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./tags.yaml")),
            bind_addr: env_parse("FEEDTAG_BIND")
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8787))),
            http_timeout_secs: env_parse("FEEDTAG_HTTP_TIMEOUT_SECS").unwrap_or(30),
            ai_requests_per_minute: env_parse("FEEDTAG_AI_REQUESTS_PER_MIN").unwrap_or(0),
            auto_tagging: AutoTaggingConfig {
                enabled: env_flag("AI_TAGGING_ENABLED", false),
                classifier: ClassifierSettings {
                    api_base: env_opt("AI_API_BASE"),
                    api_key: env_opt("AI_API_KEY"),
                    model: env_opt("AI_MODEL"),
                },
                tags_version: env_parse("FEEDTAG_TAGS_VERSION").unwrap_or(1),
            },
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            rate_limit: RateLimit::per_minute(self.ai_requests_per_minute),
            ..Default::default()
        }
    }
}
