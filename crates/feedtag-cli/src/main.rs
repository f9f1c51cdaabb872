use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use feedtag_adapters::{FixtureIngestor, OpenAiClassifier};
use feedtag_core::{matches_rules, parse_rules};
use feedtag_storage::{
    AnalysisStatusRepository, ClassificationStore, EntryRepository, MemoryStore, PgStore,
};
use feedtag_sync::{
    load_tag_seed_file, seed_tags, BatchRunner, CyclePipeline, CycleTrigger, PipelineConfig,
    Scheduler,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str =
    "feedtag=info,feedtag_core=info,feedtag_storage=info,feedtag_adapters=info,feedtag_sync=info,feedtag_web=info";

#[derive(Debug, Parser)]
#[command(name = "feedtag")]
#[command(about = "Feed entry classification pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest fixtures, apply rule tags, then run one auto-tagging batch.
    Cycle,
    /// Run one auto-tagging batch over stored entries.
    Batch {
        #[arg(long)]
        limit: Option<usize>,
        /// Return entries analyzed under an older tags version to pending first.
        #[arg(long)]
        invalidate_stale: bool,
    },
    /// Check text against a JSON rule set.
    Match {
        text: String,
        #[arg(long)]
        rules: String,
    },
    /// Apply database migrations. Requires DATABASE_URL.
    Migrate,
    /// Serve the scheduler control API.
    Serve,
}

/// Store handles under both trait objects the pipeline needs.
struct Stores {
    classification: Arc<dyn ClassificationStore>,
    entries: Arc<dyn EntryRepository>,
}

fn stores<S: ClassificationStore + 'static>(store: Arc<S>) -> Stores {
    Stores {
        classification: store.clone(),
        entries: store,
    }
}

async fn open_stores(config: &PipelineConfig) -> Result<Stores> {
    let Some(url) = config.database_url.as_deref() else {
        info!("DATABASE_URL unset; using in-memory store");
        let store = Arc::new(MemoryStore::new());
        seed_from_file(config, store.as_ref()).await?;
        return Ok(stores(store));
    };
    let store = Arc::new(PgStore::connect(url).await?);
    store.migrate().await?;
    seed_from_file(config, store.as_ref()).await?;
    Ok(stores(store))
}

async fn seed_from_file<S: ClassificationStore>(config: &PipelineConfig, store: &S) -> Result<()> {
    if !config.tags_file.exists() {
        warn!(path = %config.tags_file.display(), "tags file not found; skipping tag seed");
        return Ok(());
    }
    let file = load_tag_seed_file(&config.tags_file)?;
    seed_tags(store, &file).await?;
    Ok(())
}

async fn build_pipeline(config: &PipelineConfig) -> Result<CyclePipeline> {
    let stores = open_stores(config).await?;
    let classifier = OpenAiClassifier::new(
        config.auto_tagging.classifier.clone(),
        config.http_client_config(),
    )?;
    let runner = BatchRunner::new(
        stores.classification,
        Arc::new(classifier),
        config.auto_tagging.clone(),
    );
    let ingestor = FixtureIngestor::new(config.fixtures_dir.clone(), stores.entries);
    Ok(CyclePipeline::new(
        Arc::new(ingestor),
        Arc::new(runner),
        config.batch_limit,
    ))
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Cycle) {
        Commands::Cycle => {
            let pipeline = build_pipeline(&config).await?;
            let report = pipeline.run_cycle(CycleTrigger::Manual).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Batch {
            limit,
            invalidate_stale,
        } => {
            let pipeline = build_pipeline(&config).await?;
            let runner = pipeline.runner();
            if invalidate_stale {
                let reset = runner
                    .store()
                    .invalidate_older_than(runner.config().tags_version)
                    .await?;
                info!(reset, "stale analyses returned to pending");
            }
            let counters = runner.run_batch(limit.unwrap_or(config.batch_limit)).await?;
            println!(
                "batch complete: processed={} tagged={} untagged={} failed={}",
                counters.processed, counters.tagged, counters.untagged, counters.failed
            );
        }
        Commands::Match { text, rules } => {
            serde_json::from_str::<serde_json::Value>(&rules).context("rules must be JSON")?;
            let groups = parse_rules(Some(&rules));
            if groups.is_empty() {
                bail!("no valid rule groups in {rules}");
            }
            println!("{}", matches_rules(&text, &groups));
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL is required for migrate");
            };
            PgStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = build_pipeline(&config).await?;
            let scheduler = Scheduler::new(Arc::new(pipeline), config.interval);
            if config.scheduler_enabled {
                scheduler.start().await?;
            }
            let state = feedtag_web::AppState::new(scheduler.clone());
            feedtag_web::serve(config.bind_addr, state, async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %format!("{err:#}"), "ctrl-c handler failed");
                }
            })
            .await?;
            scheduler.stop().await?;
        }
    }

    Ok(())
}
