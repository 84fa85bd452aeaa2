mod classify;
mod cleanup;
mod cluster;
mod config;
mod dedup;
mod fetch;
mod filters;
mod models;
mod orchestrator;
mod posterior;
mod report;
mod similarity;
mod store;
mod textnorm;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use crate::classify::{ClassifierOracle, LlmClassifier, LlmClient, LlmDuplicateOracle, VerdictCache};
use crate::cluster::{BatchParams, DuplicateOracle};
use crate::config::{EngineConfig, LlmConfig, SourcesConfig};
use crate::fetch::Fetcher;
use crate::orchestrator::run_weekly;
use crate::store::Store;

/// newsift - weekly industry-news digest pipeline
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the source configuration file
    #[arg(short, long, default_value = "config/sources.toml", env = "SOURCES_FILE")]
    sources: PathBuf,

    /// SQLite warehouse path
    #[arg(long, default_value = "data/newsift.sqlite", env = "DW_DB_PATH")]
    db: PathBuf,

    /// Output directory for rendered weekly reports
    #[arg(short, long, default_value = "docs")]
    output_dir: PathBuf,

    /// Override the collection window in days
    #[arg(long)]
    days_back: Option<i64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Re-deduplicate an already-rendered weekly markdown file
    Cleanup {
        /// Markdown file to clean
        input: PathBuf,

        /// Output directory (defaults to the input file's directory)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Escalate ambiguous pairs to the semantic duplicate oracle
        #[arg(long)]
        llm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .init();

    info!("Starting newsift");

    let args = Args::parse();
    let mut cfg = EngineConfig::from_env();
    if let Some(days) = args.days_back {
        cfg.days_back = days;
    }
    debug!(
        "Engine config - days_back={}, use_llm={}, jaccard_th={}, within_hamming={}, cross_hamming={}",
        cfg.days_back, cfg.use_llm, cfg.jaccard_threshold, cfg.within_hamming, cfg.cross_hamming
    );

    match args.command {
        Some(Command::Cleanup { input, out_dir, llm }) => {
            let params = BatchParams {
                jaccard_threshold: cfg.jaccard_threshold,
                hamming_threshold: cfg.batch_hamming,
                global_cap: cfg.batch_global_cap,
                max_oracle_calls: cfg.max_oracle_calls,
                keep_policy: cfg.batch_policy,
                ..BatchParams::default()
            };
            let oracle = if llm {
                let client = LlmClient::new(LlmConfig::from_env()?)?;
                Some(LlmDuplicateOracle::new(client))
            } else {
                None
            };
            let report = cleanup::run_cleanup(
                &input,
                out_dir.as_deref(),
                &params,
                oracle.as_ref().map(|o| o as &dyn DuplicateOracle),
            )
            .await?;
            info!(
                "Cleanup finished - kept={}/{}, output={}",
                report.kept,
                report.total,
                report.md_path.display()
            );
            Ok(())
        }
        None => {
            // Source configuration is the one fatal prerequisite: without it
            // the run halts before any network or classification work.
            let sources = SourcesConfig::load(&args.sources)?;

            let store = Store::connect(&args.db).await?;
            let fetcher = Fetcher::new()?;

            let classifier = if cfg.use_llm {
                let client = LlmClient::new(LlmConfig::from_env()?)?;
                let cache = cfg
                    .cache_enabled
                    .then(|| VerdictCache::new(cfg.cache_dir.clone(), cfg.cache_ttl_hours));
                Some(LlmClassifier::new(
                    client,
                    cfg.enable_ignore_gate,
                    cfg.text_maxlen,
                    cache,
                ))
            } else {
                info!("Classifier oracle disabled - using keyword fallback for every item");
                None
            };

            run_weekly(
                &cfg,
                &sources,
                &store,
                &fetcher,
                classifier.as_ref().map(|c| c as &dyn ClassifierOracle),
                &args.output_dir,
            )
            .await
        }
    }
}
