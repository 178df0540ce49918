use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skillsync_pipeline::{
    build_scheduler, ExtractionParams, Pipeline, PipelineConfig, ScrapeParams,
};
use skillsync_storage::PgStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "skillsync")]
#[command(about = "SkillSync job ingestion and matching pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape configured sources once.
    Scrape {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        pages: Option<u32>,
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Extract skill requirements for postings that have none.
    Extract {
        /// 0 uses the default.
        #[arg(long)]
        workers: Option<usize>,
        /// Postings per batch; 0 uses the default.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Score every user against every requirement-bearing job.
    Match {
        /// 0 uses the default.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Log recommendation counts per user.
    Recommend,
    /// Run all stages once.
    Pipeline,
    /// Apply database migrations.
    Migrate,
    /// Run the pipeline on its cron schedule until interrupted.
    Schedule,
    /// Print per-source, extraction and matching aggregates.
    Status {
        /// Users listed by match count; 0 uses the default.
        #[arg(long, default_value_t = 10)]
        users: usize,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Cancel the run-wide token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    config.validate()?;
    let cancel = cancel_on_ctrl_c();

    match cli.command.unwrap_or(Commands::Pipeline) {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Scrape {
            source,
            pages,
            workers,
        } => {
            let pipeline = Pipeline::connect(config).await?;
            let summaries = pipeline
                .run_scrape(
                    &cancel,
                    &ScrapeParams {
                        source,
                        pages,
                        workers,
                    },
                )
                .await?;
            let inserted: usize = summaries.iter().map(|s| s.inserted).sum();
            let updated: usize = summaries.iter().map(|s| s.updated).sum();
            let failed: usize = summaries.iter().map(|s| s.failed).sum();
            println!(
                "scrape complete: sources={} inserted={inserted} updated={updated} failed={failed}",
                summaries.len()
            );
        }
        Commands::Extract { workers, limit } => {
            let defaults = config.extraction_params();
            let params = ExtractionParams {
                workers: workers.unwrap_or(defaults.workers),
                batch_limit: limit.unwrap_or(defaults.batch_limit),
            };
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.run_extraction(&cancel, params).await?;
            println!(
                "extraction complete: processed={} extracted={} requirements={} failed={}",
                summary.processed, summary.extracted, summary.requirements, summary.failed
            );
        }
        Commands::Match { workers } => {
            let mut params = config.sweep_params();
            if let Some(workers) = workers {
                params.workers = workers;
            }
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.run_matching(&cancel, params).await?;
            println!(
                "matching complete: users={} jobs={} submitted={} failed={} average_score={:.1} mandatory_missing={}",
                summary.users,
                summary.jobs,
                summary.submitted,
                summary.failed,
                summary.average_score,
                summary.mandatory_missing
            );
        }
        Commands::Recommend => {
            let params = config.recommendation_params();
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.run_recommendations(&cancel, params).await?;
            println!(
                "recommendations complete: users={} recommendations={} failed={}",
                summary.users, summary.recommendations, summary.failed
            );
        }
        Commands::Pipeline => {
            let pipeline = Pipeline::connect(config).await?;
            let summary = pipeline.run_once(&cancel).await;
            println!(
                "pipeline complete: run_id={} sources={} failed_stages={:?} jobs={} requirements={}",
                summary.run_id,
                summary.scrape.len(),
                summary.failed_stages,
                summary.total_jobs.unwrap_or_default(),
                summary.total_requirements.unwrap_or_default()
            );
        }
        Commands::Schedule => {
            let cron = config.pipeline_cron.clone();
            let pipeline = Arc::new(Pipeline::connect(config).await?);
            let mut sched = build_scheduler(pipeline.clone(), &cron, cancel.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running");
            cancel.cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("waiting for the in-flight run to finish");
            pipeline.wait_idle().await;
            println!("scheduler stopped");
        }
        Commands::Status { users } => {
            let pipeline = Pipeline::connect(config).await?;
            let status = pipeline.status(users).await?;
            for source in &status.sources {
                println!(
                    "source {}: jobs={} active={} latest_run={} latest_run_errors={}",
                    source.source,
                    source.jobs,
                    source.active_jobs,
                    source.latest_run.map_or("none", |s| s.as_str()),
                    source.latest_run_errors
                );
            }
            println!(
                "extraction: jobs_with_requirements={} jobs_without_description={} total_jobs={} total_requirements={}",
                status.extraction.jobs_with_requirements,
                status.extraction.jobs_without_description,
                status.total_jobs,
                status.total_requirements
            );
            println!(
                "matching: matches={} average_score={:.1} mandatory_missing={}",
                status.matching.matches,
                status.matching.average_score,
                status.matching.mandatory_missing
            );
            for user in &status.top_users {
                println!("user {}: matches={}", user.user_id, user.matches);
            }
        }
    }

    Ok(())
}
