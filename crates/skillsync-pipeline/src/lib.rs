//! Pipeline orchestration: scrape, extract, match, recommend.
//!
//! Each stage is fault isolated. A failing stage is logged and recorded in the
//! [`PipelineSummary`], and the next stage still runs.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use skillsync_adapters::{adapter_for_source, ScrapeSummary, SourceAdapter};
use skillsync_storage::{HttpFetcher, IngestionLedger, PgStore, StoreHandles};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod extraction;
pub mod recommendation;
pub mod status;
pub mod sweep;

pub use config::{PipelineConfig, SourceRegistry};
pub use extraction::{ExtractionParams, ExtractionSummary, SkillExtractionStage};
pub use recommendation::{
    EngineRecommender, Recommendation, RecommendationParams, RecommendationSummary,
    RecommendationSummaryStage, Recommender,
};
pub use status::{collect_status, PipelineStatus};
pub use sweep::{MatchingSweep, SweepParams, SweepSummary};

pub const CRATE_NAME: &str = "skillsync-pipeline";

/// A registry adapter with its configured pagination and concurrency.
pub struct ScheduledSource {
    pub adapter: Box<dyn SourceAdapter>,
    pub pages: u32,
    pub workers: usize,
}

/// Narrows or overrides the scrape stage; the default scrapes every enabled source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeParams {
    pub source: Option<String>,
    pub pages: Option<u32>,
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scrape: Vec<ScrapeSummary>,
    pub extraction: Option<ExtractionSummary>,
    pub matching: Option<SweepSummary>,
    pub recommendations: Option<RecommendationSummary>,
    pub failed_stages: Vec<String>,
    pub total_jobs: Option<i64>,
    pub total_requirements: Option<i64>,
}

pub struct Pipeline {
    config: PipelineConfig,
    handles: StoreHandles,
    sources: Vec<ScheduledSource>,
    recommender: Arc<dyn Recommender>,
    running: Mutex<()>,
}

/// Build adapters for every enabled registry entry. Entries that fail to build are
/// logged and skipped.
pub fn sources_from_registry(
    registry: &SourceRegistry,
    handles: &StoreHandles,
    http: &HttpFetcher,
    config: &PipelineConfig,
) -> Vec<ScheduledSource> {
    let ledger = IngestionLedger::from_handles(handles);
    registry
        .enabled()
        .filter_map(|definition| {
            match adapter_for_source(definition, ledger.clone(), http, &config.workspace_root) {
                Ok(adapter) => Some(ScheduledSource {
                    adapter,
                    pages: definition.pages,
                    workers: definition.workers(),
                }),
                Err(err) => {
                    warn!(source = %definition.name, error = %err, "skipping misconfigured source");
                    None
                }
            }
        })
        .collect()
}

impl Pipeline {
    pub fn new(config: PipelineConfig, handles: StoreHandles) -> Self {
        let recommender = Arc::new(EngineRecommender::from_handles(&handles));
        Self {
            config,
            handles,
            sources: Vec::new(),
            recommender,
            running: Mutex::new(()),
        }
    }

    pub fn with_sources(mut self, sources: Vec<ScheduledSource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_recommender(mut self, recommender: Arc<dyn Recommender>) -> Self {
        self.recommender = recommender;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn handles(&self) -> &StoreHandles {
        &self.handles
    }

    /// Connect to Postgres and wire every enabled source from `sources.yaml`.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = PgStore::connect(&config.database_url, config.db_max_connections)
            .await
            .context("connecting to postgres")?;
        let handles = StoreHandles::from_store(Arc::new(store));
        let http = HttpFetcher::new(config.http_config())?;
        let registry = SourceRegistry::load(&config.workspace_root)?;
        let sources = sources_from_registry(&registry, &handles, &http, &config);
        info!(sources = sources.len(), "pipeline configured");
        Ok(Self::new(config, handles).with_sources(sources))
    }

    /// Run each matching adapter once. One source failing does not stop the others.
    pub async fn run_scrape(
        &self,
        cancel: &CancellationToken,
        params: &ScrapeParams,
    ) -> Result<Vec<ScrapeSummary>> {
        let selected: Vec<&ScheduledSource> = self
            .sources
            .iter()
            .filter(|s| {
                params
                    .source
                    .as_deref()
                    .map_or(true, |name| s.adapter.source_name() == name)
            })
            .collect();
        if let Some(name) = params.source.as_deref() {
            if selected.is_empty() {
                anyhow::bail!("no enabled source named {name}");
            }
        }

        let started = Instant::now();
        info!(stage = "scrape", status = "started", sources = selected.len(), "scrape started");
        let mut summaries = Vec::new();
        let mut failures = 0usize;
        for source in selected {
            if cancel.is_cancelled() {
                break;
            }
            let pages = params.pages.unwrap_or(source.pages);
            let workers = params.workers.unwrap_or(source.workers);
            match source.adapter.scrape(cancel, pages, workers).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    failures += 1;
                    error!(
                        stage = "scrape",
                        source = source.adapter.source_name(),
                        error = %err,
                        "source scrape failed"
                    );
                }
            }
        }
        info!(
            stage = "scrape",
            status = "finished",
            sources = summaries.len(),
            failed = failures,
            duration_ms = started.elapsed().as_millis() as u64,
            "scrape finished"
        );
        Ok(summaries)
    }

    pub async fn run_extraction(
        &self,
        cancel: &CancellationToken,
        params: ExtractionParams,
    ) -> Result<ExtractionSummary> {
        SkillExtractionStage::from_handles(&self.handles)
            .run(cancel, params)
            .await
    }

    pub async fn run_matching(
        &self,
        cancel: &CancellationToken,
        params: SweepParams,
    ) -> Result<SweepSummary> {
        MatchingSweep::from_handles(&self.handles)
            .run(cancel, params)
            .await
    }

    pub async fn run_recommendations(
        &self,
        cancel: &CancellationToken,
        params: RecommendationParams,
    ) -> Result<RecommendationSummary> {
        RecommendationSummaryStage::new(self.handles.users.clone(), self.recommender.clone())
            .run(cancel, params)
            .await
    }

    /// All four stages in order. Never fails; stage errors land in `failed_stages`.
    pub async fn run_once(&self, cancel: &CancellationToken) -> PipelineSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(%run_id, status = "started", "pipeline run started");

        let mut failed_stages = Vec::new();

        let scrape = self
            .run_scrape(cancel, &ScrapeParams::default())
            .await
            .unwrap_or_else(|err| {
                stage_failed(&mut failed_stages, "scrape", &err);
                Vec::new()
            });
        let extraction = ok_or_record(
            &mut failed_stages,
            "extraction",
            self.run_extraction(cancel, self.config.extraction_params()).await,
        );
        let matching = ok_or_record(
            &mut failed_stages,
            "matching",
            self.run_matching(cancel, self.config.sweep_params()).await,
        );
        let recommendations = ok_or_record(
            &mut failed_stages,
            "recommendations",
            self.run_recommendations(cancel, self.config.recommendation_params())
                .await,
        );

        let total_jobs = self
            .handles
            .jobs
            .count_jobs()
            .await
            .map_err(|err| warn!(error = %err, "counting jobs failed"))
            .ok();
        let total_requirements = self
            .handles
            .jobs
            .count_requirements()
            .await
            .map_err(|err| warn!(error = %err, "counting requirements failed"))
            .ok();

        info!(
            %run_id,
            status = if failed_stages.is_empty() { "finished" } else { "degraded" },
            failed_stages = failed_stages.len(),
            total_jobs = total_jobs.unwrap_or(-1),
            total_requirements = total_requirements.unwrap_or(-1),
            duration_ms = started.elapsed().as_millis() as u64,
            "pipeline run finished"
        );

        PipelineSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            scrape,
            extraction,
            matching,
            recommendations,
            failed_stages,
            total_jobs,
            total_requirements,
        }
    }

    /// Like [`run_once`](Self::run_once) but skipped when a run is already in progress
    /// or `cancel` has fired.
    pub async fn run_exclusive(&self, cancel: &CancellationToken) -> Option<PipelineSummary> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("pipeline run already in progress; skipping trigger");
            return None;
        };
        if cancel.is_cancelled() {
            return None;
        }
        Some(self.run_once(cancel).await)
    }

    /// Resolves once no [`run_exclusive`](Self::run_exclusive) run is in progress.
    pub async fn wait_idle(&self) {
        let _guard = self.running.lock().await;
    }

    pub async fn status(&self, top_users: usize) -> Result<PipelineStatus> {
        collect_status(&self.handles, top_users).await
    }

    /// Register the full pipeline on the configured cron expression, if scheduling is on.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        build_scheduler(self.clone(), &self.config.pipeline_cron, cancel)
            .await
            .map(Some)
    }
}

/// Scheduler firing `pipeline.run_exclusive` on `cron` (six fields, seconds first).
pub async fn build_scheduler(
    pipeline: Arc<Pipeline>,
    cron: &str,
    cancel: CancellationToken,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let schedule = cron.to_string();
    let job = Job::new_async(&schedule, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        Box::pin(async move {
            if cancel.is_cancelled() {
                return;
            }
            if let Some(summary) = pipeline.run_exclusive(&cancel).await {
                info!(
                    run_id = %summary.run_id,
                    failed_stages = summary.failed_stages.len(),
                    "scheduled pipeline run complete"
                );
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn run_pipeline_once_from_env(cancel: &CancellationToken) -> Result<PipelineSummary> {
    let pipeline = Pipeline::connect(PipelineConfig::from_env()).await?;
    Ok(pipeline.run_once(cancel).await)
}

fn stage_failed(failed: &mut Vec<String>, stage: &str, err: &anyhow::Error) {
    error!(stage, status = "failed", error = %format!("{err:#}"), "stage failed");
    failed.push(stage.to_string());
}

fn ok_or_record<T>(failed: &mut Vec<String>, stage: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            stage_failed(failed, stage, &err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use skillsync_adapters::fixture::{FixtureFile, FixturePage};
    use skillsync_adapters::{
        AdapterError, CrawlAdapter, FixtureCrawler, ListingCrawler, ListingRef,
    };
    use skillsync_core::{PostingDraft, RunStatus};
    use skillsync_storage::MemoryStore;
    use tokio::sync::Notify;

    struct BrokenSource;

    #[async_trait]
    impl SourceAdapter for BrokenSource {
        fn source_name(&self) -> &str {
            "broken"
        }

        async fn scrape(
            &self,
            _cancel: &CancellationToken,
            _pages: u32,
            _workers: usize,
        ) -> Result<ScrapeSummary, AdapterError> {
            Err(AdapterError::Message("source unreachable".into()))
        }
    }

    /// Blocks on its first listing page until the run is cancelled.
    struct StallingCrawler {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl ListingCrawler for StallingCrawler {
        fn source_name(&self) -> &str {
            "stalling"
        }

        fn base_url(&self) -> &str {
            ""
        }

        fn rate_limit_per_sec(&self) -> u32 {
            0
        }

        async fn list_page(
            &self,
            _page: u32,
            cancel: &CancellationToken,
        ) -> Result<Vec<ListingRef>, AdapterError> {
            self.started.notify_one();
            cancel.cancelled().await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Err(AdapterError::Cancelled)
        }

        async fn fetch_detail(
            &self,
            listing: &ListingRef,
            _cancel: &CancellationToken,
        ) -> Result<PostingDraft, AdapterError> {
            Ok(listing.summary.clone())
        }
    }

    struct UnavailableRecommender;

    #[async_trait]
    impl Recommender for UnavailableRecommender {
        async fn recommend(&self, _u: Uuid, _l: usize, _m: i32) -> Result<Vec<Recommendation>> {
            anyhow::bail!("recommendations unavailable")
        }
    }

    fn board(store: &Arc<MemoryStore>) -> ScheduledSource {
        let handles = StoreHandles::from_store(store.clone());
        let file = FixtureFile {
            pages: vec![FixturePage {
                postings: vec![
                    PostingDraft {
                        external_id: Some("b-1".into()),
                        title: Some("Backend Engineer".into()),
                        description: Some("Must know Go and PostgreSQL. Go Go Go.".into()),
                        ..Default::default()
                    },
                    PostingDraft {
                        external_id: Some("b-2".into()),
                        title: Some("Frontend Engineer".into()),
                        description: Some("TypeScript required".into()),
                        ..Default::default()
                    },
                ],
                error: None,
            }],
        };
        ScheduledSource {
            adapter: Box::new(CrawlAdapter::new(
                FixtureCrawler::new("board", "https://board.example", file),
                IngestionLedger::from_handles(&handles),
            )),
            pages: 1,
            workers: 2,
        }
    }

    fn pipeline(store: &Arc<MemoryStore>, sources: Vec<ScheduledSource>) -> Pipeline {
        Pipeline::new(
            PipelineConfig::default(),
            StoreHandles::from_store(store.clone()),
        )
        .with_sources(sources)
    }

    #[tokio::test]
    async fn full_run_flows_postings_into_matches() {
        let store = Arc::new(MemoryStore::new());
        let go = store.add_skill("Go");
        store.add_skill("PostgreSQL");
        store.add_skill("TypeScript");
        let user = store.add_user(&[(go, 5, 4)]);

        let summary = pipeline(&store, vec![board(&store)])
            .run_once(&CancellationToken::new())
            .await;

        assert!(summary.failed_stages.is_empty(), "{:?}", summary.failed_stages);
        assert_eq!(summary.scrape.len(), 1);
        assert_eq!(summary.scrape[0].inserted, 2);
        assert_eq!(summary.extraction.as_ref().map(|e| e.extracted), Some(2));
        assert_eq!(summary.matching.as_ref().map(|m| m.submitted), Some(2));
        assert_eq!(summary.recommendations.as_ref().map(|r| r.users), Some(1));
        assert_eq!(summary.total_jobs, Some(2));
        assert_eq!(summary.total_requirements, Some(3));

        let source = store.source_id("board").expect("source");
        let backend = store.posting_by_key(source, "b-1").expect("posting");
        let scored = store.job_match(user, backend.id).expect("match");
        assert!(scored.score > 0.0);
    }

    #[tokio::test]
    async fn failing_stages_do_not_stop_later_ones() {
        let store = Arc::new(MemoryStore::new());
        let go = store.add_skill("Go");
        store.add_user(&[(go, 3, 1)]);

        let broken = ScheduledSource {
            adapter: Box::new(BrokenSource),
            pages: 1,
            workers: 1,
        };
        let summary = pipeline(&store, vec![broken, board(&store)])
            .with_recommender(Arc::new(UnavailableRecommender))
            .run_once(&CancellationToken::new())
            .await;

        assert_eq!(summary.scrape.len(), 1);
        assert!(summary.extraction.is_some());
        assert!(summary.matching.is_some());
        let recommendations = summary.recommendations.expect("stage ran");
        assert_eq!(recommendations.failed, 1);
        assert!(summary.failed_stages.is_empty());
    }

    #[tokio::test]
    async fn scrape_can_target_one_source_with_overrides() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store, vec![board(&store)]);
        let cancel = CancellationToken::new();

        let summaries = pipeline
            .run_scrape(
                &cancel,
                &ScrapeParams {
                    source: Some("board".into()),
                    pages: Some(3),
                    workers: Some(1),
                },
            )
            .await
            .expect("scrape");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].pages_requested, 3);

        let missing = pipeline
            .run_scrape(
                &cancel,
                &ScrapeParams {
                    source: Some("nope".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&store, Vec::new());
        let _held = pipeline.running.lock().await;
        assert!(pipeline
            .run_exclusive(&CancellationToken::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(pipeline(&store, Vec::new()));
        let sched = pipeline
            .maybe_build_scheduler(CancellationToken::new())
            .await
            .expect("scheduler");
        assert!(sched.is_none());
    }

    #[test]
    fn registry_sources_skip_misconfigured_entries() {
        let store = Arc::new(MemoryStore::new());
        let handles = StoreHandles::from_store(store);
        let http = HttpFetcher::new(Default::default()).expect("http");
        let registry = SourceRegistry::from_yaml_str(
            "sources:\n  - {name: careers, kind: company_careers}\n  - {name: devto, kind: devto, pages: 2, workers: 3}\n  - {name: off, kind: devto, enabled: false}\n",
        )
        .expect("registry");

        let sources = sources_from_registry(&registry, &handles, &http, &PipelineConfig::default());
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].adapter.source_name(), "devto");
        assert_eq!((sources[0].pages, sources[0].workers), (2, 3));
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_run_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let started = Arc::new(Notify::new());
        let stalling = ScheduledSource {
            adapter: Box::new(CrawlAdapter::new(
                StallingCrawler {
                    started: started.clone(),
                },
                IngestionLedger::from_handles(&StoreHandles::from_store(store.clone())),
            )),
            pages: 1,
            workers: 1,
        };
        let pipeline = Arc::new(pipeline(&store, vec![stalling]));
        let cancel = CancellationToken::new();

        let in_flight = tokio::spawn({
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            async move { pipeline.run_exclusive(&cancel).await }
        });
        started.notified().await;
        cancel.cancel();
        pipeline.wait_idle().await;

        let source = store.source_id("stalling").expect("source");
        let runs = store.runs_for_source(source);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Finished);
        assert!(runs[0].finished_at.is_some());

        assert!(pipeline.run_exclusive(&cancel).await.is_none());
        assert!(in_flight.await.expect("join").is_some());
    }
}
