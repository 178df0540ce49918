//! Source adapter contract, the shared crawl harness, and the concrete crawlers.
//!
//! Every adapter is a [`CrawlAdapter`] wrapping a [`ListingCrawler`]. The harness owns
//! the run lifecycle (ensure source, start run, mark-and-sweep deactivation, fan-out over
//! a worker pool, drain, finish run) so every source gets the same idempotence and
//! staleness policy; crawlers only know how to list a page and fetch one posting.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skillsync_core::{LogLevel, PostingDraft, RunStatus, UpsertOutcome};
use skillsync_storage::{FetchError, HttpFetcher, IngestionLedger, StoreError, WorkerPool};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub mod careers;
pub mod devto;
pub mod fixture;

pub use careers::{CareersPageCrawler, CareersTarget};
pub use devto::DevtoCrawler;
pub use fixture::FixtureCrawler;

pub const CRATE_NAME: &str = "skillsync-adapters";

const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("scrape cancelled")]
    Cancelled,
    /// A ledger failure already written to the run's scrape log.
    #[error(transparent)]
    Recorded(StoreError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Fetch(FetchError::Cancelled))
    }
}

fn already_recorded(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<AdapterError>(), Some(AdapterError::Recorded(_)))
}

/// One entry discovered on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ListingRef {
    /// Where the full posting lives; `None` when the listing already carries everything.
    pub detail_url: Option<String>,
    /// Whatever the listing page exposed; used to fill gaps in the detail fetch.
    pub summary: PostingDraft,
}

/// Site-specific half of an adapter.
#[async_trait]
pub trait ListingCrawler: Send + Sync + 'static {
    fn source_name(&self) -> &str;
    fn base_url(&self) -> &str;
    /// Aggregate task starts per second for the run's worker pool; 0 disables throttling.
    fn rate_limit_per_sec(&self) -> u32;

    async fn list_page(
        &self,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<ListingRef>, AdapterError>;

    async fn fetch_detail(
        &self,
        listing: &ListingRef,
        cancel: &CancellationToken,
    ) -> Result<PostingDraft, AdapterError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScrapeSummary {
    pub source: String,
    pub run_id: Uuid,
    pub pages_requested: u32,
    pub failed_pages: u32,
    pub listings: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    async fn scrape(
        &self,
        cancel: &CancellationToken,
        pages: u32,
        workers: usize,
    ) -> Result<ScrapeSummary, AdapterError>;
}

pub struct CrawlAdapter<C> {
    crawler: Arc<C>,
    ledger: IngestionLedger,
}

impl<C: ListingCrawler> CrawlAdapter<C> {
    pub fn new(crawler: C, ledger: IngestionLedger) -> Self {
        Self {
            crawler: Arc::new(crawler),
            ledger,
        }
    }

    async fn crawl(
        &self,
        source_id: Uuid,
        run_id: Uuid,
        cancel: &CancellationToken,
        pages: u32,
        workers: usize,
    ) -> Result<ScrapeSummary, AdapterError> {
        let name = self.crawler.source_name().to_string();
        let deactivated = self.ledger.deactivate_all_for_source(source_id).await?;
        self.ledger
            .log(
                Some(run_id),
                LogLevel::Info,
                &format!("run started: pages={pages} workers={workers} deactivated={deactivated}"),
            )
            .await;

        let mut pool = WorkerPool::<UpsertOutcome>::new(workers, workers * 2);
        pool.set_rate_limit(self.crawler.rate_limit_per_sec());
        let mut results = pool.run(cancel.clone());

        let drain_ledger = self.ledger.clone();
        let drainer = tokio::spawn(async move {
            let mut tally = (0usize, 0usize, 0usize);
            while let Some(result) = results.recv().await {
                match result {
                    Ok(UpsertOutcome::Inserted) => tally.0 += 1,
                    Ok(UpsertOutcome::Updated) => tally.1 += 1,
                    Err(err) => {
                        tally.2 += 1;
                        if !already_recorded(&err) {
                            drain_ledger
                                .log(Some(run_id), LogLevel::Error, &format!("item: {err:#}"))
                                .await;
                        }
                    }
                }
            }
            tally
        });

        let mut summary = ScrapeSummary {
            source: name.clone(),
            run_id,
            pages_requested: pages,
            ..Default::default()
        };

        'pages: for page in 1..=pages {
            if cancel.is_cancelled() {
                break;
            }
            let listings = match self.crawler.list_page(page, cancel).await {
                Ok(listings) => listings,
                Err(err) => {
                    summary.failed_pages += 1;
                    warn!(source = %name, %run_id, page, error = %err, "listing page failed");
                    self.ledger
                        .log(
                            Some(run_id),
                            LogLevel::Error,
                            &format!("{name} listing page {page}: {err}"),
                        )
                        .await;
                    continue;
                }
            };

            for listing in listings {
                summary.listings += 1;
                let crawler = self.crawler.clone();
                let ledger = self.ledger.clone();
                let submitted = pool
                    .submit(move |token| async move {
                        let posting = match crawler.fetch_detail(&listing, &token).await {
                            Ok(detail) => detail.or_from(&listing.summary),
                            Err(err) if err.is_cancelled() || token.is_cancelled() => {
                                return Err(anyhow::Error::from(err));
                            }
                            Err(err) => {
                                let url = listing.detail_url.as_deref().unwrap_or_default();
                                warn!(
                                    %run_id,
                                    detail_url = url,
                                    error = %err,
                                    "detail fetch failed, keeping listing summary"
                                );
                                ledger
                                    .log(
                                        Some(run_id),
                                        LogLevel::Warn,
                                        &format!("detail {url}: {err}; using listing summary"),
                                    )
                                    .await;
                                listing.summary.clone()
                            }
                        };
                        ledger
                            .upsert_posting(source_id, Some(run_id), posting)
                            .await
                            .map_err(|err| anyhow::Error::from(AdapterError::Recorded(err)))
                    })
                    .await;
                if submitted.is_err() {
                    break 'pages;
                }
            }
        }
        pool.close();

        let (inserted, updated, failed) = drainer
            .await
            .map_err(|err| AdapterError::Message(format!("result drainer failed: {err}")))?;
        summary.inserted = inserted;
        summary.updated = updated;
        summary.failed = failed;
        summary.cancelled = cancel.is_cancelled();
        Ok(summary)
    }
}

#[async_trait]
impl<C: ListingCrawler> SourceAdapter for CrawlAdapter<C> {
    fn source_name(&self) -> &str {
        self.crawler.source_name()
    }

    async fn scrape(
        &self,
        cancel: &CancellationToken,
        pages: u32,
        workers: usize,
    ) -> Result<ScrapeSummary, AdapterError> {
        let started = Instant::now();
        let name = self.crawler.source_name();
        let pages = pages.max(1);
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };

        let source_id = self
            .ledger
            .ensure_source(name, self.crawler.base_url())
            .await?;
        let run_id = self.ledger.start_run(source_id).await?;

        let outcome = self.crawl(source_id, run_id, cancel, pages, workers).await;
        let status = match &outcome {
            Ok(_) => RunStatus::Finished,
            Err(err) => {
                self.ledger
                    .log(Some(run_id), LogLevel::Error, &format!("run failed: {err}"))
                    .await;
                RunStatus::Error
            }
        };
        if let Err(err) = self.ledger.finish_run(run_id, status).await {
            warn!(source = name, %run_id, error = %err, "failed to finish scrape run");
        }

        if let Ok(summary) = &outcome {
            self.ledger
                .log(
                    Some(run_id),
                    LogLevel::Info,
                    &format!(
                        "run finished: inserted={} updated={} failed={} failed_pages={}",
                        summary.inserted, summary.updated, summary.failed, summary.failed_pages
                    ),
                )
                .await;
            info!(
                source = name,
                %run_id,
                inserted = summary.inserted,
                updated = summary.updated,
                failed = summary.failed,
                failed_pages = summary.failed_pages,
                cancelled = summary.cancelled,
                duration_ms = started.elapsed().as_millis() as u64,
                "scrape run finished"
            );
        }
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Devto,
    CompanyCareers,
    Fixture,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_pages")]
    pub pages: u32,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub rate_limit_per_sec: Option<u32>,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub link_selector: Option<String>,
    #[serde(default)]
    pub title_selector: Option<String>,
    #[serde(default)]
    pub location_selector: Option<String>,
    #[serde(default)]
    pub detail_body_selector: Option<String>,
    #[serde(default)]
    pub fixture_path: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_pages() -> u32 {
    1
}

impl SourceDefinition {
    pub fn workers(&self) -> usize {
        self.workers.filter(|w| *w > 0).unwrap_or(DEFAULT_WORKERS)
    }
}

/// Build the adapter described by a registry entry.
pub fn adapter_for_source(
    definition: &SourceDefinition,
    ledger: IngestionLedger,
    http: &HttpFetcher,
    workspace_root: &Path,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let adapter: Box<dyn SourceAdapter> = match definition.kind {
        SourceKind::Devto => {
            let mut crawler =
                DevtoCrawler::new(&definition.name, &definition.base_url, http.clone());
            if let Some(rate) = definition.rate_limit_per_sec {
                crawler = crawler.with_rate_limit(rate);
            }
            Box::new(CrawlAdapter::new(crawler, ledger))
        }
        SourceKind::CompanyCareers => {
            let listing_url = definition
                .listing_url
                .clone()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| {
                    AdapterError::Message(format!("source {} has no listing_url", definition.name))
                })?;
            let target = CareersTarget {
                name: definition.name.clone(),
                base_url: definition.base_url.clone(),
                listing_url,
                link_selector: definition.link_selector.clone(),
                title_selector: definition.title_selector.clone(),
                location_selector: definition.location_selector.clone(),
                detail_body_selector: definition.detail_body_selector.clone(),
            };
            let mut crawler = CareersPageCrawler::new(target, http.clone());
            if let Some(rate) = definition.rate_limit_per_sec {
                crawler = crawler.with_rate_limit(rate);
            }
            Box::new(CrawlAdapter::new(crawler, ledger))
        }
        SourceKind::Fixture => {
            let path = definition.fixture_path.as_deref().ok_or_else(|| {
                AdapterError::Message(format!("source {} has no fixture_path", definition.name))
            })?;
            let mut crawler = FixtureCrawler::from_path(
                &definition.name,
                &definition.base_url,
                workspace_root.join(path),
            )?;
            if let Some(rate) = definition.rate_limit_per_sec {
                crawler = crawler.with_rate_limit(rate);
            }
            Box::new(CrawlAdapter::new(crawler, ledger))
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use fixture::{FixtureFile, FixturePage};
    use skillsync_storage::{MemoryStore, PostingStore, StoreHandles, StoreResult};

    fn posting(id: &str, title: &str) -> PostingDraft {
        PostingDraft {
            external_id: Some(id.into()),
            title: Some(title.into()),
            company: Some("Acme".into()),
            ..Default::default()
        }
    }

    fn ledger(store: &Arc<MemoryStore>) -> IngestionLedger {
        IngestionLedger::from_handles(&StoreHandles::from_store(store.clone()))
    }

    #[tokio::test]
    async fn rescrape_counts_updates_and_sweeps_delisted_postings() {
        let store = Arc::new(MemoryStore::new());

        let first = FixtureCrawler::new(
            "board",
            "https://board.example",
            FixtureFile::single_page(vec![posting("1", "Go dev"), posting("2", "Rust dev")]),
        );
        let summary = CrawlAdapter::new(first, ledger(&store))
            .scrape(&CancellationToken::new(), 1, 2)
            .await
            .expect("first run");
        assert_eq!((summary.inserted, summary.updated, summary.failed), (2, 0, 0));

        let second = FixtureCrawler::new(
            "board",
            "https://board.example",
            FixtureFile::single_page(vec![posting("1", "Go developer")]),
        );
        let summary = CrawlAdapter::new(second, ledger(&store))
            .scrape(&CancellationToken::new(), 1, 2)
            .await
            .expect("second run");
        assert_eq!((summary.inserted, summary.updated), (0, 1));

        let source = store.source_id("board").expect("source");
        let one = store.posting_by_key(source, "1").expect("posting 1");
        let two = store.posting_by_key(source, "2").expect("posting 2");
        assert!(one.is_active);
        assert_eq!(one.title.as_deref(), Some("Go developer"));
        assert!(!two.is_active);

        let runs = store.runs_for_source(source);
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Finished));
    }

    #[tokio::test]
    async fn failed_listing_page_is_logged_and_skipped() {
        let store = Arc::new(MemoryStore::new());
        let crawler = FixtureCrawler::new(
            "flaky",
            "",
            FixtureFile {
                pages: vec![
                    FixturePage {
                        postings: Vec::new(),
                        error: Some("upstream 502".into()),
                    },
                    FixturePage {
                        postings: vec![posting("a", "Data engineer")],
                        error: None,
                    },
                ],
            },
        );

        let summary = CrawlAdapter::new(crawler, ledger(&store))
            .scrape(&CancellationToken::new(), 2, 1)
            .await
            .expect("run");
        assert_eq!(summary.failed_pages, 1);
        assert_eq!(summary.inserted, 1);

        let logs = store.logs_for_run(summary.run_id);
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Error && l.message.contains("upstream 502")));
        assert_eq!(
            store.run(summary.run_id).map(|r| r.status),
            Some(RunStatus::Finished)
        );
    }

    #[tokio::test]
    async fn items_without_identity_count_as_failures() {
        let store = Arc::new(MemoryStore::new());
        let crawler = FixtureCrawler::new(
            "partial",
            "",
            FixtureFile::single_page(vec![
                posting("ok", "Backend"),
                PostingDraft {
                    title: Some("No id or url".into()),
                    ..Default::default()
                },
            ]),
        );

        let summary = CrawlAdapter::new(crawler, ledger(&store))
            .scrape(&CancellationToken::new(), 1, 2)
            .await
            .expect("run");
        assert_eq!((summary.inserted, summary.failed), (1, 1));
    }

    #[tokio::test]
    async fn cancelled_run_still_finishes() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let crawler = FixtureCrawler::new(
            "board",
            "",
            FixtureFile::single_page(vec![posting("1", "Go dev")]),
        );
        let summary = CrawlAdapter::new(crawler, ledger(&store))
            .scrape(&cancel, 1, 1)
            .await
            .expect("run");
        assert!(summary.cancelled);
        assert_eq!(summary.inserted, 0);
        assert!(store.run(summary.run_id).and_then(|r| r.finished_at).is_some());
    }

    #[test]
    fn registry_entries_deserialize_with_defaults() {
        let definition: SourceDefinition = serde_json::from_str(
            r#"{"name": "Acme Careers", "kind": "company_careers", "listing_url": "https://acme.dev/jobs?page={page}"}"#,
        )
        .expect("definition");
        assert!(definition.enabled);
        assert_eq!(definition.pages, 1);
        assert_eq!(definition.workers(), DEFAULT_WORKERS);
        assert_eq!(definition.kind, SourceKind::CompanyCareers);
    }

    #[test]
    fn careers_source_requires_listing_url() {
        let store = Arc::new(MemoryStore::new());
        let definition = SourceDefinition {
            name: "Acme".into(),
            kind: SourceKind::CompanyCareers,
            enabled: true,
            base_url: String::new(),
            pages: 1,
            workers: None,
            rate_limit_per_sec: None,
            listing_url: None,
            link_selector: None,
            title_selector: None,
            location_selector: None,
            detail_body_selector: None,
            fixture_path: None,
        };
        let http = HttpFetcher::new(Default::default()).expect("http");
        let result = adapter_for_source(&definition, ledger(&store), &http, Path::new("."));
        assert!(matches!(result, Err(AdapterError::Message(_))));
    }

    /// Posting writes fail; everything else goes to the wrapped store.
    struct RejectingPostings(Arc<MemoryStore>);

    #[async_trait]
    impl PostingStore for RejectingPostings {
        async fn ensure_source(&self, name: &str, base_url: &str) -> StoreResult<Uuid> {
            self.0.ensure_source(name, base_url).await
        }

        async fn deactivate_all_for_source(&self, source_id: Uuid) -> StoreResult<u64> {
            self.0.deactivate_all_for_source(source_id).await
        }

        async fn upsert_posting(
            &self,
            _source_id: Uuid,
            _conflict_key: &str,
            _posting: &PostingDraft,
            _scraped_at: DateTime<Utc>,
        ) -> StoreResult<UpsertOutcome> {
            Err(StoreError::InvalidInput("db down".into()))
        }
    }

    #[tokio::test]
    async fn failed_upsert_is_logged_once() {
        let store = Arc::new(MemoryStore::new());
        let postings = Arc::new(RejectingPostings(store.clone()));
        let ledger = IngestionLedger::new(postings, store.clone());
        let crawler = FixtureCrawler::new(
            "board",
            "",
            FixtureFile::single_page(vec![posting("1", "Go dev")]),
        );

        let summary = CrawlAdapter::new(crawler, ledger)
            .scrape(&CancellationToken::new(), 1, 1)
            .await
            .expect("run");
        assert_eq!(summary.failed, 1);

        let errors: Vec<String> = store
            .logs_for_run(summary.run_id)
            .into_iter()
            .filter(|l| l.level == LogLevel::Error)
            .map(|l| l.message)
            .collect();
        assert_eq!(errors.len(), 1, "{errors:?}");
        assert!(errors[0].contains("db down"));
    }

    /// Lists postings that point at detail pages which always fail to load.
    struct BrokenDetails {
        listings: Vec<ListingRef>,
    }

    #[async_trait]
    impl ListingCrawler for BrokenDetails {
        fn source_name(&self) -> &str {
            "board"
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
            _cancel: &CancellationToken,
        ) -> Result<Vec<ListingRef>, AdapterError> {
            Ok(self.listings.clone())
        }

        async fn fetch_detail(
            &self,
            _listing: &ListingRef,
            _cancel: &CancellationToken,
        ) -> Result<PostingDraft, AdapterError> {
            Err(AdapterError::Parse("detail page changed layout".into()))
        }
    }

    #[tokio::test]
    async fn failed_detail_fetch_keeps_listed_posting_active() {
        let store = Arc::new(MemoryStore::new());
        let first = FixtureCrawler::new(
            "board",
            "",
            FixtureFile::single_page(vec![posting("1", "Go dev")]),
        );
        CrawlAdapter::new(first, ledger(&store))
            .scrape(&CancellationToken::new(), 1, 1)
            .await
            .expect("first run");

        let broken = BrokenDetails {
            listings: vec![ListingRef {
                detail_url: Some("https://board.example/jobs/1".into()),
                summary: posting("1", "Go developer"),
            }],
        };
        let summary = CrawlAdapter::new(broken, ledger(&store))
            .scrape(&CancellationToken::new(), 1, 1)
            .await
            .expect("second run");
        assert_eq!((summary.updated, summary.failed), (1, 0));

        let source = store.source_id("board").expect("source");
        let job = store.posting_by_key(source, "1").expect("posting");
        assert!(job.is_active);
        assert_eq!(job.title.as_deref(), Some("Go developer"));
        let logs = store.logs_for_run(summary.run_id);
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message.contains("changed layout")));
    }
}
