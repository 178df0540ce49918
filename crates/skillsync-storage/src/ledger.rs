//! Scrape-run lifecycle and idempotent posting persistence shared by every source adapter.

use std::sync::Arc;

use chrono::Utc;
use skillsync_core::{LogLevel, PostingDraft, RunStatus, UpsertOutcome};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sha256_hex;
use crate::store::{require_id, PostingStore, RunStore, StoreError, StoreHandles, StoreResult};

/// Trim, drop any fragment, and drop trailing slashes.
pub fn canonical_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split_once('#').map_or(url, |(head, _)| head);
    url.trim_end_matches('/').to_string()
}

/// Upsert key of a posting within its source: the external id when present, otherwise a
/// stable hash of the canonical URL. `None` when the posting carries neither.
pub fn conflict_key(posting: &PostingDraft) -> Option<String> {
    if let Some(external_id) = posting
        .external_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return Some(external_id.to_string());
    }
    posting
        .url
        .as_deref()
        .map(canonical_url)
        .filter(|url| !url.is_empty())
        .map(|url| format!("url-sha256-{}", sha256_hex(url.as_bytes())))
}

#[derive(Clone)]
pub struct IngestionLedger {
    postings: Arc<dyn PostingStore>,
    runs: Arc<dyn RunStore>,
}

impl IngestionLedger {
    pub fn new(postings: Arc<dyn PostingStore>, runs: Arc<dyn RunStore>) -> Self {
        Self { postings, runs }
    }

    pub fn from_handles(handles: &StoreHandles) -> Self {
        Self::new(handles.postings.clone(), handles.runs.clone())
    }

    pub async fn ensure_source(&self, name: &str, base_url: &str) -> StoreResult<Uuid> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidInput("empty source name".into()));
        }
        self.postings.ensure_source(name, base_url.trim()).await
    }

    pub async fn deactivate_all_for_source(&self, source_id: Uuid) -> StoreResult<u64> {
        require_id(source_id, "source id")?;
        self.postings.deactivate_all_for_source(source_id).await
    }

    pub async fn start_run(&self, source_id: Uuid) -> StoreResult<Uuid> {
        require_id(source_id, "source id")?;
        self.runs.start_run(source_id).await
    }

    pub async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> StoreResult<()> {
        require_id(run_id, "run id")?;
        self.runs.finish_run(run_id, status).await
    }

    /// Append to the run's audit trail. Missing run ids and blank messages are ignored,
    /// and a failed append only emits a tracing warning.
    pub async fn log(&self, run_id: Option<Uuid>, level: LogLevel, message: &str) {
        let Some(run_id) = run_id.filter(|id| !id.is_nil()) else {
            return;
        };
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        if let Err(err) = self.runs.append_log(run_id, level, message).await {
            warn!(%run_id, error = %err, "failed to append scrape log");
        }
    }

    pub async fn upsert_posting(
        &self,
        source_id: Uuid,
        run_id: Option<Uuid>,
        posting: PostingDraft,
    ) -> StoreResult<UpsertOutcome> {
        require_id(source_id, "source id")?;
        let posting = posting.normalized();
        let Some(key) = conflict_key(&posting) else {
            self.log(run_id, LogLevel::Warn, "skipping posting without external id or url")
                .await;
            return Err(StoreError::InvalidInput(
                "posting has neither external id nor url".into(),
            ));
        };
        let scraped_at = posting.scraped_at.unwrap_or_else(Utc::now);

        match self
            .postings
            .upsert_posting(source_id, &key, &posting, scraped_at)
            .await
        {
            Ok(outcome) => {
                debug!(%source_id, key = %key, ?outcome, "posting upserted");
                Ok(outcome)
            }
            Err(err) => {
                self.log(
                    run_id,
                    LogLevel::Error,
                    &format!("upsert failed for {key}: {err}"),
                )
                .await;
                Err(err)
            }
        }
    }
}
