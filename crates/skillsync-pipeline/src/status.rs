//! Read-only pipeline status report built from persisted aggregates.

use anyhow::{Context, Result};
use serde::Serialize;
use skillsync_core::{ExtractionStatus, MatchingStatus, SourceStatus, UserMatchCount};
use skillsync_storage::StoreHandles;

const DEFAULT_USER_LIMIT: usize = 100;
const MAX_USER_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub sources: Vec<SourceStatus>,
    pub extraction: ExtractionStatus,
    pub matching: MatchingStatus,
    pub top_users: Vec<UserMatchCount>,
    pub total_jobs: i64,
    pub total_requirements: i64,
}

/// `0` means the default; anything above the cap is clamped.
pub fn user_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_USER_LIMIT,
        n => n.min(MAX_USER_LIMIT),
    }
}

pub async fn collect_status(handles: &StoreHandles, top_users: usize) -> Result<PipelineStatus> {
    let status = &handles.status;
    Ok(PipelineStatus {
        sources: status.source_status().await.context("loading source status")?,
        extraction: status
            .extraction_status()
            .await
            .context("loading extraction status")?,
        matching: status
            .matching_status()
            .await
            .context("loading matching status")?,
        top_users: status
            .top_matched_users(user_limit(top_users))
            .await
            .context("loading per-user match counts")?,
        total_jobs: handles.jobs.count_jobs().await.context("counting jobs")?,
        total_requirements: handles
            .jobs
            .count_requirements()
            .await
            .context("counting requirements")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use skillsync_adapters::fixture::FixtureFile;
    use skillsync_adapters::{CrawlAdapter, FixtureCrawler, SourceAdapter};
    use skillsync_core::{PostingDraft, RunStatus};
    use skillsync_storage::{IngestionLedger, MatchStore, MemoryStore};
    use tokio_util::sync::CancellationToken;

    use crate::{MatchingSweep, SkillExtractionStage, SweepParams};

    #[test]
    fn user_limit_defaults_and_caps() {
        assert_eq!(user_limit(0), 100);
        assert_eq!(user_limit(25), 25);
        assert_eq!(user_limit(10_000), 500);
    }

    #[tokio::test]
    async fn status_agrees_with_stage_results() {
        let store = Arc::new(MemoryStore::new());
        let handles = StoreHandles::from_store(store.clone());
        let go = store.add_skill("Go");
        store.add_skill("Docker");

        let crawler = FixtureCrawler::new(
            "board",
            "",
            FixtureFile::single_page(vec![
                PostingDraft {
                    external_id: Some("a".into()),
                    title: Some("Go dev".into()),
                    description: Some("Go is required. Docker is nice.".into()),
                    ..Default::default()
                },
                PostingDraft {
                    external_id: Some("b".into()),
                    title: Some("Office manager".into()),
                    ..Default::default()
                },
            ]),
        );
        CrawlAdapter::new(crawler, IngestionLedger::from_handles(&handles))
            .scrape(&CancellationToken::new(), 1, 1)
            .await
            .expect("scrape");
        SkillExtractionStage::from_handles(&handles)
            .run(&CancellationToken::new(), Default::default())
            .await
            .expect("extraction");

        let gopher = store.add_user(&[(go, 5, 5)]);
        store.add_user(&[]);
        let sweep = MatchingSweep::from_handles(&handles)
            .run(&CancellationToken::new(), SweepParams::default())
            .await
            .expect("sweep");

        let status = collect_status(&handles, 0).await.expect("status");
        assert_eq!(status.sources.len(), 1);
        assert_eq!(status.sources[0].source, "board");
        assert_eq!(status.sources[0].jobs, 2);
        assert_eq!(status.sources[0].latest_run, Some(RunStatus::Finished));
        assert_eq!(status.sources[0].latest_run_errors, 0);
        assert_eq!(status.extraction.jobs_with_requirements, 1);
        assert_eq!(status.extraction.jobs_without_description, 1);
        assert_eq!(status.total_jobs, 2);

        assert_eq!(status.matching.matches, sweep.succeeded as i64);
        assert_eq!(status.matching.average_score, sweep.average_score);
        assert_eq!(status.matching.mandatory_missing, sweep.mandatory_missing as i64);
        assert_eq!(status.top_users.len(), 2);

        store
            .upsert_match(gopher, uuid::Uuid::new_v4(), 10.0, Utc::now())
            .await
            .expect("extra match");
        let status = collect_status(&handles, 1).await.expect("status");
        assert_eq!(status.top_users.len(), 1);
        assert_eq!(status.top_users[0].user_id, gopher);
        assert_eq!(status.top_users[0].matches, 2);
    }
}
