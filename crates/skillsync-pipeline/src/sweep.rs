//! Cross-product match scoring of every user against every requirement-bearing job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use skillsync_core::matching::{calculate_v2, RequirementSpec, UserSkill};
use skillsync_storage::{
    spawn_collector, JobQuery, MatchStore, PoolError, RequirementStore, StoreHandles, UserQuery,
    WorkerPool,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepParams {
    pub workers: usize,
    pub user_page_size: usize,
    pub job_page_size: usize,
}

impl Default for SweepParams {
    fn default() -> Self {
        Self {
            workers: 10,
            user_page_size: 500,
            job_page_size: 1000,
        }
    }
}

impl SweepParams {
    /// Zero fields fall back to the defaults.
    pub fn resolved(self) -> Self {
        let defaults = Self::default();
        let or_default = |value: usize, default: usize| if value == 0 { default } else { value };
        Self {
            workers: or_default(self.workers, defaults.workers),
            user_page_size: or_default(self.user_page_size, defaults.user_page_size),
            job_page_size: or_default(self.job_page_size, defaults.job_page_size),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepSummary {
    pub users: usize,
    pub jobs: usize,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Mean score over the persisted pairs; 0 when nothing was persisted.
    pub average_score: f64,
    /// Persisted pairs whose job has a mandatory skill the user lacks.
    pub mandatory_missing: usize,
    pub cancelled: bool,
}

/// Engine output of one persisted pair.
#[derive(Debug, Clone, Copy)]
struct PairScore {
    score: i32,
    mandatory_missing: bool,
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    score_total: i64,
    mandatory_missing: usize,
}

pub struct MatchingSweep {
    users: Arc<dyn UserQuery>,
    jobs: Arc<dyn JobQuery>,
    requirements: Arc<dyn RequirementStore>,
    matches: Arc<dyn MatchStore>,
}

impl MatchingSweep {
    pub fn new(
        users: Arc<dyn UserQuery>,
        jobs: Arc<dyn JobQuery>,
        requirements: Arc<dyn RequirementStore>,
        matches: Arc<dyn MatchStore>,
    ) -> Self {
        Self {
            users,
            jobs,
            requirements,
            matches,
        }
    }

    pub fn from_handles(handles: &StoreHandles) -> Self {
        Self::new(
            handles.users.clone(),
            handles.jobs.clone(),
            handles.requirements.clone(),
            handles.matches.clone(),
        )
    }

    /// Score and persist every `(user, job)` pair. Per-pair failures are counted, never
    /// propagated; a failed listing query ends the sweep with an error after draining.
    pub async fn run(&self, cancel: &CancellationToken, params: SweepParams) -> Result<SweepSummary> {
        let started = Instant::now();
        let params = params.resolved();
        let user_page = params.user_page_size;
        let job_page = params.job_page_size;
        info!(
            stage = "matching",
            status = "started",
            workers = params.workers,
            "matching sweep started"
        );

        let mut pool = WorkerPool::<PairScore>::new(params.workers, params.workers * 4);
        let results = pool.run(cancel.clone());
        let collector = spawn_collector(results, Tally::default(), |tally, result| match result {
            Ok(pair) => {
                tally.succeeded += 1;
                tally.score_total += i64::from(pair.score);
                tally.mandatory_missing += usize::from(pair.mandatory_missing);
            }
            Err(_) => tally.failed += 1,
        });

        let mut summary = SweepSummary::default();
        let paged = self
            .submit_pairs(&pool, cancel, user_page, job_page, &mut summary)
            .await;
        pool.close();
        let tally = collector
            .await
            .context("joining matching result collector")?;
        summary.succeeded = tally.succeeded;
        summary.failed = tally.failed;
        summary.mandatory_missing = tally.mandatory_missing;
        if tally.succeeded > 0 {
            summary.average_score = tally.score_total as f64 / tally.succeeded as f64;
        }
        summary.cancelled = cancel.is_cancelled();

        info!(
            stage = "matching",
            status = if paged.is_ok() { "finished" } else { "failed" },
            users = summary.users,
            jobs = summary.jobs,
            submitted = summary.submitted,
            failed = summary.failed,
            average_score = summary.average_score,
            mandatory_missing = summary.mandatory_missing,
            cancelled = summary.cancelled,
            duration_ms = started.elapsed().as_millis() as u64,
            "matching sweep finished"
        );
        paged.map(|()| summary)
    }

    async fn submit_pairs(
        &self,
        pool: &WorkerPool<PairScore>,
        cancel: &CancellationToken,
        user_page: usize,
        job_page: usize,
        summary: &mut SweepSummary,
    ) -> Result<()> {
        let mut user_offset = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let user_ids = self
                .users
                .list_user_ids(user_page, user_offset)
                .await
                .with_context(|| format!("listing users at offset {user_offset}"))?;
            if user_ids.is_empty() {
                return Ok(());
            }
            user_offset += user_ids.len();
            summary.users += user_ids.len();

            let skills: Arc<HashMap<Uuid, Vec<UserSkill>>> = Arc::new(
                self.users
                    .user_skills_for(&user_ids)
                    .await
                    .context("loading user skills")?,
            );

            let mut job_offset = 0usize;
            let mut jobs_seen = 0usize;
            loop {
                let job_ids = self
                    .jobs
                    .list_active_job_ids_with_requirements(job_page, job_offset)
                    .await
                    .with_context(|| format!("listing jobs at offset {job_offset}"))?;
                if job_ids.is_empty() {
                    break;
                }
                job_offset += job_ids.len();
                jobs_seen += job_ids.len();

                let requirements: Arc<HashMap<Uuid, Vec<RequirementSpec>>> = Arc::new(
                    self.requirements
                        .requirements_for_jobs(&job_ids)
                        .await
                        .context("loading job requirements")?,
                );

                for &user_id in &user_ids {
                    for &job_id in &job_ids {
                        let skills = skills.clone();
                        let requirements = requirements.clone();
                        let matches = self.matches.clone();
                        let submitted = pool
                            .submit(move |_cancel| async move {
                                let started = Instant::now();
                                let user_skills =
                                    skills.get(&user_id).map(Vec::as_slice).unwrap_or(&[]);
                                let job_requirements =
                                    requirements.get(&job_id).map(Vec::as_slice).unwrap_or(&[]);
                                let result = calculate_v2(user_skills, job_requirements);
                                let pair = PairScore {
                                    score: result.match_score,
                                    mandatory_missing: result.mandatory_missing,
                                };
                                if let Err(err) = matches
                                    .upsert_match(user_id, job_id, f64::from(pair.score), Utc::now())
                                    .await
                                {
                                    warn!(
                                        stage = "matching",
                                        user_id = %user_id,
                                        job_id = %job_id,
                                        error = %err,
                                        "match upsert failed"
                                    );
                                    return Err(anyhow::Error::from(err).context("writing job match"));
                                }
                                debug!(
                                    stage = "matching",
                                    user_id = %user_id,
                                    job_id = %job_id,
                                    match_score = pair.score,
                                    mandatory_missing = pair.mandatory_missing,
                                    duration_ms = started.elapsed().as_millis() as u64,
                                    "match scored"
                                );
                                Ok(pair)
                            })
                            .await;
                        match submitted {
                            Ok(()) => summary.submitted += 1,
                            Err(PoolError::Cancelled) => return Ok(()),
                            Err(err) => return Err(err).context("submitting match task"),
                        }
                    }
                }
            }
            summary.jobs = summary.jobs.max(jobs_seen);
        }
    }
}
