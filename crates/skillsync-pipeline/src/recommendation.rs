//! Recommendation query and the per-user summary stage built on it.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use skillsync_core::matching::{calculate, JobRequirement, MatchedSkill, MissingSkill};
use skillsync_core::JobSummary;
use skillsync_storage::{JobQuery, RequirementStore, StoreHandles, UserQuery};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub job: JobSummary,
    pub score: i32,
    pub mandatory_missing: bool,
    pub matched_skills: Vec<MatchedSkill>,
    pub missing_skills: Vec<MissingSkill>,
}

#[async_trait]
pub trait Recommender: Send + Sync {
    /// Jobs for `user_id` scoring at least `min_score`, best first.
    async fn recommend(
        &self,
        user_id: Uuid,
        limit: usize,
        min_score: i32,
    ) -> Result<Vec<Recommendation>>;
}

/// `0` means the default; anything above the cap is clamped.
pub fn effective_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LIMIT,
        n => n.min(MAX_LIMIT),
    }
}

/// Scores the most recent active postings on demand with importance-derived requirements.
pub struct EngineRecommender {
    users: Arc<dyn UserQuery>,
    jobs: Arc<dyn JobQuery>,
    requirements: Arc<dyn RequirementStore>,
}

impl EngineRecommender {
    pub fn new(
        users: Arc<dyn UserQuery>,
        jobs: Arc<dyn JobQuery>,
        requirements: Arc<dyn RequirementStore>,
    ) -> Self {
        Self {
            users,
            jobs,
            requirements,
        }
    }

    pub fn from_handles(handles: &StoreHandles) -> Self {
        Self::new(
            handles.users.clone(),
            handles.jobs.clone(),
            handles.requirements.clone(),
        )
    }
}

#[async_trait]
impl Recommender for EngineRecommender {
    async fn recommend(
        &self,
        user_id: Uuid,
        limit: usize,
        min_score: i32,
    ) -> Result<Vec<Recommendation>> {
        let user_skills = self
            .users
            .user_skills_for(&[user_id])
            .await
            .with_context(|| format!("loading skills for user {user_id}"))?
            .remove(&user_id)
            .unwrap_or_default();
        if user_skills.is_empty() {
            return Ok(Vec::new());
        }

        let jobs = self
            .jobs
            .list_recent_active_jobs(effective_limit(limit))
            .await
            .context("listing recent jobs")?;
        let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        let mut requirements = self
            .requirements
            .requirements_for_jobs(&job_ids)
            .await
            .context("loading job requirements")?;

        let mut out: Vec<Recommendation> = jobs
            .into_iter()
            .filter_map(|job| {
                let reqs: Vec<JobRequirement> = requirements
                    .remove(&job.id)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|r| JobRequirement::from_importance(r.skill_id, r.skill_name, r.importance_weight))
                    .collect();
                let result = calculate(&user_skills, &reqs);
                (result.match_score >= min_score).then(|| Recommendation {
                    job,
                    score: result.match_score,
                    mandatory_missing: result.mandatory_missing,
                    matched_skills: result.matched_skills,
                    missing_skills: result.missing_skills,
                })
            })
            .collect();
        out.sort_by(|a, b| b.score.cmp(&a.score));
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecommendationParams {
    pub limit: usize,
    pub min_score: i32,
    pub user_page_size: usize,
}

impl Default for RecommendationParams {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: 0,
            user_page_size: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecommendationSummary {
    pub users: usize,
    pub recommendations: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Runs the recommendation query for every user and logs the counts. Nothing is persisted.
pub struct RecommendationSummaryStage {
    users: Arc<dyn UserQuery>,
    recommender: Arc<dyn Recommender>,
}

impl RecommendationSummaryStage {
    pub fn new(users: Arc<dyn UserQuery>, recommender: Arc<dyn Recommender>) -> Self {
        Self { users, recommender }
    }

    pub async fn run(
        &self,
        cancel: &CancellationToken,
        params: RecommendationParams,
    ) -> Result<RecommendationSummary> {
        let started = Instant::now();
        let page = params.user_page_size.max(1);
        info!(stage = "recommendations", status = "started", "recommendation summary started");

        let mut summary = RecommendationSummary::default();
        let mut offset = 0usize;
        'pages: loop {
            let user_ids = self
                .users
                .list_user_ids(page, offset)
                .await
                .with_context(|| format!("listing users at offset {offset}"))?;
            if user_ids.is_empty() {
                break;
            }
            offset += user_ids.len();

            for user_id in user_ids {
                if cancel.is_cancelled() {
                    break 'pages;
                }
                summary.users += 1;
                match self
                    .recommender
                    .recommend(user_id, params.limit, params.min_score)
                    .await
                {
                    Ok(recommendations) => {
                        summary.recommendations += recommendations.len();
                        info!(
                            stage = "recommendations",
                            user_id = %user_id,
                            count = recommendations.len(),
                            "recommendations computed"
                        );
                    }
                    Err(err) => {
                        summary.failed += 1;
                        warn!(
                            stage = "recommendations",
                            user_id = %user_id,
                            error = %format!("{err:#}"),
                            "recommendation query failed"
                        );
                    }
                }
            }
        }
        summary.cancelled = cancel.is_cancelled();

        info!(
            stage = "recommendations",
            status = "finished",
            users = summary.users,
            recommendations = summary.recommendations,
            failed = summary.failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "recommendation summary finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use skillsync_core::{PostingDraft, SkillRequirement, EXTRACTOR_VERSION};
    use skillsync_storage::{MemoryStore, PostingStore};

    async fn seed_job(store: &MemoryStore, key: &str, skills: &[(Uuid, i32)], age_minutes: i64) -> Uuid {
        let source = store.ensure_source("board", "").await.expect("source");
        store
            .upsert_posting(
                source,
                key,
                &PostingDraft {
                    external_id: Some(key.into()),
                    title: Some(key.into()),
                    ..Default::default()
                },
                Utc::now() - Duration::minutes(age_minutes),
            )
            .await
            .expect("posting");
        let id = store
            .posting_by_key(source, key)
            .map(|p| p.id)
            .expect("posting id");
        let rows: Vec<SkillRequirement> = skills
            .iter()
            .map(|&(skill_id, importance)| SkillRequirement {
                job_id: id,
                skill_id,
                importance_weight: importance,
                required_level: None,
                is_mandatory: None,
                required_years: None,
                source_version: EXTRACTOR_VERSION,
            })
            .collect();
        if !rows.is_empty() {
            store.upsert_requirements(id, &rows).await.expect("requirements");
        }
        id
    }

    #[test]
    fn limit_defaults_and_caps() {
        assert_eq!(effective_limit(0), 20);
        assert_eq!(effective_limit(7), 7);
        assert_eq!(effective_limit(500), 50);
    }

    #[tokio::test]
    async fn ranks_by_score_and_filters_by_min_score() {
        let store = Arc::new(MemoryStore::new());
        let go = store.add_skill("Go");
        let aws = store.add_skill("AWS");
        let perfect = seed_job(&store, "perfect", &[(go, 4)], 3).await;
        let partial = seed_job(&store, "partial", &[(go, 3), (aws, 5)], 2).await;
        let unrelated = seed_job(&store, "unrelated", &[(aws, 5)], 1).await;
        let user = store.add_user(&[(go, 5, 5)]);

        let recommender = EngineRecommender::from_handles(&StoreHandles::from_store(store.clone()));
        let all = recommender.recommend(user, 10, 0).await.expect("recommend");
        let order: Vec<Uuid> = all.iter().map(|r| r.job.id).collect();
        assert_eq!(order, vec![perfect, partial, unrelated]);
        assert!(all.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(all[1].mandatory_missing);

        let filtered = recommender.recommend(user, 10, 50).await.expect("recommend");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].job.id, perfect);
    }

    #[tokio::test]
    async fn user_without_skills_gets_nothing() {
        let store = Arc::new(MemoryStore::new());
        let go = store.add_skill("Go");
        seed_job(&store, "job", &[(go, 3)], 0).await;
        let user = store.add_user(&[]);

        let recommender = EngineRecommender::from_handles(&StoreHandles::from_store(store.clone()));
        assert!(recommender.recommend(user, 10, 0).await.expect("recommend").is_empty());
    }

    struct FlakyRecommender {
        failing: Uuid,
    }

    #[async_trait]
    impl Recommender for FlakyRecommender {
        async fn recommend(&self, user_id: Uuid, _limit: usize, _min: i32) -> Result<Vec<Recommendation>> {
            if user_id == self.failing {
                anyhow::bail!("query timed out");
            }
            Ok(vec![Recommendation {
                job: JobSummary {
                    id: Uuid::new_v4(),
                    title: "Go dev".into(),
                    company: "Acme".into(),
                    location: "Remote".into(),
                },
                score: 80,
                mandatory_missing: false,
                matched_skills: Vec::new(),
                missing_skills: Vec::new(),
            }])
        }
    }

    #[tokio::test]
    async fn stage_counts_per_user_and_continues_past_failures() {
        let store = Arc::new(MemoryStore::new());
        let users: Vec<Uuid> = (0..5).map(|_| store.add_user(&[])).collect();
        let stage = RecommendationSummaryStage::new(
            store.clone(),
            Arc::new(FlakyRecommender { failing: users[2] }),
        );

        let summary = stage
            .run(
                &CancellationToken::new(),
                RecommendationParams {
                    user_page_size: 2,
                    ..Default::default()
                },
            )
            .await
            .expect("stage");
        assert_eq!(summary.users, 5);
        assert_eq!(summary.recommendations, 4);
        assert_eq!(summary.failed, 1);
    }
}
