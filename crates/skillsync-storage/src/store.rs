//! Capability traits over the persistence layer.
//!
//! Each pipeline component depends only on the capabilities it uses. `PgStore` and
//! `MemoryStore` implement all of them; [`StoreHandles`] fans one concrete store out
//! into the individual trait objects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skillsync_core::{
    ExtractionStatus, JobForExtraction, JobSummary, LogLevel, MatchingStatus, PostingDraft,
    RequirementSpec, RunStatus, SkillRequirement, SourceStatus, UpsertOutcome, UserMatchCount,
    UserSkill,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn require_id(id: Uuid, what: &str) -> StoreResult<()> {
    if id.is_nil() {
        return Err(StoreError::InvalidInput(format!("nil {what}")));
    }
    Ok(())
}

#[async_trait]
pub trait PostingStore: Send + Sync {
    /// Insert-or-select on the unique source name.
    async fn ensure_source(&self, name: &str, base_url: &str) -> StoreResult<Uuid>;

    /// Mark every posting of the source inactive; returns the number of rows touched.
    async fn deactivate_all_for_source(&self, source_id: Uuid) -> StoreResult<u64>;

    /// Upsert keyed by `(source_id, conflict_key)`. Blank incoming fields never erase
    /// stored values and the row always ends up active.
    async fn upsert_posting(
        &self,
        source_id: Uuid,
        conflict_key: &str,
        posting: &PostingDraft,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn start_run(&self, source_id: Uuid) -> StoreResult<Uuid>;
    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> StoreResult<()>;
    async fn append_log(&self, run_id: Uuid, level: LogLevel, message: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait SkillCatalog: Send + Sync {
    async fn load_skills_by_name(&self) -> StoreResult<HashMap<String, Uuid>>;
}

#[async_trait]
pub trait RequirementStore: Send + Sync {
    /// Active postings with no requirement rows, newest scrape first.
    async fn list_active_jobs_without_requirements(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<JobForExtraction>>;

    /// Upsert per `(job_id, skill_id)` in one transaction.
    async fn upsert_requirements(
        &self,
        job_id: Uuid,
        requirements: &[SkillRequirement],
    ) -> StoreResult<()>;

    async fn requirements_for_jobs(
        &self,
        job_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, Vec<RequirementSpec>>>;
}

#[async_trait]
pub trait UserQuery: Send + Sync {
    async fn list_user_ids(&self, limit: usize, offset: usize) -> StoreResult<Vec<Uuid>>;
    async fn user_skills_for(
        &self,
        user_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, Vec<UserSkill>>>;
}

#[async_trait]
pub trait JobQuery: Send + Sync {
    async fn list_active_job_ids_with_requirements(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Uuid>>;
    async fn list_recent_active_jobs(&self, limit: usize) -> StoreResult<Vec<JobSummary>>;
    async fn count_jobs(&self) -> StoreResult<i64>;
    async fn count_requirements(&self) -> StoreResult<i64>;
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Latest score wins for a `(user_id, job_id)` pair.
    async fn upsert_match(
        &self,
        user_id: Uuid,
        job_id: Uuid,
        score: f64,
        matched_at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Read-only aggregates for operator status reports.
#[async_trait]
pub trait StatusQuery: Send + Sync {
    /// One row per source, ordered by name.
    async fn source_status(&self) -> StoreResult<Vec<SourceStatus>>;
    async fn extraction_status(&self) -> StoreResult<ExtractionStatus>;
    /// A requirement counts as mandatory by its explicit flag, else by importance `>= 4`.
    async fn matching_status(&self) -> StoreResult<MatchingStatus>;
    /// Users with the most persisted matches, most first.
    async fn top_matched_users(&self, limit: usize) -> StoreResult<Vec<UserMatchCount>>;
}

pub trait Store:
    PostingStore
    + RunStore
    + SkillCatalog
    + RequirementStore
    + UserQuery
    + JobQuery
    + MatchStore
    + StatusQuery
{
}

impl<T> Store for T where
    T: PostingStore
        + RunStore
        + SkillCatalog
        + RequirementStore
        + UserQuery
        + JobQuery
        + MatchStore
        + StatusQuery
{
}

#[derive(Clone)]
pub struct StoreHandles {
    pub postings: Arc<dyn PostingStore>,
    pub runs: Arc<dyn RunStore>,
    pub skills: Arc<dyn SkillCatalog>,
    pub requirements: Arc<dyn RequirementStore>,
    pub users: Arc<dyn UserQuery>,
    pub jobs: Arc<dyn JobQuery>,
    pub matches: Arc<dyn MatchStore>,
    pub status: Arc<dyn StatusQuery>,
}

impl StoreHandles {
    pub fn from_store<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            postings: store.clone(),
            runs: store.clone(),
            skills: store.clone(),
            requirements: store.clone(),
            users: store.clone(),
            jobs: store.clone(),
            matches: store.clone(),
            status: store,
        }
    }
}
