//! Postgres-backed store. The unique constraints declared in `migrations/` carry the
//! idempotence of every upsert here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skillsync_core::{
    ExtractionStatus, JobForExtraction, JobSummary, LogLevel, MatchingStatus, PostingDraft,
    RequirementSpec, RunStatus, SkillRequirement, SourceStatus, UpsertOutcome, UserMatchCount,
    UserSkill,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::store::{
    require_id, JobQuery, MatchStore, PostingStore, RequirementStore, RunStore, SkillCatalog,
    StatusQuery, StoreError, StoreResult, UserQuery,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl PostingStore for PgStore {
    async fn ensure_source(&self, name: &str, base_url: &str) -> StoreResult<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO job_sources (id, name, base_url)
            VALUES (gen_random_uuid(), $1, NULLIF($2, ''))
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(base_url)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id FROM job_sources WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn deactivate_all_for_source(&self, source_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET is_active = false, updated_at = NOW() WHERE source_id = $1",
        )
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_posting(
        &self,
        source_id: Uuid,
        conflict_key: &str,
        posting: &PostingDraft,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        require_id(source_id, "source id")?;
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, source_id, external_job_id, url, title, company, location,
                employment_type, description, raw_description, posted_at, scraped_at, is_active
            ) VALUES (
                gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, true
            )
            ON CONFLICT (source_id, external_job_id) DO UPDATE SET
                url = COALESCE(NULLIF(EXCLUDED.url, ''), jobs.url),
                title = COALESCE(NULLIF(EXCLUDED.title, ''), jobs.title),
                company = COALESCE(NULLIF(EXCLUDED.company, ''), jobs.company),
                location = COALESCE(NULLIF(EXCLUDED.location, ''), jobs.location),
                employment_type = COALESCE(NULLIF(EXCLUDED.employment_type, ''), jobs.employment_type),
                description = COALESCE(NULLIF(EXCLUDED.description, ''), jobs.description),
                raw_description = COALESCE(NULLIF(EXCLUDED.raw_description, ''), jobs.raw_description),
                posted_at = COALESCE(EXCLUDED.posted_at, jobs.posted_at),
                scraped_at = EXCLUDED.scraped_at,
                is_active = true,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(source_id)
        .bind(conflict_key)
        .bind(posting.url.as_deref())
        .bind(posting.title.as_deref())
        .bind(posting.company.as_deref())
        .bind(posting.location.as_deref())
        .bind(posting.employment_type.as_deref())
        .bind(posting.description.as_deref())
        .bind(posting.raw_description.as_deref())
        .bind(posting.posted_at)
        .bind(scraped_at)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn start_run(&self, source_id: Uuid) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO scrape_runs (id, source_id, started_at, status) VALUES ($1, $2, NOW(), $3)",
        )
        .bind(id)
        .bind(source_id)
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE scrape_runs SET finished_at = NOW(), status = $2 WHERE id = $1")
                .bind(run_id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "scrape run",
                id: run_id,
            });
        }
        Ok(())
    }

    async fn append_log(&self, run_id: Uuid, level: LogLevel, message: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO scrape_logs (id, scrape_run_id, level, message) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(level.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SkillCatalog for PgStore {
    async fn load_skills_by_name(&self) -> StoreResult<HashMap<String, Uuid>> {
        let rows = sqlx::query("SELECT id, name FROM skills")
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let name = name.trim().to_string();
            if name.is_empty() {
                continue;
            }
            out.insert(name, row.try_get("id")?);
        }
        Ok(out)
    }
}

#[async_trait]
impl RequirementStore for PgStore {
    async fn list_active_jobs_without_requirements(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<JobForExtraction>> {
        let rows = sqlx::query(
            r#"
            SELECT j.id,
                   COALESCE(j.title, '') AS title,
                   COALESCE(j.description, '') AS description,
                   COALESCE(j.raw_description, '') AS raw_description
              FROM jobs j
             WHERE j.is_active
               AND NOT EXISTS (SELECT 1 FROM job_skills js WHERE js.job_id = j.id)
             ORDER BY j.scraped_at DESC, j.id
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(as_i64(limit))
        .bind(as_i64(offset))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(JobForExtraction {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                description: row.try_get("description")?,
                raw_description: row.try_get("raw_description")?,
            });
        }
        Ok(out)
    }

    async fn upsert_requirements(
        &self,
        job_id: Uuid,
        requirements: &[SkillRequirement],
    ) -> StoreResult<()> {
        require_id(job_id, "job id")?;
        if requirements.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for requirement in requirements {
            require_id(requirement.skill_id, "skill id")?;
            sqlx::query(
                r#"
                INSERT INTO job_skills (
                    id, job_id, skill_id, importance_weight, required_level,
                    is_mandatory, required_years, source_version
                ) VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (job_id, skill_id) DO UPDATE SET
                    importance_weight = EXCLUDED.importance_weight,
                    required_level = EXCLUDED.required_level,
                    is_mandatory = EXCLUDED.is_mandatory,
                    required_years = EXCLUDED.required_years,
                    source_version = EXCLUDED.source_version,
                    updated_at = NOW()
                "#,
            )
            .bind(job_id)
            .bind(requirement.skill_id)
            .bind(requirement.importance_weight)
            .bind(requirement.required_level)
            .bind(requirement.is_mandatory)
            .bind(requirement.required_years)
            .bind(requirement.source_version)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn requirements_for_jobs(
        &self,
        job_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, Vec<RequirementSpec>>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT js.job_id, js.skill_id, s.name AS skill_name, js.importance_weight,
                   js.required_level, js.is_mandatory, js.required_years
              FROM job_skills js
              JOIN skills s ON s.id = js.skill_id
             WHERE js.job_id = ANY($1)
             ORDER BY js.job_id, s.name
            "#,
        )
        .bind(job_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<Uuid, Vec<RequirementSpec>> = HashMap::new();
        for row in rows {
            let job_id: Uuid = row.try_get("job_id")?;
            out.entry(job_id).or_default().push(RequirementSpec {
                skill_id: row.try_get("skill_id")?,
                skill_name: row.try_get("skill_name")?,
                importance_weight: row.try_get("importance_weight")?,
                required_level: row.try_get("required_level")?,
                is_mandatory: row.try_get("is_mandatory")?,
                required_years: row.try_get("required_years")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl UserQuery for PgStore {
    async fn list_user_ids(&self, limit: usize, offset: usize) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM users ORDER BY id LIMIT $1 OFFSET $2")
            .bind(as_i64(limit))
            .bind(as_i64(offset))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn user_skills_for(
        &self,
        user_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, Vec<UserSkill>>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT us.user_id, us.skill_id, s.name AS skill_name,
                   us.proficiency_level, us.years_experience
              FROM user_skills us
              JOIN skills s ON s.id = us.skill_id
             WHERE us.user_id = ANY($1)
             ORDER BY us.user_id, s.name
            "#,
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<Uuid, Vec<UserSkill>> = HashMap::new();
        for row in rows {
            let user_id: Uuid = row.try_get("user_id")?;
            out.entry(user_id).or_default().push(UserSkill {
                skill_id: row.try_get("skill_id")?,
                skill_name: row.try_get("skill_name")?,
                proficiency_level: row.try_get("proficiency_level")?,
                years_experience: row.try_get("years_experience")?,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl JobQuery for PgStore {
    async fn list_active_job_ids_with_requirements(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT j.id
              FROM jobs j
             WHERE j.is_active
               AND EXISTS (SELECT 1 FROM job_skills js WHERE js.job_id = j.id)
             ORDER BY j.id
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(as_i64(limit))
        .bind(as_i64(offset))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn list_recent_active_jobs(&self, limit: usize) -> StoreResult<Vec<JobSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id,
                   COALESCE(title, '') AS title,
                   COALESCE(company, '') AS company,
                   COALESCE(location, '') AS location
              FROM jobs
             WHERE is_active
             ORDER BY scraped_at DESC, id
             LIMIT $1
            "#,
        )
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(JobSummary {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                company: row.try_get("company")?,
                location: row.try_get("location")?,
            });
        }
        Ok(out)
    }

    async fn count_jobs(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    async fn count_requirements(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM job_skills")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }
}

#[async_trait]
impl MatchStore for PgStore {
    async fn upsert_match(
        &self,
        user_id: Uuid,
        job_id: Uuid,
        score: f64,
        matched_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        require_id(user_id, "user id")?;
        require_id(job_id, "job id")?;
        sqlx::query(
            r#"
            INSERT INTO job_matches (id, user_id, job_id, match_score, matched_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4)
            ON CONFLICT (user_id, job_id) DO UPDATE SET
                match_score = EXCLUDED.match_score,
                matched_at = EXCLUDED.matched_at
            "#,
        )
        .bind(user_id)
        .bind(job_id)
        .bind(score)
        .bind(matched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusQuery for PgStore {
    async fn source_status(&self) -> StoreResult<Vec<SourceStatus>> {
        let rows = sqlx::query(
            r#"
            SELECT s.name,
                   (SELECT COUNT(*) FROM jobs j WHERE j.source_id = s.id) AS jobs,
                   (SELECT COUNT(*) FROM jobs j WHERE j.source_id = s.id AND j.is_active) AS active_jobs,
                   latest.status AS latest_status,
                   COALESCE((SELECT COUNT(*) FROM scrape_logs sl
                              WHERE sl.scrape_run_id = latest.id AND sl.level = 'error'), 0) AS latest_errors
              FROM job_sources s
              LEFT JOIN LATERAL (
                    SELECT sr.id, sr.status
                      FROM scrape_runs sr
                     WHERE sr.source_id = s.id
                     ORDER BY sr.started_at DESC
                     LIMIT 1
              ) latest ON TRUE
             ORDER BY s.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<SourceStatus> {
                let latest_run = row
                    .try_get::<Option<String>, _>("latest_status")?
                    .map(|status| status.parse::<RunStatus>())
                    .transpose()
                    .map_err(StoreError::InvalidInput)?;
                Ok(SourceStatus {
                    source: row.try_get("name")?,
                    jobs: row.try_get("jobs")?,
                    active_jobs: row.try_get("active_jobs")?,
                    latest_run,
                    latest_run_errors: row.try_get("latest_errors")?,
                })
            })
            .collect()
    }

    async fn extraction_status(&self) -> StoreResult<ExtractionStatus> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(DISTINCT job_id) FROM job_skills) AS with_requirements,
                   (SELECT COUNT(*) FROM jobs
                     WHERE description IS NULL OR BTRIM(description) = '') AS without_description
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(ExtractionStatus {
            jobs_with_requirements: row.try_get("with_requirements")?,
            jobs_without_description: row.try_get("without_description")?,
        })
    }

    async fn matching_status(&self) -> StoreResult<MatchingStatus> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS matches,
                   COALESCE(AVG(jm.match_score), 0)::DOUBLE PRECISION AS average_score,
                   COUNT(*) FILTER (WHERE EXISTS (
                       SELECT 1
                         FROM job_skills js
                        WHERE js.job_id = jm.job_id
                          AND COALESCE(js.is_mandatory, js.importance_weight >= 4)
                          AND NOT EXISTS (
                              SELECT 1 FROM user_skills us
                               WHERE us.user_id = jm.user_id AND us.skill_id = js.skill_id
                          )
                   )) AS mandatory_missing
              FROM job_matches jm
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(MatchingStatus {
            matches: row.try_get("matches")?,
            average_score: row.try_get("average_score")?,
            mandatory_missing: row.try_get("mandatory_missing")?,
        })
    }

    async fn top_matched_users(&self, limit: usize) -> StoreResult<Vec<UserMatchCount>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, COUNT(*) AS matches
              FROM job_matches
             GROUP BY user_id
             ORDER BY matches DESC, user_id
             LIMIT $1
            "#,
        )
        .bind(as_i64(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<UserMatchCount> {
                Ok(UserMatchCount {
                    user_id: row.try_get("user_id")?,
                    matches: row.try_get("matches")?,
                })
            })
            .collect()
    }
}
