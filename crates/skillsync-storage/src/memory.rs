//! In-process store used by tests and offline fixture runs.
//!
//! Mirrors the uniqueness constraints of the relational schema so idempotence can be
//! exercised without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skillsync_core::{
    ExtractionStatus, JobForExtraction, JobMatch, JobPosting, JobSummary, LogLevel,
    MatchingStatus, PostingDraft, RequirementSpec, RunStatus, ScrapeLog, ScrapeRun, Skill,
    SkillRequirement, SourceStatus, UpsertOutcome, UserMatchCount, UserSkill,
};
use uuid::Uuid;

use crate::store::{
    require_id, JobQuery, MatchStore, PostingStore, RequirementStore, RunStore, SkillCatalog,
    StatusQuery, StoreError, StoreResult, UserQuery,
};

#[derive(Debug, Clone)]
struct SourceRow {
    id: Uuid,
    name: String,
}

#[derive(Debug, Default)]
struct State {
    sources: Vec<SourceRow>,
    postings: Vec<JobPosting>,
    runs: HashMap<Uuid, ScrapeRun>,
    logs: Vec<ScrapeLog>,
    skills: Vec<Skill>,
    requirements: Vec<SkillRequirement>,
    users: Vec<Uuid>,
    user_skills: HashMap<Uuid, Vec<UserSkill>>,
    matches: HashMap<(Uuid, Uuid), JobMatch>,
    failing_match_jobs: HashSet<Uuid>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_skill(&self, name: &str) -> Uuid {
        let mut state = self.state();
        if let Some(skill) = state.skills.iter().find(|s| s.name == name) {
            return skill.id;
        }
        let id = Uuid::new_v4();
        state.skills.push(Skill {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Register a user with `(skill_id, proficiency, years)` entries.
    pub fn add_user(&self, skills: &[(Uuid, i32, i32)]) -> Uuid {
        let mut state = self.state();
        let id = Uuid::new_v4();
        let names: HashMap<Uuid, String> = state
            .skills
            .iter()
            .map(|s| (s.id, s.name.clone()))
            .collect();
        let entries = skills
            .iter()
            .map(|&(skill_id, proficiency_level, years_experience)| UserSkill {
                skill_id,
                skill_name: names.get(&skill_id).cloned().unwrap_or_default(),
                proficiency_level,
                years_experience,
            })
            .collect();
        state.users.push(id);
        state.user_skills.insert(id, entries);
        id
    }

    /// Make every `upsert_match` for this job fail.
    pub fn fail_matches_for_job(&self, job_id: Uuid) {
        self.state().failing_match_jobs.insert(job_id);
    }

    pub fn postings_for_source(&self, source_id: Uuid) -> Vec<JobPosting> {
        self.state()
            .postings
            .iter()
            .filter(|p| p.source_id == source_id)
            .cloned()
            .collect()
    }

    pub fn posting_by_key(&self, source_id: Uuid, external_id: &str) -> Option<JobPosting> {
        self.state()
            .postings
            .iter()
            .find(|p| p.source_id == source_id && p.external_id == external_id)
            .cloned()
    }

    pub fn source_id(&self, name: &str) -> Option<Uuid> {
        self.state()
            .sources
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.id)
    }

    pub fn run(&self, run_id: Uuid) -> Option<ScrapeRun> {
        self.state().runs.get(&run_id).cloned()
    }

    pub fn runs_for_source(&self, source_id: Uuid) -> Vec<ScrapeRun> {
        let mut runs: Vec<_> = self
            .state()
            .runs
            .values()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    pub fn logs_for_run(&self, run_id: Uuid) -> Vec<ScrapeLog> {
        self.state()
            .logs
            .iter()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn requirements_for(&self, job_id: Uuid) -> Vec<SkillRequirement> {
        self.state()
            .requirements
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn job_match(&self, user_id: Uuid, job_id: Uuid) -> Option<JobMatch> {
        self.state().matches.get(&(user_id, job_id)).cloned()
    }

    pub fn match_count(&self) -> usize {
        self.state().matches.len()
    }
}

fn merge(target: &mut Option<String>, incoming: &Option<String>) {
    if let Some(value) = incoming.as_ref().filter(|v| !v.trim().is_empty()) {
        *target = Some(value.clone());
    }
}

#[async_trait]
impl PostingStore for MemoryStore {
    async fn ensure_source(&self, name: &str, _base_url: &str) -> StoreResult<Uuid> {
        let mut state = self.state();
        if let Some(source) = state.sources.iter().find(|s| s.name == name) {
            return Ok(source.id);
        }
        let id = Uuid::new_v4();
        state.sources.push(SourceRow {
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn deactivate_all_for_source(&self, source_id: Uuid) -> StoreResult<u64> {
        let mut state = self.state();
        let mut touched = 0;
        for posting in state.postings.iter_mut().filter(|p| p.source_id == source_id) {
            posting.is_active = false;
            touched += 1;
        }
        Ok(touched)
    }

    async fn upsert_posting(
        &self,
        source_id: Uuid,
        conflict_key: &str,
        posting: &PostingDraft,
        scraped_at: DateTime<Utc>,
    ) -> StoreResult<UpsertOutcome> {
        require_id(source_id, "source id")?;
        let mut state = self.state();
        if !state.sources.iter().any(|s| s.id == source_id) {
            return Err(StoreError::NotFound {
                entity: "job source",
                id: source_id,
            });
        }

        if let Some(index) = state
            .postings
            .iter()
            .position(|p| p.source_id == source_id && p.external_id == conflict_key)
        {
            let existing = &mut state.postings[index];
            merge(&mut existing.url, &posting.url);
            merge(&mut existing.title, &posting.title);
            merge(&mut existing.company, &posting.company);
            merge(&mut existing.location, &posting.location);
            merge(&mut existing.employment_type, &posting.employment_type);
            merge(&mut existing.description, &posting.description);
            merge(&mut existing.raw_description, &posting.raw_description);
            if posting.posted_at.is_some() {
                existing.posted_at = posting.posted_at;
            }
            existing.scraped_at = scraped_at;
            existing.is_active = true;
            return Ok(UpsertOutcome::Updated);
        }

        state.postings.push(JobPosting {
            id: Uuid::new_v4(),
            source_id,
            external_id: conflict_key.to_string(),
            url: posting.url.clone(),
            title: posting.title.clone(),
            company: posting.company.clone(),
            location: posting.location.clone(),
            employment_type: posting.employment_type.clone(),
            description: posting.description.clone(),
            raw_description: posting.raw_description.clone(),
            posted_at: posting.posted_at,
            scraped_at,
            is_active: true,
        });
        Ok(UpsertOutcome::Inserted)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn start_run(&self, source_id: Uuid) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        self.state().runs.insert(
            id,
            ScrapeRun {
                id,
                source_id,
                started_at: Utc::now(),
                finished_at: None,
                status: RunStatus::Running,
            },
        );
        Ok(id)
    }

    async fn finish_run(&self, run_id: Uuid, status: RunStatus) -> StoreResult<()> {
        let mut state = self.state();
        let run = state.runs.get_mut(&run_id).ok_or(StoreError::NotFound {
            entity: "scrape run",
            id: run_id,
        })?;
        run.finished_at = Some(Utc::now());
        run.status = status;
        Ok(())
    }

    async fn append_log(&self, run_id: Uuid, level: LogLevel, message: &str) -> StoreResult<()> {
        self.state().logs.push(ScrapeLog {
            id: Uuid::new_v4(),
            run_id,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl SkillCatalog for MemoryStore {
    async fn load_skills_by_name(&self) -> StoreResult<HashMap<String, Uuid>> {
        Ok(self
            .state()
            .skills
            .iter()
            .map(|s| (s.name.clone(), s.id))
            .collect())
    }
}

#[async_trait]
impl RequirementStore for MemoryStore {
    async fn list_active_jobs_without_requirements(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<JobForExtraction>> {
        let state = self.state();
        let with_requirements: HashSet<Uuid> =
            state.requirements.iter().map(|r| r.job_id).collect();
        let mut candidates: Vec<&JobPosting> = state
            .postings
            .iter()
            .filter(|p| p.is_active && !with_requirements.contains(&p.id))
            .collect();
        candidates.sort_by(|a, b| b.scraped_at.cmp(&a.scraped_at).then(a.id.cmp(&b.id)));
        Ok(candidates
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|p| JobForExtraction {
                id: p.id,
                title: p.title.clone().unwrap_or_default(),
                description: p.description.clone().unwrap_or_default(),
                raw_description: p.raw_description.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn upsert_requirements(
        &self,
        job_id: Uuid,
        requirements: &[SkillRequirement],
    ) -> StoreResult<()> {
        require_id(job_id, "job id")?;
        let mut state = self.state();
        for requirement in requirements {
            require_id(requirement.skill_id, "skill id")?;
            let row = SkillRequirement {
                job_id,
                ..requirement.clone()
            };
            match state
                .requirements
                .iter()
                .position(|r| r.job_id == job_id && r.skill_id == requirement.skill_id)
            {
                Some(index) => state.requirements[index] = row,
                None => state.requirements.push(row),
            }
        }
        Ok(())
    }

    async fn requirements_for_jobs(
        &self,
        job_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, Vec<RequirementSpec>>> {
        let state = self.state();
        let wanted: HashSet<&Uuid> = job_ids.iter().collect();
        let names: HashMap<Uuid, &str> = state
            .skills
            .iter()
            .map(|s| (s.id, s.name.as_str()))
            .collect();
        let mut out: HashMap<Uuid, Vec<RequirementSpec>> = HashMap::new();
        for requirement in state.requirements.iter().filter(|r| wanted.contains(&r.job_id)) {
            out.entry(requirement.job_id)
                .or_default()
                .push(RequirementSpec {
                    skill_id: requirement.skill_id,
                    skill_name: names
                        .get(&requirement.skill_id)
                        .map(|n| n.to_string())
                        .unwrap_or_default(),
                    importance_weight: requirement.importance_weight,
                    required_level: requirement.required_level,
                    is_mandatory: requirement.is_mandatory,
                    required_years: requirement.required_years,
                });
        }
        Ok(out)
    }
}

#[async_trait]
impl UserQuery for MemoryStore {
    async fn list_user_ids(&self, limit: usize, offset: usize) -> StoreResult<Vec<Uuid>> {
        let mut ids = self.state().users.clone();
        ids.sort();
        Ok(ids.into_iter().skip(offset).take(limit).collect())
    }

    async fn user_skills_for(
        &self,
        user_ids: &[Uuid],
    ) -> StoreResult<HashMap<Uuid, Vec<UserSkill>>> {
        let state = self.state();
        Ok(user_ids
            .iter()
            .filter_map(|id| state.user_skills.get(id).map(|s| (*id, s.clone())))
            .collect())
    }
}

#[async_trait]
impl JobQuery for MemoryStore {
    async fn list_active_job_ids_with_requirements(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<Uuid>> {
        let state = self.state();
        let with_requirements: HashSet<Uuid> =
            state.requirements.iter().map(|r| r.job_id).collect();
        let mut ids: Vec<Uuid> = state
            .postings
            .iter()
            .filter(|p| p.is_active && with_requirements.contains(&p.id))
            .map(|p| p.id)
            .collect();
        ids.sort();
        Ok(ids.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_recent_active_jobs(&self, limit: usize) -> StoreResult<Vec<JobSummary>> {
        let state = self.state();
        let mut active: Vec<&JobPosting> = state.postings.iter().filter(|p| p.is_active).collect();
        active.sort_by(|a, b| b.scraped_at.cmp(&a.scraped_at).then(a.id.cmp(&b.id)));
        Ok(active
            .into_iter()
            .take(limit)
            .map(|p| JobSummary {
                id: p.id,
                title: p.title.clone().unwrap_or_default(),
                company: p.company.clone().unwrap_or_default(),
                location: p.location.clone().unwrap_or_default(),
            })
            .collect())
    }

    async fn count_jobs(&self) -> StoreResult<i64> {
        Ok(self.state().postings.len() as i64)
    }

    async fn count_requirements(&self) -> StoreResult<i64> {
        Ok(self.state().requirements.len() as i64)
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn upsert_match(
        &self,
        user_id: Uuid,
        job_id: Uuid,
        score: f64,
        matched_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        require_id(user_id, "user id")?;
        require_id(job_id, "job id")?;
        let mut state = self.state();
        if state.failing_match_jobs.contains(&job_id) {
            return Err(StoreError::InvalidInput(format!(
                "match writes rejected for job {job_id}"
            )));
        }
        state.matches.insert(
            (user_id, job_id),
            JobMatch {
                user_id,
                job_id,
                score,
                matched_at,
            },
        );
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

#[async_trait]
impl StatusQuery for MemoryStore {
    async fn source_status(&self) -> StoreResult<Vec<SourceStatus>> {
        let state = self.state();
        let mut out: Vec<SourceStatus> = state
            .sources
            .iter()
            .map(|source| {
                let postings = state.postings.iter().filter(|p| p.source_id == source.id);
                let latest = state
                    .runs
                    .values()
                    .filter(|r| r.source_id == source.id)
                    .max_by_key(|r| r.started_at);
                SourceStatus {
                    source: source.name.clone(),
                    jobs: postings.clone().count() as i64,
                    active_jobs: postings.filter(|p| p.is_active).count() as i64,
                    latest_run: latest.map(|r| r.status),
                    latest_run_errors: latest.map_or(0, |run| {
                        state
                            .logs
                            .iter()
                            .filter(|l| l.run_id == run.id && l.level == LogLevel::Error)
                            .count() as i64
                    }),
                }
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(out)
    }

    async fn extraction_status(&self) -> StoreResult<ExtractionStatus> {
        let state = self.state();
        let with_requirements: HashSet<Uuid> =
            state.requirements.iter().map(|r| r.job_id).collect();
        Ok(ExtractionStatus {
            jobs_with_requirements: with_requirements.len() as i64,
            jobs_without_description: state
                .postings
                .iter()
                .filter(|p| is_blank(&p.description))
                .count() as i64,
        })
    }

    async fn matching_status(&self) -> StoreResult<MatchingStatus> {
        let state = self.state();
        let matches = state.matches.len() as i64;
        let average_score = if matches == 0 {
            0.0
        } else {
            state.matches.values().map(|m| m.score).sum::<f64>() / matches as f64
        };
        let mandatory_missing = state
            .matches
            .values()
            .filter(|m| {
                let held: HashSet<Uuid> = state
                    .user_skills
                    .get(&m.user_id)
                    .map(|skills| skills.iter().map(|s| s.skill_id).collect())
                    .unwrap_or_default();
                state.requirements.iter().any(|r| {
                    r.job_id == m.job_id
                        && r.is_mandatory.unwrap_or(r.importance_weight >= 4)
                        && !held.contains(&r.skill_id)
                })
            })
            .count() as i64;
        Ok(MatchingStatus {
            matches,
            average_score,
            mandatory_missing,
        })
    }

    async fn top_matched_users(&self, limit: usize) -> StoreResult<Vec<UserMatchCount>> {
        let state = self.state();
        let mut counts: HashMap<Uuid, i64> = HashMap::new();
        for m in state.matches.values() {
            *counts.entry(m.user_id).or_default() += 1;
        }
        let mut out: Vec<UserMatchCount> = counts
            .into_iter()
            .map(|(user_id, matches)| UserMatchCount { user_id, matches })
            .collect();
        out.sort_by(|a, b| b.matches.cmp(&a.matches).then(a.user_id.cmp(&b.user_id)));
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillsync_core::EXTRACTOR_VERSION;

    #[tokio::test]
    async fn requirement_upsert_overwrites_by_job_and_skill() {
        let store = MemoryStore::new();
        let source = store.ensure_source("acme", "").await.expect("source");
        store
            .upsert_posting(source, "1", &PostingDraft::default(), Utc::now())
            .await
            .expect("posting");
        let job = store.posting_by_key(source, "1").expect("job").id;
        let go = store.add_skill("Go");

        let first = SkillRequirement {
            job_id: job,
            skill_id: go,
            importance_weight: 2,
            required_level: Some(2),
            is_mandatory: Some(false),
            required_years: Some(0),
            source_version: EXTRACTOR_VERSION,
        };
        store.upsert_requirements(job, &[first.clone()]).await.expect("first");
        store
            .upsert_requirements(
                job,
                &[SkillRequirement {
                    importance_weight: 5,
                    ..first
                }],
            )
            .await
            .expect("second");

        let rows = store.requirements_for(job);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].importance_weight, 5);

        let specs = store.requirements_for_jobs(&[job]).await.expect("specs");
        assert_eq!(specs[&job][0].skill_name, "Go");
        assert!(store
            .list_active_jobs_without_requirements(10, 0)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn latest_match_score_wins() {
        let store = MemoryStore::new();
        let user = store.add_user(&[]);
        let job = Uuid::new_v4();
        store.upsert_match(user, job, 40.0, Utc::now()).await.expect("first");
        store.upsert_match(user, job, 75.0, Utc::now()).await.expect("second");
        assert_eq!(store.match_count(), 1);
        assert_eq!(store.job_match(user, job).map(|m| m.score), Some(75.0));
    }

    #[tokio::test]
    async fn status_aggregates_reflect_latest_run_and_matches() {
        let store = MemoryStore::new();
        let source = store.ensure_source("board", "").await.expect("source");
        for (key, description) in [("1", "Go services"), ("2", "  ")] {
            store
                .upsert_posting(
                    source,
                    key,
                    &PostingDraft {
                        description: Some(description.into()),
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .await
                .expect("posting");
        }
        let old_run = store.start_run(source).await.expect("run");
        store.append_log(old_run, LogLevel::Error, "old").await.expect("log");
        store.finish_run(old_run, RunStatus::Error).await.expect("finish");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let new_run = store.start_run(source).await.expect("run");
        store.append_log(new_run, LogLevel::Error, "boom").await.expect("log");
        store.append_log(new_run, LogLevel::Warn, "meh").await.expect("log");
        store.finish_run(new_run, RunStatus::Finished).await.expect("finish");

        let sources = store.source_status().await.expect("sources");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].jobs, 2);
        assert_eq!(sources[0].latest_run, Some(RunStatus::Finished));
        assert_eq!(sources[0].latest_run_errors, 1);

        let go = store.add_skill("Go");
        let aws = store.add_skill("AWS");
        let job = store.posting_by_key(source, "1").expect("job").id;
        let requirement = |skill_id, importance| SkillRequirement {
            job_id: job,
            skill_id,
            importance_weight: importance,
            required_level: None,
            is_mandatory: None,
            required_years: None,
            source_version: EXTRACTOR_VERSION,
        };
        store
            .upsert_requirements(job, &[requirement(go, 4), requirement(aws, 2)])
            .await
            .expect("requirements");
        let extraction = store.extraction_status().await.expect("extraction");
        assert_eq!(extraction.jobs_with_requirements, 1);
        assert_eq!(extraction.jobs_without_description, 1);

        let gopher = store.add_user(&[(go, 4, 2)]);
        let stranger = store.add_user(&[(aws, 4, 2)]);
        store.upsert_match(gopher, job, 80.0, Utc::now()).await.expect("match");
        store.upsert_match(stranger, job, 20.0, Utc::now()).await.expect("match");
        let matching = store.matching_status().await.expect("matching");
        assert_eq!(matching.matches, 2);
        assert_eq!(matching.average_score, 50.0);
        assert_eq!(matching.mandatory_missing, 1);

        let top = store.top_matched_users(1).await.expect("top users");
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].matches, 1);
    }
}
