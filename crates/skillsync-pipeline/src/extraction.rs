//! Keyword-based skill extraction over postings that have no requirements yet.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use skillsync_core::{JobForExtraction, Skill, SkillRequirement, EXTRACTOR_VERSION};
use skillsync_storage::{spawn_collector, RequirementStore, SkillCatalog, StoreHandles, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MANDATORY_MARKERS: [&str; 8] = [
    "must",
    "required",
    "require",
    "mandatory",
    "need to",
    "needs",
    "minimum",
    "min.",
];

/// Characters inspected on either side of the first mention for mandatory markers.
const MARKER_WINDOW: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionParams {
    pub workers: usize,
    pub batch_limit: usize,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            workers: 5,
            batch_limit: 100,
        }
    }
}

impl ExtractionParams {
    /// Zero fields fall back to the defaults.
    pub fn resolved(self) -> Self {
        let defaults = Self::default();
        Self {
            workers: if self.workers == 0 { defaults.workers } else { self.workers },
            batch_limit: if self.batch_limit == 0 {
                defaults.batch_limit
            } else {
                self.batch_limit
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionSummary {
    pub batches: usize,
    pub processed: usize,
    /// Postings that received at least one requirement.
    pub extracted: usize,
    /// Postings with no catalog skill mentioned.
    pub without_skills: usize,
    pub failed: usize,
    pub requirements: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Written(usize),
    NoSkills,
}

#[derive(Debug, Default)]
struct BatchTally {
    written_jobs: usize,
    requirements: usize,
    without_skills: usize,
    failed: usize,
}

/// Skill hit inside one posting text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillMention {
    pub skill_id: Uuid,
    pub skill_name: String,
    pub count: usize,
    pub near_marker: bool,
}

pub fn importance_for_count(count: usize) -> i32 {
    match count {
        c if c >= 4 => 5,
        3 => 4,
        2 => 3,
        _ => 2,
    }
}

pub fn years_for_level(level: i32) -> i32 {
    match level {
        5 => 3,
        4 => 2,
        3 => 1,
        _ => 0,
    }
}

/// Description, then raw description, then title.
pub fn searchable_text(job: &JobForExtraction) -> &str {
    [&job.description, &job.raw_description, &job.title]
        .into_iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or("")
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric()
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_boundary(text: &str, mut index: usize) -> usize {
    let len = text.len();
    while index < len && !text.is_char_boundary(index) {
        index += 1;
    }
    index.min(len)
}

/// Whole-word occurrences of `needle` in `haystack` (both lowercase) and the byte span
/// of the first one.
pub fn whole_word_mentions(haystack: &str, needle: &str) -> (usize, Option<(usize, usize)>) {
    if needle.is_empty() {
        return (0, None);
    }
    let mut count = 0;
    let mut first = None;
    for (start, matched) in haystack.match_indices(needle) {
        let end = start + matched.len();
        let before_ok = haystack[..start].chars().next_back().map_or(true, |c| !is_word_char(c));
        let after_ok = haystack[end..].chars().next().map_or(true, |c| !is_word_char(c));
        if before_ok && after_ok {
            count += 1;
            first.get_or_insert((start, end));
        }
    }
    (count, first)
}

fn marker_near(haystack: &str, span: (usize, usize)) -> bool {
    let from = floor_boundary(haystack, span.0.saturating_sub(MARKER_WINDOW));
    let to = ceil_boundary(haystack, span.1.saturating_add(MARKER_WINDOW));
    let window = &haystack[from..to];
    MANDATORY_MARKERS.iter().any(|marker| window.contains(marker))
}

/// Catalog skills mentioned in `text`, most mentioned first, ties by name.
pub fn find_mentions(text: &str, catalog: &[Skill]) -> Vec<SkillMention> {
    let haystack = text.to_lowercase();
    let mut mentions: Vec<SkillMention> = catalog
        .iter()
        .filter(|skill| !skill.id.is_nil())
        .filter_map(|skill| {
            let needle = skill.name.trim().to_lowercase();
            let (count, first) = whole_word_mentions(&haystack, &needle);
            let span = first?;
            Some(SkillMention {
                skill_id: skill.id,
                skill_name: skill.name.trim().to_string(),
                count,
                near_marker: marker_near(&haystack, span),
            })
        })
        .collect();

    mentions.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.skill_name.cmp(&b.skill_name))
    });
    let mut seen = HashSet::new();
    mentions.retain(|m| seen.insert(m.skill_id));
    mentions
}

pub fn extract_requirements(job: &JobForExtraction, catalog: &[Skill]) -> Vec<SkillRequirement> {
    find_mentions(searchable_text(job), catalog)
        .into_iter()
        .map(|mention| {
            let level = importance_for_count(mention.count);
            SkillRequirement {
                job_id: job.id,
                skill_id: mention.skill_id,
                importance_weight: level,
                required_level: Some(level),
                is_mandatory: Some(level >= 4 || mention.near_marker),
                required_years: Some(years_for_level(level)),
                source_version: EXTRACTOR_VERSION,
            }
        })
        .collect()
}

pub struct SkillExtractionStage {
    catalog: Arc<dyn SkillCatalog>,
    requirements: Arc<dyn RequirementStore>,
}

impl SkillExtractionStage {
    pub fn new(catalog: Arc<dyn SkillCatalog>, requirements: Arc<dyn RequirementStore>) -> Self {
        Self {
            catalog,
            requirements,
        }
    }

    pub fn from_handles(handles: &StoreHandles) -> Self {
        Self::new(handles.skills.clone(), handles.requirements.clone())
    }

    async fn load_catalog(&self) -> Result<Arc<Vec<Skill>>> {
        let by_name = self
            .catalog
            .load_skills_by_name()
            .await
            .context("loading skill catalog")?;
        let mut skills: Vec<Skill> = by_name
            .into_iter()
            .filter(|(name, id)| !name.trim().is_empty() && !id.is_nil())
            .map(|(name, id)| Skill { id, name })
            .collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Arc::new(skills))
    }

    /// Page through postings lacking requirements until a page comes back empty.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        params: ExtractionParams,
    ) -> Result<ExtractionSummary> {
        let started = Instant::now();
        let params = params.resolved();
        let batch_limit = params.batch_limit;
        let catalog = self.load_catalog().await?;
        info!(
            stage = "extraction",
            status = "started",
            skills = catalog.len(),
            workers = params.workers,
            batch_limit,
            "skill extraction started"
        );

        let mut summary = ExtractionSummary::default();
        let mut offset = 0usize;
        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let jobs = self
                .requirements
                .list_active_jobs_without_requirements(batch_limit, offset)
                .await
                .with_context(|| format!("listing postings without requirements at offset {offset}"))?;
            if jobs.is_empty() {
                break;
            }

            let batch_size = jobs.len();
            let tally = self.run_batch(cancel, params.workers, &catalog, jobs).await?;
            summary.batches += 1;
            summary.processed += batch_size;
            summary.extracted += tally.written_jobs;
            summary.without_skills += tally.without_skills;
            summary.failed += tally.failed;
            summary.requirements += tally.requirements;

            // Postings that got requirements leave the listing; skip past the rest.
            offset += batch_size.saturating_sub(tally.written_jobs);
        }
        summary.cancelled |= cancel.is_cancelled();

        info!(
            stage = "extraction",
            status = "finished",
            batches = summary.batches,
            processed = summary.processed,
            extracted = summary.extracted,
            failed = summary.failed,
            requirements = summary.requirements,
            cancelled = summary.cancelled,
            duration_ms = started.elapsed().as_millis() as u64,
            "skill extraction finished"
        );
        Ok(summary)
    }

    async fn run_batch(
        &self,
        cancel: &CancellationToken,
        workers: usize,
        catalog: &Arc<Vec<Skill>>,
        jobs: Vec<JobForExtraction>,
    ) -> Result<BatchTally> {
        let mut pool = WorkerPool::<JobOutcome>::new(workers, jobs.len());
        let results = pool.run(cancel.clone());
        let collector = spawn_collector(results, BatchTally::default(), |tally, result| {
            match result {
                Ok(JobOutcome::Written(n)) => {
                    tally.written_jobs += 1;
                    tally.requirements += n;
                }
                Ok(JobOutcome::NoSkills) => tally.without_skills += 1,
                Err(_) => tally.failed += 1,
            }
        });

        for job in jobs {
            let catalog = catalog.clone();
            let store = self.requirements.clone();
            let submitted = pool
                .submit(move |_cancel| async move {
                    let started = Instant::now();
                    let requirements = extract_requirements(&job, &catalog);
                    if requirements.is_empty() {
                        debug!(
                            stage = "extraction",
                            job_id = %job.id,
                            skills = 0,
                            "no catalog skills mentioned"
                        );
                        return Ok(JobOutcome::NoSkills);
                    }
                    if let Err(err) = store.upsert_requirements(job.id, &requirements).await {
                        warn!(
                            stage = "extraction",
                            job_id = %job.id,
                            error = %err,
                            "requirement upsert failed"
                        );
                        return Err(anyhow::Error::from(err).context("writing requirements"));
                    }
                    debug!(
                        stage = "extraction",
                        job_id = %job.id,
                        skills = requirements.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "requirements written"
                    );
                    Ok(JobOutcome::Written(requirements.len()))
                })
                .await;
            if let Err(err) = submitted {
                warn!(stage = "extraction", error = %err, "stopping batch submission");
                break;
            }
        }
        pool.close();
        collector.await.context("joining extraction result collector")
    }
}
