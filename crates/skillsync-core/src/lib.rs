//! Core domain model for the SkillSync ingestion and matching pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod matching;

pub use matching::{
    calculate, calculate_v2, JobRequirement, MatchResult, MatchedSkill, MissingSkill,
    RequirementSpec, UserSkill,
};

pub const CRATE_NAME: &str = "skillsync-core";

/// Generation of the extraction heuristic stamped on every requirement row it writes.
pub const EXTRACTOR_VERSION: i32 = 2;

/// Candidate posting handed from a source adapter into the ingestion ledger.
///
/// Every text field is optional: adapters hand over whatever the source exposed and the
/// ledger merges it into the stored row without erasing previously captured values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PostingDraft {
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub employment_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub raw_description: Option<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
}

impl PostingDraft {
    /// Trim every text field and collapse blank values to `None`.
    pub fn normalized(self) -> Self {
        Self {
            external_id: non_blank(self.external_id),
            url: non_blank(self.url),
            title: non_blank(self.title),
            company: non_blank(self.company),
            location: non_blank(self.location),
            employment_type: non_blank(self.employment_type),
            description: non_blank(self.description),
            raw_description: non_blank(self.raw_description),
            posted_at: self.posted_at,
            scraped_at: self.scraped_at,
        }
    }

    /// Fill fields this draft lacks from a thinner draft (usually the listing summary).
    pub fn or_from(self, fallback: &PostingDraft) -> Self {
        let this = self.normalized();
        let fallback = fallback.clone().normalized();
        Self {
            external_id: this.external_id.or(fallback.external_id),
            url: this.url.or(fallback.url),
            title: this.title.or(fallback.title),
            company: this.company.or(fallback.company),
            location: this.location.or(fallback.location),
            employment_type: this.employment_type.or(fallback.employment_type),
            description: this.description.or(fallback.description),
            raw_description: this.raw_description.or(fallback.raw_description),
            posted_at: this.posted_at.or(fallback.posted_at),
            scraped_at: this.scraped_at.or(fallback.scraped_at),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Persisted job posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: Uuid,
    pub source_id: Uuid,
    /// Conflict key within the source: the external id, or a hash of the canonical URL.
    pub external_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<String>,
    pub description: Option<String>,
    pub raw_description: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Whether an upsert created a new row or refreshed an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "finished" => Ok(RunStatus::Finished),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// One execution of one source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: Uuid,
    pub source_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry attached to a scrape run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeLog {
    pub id: Uuid,
    pub run_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: Uuid,
    pub name: String,
}

/// Requirement edge `(job, skill)` as written by the extraction stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRequirement {
    pub job_id: Uuid,
    pub skill_id: Uuid,
    /// Importance in `[1, 5]`.
    pub importance_weight: i32,
    pub required_level: Option<i32>,
    pub is_mandatory: Option<bool>,
    pub required_years: Option<i32>,
    pub source_version: i32,
}

/// Text fields of an active posting that still has no requirements.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobForExtraction {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub raw_description: String,
}

/// Short job projection used by the recommendation query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub title: String,
    pub company: String,
    pub location: String,
}

/// Latest persisted score for a `(user, job)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMatch {
    pub user_id: Uuid,
    pub job_id: Uuid,
    pub score: f64,
    pub matched_at: DateTime<Utc>,
}

/// Stored postings of one source and the error count of its most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source: String,
    pub jobs: i64,
    pub active_jobs: i64,
    pub latest_run: Option<RunStatus>,
    pub latest_run_errors: i64,
}

/// Extraction coverage over all stored postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractionStatus {
    pub jobs_with_requirements: i64,
    pub jobs_without_description: i64,
}

/// Aggregates over the persisted job matches.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchingStatus {
    pub matches: i64,
    pub average_score: f64,
    /// Matches whose job has a mandatory requirement the user does not hold.
    pub mandatory_missing: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMatchCount {
    pub user_id: Uuid,
    pub matches: i64,
}
