//! Dev.to listings API crawler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use skillsync_core::PostingDraft;
use skillsync_storage::HttpFetcher;
use tokio_util::sync::CancellationToken;

use crate::{AdapterError, ListingCrawler, ListingRef};

const PER_PAGE: u32 = 30;
const DEFAULT_RATE_LIMIT: u32 = 4;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevtoListing {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DevtoListingDetail {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub body_markdown: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DevtoCrawler {
    name: String,
    base_url: String,
    http: HttpFetcher,
    rate_limit: u32,
}

impl DevtoCrawler {
    pub fn new(name: &str, base_url: &str, http: HttpFetcher) -> Self {
        let base_url = match base_url.trim().trim_end_matches('/') {
            "" => "https://dev.to".to_string(),
            other => other.to_string(),
        };
        Self {
            name: name.to_string(),
            base_url,
            http,
            rate_limit: DEFAULT_RATE_LIMIT,
        }
    }

    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = per_second;
        self
    }

    pub fn listings_url(&self, page: u32) -> String {
        format!(
            "{}/api/listings?category=jobs&per_page={PER_PAGE}&page={page}",
            self.base_url
        )
    }

    pub fn detail_url(&self, id: i64) -> String {
        format!("{}/api/listings/{id}", self.base_url)
    }

    pub fn listing_ref(&self, listing: DevtoListing) -> Option<ListingRef> {
        if listing.id == 0 {
            return None;
        }
        let url = pick_non_empty(&listing.url, &self.public_url(&listing));
        Some(ListingRef {
            detail_url: Some(self.detail_url(listing.id)),
            summary: PostingDraft {
                external_id: Some(listing.id.to_string()),
                url: Some(url),
                title: Some(listing.title),
                company: Some(pick_non_empty(&listing.company_name, &listing.organization_name)),
                location: Some(listing.location),
                employment_type: Some(listing.category),
                posted_at: parse_rfc3339(listing.published_at.as_deref()),
                ..Default::default()
            }
            .normalized(),
        })
    }

    fn public_url(&self, listing: &DevtoListing) -> String {
        if listing.slug.trim().is_empty() || listing.category.trim().is_empty() {
            return String::new();
        }
        format!(
            "{}/listings/{}/{}",
            self.base_url,
            listing.category.trim(),
            listing.slug.trim()
        )
    }
}

pub fn draft_from_detail(detail: DevtoListingDetail) -> PostingDraft {
    PostingDraft {
        external_id: (detail.id != 0).then(|| detail.id.to_string()),
        url: Some(detail.url),
        title: Some(detail.title),
        company: Some(pick_non_empty(&detail.company_name, &detail.organization_name)),
        location: Some(detail.location),
        description: Some(detail.body_markdown.clone()),
        raw_description: Some(detail.body_markdown),
        posted_at: parse_rfc3339(detail.published_at.as_deref()),
        ..Default::default()
    }
    .normalized()
}

fn pick_non_empty(preferred: &str, fallback: &str) -> String {
    let preferred = preferred.trim();
    if preferred.is_empty() {
        fallback.trim().to_string()
    } else {
        preferred.to_string()
    }
}

fn parse_rfc3339(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?.trim();
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[async_trait]
impl ListingCrawler for DevtoCrawler {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn rate_limit_per_sec(&self) -> u32 {
        self.rate_limit
    }

    async fn list_page(
        &self,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<ListingRef>, AdapterError> {
        let listings: Vec<DevtoListing> = self
            .http
            .fetch_json(&self.listings_url(page), cancel)
            .await?;
        Ok(listings
            .into_iter()
            .filter_map(|listing| self.listing_ref(listing))
            .collect())
    }

    async fn fetch_detail(
        &self,
        listing: &ListingRef,
        cancel: &CancellationToken,
    ) -> Result<PostingDraft, AdapterError> {
        let Some(url) = listing.detail_url.as_deref() else {
            return Ok(listing.summary.clone());
        };
        let detail: DevtoListingDetail = self.http.fetch_json(url, cancel).await?;
        Ok(draft_from_detail(detail))
    }
}
