//! Offline crawler that replays listing pages from a JSON file.

use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skillsync_core::PostingDraft;
use tokio_util::sync::CancellationToken;

use crate::{AdapterError, ListingCrawler, ListingRef};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePage {
    #[serde(default)]
    pub postings: Vec<PostingDraft>,
    /// Replays a listing-page failure with this message.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureFile {
    pub pages: Vec<FixturePage>,
}

impl FixtureFile {
    pub fn single_page(postings: Vec<PostingDraft>) -> Self {
        Self {
            pages: vec![FixturePage {
                postings,
                error: None,
            }],
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixtureCrawler {
    name: String,
    base_url: String,
    file: FixtureFile,
    rate_limit: u32,
}

impl FixtureCrawler {
    pub fn new(name: &str, base_url: &str, file: FixtureFile) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            file,
            rate_limit: 0,
        }
    }

    pub fn from_path(
        name: &str,
        base_url: &str,
        path: impl AsRef<Path>,
    ) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: FixtureFile =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(name, base_url, file))
    }

    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = per_second;
        self
    }
}

#[async_trait]
impl ListingCrawler for FixtureCrawler {
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
        if cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        let index = usize::try_from(page.saturating_sub(1)).unwrap_or(usize::MAX);
        let Some(fixture_page) = self.file.pages.get(index) else {
            return Ok(Vec::new());
        };
        if let Some(message) = &fixture_page.error {
            return Err(AdapterError::Message(message.clone()));
        }
        Ok(fixture_page
            .postings
            .iter()
            .map(|posting| ListingRef {
                detail_url: None,
                summary: posting.clone(),
            })
            .collect())
    }

    async fn fetch_detail(
        &self,
        listing: &ListingRef,
        _cancel: &CancellationToken,
    ) -> Result<PostingDraft, AdapterError> {
        Ok(listing.summary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_pages_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"pages": [{{"postings": [{{"external_id": "x1", "title": "Go dev"}}]}}, {{"error": "boom"}}]}}"#
        )
        .expect("write");

        let crawler = FixtureCrawler::from_path("board", "", file.path()).expect("crawler");
        assert_eq!(crawler.file.pages.len(), 2);
        assert_eq!(
            crawler.file.pages[0].postings[0].external_id.as_deref(),
            Some("x1")
        );
        assert_eq!(crawler.file.pages[1].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn pages_past_the_end_are_empty() {
        let crawler = FixtureCrawler::new("board", "", FixtureFile::default());
        let listings = crawler
            .list_page(3, &CancellationToken::new())
            .await
            .expect("empty page");
        assert!(listings.is_empty());
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = FixtureCrawler::from_path("board", "", "/definitely/not/here.json");
        assert!(matches!(result, Err(AdapterError::Anyhow(_))));
    }
}
