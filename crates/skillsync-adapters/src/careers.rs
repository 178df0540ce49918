//! Generic company careers page crawler driven by CSS selectors.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use skillsync_core::PostingDraft;
use skillsync_storage::HttpFetcher;
use tokio_util::sync::CancellationToken;

use crate::{AdapterError, ListingCrawler, ListingRef};

const PAGE_PLACEHOLDER: &str = "{page}";
const DEFAULT_RATE_LIMIT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CareersTarget {
    pub name: String,
    pub base_url: String,
    /// Listing page; `{page}` is replaced by the page number when present.
    pub listing_url: String,
    pub link_selector: Option<String>,
    pub title_selector: Option<String>,
    pub location_selector: Option<String>,
    pub detail_body_selector: Option<String>,
}

#[derive(Debug, Clone)]
struct Selectors {
    link: String,
    title: String,
    location: Option<String>,
    body: String,
}

#[derive(Debug, Clone)]
pub struct CareersPageCrawler {
    name: String,
    base_url: String,
    listing_url: String,
    selectors: Selectors,
    http: HttpFetcher,
    rate_limit: u32,
}

fn selector_or(value: &Option<String>, default: &str) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Parse(format!("invalid selector {selector:?}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).find_map(element_text)
}

impl CareersPageCrawler {
    pub fn new(target: CareersTarget, http: HttpFetcher) -> Self {
        let base_url = if target.base_url.trim().is_empty() {
            target.listing_url.clone()
        } else {
            target.base_url.clone()
        };
        Self {
            selectors: Selectors {
                link: selector_or(&target.link_selector, "a"),
                title: selector_or(&target.title_selector, "title"),
                location: target
                    .location_selector
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                body: selector_or(&target.detail_body_selector, "body"),
            },
            name: target.name,
            base_url,
            listing_url: target.listing_url,
            http,
            rate_limit: DEFAULT_RATE_LIMIT,
        }
    }

    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = per_second;
        self
    }

    /// URL of the given listing page; `None` past page 1 when the listing is not paginated.
    pub fn page_url(&self, page: u32) -> Option<String> {
        if self.listing_url.contains(PAGE_PLACEHOLDER) {
            Some(self.listing_url.replace(PAGE_PLACEHOLDER, &page.to_string()))
        } else {
            (page == 1).then(|| self.listing_url.clone())
        }
    }

    /// Collect unique absolute http(s) links matched by the link selector.
    pub fn parse_listing(&self, html: &str, page_url: &str) -> Result<Vec<ListingRef>, AdapterError> {
        let base = Url::parse(page_url)
            .map_err(|e| AdapterError::Parse(format!("invalid listing url {page_url}: {e}")))?;
        let link = parse_selector(&self.selectors.link)?;
        let title = parse_selector(&self.selectors.title)?;
        let location = self
            .selectors
            .location
            .as_deref()
            .map(parse_selector)
            .transpose()?;

        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for anchor in document.select(&link) {
            let Some(href) = anchor.value().attr("href").map(str::trim) else {
                continue;
            };
            if href.is_empty() || href.starts_with('#') {
                continue;
            }
            let Ok(mut absolute) = base.join(href) else {
                continue;
            };
            if !matches!(absolute.scheme(), "http" | "https") {
                continue;
            }
            absolute.set_fragment(None);
            let absolute = absolute.to_string();
            if !seen.insert(absolute.clone()) {
                continue;
            }

            let listing_title = first_text(anchor, &title).or_else(|| element_text(anchor));
            let listing_location = location.as_ref().and_then(|sel| first_text(anchor, sel));
            out.push(ListingRef {
                detail_url: Some(absolute.clone()),
                summary: PostingDraft {
                    url: Some(absolute),
                    title: listing_title,
                    company: Some(self.name.clone()),
                    location: listing_location,
                    ..Default::default()
                },
            });
        }
        Ok(out)
    }

    pub fn parse_detail(&self, html: &str, url: &str) -> Result<PostingDraft, AdapterError> {
        let title = parse_selector(&self.selectors.title)?;
        let body = parse_selector(&self.selectors.body)?;
        let location = self
            .selectors
            .location
            .as_deref()
            .map(parse_selector)
            .transpose()?;

        let document = Html::parse_document(html);
        let root = document.root_element();
        let description = first_text(root, &body);
        Ok(PostingDraft {
            url: Some(url.to_string()),
            title: first_text(root, &title),
            company: Some(self.name.clone()),
            location: location.as_ref().and_then(|sel| first_text(root, sel)),
            description: description.clone(),
            raw_description: description,
            ..Default::default()
        }
        .normalized())
    }
}

#[async_trait]
impl ListingCrawler for CareersPageCrawler {
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
        let Some(url) = self.page_url(page) else {
            return Ok(Vec::new());
        };
        let response = self.http.fetch_bytes(&url, cancel).await?;
        self.parse_listing(&response.text(), &response.final_url)
    }

    async fn fetch_detail(
        &self,
        listing: &ListingRef,
        cancel: &CancellationToken,
    ) -> Result<PostingDraft, AdapterError> {
        let Some(url) = listing.detail_url.as_deref() else {
            return Ok(listing.summary.clone());
        };
        let html = self.http.fetch_text(url, cancel).await?;
        self.parse_detail(&html, url)
    }
}
