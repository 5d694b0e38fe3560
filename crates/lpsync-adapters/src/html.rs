//! Scrapes `(title, date text)` rows out of legacy HTML listing pages.

use std::sync::Arc;

use async_trait::async_trait;
use lpsync_core::{LegacyRecord, SourceConfidence};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Extraction, ExtractionError, FetchError, HttpFetcher, LegacySource};

/// CSS selectors for one listing layout. `title` and `date` are evaluated
/// inside each `item`; without a `date` selector the item's full text is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSelectors {
    pub item: String,
    pub title: String,
    #[serde(default)]
    pub date: Option<String>,
}

impl ListingSelectors {
    pub fn validate(&self) -> Result<(), ExtractionError> {
        parse_selector(&self.item)?;
        parse_selector(&self.title)?;
        if let Some(date) = &self.date {
            parse_selector(date)?;
        }
        Ok(())
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::Parse {
        context: format!("selector {selector:?}"),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn select_first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Parses every item on one page. Items without a title are skipped.
pub fn parse_listing(html: &str, selectors: &ListingSelectors) -> Result<Vec<LegacyRecord>, ExtractionError> {
    let item = parse_selector(&selectors.item)?;
    let title = parse_selector(&selectors.title)?;
    let date = selectors.date.as_deref().map(parse_selector).transpose()?;

    let document = Html::parse_document(html);
    Ok(document
        .select(&item)
        .filter_map(|node| {
            let raw_title = select_first_text(node, &title)?;
            let date_text = match &date {
                Some(date) => select_first_text(node, date),
                None => text_or_none(node.text().collect::<String>()),
            };
            Some(LegacyRecord::new(
                raw_title,
                date_text.unwrap_or_default(),
                SourceConfidence::Text,
            ))
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct HtmlListingSource {
    id: String,
    urls: Vec<String>,
    selectors: ListingSelectors,
    fetcher: Arc<HttpFetcher>,
}

impl HtmlListingSource {
    pub fn new(
        id: impl Into<String>,
        urls: Vec<String>,
        selectors: ListingSelectors,
        fetcher: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            id: id.into(),
            urls,
            selectors,
            fetcher,
        }
    }
}

#[async_trait]
impl LegacySource for HtmlListingSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn extract(&self, run_id: Uuid) -> Result<Extraction, ExtractionError> {
        self.selectors.validate()?;

        // Pages are fetched concurrently; the fetcher's permits bound how many are in flight.
        let mut tasks = JoinSet::new();
        for (index, url) in self.urls.iter().cloned().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            tasks.spawn(async move {
                let page = fetcher.fetch_text(run_id, &url).await;
                (index, url, page)
            });
        }
        let mut pages = Vec::with_capacity(self.urls.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(page) => pages.push(page),
                Err(err) => warn!(%run_id, error = %err, "listing fetch task aborted"),
            }
        }
        pages.sort_by_key(|(index, _, _)| *index);

        let mut extraction = Extraction::default();
        let mut first_failure: Option<ExtractionError> = None;
        let mut succeeded = 0usize;
        for (_, url, page) in pages {
            let parsed = page
                .map_err(ExtractionError::from)
                .and_then(|page| parse_listing(&page.body, &self.selectors));
            match parsed {
                Ok(records) => {
                    succeeded += 1;
                    if records.is_empty() {
                        extraction.warnings.push(format!("{url}: no listing items matched"));
                    }
                    extraction.records.extend(records);
                }
                Err(err) => {
                    warn!(%run_id, url = %url, error = %err, "listing page skipped");
                    extraction.warnings.push(format!("{url}: {err}"));
                    first_failure.get_or_insert(err);
                }
            }
        }

        if succeeded == 0 && !self.urls.is_empty() {
            return Err(first_failure.unwrap_or(ExtractionError::Fetch(FetchError::Closed)));
        }
        info!(
            %run_id,
            source = %self.id,
            pages = succeeded,
            records = extraction.records.len(),
            warnings = extraction.warnings.len(),
            "listing extracted"
        );
        Ok(extraction)
    }
}
