//! Extraction collaborator boundary: anything that yields legacy `(title, date text, confidence)` rows.

pub mod fetch;
pub mod fixture;
pub mod html;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lpsync_core::LegacyRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use fetch::{host_key, BackoffPolicy, FetchError, FetchedPage, HttpClientConfig, HttpFetcher};
pub use fixture::{load_handoff_bundle, HandoffBundle, JsonHandoffSource};
pub use html::{parse_listing, HtmlListingSource, ListingSelectors};

pub const CRATE_NAME: &str = "lpsync-adapters";

/// Records handed to the orchestrator plus the non-fatal problems met on the way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub records: Vec<LegacyRecord>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parsing {context}: {message}")]
    Parse { context: String, message: String },
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait LegacySource: Send + Sync {
    fn source_id(&self) -> &str;

    /// One extraction pass. Partial input is returned with warnings; only a
    /// source that produced nothing usable is an error.
    async fn extract(&self, run_id: Uuid) -> Result<Extraction, ExtractionError>;
}

/// Where a run's legacy rows come from, as written in `lpsync.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Output of a manual or OCR step, saved as JSON.
    JsonHandoff { path: PathBuf },
    HtmlListing {
        #[serde(default = "default_source_id")]
        id: String,
        urls: Vec<String>,
        selectors: ListingSelectors,
    },
}

fn default_source_id() -> String {
    "legacy-listing".to_string()
}

impl SourceConfig {
    pub fn build(&self, http: &HttpClientConfig) -> Result<Box<dyn LegacySource>, ExtractionError> {
        match self {
            Self::JsonHandoff { path } => Ok(Box::new(JsonHandoffSource::new(path.clone()))),
            Self::HtmlListing { id, urls, selectors } => {
                selectors.validate()?;
                let fetcher = Arc::new(HttpFetcher::new(http.clone())?);
                Ok(Box::new(HtmlListingSource::new(
                    id.clone(),
                    urls.clone(),
                    selectors.clone(),
                    fetcher,
                )))
            }
        }
    }
}
