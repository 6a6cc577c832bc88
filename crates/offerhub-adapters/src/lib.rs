//! Source adapter contract plus the forms-export, API-poll, HTML-scrape and
//! catalog-file adapters that feed raw records into the ingestion cycle.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerhub_core::{RawRecord, SourceKind, TrustLevel};
use offerhub_storage::FetchError;
use thiserror::Error;
use uuid::Uuid;

mod api;
mod catalog;
mod forms;
mod registry;
mod scrape;

pub use api::ApiPollAdapter;
pub use catalog::{CatalogFileAdapter, CatalogItem};
pub use forms::{parse_forms_rows, FormsExportAdapter, FormsRow};
pub use registry::{build_adapters, AdapterKind, SourceConfig, SourceRegistry};
pub use scrape::{parse_lounge_page, HtmlScrapeAdapter, LoungeEntry, PageLocation};

pub const CRATE_NAME: &str = "offerhub-adapters";

/// Per-cycle values every adapter receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    /// Upper bound the caller enforces around the whole `fetch` call.
    pub timeout: Duration,
}

impl FetchContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
            timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source {source_name} unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },
    #[error("source {source_name} rejected credentials: {reason}")]
    AuthError { source_name: String, reason: String },
    #[error("source {source_name} is rate limiting requests")]
    RateLimited { source_name: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn unavailable(source_name: &str, reason: impl Into<String>) -> Self {
        AdapterError::SourceUnavailable {
            source_name: source_name.to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly label used in cycle reports.
    pub fn category(&self) -> &'static str {
        match self {
            AdapterError::SourceUnavailable { .. } => "source_unavailable",
            AdapterError::AuthError { .. } => "auth_error",
            AdapterError::RateLimited { .. } => "rate_limited",
            AdapterError::Other(_) => "other",
        }
    }

    pub(crate) fn from_fetch(source_name: &str, err: FetchError) -> Self {
        match err.status() {
            Some(401) | Some(403) => AdapterError::AuthError {
                source_name: source_name.to_string(),
                reason: err.to_string(),
            },
            Some(429) => AdapterError::RateLimited {
                source_name: source_name.to_string(),
            },
            _ => AdapterError::unavailable(source_name, err.to_string()),
        }
    }
}

/// Anything that can produce a batch of raw records for the ingestion
/// cycle. Fetching must not touch the canonical dataset and must be safe to
/// repeat.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;
    fn source_kind(&self) -> SourceKind;
    fn trust_level(&self) -> TrustLevel;

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Reads a local source file, mapping "not there" to `SourceUnavailable`.
pub(crate) async fn read_source_file(source_name: &str, path: &Path) -> Result<String, AdapterError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(AdapterError::unavailable(
            source_name,
            format!("{} does not exist", path.display()),
        )),
        Err(err) => Err(AdapterError::unavailable(
            source_name,
            format!("reading {}: {err}", path.display()),
        )),
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_statuses_map_to_adapter_errors() {
        let auth = AdapterError::from_fetch(
            "graph",
            FetchError::HttpStatus {
                status: 401,
                url: "https://graph.example/forms".into(),
            },
        );
        assert_eq!(auth.category(), "auth_error");

        let limited = AdapterError::from_fetch(
            "graph",
            FetchError::HttpStatus {
                status: 429,
                url: "https://graph.example/forms".into(),
            },
        );
        assert!(matches!(limited, AdapterError::RateLimited { .. }));

        let down = AdapterError::from_fetch(
            "graph",
            FetchError::HttpStatus {
                status: 503,
                url: "https://graph.example/forms".into(),
            },
        );
        assert_eq!(down.category(), "source_unavailable");
    }

    #[tokio::test]
    async fn missing_source_file_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_source_file("forms", &dir.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::SourceUnavailable { ref source_name, .. } if source_name == "forms"));
    }
}
