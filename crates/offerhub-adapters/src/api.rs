//! Polls a Graph-style JSON endpoint (`{"value": [...], "@odata.nextLink": ...}`)
//! whose rows use the same column headers as the forms export.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use offerhub_core::{RawRecord, SourceKind, TrustLevel};
use offerhub_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::forms::{decode_rows, parse_forms_rows};
use crate::{AdapterError, FetchContext, SourceAdapter};

const MAX_PAGES: usize = 50;

#[derive(Debug, Deserialize)]
struct GraphPage {
    #[serde(default)]
    value: Vec<JsonValue>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

fn parse_graph_page(body: &[u8]) -> anyhow::Result<GraphPage> {
    serde_json::from_slice(body).context("parsing API response page")
}

#[derive(Debug, Clone)]
pub struct ApiPollAdapter {
    name: String,
    trust: TrustLevel,
    url: String,
    token_env: Option<String>,
    http: Arc<HttpFetcher>,
}

impl ApiPollAdapter {
    pub fn new(
        name: impl Into<String>,
        trust: TrustLevel,
        url: impl Into<String>,
        token_env: Option<String>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            name: name.into(),
            trust,
            url: url.into(),
            token_env,
            http,
        }
    }

    fn bearer_token(&self) -> Result<Option<String>, AdapterError> {
        let Some(var) = &self.token_env else {
            return Ok(None);
        };
        match std::env::var(var) {
            Ok(token) if !token.trim().is_empty() => Ok(Some(token)),
            _ => Err(AdapterError::AuthError {
                source_name: self.name.clone(),
                reason: format!("{var} is not set"),
            }),
        }
    }
}

#[async_trait]
impl SourceAdapter for ApiPollAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Api
    }

    fn trust_level(&self) -> TrustLevel {
        self.trust
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>, AdapterError> {
        let token = self.bearer_token()?;
        let mut next = Some(self.url.clone());
        let mut values = Vec::new();
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages == MAX_PAGES {
                warn!(source = %self.name, pages, "stopping pagination at page limit");
                break;
            }
            let response = self
                .http
                .fetch_bytes(ctx.run_id, &self.name, &url, token.as_deref())
                .await
                .map_err(|e| AdapterError::from_fetch(&self.name, e))?;
            let page = parse_graph_page(&response.body)?;
            values.extend(page.value);
            next = page.next_link;
            pages += 1;
        }

        debug!(source = %self.name, pages, rows = values.len(), "polled API");
        let rows = decode_rows(&self.name, values);
        Ok(parse_forms_rows(&self.name, SourceKind::Api, self.trust, ctx.fetched_at, &rows))
    }
}
