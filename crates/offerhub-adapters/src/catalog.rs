//! Hand-curated JSON catalogs (redemption options, travel tips, card
//! benefit sheets). Each item is a tagged raw payload plus an optional id.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerhub_core::{RawPayload, RawRecord, SourceKind, TrustLevel};
use serde::{Deserialize, Serialize};

use crate::{read_source_file, AdapterError, FetchContext, SourceAdapter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: RawPayload,
}

#[derive(Debug, Clone)]
pub struct CatalogFileAdapter {
    name: String,
    kind: SourceKind,
    trust: TrustLevel,
    path: PathBuf,
}

impl CatalogFileAdapter {
    pub fn new(name: impl Into<String>, kind: SourceKind, trust: TrustLevel, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            trust,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for CatalogFileAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn source_kind(&self) -> SourceKind {
        self.kind
    }

    fn trust_level(&self) -> TrustLevel {
        self.trust
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>, AdapterError> {
        let text = read_source_file(&self.name, &self.path).await?;
        let items: Vec<CatalogItem> = serde_json::from_str(&text)
            .with_context(|| format!("parsing catalog {}", self.path.display()))?;
        Ok(items
            .into_iter()
            .map(|item| RawRecord {
                source_name: self.name.clone(),
                source_kind: self.kind,
                trust: self.trust,
                source_id: item.id,
                fetched_at: ctx.fetched_at,
                submitted_at: item.submitted_at,
                payload: item.payload,
            })
            .collect())
    }
}
