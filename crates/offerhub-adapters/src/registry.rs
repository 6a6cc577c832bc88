//! `sources.yaml` source registry and the adapter factory built on it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use offerhub_core::{SourceKind, TrustLevel};
use offerhub_storage::HttpFetcher;
use serde::{Deserialize, Serialize};

use crate::scrape::PageLocation;
use crate::{ApiPollAdapter, CatalogFileAdapter, FormsExportAdapter, HtmlScrapeAdapter, SourceAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    FormsExport,
    ApiPoll,
    HtmlScrape,
    CatalogFile,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: AdapterKind,
    pub trust: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub bank_name: Option<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    /// Provenance recorded for catalog files; defaults to `manual`.
    #[serde(default)]
    pub source_kind: Option<SourceKind>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                bail!("source with empty name");
            }
            if !names.insert(source.name.as_str()) {
                bail!("duplicate source name {}", source.name);
            }
            match source.kind {
                AdapterKind::FormsExport | AdapterKind::CatalogFile if source.path.is_none() => {
                    bail!("source {} needs a path", source.name)
                }
                AdapterKind::ApiPoll if source.url.is_none() => {
                    bail!("source {} needs a url", source.name)
                }
                AdapterKind::HtmlScrape if source.url.is_none() && source.path.is_none() => {
                    bail!("source {} needs a url or a path", source.name)
                }
                AdapterKind::HtmlScrape if source.bank_name.is_none() => {
                    bail!("source {} needs a bank_name", source.name)
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Instantiates every enabled source. Relative paths resolve against
/// `base_dir`, normally the directory holding `sources.yaml`.
pub fn build_adapters(
    registry: &SourceRegistry,
    base_dir: &Path,
    http: Arc<HttpFetcher>,
) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
    for source in registry.enabled() {
        let trust = TrustLevel(source.trust);
        let path = source.path.as_deref().map(|p| resolve(base_dir, p));
        let adapter: Arc<dyn SourceAdapter> = match (source.kind, path) {
            (AdapterKind::FormsExport, Some(path)) => {
                Arc::new(FormsExportAdapter::new(source.name.clone(), trust, path))
            }
            (AdapterKind::CatalogFile, Some(path)) => Arc::new(CatalogFileAdapter::new(
                source.name.clone(),
                source.source_kind.unwrap_or(SourceKind::Manual),
                trust,
                path,
            )),
            (AdapterKind::ApiPoll, _) => {
                let url = source
                    .url
                    .clone()
                    .with_context(|| format!("source {} needs a url", source.name))?;
                Arc::new(ApiPollAdapter::new(
                    source.name.clone(),
                    trust,
                    url,
                    source.token_env.clone(),
                    http.clone(),
                ))
            }
            (AdapterKind::HtmlScrape, path) => {
                let location = match (&source.url, path) {
                    (_, Some(path)) => PageLocation::File(path),
                    (Some(url), None) => PageLocation::Url(url.clone()),
                    (None, None) => bail!("source {} needs a url or a path", source.name),
                };
                let bank_name = source
                    .bank_name
                    .clone()
                    .with_context(|| format!("source {} needs a bank_name", source.name))?;
                Arc::new(HtmlScrapeAdapter::new(
                    source.name.clone(),
                    trust,
                    bank_name,
                    location,
                    http.clone(),
                ))
            }
            (kind, None) => bail!("source {} of kind {kind:?} needs a path", source.name),
        };
        adapters.push(adapter);
    }
    Ok(adapters)
}
