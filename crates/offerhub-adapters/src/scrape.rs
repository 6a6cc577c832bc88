//! Bank lounge-access pages scraped into raw benefit records.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use offerhub_core::{slug, RawBenefit, RawPayload, RawRecord, SourceKind, TrustLevel};
use offerhub_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::{read_source_file, text_or_none, AdapterError, FetchContext, SourceAdapter};

const SECTION_MARKERS: [&str; 3] = ["lounge", "benefit", "privilege"];
const DETAIL_MARKERS: [&str; 2] = ["desc", "detail"];

/// One lounge entry found on a page, before it is wrapped as a raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoungeEntry {
    pub source_id: String,
    pub card_name: String,
    pub description: String,
}

fn class_matches(element: &ElementRef<'_>, markers: &[&str]) -> bool {
    element
        .value()
        .attr("class")
        .map(|class| {
            let class = class.to_ascii_lowercase();
            markers.iter().any(|m| class.contains(m))
        })
        .unwrap_or(false)
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let joined = element.text().collect::<Vec<_>>().join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    text_or_none(&collapsed)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Other(anyhow::anyhow!("bad selector {selector}: {e}")))
}

/// Finds `div`/`section` blocks whose class mentions lounge, benefit or
/// privilege and reads the card name from the first `h3`/`h4` and the
/// description from the first `p` (or a `desc`/`detail` div). Blocks that
/// contain another matching block are containers and are skipped.
pub fn parse_lounge_page(html: &str) -> Result<Vec<LoungeEntry>, AdapterError> {
    let document = Html::parse_document(html);
    let sections = parse_selector("div, section")?;
    let headings = parse_selector("h3, h4")?;
    let paragraphs = parse_selector("p")?;
    let divs = parse_selector("div")?;

    let mut entries = Vec::new();
    for section in document.select(&sections) {
        if !class_matches(&section, &SECTION_MARKERS) {
            continue;
        }
        let nested = section
            .select(&sections)
            .any(|inner| inner.id() != section.id() && class_matches(&inner, &SECTION_MARKERS));
        if nested {
            continue;
        }

        let Some(card_name) = section.select(&headings).next().and_then(element_text) else {
            continue;
        };
        let description = section
            .select(&paragraphs)
            .next()
            .and_then(element_text)
            .or_else(|| {
                section
                    .select(&divs)
                    .find(|d| class_matches(d, &DETAIL_MARKERS))
                    .and_then(element_text)
            });
        let Some(description) = description else {
            continue;
        };

        entries.push(LoungeEntry {
            source_id: format!("lounge-{}", slug(&card_name)),
            card_name,
            description,
        });
    }
    Ok(entries)
}

#[derive(Debug, Clone)]
pub enum PageLocation {
    Url(String),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct HtmlScrapeAdapter {
    name: String,
    trust: TrustLevel,
    bank_name: String,
    location: PageLocation,
    http: Arc<HttpFetcher>,
}

impl HtmlScrapeAdapter {
    pub fn new(
        name: impl Into<String>,
        trust: TrustLevel,
        bank_name: impl Into<String>,
        location: PageLocation,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            name: name.into(),
            trust,
            bank_name: bank_name.into(),
            location,
            http,
        }
    }

    async fn page_html(&self, ctx: &FetchContext) -> Result<String, AdapterError> {
        match &self.location {
            PageLocation::File(path) => read_source_file(&self.name, path).await,
            PageLocation::Url(url) => {
                let response = self
                    .http
                    .fetch_bytes(ctx.run_id, &self.name, url, None)
                    .await
                    .map_err(|e| AdapterError::from_fetch(&self.name, e))?;
                Ok(String::from_utf8_lossy(&response.body).into_owned())
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for HtmlScrapeAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Scraped
    }

    fn trust_level(&self) -> TrustLevel {
        self.trust
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>, AdapterError> {
        let html = self.page_html(ctx).await?;
        let entries = parse_lounge_page(&html)?;
        debug!(source = %self.name, entries = entries.len(), "parsed lounge page");

        Ok(entries
            .into_iter()
            .map(|entry| RawRecord {
                source_name: self.name.clone(),
                source_kind: SourceKind::Scraped,
                trust: self.trust,
                source_id: Some(entry.source_id),
                fetched_at: ctx.fetched_at,
                submitted_at: None,
                payload: RawPayload::Benefit(RawBenefit {
                    card_name: Some(entry.card_name),
                    bank_name: Some(self.bank_name.clone()),
                    benefit_type: Some("lounge_access".into()),
                    title: Some("Lounge Access".into()),
                    description: Some(entry.description),
                    value: Some("Complimentary lounge access".into()),
                    category: Some("travel".into()),
                    conditions: None,
                    annual_fee: None,
                    is_permanent: Some(true),
                }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <section class="lounge-grid">
            <div class="card-lounge">
              <h3>Regalia  Gold</h3>
              <p>12 domestic and 6 international lounge visits per year.</p>
            </div>
            <div class="Card-Privileges">
              <h4>Millennia</h4>
              <div class="desc-text">8 domestic visits</div>
            </div>
            <div class="benefit-tile"><p>No heading here</p></div>
          </section>
          <div class="footer"><h3>Contact</h3><p>Call us</p></div>
        </body></html>"#;

    #[test]
    fn lounge_sections_become_entries() {
        let entries = parse_lounge_page(PAGE).unwrap();
        assert_eq!(
            entries,
            vec![
                LoungeEntry {
                    source_id: "lounge-regalia-gold".into(),
                    card_name: "Regalia Gold".into(),
                    description: "12 domestic and 6 international lounge visits per year.".into(),
                },
                LoungeEntry {
                    source_id: "lounge-millennia".into(),
                    card_name: "Millennia".into(),
                    description: "8 domestic visits".into(),
                },
            ]
        );
    }

    #[test]
    fn page_without_lounge_markup_yields_nothing() {
        assert!(parse_lounge_page("<html><body><p>maintenance</p></body></html>")
            .unwrap()
            .is_empty());
    }
}
