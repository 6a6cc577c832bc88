//! Crowdsourced offer submissions exported from a survey form.
//!
//! The export is a JSON array of rows keyed by the form's column headers
//! ("Card Name", "Offer Title", ...). Values may be strings or numbers
//! depending on how the spreadsheet was converted.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use offerhub_core::{RawOffer, RawPayload, RawRecord, SourceKind, TrustLevel};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{read_source_file, text_or_none, AdapterError, FetchContext, SourceAdapter};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FormsRow {
    #[serde(rename = "ID", default)]
    pub id: Option<JsonValue>,
    #[serde(rename = "Completion time", default)]
    pub completion_time: Option<JsonValue>,
    #[serde(rename = "Card Name", default)]
    pub card_name: Option<JsonValue>,
    #[serde(rename = "Bank Name", default)]
    pub bank_name: Option<JsonValue>,
    #[serde(rename = "Offer Title", default)]
    pub offer_title: Option<JsonValue>,
    #[serde(rename = "Offer Description", default)]
    pub offer_description: Option<JsonValue>,
    #[serde(rename = "Category", default)]
    pub category: Option<JsonValue>,
    #[serde(rename = "Expiry Date", default)]
    pub expiry_date: Option<JsonValue>,
    #[serde(rename = "Minimum Spend", default)]
    pub minimum_spend: Option<JsonValue>,
    #[serde(rename = "Benefit Value", default)]
    pub benefit_value: Option<JsonValue>,
}

fn cell_text(cell: &Option<JsonValue>) -> Option<String> {
    match cell.as_ref()? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numbers pass through; strings like "₹5,000" or "1,500.50" keep only the
/// sign, digits and decimal point.
fn cell_amount(cell: &Option<JsonValue>) -> Option<f64> {
    match cell.as_ref()? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

/// Export timestamps come either as RFC 3339 or the spreadsheet's
/// `M/D/YYYY H:MM:SS` form, which is taken as UTC.
pub(crate) fn parse_submission_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%m/%d/%Y %H:%M:%S", "%m/%d/%Y %H:%M", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Turns export rows into raw offer records tagged with the given source.
pub fn parse_forms_rows(
    source_name: &str,
    source_kind: SourceKind,
    trust: TrustLevel,
    fetched_at: DateTime<Utc>,
    rows: &[FormsRow],
) -> Vec<RawRecord> {
    rows.iter()
        .map(|row| RawRecord {
            source_name: source_name.to_string(),
            source_kind,
            trust,
            source_id: cell_text(&row.id),
            fetched_at,
            submitted_at: cell_text(&row.completion_time).and_then(|t| parse_submission_time(&t)),
            payload: RawPayload::Offer(RawOffer {
                title: cell_text(&row.offer_title),
                description: cell_text(&row.offer_description),
                card_name: cell_text(&row.card_name),
                bank_name: cell_text(&row.bank_name),
                category: cell_text(&row.category),
                expiry_date: cell_text(&row.expiry_date),
                terms: cell_text(&row.benefit_value),
                is_active: None,
                min_spend: cell_amount(&row.minimum_spend),
                max_benefit: None,
                upvotes: None,
                downvotes: None,
            }),
        })
        .collect()
}

/// Rows that are not JSON objects are dropped with a warning; everything
/// else is left for the normalizer to judge.
pub(crate) fn decode_rows(source_name: &str, values: Vec<JsonValue>) -> Vec<FormsRow> {
    values
        .into_iter()
        .enumerate()
        .filter_map(|(idx, value)| match serde_json::from_value::<FormsRow>(value) {
            Ok(row) => Some(row),
            Err(err) => {
                warn!(source = source_name, row = idx, error = %err, "skipping undecodable form row");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FormsExportAdapter {
    name: String,
    trust: TrustLevel,
    path: PathBuf,
}

impl FormsExportAdapter {
    pub fn new(name: impl Into<String>, trust: TrustLevel, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            trust,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FormsExportAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Crowdsourced
    }

    fn trust_level(&self) -> TrustLevel {
        self.trust
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<Vec<RawRecord>, AdapterError> {
        let text = read_source_file(&self.name, &self.path).await?;
        let values: Vec<JsonValue> = serde_json::from_str(&text)
            .with_context(|| format!("parsing forms export {}", self.path.display()))?;
        let rows = decode_rows(&self.name, values);
        debug!(source = %self.name, rows = rows.len(), "read forms export");
        Ok(parse_forms_rows(
            &self.name,
            SourceKind::Crowdsourced,
            self.trust,
            ctx.fetched_at,
            &rows,
        ))
    }
}
