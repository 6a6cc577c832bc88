//! Raw source records to canonical entities.
//!
//! Identity rules:
//! - a record that carries its own `source_id` gets `"{source_name}-{source_id}"`
//!   (lower-cased, non-alphanumerics folded to `-`);
//! - anything else gets `"{kind}-{hash}"` where the hash covers the lower-cased
//!   title, card name and bank name, so the same logical record gets the same
//!   id no matter which source delivered it.

use chrono::{DateTime, Utc};
use offerhub_core::{
    slug, Benefit, BenefitType, CanonicalEntity, Difficulty, EntityKind, Offer, OfferCategory, Provenance, RawBenefit,
    RawOffer, RawPayload, RawRecord, RawRedemption, RawTravelTip, RedemptionOption, TipCategory, TravelTip, Votes,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

const FIELD_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed record from {source_name}: {reason}")]
    MalformedRecord { source_name: String, reason: String },
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Stable id for a record without a usable source identifier.
pub fn content_id(kind: EntityKind, title: &str, card_name: &str, bank_name: &str) -> String {
    let mut hasher = Sha256::new();
    let material = [title, card_name, bank_name]
        .iter()
        .map(|part| part.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join(&FIELD_SEPARATOR.to_string());
    hasher.update(material.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", kind.as_str().replace('_', "-"), &digest[..16])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, record: &RawRecord) -> Result<CanonicalEntity, NormalizeError> {
        self.normalize_at(record, Utc::now())
    }

    /// Same as [`Normalizer::normalize`] with an explicit "now", which becomes
    /// `updated_at` and caps `created_at`.
    pub fn normalize_at(&self, record: &RawRecord, now: DateTime<Utc>) -> Result<CanonicalEntity, NormalizeError> {
        let ctx = RecordContext { record, now };
        match &record.payload {
            RawPayload::Offer(raw) => ctx.offer(raw).map(CanonicalEntity::Offer),
            RawPayload::Benefit(raw) => ctx.benefit(raw).map(CanonicalEntity::Benefit),
            RawPayload::Redemption(raw) => ctx.redemption(raw).map(CanonicalEntity::RedemptionOption),
            RawPayload::TravelTip(raw) => ctx.travel_tip(raw).map(CanonicalEntity::TravelTip),
        }
    }
}

struct RecordContext<'a> {
    record: &'a RawRecord,
    now: DateTime<Utc>,
}

impl RecordContext<'_> {
    fn malformed(&self, reason: impl Into<String>) -> NormalizeError {
        NormalizeError::MalformedRecord {
            source_name: self.record.source_name.clone(),
            reason: reason.into(),
        }
    }

    fn provenance(&self) -> Provenance {
        Provenance {
            source_kind: self.record.source_kind,
            source_name: self.record.source_name.clone(),
            trust: self.record.trust,
            fetched_at: self.record.fetched_at,
        }
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.record
            .submitted_at
            .unwrap_or(self.record.fetched_at)
            .min(self.now)
    }

    fn id(&self, kind: EntityKind, title: &str, card_name: &str, bank_name: &str) -> String {
        match clean(&self.record.source_id).map(|sid| slug(&format!("{}-{}", self.record.source_name, sid))) {
            Some(id) if !id.is_empty() => id,
            _ => content_id(kind, title, card_name, bank_name),
        }
    }

    fn amount(&self, field: &str, value: Option<f64>) -> Result<Option<f64>, NormalizeError> {
        match value {
            Some(v) if !v.is_finite() => Err(self.malformed(format!("{field} is not a number"))),
            Some(v) if v < 0.0 => Err(self.malformed(format!("{field} is negative ({v})"))),
            other => Ok(other),
        }
    }

    /// Title, falling back to the card name; errors when both are blank.
    fn title_or_card(
        &self,
        title: &Option<String>,
        card_name: &Option<String>,
    ) -> Result<(String, String), NormalizeError> {
        let card_name = clean(card_name);
        match (clean(title), card_name) {
            (Some(title), card) => Ok((title, card.unwrap_or_default())),
            (None, Some(card)) => Ok((card.clone(), card)),
            (None, None) => Err(self.malformed("record has neither a title nor a card name")),
        }
    }

    fn offer(&self, raw: &RawOffer) -> Result<Offer, NormalizeError> {
        let (title, card_name) = self.title_or_card(&raw.title, &raw.card_name)?;
        let bank_name = clean(&raw.bank_name).unwrap_or_default();
        Ok(Offer {
            id: self.id(EntityKind::Offer, &title, &card_name, &bank_name),
            description: clean(&raw.description).unwrap_or_default(),
            category: clean(&raw.category)
                .map(|c| OfferCategory::from_loose(&c))
                .unwrap_or(OfferCategory::Other),
            expiry_date: clean(&raw.expiry_date),
            terms: clean(&raw.terms),
            is_active: raw.is_active.unwrap_or(true),
            min_spend: self.amount("min_spend", raw.min_spend)?,
            max_benefit: self.amount("max_benefit", raw.max_benefit)?,
            votes: Votes {
                upvotes: raw.upvotes.unwrap_or(0),
                downvotes: raw.downvotes.unwrap_or(0),
            },
            provenance: self.provenance(),
            created_at: self.created_at(),
            updated_at: self.now,
            title,
            card_name,
            bank_name,
        })
    }

    fn benefit(&self, raw: &RawBenefit) -> Result<Benefit, NormalizeError> {
        let (title, card_name) = self.title_or_card(&raw.title, &raw.card_name)?;
        let bank_name = clean(&raw.bank_name).unwrap_or_default();
        Ok(Benefit {
            id: self.id(EntityKind::Benefit, &title, &card_name, &bank_name),
            benefit_type: clean(&raw.benefit_type)
                .map(|b| BenefitType::from_loose(&b))
                .unwrap_or(BenefitType::Other),
            description: clean(&raw.description).unwrap_or_default(),
            value: clean(&raw.value).unwrap_or_default(),
            category: clean(&raw.category).map(|c| OfferCategory::from_loose(&c)),
            conditions: clean(&raw.conditions),
            annual_fee: self.amount("annual_fee", raw.annual_fee)?,
            is_permanent: raw.is_permanent.unwrap_or(true),
            provenance: self.provenance(),
            created_at: self.created_at(),
            updated_at: self.now,
            title,
            card_name,
            bank_name,
        })
    }

    fn redemption(&self, raw: &RawRedemption) -> Result<RedemptionOption, NormalizeError> {
        let name = clean(&raw.name).ok_or_else(|| self.malformed("redemption option has no name"))?;
        Ok(RedemptionOption {
            id: self.id(EntityKind::RedemptionOption, &name, "", ""),
            rate: clean(&raw.rate).unwrap_or_default(),
            minimum_points: raw.minimum_points.unwrap_or(0),
            available: raw.available.unwrap_or(true),
            card_networks: raw
                .card_networks
                .iter()
                .filter_map(|n| clean(&Some(n.clone())))
                .collect(),
            provenance: self.provenance(),
            created_at: self.created_at(),
            updated_at: self.now,
            name,
        })
    }

    fn travel_tip(&self, raw: &RawTravelTip) -> Result<TravelTip, NormalizeError> {
        let title = clean(&raw.title).ok_or_else(|| self.malformed("travel tip has no title"))?;
        Ok(TravelTip {
            id: self.id(EntityKind::TravelTip, &title, "", ""),
            description: clean(&raw.description).unwrap_or_default(),
            category: clean(&raw.category)
                .map(|c| TipCategory::from_loose(&c))
                .unwrap_or(TipCategory::Other),
            url: clean(&raw.url),
            tags: raw.tags.iter().filter_map(|t| clean(&Some(t.clone()))).collect(),
            difficulty: clean(&raw.difficulty)
                .map(|d| Difficulty::from_loose(&d))
                .unwrap_or_default(),
            savings_potential: clean(&raw.savings_potential),
            votes: Votes {
                upvotes: raw.upvotes.unwrap_or(0),
                downvotes: raw.downvotes.unwrap_or(0),
            },
            provenance: self.provenance(),
            created_at: self.created_at(),
            updated_at: self.now,
            title,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use offerhub_core::{SourceKind, TrustLevel};

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    fn record(source_name: &str, source_id: Option<&str>, payload: RawPayload) -> RawRecord {
        RawRecord {
            source_name: source_name.into(),
            source_kind: SourceKind::Crowdsourced,
            trust: TrustLevel(1),
            source_id: source_id.map(str::to_string),
            fetched_at: ts(2),
            submitted_at: Some(ts(1)),
            payload,
        }
    }

    fn dining(card: &str) -> RawPayload {
        RawPayload::Offer(RawOffer {
            title: Some("5x Dining".into()),
            card_name: Some(card.into()),
            category: Some(" DINING ".into()),
            ..Default::default()
        })
    }

    #[test]
    fn content_ids_are_deterministic_and_source_independent() {
        let normalizer = Normalizer::new();
        let a = normalizer.normalize_at(&record("forms", None, dining("Card A")), ts(3)).unwrap();
        let b = normalizer.normalize_at(&record("bank", None, dining("card a ")), ts(4)).unwrap();
        assert_eq!(a.id(), b.id());
        assert!(a.id().starts_with("offer-"));
        assert_eq!(a.id().len(), "offer-".len() + 16);

        let other = normalizer.normalize_at(&record("forms", None, dining("Card B")), ts(3)).unwrap();
        assert_ne!(a.id(), other.id());
    }

    #[test]
    fn explicit_source_ids_are_prefixed_by_source() {
        let normalizer = Normalizer::new();
        let entity = normalizer
            .normalize_at(&record("HDFC Lounges", Some("lounge-Regalia Gold"), dining("Regalia")), ts(3))
            .unwrap();
        assert_eq!(entity.id(), "hdfc-lounges-lounge-regalia-gold");
    }

    #[test]
    fn timestamps_and_categories_are_filled() {
        let entity = Normalizer::new()
            .normalize_at(&record("forms", None, dining("Card A")), ts(3))
            .unwrap();
        let CanonicalEntity::Offer(offer) = entity else {
            panic!("expected offer");
        };
        assert_eq!(offer.created_at, ts(1));
        assert_eq!(offer.updated_at, ts(3));
        assert_eq!(offer.category, OfferCategory::Dining);
        assert!(offer.is_active);
        assert_eq!(offer.provenance.trust, TrustLevel(1));
        assert_eq!(offer.provenance.fetched_at, ts(2));
    }

    #[test]
    fn future_submission_time_is_capped_at_now() {
        let mut raw = record("forms", None, dining("Card A"));
        raw.submitted_at = Some(ts(20));
        let entity = Normalizer::new().normalize_at(&raw, ts(3)).unwrap();
        let CanonicalEntity::Offer(offer) = entity else {
            panic!("expected offer");
        };
        assert!(offer.updated_at >= offer.created_at);
    }

    #[test]
    fn unknown_labels_fall_back_instead_of_failing() {
        let payload = RawPayload::Benefit(RawBenefit {
            card_name: Some("Card A".into()),
            benefit_type: Some("free coffee".into()),
            category: Some("fine dining".into()),
            ..Default::default()
        });
        let entity = Normalizer::new().normalize_at(&record("forms", None, payload), ts(3)).unwrap();
        let CanonicalEntity::Benefit(benefit) = entity else {
            panic!("expected benefit");
        };
        assert_eq!(benefit.benefit_type, BenefitType::Other);
        assert_eq!(benefit.category, Some(OfferCategory::Other));
        assert_eq!(benefit.title, "Card A");
    }

    #[test]
    fn records_without_identity_are_malformed() {
        let normalizer = Normalizer::new();
        let blank = RawPayload::Offer(RawOffer {
            title: Some("   ".into()),
            description: Some("orphan".into()),
            ..Default::default()
        });
        let err = normalizer.normalize_at(&record("forms", Some("3"), blank), ts(3)).unwrap_err();
        assert!(matches!(err, NormalizeError::MalformedRecord { ref source_name, .. } if source_name == "forms"));

        let nameless = RawPayload::Redemption(RawRedemption::default());
        assert!(normalizer.normalize_at(&record("curated", None, nameless), ts(3)).is_err());

        let untitled = RawPayload::TravelTip(RawTravelTip::default());
        assert!(normalizer.normalize_at(&record("tips", None, untitled), ts(3)).is_err());
    }

    #[test]
    fn negative_amounts_are_malformed() {
        let payload = RawPayload::Offer(RawOffer {
            title: Some("Cashback".into()),
            card_name: Some("Card A".into()),
            min_spend: Some(-10.0),
            ..Default::default()
        });
        assert!(Normalizer::new().normalize_at(&record("forms", None, payload), ts(3)).is_err());
    }
}
