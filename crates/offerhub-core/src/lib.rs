//! Core record model for the offer ingestion hub: canonical entities, raw
//! source records, the canonical dataset and change-log types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerhub-core";

/// Where a record originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Crowdsourced,
    Scraped,
    Api,
    Manual,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Crowdsourced => "crowdsourced",
            SourceKind::Scraped => "scraped",
            SourceKind::Api => "api",
            SourceKind::Manual => "manual",
        }
    }
}

/// Ordinal reliability of a source. Higher wins conflicting updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TrustLevel(pub u8);

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trust:{}", self.0)
    }
}

/// Provenance of the last accepted write to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_kind: SourceKind,
    pub source_name: String,
    pub trust: TrustLevel,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Offer,
    Benefit,
    RedemptionOption,
    TravelTip,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Offer => "offer",
            EntityKind::Benefit => "benefit",
            EntityKind::RedemptionOption => "redemption_option",
            EntityKind::TravelTip => "travel_tip",
        }
    }

    /// Directory name used by the per-entity projection layout.
    pub fn collection_name(&self) -> &'static str {
        match self {
            EntityKind::Offer => "offers",
            EntityKind::Benefit => "benefits",
            EntityKind::RedemptionOption => "redemption_options",
            EntityKind::TravelTip => "travel_tips",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower-cases and folds spaces/hyphens to `_` so loose labels can be
/// compared against enum names.
pub fn fold_label(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Lower-cased alphanumeric runs joined by `-`. Used for every id built
/// from a source identifier or a card name.
pub fn slug(input: &str) -> String {
    input
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferCategory {
    Dining,
    Travel,
    Shopping,
    Gas,
    Groceries,
    Entertainment,
    Other,
}

impl OfferCategory {
    pub const ALL: [OfferCategory; 7] = [
        OfferCategory::Dining,
        OfferCategory::Travel,
        OfferCategory::Shopping,
        OfferCategory::Gas,
        OfferCategory::Groceries,
        OfferCategory::Entertainment,
        OfferCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OfferCategory::Dining => "dining",
            OfferCategory::Travel => "travel",
            OfferCategory::Shopping => "shopping",
            OfferCategory::Gas => "gas",
            OfferCategory::Groceries => "groceries",
            OfferCategory::Entertainment => "entertainment",
            OfferCategory::Other => "other",
        }
    }

    /// Case-insensitive exact match; anything unknown is `Other`.
    pub fn from_loose(input: &str) -> Self {
        let folded = fold_label(input);
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == folded)
            .unwrap_or(OfferCategory::Other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenefitType {
    Cashback,
    Points,
    Miles,
    Discount,
    LoungeAccess,
    Insurance,
    Concierge,
    Other,
}

impl BenefitType {
    pub const ALL: [BenefitType; 8] = [
        BenefitType::Cashback,
        BenefitType::Points,
        BenefitType::Miles,
        BenefitType::Discount,
        BenefitType::LoungeAccess,
        BenefitType::Insurance,
        BenefitType::Concierge,
        BenefitType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BenefitType::Cashback => "cashback",
            BenefitType::Points => "points",
            BenefitType::Miles => "miles",
            BenefitType::Discount => "discount",
            BenefitType::LoungeAccess => "lounge_access",
            BenefitType::Insurance => "insurance",
            BenefitType::Concierge => "concierge",
            BenefitType::Other => "other",
        }
    }

    pub fn from_loose(input: &str) -> Self {
        let folded = fold_label(input);
        Self::ALL
            .into_iter()
            .find(|b| b.as_str() == folded)
            .unwrap_or(BenefitType::Other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipCategory {
    Stopover,
    ErrorFare,
    CreditCard,
    BookingHack,
    Activity,
    Other,
}

impl TipCategory {
    pub const ALL: [TipCategory; 6] = [
        TipCategory::Stopover,
        TipCategory::ErrorFare,
        TipCategory::CreditCard,
        TipCategory::BookingHack,
        TipCategory::Activity,
        TipCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TipCategory::Stopover => "stopover",
            TipCategory::ErrorFare => "error_fare",
            TipCategory::CreditCard => "credit_card",
            TipCategory::BookingHack => "booking_hack",
            TipCategory::Activity => "activity",
            TipCategory::Other => "other",
        }
    }

    pub fn from_loose(input: &str) -> Self {
        let folded = fold_label(input);
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == folded)
            .unwrap_or(TipCategory::Other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn from_loose(input: &str) -> Self {
        match fold_label(input).as_str() {
            "medium" => Difficulty::Medium,
            "hard" => Difficulty::Hard,
            _ => Difficulty::Easy,
        }
    }
}

/// Crowd votes. Only offers and travel tips carry them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Votes {
    pub upvotes: u32,
    pub downvotes: u32,
}

impl Votes {
    pub fn is_zero(&self) -> bool {
        self.upvotes == 0 && self.downvotes == 0
    }

    /// Additive merge; counts saturate instead of wrapping.
    pub fn add(self, delta: Votes) -> Votes {
        Votes {
            upvotes: self.upvotes.saturating_add(delta.upvotes),
            downvotes: self.downvotes.saturating_add(delta.downvotes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub title: String,
    pub description: String,
    pub card_name: String,
    pub bank_name: String,
    pub category: OfferCategory,
    pub expiry_date: Option<String>,
    pub terms: Option<String>,
    pub is_active: bool,
    pub min_spend: Option<f64>,
    pub max_benefit: Option<f64>,
    #[serde(flatten)]
    pub votes: Votes,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benefit {
    pub id: String,
    pub card_name: String,
    pub bank_name: String,
    pub benefit_type: BenefitType,
    pub title: String,
    pub description: String,
    pub value: String,
    pub category: Option<OfferCategory>,
    pub conditions: Option<String>,
    pub annual_fee: Option<f64>,
    pub is_permanent: bool,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionOption {
    pub id: String,
    pub name: String,
    pub rate: String,
    pub minimum_points: u64,
    pub available: bool,
    pub card_networks: Vec<String>,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelTip {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: TipCategory,
    pub url: Option<String>,
    pub tags: Vec<String>,
    pub difficulty: Difficulty,
    pub savings_potential: Option<String>,
    #[serde(flatten)]
    pub votes: Votes,
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A normalized entity of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalEntity {
    Offer(Offer),
    Benefit(Benefit),
    RedemptionOption(RedemptionOption),
    TravelTip(TravelTip),
}

impl CanonicalEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            CanonicalEntity::Offer(_) => EntityKind::Offer,
            CanonicalEntity::Benefit(_) => EntityKind::Benefit,
            CanonicalEntity::RedemptionOption(_) => EntityKind::RedemptionOption,
            CanonicalEntity::TravelTip(_) => EntityKind::TravelTip,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            CanonicalEntity::Offer(o) => &o.id,
            CanonicalEntity::Benefit(b) => &b.id,
            CanonicalEntity::RedemptionOption(r) => &r.id,
            CanonicalEntity::TravelTip(t) => &t.id,
        }
    }
}

/// The merge engine's view of an entity collection member.
pub trait Canonical: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn provenance(&self) -> &Provenance;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;

    /// Names of the mutable descriptive fields whose values differ.
    fn differing_fields(&self, other: &Self) -> Vec<&'static str>;

    /// Text compared when looking for near-duplicates under another id.
    fn identity_text(&self) -> String;

    fn votes(&self) -> Option<Votes> {
        None
    }

    /// Stored value after `incoming` is accepted as an update of `self`:
    /// descriptive fields and provenance come from `incoming`, identity and
    /// creation time stay, votes are added.
    fn absorb(&self, incoming: &Self) -> Self;

    fn collection(dataset: &Dataset) -> &[Self];
    fn collection_mut(dataset: &mut Dataset) -> &mut Vec<Self>;
}

fn push_if_differs<T: PartialEq>(out: &mut Vec<&'static str>, name: &'static str, a: &T, b: &T) {
    if a != b {
        out.push(name);
    }
}

fn absorbed_updated_at(existing_created: DateTime<Utc>, incoming_updated: DateTime<Utc>) -> DateTime<Utc> {
    incoming_updated.max(existing_created)
}

impl Canonical for Offer {
    const KIND: EntityKind = EntityKind::Offer;

    fn id(&self) -> &str {
        &self.id
    }

    fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn differing_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        push_if_differs(&mut out, "title", &self.title, &other.title);
        push_if_differs(&mut out, "description", &self.description, &other.description);
        push_if_differs(&mut out, "card_name", &self.card_name, &other.card_name);
        push_if_differs(&mut out, "bank_name", &self.bank_name, &other.bank_name);
        push_if_differs(&mut out, "category", &self.category, &other.category);
        push_if_differs(&mut out, "expiry_date", &self.expiry_date, &other.expiry_date);
        push_if_differs(&mut out, "terms", &self.terms, &other.terms);
        push_if_differs(&mut out, "is_active", &self.is_active, &other.is_active);
        push_if_differs(&mut out, "min_spend", &self.min_spend, &other.min_spend);
        push_if_differs(&mut out, "max_benefit", &self.max_benefit, &other.max_benefit);
        out
    }

    fn identity_text(&self) -> String {
        format!("{} {} {}", self.title, self.card_name, self.bank_name)
    }

    fn votes(&self) -> Option<Votes> {
        Some(self.votes)
    }

    fn absorb(&self, incoming: &Self) -> Self {
        Offer {
            id: self.id.clone(),
            votes: self.votes.add(incoming.votes),
            created_at: self.created_at,
            updated_at: absorbed_updated_at(self.created_at, incoming.updated_at),
            ..incoming.clone()
        }
    }

    fn collection(dataset: &Dataset) -> &[Self] {
        &dataset.offers
    }

    fn collection_mut(dataset: &mut Dataset) -> &mut Vec<Self> {
        &mut dataset.offers
    }
}

impl Canonical for Benefit {
    const KIND: EntityKind = EntityKind::Benefit;

    fn id(&self) -> &str {
        &self.id
    }

    fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn differing_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        push_if_differs(&mut out, "card_name", &self.card_name, &other.card_name);
        push_if_differs(&mut out, "bank_name", &self.bank_name, &other.bank_name);
        push_if_differs(&mut out, "benefit_type", &self.benefit_type, &other.benefit_type);
        push_if_differs(&mut out, "title", &self.title, &other.title);
        push_if_differs(&mut out, "description", &self.description, &other.description);
        push_if_differs(&mut out, "value", &self.value, &other.value);
        push_if_differs(&mut out, "category", &self.category, &other.category);
        push_if_differs(&mut out, "conditions", &self.conditions, &other.conditions);
        push_if_differs(&mut out, "annual_fee", &self.annual_fee, &other.annual_fee);
        push_if_differs(&mut out, "is_permanent", &self.is_permanent, &other.is_permanent);
        out
    }

    fn identity_text(&self) -> String {
        format!("{} {} {}", self.title, self.card_name, self.bank_name)
    }

    fn absorb(&self, incoming: &Self) -> Self {
        Benefit {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: absorbed_updated_at(self.created_at, incoming.updated_at),
            ..incoming.clone()
        }
    }

    fn collection(dataset: &Dataset) -> &[Self] {
        &dataset.benefits
    }

    fn collection_mut(dataset: &mut Dataset) -> &mut Vec<Self> {
        &mut dataset.benefits
    }
}

impl Canonical for RedemptionOption {
    const KIND: EntityKind = EntityKind::RedemptionOption;

    fn id(&self) -> &str {
        &self.id
    }

    fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn differing_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        push_if_differs(&mut out, "name", &self.name, &other.name);
        push_if_differs(&mut out, "rate", &self.rate, &other.rate);
        push_if_differs(&mut out, "minimum_points", &self.minimum_points, &other.minimum_points);
        push_if_differs(&mut out, "available", &self.available, &other.available);
        push_if_differs(&mut out, "card_networks", &self.card_networks, &other.card_networks);
        out
    }

    fn identity_text(&self) -> String {
        self.name.clone()
    }

    fn absorb(&self, incoming: &Self) -> Self {
        RedemptionOption {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: absorbed_updated_at(self.created_at, incoming.updated_at),
            ..incoming.clone()
        }
    }

    fn collection(dataset: &Dataset) -> &[Self] {
        &dataset.redemption_options
    }

    fn collection_mut(dataset: &mut Dataset) -> &mut Vec<Self> {
        &mut dataset.redemption_options
    }
}

impl Canonical for TravelTip {
    const KIND: EntityKind = EntityKind::TravelTip;

    fn id(&self) -> &str {
        &self.id
    }

    fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn differing_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut out = Vec::new();
        push_if_differs(&mut out, "title", &self.title, &other.title);
        push_if_differs(&mut out, "description", &self.description, &other.description);
        push_if_differs(&mut out, "category", &self.category, &other.category);
        push_if_differs(&mut out, "url", &self.url, &other.url);
        push_if_differs(&mut out, "tags", &self.tags, &other.tags);
        push_if_differs(&mut out, "difficulty", &self.difficulty, &other.difficulty);
        push_if_differs(
            &mut out,
            "savings_potential",
            &self.savings_potential,
            &other.savings_potential,
        );
        out
    }

    fn identity_text(&self) -> String {
        self.title.clone()
    }

    fn votes(&self) -> Option<Votes> {
        Some(self.votes)
    }

    fn absorb(&self, incoming: &Self) -> Self {
        TravelTip {
            id: self.id.clone(),
            votes: self.votes.add(incoming.votes),
            created_at: self.created_at,
            updated_at: absorbed_updated_at(self.created_at, incoming.updated_at),
            ..incoming.clone()
        }
    }

    fn collection(dataset: &Dataset) -> &[Self] {
        &dataset.travel_tips
    }

    fn collection_mut(dataset: &mut Dataset) -> &mut Vec<Self> {
        &mut dataset.travel_tips
    }
}

/// The canonical aggregate. Collection order carries no meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Dataset {
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub offers: Vec<Offer>,
    #[serde(default)]
    pub benefits: Vec<Benefit>,
    #[serde(default)]
    pub redemption_options: Vec<RedemptionOption>,
    #[serde(default)]
    pub travel_tips: Vec<TravelTip>,
}

impl Dataset {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.offers.len() + self.benefits.len() + self.redemption_options.len() + self.travel_tips.len()
    }

    pub fn get<T: Canonical>(&self, id: &str) -> Option<&T> {
        T::collection(self).iter().find(|e| e.id() == id)
    }

    /// Replaces the entity with the same id, or appends it.
    pub fn upsert<T: Canonical>(&mut self, entity: T) {
        let items = T::collection_mut(self);
        match items.iter_mut().find(|e| e.id() == entity.id()) {
            Some(slot) => *slot = entity,
            None => items.push(entity),
        }
    }

    /// True when no collection holds two entities with the same id.
    pub fn ids_are_unique(&self) -> bool {
        fn unique<T: Canonical>(items: &[T]) -> bool {
            let mut seen = std::collections::HashSet::new();
            items.iter().all(|e| seen.insert(e.id()))
        }
        unique(&self.offers)
            && unique(&self.benefits)
            && unique(&self.redemption_options)
            && unique(&self.travel_tips)
    }
}

/// Per-commit counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChangeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub conflicts: usize,
}

/// One append-only record per persisted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub commit_id: Uuid,
    pub summary: ChangeSummary,
    pub message: String,
    pub checksum: String,
}

/// Envelope shared by every raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_name: String,
    pub source_kind: SourceKind,
    pub trust: TrustLevel,
    /// Identifier meaningful only inside the originating source.
    pub source_id: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub payload: RawPayload,
}

/// Loosely-typed payloads as sources deliver them. Everything is optional
/// here; the normalizer decides what is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawPayload {
    Offer(RawOffer),
    Benefit(RawBenefit),
    Redemption(RawRedemption),
    TravelTip(RawTravelTip),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawOffer {
    pub title: Option<String>,
    pub description: Option<String>,
    pub card_name: Option<String>,
    pub bank_name: Option<String>,
    pub category: Option<String>,
    pub expiry_date: Option<String>,
    pub terms: Option<String>,
    pub is_active: Option<bool>,
    pub min_spend: Option<f64>,
    pub max_benefit: Option<f64>,
    pub upvotes: Option<u32>,
    pub downvotes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawBenefit {
    pub card_name: Option<String>,
    pub bank_name: Option<String>,
    pub benefit_type: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub value: Option<String>,
    pub category: Option<String>,
    pub conditions: Option<String>,
    pub annual_fee: Option<f64>,
    pub is_permanent: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawRedemption {
    pub name: Option<String>,
    pub rate: Option<String>,
    pub minimum_points: Option<u64>,
    pub available: Option<bool>,
    pub card_networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RawTravelTip {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub url: Option<String>,
    pub tags: Vec<String>,
    pub difficulty: Option<String>,
    pub savings_potential: Option<String>,
    pub upvotes: Option<u32>,
    pub downvotes: Option<u32>,
}
