//! Classifies normalized candidates against the canonical dataset.
//!
//! Per collection, each candidate is looked up by id in a working view that
//! starts as the existing dataset and absorbs earlier candidates of the same
//! batch:
//! - unknown id: insert;
//! - known id with identical descriptive fields: skip;
//! - known id with differing fields: update if the candidate's trust is at
//!   least the recorded trust (equal trust requires a fetch that is not older
//!   than the recorded one), otherwise a conflict.
//!
//! Votes are only applied on insert and update.

use std::collections::HashMap;
use std::fmt;

use offerhub_core::{
    Benefit, Canonical, CanonicalEntity, ChangeSummary, Dataset, EntityKind, Offer, Provenance, RedemptionOption,
    TravelTip,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The candidate's source is less trusted than the recorded one.
    LowerTrust,
    /// Equal trust, but the candidate was fetched before the recorded write.
    StaleFetch,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::LowerTrust => f.write_str("lower_trust"),
            ConflictReason::StaleFetch => f.write_str("stale_fetch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    pub kind: EntityKind,
    pub id: String,
    pub reason: ConflictReason,
    pub fields: Vec<String>,
    pub existing: Provenance,
    pub incoming: Provenance,
}

/// A newly inserted entity that looks a lot like an existing one under a
/// different id. Informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewHint {
    pub kind: EntityKind,
    pub candidate_id: String,
    pub existing_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityPlan<T> {
    pub to_insert: Vec<T>,
    /// Stored values after the update is applied.
    pub to_update: Vec<T>,
    pub to_skip: Vec<T>,
    pub conflicts: Vec<MergeConflict>,
}

impl<T> Default for EntityPlan<T> {
    fn default() -> Self {
        Self {
            to_insert: Vec::new(),
            to_update: Vec::new(),
            to_skip: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

impl<T: Canonical> EntityPlan<T> {
    fn apply_to(&self, dataset: &mut Dataset) {
        for entity in self.to_insert.iter().chain(self.to_update.iter()) {
            dataset.upsert(entity.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergePlan {
    pub offers: EntityPlan<Offer>,
    pub benefits: EntityPlan<Benefit>,
    pub redemption_options: EntityPlan<RedemptionOption>,
    pub travel_tips: EntityPlan<TravelTip>,
    pub review_hints: Vec<ReviewHint>,
}

impl MergePlan {
    pub fn summary(&self) -> ChangeSummary {
        fn add<T>(summary: &mut ChangeSummary, plan: &EntityPlan<T>) {
            summary.inserted += plan.to_insert.len();
            summary.updated += plan.to_update.len();
            summary.skipped += plan.to_skip.len();
            summary.conflicts += plan.conflicts.len();
        }
        let mut summary = ChangeSummary::default();
        add(&mut summary, &self.offers);
        add(&mut summary, &self.benefits);
        add(&mut summary, &self.redemption_options);
        add(&mut summary, &self.travel_tips);
        summary
    }

    pub fn has_changes(&self) -> bool {
        let s = self.summary();
        s.inserted > 0 || s.updated > 0
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &MergeConflict> {
        self.offers
            .conflicts
            .iter()
            .chain(self.benefits.conflicts.iter())
            .chain(self.redemption_options.conflicts.iter())
            .chain(self.travel_tips.conflicts.iter())
    }

    /// The dataset with every insert and update applied. Version and
    /// timestamp are left for the store to assign.
    pub fn apply(&self, existing: &Dataset) -> Dataset {
        let mut next = existing.clone();
        self.offers.apply_to(&mut next);
        self.benefits.apply_to(&mut next);
        self.redemption_options.apply_to(&mut next);
        self.travel_tips.apply_to(&mut next);
        next
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub review_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self { review_threshold: 0.93 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    config: MergeConfig,
}

enum Slot {
    Existing(usize),
    Inserted(usize),
    Updated(usize),
}

fn should_apply(existing: &Provenance, incoming: &Provenance) -> Result<(), ConflictReason> {
    if incoming.trust < existing.trust {
        return Err(ConflictReason::LowerTrust);
    }
    if incoming.trust == existing.trust && incoming.fetched_at < existing.fetched_at {
        return Err(ConflictReason::StaleFetch);
    }
    Ok(())
}

fn identity_key(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn merge(&self, existing: &Dataset, candidates: Vec<CanonicalEntity>) -> MergePlan {
        let mut offers = Vec::new();
        let mut benefits = Vec::new();
        let mut redemption_options = Vec::new();
        let mut travel_tips = Vec::new();
        for candidate in candidates {
            match candidate {
                CanonicalEntity::Offer(e) => offers.push(e),
                CanonicalEntity::Benefit(e) => benefits.push(e),
                CanonicalEntity::RedemptionOption(e) => redemption_options.push(e),
                CanonicalEntity::TravelTip(e) => travel_tips.push(e),
            }
        }

        let mut review_hints = Vec::new();
        MergePlan {
            offers: self.merge_collection(existing, offers, &mut review_hints),
            benefits: self.merge_collection(existing, benefits, &mut review_hints),
            redemption_options: self.merge_collection(existing, redemption_options, &mut review_hints),
            travel_tips: self.merge_collection(existing, travel_tips, &mut review_hints),
            review_hints,
        }
    }

    /// Runs the classification for one collection.
    pub fn merge_collection<T: Canonical>(
        &self,
        existing: &Dataset,
        candidates: Vec<T>,
        review_hints: &mut Vec<ReviewHint>,
    ) -> EntityPlan<T> {
        let current = T::collection(existing);
        let mut slots: HashMap<String, Slot> = current
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.id().to_string(), Slot::Existing(idx)))
            .collect();
        let mut plan = EntityPlan::default();

        for candidate in candidates {
            let stored = match slots.get(candidate.id()) {
                None => None,
                Some(Slot::Existing(idx)) => Some(&current[*idx]),
                Some(Slot::Inserted(idx)) => Some(&plan.to_insert[*idx]),
                Some(Slot::Updated(idx)) => Some(&plan.to_update[*idx]),
            };

            let Some(stored) = stored else {
                self.collect_hints(current, &candidate, review_hints);
                slots.insert(candidate.id().to_string(), Slot::Inserted(plan.to_insert.len()));
                plan.to_insert.push(candidate);
                continue;
            };

            let fields = stored.differing_fields(&candidate);
            if fields.is_empty() {
                plan.to_skip.push(candidate);
                continue;
            }

            if let Err(reason) = should_apply(stored.provenance(), candidate.provenance()) {
                plan.conflicts.push(MergeConflict {
                    kind: T::KIND,
                    id: candidate.id().to_string(),
                    reason,
                    fields: fields.iter().map(|f| f.to_string()).collect(),
                    existing: stored.provenance().clone(),
                    incoming: candidate.provenance().clone(),
                });
                continue;
            }

            let merged = stored.absorb(&candidate);
            match slots.get(candidate.id()) {
                Some(Slot::Inserted(idx)) => plan.to_insert[*idx] = merged,
                Some(Slot::Updated(idx)) => plan.to_update[*idx] = merged,
                _ => {
                    slots.insert(candidate.id().to_string(), Slot::Updated(plan.to_update.len()));
                    plan.to_update.push(merged);
                }
            }
        }
        plan
    }

    fn collect_hints<T: Canonical>(&self, current: &[T], candidate: &T, hints: &mut Vec<ReviewHint>) {
        let key = identity_key(&candidate.identity_text());
        if key.is_empty() {
            return;
        }
        for other in current {
            if other.id() == candidate.id() {
                continue;
            }
            let score = jaro_winkler(&key, &identity_key(&other.identity_text()));
            if score >= self.config.review_threshold {
                hints.push(ReviewHint {
                    kind: T::KIND,
                    candidate_id: candidate.id().to_string(),
                    existing_id: other.id().to_string(),
                    score,
                });
            }
        }
    }
}
