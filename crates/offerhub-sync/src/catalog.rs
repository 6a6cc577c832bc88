//! Read-only query surface over the latest committed snapshot.

use offerhub_core::{Benefit, Offer, OfferCategory, RedemptionOption, TipCategory, TravelTip};
use offerhub_storage::{StoreError, VersionedStore};

use crate::orchestrator::{CycleReport, LAST_CYCLE_REPORT};

/// Each call loads one consistent snapshot; concurrent commits swap the
/// snapshot atomically and never show up half-applied.
#[derive(Debug, Clone)]
pub struct Catalog {
    store: VersionedStore,
}

impl Catalog {
    pub fn new(store: VersionedStore) -> Self {
        Self { store }
    }

    pub async fn list_offers(
        &self,
        category: Option<OfferCategory>,
        active_only: bool,
    ) -> Result<Vec<Offer>, StoreError> {
        let dataset = self.store.load().await?;
        Ok(dataset
            .offers
            .into_iter()
            .filter(|o| !active_only || o.is_active)
            .filter(|o| category.map_or(true, |c| o.category == c))
            .collect())
    }

    /// Card name match is case-insensitive and exact.
    pub async fn list_benefits(&self, card_name: Option<&str>) -> Result<Vec<Benefit>, StoreError> {
        let dataset = self.store.load().await?;
        let wanted = card_name.map(str::to_lowercase);
        Ok(dataset
            .benefits
            .into_iter()
            .filter(|b| wanted.as_deref().map_or(true, |w| b.card_name.to_lowercase() == w))
            .collect())
    }

    pub async fn list_redemption_options(&self, available_only: bool) -> Result<Vec<RedemptionOption>, StoreError> {
        let dataset = self.store.load().await?;
        Ok(dataset
            .redemption_options
            .into_iter()
            .filter(|r| !available_only || r.available)
            .collect())
    }

    pub async fn list_travel_tips(&self, category: Option<TipCategory>) -> Result<Vec<TravelTip>, StoreError> {
        let dataset = self.store.load().await?;
        Ok(dataset
            .travel_tips
            .into_iter()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .collect())
    }

    /// Report of the most recent cycle, if one has run against this store.
    pub async fn get_stats(&self) -> Result<Option<CycleReport>, StoreError> {
        self.store.read_report(LAST_CYCLE_REPORT).await
    }
}
