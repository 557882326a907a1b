//! Numeric pair to listing key resolution and back.
//!
//! Resolution walks an ordered list of strategies. Each one either finds the
//! listing or hands over to the next; running off the end means not found.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IdentifierError;
use crate::schema::IndexedQuery;
use crate::store::DocumentStore;
use crate::types::{ListingKey, NumericPair};

/// Outcome of one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupStep {
    Found(ListingKey),
    TryNext,
}

#[async_trait]
pub trait LookupStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Indexed queries the strategy issues, in order.
    fn queries(&self) -> &'static [IndexedQuery];

    async fn lookup(
        &self,
        store: &dyn DocumentStore,
        pair: NumericPair,
    ) -> Result<LookupStep, IdentifierError>;
}

/// Queries the denormalized `(owner_numeric_id, listing_numeric_id)` pair.
pub struct DirectPairStrategy;

#[async_trait]
impl LookupStrategy for DirectPairStrategy {
    fn name(&self) -> &'static str {
        "direct_pair"
    }

    fn queries(&self) -> &'static [IndexedQuery] {
        &[IndexedQuery::ListingByNumericPair]
    }

    async fn lookup(
        &self,
        store: &dyn DocumentStore,
        pair: NumericPair,
    ) -> Result<LookupStep, IdentifierError> {
        let found = store
            .find_listing_by_numeric_pair(pair.owner_numeric_id, pair.listing_numeric_id)
            .await?;
        Ok(found.map_or(LookupStep::TryNext, LookupStep::Found))
    }
}

/// Maps the owner number to its account key, then queries listings by
/// `(owner_key, listing_numeric_id)`. Finds listings that predate the
/// denormalized owner number.
pub struct OwnerIndexStrategy;

#[async_trait]
impl LookupStrategy for OwnerIndexStrategy {
    fn name(&self) -> &'static str {
        "owner_index"
    }

    fn queries(&self) -> &'static [IndexedQuery] {
        &[
            IndexedQuery::AccountByNumericId,
            IndexedQuery::ListingByOwnerKey,
        ]
    }

    async fn lookup(
        &self,
        store: &dyn DocumentStore,
        pair: NumericPair,
    ) -> Result<LookupStep, IdentifierError> {
        let Some(owner_key) = store.find_account_by_numeric_id(pair.owner_numeric_id).await?
        else {
            tracing::warn!(
                owner_numeric_id = pair.owner_numeric_id,
                "lookup fallback found no account for owner number"
            );
            return Ok(LookupStep::TryNext);
        };
        let found = store
            .find_listing_by_owner_key(&owner_key, pair.listing_numeric_id)
            .await?;
        Ok(found.map_or(LookupStep::TryNext, LookupStep::Found))
    }
}

#[derive(Clone)]
pub struct IdentifierLookup {
    store: Arc<dyn DocumentStore>,
    strategies: Arc<Vec<Box<dyn LookupStrategy>>>,
}

impl IdentifierLookup {
    /// Direct pair query first, owner-index fallback second.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_strategies(
            store,
            vec![Box::new(DirectPairStrategy), Box::new(OwnerIndexStrategy)],
        )
    }

    pub fn with_strategies(
        store: Arc<dyn DocumentStore>,
        strategies: Vec<Box<dyn LookupStrategy>>,
    ) -> Self {
        Self {
            store,
            strategies: Arc::new(strategies),
        }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    /// Listing key for the numeric pair, `None` when no strategy finds one.
    pub async fn resolve(
        &self,
        owner_numeric_id: i64,
        listing_numeric_id: i64,
    ) -> Result<Option<ListingKey>, IdentifierError> {
        let pair = NumericPair {
            owner_numeric_id,
            listing_numeric_id,
        };
        for strategy in self.strategies.iter() {
            if let LookupStep::Found(listing_key) =
                strategy.lookup(self.store.as_ref(), pair).await?
            {
                tracing::debug!(
                    strategy = strategy.name(),
                    owner_numeric_id,
                    listing_numeric_id,
                    listing_key = %listing_key,
                    "listing resolved"
                );
                return Ok(Some(listing_key));
            }
        }
        Ok(None)
    }

    /// Numeric pair of a listing. Listings without a stored owner number take
    /// it from the owner's account; `None` if either side is unknown.
    pub async fn resolve_numeric(
        &self,
        listing_key: &ListingKey,
    ) -> Result<Option<NumericPair>, IdentifierError> {
        let Some(listing) = self.store.get_listing(listing_key).await? else {
            return Ok(None);
        };
        let listing = listing.record;
        let owner_numeric_id = match listing.owner_numeric_id {
            Some(owner_numeric_id) => Some(owner_numeric_id),
            None => self
                .store
                .get_account(&listing.owner_key)
                .await?
                .and_then(|account| account.record.numeric_id),
        };
        if owner_numeric_id.is_none() {
            tracing::warn!(
                listing_key = %listing_key,
                owner_key = %listing.owner_key,
                "listing owner has no numeric id"
            );
        }
        Ok(owner_numeric_id.map(|owner_numeric_id| NumericPair {
            owner_numeric_id,
            listing_numeric_id: listing.listing_numeric_id,
        }))
    }
}
