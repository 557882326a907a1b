use std::sync::Arc;

use anyhow::Result;

use crate::allocator::CounterAllocator;
use crate::bootstrap::AccountBootstrap;
use crate::config::Config;
use crate::db::IdsDb;
use crate::error::IdentifierError;
use crate::listings::ListingCoordinator;
use crate::lookup::IdentifierLookup;
use crate::store::{self, DocumentStore};
use crate::transaction::RetryPolicy;
use crate::types::{
    AccountKey, AccountRecord, ListingDraft, ListingKey, ListingRecord, NumericPair, ScopeKey,
};

/// Entry point for identifier allocation, listing creation and lookups over
/// one document store.
#[derive(Clone)]
pub struct IdentifierService {
    store: Arc<dyn DocumentStore>,
    allocator: CounterAllocator,
    bootstrap: AccountBootstrap,
    listings: ListingCoordinator,
    lookup: IdentifierLookup,
}

impl IdentifierService {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        Self {
            allocator: CounterAllocator::new(store.clone(), policy.clone()),
            bootstrap: AccountBootstrap::new(store.clone(), policy.clone()),
            listings: ListingCoordinator::new(store.clone(), policy),
            lookup: IdentifierLookup::new(store.clone()),
            store,
        }
    }

    /// Connects to Postgres and applies the schema when a database URL is
    /// configured, otherwise runs on the in-memory store.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = match config.db_url.as_deref() {
            Some(db_url) => {
                let db = IdsDb::connect(db_url).await?;
                db.apply_schema().await?;
                tracing::info!(service = %config.service_name, "using postgres document store");
                store::postgres(Arc::new(db))
            }
            None => {
                tracing::info!(service = %config.service_name, "using in-memory document store");
                store::memory()
            }
        };
        Ok(Self::new(store, config.retry.clone()))
    }

    pub async fn allocate_next(&self, scope: &ScopeKey) -> Result<i64, IdentifierError> {
        self.allocator.allocate_next(scope).await
    }

    pub async fn current_count(&self, scope: &ScopeKey) -> Result<i64, IdentifierError> {
        self.allocator.current(scope).await
    }

    pub async fn ensure_numeric_id(&self, account_key: &AccountKey) -> Result<i64, IdentifierError> {
        self.bootstrap.ensure_numeric_id(account_key).await
    }

    pub async fn create_listing(
        &self,
        owner_key: &AccountKey,
        draft: ListingDraft,
    ) -> Result<ListingRecord, IdentifierError> {
        self.listings.create_listing(owner_key, draft).await
    }

    pub async fn resolve(
        &self,
        owner_numeric_id: i64,
        listing_numeric_id: i64,
    ) -> Result<Option<ListingKey>, IdentifierError> {
        self.lookup.resolve(owner_numeric_id, listing_numeric_id).await
    }

    pub async fn resolve_numeric(
        &self,
        listing_key: &ListingKey,
    ) -> Result<Option<NumericPair>, IdentifierError> {
        self.lookup.resolve_numeric(listing_key).await
    }

    pub async fn account(
        &self,
        account_key: &AccountKey,
    ) -> Result<Option<AccountRecord>, IdentifierError> {
        let row = self.store.get_account(account_key).await?;
        Ok(row.map(|row| row.record))
    }

    pub async fn listing(
        &self,
        listing_key: &ListingKey,
    ) -> Result<Option<ListingRecord>, IdentifierError> {
        let row = self.store.get_listing(listing_key).await?;
        Ok(row.map(|row| row.record))
    }
}
