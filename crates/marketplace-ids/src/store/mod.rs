//! Transactional document store seam.
//!
//! Every document carries a version that starts at 1 on insert and increments
//! on each committed write; version 0 means "absent". A [`CommitBatch`] names
//! the version each touched document had when it was read, and the store
//! applies the whole batch only if every one of those versions still holds.
//! Any mismatch rejects the batch with [`StoreError::Conflict`] and nothing is
//! written, which is what lets callers retry a whole transaction attempt.

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::IdsDb;
use crate::types::{AccountKey, AccountRecord, CounterRecord, ListingKey, ListingRecord};

mod memory;
mod postgres;

pub use memory::{CommitFault, MemoryDocumentStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Address of one document in one collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocumentKey {
    Counter(String),
    Account(AccountKey),
    Listing(ListingKey),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Counter(CounterRecord),
    Account(AccountRecord),
    Listing(ListingRecord),
}

impl Document {
    pub fn key(&self) -> DocumentKey {
        match self {
            Self::Counter(record) => DocumentKey::Counter(record.scope_key.clone()),
            Self::Account(record) => DocumentKey::Account(record.account_key.clone()),
            Self::Listing(record) => DocumentKey::Listing(record.listing_key.clone()),
        }
    }
}

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

/// A write guarded by the version the document had when the transaction saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    pub expected_version: u64,
    pub document: Document,
}

/// Everything one transaction attempt wants to commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    /// Documents that were read but not written; their versions must be unchanged.
    pub checks: Vec<(DocumentKey, u64)>,
    pub writes: Vec<StagedWrite>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.writes.is_empty()
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_counter(
        &self,
        scope_key: &str,
    ) -> Result<Option<Versioned<CounterRecord>>, StoreError>;

    async fn get_account(
        &self,
        account_key: &AccountKey,
    ) -> Result<Option<Versioned<AccountRecord>>, StoreError>;

    async fn get_listing(
        &self,
        listing_key: &ListingKey,
    ) -> Result<Option<Versioned<ListingRecord>>, StoreError>;

    /// Applies the batch atomically or not at all.
    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError>;

    async fn find_listing_by_numeric_pair(
        &self,
        owner_numeric_id: i64,
        listing_numeric_id: i64,
    ) -> Result<Option<ListingKey>, StoreError>;

    async fn find_listing_by_owner_key(
        &self,
        owner_key: &AccountKey,
        listing_numeric_id: i64,
    ) -> Result<Option<ListingKey>, StoreError>;

    async fn find_account_by_numeric_id(
        &self,
        numeric_id: i64,
    ) -> Result<Option<AccountKey>, StoreError>;

    /// Generates a fresh opaque key for a listing document.
    fn new_listing_key(&self) -> ListingKey;
}

pub fn memory() -> Arc<dyn DocumentStore> {
    Arc::new(MemoryDocumentStore::default())
}

pub fn postgres(db: Arc<IdsDb>) -> Arc<dyn DocumentStore> {
    Arc::new(postgres::PostgresDocumentStore::new(db))
}

fn generate_listing_key() -> ListingKey {
    ListingKey::from_uuid(uuid::Uuid::new_v4())
}
