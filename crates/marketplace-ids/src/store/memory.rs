use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::store::{
    CommitBatch, Document, DocumentKey, DocumentStore, StoreError, Versioned,
    generate_listing_key,
};
use crate::types::{AccountKey, AccountRecord, CounterRecord, ListingKey, ListingRecord};

/// One-shot failure for the next commit that carries more than `after_writes`
/// writes. The commit stops after applying that many writes, rolls them back
/// and reports a db error, so none of them stay visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitFault {
    pub after_writes: usize,
}

/// In-memory document store used by tests and the smoke binary.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<MemoryDocumentStoreInner>,
}

#[derive(Default)]
struct MemoryDocumentStoreInner {
    counters: HashMap<String, Versioned<CounterRecord>>,
    accounts: HashMap<AccountKey, Versioned<AccountRecord>>,
    listings: HashMap<ListingKey, Versioned<ListingRecord>>,
    accounts_by_numeric_id: HashMap<i64, AccountKey>,
    listings_by_numeric_pair: HashMap<(i64, i64), ListingKey>,
    listings_by_owner_key: HashMap<(AccountKey, i64), ListingKey>,
    fault: Option<CommitFault>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn inject_fault(&self, fault: CommitFault) {
        self.inner.lock().await.fault = Some(fault);
    }

    pub async fn listing_count(&self) -> usize {
        self.inner.lock().await.listings.len()
    }
}

/// State a commit in progress displaced, restored if the commit fails.
enum Undo {
    Counter(String, Option<Versioned<CounterRecord>>),
    Account(AccountKey, Option<Versioned<AccountRecord>>),
    Listing(ListingKey, Option<Versioned<ListingRecord>>),
}

impl MemoryDocumentStoreInner {
    fn version_of(&self, key: &DocumentKey) -> u64 {
        match key {
            DocumentKey::Counter(scope_key) => self.counters.get(scope_key).map(|row| row.version),
            DocumentKey::Account(account_key) => {
                self.accounts.get(account_key).map(|row| row.version)
            }
            DocumentKey::Listing(listing_key) => {
                self.listings.get(listing_key).map(|row| row.version)
            }
        }
        .unwrap_or(0)
    }

    /// Writes one document in place. Unique indexes are checked before
    /// anything changes, so an error leaves the state untouched.
    fn apply(&mut self, expected_version: u64, document: Document) -> Result<Undo, StoreError> {
        let version = expected_version + 1;
        match document {
            Document::Counter(record) => {
                let scope_key = record.scope_key.clone();
                let previous = self
                    .counters
                    .insert(scope_key.clone(), Versioned { version, record });
                Ok(Undo::Counter(scope_key, previous))
            }
            Document::Account(record) => {
                if let Some(numeric_id) = record.numeric_id
                    && let Some(holder) = self.accounts_by_numeric_id.get(&numeric_id)
                    && holder != &record.account_key
                {
                    return Err(StoreError::UniqueViolation(format!(
                        "account numeric_id {numeric_id} already held by {holder}"
                    )));
                }
                let account_key = record.account_key.clone();
                let previous = self.remove_account(&account_key);
                self.insert_account(Versioned { version, record });
                Ok(Undo::Account(account_key, previous))
            }
            Document::Listing(record) => {
                if let Some(holder) = self
                    .listings_by_owner_key
                    .get(&(record.owner_key.clone(), record.listing_numeric_id))
                    && holder != &record.listing_key
                {
                    return Err(StoreError::UniqueViolation(format!(
                        "listing {} already numbered {} for owner {}",
                        holder, record.listing_numeric_id, record.owner_key
                    )));
                }
                if let Some(owner_numeric_id) = record.owner_numeric_id
                    && let Some(holder) = self
                        .listings_by_numeric_pair
                        .get(&(owner_numeric_id, record.listing_numeric_id))
                    && holder != &record.listing_key
                {
                    return Err(StoreError::UniqueViolation(format!(
                        "numeric pair ({owner_numeric_id}, {}) already held by {holder}",
                        record.listing_numeric_id
                    )));
                }
                let listing_key = record.listing_key.clone();
                let previous = self.remove_listing(&listing_key);
                self.insert_listing(Versioned { version, record });
                Ok(Undo::Listing(listing_key, previous))
            }
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Counter(scope_key, previous) => match previous {
                Some(row) => {
                    self.counters.insert(scope_key, row);
                }
                None => {
                    self.counters.remove(&scope_key);
                }
            },
            Undo::Account(account_key, previous) => {
                self.remove_account(&account_key);
                if let Some(row) = previous {
                    self.insert_account(row);
                }
            }
            Undo::Listing(listing_key, previous) => {
                self.remove_listing(&listing_key);
                if let Some(row) = previous {
                    self.insert_listing(row);
                }
            }
        }
    }

    fn remove_account(&mut self, account_key: &AccountKey) -> Option<Versioned<AccountRecord>> {
        let previous = self.accounts.remove(account_key)?;
        if let Some(numeric_id) = previous.record.numeric_id {
            self.accounts_by_numeric_id.remove(&numeric_id);
        }
        Some(previous)
    }

    fn insert_account(&mut self, row: Versioned<AccountRecord>) {
        if let Some(numeric_id) = row.record.numeric_id {
            self.accounts_by_numeric_id
                .insert(numeric_id, row.record.account_key.clone());
        }
        self.accounts.insert(row.record.account_key.clone(), row);
    }

    fn remove_listing(&mut self, listing_key: &ListingKey) -> Option<Versioned<ListingRecord>> {
        let previous = self.listings.remove(listing_key)?;
        let record = &previous.record;
        self.listings_by_owner_key
            .remove(&(record.owner_key.clone(), record.listing_numeric_id));
        if let Some(owner_numeric_id) = record.owner_numeric_id {
            self.listings_by_numeric_pair
                .remove(&(owner_numeric_id, record.listing_numeric_id));
        }
        Some(previous)
    }

    fn insert_listing(&mut self, row: Versioned<ListingRecord>) {
        let record = &row.record;
        self.listings_by_owner_key.insert(
            (record.owner_key.clone(), record.listing_numeric_id),
            record.listing_key.clone(),
        );
        if let Some(owner_numeric_id) = record.owner_numeric_id {
            self.listings_by_numeric_pair.insert(
                (owner_numeric_id, record.listing_numeric_id),
                record.listing_key.clone(),
            );
        }
        self.listings.insert(record.listing_key.clone(), row);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_counter(
        &self,
        scope_key: &str,
    ) -> Result<Option<Versioned<CounterRecord>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.counters.get(scope_key).cloned())
    }

    async fn get_account(
        &self,
        account_key: &AccountKey,
    ) -> Result<Option<Versioned<AccountRecord>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(account_key).cloned())
    }

    async fn get_listing(
        &self,
        listing_key: &ListingKey,
    ) -> Result<Option<Versioned<ListingRecord>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.listings.get(listing_key).cloned())
    }

    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        for (key, expected_version) in &batch.checks {
            let actual = inner.version_of(key);
            if actual != *expected_version {
                return Err(StoreError::Conflict(format!(
                    "{key:?} read at version {expected_version}, now {actual}"
                )));
            }
        }
        for write in &batch.writes {
            let key = write.document.key();
            let actual = inner.version_of(&key);
            if actual != write.expected_version {
                return Err(StoreError::Conflict(format!(
                    "{key:?} staged against version {}, now {actual}",
                    write.expected_version
                )));
            }
        }

        let fault = inner
            .fault
            .filter(|fault| batch.writes.len() > fault.after_writes);
        let mut undo_log = Vec::with_capacity(batch.writes.len());
        let mut failure = None;
        for (applied, write) in batch.writes.into_iter().enumerate() {
            if let Some(fault) = fault
                && applied == fault.after_writes
            {
                inner.fault = None;
                failure = Some(StoreError::Db(format!(
                    "injected commit fault after {applied} writes"
                )));
                break;
            }
            match inner.apply(write.expected_version, write.document) {
                Ok(undo) => undo_log.push(undo),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        if let Some(error) = failure {
            for undo in undo_log.into_iter().rev() {
                inner.revert(undo);
            }
            return Err(error);
        }
        Ok(())
    }

    async fn find_listing_by_numeric_pair(
        &self,
        owner_numeric_id: i64,
        listing_numeric_id: i64,
    ) -> Result<Option<ListingKey>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .listings_by_numeric_pair
            .get(&(owner_numeric_id, listing_numeric_id))
            .cloned())
    }

    async fn find_listing_by_owner_key(
        &self,
        owner_key: &AccountKey,
        listing_numeric_id: i64,
    ) -> Result<Option<ListingKey>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .listings_by_owner_key
            .get(&(owner_key.clone(), listing_numeric_id))
            .cloned())
    }

    async fn find_account_by_numeric_id(
        &self,
        numeric_id: i64,
    ) -> Result<Option<AccountKey>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts_by_numeric_id.get(&numeric_id).cloned())
    }

    fn new_listing_key(&self) -> ListingKey {
        generate_listing_key()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};
    use chrono::Utc;

    use super::{CommitFault, MemoryDocumentStore};
    use crate::store::{CommitBatch, Document, DocumentKey, DocumentStore, StagedWrite};
    use crate::types::{AccountKey, AccountRecord, CounterRecord};

    fn counter(scope_key: &str, count: i64) -> Document {
        Document::Counter(CounterRecord {
            scope_key: scope_key.to_string(),
            count,
            updated_at: Utc::now(),
        })
    }

    fn account(key: &AccountKey, numeric_id: Option<i64>) -> Document {
        let now = Utc::now();
        Document::Account(AccountRecord {
            account_key: key.clone(),
            numeric_id,
            total_listings: 0,
            active_listings: 0,
            created_at: now,
            updated_at: now,
        })
    }

    #[tokio::test]
    async fn commit_rejects_stale_versions_without_writing() -> Result<()> {
        let store = MemoryDocumentStore::new();
        store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![StagedWrite {
                    expected_version: 0,
                    document: counter("global:accounts", 1),
                }],
            })
            .await?;

        let stale = store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![StagedWrite {
                    expected_version: 0,
                    document: counter("global:accounts", 1),
                }],
            })
            .await;
        assert!(matches!(stale, Err(crate::store::StoreError::Conflict(_))));

        let row = store
            .get_counter("global:accounts")
            .await?
            .ok_or_else(|| anyhow!("counter missing"))?;
        assert_eq!(row.version, 1);
        assert_eq!(row.record.count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn read_only_checks_guard_the_batch() -> Result<()> {
        let store = MemoryDocumentStore::new();
        let key = AccountKey::new("acct_a")?;
        store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![StagedWrite {
                    expected_version: 0,
                    document: account(&key, None),
                }],
            })
            .await?;

        let result = store
            .commit(CommitBatch {
                checks: vec![(DocumentKey::Account(key.clone()), 0)],
                writes: vec![StagedWrite {
                    expected_version: 0,
                    document: counter("listings:acct_a", 1),
                }],
            })
            .await;
        assert!(matches!(result, Err(crate::store::StoreError::Conflict(_))));
        assert!(store.get_counter("listings:acct_a").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn account_numeric_ids_are_unique() -> Result<()> {
        let store = MemoryDocumentStore::new();
        let first = AccountKey::new("acct_a")?;
        let second = AccountKey::new("acct_b")?;
        store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![StagedWrite {
                    expected_version: 0,
                    document: account(&first, Some(7)),
                }],
            })
            .await?;

        let duplicate = store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![StagedWrite {
                    expected_version: 0,
                    document: account(&second, Some(7)),
                }],
            })
            .await;
        assert!(matches!(
            duplicate,
            Err(crate::store::StoreError::UniqueViolation(_))
        ));
        assert_eq!(store.find_account_by_numeric_id(7).await?, Some(first));
        Ok(())
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_earlier_writes_and_their_indexes() -> Result<()> {
        let store = MemoryDocumentStore::new();
        let holder = AccountKey::new("acct_a")?;
        let pending = AccountKey::new("acct_b")?;
        let intruder = AccountKey::new("acct_c")?;
        store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![
                    StagedWrite {
                        expected_version: 0,
                        document: account(&holder, Some(7)),
                    },
                    StagedWrite {
                        expected_version: 0,
                        document: account(&pending, None),
                    },
                ],
            })
            .await?;

        // The first write lands in place, the second trips the unique index.
        let result = store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![
                    StagedWrite {
                        expected_version: 1,
                        document: account(&pending, Some(3)),
                    },
                    StagedWrite {
                        expected_version: 0,
                        document: account(&intruder, Some(7)),
                    },
                ],
            })
            .await;
        assert!(matches!(
            result,
            Err(crate::store::StoreError::UniqueViolation(_))
        ));

        let row = store
            .get_account(&pending)
            .await?
            .ok_or_else(|| anyhow!("account missing"))?;
        assert_eq!(row.version, 1);
        assert_eq!(row.record.numeric_id, None);
        assert_eq!(store.find_account_by_numeric_id(3).await?, None);
        assert_eq!(store.find_account_by_numeric_id(7).await?, Some(holder));
        assert!(store.get_account(&intruder).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn injected_fault_discards_partial_writes() -> Result<()> {
        let store = MemoryDocumentStore::new();
        let key = AccountKey::new("acct_a")?;
        store.inject_fault(CommitFault { after_writes: 1 }).await;

        let result = store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![
                    StagedWrite {
                        expected_version: 0,
                        document: counter("global:accounts", 1),
                    },
                    StagedWrite {
                        expected_version: 0,
                        document: account(&key, Some(1)),
                    },
                ],
            })
            .await;
        assert!(matches!(result, Err(crate::store::StoreError::Db(_))));
        assert!(store.get_counter("global:accounts").await?.is_none());
        assert!(store.get_account(&key).await?.is_none());

        // The fault is one-shot.
        store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![StagedWrite {
                    expected_version: 0,
                    document: counter("global:accounts", 1),
                }],
            })
            .await?;
        assert!(store.get_counter("global:accounts").await?.is_some());
        Ok(())
    }
}
