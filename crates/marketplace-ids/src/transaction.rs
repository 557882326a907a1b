//! Optimistic transactions over a [`DocumentStore`] with bounded retry.
//!
//! A [`Transaction`] records the version of every document it reads and
//! buffers every write. Nothing touches the store until the attempt commits,
//! so an attempt that fails for any reason leaves no trace. Version conflicts
//! at commit time rerun the whole body against fresh reads.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::IdentifierError;
use crate::store::{CommitBatch, Document, DocumentKey, DocumentStore, StagedWrite, StoreError};
use crate::types::{AccountKey, AccountRecord, CounterRecord, ListingKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 25,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep after the given failed attempt (0-based).
    #[must_use]
    pub fn backoff_ceiling_ms(&self, attempt: u32) -> u64 {
        let capped_attempt = attempt.min(8);
        let multiplier = 1_u64 << capped_attempt;
        self.base_backoff_ms
            .saturating_mul(multiplier)
            .min(self.max_backoff_ms)
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling_ms(attempt);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=ceiling))
    }
}

pub struct Transaction {
    store: Arc<dyn DocumentStore>,
    read_versions: BTreeMap<DocumentKey, u64>,
    staged: BTreeMap<DocumentKey, Document>,
}

impl Transaction {
    fn begin(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            read_versions: BTreeMap::new(),
            staged: BTreeMap::new(),
        }
    }

    pub async fn counter(&mut self, scope_key: &str) -> Result<Option<CounterRecord>, StoreError> {
        let key = DocumentKey::Counter(scope_key.to_string());
        if let Some(Document::Counter(record)) = self.staged.get(&key) {
            return Ok(Some(record.clone()));
        }
        let row = self.store.get_counter(scope_key).await?;
        self.note_read(key, row.as_ref().map(|row| row.version));
        Ok(row.map(|row| row.record))
    }

    pub async fn account(
        &mut self,
        account_key: &AccountKey,
    ) -> Result<Option<AccountRecord>, StoreError> {
        let key = DocumentKey::Account(account_key.clone());
        if let Some(Document::Account(record)) = self.staged.get(&key) {
            return Ok(Some(record.clone()));
        }
        let row = self.store.get_account(account_key).await?;
        self.note_read(key, row.as_ref().map(|row| row.version));
        Ok(row.map(|row| row.record))
    }

    /// Buffers a write. A document never read in this transaction is staged
    /// as an insert and conflicts if it already exists.
    pub fn stage(&mut self, document: Document) {
        self.staged.insert(document.key(), document);
    }

    pub fn new_listing_key(&self) -> ListingKey {
        self.store.new_listing_key()
    }

    fn note_read(&mut self, key: DocumentKey, version: Option<u64>) {
        self.read_versions.entry(key).or_insert(version.unwrap_or(0));
    }

    fn into_batch(self) -> CommitBatch {
        let Self {
            read_versions,
            staged,
            ..
        } = self;
        let checks = read_versions
            .iter()
            .filter(|(key, _)| !staged.contains_key(*key))
            .map(|(key, version)| (key.clone(), *version))
            .collect();
        let writes = staged
            .into_iter()
            .map(|(key, document)| StagedWrite {
                expected_version: read_versions.get(&key).copied().unwrap_or(0),
                document,
            })
            .collect();
        CommitBatch { checks, writes }
    }
}

/// Work performed inside one transaction attempt. `apply` may run several
/// times, so it must not have effects outside the transaction.
#[async_trait]
pub trait TransactionBody: Send + Sync {
    type Output: Send;

    async fn apply(&self, tx: &mut Transaction) -> Result<Self::Output, IdentifierError>;
}

pub async fn run_transaction<B>(
    store: &Arc<dyn DocumentStore>,
    policy: &RetryPolicy,
    operation: &'static str,
    body: &B,
) -> Result<B::Output, IdentifierError>
where
    B: TransactionBody + ?Sized,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        let mut tx = Transaction::begin(store.clone());
        let output = body.apply(&mut tx).await?;
        match store.commit(tx.into_batch()).await {
            Ok(()) => return Ok(output),
            Err(StoreError::Conflict(reason)) => {
                tracing::debug!(operation, attempt, %reason, "transaction conflict");
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.jittered_backoff(attempt)).await;
                }
            }
            Err(error) => return Err(IdentifierError::Store(error)),
        }
    }
    tracing::warn!(operation, attempts, "transaction retry budget exhausted");
    Err(IdentifierError::ConflictExhausted {
        operation,
        attempts,
    })
}
