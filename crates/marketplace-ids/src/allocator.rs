//! Scoped counter allocation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::IdentifierError;
use crate::store::{Document, DocumentStore, StoreError};
use crate::transaction::{RetryPolicy, Transaction, TransactionBody, run_transaction};
use crate::types::{CounterRecord, ScopeKey};

#[derive(Clone)]
pub struct CounterAllocator {
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
}

struct AllocateNext {
    scope_key: String,
}

#[async_trait]
impl TransactionBody for AllocateNext {
    type Output = i64;

    async fn apply(&self, tx: &mut Transaction) -> Result<i64, IdentifierError> {
        stage_next(tx, self.scope_key.as_str()).await
    }
}

impl CounterAllocator {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Issues the next value for `scope` in its own transaction.
    pub async fn allocate_next(&self, scope: &ScopeKey) -> Result<i64, IdentifierError> {
        let body = AllocateNext {
            scope_key: scope.storage_key(),
        };
        let issued = run_transaction(&self.store, &self.policy, "allocate_next", &body).await?;
        tracing::debug!(scope_key = %scope, issued, "counter value issued");
        Ok(issued)
    }

    /// Last value issued for `scope`, 0 if nothing was ever issued.
    pub async fn current(&self, scope: &ScopeKey) -> Result<i64, IdentifierError> {
        let row = self.store.get_counter(scope.storage_key().as_str()).await?;
        Ok(row.map_or(0, |row| row.record.count))
    }
}

/// Reads the counter for `scope_key` inside `tx`, stages `count + 1` and
/// returns it. A missing counter counts as 0, so the first value is 1.
pub async fn stage_next(tx: &mut Transaction, scope_key: &str) -> Result<i64, IdentifierError> {
    let current = tx.counter(scope_key).await?.map_or(0, |row| row.count);
    let next = current.checked_add(1).ok_or_else(|| {
        StoreError::Db(format!("counter {scope_key} cannot advance past {current}"))
    })?;
    tx.stage(Document::Counter(CounterRecord {
        scope_key: scope_key.to_string(),
        count: next,
        updated_at: Utc::now(),
    }));
    Ok(next)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Result;
    use futures::future::join_all;

    use chrono::Utc;

    use super::CounterAllocator;
    use crate::error::IdentifierError;
    use crate::store::{self, CommitBatch, Document, StagedWrite, StoreError};
    use crate::transaction::RetryPolicy;
    use crate::types::{AccountKey, CounterRecord, ScopeKey};

    fn allocator(max_attempts: u32) -> CounterAllocator {
        CounterAllocator::new(
            store::memory(),
            RetryPolicy {
                max_attempts,
                base_backoff_ms: 0,
                max_backoff_ms: 2,
            },
        )
    }

    #[tokio::test]
    async fn first_allocation_is_one_and_sequential_calls_are_dense() -> Result<()> {
        let allocator = allocator(3);
        let scope = ScopeKey::GlobalAccounts;
        assert_eq!(allocator.current(&scope).await?, 0);
        for expected in 1..=4 {
            assert_eq!(allocator.allocate_next(&scope).await?, expected);
        }
        assert_eq!(allocator.current(&scope).await?, 4);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_are_unique_and_gap_free() -> Result<()> {
        const CALLERS: i64 = 24;
        let allocator = allocator(CALLERS as u32);
        let scope = ScopeKey::GlobalAccounts;
        for _ in 0..5 {
            allocator.allocate_next(&scope).await?;
        }

        let handles = (0..CALLERS).map(|_| {
            let allocator = allocator.clone();
            let scope = scope.clone();
            tokio::spawn(async move { allocator.allocate_next(&scope).await })
        });
        let mut issued = BTreeSet::new();
        for joined in join_all(handles).await {
            assert!(issued.insert(joined??), "duplicate value issued");
        }

        let expected = (6..=5 + CALLERS).collect::<BTreeSet<_>>();
        assert_eq!(issued, expected);
        assert_eq!(allocator.current(&scope).await?, 5 + CALLERS);
        Ok(())
    }

    #[tokio::test]
    async fn scopes_do_not_share_counters() -> Result<()> {
        let allocator = allocator(3);
        let alice = ScopeKey::AccountListings(AccountKey::new("alice")?);
        let bob = ScopeKey::AccountListings(AccountKey::new("bob")?);

        allocator.allocate_next(&alice).await?;
        allocator.allocate_next(&alice).await?;
        assert_eq!(allocator.allocate_next(&bob).await?, 1);
        assert_eq!(allocator.current(&alice).await?, 2);
        assert_eq!(allocator.current(&ScopeKey::GlobalAccounts).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn saturated_counter_fails_as_store_error_and_stays_put() -> Result<()> {
        let store = store::memory();
        let scope = ScopeKey::GlobalAccounts;
        store
            .commit(CommitBatch {
                checks: Vec::new(),
                writes: vec![StagedWrite {
                    expected_version: 0,
                    document: Document::Counter(CounterRecord {
                        scope_key: scope.storage_key(),
                        count: i64::MAX,
                        updated_at: Utc::now(),
                    }),
                }],
            })
            .await?;
        let allocator = CounterAllocator::new(store, RetryPolicy::default());

        let error = allocator.allocate_next(&scope).await.err();
        assert!(matches!(
            error,
            Some(IdentifierError::Store(StoreError::Db(_)))
        ));
        assert_eq!(error.map(|error| error.code()), Some("store_failure"));
        assert_eq!(allocator.current(&scope).await?, i64::MAX);
        Ok(())
    }
}
