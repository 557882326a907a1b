//! One-time assignment of global account numeric ids.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::allocator::stage_next;
use crate::error::IdentifierError;
use crate::store::{Document, DocumentStore};
use crate::transaction::{RetryPolicy, Transaction, TransactionBody, run_transaction};
use crate::types::{AccountKey, AccountRecord, ScopeKey};

#[derive(Clone)]
pub struct AccountBootstrap {
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapOutcome {
    AlreadyAssigned(i64),
    Assigned(i64),
}

struct EnsureNumericId {
    account_key: AccountKey,
}

#[async_trait]
impl TransactionBody for EnsureNumericId {
    type Output = BootstrapOutcome;

    async fn apply(&self, tx: &mut Transaction) -> Result<BootstrapOutcome, IdentifierError> {
        // The existence check and the assignment share this attempt, so two
        // racing bootstraps of one account cannot both assign.
        let existing = tx.account(&self.account_key).await?;
        if let Some(numeric_id) = existing.as_ref().and_then(|account| account.numeric_id) {
            return Ok(BootstrapOutcome::AlreadyAssigned(numeric_id));
        }

        let numeric_id = stage_next(tx, ScopeKey::GlobalAccounts.storage_key().as_str()).await?;
        let now = Utc::now();
        let account = match existing {
            Some(mut account) => {
                account.numeric_id = Some(numeric_id);
                account.updated_at = now;
                account
            }
            None => AccountRecord {
                account_key: self.account_key.clone(),
                numeric_id: Some(numeric_id),
                total_listings: 0,
                active_listings: 0,
                created_at: now,
                updated_at: now,
            },
        };
        tx.stage(Document::Account(account));
        Ok(BootstrapOutcome::Assigned(numeric_id))
    }
}

impl AccountBootstrap {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Returns the account's numeric id, assigning the next global value the
    /// first time the account is seen. Creates the account record if needed.
    pub async fn ensure_numeric_id(&self, account_key: &AccountKey) -> Result<i64, IdentifierError> {
        // A numeric id never changes once set, so a plain read is enough here.
        if let Some(row) = self.store.get_account(account_key).await?
            && let Some(numeric_id) = row.record.numeric_id
        {
            return Ok(numeric_id);
        }

        let body = EnsureNumericId {
            account_key: account_key.clone(),
        };
        match run_transaction(&self.store, &self.policy, "ensure_numeric_id", &body).await? {
            BootstrapOutcome::Assigned(numeric_id) => {
                tracing::info!(account_key = %account_key, numeric_id, "account numeric id assigned");
                Ok(numeric_id)
            }
            BootstrapOutcome::AlreadyAssigned(numeric_id) => Ok(numeric_id),
        }
    }
}
