//! Atomic listing creation.
//!
//! A listing, the owner's listings counter and the owner's aggregates are
//! committed together or not at all. The listing number comes from the
//! owner's own counter, so creations by different accounts never contend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::allocator::stage_next;
use crate::error::IdentifierError;
use crate::store::{Document, DocumentStore};
use crate::transaction::{RetryPolicy, Transaction, TransactionBody, run_transaction};
use crate::types::{AccountKey, ListingDraft, ListingRecord, ListingStatus, ScopeKey};

#[derive(Clone)]
pub struct ListingCoordinator {
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
}

struct CreateListing {
    owner_key: AccountKey,
    counter_key: String,
    draft: ListingDraft,
}

#[async_trait]
impl TransactionBody for CreateListing {
    type Output = ListingRecord;

    async fn apply(&self, tx: &mut Transaction) -> Result<ListingRecord, IdentifierError> {
        let Some(mut account) = tx.account(&self.owner_key).await? else {
            return Err(IdentifierError::UnbootstrappedAccount(
                self.owner_key.to_string(),
            ));
        };
        let Some(owner_numeric_id) = account.numeric_id else {
            return Err(IdentifierError::UnbootstrappedAccount(
                self.owner_key.to_string(),
            ));
        };

        let listing_numeric_id = stage_next(tx, self.counter_key.as_str()).await?;
        let now = Utc::now();
        let listing = ListingRecord {
            listing_key: tx.new_listing_key(),
            owner_key: self.owner_key.clone(),
            owner_numeric_id: Some(owner_numeric_id),
            listing_numeric_id,
            title: self.draft.title.trim().to_string(),
            description: self.draft.description.clone(),
            price_minor_units: self.draft.price_minor_units,
            currency: self.draft.currency.trim().to_ascii_uppercase(),
            attributes: self.draft.attributes.clone(),
            status: ListingStatus::Active,
            created_at: now,
        };

        account.total_listings = account.total_listings.saturating_add(1);
        account.active_listings = account.active_listings.saturating_add(1);
        account.updated_at = now;

        tx.stage(Document::Listing(listing.clone()));
        tx.stage(Document::Account(account));
        Ok(listing)
    }
}

impl ListingCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Creates an active listing owned by `owner_key` and numbers it with the
    /// owner's next listing number.
    ///
    /// Fails with [`IdentifierError::UnbootstrappedAccount`] when the owner has
    /// no numeric id yet. On any failure no listing exists and neither the
    /// counter nor the aggregates moved.
    pub async fn create_listing(
        &self,
        owner_key: &AccountKey,
        draft: ListingDraft,
    ) -> Result<ListingRecord, IdentifierError> {
        validate_draft(&draft)?;
        let body = CreateListing {
            owner_key: owner_key.clone(),
            counter_key: ScopeKey::AccountListings(owner_key.clone()).storage_key(),
            draft,
        };
        let listing = run_transaction(&self.store, &self.policy, "create_listing", &body).await?;
        tracing::info!(
            owner_key = %owner_key,
            listing_key = %listing.listing_key,
            owner_numeric_id = listing.owner_numeric_id,
            listing_numeric_id = listing.listing_numeric_id,
            "listing created"
        );
        Ok(listing)
    }
}

fn validate_draft(draft: &ListingDraft) -> Result<(), IdentifierError> {
    require_non_empty(draft.title.as_str(), "title")?;
    require_non_empty(draft.currency.as_str(), "currency")?;
    if draft.price_minor_units < 0 {
        return Err(IdentifierError::InvalidRequest(
            "price_minor_units must not be negative".to_string(),
        ));
    }
    Ok(())
}

fn require_non_empty(value: &str, field: &str) -> Result<(), IdentifierError> {
    if value.trim().is_empty() {
        return Err(IdentifierError::InvalidRequest(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};
    use serde_json::{Map, json};

    use super::{ListingCoordinator, validate_draft};
    use crate::bootstrap::AccountBootstrap;
    use crate::error::IdentifierError;
    use crate::store;
    use crate::transaction::RetryPolicy;
    use crate::types::{AccountKey, ListingDraft, ListingStatus, ScopeKey};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_backoff_ms: 0,
            max_backoff_ms: 2,
        }
    }

    fn draft(title: &str) -> ListingDraft {
        let mut attributes = Map::new();
        attributes.insert("condition".to_string(), json!("used"));
        ListingDraft {
            title: title.to_string(),
            description: "barely worn".to_string(),
            price_minor_units: 2_500,
            currency: "usd".to_string(),
            attributes,
        }
    }

    #[test]
    fn draft_validation_rejects_blank_and_negative_fields() {
        assert!(validate_draft(&draft("Boots")).is_ok());
        assert!(matches!(
            validate_draft(&draft("  ")),
            Err(IdentifierError::InvalidRequest(message)) if message == "title must not be empty"
        ));

        let mut no_currency = draft("Boots");
        no_currency.currency = String::new();
        assert!(validate_draft(&no_currency).is_err());

        let mut negative = draft("Boots");
        negative.price_minor_units = -1;
        assert!(matches!(
            validate_draft(&negative),
            Err(IdentifierError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn creation_stamps_both_numbers_and_bumps_aggregates() -> Result<()> {
        let store = store::memory();
        let owner = AccountKey::new("uid_seller")?;
        let owner_numeric_id = AccountBootstrap::new(store.clone(), policy())
            .ensure_numeric_id(&owner)
            .await?;
        let coordinator = ListingCoordinator::new(store.clone(), policy());

        let first = coordinator.create_listing(&owner, draft("Boots")).await?;
        let second = coordinator.create_listing(&owner, draft("Hat")).await?;

        assert_eq!(first.owner_numeric_id, Some(owner_numeric_id));
        assert_eq!(first.listing_numeric_id, 1);
        assert_eq!(second.listing_numeric_id, 2);
        assert_eq!(first.status, ListingStatus::Active);
        assert_eq!(first.currency, "USD");
        assert_eq!(first.attributes.get("condition"), Some(&json!("used")));
        assert_ne!(first.listing_key, second.listing_key);

        let stored = store
            .get_listing(&first.listing_key)
            .await?
            .ok_or_else(|| anyhow!("listing missing"))?;
        assert_eq!(stored.record, first);

        let account = store
            .get_account(&owner)
            .await?
            .ok_or_else(|| anyhow!("account missing"))?;
        assert_eq!(account.record.total_listings, 2);
        assert_eq!(account.record.active_listings, 2);

        let counter = store
            .get_counter(ScopeKey::AccountListings(owner).storage_key().as_str())
            .await?;
        assert_eq!(counter.map(|row| row.record.count), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_account_is_unbootstrapped_and_writes_nothing() -> Result<()> {
        let store = store::memory();
        let owner = AccountKey::new("uid_stranger")?;
        let coordinator = ListingCoordinator::new(store.clone(), policy());

        let result = coordinator.create_listing(&owner, draft("Boots")).await;
        assert!(matches!(
            result,
            Err(IdentifierError::UnbootstrappedAccount(ref key)) if key == "uid_stranger"
        ));
        assert!(store.get_account(&owner).await?.is_none());
        let counter = store
            .get_counter(ScopeKey::AccountListings(owner).storage_key().as_str())
            .await?;
        assert!(counter.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn invalid_draft_fails_before_touching_the_store() -> Result<()> {
        let store = store::memory();
        let owner = AccountKey::new("uid_seller")?;
        AccountBootstrap::new(store.clone(), policy())
            .ensure_numeric_id(&owner)
            .await?;
        let coordinator = ListingCoordinator::new(store.clone(), policy());

        let error = coordinator
            .create_listing(&owner, draft(""))
            .await
            .err()
            .ok_or_else(|| anyhow!("blank title accepted"))?;
        assert_eq!(error.code(), "invalid_request");
        let counter = store
            .get_counter(ScopeKey::AccountListings(owner).storage_key().as_str())
            .await?;
        assert!(counter.is_none());
        Ok(())
    }
}
