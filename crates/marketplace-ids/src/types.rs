//! Record shapes and key newtypes for counters, accounts and listings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const GLOBAL_ACCOUNTS_SCOPE: &str = "global:accounts";
const ACCOUNT_LISTINGS_SCOPE_PREFIX: &str = "listings:";

/// Opaque account key derived from the authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountKey(String);

impl AccountKey {
    /// Builds a key from the caller's identity token subject. Blank keys are rejected.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidKey> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidKey("account_key"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Opaque storage key generated by the store for a listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingKey(String);

impl ListingKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidKey> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidKey("listing_key"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub(crate) fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id.simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} must not be empty")]
pub struct InvalidKey(pub &'static str);

/// Namespace a counter allocates within.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    /// One counter for every account in the system.
    GlobalAccounts,
    /// One counter per account, numbering that account's listings.
    AccountListings(AccountKey),
}

impl ScopeKey {
    /// Storage key of the counter record. The prefixes keep the global scope
    /// from colliding with any account key.
    pub fn storage_key(&self) -> String {
        match self {
            Self::GlobalAccounts => GLOBAL_ACCOUNTS_SCOPE.to_string(),
            Self::AccountListings(account) => {
                format!("{ACCOUNT_LISTINGS_SCOPE_PREFIX}{}", account.as_str())
            }
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_key().as_str())
    }
}

/// Counter row; `count` is the last value issued for the scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterRecord {
    pub scope_key: String,
    pub count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Account row. `numeric_id` is `None` until bootstrap completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_key: AccountKey,
    pub numeric_id: Option<i64>,
    pub total_listings: i64,
    pub active_listings: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Sold,
    Removed,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Sold => "sold",
            Self::Removed => "removed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "active" => Some(Self::Active),
            "sold" => Some(Self::Sold),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Caller-supplied listing content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub title: String,
    pub description: String,
    pub price_minor_units: i64,
    pub currency: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Listing row.
///
/// `owner_numeric_id` is a denormalized copy of the owner's account numeric id.
/// Listings written by this crate always carry it; rows imported from older
/// clients may not, which is why lookups keep an owner-index fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub listing_key: ListingKey,
    pub owner_key: AccountKey,
    pub owner_numeric_id: Option<i64>,
    pub listing_numeric_id: i64,
    pub title: String,
    pub description: String,
    pub price_minor_units: i64,
    pub currency: String,
    pub attributes: Map<String, Value>,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
}

/// The pair that identifies a listing numerically across the whole collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumericPair {
    pub owner_numeric_id: i64,
    pub listing_numeric_id: i64,
}
