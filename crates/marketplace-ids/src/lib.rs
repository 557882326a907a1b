//! Dense numeric identifiers for marketplace accounts and listings.
//!
//! Accounts get a global numeric id on first sight; listings get a number
//! from their owner's own counter and are created together with that counter
//! bump and the owner's aggregates in one optimistic transaction.

#![forbid(unsafe_code)]

pub mod allocator;
pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod db;
pub mod error;
pub mod listings;
pub mod lookup;
pub mod schema;
pub mod service;
pub mod store;
pub mod transaction;
pub mod types;


pub use channel::channel_key;
pub use config::{Config, ConfigError, LogFormat};
pub use error::IdentifierError;
pub use service::IdentifierService;
pub use store::{DocumentStore, StoreError};
pub use transaction::RetryPolicy;
pub use types::{
    AccountKey, AccountRecord, ListingDraft, ListingKey, ListingRecord, ListingStatus,
    NumericPair, ScopeKey,
};
