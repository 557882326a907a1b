use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::{IsolationLevel, Row, Transaction};

use crate::db::IdsDb;
use crate::store::{
    CommitBatch, Document, DocumentKey, DocumentStore, StoreError, Versioned,
    generate_listing_key,
};
use crate::types::{
    AccountKey, AccountRecord, CounterRecord, ListingKey, ListingRecord, ListingStatus,
};

pub(crate) struct PostgresDocumentStore {
    db: Arc<IdsDb>,
}

impl PostgresDocumentStore {
    pub(crate) fn new(db: Arc<IdsDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn get_counter(
        &self,
        scope_key: &str,
    ) -> Result<Option<Versioned<CounterRecord>>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT scope_key, count, updated_at, version
                  FROM ids.counters
                 WHERE scope_key = $1
                "#,
                &[&scope_key],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref()
            .map(map_counter_row)
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn get_account(
        &self,
        account_key: &AccountKey,
    ) -> Result<Option<Versioned<AccountRecord>>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT account_key, numeric_id, total_listings, active_listings,
                       created_at, updated_at, version
                  FROM ids.accounts
                 WHERE account_key = $1
                "#,
                &[&account_key.as_str()],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref()
            .map(map_account_row)
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn get_listing(
        &self,
        listing_key: &ListingKey,
    ) -> Result<Option<Versioned<ListingRecord>>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT listing_key, owner_key, owner_numeric_id, listing_numeric_id, title,
                       description, price_minor_units, currency, attributes, status,
                       created_at, version
                  FROM ids.listings
                 WHERE listing_key = $1
                "#,
                &[&listing_key.as_str()],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref()
            .map(map_listing_row)
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn commit(&self, batch: CommitBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::Serializable)
            .start()
            .await
            .map_err(map_pg_error)?;

        for (key, expected_version) in &batch.checks {
            let actual = current_version(&tx, key).await?;
            if actual != *expected_version {
                return Err(StoreError::Conflict(format!(
                    "{key:?} read at version {expected_version}, now {actual}"
                )));
            }
        }

        for write in &batch.writes {
            let affected = if write.expected_version == 0 {
                insert_document(&tx, &write.document).await?
            } else {
                update_document(&tx, write.expected_version, &write.document).await?
            };
            if affected == 0 {
                return Err(StoreError::Conflict(format!(
                    "{:?} staged against version {}",
                    write.document.key(),
                    write.expected_version
                )));
            }
        }

        tx.commit().await.map_err(map_pg_error)
    }

    async fn find_listing_by_numeric_pair(
        &self,
        owner_numeric_id: i64,
        listing_numeric_id: i64,
    ) -> Result<Option<ListingKey>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT listing_key
                  FROM ids.listings
                 WHERE owner_numeric_id = $1 AND listing_numeric_id = $2
                 LIMIT 1
                "#,
                &[&owner_numeric_id, &listing_numeric_id],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref()
            .map(|row| map_key_column(row, "listing_key").and_then(listing_key_from))
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn find_listing_by_owner_key(
        &self,
        owner_key: &AccountKey,
        listing_numeric_id: i64,
    ) -> Result<Option<ListingKey>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT listing_key
                  FROM ids.listings
                 WHERE owner_key = $1 AND listing_numeric_id = $2
                 LIMIT 1
                "#,
                &[&owner_key.as_str(), &listing_numeric_id],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref()
            .map(|row| map_key_column(row, "listing_key").and_then(listing_key_from))
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn find_account_by_numeric_id(
        &self,
        numeric_id: i64,
    ) -> Result<Option<AccountKey>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT account_key
                  FROM ids.accounts
                 WHERE numeric_id = $1
                "#,
                &[&numeric_id],
            )
            .await
            .map_err(map_pg_error)?;
        row.as_ref()
            .map(|row| map_key_column(row, "account_key").and_then(account_key_from))
            .transpose()
            .map_err(StoreError::Db)
    }

    fn new_listing_key(&self) -> ListingKey {
        generate_listing_key()
    }
}

async fn current_version(tx: &Transaction<'_>, key: &DocumentKey) -> Result<u64, StoreError> {
    let row = match key {
        DocumentKey::Counter(scope_key) => {
            tx.query_opt(
                "SELECT version FROM ids.counters WHERE scope_key = $1",
                &[scope_key],
            )
            .await
        }
        DocumentKey::Account(account_key) => {
            tx.query_opt(
                "SELECT version FROM ids.accounts WHERE account_key = $1",
                &[&account_key.as_str()],
            )
            .await
        }
        DocumentKey::Listing(listing_key) => {
            tx.query_opt(
                "SELECT version FROM ids.listings WHERE listing_key = $1",
                &[&listing_key.as_str()],
            )
            .await
        }
    }
    .map_err(map_pg_error)?;
    match row {
        Some(row) => {
            let version: i64 = row.try_get("version").map_err(|e| StoreError::Db(e.to_string()))?;
            Ok(version as u64)
        }
        None => Ok(0),
    }
}

async fn insert_document(tx: &Transaction<'_>, document: &Document) -> Result<u64, StoreError> {
    match document {
        Document::Counter(record) => tx
            .execute(
                r#"
                INSERT INTO ids.counters (scope_key, count, updated_at, version)
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (scope_key) DO NOTHING
                "#,
                &[&record.scope_key, &record.count, &record.updated_at],
            )
            .await
            .map_err(map_pg_error),
        Document::Account(record) => tx
            .execute(
                r#"
                INSERT INTO ids.accounts (
                    account_key, numeric_id, total_listings, active_listings,
                    created_at, updated_at, version
                ) VALUES ($1, $2, $3, $4, $5, $6, 1)
                ON CONFLICT (account_key) DO NOTHING
                "#,
                &[
                    &record.account_key.as_str(),
                    &record.numeric_id,
                    &record.total_listings,
                    &record.active_listings,
                    &record.created_at,
                    &record.updated_at,
                ],
            )
            .await
            .map_err(map_pg_error),
        Document::Listing(record) => {
            let attributes = Value::Object(record.attributes.clone());
            tx.execute(
                r#"
                INSERT INTO ids.listings (
                    listing_key, owner_key, owner_numeric_id, listing_numeric_id, title,
                    description, price_minor_units, currency, attributes, status,
                    created_at, version
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 1)
                ON CONFLICT (listing_key) DO NOTHING
                "#,
                &[
                    &record.listing_key.as_str(),
                    &record.owner_key.as_str(),
                    &record.owner_numeric_id,
                    &record.listing_numeric_id,
                    &record.title,
                    &record.description,
                    &record.price_minor_units,
                    &record.currency,
                    &attributes,
                    &record.status.as_str(),
                    &record.created_at,
                ],
            )
            .await
            .map_err(map_pg_error)
        }
    }
}

async fn update_document(
    tx: &Transaction<'_>,
    expected_version: u64,
    document: &Document,
) -> Result<u64, StoreError> {
    let expected_version = expected_version as i64;
    match document {
        Document::Counter(record) => tx
            .execute(
                r#"
                UPDATE ids.counters
                   SET count = $2, updated_at = $3, version = version + 1
                 WHERE scope_key = $1 AND version = $4
                "#,
                &[
                    &record.scope_key,
                    &record.count,
                    &record.updated_at,
                    &expected_version,
                ],
            )
            .await
            .map_err(map_pg_error),
        Document::Account(record) => tx
            .execute(
                r#"
                UPDATE ids.accounts
                   SET numeric_id = $2, total_listings = $3, active_listings = $4,
                       updated_at = $5, version = version + 1
                 WHERE account_key = $1 AND version = $6
                "#,
                &[
                    &record.account_key.as_str(),
                    &record.numeric_id,
                    &record.total_listings,
                    &record.active_listings,
                    &record.updated_at,
                    &expected_version,
                ],
            )
            .await
            .map_err(map_pg_error),
        // Numeric fields and ownership are immutable once written.
        Document::Listing(record) => {
            let attributes = Value::Object(record.attributes.clone());
            tx.execute(
                r#"
                UPDATE ids.listings
                   SET title = $2, description = $3, price_minor_units = $4, currency = $5,
                       attributes = $6, status = $7, version = version + 1
                 WHERE listing_key = $1 AND version = $8
                "#,
                &[
                    &record.listing_key.as_str(),
                    &record.title,
                    &record.description,
                    &record.price_minor_units,
                    &record.currency,
                    &attributes,
                    &record.status.as_str(),
                    &expected_version,
                ],
            )
            .await
            .map_err(map_pg_error)
        }
    }
}

fn map_pg_error(error: tokio_postgres::Error) -> StoreError {
    match error.code() {
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED =>
        {
            StoreError::Conflict(error.to_string())
        }
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
            StoreError::UniqueViolation(error.to_string())
        }
        _ => StoreError::Db(error.to_string()),
    }
}

fn map_key_column(row: &Row, column: &str) -> Result<String, String> {
    row.try_get(column).map_err(|e| e.to_string())
}

fn account_key_from(raw: String) -> Result<AccountKey, String> {
    AccountKey::new(raw).map_err(|e| e.to_string())
}

fn listing_key_from(raw: String) -> Result<ListingKey, String> {
    ListingKey::new(raw).map_err(|e| e.to_string())
}

fn map_version(row: &Row) -> Result<u64, String> {
    let version: i64 = row.try_get("version").map_err(|e| e.to_string())?;
    Ok(version as u64)
}

fn map_counter_row(row: &Row) -> Result<Versioned<CounterRecord>, String> {
    Ok(Versioned {
        version: map_version(row)?,
        record: CounterRecord {
            scope_key: row.try_get("scope_key").map_err(|e| e.to_string())?,
            count: row.try_get("count").map_err(|e| e.to_string())?,
            updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
        },
    })
}

fn map_account_row(row: &Row) -> Result<Versioned<AccountRecord>, String> {
    Ok(Versioned {
        version: map_version(row)?,
        record: AccountRecord {
            account_key: account_key_from(map_key_column(row, "account_key")?)?,
            numeric_id: row.try_get("numeric_id").map_err(|e| e.to_string())?,
            total_listings: row
                .try_get("total_listings")
                .map_err(|e| e.to_string())?,
            active_listings: row
                .try_get("active_listings")
                .map_err(|e| e.to_string())?,
            created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
            updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
        },
    })
}

fn map_listing_row(row: &Row) -> Result<Versioned<ListingRecord>, String> {
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let status = ListingStatus::parse(status.as_str())
        .ok_or_else(|| format!("unknown listing status: {status}"))?;
    let attributes = match row
        .try_get::<_, Value>("attributes")
        .map_err(|e| e.to_string())?
    {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => return Err(format!("listing attributes must be an object, got {other}")),
    };
    Ok(Versioned {
        version: map_version(row)?,
        record: ListingRecord {
            listing_key: listing_key_from(map_key_column(row, "listing_key")?)?,
            owner_key: account_key_from(map_key_column(row, "owner_key")?)?,
            owner_numeric_id: row
                .try_get("owner_numeric_id")
                .map_err(|e| e.to_string())?,
            listing_numeric_id: row
                .try_get("listing_numeric_id")
                .map_err(|e| e.to_string())?,
            title: row.try_get("title").map_err(|e| e.to_string())?,
            description: row.try_get("description").map_err(|e| e.to_string())?,
            price_minor_units: row
                .try_get("price_minor_units")
                .map_err(|e| e.to_string())?,
            currency: row.try_get("currency").map_err(|e| e.to_string())?,
            attributes,
            status,
            created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        },
    })
}
