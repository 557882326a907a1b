//! Canonical schema metadata for the identifier store.

/// Table specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub description: &'static str,
}

/// Index specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: &'static [&'static str],
    pub unique: bool,
}

pub const CORE_TABLES: &[TableSpec] = &[
    TableSpec {
        name: "ids.counters",
        description: "One counter per allocation scope; count is the last value issued.",
    },
    TableSpec {
        name: "ids.accounts",
        description: "Account numeric id and listing aggregates.",
    },
    TableSpec {
        name: "ids.listings",
        description: "Listings with their owner and per-owner numeric ids.",
    },
];

pub const CORE_INDEXES: &[IndexSpec] = &[
    IndexSpec {
        name: "ux_accounts_numeric_id",
        table: "ids.accounts",
        columns: &["numeric_id"],
        unique: true,
    },
    IndexSpec {
        name: "ux_listings_numeric_pair",
        table: "ids.listings",
        columns: &["owner_numeric_id", "listing_numeric_id"],
        unique: true,
    },
    IndexSpec {
        name: "ux_listings_owner_key_number",
        table: "ids.listings",
        columns: &["owner_key", "listing_numeric_id"],
        unique: true,
    },
];

/// Field-equality queries the lookup index issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexedQuery {
    ListingByNumericPair,
    ListingByOwnerKey,
    AccountByNumericId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub table: &'static str,
    pub predicate: &'static str,
    pub required_index_names: &'static [&'static str],
}

pub fn query_plan(query: IndexedQuery) -> QueryPlan {
    match query {
        IndexedQuery::ListingByNumericPair => QueryPlan {
            table: "ids.listings",
            predicate: "owner_numeric_id = ? AND listing_numeric_id = ?",
            required_index_names: &["ux_listings_numeric_pair"],
        },
        IndexedQuery::ListingByOwnerKey => QueryPlan {
            table: "ids.listings",
            predicate: "owner_key = ? AND listing_numeric_id = ?",
            required_index_names: &["ux_listings_owner_key_number"],
        },
        IndexedQuery::AccountByNumericId => QueryPlan {
            table: "ids.accounts",
            predicate: "numeric_id = ?",
            required_index_names: &["ux_accounts_numeric_id"],
        },
    }
}

/// Returns index names a plan needs that the schema does not declare.
pub fn missing_indexes(plan: &QueryPlan) -> Vec<String> {
    plan.required_index_names
        .iter()
        .filter(|required| {
            !CORE_INDEXES
                .iter()
                .any(|index| index.name == **required && index.table == plan.table)
        })
        .map(|missing| (*missing).to_string())
        .collect()
}

/// Canonical SQL DDL for the identifier store.
pub fn core_schema_sql() -> &'static str {
    include_str!("../schema/ids.sql")
}
