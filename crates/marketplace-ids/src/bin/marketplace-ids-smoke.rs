use std::collections::BTreeSet;

use anyhow::{Context, Result, anyhow, ensure};
use clap::Parser;
use futures::future::join_all;
use marketplace_ids::{
    AccountKey, Config, IdentifierError, IdentifierService, ListingDraft, ListingRecord,
    LogFormat, channel_key,
};
use serde_json::{Map, json};

/// Bootstraps accounts and creates listings concurrently against the
/// configured store, then checks numbering, aggregates and lookups.
#[derive(Parser, Debug)]
struct Args {
    /// Accounts to bootstrap.
    #[arg(long, default_value_t = 4)]
    accounts: usize,

    /// Listings created concurrently for each account.
    #[arg(long, default_value_t = 8)]
    listings_per_account: usize,

    /// Times a caller repeats an operation whose retry budget ran out.
    #[arg(long, default_value_t = 10)]
    caller_retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("load config")?;
    init_tracing(config.log_format);

    let args = Args::parse();
    ensure!(args.accounts > 0, "--accounts must be at least 1");

    let service = IdentifierService::from_config(&config)
        .await
        .context("build identifier service")?;
    let run_id = uuid::Uuid::now_v7().simple().to_string();

    let account_keys = (0..args.accounts)
        .map(|index| AccountKey::new(format!("smoke_{run_id}_{index}")))
        .collect::<Result<Vec<_>, _>>()?;

    let bootstraps = account_keys.iter().cloned().map(|account_key| {
        let service = service.clone();
        let retries = args.caller_retries;
        tokio::spawn(async move {
            with_caller_retry(retries, || service.ensure_numeric_id(&account_key)).await
        })
    });
    let mut numeric_ids = Vec::with_capacity(args.accounts);
    for joined in join_all(bootstraps).await {
        numeric_ids.push(joined.context("bootstrap task")??);
    }
    let distinct = numeric_ids.iter().copied().collect::<BTreeSet<_>>();
    ensure!(
        distinct.len() == numeric_ids.len(),
        "account numeric ids are not unique: {numeric_ids:?}"
    );

    let mut creations = Vec::with_capacity(args.accounts * args.listings_per_account);
    for account_key in &account_keys {
        for index in 0..args.listings_per_account {
            let service = service.clone();
            let account_key = account_key.clone();
            let retries = args.caller_retries;
            creations.push(tokio::spawn(async move {
                with_caller_retry(retries, || {
                    service.create_listing(&account_key, smoke_draft(index))
                })
                .await
            }));
        }
    }
    let mut listings = Vec::new();
    for joined in join_all(creations).await {
        listings.push(joined.context("create listing task")??);
    }

    for (account_key, numeric_id) in account_keys.iter().zip(&numeric_ids) {
        verify_account(&service, account_key, *numeric_id, &listings, args.listings_per_account)
            .await?;
    }
    for listing in &listings {
        verify_round_trip(&service, listing).await?;
    }

    let sample_channel = match (numeric_ids.as_slice(), listings.first()) {
        ([seller, buyer, ..], Some(listing)) => {
            Some(channel_key(*seller, *buyer, listing.listing_numeric_id))
        }
        _ => None,
    };
    let summary = json!({
        "service": config.service_name,
        "run_id": run_id,
        "backend": if config.db_url.is_some() { "postgres" } else { "memory" },
        "accounts": args.accounts,
        "account_numeric_ids": numeric_ids,
        "listings_created": listings.len(),
        "sample_channel_key": sample_channel,
    });
    tracing::info!(summary = %summary, "marketplace ids smoke run passed");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn with_caller_retry<T, F, Fut>(retries: u32, mut operation: F) -> Result<T, IdentifierError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IdentifierError>>,
{
    let mut remaining = retries;
    loop {
        match operation().await {
            Err(error) if error.is_retryable() && remaining > 0 => {
                remaining -= 1;
                tracing::warn!(code = error.code(), remaining, "retrying whole operation");
            }
            result => return result,
        }
    }
}

fn smoke_draft(index: usize) -> ListingDraft {
    let mut attributes = Map::new();
    attributes.insert("smoke_index".to_string(), json!(index));
    ListingDraft {
        title: format!("Smoke listing {index}"),
        description: "created by marketplace-ids-smoke".to_string(),
        price_minor_units: 100 * (index as i64 + 1),
        currency: "USD".to_string(),
        attributes,
    }
}

async fn verify_account(
    service: &IdentifierService,
    account_key: &AccountKey,
    numeric_id: i64,
    listings: &[ListingRecord],
    expected: usize,
) -> Result<()> {
    let numbers = listings
        .iter()
        .filter(|listing| &listing.owner_key == account_key)
        .map(|listing| listing.listing_numeric_id)
        .collect::<BTreeSet<_>>();
    let dense = (1..=expected as i64).collect::<BTreeSet<_>>();
    ensure!(
        numbers == dense,
        "listing numbers for {account_key} are not 1..={expected}: {numbers:?}"
    );

    let account = service
        .account(account_key)
        .await?
        .ok_or_else(|| anyhow!("account {account_key} missing after bootstrap"))?;
    ensure!(
        account.numeric_id == Some(numeric_id),
        "account {account_key} numeric id changed"
    );
    ensure!(
        account.total_listings == expected as i64 && account.active_listings == expected as i64,
        "aggregates for {account_key} are {}/{}, expected {expected}",
        account.total_listings,
        account.active_listings
    );
    Ok(())
}

async fn verify_round_trip(service: &IdentifierService, listing: &ListingRecord) -> Result<()> {
    let owner_numeric_id = listing
        .owner_numeric_id
        .ok_or_else(|| anyhow!("listing {} lacks owner number", listing.listing_key))?;
    let resolved = service
        .resolve(owner_numeric_id, listing.listing_numeric_id)
        .await?;
    ensure!(
        resolved.as_ref() == Some(&listing.listing_key),
        "pair ({owner_numeric_id}, {}) resolved to {resolved:?}",
        listing.listing_numeric_id
    );
    let pair = service
        .resolve_numeric(&listing.listing_key)
        .await?
        .ok_or_else(|| anyhow!("listing {} has no numeric pair", listing.listing_key))?;
    ensure!(
        pair.owner_numeric_id == owner_numeric_id
            && pair.listing_numeric_id == listing.listing_numeric_id,
        "listing {} resolved back to {pair:?}",
        listing.listing_key
    );
    let stored = service.listing(&listing.listing_key).await?;
    ensure!(
        stored.as_ref() == Some(listing),
        "listing {} reads back differently",
        listing.listing_key
    );
    Ok(())
}
