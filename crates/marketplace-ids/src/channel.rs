//! Messaging channel keys.

/// Deterministic channel key for a conversation between two accounts about
/// one listing: `{low}_{high}_{listing}` with the account numbers ascending.
/// Argument order of the two accounts does not matter.
pub fn channel_key(account_a: i64, account_b: i64, listing_numeric_id: i64) -> String {
    let (low, high) = if account_a <= account_b {
        (account_a, account_b)
    } else {
        (account_b, account_a)
    };
    format!("{low}_{high}_{listing_numeric_id}")
}
