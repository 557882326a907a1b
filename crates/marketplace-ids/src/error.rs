use crate::store::StoreError;
use crate::types::InvalidKey;

#[derive(Debug, thiserror::Error)]
pub enum IdentifierError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Listing creation before the account received its numeric id. Callers
    /// must bootstrap first; this is never retried internally.
    #[error("account {0} has no numeric id yet")]
    UnbootstrappedAccount(String),
    /// Write conflicts outlasted the retry budget. Nothing was committed and
    /// the whole operation may be retried.
    #[error("{operation} gave up after {attempts} conflicting attempts")]
    ConflictExhausted {
        operation: &'static str,
        attempts: u32,
    },
    #[error("store error: {0}")]
    Store(StoreError),
}

impl IdentifierError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnbootstrappedAccount(_) => "unbootstrapped_account",
            Self::ConflictExhausted { .. } => "allocation_conflict_exhausted",
            Self::Store(_) => "store_failure",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether retrying the whole operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConflictExhausted { .. })
    }
}

impl From<StoreError> for IdentifierError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl From<InvalidKey> for IdentifierError {
    fn from(error: InvalidKey) -> Self {
        Self::InvalidRequest(error.to_string())
    }
}
