use chaincache_core::{ClientError, PolicyError, StoreError, TimestampError, TimestampMode};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("resolver misconfigured: {0}")]
    Configuration(String),
    #[error("no block {mode} timestamp {timestamp}")]
    OutOfRange { timestamp: u64, mode: TimestampMode },
    #[error("chain client error: {0}")]
    Remote(#[from] ClientError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("confirmation policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
}

impl ResolveError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
