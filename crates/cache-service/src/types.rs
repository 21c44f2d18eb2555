use std::sync::Arc;

use alloy::primitives::ChainId;
use block_times::resolver::DEFAULT_NARY;
use chaincache_core::ChainClient;

/// Everything the manager needs to serve one network.
#[derive(Clone)]
pub struct NetworkConfig {
    pub chain_id: ChainId,
    pub client: Arc<dyn ChainClient>,
    /// Overrides the built-in confirmation depth for this network.
    pub required_confirmations: Option<u64>,
    pub nary: usize,
}

impl NetworkConfig {
    #[must_use]
    pub fn new(chain_id: ChainId, client: Arc<dyn ChainClient>) -> Self {
        Self {
            chain_id,
            client,
            required_confirmations: None,
            nary: DEFAULT_NARY,
        }
    }
}
