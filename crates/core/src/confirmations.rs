use std::collections::HashMap;

use alloy::primitives::ChainId;
use thiserror::Error;

use crate::types::ConfirmationContext;

/// Confirmation depths used when a network has no configured override.
pub const DEFAULT_CONFIRMATIONS: &[(ChainId, u64)] = &[
    (1, 12),
    (10, 64),
    (56, 15),
    (137, 256),
    (8453, 64),
    (42161, 64),
];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("no confirmation depth configured for network {0}")]
    UnknownNetwork(ChainId),
}

/// Maps a network to the number of blocks that must follow a block before its
/// data may be cached.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationPolicy {
    overrides: HashMap<ChainId, u64>,
}

impl ConfirmationPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_override(mut self, network: ChainId, confirmations: u64) -> Self {
        self.overrides.insert(network, confirmations);
        self
    }

    pub fn required_confirmations(&self, context: &ConfirmationContext) -> Result<u64, PolicyError> {
        if let Some(confirmations) = self.overrides.get(&context.network) {
            return Ok(*confirmations);
        }
        DEFAULT_CONFIRMATIONS
            .iter()
            .find(|(network, _)| *network == context.network)
            .map(|(_, confirmations)| *confirmations)
            .ok_or(PolicyError::UnknownNetwork(context.network))
    }

    /// Highest block considered final at `latest_block`, `None` while the chain is
    /// shorter than the confirmation depth.
    pub fn latest_allowed_block(
        &self,
        context: &ConfirmationContext,
        latest_block: u64,
    ) -> Result<Option<u64>, PolicyError> {
        let confirmations = self.required_confirmations(context)?;
        Ok(latest_block.checked_sub(confirmations))
    }
}

impl FromIterator<(ChainId, u64)> for ConfirmationPolicy {
    fn from_iter<I: IntoIterator<Item = (ChainId, u64)>>(iter: I) -> Self {
        Self {
            overrides: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfirmationPolicy, PolicyError};
    use crate::types::ConfirmationContext;

    #[test]
    fn override_wins_over_default() {
        let policy = ConfirmationPolicy::new().with_override(1, 3);
        let depth = policy
            .required_confirmations(&ConfirmationContext::new(1))
            .expect("depth");
        assert_eq!(depth, 3);
        let depth = policy
            .required_confirmations(&ConfirmationContext::new(137))
            .expect("depth");
        assert_eq!(depth, 256);
    }

    #[test]
    fn unknown_network_is_an_error() {
        let err = ConfirmationPolicy::new()
            .required_confirmations(&ConfirmationContext::new(31337))
            .expect_err("unknown network");
        assert!(matches!(err, PolicyError::UnknownNetwork(31337)));
    }

    #[test]
    fn short_chain_has_no_confirmed_blocks() {
        let policy = ConfirmationPolicy::new().with_override(5, 10);
        let context = ConfirmationContext::new(5);
        assert_eq!(policy.latest_allowed_block(&context, 4).expect("allowed"), None);
        assert_eq!(policy.latest_allowed_block(&context, 10).expect("allowed"), Some(0));
        assert_eq!(policy.latest_allowed_block(&context, 25).expect("allowed"), Some(15));
    }
}
