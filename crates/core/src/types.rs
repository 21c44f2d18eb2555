use std::fmt;
use std::str::FromStr;

use alloy::primitives::{B256, ChainId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A block as far as the cache cares about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub timestamp: u64,
    pub hash: B256,
}

/// Identifies the network a read or write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfirmationContext {
    pub network: ChainId,
}

impl ConfirmationContext {
    #[must_use]
    pub const fn new(network: ChainId) -> Self {
        Self { network }
    }
}

/// How ties and misses are resolved when mapping a timestamp to a block.
///
/// `Before` selects the last block with `timestamp <= target`, `After` the first
/// block with `timestamp >= target`. `Equal` asks for an exact match and falls
/// back to the `After` boundary when no block carries the target timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    Before,
    #[default]
    After,
    Equal,
}

impl TimestampMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Equal => "equal",
        }
    }
}

impl fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown timestamp mode {0:?}, expected before, after or equal")]
pub struct ParseModeError(String);

impl FromStr for TimestampMode {
    type Err = ParseModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "before" => Ok(Self::Before),
            "after" => Ok(Self::After),
            "equal" => Ok(Self::Equal),
            _ => Err(ParseModeError(value.to_string())),
        }
    }
}
