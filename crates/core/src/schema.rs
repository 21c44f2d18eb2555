use std::fmt;

use alloy::primitives::ChainId;
use serde::{Deserialize, Serialize};

/// Version written to `schema_versions` when a network schema is created.
pub const NETWORK_SCHEMA_VERSION: u32 = 1;

pub const EVENT_QUERIES_TABLE: &str = "event_queries";
pub const EVENTS_TABLE: &str = "events";
pub const BLOCKS_TABLE: &str = "blocks";
pub const BLOCK_TIMESTAMPS_TABLE: &str = "block_timestamps";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaName {
    Events,
    Blocks,
}

impl SchemaName {
    pub const ALL: [Self; 2] = [Self::Events, Self::Blocks];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Blocks => "blocks",
        }
    }

    #[must_use]
    pub const fn descriptor(self) -> &'static SchemaDescriptor {
        match self {
            Self::Events => &EVENTS_SCHEMA,
            Self::Blocks => &BLOCKS_SCHEMA,
        }
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of tables a schema owns for every network it is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaDescriptor {
    pub name: SchemaName,
    pub tables: &'static [&'static str],
}

pub const EVENTS_SCHEMA: SchemaDescriptor = SchemaDescriptor {
    name: SchemaName::Events,
    tables: &[EVENT_QUERIES_TABLE, EVENTS_TABLE],
};

pub const BLOCKS_SCHEMA: SchemaDescriptor = SchemaDescriptor {
    name: SchemaName::Blocks,
    tables: &[BLOCKS_TABLE, BLOCK_TIMESTAMPS_TABLE],
};

impl SchemaDescriptor {
    /// Physical table names for `network`.
    pub fn table_names(&self, network: ChainId) -> impl Iterator<Item = String> + '_ {
        self.tables
            .iter()
            .map(move |table| network_table_name(network, table))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub version: u32,
    pub created_at: u64,
}

#[must_use]
pub fn network_table_name(network: ChainId, table: &str) -> String {
    format!("{network}/{table}")
}

#[cfg(test)]
mod tests {
    use super::{SchemaName, network_table_name};

    #[test]
    fn tables_are_namespaced_per_network() {
        let names: Vec<String> = SchemaName::Events.descriptor().table_names(137).collect();
        assert_eq!(names, vec!["137/event_queries", "137/events"]);
        assert_eq!(network_table_name(1, "blocks"), "1/blocks");
    }
}
