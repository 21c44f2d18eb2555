//! Drops network schemas that were recorded but are missing tables, so the next
//! write rebuilds them from scratch.

use alloy::primitives::ChainId;
use chaincache_core::{SchemaName, Store, StoreError};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairReport {
    pub schema: SchemaName,
    /// Networks whose schema was dropped.
    pub repaired: Vec<ChainId>,
}

impl RepairReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty()
    }
}

pub fn repair(
    store: &dyn Store,
    schema: SchemaName,
    networks: &[ChainId],
) -> Result<RepairReport, GuardError> {
    let descriptor = schema.descriptor();
    let mut repaired = Vec::new();
    {
        let read = store.begin_read()?;
        let tables = read.table_names()?;
        for network in networks {
            if read.schema_version(schema, *network)?.is_none() {
                continue;
            }
            let missing: Vec<String> = descriptor
                .table_names(*network)
                .filter(|table| !tables.contains(table))
                .collect();
            if !missing.is_empty() {
                warn!(
                    %schema,
                    network = *network,
                    ?missing,
                    "schema is missing tables, dropping it"
                );
                repaired.push(*network);
            }
        }
    }

    if !repaired.is_empty() {
        let mut txn = store.begin_write()?;
        for network in &repaired {
            txn.drop_schema(descriptor, *network)?;
        }
        txn.commit()?;
        info!(%schema, networks = ?repaired, "dropped inconsistent schemas");
    }
    Ok(RepairReport { schema, repaired })
}
