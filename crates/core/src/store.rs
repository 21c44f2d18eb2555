//! Persistence capability used by intake, the resolver and the schema guard.
//!
//! Every operation runs inside a scope obtained from [`Store::begin_read`] or
//! [`Store::begin_write`]. A write scope that is dropped without
//! [`StoreWrite::commit`] is rolled back, so an error or a cancelled future never
//! leaves a partial write behind.

use std::collections::BTreeSet;

use alloy::primitives::ChainId;
use thiserror::Error;

use crate::events::{EncodedEvent, EventFilter, EventQuery};
use crate::schema::{SchemaDescriptor, SchemaName, SchemaVersion};
use crate::types::{BlockRef, TimestampMode};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Contention or I/O trouble. The operation may succeed when repeated.
    #[error("store operational error: {0}")]
    Operational(#[source] BoxError),
    /// Encoding, type or layout problems. Repeating will not help.
    #[error("store data error: {0}")]
    Data(#[source] BoxError),
}

impl StoreError {
    pub fn operational(err: impl Into<BoxError>) -> Self {
        Self::Operational(err.into())
    }

    pub fn data(err: impl Into<BoxError>) -> Self {
        Self::Data(err.into())
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Operational(_))
    }
}

pub trait Store: Send + Sync {
    fn begin_read(&self) -> Result<Box<dyn StoreRead + '_>, StoreError>;

    fn begin_write(&self) -> Result<Box<dyn StoreWrite + '_>, StoreError>;
}

pub trait StoreRead {
    /// Names of every table present in the store.
    fn table_names(&self) -> Result<BTreeSet<String>, StoreError>;

    fn schema_version(
        &self,
        schema: SchemaName,
        network: ChainId,
    ) -> Result<Option<SchemaVersion>, StoreError>;

    /// Cached block nearest to `timestamp` on the side selected by `mode`.
    ///
    /// `Equal` only returns blocks carrying exactly `timestamp`.
    fn query_timestamp_block(
        &self,
        network: ChainId,
        timestamp: u64,
        mode: TimestampMode,
    ) -> Result<Option<BlockRef>, StoreError>;

    fn block(&self, network: ChainId, number: u64) -> Result<Option<BlockRef>, StoreError>;

    fn event_queries(
        &self,
        network: ChainId,
        filter: &EventFilter,
    ) -> Result<Vec<EventQuery>, StoreError>;

    fn events(
        &self,
        network: ChainId,
        filter: &EventFilter,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<EncodedEvent>, StoreError>;
}

pub trait StoreWrite {
    /// Creates the tables of `schema` and its version record when missing.
    fn ensure_schema(
        &mut self,
        schema: &SchemaDescriptor,
        network: ChainId,
    ) -> Result<(), StoreError>;

    fn upsert_event_query(&mut self, network: ChainId, query: &EventQuery)
    -> Result<(), StoreError>;

    fn upsert_events(&mut self, network: ChainId, events: &[EncodedEvent])
    -> Result<(), StoreError>;

    fn upsert_blocks(&mut self, network: ChainId, blocks: &[BlockRef]) -> Result<(), StoreError>;

    /// Removes every table of `schema` on `network` along with its version record.
    fn drop_schema(&mut self, schema: &SchemaDescriptor, network: ChainId)
    -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
