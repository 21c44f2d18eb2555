use std::collections::BTreeSet;

use alloy::primitives::ChainId;
use chaincache_core::schema::{
    BLOCK_TIMESTAMPS_TABLE, BLOCKS_TABLE, EVENT_QUERIES_TABLE, EVENTS_TABLE,
    NETWORK_SCHEMA_VERSION, network_table_name,
};
use chaincache_core::{
    BlockRef, EncodedEvent, EventFilter, EventQuery, SchemaDescriptor, SchemaName, SchemaVersion,
    Store, StoreError, StoreRead, StoreWrite, TimestampMode,
};
use redb::{
    Key, ReadOnlyTable, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition,
    TableError, TableHandle, Value, WriteTransaction,
};

use crate::{BlockRecord, DbError, DbStore, SCHEMA_VERSIONS_TABLE, decode, encode, now_epoch_secs};

fn event_queries_table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

fn events_table(name: &str) -> TableDefinition<'_, (u64, u64), &'static [u8]> {
    TableDefinition::new(name)
}

fn blocks_table(name: &str) -> TableDefinition<'_, u64, &'static [u8]> {
    TableDefinition::new(name)
}

fn block_timestamps_table(name: &str) -> TableDefinition<'_, (u64, u64), ()> {
    TableDefinition::new(name)
}

fn schema_version_key(schema: SchemaName, network: ChainId) -> String {
    format!("{schema}|{network}")
}

fn event_query_prefix(filter: &EventFilter) -> String {
    format!("{}|", filter.key())
}

fn event_query_key(query: &EventQuery) -> String {
    format!("{}{:020}", event_query_prefix(&query.filter), query.start_block)
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        let transient = match &err {
            DbError::Io(_) | DbError::Database(_) | DbError::Transaction(_) | DbError::Commit(_) => {
                true
            }
            DbError::Storage(storage) => !matches!(
                storage,
                redb::StorageError::Corrupted(_) | redb::StorageError::ValueTooLarge(_)
            ),
            _ => false,
        };
        if transient {
            StoreError::operational(err)
        } else {
            StoreError::data(err)
        }
    }
}

impl Store for DbStore {
    fn begin_read(&self) -> Result<Box<dyn StoreRead + '_>, StoreError> {
        let txn = self.db.begin_read().map_err(DbError::from)?;
        Ok(Box::new(DbReadScope { txn }))
    }

    fn begin_write(&self) -> Result<Box<dyn StoreWrite + '_>, StoreError> {
        let txn = self.db.begin_write().map_err(DbError::from)?;
        Ok(Box::new(DbWriteScope { txn }))
    }
}

/// Snapshot of the database for the lifetime of the scope.
pub struct DbReadScope {
    txn: ReadTransaction,
}

fn open_read<K: Key + 'static, V: Value + 'static>(
    txn: &ReadTransaction,
    definition: TableDefinition<'_, K, V>,
) -> Result<Option<ReadOnlyTable<K, V>>, DbError> {
    match txn.open_table(definition) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

impl DbReadScope {
    fn read_schema_version(
        &self,
        schema: SchemaName,
        network: ChainId,
    ) -> Result<Option<SchemaVersion>, DbError> {
        let Some(table) = open_read(&self.txn, SCHEMA_VERSIONS_TABLE)? else {
            return Ok(None);
        };
        let key = schema_version_key(schema, network);
        match table.get(key.as_str())? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn read_block(&self, network: ChainId, number: u64) -> Result<Option<BlockRef>, DbError> {
        let name = network_table_name(network, BLOCKS_TABLE);
        let Some(table) = open_read(&self.txn, blocks_table(&name))? else {
            return Ok(None);
        };
        match table.get(number)? {
            Some(value) => {
                let record: BlockRecord = decode(value.value())?;
                Ok(Some(record.into_block_ref(number)))
            }
            None => Ok(None),
        }
    }

    fn read_timestamp_block(
        &self,
        network: ChainId,
        timestamp: u64,
        mode: TimestampMode,
    ) -> Result<Option<BlockRef>, DbError> {
        let name = network_table_name(network, BLOCK_TIMESTAMPS_TABLE);
        let Some(index) = open_read(&self.txn, block_timestamps_table(&name))? else {
            return Ok(None);
        };
        let entry = match mode {
            TimestampMode::Before => index.range(..=(timestamp, u64::MAX))?.next_back(),
            TimestampMode::After => index.range((timestamp, 0)..)?.next(),
            TimestampMode::Equal => index
                .range((timestamp, 0)..=(timestamp, u64::MAX))?
                .next(),
        };
        let Some((key, _)) = entry.transpose()? else {
            return Ok(None);
        };
        let (_, number) = key.value();
        self.read_block(network, number)
    }

    fn read_event_queries(
        &self,
        network: ChainId,
        filter: &EventFilter,
    ) -> Result<Vec<EventQuery>, DbError> {
        let name = network_table_name(network, EVENT_QUERIES_TABLE);
        let Some(table) = open_read(&self.txn, event_queries_table(&name))? else {
            return Ok(Vec::new());
        };
        let prefix = event_query_prefix(filter);
        let range_end = format!("{prefix}~");
        let mut out = Vec::new();
        for entry in table.range(prefix.as_str()..range_end.as_str())? {
            let (_, value) = entry?;
            out.push(decode(value.value())?);
        }
        Ok(out)
    }

    fn read_events(
        &self,
        network: ChainId,
        filter: &EventFilter,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<EncodedEvent>, DbError> {
        let name = network_table_name(network, EVENTS_TABLE);
        let Some(table) = open_read(&self.txn, events_table(&name))? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for entry in table.range((start_block, 0)..=(end_block, u64::MAX))? {
            let (_, value) = entry?;
            let event: EncodedEvent = decode(value.value())?;
            if filter.matches(&event) {
                out.push(event);
            }
        }
        Ok(out)
    }
}

impl StoreRead for DbReadScope {
    fn table_names(&self) -> Result<BTreeSet<String>, StoreError> {
        let tables = self.txn.list_tables().map_err(DbError::from)?;
        Ok(tables.map(|table| table.name().to_string()).collect())
    }

    fn schema_version(
        &self,
        schema: SchemaName,
        network: ChainId,
    ) -> Result<Option<SchemaVersion>, StoreError> {
        Ok(self.read_schema_version(schema, network)?)
    }

    fn query_timestamp_block(
        &self,
        network: ChainId,
        timestamp: u64,
        mode: TimestampMode,
    ) -> Result<Option<BlockRef>, StoreError> {
        Ok(self.read_timestamp_block(network, timestamp, mode)?)
    }

    fn block(&self, network: ChainId, number: u64) -> Result<Option<BlockRef>, StoreError> {
        Ok(self.read_block(network, number)?)
    }

    fn event_queries(
        &self,
        network: ChainId,
        filter: &EventFilter,
    ) -> Result<Vec<EventQuery>, StoreError> {
        Ok(self.read_event_queries(network, filter)?)
    }

    fn events(
        &self,
        network: ChainId,
        filter: &EventFilter,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<EncodedEvent>, StoreError> {
        Ok(self.read_events(network, filter, start_block, end_block)?)
    }
}

/// A redb write transaction. Dropping it without `commit` aborts every change.
pub struct DbWriteScope {
    txn: WriteTransaction,
}

impl DbWriteScope {
    fn create_network_table(&self, network: ChainId, table: &str) -> Result<(), DbError> {
        let name = network_table_name(network, table);
        match table {
            EVENT_QUERIES_TABLE => {
                self.txn.open_table(event_queries_table(&name))?;
            }
            EVENTS_TABLE => {
                self.txn.open_table(events_table(&name))?;
            }
            BLOCKS_TABLE => {
                self.txn.open_table(blocks_table(&name))?;
            }
            BLOCK_TIMESTAMPS_TABLE => {
                self.txn.open_table(block_timestamps_table(&name))?;
            }
            _ => return Err(DbError::UnknownTable(name)),
        }
        Ok(())
    }

    fn delete_network_table(&self, network: ChainId, table: &str) -> Result<bool, DbError> {
        let name = network_table_name(network, table);
        let deleted = match table {
            EVENT_QUERIES_TABLE => self.txn.delete_table(event_queries_table(&name))?,
            EVENTS_TABLE => self.txn.delete_table(events_table(&name))?,
            BLOCKS_TABLE => self.txn.delete_table(blocks_table(&name))?,
            BLOCK_TIMESTAMPS_TABLE => self.txn.delete_table(block_timestamps_table(&name))?,
            _ => return Err(DbError::UnknownTable(name)),
        };
        Ok(deleted)
    }

    fn write_schema(&self, schema: &SchemaDescriptor, network: ChainId) -> Result<(), DbError> {
        for table in schema.tables {
            self.create_network_table(network, table)?;
        }
        let key = schema_version_key(schema.name, network);
        let mut versions = self.txn.open_table(SCHEMA_VERSIONS_TABLE)?;
        let exists = versions.get(key.as_str())?.is_some();
        if !exists {
            let version = SchemaVersion {
                version: NETWORK_SCHEMA_VERSION,
                created_at: now_epoch_secs()?,
            };
            let data = encode(&version)?;
            versions.insert(key.as_str(), data.as_slice())?;
        }
        Ok(())
    }

    fn write_event_query(&self, network: ChainId, query: &EventQuery) -> Result<(), DbError> {
        let name = network_table_name(network, EVENT_QUERIES_TABLE);
        let key = event_query_key(query);
        let data = encode(query)?;
        let mut table = self.txn.open_table(event_queries_table(&name))?;
        table.insert(key.as_str(), data.as_slice())?;
        Ok(())
    }

    fn write_events(&self, network: ChainId, events: &[EncodedEvent]) -> Result<(), DbError> {
        let name = network_table_name(network, EVENTS_TABLE);
        let mut table = self.txn.open_table(events_table(&name))?;
        for event in events {
            let data = encode(event)?;
            table.insert((event.block_number, event.log_index), data.as_slice())?;
        }
        Ok(())
    }

    fn write_blocks(&self, network: ChainId, blocks: &[BlockRef]) -> Result<(), DbError> {
        let blocks_name = network_table_name(network, BLOCKS_TABLE);
        let index_name = network_table_name(network, BLOCK_TIMESTAMPS_TABLE);
        let mut table = self.txn.open_table(blocks_table(&blocks_name))?;
        let mut index = self.txn.open_table(block_timestamps_table(&index_name))?;
        for block in blocks {
            let previous = match table.get(block.number)? {
                Some(value) => Some(decode::<BlockRecord>(value.value())?),
                None => None,
            };
            if let Some(previous) = previous
                && previous.timestamp != block.timestamp
            {
                index.remove((previous.timestamp, block.number))?;
            }
            let data = encode(&BlockRecord::from(block))?;
            table.insert(block.number, data.as_slice())?;
            index.insert((block.timestamp, block.number), ())?;
        }
        Ok(())
    }

    fn remove_schema(&self, schema: &SchemaDescriptor, network: ChainId) -> Result<(), DbError> {
        for table in schema.tables {
            self.delete_network_table(network, table)?;
        }
        let key = schema_version_key(schema.name, network);
        let mut versions = self.txn.open_table(SCHEMA_VERSIONS_TABLE)?;
        versions.remove(key.as_str())?;
        Ok(())
    }
}

impl StoreWrite for DbWriteScope {
    fn ensure_schema(
        &mut self,
        schema: &SchemaDescriptor,
        network: ChainId,
    ) -> Result<(), StoreError> {
        Ok(self.write_schema(schema, network)?)
    }

    fn upsert_event_query(
        &mut self,
        network: ChainId,
        query: &EventQuery,
    ) -> Result<(), StoreError> {
        Ok(self.write_event_query(network, query)?)
    }

    fn upsert_events(
        &mut self,
        network: ChainId,
        events: &[EncodedEvent],
    ) -> Result<(), StoreError> {
        Ok(self.write_events(network, events)?)
    }

    fn upsert_blocks(&mut self, network: ChainId, blocks: &[BlockRef]) -> Result<(), StoreError> {
        Ok(self.write_blocks(network, blocks)?)
    }

    fn drop_schema(
        &mut self,
        schema: &SchemaDescriptor,
        network: ChainId,
    ) -> Result<(), StoreError> {
        Ok(self.remove_schema(schema, network)?)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.txn.commit().map_err(DbError::from)?;
        Ok(())
    }
}
