use std::sync::Arc;

use chaincache_core::schema::EVENTS_SCHEMA;
use chaincache_core::{
    ChainClient, ClientError, ConfirmationContext, ConfirmationPolicy, EncodedEvent, EventBatch,
    EventError, EventQuery, PolicyError, Store, StoreError,
};
use tracing::{Instrument, debug, info_span, warn};

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("malformed event batch: {0}")]
    Events(#[from] EventError),
    #[error("invalid query range {start_block}..={end_block}")]
    InvalidRange { start_block: u64, end_block: u64 },
    #[error("confirmation policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("chain client error: {0}")]
    Remote(#[from] ClientError),
    #[error("no latest block given and no chain client configured")]
    NoChainClient,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// The whole range is still within the confirmation depth.
    Unconfirmed { latest_allowed_block: Option<u64> },
    /// Nothing confirmed survived, so nothing was recorded.
    Empty,
    Written {
        query: EventQuery,
        events: usize,
        truncated: bool,
    },
    /// The store failed transiently and the write was abandoned.
    Dropped,
}

/// Writes fetched events to the store once their blocks are deep enough to be
/// considered final.
#[derive(Clone)]
pub struct EventIntake {
    policy: ConfirmationPolicy,
    store: Arc<dyn Store>,
    client: Option<Arc<dyn ChainClient>>,
}

impl EventIntake {
    #[must_use]
    pub fn new(policy: ConfirmationPolicy, store: Arc<dyn Store>) -> Self {
        Self {
            policy,
            store,
            client: None,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Persists the confirmed part of `events` and `query`.
    ///
    /// `latest_block` is the head the gate is computed against; it is fetched
    /// once from the chain client when not given.
    pub async fn intake(
        &self,
        events: impl Into<EventBatch>,
        query: EventQuery,
        context: ConfirmationContext,
        latest_block: Option<u64>,
    ) -> Result<IntakeOutcome, IntakeError> {
        let span = info_span!(
            "event_intake",
            network = context.network,
            start_block = query.start_block,
            end_block = query.end_block
        );
        let events = events.into();
        self.intake_batch(events, query, context, latest_block)
            .instrument(span)
            .await
    }

    async fn intake_batch(
        &self,
        events: EventBatch,
        mut query: EventQuery,
        context: ConfirmationContext,
        latest_block: Option<u64>,
    ) -> Result<IntakeOutcome, IntakeError> {
        let mut events = events.into_records()?;
        if query.start_block > query.end_block {
            return Err(IntakeError::InvalidRange {
                start_block: query.start_block,
                end_block: query.end_block,
            });
        }

        let latest_block = match latest_block {
            Some(latest_block) => latest_block,
            None => {
                let client = self.client.as_deref().ok_or(IntakeError::NoChainClient)?;
                client.latest_block_number().await?
            }
        };
        let latest_allowed_block = self.policy.latest_allowed_block(&context, latest_block)?;
        let Some(latest_allowed) =
            latest_allowed_block.filter(|allowed| query.start_block <= *allowed)
        else {
            debug!(latest_block, ?latest_allowed_block, "range not confirmed yet");
            return Ok(IntakeOutcome::Unconfirmed {
                latest_allowed_block,
            });
        };

        let truncated = query.end_block > latest_allowed;
        if truncated {
            events.retain(|event| event.block_number <= latest_allowed);
            query.end_block = latest_allowed;
        }
        if events.is_empty() {
            debug!(truncated, "no confirmed events to record");
            return Ok(IntakeOutcome::Empty);
        }

        match self.write(context, &query, &events) {
            Ok(()) => {
                debug!(
                    events = events.len(),
                    end_block = query.end_block,
                    truncated,
                    "recorded events"
                );
                Ok(IntakeOutcome::Written {
                    query,
                    events: events.len(),
                    truncated,
                })
            }
            Err(err) if err.is_transient() => {
                warn!(?err, events = events.len(), "dropping event write");
                Ok(IntakeOutcome::Dropped)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write(
        &self,
        context: ConfirmationContext,
        query: &EventQuery,
        events: &[EncodedEvent],
    ) -> Result<(), StoreError> {
        let mut txn = self.store.begin_write()?;
        txn.ensure_schema(&EVENTS_SCHEMA, context.network)?;
        txn.upsert_event_query(context.network, query)?;
        txn.upsert_events(context.network, events)?;
        txn.commit()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy::primitives::{Address, B256, Bytes, ChainId};
    use chaincache_core::{
        BlockRef, EncodedEvent, EventFilter, EventQuery, SchemaDescriptor, Store, StoreError,
        StoreRead, StoreWrite,
    };

    pub(crate) fn temp_root_dir() -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir()
            .join("chaincache-tests")
            .join(format!("cache-service-{}-{nanos}", std::process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    pub(crate) fn event(block_number: u64, log_index: u64) -> EncodedEvent {
        EncodedEvent {
            block_number,
            transaction_index: 0,
            log_index,
            transaction_hash: B256::with_last_byte(block_number as u8),
            contract_address: Address::repeat_byte(0x11),
            event_hash: Some(B256::repeat_byte(0x22)),
            topic1: None,
            topic2: None,
            topic3: None,
            unindexed: Bytes::from_static(&[1, 2, 3]),
        }
    }

    pub(crate) fn query(start_block: u64, end_block: u64) -> EventQuery {
        EventQuery {
            start_block,
            end_block,
            filter: EventFilter {
                contract_address: Some(Address::repeat_byte(0x11)),
                ..EventFilter::default()
            },
        }
    }

    /// Store whose writes fail at commit with the configured error kind.
    pub(crate) struct FailingStore {
        pub transient: bool,
        pub writes: AtomicUsize,
    }

    impl FailingStore {
        pub(crate) fn new(transient: bool) -> Self {
            Self {
                transient,
                writes: AtomicUsize::new(0),
            }
        }

        pub(crate) fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    struct FailingWrite {
        transient: bool,
    }

    impl StoreWrite for FailingWrite {
        fn ensure_schema(
            &mut self,
            _schema: &SchemaDescriptor,
            _network: ChainId,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn upsert_event_query(
            &mut self,
            _network: ChainId,
            _query: &EventQuery,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn upsert_events(
            &mut self,
            _network: ChainId,
            _events: &[EncodedEvent],
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn upsert_blocks(
            &mut self,
            _network: ChainId,
            _blocks: &[BlockRef],
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn drop_schema(
            &mut self,
            _schema: &SchemaDescriptor,
            _network: ChainId,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        fn commit(self: Box<Self>) -> Result<(), StoreError> {
            if self.transient {
                Err(StoreError::operational("database is locked"))
            } else {
                Err(StoreError::data("value does not fit the column"))
            }
        }
    }

    impl Store for FailingStore {
        fn begin_read(&self) -> Result<Box<dyn StoreRead + '_>, StoreError> {
            Err(StoreError::operational("reads are not used"))
        }

        fn begin_write(&self) -> Result<Box<dyn StoreWrite + '_>, StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FailingWrite {
                transient: self.transient,
            }))
        }
    }
}
