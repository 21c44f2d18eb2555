use std::sync::Arc;

use alloy::primitives::ChainId;
use chaincache_core::schema::BLOCKS_SCHEMA;
use chaincache_core::{
    BlockRef, ChainClient, ConfirmationContext, ConfirmationPolicy, Store, StoreError, Timestamp,
    TimestampMode,
};
use tracing::{Instrument, debug, error, info_span, warn};

use crate::arrays::TimestampHint;
use crate::error::ResolveError;
use crate::search::{SearchRound, TimestampSearchCache, search_block_of_timestamp};

pub const DEFAULT_NARY: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub timestamp: Timestamp,
    pub mode: TimestampMode,
    pub hint: Option<TimestampHint<'a>>,
    pub nary: usize,
    pub use_store: bool,
    pub verbose: bool,
}

impl<'a> ResolveRequest<'a> {
    pub fn new(timestamp: impl Into<Timestamp>) -> Self {
        Self {
            timestamp: timestamp.into(),
            mode: TimestampMode::default(),
            hint: None,
            nary: DEFAULT_NARY,
            use_store: true,
            verbose: false,
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: TimestampMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn hint(mut self, hint: impl Into<TimestampHint<'a>>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn nary(mut self, nary: usize) -> Self {
        self.nary = nary;
        self
    }

    #[must_use]
    pub fn use_store(mut self, use_store: bool) -> Self {
        self.use_store = use_store;
        self
    }

    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Which tier answered a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Arrays,
    Store,
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub block_number: u64,
    pub tier: Tier,
    /// Rounds of the network search, filled only for verbose requests.
    pub trail: Vec<SearchRound>,
}

impl Resolution {
    fn new(block_number: u64, tier: Tier) -> Self {
        Self {
            block_number,
            tier,
            trail: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSelector {
    Number(u64),
    Timestamp(Timestamp),
}

/// Maps timestamps to block numbers for one network, trying caller arrays, then
/// the persisted cache, then the node.
#[derive(Clone)]
pub struct BlockTimeResolver {
    network: ChainId,
    policy: ConfirmationPolicy,
    client: Option<Arc<dyn ChainClient>>,
    store: Option<Arc<dyn Store>>,
}

impl BlockTimeResolver {
    #[must_use]
    pub fn new(network: ChainId, policy: ConfirmationPolicy) -> Self {
        Self {
            network,
            policy,
            client: None,
            store: None,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn ChainClient>) -> Self {
        self.client = Some(client);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn network(&self) -> ChainId {
        self.network
    }

    pub async fn resolve(
        &self,
        request: ResolveRequest<'_>,
        cache: &mut TimestampSearchCache,
    ) -> Result<Resolution, ResolveError> {
        let timestamp = request.timestamp.to_seconds()?;
        let span = info_span!(
            "resolve_block_time",
            network = self.network,
            timestamp,
            mode = %request.mode
        );
        self.resolve_seconds(timestamp, request, cache)
            .instrument(span)
            .await
    }

    async fn resolve_seconds(
        &self,
        timestamp: u64,
        request: ResolveRequest<'_>,
        cache: &mut TimestampSearchCache,
    ) -> Result<Resolution, ResolveError> {
        if let Some(hint) = request.hint {
            let block_number = hint.block_of_timestamp(timestamp, request.mode)?;
            return Ok(Resolution::new(block_number, Tier::Arrays));
        }
        if request.nary < 2 {
            return Err(ResolveError::configuration(format!(
                "nary must be at least 2, got {}",
                request.nary
            )));
        }

        let store = self.store.as_deref().filter(|_| request.use_store);
        if let Some(store) = store {
            match self.store_block_of_timestamp(store, timestamp, request.mode) {
                Ok(Some(block)) => {
                    debug!(block = block.number, "block time served from store");
                    return Ok(Resolution::new(block.number, Tier::Store));
                }
                Ok(None) => {}
                Err(ResolveError::Store(err)) if err.is_transient() => {
                    warn!(?err, "store lookup failed, searching the node");
                }
                Err(err) => return Err(err),
            }
        }

        let Some(client) = self.client.as_deref() else {
            return Err(ResolveError::configuration(
                "no timestamp hint, no store hit and no chain client",
            ));
        };
        let outcome = search_block_of_timestamp(
            client,
            cache,
            timestamp,
            request.mode,
            request.nary,
            request.verbose,
        )
        .await?;
        if let Some(store) = store {
            self.persist_confirmed(store, outcome.head, &outcome.fetched)?;
        }
        Ok(Resolution {
            block_number: outcome.block_number,
            tier: Tier::Network,
            trail: outcome.trail,
        })
    }

    /// A cached block is only an answer when its neighbour on the far side of
    /// `timestamp` is cached too. Otherwise an uncached block could sit between.
    fn store_block_of_timestamp(
        &self,
        store: &dyn Store,
        timestamp: u64,
        mode: TimestampMode,
    ) -> Result<Option<BlockRef>, ResolveError> {
        let read = store.begin_read()?;
        let Some(block) = read.query_timestamp_block(self.network, timestamp, mode)? else {
            return Ok(None);
        };
        let proven = match mode {
            TimestampMode::After | TimestampMode::Equal => match block.number.checked_sub(1) {
                None => true,
                Some(previous) => read
                    .block(self.network, previous)?
                    .is_some_and(|previous| previous.timestamp < timestamp),
            },
            TimestampMode::Before => read
                .block(self.network, block.number + 1)?
                .is_some_and(|next| next.timestamp > timestamp),
        };
        Ok(proven.then_some(block))
    }

    fn persist_confirmed(
        &self,
        store: &dyn Store,
        head: u64,
        fetched: &[BlockRef],
    ) -> Result<(), ResolveError> {
        let context = ConfirmationContext::new(self.network);
        let Some(latest_allowed) = self.policy.latest_allowed_block(&context, head)? else {
            return Ok(());
        };
        let confirmed: Vec<BlockRef> = fetched
            .iter()
            .filter(|block| block.number <= latest_allowed)
            .copied()
            .collect();
        if confirmed.is_empty() {
            return Ok(());
        }

        // The search already has its answer; a failed cache write only costs a
        // later lookup.
        match write_blocks(store, self.network, &confirmed) {
            Ok(()) => debug!(blocks = confirmed.len(), "cached confirmed blocks"),
            Err(err) if err.is_transient() => {
                warn!(?err, blocks = confirmed.len(), "failed to cache probed blocks");
            }
            Err(err) => {
                error!(?err, blocks = confirmed.len(), "store rejected probed blocks");
            }
        }
        Ok(())
    }

    /// Block number and timestamp of a block given by number or by time.
    pub async fn block_number_and_time(
        &self,
        selector: BlockSelector,
        cache: &mut TimestampSearchCache,
    ) -> Result<(u64, u64), ResolveError> {
        let number = match selector {
            BlockSelector::Number(number) => number,
            BlockSelector::Timestamp(timestamp) => {
                self.resolve(ResolveRequest::new(timestamp), cache)
                    .await?
                    .block_number
            }
        };
        if let Some(timestamp) = cache.get(number) {
            return Ok((number, timestamp));
        }
        if let Some(store) = self.store.as_deref() {
            let read = store.begin_read()?;
            if let Some(block) = read.block(self.network, number)? {
                return Ok((block.number, block.timestamp));
            }
        }
        let Some(client) = self.client.as_deref() else {
            return Err(ResolveError::configuration(format!(
                "block {number} is not cached and no chain client is configured"
            )));
        };
        let block = client.block(number).await?;
        cache.insert(block.number, block.timestamp);
        Ok((block.number, block.timestamp))
    }
}

fn write_blocks(store: &dyn Store, network: ChainId, blocks: &[BlockRef]) -> Result<(), StoreError> {
    let mut txn = store.begin_write()?;
    txn.ensure_schema(&BLOCKS_SCHEMA, network)?;
    txn.upsert_blocks(network, blocks)?;
    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::{BlockSelector, BlockTimeResolver, ResolveRequest, Tier};
    use crate::arrays::TimestampHint;
    use crate::error::ResolveError;
    use crate::search::TimestampSearchCache;
    use crate::search::test_chain::SyntheticChain;
    use alloy::primitives::B256;
    use chaincache_core::{
        BlockRef, ConfirmationPolicy, Store, StoreError, StoreRead, StoreWrite, TimestampMode,
    };
    use local_db::{DbConfig, DbStore};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NETWORK: u64 = 1;

    fn temp_root_dir() -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir()
            .join("chaincache-tests")
            .join(format!("block-times-{}-{nanos}", std::process::id()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    /// Store that counts scopes and never answers.
    #[derive(Default)]
    struct CountingStore {
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl Store for CountingStore {
        fn begin_read(&self) -> Result<Box<dyn StoreRead + '_>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::operational("unavailable"))
        }

        fn begin_write(&self) -> Result<Box<dyn StoreWrite + '_>, StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::operational("unavailable"))
        }
    }

    fn block(number: u64, timestamp: u64) -> BlockRef {
        BlockRef {
            number,
            timestamp,
            hash: B256::left_padding_from(&number.to_be_bytes()),
        }
    }

    #[tokio::test]
    async fn array_tier_skips_store_and_client() {
        let chain = Arc::new(SyntheticChain::irregular(100));
        let store = Arc::new(CountingStore::default());
        let resolver = BlockTimeResolver::new(NETWORK, ConfirmationPolicy::new())
            .with_client(chain.clone())
            .with_store(store.clone());
        let numbers = [100, 200, 300];
        let timestamps = [1000, 2000, 3000];
        let hint = TimestampHint::Arrays {
            block_numbers: &numbers,
            timestamps: &timestamps,
        };
        let mut cache = TimestampSearchCache::new();

        for (timestamp, mode, expected) in [
            (1500, TimestampMode::After, 200),
            (1500, TimestampMode::Before, 100),
            (2000, TimestampMode::Equal, 200),
        ] {
            let resolution = resolver
                .resolve(ResolveRequest::new(timestamp).mode(mode).hint(hint), &mut cache)
                .await
                .expect("resolve");
            assert_eq!(resolution.block_number, expected);
            assert_eq!(resolution.tier, Tier::Arrays);
        }
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert_eq!(chain.block_calls(), 0);
        assert_eq!(chain.head_calls(), 0);
    }

    #[tokio::test]
    async fn missing_inputs_are_a_configuration_error() {
        let resolver = BlockTimeResolver::new(NETWORK, ConfirmationPolicy::new());
        let mut cache = TimestampSearchCache::new();
        let err = resolver
            .resolve(ResolveRequest::new(1_600_000_000), &mut cache)
            .await
            .expect_err("nothing to resolve with");
        assert!(matches!(err, ResolveError::Configuration(_)));

        let chain = Arc::new(SyntheticChain::irregular(100));
        let resolver = resolver.with_client(chain);
        let err = resolver
            .resolve(ResolveRequest::new(1_600_000_000).nary(1), &mut cache)
            .await
            .expect_err("nary too small");
        assert!(matches!(err, ResolveError::Configuration(_)));
    }

    #[tokio::test]
    async fn network_tier_persists_only_confirmed_probes() {
        let root_dir = temp_root_dir();
        let store = Arc::new(
            DbStore::open(DbConfig {
                root_dir: root_dir.clone(),
            })
            .expect("open db"),
        );
        let chain = Arc::new(SyntheticChain::irregular(10_000));
        let policy = ConfirmationPolicy::new().with_override(NETWORK, 5_000);
        let resolver = BlockTimeResolver::new(NETWORK, policy)
            .with_client(chain.clone())
            .with_store(store.clone());
        let target = chain.timestamps[2_500];
        let mut cache = TimestampSearchCache::new();

        let resolution = resolver
            .resolve(ResolveRequest::new(target).verbose(true), &mut cache)
            .await
            .expect("resolve");
        assert_eq!(resolution.tier, Tier::Network);
        assert_eq!(resolution.block_number, 2_499);
        assert!(!resolution.trail.is_empty());

        let read = store.begin_read().expect("begin read");
        assert!(read.block(NETWORK, 9_999).expect("head").is_none());
        for (number, timestamp) in cache.range(..=4_999) {
            assert_eq!(
                read.block(NETWORK, number).expect("block"),
                chain.block_ref(number)
            );
            assert_eq!(chain.timestamps[number as usize], timestamp);
        }
        assert!(cache.range(5_000..).all(|(number, _)| {
            read.block(NETWORK, number).expect("block").is_none()
        }));
        drop(read);

        // The search ends on adjacent probes, so the same request is now a store hit.
        let calls = chain.block_calls();
        let resolution = resolver
            .resolve(ResolveRequest::new(target), &mut TimestampSearchCache::new())
            .await
            .expect("resolve again");
        assert_eq!(resolution.tier, Tier::Store);
        assert_eq!(resolution.block_number, 2_499);
        assert_eq!(chain.block_calls(), calls);

        drop(resolver);
        drop(store);
        fs::remove_dir_all(&root_dir).expect("remove temp dir");
    }

    #[tokio::test]
    async fn store_hit_needs_a_cached_neighbour() {
        let root_dir = temp_root_dir();
        let store = Arc::new(
            DbStore::open(DbConfig {
                root_dir: root_dir.clone(),
            })
            .expect("open db"),
        );
        let mut txn = store.begin_write().expect("begin write");
        txn.upsert_blocks(NETWORK, &[block(10, 100), block(20, 200), block(21, 212)])
            .expect("upsert blocks");
        txn.commit().expect("commit");

        let resolver = BlockTimeResolver::new(NETWORK, ConfirmationPolicy::new())
            .with_store(store.clone());
        let mut cache = TimestampSearchCache::new();

        let resolution = resolver
            .resolve(ResolveRequest::new(205), &mut cache)
            .await
            .expect("after is proven by block 20");
        assert_eq!((resolution.block_number, resolution.tier), (21, Tier::Store));

        let resolution = resolver
            .resolve(
                ResolveRequest::new(205).mode(TimestampMode::Before),
                &mut cache,
            )
            .await
            .expect("before is proven by block 21");
        assert_eq!((resolution.block_number, resolution.tier), (20, Tier::Store));

        // Blocks 11..19 are unknown, so neither side is proven for 150.
        for mode in [TimestampMode::After, TimestampMode::Before] {
            let err = resolver
                .resolve(ResolveRequest::new(150).mode(mode), &mut cache)
                .await
                .expect_err("unproven hit falls through to the missing client");
            assert!(matches!(err, ResolveError::Configuration(_)));
        }

        let err = resolver
            .resolve(ResolveRequest::new(205).use_store(false), &mut cache)
            .await
            .expect_err("store disabled");
        assert!(matches!(err, ResolveError::Configuration(_)));

        drop(resolver);
        drop(store);
        fs::remove_dir_all(&root_dir).expect("remove temp dir");
    }

    #[tokio::test]
    async fn transient_store_failures_fall_back_to_the_node() {
        let chain = Arc::new(SyntheticChain::irregular(1_000));
        let store = Arc::new(CountingStore::default());
        let resolver = BlockTimeResolver::new(NETWORK, ConfirmationPolicy::new())
            .with_client(chain.clone())
            .with_store(store.clone());
        let mut cache = TimestampSearchCache::new();

        let resolution = resolver
            .resolve(ResolveRequest::new(chain.timestamps[400]), &mut cache)
            .await
            .expect("resolve from the node");
        assert_eq!(resolution.tier, Tier::Network);
        assert_eq!(
            chain.timestamps[resolution.block_number as usize],
            chain.timestamps[400]
        );
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);

        resolver
            .resolve(
                ResolveRequest::new(chain.timestamps[400]).use_store(false),
                &mut cache,
            )
            .await
            .expect("network only");
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    /// Store whose reads miss and whose writes fail with a non-transient error.
    #[derive(Default)]
    struct RejectingStore {
        writes: AtomicUsize,
    }

    impl Store for RejectingStore {
        fn begin_read(&self) -> Result<Box<dyn StoreRead + '_>, StoreError> {
            Err(StoreError::operational("unavailable"))
        }

        fn begin_write(&self) -> Result<Box<dyn StoreWrite + '_>, StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::data("block record does not encode"))
        }
    }

    #[tokio::test]
    async fn rejected_write_back_keeps_the_resolution() {
        let chain = Arc::new(SyntheticChain::irregular(1_000));
        let store = Arc::new(RejectingStore::default());
        let resolver = BlockTimeResolver::new(NETWORK, ConfirmationPolicy::new())
            .with_client(chain.clone())
            .with_store(store.clone());
        let target = chain.timestamps[700];
        let mut cache = TimestampSearchCache::new();

        let resolution = resolver
            .resolve(ResolveRequest::new(target).mode(TimestampMode::Before), &mut cache)
            .await
            .expect("resolve despite the failed write");
        assert_eq!(resolution.tier, Tier::Network);
        assert_eq!(
            resolution.block_number,
            (chain.timestamps.partition_point(|ts| *ts <= target) - 1) as u64
        );
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn block_number_and_time_by_number_and_timestamp() {
        let chain = Arc::new(SyntheticChain::irregular(1_000));
        let resolver =
            BlockTimeResolver::new(NETWORK, ConfirmationPolicy::new()).with_client(chain.clone());
        let mut cache = TimestampSearchCache::new();

        let (number, timestamp) = resolver
            .block_number_and_time(BlockSelector::Number(42), &mut cache)
            .await
            .expect("by number");
        assert_eq!((number, timestamp), (42, chain.timestamps[42]));

        let target = chain.timestamps[600] - 1;
        let (number, timestamp) = resolver
            .block_number_and_time(BlockSelector::Timestamp(target.into()), &mut cache)
            .await
            .expect("by timestamp");
        assert!(timestamp >= target);
        assert!(chain.timestamps[number as usize - 1] < target);
    }
}
