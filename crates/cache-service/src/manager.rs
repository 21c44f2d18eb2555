use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::ChainId;
use block_times::{
    BlockSelector, BlockTimeResolver, ResolveError, ResolveRequest, Resolution,
    TimestampSearchCache,
};
use chaincache_core::{
    ConfirmationContext, ConfirmationPolicy, EventBatch, EventQuery, PolicyError, SchemaName,
    Store, Timestamp,
};
use tokio::sync::RwLock;
use tracing::info;

use crate::guard::{GuardError, repair};
use crate::intake::{EventIntake, IntakeError, IntakeOutcome};
use crate::types::NetworkConfig;

#[derive(Debug, thiserror::Error)]
pub enum CacheManagerError {
    #[error("network {0} not found")]
    NetworkNotFound(ChainId),
    #[error("schema guard error: {0}")]
    Guard(#[from] GuardError),
    #[error("confirmation policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("intake error: {0}")]
    Intake(#[from] IntakeError),
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),
}

/// Intake and block time resolution for one registered network.
pub struct NetworkCache {
    chain_id: ChainId,
    nary: usize,
    intake: EventIntake,
    resolver: BlockTimeResolver,
}

impl std::fmt::Debug for NetworkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkCache")
            .field("chain_id", &self.chain_id)
            .field("nary", &self.nary)
            .finish_non_exhaustive()
    }
}

impl NetworkCache {
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    #[must_use]
    pub fn resolver(&self) -> &BlockTimeResolver {
        &self.resolver
    }

    /// A request using this network's configured search width.
    pub fn request(&self, timestamp: impl Into<Timestamp>) -> ResolveRequest<'static> {
        ResolveRequest::new(timestamp).nary(self.nary)
    }

    pub async fn intake(
        &self,
        events: impl Into<EventBatch>,
        query: EventQuery,
        latest_block: Option<u64>,
    ) -> Result<IntakeOutcome, IntakeError> {
        self.intake
            .intake(events, query, ConfirmationContext::new(self.chain_id), latest_block)
            .await
    }

    pub async fn resolve(
        &self,
        request: ResolveRequest<'_>,
        cache: &mut TimestampSearchCache,
    ) -> Result<Resolution, ResolveError> {
        self.resolver.resolve(request, cache).await
    }

    pub async fn block_number_and_time(
        &self,
        selector: BlockSelector,
        cache: &mut TimestampSearchCache,
    ) -> Result<(u64, u64), ResolveError> {
        self.resolver.block_number_and_time(selector, cache).await
    }
}

pub struct CacheManager {
    store: Arc<dyn Store>,
    networks: RwLock<HashMap<ChainId, Arc<NetworkCache>>>,
}

impl CacheManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            networks: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a network after repairing its persisted schemas. Intake and
    /// resolution are only reachable once this returns.
    pub async fn add_network(
        &self,
        cfg: NetworkConfig,
    ) -> Result<Arc<NetworkCache>, CacheManagerError> {
        if let Some(existing) = self.networks.read().await.get(&cfg.chain_id) {
            return Ok(Arc::clone(existing));
        }

        let policy = match cfg.required_confirmations {
            Some(confirmations) => {
                ConfirmationPolicy::new().with_override(cfg.chain_id, confirmations)
            }
            None => ConfirmationPolicy::new(),
        };
        let confirmations =
            policy.required_confirmations(&ConfirmationContext::new(cfg.chain_id))?;

        for schema in SchemaName::ALL {
            let report = repair(self.store.as_ref(), schema, &[cfg.chain_id])?;
            if !report.is_clean() {
                info!(chain_id = cfg.chain_id, %schema, "schema will be rebuilt");
            }
        }

        let intake = EventIntake::new(policy.clone(), Arc::clone(&self.store))
            .with_client(Arc::clone(&cfg.client));
        let resolver = BlockTimeResolver::new(cfg.chain_id, policy)
            .with_client(Arc::clone(&cfg.client))
            .with_store(Arc::clone(&self.store));
        let network = Arc::new(NetworkCache {
            chain_id: cfg.chain_id,
            nary: cfg.nary,
            intake,
            resolver,
        });

        let mut networks = self.networks.write().await;
        let network = Arc::clone(networks.entry(cfg.chain_id).or_insert(network));
        info!(chain_id = cfg.chain_id, confirmations, nary = cfg.nary, "network registered");
        Ok(network)
    }

    pub async fn remove_network(&self, chain_id: ChainId) -> bool {
        self.networks.write().await.remove(&chain_id).is_some()
    }

    pub async fn network(&self, chain_id: ChainId) -> Option<Arc<NetworkCache>> {
        self.networks.read().await.get(&chain_id).cloned()
    }

    pub async fn networks(&self) -> Vec<ChainId> {
        let mut chain_ids: Vec<ChainId> = self.networks.read().await.keys().copied().collect();
        chain_ids.sort_unstable();
        chain_ids
    }

    async fn require(&self, chain_id: ChainId) -> Result<Arc<NetworkCache>, CacheManagerError> {
        self.network(chain_id)
            .await
            .ok_or(CacheManagerError::NetworkNotFound(chain_id))
    }

    pub async fn intake(
        &self,
        chain_id: ChainId,
        events: impl Into<EventBatch>,
        query: EventQuery,
        latest_block: Option<u64>,
    ) -> Result<IntakeOutcome, CacheManagerError> {
        let network = self.require(chain_id).await?;
        Ok(network.intake(events, query, latest_block).await?)
    }

    pub async fn resolve(
        &self,
        chain_id: ChainId,
        request: ResolveRequest<'_>,
        cache: &mut TimestampSearchCache,
    ) -> Result<Resolution, CacheManagerError> {
        let network = self.require(chain_id).await?;
        Ok(network.resolve(request, cache).await?)
    }

    pub async fn block_number_and_time(
        &self,
        chain_id: ChainId,
        selector: BlockSelector,
        cache: &mut TimestampSearchCache,
    ) -> Result<(u64, u64), CacheManagerError> {
        let network = self.require(chain_id).await?;
        Ok(network.block_number_and_time(selector, cache).await?)
    }
}
