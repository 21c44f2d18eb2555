use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use alloy::providers::{Provider, ProviderBuilder};
use alloy_provider::DynProvider;
use async_trait::async_trait;
use rand::prelude::IndexedRandom;
use tracing::warn;
use url::Url;

use crate::client::{ChainClient, ClientError};
use crate::types::BlockRef;

#[derive(Clone)]
pub struct ProviderHandle {
    pub index: usize,
    pub url: Url,
    pub provider: DynProvider,
}

struct ProviderEntry {
    url: Url,
    provider: DynProvider,
}

/// Read-only RPC endpoints of one network. A provider that fails a call is put
/// on cooldown and the error is returned to the caller.
pub struct QueryRpcPool {
    providers: Vec<ProviderEntry>,
    cooldown: Duration,
    cooldowns: Mutex<HashMap<usize, Instant>>,
}

impl QueryRpcPool {
    #[must_use]
    pub fn new(urls: Vec<Url>, cooldown: Duration) -> Self {
        let providers = urls
            .into_iter()
            .map(|url| ProviderEntry {
                provider: ProviderBuilder::new().connect_http(url.clone()).erased(),
                url,
            })
            .collect();
        Self::with_entries(providers, cooldown)
    }

    #[must_use]
    pub fn from_providers(providers: Vec<(Url, DynProvider)>, cooldown: Duration) -> Self {
        let providers = providers
            .into_iter()
            .map(|(url, provider)| ProviderEntry { url, provider })
            .collect();
        Self::with_entries(providers, cooldown)
    }

    fn with_entries(providers: Vec<ProviderEntry>, cooldown: Duration) -> Self {
        Self {
            providers,
            cooldown,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    #[must_use]
    pub fn random_provider(&self) -> Option<ProviderHandle> {
        if self.providers.is_empty() {
            return None;
        }

        let now = Instant::now();
        let mut cooldowns = self
            .cooldowns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cooldowns.retain(|_, until| *until > now);

        let available: Vec<usize> = (0..self.providers.len())
            .filter(|index| !cooldowns.contains_key(index))
            .collect();
        let index = *available.choose(&mut rand::rng())?;
        Some(self.handle(index))
    }

    pub fn mark_bad_provider(&self, handle: &ProviderHandle) {
        let until = Instant::now() + self.cooldown;
        let mut cooldowns = self
            .cooldowns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cooldowns.insert(handle.index, until);
    }

    fn handle(&self, index: usize) -> ProviderHandle {
        let entry = &self.providers[index];
        ProviderHandle {
            index,
            url: entry.url.clone(),
            provider: entry.provider.clone(),
        }
    }

    fn record_failure(&self, rpc: &ProviderHandle, err: &ClientError) {
        if matches!(err, ClientError::BlockNotFound(_)) {
            return;
        }
        if err.is_rpc_throttled() {
            warn!(rpc = rpc.url.as_str(), "rpc is throttled, cooling down");
        } else {
            warn!(?err, rpc = rpc.url.as_str(), "rpc call failed, cooling down");
        }
        self.mark_bad_provider(rpc);
    }
}

#[async_trait]
impl ChainClient for QueryRpcPool {
    async fn latest_block_number(&self) -> Result<u64, ClientError> {
        let rpc = self.random_provider().ok_or(ClientError::NoHealthyRpc)?;
        let result = rpc.provider.latest_block_number().await;
        if let Err(err) = &result {
            self.record_failure(&rpc, err);
        }
        result
    }

    async fn block(&self, number: u64) -> Result<BlockRef, ClientError> {
        let rpc = self.random_provider().ok_or(ClientError::NoHealthyRpc)?;
        let result = rpc.provider.block(number).await;
        if let Err(err) = &result {
            self.record_failure(&rpc, err);
        }
        result
    }
}
