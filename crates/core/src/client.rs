use std::sync::Arc;

use alloy::eips::BlockNumberOrTag;
use alloy_provider::{DynProvider, Provider};
use alloy_transport::TransportError;
use async_trait::async_trait;

use crate::types::BlockRef;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("rpc error: {0}")]
    Rpc(#[from] TransportError),
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("no healthy rpc available")]
    NoHealthyRpc,
}

impl ClientError {
    pub fn is_rpc_throttled(&self) -> bool {
        match self {
            Self::Rpc(TransportError::ErrorResp(resp)) => resp.message.contains("limit exceeded"),
            Self::Rpc(TransportError::Transport(resp)) => resp
                .as_http_error()
                .is_some_and(|err| err.status == 429 || err.body.contains("limit exceeded")),
            _ => false,
        }
    }
}

/// Read access to the remote node. Failures are surfaced, never retried here.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, ClientError>;

    async fn block(&self, number: u64) -> Result<BlockRef, ClientError>;
}

#[async_trait]
impl ChainClient for DynProvider {
    async fn latest_block_number(&self) -> Result<u64, ClientError> {
        Ok(self.get_block_number().await?)
    }

    async fn block(&self, number: u64) -> Result<BlockRef, ClientError> {
        let block = self
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await?
            .ok_or(ClientError::BlockNotFound(number))?;
        Ok(BlockRef {
            number: block.header.number,
            timestamp: block.header.timestamp,
            hash: block.header.hash,
        })
    }
}

#[async_trait]
impl<T: ChainClient + ?Sized> ChainClient for Arc<T> {
    async fn latest_block_number(&self) -> Result<u64, ClientError> {
        (**self).latest_block_number().await
    }

    async fn block(&self, number: u64) -> Result<BlockRef, ClientError> {
        (**self).block(number).await
    }
}
