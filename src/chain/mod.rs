//! On-chain collaborators
//!
//! `ChainClient` reads contract state and balances over JSON-RPC,
//! `ChainIndex` answers aggregate questions an indexer can answer cheaply
//! (open loan principal per pool). Both are per-network and grouped into a
//! `ChainRegistry`.

pub mod abi;
pub mod rpc;
pub mod subgraph;

use async_trait::async_trait;
use num_bigint::BigUint;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{OracleError, Result};
use crate::models::{Blockchain, PoolVersion};

pub use abi::{AbiCall, AbiToken};
pub use rpc::JsonRpcChainClient;
pub use subgraph::SubgraphIndex;

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> anyhow::Result<u64>;

    /// Read-only `eth_call` at the latest block. Returns raw return data.
    async fn call(&self, contract: &str, call: &AbiCall) -> anyhow::Result<Vec<u8>>;

    /// Native balance in wei.
    async fn native_balance(&self, address: &str) -> anyhow::Result<BigUint>;

    /// ERC-20 `balanceOf(holder)` in token base units.
    async fn token_balance(&self, token: &str, holder: &str) -> anyhow::Result<BigUint>;
}

#[async_trait]
pub trait ChainIndex: Send + Sync {
    /// Sum of outstanding principal over the pool's open loans, in wei.
    async fn open_principal(&self, pool_address: &str) -> anyhow::Result<BigUint>;
}

/// Router contract per pool version. The router computes attestation
/// message hashes.
#[derive(Debug, Clone, Default)]
pub struct Routers {
    pub v1: Option<String>,
    pub v2: Option<String>,
}

impl Routers {
    pub fn router_for(&self, version: PoolVersion) -> Option<&str> {
        match version {
            PoolVersion::V1 => self.v1.as_deref(),
            PoolVersion::V2 => self.v2.as_deref(),
        }
    }
}

#[derive(Clone)]
pub struct ChainContext {
    pub blockchain: Blockchain,
    pub client: Arc<dyn ChainClient>,
    pub index: Arc<dyn ChainIndex>,
    pub routers: Routers,
}

impl ChainContext {
    pub fn router_for(&self, version: PoolVersion) -> Result<&str> {
        self.routers
            .router_for(version)
            .ok_or(OracleError::UnsupportedChain {
                network_id: self.blockchain.network_id,
            })
    }
}

/// Chain collaborators keyed by network id.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<u64, ChainContext>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ctx: ChainContext) {
        self.chains.insert(ctx.blockchain.network_id, ctx);
    }

    pub fn with(mut self, ctx: ChainContext) -> Self {
        self.insert(ctx);
        self
    }

    pub fn get(&self, blockchain: Blockchain) -> Result<&ChainContext> {
        self.chains
            .get(&blockchain.network_id)
            .filter(|ctx| ctx.blockchain == blockchain)
            .ok_or(OracleError::UnsupportedChain {
                network_id: blockchain.network_id,
            })
    }

    pub fn network_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Runs a chain read under the request's cancellation token. Cancellation
/// wins over a pending response; any other failure becomes `ChainQueryFailed`.
pub async fn chain_query<T, F>(
    cancel: &CancellationToken,
    context: impl Into<String>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OracleError::Cancelled),
        res = fut => res.map_err(|e| OracleError::chain(context, e)),
    }
}
