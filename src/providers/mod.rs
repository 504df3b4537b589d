//! Price providers
//!
//! One closed adapter per vendor, each reducing its wire format to a
//! `ProviderQuote`. Which adapters serve a chain, and in what order, is fixed
//! by `priority_table`.

pub mod cross_chain;
pub mod nftbank;
pub mod opensea;
pub mod oracle;
pub mod reservoir;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProvidersConfig;
use crate::datasource::Meaningful;
use crate::error::OracleError;
use crate::models::{Blockchain, Collection};
use crate::value::Currency;

pub use cross_chain::CrossChainProvider;
pub use nftbank::NftBankProvider;
pub use opensea::OpenSeaProvider;
pub use oracle::{CoinGeckoOracle, PriceOracle};
pub use reservoir::ReservoirProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Reservoir,
    Opensea,
    Nftbank,
    /// Side-chain floor converted into the target chain's native currency.
    PolygonBridge,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Reservoir => "reservoir",
            ProviderKind::Opensea => "opensea",
            ProviderKind::Nftbank => "nftbank",
            ProviderKind::PolygonBridge => "polygon_bridge",
        }
    }
}

/// Static per-chain priority. Only mainnets are priced.
pub fn priority_table(blockchain: Blockchain) -> &'static [ProviderKind] {
    if blockchain == Blockchain::ETHEREUM_MAINNET {
        &[
            ProviderKind::Reservoir,
            ProviderKind::Opensea,
            ProviderKind::Nftbank,
            ProviderKind::PolygonBridge,
        ]
    } else if blockchain == Blockchain::POLYGON_MAINNET {
        &[
            ProviderKind::Reservoir,
            ProviderKind::Opensea,
            ProviderKind::Nftbank,
        ]
    } else {
        &[]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuoteRequest<'a> {
    pub blockchain: Blockchain,
    pub collection: &'a Collection,
    pub nft_id: Option<&'a str>,
}

/// Uniform adapter output. Prices are in `currency` units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderQuote {
    pub provider: ProviderKind,
    pub floor_price: Option<Decimal>,
    pub value_24h_avg: Option<Decimal>,
    pub currency: Currency,
}

impl ProviderQuote {
    /// Zero and negative prices mean "no data" for every vendor we use.
    pub fn new(
        provider: ProviderKind,
        floor_price: Option<Decimal>,
        value_24h_avg: Option<Decimal>,
        currency: Currency,
    ) -> Self {
        let positive = |d: Option<Decimal>| d.filter(|d| *d > Decimal::ZERO);
        Self {
            provider,
            floor_price: positive(floor_price),
            value_24h_avg: positive(value_24h_avg),
            currency,
        }
    }

    /// `min(floor, avg24h)` when both are present, else whichever is.
    pub fn conservative_value(&self) -> Option<Decimal> {
        match (self.floor_price, self.value_24h_avg) {
            (Some(floor), Some(avg)) => Some(floor.min(avg)),
            (floor, avg) => floor.or(avg),
        }
    }

    /// Usable as a valuation on `blockchain`.
    pub fn prices(&self, blockchain: Blockchain) -> bool {
        self.is_meaningful() && self.currency == blockchain.native_currency()
    }
}

impl Meaningful for ProviderQuote {
    fn is_meaningful(&self) -> bool {
        self.conservative_value().is_some()
    }
}

#[async_trait]
pub trait PriceProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn quote(&self, req: &QuoteRequest<'_>) -> anyhow::Result<ProviderQuote>;
}

/// Adapter prerequisite check shared by the vendors: a missing vendor id or
/// key is an immediate miss.
pub(crate) fn require<'a>(value: Option<&'a str>, what: &str) -> anyhow::Result<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::Error::new(OracleError::missing_credential(what)))
}

pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    req: reqwest::RequestBuilder,
    what: &str,
) -> anyhow::Result<T> {
    let resp = req
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("{} request failed: {}", what, e))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow::anyhow!("{} returned {}: {}", what, status, text));
    }
    resp.json::<T>()
        .await
        .map_err(|e| anyhow::anyhow!("failed to parse {} response: {}", what, e))
}

/// Ranked adapters per network id.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    by_network: HashMap<u64, Vec<Arc<dyn PriceProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an adapter after those already registered for the chain.
    pub fn register(&mut self, blockchain: Blockchain, provider: Arc<dyn PriceProvider>) {
        self.by_network
            .entry(blockchain.network_id)
            .or_default()
            .push(provider);
    }

    pub fn with(mut self, blockchain: Blockchain, provider: Arc<dyn PriceProvider>) -> Self {
        self.register(blockchain, provider);
        self
    }

    /// Adapters for the chain in priority order. `UnsupportedChain` when none.
    pub fn ranked(&self, blockchain: Blockchain) -> Result<&[Arc<dyn PriceProvider>], OracleError> {
        self.by_network
            .get(&blockchain.network_id)
            .filter(|list| !list.is_empty())
            .map(Vec::as_slice)
            .ok_or(OracleError::UnsupportedChain {
                network_id: blockchain.network_id,
            })
    }

    /// Builds every adapter named by `priority_table` for the mainnets.
    pub fn from_config(
        cfg: &ProvidersConfig,
        oracle: Arc<dyn PriceOracle>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        let mut registry = Self::new();
        for chain in [Blockchain::ETHEREUM_MAINNET, Blockchain::POLYGON_MAINNET] {
            for kind in priority_table(chain) {
                let provider: Arc<dyn PriceProvider> = match kind {
                    ProviderKind::Reservoir => Arc::new(ReservoirProvider::new(
                        http.clone(),
                        cfg.reservoir_base_url(chain.network),
                        cfg.reservoir_api_key.clone(),
                    )),
                    ProviderKind::Opensea => Arc::new(OpenSeaProvider::new(
                        http.clone(),
                        cfg.opensea_base_url.clone(),
                        cfg.opensea_api_key.clone(),
                    )),
                    ProviderKind::Nftbank => Arc::new(NftBankProvider::new(
                        http.clone(),
                        cfg.nftbank_base_url.clone(),
                        cfg.nftbank_api_key.clone(),
                    )),
                    ProviderKind::PolygonBridge => {
                        let side = Blockchain::POLYGON_MAINNET;
                        let inner = Arc::new(ReservoirProvider::new(
                            http.clone(),
                            cfg.reservoir_base_url(side.network),
                            cfg.reservoir_api_key.clone(),
                        ));
                        Arc::new(CrossChainProvider::new(
                            ProviderKind::PolygonBridge,
                            inner,
                            side,
                            oracle.clone(),
                        ))
                    }
                };
                registry.register(chain, provider);
            }
        }
        Ok(registry)
    }
}
