//! NFTBank estimates. Collection floor by default, token-level estimate when
//! an nft id is supplied.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{get_json, require, PriceProvider, ProviderKind, ProviderQuote, QuoteRequest};
use crate::models::{Network, Vendor};
use crate::value::Currency;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FloorData {
    floor_price: Option<Decimal>,
    avg_price_24h: Option<Decimal>,
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EstimateData {
    estimate: Option<Decimal>,
    estimate_24h: Option<Decimal>,
    currency: Option<String>,
}

pub struct NftBankProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl NftBankProvider {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn chain_param(network: Network) -> &'static str {
        match network {
            Network::Ethereum => "ETHEREUM",
            Network::Polygon => "POLYGON",
        }
    }
}

fn currency_or(symbol: Option<&str>, fallback: Currency) -> Result<Currency> {
    match symbol {
        None => Ok(fallback),
        Some(s) => Currency::from_symbol(s).ok_or_else(|| anyhow!("nftbank currency {:?}", s)),
    }
}

#[async_trait]
impl PriceProvider for NftBankProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Nftbank
    }

    async fn quote(&self, req: &QuoteRequest<'_>) -> Result<ProviderQuote> {
        let id = require(req.collection.vendor_id(Vendor::Nftbank), "nftbank vendor id")?;
        let api_key = require(self.api_key.as_deref(), "NFTBANK_API_KEY")?;
        let base = self.base_url.trim_end_matches('/');
        let chain = Self::chain_param(req.blockchain.network);
        let native = req.blockchain.native_currency();

        match req.nft_id {
            Some(nft_id) => {
                let env: Envelope<EstimateData> = get_json(
                    self.http
                        .get(format!("{}/v3/estimates/{}/{}", base, id, nft_id))
                        .header("x-api-key", api_key)
                        .query(&[("chain", chain)]),
                    "nftbank estimate",
                )
                .await?;
                let data = env.data.ok_or_else(|| anyhow!("nftbank estimate has no data"))?;
                Ok(ProviderQuote::new(
                    ProviderKind::Nftbank,
                    data.estimate,
                    data.estimate_24h,
                    currency_or(data.currency.as_deref(), native)?,
                ))
            }
            None => {
                let env: Envelope<FloorData> = get_json(
                    self.http
                        .get(format!("{}/v3/collections/{}/floor", base, id))
                        .header("x-api-key", api_key)
                        .query(&[("chain", chain)]),
                    "nftbank floor",
                )
                .await?;
                let data = env.data.ok_or_else(|| anyhow!("nftbank floor has no data"))?;
                Ok(ProviderQuote::new(
                    ProviderKind::Nftbank,
                    data.floor_price,
                    data.avg_price_24h,
                    currency_or(data.currency.as_deref(), native)?,
                ))
            }
        }
    }
}
