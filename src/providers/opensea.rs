//! OpenSea collection stats adapter.
//!
//! Looked up by the stored vendor slug. Before pricing, the contract's own
//! collection slug is fetched and compared with the stored one; a mismatch
//! means the mapping is stale and the quote is treated as a miss.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use super::{get_json, require, PriceProvider, ProviderKind, ProviderQuote, QuoteRequest};
use crate::models::{Network, Vendor};
use crate::value::Currency;

#[derive(Debug, Deserialize)]
struct ContractResponse {
    collection: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    total: Option<TotalStats>,
    #[serde(default)]
    intervals: Vec<IntervalStats>,
}

#[derive(Debug, Deserialize)]
struct TotalStats {
    floor_price: Option<Decimal>,
    floor_price_symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntervalStats {
    interval: String,
    average_price: Option<Decimal>,
}

pub struct OpenSeaProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenSeaProvider {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn chain_slug(network: Network) -> &'static str {
        match network {
            Network::Ethereum => "ethereum",
            Network::Polygon => "matic",
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn slug_matches(reported: Option<&str>, stored: &str) -> bool {
    reported.map_or(false, |r| r.trim().eq_ignore_ascii_case(stored))
}

/// An unstated symbol means native; an unrecognised one fails the quote so
/// the next provider is tried.
fn into_quote(stats: StatsResponse, native: Currency) -> Result<ProviderQuote> {
    let (floor, symbol) = match stats.total {
        Some(t) => (t.floor_price, t.floor_price_symbol),
        None => (None, None),
    };
    let currency = match symbol.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => native,
        Some(s) => Currency::from_symbol(s).ok_or_else(|| anyhow!("opensea floor currency {:?}", s))?,
    };
    let avg = stats
        .intervals
        .iter()
        .find(|i| i.interval == "one_day")
        .and_then(|i| i.average_price);

    Ok(ProviderQuote::new(ProviderKind::Opensea, floor, avg, currency))
}

#[async_trait]
impl PriceProvider for OpenSeaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Opensea
    }

    async fn quote(&self, req: &QuoteRequest<'_>) -> Result<ProviderQuote> {
        let slug = require(req.collection.vendor_id(Vendor::Opensea), "opensea vendor id")?;
        let api_key = require(self.api_key.as_deref(), "OPENSEA_API_KEY")?;
        let chain = Self::chain_slug(req.blockchain.network);

        let contract: ContractResponse = get_json(
            self.http
                .get(self.url(&format!(
                    "/api/v2/chain/{}/contract/{}",
                    chain, req.collection.address
                )))
                .header("x-api-key", api_key),
            "opensea contract",
        )
        .await?;

        if !slug_matches(contract.collection.as_deref(), slug) {
            warn!(
                collection = %req.collection.address,
                stored = slug,
                reported = ?contract.collection,
                "opensea slug mismatch, skipping"
            );
            return Err(anyhow!("opensea slug mismatch for {}", req.collection.address));
        }

        let stats: StatsResponse = get_json(
            self.http
                .get(self.url(&format!("/api/v2/collections/{}/stats", slug)))
                .header("x-api-key", api_key),
            "opensea stats",
        )
        .await?;

        into_quote(stats, req.blockchain.native_currency())
    }
}
