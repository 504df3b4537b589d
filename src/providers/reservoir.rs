//! Reservoir collection floor adapter.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{get_json, require, PriceProvider, ProviderKind, ProviderQuote, QuoteRequest};

#[derive(Debug, Deserialize)]
struct CollectionsResponse {
    #[serde(default)]
    collections: Vec<CollectionStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionStats {
    floor_ask: Option<FloorAsk>,
    floor_sale: Option<FloorSale>,
}

#[derive(Debug, Deserialize)]
struct FloorAsk {
    price: Option<AskPrice>,
}

#[derive(Debug, Deserialize)]
struct AskPrice {
    amount: Option<AskAmount>,
}

#[derive(Debug, Deserialize)]
struct AskAmount {
    /// Already in the chain's native currency.
    native: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct FloorSale {
    #[serde(rename = "1day")]
    one_day: Option<Decimal>,
}

pub struct ReservoirProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl ReservoirProvider {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
        }
    }
}

fn into_quote(resp: CollectionsResponse, req: &QuoteRequest<'_>) -> Result<ProviderQuote> {
    let stats = resp
        .collections
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("reservoir has no collection {}", req.collection.address))?;

    let floor = stats
        .floor_ask
        .and_then(|a| a.price)
        .and_then(|p| p.amount)
        .and_then(|a| a.native);
    let avg = stats.floor_sale.and_then(|s| s.one_day);

    Ok(ProviderQuote::new(
        ProviderKind::Reservoir,
        floor,
        avg,
        req.blockchain.native_currency(),
    ))
}

#[async_trait]
impl PriceProvider for ReservoirProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Reservoir
    }

    async fn quote(&self, req: &QuoteRequest<'_>) -> Result<ProviderQuote> {
        let api_key = require(self.api_key.as_deref(), "RESERVOIR_API_KEY")?;
        let url = format!("{}/collections/v7", self.base_url.trim_end_matches('/'));

        let resp: CollectionsResponse = get_json(
            self.http
                .get(url)
                .header("x-api-key", api_key)
                .query(&[("id", req.collection.address.to_ascii_lowercase())]),
            "reservoir /collections/v7",
        )
        .await?;

        into_quote(resp, req)
    }
}
