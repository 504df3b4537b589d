//! USD reference prices for cross-chain conversion.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::value::Currency;

const PRICE_TTL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn usd_price(&self, currency: Currency) -> Result<Decimal>;
}

#[derive(Debug, Deserialize)]
struct UsdQuote {
    usd: Option<Decimal>,
}

/// CoinGecko `simple/price` with a short in-process cache.
pub struct CoinGeckoOracle {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    cache: RwLock<HashMap<Currency, (Decimal, Instant)>>,
}

impl CoinGeckoOracle {
    pub fn new(http: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn coin_id(currency: Currency) -> Option<&'static str> {
        match currency {
            Currency::Eth => Some("ethereum"),
            Currency::Matic => Some("matic-network"),
            Currency::Usd => None,
        }
    }

    fn cached(&self, currency: Currency) -> Option<Decimal> {
        self.cache
            .read()
            .get(&currency)
            .filter(|(_, at)| at.elapsed() < PRICE_TTL)
            .map(|(price, _)| *price)
    }
}

#[async_trait]
impl PriceOracle for CoinGeckoOracle {
    async fn usd_price(&self, currency: Currency) -> Result<Decimal> {
        let Some(id) = Self::coin_id(currency) else {
            return Ok(Decimal::ONE);
        };
        if let Some(price) = self.cached(currency) {
            return Ok(price);
        }

        let url = format!(
            "{}/api/v3/simple/price",
            self.base_url.trim_end_matches('/')
        );
        let mut req = self
            .http
            .get(url)
            .query(&[("ids", id), ("vs_currencies", "usd")]);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("x-cg-pro-api-key", key);
        }

        let resp = req.send().await.context("coingecko request failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("coingecko returned {}", resp.status()));
        }
        let body: HashMap<String, UsdQuote> =
            resp.json().await.context("failed to parse coingecko response")?;

        let price = body
            .get(id)
            .and_then(|q| q.usd)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| anyhow!("coingecko has no usd price for {}", id))?;

        debug!(currency = %currency, price = %price, "usd price refreshed");
        self.cache.write().insert(currency, (price, Instant::now()));
        Ok(price)
    }
}
