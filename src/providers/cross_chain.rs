//! Prices a collection on a side chain and converts the quote into the target
//! chain's native currency.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use super::{PriceOracle, PriceProvider, ProviderKind, ProviderQuote, QuoteRequest};
use crate::models::Blockchain;
use crate::value::floor_div;

pub struct CrossChainProvider {
    kind: ProviderKind,
    inner: Arc<dyn PriceProvider>,
    side: Blockchain,
    oracle: Arc<dyn PriceOracle>,
}

impl CrossChainProvider {
    pub fn new(
        kind: ProviderKind,
        inner: Arc<dyn PriceProvider>,
        side: Blockchain,
        oracle: Arc<dyn PriceOracle>,
    ) -> Self {
        Self {
            kind,
            inner,
            side,
            oracle,
        }
    }
}

/// `amount * side_usd / native_usd`, rounded once at the end.
fn convert(amount: Option<Decimal>, side_usd: Decimal, native_usd: Decimal) -> Result<Option<Decimal>> {
    let Some(amount) = amount else {
        return Ok(None);
    };
    amount
        .checked_mul(side_usd)
        .and_then(|usd| floor_div(usd, native_usd))
        .map(Some)
        .ok_or_else(|| anyhow!("conversion overflow"))
}

#[async_trait]
impl PriceProvider for CrossChainProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn quote(&self, req: &QuoteRequest<'_>) -> Result<ProviderQuote> {
        let side_req = QuoteRequest {
            blockchain: self.side,
            ..*req
        };
        let side_quote = self.inner.quote(&side_req).await?;

        let target = req.blockchain.native_currency();
        if side_quote.currency == target {
            return Ok(ProviderQuote { provider: self.kind, ..side_quote });
        }

        let native_usd = self.oracle.usd_price(target).await?;
        let side_usd = self.oracle.usd_price(side_quote.currency).await?;
        if native_usd <= Decimal::ZERO || side_usd <= Decimal::ZERO {
            return Err(anyhow!("unusable usd prices {} / {}", native_usd, side_usd));
        }

        debug!(
            collection = %req.collection.address,
            from = %side_quote.currency,
            to = %target,
            native_usd = %native_usd,
            side_usd = %side_usd,
            "converting side-chain quote"
        );

        Ok(ProviderQuote::new(
            self.kind,
            convert(side_quote.floor_price, side_usd, native_usd)?,
            convert(side_quote.value_24h_avg, side_usd, native_usd)?,
            target,
        ))
    }
}
