//! Pool capacity and utilization bookkeeping.
//!
//! Capacity is measured differently per pool generation; the choice is made
//! once, on `PoolAccounting`. Utilization always comes from the loan index.

use anyhow::anyhow;
use num_bigint::BigUint;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chain::{chain_query, ChainRegistry};
use crate::error::{OracleError, Result};
use crate::models::{Pool, PoolAccounting};
use crate::value::{from_base_units, Value, NATIVE_DECIMALS};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolSnapshot {
    pub capacity: Value,
    pub utilization: Value,
    pub value_locked: Value,
}

/// `capacity + utilization`, capped at `eth_limit` when one is set.
pub fn value_locked(capacity: Value, utilization: Value, eth_limit: Option<Decimal>) -> Option<Value> {
    let total = capacity.checked_add(&utilization)?;
    Some(match eth_limit {
        Some(limit) if limit < total.amount => Value::new(limit, total.currency),
        _ => total,
    })
}

pub struct PoolLedger {
    chains: Arc<ChainRegistry>,
}

impl PoolLedger {
    pub fn new(chains: Arc<ChainRegistry>) -> Self {
        Self { chains }
    }

    fn accounting(pool: &Pool) -> Result<PoolAccounting> {
        pool.accounting().ok_or_else(|| OracleError::UnsupportedPool {
            address: pool.address.clone(),
            reason: format!("version {} without usable accounting", pool.version),
        })
    }

    /// Lendable funds, in the chain's native currency.
    pub async fn capacity(&self, pool: &Pool, cancel: &CancellationToken) -> Result<Value> {
        let ctx = self.chains.get(pool.blockchain)?;
        let currency = pool.blockchain.native_currency();

        let (units, decimals) = match Self::accounting(pool)? {
            PoolAccounting::Native => {
                let wei = chain_query(
                    cancel,
                    format!("native balance of pool {}", pool.address),
                    ctx.client.native_balance(&pool.address),
                )
                .await?;
                (wei, NATIVE_DECIMALS)
            }
            PoolAccounting::Erc20 {
                token,
                fund_source,
                decimals,
            } => {
                let units = chain_query(
                    cancel,
                    format!("token {} balance of {}", token, fund_source),
                    ctx.client.token_balance(&token, &fund_source),
                )
                .await?;
                (units, decimals)
            }
        };

        to_value(&units, decimals, currency, &pool.address)
    }

    /// Outstanding principal of the pool's open loans.
    pub async fn utilization(&self, pool: &Pool, cancel: &CancellationToken) -> Result<Value> {
        let ctx = self.chains.get(pool.blockchain)?;
        let wei = chain_query(
            cancel,
            format!("open principal of pool {}", pool.address),
            ctx.index.open_principal(&pool.address),
        )
        .await?;
        to_value(&wei, NATIVE_DECIMALS, pool.blockchain.native_currency(), &pool.address)
    }

    pub async fn snapshot(&self, pool: &Pool, cancel: &CancellationToken) -> Result<PoolSnapshot> {
        let capacity = self.capacity(pool, cancel).await?;
        let utilization = self.utilization(pool, cancel).await?;
        let value_locked = value_locked(capacity, utilization, pool.eth_limit).ok_or_else(|| {
            OracleError::chain(
                format!("value locked of pool {}", pool.address),
                anyhow!("overflow"),
            )
        })?;

        debug!(
            pool = %pool.address,
            capacity = %capacity,
            utilization = %utilization,
            value_locked = %value_locked,
            "pool snapshot"
        );

        Ok(PoolSnapshot {
            capacity,
            utilization,
            value_locked,
        })
    }
}

fn to_value(units: &BigUint, decimals: u32, currency: crate::value::Currency, pool: &str) -> Result<Value> {
    from_base_units(units, decimals)
        .map(|amount| Value::new(amount, currency))
        .ok_or_else(|| {
            OracleError::chain(
                format!("balance of pool {}", pool),
                anyhow!("{} base units at {} decimals is out of range", units, decimals),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Currency;

    fn eth(n: i64) -> Value {
        Value::new(Decimal::from(n), Currency::Eth)
    }

    #[test]
    fn test_value_locked_caps_at_limit() {
        assert_eq!(value_locked(eth(6), eth(3), None), Some(eth(9)));
        assert_eq!(value_locked(eth(6), eth(3), Some(Decimal::from(8))), Some(eth(8)));
        assert_eq!(value_locked(eth(6), eth(3), Some(Decimal::from(20))), Some(eth(9)));
    }

    #[test]
    fn test_value_locked_rejects_mixed_currency() {
        let matic = Value::new(Decimal::ONE, Currency::Matic);
        assert_eq!(value_locked(eth(1), matic, None), None);
    }

    #[test]
    fn test_to_value_scales_token_units() {
        // 1.5 tokens at 6 decimals
        let v = to_value(&BigUint::from(1_500_000u32), 6, Currency::Eth, "0xp").unwrap();
        assert_eq!(v.amount, Decimal::new(15, 1));
    }
}
