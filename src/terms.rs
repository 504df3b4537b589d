//! Loan terms calculator
//!
//! Collection check, pool selection, valuation, utilization cap, attestation.
//! Any failure aborts the whole computation; callers never see partial terms.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::attestation::AttestationSigner;
use crate::chain::{abi, ChainRegistry};
use crate::collections::CollectionLookup;
use crate::config::OracleConfig;
use crate::error::{OracleError, Result};
use crate::ledger::PoolLedger;
use crate::models::{
    Blockchain, Collection, FeeSchedule, LoanOption, LoanOptionTerms, LoanTerms, NftRef,
    OptionFees, Pool,
};
use crate::resolver::ValuationResolver;
use crate::store::{normalize_address, PoolStore};
use crate::value::{floor_div, Value, BPS_DENOMINATOR};

#[derive(Debug, Clone)]
pub struct TermsSettings {
    pub seconds_per_block: u64,
    pub fees: FeeSchedule,
    pub valuation_limitation: Duration,
}

impl Default for TermsSettings {
    fn default() -> Self {
        Self {
            seconds_per_block: 12,
            fees: FeeSchedule::default(),
            valuation_limitation: Duration::seconds(1800),
        }
    }
}

impl TermsSettings {
    pub fn from_config(cfg: &OracleConfig) -> Self {
        Self {
            seconds_per_block: cfg.seconds_per_block,
            fees: cfg.fees.clone(),
            valuation_limitation: cfg.valuation_limitation(),
        }
    }
}

/// Lendable pools only, narrowed to `hint` when given, newest version first.
/// Ties keep store order.
pub fn select_pool(pools: Vec<Pool>, hint: Option<&str>) -> Option<Pool> {
    let hint = hint.map(normalize_address);
    let mut candidates: Vec<Pool> = pools
        .into_iter()
        .filter(Pool::is_lendable)
        .filter(|p| {
            hint.as_deref()
                .map_or(true, |h| normalize_address(&p.address) == h)
        })
        .collect();
    candidates.sort_by(|a, b| b.version.cmp(&a.version));
    candidates.into_iter().next()
}

/// Derives borrow amount, fees and interest for one option.
pub fn option_terms(
    option: &LoanOption,
    valuation: Value,
    fees: &FeeSchedule,
    seconds_per_block: u64,
) -> Option<LoanOptionTerms> {
    let max_borrow = valuation.mul_bps(option.max_ltv_bps)?;
    let blocks = option.loan_duration_seconds / seconds_per_block.max(1);
    let interest_raw = max_borrow
        .amount
        .checked_mul(option.interest_bps_per_block)?
        .checked_mul(Decimal::from(blocks))?;
    let interest = Value::new(
        floor_div(interest_raw, Decimal::from(BPS_DENOMINATOR))?,
        valuation.currency,
    );

    Some(LoanOptionTerms {
        interest_bps_per_block: option.interest_bps_per_block,
        loan_duration_seconds: option.loan_duration_seconds,
        max_ltv_bps: option.max_ltv_bps,
        fees: OptionFees {
            origination_fee_bps: fees.origination_fee_bps,
            protocol_fee_bps: fees.protocol_fee_bps,
            origination_fee: max_borrow.mul_bps(fees.origination_fee_bps)?,
            protocol_fee: max_borrow.mul_bps(fees.protocol_fee_bps)?,
        },
        max_borrow,
        interest,
    })
}

/// Fails when any option would push the pool past its lender cap.
pub fn check_utilization(
    utilization: Value,
    options: &[LoanOptionTerms],
    eth_limit: Option<Decimal>,
) -> Result<()> {
    let Some(limit) = eth_limit else {
        return Ok(());
    };
    for option in options {
        let after = utilization.checked_add(&option.max_borrow);
        if after.map_or(true, |v| v.amount > limit) {
            return Err(OracleError::UtilizationExceeded {
                utilization: utilization.amount,
                max_borrow: option.max_borrow.amount,
                eth_limit: limit,
            });
        }
    }
    Ok(())
}

pub struct LoanTermsCalculator {
    collections: Arc<CollectionLookup>,
    pools: Arc<dyn PoolStore>,
    chains: Arc<ChainRegistry>,
    resolver: Arc<ValuationResolver>,
    ledger: Arc<PoolLedger>,
    attestations: Arc<AttestationSigner>,
    settings: TermsSettings,
}

impl LoanTermsCalculator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collections: Arc<CollectionLookup>,
        pools: Arc<dyn PoolStore>,
        chains: Arc<ChainRegistry>,
        resolver: Arc<ValuationResolver>,
        ledger: Arc<PoolLedger>,
        attestations: Arc<AttestationSigner>,
        settings: TermsSettings,
    ) -> Self {
        Self {
            collections,
            pools,
            chains,
            resolver,
            ledger,
            attestations,
            settings,
        }
    }

    pub async fn compute_loan_terms(
        &self,
        blockchain: Blockchain,
        collection_address: &str,
        nft_id: &str,
        cancel: &CancellationToken,
    ) -> Result<LoanTerms> {
        self.compute_loan_terms_in_pool(blockchain, collection_address, nft_id, None, cancel)
            .await
    }

    /// Same as `compute_loan_terms`, restricted to one pool when `pool_hint`
    /// is set.
    pub async fn compute_loan_terms_in_pool(
        &self,
        blockchain: Blockchain,
        collection_address: &str,
        nft_id: &str,
        pool_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LoanTerms> {
        let collection = self
            .supported_collection(blockchain, collection_address, nft_id, cancel)
            .await?;

        let pools = self
            .pools
            .find_by_collection(collection_address, blockchain)
            .await
            .map_err(|e| OracleError::store(format!("pools of {}", collection_address), e))?;
        let pool = select_pool(pools, pool_hint).ok_or_else(|| OracleError::NoPoolsAvailable {
            collection: collection_address.to_string(),
        })?;
        let version = pool.pool_version().ok_or_else(|| OracleError::UnsupportedPool {
            address: pool.address.clone(),
            reason: format!("unknown version {}", pool.version),
        })?;
        let router_address = self.chains.get(blockchain)?.router_for(version)?.to_string();
        debug!(pool = %pool.address, version = pool.version, "pool selected");

        let valuation = self
            .resolver
            .resolve_collection(blockchain, &collection, Some(nft_id), cancel)
            .await?;
        valuation.validate_at(Utc::now(), self.settings.valuation_limitation)?;

        let utilization = self.ledger.utilization(&pool, cancel).await?;

        let options = pool
            .loan_options
            .iter()
            .map(|option| {
                option_terms(
                    option,
                    valuation.value,
                    &self.settings.fees,
                    self.settings.seconds_per_block,
                )
                .ok_or_else(|| OracleError::InvalidValuation {
                    reason: format!("loan terms overflow for {}", valuation.value),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        check_utilization(utilization, &options, pool.eth_limit)?;

        let attestation = self
            .attestations
            .sign(
                blockchain,
                collection_address,
                nft_id,
                &valuation,
                version,
                cancel,
            )
            .await?;

        info!(
            collection = %collection_address,
            nft_id,
            pool = %pool.address,
            value = %valuation.value,
            options = options.len(),
            expires_at_block = attestation.expires_at_block,
            "loan terms computed"
        );

        Ok(LoanTerms {
            router_address,
            valuation,
            signature: attestation.signature,
            options,
            nft: NftRef {
                collection_address: collection_address.to_string(),
                nft_id: nft_id.to_string(),
            },
            issued_at_block: attestation.issued_at_block,
            expires_at_block: attestation.expires_at_block,
            pool_address: pool.address,
            collection,
        })
    }

    /// The token's collection: a sub-collection whose matcher accepts its
    /// metadata, else the whole-contract entry.
    async fn supported_collection(
        &self,
        blockchain: Blockchain,
        collection_address: &str,
        nft_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Collection> {
        if abi::parse_uint(nft_id).is_err() {
            return Err(OracleError::unsupported_collection(
                collection_address,
                format!("invalid nft id {:?}", nft_id),
            ));
        }

        self.collections
            .find(collection_address, blockchain, Some(nft_id), cancel)
            .await?
            .ok_or_else(|| {
                OracleError::unsupported_collection(
                    collection_address,
                    format!("token {} is not in a registered collection", nft_id),
                )
            })
    }
}
