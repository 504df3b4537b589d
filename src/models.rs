use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::OracleError;
use crate::value::{Currency, Value, NATIVE_DECIMALS};

/// Chain family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Ethereum,
    Polygon,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Ethereum => "ethereum",
            Network::Polygon => "polygon",
        }
    }

    pub fn native_currency(&self) -> Currency {
        match self {
            Network::Ethereum => Currency::Eth,
            Network::Polygon => Currency::Matic,
        }
    }
}

/// Chain + environment. Passed by value everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blockchain {
    pub network: Network,
    pub network_id: u64,
}

impl Blockchain {
    pub const ETHEREUM_MAINNET: Blockchain = Blockchain {
        network: Network::Ethereum,
        network_id: 1,
    };
    pub const ETHEREUM_SEPOLIA: Blockchain = Blockchain {
        network: Network::Ethereum,
        network_id: 11_155_111,
    };
    pub const POLYGON_MAINNET: Blockchain = Blockchain {
        network: Network::Polygon,
        network_id: 137,
    };
    pub const POLYGON_AMOY: Blockchain = Blockchain {
        network: Network::Polygon,
        network_id: 80_002,
    };

    pub fn from_network_id(network_id: u64) -> Option<Self> {
        [
            Self::ETHEREUM_MAINNET,
            Self::ETHEREUM_SEPOLIA,
            Self::POLYGON_MAINNET,
            Self::POLYGON_AMOY,
        ]
        .into_iter()
        .find(|b| b.network_id == network_id)
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(
            (self.network, self.network_id),
            (Network::Ethereum, 1) | (Network::Polygon, 137)
        )
    }

    pub fn native_currency(&self) -> Currency {
        self.network.native_currency()
    }
}

/// Third-party marketplaces/indexers a collection can be cross-referenced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Reservoir,
    Opensea,
    Nftbank,
}

/// Sub-collection filter: the NFT's metadata field at `field_path` must match `regex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matcher {
    pub regex: String,
    pub field_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub address: String,
    pub blockchain: Blockchain,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vendor_ids: HashMap<Vendor, String>,
    #[serde(default)]
    pub matcher: Option<Matcher>,
}

impl Matcher {
    /// Identity of a sub-collection under its contract address.
    pub fn key(&self) -> String {
        format!("{}#{}", self.field_path.trim(), self.regex)
    }
}

impl Collection {
    /// Empty for the whole-contract collection; sub-collections sharing an
    /// address are told apart by their matcher.
    pub fn variant_key(&self) -> String {
        self.matcher.as_ref().map(Matcher::key).unwrap_or_default()
    }

    pub fn vendor_id(&self, vendor: Vendor) -> Option<&str> {
        self.vendor_ids
            .get(&vendor)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Pool contract generation. Decides capacity accounting and which signer
/// produces attestations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolVersion {
    V1,
    V2,
}

impl PoolVersion {
    pub fn from_u8(version: u8) -> Option<Self> {
        match version {
            1 => Some(PoolVersion::V1),
            2 => Some(PoolVersion::V2),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            PoolVersion::V1 => 1,
            PoolVersion::V2 => 2,
        }
    }
}

/// How a pool's lendable capacity is measured on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolAccounting {
    /// Pool contract holds the native asset itself.
    Native,
    /// Lender's wrapped-native balance, pulled from `fund_source` on borrow.
    Erc20 {
        token: String,
        fund_source: String,
        decimals: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanOption {
    pub interest_bps_per_block: Decimal,
    pub loan_duration_seconds: u64,
    pub max_ltv_bps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub version: u8,
    pub address: String,
    pub collection_address: String,
    pub blockchain: Blockchain,
    #[serde(default)]
    pub lender: Option<String>,
    #[serde(default)]
    pub token_address: Option<String>,
    #[serde(default)]
    pub fund_source: Option<String>,
    #[serde(default)]
    pub token_decimals: Option<u32>,
    #[serde(default)]
    pub eth_limit: Option<Decimal>,
    #[serde(default)]
    pub loan_options: Vec<LoanOption>,
    #[serde(default)]
    pub retired: bool,
}

impl Pool {
    pub fn pool_version(&self) -> Option<PoolVersion> {
        PoolVersion::from_u8(self.version)
    }

    /// The only place the stored version number is turned into accounting.
    /// `None` for unknown versions and for v2 pools missing token/fund source.
    pub fn accounting(&self) -> Option<PoolAccounting> {
        match self.pool_version()? {
            PoolVersion::V1 => Some(PoolAccounting::Native),
            PoolVersion::V2 => {
                let token = non_empty(self.token_address.as_deref())?;
                let fund_source = non_empty(self.fund_source.as_deref())?;
                Some(PoolAccounting::Erc20 {
                    token: token.to_string(),
                    fund_source: fund_source.to_string(),
                    decimals: self.token_decimals.unwrap_or(NATIVE_DECIMALS),
                })
            }
        }
    }

    pub fn is_lendable(&self) -> bool {
        !self.retired && !self.loan_options.is_empty() && self.accounting().is_some()
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    pub value: Value,
    pub value_24hr: Value,
    pub timestamp: DateTime<Utc>,
}

impl Valuation {
    pub fn is_stale_at(&self, now: DateTime<Utc>, limitation: Duration) -> bool {
        now.signed_duration_since(self.timestamp) > limitation
    }

    /// Accepts only non-negative, fresh valuations.
    pub fn validate_at(&self, now: DateTime<Utc>, limitation: Duration) -> Result<(), OracleError> {
        if self.value.is_negative() {
            return Err(OracleError::InvalidValuation {
                reason: format!("negative value {}", self.value),
            });
        }
        if self.is_stale_at(now, limitation) {
            let age = now.signed_duration_since(self.timestamp);
            return Err(OracleError::InvalidValuation {
                reason: format!(
                    "valuation is {}ms old (limit {}ms)",
                    age.num_milliseconds(),
                    limitation.num_milliseconds()
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub signature: String,
    pub issued_at_block: u64,
    pub expires_at_block: u64,
}

impl Attestation {
    /// Mirrors the contract-side check.
    pub fn is_valid_at(&self, block: u64) -> bool {
        block <= self.expires_at_block
    }
}

/// Fee schedule attached to every quoted option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub origination_fee_bps: u32,
    pub protocol_fee_bps: u32,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            origination_fee_bps: 50,
            protocol_fee_bps: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionFees {
    pub origination_fee_bps: u32,
    pub protocol_fee_bps: u32,
    pub origination_fee: Value,
    pub protocol_fee: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanOptionTerms {
    pub interest_bps_per_block: Decimal,
    pub loan_duration_seconds: u64,
    pub max_ltv_bps: u32,
    pub max_borrow: Value,
    pub interest: Value,
    pub fees: OptionFees,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftRef {
    pub collection_address: String,
    pub nft_id: String,
}

/// Quoted borrowing terms for one NFT. Built once, handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    pub router_address: String,
    pub valuation: Valuation,
    pub signature: String,
    pub options: Vec<LoanOptionTerms>,
    pub nft: NftRef,
    pub issued_at_block: u64,
    pub expires_at_block: u64,
    pub pool_address: String,
    pub collection: Collection,
}
