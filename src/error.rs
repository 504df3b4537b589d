//! Error taxonomy for valuation, loan terms and attestation.
//!
//! Every variant carries a stable code. Callers outside the crate get the code
//! and a short message; the wrapped cause is only reachable through
//! `std::error::Error::source` for logging.

use rust_decimal::Decimal;

use crate::datasource::DataSourceError;

/// Coarse grouping used when mapping errors onto caller-facing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Client,
    Server,
}

#[derive(Debug)]
pub enum OracleError {
    UnsupportedChain {
        network_id: u64,
    },
    UnsupportedCollection {
        address: String,
        reason: String,
    },
    UnsupportedPool {
        address: String,
        reason: String,
    },
    NoPoolsAvailable {
        collection: String,
    },
    MissingCredential {
        credential: String,
    },
    SourceExhausted {
        label: String,
        attempted: usize,
    },
    InvalidValuation {
        reason: String,
    },
    UtilizationExceeded {
        utilization: Decimal,
        max_borrow: Decimal,
        eth_limit: Decimal,
    },
    ChainQueryFailed {
        context: String,
        source: anyhow::Error,
    },
    StoreUnavailable {
        context: String,
        source: anyhow::Error,
    },
    SignatureFailure {
        source: anyhow::Error,
    },
    Cancelled,
}

impl OracleError {
    pub fn chain(context: impl Into<String>, source: anyhow::Error) -> Self {
        OracleError::ChainQueryFailed {
            context: context.into(),
            source,
        }
    }

    pub fn store(context: impl Into<String>, source: anyhow::Error) -> Self {
        OracleError::StoreUnavailable {
            context: context.into(),
            source,
        }
    }

    pub fn missing_credential(credential: impl Into<String>) -> Self {
        OracleError::MissingCredential {
            credential: credential.into(),
        }
    }

    pub fn unsupported_collection(address: &str, reason: impl Into<String>) -> Self {
        OracleError::UnsupportedCollection {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OracleError::UnsupportedChain { .. } => "ERR_UNSUPPORTED_CHAIN",
            OracleError::UnsupportedCollection { .. } => "ERR_UNSUPPORTED_COLLECTION",
            OracleError::UnsupportedPool { .. } => "ERR_UNSUPPORTED_POOL",
            OracleError::NoPoolsAvailable { .. } => "ERR_NO_POOLS_AVAILABLE",
            OracleError::MissingCredential { .. } => "ERR_MISSING_CREDENTIAL",
            OracleError::SourceExhausted { .. } => "ERR_SOURCE_EXHAUSTED",
            OracleError::InvalidValuation { .. } => "ERR_INVALID_VALUATION",
            OracleError::UtilizationExceeded { .. } => "ERR_UTILIZATION_EXCEEDED",
            OracleError::ChainQueryFailed { .. } => "ERR_CHAIN_QUERY_FAILED",
            OracleError::StoreUnavailable { .. } => "ERR_STORE_UNAVAILABLE",
            OracleError::SignatureFailure { .. } => "ERR_SIGNATURE_FAILURE",
            OracleError::Cancelled => "ERR_CANCELLED",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            OracleError::UnsupportedChain { .. }
            | OracleError::UnsupportedCollection { .. }
            | OracleError::UnsupportedPool { .. }
            | OracleError::NoPoolsAvailable { .. }
            | OracleError::InvalidValuation { .. }
            | OracleError::UtilizationExceeded { .. } => ErrorClass::Client,
            OracleError::MissingCredential { .. }
            | OracleError::SourceExhausted { .. }
            | OracleError::ChainQueryFailed { .. }
            | OracleError::StoreUnavailable { .. }
            | OracleError::SignatureFailure { .. }
            | OracleError::Cancelled => ErrorClass::Server,
        }
    }
}

impl std::fmt::Display for OracleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedChain { network_id } => {
                write!(f, "network {} is not supported", network_id)
            }
            Self::UnsupportedCollection { address, reason } => {
                write!(f, "collection {} is not supported: {}", address, reason)
            }
            Self::UnsupportedPool { address, reason } => {
                write!(f, "pool {} is not supported: {}", address, reason)
            }
            Self::NoPoolsAvailable { collection } => {
                write!(f, "no pools available for collection {}", collection)
            }
            Self::MissingCredential { credential } => {
                write!(f, "missing credential: {}", credential)
            }
            Self::SourceExhausted { label, attempted } => {
                write!(f, "{}: all {} sources exhausted", label, attempted)
            }
            Self::InvalidValuation { reason } => write!(f, "invalid valuation: {}", reason),
            Self::UtilizationExceeded {
                utilization,
                max_borrow,
                eth_limit,
            } => write!(
                f,
                "utilization {} + max borrow {} exceeds pool limit {}",
                utilization.normalize(),
                max_borrow.normalize(),
                eth_limit.normalize()
            ),
            Self::ChainQueryFailed { context, .. } => write!(f, "chain query failed: {}", context),
            Self::StoreUnavailable { context, .. } => write!(f, "store unavailable: {}", context),
            Self::SignatureFailure { .. } => write!(f, "signing failed"),
            Self::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for OracleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ChainQueryFailed { source, .. }
            | Self::StoreUnavailable { source, .. }
            | Self::SignatureFailure { source } => Some(&**source),
            _ => None,
        }
    }
}

impl From<DataSourceError> for OracleError {
    fn from(err: DataSourceError) -> Self {
        match err {
            DataSourceError::Exhausted { label, attempted } => {
                OracleError::SourceExhausted { label, attempted }
            }
            DataSourceError::Cancelled => OracleError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, OracleError>;
