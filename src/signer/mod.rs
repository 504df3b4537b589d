//! Attestation signers
//!
//! v1 pools were deployed against a signer key held by the service; v2 pools
//! verify against a key that only lives in the remote KMS. The registry maps
//! a pool version to its signer once, at startup.

pub mod kms;
pub mod local;

use async_trait::async_trait;
use std::sync::Arc;

use crate::chain::abi::keccak256;
use crate::config::SignerConfig;
use crate::error::{OracleError, Result};
use crate::models::PoolVersion;

pub use kms::KmsSigner;
pub use local::LocalKeySigner;

#[async_trait]
pub trait Signer: Send + Sync {
    fn name(&self) -> &str;

    /// Signs a 32-byte digest as-is. Returns `0x`-prefixed `r || s || v`.
    async fn sign_digest(&self, digest: [u8; 32]) -> anyhow::Result<String>;
}

/// EIP-191 personal-message digest of a 32-byte hash.
pub fn eth_signed_message_hash(hash: &[u8; 32]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(28 + 32);
    buf.extend_from_slice(b"\x19Ethereum Signed Message:\n32");
    buf.extend_from_slice(hash);
    keccak256(&buf)
}

#[derive(Clone, Default)]
pub struct SignerRegistry {
    v1: Option<Arc<dyn Signer>>,
    v2: Option<Arc<dyn Signer>>,
}

impl SignerRegistry {
    pub fn new(v1: Option<Arc<dyn Signer>>, v2: Option<Arc<dyn Signer>>) -> Self {
        Self { v1, v2 }
    }

    /// Builds whatever signers the credentials allow. Missing credentials are
    /// not an error here; they surface when a pool of that version is quoted.
    pub fn from_config(cfg: &SignerConfig, http: reqwest::Client) -> anyhow::Result<Self> {
        let v1: Option<Arc<dyn Signer>> = match cfg.legacy_private_key.as_deref() {
            Some(key) => Some(Arc::new(LocalKeySigner::from_hex(key)?)),
            None => None,
        };
        let v2: Option<Arc<dyn Signer>> =
            match (cfg.kms_url.as_deref(), cfg.kms_key_id.as_deref(), cfg.kms_api_secret.as_deref()) {
                (Some(url), Some(key_id), Some(secret)) => {
                    Some(Arc::new(KmsSigner::new(http, url, key_id, secret)))
                }
                _ => None,
            };
        Ok(Self { v1, v2 })
    }

    pub fn for_pool_version(&self, version: PoolVersion) -> Result<Arc<dyn Signer>> {
        let (slot, credential) = match version {
            PoolVersion::V1 => (&self.v1, "LEGACY_SIGNER_PRIVATE_KEY"),
            PoolVersion::V2 => (&self.v2, "KMS_SIGNER_URL/KMS_KEY_ID/KMS_API_SECRET"),
        };
        slot.clone()
            .ok_or_else(|| OracleError::missing_credential(credential))
    }
}
