//! secp256k1 signer backed by an in-process private key.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;

use super::Signer;
use crate::chain::abi::keccak256;

pub struct LocalKeySigner {
    key: SigningKey,
    address: String,
}

impl LocalKeySigner {
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let raw = private_key.trim().trim_start_matches("0x");
        let bytes = hex::decode(raw).context("signer key is not hex")?;
        let key = SigningKey::from_slice(&bytes).map_err(|_| anyhow!("invalid secp256k1 private key"))?;
        let address = address_of(&key);
        Ok(Self { key, address })
    }

    /// Checksum-free lowercase `0x` address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

fn address_of(key: &SigningKey) -> String {
    let point = key.verifying_key().to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

#[async_trait]
impl Signer for LocalKeySigner {
    fn name(&self) -> &str {
        "local"
    }

    async fn sign_digest(&self, digest: [u8; 32]) -> Result<String> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| anyhow!("secp256k1 signing failed: {}", e))?;

        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&signature.to_bytes());
        out.push(recovery_id.to_byte() + 27);
        Ok(format!("0x{}", hex::encode(out)))
    }
}
