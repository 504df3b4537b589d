//! Attestation signer
//!
//! Produces the signature a router contract checks before lending against an
//! NFT. The message hash always comes from the router itself
//! (`getMessageHash`), so the service and the contract can never disagree on
//! encoding. Attestations expire a fixed number of blocks after issue.

use chrono::{DateTime, Duration, Utc};
use num_bigint::BigUint;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chain::abi::{self, AbiCall, AbiToken};
use crate::chain::{chain_query, ChainRegistry};
use crate::error::{OracleError, Result};
use crate::models::{Attestation, Blockchain, PoolVersion, Valuation};
use crate::signer::{eth_signed_message_hash, SignerRegistry};

pub fn message_hash_call(
    collection_address: &str,
    nft_id: BigUint,
    value_wei: BigUint,
    expires_at_block: u64,
) -> AbiCall {
    AbiCall::new(
        "getMessageHash(address,uint256,uint256,uint256)",
        vec![
            AbiToken::Address(collection_address.to_string()),
            AbiToken::Uint(nft_id),
            AbiToken::Uint(value_wei),
            AbiToken::Uint(BigUint::from(expires_at_block)),
        ],
    )
}

pub struct AttestationSigner {
    chains: Arc<ChainRegistry>,
    signers: SignerRegistry,
    expiry_blocks: u64,
    valuation_limitation: Duration,
}

impl AttestationSigner {
    pub fn new(
        chains: Arc<ChainRegistry>,
        signers: SignerRegistry,
        expiry_blocks: u64,
        valuation_limitation: Duration,
    ) -> Self {
        Self {
            chains,
            signers,
            expiry_blocks,
            valuation_limitation,
        }
    }

    pub async fn sign(
        &self,
        blockchain: Blockchain,
        collection_address: &str,
        nft_id: &str,
        valuation: &Valuation,
        pool_version: PoolVersion,
        cancel: &CancellationToken,
    ) -> Result<Attestation> {
        self.sign_at(
            blockchain,
            collection_address,
            nft_id,
            valuation,
            pool_version,
            Utc::now(),
            cancel,
        )
        .await
    }

    /// `sign` with an explicit clock for the staleness check.
    #[allow(clippy::too_many_arguments)]
    pub async fn sign_at(
        &self,
        blockchain: Blockchain,
        collection_address: &str,
        nft_id: &str,
        valuation: &Valuation,
        pool_version: PoolVersion,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Attestation> {
        // Everything that can fail without I/O goes first.
        valuation.validate_at(now, self.valuation_limitation)?;
        if valuation.value.currency != blockchain.native_currency() {
            return Err(OracleError::InvalidValuation {
                reason: format!(
                    "valuation in {} on a {} chain",
                    valuation.value.currency,
                    blockchain.native_currency()
                ),
            });
        }
        let value_wei = valuation.value.to_wei().ok_or_else(|| OracleError::InvalidValuation {
            reason: format!("{} has no wei form", valuation.value),
        })?;
        let token_id = abi::parse_uint(nft_id).map_err(|_| {
            OracleError::unsupported_collection(collection_address, format!("invalid nft id {:?}", nft_id))
        })?;
        let signer = self.signers.for_pool_version(pool_version)?;
        let ctx = self.chains.get(blockchain)?;
        let router = ctx.router_for(pool_version)?;

        let issued_at_block = chain_query(cancel, "eth_blockNumber", ctx.client.block_number()).await?;
        let expires_at_block = issued_at_block.checked_add(self.expiry_blocks).ok_or_else(|| {
            OracleError::chain(
                "eth_blockNumber",
                anyhow::anyhow!("block {} leaves no room for expiry", issued_at_block),
            )
        })?;

        let call = message_hash_call(collection_address, token_id, value_wei, expires_at_block);
        let raw = chain_query(
            cancel,
            format!("getMessageHash on router {}", router),
            ctx.client.call(router, &call),
        )
        .await?;
        let message_hash = abi::decode_bytes32(&raw)
            .map_err(|e| OracleError::chain(format!("getMessageHash on router {}", router), e))?;

        let digest = eth_signed_message_hash(&message_hash);
        let signature = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OracleError::Cancelled),
            res = signer.sign_digest(digest) => res.map_err(|source| OracleError::SignatureFailure { source })?,
        };

        info!(
            collection = %collection_address,
            nft_id,
            network_id = blockchain.network_id,
            signer = signer.name(),
            issued_at_block,
            expires_at_block,
            "attestation signed"
        );

        Ok(Attestation {
            signature,
            issued_at_block,
            expires_at_block,
        })
    }
}
