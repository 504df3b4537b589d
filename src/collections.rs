//! Collection lookup
//!
//! Picks which registered collection a token belongs to. A contract address
//! may carry a whole-contract entry (no matcher) and several sub-collections;
//! a token goes to the first sub-collection whose matcher accepts its
//! metadata, else to the whole-contract entry.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chain::chain_query;
use crate::error::{OracleError, Result};
use crate::metadata::{matcher_accepts, MetadataSource};
use crate::models::{Blockchain, Collection};
use crate::store::CollectionStore;

pub struct CollectionLookup {
    store: Arc<dyn CollectionStore>,
    metadata: Arc<dyn MetadataSource>,
}

impl CollectionLookup {
    pub fn new(store: Arc<dyn CollectionStore>, metadata: Arc<dyn MetadataSource>) -> Self {
        Self { store, metadata }
    }

    /// `None` when nothing registered under the address covers the token.
    /// Without an `nft_id` only the whole-contract entry can match.
    pub async fn find(
        &self,
        collection_address: &str,
        blockchain: Blockchain,
        nft_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<Collection>> {
        let variants = self
            .store
            .variants(collection_address, blockchain)
            .await
            .map_err(|e| OracleError::store(format!("collection {}", collection_address), e))?;

        let (subs, mut whole): (Vec<Collection>, Vec<Collection>) =
            variants.into_iter().partition(|c| c.matcher.is_some());
        let default = whole.pop();

        let Some(nft_id) = nft_id else {
            return Ok(default);
        };
        if subs.is_empty() {
            return Ok(default);
        }

        let doc = chain_query(
            cancel,
            format!("metadata of {}#{}", collection_address, nft_id),
            self.metadata.token_metadata(blockchain, collection_address, nft_id),
        )
        .await?;

        for sub in subs {
            let Some(matcher) = sub.matcher.as_ref() else {
                continue;
            };
            let accepted = matcher_accepts(matcher, &doc)
                .map_err(|e| OracleError::unsupported_collection(collection_address, e.to_string()))?;
            if accepted {
                debug!(collection = %collection_address, nft_id, variant = %sub.variant_key(), "sub-collection matched");
                return Ok(Some(sub));
            }
        }
        Ok(default)
    }
}
