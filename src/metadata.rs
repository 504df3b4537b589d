//! NFT metadata lookup for sub-collection matchers.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{abi, ChainRegistry};
use crate::models::{Blockchain, Matcher};

#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn token_metadata(
        &self,
        blockchain: Blockchain,
        collection_address: &str,
        nft_id: &str,
    ) -> Result<serde_json::Value>;
}

/// Reads `tokenURI(id)` on chain and fetches the JSON it points at.
pub struct TokenUriMetadata {
    chains: Arc<ChainRegistry>,
    http: Client,
    ipfs_gateway: String,
}

impl TokenUriMetadata {
    pub fn new(chains: Arc<ChainRegistry>, ipfs_gateway: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build metadata HTTP client")?;
        Ok(Self {
            chains,
            http,
            ipfs_gateway: ipfs_gateway.into(),
        })
    }
}

/// Where a token URI can be read from.
#[derive(Debug, PartialEq, Eq)]
enum UriTarget {
    Http(String),
    Inline(Vec<u8>),
}

fn resolve_uri(uri: &str, gateway: &str) -> Result<UriTarget> {
    let uri = uri.trim();
    if let Some(payload) = uri.strip_prefix("data:application/json;base64,") {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .context("bad base64 token uri")?;
        return Ok(UriTarget::Inline(bytes));
    }
    if let Some(payload) = uri.strip_prefix("data:application/json,") {
        return Ok(UriTarget::Inline(payload.as_bytes().to_vec()));
    }
    if let Some(path) = uri.strip_prefix("ipfs://") {
        let path = path.trim_start_matches("ipfs/");
        return Ok(UriTarget::Http(format!(
            "{}/{}",
            gateway.trim_end_matches('/'),
            path
        )));
    }
    if uri.starts_with("https://") || uri.starts_with("http://") {
        return Ok(UriTarget::Http(uri.to_string()));
    }
    Err(anyhow!("unsupported token uri scheme: {}", uri))
}

#[async_trait]
impl MetadataSource for TokenUriMetadata {
    async fn token_metadata(
        &self,
        blockchain: Blockchain,
        collection_address: &str,
        nft_id: &str,
    ) -> Result<serde_json::Value> {
        let ctx = self.chains.get(blockchain)?;
        let id = abi::parse_uint(nft_id)?;
        let raw = ctx.client.call(collection_address, &abi::token_uri(id)).await?;
        let uri = abi::decode_string(&raw)?;

        match resolve_uri(&uri, &self.ipfs_gateway)? {
            UriTarget::Inline(bytes) => {
                serde_json::from_slice(&bytes).context("inline token metadata is not json")
            }
            UriTarget::Http(url) => {
                let resp = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("GET {} failed", url))?;
                if !resp.status().is_success() {
                    return Err(anyhow!("GET {} returned {}", url, resp.status()));
                }
                resp.json().await.context("token metadata is not json")
            }
        }
    }
}

/// Walks a dotted path; numeric segments index into arrays.
pub fn field_at_path<'a>(doc: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .try_fold(doc, |node, segment| match node {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// True when the field exists and its scalar text matches the regex.
pub fn matcher_accepts(matcher: &Matcher, doc: &serde_json::Value) -> Result<bool> {
    let re = Regex::new(&matcher.regex)
        .with_context(|| format!("invalid matcher regex {:?}", matcher.regex))?;
    let text = match field_at_path(doc, &matcher.field_path) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Bool(b)) => b.to_string(),
        _ => return Ok(false),
    };
    Ok(re.is_match(&text))
}
