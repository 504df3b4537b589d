//! Ethereum JSON-RPC client over reqwest.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use num_bigint::BigUint;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::abi::{self, AbiCall};
use super::ChainClient;

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: Option<i64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorObject>,
}

pub struct JsonRpcChainClient {
    http: Client,
    rpc_url: String,
    next_id: AtomicU64,
}

impl JsonRpcChainClient {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build RPC HTTP client")?;
        Ok(Self::with_client(http, rpc_url))
    }

    pub fn with_client(http: Client, rpc_url: impl Into<String>) -> Self {
        Self {
            http,
            rpc_url: rpc_url.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", method))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("{} returned HTTP {}", method, status));
        }

        let rpc: RpcResponse = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {} response", method))?;

        if let Some(err) = rpc.error {
            return Err(anyhow!(
                "{} RPC error {}: {}",
                method,
                err.code.unwrap_or_default(),
                err.message.unwrap_or_default()
            ));
        }

        rpc.result
            .ok_or_else(|| anyhow!("no result in {} response", method))
    }

    async fn request_quantity(&self, method: &str, params: serde_json::Value) -> Result<BigUint> {
        let result = self.request(method, params).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("{} result is not a string", method))?;
        parse_quantity(raw)
    }
}

/// Parses a hex quantity (`0x1a`). An empty `0x` reads as zero.
fn parse_quantity(raw: &str) -> Result<BigUint> {
    let digits = raw.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(BigUint::from(0u32));
    }
    BigUint::parse_bytes(digits.as_bytes(), 16).ok_or_else(|| anyhow!("bad hex quantity {:?}", raw))
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn block_number(&self) -> Result<u64> {
        let n = self.request_quantity("eth_blockNumber", json!([])).await?;
        u64::try_from(&n).map_err(|_| anyhow!("block number out of range: {}", n))
    }

    async fn call(&self, contract: &str, call: &AbiCall) -> Result<Vec<u8>> {
        let data = call.encode_hex()?;
        let result = self
            .request(
                "eth_call",
                json!([{ "to": contract.trim(), "data": data }, "latest"]),
            )
            .await
            .with_context(|| format!("{} on {}", call.signature, contract))?;

        let raw = result
            .as_str()
            .ok_or_else(|| anyhow!("eth_call result is not a string"))?;
        hex::decode(raw.trim().trim_start_matches("0x")).context("failed to decode eth_call result")
    }

    async fn native_balance(&self, address: &str) -> Result<BigUint> {
        abi::parse_address(address)?;
        self.request_quantity("eth_getBalance", json!([address.trim(), "latest"]))
            .await
    }

    async fn token_balance(&self, token: &str, holder: &str) -> Result<BigUint> {
        let data = self.call(token, &abi::balance_of(holder)).await?;
        if data.is_empty() {
            // Non-contract address: eth_call succeeds with empty data.
            return Err(anyhow!("token {} returned no data for balanceOf", token));
        }
        abi::decode_uint(&data)
    }
}
