//! Remote KMS signer
//!
//! Digests are posted to a signing proxy in front of the KMS key. Requests
//! are authenticated with an HMAC-SHA256 over `timestamp + method + path + body`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE};
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use super::Signer;

type HmacSha256 = Hmac<Sha256>;

const SIGN_PATH: &str = "/v1/sign";

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    key_id: &'a str,
    digest: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

pub struct KmsSigner {
    http: Client,
    base_url: String,
    key_id: String,
    api_secret: String,
}

impl KmsSigner {
    pub fn new(http: Client, base_url: &str, key_id: &str, api_secret: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id: key_id.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    fn sign_request(&self, method: &str, path: &str, body: &str, timestamp: i64) -> Result<String> {
        let message = format!("{}{}{}{}", timestamp, method, path, body);

        // Secrets are issued base64; accept raw strings too.
        let secret = BASE64
            .decode(&self.api_secret)
            .unwrap_or_else(|_| self.api_secret.as_bytes().to_vec());

        let mut mac =
            HmacSha256::new_from_slice(&secret).map_err(|e| anyhow!("HMAC key error: {}", e))?;
        mac.update(message.as_bytes());
        Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
    }
}

/// KMS returns `r || s || v` with v either 0/1 or 27/28; normalise to 27/28.
fn normalize_signature(raw: &str) -> Result<String> {
    let mut bytes = hex::decode(raw.trim().trim_start_matches("0x")).context("kms signature is not hex")?;
    if bytes.len() != 65 {
        return Err(anyhow!("kms signature has {} bytes, expected 65", bytes.len()));
    }
    bytes[64] = match bytes[64] {
        0 | 1 => bytes[64] + 27,
        27 | 28 => bytes[64],
        v => return Err(anyhow!("kms signature has bad recovery byte {}", v)),
    };
    Ok(format!("0x{}", hex::encode(bytes)))
}

#[async_trait]
impl Signer for KmsSigner {
    fn name(&self) -> &str {
        "kms"
    }

    async fn sign_digest(&self, digest: [u8; 32]) -> Result<String> {
        let body = serde_json::to_string(&SignRequest {
            key_id: &self.key_id,
            digest: format!("0x{}", hex::encode(digest)),
        })?;
        let timestamp = Utc::now().timestamp();
        let signature = self.sign_request("POST", SIGN_PATH, &body, timestamp)?;

        debug!(key_id = %self.key_id, "requesting kms signature");
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, SIGN_PATH))
            .header("Content-Type", "application/json")
            .header("X-KMS-TIMESTAMP", timestamp.to_string())
            .header("X-KMS-SIGNATURE", signature)
            .body(body)
            .send()
            .await
            .context("kms sign request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("kms returned {}: {}", status, text));
        }

        let parsed: SignResponse = resp.json().await.context("failed to parse kms response")?;
        normalize_signature(&parsed.signature)
    }
}
