//! Service configuration
//!
//! Tunables and network endpoints come from a TOML file; credentials are
//! overlaid from the environment and never written back.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::models::{Blockchain, FeeSchedule, Network};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Oldest valuation we will sign against (seconds)
    #[serde(default = "default_valuation_limitation_secs")]
    pub valuation_limitation_secs: u64,

    /// Attestation lifetime in blocks
    #[serde(default = "default_expiry_blocks")]
    pub eth_valuation_expiry_blocks: u64,

    #[serde(default = "default_collection_ttl")]
    pub collection_cache_ttl_secs: u64,

    #[serde(default = "default_token_ttl")]
    pub token_cache_ttl_secs: u64,

    /// Per-provider deadline inside the fallback chain
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,

    /// Whole-request deadline; cancels every in-flight call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_seconds_per_block")]
    pub seconds_per_block: u64,

    #[serde(default)]
    pub fees: FeeSchedule,

    #[serde(default)]
    pub networks: Vec<NetworkConfig>,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub signer: SignerConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

fn default_valuation_limitation_secs() -> u64 {
    1800
}
fn default_expiry_blocks() -> u64 {
    64
}
fn default_collection_ttl() -> u64 {
    600
}
fn default_token_ttl() -> u64 {
    900
}
fn default_provider_timeout_ms() -> u64 {
    8_000
}
fn default_request_timeout_ms() -> u64 {
    25_000
}
fn default_seconds_per_block() -> u64 {
    12
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            valuation_limitation_secs: default_valuation_limitation_secs(),
            eth_valuation_expiry_blocks: default_expiry_blocks(),
            collection_cache_ttl_secs: default_collection_ttl(),
            token_cache_ttl_secs: default_token_ttl(),
            provider_timeout_ms: default_provider_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            seconds_per_block: default_seconds_per_block(),
            fees: FeeSchedule::default(),
            networks: Vec::new(),
            providers: ProvidersConfig::default(),
            signer: SignerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl OracleConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// File at `ORACLE_CONFIG_PATH` (or `oracle.toml`), then env secrets.
    pub fn from_env() -> Self {
        let path =
            std::env::var("ORACLE_CONFIG_PATH").unwrap_or_else(|_| "oracle.toml".to_string());
        Self::load_or_default(&path)
    }

    pub fn load_or_default(path: &str) -> Self {
        let mut config = Self::load(path).unwrap_or_else(|e| {
            tracing::debug!("Using default oracle config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env(|key| std::env::var(key).ok());
        for warning in config.clamp_cache_ttls() {
            tracing::warn!("{}", warning);
        }
        config
    }

    /// A cached valuation must still be signable when served, so neither
    /// cache TTL may outlive the valuation limitation. Returns one message
    /// per clamped TTL.
    pub fn clamp_cache_ttls(&mut self) -> Vec<String> {
        let limit = self.valuation_limitation_secs;
        let mut warnings = Vec::new();
        for (name, ttl) in [
            ("collection_cache_ttl_secs", &mut self.collection_cache_ttl_secs),
            ("token_cache_ttl_secs", &mut self.token_cache_ttl_secs),
        ] {
            if *ttl > limit {
                warnings.push(format!(
                    "{} = {} exceeds valuation_limitation_secs = {}; clamped",
                    name, ttl, limit
                ));
                *ttl = limit;
            }
        }
        warnings
    }

    /// Overlays secrets and server settings. `lookup` is `std::env::var` in
    /// production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RESERVOIR_API_KEY") {
            self.providers.reservoir_api_key = Some(v);
        }
        if let Some(v) = get("OPENSEA_API_KEY") {
            self.providers.opensea_api_key = Some(v);
        }
        if let Some(v) = get("NFTBANK_API_KEY") {
            self.providers.nftbank_api_key = Some(v);
        }
        if let Some(v) = get("COINGECKO_API_KEY") {
            self.providers.coingecko_api_key = Some(v);
        }
        if let Some(v) = get("LEGACY_SIGNER_PRIVATE_KEY") {
            self.signer.legacy_private_key = Some(v);
        }
        if let Some(v) = get("KMS_SIGNER_URL") {
            self.signer.kms_url = Some(v);
        }
        if let Some(v) = get("KMS_KEY_ID") {
            self.signer.kms_key_id = Some(v);
        }
        if let Some(v) = get("KMS_API_SECRET") {
            self.signer.kms_api_secret = Some(v);
        }
        if let Some(port) = get("PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(v) = get("DB_PATH") {
            self.server.db_path = v;
        }
    }

    pub fn valuation_limitation(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.valuation_limitation_secs as i64)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One chain the service quotes on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network: Network,
    pub network_id: u64,
    pub rpc_url: String,
    pub subgraph_url: String,
    #[serde(default)]
    pub router_v1: Option<String>,
    #[serde(default)]
    pub router_v2: Option<String>,
}

impl NetworkConfig {
    pub fn blockchain(&self) -> Blockchain {
        Blockchain {
            network: self.network,
            network_id: self.network_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_reservoir_eth")]
    pub reservoir_ethereum_url: String,
    #[serde(default = "default_reservoir_polygon")]
    pub reservoir_polygon_url: String,
    #[serde(default = "default_opensea")]
    pub opensea_base_url: String,
    #[serde(default = "default_nftbank")]
    pub nftbank_base_url: String,
    #[serde(default = "default_coingecko")]
    pub coingecko_base_url: String,
    #[serde(default = "default_ipfs_gateway")]
    pub ipfs_gateway: String,

    #[serde(skip_serializing, default)]
    pub reservoir_api_key: Option<String>,
    #[serde(skip_serializing, default)]
    pub opensea_api_key: Option<String>,
    #[serde(skip_serializing, default)]
    pub nftbank_api_key: Option<String>,
    #[serde(skip_serializing, default)]
    pub coingecko_api_key: Option<String>,
}

fn default_reservoir_eth() -> String {
    "https://api.reservoir.tools".to_string()
}
fn default_reservoir_polygon() -> String {
    "https://api-polygon.reservoir.tools".to_string()
}
fn default_opensea() -> String {
    "https://api.opensea.io".to_string()
}
fn default_nftbank() -> String {
    "https://api.nftbank.run".to_string()
}
fn default_coingecko() -> String {
    "https://api.coingecko.com".to_string()
}
fn default_ipfs_gateway() -> String {
    "https://ipfs.io/ipfs/".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            reservoir_ethereum_url: default_reservoir_eth(),
            reservoir_polygon_url: default_reservoir_polygon(),
            opensea_base_url: default_opensea(),
            nftbank_base_url: default_nftbank(),
            coingecko_base_url: default_coingecko(),
            ipfs_gateway: default_ipfs_gateway(),
            reservoir_api_key: None,
            opensea_api_key: None,
            nftbank_api_key: None,
            coingecko_api_key: None,
        }
    }
}

impl ProvidersConfig {
    pub fn reservoir_base_url(&self, network: Network) -> String {
        match network {
            Network::Ethereum => self.reservoir_ethereum_url.clone(),
            Network::Polygon => self.reservoir_polygon_url.clone(),
        }
    }
}

/// Signing credentials. Env only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerConfig {
    #[serde(skip_serializing, default)]
    pub legacy_private_key: Option<String>,
    #[serde(default)]
    pub kms_url: Option<String>,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(skip_serializing, default)]
    pub kms_api_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_port() -> u16 {
    3000
}
fn default_db_path() -> String {
    "nft_valuation.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}
