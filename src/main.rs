//! valuation-server
//!
//! Serves collateral valuations, loan terms and signed attestations for the
//! networks listed in the oracle config.

use anyhow::{Context, Result};
use axum::{middleware, Router};
use clap::Parser;
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, time::interval};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nft_valuation::{
    api::{self, AppState},
    attestation::AttestationSigner,
    cache::MemoryCache,
    chain::{rpc::JsonRpcChainClient, subgraph::SubgraphIndex, ChainContext, ChainRegistry, Routers},
    collections::CollectionLookup,
    config::OracleConfig,
    ledger::PoolLedger,
    metadata::TokenUriMetadata,
    middleware::request_logging,
    providers::{oracle::CoinGeckoOracle, ProviderRegistry},
    resolver::{ResolverSettings, ValuationResolver},
    signer::SignerRegistry,
    store::sqlite::SqliteStore,
    terms::{LoanTermsCalculator, TermsSettings},
};

const CACHE_PURGE_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "valuation-server")]
#[command(about = "NFT collateral valuation and loan-terms attestation service")]
struct Args {
    /// Oracle config (TOML)
    #[arg(long, env = "ORACLE_CONFIG_PATH", default_value = "oracle.toml")]
    config: String,

    /// SQLite database with collections and pools
    #[arg(long)]
    db_path: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut config = OracleConfig::load_or_default(&args.config);
    if let Some(db_path) = args.db_path {
        config.server.db_path = db_path;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!("🚀 Valuation server starting");
    info!(
        "⚙️ Config: {} networks, valuation limit {}s, expiry {} blocks",
        config.networks.len(),
        config.valuation_limitation_secs,
        config.eth_valuation_expiry_blocks
    );

    let http_client = reqwest::Client::builder()
        .timeout(config.provider_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    let chains = Arc::new(build_chains(&config)?);
    if chains.network_ids().is_empty() {
        warn!("No networks configured; every request will be rejected as unsupported");
    }

    let store = Arc::new(SqliteStore::new(&config.server.db_path)?);
    info!("📊 Database initialized at: {}", config.server.db_path);

    let cache = Arc::new(MemoryCache::new());
    tokio::spawn(cache_purging(cache.clone()));

    let oracle = Arc::new(CoinGeckoOracle::new(
        http_client.clone(),
        config.providers.coingecko_base_url.clone(),
        config.providers.coingecko_api_key.clone(),
    ));
    let providers = Arc::new(ProviderRegistry::from_config(
        &config.providers,
        oracle,
        config.provider_timeout(),
    )?);

    let signers = SignerRegistry::from_config(&config.signer, http_client.clone())
        .context("Failed to load signing credentials")?;
    let attestations = Arc::new(AttestationSigner::new(
        chains.clone(),
        signers,
        config.eth_valuation_expiry_blocks,
        config.valuation_limitation(),
    ));

    let metadata = Arc::new(TokenUriMetadata::new(
        chains.clone(),
        config.providers.ipfs_gateway.clone(),
        config.provider_timeout(),
    )?);
    let collections = Arc::new(CollectionLookup::new(store.clone(), metadata));

    let resolver = Arc::new(ValuationResolver::new(
        collections.clone(),
        providers,
        cache,
        ResolverSettings::from_config(&config),
    ));

    let calculator = Arc::new(LoanTermsCalculator::new(
        collections,
        store,
        chains.clone(),
        resolver.clone(),
        Arc::new(PoolLedger::new(chains.clone())),
        attestations.clone(),
        TermsSettings::from_config(&config),
    ));

    let state = AppState {
        resolver,
        calculator,
        attestations,
        request_timeout: config.request_timeout(),
        network_ids: chains.network_ids(),
    };

    let app = Router::new()
        .merge(api::router(state))
        .layer(middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

fn build_chains(config: &OracleConfig) -> Result<ChainRegistry> {
    let timeout = config.provider_timeout();
    let mut chains = ChainRegistry::new();
    for net in &config.networks {
        let client = JsonRpcChainClient::new(net.rpc_url.clone(), timeout)
            .with_context(|| format!("RPC client for network {}", net.network_id))?;
        let index = SubgraphIndex::new(net.subgraph_url.clone(), timeout)
            .with_context(|| format!("Subgraph client for network {}", net.network_id))?;

        chains.insert(ChainContext {
            blockchain: net.blockchain(),
            client: Arc::new(client),
            index: Arc::new(index),
            routers: Routers {
                v1: net.router_v1.clone(),
                v2: net.router_v2.clone(),
            },
        });
        info!("⛓️ Network {} ({:?}) registered", net.network_id, net.network);
    }
    Ok(chains)
}

async fn cache_purging(cache: Arc<MemoryCache>) {
    let mut ticker = interval(Duration::from_secs(CACHE_PURGE_SECS));
    loop {
        ticker.tick().await;
        let purged = cache.purge_expired();
        if purged > 0 {
            debug!(purged, "expired valuations purged");
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nft_valuation=debug,valuation_server=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Crate-root .env when launched from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
