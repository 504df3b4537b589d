//! End-to-end loan terms flow over in-process fakes.
//!
//! Run with: cargo test --test loan_terms_flow

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use num_bigint::BigUint;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use axum::extract::State;
use axum::Json;
use nft_valuation::api::{post_attestation, AppState, AttestationRequest};
use nft_valuation::attestation::AttestationSigner;
use nft_valuation::cache::MemoryCache;
use nft_valuation::chain::abi::{keccak256, AbiCall};
use nft_valuation::chain::{ChainClient, ChainContext, ChainIndex, ChainRegistry, Routers};
use nft_valuation::collections::CollectionLookup;
use nft_valuation::error::OracleError;
use nft_valuation::ledger::PoolLedger;
use nft_valuation::metadata::MetadataSource;
use nft_valuation::models::{
    Blockchain, Collection, LoanOption, Matcher, Pool, PoolVersion, Valuation, Vendor,
};
use nft_valuation::providers::{
    PriceProvider, ProviderKind, ProviderQuote, ProviderRegistry, QuoteRequest,
};
use nft_valuation::resolver::{ResolverSettings, ValuationResolver};
use nft_valuation::signer::{Signer, SignerRegistry};
use nft_valuation::store::MemoryStore;
use nft_valuation::terms::{LoanTermsCalculator, TermsSettings};
use nft_valuation::value::{Currency, Value};

const COLLECTION: &str = "0xAaAaAaAaAaAaAaAaAaAaAaAaAaAaAaAaAaAaAaAa";
const NFT_ID: &str = "42";
const ROUTER_V1: &str = "0x1111111111111111111111111111111111111111";
const ROUTER_V2: &str = "0x2222222222222222222222222222222222222222";
const HEAD_BLOCK: u64 = 19_000_000;

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn wei(eth: u64) -> BigUint {
    BigUint::from(eth) * BigUint::from(10u64).pow(18)
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeChain {
    native: HashMap<String, BigUint>,
    tokens: HashMap<(String, String), BigUint>,
    log: Mutex<Vec<String>>,
}

impl FakeChain {
    fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn block_number(&self) -> anyhow::Result<u64> {
        self.log.lock().push("eth_blockNumber".into());
        Ok(HEAD_BLOCK)
    }

    async fn call(&self, contract: &str, call: &AbiCall) -> anyhow::Result<Vec<u8>> {
        self.log.lock().push(format!("eth_call {} {}", contract, call.signature));
        Ok(keccak256(&call.encode()?).to_vec())
    }

    async fn native_balance(&self, address: &str) -> anyhow::Result<BigUint> {
        self.log.lock().push(format!("eth_getBalance {}", address));
        Ok(self.native.get(address).cloned().unwrap_or_default())
    }

    async fn token_balance(&self, token: &str, holder: &str) -> anyhow::Result<BigUint> {
        self.log.lock().push(format!("balanceOf {} {}", token, holder));
        Ok(self
            .tokens
            .get(&(token.to_string(), holder.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
struct FakeIndex {
    principal: HashMap<String, BigUint>,
}

#[async_trait]
impl ChainIndex for FakeIndex {
    async fn open_principal(&self, pool_address: &str) -> anyhow::Result<BigUint> {
        Ok(self.principal.get(pool_address).cloned().unwrap_or_default())
    }
}

struct Scripted {
    kind: ProviderKind,
    quote: Option<ProviderQuote>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(kind: ProviderKind, quote: Option<ProviderQuote>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            quote,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceProvider for Scripted {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn quote(&self, _req: &QuoteRequest<'_>) -> anyhow::Result<ProviderQuote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.quote.clone().ok_or_else(|| anyhow::anyhow!("upstream 503"))
    }
}

struct FakeSigner {
    name: &'static str,
}

#[async_trait]
impl Signer for FakeSigner {
    fn name(&self) -> &str {
        self.name
    }

    async fn sign_digest(&self, digest: [u8; 32]) -> anyhow::Result<String> {
        Ok(format!("0x{}{}", self.name, hex::encode(digest)))
    }
}

struct FakeMetadata {
    background: &'static str,
}

#[async_trait]
impl MetadataSource for FakeMetadata {
    async fn token_metadata(
        &self,
        _blockchain: Blockchain,
        _collection_address: &str,
        _nft_id: &str,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({
            "attributes": [{ "trait_type": "Background", "value": self.background }]
        }))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    chain: Arc<FakeChain>,
    providers: Vec<Arc<Scripted>>,
    store: Arc<MemoryStore>,
    ledger: Arc<PoolLedger>,
    attestations: Arc<AttestationSigner>,
    resolver: Arc<ValuationResolver>,
    calculator: Arc<LoanTermsCalculator>,
    network_ids: Vec<u64>,
}

impl Harness {
    fn app(&self) -> AppState {
        AppState {
            resolver: self.resolver.clone(),
            calculator: self.calculator.clone(),
            attestations: self.attestations.clone(),
            request_timeout: Duration::from_secs(5),
            network_ids: self.network_ids.clone(),
        }
    }
}

struct Setup {
    blockchain: Blockchain,
    quotes: Vec<Option<ProviderQuote>>,
    chain: FakeChain,
    index: FakeIndex,
    signers: SignerRegistry,
    matcher: Option<Matcher>,
    background: &'static str,
}

impl Setup {
    fn new(blockchain: Blockchain) -> Self {
        let currency = blockchain.native_currency();
        Self {
            blockchain,
            quotes: vec![Some(ProviderQuote::new(
                ProviderKind::Reservoir,
                Some(dec("2.5")),
                Some(dec("3.0")),
                currency,
            ))],
            chain: FakeChain::default(),
            index: FakeIndex::default(),
            signers: SignerRegistry::new(
                Some(Arc::new(FakeSigner { name: "a1" })),
                Some(Arc::new(FakeSigner { name: "b2" })),
            ),
            matcher: None,
            background: "Gold",
        }
    }

    fn build(self) -> Harness {
        let blockchain = self.blockchain;
        let chain = Arc::new(self.chain);
        let chains = Arc::new(ChainRegistry::new().with(ChainContext {
            blockchain,
            client: chain.clone(),
            index: Arc::new(self.index),
            routers: Routers {
                v1: Some(ROUTER_V1.to_string()),
                v2: Some(ROUTER_V2.to_string()),
            },
        }));

        let kinds = [
            ProviderKind::Reservoir,
            ProviderKind::Opensea,
            ProviderKind::Nftbank,
            ProviderKind::PolygonBridge,
        ];
        let providers: Vec<Arc<Scripted>> = self
            .quotes
            .into_iter()
            .zip(kinds)
            .map(|(quote, kind)| Scripted::new(kind, quote))
            .collect();
        let mut registry = ProviderRegistry::new();
        for p in &providers {
            registry.register(blockchain, p.clone());
        }

        let store = Arc::new(MemoryStore::new());
        let mut vendor_ids = HashMap::new();
        vendor_ids.insert(Vendor::Opensea, "aaa-club".to_string());
        store.upsert_collection(Collection {
            address: COLLECTION.to_string(),
            blockchain,
            name: Some("AAA Club".into()),
            vendor_ids,
            matcher: self.matcher,
        });

        let collections = Arc::new(CollectionLookup::new(
            store.clone(),
            Arc::new(FakeMetadata {
                background: self.background,
            }),
        ));
        let resolver = Arc::new(ValuationResolver::new(
            collections.clone(),
            Arc::new(registry),
            Arc::new(MemoryCache::new()),
            ResolverSettings::default(),
        ));
        let ledger = Arc::new(PoolLedger::new(chains.clone()));
        let attestations = Arc::new(AttestationSigner::new(
            chains.clone(),
            self.signers,
            64,
            ChronoDuration::seconds(1800),
        ));
        let network_ids = chains.network_ids();
        let calculator = Arc::new(LoanTermsCalculator::new(
            collections,
            store.clone(),
            chains,
            resolver.clone(),
            ledger.clone(),
            attestations.clone(),
            TermsSettings::default(),
        ));

        Harness {
            chain,
            providers,
            store,
            ledger,
            attestations,
            resolver,
            calculator,
            network_ids,
        }
    }
}

fn option(ltv_bps: u32) -> LoanOption {
    LoanOption {
        interest_bps_per_block: dec("0.0001"),
        loan_duration_seconds: 86_400,
        max_ltv_bps: ltv_bps,
    }
}

fn v1_pool(address: &str, blockchain: Blockchain, options: Vec<LoanOption>) -> Pool {
    Pool {
        version: 1,
        address: address.to_string(),
        collection_address: COLLECTION.to_string(),
        blockchain,
        lender: Some("0xlender".into()),
        token_address: None,
        fund_source: None,
        token_decimals: None,
        eth_limit: Some(Decimal::from(10)),
        loan_options: options,
        retired: false,
    }
}

fn v2_pool(address: &str, blockchain: Blockchain, options: Vec<LoanOption>) -> Pool {
    Pool {
        version: 2,
        token_address: Some("0xweth".into()),
        fund_source: Some("0xlender".into()),
        ..v1_pool(address, blockchain, options)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_loan_terms_end_to_end_and_cached_valuation() {
    let h = Setup::new(Blockchain::ETHEREUM_MAINNET).build();
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));
    let cancel = CancellationToken::new();

    let terms = h
        .calculator
        .compute_loan_terms(Blockchain::ETHEREUM_MAINNET, COLLECTION, NFT_ID, &cancel)
        .await
        .unwrap();

    assert_eq!(terms.valuation.value, Value::new(dec("2.5"), Currency::Eth));
    assert_eq!(terms.valuation.value_24hr, Value::new(dec("3.0"), Currency::Eth));
    assert_eq!(terms.router_address, ROUTER_V1);
    assert_eq!(terms.pool_address, "0xpool1");
    assert_eq!(terms.nft.nft_id, NFT_ID);
    assert_eq!(terms.issued_at_block, HEAD_BLOCK);
    assert_eq!(terms.expires_at_block - terms.issued_at_block, 64);
    assert!(terms.signature.starts_with("0xa1"));

    assert_eq!(terms.options.len(), 1);
    let opt = &terms.options[0];
    assert_eq!(opt.max_borrow.amount, dec("1.0"));
    // 1.0 * 0.0001 bps * 7200 blocks / 10000
    assert_eq!(opt.interest.amount, dec("0.000072"));
    assert_eq!(opt.fees.origination_fee.amount, dec("0.005"));

    // The router computed the message hash
    assert!(h
        .chain
        .calls()
        .iter()
        .any(|c| c.starts_with(&format!("eth_call {} getMessageHash", ROUTER_V1))));

    // Second quote within TTL reuses the cached valuation
    let again = h
        .calculator
        .compute_loan_terms(Blockchain::ETHEREUM_MAINNET, COLLECTION, NFT_ID, &cancel)
        .await
        .unwrap();
    assert_eq!(again.valuation, terms.valuation);
    assert_eq!(h.providers[0].calls(), 1);
}

#[tokio::test]
async fn test_utilization_cap() {
    let mut setup = Setup::new(Blockchain::ETHEREUM_MAINNET);
    setup.index.principal.insert("0xfull".into(), wei(9));
    let h = setup.build();
    let cancel = CancellationToken::new();

    // 9 open + 2 max borrow > 10
    h.store
        .upsert_pool(v1_pool("0xfull", Blockchain::ETHEREUM_MAINNET, vec![option(8000)]));
    let err = h
        .calculator
        .compute_loan_terms(Blockchain::ETHEREUM_MAINNET, COLLECTION, NFT_ID, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::UtilizationExceeded { .. }));
    // Nothing was signed
    assert!(!h.chain.calls().iter().any(|c| c.contains("getMessageHash")));

    // 9 open + 1 max borrow == 10 is allowed
    assert!(h
        .store
        .patch_loan_options("0xfull", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));
    let terms = h
        .calculator
        .compute_loan_terms(Blockchain::ETHEREUM_MAINNET, COLLECTION, NFT_ID, &cancel)
        .await
        .unwrap();
    assert_eq!(terms.options[0].max_borrow.amount, dec("1.0"));
}

#[tokio::test]
async fn test_expiry_window_on_both_chains() {
    for chain in [Blockchain::ETHEREUM_MAINNET, Blockchain::POLYGON_MAINNET] {
        let h = Setup::new(chain).build();
        h.store.upsert_pool(v1_pool("0xpool1", chain, vec![option(4000)]));

        let terms = h
            .calculator
            .compute_loan_terms(chain, COLLECTION, NFT_ID, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(terms.expires_at_block - terms.issued_at_block, 64);
        assert_eq!(terms.valuation.value.currency, chain.native_currency());
    }
}

#[tokio::test]
async fn test_stale_valuation_is_never_signed() {
    let h = Setup::new(Blockchain::ETHEREUM_MAINNET).build();
    let now = Utc::now();
    let limit = ChronoDuration::seconds(1800);
    let valuation = |age: ChronoDuration| Valuation {
        value: Value::new(dec("2.5"), Currency::Eth),
        value_24hr: Value::new(dec("3.0"), Currency::Eth),
        timestamp: now - age,
    };
    let cancel = CancellationToken::new();

    let stale = valuation(limit + ChronoDuration::milliseconds(1));
    let err = h
        .attestations
        .sign_at(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            &stale,
            PoolVersion::V1,
            now,
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::InvalidValuation { .. }));
    assert!(h.chain.calls().is_empty());

    let fresh = valuation(limit);
    let attestation = h
        .attestations
        .sign_at(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            &fresh,
            PoolVersion::V1,
            now,
            &cancel,
        )
        .await
        .unwrap();
    assert!(attestation.is_valid_at(HEAD_BLOCK + 64));
    assert!(!attestation.is_valid_at(HEAD_BLOCK + 65));
}

#[tokio::test]
async fn test_capacity_dispatch_by_pool_version() {
    let mut setup = Setup::new(Blockchain::ETHEREUM_MAINNET);
    setup.chain.native.insert("0xv1pool".into(), wei(7));
    setup
        .chain
        .tokens
        .insert(("0xweth".into(), "0xlender".into()), wei(4));
    setup.index.principal.insert("0xv1pool".into(), wei(3));
    let h = setup.build();
    let cancel = CancellationToken::new();

    let v1 = v1_pool("0xv1pool", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]);
    let v2 = v2_pool("0xv2pool", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]);

    let snap = h.ledger.snapshot(&v1, &cancel).await.unwrap();
    assert_eq!(snap.capacity.amount, Decimal::from(7));
    assert_eq!(snap.utilization.amount, Decimal::from(3));
    assert_eq!(snap.value_locked.amount, Decimal::from(10));

    let cap = h.ledger.capacity(&v2, &cancel).await.unwrap();
    assert_eq!(cap.amount, Decimal::from(4));

    let calls = h.chain.calls();
    assert_eq!(
        calls,
        vec![
            "eth_getBalance 0xv1pool".to_string(),
            "balanceOf 0xweth 0xlender".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_provider_fallthrough_order() {
    let mut setup = Setup::new(Blockchain::ETHEREUM_MAINNET);
    setup.quotes = vec![
        None,
        Some(ProviderQuote::new(
            ProviderKind::Opensea,
            Some(Decimal::ZERO),
            None,
            Currency::Eth,
        )),
        Some(ProviderQuote::new(
            ProviderKind::Nftbank,
            Some(dec("1.8")),
            None,
            Currency::Eth,
        )),
        Some(ProviderQuote::new(
            ProviderKind::PolygonBridge,
            Some(dec("9")),
            None,
            Currency::Eth,
        )),
    ];
    let h = setup.build();
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));

    let terms = h
        .calculator
        .compute_loan_terms(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(terms.valuation.value.amount, dec("1.8"));
    assert_eq!(terms.valuation.value_24hr.amount, dec("1.8"));
    let calls: Vec<usize> = h.providers.iter().map(|p| p.calls()).collect();
    assert_eq!(calls, vec![1, 1, 1, 0]);
}

#[tokio::test]
async fn test_all_providers_failing_is_exhausted() {
    let mut setup = Setup::new(Blockchain::ETHEREUM_MAINNET);
    setup.quotes = vec![None, None];
    let h = setup.build();
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));

    let err = h
        .calculator
        .compute_loan_terms(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::SourceExhausted { attempted: 2, .. }));
}

#[tokio::test]
async fn test_v2_pool_without_kms_credentials() {
    let mut setup = Setup::new(Blockchain::ETHEREUM_MAINNET);
    setup.signers = SignerRegistry::new(Some(Arc::new(FakeSigner { name: "a1" })), None);
    let h = setup.build();
    h.store
        .upsert_pool(v2_pool("0xpool2", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));

    let err = h
        .calculator
        .compute_loan_terms(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::MissingCredential { .. }));
    assert!(!h.chain.calls().iter().any(|c| c == "eth_blockNumber"));
}

#[tokio::test]
async fn test_v2_preferred_and_pool_hint() {
    let h = Setup::new(Blockchain::ETHEREUM_MAINNET).build();
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));
    h.store
        .upsert_pool(v2_pool("0xpool2", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));
    let cancel = CancellationToken::new();

    let terms = h
        .calculator
        .compute_loan_terms(Blockchain::ETHEREUM_MAINNET, COLLECTION, NFT_ID, &cancel)
        .await
        .unwrap();
    assert_eq!(terms.pool_address, "0xpool2");
    assert_eq!(terms.router_address, ROUTER_V2);
    assert!(terms.signature.starts_with("0xb2"));

    let terms = h
        .calculator
        .compute_loan_terms_in_pool(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            Some("0xPOOL1"),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(terms.pool_address, "0xpool1");
    assert_eq!(terms.router_address, ROUTER_V1);
}

#[tokio::test]
async fn test_unsupported_inputs() {
    let h = Setup::new(Blockchain::ETHEREUM_MAINNET).build();
    let cancel = CancellationToken::new();

    // Registered collection, no pools
    let err = h
        .calculator
        .compute_loan_terms(Blockchain::ETHEREUM_MAINNET, COLLECTION, NFT_ID, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::NoPoolsAvailable { .. }));

    let err = h
        .calculator
        .compute_loan_terms(
            Blockchain::ETHEREUM_MAINNET,
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            NFT_ID,
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::UnsupportedCollection { .. }));

    // Retired pools are never selected
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));
    assert!(h.store.retire_pool("0xpool1", Blockchain::ETHEREUM_MAINNET));
    let err = h
        .calculator
        .compute_loan_terms(Blockchain::ETHEREUM_MAINNET, COLLECTION, NFT_ID, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::NoPoolsAvailable { .. }));
    assert!(h.providers.iter().all(|p| p.calls() == 0));
}

#[tokio::test]
async fn test_sub_collection_matcher() {
    let matcher = Matcher {
        regex: "^(Gold|Diamond)$".into(),
        field_path: "attributes.0.value".into(),
    };

    let mut setup = Setup::new(Blockchain::ETHEREUM_MAINNET);
    setup.matcher = Some(matcher.clone());
    setup.background = "Blue";
    let h = setup.build();
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));
    let err = h
        .calculator
        .compute_loan_terms(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::UnsupportedCollection { .. }));

    let mut setup = Setup::new(Blockchain::ETHEREUM_MAINNET);
    setup.matcher = Some(matcher);
    let h = setup.build();
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));
    assert!(h
        .calculator
        .compute_loan_terms(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            &CancellationToken::new(),
        )
        .await
        .is_ok());
}

#[tokio::test]
async fn test_cancelled_request_signs_nothing() {
    let h = Setup::new(Blockchain::ETHEREUM_MAINNET).build();
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let res = tokio::time::timeout(
        Duration::from_secs(5),
        h.calculator
            .compute_loan_terms(Blockchain::ETHEREUM_MAINNET, COLLECTION, NFT_ID, &cancel),
    )
    .await
    .expect("cancelled flow must return promptly");
    assert!(matches!(res, Err(OracleError::Cancelled)));
    assert!(!h.chain.calls().iter().any(|c| c.contains("getMessageHash")));
}

#[tokio::test]
async fn test_sub_collections_on_one_contract() {
    let gold = Matcher {
        regex: "^Gold$".into(),
        field_path: "attributes.0.value".into(),
    };
    let mut setup = Setup::new(Blockchain::ETHEREUM_MAINNET);
    setup.matcher = Some(gold);
    setup.background = "Blue";
    let h = setup.build();

    let mut vendor_ids = HashMap::new();
    vendor_ids.insert(Vendor::Opensea, "aaa-blue".to_string());
    h.store.upsert_collection(Collection {
        address: COLLECTION.to_string(),
        blockchain: Blockchain::ETHEREUM_MAINNET,
        name: Some("AAA Club Blue".into()),
        vendor_ids,
        matcher: Some(Matcher {
            regex: "^Blue$".into(),
            field_path: "attributes.0.value".into(),
        }),
    });
    h.store
        .upsert_pool(v1_pool("0xpool1", Blockchain::ETHEREUM_MAINNET, vec![option(4000)]));

    // The Blue token is valued as the Blue sub-collection, not the Gold one
    // registered first under the same address.
    let terms = h
        .calculator
        .compute_loan_terms(
            Blockchain::ETHEREUM_MAINNET,
            COLLECTION,
            NFT_ID,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(terms.collection.vendor_id(Vendor::Opensea), Some("aaa-blue"));
    assert_eq!(terms.collection.name.as_deref(), Some("AAA Club Blue"));
}

#[tokio::test]
async fn test_attestation_endpoint_signs_resolved_valuation() {
    let h = Setup::new(Blockchain::ETHEREUM_MAINNET).build();

    // A caller-chosen valuation is rejected outright
    let forged = serde_json::json!({
        "network_id": 1,
        "collection": COLLECTION,
        "nft_id": NFT_ID,
        "pool_version": 1,
        "valuation": {
            "value": { "amount": "1000000", "currency": "ETH" },
            "value_24hr": { "amount": "1000000", "currency": "ETH" },
            "timestamp": "2026-01-01T00:00:00Z",
        },
    });
    assert!(serde_json::from_value::<AttestationRequest>(forged).is_err());

    let req: AttestationRequest = serde_json::from_value(serde_json::json!({
        "network_id": 1,
        "collection": COLLECTION,
        "nft_id": NFT_ID,
        "pool_version": 1,
    }))
    .unwrap();
    let Json(signed) = post_attestation(State(h.app()), Json(req)).await.unwrap();

    assert_eq!(signed.valuation.value, Value::new(dec("2.5"), Currency::Eth));
    assert!(signed.attestation.signature.starts_with("0xa1"));
    assert_eq!(signed.attestation.issued_at_block, HEAD_BLOCK);
    assert_eq!(h.providers[0].calls(), 1);

    // Unregistered collections get nothing signed
    let req: AttestationRequest = serde_json::from_value(serde_json::json!({
        "network_id": 1,
        "collection": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
        "nft_id": NFT_ID,
        "pool_version": 1,
    }))
    .unwrap();
    let err = post_attestation(State(h.app()), Json(req)).await.unwrap_err();
    assert!(matches!(err.0, OracleError::UnsupportedCollection { .. }));
    let hashes = h
        .chain
        .calls()
        .iter()
        .filter(|c| c.contains("getMessageHash"))
        .count();
    assert_eq!(hashes, 1);
}
