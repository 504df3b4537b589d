//! Valuation resolver
//!
//! Cache first; on a miss the chain's ranked providers are tried one at a
//! time through a `FallbackChain` and the first usable quote becomes the
//! valuation. Concurrent misses on one key are serialized so only the first
//! caller pays for the provider round trips.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{get_typed, set_typed, CacheStore, SingleFlight};
use crate::collections::CollectionLookup;
use crate::config::OracleConfig;
use crate::datasource::{FallbackChain, Source};
use crate::error::{OracleError, Result};
use crate::models::{Blockchain, Collection, Valuation};
use crate::providers::{PriceProvider, ProviderQuote, ProviderRegistry, QuoteRequest};
use crate::store::normalize_address;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub collection_ttl: Duration,
    pub token_ttl: Duration,
    pub provider_timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from_config(&OracleConfig::default())
    }
}

impl ResolverSettings {
    pub fn from_config(cfg: &OracleConfig) -> Self {
        Self {
            collection_ttl: Duration::from_secs(cfg.collection_cache_ttl_secs),
            token_ttl: Duration::from_secs(cfg.token_cache_ttl_secs),
            provider_timeout: cfg.provider_timeout(),
        }
    }
}

pub fn cache_key(blockchain: Blockchain, address: &str, nft_id: Option<&str>) -> String {
    let address = normalize_address(address);
    match nft_id {
        Some(id) => format!("valuation:{}:{}:{}", blockchain.network_id, address, id.trim()),
        None => format!("valuation:{}:{}", blockchain.network_id, address),
    }
}

/// Turns the winning quote into a valuation stamped `now`.
fn valuation_from_quote(quote: &ProviderQuote) -> Option<Valuation> {
    let value = Value::new(quote.conservative_value()?, quote.currency);
    let value_24hr = quote
        .value_24h_avg
        .map(|avg| Value::new(avg, quote.currency))
        .unwrap_or(value);
    Some(Valuation {
        value,
        value_24hr,
        timestamp: Utc::now(),
    })
}

pub struct ValuationResolver {
    collections: Arc<CollectionLookup>,
    providers: Arc<ProviderRegistry>,
    cache: Arc<dyn CacheStore>,
    inflight: SingleFlight,
    settings: ResolverSettings,
}

impl ValuationResolver {
    pub fn new(
        collections: Arc<CollectionLookup>,
        providers: Arc<ProviderRegistry>,
        cache: Arc<dyn CacheStore>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            collections,
            providers,
            cache,
            inflight: SingleFlight::new(),
            settings,
        }
    }

    pub async fn resolve_collection_valuation(
        &self,
        blockchain: Blockchain,
        collection_address: &str,
        nft_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Valuation> {
        let key = cache_key(blockchain, collection_address, nft_id);
        if let Some(hit) = get_typed::<Valuation>(self.cache.as_ref(), &key) {
            debug!(key = %key, "valuation cache hit");
            return Ok(hit);
        }

        self.providers.ranked(blockchain)?;
        let collection = self
            .collections
            .find(collection_address, blockchain, nft_id, cancel)
            .await?
            .ok_or_else(|| OracleError::unsupported_collection(collection_address, "not registered"))?;
        self.resolve_collection(blockchain, &collection, nft_id, cancel)
            .await
    }

    /// Valuation of an already matched collection (or sub-collection).
    pub async fn resolve_collection(
        &self,
        blockchain: Blockchain,
        collection: &Collection,
        nft_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Valuation> {
        let key = cache_key(blockchain, &collection.address, nft_id);
        if let Some(hit) = get_typed::<Valuation>(self.cache.as_ref(), &key) {
            debug!(key = %key, "valuation cache hit");
            return Ok(hit);
        }

        let providers = self.providers.ranked(blockchain)?;
        if !collection.vendor_ids.values().any(|id| !id.trim().is_empty()) {
            return Err(OracleError::unsupported_collection(
                &collection.address,
                "no vendor mapping",
            ));
        }

        let _flight = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OracleError::Cancelled),
            guard = self.inflight.acquire(&key) => guard,
        };
        // Whoever held the flight before us may have filled the cache.
        if let Some(hit) = get_typed::<Valuation>(self.cache.as_ref(), &key) {
            debug!(key = %key, "valuation filled by concurrent request");
            return Ok(hit);
        }

        let valuation = self
            .resolve_for_collection(blockchain, collection, nft_id, providers, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Err(OracleError::Cancelled);
        }
        let ttl = if nft_id.is_some() {
            self.settings.token_ttl
        } else {
            self.settings.collection_ttl
        };
        set_typed(self.cache.as_ref(), &key, &valuation, ttl);
        Ok(valuation)
    }

    async fn resolve_for_collection(
        &self,
        blockchain: Blockchain,
        collection: &Collection,
        nft_id: Option<&str>,
        providers: &[Arc<dyn PriceProvider>],
        cancel: &CancellationToken,
    ) -> Result<Valuation> {
        let req = QuoteRequest {
            blockchain,
            collection,
            nft_id,
        };

        let mut chain = FallbackChain::new(format!("valuation {}", collection.address))
            .with_timeout(self.settings.provider_timeout);
        for provider in providers {
            let provider = provider.clone();
            chain.push(Source::new(provider.kind().as_str(), move || async move {
                provider.quote(&req).await
            }));
        }

        let quote = chain
            .resolve_with(|q: &ProviderQuote| q.prices(blockchain), cancel)
            .await?;

        let valuation = valuation_from_quote(&quote).ok_or_else(|| OracleError::InvalidValuation {
            reason: format!("{} quote carried no price", quote.provider.as_str()),
        })?;

        info!(
            collection = %collection.address,
            network_id = blockchain.network_id,
            provider = quote.provider.as_str(),
            value = %valuation.value,
            value_24hr = %valuation.value_24hr,
            "valuation resolved"
        );
        Ok(valuation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::metadata::MetadataSource;
    use crate::models::Vendor;
    use crate::providers::ProviderKind;
    use crate::store::MemoryStore;
    use crate::value::Currency;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        kind: ProviderKind,
        quote: Option<ProviderQuote>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Scripted {
        fn new(kind: ProviderKind, quote: Option<ProviderQuote>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                quote,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
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
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.quote.clone().ok_or_else(|| anyhow::anyhow!("503"))
        }
    }

    fn eth_quote(kind: ProviderKind, floor: &str, avg: Option<&str>) -> ProviderQuote {
        ProviderQuote::new(
            kind,
            Some(floor.parse().unwrap()),
            avg.map(|a| a.parse().unwrap()),
            Currency::Eth,
        )
    }

    fn store_with_collection(address: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut vendor_ids = HashMap::new();
        vendor_ids.insert(Vendor::Opensea, "slug".to_string());
        store.upsert_collection(Collection {
            address: address.into(),
            blockchain: Blockchain::ETHEREUM_MAINNET,
            name: None,
            vendor_ids,
            matcher: None,
        });
        store
    }

    /// Collections in these tests carry no matcher, so metadata is never read.
    struct NoMetadata;

    #[async_trait]
    impl MetadataSource for NoMetadata {
        async fn token_metadata(
            &self,
            _blockchain: Blockchain,
            _collection_address: &str,
            _nft_id: &str,
        ) -> anyhow::Result<serde_json::Value> {
            Err(anyhow::anyhow!("no metadata"))
        }
    }

    fn resolver(store: Arc<MemoryStore>, providers: Vec<Arc<Scripted>>) -> ValuationResolver {
        let mut registry = ProviderRegistry::new();
        for p in providers {
            registry.register(Blockchain::ETHEREUM_MAINNET, p);
        }
        ValuationResolver::new(
            Arc::new(CollectionLookup::new(store, Arc::new(NoMetadata))),
            Arc::new(registry),
            Arc::new(MemoryCache::new()),
            ResolverSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_falls_through_to_first_usable_quote() {
        let down = Scripted::new(ProviderKind::Reservoir, None);
        let wrong_currency = Scripted::new(
            ProviderKind::Opensea,
            Some(ProviderQuote::new(
                ProviderKind::Opensea,
                Some(Decimal::from(900)),
                None,
                Currency::Matic,
            )),
        );
        let good = Scripted::new(ProviderKind::Nftbank, Some(eth_quote(ProviderKind::Nftbank, "4", None)));
        let never = Scripted::new(ProviderKind::PolygonBridge, Some(eth_quote(ProviderKind::PolygonBridge, "9", None)));

        let r = resolver(
            store_with_collection("0xAAA"),
            vec![down.clone(), wrong_currency.clone(), good.clone(), never.clone()],
        );
        let v = r
            .resolve_collection_valuation(Blockchain::ETHEREUM_MAINNET, "0xAAA", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(v.value.amount, Decimal::from(4));
        assert_eq!(v.value_24hr, v.value);
        assert_eq!((down.calls(), wrong_currency.calls(), good.calls(), never.calls()), (1, 1, 1, 0));
    }

    #[tokio::test]
    async fn test_unknown_collection_and_chain() {
        let p = Scripted::new(ProviderKind::Reservoir, Some(eth_quote(ProviderKind::Reservoir, "1", None)));
        let r = resolver(store_with_collection("0xAAA"), vec![p.clone()]);
        let cancel = CancellationToken::new();

        let err = r
            .resolve_collection_valuation(Blockchain::ETHEREUM_MAINNET, "0xBBB", None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_UNSUPPORTED_COLLECTION");

        let err = r
            .resolve_collection_valuation(Blockchain::ETHEREUM_SEPOLIA, "0xAAA", None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ERR_UNSUPPORTED_CHAIN");
        assert_eq!(p.calls(), 0);
    }

    #[tokio::test]
    async fn test_collection_without_vendor_ids_is_unsupported() {
        let p = Scripted::new(ProviderKind::Reservoir, Some(eth_quote(ProviderKind::Reservoir, "1", None)));
        let store = Arc::new(MemoryStore::new());
        let mut blank = HashMap::new();
        blank.insert(Vendor::Opensea, "  ".to_string());
        store.upsert_collection(Collection {
            address: "0xAAA".into(),
            blockchain: Blockchain::ETHEREUM_MAINNET,
            name: None,
            vendor_ids: blank,
            matcher: None,
        });
        store.upsert_collection(Collection {
            address: "0xBBB".into(),
            blockchain: Blockchain::ETHEREUM_MAINNET,
            name: None,
            vendor_ids: HashMap::new(),
            matcher: None,
        });
        let r = resolver(store, vec![p.clone()]);
        let cancel = CancellationToken::new();

        for address in ["0xAAA", "0xBBB"] {
            let err = r
                .resolve_collection_valuation(Blockchain::ETHEREUM_MAINNET, address, Some("1"), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(
                &err,
                OracleError::UnsupportedCollection { reason, .. } if reason == "no vendor mapping"
            ));
        }
        assert_eq!(p.calls(), 0);
        let key = cache_key(Blockchain::ETHEREUM_MAINNET, "0xAAA", Some("1"));
        assert!(r.cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_exhausted_is_not_cached() {
        let down = Scripted::new(ProviderKind::Reservoir, None);
        let r = resolver(store_with_collection("0xAAA"), vec![down.clone()]);
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let err = r
                .resolve_collection_valuation(Blockchain::ETHEREUM_MAINNET, "0xaaa", None, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, OracleError::SourceExhausted { attempted: 1, .. }));
        }
        assert_eq!(down.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_resolution_leaves_cache_empty() {
        let slow = Arc::new(Scripted {
            kind: ProviderKind::Reservoir,
            quote: Some(eth_quote(ProviderKind::Reservoir, "2", None)),
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(5),
        });
        let r = resolver(store_with_collection("0xAAA"), vec![slow.clone()]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = r
            .resolve_collection_valuation(Blockchain::ETHEREUM_MAINNET, "0xAAA", None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Cancelled));
        let key = cache_key(Blockchain::ETHEREUM_MAINNET, "0xAAA", None);
        assert!(r.cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_provider_call() {
        let slow = Arc::new(Scripted {
            kind: ProviderKind::Reservoir,
            quote: Some(eth_quote(ProviderKind::Reservoir, "2", Some("3"))),
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(30),
        });
        let r = Arc::new(resolver(store_with_collection("0xAAA"), vec![slow.clone()]));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let r = r.clone();
            tasks.push(tokio::spawn(async move {
                r.resolve_collection_valuation(
                    Blockchain::ETHEREUM_MAINNET,
                    "0xAAA",
                    Some("42"),
                    &CancellationToken::new(),
                )
                .await
            }));
        }
        for t in tasks {
            let v = t.await.unwrap().unwrap();
            assert_eq!(v.value.amount, Decimal::from(2));
        }
        assert_eq!(slow.calls(), 1);
    }

    #[test]
    fn test_cache_key_shape() {
        assert_eq!(
            cache_key(Blockchain::ETHEREUM_MAINNET, "0xAbC", None),
            "valuation:1:0xabc"
        );
        assert_eq!(
            cache_key(Blockchain::POLYGON_MAINNET, "0xAbC", Some("42")),
            "valuation:137:0xabc:42"
        );
    }
}
