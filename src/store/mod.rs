//! Collection and pool records
//!
//! Read by the core through `CollectionStore` / `PoolStore`. Writes are
//! idempotent upserts so reconciliation jobs can run concurrently.
//!
//! One contract address may carry several collections: a whole-contract
//! entry without a matcher and any number of sub-collections, each keyed
//! by its matcher.

pub mod sqlite;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::models::{Blockchain, Collection, LoanOption, Pool};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Every collection registered under `address`, ordered by variant key
    /// (the matcher-less entry, if any, first).
    async fn variants(&self, address: &str, blockchain: Blockchain) -> anyhow::Result<Vec<Collection>>;
}

#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn find_by_collection(
        &self,
        collection_address: &str,
        blockchain: Blockchain,
    ) -> anyhow::Result<Vec<Pool>>;

    async fn find_by_address(
        &self,
        address: &str,
        blockchain: Blockchain,
    ) -> anyhow::Result<Option<Pool>>;

    async fn find_by_lender(&self, lender: &str, blockchain: Blockchain)
        -> anyhow::Result<Vec<Pool>>;
}

/// Addresses are compared case-insensitively everywhere.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

type Key = (u64, String);

fn key(address: &str, blockchain: Blockchain) -> Key {
    (blockchain.network_id, normalize_address(address))
}

/// In-process store, used by tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<(Key, String), Collection>>,
    pools: RwLock<HashMap<Key, Pool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_collection(&self, collection: Collection) {
        let k = (
            key(&collection.address, collection.blockchain),
            collection.variant_key(),
        );
        self.collections.write().insert(k, collection);
    }

    pub fn upsert_pool(&self, pool: Pool) {
        let k = key(&pool.address, pool.blockchain);
        self.pools.write().insert(k, pool);
    }

    /// Returns whether the pool exists. Retiring twice is a no-op.
    pub fn retire_pool(&self, address: &str, blockchain: Blockchain) -> bool {
        match self.pools.write().get_mut(&key(address, blockchain)) {
            Some(pool) => {
                pool.retired = true;
                true
            }
            None => false,
        }
    }

    pub fn patch_loan_options(
        &self,
        address: &str,
        blockchain: Blockchain,
        options: Vec<LoanOption>,
    ) -> bool {
        match self.pools.write().get_mut(&key(address, blockchain)) {
            Some(pool) => {
                pool.loan_options = options;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn variants(&self, address: &str, blockchain: Blockchain) -> anyhow::Result<Vec<Collection>> {
        let wanted = key(address, blockchain);
        let mut found: Vec<(String, Collection)> = self
            .collections
            .read()
            .iter()
            .filter(|((k, _), _)| *k == wanted)
            .map(|((_, variant), c)| (variant.clone(), c.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found.into_iter().map(|(_, c)| c).collect())
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn find_by_collection(
        &self,
        collection_address: &str,
        blockchain: Blockchain,
    ) -> anyhow::Result<Vec<Pool>> {
        let wanted = normalize_address(collection_address);
        let mut pools: Vec<Pool> = self
            .pools
            .read()
            .values()
            .filter(|p| {
                p.blockchain == blockchain && normalize_address(&p.collection_address) == wanted
            })
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(pools)
    }

    async fn find_by_address(
        &self,
        address: &str,
        blockchain: Blockchain,
    ) -> anyhow::Result<Option<Pool>> {
        Ok(self.pools.read().get(&key(address, blockchain)).cloned())
    }

    async fn find_by_lender(
        &self,
        lender: &str,
        blockchain: Blockchain,
    ) -> anyhow::Result<Vec<Pool>> {
        let wanted = normalize_address(lender);
        let mut pools: Vec<Pool> = self
            .pools
            .read()
            .values()
            .filter(|p| {
                p.blockchain == blockchain
                    && p.lender.as_deref().map(normalize_address).as_deref() == Some(wanted.as_str())
            })
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(pools)
    }
}
