//! SQLite-backed collection and pool store.
//!
//! - WAL mode so readers don't block the reconciliation writer
//! - vendor ids, matcher and loan options kept as JSON columns
//! - every write is an upsert keyed by (network_id, address); collections
//!   also carry the matcher key so sub-collections get their own row

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Row};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{normalize_address, CollectionStore, PoolStore};
use crate::models::{Blockchain, Collection, LoanOption, Network, Pool};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS collections (
    network_id INTEGER NOT NULL,
    address TEXT NOT NULL,
    network TEXT NOT NULL,
    name TEXT,
    vendor_ids_json TEXT NOT NULL DEFAULT '{}',
    matcher_json TEXT,
    variant TEXT NOT NULL DEFAULT '',
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (network_id, address, variant)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS pools (
    network_id INTEGER NOT NULL,
    address TEXT NOT NULL,
    network TEXT NOT NULL,
    version INTEGER NOT NULL,
    collection_address TEXT NOT NULL,
    lender TEXT,
    token_address TEXT,
    fund_source TEXT,
    token_decimals INTEGER,
    eth_limit TEXT,
    loan_options_json TEXT NOT NULL DEFAULT '[]',
    retired INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (network_id, address)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_pools_collection
    ON pools(network_id, collection_address);

CREATE INDEX IF NOT EXISTS idx_pools_lender
    ON pools(network_id, lender);
"#;

const POOL_COLUMNS: &str = "network_id, address, network, version, collection_address, lender, \
     token_address, fund_source, token_decimals, eth_limit, loan_options_json, retired";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let pools: i64 = conn
            .query_row("SELECT COUNT(*) FROM pools", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Store initialized at {} ({} pools)", db_path, pools);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn upsert_collection(&self, collection: &Collection) -> Result<()> {
        let vendor_ids = serde_json::to_string(&collection.vendor_ids)?;
        let matcher = collection
            .matcher
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO collections (network_id, address, network, name, vendor_ids_json, matcher_json, variant, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%s', 'now')) \
             ON CONFLICT(network_id, address, variant) DO UPDATE SET \
               network=excluded.network, name=excluded.name, vendor_ids_json=excluded.vendor_ids_json, \
               matcher_json=excluded.matcher_json, updated_at=excluded.updated_at",
            params![
                collection.blockchain.network_id as i64,
                normalize_address(&collection.address),
                collection.blockchain.network.as_str(),
                collection.name,
                vendor_ids,
                matcher,
                collection.variant_key(),
            ],
        )?;
        Ok(())
    }

    /// Insert or replace the pool. A retired pool stays retired: re-syncing
    /// from an indexer that still lists it must not revive it.
    pub fn upsert_pool(&self, pool: &Pool) -> Result<()> {
        let options = serde_json::to_string(&pool.loan_options)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pools (network_id, address, network, version, collection_address, lender, \
               token_address, fund_source, token_decimals, eth_limit, loan_options_json, retired, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, strftime('%s', 'now')) \
             ON CONFLICT(network_id, address) DO UPDATE SET \
               network=excluded.network, version=excluded.version, \
               collection_address=excluded.collection_address, lender=excluded.lender, \
               token_address=excluded.token_address, fund_source=excluded.fund_source, \
               token_decimals=excluded.token_decimals, eth_limit=excluded.eth_limit, \
               loan_options_json=excluded.loan_options_json, \
               retired=MAX(pools.retired, excluded.retired), updated_at=excluded.updated_at",
            params![
                pool.blockchain.network_id as i64,
                normalize_address(&pool.address),
                pool.blockchain.network.as_str(),
                pool.version as i64,
                normalize_address(&pool.collection_address),
                pool.lender.as_deref().map(normalize_address),
                pool.token_address.as_deref().map(normalize_address),
                pool.fund_source.as_deref().map(normalize_address),
                pool.token_decimals.map(i64::from),
                pool.eth_limit.map(|d| d.to_string()),
                options,
                pool.retired as i64,
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row matched.
    pub fn retire_pool(&self, address: &str, blockchain: Blockchain) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE pools SET retired = 1, updated_at = strftime('%s', 'now') \
             WHERE network_id = ?1 AND address = ?2",
            params![blockchain.network_id as i64, normalize_address(address)],
        )?;
        debug!(pool = address, changed, "retire_pool");
        Ok(changed > 0)
    }

    pub fn patch_loan_options(
        &self,
        address: &str,
        blockchain: Blockchain,
        options: &[LoanOption],
    ) -> Result<bool> {
        let json = serde_json::to_string(options)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE pools SET loan_options_json = ?3, updated_at = strftime('%s', 'now') \
             WHERE network_id = ?1 AND address = ?2",
            params![blockchain.network_id as i64, normalize_address(address), json],
        )?;
        Ok(changed > 0)
    }

    fn query_pools(&self, where_clause: &str, a: i64, b: &str) -> Result<Vec<Pool>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM pools WHERE {} ORDER BY address",
            POOL_COLUMNS, where_clause
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![a, b], raw_pool)?;

        let mut pools = Vec::new();
        for row in rows {
            pools.push(row?.into_pool()?);
        }
        Ok(pools)
    }
}

/// Column values as stored, decoded into a `Pool` outside the row callback
/// so JSON/decimal errors keep their context.
struct RawPool {
    network_id: i64,
    address: String,
    network: String,
    version: i64,
    collection_address: String,
    lender: Option<String>,
    token_address: Option<String>,
    fund_source: Option<String>,
    token_decimals: Option<i64>,
    eth_limit: Option<String>,
    loan_options_json: String,
    retired: i64,
}

fn raw_pool(row: &Row<'_>) -> rusqlite::Result<RawPool> {
    Ok(RawPool {
        network_id: row.get(0)?,
        address: row.get(1)?,
        network: row.get(2)?,
        version: row.get(3)?,
        collection_address: row.get(4)?,
        lender: row.get(5)?,
        token_address: row.get(6)?,
        fund_source: row.get(7)?,
        token_decimals: row.get(8)?,
        eth_limit: row.get(9)?,
        loan_options_json: row.get(10)?,
        retired: row.get(11)?,
    })
}

fn parse_network(raw: &str) -> Result<Network> {
    match raw {
        "ethereum" => Ok(Network::Ethereum),
        "polygon" => Ok(Network::Polygon),
        other => Err(anyhow!("unknown network {:?}", other)),
    }
}

impl RawPool {
    fn into_pool(self) -> Result<Pool> {
        let loan_options: Vec<LoanOption> = serde_json::from_str(&self.loan_options_json)
            .with_context(|| format!("pool {} has bad loan options", self.address))?;
        let eth_limit = self
            .eth_limit
            .as_deref()
            .map(Decimal::from_str)
            .transpose()
            .with_context(|| format!("pool {} has bad eth_limit", self.address))?;

        Ok(Pool {
            version: u8::try_from(self.version).unwrap_or(u8::MAX),
            blockchain: Blockchain {
                network: parse_network(&self.network)?,
                network_id: self.network_id as u64,
            },
            address: self.address,
            collection_address: self.collection_address,
            lender: self.lender,
            token_address: self.token_address,
            fund_source: self.fund_source,
            token_decimals: self.token_decimals.and_then(|d| u32::try_from(d).ok()),
            eth_limit,
            loan_options,
            retired: self.retired != 0,
        })
    }
}

struct RawCollection {
    address: String,
    network: String,
    name: Option<String>,
    vendor_ids_json: String,
    matcher_json: Option<String>,
}

fn raw_collection(row: &Row<'_>) -> rusqlite::Result<RawCollection> {
    Ok(RawCollection {
        address: row.get(0)?,
        network: row.get(1)?,
        name: row.get(2)?,
        vendor_ids_json: row.get(3)?,
        matcher_json: row.get(4)?,
    })
}

impl RawCollection {
    fn into_collection(self, blockchain: Blockchain) -> Result<Collection> {
        Ok(Collection {
            vendor_ids: serde_json::from_str(&self.vendor_ids_json)
                .with_context(|| format!("collection {} has bad vendor ids", self.address))?,
            matcher: self
                .matcher_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .with_context(|| format!("collection {} has bad matcher", self.address))?,
            address: self.address,
            blockchain,
            name: self.name,
        })
    }
}

#[async_trait]
impl CollectionStore for SqliteStore {
    async fn variants(&self, address: &str, blockchain: Blockchain) -> Result<Vec<Collection>> {
        let raw = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT address, network, name, vendor_ids_json, matcher_json \
                 FROM collections WHERE network_id = ?1 AND address = ?2 ORDER BY variant",
            )?;
            let rows = stmt.query_map(
                params![blockchain.network_id as i64, normalize_address(address)],
                raw_collection,
            )?;
            let raw = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            raw
        };

        let mut collections = Vec::with_capacity(raw.len());
        for row in raw {
            if parse_network(&row.network)? != blockchain.network {
                continue;
            }
            collections.push(row.into_collection(blockchain)?);
        }
        Ok(collections)
    }
}

#[async_trait]
impl PoolStore for SqliteStore {
    async fn find_by_collection(
        &self,
        collection_address: &str,
        blockchain: Blockchain,
    ) -> Result<Vec<Pool>> {
        self.query_pools(
            "network_id = ?1 AND collection_address = ?2",
            blockchain.network_id as i64,
            &normalize_address(collection_address),
        )
    }

    async fn find_by_address(&self, address: &str, blockchain: Blockchain) -> Result<Option<Pool>> {
        Ok(self
            .query_pools(
                "network_id = ?1 AND address = ?2",
                blockchain.network_id as i64,
                &normalize_address(address),
            )?
            .into_iter()
            .next())
    }

    async fn find_by_lender(&self, lender: &str, blockchain: Blockchain) -> Result<Vec<Pool>> {
        self.query_pools(
            "network_id = ?1 AND lender = ?2",
            blockchain.network_id as i64,
            &normalize_address(lender),
        )
    }
}
