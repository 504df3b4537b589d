//! Loan index backed by a GraphQL subgraph.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use num_bigint::BigUint;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::ChainIndex;

const PAGE_SIZE: usize = 1000;
/// Hard stop so a misbehaving indexer can't page us forever.
const MAX_PAGES: usize = 50;

const OPEN_LOANS_QUERY: &str = r#"
query OpenLoans($pool: String!, $first: Int!, $skip: Int!) {
  loans(first: $first, skip: $skip, where: { pool: $pool, status: "ACTIVE" }) {
    id
    principal
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct LoansPage {
    loans: Vec<LoanRow>,
}

#[derive(Debug, Deserialize)]
struct LoanRow {
    id: String,
    principal: String,
}

pub struct SubgraphIndex {
    http: Client,
    url: String,
}

impl SubgraphIndex {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build subgraph HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn fetch_page(&self, pool: &str, skip: usize) -> Result<Vec<LoanRow>> {
        let body = json!({
            "query": OPEN_LOANS_QUERY,
            "variables": { "pool": pool, "first": PAGE_SIZE, "skip": skip },
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("subgraph request failed")?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("subgraph returned HTTP {}", status));
        }

        let parsed: GraphQlResponse<LoansPage> =
            resp.json().await.context("failed to parse subgraph response")?;
        if let Some(err) = parsed.errors.first() {
            return Err(anyhow!("subgraph error: {}", err.message));
        }
        parsed
            .data
            .map(|d| d.loans)
            .ok_or_else(|| anyhow!("subgraph response has no data"))
    }
}

fn sum_principal(rows: &[LoanRow]) -> Result<BigUint> {
    rows.iter().try_fold(BigUint::from(0u32), |acc, row| {
        let p = BigUint::parse_bytes(row.principal.trim().as_bytes(), 10)
            .ok_or_else(|| anyhow!("loan {} has bad principal {:?}", row.id, row.principal))?;
        Ok(acc + p)
    })
}

#[async_trait]
impl ChainIndex for SubgraphIndex {
    async fn open_principal(&self, pool_address: &str) -> Result<BigUint> {
        // Subgraph ids are lowercase hex.
        let pool = pool_address.trim().to_ascii_lowercase();
        let mut total = BigUint::from(0u32);
        let mut loans = 0usize;

        for page in 0..MAX_PAGES {
            let rows = self.fetch_page(&pool, page * PAGE_SIZE).await?;
            total += sum_principal(&rows)?;
            loans += rows.len();
            if rows.len() < PAGE_SIZE {
                debug!(pool = %pool, loans, principal = %total, "open principal summed");
                return Ok(total);
            }
        }

        Err(anyhow!(
            "pool {} has more than {} open loans",
            pool,
            PAGE_SIZE * MAX_PAGES
        ))
    }
}
