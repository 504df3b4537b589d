//! HTTP surface
//!
//! Every request gets its own cancellation token. The token is cancelled
//! when the request deadline passes or when the client goes away (the
//! handler future is dropped), which aborts all provider and chain calls
//! still in flight for that request.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::attestation::AttestationSigner;
use crate::error::{ErrorClass, OracleError};
use crate::models::{Attestation, Blockchain, LoanTerms, PoolVersion, Valuation};
use crate::resolver::ValuationResolver;
use crate::terms::LoanTermsCalculator;

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<ValuationResolver>,
    pub calculator: Arc<LoanTermsCalculator>,
    pub attestations: Arc<AttestationSigner>,
    pub request_timeout: Duration,
    pub network_ids: Vec<u64>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/valuation/:network_id/:collection", get(get_valuation))
        .route(
            "/api/loan-terms/:network_id/:collection/:nft_id",
            get(get_loan_terms),
        )
        .route("/api/attestation", post(post_attestation))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// Caller-facing error: code and message, never the cause chain.
#[derive(Debug)]
pub struct ApiError(pub OracleError);

impl From<OracleError> for ApiError {
    fn from(err: OracleError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            OracleError::UnsupportedChain { .. } => StatusCode::BAD_REQUEST,
            OracleError::UnsupportedCollection { .. }
            | OracleError::UnsupportedPool { .. }
            | OracleError::NoPoolsAvailable { .. } => StatusCode::NOT_FOUND,
            OracleError::InvalidValuation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            OracleError::UtilizationExceeded { .. } => StatusCode::CONFLICT,
            OracleError::SourceExhausted { .. }
            | OracleError::ChainQueryFailed { .. }
            | OracleError::SignatureFailure { .. } => StatusCode::BAD_GATEWAY,
            OracleError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OracleError::MissingCredential { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OracleError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let err = &self.0;
        if err.class() == ErrorClass::Server {
            match std::error::Error::source(err) {
                Some(cause) => error!(code = err.code(), error = %err, cause = %cause, "request failed"),
                None => warn!(code = err.code(), error = %err, "request failed"),
            }
        }
        let body = ErrorBody {
            code: err.code(),
            message: err.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Runs `f` with a fresh token that is cancelled on deadline or drop.
async fn with_deadline<T, F, Fut>(timeout: Duration, f: F) -> Result<T, OracleError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    let cancel = CancellationToken::new();
    let _drop_guard = cancel.clone().drop_guard();
    let work = f(cancel.clone());
    tokio::select! {
        res = work => res,
        _ = tokio::time::sleep(timeout) => {
            cancel.cancel();
            Err(OracleError::Cancelled)
        }
    }
}

fn blockchain(network_id: u64) -> Result<Blockchain, OracleError> {
    Blockchain::from_network_id(network_id).ok_or(OracleError::UnsupportedChain { network_id })
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    networks: Vec<u64>,
}

async fn health_check(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        networks: state.network_ids.clone(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ValuationQuery {
    pub nft_id: Option<String>,
}

/// GET /api/valuation/:network_id/:collection
pub async fn get_valuation(
    State(state): State<AppState>,
    Path((network_id, collection)): Path<(u64, String)>,
    Query(query): Query<ValuationQuery>,
) -> Result<Json<Valuation>, ApiError> {
    let chain = blockchain(network_id)?;
    let nft_id = query.nft_id.filter(|id| !id.trim().is_empty());
    let resolver = state.resolver.clone();

    let valuation = with_deadline(state.request_timeout, |cancel| async move {
        resolver
            .resolve_collection_valuation(chain, &collection, nft_id.as_deref(), &cancel)
            .await
    })
    .await?;
    Ok(Json(valuation))
}

#[derive(Debug, Deserialize)]
pub struct LoanTermsQuery {
    pub pool: Option<String>,
}

/// GET /api/loan-terms/:network_id/:collection/:nft_id
pub async fn get_loan_terms(
    State(state): State<AppState>,
    Path((network_id, collection, nft_id)): Path<(u64, String, String)>,
    Query(query): Query<LoanTermsQuery>,
) -> Result<Json<LoanTerms>, ApiError> {
    let chain = blockchain(network_id)?;
    let calculator = state.calculator.clone();

    let terms = with_deadline(state.request_timeout, |cancel| async move {
        calculator
            .compute_loan_terms_in_pool(chain, &collection, &nft_id, query.pool.as_deref(), &cancel)
            .await
    })
    .await?;
    Ok(Json(terms))
}

/// The valuation is always resolved here; a client-supplied one is refused.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttestationRequest {
    pub network_id: u64,
    pub collection: String,
    pub nft_id: String,
    pub pool_version: u8,
}

#[derive(Debug, Serialize)]
pub struct AttestationResponse {
    pub valuation: Valuation,
    #[serde(flatten)]
    pub attestation: Attestation,
}

/// POST /api/attestation
pub async fn post_attestation(
    State(state): State<AppState>,
    Json(req): Json<AttestationRequest>,
) -> Result<Json<AttestationResponse>, ApiError> {
    let chain = blockchain(req.network_id)?;
    let version = PoolVersion::from_u8(req.pool_version).ok_or_else(|| OracleError::UnsupportedPool {
        address: req.collection.clone(),
        reason: format!("unknown pool version {}", req.pool_version),
    })?;
    let resolver = state.resolver.clone();
    let attestations = state.attestations.clone();

    let response = with_deadline(state.request_timeout, |cancel| async move {
        let valuation = resolver
            .resolve_collection_valuation(chain, &req.collection, Some(&req.nft_id), &cancel)
            .await?;
        let attestation = attestations
            .sign(chain, &req.collection, &req.nft_id, &valuation, version, &cancel)
            .await?;
        Ok::<_, OracleError>(AttestationResponse {
            valuation,
            attestation,
        })
    })
    .await?;
    Ok(Json(response))
}
