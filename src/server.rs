//! Slave signer HTTP server
//!
//! Lets the master collect partial signatures:
//! - `POST /sign` co-signs a payout for a message this node observed
//! - `POST /release` drops the pending entry once the payout is broadcast
//! - `GET /health` reports the signer index and multisig address
//!
//! `/sign` and `/release` require the shared key in the `x-api-key` header.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::common::{log_security_event, BridgeError};
use crate::provider::{BridgeProvider, CosignError};
use crate::signing::{ReleaseRequest, SignRequest, API_KEY_HEADER};

/// Shared handler state
pub struct AppState {
    pub provider: Arc<BridgeProvider>,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub nid: String,
    pub signer_index: usize,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub released: bool,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/sign", post(sign_handler))
        .route("/release", post(release_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` flips
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "bridge::server", addr = %addr, "Signer server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        nid: state.provider.nid().to_string(),
        signer_index: state.provider.signer().signer_index(),
        address: state.provider.multisig_address().to_string(),
    })
}

async fn sign_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SignRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
    authorize(&state, &headers, "/sign")?;

    state
        .provider
        .cosign(&request)
        .await
        .map(Json)
        .map_err(|e| cosign_error(request.msg_sn, e))
}

async fn release_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    authorize(&state, &headers, "/release")?;

    let released = state
        .provider
        .release_pending(request.msg_sn)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.error_code(), e.to_string())),
            )
        })?;
    Ok(Json(ReleaseResponse { released }))
}

fn authorize(state: &AppState, headers: &HeaderMap, path: &str) -> Result<(), ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !state.api_key.is_empty() && presented == state.api_key {
        return Ok(());
    }

    log_security_event(
        "unauthorized_request",
        false,
        serde_json::json!({ "path": path, "key_present": !presented.is_empty() }),
        None,
    );
    Err((
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new("UNAUTHORIZED", "missing or wrong API key")),
    ))
}

fn cosign_error(sn: u64, err: CosignError) -> ApiError {
    let (status, code) = match &err {
        CosignError::UnknownMessage(_) => (StatusCode::NOT_FOUND, "UNKNOWN_MESSAGE"),
        CosignError::Conflict { .. } => (StatusCode::CONFLICT, "ALREADY_SIGNED"),
        CosignError::Rejected(_) => (StatusCode::BAD_REQUEST, "REJECTED"),
        CosignError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.error_code()),
    };
    if matches!(err, CosignError::Conflict { .. } | CosignError::Rejected(_)) {
        log_security_event(
            "sign_request_refused",
            false,
            serde_json::json!({ "sn": sn, "reason": err.to_string() }),
            None,
        );
    }
    (status, Json(ErrorResponse::new(code, err.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::MockIndexer;
    use crate::provider::test_support::{funded_indexer, provider, withdraw_message};
    use crate::storage::SpentUtxoCache;
    use crate::tx::TxBuilder;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<BridgeProvider>) {
        let slave = Arc::new(provider(1, "slave", Arc::new(MockIndexer::new())));
        let state = Arc::new(AppState {
            provider: Arc::clone(&slave),
            api_key: "test-key".to_string(),
        });
        (create_router(state), slave)
    }

    async fn sign_request(slave: &BridgeProvider, sn: u64, amount: u128) -> SignRequest {
        let plan = slave
            .plan_withdrawal(&withdraw_message(sn, amount))
            .await
            .unwrap()
            .unwrap();
        let indexer = funded_indexer(slave.wallet().pk_script().clone());
        let unsigned = TxBuilder::new(bitcoin::Network::Testnet, 1000)
            .build_withdrawal(
                &indexer,
                &SpentUtxoCache::new(),
                slave.wallet(),
                &plan.order,
                &plan.receipt,
            )
            .await
            .unwrap();
        SignRequest::new(sn, &unsigned, slave.wallet())
    }

    fn post_json(path: &str, key: Option<&str>, body: &impl Serialize) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, slave) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.signer_index, 1);
        assert_eq!(health.address, slave.multisig_address());
    }

    #[tokio::test]
    async fn test_sign_requires_api_key() {
        let (app, slave) = app();
        let request = sign_request(&slave, 1, 50_000).await;

        for key in [None, Some("wrong")] {
            let response = app
                .clone()
                .oneshot(post_json("/sign", key, &request))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_sign_flow_status_codes() {
        let (app, slave) = app();
        let request = sign_request(&slave, 4, 50_000).await;

        let response = app
            .clone()
            .oneshot(post_json("/sign", Some("test-key"), &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        slave.route(&withdraw_message(4, 50_000)).await.unwrap();
        let response = app
            .clone()
            .oneshot(post_json("/sign", Some("test-key"), &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let sigs: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(sigs.len(), request.utxos.len());

        let other = sign_request(&slave, 4, 40_000).await;
        let response = app
            .clone()
            .oneshot(post_json("/sign", Some("test-key"), &other))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(post_json("/release", Some("test-key"), &ReleaseRequest { msg_sn: 4 }))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(slave.store().get_pending(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_payout_is_bad_request() {
        let (app, slave) = app();
        slave.route(&withdraw_message(8, 50_000)).await.unwrap();
        let request = sign_request(&slave, 8, 65_000).await;

        let response = app
            .oneshot(post_json("/sign", Some("test-key"), &request))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.code, "REJECTED");
    }
}
