//! HTTP handlers for the admission service.

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::response::Verdict;
use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{Policy, RateLimiter, RequestContext};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    limiter: Arc<RateLimiter>,
    principal_header: HeaderName,
    forwarded_header: HeaderName,
}

impl AppState {
    /// State with the default `x-principal-id` and `x-forwarded-for` headers.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            principal_header: HeaderName::from_static("x-principal-id"),
            forwarded_header: HeaderName::from_static("x-forwarded-for"),
        }
    }

    /// State with header names taken from configuration.
    pub fn from_config(limiter: Arc<RateLimiter>, config: &TollgateConfig) -> Result<Self> {
        Ok(Self {
            limiter,
            principal_header: header_name(&config.server.principal_header)?,
            forwarded_header: header_name(&config.key_extraction.forwarded_header)?,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn request_context(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestContext {
        let principal = headers
            .get(&self.principal_header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        RequestContext {
            principal,
            peer_addr: peer.map(|addr| addr.ip()),
            forwarded_for: joined_header(headers, &self.forwarded_header),
        }
    }
}

/// Every line of a list-valued header, in order, joined with `", "`.
///
/// Undecodable bytes are kept lossily so they surface as an unparseable hop.
fn joined_header(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let lines: Vec<_> = headers
        .get_all(name)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()))
        .collect();
    (!lines.is_empty()).then(|| lines.join(", "))
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
        .map_err(|e| TollgateError::Config(format!("invalid header name '{}': {}", name, e)))
}

/// Build the router with all service routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/check/{policy}", post(check))
        .route("/v1/policies", get(list_policies))
        .route("/healthz", get(health_check))
        .with_state(state)
}

/// POST /v1/check/{policy}
///
/// Admits or rejects one request on behalf of the caller identified by the
/// request headers and peer address.
#[instrument(skip_all, fields(policy = %policy))]
async fn check(
    State(state): State<AppState>,
    Path(policy): Path<String>,
    request: Request,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ctx = state.request_context(request.headers(), peer);

    match state.limiter.check_request(&ctx, &policy).await {
        Ok(decision) => match Verdict::from(decision) {
            Verdict::Proceed { .. } => (StatusCode::OK, Json(decision)).into_response(),
            Verdict::Reject(rejection) => {
                info!(
                    retry_after_ms = rejection.retry_after_ms,
                    "Request throttled"
                );
                rejection.into_response()
            }
        },
        Err(TollgateError::Config(reason)) => {
            warn!(reason = %reason, "Check against unknown policy");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Unknown policy", "policy": policy })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Admission check failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal error" })),
            )
                .into_response()
        }
    }
}

/// GET /v1/policies
async fn list_policies(State(state): State<AppState>) -> Json<Vec<Policy>> {
    Json(state.limiter.registry().iter().cloned().collect())
}

/// GET /healthz
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let backend = state.limiter.backend();
    Json(json!({
        "status": "healthy",
        "backend": backend.name(),
        "tracked_windows": backend.tracked_windows(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
