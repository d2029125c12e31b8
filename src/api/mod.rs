//! Shared HTTP server plumbing
//!
//! Error mapping, health checks, the internal secret check and the serve loop
//! used by the coordinator, the dispatcher and the executor.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::gate::GateError;
use crate::http::SECRET_HEADER;
use crate::lifecycle::LifecycleError;
use crate::store::StoreError;

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

/// Errors returned by HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::BadGateway(message.into())
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::GatewayTimeout(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match self {
            Self::BadRequest(m) => ("invalid_argument", m),
            Self::Unauthorized(m) => ("unauthorized", m),
            Self::NotFound(m) => ("not_found", m),
            Self::Conflict(m) => ("conflict", m),
            Self::BadGateway(m) => ("bad_gateway", m),
            Self::GatewayTimeout(m) => ("timeout", m),
            Self::Internal(m) => ("internal", m),
        };
        let body = ErrorEnvelope {
            error: ErrorBody { code, message },
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::not_found(e.to_string()),
            StoreError::Lifecycle(inner) => inner.into(),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotCancellable(_) | LifecycleError::InvalidTransition { .. } => {
                ApiError::conflict(e.to_string())
            }
            LifecycleError::ShardOutOfRange { .. } | LifecycleError::EmptyPlan => {
                ApiError::bad_request(e.to_string())
            }
        }
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

/// Reject the request unless it carries the configured secret.
///
/// No configured secret means the check is disabled.
pub fn check_secret(headers: &HeaderMap, secret: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = secret.filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        warn!("Rejected internal request with missing or invalid secret");
        Err(ApiError::unauthorized("invalid internal secret"))
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn readyz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ready" }))
}

/// Liveness and readiness checks
pub fn health_routes<S: Clone + Send + Sync + 'static>() -> Router<S> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Resolves once `true` is sent or the sender is dropped
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Serve `app` until `shutdown` resolves
pub async fn serve(
    name: &str,
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("{} listening on http://{}", name, addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("{} stopped", name);
    Ok(())
}
