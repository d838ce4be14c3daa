//! Per-pod-identity HTTP service consumed by step containers.
//!
//! Each request is attributed to a step by resolving the caller's IP to a
//! pod, reading the pod's task-hash and run labels, and binding a fresh
//! [`Managers`] bundle for that step. Handlers never see Kubernetes; they
//! speak to the managers only.

use crate::expr::EvaluationError;
use crate::manager::{Managers, ManagerError};
use crate::model::Step;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod api;
pub mod kube;

pub use kube::KubeManagerFactory;

/// Everything known about the caller once its pod has been resolved.
#[derive(Clone)]
pub struct CallerContext {
    pub step: Step,
    pub env: BTreeMap<String, Value>,
    pub managers: Managers,
}

/// Builds the per-request manager bundle for a caller IP.
#[async_trait]
pub trait ManagerFactory: Send + Sync {
    async fn for_caller(&self, ip: IpAddr) -> Result<CallerContext, ApiError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("caller could not be resolved to a step")]
    UnknownCaller,

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownCaller => StatusCode::NOT_FOUND,
            ApiError::Manager(ManagerError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Manager(ManagerError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Manager(ManagerError::Rejected) => StatusCode::FORBIDDEN,
            ApiError::Manager(ManagerError::Encoding(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Manager(ManagerError::Kube(_) | ManagerError::Transport(_)) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Evaluation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };

        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub factory: Arc<dyn ManagerFactory>,

    /// When set, the right-most entry of this header is trusted as the
    /// client IP. Only configure behind the in-cluster proxy.
    pub trusted_proxy_header: Option<String>,
}

/// Extractor resolving the request to a step-bound manager bundle.
pub struct Caller(pub CallerContext);

impl FromRequestParts<ApiState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let ip = client_ip(parts, state).ok_or(ApiError::UnknownCaller)?;
        let context = state.factory.for_caller(ip).await?;
        Ok(Caller(context))
    }
}

fn client_ip(parts: &Parts, state: &ApiState) -> Option<IpAddr> {
    if let Some(header) = &state.trusted_proxy_header {
        if let Some(value) = parts.headers.get(header).and_then(|v| v.to_str().ok()) {
            // Proxies append; only the right-most entry is ours to trust.
            if let Some(ip) = value
                .rsplit(',')
                .next()
                .and_then(|entry| entry.trim().parse().ok())
            {
                return Some(ip);
            }
        }
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/spec", get(api::get_spec))
        // Legacy alias published to pods as SPEC_URL.
        .route("/specs", get(api::get_spec))
        .route("/environment", get(api::get_environment))
        .route("/environment/{name}", get(api::get_environment_variable))
        .route("/conditions", get(api::get_conditions))
        .route("/secrets/{name}", get(api::get_secret))
        .route("/connections/{type}/{name}", get(api::get_connection))
        .route("/state/{step}/{key}", get(api::get_state))
        .route("/state/{key}", put(api::put_state))
        .route("/outputs/{step}/{key}", get(api::get_output))
        .route("/outputs/{key}", put(api::put_output))
        .route("/events", post(api::post_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the metadata API until the process is shut down.
pub async fn serve(state: ApiState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("metadata API listening on {}", bind_addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
