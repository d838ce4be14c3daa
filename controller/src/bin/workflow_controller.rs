/*
 * Relay Workflow Controller - Controller Service
 * Copyright (C) 2025 Relay
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Controller Service - Kubernetes Controller for `WorkflowRun` CRDs
//!
//! This service manages the lifecycle of workflow runs by:
//! - Watching for `WorkflowRun` custom resources
//! - Compiling step graphs into executor pipelines and launching them
//! - Aggregating status and archiving step logs
//! - Serving the pod-mutation admission webhook and health endpoints

use axum::{
    response::Json,
    routing::{get, post},
    Router,
};
use relay_controller::storage::MemoryBlobStore;
use relay_controller::workflow::image::RegistryImageMetadata;
use relay_controller::{admission, run_workflow_controller, Context, ControllerConfig};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting Relay Workflow Controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let config = Arc::new(load_controller_config());

    // TODO: wire the deployment's blob store once the storage chart lands;
    // until then archived logs stay in process memory.
    warn!("no blob store configured; using the in-memory store");
    let storage = Arc::new(MemoryBlobStore::new());

    let context = Arc::new(Context {
        client: client.clone(),
        config: config.clone(),
        storage,
        images: Arc::new(RegistryImageMetadata::new()?),
    });

    // Start the controller in the background
    let controller_handle = {
        let client = client.clone();
        let context = context.clone();
        tokio::spawn(async move {
            if let Err(e) = run_workflow_controller(client, context).await {
                error!("Controller error: {}", e);
            }
        })
    };

    // Build the HTTP router: health endpoints plus the admission webhook.
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/mutate", post(mutate_handler))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(60))),
        );

    let listener = tokio::net::TcpListener::bind(&config.webhook.bind_addr).await?;
    info!(
        "Controller HTTP server listening on {}",
        config.webhook.bind_addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("Controller service stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "workflow-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "workflow-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Mutating webhook endpoint for step pods requesting tool injection.
async fn mutate_handler(Json(review): Json<Value>) -> Json<Value> {
    Json(admission::review(&review))
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or("/config/config.yaml");

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            if let Err(validation_error) = cfg.validate() {
                warn!(
                    "Configuration at {} is invalid: {}. Using defaults.",
                    config_path, validation_error
                );
                return ControllerConfig::default();
            }
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
