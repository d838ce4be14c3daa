/*
 * Relay Workflow Controller - Metadata API Service
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

//! Metadata API Service - the per-pod-identity HTTP surface steps query
//! for their specs, secrets, connections, outputs, and state.

use relay_controller::metadataapi::{self, ApiState, KubeManagerFactory};
use relay_controller::ControllerConfig;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay_controller=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Relay Metadata API v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let config = load_controller_config();

    // The namespace this instance serves, from the downward API.
    let namespace = std::env::var("RELAY_NAMESPACE").unwrap_or_else(|_| "default".to_string());
    info!("Serving metadata for namespace {}", namespace);

    // The secret and connection backends are deployment-specific; left
    // unconfigured, those capabilities reject cleanly.
    let factory = KubeManagerFactory::new(client, &namespace);

    let state = ApiState {
        factory: Arc::new(factory),
        trusted_proxy_header: config.metadata_api.trusted_proxy_header.clone(),
    };

    metadataapi::serve(state, &config.metadata_api.bind_addr).await
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or("/config/config.yaml");

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded configuration from {}", config_path);
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
