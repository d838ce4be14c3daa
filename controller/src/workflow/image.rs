//! Container image metadata for tool-injected steps.
//!
//! When a run references a tenant, step containers are started through the
//! shared `/data/entrypoint` tool, and the argv the tool receives is derived
//! from the user's command override or the image's own entrypoint/cmd.

use super::types::{Error, Result};
use crate::model::{ENTRYPOINT_COMMAND_ARG_SEPARATOR, ENTRYPOINT_COMMAND_FLAG};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Entrypoint and cmd recorded in an image's config blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

#[async_trait]
pub trait ImageMetadata: Send + Sync {
    async fn config(&self, image: &str) -> Result<ImageConfig>;
}

/// Derives the argv handed to the injected entrypoint tool.
///
/// - A user `command` override wins outright (image config is not consulted).
/// - Otherwise the image entrypoint leads and the image cmd follows it.
/// - Otherwise the image cmd leads.
pub fn entrypoint_argv(command: &[String], args: &[String], image: &ImageConfig) -> Vec<String> {
    let mut argv = Vec::new();

    let lead: &[String] = if !command.is_empty() {
        command
    } else if !image.entrypoint.is_empty() {
        &image.entrypoint
    } else {
        &image.cmd
    };

    if lead.is_empty() {
        return argv;
    }

    argv.push(ENTRYPOINT_COMMAND_FLAG.to_string());
    argv.push(lead[0].clone());
    argv.push(ENTRYPOINT_COMMAND_ARG_SEPARATOR.to_string());
    argv.extend_from_slice(&lead[1..]);

    // The image cmd rides along only when the image entrypoint led.
    if command.is_empty() && !image.entrypoint.is_empty() {
        argv.extend_from_slice(&image.cmd);
    }

    argv.extend_from_slice(args);
    argv
}

/// Fixed image table for tests and local development.
#[derive(Default)]
pub struct StaticImageMetadata {
    images: BTreeMap<String, ImageConfig>,
}

impl StaticImageMetadata {
    pub fn new(images: BTreeMap<String, ImageConfig>) -> Self {
        StaticImageMetadata { images }
    }
}

#[async_trait]
impl ImageMetadata for StaticImageMetadata {
    async fn config(&self, image: &str) -> Result<ImageConfig> {
        self.images
            .get(image)
            .cloned()
            .ok_or_else(|| Error::execution(format!("unknown image {image:?}")))
    }
}

/// Anonymous registry v2 client. Private registries are reached through the
/// cluster pull-secret path and are out of scope here.
pub struct RegistryImageMetadata {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    config: ManifestConfig,
}

#[derive(Debug, Deserialize)]
struct ManifestConfig {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct ConfigDocument {
    config: ConfigBlock,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct ConfigBlock {
    #[serde(default)]
    entrypoint: Vec<String>,
    #[serde(default)]
    cmd: Vec<String>,
}

/// `registry/repository:tag` with Docker Hub defaults applied.
fn parse_reference(image: &str) -> (String, String, String) {
    let (rest, tag) = match image.rsplit_once(':') {
        // A colon inside the last path segment is a tag; one before a slash
        // is a registry port.
        Some((rest, tag)) if !tag.contains('/') => (rest, tag),
        _ => (image, "latest"),
    };

    match rest.split_once('/') {
        Some((host, path)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            (host.to_string(), path.to_string(), tag.to_string())
        }
        _ => (
            "registry-1.docker.io".to_string(),
            if rest.contains('/') {
                rest.to_string()
            } else {
                format!("library/{rest}")
            },
            tag.to_string(),
        ),
    }
}

impl RegistryImageMetadata {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::execution(e))?;
        Ok(RegistryImageMetadata { http })
    }

    async fn get_json(&self, url: &str, accept: &str, repository: &str) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, accept)
            .send()
            .await
            .map_err(|e| Error::execution(e))?;

        let response = if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let token = self.bearer_token(&response, repository).await?;
            self.http
                .get(url)
                .header(reqwest::header::ACCEPT, accept)
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| Error::execution(e))?
        } else {
            response
        };

        if !response.status().is_success() {
            return Err(Error::execution(format!(
                "registry returned {} for {url}",
                response.status()
            )));
        }

        response.json().await.map_err(|e| Error::execution(e))
    }

    /// Follows the standard anonymous token dance advertised through the
    /// WWW-Authenticate challenge.
    async fn bearer_token(&self, response: &reqwest::Response, repository: &str) -> Result<String> {
        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::execution("registry challenge missing WWW-Authenticate"))?;

        let field = |name: &str| -> Option<String> {
            let marker = format!("{name}=\"");
            let start = challenge.find(&marker)? + marker.len();
            let end = challenge[start..].find('"')? + start;
            Some(challenge[start..end].to_string())
        };

        let realm =
            field("realm").ok_or_else(|| Error::execution("registry challenge missing realm"))?;
        let mut token_url = format!("{realm}?scope=repository:{repository}:pull");
        if let Some(service) = field("service") {
            token_url.push_str(&format!("&service={service}"));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let token: TokenResponse = self
            .http
            .get(&token_url)
            .send()
            .await
            .map_err(|e| Error::execution(e))?
            .json()
            .await
            .map_err(|e| Error::execution(e))?;

        Ok(token.token)
    }
}

#[async_trait]
impl ImageMetadata for RegistryImageMetadata {
    async fn config(&self, image: &str) -> Result<ImageConfig> {
        let (registry, repository, tag) = parse_reference(image);

        let manifest_url = format!("https://{registry}/v2/{repository}/manifests/{tag}");
        let manifest: ManifestDocument = serde_json::from_value(
            self.get_json(
                &manifest_url,
                "application/vnd.docker.distribution.manifest.v2+json, \
                 application/vnd.oci.image.manifest.v1+json",
                &repository,
            )
            .await?,
        )?;

        let blob_url = format!(
            "https://{registry}/v2/{repository}/blobs/{}",
            manifest.config.digest
        );
        let config: ConfigDocument = serde_json::from_value(
            self.get_json(&blob_url, "application/octet-stream", &repository)
                .await?,
        )?;

        Ok(ImageConfig {
            entrypoint: config.config.entrypoint,
            cmd: config.config.cmd,
        })
    }
}
