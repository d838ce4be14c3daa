//! Workflow Controller Configuration
//!
//! Loaded from a mounted file at startup; every field has a default so the
//! controller can come up in a development cluster with no config at all.

use serde::{Deserialize, Serialize};

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Metadata API configuration
    #[serde(default, rename = "metadataApi")]
    pub metadata_api: MetadataApiConfig,

    /// Image pull secret (`namespace/name`) copied into each run namespace
    /// for system containers.
    #[serde(default, rename = "imagePullSecret")]
    pub image_pull_secret: Option<String>,

    /// Nameservers handed to step pods through the pod DNS config.
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,

    /// Webhook server configuration
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetadataApiConfig {
    /// URL injected into step containers as `METADATA_API_URL`.
    #[serde(default = "default_metadata_api_url")]
    pub url: String,

    /// Address the metadata API binds to.
    #[serde(default = "default_metadata_api_bind", rename = "bindAddr")]
    pub bind_addr: String,

    /// When set (e.g. `X-Forwarded-For`), the right-most entry of this
    /// header is trusted as the client IP instead of the socket peer. Only
    /// enable behind the in-cluster proxy.
    #[serde(default, rename = "trustedProxyHeader")]
    pub trusted_proxy_header: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Address the controller's HTTP surface (health + admission) binds to.
    #[serde(default = "default_webhook_bind", rename = "bindAddr")]
    pub bind_addr: String,
}

fn default_metadata_api_url() -> String {
    // In-cluster Service name; port 7000 per the metadata-api-allow policy.
    "http://metadata-api:7000".to_string()
}

fn default_metadata_api_bind() -> String {
    "0.0.0.0:7000".to_string()
}

fn default_webhook_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_nameservers() -> Vec<String> {
    vec![
        "1.1.1.1".to_string(),
        "1.0.0.1".to_string(),
        "8.8.8.8".to_string(),
    ]
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            metadata_api: MetadataApiConfig::default(),
            image_pull_secret: None,
            nameservers: default_nameservers(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl Default for MetadataApiConfig {
    fn default() -> Self {
        MetadataApiConfig {
            url: default_metadata_api_url(),
            bind_addr: default_metadata_api_bind(),
            trusted_proxy_header: None,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            bind_addr: default_webhook_bind(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted file (e.g. `/config/config.yaml`)
    pub fn from_mounted_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControllerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.metadata_api.url.starts_with("http://")
            && !self.metadata_api.url.starts_with("https://")
        {
            return Err(format!(
                "metadataApi.url must be an http(s) URL, got {:?}",
                self.metadata_api.url
            ));
        }

        if let Some(pull_secret) = &self.image_pull_secret {
            if pull_secret.is_empty() {
                return Err("imagePullSecret must not be empty when set".to_string());
            }
        }

        if self.nameservers.is_empty() {
            return Err("at least one nameserver is required".to_string());
        }

        Ok(())
    }

    /// Splits the configured image pull secret into `(namespace, name)`.
    /// A bare name refers to the given default namespace.
    pub fn image_pull_secret_key(&self, default_namespace: &str) -> Option<(String, String)> {
        let raw = self.image_pull_secret.as_deref()?;
        Some(match raw.split_once('/') {
            Some((ns, name)) if !ns.is_empty() => (ns.to_string(), name.to_string()),
            Some((_, name)) => (default_namespace.to_string(), name.to_string()),
            None => (default_namespace.to_string(), raw.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.nameservers.len(), 3);
        assert!(config.metadata_api.url.starts_with("http://"));
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
metadataApi:
  url: http://metadata-api.relay-system:7000
  trustedProxyHeader: X-Forwarded-For
imagePullSecret: relay-system/registry-credentials
nameservers: ["10.0.0.10"]
"#;

        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.metadata_api.trusted_proxy_header.as_deref(),
            Some("X-Forwarded-For")
        );
        assert_eq!(
            config.image_pull_secret_key("fallback"),
            Some(("relay-system".to_string(), "registry-credentials".to_string()))
        );
        assert_eq!(config.nameservers, vec!["10.0.0.10".to_string()]);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut config = ControllerConfig::default();
        config.metadata_api.url = "metadata-api:7000".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pull_secret_defaults_to_namespace() {
        let mut config = ControllerConfig::default();
        config.image_pull_secret = Some("registry-credentials".to_string());
        assert_eq!(
            config.image_pull_secret_key("relay-system"),
            Some(("relay-system".to_string(), "registry-credentials".to_string()))
        );
    }
}
