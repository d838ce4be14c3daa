use super::config::ControllerConfig;
use super::image::ImageMetadata;
use crate::storage::BlobStore;
use kube::Client;
use std::sync::Arc;

// Error type for the controller
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Controller configuration error: {0}")]
    ConfigError(String),

    /// Terminal: the run is failed and never retried.
    #[error("Task spec evaluation error: {0}")]
    TaskSpecEvaluationError(#[from] crate::expr::EvaluationError),

    /// Retriable: surfaced to the runtime for a level-triggered requeue.
    #[error("Workflow execution error: {0}")]
    WorkflowExecutionError(String),
}

impl Error {
    /// Wraps a downstream failure the way every initialization error is
    /// reported: as a workflow execution error eligible for requeue.
    pub fn execution(err: impl std::fmt::Display) -> Self {
        Error::WorkflowExecutionError(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// Context shared across controller operations
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<ControllerConfig>,
    pub storage: Arc<dyn BlobStore>,
    pub images: Arc<dyn ImageMetadata>,
}
