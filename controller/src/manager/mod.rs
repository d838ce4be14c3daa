//! Capability interfaces backing the data consumed and produced by steps.
//!
//! Each manager covers one kind of data (secrets, state, outputs, ...). The
//! metadata API consumes them as a [`Managers`] bundle constructed per
//! request; any capability left unconfigured defaults to a reject-all
//! implementation so unavailability surfaces as a clean error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod store;
pub mod task;

pub use store::{KubeTaskStore, MemoryTaskStore, TaskStore};
pub use task::{
    MemoryConnectionManager, MemorySecretManager, RunParameterManager, StoreConditionManager,
    StoreEventManager, StoreSpecManager, StoreStateManager, StoreStepOutputManager,
};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("capability not available for this request")]
    Rejected,

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Secret {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutput {
    pub step: String,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub name: String,
    pub data: Value,
    pub timestamp: String,
}

#[async_trait]
pub trait SecretManager: Send + Sync {
    /// Fetches a secret by name for the run's tenant.
    async fn get(&self, name: &str) -> Result<Secret, ManagerError>;
}

#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Fetches a connection record by type and name for the run's domain.
    async fn get(&self, kind: &str, name: &str) -> Result<Connection, ManagerError>;
}

#[async_trait]
pub trait EventManager: Send + Sync {
    /// Appends a structured event to the step's ordered event log.
    async fn emit(&self, name: &str, data: Value) -> Result<Event, ManagerError>;
}

#[async_trait]
pub trait ParameterManager: Send + Sync {
    async fn get(&self, name: &str) -> Result<Value, ManagerError>;
    async fn list(&self) -> Result<BTreeMap<String, Value>, ManagerError>;
}

#[async_trait]
pub trait SpecManager: Send + Sync {
    /// Returns the step's stored (compile-evaluated) spec tree.
    async fn get(&self) -> Result<Value, ManagerError>;
}

#[async_trait]
pub trait ConditionManager: Send + Sync {
    /// Returns the step's stored `when` tree.
    async fn get(&self) -> Result<Value, ManagerError>;
}

#[async_trait]
pub trait StateManager: Send + Sync {
    /// Reads a state entry published by any step of the run.
    async fn get(&self, step_name: &str, key: &str) -> Result<Value, ManagerError>;

    /// Writes one of this step's own state entries.
    async fn set(&self, key: &str, value: Value) -> Result<(), ManagerError>;
}

#[async_trait]
pub trait StepOutputManager: Send + Sync {
    /// Reads an output published by any step of the run.
    async fn get(&self, step_name: &str, key: &str) -> Result<StepOutput, ManagerError>;

    /// Publishes one of this step's outputs. Write-once per key.
    async fn set(&self, key: &str, value: Value) -> Result<(), ManagerError>;
}

/// The capability bundle handed to each metadata API request.
#[derive(Clone)]
pub struct Managers {
    conditions: Arc<dyn ConditionManager>,
    connections: Arc<dyn ConnectionManager>,
    events: Arc<dyn EventManager>,
    parameters: Arc<dyn ParameterManager>,
    secrets: Arc<dyn SecretManager>,
    spec: Arc<dyn SpecManager>,
    state: Arc<dyn StateManager>,
    step_outputs: Arc<dyn StepOutputManager>,
}

impl Managers {
    pub fn builder() -> ManagersBuilder {
        ManagersBuilder::default()
    }

    pub fn conditions(&self) -> &dyn ConditionManager {
        self.conditions.as_ref()
    }

    pub fn connections(&self) -> &dyn ConnectionManager {
        self.connections.as_ref()
    }

    pub fn events(&self) -> &dyn EventManager {
        self.events.as_ref()
    }

    pub fn parameters(&self) -> &dyn ParameterManager {
        self.parameters.as_ref()
    }

    pub fn secrets(&self) -> &dyn SecretManager {
        self.secrets.as_ref()
    }

    pub fn spec(&self) -> &dyn SpecManager {
        self.spec.as_ref()
    }

    pub fn state(&self) -> &dyn StateManager {
        self.state.as_ref()
    }

    pub fn step_outputs(&self) -> &dyn StepOutputManager {
        self.step_outputs.as_ref()
    }
}

pub struct ManagersBuilder {
    conditions: Arc<dyn ConditionManager>,
    connections: Arc<dyn ConnectionManager>,
    events: Arc<dyn EventManager>,
    parameters: Arc<dyn ParameterManager>,
    secrets: Arc<dyn SecretManager>,
    spec: Arc<dyn SpecManager>,
    state: Arc<dyn StateManager>,
    step_outputs: Arc<dyn StepOutputManager>,
}

impl Default for ManagersBuilder {
    fn default() -> Self {
        let reject = Arc::new(Reject);
        ManagersBuilder {
            conditions: reject.clone(),
            connections: reject.clone(),
            events: reject.clone(),
            parameters: reject.clone(),
            secrets: reject.clone(),
            spec: reject.clone(),
            state: reject.clone(),
            step_outputs: reject,
        }
    }
}

impl ManagersBuilder {
    pub fn conditions(mut self, m: Arc<dyn ConditionManager>) -> Self {
        self.conditions = m;
        self
    }

    pub fn connections(mut self, m: Arc<dyn ConnectionManager>) -> Self {
        self.connections = m;
        self
    }

    pub fn events(mut self, m: Arc<dyn EventManager>) -> Self {
        self.events = m;
        self
    }

    pub fn parameters(mut self, m: Arc<dyn ParameterManager>) -> Self {
        self.parameters = m;
        self
    }

    pub fn secrets(mut self, m: Arc<dyn SecretManager>) -> Self {
        self.secrets = m;
        self
    }

    pub fn spec(mut self, m: Arc<dyn SpecManager>) -> Self {
        self.spec = m;
        self
    }

    pub fn state(mut self, m: Arc<dyn StateManager>) -> Self {
        self.state = m;
        self
    }

    pub fn step_outputs(mut self, m: Arc<dyn StepOutputManager>) -> Self {
        self.step_outputs = m;
        self
    }

    pub fn build(self) -> Managers {
        Managers {
            conditions: self.conditions,
            connections: self.connections,
            events: self.events,
            parameters: self.parameters,
            secrets: self.secrets,
            spec: self.spec,
            state: self.state,
            step_outputs: self.step_outputs,
        }
    }
}

/// Default implementation for unconfigured capabilities.
struct Reject;

#[async_trait]
impl SecretManager for Reject {
    async fn get(&self, _name: &str) -> Result<Secret, ManagerError> {
        Err(ManagerError::Rejected)
    }
}

#[async_trait]
impl ConnectionManager for Reject {
    async fn get(&self, _kind: &str, _name: &str) -> Result<Connection, ManagerError> {
        Err(ManagerError::Rejected)
    }
}

#[async_trait]
impl EventManager for Reject {
    async fn emit(&self, _name: &str, _data: Value) -> Result<Event, ManagerError> {
        Err(ManagerError::Rejected)
    }
}

#[async_trait]
impl ParameterManager for Reject {
    async fn get(&self, _name: &str) -> Result<Value, ManagerError> {
        Err(ManagerError::Rejected)
    }

    async fn list(&self) -> Result<BTreeMap<String, Value>, ManagerError> {
        Err(ManagerError::Rejected)
    }
}

#[async_trait]
impl SpecManager for Reject {
    async fn get(&self) -> Result<Value, ManagerError> {
        Err(ManagerError::Rejected)
    }
}

#[async_trait]
impl ConditionManager for Reject {
    async fn get(&self) -> Result<Value, ManagerError> {
        Err(ManagerError::Rejected)
    }
}

#[async_trait]
impl StateManager for Reject {
    async fn get(&self, _step_name: &str, _key: &str) -> Result<Value, ManagerError> {
        Err(ManagerError::Rejected)
    }

    async fn set(&self, _key: &str, _value: Value) -> Result<(), ManagerError> {
        Err(ManagerError::Rejected)
    }
}

#[async_trait]
impl StepOutputManager for Reject {
    async fn get(&self, _step_name: &str, _key: &str) -> Result<StepOutput, ManagerError> {
        Err(ManagerError::Rejected)
    }

    async fn set(&self, _key: &str, _value: Value) -> Result<(), ManagerError> {
        Err(ManagerError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_capability_rejects() {
        let managers = Managers::builder().build();

        assert!(matches!(
            managers.secrets().get("anything").await,
            Err(ManagerError::Rejected)
        ));
        assert!(matches!(
            managers.state().set("k", Value::Null).await,
            Err(ManagerError::Rejected)
        ));
    }
}
