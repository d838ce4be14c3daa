//! Concrete managers bound to a single step of a run.

use super::store::{Mutation, TaskStore};
use super::{
    Connection, ConnectionManager, ConditionManager, Event, EventManager, ManagerError,
    ParameterManager, Secret, SecretManager, SpecManager, StateManager, StepOutput,
    StepOutputManager,
};
use crate::model::{Step, NEBULA_CONDITIONALS_KEY, NEBULA_SPEC_FILE};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const STATE_KEY_PREFIX: &str = "state.";
pub const OUTPUT_KEY_PREFIX: &str = "output.";
pub const EVENTS_KEY: &str = "events";

pub struct StoreStateManager {
    step: Step,
    store: Arc<dyn TaskStore>,
}

impl StoreStateManager {
    pub fn new(step: Step, store: Arc<dyn TaskStore>) -> Self {
        StoreStateManager { step, store }
    }
}

#[async_trait]
impl StateManager for StoreStateManager {
    async fn get(&self, step_name: &str, key: &str) -> Result<Value, ManagerError> {
        let hash = Step::new(&self.step.run.id, step_name).hash();
        let raw = self
            .store
            .get(&hash, &format!("{STATE_KEY_PREFIX}{key}"))
            .await?
            .ok_or(ManagerError::NotFound)?;

        Ok(serde_json::from_str(&raw)?)
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ManagerError> {
        self.store
            .apply(
                &self.step.hash(),
                Mutation::Put {
                    key: format!("{STATE_KEY_PREFIX}{key}"),
                    value: serde_json::to_string(&value)?,
                },
            )
            .await
    }
}

pub struct StoreStepOutputManager {
    step: Step,
    store: Arc<dyn TaskStore>,
}

impl StoreStepOutputManager {
    pub fn new(step: Step, store: Arc<dyn TaskStore>) -> Self {
        StoreStepOutputManager { step, store }
    }
}

#[async_trait]
impl StepOutputManager for StoreStepOutputManager {
    async fn get(&self, step_name: &str, key: &str) -> Result<StepOutput, ManagerError> {
        let hash = Step::new(&self.step.run.id, step_name).hash();
        let raw = self
            .store
            .get(&hash, &format!("{OUTPUT_KEY_PREFIX}{key}"))
            .await?
            .ok_or(ManagerError::NotFound)?;

        Ok(StepOutput {
            step: step_name.to_owned(),
            name: key.to_owned(),
            value: serde_json::from_str(&raw)?,
        })
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ManagerError> {
        self.store
            .apply(
                &self.step.hash(),
                Mutation::PutOnce {
                    key: format!("{OUTPUT_KEY_PREFIX}{key}"),
                    value: serde_json::to_string(&value)?,
                },
            )
            .await
    }
}

pub struct StoreSpecManager {
    step: Step,
    store: Arc<dyn TaskStore>,
}

impl StoreSpecManager {
    pub fn new(step: Step, store: Arc<dyn TaskStore>) -> Self {
        StoreSpecManager { step, store }
    }
}

#[async_trait]
impl SpecManager for StoreSpecManager {
    async fn get(&self) -> Result<Value, ManagerError> {
        let raw = self
            .store
            .get(&self.step.hash(), NEBULA_SPEC_FILE)
            .await?
            .ok_or(ManagerError::NotFound)?;

        Ok(serde_json::from_str(&raw)?)
    }
}

pub struct StoreConditionManager {
    step: Step,
    store: Arc<dyn TaskStore>,
}

impl StoreConditionManager {
    pub fn new(step: Step, store: Arc<dyn TaskStore>) -> Self {
        StoreConditionManager { step, store }
    }
}

#[async_trait]
impl ConditionManager for StoreConditionManager {
    async fn get(&self) -> Result<Value, ManagerError> {
        let raw = self
            .store
            .get(&self.step.hash(), NEBULA_CONDITIONALS_KEY)
            .await?
            .ok_or(ManagerError::NotFound)?;

        Ok(serde_json::from_str(&raw)?)
    }
}

pub struct StoreEventManager {
    step: Step,
    store: Arc<dyn TaskStore>,
}

impl StoreEventManager {
    pub fn new(step: Step, store: Arc<dyn TaskStore>) -> Self {
        StoreEventManager { step, store }
    }
}

#[async_trait]
impl EventManager for StoreEventManager {
    async fn emit(&self, name: &str, data: Value) -> Result<Event, ManagerError> {
        let event = Event {
            name: name.to_owned(),
            data,
            timestamp: Utc::now().to_rfc3339(),
        };

        self.store
            .apply(
                &self.step.hash(),
                Mutation::Push {
                    key: EVENTS_KEY.to_owned(),
                    value: serde_json::to_value(&event)?,
                },
            )
            .await?;

        Ok(event)
    }
}

/// Parameters resolved from the run document: run-level overrides take
/// precedence over workflow defaults.
pub struct RunParameterManager {
    merged: BTreeMap<String, Value>,
}

impl RunParameterManager {
    pub fn new(
        workflow_defaults: &BTreeMap<String, Value>,
        run_overrides: &BTreeMap<String, Value>,
    ) -> Self {
        let mut merged = workflow_defaults.clone();
        merged.extend(run_overrides.clone());
        RunParameterManager { merged }
    }
}

#[async_trait]
impl ParameterManager for RunParameterManager {
    async fn get(&self, name: &str) -> Result<Value, ManagerError> {
        self.merged.get(name).cloned().ok_or(ManagerError::NotFound)
    }

    async fn list(&self) -> Result<BTreeMap<String, Value>, ManagerError> {
        Ok(self.merged.clone())
    }
}

/// In-memory secret source for tests and local development.
#[derive(Default)]
pub struct MemorySecretManager {
    secrets: BTreeMap<String, String>,
}

impl MemorySecretManager {
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        MemorySecretManager { secrets }
    }
}

#[async_trait]
impl SecretManager for MemorySecretManager {
    async fn get(&self, name: &str) -> Result<Secret, ManagerError> {
        let value = self.secrets.get(name).ok_or(ManagerError::NotFound)?;
        Ok(Secret {
            key: name.to_owned(),
            value: value.clone(),
        })
    }
}

/// In-memory connection source for tests and local development.
#[derive(Default)]
pub struct MemoryConnectionManager {
    connections: BTreeMap<(String, String), Value>,
}

impl MemoryConnectionManager {
    pub fn new(connections: BTreeMap<(String, String), Value>) -> Self {
        MemoryConnectionManager { connections }
    }
}

#[async_trait]
impl ConnectionManager for MemoryConnectionManager {
    async fn get(&self, kind: &str, name: &str) -> Result<Connection, ManagerError> {
        let value = self
            .connections
            .get(&(kind.to_owned(), name.to_owned()))
            .ok_or(ManagerError::NotFound)?;

        Ok(Connection {
            kind: kind.to_owned(),
            name: name.to_owned(),
            value: value.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemoryTaskStore;
    use serde_json::json;

    fn managers_for(
        store: &Arc<MemoryTaskStore>,
        run: &str,
        step: &str,
    ) -> (StoreStateManager, StoreStepOutputManager) {
        let step = Step::new(run, step);
        (
            StoreStateManager::new(step.clone(), store.clone() as Arc<dyn TaskStore>),
            StoreStepOutputManager::new(step, store.clone() as Arc<dyn TaskStore>),
        )
    }

    #[tokio::test]
    async fn test_outputs_are_scoped_by_step() {
        let store = Arc::new(MemoryTaskStore::new());
        let (_, om1) = managers_for(&store, "foo", "bar");
        let (_, om2) = managers_for(&store, "foo", "baz");

        om1.set("key-a", json!("value-a-step-1")).await.unwrap();
        om2.set("key-a", json!("value-a-step-2")).await.unwrap();
        om1.set("key-b", json!("value-b-step-1")).await.unwrap();

        for om in [&om1, &om2] {
            let out = om.get("bar", "key-a").await.unwrap();
            assert_eq!(out.value, json!("value-a-step-1"));

            let out = om.get("bar", "key-b").await.unwrap();
            assert_eq!(out.value, json!("value-b-step-1"));

            let out = om.get("baz", "key-a").await.unwrap();
            assert_eq!(out.value, json!("value-a-step-2"));

            assert!(matches!(
                om.get("baz", "key-b").await,
                Err(ManagerError::NotFound)
            ));
        }
    }

    #[tokio::test]
    async fn test_outputs_are_write_once() {
        let store = Arc::new(MemoryTaskStore::new());
        let (_, om) = managers_for(&store, "foo", "bar");

        om.set("k", json!("first")).await.unwrap();
        assert!(matches!(
            om.set("k", json!("second")).await,
            Err(ManagerError::Conflict(_))
        ));
        assert_eq!(om.get("bar", "k").await.unwrap().value, json!("first"));
    }

    #[tokio::test]
    async fn test_state_read_your_writes() {
        let store = Arc::new(MemoryTaskStore::new());
        let (sm, _) = managers_for(&store, "foo", "bar");

        sm.set("cursor", json!({"page": 3})).await.unwrap();
        assert_eq!(sm.get("bar", "cursor").await.unwrap(), json!({"page": 3}));

        // State is mutable, unlike outputs.
        sm.set("cursor", json!({"page": 4})).await.unwrap();
        assert_eq!(sm.get("bar", "cursor").await.unwrap(), json!({"page": 4}));
    }

    #[tokio::test]
    async fn test_parameter_precedence() {
        let defaults = BTreeMap::from([
            ("a".to_owned(), json!(1)),
            ("b".to_owned(), json!(1)),
        ]);
        let overrides = BTreeMap::from([("b".to_owned(), json!(2))]);

        let pm = RunParameterManager::new(&defaults, &overrides);
        assert_eq!(pm.get("a").await.unwrap(), json!(1));
        assert_eq!(pm.get("b").await.unwrap(), json!(2));
        assert!(matches!(pm.get("c").await, Err(ManagerError::NotFound)));
    }

    #[tokio::test]
    async fn test_events_are_ordered() {
        let store = Arc::new(MemoryTaskStore::new());
        let step = Step::new("foo", "bar");
        let em = StoreEventManager::new(step.clone(), store.clone() as Arc<dyn TaskStore>);

        em.emit("started", json!({"n": 1})).await.unwrap();
        em.emit("progress", json!({"n": 2})).await.unwrap();

        let raw = store.get(&step.hash(), "events").await.unwrap().unwrap();
        let events: Vec<Event> = serde_json::from_str(&raw).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "started");
        assert_eq!(events[1].name, "progress");
    }
}
