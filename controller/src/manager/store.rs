//! Per-task key-value storage.
//!
//! Every task hash owns one ConfigMap whose data carries both the
//! compiler-written keys (`spec.json`, `entrypoint.sh`, `conditionals`) and
//! the runtime keys written through the metadata API (`state.<key>`,
//! `output.<key>`, `events`). Writes go through read-modify-write with a
//! resourceVersion precondition, retried with bounded jittered backoff on
//! conflict.

use super::ManagerError;
use crate::model::StepHash;
use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use rand::Rng;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const CONFLICT_RETRY_LIMIT: u32 = 5;
const CONFLICT_RETRY_BASE: Duration = Duration::from_millis(25);

/// One mutation of a task's KV data, applied under the store's transactional
/// semantics.
pub enum Mutation {
    Put { key: String, value: String },
    PutOnce { key: String, value: String },
    Push { key: String, value: Value },
}

impl Mutation {
    fn apply(&self, data: &mut BTreeMap<String, String>) -> Result<(), ManagerError> {
        match self {
            Mutation::Put { key, value } => {
                data.insert(key.clone(), value.clone());
            }
            Mutation::PutOnce { key, value } => {
                if data.contains_key(key) {
                    return Err(ManagerError::Conflict(format!(
                        "key {key:?} is already set"
                    )));
                }
                data.insert(key.clone(), value.clone());
            }
            Mutation::Push { key, value } => {
                let mut items: Vec<Value> = match data.get(key) {
                    Some(raw) => serde_json::from_str(raw)?,
                    None => Vec::new(),
                };
                items.push(value.clone());
                data.insert(key.clone(), serde_json::to_string(&items)?);
            }
        }

        Ok(())
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, hash: &StepHash, key: &str) -> Result<Option<String>, ManagerError>;
    async fn apply(&self, hash: &StepHash, mutation: Mutation) -> Result<(), ManagerError>;
}

/// In-memory store used by tests and local runs.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<String, BTreeMap<String, String>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, hash: &StepHash, key: &str) -> Result<Option<String>, ManagerError> {
        Ok(self
            .tasks
            .get(&hash.hex())
            .and_then(|data| data.get(key).cloned()))
    }

    async fn apply(&self, hash: &StepHash, mutation: Mutation) -> Result<(), ManagerError> {
        let mut entry = self.tasks.entry(hash.hex()).or_default();
        mutation.apply(entry.value_mut())
    }
}

/// ConfigMap-backed store for a single namespace.
pub struct KubeTaskStore {
    configmaps: Api<ConfigMap>,
}

impl KubeTaskStore {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        KubeTaskStore {
            configmaps: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl TaskStore for KubeTaskStore {
    async fn get(&self, hash: &StepHash, key: &str) -> Result<Option<String>, ManagerError> {
        match self.configmaps.get_opt(&hash.hex()).await? {
            Some(cm) => Ok(cm.data.and_then(|mut data| data.remove(key))),
            None => Ok(None),
        }
    }

    async fn apply(&self, hash: &StepHash, mutation: Mutation) -> Result<(), ManagerError> {
        let name = hash.hex();

        for attempt in 0..CONFLICT_RETRY_LIMIT {
            if attempt > 0 {
                backoff(attempt).await;
            }

            match self.configmaps.get_opt(&name).await? {
                Some(mut cm) => {
                    let data = cm.data.get_or_insert_with(BTreeMap::new);
                    mutation.apply(data)?;

                    // replace() carries the observed resourceVersion, so a
                    // concurrent writer turns this into a 409 we retry.
                    match self
                        .configmaps
                        .replace(&name, &PostParams::default(), &cm)
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {
                            debug!("conflict updating task store {}, retrying", name);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                None => {
                    let mut data = BTreeMap::new();
                    mutation.apply(&mut data)?;

                    let cm = ConfigMap {
                        metadata: ObjectMeta {
                            name: Some(name.clone()),
                            ..Default::default()
                        },
                        data: Some(data),
                        ..Default::default()
                    };

                    match self.configmaps.create(&PostParams::default(), &cm).await {
                        Ok(_) => return Ok(()),
                        Err(kube::Error::Api(ae)) if ae.code == 409 => {
                            debug!("task store {} created concurrently, retrying", name);
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Err(ManagerError::Conflict(format!(
            "gave up updating task store {name} after {CONFLICT_RETRY_LIMIT} attempts"
        )))
    }
}

async fn backoff(attempt: u32) {
    let jitter = rand::thread_rng().gen_range(0..25);
    let delay = CONFLICT_RETRY_BASE * 2u32.saturating_pow(attempt - 1)
        + Duration::from_millis(jitter);
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryTaskStore::new();
        let hash = Step::new("r", "a").hash();

        store
            .apply(
                &hash,
                Mutation::Put {
                    key: "state.k".to_owned(),
                    value: "\"v\"".to_owned(),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            store.get(&hash, "state.k").await.unwrap(),
            Some("\"v\"".to_owned())
        );
        assert_eq!(store.get(&hash, "state.other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_once_conflicts_on_second_write() {
        let store = MemoryTaskStore::new();
        let hash = Step::new("r", "a").hash();

        let first = Mutation::PutOnce {
            key: "output.k".to_owned(),
            value: "\"first\"".to_owned(),
        };
        store.apply(&hash, first).await.unwrap();

        let second = Mutation::PutOnce {
            key: "output.k".to_owned(),
            value: "\"second\"".to_owned(),
        };
        assert!(matches!(
            store.apply(&hash, second).await,
            Err(ManagerError::Conflict(_))
        ));

        // First write sticks.
        assert_eq!(
            store.get(&hash, "output.k").await.unwrap(),
            Some("\"first\"".to_owned())
        );
    }

    #[tokio::test]
    async fn test_push_appends_in_order() {
        let store = MemoryTaskStore::new();
        let hash = Step::new("r", "a").hash();

        for i in 0..3 {
            store
                .apply(
                    &hash,
                    Mutation::Push {
                        key: "events".to_owned(),
                        value: serde_json::json!(i),
                    },
                )
                .await
                .unwrap();
        }

        let raw = store.get(&hash, "events").await.unwrap().unwrap();
        let items: Vec<i64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(items, vec![0, 1, 2]);
    }
}
