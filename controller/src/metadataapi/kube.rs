//! Kubernetes-backed caller resolution.
//!
//! The caller IP maps to a pod in the configured namespace; the pod's
//! task-hash and run labels identify the step, and the WorkflowRun document
//! supplies parameters and the step's env tree.

use super::{ApiError, CallerContext, ManagerFactory};
use crate::crds::WorkflowRun;
use crate::manager::{
    ConnectionManager, KubeTaskStore, ManagerError, Managers, RunParameterManager, SecretManager,
    StoreConditionManager, StoreEventManager, StoreSpecManager, StoreStateManager,
    StoreStepOutputManager, TaskStore,
};
use crate::model::{Step, RUN_LABEL, TASK_HASH_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

pub struct KubeManagerFactory {
    client: Client,
    namespace: String,
    store: Arc<dyn TaskStore>,
    secrets: Option<Arc<dyn SecretManager>>,
    connections: Option<Arc<dyn ConnectionManager>>,
}

impl KubeManagerFactory {
    pub fn new(client: Client, namespace: &str) -> Self {
        let store = Arc::new(KubeTaskStore::new(client.clone(), namespace));
        KubeManagerFactory {
            client,
            namespace: namespace.to_string(),
            store,
            secrets: None,
            connections: None,
        }
    }

    /// Attaches the secret backend. Left unset, secret requests reject.
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretManager>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Attaches the connection backend. Left unset, connection requests
    /// reject.
    pub fn with_connections(mut self, connections: Arc<dyn ConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    async fn pod_by_ip(&self, ip: IpAddr) -> Result<Pod, ApiError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().fields(&format!("status.podIP={ip}"));

        let list = pods.list(&params).await.map_err(ManagerError::from)?;
        list.items.into_iter().next().ok_or(ApiError::UnknownCaller)
    }
}

#[async_trait]
impl ManagerFactory for KubeManagerFactory {
    async fn for_caller(&self, ip: IpAddr) -> Result<CallerContext, ApiError> {
        let pod = self.pod_by_ip(ip).await?;
        let labels = pod.metadata.labels.unwrap_or_default();

        let task_hash = labels.get(TASK_HASH_LABEL).ok_or(ApiError::UnknownCaller)?;
        let run_name = labels.get(RUN_LABEL).ok_or(ApiError::UnknownCaller)?;
        debug!(ip = %ip, task_hash = %task_hash, run = %run_name, "resolved caller");

        let runs: Api<WorkflowRun> = Api::namespaced(self.client.clone(), &self.namespace);
        let wr = runs.get(run_name).await.map_err(ManagerError::from)?;

        let step_def = wr
            .spec
            .workflow
            .steps
            .iter()
            .find(|step| Step::new(&wr.spec.name, &step.name).hash().hex() == *task_hash)
            .ok_or(ApiError::UnknownCaller)?;

        let step = Step::new(&wr.spec.name, &step_def.name);

        let parameters = RunParameterManager::new(&wr.spec.workflow.parameters, &wr.spec.parameters);

        let mut builder = Managers::builder()
            .parameters(Arc::new(parameters))
            .spec(Arc::new(StoreSpecManager::new(step.clone(), self.store.clone())))
            .conditions(Arc::new(StoreConditionManager::new(
                step.clone(),
                self.store.clone(),
            )))
            .state(Arc::new(StoreStateManager::new(
                step.clone(),
                self.store.clone(),
            )))
            .step_outputs(Arc::new(StoreStepOutputManager::new(
                step.clone(),
                self.store.clone(),
            )))
            .events(Arc::new(StoreEventManager::new(
                step.clone(),
                self.store.clone(),
            )));

        if let Some(secrets) = &self.secrets {
            builder = builder.secrets(secrets.clone());
        }
        if let Some(connections) = &self.connections {
            builder = builder.connections(connections.clone());
        }

        Ok(CallerContext {
            step,
            env: step_def.env.clone(),
            managers: builder.build(),
        })
    }
}
