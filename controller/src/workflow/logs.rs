//! Archival of terminated-step pod logs into blob storage.
//!
//! Upload failures are logged and skipped per task; they never block the
//! status update.

use super::types::{Context, Error, Result};
use crate::crds::PipelineRun;
use crate::model::LOG_UPLOAD_ANNOTATION_PREFIX;
use futures::AsyncReadExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodAndTaskName {
    pub pod_name: String,
    pub task_name: String,
}

/// Pod/task pairs whose step container has started (running or terminated);
/// anything else has no log to fetch yet.
pub fn extract_pod_and_task_names(plr: &PipelineRun) -> Vec<PodAndTaskName> {
    let Some(status) = &plr.status else {
        return Vec::new();
    };

    let mut result = Vec::new();
    for task_run in status.task_runs.values() {
        let Some(task_status) = &task_run.status else {
            continue;
        };

        if task_status.pod_name.is_empty() {
            continue;
        }

        let initialized = task_status.steps.iter().any(|step| {
            step.name == task_run.pipeline_task_name
                && (step.terminated.is_some() || step.running.is_some())
        });
        if !initialized {
            continue;
        }

        result.push(PodAndTaskName {
            pod_name: task_status.pod_name.clone(),
            task_name: task_run.pipeline_task_name.clone(),
        });
    }

    result
}

/// Uploads the logs not yet recorded in the given annotations. Returns the
/// annotations to add to the WorkflowRun.
pub async fn upload_logs(
    ctx: &Context,
    namespace: &str,
    existing_annotations: &BTreeMap<String, String>,
    plr: &PipelineRun,
) -> BTreeMap<String, String> {
    let mut log_annotations = BTreeMap::new();

    for pt in extract_pod_and_task_names(plr) {
        let annotation = format!("{LOG_UPLOAD_ANNOTATION_PREFIX}{}", pt.task_name);
        if existing_annotations.contains_key(&annotation) {
            continue;
        }

        let container_name = format!("step-{}", pt.task_name);
        match upload_log(ctx, namespace, &pt.pod_name, &container_name).await {
            Ok(key) => {
                log_annotations.insert(annotation, key);
            }
            Err(err) => {
                warn!(
                    "failed to upload log for pod={}/{} container={}: {}",
                    namespace, pt.pod_name, container_name, err
                );
            }
        }
    }

    log_annotations
}

async fn upload_log(
    ctx: &Context,
    namespace: &str,
    pod_name: &str,
    container_name: &str,
) -> Result<String> {
    let key = format!("{namespace}/{pod_name}/{container_name}");

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let params = LogParams {
        container: Some(container_name.to_string()),
        ..Default::default()
    };

    let mut stream = Box::pin(pods.log_stream(pod_name, &params).await?);
    let mut buffer = Vec::new();
    stream
        .read_to_end(&mut buffer)
        .await
        .map_err(Error::execution)?;

    ctx.storage
        .put(&key, "application/octet-stream", buffer)
        .await
        .map_err(Error::execution)?;

    Ok(key)
}
