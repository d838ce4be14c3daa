//! Mirror types for the pipeline executor's resources.
//!
//! The executor owns these CRDs and their schemas; the controller only
//! creates and observes instances, so schema generation is disabled and the
//! types carry just the fields the reconciler touches.

use k8s_openapi::api::core::v1::{PodDNSConfig, Toleration, Volume};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Condition type reported by the executor for tasks and runs.
pub const CONDITION_SUCCEEDED: &str = "Succeeded";

/// Reason attached when a run exceeds its configured timeout.
pub const REASON_TIMED_OUT: &str = "PipelineRunTimeout";

/// Reason attached when a task's condition check evaluated to false.
pub const REASON_CONDITION_CHECK_FAILED: &str = "ConditionCheckFailed";

/// Spec status requesting cancellation of an in-flight run.
pub const PIPELINE_RUN_SPEC_STATUS_CANCELLED: &str = "PipelineRunCancelled";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(group = "tekton.dev", version = "v1beta1", kind = "Pipeline")]
#[kube(namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    #[serde(default)]
    pub tasks: Vec<PipelineTask>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTask {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_after: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PipelineTaskCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTaskCondition {
    pub condition_ref: String,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(group = "tekton.dev", version = "v1beta1", kind = "Task")]
#[kube(namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default)]
    pub steps: Vec<TaskStep>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// A container-plus-script step inside an executor task.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    #[serde(flatten)]
    pub container: k8s_openapi::api::core::v1::Container,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(group = "tekton.dev", version = "v1alpha1", kind = "Condition")]
#[kube(namespaced, schema = "disabled")]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    pub check: TaskStep,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[kube(group = "tekton.dev", version = "v1beta1", kind = "PipelineRun")]
#[kube(namespaced, schema = "disabled")]
#[kube(status = "PipelineRunStatus")]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_ref: Option<PipelineRef>,

    /// Default service account for tasks without an explicit entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_account_names: Vec<PipelineRunSpecServiceAccountName>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplate>,

    /// Set to [`PIPELINE_RUN_SPEC_STATUS_CANCELLED`] to cancel the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpecServiceAccountName {
    pub task_name: String,
    pub service_account_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_policy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_config: Option<PodDNSConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunStatus {
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    /// Keyed by the executor-generated TaskRun name.
    #[serde(default)]
    pub task_runs: BTreeMap<String, PipelineRunTaskRunStatus>,
}

/// Knative-style duck condition shared by runs, task runs, and checks.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub condition_type: String,

    /// "True", "False", or "Unknown".
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunTaskRunStatus {
    pub pipeline_task_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskRunStatus>,

    #[serde(default)]
    pub condition_checks: BTreeMap<String, PipelineRunConditionCheckStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunConditionCheckStatus {
    #[serde(default)]
    pub condition_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskRunStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunStatus {
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepState>,
}

/// Per-container state as reported on the task run; the raw running and
/// terminated blocks are opaque to the reconciler beyond presence.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    #[serde(default)]
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated: Option<Value>,
}
