//! `WorkflowRun` Custom Resource Definition for declarative workflow execution

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "nebula.puppet.com", version = "v1", kind = "WorkflowRun")]
#[kube(namespaced)]
#[kube(status = "WorkflowRunStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct WorkflowRunSpec {
    /// Run identifier, used to derive task hashes and name the PipelineRun.
    pub name: String,

    /// Run-level parameter overrides; take precedence over workflow defaults.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    /// Initial run and step state written into the state store.
    #[serde(default)]
    pub state: WorkflowRunState,

    /// Optional reference to the tenant whose tool-injection volume the
    /// steps mount.
    #[serde(rename = "tenantRef", default, skip_serializing_if = "Option::is_none")]
    pub tenant_ref: Option<TenantRef>,

    pub workflow: Workflow,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct TenantRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct WorkflowRunState {
    /// Run-level state. `workflow.cancel = true` requests cancellation.
    #[serde(default)]
    pub workflow: BTreeMap<String, Value>,

    /// Pre-populated per-step state, keyed by authored step name.
    #[serde(default)]
    pub steps: BTreeMap<String, Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct Workflow {
    pub name: String,

    /// Workflow-level parameter defaults.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

/// One authored unit inside a workflow.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct WorkflowStep {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Inline script lines; mutually preferred over command/args when set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<String>,

    /// Environment template tree with `$type`-tagged references.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Value>,

    /// Spec template tree with `$type`-tagged references, evaluated at
    /// compile time for parameters and at runtime for everything else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,

    #[serde(rename = "dependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Condition template tree gating execution of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStatus {
    pub phase: String,

    #[serde(default)]
    pub steps: BTreeMap<String, WorkflowRunStatusSummary>,

    #[serde(default)]
    pub conditions: BTreeMap<String, WorkflowRunStatusSummary>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStatusSummary {
    /// Executor-side name (the task hash) this summary was observed under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_deserializes_authored_document() {
        let doc = json!({
            "name": "my-workflow-run-1234",
            "parameters": {"Hello": "World!"},
            "workflow": {
                "name": "my-workflow",
                "parameters": {"Hello": "default"},
                "steps": [
                    {
                        "name": "my-test-step",
                        "image": "alpine:latest",
                        "spec": {
                            "secret": {"$type": "Secret", "name": "foo"},
                        },
                        "input": ["trap : TERM INT", "sleep 600 & wait"],
                    },
                    {
                        "name": "downstream",
                        "dependsOn": ["my-test-step"],
                        "when": {"$fn.equals": [1, 1]},
                    },
                ],
            },
        });

        let spec: WorkflowRunSpec = serde_json::from_value(doc).unwrap();
        assert_eq!(spec.name, "my-workflow-run-1234");
        assert_eq!(spec.workflow.steps.len(), 2);
        assert_eq!(spec.workflow.steps[0].input.len(), 2);
        assert_eq!(
            spec.workflow.steps[1].depends_on,
            vec!["my-test-step".to_string()]
        );
        assert!(spec.workflow.steps[1].when.is_some());
        assert!(spec.tenant_ref.is_none());
        assert!(spec.state.workflow.is_empty());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = WorkflowRunStatus {
            phase: "in-progress".to_string(),
            start_time: Some("2020-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "in-progress");
        assert_eq!(value["startTime"], "2020-01-01T00:00:00Z");
        assert!(value.get("completionTime").is_none());
    }
}
