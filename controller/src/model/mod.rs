//! Core identity types and platform constants shared by the reconciler, the
//! metadata API, and the admission webhook.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

pub const DEFAULT_IMAGE: &str = "alpine:latest";

pub const ENTRYPOINT_COMMAND: &str = "/data/entrypoint";
pub const ENTRYPOINT_COMMAND_FLAG: &str = "-entrypoint";
pub const ENTRYPOINT_COMMAND_ARG_SEPARATOR: &str = "--";
pub const ENTRYPOINT_VOLUME_MOUNT_NAME: &str = "entrypoint";
pub const ENTRYPOINT_VOLUME_MOUNT_PATH: &str = "/data";
pub const ENTRYPOINT_VOLUME_CLAIM_SUFFIX_READ_ONLY_MANY: &str = "-volume-rox";

pub const RELAY_DOMAIN_ID_ANNOTATION: &str = "relay.sh/domain-id";
pub const RELAY_TENANT_ID_ANNOTATION: &str = "relay.sh/tenant-id";
pub const RELAY_VAULT_ENGINE_MOUNT_ANNOTATION: &str = "relay.sh/vault-engine-mount";
pub const RELAY_VAULT_SECRET_PATH_ANNOTATION: &str = "relay.sh/vault-secret-path";
pub const RELAY_VAULT_CONNECTION_PATH_ANNOTATION: &str = "relay.sh/vault-connection-path";

pub const RELAY_CONTROLLER_TOKEN_HASH_ANNOTATION: &str = "controller.relay.sh/token-hash";
pub const RELAY_CONTROLLER_DEPENDENCY_OF_ANNOTATION: &str = "controller.relay.sh/dependency-of";
pub const RELAY_CONTROLLER_VOLUME_CLAIM_ANNOTATION: &str = "controller.relay.sh/volume-claim";

pub const RELAY_CONTROLLER_TENANT_NAME_LABEL: &str = "controller.relay.sh/tenant-name";
pub const RELAY_CONTROLLER_TENANT_WORKLOAD_LABEL: &str = "controller.relay.sh/tenant-workload";
pub const RELAY_CONTROLLER_RUN_ID_LABEL: &str = "controller.relay.sh/run-id";
pub const RELAY_CONTROLLER_WEBHOOK_TRIGGER_ID_LABEL: &str = "controller.relay.sh/webhook-trigger-id";

// Labels stamped on every derived object so the metadata API can resolve a
// pod back to its step.
pub const TASK_HASH_LABEL: &str = "nebula.puppet.com/task.hash";
pub const RUN_LABEL: &str = "nebula.puppet.com/run";

pub const NEBULA_GROUP_NAME_PREFIX: &str = "nebula.puppet.com/";
pub const PIPELINE_RUN_ANNOTATION: &str = "nebula.puppet.com/pipelinerun";
pub const WORKFLOW_RUN_FINALIZER: &str = "nebula.puppet.com/workflowrun";
pub const WORKFLOW_RUN_ID_LABEL: &str = "nebula.puppet.com/workflow-run-id";
pub const WORKFLOW_ID_LABEL: &str = "nebula.puppet.com/workflow-id";
pub const LOG_UPLOAD_ANNOTATION_PREFIX: &str = "nebula.puppet.com/log-archive-";

pub const NEBULA_MOUNT_PATH: &str = "/nebula";
pub const NEBULA_ENTRYPOINT_FILE: &str = "entrypoint.sh";
pub const NEBULA_SPEC_FILE: &str = "spec.json";
pub const NEBULA_CONDITIONALS_KEY: &str = "conditionals";

pub const INTERPRETER_DIRECTIVE: &str = "#!";
pub const INTERPRETER_DEFAULT: &str = "#!/bin/sh";

/// Key in the run-level state that requests cancellation.
pub const WORKFLOW_RUN_STATE_CANCEL: &str = "cancel";

/// Aggregate or per-step status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Success,
    Failure,
    Cancelled,
    Skipped,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in-progress",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Skipped => "skipped",
            RunStatus::TimedOut => "timed-out",
        }
    }

    /// Terminal statuses never regress on subsequent reconciles.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::InProgress)
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "in-progress" => Some(RunStatus::InProgress),
            "success" => Some(RunStatus::Success),
            "failure" => Some(RunStatus::Failure),
            "cancelled" => Some(RunStatus::Cancelled),
            "skipped" => Some(RunStatus::Skipped),
            "timed-out" => Some(RunStatus::TimedOut),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single workflow run, identified by the WorkflowRun object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Run {
    pub id: String,
}

/// An authored step within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Step {
    pub run: Run,
    pub name: String,
}

impl Step {
    pub fn new(run: &str, name: &str) -> Self {
        Step {
            run: Run {
                id: run.to_owned(),
            },
            name: name.to_owned(),
        }
    }

    /// Content-addressed identity of this step. The hex encoding is the name
    /// of every object derived from the step (Task, Condition, ConfigMap),
    /// so it must be stable across reconciles and field ordering.
    pub fn hash(&self) -> StepHash {
        let mut hasher = Sha1::new();
        hasher.update(self.run.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.name.as_bytes());
        StepHash(hasher.finalize().into())
    }
}

/// SHA1 digest of `run || NUL || step`, rendered lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepHash([u8; 20]);

impl StepHash {
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for StepHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}
