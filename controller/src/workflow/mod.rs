use crate::crds::{PipelineRun, WorkflowRun};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, Instrument};

pub mod compile;
pub mod config;
pub mod controller;
pub mod image;
pub mod logs;
pub mod resources;
pub mod status;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use controller::reconcile_workflow_run;
pub use types::{Context, Error, Result};

/// Main entry point for the WorkflowRun controller
#[instrument(skip(client, context))]
pub async fn run_workflow_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting WorkflowRun controller");

    let runs: Api<WorkflowRun> = Api::all(client.clone());
    let pipelineruns: Api<PipelineRun> = Api::all(client);
    let watcher_config = Config::default().any_semantic();

    Controller::new(runs, watcher_config.clone())
        .owns(pipelineruns, watcher_config)
        .run(reconcile_workflow_run, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("workflow_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok(workflow_run_resource) => {
                        info!(
                            resource = ?workflow_run_resource,
                            "WorkflowRun reconciliation successful"
                        );
                    }
                    Err(reconciliation_err) => {
                        error!(
                            error = ?reconciliation_err,
                            "WorkflowRun reconciliation error"
                        );
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("WorkflowRun controller shutting down");
    Ok(())
}

/// Error policy: spec evaluation failures are terminal, everything else is
/// level-triggered and requeues.
#[instrument(skip(_ctx), fields(workflow_run = %wr.name_any()))]
fn error_policy(wr: Arc<WorkflowRun>, error: &Error, _ctx: Arc<Context>) -> Action {
    match error {
        Error::TaskSpecEvaluationError(_) => {
            error!(error = ?error, "workflow run failed spec evaluation, not retrying");
            Action::await_change()
        }
        _ => {
            error!(error = ?error, "workflow run reconciliation failed, requeueing");
            Action::requeue(Duration::from_secs(15))
        }
    }
}
