//! The WorkflowRun reconciler: one idempotent, level-triggered pass that
//! initializes state, materializes the compiled pipeline, launches or
//! cancels the executor run, archives logs, and updates status.

use super::compile::compile;
use super::logs::upload_logs;
use super::resources::WorkflowRunResources;
use super::status::{aggregate, is_cancelled, is_done, merge_preserving_terminal};
use super::types::{Context, Error, Result};
use crate::crds::{Pipeline, PipelineRun, WorkflowRun};
use crate::manager::store::Mutation;
use crate::manager::task::STATE_KEY_PREFIX;
use crate::manager::{KubeTaskStore, TaskStore};
use crate::model::{RunStatus, Step, PIPELINE_RUN_ANNOTATION, WORKFLOW_RUN_FINALIZER};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::ResourceExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[instrument(skip(ctx), fields(workflow_run = %wr.name_any(), namespace = ?wr.namespace()))]
pub async fn reconcile_workflow_run(wr: Arc<WorkflowRun>, ctx: Arc<Context>) -> Result<Action> {
    debug!("reconciling workflow run {}", wr.name_any());

    let namespace = wr.namespace().ok_or(Error::MissingObjectKey)?;
    let runs: Api<WorkflowRun> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&runs, WORKFLOW_RUN_FINALIZER, wr, |event| async {
        match event {
            FinalizerEvent::Apply(wr) => reconcile_active(wr, &ctx, &namespace).await,
            FinalizerEvent::Cleanup(wr) => {
                // Owner references cascade deletion of the derived subtree;
                // releasing the finalizer is all that is left to do.
                debug!("releasing finalizer for {}", wr.name_any());
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("invalid finalizer name".to_string())
        }
    })?;

    debug!("done reconciling workflow run");
    Ok(result)
}

async fn reconcile_active(wr: Arc<WorkflowRun>, ctx: &Context, namespace: &str) -> Result<Action> {
    let runs: Api<WorkflowRun> = Api::namespaced(ctx.client.clone(), namespace);
    let resources = WorkflowRunResources::new(ctx, &wr, namespace);

    if let Err(err) = initialize(&wr, ctx, namespace, &resources).await {
        if matches!(err, Error::TaskSpecEvaluationError(_)) {
            // Terminal: the authored document cannot compile. Record the
            // failure and stop retrying.
            warn!("workflow run {} failed to compile: {}", wr.name_any(), err);
            let mut status = wr.status.clone().unwrap_or_default();
            status.phase = RunStatus::Failure.to_string();
            patch_status(&runs, &wr.name_any(), &status).await?;
            return Ok(Action::await_change());
        }
        return Err(err);
    }

    launch_or_cancel(&wr, &runs, &resources).await?;

    observe(&wr, ctx, namespace, &runs).await
}

/// Flushes pre-populated state and, on the first pass, creates every object
/// the run needs. All Kubernetes failures here surface as workflow
/// execution errors for requeue.
async fn initialize(
    wr: &WorkflowRun,
    ctx: &Context,
    namespace: &str,
    resources: &WorkflowRunResources<'_>,
) -> Result<()> {
    write_initial_state(wr, ctx, namespace).await?;

    let phase_unset = wr
        .status
        .as_ref()
        .map(|s| s.phase.trim().is_empty())
        .unwrap_or(true);
    if !phase_unset {
        return Ok(());
    }

    info!("unreconciled WorkflowRun {}", wr.name_any());

    resources
        .create_access_resources()
        .await
        .map_err(execution)?;

    if wr.spec.workflow.steps.is_empty() {
        return Ok(());
    }

    // The Pipeline is created last, so its presence means the whole object
    // graph already exists.
    let pipelines: Api<Pipeline> = Api::namespaced(ctx.client.clone(), namespace);
    if pipelines
        .get_opt(&wr.name_any())
        .await
        .map_err(|e| execution(Error::KubeError(e)))?
        .is_some()
    {
        return Ok(());
    }

    resources
        .create_network_policies()
        .await
        .map_err(execution)?;
    resources.create_limit_range().await.map_err(execution)?;

    let compiled = compile(wr, &ctx.config.metadata_api.url, ctx.images.as_ref()).await?;
    resources
        .create_pipeline_objects(&compiled)
        .await
        .map_err(execution)?;

    Ok(())
}

/// Kubernetes errors during initialization become workflow execution
/// errors; compile problems keep their own classification.
fn execution(err: Error) -> Error {
    match err {
        err @ (Error::TaskSpecEvaluationError(_) | Error::WorkflowExecutionError(_)) => err,
        other => Error::execution(other),
    }
}

async fn write_initial_state(wr: &WorkflowRun, ctx: &Context, namespace: &str) -> Result<()> {
    if wr.spec.state.steps.is_empty() {
        return Ok(());
    }

    let store = KubeTaskStore::new(ctx.client.clone(), namespace);
    for (step_name, state) in &wr.spec.state.steps {
        let Value::Object(entries) = state else {
            warn!(
                "ignoring non-object initial state for step {:?} of {}",
                step_name,
                wr.name_any()
            );
            continue;
        };

        let hash = Step::new(&wr.spec.name, step_name).hash();
        for (key, value) in entries {
            store
                .apply(
                    &hash,
                    Mutation::Put {
                        key: format!("{STATE_KEY_PREFIX}{key}"),
                        value: serde_json::to_string(value)?,
                    },
                )
                .await
                .map_err(Error::execution)?;
        }
    }

    Ok(())
}

async fn launch_or_cancel(
    wr: &WorkflowRun,
    runs: &Api<WorkflowRun>,
    resources: &WorkflowRunResources<'_>,
) -> Result<()> {
    let cancelled = is_cancelled(wr);

    match wr.annotations().get(PIPELINE_RUN_ANNOTATION) {
        None if !cancelled && !wr.spec.workflow.steps.is_empty() => {
            let plr = resources.ensure_pipeline_run().await?;

            let patch = json!({
                "metadata": {
                    "annotations": {PIPELINE_RUN_ANNOTATION: plr.name_any()},
                }
            });
            runs.patch(
                &wr.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        }
        Some(plr_name) if cancelled => {
            info!("cancelling PipelineRun {} for {}", plr_name, wr.name_any());
            resources.cancel_pipeline_run(plr_name).await?;
        }
        _ => {}
    }

    Ok(())
}

async fn observe(
    wr: &WorkflowRun,
    ctx: &Context,
    namespace: &str,
    runs: &Api<WorkflowRun>,
) -> Result<Action> {
    let pipelineruns: Api<PipelineRun> = Api::namespaced(ctx.client.clone(), namespace);
    let plr = pipelineruns.get_opt(&wr.name_any()).await?;

    if let Some(plr) = &plr {
        if is_done(plr) {
            let log_annotations = upload_logs(ctx, namespace, wr.annotations(), plr).await;
            if !log_annotations.is_empty() {
                let patch = json!({"metadata": {"annotations": log_annotations}});
                runs.patch(
                    &wr.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
            }
        }
    }

    let mut status = aggregate(wr, plr.as_ref());
    merge_preserving_terminal(wr.status.as_ref(), &mut status);
    patch_status(runs, &wr.name_any(), &status).await?;

    let terminal = RunStatus::parse(&status.phase).is_some_and(RunStatus::is_terminal);
    if terminal {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(Duration::from_secs(30)))
    }
}

async fn patch_status(
    runs: &Api<WorkflowRun>,
    name: &str,
    status: &crate::crds::WorkflowRunStatus,
) -> Result<()> {
    let patch = json!({"status": status});
    runs.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
