//! Status aggregation: executor-reported conditions -> run phase and
//! per-step summaries, with topological enrichment for steps that will
//! never run.

use crate::crds::{
    PipelineRun, StatusCondition, WorkflowRun, WorkflowRunStatus, WorkflowRunStatusSummary,
    WorkflowStep, CONDITION_SUCCEEDED, REASON_CONDITION_CHECK_FAILED, REASON_TIMED_OUT,
};
use crate::model::{RunStatus, Step, WORKFLOW_RUN_STATE_CANCEL};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Maps a duck-typed `Succeeded` condition to the derived status.
pub fn map_status(conditions: &[StatusCondition]) -> RunStatus {
    for condition in conditions {
        if condition.condition_type != CONDITION_SUCCEEDED {
            continue;
        }

        match condition.status.as_str() {
            "Unknown" => return RunStatus::InProgress,
            "True" => return RunStatus::Success,
            "False" => {
                return match condition.reason.as_deref() {
                    Some(REASON_CONDITION_CHECK_FAILED) => RunStatus::Skipped,
                    Some(REASON_TIMED_OUT) => RunStatus::TimedOut,
                    _ => RunStatus::Failure,
                }
            }
            _ => {}
        }
    }

    RunStatus::Pending
}

/// Cancellation is requested through the run-level state.
pub fn is_cancelled(wr: &WorkflowRun) -> bool {
    wr.spec.state.workflow.get(WORKFLOW_RUN_STATE_CANCEL) == Some(&Value::Bool(true))
}

/// Whether the executor run is terminal and no task is still in flight,
/// which gates log archival.
pub fn is_done(plr: &PipelineRun) -> bool {
    let Some(status) = &plr.status else {
        return false;
    };

    if !map_status(&status.conditions).is_terminal() {
        return false;
    }

    !status.task_runs.values().any(|task_run| {
        task_run
            .status
            .as_ref()
            .is_some_and(|s| map_status(&s.conditions) == RunStatus::InProgress)
    })
}

/// Computes the WorkflowRun status from the observed PipelineRun.
pub fn aggregate(wr: &WorkflowRun, plr: Option<&PipelineRun>) -> WorkflowRunStatus {
    let mut observed_steps: BTreeMap<String, WorkflowRunStatusSummary> = BTreeMap::new();
    let mut observed_conditions: BTreeMap<String, WorkflowRunStatusSummary> = BTreeMap::new();

    let mut phase = wr
        .status
        .as_ref()
        .map(|s| s.phase.clone())
        .unwrap_or_default();

    let mut status = WorkflowRunStatus::default();

    if let Some(plr) = plr {
        if let Some(plr_status) = &plr.status {
            phase = map_status(&plr_status.conditions).to_string();
            status.start_time = plr_status.start_time.clone();
            status.completion_time = plr_status.completion_time.clone();

            for (task_run_name, task_run) in &plr_status.task_runs {
                for check in task_run.condition_checks.values() {
                    let Some(check_status) = &check.status else {
                        continue;
                    };

                    let summary = WorkflowRunStatusSummary {
                        name: Some(task_run_name.clone()),
                        status: map_status(&check_status.conditions).to_string(),
                        start_time: check_status.start_time.clone(),
                        completion_time: check_status.completion_time.clone(),
                    };

                    if observed_conditions
                        .insert(task_run.pipeline_task_name.clone(), summary)
                        .is_some()
                    {
                        warn!(
                            task = %task_run.pipeline_task_name,
                            "task has extra conditions, keeping the last one observed"
                        );
                    }
                }

                let Some(task_status) = &task_run.status else {
                    continue;
                };

                observed_steps.insert(
                    task_run.pipeline_task_name.clone(),
                    WorkflowRunStatusSummary {
                        name: Some(task_run_name.clone()),
                        status: map_status(&task_status.conditions).to_string(),
                        start_time: task_status.start_time.clone(),
                        completion_time: task_status.completion_time.clone(),
                    },
                );
            }
        }
    }

    // state.workflow.cancel wins over whatever the executor reports.
    if is_cancelled(wr) {
        phase = RunStatus::Cancelled.to_string();
    }

    status.phase = phase;

    for step in &wr.spec.workflow.steps {
        let hash = Step::new(&wr.spec.name, &step.name).hash().hex();

        let summary = observed_steps
            .get(&hash)
            .cloned()
            .unwrap_or(WorkflowRunStatusSummary {
                name: None,
                status: RunStatus::Pending.to_string(),
                start_time: None,
                completion_time: None,
            });
        status.steps.insert(step.name.clone(), summary);

        if let Some(condition) = observed_conditions.get(&hash) {
            status
                .conditions
                .insert(step.name.clone(), condition.clone());
        }
    }

    enrich(&mut status, &wr.spec.workflow.steps);
    status
}

/// Propagates "won't run" downstream: in topological order, a step still
/// pending is reported skipped when the run is terminally bad or when any
/// of its dependencies is skipped or failed.
fn enrich(status: &mut WorkflowRunStatus, steps: &[WorkflowStep]) {
    let run_is_dead = matches!(
        RunStatus::parse(&status.phase),
        Some(RunStatus::Cancelled) | Some(RunStatus::Failure) | Some(RunStatus::TimedOut)
    );

    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    let mut index = BTreeMap::new();
    for (i, step) in steps.iter().enumerate() {
        index.insert(step.name.as_str(), i);
        graph.add_node(i);
    }
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(&j) = index.get(dep.as_str()) {
                graph.add_edge(j, i, ());
            }
        }
    }

    let Ok(order) = toposort(&graph, None) else {
        // A cycle never compiles; nothing sane to enrich.
        return;
    };

    for node in order {
        let step = &steps[node];
        let Some(summary) = status.steps.get(&step.name) else {
            continue;
        };

        if RunStatus::parse(&summary.status) != Some(RunStatus::Pending) {
            continue;
        }

        let dependency_dead = step.depends_on.iter().any(|dep| {
            matches!(
                status.steps.get(dep).and_then(|s| RunStatus::parse(&s.status)),
                Some(RunStatus::Skipped) | Some(RunStatus::Failure)
            )
        });

        if run_is_dead || dependency_dead {
            if let Some(summary) = status.steps.get_mut(&step.name) {
                summary.status = RunStatus::Skipped.to_string();
            }
        }
    }
}

/// Terminal per-step statuses never regress: a stale executor view that
/// reports a finished step as pending or in-progress is ignored.
pub fn merge_preserving_terminal(previous: Option<&WorkflowRunStatus>, next: &mut WorkflowRunStatus) {
    let Some(previous) = previous else {
        return;
    };

    for (name, old) in &previous.steps {
        let old_terminal = RunStatus::parse(&old.status).is_some_and(RunStatus::is_terminal);
        if !old_terminal {
            continue;
        }

        let regressed = next
            .steps
            .get(name)
            .map(|new| !RunStatus::parse(&new.status).is_some_and(RunStatus::is_terminal))
            .unwrap_or(true);

        if regressed {
            next.steps.insert(name.clone(), old.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        PipelineRunConditionCheckStatus, PipelineRunSpec, PipelineRunStatus,
        PipelineRunTaskRunStatus, TaskRunStatus, Workflow, WorkflowRunSpec,
    };
    use serde_json::json;

    fn condition(status: &str, reason: Option<&str>) -> StatusCondition {
        StatusCondition {
            condition_type: CONDITION_SUCCEEDED.to_string(),
            status: status.to_string(),
            reason: reason.map(str::to_string),
            message: None,
        }
    }

    fn workflow_run(steps: Vec<WorkflowStep>) -> WorkflowRun {
        WorkflowRun::new(
            "my-test-run",
            WorkflowRunSpec {
                name: "r".to_string(),
                parameters: BTreeMap::new(),
                state: Default::default(),
                tenant_ref: None,
                workflow: Workflow {
                    name: "my-workflow".to_string(),
                    parameters: BTreeMap::new(),
                    steps,
                },
            },
        )
    }

    fn step(name: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            name: name.to_string(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn pipeline_run(
        run_condition: StatusCondition,
        task_runs: BTreeMap<String, PipelineRunTaskRunStatus>,
    ) -> PipelineRun {
        let mut plr = PipelineRun::new("my-test-run", PipelineRunSpec::default());
        plr.status = Some(PipelineRunStatus {
            conditions: vec![run_condition],
            start_time: Some("2020-01-01T00:00:00Z".to_string()),
            completion_time: None,
            task_runs,
        });
        plr
    }

    fn task_run(step_hash: &str, conditions: Vec<StatusCondition>) -> (String, PipelineRunTaskRunStatus) {
        (
            format!("my-test-run-{step_hash}"),
            PipelineRunTaskRunStatus {
                pipeline_task_name: step_hash.to_string(),
                status: Some(TaskRunStatus {
                    conditions,
                    ..Default::default()
                }),
                condition_checks: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn test_map_status_table() {
        assert_eq!(map_status(&[condition("Unknown", None)]), RunStatus::InProgress);
        assert_eq!(map_status(&[condition("True", None)]), RunStatus::Success);
        assert_eq!(
            map_status(&[condition("False", Some(REASON_CONDITION_CHECK_FAILED))]),
            RunStatus::Skipped
        );
        assert_eq!(
            map_status(&[condition("False", Some(REASON_TIMED_OUT))]),
            RunStatus::TimedOut
        );
        assert_eq!(
            map_status(&[condition("False", Some("BuildFailed"))]),
            RunStatus::Failure
        );
        assert_eq!(map_status(&[]), RunStatus::Pending);
    }

    #[test]
    fn test_success_aggregation() {
        let wr = workflow_run(vec![step("a", &[]), step("b", &["a"])]);
        let hash_a = Step::new("r", "a").hash().hex();
        let hash_b = Step::new("r", "b").hash().hex();

        let plr = pipeline_run(
            condition("True", None),
            BTreeMap::from([
                task_run(&hash_a, vec![condition("True", None)]),
                task_run(&hash_b, vec![condition("True", None)]),
            ]),
        );

        let status = aggregate(&wr, Some(&plr));
        assert_eq!(status.phase, "success");
        assert_eq!(status.steps["a"].status, "success");
        assert_eq!(status.steps["b"].status, "success");
        assert_eq!(status.start_time.as_deref(), Some("2020-01-01T00:00:00Z"));
    }

    #[test]
    fn test_failed_dependency_skips_downstream() {
        let wr = workflow_run(vec![step("a", &[]), step("b", &["a"])]);
        let hash_a = Step::new("r", "a").hash().hex();

        let plr = pipeline_run(
            condition("False", Some("BuildFailed")),
            BTreeMap::from([task_run(&hash_a, vec![condition("False", Some("BuildFailed"))])]),
        );

        let status = aggregate(&wr, Some(&plr));
        assert_eq!(status.phase, "failure");
        assert_eq!(status.steps["a"].status, "failure");
        // Enrichment-derived: the executor never reported on b.
        assert_eq!(status.steps["b"].status, "skipped");
    }

    #[test]
    fn test_skip_propagates_transitively() {
        let wr = workflow_run(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
        ]);
        let hash_a = Step::new("r", "a").hash().hex();

        let plr = pipeline_run(
            condition("False", Some("BuildFailed")),
            BTreeMap::from([task_run(&hash_a, vec![condition("False", Some("BuildFailed"))])]),
        );

        let status = aggregate(&wr, Some(&plr));
        assert_eq!(status.steps["b"].status, "skipped");
        assert_eq!(status.steps["c"].status, "skipped");
    }

    #[test]
    fn test_condition_check_failure_reports_skipped_step() {
        let wr = workflow_run(vec![step("a", &[])]);
        let hash_a = Step::new("r", "a").hash().hex();

        let mut checks = BTreeMap::new();
        checks.insert(
            format!("{hash_a}-check"),
            PipelineRunConditionCheckStatus {
                condition_name: hash_a.clone(),
                status: Some(TaskRunStatus {
                    conditions: vec![condition("False", Some(REASON_CONDITION_CHECK_FAILED))],
                    ..Default::default()
                }),
            },
        );

        let (task_run_name, mut tr) = task_run(
            &hash_a,
            vec![condition("False", Some(REASON_CONDITION_CHECK_FAILED))],
        );
        tr.condition_checks = checks;

        let plr = pipeline_run(condition("True", None), BTreeMap::from([(task_run_name, tr)]));

        let status = aggregate(&wr, Some(&plr));
        assert_eq!(status.phase, "success");
        assert_eq!(status.steps["a"].status, "skipped");
        assert_eq!(status.conditions["a"].status, "skipped");
    }

    #[test]
    fn test_cancellation_precedence() {
        let mut wr = workflow_run(vec![step("a", &[]), step("b", &["a"])]);
        wr.spec
            .state
            .workflow
            .insert("cancel".to_string(), json!(true));
        let hash_a = Step::new("r", "a").hash().hex();

        let plr = pipeline_run(
            condition("Unknown", None),
            BTreeMap::from([task_run(&hash_a, vec![condition("True", None)])]),
        );

        let status = aggregate(&wr, Some(&plr));
        assert_eq!(status.phase, "cancelled");
        assert_eq!(status.steps["a"].status, "success");
        // Still-pending steps are promoted to skipped under cancellation.
        assert_eq!(status.steps["b"].status, "skipped");
    }

    #[test]
    fn test_no_pipeline_run_reports_pending_steps() {
        let wr = workflow_run(vec![step("a", &[])]);
        let status = aggregate(&wr, None);
        assert_eq!(status.steps["a"].status, "pending");
    }

    #[test]
    fn test_terminal_statuses_never_regress() {
        let previous = WorkflowRunStatus {
            phase: "in-progress".to_string(),
            steps: BTreeMap::from([(
                "a".to_string(),
                WorkflowRunStatusSummary {
                    name: Some("tr-a".to_string()),
                    status: "success".to_string(),
                    start_time: None,
                    completion_time: None,
                },
            )]),
            ..Default::default()
        };

        let mut next = WorkflowRunStatus {
            phase: "in-progress".to_string(),
            steps: BTreeMap::from([(
                "a".to_string(),
                WorkflowRunStatusSummary {
                    name: None,
                    status: "pending".to_string(),
                    start_time: None,
                    completion_time: None,
                },
            )]),
            ..Default::default()
        };

        merge_preserving_terminal(Some(&previous), &mut next);
        assert_eq!(next.steps["a"].status, "success");
        assert_eq!(next.steps["a"].name.as_deref(), Some("tr-a"));
    }

    #[test]
    fn test_is_done() {
        let hash_a = Step::new("r", "a").hash().hex();

        let running = pipeline_run(
            condition("Unknown", None),
            BTreeMap::from([task_run(&hash_a, vec![condition("Unknown", None)])]),
        );
        assert!(!is_done(&running));

        let finished = pipeline_run(
            condition("True", None),
            BTreeMap::from([task_run(&hash_a, vec![condition("True", None)])]),
        );
        assert!(is_done(&finished));

        // Run condition terminal but a task still in flight.
        let straggler = pipeline_run(
            condition("False", Some("BuildFailed")),
            BTreeMap::from([task_run(&hash_a, vec![condition("Unknown", None)])]),
        );
        assert!(!is_done(&straggler));
    }
}
