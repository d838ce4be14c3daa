//! Step-graph compiler: authored step list -> executable task DAG.
//!
//! Every derived object is named by the step's content-addressed hash, so
//! compilation is deterministic and re-running it against the same
//! WorkflowRun yields the same object identities.

use super::image::{entrypoint_argv, ImageMetadata};
use super::types::{Error, Result};
use crate::crds::{
    ConditionSpec, PipelineTask, PipelineTaskCondition, TaskRef, TaskSpec, TaskStep, WorkflowRun,
    WorkflowStep,
};
use crate::expr::{evaluate, Bindings};
use crate::model::{
    Step, StepHash, DEFAULT_IMAGE, ENTRYPOINT_COMMAND, ENTRYPOINT_VOLUME_MOUNT_NAME,
    ENTRYPOINT_VOLUME_MOUNT_PATH, ENTRYPOINT_VOLUME_CLAIM_SUFFIX_READ_ONLY_MANY,
    INTERPRETER_DEFAULT, INTERPRETER_DIRECTIVE, NEBULA_CONDITIONALS_KEY, NEBULA_ENTRYPOINT_FILE,
    NEBULA_MOUNT_PATH, NEBULA_SPEC_FILE,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, PersistentVolumeClaimVolumeSource, SecurityContext,
    Volume, VolumeMount,
};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::BTreeMap;

/// Image used for condition check containers.
const CONDITION_IMAGE: &str = "projectnebula/core";

/// Polling script run by condition check containers. It keys on the
/// `success` field of the `/conditions` response and keeps polling while the
/// field is absent.
const CONDITION_SCRIPT: &str = r#"#!/bin/bash
JQ="${JQ:-jq}"

CONDITIONS_URL="${CONDITIONS_URL:-conditions}"
VALUE_NAME="${VALUE_NAME:-success}"
POLLING_INTERVAL="${POLLING_INTERVAL:-5s}"
POLLING_ITERATIONS="${POLLING_ITERATIONS:-1080}"

for i in $(seq ${POLLING_ITERATIONS}); do
  CONDITIONS=$(curl "$METADATA_API_URL/${CONDITIONS_URL}")
  VALUE=$(echo $CONDITIONS | $JQ --arg value "$VALUE_NAME" -r '.[$value]')
  if [ -n "${VALUE}" ]; then
    if [ "$VALUE" = "true" ]; then
      exit 0
    fi
    if [ "$VALUE" = "false" ]; then
      exit 1
    fi
  fi
  sleep ${POLLING_INTERVAL}
done

exit 1
"#;

#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub name: String,
    pub hash: StepHash,
    pub configmap_data: BTreeMap<String, String>,
    pub task_spec: TaskSpec,
    pub condition_spec: Option<ConditionSpec>,
    pub pipeline_task: PipelineTask,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledWorkflow {
    pub steps: Vec<CompiledStep>,
}

/// Compiles the authored steps of a run. Fails with a workflow execution
/// error on graph problems (unknown dependency, cycle) and with a task spec
/// evaluation error on unresolved parameter references.
pub async fn compile(
    wr: &WorkflowRun,
    metadata_api_url: &str,
    images: &dyn ImageMetadata,
) -> Result<CompiledWorkflow> {
    let steps = &wr.spec.workflow.steps;
    validate_graph(steps)?;

    let bindings = parameter_bindings(wr);

    let mut compiled = CompiledWorkflow::default();
    for step in steps {
        let hash = Step::new(&wr.spec.name, &step.name).hash();

        let configmap_data = configmap_data(step, &bindings)?;
        let task_spec = task_spec(wr, step, &hash, metadata_api_url, images).await?;

        let condition_spec = step.when.as_ref().map(|_| ConditionSpec {
            check: TaskStep {
                container: Container {
                    name: hash.hex(),
                    image: Some(CONDITION_IMAGE.to_string()),
                    env: Some(environment_variables(metadata_api_url)),
                    ..Default::default()
                },
                script: Some(CONDITION_SCRIPT.to_string()),
            },
        });

        let pipeline_task = PipelineTask {
            name: hash.hex(),
            task_ref: Some(TaskRef { name: hash.hex() }),
            run_after: step
                .depends_on
                .iter()
                .map(|dep| Step::new(&wr.spec.name, dep).hash().hex())
                .collect(),
            conditions: condition_spec
                .iter()
                .map(|_| PipelineTaskCondition {
                    condition_ref: hash.hex(),
                })
                .collect(),
        };

        compiled.steps.push(CompiledStep {
            name: step.name.clone(),
            hash,
            configmap_data,
            task_spec,
            condition_spec,
            pipeline_task,
        });
    }

    Ok(compiled)
}

/// Run-level parameter overrides shadow workflow defaults; an unresolved
/// parameter reference is a hard compile error.
fn parameter_bindings(wr: &WorkflowRun) -> Bindings {
    let mut parameters = wr.spec.workflow.parameters.clone();
    parameters.extend(wr.spec.parameters.clone());

    Bindings {
        parameters,
        strict_parameters: true,
        ..Default::default()
    }
}

/// The dependency graph must close over the authored step set and be
/// acyclic. Forward references are fine; compilation is a single pass over
/// declaration order and resolves dependencies by hash.
fn validate_graph(steps: &[WorkflowStep]) -> Result<()> {
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    let mut index = BTreeMap::new();

    for (i, step) in steps.iter().enumerate() {
        index.insert(step.name.as_str(), i);
        graph.add_node(i);
    }

    for (i, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let Some(&j) = index.get(dep.as_str()) else {
                return Err(Error::WorkflowExecutionError(format!(
                    "step {:?} depends on unknown step {dep:?}",
                    step.name
                )));
            };
            graph.add_edge(j, i, ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        Error::WorkflowExecutionError(format!(
            "dependency cycle through step {:?}",
            steps[cycle.node_id()].name
        ))
    })?;

    Ok(())
}

fn configmap_data(step: &WorkflowStep, bindings: &Bindings) -> Result<BTreeMap<String, String>> {
    let mut data = BTreeMap::new();

    if let Some(spec) = &step.spec {
        let evaluated = evaluate(spec, bindings)?;
        data.insert(
            NEBULA_SPEC_FILE.to_string(),
            serde_json::to_string(&evaluated.value)?,
        );
    }

    if !step.input.is_empty() {
        data.insert(
            NEBULA_ENTRYPOINT_FILE.to_string(),
            entrypoint_script(&step.input),
        );
    }

    if let Some(when) = &step.when {
        let evaluated = evaluate(when, bindings)?;
        data.insert(
            NEBULA_CONDITIONALS_KEY.to_string(),
            serde_json::to_string(&evaluated.value)?,
        );
    }

    Ok(data)
}

fn entrypoint_script(input: &[String]) -> String {
    let script = input.join("\n");
    if script.starts_with(INTERPRETER_DIRECTIVE) {
        script
    } else {
        format!("{INTERPRETER_DEFAULT}\n{script}")
    }
}

fn environment_variables(metadata_api_url: &str) -> Vec<EnvVar> {
    vec![
        EnvVar {
            name: "SPEC_URL".to_string(),
            value: Some(format!("{metadata_api_url}/specs")),
            ..Default::default()
        },
        EnvVar {
            name: "METADATA_API_URL".to_string(),
            value: Some(metadata_api_url.to_string()),
            ..Default::default()
        },
    ]
}

async fn task_spec(
    wr: &WorkflowRun,
    step: &WorkflowStep,
    hash: &StepHash,
    metadata_api_url: &str,
    images: &dyn ImageMetadata,
) -> Result<TaskSpec> {
    let image = step.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());

    let mut container = Container {
        name: hash.hex(),
        image: Some(image.clone()),
        image_pull_policy: Some("Always".to_string()),
        env: Some(environment_variables(metadata_api_url)),
        security_context: Some(SecurityContext {
            // RunAsUser and friends would deny write access to the container
            // filesystem, which steps rely on.
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut volumes = Vec::new();

    if let Some(tenant_ref) = &wr.spec.tenant_ref {
        let image_config = images.config(&image).await?;
        let command: Vec<String> = step.command.iter().cloned().collect();

        container.command = Some(vec![ENTRYPOINT_COMMAND.to_string()]);
        container.args = Some(entrypoint_argv(&command, &step.args, &image_config));
        container.volume_mounts = Some(vec![VolumeMount {
            name: ENTRYPOINT_VOLUME_MOUNT_NAME.to_string(),
            mount_path: ENTRYPOINT_VOLUME_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]);

        volumes.push(Volume {
            name: ENTRYPOINT_VOLUME_MOUNT_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: format!(
                    "{}{ENTRYPOINT_VOLUME_CLAIM_SUFFIX_READ_ONLY_MANY}",
                    tenant_ref.name
                ),
                read_only: Some(true),
            }),
            ..Default::default()
        });
    } else {
        let mounts = configmap_mounts(step, hash);
        if !mounts.is_empty() {
            // A single volume backs every sub-path mount of this step's
            // ConfigMap; mode 0700 keeps the entrypoint executable.
            volumes.push(Volume {
                name: hash.hex(),
                config_map: Some(ConfigMapVolumeSource {
                    name: hash.hex(),
                    default_mode: Some(0o700),
                    ..Default::default()
                }),
                ..Default::default()
            });
            container.volume_mounts = Some(mounts);
        }

        if !step.input.is_empty() {
            container.command = Some(vec![format!(
                "{NEBULA_MOUNT_PATH}/{NEBULA_ENTRYPOINT_FILE}"
            )]);
        } else {
            if let Some(command) = &step.command {
                container.command = Some(vec![command.clone()]);
            }
            if !step.args.is_empty() {
                container.args = Some(step.args.clone());
            }
        }
    }

    Ok(TaskSpec {
        steps: vec![TaskStep {
            container,
            script: None,
        }],
        volumes,
    })
}

fn configmap_mounts(step: &WorkflowStep, hash: &StepHash) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();

    if step.spec.is_some() {
        mounts.push(VolumeMount {
            name: hash.hex(),
            mount_path: format!("{NEBULA_MOUNT_PATH}/{NEBULA_SPEC_FILE}"),
            sub_path: Some(NEBULA_SPEC_FILE.to_string()),
            ..Default::default()
        });
    }

    if !step.input.is_empty() {
        mounts.push(VolumeMount {
            name: hash.hex(),
            mount_path: format!("{NEBULA_MOUNT_PATH}/{NEBULA_ENTRYPOINT_FILE}"),
            sub_path: Some(NEBULA_ENTRYPOINT_FILE.to_string()),
            ..Default::default()
        });
    }

    mounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{TenantRef, Workflow, WorkflowRunSpec};
    use crate::workflow::image::{ImageConfig, StaticImageMetadata};
    use serde_json::json;

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

    fn step(name: &str) -> WorkflowStep {
        WorkflowStep {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn no_images() -> StaticImageMetadata {
        StaticImageMetadata::default()
    }

    #[tokio::test]
    async fn test_two_step_linear_run() {
        let mut b = step("b");
        b.depends_on = vec!["a".to_string()];
        let wr = workflow_run(vec![step("a"), b]);

        let compiled = compile(&wr, "http://metadata-api:7000", &no_images())
            .await
            .unwrap();

        assert_eq!(compiled.steps.len(), 2);
        let hash_a = Step::new("r", "a").hash().hex();
        let hash_b = Step::new("r", "b").hash().hex();

        assert_eq!(compiled.steps[0].hash.hex(), hash_a);
        assert_eq!(compiled.steps[1].hash.hex(), hash_b);
        assert!(compiled.steps[0].pipeline_task.run_after.is_empty());
        assert_eq!(compiled.steps[1].pipeline_task.run_after, vec![hash_a.clone()]);
        assert_eq!(
            compiled.steps[1].pipeline_task.task_ref.as_ref().unwrap().name,
            hash_b
        );
    }

    #[tokio::test]
    async fn test_forward_references_resolve() {
        let mut a = step("a");
        a.depends_on = vec!["z".to_string()];
        let wr = workflow_run(vec![a, step("z")]);

        let compiled = compile(&wr, "http://metadata-api:7000", &no_images())
            .await
            .unwrap();
        assert_eq!(
            compiled.steps[0].pipeline_task.run_after,
            vec![Step::new("r", "z").hash().hex()]
        );
    }

    #[tokio::test]
    async fn test_cycle_is_rejected() {
        let mut a = step("a");
        a.depends_on = vec!["b".to_string()];
        let mut b = step("b");
        b.depends_on = vec!["a".to_string()];

        let err = compile(&workflow_run(vec![a, b]), "http://x", &no_images())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkflowExecutionError(_)));
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_rejected() {
        let mut a = step("a");
        a.depends_on = vec!["ghost".to_string()];

        let err = compile(&workflow_run(vec![a]), "http://x", &no_images())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkflowExecutionError(_)));
    }

    #[tokio::test]
    async fn test_entrypoint_script_gets_shebang() {
        let mut a = step("a");
        a.input = vec!["echo hello".to_string(), "echo world".to_string()];
        let wr = workflow_run(vec![a]);

        let compiled = compile(&wr, "http://x", &no_images()).await.unwrap();
        let data = &compiled.steps[0].configmap_data;
        assert_eq!(
            data[NEBULA_ENTRYPOINT_FILE],
            "#!/bin/sh\necho hello\necho world"
        );

        let container = &compiled.steps[0].task_spec.steps[0].container;
        assert_eq!(
            container.command,
            Some(vec!["/nebula/entrypoint.sh".to_string()])
        );
    }

    #[tokio::test]
    async fn test_existing_shebang_is_preserved() {
        let mut a = step("a");
        a.input = vec!["#!/bin/bash".to_string(), "echo hi".to_string()];
        let wr = workflow_run(vec![a]);

        let compiled = compile(&wr, "http://x", &no_images()).await.unwrap();
        assert_eq!(
            compiled.steps[0].configmap_data[NEBULA_ENTRYPOINT_FILE],
            "#!/bin/bash\necho hi"
        );
    }

    #[tokio::test]
    async fn test_spec_parameters_resolve_with_run_override() {
        let mut a = step("a");
        a.spec = Some(json!({
            "greeting": {"$type": "Parameter", "name": "Hello"},
            "secret": {"$type": "Secret", "name": "foo"},
        }));

        let mut wr = workflow_run(vec![a]);
        wr.spec
            .workflow
            .parameters
            .insert("Hello".to_string(), json!("default"));
        wr.spec.parameters.insert("Hello".to_string(), json!("World!"));

        let compiled = compile(&wr, "http://x", &no_images()).await.unwrap();
        let spec: serde_json::Value =
            serde_json::from_str(&compiled.steps[0].configmap_data[NEBULA_SPEC_FILE]).unwrap();

        assert_eq!(spec["greeting"], json!("World!"));
        // Secrets are runtime references; the placeholder survives compile.
        assert_eq!(spec["secret"], json!({"$type": "Secret", "name": "foo"}));
    }

    #[tokio::test]
    async fn test_unknown_parameter_fails_compile() {
        let mut a = step("a");
        a.spec = Some(json!({"p": {"$type": "Parameter", "name": "missing"}}));

        let err = compile(&workflow_run(vec![a]), "http://x", &no_images())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskSpecEvaluationError(_)));
    }

    #[tokio::test]
    async fn test_when_clause_emits_condition() {
        let mut a = step("a");
        a.when = Some(json!({"$fn.equals": [1, 2]}));
        let wr = workflow_run(vec![a]);

        let compiled = compile(&wr, "http://x", &no_images()).await.unwrap();
        let hash = Step::new("r", "a").hash().hex();

        let condition = compiled.steps[0].condition_spec.as_ref().unwrap();
        assert_eq!(condition.check.container.name, hash);
        assert!(condition.check.script.as_ref().unwrap().contains("conditions"));

        assert_eq!(
            compiled.steps[0].pipeline_task.conditions,
            vec![PipelineTaskCondition {
                condition_ref: hash
            }]
        );

        // The when tree evaluates at compile time where possible.
        assert_eq!(compiled.steps[0].configmap_data[NEBULA_CONDITIONALS_KEY], "false");
    }

    #[tokio::test]
    async fn test_container_contract() {
        let mut a = step("a");
        a.command = Some("/bin/run".to_string());
        a.args = vec!["--fast".to_string()];
        let wr = workflow_run(vec![a]);

        let compiled = compile(&wr, "http://metadata-api:7000", &no_images())
            .await
            .unwrap();
        let container = &compiled.steps[0].task_spec.steps[0].container;

        assert_eq!(container.image.as_deref(), Some(DEFAULT_IMAGE));
        assert_eq!(container.command, Some(vec!["/bin/run".to_string()]));
        assert_eq!(container.args, Some(vec!["--fast".to_string()]));

        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| {
            e.name == "METADATA_API_URL" && e.value.as_deref() == Some("http://metadata-api:7000")
        }));
        assert!(env.iter().any(|e| {
            e.name == "SPEC_URL" && e.value.as_deref() == Some("http://metadata-api:7000/specs")
        }));

        let sc = container.security_context.as_ref().unwrap();
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert!(sc.run_as_user.is_none());
    }

    #[tokio::test]
    async fn test_tenant_run_uses_injected_entrypoint() {
        let mut a = step("a");
        a.image = Some("relaysh/tool:v1".to_string());
        a.args = vec!["--flag".to_string()];

        let mut wr = workflow_run(vec![a]);
        wr.spec.tenant_ref = Some(TenantRef {
            name: "my-tenant".to_string(),
        });

        let images = StaticImageMetadata::new(BTreeMap::from([(
            "relaysh/tool:v1".to_string(),
            ImageConfig {
                entrypoint: vec!["/tool".to_string()],
                cmd: vec!["serve".to_string()],
            },
        )]));

        let compiled = compile(&wr, "http://x", &images).await.unwrap();
        let task = &compiled.steps[0].task_spec;
        let container = &task.steps[0].container;

        assert_eq!(container.command, Some(vec!["/data/entrypoint".to_string()]));
        assert_eq!(
            container.args,
            Some(vec![
                "-entrypoint".to_string(),
                "/tool".to_string(),
                "--".to_string(),
                "serve".to_string(),
                "--flag".to_string(),
            ])
        );

        let volume = &task.volumes[0];
        assert_eq!(volume.name, "entrypoint");
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "my-tenant-volume-rox"
        );
    }
}
