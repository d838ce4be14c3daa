//! Creation of the objects derived from a WorkflowRun: service accounts,
//! image pull secret copy, limit range, network policies, and the compiled
//! pipeline objects. Everything is create-or-get so reconciles converge.

use super::compile::CompiledWorkflow;
use super::types::{Context, Error, Result};
use crate::crds::{
    Condition, Pipeline, PipelineRef, PipelineRun, PipelineRunSpec,
    PipelineRunSpecServiceAccountName, PipelineSpec, PodTemplate, Task, WorkflowRun,
    PIPELINE_RUN_SPEC_STATUS_CANCELLED,
};
use crate::model::{
    Step, StepHash, RELAY_CONTROLLER_VOLUME_CLAIM_ANNOTATION, RUN_LABEL, TASK_HASH_LABEL,
    WORKFLOW_ID_LABEL, WORKFLOW_RUN_ID_LABEL,
};
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, LimitRange, LimitRangeItem, LimitRangeSpec, LocalObjectReference,
    PodDNSConfig, Secret, ServiceAccount, Toleration,
};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::Resource as _;
use kube::ResourceExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// Name of the image pull secret copy used by system containers.
const IMAGE_PULL_SECRET_NAME: &str = "relay-system-docker-registry";

pub const SERVICE_ACCOUNT_IDENTIFIER_CUSTOMER: &str = "customer";
pub const SERVICE_ACCOUNT_IDENTIFIER_SYSTEM: &str = "system";

/// RFC 1918 and IANA special-purpose space denied for egress. The API
/// master IPs get carved back out of this list at policy creation time.
const INITIAL_EGRESS_DENY: &[&str] = &[
    "0.0.0.0/8",       // "This host on this network"
    "10.0.0.0/8",      // Private-Use
    "100.64.0.0/10",   // Shared Address Space
    "169.254.0.0/16",  // Link Local
    "172.16.0.0/12",   // Private-Use
    "192.0.0.0/24",    // IETF Protocol Assignments
    "192.0.2.0/24",    // Documentation (TEST-NET-1)
    "192.31.196.0/24", // AS112-v4
    "192.52.193.0/24", // AMT
    "192.168.0.0/16",  // Private-Use
    "192.175.48.0/24", // Direct Delegation AS112 Service
    "198.18.0.0/15",   // Benchmarking
    "198.51.100.0/24", // Documentation (TEST-NET-2)
    "203.0.113.0/24",  // Documentation (TEST-NET-3)
    "240.0.0.0/4",     // Reserved (multicast)
];

pub struct WorkflowRunResources<'a> {
    ctx: &'a Context,
    wr: &'a WorkflowRun,
    namespace: String,
}

impl<'a> WorkflowRunResources<'a> {
    pub fn new(ctx: &'a Context, wr: &'a WorkflowRun, namespace: &str) -> Self {
        WorkflowRunResources {
            ctx,
            wr,
            namespace: namespace.to_string(),
        }
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: WorkflowRun::api_version(&()).to_string(),
            kind: WorkflowRun::kind(&()).to_string(),
            name: self.wr.name_any(),
            uid: self.wr.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn run_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                WORKFLOW_RUN_ID_LABEL.to_string(),
                self.wr.spec.name.clone(),
            ),
            (
                WORKFLOW_ID_LABEL.to_string(),
                self.wr.spec.workflow.name.clone(),
            ),
        ])
    }

    fn task_labels(&self, hash: &StepHash) -> BTreeMap<String, String> {
        BTreeMap::from([
            (TASK_HASH_LABEL.to_string(), hash.hex()),
            (RUN_LABEL.to_string(), self.wr.name_any()),
        ])
    }

    fn service_account_name(&self, identifier: &str) -> String {
        format!("{}-{identifier}", self.wr.spec.workflow.name)
    }

    /// Service accounts and the image pull secret copy a run needs before
    /// any pod starts.
    pub async fn create_access_resources(&self) -> Result<()> {
        let pull_secret = self.copy_image_pull_secret().await?;

        self.create_service_account(SERVICE_ACCOUNT_IDENTIFIER_CUSTOMER, None)
            .await?;
        self.create_service_account(SERVICE_ACCOUNT_IDENTIFIER_SYSTEM, pull_secret.as_deref())
            .await?;

        Ok(())
    }

    async fn copy_image_pull_secret(&self) -> Result<Option<String>> {
        let Some((source_namespace, source_name)) =
            self.ctx.config.image_pull_secret_key(&self.namespace)
        else {
            return Ok(None);
        };

        info!("copying image pull secret for {}", self.wr.name_any());

        let source_api: Api<Secret> = Api::namespaced(self.ctx.client.clone(), &source_namespace);
        let source = source_api.get(&source_name).await?;

        if source.type_.as_deref() != Some("kubernetes.io/dockerconfigjson") {
            warn!("image pull secret is not of type kubernetes.io/dockerconfigjson");
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(IMAGE_PULL_SECRET_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.run_labels()),
                ..Default::default()
            },
            type_: source.type_,
            data: source.data,
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        create_or_get(&api, &secret).await?;

        Ok(Some(IMAGE_PULL_SECRET_NAME.to_string()))
    }

    async fn create_service_account(
        &self,
        identifier: &str,
        image_pull_secret: Option<&str>,
    ) -> Result<()> {
        let name = self.service_account_name(identifier);
        info!("creating service account {}", name);

        let service_account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.run_labels()),
                ..Default::default()
            },
            image_pull_secrets: image_pull_secret.map(|secret| {
                vec![LocalObjectReference {
                    name: secret.to_string(),
                }]
            }),
            ..Default::default()
        };

        let api: Api<ServiceAccount> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        create_or_get(&api, &service_account).await
    }

    /// Default (fairly generous) CPU and memory limits for step containers.
    pub async fn create_limit_range(&self) -> Result<()> {
        let limit_range = LimitRange {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LimitRangeSpec {
                limits: vec![LimitRangeItem {
                    type_: "Container".to_string(),
                    default: Some(resource_list(&[("cpu", "750m"), ("memory", "2Gi")])),
                    default_request: Some(resource_list(&[("cpu", "100m"), ("memory", "256Mi")])),
                    max: Some(resource_list(&[("cpu", "1"), ("memory", "3Gi")])),
                    ..Default::default()
                }],
            }),
        };

        let api: Api<LimitRange> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        create_or_get(&api, &limit_range).await
    }

    pub async fn create_network_policies(&self) -> Result<()> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.ctx.client.clone(), &self.namespace);

        create_or_get(&api, &self.metadata_api_policy()).await?;

        let master_ips = self.master_endpoint_ips().await?;
        create_or_get(&api, &self.default_policy(&master_ips)).await?;

        Ok(())
    }

    /// Allow pods in the namespace (and the controller) to reach the
    /// metadata API on TCP/7000, and the metadata API to reach the tasks
    /// namespace.
    fn metadata_api_policy(&self) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some("metadata-api-allow".to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "relay".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([
                        ("app.kubernetes.io/name".to_string(), "relay".to_string()),
                        (
                            "app.kubernetes.io/component".to_string(),
                            "metadata-api".to_string(),
                        ),
                    ])),
                    ..Default::default()
                },
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![
                        NetworkPolicyPeer {
                            // Match all pods in this namespace.
                            pod_selector: Some(LabelSelector::default()),
                            ..Default::default()
                        },
                        NetworkPolicyPeer {
                            // Allow the workflow controller to check for
                            // this service's status.
                            namespace_selector: Some(LabelSelector {
                                match_labels: Some(BTreeMap::from([(
                                    "nebula.puppet.com/network-policy.tasks".to_string(),
                                    "true".to_string(),
                                )])),
                                ..Default::default()
                            }),
                            pod_selector: Some(LabelSelector {
                                match_labels: Some(BTreeMap::from([
                                    (
                                        "app.kubernetes.io/name".to_string(),
                                        "relay-system".to_string(),
                                    ),
                                    (
                                        "app.kubernetes.io/component".to_string(),
                                        "tasks".to_string(),
                                    ),
                                ])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ports: Some(vec![NetworkPolicyPort {
                        protocol: Some("TCP".to_string()),
                        port: Some(IntOrString::Int(7000)),
                        ..Default::default()
                    }]),
                }]),
                egress: Some(vec![NetworkPolicyEgressRule {
                    to: Some(vec![NetworkPolicyPeer {
                        // Only allow outbound to the tasks namespace.
                        namespace_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                "nebula.puppet.com/network-policy.tasks".to_string(),
                                "true".to_string(),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }]),
            }),
        }
    }

    /// The cluster master endpoints from kubernetes.default.svc. Private
    /// clusters address the master from RFC 1918 space, and it is not
    /// selectable by label, so its IPs get punched out of the deny list.
    async fn master_endpoint_ips(&self) -> Result<Vec<Ipv4Addr>> {
        let api: Api<Endpoints> = Api::namespaced(self.ctx.client.clone(), "default");
        let master = api.get("kubernetes").await?;

        let mut ips = Vec::new();
        for subset in master.subsets.unwrap_or_default() {
            for address in subset.addresses.unwrap_or_default() {
                if let Ok(ip) = address.ip.parse::<Ipv4Addr>() {
                    ips.push(ip);
                }
            }
        }

        Ok(ips)
    }

    /// Deny all ingress; allow egress to the internet (minus private and
    /// special-purpose space, master IPs excepted), the metadata API, and
    /// kube-dns.
    fn default_policy(&self, master_ips: &[Ipv4Addr]) -> NetworkPolicy {
        let mut except = Vec::new();
        for cidr in INITIAL_EGRESS_DENY {
            match cidr.parse::<Ipv4Net>() {
                Ok(network) => {
                    for filtered in exclude_ips(network, master_ips) {
                        except.push(filtered.to_string());
                    }
                }
                // Will be caught by the admission controller anyway.
                Err(_) => except.push((*cidr).to_string()),
            }
        }

        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some("default".to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "relay".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                // Empty pod selector matches all pods.
                pod_selector: LabelSelector::default(),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                // No ingress rules: nothing should connect to task pods.
                ingress: Some(vec![]),
                egress: Some(vec![NetworkPolicyEgressRule {
                    to: Some(vec![
                        NetworkPolicyPeer {
                            ip_block: Some(IPBlock {
                                cidr: "0.0.0.0/0".to_string(),
                                except: Some(except),
                            }),
                            ..Default::default()
                        },
                        NetworkPolicyPeer {
                            // Allow access to the metadata API.
                            pod_selector: Some(LabelSelector {
                                match_labels: Some(BTreeMap::from([
                                    ("app.kubernetes.io/name".to_string(), "relay".to_string()),
                                    (
                                        "app.kubernetes.io/component".to_string(),
                                        "metadata-api".to_string(),
                                    ),
                                ])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        NetworkPolicyPeer {
                            // Allow access to kube-dns.
                            namespace_selector: Some(LabelSelector {
                                match_labels: Some(BTreeMap::from([(
                                    "nebula.puppet.com/network-policy.kube-system".to_string(),
                                    "true".to_string(),
                                )])),
                                ..Default::default()
                            }),
                            pod_selector: Some(LabelSelector {
                                match_labels: Some(BTreeMap::from([(
                                    "k8s-app".to_string(),
                                    "kube-dns".to_string(),
                                )])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }]),
            }),
        }
    }

    /// Persists every compiled object: per-step ConfigMaps, Tasks, and
    /// Conditions first, then the Pipeline that references them by name.
    pub async fn create_pipeline_objects(&self, compiled: &CompiledWorkflow) -> Result<()> {
        let configmaps: Api<ConfigMap> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let tasks: Api<Task> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let conditions: Api<Condition> = Api::namespaced(self.ctx.client.clone(), &self.namespace);
        let pipelines: Api<Pipeline> = Api::namespaced(self.ctx.client.clone(), &self.namespace);

        // The executor copies task annotations onto step pods, which is how
        // the tool-injection claim reaches the admission webhook.
        let task_annotations = self
            .wr
            .annotations()
            .get(RELAY_CONTROLLER_VOLUME_CLAIM_ANNOTATION)
            .map(|claim| {
                BTreeMap::from([(
                    RELAY_CONTROLLER_VOLUME_CLAIM_ANNOTATION.to_string(),
                    claim.clone(),
                )])
            });

        for step in &compiled.steps {
            let metadata = ObjectMeta {
                name: Some(step.hash.hex()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.task_labels(&step.hash)),
                annotations: task_annotations.clone(),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            };

            self.persist_configmap(&configmaps, metadata.clone(), &step.configmap_data)
                .await?;

            let task = Task {
                metadata: metadata.clone(),
                spec: step.task_spec.clone(),
            };
            create_or_get(&tasks, &task).await?;

            if let Some(condition_spec) = &step.condition_spec {
                let condition = Condition {
                    metadata,
                    spec: condition_spec.clone(),
                };
                create_or_get(&conditions, &condition).await?;
            }
        }

        let pipeline = Pipeline {
            metadata: ObjectMeta {
                name: Some(self.wr.name_any()),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            },
            spec: PipelineSpec {
                tasks: compiled
                    .steps
                    .iter()
                    .map(|step| step.pipeline_task.clone())
                    .collect(),
            },
        };

        create_or_get(&pipelines, &pipeline).await
    }

    /// The per-task ConfigMap doubles as the state store, so the metadata
    /// API may have created it (with runtime keys) before the compiler got
    /// here. Merge the compiled keys in instead of losing them to a 409.
    async fn persist_configmap(
        &self,
        api: &Api<ConfigMap>,
        metadata: ObjectMeta,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        let name = metadata.name.clone().ok_or(Error::MissingObjectKey)?;

        let configmap = ConfigMap {
            metadata,
            data: Some(data.clone()),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &configmap).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let patch = json!({"data": data});
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Creates (or returns) the PipelineRun driving this workflow run.
    pub async fn ensure_pipeline_run(&self) -> Result<PipelineRun> {
        let api: Api<PipelineRun> = Api::namespaced(self.ctx.client.clone(), &self.namespace);

        if let Some(existing) = api.get_opt(&self.wr.name_any()).await? {
            return Ok(existing);
        }

        info!("creating PipelineRun for WorkflowRun {}", self.wr.name_any());

        let service_account_names = self
            .wr
            .spec
            .workflow
            .steps
            .iter()
            .map(|step| PipelineRunSpecServiceAccountName {
                task_name: Step::new(&self.wr.spec.name, &step.name).hash().hex(),
                service_account_name: self
                    .service_account_name(SERVICE_ACCOUNT_IDENTIFIER_CUSTOMER),
            })
            .collect();

        let pipeline_run = PipelineRun {
            metadata: ObjectMeta {
                name: Some(self.wr.name_any()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.run_labels()),
                owner_references: Some(vec![self.owner_reference()]),
                ..Default::default()
            },
            spec: PipelineRunSpec {
                pipeline_ref: Some(PipelineRef {
                    name: self.wr.name_any(),
                }),
                service_account_name: Some(
                    self.service_account_name(SERVICE_ACCOUNT_IDENTIFIER_SYSTEM),
                ),
                service_account_names,
                pod_template: Some(PodTemplate {
                    node_selector: BTreeMap::from([(
                        "nebula.puppet.com/scheduling.customer-ready".to_string(),
                        "true".to_string(),
                    )]),
                    tolerations: vec![Toleration {
                        key: Some("nebula.puppet.com/scheduling.customer-workload".to_string()),
                        value: Some("true".to_string()),
                        effect: Some("NoSchedule".to_string()),
                        ..Default::default()
                    }],
                    dns_policy: Some("None".to_string()),
                    dns_config: Some(PodDNSConfig {
                        nameservers: Some(self.ctx.config.nameservers.clone()),
                        ..Default::default()
                    }),
                }),
                status: None,
            },
            status: None,
        };

        match api.create(&PostParams::default(), &pipeline_run).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(api.get(&self.wr.name_any()).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// Patches the PipelineRun's spec status to cancelled.
    pub async fn cancel_pipeline_run(&self, name: &str) -> Result<()> {
        let api: Api<PipelineRun> = Api::namespaced(self.ctx.client.clone(), &self.namespace);

        let Some(mut plr) = api.get_opt(name).await? else {
            return Ok(());
        };

        if plr.spec.status.as_deref() == Some(PIPELINE_RUN_SPEC_STATUS_CANCELLED) {
            return Ok(());
        }

        plr.spec.status = Some(PIPELINE_RUN_SPEC_STATUS_CANCELLED.to_string());
        api.replace(name, &PostParams::default(), &plr).await?;

        Ok(())
    }
}

/// Create, tolerating AlreadyExists from a concurrent reconcile.
async fn create_or_get<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: kube::Resource + Clone + std::fmt::Debug + Serialize + DeserializeOwned,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn resource_list(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(name, quantity)| ((*name).to_string(), Quantity((*quantity).to_string())))
        .collect()
}

/// Splits `network` into the largest subnets that cover it minus the given
/// addresses.
fn exclude_ips(network: Ipv4Net, ips: &[Ipv4Addr]) -> Vec<Ipv4Net> {
    if !ips.iter().any(|ip| network.contains(ip)) {
        return vec![network];
    }

    if network.prefix_len() == 32 {
        return vec![];
    }

    match network.subnets(network.prefix_len() + 1) {
        Ok(subnets) => subnets
            .flat_map(|subnet| exclude_ips(subnet, ips))
            .collect(),
        Err(_) => Vec::new(),
    }
}
