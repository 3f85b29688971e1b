//! RunnerSet Controller
//!
//! Materializes a StatefulSet-backed runner fleet: a registration-token
//! Secret, a headless Service for stable pod identities, and the
//! StatefulSet itself with the runner env contract injected.

use crate::conditions::{
    build_condition, from_resource_conditions, set_condition, CONDITION_FALSE, CONDITION_READY,
    CONDITION_TRUE, LABEL_OWNED_BY, RUNNER_SET_FINALIZER,
};
use crate::controllers::RunnerDefaults;
use crate::crd::{RunnerSet, RunnerSetStatus};
use crate::error::{OperatorError, Result};
use crate::provider::{ProviderClient, Target};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Secret, SecretKeySelector, SecurityContext, Service, ServicePort, ServiceSpec,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::error_policy_backoff;
use super::runner::registration_token_usable;
use crate::crd::RunnerRegistrationStatus;

const FIELD_MANAGER: &str = "fleetops-operator";

/// Annotation on the token Secret recording the token expiry.
const ANNOTATION_TOKEN_EXPIRES_AT: &str = "fleetops.io/token-expires-at";

/// Context for the runner set controller
pub struct RunnerSetController {
    client: Client,
    provider: Arc<dyn ProviderClient>,
    namespace: Option<String>,
    defaults: RunnerDefaults,
}

impl RunnerSetController {
    pub fn new(
        client: Client,
        provider: Arc<dyn ProviderClient>,
        namespace: Option<String>,
        defaults: RunnerDefaults,
    ) -> Self {
        Self {
            client,
            provider,
            namespace,
            defaults,
        }
    }

    /// Run the runner set controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let sets: Api<RunnerSet> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        info!("Starting RunnerSet controller");

        Controller::new(sets, Config::default())
            .shutdown_on_signal()
            .run(
                |set, ctx| async move { ctx.reconcile(set).await },
                |set, error, ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(set, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled runner set: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Reconcile a RunnerSet
    async fn reconcile(&self, set: Arc<RunnerSet>) -> std::result::Result<Action, OperatorError> {
        let name = set.name_any();
        let namespace = set.namespace().unwrap_or_else(|| "default".to_string());

        debug!("Reconciling RunnerSet {}/{}", namespace, name);

        if set.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(&set, &namespace).await;
        }

        self.ensure_finalizer(&set, &namespace).await?;

        let target = Target::from_config(&set.spec.config)?;
        self.reconcile_token_secret(&set, &namespace, &target).await?;
        self.reconcile_headless_service(&set, &namespace).await?;
        self.reconcile_statefulset(&set, &namespace).await?;
        self.update_status(&set, &namespace).await?;

        Ok(Action::requeue(self.defaults.sync_period))
    }

    /// Stateful runners share one registration credential per set, stored in
    /// a Secret and refreshed before expiry.
    async fn reconcile_token_secret(
        &self,
        set: &RunnerSet,
        namespace: &str,
        target: &Target,
    ) -> Result<()> {
        let secret_name = token_secret_name(&set.name_any());
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        if let Some(existing) = secrets.get_opt(&secret_name).await? {
            let expires_at = existing
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_TOKEN_EXPIRES_AT))
                .cloned();
            let cached = RunnerRegistrationStatus {
                token: Some("present".to_string()),
                expires_at,
                name: None,
            };
            if registration_token_usable(&Some(cached), Utc::now()) {
                return Ok(());
            }
        }

        info!(set = %set.name_any(), "Issuing registration token for set");
        let issued = self.provider.create_registration_token(target).await?;
        let secret = self.build_token_secret(set, namespace, &secret_name, &issued.token, issued.expires_at);

        match secrets.get_opt(&secret_name).await? {
            Some(_) => {
                secrets
                    .patch(
                        &secret_name,
                        &PatchParams::apply(FIELD_MANAGER).force(),
                        &Patch::Apply(&secret),
                    )
                    .await?;
            }
            None => {
                secrets.create(&PostParams::default(), &secret).await?;
            }
        }
        Ok(())
    }

    fn build_token_secret(
        &self,
        set: &RunnerSet,
        namespace: &str,
        secret_name: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(self.common_labels(set)),
                annotations: Some(BTreeMap::from([(
                    ANNOTATION_TOKEN_EXPIRES_AT.to_string(),
                    expires_at.to_rfc3339(),
                )])),
                owner_references: Some(vec![owner_reference(set)]),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([(
                "runner-token".to_string(),
                token.to_string(),
            )])),
            ..Default::default()
        }
    }

    /// Headless service giving StatefulSet pods stable DNS identities.
    async fn reconcile_headless_service(&self, set: &RunnerSet, namespace: &str) -> Result<()> {
        let name = format!("{}-headless", set.name_any());
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(self.common_labels(set)),
                owner_references: Some(vec![owner_reference(set)]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.pod_selector(set)),
                ports: Some(vec![ServicePort {
                    name: Some("metrics".to_string()),
                    port: 8080,
                    ..Default::default()
                }]),
                publish_not_ready_addresses: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        match services.get_opt(&name).await? {
            Some(_) => {
                services
                    .patch(
                        &name,
                        &PatchParams::apply(FIELD_MANAGER),
                        &Patch::Apply(&service),
                    )
                    .await?;
            }
            None => {
                services.create(&PostParams::default(), &service).await?;
            }
        }
        Ok(())
    }

    /// Reconcile the StatefulSet for the runner fleet
    async fn reconcile_statefulset(&self, set: &RunnerSet, namespace: &str) -> Result<()> {
        let name = set.name_any();
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);

        let statefulset = build_runner_statefulset(&self.defaults, set, namespace);

        match statefulsets.get_opt(&name).await? {
            Some(_) => {
                statefulsets
                    .patch(
                        &name,
                        &PatchParams::apply(FIELD_MANAGER),
                        &Patch::Apply(&statefulset),
                    )
                    .await?;
            }
            None => {
                statefulsets
                    .create(&PostParams::default(), &statefulset)
                    .await?;
            }
        }
        Ok(())
    }

    async fn update_status(&self, set: &RunnerSet, namespace: &str) -> Result<()> {
        let name = set.name_any();
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let observed = statefulsets.get_opt(&name).await?;

        let (replicas, ready) = observed
            .and_then(|s| s.status)
            .map(|s| (s.replicas, s.ready_replicas.unwrap_or(0)))
            .unwrap_or((0, 0));

        let previous = set.status.clone().unwrap_or_default();
        let mut cond_fields = from_resource_conditions(&previous.conditions);
        let desired = set.spec.replicas;
        let (status_value, reason, message) = if ready == desired {
            (
                CONDITION_TRUE,
                "AllRunnersReady",
                format!("{}/{} runner pods ready", ready, desired),
            )
        } else {
            (
                CONDITION_FALSE,
                "RunnersNotReady",
                format!("{}/{} runner pods ready", ready, desired),
            )
        };
        set_condition(
            &mut cond_fields,
            build_condition(CONDITION_READY, status_value, reason, &message),
        );

        let status = RunnerSetStatus {
            replicas,
            ready_replicas: ready,
            observed_generation: set.metadata.generation,
            conditions: cond_fields
                .into_iter()
                .map(|c| c.into_resource_condition())
                .collect(),
        };

        let sets: Api<RunnerSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        sets.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn handle_deletion(
        &self,
        set: &RunnerSet,
        namespace: &str,
    ) -> std::result::Result<Action, OperatorError> {
        let name = set.name_any();
        let finalizers = set.metadata.finalizers.as_deref().unwrap_or_default();
        if !finalizers.contains(&RUNNER_SET_FINALIZER.to_string()) {
            return Ok(Action::await_change());
        }

        info!("Handling deletion of RunnerSet {}/{}", namespace, name);

        // Registered-but-gone pods leave stale registry entries behind;
        // sweep any registration bearing this set's pod name prefix.
        let target = Target::from_config(&set.spec.config)?;
        let prefix = format!("{}-", name);
        match self.provider.list_runners(&target).await {
            Ok(listed) => {
                for info in listed.iter().filter(|r| r.name.starts_with(&prefix)) {
                    match self.provider.remove_runner(&target, info.id).await {
                        Ok(()) | Err(OperatorError::NotFound(_)) => {}
                        Err(OperatorError::Conflict(_)) => {
                            debug!(runner = %info.name, "Runner busy, delaying set deletion");
                            return Ok(Action::requeue(self.defaults.unregistration_retry_delay));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) if e.is_transient() => return Err(e),
            Err(_) => {}
        }

        let sets: Api<RunnerSet> = Api::namespaced(self.client.clone(), namespace);
        let remaining: Vec<String> = finalizers
            .iter()
            .filter(|f| f.as_str() != RUNNER_SET_FINALIZER)
            .cloned()
            .collect();
        let patch = serde_json::json!({
            "metadata": { "finalizers": remaining }
        });
        sets.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!("Finalizer removed for RunnerSet {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    async fn ensure_finalizer(&self, set: &RunnerSet, namespace: &str) -> Result<()> {
        let finalizers = set.metadata.finalizers.as_deref().unwrap_or_default();
        if finalizers.contains(&RUNNER_SET_FINALIZER.to_string()) {
            return Ok(());
        }

        let sets: Api<RunnerSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": { "finalizers": [RUNNER_SET_FINALIZER] }
        });
        sets.patch(
            &set.name_any(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;
        Ok(())
    }

    fn common_labels(&self, set: &RunnerSet) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "fleetops-runner".to_string());
        labels.insert("app.kubernetes.io/instance".to_string(), set.name_any());
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "fleetops-operator".to_string(),
        );
        labels
    }

    fn pod_selector(&self, set: &RunnerSet) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("app.kubernetes.io/name".to_string(), "fleetops-runner".to_string());
        labels.insert("app.kubernetes.io/instance".to_string(), set.name_any());
        labels
    }
}

/// Derive the StatefulSet for a RunnerSet.
pub(crate) fn build_runner_statefulset(
    defaults: &RunnerDefaults,
    set: &RunnerSet,
    namespace: &str,
) -> StatefulSet {
    let name = set.name_any();
    let config = &set.spec.config;
    let pod_spec = &set.spec.pod;

    let mut selector = BTreeMap::new();
    selector.insert("app.kubernetes.io/name".to_string(), "fleetops-runner".to_string());
    selector.insert("app.kubernetes.io/instance".to_string(), name.clone());

    let mut labels = selector.clone();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "fleetops-operator".to_string(),
    );
    labels.insert(LABEL_OWNED_BY.to_string(), name.clone());

    let mut env = vec![
        EnvVar {
            name: "RUNNER_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(k8s_openapi::api::core::v1::ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "RUNNER_TOKEN".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(token_secret_name(&name)),
                    key: "runner-token".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        plain_env("RUNNER_LABELS", &config.labels.join(",")),
        plain_env("RUNNER_GROUP", config.group.as_deref().unwrap_or_default()),
        plain_env("RUNNER_EPHEMERAL", &config.ephemeral.to_string()),
        plain_env("RUNNER_WORKDIR", &pod_spec.work_dir),
        plain_env("DOCKER_ENABLED", &config.docker_enabled.to_string()),
        plain_env("DOCKERD_IN_RUNNER", &config.dockerd_within_runner.to_string()),
    ];
    if let Some(enterprise) = &config.enterprise {
        env.push(plain_env("RUNNER_ENTERPRISE", enterprise));
    }
    if let Some(organization) = &config.organization {
        env.push(plain_env("RUNNER_ORG", organization));
    }
    if let Some(repository) = &config.repository {
        env.push(plain_env("RUNNER_REPO", repository));
    }
    if let Some(mirror) = &config.docker_registry_mirror {
        env.push(plain_env("DOCKER_REGISTRY_MIRROR", mirror));
    }
    for custom in &pod_spec.env {
        env.push(EnvVar {
            name: custom.name.clone(),
            value: custom.value.clone(),
            ..Default::default()
        });
    }

    let needs_sidecar = config.docker_enabled && !config.dockerd_within_runner;
    if needs_sidecar {
        env.push(plain_env("DOCKER_HOST", "tcp://localhost:2375"));
    }

    let runner_container = Container {
        name: "runner".to_string(),
        image: Some(
            config
                .image
                .clone()
                .unwrap_or_else(|| defaults.runner_image.clone()),
        ),
        image_pull_policy: Some(config.image_pull_policy.clone()),
        env: Some(env),
        volume_mounts: Some(vec![VolumeMount {
            name: "work".to_string(),
            mount_path: pod_spec.work_dir.clone(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let mut containers = vec![runner_container];
    if needs_sidecar {
        containers.push(Container {
            name: "docker".to_string(),
            image: Some(
                config
                    .docker_image
                    .clone()
                    .unwrap_or_else(|| defaults.docker_image.clone()),
            ),
            env: Some(vec![plain_env("DOCKER_TLS_CERTDIR", "")]),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: "work".to_string(),
                mount_path: pod_spec.work_dir.clone(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    // Per-replica work volume: a claim template when configured, otherwise
    // pods fall back to an emptyDir added via `volumes`.
    let (volume_claim_templates, volumes) = match &pod_spec.work_volume_claim_template {
        Some(tpl) => (
            Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("work".to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(tpl.access_modes.clone()),
                    storage_class_name: tpl.storage_class_name.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(tpl.size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            None,
        ),
        None => (
            None,
            Some(vec![k8s_openapi::api::core::v1::Volume {
                name: "work".to_string(),
                empty_dir: Some(Default::default()),
                ..Default::default()
            }]),
        ),
    };

    let pod_template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(selector.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            service_account_name: pod_spec.service_account_name.clone(),
            node_selector: if pod_spec.node_selector.is_empty() {
                None
            } else {
                Some(pod_spec.node_selector.clone())
            },
            volumes,
            ..Default::default()
        }),
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(set)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(set.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            service_name: format!("{}-headless", name),
            template: pod_template,
            volume_claim_templates,
            pod_management_policy: Some("Parallel".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn token_secret_name(set: &str) -> String {
    format!("{}-registration", set)
}

fn owner_reference(set: &RunnerSet) -> OwnerReference {
    OwnerReference {
        api_version: RunnerSet::api_version(&()).to_string(),
        kind: RunnerSet::kind(&()).to_string(),
        name: set.name_any(),
        uid: set.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
