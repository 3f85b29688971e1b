//! Runner Controller
//!
//! Owns the registration state machine for each `Runner`: every pod that
//! starts running first holds a valid registration token, and every pod
//! that goes away is deregistered from the Provider first — unless the
//! runner is mid-job, in which case deletion is delayed.

use crate::conditions::{
    build_condition, from_resource_conditions, set_condition, ANNOTATION_FORCE_EVICTION,
    CONDITION_FALSE, CONDITION_READY, CONDITION_TRUE, LABEL_OWNED_BY, LABEL_TEMPLATE_HASH,
    RUNNER_FINALIZER,
};
use crate::crd::{Runner, RunnerPhase, RunnerRegistrationStatus, RunnerStatus, WorkflowStatus};
use crate::error::{OperatorError, Result};
use crate::hash::{default_hash_exclusions, template_hash};
use crate::provider::{ProviderClient, Target};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EphemeralVolumeSource, PersistentVolumeClaimSpec,
    PersistentVolumeClaimTemplate, Pod, PodSpec, SecurityContext, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error_policy_backoff;

/// Issue a fresh token once the cached one is this close to expiry.
const TOKEN_EXPIRY_SAFETY_MARGIN_SECS: i64 = 600;

/// Give up on a runner after this many consecutive registration failures.
const MAX_REGISTRATION_FAILURES: i32 = 5;

const FIELD_MANAGER: &str = "fleetops-operator";

/// Controller-level defaults and timings for runner pods.
#[derive(Debug, Clone)]
pub struct RunnerDefaults {
    /// Runner image used when the template doesn't set one
    pub runner_image: String,
    /// Docker sidecar image used when the template doesn't set one
    pub docker_image: String,
    /// Image pull secrets added to every runner pod
    pub image_pull_secrets: Vec<String>,
    /// Storage class used for work volumes that don't name one
    pub hook_storage_class: String,
    /// Requested size for hook-provisioned work volumes
    pub hook_storage_size: String,
    /// How often to poll the Provider while a runner is registering
    pub registration_recheck_interval: Duration,
    /// Random spread added to the recheck interval
    pub registration_recheck_jitter: Duration,
    /// Requeue delay while a busy runner blocks deregistration
    pub unregistration_retry_delay: Duration,
    /// Steady-state resync period for running runners
    pub sync_period: Duration,
}

impl Default for RunnerDefaults {
    fn default() -> Self {
        Self {
            runner_image: "fleetops/runner:latest".to_string(),
            docker_image: "docker:dind".to_string(),
            image_pull_secrets: Vec::new(),
            hook_storage_class: "default".to_string(),
            hook_storage_size: "5Gi".to_string(),
            registration_recheck_interval: Duration::from_secs(60),
            registration_recheck_jitter: Duration::from_secs(10),
            unregistration_retry_delay: Duration::from_secs(30),
            sync_period: Duration::from_secs(60),
        }
    }
}

/// Context for the runner controller
pub struct RunnerController {
    client: Client,
    provider: Arc<dyn ProviderClient>,
    namespace: Option<String>,
    defaults: RunnerDefaults,
}

impl RunnerController {
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

    /// Run the runner controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let runners: Api<Runner> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        info!("Starting Runner controller");

        Controller::new(runners, Config::default())
            .shutdown_on_signal()
            .run(
                |runner, ctx| async move { ctx.reconcile(runner).await },
                |runner, error, ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(runner, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled runner: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Reconcile a Runner
    async fn reconcile(&self, runner: Arc<Runner>) -> std::result::Result<Action, OperatorError> {
        let name = runner.name_any();
        let namespace = runner.namespace().unwrap_or_else(|| "default".to_string());

        debug!("Reconciling Runner {}/{}", namespace, name);

        if runner.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(&runner, &namespace).await;
        }

        self.ensure_finalizer(&runner, &namespace).await?;

        let target = Target::from_config(&runner.spec.config)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pod = match pods.get_opt(&name).await {
            Ok(p) => p,
            Err(e) => return Err(e.into()),
        };

        match pod {
            None => self.reconcile_missing_pod(&runner, &namespace, &target).await,
            Some(pod) => self.reconcile_existing_pod(&runner, &namespace, &target, pod).await,
        }
    }

    /// No pod yet: make sure the registration token is usable, then create
    /// the pod with the token injected.
    async fn reconcile_missing_pod(
        &self,
        runner: &Runner,
        namespace: &str,
        target: &Target,
    ) -> std::result::Result<Action, OperatorError> {
        let name = runner.name_any();
        let status = runner.status.clone().unwrap_or_default();

        if status.registration_failures >= MAX_REGISTRATION_FAILURES {
            warn!(runner = %name, "Registration retries exhausted");
            self.patch_status(runner, namespace, |s| {
                s.phase = RunnerPhase::Failed;
                s.ready = false;
                s.message = Some(format!(
                    "registration failed {} times",
                    s.registration_failures
                ));
            })
            .await?;
            return Ok(Action::await_change());
        }

        let registration = if registration_token_usable(&status.registration, Utc::now()) {
            status.registration.clone().unwrap_or_default()
        } else {
            info!(runner = %name, "Issuing registration token");
            let issued = self.provider.create_registration_token(target).await?;
            let registration = RunnerRegistrationStatus {
                token: Some(issued.token),
                expires_at: Some(issued.expires_at.to_rfc3339()),
                name: Some(name.clone()),
            };
            let registration_for_status = registration.clone();
            self.patch_status(runner, namespace, move |s| {
                s.phase = RunnerPhase::Pending;
                s.registration = Some(registration_for_status);
            })
            .await?;
            registration
        };

        let pod = self.build_pod(runner, namespace, &registration)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!(runner = %name, "Created runner pod");
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Lost a race with a previous create; observe it next pass
                debug!(runner = %name, "Pod already exists");
            }
            Err(e) => return Err(e.into()),
        }

        self.patch_status(runner, namespace, |s| {
            s.phase = RunnerPhase::Registering;
            s.ready = false;
            s.message = None;
        })
        .await?;

        Ok(Action::requeue(self.recheck_interval()))
    }

    /// A pod exists: detect drift, watch registration progress and job
    /// completion.
    async fn reconcile_existing_pod(
        &self,
        runner: &Runner,
        namespace: &str,
        target: &Target,
        pod: Pod,
    ) -> std::result::Result<Action, OperatorError> {
        let name = runner.name_any();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let status = runner.status.clone().unwrap_or_default();

        if pod.metadata.deletion_timestamp.is_some() {
            return Ok(Action::requeue(self.recheck_interval()));
        }

        // Template drift: recreate, never mutate in place
        let desired_hash = self.runner_hash(runner)?;
        let observed_hash = pod
            .labels()
            .get(LABEL_TEMPLATE_HASH)
            .cloned()
            .unwrap_or_default();
        if observed_hash != desired_hash {
            info!(runner = %name, "Pod template drift detected, recreating pod");
            pods.delete(&name, &DeleteParams::default()).await?;
            self.patch_status(runner, namespace, |s| {
                s.phase = RunnerPhase::Pending;
                s.ready = false;
            })
            .await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }

        let pod_phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();

        match pod_phase.as_str() {
            "Succeeded" => {
                // An ephemeral runner that exited cleanly has finished its
                // job; the set replaces it with a fresh Runner.
                if runner.spec.config.ephemeral {
                    info!(runner = %name, "Ephemeral runner completed, deleting");
                    let runners: Api<Runner> = Api::namespaced(self.client.clone(), namespace);
                    runners.delete(&name, &DeleteParams::default()).await?;
                    return Ok(Action::await_change());
                }
                // Persistent runners restart with a fresh pod
                info!(runner = %name, "Runner pod exited, restarting");
                pods.delete(&name, &DeleteParams::default()).await?;
                self.patch_status(runner, namespace, |s| {
                    s.phase = RunnerPhase::Pending;
                    s.ready = false;
                })
                .await?;
                Ok(Action::requeue(Duration::from_secs(1)))
            }
            "Failed" => {
                warn!(runner = %name, "Runner pod failed, recreating");
                pods.delete(&name, &DeleteParams::default()).await?;
                self.patch_status(runner, namespace, |s| {
                    s.phase = RunnerPhase::Pending;
                    s.ready = false;
                    s.registration_failures += 1;
                })
                .await?;
                Ok(Action::requeue(self.recheck_interval()))
            }
            _ => {
                if status.ready {
                    self.observe_running(runner, namespace, target).await
                } else {
                    self.check_registration(runner, namespace, target).await
                }
            }
        }
    }

    /// Poll the Provider list until this runner appears.
    async fn check_registration(
        &self,
        runner: &Runner,
        namespace: &str,
        target: &Target,
    ) -> std::result::Result<Action, OperatorError> {
        let name = runner.name_any();
        let status = runner.status.clone().unwrap_or_default();

        // A token that lapsed before registration completed can never
        // succeed; recreate the pod with a fresh one.
        if !registration_token_usable(&status.registration, Utc::now()) {
            warn!(runner = %name, "Registration token expired before registration completed");
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            pods.delete(&name, &DeleteParams::default()).await?;
            self.patch_status(runner, namespace, |s| {
                s.phase = RunnerPhase::Pending;
                s.ready = false;
                s.registration_failures += 1;
            })
            .await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }

        let listed = self.provider.list_runners(target).await?;
        let registered = listed.iter().find(|r| r.name == name);

        let now = Utc::now().to_rfc3339();
        match registered {
            Some(info) => {
                info!(runner = %name, "Runner registered with Provider");
                let busy = info.busy;
                self.patch_status(runner, namespace, move |s| {
                    s.phase = RunnerPhase::Running;
                    s.ready = true;
                    s.registration_failures = 0;
                    s.last_registration_check_time = Some(now);
                    s.workflow = if busy {
                        Some(WorkflowStatus {
                            status: Some("in_progress".to_string()),
                            job_id: None,
                        })
                    } else {
                        None
                    };
                })
                .await?;
                Ok(Action::requeue(self.defaults.sync_period))
            }
            None => {
                debug!(runner = %name, "Runner not yet in Provider list");
                self.patch_status(runner, namespace, move |s| {
                    s.phase = RunnerPhase::Registering;
                    s.last_registration_check_time = Some(now);
                })
                .await?;
                Ok(Action::requeue(self.recheck_interval()))
            }
        }
    }

    /// Steady state: refresh the busy flag and readiness.
    async fn observe_running(
        &self,
        runner: &Runner,
        namespace: &str,
        target: &Target,
    ) -> std::result::Result<Action, OperatorError> {
        let name = runner.name_any();
        let listed = self.provider.list_runners(target).await?;
        let info = listed.iter().find(|r| r.name == name);

        let now = Utc::now().to_rfc3339();
        match info {
            Some(info) => {
                let busy = info.busy;
                let online = info.status == "online";
                self.patch_status(runner, namespace, move |s| {
                    s.ready = online;
                    s.last_registration_check_time = Some(now);
                    s.workflow = if busy {
                        Some(WorkflowStatus {
                            status: Some("in_progress".to_string()),
                            job_id: None,
                        })
                    } else {
                        None
                    };
                })
                .await?;
            }
            None => {
                // Fell out of the registry (e.g. removed manually); go back
                // through registration.
                warn!(runner = %name, "Runner disappeared from Provider registry");
                self.patch_status(runner, namespace, move |s| {
                    s.phase = RunnerPhase::Registering;
                    s.ready = false;
                    s.last_registration_check_time = Some(now);
                    s.workflow = None;
                })
                .await?;
            }
        }

        Ok(Action::requeue(self.defaults.sync_period))
    }

    /// Deregistration with safety: a busy runner is only removed when its
    /// job is known to be finished or eviction is forced.
    async fn handle_deletion(
        &self,
        runner: &Runner,
        namespace: &str,
    ) -> std::result::Result<Action, OperatorError> {
        let name = runner.name_any();
        let finalizers = runner.metadata.finalizers.as_deref().unwrap_or_default();
        if !finalizers.contains(&RUNNER_FINALIZER.to_string()) {
            return Ok(Action::await_change());
        }

        info!("Deregistering Runner {}/{}", namespace, name);

        let target = Target::from_config(&runner.spec.config)?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get_opt(&name).await?;

        let force_evict = runner
            .annotations()
            .get(ANNOTATION_FORCE_EVICTION)
            .map(|v| v == "true")
            .unwrap_or(false);
        let pod_succeeded = pod
            .as_ref()
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.phase.as_deref())
            == Some("Succeeded");
        let ephemeral_completed = runner.spec.config.ephemeral && pod_succeeded;

        let listed = self.provider.list_runners(&target).await?;
        let registered = listed.iter().find(|r| r.name == name);

        if let Some(info) = registered {
            if info.busy && !force_evict && !ephemeral_completed {
                debug!(runner = %name, "Runner busy, delaying deregistration");
                self.patch_status(runner, namespace, |s| {
                    s.phase = RunnerPhase::Terminating;
                    s.message = Some("waiting for in-flight job to finish".to_string());
                })
                .await?;
                return Ok(Action::requeue(self.defaults.unregistration_retry_delay));
            }

            match self.provider.remove_runner(&target, info.id).await {
                Ok(()) => {
                    info!(runner = %name, "Deregistered runner from Provider");
                }
                // Already gone: idempotent success
                Err(OperatorError::NotFound(_)) => {
                    debug!(runner = %name, "Runner already absent from Provider");
                }
                // The Provider assigned a new job between our check and the
                // removal; back off and retry.
                Err(OperatorError::Conflict(_)) => {
                    debug!(runner = %name, "Runner picked up a job mid-removal, retrying");
                    return Ok(Action::requeue(self.defaults.unregistration_retry_delay));
                }
                Err(e) => return Err(e),
            }
        }

        if pod.is_some() {
            let _ = pods.delete(&name, &DeleteParams::default()).await;
        }

        self.remove_finalizer(runner, namespace).await?;
        info!("Finalizer removed for Runner {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    async fn ensure_finalizer(&self, runner: &Runner, namespace: &str) -> Result<()> {
        let finalizers = runner.metadata.finalizers.as_deref().unwrap_or_default();
        if finalizers.contains(&RUNNER_FINALIZER.to_string()) {
            return Ok(());
        }

        let runners: Api<Runner> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": [RUNNER_FINALIZER]
            }
        });
        runners
            .patch(
                &runner.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, runner: &Runner, namespace: &str) -> Result<()> {
        let runners: Api<Runner> = Api::namespaced(self.client.clone(), namespace);
        let finalizers: Vec<String> = runner
            .metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|f| f.as_str() != RUNNER_FINALIZER)
            .cloned()
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        runners
            .patch(&runner.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Patch the runner status with conditions derived from the new phase.
    async fn patch_status<F>(&self, runner: &Runner, namespace: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RunnerStatus),
    {
        let mut status = runner.status.clone().unwrap_or_default();
        mutate(&mut status);

        let mut cond_fields = from_resource_conditions(&status.conditions);
        let (ready_status, reason, message) = if status.ready {
            (CONDITION_TRUE, "Registered", "runner is online".to_string())
        } else {
            (
                CONDITION_FALSE,
                "NotRegistered",
                format!("runner phase is {:?}", status.phase),
            )
        };
        set_condition(
            &mut cond_fields,
            build_condition(CONDITION_READY, ready_status, reason, &message),
        );
        status.conditions = cond_fields
            .into_iter()
            .map(|c| c.into_resource_condition())
            .collect();

        let runners: Api<Runner> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        runners
            .patch_status(&runner.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    fn recheck_interval(&self) -> Duration {
        let jitter_ms = self.defaults.registration_recheck_jitter.as_millis() as u64;
        let spread = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        self.defaults.registration_recheck_interval + Duration::from_millis(spread)
    }

    fn runner_hash(&self, runner: &Runner) -> Result<String> {
        template_hash(&runner.spec, &default_hash_exclusions())
    }

    fn build_pod(
        &self,
        runner: &Runner,
        namespace: &str,
        registration: &RunnerRegistrationStatus,
    ) -> Result<Pod> {
        build_runner_pod(&self.defaults, runner, namespace, registration)
    }
}

/// Derive the backing pod from the runner spec and the cached registration
/// credential.
pub(crate) fn build_runner_pod(
    defaults: &RunnerDefaults,
    runner: &Runner,
    namespace: &str,
    registration: &RunnerRegistrationStatus,
) -> Result<Pod> {
    let name = runner.name_any();
    let config = &runner.spec.config;
    let pod_spec = &runner.spec.pod;

    let mut labels: BTreeMap<String, String> = runner.labels().clone();
    labels.insert(
        LABEL_TEMPLATE_HASH.to_string(),
        template_hash(&runner.spec, &default_hash_exclusions())?,
    );
    labels.insert(LABEL_OWNED_BY.to_string(), name.clone());

    let token = registration.token.clone().ok_or_else(|| {
        OperatorError::InvalidState("pod build requires a registration token".to_string())
    })?;

    let mut env = vec![
        env_var("RUNNER_NAME", &name),
        env_var("RUNNER_TOKEN", &token),
        env_var("RUNNER_LABELS", &config.labels.join(",")),
        env_var("RUNNER_GROUP", config.group.as_deref().unwrap_or_default()),
        env_var("RUNNER_EPHEMERAL", &config.ephemeral.to_string()),
        env_var("RUNNER_WORKDIR", &pod_spec.work_dir),
        env_var("DOCKER_ENABLED", &config.docker_enabled.to_string()),
        env_var("DOCKERD_IN_RUNNER", &config.dockerd_within_runner.to_string()),
    ];
    if let Some(enterprise) = &config.enterprise {
        env.push(env_var("RUNNER_ENTERPRISE", enterprise));
    }
    if let Some(organization) = &config.organization {
        env.push(env_var("RUNNER_ORG", organization));
    }
    if let Some(repository) = &config.repository {
        env.push(env_var("RUNNER_REPO", repository));
    }
    if let Some(mirror) = &config.docker_registry_mirror {
        env.push(env_var("DOCKER_REGISTRY_MIRROR", mirror));
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
        env.push(env_var("DOCKER_HOST", "tcp://localhost:2375"));
        env.push(env_var(
            "DOCKER_IMAGE",
            config.docker_image.as_deref().unwrap_or(&defaults.docker_image),
        ));
    }

    let work_volume = match &pod_spec.work_volume_claim_template {
        Some(tpl) => Volume {
            name: "work".to_string(),
            ephemeral: Some(EphemeralVolumeSource {
                volume_claim_template: Some(PersistentVolumeClaimTemplate {
                    spec: PersistentVolumeClaimSpec {
                        access_modes: Some(tpl.access_modes.clone()),
                        storage_class_name: Some(
                            tpl.storage_class_name
                                .clone()
                                .unwrap_or_else(|| defaults.hook_storage_class.clone()),
                        ),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(BTreeMap::from([(
                                "storage".to_string(),
                                Quantity(if tpl.size.is_empty() {
                                    defaults.hook_storage_size.clone()
                                } else {
                                    tpl.size.clone()
                                }),
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    ..Default::default()
                }),
            }),
            ..Default::default()
        },
        None => Volume {
            name: "work".to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        },
    };

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
        resources: Some(build_resource_requirements(&pod_spec.resources)),
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
            env: Some(vec![
                env_var("DOCKER_TLS_CERTDIR", ""),
            ]),
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

    let image_pull_secrets: Vec<_> = pod_spec
        .image_pull_secrets
        .iter()
        .chain(defaults.image_pull_secrets.iter())
        .map(|s| k8s_openapi::api::core::v1::LocalObjectReference { name: Some(s.clone()) })
        .collect();

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(runner)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            restart_policy: Some(if config.ephemeral {
                "Never".to_string()
            } else {
                "OnFailure".to_string()
            }),
            service_account_name: pod_spec.service_account_name.clone(),
            node_selector: if pod_spec.node_selector.is_empty() {
                None
            } else {
                Some(pod_spec.node_selector.clone())
            },
            image_pull_secrets: if image_pull_secrets.is_empty() {
                None
            } else {
                Some(image_pull_secrets)
            },
            volumes: Some(vec![work_volume]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// A cached token is usable while it stays clear of the safety margin.
pub(crate) fn registration_token_usable(
    registration: &Option<RunnerRegistrationStatus>,
    now: DateTime<Utc>,
) -> bool {
    let Some(registration) = registration else {
        return false;
    };
    if registration.token.as_deref().unwrap_or_default().is_empty() {
        return false;
    }
    let Some(expires_at) = registration
        .expires_at
        .as_deref()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    else {
        return false;
    };
    expires_at.with_timezone(&Utc) - now > ChronoDuration::seconds(TOKEN_EXPIRY_SAFETY_MARGIN_SECS)
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn owner_reference(runner: &Runner) -> OwnerReference {
    OwnerReference {
        api_version: Runner::api_version(&()).to_string(),
        kind: Runner::kind(&()).to_string(),
        name: runner.name_any(),
        uid: runner.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn build_resource_requirements(
    spec: &crate::crd::ResourceRequirements,
) -> k8s_openapi::api::core::v1::ResourceRequirements {
    let mut limits = BTreeMap::new();
    let mut requests = BTreeMap::new();

    if let Some(cpu) = &spec.limits.cpu {
        limits.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.limits.memory {
        limits.insert("memory".to_string(), Quantity(memory.clone()));
    }
    if let Some(cpu) = &spec.requests.cpu {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &spec.requests.memory {
        requests.insert("memory".to_string(), Quantity(memory.clone()));
    }

    k8s_openapi::api::core::v1::ResourceRequirements {
        limits: if limits.is_empty() { None } else { Some(limits) },
        requests: if requests.is_empty() {
            None
        } else {
            Some(requests)
        },
        ..Default::default()
    }
}
