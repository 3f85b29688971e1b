//! RunnerDeployment Controller
//!
//! Presents a stable, updatable handle to a fleet. Each template revision
//! maps to one child RunnerReplicaSet named by the template hash; rollouts
//! move replicas from stale children to the active one and garbage-collect
//! children once drained.

use crate::conditions::{
    build_condition, from_resource_conditions, set_condition, CONDITION_AVAILABLE,
    CONDITION_FALSE, CONDITION_PROGRESSING, CONDITION_TRUE, LABEL_TEMPLATE_HASH,
};
use crate::crd::{
    RunnerDeployment, RunnerDeploymentStatus, RunnerReplicaSet, RunnerReplicaSetSpec,
    RunnerTemplate,
};
use crate::error::{OperatorError, Result};
use crate::hash::{default_hash_exclusions, template_hash};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::error_policy_backoff;

const FIELD_MANAGER: &str = "fleetops-operator";

/// Context for the deployment controller
pub struct RunnerDeploymentController {
    client: Client,
    namespace: Option<String>,
    /// Registration labels inherited by every runner the controller creates
    common_runner_labels: Vec<String>,
    sync_period: Duration,
}

impl RunnerDeploymentController {
    pub fn new(
        client: Client,
        namespace: Option<String>,
        common_runner_labels: Vec<String>,
        sync_period: Duration,
    ) -> Self {
        Self {
            client,
            namespace,
            common_runner_labels,
            sync_period,
        }
    }

    /// Run the deployment controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let deployments: Api<RunnerDeployment> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        info!("Starting RunnerDeployment controller");

        Controller::new(deployments, Config::default())
            .shutdown_on_signal()
            .run(
                |deployment, ctx| async move { ctx.reconcile(deployment).await },
                |deployment, error, ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(deployment, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled deployment: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Reconcile a RunnerDeployment
    async fn reconcile(
        &self,
        deployment: Arc<RunnerDeployment>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = deployment.name_any();
        let namespace = deployment.namespace().unwrap_or_else(|| "default".to_string());

        debug!("Reconciling RunnerDeployment {}/{}", namespace, name);

        if deployment.metadata.deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        let template = self.effective_template(&deployment);
        let desired_hash = template_hash(&template, &default_hash_exclusions())?;
        let desired_replicas = deployment.spec.replicas.unwrap_or(1).max(0);

        let children = self.list_owned_sets(&deployment, &namespace).await?;
        let (active, stale): (Vec<_>, Vec<_>) = children.into_iter().partition(|set| {
            set.labels().get(LABEL_TEMPLATE_HASH).map(String::as_str) == Some(desired_hash.as_str())
        });

        let sets: Api<RunnerReplicaSet> = Api::namespaced(self.client.clone(), &namespace);

        let active = match active.into_iter().next() {
            Some(set) => set,
            None => {
                // New revision: the child starts at zero and receives
                // replicas through the rollout plan below.
                info!(deployment = %name, hash = %desired_hash, "Creating replica set for new template revision");
                let set = self.build_child_set(&deployment, &namespace, &template, &desired_hash)?;
                match sets.create(&PostParams::default(), &set).await {
                    Ok(created) => created,
                    Err(kube::Error::Api(ae)) if ae.code == 409 => {
                        sets.get(&child_set_name(&name, &desired_hash)).await?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let stale_current: i32 = stale.iter().map(|s| s.spec.replicas.max(0)).sum();
        let plan = plan_rollout(
            &deployment.spec.strategy.r#type,
            desired_replicas,
            active.spec.replicas.max(0),
            stale_current,
        );

        if active.spec.replicas != plan.active_replicas {
            debug!(
                deployment = %name,
                from = active.spec.replicas,
                to = plan.active_replicas,
                "Scaling active replica set"
            );
            self.patch_set_replicas(&sets, &active.name_any(), plan.active_replicas)
                .await?;
        }

        let mut remaining = plan.stale_replicas_total;
        let mut stale_sorted = stale;
        // Newest generation first keeps the freshest stale runners alive
        // longest during a rolling transition.
        stale_sorted.sort_by(|a, b| b.spec.effective_time.cmp(&a.spec.effective_time));

        for set in &stale_sorted {
            let keep = remaining.min(set.spec.replicas.max(0));
            remaining -= keep;
            if set.spec.replicas != keep {
                debug!(
                    deployment = %name,
                    set = %set.name_any(),
                    from = set.spec.replicas,
                    to = keep,
                    "Scaling stale replica set"
                );
                self.patch_set_replicas(&sets, &set.name_any(), keep).await?;
            }
        }

        // Drained stale sets with no remaining runners are collected
        for set in &stale_sorted {
            let live = set.status.as_ref().map(|s| s.replicas).unwrap_or(0);
            if set.spec.replicas == 0 && live == 0 {
                info!(deployment = %name, set = %set.name_any(), "Deleting drained replica set");
                match sets.delete(&set.name_any(), &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.update_status(&deployment, &namespace, &active, &stale_sorted, &desired_hash, desired_replicas)
            .await?;

        Ok(Action::requeue(self.sync_period))
    }

    /// The deployment template with controller-wide runner labels merged in.
    fn effective_template(&self, deployment: &RunnerDeployment) -> RunnerTemplate {
        let mut template = deployment.spec.template.clone();
        for label in &self.common_runner_labels {
            if !template.spec.config.labels.contains(label) {
                template.spec.config.labels.push(label.clone());
            }
        }
        template
    }

    async fn list_owned_sets(
        &self,
        deployment: &RunnerDeployment,
        namespace: &str,
    ) -> Result<Vec<RunnerReplicaSet>> {
        let sets: Api<RunnerReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let selector = deployment
            .spec
            .effective_selector()
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let list = sets.list(&ListParams::default().labels(&selector)).await?;
        let own_uid = deployment.metadata.uid.clone().unwrap_or_default();

        Ok(list
            .items
            .into_iter()
            .filter(|s| {
                s.metadata
                    .owner_references
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|o| o.uid == own_uid && o.controller.unwrap_or(false))
            })
            .collect())
    }

    fn build_child_set(
        &self,
        deployment: &RunnerDeployment,
        namespace: &str,
        template: &RunnerTemplate,
        hash: &str,
    ) -> Result<RunnerReplicaSet> {
        let mut template = template.clone();
        template
            .metadata
            .labels
            .insert(LABEL_TEMPLATE_HASH.to_string(), hash.to_string());

        let mut selector = deployment.spec.effective_selector();
        selector
            .match_labels
            .insert(LABEL_TEMPLATE_HASH.to_string(), hash.to_string());

        let mut labels: BTreeMap<String, String> = deployment.spec.effective_selector().match_labels;
        labels.insert(LABEL_TEMPLATE_HASH.to_string(), hash.to_string());

        Ok(RunnerReplicaSet {
            metadata: ObjectMeta {
                name: Some(child_set_name(&deployment.name_any(), hash)),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                owner_references: Some(vec![owner_reference(deployment)]),
                ..Default::default()
            },
            spec: RunnerReplicaSetSpec {
                replicas: 0,
                selector,
                template,
                effective_time: Some(Utc::now().to_rfc3339()),
            },
            status: None,
        })
    }

    async fn patch_set_replicas(
        &self,
        sets: &Api<RunnerReplicaSet>,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "spec": {
                "replicas": replicas,
                "effectiveTime": Utc::now().to_rfc3339(),
            }
        });
        sets.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        deployment: &RunnerDeployment,
        namespace: &str,
        active: &RunnerReplicaSet,
        stale: &[RunnerReplicaSet],
        hash: &str,
        desired: i32,
    ) -> Result<()> {
        let sum = |f: fn(&crate::crd::RunnerReplicaSetStatus) -> i32| -> i32 {
            std::iter::once(active)
                .chain(stale.iter())
                .filter_map(|s| s.status.as_ref())
                .map(f)
                .sum()
        };
        let replicas = sum(|s| s.replicas);
        let ready = sum(|s| s.ready_replicas);
        let available = sum(|s| s.available_replicas);
        let updated = active.status.as_ref().map(|s| s.replicas).unwrap_or(0);

        let previous = deployment.status.clone().unwrap_or_default();
        let mut cond_fields = from_resource_conditions(&previous.conditions);

        let (avail_status, avail_reason, avail_msg) = if ready > 0 {
            (CONDITION_TRUE, "MinimumAvailable", format!("{} runner(s) ready", ready))
        } else {
            (CONDITION_FALSE, "NoRunnersAvailable", "No runners are ready".to_string())
        };
        set_condition(
            &mut cond_fields,
            build_condition(CONDITION_AVAILABLE, avail_status, avail_reason, &avail_msg),
        );

        let rolling_out = updated < desired || !stale.iter().all(|s| s.spec.replicas == 0);
        let (prog_status, prog_reason, prog_msg) = if rolling_out {
            (
                CONDITION_TRUE,
                "RollingOut",
                format!("{}/{} updated runners", updated, desired),
            )
        } else {
            (CONDITION_FALSE, "UpToDate", "All runners are up to date".to_string())
        };
        set_condition(
            &mut cond_fields,
            build_condition(CONDITION_PROGRESSING, prog_status, prog_reason, &prog_msg),
        );

        let status = RunnerDeploymentStatus {
            desired_replicas: Some(desired),
            replicas,
            ready_replicas: ready,
            available_replicas: available,
            updated_replicas: updated,
            template_hash: Some(hash.to_string()),
            observed_generation: deployment.metadata.generation,
            conditions: cond_fields
                .into_iter()
                .map(|c| c.into_resource_condition())
                .collect(),
        };

        let deployments: Api<RunnerDeployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        deployments
            .patch_status(
                &deployment.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// One step of replica movement from stale children to the active child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RolloutPlan {
    pub active_replicas: i32,
    pub stale_replicas_total: i32,
}

/// Decide the next replica split between the active set and all stale sets.
///
/// `Recreate` switches over in one step: runners are stateless single-job
/// workers, so there is nothing to hand over. `RollingUpdate` ramps the
/// active set up by a quarter of the target (at least one) per reconcile
/// and lets stale sets keep the remainder.
pub(crate) fn plan_rollout(
    strategy: &str,
    desired: i32,
    active_current: i32,
    stale_current_total: i32,
) -> RolloutPlan {
    let desired = desired.max(0);
    if strategy != "RollingUpdate" || stale_current_total == 0 {
        return RolloutPlan {
            active_replicas: desired,
            stale_replicas_total: 0,
        };
    }

    let step = (desired + 3) / 4;
    let step = step.max(1);
    let active_next = (active_current + step).min(desired);
    RolloutPlan {
        active_replicas: active_next,
        stale_replicas_total: (desired - active_next).max(0),
    }
}

fn child_set_name(deployment: &str, hash: &str) -> String {
    format!("{}-{}", deployment, hash)
}

fn owner_reference(deployment: &RunnerDeployment) -> OwnerReference {
    OwnerReference {
        api_version: RunnerDeployment::api_version(&()).to_string(),
        kind: RunnerDeployment::kind(&()).to_string(),
        name: deployment.name_any(),
        uid: deployment.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RunnerDeploymentSpec;

    #[test]
    fn test_recreate_switches_over_in_one_step() {
        let plan = plan_rollout("Recreate", 5, 0, 5);
        assert_eq!(
            plan,
            RolloutPlan {
                active_replicas: 5,
                stale_replicas_total: 0
            }
        );
    }

    #[test]
    fn test_rolling_update_ramps_up() {
        // desired 8 => step 2
        let plan = plan_rollout("RollingUpdate", 8, 0, 8);
        assert_eq!(plan.active_replicas, 2);
        assert_eq!(plan.stale_replicas_total, 6);

        let plan = plan_rollout("RollingUpdate", 8, 6, 2);
        assert_eq!(plan.active_replicas, 8);
        assert_eq!(plan.stale_replicas_total, 0);
    }

    #[test]
    fn test_rolling_update_step_is_at_least_one() {
        let plan = plan_rollout("RollingUpdate", 2, 0, 2);
        assert_eq!(plan.active_replicas, 1);
        assert_eq!(plan.stale_replicas_total, 1);
    }

    #[test]
    fn test_rolling_update_with_no_stale_jumps_to_target() {
        let plan = plan_rollout("RollingUpdate", 5, 2, 0);
        assert_eq!(plan.active_replicas, 5);
        assert_eq!(plan.stale_replicas_total, 0);
    }

    #[test]
    fn test_scale_to_zero_plan() {
        let plan = plan_rollout("Recreate", 0, 3, 2);
        assert_eq!(plan.active_replicas, 0);
        assert_eq!(plan.stale_replicas_total, 0);
    }

    #[test]
    fn test_child_set_name_carries_hash() {
        assert_eq!(child_set_name("fleet", "ab12cd34ef"), "fleet-ab12cd34ef");
    }

    #[test]
    fn test_template_hash_changes_with_image() {
        let spec: RunnerDeploymentSpec = serde_json::from_str(
            r#"{
                "template": {
                    "metadata": {"labels": {"app": "runners"}},
                    "spec": {"repository": "acme/widgets", "image": "runner:v1"}
                }
            }"#,
        )
        .unwrap();
        let mut changed = spec.clone();
        changed.template.spec.config.image = Some("runner:v2".to_string());

        let excl = default_hash_exclusions();
        let h1 = template_hash(&spec.template, &excl).unwrap();
        let h2 = template_hash(&changed.template, &excl).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_template_hash_ignores_hash_label() {
        let base: RunnerDeploymentSpec = serde_json::from_str(
            r#"{
                "template": {
                    "metadata": {"labels": {"app": "runners"}},
                    "spec": {"repository": "acme/widgets"}
                }
            }"#,
        )
        .unwrap();
        let mut labeled = base.clone();
        labeled
            .template
            .metadata
            .labels
            .insert(LABEL_TEMPLATE_HASH.to_string(), "stale".to_string());

        let excl = default_hash_exclusions();
        assert_eq!(
            template_hash(&base.template, &excl).unwrap(),
            template_hash(&labeled.template, &excl).unwrap()
        );
    }
}
