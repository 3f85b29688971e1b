//! RunnerReplicaSet Controller
//!
//! Keeps the number of non-terminating owned Runners matching the selector
//! equal to `spec.replicas`. Scale-down picks the cheapest victims first:
//! runners the Provider never saw, then idle ones; busy runners survive
//! unless the whole set is draining to zero and a grace period has passed.

use crate::conditions::{
    build_condition, from_resource_conditions, set_condition, ANNOTATION_FORCE_EVICTION,
    CONDITION_FALSE, CONDITION_READY, CONDITION_TRUE, LABEL_OWNED_BY,
};
use crate::crd::{Runner, RunnerReplicaSet, RunnerReplicaSetStatus};
use crate::error::{OperatorError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error_policy_backoff;

/// Busy runners may be force-evicted this many seconds after a
/// scale-to-zero began.
const SCALE_TO_ZERO_GRACE_SECS: i64 = 300;

/// Annotation recording when the set first wanted zero replicas while busy
/// runners remained.
const ANNOTATION_DRAINING_SINCE: &str = "fleetops.io/draining-since";

const FIELD_MANAGER: &str = "fleetops-operator";

/// Context for the replica set controller
pub struct RunnerReplicaSetController {
    client: Client,
    namespace: Option<String>,
    sync_period: Duration,
}

impl RunnerReplicaSetController {
    pub fn new(client: Client, namespace: Option<String>, sync_period: Duration) -> Self {
        Self {
            client,
            namespace,
            sync_period,
        }
    }

    /// Run the replica set controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let sets: Api<RunnerReplicaSet> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        info!("Starting RunnerReplicaSet controller");

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
                        debug!("Reconciled replica set: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Reconcile a RunnerReplicaSet
    async fn reconcile(
        &self,
        set: Arc<RunnerReplicaSet>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = set.name_any();
        let namespace = set.namespace().unwrap_or_else(|| "default".to_string());

        debug!("Reconciling RunnerReplicaSet {}/{}", namespace, name);

        if set.metadata.deletion_timestamp.is_some() {
            // Owner references cascade the Runners; each Runner's finalizer
            // handles its own deregistration.
            return Ok(Action::await_change());
        }

        let owned = self.list_owned_runners(&set, &namespace).await?;
        let desired = set.spec.replicas.max(0);

        // A previous drain that never completed must not leak its grace
        // timestamp into the next one.
        if desired > 0 && set.annotations().contains_key(ANNOTATION_DRAINING_SINCE) {
            let sets: Api<RunnerReplicaSet> = Api::namespaced(self.client.clone(), &namespace);
            let patch = serde_json::json!({
                "metadata": {
                    "annotations": { ANNOTATION_DRAINING_SINCE: null }
                }
            });
            sets.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }

        let snapshots: Vec<RunnerSnapshot> = owned.iter().map(RunnerSnapshot::from_runner).collect();
        let have = snapshots.iter().filter(|r| !r.terminating).count() as i32;

        if have < desired {
            let missing = (desired - have) as usize;
            info!(
                set = %name,
                have,
                desired,
                "Creating {} runner(s)",
                missing
            );
            for _ in 0..missing {
                self.create_runner(&set, &namespace).await?;
            }
        } else if have > desired {
            let excess = (have - desired) as usize;
            let allow_busy = desired == 0 && self.draining_grace_elapsed(&set, &namespace, &snapshots).await?;
            let victims = select_scale_down_victims(&snapshots, excess, allow_busy);

            if victims.len() < excess {
                debug!(
                    set = %name,
                    selected = victims.len(),
                    excess,
                    "Busy runners block part of the scale-down"
                );
            }

            let runners: Api<Runner> = Api::namespaced(self.client.clone(), &namespace);
            for victim in &victims {
                if victim.busy {
                    warn!(set = %name, runner = %victim.name, "Force-evicting busy runner");
                    let patch = serde_json::json!({
                        "metadata": {
                            "annotations": { ANNOTATION_FORCE_EVICTION: "true" }
                        }
                    });
                    runners
                        .patch(&victim.name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await?;
                }
                info!(set = %name, runner = %victim.name, "Deleting runner");
                match runners.delete(&victim.name, &DeleteParams::default()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.update_status(&set, &namespace, &snapshots, desired).await?;

        Ok(Action::requeue(self.sync_period))
    }

    /// Runners matching the selector whose controller owner is this set.
    async fn list_owned_runners(
        &self,
        set: &RunnerReplicaSet,
        namespace: &str,
    ) -> Result<Vec<Runner>> {
        let runners: Api<Runner> = Api::namespaced(self.client.clone(), namespace);
        let selector = set
            .spec
            .selector
            .match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let list = runners.list(&ListParams::default().labels(&selector)).await?;
        let own_uid = set.metadata.uid.clone().unwrap_or_default();

        Ok(list
            .items
            .into_iter()
            .filter(|r| {
                r.metadata
                    .owner_references
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .any(|o| o.uid == own_uid && o.controller.unwrap_or(false))
            })
            .collect())
    }

    async fn create_runner(&self, set: &RunnerReplicaSet, namespace: &str) -> Result<()> {
        let runners: Api<Runner> = Api::namespaced(self.client.clone(), namespace);
        let name = generated_runner_name(&set.name_any());

        let mut labels: BTreeMap<String, String> = set.spec.template.metadata.labels.clone();
        labels.insert(LABEL_OWNED_BY.to_string(), set.name_any());

        let runner = Runner {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                annotations: if set.spec.template.metadata.annotations.is_empty() {
                    None
                } else {
                    Some(set.spec.template.metadata.annotations.clone())
                },
                owner_references: Some(vec![owner_reference(set)]),
                ..Default::default()
            },
            spec: set.spec.template.spec.clone(),
            status: None,
        };

        match runners.create(&PostParams::default(), &runner).await {
            Ok(_) => {
                debug!(runner = %name, "Created runner");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// While draining to zero with busy runners, eviction waits for a grace
    /// period measured from the first zero-replica observation.
    async fn draining_grace_elapsed(
        &self,
        set: &RunnerReplicaSet,
        namespace: &str,
        snapshots: &[RunnerSnapshot],
    ) -> Result<bool> {
        let busy_remaining = snapshots.iter().any(|r| !r.terminating && r.busy);
        if !busy_remaining {
            return Ok(true);
        }

        let sets: Api<RunnerReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        match set.annotations().get(ANNOTATION_DRAINING_SINCE) {
            Some(since) => {
                let started = DateTime::parse_from_rfc3339(since)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                Ok(Utc::now() - started >= ChronoDuration::seconds(SCALE_TO_ZERO_GRACE_SECS))
            }
            None => {
                let patch = serde_json::json!({
                    "metadata": {
                        "annotations": { ANNOTATION_DRAINING_SINCE: Utc::now().to_rfc3339() }
                    }
                });
                sets.patch(
                    &set.name_any(),
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await?;
                Ok(false)
            }
        }
    }

    async fn update_status(
        &self,
        set: &RunnerReplicaSet,
        namespace: &str,
        snapshots: &[RunnerSnapshot],
        desired: i32,
    ) -> Result<()> {
        let live: Vec<_> = snapshots.iter().filter(|r| !r.terminating).collect();
        let replicas = live.len() as i32;
        let ready = live.iter().filter(|r| r.ready).count() as i32;
        let available = live.iter().filter(|r| r.ready && !r.busy).count() as i32;

        let previous = set.status.clone().unwrap_or_default();
        let mut cond_fields = from_resource_conditions(&previous.conditions);
        let (status_value, reason, message) = if replicas == desired && ready == desired {
            (
                CONDITION_TRUE,
                "AllRunnersReady",
                format!("{}/{} runners ready", ready, desired),
            )
        } else {
            (
                CONDITION_FALSE,
                "RunnersNotReady",
                format!("{}/{} runners ready", ready, desired),
            )
        };
        set_condition(
            &mut cond_fields,
            build_condition(CONDITION_READY, status_value, reason, &message),
        );

        let status = RunnerReplicaSetStatus {
            replicas,
            ready_replicas: ready,
            available_replicas: available,
            observed_generation: set.metadata.generation,
            conditions: cond_fields
                .into_iter()
                .map(|c| c.into_resource_condition())
                .collect(),
        };

        let sets: Api<RunnerReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        sets.patch_status(&set.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Minimal view of a Runner used by the scale-down decision.
#[derive(Debug, Clone)]
pub(crate) struct RunnerSnapshot {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub ready: bool,
    pub busy: bool,
    pub terminating: bool,
}

impl RunnerSnapshot {
    fn from_runner(runner: &Runner) -> Self {
        let status = runner.status.clone().unwrap_or_default();
        Self {
            name: runner.name_any(),
            created: runner.metadata.creation_timestamp.as_ref().map(|t| t.0),
            ready: status.ready,
            busy: status.workflow.is_some(),
            terminating: runner.metadata.deletion_timestamp.is_some(),
        }
    }
}

/// Pick `excess` victims for scale-down.
///
/// Preference order: unregistered runners oldest first, then registered idle
/// runners oldest first (names break ties), and busy runners only when
/// `allow_busy` is set — the set is draining to zero and the grace period
/// has passed.
pub(crate) fn select_scale_down_victims(
    runners: &[RunnerSnapshot],
    excess: usize,
    allow_busy: bool,
) -> Vec<RunnerSnapshot> {
    let mut unregistered: Vec<&RunnerSnapshot> = runners
        .iter()
        .filter(|r| !r.terminating && !r.ready)
        .collect();
    let mut idle: Vec<&RunnerSnapshot> = runners
        .iter()
        .filter(|r| !r.terminating && r.ready && !r.busy)
        .collect();
    let mut busy: Vec<&RunnerSnapshot> = runners
        .iter()
        .filter(|r| !r.terminating && r.ready && r.busy)
        .collect();

    let oldest_first = |a: &&RunnerSnapshot, b: &&RunnerSnapshot| {
        a.created
            .cmp(&b.created)
            .then_with(|| a.name.cmp(&b.name))
    };
    unregistered.sort_by(oldest_first);
    idle.sort_by(oldest_first);
    busy.sort_by(oldest_first);

    let mut victims = Vec::with_capacity(excess);
    for candidate in unregistered.into_iter().chain(idle) {
        if victims.len() == excess {
            break;
        }
        victims.push(candidate.clone());
    }
    if allow_busy {
        for candidate in busy {
            if victims.len() == excess {
                break;
            }
            victims.push(candidate.clone());
        }
    }
    victims
}

/// Unique child name: parent plus a short random suffix.
fn generated_runner_name(parent: &str) -> String {
    format!("{}-{:05x}", parent, rand::random::<u32>() & 0xfffff)
}

fn owner_reference(set: &RunnerReplicaSet) -> OwnerReference {
    OwnerReference {
        api_version: RunnerReplicaSet::api_version(&()).to_string(),
        kind: RunnerReplicaSet::kind(&()).to_string(),
        name: set.name_any(),
        uid: set.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, age_minutes: i64, ready: bool, busy: bool) -> RunnerSnapshot {
        RunnerSnapshot {
            name: name.to_string(),
            created: Some(Utc::now() - ChronoDuration::minutes(age_minutes)),
            ready,
            busy,
            terminating: false,
        }
    }

    #[test]
    fn test_victims_prefer_unregistered_over_idle() {
        let runners = vec![
            snapshot("idle-old", 60, true, false),
            snapshot("unregistered", 5, false, false),
            snapshot("busy", 90, true, true),
        ];
        let victims = select_scale_down_victims(&runners, 1, false);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].name, "unregistered");
    }

    #[test]
    fn test_victims_oldest_first_within_class() {
        let runners = vec![
            snapshot("young", 5, false, false),
            snapshot("old", 120, false, false),
        ];
        let victims = select_scale_down_victims(&runners, 1, false);
        assert_eq!(victims[0].name, "old");
    }

    #[test]
    fn test_victims_tie_break_by_name() {
        let created = Utc::now() - ChronoDuration::minutes(10);
        let mut a = snapshot("bbb", 0, true, false);
        let mut b = snapshot("aaa", 0, true, false);
        a.created = Some(created);
        b.created = Some(created);
        let victims = select_scale_down_victims(&[a, b], 1, false);
        assert_eq!(victims[0].name, "aaa");
    }

    #[test]
    fn test_busy_runners_never_picked_without_permission() {
        let runners = vec![
            snapshot("busy-1", 60, true, true),
            snapshot("busy-2", 30, true, true),
        ];
        let victims = select_scale_down_victims(&runners, 2, false);
        assert!(victims.is_empty());
    }

    #[test]
    fn test_busy_runners_picked_when_draining_to_zero() {
        let runners = vec![
            snapshot("idle", 10, true, false),
            snapshot("busy", 60, true, true),
        ];
        let victims = select_scale_down_victims(&runners, 2, true);
        assert_eq!(victims.len(), 2);
        assert_eq!(victims[0].name, "idle");
        assert_eq!(victims[1].name, "busy");
        assert!(victims[1].busy);
    }

    #[test]
    fn test_terminating_runners_are_not_candidates() {
        let mut terminating = snapshot("going", 60, true, false);
        terminating.terminating = true;
        let victims = select_scale_down_victims(&[terminating], 1, true);
        assert!(victims.is_empty());
    }

    #[test]
    fn test_generated_names_are_prefixed_and_unique_enough() {
        let names: std::collections::BTreeSet<String> =
            (0..5).map(|_| generated_runner_name("fleet-abc123")).collect();
        assert!(names.iter().all(|n| n.starts_with("fleet-abc123-")));
        assert!(names.len() > 1, "random suffixes should differ");
    }
}
