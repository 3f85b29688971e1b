//! HorizontalRunnerAutoscaler Controller
//!
//! Computes the desired replica count for the targeted RunnerDeployment on
//! every reconcile: a metric-driven baseline, plus the sum of active
//! capacity reservations, clamped by the static or scheduled-override
//! bounds, with scale-down suppressed for a window after each scale-up.
//!
//! The target is patched before the autoscaler's own status so downstream
//! reconcilers observe the new count first.

use crate::conditions::{
    build_condition, from_resource_conditions, set_condition, CONDITION_DEGRADED, CONDITION_FALSE,
    CONDITION_READY, CONDITION_TRUE,
};
use crate::crd::{
    validate_single_autoscaler_target, CacheEntry, HorizontalRunnerAutoscaler,
    HorizontalRunnerAutoscalerStatus, MetricSpec, RecurrenceFrequency, RunnerDeployment,
    ScaleTargetRef, ScheduledOverride,
};
use crate::error::{OperatorError, Result};
use crate::provider::{ProviderClient, Target};
use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error_policy_backoff;

const FIELD_MANAGER: &str = "fleetops-operator";

/// Context for the autoscaler controller
pub struct AutoscalerController {
    client: Client,
    provider: Arc<dyn ProviderClient>,
    namespace: Option<String>,
    /// How long cached Provider metric values stay valid
    cache_duration: Duration,
    sync_period: Duration,
}

impl AutoscalerController {
    pub fn new(
        client: Client,
        provider: Arc<dyn ProviderClient>,
        namespace: Option<String>,
        cache_duration: Duration,
        sync_period: Duration,
    ) -> Self {
        Self {
            client,
            provider,
            namespace,
            cache_duration,
            sync_period,
        }
    }

    /// Run the autoscaler controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let autoscalers: Api<HorizontalRunnerAutoscaler> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };

        info!("Starting HorizontalRunnerAutoscaler controller");

        Controller::new(autoscalers, Config::default())
            .shutdown_on_signal()
            .run(
                |hra, ctx| async move { ctx.reconcile(hra).await },
                |hra, error, ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(hra, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled autoscaler: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Reconcile a HorizontalRunnerAutoscaler
    async fn reconcile(
        &self,
        hra: Arc<HorizontalRunnerAutoscaler>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = hra.name_any();
        let namespace = hra.namespace().unwrap_or_else(|| "default".to_string());

        debug!("Reconciling HorizontalRunnerAutoscaler {}/{}", namespace, name);

        if hra.metadata.deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        if let Err(e) = hra.spec.validate() {
            // Bad specs are never retried; the condition is the channel back
            // to the user.
            warn!(autoscaler = %name, "Invalid spec: {}", e);
            self.patch_own_status(&hra, &namespace, |status, conds| {
                set_degraded(conds, true, "InvalidSpec", &e.to_string());
                let _ = status;
            })
            .await?;
            return Ok(Action::requeue(self.sync_period));
        }

        // A deployment fought over by two autoscalers would flap between
        // their counts; neither side writes until the user removes one.
        let autoscalers: Api<HorizontalRunnerAutoscaler> =
            Api::namespaced(self.client.clone(), &namespace);
        let siblings: Vec<(String, ScaleTargetRef)> = autoscalers
            .list(&Default::default())
            .await?
            .items
            .iter()
            .map(|sibling| (sibling.name_any(), sibling.spec.scale_target_ref.clone()))
            .collect();
        if let Err(e) = validate_single_autoscaler_target(&hra.spec, &name, &siblings) {
            warn!(autoscaler = %name, "Refusing to scale: {}", e);
            self.patch_own_status(&hra, &namespace, |_, conds| {
                set_degraded(conds, true, "DuplicateTarget", &e.to_string());
            })
            .await?;
            return Ok(Action::requeue(self.sync_period));
        }

        let deployments: Api<RunnerDeployment> = Api::namespaced(self.client.clone(), &namespace);
        let target_name = hra.spec.scale_target_ref.name.clone();
        let deployment = match deployments.get_opt(&target_name).await? {
            Some(d) => d,
            None => {
                warn!(autoscaler = %name, target = %target_name, "Scale target not found");
                self.patch_own_status(&hra, &namespace, |_, conds| {
                    set_degraded(
                        conds,
                        true,
                        "TargetNotFound",
                        &format!("RunnerDeployment {:?} does not exist", target_name),
                    );
                })
                .await?;
                return Ok(Action::requeue(Duration::from_secs(30)));
            }
        };

        let now = Utc::now();
        let status = hra.status.clone().unwrap_or_default();

        // Expired reservations are collected every pass
        let reservations: Vec<_> = status
            .capacity_reservations
            .iter()
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect();
        let reservation_sum: i32 = reservations
            .iter()
            .filter(|r| r.is_active(now))
            .map(|r| r.replicas)
            .sum();

        let mut cache: Vec<CacheEntry> = status
            .cache_entries
            .iter()
            .filter(|e| e.is_fresh(now))
            .cloned()
            .collect();
        let previous_desired = status.desired_replicas;
        let metric_replicas = self
            .evaluate_metrics(&hra, &deployment, previous_desired, &mut cache, now)
            .await?;

        let (scheduled_min, scheduled_max) = active_override_bounds(&hra.spec.scheduled_overrides, now);

        let input = DesiredReplicasInput {
            min_replicas: hra.spec.min_replicas,
            max_replicas: hra.spec.max_replicas,
            scale_down_delay: ChronoDuration::seconds(hra.spec.scale_down_delay_seconds_after_scale_up),
            metric_replicas,
            reservation_sum,
            scheduled_min,
            scheduled_max,
            previous_desired,
            last_scale_out: status
                .last_successful_scale_out_time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc)),
            now,
        };
        let outcome = compute_desired_replicas(&input);

        debug!(
            autoscaler = %name,
            desired = outcome.replicas,
            reservations = reservation_sum,
            metric = ?metric_replicas,
            suppressed = ?outcome.suppressed_for,
            "Computed desired replicas"
        );

        // Target first, own status second: downstream reconcilers must see
        // the new count before our bookkeeping reflects it.
        if deployment.spec.replicas != Some(outcome.replicas) {
            let patch = serde_json::json!({
                "spec": { "replicas": outcome.replicas }
            });
            deployments
                .patch(&target_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                .await?;
            info!(
                autoscaler = %name,
                target = %target_name,
                replicas = outcome.replicas,
                "Patched scale target"
            );
        }

        let last_scale_out = if outcome.scaled_out {
            Some(now.to_rfc3339())
        } else {
            status.last_successful_scale_out_time.clone()
        };
        let generation = hra.metadata.generation;
        let desired = outcome.replicas;

        self.patch_own_status(&hra, &namespace, move |s, conds| {
            s.observed_generation = generation;
            s.desired_replicas = Some(desired);
            s.last_successful_scale_out_time = last_scale_out;
            s.capacity_reservations = reservations;
            s.cache_entries = cache;
            set_degraded(conds, false, "Reconciled", "autoscaler is healthy");
        })
        .await?;

        // Wake up exactly when the suppression window lapses if that comes
        // before the regular resync.
        let requeue = match outcome.suppressed_for {
            Some(remaining) => {
                let remaining = remaining.to_std().unwrap_or(self.sync_period);
                remaining.min(self.sync_period)
            }
            None => self.sync_period,
        };
        Ok(Action::requeue(requeue))
    }

    /// Derive the metric-driven replica count, reusing cached values where
    /// they are still fresh. `None` means no metrics are configured.
    async fn evaluate_metrics(
        &self,
        hra: &HorizontalRunnerAutoscaler,
        deployment: &RunnerDeployment,
        previous_desired: Option<i32>,
        cache: &mut Vec<CacheEntry>,
        now: DateTime<Utc>,
    ) -> Result<Option<i32>> {
        let Some(metric) = hra.spec.metrics.first() else {
            return Ok(None);
        };

        let config = &deployment.spec.template.spec.config;
        let target = Target::from_config(config)?;

        match metric {
            MetricSpec::TotalNumberOfQueuedAndInProgressWorkflowRuns { repository_names } => {
                let repositories: Vec<String> = if !repository_names.is_empty() {
                    repository_names.clone()
                } else if let Target::Repository(full) = &target {
                    vec![full.clone()]
                } else {
                    return Err(OperatorError::Validation(
                        "repositoryNames is required for organization and enterprise scoped metrics"
                            .to_string(),
                    ));
                };

                let mut total = 0;
                for repository in &repositories {
                    for status in ["queued", "in_progress"] {
                        total += self
                            .cached_run_count(cache, repository, status, now)
                            .await?;
                    }
                }
                Ok(Some(total))
            }
            MetricSpec::PercentageRunnersBusy {
                scale_up_threshold,
                scale_down_threshold,
                scale_up_factor,
                scale_down_factor,
            } => {
                let runners = self.provider.list_runners(&target).await?;
                let total = runners.len() as i32;
                if total == 0 {
                    return Ok(previous_desired);
                }
                let busy = runners.iter().filter(|r| r.busy).count() as i32;
                let fraction = f64::from(busy) / f64::from(total);
                let previous = previous_desired.unwrap_or(hra.spec.min_replicas);

                let next = if fraction >= *scale_up_threshold {
                    (f64::from(previous) * scale_up_factor).ceil() as i32
                } else if fraction <= *scale_down_threshold {
                    (f64::from(previous) * scale_down_factor).floor() as i32
                } else {
                    previous
                };
                Ok(Some(next))
            }
        }
    }

    /// Workflow-run count for one (repository, status) pair, served from
    /// the persisted cache when fresh.
    async fn cached_run_count(
        &self,
        cache: &mut Vec<CacheEntry>,
        repository: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        let key = format!("workflow_runs/{}/{}", repository, status);
        if let Some(entry) = cache.iter().find(|e| e.key == key && e.is_fresh(now)) {
            debug!(key = %key, value = entry.value, "Metric cache hit");
            return Ok(entry.value);
        }

        let runs = self.provider.list_workflow_runs(repository, status).await?;
        let count = runs.iter().filter(|r| r.status == status).count() as i32;

        let expiry =
            now + ChronoDuration::from_std(self.cache_duration).unwrap_or_else(|_| ChronoDuration::seconds(60));
        cache.retain(|e| e.key != key);
        cache.push(CacheEntry {
            key,
            value: count,
            expiration_time: expiry.to_rfc3339(),
        });
        Ok(count)
    }

    async fn patch_own_status<F>(
        &self,
        hra: &HorizontalRunnerAutoscaler,
        namespace: &str,
        mutate: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut HorizontalRunnerAutoscalerStatus, &mut Vec<crate::conditions::ConditionFields>),
    {
        let mut status = hra.status.clone().unwrap_or_default();
        let mut cond_fields = from_resource_conditions(&status.conditions);
        mutate(&mut status, &mut cond_fields);
        status.conditions = cond_fields
            .into_iter()
            .map(|c| c.into_resource_condition())
            .collect();

        let autoscalers: Api<HorizontalRunnerAutoscaler> =
            Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        autoscalers
            .patch_status(&hra.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn set_degraded(
    conds: &mut Vec<crate::conditions::ConditionFields>,
    degraded: bool,
    reason: &str,
    message: &str,
) {
    let status = if degraded { CONDITION_TRUE } else { CONDITION_FALSE };
    set_condition(conds, build_condition(CONDITION_DEGRADED, status, reason, message));
    let ready = if degraded { CONDITION_FALSE } else { CONDITION_TRUE };
    set_condition(conds, build_condition(CONDITION_READY, ready, reason, message));
}

/// Inputs to one desired-replica computation.
#[derive(Debug, Clone)]
pub struct DesiredReplicasInput {
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub scale_down_delay: ChronoDuration,
    /// Metric-driven count; `None` when no metrics are configured
    pub metric_replicas: Option<i32>,
    /// Sum over active capacity reservations
    pub reservation_sum: i32,
    /// Bounds contributed by an active scheduled override
    pub scheduled_min: Option<i32>,
    pub scheduled_max: Option<i32>,
    pub previous_desired: Option<i32>,
    pub last_scale_out: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Result of one desired-replica computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredReplicas {
    pub replicas: i32,
    /// The count rose above the previous one
    pub scaled_out: bool,
    /// Scale-down was held back; time until the hold lapses
    pub suppressed_for: Option<ChronoDuration>,
}

/// The desired-replica formula.
///
/// baseline = max(minReplicas, metricReplicas), reservations add on top,
/// the result clamps into the effective bounds, and a recent scale-out
/// freezes any decrease until the delay runs out.
pub fn compute_desired_replicas(input: &DesiredReplicasInput) -> DesiredReplicas {
    let effective_min = input.scheduled_min.unwrap_or(input.min_replicas);
    let effective_max = input.scheduled_max.unwrap_or(input.max_replicas);

    let metric = input.metric_replicas.unwrap_or(input.min_replicas);
    let baseline = input.min_replicas.max(metric);

    let raw = (baseline + input.reservation_sum)
        .max(effective_min)
        .min(effective_max);

    let previous = input.previous_desired.unwrap_or(raw);

    if raw < previous {
        if let Some(last) = input.last_scale_out {
            let since = input.now - last;
            if since < input.scale_down_delay {
                return DesiredReplicas {
                    replicas: previous,
                    scaled_out: false,
                    suppressed_for: Some(input.scale_down_delay - since),
                };
            }
        }
    }

    DesiredReplicas {
        replicas: raw,
        scaled_out: raw > previous,
        suppressed_for: None,
    }
}

/// Bounds from the active scheduled override, if any. At most one override
/// is active at a time; ties resolve to the earliest start time.
pub(crate) fn active_override_bounds(
    overrides: &[ScheduledOverride],
    now: DateTime<Utc>,
) -> (Option<i32>, Option<i32>) {
    let mut active: Option<(&ScheduledOverride, DateTime<Utc>)> = None;

    for candidate in overrides {
        let Some(window_start) = current_window_start(candidate, now) else {
            continue;
        };
        match &active {
            Some((_, start)) if *start <= window_start => {}
            _ => active = Some((candidate, window_start)),
        }
    }

    match active {
        Some((o, _)) => (o.min_replicas, o.max_replicas),
        None => (None, None),
    }
}

/// Start of the override occurrence containing `now`, or `None` when no
/// occurrence is active.
fn current_window_start(override_: &ScheduledOverride, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start = parse_time(&override_.start_time)?;
    let end = parse_time(&override_.end_time)?;
    if end <= start {
        return None;
    }

    let Some(recurrence) = &override_.recurrence else {
        return (start <= now && now < end).then_some(start);
    };

    let until = recurrence.until_time.as_deref().and_then(parse_time_str);
    let mut window_start = start;
    let mut window_end = end;

    while window_end <= now {
        let (next_start, next_end) = advance_window(window_start, window_end, &recurrence.frequency)?;
        window_start = next_start;
        window_end = next_end;
    }

    if let Some(until) = until {
        if window_start > until {
            return None;
        }
    }
    (window_start <= now && now < window_end).then_some(window_start)
}

fn advance_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    frequency: &RecurrenceFrequency,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    match frequency {
        RecurrenceFrequency::Daily => Some((start + ChronoDuration::days(1), end + ChronoDuration::days(1))),
        RecurrenceFrequency::Weekly => {
            Some((start + ChronoDuration::weeks(1), end + ChronoDuration::weeks(1)))
        }
        RecurrenceFrequency::Monthly => Some((
            start.checked_add_months(Months::new(1))?,
            end.checked_add_months(Months::new(1))?,
        )),
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    parse_time_str(value)
}

fn parse_time_str(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RecurrenceRule;

    fn input(now: DateTime<Utc>) -> DesiredReplicasInput {
        DesiredReplicasInput {
            min_replicas: 1,
            max_replicas: 5,
            scale_down_delay: ChronoDuration::seconds(600),
            metric_replicas: None,
            reservation_sum: 0,
            scheduled_min: None,
            scheduled_max: None,
            previous_desired: None,
            last_scale_out: None,
            now,
        }
    }

    #[test]
    fn test_no_metrics_no_reservations_settles_at_min() {
        let now = Utc::now();
        let outcome = compute_desired_replicas(&input(now));
        assert_eq!(outcome.replicas, 1);
        assert!(outcome.suppressed_for.is_none());
    }

    #[test]
    fn test_metric_replicas_drive_the_count() {
        // 2 queued + 2 in_progress runs: four runners wanted
        let now = Utc::now();
        let mut i = input(now);
        i.metric_replicas = Some(4);
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 4);
    }

    #[test]
    fn test_reservations_add_on_top_of_baseline() {
        let now = Utc::now();
        let mut i = input(now);
        i.previous_desired = Some(1);
        i.reservation_sum = 2;
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 3);
        assert!(outcome.scaled_out);
    }

    #[test]
    fn test_clamped_to_max() {
        let now = Utc::now();
        let mut i = input(now);
        i.metric_replicas = Some(9);
        i.reservation_sum = 4;
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 5);
    }

    #[test]
    fn test_clamped_to_min() {
        let now = Utc::now();
        let mut i = input(now);
        i.min_replicas = 2;
        i.metric_replicas = Some(0);
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 2);
    }

    #[test]
    fn test_scale_down_suppressed_inside_delay() {
        let now = Utc::now();
        let mut i = input(now);
        i.previous_desired = Some(4);
        i.metric_replicas = Some(1);
        i.last_scale_out = Some(now - ChronoDuration::seconds(100));
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 4, "held at the previous count");
        let remaining = outcome.suppressed_for.unwrap();
        assert!(remaining <= ChronoDuration::seconds(500));
        assert!(remaining > ChronoDuration::seconds(400));
    }

    #[test]
    fn test_scale_down_allowed_after_delay() {
        let now = Utc::now();
        let mut i = input(now);
        i.previous_desired = Some(4);
        i.metric_replicas = Some(1);
        i.last_scale_out = Some(now - ChronoDuration::seconds(601));
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 1);
        assert!(!outcome.scaled_out);
        assert!(outcome.suppressed_for.is_none());
    }

    #[test]
    fn test_scale_up_never_suppressed() {
        let now = Utc::now();
        let mut i = input(now);
        i.previous_desired = Some(2);
        i.metric_replicas = Some(4);
        i.last_scale_out = Some(now - ChronoDuration::seconds(10));
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 4);
        assert!(outcome.scaled_out);
    }

    #[test]
    fn test_scheduled_override_clamps_bounds() {
        let now = Utc::now();
        let mut i = input(now);
        i.metric_replicas = Some(4);
        i.scheduled_max = Some(2);
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 2);

        let mut i = input(now);
        i.scheduled_min = Some(3);
        let outcome = compute_desired_replicas(&i);
        assert_eq!(outcome.replicas, 3);
    }

    fn override_at(
        start_offset_secs: i64,
        end_offset_secs: i64,
        now: DateTime<Utc>,
        min: Option<i32>,
        max: Option<i32>,
    ) -> ScheduledOverride {
        ScheduledOverride {
            start_time: (now + ChronoDuration::seconds(start_offset_secs)).to_rfc3339(),
            end_time: (now + ChronoDuration::seconds(end_offset_secs)).to_rfc3339(),
            recurrence: None,
            min_replicas: min,
            max_replicas: max,
        }
    }

    #[test]
    fn test_override_active_window() {
        let now = Utc::now();
        let overrides = vec![override_at(-60, 60, now, Some(0), Some(0))];
        assert_eq!(active_override_bounds(&overrides, now), (Some(0), Some(0)));

        let overrides = vec![override_at(60, 120, now, Some(0), Some(0))];
        assert_eq!(active_override_bounds(&overrides, now), (None, None));
    }

    #[test]
    fn test_override_earliest_start_wins() {
        let now = Utc::now();
        let overrides = vec![
            override_at(-30, 60, now, Some(7), None),
            override_at(-60, 60, now, Some(2), None),
        ];
        assert_eq!(active_override_bounds(&overrides, now), (Some(2), None));
    }

    #[test]
    fn test_daily_recurrence_advances_window() {
        let now = Utc::now();
        // A one-hour window that started three days ago recurs daily;
        // today's occurrence covers `now`.
        let o = ScheduledOverride {
            start_time: (now - ChronoDuration::days(3) - ChronoDuration::minutes(10)).to_rfc3339(),
            end_time: (now - ChronoDuration::days(3) + ChronoDuration::minutes(50)).to_rfc3339(),
            recurrence: Some(RecurrenceRule {
                frequency: RecurrenceFrequency::Daily,
                until_time: None,
            }),
            min_replicas: Some(5),
            max_replicas: None,
        };
        assert_eq!(active_override_bounds(&[o], now), (Some(5), None));
    }

    #[test]
    fn test_recurrence_respects_until_time() {
        let now = Utc::now();
        let o = ScheduledOverride {
            start_time: (now - ChronoDuration::days(3) - ChronoDuration::minutes(10)).to_rfc3339(),
            end_time: (now - ChronoDuration::days(3) + ChronoDuration::minutes(50)).to_rfc3339(),
            recurrence: Some(RecurrenceRule {
                frequency: RecurrenceFrequency::Daily,
                until_time: Some((now - ChronoDuration::days(1)).to_rfc3339()),
            }),
            min_replicas: Some(5),
            max_replicas: None,
        };
        assert_eq!(active_override_bounds(&[o], now), (None, None));
    }

    #[test]
    fn test_expired_one_shot_override_is_inactive() {
        let now = Utc::now();
        let overrides = vec![override_at(-120, -60, now, Some(9), None)];
        assert_eq!(active_override_bounds(&overrides, now), (None, None));
    }
}
