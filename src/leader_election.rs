//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Treated like any other reconcile loop in this operator: observe the
//! Lease, classify who holds it, and write the spec this replica wants to
//! be true. A single [`LeaseLock::step`] drives acquisition, renewal and
//! takeover alike; resource-version conflicts mean another replica won the
//! write and are never an error. Only the lease holder runs the
//! controllers and the webhook-driven status writes.

use crate::error::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Seconds a holder's claim stays valid without renewal.
const LEASE_TTL_SECS: i32 = 15;

/// Path where the service account mounts the pod namespace.
const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace for the election Lease: explicit flag, else the mounted
/// service-account namespace, else `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string(NAMESPACE_FILE)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// Who holds the lease, as observed at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    /// No holder recorded
    Nobody,
    /// This replica holds it
    Us,
    /// Another replica holds a live claim
    Other,
    /// Another replica holds it but stopped renewing
    OtherExpired,
}

/// Exclusive claim on a named Lease object.
pub struct LeaseLock {
    api: Api<Lease>,
    name: String,
    identity: String,
}

impl LeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("operator-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, lease = %name, "Initialized leader election");
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            identity,
        }
    }

    /// Blocks until this replica holds the lease. Contention and transient
    /// API failures both resolve by waiting and stepping again; the wait is
    /// jittered so standbys don't stampede an expiring lease.
    pub async fn acquire(&self) {
        info!(identity = %self.identity, "Waiting to acquire leader lease '{}'", self.name);
        loop {
            match self.step().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return;
                }
                Ok(false) => {
                    debug!("Lease held by another replica");
                }
                Err(e) => {
                    warn!("Lease acquisition attempt failed: {}", e);
                }
            }
            tokio::time::sleep(jittered(Duration::from_secs(LEASE_TTL_SECS as u64 / 3))).await;
        }
    }

    /// Renews the claim on a cadence well inside the TTL and returns once
    /// leadership is lost. Transient API failures are tolerated until the
    /// claim could have lapsed; after that the replica must assume a
    /// standby took over.
    pub async fn keep_renewing(&self) {
        let cadence = Duration::from_secs(LEASE_TTL_SECS as u64 / 3);
        let mut failed_for = Duration::ZERO;
        loop {
            tokio::time::sleep(jittered(cadence)).await;
            match self.step().await {
                Ok(true) => {
                    failed_for = Duration::ZERO;
                }
                Ok(false) => {
                    warn!(identity = %self.identity, "Leader lease taken by another replica");
                    return;
                }
                Err(e) if e.is_transient() => {
                    failed_for += cadence;
                    if failed_for >= Duration::from_secs(LEASE_TTL_SECS as u64) {
                        warn!("Lease renewal failing past the TTL, assuming leadership lost");
                        return;
                    }
                    warn!("Lease renewal failed transiently: {}", e);
                }
                Err(e) => {
                    warn!("Lease renewal failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Clears the holder so a standby can take over without waiting out the
    /// TTL. Best effort on shutdown.
    pub async fn release(&self) {
        let ours = match self.api.get_opt(&self.name).await {
            Ok(Some(lease)) => {
                classify(&self.identity, lease.spec.as_ref(), Utc::now()) == Holder::Us
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                false
            }
        };
        if !ours {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let patch = serde_json::json!({
            "spec": { "holderIdentity": null, "renewTime": null }
        });
        match self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!("Released leader lease"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    /// One observe-classify-write pass over the Lease. Returns whether this
    /// replica holds the lease afterwards.
    async fn step(&self) -> Result<bool> {
        let now = Utc::now();

        let Some(existing) = self.api.get_opt(&self.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    ..Default::default()
                },
                spec: Some(claimed_spec(&self.identity, None, now)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                // Another replica created it first
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        match classify(&self.identity, existing.spec.as_ref(), now) {
            Holder::Other => Ok(false),
            Holder::Us | Holder::Nobody | Holder::OtherExpired => {
                let mut claimed = existing.clone();
                claimed.spec = Some(claimed_spec(&self.identity, existing.spec.as_ref(), now));
                match self
                    .api
                    .replace(&self.name, &PostParams::default(), &claimed)
                    .await
                {
                    Ok(_) => Ok(true),
                    // The resource version moved: someone else renewed or
                    // took over between our read and write
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// Classify the observed lease spec relative to `identity` at `now`.
fn classify(identity: &str, spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> Holder {
    let Some(spec) = spec else {
        return Holder::Nobody;
    };
    let Some(holder) = spec.holder_identity.as_deref().filter(|h| !h.is_empty()) else {
        return Holder::Nobody;
    };
    if holder == identity {
        return Holder::Us;
    }

    let ttl = spec.lease_duration_seconds.unwrap_or(LEASE_TTL_SECS) as i64;
    let lapsed = match &spec.renew_time {
        Some(MicroTime(renewed)) => now.signed_duration_since(*renewed).num_seconds() > ttl,
        // A holder that never renewed has no live claim
        None => true,
    };
    if lapsed {
        Holder::OtherExpired
    } else {
        Holder::Other
    }
}

/// The spec this replica writes when claiming the lease. Acquire time and
/// the transition counter only move when the holder actually changes.
fn claimed_spec(identity: &str, prev: Option<&LeaseSpec>, now: DateTime<Utc>) -> LeaseSpec {
    let prev_holder = prev.and_then(|s| s.holder_identity.as_deref()).filter(|h| !h.is_empty());
    let takeover = prev_holder != Some(identity);
    let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);

    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(LEASE_TTL_SECS),
        acquire_time: if takeover {
            Some(MicroTime(now))
        } else {
            prev.and_then(|s| s.acquire_time.clone())
        },
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(if takeover && prev_holder.is_some() {
            transitions + 1
        } else {
            transitions
        }),
    }
}

/// Spread a duration by up to ±25% so replicas don't synchronize.
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return base;
    }
    let spread = base_ms / 4;
    let offset = rand::thread_rng().gen_range(0..=spread * 2);
    Duration::from_millis(base_ms - spread + offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn spec(holder: Option<&str>, renewed_secs_ago: Option<i64>, now: DateTime<Utc>) -> LeaseSpec {
        LeaseSpec {
            holder_identity: holder.map(|h| h.to_string()),
            lease_duration_seconds: Some(LEASE_TTL_SECS),
            acquire_time: Some(MicroTime(now - ChronoDuration::seconds(600))),
            renew_time: renewed_secs_ago.map(|s| MicroTime(now - ChronoDuration::seconds(s))),
            lease_transitions: Some(3),
        }
    }

    #[test]
    fn test_classify_missing_or_empty_spec() {
        let now = Utc::now();
        assert_eq!(classify("me", None, now), Holder::Nobody);
        assert_eq!(
            classify("me", Some(&spec(None, Some(1), now)), now),
            Holder::Nobody
        );
        assert_eq!(
            classify("me", Some(&spec(Some(""), Some(1), now)), now),
            Holder::Nobody
        );
    }

    #[test]
    fn test_classify_our_claim() {
        let now = Utc::now();
        // Our own claim counts even when stale; step() refreshes it
        assert_eq!(
            classify("me", Some(&spec(Some("me"), Some(9999), now)), now),
            Holder::Us
        );
    }

    #[test]
    fn test_classify_live_and_lapsed_other() {
        let now = Utc::now();
        assert_eq!(
            classify("me", Some(&spec(Some("peer"), Some(1), now)), now),
            Holder::Other
        );
        assert_eq!(
            classify(
                "me",
                Some(&spec(Some("peer"), Some(LEASE_TTL_SECS as i64 + 1), now)),
                now
            ),
            Holder::OtherExpired
        );
        // Never renewed means never held
        assert_eq!(
            classify("me", Some(&spec(Some("peer"), None, now)), now),
            Holder::OtherExpired
        );
    }

    #[test]
    fn test_claimed_spec_renewal_keeps_history() {
        let now = Utc::now();
        let prev = spec(Some("me"), Some(5), now);
        let next = claimed_spec("me", Some(&prev), now);

        assert_eq!(next.holder_identity.as_deref(), Some("me"));
        assert_eq!(next.lease_transitions, Some(3));
        assert_eq!(next.acquire_time, prev.acquire_time);
        assert_eq!(next.renew_time, Some(MicroTime(now)));
    }

    #[test]
    fn test_claimed_spec_takeover_bumps_transitions() {
        let now = Utc::now();
        let prev = spec(Some("peer"), Some(60), now);
        let next = claimed_spec("me", Some(&prev), now);

        assert_eq!(next.holder_identity.as_deref(), Some("me"));
        assert_eq!(next.lease_transitions, Some(4));
        assert_eq!(next.acquire_time, Some(MicroTime(now)));
    }

    #[test]
    fn test_claimed_spec_fresh_lease_starts_clean() {
        let now = Utc::now();
        let next = claimed_spec("me", None, now);
        assert_eq!(next.lease_transitions, Some(0));
        assert_eq!(next.acquire_time, Some(MicroTime(now)));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let base = Duration::from_secs(4);
        for _ in 0..50 {
            let d = jittered(base);
            assert!(d >= Duration::from_secs(3));
            assert!(d <= Duration::from_secs(5));
        }
    }
}
