//! Webhook HTTP endpoint
//!
//! `POST /` receives Provider deliveries. The request is authenticated
//! against the shared secret, deduplicated by delivery ID, matched against
//! every autoscaler in scope and answered with the number of reservations
//! appended.

use crate::crd::{CapacityReservation, HorizontalRunnerAutoscaler, RunnerDeployment};
use crate::error::{OperatorError, Result};
use crate::webhook::events::parse_event;
use crate::webhook::matching::{scope_matches, trigger_matches};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use sha2::Sha256;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Recent delivery IDs kept for duplicate suppression.
const DELIVERY_RING_CAPACITY: usize = 1024;

/// Attempts before giving up on a conflicting status write.
const APPEND_RETRIES: usize = 3;

/// Shared state behind the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    client: Client,
    namespace: Option<String>,
    secret: Option<String>,
    seen: Arc<Mutex<DeliveryRing>>,
}

impl WebhookState {
    pub fn new(client: Client, namespace: Option<String>, secret: Option<String>) -> Self {
        Self {
            client,
            namespace,
            secret: secret.filter(|s| !s.is_empty()),
            seen: Arc::new(Mutex::new(DeliveryRing::new(DELIVERY_RING_CAPACITY))),
        }
    }
}

/// Build the webhook router.
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/", post(handle_delivery))
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(state)
}

async fn handle_delivery(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event_name = header(&headers, "x-github-event").unwrap_or_default();
    let delivery_id = header(&headers, "x-github-delivery").unwrap_or_default();

    if let Some(secret) = &state.secret {
        let signature = header(&headers, "x-hub-signature-256").unwrap_or_default();
        if !verify_signature(secret, &body, &signature) {
            warn!(delivery = %delivery_id, "Rejected delivery with invalid signature");
            return (StatusCode::UNAUTHORIZED, "signature mismatch").into_response();
        }
    }

    let context = match parse_event(&event_name, &body) {
        Ok(Some(context)) => context,
        Ok(None) => {
            debug!(event = %event_name, "Ignoring unsupported event");
            return (StatusCode::OK, "ignored").into_response();
        }
        Err(e) => {
            warn!(event = %event_name, "Malformed payload: {}", e);
            return (StatusCode::BAD_REQUEST, "malformed payload").into_response();
        }
    };

    if !delivery_id.is_empty() {
        let duplicate = {
            let mut seen = state.seen.lock().expect("delivery ring lock poisoned");
            !seen.insert(&delivery_id)
        };
        if duplicate {
            debug!(delivery = %delivery_id, "Suppressing duplicate delivery");
            return (StatusCode::OK, "duplicate").into_response();
        }
    }

    match append_matching_reservations(&state, &context).await {
        Ok(matched) => {
            info!(
                event = %event_name,
                delivery = %delivery_id,
                matched,
                "Processed webhook delivery"
            );
            (StatusCode::OK, format!("matched {} autoscaler(s)", matched)).into_response()
        }
        Err(e) => {
            warn!(delivery = %delivery_id, "Failed to persist reservations: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "persistence failure").into_response()
        }
    }
}

/// Walk every autoscaler in scope and append one reservation per matching
/// trigger. Returns how many autoscalers matched.
async fn append_matching_reservations(
    state: &WebhookState,
    context: &crate::webhook::events::EventContext,
) -> Result<usize> {
    let autoscalers: Api<HorizontalRunnerAutoscaler> = match &state.namespace {
        Some(ns) => Api::namespaced(state.client.clone(), ns),
        None => Api::all(state.client.clone()),
    };

    let list = autoscalers.list(&Default::default()).await?;
    let mut matched = 0;

    for hra in &list.items {
        let namespace = hra.namespace().unwrap_or_else(|| "default".to_string());
        let deployments: Api<RunnerDeployment> = Api::namespaced(state.client.clone(), &namespace);
        let Some(deployment) = deployments.get_opt(&hra.spec.scale_target_ref.name).await? else {
            continue;
        };

        let config = &deployment.spec.template.spec.config;
        if !scope_matches(config, context) {
            continue;
        }

        let Some(trigger) = hra
            .spec
            .scale_up_triggers
            .iter()
            .find(|t| trigger_matches(&t.github_event, context, &config.labels))
        else {
            continue;
        };

        let scoped: Api<HorizontalRunnerAutoscaler> =
            Api::namespaced(state.client.clone(), &namespace);
        append_reservation(&scoped, &hra.name_any(), trigger.amount, trigger.duration_seconds)
            .await?;
        matched += 1;
    }

    Ok(matched)
}

/// Append one reservation, retrying on resource-version conflicts with a
/// fresh read so concurrent deliveries are both preserved.
async fn append_reservation(
    api: &Api<HorizontalRunnerAutoscaler>,
    name: &str,
    amount: i32,
    duration_seconds: i64,
) -> Result<()> {
    for attempt in 0..APPEND_RETRIES {
        let mut hra = api.get(name).await?;
        let now = Utc::now();
        let mut status = hra.status.take().unwrap_or_default();
        status.capacity_reservations.push(CapacityReservation {
            effective_time: now.to_rfc3339(),
            expiration_time: (now + ChronoDuration::seconds(duration_seconds)).to_rfc3339(),
            replicas: amount,
        });
        hra.status = Some(status);

        match api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(&hra)?)
            .await
        {
            Ok(_) => {
                debug!(autoscaler = %name, amount, "Appended capacity reservation");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(autoscaler = %name, attempt, "Reservation append conflict, retrying");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(OperatorError::Conflict(format!(
        "could not append reservation to {} after {} attempts",
        name, APPEND_RETRIES
    )))
}

/// Constant-time verification of `X-Hub-Signature-256: sha256=<hex>`.
pub(crate) fn verify_signature(secret: &str, payload: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Some(expected) = decode_hex(hex_digest) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&value[i..i + 2], 16).ok())
        .collect()
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Bounded FIFO of delivery IDs with O(1) membership checks.
pub(crate) struct DeliveryRing {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl DeliveryRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false when the ID was already present.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        let digest = mac.finalize().into_bytes();
        let mut hex = String::new();
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        format!("sha256={}", hex)
    }

    #[test]
    fn test_signature_roundtrip() {
        let secret = "hook-secret";
        let payload = br#"{"action": "created"}"#;
        let header = sign(secret, payload);
        assert!(verify_signature(secret, payload, &header));
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let payload = br#"{"action": "created"}"#;
        let header = sign("right-secret", payload);
        assert!(!verify_signature("wrong-secret", payload, &header));
    }

    #[test]
    fn test_signature_rejects_tampered_payload() {
        let secret = "hook-secret";
        let header = sign(secret, br#"{"action": "created"}"#);
        assert!(!verify_signature(secret, br#"{"action": "closed"}"#, &header));
    }

    #[test]
    fn test_signature_rejects_bad_header_shapes() {
        assert!(!verify_signature("s", b"x", "md5=abcdef"));
        assert!(!verify_signature("s", b"x", "sha256=zz"));
        assert!(!verify_signature("s", b"x", "sha256=abc"));
        assert!(!verify_signature("s", b"x", ""));
    }

    #[test]
    fn test_delivery_ring_suppresses_duplicates() {
        let mut ring = DeliveryRing::new(4);
        assert!(ring.insert("a"));
        assert!(!ring.insert("a"));
        assert!(ring.insert("b"));
    }

    #[test]
    fn test_delivery_ring_evicts_oldest() {
        let mut ring = DeliveryRing::new(2);
        assert!(ring.insert("a"));
        assert!(ring.insert("b"));
        assert!(ring.insert("c"));
        // "a" fell out of the window, so it reads as fresh again
        assert!(ring.insert("a"));
        // "c" is still inside the window
        assert!(!ring.insert("c"));
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert!(decode_hex("0").is_none());
        assert!(decode_hex("zz").is_none());
    }
}
