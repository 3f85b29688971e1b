//! Webhook receiver
//!
//! Accepts Provider webhook deliveries, authenticates them with
//! HMAC-SHA256, matches them against the scale-up triggers of every
//! autoscaler in scope, and appends capacity reservations to the matching
//! autoscalers.

mod events;
mod matching;
mod server;

pub use events::{EventContext, EventKind, parse_event};
pub use matching::{scope_matches, trigger_matches};
pub use server::{webhook_router, WebhookState};
