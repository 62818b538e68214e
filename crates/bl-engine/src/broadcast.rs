//! Broadcaster capability
//!
//! Realtime push to per-user rooms. The engine emits `campaign-progress`,
//! `campaign-alert`, `sessions-update` and `notification` events; what sits
//! behind the trait (socket server, message bus) is a collaborator concern.

use serde_json::Value;
use tracing::info;

pub trait Broadcaster: Send + Sync {
    fn emit(&self, room: &str, event: &str, payload: Value);
}

/// Discards every event.
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn emit(&self, _room: &str, _event: &str, _payload: Value) {}
}

/// Logs every event; used by the dev monolith.
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn emit(&self, room: &str, event: &str, payload: Value) {
        info!(room = %room, event = %event, payload = %payload, "broadcast");
    }
}
