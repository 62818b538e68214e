//! Messenger capability
//!
//! The WhatsApp transport is an external collaborator; the engine only sees
//! this trait. Sends and lookups carry a hard deadline, and sends on the
//! same messenger session are serialized through a per-session gate because
//! the transport is not assumed safe for concurrent use per session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use bl_common::{SendOutcome, SessionEvent};

use crate::Result;

/// Deadline for every outbound messenger operation. Expiry counts as a
/// transient failure.
pub const MESSENGER_DEADLINE: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver one text to one phone through the given session.
    async fn send(&self, session_id: &str, phone: &str, text: &str) -> SendOutcome;

    /// Check whether a phone number exists on the platform.
    /// `Err(SessionLost)` aborts the caller; any other outcome resolves the
    /// individual number.
    async fn lookup(&self, session_id: &str, phone: &str) -> Result<bool>;

    /// Connection events for a session. The engine pauses every campaign
    /// bound to a session when it disconnects.
    fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent>;
}

/// Send with the 30s deadline applied.
pub async fn send_with_deadline(
    messenger: &dyn Messenger,
    session_id: &str,
    phone: &str,
    text: &str,
) -> SendOutcome {
    match tokio::time::timeout(MESSENGER_DEADLINE, messenger.send(session_id, phone, text)).await {
        Ok(outcome) => outcome,
        Err(_) => SendOutcome::transient("send deadline exceeded"),
    }
}

/// Lookup with the 30s deadline applied. A timeout resolves to `Ok(false)`
/// so the number counts as invalid rather than aborting the pass.
pub async fn lookup_with_deadline(
    messenger: &dyn Messenger,
    session_id: &str,
    phone: &str,
) -> Result<bool> {
    match tokio::time::timeout(MESSENGER_DEADLINE, messenger.lookup(session_id, phone)).await {
        Ok(result) => result,
        Err(_) => Ok(false),
    }
}

/// Per-session async mutexes. Holding the session's lock across a send is
/// what serializes sends from different campaigns on the same session.
#[derive(Default)]
pub struct SessionGate {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
