use tokio::sync::broadcast;

use crate::error::Error;
use crate::types::{EntitlementStatus, UserId};

/// Out-of-band delivery into the engine, bypassing the fetch cascade.
#[derive(Debug, Clone)]
pub enum Injection {
    /// A late-arriving identity (e.g. host session data resolved after the
    /// engine's first pass). Triggers re-resolution and a cascade run.
    Identity(UserId),
    /// A pre-computed status for an identity. Written straight to the cache
    /// and pushed to consumers without waiting for a poll tick.
    Status {
        identity: UserId,
        status: EntitlementStatus,
    },
}

/// Broadcast channel for pushing identity and entitlement into the engine.
///
/// Used by diagnostic tooling and by bootstrap code that resolves the host
/// identity after the engine's own first attempt. Whether an injected status
/// may overwrite endpoint-sourced cache data is gated by
/// [`EngineConfig::with_trusted_injection`](crate::config::EngineConfig::with_trusted_injection).
#[derive(Clone)]
pub struct InjectionBridge {
    tx: broadcast::Sender<Injection>,
}

impl InjectionBridge {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn inject_identity(&self, identity: UserId) {
        if self.tx.send(Injection::Identity(identity)).is_err() {
            tracing::debug!("identity injection dropped: no engine listening");
        }
    }

    /// Deliver a pre-computed status for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInjection`] for statuses that fail shape
    /// validation: only definite states may be injected, never `Unresolved`.
    pub fn inject_status(&self, identity: UserId, status: EntitlementStatus) -> Result<(), Error> {
        if !status.is_resolved() {
            return Err(Error::InvalidInjection(
                "an unresolved status cannot be injected".into(),
            ));
        }
        if self.tx.send(Injection::Status { identity, status }).is_err() {
            tracing::debug!("status injection dropped: no engine listening");
        }
        Ok(())
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Injection> {
        self.tx.subscribe()
    }
}

impl Default for InjectionBridge {
    fn default() -> Self {
        Self::new()
    }
}
