use tokio::sync::broadcast;

use crate::types::UserId;

/// Out-of-cycle refresh triggers emitted by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// The host viewport became stable/visible again.
    ViewportStable,
    /// A payment flow completed; entitlement may have changed.
    PaymentCompleted,
}

/// Capability interface over the Mini-App host runtime.
///
/// The real host object is duck-typed and any of its methods may be absent,
/// so every capability is modelled as an `Option`-returning method with a
/// no-op default — callers feature-detect, never assume presence.
///
/// # Example
///
/// ```rust,ignore
/// struct WebAppHost { /* bindings to window.Telegram.WebApp */ }
///
/// impl HostRuntime for WebAppHost {
///     fn user_id(&self) -> Option<UserId> {
///         self.init_data_unsafe()?.user?.id.try_into().ok()
///     }
///     fn init_data(&self) -> Option<String> {
///         self.raw_init_data()
///     }
/// }
/// ```
pub trait HostRuntime: Send + Sync + 'static {
    /// Numeric user identity from the host's current session data, if the
    /// host exposes one.
    fn user_id(&self) -> Option<UserId> {
        None
    }

    /// Opaque credential blob (`initData`) for request authentication.
    fn init_data(&self) -> Option<String> {
        None
    }

    /// Tell the host the client finished bootstrapping. No-op when the host
    /// lacks the capability.
    fn signal_ready(&self) {}

    /// Subscribe to host signals (visibility, payment completion).
    /// `None` when the host cannot deliver events.
    fn signals(&self) -> Option<broadcast::Receiver<HostSignal>> {
        None
    }
}

/// Host implementation for environments without a Mini-App host: exposes no
/// identity, no credentials and no signals.
pub struct NullHost;

impl HostRuntime for NullHost {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_host_has_no_capabilities() {
        let host = NullHost;
        assert!(host.user_id().is_none());
        assert!(host.init_data().is_none());
        assert!(host.signals().is_none());
        host.signal_ready();
    }
}
