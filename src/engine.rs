use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use crate::bridge::{Injection, InjectionBridge};
use crate::cache::StatusCache;
use crate::cascade::{EndpointCascade, FetchStrategy, HttpStrategy};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::host::{HostRuntime, HostSignal};
use crate::identity::IdentityResolver;
use crate::store::ClientStore;
use crate::types::{
    CacheEntry, EndpointKind, StatusProvenance, StatusView, UserId,
};

/// Why a cascade run was started.
#[derive(Debug, Clone, Copy)]
enum RefreshCause {
    Initial,
    Tick,
    Manual,
    Signal(HostSignal),
    Injection,
}

/// The Identity & Entitlement Resolution Engine.
///
/// Owns the resolver, the endpoint cascade, the status cache and one
/// background polling task shared by all consumers. Consumers call
/// [`activate`](Self::activate) to attach and read the current
/// [`StatusView`] through the returned handle; they never observe raw
/// network state.
pub struct EntitlementEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    resolver: IdentityResolver,
    cascade: EndpointCascade,
    cache: StatusCache,
    bridge: InjectionBridge,
    host: Arc<dyn HostRuntime>,
    poll_interval: std::time::Duration,
    trusted_injection: bool,
    watch_tx: watch::Sender<StatusView>,
    watch_rx: watch::Receiver<StatusView>,
    active: Mutex<Option<ActiveTask>>,
}

struct ActiveTask {
    subscribers: usize,
    refresh_tx: mpsc::Sender<RefreshCause>,
    handle: JoinHandle<()>,
}

impl EntitlementEngine {
    /// Wire up the engine from its configuration, host capability set and
    /// client-local store. No network activity happens until a consumer
    /// activates it.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        host: Arc<dyn HostRuntime>,
        store: Arc<dyn ClientStore>,
    ) -> Self {
        let EngineConfig {
            base_url,
            poll_interval,
            launch_url,
            trusted_injection,
            http,
            strategies,
        } = config;

        let strategies =
            strategies.unwrap_or_else(|| default_strategies(&base_url, &http, &host));
        let resolver =
            IdentityResolver::new(host.clone(), store.clone(), launch_url, trusted_injection);
        let (watch_tx, watch_rx) = watch::channel(StatusView::unresolved("engine not activated"));

        Self {
            inner: Arc::new(EngineInner {
                resolver,
                cascade: EndpointCascade::new(strategies),
                cache: StatusCache::new(store),
                bridge: InjectionBridge::new(),
                host,
                poll_interval,
                trusted_injection,
                watch_tx,
                watch_rx,
                active: Mutex::new(None),
            }),
        }
    }

    /// Attach a consumer.
    ///
    /// The first activation resolves identity, publishes any cached status
    /// (marked stale), spawns the polling task and triggers an immediate
    /// cascade run. Later activations join the same task; `caller` is only
    /// consulted on the first one. When identity cannot be resolved the
    /// handle still works: the view is a definite `Unresolved` and the task
    /// waits for an identity over the bridge instead of polling.
    ///
    /// Dropping the last handle cancels the task deterministically; an
    /// in-flight fetch cancelled this way never writes to the cache.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn activate(&self, caller: Option<UserId>) -> EngineHandle {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(task) = active.as_mut() {
            task.subscribers += 1;
            return EngineHandle {
                rx: self.inner.watch_rx.clone(),
                refresh_tx: task.refresh_tx.clone(),
                inner: self.inner.clone(),
            };
        }

        self.inner.host.signal_ready();

        let identity = match self.inner.resolver.resolve(caller.as_ref()) {
            Ok(record) => {
                tracing::info!(identity = %record.identity, source = %record.source, "identity resolved");
                self.inner.resolver.remember(&record.identity);
                Some(record.identity)
            }
            Err(e) => {
                tracing::warn!(error = %e, "activated without identity; waiting for bridge");
                None
            }
        };

        // Consumers see the last known status immediately, marked stale
        // until the first fresh fetch lands.
        let initial = match identity.as_ref().and_then(|id| self.inner.cache.get(id)) {
            Some(entry) => StatusView::stale(&entry),
            None if identity.is_some() => StatusView::unresolved("no entitlement data yet"),
            None => StatusView::unresolved("no identity source matched"),
        };
        self.inner.publish(initial);

        // Capacity 1: a refresh requested while one is already pending is
        // skipped, never queued.
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let task = PollTask {
            inner: self.inner.clone(),
            caller,
            identity,
            refresh_rx,
            bridge_rx: self.inner.bridge.subscribe(),
            host_rx: self.inner.host.signals(),
        };
        let handle = tokio::spawn(task.run());

        *active = Some(ActiveTask {
            subscribers: 1,
            refresh_tx: refresh_tx.clone(),
            handle,
        });

        EngineHandle {
            rx: self.inner.watch_rx.clone(),
            refresh_tx,
            inner: self.inner.clone(),
        }
    }

    /// The injection bridge for this engine.
    #[must_use]
    pub fn bridge(&self) -> InjectionBridge {
        self.inner.bridge.clone()
    }
}

impl EngineInner {
    fn publish(&self, view: StatusView) {
        self.watch_tx.send_replace(view);
    }

    fn release(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = active.as_mut() {
            task.subscribers -= 1;
            if task.subscribers == 0 {
                if let Some(task) = active.take() {
                    task.handle.abort();
                    tracing::debug!("last consumer detached; polling stopped");
                }
            }
        }
    }
}

/// A consumer's attachment to the engine.
pub struct EngineHandle {
    rx: watch::Receiver<StatusView>,
    refresh_tx: mpsc::Sender<RefreshCause>,
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Latest view. Synchronous; never blocks on the network.
    #[must_use]
    pub fn current(&self) -> StatusView {
        self.rx.borrow().clone()
    }

    /// Wait for the view to change and return the new one.
    pub async fn changed(&mut self) -> StatusView {
        if self.rx.changed().await.is_ok() {
            return self.rx.borrow_and_update().clone();
        }
        self.rx.borrow().clone()
    }

    /// Request one out-of-cycle cascade run (the manual-retry affordance).
    /// Skipped if a run is already in flight or pending.
    pub fn refresh(&self) {
        if self.refresh_tx.try_send(RefreshCause::Manual).is_err() {
            tracing::debug!("manual refresh skipped; a run is already pending");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// The polling task: one per engine, strictly sequential cascade runs.
struct PollTask {
    inner: Arc<EngineInner>,
    caller: Option<UserId>,
    identity: Option<UserId>,
    refresh_rx: mpsc::Receiver<RefreshCause>,
    bridge_rx: broadcast::Receiver<Injection>,
    host_rx: Option<broadcast::Receiver<HostSignal>>,
}

impl PollTask {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.inner.poll_interval,
            self.inner.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if self.identity.is_some() {
            self.run_cascade(RefreshCause::Initial).await;
            ticker.reset();
        }

        loop {
            tokio::select! {
                _ = ticker.tick(), if self.identity.is_some() => {
                    self.run_cascade(RefreshCause::Tick).await;
                    ticker.reset();
                }
                Some(cause) = self.refresh_rx.recv() => {
                    if self.identity.is_some() {
                        self.run_cascade(cause).await;
                        ticker.reset();
                    }
                }
                injection = self.bridge_rx.recv() => {
                    match injection {
                        Ok(injection) => {
                            self.handle_injection(injection).await;
                            ticker.reset();
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "injection bridge lagged");
                        }
                        Err(RecvError::Closed) => return,
                    }
                }
                signal = recv_signal(&mut self.host_rx), if self.host_rx.is_some() => {
                    match signal {
                        Some(signal) => {
                            tracing::debug!(?signal, "host signal");
                            if self.identity.is_some() {
                                self.run_cascade(RefreshCause::Signal(signal)).await;
                                ticker.reset();
                            }
                        }
                        None => self.host_rx = None,
                    }
                }
            }
        }
    }

    /// Runs the cascade once and publishes the result. Runs are strictly
    /// sequential within the task; this await is the sole in-flight run.
    async fn run_cascade(&mut self, cause: RefreshCause) {
        let Some(identity) = self.identity.clone() else {
            return;
        };
        tracing::debug!(identity = %identity, ?cause, "cascade run");

        match self.inner.cascade.run(&identity).await {
            Ok(outcome) => {
                let entry = CacheEntry {
                    identity,
                    status: outcome.status,
                    fetched_at: OffsetDateTime::now_utc(),
                    provenance: StatusProvenance::Endpoint(outcome.endpoint),
                };
                self.inner.cache.put(entry.clone());
                self.inner.publish(StatusView::fresh(&entry));
            }
            Err(Error::AllEndpointsFailed { attempts }) => {
                if let Some(entry) = self.inner.cache.get(&identity) {
                    tracing::warn!(
                        identity = %identity,
                        attempts = attempts.len(),
                        stale = true,
                        "all endpoints failed; serving cached status"
                    );
                    self.inner.publish(StatusView::stale(&entry));
                } else {
                    tracing::warn!(
                        identity = %identity,
                        attempts = attempts.len(),
                        "all endpoints failed with no cached status"
                    );
                    self.inner
                        .publish(StatusView::unresolved("entitlement backend unreachable"));
                }
            }
            Err(e) => tracing::warn!(error = %e, "cascade run failed"),
        }

        // Refreshes requested while this run was in flight are skipped.
        while self.refresh_rx.try_recv().is_ok() {}
    }

    async fn handle_injection(&mut self, injection: Injection) {
        match injection {
            Injection::Identity(identity) => {
                self.inner.resolver.record_injected(identity);
                self.re_resolve().await;
            }
            Injection::Status { identity, status } => {
                // Same shape validation as the bridge sender; a raw channel
                // clone could bypass `inject_status`.
                if !status.is_resolved() {
                    tracing::warn!("discarding unresolved status injection");
                    return;
                }
                if !self.inner.trusted_injection && self.inner.cache.get(&identity).is_some() {
                    tracing::warn!(
                        identity = %identity,
                        "ignoring status injection over an existing entry (injection not trusted)"
                    );
                    return;
                }
                let entry = CacheEntry {
                    identity: identity.clone(),
                    status,
                    fetched_at: OffsetDateTime::now_utc(),
                    provenance: StatusProvenance::Injection,
                };
                self.inner.cache.put(entry.clone());
                if self.identity.as_ref() == Some(&identity) {
                    self.inner.publish(StatusView::fresh(&entry));
                }
            }
        }
    }

    /// An injected identity is a re-resolution trigger, not merely a
    /// fallback: it re-runs the full priority pass and may swap the active
    /// identity for the session.
    async fn re_resolve(&mut self) {
        match self.inner.resolver.resolve(self.caller.as_ref()) {
            Ok(record) => {
                if self.identity.as_ref() != Some(&record.identity) {
                    tracing::info!(
                        identity = %record.identity,
                        source = %record.source,
                        "identity re-resolved"
                    );
                    self.inner.resolver.remember(&record.identity);
                    if let Some(entry) = self.inner.cache.get(&record.identity) {
                        self.inner.publish(StatusView::stale(&entry));
                    }
                    self.identity = Some(record.identity);
                }
                self.run_cascade(RefreshCause::Injection).await;
            }
            Err(e) => tracing::warn!(error = %e, "re-resolution after injection failed"),
        }
    }
}

async fn recv_signal(rx: &mut Option<broadcast::Receiver<HostSignal>>) -> Option<HostSignal> {
    match rx.as_mut() {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(signal) => break Some(signal),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break None,
            }
        },
        // Branch is disabled by the select guard; never polled.
        None => None,
    }
}

fn default_strategies(
    base: &Url,
    http: &reqwest::Client,
    host: &Arc<dyn HostRuntime>,
) -> Vec<Box<dyn FetchStrategy>> {
    [
        EndpointKind::Standard,
        EndpointKind::Direct,
        EndpointKind::BotParity,
    ]
    .into_iter()
    .map(|kind| {
        Box::new(HttpStrategy::new(
            kind,
            base.clone(),
            http.clone(),
            host.clone(),
        )) as Box<dyn FetchStrategy>
    })
    .collect()
}
