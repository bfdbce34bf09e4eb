use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use regex::Regex;
use time::OffsetDateTime;
use url::Url;

use crate::error::Error;
use crate::host::HostRuntime;
use crate::store::{self, ClientStore};
use crate::types::{IdentitySourceRecord, SourceKind, UserId};

/// Identity embedded in a launch-URL fragment payload, e.g. the host's
/// `tgWebAppData` blob carrying a serialized `{"id":123456789,...}` user.
static FRAGMENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""id"\s*:\s*(\d+)"#).expect("valid regex"));

/// Resolves one canonical identity from the ordered source set.
///
/// Priority, first non-empty match wins:
///
/// 1. injected value, when the bridge is trusted for the session
/// 2. caller-supplied identity
/// 3. host runtime session data
/// 4. launch-URL query parameter (`user_id`, then `id`)
/// 5. launch-URL fragment `"id":<digits>` payload
/// 6. persisted local value under [`store::IDENTITY_KEY`]
/// 7. injected value (untrusted fallback)
///
/// Resolution is deterministic: the same source availability yields the same
/// identity regardless of call order or timing.
pub struct IdentityResolver {
    host: Arc<dyn HostRuntime>,
    store: Arc<dyn ClientStore>,
    launch_url: Option<Url>,
    trusted_injection: bool,
    injected: Mutex<Option<UserId>>,
}

impl IdentityResolver {
    pub fn new(
        host: Arc<dyn HostRuntime>,
        store: Arc<dyn ClientStore>,
        launch_url: Option<Url>,
        trusted_injection: bool,
    ) -> Self {
        Self {
            host,
            store,
            launch_url,
            trusted_injection,
            injected: Mutex::new(None),
        }
    }

    /// Resolve the current best identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityUnresolved`] when no source matches. The
    /// engine must not attempt network fetches in that state.
    pub fn resolve(&self, caller: Option<&UserId>) -> Result<IdentitySourceRecord, Error> {
        let injected = self
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if self.trusted_injection {
            if let Some(id) = injected.clone() {
                return Ok(record(SourceKind::Injected, id));
            }
        }
        if let Some(id) = caller {
            return Ok(record(SourceKind::Caller, id.clone()));
        }
        if let Some(id) = self.host.user_id() {
            return Ok(record(SourceKind::HostRuntime, id));
        }
        if let Some(id) = self.from_query() {
            return Ok(record(SourceKind::QueryParam, id));
        }
        if let Some(id) = self.from_fragment() {
            return Ok(record(SourceKind::Fragment, id));
        }
        if let Some(id) = self.from_store() {
            return Ok(record(SourceKind::LocalStore, id));
        }
        if let Some(id) = injected {
            return Ok(record(SourceKind::Injected, id));
        }
        Err(Error::IdentityUnresolved)
    }

    /// Record an identity delivered over the injection bridge. Takes effect
    /// on the next [`resolve`](Self::resolve) pass.
    pub fn record_injected(&self, identity: UserId) {
        tracing::debug!(identity = %identity, "identity injected via bridge");
        *self
            .injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    /// Persist a resolved identity so it survives as the local-store source
    /// in later sessions.
    pub fn remember(&self, identity: &UserId) {
        self.store.set(store::IDENTITY_KEY, identity.as_str());
    }

    fn from_query(&self) -> Option<UserId> {
        let url = self.launch_url.as_ref()?;
        for key in ["user_id", "id"] {
            let value = url
                .query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned());
            if let Some(value) = value {
                match value.parse::<UserId>() {
                    Ok(id) => return Some(id),
                    Err(_) => tracing::debug!(key, "ignoring malformed query identity"),
                }
            }
        }
        None
    }

    fn from_fragment(&self) -> Option<UserId> {
        let fragment = self.launch_url.as_ref()?.fragment()?;
        let decoded = urlencoding::decode(fragment).ok()?;
        let captures = FRAGMENT_ID.captures(&decoded)?;
        captures.get(1)?.as_str().parse().ok()
    }

    fn from_store(&self) -> Option<UserId> {
        self.store
            .get(store::IDENTITY_KEY)
            .and_then(|v| v.parse().ok())
    }
}

fn record(source: SourceKind, identity: UserId) -> IdentitySourceRecord {
    IdentitySourceRecord {
        source,
        identity,
        resolved_at: OffsetDateTime::now_utc(),
    }
}
