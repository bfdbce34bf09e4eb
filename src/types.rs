use std::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

/// Wire sentinel the backend uses for "unlimited" quota counters.
pub const UNLIMITED_SENTINEL: u32 = 9999;

/// Stable user identity token.
///
/// Opaque, non-empty by construction: holding a `UserId` proves the token is
/// usable for entitlement queries. Use `"42".parse::<UserId>()` or
/// `UserId::from(42u64)` to create one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl TryFrom<String> for UserId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if !s.is_empty() && !s.bytes().any(|b| b.is_ascii_whitespace()) {
            Ok(Self(s))
        } else {
            Err(Error::InvalidIdentity(s))
        }
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Remaining quota for a metered feature.
///
/// The backend reports `9999` for accounts with no metering; that sentinel is
/// a distinct logical state, not a countable balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Quota {
    Limited(u32),
    Unlimited,
}

impl Quota {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Limited(0))
    }
}

impl From<u32> for Quota {
    fn from(raw: u32) -> Self {
        if raw >= UNLIMITED_SENTINEL {
            Self::Unlimited
        } else {
            Self::Limited(raw)
        }
    }
}

impl From<Quota> for u32 {
    fn from(quota: Quota) -> Self {
        match quota {
            Quota::Limited(n) => n,
            Quota::Unlimited => UNLIMITED_SENTINEL,
        }
    }
}

/// Canonical entitlement state, the single shape every backend surface and
/// injection is mapped into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntitlementStatus {
    /// Active subscription. `expires_at` is `None` when the backend reports
    /// a subscription without an end date.
    Premium {
        #[serde(default, with = "time::serde::rfc3339::option")]
        expires_at: Option<OffsetDateTime>,
    },
    /// No subscription; metered feature quotas apply.
    Free {
        analysis_remaining: Quota,
        post_gen_remaining: Quota,
    },
    /// No answer could be produced (no identity, or no backend and no cache).
    Unresolved { reason: String },
}

impl EntitlementStatus {
    #[must_use]
    pub fn is_premium(&self) -> bool {
        matches!(self, Self::Premium { .. })
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved { .. })
    }
}

/// Where an identity came from, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[display("caller")]
    Caller,
    #[display("host_runtime")]
    HostRuntime,
    #[display("query_param")]
    QueryParam,
    #[display("fragment")]
    Fragment,
    #[display("local_store")]
    LocalStore,
    #[display("injected")]
    Injected,
}

/// A resolved identity together with the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySourceRecord {
    pub source: SourceKind,
    pub identity: UserId,
    pub resolved_at: OffsetDateTime,
}

/// Backend surfaces, ordered most-authoritative first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Standard status query.
    #[display("standard")]
    Standard,
    /// Path that bypasses client-side routing, so it is never intercepted
    /// and rendered as an HTML page.
    #[display("direct")]
    Direct,
    /// Mirrors the conversational bot's status format, for cross-validation.
    #[display("bot_parity")]
    BotParity,
}

/// How a single endpoint attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    HttpError(u16),
    /// Body failed structural validation (markup instead of data, unparsable
    /// JSON, or a shape the normalizer rejected).
    MalformedContent,
    NetworkError,
}

/// Diagnostic record for one endpoint attempt within a cascade run.
///
/// Ephemeral: kept only for the run that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeAttempt {
    pub endpoint: EndpointKind,
    pub outcome: AttemptOutcome,
    pub latency: Duration,
}

/// What produced a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusProvenance {
    Endpoint(EndpointKind),
    Injection,
}

/// Last known good status for one identity.
///
/// Only overwritten by a cascade success or a bridge injection, never by a
/// failed run. Persists across session restarts via the client-local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: UserId,
    pub status: EntitlementStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    pub provenance: StatusProvenance,
}

/// The view consumers observe.
///
/// `stale` is set whenever the status was served from cache because a fresh
/// fetch could not be obtained, so UI can indicate reduced confidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub status: EntitlementStatus,
    pub stale: bool,
    pub fetched_at: Option<OffsetDateTime>,
    pub provenance: Option<StatusProvenance>,
}

impl StatusView {
    pub(crate) fn fresh(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status.clone(),
            stale: false,
            fetched_at: Some(entry.fetched_at),
            provenance: Some(entry.provenance),
        }
    }

    pub(crate) fn stale(entry: &CacheEntry) -> Self {
        Self {
            stale: true,
            ..Self::fresh(entry)
        }
    }

    pub(crate) fn unresolved(reason: impl Into<String>) -> Self {
        Self {
            status: EntitlementStatus::Unresolved {
                reason: reason.into(),
            },
            stale: false,
            fetched_at: None,
            provenance: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_user_id() {
        assert!("42".parse::<UserId>().is_ok());
        assert!("user-abc".parse::<UserId>().is_ok());
    }

    #[test]
    fn invalid_user_id() {
        assert!("".parse::<UserId>().is_err());
        assert!("4 2".parse::<UserId>().is_err());
        assert!("42\n".parse::<UserId>().is_err());
    }

    #[test]
    fn user_id_from_numeric() {
        let id = UserId::from(123_456_789_u64);
        assert_eq!(id.as_str(), "123456789");
    }

    #[test]
    fn user_id_serde_roundtrip() {
        let id: UserId = "42".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"42\"");
        let parsed: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn user_id_serde_rejects_empty() {
        assert!(serde_json::from_str::<UserId>("\"\"").is_err());
    }

    #[test]
    fn quota_sentinel_is_unlimited() {
        assert_eq!(Quota::from(9999), Quota::Unlimited);
        assert_eq!(Quota::from(10_000), Quota::Unlimited);
        assert_eq!(Quota::from(3), Quota::Limited(3));
        assert_eq!(u32::from(Quota::Unlimited), 9999);
    }

    #[test]
    fn quota_exhaustion() {
        assert!(Quota::Limited(0).is_exhausted());
        assert!(!Quota::Limited(1).is_exhausted());
        assert!(!Quota::Unlimited.is_exhausted());
    }

    #[test]
    fn status_serde_roundtrip() {
        let status = EntitlementStatus::Premium {
            expires_at: Some(time::macros::datetime!(2025-01-01 00:00:00 UTC)),
        };
        let json = serde_json::to_string(&status).unwrap();
        let parsed: EntitlementStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }

    #[test]
    fn cache_entry_serde_roundtrip() {
        let entry = CacheEntry {
            identity: "42".parse().unwrap(),
            status: EntitlementStatus::Free {
                analysis_remaining: Quota::Limited(5),
                post_gen_remaining: Quota::Unlimited,
            },
            fetched_at: time::macros::datetime!(2025-06-01 12:00:00 UTC),
            provenance: StatusProvenance::Endpoint(EndpointKind::Direct),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn stale_view_keeps_status() {
        let entry = CacheEntry {
            identity: "42".parse().unwrap(),
            status: EntitlementStatus::Premium { expires_at: None },
            fetched_at: OffsetDateTime::now_utc(),
            provenance: StatusProvenance::Endpoint(EndpointKind::Standard),
        };
        let view = StatusView::stale(&entry);
        assert!(view.stale);
        assert!(view.status.is_premium());
    }
}
