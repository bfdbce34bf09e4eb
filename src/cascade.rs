use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use url::Url;

use crate::error::Error;
use crate::host::HostRuntime;
use crate::normalize::normalize;
use crate::types::{AttemptOutcome, CascadeAttempt, EndpointKind, EntitlementStatus, UserId};

/// Failure of a single endpoint attempt. Never escapes the cascade; it is
/// classified into an [`AttemptOutcome`] and the next strategy is tried.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("http status {0}")]
    Status(u16),
    /// Body looked like markup (document-type declaration or root tag)
    /// where structured data was expected.
    #[error("markup body where structured data was expected")]
    Markup,
    #[error("unparsable body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// One entitlement-fetch strategy against one backend surface.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn endpoint(&self) -> EndpointKind;

    /// Fetch the raw status payload for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on transport failure, error status, or a body
    /// that is not structured data.
    async fn fetch(&self, identity: &UserId) -> Result<JsonValue, FetchError>;
}

/// HTTP strategy over one of the backend's redundant surfaces.
///
/// Sends the identity credential as a header and path segment, attaches the
/// host's `initData` blob when present, and defeats intermediary caches with
/// a `Cache-Control: no-store` header plus a `_ts` query parameter.
pub struct HttpStrategy {
    kind: EndpointKind,
    base: Url,
    http: reqwest::Client,
    host: Arc<dyn HostRuntime>,
}

impl HttpStrategy {
    #[must_use]
    pub fn new(
        kind: EndpointKind,
        base: Url,
        http: reqwest::Client,
        host: Arc<dyn HostRuntime>,
    ) -> Self {
        Self {
            kind,
            base,
            http,
            host,
        }
    }

    fn path_segments(&self) -> &'static [&'static str] {
        match self.kind {
            EndpointKind::Standard => &["api", "subscription", "status"],
            EndpointKind::Direct => &["direct", "subscription-status"],
            EndpointKind::BotParity => &["api", "bot", "status"],
        }
    }

    fn request_url(&self, identity: &UserId) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(self.path_segments())
                .push(identity.as_str());
        }
        let ts = OffsetDateTime::now_utc().unix_timestamp_nanos();
        url.query_pairs_mut().append_pair("_ts", &ts.to_string());
        url
    }
}

#[async_trait]
impl FetchStrategy for HttpStrategy {
    fn endpoint(&self) -> EndpointKind {
        self.kind
    }

    async fn fetch(&self, identity: &UserId) -> Result<JsonValue, FetchError> {
        let mut request = self
            .http
            .get(self.request_url(identity))
            .header("X-Telegram-User-Id", identity.as_str())
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(init_data) = self.host.init_data() {
            request = request.header("X-Telegram-Init-Data", init_data);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await?;

        if looks_like_markup(content_type.as_deref(), &body) {
            return Err(FetchError::Markup);
        }
        serde_json::from_str(&body).map_err(|e| FetchError::Body(e.to_string()))
    }
}

/// A markup content signature means the request was intercepted by the
/// client-side router and answered with an HTML page.
fn looks_like_markup(content_type: Option<&str>, body: &str) -> bool {
    if content_type.is_some_and(|ct| ct.contains("text/html")) {
        return true;
    }
    // JSON never opens with '<'; this covers both a doctype declaration and
    // a bare root tag.
    body.trim_start().starts_with('<')
}

/// A successful cascade run.
#[derive(Debug)]
pub struct CascadeOutcome {
    pub status: EntitlementStatus,
    /// Surface that produced the accepted payload.
    pub endpoint: EndpointKind,
    /// Per-attempt diagnostics for this run, in try order.
    pub attempts: Vec<CascadeAttempt>,
}

/// Ordered fallback sequence over the backend's redundant surfaces.
///
/// Strategies are tried strictly in order, most authoritative first; the
/// first structurally valid payload wins and no further strategies run.
/// Ordering is fixed per deployment, never adaptive.
pub struct EndpointCascade {
    strategies: Vec<Box<dyn FetchStrategy>>,
}

impl EndpointCascade {
    #[must_use]
    pub fn new(strategies: Vec<Box<dyn FetchStrategy>>) -> Self {
        Self { strategies }
    }

    /// Run the cascade for one identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllEndpointsFailed`] when every strategy failed.
    /// No individual attempt's failure ever propagates.
    pub async fn run(&self, identity: &UserId) -> Result<CascadeOutcome, Error> {
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            let endpoint = strategy.endpoint();
            let started = Instant::now();

            let outcome = match strategy.fetch(identity).await {
                Ok(payload) => match normalize(&payload, endpoint) {
                    Ok(status) => {
                        attempts.push(CascadeAttempt {
                            endpoint,
                            outcome: AttemptOutcome::Success,
                            latency: started.elapsed(),
                        });
                        tracing::debug!(endpoint = %endpoint, "entitlement fetched");
                        return Ok(CascadeOutcome {
                            status,
                            endpoint,
                            attempts,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %endpoint, error = %e, "payload rejected by normalizer");
                        AttemptOutcome::MalformedContent
                    }
                },
                Err(FetchError::Markup) => {
                    // Distinct from an outage: markup here means a routing or
                    // deployment defect on the backend.
                    tracing::warn!(endpoint = %endpoint, "markup response where JSON was expected");
                    AttemptOutcome::MalformedContent
                }
                Err(FetchError::Body(detail)) => {
                    tracing::warn!(endpoint = %endpoint, detail = %detail, "unparsable response body");
                    AttemptOutcome::MalformedContent
                }
                Err(FetchError::Status(code)) => {
                    tracing::debug!(endpoint = %endpoint, code, "endpoint returned error status");
                    AttemptOutcome::HttpError(code)
                }
                Err(FetchError::Transport(detail)) => {
                    tracing::debug!(endpoint = %endpoint, detail = %detail, "transport failure");
                    AttemptOutcome::NetworkError
                }
            };

            attempts.push(CascadeAttempt {
                endpoint,
                outcome,
                latency: started.elapsed(),
            });
        }

        Err(Error::AllEndpointsFailed { attempts })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::types::Quota;

    enum Script {
        Ok(JsonValue),
        Status(u16),
        Markup,
        Network,
    }

    struct Scripted {
        kind: EndpointKind,
        script: Script,
        calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn boxed(kind: EndpointKind, script: Script) -> (Box<dyn FetchStrategy>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let strategy = Box::new(Self {
                kind,
                script,
                calls: calls.clone(),
            });
            (strategy, calls)
        }
    }

    #[async_trait]
    impl FetchStrategy for Scripted {
        fn endpoint(&self) -> EndpointKind {
            self.kind
        }

        async fn fetch(&self, _identity: &UserId) -> Result<JsonValue, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.script {
                Script::Ok(v) => Ok(v.clone()),
                Script::Status(code) => Err(FetchError::Status(*code)),
                Script::Markup => Err(FetchError::Markup),
                Script::Network => Err(FetchError::Transport("connection refused".into())),
            }
        }
    }

    fn id() -> UserId {
        "42".parse().unwrap()
    }

    #[tokio::test]
    async fn markup_then_valid_yields_premium() {
        let (first, _) = Scripted::boxed(EndpointKind::Standard, Script::Markup);
        let (second, _) = Scripted::boxed(
            EndpointKind::Direct,
            Script::Ok(json!({ "has_premium": true })),
        );
        let cascade = EndpointCascade::new(vec![first, second]);

        let outcome = cascade.run(&id()).await.unwrap();
        assert!(outcome.status.is_premium());
        assert_eq!(outcome.endpoint, EndpointKind::Direct);
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::MalformedContent);
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn first_success_stops_the_cascade() {
        let (first, _) = Scripted::boxed(
            EndpointKind::Standard,
            Script::Ok(json!({ "has_subscription": true })),
        );
        let (second, second_calls) = Scripted::boxed(
            EndpointKind::Direct,
            Script::Ok(json!({ "has_subscription": false })),
        );
        let cascade = EndpointCascade::new(vec![first, second]);

        let outcome = cascade.run(&id()).await.unwrap();
        assert_eq!(outcome.endpoint, EndpointKind::Standard);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_failures_are_aggregated() {
        let (a, _) = Scripted::boxed(EndpointKind::Standard, Script::Status(502));
        let (b, _) = Scripted::boxed(EndpointKind::Direct, Script::Markup);
        let (c, _) = Scripted::boxed(EndpointKind::BotParity, Script::Network);
        let cascade = EndpointCascade::new(vec![a, b, c]);

        match cascade.run(&id()).await {
            Err(Error::AllEndpointsFailed { attempts }) => {
                assert_eq!(attempts.len(), 3);
                assert_eq!(attempts[0].outcome, AttemptOutcome::HttpError(502));
                assert_eq!(attempts[1].outcome, AttemptOutcome::MalformedContent);
                assert_eq!(attempts[2].outcome, AttemptOutcome::NetworkError);
            }
            other => panic!("expected AllEndpointsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn backend_error_field_continues_cascade() {
        let (first, _) = Scripted::boxed(
            EndpointKind::Standard,
            Script::Ok(json!({ "has_subscription": false, "error": "user not found" })),
        );
        let (second, _) = Scripted::boxed(
            EndpointKind::Direct,
            Script::Ok(json!({ "has_subscription": false, "analysis_count": 1 })),
        );
        let cascade = EndpointCascade::new(vec![first, second]);

        let outcome = cascade.run(&id()).await.unwrap();
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::MalformedContent);
        assert_eq!(
            outcome.status,
            EntitlementStatus::Free {
                analysis_remaining: Quota::Limited(1),
                post_gen_remaining: Quota::Limited(0),
            }
        );
    }

    #[tokio::test]
    async fn empty_cascade_fails_definitely() {
        let cascade = EndpointCascade::new(Vec::new());
        assert!(matches!(
            cascade.run(&id()).await,
            Err(Error::AllEndpointsFailed { attempts }) if attempts.is_empty()
        ));
    }

    #[test]
    fn markup_detection() {
        assert!(looks_like_markup(None, "<!DOCTYPE html><html></html>"));
        assert!(looks_like_markup(None, "  <html><body>404</body></html>"));
        assert!(looks_like_markup(Some("text/html; charset=utf-8"), "{}"));
        assert!(!looks_like_markup(
            Some("application/json"),
            "{\"has_subscription\":true}"
        ));
        assert!(!looks_like_markup(None, "{\"has_subscription\":true}"));
    }

    #[test]
    fn request_url_carries_identity_and_anti_cache() {
        let strategy = HttpStrategy::new(
            EndpointKind::Standard,
            "https://api.example.com".parse().unwrap(),
            reqwest::Client::new(),
            Arc::new(crate::host::NullHost),
        );
        let url = strategy.request_url(&id());
        assert!(url.path().ends_with("/api/subscription/status/42"));
        assert!(url.query().unwrap().contains("_ts="));
    }

    #[test]
    fn direct_surface_bypasses_router_path() {
        let strategy = HttpStrategy::new(
            EndpointKind::Direct,
            "https://api.example.com/base".parse().unwrap(),
            reqwest::Client::new(),
            Arc::new(crate::host::NullHost),
        );
        let url = strategy.request_url(&id());
        assert!(url.path().ends_with("/base/direct/subscription-status/42"));
    }
}
