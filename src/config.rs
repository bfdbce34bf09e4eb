use std::time::Duration;

use url::Url;

use crate::cascade::FetchStrategy;
use crate::error::Error;

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Engine configuration.
///
/// The required field (`base_url`) is a constructor parameter — no runtime
/// "missing field" errors. Use [`from_env()`](EngineConfig::from_env) for
/// convention-based setup, or [`new()`](EngineConfig::new) with `with_*`
/// methods for full control.
pub struct EngineConfig {
    pub(crate) base_url: Url,
    pub(crate) poll_interval: Duration,
    pub(crate) launch_url: Option<Url>,
    pub(crate) trusted_injection: bool,
    pub(crate) http: reqwest::Client,
    pub(crate) strategies: Option<Vec<Box<dyn FetchStrategy>>>,
}

impl EngineConfig {
    /// Create a configuration for the given backend base URL.
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            launch_url: None,
            trusted_injection: false,
            http: reqwest::Client::new(),
            strategies: None,
        }
    }

    /// Create a configuration from environment variables.
    ///
    /// # Required env vars
    /// - `TMA_API_BASE`: backend base URL
    ///
    /// # Optional env vars
    /// - `TMA_POLL_INTERVAL_SECS`: revalidation interval (default 30)
    /// - `TMA_TRUSTED_INJECTION`: `"1"` or `"true"` lets bridge injections
    ///   override endpoint-sourced data (debug/diagnostic deployments only)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required vars are missing or malformed.
    pub fn from_env() -> Result<Self, Error> {
        let base = std::env::var("TMA_API_BASE")
            .map_err(|_| Error::Config("TMA_API_BASE is required".into()))?;
        let base_url: Url = base
            .parse()
            .map_err(|e| Error::Config(format!("TMA_API_BASE: {e}")))?;

        let mut config = Self::new(base_url);

        if let Ok(raw) = std::env::var("TMA_POLL_INTERVAL_SECS") {
            let secs: u64 = raw
                .parse()
                .map_err(|e| Error::Config(format!("TMA_POLL_INTERVAL_SECS: {e}")))?;
            config = config.with_poll_interval(Duration::from_secs(secs));
        }
        let trusted = matches!(
            std::env::var("TMA_TRUSTED_INJECTION").as_deref(),
            Ok("1") | Ok("true")
        );

        Ok(config.with_trusted_injection(trusted))
    }

    /// Override the revalidation interval (reference value: 30 seconds).
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Provide the page's launch URL so identity can be read from the query
    /// string and fragment payload.
    #[must_use]
    pub fn with_launch_url(mut self, url: Url) -> Self {
        self.launch_url = Some(url);
        self
    }

    /// Treat the injection bridge as authoritative for the session: injected
    /// identities outrank every other source and injected statuses overwrite
    /// endpoint-sourced cache entries. Off by default; intended for
    /// diagnostics, not production.
    #[must_use]
    pub fn with_trusted_injection(mut self, trusted: bool) -> Self {
        self.trusted_injection = trusted;
        self
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Replace the default endpoint strategies. Order is significant: most
    /// authoritative first.
    #[must_use]
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn FetchStrategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::new("https://api.example.com".parse().unwrap());
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(!config.trusted_injection);
        assert!(config.launch_url.is_none());
        assert!(config.strategies.is_none());
    }

    #[test]
    fn builder_overrides() {
        let config = EngineConfig::new("https://api.example.com".parse().unwrap())
            .with_poll_interval(Duration::from_secs(5))
            .with_trusted_injection(true)
            .with_launch_url("https://app.example.com/?user_id=42".parse().unwrap());
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.trusted_injection);
        assert!(config.launch_url.is_some());
    }
}
