use crate::types::CascadeAttempt;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No identity source matched. Terminal until a new source event (such
    /// as a bridge injection) arrives; never retried silently.
    #[error("no identity source matched")]
    IdentityUnresolved,
    /// Identity token failed validation (empty or contains whitespace).
    #[error("invalid identity token: {0:?}")]
    InvalidIdentity(String),
    /// Every endpoint in the cascade failed. Carries the per-attempt
    /// diagnostics for the run.
    #[error("all {} entitlement endpoints failed", attempts.len())]
    AllEndpointsFailed { attempts: Vec<CascadeAttempt> },
    /// A bridge injection failed shape validation.
    #[error("invalid injection: {0}")]
    InvalidInjection(String),
    #[error("configuration error: {0}")]
    Config(String),
}
