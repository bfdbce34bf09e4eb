use serde::Deserialize;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::types::{EndpointKind, EntitlementStatus, Quota};

/// Why a structurally-200 payload was rejected. Rejection forces cascade
/// continuation, exactly like a transport failure.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum NormalizeError {
    /// The body carried an explicit `error` field despite the 200 status.
    #[error("backend reported error: {0}")]
    BackendError(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// Quota counters must be non-negative.
    #[error("negative counter: {0}")]
    NegativeCounter(&'static str),
    #[error("unexpected shape: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Standard and direct surfaces share one flat shape.
#[derive(Debug, Deserialize)]
struct FlatPayload {
    #[serde(default, alias = "has_premium")]
    has_subscription: Option<bool>,
    #[serde(default)]
    subscription_end_date: Option<String>,
    #[serde(default)]
    analysis_count: Option<i64>,
    #[serde(default)]
    post_generation_count: Option<i64>,
}

/// Bot-parity surface nests the subscription and limits.
#[derive(Debug, Deserialize)]
struct BotPayload {
    subscription: Option<BotSubscription>,
    #[serde(default)]
    limits: Option<BotLimits>,
}

#[derive(Debug, Deserialize)]
struct BotSubscription {
    active: bool,
    #[serde(default)]
    until: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BotLimits {
    #[serde(default)]
    analysis: Option<i64>,
    #[serde(default)]
    post_generation: Option<i64>,
}

/// Map one endpoint's raw payload into the canonical [`EntitlementStatus`].
///
/// The single place that knows each surface's field names and conventions:
/// boolean premium flag vs. nested subscription object, null vs. absent
/// expiry, and the sentinel "unlimited" counters.
///
/// # Errors
///
/// Returns [`NormalizeError`] when the payload carries an explicit error
/// field, is missing its premium indicator, or has negative counters. The
/// cascade treats any of these as a failed attempt.
pub fn normalize(
    payload: &JsonValue,
    endpoint: EndpointKind,
) -> Result<EntitlementStatus, NormalizeError> {
    // An error field in an otherwise-200 response is a failure, never a
    // valid Free status.
    if let Some(error) = payload.get("error").filter(|v| !v.is_null()) {
        let detail = error
            .as_str()
            .map_or_else(|| error.to_string(), str::to_owned);
        return Err(NormalizeError::BackendError(detail));
    }

    match endpoint {
        EndpointKind::Standard | EndpointKind::Direct => normalize_flat(payload),
        EndpointKind::BotParity => normalize_bot(payload),
    }
}

fn normalize_flat(payload: &JsonValue) -> Result<EntitlementStatus, NormalizeError> {
    let raw: FlatPayload = serde_json::from_value(payload.clone())?;
    let premium = raw
        .has_subscription
        .ok_or(NormalizeError::MissingField("has_subscription"))?;

    if premium {
        return Ok(EntitlementStatus::Premium {
            expires_at: parse_expiry(raw.subscription_end_date.as_deref()),
        });
    }
    Ok(EntitlementStatus::Free {
        analysis_remaining: quota(raw.analysis_count, "analysis_count")?,
        post_gen_remaining: quota(raw.post_generation_count, "post_generation_count")?,
    })
}

fn normalize_bot(payload: &JsonValue) -> Result<EntitlementStatus, NormalizeError> {
    let raw: BotPayload = serde_json::from_value(payload.clone())?;
    let subscription = raw
        .subscription
        .ok_or(NormalizeError::MissingField("subscription"))?;

    if subscription.active {
        return Ok(EntitlementStatus::Premium {
            expires_at: parse_expiry(subscription.until.as_deref()),
        });
    }
    let limits = raw.limits.unwrap_or_default();
    Ok(EntitlementStatus::Free {
        analysis_remaining: quota(limits.analysis, "limits.analysis")?,
        post_gen_remaining: quota(limits.post_generation, "limits.post_generation")?,
    })
}

/// Null, absent or unparsable expiry means "premium, end date unknown".
fn parse_expiry(raw: Option<&str>) -> Option<OffsetDateTime> {
    let raw = raw?;
    match OffsetDateTime::parse(raw, &Rfc3339) {
        Ok(ts) => Some(ts),
        Err(_) => {
            tracing::debug!(value = raw, "unparsable subscription end date");
            None
        }
    }
}

fn quota(raw: Option<i64>, field: &'static str) -> Result<Quota, NormalizeError> {
    match raw {
        None => Ok(Quota::Limited(0)),
        Some(n) if n < 0 => Err(NormalizeError::NegativeCounter(field)),
        Some(n) => Ok(Quota::from(u32::try_from(n).unwrap_or(u32::MAX))),
    }
}
