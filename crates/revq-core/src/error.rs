//! Failure classification for the review pipeline.
//!
//! Every failure that crosses a stage boundary is tagged with an
//! [`ErrorClass`]. The class identifier is the wire-stable identity of the
//! failure: it drives retry policy, dead-letter triage, and replay guards.
//! Adding a class is a schema-evolution event.
//!
//! | Class | Retryable | Source |
//! |-------|-----------|--------|
//! | `NETWORK_TIMEOUT`, `UPSTREAM_5XX`, `TCP_RESET` | yes | transport |
//! | `RATE_LIMITED` | yes | upstream quota |
//! | `UPSTREAM_INTERNAL` | yes | provider 5xx / model internal |
//! | `CONFLICT` | yes | optimistic-lock or duplicate race |
//! | `SCHEMA_INVALID`, `MISSING_FIELD`, `INVALID_JSON` | no | validator |
//! | `AUTH_DENIED`, `PERMISSION_DENIED` | no | credentials / policy |
//! | `NOT_FOUND_PERMANENT` | no | upstream 404 for an immutable ref |
//! | `CONTENT_POLICY_REJECT` | no | policy block |
//! | `INVARIANT_VIOLATION` | no | internal bug |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error raised when parsing an unknown error-class label.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown error class: {value}")]
pub struct UnknownErrorClass {
    /// The label that failed to parse.
    pub value: String,
}

/// Wire-stable failure classification.
///
/// The serialized form is the SCREAMING_SNAKE_CASE label; [`as_str`] and
/// [`parse`] round-trip it. Retryability is a property of the class, not of
/// the call site.
///
/// [`as_str`]: ErrorClass::as_str
/// [`parse`]: ErrorClass::parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorClass {
    /// An external call exceeded its deadline.
    NetworkTimeout,
    /// The upstream returned a 5xx status.
    #[serde(rename = "UPSTREAM_5XX")]
    Upstream5xx,
    /// The transport connection was reset.
    TcpReset,
    /// The upstream rejected the call on quota grounds.
    RateLimited,
    /// The provider or model reported an internal failure.
    UpstreamInternal,
    /// An optimistic-lock or duplicate-insert race was observed.
    Conflict,
    /// The model response violated the output contract.
    SchemaInvalid,
    /// A required field was absent from the model response.
    MissingField,
    /// The model response was not parseable JSON.
    InvalidJson,
    /// Authentication was rejected.
    AuthDenied,
    /// The caller lacks permission for the referenced resource.
    PermissionDenied,
    /// The upstream reported a permanent 404 for an immutable reference.
    NotFoundPermanent,
    /// The payload was blocked by content policy.
    ContentPolicyReject,
    /// An internal invariant was violated. Always a bug.
    InvariantViolation,
}

impl ErrorClass {
    /// Whether failures of this class consume retry budget and reschedule,
    /// as opposed to dead-lettering immediately.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkTimeout
                | Self::Upstream5xx
                | Self::TcpReset
                | Self::RateLimited
                | Self::UpstreamInternal
                | Self::Conflict
        )
    }

    /// Returns the wire-stable label for this class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::Upstream5xx => "UPSTREAM_5XX",
            Self::TcpReset => "TCP_RESET",
            Self::RateLimited => "RATE_LIMITED",
            Self::UpstreamInternal => "UPSTREAM_INTERNAL",
            Self::Conflict => "CONFLICT",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::MissingField => "MISSING_FIELD",
            Self::InvalidJson => "INVALID_JSON",
            Self::AuthDenied => "AUTH_DENIED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotFoundPermanent => "NOT_FOUND_PERMANENT",
            Self::ContentPolicyReject => "CONTENT_POLICY_REJECT",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
        }
    }

    /// Parses a wire-stable label back into its class.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownErrorClass`] for labels outside the taxonomy, so a
    /// newer writer never silently downgrades into an older reader.
    pub fn parse(value: &str) -> Result<Self, UnknownErrorClass> {
        match value {
            "NETWORK_TIMEOUT" => Ok(Self::NetworkTimeout),
            "UPSTREAM_5XX" => Ok(Self::Upstream5xx),
            "TCP_RESET" => Ok(Self::TcpReset),
            "RATE_LIMITED" => Ok(Self::RateLimited),
            "UPSTREAM_INTERNAL" => Ok(Self::UpstreamInternal),
            "CONFLICT" => Ok(Self::Conflict),
            "SCHEMA_INVALID" => Ok(Self::SchemaInvalid),
            "MISSING_FIELD" => Ok(Self::MissingField),
            "INVALID_JSON" => Ok(Self::InvalidJson),
            "AUTH_DENIED" => Ok(Self::AuthDenied),
            "PERMISSION_DENIED" => Ok(Self::PermissionDenied),
            "NOT_FOUND_PERMANENT" => Ok(Self::NotFoundPermanent),
            "CONTENT_POLICY_REJECT" => Ok(Self::ContentPolicyReject),
            "INVARIANT_VIOLATION" => Ok(Self::InvariantViolation),
            other => Err(UnknownErrorClass {
                value: other.to_string(),
            }),
        }
    }

    /// All classes, in table order. Useful for exhaustive tests and
    /// dashboards.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::NetworkTimeout,
            Self::Upstream5xx,
            Self::TcpReset,
            Self::RateLimited,
            Self::UpstreamInternal,
            Self::Conflict,
            Self::SchemaInvalid,
            Self::MissingField,
            Self::InvalidJson,
            Self::AuthDenied,
            Self::PermissionDenied,
            Self::NotFoundPermanent,
            Self::ContentPolicyReject,
            Self::InvariantViolation,
        ]
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
