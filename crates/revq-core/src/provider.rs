//! Consumed external interfaces: fetcher, model client, notification
//! provider.
//!
//! The pipeline core never talks to Perforce, the review model, or the
//! notification service directly; it consumes these traits. Implementations
//! are expected to enforce their own contracts (allow-list checks in the
//! fetcher, argumentized subprocess execution, redaction before model
//! submission) and to classify failures with an [`ErrorClass`].
//!
//! Every call carries an explicit deadline; implementations must not block
//! past it. Deadline expiry is classified as `NETWORK_TIMEOUT`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ErrorClass;

/// A classified failure from an external collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{class}: {message}")]
pub struct ProviderError {
    /// Stable failure classification.
    pub class: ErrorClass,
    /// Human-readable detail. Redacted by the caller before persistence.
    pub message: String,
    /// Upstream `Retry-After` hint, if one was returned.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    /// Creates an error with no retry hint.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches an upstream `Retry-After` hint.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// One changed file plus its unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    /// Repo-relative path of the changed file.
    pub file: String,
    /// Unified diff content.
    pub diff: String,
}

/// A changelist expanded into changed files and diffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// The changelist this was expanded from.
    pub changelist_id: i64,
    /// Changed file paths, allow-list enforced by the fetcher.
    pub changed_files: Vec<String>,
    /// Per-file diffs.
    pub diffs: Vec<FileDiff>,
}

/// Expands a changelist into changed files and diffs.
///
/// Contract (enforced by implementations, not by the core): the allow-list
/// applies at both the listing and per-file stages, and any subprocess runs
/// with an argumentized invocation, a fixed executable path, and an explicit
/// timeout. No shell interpretation.
pub trait ChangeFetcher {
    /// Fetches the changelist, bounded by `deadline`.
    fn fetch(
        &self,
        changelist_id: i64,
        allow_list: &[String],
        deadline: Duration,
    ) -> Result<ChangeSet, ProviderError>;
}

impl<T: ChangeFetcher + ?Sized> ChangeFetcher for Arc<T> {
    fn fetch(
        &self,
        changelist_id: i64,
        allow_list: &[String],
        deadline: Duration,
    ) -> Result<ChangeSet, ProviderError> {
        self.as_ref().fetch(changelist_id, allow_list, deadline)
    }
}

/// Submits a diff to the review model and returns the raw response payload.
///
/// Content submitted through this interface must already have passed the
/// redaction pipeline.
pub trait ReviewModelClient {
    /// Runs a review, bounded by `deadline`. The returned bytes are
    /// unvalidated; hand them to [`crate::validator::ResultValidator`].
    fn review(&self, prompt: &str, diff: &str, deadline: Duration)
        -> Result<Vec<u8>, ProviderError>;
}

impl<T: ReviewModelClient + ?Sized> ReviewModelClient for Arc<T> {
    fn review(
        &self,
        prompt: &str,
        diff: &str,
        deadline: Duration,
    ) -> Result<Vec<u8>, ProviderError> {
        self.as_ref().review(prompt, diff, deadline)
    }
}

/// Result of a provider-side delivery lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryLookup {
    /// The provider has accepted a send for this token.
    Delivered {
        /// Provider message id of the accepted send.
        message_id: String,
    },
    /// The provider has no record of this token.
    NotFound,
}

/// Sends notifications and answers idempotency-token lookups.
///
/// A compliant provider treats `idempotency_token` as the identity of the
/// send: replaying the same token yields the same message id rather than a
/// second delivery. `lookup` is required for crash reconciliation.
pub trait NotificationProvider {
    /// Sends `payload`, bounded by `deadline`. Returns the provider message
    /// id.
    fn send(
        &self,
        recipient: &str,
        payload: &str,
        idempotency_token: &str,
        deadline: Duration,
    ) -> Result<String, ProviderError>;

    /// Looks up whether a send with this token was already accepted.
    fn lookup(&self, idempotency_token: &str) -> Result<DeliveryLookup, ProviderError>;
}

impl<T: NotificationProvider + ?Sized> NotificationProvider for Arc<T> {
    fn send(
        &self,
        recipient: &str,
        payload: &str,
        idempotency_token: &str,
        deadline: Duration,
    ) -> Result<String, ProviderError> {
        self.as_ref()
            .send(recipient, payload, idempotency_token, deadline)
    }

    fn lookup(&self, idempotency_token: &str) -> Result<DeliveryLookup, ProviderError> {
        self.as_ref().lookup(idempotency_token)
    }
}

/// Deterministic provider idempotency token for an outbox key.
///
/// SHA-256 over `changelist_id:recipient:review_version`, hex-encoded. The
/// token is derived from the outbox key, so replaying a delivery always
/// presents the same token to the provider.
#[must_use]
pub fn notification_token(changelist_id: i64, recipient: &str, review_version: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{changelist_id}:{recipient}:{review_version}").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_token_is_deterministic_per_tuple() {
        let a = notification_token(123, "r@example.com", 4);
        let b = notification_token(123, "r@example.com", 4);
        let c = notification_token(124, "r@example.com", 4);
        let d = notification_token(123, "r@example.com", 5);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_provider_error_carries_retry_hint() {
        let err = ProviderError::new(ErrorClass::RateLimited, "quota exceeded")
            .with_retry_after(Duration::from_secs(30));
        assert_eq!(err.class, ErrorClass::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(30)));
        assert_eq!(err.to_string(), "RATE_LIMITED: quota exceeded");
    }
}
