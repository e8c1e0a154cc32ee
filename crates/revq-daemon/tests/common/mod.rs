//! Shared fakes for integration tests: a canned fetcher, a scripted model
//! client, and an idempotency-honoring notification provider.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use revq_core::error::ErrorClass;
use revq_core::provider::{
    ChangeFetcher, ChangeSet, DeliveryLookup, FileDiff, NotificationProvider, ProviderError,
    ReviewModelClient,
};

/// Fetcher returning a fixed changed-file list.
pub struct FakeFetcher {
    pub changed_files: Vec<String>,
    pub fail_with: Mutex<Option<ProviderError>>,
}

impl FakeFetcher {
    pub fn new(changed_files: &[&str]) -> Self {
        Self {
            changed_files: changed_files.iter().map(|f| (*f).to_string()).collect(),
            fail_with: Mutex::new(None),
        }
    }
}

impl ChangeFetcher for FakeFetcher {
    fn fetch(
        &self,
        changelist_id: i64,
        _allow_list: &[String],
        _deadline: Duration,
    ) -> Result<ChangeSet, ProviderError> {
        if let Some(err) = self.fail_with.lock().unwrap().take() {
            return Err(err);
        }
        Ok(ChangeSet {
            changelist_id,
            changed_files: self.changed_files.clone(),
            diffs: self
                .changed_files
                .iter()
                .map(|file| FileDiff {
                    file: file.clone(),
                    diff: format!("--- a/{file}\n+++ b/{file}\n@@ -1 +1 @@\n-old\n+new\n"),
                })
                .collect(),
        })
    }
}

/// Model client replaying a queue of scripted responses. When the script is
/// exhausted the last entry repeats.
pub struct FakeModel {
    responses: Mutex<Vec<Result<Vec<u8>, ProviderError>>>,
    pub calls: Mutex<u32>,
}

impl FakeModel {
    pub fn returning(payload: &str) -> Self {
        Self {
            responses: Mutex::new(vec![Ok(payload.as_bytes().to_vec())]),
            calls: Mutex::new(0),
        }
    }

    pub fn scripted(responses: Vec<Result<Vec<u8>, ProviderError>>) -> Self {
        assert!(!responses.is_empty());
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(0),
        }
    }

    pub fn failing_with(class: ErrorClass, message: &str) -> Self {
        Self::scripted(vec![Err(ProviderError::new(class, message))])
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl ReviewModelClient for FakeModel {
    fn review(
        &self,
        _prompt: &str,
        _diff: &str,
        _deadline: Duration,
    ) -> Result<Vec<u8>, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses[0].clone()
        }
    }
}

/// Provider honoring idempotency tokens: a replayed token yields the
/// original message id without a second delivery.
#[derive(Default)]
pub struct FakeProvider {
    pub sent_by_token: Mutex<HashMap<String, String>>,
    pub send_calls: Mutex<Vec<String>>,
    pub fail_sends: Mutex<Vec<ProviderError>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_count(&self) -> usize {
        self.send_calls.lock().unwrap().len()
    }

    /// Distinct tokens that resulted in an accepted send.
    pub fn delivered_tokens(&self) -> usize {
        self.sent_by_token.lock().unwrap().len()
    }

    pub fn fail_next_sends(&self, errors: Vec<ProviderError>) {
        *self.fail_sends.lock().unwrap() = errors;
    }
}

impl NotificationProvider for FakeProvider {
    fn send(
        &self,
        _recipient: &str,
        _payload: &str,
        idempotency_token: &str,
        _deadline: Duration,
    ) -> Result<String, ProviderError> {
        {
            let mut failures = self.fail_sends.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        self.send_calls
            .lock()
            .unwrap()
            .push(idempotency_token.to_string());
        let mut sent = self.sent_by_token.lock().unwrap();
        if let Some(existing) = sent.get(idempotency_token) {
            return Ok(existing.clone());
        }
        let message_id = format!("msg-{}", sent.len() + 1);
        sent.insert(idempotency_token.to_string(), message_id.clone());
        Ok(message_id)
    }

    fn lookup(&self, idempotency_token: &str) -> Result<DeliveryLookup, ProviderError> {
        match self.sent_by_token.lock().unwrap().get(idempotency_token) {
            Some(message_id) => Ok(DeliveryLookup::Delivered {
                message_id: message_id.clone(),
            }),
            None => Ok(DeliveryLookup::NotFound),
        }
    }
}

/// A minimal well-formed model payload with one finding against `file`.
pub fn model_payload_with_finding(file: &str) -> String {
    format!(
        r#"{{
            "schema_version": "1.0",
            "prompt_version": "1.0.0",
            "summary": "1 finding",
            "findings": [{{
                "id": "f-1",
                "severity": "high",
                "category": "correctness",
                "title": "Incorrect branch condition",
                "file": "{file}",
                "line": 12,
                "message": "Condition can never be true."
            }}]
        }}"#
    )
}
