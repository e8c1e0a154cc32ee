//! End-to-end pipeline tests: submit → fetch → llm → notify → finalize,
//! including validator drops, retry-budget exhaustion, and versioned reruns.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{model_payload_with_finding, FakeFetcher, FakeModel, FakeProvider};
use revq_core::error::ErrorClass;
use revq_core::retry::{BackoffConfig, RetryPolicy, Stage};
use revq_daemon::dispatch::JobStatus;
use revq_daemon::failure::{DeadLetterFilter, DeadLetterStatus, FailurePipeline, RestartMode};
use revq_daemon::outbox::{Outbox, OutboxStatus};
use revq_daemon::queue::{WorkQueue, WorkStatus};
use revq_daemon::service::{RerunOutcome, ReviewService};
use revq_daemon::worker::{Worker, WorkerConfig, WorkerTick};
use revq_daemon::Store;

/// Retry policy with zero backoff so exhaustion tests run without sleeping.
fn immediate_retry() -> RetryPolicy {
    RetryPolicy {
        backoff: BackoffConfig {
            initial_delay: Duration::ZERO,
            ..BackoffConfig::default()
        },
        ..RetryPolicy::default()
    }
}

fn worker_with(
    store: &Store,
    fetcher: FakeFetcher,
    model: FakeModel,
    provider: FakeProvider,
) -> Worker {
    Worker::new(
        "worker-e2e",
        store,
        Box::new(fetcher),
        Box::new(model),
        Box::new(provider),
        WorkerConfig {
            retry: immediate_retry(),
            ..WorkerConfig::default()
        },
    )
}

#[test]
fn test_happy_path_ingest_to_notified_success() {
    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);

    let submitted = service
        .submit_review(
            "cl4242-v1",
            4242,
            1,
            &["reviewer@example.com".to_string()],
            5,
        )
        .unwrap();
    assert!(submitted.submission.created);
    let job_id = submitted.submission.job.job_id;

    let provider = Arc::new(FakeProvider::new());
    let worker = Worker::new(
        "worker-e2e",
        &store,
        Box::new(FakeFetcher::new(&["src/main.py"])),
        Box::new(FakeModel::returning(&model_payload_with_finding(
            "src/main.py",
        ))),
        Box::new(Arc::clone(&provider)),
        WorkerConfig {
            retry: immediate_retry(),
            ..WorkerConfig::default()
        },
    );
    let ticks = worker.run_until_idle().unwrap();
    assert_eq!(ticks.len(), 3, "fetch, llm, notify: {ticks:?}");
    assert!(ticks
        .iter()
        .all(|tick| matches!(tick, WorkerTick::Processed { .. })));

    let job = service.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let result_ref = job.result_ref.expect("validated result stored");
    let result: serde_json::Value = serde_json::from_str(&result_ref).unwrap();
    assert_eq!(result["findings"].as_array().unwrap().len(), 1);

    let outbox = Outbox::new(store.clone());
    assert!(outbox.pending_for_job(job_id).unwrap().is_empty());
    assert_eq!(outbox.permanent_failures_for_job(job_id).unwrap(), 0);
    assert_eq!(provider.send_count(), 1);
    assert_eq!(provider.delivered_tokens(), 1);
}

#[test]
fn test_duplicate_submission_creates_exactly_one_job() {
    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);

    let first = service
        .submit_review("key-A", 42, 1, &["a@example.com".to_string()], 0)
        .unwrap();
    let second = service
        .submit_review("key-A", 42, 1, &["a@example.com".to_string()], 0)
        .unwrap();

    assert!(first.submission.created);
    assert!(!second.submission.created);
    assert_eq!(second.submission.job.job_id, first.submission.job.job_id);
    assert!(second.work_id.is_none());
}

#[test]
fn test_validator_drops_do_not_fail_the_job() {
    // Three findings: one good, one invalid enum, one outside the changelist.
    let payload = r#"{
        "schema_version": "1.0",
        "prompt_version": "1.0.0",
        "findings": [
            {"id":"f-1","severity":"high","category":"correctness",
             "title":"ok","file":"src/a.py","line":5,"message":"m"},
            {"id":"f-2","severity":"urgent","category":"correctness",
             "title":"bad","file":"src/a.py","line":6,"message":"m"},
            {"id":"f-3","severity":"low","category":"style",
             "title":"gone","file":"src/missing.py","line":7,"message":"m"}
        ]
    }"#;

    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);
    let submitted = service
        .submit_review("cl1-v1", 1, 1, &["r@example.com".to_string()], 0)
        .unwrap();
    let job_id = submitted.submission.job.job_id;

    let provider = FakeProvider::new();
    let worker = worker_with(
        &store,
        FakeFetcher::new(&["src/a.py"]),
        FakeModel::returning(payload),
        provider,
    );
    worker.run_until_idle().unwrap();

    let job = service.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    let result: serde_json::Value = serde_json::from_str(&job.result_ref.unwrap()).unwrap();
    let findings = result["findings"].as_array().unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0]["id"], "f-1");
}

#[test]
fn test_rejected_response_dead_letters_without_retry() {
    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);
    let submitted = service
        .submit_review("cl2-v1", 2, 1, &["r@example.com".to_string()], 0)
        .unwrap();
    let job_id = submitted.submission.job.job_id;

    let model = FakeModel::returning("this is not json");
    let worker = worker_with(&store, FakeFetcher::new(&["src/a.py"]), model, FakeProvider::new());
    worker.run_until_idle().unwrap();

    assert_eq!(service.get_job(job_id).unwrap().status, JobStatus::Failed);

    let letters = service
        .list_dead_letters(&DeadLetterFilter {
            job_id: Some(job_id),
            ..DeadLetterFilter::default()
        })
        .unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].error_class, ErrorClass::InvalidJson);
    assert_eq!(letters[0].stage, Stage::Llm);
    // Non-retryable: a single model call, no retries burned.
    assert_eq!(letters[0].attempt_count, 1);
}

#[test]
fn test_llm_retry_budget_exhaustion_dead_letters_at_five_attempts() {
    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);
    let submitted = service
        .submit_review("cl3-v1", 3, 1, &["r@example.com".to_string()], 0)
        .unwrap();
    let job_id = submitted.submission.job.job_id;

    let model = Arc::new(FakeModel::failing_with(ErrorClass::Upstream5xx, "upstream 502"));
    let worker = Worker::new(
        "worker-e2e",
        &store,
        Box::new(FakeFetcher::new(&["src/a.py"])),
        Box::new(Arc::clone(&model)),
        Box::new(FakeProvider::new()),
        WorkerConfig {
            retry: immediate_retry(),
            ..WorkerConfig::default()
        },
    );
    worker.run_until_idle().unwrap();

    let job = service.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    // Budget is inclusive of the first attempt: exactly five model calls.
    assert_eq!(model.call_count(), 5);

    let letters = service
        .list_dead_letters(&DeadLetterFilter {
            job_id: Some(job_id),
            ..DeadLetterFilter::default()
        })
        .unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].error_class, ErrorClass::Upstream5xx);
    assert_eq!(letters[0].stage, Stage::Llm);
    assert_eq!(letters[0].attempt_count, 5);

    // The fetch stage completed on its first attempt; its budget is intact
    // and its work is preserved.
    let queue = WorkQueue::new(store.clone());
    let fetch_item = queue.get(submitted.work_id.unwrap()).unwrap();
    assert_eq!(fetch_item.status, WorkStatus::Completed);
    assert_eq!(fetch_item.attempt_count, 1);
}

#[test]
fn test_notify_failures_retry_then_succeed_with_single_delivery() {
    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);
    let submitted = service
        .submit_review("cl6-v1", 6, 1, &["r@example.com".to_string()], 0)
        .unwrap();
    let job_id = submitted.submission.job.job_id;

    let provider = Arc::new(FakeProvider::new());
    provider.fail_next_sends(vec![
        revq_core::provider::ProviderError::new(ErrorClass::Upstream5xx, "provider 500"),
        revq_core::provider::ProviderError::new(ErrorClass::Upstream5xx, "provider 500"),
    ]);
    let worker = Worker::new(
        "worker-e2e",
        &store,
        Box::new(FakeFetcher::new(&["src/a.py"])),
        Box::new(FakeModel::returning(&model_payload_with_finding(
            "src/a.py",
        ))),
        Box::new(Arc::clone(&provider)),
        WorkerConfig {
            retry: immediate_retry(),
            ..WorkerConfig::default()
        },
    );
    worker.run_until_idle().unwrap();

    let job = service.get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);

    let outbox = Outbox::new(store.clone());
    assert!(outbox.pending_for_job(job_id).unwrap().is_empty());
    // Two refused attempts, one accepted send, one delivery.
    assert_eq!(provider.send_count(), 1);
    assert_eq!(provider.delivered_tokens(), 1);
}

#[test]
fn test_permanent_recipient_failure_blocks_success_and_replays_after_fix() {
    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);
    let submitted = service
        .submit_review("cl8-v1", 8, 1, &["bad@example.com".to_string()], 0)
        .unwrap();
    let job_id = submitted.submission.job.job_id;

    let provider = FakeProvider::new();
    provider.fail_next_sends(vec![revq_core::provider::ProviderError::new(
        ErrorClass::ContentPolicyReject,
        "recipient blocked",
    )]);
    let worker = worker_with(
        &store,
        FakeFetcher::new(&["src/a.py"]),
        FakeModel::returning(&model_payload_with_finding("src/a.py")),
        provider,
    );
    worker.run_until_idle().unwrap();

    assert_eq!(service.get_job(job_id).unwrap().status, JobStatus::Failed);
    let letters = service
        .list_dead_letters(&DeadLetterFilter {
            job_id: Some(job_id),
            ..DeadLetterFilter::default()
        })
        .unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].stage, Stage::Notify);
    assert_eq!(letters[0].status, DeadLetterStatus::Open);

    // Operator resolves the recipient and replays the notify stage.
    let outbox = Outbox::new(store.clone());
    let failed_rows = {
        let store = store.clone();
        store
            .with_conn(|conn| {
                Ok(conn.execute(
                    "UPDATE outbox SET status = 'pending' WHERE job_id = ?1",
                    rusqlite::params![job_id],
                )?)
            })
            .unwrap()
    };
    assert_eq!(failed_rows, 1);

    service
        .replay(
            letters[0].dl_id,
            RestartMode::ResumeAtFailedStage,
            "recipient policy exception filed: INC-42",
        )
        .unwrap();
    worker.run_until_idle().unwrap();

    assert_eq!(service.get_job(job_id).unwrap().status, JobStatus::Succeeded);
    let entry = &outbox.pending_for_job(job_id).unwrap();
    assert!(entry.is_empty());
    let resolved = service
        .list_dead_letters(&DeadLetterFilter {
            job_id: Some(job_id),
            ..DeadLetterFilter::default()
        })
        .unwrap();
    assert_eq!(resolved[0].status, DeadLetterStatus::Resolved);
}

#[test]
fn test_versioned_rerun_creates_disjoint_outbox_keys() {
    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);
    let recipients = vec!["alice@example.com".to_string()];

    let v3 = service
        .submit_review("cl9-v3", 9, 3, &recipients, 0)
        .unwrap();
    let provider_v3 = FakeProvider::new();
    let worker = worker_with(
        &store,
        FakeFetcher::new(&["src/a.py"]),
        FakeModel::returning(&model_payload_with_finding("src/a.py")),
        provider_v3,
    );
    worker.run_until_idle().unwrap();
    assert_eq!(
        service.get_job(v3.submission.job.job_id).unwrap().status,
        JobStatus::Succeeded
    );

    // Same version: prior job, no new work.
    let same = service
        .request_rerun("cl9-v3-again", 9, 3, &recipients, 0)
        .unwrap();
    assert!(matches!(same, RerunOutcome::PriorJob(ref job) if job.job_id == v3.submission.job.job_id));

    // Stale version: blocked.
    let stale = service
        .request_rerun("cl9-v1", 9, 1, &recipients, 0)
        .unwrap();
    assert!(matches!(
        stale,
        RerunOutcome::Blocked {
            reason: "stale_review_version",
            ..
        }
    ));

    // Greater version: new job with independent outbox keys.
    let v4 = service
        .request_rerun("cl9-v4", 9, 4, &recipients, 0)
        .unwrap();
    let RerunOutcome::Allowed { job: v4_job, .. } = v4 else {
        panic!("expected Allowed");
    };
    assert_ne!(v4_job.job_id, v3.submission.job.job_id);

    worker.run_until_idle().unwrap();
    assert_eq!(service.get_job(v4_job.job_id).unwrap().status, JobStatus::Succeeded);

    // Rows for v3 and v4 exist independently, both delivered.
    let tokens: Vec<(i64, String, OutboxStatus)> = store
        .with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT review_version, idempotency_token, status FROM outbox
                 WHERE changelist_id = 9 ORDER BY review_version",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let status: String = row.get(2)?;
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        match status.as_str() {
                            "sent" => OutboxStatus::Sent,
                            "failed_permanent" => OutboxStatus::FailedPermanent,
                            _ => OutboxStatus::Pending,
                        },
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .unwrap();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].0, 3);
    assert_eq!(tokens[1].0, 4);
    assert_ne!(tokens[0].1, tokens[1].1, "outbox keys are disjoint");
    assert!(tokens.iter().all(|(_, _, status)| *status == OutboxStatus::Sent));
}

#[test]
fn test_replaying_dead_letter_reopens_on_same_class() {
    let store = Store::in_memory().unwrap();
    let service = ReviewService::new(&store);
    let submitted = service
        .submit_review("cl10-v1", 10, 1, &["r@example.com".to_string()], 0)
        .unwrap();
    let job_id = submitted.submission.job.job_id;

    // The model returns a content-policy rejection, permanently.
    let model = FakeModel::failing_with(ErrorClass::ContentPolicyReject, "policy block");
    let worker = worker_with(&store, FakeFetcher::new(&["src/a.py"]), model, FakeProvider::new());
    worker.run_until_idle().unwrap();

    let failure = FailurePipeline::new(store.clone());
    let letters = failure
        .list_dead_letters(&DeadLetterFilter {
            job_id: Some(job_id),
            ..DeadLetterFilter::default()
        })
        .unwrap();
    assert_eq!(letters.len(), 1);

    failure
        .replay(
            letters[0].dl_id,
            RestartMode::ResumeAtFailedStage,
            "policy exemption requested",
        )
        .unwrap();
    worker.run_until_idle().unwrap();

    let reopened = failure.get_dead_letter(letters[0].dl_id).unwrap();
    assert_eq!(reopened.status, DeadLetterStatus::Reopened);
    assert_eq!(reopened.error_class, ErrorClass::ContentPolicyReject);
}
